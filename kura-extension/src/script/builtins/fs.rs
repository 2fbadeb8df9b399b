//! File builtins, confined to the host's sandbox directory.

use std::io;
use std::sync::Arc;

use cap_std::fs::Dir;
use rhai::{Dynamic, Engine, EvalAltResult, ImmutableString};

use crate::script::{runtime_error, EnvState};

type RhaiResult<T> = Result<T, Box<EvalAltResult>>;

fn with_root<T>(state: &EnvState, path: &str, f: impl FnOnce(&Dir) -> io::Result<T>) -> RhaiResult<T> {
    let fs = state
        .host
        .fs
        .as_ref()
        .ok_or_else(|| runtime_error("file access is not enabled"))?;
    f(&fs.root).map_err(|e| runtime_error(format!("{path}: {e}")))
}

pub(super) fn register(engine: &mut Engine, state: &Arc<EnvState>) {
    let st = state.clone();
    engine.register_fn("read_file", move |path: &str| -> RhaiResult<String> {
        with_root(&st, path, |root| root.read_to_string(path))
    });

    let st = state.clone();
    engine.register_fn("write_file", move |path: &str, content: &str| -> RhaiResult<()> {
        with_root(&st, path, |root| root.write(path, content))
    });

    let st = state.clone();
    engine.register_fn("file_exists", move |path: &str| -> RhaiResult<bool> {
        with_root(&st, path, |root| Ok(root.exists(path)))
    });

    let st = state.clone();
    engine.register_fn("read_dir", move |path: &str| -> RhaiResult<rhai::Array> {
        with_root(&st, path, |root| {
            let mut names = Vec::new();
            for entry in root.read_dir(path)? {
                names.push(entry?.file_name().to_string_lossy().into_owned());
            }
            names.sort();
            Ok(names
                .into_iter()
                .map(|n| Dynamic::from(ImmutableString::from(n)))
                .collect())
        })
    });

    let st = state.clone();
    engine.register_fn("make_dir", move |path: &str| -> RhaiResult<()> {
        with_root(&st, path, |root| root.create_dir_all(path))
    });
}
