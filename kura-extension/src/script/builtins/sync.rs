use std::sync::Arc;
use std::time::Duration;

use kura_sync::SyncClient;
use rhai::{Dynamic, Engine, EvalAltResult};
use serde_json::Value;

use crate::script::convert::{to_dynamic, to_json};
use crate::script::{runtime_error, EnvState};

type RhaiResult<T> = Result<T, Box<EvalAltResult>>;

fn sync_of(state: &EnvState) -> RhaiResult<Arc<dyn SyncClient>> {
    state
        .host
        .sync
        .clone()
        .ok_or_else(|| runtime_error("no sync backend is configured"))
}

/// Strings are stored verbatim; anything else as JSON text.
fn encode(value: &Dynamic) -> String {
    match to_json(value) {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

pub(super) fn register(engine: &mut Engine, state: &Arc<EnvState>) {
    let st = state.clone();
    engine.register_fn("sync_fetch", move |key: &str| -> RhaiResult<Dynamic> {
        if let Some(out) = st.intercept("sync_fetch", &[Dynamic::from(key.to_string())]) {
            return out;
        }
        let sync = sync_of(&st)?;
        let node = st
            .block_on(async { sync.fetch(key).await })?
            .map_err(|e| runtime_error(e.to_string()))?;
        Ok(to_dynamic(&node.to_value()))
    });

    let st = state.clone();
    engine.register_fn("sync_update", move |key: &str, value: Dynamic| -> RhaiResult<i64> {
        let sync = sync_of(&st)?;
        let value = encode(&value);
        st.block_on(async { sync.update(key, &value).await })?
            .map_err(|e| runtime_error(e.to_string()))
    });

    let st = state.clone();
    engine.register_fn("sync_delete", move |key: &str, prefix: bool| -> RhaiResult<()> {
        let sync = sync_of(&st)?;
        st.block_on(async { sync.delete(key, prefix).await })?
            .map_err(|e| runtime_error(e.to_string()))
    });

    let st = state.clone();
    engine.register_fn(
        "sync_watch",
        move |key: &str, timeout_ms: i64, revision: i64| -> RhaiResult<Dynamic> {
            let args = [
                Dynamic::from(key.to_string()),
                Dynamic::from_int(timeout_ms),
                Dynamic::from_int(revision),
            ];
            if let Some(out) = st.intercept("sync_watch", &args) {
                return out;
            }
            let sync = sync_of(&st)?;
            let timeout = Duration::from_millis(timeout_ms.max(0) as u64);
            let event = st
                .block_on(async { sync.watch(key, timeout, revision).await })?
                .map_err(|e| runtime_error(e.to_string()))?;
            Ok(match event {
                Some(event) => to_dynamic(&event.to_value()),
                None => Dynamic::from_map(rhai::Map::new()),
            })
        },
    );
}
