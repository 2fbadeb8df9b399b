use std::sync::Arc;

use rhai::{Dynamic, Engine, EvalAltResult};
use serde_json::json;
use tokio::process::Command;
use tracing::debug;

use crate::script::convert::{to_dynamic, to_json};
use crate::script::{runtime_error, EnvState};

type RhaiResult<T> = Result<T, Box<EvalAltResult>>;

pub(super) fn register(engine: &mut Engine, state: &Arc<EnvState>) {
    let st = state.clone();
    engine.register_fn("exec", move |cmd: &str, args: rhai::Array| -> RhaiResult<Dynamic> {
        let call_args = [Dynamic::from(cmd.to_string()), Dynamic::from_array(args.clone())];
        if let Some(out) = st.intercept("exec", &call_args) {
            return out;
        }
        let args: Vec<String> = args
            .iter()
            .map(|a| match to_json(a) {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            })
            .collect();
        debug!(target: "extension", cmd, ?args, "exec");
        let output = st
            .block_on(Command::new(cmd).args(&args).kill_on_drop(true).output())?
            .map_err(|e| runtime_error(format!("exec {cmd}: {e}")))?;
        Ok(to_dynamic(&json!({
            "status": output.status.code().unwrap_or(-1),
            "stdout": String::from_utf8_lossy(&output.stdout),
            "stderr": String::from_utf8_lossy(&output.stderr),
        })))
    });
}
