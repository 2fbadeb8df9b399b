use rhai::Engine;
use tracing::{debug, error, info, warn};

pub(super) fn register(engine: &mut Engine) {
    engine
        .register_fn("log_debug", |module: &str, msg: &str| debug!(target: "extension", module, "{msg}"))
        .register_fn("log_info", |module: &str, msg: &str| info!(target: "extension", module, "{msg}"))
        .register_fn("log_warning", |module: &str, msg: &str| warn!(target: "extension", module, "{msg}"))
        .register_fn("log_error", |module: &str, msg: &str| error!(target: "extension", module, "{msg}"));
}
