//! Builtins registered into every script engine.

use std::sync::Arc;

use rhai::Engine;

use super::EnvState;

mod core;
mod crypto;
mod db;
mod exec;
mod fs;
mod logging;
mod model;
mod remote;
mod sync;

pub use self::core::exception;

pub(crate) fn register_all(engine: &mut Engine, state: &Arc<EnvState>) {
    self::core::register(engine, state);
    db::register(engine, state);
    model::register(engine, state);
    sync::register(engine, state);
    remote::register(engine, state);
    fs::register(engine, state);
    crypto::register(engine);
    exec::register(engine, state);
    logging::register(engine);
}
