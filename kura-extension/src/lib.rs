//! Extension host: the per-request `Context`, the `Environment` contract,
//! a Rhai scripting environment with cooperative timeouts, and the
//! process-wide environment manager.

use thiserror::Error;

pub mod context;
pub mod environment;
pub mod globals;
pub mod host;
pub mod script;
pub mod service;

pub use context::Context;
pub use environment::{Environment, EnvironmentManager, HookOutcome, MultiEnvironment, NullEnvironment};
pub use globals::{GlobalMap, GlobalStore};
pub use host::{CallInterceptor, FsCap, Host, HostBuilder, Module, NetCap, TimeLimits};
pub use script::{EnvState, ScriptEnvironment};
pub use service::{query_from_map, Query, ResourceService};

#[derive(Debug, Error)]
pub enum ExtensionError {
    #[error("exceed timeout for extension execution for event: {0}")]
    Timeout(String),
    #[error("failed to compile extension {name}: {message}")]
    Compile { name: String, message: String },
    #[error("extension error in {event}: {message}")]
    Script { event: String, message: String },
    #[error("environment {0} is already registered")]
    Duplicate(String),
    #[error("cannot create nested transaction")]
    NestedTransaction,
    #[error("invalid context: {0}")]
    Context(String),
    #[error("extension runtime failure: {0}")]
    Runtime(String),
}
