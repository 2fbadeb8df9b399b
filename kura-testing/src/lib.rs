//! Test harness for extension scripts: call mocks, a `testing` builtin
//! module and a runner for `test_*` functions.

use thiserror::Error;

pub mod mock;
pub mod module;
pub mod runner;

pub use mock::{MockRegistry, MOCKABLE};
pub use module::TestingModule;
pub use runner::{parse_directives, Report, TestOutcome, TestRunner};

#[derive(Debug, Error)]
pub enum TestError {
    #[error("cannot read {path}: {message}")]
    Io { path: String, message: String },
    #[error(transparent)]
    Schema(#[from] kura_schema::SchemaError),
    #[error(transparent)]
    Db(#[from] kura_db::DbError),
    #[error(transparent)]
    Extension(#[from] kura_extension::ExtensionError),
}
