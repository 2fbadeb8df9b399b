//! Resource type registry: schemas, properties, actions, access policies
//! and the authorization value they are matched against.

pub mod action;
pub mod auth;
pub mod extension;
pub mod manager;
pub mod policy;
pub mod property;
pub mod schema;

use thiserror::Error;

pub use action::Action;
pub use auth::{Authorization, Domain, Role, Scope, Tenant, ADMIN_ROLE};
pub use extension::Extension;
pub use manager::Manager;
pub use policy::{policy_validate, Policy, PropertiesFilter, ResourceCondition};
pub use property::{Property, PropertyType};
pub use schema::{parent_property_id, LockPolicy, Schema};

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("invalid schema: {0}")]
    Invalid(String),
    #[error("invalid policy: {0}")]
    InvalidPolicy(String),
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Denied(String),
    #[error("failed to load {path}: {message}")]
    Load { path: String, message: String },
    #[error(transparent)]
    Regex(#[from] regex::Error),
}
