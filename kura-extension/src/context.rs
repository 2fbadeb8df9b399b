use std::fmt;
use std::sync::Arc;

use kura_db::TxHandle;
use kura_schema::{Authorization, Policy, Schema};
use kura_types::ExceptionInfo;
use serde_json::{Map, Value};

use crate::ExtensionError;

pub const RESPONSE: &str = "response";
pub const EXCEPTION: &str = "exception";
pub const EXCEPTION_MESSAGE: &str = "exception_message";
pub const RESPONSE_CODE: &str = "response_code";

/// Per-request state handed through the pipeline and to extensions.
///
/// The transaction, schema, policy and authorization are kept typed; every
/// other key lives in an open JSON map that hooks may read and rewrite.
#[derive(Clone, Default)]
pub struct Context {
    values: Map<String, Value>,
    transaction: Option<TxHandle>,
    schema: Option<Arc<Schema>>,
    policy: Option<Arc<Policy>>,
    auth: Option<Authorization>,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("values", &self.values)
            .field("transaction", &self.transaction.is_some())
            .field("schema", &self.schema.as_ref().map(|s| s.id.as_str()))
            .field("policy", &self.policy.as_ref().map(|p| p.id.as_str()))
            .finish()
    }
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context carrying `auth` plus the identity keys hooks expect.
    pub fn with_auth(auth: Authorization) -> Self {
        let mut ctx = Self::new();
        ctx.set_auth(auth);
        ctx
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.values.insert(key.into(), value);
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.values.remove(key)
    }

    pub fn values(&self) -> &Map<String, Value> {
        &self.values
    }

    pub(crate) fn replace_values(&mut self, values: Map<String, Value>) {
        self.values = values;
    }

    pub fn transaction(&self) -> Option<&TxHandle> {
        self.transaction.as_ref()
    }

    /// Fails when a transaction is already attached.
    pub fn set_transaction(&mut self, tx: TxHandle) -> Result<(), ExtensionError> {
        if self.transaction.is_some() {
            return Err(ExtensionError::NestedTransaction);
        }
        self.transaction = Some(tx);
        Ok(())
    }

    pub(crate) fn replace_transaction(&mut self, tx: TxHandle) {
        self.transaction = Some(tx);
    }

    pub fn take_transaction(&mut self) -> Option<TxHandle> {
        self.transaction.take()
    }

    pub fn schema(&self) -> Option<&Arc<Schema>> {
        self.schema.as_ref()
    }

    pub fn set_schema(&mut self, schema: Arc<Schema>) {
        self.values.insert("schema_id".into(), Value::String(schema.id.clone()));
        self.schema = Some(schema);
    }

    pub fn policy(&self) -> Option<&Arc<Policy>> {
        self.policy.as_ref()
    }

    /// Returns the policy previously in place.
    pub fn set_policy(&mut self, policy: Option<Arc<Policy>>) -> Option<Arc<Policy>> {
        std::mem::replace(&mut self.policy, policy)
    }

    pub fn auth(&self) -> Option<&Authorization> {
        self.auth.as_ref()
    }

    pub fn set_auth(&mut self, auth: Authorization) {
        self.values.insert("tenant_id".into(), Value::String(auth.tenant_id().to_string()));
        self.values.insert("tenant_name".into(), Value::String(auth.tenant_name().to_string()));
        self.values.insert("domain_id".into(), Value::String(auth.domain_id().to_string()));
        self.values.insert("auth_token".into(), Value::String(auth.auth_token.clone()));
        self.values.insert("catalog".into(), auth.catalog.clone());
        self.auth = Some(auth);
    }

    pub fn response(&self) -> Option<&Value> {
        self.values.get(RESPONSE).filter(|v| !v.is_null())
    }

    pub fn set_response(&mut self, response: Value) {
        self.values.insert(RESPONSE.into(), response);
    }

    pub fn take_response(&mut self) -> Option<Value> {
        self.values.remove(RESPONSE).filter(|v| !v.is_null())
    }

    pub fn exception(&self) -> Option<ExceptionInfo> {
        self.values.get(EXCEPTION).and_then(ExceptionInfo::from_value)
    }

    pub fn set_exception(&mut self, event: &str, info: &ExceptionInfo) {
        self.values.insert(EXCEPTION.into(), info.to_value());
        self.values
            .insert(EXCEPTION_MESSAGE.into(), Value::String(format!("{event}: {info}")));
    }

    pub fn clear_exception(&mut self) {
        self.values.remove(EXCEPTION);
        self.values.remove(EXCEPTION_MESSAGE);
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn exception_round_trips_through_map() {
        let mut ctx = Context::new();
        ctx.set_exception("pre_create", &ExceptionInfo::custom("boom", 390));
        assert_eq!(ctx.get(EXCEPTION), Some(&json!({"name": "CustomException", "message": "boom", "code": 390})));
        assert_eq!(ctx.get(EXCEPTION_MESSAGE), Some(&json!("pre_create: CustomException(boom)")));
        assert_eq!(ctx.exception().unwrap().code, Some(390));
        ctx.clear_exception();
        assert!(ctx.exception().is_none());
    }

    #[test]
    fn auth_fills_identity_keys() {
        let ctx = Context::with_auth(Authorization::scoped_to_tenant("t1", "tenant"));
        assert_eq!(ctx.get("tenant_id"), Some(&json!("t1")));
        assert_eq!(ctx.get("domain_id"), Some(&json!("default")));
        assert!(ctx.response().is_none());
    }
}
