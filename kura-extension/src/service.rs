use std::collections::HashMap;

use async_trait::async_trait;
use kura_types::ResourceError;
use serde_json::{Map, Value};

use crate::Context;

/// Raw query parameters, one entry per key with every value supplied.
pub type Query = HashMap<String, Vec<String>>;

/// Resource operations scripts can chain into. A transaction already attached
/// to `ctx` is reused and left open.
#[async_trait]
pub trait ResourceService: Send + Sync {
    async fn list(&self, ctx: &mut Context, schema_id: &str, query: &Query) -> Result<(Vec<Value>, u64), ResourceError>;

    async fn show(&self, ctx: &mut Context, schema_id: &str, id: &str) -> Result<Value, ResourceError>;

    async fn create(&self, ctx: &mut Context, schema_id: &str, data: Map<String, Value>) -> Result<Value, ResourceError>;

    async fn update(
        &self,
        ctx: &mut Context,
        schema_id: &str,
        id: &str,
        data: Map<String, Value>,
    ) -> Result<Value, ResourceError>;

    async fn delete(&self, ctx: &mut Context, schema_id: &str, id: &str) -> Result<(), ResourceError>;

    async fn action(
        &self,
        ctx: &mut Context,
        schema_id: &str,
        action_id: &str,
        id: Option<&str>,
        input: Value,
    ) -> Result<Value, ResourceError>;
}

/// Turns a script-supplied filter map into query parameters.
pub fn query_from_map(map: &Map<String, Value>) -> Query {
    map.iter()
        .map(|(key, value)| {
            let values = match value {
                Value::Array(items) => items.iter().map(scalar_text).collect(),
                other => vec![scalar_text(other)],
            };
            (key.clone(), values)
        })
        .collect()
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn arrays_expand_to_repeated_values() {
        let map = json!({"name": ["a", "b"], "admin_state": true, "id": "x"});
        let query = query_from_map(map.as_object().unwrap());
        assert_eq!(query["name"], vec!["a", "b"]);
        assert_eq!(query["admin_state"], vec!["true"]);
        assert_eq!(query["id"], vec!["x"]);
    }
}
