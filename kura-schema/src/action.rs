use serde_json::{Map, Value};

/// Custom operation bound to a schema.
#[derive(Clone, Debug, PartialEq)]
pub struct Action {
    pub id: String,
    pub method: String,
    pub path: String,
    pub description: String,
    pub input_schema: Option<Value>,
    pub output_schema: Option<Value>,
    pub parameters: Map<String, Value>,
    pub response_ownership: bool,
}

impl Action {
    pub fn from_value(id: &str, raw: &Value) -> Self {
        let get = |key: &str| raw.get(key).and_then(Value::as_str).unwrap_or_default().to_string();
        let schema = |key: &str| raw.get(key).filter(|v| v.is_object()).cloned();
        Self {
            id: id.to_string(),
            method: get("method"),
            path: get("path"),
            description: get("description"),
            input_schema: schema("input"),
            output_schema: schema("output"),
            parameters: raw
                .get("parameters")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default(),
            response_ownership: raw
                .get("response_ownership")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        }
    }

    /// Actions addressed at one resource carry `:id` in their path.
    pub fn targets_single_resource(&self) -> bool {
        self.path.contains(":id")
    }
}
