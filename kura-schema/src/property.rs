use serde_json::{Map, Value};

use crate::SchemaError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PropertyType {
    String,
    Integer,
    Number,
    Boolean,
    Object,
    Array,
    Any,
}

impl PropertyType {
    pub fn parse(s: &str) -> Self {
        match s {
            "string" => PropertyType::String,
            "integer" => PropertyType::Integer,
            "number" => PropertyType::Number,
            "boolean" => PropertyType::Boolean,
            "object" => PropertyType::Object,
            "array" => PropertyType::Array,
            _ => PropertyType::Any,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PropertyType::String => "string",
            PropertyType::Integer => "integer",
            PropertyType::Number => "number",
            PropertyType::Boolean => "boolean",
            PropertyType::Object => "object",
            PropertyType::Array => "array",
            PropertyType::Any => "any",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Property {
    pub id: String,
    pub title: String,
    pub description: String,
    pub kind: PropertyType,
    pub format: String,
    pub nullable: bool,
    pub required: bool,
    pub unique: bool,
    pub indexed: bool,
    pub default: Option<Value>,
    pub relation: Option<String>,
    pub relation_property: Option<String>,
    pub sql_type: Option<String>,
    pub on_delete_cascade: bool,
    /// `None` when the declaration carries no `permission` list.
    pub permission: Option<Vec<String>>,
    pub properties: Map<String, Value>,
}

impl Property {
    pub fn new(id: impl Into<String>, kind: PropertyType) -> Self {
        let id = id.into();
        Self {
            title: id.clone(),
            id,
            description: String::new(),
            kind,
            format: String::new(),
            nullable: false,
            required: false,
            unique: false,
            indexed: false,
            default: None,
            relation: None,
            relation_property: None,
            sql_type: None,
            on_delete_cascade: false,
            permission: None,
            properties: Map::new(),
        }
    }

    /// Builds a property from its JSON-schema declaration. Optional
    /// properties without a default are nullable.
    pub fn from_value(id: &str, raw: &Value, required: bool) -> Result<Self, SchemaError> {
        let obj = raw
            .as_object()
            .ok_or_else(|| SchemaError::Invalid(format!("property {id} should be an object")))?;
        let mut nullable = false;
        let kind = match obj.get("type") {
            Some(Value::String(t)) => PropertyType::parse(t),
            Some(Value::Array(types)) => {
                let mut kind = PropertyType::Any;
                for t in types.iter().filter_map(Value::as_str) {
                    if t == "null" {
                        nullable = true;
                    } else {
                        kind = PropertyType::parse(t);
                    }
                }
                kind
            }
            _ => PropertyType::Any,
        };
        let default = obj.get("default").filter(|v| !v.is_null()).cloned();
        if !required && default.is_none() {
            nullable = true;
        }
        let string = |key: &str| obj.get(key).and_then(Value::as_str).map(str::to_string);
        let flag = |key: &str| obj.get(key).and_then(Value::as_bool).unwrap_or(false);
        Ok(Self {
            id: id.to_string(),
            title: string("title").unwrap_or_else(|| id.to_string()),
            description: string("description").unwrap_or_default(),
            kind,
            format: string("format").unwrap_or_default(),
            nullable,
            required,
            unique: flag("unique"),
            indexed: flag("indexed"),
            default,
            relation: string("relation").filter(|s| !s.is_empty()),
            relation_property: string("relation_property").filter(|s| !s.is_empty()),
            sql_type: string("sql").filter(|s| !s.is_empty()),
            on_delete_cascade: flag("on_delete_cascade"),
            permission: obj.get("permission").and_then(Value::as_array).map(|list| {
                list.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            }),
            properties: obj
                .get("properties")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default(),
        })
    }

    pub fn allows(&self, permission: &str) -> bool {
        match &self.permission {
            None => true,
            Some(list) => list.iter().any(|p| p == permission),
        }
    }

    pub fn is_json(&self) -> bool {
        matches!(self.kind, PropertyType::Object | PropertyType::Array)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn nullable_from_type_list() {
        let p = Property::from_value("name", &json!({"type": ["string", "null"]}), true).unwrap();
        assert_eq!(p.kind, PropertyType::String);
        assert!(p.nullable);
    }

    #[test]
    fn optional_without_default_is_nullable() {
        let p = Property::from_value("size", &json!({"type": "integer"}), false).unwrap();
        assert!(p.nullable);
        let p = Property::from_value("size", &json!({"type": "integer", "default": 3}), false).unwrap();
        assert!(!p.nullable);
        assert_eq!(p.default, Some(json!(3)));
    }

    #[test]
    fn relation_and_permission() {
        let p = Property::from_value(
            "network_id",
            &json!({
                "type": "string",
                "relation": "network",
                "relation_property": "network",
                "on_delete_cascade": true,
                "permission": ["create"]
            }),
            true,
        )
        .unwrap();
        assert_eq!(p.relation.as_deref(), Some("network"));
        assert_eq!(p.relation_property.as_deref(), Some("network"));
        assert!(p.on_delete_cascade);
        assert!(p.allows("create"));
        assert!(!p.allows("update"));
    }
}
