use std::cmp::Ordering;
use std::collections::HashMap;

use serde_json::{json, Map, Value};

use crate::{Action, Property, PropertyType, SchemaError};

/// Row locking requested by a schema for a given event.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LockPolicy {
    LockRelatedResources,
    SkipRelatedResources,
    #[default]
    NoLocking,
}

impl LockPolicy {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "lock_related" => Some(LockPolicy::LockRelatedResources),
            "skip_related" => Some(LockPolicy::SkipRelatedResources),
            "" => Some(LockPolicy::NoLocking),
            _ => None,
        }
    }
}

/// Resource type definition. Immutable once registered.
#[derive(Clone, Debug)]
pub struct Schema {
    pub id: String,
    pub singular: String,
    pub plural: String,
    pub title: String,
    pub description: String,
    pub parent: Option<String>,
    pub on_parent_delete_cascade: bool,
    pub prefix: String,
    pub url: String,
    pub is_abstract: bool,
    pub extends: Vec<String>,
    pub metadata: Map<String, Value>,
    pub isolation_level: HashMap<String, String>,
    pub properties: Vec<Property>,
    pub actions: Vec<Action>,
    pub json_schema: Value,
    pub json_schema_on_create: Value,
    pub json_schema_on_update: Value,
    locking: HashMap<String, LockPolicy>,
}

pub fn parent_property_id(parent: &str) -> String {
    format!("{parent}_id")
}

impl Schema {
    pub fn from_value(raw: &Value) -> Result<Self, SchemaError> {
        let obj = raw
            .as_object()
            .ok_or_else(|| SchemaError::Invalid("schema should be an object".into()))?;
        let string = |key: &str| obj.get(key).and_then(Value::as_str).unwrap_or_default().to_string();
        let id = string("id");
        if id.is_empty() {
            return Err(SchemaError::Invalid("id is required".into()));
        }
        let plural = string("plural");
        if plural.is_empty() {
            return Err(SchemaError::Invalid(format!("plural is required for {id}")));
        }
        let json_schema = obj
            .get("schema")
            .filter(|v| v.is_object())
            .cloned()
            .ok_or_else(|| SchemaError::Invalid(format!("schema is required for {id}")))?;
        let metadata = obj
            .get("metadata")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();

        let mut locking = HashMap::new();
        if let Some(policies) = metadata.get("locking_policy").and_then(Value::as_object) {
            for (event, policy) in policies {
                let name = policy.as_str().unwrap_or_default();
                let parsed = LockPolicy::parse(name).ok_or_else(|| {
                    SchemaError::Invalid(format!(
                        "Unknown locking policy '{name}' for event {event} in schema {id}"
                    ))
                })?;
                locking.insert(event.clone(), parsed);
            }
        }

        let isolation_level = obj
            .get("isolation_level")
            .and_then(Value::as_object)
            .map(|m| {
                m.iter()
                    .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                    .collect()
            })
            .unwrap_or_default();

        let mut actions: Vec<Action> = obj
            .get("actions")
            .and_then(Value::as_object)
            .map(|m| m.iter().map(|(k, v)| Action::from_value(k, v)).collect())
            .unwrap_or_default();
        actions.sort_by(|a, b| a.id.cmp(&b.id));

        let mut schema = Schema {
            singular: Some(string("singular")).filter(|s| !s.is_empty()).unwrap_or_else(|| id.clone()),
            title: Some(string("title")).filter(|s| !s.is_empty()).unwrap_or_else(|| id.clone()),
            description: string("description"),
            parent: Some(string("parent")).filter(|s| !s.is_empty()),
            on_parent_delete_cascade: obj
                .get("on_parent_delete_cascade")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            prefix: string("prefix"),
            url: String::new(),
            is_abstract: string("type") == "abstract",
            extends: obj
                .get("extends")
                .and_then(Value::as_array)
                .map(|l| l.iter().filter_map(Value::as_str).map(str::to_string).collect())
                .unwrap_or_default(),
            metadata,
            isolation_level,
            properties: Vec::new(),
            actions,
            json_schema,
            json_schema_on_create: Value::Null,
            json_schema_on_update: Value::Null,
            locking,
            id,
            plural,
        };
        schema.url = schema.default_url();
        schema.init()?;
        Ok(schema)
    }

    fn default_url(&self) -> String {
        let prefix = self.prefix.trim_matches('/');
        if prefix.is_empty() {
            format!("/{}", self.plural)
        } else {
            format!("/{}/{}", prefix, self.plural)
        }
    }

    /// Rebuilds the property list and the permission-filtered validation
    /// schemas from `json_schema`.
    pub fn init(&mut self) -> Result<(), SchemaError> {
        if self.is_abstract {
            return Ok(());
        }
        let js = self
            .json_schema
            .as_object_mut()
            .ok_or_else(|| SchemaError::Invalid(format!("schema of {} should be an object", self.id)))?;
        let mut required = string_list(js.get("required"));
        let mut order = string_list(js.get("propertiesOrder"));
        let mut properties = js
            .get("properties")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();

        if !properties.contains_key("id") {
            properties.insert(
                "id".into(),
                json!({"type": "string", "title": "ID", "permission": ["create"], "format": "uuid"}),
            );
        }
        if let Some(parent) = &self.parent {
            let pid = parent_property_id(parent);
            if !properties.contains_key(&pid) {
                properties.insert(
                    pid.clone(),
                    json!({
                        "type": "string",
                        "relation": parent,
                        "title": parent,
                        "description": "parent object",
                        "unique": false,
                        "permission": ["create"],
                    }),
                );
                order.push(pid.clone());
                required.push(pid);
            }
        }

        let mut props = Vec::with_capacity(properties.len());
        for (pid, raw) in &properties {
            props.push(Property::from_value(pid, raw, required.contains(pid))?);
        }
        props.sort_by(|a, b| property_order(&order, a, b));
        for p in &props {
            if !order.contains(&p.id) {
                order.push(p.id.clone());
            }
        }

        js.insert("properties".into(), Value::Object(properties));
        js.insert("required".into(), json!(required));
        js.insert("propertiesOrder".into(), json!(order));
        if !js.contains_key("type") {
            js.insert("type".into(), json!("object"));
        }

        self.json_schema_on_create = filter_by_permission(&props, &required, "create");
        self.json_schema_on_update = filter_by_permission(&props, &required, "update");
        self.properties = props;
        Ok(())
    }

    /// Merges an abstract base schema into this one.
    pub fn extend(&mut self, base: &Schema) -> Result<(), SchemaError> {
        if self.parent.is_none() {
            self.parent = base.parent.clone();
        }
        if self.prefix.is_empty() && !base.prefix.is_empty() {
            self.prefix = base.prefix.clone();
            self.url = self.default_url();
        }
        let base_js = base.json_schema.as_object().cloned().unwrap_or_default();
        if let Some(js) = self.json_schema.as_object_mut() {
            let mut props = base_js
                .get("properties")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();
            if let Some(own) = js.get("properties").and_then(Value::as_object) {
                for (k, v) in own {
                    props.insert(k.clone(), v.clone());
                }
            }
            js.insert("properties".into(), Value::Object(props));
            for key in ["propertiesOrder", "required"] {
                let mut merged = string_list(base_js.get(key));
                for item in string_list(js.get(key)) {
                    if !merged.contains(&item) {
                        merged.push(item);
                    }
                }
                js.insert(key.into(), json!(merged));
            }
        }
        for action in &base.actions {
            if !self.actions.iter().any(|a| a.id == action.id) {
                self.actions.push(action.clone());
            }
        }
        for (k, v) in &base.metadata {
            self.metadata.entry(k.clone()).or_insert_with(|| v.clone());
        }
        for (k, v) in &base.isolation_level {
            self.isolation_level.entry(k.clone()).or_insert_with(|| v.clone());
        }
        for (k, v) in &base.locking {
            self.locking.entry(k.clone()).or_insert(*v);
        }
        self.init()
    }

    pub fn parent_property_id(&self) -> Option<String> {
        self.parent.as_deref().map(parent_property_id)
    }

    pub fn property(&self, id: &str) -> Option<&Property> {
        self.properties.iter().find(|p| p.id == id)
    }

    pub fn has_property(&self, id: &str) -> bool {
        self.property(id).is_some()
    }

    pub fn action(&self, id: &str) -> Option<&Action> {
        self.actions.iter().find(|a| a.id == id)
    }

    pub fn state_versioning(&self) -> bool {
        self.metadata
            .get("state_versioning")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn table_name(&self) -> &str {
        &self.plural
    }

    pub fn single_url(&self) -> String {
        format!("{}/:id", self.url)
    }

    pub fn lock_policy(&self, event: &str) -> LockPolicy {
        self.locking.get(event).copied().unwrap_or_default()
    }

    /// Declared isolation level name for an action, if any.
    pub fn isolation_level_for(&self, action: &str) -> Option<&str> {
        self.isolation_level.get(action).map(String::as_str)
    }

    /// Schemas this one points at through relations or `extends`.
    pub fn related_schemas(&self) -> Vec<String> {
        let mut out: Vec<String> = self
            .properties
            .iter()
            .filter_map(|p| p.relation.clone())
            .collect();
        for e in &self.extends {
            if !out.contains(e) {
                out.push(e.clone());
            }
        }
        out
    }

    pub fn validate(&self, json_schema: &Value, data: &Value) -> Result<(), SchemaError> {
        let validator = jsonschema::validator_for(json_schema)
            .map_err(|e| SchemaError::Invalid(format!("Invalid schema: {e}")))?;
        let errors: Vec<String> = validator
            .iter_errors(data)
            .map(|e| format!("{}: {}", e.instance_path, e))
            .collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(SchemaError::Validation(format!(
                "Json validation error:\n\t{}",
                errors.join(",\n\t")
            )))
        }
    }

    pub fn validate_on_create(&self, data: &Map<String, Value>) -> Result<(), SchemaError> {
        self.validate(&self.json_schema_on_create, &Value::Object(data.clone()))
    }

    pub fn validate_on_update(&self, data: &Map<String, Value>) -> Result<(), SchemaError> {
        self.validate(&self.json_schema_on_update, &Value::Object(data.clone()))
    }

    /// Fills absent keys from property defaults.
    pub fn populate_defaults(&self, data: &mut Map<String, Value>) {
        for p in &self.properties {
            if let Some(default) = &p.default {
                data.entry(p.id.clone()).or_insert_with(|| default.clone());
            }
        }
    }

    pub fn to_value(&self) -> Value {
        let actions: Map<String, Value> = self
            .actions
            .iter()
            .map(|a| {
                (
                    a.id.clone(),
                    json!({
                        "method": a.method,
                        "path": a.path,
                        "input": a.input_schema,
                        "output": a.output_schema,
                    }),
                )
            })
            .collect();
        json!({
            "id": self.id,
            "plural": self.plural,
            "singular": self.singular,
            "title": self.title,
            "description": self.description,
            "parent": self.parent.clone().unwrap_or_default(),
            "prefix": self.prefix,
            "url": self.url,
            "schema": self.json_schema,
            "actions": actions,
            "metadata": self.metadata,
        })
    }
}

fn string_list(v: Option<&Value>) -> Vec<String> {
    v.and_then(Value::as_array)
        .map(|l| l.iter().filter_map(Value::as_str).map(str::to_string).collect())
        .unwrap_or_default()
}

/// `propertiesOrder` first, then `id`, indexed, relations, then by name.
fn property_order(order: &[String], a: &Property, b: &Property) -> Ordering {
    let ia = order.iter().position(|o| *o == a.id);
    let ib = order.iter().position(|o| *o == b.id);
    match (ia, ib) {
        (Some(x), Some(y)) => return x.cmp(&y),
        (Some(_), None) => return Ordering::Less,
        (None, Some(_)) => return Ordering::Greater,
        (None, None) => {}
    }
    let rank = |p: &Property| (p.id != "id", !p.indexed, p.relation.is_none());
    rank(a).cmp(&rank(b)).then_with(|| a.id.cmp(&b.id))
}

fn filter_by_permission(props: &[Property], required: &[String], permission: &str) -> Value {
    let mut properties = Map::new();
    for p in props.iter().filter(|p| p.allows(permission)) {
        properties.insert(p.id.clone(), property_json_schema(p));
    }
    let required: Vec<&String> = if permission == "create" {
        required.iter().filter(|r| properties.contains_key(*r)).collect()
    } else {
        Vec::new()
    };
    json!({
        "type": "object",
        "properties": properties,
        "required": required,
        "additionalProperties": false,
    })
}

/// Validation schema for one property; nullable properties also accept null.
fn property_json_schema(p: &Property) -> Value {
    let mut schema = Map::new();
    if p.kind != PropertyType::Any {
        if p.nullable {
            schema.insert("type".into(), json!([p.kind.as_str(), "null"]));
        } else {
            schema.insert("type".into(), json!(p.kind.as_str()));
        }
    }
    if !p.properties.is_empty() {
        schema.insert("properties".into(), Value::Object(p.properties.clone()));
    }
    Value::Object(schema)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn network() -> Schema {
        Schema::from_value(&json!({
            "id": "network",
            "plural": "networks",
            "prefix": "/v2.0",
            "metadata": {"state_versioning": true, "locking_policy": {"update": "lock_related"}},
            "isolation_level": {"read": "READ COMMITTED"},
            "schema": {
                "properties": {
                    "id": {"type": "string", "permission": ["create"]},
                    "name": {"type": "string", "permission": ["create", "update"], "default": ""},
                    "tenant_id": {"type": "string", "permission": ["create"]},
                    "shared": {"type": "boolean", "permission": ["create", "update"], "default": false},
                },
                "required": ["tenant_id"],
                "propertiesOrder": ["id", "name"]
            },
            "actions": {"ping": {"method": "GET", "path": "/:id/ping"}}
        }))
        .unwrap()
    }

    #[test]
    fn url_and_property_order() {
        let s = network();
        assert_eq!(s.url, "/v2.0/networks");
        let ids: Vec<&str> = s.properties.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["id", "name", "shared", "tenant_id"]);
        assert!(s.state_versioning());
        assert_eq!(s.lock_policy("update"), LockPolicy::LockRelatedResources);
        assert_eq!(s.lock_policy("delete"), LockPolicy::NoLocking);
        assert_eq!(s.isolation_level_for("read"), Some("READ COMMITTED"));
        assert!(s.action("ping").unwrap().targets_single_resource());
    }

    #[test]
    fn parent_adds_relation_property() {
        let s = Schema::from_value(&json!({
            "id": "subnet", "plural": "subnets", "parent": "network",
            "schema": {"properties": {"cidr": {"type": "string"}}}
        }))
        .unwrap();
        let p = s.property("network_id").unwrap();
        assert_eq!(p.relation.as_deref(), Some("network"));
        assert!(p.required);
        assert!(s.has_property("id"));
    }

    #[test]
    fn validate_on_create_and_update() {
        let s = network();
        let ok = json!({"name": "n", "tenant_id": "t"}).as_object().cloned().unwrap();
        assert!(s.validate_on_create(&ok).is_ok());
        let missing = json!({"name": "n"}).as_object().cloned().unwrap();
        assert!(s.validate_on_create(&missing).is_err());
        let not_updatable = json!({"tenant_id": "t2"}).as_object().cloned().unwrap();
        assert!(s.validate_on_update(&not_updatable).is_err());
        let wrong_type = json!({"shared": "yes"}).as_object().cloned().unwrap();
        assert!(s.validate_on_update(&wrong_type).is_err());
    }

    #[test]
    fn populate_defaults_fills_only_absent() {
        let s = network();
        let mut data = json!({"name": "keep"}).as_object().cloned().unwrap();
        s.populate_defaults(&mut data);
        assert_eq!(data["name"], json!("keep"));
        assert_eq!(data["shared"], json!(false));
    }

    #[test]
    fn unknown_locking_policy_is_rejected() {
        let err = Schema::from_value(&json!({
            "id": "x", "plural": "xs", "metadata": {"locking_policy": {"update": "bogus"}},
            "schema": {"properties": {}}
        }))
        .unwrap_err();
        assert!(matches!(err, SchemaError::Invalid(_)));
    }
}
