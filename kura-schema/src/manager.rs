use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info};

use crate::auth::{Authorization, Role};
use crate::policy::policy_validate;
use crate::{Extension, Policy, Schema, SchemaError};

/// Registry of schemas, policies and extensions. Populated during load and
/// shared read-only behind an `Arc` afterwards.
#[derive(Debug, Default)]
pub struct Manager {
    schemas: Vec<Arc<Schema>>,
    index: HashMap<String, usize>,
    policies: Vec<Arc<Policy>>,
    extensions: Vec<Arc<Extension>>,
}

impl Manager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_schema(&mut self, mut schema: Schema) -> Result<(), SchemaError> {
        if self.index.contains_key(&schema.id) {
            return Err(SchemaError::Invalid(format!("schema {} is already registered", schema.id)));
        }
        if let Some(parent) = &schema.parent {
            if !self.index.contains_key(parent) {
                return Err(SchemaError::Invalid(format!(
                    "parent schema {parent} of {} not found",
                    schema.id
                )));
            }
        }
        for base_id in schema.extends.clone() {
            let base = self
                .schema(&base_id)
                .ok_or_else(|| SchemaError::Invalid(format!("extended schema {base_id} of {} not found", schema.id)))?;
            schema.extend(&base)?;
        }
        debug!(schema = %schema.id, url = %schema.url, "registered schema");
        self.index.insert(schema.id.clone(), self.schemas.len());
        self.schemas.push(Arc::new(schema));
        Ok(())
    }

    pub fn register_policy(&mut self, policy: Policy) {
        self.policies.push(Arc::new(policy));
    }

    pub fn register_extension(&mut self, extension: Extension) {
        self.extensions.push(Arc::new(extension));
    }

    pub fn schema(&self, id: &str) -> Option<Arc<Schema>> {
        self.index.get(id).map(|&i| Arc::clone(&self.schemas[i]))
    }

    pub fn schema_by_url(&self, url: &str) -> Option<Arc<Schema>> {
        self.schemas.iter().find(|s| !s.is_abstract && s.url == url).cloned()
    }

    pub fn schema_by_plural(&self, plural: &str) -> Option<Arc<Schema>> {
        self.schemas.iter().find(|s| !s.is_abstract && s.plural == plural).cloned()
    }

    /// Registration order, abstract schemas included.
    pub fn schemas(&self) -> &[Arc<Schema>] {
        &self.schemas
    }

    /// Concrete schemas with parents and relation targets first; ties keep
    /// registration order.
    pub fn ordered_schemas(&self) -> Vec<Arc<Schema>> {
        let concrete: Vec<&Arc<Schema>> = self.schemas.iter().filter(|s| !s.is_abstract).collect();
        let ids: HashSet<&str> = concrete.iter().map(|s| s.id.as_str()).collect();
        let deps = |s: &Schema| -> Vec<String> {
            let mut d: Vec<String> = s.parent.iter().cloned().collect();
            d.extend(s.properties.iter().filter_map(|p| p.relation.clone()));
            d.retain(|x| *x != s.id && ids.contains(x.as_str()));
            d
        };
        let mut done: HashSet<String> = HashSet::new();
        let mut out = Vec::with_capacity(concrete.len());
        while out.len() < concrete.len() {
            let before = out.len();
            for s in &concrete {
                if done.contains(&s.id) {
                    continue;
                }
                if deps(s).iter().all(|d| done.contains(d)) {
                    done.insert(s.id.clone());
                    out.push(Arc::clone(s));
                }
            }
            if out.len() == before {
                // relation cycle: emit the rest in registration order
                for s in &concrete {
                    if done.insert(s.id.clone()) {
                        out.push(Arc::clone(s));
                    }
                }
            }
        }
        out
    }

    pub fn policies(&self) -> &[Arc<Policy>] {
        &self.policies
    }

    pub fn policy_validate(&self, action: &str, path: &str, auth: &Authorization) -> Option<(Arc<Policy>, Role)> {
        policy_validate(action, path, auth, &self.policies).map(|(p, r)| (Arc::clone(p), r))
    }

    pub fn extensions(&self) -> &[Arc<Extension>] {
        &self.extensions
    }

    pub fn extensions_for(&self, schema: &Schema) -> Vec<Arc<Extension>> {
        self.extensions
            .iter()
            .filter(|e| e.matches(&schema.url))
            .cloned()
            .collect()
    }

    /// Checks that every relation points at a registered schema.
    pub fn validate(&self) -> Result<(), SchemaError> {
        for s in &self.schemas {
            for p in &s.properties {
                if let Some(rel) = &p.relation {
                    if !self.index.contains_key(rel) {
                        return Err(SchemaError::Invalid(format!(
                            "property {}.{} relates to unknown schema {rel}",
                            s.id, p.id
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    pub fn load_file(&mut self, path: impl AsRef<Path>) -> Result<(), SchemaError> {
        let path = path.as_ref();
        let load_err = |message: String| SchemaError::Load {
            path: path.display().to_string(),
            message,
        };
        let text = std::fs::read_to_string(path).map_err(|e| load_err(e.to_string()))?;
        let raw: Value = if path.extension().and_then(|e| e.to_str()) == Some("json") {
            serde_json::from_str(&text).map_err(|e| load_err(e.to_string()))?
        } else {
            serde_yaml::from_str(&text).map_err(|e| load_err(e.to_string()))?
        };
        let base = path.parent().map(Path::to_path_buf).unwrap_or_default();
        self.load_value(&raw, &base)?;
        info!(path = %path.display(), schemas = self.schemas.len(), "loaded schema file");
        Ok(())
    }

    pub fn load_files<P: AsRef<Path>>(&mut self, paths: &[P]) -> Result<(), SchemaError> {
        for p in paths {
            self.load_file(p)?;
        }
        self.validate()
    }

    /// Registers a document with top-level `schemas`, `policies` and
    /// `extensions`. Extension files are resolved against `base`.
    pub fn load_value(&mut self, raw: &Value, base: &Path) -> Result<(), SchemaError> {
        let list = |key: &str| raw.get(key).and_then(Value::as_array).cloned().unwrap_or_default();

        let mut pending = Vec::new();
        for item in list("schemas") {
            pending.push(Schema::from_value(&item)?);
        }
        // parents and extended schemas may appear later in the file
        while !pending.is_empty() {
            let before = pending.len();
            let mut rest = Vec::new();
            for schema in pending {
                let ready = schema.parent.iter().chain(schema.extends.iter()).all(|d| self.index.contains_key(d));
                if ready {
                    self.register_schema(schema)?;
                } else {
                    rest.push(schema);
                }
            }
            if rest.len() == before {
                let missing: Vec<String> = rest.iter().map(|s| s.id.clone()).collect();
                return Err(SchemaError::Invalid(format!(
                    "unresolved parent or extends for schemas: {}",
                    missing.join(", ")
                )));
            }
            pending = rest;
        }

        for item in list("policies") {
            self.register_policy(Policy::from_value(&item)?);
        }
        for item in list("extensions") {
            let mut ext = Extension::from_value(&item)?;
            if let Some(file) = &ext.file {
                let full: PathBuf = base.join(file);
                ext.code = std::fs::read_to_string(&full).map_err(|e| SchemaError::Load {
                    path: full.display().to_string(),
                    message: e.to_string(),
                })?;
            }
            self.register_extension(ext);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn doc() -> Value {
        json!({
            "schemas": [
                {"id": "subnet", "plural": "subnets", "parent": "network",
                 "schema": {"properties": {"cidr": {"type": "string"}}}},
                {"id": "base", "plural": "bases", "type": "abstract",
                 "schema": {"properties": {"description": {"type": "string", "default": ""}}}},
                {"id": "network", "plural": "networks", "prefix": "/v2.0", "extends": ["base"],
                 "schema": {"properties": {"name": {"type": "string"},
                                           "port_id": {"type": "string", "relation": "port"}}}},
                {"id": "port", "plural": "ports",
                 "schema": {"properties": {"name": {"type": "string"}}}}
            ],
            "policies": [{"id": "admin", "principal": "admin", "action": "*", "resource": {"path": ".*"}}]
        })
    }

    #[test]
    fn load_resolves_out_of_order_parents() {
        let mut m = Manager::new();
        m.load_value(&doc(), Path::new(".")).unwrap();
        m.validate().unwrap();
        assert!(m.schema("subnet").is_some());
        assert!(m.schema("missing").is_none());
        assert_eq!(m.schema_by_url("/v2.0/networks").unwrap().id, "network");
        assert_eq!(m.schema_by_plural("subnets").unwrap().id, "subnet");
        assert!(m.schema("network").unwrap().has_property("description"));
    }

    #[test]
    fn ordered_schemas_puts_dependencies_first() {
        let mut m = Manager::new();
        m.load_value(&doc(), Path::new(".")).unwrap();
        let ids: Vec<String> = m.ordered_schemas().iter().map(|s| s.id.clone()).collect();
        assert_eq!(ids, vec!["port", "network", "subnet"]);
    }

    #[test]
    fn unknown_relation_fails_validation() {
        let mut m = Manager::new();
        m.register_schema(
            Schema::from_value(&json!({"id": "a", "plural": "as",
                "schema": {"properties": {"b_id": {"type": "string", "relation": "b"}}}}))
            .unwrap(),
        )
        .unwrap();
        assert!(m.validate().is_err());
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut m = Manager::new();
        let raw = json!({"id": "a", "plural": "as", "schema": {"properties": {}}});
        m.register_schema(Schema::from_value(&raw).unwrap()).unwrap();
        assert!(m.register_schema(Schema::from_value(&raw).unwrap()).is_err());
    }

    #[test]
    fn policy_lookup_by_role() {
        let mut m = Manager::new();
        m.load_value(&doc(), Path::new(".")).unwrap();
        let admin = Authorization::admin("adminT", "admin");
        assert!(m.policy_validate("read", "/v2.0/networks", &admin).is_some());
        let member = Authorization::scoped_to_tenant("memberT", "member").with_roles(["Member"]);
        assert!(m.policy_validate("read", "/v2.0/networks", &member).is_none());
    }
}
