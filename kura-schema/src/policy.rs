use std::collections::{HashMap, HashSet};

use kura_filter::Filter;
use regex::Regex;
use serde_json::{Map, Value};

use crate::auth::{Authorization, Role, Scope, Tenant};
use crate::{Schema, SchemaError};

pub const ACTION_GLOB: &str = "*";
pub const ACTION_CREATE: &str = "create";
pub const ACTION_READ: &str = "read";
pub const ACTION_UPDATE: &str = "update";
pub const ACTION_DELETE: &str = "delete";
pub const ALL_ACTIONS: [&str; 4] = [ACTION_CREATE, ACTION_READ, ACTION_UPDATE, ACTION_DELETE];

/// Unanchored regex; an absent or empty pattern matches anything.
#[derive(Clone, Debug, Default)]
struct Pattern(Option<Regex>);

impl Pattern {
    fn is_match(&self, s: &str) -> bool {
        self.0.as_ref().map(|r| r.is_match(s)).unwrap_or(true)
    }
}

fn pattern(raw: Option<&str>) -> Result<Pattern, SchemaError> {
    match raw {
        Some(s) if !s.is_empty() && s != ".*" => Ok(Pattern(Some(Regex::new(s)?))),
        _ => Ok(Pattern(None)),
    }
}

/// Which response properties a policy reveals.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PropertiesFilter {
    All,
    Visible(HashSet<String>),
    Hidden(HashSet<String>),
}

impl PropertiesFilter {
    pub fn new(visible: Option<Vec<String>>, hidden: Option<Vec<String>>) -> Result<Self, SchemaError> {
        match (visible, hidden) {
            (None, None) => Ok(PropertiesFilter::All),
            (Some(v), None) => Ok(PropertiesFilter::Visible(v.into_iter().collect())),
            (None, Some(h)) => Ok(PropertiesFilter::Hidden(h.into_iter().collect())),
            (Some(_), Some(_)) => Err(SchemaError::InvalidPolicy(
                "Cannot have filter with both visible and hidden properties".into(),
            )),
        }
    }

    pub fn is_visible(&self, key: &str) -> bool {
        match self {
            PropertiesFilter::All => true,
            PropertiesFilter::Visible(set) => set.contains(key),
            PropertiesFilter::Hidden(set) => !set.contains(key),
        }
    }

    pub fn retain(&self, data: &Map<String, Value>) -> Map<String, Value> {
        data.iter()
            .filter(|(k, _)| self.is_visible(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

#[derive(Clone, Debug)]
struct TenantMatcher {
    id: Pattern,
    name: Pattern,
}

impl TenantMatcher {
    fn matches(&self, owner_id: &str, owner_name: &str) -> bool {
        self.id.is_match(owner_id) && self.name.is_match(owner_name)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Junction {
    And,
    Or,
}

/// Precomputed `and`/`or` condition tree used for list filtering.
#[derive(Clone, Debug)]
struct ConditionFilter {
    junction: Junction,
    is_owner: bool,
    is_domain_owner: bool,
    matches: Vec<Map<String, Value>>,
    nested: Vec<ConditionFilter>,
}

impl ConditionFilter {
    fn parse(junction: Junction, raw: &Value, policy_id: &str) -> Result<Self, SchemaError> {
        let items = raw.as_array().ok_or_else(|| {
            SchemaError::InvalidPolicy(format!("condition list expected for policy '{policy_id}'"))
        })?;
        let mut out = ConditionFilter {
            junction,
            is_owner: false,
            is_domain_owner: false,
            matches: Vec::new(),
            nested: Vec::new(),
        };
        for item in items {
            match item {
                Value::String(s) if s == "is_owner" => out.is_owner = true,
                Value::String(s) if s == "is_domain_owner" => out.is_domain_owner = true,
                Value::Object(obj) => {
                    if let Some(or) = obj.get("or") {
                        out.nested.push(ConditionFilter::parse(Junction::Or, or, policy_id)?);
                    } else if let Some(and) = obj.get("and") {
                        out.nested.push(ConditionFilter::parse(Junction::And, and, policy_id)?);
                    } else if let Some(Value::Object(m)) = obj.get("match") {
                        out.matches.push(m.clone());
                    } else {
                        return Err(SchemaError::InvalidPolicy(format!(
                            "Unknown condition '{item}' for policy '{policy_id}'"
                        )));
                    }
                }
                other => {
                    return Err(SchemaError::InvalidPolicy(format!(
                        "Unknown condition '{other}' for policy '{policy_id}'"
                    )))
                }
            }
        }
        Ok(out)
    }

    fn to_filter(&self, schema: &Schema, auth: &Authorization) -> Result<Filter, SchemaError> {
        let mut parts = Vec::new();
        if self.is_owner {
            let mut owner = tenant_custom_filter(schema, auth);
            owner.extend(domain_custom_filter(schema, auth));
            parts.push(Filter::And(owner));
        }
        if self.is_domain_owner {
            parts.push(Filter::And(domain_custom_filter(schema, auth)));
        }
        for m in &self.matches {
            parts.push(
                Filter::from_value(&Value::Object(m.clone()))
                    .map_err(|e| SchemaError::InvalidPolicy(e.to_string()))?,
            );
        }
        for nested in &self.nested {
            parts.push(nested.to_filter(schema, auth)?);
        }
        Ok(match self.junction {
            Junction::And => Filter::And(parts),
            Junction::Or => Filter::Or(parts),
        })
    }
}

fn tenant_custom_filter(schema: &Schema, auth: &Authorization) -> Vec<Filter> {
    match auth.scope() {
        Scope::Tenant if schema.has_property("tenant_id") => {
            vec![Filter::eq("tenant_id", Value::String(auth.tenant_id().into()))]
        }
        _ => Vec::new(),
    }
}

fn domain_custom_filter(schema: &Schema, auth: &Authorization) -> Vec<Filter> {
    match auth.scope() {
        Scope::Admin => Vec::new(),
        _ if schema.has_property("domain_id") => {
            vec![Filter::eq("domain_id", Value::String(auth.domain_id().into()))]
        }
        _ => Vec::new(),
    }
}

/// The `condition` block of a policy.
#[derive(Clone, Debug, Default)]
pub struct ResourceCondition {
    require_owner: bool,
    require_domain_owner: bool,
    skip_tenant_domain_check: bool,
    tenant_filters: HashMap<String, Vec<TenantMatcher>>,
    tenant_ids: HashMap<String, Vec<String>>,
    property_filters: HashMap<String, Vec<Map<String, Value>>>,
    action_filter: Option<ConditionFilter>,
}

fn condition_actions(obj: &Map<String, Value>) -> Vec<String> {
    match obj.get("action").and_then(Value::as_str) {
        Some(a) if a != ACTION_GLOB => vec![a.to_string()],
        _ => ALL_ACTIONS.iter().map(|a| a.to_string()).collect(),
    }
}

impl ResourceCondition {
    pub fn parse(raw: &[Value], policy_id: &str) -> Result<Self, SchemaError> {
        let mut cond = ResourceCondition::default();
        for item in raw {
            match item {
                Value::String(s) => match s.as_str() {
                    "is_owner" => cond.require_owner = true,
                    "is_domain_owner" => cond.require_domain_owner = true,
                    "skip_tenant_domain_check" => cond.skip_tenant_domain_check = true,
                    other => {
                        return Err(SchemaError::InvalidPolicy(format!(
                            "Unknown condition '{other}' for policy '{policy_id}'"
                        )))
                    }
                },
                Value::Object(obj) => {
                    if let Some(kind) = obj.get("type").and_then(Value::as_str) {
                        match kind {
                            "belongs_to" => {
                                let raw_id = obj.get("tenant_id").and_then(Value::as_str);
                                let raw_name = obj.get("tenant_name").and_then(Value::as_str);
                                if raw_id.is_some() && raw_name.is_some() {
                                    return Err(SchemaError::InvalidPolicy(
                                        "Only one of [tenant_id, tenant_name] should be specified".into(),
                                    ));
                                }
                                let matcher = TenantMatcher {
                                    id: pattern(raw_id)?,
                                    name: pattern(raw_name)?,
                                };
                                for action in condition_actions(obj) {
                                    if let Some(id) = raw_id {
                                        cond.tenant_ids.entry(action.clone()).or_default().push(id.to_string());
                                    }
                                    cond.tenant_filters.entry(action).or_default().push(matcher.clone());
                                }
                            }
                            "property" => {
                                let m = obj.get("match").and_then(Value::as_object).ok_or_else(|| {
                                    SchemaError::InvalidPolicy(format!("match should be dict in policy '{policy_id}'"))
                                })?;
                                for action in condition_actions(obj) {
                                    cond.property_filters.entry(action).or_default().push(m.clone());
                                }
                            }
                            other => {
                                return Err(SchemaError::InvalidPolicy(format!(
                                    "Unknown condition type '{other}' for policy '{policy_id}'"
                                )))
                            }
                        }
                    } else if let Some(and) = obj.get("and") {
                        cond.action_filter = Some(ConditionFilter::parse(Junction::And, and, policy_id)?);
                    } else if let Some(or) = obj.get("or") {
                        cond.action_filter = Some(ConditionFilter::parse(Junction::Or, or, policy_id)?);
                    }
                }
                _ => {
                    return Err(SchemaError::InvalidPolicy(format!(
                        "Invalid condition format for policy '{policy_id}'"
                    )))
                }
            }
        }
        Ok(cond)
    }

    pub fn require_owner(&self) -> bool {
        self.require_owner
    }

    pub fn skip_tenant_domain_check(&self) -> bool {
        self.skip_tenant_domain_check
    }

    fn require_tenant_check(&self) -> bool {
        self.require_owner
    }

    fn require_domain_check(&self) -> bool {
        self.require_owner || self.require_domain_owner
    }

    fn tenant_allowed(&self, action: &str, owner_id: &str, owner_name: &str) -> bool {
        self.tenant_filters
            .get(action)
            .map(|list| list.iter().any(|m| m.matches(owner_id, owner_name)))
            .unwrap_or(false)
    }

    /// Tenant and domain id lists a query must be restricted to. `None`
    /// means unrestricted.
    pub fn tenant_and_domain_filters(
        &self,
        action: &str,
        auth: &Authorization,
    ) -> (Option<Vec<String>>, Option<Vec<String>>) {
        if !self.require_tenant_check() && !self.require_domain_check() {
            return (None, None);
        }
        let (tenants, domains) = match auth.scope() {
            Scope::Admin => (None, None),
            Scope::Domain => (None, Some(vec![auth.domain_id().to_string()])),
            Scope::Tenant => {
                let mut tenants = self.tenant_ids.get(action).cloned().unwrap_or_default();
                tenants.push(auth.tenant_id().to_string());
                (Some(tenants), Some(vec![auth.domain_id().to_string()]))
            }
        };
        (
            tenants.filter(|_| self.require_tenant_check()),
            domains.filter(|_| self.require_domain_check()),
        )
    }

    /// Rejects access to a resource owned by another tenant or domain.
    pub fn check_access(
        &self,
        action: &str,
        auth: &Authorization,
        resource: &Map<String, Value>,
    ) -> Result<(), SchemaError> {
        match auth.scope() {
            Scope::Admin => Ok(()),
            scope => {
                if scope == Scope::Tenant && self.require_tenant_check() {
                    if let Some(tenant) = &auth.tenant {
                        self.check_tenant_access(action, tenant, resource)?;
                    }
                }
                if self.require_domain_check() {
                    if let Some(Value::String(domain_id)) = resource.get("domain_id") {
                        if domain_id != auth.domain_id() {
                            return Err(SchemaError::Denied(
                                "Operating on resources from other domain is prohibited".into(),
                            ));
                        }
                    }
                }
                Ok(())
            }
        }
    }

    fn check_tenant_access(
        &self,
        action: &str,
        tenant: &Tenant,
        resource: &Map<String, Value>,
    ) -> Result<(), SchemaError> {
        let owner_id = resource.get("tenant_id").and_then(Value::as_str).unwrap_or("");
        let owner_name = resource.get("tenant_name").and_then(Value::as_str).unwrap_or("");
        let own = if owner_id.is_empty() {
            owner_name.is_empty() || owner_name == tenant.name
        } else {
            owner_id == tenant.id
        };
        if own || self.tenant_allowed(action, owner_id, owner_name) {
            Ok(())
        } else {
            Err(SchemaError::Denied(
                "Operating on resources from other tenant is prohibited".into(),
            ))
        }
    }

    /// Property conditions of the form `{key: value}` or `{key: {from: to}}`.
    /// The second form also constrains the update candidate when given.
    pub fn apply_property_condition_filter(
        &self,
        action: &str,
        data: &Map<String, Value>,
        update: Option<&Map<String, Value>>,
    ) -> Result<(), SchemaError> {
        let Some(filters) = self.property_filters.get(action) else {
            return Ok(());
        };
        for filter in filters {
            for (key, allowed) in filter {
                let value = data.get(key).unwrap_or(&Value::Null);
                match allowed {
                    Value::Object(transitions) => {
                        let Some(current) = value.as_str() else {
                            return Err(rejected());
                        };
                        let Some(next) = transitions.get(current) else {
                            return Err(rejected());
                        };
                        if let Some(update) = update {
                            if !allowed_match(next, update.get(key).unwrap_or(&Value::Null)) {
                                return Err(rejected());
                            }
                        }
                    }
                    other => {
                        if !allowed_match(other, value) {
                            return Err(rejected());
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Policy-derived list filter from an `and`/`or` condition, if any.
    pub fn custom_filter(&self, schema: &Schema, auth: &Authorization) -> Result<Option<Filter>, SchemaError> {
        self.action_filter
            .as_ref()
            .map(|f| f.to_filter(schema, auth))
            .transpose()
    }
}

fn rejected() -> SchemaError {
    SchemaError::Denied("Rejected by property filter".into())
}

fn allowed_match(allowed: &Value, value: &Value) -> bool {
    match allowed {
        Value::Array(items) => items.iter().any(|i| i == value),
        Value::Object(_) | Value::Null => false,
        scalar => scalar == value,
    }
}

/// Access policy loaded from schema files.
#[derive(Clone, Debug)]
pub struct Policy {
    pub id: String,
    pub description: String,
    pub principal: String,
    pub action: String,
    pub effect: String,
    pub raw: Value,
    resource_path: Pattern,
    properties: PropertiesFilter,
    tenant_id: Pattern,
    tenant_name: Pattern,
    scopes: Vec<Scope>,
    condition: ResourceCondition,
}

impl Policy {
    pub fn from_value(raw: &Value) -> Result<Self, SchemaError> {
        let obj = raw
            .as_object()
            .ok_or_else(|| SchemaError::InvalidPolicy("policy should be an object".into()))?;
        let string = |key: &str| obj.get(key).and_then(Value::as_str).unwrap_or_default().to_string();
        let id = string("id");

        let resource = obj.get("resource").and_then(Value::as_object);
        let resource_path = pattern(resource.and_then(|r| r.get("path")).and_then(Value::as_str))?;
        let list = |key: &str| {
            resource
                .and_then(|r| r.get(key))
                .and_then(Value::as_array)
                .map(|l| l.iter().filter_map(Value::as_str).map(str::to_string).collect())
        };
        let properties = PropertiesFilter::new(list("properties"), list("blacklistProperties"))?;

        let raw_id = obj.get("tenant_id").and_then(Value::as_str).filter(|s| !s.is_empty());
        let raw_name = obj.get("tenant_name").and_then(Value::as_str).filter(|s| !s.is_empty());
        if raw_id.is_some() && raw_name.is_some() {
            return Err(SchemaError::InvalidPolicy(
                "Only one of [tenant_id, tenant_name] should be specified".into(),
            ));
        }

        let scopes = match obj.get("scope") {
            None => Scope::ALL.to_vec(),
            Some(Value::Array(items)) => items
                .iter()
                .enumerate()
                .map(|(i, item)| {
                    item.as_str().and_then(Scope::parse).ok_or_else(|| {
                        SchemaError::InvalidPolicy(format!(
                            "Unknown token type in \"scope\" property at position {i}: {item}"
                        ))
                    })
                })
                .collect::<Result<_, _>>()?,
            Some(_) => {
                return Err(SchemaError::InvalidPolicy(
                    "\"scope\" should be a list of strings".into(),
                ))
            }
        };

        let condition = match obj.get("condition") {
            Some(Value::Array(items)) => ResourceCondition::parse(items, &id)?,
            _ => ResourceCondition::default(),
        };

        Ok(Self {
            description: string("description"),
            principal: string("principal"),
            action: string("action"),
            effect: string("effect"),
            raw: raw.clone(),
            resource_path,
            properties,
            tenant_id: pattern(raw_id)?,
            tenant_name: pattern(raw_name)?,
            scopes,
            condition,
            id,
        })
    }

    /// Policy that allows everything, used for internal calls.
    pub fn allow_all() -> Self {
        Self {
            id: "allow_all".into(),
            description: String::new(),
            principal: String::new(),
            action: ACTION_GLOB.into(),
            effect: "allow".into(),
            raw: Value::Null,
            resource_path: Pattern::default(),
            properties: PropertiesFilter::All,
            tenant_id: Pattern::default(),
            tenant_name: Pattern::default(),
            scopes: Scope::ALL.to_vec(),
            condition: ResourceCondition::default(),
        }
    }

    pub fn is_deny(&self) -> bool {
        self.effect.eq_ignore_ascii_case("deny")
    }

    pub fn condition(&self) -> &ResourceCondition {
        &self.condition
    }

    pub fn properties_filter(&self) -> &PropertiesFilter {
        &self.properties
    }

    /// Returns the caller role this policy grants for `(action, path)`.
    pub fn matches(&self, action: &str, path: &str, auth: &Authorization) -> Option<Role> {
        if self.action != ACTION_GLOB && self.action != action {
            return None;
        }
        if !self.resource_path.is_match(path)
            || !self.tenant_id.is_match(auth.tenant_id())
            || !self.tenant_name.is_match(auth.tenant_name())
            || !self.scopes.contains(&auth.scope())
        {
            return None;
        }
        auth.roles.iter().find(|r| r.matches(&self.principal)).cloned()
    }

    pub fn remove_hidden_properties(&self, data: &Map<String, Value>) -> Map<String, Value> {
        self.properties.retain(data)
    }

    pub fn check_properties_filter(&self, data: &Map<String, Value>) -> Result<(), SchemaError> {
        for key in data.keys() {
            if key == "tenant_name" || key == "domain_name" {
                continue;
            }
            if !self.properties.is_visible(key) {
                return Err(SchemaError::Denied(format!("{key} is prohibited for this user")));
            }
        }
        Ok(())
    }

    pub fn check(&self, action: &str, auth: &Authorization, data: &Map<String, Value>) -> Result<(), SchemaError> {
        self.condition.check_access(action, auth, data)?;
        self.check_properties_filter(data)
    }
}

/// First matching allow policy wins; any matching deny rejects the request.
pub fn policy_validate<'a>(
    action: &str,
    path: &str,
    auth: &Authorization,
    policies: &'a [std::sync::Arc<Policy>],
) -> Option<(&'a std::sync::Arc<Policy>, Role)> {
    let mut found = None;
    for policy in policies {
        if let Some(role) = policy.matches(action, path, auth) {
            if policy.is_deny() {
                return None;
            }
            if found.is_none() {
                found = Some((policy, role));
            }
        }
    }
    found
}
