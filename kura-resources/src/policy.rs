//! Policy gate and response-time enforcement.

use std::sync::Arc;

use kura_filter::{matches, Filter};
use kura_schema::policy::ACTION_READ;
use kura_schema::{Authorization, Manager, Policy, Schema};
use kura_types::ResourceError;
use serde_json::{Map, Value};
use tracing::debug;

use kura_extension::Context;

/// Identity of a call made without one, such as a script running outside
/// any request.
fn internal_caller() -> Authorization {
    Authorization::admin("", "")
}

pub(crate) fn caller(ctx: &Context) -> Authorization {
    ctx.auth().cloned().unwrap_or_else(internal_caller)
}

/// Matches a policy for `(action, path)` and records it in the context.
/// Calls without an identity run under an allow-all policy.
pub(crate) fn load_policy(
    ctx: &mut Context,
    manager: &Manager,
    action: &str,
    path: &str,
) -> Result<Arc<Policy>, ResourceError> {
    let Some(auth) = ctx.auth() else {
        let policy = Arc::new(Policy::allow_all());
        ctx.set_policy(Some(Arc::clone(&policy)));
        return Ok(policy);
    };
    let (policy, role) = manager
        .policy_validate(action, path, auth)
        .ok_or_else(|| ResourceError::unauthorized(format!("No matching policy: {action} {path}")))?;
    debug!(policy = %policy.id, role = %role.name, action, path, "policy matched");
    ctx.set_policy(Some(Arc::clone(&policy)));
    ctx.insert("role", Value::String(role.name));
    Ok(policy)
}

fn id_list(ids: Vec<String>) -> Value {
    Value::Array(ids.into_iter().map(Value::String).collect())
}

/// Rows `auth` may reach for `action`: the policy's custom condition plus
/// its tenant and domain restrictions.
pub(crate) fn scope_filter(
    schema: &Schema,
    policy: &Policy,
    action: &str,
    auth: &Authorization,
) -> Result<Filter, ResourceError> {
    let cond = policy.condition();
    let mut filter = cond
        .custom_filter(schema, auth)
        .map_err(|e| ResourceError::internal(e.to_string()))?
        .unwrap_or_else(Filter::all);
    let (tenants, domains) = cond.tenant_and_domain_filters(action, auth);
    if let Some(tenants) = tenants.filter(|t| !t.is_empty() && schema.has_property("tenant_id")) {
        filter = filter.and_with(Filter::eq("tenant_id", id_list(tenants)));
    }
    if let Some(domains) = domains.filter(|d| !d.is_empty() && schema.has_property("domain_id")) {
        filter = filter.and_with(Filter::eq("domain_id", id_list(domains)));
    }
    Ok(filter)
}

/// What the caller may read at `path`; `None` when no read policy matches.
pub(crate) fn readable_filter(
    ctx: &Context,
    manager: &Manager,
    schema: &Schema,
    path: &str,
) -> Result<Option<Filter>, ResourceError> {
    let Some(auth) = ctx.auth() else {
        return Ok(Some(Filter::all()));
    };
    match manager.policy_validate(ACTION_READ, path, auth) {
        Some((policy, _)) => scope_filter(schema, &policy, ACTION_READ, auth).map(Some),
        None => Ok(None),
    }
}

pub(crate) fn id_filter(id: &str) -> Filter {
    Filter::eq("id", Value::String(id.to_string()))
}

/// The part of `data` the caller may see, or `None` when the row is not
/// readable under the policy at all.
pub(crate) fn visible(
    schema: &Schema,
    policy: &Policy,
    auth: &Authorization,
    data: &Map<String, Value>,
) -> Result<Option<Map<String, Value>>, ResourceError> {
    let cond = policy.condition();
    if cond.apply_property_condition_filter(ACTION_READ, data, None).is_err() {
        return Ok(None);
    }
    let custom = cond
        .custom_filter(schema, auth)
        .map_err(|e| ResourceError::internal(e.to_string()))?;
    if let Some(custom) = custom {
        if !matches(&custom, data) {
            return Ok(None);
        }
    }
    Ok(Some(policy.remove_hidden_properties(data)))
}

/// Filters every listed row, dropping those the caller may not read.
pub(crate) fn visible_rows(
    schema: &Schema,
    policy: &Policy,
    auth: &Authorization,
    rows: Vec<Value>,
) -> Result<Vec<Value>, ResourceError> {
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        match row {
            Value::Object(data) => {
                if let Some(shown) = visible(schema, policy, auth, &data)? {
                    out.push(Value::Object(shown));
                }
            }
            other => out.push(other),
        }
    }
    Ok(out)
}
