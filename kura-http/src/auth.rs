//! Caller identity from request headers. Tokens are verified upstream;
//! this layer only trusts what the proxy forwards.

use axum::http::HeaderMap;
use kura_schema::{Authorization, Domain, ADMIN_ROLE};
use kura_types::ResourceError;

pub const TENANT_ID: &str = "x-tenant-id";
pub const TENANT_NAME: &str = "x-tenant-name";
pub const DOMAIN_ID: &str = "x-domain-id";
pub const ROLES: &str = "x-roles";
pub const AUTH_TOKEN: &str = "x-auth-token";

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Builds the caller from `X-Roles` and friends. A request without roles
/// is rejected; one without a tenant is domain scoped.
pub fn authorization(headers: &HeaderMap) -> Result<Authorization, ResourceError> {
    let roles: Vec<String> = header(headers, ROLES)
        .map(|r| r.split(',').map(str::trim).filter(|r| !r.is_empty()).map(str::to_string).collect())
        .unwrap_or_default();
    if roles.is_empty() {
        return Err(ResourceError::unauthorized("No X-Roles header in request"));
    }

    let mut auth = match header(headers, TENANT_ID) {
        Some(tenant_id) => {
            let tenant_name = header(headers, TENANT_NAME).unwrap_or(tenant_id);
            Authorization::scoped_to_tenant(tenant_id, tenant_name)
        }
        None => Authorization::scoped_to_domain(Domain::default()),
    };
    if let Some(domain_id) = header(headers, DOMAIN_ID) {
        auth = auth.with_domain(Domain {
            id: domain_id.to_string(),
            name: domain_id.to_string(),
        });
    }
    if let Some(token) = header(headers, AUTH_TOKEN) {
        auth = auth.with_token(token);
    }
    auth.admin = roles.iter().any(|r| r == ADMIN_ROLE);
    Ok(auth.with_roles(roles))
}
