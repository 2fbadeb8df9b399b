use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const ADMIN_ROLE: &str = "admin";

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tenant {
    pub id: String,
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Domain {
    pub id: String,
    pub name: String,
}

impl Default for Domain {
    fn default() -> Self {
        Self {
            id: "default".into(),
            name: "Default".into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Role {
    pub name: String,
}

impl Role {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn matches(&self, principal: &str) -> bool {
        self.name == principal
    }
}

/// Token scope a policy may be restricted to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Tenant,
    Domain,
    Admin,
}

impl Scope {
    pub const ALL: [Scope; 3] = [Scope::Tenant, Scope::Domain, Scope::Admin];

    pub fn parse(s: &str) -> Option<Scope> {
        match s {
            "tenant" => Some(Scope::Tenant),
            "domain" => Some(Scope::Domain),
            "admin" => Some(Scope::Admin),
            _ => None,
        }
    }
}

/// Resolved identity of the caller. Token verification happens upstream.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Authorization {
    /// `None` for domain-scoped tokens.
    pub tenant: Option<Tenant>,
    pub domain: Domain,
    pub roles: Vec<Role>,
    pub admin: bool,
    #[serde(default)]
    pub auth_token: String,
    #[serde(default)]
    pub catalog: Value,
}

impl Authorization {
    pub fn scoped_to_tenant(tenant_id: impl Into<String>, tenant_name: impl Into<String>) -> Self {
        Self {
            tenant: Some(Tenant {
                id: tenant_id.into(),
                name: tenant_name.into(),
            }),
            domain: Domain::default(),
            roles: Vec::new(),
            admin: false,
            auth_token: String::new(),
            catalog: Value::Null,
        }
    }

    pub fn scoped_to_domain(domain: Domain) -> Self {
        Self {
            tenant: None,
            domain,
            roles: Vec::new(),
            admin: false,
            auth_token: String::new(),
            catalog: Value::Null,
        }
    }

    pub fn admin(tenant_id: impl Into<String>, tenant_name: impl Into<String>) -> Self {
        Self {
            admin: true,
            ..Self::scoped_to_tenant(tenant_id, tenant_name)
        }
        .with_roles([ADMIN_ROLE])
    }

    pub fn with_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.roles = roles.into_iter().map(|r| Role::new(r)).collect();
        self
    }

    pub fn with_domain(mut self, domain: Domain) -> Self {
        self.domain = domain;
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = token.into();
        self
    }

    pub fn tenant_id(&self) -> &str {
        self.tenant.as_ref().map(|t| t.id.as_str()).unwrap_or("")
    }

    pub fn tenant_name(&self) -> &str {
        self.tenant.as_ref().map(|t| t.name.as_str()).unwrap_or("")
    }

    pub fn domain_id(&self) -> &str {
        &self.domain.id
    }

    pub fn domain_name(&self) -> &str {
        &self.domain.name
    }

    pub fn is_admin(&self) -> bool {
        self.admin
    }

    pub fn scope(&self) -> Scope {
        if self.admin {
            Scope::Admin
        } else if self.tenant.is_some() {
            Scope::Tenant
        } else {
            Scope::Domain
        }
    }
}
