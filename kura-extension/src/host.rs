use std::fmt;
use std::path::Path;
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use cap_std::ambient_authority;
use cap_std::fs::Dir;
use kura_db::Db;
use kura_schema::Manager;
use kura_sync::SyncClient;
use regex::Regex;
use rhai::{Dynamic, Engine};
use serde_json::Value;

use crate::globals::GlobalStore;
use crate::script::EnvState;
use crate::{ExtensionError, ResourceService};

pub const DEFAULT_TIME_LIMIT: Duration = Duration::from_secs(30);

/// Filesystem capability: every file builtin resolves below `root`.
pub struct FsCap {
    pub root: Dir,
}

impl FsCap {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ExtensionError> {
        let root = Dir::open_ambient_dir(path.as_ref(), ambient_authority())
            .map_err(|e| ExtensionError::Runtime(format!("open {}: {e}", path.as_ref().display())))?;
        Ok(Self { root })
    }
}

/// Network capability for the `http` builtin.
#[derive(Clone, Debug, Default)]
pub enum NetCap {
    NoNet,
    #[default]
    Open,
    AllowDomains(Vec<String>),
}

impl NetCap {
    pub fn allows(&self, host: &str) -> bool {
        match self {
            NetCap::NoNet => false,
            NetCap::Open => true,
            NetCap::AllowDomains(hosts) => hosts.iter().any(|h| h == host),
        }
    }
}

/// Per-event time limits: the first matching override wins.
#[derive(Clone, Debug)]
pub struct TimeLimits {
    pub default: Duration,
    pub overrides: Vec<(Regex, Duration)>,
}

impl Default for TimeLimits {
    fn default() -> Self {
        Self {
            default: DEFAULT_TIME_LIMIT,
            overrides: Vec::new(),
        }
    }
}

impl TimeLimits {
    pub fn new(default: Duration) -> Self {
        Self {
            default,
            overrides: Vec::new(),
        }
    }

    pub fn with_override(mut self, event: &str, limit: Duration) -> Result<Self, ExtensionError> {
        let re = Regex::new(event).map_err(|e| ExtensionError::Runtime(format!("time limit pattern {event}: {e}")))?;
        self.overrides.push((re, limit));
        Ok(self)
    }

    pub fn limit_for(&self, event: &str) -> Duration {
        self.overrides
            .iter()
            .find(|(re, _)| re.is_match(event))
            .map(|(_, limit)| *limit)
            .unwrap_or(self.default)
    }
}

/// Extra builtins installed into every script engine the host builds.
pub trait Module: Send + Sync {
    fn name(&self) -> &str;

    fn register(&self, engine: &mut Engine, state: &Arc<EnvState>);
}

/// Replaces a builtin call when it returns `Some`.
pub trait CallInterceptor: Send + Sync {
    fn intercept(&self, function: &str, args: &[Dynamic]) -> Option<Result<Dynamic, String>>;
}

/// Everything a script environment may reach outside its interpreter.
pub struct Host {
    pub manager: Arc<Manager>,
    pub db: Option<Arc<dyn Db>>,
    pub sync: Option<Arc<dyn SyncClient>>,
    pub config: Value,
    pub limits: TimeLimits,
    pub fs: Option<FsCap>,
    pub net: NetCap,
    pub client: reqwest::Client,
    pub process_globals: Arc<GlobalStore>,
    pub modules: Vec<Arc<dyn Module>>,
    pub interceptor: Option<Arc<dyn CallInterceptor>>,
    service: OnceLock<Weak<dyn ResourceService>>,
}

impl fmt::Debug for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Host")
            .field("db", &self.db.is_some())
            .field("sync", &self.sync.is_some())
            .field("limits", &self.limits)
            .field("net", &self.net)
            .field("modules", &self.modules.iter().map(|m| m.name()).collect::<Vec<_>>())
            .finish()
    }
}

impl Host {
    pub fn builder(manager: Arc<Manager>) -> HostBuilder {
        HostBuilder::new(manager)
    }

    /// Binds the service model builtins call into. Only the first call wins.
    pub fn bind_service(&self, service: Weak<dyn ResourceService>) -> bool {
        self.service.set(service).is_ok()
    }

    pub fn service(&self) -> Option<Arc<dyn ResourceService>> {
        self.service.get().and_then(Weak::upgrade)
    }

    /// Value at a `/`-separated path of the host configuration.
    pub fn config_value(&self, key: &str) -> Option<&Value> {
        key.split('/')
            .filter(|part| !part.is_empty())
            .try_fold(&self.config, |node, part| match node {
                Value::Object(map) => map.get(part),
                Value::Array(items) => part.parse::<usize>().ok().and_then(|i| items.get(i)),
                _ => None,
            })
    }
}

pub struct HostBuilder {
    host: Host,
}

impl HostBuilder {
    pub fn new(manager: Arc<Manager>) -> Self {
        Self {
            host: Host {
                manager,
                db: None,
                sync: None,
                config: Value::Null,
                limits: TimeLimits::default(),
                fs: None,
                net: NetCap::default(),
                client: reqwest::Client::new(),
                process_globals: Arc::new(GlobalStore::new()),
                modules: Vec::new(),
                interceptor: None,
                service: OnceLock::new(),
            },
        }
    }

    pub fn db(mut self, db: Arc<dyn Db>) -> Self {
        self.host.db = Some(db);
        self
    }

    pub fn sync(mut self, sync: Arc<dyn SyncClient>) -> Self {
        self.host.sync = Some(sync);
        self
    }

    pub fn config(mut self, config: Value) -> Self {
        self.host.config = config;
        self
    }

    pub fn limits(mut self, limits: TimeLimits) -> Self {
        self.host.limits = limits;
        self
    }

    pub fn time_limit(mut self, limit: Duration) -> Self {
        self.host.limits.default = limit;
        self
    }

    pub fn fs(mut self, fs: FsCap) -> Self {
        self.host.fs = Some(fs);
        self
    }

    pub fn net(mut self, net: NetCap) -> Self {
        self.host.net = net;
        self
    }

    pub fn process_globals(mut self, globals: Arc<GlobalStore>) -> Self {
        self.host.process_globals = globals;
        self
    }

    pub fn module(mut self, module: Arc<dyn Module>) -> Self {
        self.host.modules.push(module);
        self
    }

    pub fn interceptor(mut self, interceptor: Arc<dyn CallInterceptor>) -> Self {
        self.host.interceptor = Some(interceptor);
        self
    }

    pub fn build(self) -> Arc<Host> {
        Arc::new(self.host)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn config_paths_walk_maps_and_lists() {
        let host = Host::builder(Arc::new(Manager::new()))
            .config(json!({"keystone": {"endpoints": ["a", "b"], "use": true}}))
            .build();
        assert_eq!(host.config_value("keystone/use"), Some(&json!(true)));
        assert_eq!(host.config_value("/keystone/endpoints/1"), Some(&json!("b")));
        assert_eq!(host.config_value("keystone/missing"), None);
    }

    #[test]
    fn overrides_take_precedence() {
        let limits = TimeLimits::new(Duration::from_millis(100))
            .with_override("^pre_", Duration::from_millis(10))
            .unwrap();
        assert_eq!(limits.limit_for("pre_create"), Duration::from_millis(10));
        assert_eq!(limits.limit_for("post_create"), Duration::from_millis(100));
    }

    #[test]
    fn allow_list_matches_exact_hosts() {
        let net = NetCap::AllowDomains(vec!["api.example.com".into()]);
        assert!(net.allows("api.example.com"));
        assert!(!net.allows("example.com"));
        assert!(!NetCap::NoNet.allows("api.example.com"));
        assert!(NetCap::Open.allows("anything"));
    }
}
