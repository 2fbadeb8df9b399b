use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

use async_trait::async_trait;
use kura_types::ExceptionInfo;
use serde_json::Value;
use tracing::{debug, info};

use crate::host::Host;
use crate::script::ScriptEnvironment;
use crate::{Context, ExtensionError};

/// What running an event's hooks produced.
#[derive(Clone, Debug, PartialEq)]
pub enum HookOutcome {
    /// Handlers ran without setting a response.
    Completed,
    /// A handler left a response in the context.
    Responded(Value),
    /// A handler raised a typed exception; the context carries it too.
    Exception(ExceptionInfo),
    /// Nothing is registered for the event.
    NotHandled,
}

#[async_trait]
pub trait Environment: Send + Sync {
    fn name(&self) -> &str;

    async fn handle_event(&self, event: &str, ctx: &mut Context) -> Result<HookOutcome, ExtensionError>;

    /// Independent script state sharing the loaded code.
    fn clone_env(&self) -> Arc<dyn Environment>;
}

/// Environment that never handles anything.
pub struct NullEnvironment;

#[async_trait]
impl Environment for NullEnvironment {
    fn name(&self) -> &str {
        "null"
    }

    async fn handle_event(&self, _event: &str, _ctx: &mut Context) -> Result<HookOutcome, ExtensionError> {
        Ok(HookOutcome::NotHandled)
    }

    fn clone_env(&self) -> Arc<dyn Environment> {
        Arc::new(NullEnvironment)
    }
}

/// Broadcasts events to children in registration order.
///
/// Children that do not handle the event do not stop the rest; the first
/// error or exception does. Clones are built lazily, child by child.
pub struct MultiEnvironment {
    name: String,
    sources: Vec<Arc<dyn Environment>>,
    children: Vec<OnceLock<Arc<dyn Environment>>>,
}

impl MultiEnvironment {
    pub fn new(name: impl Into<String>, children: Vec<Arc<dyn Environment>>) -> Self {
        let slots = children
            .iter()
            .map(|c| {
                let slot = OnceLock::new();
                let _ = slot.set(c.clone());
                slot
            })
            .collect();
        Self {
            name: name.into(),
            sources: children,
            children: slots,
        }
    }

    fn child(&self, i: usize) -> &Arc<dyn Environment> {
        self.children[i].get_or_init(|| self.sources[i].clone_env())
    }

    /// Children already materialised.
    pub fn initialised(&self) -> usize {
        self.children.iter().filter(|c| c.get().is_some()).count()
    }
}

#[async_trait]
impl Environment for MultiEnvironment {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle_event(&self, event: &str, ctx: &mut Context) -> Result<HookOutcome, ExtensionError> {
        let mut outcome = HookOutcome::NotHandled;
        for i in 0..self.sources.len() {
            match self.child(i).handle_event(event, ctx).await? {
                HookOutcome::NotHandled => {}
                HookOutcome::Exception(info) => return Ok(HookOutcome::Exception(info)),
                other => outcome = other,
            }
        }
        if let (HookOutcome::Completed, Some(response)) = (&outcome, ctx.response()) {
            return Ok(HookOutcome::Responded(response.clone()));
        }
        Ok(outcome)
    }

    fn clone_env(&self) -> Arc<dyn Environment> {
        Arc::new(Self {
            name: self.name.clone(),
            sources: self.sources.clone(),
            children: self.sources.iter().map(|_| OnceLock::new()).collect(),
        })
    }
}

/// Process-wide map from schema id to environment.
#[derive(Default)]
pub struct EnvironmentManager {
    environments: RwLock<HashMap<String, Arc<dyn Environment>>>,
}

impl EnvironmentManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: &str, env: Arc<dyn Environment>) -> Result<(), ExtensionError> {
        let mut envs = self
            .environments
            .write()
            .map_err(|_| ExtensionError::Runtime("environment registry poisoned".into()))?;
        if envs.contains_key(id) {
            return Err(ExtensionError::Duplicate(id.to_string()));
        }
        envs.insert(id.to_string(), env);
        Ok(())
    }

    pub fn unregister(&self, id: &str) -> bool {
        self.environments
            .write()
            .map(|mut envs| envs.remove(id).is_some())
            .unwrap_or(false)
    }

    /// A fresh clone of the environment registered for `id`.
    pub fn get(&self, id: &str) -> Option<Arc<dyn Environment>> {
        let envs = self.environments.read().ok()?;
        envs.get(id).map(|env| env.clone_env())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.environments
            .read()
            .map(|envs| envs.contains_key(id))
            .unwrap_or(false)
    }

    /// Registers one script environment per schema that has extensions bound
    /// to its URL. Returns how many were registered.
    pub fn load_extensions(&self, host: &Arc<Host>) -> Result<usize, ExtensionError> {
        let mut count = 0;
        for schema in host.manager.schemas() {
            let extensions = host.manager.extensions_for(schema);
            if extensions.is_empty() {
                continue;
            }
            debug!(schema = %schema.id, count = extensions.len(), "loading extensions");
            let env = ScriptEnvironment::from_extensions(schema.id.clone(), host.clone(), &extensions)?;
            self.register(&schema.id, Arc::new(env))?;
            count += 1;
        }
        info!(environments = count, "extensions loaded");
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;

    struct Recording {
        name: &'static str,
        result: HookOutcome,
        clones: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Environment for Recording {
        fn name(&self) -> &str {
            self.name
        }

        async fn handle_event(&self, _event: &str, ctx: &mut Context) -> Result<HookOutcome, ExtensionError> {
            let mut seen = ctx.get("seen").cloned().unwrap_or(json!([]));
            if let Some(list) = seen.as_array_mut() {
                list.push(json!(self.name));
            }
            ctx.insert("seen", seen);
            Ok(self.result.clone())
        }

        fn clone_env(&self) -> Arc<dyn Environment> {
            self.clones.fetch_add(1, Ordering::SeqCst);
            Arc::new(Recording {
                name: self.name,
                result: self.result.clone(),
                clones: self.clones.clone(),
            })
        }
    }

    fn child(name: &'static str, result: HookOutcome, clones: &Arc<AtomicUsize>) -> Arc<dyn Environment> {
        Arc::new(Recording {
            name,
            result,
            clones: clones.clone(),
        })
    }

    #[tokio::test]
    async fn multi_skips_unhandled_and_stops_on_exception() {
        let clones = Arc::new(AtomicUsize::new(0));
        let multi = MultiEnvironment::new(
            "multi",
            vec![
                child("a", HookOutcome::NotHandled, &clones),
                child("b", HookOutcome::Exception(ExceptionInfo::custom("no", 400)), &clones),
                child("c", HookOutcome::Completed, &clones),
            ],
        );
        let mut ctx = Context::new();
        let out = multi.handle_event("pre_create", &mut ctx).await.unwrap();
        assert!(matches!(out, HookOutcome::Exception(_)));
        assert_eq!(ctx.get("seen"), Some(&json!(["a", "b"])));
    }

    #[tokio::test]
    async fn multi_clone_is_lazy() {
        let clones = Arc::new(AtomicUsize::new(0));
        let multi = MultiEnvironment::new(
            "multi",
            vec![
                child("a", HookOutcome::Completed, &clones),
                child("b", HookOutcome::Completed, &clones),
            ],
        );
        let copy = multi.clone_env();
        assert_eq!(clones.load(Ordering::SeqCst), 0);
        let mut ctx = Context::new();
        assert_eq!(copy.handle_event("post_list", &mut ctx).await.unwrap(), HookOutcome::Completed);
        assert_eq!(clones.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn manager_rejects_duplicates_and_returns_clones() {
        let clones = Arc::new(AtomicUsize::new(0));
        let manager = EnvironmentManager::new();
        manager.register("net", child("a", HookOutcome::Completed, &clones)).unwrap();
        let err = manager
            .register("net", child("b", HookOutcome::Completed, &clones))
            .unwrap_err();
        assert!(matches!(err, ExtensionError::Duplicate(id) if id == "net"));
        assert!(manager.get("net").is_some());
        assert_eq!(clones.load(Ordering::SeqCst), 1);
        assert!(manager.get("subnet").is_none());
        assert!(manager.unregister("net"));
        assert!(!manager.contains("net"));
    }
}
