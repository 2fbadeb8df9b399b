//! The resource pipeline.
//!
//! Every public operation runs the same stages: policy gate, `pre_<op>`
//! hooks outside any transaction, a transaction at the schema's isolation
//! level wrapping `pre_<op>_in_transaction`, the database step and
//! `post_<op>_in_transaction`, commit, `post_<op>`, and finally output
//! filtering by the matched policy.
//!
//! A context that already carries a transaction is a chained call made
//! from an extension: only the in-transaction half runs, against the
//! caller's transaction, and nothing is committed.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use kura_db::util::DEADLOCK_RETRIES;
use kura_db::{CachedTransaction, Db, DbError, IsolationLevel, Paginator, TxHandle, TxOptions, ViewOptions};
use kura_extension::{
    Context, Environment, EnvironmentManager, ExtensionError, HookOutcome, Host, NullEnvironment, Query,
    ResourceService,
};
use kura_filter::Filter;
use kura_schema::{Action, Manager, Schema};
use kura_types::ResourceError;
use rand::Rng;
use serde_json::{Map, Value};
use tracing::{debug, warn};

mod action;
pub mod cascade;
mod policy;
pub mod query;
mod read;
mod write;

pub use cascade::cascade_clear;

/// Pipeline over one schema registry and one database.
pub struct Resources {
    manager: Arc<Manager>,
    db: Arc<dyn Db>,
    envs: Arc<EnvironmentManager>,
}

/// In-transaction half of an operation.
#[derive(Clone, Copy)]
enum TxStep<'a> {
    List {
        filter: &'a Filter,
        view: &'a ViewOptions,
        paginator: &'a Paginator,
    },
    Show {
        filter: &'a Filter,
        view: &'a ViewOptions,
    },
    Create,
    Update {
        id: &'a str,
        filter: &'a Filter,
        data: &'a Map<String, Value>,
    },
    Delete {
        id: &'a str,
        filter: &'a Filter,
        readable: Option<&'a Filter>,
    },
    Action {
        action: &'a Action,
        filter: Option<&'a Filter>,
    },
}

impl Resources {
    pub fn new(manager: Arc<Manager>, db: Arc<dyn Db>, envs: Arc<EnvironmentManager>) -> Arc<Self> {
        Arc::new(Self { manager, db, envs })
    }

    /// Builds the pipeline and binds it as the service behind the host's
    /// `model_*` builtins.
    pub fn bind(host: &Arc<Host>, db: Arc<dyn Db>, envs: Arc<EnvironmentManager>) -> Arc<Self> {
        let resources = Self::new(Arc::clone(&host.manager), db, envs);
        let service: Arc<dyn ResourceService> = resources.clone();
        let weak: Weak<dyn ResourceService> = Arc::downgrade(&service);
        if !host.bind_service(weak) {
            warn!("host already has a resource service bound");
        }
        resources
    }

    pub fn manager(&self) -> &Arc<Manager> {
        &self.manager
    }

    pub fn db(&self) -> &Arc<dyn Db> {
        &self.db
    }

    pub fn schema(&self, id: &str) -> Result<Arc<Schema>, ResourceError> {
        self.manager
            .schema(id)
            .filter(|s| !s.is_abstract)
            .ok_or_else(|| ResourceError::wrong_query(format!("Unknown schema '{id}'")))
    }

    fn environment(&self, schema: &Schema) -> Arc<dyn Environment> {
        self.envs.get(&schema.id).unwrap_or_else(|| Arc::new(NullEnvironment))
    }

    /// Runs `step` in a fresh transaction and commits it. Lock contention
    /// restarts the step from the context as it was on entry.
    async fn in_transaction(
        &self,
        ctx: &mut Context,
        env: &Arc<dyn Environment>,
        schema: &Arc<Schema>,
        action: &str,
        step: TxStep<'_>,
    ) -> Result<(), ResourceError> {
        if ctx.transaction().is_some() {
            return Err(extension_failure(ExtensionError::NestedTransaction));
        }
        let options = TxOptions::new(IsolationLevel::for_action(schema, action));
        let entry = ctx.clone();
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut scoped = entry.clone();
            let tx = CachedTransaction::wrap(self.db.begin_tx(&options).await.map_err(db_failure)?);
            scoped.set_transaction(Arc::clone(&tx)).map_err(extension_failure)?;
            let outcome = match self.run_step(&mut scoped, env, schema, step).await {
                Ok(()) => tx
                    .commit()
                    .await
                    .map_err(|e| ResourceError::internal(format!("Commit error: {e}"))),
                Err(err) => Err(err),
            };
            if !tx.closed() {
                if let Err(err) = tx.close().await {
                    warn!(schema = %schema.id, error = %err, "closing transaction failed");
                }
            }
            scoped.take_transaction();
            *ctx = scoped;
            match outcome {
                Err(err) if attempt < DEADLOCK_RETRIES && is_deadlock(&err) => {
                    let pause = rand::thread_rng().gen_range(10..100) * u64::from(attempt);
                    warn!(schema = %schema.id, attempt, error = %err, "deadlock detected, retrying operation");
                    tokio::time::sleep(Duration::from_millis(pause)).await;
                }
                other => return other,
            }
        }
    }

    async fn run_step(
        &self,
        ctx: &mut Context,
        env: &Arc<dyn Environment>,
        schema: &Arc<Schema>,
        step: TxStep<'_>,
    ) -> Result<(), ResourceError> {
        match step {
            TxStep::List {
                filter,
                view,
                paginator,
            } => self.list_in_tx(ctx, env, schema, filter, view, paginator).await,
            TxStep::Show { filter, view } => self.show_in_tx(ctx, env, schema, filter, view).await,
            TxStep::Create => self.create_in_tx(ctx, env, schema).await,
            TxStep::Update { id, filter, data } => self.update_in_tx(ctx, env, schema, id, filter, data).await,
            TxStep::Delete { id, filter, readable } => self.delete_in_tx(ctx, env, schema, id, filter, readable).await,
            TxStep::Action { action, filter } => self.action_in_tx(ctx, env, schema, action, filter).await,
        }
    }

    /// Runs the in-transaction half on the caller's transaction when there
    /// is one, otherwise wraps it in its own.
    async fn transact(
        &self,
        ctx: &mut Context,
        env: &Arc<dyn Environment>,
        schema: &Arc<Schema>,
        action: &str,
        step: TxStep<'_>,
    ) -> Result<(), ResourceError> {
        if ctx.transaction().is_some() {
            self.run_step(ctx, env, schema, step).await
        } else {
            self.in_transaction(ctx, env, schema, action, step).await
        }
    }
}

fn setup(ctx: &mut Context, schema: &Arc<Schema>, path: &str) {
    ctx.set_schema(Arc::clone(schema));
    ctx.insert("path", Value::String(path.to_string()));
}

/// Chained calls skip the hooks that run outside a transaction.
fn chained(ctx: &Context) -> bool {
    ctx.transaction().is_some()
}

async fn fire(env: &Arc<dyn Environment>, event: &str, ctx: &mut Context) -> Result<(), ResourceError> {
    debug!(event, environment = env.name(), "handling event");
    match env.handle_event(event, ctx).await {
        Ok(HookOutcome::Exception(info)) => Err(ResourceError::Extension(info)),
        Ok(_) => Ok(()),
        Err(err) => Err(extension_failure(err)),
    }
}

/// True when a hook left a response map that ends the operation early.
fn responded(ctx: &Context) -> Result<bool, ResourceError> {
    match ctx.response() {
        None => Ok(false),
        Some(Value::Object(_)) => Ok(true),
        Some(other) => Err(ResourceError::internal(format!("extension returned invalid JSON: {other}"))),
    }
}

fn response_map(ctx: &Context) -> Result<&Map<String, Value>, ResourceError> {
    match ctx.response() {
        Some(Value::Object(map)) => Ok(map),
        Some(other) => Err(ResourceError::internal(format!("extension returned invalid JSON: {other}"))),
        None => Err(ResourceError::internal("No response")),
    }
}

fn current_tx(ctx: &Context) -> Result<TxHandle, ResourceError> {
    ctx.transaction()
        .cloned()
        .ok_or_else(|| ResourceError::internal("no transaction in context"))
}

fn set_response_item(ctx: &mut Context, key: &str, value: Value) {
    let mut response = Map::new();
    response.insert(key.to_string(), value);
    ctx.set_response(Value::Object(response));
}

fn extension_failure(err: ExtensionError) -> ResourceError {
    ResourceError::Script(err.to_string())
}

fn db_failure(err: DbError) -> ResourceError {
    ResourceError::internal(err.to_string())
}

/// Only failures raised by the store itself; lock errors that surfaced
/// through an extension are final.
fn is_deadlock(err: &ResourceError) -> bool {
    match err {
        ResourceError::Problem { message, .. } => {
            message.contains("Deadlock found") || message.contains("database is locked")
        }
        _ => false,
    }
}

#[async_trait]
impl ResourceService for Resources {
    async fn list(&self, ctx: &mut Context, schema_id: &str, query: &Query) -> Result<(Vec<Value>, u64), ResourceError> {
        let schema = self.schema(schema_id)?;
        Resources::list(self, ctx, &schema, query).await
    }

    async fn show(&self, ctx: &mut Context, schema_id: &str, id: &str) -> Result<Value, ResourceError> {
        let schema = self.schema(schema_id)?;
        Resources::show(self, ctx, &schema, id).await
    }

    async fn create(&self, ctx: &mut Context, schema_id: &str, data: Map<String, Value>) -> Result<Value, ResourceError> {
        let schema = self.schema(schema_id)?;
        Resources::create(self, ctx, &schema, data).await
    }

    async fn update(
        &self,
        ctx: &mut Context,
        schema_id: &str,
        id: &str,
        data: Map<String, Value>,
    ) -> Result<Value, ResourceError> {
        let schema = self.schema(schema_id)?;
        Resources::update(self, ctx, &schema, id, data).await
    }

    async fn delete(&self, ctx: &mut Context, schema_id: &str, id: &str) -> Result<(), ResourceError> {
        let schema = self.schema(schema_id)?;
        Resources::delete(self, ctx, &schema, id).await
    }

    async fn action(
        &self,
        ctx: &mut Context,
        schema_id: &str,
        action_id: &str,
        id: Option<&str>,
        input: Value,
    ) -> Result<Value, ResourceError> {
        let schema = self.schema(schema_id)?;
        Resources::action(self, ctx, &schema, action_id, id, input).await
    }
}
