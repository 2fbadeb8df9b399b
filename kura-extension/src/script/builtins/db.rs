//! Raw database builtins. Each takes a transaction or `()`. With `()` the call
//! joins the transaction of the pipeline step being handled, if any; otherwise
//! it opens its own transaction and commits it on success.

use std::future::Future;
use std::sync::Arc;

use kura_db::{Db, DbError, IsolationLevel, Resource, ResourceState, TxHandle, TxOptions};
use kura_filter::Filter;
use kura_schema::Schema;
use rhai::{Dynamic, Engine, EvalAltResult};
use serde_json::{Map, Value};

use crate::script::convert::{map_to_json, to_dynamic, to_json};
use crate::script::{runtime_error, EnvState};

type RhaiResult<T> = Result<T, Box<EvalAltResult>>;

fn db_of(state: &EnvState) -> RhaiResult<Arc<dyn Db>> {
    state
        .host
        .db
        .clone()
        .ok_or_else(|| runtime_error("no database is configured for extensions"))
}

fn schema_of(state: &EnvState, id: &str) -> RhaiResult<Arc<Schema>> {
    state
        .host
        .manager
        .schema(id)
        .ok_or_else(|| runtime_error(format!("Unknown schema '{id}'")))
}

fn tx_arg(tx: &Dynamic) -> RhaiResult<Option<TxHandle>> {
    let tx = tx.flatten_clone();
    if tx.is_unit() {
        return Ok(None);
    }
    tx.try_cast::<TxHandle>()
        .map(Some)
        .ok_or_else(|| runtime_error("expected a transaction or ()"))
}

fn db_err(err: DbError) -> Box<EvalAltResult> {
    runtime_error(err.to_string())
}

async fn within<T, F, Fut>(db: Arc<dyn Db>, f: F) -> Result<T, DbError>
where
    F: FnOnce(TxHandle) -> Fut,
    Fut: Future<Output = Result<T, DbError>>,
{
    let tx = db.begin().await?;
    match f(tx.clone()).await {
        Ok(out) => {
            tx.commit().await?;
            Ok(out)
        }
        Err(e) => {
            let _ = tx.close().await;
            Err(e)
        }
    }
}

/// Runs `f` inside the given, the ambient or a fresh transaction.
fn run<T, F, Fut>(state: &EnvState, tx: &Dynamic, f: F) -> RhaiResult<T>
where
    F: FnOnce(TxHandle) -> Fut,
    Fut: Future<Output = Result<T, DbError>>,
{
    let tx = tx_arg(tx)?.or_else(|| state.ambient_transaction());
    let db = match tx {
        Some(_) => None,
        None => Some(db_of(state)?),
    };
    state
        .block_on(async move {
            match (tx, db) {
                (Some(tx), _) => f(tx).await,
                (None, Some(db)) => within(db, f).await,
                (None, None) => Err(DbError::Closed),
            }
        })?
        .map_err(db_err)
}

fn id_filter(id: &str, tenant_id: &str) -> Filter {
    let filter = Filter::eq("id", Value::String(id.to_string()));
    if tenant_id.is_empty() {
        filter
    } else {
        filter.and_with(Filter::eq("tenant_id", Value::String(tenant_id.to_string())))
    }
}

fn resources_to_array(rows: Vec<Resource>) -> rhai::Array {
    rows.into_iter()
        .map(|r| to_dynamic(&Value::Object(r.into_data())))
        .collect()
}

fn state_from_map(data: &Map<String, Value>) -> ResourceState {
    let text = |keys: &[&str]| {
        keys.iter()
            .find_map(|k| data.get(*k).and_then(Value::as_str))
            .unwrap_or_default()
            .to_string()
    };
    let int = |key: &str, default: i64| data.get(key).and_then(Value::as_i64).unwrap_or(default);
    ResourceState {
        config_version: int("config_version", 1),
        state_version: int("state_version", 0),
        error: text(&["state_error", "error"]),
        state: text(&["state"]),
        monitoring: text(&["state_monitoring", "monitoring"]),
    }
}

pub(super) fn register(engine: &mut Engine, state: &Arc<EnvState>) {
    let st = state.clone();
    engine.register_fn("db_transaction", move || -> RhaiResult<Dynamic> {
        if let Some(out) = st.intercept("db_transaction", &[]) {
            return out;
        }
        let db = db_of(&st)?;
        let tx = st.block_on(async move { db.begin().await })?.map_err(db_err)?;
        Ok(Dynamic::from(tx))
    });

    let st = state.clone();
    engine.register_fn("db_transaction", move |level: &str| -> RhaiResult<Dynamic> {
        if let Some(out) = st.intercept("db_transaction", &[Dynamic::from(level.to_string())]) {
            return out;
        }
        let level = IsolationLevel::parse(level).ok_or_else(|| runtime_error(format!("unknown isolation level {level}")))?;
        let db = db_of(&st)?;
        let tx = st
            .block_on(async move { db.begin_tx(&TxOptions::new(level)).await })?
            .map_err(db_err)?;
        Ok(Dynamic::from(tx))
    });

    let st = state.clone();
    engine.register_fn("db_commit", move |tx: TxHandle| -> RhaiResult<()> {
        st.block_on(async move { tx.commit().await })?.map_err(db_err)
    });

    let st = state.clone();
    engine.register_fn("db_close", move |tx: TxHandle| -> RhaiResult<()> {
        st.block_on(async move { tx.close().await })?.map_err(db_err)
    });

    engine.register_fn("db_closed", |tx: TxHandle| tx.closed());
    engine.register_fn("db_isolation_level", |tx: TxHandle| tx.isolation_level().to_string());

    let st = state.clone();
    engine.register_fn("db_list", move |tx: Dynamic, schema_id: &str, filter: rhai::Map| -> RhaiResult<rhai::Array> {
        let schema = schema_of(&st, schema_id)?;
        let filter = Filter::from_value(&Value::Object(map_to_json(&filter))).map_err(|e| runtime_error(e.to_string()))?;
        let rows = run(&st, &tx, move |tx| async move { tx.list(&schema, &filter, None, None).await })?;
        Ok(resources_to_array(rows.0))
    });

    let st = state.clone();
    engine.register_fn(
        "db_fetch",
        move |tx: Dynamic, schema_id: &str, id: &str, tenant_id: &str| -> RhaiResult<Dynamic> {
            let schema = schema_of(&st, schema_id)?;
            let filter = id_filter(id, tenant_id);
            let row = run(&st, &tx, move |tx| async move { tx.fetch(&schema, &filter, None).await })?;
            Ok(to_dynamic(&Value::Object(row.into_data())))
        },
    );

    let st = state.clone();
    engine.register_fn(
        "db_state_fetch",
        move |tx: Dynamic, schema_id: &str, id: &str, tenant_id: &str| -> RhaiResult<Dynamic> {
            let schema = schema_of(&st, schema_id)?;
            let filter = id_filter(id, tenant_id);
            let state = run(&st, &tx, move |tx| async move { tx.state_fetch(&schema, &filter).await })?;
            serde_json::to_value(&state)
                .map(|v| to_dynamic(&v))
                .map_err(|e| runtime_error(e.to_string()))
        },
    );

    let st = state.clone();
    engine.register_fn("db_create", move |tx: Dynamic, schema_id: &str, data: rhai::Map| -> RhaiResult<()> {
        let resource = Resource::new(schema_of(&st, schema_id)?, map_to_json(&data));
        run(&st, &tx, move |tx| async move { tx.create(&resource).await })
    });

    let st = state.clone();
    engine.register_fn("db_update", move |tx: Dynamic, schema_id: &str, data: rhai::Map| -> RhaiResult<()> {
        let resource = Resource::new(schema_of(&st, schema_id)?, map_to_json(&data));
        run(&st, &tx, move |tx| async move { tx.update(&resource).await })
    });

    let st = state.clone();
    engine.register_fn(
        "db_state_update",
        move |tx: Dynamic, schema_id: &str, data: rhai::Map| -> RhaiResult<()> {
            let data = map_to_json(&data);
            let state = state_from_map(&data);
            let resource = Resource::new(schema_of(&st, schema_id)?, data);
            run(&st, &tx, move |tx| async move { tx.state_update(&resource, Some(&state)).await })
        },
    );

    let st = state.clone();
    engine.register_fn("db_delete", move |tx: Dynamic, schema_id: &str, id: &str| -> RhaiResult<()> {
        let schema = schema_of(&st, schema_id)?;
        let id = id.to_string();
        run(&st, &tx, move |tx| async move { tx.delete(&schema, &id).await })
    });

    let st = state.clone();
    engine.register_fn(
        "db_query",
        move |tx: Dynamic, schema_id: &str, sql: &str, args: rhai::Array| -> RhaiResult<rhai::Array> {
            let schema = schema_of(&st, schema_id)?;
            let sql = sql.to_string();
            let args: Vec<Value> = args.iter().map(to_json).collect();
            let rows = run(&st, &tx, move |tx| async move { tx.query(&schema, &sql, &args).await })?;
            Ok(resources_to_array(rows))
        },
    );
}
