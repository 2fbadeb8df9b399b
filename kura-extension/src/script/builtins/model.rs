//! Chained resource calls. They re-enter the pipeline with the caller's
//! identity and reuse the transaction found in the passed context.

use std::sync::Arc;

use kura_types::{ResourceError, ResourceProblem};
use rhai::{Dynamic, Engine, EvalAltResult};
use serde_json::{json, Value};

use super::exception;
use crate::context::Context;
use crate::script::convert::{map_to_json, to_dynamic, to_json, transaction_of};
use crate::script::{runtime_error, throw, EnvState};
use crate::service::{query_from_map, ResourceService};

type RhaiResult<T> = Result<T, Box<EvalAltResult>>;

fn service_of(state: &EnvState) -> RhaiResult<Arc<dyn ResourceService>> {
    state
        .host
        .service()
        .ok_or_else(|| runtime_error("resource service is not available"))
}

fn chained_context(state: &EnvState, context: &rhai::Map) -> Context {
    let mut ctx = match state.auth() {
        Some(auth) => Context::with_auth(auth),
        None => Context::new(),
    };
    if let Some(tx) = transaction_of(context) {
        ctx.replace_transaction(tx);
    }
    ctx
}

/// Failures surface to scripts as exceptions they can catch.
fn resource_error(err: ResourceError) -> Box<EvalAltResult> {
    match err {
        ResourceError::Extension(info) => throw(&info.to_value()),
        ResourceError::Problem { problem, message } => {
            let map = exception("ResourceException", &message, json!({"problem": problem.name()}));
            throw(&to_json(&Dynamic::from_map(map)))
        }
        ResourceError::Script(message) => {
            let problem = ResourceProblem::InternalServerError.name();
            let map = exception("ResourceException", &message, json!({"problem": problem}));
            throw(&to_json(&Dynamic::from_map(map)))
        }
    }
}

pub(super) fn register(engine: &mut Engine, state: &Arc<EnvState>) {
    let st = state.clone();
    engine.register_fn(
        "model_list",
        move |context: rhai::Map, schema_id: &str, filter: rhai::Map| -> RhaiResult<rhai::Array> {
            let service = service_of(&st)?;
            let mut ctx = chained_context(&st, &context);
            let query = query_from_map(&map_to_json(&filter));
            let (rows, _) = st
                .block_on(async { service.list(&mut ctx, schema_id, &query).await })?
                .map_err(resource_error)?;
            Ok(rows.iter().map(to_dynamic).collect())
        },
    );

    let st = state.clone();
    engine.register_fn(
        "model_fetch",
        move |context: rhai::Map, schema_id: &str, id: &str| -> RhaiResult<Dynamic> {
            let service = service_of(&st)?;
            let mut ctx = chained_context(&st, &context);
            let row = st
                .block_on(async { service.show(&mut ctx, schema_id, id).await })?
                .map_err(resource_error)?;
            Ok(to_dynamic(&row))
        },
    );

    let st = state.clone();
    engine.register_fn(
        "model_create",
        move |context: rhai::Map, schema_id: &str, data: rhai::Map| -> RhaiResult<Dynamic> {
            let service = service_of(&st)?;
            let mut ctx = chained_context(&st, &context);
            let data = map_to_json(&data);
            let row = st
                .block_on(async { service.create(&mut ctx, schema_id, data).await })?
                .map_err(resource_error)?;
            Ok(to_dynamic(&row))
        },
    );

    let st = state.clone();
    engine.register_fn(
        "model_update",
        move |context: rhai::Map, schema_id: &str, id: &str, data: rhai::Map| -> RhaiResult<Dynamic> {
            let service = service_of(&st)?;
            let mut ctx = chained_context(&st, &context);
            let data = map_to_json(&data);
            let row = st
                .block_on(async { service.update(&mut ctx, schema_id, id, data).await })?
                .map_err(resource_error)?;
            Ok(to_dynamic(&row))
        },
    );

    let st = state.clone();
    engine.register_fn(
        "model_delete",
        move |context: rhai::Map, schema_id: &str, id: &str| -> RhaiResult<()> {
            let service = service_of(&st)?;
            let mut ctx = chained_context(&st, &context);
            st.block_on(async { service.delete(&mut ctx, schema_id, id).await })?
                .map_err(resource_error)
        },
    );

    let st = state.clone();
    engine.register_fn(
        "model_action",
        move |context: rhai::Map, schema_id: &str, action_id: &str, id: Dynamic, input: Dynamic| -> RhaiResult<Dynamic> {
            let service = service_of(&st)?;
            let mut ctx = chained_context(&st, &context);
            let id = match to_json(&id) {
                Value::String(s) if !s.is_empty() => Some(s),
                _ => None,
            };
            let input = to_json(&input);
            let out = st
                .block_on(async { service.action(&mut ctx, schema_id, action_id, id.as_deref(), input).await })?
                .map_err(resource_error)?;
            Ok(to_dynamic(&out))
        },
    );
}
