use std::sync::Arc;
use std::time::Duration;

use handlebars::Handlebars;
use kura_db::TxHandle;
use kura_types::ResourceProblem;
use rhai::{Dynamic, Engine, EvalAltResult, FnPtr, ImmutableString, NativeCallContext};
use serde_json::{json, Value};

use crate::globals::GlobalMap;
use crate::script::convert::{to_dynamic, to_json};
use crate::script::{runtime_error, EnvState};

type RhaiResult<T> = Result<T, Box<EvalAltResult>>;

/// Map form of a typed exception, as scripts throw it.
pub fn exception(name: &str, message: &str, extra: Value) -> rhai::Map {
    let mut value = json!({"name": name, "message": message});
    if let (Value::Object(base), Value::Object(extra)) = (&mut value, extra) {
        base.extend(extra);
    }
    match to_dynamic(&value).try_cast::<rhai::Map>() {
        Some(map) => map,
        None => rhai::Map::new(),
    }
}

pub(super) fn register(engine: &mut Engine, state: &Arc<EnvState>) {
    engine.register_type_with_name::<TxHandle>("Transaction");
    register_globals(engine, state);
    register_events(engine, state);
    register_registry(engine, state);
    register_utilities(engine, state);
    register_exceptions(engine);
}

fn register_globals(engine: &mut Engine, state: &Arc<EnvState>) {
    engine
        .register_type_with_name::<GlobalMap>("GlobalMap")
        .register_fn("get", |m: &mut GlobalMap, key: &str| m.get(key))
        .register_fn("set", |m: &mut GlobalMap, key: &str, value: Dynamic| m.set(key, value))
        .register_fn("remove", |m: &mut GlobalMap, key: &str| m.remove(key))
        .register_fn("contains", |m: &mut GlobalMap, key: &str| m.contains(key))
        .register_fn("keys", |m: &mut GlobalMap| m.keys())
        .register_fn("len", |m: &mut GlobalMap| m.len() as i64)
        .register_indexer_get(|m: &mut GlobalMap, key: ImmutableString| m.get(&key))
        .register_indexer_set(|m: &mut GlobalMap, key: ImmutableString, value: Dynamic| m.set(&key, value));

    let st = state.clone();
    engine.register_fn("kura_global", move |name: &str| st.globals.map(name));
    let st = state.clone();
    engine.register_fn("kura_process_global", move |name: &str| st.host.process_globals.map(name));
}

fn register_events(engine: &mut Engine, state: &Arc<EnvState>) {
    let st = state.clone();
    engine.register_fn("register_handler", move |event: &str, handler: FnPtr| {
        st.add_handler(event, handler);
    });

    let st = state.clone();
    engine.register_fn(
        "trigger_event",
        move |ctx: NativeCallContext, event: &str, context: rhai::Map| -> RhaiResult<rhai::Map> {
            let mut current = context;
            for handler in st.handlers_for(event) {
                let out = handler.call_within_context::<Dynamic>(&ctx, (Dynamic::from_map(current.clone()),))?;
                if let Some(map) = out.flatten().try_cast::<rhai::Map>() {
                    current = map;
                }
            }
            Ok(current)
        },
    );
}

fn register_registry(engine: &mut Engine, state: &Arc<EnvState>) {
    let st = state.clone();
    engine.register_fn("schemas", move || -> rhai::Array {
        st.host
            .manager
            .schemas()
            .iter()
            .map(|s| to_dynamic(&s.to_value()))
            .collect()
    });

    let st = state.clone();
    engine.register_fn("schema_url", move |id: &str| -> Dynamic {
        match st.host.manager.schema(id) {
            Some(schema) => Dynamic::from(schema.url.clone()),
            None => Dynamic::UNIT,
        }
    });

    let st = state.clone();
    engine.register_fn("policies", move || -> rhai::Array {
        st.host
            .manager
            .policies()
            .iter()
            .map(|p| to_dynamic(&p.raw))
            .collect()
    });
}

fn register_utilities(engine: &mut Engine, state: &Arc<EnvState>) {
    engine.register_fn("uuid", || uuid::Uuid::new_v4().to_string());

    let st = state.clone();
    engine.register_fn("sleep", move |ms: i64| -> RhaiResult<()> {
        st.block_on(tokio::time::sleep(Duration::from_millis(ms.max(0) as u64)))
    });

    engine.register_fn("template", |template: &str, data: Dynamic| -> RhaiResult<String> {
        let mut hb = Handlebars::new();
        hb.register_escape_fn(handlebars::no_escape);
        hb.render_template(template, &to_json(&data))
            .map_err(|e| runtime_error(format!("template: {e}")))
    });

    let st = state.clone();
    engine.register_fn("config", move |key: &str, default: Dynamic| -> RhaiResult<Dynamic> {
        if let Some(out) = st.intercept("config", &[Dynamic::from(key.to_string()), default.clone()]) {
            return out;
        }
        Ok(st.host.config_value(key).map(to_dynamic).unwrap_or(default))
    });
}

fn register_exceptions(engine: &mut Engine) {
    engine.register_fn("BaseException", |msg: &str| exception("BaseException", msg, Value::Null));
    engine.register_fn("CustomException", |msg: &str, code: i64| {
        exception("CustomException", msg, json!({"code": code}))
    });
    engine.register_fn("NotFoundException", |msg: &str| {
        exception("NotFoundException", msg, json!({"code": 404}))
    });
    engine.register_fn("TimeOutException", |msg: &str| {
        exception("TimeOutException", msg, json!({"code": 503}))
    });
    engine.register_fn("ResourceException", |msg: &str, problem: Dynamic| -> RhaiResult<rhai::Map> {
        let problem = ResourceProblem::from_value(&to_json(&problem))
            .ok_or_else(|| runtime_error(format!("unknown resource problem {problem}")))?;
        Ok(exception("ResourceException", msg, json!({"problem": problem.name()})))
    });
    engine.register_fn("ExtensionException", |msg: &str, inner: rhai::Map| {
        exception(
            "ExtensionException",
            msg,
            json!({"inner_exception": Value::Object(crate::script::convert::map_to_json(&inner))}),
        )
    });
}
