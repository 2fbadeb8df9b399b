//! Conversions between JSON values, the host `Context` and Rhai values.

use kura_db::TxHandle;
use rhai::{Dynamic, ImmutableString};
use serde_json::{Map, Number, Value};

use crate::context::Context;

pub const TRANSACTION_KEY: &str = "transaction";
const TYPED_KEYS: [&str; 3] = ["schema", "policy", "auth"];

pub fn to_dynamic(value: &Value) -> Dynamic {
    match value {
        Value::Null => Dynamic::UNIT,
        Value::Bool(b) => Dynamic::from_bool(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Dynamic::from_int(i),
            None => Dynamic::from_float(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => Dynamic::from(ImmutableString::from(s.as_str())),
        Value::Array(items) => Dynamic::from_array(items.iter().map(to_dynamic).collect()),
        Value::Object(map) => Dynamic::from_map(to_rhai_map(map)),
    }
}

pub fn to_rhai_map(map: &Map<String, Value>) -> rhai::Map {
    map.iter().map(|(k, v)| (k.as_str().into(), to_dynamic(v))).collect()
}

/// Host values become JSON; transactions and other opaque handles are
/// dropped to `null`.
pub fn to_json(value: &Dynamic) -> Value {
    let value = value.flatten_clone();
    if value.is_unit() || value.is::<TxHandle>() {
        return Value::Null;
    }
    if let Ok(b) = value.as_bool() {
        return Value::Bool(b);
    }
    if let Ok(i) = value.as_int() {
        return Value::from(i);
    }
    if let Ok(f) = value.as_float() {
        return Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null);
    }
    if let Ok(c) = value.as_char() {
        return Value::String(c.to_string());
    }
    if value.is_string() {
        return Value::String(value.into_string().unwrap_or_default());
    }
    if value.is_array() {
        return match value.try_cast::<rhai::Array>() {
            Some(items) => Value::Array(items.iter().map(to_json).collect()),
            None => Value::Null,
        };
    }
    if value.is_map() {
        return match value.try_cast::<rhai::Map>() {
            Some(map) => Value::Object(map_to_json(&map)),
            None => Value::Null,
        };
    }
    Value::String(value.to_string())
}

pub fn map_to_json(map: &rhai::Map) -> Map<String, Value> {
    map.iter().map(|(k, v)| (k.to_string(), to_json(v))).collect()
}

/// The transaction handle stored under `transaction`, if any.
pub fn transaction_of(map: &rhai::Map) -> Option<TxHandle> {
    map.get(TRANSACTION_KEY)
        .and_then(|v| v.flatten_clone().try_cast::<TxHandle>())
}

pub fn context_to_map(ctx: &Context) -> rhai::Map {
    let mut map = to_rhai_map(ctx.values());
    map.insert(
        TRANSACTION_KEY.into(),
        ctx.transaction().cloned().map(Dynamic::from).unwrap_or(Dynamic::UNIT),
    );
    if let Some(schema) = ctx.schema() {
        map.insert("schema".into(), to_dynamic(&schema.to_value()));
    }
    if let Some(policy) = ctx.policy() {
        map.insert("policy".into(), to_dynamic(&policy.raw));
    }
    if let Some(auth) = ctx.auth() {
        if let Ok(value) = serde_json::to_value(auth) {
            map.insert("auth".into(), to_dynamic(&value));
        }
    }
    map
}

/// Writes a handler's context map back. Typed entries are not overwritten
/// from script values; a transaction the script opened is adopted only when
/// none was attached.
pub fn apply_map(ctx: &mut Context, map: rhai::Map) {
    let mut values = Map::new();
    for (key, value) in map {
        match key.as_str() {
            TRANSACTION_KEY => {
                if ctx.transaction().is_none() {
                    if let Some(tx) = value.flatten().try_cast::<TxHandle>() {
                        ctx.replace_transaction(tx);
                    }
                }
            }
            k if TYPED_KEYS.contains(&k) => {}
            k => {
                values.insert(k.to_string(), to_json(&value));
            }
        }
    }
    ctx.replace_values(values);
}
