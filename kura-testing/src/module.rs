//! Builtins available to test scripts only.

use std::sync::{Arc, Mutex};

use kura_db::{IsolationLevel, TxHandle, TxOptions};
use kura_extension::script::convert::{to_dynamic, to_json};
use kura_extension::script::{runtime_error, EnvState};
use kura_extension::Module;
use kura_types::ExceptionInfo;
use rhai::{Dynamic, Engine, EvalAltResult, NativeCallContext};
use serde_json::Value;

use crate::mock::MockRegistry;

type RhaiResult<T> = Result<T, Box<EvalAltResult>>;

/// Pending registration started by `mock(name)`.
#[derive(Clone)]
pub struct MockCall {
    registry: Arc<MockRegistry>,
    name: String,
    args: Option<Vec<Value>>,
}

pub struct TestingModule {
    registry: Arc<MockRegistry>,
    tx: Arc<Mutex<Option<TxHandle>>>,
}

impl TestingModule {
    pub fn new(registry: Arc<MockRegistry>) -> Self {
        Self {
            registry,
            tx: Arc::new(Mutex::new(None)),
        }
    }

    /// The transaction `MockTransaction()` hands out, if one was opened.
    pub fn take_transaction(&self) -> Option<TxHandle> {
        self.tx.lock().ok().and_then(|mut slot| slot.take())
    }
}

fn thrown(err: &EvalAltResult) -> Option<ExceptionInfo> {
    match err {
        EvalAltResult::ErrorRuntime(value, _) => ExceptionInfo::from_value(&to_json(value)),
        EvalAltResult::ErrorInFunctionCall(_, _, inner, _) => thrown(inner),
        _ => None,
    }
}

fn open_transaction(
    state: &EnvState,
    slot: &Mutex<Option<TxHandle>>,
    fresh: bool,
    level: Option<&str>,
) -> RhaiResult<Dynamic> {
    let mut slot = slot.lock().map_err(|_| runtime_error("transaction slot poisoned"))?;
    if !fresh {
        if let Some(tx) = slot.as_ref().filter(|tx| !tx.closed()) {
            return Ok(Dynamic::from(Arc::clone(tx)));
        }
    }
    let db = state
        .host
        .db
        .clone()
        .ok_or_else(|| runtime_error("no database configured for this test"))?;
    let level = match level {
        Some(name) => IsolationLevel::parse(name).ok_or_else(|| runtime_error(format!("unknown isolation level {name}")))?,
        None => IsolationLevel::RepeatableRead,
    };
    let tx = state
        .block_on(async move { db.begin_tx(&TxOptions::new(level)).await })?
        .map_err(|e| runtime_error(e.to_string()))?;
    *slot = Some(Arc::clone(&tx));
    Ok(Dynamic::from(tx))
}

impl Module for TestingModule {
    fn name(&self) -> &str {
        "testing"
    }

    fn register(&self, engine: &mut Engine, state: &Arc<EnvState>) {
        engine.register_type_with_name::<MockCall>("MockCall");

        let registry = self.registry.clone();
        engine.register_fn("mock", move |name: &str| -> RhaiResult<MockCall> {
            registry.declare(name).map_err(runtime_error)?;
            Ok(MockCall {
                registry: registry.clone(),
                name: name.to_string(),
                args: None,
            })
        });
        engine.register_fn("expect", |call: &mut MockCall, args: rhai::Array| -> MockCall {
            call.args = Some(args.iter().map(to_json).collect());
            call.clone()
        });
        engine.register_fn("returns", |call: &mut MockCall, response: Dynamic| -> RhaiResult<()> {
            call.registry
                .push(&call.name, call.args.clone(), response, false)
                .map_err(runtime_error)
        });
        engine.register_fn("throws", |call: &mut MockCall, message: &str| -> RhaiResult<()> {
            call.registry
                .push(&call.name, call.args.clone(), Dynamic::from(message.to_string()), true)
                .map_err(runtime_error)
        });

        let (st, slot) = (state.clone(), self.tx.clone());
        engine.register_fn("MockTransaction", move || open_transaction(&st, &slot, false, None));
        let (st, slot) = (state.clone(), self.tx.clone());
        engine.register_fn("MockTransaction", move |fresh: bool| open_transaction(&st, &slot, fresh, None));
        let (st, slot) = (state.clone(), self.tx.clone());
        engine.register_fn("MockTransaction", move |fresh: bool, level: &str| {
            open_transaction(&st, &slot, fresh, Some(level))
        });

        // Runs the handlers for `event` like the pipeline does: a typed
        // exception ends the chain and is stored in the returned context.
        let st = state.clone();
        engine.register_fn(
            "kura_trigger",
            move |ctx: NativeCallContext, event: &str, context: rhai::Map| -> RhaiResult<rhai::Map> {
                let mut current = context;
                for handler in st.handlers_for(event) {
                    match handler.call_within_context::<Dynamic>(&ctx, (Dynamic::from_map(current.clone()),)) {
                        Ok(out) => {
                            if let Some(map) = out.flatten().try_cast::<rhai::Map>() {
                                current = map;
                            }
                        }
                        Err(err) => match thrown(&err) {
                            Some(info) => {
                                current.insert("exception".into(), to_dynamic(&info.to_value()));
                                return Ok(current);
                            }
                            None => return Err(err),
                        },
                    }
                }
                Ok(current)
            },
        );

        engine.register_fn("assert_eq", |left: Dynamic, right: Dynamic| -> RhaiResult<()> {
            let (l, r) = (to_json(&left), to_json(&right));
            if l == r {
                Ok(())
            } else {
                Err(runtime_error(format!("assertion failed: {l} != {r}")))
            }
        });
        engine.register_fn("assert_true", |cond: bool, message: &str| -> RhaiResult<()> {
            if cond {
                Ok(())
            } else {
                Err(runtime_error(format!("assertion failed: {message}")))
            }
        });
        engine.register_fn("fail", |message: &str| -> RhaiResult<()> {
            Err(runtime_error(message.to_string()))
        });
    }
}
