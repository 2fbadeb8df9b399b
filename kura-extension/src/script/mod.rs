//! Rhai-backed environment.
//!
//! Scripts run on the blocking pool. Builtins that perform I/O block on the
//! tokio handle and race the environment's interrupt, which the per-event
//! timer triggers; the interpreter also polls it between operations.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use kura_db::TxHandle;
use kura_schema::{Authorization, Extension};
use kura_types::ExceptionInfo;
use rhai::{CallFnOptions, Dynamic, Engine, EvalAltResult, FnPtr, Position, Scope, AST};
use serde_json::Value;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use crate::environment::{Environment, HookOutcome};
use crate::globals::GlobalStore;
use crate::host::Host;
use crate::{Context, ExtensionError};

pub mod builtins;
pub mod convert;
mod interrupt;

use interrupt::Interrupt;

const RESPONSE_CODE: &str = crate::context::RESPONSE_CODE;

/// State shared by one interpreter and the builtins registered into it.
pub struct EnvState {
    pub name: String,
    pub host: Arc<Host>,
    /// Globals shared by every clone of the same environment.
    pub globals: Arc<GlobalStore>,
    handlers: Mutex<HashMap<String, Vec<FnPtr>>>,
    interrupt: Arc<Interrupt>,
    auth: Mutex<Option<Authorization>>,
    ambient_tx: Mutex<Option<TxHandle>>,
}

impl EnvState {
    fn new(name: String, host: Arc<Host>, globals: Arc<GlobalStore>) -> Self {
        Self {
            name,
            host,
            globals,
            handlers: Mutex::new(HashMap::new()),
            interrupt: Arc::new(Interrupt::default()),
            auth: Mutex::new(None),
            ambient_tx: Mutex::new(None),
        }
    }

    pub fn add_handler(&self, event: &str, handler: FnPtr) {
        if let Ok(mut handlers) = self.handlers.lock() {
            handlers.entry(event.to_string()).or_default().push(handler);
        }
    }

    fn clear_handlers(&self) {
        if let Ok(mut handlers) = self.handlers.lock() {
            handlers.clear();
        }
    }

    pub fn handlers_for(&self, event: &str) -> Vec<FnPtr> {
        self.handlers
            .lock()
            .ok()
            .and_then(|h| h.get(event).cloned())
            .unwrap_or_default()
    }

    /// Identity of the request currently being handled.
    pub fn auth(&self) -> Option<Authorization> {
        self.auth.lock().ok().and_then(|a| a.clone())
    }

    fn set_auth(&self, auth: Option<Authorization>) {
        if let Ok(mut slot) = self.auth.lock() {
            *slot = auth;
        }
    }

    /// Transaction of the pipeline step whose event is being handled.
    pub fn ambient_transaction(&self) -> Option<TxHandle> {
        self.ambient_tx
            .lock()
            .ok()
            .and_then(|tx| tx.clone())
            .filter(|tx| !tx.closed())
    }

    fn set_ambient_transaction(&self, tx: Option<TxHandle>) {
        if let Ok(mut slot) = self.ambient_tx.lock() {
            *slot = tx;
        }
    }

    /// Drives `fut` to completion unless the environment is interrupted first.
    pub fn block_on<F: Future>(&self, fut: F) -> Result<F::Output, Box<EvalAltResult>> {
        let handle = Handle::try_current().map_err(|e| runtime_error(format!("no async runtime: {e}")))?;
        let interrupt = self.interrupt.clone();
        handle.block_on(async move {
            tokio::select! {
                out = fut => Ok(out),
                _ = interrupt.cancelled() => Err(terminated()),
            }
        })
    }

    /// Result supplied by the call interceptor in place of `function`.
    pub fn intercept(&self, function: &str, args: &[Dynamic]) -> Option<Result<Dynamic, Box<EvalAltResult>>> {
        let interceptor = self.host.interceptor.as_ref()?;
        interceptor
            .intercept(function, args)
            .map(|r| r.map_err(|msg| runtime_error(msg)))
    }
}

pub fn runtime_error(message: impl Into<String>) -> Box<EvalAltResult> {
    EvalAltResult::ErrorRuntime(Dynamic::from(message.into()), Position::NONE).into()
}

/// Throws `value` as a script-level exception.
pub fn throw(value: &Value) -> Box<EvalAltResult> {
    EvalAltResult::ErrorRuntime(convert::to_dynamic(value), Position::NONE).into()
}

fn terminated() -> Box<EvalAltResult> {
    EvalAltResult::ErrorTerminated(Dynamic::from("timeout".to_string()), Position::NONE).into()
}

fn is_terminated(err: &EvalAltResult) -> bool {
    match err {
        EvalAltResult::ErrorTerminated(..) => true,
        EvalAltResult::ErrorInFunctionCall(_, _, inner, _) | EvalAltResult::ErrorInModule(_, inner, _) => {
            is_terminated(inner)
        }
        _ => false,
    }
}

/// The typed exception carried by a script throw.
fn thrown_exception(err: &EvalAltResult) -> Option<ExceptionInfo> {
    match err {
        EvalAltResult::ErrorRuntime(value, _) => {
            let json = convert::to_json(value);
            json.get("name").and_then(Value::as_str)?;
            ExceptionInfo::from_value(&json)
        }
        EvalAltResult::ErrorInFunctionCall(_, _, inner, _) | EvalAltResult::ErrorInModule(_, inner, _) => {
            thrown_exception(inner)
        }
        _ => None,
    }
}

fn script_error(event: &str, err: &EvalAltResult) -> ExtensionError {
    if is_terminated(err) {
        ExtensionError::Timeout(event.to_string())
    } else {
        ExtensionError::Script {
            event: event.to_string(),
            message: err.to_string(),
        }
    }
}

enum Dispatch {
    NotHandled,
    Done {
        context: rhai::Map,
        exception: Option<ExceptionInfo>,
    },
}

struct Runtime {
    engine: Engine,
    ast: AST,
}

impl Runtime {
    fn build(state: &Arc<EnvState>, codes: &[(String, String)]) -> Result<Self, ExtensionError> {
        state.clear_handlers();
        let mut engine = Engine::new();
        let interrupt = state.interrupt.clone();
        engine.on_progress(move |_| interrupt.is_set().then(|| Dynamic::from("timeout".to_string())));
        let name = state.name.clone();
        engine.on_print(move |s| info!(target: "extension", env = %name, "{s}"));
        let name = state.name.clone();
        engine.on_debug(move |s, _, pos| debug!(target: "extension", env = %name, %pos, "{s}"));
        builtins::register_all(&mut engine, state);
        for module in &state.host.modules {
            module.register(&mut engine, state);
        }

        let mut ast = AST::empty();
        for (name, code) in codes {
            let part = engine.compile(code).map_err(|e| ExtensionError::Compile {
                name: name.clone(),
                message: e.to_string(),
            })?;
            ast = ast.merge(&part);
        }
        engine
            .run_ast_with_scope(&mut Scope::new(), &ast)
            .map_err(|e| script_error("init", &e))?;
        Ok(Self { engine, ast })
    }

    fn dispatch(&self, state: &EnvState, event: &str, context: rhai::Map) -> Result<Dispatch, ExtensionError> {
        let handlers = state.handlers_for(event);
        if handlers.is_empty() {
            return Ok(Dispatch::NotHandled);
        }
        let mut current = context;
        for handler in handlers {
            let out = handler.call::<Dynamic>(&self.engine, &self.ast, (Dynamic::from_map(current.clone()),));
            match out {
                Ok(value) => {
                    if let Some(map) = value.flatten().try_cast::<rhai::Map>() {
                        current = map;
                    }
                }
                Err(err) => {
                    if let Some(info) = thrown_exception(&err) {
                        return Ok(Dispatch::Done {
                            context: current,
                            exception: Some(info),
                        });
                    }
                    return Err(script_error(event, &err));
                }
            }
            if let Some(code) = current.get(RESPONSE_CODE).filter(|c| !c.is_unit()) {
                let code = code.as_int().unwrap_or(400).clamp(0, u16::MAX as i64) as u16;
                let message = current
                    .get(crate::context::RESPONSE)
                    .map(|r| match convert::to_json(r) {
                        Value::String(s) => s,
                        other => other.to_string(),
                    })
                    .unwrap_or_default();
                current.remove(RESPONSE_CODE);
                return Ok(Dispatch::Done {
                    context: current,
                    exception: Some(ExceptionInfo::custom(message, code)),
                });
            }
        }
        Ok(Dispatch::Done {
            context: current,
            exception: None,
        })
    }

    fn call(&self, name: &str) -> Result<Dynamic, Box<EvalAltResult>> {
        let options = CallFnOptions::new().eval_ast(false);
        self.engine
            .call_fn_with_options::<Dynamic>(options, &mut Scope::new(), &self.ast, name, ())
    }

    fn function_names(&self) -> Vec<String> {
        self.ast.iter_functions().map(|f| f.name.to_string()).collect()
    }
}

/// An environment whose hooks are Rhai scripts.
pub struct ScriptEnvironment {
    name: String,
    codes: Arc<Vec<(String, String)>>,
    host: Arc<Host>,
    globals: Arc<GlobalStore>,
    state: Arc<EnvState>,
    runtime: Arc<tokio::sync::Mutex<Option<Runtime>>>,
}

impl ScriptEnvironment {
    /// `codes` pairs a name used in error messages with the script source.
    /// Every script is compiled once here so syntax errors surface early.
    pub fn new(name: impl Into<String>, host: Arc<Host>, codes: Vec<(String, String)>) -> Result<Self, ExtensionError> {
        let name = name.into();
        let engine = Engine::new_raw();
        for (code_name, code) in &codes {
            engine.compile(code).map_err(|e| ExtensionError::Compile {
                name: code_name.clone(),
                message: e.to_string(),
            })?;
        }
        Ok(Self::with_globals(name, host, Arc::new(codes), Arc::new(GlobalStore::new())))
    }

    pub fn from_extensions(name: impl Into<String>, host: Arc<Host>, extensions: &[Arc<Extension>]) -> Result<Self, ExtensionError> {
        let mut codes = Vec::with_capacity(extensions.len());
        for ext in extensions {
            if ext.code_type != kura_schema::extension::DEFAULT_CODE_TYPE {
                warn!(extension = %ext.id, code_type = %ext.code_type, "skipping extension with unsupported code type");
                continue;
            }
            codes.push((ext.id.clone(), ext.code.clone()));
        }
        Self::new(name, host, codes)
    }

    fn with_globals(name: String, host: Arc<Host>, codes: Arc<Vec<(String, String)>>, globals: Arc<GlobalStore>) -> Self {
        let state = Arc::new(EnvState::new(name.clone(), host.clone(), globals.clone()));
        Self {
            name,
            codes,
            host,
            globals,
            state,
            runtime: Arc::new(tokio::sync::Mutex::new(None)),
        }
    }

    pub fn host(&self) -> &Arc<Host> {
        &self.host
    }

    /// Runs `f` against the interpreter on the blocking pool, building it first
    /// when needed, under the time limit for `label`.
    async fn with_runtime<T, F>(
        &self,
        label: &str,
        auth: Option<Authorization>,
        tx: Option<TxHandle>,
        f: F,
    ) -> Result<T, ExtensionError>
    where
        T: Send + 'static,
        F: FnOnce(&Runtime, &Arc<EnvState>) -> Result<T, ExtensionError> + Send + 'static,
    {
        let mut slot = self.runtime.lock().await;
        let state = self.state.clone();
        let codes = self.codes.clone();
        let runtime = slot.take();
        let limit = self.host.limits.limit_for(label);

        state.interrupt.reset();
        state.set_auth(auth);
        state.set_ambient_transaction(tx);
        let timer = tokio::spawn({
            let interrupt = state.interrupt.clone();
            async move {
                tokio::time::sleep(limit).await;
                interrupt.trigger();
            }
        });

        let task = tokio::task::spawn_blocking(move || {
            let runtime = match runtime {
                Some(rt) => rt,
                None => match Runtime::build(&state, &codes) {
                    Ok(rt) => rt,
                    Err(e) => return (None, Err(e)),
                },
            };
            let out = f(&runtime, &state);
            (Some(runtime), out)
        });
        let joined = task.await;
        timer.abort();
        self.state.set_auth(None);
        self.state.set_ambient_transaction(None);

        match joined {
            Ok((runtime, out)) => {
                *slot = runtime;
                out
            }
            Err(e) => Err(ExtensionError::Runtime(format!("extension task failed: {e}"))),
        }
    }

    /// Calls a script-level function by name with no arguments.
    pub async fn call_function(&self, name: &str) -> Result<Value, ExtensionError> {
        let fn_name = name.to_string();
        self.with_runtime(name, None, None, move |rt, _| {
            rt.call(&fn_name)
                .map(|v| convert::to_json(&v))
                .map_err(|e| match thrown_exception(&e) {
                    Some(info) => ExtensionError::Script {
                        event: fn_name.clone(),
                        message: info.to_string(),
                    },
                    None => script_error(&fn_name, &e),
                })
        })
        .await
    }

    /// Names of the functions defined by the loaded scripts.
    pub async fn function_names(&self) -> Result<Vec<String>, ExtensionError> {
        self.with_runtime("init", None, None, |rt, _| Ok(rt.function_names())).await
    }
}

#[async_trait]
impl Environment for ScriptEnvironment {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle_event(&self, event: &str, ctx: &mut Context) -> Result<HookOutcome, ExtensionError> {
        debug!(env = %self.name, event, "dispatching event");
        let map = convert::context_to_map(ctx);
        let event_name = event.to_string();
        let dispatched = self
            .with_runtime(event, ctx.auth().cloned(), ctx.transaction().cloned(), move |rt, state| {
                rt.dispatch(state, &event_name, map)
            })
            .await?;
        match dispatched {
            Dispatch::NotHandled => Ok(HookOutcome::NotHandled),
            Dispatch::Done { context, exception } => {
                convert::apply_map(ctx, context);
                if let Some(info) = exception {
                    debug!(env = %self.name, event, exception = %info, "extension raised exception");
                    ctx.set_exception(event, &info);
                    return Ok(HookOutcome::Exception(info));
                }
                Ok(match ctx.response() {
                    Some(response) => HookOutcome::Responded(response.clone()),
                    None => HookOutcome::Completed,
                })
            }
        }
    }

    fn clone_env(&self) -> Arc<dyn Environment> {
        Arc::new(Self::with_globals(
            self.name.clone(),
            self.host.clone(),
            self.codes.clone(),
            self.globals.clone(),
        ))
    }
}
