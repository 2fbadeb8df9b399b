//! Declarative mocks for builtins that reach outside the interpreter.
//!
//! A test records, per builtin name, an ordered queue of expected calls.
//! Every call to a mocked builtin consumes the head of its queue: arguments
//! must deep-equal the recorded ones (when any were recorded), and the
//! recorded response is returned or raised. Whatever is left at teardown is
//! a failure.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use kura_extension::script::convert::to_json;
use kura_extension::CallInterceptor;
use rhai::Dynamic;
use serde_json::Value;
use tracing::debug;

/// Builtins the harness can stand in for.
pub const MOCKABLE: [&str; 6] = ["http", "db_transaction", "config", "sync_fetch", "sync_watch", "exec"];

#[derive(Clone)]
struct Expectation {
    args: Option<Vec<Value>>,
    response: Dynamic,
    raise: bool,
}

#[derive(Default)]
struct Queues {
    mocked: HashSet<String>,
    pending: HashMap<String, VecDeque<Expectation>>,
    failures: Vec<String>,
}

#[derive(Default)]
pub struct MockRegistry {
    queues: Mutex<Queues>,
}

impl MockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<T>(&self, f: impl FnOnce(&mut Queues) -> T) -> T {
        let mut guard = match self.queues.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    /// Marks `name` as mocked without queueing a call; any call then fails.
    pub fn declare(&self, name: &str) -> Result<(), String> {
        if !MOCKABLE.contains(&name) {
            return Err(format!("{name} cannot be mocked"));
        }
        self.with(|q| {
            q.mocked.insert(name.to_string());
        });
        Ok(())
    }

    /// Queues one expected call of `name`. `args` of `None` accepts any.
    pub fn push(&self, name: &str, args: Option<Vec<Value>>, response: Dynamic, raise: bool) -> Result<(), String> {
        self.declare(name)?;
        self.with(|q| {
            q.pending.entry(name.to_string()).or_default().push_back(Expectation { args, response, raise });
        });
        Ok(())
    }

    /// Problems seen so far plus every unconsumed expectation.
    pub fn verify(&self) -> Result<(), String> {
        self.with(|q| {
            let mut problems = q.failures.clone();
            let mut names: Vec<&String> = q.pending.keys().collect();
            names.sort();
            for name in names {
                let left = q.pending[name].len();
                if left > 0 {
                    problems.push(format!("{left} expected call(s) to {name} were not made"));
                }
            }
            if problems.is_empty() {
                Ok(())
            } else {
                Err(problems.join("; "))
            }
        })
    }

    pub fn reset(&self) {
        self.with(|q| *q = Queues::default());
    }
}

impl CallInterceptor for MockRegistry {
    fn intercept(&self, function: &str, args: &[Dynamic]) -> Option<Result<Dynamic, String>> {
        self.with(|q| {
            if !q.mocked.contains(function) {
                return None;
            }
            let got: Vec<Value> = args.iter().map(to_json).collect();
            let Some(next) = q.pending.get_mut(function).and_then(VecDeque::pop_front) else {
                let message = format!("unexpected call to {function} with {}", Value::Array(got));
                q.failures.push(message.clone());
                return Some(Err(message));
            };
            if let Some(expected) = &next.args {
                if *expected != got {
                    let message = format!(
                        "wrong arguments for {function}: expected {}, got {}",
                        Value::Array(expected.clone()),
                        Value::Array(got)
                    );
                    q.failures.push(message.clone());
                    return Some(Err(message));
                }
            }
            debug!(function, "mocked call");
            if next.raise {
                Some(Err(next.response.to_string()))
            } else {
                Some(Ok(next.response))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn s(v: &str) -> Dynamic {
        Dynamic::from(v.to_string())
    }

    #[test]
    fn calls_are_consumed_in_order() {
        let registry = MockRegistry::new();
        registry.push("config", Some(vec![json!("a"), json!(null)]), s("first"), false).unwrap();
        registry.push("config", None, s("second"), false).unwrap();

        let out = registry.intercept("config", &[s("a"), Dynamic::UNIT]).unwrap().unwrap();
        assert_eq!(out.into_string().unwrap(), "first");
        let out = registry.intercept("config", &[s("anything")]).unwrap().unwrap();
        assert_eq!(out.into_string().unwrap(), "second");
        assert!(registry.verify().is_ok());
    }

    #[test]
    fn unmocked_builtins_run_for_real() {
        let registry = MockRegistry::new();
        registry.push("http", None, s("x"), false).unwrap();
        assert!(registry.intercept("exec", &[]).is_none());
    }

    #[test]
    fn mismatches_and_leftovers_fail_verification() {
        let registry = MockRegistry::new();
        registry.push("exec", Some(vec![json!("ls")]), s("out"), false).unwrap();
        registry.push("exec", None, s("x"), false).unwrap();
        let err = registry.intercept("exec", &[s("rm")]).unwrap().unwrap_err();
        assert!(err.contains("wrong arguments for exec"));

        let err = registry.verify().unwrap_err();
        assert!(err.contains("wrong arguments"));
        assert!(err.contains("1 expected call(s) to exec were not made"));

        registry.reset();
        assert!(registry.verify().is_ok());
    }

    #[test]
    fn raised_responses_become_errors() {
        let registry = MockRegistry::new();
        registry.push("sync_fetch", None, s("connection refused"), true).unwrap();
        let err = registry.intercept("sync_fetch", &[s("/k")]).unwrap().unwrap_err();
        assert_eq!(err, "connection refused");
    }

    #[test]
    fn only_external_builtins_are_mockable() {
        let registry = MockRegistry::new();
        assert!(registry.push("model_create", None, Dynamic::UNIT, false).is_err());
        let err = registry.intercept("http", &[]);
        assert!(err.is_none());
        registry.declare("http").unwrap();
        assert!(registry.intercept("http", &[]).unwrap().is_err());
    }
}
