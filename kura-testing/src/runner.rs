//! Discovers and runs `test_*` functions in extension test scripts.
//!
//! A test script names what it needs in leading comment directives:
//!
//! ```text
//! // schemas: ../schema.yaml, extra.json
//! // path: /networks
//! ```
//!
//! `schemas` files are loaded (relative to the script) into a fresh
//! registry; the extensions bound to `path` are loaded together with the
//! script itself. Each test gets its own SQLite database, mock registry and
//! interpreter, runs between the optional `setUp` and `tearDown` functions,
//! and fails when any recorded mock call was left unconsumed.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use kura_db::{init_db_with_schemas, Db, SqlDb};
use kura_extension::{EnvironmentManager, Host, ScriptEnvironment};
use kura_resources::Resources;
use kura_schema::Manager;
use tracing::{info, warn};

use crate::mock::MockRegistry;
use crate::module::TestingModule;
use crate::TestError;

const SET_UP: &str = "setUp";
const TEAR_DOWN: &str = "tearDown";
const TEST_PREFIX: &str = "test_";

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Directives {
    pub schemas: Vec<String>,
    pub path: Option<String>,
}

/// Reads `// key: value` lines at the top of a script.
pub fn parse_directives(source: &str) -> Directives {
    let mut out = Directives::default();
    for line in source.lines().map(str::trim) {
        if line.is_empty() {
            continue;
        }
        let Some(comment) = line.strip_prefix("//") else {
            break;
        };
        let Some((key, value)) = comment.split_once(':') else {
            continue;
        };
        match key.trim() {
            "schemas" => out.schemas.extend(
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string),
            ),
            "path" => out.path = Some(value.trim().to_string()).filter(|p| !p.is_empty()),
            _ => {}
        }
    }
    out
}

#[derive(Clone, Debug, PartialEq)]
pub struct TestOutcome {
    pub file: PathBuf,
    pub name: String,
    pub failure: Option<String>,
}

impl TestOutcome {
    pub fn passed(&self) -> bool {
        self.failure.is_none()
    }
}

impl fmt::Display for TestOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.failure {
            None => write!(f, "PASS {}::{}", self.file.display(), self.name),
            Some(reason) => write!(f, "FAIL {}::{}: {}", self.file.display(), self.name, reason),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct Report {
    pub outcomes: Vec<TestOutcome>,
}

impl Report {
    pub fn passed(&self) -> usize {
        self.outcomes.iter().filter(|o| o.passed()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.passed()
    }

    pub fn success(&self) -> bool {
        self.failed() == 0
    }
}

pub struct TestRunner {
    time_limit: Duration,
    only: Option<String>,
}

impl Default for TestRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl TestRunner {
    pub fn new() -> Self {
        Self {
            time_limit: Duration::from_secs(30),
            only: None,
        }
    }

    pub fn time_limit(mut self, limit: Duration) -> Self {
        self.time_limit = limit;
        self
    }

    /// Runs only tests whose name contains `pattern`.
    pub fn only(mut self, pattern: impl Into<String>) -> Self {
        self.only = Some(pattern.into());
        self
    }

    pub async fn run_files<P: AsRef<Path>>(&self, files: &[P]) -> Result<Report, TestError> {
        let mut report = Report::default();
        for file in files {
            report.outcomes.extend(self.run_file(file.as_ref()).await?);
        }
        info!(passed = report.passed(), failed = report.failed(), "extension tests finished");
        Ok(report)
    }

    pub async fn run_file(&self, file: &Path) -> Result<Vec<TestOutcome>, TestError> {
        let source = std::fs::read_to_string(file).map_err(|e| TestError::Io {
            path: file.display().to_string(),
            message: e.to_string(),
        })?;
        let directives = parse_directives(&source);
        let base = file.parent().map(Path::to_path_buf).unwrap_or_default();

        let mut manager = Manager::new();
        for schema in &directives.schemas {
            manager.load_file(base.join(schema))?;
        }
        manager.validate()?;
        let manager = Arc::new(manager);

        let mut codes: Vec<(String, String)> = match &directives.path {
            Some(path) => manager
                .extensions()
                .iter()
                .filter(|e| e.matches(path))
                .map(|e| (e.id.clone(), e.code.clone()))
                .collect(),
            None => Vec::new(),
        };
        codes.push((file.display().to_string(), source));

        let probe = ScriptEnvironment::new("probe", Host::builder(Arc::clone(&manager)).build(), codes.clone())?;
        let names = probe.function_names().await?;
        let has = |name: &str| names.iter().any(|n| n == name);
        let (set_up, tear_down) = (has(SET_UP), has(TEAR_DOWN));

        let mut tests: Vec<&String> = names
            .iter()
            .filter(|n| n.starts_with(TEST_PREFIX))
            .filter(|n| self.only.as_ref().map_or(true, |p| n.contains(p.as_str())))
            .collect();
        tests.sort();
        tests.dedup();

        let mut outcomes = Vec::with_capacity(tests.len());
        for name in tests {
            let failure = self.run_one(&manager, &codes, name, set_up, tear_down).await?;
            let outcome = TestOutcome {
                file: file.to_path_buf(),
                name: name.clone(),
                failure,
            };
            match &outcome.failure {
                None => info!(test = %name, "passed"),
                Some(reason) => warn!(test = %name, %reason, "failed"),
            }
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    /// `Ok(Some(reason))` is a failed test; `Err` a broken harness.
    async fn run_one(
        &self,
        manager: &Arc<Manager>,
        codes: &[(String, String)],
        name: &str,
        set_up: bool,
        tear_down: bool,
    ) -> Result<Option<String>, TestError> {
        let dir = tempfile::tempdir().map_err(|e| TestError::Io {
            path: "temporary directory".into(),
            message: e.to_string(),
        })?;
        let db_path = dir.path().join("test.db");
        let db: Arc<dyn Db> = Arc::new(SqlDb::connect(Arc::clone(manager), &db_path.to_string_lossy(), 4).await?);
        init_db_with_schemas(db.as_ref(), manager, true, false, false).await?;

        let registry = Arc::new(MockRegistry::new());
        let module = Arc::new(TestingModule::new(Arc::clone(&registry)));
        let host = Host::builder(Arc::clone(manager))
            .db(Arc::clone(&db))
            .time_limit(self.time_limit)
            .interceptor(registry.clone())
            .module(module.clone())
            .build();
        let envs = Arc::new(EnvironmentManager::new());
        envs.load_extensions(&host)?;
        let _resources = Resources::bind(&host, Arc::clone(&db), envs);
        let env = ScriptEnvironment::new(name, Arc::clone(&host), codes.to_vec())?;

        let mut failure = None;
        if set_up {
            if let Err(err) = env.call_function(SET_UP).await {
                failure = Some(format!("setUp: {err}"));
            }
        }
        if failure.is_none() {
            if let Err(err) = env.call_function(name).await {
                failure = Some(err.to_string());
            }
        }
        if tear_down {
            if let Err(err) = env.call_function(TEAR_DOWN).await {
                failure.get_or_insert_with(|| format!("tearDown: {err}"));
            }
        }
        if failure.is_none() {
            failure = registry.verify().err();
        }

        if let Some(tx) = module.take_transaction() {
            if !tx.closed() {
                if let Err(err) = tx.close().await {
                    warn!(test = name, error = %err, "closing mock transaction failed");
                }
            }
        }
        if let Err(err) = db.close().await {
            warn!(test = name, error = %err, "closing test database failed");
        }
        Ok(failure)
    }
}
