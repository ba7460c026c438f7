//! Suite lifecycle: one shared fixture server, many cases, unconditional teardown

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::config::RunnerConfig;
use crate::error::{ErrorCategory, RunnerError, RunnerResult};
use crate::executor::{ExecutionResult, TestExecutor};
use crate::report::SpecFailure;
use crate::request::ExecutionRequest;
use crate::server::{AppServer, ServerHandle};

/// Final status of one case
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseStatus {
    Passed,
    Failed,
    TimedOut,
}

/// Result of running a single case
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseResult {
    pub name: String,
    pub status: CaseStatus,
    pub duration_ms: u64,
    pub category: Option<ErrorCategory>,
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<SpecFailure>,
}

impl CaseResult {
    fn from_execution(name: &str, result: &ExecutionResult, elapsed: Duration) -> Self {
        match result {
            Ok(report) => Self {
                name: name.to_string(),
                status: CaseStatus::Passed,
                duration_ms: report.duration_ms,
                category: None,
                error: None,
                failures: Vec::new(),
            },
            Err(e) => Self {
                name: name.to_string(),
                status: if e.is_timeout() { CaseStatus::TimedOut } else { CaseStatus::Failed },
                duration_ms: elapsed.as_millis() as u64,
                category: Some(e.category()),
                error: Some(e.to_string()),
                failures: e.failures().to_vec(),
            },
        }
    }

    pub fn passed(&self) -> bool {
        self.status == CaseStatus::Passed
    }
}

/// Result of a whole suite
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuiteReport {
    pub name: String,
    pub host: String,
    pub started_at: DateTime<Utc>,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub duration_ms: u64,
    pub cases: Vec<CaseResult>,
    /// Teardown problem, reported apart from the case outcomes
    pub shutdown_error: Option<String>,
}

impl SuiteReport {
    /// True when every case passed; teardown errors do not count
    pub fn success(&self) -> bool {
        self.passed == self.total
    }

    /// Write the report as `<dir>/<suite>-results.json`
    pub fn write_json(&self, dir: &Path) -> RunnerResult<PathBuf> {
        std::fs::create_dir_all(dir)?;

        let path = dir.join(format!("{}-results.json", file_stem(&self.name)));
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, json)?;

        info!("Results written to: {}", path.display());
        Ok(path)
    }
}

/// A case ready to run, with its own deadline
#[derive(Debug, Clone)]
pub struct PlannedCase {
    pub name: String,
    pub request: ExecutionRequest,
    pub timeout: Duration,
}

/// A group of cases sharing one fixture server
pub struct Suite {
    name: String,
    server: ServerHandle,
    executor: TestExecutor,
    started_at: DateTime<Utc>,
    started: Instant,
    cases: Vec<CaseResult>,
}

impl Suite {
    /// Start the shared fixture server. A failure here aborts the suite.
    pub async fn setup(
        name: impl Into<String>,
        fixture_root: impl AsRef<Path>,
        config: RunnerConfig,
    ) -> RunnerResult<Self> {
        let name = name.into();
        let server = AppServer::start(fixture_root, &config.server)
            .await
            .map_err(|e| {
                error!("Suite '{}' cannot start: {}", name, e);
                e
            })?;

        info!("Suite '{}' ready at {}", name, server.host());

        Ok(Self {
            name,
            server,
            executor: TestExecutor::new(config),
            started_at: Utc::now(),
            started: Instant::now(),
            cases: Vec::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn host(&self) -> &str {
        self.server.host()
    }

    /// Absolute URL of a fixture route on the shared server
    pub fn url(&self, route: &str) -> String {
        self.server.url(route)
    }

    pub fn executor(&self) -> &TestExecutor {
        &self.executor
    }

    pub fn cases(&self) -> &[CaseResult] {
        &self.cases
    }

    /// Run one case with the configured deadline and record it
    pub async fn run_case(&mut self, name: &str, request: &ExecutionRequest) -> &CaseResult {
        let timeout = self.executor.config().timeout();
        self.run_case_with_timeout(name, request, timeout).await
    }

    /// Run one case with the caller's deadline and record it
    pub async fn run_case_with_timeout(
        &mut self,
        name: &str,
        request: &ExecutionRequest,
        timeout: Duration,
    ) -> &CaseResult {
        let start = Instant::now();
        let result = self.executor.execute_with_timeout(request, timeout).await;
        self.record(name, &result, start.elapsed())
    }

    /// Run independent cases at the same time against the shared server
    pub async fn run_concurrent(&mut self, cases: &[PlannedCase]) -> &[CaseResult] {
        let executor = &self.executor;
        let runs = cases.iter().map(|case| async move {
            let start = Instant::now();
            let result = executor.execute_with_timeout(&case.request, case.timeout).await;
            (case.name.as_str(), result, start.elapsed())
        });
        let results = join_all(runs).await;

        let first = self.cases.len();
        for (name, result, elapsed) in results {
            self.record(name, &result, elapsed);
        }
        &self.cases[first..]
    }

    /// Record a case that failed before a session could be launched
    pub fn record_error(&mut self, name: &str, error: RunnerError) -> &CaseResult {
        self.record(name, &Err(error), Duration::ZERO)
    }

    fn record(&mut self, name: &str, result: &ExecutionResult, elapsed: Duration) -> &CaseResult {
        let case = CaseResult::from_execution(name, result, elapsed);
        match case.status {
            CaseStatus::Passed => info!("✓ {} ({} ms)", case.name, case.duration_ms),
            CaseStatus::TimedOut => error!("⏱ {} - {}", case.name, case.error.as_deref().unwrap_or("timed out")),
            CaseStatus::Failed => error!(
                "✗ {} [{}] - {}",
                case.name,
                case.category.map(|c| c.as_str()).unwrap_or("unknown"),
                case.error.as_deref().unwrap_or("unknown error")
            ),
        }
        self.cases.push(case);
        // Just pushed, so never empty
        &self.cases[self.cases.len() - 1]
    }

    /// Stop the server and summarize. Always runs the shutdown.
    pub async fn teardown(mut self) -> SuiteReport {
        let shutdown_error = match self.server.shutdown().await {
            Ok(()) => None,
            Err(e) => {
                warn!("Suite '{}' teardown: {}", self.name, e);
                Some(e.to_string())
            }
        };

        let passed = self.cases.iter().filter(|c| c.status == CaseStatus::Passed).count();
        let failed = self.cases.iter().filter(|c| c.status == CaseStatus::Failed).count();
        let timed_out = self.cases.iter().filter(|c| c.status == CaseStatus::TimedOut).count();
        let duration_ms = self.started.elapsed().as_millis() as u64;

        info!(
            "Suite '{}': {} passed, {} failed, {} timed out ({} ms)",
            self.name, passed, failed, timed_out, duration_ms
        );

        SuiteReport {
            name: std::mem::take(&mut self.name),
            host: self.server.host().to_string(),
            started_at: self.started_at,
            total: self.cases.len(),
            passed,
            failed,
            timed_out,
            duration_ms,
            cases: std::mem::take(&mut self.cases),
            shutdown_error,
        }
    }
}

fn file_stem(name: &str) -> String {
    let stem: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .collect();
    if stem.is_empty() {
        "suite".to_string()
    } else {
        stem
    }
}
