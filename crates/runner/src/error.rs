//! Error types for scenario runs

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::report::SpecFailure;

#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("Fixture server failed to start: {0}")]
    ServerStart(String),

    #[error("Could not resolve scenario files: {0}")]
    ConfigResolution(String),

    #[error("{}", format_failures(.0))]
    AssertionFailure(Vec<SpecFailure>),

    #[error("Automation engine error (exit code {}): {detail}", display_exit_code(.exit_code))]
    AutomationEngine {
        exit_code: Option<i32>,
        detail: String,
    },

    #[error("Automation engine not found: {0}")]
    EngineNotFound(String),

    #[error("Session timed out after {after_ms} ms")]
    TimedOut { after_ms: u64 },

    #[error("Fixture server shutdown failed: {0}")]
    Shutdown(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

pub type RunnerResult<T> = Result<T, RunnerError>;

/// Coarse error class callers use for triage and retry decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCategory {
    ServerStart,
    ConfigResolution,
    AssertionFailure,
    AutomationEngine,
    TimedOut,
    Shutdown,
    Internal,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::ServerStart => "server-start",
            ErrorCategory::ConfigResolution => "config-resolution",
            ErrorCategory::AssertionFailure => "assertion-failure",
            ErrorCategory::AutomationEngine => "automation-engine",
            ErrorCategory::TimedOut => "timed-out",
            ErrorCategory::Shutdown => "shutdown",
            ErrorCategory::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl RunnerError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            RunnerError::ServerStart(_) => ErrorCategory::ServerStart,
            RunnerError::ConfigResolution(_) => ErrorCategory::ConfigResolution,
            RunnerError::AssertionFailure(_) => ErrorCategory::AssertionFailure,
            RunnerError::AutomationEngine { .. } | RunnerError::EngineNotFound(_) => {
                ErrorCategory::AutomationEngine
            }
            RunnerError::TimedOut { .. } => ErrorCategory::TimedOut,
            RunnerError::Shutdown(_) => ErrorCategory::Shutdown,
            RunnerError::Io(_)
            | RunnerError::Json(_)
            | RunnerError::Yaml(_)
            | RunnerError::Http(_) => ErrorCategory::Internal,
        }
    }

    /// Whether a caller-side retry could plausibly change the outcome.
    ///
    /// Only infrastructure failures qualify. The runner never retries on its own.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RunnerError::TimedOut { .. } | RunnerError::AutomationEngine { .. }
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, RunnerError::TimedOut { .. })
    }

    /// Failures reported by the engine, empty for every other category
    pub fn failures(&self) -> &[SpecFailure] {
        match self {
            RunnerError::AssertionFailure(failures) => failures,
            _ => &[],
        }
    }
}

fn display_exit_code(code: &Option<i32>) -> String {
    code.map(|c| c.to_string()).unwrap_or_else(|| "none".to_string())
}

fn format_failures(failures: &[SpecFailure]) -> String {
    match failures {
        [] => "Assertion failed".to_string(),
        [only] => format!("Assertion failed: {}", only),
        [first, rest @ ..] => format!("{} assertions failed, first: {}", rest.len() + 1, first),
    }
}
