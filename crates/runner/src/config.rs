//! Runner configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::engine::{EngineConfig, EngineKind};
use crate::error::{RunnerError, RunnerResult};

/// Default per-case deadline, matching the outer framework's usual test timeout
pub const DEFAULT_TIMEOUT_MS: u64 = 60_000;

/// Top-level configuration shared by the server, the executor and the harness
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Directory that relative `specs`/`confjs` paths are resolved against
    pub base_dir: PathBuf,

    /// Fixture server settings
    pub server: ServerConfig,

    /// Automation engine settings
    pub engine: EngineConfig,

    /// Deadline for one execution when the caller does not pass its own
    pub timeout_ms: u64,

    /// How long a timed-out session gets between SIGTERM and SIGKILL
    pub kill_grace_ms: u64,

    /// Where suite result files are written
    pub output_dir: PathBuf,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("."),
            server: ServerConfig::default(),
            engine: EngineConfig::default(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            kill_grace_ms: 2_000,
            output_dir: PathBuf::from("test-results"),
        }
    }
}

impl RunnerConfig {
    /// Load configuration from a YAML file
    pub fn load(path: &Path) -> RunnerResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(yaml: &str) -> RunnerResult<Self> {
        serde_yaml::from_str(yaml).map_err(RunnerError::from)
    }

    /// Overlay `SCENARIO_*` environment variables onto this config
    pub fn apply_env(mut self) -> RunnerResult<Self> {
        self.apply_vars(|key| std::env::var(key).ok())?;
        Ok(self)
    }

    fn apply_vars<F>(&mut self, lookup: F) -> RunnerResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup("SCENARIO_BASE_DIR") {
            self.base_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup("SCENARIO_OUTPUT_DIR") {
            self.output_dir = PathBuf::from(dir);
        }
        if let Some(ms) = lookup("SCENARIO_TIMEOUT_MS") {
            self.timeout_ms = parse_var("SCENARIO_TIMEOUT_MS", &ms)?;
        }
        if let Some(engine) = lookup("SCENARIO_ENGINE") {
            self.engine.kind = EngineKind::from_name(engine.trim())?;
        }
        if let Some(host) = lookup("SCENARIO_BIND_HOST") {
            self.server.bind_host = host;
        }
        if let Some(port) = lookup("SCENARIO_PORT") {
            let port: u16 = parse_var("SCENARIO_PORT", &port)?;
            self.server.port = if port == 0 { None } else { Some(port) };
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> RunnerResult<T> {
    value.trim().parse().map_err(|_| {
        RunnerError::ConfigResolution(format!("{} has an invalid value: {:?}", key, value))
    })
}

/// Configuration for the fixture server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Interface to bind
    pub bind_host: String,

    /// Port to listen on (None = ephemeral)
    pub port: Option<u16>,

    /// How long to wait for the readiness probe to succeed
    pub startup_timeout_ms: u64,

    /// Upper bound on graceful shutdown before the serve task is aborted
    pub shutdown_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_host: "127.0.0.1".to_string(),
            port: None,
            startup_timeout_ms: 10_000,
            shutdown_timeout_ms: 5_000,
        }
    }
}

impl ServerConfig {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}
