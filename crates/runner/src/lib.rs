//! Scenario Runner
//!
//! Orchestrates end-to-end browser tests against throwaway fixture servers:
//! - Serves a tree of static fixture apps on an ephemeral port
//! - Launches one automation engine process (Protractor, Playwright or any
//!   command) per execution, with parameters such as the target `url`
//! - Enforces a per-execution deadline and tears the session down on expiry
//! - Reports categorized outcomes so callers can triage flaky infrastructure
//!   separately from real assertion failures
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Suite                                                      │
//! │    ├── setup(name, fixture_root, config)                    │
//! │    │     └── AppServer::start() -> ServerHandle { host }    │
//! │    ├── run_case(name, ExecutionRequest)                     │
//! │    │     └── TestExecutor::execute() -> ExecutionResult     │
//! │    │           Idle → Launching → Running                   │
//! │    │                → Passed | Failed | TimedOut            │
//! │    └── teardown() -> SuiteReport                            │
//! │          └── ServerHandle::shutdown()                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ExecutionRequest { specs, confjs, params { url, ... } }    │
//! │  ScenarioManifest (YAML) -> Suite                           │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod manifest;
pub mod report;
pub mod request;
pub mod server;
pub mod suite;

pub use config::{RunnerConfig, ServerConfig};
pub use engine::{EngineConfig, EngineKind};
pub use error::{ErrorCategory, RunnerError, RunnerResult};
pub use executor::{ExecutionReport, ExecutionResult, SessionState, TestExecutor};
pub use manifest::{run_manifest, ScenarioManifest};
pub use request::{ExecutionRequest, ParamValue};
pub use server::{AppServer, ServerHandle};
pub use suite::{Suite, SuiteReport};
