//! Automation engine adapters
//!
//! An engine is an external process that consumes a spec file and a config
//! file. This module only knows how to build its command line and
//! environment; running it is the executor's job.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;

use crate::error::{RunnerError, RunnerResult};
use crate::request::Params;

/// Environment variable carrying all params as a JSON object
pub const PARAMS_ENV: &str = "E2E_PARAMS";

/// Prefix of the per-param environment variables
pub const PARAM_ENV_PREFIX: &str = "E2E_PARAM_";

/// Environment variable pointing at the session's private profile directory
pub const PROFILE_DIR_ENV: &str = "E2E_PROFILE_DIR";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    /// `protractor <confjs> --specs <specs> --params.<key>=<value>`
    #[default]
    Protractor,
    /// `playwright test <specs> --config <confjs>`, params via environment
    Playwright,
    /// Any program, arguments given as templates
    Command,
}

impl EngineKind {
    /// Parse a built-in engine name (`protractor`, `playwright`)
    pub fn from_name(name: &str) -> RunnerResult<Self> {
        match name {
            "protractor" => Ok(EngineKind::Protractor),
            "playwright" => Ok(EngineKind::Playwright),
            other => Err(RunnerError::ConfigResolution(format!(
                "Unknown engine {:?} (expected protractor or playwright)",
                other
            ))),
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            EngineKind::Protractor => "protractor",
            EngineKind::Playwright => "playwright",
            EngineKind::Command => "command",
        }
    }
}

/// Configuration for the automation engine
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub kind: EngineKind,

    /// Program to launch. Protractor and Playwright default to `npx <tool>`.
    pub program: Option<String>,

    /// Argument templates for `command` engines, or extra trailing
    /// arguments for the others. Supports `{specs}`, `{confjs}`,
    /// `{params}` (JSON) and `{profile_dir}`.
    pub args: Vec<String>,

    /// Extra environment for every session
    pub env: BTreeMap<String, String>,
}

impl EngineConfig {
    /// A `command` engine running `program` with argument templates
    pub fn command(program: impl Into<String>, args: &[&str]) -> Self {
        Self {
            kind: EngineKind::Command,
            program: Some(program.into()),
            args: args.iter().map(|a| a.to_string()).collect(),
            env: BTreeMap::new(),
        }
    }

    /// Program and the argument vector for one session
    pub fn command_line(&self, plan: &SessionPlan<'_>) -> RunnerResult<(String, Vec<String>)> {
        let specs = plan.specs.to_string_lossy().to_string();
        let confjs = plan.confjs.to_string_lossy().to_string();

        let (program, mut args) = match self.kind {
            EngineKind::Protractor => {
                let (program, mut args) = self.launcher("protractor");
                args.push(confjs);
                args.push("--specs".to_string());
                args.push(specs);
                for (key, value) in plan.params {
                    args.push(format!("--params.{}={}", key, value));
                }
                (program, args)
            }
            EngineKind::Playwright => {
                let (program, mut args) = self.launcher("playwright");
                args.extend(["test".to_string(), specs, "--config".to_string(), confjs]);
                (program, args)
            }
            EngineKind::Command => {
                let program = self.program.clone().ok_or_else(|| {
                    RunnerError::ConfigResolution(
                        "`command` engine requires a program".to_string(),
                    )
                })?;
                (program, Vec::new())
            }
        };

        args.extend(self.args.iter().map(|a| plan.render(a)));
        Ok((program, args))
    }

    fn launcher(&self, tool: &str) -> (String, Vec<String>) {
        match &self.program {
            Some(program) => (program.clone(), Vec::new()),
            None => ("npx".to_string(), vec![tool.to_string()]),
        }
    }

    /// Environment exported to the engine process
    pub fn session_env(&self, plan: &SessionPlan<'_>) -> Vec<(String, String)> {
        let mut env: Vec<(String, String)> = self
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        env.push((PARAMS_ENV.to_string(), plan.params_json()));
        for (key, value) in plan.params {
            env.push((param_env_name(key), value.to_string()));
        }

        let profile = plan.profile_dir.to_string_lossy().to_string();
        env.push((PROFILE_DIR_ENV.to_string(), profile.clone()));
        // Browsers put throwaway profiles under TMPDIR; keep them in the session dir
        env.push(("TMPDIR".to_string(), profile));
        env
    }

    /// Ready-to-spawn process for one session
    pub fn build_command(&self, plan: &SessionPlan<'_>, cwd: &Path) -> RunnerResult<Command> {
        let (program, args) = self.command_line(plan)?;

        let mut std_cmd = std::process::Command::new(&program);
        std_cmd
            .args(&args)
            .envs(self.session_env(plan))
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        // Own process group so a timeout can take down browsers spawned by the engine
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            std_cmd.process_group(0);
        }

        let mut cmd = Command::from(std_cmd);
        cmd.kill_on_drop(true);
        Ok(cmd)
    }

    pub fn name(&self) -> String {
        match (&self.kind, &self.program) {
            (EngineKind::Command, Some(program)) => program.clone(),
            (kind, _) => kind.as_str().to_string(),
        }
    }
}

/// Everything an engine needs to know about one session
#[derive(Debug, Clone, Copy)]
pub struct SessionPlan<'a> {
    pub specs: &'a Path,
    pub confjs: &'a Path,
    pub params: &'a Params,
    pub profile_dir: &'a Path,
}

impl SessionPlan<'_> {
    fn params_json(&self) -> String {
        serde_json::to_string(self.params).unwrap_or_else(|_| "{}".to_string())
    }

    fn render(&self, template: &str) -> String {
        template
            .replace("{specs}", &self.specs.to_string_lossy())
            .replace("{confjs}", &self.confjs.to_string_lossy())
            .replace("{profile_dir}", &self.profile_dir.to_string_lossy())
            .replace("{params}", &self.params_json())
    }
}

/// `url` -> `E2E_PARAM_URL`, `login.user` -> `E2E_PARAM_LOGIN_USER`
pub fn param_env_name(key: &str) -> String {
    let suffix: String = key
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect();
    format!("{}{}", PARAM_ENV_PREFIX, suffix)
}
