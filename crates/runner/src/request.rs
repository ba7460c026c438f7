//! Execution requests: what one automation session should run

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::engine::param_env_name;
use crate::error::{RunnerError, RunnerResult};

/// A primitive parameter value injected into the session context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Bool(b) => write!(f, "{}", b),
            ParamValue::Int(i) => write!(f, "{}", i),
            ParamValue::Float(x) => write!(f, "{}", x),
            ParamValue::Str(s) => f.write_str(s),
        }
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        ParamValue::Str(value.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(value: String) -> Self {
        ParamValue::Str(value)
    }
}

impl From<bool> for ParamValue {
    fn from(value: bool) -> Self {
        ParamValue::Bool(value)
    }
}

impl From<i64> for ParamValue {
    fn from(value: i64) -> Self {
        ParamValue::Int(value)
    }
}

impl From<f64> for ParamValue {
    fn from(value: f64) -> Self {
        ParamValue::Float(value)
    }
}

/// Parameters keyed by name, ordered so rendered command lines are stable
pub type Params = BTreeMap<String, ParamValue>;

/// One browser-automation run: spec file, engine config file, parameters
///
/// Immutable once built. Use [`ExecutionRequest::builder`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionRequest {
    specs: PathBuf,
    confjs: PathBuf,
    params: Params,
}

impl ExecutionRequest {
    pub fn builder() -> ExecutionRequestBuilder {
        ExecutionRequestBuilder::default()
    }

    pub fn specs(&self) -> &Path {
        &self.specs
    }

    pub fn confjs(&self) -> &Path {
        &self.confjs
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn param(&self, key: &str) -> Option<&ParamValue> {
        self.params.get(key)
    }

    /// Parameters as a JSON object
    pub fn params_json(&self) -> serde_json::Value {
        serde_json::to_value(&self.params).unwrap_or(serde_json::Value::Null)
    }
}

#[derive(Debug, Default)]
pub struct ExecutionRequestBuilder {
    specs: Option<PathBuf>,
    confjs: Option<PathBuf>,
    params: Params,
}

impl ExecutionRequestBuilder {
    pub fn specs(mut self, path: impl Into<PathBuf>) -> Self {
        self.specs = Some(path.into());
        self
    }

    pub fn confjs(mut self, path: impl Into<PathBuf>) -> Self {
        self.confjs = Some(path.into());
        self
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn params(mut self, params: Params) -> Self {
        self.params.extend(params);
        self
    }

    pub fn build(self) -> RunnerResult<ExecutionRequest> {
        let specs = required_path("specs", self.specs)?;
        let confjs = required_path("confjs", self.confjs)?;

        for key in self.params.keys() {
            validate_key(key)?;
        }
        check_env_names(&self.params)?;

        Ok(ExecutionRequest {
            specs,
            confjs,
            params: self.params,
        })
    }
}

fn required_path(field: &str, path: Option<PathBuf>) -> RunnerResult<PathBuf> {
    match path {
        Some(p) if !p.as_os_str().is_empty() => Ok(p),
        Some(_) => Err(RunnerError::ConfigResolution(format!("`{}` is empty", field))),
        None => Err(RunnerError::ConfigResolution(format!("`{}` is required", field))),
    }
}

/// Each key must keep its own `E2E_PARAM_` variable
fn check_env_names(params: &Params) -> RunnerResult<()> {
    let mut exported: HashMap<String, &str> = HashMap::new();
    for key in params.keys() {
        let name = param_env_name(key);
        if let Some(other) = exported.get(&name) {
            return Err(RunnerError::ConfigResolution(format!(
                "Parameters {:?} and {:?} both export as {}",
                other, key, name
            )));
        }
        exported.insert(name, key);
    }
    Ok(())
}

fn validate_key(key: &str) -> RunnerResult<()> {
    let valid = !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if valid {
        Ok(())
    } else {
        Err(RunnerError::ConfigResolution(format!(
            "Invalid parameter name: {:?}",
            key
        )))
    }
}
