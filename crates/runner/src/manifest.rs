//! Declarative YAML scenario manifests
//!
//! A manifest describes one suite: where the fixture apps live and which
//! spec/config pairs to run against them.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::config::RunnerConfig;
use crate::error::{RunnerError, RunnerResult};
use crate::request::{ExecutionRequest, ParamValue, Params};
use crate::suite::{PlannedCase, Suite, SuiteReport};

/// Placeholder in string params replaced with the fixture server host
pub const HOST_PLACEHOLDER: &str = "{host}";

/// A complete suite description parsed from YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioManifest {
    /// Suite name, also used for the results file
    pub name: String,

    #[serde(default)]
    pub description: String,

    /// Tags for filtering suites
    #[serde(default)]
    pub tags: Vec<String>,

    /// Fixture app tree, relative paths resolve against the base directory
    pub fixture_root: PathBuf,

    /// Per-case deadline for this suite, overriding the runner default
    #[serde(default)]
    pub timeout_ms: Option<u64>,

    /// Run the cases at the same time instead of in order
    #[serde(default)]
    pub concurrent: bool,

    pub cases: Vec<ScenarioCase>,
}

/// One case of a manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioCase {
    pub name: String,
    pub specs: PathBuf,
    pub confjs: PathBuf,
    #[serde(default)]
    pub params: Params,
    /// Deadline for this case only
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl ScenarioCase {
    /// Build the execution request, substituting the server host into params
    pub fn request(&self, host: &str) -> RunnerResult<ExecutionRequest> {
        let params = self
            .params
            .iter()
            .map(|(key, value)| {
                let value = match value {
                    ParamValue::Str(s) => ParamValue::Str(s.replace(HOST_PLACEHOLDER, host)),
                    other => other.clone(),
                };
                (key.clone(), value)
            })
            .collect();

        ExecutionRequest::builder()
            .specs(&self.specs)
            .confjs(&self.confjs)
            .params(params)
            .build()
    }
}

impl ScenarioManifest {
    /// Parse a manifest from YAML string
    pub fn from_yaml(yaml: &str) -> RunnerResult<Self> {
        let manifest: Self = serde_yaml::from_str(yaml)?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Parse a manifest from a YAML file
    pub fn from_file(path: &Path) -> RunnerResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Load all manifests from a directory
    pub fn load_all(dir: &Path) -> RunnerResult<Vec<Self>> {
        let mut manifests = Vec::new();

        let mut paths: Vec<PathBuf> = walkdir::WalkDir::new(dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .filter(|p| {
                p.extension()
                    .map(|ext| ext == "yaml" || ext == "yml")
                    .unwrap_or(false)
            })
            .collect();
        paths.sort();

        for path in paths {
            manifests.push(Self::from_file(&path)?);
        }

        Ok(manifests)
    }

    /// Filter manifests by tag
    pub fn filter_by_tag<'a>(manifests: &'a [Self], tag: &str) -> Vec<&'a Self> {
        manifests.iter().filter(|m| m.tags.iter().any(|t| t == tag)).collect()
    }

    fn validate(&self) -> RunnerResult<()> {
        if self.cases.is_empty() {
            return Err(RunnerError::ConfigResolution(format!(
                "Scenario '{}' has no cases",
                self.name
            )));
        }
        let mut names: Vec<&str> = self.cases.iter().map(|c| c.name.as_str()).collect();
        names.sort_unstable();
        if let Some(dup) = names.windows(2).find(|w| w[0] == w[1]) {
            return Err(RunnerError::ConfigResolution(format!(
                "Scenario '{}' has duplicate case '{}'",
                self.name, dup[0]
            )));
        }
        Ok(())
    }

    /// Deadline for a case: case override, then suite, then runner default
    pub fn case_timeout(&self, case: &ScenarioCase, config: &RunnerConfig) -> Duration {
        case.timeout_ms
            .or(self.timeout_ms)
            .map(Duration::from_millis)
            .unwrap_or_else(|| config.timeout())
    }
}

/// Run a manifest end to end: setup, every case, teardown
pub async fn run_manifest(manifest: &ScenarioManifest, config: &RunnerConfig) -> RunnerResult<SuiteReport> {
    let root = if manifest.fixture_root.is_absolute() {
        manifest.fixture_root.clone()
    } else {
        config.base_dir.join(&manifest.fixture_root)
    };

    info!("Running scenario '{}' ({} case(s))", manifest.name, manifest.cases.len());
    let mut suite = Suite::setup(&manifest.name, &root, config.clone()).await?;

    if manifest.concurrent {
        let mut planned = Vec::with_capacity(manifest.cases.len());
        for case in &manifest.cases {
            match case.request(suite.host()) {
                Ok(request) => planned.push(PlannedCase {
                    name: case.name.clone(),
                    request,
                    timeout: manifest.case_timeout(case, config),
                }),
                Err(e) => {
                    suite.record_error(&case.name, e);
                }
            }
        }
        suite.run_concurrent(&planned).await;
    } else {
        for case in &manifest.cases {
            match case.request(suite.host()) {
                Ok(request) => {
                    let deadline = manifest.case_timeout(case, config);
                    suite.run_case_with_timeout(&case.name, &request, deadline).await;
                }
                Err(e) => {
                    suite.record_error(&case.name, e);
                }
            }
        }
    }

    Ok(suite.teardown().await)
}

#[cfg(test)]
mod tests {
    use super::*;

    const NAVIGATION: &str = r#"
name: navigation
description: Navigation scenario with and without the login form
tags:
  - smoke
fixture_root: scenario/fixture/apps
cases:
  - name: should navigate in browser
    specs: ./scenario/fixture/navigation.spec.js
    confjs: ./scenario/navigation.conf.js
    params:
      url: "{host}/formauth/app.html?auth=true"
  - name: should navigate in browser with auth
    specs: ./scenario/fixture/navigation_auth.spec.js
    confjs: ./scenario/navigation.conf.js
    timeout_ms: 90000
    params:
      url: "{host}/formauth/app.html"
      retries: 0
"#;

    #[test]
    fn test_parse_navigation_manifest() {
        let manifest = ScenarioManifest::from_yaml(NAVIGATION).unwrap();
        assert_eq!(manifest.name, "navigation");
        assert_eq!(manifest.cases.len(), 2);
        assert!(!manifest.concurrent);
        assert_eq!(ScenarioManifest::filter_by_tag(std::slice::from_ref(&manifest), "smoke").len(), 1);
    }

    #[test]
    fn test_host_substitution() {
        let manifest = ScenarioManifest::from_yaml(NAVIGATION).unwrap();
        let request = manifest.cases[0].request("http://127.0.0.1:41000").unwrap();
        assert_eq!(
            request.param("url"),
            Some(&ParamValue::Str("http://127.0.0.1:41000/formauth/app.html?auth=true".into()))
        );

        let request = manifest.cases[1].request("http://127.0.0.1:41000").unwrap();
        assert_eq!(request.param("retries"), Some(&ParamValue::Int(0)));
    }

    #[test]
    fn test_case_timeout_precedence() {
        let manifest = ScenarioManifest::from_yaml(NAVIGATION).unwrap();
        let config = RunnerConfig::default();
        assert_eq!(manifest.case_timeout(&manifest.cases[0], &config), Duration::from_secs(60));
        assert_eq!(manifest.case_timeout(&manifest.cases[1], &config), Duration::from_secs(90));
    }

    #[test]
    fn test_rejects_empty_and_duplicate_cases() {
        let empty = "name: x\nfixture_root: apps\ncases: []\n";
        assert!(ScenarioManifest::from_yaml(empty).is_err());

        let dup = r#"
name: x
fixture_root: apps
cases:
  - { name: a, specs: a.js, confjs: c.js }
  - { name: a, specs: b.js, confjs: c.js }
"#;
        let err = ScenarioManifest::from_yaml(dup).unwrap_err();
        assert!(err.to_string().contains("duplicate case 'a'"));
    }

    #[test]
    fn test_load_all_sorted() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("nested")).unwrap();
        std::fs::write(dir.path().join("b.yaml"), NAVIGATION.replace("name: navigation", "name: second")).unwrap();
        std::fs::write(dir.path().join("nested/a.yml"), NAVIGATION).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let manifests = ScenarioManifest::load_all(dir.path()).unwrap();
        let names: Vec<&str> = manifests.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["second", "navigation"]);
    }
}
