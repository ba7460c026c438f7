//! Parsing automation engine output into failures and counts
//!
//! Understands three output shapes:
//! - Jasmine/Protractor console reporter (`Failures:` block, `N specs, M failures`)
//! - Playwright list reporter (`1) file › title` headers, `N passed` / `N failed`)
//! - JSON result lines (`{"success": false, "spec": "...", "error": "..."}`)

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Message lines kept per failure
const MAX_MESSAGE_LINES: usize = 5;

static JASMINE_SUMMARY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d+) specs?, (\d+) failures?").expect("valid regex"));
static PLAYWRIGHT_PASSED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d+) passed\b").expect("valid regex"));
static PLAYWRIGHT_FAILED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d+) failed$").expect("valid regex"));
static FAILURE_HEADER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d+\) (.+)$").expect("valid regex"));

/// One failed spec as reported by the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecFailure {
    pub spec: String,
    pub message: String,
}

impl SpecFailure {
    pub fn new(spec: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            spec: spec.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for SpecFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            f.write_str(&self.spec)
        } else {
            write!(f, "{} - {}", self.spec, self.message)
        }
    }
}

/// What the engine said about the run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineReport {
    /// Specs executed, when the engine printed a summary
    pub specs_run: Option<usize>,

    /// Failure count from the summary line
    pub failed_count: Option<usize>,

    /// Individual failures, in the order the engine printed them
    pub failures: Vec<SpecFailure>,

    /// A JSON result line explicitly reported success
    pub success_marker: bool,
}

impl EngineReport {
    /// Parse stdout and stderr of one session
    pub fn from_streams(stdout: &[String], stderr: &[String]) -> Self {
        let mut report = Self::parse(stdout.iter().map(String::as_str));
        report.merge(Self::parse(stderr.iter().map(String::as_str)));
        report.fill_unnamed_failures();
        report
    }

    /// Parse one stream of output lines
    pub fn parse<'a>(lines: impl IntoIterator<Item = &'a str>) -> Self {
        let mut report = EngineReport::default();
        let mut in_jasmine_failures = false;
        let mut current: Option<PendingFailure> = None;

        for raw in lines {
            let line = raw.trim();

            if let Some(json) = parse_json_result(line) {
                match json {
                    JsonResult::Passed => report.success_marker = true,
                    JsonResult::Failed(failure) => report.failures.push(failure),
                }
                continue;
            }

            if line == "Failures:" {
                in_jasmine_failures = true;
                continue;
            }

            if let Some(caps) = JASMINE_SUMMARY.captures(line) {
                flush(&mut current, &mut report.failures);
                in_jasmine_failures = false;
                report.specs_run = caps[1].parse().ok();
                report.failed_count = caps[2].parse().ok();
                continue;
            }

            if let Some(caps) = PLAYWRIGHT_PASSED.captures(line) {
                flush(&mut current, &mut report.failures);
                let passed: usize = caps[1].parse().unwrap_or(0);
                let failed = report.failed_count.unwrap_or(0);
                report.specs_run = Some(passed + failed);
                continue;
            }

            if let Some(caps) = PLAYWRIGHT_FAILED.captures(line) {
                flush(&mut current, &mut report.failures);
                let failed: usize = caps[1].parse().unwrap_or(0);
                report.failed_count = Some(report.failed_count.unwrap_or(0) + failed);
                report.specs_run = Some(report.specs_run.unwrap_or(0) + failed);
                continue;
            }

            if let Some(caps) = FAILURE_HEADER.captures(line) {
                let title = caps[1].trim_end_matches(|c: char| c == '─' || c.is_whitespace());
                let playwright = title.contains(" › ");
                if in_jasmine_failures || playwright {
                    flush(&mut current, &mut report.failures);
                    current = Some(PendingFailure {
                        spec: title.to_string(),
                        message: Vec::new(),
                        // Playwright prints the error right under the header
                        collecting: playwright,
                    });
                    continue;
                }
            }

            if let Some(pending) = current.as_mut() {
                match line {
                    "Message:" => pending.collecting = true,
                    "Stack:" => pending.collecting = false,
                    "" if !pending.message.is_empty() => pending.collecting = false,
                    "" => {}
                    text if pending.collecting && pending.message.len() < MAX_MESSAGE_LINES => {
                        pending.message.push(text.to_string());
                    }
                    _ => {}
                }
            }
        }

        flush(&mut current, &mut report.failures);
        report
    }

    fn merge(&mut self, other: EngineReport) {
        self.specs_run = self.specs_run.or(other.specs_run);
        self.failed_count = match (self.failed_count, other.failed_count) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        self.failures.extend(other.failures);
        self.success_marker |= other.success_marker;
    }

    /// A summary may report failures whose details were not printed
    fn fill_unnamed_failures(&mut self) {
        if let Some(count) = self.failed_count {
            if count > 0 && self.failures.is_empty() {
                self.failures.push(SpecFailure::new(
                    format!("{} spec(s) failed", count),
                    "engine reported failures without details",
                ));
            }
        }
    }

    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty() || self.failed_count.map(|c| c > 0).unwrap_or(false)
    }
}

struct PendingFailure {
    spec: String,
    message: Vec<String>,
    collecting: bool,
}

fn flush(current: &mut Option<PendingFailure>, out: &mut Vec<SpecFailure>) {
    if let Some(pending) = current.take() {
        out.push(SpecFailure::new(pending.spec, pending.message.join("\n")));
    }
}

enum JsonResult {
    Passed,
    Failed(SpecFailure),
}

fn parse_json_result(line: &str) -> Option<JsonResult> {
    if !line.starts_with('{') {
        return None;
    }
    let value: serde_json::Value = serde_json::from_str(line).ok()?;
    let success = value.get("success")?.as_bool()?;
    if success {
        return Some(JsonResult::Passed);
    }
    let spec = value
        .get("spec")
        .and_then(|v| v.as_str())
        .unwrap_or("script")
        .to_string();
    let message = value
        .get("error")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    Some(JsonResult::Failed(SpecFailure::new(spec, message)))
}
