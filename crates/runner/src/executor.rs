//! Test executor - one automation session per call, bounded by a deadline

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::RunnerConfig;
use crate::engine::SessionPlan;
use crate::error::{RunnerError, RunnerResult};
use crate::report::EngineReport;
use crate::request::ExecutionRequest;

/// Stderr lines kept in engine error details
const ERROR_TAIL_LINES: usize = 20;

/// Lifecycle of one `execute` call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Launching,
    Running,
    Passed,
    Failed,
    TimedOut,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Passed | SessionState::Failed | SessionState::TimedOut)
    }
}

/// Details of a passed session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub session_id: Uuid,
    pub specs: PathBuf,
    pub confjs: PathBuf,
    pub state: SessionState,
    pub duration_ms: u64,
    pub exit_code: Option<i32>,
    pub specs_run: Option<usize>,
}

/// Outcome of one `execute` call; errors carry the failure category
pub type ExecutionResult = RunnerResult<ExecutionReport>;

/// Launches automation sessions
///
/// Holds no per-session state, so one executor can serve concurrent calls.
#[derive(Debug, Clone)]
pub struct TestExecutor {
    config: RunnerConfig,
}

impl TestExecutor {
    pub fn new(config: RunnerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Run one session with the configured default deadline
    pub async fn execute(&self, request: &ExecutionRequest) -> ExecutionResult {
        self.execute_with_timeout(request, self.config.timeout()).await
    }

    /// Run one session, giving up after `deadline`
    pub async fn execute_with_timeout(
        &self,
        request: &ExecutionRequest,
        deadline: Duration,
    ) -> ExecutionResult {
        let session = Session::new();
        let specs = self.resolve("specs", request.specs())?;
        let confjs = self.resolve("confjs", request.confjs())?;

        let profile = tempfile::Builder::new().prefix("e2e-session-").tempdir()?;
        let plan = SessionPlan {
            specs: &specs,
            confjs: &confjs,
            params: request.params(),
            profile_dir: profile.path(),
        };

        let result = self.run_session(session, &plan, deadline).await;

        if let Err(e) = profile.close() {
            warn!(session = %session.id, "Failed to remove session profile: {}", e);
        }

        result.map(|(state, duration_ms, exit_code, report)| ExecutionReport {
            session_id: session.id,
            specs,
            confjs,
            state,
            duration_ms,
            exit_code,
            specs_run: report.specs_run,
        })
    }

    async fn run_session(
        &self,
        mut session: Session,
        plan: &SessionPlan<'_>,
        deadline: Duration,
    ) -> RunnerResult<(SessionState, u64, Option<i32>, EngineReport)> {
        let engine = &self.config.engine;
        session.transition(SessionState::Launching);

        let mut cmd = engine.build_command(plan, &self.config.base_dir)?;
        let mut child = cmd.spawn().map_err(|e| {
            session.transition(SessionState::Failed);
            if e.kind() == std::io::ErrorKind::NotFound {
                RunnerError::EngineNotFound(engine.name())
            } else {
                RunnerError::AutomationEngine {
                    exit_code: None,
                    detail: format!("Failed to launch {}: {}", engine.name(), e),
                }
            }
        })?;

        let pgid = child.id();
        let group = GroupGuard { pgid };
        session.transition(SessionState::Running);
        info!(
            session = %session.id,
            "Running {} against {}",
            plan.specs.display(),
            plan.params.get("url").map(|u| u.to_string()).unwrap_or_else(|| "-".to_string())
        );

        let (tx, mut rx) = mpsc::unbounded_channel();
        let readers = [
            spawn_reader(child.stdout.take(), Stream::Stdout, session.id, tx.clone()),
            spawn_reader(child.stderr.take(), Stream::Stderr, session.id, tx),
        ];

        let started = Instant::now();
        let waited = match timeout(deadline, child.wait()).await {
            Ok(status) => status.map(Some),
            Err(_) => {
                warn!(session = %session.id, "Deadline of {} ms elapsed, terminating session", deadline.as_millis());
                terminate(&mut child, pgid, self.config.kill_grace()).await;
                Ok(None)
            }
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        // Whatever the engine left behind in its group goes with it
        group.kill();

        for reader in readers {
            finish_reader(reader, self.config.kill_grace()).await;
        }
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        while let Ok((stream, line)) = rx.try_recv() {
            match stream {
                Stream::Stdout => stdout.push(line),
                Stream::Stderr => stderr.push(line),
            }
        }

        let status = match waited {
            Ok(status) => status,
            Err(e) => {
                session.transition(SessionState::Failed);
                return Err(e.into());
            }
        };
        let Some(status) = status else {
            session.transition(SessionState::TimedOut);
            return Err(RunnerError::TimedOut { after_ms: deadline.as_millis() as u64 });
        };

        let report = EngineReport::from_streams(&stdout, &stderr);
        match classify(status, &report, &stdout, &stderr) {
            Ok(()) => {
                session.transition(SessionState::Passed);
                Ok((SessionState::Passed, duration_ms, status.code(), report))
            }
            Err(e) => {
                session.transition(SessionState::Failed);
                Err(e)
            }
        }
    }

    /// Resolve a request path against the base directory and check it is a file
    fn resolve(&self, field: &str, path: &Path) -> RunnerResult<PathBuf> {
        let full = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.config.base_dir.join(path)
        };

        match std::fs::metadata(&full) {
            Ok(meta) if meta.is_file() => full.canonicalize().map_err(|e| {
                RunnerError::ConfigResolution(format!("{} {}: {}", field, full.display(), e))
            }),
            Ok(_) => Err(RunnerError::ConfigResolution(format!(
                "{} {} is not a file",
                field,
                full.display()
            ))),
            Err(e) => Err(RunnerError::ConfigResolution(format!(
                "{} {}: {}",
                field,
                full.display(),
                e
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Session {
    id: Uuid,
    state: SessionState,
}

impl Session {
    fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            state: SessionState::Idle,
        }
    }

    fn transition(&mut self, next: SessionState) {
        debug!(session = %self.id, "{:?} -> {:?}", self.state, next);
        self.state = next;
    }
}

/// Map a finished session onto pass or a categorized failure
fn classify(
    status: ExitStatus,
    report: &EngineReport,
    stdout: &[String],
    stderr: &[String],
) -> RunnerResult<()> {
    if report.has_failures() {
        return Err(RunnerError::AssertionFailure(report.failures.clone()));
    }
    if status.success() {
        return Ok(());
    }

    let source = if stderr.iter().any(|l| !l.trim().is_empty()) { stderr } else { stdout };
    let mut detail = tail(source, ERROR_TAIL_LINES);
    if detail.is_empty() {
        detail = describe_status(status);
    }

    Err(RunnerError::AutomationEngine {
        exit_code: status.code(),
        detail,
    })
}

fn tail(lines: &[String], n: usize) -> String {
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n").trim().to_string()
}

fn describe_status(status: ExitStatus) -> String {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return format!("terminated by signal {}", signal);
        }
    }
    format!("exited with {}", status)
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

fn spawn_reader<R>(
    reader: Option<R>,
    stream: Stream,
    session: Uuid,
    tx: mpsc::UnboundedSender<(Stream, String)>,
) -> Option<JoinHandle<()>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let reader = reader?;
    Some(tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    debug!(session = %session, ?stream, "{}", line);
                    if tx.send((stream, line)).is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(session = %session, ?stream, "Failed reading engine output: {}", e);
                    break;
                }
            }
        }
    }))
}

async fn finish_reader(reader: Option<JoinHandle<()>>, wait: Duration) {
    let Some(mut reader) = reader else {
        return;
    };
    if timeout(wait, &mut reader).await.is_err() {
        // A process outside the group still holds the pipe open
        warn!("Engine output still open after exit, dropping the rest");
        reader.abort();
    }
}

/// SIGTERM the session's process group, then SIGKILL after the grace period
async fn terminate(child: &mut Child, pgid: Option<u32>, grace: Duration) {
    signal_group(pgid, Termination::Graceful);
    if timeout(grace, child.wait()).await.is_ok() {
        return;
    }
    warn!("Session ignored SIGTERM for {} ms, killing", grace.as_millis());
    kill_group(pgid);
    if let Err(e) = child.kill().await {
        warn!("Failed to kill engine process: {}", e);
    }
}

fn kill_group(pgid: Option<u32>) {
    signal_group(pgid, Termination::Forced);
}

/// SIGKILLs the session's process group unless already killed, including
/// when the `execute` future is dropped mid-session
struct GroupGuard {
    pgid: Option<u32>,
}

impl GroupGuard {
    fn kill(mut self) {
        kill_group(self.pgid.take());
    }
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        if let Some(pgid) = self.pgid.take() {
            debug!("Session dropped mid-run, killing process group {}", pgid);
            kill_group(Some(pgid));
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Termination {
    Graceful,
    Forced,
}

#[cfg(unix)]
fn signal_group(pgid: Option<u32>, how: Termination) {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(pgid) = pgid else {
        return;
    };
    let signal = match how {
        Termination::Graceful => Signal::SIGTERM,
        Termination::Forced => Signal::SIGKILL,
    };
    match killpg(Pid::from_raw(pgid as i32), signal) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => debug!("killpg({}, {:?}) failed: {}", pgid, signal, e),
    }
}

#[cfg(not(unix))]
fn signal_group(_pgid: Option<u32>, _how: Termination) {}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::engine::EngineConfig;
    use crate::error::ErrorCategory;
    use std::os::unix::process::ExitStatusExt;
    use tempfile::TempDir;

    /// Scenario directory where the "engine" is `sh <confjs> <specs>`
    struct FakeEngine {
        dir: TempDir,
    }

    impl FakeEngine {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            std::fs::write(dir.path().join("app.spec.js"), "// spec\n").unwrap();
            Self { dir }
        }

        fn conf(&self, name: &str, script: &str) -> &Self {
            std::fs::write(self.dir.path().join(name), script).unwrap();
            self
        }

        fn executor(&self) -> TestExecutor {
            TestExecutor::new(RunnerConfig {
                base_dir: self.dir.path().to_path_buf(),
                engine: EngineConfig::command("sh", &["{confjs}", "{specs}"]),
                kill_grace_ms: 200,
                ..Default::default()
            })
        }

        fn request(&self, conf: &str, url: &str) -> ExecutionRequest {
            ExecutionRequest::builder()
                .specs("app.spec.js")
                .confjs(conf)
                .param("url", url)
                .build()
                .unwrap()
        }
    }

    #[tokio::test]
    async fn test_passing_session() {
        let engine = FakeEngine::new();
        engine.conf("pass.conf.sh", "echo \"visiting $E2E_PARAM_URL\"\necho '2 specs, 0 failures'\n");

        let report = engine
            .executor()
            .execute(&engine.request("pass.conf.sh", "http://127.0.0.1:1/app.html"))
            .await
            .unwrap();

        assert_eq!(report.state, SessionState::Passed);
        assert_eq!(report.exit_code, Some(0));
        assert_eq!(report.specs_run, Some(2));
        assert!(report.specs.ends_with("app.spec.js"));
    }

    #[tokio::test]
    async fn test_assertion_failures_are_all_surfaced() {
        let engine = FakeEngine::new();
        engine.conf(
            "fail.conf.sh",
            "cat <<'EOF'\nFailures:\n1) nav shows login\n  Message:\n    Expected 'a' to equal 'b'.\n2) nav submits\n  Message:\n    Expected false to be true.\n\n2 specs, 2 failures\nEOF\nexit 1\n",
        );

        let err = engine
            .executor()
            .execute(&engine.request("fail.conf.sh", "http://x"))
            .await
            .unwrap_err();

        assert_eq!(err.category(), ErrorCategory::AssertionFailure);
        assert_eq!(err.failures().len(), 2);
        assert_eq!(err.failures()[0].spec, "nav shows login");
    }

    #[tokio::test]
    async fn test_engine_crash_is_not_an_assertion_failure() {
        let engine = FakeEngine::new();
        engine.conf("crash.conf.sh", "echo 'WebDriverError: chrome not reachable' >&2\nexit 135\n");

        let err = engine
            .executor()
            .execute(&engine.request("crash.conf.sh", "http://x"))
            .await
            .unwrap_err();

        match err {
            RunnerError::AutomationEngine { exit_code, detail } => {
                assert_eq!(exit_code, Some(135));
                assert!(detail.contains("chrome not reachable"));
            }
            other => panic!("expected engine error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_hanging_session_times_out_and_is_killed() {
        let engine = FakeEngine::new();
        let pid_file = engine.dir.path().join("engine.pid");
        engine.conf(
            "hang.conf.sh",
            &format!("echo $$ > {}\ntrap '' TERM\nsleep 30\n", pid_file.display()),
        );

        let started = Instant::now();
        let err = engine
            .executor()
            .execute_with_timeout(&engine.request("hang.conf.sh", "http://x"), Duration::from_millis(300))
            .await
            .unwrap_err();

        assert!(err.is_timeout(), "{:?}", err);
        assert!(matches!(err, RunnerError::TimedOut { after_ms: 300 }));
        assert!(started.elapsed() < Duration::from_secs(10));

        let pid: i32 = std::fs::read_to_string(&pid_file).unwrap().trim().parse().unwrap();
        let alive = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None::<nix::sys::signal::Signal>).is_ok();
        assert!(!alive, "engine process {} survived the timeout", pid);
    }

    /// Alive and not a zombie waiting for its reaper
    fn running(pid: i32) -> bool {
        match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
            Ok(stat) => stat
                .rsplit(')')
                .next()
                .and_then(|rest| rest.trim_start().chars().next())
                .map(|state| state != 'Z')
                .unwrap_or(false),
            Err(_) if std::path::Path::new("/proc/self").exists() => false,
            Err(_) => {
                nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None::<nix::sys::signal::Signal>)
                    .is_ok()
            }
        }
    }

    #[tokio::test]
    async fn test_cancelled_execute_kills_engine_children() {
        let engine = FakeEngine::new();
        let pid_file = engine.dir.path().join("browser.pid");
        engine.conf(
            "spawn.conf.sh",
            &format!("sleep 30 &\necho $! > {}\nwait\n", pid_file.display()),
        );

        let executor = engine.executor();
        let request = engine.request("spawn.conf.sh", "http://x");
        let cancelled = timeout(Duration::from_millis(500), executor.execute(&request)).await;
        assert!(cancelled.is_err(), "session should still be running");

        let pid: i32 = std::fs::read_to_string(&pid_file).unwrap().trim().parse().unwrap();
        let gone_by = Instant::now() + Duration::from_secs(5);
        while running(pid) && Instant::now() < gone_by {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(!running(pid), "browser process {} outlived the cancelled session", pid);
    }

    #[tokio::test]
    async fn test_missing_files_fail_before_launch() {
        let engine = FakeEngine::new();
        let request = engine.request("missing.conf.sh", "http://x");
        let err = engine.executor().execute(&request).await.unwrap_err();
        assert_eq!(err.category(), ErrorCategory::ConfigResolution);
        assert!(err.to_string().contains("confjs"));

        let err = engine
            .executor()
            .execute(
                &ExecutionRequest::builder()
                    .specs(".")
                    .confjs("missing.conf.sh")
                    .build()
                    .unwrap(),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not a file"));
    }

    #[tokio::test]
    async fn test_missing_engine_program() {
        let engine = FakeEngine::new();
        engine.conf("pass.conf.sh", "exit 0\n");
        let executor = TestExecutor::new(RunnerConfig {
            base_dir: engine.dir.path().to_path_buf(),
            engine: EngineConfig::command("definitely-not-an-engine-binary", &["{confjs}"]),
            ..Default::default()
        });

        let err = executor
            .execute(&engine.request("pass.conf.sh", "http://x"))
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::EngineNotFound(_)));
    }

    #[tokio::test]
    async fn test_sessions_get_private_profiles() {
        let engine = FakeEngine::new();
        let log = engine.dir.path().join("profiles.log");
        engine.conf(
            "profile.conf.sh",
            &format!(
                "test -e \"$E2E_PROFILE_DIR/cookies\" && exit 7\ntouch \"$E2E_PROFILE_DIR/cookies\"\necho \"$E2E_PROFILE_DIR $E2E_PARAM_URL\" >> {}\n",
                log.display()
            ),
        );

        let executor = engine.executor();
        let auth = engine.request("profile.conf.sh", "http://h/formauth/app.html");
        let skip = engine.request("profile.conf.sh", "http://h/formauth/app.html?auth=true");
        let (a, b) = tokio::join!(executor.execute(&auth), executor.execute(&skip));
        a.unwrap();
        b.unwrap();
        executor.execute(&auth).await.unwrap();

        let lines: Vec<String> = std::fs::read_to_string(&log)
            .unwrap()
            .lines()
            .map(String::from)
            .collect();
        assert_eq!(lines.len(), 3);
        let dirs: std::collections::HashSet<&str> =
            lines.iter().map(|l| l.split(' ').next().unwrap()).collect();
        assert_eq!(dirs.len(), 3);
        for dir in dirs {
            assert!(!Path::new(dir).exists(), "profile {} was not removed", dir);
        }
        assert!(lines.iter().any(|l| l.ends_with("app.html?auth=true")));
        assert!(lines.iter().any(|l| l.ends_with("formauth/app.html")));
    }

    #[test]
    fn test_classify_signal_exit() {
        let status = ExitStatus::from_raw(9);
        let err = classify(status, &EngineReport::default(), &[], &[]).unwrap_err();
        assert!(err.to_string().contains("signal 9"));
    }

    #[test]
    fn test_classify_failure_despite_zero_exit() {
        let status = ExitStatus::from_raw(0);
        let report = EngineReport::from_streams(&["1 spec, 1 failure".to_string()], &[]);
        let err = classify(status, &report, &[], &[]).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::AssertionFailure);
    }

    #[test]
    fn test_terminal_states() {
        assert!(SessionState::TimedOut.is_terminal());
        assert!(!SessionState::Running.is_terminal());
    }
}
