//! Worker process supervision.
//!
//! A [`Supervisor`] owns at most one [`WorkerHandle`]. The handle merges the
//! child's stdout and stderr into a single line channel fed by one reader
//! task per stream; the channel closes once both pipes reach EOF.

pub mod bootstrap;
mod launch;

pub use launch::{plan_launch, EnvSnapshot, LaunchPlan, LaunchStrategy, Platform};

use crate::model::OutputStream;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("worker script not found: {}", .0.display())]
    ScriptMissing(PathBuf),
    #[error("unsupported worker script: {}", .0.display())]
    UnsupportedScript(PathBuf),
    #[error("a worker process is already running")]
    AlreadyRunning,
    #[error("failed to write bootstrap wrapper {}: {source}", path.display())]
    Wrapper {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to stop worker: {0}")]
    Stop(#[source] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct StartOptions {
    pub python: PathBuf,
    pub platform: Platform,
    pub extra_env: Vec<(OsString, OsString)>,
}

impl Default for StartOptions {
    fn default() -> Self {
        Self {
            python: default_python(),
            platform: Platform::current(),
            extra_env: Vec::new(),
        }
    }
}

pub fn default_python() -> PathBuf {
    if cfg!(windows) {
        PathBuf::from("python")
    } else {
        PathBuf::from("python3")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub text: String,
}

/// How a worker process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitOutcome {
    pub code: Option<i32>,
    pub requested: bool,
}

impl ExitOutcome {
    fn from_status(status: Option<ExitStatus>, requested: bool) -> Self {
        Self {
            code: status.and_then(|s| s.code()),
            requested,
        }
    }

    /// Exit not asked for and not clean.
    pub fn is_failure(&self) -> bool {
        !self.requested && self.code != Some(0)
    }
}

/// One running worker process.
pub struct WorkerHandle {
    child: Child,
    pid: Option<u32>,
    plan: LaunchPlan,
    lines: mpsc::UnboundedReceiver<OutputLine>,
    readers: Vec<JoinHandle<()>>,
    stop_requested: bool,
    kill_deadline: Option<Instant>,
    exit: Option<ExitStatus>,
}

fn spawn_reader<R>(
    reader: R,
    stream: OutputStream,
    tx: mpsc::UnboundedSender<OutputLine>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::with_capacity(256);
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let text = String::from_utf8_lossy(&buf);
                    let text = text.trim();
                    if text.is_empty() {
                        continue;
                    }
                    let line = OutputLine {
                        stream,
                        text: text.to_string(),
                    };
                    if tx.send(line).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(?stream, error = %e, "worker output read failed");
                    break;
                }
            }
        }
    })
}

/// Spawn the process described by `plan`.
pub fn spawn(plan: LaunchPlan, extra_env: &[(OsString, OsString)]) -> Result<WorkerHandle, SupervisorError> {
    if let Some(wrapper) = &plan.wrapper {
        std::fs::write(&wrapper.path, &wrapper.contents).map_err(|source| {
            SupervisorError::Wrapper {
                path: wrapper.path.clone(),
                source,
            }
        })?;
    }

    let mut cmd = Command::new(&plan.program);
    cmd.args(&plan.args)
        .current_dir(&plan.working_dir)
        .envs(plan.env.iter().cloned())
        .envs(extra_env.iter().cloned())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);
    #[cfg(windows)]
    cmd.creation_flags(CREATE_NO_WINDOW);

    let mut child = cmd.spawn().map_err(|source| SupervisorError::Spawn {
        program: plan.program.to_string_lossy().into_owned(),
        source,
    })?;
    let pid = child.id();
    tracing::info!(
        pid,
        script = %plan.script.display(),
        strategy = ?plan.strategy,
        cwd = %plan.working_dir.display(),
        "worker process spawned"
    );

    let (tx, rx) = mpsc::unbounded_channel();
    let mut readers = Vec::with_capacity(2);
    if let Some(out) = child.stdout.take() {
        readers.push(spawn_reader(out, OutputStream::Stdout, tx.clone()));
    }
    if let Some(err) = child.stderr.take() {
        readers.push(spawn_reader(err, OutputStream::Stderr, tx));
    }

    Ok(WorkerHandle {
        child,
        pid,
        plan,
        lines: rx,
        readers,
        stop_requested: false,
        kill_deadline: None,
        exit: None,
    })
}

#[cfg(unix)]
fn signal_group(pid: u32, sig: libc::c_int) -> std::io::Result<()> {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return Ok(());
    };
    // The child leads its own process group; a negative pid signals the group.
    let rc = unsafe { libc::kill(-pid, sig) };
    if rc == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(())
    } else {
        Err(err)
    }
}

impl WorkerHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn plan(&self) -> &LaunchPlan {
        &self.plan
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_requested
    }

    pub fn is_running(&mut self) -> bool {
        self.try_exit().is_none()
    }

    /// Next merged output line; `None` once both streams are closed.
    pub async fn next_line(&mut self) -> Option<OutputLine> {
        self.lines.recv().await
    }

    /// Non-blocking exit check.
    pub fn try_exit(&mut self) -> Option<ExitStatus> {
        if self.exit.is_none() {
            self.exit = self.child.try_wait().ok().flatten();
        }
        self.exit
    }

    pub async fn wait(&mut self) -> std::io::Result<ExitStatus> {
        if let Some(status) = self.exit {
            return Ok(status);
        }
        let status = self.child.wait().await?;
        self.exit = Some(status);
        Ok(status)
    }

    /// Ask the worker to terminate: the whole process tree via `taskkill` on
    /// Windows, SIGTERM to the process group elsewhere. Arms a kill deadline
    /// `grace` from now that [`WorkerHandle::enforce_grace`] acts on. No-op
    /// once exited.
    pub async fn request_stop(&mut self, grace: Duration) -> Result<(), SupervisorError> {
        if self.try_exit().is_some() {
            return Ok(());
        }
        self.stop_requested = true;
        self.kill_deadline = Some(Instant::now() + grace);
        let Some(pid) = self.pid else {
            return Ok(());
        };
        tracing::info!(pid, ?grace, "stopping worker process");

        #[cfg(windows)]
        {
            let status = Command::new("taskkill")
                .args(["/F", "/T", "/PID", &pid.to_string()])
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await
                .map_err(SupervisorError::Stop)?;
            if !status.success() {
                tracing::warn!(pid, ?status, "taskkill reported failure");
            }
        }
        #[cfg(unix)]
        {
            signal_group(pid, libc::SIGTERM).map_err(SupervisorError::Stop)?;
        }
        Ok(())
    }

    /// Kill the worker when a requested stop outlived its grace period.
    /// Returns true when a kill was issued. Call periodically while draining
    /// output.
    pub fn enforce_grace(&mut self) -> bool {
        let Some(deadline) = self.kill_deadline else {
            return false;
        };
        if Instant::now() < deadline {
            return false;
        }
        self.kill_deadline = None;
        if !self.is_running() {
            return false;
        }
        tracing::warn!(pid = self.pid, "worker ignored termination, killing");
        self.force_kill();
        true
    }

    fn force_kill(&mut self) {
        #[cfg(unix)]
        if let Some(pid) = self.pid {
            if let Err(e) = signal_group(pid, libc::SIGKILL) {
                tracing::warn!(pid, error = %e, "SIGKILL to worker group failed");
            }
        }
        if let Err(e) = self.child.start_kill() {
            tracing::debug!(error = %e, "start_kill on worker failed");
        }
    }

    /// Stop listening for output; used when the process has exited but a
    /// descendant still holds the pipes open.
    pub fn detach_readers(&mut self) {
        for r in self.readers.drain(..) {
            r.abort();
        }
        self.lines.close();
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        for r in &self.readers {
            r.abort();
        }
    }
}

/// Owner of the (at most one) supervised worker.
pub struct Supervisor {
    options: StartOptions,
    handle: Option<WorkerHandle>,
}

impl Supervisor {
    pub fn new(options: StartOptions) -> Self {
        Self {
            options,
            handle: None,
        }
    }

    pub fn options(&self) -> &StartOptions {
        &self.options
    }

    /// Resolve the launch strategy for `script` without spawning.
    pub fn plan(&self, script: &Path) -> Result<LaunchPlan, SupervisorError> {
        if !script.exists() {
            return Err(SupervisorError::ScriptMissing(script.to_path_buf()));
        }
        plan_launch(
            script,
            self.options.platform,
            &self.options.python,
            &EnvSnapshot::capture(),
        )
    }

    pub fn start_plan(&mut self, plan: LaunchPlan) -> Result<&mut WorkerHandle, SupervisorError> {
        if self.handle.is_some() {
            return Err(SupervisorError::AlreadyRunning);
        }
        let handle = spawn(plan, &self.options.extra_env)?;
        Ok(self.handle.insert(handle))
    }

    /// Take the handle after its output closed and wait for the exit status.
    pub async fn reap(&mut self) -> Option<ExitOutcome> {
        let mut h = self.handle.take()?;
        let status = h.wait().await.ok();
        Some(ExitOutcome::from_status(status, h.stop_requested()))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::test_support::TempDir;

    fn bash_plan(dir: &TempDir, body: &str) -> LaunchPlan {
        let script = dir.write("horde-bridge.sh", body);
        plan_launch(
            &script,
            Platform::Unix,
            Path::new("python3"),
            &EnvSnapshot::default(),
        )
        .unwrap()
    }

    async fn drain(h: &mut WorkerHandle) -> Vec<OutputLine> {
        let mut out = Vec::new();
        while let Some(l) =
            tokio::time::timeout(Duration::from_secs(10), h.next_line()).await.unwrap()
        {
            out.push(l);
        }
        out
    }

    #[tokio::test]
    async fn merges_stdout_and_stderr_and_reports_exit_code() {
        let dir = TempDir::new("sup-merge");
        let plan = bash_plan(&dir, "echo hello\n\necho 'ERROR oops' >&2\nexit 3\n");
        let mut sup = Supervisor::new(StartOptions::default());
        let h = sup.start_plan(plan).unwrap();
        let lines = drain(h).await;

        assert!(lines.contains(&OutputLine {
            stream: OutputStream::Stdout,
            text: "hello".into()
        }));
        assert!(lines.contains(&OutputLine {
            stream: OutputStream::Stderr,
            text: "ERROR oops".into()
        }));
        assert_eq!(lines.len(), 2);

        let outcome = sup.reap().await.unwrap();
        assert_eq!(outcome.code, Some(3));
        assert!(!outcome.requested);
        assert!(outcome.is_failure());
    }

    #[tokio::test]
    async fn runs_in_script_directory() {
        let dir = TempDir::new("sup-cwd");
        let plan = bash_plan(&dir, "pwd\n");
        let expected = plan.working_dir.clone();
        let mut sup = Supervisor::new(StartOptions::default());
        let lines = drain(sup.start_plan(plan).unwrap()).await;
        let reported = std::fs::canonicalize(&lines[0].text).unwrap();
        assert_eq!(reported, std::fs::canonicalize(expected).unwrap());
    }

    #[tokio::test]
    async fn stop_terminates_a_long_running_worker() {
        let dir = TempDir::new("sup-stop");
        let plan = bash_plan(&dir, "echo ready\nsleep 30\n");
        let mut sup = Supervisor::new(StartOptions::default());
        let h = sup.start_plan(plan).unwrap();
        let first = tokio::time::timeout(Duration::from_secs(10), h.next_line())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.text, "ready");

        h.request_stop(Duration::from_secs(5)).await.unwrap();
        assert!(h.stop_requested());
        drain(h).await;

        let outcome = sup.reap().await.unwrap();
        assert!(outcome.requested);
        assert!(!outcome.is_failure());
        assert!(sup.reap().await.is_none());
    }

    #[tokio::test]
    async fn worker_ignoring_sigterm_is_killed_after_grace() {
        let dir = TempDir::new("sup-grace");
        let plan = bash_plan(&dir, "trap '' TERM\necho ready\nsleep 30\n");
        let mut sup = Supervisor::new(StartOptions::default());
        let h = sup.start_plan(plan).unwrap();
        let first = tokio::time::timeout(Duration::from_secs(10), h.next_line())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.text, "ready");

        h.request_stop(Duration::from_millis(200)).await.unwrap();
        assert!(!h.enforce_grace());
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(h.is_running());
        assert!(h.enforce_grace());
        assert!(!h.enforce_grace());
        drain(h).await;

        let outcome = sup.reap().await.unwrap();
        assert!(outcome.requested);
        assert_eq!(outcome.code, None);
    }

    #[tokio::test]
    async fn stop_after_exit_is_a_noop() {
        let dir = TempDir::new("sup-exited");
        let plan = bash_plan(&dir, "exit 0\n");
        let mut sup = Supervisor::new(StartOptions::default());
        assert!(sup.reap().await.is_none());

        let h = sup.start_plan(plan).unwrap();
        drain(h).await;
        h.wait().await.unwrap();
        h.request_stop(Duration::from_secs(1)).await.unwrap();
        assert!(!h.stop_requested());
        assert!(!h.enforce_grace());
        let outcome = sup.reap().await.unwrap();
        assert!(!outcome.requested);
        assert_eq!(outcome.code, Some(0));
    }

    #[tokio::test]
    async fn second_start_is_rejected() {
        let dir = TempDir::new("sup-twice");
        let plan = bash_plan(&dir, "sleep 1\n");
        let mut sup = Supervisor::new(StartOptions::default());
        sup.start_plan(plan.clone()).unwrap();
        assert!(matches!(
            sup.start_plan(plan),
            Err(SupervisorError::AlreadyRunning)
        ));
        assert!(sup.reap().await.is_some());
    }

    #[tokio::test]
    async fn missing_script_is_reported_before_spawn() {
        let dir = TempDir::new("sup-missing");
        let sup = Supervisor::new(StartOptions::default());
        let err = sup.plan(&dir.path().join("horde-bridge.sh")).unwrap_err();
        assert!(matches!(err, SupervisorError::ScriptMissing(_)));
    }

    #[tokio::test]
    async fn interpreter_launch_writes_wrapper() {
        let dir = TempDir::new("sup-wrapper");
        let script = dir.write("run_worker.py", "print('hi')\n");
        let options = StartOptions {
            python: PathBuf::from("/definitely/not/a/python"),
            ..Default::default()
        };
        let mut sup = Supervisor::new(options);
        let plan = sup.plan(&script).unwrap();
        let err = sup.start_plan(plan).err().expect("spawn must fail");
        assert!(matches!(err, SupervisorError::Spawn { .. }));
        assert!(dir.path().join(bootstrap::WRAPPER_FILE_NAME).exists());
    }
}
