//! Watch-session lifecycle: spawn the watched tool, stream its output into a
//! cycle detector, wait on inferred cycle boundaries, and tear it down.

use crate::detector::{CompletionMark, CycleDetector, MarkerSet};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// How long to wait for buffered output after the process exits.
const READER_DRAIN: Duration = Duration::from_millis(500);

/// Everything needed to start one watch process.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub label: String,
    pub command: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: BTreeMap<String, String>,
}

/// Which wait a timeout or early exit interrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitPhase {
    Initial,
    Idle,
    Completion,
}

impl std::fmt::Display for WaitPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WaitPhase::Initial => write!(f, "initial check"),
            WaitPhase::Idle => write!(f, "idle"),
            WaitPhase::Completion => write!(f, "next completion"),
        }
    }
}

/// Errors that can occur while a watch session is running.
#[derive(Debug)]
pub enum SessionError {
    /// Failed to spawn the watch process.
    Spawn {
        command: String,
        source: std::io::Error,
    },
    /// A wait did not resolve within its bound.
    Timeout { phase: WaitPhase, after: Duration },
    /// The watch process exited while we were waiting on it.
    Exited { phase: WaitPhase, status: ExitStatus },
    /// Failed to query the child process.
    Io { source: std::io::Error },
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::Spawn { command, source } => {
                write!(f, "failed to spawn watch process '{}': {}", command, source)
            }
            SessionError::Timeout { phase, after } => {
                write!(
                    f,
                    "timed out after {}ms waiting for {}",
                    after.as_millis(),
                    phase
                )
            }
            SessionError::Exited { phase, status } => {
                write!(
                    f,
                    "watch process exited ({}) while waiting for {}",
                    status, phase
                )
            }
            SessionError::Io { source } => {
                write!(f, "I/O error during watch session: {}", source)
            }
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SessionError::Spawn { source, .. } => Some(source),
            SessionError::Io { source } => Some(source),
            SessionError::Timeout { .. } | SessionError::Exited { .. } => None,
        }
    }
}

/// One running watch process and everything observed from it.
///
/// The child runs in its own process group so that teardown also reaches any
/// helpers it forked (`npx` → `node`, for example). If the session is dropped
/// without `terminate` having run, the group is killed from `Drop`.
pub struct WatchSession {
    label: String,
    child: Child,
    pid: Option<u32>,
    detector: Arc<Mutex<CycleDetector>>,
    readers: Vec<JoinHandle<()>>,
    poll_interval: Duration,
    started: Instant,
    terminated: bool,
}

impl WatchSession {
    /// Spawn the watch process and start streaming its output.
    pub fn spawn(
        spec: &LaunchSpec,
        markers: MarkerSet,
        poll_interval: Duration,
    ) -> Result<Self, SessionError> {
        tracing::info!(
            scenario = %spec.label,
            command = %spec.command,
            args = ?spec.args,
            cwd = %spec.cwd.display(),
            "spawning watch process"
        );

        let started = Instant::now();
        let mut child = Command::new(&spec.command)
            .args(&spec.args)
            .current_dir(&spec.cwd)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0) // New process group for clean kill
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SessionError::Spawn {
                command: spec.command.clone(),
                source: e,
            })?;

        let pid = child.id();
        tracing::info!(scenario = %spec.label, pid = ?pid, "watch process started");

        let detector = Arc::new(Mutex::new(CycleDetector::new(markers)));
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(stdout, Arc::clone(&detector), Stream::Stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(stderr, Arc::clone(&detector), Stream::Stderr));
        }

        Ok(Self {
            label: spec.label.clone(),
            child,
            pid,
            detector,
            readers,
            poll_interval,
            started,
            terminated: false,
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Time since the process was spawned.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn is_busy(&self) -> bool {
        self.detector().is_busy()
    }

    /// Lock the detector for inspection.
    pub fn detector(&self) -> MutexGuard<'_, CycleDetector> {
        // A reader task that panicked mid-feed leaves the buffers intact.
        self.detector
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Wait until the first end marker shows up; returns time since spawn.
    pub async fn wait_for_initial(&mut self, timeout: Duration) -> Result<Duration, SessionError> {
        self.poll_until(WaitPhase::Initial, timeout, |d| d.has_completed())
            .await?;
        Ok(self.started.elapsed())
    }

    /// Wait until no cycle is in flight.
    pub async fn wait_for_idle(&mut self, timeout: Duration) -> Result<(), SessionError> {
        self.poll_until(WaitPhase::Idle, timeout, |d| !d.is_busy())
            .await
            .map(|_| ())
    }

    /// Snapshot the completion high-water mark before triggering a change.
    pub fn completion_mark(&self) -> CompletionMark {
        self.detector().mark()
    }

    /// Wait for a cycle that completes after `mark`; returns the time waited.
    pub async fn wait_for_completion_after(
        &mut self,
        mark: CompletionMark,
        timeout: Duration,
    ) -> Result<Duration, SessionError> {
        self.poll_until(WaitPhase::Completion, timeout, move |d| {
            d.completed_since(mark)
        })
        .await
    }

    /// Wait for the next cycle that completes after this call.
    pub async fn wait_for_next_completion(
        &mut self,
        timeout: Duration,
    ) -> Result<Duration, SessionError> {
        let mark = self.completion_mark();
        self.wait_for_completion_after(mark, timeout).await
    }

    /// Poll `done` against the detector every `poll_interval` until it holds.
    ///
    /// Fails with `Timeout` once `timeout` has elapsed, or `Exited` when the
    /// process is gone (and its final output did not satisfy `done`).
    async fn poll_until<F>(
        &mut self,
        phase: WaitPhase,
        timeout: Duration,
        done: F,
    ) -> Result<Duration, SessionError>
    where
        F: Fn(&CycleDetector) -> bool,
    {
        let start = Instant::now();
        loop {
            if done(&*self.detector()) {
                let waited = start.elapsed();
                tracing::debug!(
                    scenario = %self.label,
                    %phase,
                    elapsed_ms = waited.as_millis() as u64,
                    "wait resolved"
                );
                return Ok(waited);
            }

            if let Some(status) = self
                .child
                .try_wait()
                .map_err(|e| SessionError::Io { source: e })?
            {
                // Let the readers drain what the process wrote before exiting.
                self.join_readers().await;
                if done(&*self.detector()) {
                    return Ok(start.elapsed());
                }
                return Err(SessionError::Exited { phase, status });
            }

            let waited = start.elapsed();
            if waited >= timeout {
                tracing::debug!(
                    scenario = %self.label,
                    %phase,
                    busy = self.detector().is_busy(),
                    "wait timed out"
                );
                return Err(SessionError::Timeout {
                    phase,
                    after: timeout,
                });
            }

            tokio::time::sleep(self.poll_interval.min(timeout - waited)).await;
        }
    }

    /// Wait (bounded) for the output readers to hit EOF.
    async fn join_readers(&mut self) {
        let readers: Vec<_> = self.readers.drain(..).collect();
        if tokio::time::timeout(READER_DRAIN, futures::future::join_all(readers))
            .await
            .is_err()
        {
            tracing::debug!(scenario = %self.label, "output readers still open after exit");
        }
    }

    /// The last `n` lines the process wrote to stderr.
    pub fn stderr_tail(&self, n: usize) -> String {
        let detector = self.detector();
        let text = String::from_utf8_lossy(detector.stderr());
        let lines: Vec<&str> = text.lines().collect();
        lines[lines.len().saturating_sub(n)..].join("\n")
    }

    /// Stop the process group: SIGTERM, then SIGKILL after `grace`.
    pub async fn terminate(mut self, grace: Duration) {
        self.terminated = true;

        if let Ok(Some(status)) = self.child.try_wait() {
            tracing::debug!(scenario = %self.label, %status, "watch process already exited");
            signal_group(self.pid, nix::sys::signal::Signal::SIGKILL);
            self.join_readers().await;
            return;
        }

        signal_group(self.pid, nix::sys::signal::Signal::SIGTERM);
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!(scenario = %self.label, %status, "watch process terminated");
            }
            Ok(Err(e)) => {
                tracing::warn!(scenario = %self.label, error = %e, "failed to reap watch process");
            }
            Err(_) => {
                tracing::warn!(
                    scenario = %self.label,
                    grace_ms = grace.as_millis() as u64,
                    "watch process ignored SIGTERM, killing"
                );
                signal_group(self.pid, nix::sys::signal::Signal::SIGKILL);
                if let Err(e) = self.child.kill().await {
                    tracing::warn!(scenario = %self.label, error = %e, "failed to kill watch process");
                }
            }
        }

        // Helpers left in the group may still hold the pipes open.
        signal_group(self.pid, nix::sys::signal::Signal::SIGKILL);
        for reader in self.readers.drain(..) {
            reader.abort();
        }
    }
}

impl Drop for WatchSession {
    fn drop(&mut self) {
        if self.terminated {
            return;
        }
        tracing::warn!(scenario = %self.label, "watch session dropped while running, killing");
        signal_group(self.pid, nix::sys::signal::Signal::SIGKILL);
        let _ = self.child.start_kill();
        for reader in &self.readers {
            reader.abort();
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

fn spawn_reader<R>(mut source: R, detector: Arc<Mutex<CycleDetector>>, stream: Stream) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; 8192];
        loop {
            match source.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    let mut detector = detector
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                    match stream {
                        Stream::Stdout => detector.feed(&buf[..n]),
                        Stream::Stderr => detector.feed_stderr(&buf[..n]),
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, ?stream, "failed to read watch process output");
                    break;
                }
            }
        }
    })
}

/// Send `signal` to the process group led by `pid`. ESRCH (already gone) is fine.
fn signal_group(pid: Option<u32>, signal: nix::sys::signal::Signal) {
    let Some(pid) = pid else {
        return;
    };
    let pgid = nix::unistd::Pid::from_raw(pid as i32);
    match nix::sys::signal::killpg(pgid, signal) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
        Err(e) => tracing::debug!(pid, ?signal, error = %e, "failed to signal process group"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const START: &str = "Starting incremental compilation";
    const DONE: &str = "Watching for file changes.";

    fn markers() -> MarkerSet {
        MarkerSet::new(START, vec![DONE.to_string()])
    }

    fn sh(script: &str) -> LaunchSpec {
        LaunchSpec {
            label: "test".to_string(),
            command: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            cwd: std::env::temp_dir(),
            env: BTreeMap::new(),
        }
    }

    fn spawn(script: &str) -> WatchSession {
        WatchSession::spawn(&sh(script), markers(), Duration::from_millis(10)).unwrap()
    }

    const GRACE: Duration = Duration::from_millis(500);

    #[tokio::test]
    async fn test_wait_for_initial_resolves_on_end_marker() {
        let mut session = spawn(&format!("sleep 0.1; echo 'Found 0 errors. {DONE}'; sleep 5"));
        let elapsed = session
            .wait_for_initial(Duration::from_secs(5))
            .await
            .unwrap();
        assert!(elapsed.as_millis() >= 80);
        assert!(!session.is_busy());
        session.terminate(GRACE).await;
    }

    #[tokio::test]
    async fn test_wait_for_initial_times_out_without_marker() {
        let mut session = spawn("echo 'nothing useful'; sleep 5");
        let err = session
            .wait_for_initial(Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SessionError::Timeout {
                phase: WaitPhase::Initial,
                ..
            }
        ));
        assert!(err.to_string().contains("timed out"));
        session.terminate(GRACE).await;
    }

    #[tokio::test]
    async fn test_wait_reports_early_exit() {
        let mut session = spawn("echo boom >&2; exit 3");
        let err = session
            .wait_for_initial(Duration::from_secs(5))
            .await
            .unwrap_err();
        match err {
            SessionError::Exited { phase, status } => {
                assert_eq!(phase, WaitPhase::Initial);
                assert_eq!(status.code(), Some(3));
            }
            other => panic!("expected Exited, got {other:?}"),
        }
        assert_eq!(session.stderr_tail(5), "boom");
        session.terminate(GRACE).await;
    }

    #[tokio::test]
    async fn test_marker_printed_just_before_exit_still_counts() {
        let mut session = spawn(&format!("echo '{DONE}'"));
        session
            .wait_for_initial(Duration::from_secs(5))
            .await
            .unwrap();
        session.terminate(GRACE).await;
    }

    #[tokio::test]
    async fn test_next_completion_skips_already_observed_cycle() {
        let mut session = spawn(&format!(
            "echo '{DONE}'; sleep 0.3; echo '{START}'; echo '{DONE}'; sleep 5"
        ));
        session
            .wait_for_initial(Duration::from_secs(5))
            .await
            .unwrap();

        let waited = session
            .wait_for_next_completion(Duration::from_secs(5))
            .await
            .unwrap();
        // Resolving immediately would mean the first completion was counted twice.
        assert!(waited.as_millis() >= 150, "resolved after {waited:?}");
        session.terminate(GRACE).await;
    }

    #[tokio::test]
    async fn test_wait_for_idle_waits_out_in_flight_cycle() {
        let mut session = spawn(&format!(
            "echo '{DONE}'; echo '{START}'; sleep 0.2; echo '{DONE}'; sleep 5"
        ));
        session
            .wait_for_initial(Duration::from_secs(5))
            .await
            .unwrap();
        session.wait_for_idle(Duration::from_secs(5)).await.unwrap();
        assert!(!session.is_busy());
        session.terminate(GRACE).await;
    }

    #[tokio::test]
    async fn test_wait_for_idle_times_out_when_stuck_busy() {
        let mut session = spawn(&format!("echo '{START}'; sleep 5"));
        tokio::time::sleep(Duration::from_millis(100)).await;
        let err = session
            .wait_for_idle(Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SessionError::Timeout {
                phase: WaitPhase::Idle,
                ..
            }
        ));
        session.terminate(GRACE).await;
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let spec = LaunchSpec {
            command: "nonexistent-watch-binary-xyz".to_string(),
            args: vec![],
            ..sh("")
        };
        let err = WatchSession::spawn(&spec, markers(), Duration::from_millis(10))
            .err()
            .unwrap();
        assert!(matches!(err, SessionError::Spawn { .. }));
        assert!(err.to_string().contains("failed to spawn"));
    }

    #[tokio::test]
    async fn test_terminate_kills_process_that_ignores_sigterm() {
        let session = spawn("trap '' TERM; while true; do sleep 0.05; done");
        assert!(session.pid().is_some());
        tokio::time::sleep(Duration::from_millis(100)).await;

        let start = std::time::Instant::now();
        session.terminate(Duration::from_millis(200)).await;
        assert!(start.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_terminate_after_exit_is_quiet() {
        let mut session = spawn("exit 0");
        let result = session.wait_for_idle(Duration::from_secs(5)).await;
        // Nothing is busy, so idle resolves even though the process is gone.
        assert!(result.is_ok());
        tokio::time::sleep(Duration::from_millis(100)).await;
        session.terminate(GRACE).await;
    }

    #[tokio::test]
    async fn test_environment_is_passed_through() {
        let mut spec = sh(&format!("echo \"$WATCHBENCH_GREETING {DONE}\"; sleep 5"));
        spec.env
            .insert("WATCHBENCH_GREETING".to_string(), "hello".to_string());
        let mut session = WatchSession::spawn(&spec, markers(), Duration::from_millis(10)).unwrap();
        session
            .wait_for_initial(Duration::from_secs(5))
            .await
            .unwrap();
        let stdout = String::from_utf8_lossy(session.detector().stdout()).to_string();
        assert!(stdout.starts_with("hello"));
        session.terminate(GRACE).await;
    }
}
