//! wireproxy process lifecycle
//!
//! The supervisor owns at most one child process. A watcher task waits on the
//! child and flips the state back to `Stopped` whenever it exits, so `state()`
//! reflects reality without polling.
//!
//! ```text
//! Stopped --start()--> Starting --spawn ok--> Running --exit/stop()--> Stopped
//!                          \--spawn err--> Stopped
//! ```

use crate::platform::ProcessTerminator;
use serde::Serialize;
use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
}

/// The proxy went away without being asked to
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("wireproxy exited unexpectedly: {status}")]
pub struct RuntimeExit {
    pub status: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    Stopped,
    Starting,
    Running,
}

/// Handle to the live child, owned by the supervisor
struct ProxyProcess {
    pid: u32,
    generation: u64,
    kill_tx: Option<oneshot::Sender<()>>,
    exited: watch::Receiver<bool>,
}

impl ProxyProcess {
    /// Ask the watcher task to SIGKILL / TerminateProcess the child
    fn force_kill(&mut self) {
        if let Some(tx) = self.kill_tx.take() {
            let _ = tx.send(());
        }
    }

    /// Wait up to `timeout` for the watcher to observe the exit
    async fn wait_exited(&mut self, timeout: Duration) -> bool {
        match tokio::time::timeout(timeout, self.exited.wait_for(|exited| *exited)).await {
            Ok(_) => true,
            Err(_) => false,
        }
    }
}

struct Inner {
    state: ProcessState,
    process: Option<ProxyProcess>,
    generation: u64,
    last_exit: Option<RuntimeExit>,
}

pub struct ProcessSupervisor {
    executable: PathBuf,
    config_path: PathBuf,
    terminator: Box<dyn ProcessTerminator>,
    stop_timeout: Duration,
    inner: Arc<Mutex<Inner>>,
}

impl ProcessSupervisor {
    pub fn new(
        executable: impl Into<PathBuf>,
        config_path: impl Into<PathBuf>,
        terminator: Box<dyn ProcessTerminator>,
        stop_timeout: Duration,
    ) -> Self {
        Self {
            executable: executable.into(),
            config_path: config_path.into(),
            terminator,
            stop_timeout,
            inner: Arc::new(Mutex::new(Inner {
                state: ProcessState::Stopped,
                process: None,
                generation: 0,
                last_exit: None,
            })),
        }
    }

    pub fn state(&self) -> ProcessState {
        lock(&self.inner).state
    }

    pub fn is_running(&self) -> bool {
        self.state() == ProcessState::Running
    }

    pub fn pid(&self) -> Option<u32> {
        lock(&self.inner).process.as_ref().map(|p| p.pid)
    }

    /// Why the last run ended, if it ended on its own
    pub fn last_exit(&self) -> Option<RuntimeExit> {
        lock(&self.inner).last_exit.clone()
    }

    /// Spawn wireproxy with the config path as its only argument
    ///
    /// Returns once the process is spawned; it does not wait for the listeners
    /// to bind. Must be called from within a Tokio runtime.
    pub fn start(&self) -> Result<(), SupervisorError> {
        let mut inner = lock(&self.inner);
        if inner.state == ProcessState::Running {
            info!("wireproxy already running");
            return Ok(());
        }

        info!("Starting wireproxy...");
        inner.state = ProcessState::Starting;

        let mut cmd = Command::new(&self.executable);
        cmd.arg(&self.config_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(windows)]
        cmd.creation_flags(crate::platform::windows::CREATE_NO_WINDOW);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(source) => {
                inner.state = ProcessState::Stopped;
                return Err(SupervisorError::Spawn {
                    program: self.executable.display().to_string(),
                    source,
                });
            }
        };

        // Only `None` once the child has been reaped, which nothing has done yet
        let Some(pid) = child.id() else {
            inner.state = ProcessState::Stopped;
            return Err(SupervisorError::Spawn {
                program: self.executable.display().to_string(),
                source: io::Error::other("process exited before its pid was read"),
            });
        };
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output(stdout, OutputStream::Stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(stderr, OutputStream::Stderr));
        }

        inner.generation += 1;
        let generation = inner.generation;
        let (kill_tx, kill_rx) = oneshot::channel();
        let (exited_tx, exited_rx) = watch::channel(false);

        inner.process = Some(ProxyProcess {
            pid,
            generation,
            kill_tx: Some(kill_tx),
            exited: exited_rx,
        });
        inner.state = ProcessState::Running;
        inner.last_exit = None;
        drop(inner);

        tokio::spawn(watch_process(
            child,
            kill_rx,
            exited_tx,
            Arc::clone(&self.inner),
            generation,
        ));

        info!("wireproxy started (pid {})", pid);
        Ok(())
    }

    /// Terminate the running process, if any
    ///
    /// Asks politely first (SIGTERM, or `taskkill /f /t` on Windows) and
    /// escalates to a forced kill when that fails or the process outlives
    /// the stop timeout. The state is `Stopped` afterwards in every case.
    pub async fn stop(&self) {
        let process = {
            let mut inner = lock(&self.inner);
            inner.state = ProcessState::Stopped;
            inner.process.take()
        };

        let Some(mut process) = process else {
            debug!("wireproxy not running, nothing to stop");
            return;
        };

        info!("Stopping wireproxy...");
        match self.terminator.terminate(process.pid) {
            Ok(()) => {
                if !process.wait_exited(self.stop_timeout).await {
                    warn!(
                        "wireproxy still alive {:?} after termination request, killing",
                        self.stop_timeout
                    );
                    process.force_kill();
                }
            }
            Err(e) => {
                error!("Failed to stop wireproxy: {}", e);
                process.force_kill();
            }
        }

        if !process.wait_exited(self.stop_timeout).await {
            error!("wireproxy (pid {}) did not exit after forced kill", process.pid);
            return;
        }
        info!("wireproxy stopped");
    }
}

fn lock(inner: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Copy)]
enum OutputStream {
    Stdout,
    Stderr,
}

/// Log every output line until EOF
///
/// The pipe stays open for the child's whole life: closing it early would
/// kill wireproxy with SIGPIPE on its next write.
async fn forward_output<R>(reader: R, stream: OutputStream)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&line);
                let text = text.trim_end();
                match stream {
                    OutputStream::Stdout => info!("wireproxy: {}", text),
                    OutputStream::Stderr => warn!("wireproxy: {}", text),
                }
            }
            Err(e) => {
                debug!("wireproxy {:?} unreadable, discarding the rest: {}", stream, e);
                if let Err(e) = tokio::io::copy(&mut reader, &mut tokio::io::sink()).await {
                    debug!("wireproxy {:?} closed: {}", stream, e);
                }
                break;
            }
        }
    }
}

/// Owns the child until it exits, then clears the supervisor's handle
async fn watch_process(
    mut child: Child,
    mut kill_rx: oneshot::Receiver<()>,
    exited_tx: watch::Sender<bool>,
    inner: Arc<Mutex<Inner>>,
    generation: u64,
) {
    // A dropped sender disables the kill branch instead of firing it
    let exited = tokio::select! {
        status = child.wait() => Some(status),
        Ok(()) = &mut kill_rx => None,
    };

    let status = match exited {
        Some(status) => status,
        None => {
            warn!("Force killing wireproxy");
            if let Err(e) = child.start_kill() {
                warn!("Kill request failed: {}", e);
            }
            child.wait().await
        }
    };

    let _ = exited_tx.send(true);

    let description = describe_exit(&status);
    info!("wireproxy exited ({})", description);

    let mut inner = lock(&inner);
    let unexpected = inner
        .process
        .as_ref()
        .is_some_and(|p| p.generation == generation);
    if unexpected {
        let exit = RuntimeExit {
            status: description,
        };
        warn!("{}", exit);
        inner.last_exit = Some(exit);
        inner.process = None;
        inner.state = ProcessState::Stopped;
    }
}

fn describe_exit(status: &io::Result<ExitStatus>) -> String {
    match status {
        Ok(status) => status.to_string(),
        Err(e) => format!("wait failed: {}", e),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::platform::unix::SignalTerminator;
    use crate::platform::PlatformError;
    use crate::test_support::write_script;
    use std::path::Path;
    use tempfile::TempDir;

    const STOP_TIMEOUT: Duration = Duration::from_secs(2);

    struct FailingTerminator;

    impl ProcessTerminator for FailingTerminator {
        fn terminate(&self, pid: u32) -> Result<(), PlatformError> {
            Err(PlatformError::TerminateError {
                pid,
                message: "access denied".to_string(),
            })
        }
    }

    fn supervisor(dir: &Path, script: &str) -> ProcessSupervisor {
        let exe = dir.join("wireproxy");
        write_script(&exe, script);
        ProcessSupervisor::new(
            exe,
            dir.join("wireproxy.conf"),
            Box::new(SignalTerminator::new()),
            STOP_TIMEOUT,
        )
    }

    async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
        for _ in 0..100 {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }

    fn is_alive(pid: u32) -> bool {
        nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None).is_ok()
    }

    #[tokio::test]
    async fn test_stop_without_process_is_noop() {
        let temp = TempDir::new().unwrap();
        let supervisor = supervisor(temp.path(), "exec sleep 30");

        supervisor.stop().await;
        supervisor.stop().await;
        assert_eq!(supervisor.state(), ProcessState::Stopped);
        assert!(supervisor.last_exit().is_none());
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let temp = TempDir::new().unwrap();
        let supervisor = supervisor(temp.path(), "exec sleep 30");

        supervisor.start().unwrap();
        assert!(supervisor.is_running());
        let pid = supervisor.pid().unwrap();
        assert!(is_alive(pid));

        // Second start keeps the same process
        supervisor.start().unwrap();
        assert_eq!(supervisor.pid(), Some(pid));

        supervisor.stop().await;
        assert_eq!(supervisor.state(), ProcessState::Stopped);
        assert_eq!(supervisor.pid(), None);
        assert!(!is_alive(pid));
        // A requested stop is not a runtime exit
        assert!(supervisor.last_exit().is_none());
    }

    #[tokio::test]
    async fn test_config_path_is_sole_argument() {
        let temp = TempDir::new().unwrap();
        let record = temp.path().join("args.txt");
        let script = format!(
            "printf '%s|%s' \"$#\" \"$1\" > '{}'\nexec sleep 30",
            record.display()
        );
        let supervisor = supervisor(temp.path(), &script);

        supervisor.start().unwrap();
        let recorded = || std::fs::read_to_string(&record).is_ok_and(|s| s.contains('|'));
        assert!(eventually(recorded).await);
        supervisor.stop().await;

        let recorded = std::fs::read_to_string(&record).unwrap();
        let expected = format!("1|{}", temp.path().join("wireproxy.conf").display());
        assert_eq!(recorded, expected);
    }

    #[tokio::test]
    async fn test_invalid_utf8_output_keeps_process_alive() {
        let temp = TempDir::new().unwrap();
        let supervisor = supervisor(
            temp.path(),
            "printf '\\377\\376 bad bytes\\n'\nprintf '\\377' >&2\n\
             while :; do echo tick; echo tock >&2; sleep 0.1; done",
        );

        supervisor.start().unwrap();
        // Long enough for many writes after the bad bytes
        tokio::time::sleep(Duration::from_millis(1500)).await;

        assert!(supervisor.is_running(), "exited: {:?}", supervisor.last_exit());
        assert!(supervisor.last_exit().is_none());
        supervisor.stop().await;
    }

    #[tokio::test]
    async fn test_unexpected_exit_flips_state() {
        let temp = TempDir::new().unwrap();
        let supervisor = supervisor(temp.path(), "echo 'bind: address already in use' >&2\nexit 7");

        supervisor.start().unwrap();
        assert!(eventually(|| !supervisor.is_running()).await);

        let exit = supervisor.last_exit().unwrap();
        assert!(exit.status.contains('7'), "status was {}", exit.status);
        assert_eq!(supervisor.pid(), None);

        // Stopping after the fact is still fine
        supervisor.stop().await;
        assert_eq!(supervisor.state(), ProcessState::Stopped);
    }

    #[tokio::test]
    async fn test_restart_after_exit() {
        let temp = TempDir::new().unwrap();
        let supervisor = supervisor(temp.path(), "exit 0");

        supervisor.start().unwrap();
        assert!(eventually(|| !supervisor.is_running()).await);

        supervisor.start().unwrap();
        assert!(eventually(|| !supervisor.is_running()).await);
        assert!(supervisor.last_exit().is_some());
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let temp = TempDir::new().unwrap();
        let supervisor = ProcessSupervisor::new(
            temp.path().join("missing-wireproxy"),
            temp.path().join("wireproxy.conf"),
            Box::new(SignalTerminator::new()),
            STOP_TIMEOUT,
        );

        let err = supervisor.start().unwrap_err();
        assert!(err.to_string().contains("missing-wireproxy"));
        assert_eq!(supervisor.state(), ProcessState::Stopped);
    }

    #[tokio::test]
    async fn test_ignored_sigterm_escalates_to_kill() {
        let temp = TempDir::new().unwrap();
        let exe = temp.path().join("wireproxy");
        write_script(&exe, "trap '' TERM\nwhile :; do sleep 1; done");
        let supervisor = ProcessSupervisor::new(
            exe,
            temp.path().join("wireproxy.conf"),
            Box::new(SignalTerminator::new()),
            Duration::from_millis(300),
        );

        supervisor.start().unwrap();
        let pid = supervisor.pid().unwrap();
        // Give the shell time to install its trap
        tokio::time::sleep(Duration::from_millis(200)).await;

        supervisor.stop().await;
        assert_eq!(supervisor.state(), ProcessState::Stopped);
        assert!(!is_alive(pid));
    }

    #[tokio::test]
    async fn test_failed_termination_request_forces_kill() {
        let temp = TempDir::new().unwrap();
        let exe = temp.path().join("wireproxy");
        write_script(&exe, "exec sleep 30");
        let supervisor = ProcessSupervisor::new(
            exe,
            temp.path().join("wireproxy.conf"),
            Box::new(FailingTerminator),
            STOP_TIMEOUT,
        );

        supervisor.start().unwrap();
        let pid = supervisor.pid().unwrap();

        supervisor.stop().await;
        assert_eq!(supervisor.state(), ProcessState::Stopped);
        assert!(!is_alive(pid));
    }
}
