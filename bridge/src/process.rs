use core::fmt;
use std::io;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use portable_pty::MasterPty;
use portable_pty::PtySize;
use portable_pty::SlavePty;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::warn;

use crate::config::BridgeConfig;
use crate::error::ControlError;
use crate::error::StreamKind;
use crate::pump::PumpState;
use crate::pump::PumpStates;
use crate::pump::PumpStatus;
use crate::pump::pump_name;
use crate::queue::CloseReason;
use crate::queue::InputQueue;
use crate::queue::OutputQueue;
use crate::queue::QueueCloser;

pub(crate) trait ChildTerminator: Send + Sync {
    fn kill(&mut self) -> io::Result<()>;
}

/// Unblocks pumps stuck in a blocking read or write on a wrapped handle.
pub(crate) trait StreamCanceller: Send + Sync {
    fn cancel(&self);
}

/// How a child process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    pub code: Option<i32>,
    /// Terminating signal on Unix when the child did not exit normally.
    pub signal: Option<i32>,
}

impl ProcessExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Shell-style status: the exit code, `128 + signal` when killed by a
    /// signal, or `-1` if neither is known.
    pub fn shell_code(&self) -> i32 {
        match (self.code, self.signal) {
            (Some(code), _) => code,
            (None, Some(signal)) => 128 + signal,
            (None, None) => -1,
        }
    }

    pub(crate) fn from_std(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;
        Self {
            code: status.code(),
            signal,
        }
    }
}

/// Result of [`ChildProcess::shutdown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownOutcome {
    /// `None` for wrapped handles, which have no process to wait for.
    pub exit: Option<ProcessExit>,
    /// The grace period elapsed and the child was killed.
    pub forced: bool,
    /// Some pump did not observe stream closure in time and was abandoned.
    pub pumps_aborted: bool,
}

pub(crate) struct PtyHandles {
    pub(crate) master: Box<dyn MasterPty + Send>,
    // Windows delivers Control+C to the child once the slave is closed, so it
    // is kept open for the lifetime of the process there.
    pub(crate) _slave: Option<Box<dyn SlavePty + Send>>,
}

/// A running pump as seen by the process handle.
pub(crate) struct PumpHandle {
    pub(crate) stream: StreamKind,
    pub(crate) status: PumpStatus,
    pub(crate) closer: QueueCloser,
    pub(crate) task: JoinHandle<()>,
}

/// Everything a launcher hands over to [`ChildProcess`].
pub(crate) struct ProcessParts {
    pub(crate) pid: Option<u32>,
    pub(crate) config: BridgeConfig,
    pub(crate) killer: Option<Box<dyn ChildTerminator>>,
    pub(crate) input: QueueCloser,
    pub(crate) pumps: Vec<PumpHandle>,
    pub(crate) exit_rx: Option<watch::Receiver<Option<ProcessExit>>>,
    pub(crate) pty: Option<PtyHandles>,
    pub(crate) canceller: Option<Box<dyn StreamCanceller>>,
}

struct PumpSlot {
    stream: StreamKind,
    status: PumpStatus,
    closer: QueueCloser,
    task: Option<JoinHandle<()>>,
}

/// Owns a launched child (or a wrapped handle) and the pumps bound to its
/// streams.
///
/// Dropping a handle whose process is still running kills the process and
/// closes its queues. A wrapped handle is torn down the same way while any of
/// its pumps is still running.
pub struct ChildProcess {
    pid: Option<u32>,
    config: BridgeConfig,
    killer: StdMutex<Option<Box<dyn ChildTerminator>>>,
    input: QueueCloser,
    pumps: StdMutex<Vec<PumpSlot>>,
    exit_rx: Option<watch::Receiver<Option<ProcessExit>>>,
    pty: StdMutex<Option<PtyHandles>>,
    canceller: Option<Box<dyn StreamCanceller>>,
}

impl fmt::Debug for ChildProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChildProcess")
            .field("pid", &self.pid)
            .field("exit", &self.exit_status())
            .field("pumps", &self.pump_states())
            .finish()
    }
}

impl ChildProcess {
    pub(crate) fn new(parts: ProcessParts) -> Self {
        let ProcessParts {
            pid,
            config,
            killer,
            input,
            pumps,
            exit_rx,
            pty,
            canceller,
        } = parts;
        let pumps = pumps
            .into_iter()
            .map(|pump| PumpSlot {
                stream: pump.stream,
                status: pump.status,
                closer: pump.closer,
                task: Some(pump.task),
            })
            .collect();
        Self {
            pid,
            config,
            killer: StdMutex::new(killer),
            input,
            pumps: StdMutex::new(pumps),
            exit_rx,
            pty: StdMutex::new(pty),
            canceller,
        }
    }

    /// OS process id, or `None` for a wrapped handle.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn exit_status(&self) -> Option<ProcessExit> {
        self.exit_rx.as_ref().and_then(|rx| *rx.borrow())
    }

    /// True if the child process has exited.
    pub fn has_exited(&self) -> bool {
        self.exit_status().is_some()
    }

    /// Wait for the child to exit. Returns `None` immediately for wrapped
    /// handles.
    pub async fn wait(&self) -> Option<ProcessExit> {
        let mut rx = self.exit_rx.clone()?;
        let exit = rx.wait_for(Option::is_some).await.ok()?;
        *exit
    }

    pub fn pump_states(&self) -> PumpStates {
        let pumps = self.lock_pumps();
        let state_of = |wanted: &[StreamKind]| {
            pumps
                .iter()
                .find(|pump| wanted.contains(&pump.stream))
                .map(|pump| pump.status.get())
        };
        PumpStates {
            input: state_of(&[StreamKind::Stdin, StreamKind::Input]).unwrap_or(PumpState::Closed),
            output: state_of(&[StreamKind::Stdout, StreamKind::Output])
                .unwrap_or(PumpState::Closed),
            error: state_of(&[StreamKind::Stderr]),
        }
    }

    /// Send a kill to the child (its whole process group for piped children on
    /// Unix). A no-op for wrapped handles.
    pub fn kill(&self) -> Result<(), ControlError> {
        let mut killer = self
            .killer
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        match killer.as_mut() {
            Some(killer) => killer.kill().map_err(ControlError::Kill),
            None => Ok(()),
        }
    }

    /// Kill the child right away, close every queue and abort the pumps.
    pub fn terminate(&self) {
        if let Err(err) = self.kill() {
            warn!(pid = ?self.pid, "failed to kill child: {err}");
        }
        self.abort_pumps();
    }

    /// Resize the pseudo-terminal of a process started with
    /// [`crate::launch_pty`].
    pub fn resize(&self, rows: u16, cols: u16) -> Result<(), ControlError> {
        let pty = self.pty.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let Some(pty) = pty.as_ref() else {
            return Err(ControlError::NotPty);
        };
        pty.master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|err| ControlError::Resize(format!("{err:#}")))
    }

    /// [`ChildProcess::shutdown`] with the configured grace period.
    pub async fn shutdown_default(&self) -> Result<ShutdownOutcome, ControlError> {
        self.shutdown(self.config.shutdown_timeout()).await
    }

    /// Stop the child in an orderly way.
    ///
    /// New input is refused and the input pump closes the child's input once
    /// the chunks already queued are written. The child then gets `timeout` to
    /// exit on its own before it is killed. Finally the pumps get another
    /// `timeout` to observe end-of-stream; any still running after that are
    /// abandoned and their queues closed as [`CloseReason::Aborted`].
    pub async fn shutdown(&self, timeout: Duration) -> Result<ShutdownOutcome, ControlError> {
        debug!(pid = ?self.pid, ?timeout, "shutting down");
        self.input.close(CloseReason::Shutdown);

        let mut forced = false;
        let mut kill_error = None;
        let exit = if self.exit_rx.is_some() {
            match tokio::time::timeout(timeout, self.wait()).await {
                Ok(exit) => exit,
                Err(_) => {
                    warn!(pid = ?self.pid, "child did not exit within {timeout:?}; killing it");
                    forced = true;
                    match self.kill() {
                        Ok(()) => tokio::time::timeout(timeout, self.wait())
                            .await
                            .ok()
                            .flatten(),
                        Err(err) => {
                            warn!(pid = ?self.pid, "failed to kill child: {err}");
                            kill_error = Some(err);
                            None
                        }
                    }
                }
            }
        } else {
            None
        };

        // The pumps are accounted for even when the kill failed, so no queue is
        // left open behind a returned error.
        let pumps_aborted = !self.join_pumps(timeout).await;
        if let Some(err) = kill_error {
            return Err(err);
        }
        debug!(pid = ?self.pid, ?exit, forced, pumps_aborted, "shutdown complete");
        Ok(ShutdownOutcome {
            exit,
            forced,
            pumps_aborted,
        })
    }

    /// Wait up to `timeout` for every pump to finish. Returns false if some had
    /// to be aborted.
    async fn join_pumps(&self, timeout: Duration) -> bool {
        let mut tasks: Vec<(StreamKind, JoinHandle<()>)> = self
            .lock_pumps()
            .iter_mut()
            .filter_map(|pump| pump.task.take().map(|task| (pump.stream, task)))
            .collect();

        let joined = tokio::time::timeout(timeout, async {
            for (stream, task) in &mut tasks {
                if let Err(err) = task.await {
                    warn!(%stream, "{} task failed: {err}", pump_name(*stream));
                }
            }
        })
        .await
        .is_ok();

        if !joined {
            for (stream, task) in &tasks {
                if !task.is_finished() {
                    warn!(%stream, "{} did not finish in time; abandoning it", pump_name(*stream));
                }
            }
            self.abort_pumps();
            for (_, task) in tasks {
                task.abort();
            }
        }
        joined
    }

    fn abort_pumps(&self) {
        // Blocking pumps ignore task aborts; the canceller gets them out of a
        // pending read or write, and a closed queue stops them afterwards.
        if let Some(canceller) = &self.canceller {
            canceller.cancel();
        }
        let mut pumps = self.lock_pumps();
        for pump in pumps.iter_mut() {
            pump.closer.close(CloseReason::Aborted);
            if let Some(task) = pump.task.take() {
                task.abort();
            }
            pump.status.set(PumpState::Closed);
        }
    }

    fn lock_pumps(&self) -> std::sync::MutexGuard<'_, Vec<PumpSlot>> {
        self.pumps
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Drop for ChildProcess {
    fn drop(&mut self) {
        let running = if self.exit_rx.is_some() {
            !self.has_exited()
        } else {
            !self.pump_states().all_closed()
        };
        if running {
            self.terminate();
        }
    }
}

/// A launched child with one queue per standard stream.
#[derive(Debug)]
pub struct SpawnedProcess {
    pub process: ChildProcess,
    /// Chunks sent here are written to the child's stdin.
    pub stdin: InputQueue,
    pub stdout: OutputQueue,
    pub stderr: OutputQueue,
}

/// A PTY child or wrapped duplex handle: one combined input and one combined
/// output queue.
#[derive(Debug)]
pub struct SpawnedDuplex {
    pub process: ChildProcess,
    pub input: InputQueue,
    pub output: OutputQueue,
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;

    use crate::queue::message_queue;

    struct RefusingTerminator;

    impl ChildTerminator for RefusingTerminator {
        fn kill(&mut self) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::PermissionDenied, "not permitted"))
        }
    }

    #[tokio::test]
    async fn failed_kill_still_closes_every_queue() {
        let (input_tx, _input_rx) = message_queue(StreamKind::Stdin, 1);
        let (_output_tx, output_rx) = message_queue(StreamKind::Stdout, 1);
        let (_exit_tx, exit_rx) = watch::channel::<Option<ProcessExit>>(None);
        let status = PumpStatus::new();
        let process = ChildProcess::new(ProcessParts {
            pid: None,
            config: BridgeConfig::default(),
            killer: Some(Box::new(RefusingTerminator)),
            input: input_tx.closer(),
            pumps: vec![PumpHandle {
                stream: StreamKind::Stdout,
                status: status.clone(),
                closer: output_rx.closer(),
                task: tokio::spawn(std::future::pending::<()>()),
            }],
            exit_rx: Some(exit_rx),
            pty: None,
            canceller: None,
        });

        let result = process.shutdown(Duration::from_millis(20)).await;

        assert!(matches!(result, Err(ControlError::Kill(_))));
        assert_eq!(input_tx.close_reason(), Some(CloseReason::Shutdown));
        assert_eq!(output_rx.close_reason(), Some(CloseReason::Aborted));
        assert_eq!(status.get(), PumpState::Closed);
    }
}
