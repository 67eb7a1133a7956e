use std::io;

use portable_pty::CommandBuilder;
use portable_pty::PtySize;
use portable_pty::native_pty_system;
use tokio::sync::watch;
use tracing::debug;

use crate::command::CommandSpec;
use crate::config::BridgeConfig;
use crate::duplex::DuplexChild;
use crate::duplex::start_duplex;
use crate::error::LaunchError;
use crate::process::ChildTerminator;
use crate::process::ProcessExit;
use crate::process::PtyHandles;
use crate::process::SpawnedDuplex;

/// Initial size of the pseudo-terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PtyDimensions {
    pub rows: u16,
    pub cols: u16,
}

impl Default for PtyDimensions {
    fn default() -> Self {
        Self { rows: 24, cols: 80 }
    }
}

impl From<PtyDimensions> for PtySize {
    fn from(size: PtyDimensions) -> Self {
        PtySize {
            rows: size.rows,
            cols: size.cols,
            pixel_width: 0,
            pixel_height: 0,
        }
    }
}

struct PtyChildTerminator {
    killer: Box<dyn portable_pty::ChildKiller + Send + Sync>,
    #[cfg(unix)]
    process_group_id: Option<u32>,
}

impl ChildTerminator for PtyChildTerminator {
    fn kill(&mut self) -> io::Result<()> {
        // The child leads its own session on Unix, so a group kill also takes
        // down its background jobs.
        #[cfg(unix)]
        if let Some(process_group_id) = self.process_group_id {
            return crate::process_group::kill_process_group(process_group_id);
        }
        self.killer.kill()
    }
}

fn pty_error(err: impl std::fmt::Display) -> LaunchError {
    LaunchError::Pty(err.to_string())
}

/// Spawn the process described by `spec` attached to a pseudo-terminal.
///
/// The terminal merges the child's stdout and stderr, so this returns a single
/// output queue. Closing the input queue sends end-of-file to the terminal.
pub async fn launch_pty(
    spec: &CommandSpec,
    size: PtyDimensions,
    config: &BridgeConfig,
) -> Result<SpawnedDuplex, LaunchError> {
    config.validate()?;
    spec.ensure_program()?;

    let pty_system = native_pty_system();
    let pair = pty_system.openpty(size.into()).map_err(pty_error)?;
    let reader = pair.master.try_clone_reader().map_err(pty_error)?;
    let writer = pair.master.take_writer().map_err(pty_error)?;

    let mut builder = CommandBuilder::new(&spec.program);
    builder.args(&spec.args);
    if let Some(cwd) = &spec.cwd {
        builder.cwd(cwd);
    }
    if spec.clear_env {
        builder.env_clear();
    }
    for (key, value) in &spec.env {
        builder.env(key, value);
    }

    let mut child = pair
        .slave
        .spawn_command(builder)
        .map_err(|err| LaunchError::Spawn {
            program: spec.program_display(),
            source: match err.downcast::<io::Error>() {
                Ok(source) => source,
                Err(err) => io::Error::other(format!("{err:#}")),
            },
        })?;
    let pid = child.process_id();
    let killer = child.clone_killer();
    debug!(?pid, program = %spec.program_display(), "launched pty child");

    let (exit_tx, exit_rx) = watch::channel::<Option<ProcessExit>>(None);
    // Detached like the pipe waiter; portable-pty only offers a blocking wait.
    tokio::task::spawn_blocking(move || {
        let exit = match child.wait() {
            Ok(status) => ProcessExit {
                code: Some(i32::try_from(status.exit_code()).unwrap_or(-1)),
                signal: None,
            },
            Err(err) => {
                debug!(?pid, "failed to wait for pty child: {err}");
                ProcessExit {
                    code: None,
                    signal: None,
                }
            }
        };
        debug!(?pid, ?exit, "pty child exited");
        let _ = exit_tx.send(Some(exit));
    });

    let handles = PtyHandles {
        master: pair.master,
        _slave: if cfg!(windows) {
            Some(pair.slave)
        } else {
            None
        },
    };
    let child = DuplexChild {
        pid,
        killer: Box::new(PtyChildTerminator {
            killer,
            #[cfg(unix)]
            process_group_id: pid,
        }),
        exit_rx,
        pty: Some(handles),
    };
    Ok(start_duplex(reader, writer, config, Some(child), None))
}
