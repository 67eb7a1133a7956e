//! Bridging of a single duplex endpoint, such as a pseudo-terminal master or an
//! externally managed descriptor, into one input and one output queue.

#[cfg(unix)]
use std::io;
use std::io::Read;
use std::io::Write;
#[cfg(unix)]
use std::os::fd::AsRawFd;
#[cfg(unix)]
use std::os::fd::OwnedFd;

use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::debug;

use crate::config::BridgeConfig;
use crate::error::LaunchError;
use crate::error::StreamKind;
use crate::process::ChildProcess;
use crate::process::ChildTerminator;
use crate::process::ProcessExit;
use crate::process::ProcessParts;
use crate::process::PtyHandles;
use crate::process::PumpHandle;
use crate::process::SpawnedDuplex;
use crate::process::StreamCanceller;
use crate::pump::PumpStatus;
use crate::pump::ReaderSettings;
use crate::pump::run_blocking_input_pump;
use crate::pump::run_blocking_output_pump;
use crate::queue::message_queue;

/// Process-side pieces attached to a duplex bridge when it fronts a child.
pub(crate) struct DuplexChild {
    pub(crate) pid: Option<u32>,
    pub(crate) killer: Box<dyn ChildTerminator>,
    pub(crate) exit_rx: watch::Receiver<Option<ProcessExit>>,
    pub(crate) pty: Option<PtyHandles>,
}

pub(crate) fn start_duplex<R, W>(
    reader: R,
    writer: W,
    config: &BridgeConfig,
    child: Option<DuplexChild>,
    canceller: Option<Box<dyn StreamCanceller>>,
) -> SpawnedDuplex
where
    R: Read + Send + 'static,
    W: Write + Send + 'static,
{
    let runtime = Handle::current();
    let settings = ReaderSettings::from(config);
    let (input_tx, input_rx) = message_queue(StreamKind::Input, config.queue_capacity);
    let (output_tx, output_rx) = message_queue(StreamKind::Output, config.queue_capacity);

    let input_status = PumpStatus::new();
    let input_pump = PumpHandle {
        stream: StreamKind::Input,
        status: input_status.clone(),
        closer: input_tx.closer(),
        task: tokio::task::spawn_blocking({
            let runtime = runtime.clone();
            let verbose = config.verbose;
            move || run_blocking_input_pump(input_rx, writer, verbose, input_status, runtime)
        }),
    };
    let output_status = PumpStatus::new();
    let output_pump = PumpHandle {
        stream: StreamKind::Output,
        status: output_status.clone(),
        closer: output_rx.closer(),
        task: tokio::task::spawn_blocking(move || {
            run_blocking_output_pump(reader, output_tx, settings, output_status, runtime);
        }),
    };

    let (pid, killer, exit_rx, pty) = match child {
        Some(child) => (child.pid, Some(child.killer), Some(child.exit_rx), child.pty),
        None => (None, None, None, None),
    };
    let process = ChildProcess::new(ProcessParts {
        pid,
        config: config.clone(),
        killer,
        input: input_tx.closer(),
        pumps: vec![input_pump, output_pump],
        exit_rx,
        pty,
        canceller,
    });

    SpawnedDuplex {
        process,
        input: input_tx,
        output: output_rx,
    }
}

/// Bridge an already-open reader/writer pair, e.g. the two halves of a socket
/// or a terminal master, into one input and one output queue.
///
/// Closing the input queue drops `writer`; whether the peer observes
/// end-of-input depends on what `writer` does when dropped. Pumps blocked in
/// `read` or `write` cannot be interrupted here, so a peer that never hangs up
/// keeps its pump thread alive after shutdown.
pub async fn wrap_duplex<R, W>(
    reader: R,
    writer: W,
    config: &BridgeConfig,
) -> Result<SpawnedDuplex, LaunchError>
where
    R: Read + Send + 'static,
    W: Write + Send + 'static,
{
    config.validate()?;
    debug!("wrapping duplex handle");
    Ok(start_duplex(reader, writer, config, None, None))
}

/// Bridge an already-open duplex descriptor, such as a socket or an externally
/// managed pseudo-terminal. The descriptor is duplicated so reads and writes
/// proceed independently.
///
/// For sockets, closing the input queue half-closes the connection so the peer
/// sees end-of-input, and aborting or dropping the process handle shuts the
/// socket down so blocked pumps return. Pipes and terminals support neither:
/// their peer sees end-of-input only once every copy of the descriptor is
/// closed, and a pump blocked reading one stays blocked until the peer writes
/// or hangs up.
#[cfg(unix)]
pub async fn wrap_handle(
    handle: OwnedFd,
    config: &BridgeConfig,
) -> Result<SpawnedDuplex, LaunchError> {
    config.validate()?;
    let canceller = HandleCanceller {
        fd: handle.try_clone().map_err(LaunchError::Handle)?,
    };
    let reader = std::fs::File::from(handle);
    let writer = HandleWriter {
        file: reader.try_clone().map_err(LaunchError::Handle)?,
    };
    debug!("wrapping duplex descriptor");
    Ok(start_duplex(
        reader,
        writer,
        config,
        None,
        Some(Box::new(canceller)),
    ))
}

/// Writer half of a wrapped descriptor. Dropping it half-closes a socket, which
/// the reader's copy of the descriptor would otherwise keep open.
#[cfg(unix)]
struct HandleWriter {
    file: std::fs::File,
}

#[cfg(unix)]
impl Write for HandleWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

#[cfg(unix)]
impl Drop for HandleWriter {
    fn drop(&mut self) {
        shutdown_socket(&self.file, libc::SHUT_WR);
    }
}

#[cfg(unix)]
struct HandleCanceller {
    fd: OwnedFd,
}

#[cfg(unix)]
impl StreamCanceller for HandleCanceller {
    fn cancel(&self) {
        shutdown_socket(&self.fd, libc::SHUT_RDWR);
    }
}

#[cfg(unix)]
fn shutdown_socket(fd: &impl AsRawFd, how: libc::c_int) {
    if unsafe { libc::shutdown(fd.as_raw_fd(), how) } == -1 {
        let err = io::Error::last_os_error();
        if !matches!(err.raw_os_error(), Some(libc::ENOTSOCK | libc::ENOTCONN)) {
            debug!("failed to shut down wrapped descriptor: {err}");
        }
    }
}
