//! Pumps relay bytes between one stream endpoint and one queue.
//!
//! Pipe endpoints from `tokio::process` are driven by async pumps. PTY masters
//! and wrapped descriptors only offer blocking `Read`/`Write`, so their pumps
//! run on blocking threads and re-enter the runtime for queue waits.

use std::io;
use std::io::ErrorKind;
use std::io::Read;
use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;
use tokio::runtime::Handle;
use tracing::debug;
use tracing::trace;
use tracing::warn;

use crate::config::BridgeConfig;
use crate::config::OverflowPolicy;
use crate::error::SendError;
use crate::error::StreamError;
use crate::error::StreamKind;
use crate::queue::Chunk;
use crate::queue::CloseReason;
use crate::queue::QueueReceiver;
use crate::queue::QueueSender;

/// Lifecycle of a single pump. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpState {
    Running,
    Terminating,
    Closed,
}

impl PumpState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => PumpState::Running,
            1 => PumpState::Terminating,
            _ => PumpState::Closed,
        }
    }
}

/// Shared view of a pump's state, written by the pump and read by the process
/// handle.
#[derive(Debug, Clone)]
pub(crate) struct PumpStatus(Arc<AtomicU8>);

impl PumpStatus {
    pub(crate) fn new() -> Self {
        Self(Arc::new(AtomicU8::new(PumpState::Running as u8)))
    }

    pub(crate) fn get(&self) -> PumpState {
        PumpState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn set(&self, state: PumpState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

/// Snapshot of every pump bound to one process. `error` is `None` for PTYs and
/// wrapped handles, which only have a combined output stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PumpStates {
    pub input: PumpState,
    pub output: PumpState,
    pub error: Option<PumpState>,
}

impl PumpStates {
    pub fn all_closed(&self) -> bool {
        self.input == PumpState::Closed
            && self.output == PumpState::Closed
            && self.error.is_none_or(|state| state == PumpState::Closed)
    }
}

/// Settings a reader pump takes from [`BridgeConfig`].
#[derive(Debug, Clone, Copy)]
pub(crate) struct ReaderSettings {
    pub(crate) buffer_size: usize,
    pub(crate) overflow: OverflowPolicy,
    pub(crate) verbose: bool,
}

impl From<&BridgeConfig> for ReaderSettings {
    fn from(config: &BridgeConfig) -> Self {
        Self {
            buffer_size: config.read_buffer_size.max(1),
            overflow: config.overflow,
            verbose: config.verbose,
        }
    }
}

/// Hand one chunk to the consumer according to the overflow policy. An `Err`
/// carries the reason the pump has to stop.
async fn deliver(tx: &QueueSender, chunk: Chunk, overflow: OverflowPolicy) -> Result<(), CloseReason> {
    let result = match overflow {
        OverflowPolicy::Block => tx.send(chunk).await,
        OverflowPolicy::BlockWithTimeout { timeout_ms } => {
            tx.send_timeout(chunk, Duration::from_millis(timeout_ms)).await
        }
        OverflowPolicy::DropOldest => tx.send_drop_oldest(chunk).map(|evicted| {
            if let Some(evicted) = evicted {
                trace!(stream = %tx.stream(), bytes = evicted.len(), "dropped oldest chunk");
            }
        }),
    };
    match result {
        Ok(()) => Ok(()),
        Err(SendError::Timeout(_)) => {
            let timeout = match overflow {
                OverflowPolicy::BlockWithTimeout { timeout_ms } => Duration::from_millis(timeout_ms),
                _ => Duration::ZERO,
            };
            Err(CloseReason::Failed(StreamError::EnqueueTimeout {
                stream: tx.stream(),
                timeout,
            }))
        }
        Err(SendError::Closed(_) | SendError::Full(_)) => {
            Err(tx.close_reason().unwrap_or(CloseReason::ReceiverDropped))
        }
    }
}

fn finish_reader(tx: &QueueSender, reason: CloseReason, status: &PumpStatus) {
    status.set(PumpState::Terminating);
    let stream = tx.stream();
    match &reason {
        CloseReason::Failed(err) => warn!(%stream, "reader pump stopped: {err}"),
        other => debug!(%stream, reason = ?other, "reader pump stopped"),
    }
    tx.close_with(reason);
    status.set(PumpState::Closed);
}

fn finish_writer(rx: &QueueReceiver, failure: Option<StreamError>, status: &PumpStatus) {
    let stream = rx.stream();
    match failure {
        Some(err) => {
            warn!(%stream, "writer pump stopped: {err}");
            rx.close_with(CloseReason::Failed(err));
        }
        None => debug!(%stream, reason = ?rx.close_reason(), "writer pump closed its sink"),
    }
    status.set(PumpState::Closed);
}

/// Read `source` until end-of-stream, forwarding each chunk to `tx`.
pub(crate) async fn run_output_pump<R>(
    mut source: R,
    tx: QueueSender,
    settings: ReaderSettings,
    status: PumpStatus,
) where
    R: AsyncRead + Unpin,
{
    let stream = tx.stream();
    let mut buf = vec![0u8; settings.buffer_size];
    let reason = loop {
        match source.read(&mut buf).await {
            Ok(0) => break CloseReason::EndOfStream,
            Ok(n) => {
                if settings.verbose {
                    trace!(%stream, bytes = n, "read chunk");
                }
                if let Err(reason) = deliver(&tx, buf[..n].to_vec(), settings.overflow).await {
                    break reason;
                }
            }
            Err(ref err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => break CloseReason::Failed(StreamError::read(stream, &err)),
        }
    };
    finish_reader(&tx, reason, &status);
}

/// Write every chunk from `rx` to `sink`, then close the sink.
pub(crate) async fn run_input_pump<W>(
    mut rx: QueueReceiver,
    mut sink: W,
    verbose: bool,
    status: PumpStatus,
) where
    W: AsyncWrite + Unpin,
{
    let stream = rx.stream();
    while let Some(chunk) = rx.recv().await {
        if chunk.is_empty() {
            continue;
        }
        let written = async {
            sink.write_all(&chunk).await?;
            sink.flush().await
        }
        .await;
        if let Err(err) = written {
            status.set(PumpState::Terminating);
            finish_writer(&rx, Some(StreamError::write(stream, &err)), &status);
            return;
        }
        if verbose {
            trace!(%stream, bytes = chunk.len(), "wrote chunk");
        }
    }
    status.set(PumpState::Terminating);
    if let Err(err) = sink.shutdown().await {
        debug!(%stream, "error while closing sink: {err}");
    }
    drop(sink);
    finish_writer(&rx, None, &status);
}

/// A terminal master reports `EIO` once the other side has hung up; Windows
/// pseudo consoles report a broken pipe instead.
fn is_hangup(err: &io::Error) -> bool {
    #[cfg(unix)]
    if err.raw_os_error() == Some(libc::EIO) {
        return true;
    }
    err.kind() == ErrorKind::BrokenPipe
}

/// Blocking counterpart of [`run_output_pump`]; must run on a blocking thread.
pub(crate) fn run_blocking_output_pump<R>(
    mut source: R,
    tx: QueueSender,
    settings: ReaderSettings,
    status: PumpStatus,
    runtime: Handle,
) where
    R: Read,
{
    let stream = tx.stream();
    let mut buf = vec![0u8; settings.buffer_size];
    let reason = loop {
        match source.read(&mut buf) {
            Ok(0) => break CloseReason::EndOfStream,
            Ok(n) => {
                if settings.verbose {
                    trace!(%stream, bytes = n, "read chunk");
                }
                let delivered = runtime.block_on(deliver(&tx, buf[..n].to_vec(), settings.overflow));
                if let Err(reason) = delivered {
                    break reason;
                }
            }
            Err(ref err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(ref err) if is_hangup(err) => break CloseReason::EndOfStream,
            Err(err) => break CloseReason::Failed(StreamError::read(stream, &err)),
        }
    };
    finish_reader(&tx, reason, &status);
}

/// Blocking counterpart of [`run_input_pump`]; must run on a blocking thread.
pub(crate) fn run_blocking_input_pump<W>(
    mut rx: QueueReceiver,
    mut sink: W,
    verbose: bool,
    status: PumpStatus,
    runtime: Handle,
) where
    W: Write,
{
    let stream = rx.stream();
    while let Some(chunk) = runtime.block_on(rx.recv()) {
        if chunk.is_empty() {
            continue;
        }
        if let Err(err) = sink.write_all(&chunk).and_then(|()| sink.flush()) {
            status.set(PumpState::Terminating);
            finish_writer(&rx, Some(StreamError::write(stream, &err)), &status);
            return;
        }
        if verbose {
            trace!(%stream, bytes = chunk.len(), "wrote chunk");
        }
    }
    status.set(PumpState::Terminating);
    drop(sink);
    finish_writer(&rx, None, &status);
}

/// Label used in log events for a pump bound to `stream`.
pub(crate) fn pump_name(stream: StreamKind) -> &'static str {
    match stream {
        StreamKind::Stdin | StreamKind::Input => "input pump",
        StreamKind::Stdout | StreamKind::Output => "output pump",
        StreamKind::Stderr => "error pump",
    }
}
