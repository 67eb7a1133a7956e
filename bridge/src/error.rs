use std::fmt;
use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::queue::Chunk;

/// Names the stream endpoint a queue or pump is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Stdin,
    Stdout,
    Stderr,
    /// Combined input side of a PTY or wrapped duplex handle.
    Input,
    /// Combined output side of a PTY or wrapped duplex handle.
    Output,
}

impl StreamKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StreamKind::Stdin => "stdin",
            StreamKind::Stdout => "stdout",
            StreamKind::Stderr => "stderr",
            StreamKind::Input => "input",
            StreamKind::Output => "output",
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure to start a child process or wrap a handle. No pump is running when
/// one of these is returned.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("missing program to launch")]
    EmptyProgram,
    #[error("invalid bridge configuration: {0}")]
    InvalidConfig(String),
    #[error("failed to spawn `{program}`")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("spawned process has no {0} pipe")]
    MissingStdio(StreamKind),
    #[error("failed to wrap handle")]
    Handle(#[source] io::Error),
    #[error("failed to set up pseudo-terminal: {0}")]
    Pty(String),
}

/// A read, write or enqueue failure local to one pump. It closes that pump's
/// queue and nothing else.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    #[error("failed to read from {stream}: {message}")]
    Read {
        stream: StreamKind,
        kind: io::ErrorKind,
        message: String,
    },
    #[error("failed to write to {stream}: {message}")]
    Write {
        stream: StreamKind,
        kind: io::ErrorKind,
        message: String,
    },
    #[error("{stream} consumer did not make room within {timeout:?}")]
    EnqueueTimeout { stream: StreamKind, timeout: Duration },
}

impl StreamError {
    pub(crate) fn read(stream: StreamKind, err: &io::Error) -> Self {
        Self::Read {
            stream,
            kind: err.kind(),
            message: err.to_string(),
        }
    }

    pub(crate) fn write(stream: StreamKind, err: &io::Error) -> Self {
        Self::Write {
            stream,
            kind: err.kind(),
            message: err.to_string(),
        }
    }

    pub fn stream(&self) -> StreamKind {
        match self {
            StreamError::Read { stream, .. }
            | StreamError::Write { stream, .. }
            | StreamError::EnqueueTimeout { stream, .. } => *stream,
        }
    }
}

/// Failure of a control operation on a running [`crate::ChildProcess`].
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("failed to kill child process")]
    Kill(#[source] io::Error),
    #[error("process is not attached to a pseudo-terminal")]
    NotPty,
    #[error("failed to resize pseudo-terminal: {0}")]
    Resize(String),
}

/// Rejected queue insertion. The chunk is handed back to the caller.
#[derive(Debug, PartialEq, Eq, Error)]
pub enum SendError {
    #[error("queue is full")]
    Full(Chunk),
    #[error("queue is closed")]
    Closed(Chunk),
    #[error("timed out waiting for queue capacity")]
    Timeout(Chunk),
}

impl SendError {
    pub fn into_inner(self) -> Chunk {
        match self {
            SendError::Full(chunk) | SendError::Closed(chunk) | SendError::Timeout(chunk) => chunk,
        }
    }
}

/// Returned by [`crate::QueueReceiver::try_recv`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TryRecvError {
    /// Nothing buffered right now, but more data may still arrive.
    #[error("queue is empty")]
    Empty,
    /// The queue was closed and every buffered chunk has been drained.
    #[error("queue is closed")]
    Closed,
}
