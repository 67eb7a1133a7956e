use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use crate::error::LaunchError;

pub const DEFAULT_QUEUE_CAPACITY: usize = 128;
pub const DEFAULT_READ_BUFFER_SIZE: usize = 8_192;
pub const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 5_000;

/// Settings shared by every queue and pump of one bridged process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BridgeConfig {
    /// Maximum number of chunks buffered in each of the queues.
    pub queue_capacity: usize,
    /// Upper bound on the size of a chunk produced by a reader pump.
    pub read_buffer_size: usize,
    /// What an output pump does when the consumer falls behind.
    pub overflow: OverflowPolicy,
    /// Grace period before [`crate::ChildProcess::shutdown_default`] kills the child.
    pub shutdown_timeout_ms: u64,
    /// Emit a trace event for every chunk moved by a pump.
    pub verbose: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            overflow: OverflowPolicy::default(),
            shutdown_timeout_ms: DEFAULT_SHUTDOWN_TIMEOUT_MS,
            verbose: false,
        }
    }
}

impl BridgeConfig {
    pub fn with_queue_capacity(mut self, queue_capacity: usize) -> Self {
        self.queue_capacity = queue_capacity;
        self
    }

    pub fn with_read_buffer_size(mut self, read_buffer_size: usize) -> Self {
        self.read_buffer_size = read_buffer_size;
        self
    }

    pub fn with_overflow(mut self, overflow: OverflowPolicy) -> Self {
        self.overflow = overflow;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), LaunchError> {
        if self.queue_capacity == 0 {
            return Err(LaunchError::InvalidConfig(
                "queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.read_buffer_size == 0 {
            return Err(LaunchError::InvalidConfig(
                "read_buffer_size must be at least 1".to_string(),
            ));
        }
        if let OverflowPolicy::BlockWithTimeout { timeout_ms: 0 } = self.overflow {
            return Err(LaunchError::InvalidConfig(
                "overflow timeout must be at least 1ms".to_string(),
            ));
        }
        Ok(())
    }
}

/// Behaviour of an output pump whose queue is full.
///
/// A consumer that stops draining while the child blocks writing to a full
/// pipe stalls both sides under `Block`; the other policies bound that.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(tag = "mode", rename_all = "kebab-case")]
pub enum OverflowPolicy {
    /// Suspend the pump until the consumer removes a chunk.
    #[default]
    Block,
    /// Suspend for at most `timeout_ms`, then fail the stream and stop reading.
    BlockWithTimeout { timeout_ms: u64 },
    /// Evict the oldest buffered chunk to make room.
    DropOldest,
}

impl fmt::Display for OverflowPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OverflowPolicy::Block => f.write_str("block"),
            OverflowPolicy::BlockWithTimeout { timeout_ms } => write!(f, "timeout:{timeout_ms}"),
            OverflowPolicy::DropOldest => f.write_str("drop-oldest"),
        }
    }
}

impl FromStr for OverflowPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "block" => Ok(OverflowPolicy::Block),
            "drop-oldest" => Ok(OverflowPolicy::DropOldest),
            other => {
                let Some(ms) = other.strip_prefix("timeout:") else {
                    return Err(format!(
                        "unknown overflow policy `{other}` (expected block, drop-oldest or timeout:<ms>)"
                    ));
                };
                let timeout_ms = ms
                    .trim_end_matches("ms")
                    .parse::<u64>()
                    .map_err(|err| format!("invalid overflow timeout `{ms}`: {err}"))?;
                Ok(OverflowPolicy::BlockWithTimeout { timeout_ms })
            }
        }
    }
}
