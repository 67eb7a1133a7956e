//! Connects the standard streams of a child process, or an already-open duplex
//! handle, to bounded in-memory queues serviced by background pumps.

pub mod capture;
mod command;
pub mod config;
mod duplex;
pub mod error;
mod pipe;
mod process;
mod process_group;
mod pty;
mod pump;
pub mod queue;

/// Run a command to completion and collect everything it printed.
pub use capture::CapturedOutput;
pub use capture::capture;
pub use capture::run_command;
pub use capture::shell_invocation;
/// Program, arguments and environment of a child to launch.
pub use command::CommandSpec;
pub use config::BridgeConfig;
pub use config::OverflowPolicy;
/// Bridge an already-open reader/writer pair into an input and an output queue.
pub use duplex::wrap_duplex;
/// Bridge an already-open duplex descriptor into an input and an output queue.
#[cfg(unix)]
pub use duplex::wrap_handle;
pub use error::ControlError;
pub use error::LaunchError;
pub use error::SendError;
pub use error::StreamError;
pub use error::StreamKind;
pub use error::TryRecvError;
/// Spawn a process with stdin, stdout and stderr each bridged to a queue.
pub use pipe::launch;
pub use pipe::launch_argv;
pub use pipe::launch_command;
/// Handle owning a launched child and its pumps.
pub use process::ChildProcess;
pub use process::ProcessExit;
pub use process::ShutdownOutcome;
/// Child plus its three stream queues, returned by the pipe launchers.
pub use process::SpawnedProcess;
/// Child or wrapped handle plus its combined input and output queues.
pub use process::SpawnedDuplex;
pub use pty::PtyDimensions;
/// Spawn a process attached to a pseudo-terminal.
pub use pty::launch_pty;
pub use pump::PumpState;
pub use pump::PumpStates;
pub use queue::Chunk;
pub use queue::CloseReason;
pub use queue::InputQueue;
pub use queue::OutputQueue;
pub use queue::QueueReceiver;
pub use queue::QueueSender;
pub use queue::message_queue;
