//! Run-to-completion helpers built on the pipe launchers.

use tracing::debug;

use crate::config::BridgeConfig;
use crate::error::StreamError;
use crate::pipe::launch;
use crate::process::ProcessExit;
use crate::process::SpawnedProcess;
use crate::queue::OutputQueue;

/// Everything a finished child wrote, plus how it ended.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit: Option<ProcessExit>,
    /// Set when the stdout pump stopped on a failure rather than end-of-file.
    pub stdout_error: Option<StreamError>,
    pub stderr_error: Option<StreamError>,
}

impl CapturedOutput {
    /// Stdout followed by stderr, decoded lossily.
    pub fn combined_text(&self) -> String {
        let mut combined = String::from_utf8_lossy(&self.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&self.stderr));
        combined
    }

    pub fn success(&self) -> bool {
        self.exit.is_some_and(|exit| exit.success())
    }
}

async fn drain(mut rx: OutputQueue) -> (Vec<u8>, Option<StreamError>) {
    let mut collected = Vec::new();
    while let Some(chunk) = rx.recv().await {
        collected.extend_from_slice(&chunk);
    }
    (collected, rx.last_error())
}

/// Feed `input` (if any) to the child's stdin, close it, and collect stdout and
/// stderr until both reach end-of-stream and the child has exited.
///
/// Both output queues are drained while input is still being written, so a
/// child that echoes large inputs cannot stall on a full queue.
pub async fn capture(spawned: SpawnedProcess, input: Option<Vec<u8>>) -> CapturedOutput {
    let SpawnedProcess {
        process,
        stdin,
        stdout,
        stderr,
    } = spawned;

    let feed = async move {
        if let Some(input) = input
            && let Err(err) = stdin.send(input).await
        {
            debug!("child stopped accepting input: {err}");
        }
        stdin.close();
    };
    let ((), (stdout, stdout_error), (stderr, stderr_error)) =
        tokio::join!(feed, drain(stdout), drain(stderr));
    let exit = process.wait().await;

    CapturedOutput {
        stdout,
        stderr,
        exit,
        stdout_error,
        stderr_error,
    }
}

/// Launch `program` with no input and capture everything it prints.
pub async fn run_command(
    program: &str,
    args: &[String],
    config: &BridgeConfig,
) -> Result<CapturedOutput, crate::error::LaunchError> {
    let spawned = launch(program, args, config).await?;
    Ok(capture(spawned, None).await)
}

/// Program and arguments that run `script` through the platform shell.
pub fn shell_invocation(script: &str) -> (String, Vec<String>) {
    if cfg!(windows) {
        let shell = std::env::var("COMSPEC").unwrap_or_else(|_| "cmd.exe".to_string());
        (shell, vec!["/C".to_string(), script.to_string()])
    } else {
        (
            "/bin/sh".to_string(),
            vec!["-c".to_string(), script.to_string()],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;

    #[test]
    fn combined_text_puts_stdout_first() {
        let output = CapturedOutput {
            stdout: b"out\n".to_vec(),
            stderr: b"err\n".to_vec(),
            ..CapturedOutput::default()
        };
        assert_eq!(output.combined_text(), "out\nerr\n");
        assert!(!output.success());
    }

    #[cfg(unix)]
    #[test]
    fn shell_invocation_uses_sh() {
        let (program, args) = shell_invocation("echo hi");
        assert_eq!(program, "/bin/sh");
        assert_eq!(args, vec!["-c".to_string(), "echo hi".to_string()]);
    }
}
