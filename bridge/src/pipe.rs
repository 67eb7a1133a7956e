use std::io;
use std::process::Stdio;

use tokio::process::Child;
use tokio::process::Command;
use tokio::sync::watch;
use tracing::debug;

use crate::command::CommandSpec;
use crate::config::BridgeConfig;
use crate::error::LaunchError;
use crate::error::StreamKind;
use crate::process::ChildProcess;
use crate::process::ChildTerminator;
use crate::process::ProcessExit;
use crate::process::ProcessParts;
use crate::process::PumpHandle;
use crate::process::SpawnedProcess;
use crate::pump::PumpStatus;
use crate::pump::ReaderSettings;
use crate::pump::run_input_pump;
use crate::pump::run_output_pump;
use crate::queue::message_queue;

struct PipeChildTerminator {
    #[cfg(unix)]
    process_group_id: Option<u32>,
    #[cfg(not(unix))]
    kill_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl ChildTerminator for PipeChildTerminator {
    fn kill(&mut self) -> io::Result<()> {
        #[cfg(unix)]
        {
            match self.process_group_id {
                Some(process_group_id) => crate::process_group::kill_process_group(process_group_id),
                None => Ok(()),
            }
        }

        #[cfg(not(unix))]
        {
            if let Some(kill_tx) = self.kill_tx.take() {
                let _ = kill_tx.send(());
            }
            Ok(())
        }
    }
}

fn take_pipe<T>(pipe: Option<T>, stream: StreamKind, child: &mut Child) -> Result<T, LaunchError> {
    match pipe {
        Some(pipe) => Ok(pipe),
        None => {
            let _ = child.start_kill();
            Err(LaunchError::MissingStdio(stream))
        }
    }
}

/// Spawn `program` with `args`, wiring stdin, stdout and stderr to queues of
/// `config.queue_capacity` chunks each.
pub async fn launch(
    program: &str,
    args: &[String],
    config: &BridgeConfig,
) -> Result<SpawnedProcess, LaunchError> {
    launch_command(&CommandSpec::new(program).args(args), config).await
}

/// Like [`launch`], taking the program from `argv[0]`.
pub async fn launch_argv(argv: &[String], config: &BridgeConfig) -> Result<SpawnedProcess, LaunchError> {
    launch_command(&CommandSpec::from_argv(argv)?, config).await
}

/// Spawn the process described by `spec` using regular pipes (no PTY).
///
/// Three pumps start once the process is running. Nothing is started when an
/// error is returned.
pub async fn launch_command(
    spec: &CommandSpec,
    config: &BridgeConfig,
) -> Result<SpawnedProcess, LaunchError> {
    config.validate()?;
    spec.ensure_program()?;

    let mut command = Command::new(&spec.program);
    command.args(&spec.args);
    if let Some(cwd) = &spec.cwd {
        command.current_dir(cwd);
    }
    if spec.clear_env {
        command.env_clear();
    }
    command.envs(&spec.env);
    #[cfg(target_os = "linux")]
    let parent_pid = unsafe { libc::getpid() };
    #[cfg(unix)]
    unsafe {
        command.pre_exec(move || {
            crate::process_group::set_process_group()?;
            #[cfg(target_os = "linux")]
            crate::process_group::set_parent_death_signal(parent_pid)?;
            Ok(())
        });
    }
    command.stdin(Stdio::piped());
    command.stdout(Stdio::piped());
    command.stderr(Stdio::piped());

    let mut child = command.spawn().map_err(|source| LaunchError::Spawn {
        program: spec.program_display(),
        source,
    })?;
    let pid = child.id();

    let stdin = take_pipe(child.stdin.take(), StreamKind::Stdin, &mut child)?;
    let stdout = take_pipe(child.stdout.take(), StreamKind::Stdout, &mut child)?;
    let stderr = take_pipe(child.stderr.take(), StreamKind::Stderr, &mut child)?;
    debug!(?pid, program = %spec.program_display(), "launched piped child");

    let capacity = config.queue_capacity;
    let settings = ReaderSettings::from(config);
    let (stdin_tx, stdin_rx) = message_queue(StreamKind::Stdin, capacity);
    let (stdout_tx, stdout_rx) = message_queue(StreamKind::Stdout, capacity);
    let (stderr_tx, stderr_rx) = message_queue(StreamKind::Stderr, capacity);

    let input_status = PumpStatus::new();
    let input_pump = PumpHandle {
        stream: StreamKind::Stdin,
        status: input_status.clone(),
        closer: stdin_tx.closer(),
        task: tokio::spawn(run_input_pump(stdin_rx, stdin, config.verbose, input_status)),
    };
    let output_status = PumpStatus::new();
    let output_pump = PumpHandle {
        stream: StreamKind::Stdout,
        status: output_status.clone(),
        closer: stdout_rx.closer(),
        task: tokio::spawn(run_output_pump(stdout, stdout_tx, settings, output_status)),
    };
    let error_status = PumpStatus::new();
    let error_pump = PumpHandle {
        stream: StreamKind::Stderr,
        status: error_status.clone(),
        closer: stderr_rx.closer(),
        task: tokio::spawn(run_output_pump(stderr, stderr_tx, settings, error_status)),
    };

    #[cfg(not(unix))]
    let (kill_tx, kill_rx) = tokio::sync::oneshot::channel::<()>();
    let (exit_tx, exit_rx) = watch::channel::<Option<ProcessExit>>(None);
    // Detached: the watch channel is the only output and the task ends with
    // the child.
    tokio::spawn(async move {
        #[cfg(not(unix))]
        let status = tokio::select! {
            status = child.wait() => status,
            _ = kill_rx => {
                let _ = child.start_kill();
                child.wait().await
            }
        };
        #[cfg(unix)]
        let status = child.wait().await;
        let exit = match status {
            Ok(status) => ProcessExit::from_std(status),
            Err(err) => {
                debug!(?pid, "failed to wait for child: {err}");
                ProcessExit {
                    code: None,
                    signal: None,
                }
            }
        };
        debug!(?pid, ?exit, "child exited");
        let _ = exit_tx.send(Some(exit));
    });

    let killer = PipeChildTerminator {
        #[cfg(unix)]
        process_group_id: pid,
        #[cfg(not(unix))]
        kill_tx: Some(kill_tx),
    };
    let process = ChildProcess::new(ProcessParts {
        pid,
        config: config.clone(),
        killer: Some(Box::new(killer)),
        input: stdin_tx.closer(),
        pumps: vec![input_pump, output_pump, error_pump],
        exit_rx: Some(exit_rx),
        pty: None,
        canceller: None,
    });

    Ok(SpawnedProcess {
        process,
        stdin: stdin_tx,
        stdout: stdout_rx,
        stderr: stderr_rx,
    })
}
