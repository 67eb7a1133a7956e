//! `procpipe`: run a program with its standard streams relayed through bounded
//! queues.

mod config;

use std::future::Future;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use procpipe_bridge::ChildProcess;
use procpipe_bridge::CommandSpec;
use procpipe_bridge::InputQueue;
use procpipe_bridge::OutputQueue;
use procpipe_bridge::OverflowPolicy;
use procpipe_bridge::PtyDimensions;
use procpipe_bridge::SpawnedDuplex;
use procpipe_bridge::SpawnedProcess;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use tracing::warn;
use tracing_subscriber::EnvFilter;

pub use config::load_config_file;
pub use config::resolve_config;

/// Exit status used when the child's own status is unknown.
const UNKNOWN_EXIT_CODE: i32 = 1;

#[derive(Debug, Parser)]
#[clap(version)]
pub struct Cli {
    /// TOML file with bridge settings. Flags below override its values.
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Maximum number of chunks buffered per stream.
    #[arg(long, value_name = "N")]
    pub queue_capacity: Option<usize>,

    /// Size of each read from the child's output.
    #[arg(long, value_name = "N")]
    pub buffer_size: Option<usize>,

    /// What to do when an output queue is full: block, drop-oldest or
    /// timeout:<ms>.
    #[arg(long, value_name = "POLICY")]
    pub overflow: Option<OverflowPolicy>,

    /// How long the child gets to exit after Ctrl-C before it is killed.
    #[arg(long, value_name = "MS")]
    pub shutdown_timeout_ms: Option<u64>,

    /// Attach the child to a pseudo-terminal. Its stdout and stderr are merged.
    #[arg(long)]
    pub pty: bool,

    /// Log pump activity to stderr.
    #[arg(long, short)]
    pub verbose: bool,

    /// Program to run, followed by its arguments.
    #[arg(required = true, trailing_var_arg = true, value_name = "PROGRAM")]
    pub command: Vec<String>,
}

/// Install the stderr log subscriber. `RUST_LOG` takes precedence over
/// `verbose`.
pub fn init_tracing(verbose: bool) {
    let default_directive = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();
}

/// Run the command described by `cli` and return the exit code `procpipe`
/// should exit with.
pub async fn run_main(cli: Cli) -> anyhow::Result<i32> {
    let config = resolve_config(&cli)?;
    let spec = CommandSpec::from_argv(&cli.command)?;

    if cli.pty {
        let SpawnedDuplex {
            process,
            input,
            output,
        } = procpipe_bridge::launch_pty(&spec, PtyDimensions::default(), &config).await?;
        let relay = relay_output(output, tokio::io::stdout());
        supervise(process, input, config.read_buffer_size, relay).await
    } else {
        let SpawnedProcess {
            process,
            stdin,
            stdout,
            stderr,
        } = procpipe_bridge::launch_command(&spec, &config).await?;
        let relay = async {
            tokio::try_join!(
                relay_output(stdout, tokio::io::stdout()),
                relay_output(stderr, tokio::io::stderr()),
            )
            .map(|_| ())
        };
        supervise(process, stdin, config.read_buffer_size, relay).await
    }
}

/// Forward our stdin to the child while `relay` copies its output, and turn
/// Ctrl-C into an orderly shutdown.
async fn supervise<F>(
    process: ChildProcess,
    input: InputQueue,
    buffer_size: usize,
    relay: F,
) -> anyhow::Result<i32>
where
    F: Future<Output = anyhow::Result<()>>,
{
    // Detached: reading our stdin may block past the child's exit.
    tokio::spawn(forward_input(tokio::io::stdin(), input, buffer_size));

    tokio::pin!(relay);
    tokio::select! {
        result = &mut relay => result?,
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for Ctrl-C")?;
            debug!(pid = ?process.pid(), "interrupted; shutting down child");
            // Keep draining so the child is never stuck on a full queue while
            // it winds down.
            let (outcome, relayed) = tokio::join!(process.shutdown_default(), &mut relay);
            let outcome = outcome?;
            if let Err(err) = relayed {
                warn!("failed to relay output during shutdown: {err:#}");
            }
            return Ok(outcome.exit.map_or(UNKNOWN_EXIT_CODE, |exit| exit.shell_code()));
        }
    }

    let exit = process.wait().await;
    debug!(?exit, "child finished");
    Ok(exit.map_or(UNKNOWN_EXIT_CODE, |exit| exit.shell_code()))
}

async fn forward_input<R>(mut source: R, input: InputQueue, buffer_size: usize)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; buffer_size.max(1)];
    loop {
        match source.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if let Err(err) = input.send(buf[..n].to_vec()).await {
                    debug!("child input closed: {err}");
                    return;
                }
            }
            Err(err) => {
                warn!("failed to read stdin: {err}");
                break;
            }
        }
    }
    input.close();
}

async fn relay_output<W>(mut output: OutputQueue, mut sink: W) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let stream = output.stream();
    while let Some(chunk) = output.recv().await {
        sink.write_all(&chunk)
            .await
            .with_context(|| format!("failed to relay child {stream}"))?;
        sink.flush().await?;
    }
    if let Some(err) = output.last_error() {
        warn!("child {stream} ended early: {err}");
    }
    Ok(())
}
