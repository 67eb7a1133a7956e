use std::path::Path;

use anyhow::Context;
use procpipe_bridge::BridgeConfig;

use crate::Cli;

/// Read bridge settings from `path`. Keys missing from the file keep their
/// defaults.
pub fn load_config_file(path: &Path) -> anyhow::Result<BridgeConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    toml::from_str(&contents)
        .with_context(|| format!("failed to parse config file {}", path.display()))
}

/// Build the effective configuration: the optional config file first, then
/// any values given on the command line.
pub fn resolve_config(cli: &Cli) -> anyhow::Result<BridgeConfig> {
    let mut config = match &cli.config {
        Some(path) => load_config_file(path)?,
        None => BridgeConfig::default(),
    };
    if let Some(queue_capacity) = cli.queue_capacity {
        config.queue_capacity = queue_capacity;
    }
    if let Some(buffer_size) = cli.buffer_size {
        config.read_buffer_size = buffer_size;
    }
    if let Some(overflow) = cli.overflow {
        config.overflow = overflow;
    }
    if let Some(shutdown_timeout_ms) = cli.shutdown_timeout_ms {
        config.shutdown_timeout_ms = shutdown_timeout_ms;
    }
    if cli.verbose {
        config.verbose = true;
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    use clap::Parser;
    use pretty_assertions::assert_eq;
    use procpipe_bridge::OverflowPolicy;
    use std::io::Write;

    #[test]
    fn flags_override_the_config_file() -> anyhow::Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        writeln!(
            file,
            "queue_capacity = 16\nread_buffer_size = 512\n\n[overflow]\nmode = \"drop-oldest\"\n"
        )?;
        let path = file.path().to_string_lossy().into_owned();

        let cli = Cli::try_parse_from([
            "procpipe",
            "--config",
            path.as_str(),
            "--queue-capacity",
            "4",
            "--",
            "cat",
        ])?;
        let config = resolve_config(&cli)?;
        assert_eq!(
            config,
            BridgeConfig::default()
                .with_queue_capacity(4)
                .with_read_buffer_size(512)
                .with_overflow(OverflowPolicy::DropOldest)
        );
        Ok(())
    }

    #[test]
    fn overflow_flag_accepts_timeouts() -> anyhow::Result<()> {
        let cli = Cli::try_parse_from([
            "procpipe",
            "--overflow",
            "timeout:250",
            "--verbose",
            "--",
            "cat",
        ])?;
        let config = resolve_config(&cli)?;
        assert_eq!(config.overflow, OverflowPolicy::BlockWithTimeout { timeout_ms: 250 });
        assert!(config.verbose);
        assert_eq!(cli.command, vec!["cat".to_string()]);
        Ok(())
    }

    #[test]
    fn unreadable_config_file_names_the_path() {
        let err = load_config_file(Path::new("/nonexistent/procpipe.toml"))
            .err()
            .map(|err| format!("{err:#}"))
            .unwrap_or_default();
        assert!(err.contains("/nonexistent/procpipe.toml"), "{err}");
    }
}
