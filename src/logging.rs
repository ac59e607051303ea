//! Tracing subscriber setup.
//!
//! `RUST_LOG` wins when set; otherwise the level comes from `--verbose`.
//! Output goes to stderr (text or JSON) and, when a log directory is
//! configured, to a daily-rolling file as JSON.

use std::path::Path;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

use crate::config::LogFormat;

fn default_directive(verbose: bool) -> &'static str {
    if verbose {
        "conductor=debug,info"
    } else {
        "conductor=info,warn"
    }
}

fn env_filter(verbose: bool) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive(verbose)))
}

/// Install the global subscriber. Keep the returned guard alive for the
/// life of the process so buffered file output is flushed.
pub fn init(verbose: bool, format: LogFormat, dir: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let stderr_layer = match format {
        LogFormat::Text => fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .with_filter(env_filter(verbose))
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_filter(env_filter(verbose))
            .boxed(),
    };

    let (file_layer, guard) = match dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "conductor.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .json()
                .with_writer(writer)
                .with_ansi(false)
                .with_filter(env_filter(verbose))
                .boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directive_follows_verbosity() {
        assert!(default_directive(true).contains("conductor=debug"));
        assert!(default_directive(false).contains("conductor=info"));
    }

    #[test]
    fn test_directives_parse() {
        for verbose in [true, false] {
            assert!(EnvFilter::try_new(default_directive(verbose)).is_ok());
        }
    }
}
