//! Process-wide tracing setup.
//!
//! Console output is compact and human-oriented. When file logging is
//! enabled, a JSON copy of every event is appended to a daily-rolling
//! `autoforge.<date>.jsonl` under the project's log directory.

use std::path::Path;

use anyhow::Result;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::config::LoggingSection;

const LOG_PREFIX: &str = "autoforge";

/// Resolve the default filter directive. `RUST_LOG` always wins over this.
pub fn default_directive(settings: &LoggingSection, verbose: bool) -> String {
    if verbose {
        "debug".to_string()
    } else {
        settings.level.clone()
    }
}

/// Install the global subscriber.
///
/// Returns the appender guard when a file layer was installed; the caller must
/// keep it alive until exit or buffered lines are lost. Calling this twice is
/// harmless: the second registration is ignored.
pub fn init(
    settings: &LoggingSection,
    verbose: bool,
    log_dir: Option<&Path>,
) -> Result<Option<WorkerGuard>> {
    let directive = default_directive(settings, verbose);
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive.as_str()));

    let console_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_target(verbose)
        .with_writer(std::io::stderr)
        .boxed();

    let (file_layer, guard) = match log_dir {
        Some(dir) if settings.file => {
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::Builder::new()
                .rotation(tracing_appender::rolling::Rotation::DAILY)
                .filename_prefix(LOG_PREFIX)
                .filename_suffix("jsonl")
                .build(dir)?;
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_current_span(false)
                .with_span_list(false)
                .boxed();
            (Some(layer), Some(guard))
        }
        _ => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .ok();

    Ok(guard)
}
