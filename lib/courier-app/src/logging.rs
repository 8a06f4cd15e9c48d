//! Logging.

use std::io::IsTerminal as _;

use tracing::{level_filters::LevelFilter, Subscriber};
use tracing_subscriber::{
    layer::SubscriberExt as _, registry::LookupSpan, util::SubscriberInitExt as _, EnvFilter, Layer,
};

/// Environment variable holding the level filtering directives.
pub const LOG_LEVEL_ENV_VAR: &str = "COURIER_LOG_LEVEL";

/// Environment variable that switches the output to JSON when set to `true` or `1`.
pub const LOG_FORMAT_JSON_ENV_VAR: &str = "COURIER_LOG_FORMAT_JSON";

/// Logs a message to standard error and exits the process with a non-zero exit code.
pub fn fatal_and_exit(message: String) -> ! {
    eprintln!("FATAL: {}", message);
    std::process::exit(1);
}

/// Initializes the logging subsystem for `tracing`.
///
/// Level filtering directives are read from `COURIER_LOG_LEVEL`, in the usual `EnvFilter` syntax, and fall back to
/// `default_level` (or `INFO`) when unset. Setting `COURIER_LOG_FORMAT_JSON` to `true` or `1` switches the output from
/// the human-readable format to one JSON object per line.
///
/// Logs are always written to standard error, leaving standard output free for data.
///
/// # Errors
///
/// If the logging subsystem was already initialized, an error will be returned.
pub fn initialize_logging(default_level: Option<LevelFilter>) -> Result<(), anyhow::Error> {
    let level_filter = EnvFilter::builder()
        .with_default_directive(default_level.unwrap_or(LevelFilter::INFO).into())
        .with_env_var(LOG_LEVEL_ENV_VAR)
        .from_env_lossy();

    let layer = if json_format_requested(std::env::var(LOG_FORMAT_JSON_ENV_VAR).ok().as_deref()) {
        json_layer().boxed()
    } else {
        pretty_layer().boxed()
    };

    tracing_subscriber::registry()
        .with(layer.with_filter(level_filter))
        .try_init()?;

    Ok(())
}

fn json_format_requested(value: Option<&str>) -> bool {
    value
        .map(|s| s.trim().to_lowercase())
        .is_some_and(|s| s == "true" || s == "1")
}

fn json_layer<S>() -> impl Layer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    tracing_subscriber::fmt::Layer::new()
        .json()
        .flatten_event(true)
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_writer(std::io::stderr)
}

fn pretty_layer<S>() -> impl Layer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    tracing_subscriber::fmt::Layer::new()
        .with_target(true)
        .with_ansi(std::io::stderr().is_terminal())
        .with_writer(std::io::stderr)
}
