//! Tracing setup for the CLI.
//!
//! Logs go to stderr so `--json` output on stdout stays machine-readable.

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info";

/// Install the global subscriber.
///
/// `--log-level` wins over `RUST_LOG`, which wins over the `info` default.
pub fn init(cli_filter: Option<&str>) {
    let filter = match cli_filter {
        Some(directives) => EnvFilter::try_new(directives).unwrap_or_else(|e| {
            eprintln!("error: invalid --log-level {directives:?}: {e}");
            std::process::exit(1);
        }),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER)),
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
