//! Diagnostic logging.
//!
//! Logs go to stderr so command output on stdout stays machine-readable.
//! Verbosity follows `RUST_LOG` (default `info`); `--verbose` raises the
//! crate's own level to `debug`.

use tracing_subscriber::EnvFilter;

pub fn init(verbose: bool) {
    let default = if verbose {
        "info,activity_memory=debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    // A second init (e.g. from tests) keeps the first subscriber
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
