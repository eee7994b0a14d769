use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Install the stderr subscriber for the CLI.
///
/// `RUST_LOG` is honored when no `-v` flag is given; otherwise each `-v`
/// raises the level (`info`, then `debug`). Stdout is left to command output.
pub fn init_logging(verbosity: u8) {
    let filter = match verbosity {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("info"),
        _ => EnvFilter::new("debug"),
    };

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);

    // A second call (e.g. from tests) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .try_init();
}
