use tracing_subscriber::EnvFilter;

pub const DEFAULT_LOG_FILTER: &str = "info,murmur=debug";

/// Installs the global fmt subscriber; `RUST_LOG` overrides the default filter.
///
/// Logs go to stderr so they never interleave with chat output on stdout.
pub fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();

    if let Err(error) = installed {
        eprintln!("tracing subscriber already installed: {error}");
    }
}
