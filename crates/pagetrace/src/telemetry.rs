use std::io::IsTerminal;

use tracing_subscriber::EnvFilter;

/// Compact stderr logging filtered by `RUST_LOG`; silent by default.
pub fn init_cli_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_ansi(std::io::stderr().is_terminal())
        .with_writer(std::io::stderr)
        .compact()
        .try_init();
}
