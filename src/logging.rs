//! Logging setup.
//!
//! Log lines go to stderr so they never mix with the NNTP stream when the
//! peer socket is inherited on stdin. Level selection follows `RUST_LOG`,
//! defaulting to "info". The original's Notice severity maps to `info!`;
//! Fatal is not a log level here but a [`crate::ProxyError`] that unwinds
//! to `main`.

/// Initialize the tracing subscriber. Call once at startup.
pub fn init() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();
}
