//! Error taxonomy for the proxy.
//!
//! Every variant here is session-fatal: streaming-mode correctness depends
//! on strict request/reply correspondence, and once a socket errors or a
//! reply arrives with no matching pending command, that correspondence
//! cannot be trusted. Errors propagate out of the protocol code to the
//! coordinator, which logs the final statistics line and exits non-zero;
//! nothing below `main` terminates the process directly.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Fatal proxy failures.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// A backend could not be brought up during the startup handshake
    /// (connect, banner, or XCLIENT exchange).
    #[error("backend {addr}: {reason}")]
    Handshake { addr: String, reason: String },

    /// A backend produced a reply while its pending-command queue was
    /// empty. Protocol ordering is lost and cannot be reconstructed.
    #[error("{name}: got unexpected reply (command queue empty)")]
    Desync { name: String },

    /// An established connection failed mid-session.
    #[error("{name}: lost connection ({during}): {source}")]
    LostConnection {
        name: String,
        during: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// A task failed outside the protocol paths (panic or cancellation).
    #[error("task failed: {0}")]
    Task(String),
}

impl ProxyError {
    /// Shorthand for the mid-session I/O failure case.
    pub fn lost(name: &str, during: &'static str, source: std::io::Error) -> Self {
        Self::LostConnection {
            name: name.to_string(),
            during,
            source,
        }
    }

    /// An end-of-stream where more data was required.
    pub fn lost_eof(name: &str, during: &'static str) -> Self {
        Self::lost(
            name,
            during,
            std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "unexpected end of stream"),
        )
    }
}
