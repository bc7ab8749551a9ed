//! Streaming-mode NNTP transit load balancer.
//!
//! One inbound peer connection is split across multiple backend news
//! servers. Article submission commands (IHAVE/CHECK/STAT/TAKETHIS) are
//! hashed per message-id onto a fixed backend; replies are re-sequenced to
//! the peer in the exact order the commands were issued, even though the
//! backends answer concurrently over independent sockets.

pub mod args;
pub mod config;
pub mod error;
pub mod logging;
pub mod protocol;
pub mod proxy;
pub mod queue;
pub mod router;
pub mod session;
pub mod stats;

pub use error::{ProxyError, Result};
pub use proxy::{Backend, Peer, Proxy};
pub use queue::{PendingRequest, ReplyQueue};
pub use router::BackendSelector;
pub use session::Connection;
pub use stats::TransferStats;
