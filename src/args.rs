//! Command-line arguments.

use clap::Parser;

/// Streaming-mode NNTP transit load balancer.
///
/// Splits one inbound transit feed across several backend news servers,
/// hashing each message-id onto a fixed backend.
#[derive(Parser, Debug, Clone)]
#[command(name = "nntp-slb", version, about)]
pub struct Args {
    /// Backend servers: ip:port[,ip:port...] (port defaults to 119)
    #[arg(short, long, env = "REALSERVERS")]
    pub backend: Option<String>,

    /// Address to listen on; when absent, the peer socket is expected to be
    /// inherited on stdin (inetd style)
    #[arg(short, long)]
    pub listen: Option<String>,
}
