//! nntp-slb: streaming-mode NNTP transit load balancer.
//!
//! One inbound transit feed is split across several backend news servers.
//! Runs either under a super-server with the peer socket inherited on
//! stdin, or standalone with `--listen`.

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info};

use nntp_slb::args::Args;
use nntp_slb::config;
use nntp_slb::proxy::{Peer, Proxy};
use nntp_slb::session::Connection;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    nntp_slb::logging::init();

    let Some(spec) = args.backend.as_deref() else {
        bail!("no backends configured (use --backend or $REALSERVERS)");
    };
    let backends = config::parse_backend_list(spec)?;
    info!("backends: {}", backends.join(" "));

    match args.listen.as_deref() {
        Some(addr) => serve(addr, backends).await,
        None => {
            let stream = inherited_stream().context("no inherited socket on stdin")?;
            session(stream, &backends).await
        }
    }
}

/// Standalone mode: accept transit connections and run each as its own
/// session. A failed session ends that peer only.
async fn serve(addr: &str, backends: Vec<String>) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("listen on {addr}"))?;
    info!("listening on {addr}");
    loop {
        let (stream, peer) = listener.accept().await.context("accept")?;
        let backends = backends.clone();
        tokio::spawn(async move {
            if let Err(e) = session(stream, &backends).await {
                error!("{peer}: session failed: {e:#}");
            }
        });
    }
}

/// Service one inbound transit connection to completion.
async fn session(stream: TcpStream, backends: &[String]) -> Result<()> {
    let peer_addr = stream.peer_addr().context("peer address")?;
    let conn = Connection::new(stream, peer_addr.to_string());
    let peer = Arc::new(Peer::new(conn));
    let proxy = Proxy::connect(peer, peer_addr.ip(), backends).await?;
    proxy.run().await?;
    Ok(())
}

/// Super-server mode: the already-accepted peer socket arrives as fd 0.
/// Logging goes to stderr, so stdin/stdout stay clean for the protocol.
#[cfg(unix)]
fn inherited_stream() -> Result<TcpStream> {
    use std::os::fd::FromRawFd;

    let std_stream = unsafe { std::net::TcpStream::from_raw_fd(0) };
    std_stream
        .set_nonblocking(true)
        .context("set_nonblocking")?;
    TcpStream::from_std(std_stream).context("adopt inherited socket")
}

#[cfg(not(unix))]
fn inherited_stream() -> Result<TcpStream> {
    bail!("socket inheritance on stdin is only supported on unix; use --listen")
}
