//! Command dispatch and session orchestration.
//!
//! One task runs the peer command loop; one task per backend reads that
//! backend's reply stream. They meet only in the shared reply queues and
//! the per-backend outstanding-request semaphore. Any mid-session failure
//! is fatal: the error unwinds to [`Proxy::run`], which hands it to `main`
//! for the non-zero exit.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio::time::timeout;
use tracing::{error, info};

use crate::error::{ProxyError, Result};
use crate::protocol::{self, CommandKind, chomp, codes};
use crate::queue::{PendingRequest, QUIT_CMD, ReplyQueue};
use crate::router::BackendSelector;
use crate::session::Connection;
use crate::stats::TransferStats;

/// Cap on un-answered requests per backend; forwarding waits for a free
/// slot so a slow backend cannot grow the queues without bound.
pub const PENDING_LIMIT: usize = 50;

/// Bound on each step of the startup handshake with a backend.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// How long to wait for backend readers to wind down after the peer loop.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// The inbound peer side: its connection plus the global reply queue, the
/// only queue ever drained to a socket.
#[derive(Debug)]
pub struct Peer {
    pub conn: Connection,
    pub queue: ReplyQueue,
}

impl Peer {
    pub fn new(conn: Connection) -> Self {
        Self {
            conn,
            queue: ReplyQueue::new(),
        }
    }
}

/// One upstream news server: its connection, the FIFO of requests awaiting
/// its replies, and the outstanding-request cap.
#[derive(Debug)]
pub struct Backend {
    pub conn: Connection,
    pub queue: ReplyQueue,
    pending: Semaphore,
}

/// The session: peer, backends, selector, counters.
///
/// Constructed once at startup and never replaced; shared by the peer-loop
/// task and every backend reader.
#[derive(Debug)]
pub struct Proxy {
    peer: Arc<Peer>,
    backends: Vec<Arc<Backend>>,
    selector: BackendSelector,
    stats: TransferStats,
}

/// Dial one backend and run the transit handshake: banner, `XCLIENT`
/// with the peer's source address, and its 2xx acknowledgement, each step
/// bounded by [`HANDSHAKE_TIMEOUT`].
async fn connect_backend(num: usize, addr: &str, peer_ip: IpAddr) -> Result<Backend> {
    let handshake = |reason: String| ProxyError::Handshake {
        addr: addr.to_string(),
        reason,
    };
    let name = format!("{addr}:{num}");
    info!("{name}: connecting");

    let stream = timeout(HANDSHAKE_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| handshake("connect: timed out".into()))?
        .map_err(|e| handshake(format!("connect: {e}")))?;
    let conn = Connection::new(stream, name);

    let mut line = Vec::new();
    let banner = timeout(HANDSHAKE_TIMEOUT, conn.read_line(&mut line))
        .await
        .map_err(|_| handshake("banner: timed out".into()))?
        .map_err(|e| handshake(format!("banner: {e}")))?;
    if banner == 0 || line[0] != b'2' {
        return Err(handshake(format!("connect failed: {}", chomp(&line))));
    }

    let xclient = format!("XCLIENT {peer_ip}\r\n");
    timeout(HANDSHAKE_TIMEOUT, conn.write_and_flush(xclient.as_bytes()))
        .await
        .map_err(|_| handshake("XCLIENT: timed out".into()))?
        .map_err(|e| handshake(format!("lost connection: {e}")))?;

    let reply = timeout(HANDSHAKE_TIMEOUT, conn.read_line(&mut line))
        .await
        .map_err(|_| handshake("XCLIENT: timed out".into()))?
        .map_err(|e| handshake(format!("XCLIENT: {e}")))?;
    if reply == 0 || line[0] != b'2' {
        return Err(handshake(format!("XCLIENT failed: {}", chomp(&line))));
    }

    Ok(Backend {
        conn,
        queue: ReplyQueue::new(),
        pending: Semaphore::new(PENDING_LIMIT),
    })
}

fn flatten_join(res: std::result::Result<Result<()>, JoinError>) -> Result<()> {
    res.map_err(|e| ProxyError::Task(e.to_string()))?
}

impl Proxy {
    /// Dial every configured backend in order. Any failure closes the
    /// backends already opened, tells the peer which backend broke, and
    /// aborts the session.
    pub async fn connect(
        peer: Arc<Peer>,
        peer_ip: IpAddr,
        backend_addrs: &[String],
    ) -> Result<Arc<Self>> {
        let mut backends = Vec::with_capacity(backend_addrs.len());
        for (num, addr) in backend_addrs.iter().enumerate() {
            match connect_backend(num + 1, addr, peer_ip).await {
                Ok(backend) => backends.push(Arc::new(backend)),
                Err(err) => {
                    for backend in &backends {
                        backend.conn.close().await;
                    }
                    peer.conn
                        .close_with_message(&format!("500 {err}\r\n"))
                        .await;
                    return Err(err);
                }
            }
        }
        Ok(Arc::new(Self {
            peer,
            selector: BackendSelector::new(backends.len()),
            backends,
            stats: TransferStats::new(),
        }))
    }

    /// Drive the whole session: spawn one reader per backend, run the peer
    /// command loop, then wind down. A fatal error from any task is
    /// returned as soon as it surfaces.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let mut readers = JoinSet::new();
        for backend in &self.backends {
            readers.spawn(self.clone().backend_reader(backend.clone()));
        }
        let mut peer_task = tokio::spawn(self.clone().peer_loop());

        let peer_result = loop {
            tokio::select! {
                res = &mut peer_task => break flatten_join(res),
                Some(res) = readers.join_next() => {
                    // A clean reader exit just means its backend answered
                    // QUIT; anything else ends the session now
                    if let Err(e) = flatten_join(res) {
                        peer_task.abort();
                        return Err(e);
                    }
                }
            }
        };
        peer_result?;

        let name = self.peer.conn.name();
        info!("{name}: waiting for backends to shut down");
        let drain_readers = async {
            while let Some(res) = readers.join_next().await {
                flatten_join(res)?;
            }
            Ok::<(), ProxyError>(())
        };
        match timeout(SHUTDOWN_TIMEOUT, drain_readers).await {
            Err(_) => error!("{name}: timeout waiting for backend(s) to close"),
            Ok(Err(e)) => return Err(e),
            Ok(Ok(())) => {}
        }
        self.peer.queue.drain(&self.peer.conn).await?;
        self.peer.conn.close().await;
        info!("{name}: exit");
        Ok(())
    }

    /// Peer command loop; the session stats line is logged on every exit
    /// path, clean or fatal.
    async fn peer_loop(self: Arc<Self>) -> Result<()> {
        let result = self.peer_loop_inner().await;
        self.stats.log_summary(self.peer.conn.name());
        result
    }

    async fn peer_loop_inner(&self) -> Result<()> {
        let peer = &self.peer;
        let name = peer.conn.name();
        info!("{name}: connected");

        let host = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "localhost".to_string());
        let banner = format!("200 {host} nntp-slb ready (transit mode)\r\n");
        if let Err(e) = peer.conn.write_and_flush(banner.as_bytes()).await {
            // Peer vanished before the banner; backends never got traffic,
            // release them and call it a day
            error!("{name}: unexpected: {e}");
            self.quit_fanout(b"quit\r\n", false).await?;
            return Ok(());
        }

        // Backend expected to receive an article body next, set when an
        // IHAVE is forwarded. Only this task touches it.
        let mut ihave_pending: Option<usize> = None;
        let mut line = Vec::new();
        loop {
            let n = match peer.conn.read_line(&mut line).await {
                Ok(n) => n,
                Err(e) => {
                    error!("{name}: unexpected: {e} (qlen={})", peer.queue.len());
                    return Err(ProxyError::lost(name, "read", e));
                }
            };
            if n == 0 {
                if peer.queue.is_empty() {
                    // Clean shutdown: quietly pass QUIT along to backends
                    info!("{name}: EOF");
                    self.quit_fanout(b"quit\r\n", false).await?;
                    break;
                }
                error!(
                    "{name}: unexpected: EOF with replies outstanding (qlen={})",
                    peer.queue.len()
                );
                return Err(ProxyError::lost_eof(name, "read"));
            }
            // read_until only stops short of '\n' at end of stream
            if line.last() != Some(&b'\n') {
                error!("{name}: unexpected: truncated line at EOF");
                return Err(ProxyError::lost_eof(name, "read"));
            }

            // A drained 335 means the backend asked for the article: this
            // line starts the body. The pending marker is cleared once per
            // line whether or not a transfer was armed.
            if let Some(idx) = ihave_pending.take()
                && peer.queue.last_code() == codes::SEND_ARTICLE
            {
                let backend = &self.backends[idx];
                if let Err(e) = self.forward(&line, "ihave", None, backend, true).await {
                    error!(
                        "{name}: error during IHAVE forward to {}: {e}",
                        backend.conn.name()
                    );
                    return Err(e);
                }
                continue;
            }

            let text = String::from_utf8_lossy(&line);
            let words: Vec<&str> = text.split_whitespace().collect();
            let Some(first) = words.first() else {
                // Empty lines are ignored, like most news servers do
                continue;
            };
            let cmd = first.to_ascii_lowercase();
            let nargs = words.len() - 1;

            match protocol::lookup(&cmd) {
                None => {
                    error!("{name}: unknown command: {}", chomp(&line));
                    self.send_reply(&cmd, "500 What?\r\n").await?;
                }
                Some(spec) if nargs < spec.min_args || nargs > spec.max_args => {
                    error!("{name}: syntax error: {}", chomp(&line));
                    self.send_reply(&cmd, "435 syntax error\r\n").await?;
                }
                Some(spec) => {
                    if let Err(e) = self
                        .dispatch(spec.kind, &line, &words, &mut ihave_pending)
                        .await
                    {
                        error!("{name}: error on {cmd}: {e}");
                        return Err(e);
                    }
                }
            }

            if cmd == QUIT_CMD {
                info!("{name}: QUIT");
                break;
            }
        }
        Ok(())
    }

    async fn dispatch(
        &self,
        kind: CommandKind,
        line: &[u8],
        words: &[&str],
        ihave_pending: &mut Option<usize>,
    ) -> Result<()> {
        let cmd = &words[0].to_ascii_lowercase();
        match kind {
            CommandKind::Help => self.send_reply(cmd, &protocol::help_reply()).await,
            CommandKind::Capabilities => {
                self.send_reply(cmd, &protocol::capabilities_reply()).await
            }
            CommandKind::Mode => self.send_reply(cmd, protocol::mode_reply(words[1])).await,
            CommandKind::Simple => {
                let backend = &self.backends[self.selector.select(words[1])];
                self.forward(line, cmd, msgid_of(words), backend, false).await
            }
            CommandKind::Ihave => {
                if !self.peer.queue.is_empty() {
                    // An article transfer may not overlap other pending
                    // commands
                    return self
                        .send_reply(cmd, "436 This command MUST NOT be pipelined\r\n")
                        .await;
                }
                let idx = self.selector.select(words[1]);
                self.forward(line, cmd, msgid_of(words), &self.backends[idx], false)
                    .await?;
                *ihave_pending = Some(idx);
                Ok(())
            }
            CommandKind::Takethis => {
                let backend = &self.backends[self.selector.select(words[1])];
                self.forward(line, cmd, msgid_of(words), backend, true).await
            }
            CommandKind::Quit => self.quit_fanout(line, words.len() == 1).await,
        }
    }

    /// Queue a locally synthesized reply; it still drains in issue order
    /// behind any outstanding forwarded commands.
    async fn send_reply(&self, cmd: &str, reply: &str) -> Result<()> {
        let req = PendingRequest::ready_reply(cmd, reply);
        self.peer.queue.add_and_run(req, &self.peer.conn).await
    }

    /// Forward one command line to `backend`: append the shared pending
    /// record to the peer's global queue and the backend's own queue, in
    /// that order and before any bytes move, then write the line. With
    /// `with_body`, the peer's dot-terminated article follows immediately.
    async fn forward(
        &self,
        line: &[u8],
        cmd: &str,
        msgid: Option<&str>,
        backend: &Arc<Backend>,
        with_body: bool,
    ) -> Result<()> {
        // Wait for an outstanding-request slot on this backend; the permit
        // is returned when its reply is popped
        if let Ok(permit) = backend.pending.acquire().await {
            permit.forget();
        }

        let req = PendingRequest::new(line.to_vec(), cmd, msgid.map(str::to_string));
        self.peer.queue.add(req.clone());
        backend.queue.add(req);

        let backend_name = backend.conn.name();
        if with_body {
            backend
                .conn
                .write(line)
                .await
                .map_err(|e| ProxyError::lost(backend_name, "write", e))?;
            self.peer
                .conn
                .copy_dot_terminated(&backend.conn)
                .await
                .map_err(|e| ProxyError::lost(backend_name, "body copy", e))?;
        } else {
            backend
                .conn
                .write_and_flush(line)
                .await
                .map_err(|e| ProxyError::lost(backend_name, "write", e))?;
        }
        Ok(())
    }

    /// Pass QUIT to every backend. Each backend's closing reply is consumed
    /// by its reader without being copied to the peer; when `announce` is
    /// set, one synthesized goodbye is queued to drain after them.
    async fn quit_fanout(&self, line: &[u8], announce: bool) -> Result<()> {
        for backend in &self.backends {
            // Best effort: a backend that is already gone will surface
            // through its reader task
            let _ = self.forward(line, QUIT_CMD, None, backend, false).await;
        }
        if announce {
            self.send_reply("QUIT", "205 Goodbye\r\n").await?;
        }
        Ok(())
    }

    /// Reply-reader task for one backend: match each reply line to the
    /// oldest pending request on this backend, stamp it, and let the peer's
    /// global queue drain whatever became releasable.
    async fn backend_reader(self: Arc<Self>, backend: Arc<Backend>) -> Result<()> {
        let result = self.reader_inner(&backend).await;
        backend.conn.close().await;
        result
    }

    async fn reader_inner(&self, backend: &Backend) -> Result<()> {
        let name = backend.conn.name();
        let mut line = Vec::new();
        loop {
            let n = match backend.conn.read_line(&mut line).await {
                Ok(n) => n,
                Err(e) => {
                    self.stats.log_summary(self.peer.conn.name());
                    error!("{name}: unexpected: {e}");
                    return Err(ProxyError::lost(name, "read", e));
                }
            };
            if n == 0 {
                self.stats.log_summary(self.peer.conn.name());
                error!("{name}: unexpected: EOF");
                return Err(ProxyError::lost_eof(name, "read"));
            }
            if line.last() != Some(&b'\n') {
                self.stats.log_summary(self.peer.conn.name());
                error!("{name}: unexpected: truncated reply at EOF");
                return Err(ProxyError::lost_eof(name, "read"));
            }

            let code = protocol::parse_status_code(&line);
            if code == 0 {
                // Relayed as-is; only the counters miss out
                error!("{name}: cannot parse reply code: {}", chomp(&line));
            }

            let Some(req) = backend.queue.pop_first() else {
                self.stats.log_summary(self.peer.conn.name());
                return Err(ProxyError::Desync {
                    name: name.to_string(),
                });
            };
            backend.pending.add_permits(1);

            req.set_reply(code, line.clone());
            if code > 0 {
                self.stats.record(code);
            }

            let is_quit = req.cmd() == QUIT_CMD;
            self.peer
                .queue
                .mark_ready_and_drain(&req, &self.peer.conn)
                .await?;

            // That was the backend acknowledging QUIT: this reader is done
            if is_quit {
                break;
            }
        }
        Ok(())
    }
}

/// The message-id argument, when present and bracketed.
fn msgid_of<'a>(words: &[&'a str]) -> Option<&'a str> {
    words.get(1).copied().filter(|w| w.starts_with('<'))
}
