//! Ordered reply sequencing.
//!
//! Every command forwarded to a backend gets one [`PendingRequest`] record,
//! referenced from two queues at once: the peer's global queue (the order
//! everything must reach the peer in) and the issuing backend's queue (the
//! order that backend will answer in, per NNTP streaming semantics). The
//! backend reader stamps the record with the reply and marks it ready; the
//! peer's queue drains strictly head-first, so a slow backend holds back
//! every later reply until its own arrives.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::error::{ProxyError, Result};
use crate::protocol::codes;
use crate::session::Connection;

/// Command keyword marking backend-bound QUIT records. Replies to these are
/// consumed for shutdown tracking but never copied to the peer; the
/// synthesized goodbye uses the distinct `"QUIT"` tag so it is written.
pub const QUIT_CMD: &str = "quit";

/// Mutable reply half of a pending request, stamped by the backend reader.
#[derive(Debug)]
struct ReplyState {
    /// The reply line once known; initially the original command line.
    line: Vec<u8>,
    /// Parsed 3-digit status code, 0 until known (or unparsable).
    code: u16,
    /// Whether this record may be drained.
    ready: bool,
}

/// One in-flight command awaiting its reply.
///
/// Shared via `Arc` between the peer queue and one backend queue; the
/// backend queue only ever pops, so the peer queue's drain is the point
/// where the record is finally dropped.
#[derive(Debug)]
pub struct PendingRequest {
    cmd: String,
    msgid: Option<String>,
    state: Mutex<ReplyState>,
}

impl PendingRequest {
    /// Record for a command forwarded to a backend; not yet ready.
    pub fn new(line: Vec<u8>, cmd: &str, msgid: Option<String>) -> Arc<Self> {
        Arc::new(Self {
            cmd: cmd.to_string(),
            msgid,
            state: Mutex::new(ReplyState {
                line,
                code: 0,
                ready: false,
            }),
        })
    }

    /// Record for a locally synthesized reply, ready immediately.
    pub fn ready_reply(cmd: &str, line: &str) -> Arc<Self> {
        Arc::new(Self {
            cmd: cmd.to_string(),
            msgid: None,
            state: Mutex::new(ReplyState {
                line: line.as_bytes().to_vec(),
                code: 0,
                ready: true,
            }),
        })
    }

    pub fn cmd(&self) -> &str {
        &self.cmd
    }

    pub fn msgid(&self) -> Option<&str> {
        self.msgid.as_deref()
    }

    /// Stamp the backend's reply onto this record. Does not mark it ready;
    /// readiness is flipped under the owning queue's lock.
    pub fn set_reply(&self, code: u16, line: Vec<u8>) {
        let mut state = self.state.lock().expect("request state poisoned");
        state.code = code;
        state.line = line;
    }

    pub fn code(&self) -> u16 {
        self.state.lock().expect("request state poisoned").code
    }

    pub fn is_ready(&self) -> bool {
        self.state.lock().expect("request state poisoned").ready
    }

    fn set_ready(&self) {
        self.state.lock().expect("request state poisoned").ready = true;
    }

    /// The line to put on the wire for this record.
    ///
    /// A 430 (no such article) reply to STAT does not echo the message-id;
    /// append the one from the request so the peer can correlate pipelined
    /// STATs. Used for testing feeds.
    fn wire_line(&self) -> Vec<u8> {
        let state = self.state.lock().expect("request state poisoned");
        if state.code == codes::NO_SUCH_ARTICLE
            && let Some(msgid) = &self.msgid
            && !state.line.contains(&b'<')
        {
            let mut end = state.line.len();
            while end > 0 && (state.line[end - 1] == b'\r' || state.line[end - 1] == b'\n') {
                end -= 1;
            }
            let mut line = state.line[..end].to_vec();
            line.push(b' ');
            line.extend_from_slice(msgid.as_bytes());
            line.extend_from_slice(b"\r\n");
            return line;
        }
        state.line.clone()
    }
}

/// Insertion-ordered queue of pending requests.
///
/// Structural state lives under one mutex; the drain's wire I/O is
/// serialized by a second, async lock so a slow peer write never blocks
/// backend readers calling [`ReplyQueue::add`] or marking entries ready.
#[derive(Debug)]
pub struct ReplyQueue {
    inner: Mutex<VecDeque<Arc<PendingRequest>>>,
    write_lock: tokio::sync::Mutex<()>,
    last_code: AtomicU16,
}

impl Default for ReplyQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplyQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            write_lock: tokio::sync::Mutex::new(()),
            last_code: AtomicU16::new(0),
        }
    }

    /// Append `req` to the tail.
    pub fn add(&self, req: Arc<PendingRequest>) {
        self.inner.lock().expect("queue poisoned").push_back(req);
    }

    /// Append an already-ready `req` and, if it landed at the head of an
    /// otherwise empty queue, drain it immediately. Used for locally
    /// synthesized replies, which must still wait their turn behind any
    /// outstanding forwarded commands.
    pub async fn add_and_run(&self, req: Arc<PendingRequest>, conn: &Connection) -> Result<()> {
        let lone = {
            let mut queue = self.inner.lock().expect("queue poisoned");
            queue.push_back(req);
            queue.len() == 1
        };
        if lone {
            self.drain(conn).await?;
        }
        Ok(())
    }

    /// Mark `req` ready, then drain from the head as far as possible.
    pub async fn mark_ready_and_drain(
        &self,
        req: &PendingRequest,
        conn: &Connection,
    ) -> Result<()> {
        {
            let _guard = self.inner.lock().expect("queue poisoned");
            req.set_ready();
        }
        self.drain(conn).await
    }

    /// Remove and return the head unconditionally. The backend reader calls
    /// this for every reply line; `None` means the backend answered a
    /// command we never sent, which the caller treats as fatal desync.
    pub fn pop_first(&self) -> Option<Arc<PendingRequest>> {
        self.inner.lock().expect("queue poisoned").pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("queue poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Status code of the most recently drained entry; 0 before anything
    /// has drained. The dispatcher checks this for the post-IHAVE 335.
    pub fn last_code(&self) -> u16 {
        self.last_code.load(Ordering::Acquire)
    }

    fn head_ready(&self) -> bool {
        self.inner
            .lock()
            .expect("queue poisoned")
            .front()
            .is_some_and(|req| req.is_ready())
    }

    /// Pop and write ready entries head-first until the head is missing or
    /// not ready, then flush once. A write or flush failure here is
    /// unrecoverable; the peer's ordering state can no longer be trusted.
    pub async fn drain(&self, conn: &Connection) -> Result<()> {
        if !self.head_ready() {
            return Ok(());
        }
        let _wire = self.write_lock.lock().await;

        debug!("{}: running queue, len is {}", conn.name(), self.len());
        let mut drained = None;
        loop {
            let req = {
                let mut queue = self.inner.lock().expect("queue poisoned");
                if queue.front().is_some_and(|req| req.is_ready()) {
                    queue.pop_front()
                } else {
                    None
                }
            };
            let Some(req) = req else { break };

            // Replies to backend-bound QUITs are not copied to the peer
            if req.cmd() != QUIT_CMD {
                let line = req.wire_line();
                conn.write(&line)
                    .await
                    .map_err(|e| ProxyError::lost(conn.name(), "write", e))?;
            }
            drained = Some(req.code());
        }

        if let Some(code) = drained {
            self.last_code.store(code, Ordering::Release);
            conn.flush()
                .await
                .map_err(|e| ProxyError::lost(conn.name(), "flush", e))?;
        }
        debug!("{}: done running queue, len is {}", conn.name(), self.len());
        Ok(())
    }
}
