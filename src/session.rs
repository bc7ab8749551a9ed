//! Buffered connection wrapper shared by the peer and backend sides.
//!
//! [`Connection`] owns one duplex byte stream split into a buffered reader
//! half and a buffered writer half, each behind its own async lock so the
//! reply-queue drain can write while another task reads. It knows nothing
//! about NNTP beyond the dot-terminated block framing.

use std::io;

use memchr::memchr;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::Mutex;
use tracing::info;

/// Read/write buffer size, matching typical transit line and header sizes.
const BUFFER_SIZE: usize = 32 * 1024;

type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// One live duplex stream with independent read and write buffering.
pub struct Connection {
    name: String,
    reader: Mutex<BufReader<BoxedRead>>,
    writer: Mutex<BufWriter<BoxedWrite>>,
}

/// Byte-scanner states for the `\r\n.\r\n` terminator search.
///
/// The scanner starts at [`CopyState::AfterCrlf`] so the stream begin counts
/// as a line start: a body consisting of a lone `.\r\n` terminates at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CopyState {
    /// Bulk-copying, searching for the next `\r`.
    Scan,
    /// Just saw `\r`, watching for `\n` (`\r\r\r\n` runs stay here).
    SawCr,
    /// Just saw `\r\n`, watching for `.`.
    AfterCrlf,
    /// Saw `\r\n.`, watching for `\r`.
    SawDot,
    /// Saw `\r\n.\r`, watching for the final `\n`.
    SawDotCr,
    /// Terminator complete.
    Done,
}

impl CopyState {
    /// Advance the scanner over `buf`. Returns the number of bytes consumed
    /// and whether the terminator completed (consumed then includes the
    /// terminator's final `\n`; any bytes after it are left untouched).
    fn advance(&mut self, buf: &[u8]) -> (usize, bool) {
        let mut i = 0;
        while i < buf.len() {
            *self = match *self {
                CopyState::Scan => match memchr(b'\r', &buf[i..]) {
                    Some(off) => {
                        i += off + 1;
                        CopyState::SawCr
                    }
                    None => {
                        i = buf.len();
                        CopyState::Scan
                    }
                },
                CopyState::SawCr => {
                    let b = buf[i];
                    i += 1;
                    match b {
                        b'\n' => CopyState::AfterCrlf,
                        b'\r' => CopyState::SawCr,
                        _ => CopyState::Scan,
                    }
                }
                CopyState::AfterCrlf => {
                    let b = buf[i];
                    i += 1;
                    match b {
                        b'.' => CopyState::SawDot,
                        b'\r' => CopyState::SawCr,
                        _ => CopyState::Scan,
                    }
                }
                CopyState::SawDot => {
                    let b = buf[i];
                    i += 1;
                    match b {
                        b'\r' => CopyState::SawDotCr,
                        _ => CopyState::Scan,
                    }
                }
                CopyState::SawDotCr => {
                    let b = buf[i];
                    i += 1;
                    match b {
                        b'\n' => CopyState::Done,
                        b'\r' => CopyState::SawCr,
                        _ => CopyState::Scan,
                    }
                }
                CopyState::Done => return (i, true),
            };
            if *self == CopyState::Done {
                return (i, true);
            }
        }
        (i, false)
    }
}

impl Connection {
    /// Wrap a duplex stream. `name` is used in log lines only.
    pub fn new<S>(stream: S, name: impl Into<String>) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (read, write) = tokio::io::split(stream);
        Self::from_halves(Box::new(read), Box::new(write), name)
    }

    fn from_halves(read: BoxedRead, write: BoxedWrite, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            reader: Mutex::new(BufReader::with_capacity(BUFFER_SIZE, read)),
            writer: Mutex::new(BufWriter::with_capacity(BUFFER_SIZE, write)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Read one line, up to and including the `\n` terminator, into `buf`
    /// (cleared first). Returns the number of bytes read; 0 means the remote
    /// closed cleanly. Lines are raw bytes; article data need not be UTF-8.
    pub async fn read_line(&self, buf: &mut Vec<u8>) -> io::Result<usize> {
        buf.clear();
        let mut reader = self.reader.lock().await;
        reader.read_until(b'\n', buf).await
    }

    /// Buffered write; bytes may sit in the write buffer until a flush.
    pub async fn write(&self, bytes: &[u8]) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(bytes).await
    }

    /// Flush buffered writes to the OS send path.
    pub async fn flush(&self) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.flush().await
    }

    /// Write and flush in one locked section.
    pub async fn write_and_flush(&self, bytes: &[u8]) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(bytes).await?;
        writer.flush().await
    }

    /// Relay raw bytes from this connection to `dest` until the
    /// `\r\n.\r\n` terminator has been copied, inclusive, then flush `dest`.
    ///
    /// This is a byte-level scanner, not a line reader: article bodies are
    /// binary-safe streams that must pass through unmodified (dot-stuffed
    /// lines included — this proxy never de-stuffs). Bytes following the
    /// terminator stay buffered for the next `read_line`. Partial output
    /// already written to `dest` is not rolled back on error; the caller
    /// must treat a failure here as connection-fatal.
    pub async fn copy_dot_terminated(&self, dest: &Connection) -> io::Result<()> {
        let mut reader = self.reader.lock().await;
        let mut writer = dest.writer.lock().await;
        let mut state = CopyState::AfterCrlf;

        loop {
            let buf = reader.fill_buf().await?;
            if buf.is_empty() {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "stream ended before dot terminator",
                ));
            }
            let (n, done) = state.advance(buf);
            writer.write_all(&buf[..n]).await?;
            reader.consume(n);
            if done {
                return writer.flush().await;
            }
        }
    }

    /// Close the write side of the stream. Errors are suppressed; there is
    /// nothing useful to do with a failed close.
    pub async fn close(&self) {
        info!("{}: session closed", self.name);
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }

    /// Best-effort final message, then close.
    pub async fn close_with_message(&self, msg: &str) {
        let _ = self.write_and_flush(msg.as_bytes()).await;
        self.close().await;
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").field("name", &self.name).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Connection over an in-memory duplex; returns the test-side stream.
    fn pair(max_buf: usize) -> (tokio::io::DuplexStream, Connection) {
        let (ours, theirs) = tokio::io::duplex(max_buf);
        (ours, Connection::new(theirs, "test"))
    }

    #[tokio::test]
    async fn test_read_line_includes_terminator() {
        let (mut ours, conn) = pair(4096);
        ours.write_all(b"CHECK <1@x>\r\nnext").await.unwrap();
        let mut line = Vec::new();
        let n = conn.read_line(&mut line).await.unwrap();
        assert_eq!(n, 13);
        assert_eq!(line, b"CHECK <1@x>\r\n");
    }

    #[tokio::test]
    async fn test_read_line_eof_returns_zero() {
        let (ours, conn) = pair(4096);
        drop(ours);
        let mut line = Vec::new();
        assert_eq!(conn.read_line(&mut line).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_write_is_buffered_until_flush() {
        let (mut ours, conn) = pair(4096);
        conn.write(b"200 ok\r\n").await.unwrap();
        // Nothing on the wire yet; flush pushes it out
        conn.flush().await.unwrap();
        let mut buf = [0u8; 16];
        let n = tokio::io::AsyncReadExt::read(&mut ours, &mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"200 ok\r\n");
    }

    async fn copy_through(input: &[u8], chunk: usize) -> (Vec<u8>, Connection) {
        let (mut src_ours, src) = pair(chunk);
        let (mut dst_theirs, dst) = pair(chunk);
        let input = input.to_vec();
        let feeder = tokio::spawn(async move {
            src_ours.write_all(&input).await.unwrap();
            src_ours
        });
        // The copier runs in its own task so the destination can be drained
        // concurrently even with a tiny duplex buffer
        let copier = tokio::spawn(async move {
            src.copy_dot_terminated(&dst).await.unwrap();
            drop(dst); // EOF for the collector below
            src
        });
        let mut out = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut dst_theirs, &mut out)
            .await
            .unwrap();
        let src = copier.await.unwrap();
        let _src_ours = feeder.await.unwrap();
        (out, src)
    }

    #[tokio::test]
    async fn test_copy_dot_terminated_well_formed() {
        let body = b"Subject: t\r\n\r\nhello\r\nworld\r\n.\r\n";
        let (out, _) = copy_through(body, 4096).await;
        assert_eq!(out, body);
    }

    #[tokio::test]
    async fn test_copy_dot_terminated_relays_dot_stuffing_unmodified() {
        // Escaped leading dot must pass through byte-for-byte; the line
        // "..stuffed" must not terminate the block or be de-stuffed.
        let body = b"line\r\n..stuffed\r\n.\r\n";
        let (out, _) = copy_through(body, 4096).await;
        assert_eq!(out, body);
    }

    #[tokio::test]
    async fn test_copy_dot_terminated_lone_dot_body() {
        // Stream start counts as a line start, so an empty body is legal
        let (out, _) = copy_through(b".\r\n", 4096).await;
        assert_eq!(out, b".\r\n");
    }

    #[tokio::test]
    async fn test_copy_dot_terminated_tolerates_cr_runs() {
        let body = b"a\r\r\r\nb\r\n.\r\n";
        let (out, _) = copy_through(body, 4096).await;
        assert_eq!(out, body);
    }

    #[tokio::test]
    async fn test_copy_dot_terminated_false_starts() {
        // ".\rx" and "\r\n.\r\r" sequences must not terminate early
        let body = b"\r\n.\rx\r\n.\r\r\n.\r\n";
        let (out, _) = copy_through(body, 4096).await;
        assert_eq!(out, body);
    }

    #[tokio::test]
    async fn test_copy_dot_terminated_spanning_chunks() {
        // Tiny duplex buffer forces the terminator across fill_buf calls
        let body = b"some article data here\r\nmore\r\n.\r\n";
        let (out, _) = copy_through(body, 3).await;
        assert_eq!(out, &body[..]);
    }

    #[tokio::test]
    async fn test_copy_dot_terminated_preserves_trailing_bytes() {
        // Bytes after the terminator belong to the next command
        let (out, src) = copy_through(b"body\r\n.\r\nCHECK <2@x>\r\n", 4096).await;
        assert_eq!(out, b"body\r\n.\r\n");
        let mut line = Vec::new();
        src.read_line(&mut line).await.unwrap();
        assert_eq!(line, b"CHECK <2@x>\r\n");
    }

    #[tokio::test]
    async fn test_copy_dot_terminated_eof_is_error() {
        let (mut src_ours, src) = pair(4096);
        let (_dst_theirs, dst) = pair(4096);
        src_ours.write_all(b"truncated body\r\n").await.unwrap();
        drop(src_ours);
        let err = src.copy_dot_terminated(&dst).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn test_copy_dot_terminated_binary_payload() {
        // Arbitrary bytes, including NUL and lone CR/LF, pass through
        let mut body: Vec<u8> = (0u8..=255).collect();
        body.extend_from_slice(b"\r\n.\r\n");
        let (out, _) = copy_through(&body, 16).await;
        assert_eq!(out, body);
    }

    #[tokio::test]
    async fn test_close_with_message_writes_then_closes() {
        let (mut ours, conn) = pair(4096);
        conn.close_with_message("500 backend x: down\r\n").await;
        let mut out = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut ours, &mut out)
            .await
            .unwrap();
        assert_eq!(out, b"500 backend x: down\r\n");
    }
}
