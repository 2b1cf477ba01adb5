//! TCP framing and the transport-side [`Responder`].
//!
//! Inbound framing peeks a fixed-size prefix (enough for BeginString,
//! BodyLength and MsgType), sizes the frame from BodyLength, then reads the
//! rest exactly. Garbled input is skipped byte-wise until something that
//! could be a frame start (`8=F`) appears.

use crate::fix::decode::parse_frame_prefix;
use crate::fix::mem::MsgBuf;
use crate::fix::session::Responder;
use crate::fix::{GarbledMessageType, SessionError};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::mpsc;
use tracing::{debug, error};

pub(super) const PEEK_LEN: usize = 32;
const FRAME_BEGINNING: &[u8] = b"8=F";

pub(super) struct HeaderBuf {
    inner: [u8; PEEK_LEN],
    filled_len: usize,
}

impl HeaderBuf {
    pub(super) fn new() -> HeaderBuf {
        HeaderBuf {
            inner: [0; PEEK_LEN],
            filled_len: 0,
        }
    }

    fn unfilled_mut(&mut self) -> &mut [u8] {
        &mut self.inner[self.filled_len..]
    }

    fn advance(&mut self, n: usize) {
        self.filled_len = (self.filled_len + n).min(PEEK_LEN);
    }

    fn clear(&mut self) {
        self.filled_len = 0;
    }

    fn is_full(&self) -> bool {
        self.filled_len == PEEK_LEN
    }

    fn filled(&self) -> &[u8] {
        &self.inner[..self.filled_len]
    }

    /// Discard everything before the next plausible frame start. The first
    /// byte always goes (it belongs to the garbled frame); the rest is kept
    /// only from a `8=F` prefix match onward. Returns the discarded bytes.
    fn resync(&mut self) -> Vec<u8> {
        let filled = self.filled();
        let keep_from = (1..filled.len())
            .find(|at| {
                let candidate = &filled[*at..];
                let check = candidate.len().min(FRAME_BEGINNING.len());
                candidate[..check] == FRAME_BEGINNING[..check]
            })
            .unwrap_or(self.filled_len);
        let junk = filled[..keep_from].to_vec();
        self.inner.copy_within(keep_from..self.filled_len, 0);
        self.filled_len -= keep_from;
        junk
    }
}

/// Fill the peek buffer. EOF before it fills is a disconnection.
pub(super) async fn read_header<R: AsyncRead + Unpin>(
    r: &mut R,
    buf: &mut HeaderBuf,
) -> Result<(), SessionError> {
    while !buf.is_full() {
        let num_read = r.read(buf.unfilled_mut()).await?;
        if num_read == 0 {
            return Err(SessionError::TcpDisconnection);
        }
        buf.advance(num_read);
    }
    Ok(())
}

/// Consume one complete frame. On garbled prefixes the buffer is resynced
/// and the error surfaces so the caller can log and carry on.
pub(super) async fn read_message<R: AsyncRead + Unpin>(
    r: &mut R,
    buf: &mut HeaderBuf,
) -> Result<MsgBuf, SessionError> {
    let msg_length = match parse_frame_prefix(buf.filled()) {
        Ok(prefix) => prefix.msg_length,
        Err(e) => {
            let junk = buf.resync();
            debug!(dropped = junk.len(), "resyncing after garbled frame");
            return Err(e);
        }
    };

    let header_len = buf.filled().len();
    let mut frame = vec![0; msg_length.max(header_len)];
    frame[..header_len].copy_from_slice(buf.filled());
    buf.clear();
    if msg_length > header_len {
        r.read_exact(&mut frame[header_len..]).await?;
    }

    if &frame[msg_length - 7..msg_length - 4] != b"10=" {
        return Err(SessionError::new_garbled_message(
            String::from("BodyLength does not land on the trailer"),
            GarbledMessageType::BodyLengthIssue,
        ));
    }
    Ok(frame.into())
}

pub(crate) enum WriterCommand {
    Frame(MsgBuf),
    Shutdown,
}

/// The session-facing half: synchronous sends onto an unbounded channel
/// drained by [`writer_task`].
pub(crate) struct TcpResponder {
    sender: mpsc::UnboundedSender<WriterCommand>,
    remote: Option<SocketAddr>,
    closed: AtomicBool,
}

impl TcpResponder {
    pub(crate) fn new(
        remote: Option<SocketAddr>,
    ) -> (TcpResponder, mpsc::UnboundedReceiver<WriterCommand>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            TcpResponder {
                sender,
                remote,
                closed: AtomicBool::new(false),
            },
            receiver,
        )
    }
}

impl Responder for TcpResponder {
    fn send(&self, msg: &MsgBuf) -> bool {
        if self.closed.load(Ordering::Relaxed) {
            return false;
        }
        self.sender.send(WriterCommand::Frame(msg.clone())).is_ok()
    }

    fn disconnect(&self) {
        self.closed.store(true, Ordering::Relaxed);
        let _ = self.sender.send(WriterCommand::Shutdown);
    }

    fn remote_address(&self) -> Option<SocketAddr> {
        self.remote
    }
}

/// Drains the responder channel onto the socket; ends on shutdown or a
/// write error.
pub(crate) async fn writer_task(
    mut write_half: OwnedWriteHalf,
    mut receiver: mpsc::UnboundedReceiver<WriterCommand>,
) {
    while let Some(command) = receiver.recv().await {
        match command {
            WriterCommand::Frame(frame) => {
                if let Err(e) = write_half.write_all(&frame[..]).await {
                    error!("connection write failed: {e}");
                    break;
                }
            }
            WriterCommand::Shutdown => break,
        }
    }
    let _ = write_half.shutdown().await;
}
