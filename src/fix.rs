//! Protocol internals: the session state machine and everything it leans on.
//!
//! The submodules follow the data path: [`stream`](self) frames bytes,
//! [`decode`] scans fields, [`session`] runs the state machine, [`encode`]
//! renders replies, [`store`] keeps sequence numbers durable.

use crate::fix::fields::SessionRejectReason;
use crate::fix::session::Session;
use crate::Request;
use anyhow::Result;
use std::io;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

pub mod application;
pub mod decode;
pub mod encode;
pub mod fields;
pub mod mem;
pub mod registry;
pub mod schedule;
pub mod session;
pub mod session_id;
pub mod store;

#[cfg(feature = "sqlite")]
pub mod sqlite_store;

mod checksum;
mod liveness;
mod message;
mod resend;
mod state;
mod stream;

/// Session-layer failures. Admin handlers convert these into outbound
/// protocol messages; only transport-level kinds escape to the engine loop.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("An I/O error occurred: {0}")]
    IoError(#[from] io::Error),
    #[error("A garbled message was received: {text}")]
    GarbledMessage {
        text: String,
        garbled_msg_type: GarbledMessageType,
    },
    #[error("A message was received without a sequence number")]
    MissingMsgSeqNum { text: String },
    #[error("A message was rejected: {text}")]
    MessageRejected {
        text: String,
        reject_reason: Option<SessionRejectReason>,
        msg_seq_num: u32,
        ref_tag_id: Option<u32>,
        ref_msg_type: Option<char>,
    },
    #[error("Unsupported protocol version: received {received}, expected {expected}")]
    UnsupportedVersion { received: String, expected: String },
    #[error("A stored message could not be replayed: {text}")]
    ResendFailed { text: String },
    #[error("TCP peer closed their half of the connection")]
    TcpDisconnection,
}

#[derive(Debug)]
pub enum GarbledMessageType {
    BeginStringIssue,
    BodyLengthIssue,
    MsgTypeIssue,
    ChecksumIssue,
    Other,
}

impl SessionError {
    pub(crate) fn new_message_rejected(
        reason: Option<SessionRejectReason>,
        seq_num: u32,
        tag_id: Option<u32>,
        msg_type: Option<char>,
    ) -> SessionError {
        SessionError::MessageRejected {
            text: reason.as_ref().map_or(String::new(), |r| r.into()),
            reject_reason: reason,
            msg_seq_num: seq_num,
            ref_tag_id: tag_id,
            ref_msg_type: msg_type,
        }
    }

    pub(crate) fn new_garbled_message(text: String, t: GarbledMessageType) -> SessionError {
        SessionError::GarbledMessage {
            text,
            garbled_msg_type: t,
        }
    }
}

fn validate_checksum(frame: &mem::MsgBuf) -> Result<(), SessionError> {
    if !checksum::checksum_is_valid(&frame[..]) {
        return Err(SessionError::new_garbled_message(
            String::from("Checksum invalid"),
            GarbledMessageType::ChecksumIssue,
        ));
    }
    Ok(())
}

/// One connection's worth of engine: reads frames into the session, drives
/// the liveness tick, and serves requests coming from the
/// [`SessionHandle`](crate::SessionHandle).
pub(crate) async fn run_session(
    tcp_stream: TcpStream,
    session: Arc<Session>,
    mut request_receiver: mpsc::UnboundedReceiver<Request>,
) -> Result<()> {
    let remote = tcp_stream.peer_addr().ok();
    let (read_half, write_half) = tcp_stream.into_split();
    let (responder, writer_receiver) = stream::TcpResponder::new(remote);
    tokio::spawn(stream::writer_task(write_half, writer_receiver));
    session.set_responder(Arc::new(responder));

    let mut reader = read_half;
    let mut header_buf = stream::HeaderBuf::new();
    let mut tick = tokio::time::interval(tokio::time::Duration::from_secs(1));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let mut pending_logon: Option<oneshot::Sender<bool>> = None;
    let mut pending_logout: Option<oneshot::Sender<bool>> = None;
    let mut requests_open = true;

    let result = loop {
        if !session.has_responder() {
            // The session disconnected itself (logout completed, fatal
            // protocol fault, timeout...).
            break Ok(());
        }
        if session.is_logged_on() {
            if let Some(resp_sender) = pending_logon.take() {
                let _ = resp_sender.send(true);
            }
        }

        tokio::select! {
            biased;

            maybe_req = request_receiver.recv(), if requests_open => {
                match maybe_req {
                    Some(req) => handle_request(&session, req, &mut pending_logon, &mut pending_logout),
                    None => requests_open = false,
                }
            }
            read_result = stream::read_header(&mut reader, &mut header_buf) => {
                match read_result {
                    Ok(()) => match stream::read_message(&mut reader, &mut header_buf).await {
                        Ok(frame) => {
                            if session.settings.validate_incoming_message {
                                if let Err(e) = validate_checksum(&frame) {
                                    warn!(session_id = %session.session_id(), "discarding frame: {e}");
                                    continue;
                                }
                            }
                            session.receive(Arc::new(frame));
                        }
                        Err(SessionError::IoError(e)) => {
                            session.disconnect();
                            break Err(e.into());
                        }
                        Err(SessionError::TcpDisconnection) => {
                            info!(session_id = %session.session_id(), "peer closed connection");
                            session.disconnect();
                            break Ok(());
                        }
                        Err(e) => {
                            warn!(session_id = %session.session_id(), "discarding garbled inbound data: {e}");
                        }
                    },
                    Err(SessionError::TcpDisconnection) => {
                        info!(session_id = %session.session_id(), "peer closed connection");
                        session.disconnect();
                        break Ok(());
                    }
                    Err(SessionError::IoError(e)) => {
                        session.disconnect();
                        break Err(e.into());
                    }
                    Err(e) => {
                        session.disconnect();
                        break Err(anyhow::Error::new(e));
                    }
                }
            }
            _ = tick.tick() => {
                session.next();
            }
        }
    };

    if let Some(resp_sender) = pending_logon.take() {
        let _ = resp_sender.send(false);
    }
    if let Some(resp_sender) = pending_logout.take() {
        let _ = resp_sender.send(result.is_ok());
    }
    request_receiver.close();
    result
}

fn handle_request(
    session: &Arc<Session>,
    req: Request,
    pending_logon: &mut Option<oneshot::Sender<bool>>,
    pending_logout: &mut Option<oneshot::Sender<bool>>,
) {
    match req {
        Request::Logon { resp_sender } => {
            session.logon();
            if session.is_logged_on() {
                let _ = resp_sender.send(true);
            } else {
                *pending_logon = Some(resp_sender);
            }
        }
        Request::SendMessage {
            resp_sender,
            builder,
        } => {
            let _ = resp_sender.send(session.send(builder));
        }
        Request::Logout { resp_sender } => {
            session.logout(None);
            *pending_logout = Some(resp_sender);
        }
    }
}

#[cfg(test)]
pub(crate) mod testutil;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_validate_checksum() {
        let mut frame = b"8=FIX.4.2\x019=5\x0135=0\x01".to_vec();
        let trailer = checksum::render_trailer(&frame);
        frame.extend_from_slice(&trailer);
        assert!(validate_checksum(&mem::MsgBuf(frame.clone())).is_ok());
        frame[0] = b'9';
        assert!(matches!(
            validate_checksum(&mem::MsgBuf(frame)),
            Err(SessionError::GarbledMessage {
                garbled_msg_type: GarbledMessageType::ChecksumIssue,
                ..
            })
        ));
    }

    #[test]
    fn test_error_display() {
        let err = SessionError::UnsupportedVersion {
            received: String::from("FIX.9.9"),
            expected: String::from("FIX.4.2"),
        };
        assert_eq!(
            err.to_string(),
            "Unsupported protocol version: received FIX.9.9, expected FIX.4.2"
        );
    }
}
