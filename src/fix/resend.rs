//! The gap-fill engine.
//!
//! Two directions live here. Answering a peer's ResendRequest replays
//! persisted application messages as PossDup copies and covers admin
//! messages (and anything the application withholds) with administrative
//! SequenceReset-GapFill frames. Detecting that the peer is ahead of us
//! queues the early message and asks for the missing range, optionally in
//! chunks.

use crate::fix::decode::parse_frame_prefix;
use crate::fix::encode::{TIME_FORMAT_MILLIS, TIME_FORMAT_SECONDS};
use crate::fix::fields::{is_session_message, MsgType, SessionRejectReason, Tags};
use crate::fix::mem::MsgBuf;
use crate::fix::message::InboundMessage;
use crate::fix::session::{Session, VerifyError};
use crate::fix::state::ResendRange;
use crate::fix::SessionError;
use crate::MessageBuilder;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{error, info, warn};

impl Session {
    pub(crate) fn on_resend_request(&self, msg: &InboundMessage) -> Result<(), VerifyError> {
        self.verify(msg, false, false)?;

        let Some(begin) = msg.begin_seq_no else {
            return Err(VerifyError::Reject {
                reason: SessionRejectReason::REQUIRED_TAG_MISSING,
                tag: Some(Tags::BeginSeqNo.into()),
                logout: false,
            });
        };
        let Some(end) = msg.end_seq_no else {
            return Err(VerifyError::Reject {
                reason: SessionRejectReason::REQUIRED_TAG_MISSING,
                tag: Some(Tags::EndSeqNo.into()),
                logout: false,
            });
        };
        info!(
            session_id = %self.session_id(),
            "received resend request for {begin}..{end}"
        );
        self.answer_resend_request(begin, end);

        // The request consumed its own sequence number, unless it arrived
        // out of order itself.
        let mut state = self.lock_state();
        if msg.msg_seq_num == state.next_target_msg_seq_num() {
            if let Err(e) = state.incr_next_target_msg_seq_num() {
                error!(session_id = %self.session_id(), "store failure: {e:#}");
            }
        }
        Ok(())
    }

    /// Replay `[begin, end]` to the peer. `end` may be the dialect's
    /// open-range sentinel, meaning "everything you have".
    pub(crate) fn answer_resend_request(&self, begin: u32, end: u32) {
        let next_sender = self.lock_state().next_sender_msg_seq_num();
        if next_sender <= 1 || begin >= next_sender {
            warn!(
                session_id = %self.session_id(),
                "nothing to resend for {begin}..{end}, next sender sequence is {next_sender}"
            );
            return;
        }
        let mut end = end;
        if end == self.version.open_range_sentinel() || end >= next_sender {
            end = next_sender - 1;
        }
        let cap = (end + 1).min(next_sender);

        if !self.settings.persist_messages {
            // Nothing stored; the whole range becomes one gap fill.
            self.generate_sequence_reset(begin, cap);
            return;
        }

        let fetched = self.lock_state().fetch_persisted(begin, end);
        let messages = match fetched {
            Ok(messages) => messages,
            Err(e) => {
                error!(session_id = %self.session_id(), "message store read failed: {e:#}");
                if self.settings.force_resend_when_corrupted_store {
                    self.synthesize_heartbeats(begin, end);
                } else {
                    self.apply_error_policy();
                }
                return;
            }
        };

        // Admin messages and messages the application withholds fold into a
        // pending gap; everything else is re-sent as a PossDup copy.
        let mut current = begin;
        let mut gap_begin: Option<u32> = None;
        for (seq, bytes) in messages {
            if gap_begin.is_none() && seq > current {
                // Hole in the store.
                gap_begin = Some(current);
            }
            let is_admin = parse_frame_prefix(&bytes)
                .map(|p| is_session_message(p.msg_type))
                .unwrap_or(true);
            let withheld = !is_admin
                && self
                    .application
                    .to_app_resend(&MsgBuf(bytes.clone()), self.session_id())
                    .is_err();
            if is_admin || withheld {
                gap_begin.get_or_insert(seq);
                current = seq + 1;
                continue;
            }
            if let Some(gap) = gap_begin.take() {
                self.generate_sequence_reset(gap, seq);
            }
            match Transformer::try_from(bytes) {
                Ok(transformer) => {
                    let replay = transformer.build(Utc::now(), self.timestamp_millis());
                    info!(session_id = %self.session_id(), "resending message {seq}");
                    self.transmit_raw(&replay);
                }
                Err(e) => {
                    error!(
                        session_id = %self.session_id(),
                        "stored message {seq} cannot be replayed: {e}"
                    );
                    gap_begin = Some(seq);
                }
            }
            current = seq + 1;
        }

        if let Some(gap) = gap_begin {
            self.generate_sequence_reset(gap, cap);
        } else if current <= end {
            // Store ran out before the requested end.
            self.generate_sequence_reset(current, cap);
        }
    }

    /// MsgType=4 with GapFillFlag=Y and PossDupFlag=Y, reusing `begin` as
    /// its sequence number and telling the peer to expect `new_seq` next.
    /// Never advances the sender counter.
    pub(crate) fn generate_sequence_reset(&self, begin: u32, new_seq: u32) {
        let builder = MessageBuilder::new(
            self.session_id().begin_string(),
            MsgType::SEQUENCE_RESET.into(),
        )
        .push_int(Tags::NewSeqNo, new_seq)
        .push_char(Tags::GapFillFlag, 'Y');
        let frame = self.render_with_seq(&builder, begin);
        let replay = match Transformer::try_from(frame.0) {
            Ok(t) => t.build(Utc::now(), self.timestamp_millis()),
            Err(e) => {
                error!(session_id = %self.session_id(), "gap fill build failed: {e}");
                return;
            }
        };
        info!(
            session_id = %self.session_id(),
            "sending SequenceReset-GapFill {begin} -> {new_seq}"
        );
        self.transmit_raw(&replay);
    }

    /// Best effort when the store cannot be read: cover the range with
    /// administrative heartbeats so the peer's gap closes.
    fn synthesize_heartbeats(&self, begin: u32, end: u32) {
        warn!(
            session_id = %self.session_id(),
            "store is corrupted, synthesizing heartbeats for {begin}..{end}"
        );
        for seq in begin..=end {
            let builder = MessageBuilder::new(
                self.session_id().begin_string(),
                MsgType::HEARTBEAT.into(),
            );
            let frame = self.render_with_seq(&builder, seq);
            if let Ok(t) = Transformer::try_from(frame.0) {
                self.transmit_raw(&t.build(Utc::now(), self.timestamp_millis()));
            }
        }
    }

    /// A message arrived from the future: queue it and ask for the gap.
    pub(crate) fn do_target_too_high(&self, msg: &InboundMessage) {
        let policy_applies = {
            let mut state = self.lock_state();
            state.enqueue(msg.msg_seq_num, Arc::clone(&msg.raw));
            !msg.is_admin()
                && state.is_logged_on()
                && (self.settings.reset_on_error || self.settings.disconnect_on_error)
        };
        if policy_applies {
            self.apply_error_policy();
            return;
        }
        self.request_resend_for_gap(msg.msg_seq_num);
    }

    /// Ask for everything from the expected target number up to (but not
    /// including) `received_seq`, unless an overlapping request is already
    /// outstanding.
    pub(crate) fn request_resend_for_gap(&self, received_seq: u32) {
        let begin = {
            let state = self.lock_state();
            if let Some(range) = state.resend_range {
                if !self.settings.send_redundant_resend_requests && received_seq >= range.begin {
                    // Already asked for this stretch.
                    return;
                }
            }
            state.next_target_msg_seq_num()
        };
        self.request_resend_range(begin, received_seq - 1);
    }

    /// Emit one ResendRequest covering `[begin, end]`, honoring the chunk
    /// size and the dialect's open-range convention, and record the pending
    /// range.
    pub(crate) fn request_resend_range(&self, begin: u32, end: u32) {
        let chunk = self.settings.resend_request_chunk_size;
        let chunked = chunk > 0 && begin + chunk - 1 < end;
        let (request_end, chunk_end) = if chunked {
            (begin + chunk - 1, begin + chunk - 1)
        } else {
            (end, 0)
        };
        let wire_end = if chunked || self.settings.closed_resend_interval {
            request_end
        } else {
            self.version.open_range_sentinel()
        };
        info!(
            session_id = %self.session_id(),
            "sending resend request for {begin}..{request_end}"
        );
        let builder = MessageBuilder::new(
            self.session_id().begin_string(),
            MsgType::RESEND_REQUEST.into(),
        )
        .push_int(Tags::BeginSeqNo, begin)
        .push_int(Tags::EndSeqNo, wire_end);
        self.send_raw(builder, 0);
        self.lock_state().resend_range = Some(ResendRange {
            begin,
            end,
            chunk_end,
        });
    }
}

const POSS_DUP_FIELD: &[u8] = b"43=Y\x01";
const ORIG_SENDING_TIME_TAG: &[u8] = b"122=";

/// Rewrites a stored frame into its retransmission form: PossDupFlag=Y
/// inserted after MsgType, SendingTime restamped, and the original
/// SendingTime preserved as OrigSendingTime. BodyLength and CheckSum are
/// recomputed from the rebuilt frame.
pub(super) struct Transformer {
    msg: Vec<u8>,
    len_start: usize,
    len_end: usize,
    fixed_fields_end: usize,
    sending_time_start: usize,
    sending_time_end: usize,
    pub msg_type: char,
}

impl TryFrom<Vec<u8>> for Transformer {
    type Error = SessionError;

    fn try_from(msg: Vec<u8>) -> Result<Transformer, SessionError> {
        let prefix = parse_frame_prefix(&msg)?;
        let (len_start, len_end, fixed_fields_end, msg_type) = (
            prefix.len_start,
            prefix.len_end,
            prefix.fixed_fields_end,
            prefix.msg_type,
        );
        let (sending_time_start, sending_time_end) =
            sending_time_bounds(&msg).ok_or_else(|| SessionError::ResendFailed {
                text: String::from("stored message has no SendingTime"),
            })?;
        Ok(Transformer {
            msg,
            len_start,
            len_end,
            fixed_fields_end,
            sending_time_start,
            sending_time_end,
            msg_type,
        })
    }
}

impl Transformer {
    fn original_sending_time(&self) -> &[u8] {
        &self.msg[self.sending_time_start..self.sending_time_end]
    }

    pub(super) fn build(&self, sending_time: DateTime<Utc>, millis: bool) -> MsgBuf {
        let format = if millis {
            TIME_FORMAT_MILLIS
        } else {
            TIME_FORMAT_SECONDS
        };
        let new_sending_time = format!("{}", sending_time.format(format));
        let trailer_start = self.msg.len() - 7;

        let mut counted = Vec::with_capacity(self.msg.len() + 64);
        // 35=X| then the duplicate flag
        counted.extend_from_slice(&self.msg[self.len_end + 1..self.fixed_fields_end]);
        counted.extend_from_slice(POSS_DUP_FIELD);
        // everything up to the old SendingTime value, then the new stamp
        counted.extend_from_slice(&self.msg[self.fixed_fields_end..self.sending_time_start]);
        counted.extend_from_slice(new_sending_time.as_bytes());
        counted.push(b'\x01');
        counted.extend_from_slice(ORIG_SENDING_TIME_TAG);
        counted.extend_from_slice(self.original_sending_time());
        counted.push(b'\x01');
        counted.extend_from_slice(&self.msg[self.sending_time_end + 1..trailer_start]);

        let mut itoa_buf = itoa::Buffer::new();
        let mut frame = Vec::with_capacity(counted.len() + 32);
        frame.extend_from_slice(&self.msg[..self.len_start]);
        frame.extend_from_slice(itoa_buf.format(counted.len()).as_bytes());
        frame.push(b'\x01');
        frame.extend_from_slice(&counted);
        let trailer = crate::fix::checksum::render_trailer(&frame);
        frame.extend_from_slice(&trailer);
        frame.into()
    }
}

fn sending_time_bounds(msg: &[u8]) -> Option<(usize, usize)> {
    let mut start = None;
    for (i, window) in msg.windows(4).enumerate() {
        if window == b"\x0152=" {
            start = Some(i + 4);
            break;
        }
    }
    let start = start?;
    let end = start + msg[start..].iter().position(|b| *b == b'\x01')?;
    Some((start, end))
}

#[cfg(test)]
mod session_test {
    use crate::fix::application::Application;
    use crate::fix::session::{Responder, Session};
    use crate::fix::store::{MemoryStore, MessageStore};
    use crate::fix::testutil::{logon, make_session, peer_msg, test_settings, TestSession};
    use crate::{EngineType, MessageBuilder};
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    fn logged_on_acceptor() -> TestSession {
        let t = make_session(test_settings(EngineType::Acceptor).build().unwrap());
        logon(&t);
        t
    }

    fn send_app(t: &TestSession, text: &str) {
        assert!(t
            .session
            .send(MessageBuilder::new("FIX.4.2", 'D').push(11u32, text.as_bytes())));
    }

    #[test]
    fn test_peer_resend_of_persisted_range() {
        let t = logged_on_acceptor();
        send_app(&t, "ORD2");
        send_app(&t, "ORD3");
        send_app(&t, "ORD4");
        t.responder.clear();

        t.session.receive(peer_msg('2', 2, "7=2|16=0|"));

        let frames = t.responder.frames();
        assert_eq!(frames.len(), 3, "{frames:?}");
        for (frame, seq) in frames.iter().zip([2u32, 3, 4]) {
            assert!(frame.contains(&format!("|34={seq}|")), "{frame}");
            assert!(frame.contains("|43=Y|"));
            assert!(frame.contains("|122="));
            assert!(!frame.contains("|35=4|"));
        }
        // the request itself consumed a sequence number
        assert_eq!(t.session.expected_target_num(), 3);
    }

    #[test]
    fn test_admin_messages_fold_into_gap_fill() {
        let t = logged_on_acceptor();
        send_app(&t, "ORD2");
        t.session.send_heartbeat(None); // seq 3, admin
        send_app(&t, "ORD4");
        t.responder.clear();

        t.session.receive(peer_msg('2', 2, "7=2|16=0|"));

        let frames = t.responder.frames();
        assert_eq!(frames.len(), 3, "{frames:?}");
        assert!(frames[0].contains("|34=2|") && frames[0].contains("|35=D|"));
        // heartbeat replaced by a gap fill pointing at the next real message
        assert!(frames[1].contains("|35=4|"));
        assert!(frames[1].contains("|34=3|"));
        assert!(frames[1].contains("|123=Y|"));
        assert!(frames[1].contains("|36=4|"));
        assert!(frames[1].contains("|43=Y|"));
        assert!(frames[2].contains("|34=4|") && frames[2].contains("|35=D|"));
    }

    #[test]
    fn test_do_not_send_becomes_gap_fill() {
        let t = logged_on_acceptor();
        send_app(&t, "ORD2");
        send_app(&t, "ORD3");
        t.application.withhold_resends.store(true, Ordering::Relaxed);
        t.responder.clear();

        t.session.receive(peer_msg('2', 2, "7=2|16=0|"));

        let frames = t.responder.frames();
        assert_eq!(frames.len(), 1, "{frames:?}");
        assert!(frames[0].contains("|35=4|"));
        assert!(frames[0].contains("|34=2|"));
        // caps at endSeq+1 == nextSender
        assert!(frames[0].contains("|36=4|"));
    }

    #[test]
    fn test_resend_without_persistence_is_one_gap_fill() {
        let t = make_session(
            test_settings(EngineType::Acceptor)
                .with_persist_messages(false)
                .build()
                .unwrap(),
        );
        logon(&t);
        send_app(&t, "ORD2");
        send_app(&t, "ORD3");
        t.responder.clear();

        t.session.receive(peer_msg('2', 2, "7=1|16=0|"));

        let frames = t.responder.frames();
        assert_eq!(frames.len(), 1, "{frames:?}");
        assert!(frames[0].contains("|35=4|"));
        assert!(frames[0].contains("|34=1|"));
        assert!(frames[0].contains("|36=4|"));
    }

    #[test]
    fn test_closed_range_request_honored() {
        let t = logged_on_acceptor();
        send_app(&t, "ORD2");
        send_app(&t, "ORD3");
        t.responder.clear();

        // closed range asking only for 2..2
        t.session.receive(peer_msg('2', 2, "7=2|16=2|"));

        let frames = t.responder.frames();
        assert_eq!(frames.len(), 1, "{frames:?}");
        assert!(frames[0].contains("|34=2|"));
    }

    #[test]
    fn test_chunked_resend_requests() {
        let t = make_session(
            test_settings(EngineType::Acceptor)
                .with_resend_request_chunk_size(2)
                .build()
                .unwrap(),
        );
        logon(&t);

        t.session.receive(peer_msg('D', 10, "11=ORD10|"));
        let frames = t.responder.frames();
        assert_eq!(frames.len(), 1);
        assert!(frames[0].contains("|35=2|"));
        assert!(frames[0].contains("|7=2|16=3|"));
        t.responder.clear();

        // replayed 2 does not finish the chunk...
        t.session.receive(peer_msg('D', 2, "11=ORD2|"));
        assert!(t.responder.frames().is_empty());

        // ...3 does, and the next chunk goes out
        t.session.receive(peer_msg('D', 3, "11=ORD3|"));
        let frames = t.responder.frames();
        assert_eq!(frames.len(), 1, "{frames:?}");
        assert!(frames[0].contains("|35=2|"));
        assert!(frames[0].contains("|7=4|16=5|"));
    }

    #[test]
    fn test_redundant_resend_requests_suppressed() {
        let t = logged_on_acceptor();
        t.session.receive(peer_msg('D', 8, "11=ORD8|"));
        assert_eq!(t.responder.frames().len(), 1);
        t.responder.clear();

        t.session.receive(peer_msg('D', 9, "11=ORD9|"));
        assert!(t.responder.frames().is_empty());
        assert_eq!(t.session.lock_state().queued_len(), 2);
    }

    #[test]
    fn test_redundant_resend_requests_when_enabled() {
        let t = make_session(
            test_settings(EngineType::Acceptor)
                .with_send_redundant_resend_requests(true)
                .build()
                .unwrap(),
        );
        logon(&t);
        t.session.receive(peer_msg('D', 8, "11=ORD8|"));
        t.responder.clear();
        t.session.receive(peer_msg('D', 9, "11=ORD9|"));
        assert_eq!(t.responder.frames().len(), 1);
    }

    #[test]
    fn test_next_expected_seq_num_triggers_replay() {
        let t = make_session(
            test_settings(EngineType::Acceptor)
                .with_enable_next_expected_msg_seq_num(true)
                .build()
                .unwrap(),
        );
        // two messages queued for the peer before it ever connected
        send_app(&t, "EARLY1");
        send_app(&t, "EARLY2");

        t.session
            .receive(peer_msg('A', 1, "98=0|108=30|789=1|"));

        let frames = t.responder.frames();
        // logon response first, then the replayed backlog
        assert!(frames[0].contains("|35=A|"));
        assert!(frames[0].contains("|789="));
        let replays: Vec<&String> = frames
            .iter()
            .filter(|f| f.contains("|35=D|") && f.contains("|43=Y|"))
            .collect();
        assert_eq!(replays.len(), 2, "{frames:?}");
        assert!(replays[0].contains("|34=1|"));
        assert!(replays[1].contains("|34=2|"));
        // the logon response's own number is covered by a gap fill
        assert!(frames.last().unwrap().contains("|35=4|"));
    }

    #[test]
    fn test_corrupted_store_synthesizes_heartbeats() {
        struct CorruptStore(MemoryStore);
        impl MessageStore for CorruptStore {
            fn next_sender_msg_seq_num(&self) -> u32 {
                self.0.next_sender_msg_seq_num()
            }
            fn next_target_msg_seq_num(&self) -> u32 {
                self.0.next_target_msg_seq_num()
            }
            fn set_next_sender_msg_seq_num(&mut self, n: u32) -> anyhow::Result<()> {
                self.0.set_next_sender_msg_seq_num(n)
            }
            fn set_next_target_msg_seq_num(&mut self, n: u32) -> anyhow::Result<()> {
                self.0.set_next_target_msg_seq_num(n)
            }
            fn incr_next_sender_msg_seq_num(&mut self) -> anyhow::Result<()> {
                self.0.incr_next_sender_msg_seq_num()
            }
            fn incr_next_target_msg_seq_num(&mut self) -> anyhow::Result<()> {
                self.0.incr_next_target_msg_seq_num()
            }
            fn get(&self, _begin: u32, _end: u32) -> anyhow::Result<Vec<(u32, Vec<u8>)>> {
                anyhow::bail!("corrupted page")
            }
            fn set(&mut self, n: u32, msg: &[u8]) -> anyhow::Result<()> {
                self.0.set(n, msg)
            }
            fn refresh(&mut self) -> anyhow::Result<()> {
                self.0.refresh()
            }
            fn reset(&mut self) -> anyhow::Result<()> {
                self.0.reset()
            }
            fn creation_time(&self) -> chrono::DateTime<chrono::Utc> {
                self.0.creation_time()
            }
        }

        let settings = test_settings(EngineType::Acceptor)
            .with_force_resend_when_corrupted_store(true)
            .build()
            .unwrap();
        let responder = crate::fix::testutil::MockResponder::new();
        let application = crate::fix::testutil::RecordingApplication::new();
        let session = Session::new(
            settings,
            Box::new(CorruptStore(MemoryStore::new())),
            Arc::clone(&application) as Arc<dyn Application>,
        )
        .unwrap();
        session.set_responder(Arc::clone(&responder) as Arc<dyn Responder>);
        session.receive(peer_msg('A', 1, "98=0|108=30|"));
        assert!(session.is_logged_on());
        session.send(MessageBuilder::new("FIX.4.2", 'D').push(11u32, b"X"));
        session.send(MessageBuilder::new("FIX.4.2", 'D').push(11u32, b"Y"));
        responder.clear();

        session.receive(peer_msg('2', 2, "7=2|16=0|"));

        let frames = responder.frames();
        assert_eq!(frames.len(), 2, "{frames:?}");
        for (frame, seq) in frames.iter().zip([2u32, 3]) {
            assert!(frame.contains("|35=0|"));
            assert!(frame.contains(&format!("|34={seq}|")));
            assert!(frame.contains("|43=Y|"));
        }
    }
}
