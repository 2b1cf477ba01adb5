//! The per-counterparty session state machine.
//!
//! A [`Session`] outlives any single network connection: the transport is
//! attached and detached through the [`Responder`] hook while sequence
//! numbers, flags and the inbound queue persist. All mutable state sits in
//! one [`SessionState`] behind one mutex; inbound dispatch, the timer tick
//! and user sends may arrive on different threads.
//!
//! Inbound flow: raw frame -> [`InboundMessage`] -> per-MsgType handler ->
//! `verify` -> state update -> application callback -> optional reply.
//! Handlers never propagate errors upward; every protocol fault is converted
//! into an outbound Reject or Logout and, where required, a disconnect.

use crate::fix::application::{Application, MessageRejectError};
use crate::fix::encode::HeaderStamp;
use crate::fix::fields::{FixVersion, MsgType, SessionRejectReason, Tags};
use crate::fix::mem::MsgBuf;
use crate::fix::message::InboundMessage;
use crate::fix::session_id::SessionId;
use crate::fix::state::SessionState;
use crate::fix::store::MessageStore;
use crate::fix::SessionError;
use crate::{MessageBuilder, SessionSettings};
use chrono::Utc;
use lazy_static::lazy_static;
use regex::Regex;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// The transport half a session talks through. Implementations must be
/// cheap to call; `send` means "queued for network I/O", not "delivered".
pub trait Responder: Send + Sync {
    fn send(&self, msg: &MsgBuf) -> bool;
    fn disconnect(&self);
    fn remote_address(&self) -> Option<SocketAddr>;
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum VerifyError {
    #[error("message already received")]
    Duplicate,
    #[error("MsgSeqNum {msg_seq_num} higher than expected {expected}")]
    TargetTooHigh { msg_seq_num: u32, expected: u32 },
    #[error("reject due to {reason:?} (tag={tag:?}, logout={logout})")]
    Reject {
        reason: SessionRejectReason,
        tag: Option<u32>,
        logout: bool,
    },
    #[error("business reject: {text}")]
    BusinessReject { text: String },
    #[error("logout ({text:?}, disconnect={disconnect})")]
    Logout {
        text: Option<String>,
        disconnect: bool,
    },
    #[error("disconnect: {0}")]
    Disconnect(String),
}

impl VerifyError {
    fn invalid_logon_state(msg_type: char) -> VerifyError {
        VerifyError::Disconnect(format!("logon state is not valid for message type {msg_type}"))
    }

    fn invalid_time() -> VerifyError {
        VerifyError::Reject {
            reason: SessionRejectReason::SENDINGTIME_ACCURACY_PROBLEM,
            tag: Some(Tags::SendingTime.into()),
            logout: true,
        }
    }

    fn invalid_comp_id() -> VerifyError {
        VerifyError::Reject {
            reason: SessionRejectReason::COMPID_PROBLEM,
            tag: None,
            logout: true,
        }
    }

    fn missing_orig_time() -> VerifyError {
        VerifyError::Reject {
            reason: SessionRejectReason::REQUIRED_TAG_MISSING,
            tag: Some(Tags::OrigSendingTime.into()),
            logout: false,
        }
    }

    fn invalid_orig_time() -> VerifyError {
        VerifyError::Reject {
            reason: SessionRejectReason::SENDINGTIME_ACCURACY_PROBLEM,
            tag: Some(Tags::OrigSendingTime.into()),
            logout: true,
        }
    }

    fn seq_num_too_low(msg_seq_num: u32, expected: u32) -> VerifyError {
        VerifyError::Logout {
            text: Some(format!(
                "MsgSeqNum too low, expecting {expected} but received {msg_seq_num}"
            )),
            disconnect: true,
        }
    }
}

lazy_static! {
    // Best effort: peers phrase this differently, digits after "expecting"
    // are the common denominator.
    static ref EXPECTED_SEQ_NUM: Regex =
        Regex::new(r"[Ee]xpect(?:ing|ed)\D{0,24}(\d+)").expect("regex");
}

/// Scans free-form Logout text for the sequence number the peer claims to
/// expect. Heuristic only; used for diagnostics, never to move counters.
pub(crate) fn extract_expected_sequence_number(text: &str) -> Option<u32> {
    EXPECTED_SEQ_NUM
        .captures(text)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

pub struct Session {
    pub(crate) settings: SessionSettings,
    pub(crate) version: FixVersion,
    stamp: HeaderStamp,
    pub(crate) state: Mutex<SessionState>,
    responder: Mutex<Option<Arc<dyn Responder>>>,
    pub(crate) application: Arc<dyn Application>,
}

impl Session {
    pub fn new(
        settings: SessionSettings,
        store: Box<dyn MessageStore>,
        application: Arc<dyn Application>,
    ) -> Result<Arc<Session>, SessionError> {
        let version = settings
            .session_id
            .fix_version()
            .map_err(|received| SessionError::UnsupportedVersion {
                received,
                expected: String::from("FIX.4.0 through FIXT.1.1"),
            })?;
        let stamp = HeaderStamp::from_session_id(&settings.session_id);
        let state = SessionState::new(
            store,
            settings.is_initiator(),
            settings.heart_bt_int,
            settings.test_request_delay_multiplier,
            settings.logon_timeout,
            settings.logout_timeout,
        );
        Ok(Arc::new(Session {
            version,
            stamp,
            state: Mutex::new(state),
            responder: Mutex::new(None),
            application,
            settings,
        }))
    }

    pub fn session_id(&self) -> &SessionId {
        &self.settings.session_id
    }

    pub fn is_initiator(&self) -> bool {
        self.settings.is_initiator()
    }

    pub fn is_logged_on(&self) -> bool {
        self.lock_state().is_logged_on()
    }

    pub fn is_enabled(&self) -> bool {
        self.lock_state().enabled
    }

    /// Enable the session: an initiator will generate a Logon on the next
    /// timer tick.
    pub fn logon(&self) {
        let mut state = self.lock_state();
        state.enabled = true;
        state.logout_reason = None;
    }

    /// Request a graceful logout; the reason text rides on the Logout.
    pub fn logout(&self, reason: Option<String>) {
        let mut state = self.lock_state();
        state.enabled = false;
        state.logout_reason = reason;
    }

    pub fn expected_sender_num(&self) -> u32 {
        self.lock_state().next_sender_msg_seq_num()
    }

    pub fn expected_target_num(&self) -> u32 {
        self.lock_state().next_target_msg_seq_num()
    }

    /// Force the outgoing counter; operators use this to recover from a
    /// counterparty mismatch.
    pub fn set_next_sender_msg_seq_num(&self, seq_num: u32) {
        if let Err(e) = self.lock_state().set_next_sender_msg_seq_num(seq_num) {
            error!(session_id = %self.session_id(), "store failure: {e:#}");
        }
    }

    pub fn set_next_target_msg_seq_num(&self, seq_num: u32) {
        if let Err(e) = self.lock_state().set_next_target_msg_seq_num(seq_num) {
            error!(session_id = %self.session_id(), "store failure: {e:#}");
        }
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().expect("session state poisoned")
    }

    // -- responder attachment --

    pub fn set_responder(&self, responder: Arc<dyn Responder>) {
        *self.responder.lock().expect("responder lock") = Some(responder);
    }

    pub fn drop_responder(&self) {
        self.responder.lock().expect("responder lock").take();
    }

    pub fn has_responder(&self) -> bool {
        self.responder.lock().expect("responder lock").is_some()
    }

    fn current_responder(&self) -> Option<Arc<dyn Responder>> {
        self.responder.lock().expect("responder lock").clone()
    }

    fn remote_address_allowed(&self) -> bool {
        if self.settings.allowed_remote_addresses.is_empty() {
            return true;
        }
        match self.current_responder().and_then(|r| r.remote_address()) {
            Some(addr) => self.settings.allowed_remote_addresses.contains(&addr.ip()),
            // Nothing attached to check against; tests and in-process
            // transports fall here.
            None => true,
        }
    }

    // -- outbound pipeline --

    /// Queue an application message for this session. The builder carries
    /// only body fields; the header is stamped here. Returns true when the
    /// message was handed to network I/O (queued, not delivered). A message
    /// gated while logged off still gets a sequence number and is persisted,
    /// so a peer ResendRequest can recover it.
    pub fn send(&self, builder: MessageBuilder) -> bool {
        self.send_raw(builder, 0)
    }

    pub(crate) fn send_raw(&self, mut builder: MessageBuilder, override_seq: u32) -> bool {
        let admin = crate::fix::fields::is_session_message(builder.msg_type());
        if admin {
            self.application.to_admin(&mut builder, self.session_id());
        } else if self
            .application
            .to_app(&mut builder, self.session_id())
            .is_err()
        {
            debug!("application withheld outbound message (DoNotSend)");
            return false;
        }

        let mut state = self.lock_state();
        self.send_raw_locked(&mut state, &builder, override_seq)
    }

    /// The critical section of the send pipeline: sequence assignment,
    /// header stamping, persistence and the counter increment are atomic
    /// with respect to concurrent senders.
    pub(crate) fn send_raw_locked(
        &self,
        state: &mut SessionState,
        builder: &MessageBuilder,
        override_seq: u32,
    ) -> bool {
        let fresh = override_seq == 0;
        let msg_seq_num = if fresh {
            state.next_sender_msg_seq_num()
        } else {
            override_seq
        };
        let last_processed = if self.settings.enable_last_msg_seq_num_processed {
            Some(state.next_target_msg_seq_num().saturating_sub(1))
        } else {
            None
        };
        let millis =
            self.version.supports_milliseconds() && self.settings.milliseconds_in_timestamp;
        let frame = builder.build(msg_seq_num, &self.stamp, Utc::now(), millis, last_processed);

        let sendable = match MsgType::try_from(builder.msg_type()) {
            Ok(MsgType::LOGON)
            | Ok(MsgType::LOGOUT)
            | Ok(MsgType::RESEND_REQUEST)
            | Ok(MsgType::SEQUENCE_RESET) => true,
            _ => state.is_logged_on(),
        };

        let mut queued = false;
        if sendable {
            if let Some(responder) = self.current_responder() {
                debug!(session_id = %self.session_id(), frame = ?frame, "outbound");
                queued = responder.send(&frame);
                state.last_sent_time = Instant::now();
            }
        }

        if fresh {
            if self.settings.persist_messages {
                if let Err(e) = state.persist(msg_seq_num, &frame[..]) {
                    error!(session_id = %self.session_id(), "failed to persist outbound message: {e:#}");
                    self.apply_error_policy_locked(state);
                    return false;
                }
            }
            if let Err(e) = state.incr_next_sender_msg_seq_num() {
                error!(session_id = %self.session_id(), "failed to advance sender sequence: {e:#}");
                self.apply_error_policy_locked(state);
                return false;
            }
        }
        queued
    }

    /// Hand raw bytes straight to the transport. Used for retransmissions,
    /// which reuse already-assigned sequence numbers and must not touch the
    /// store.
    pub(crate) fn transmit_raw(&self, frame: &MsgBuf) -> bool {
        if let Some(responder) = self.current_responder() {
            debug!(session_id = %self.session_id(), frame = ?frame, "outbound (replay)");
            let sent = responder.send(frame);
            self.lock_state().last_sent_time = Instant::now();
            sent
        } else {
            false
        }
    }

    /// Render a frame for a message that reuses an existing sequence number.
    pub(crate) fn render_with_seq(&self, builder: &MessageBuilder, msg_seq_num: u32) -> MsgBuf {
        let millis =
            self.version.supports_milliseconds() && self.settings.milliseconds_in_timestamp;
        builder.build(msg_seq_num, &self.stamp, Utc::now(), millis, None)
    }

    pub(crate) fn timestamp_millis(&self) -> bool {
        self.version.supports_milliseconds() && self.settings.milliseconds_in_timestamp
    }

    // -- outbound admin generation --

    fn should_send_reset(&self, state: &SessionState) -> bool {
        (self.settings.reset_on_logon
            || self.settings.reset_on_logout
            || self.settings.reset_on_disconnect)
            && state.next_sender_msg_seq_num() == 1
            && state.next_target_msg_seq_num() == 1
    }

    fn build_logon(&self, heart_bt_int: u32, reset: bool, next_expected: Option<u32>) -> MessageBuilder {
        let mut builder = MessageBuilder::new(self.session_id().begin_string(), MsgType::LOGON.into())
            .push_int(Tags::EncryptMethod, 0)
            .push_int(Tags::HeartBtInt, heart_bt_int);
        if reset {
            builder = builder.push_char(Tags::ResetSeqNumFlag, 'Y');
        }
        if let Some(n) = next_expected {
            builder = builder.push_int(Tags::NextExpectedMsgSeqNum, n);
        }
        builder
    }

    /// Initiator side: generate the opening Logon.
    pub(crate) fn generate_logon(&self) {
        if self.settings.reset_on_logon {
            self.reset();
        }
        let (heart_bt_int, reset, next_expected) = {
            let mut state = self.lock_state();
            let reset = self.should_send_reset(&state);
            if reset {
                state.reset_sent = true;
            }
            let next_expected = self
                .settings
                .enable_next_expected_msg_seq_num
                .then(|| state.next_target_msg_seq_num());
            (self.settings.heart_bt_int, reset, next_expected)
        };
        info!(session_id = %self.session_id(), "initiating logon");
        self.send_raw(self.build_logon(heart_bt_int, reset, next_expected), 0);
        let mut state = self.lock_state();
        state.logon_sent = true;
        state.logon_sent_at = Some(Instant::now());
        state.heart_bt_int = heart_bt_int;
    }

    /// Acceptor side: answer the peer's Logon, echoing its HeartBtInt and,
    /// when a reset handshake is in flight, the ResetSeqNumFlag.
    fn generate_logon_response(&self, heart_bt_int: u32) {
        let (reset, next_expected) = {
            let state = self.lock_state();
            let reset = state.reset_received || self.should_send_reset(&state);
            let next_expected = self
                .settings
                .enable_next_expected_msg_seq_num
                .then(|| state.next_target_msg_seq_num());
            (reset, next_expected)
        };
        self.send_raw(self.build_logon(heart_bt_int, reset, next_expected), 0);
        let mut state = self.lock_state();
        state.logon_sent = true;
        state.logon_sent_at = Some(Instant::now());
        if reset {
            state.reset_sent = true;
        }
    }

    pub(crate) fn send_logout(&self, text: Option<String>) {
        let text = text.or_else(|| self.lock_state().logout_reason.clone());
        let mut builder =
            MessageBuilder::new(self.session_id().begin_string(), MsgType::LOGOUT.into());
        if let Some(text) = &text {
            builder = builder.push(Tags::Text, text.as_bytes());
        }
        self.send_raw(builder, 0);
        let mut state = self.lock_state();
        state.logout_sent = true;
        state.logout_sent_at = Some(Instant::now());
    }

    pub(crate) fn send_heartbeat(&self, test_req_id: Option<&[u8]>) {
        let mut builder =
            MessageBuilder::new(self.session_id().begin_string(), MsgType::HEARTBEAT.into());
        if let Some(id) = test_req_id {
            builder = builder.push(Tags::TestReqID, id);
        }
        self.send_raw(builder, 0);
    }

    pub(crate) fn send_test_request(&self, test_req_id: &str) {
        let builder =
            MessageBuilder::new(self.session_id().begin_string(), MsgType::TEST_REQUEST.into())
                .push(Tags::TestReqID, test_req_id.as_bytes());
        self.send_raw(builder, 0);
    }

    fn send_reject(
        &self,
        msg: &InboundMessage,
        reason: SessionRejectReason,
        ref_tag_id: Option<u32>,
    ) {
        {
            let mut state = self.lock_state();
            let is_logon_or_reset = matches!(
                msg.admin_msg_type(),
                Some(MsgType::LOGON) | Some(MsgType::SEQUENCE_RESET)
            );
            if !is_logon_or_reset && msg.msg_seq_num == state.next_target_msg_seq_num() {
                if let Err(e) = state.incr_next_target_msg_seq_num() {
                    error!(session_id = %self.session_id(), "store failure: {e:#}");
                }
            }
        }
        info!(
            session_id = %self.session_id(),
            "rejecting message {}: {:?} (tag={ref_tag_id:?})", msg.msg_seq_num, reason
        );
        let text: String = (&reason).into();
        let mut builder = MessageBuilder::new(self.session_id().begin_string(), MsgType::REJECT.into())
            .push_int(Tags::RefSeqNum, msg.msg_seq_num);
        if let Some(tag) = ref_tag_id {
            builder = builder.push_int(Tags::RefTagID, tag);
        }
        builder = builder.push_char(Tags::RefMsgType, msg.msg_type);
        if self.version.supports_reject_reason() {
            let code: u32 = (&reason).into();
            builder = builder.push_int(Tags::SessionRejectReason, code);
        }
        builder = builder.push(Tags::Text, text.as_bytes());
        self.send_raw(builder, 0);
    }

    fn send_business_reject(&self, msg: &InboundMessage, text: &str) {
        let reject_code: u32 =
            (&crate::fix::fields::BusinessRejectReason::UNSUPPORTED_MESSAGE_TYPE).into();
        let builder = MessageBuilder::new(
            self.session_id().begin_string(),
            MsgType::BUSINESS_MESSAGE_REJECT.into(),
        )
        .push_int(Tags::RefSeqNum, msg.msg_seq_num)
        .push_char(Tags::RefMsgType, msg.msg_type)
        .push_int(Tags::BusinessRejectReason, reject_code)
        .push(Tags::Text, text.as_bytes());
        self.send_raw(builder, 0);
    }

    // -- inbound --

    /// Entry point for one framed inbound message.
    pub fn receive(&self, raw: Arc<MsgBuf>) {
        match InboundMessage::parse(Arc::clone(&raw), self.settings.allow_unknown_msg_fields) {
            Ok(msg) => {
                self.dispatch(&msg);
                self.drain_queue();
            }
            Err(e) => self.on_invalid_message(&raw, e),
        }
    }

    fn dispatch(&self, msg: &InboundMessage) {
        debug!(
            session_id = %self.session_id(),
            msg_type = %msg.msg_type,
            msg_seq_num = msg.msg_seq_num,
            "inbound"
        );
        {
            let mut state = self.lock_state();
            state.last_received_time = Instant::now();
            state.test_request_counter = 0;
        }

        if msg.begin_string != self.session_id().begin_string().as_bytes() {
            let received = String::from_utf8_lossy(&msg.begin_string).into_owned();
            error!(
                session_id = %self.session_id(),
                "BeginString mismatch: received {received}"
            );
            self.send_logout(Some(format!("Incorrect BeginString: {received}")));
            self.disconnect();
            return;
        }

        let result = match msg.admin_msg_type() {
            Some(MsgType::LOGON) => self.on_logon(msg),
            Some(MsgType::LOGOUT) => self.on_logout(msg),
            Some(MsgType::HEARTBEAT) => self.on_heartbeat(msg),
            Some(MsgType::TEST_REQUEST) => self.on_test_request(msg),
            Some(MsgType::RESEND_REQUEST) => self.on_resend_request(msg),
            Some(MsgType::SEQUENCE_RESET) => self.on_sequence_reset(msg),
            Some(MsgType::REJECT) => self.on_reject(msg),
            _ => self.on_app_message(msg),
        };

        if let Err(e) = result {
            self.handle_verify_error(msg, e);
        }
    }

    fn handle_verify_error(&self, msg: &InboundMessage, err: VerifyError) {
        match err {
            VerifyError::Duplicate => {
                debug!(session_id = %self.session_id(), msg_seq_num = msg.msg_seq_num, "duplicate dropped");
            }
            VerifyError::TargetTooHigh {
                msg_seq_num,
                expected,
            } => {
                warn!(
                    session_id = %self.session_id(),
                    "MsgSeqNum too high, expecting {expected} but received {msg_seq_num}"
                );
                self.do_target_too_high(msg);
            }
            VerifyError::Reject {
                reason,
                tag,
                logout,
            } => {
                self.send_reject(msg, reason, tag);
                if logout {
                    self.send_logout(None);
                }
            }
            VerifyError::BusinessReject { text } => {
                {
                    let mut state = self.lock_state();
                    if msg.msg_seq_num == state.next_target_msg_seq_num() {
                        if let Err(e) = state.incr_next_target_msg_seq_num() {
                            error!(session_id = %self.session_id(), "store failure: {e:#}");
                        }
                    }
                }
                if self.version.supports_business_reject() {
                    self.send_business_reject(msg, &text);
                } else {
                    self.send_reject(msg, SessionRejectReason::INVALID_MSGTYPE, None);
                }
            }
            VerifyError::Logout { text, disconnect } => {
                self.send_logout(text);
                if disconnect {
                    self.disconnect();
                }
            }
            VerifyError::Disconnect(reason) => {
                error!(session_id = %self.session_id(), "disconnecting: {reason}");
                self.disconnect();
            }
        }
    }

    /// A Logon that cannot be parsed ends the connection; anything else is
    /// logged, optionally rejected, and the error policy applies.
    fn on_invalid_message(&self, raw: &MsgBuf, err: SessionError) {
        warn!(session_id = %self.session_id(), "invalid inbound message: {err}");
        let was_logon = crate::fix::decode::parse_frame_prefix(&raw[..])
            .map(|p| p.msg_type == char::from(MsgType::LOGON))
            .unwrap_or(false);
        if was_logon {
            self.disconnect();
            return;
        }
        match err {
            SessionError::MissingMsgSeqNum { text } => {
                self.send_logout(Some(text));
                self.disconnect();
            }
            SessionError::MessageRejected {
                reject_reason,
                msg_seq_num,
                ref_tag_id,
                ref_msg_type,
                ..
            } if self.settings.reject_invalid_message => {
                // Not all fields survived parsing; reject with what we have.
                let text: String = reject_reason
                    .as_ref()
                    .map(|r| r.into())
                    .unwrap_or_else(|| String::from("Invalid message"));
                {
                    let mut state = self.lock_state();
                    if msg_seq_num == state.next_target_msg_seq_num() {
                        if let Err(e) = state.incr_next_target_msg_seq_num() {
                            error!(session_id = %self.session_id(), "store failure: {e:#}");
                        }
                    }
                }
                let mut builder =
                    MessageBuilder::new(self.session_id().begin_string(), MsgType::REJECT.into())
                        .push_int(Tags::RefSeqNum, msg_seq_num);
                if let Some(tag) = ref_tag_id {
                    builder = builder.push_int(Tags::RefTagID, tag);
                }
                if let Some(mt) = ref_msg_type {
                    builder = builder.push_char(Tags::RefMsgType, mt);
                }
                if let Some(reason) = reject_reason {
                    if self.version.supports_reject_reason() {
                        let code: u32 = (&reason).into();
                        builder = builder.push_int(Tags::SessionRejectReason, code);
                    }
                }
                builder = builder.push(Tags::Text, text.as_bytes());
                self.send_raw(builder, 0);
            }
            _ => self.apply_error_policy(),
        }
    }

    // -- verification --

    /// Which message types are acceptable in the current phase: Logon only
    /// before logon_received (or mid-reset), Logout only after logon_sent,
    /// SequenceReset and Reject always, everything else only once the peer's
    /// Logon is in.
    fn valid_logon_state(state: &SessionState, msg_type: char) -> bool {
        let admin = MsgType::try_from(msg_type).ok();
        match admin {
            Some(MsgType::LOGON) => {
                !state.logon_received || state.reset_sent || state.reset_received
            }
            Some(MsgType::SEQUENCE_RESET) | Some(MsgType::REJECT) => true,
            Some(MsgType::LOGOUT) => state.logon_sent,
            _ => state.logon_received,
        }
    }

    fn is_good_time(&self, msg: &InboundMessage) -> bool {
        if !self.settings.check_latency {
            return true;
        }
        let Some(sending_time) = msg.sending_time else {
            return false;
        };
        let max_latency =
            chrono::Duration::from_std(self.settings.max_latency).expect("max latency fits");
        let now = Utc::now();
        now - sending_time <= max_latency && sending_time - now <= max_latency
    }

    fn is_correct_comp_id(&self, msg: &InboundMessage) -> bool {
        if !self.settings.check_comp_id {
            return true;
        }
        let id = self.session_id();
        msg.sender_comp_id == id.target_comp_id().as_bytes()
            && msg.target_comp_id == id.sender_comp_id().as_bytes()
    }

    fn validate_poss_dup(&self, msg: &InboundMessage) -> Result<(), VerifyError> {
        if msg.admin_msg_type() == Some(MsgType::SEQUENCE_RESET) {
            return Ok(());
        }
        match (msg.orig_sending_time, msg.sending_time) {
            (Some(orig), Some(sending)) if orig > sending => Err(VerifyError::invalid_orig_time()),
            (Some(_), _) => Ok(()),
            (None, _) => {
                if self.settings.reject_invalid_message {
                    Err(VerifyError::missing_orig_time())
                } else {
                    warn!(
                        session_id = %self.session_id(),
                        "PossDupFlag=Y without OrigSendingTime on message {}", msg.msg_seq_num
                    );
                    Ok(())
                }
            }
        }
    }

    /// The central inbound gate: phase, timing, identity and sequencing
    /// checks, in that order. On success the message has also been delivered
    /// to the application.
    pub(crate) fn verify(
        &self,
        msg: &InboundMessage,
        check_too_high: bool,
        check_too_low: bool,
    ) -> Result<(), VerifyError> {
        let mut followup_chunk: Option<(u32, u32)> = None;
        {
            let mut state = self.lock_state();

            if !Self::valid_logon_state(&state, msg.msg_type) {
                return Err(VerifyError::invalid_logon_state(msg.msg_type));
            }
            if !self.is_good_time(msg) {
                warn!(session_id = %self.session_id(), "SendingTime verification failed");
                return Err(VerifyError::invalid_time());
            }
            if !self.is_correct_comp_id(msg) {
                warn!(session_id = %self.session_id(), "CompID verification failed");
                return Err(VerifyError::invalid_comp_id());
            }

            let expected = state.next_target_msg_seq_num();
            if check_too_high && msg.msg_seq_num > expected {
                return Err(VerifyError::TargetTooHigh {
                    msg_seq_num: msg.msg_seq_num,
                    expected,
                });
            }
            if check_too_low && msg.msg_seq_num < expected {
                if msg.poss_dup {
                    self.validate_poss_dup(msg)?;
                    return Err(VerifyError::Duplicate);
                }
                return Err(VerifyError::seq_num_too_low(msg.msg_seq_num, expected));
            }

            if msg.admin_msg_type() == Some(MsgType::LOGON)
                && check_too_low
                && self.settings.enable_next_expected_msg_seq_num
            {
                if let Some(next_expected) = msg.next_expected_msg_seq_num {
                    let next_sender = state.next_sender_msg_seq_num();
                    if next_expected > next_sender {
                        return Err(VerifyError::Logout {
                            text: Some(format!(
                                "NextExpectedMsgSeqNum {next_expected} is higher than next sender sequence {next_sender}"
                            )),
                            disconnect: true,
                        });
                    }
                }
            }

            if msg.poss_dup {
                self.validate_poss_dup(msg)?;
            }

            // Resend range bookkeeping: completion and chunk advancement.
            if let Some(range) = state.resend_range {
                if msg.msg_seq_num >= range.end {
                    info!(
                        session_id = %self.session_id(),
                        "resend request for {}..{} has been satisfied", range.begin, range.end
                    );
                    state.resend_range = None;
                } else if range.chunk_end > 0 && msg.msg_seq_num >= range.chunk_end {
                    let next_begin = msg.msg_seq_num + 1;
                    followup_chunk = Some((next_begin, range.end));
                }
            }
        }

        if let Some((begin, end)) = followup_chunk {
            self.request_resend_range(begin, end);
        }

        if msg.is_admin() {
            self.application
                .from_admin(&msg.raw, self.session_id())
                .map_err(|e| self.convert_reject(e))?;
        } else {
            self.application
                .from_app(&msg.raw, self.session_id())
                .map_err(|e| self.convert_reject(e))?;
        }
        Ok(())
    }

    fn convert_reject(&self, err: MessageRejectError) -> VerifyError {
        match err {
            MessageRejectError::RejectLogon { reason } => {
                let text = reason.unwrap_or_else(|| String::from("Logon rejected"));
                // Consume the Logon's sequence number before ending the
                // conversation.
                let mut state = self.lock_state();
                if let Err(e) = state.incr_next_target_msg_seq_num() {
                    error!(session_id = %self.session_id(), "store failure: {e:#}");
                }
                drop(state);
                VerifyError::Logout {
                    text: Some(text),
                    disconnect: true,
                }
            }
            MessageRejectError::UnsupportedMessageType => VerifyError::BusinessReject {
                text: String::from("Unsupported message type"),
            },
            other => {
                let (reason, tag) = other
                    .session_reject_reason()
                    .expect("non-logon rejection carries a session reason");
                VerifyError::Reject {
                    reason,
                    tag,
                    logout: false,
                }
            }
        }
    }

    // -- per-type handlers --

    fn on_logon(&self, msg: &InboundMessage) -> Result<(), VerifyError> {
        if !self
            .settings
            .schedule
            .is_session_time(msg.sending_time.unwrap_or_else(Utc::now))
        {
            return Err(VerifyError::Disconnect(String::from(
                "logon received outside of session window",
            )));
        }
        if !self.remote_address_allowed() {
            return Err(VerifyError::Disconnect(String::from(
                "logon from address outside the allowlist",
            )));
        }

        let mut pending_reset = false;
        {
            let mut state = self.lock_state();
            if !state.enabled {
                return Err(VerifyError::Disconnect(String::from(
                    "session is not enabled for logon",
                )));
            }
            if state.should_send_logon() && !state.reset_received {
                // Initiator that has not sent its Logon yet cannot be
                // receiving a response.
                return Err(VerifyError::Disconnect(String::from(
                    "received logon response before sending request",
                )));
            }
            if !state.initiator && self.settings.refresh_on_logon {
                if let Err(e) = state.refresh() {
                    error!(session_id = %self.session_id(), "store refresh failed: {e:#}");
                }
            }
            if msg.reset_seq_num_flag {
                info!(
                    session_id = %self.session_id(),
                    "logon contains ResetSeqNumFlag=Y, resetting sequence numbers to 1"
                );
                state.reset_received = true;
            } else if state.reset_sent && msg.msg_seq_num == 1 {
                info!(
                    session_id = %self.session_id(),
                    "peer logged on with MsgSeqNum=1 after our reset request, inferring ResetSeqNumFlag"
                );
                state.reset_received = true;
            }
            if state.reset_received && !state.reset_sent {
                pending_reset = true;
            }
            if !state.initiator && self.settings.reset_on_logon {
                pending_reset = true;
            }
        }
        if pending_reset {
            self.reset();
            // reset() clears every flag, but the peer's flag is still on
            // the wire and steers the rest of the handshake.
            self.lock_state().reset_received = msg.reset_seq_num_flag;
        }

        self.verify(msg, false, self.settings.validate_sequence_numbers)?;

        let acceptor_response = {
            let mut state = self.lock_state();
            state.logon_received = true;
            state.logout_sent = false;
            state.logout_received = false;
            state.logout_sent_at = None;
            if !state.initiator || (state.reset_received && !state.reset_sent) {
                let heart_bt_int = msg.heart_bt_int.unwrap_or(self.settings.heart_bt_int);
                state.heart_bt_int = heart_bt_int;
                Some(heart_bt_int)
            } else {
                None
            }
        };
        if let Some(heart_bt_int) = acceptor_response {
            info!(session_id = %self.session_id(), "received logon request, responding");
            self.generate_logon_response(heart_bt_int);
        } else {
            info!(session_id = %self.session_id(), "received logon response");
        }

        let mut too_high = false;
        {
            let mut state = self.lock_state();
            state.reset_sent = false;
            state.reset_received = false;
            let expected = state.next_target_msg_seq_num();
            if self.settings.validate_sequence_numbers
                && msg.msg_seq_num > expected
                && !self.settings.reset_on_logon
            {
                too_high = true;
            } else if let Err(e) = state.incr_next_target_msg_seq_num() {
                error!(session_id = %self.session_id(), "store failure: {e:#}");
            }
        }
        if too_high {
            warn!(
                session_id = %self.session_id(),
                "logon sequence number {} is ahead of us", msg.msg_seq_num
            );
            self.do_target_too_high(msg);
        }

        // Peer advertised what it expects next from us; replay anything it
        // is missing.
        if self.settings.enable_next_expected_msg_seq_num {
            if let Some(next_expected) = msg.next_expected_msg_seq_num {
                let next_sender = self.lock_state().next_sender_msg_seq_num();
                if next_expected < next_sender {
                    info!(
                        session_id = %self.session_id(),
                        "peer expects {next_expected}, resending through {}", next_sender - 1
                    );
                    self.answer_resend_request(next_expected, next_sender - 1);
                }
            }
        }

        if self.is_logged_on() {
            self.application.on_logon(self.session_id());
        }
        Ok(())
    }

    fn on_logout(&self, msg: &InboundMessage) -> Result<(), VerifyError> {
        self.verify(msg, false, false)?;

        let logout_sent = self.lock_state().logout_sent;
        if logout_sent {
            info!(session_id = %self.session_id(), "received logout response");
        } else {
            info!(session_id = %self.session_id(), "received logout request");
            if let Some(text) = &msg.text {
                if let Some(expected) = extract_expected_sequence_number(text) {
                    warn!(
                        session_id = %self.session_id(),
                        "peer logout text claims it expects sequence number {expected}"
                    );
                }
            }
            self.send_logout(None);
            info!(session_id = %self.session_id(), "sending logout response");
        }

        {
            let mut state = self.lock_state();
            state.logout_received = true;
            if let Err(e) = state.incr_next_target_msg_seq_num() {
                error!(session_id = %self.session_id(), "store failure: {e:#}");
            }
        }
        if self.settings.reset_on_logout {
            self.reset();
        }
        self.disconnect();
        Ok(())
    }

    fn on_heartbeat(&self, msg: &InboundMessage) -> Result<(), VerifyError> {
        self.verify(msg, true, true)?;
        let mut state = self.lock_state();
        if let Err(e) = state.incr_next_target_msg_seq_num() {
            error!(session_id = %self.session_id(), "store failure: {e:#}");
        }
        Ok(())
    }

    fn on_test_request(&self, msg: &InboundMessage) -> Result<(), VerifyError> {
        self.verify(msg, true, true)?;
        self.send_heartbeat(msg.test_req_id.as_deref());
        let mut state = self.lock_state();
        if let Err(e) = state.incr_next_target_msg_seq_num() {
            error!(session_id = %self.session_id(), "store failure: {e:#}");
        }
        Ok(())
    }

    fn on_reject(&self, msg: &InboundMessage) -> Result<(), VerifyError> {
        self.verify(msg, false, true)?;
        let mut state = self.lock_state();
        if let Err(e) = state.incr_next_target_msg_seq_num() {
            error!(session_id = %self.session_id(), "store failure: {e:#}");
        }
        Ok(())
    }

    fn on_sequence_reset(&self, msg: &InboundMessage) -> Result<(), VerifyError> {
        let gap_fill = msg.gap_fill_flag;
        self.verify(msg, gap_fill, gap_fill)?;

        let Some(new_seq_no) = msg.new_seq_no else {
            return Err(VerifyError::Reject {
                reason: SessionRejectReason::REQUIRED_TAG_MISSING,
                tag: Some(Tags::NewSeqNo.into()),
                logout: false,
            });
        };

        let mut followup_chunk: Option<(u32, u32)> = None;
        {
            let mut state = self.lock_state();
            let expected = state.next_target_msg_seq_num();
            if new_seq_no > expected {
                info!(
                    session_id = %self.session_id(),
                    "SequenceReset advancing target from {expected} to {new_seq_no}"
                );
                if let Err(e) = state.set_next_target_msg_seq_num(new_seq_no) {
                    error!(session_id = %self.session_id(), "store failure: {e:#}");
                }
                if let Some(range) = state.resend_range {
                    if new_seq_no >= range.end {
                        info!(
                            session_id = %self.session_id(),
                            "resend request for {}..{} has been satisfied", range.begin, range.end
                        );
                        state.resend_range = None;
                    } else if range.chunk_end > 0 && new_seq_no >= range.chunk_end {
                        followup_chunk = Some((new_seq_no, range.end));
                    }
                }
            } else if new_seq_no < expected {
                return Err(VerifyError::Reject {
                    reason: SessionRejectReason::VALUE_IS_INCORRECT,
                    tag: Some(Tags::NewSeqNo.into()),
                    logout: false,
                });
            }
        }
        if let Some((begin, end)) = followup_chunk {
            self.request_resend_range(begin, end);
        }
        Ok(())
    }

    fn on_app_message(&self, msg: &InboundMessage) -> Result<(), VerifyError> {
        let check = self.settings.validate_sequence_numbers;
        self.verify(msg, check, check)?;
        let mut state = self.lock_state();
        if let Err(e) = state.incr_next_target_msg_seq_num() {
            error!(session_id = %self.session_id(), "store failure: {e:#}");
        }
        Ok(())
    }

    /// Replays queued out-of-order messages once the gap in front of them
    /// has been filled.
    fn drain_queue(&self) {
        loop {
            let next = {
                let mut state = self.lock_state();
                let expected = state.next_target_msg_seq_num();
                state.dequeue(expected).map(|raw| (expected, raw))
            };
            let Some((seq, raw)) = next else { break };
            debug!(session_id = %self.session_id(), "processing queued message {seq}");
            match InboundMessage::parse(raw, self.settings.allow_unknown_msg_fields) {
                Ok(msg) => {
                    let replayed_logon = msg.admin_msg_type() == Some(MsgType::LOGON)
                        && self.lock_state().logon_received;
                    if replayed_logon {
                        // A Logon that arrived ahead of the gap was handled
                        // when it came in; only its number needs consuming.
                        let mut state = self.lock_state();
                        if let Err(e) = state.incr_next_target_msg_seq_num() {
                            error!(session_id = %self.session_id(), "store failure: {e:#}");
                        }
                        continue;
                    }
                    self.dispatch(&msg);
                }
                Err(e) => {
                    warn!(session_id = %self.session_id(), "queued message {seq} unparseable: {e}");
                }
            }
        }
    }

    // -- disconnect / reset / error policy --

    /// Detach the transport and return to the logged-out state. The session
    /// object survives for the next connection.
    pub fn disconnect(&self) {
        let was_connected = {
            let mut state = self.lock_state();
            let was_connected = state.logon_received || state.logon_sent;
            state.logon_received = false;
            state.logon_sent = false;
            state.logout_sent = false;
            state.logout_received = false;
            state.logout_reason = None;
            state.logon_sent_at = None;
            state.logout_sent_at = None;
            state.clear_queue();
            state.resend_range = None;
            was_connected
        };
        info!(session_id = %self.session_id(), "disconnecting");
        if was_connected {
            self.application.on_logout(self.session_id());
        }
        if self.settings.reset_on_disconnect {
            self.reset();
        }
        {
            // reset_sent/reset_received survive only while a reset handshake
            // is mid-flight on a live connection.
            let mut state = self.lock_state();
            state.reset_sent = false;
            state.reset_received = false;
        }
        let responder = self.responder.lock().expect("responder lock").take();
        if let Some(responder) = responder {
            responder.disconnect();
        }
    }

    /// Release the message store. The session is done for good after this;
    /// use [`disconnect`](Session::disconnect) for ordinary teardown.
    pub fn close(&self) {
        if let Err(e) = self.lock_state().close_store() {
            error!(session_id = %self.session_id(), "store close failed: {e:#}");
        }
    }

    /// Both counters back to 1, stored messages dropped, window restarted.
    pub fn reset(&self) {
        self.application.on_before_session_reset(self.session_id());
        let mut state = self.lock_state();
        if let Err(e) = state.reset() {
            error!(session_id = %self.session_id(), "session reset failed: {e:#}");
        }
    }

    pub(crate) fn apply_error_policy(&self) {
        if self.settings.reset_on_error {
            warn!(session_id = %self.session_id(), "error policy: resetting session");
            self.reset();
        } else if self.settings.disconnect_on_error {
            warn!(session_id = %self.session_id(), "error policy: disconnecting");
            self.disconnect();
        }
    }

    fn apply_error_policy_locked(&self, state: &mut SessionState) {
        if self.settings.reset_on_error {
            warn!(session_id = %self.session_id(), "error policy: resetting session");
            if let Err(e) = state.reset() {
                error!(session_id = %self.session_id(), "session reset failed: {e:#}");
            }
        }
        // disconnect_on_error needs the responder lock; defer to the next
        // unlocked context rather than risk ordering issues here.
    }
}
