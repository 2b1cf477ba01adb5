//! Shared fixtures for session-level tests: a responder that records
//! frames, an application that records callbacks, and helpers for building
//! peer messages.

use crate::fix::application::{Application, DoNotSend, MessageRejectError};
use crate::fix::encode::TIME_FORMAT_MILLIS;
use crate::fix::mem::MsgBuf;
use crate::fix::session::{Responder, Session};
use crate::fix::session_id::SessionId;
use crate::fix::store::MemoryStore;
use crate::{EngineType, MessageBuilder, SessionSettings, SessionSettingsBuilder};
use chrono::Utc;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Records every outbound frame; frames render with `|` for SOH so tests
/// can assert on readable substrings.
pub(crate) struct MockResponder {
    sent: Mutex<Vec<MsgBuf>>,
    disconnected: AtomicBool,
}

impl MockResponder {
    pub(crate) fn new() -> Arc<MockResponder> {
        Arc::new(MockResponder {
            sent: Mutex::new(Vec::new()),
            disconnected: AtomicBool::new(false),
        })
    }

    pub(crate) fn frames(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|f| format!("{f:?}"))
            .collect()
    }

    pub(crate) fn clear(&self) {
        self.sent.lock().unwrap().clear();
    }

    pub(crate) fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Relaxed)
    }
}

impl Responder for MockResponder {
    fn send(&self, msg: &MsgBuf) -> bool {
        self.sent.lock().unwrap().push(msg.clone());
        true
    }

    fn disconnect(&self) {
        self.disconnected.store(true, Ordering::Relaxed);
    }

    fn remote_address(&self) -> Option<SocketAddr> {
        None
    }
}

#[derive(Default)]
pub(crate) struct RecordingApplication {
    pub events: Mutex<Vec<String>>,
    pub app_messages: Mutex<Vec<MsgBuf>>,
    pub reject_next_from_app: Mutex<Option<MessageRejectError>>,
    pub reject_next_from_admin: Mutex<Option<MessageRejectError>>,
    pub withhold_resends: AtomicBool,
    pub refuse_logon: AtomicBool,
}

impl RecordingApplication {
    pub(crate) fn new() -> Arc<RecordingApplication> {
        Arc::new(RecordingApplication::default())
    }

    pub(crate) fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn record(&self, event: &str) {
        self.events.lock().unwrap().push(event.to_owned());
    }
}

impl Application for RecordingApplication {
    fn on_logon(&self, _session_id: &SessionId) {
        self.record("on_logon");
    }

    fn on_logout(&self, _session_id: &SessionId) {
        self.record("on_logout");
    }

    fn to_admin(&self, _msg: &mut MessageBuilder, _session_id: &SessionId) {
        self.record("to_admin");
    }

    fn to_app(&self, _msg: &mut MessageBuilder, _session_id: &SessionId) -> Result<(), DoNotSend> {
        self.record("to_app");
        Ok(())
    }

    fn to_app_resend(&self, _msg: &MsgBuf, _session_id: &SessionId) -> Result<(), DoNotSend> {
        self.record("to_app_resend");
        if self.withhold_resends.load(Ordering::Relaxed) {
            Err(DoNotSend)
        } else {
            Ok(())
        }
    }

    fn from_admin(&self, _msg: &MsgBuf, _session_id: &SessionId) -> Result<(), MessageRejectError> {
        self.record("from_admin");
        match self.reject_next_from_admin.lock().unwrap().take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn from_app(&self, msg: &MsgBuf, _session_id: &SessionId) -> Result<(), MessageRejectError> {
        self.record("from_app");
        self.app_messages.lock().unwrap().push(msg.clone());
        match self.reject_next_from_app.lock().unwrap().take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn can_logon(&self, _session_id: &SessionId) -> bool {
        !self.refuse_logon.load(Ordering::Relaxed)
    }

    fn on_before_session_reset(&self, _session_id: &SessionId) {
        self.record("on_before_session_reset");
    }
}

/// SERVER talking to CLIENT over FIX.4.2, latency checking off so literal
/// timestamps stay valid.
pub(crate) fn test_settings(engine_type: EngineType) -> SessionSettingsBuilder {
    SessionSettings::builder()
        .with_begin_string("FIX.4.2")
        .with_sender_comp_id("SERVER")
        .with_target_comp_id("CLIENT")
        .with_engine_type(engine_type)
        .with_check_latency(false)
}

pub(crate) struct TestSession {
    pub session: Arc<Session>,
    pub responder: Arc<MockResponder>,
    pub application: Arc<RecordingApplication>,
}

pub(crate) fn make_session(settings: SessionSettings) -> TestSession {
    let responder = MockResponder::new();
    let application = RecordingApplication::new();
    let session = Session::new(
        settings,
        Box::new(MemoryStore::new()),
        Arc::clone(&application) as Arc<dyn Application>,
    )
    .unwrap();
    session.set_responder(Arc::clone(&responder) as Arc<dyn Responder>);
    TestSession {
        session,
        responder,
        application,
    }
}

/// `|`-separated literal to raw frame.
pub(crate) fn soh(s: &str) -> Arc<MsgBuf> {
    Arc::new(MsgBuf(s.replace('|', "\x01").into_bytes()))
}

/// A frame as the peer (CLIENT) would send it. BodyLength and CheckSum are
/// placeholders; the session core trusts the framing layer for those.
pub(crate) fn peer_msg(msg_type: char, msg_seq_num: u32, body: &str) -> Arc<MsgBuf> {
    let sending_time = Utc::now().format(TIME_FORMAT_MILLIS);
    soh(&format!(
        "8=FIX.4.2|9=0|35={msg_type}|34={msg_seq_num}|49=CLIENT|56=SERVER|52={sending_time}|{body}10=000|"
    ))
}

/// Drive an acceptor session through the peer's logon so tests start from
/// the logged-on state.
pub(crate) fn logon(test_session: &TestSession) {
    test_session
        .session
        .receive(peer_msg('A', test_session.session.expected_target_num(), "98=0|108=30|"));
    assert!(test_session.session.is_logged_on());
    test_session.responder.clear();
    test_session.application.events.lock().unwrap().clear();
}
