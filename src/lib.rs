//! An embeddable FIX session-layer engine.
//!
//! quayfix keeps one logical conversation per counterparty alive over any
//! number of TCP connections: it negotiates logon, assigns and persists
//! sequence numbers, detects gaps and requests retransmission, answers the
//! peer's resend requests from its message store, supervises liveness with
//! heartbeats and test requests, and tears sessions down gracefully or
//! abruptly with configurable reset policies.
//!
//! ## Terminology
//! * `Session` -- the long-lived sequenced conversation between two comp
//!   IDs. A session survives disconnects; only its transport comes and goes.
//! * `Connection` -- one TCP connection serving a session. The engine runs
//!   one event loop per connection.
//! * `Engine` -- the background task that owns a connection: it frames
//!   inbound bytes, drives the session state machine and its timers, and
//!   writes outbound frames.
//!
//! ## Example
//! ```no_run
//! use quayfix::{
//!     ApplicationError, EngineType, Initiator, MessageBuilder, NullApplication,
//!     SessionSettings,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), ApplicationError> {
//!     let settings = SessionSettings::builder()
//!         .with_begin_string("FIX.4.2")
//!         .with_sender_comp_id("MY_ID")
//!         .with_target_comp_id("PEER_ID")
//!         .with_socket_addr("127.0.0.1:9880".parse().unwrap())
//!         .with_engine_type(EngineType::Initiator)
//!         .build()?;
//!
//!     let (handle, _session) = Initiator::new(settings, Arc::new(NullApplication))?
//!         .initiate()
//!         .await?;
//!
//!     handle.start_async().await?;
//!     handle
//!         .send_message_async(MessageBuilder::new("FIX.4.2", 'D').push(58u32, b"hello"))
//!         .await?;
//!     handle.end_async().await?;
//!     Ok(())
//! }
//! ```

pub mod fix;

pub use fix::application::{
    Application, CompositeApplication, DoNotSend, MessageRejectError, NullApplication,
};
pub use fix::encode::MessageBuilder;
pub use fix::fields::{FixVersion, MsgType, SessionRejectReason, Tags};
pub use fix::mem::MsgBuf;
pub use fix::registry::{RegistryError, SessionManager};
pub use fix::schedule::{DailySchedule, NonStopSchedule, SessionSchedule, WeeklySchedule};
pub use fix::session::{Responder, Session};
pub use fix::session_id::SessionId;
#[cfg(feature = "sqlite")]
pub use fix::sqlite_store::SqliteStore;
pub use fix::store::{MemoryStore, MessageStore};
pub use fix::SessionError;

use fix::schedule;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tracing::error;

pub(crate) enum Request {
    Logon {
        resp_sender: oneshot::Sender<bool>,
    },
    SendMessage {
        resp_sender: oneshot::Sender<bool>,
        builder: MessageBuilder,
    },
    Logout {
        resp_sender: oneshot::Sender<bool>,
    },
}

/// Errors surfaced by the public engine API.
#[derive(Debug, Error)]
pub enum ApplicationError {
    #[error("An I/O error occurred: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Session ended unexpectedly")]
    SessionEnded,
    #[error("Logon has failed")]
    LogonFailed,
    #[error("Logout has failed")]
    LogoutFailed,
    #[error("MessageSend has failed")]
    SendMessageFailed,
    #[error("setting `{0}` is required")]
    SettingRequired(String),
    #[error("invalid session configuration: {0}")]
    InvalidSettings(#[from] SessionError),
}

/// Which side of the conversation this engine plays.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineType {
    /// Connects out and sends the first Logon.
    Initiator,
    /// Listens, and answers the peer's Logon.
    Acceptor,
}

/// Everything that configures one session. Construct with
/// [`SessionSettings::builder`].
#[derive(Clone)]
pub struct SessionSettings {
    pub(crate) session_id: SessionId,
    pub(crate) engine_type: EngineType,
    pub(crate) addr: Option<SocketAddr>,
    pub(crate) store_path: Option<PathBuf>,
    pub(crate) heart_bt_int: u32,
    pub(crate) check_latency: bool,
    pub(crate) max_latency: Duration,
    pub(crate) check_comp_id: bool,
    pub(crate) test_request_delay_multiplier: f64,
    pub(crate) reset_on_logon: bool,
    pub(crate) reset_on_logout: bool,
    pub(crate) reset_on_disconnect: bool,
    pub(crate) reset_on_error: bool,
    pub(crate) disconnect_on_error: bool,
    pub(crate) refresh_on_logon: bool,
    pub(crate) persist_messages: bool,
    pub(crate) send_redundant_resend_requests: bool,
    pub(crate) closed_resend_interval: bool,
    pub(crate) milliseconds_in_timestamp: bool,
    pub(crate) validate_sequence_numbers: bool,
    pub(crate) validate_incoming_message: bool,
    pub(crate) reject_invalid_message: bool,
    pub(crate) force_resend_when_corrupted_store: bool,
    pub(crate) allow_unknown_msg_fields: bool,
    pub(crate) disable_heart_beat_check: bool,
    pub(crate) enable_last_msg_seq_num_processed: bool,
    pub(crate) enable_next_expected_msg_seq_num: bool,
    pub(crate) logon_timeout: Duration,
    pub(crate) logout_timeout: Duration,
    pub(crate) resend_request_chunk_size: u32,
    pub(crate) allowed_remote_addresses: Vec<IpAddr>,
    pub(crate) logon_intervals: Vec<u64>,
    pub(crate) schedule: Arc<dyn SessionSchedule>,
}

impl std::fmt::Debug for SessionSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionSettings")
            .field("session_id", &self.session_id)
            .field("engine_type", &self.engine_type)
            .field("addr", &self.addr)
            .field("store_path", &self.store_path)
            .field("heart_bt_int", &self.heart_bt_int)
            .field("check_latency", &self.check_latency)
            .field("max_latency", &self.max_latency)
            .field("check_comp_id", &self.check_comp_id)
            .field(
                "test_request_delay_multiplier",
                &self.test_request_delay_multiplier,
            )
            .field("reset_on_logon", &self.reset_on_logon)
            .field("reset_on_logout", &self.reset_on_logout)
            .field("reset_on_disconnect", &self.reset_on_disconnect)
            .field("reset_on_error", &self.reset_on_error)
            .field("disconnect_on_error", &self.disconnect_on_error)
            .field("refresh_on_logon", &self.refresh_on_logon)
            .field("persist_messages", &self.persist_messages)
            .field(
                "send_redundant_resend_requests",
                &self.send_redundant_resend_requests,
            )
            .field("closed_resend_interval", &self.closed_resend_interval)
            .field(
                "milliseconds_in_timestamp",
                &self.milliseconds_in_timestamp,
            )
            .field(
                "validate_sequence_numbers",
                &self.validate_sequence_numbers,
            )
            .field(
                "validate_incoming_message",
                &self.validate_incoming_message,
            )
            .field("reject_invalid_message", &self.reject_invalid_message)
            .field(
                "force_resend_when_corrupted_store",
                &self.force_resend_when_corrupted_store,
            )
            .field("allow_unknown_msg_fields", &self.allow_unknown_msg_fields)
            .field("disable_heart_beat_check", &self.disable_heart_beat_check)
            .field(
                "enable_last_msg_seq_num_processed",
                &self.enable_last_msg_seq_num_processed,
            )
            .field(
                "enable_next_expected_msg_seq_num",
                &self.enable_next_expected_msg_seq_num,
            )
            .field("logon_timeout", &self.logon_timeout)
            .field("logout_timeout", &self.logout_timeout)
            .field(
                "resend_request_chunk_size",
                &self.resend_request_chunk_size,
            )
            .field(
                "allowed_remote_addresses",
                &self.allowed_remote_addresses,
            )
            .field("logon_intervals", &self.logon_intervals)
            .field("schedule", &"<dyn SessionSchedule>")
            .finish()
    }
}

impl SessionSettings {
    pub fn builder() -> SessionSettingsBuilder {
        SessionSettingsBuilder::new()
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub(crate) fn is_initiator(&self) -> bool {
        self.engine_type == EngineType::Initiator
    }
}

/// Builder for [`SessionSettings`]. Sender and target comp IDs are required;
/// everything else has protocol-sensible defaults.
pub struct SessionSettingsBuilder {
    begin_string: String,
    sender_comp_id: Option<String>,
    target_comp_id: Option<String>,
    session_qualifier: Option<String>,
    engine_type: EngineType,
    addr: Option<SocketAddr>,
    store_path: Option<PathBuf>,
    heart_bt_int: u32,
    check_latency: bool,
    max_latency: Duration,
    check_comp_id: bool,
    test_request_delay_multiplier: f64,
    reset_on_logon: bool,
    reset_on_logout: bool,
    reset_on_disconnect: bool,
    reset_on_error: bool,
    disconnect_on_error: bool,
    refresh_on_logon: bool,
    persist_messages: bool,
    send_redundant_resend_requests: bool,
    closed_resend_interval: bool,
    milliseconds_in_timestamp: bool,
    validate_sequence_numbers: bool,
    validate_incoming_message: bool,
    reject_invalid_message: bool,
    force_resend_when_corrupted_store: bool,
    allow_unknown_msg_fields: bool,
    disable_heart_beat_check: bool,
    enable_last_msg_seq_num_processed: bool,
    enable_next_expected_msg_seq_num: bool,
    logon_timeout: Duration,
    logout_timeout: Duration,
    resend_request_chunk_size: u32,
    allowed_remote_addresses: Vec<IpAddr>,
    logon_intervals: Vec<u64>,
    schedule: Arc<dyn SessionSchedule>,
}

impl Default for SessionSettingsBuilder {
    fn default() -> Self {
        SessionSettingsBuilder {
            begin_string: String::from("FIX.4.2"),
            sender_comp_id: None,
            target_comp_id: None,
            session_qualifier: None,
            engine_type: EngineType::Initiator,
            addr: None,
            store_path: None,
            heart_bt_int: 30,
            check_latency: true,
            max_latency: Duration::from_secs(120),
            check_comp_id: true,
            test_request_delay_multiplier: 0.5,
            reset_on_logon: false,
            reset_on_logout: false,
            reset_on_disconnect: false,
            reset_on_error: false,
            disconnect_on_error: false,
            refresh_on_logon: false,
            persist_messages: true,
            send_redundant_resend_requests: false,
            closed_resend_interval: false,
            milliseconds_in_timestamp: true,
            validate_sequence_numbers: true,
            validate_incoming_message: true,
            reject_invalid_message: true,
            force_resend_when_corrupted_store: false,
            allow_unknown_msg_fields: true,
            disable_heart_beat_check: false,
            enable_last_msg_seq_num_processed: false,
            enable_next_expected_msg_seq_num: false,
            logon_timeout: Duration::from_secs(10),
            logout_timeout: Duration::from_secs(2),
            resend_request_chunk_size: 0,
            allowed_remote_addresses: Vec::new(),
            logon_intervals: vec![5],
            schedule: Arc::new(schedule::NonStopSchedule),
        }
    }
}

impl SessionSettingsBuilder {
    pub fn new() -> SessionSettingsBuilder {
        Default::default()
    }

    /// The `BeginString(8)` stamped on every message.
    pub fn with_begin_string(mut self, begin_string: &str) -> Self {
        self.begin_string = begin_string.to_owned();
        self
    }

    /// The `SenderCompID(49)` stamped on every message.
    pub fn with_sender_comp_id(mut self, sender_comp_id: &str) -> Self {
        self.sender_comp_id = Some(sender_comp_id.to_owned());
        self
    }

    /// The `TargetCompID(56)` stamped on every message.
    pub fn with_target_comp_id(mut self, target_comp_id: &str) -> Self {
        self.target_comp_id = Some(target_comp_id.to_owned());
        self
    }

    /// Local qualifier distinguishing otherwise-identical sessions.
    pub fn with_session_qualifier(mut self, qualifier: &str) -> Self {
        self.session_qualifier = Some(qualifier.to_owned());
        self
    }

    pub fn with_engine_type(mut self, engine_type: EngineType) -> Self {
        self.engine_type = engine_type;
        self
    }

    /// Address to connect to (initiator) or listen on (acceptor).
    pub fn with_socket_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = Some(addr);
        self
    }

    /// Sqlite file for durable sequence numbers and messages. Without it
    /// the session keeps everything in memory.
    pub fn with_store_path(mut self, store_path: PathBuf) -> Self {
        self.store_path = Some(store_path);
        self
    }

    /// `HeartBtInt(108)` in seconds; 0 disables liveness supervision.
    pub fn with_heart_bt_int(mut self, seconds: u32) -> Self {
        self.heart_bt_int = seconds;
        self
    }

    /// Enforce `|now - SendingTime| <= max_latency` on inbound messages.
    pub fn with_check_latency(mut self, check: bool) -> Self {
        self.check_latency = check;
        self
    }

    pub fn with_max_latency(mut self, max_latency: Duration) -> Self {
        self.max_latency = max_latency;
        self
    }

    /// Require inbound comp IDs to mirror the session identity.
    pub fn with_check_comp_id(mut self, check: bool) -> Self {
        self.check_comp_id = check;
        self
    }

    /// Fraction of the heartbeat interval after which a quiet peer draws a
    /// TestRequest.
    pub fn with_test_request_delay_multiplier(mut self, multiplier: f64) -> Self {
        self.test_request_delay_multiplier = multiplier;
        self
    }

    pub fn with_reset_on_logon(mut self, reset: bool) -> Self {
        self.reset_on_logon = reset;
        self
    }

    pub fn with_reset_on_logout(mut self, reset: bool) -> Self {
        self.reset_on_logout = reset;
        self
    }

    pub fn with_reset_on_disconnect(mut self, reset: bool) -> Self {
        self.reset_on_disconnect = reset;
        self
    }

    pub fn with_reset_on_error(mut self, reset: bool) -> Self {
        self.reset_on_error = reset;
        self
    }

    pub fn with_disconnect_on_error(mut self, disconnect: bool) -> Self {
        self.disconnect_on_error = disconnect;
        self
    }

    /// Reload the store when a logon arrives (acceptors sharing a store
    /// with another writer).
    pub fn with_refresh_on_logon(mut self, refresh: bool) -> Self {
        self.refresh_on_logon = refresh;
        self
    }

    /// Keep sent messages for resend. Off means gap fills answer every
    /// ResendRequest.
    pub fn with_persist_messages(mut self, persist: bool) -> Self {
        self.persist_messages = persist;
        self
    }

    pub fn with_send_redundant_resend_requests(mut self, send: bool) -> Self {
        self.send_redundant_resend_requests = send;
        self
    }

    /// Always request closed ranges instead of the dialect's open-range
    /// sentinel.
    pub fn with_closed_resend_interval(mut self, closed: bool) -> Self {
        self.closed_resend_interval = closed;
        self
    }

    pub fn with_milliseconds_in_timestamp(mut self, millis: bool) -> Self {
        self.milliseconds_in_timestamp = millis;
        self
    }

    pub fn with_validate_sequence_numbers(mut self, validate: bool) -> Self {
        self.validate_sequence_numbers = validate;
        self
    }

    /// Checksum and field-format checks on inbound frames.
    pub fn with_validate_incoming_message(mut self, validate: bool) -> Self {
        self.validate_incoming_message = validate;
        self
    }

    /// Answer malformed messages with a Reject instead of only logging.
    pub fn with_reject_invalid_message(mut self, reject: bool) -> Self {
        self.reject_invalid_message = reject;
        self
    }

    /// On store read failure, cover resend requests with synthesized
    /// heartbeats instead of surfacing the error.
    pub fn with_force_resend_when_corrupted_store(mut self, force: bool) -> Self {
        self.force_resend_when_corrupted_store = force;
        self
    }

    /// Tolerate unenumerated tags in admin message bodies.
    pub fn with_allow_unknown_msg_fields(mut self, allow: bool) -> Self {
        self.allow_unknown_msg_fields = allow;
        self
    }

    /// Log instead of disconnecting when the peer stops heartbeating.
    pub fn with_disable_heart_beat_check(mut self, disable: bool) -> Self {
        self.disable_heart_beat_check = disable;
        self
    }

    /// Stamp `LastMsgSeqNumProcessed(369)` on outbound headers.
    pub fn with_enable_last_msg_seq_num_processed(mut self, enable: bool) -> Self {
        self.enable_last_msg_seq_num_processed = enable;
        self
    }

    /// Send and honor `NextExpectedMsgSeqNum(789)` on Logon.
    pub fn with_enable_next_expected_msg_seq_num(mut self, enable: bool) -> Self {
        self.enable_next_expected_msg_seq_num = enable;
        self
    }

    pub fn with_logon_timeout(mut self, timeout: Duration) -> Self {
        self.logon_timeout = timeout;
        self
    }

    pub fn with_logout_timeout(mut self, timeout: Duration) -> Self {
        self.logout_timeout = timeout;
        self
    }

    /// Split resend requests into closed chunks of this many messages;
    /// 0 requests the whole gap at once.
    pub fn with_resend_request_chunk_size(mut self, chunk_size: u32) -> Self {
        self.resend_request_chunk_size = chunk_size;
        self
    }

    /// Acceptor allowlist; empty admits any address.
    pub fn with_allowed_remote_addresses(mut self, addresses: Vec<IpAddr>) -> Self {
        self.allowed_remote_addresses = addresses;
        self
    }

    /// Logon retry backoff table in seconds, indexed by attempt.
    pub fn with_logon_intervals(mut self, intervals: Vec<u64>) -> Self {
        self.logon_intervals = intervals;
        self
    }

    pub fn with_schedule(mut self, schedule: Arc<dyn SessionSchedule>) -> Self {
        self.schedule = schedule;
        self
    }

    pub fn build(self) -> Result<SessionSettings, ApplicationError> {
        let sender_comp_id = self
            .sender_comp_id
            .ok_or_else(|| ApplicationError::SettingRequired(String::from("sender_comp_id")))?;
        let target_comp_id = self
            .target_comp_id
            .ok_or_else(|| ApplicationError::SettingRequired(String::from("target_comp_id")))?;
        let mut session_id_builder =
            SessionId::builder(&self.begin_string, &sender_comp_id, &target_comp_id);
        if let Some(qualifier) = &self.session_qualifier {
            session_id_builder = session_id_builder.qualifier(qualifier);
        }
        let logon_intervals = if self.logon_intervals.is_empty() {
            vec![5]
        } else {
            self.logon_intervals
        };
        Ok(SessionSettings {
            session_id: session_id_builder.build(),
            engine_type: self.engine_type,
            addr: self.addr,
            store_path: self.store_path,
            heart_bt_int: self.heart_bt_int,
            check_latency: self.check_latency,
            max_latency: self.max_latency,
            check_comp_id: self.check_comp_id,
            test_request_delay_multiplier: self.test_request_delay_multiplier,
            reset_on_logon: self.reset_on_logon,
            reset_on_logout: self.reset_on_logout,
            reset_on_disconnect: self.reset_on_disconnect,
            reset_on_error: self.reset_on_error,
            disconnect_on_error: self.disconnect_on_error,
            refresh_on_logon: self.refresh_on_logon,
            persist_messages: self.persist_messages,
            send_redundant_resend_requests: self.send_redundant_resend_requests,
            closed_resend_interval: self.closed_resend_interval,
            milliseconds_in_timestamp: self.milliseconds_in_timestamp,
            validate_sequence_numbers: self.validate_sequence_numbers,
            validate_incoming_message: self.validate_incoming_message,
            reject_invalid_message: self.reject_invalid_message,
            force_resend_when_corrupted_store: self.force_resend_when_corrupted_store,
            allow_unknown_msg_fields: self.allow_unknown_msg_fields,
            disable_heart_beat_check: self.disable_heart_beat_check,
            enable_last_msg_seq_num_processed: self.enable_last_msg_seq_num_processed,
            enable_next_expected_msg_seq_num: self.enable_next_expected_msg_seq_num,
            logon_timeout: self.logon_timeout,
            logout_timeout: self.logout_timeout,
            resend_request_chunk_size: self.resend_request_chunk_size,
            allowed_remote_addresses: self.allowed_remote_addresses,
            logon_intervals,
            schedule: self.schedule,
        })
    }
}

/// A handle onto a running engine: request logon, send messages, request
/// logout. Clones freely across threads; each operation returns a
/// [`oneshot::Receiver`] resolved when the engine has an answer.
///
/// [`oneshot::Receiver`]: tokio::sync::oneshot::Receiver
#[derive(Clone)]
pub struct SessionHandle {
    request_sender: mpsc::UnboundedSender<Request>,
    begin_string: String,
}

impl SessionHandle {
    /// Ask the engine to log on. The receiver yields true once both Logons
    /// have been exchanged.
    pub fn start(&self) -> Result<oneshot::Receiver<bool>, ApplicationError> {
        if self.request_sender.is_closed() {
            return Err(ApplicationError::SessionEnded);
        }
        let (resp_sender, resp_receiver) = oneshot::channel();
        let _ = self.request_sender.send(Request::Logon { resp_sender });
        Ok(resp_receiver)
    }

    pub async fn start_async(&self) -> Result<(), ApplicationError> {
        if self.start()?.await != Ok(true) {
            return Err(ApplicationError::LogonFailed);
        }
        Ok(())
    }

    pub fn start_sync(&self) -> Result<(), ApplicationError> {
        if self.start()?.blocking_recv() != Ok(true) {
            return Err(ApplicationError::LogonFailed);
        }
        Ok(())
    }

    /// Queue one application message. The receiver yields true once the
    /// message was handed to network I/O.
    pub fn send_message(
        &self,
        builder: MessageBuilder,
    ) -> Result<oneshot::Receiver<bool>, ApplicationError> {
        if self.request_sender.is_closed() {
            return Err(ApplicationError::SessionEnded);
        }
        let (resp_sender, resp_receiver) = oneshot::channel();
        let _ = self.request_sender.send(Request::SendMessage {
            resp_sender,
            builder,
        });
        Ok(resp_receiver)
    }

    pub async fn send_message_async(&self, builder: MessageBuilder) -> Result<(), ApplicationError> {
        if self.send_message(builder)?.await != Ok(true) {
            return Err(ApplicationError::SendMessageFailed);
        }
        Ok(())
    }

    pub fn send_message_sync(&self, builder: MessageBuilder) -> Result<(), ApplicationError> {
        if self.send_message(builder)?.blocking_recv() != Ok(true) {
            return Err(ApplicationError::SendMessageFailed);
        }
        Ok(())
    }

    /// Ask the engine for a graceful logout. The receiver yields true once
    /// the connection is down without error.
    pub fn end(&self) -> Result<oneshot::Receiver<bool>, ApplicationError> {
        let (resp_sender, resp_receiver) = oneshot::channel();
        let _ = self.request_sender.send(Request::Logout { resp_sender });
        Ok(resp_receiver)
    }

    pub async fn end_async(&self) -> Result<(), ApplicationError> {
        if self.end()?.await != Ok(true) {
            return Err(ApplicationError::LogoutFailed);
        }
        Ok(())
    }

    pub fn end_sync(&self) -> Result<(), ApplicationError> {
        if self.end()?.blocking_recv() != Ok(true) {
            return Err(ApplicationError::LogoutFailed);
        }
        Ok(())
    }

    pub fn begin_string(&self) -> &str {
        &self.begin_string
    }
}

fn build_store(settings: &SessionSettings) -> Result<Box<dyn MessageStore>, ApplicationError> {
    #[cfg(feature = "sqlite")]
    if let Some(path) = &settings.store_path {
        let store = SqliteStore::open(path, &settings.session_id.to_string())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        return Ok(Box::new(store));
    }
    #[cfg(not(feature = "sqlite"))]
    let _ = &settings.store_path;
    Ok(Box::new(MemoryStore::new()))
}

fn spawn_engine(stream: TcpStream, session: Arc<Session>) -> SessionHandle {
    let (request_sender, request_receiver) = mpsc::unbounded_channel();
    let handle = SessionHandle {
        request_sender,
        begin_string: session.session_id().begin_string().to_owned(),
    };
    tokio::spawn(async move {
        if let Err(e) = fix::run_session(stream, Arc::clone(&session), request_receiver).await {
            error!(session_id = %session.session_id(), "engine stopped: {e:?}");
        }
    });
    handle
}

/// Builds one session, connects out, and runs an engine for the connection.
pub struct Initiator {
    settings: SessionSettings,
    session: Arc<Session>,
}

impl Initiator {
    pub fn new(
        mut settings: SessionSettings,
        application: Arc<dyn Application>,
    ) -> Result<Initiator, ApplicationError> {
        settings.engine_type = EngineType::Initiator;
        let store = build_store(&settings)?;
        let session = Session::new(settings.clone(), store, application)?;
        Ok(Initiator { settings, session })
    }

    /// Connect and start the engine on the current runtime. Logon is not
    /// requested until [`SessionHandle::start`].
    pub async fn initiate(self) -> Result<(SessionHandle, Arc<Session>), ApplicationError> {
        let addr = self
            .settings
            .addr
            .ok_or_else(|| ApplicationError::SettingRequired(String::from("addr")))?;
        let socket = match addr {
            SocketAddr::V4(_) => TcpSocket::new_v4()?,
            SocketAddr::V6(_) => TcpSocket::new_v6()?,
        };
        let stream = socket.connect(addr).await?;
        stream.set_nodelay(true)?;
        let handle = spawn_engine(stream, Arc::clone(&self.session));
        Ok((handle, self.session))
    }

    /// Connect using an internally created runtime; the runtime keeps the
    /// engine alive on a background thread.
    pub fn initiate_sync(self) -> Result<(SessionHandle, Arc<Session>), ApplicationError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?;
        let (handle, session) = runtime.block_on(self.initiate())?;
        std::thread::spawn(move || {
            runtime.block_on(std::future::pending::<()>());
        });
        Ok((handle, session))
    }
}

/// Accepts connections and runs one engine (and session) per connection.
pub struct Acceptor {
    settings: SessionSettings,
    application: Arc<dyn Application>,
    listener: TcpListener,
}

impl Acceptor {
    pub async fn bind(
        mut settings: SessionSettings,
        application: Arc<dyn Application>,
    ) -> Result<Acceptor, ApplicationError> {
        settings.engine_type = EngineType::Acceptor;
        let addr = settings
            .addr
            .ok_or_else(|| ApplicationError::SettingRequired(String::from("addr")))?;
        let listener = TcpListener::bind(addr).await?;
        Ok(Acceptor {
            settings,
            application,
            listener,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ApplicationError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept one connection and attach a fresh engine to it.
    pub async fn accept(&mut self) -> Result<(SessionHandle, Arc<Session>), ApplicationError> {
        let (stream, _remote) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        let store = build_store(&self.settings)?;
        let session = Session::new(
            self.settings.clone(),
            store,
            Arc::clone(&self.application),
        )?;
        let handle = spawn_engine(stream, Arc::clone(&session));
        Ok((handle, session))
    }
}
