//! The application callback sink.
//!
//! A session owns exactly one [`Application`] and calls it from I/O, timer
//! and sender threads alike, so implementations must be re-entrant. Every
//! method has a no-op default; implement only what you need.

use crate::fix::fields::SessionRejectReason;
use crate::fix::mem::MsgBuf;
use crate::fix::session_id::SessionId;
use crate::MessageBuilder;
use std::sync::Arc;

/// Returned from [`Application::to_app`] to withhold a message from the wire.
/// During resend handling it turns the withheld message into a gap fill.
#[derive(Debug)]
pub struct DoNotSend;

/// How an application rejects an inbound message. Each kind maps onto a
/// specific outbound protocol message; see the session's error handling.
#[derive(Debug, thiserror::Error)]
pub enum MessageRejectError {
    /// The peer's Logon is unacceptable. Ends the session.
    #[error("logon rejected{}", .reason.as_deref().map(|r| format!(": {r}")).unwrap_or_default())]
    RejectLogon { reason: Option<String> },

    /// A field value is syntactically malformed.
    #[error("incorrect data format for value (tag={tag:?})")]
    IncorrectDataFormat { tag: Option<u32> },

    /// A field value is outside its enumerated set.
    #[error("value is incorrect (tag={tag})")]
    IncorrectTagValue { tag: u32 },

    /// The MsgType is not supported by this application.
    #[error("unsupported message type")]
    UnsupportedMessageType,
}

impl MessageRejectError {
    pub(crate) fn session_reject_reason(&self) -> Option<(SessionRejectReason, Option<u32>)> {
        match self {
            MessageRejectError::RejectLogon { .. } => None,
            MessageRejectError::IncorrectDataFormat { tag } => Some((
                SessionRejectReason::INCORRECT_DATA_FORMAT_FOR_VALUE,
                *tag,
            )),
            MessageRejectError::IncorrectTagValue { tag } => {
                Some((SessionRejectReason::VALUE_IS_INCORRECT, Some(*tag)))
            }
            MessageRejectError::UnsupportedMessageType => {
                Some((SessionRejectReason::INVALID_MSGTYPE, None))
            }
        }
    }
}

/// Callbacks a session makes into user code.
pub trait Application: Send + Sync {
    /// Both Logons have been exchanged; application traffic may flow.
    fn on_logon(&self, _session_id: &SessionId) {}

    /// The session has gone down (graceful or not).
    fn on_logout(&self, _session_id: &SessionId) {}

    /// An outbound admin message is about to be stamped and sent.
    fn to_admin(&self, _msg: &mut MessageBuilder, _session_id: &SessionId) {}

    /// An outbound application message is about to be stamped and sent.
    /// Return [`DoNotSend`] to withhold it.
    fn to_app(&self, _msg: &mut MessageBuilder, _session_id: &SessionId) -> Result<(), DoNotSend> {
        Ok(())
    }

    /// A persisted application message is about to be retransmitted in answer
    /// to a peer ResendRequest. Return [`DoNotSend`] to replace it with an
    /// administrative gap fill.
    fn to_app_resend(&self, _msg: &MsgBuf, _session_id: &SessionId) -> Result<(), DoNotSend> {
        Ok(())
    }

    /// A verified inbound admin message.
    fn from_admin(
        &self,
        _msg: &MsgBuf,
        _session_id: &SessionId,
    ) -> Result<(), MessageRejectError> {
        Ok(())
    }

    /// A verified, in-sequence inbound application message.
    fn from_app(&self, _msg: &MsgBuf, _session_id: &SessionId) -> Result<(), MessageRejectError> {
        Ok(())
    }

    /// Asked before an initiator generates a Logon. Return `false` to defer
    /// this attempt; it will be asked again on a later tick.
    fn can_logon(&self, _session_id: &SessionId) -> bool {
        true
    }

    /// About to wipe sequence numbers and stored messages.
    fn on_before_session_reset(&self, _session_id: &SessionId) {}
}

/// An [`Application`] that accepts everything and does nothing.
pub struct NullApplication;

impl Application for NullApplication {}

/// Fans every callback out to a list of applications in registration order.
///
/// Notification callbacks reach every listener regardless of what earlier
/// ones did. For callbacks with a veto (`to_app`, `from_*`, `can_logon`)
/// every listener is still consulted and the first veto wins.
#[derive(Default)]
pub struct CompositeApplication {
    listeners: Vec<Arc<dyn Application>>,
}

impl CompositeApplication {
    pub fn new() -> CompositeApplication {
        CompositeApplication::default()
    }

    pub fn add(&mut self, listener: Arc<dyn Application>) {
        self.listeners.push(listener);
    }
}

impl Application for CompositeApplication {
    fn on_logon(&self, session_id: &SessionId) {
        for listener in &self.listeners {
            listener.on_logon(session_id);
        }
    }

    fn on_logout(&self, session_id: &SessionId) {
        for listener in &self.listeners {
            listener.on_logout(session_id);
        }
    }

    fn to_admin(&self, msg: &mut MessageBuilder, session_id: &SessionId) {
        for listener in &self.listeners {
            listener.to_admin(msg, session_id);
        }
    }

    fn to_app(&self, msg: &mut MessageBuilder, session_id: &SessionId) -> Result<(), DoNotSend> {
        let mut veto = None;
        for listener in &self.listeners {
            if let Err(e) = listener.to_app(msg, session_id) {
                veto.get_or_insert(e);
            }
        }
        match veto {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn to_app_resend(&self, msg: &MsgBuf, session_id: &SessionId) -> Result<(), DoNotSend> {
        let mut veto = None;
        for listener in &self.listeners {
            if let Err(e) = listener.to_app_resend(msg, session_id) {
                veto.get_or_insert(e);
            }
        }
        match veto {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn from_admin(&self, msg: &MsgBuf, session_id: &SessionId) -> Result<(), MessageRejectError> {
        let mut rejection = None;
        for listener in &self.listeners {
            if let Err(e) = listener.from_admin(msg, session_id) {
                rejection.get_or_insert(e);
            }
        }
        match rejection {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn from_app(&self, msg: &MsgBuf, session_id: &SessionId) -> Result<(), MessageRejectError> {
        let mut rejection = None;
        for listener in &self.listeners {
            if let Err(e) = listener.from_app(msg, session_id) {
                rejection.get_or_insert(e);
            }
        }
        match rejection {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn can_logon(&self, session_id: &SessionId) -> bool {
        self.listeners.iter().all(|l| l.can_logon(session_id))
    }

    fn on_before_session_reset(&self, session_id: &SessionId) {
        for listener in &self.listeners {
            listener.on_before_session_reset(session_id);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_reject_reason_mapping() {
        let err = MessageRejectError::IncorrectTagValue { tag: 98 };
        assert_eq!(
            err.session_reject_reason(),
            Some((SessionRejectReason::VALUE_IS_INCORRECT, Some(98)))
        );
        let err = MessageRejectError::RejectLogon { reason: None };
        assert!(err.session_reject_reason().is_none());
    }

    #[test]
    fn test_reject_logon_display() {
        let err = MessageRejectError::RejectLogon {
            reason: Some(String::from("unknown counterparty")),
        };
        assert_eq!(err.to_string(), "logon rejected: unknown counterparty");
    }

    #[test]
    fn test_composite_consults_every_listener() {
        use std::sync::atomic::{AtomicU32, Ordering};

        #[derive(Default)]
        struct Counting {
            logons: AtomicU32,
            veto: bool,
        }
        impl Application for Counting {
            fn on_logon(&self, _: &SessionId) {
                self.logons.fetch_add(1, Ordering::Relaxed);
            }
            fn can_logon(&self, _: &SessionId) -> bool {
                !self.veto
            }
        }

        let first = Arc::new(Counting::default());
        let second = Arc::new(Counting {
            veto: true,
            ..Default::default()
        });
        let mut composite = CompositeApplication::new();
        composite.add(Arc::clone(&first) as Arc<dyn Application>);
        composite.add(Arc::clone(&second) as Arc<dyn Application>);

        let id = SessionId::new("FIX.4.2", "A", "B");
        composite.on_logon(&id);
        assert_eq!(first.logons.load(Ordering::Relaxed), 1);
        assert_eq!(second.logons.load(Ordering::Relaxed), 1);
        // one veto is enough
        assert!(!composite.can_logon(&id));
    }
}
