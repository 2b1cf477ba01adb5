//! The single mutable record behind a session.
//!
//! Everything here is owned by one [`Session`](crate::fix::session::Session)
//! and touched only under its mutex; the fields are plain because the lock is
//! the synchronization story. Sequence counters live in the message store,
//! which stays authoritative across restarts.

use crate::fix::mem::MsgBuf;
use crate::fix::store::MessageStore;
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

/// A pending request for retransmission of `[begin, end]`. When requests are
/// chunked, `chunk_end` marks the last sequence number covered by the chunk
/// most recently asked for; 0 means the request was not chunked.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct ResendRange {
    pub begin: u32,
    pub end: u32,
    pub chunk_end: u32,
}

pub(crate) struct SessionState {
    store: Box<dyn MessageStore>,

    /// User intent: false once a local logout was requested.
    pub enabled: bool,
    pub initiator: bool,

    pub logon_sent: bool,
    pub logon_received: bool,
    pub logout_sent: bool,
    pub logout_received: bool,
    pub reset_sent: bool,
    pub reset_received: bool,

    /// Attached to the next outbound Logout.
    pub logout_reason: Option<String>,

    /// Negotiated at logon; 0 disables liveness supervision.
    pub heart_bt_int: u32,
    pub test_request_counter: u32,
    pub test_request_delay_multiplier: f64,

    pub last_sent_time: Instant,
    pub last_received_time: Instant,

    pub logon_attempts: u32,
    pub last_logon_attempt: Option<Instant>,
    pub logon_sent_at: Option<Instant>,
    pub logout_sent_at: Option<Instant>,
    pub logon_timeout: Duration,
    pub logout_timeout: Duration,

    queue: BTreeMap<u32, Arc<MsgBuf>>,
    pub resend_range: Option<ResendRange>,
}

impl SessionState {
    pub(crate) fn new(
        store: Box<dyn MessageStore>,
        initiator: bool,
        heart_bt_int: u32,
        test_request_delay_multiplier: f64,
        logon_timeout: Duration,
        logout_timeout: Duration,
    ) -> SessionState {
        SessionState {
            store,
            // Acceptors are ready for the peer's Logon from the start; an
            // initiator stays quiet until logon() is requested.
            enabled: !initiator,
            initiator,
            logon_sent: false,
            logon_received: false,
            logout_sent: false,
            logout_received: false,
            reset_sent: false,
            reset_received: false,
            logout_reason: None,
            heart_bt_int,
            test_request_counter: 0,
            test_request_delay_multiplier,
            last_sent_time: Instant::now(),
            last_received_time: Instant::now(),
            logon_attempts: 0,
            last_logon_attempt: None,
            logon_sent_at: None,
            logout_sent_at: None,
            logon_timeout,
            logout_timeout,
            queue: BTreeMap::new(),
            resend_range: None,
        }
    }

    pub fn is_logged_on(&self) -> bool {
        self.logon_received && self.logon_sent
    }

    pub fn should_send_logon(&self) -> bool {
        self.initiator && !self.logon_sent
    }

    // -- sequence counters (store is authoritative) --

    pub fn next_sender_msg_seq_num(&self) -> u32 {
        self.store.next_sender_msg_seq_num()
    }

    pub fn next_target_msg_seq_num(&self) -> u32 {
        self.store.next_target_msg_seq_num()
    }

    pub fn set_next_sender_msg_seq_num(&mut self, seq_num: u32) -> Result<()> {
        self.store.set_next_sender_msg_seq_num(seq_num)
    }

    pub fn set_next_target_msg_seq_num(&mut self, seq_num: u32) -> Result<()> {
        self.store.set_next_target_msg_seq_num(seq_num)
    }

    pub fn incr_next_sender_msg_seq_num(&mut self) -> Result<()> {
        self.store.incr_next_sender_msg_seq_num()
    }

    pub fn incr_next_target_msg_seq_num(&mut self) -> Result<()> {
        self.store.incr_next_target_msg_seq_num()
    }

    pub fn persist(&mut self, seq_num: u32, msg: &[u8]) -> Result<()> {
        self.store.set(seq_num, msg)
    }

    pub fn fetch_persisted(&self, begin: u32, end: u32) -> Result<Vec<(u32, Vec<u8>)>> {
        self.store.get(begin, end)
    }

    pub fn refresh(&mut self) -> Result<()> {
        self.store.refresh()
    }

    pub fn close_store(&mut self) -> Result<()> {
        self.store.close()
    }

    pub fn creation_time(&self) -> DateTime<Utc> {
        self.store.creation_time()
    }

    /// Counters back to 1, flags cleared, queue dropped. The store updates
    /// its creation time.
    pub fn reset(&mut self) -> Result<()> {
        self.store.reset()?;
        self.logon_sent = false;
        self.logon_received = false;
        self.logout_sent = false;
        self.logout_received = false;
        self.reset_sent = false;
        self.reset_received = false;
        self.logout_reason = None;
        self.test_request_counter = 0;
        self.logon_sent_at = None;
        self.logout_sent_at = None;
        self.queue.clear();
        self.resend_range = None;
        info!("sequence numbers reset to 1");
        Ok(())
    }

    // -- inbound queue --

    pub fn enqueue(&mut self, seq_num: u32, msg: Arc<MsgBuf>) {
        self.queue.insert(seq_num, msg);
    }

    pub fn dequeue(&mut self, seq_num: u32) -> Option<Arc<MsgBuf>> {
        self.queue.remove(&seq_num)
    }

    pub fn clear_queue(&mut self) {
        self.queue.clear();
    }

    #[cfg(test)]
    pub fn queued_len(&self) -> usize {
        self.queue.len()
    }

    // -- liveness arithmetic --

    fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(u64::from(self.heart_bt_int))
    }

    pub fn within_heartbeat(&self, now: Instant) -> bool {
        let interval = self.heartbeat_interval();
        now.duration_since(self.last_sent_time) < interval
            && now.duration_since(self.last_received_time) < interval
    }

    /// Nothing heard for 2.4 heartbeat intervals: the peer is gone.
    pub fn timed_out(&self, now: Instant) -> bool {
        now.duration_since(self.last_received_time) > self.heartbeat_interval().mul_f64(2.4)
    }

    /// Quiet long enough that the next test request escalation is due. The
    /// threshold grows with each unanswered test request.
    pub fn test_request_needed(&self, now: Instant) -> bool {
        let escalations = f64::from(self.test_request_counter + 1);
        let threshold = self
            .heartbeat_interval()
            .mul_f64(1.0 + escalations * self.test_request_delay_multiplier);
        now.duration_since(self.last_received_time) > threshold
    }

    pub fn heartbeat_needed(&self, now: Instant) -> bool {
        now.duration_since(self.last_sent_time) >= self.heartbeat_interval()
    }

    pub fn logon_timed_out(&self, now: Instant) -> bool {
        match self.logon_sent_at {
            Some(at) if self.logon_sent && !self.logon_received => {
                now.duration_since(at) >= self.logon_timeout
            }
            _ => false,
        }
    }

    pub fn logout_timed_out(&self, now: Instant) -> bool {
        match self.logout_sent_at {
            Some(at) if self.logout_sent => now.duration_since(at) >= self.logout_timeout,
            _ => false,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fix::store::MemoryStore;

    fn state(heart_bt_int: u32) -> SessionState {
        SessionState::new(
            Box::new(MemoryStore::new()),
            true,
            heart_bt_int,
            0.5,
            Duration::from_secs(10),
            Duration::from_secs(2),
        )
    }

    #[test]
    fn test_liveness_thresholds() {
        let mut s = state(2);
        let start = Instant::now();
        s.last_sent_time = start;
        s.last_received_time = start;

        assert!(s.within_heartbeat(start + Duration::from_millis(1900)));
        assert!(!s.within_heartbeat(start + Duration::from_millis(2100)));

        // first test request due past 1.5 intervals (3s)
        assert!(!s.test_request_needed(start + Duration::from_millis(2900)));
        assert!(s.test_request_needed(start + Duration::from_millis(3100)));

        // after one unanswered test request the bar moves to 2 intervals (4s)
        s.test_request_counter = 1;
        assert!(!s.test_request_needed(start + Duration::from_millis(3900)));
        assert!(s.test_request_needed(start + Duration::from_millis(4100)));

        // dead at 2.4 intervals (4.8s)
        assert!(!s.timed_out(start + Duration::from_millis(4700)));
        assert!(s.timed_out(start + Duration::from_millis(4900)));
    }

    #[test]
    fn test_logon_logout_timeouts() {
        let mut s = state(30);
        let start = Instant::now();
        assert!(!s.logon_timed_out(start + Duration::from_secs(60)));

        s.logon_sent = true;
        s.logon_sent_at = Some(start);
        assert!(!s.logon_timed_out(start + Duration::from_secs(9)));
        assert!(s.logon_timed_out(start + Duration::from_secs(11)));
        s.logon_received = true;
        assert!(!s.logon_timed_out(start + Duration::from_secs(11)));

        s.logout_sent = true;
        s.logout_sent_at = Some(start);
        assert!(!s.logout_timed_out(start + Duration::from_secs(1)));
        assert!(s.logout_timed_out(start + Duration::from_secs(3)));
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut s = state(30);
        s.logon_sent = true;
        s.logon_received = true;
        s.reset_sent = true;
        s.test_request_counter = 3;
        s.logout_reason = Some(String::from("bye"));
        s.enqueue(8, Arc::new(b"msg".as_slice().into()));
        s.resend_range = Some(ResendRange {
            begin: 5,
            end: 7,
            chunk_end: 0,
        });
        s.incr_next_sender_msg_seq_num().unwrap();
        s.incr_next_target_msg_seq_num().unwrap();

        s.reset().unwrap();

        assert_eq!(s.next_sender_msg_seq_num(), 1);
        assert_eq!(s.next_target_msg_seq_num(), 1);
        assert!(!s.logon_sent && !s.logon_received && !s.reset_sent);
        assert_eq!(s.test_request_counter, 0);
        assert_eq!(s.logout_reason, None);
        assert_eq!(s.queued_len(), 0);
        assert_eq!(s.resend_range, None);
    }

    #[test]
    fn test_queue_orders_by_sequence() {
        let mut s = state(30);
        s.enqueue(9, Arc::new(b"nine".as_slice().into()));
        s.enqueue(8, Arc::new(b"eight".as_slice().into()));
        assert!(s.dequeue(7).is_none());
        assert_eq!(s.dequeue(8).unwrap().as_slice(), b"eight");
        assert_eq!(s.dequeue(9).unwrap().as_slice(), b"nine");
    }
}
