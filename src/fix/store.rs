//! Durable sequence numbers and outbound message retention.

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// Where a session keeps its sequence counters and sent messages.
///
/// The store is the authority on sequence numbers: a message is persisted
/// under its assigned number *before* the next-sender counter advances, so a
/// crash between the two is recoverable on restart. A store instance belongs
/// to exactly one session and is always called under that session's lock.
pub trait MessageStore: Send {
    fn next_sender_msg_seq_num(&self) -> u32;
    fn next_target_msg_seq_num(&self) -> u32;

    fn set_next_sender_msg_seq_num(&mut self, seq_num: u32) -> Result<()>;
    fn set_next_target_msg_seq_num(&mut self, seq_num: u32) -> Result<()>;

    fn incr_next_sender_msg_seq_num(&mut self) -> Result<()>;
    fn incr_next_target_msg_seq_num(&mut self) -> Result<()>;

    /// All persisted messages with sequence numbers in `[begin, end]`,
    /// ascending.
    fn get(&self, begin: u32, end: u32) -> Result<Vec<(u32, Vec<u8>)>>;

    /// Persist one outbound message under its sequence number.
    fn set(&mut self, seq_num: u32, msg: &[u8]) -> Result<()>;

    /// Reload counters from the backing medium, discarding cached state.
    fn refresh(&mut self) -> Result<()>;

    /// Drop all messages, return both counters to 1 and restart the creation
    /// time.
    fn reset(&mut self) -> Result<()>;

    /// When the current incarnation of this session began.
    fn creation_time(&self) -> DateTime<Utc>;

    /// Flush and release the backing medium. Called once, on engine
    /// shutdown or unregistration.
    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Non-durable store for tests and sessions that reset every connection.
pub struct MemoryStore {
    next_sender_msg_seq_num: u32,
    next_target_msg_seq_num: u32,
    messages: BTreeMap<u32, Vec<u8>>,
    creation_time: DateTime<Utc>,
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        MemoryStore {
            next_sender_msg_seq_num: 1,
            next_target_msg_seq_num: 1,
            messages: BTreeMap::new(),
            creation_time: Utc::now(),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageStore for MemoryStore {
    fn next_sender_msg_seq_num(&self) -> u32 {
        self.next_sender_msg_seq_num
    }

    fn next_target_msg_seq_num(&self) -> u32 {
        self.next_target_msg_seq_num
    }

    fn set_next_sender_msg_seq_num(&mut self, seq_num: u32) -> Result<()> {
        self.next_sender_msg_seq_num = seq_num;
        Ok(())
    }

    fn set_next_target_msg_seq_num(&mut self, seq_num: u32) -> Result<()> {
        self.next_target_msg_seq_num = seq_num;
        Ok(())
    }

    fn incr_next_sender_msg_seq_num(&mut self) -> Result<()> {
        self.next_sender_msg_seq_num += 1;
        Ok(())
    }

    fn incr_next_target_msg_seq_num(&mut self) -> Result<()> {
        self.next_target_msg_seq_num += 1;
        Ok(())
    }

    fn get(&self, begin: u32, end: u32) -> Result<Vec<(u32, Vec<u8>)>> {
        Ok(self
            .messages
            .range(begin..=end)
            .map(|(seq, msg)| (*seq, msg.clone()))
            .collect())
    }

    fn set(&mut self, seq_num: u32, msg: &[u8]) -> Result<()> {
        self.messages.insert(seq_num, msg.to_vec());
        Ok(())
    }

    fn refresh(&mut self) -> Result<()> {
        // Nothing behind this store to reload from.
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        self.next_sender_msg_seq_num = 1;
        self.next_target_msg_seq_num = 1;
        self.messages.clear();
        self.creation_time = Utc::now();
        Ok(())
    }

    fn creation_time(&self) -> DateTime<Utc> {
        self.creation_time
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_counters_start_at_one() {
        let store = MemoryStore::new();
        assert_eq!(store.next_sender_msg_seq_num(), 1);
        assert_eq!(store.next_target_msg_seq_num(), 1);
    }

    #[test]
    fn test_get_range_ascending() {
        let mut store = MemoryStore::new();
        for seq in [12u32, 10, 11, 14] {
            store.set(seq, format!("msg{seq}").as_bytes()).unwrap();
        }
        let got = store.get(10, 12).unwrap();
        assert_eq!(
            got,
            vec![
                (10, b"msg10".to_vec()),
                (11, b"msg11".to_vec()),
                (12, b"msg12".to_vec()),
            ]
        );
    }

    #[test]
    fn test_reset_returns_to_initial_state() {
        let mut store = MemoryStore::new();
        store.set(1, b"x").unwrap();
        store.incr_next_sender_msg_seq_num().unwrap();
        store.set_next_target_msg_seq_num(9).unwrap();
        let before = store.creation_time();
        store.reset().unwrap();
        assert_eq!(store.next_sender_msg_seq_num(), 1);
        assert_eq!(store.next_target_msg_seq_num(), 1);
        assert!(store.get(1, 100).unwrap().is_empty());
        assert!(store.creation_time() >= before);
    }
}
