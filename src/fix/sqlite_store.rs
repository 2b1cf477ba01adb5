//! Durable [`MessageStore`] backed by sqlite.
//!
//! One database file can hold any number of sessions; rows are keyed by the
//! session id string. The connection is synchronous because every store call
//! happens under the owning session's lock.

use crate::fix::store::MessageStore;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

const SQL_ENTER_WAL_MODE: &str = "PRAGMA journal_mode=WAL;";
const SQL_CREATE_SESSIONS: &str = "CREATE TABLE IF NOT EXISTS sessions (
    session_id VARCHAR PRIMARY KEY,
    next_sender INTEGER NOT NULL,
    next_target INTEGER NOT NULL,
    creation_time VARCHAR NOT NULL
);";
const SQL_CREATE_MESSAGES: &str = "CREATE TABLE IF NOT EXISTS messages (
    session_id VARCHAR NOT NULL,
    msg_seq_num INTEGER NOT NULL,
    message BLOB NOT NULL,
    PRIMARY KEY (session_id, msg_seq_num)
);";
const SQL_ENSURE_SESSION_ROW: &str = "INSERT INTO sessions
    (session_id, next_sender, next_target, creation_time)
    SELECT ?1, 1, 1, ?2
    WHERE NOT EXISTS (SELECT * FROM sessions WHERE session_id = ?1);";
const SQL_LOAD_SESSION_ROW: &str =
    "SELECT next_sender, next_target, creation_time FROM sessions WHERE session_id = ?1;";
const SQL_STORE_MESSAGE: &str =
    "INSERT OR REPLACE INTO messages (session_id, msg_seq_num, message) VALUES (?1, ?2, ?3);";
const SQL_FETCH_MESSAGES: &str = "SELECT msg_seq_num, message FROM messages
    WHERE session_id = ?1 AND msg_seq_num BETWEEN ?2 AND ?3 ORDER BY msg_seq_num ASC;";
const SQL_DELETE_MESSAGES: &str = "DELETE FROM messages WHERE session_id = ?1;";
const SQL_UPDATE_SEQUENCES: &str =
    "UPDATE sessions SET next_sender = ?2, next_target = ?3 WHERE session_id = ?1;";
const SQL_UPDATE_CREATION_TIME: &str =
    "UPDATE sessions SET creation_time = ?2 WHERE session_id = ?1;";

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

pub struct SqliteStore {
    conn: Connection,
    session_id: String,
    next_sender: u32,
    next_target: u32,
    creation_time: DateTime<Utc>,
}

impl SqliteStore {
    /// Opens (creating if needed) the database at `path` and loads or creates
    /// the row for `session_id`.
    pub fn open(path: &Path, session_id: &str) -> Result<SqliteStore> {
        let conn = Connection::open(path)
            .with_context(|| format!("opening message store at {}", path.display()))?;
        conn.query_row(SQL_ENTER_WAL_MODE, (), |_| Ok(()))?;
        conn.execute(SQL_CREATE_SESSIONS, ())?;
        conn.execute(SQL_CREATE_MESSAGES, ())?;
        conn.execute(
            SQL_ENSURE_SESSION_ROW,
            (session_id, format!("{}", Utc::now().format(TIME_FORMAT))),
        )?;

        let mut store = SqliteStore {
            conn,
            session_id: session_id.to_owned(),
            next_sender: 1,
            next_target: 1,
            creation_time: Utc::now(),
        };
        store.refresh()?;
        Ok(store)
    }

    fn persist_sequences(&self) -> Result<()> {
        self.conn.execute(
            SQL_UPDATE_SEQUENCES,
            (&self.session_id, self.next_sender, self.next_target),
        )?;
        Ok(())
    }
}

impl MessageStore for SqliteStore {
    fn next_sender_msg_seq_num(&self) -> u32 {
        self.next_sender
    }

    fn next_target_msg_seq_num(&self) -> u32 {
        self.next_target
    }

    fn set_next_sender_msg_seq_num(&mut self, seq_num: u32) -> Result<()> {
        self.next_sender = seq_num;
        self.persist_sequences()
    }

    fn set_next_target_msg_seq_num(&mut self, seq_num: u32) -> Result<()> {
        self.next_target = seq_num;
        self.persist_sequences()
    }

    fn incr_next_sender_msg_seq_num(&mut self) -> Result<()> {
        self.next_sender += 1;
        self.persist_sequences()
    }

    fn incr_next_target_msg_seq_num(&mut self) -> Result<()> {
        self.next_target += 1;
        self.persist_sequences()
    }

    fn get(&self, begin: u32, end: u32) -> Result<Vec<(u32, Vec<u8>)>> {
        let mut stmt = self.conn.prepare(SQL_FETCH_MESSAGES)?;
        let rows = stmt.query_map((&self.session_id, begin, end), |row| {
            Ok((row.get(0)?, row.get(1)?))
        })?;
        let mut output = Vec::new();
        for row in rows {
            output.push(row?);
        }
        Ok(output)
    }

    fn set(&mut self, seq_num: u32, msg: &[u8]) -> Result<()> {
        self.conn
            .execute(SQL_STORE_MESSAGE, (&self.session_id, seq_num, msg))?;
        Ok(())
    }

    fn refresh(&mut self) -> Result<()> {
        let row = self
            .conn
            .query_row(SQL_LOAD_SESSION_ROW, (&self.session_id,), |row| {
                let next_sender: u32 = row.get(0)?;
                let next_target: u32 = row.get(1)?;
                let creation_time: String = row.get(2)?;
                Ok((next_sender, next_target, creation_time))
            })
            .optional()?;
        if let Some((next_sender, next_target, creation_time)) = row {
            self.next_sender = next_sender;
            self.next_target = next_target;
            self.creation_time = chrono::NaiveDateTime::parse_from_str(&creation_time, TIME_FORMAT)
                .with_context(|| format!("bad creation time in store: {creation_time}"))?
                .and_utc();
        }
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        self.next_sender = 1;
        self.next_target = 1;
        self.creation_time = Utc::now();
        self.conn.execute(SQL_DELETE_MESSAGES, (&self.session_id,))?;
        self.persist_sequences()?;
        self.conn.execute(
            SQL_UPDATE_CREATION_TIME,
            (
                &self.session_id,
                format!("{}", self.creation_time.format(TIME_FORMAT)),
            ),
        )?;
        Ok(())
    }

    fn creation_time(&self) -> DateTime<Utc> {
        self.creation_time
    }

    fn close(&mut self) -> Result<()> {
        self.conn.execute_batch("VACUUM;")?;
        Ok(())
    }
}
