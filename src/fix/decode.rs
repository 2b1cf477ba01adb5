//! Inbound frame scanning.
//!
//! A frame that comes off the wire is a flat run of `tag=value<SOH>` fields.
//! [`parse`] walks the fields and hands each one to a [`ParserCallback`],
//! which decides what to keep. Header and trailer tags are routed separately
//! from body tags so callers can stop early once they have what they need.

use crate::fix::{GarbledMessageType, SessionError};
use anyhow::Result;
use chrono::{DateTime, NaiveDateTime, Utc};
use lazy_static::lazy_static;
use std::collections::BTreeSet;

const TIME_FORMAT_SECONDS: &str = "%Y%m%d-%H:%M:%S";
const TIME_FORMAT_MILLIS: &str = "%Y%m%d-%H:%M:%S%.3f";

lazy_static! {
    static ref HEADER_FIELDS: BTreeSet<u32> = [
        8, 9, 34, 35, 43, 49, 50, 52, 56, 57, 115, 116, 122, 128, 129, 142, 143, 145, 369, 1128,
    ]
    .into_iter()
    .collect();
    static ref TRAILER_FIELDS: BTreeSet<u32> = [89, 93, 10].into_iter().collect();
}

/// Receives the fields of one frame as [`parse`] walks it. Returning
/// `Ok(false)` from any hook stops the walk early.
pub trait ParserCallback<'a> {
    fn header(&mut self, tag: u32, value: &'a [u8]) -> Result<bool, SessionError>;
    fn body(&mut self, tag: u32, value: &'a [u8]) -> Result<bool, SessionError>;
    fn trailer(&mut self, tag: u32, value: &'a [u8]) -> Result<bool, SessionError>;
    fn sequence_num(&self) -> u32;
}

/// A [`ParserCallback`] that keeps nothing.
pub struct NullParserCallback;

impl<'a> ParserCallback<'a> for NullParserCallback {
    fn header(&mut self, _tag: u32, _value: &'a [u8]) -> Result<bool, SessionError> {
        Ok(true)
    }
    fn body(&mut self, _tag: u32, _value: &'a [u8]) -> Result<bool, SessionError> {
        Ok(true)
    }
    fn trailer(&mut self, _tag: u32, _value: &'a [u8]) -> Result<bool, SessionError> {
        Ok(true)
    }
    fn sequence_num(&self) -> u32 {
        0
    }
}

#[derive(PartialEq, Eq, Debug)]
enum FieldState {
    Start,
    InTag,
    SeenEquals,
    InField,
}

/// Walk every `tag=value` field of `msg`, routing each to the callback.
pub fn parse<'a>(
    msg: &'a [u8],
    callbacks: &mut impl ParserCallback<'a>,
) -> Result<(), SessionError> {
    let mut state = FieldState::Start;
    let mut tag: u32 = 0;
    let mut field_start: usize = 0;
    for (i, b) in msg.iter().enumerate() {
        let c = *b as char;
        match (&state, c) {
            (FieldState::Start, '0'..='9') | (FieldState::InTag, '0'..='9') => {
                if state == FieldState::Start {
                    tag = 0;
                } else {
                    tag = tag.saturating_mul(10);
                }
                tag += *b as u32 - '0' as u32;
                state = FieldState::InTag;
            }
            (FieldState::InTag, '=') => {
                field_start = i + 1;
                state = FieldState::SeenEquals;
            }
            (FieldState::SeenEquals, '\x01') | (FieldState::InField, '\x01') => {
                let value = &msg[field_start..i];
                let keep_going = if TRAILER_FIELDS.contains(&tag) {
                    callbacks.trailer(tag, value)?
                } else if HEADER_FIELDS.contains(&tag) {
                    callbacks.header(tag, value)?
                } else {
                    callbacks.body(tag, value)?
                };
                if !keep_going {
                    return Ok(());
                }
                state = FieldState::Start;
            }
            (FieldState::SeenEquals, _) | (FieldState::InField, _) => {
                state = FieldState::InField;
            }
            _ => {
                return Err(SessionError::GarbledMessage {
                    text: format!("invalid character {c:?} at offset {i}"),
                    garbled_msg_type: GarbledMessageType::Other,
                });
            }
        }
    }
    Ok(())
}

/// What a peek at the first bytes of a frame reveals. `msg_length` is the
/// complete frame length implied by BodyLength(9); `fixed_fields_end` is the
/// offset just past the `35=X<SOH>` field.
pub(super) struct FramePrefix<'a> {
    pub begin_string: &'a [u8],
    pub msg_type: char,
    pub msg_length: usize,
    pub len_start: usize,
    pub len_end: usize,
    pub fixed_fields_end: usize,
}

/// Parses `8=<BeginString><SOH>9=<len><SOH>35=<type><SOH>` from a peeked
/// prefix. The BeginString is not validated here; the session compares it
/// against its own and treats mismatches as an unsupported version.
pub(super) fn parse_frame_prefix(peeked: &[u8]) -> Result<FramePrefix<'_>, SessionError> {
    if peeked.len() < 2 || &peeked[..2] != b"8=" {
        return Err(SessionError::new_garbled_message(
            String::from("BeginString not first"),
            GarbledMessageType::BeginStringIssue,
        ));
    }
    let begin_string_end = peeked
        .iter()
        .position(|b| *b == b'\x01')
        .ok_or_else(|| {
            SessionError::new_garbled_message(
                String::from("BeginString unterminated"),
                GarbledMessageType::BeginStringIssue,
            )
        })?;
    let begin_string = &peeked[2..begin_string_end];

    let len_tag_at = begin_string_end + 1;
    if peeked.len() < len_tag_at + 2 || &peeked[len_tag_at..len_tag_at + 2] != b"9=" {
        return Err(SessionError::new_garbled_message(
            String::from("BodyLength not second"),
            GarbledMessageType::BodyLengthIssue,
        ));
    }
    let len_start = len_tag_at + 2;
    let mut body_length: usize = 0;
    let mut len_end = len_start;
    let mut saw_end = false;
    for b in &peeked[len_start..] {
        match *b as char {
            '0'..='9' => {
                body_length = body_length
                    .checked_mul(10)
                    .and_then(|n| n.checked_add((b - b'0') as usize))
                    .ok_or_else(|| {
                        SessionError::new_garbled_message(
                            String::from("BodyLength too large"),
                            GarbledMessageType::BodyLengthIssue,
                        )
                    })?;
                len_end += 1;
            }
            '\x01' => {
                saw_end = true;
                break;
            }
            _ => {
                return Err(SessionError::new_garbled_message(
                    String::from("Illegal character in BodyLength"),
                    GarbledMessageType::BodyLengthIssue,
                ));
            }
        }
    }
    if !saw_end || len_end == len_start {
        return Err(SessionError::new_garbled_message(
            String::from("BodyLength unterminated"),
            GarbledMessageType::BodyLengthIssue,
        ));
    }

    let type_at = len_end + 1;
    let msg_type = if peeked.len() >= type_at + 5
        && &peeked[type_at..type_at + 3] == b"35="
        && peeked[type_at + 4] == b'\x01'
    {
        peeked[type_at + 3] as char
    } else {
        return Err(SessionError::new_garbled_message(
            String::from("Missing MsgType"),
            GarbledMessageType::MsgTypeIssue,
        ));
    };
    let fixed_fields_end = type_at + 5;

    // BodyLength counts from the byte after its own SOH up to and including
    // the SOH before the checksum; the trailer 10=NNN| is 7 bytes.
    let msg_length = type_at + body_length + 7;

    Ok(FramePrefix {
        begin_string,
        msg_type,
        msg_length,
        len_start,
        len_end,
        fixed_fields_end,
    })
}

/// Parses a FIX value into any [`FromStr`](std::str::FromStr) type.
pub fn parse_field<T>(field: &[u8]) -> Result<T>
where
    T: std::str::FromStr,
    <T as std::str::FromStr>::Err: std::fmt::Debug,
{
    std::str::from_utf8(field)?
        .parse::<T>()
        .map_err(|e| anyhow::anyhow!("{e:?}"))
}

/// Parses a UTCTimestamp value, with or without milliseconds.
pub(super) fn parse_timestamp(bytes: &[u8]) -> Result<DateTime<Utc>> {
    let s = std::str::from_utf8(bytes)?;
    let naive = NaiveDateTime::parse_from_str(s, TIME_FORMAT_MILLIS)
        .or_else(|_| NaiveDateTime::parse_from_str(s, TIME_FORMAT_SECONDS))?;
    Ok(naive.and_utc())
}

#[cfg(test)]
mod test {
    use super::*;

    #[derive(Default)]
    struct CollectAll {
        fields: Vec<(u32, Vec<u8>)>,
    }

    impl<'a> ParserCallback<'a> for CollectAll {
        fn header(&mut self, tag: u32, value: &'a [u8]) -> Result<bool, SessionError> {
            self.fields.push((tag, value.to_vec()));
            Ok(true)
        }
        fn body(&mut self, tag: u32, value: &'a [u8]) -> Result<bool, SessionError> {
            self.fields.push((tag, value.to_vec()));
            Ok(true)
        }
        fn trailer(&mut self, tag: u32, value: &'a [u8]) -> Result<bool, SessionError> {
            self.fields.push((tag, value.to_vec()));
            Ok(true)
        }
        fn sequence_num(&self) -> u32 {
            0
        }
    }

    #[test]
    fn test_parse_walks_all_fields() {
        let msg = b"8=FIX.4.2\x019=20\x0135=0\x0134=7\x01112=abc\x0110=111\x01";
        let mut cb = CollectAll::default();
        parse(&msg[..], &mut cb).unwrap();
        let tags: Vec<u32> = cb.fields.iter().map(|(t, _)| *t).collect();
        assert_eq!(tags, vec![8, 9, 35, 34, 112, 10]);
        assert_eq!(cb.fields[4].1, b"abc");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        let mut cb = NullParserCallback;
        assert!(parse(&b"not a fix message"[..], &mut cb).is_err());
    }

    #[test]
    fn test_frame_prefix() {
        let msg = b"8=FIX.4.4\x019=57\x0135=A\x0134=1\x01";
        let prefix = parse_frame_prefix(&msg[..]).unwrap();
        assert_eq!(prefix.begin_string, b"FIX.4.4");
        assert_eq!(prefix.msg_type, 'A');
        // 17 bytes before the first counted byte, 57 counted, 7 trailer
        assert_eq!(prefix.msg_length, 17 + 57 + 7);
        assert_eq!(&msg[prefix.len_start..prefix.len_end], b"57");
        assert_eq!(prefix.fixed_fields_end, 22);
    }

    #[test]
    fn test_frame_prefix_errors() {
        assert!(parse_frame_prefix(b"9=12\x01").is_err());
        assert!(parse_frame_prefix(b"8=FIX.4.2\x0135=A\x01").is_err());
        assert!(parse_frame_prefix(b"8=FIX.4.2\x019=99999999999999999999\x01").is_err());
        assert!(parse_frame_prefix(b"8=FIX.4.2\x019=1a\x01").is_err());
        assert!(parse_frame_prefix(b"8=FIX.4.2\x019=12\x0149=X\x01").is_err());
    }

    #[test]
    fn test_parse_timestamp_formats() {
        assert!(parse_timestamp(b"20240506-13:59:15.021").is_ok());
        assert!(parse_timestamp(b"20240506-13:59:15").is_ok());
        assert!(parse_timestamp(b"2024-05-06 13:59").is_err());
    }

    #[test]
    fn test_parse_field() {
        assert_eq!(parse_field::<u32>(b"42").unwrap(), 42);
        assert!(parse_field::<u32>(b"4x").is_err());
    }
}
