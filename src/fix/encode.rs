//! Outbound message building.
//!
//! A [`MessageBuilder`] accumulates body fields for one message. The session's
//! send pipeline owns the header: comp IDs come from the session identity, the
//! sequence number is assigned under the sender-sequence critical section, and
//! SendingTime is stamped at render time. Because rendering happens inside
//! that critical section it is fully synchronous.
//!
//! ## Example
//! ```rust
//! use quayfix::fix::encode::MessageBuilder;
//! use quayfix::fix::fields::Tags;
//!
//! let builder = MessageBuilder::new("FIX.4.2", 'D')
//!     .push(Tags::Text, b"hello")
//!     .push_int(38u32, 250);
//! assert_eq!(builder.msg_type(), 'D');
//! ```

use crate::fix::checksum::render_trailer;
use crate::fix::fields::Tags;
use crate::fix::mem::MsgBuf;
use crate::fix::session_id::SessionId;
use chrono::{DateTime, Utc};

pub(super) const SOH: u8 = b'\x01';

/// UTCTimestamp with milliseconds, in [chrono format syntax].
///
/// [chrono format syntax]: https://docs.rs/chrono/latest/chrono/format/strftime/index.html
pub const TIME_FORMAT_MILLIS: &str = "%Y%m%d-%H:%M:%S%.3f";
/// UTCTimestamp with whole seconds only (pre-FIX.4.2 dialects).
pub const TIME_FORMAT_SECONDS: &str = "%Y%m%d-%H:%M:%S";

/// Builds the body of one outbound message.
///
/// Do not push any of the fields the send pipeline stamps itself:
/// `BodyLength(9)`, `MsgSeqNum(34)`, `SenderCompID(49)`, `TargetCompID(56)`,
/// `SendingTime(52)`, `CheckSum(10)` or the sub/location IDs configured on
/// the session. Values are not validated against a dictionary.
#[derive(Debug)]
pub struct MessageBuilder {
    begin_string: String,
    msg_type: char,
    body: Vec<u8>,
}

impl MessageBuilder {
    pub fn new(begin_string: &str, msg_type: char) -> MessageBuilder {
        MessageBuilder {
            begin_string: begin_string.to_owned(),
            msg_type,
            body: Vec::with_capacity(256),
        }
    }

    /// Appends `tag=value`.
    pub fn push(mut self, tag: impl Into<u32>, value: &[u8]) -> Self {
        self.push_mut(tag, value);
        self
    }

    pub fn push_mut(&mut self, tag: impl Into<u32>, value: &[u8]) {
        let mut itoa_buf = itoa::Buffer::new();
        self.body
            .extend_from_slice(itoa_buf.format(tag.into()).as_bytes());
        self.body.push(b'=');
        self.body.extend_from_slice(value);
        self.body.push(SOH);
    }

    /// Appends `tag=value` for an integer value.
    pub fn push_int(self, tag: impl Into<u32>, value: u32) -> Self {
        let mut itoa_buf = itoa::Buffer::new();
        let rendered = itoa_buf.format(value);
        self.push(tag, rendered.as_bytes())
    }

    /// Appends `tag=value` for a single-character value.
    pub fn push_char(self, tag: impl Into<u32>, value: char) -> Self {
        self.push(tag, &[value as u8])
    }

    pub fn msg_type(&self) -> char {
        self.msg_type
    }

    pub fn begin_string(&self) -> &str {
        &self.begin_string
    }

    /// Renders the complete frame. The header layout is
    /// `8=..|9=..|35=..|34=seq|<prefix>|52=..|<suffix>|[369=n|]<body>|10=..|`.
    pub(super) fn build(
        &self,
        msg_seq_num: u32,
        stamp: &HeaderStamp,
        sending_time: DateTime<Utc>,
        millis: bool,
        last_msg_seq_num_processed: Option<u32>,
    ) -> MsgBuf {
        let mut itoa_buf = itoa::Buffer::new();

        let format = if millis {
            TIME_FORMAT_MILLIS
        } else {
            TIME_FORMAT_SECONDS
        };
        let sending_time_field = format!(
            "{}={}\x01",
            u32::from(Tags::SendingTime),
            sending_time.format(format)
        );

        let mut counted = Vec::with_capacity(self.body.len() + 128);
        counted.extend_from_slice(b"35=");
        counted.push(self.msg_type as u8);
        counted.push(SOH);
        counted.extend_from_slice(b"34=");
        counted.extend_from_slice(itoa_buf.format(msg_seq_num).as_bytes());
        counted.push(SOH);
        counted.extend_from_slice(&stamp.prefix);
        counted.extend_from_slice(sending_time_field.as_bytes());
        counted.extend_from_slice(&stamp.suffix);
        if let Some(n) = last_msg_seq_num_processed {
            counted.extend_from_slice(b"369=");
            counted.extend_from_slice(itoa_buf.format(n).as_bytes());
            counted.push(SOH);
        }
        counted.extend_from_slice(&self.body);

        let mut frame = Vec::with_capacity(counted.len() + 32);
        frame.extend_from_slice(b"8=");
        frame.extend_from_slice(self.begin_string.as_bytes());
        frame.push(SOH);
        frame.extend_from_slice(b"9=");
        frame.extend_from_slice(itoa_buf.format(counted.len()).as_bytes());
        frame.push(SOH);
        frame.extend_from_slice(&counted);
        let trailer = render_trailer(&frame);
        frame.extend_from_slice(&trailer);
        frame.into()
    }
}

/// The identity fields stamped into every outbound header, pre-rendered and
/// split into the runs that go before and after SendingTime(52).
#[derive(Debug, Default)]
pub(super) struct HeaderStamp {
    prefix: Vec<u8>,
    suffix: Vec<u8>,
}

impl HeaderStamp {
    pub(super) fn new(fields: Vec<(u32, Vec<u8>)>) -> HeaderStamp {
        let mut prefix = Vec::new();
        let mut suffix = Vec::new();
        let mut itoa_buf = itoa::Buffer::new();
        for (tag, value) in fields {
            let out = if tag < u32::from(Tags::SendingTime) {
                &mut prefix
            } else {
                &mut suffix
            };
            out.extend_from_slice(itoa_buf.format(tag).as_bytes());
            out.push(b'=');
            out.extend_from_slice(&value);
            out.push(SOH);
        }
        HeaderStamp { prefix, suffix }
    }

    pub(super) fn from_session_id(session_id: &SessionId) -> HeaderStamp {
        let mut fields = vec![(
            u32::from(Tags::SenderCompID),
            session_id.sender_comp_id().as_bytes().to_vec(),
        )];
        if let Some(sub) = session_id.sender_sub_id() {
            fields.push((u32::from(Tags::SenderSubID), sub.as_bytes().to_vec()));
        }
        fields.push((
            u32::from(Tags::TargetCompID),
            session_id.target_comp_id().as_bytes().to_vec(),
        ));
        if let Some(sub) = session_id.target_sub_id() {
            fields.push((u32::from(Tags::TargetSubID), sub.as_bytes().to_vec()));
        }
        if let Some(loc) = session_id.sender_location_id() {
            fields.push((u32::from(Tags::SenderLocationID), loc.as_bytes().to_vec()));
        }
        if let Some(loc) = session_id.target_location_id() {
            fields.push((u32::from(Tags::TargetLocationID), loc.as_bytes().to_vec()));
        }
        HeaderStamp::new(fields)
    }
}

/// The current time rendered in [`TIME_FORMAT_MILLIS`].
pub fn formatted_time() -> String {
    format!("{}", Utc::now().format(TIME_FORMAT_MILLIS))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fix::checksum::checksum_is_valid;

    fn stamp() -> HeaderStamp {
        HeaderStamp::new(vec![
            (49, b"SENDER".to_vec()),
            (56, b"TARGET".to_vec()),
        ])
    }

    #[test]
    fn test_build_layout() {
        let builder = MessageBuilder::new("FIX.4.2", '0');
        let frame = builder.build(7, &stamp(), std::time::UNIX_EPOCH.into(), true, None);
        let rendered = format!("{:?}", frame);
        assert!(rendered
            .starts_with("8=FIX.4.2|9=55|35=0|34=7|49=SENDER|52=19700101-00:00:00.000|56=TARGET|10="));
        assert!(checksum_is_valid(&frame.0));
    }

    #[test]
    fn test_build_without_millis() {
        let builder = MessageBuilder::new("FIX.4.0", '0');
        let frame = builder.build(1, &stamp(), std::time::UNIX_EPOCH.into(), false, None);
        assert!(format!("{:?}", frame).contains("52=19700101-00:00:00|"));
    }

    #[test]
    fn test_last_msg_seq_num_processed_tag() {
        let builder = MessageBuilder::new("FIX.4.2", '0');
        let frame = builder.build(1, &stamp(), std::time::UNIX_EPOCH.into(), true, Some(41));
        assert!(format!("{:?}", frame).contains("|369=41|"));
        assert!(checksum_is_valid(&frame.0));
    }

    #[test]
    fn test_body_fields_follow_header() {
        let builder = MessageBuilder::new("FIX.4.2", '1').push(Tags::TestReqID, b"PING");
        let frame = builder.build(3, &stamp(), std::time::UNIX_EPOCH.into(), true, None);
        let rendered = format!("{:?}", frame);
        assert!(rendered.contains("|112=PING|10="));
    }

    #[test]
    fn test_stamp_splits_around_sending_time() {
        let id = SessionId::builder("FIX.4.2", "S", "T")
            .sender_sub_id("SS")
            .target_location_id("TL")
            .build();
        let stamp = HeaderStamp::from_session_id(&id);
        assert_eq!(stamp.prefix, b"49=S\x0150=SS\x01".to_vec());
        assert_eq!(stamp.suffix, b"56=T\x01143=TL\x01".to_vec());
    }
}
