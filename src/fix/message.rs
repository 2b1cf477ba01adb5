//! The session layer's parsed view of one inbound frame.

use crate::fix::decode::{self, parse_field, parse_timestamp, ParserCallback};
use crate::fix::fields::{is_session_message, MsgType, SessionRejectReason, Tags};
use crate::fix::mem::MsgBuf;
use crate::fix::SessionError;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Every header and admin-body field the session state machine consumes,
/// copied out of the raw frame. Application bodies are not parsed here; they
/// travel to the application as raw bytes.
#[derive(Debug)]
pub(crate) struct InboundMessage {
    pub raw: Arc<MsgBuf>,
    pub begin_string: Vec<u8>,
    pub msg_type: char,
    pub msg_seq_num: u32,
    pub sender_comp_id: Vec<u8>,
    pub target_comp_id: Vec<u8>,
    pub poss_dup: bool,
    pub sending_time: Option<DateTime<Utc>>,
    pub orig_sending_time: Option<DateTime<Utc>>,
    pub encrypt_method: Option<u32>,
    pub heart_bt_int: Option<u32>,
    pub reset_seq_num_flag: bool,
    pub next_expected_msg_seq_num: Option<u32>,
    pub test_req_id: Option<Vec<u8>>,
    pub begin_seq_no: Option<u32>,
    pub end_seq_no: Option<u32>,
    pub gap_fill_flag: bool,
    pub new_seq_no: Option<u32>,
    pub text: Option<String>,
}

impl InboundMessage {
    pub(crate) fn parse(
        raw: Arc<MsgBuf>,
        allow_unknown_fields: bool,
    ) -> Result<InboundMessage, SessionError> {
        let mut collector = Collector {
            allow_unknown_fields,
            ..Default::default()
        };
        decode::parse(&raw[..], &mut collector)?;

        if !collector.saw_msg_seq_num {
            return Err(SessionError::MissingMsgSeqNum {
                text: String::from("Missing MsgSeqNum"),
            });
        }
        let msg_type = collector.msg_type.ok_or_else(|| {
            SessionError::new_message_rejected(
                Some(SessionRejectReason::INVALID_MSGTYPE),
                collector.msg_seq_num,
                Some(Tags::MsgType.into()),
                None,
            )
        })?;

        Ok(InboundMessage {
            raw,
            begin_string: collector.begin_string,
            msg_type,
            msg_seq_num: collector.msg_seq_num,
            sender_comp_id: collector.sender_comp_id,
            target_comp_id: collector.target_comp_id,
            poss_dup: collector.poss_dup,
            sending_time: collector.sending_time,
            orig_sending_time: collector.orig_sending_time,
            encrypt_method: collector.encrypt_method,
            heart_bt_int: collector.heart_bt_int,
            reset_seq_num_flag: collector.reset_seq_num_flag,
            next_expected_msg_seq_num: collector.next_expected_msg_seq_num,
            test_req_id: collector.test_req_id,
            begin_seq_no: collector.begin_seq_no,
            end_seq_no: collector.end_seq_no,
            gap_fill_flag: collector.gap_fill_flag,
            new_seq_no: collector.new_seq_no,
            text: collector.text,
        })
    }

    pub(crate) fn admin_msg_type(&self) -> Option<MsgType> {
        if is_session_message(self.msg_type) {
            MsgType::try_from(self.msg_type).ok()
        } else {
            None
        }
    }

    pub(crate) fn is_admin(&self) -> bool {
        is_session_message(self.msg_type)
    }
}

#[derive(Default)]
struct Collector {
    allow_unknown_fields: bool,
    saw_msg_seq_num: bool,
    begin_string: Vec<u8>,
    msg_type: Option<char>,
    msg_seq_num: u32,
    sender_comp_id: Vec<u8>,
    target_comp_id: Vec<u8>,
    poss_dup: bool,
    sending_time: Option<DateTime<Utc>>,
    orig_sending_time: Option<DateTime<Utc>>,
    encrypt_method: Option<u32>,
    heart_bt_int: Option<u32>,
    reset_seq_num_flag: bool,
    next_expected_msg_seq_num: Option<u32>,
    test_req_id: Option<Vec<u8>>,
    begin_seq_no: Option<u32>,
    end_seq_no: Option<u32>,
    gap_fill_flag: bool,
    new_seq_no: Option<u32>,
    text: Option<String>,
}

impl Collector {
    fn reject(&self, reason: SessionRejectReason, tag: Tags) -> SessionError {
        SessionError::new_message_rejected(
            Some(reason),
            self.msg_seq_num,
            Some(tag.into()),
            self.msg_type,
        )
    }

    fn parse_u32(&self, value: &[u8], tag: Tags) -> Result<u32, SessionError> {
        parse_field::<u32>(value)
            .map_err(|_| self.reject(SessionRejectReason::INCORRECT_DATA_FORMAT_FOR_VALUE, tag))
    }

    fn parse_flag(&self, value: &[u8], tag: Tags) -> Result<bool, SessionError> {
        match value {
            b"Y" => Ok(true),
            b"N" => Ok(false),
            _ => Err(self.reject(SessionRejectReason::VALUE_IS_INCORRECT, tag)),
        }
    }

    fn parse_time(&self, value: &[u8], tag: Tags) -> Result<DateTime<Utc>, SessionError> {
        parse_timestamp(value)
            .map_err(|_| self.reject(SessionRejectReason::INCORRECT_DATA_FORMAT_FOR_VALUE, tag))
    }
}

impl<'a> ParserCallback<'a> for Collector {
    fn header(&mut self, tag: u32, value: &'a [u8]) -> Result<bool, SessionError> {
        match tag.try_into() {
            Ok(Tags::BeginString) => self.begin_string = value.to_vec(),
            Ok(Tags::MsgType) => {
                if value.len() == 1 {
                    self.msg_type = Some(value[0] as char);
                } else {
                    return Err(self.reject(SessionRejectReason::INVALID_MSGTYPE, Tags::MsgType));
                }
            }
            Ok(Tags::MsgSeqNum) => {
                self.msg_seq_num = parse_field::<u32>(value).map_err(|_| {
                    SessionError::MissingMsgSeqNum {
                        text: String::from("Missing MsgSeqNum"),
                    }
                })?;
                self.saw_msg_seq_num = true;
            }
            Ok(Tags::SenderCompID) => self.sender_comp_id = value.to_vec(),
            Ok(Tags::TargetCompID) => self.target_comp_id = value.to_vec(),
            Ok(Tags::PossDupFlag) => {
                self.poss_dup = self.parse_flag(value, Tags::PossDupFlag)?;
            }
            Ok(Tags::SendingTime) => {
                self.sending_time = Some(self.parse_time(value, Tags::SendingTime)?);
            }
            Ok(Tags::OrigSendingTime) => {
                self.orig_sending_time = Some(self.parse_time(value, Tags::OrigSendingTime)?);
            }
            _ => (),
        }
        Ok(true)
    }

    fn body(&mut self, tag: u32, value: &'a [u8]) -> Result<bool, SessionError> {
        let msg_type = self.msg_type.unwrap_or('\0');
        if !is_session_message(msg_type) {
            // Application bodies are the application's business.
            return Ok(false);
        }
        match tag.try_into() {
            Ok(Tags::EncryptMethod) => {
                self.encrypt_method = Some(self.parse_u32(value, Tags::EncryptMethod)?);
            }
            Ok(Tags::HeartBtInt) => {
                self.heart_bt_int = Some(self.parse_u32(value, Tags::HeartBtInt)?);
            }
            Ok(Tags::ResetSeqNumFlag) => {
                self.reset_seq_num_flag = self.parse_flag(value, Tags::ResetSeqNumFlag)?;
            }
            Ok(Tags::NextExpectedMsgSeqNum) => {
                self.next_expected_msg_seq_num =
                    Some(self.parse_u32(value, Tags::NextExpectedMsgSeqNum)?);
            }
            Ok(Tags::TestReqID) => self.test_req_id = Some(value.to_vec()),
            Ok(Tags::BeginSeqNo) => {
                self.begin_seq_no = Some(self.parse_u32(value, Tags::BeginSeqNo)?);
            }
            Ok(Tags::EndSeqNo) => {
                self.end_seq_no = Some(self.parse_u32(value, Tags::EndSeqNo)?);
            }
            Ok(Tags::GapFillFlag) => {
                self.gap_fill_flag = self.parse_flag(value, Tags::GapFillFlag)?;
            }
            Ok(Tags::NewSeqNo) => {
                self.new_seq_no = Some(self.parse_u32(value, Tags::NewSeqNo)?);
            }
            Ok(Tags::Text) => {
                self.text = Some(String::from_utf8_lossy(value).into_owned());
            }
            _ => {
                if !self.allow_unknown_fields {
                    return Err(SessionError::new_message_rejected(
                        Some(SessionRejectReason::UNDEFINED_TAG),
                        self.msg_seq_num,
                        Some(tag),
                        self.msg_type,
                    ));
                }
            }
        }
        Ok(true)
    }

    fn trailer(&mut self, _tag: u32, _value: &'a [u8]) -> Result<bool, SessionError> {
        Ok(true)
    }

    fn sequence_num(&self) -> u32 {
        self.msg_seq_num
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn parse(raw: &[u8]) -> Result<InboundMessage, SessionError> {
        InboundMessage::parse(Arc::new(raw.into()), true)
    }

    #[test]
    fn test_parse_logon() {
        let msg = parse(
            b"8=FIX.4.2\x019=77\x0135=A\x0134=1\x0149=CLIENT\x0152=20220920-17:01:58.896\x0156=SERVER\x0198=0\x01108=30\x01141=Y\x0110=126\x01",
        )
        .unwrap();
        assert_eq!(msg.msg_type, 'A');
        assert_eq!(msg.admin_msg_type(), Some(MsgType::LOGON));
        assert_eq!(msg.msg_seq_num, 1);
        assert_eq!(msg.sender_comp_id, b"CLIENT");
        assert_eq!(msg.target_comp_id, b"SERVER");
        assert_eq!(msg.encrypt_method, Some(0));
        assert_eq!(msg.heart_bt_int, Some(30));
        assert!(msg.reset_seq_num_flag);
        assert!(!msg.poss_dup);
    }

    #[test]
    fn test_parse_resend_request() {
        let msg = parse(
            b"8=FIX.4.2\x019=40\x0135=2\x0134=8\x0149=A\x0152=20220920-17:01:58\x0156=B\x017=5\x0116=0\x0110=000\x01",
        )
        .unwrap();
        assert_eq!(msg.begin_seq_no, Some(5));
        assert_eq!(msg.end_seq_no, Some(0));
    }

    #[test]
    fn test_application_body_not_parsed() {
        let msg = parse(
            b"8=FIX.4.2\x019=60\x0135=D\x0134=3\x0149=A\x0152=20220920-17:01:58\x0156=B\x0111=ORDER1\x0155=SYM\x0110=000\x01",
        )
        .unwrap();
        assert!(!msg.is_admin());
        assert_eq!(msg.admin_msg_type(), None);
        assert_eq!(msg.text, None);
    }

    #[test]
    fn test_missing_msg_seq_num() {
        let err = parse(
            b"8=FIX.4.2\x019=30\x0135=0\x0149=A\x0152=20220920-17:01:58\x0156=B\x0110=000\x01",
        )
        .unwrap_err();
        assert!(matches!(err, SessionError::MissingMsgSeqNum { .. }));
    }

    #[test]
    fn test_bad_flag_value() {
        let err = parse(
            b"8=FIX.4.2\x019=40\x0135=4\x0134=2\x0149=A\x0152=20220920-17:01:58\x0156=B\x01123=X\x0136=5\x0110=000\x01",
        )
        .unwrap_err();
        assert!(matches!(
            err,
            SessionError::MessageRejected {
                reject_reason: Some(SessionRejectReason::VALUE_IS_INCORRECT),
                ..
            }
        ));
    }

    #[test]
    fn test_unknown_admin_field_rejected_when_strict() {
        let raw: Arc<MsgBuf> = Arc::new(
            b"8=FIX.4.2\x019=40\x0135=0\x0134=2\x0149=A\x0152=20220920-17:01:58\x0156=B\x019999=x\x0110=000\x01"
                .as_slice()
                .into(),
        );
        assert!(InboundMessage::parse(Arc::clone(&raw), true).is_ok());
        let err = InboundMessage::parse(raw, false).unwrap_err();
        assert!(matches!(
            err,
            SessionError::MessageRejected {
                reject_reason: Some(SessionRejectReason::UNDEFINED_TAG),
                ..
            }
        ));
    }

    #[test]
    fn test_poss_dup_with_orig_sending_time() {
        let msg = parse(
            b"8=FIX.4.2\x019=70\x0135=D\x0134=15\x0143=Y\x0149=A\x0152=20220920-17:01:58\x01122=20220920-17:00:00\x0156=B\x0111=X\x0110=000\x01",
        )
        .unwrap();
        assert!(msg.poss_dup);
        assert!(msg.orig_sending_time.unwrap() < msg.sending_time.unwrap());
    }
}
