#![allow(non_camel_case_types)]

//! The static protocol table: tags, message types and enumerated values the
//! session layer depends on.

/// Tags the session layer reads or writes. Application-level tags pass
/// through opaquely and are not enumerated here.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Tags {
    BeginSeqNo = 7,
    BeginString = 8,
    BodyLength = 9,
    CheckSum = 10,
    EndSeqNo = 16,
    MsgSeqNum = 34,
    MsgType = 35,
    NewSeqNo = 36,
    PossDupFlag = 43,
    RefSeqNum = 45,
    SenderCompID = 49,
    SenderSubID = 50,
    SendingTime = 52,
    TargetCompID = 56,
    TargetSubID = 57,
    Text = 58,
    EncryptMethod = 98,
    HeartBtInt = 108,
    TestReqID = 112,
    OrigSendingTime = 122,
    GapFillFlag = 123,
    ResetSeqNumFlag = 141,
    SenderLocationID = 142,
    TargetLocationID = 143,
    LastMsgSeqNumProcessed = 369,
    RefTagID = 371,
    RefMsgType = 372,
    SessionRejectReason = 373,
    BusinessRejectReason = 380,
    NextExpectedMsgSeqNum = 789,
    ApplVerID = 1128,
    DefaultApplVerID = 1137,
}

impl From<Tags> for u32 {
    fn from(t: Tags) -> u32 {
        t as u32
    }
}

impl TryFrom<u32> for Tags {
    type Error = u32;
    fn try_from(v: u32) -> Result<Tags, u32> {
        use Tags::*;
        Ok(match v {
            7 => BeginSeqNo,
            8 => BeginString,
            9 => BodyLength,
            10 => CheckSum,
            16 => EndSeqNo,
            34 => MsgSeqNum,
            35 => MsgType,
            36 => NewSeqNo,
            43 => PossDupFlag,
            45 => RefSeqNum,
            49 => SenderCompID,
            50 => SenderSubID,
            52 => SendingTime,
            56 => TargetCompID,
            57 => TargetSubID,
            58 => Text,
            98 => EncryptMethod,
            108 => HeartBtInt,
            112 => TestReqID,
            122 => OrigSendingTime,
            123 => GapFillFlag,
            141 => ResetSeqNumFlag,
            142 => SenderLocationID,
            143 => TargetLocationID,
            369 => LastMsgSeqNumProcessed,
            371 => RefTagID,
            372 => RefMsgType,
            373 => SessionRejectReason,
            380 => BusinessRejectReason,
            789 => NextExpectedMsgSeqNum,
            1128 => ApplVerID,
            1137 => DefaultApplVerID,
            other => return Err(other),
        })
    }
}

pub fn is_session_message(msg_type: char) -> bool {
    matches!(msg_type, '0' | '1' | '2' | '3' | '4' | '5' | 'A')
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MsgType {
    HEARTBEAT,
    TEST_REQUEST,
    RESEND_REQUEST,
    REJECT,
    SEQUENCE_RESET,
    LOGOUT,
    LOGON,
    BUSINESS_MESSAGE_REJECT,
}

impl MsgType {
    pub fn is_session(&self) -> bool {
        !matches!(self, MsgType::BUSINESS_MESSAGE_REJECT)
    }
}

impl From<MsgType> for char {
    fn from(m: MsgType) -> char {
        match m {
            MsgType::HEARTBEAT => '0',
            MsgType::TEST_REQUEST => '1',
            MsgType::RESEND_REQUEST => '2',
            MsgType::REJECT => '3',
            MsgType::SEQUENCE_RESET => '4',
            MsgType::LOGOUT => '5',
            MsgType::LOGON => 'A',
            MsgType::BUSINESS_MESSAGE_REJECT => 'j',
        }
    }
}

impl TryFrom<char> for MsgType {
    type Error = char;
    fn try_from(c: char) -> Result<MsgType, char> {
        Ok(match c {
            '0' => MsgType::HEARTBEAT,
            '1' => MsgType::TEST_REQUEST,
            '2' => MsgType::RESEND_REQUEST,
            '3' => MsgType::REJECT,
            '4' => MsgType::SEQUENCE_RESET,
            '5' => MsgType::LOGOUT,
            'A' => MsgType::LOGON,
            'j' => MsgType::BUSINESS_MESSAGE_REJECT,
            other => return Err(other),
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionRejectReason {
    INVALID_TAG_NUMBER,
    REQUIRED_TAG_MISSING,
    TAG_NOT_DEFINED_FOR_THIS_MESSAGE_TYPE,
    UNDEFINED_TAG,
    TAG_SPECIFIED_WITHOUT_A_VALUE,
    VALUE_IS_INCORRECT,
    INCORRECT_DATA_FORMAT_FOR_VALUE,
    COMPID_PROBLEM,
    SENDINGTIME_ACCURACY_PROBLEM,
    INVALID_MSGTYPE,
}

#[allow(clippy::from_over_into)]
impl Into<u32> for &SessionRejectReason {
    fn into(self) -> u32 {
        match *self {
            SessionRejectReason::INVALID_TAG_NUMBER => 0,
            SessionRejectReason::REQUIRED_TAG_MISSING => 1,
            SessionRejectReason::TAG_NOT_DEFINED_FOR_THIS_MESSAGE_TYPE => 2,
            SessionRejectReason::UNDEFINED_TAG => 3,
            SessionRejectReason::TAG_SPECIFIED_WITHOUT_A_VALUE => 4,
            SessionRejectReason::VALUE_IS_INCORRECT => 5,
            SessionRejectReason::INCORRECT_DATA_FORMAT_FOR_VALUE => 6,
            SessionRejectReason::COMPID_PROBLEM => 9,
            SessionRejectReason::SENDINGTIME_ACCURACY_PROBLEM => 10,
            SessionRejectReason::INVALID_MSGTYPE => 11,
        }
    }
}

#[allow(clippy::from_over_into)]
impl Into<String> for &SessionRejectReason {
    fn into(self) -> String {
        match *self {
            SessionRejectReason::INVALID_TAG_NUMBER => String::from("Invalid tag number"),
            SessionRejectReason::REQUIRED_TAG_MISSING => String::from("Required tag missing"),
            SessionRejectReason::TAG_NOT_DEFINED_FOR_THIS_MESSAGE_TYPE => {
                String::from("Tag not defined for this message type")
            }
            SessionRejectReason::UNDEFINED_TAG => String::from("Undefined tag"),
            SessionRejectReason::TAG_SPECIFIED_WITHOUT_A_VALUE => {
                String::from("Tag specified without a value")
            }
            SessionRejectReason::VALUE_IS_INCORRECT => String::from("Value is incorrect"),
            SessionRejectReason::INCORRECT_DATA_FORMAT_FOR_VALUE => {
                String::from("Incorrect data format for value")
            }
            SessionRejectReason::COMPID_PROBLEM => String::from("CompID problem"),
            SessionRejectReason::SENDINGTIME_ACCURACY_PROBLEM => {
                String::from("SendingTime accuracy problem")
            }
            SessionRejectReason::INVALID_MSGTYPE => String::from("Invalid MsgType"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BusinessRejectReason {
    UNSUPPORTED_MESSAGE_TYPE,
}

#[allow(clippy::from_over_into)]
impl Into<u32> for &BusinessRejectReason {
    fn into(self) -> u32 {
        match *self {
            BusinessRejectReason::UNSUPPORTED_MESSAGE_TYPE => 3,
        }
    }
}

/// BeginString versions the engine speaks. Ordering matters: several
/// behaviors are gated on "FIX.4.2 or newer".
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum FixVersion {
    FIX40,
    FIX41,
    FIX42,
    FIX43,
    FIX44,
    FIXT11,
}

impl FixVersion {
    pub fn as_str(&self) -> &'static str {
        match self {
            FixVersion::FIX40 => "FIX.4.0",
            FixVersion::FIX41 => "FIX.4.1",
            FixVersion::FIX42 => "FIX.4.2",
            FixVersion::FIX43 => "FIX.4.3",
            FixVersion::FIX44 => "FIX.4.4",
            FixVersion::FIXT11 => "FIXT.1.1",
        }
    }

    /// EndSeqNo value meaning "everything you have" on an open-range
    /// ResendRequest. Pre-4.2 dialects used 999999 instead of 0.
    pub fn open_range_sentinel(&self) -> u32 {
        if *self >= FixVersion::FIX42 {
            0
        } else {
            999999
        }
    }

    pub fn supports_milliseconds(&self) -> bool {
        *self >= FixVersion::FIX42
    }

    pub fn supports_business_reject(&self) -> bool {
        *self >= FixVersion::FIX42
    }

    /// SessionRejectReason(373) entered the protocol with FIX.4.2.
    pub fn supports_reject_reason(&self) -> bool {
        *self >= FixVersion::FIX42
    }
}

impl TryFrom<&str> for FixVersion {
    type Error = String;
    fn try_from(s: &str) -> Result<FixVersion, String> {
        Ok(match s {
            "FIX.4.0" => FixVersion::FIX40,
            "FIX.4.1" => FixVersion::FIX41,
            "FIX.4.2" => FixVersion::FIX42,
            "FIX.4.3" => FixVersion::FIX43,
            "FIX.4.4" => FixVersion::FIX44,
            "FIXT.1.1" => FixVersion::FIXT11,
            other => return Err(format!("unsupported BeginString: {other}")),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_msg_type_round_trip() {
        for c in ['0', '1', '2', '3', '4', '5', 'A', 'j'] {
            let m: MsgType = c.try_into().unwrap();
            let back: char = m.into();
            assert_eq!(back, c);
        }
        assert!(MsgType::try_from('D').is_err());
    }

    #[test]
    fn test_session_message_set() {
        assert!(is_session_message('A'));
        assert!(is_session_message('4'));
        assert!(!is_session_message('D'));
        assert!(!is_session_message('8'));
    }

    #[test]
    fn test_version_gates() {
        assert_eq!(FixVersion::FIX42.open_range_sentinel(), 0);
        assert_eq!(FixVersion::FIX41.open_range_sentinel(), 999999);
        assert!(FixVersion::FIXT11.supports_milliseconds());
        assert!(!FixVersion::FIX40.supports_business_reject());
        assert!(FixVersion::try_from("FIX.9.9").is_err());
        assert_eq!(FixVersion::try_from("FIX.4.4").unwrap().as_str(), "FIX.4.4");
    }

    #[test]
    fn test_reject_reason_codes() {
        let r = SessionRejectReason::SENDINGTIME_ACCURACY_PROBLEM;
        let code: u32 = (&r).into();
        assert_eq!(code, 10);
        let r = SessionRejectReason::COMPID_PROBLEM;
        let code: u32 = (&r).into();
        assert_eq!(code, 9);
    }
}
