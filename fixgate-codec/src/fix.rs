/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! FIX session-message views and builders.
//!
//! [`FixMessage::parse`] extracts the header and session-administration
//! fields from a complete frame as a zero-copy view. The
//! [`SessionMessageEncoder`] builds the admin messages a session emits:
//! Logon, Logout, Heartbeat, TestRequest, ResendRequest, SequenceReset,
//! Reject.

use crate::decoder::Decoder;
use crate::encoder::Encoder;
use bytes::BytesMut;
use fixgate_core::{CompositeKey, DecodeError, Timestamp};

/// FIX tag numbers used by the session layer.
pub mod tags {
    /// BeginString.
    pub const BEGIN_STRING: u32 = 8;
    /// BodyLength.
    pub const BODY_LENGTH: u32 = 9;
    /// CheckSum.
    pub const CHECK_SUM: u32 = 10;
    /// MsgSeqNum.
    pub const MSG_SEQ_NUM: u32 = 34;
    /// MsgType.
    pub const MSG_TYPE: u32 = 35;
    /// NewSeqNo.
    pub const NEW_SEQ_NO: u32 = 36;
    /// PossDupFlag.
    pub const POSS_DUP_FLAG: u32 = 43;
    /// RefSeqNum.
    pub const REF_SEQ_NUM: u32 = 45;
    /// SenderCompID.
    pub const SENDER_COMP_ID: u32 = 49;
    /// SenderSubID.
    pub const SENDER_SUB_ID: u32 = 50;
    /// SendingTime.
    pub const SENDING_TIME: u32 = 52;
    /// TargetCompID.
    pub const TARGET_COMP_ID: u32 = 56;
    /// Text.
    pub const TEXT: u32 = 58;
    /// BeginSeqNo.
    pub const BEGIN_SEQ_NO: u32 = 7;
    /// EndSeqNo.
    pub const END_SEQ_NO: u32 = 16;
    /// HeartBtInt.
    pub const HEART_BT_INT: u32 = 108;
    /// TestReqID.
    pub const TEST_REQ_ID: u32 = 112;
    /// GapFillFlag.
    pub const GAP_FILL_FLAG: u32 = 123;
    /// ResetSeqNumFlag.
    pub const RESET_SEQ_NUM_FLAG: u32 = 141;
    /// SenderLocationID.
    pub const SENDER_LOCATION_ID: u32 = 142;
    /// Username.
    pub const USERNAME: u32 = 553;
    /// Password.
    pub const PASSWORD: u32 = 554;
    /// LastMsgSeqNumProcessed.
    pub const LAST_MSG_SEQ_NUM_PROCESSED: u32 = 369;
}

/// FIX message type, session-administration messages distinguished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FixMsgType {
    /// Heartbeat (0).
    Heartbeat,
    /// TestRequest (1).
    TestRequest,
    /// ResendRequest (2).
    ResendRequest,
    /// Reject (3).
    Reject,
    /// SequenceReset (4).
    SequenceReset,
    /// Logout (5).
    Logout,
    /// Logon (A).
    Logon,
    /// Any non-admin message type.
    Application,
}

impl FixMsgType {
    /// Maps a MsgType field value to a message type.
    #[must_use]
    pub fn from_bytes(value: &[u8]) -> Self {
        match value {
            b"0" => Self::Heartbeat,
            b"1" => Self::TestRequest,
            b"2" => Self::ResendRequest,
            b"3" => Self::Reject,
            b"4" => Self::SequenceReset,
            b"5" => Self::Logout,
            b"A" => Self::Logon,
            _ => Self::Application,
        }
    }

    /// Returns the wire value of an admin message type.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Heartbeat => "0",
            Self::TestRequest => "1",
            Self::ResendRequest => "2",
            Self::Reject => "3",
            Self::SequenceReset => "4",
            Self::Logout => "5",
            Self::Logon => "A",
            Self::Application => "?",
        }
    }

    /// Returns true for session-administration message types.
    #[must_use]
    pub const fn is_admin(self) -> bool {
        !matches!(self, Self::Application)
    }
}

/// Zero-copy view of a decoded FIX frame's session-relevant fields.
#[derive(Debug, Clone)]
pub struct FixMessage<'a> {
    /// The complete frame this view borrows from.
    pub frame: &'a [u8],
    /// Message type.
    pub msg_type: FixMsgType,
    /// MsgSeqNum (tag 34).
    pub msg_seq_num: u64,
    /// PossDupFlag (tag 43).
    pub poss_dup: bool,
    /// SenderCompID (tag 49).
    pub sender_comp_id: &'a [u8],
    /// TargetCompID (tag 56).
    pub target_comp_id: &'a [u8],
    /// SendingTime (tag 52), parsed.
    pub sending_time: Option<Timestamp>,
    /// HeartBtInt (tag 108) on Logon, in seconds.
    pub heart_bt_int: Option<u64>,
    /// ResetSeqNumFlag (tag 141) on Logon.
    pub reset_seq_num: bool,
    /// Username (tag 553) on Logon.
    pub username: Option<&'a [u8]>,
    /// LastMsgSeqNumProcessed (tag 369), when the feature is in use.
    pub last_msg_seq_num_processed: Option<u64>,
    /// TestReqID (tag 112) on TestRequest and its Heartbeat echo.
    pub test_req_id: Option<&'a [u8]>,
    /// BeginSeqNo (tag 7) on ResendRequest.
    pub begin_seq_no: Option<u64>,
    /// EndSeqNo (tag 16) on ResendRequest, 0 meaning infinity.
    pub end_seq_no: Option<u64>,
    /// NewSeqNo (tag 36) on SequenceReset.
    pub new_seq_no: Option<u64>,
    /// GapFillFlag (tag 123) on SequenceReset.
    pub gap_fill: bool,
    /// Text (tag 58).
    pub text: Option<&'a [u8]>,
}

impl<'a> FixMessage<'a> {
    /// Parses a complete FIX frame into a session view.
    ///
    /// The frame must already be length-delimited (the framing codec's
    /// job); this validates header shape and extracts the fields the
    /// session layer acts on.
    ///
    /// # Errors
    /// Returns a `DecodeError` when the header is malformed or a required
    /// header field is missing or unparsable.
    pub fn parse(frame: &'a [u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(frame);

        let begin_string = decoder.next_field().ok_or(DecodeError::Incomplete)?;
        if begin_string.tag != tags::BEGIN_STRING || !begin_string.value.starts_with(b"FIX") {
            return Err(DecodeError::InvalidBeginString);
        }

        let body_length = decoder.next_field().ok_or(DecodeError::MissingBodyLength)?;
        if body_length.tag != tags::BODY_LENGTH {
            return Err(DecodeError::MissingBodyLength);
        }
        body_length
            .as_uint()
            .map_err(|_| DecodeError::InvalidBodyLength)?;

        let msg_type_field = decoder.next_field().ok_or(DecodeError::MissingMsgType)?;
        if msg_type_field.tag != tags::MSG_TYPE {
            return Err(DecodeError::MissingMsgType);
        }

        let mut view = Self {
            frame,
            msg_type: FixMsgType::from_bytes(msg_type_field.value),
            msg_seq_num: 0,
            poss_dup: false,
            sender_comp_id: b"",
            target_comp_id: b"",
            sending_time: None,
            heart_bt_int: None,
            reset_seq_num: false,
            username: None,
            last_msg_seq_num_processed: None,
            test_req_id: None,
            begin_seq_no: None,
            end_seq_no: None,
            new_seq_no: None,
            gap_fill: false,
            text: None,
        };

        let mut saw_seq_num = false;
        for field in decoder {
            match field.tag {
                tags::MSG_SEQ_NUM => {
                    view.msg_seq_num = field.as_uint()?;
                    saw_seq_num = true;
                }
                tags::POSS_DUP_FLAG => view.poss_dup = field.as_bool(),
                tags::SENDER_COMP_ID => view.sender_comp_id = field.value,
                tags::TARGET_COMP_ID => view.target_comp_id = field.value,
                tags::SENDING_TIME => {
                    view.sending_time = Timestamp::parse_fix(field.as_str()?);
                }
                tags::HEART_BT_INT => view.heart_bt_int = Some(field.as_uint()?),
                tags::RESET_SEQ_NUM_FLAG => view.reset_seq_num = field.as_bool(),
                tags::USERNAME => view.username = Some(field.value),
                tags::LAST_MSG_SEQ_NUM_PROCESSED => {
                    view.last_msg_seq_num_processed = Some(field.as_uint()?);
                }
                tags::TEST_REQ_ID => view.test_req_id = Some(field.value),
                tags::BEGIN_SEQ_NO => view.begin_seq_no = Some(field.as_uint()?),
                tags::END_SEQ_NO => view.end_seq_no = Some(field.as_uint()?),
                tags::NEW_SEQ_NO => view.new_seq_no = Some(field.as_uint()?),
                tags::GAP_FILL_FLAG => view.gap_fill = field.as_bool(),
                tags::TEXT => view.text = Some(field.value),
                _ => {}
            }
        }

        if !saw_seq_num {
            return Err(DecodeError::MissingRequiredField {
                tag: tags::MSG_SEQ_NUM,
            });
        }

        Ok(view)
    }
}

/// Builds the session-administration messages for one FIX session.
///
/// Holds the header identity so callers only supply the per-message fields.
#[derive(Debug)]
pub struct SessionMessageEncoder {
    encoder: Encoder,
    key: CompositeKey,
}

impl SessionMessageEncoder {
    /// Creates an encoder for the session identified by `key`.
    #[must_use]
    pub fn new(begin_string: &'static str, key: CompositeKey) -> Self {
        Self {
            encoder: Encoder::new(begin_string),
            key,
        }
    }

    fn header(&mut self, msg_type: FixMsgType, seq_num: u64, sending_time: Timestamp) {
        self.encoder.put_str(tags::MSG_TYPE, msg_type.as_str());
        self.encoder
            .put_str(tags::SENDER_COMP_ID, self.key.sender_comp_id.as_str());
        if let Some(sub) = self.key.sender_sub_id.clone() {
            self.encoder.put_str(tags::SENDER_SUB_ID, sub.as_str());
        }
        if let Some(location) = self.key.sender_location_id.clone() {
            self.encoder
                .put_str(tags::SENDER_LOCATION_ID, location.as_str());
        }
        self.encoder
            .put_str(tags::TARGET_COMP_ID, self.key.target_comp_id.as_str());
        self.encoder.put_uint(tags::MSG_SEQ_NUM, seq_num);
        self.encoder.put_timestamp(tags::SENDING_TIME, sending_time);
    }

    /// Builds a Logon message.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn logon(
        &mut self,
        seq_num: u64,
        sending_time: Timestamp,
        heart_bt_int_s: u64,
        reset_seq_num: bool,
        username: Option<&str>,
        password: Option<&str>,
        last_msg_seq_num_processed: Option<u64>,
    ) -> BytesMut {
        self.header(FixMsgType::Logon, seq_num, sending_time);
        self.encoder.put_uint(tags::HEART_BT_INT, heart_bt_int_s);
        if reset_seq_num {
            self.encoder.put_bool(tags::RESET_SEQ_NUM_FLAG, true);
        }
        if let Some(username) = username {
            self.encoder.put_str(tags::USERNAME, username);
        }
        if let Some(password) = password {
            self.encoder.put_str(tags::PASSWORD, password);
        }
        if let Some(last) = last_msg_seq_num_processed {
            self.encoder.put_uint(tags::LAST_MSG_SEQ_NUM_PROCESSED, last);
        }
        self.encoder.finish()
    }

    /// Builds a Logout message with an optional reason text.
    #[must_use]
    pub fn logout(&mut self, seq_num: u64, sending_time: Timestamp, text: Option<&str>) -> BytesMut {
        self.header(FixMsgType::Logout, seq_num, sending_time);
        if let Some(text) = text {
            self.encoder.put_str(tags::TEXT, text);
        }
        self.encoder.finish()
    }

    /// Builds a Heartbeat, echoing a TestReqID when replying to a
    /// TestRequest.
    #[must_use]
    pub fn heartbeat(
        &mut self,
        seq_num: u64,
        sending_time: Timestamp,
        test_req_id: Option<&[u8]>,
    ) -> BytesMut {
        self.header(FixMsgType::Heartbeat, seq_num, sending_time);
        if let Some(id) = test_req_id {
            self.encoder.put_raw(tags::TEST_REQ_ID, id);
        }
        self.encoder.finish()
    }

    /// Builds a TestRequest.
    #[must_use]
    pub fn test_request(
        &mut self,
        seq_num: u64,
        sending_time: Timestamp,
        test_req_id: &str,
    ) -> BytesMut {
        self.header(FixMsgType::TestRequest, seq_num, sending_time);
        self.encoder.put_str(tags::TEST_REQ_ID, test_req_id);
        self.encoder.finish()
    }

    /// Builds a ResendRequest for `[begin_seq_no, end_seq_no]`,
    /// `end_seq_no = 0` meaning "everything from begin".
    #[must_use]
    pub fn resend_request(
        &mut self,
        seq_num: u64,
        sending_time: Timestamp,
        begin_seq_no: u64,
        end_seq_no: u64,
    ) -> BytesMut {
        self.header(FixMsgType::ResendRequest, seq_num, sending_time);
        self.encoder.put_uint(tags::BEGIN_SEQ_NO, begin_seq_no);
        self.encoder.put_uint(tags::END_SEQ_NO, end_seq_no);
        self.encoder.finish()
    }

    /// Builds a SequenceReset.
    ///
    /// Gap-fill resets carry PossDupFlag as they stand in for replayed
    /// messages.
    #[must_use]
    pub fn sequence_reset(
        &mut self,
        seq_num: u64,
        sending_time: Timestamp,
        new_seq_no: u64,
        gap_fill: bool,
    ) -> BytesMut {
        self.encoder
            .put_str(tags::MSG_TYPE, FixMsgType::SequenceReset.as_str());
        self.encoder
            .put_str(tags::SENDER_COMP_ID, self.key.sender_comp_id.as_str());
        self.encoder
            .put_str(tags::TARGET_COMP_ID, self.key.target_comp_id.as_str());
        self.encoder.put_uint(tags::MSG_SEQ_NUM, seq_num);
        if gap_fill {
            self.encoder.put_bool(tags::POSS_DUP_FLAG, true);
        }
        self.encoder.put_timestamp(tags::SENDING_TIME, sending_time);
        self.encoder.put_bool(tags::GAP_FILL_FLAG, gap_fill);
        self.encoder.put_uint(tags::NEW_SEQ_NO, new_seq_no);
        self.encoder.finish()
    }

    /// Builds a session-level Reject referencing `ref_seq_num`.
    #[must_use]
    pub fn reject(
        &mut self,
        seq_num: u64,
        sending_time: Timestamp,
        ref_seq_num: u64,
        text: &str,
    ) -> BytesMut {
        self.header(FixMsgType::Reject, seq_num, sending_time);
        self.encoder.put_uint(tags::REF_SEQ_NUM, ref_seq_num);
        self.encoder.put_str(tags::TEXT, text);
        self.encoder.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fixgate_core::CompId;

    fn encoder() -> SessionMessageEncoder {
        let key = CompositeKey::new(
            CompId::new("INITIATOR").unwrap(),
            CompId::new("ACCEPTOR").unwrap(),
        );
        SessionMessageEncoder::new("FIX.4.4", key)
    }

    #[test]
    fn test_logon_roundtrip() {
        let mut enc = encoder();
        let frame = enc.logon(
            1,
            Timestamp::from_millis(0),
            30,
            true,
            Some("user"),
            Some("pass"),
            None,
        );

        let view = FixMessage::parse(&frame).unwrap();
        assert_eq!(view.msg_type, FixMsgType::Logon);
        assert_eq!(view.msg_seq_num, 1);
        assert_eq!(view.heart_bt_int, Some(30));
        assert!(view.reset_seq_num);
        assert_eq!(view.username, Some(&b"user"[..]));
        assert_eq!(view.sender_comp_id, b"INITIATOR");
        assert_eq!(view.target_comp_id, b"ACCEPTOR");
    }

    #[test]
    fn test_heartbeat_echoes_test_req_id() {
        let mut enc = encoder();
        let frame = enc.heartbeat(7, Timestamp::from_millis(0), Some(b"TEST42"));

        let view = FixMessage::parse(&frame).unwrap();
        assert_eq!(view.msg_type, FixMsgType::Heartbeat);
        assert_eq!(view.test_req_id, Some(&b"TEST42"[..]));
    }

    #[test]
    fn test_resend_request_range() {
        let mut enc = encoder();
        let frame = enc.resend_request(3, Timestamp::from_millis(0), 5, 9);

        let view = FixMessage::parse(&frame).unwrap();
        assert_eq!(view.msg_type, FixMsgType::ResendRequest);
        assert_eq!(view.begin_seq_no, Some(5));
        assert_eq!(view.end_seq_no, Some(9));
    }

    #[test]
    fn test_sequence_reset_gap_fill() {
        let mut enc = encoder();
        let frame = enc.sequence_reset(4, Timestamp::from_millis(0), 10, true);

        let view = FixMessage::parse(&frame).unwrap();
        assert_eq!(view.msg_type, FixMsgType::SequenceReset);
        assert_eq!(view.new_seq_no, Some(10));
        assert!(view.gap_fill);
        assert!(view.poss_dup);
    }

    #[test]
    fn test_parse_rejects_missing_seq_num() {
        let mut raw = Encoder::new("FIX.4.4");
        raw.put_str(tags::MSG_TYPE, "0");
        let frame = raw.finish();

        let err = FixMessage::parse(&frame).unwrap_err();
        assert!(matches!(
            err,
            DecodeError::MissingRequiredField { tag: tags::MSG_SEQ_NUM }
        ));
    }

    #[test]
    fn test_parse_rejects_bad_begin_string() {
        let err = FixMessage::parse(b"9=5\x0135=0\x01").unwrap_err();
        assert!(matches!(err, DecodeError::InvalidBeginString));
    }

    #[test]
    fn test_msg_type_classification() {
        assert_eq!(FixMsgType::from_bytes(b"A"), FixMsgType::Logon);
        assert_eq!(FixMsgType::from_bytes(b"D"), FixMsgType::Application);
        assert!(FixMsgType::Logon.is_admin());
        assert!(!FixMsgType::Application.is_admin());
    }
}
