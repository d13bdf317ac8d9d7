/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! ILink3 SBE session-message codec.
//!
//! Little-endian Simple Binary Encoding. Every frame starts with the Simple
//! Open Framing Header (total length + encoding type) followed by the SBE
//! message header {block_length, template_id, schema_id, version} and the
//! fixed-layout body.
//!
//! Session templates 500-510 and 513 are decoded into typed structs. Any
//! other template id is surfaced as an opaque business frame whose body
//! starts with the common {uuid, seq_no, poss_retrans} prefix; the payload
//! beyond the prefix belongs to the application codecs.

use bytes::{BufMut, BytesMut};
use fixgate_core::{DecodeError, Uuid};
use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::FromPrimitive;

/// Length of the Simple Open Framing Header.
pub const SOFH_LEN: usize = 4;

/// SOFH encoding type for little-endian SBE.
pub const SOFH_ENCODING_SBE_LE: u16 = 0xCAFE;

/// Length of the SBE message header.
pub const SBE_HEADER_LEN: usize = 8;

/// Schema id this gateway speaks.
pub const SCHEMA_ID: u16 = 8;

/// Schema version this gateway speaks.
pub const SCHEMA_VERSION: u16 = 5;

/// Length of the fixed reason field on reject and terminate templates.
pub const REASON_LEN: usize = 48;

/// Common business-frame prefix: uuid + seq_no + poss_retrans.
pub const BUSINESS_PREFIX_LEN: usize = 13;

/// Session template identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromPrimitive, ToPrimitive)]
#[repr(u16)]
pub enum TemplateId {
    /// Negotiate.
    Negotiate = 500,
    /// NegotiateResponse.
    NegotiateResponse = 501,
    /// NegotiateReject.
    NegotiateReject = 502,
    /// Establish.
    Establish = 503,
    /// EstablishmentAck.
    EstablishmentAck = 504,
    /// EstablishmentReject.
    EstablishmentReject = 505,
    /// Sequence.
    Sequence = 506,
    /// Terminate.
    Terminate = 507,
    /// RetransmitRequest.
    RetransmitRequest = 508,
    /// Retransmission (request accepted).
    Retransmission = 509,
    /// RetransmitReject.
    RetransmitReject = 510,
    /// NotApplied.
    NotApplied = 513,
}

/// KeepAliveLapsed flag on Sequence messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum KeepAliveLapsed {
    /// The keep-alive interval has not lapsed.
    NotLapsed = 0,
    /// The sender's receive interval lapsed; this is a warning and a
    /// must-reply.
    Lapsed = 1,
}

/// SBE message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SbeHeader {
    /// Length of the fixed message block.
    pub block_length: u16,
    /// Template identifier.
    pub template_id: u16,
    /// Schema identifier.
    pub schema_id: u16,
    /// Schema version.
    pub version: u16,
}

impl SbeHeader {
    /// Decodes a header from the start of `buffer`.
    ///
    /// # Errors
    /// Returns `DecodeError::TruncatedFrame` when fewer than
    /// [`SBE_HEADER_LEN`] bytes are available, or
    /// `DecodeError::SchemaMismatch` for a foreign schema id.
    pub fn decode(buffer: &[u8]) -> Result<Self, DecodeError> {
        if buffer.len() < SBE_HEADER_LEN {
            return Err(DecodeError::TruncatedFrame {
                needed: SBE_HEADER_LEN,
                available: buffer.len(),
            });
        }
        let header = Self {
            block_length: read_u16(buffer, 0),
            template_id: read_u16(buffer, 2),
            schema_id: read_u16(buffer, 4),
            version: read_u16(buffer, 6),
        };
        if header.schema_id != SCHEMA_ID {
            return Err(DecodeError::SchemaMismatch {
                expected: SCHEMA_ID,
                actual: header.schema_id,
            });
        }
        Ok(header)
    }
}

/// Negotiate (template 500).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiate {
    /// Connection nonce chosen by the initiator.
    pub uuid: Uuid,
    /// Request timestamp in nanoseconds.
    pub request_timestamp: u64,
    /// Session id, up to 3 ASCII characters.
    pub session_id: [u8; 3],
    /// Firm id, up to 5 ASCII characters.
    pub firm_id: [u8; 5],
    /// Access key id, up to 20 ASCII characters.
    pub access_key_id: [u8; 20],
}

/// NegotiateResponse (template 501).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiateResponse {
    /// Echoed connection nonce.
    pub uuid: Uuid,
    /// Echoed request timestamp.
    pub request_timestamp: u64,
    /// Last sequence number the exchange sent on the previous uuid.
    pub previous_seq_no: u32,
    /// The previous uuid, null on a week's first connection.
    pub previous_uuid: Uuid,
}

/// NegotiateReject (template 502).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiateReject {
    /// Echoed connection nonce.
    pub uuid: Uuid,
    /// Echoed request timestamp.
    pub request_timestamp: u64,
    /// Error codes bitfield.
    pub error_codes: u16,
    /// Reject reason, NUL padded.
    pub reason: [u8; REASON_LEN],
}

/// Establish (template 503).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Establish {
    /// Connection nonce.
    pub uuid: Uuid,
    /// Request timestamp in nanoseconds.
    pub request_timestamp: u64,
    /// Next sequence number the initiator will send.
    pub next_seq_no: u32,
    /// Requested keep-alive interval in milliseconds.
    pub keep_alive_interval_ms: u16,
    /// Session id.
    pub session_id: [u8; 3],
    /// Firm id.
    pub firm_id: [u8; 5],
    /// Access key id.
    pub access_key_id: [u8; 20],
}

/// EstablishmentAck (template 504).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EstablishmentAck {
    /// Echoed connection nonce.
    pub uuid: Uuid,
    /// Echoed request timestamp.
    pub request_timestamp: u64,
    /// Next sequence number the exchange will send on this uuid.
    pub next_seq_no: u32,
    /// Last sequence number the exchange sent on `previous_uuid`.
    pub previous_seq_no: u32,
    /// The previous uuid.
    pub previous_uuid: Uuid,
    /// Granted keep-alive interval in milliseconds.
    pub keep_alive_interval_ms: u16,
}

/// EstablishmentReject (template 505).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EstablishmentReject {
    /// Echoed connection nonce.
    pub uuid: Uuid,
    /// Echoed request timestamp.
    pub request_timestamp: u64,
    /// Error codes bitfield.
    pub error_codes: u16,
    /// Reject reason, NUL padded.
    pub reason: [u8; REASON_LEN],
}

/// Sequence (template 506).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sequence {
    /// Connection nonce.
    pub uuid: Uuid,
    /// Next sequence number the sender will use.
    pub next_seq_no: u32,
    /// Keep-alive lapse flag.
    pub keep_alive_lapsed: KeepAliveLapsed,
}

/// Terminate (template 507).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Terminate {
    /// Connection nonce.
    pub uuid: Uuid,
    /// Request timestamp in nanoseconds.
    pub request_timestamp: u64,
    /// Error codes bitfield, 0 for a graceful terminate.
    pub error_codes: u16,
    /// Terminate reason, NUL padded.
    pub reason: [u8; REASON_LEN],
}

/// RetransmitRequest (template 508).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetransmitRequest {
    /// Connection nonce of the live connection.
    pub uuid: Uuid,
    /// Uuid whose messages are requested; equals `uuid` for same-epoch
    /// gaps, the previous uuid for cross-epoch recovery.
    pub last_uuid: Uuid,
    /// Request timestamp in nanoseconds.
    pub request_timestamp: u64,
    /// First requested sequence number.
    pub from_seq_no: u32,
    /// Number of requested messages.
    pub msg_count: u16,
}

/// Retransmission (template 509): the request was accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retransmission {
    /// Connection nonce of the live connection.
    pub uuid: Uuid,
    /// Uuid whose messages will be replayed.
    pub last_uuid: Uuid,
    /// Echoed request timestamp.
    pub request_timestamp: u64,
    /// First replayed sequence number.
    pub from_seq_no: u32,
    /// Number of replayed messages.
    pub msg_count: u16,
}

/// RetransmitReject (template 510).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetransmitReject {
    /// Connection nonce of the live connection.
    pub uuid: Uuid,
    /// Uuid of the rejected request.
    pub last_uuid: Uuid,
    /// Echoed request timestamp.
    pub request_timestamp: u64,
    /// First rejected sequence number.
    pub from_seq_no: u32,
    /// Number of rejected messages.
    pub msg_count: u16,
    /// Error codes bitfield.
    pub error_codes: u16,
    /// Reject reason, NUL padded.
    pub reason: [u8; REASON_LEN],
}

/// NotApplied (template 513): the exchange detected a gap in our stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotApplied {
    /// Connection nonce.
    pub uuid: Uuid,
    /// First sequence number the exchange did not apply.
    pub from_seq_no: u32,
    /// Number of messages not applied.
    pub msg_count: u32,
}

/// A decoded ILink3 frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ilink3Message<'a> {
    /// Negotiate (500).
    Negotiate(Negotiate),
    /// NegotiateResponse (501).
    NegotiateResponse(NegotiateResponse),
    /// NegotiateReject (502).
    NegotiateReject(NegotiateReject),
    /// Establish (503).
    Establish(Establish),
    /// EstablishmentAck (504).
    EstablishmentAck(EstablishmentAck),
    /// EstablishmentReject (505).
    EstablishmentReject(EstablishmentReject),
    /// Sequence (506).
    Sequence(Sequence),
    /// Terminate (507).
    Terminate(Terminate),
    /// RetransmitRequest (508).
    RetransmitRequest(RetransmitRequest),
    /// Retransmission (509).
    Retransmission(Retransmission),
    /// RetransmitReject (510).
    RetransmitReject(RetransmitReject),
    /// NotApplied (513).
    NotApplied(NotApplied),
    /// Any non-session template.
    Business {
        /// Template id from the SBE header.
        template_id: u16,
        /// Connection nonce from the common prefix.
        uuid: Uuid,
        /// Sequence number from the common prefix.
        seq_no: u32,
        /// PossRetrans flag from the common prefix.
        poss_retrans: bool,
        /// Payload beyond the common prefix.
        payload: &'a [u8],
    },
}

impl Negotiate {
    /// Fixed block length of this template.
    pub const BLOCK_LENGTH: u16 = 44;
}
impl NegotiateResponse {
    /// Fixed block length of this template.
    pub const BLOCK_LENGTH: u16 = 28;
}
impl NegotiateReject {
    /// Fixed block length of this template.
    pub const BLOCK_LENGTH: u16 = 66;
}
impl Establish {
    /// Fixed block length of this template.
    pub const BLOCK_LENGTH: u16 = 50;
}
impl EstablishmentAck {
    /// Fixed block length of this template.
    pub const BLOCK_LENGTH: u16 = 34;
}
impl EstablishmentReject {
    /// Fixed block length of this template.
    pub const BLOCK_LENGTH: u16 = 66;
}
impl Sequence {
    /// Fixed block length of this template.
    pub const BLOCK_LENGTH: u16 = 13;
}
impl Terminate {
    /// Fixed block length of this template.
    pub const BLOCK_LENGTH: u16 = 66;
}
impl RetransmitRequest {
    /// Fixed block length of this template.
    pub const BLOCK_LENGTH: u16 = 30;
}
impl Retransmission {
    /// Fixed block length of this template.
    pub const BLOCK_LENGTH: u16 = 30;
}
impl RetransmitReject {
    /// Fixed block length of this template.
    pub const BLOCK_LENGTH: u16 = 80;
}
impl NotApplied {
    /// Fixed block length of this template.
    pub const BLOCK_LENGTH: u16 = 16;
}

/// Total frame length for a session template of `block_length`.
#[must_use]
pub const fn frame_len(block_length: u16) -> usize {
    SOFH_LEN + SBE_HEADER_LEN + block_length as usize
}

/// Pads an ASCII string into a fixed NUL-padded field.
///
/// Input longer than `N` is truncated.
#[must_use]
pub fn fixed_str<const N: usize>(value: &str) -> [u8; N] {
    let mut out = [0u8; N];
    let bytes = value.as_bytes();
    let len = bytes.len().min(N);
    out[..len].copy_from_slice(&bytes[..len]);
    out
}

/// Recovers the string from a NUL-padded fixed field.
#[must_use]
pub fn fixed_str_value(field: &[u8]) -> &str {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    std::str::from_utf8(&field[..end]).unwrap_or("")
}

struct Writer<'a> {
    buf: &'a mut [u8],
    at: usize,
}

impl<'a> Writer<'a> {
    fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, at: 0 }
    }

    fn u8(&mut self, v: u8) {
        self.buf[self.at] = v;
        self.at += 1;
    }

    fn u16(&mut self, v: u16) {
        self.buf[self.at..self.at + 2].copy_from_slice(&v.to_le_bytes());
        self.at += 2;
    }

    fn u32(&mut self, v: u32) {
        self.buf[self.at..self.at + 4].copy_from_slice(&v.to_le_bytes());
        self.at += 4;
    }

    fn u64(&mut self, v: u64) {
        self.buf[self.at..self.at + 8].copy_from_slice(&v.to_le_bytes());
        self.at += 8;
    }

    fn bytes(&mut self, v: &[u8]) {
        self.buf[self.at..self.at + v.len()].copy_from_slice(v);
        self.at += v.len();
    }

    fn sofh_and_header(&mut self, total_len: usize, block_length: u16, template_id: u16) {
        self.u16(total_len as u16);
        self.u16(SOFH_ENCODING_SBE_LE);
        self.u16(block_length);
        self.u16(template_id);
        self.u16(SCHEMA_ID);
        self.u16(SCHEMA_VERSION);
    }
}

#[inline]
fn read_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

#[inline]
fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

#[inline]
fn read_u64(buf: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(bytes)
}

fn read_reason(buf: &[u8], at: usize) -> [u8; REASON_LEN] {
    let mut out = [0u8; REASON_LEN];
    out.copy_from_slice(&buf[at..at + REASON_LEN]);
    out
}

macro_rules! encode_frame {
    ($self:ident, $buf:ident, $template:expr, $block:expr, $body:expr) => {{
        let total = frame_len($block);
        debug_assert_eq!($buf.len(), total);
        let mut w = Writer::new($buf);
        w.sofh_and_header(total, $block, $template as u16);
        $body(&mut w, $self);
        debug_assert_eq!(w.at, total);
    }};
}

impl Negotiate {
    /// Encodes the full frame into a slot of exactly
    /// `frame_len(Self::BLOCK_LENGTH)` bytes.
    pub fn encode_into(&self, buf: &mut [u8]) {
        encode_frame!(
            self,
            buf,
            TemplateId::Negotiate,
            Self::BLOCK_LENGTH,
            |w: &mut Writer<'_>, m: &Self| {
                w.u64(m.uuid.value());
                w.u64(m.request_timestamp);
                w.bytes(&m.session_id);
                w.bytes(&m.firm_id);
                w.bytes(&m.access_key_id);
            }
        );
    }

    fn decode(body: &[u8]) -> Self {
        let mut session_id = [0u8; 3];
        session_id.copy_from_slice(&body[16..19]);
        let mut firm_id = [0u8; 5];
        firm_id.copy_from_slice(&body[19..24]);
        let mut access_key_id = [0u8; 20];
        access_key_id.copy_from_slice(&body[24..44]);
        Self {
            uuid: Uuid::new(read_u64(body, 0)),
            request_timestamp: read_u64(body, 8),
            session_id,
            firm_id,
            access_key_id,
        }
    }
}

impl NegotiateResponse {
    /// Encodes the full frame into a slot of exactly
    /// `frame_len(Self::BLOCK_LENGTH)` bytes.
    pub fn encode_into(&self, buf: &mut [u8]) {
        encode_frame!(
            self,
            buf,
            TemplateId::NegotiateResponse,
            Self::BLOCK_LENGTH,
            |w: &mut Writer<'_>, m: &Self| {
                w.u64(m.uuid.value());
                w.u64(m.request_timestamp);
                w.u32(m.previous_seq_no);
                w.u64(m.previous_uuid.value());
            }
        );
    }

    fn decode(body: &[u8]) -> Self {
        Self {
            uuid: Uuid::new(read_u64(body, 0)),
            request_timestamp: read_u64(body, 8),
            previous_seq_no: read_u32(body, 16),
            previous_uuid: Uuid::new(read_u64(body, 20)),
        }
    }
}

impl NegotiateReject {
    /// Encodes the full frame into a slot of exactly
    /// `frame_len(Self::BLOCK_LENGTH)` bytes.
    pub fn encode_into(&self, buf: &mut [u8]) {
        encode_frame!(
            self,
            buf,
            TemplateId::NegotiateReject,
            Self::BLOCK_LENGTH,
            |w: &mut Writer<'_>, m: &Self| {
                w.u64(m.uuid.value());
                w.u64(m.request_timestamp);
                w.u16(m.error_codes);
                w.bytes(&m.reason);
            }
        );
    }

    fn decode(body: &[u8]) -> Self {
        Self {
            uuid: Uuid::new(read_u64(body, 0)),
            request_timestamp: read_u64(body, 8),
            error_codes: read_u16(body, 16),
            reason: read_reason(body, 18),
        }
    }
}

impl Establish {
    /// Encodes the full frame into a slot of exactly
    /// `frame_len(Self::BLOCK_LENGTH)` bytes.
    pub fn encode_into(&self, buf: &mut [u8]) {
        encode_frame!(
            self,
            buf,
            TemplateId::Establish,
            Self::BLOCK_LENGTH,
            |w: &mut Writer<'_>, m: &Self| {
                w.u64(m.uuid.value());
                w.u64(m.request_timestamp);
                w.u32(m.next_seq_no);
                w.u16(m.keep_alive_interval_ms);
                w.bytes(&m.session_id);
                w.bytes(&m.firm_id);
                w.bytes(&m.access_key_id);
            }
        );
    }

    fn decode(body: &[u8]) -> Self {
        let mut session_id = [0u8; 3];
        session_id.copy_from_slice(&body[22..25]);
        let mut firm_id = [0u8; 5];
        firm_id.copy_from_slice(&body[25..30]);
        let mut access_key_id = [0u8; 20];
        access_key_id.copy_from_slice(&body[30..50]);
        Self {
            uuid: Uuid::new(read_u64(body, 0)),
            request_timestamp: read_u64(body, 8),
            next_seq_no: read_u32(body, 16),
            keep_alive_interval_ms: read_u16(body, 20),
            session_id,
            firm_id,
            access_key_id,
        }
    }
}

impl EstablishmentAck {
    /// Encodes the full frame into a slot of exactly
    /// `frame_len(Self::BLOCK_LENGTH)` bytes.
    pub fn encode_into(&self, buf: &mut [u8]) {
        encode_frame!(
            self,
            buf,
            TemplateId::EstablishmentAck,
            Self::BLOCK_LENGTH,
            |w: &mut Writer<'_>, m: &Self| {
                w.u64(m.uuid.value());
                w.u64(m.request_timestamp);
                w.u32(m.next_seq_no);
                w.u32(m.previous_seq_no);
                w.u64(m.previous_uuid.value());
                w.u16(m.keep_alive_interval_ms);
            }
        );
    }

    fn decode(body: &[u8]) -> Self {
        Self {
            uuid: Uuid::new(read_u64(body, 0)),
            request_timestamp: read_u64(body, 8),
            next_seq_no: read_u32(body, 16),
            previous_seq_no: read_u32(body, 20),
            previous_uuid: Uuid::new(read_u64(body, 24)),
            keep_alive_interval_ms: read_u16(body, 32),
        }
    }
}

impl EstablishmentReject {
    /// Encodes the full frame into a slot of exactly
    /// `frame_len(Self::BLOCK_LENGTH)` bytes.
    pub fn encode_into(&self, buf: &mut [u8]) {
        encode_frame!(
            self,
            buf,
            TemplateId::EstablishmentReject,
            Self::BLOCK_LENGTH,
            |w: &mut Writer<'_>, m: &Self| {
                w.u64(m.uuid.value());
                w.u64(m.request_timestamp);
                w.u16(m.error_codes);
                w.bytes(&m.reason);
            }
        );
    }

    fn decode(body: &[u8]) -> Self {
        Self {
            uuid: Uuid::new(read_u64(body, 0)),
            request_timestamp: read_u64(body, 8),
            error_codes: read_u16(body, 16),
            reason: read_reason(body, 18),
        }
    }
}

impl Sequence {
    /// Encodes the full frame into a slot of exactly
    /// `frame_len(Self::BLOCK_LENGTH)` bytes.
    pub fn encode_into(&self, buf: &mut [u8]) {
        encode_frame!(
            self,
            buf,
            TemplateId::Sequence,
            Self::BLOCK_LENGTH,
            |w: &mut Writer<'_>, m: &Self| {
                w.u64(m.uuid.value());
                w.u32(m.next_seq_no);
                w.u8(m.keep_alive_lapsed as u8);
            }
        );
    }

    fn decode(body: &[u8]) -> Result<Self, DecodeError> {
        let lapsed = KeepAliveLapsed::from_u8(body[12]).ok_or_else(|| {
            DecodeError::InvalidFieldValue {
                tag: TemplateId::Sequence as u32,
                reason: format!("bad KeepAliveLapsed value {}", body[12]),
            }
        })?;
        Ok(Self {
            uuid: Uuid::new(read_u64(body, 0)),
            next_seq_no: read_u32(body, 8),
            keep_alive_lapsed: lapsed,
        })
    }
}

impl Terminate {
    /// Encodes the full frame into a slot of exactly
    /// `frame_len(Self::BLOCK_LENGTH)` bytes.
    pub fn encode_into(&self, buf: &mut [u8]) {
        encode_frame!(
            self,
            buf,
            TemplateId::Terminate,
            Self::BLOCK_LENGTH,
            |w: &mut Writer<'_>, m: &Self| {
                w.u64(m.uuid.value());
                w.u64(m.request_timestamp);
                w.u16(m.error_codes);
                w.bytes(&m.reason);
            }
        );
    }

    fn decode(body: &[u8]) -> Self {
        Self {
            uuid: Uuid::new(read_u64(body, 0)),
            request_timestamp: read_u64(body, 8),
            error_codes: read_u16(body, 16),
            reason: read_reason(body, 18),
        }
    }
}

impl RetransmitRequest {
    /// Encodes the full frame into a slot of exactly
    /// `frame_len(Self::BLOCK_LENGTH)` bytes.
    pub fn encode_into(&self, buf: &mut [u8]) {
        encode_frame!(
            self,
            buf,
            TemplateId::RetransmitRequest,
            Self::BLOCK_LENGTH,
            |w: &mut Writer<'_>, m: &Self| {
                w.u64(m.uuid.value());
                w.u64(m.last_uuid.value());
                w.u64(m.request_timestamp);
                w.u32(m.from_seq_no);
                w.u16(m.msg_count);
            }
        );
    }

    fn decode(body: &[u8]) -> Self {
        Self {
            uuid: Uuid::new(read_u64(body, 0)),
            last_uuid: Uuid::new(read_u64(body, 8)),
            request_timestamp: read_u64(body, 16),
            from_seq_no: read_u32(body, 24),
            msg_count: read_u16(body, 28),
        }
    }
}

impl Retransmission {
    /// Encodes the full frame into a slot of exactly
    /// `frame_len(Self::BLOCK_LENGTH)` bytes.
    pub fn encode_into(&self, buf: &mut [u8]) {
        encode_frame!(
            self,
            buf,
            TemplateId::Retransmission,
            Self::BLOCK_LENGTH,
            |w: &mut Writer<'_>, m: &Self| {
                w.u64(m.uuid.value());
                w.u64(m.last_uuid.value());
                w.u64(m.request_timestamp);
                w.u32(m.from_seq_no);
                w.u16(m.msg_count);
            }
        );
    }

    fn decode(body: &[u8]) -> Self {
        Self {
            uuid: Uuid::new(read_u64(body, 0)),
            last_uuid: Uuid::new(read_u64(body, 8)),
            request_timestamp: read_u64(body, 16),
            from_seq_no: read_u32(body, 24),
            msg_count: read_u16(body, 28),
        }
    }
}

impl RetransmitReject {
    /// Encodes the full frame into a slot of exactly
    /// `frame_len(Self::BLOCK_LENGTH)` bytes.
    pub fn encode_into(&self, buf: &mut [u8]) {
        encode_frame!(
            self,
            buf,
            TemplateId::RetransmitReject,
            Self::BLOCK_LENGTH,
            |w: &mut Writer<'_>, m: &Self| {
                w.u64(m.uuid.value());
                w.u64(m.last_uuid.value());
                w.u64(m.request_timestamp);
                w.u32(m.from_seq_no);
                w.u16(m.msg_count);
                w.u16(m.error_codes);
                w.bytes(&m.reason);
            }
        );
    }

    fn decode(body: &[u8]) -> Self {
        Self {
            uuid: Uuid::new(read_u64(body, 0)),
            last_uuid: Uuid::new(read_u64(body, 8)),
            request_timestamp: read_u64(body, 16),
            from_seq_no: read_u32(body, 24),
            msg_count: read_u16(body, 28),
            error_codes: read_u16(body, 30),
            reason: read_reason(body, 32),
        }
    }
}

impl NotApplied {
    /// Encodes the full frame into a slot of exactly
    /// `frame_len(Self::BLOCK_LENGTH)` bytes.
    pub fn encode_into(&self, buf: &mut [u8]) {
        encode_frame!(
            self,
            buf,
            TemplateId::NotApplied,
            Self::BLOCK_LENGTH,
            |w: &mut Writer<'_>, m: &Self| {
                w.u64(m.uuid.value());
                w.u32(m.from_seq_no);
                w.u32(m.msg_count);
            }
        );
    }

    fn decode(body: &[u8]) -> Self {
        Self {
            uuid: Uuid::new(read_u64(body, 0)),
            from_seq_no: read_u32(body, 8),
            msg_count: read_u32(body, 12),
        }
    }
}

/// Total frame length for a business message with `payload_len` bytes beyond
/// the common prefix.
#[must_use]
pub const fn business_frame_len(payload_len: usize) -> usize {
    SOFH_LEN + SBE_HEADER_LEN + BUSINESS_PREFIX_LEN + payload_len
}

/// Encodes a business frame into a slot of exactly
/// [`business_frame_len`]`(payload.len())` bytes.
pub fn encode_business_into(
    buf: &mut [u8],
    template_id: u16,
    uuid: Uuid,
    seq_no: u32,
    poss_retrans: bool,
    payload: &[u8],
) {
    let total = business_frame_len(payload.len());
    debug_assert_eq!(buf.len(), total);
    let mut w = Writer::new(buf);
    w.sofh_and_header(
        total,
        (BUSINESS_PREFIX_LEN + payload.len()) as u16,
        template_id,
    );
    w.u64(uuid.value());
    w.u32(seq_no);
    w.u8(u8::from(poss_retrans));
    w.bytes(payload);
}

/// Convenience: encodes a business frame to an owned buffer.
#[must_use]
pub fn encode_business(
    template_id: u16,
    uuid: Uuid,
    seq_no: u32,
    poss_retrans: bool,
    payload: &[u8],
) -> BytesMut {
    let mut buf = BytesMut::new();
    buf.put_bytes(0, business_frame_len(payload.len()));
    encode_business_into(&mut buf, template_id, uuid, seq_no, poss_retrans, payload);
    buf
}

/// Decodes a complete ILink3 frame, SOFH included.
///
/// # Errors
/// Returns a `DecodeError` on a truncated frame, wrong encoding type,
/// foreign schema id, or malformed session-template body.
pub fn decode_message(frame: &[u8]) -> Result<Ilink3Message<'_>, DecodeError> {
    if frame.len() < SOFH_LEN + SBE_HEADER_LEN {
        return Err(DecodeError::TruncatedFrame {
            needed: SOFH_LEN + SBE_HEADER_LEN,
            available: frame.len(),
        });
    }

    let declared_len = read_u16(frame, 0) as usize;
    let encoding = read_u16(frame, 2);
    if encoding != SOFH_ENCODING_SBE_LE {
        return Err(DecodeError::InvalidEncodingType(encoding));
    }
    if declared_len > frame.len() {
        return Err(DecodeError::TruncatedFrame {
            needed: declared_len,
            available: frame.len(),
        });
    }

    let header = SbeHeader::decode(&frame[SOFH_LEN..])?;
    let body = &frame[SOFH_LEN + SBE_HEADER_LEN..declared_len];
    if body.len() < header.block_length as usize {
        return Err(DecodeError::TruncatedFrame {
            needed: SOFH_LEN + SBE_HEADER_LEN + header.block_length as usize,
            available: frame.len(),
        });
    }

    let message = match TemplateId::from_u16(header.template_id) {
        Some(TemplateId::Negotiate) => Ilink3Message::Negotiate(Negotiate::decode(body)),
        Some(TemplateId::NegotiateResponse) => {
            Ilink3Message::NegotiateResponse(NegotiateResponse::decode(body))
        }
        Some(TemplateId::NegotiateReject) => {
            Ilink3Message::NegotiateReject(NegotiateReject::decode(body))
        }
        Some(TemplateId::Establish) => Ilink3Message::Establish(Establish::decode(body)),
        Some(TemplateId::EstablishmentAck) => {
            Ilink3Message::EstablishmentAck(EstablishmentAck::decode(body))
        }
        Some(TemplateId::EstablishmentReject) => {
            Ilink3Message::EstablishmentReject(EstablishmentReject::decode(body))
        }
        Some(TemplateId::Sequence) => Ilink3Message::Sequence(Sequence::decode(body)?),
        Some(TemplateId::Terminate) => Ilink3Message::Terminate(Terminate::decode(body)),
        Some(TemplateId::RetransmitRequest) => {
            Ilink3Message::RetransmitRequest(RetransmitRequest::decode(body))
        }
        Some(TemplateId::Retransmission) => {
            Ilink3Message::Retransmission(Retransmission::decode(body))
        }
        Some(TemplateId::RetransmitReject) => {
            Ilink3Message::RetransmitReject(RetransmitReject::decode(body))
        }
        Some(TemplateId::NotApplied) => Ilink3Message::NotApplied(NotApplied::decode(body)),
        None => {
            if body.len() < BUSINESS_PREFIX_LEN {
                return Err(DecodeError::TruncatedFrame {
                    needed: SOFH_LEN + SBE_HEADER_LEN + BUSINESS_PREFIX_LEN,
                    available: frame.len(),
                });
            }
            Ilink3Message::Business {
                template_id: header.template_id,
                uuid: Uuid::new(read_u64(body, 0)),
                seq_no: read_u32(body, 8),
                poss_retrans: body[12] != 0,
                payload: &body[BUSINESS_PREFIX_LEN..],
            }
        }
    };

    Ok(message)
}
