/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! Error types for the fixgate gateway.
//!
//! This module provides a unified error hierarchy using `thiserror` for typed,
//! domain-specific errors across all fixgate operations.

use std::ops::Range;
use thiserror::Error;

/// Result type alias using [`GateError`] as the error type.
pub type Result<T> = std::result::Result<T, GateError>;

/// Top-level error type for all fixgate operations.
#[derive(Debug, Error)]
pub enum GateError {
    /// Error during message decoding.
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Error during message encoding.
    #[error("encode error: {0}")]
    Encode(#[from] EncodeError),

    /// Error in FIX session layer operations.
    #[error("session error: {0}")]
    Session(#[from] SessionError),

    /// Error in ILink3 connection operations.
    #[error("ilink3 error: {0}")]
    Ilink3(#[from] Ilink3Error),

    /// Error in sequence store or archive operations.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Error in engine or registry operations.
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    /// I/O error from underlying transport.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that occur during frame decoding, FIX or SBE.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Frame buffer is incomplete, need more data.
    #[error("incomplete message, need more data")]
    Incomplete,

    /// Invalid BeginString field (tag 8).
    #[error("invalid begin string: expected 8=FIX.x.y")]
    InvalidBeginString,

    /// Missing BodyLength field (tag 9).
    #[error("missing body length field (tag 9)")]
    MissingBodyLength,

    /// Invalid BodyLength value.
    #[error("invalid body length value")]
    InvalidBodyLength,

    /// Missing MsgType field (tag 35).
    #[error("missing msg type field (tag 35)")]
    MissingMsgType,

    /// Checksum mismatch between calculated and declared values.
    #[error("checksum mismatch: calculated {calculated}, declared {declared}")]
    ChecksumMismatch {
        /// Calculated checksum value.
        calculated: u8,
        /// Declared checksum value in message.
        declared: u8,
    },

    /// Invalid tag format (not a valid integer).
    #[error("invalid tag format: {0}")]
    InvalidTag(String),

    /// Missing required field.
    #[error("missing required field: tag {tag}")]
    MissingRequiredField {
        /// The tag number of the missing field.
        tag: u32,
    },

    /// Invalid field value for the expected type.
    #[error("invalid field value for tag {tag}: {reason}")]
    InvalidFieldValue {
        /// The tag number of the field.
        tag: u32,
        /// Description of why the value is invalid.
        reason: String,
    },

    /// Invalid UTF-8 in string field.
    #[error("invalid utf-8 in field: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    /// Message exceeds maximum allowed size.
    #[error("message too large: {size} bytes exceeds maximum {max_size}")]
    MessageTooLarge {
        /// Actual message size in bytes.
        size: usize,
        /// Maximum allowed size in bytes.
        max_size: usize,
    },

    /// SBE frame carries an unexpected encoding type in its framing header.
    #[error("invalid sofh encoding type: {0:#06x}")]
    InvalidEncodingType(u16),

    /// SBE message header names a template this gateway does not know.
    #[error("unknown template id: {0}")]
    UnknownTemplateId(u16),

    /// SBE message header names a different schema.
    #[error("schema mismatch: expected {expected}, actual {actual}")]
    SchemaMismatch {
        /// Schema id this gateway speaks.
        expected: u16,
        /// Schema id in the received header.
        actual: u16,
    },

    /// SBE body is shorter than its block length claims.
    #[error("truncated frame: need {needed} bytes, have {available}")]
    TruncatedFrame {
        /// Bytes required by the header.
        needed: usize,
        /// Bytes present in the buffer.
        available: usize,
    },
}

/// Errors that occur during message encoding.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EncodeError {
    /// Buffer capacity exceeded during encoding.
    #[error("buffer overflow: need {needed} bytes, have {available}")]
    BufferOverflow {
        /// Bytes needed to complete encoding.
        needed: usize,
        /// Bytes available in buffer.
        available: usize,
    },

    /// Target buffer cannot hold an encoded composite key record.
    ///
    /// The target buffer is left untouched when this is returned.
    #[error("insufficient space: need {needed} bytes, have {available}")]
    InsufficientSpace {
        /// Bytes needed for the full record.
        needed: usize,
        /// Bytes available at the requested offset.
        available: usize,
    },

    /// Missing required field during encoding.
    #[error("missing required field: tag {tag}")]
    MissingRequiredField {
        /// The tag number of the missing field.
        tag: u32,
    },

    /// Field value exceeds maximum length.
    #[error("field value too long for tag {tag}: {length} exceeds max {max_length}")]
    FieldTooLong {
        /// The tag number of the field.
        tag: u32,
        /// Actual length of the value.
        length: usize,
        /// Maximum allowed length.
        max_length: usize,
    },
}

/// Errors in FIX session layer operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Session is not in the correct state for the operation.
    #[error("invalid session state: expected {expected}, current {current}")]
    InvalidState {
        /// Expected state for the operation.
        expected: String,
        /// Current session state.
        current: String,
    },

    /// Logon was rejected by the counterparty or the business layer.
    #[error("logon rejected: {reason}")]
    LogonRejected {
        /// Reason for rejection.
        reason: String,
    },

    /// Heartbeat timeout, no response to TestRequest.
    #[error("heartbeat timeout after {elapsed_ms} milliseconds")]
    HeartbeatTimeout {
        /// Elapsed time in milliseconds since last received message.
        elapsed_ms: u64,
    },

    /// Inbound sequence number below expected without PossDupFlag.
    #[error("msg seq num too low: expected >= {expected}, received {received}")]
    SequenceTooLow {
        /// Minimum expected sequence number.
        expected: u64,
        /// Received sequence number.
        received: u64,
    },

    /// Inbound SendingTime outside the configured accuracy window.
    #[error("sending time inaccurate: off by {delta_ms}ms, window {window_ms}ms")]
    SendingTimeInaccurate {
        /// Absolute deviation from local time in milliseconds.
        delta_ms: u64,
        /// Configured tolerance window in milliseconds.
        window_ms: u64,
    },

    /// SequenceReset attempted to rewind sequence numbers without authorisation.
    #[error("sequence rewind rejected: current {current}, requested {requested}")]
    SequenceRewindRejected {
        /// Current next expected sequence number.
        current: u64,
        /// Requested new sequence number.
        requested: u64,
    },

    /// Resend request for messages the archive no longer holds.
    #[error("resend request for unavailable range: {begin}..{end}")]
    ResendUnavailable {
        /// Begin sequence number of requested range.
        begin: u64,
        /// End sequence number of requested range.
        end: u64,
    },

    /// Session configuration error.
    #[error("configuration error: {0}")]
    Configuration(String),
}

/// Errors in ILink3 connection operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Ilink3Error {
    /// No NegotiateResponse within the configured window, including the retry.
    #[error("negotiate timeout after {elapsed_ms} milliseconds")]
    NegotiateTimeout {
        /// Elapsed time in milliseconds since the first Negotiate.
        elapsed_ms: u64,
    },

    /// Counterparty rejected the Negotiate.
    #[error("negotiate rejected: {reason}")]
    NegotiateRejected {
        /// Reject reason from the counterparty.
        reason: String,
    },

    /// No EstablishmentAck within the configured window, including the retry.
    #[error("establish timeout after {elapsed_ms} milliseconds")]
    EstablishTimeout {
        /// Elapsed time in milliseconds since the first Establish.
        elapsed_ms: u64,
    },

    /// Counterparty rejected the Establish.
    #[error("establishment rejected: {reason}")]
    EstablishmentRejected {
        /// Reject reason from the counterparty.
        reason: String,
    },

    /// Peer Terminate carried a uuid that does not match this connection.
    #[error("invalid uuid={received}, expected={expected}")]
    InvalidUuid {
        /// The uuid this connection negotiated.
        expected: u64,
        /// The uuid in the peer's Terminate.
        received: u64,
    },

    /// Inbound sequence number below expected without PossRetrans.
    #[error("sequence number too low: expected >= {expected}, received {received}")]
    LowSequenceNumber {
        /// Minimum expected sequence number.
        expected: u64,
        /// Received sequence number.
        received: u64,
    },

    /// Operation not permitted in the current connection state.
    ///
    /// Returned by `try_claim` while a NotApplied-triggered replay is
    /// draining.
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// Requested keep-alive interval exceeds the protocol cap.
    #[error("keep alive interval {requested_ms}ms exceeds maximum {max_ms}ms")]
    KeepAliveIntervalTooLarge {
        /// Requested interval in milliseconds.
        requested_ms: u64,
        /// Maximum permitted interval in milliseconds.
        max_ms: u64,
    },
}

/// Errors in sequence store and message archive operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Failed to persist state or a message.
    #[error("failed to store seq={seq_num}: {reason}")]
    StoreFailed {
        /// Sequence number of the message.
        seq_num: u64,
        /// Reason for failure.
        reason: String,
    },

    /// Range of messages not available for replay.
    #[error("messages not available for range: {range:?}")]
    RangeNotAvailable {
        /// The requested range of sequence numbers.
        range: Range<u64>,
    },

    /// Persisted record is corrupt or truncated.
    #[error("store corrupted: {reason}")]
    Corrupted {
        /// Description of the corruption.
        reason: String,
    },

    /// I/O error in persistent store.
    #[error("store i/o error: {0}")]
    Io(String),
}

/// Errors in engine and registry operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// A second connection was attempted for a key already bound on a host.
    #[error("duplicate connection for session {session_id} on host profile {host_profile}")]
    DuplicateConnection {
        /// The already-bound session id.
        session_id: u64,
        /// The host profile of the rejected bind.
        host_profile: String,
    },

    /// A frame arrived for a connection id with no bound session.
    #[error("unknown session for connection {connection_id}")]
    UnknownSession {
        /// The unbound connection id.
        connection_id: u64,
    },

    /// The engine is shutting down and no longer accepts work.
    #[error("engine is shutting down")]
    ShuttingDown,
}
