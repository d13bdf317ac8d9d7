/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! Core types for gateway session management.
//!
//! This module provides the fundamental types used throughout fixgate:
//! - [`SeqNum`]: message sequence number
//! - [`Uuid`]: ILink3 connection nonce identifying a connection epoch
//! - [`SessionId`]: dense surrogate id assigned by the session registry
//! - [`Timestamp`]: FIX-formatted timestamp
//! - [`CompId`]: component identifier (SenderCompID, TargetCompID)
//! - [`SequenceState`]: the per-session durable sequence record

use arrayvec::ArrayString;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Maximum length for CompID strings in bytes.
pub const COMP_ID_MAX_LEN: usize = 32;

/// Message sequence number.
///
/// Sequence numbers are unsigned 64-bit integers that identify messages
/// within a session. They start at 1 and increment for each message sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
#[serde(transparent)]
pub struct SeqNum(u64);

impl SeqNum {
    /// Creates a new sequence number.
    #[inline]
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw sequence number value.
    #[inline]
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// Returns the next sequence number.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Checks if this sequence number is valid (>= 1).
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 >= 1
    }
}

impl Default for SeqNum {
    fn default() -> Self {
        Self(1)
    }
}

impl From<u64> for SeqNum {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<SeqNum> for u64 {
    fn from(seq: SeqNum) -> Self {
        seq.0
    }
}

impl fmt::Display for SeqNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// ILink3 connection nonce.
///
/// A 64-bit value chosen by the initiator at Negotiate time. Each uuid
/// identifies a distinct connection epoch with an independent sequence space.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[repr(transparent)]
#[serde(transparent)]
pub struct Uuid(u64);

impl Uuid {
    /// The null uuid, used before any connection has been negotiated.
    pub const NULL: Self = Self(0);

    /// Creates a uuid from its raw value.
    #[inline]
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw uuid value.
    #[inline]
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// Returns true if this is the null uuid.
    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl From<u64> for Uuid {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Dense session identifier assigned by the registry on first logon.
///
/// Persisted alongside the sequence state and reused on reconnection.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[repr(transparent)]
#[serde(transparent)]
pub struct SessionId(u64);

impl SessionId {
    /// Creates a session id from its raw value.
    #[inline]
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw session id value.
    #[inline]
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// FIX protocol timestamp with millisecond precision.
///
/// Formatted on the wire as `YYYYMMDD-HH:MM:SS.sss`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp {
    /// Milliseconds since Unix epoch (1970-01-01 00:00:00 UTC).
    millis_since_epoch: u64,
}

impl Timestamp {
    /// Creates a timestamp from milliseconds since Unix epoch.
    #[inline]
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self {
            millis_since_epoch: millis,
        }
    }

    /// Returns the current UTC timestamp.
    #[inline]
    #[must_use]
    pub fn now() -> Self {
        let dt = Utc::now();
        Self {
            millis_since_epoch: dt.timestamp_millis().max(0) as u64,
        }
    }

    /// Returns milliseconds since Unix epoch.
    #[inline]
    #[must_use]
    pub const fn as_millis(self) -> u64 {
        self.millis_since_epoch
    }

    /// Converts to a chrono `DateTime<Utc>`.
    #[must_use]
    pub fn to_datetime(self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.millis_since_epoch as i64).unwrap_or_default()
    }

    /// Formats the timestamp in FIX SendingTime format.
    ///
    /// Format: `YYYYMMDD-HH:MM:SS.sss`
    #[must_use]
    pub fn format_millis(self) -> ArrayString<21> {
        let dt = self.to_datetime();
        let mut buf = ArrayString::new();
        let _ = std::fmt::write(
            &mut buf,
            format_args!("{}", dt.format("%Y%m%d-%H:%M:%S%.3f")),
        );
        buf
    }

    /// Parses a FIX SendingTime value.
    ///
    /// Accepts second, millisecond, and microsecond precision.
    #[must_use]
    pub fn parse_fix(value: &str) -> Option<Self> {
        let fmt = match value.len() {
            17 => "%Y%m%d-%H:%M:%S",
            21 => "%Y%m%d-%H:%M:%S%.3f",
            24 => "%Y%m%d-%H:%M:%S%.6f",
            _ => return None,
        };
        let dt = chrono::NaiveDateTime::parse_from_str(value, fmt).ok()?;
        Some(Self {
            millis_since_epoch: dt.and_utc().timestamp_millis().max(0) as u64,
        })
    }
}

impl Default for Timestamp {
    fn default() -> Self {
        Self::now()
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.format_millis())
    }
}

/// Component identifier for FIX sessions.
///
/// Used for SenderCompID (tag 49), TargetCompID (tag 56), and related fields.
/// Maximum length is 32 characters.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
#[serde(transparent)]
pub struct CompId(ArrayString<COMP_ID_MAX_LEN>);

impl CompId {
    /// Creates a new CompId from a string slice.
    ///
    /// Returns `None` if the string exceeds the maximum length.
    #[must_use]
    pub fn new(s: &str) -> Option<Self> {
        ArrayString::from(s).ok().map(Self)
    }

    /// Creates a CompId from raw ASCII bytes.
    ///
    /// Returns `None` if the bytes are not valid ASCII or exceed the
    /// maximum length.
    #[must_use]
    pub fn from_ascii(bytes: &[u8]) -> Option<Self> {
        if !bytes.is_ascii() {
            return None;
        }
        let s = std::str::from_utf8(bytes).ok()?;
        Self::new(s)
    }

    /// Returns the CompId as a string slice.
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    /// Returns the CompId as raw bytes.
    #[inline]
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    /// Returns the length of the CompId in bytes.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if the CompId is empty.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl AsRef<str> for CompId {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl fmt::Display for CompId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for CompId {
    type Err = arrayvec::CapacityError<()>;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ArrayString::try_from(s)
            .map(Self)
            .map_err(|_| arrayvec::CapacityError::new(()))
    }
}

/// Why a session reached its terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DisconnectReason {
    /// Logout or Terminate handshake completed normally.
    Graceful,
    /// No reply from the counterparty within the configured window.
    Timeout,
    /// The counterparty violated the session protocol.
    ProtocolViolation,
    /// Logon/Negotiate/Establish was rejected.
    AuthenticationFailure,
    /// The transport dropped unexpectedly.
    TransportFault,
    /// The engine is shutting down.
    EngineShutdown,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Graceful => "graceful",
            Self::Timeout => "timeout",
            Self::ProtocolViolation => "protocol violation",
            Self::AuthenticationFailure => "authentication failure",
            Self::TransportFault => "transport fault",
            Self::EngineShutdown => "engine shutdown",
        };
        f.write_str(name)
    }
}

/// Durable per-session sequence record.
///
/// Loaded on session construction and saved before any send that depends on
/// it reaching the wire. The uuid fields are only meaningful for ILink3
/// sessions; FIX sessions leave them null.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceState {
    /// Next sequence number to assign to an outbound message.
    pub next_sent_seq_no: u64,
    /// Next sequence number expected on an inbound message.
    pub next_recv_seq_no: u64,
    /// Bumped on every in-session sequence reset; disambiguates reused
    /// sequence numbers.
    pub sequence_index: u32,
    /// Current connection epoch (ILink3).
    pub uuid: Uuid,
    /// Previous connection epoch, kept for cross-uuid retransmit queries.
    pub last_uuid: Uuid,
    /// Next expected inbound sequence number on `last_uuid` at the time the
    /// epoch rolled over.
    pub last_recv_seq_no: u64,
}

impl SequenceState {
    /// A fresh state: both sequence counters at 1, no connection epoch.
    #[must_use]
    pub const fn initial() -> Self {
        Self {
            next_sent_seq_no: 1,
            next_recv_seq_no: 1,
            sequence_index: 0,
            uuid: Uuid::NULL,
            last_uuid: Uuid::NULL,
            last_recv_seq_no: 1,
        }
    }

    /// Rolls over to a new connection epoch.
    ///
    /// The current uuid becomes `last_uuid` and the inbound counter for it is
    /// stashed for cross-uuid retransmit queries; both live counters restart
    /// at 1.
    pub fn begin_epoch(&mut self, uuid: Uuid) {
        self.last_uuid = self.uuid;
        self.last_recv_seq_no = self.next_recv_seq_no;
        self.uuid = uuid;
        self.next_sent_seq_no = 1;
        self.next_recv_seq_no = 1;
    }

    /// Resets both sequence counters and bumps the sequence index.
    pub fn reset_sequence(&mut self) {
        self.next_sent_seq_no = 1;
        self.next_recv_seq_no = 1;
        self.sequence_index += 1;
    }
}

impl Default for SequenceState {
    fn default() -> Self {
        Self::initial()
    }
}
