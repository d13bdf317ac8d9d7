/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! Composite session keys.
//!
//! A [`CompositeKey`] identifies a logical FIX session across reconnections.
//! Equality and hashing are component-wise over the raw bytes, and the key
//! has a stable wire encoding used by the sequence store: each component is
//! written with a little-endian u16 length prefix, absent optional
//! components encode with length 0.

use crate::error::{DecodeError, EncodeError};
use crate::types::CompId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Sentinel returned by [`CompositeKey::save`] when the target buffer cannot
/// hold the encoded record.
pub const INSUFFICIENT_SPACE: isize = -1;

/// Number of length-prefix bytes in an encoded key record.
const LENGTH_FIELDS: usize = 4 * 2;

/// Identifies a logical FIX session.
///
/// Sub and location ids are optional; sessions distinguished only by comp ids
/// leave them unset.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CompositeKey {
    /// SenderCompID (tag 49).
    pub sender_comp_id: CompId,
    /// SenderSubID (tag 50), if used by the counterparty.
    pub sender_sub_id: Option<CompId>,
    /// SenderLocationID (tag 142), if used by the counterparty.
    pub sender_location_id: Option<CompId>,
    /// TargetCompID (tag 56).
    pub target_comp_id: CompId,
}

impl CompositeKey {
    /// Creates a key from sender and target comp ids.
    #[must_use]
    pub fn new(sender_comp_id: CompId, target_comp_id: CompId) -> Self {
        Self {
            sender_comp_id,
            sender_sub_id: None,
            sender_location_id: None,
            target_comp_id,
        }
    }

    /// Sets the sender sub id.
    #[must_use]
    pub fn with_sender_sub_id(mut self, sub_id: CompId) -> Self {
        self.sender_sub_id = Some(sub_id);
        self
    }

    /// Sets the sender location id.
    #[must_use]
    pub fn with_sender_location_id(mut self, location_id: CompId) -> Self {
        self.sender_location_id = Some(location_id);
        self
    }

    /// Returns the total size of the encoded record in bytes.
    #[must_use]
    pub fn encoded_length(&self) -> usize {
        LENGTH_FIELDS
            + self.sender_comp_id.len()
            + self.sender_sub_id.as_ref().map_or(0, CompId::len)
            + self.sender_location_id.as_ref().map_or(0, CompId::len)
            + self.target_comp_id.len()
    }

    /// Encodes the key into `buffer` at `offset`.
    ///
    /// Returns the number of bytes written, or [`INSUFFICIENT_SPACE`] if the
    /// buffer cannot hold the record. The buffer is untouched on failure.
    #[must_use]
    pub fn save(&self, buffer: &mut [u8], offset: usize) -> isize {
        let length = self.encoded_length();
        if buffer.len() < offset + length {
            return INSUFFICIENT_SPACE;
        }

        let mut at = offset;
        at = put_component(buffer, at, Some(&self.sender_comp_id));
        at = put_component(buffer, at, self.sender_sub_id.as_ref());
        at = put_component(buffer, at, self.sender_location_id.as_ref());
        at = put_component(buffer, at, Some(&self.target_comp_id));
        debug_assert_eq!(at - offset, length);

        length as isize
    }

    /// Encodes the key, reporting failures as typed errors.
    ///
    /// # Errors
    /// Returns [`EncodeError::InsufficientSpace`] when the buffer cannot hold
    /// `encoded_length()` bytes at `offset`; the buffer is untouched.
    pub fn encode(&self, buffer: &mut [u8], offset: usize) -> Result<usize, EncodeError> {
        match self.save(buffer, offset) {
            INSUFFICIENT_SPACE => Err(EncodeError::InsufficientSpace {
                needed: self.encoded_length(),
                available: buffer.len().saturating_sub(offset),
            }),
            written => Ok(written as usize),
        }
    }

    /// Decodes a key record from `buffer` at `offset`.
    ///
    /// Returns the key and the number of bytes consumed.
    ///
    /// # Errors
    /// Returns [`DecodeError::TruncatedFrame`] when the buffer ends inside
    /// the record, or [`DecodeError::InvalidFieldValue`] when a component is
    /// not valid ASCII of permitted length.
    pub fn load(buffer: &[u8], offset: usize) -> Result<(Self, usize), DecodeError> {
        let mut at = offset;
        let sender_comp_id = get_component(buffer, &mut at, 49)?;
        let sender_sub_id = get_component_opt(buffer, &mut at, 50)?;
        let sender_location_id = get_component_opt(buffer, &mut at, 142)?;
        let target_comp_id = get_component(buffer, &mut at, 56)?;

        Ok((
            Self {
                sender_comp_id,
                sender_sub_id,
                sender_location_id,
                target_comp_id,
            },
            at - offset,
        ))
    }

    /// Stable 64-bit hash of the key components.
    ///
    /// FNV-1a over each component with a separator byte between them, used to
    /// derive sequence file names. Stable across processes, unlike the std
    /// hasher.
    #[must_use]
    pub fn stable_hash(&self) -> u64 {
        const OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
        const PRIME: u64 = 0x0000_0100_0000_01b3;

        let mut hash = OFFSET_BASIS;
        let mut mix = |bytes: &[u8]| {
            for &b in bytes {
                hash ^= u64::from(b);
                hash = hash.wrapping_mul(PRIME);
            }
            hash ^= u64::from(0x1fu8);
            hash = hash.wrapping_mul(PRIME);
        };

        mix(self.sender_comp_id.as_bytes());
        mix(self.sender_sub_id.as_ref().map_or(b"", |c| c.as_bytes()));
        mix(self
            .sender_location_id
            .as_ref()
            .map_or(b"", |c| c.as_bytes()));
        mix(self.target_comp_id.as_bytes());
        hash
    }
}

impl fmt::Display for CompositeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.sender_comp_id)?;
        if let Some(sub) = &self.sender_sub_id {
            write!(f, "/{sub}")?;
        }
        if let Some(location) = &self.sender_location_id {
            write!(f, "/{location}")?;
        }
        write!(f, "->{}", self.target_comp_id)
    }
}

fn put_component(buffer: &mut [u8], at: usize, component: Option<&CompId>) -> usize {
    let bytes = component.map_or(b"" as &[u8], CompId::as_bytes);
    let len = bytes.len() as u16;
    buffer[at..at + 2].copy_from_slice(&len.to_le_bytes());
    buffer[at + 2..at + 2 + bytes.len()].copy_from_slice(bytes);
    at + 2 + bytes.len()
}

fn read_length(buffer: &[u8], at: &mut usize) -> Result<usize, DecodeError> {
    if buffer.len() < *at + 2 {
        return Err(DecodeError::TruncatedFrame {
            needed: *at + 2,
            available: buffer.len(),
        });
    }
    let len = u16::from_le_bytes([buffer[*at], buffer[*at + 1]]) as usize;
    *at += 2;
    if buffer.len() < *at + len {
        return Err(DecodeError::TruncatedFrame {
            needed: *at + len,
            available: buffer.len(),
        });
    }
    Ok(len)
}

fn get_component(buffer: &[u8], at: &mut usize, tag: u32) -> Result<CompId, DecodeError> {
    let len = read_length(buffer, at)?;
    let bytes = &buffer[*at..*at + len];
    *at += len;
    CompId::from_ascii(bytes).ok_or_else(|| DecodeError::InvalidFieldValue {
        tag,
        reason: "not ascii or too long".to_string(),
    })
}

fn get_component_opt(
    buffer: &[u8],
    at: &mut usize,
    tag: u32,
) -> Result<Option<CompId>, DecodeError> {
    let len = read_length(buffer, at)?;
    if len == 0 {
        return Ok(None);
    }
    let bytes = &buffer[*at..*at + len];
    *at += len;
    CompId::from_ascii(bytes)
        .map(Some)
        .ok_or_else(|| DecodeError::InvalidFieldValue {
            tag,
            reason: "not ascii or too long".to_string(),
        })
}
