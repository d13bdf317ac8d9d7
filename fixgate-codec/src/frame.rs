/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! Tokio codecs for frame splitting.
//!
//! [`FixFrameCodec`] walks BeginString/BodyLength to delimit tag=value
//! frames and optionally validates the checksum trailer. [`SofhFrameCodec`]
//! splits ILink3 frames on the Simple Open Framing Header length field.
//! Both hand complete frames to the session layer without interpreting them.

use crate::checksum::{calculate_checksum, parse_checksum};
use crate::sbe::{SOFH_ENCODING_SBE_LE, SOFH_LEN};
use bytes::{BufMut, BytesMut};
use memchr::memchr;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Errors that can occur during frame splitting.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Invalid BeginString field.
    #[error("invalid begin string: message must start with 8=")]
    InvalidBeginString,

    /// Missing BodyLength field.
    #[error("missing body length field (tag 9)")]
    MissingBodyLength,

    /// Invalid BodyLength value.
    #[error("invalid body length value")]
    InvalidBodyLength,

    /// Checksum mismatch.
    #[error("checksum mismatch: calculated {calculated}, declared {declared}")]
    ChecksumMismatch {
        /// Calculated checksum.
        calculated: u8,
        /// Declared checksum in message.
        declared: u8,
    },

    /// SOFH carries an unexpected encoding type.
    #[error("invalid sofh encoding type: {0:#06x}")]
    InvalidEncodingType(u16),

    /// Frame exceeds maximum size.
    #[error("message too large: {size} bytes exceeds maximum {max_size}")]
    MessageTooLarge {
        /// Actual frame size.
        size: usize,
        /// Maximum allowed size.
        max_size: usize,
    },

    /// I/O error.
    #[error("io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for FrameError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// SOH delimiter.
const SOH: u8 = 0x01;

/// Tokio codec for FIX frame splitting.
///
/// Parses frames out of a byte stream by walking BeginString and BodyLength,
/// optionally validating the checksum trailer.
#[derive(Debug, Clone)]
pub struct FixFrameCodec {
    /// Maximum frame size in bytes.
    max_message_size: usize,
    /// Whether to validate checksums.
    validate_checksum: bool,
}

impl FixFrameCodec {
    /// Creates a new codec with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self {
            max_message_size: 1024 * 1024,
            validate_checksum: true,
        }
    }

    /// Sets the maximum frame size.
    #[must_use]
    pub const fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    /// Sets whether to validate checksums.
    #[must_use]
    pub const fn with_checksum_validation(mut self, validate: bool) -> Self {
        self.validate_checksum = validate;
        self
    }
}

impl Default for FixFrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FixFrameCodec {
    type Item = BytesMut;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Smallest well-formed frame is ~20 bytes.
        if src.len() < 20 {
            return Ok(None);
        }

        if &src[0..2] != b"8=" {
            return Err(FrameError::InvalidBeginString);
        }

        let first_soh = match memchr(SOH, src) {
            Some(pos) => pos,
            None => return Ok(None),
        };

        let body_len_start = first_soh + 1;
        if src.len() < body_len_start + 3 {
            return Ok(None);
        }

        if &src[body_len_start..body_len_start + 2] != b"9=" {
            return Err(FrameError::MissingBodyLength);
        }

        let body_len_soh = match memchr(SOH, &src[body_len_start..]) {
            Some(pos) => body_len_start + pos,
            None => return Ok(None),
        };

        let body_len_str = std::str::from_utf8(&src[body_len_start + 2..body_len_soh])
            .map_err(|_| FrameError::InvalidBodyLength)?;
        let body_length: usize = body_len_str
            .parse()
            .map_err(|_| FrameError::InvalidBodyLength)?;

        // BodyLength counts from after 9=X| to before 10=; the trailer
        // 10=XXX| adds 7 bytes.
        let total_length = body_len_soh + 1 + body_length + 7;

        if total_length > self.max_message_size {
            return Err(FrameError::MessageTooLarge {
                size: total_length,
                max_size: self.max_message_size,
            });
        }

        if src.len() < total_length {
            src.reserve(total_length - src.len());
            return Ok(None);
        }

        if self.validate_checksum {
            let checksum_start = total_length - 4;
            let declared = parse_checksum(&src[checksum_start..checksum_start + 3])
                .ok_or(FrameError::InvalidBodyLength)?;
            let calculated = calculate_checksum(&src[..total_length - 7]);

            if calculated != declared {
                return Err(FrameError::ChecksumMismatch {
                    calculated,
                    declared,
                });
            }
        }

        Ok(Some(src.split_to(total_length)))
    }
}

impl Encoder<&[u8]> for FixFrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: &[u8], dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(item.len());
        dst.put_slice(item);
        Ok(())
    }
}

/// Tokio codec for ILink3 frame splitting.
///
/// Splits on the SOFH message-length field; the encoding type is checked so
/// a desynchronised stream fails fast instead of producing garbage frames.
#[derive(Debug, Clone)]
pub struct SofhFrameCodec {
    /// Maximum frame size in bytes.
    max_message_size: usize,
}

impl SofhFrameCodec {
    /// Creates a new codec with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self {
            max_message_size: 64 * 1024,
        }
    }

    /// Sets the maximum frame size.
    #[must_use]
    pub const fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }
}

impl Default for SofhFrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for SofhFrameCodec {
    type Item = BytesMut;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < SOFH_LEN {
            return Ok(None);
        }

        let length = u16::from_le_bytes([src[0], src[1]]) as usize;
        let encoding = u16::from_le_bytes([src[2], src[3]]);
        if encoding != SOFH_ENCODING_SBE_LE {
            return Err(FrameError::InvalidEncodingType(encoding));
        }

        if length > self.max_message_size {
            return Err(FrameError::MessageTooLarge {
                size: length,
                max_size: self.max_message_size,
            });
        }

        if src.len() < length {
            src.reserve(length - src.len());
            return Ok(None);
        }

        Ok(Some(src.split_to(length)))
    }
}

impl Encoder<&[u8]> for SofhFrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: &[u8], dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(item.len());
        dst.put_slice(item);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sbe::{self, encode_business};
    use fixgate_core::Uuid;

    fn make_fix_message(body: &str) -> Vec<u8> {
        let header = format!("8=FIX.4.4\x019={}\x01", body.len());
        let without_checksum = format!("{header}{body}");
        let checksum = calculate_checksum(without_checksum.as_bytes());
        format!("{without_checksum}10={checksum:03}\x01").into_bytes()
    }

    #[test]
    fn test_fix_decode_complete_message() {
        let mut codec = FixFrameCodec::new();
        let msg = make_fix_message("35=0\x0134=1\x01");
        let mut buf = BytesMut::from(&msg[..]);

        let result = codec.decode(&mut buf).unwrap();
        assert_eq!(&result.unwrap()[..], &msg[..]);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_fix_decode_incomplete() {
        let mut codec = FixFrameCodec::new();
        let msg = make_fix_message("35=0\x0134=1\x01");
        let mut buf = BytesMut::from(&msg[..msg.len() - 5]);

        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_fix_decode_two_frames() {
        let mut codec = FixFrameCodec::new();
        let msg = make_fix_message("35=0\x0134=1\x01");
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&msg);
        buf.extend_from_slice(&msg);

        assert!(codec.decode(&mut buf).unwrap().is_some());
        assert!(codec.decode(&mut buf).unwrap().is_some());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_fix_decode_invalid_begin_string() {
        let mut codec = FixFrameCodec::new();
        let mut buf = BytesMut::from(&b"9=FIX.4.4\x019=5\x0135=0\x0110=000\x01"[..]);

        assert!(matches!(
            codec.decode(&mut buf),
            Err(FrameError::InvalidBeginString)
        ));
    }

    #[test]
    fn test_fix_decode_checksum_mismatch() {
        let mut codec = FixFrameCodec::new();
        let mut buf = BytesMut::from(&b"8=FIX.4.4\x019=5\x0135=0\x0110=000\x01"[..]);

        assert!(matches!(
            codec.decode(&mut buf),
            Err(FrameError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_sofh_decode_complete_frame() {
        let mut codec = SofhFrameCodec::new();
        let frame = encode_business(532, Uuid::new(1), 1, false, b"xyz");
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&frame);
        buf.extend_from_slice(&frame);

        let first = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&first[..], &frame[..]);
        assert!(codec.decode(&mut buf).unwrap().is_some());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_sofh_decode_incomplete() {
        let mut codec = SofhFrameCodec::new();
        let frame = encode_business(532, Uuid::new(1), 1, false, b"xyz");
        let mut buf = BytesMut::from(&frame[..frame.len() - 1]);

        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_sofh_decode_bad_encoding() {
        let mut codec = SofhFrameCodec::new();
        let mut buf = BytesMut::from(&[8u8, 0, 0xAB, 0xCD, 0, 0, 0, 0][..]);

        assert!(matches!(
            codec.decode(&mut buf),
            Err(FrameError::InvalidEncodingType(_))
        ));
    }

    #[test]
    fn test_sofh_rejects_oversized() {
        let mut codec = SofhFrameCodec::new().with_max_message_size(16);
        let mut buf = BytesMut::from(
            &[
                64u8,
                0,
                (sbe::SOFH_ENCODING_SBE_LE & 0xFF) as u8,
                (sbe::SOFH_ENCODING_SBE_LE >> 8) as u8,
            ][..],
        );

        assert!(matches!(
            codec.decode(&mut buf),
            Err(FrameError::MessageTooLarge { .. })
        ));
    }
}
