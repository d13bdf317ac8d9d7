/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! Zero-copy FIX field decoder.
//!
//! Parses FIX messages without allocating for field values; each field is
//! returned as a reference into the original buffer.

use crate::checksum::{calculate_checksum, parse_checksum};
use fixgate_core::DecodeError;
use memchr::memchr;

/// SOH (Start of Header) delimiter used in FIX messages.
pub const SOH: u8 = 0x01;

/// Equals sign delimiter between tag and value.
pub const EQUALS: u8 = b'=';

/// A tag/value pair borrowed from the input buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldRef<'a> {
    /// Field tag number.
    pub tag: u32,
    /// Raw field value bytes.
    pub value: &'a [u8],
}

impl<'a> FieldRef<'a> {
    /// Creates a new field reference.
    #[inline]
    #[must_use]
    pub const fn new(tag: u32, value: &'a [u8]) -> Self {
        Self { tag, value }
    }

    /// Returns the value as a string slice.
    ///
    /// # Errors
    /// Returns `DecodeError::InvalidUtf8` if the value is not valid UTF-8.
    pub fn as_str(&self) -> Result<&'a str, DecodeError> {
        Ok(std::str::from_utf8(self.value)?)
    }

    /// Parses the value as an unsigned integer.
    ///
    /// # Errors
    /// Returns `DecodeError::InvalidFieldValue` if the value is not a
    /// decimal integer.
    pub fn as_uint(&self) -> Result<u64, DecodeError> {
        self.as_str()?
            .parse()
            .map_err(|_| DecodeError::InvalidFieldValue {
                tag: self.tag,
                reason: "expected unsigned integer".to_string(),
            })
    }

    /// Interprets the value as a FIX boolean (Y/N).
    #[must_use]
    pub fn as_bool(&self) -> bool {
        self.value == b"Y"
    }
}

/// Zero-copy FIX field walker.
#[derive(Debug)]
pub struct Decoder<'a> {
    /// Input buffer.
    input: &'a [u8],
    /// Current position in the buffer.
    offset: usize,
}

impl<'a> Decoder<'a> {
    /// Creates a new decoder over a complete FIX frame.
    #[inline]
    #[must_use]
    pub const fn new(input: &'a [u8]) -> Self {
        Self { input, offset: 0 }
    }

    /// Parses the next field from the buffer.
    ///
    /// Returns `None` when the buffer is exhausted or no well-formed field
    /// remains.
    #[inline]
    pub fn next_field(&mut self) -> Option<FieldRef<'a>> {
        if self.offset >= self.input.len() {
            return None;
        }

        let remaining = &self.input[self.offset..];

        let eq_pos = memchr(EQUALS, remaining)?;
        let tag = parse_tag(&remaining[..eq_pos])?;

        let value_start = eq_pos + 1;
        let soh_pos = memchr(SOH, &remaining[value_start..])?;
        let value = &remaining[value_start..value_start + soh_pos];

        self.offset += value_start + soh_pos + 1;

        Some(FieldRef::new(tag, value))
    }

    /// Returns the current offset in the buffer.
    #[inline]
    #[must_use]
    pub const fn offset(&self) -> usize {
        self.offset
    }

    /// Returns true if the buffer has been fully consumed.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.offset >= self.input.len()
    }
}

impl<'a> Iterator for Decoder<'a> {
    type Item = FieldRef<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_field()
    }
}

/// Validates the CheckSum trailer of a complete FIX frame.
///
/// # Errors
/// Returns `DecodeError::Incomplete` when the trailer is missing and
/// `DecodeError::ChecksumMismatch` when the declared value disagrees with
/// the calculated one.
pub fn validate_frame_checksum(frame: &[u8]) -> Result<(), DecodeError> {
    // Trailer is |10=XXX| - 7 bytes.
    if frame.len() < 7 || &frame[frame.len() - 7..frame.len() - 4] != b"10=" {
        return Err(DecodeError::Incomplete);
    }

    let declared = parse_checksum(&frame[frame.len() - 4..frame.len() - 1]).ok_or(
        DecodeError::InvalidFieldValue {
            tag: 10,
            reason: "invalid checksum format".to_string(),
        },
    )?;
    let calculated = calculate_checksum(&frame[..frame.len() - 7]);

    if calculated != declared {
        return Err(DecodeError::ChecksumMismatch {
            calculated,
            declared,
        });
    }
    Ok(())
}

/// Parses a tag number from ASCII bytes.
#[inline]
fn parse_tag(bytes: &[u8]) -> Option<u32> {
    if bytes.is_empty() || bytes.len() > 10 {
        return None;
    }

    let mut result: u32 = 0;
    for &b in bytes {
        if !b.is_ascii_digit() {
            return None;
        }
        result = result.checked_mul(10)?.checked_add((b - b'0') as u32)?;
    }

    Some(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tag() {
        assert_eq!(parse_tag(b"8"), Some(8));
        assert_eq!(parse_tag(b"35"), Some(35));
        assert_eq!(parse_tag(b"12345"), Some(12345));
        assert_eq!(parse_tag(b""), None);
        assert_eq!(parse_tag(b"abc"), None);
        assert_eq!(parse_tag(b"12a"), None);
    }

    #[test]
    fn test_next_field() {
        let input = b"8=FIX.4.4\x019=5\x0135=0\x01";
        let mut decoder = Decoder::new(input);

        let field1 = decoder.next_field().unwrap();
        assert_eq!(field1.tag, 8);
        assert_eq!(field1.as_str().unwrap(), "FIX.4.4");

        let field2 = decoder.next_field().unwrap();
        assert_eq!(field2.tag, 9);
        assert_eq!(field2.as_uint().unwrap(), 5);

        let field3 = decoder.next_field().unwrap();
        assert_eq!(field3.tag, 35);

        assert!(decoder.next_field().is_none());
        assert!(decoder.is_empty());
    }

    #[test]
    fn test_field_as_bool() {
        let mut decoder = Decoder::new(b"43=Y\x0143=N\x01");
        assert!(decoder.next_field().unwrap().as_bool());
        assert!(!decoder.next_field().unwrap().as_bool());
    }

    #[test]
    fn test_validate_frame_checksum() {
        let body = b"8=FIX.4.4\x019=5\x0135=0\x01";
        let checksum = calculate_checksum(body);
        let mut frame = body.to_vec();
        frame.extend_from_slice(b"10=");
        frame.extend_from_slice(&crate::checksum::format_checksum(checksum));
        frame.push(SOH);

        assert!(validate_frame_checksum(&frame).is_ok());

        frame[0] ^= 1;
        assert!(matches!(
            validate_frame_checksum(&frame),
            Err(DecodeError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_validate_frame_checksum_missing_trailer() {
        assert!(matches!(
            validate_frame_checksum(b"8=FIX.4.4\x01"),
            Err(DecodeError::Incomplete)
        ));
    }
}
