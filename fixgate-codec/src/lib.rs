/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! # Fixgate Codec
//!
//! Wire codecs for the fixgate gateway.
//!
//! This crate provides:
//! - **FIX tag=value**: zero-copy decoding, checksum handling, and an
//!   encoder with automatic BeginString/BodyLength/CheckSum
//! - **Session views**: typed views and builders for the FIX session
//!   administration messages
//! - **ILink3 SBE**: little-endian session templates 500-510 and 513
//! - **Framing**: tokio codecs splitting both protocols out of a TCP stream

pub mod checksum;
pub mod decoder;
pub mod encoder;
pub mod fix;
pub mod frame;
pub mod sbe;

pub use checksum::{calculate_checksum, format_checksum, parse_checksum};
pub use decoder::{Decoder, FieldRef, validate_frame_checksum};
pub use encoder::Encoder;
pub use fix::{FixMessage, FixMsgType, SessionMessageEncoder};
pub use frame::{FixFrameCodec, FrameError, SofhFrameCodec};
