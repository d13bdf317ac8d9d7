/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! # Fixgate Store
//!
//! Durable state for the fixgate gateway.
//!
//! This crate provides:
//! - **Sequence store**: per-session durable sequence state, file-backed
//!   with atomic rewrite-then-rename, plus an in-memory variant for tests
//! - **Message archive**: outbound message retention for resend and
//!   retransmission replay

pub mod file;
pub mod memory;
pub mod traits;

pub use file::FileSequenceStore;
pub use memory::{MemoryArchive, MemorySequenceStore};
pub use traits::{MessageArchive, SequenceStore};
