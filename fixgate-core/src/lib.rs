/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! # Fixgate Core
//!
//! Core types, traits, and error definitions for the fixgate gateway.
//!
//! This crate provides the building blocks shared by every fixgate crate:
//! - **Error types**: unified error handling with `thiserror`
//! - **Session identity**: `CompositeKey`, `SessionId`, `CompId`
//! - **Sequence tracking**: `SeqNum`, `Uuid`, `SequenceState`
//! - **Time**: the injectable `EpochClock` and FIX `Timestamp`
//! - **Publication**: the claim-then-commit outbound sink contract

pub mod clock;
pub mod error;
pub mod key;
pub mod publication;
pub mod types;

pub use clock::{EpochClock, ManualClock, SystemEpochClock};
pub use error::{
    DecodeError, EncodeError, EngineError, GateError, Ilink3Error, Result, SessionError,
    StoreError,
};
pub use key::{CompositeKey, INSUFFICIENT_SPACE};
pub use publication::Publication;
pub use types::{CompId, DisconnectReason, SeqNum, SequenceState, SessionId, Timestamp, Uuid};
