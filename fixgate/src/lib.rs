/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! # Fixgate
//!
//! A high-performance gateway for financial market messaging protocols:
//! FIX (tag=value) and ILink3 (CME's Simple Binary Encoding dialect).
//!
//! Fixgate mediates between exchange TCP endpoints and in-process library
//! clients. The heart of the gateway is the session layer: per-connection
//! state machines performing logon/negotiate handshakes, sequence-number
//! policing, heartbeating and keepalive, gap detection with retransmission,
//! graceful termination, and durable reconnection across process restarts.
//!
//! ## Design
//!
//! - **Poll-driven**: every session exposes `poll(now_ms)`; all waits are
//!   deadlines against an injectable clock, never blocking calls
//! - **Single-threaded framer**: sessions are pinned to one engine thread;
//!   other threads communicate through lock-free queues
//! - **Durable sequencing**: the intended next sequence number is persisted
//!   before the message claims its publication slot, so restarts resume
//!   exactly where the wire left off
//! - **Bounded recovery**: retransmit requests are batched and strictly one
//!   in flight per session
//!
//! ## Crate Organization
//!
//! - [`core`]: fundamental types, clock, errors, publication contract
//! - [`codec`]: FIX tag=value and ILink3 SBE wire codecs plus framing
//! - [`store`]: durable sequence store and message archive
//! - [`session`]: the FIX session state machine
//! - [`ilink3`]: the ILink3 initiator state machine and retransmit engine
//! - [`engine`]: session registry, framer duty cycle, transport glue

pub mod core {
    //! Fundamental types, clock, errors, and the publication contract.
    pub use fixgate_core::*;
}

pub mod codec {
    //! FIX tag=value and ILink3 SBE wire codecs.
    pub use fixgate_codec::*;
}

pub mod store {
    //! Durable sequence store and message archive.
    pub use fixgate_store::*;
}

pub mod session {
    //! FIX session layer protocol implementation.
    pub use fixgate_session::*;
}

pub mod ilink3 {
    //! ILink3 initiator session layer.
    pub use fixgate_ilink3::*;
}

pub mod engine {
    //! Session registry, framer, and transport glue.
    pub use fixgate_engine::*;
}

/// Prelude module for convenient imports.
pub mod prelude {
    // Core types
    pub use fixgate_core::{
        CompId, CompositeKey, DecodeError, DisconnectReason, EncodeError, EngineError, EpochClock,
        GateError, Ilink3Error, ManualClock, Publication, Result, SeqNum, SequenceState,
        SessionError, SessionId, StoreError, SystemEpochClock, Timestamp, Uuid,
    };

    // Codecs
    pub use fixgate_codec::{
        Decoder, Encoder, FixFrameCodec, FixMessage, FixMsgType, SessionMessageEncoder,
        SofhFrameCodec, calculate_checksum,
    };

    // Store
    pub use fixgate_store::{
        FileSequenceStore, MemoryArchive, MemorySequenceStore, MessageArchive, SequenceStore,
    };

    // FIX session
    pub use fixgate_session::{
        FixSession, FixSessionHandler, FixSessionState, SessionConfig, SessionContext,
        SessionRole,
    };

    // ILink3
    pub use fixgate_ilink3::{
        Ilink3Connection, Ilink3ConnectionConfiguration, Ilink3ConnectionHandler, Ilink3Context,
        Ilink3SessionState, NOT_AWAITING_RETRANSMIT, NotAppliedResponse,
    };

    // Engine
    pub use fixgate_engine::{
        Framer, FramerHandle, GatewaySession, RingPublication, SessionRegistry, TransportEvent,
        WireProtocol,
    };
}
