/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! # Fixgate Engine
//!
//! Session ownership and scheduling for the fixgate gateway.
//!
//! This crate provides:
//! - **Registry**: exclusive ownership of sessions, duplicate-connection
//!   rejection, connection routing
//! - **Framer**: the single-threaded cooperative duty cycle driving every
//!   session, with a cross-thread control queue and adaptive idling
//! - **Publication**: the bounded claim-then-commit ring feeding transport
//!   writers
//! - **Transport glue**: tokio TCP channels framing both protocols

pub mod engine;
pub mod publication;
pub mod registry;
pub mod transport;

pub use engine::{
    ControlMessage, EngineConfiguration, Framer, FramerHandle, IdleStrategy, TransportEvent,
};
pub use publication::RingPublication;
pub use registry::{GatewaySession, SessionRegistry};
pub use transport::{WireProtocol, run_acceptor_channel, run_initiator_channel};
