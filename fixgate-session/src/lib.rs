/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! # Fixgate Session
//!
//! FIX session layer protocol implementation for the fixgate gateway.
//!
//! This crate provides:
//! - **State machine**: poll-driven session FSM for initiator and acceptor
//! - **Sequence policing**: gap detection, ResendRequest, PossDup handling
//! - **Heartbeat handling**: Heartbeat/TestRequest deadline logic
//! - **Resend serving**: archive replay and gap-fill for counterparty
//!   ResendRequests
//! - **Configuration**: session configuration options

pub mod config;
pub mod handler;
pub mod heartbeat;
pub mod session;
pub mod state;

pub use config::SessionConfig;
pub use handler::{FixSessionHandler, NoOpSessionHandler};
pub use heartbeat::HeartbeatState;
pub use session::{FixSession, SessionContext};
pub use state::{FixSessionState, SessionRole};
