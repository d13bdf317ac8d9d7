/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! # Fixgate ILink3
//!
//! ILink3 initiator session layer for the fixgate gateway.
//!
//! This crate provides:
//! - **Connection FSM**: negotiate/establish handshake with single-retry
//!   timeouts, keepalive Sequence handling, terminate handshake
//! - **Retransmit engine**: bounded batched recovery of inbound gaps,
//!   including cross-uuid recovery after reconnection
//! - **NotApplied handling**: gap fill or archive replay of our outbound
//!   stream, chosen by the application handler
//! - **Configuration**: connection configuration and builder

pub mod config;
pub mod connection;
pub mod handler;
pub mod retransmit;

pub use config::{Ilink3ConnectionConfiguration, KEEP_ALIVE_INTERVAL_MAX_MS};
pub use connection::{Ilink3Connection, Ilink3Context, Ilink3SessionState};
pub use handler::{Ilink3ConnectionHandler, NotAppliedResponse};
pub use retransmit::{NOT_AWAITING_RETRANSMIT, RetransmitBatch, Retransmitter};
