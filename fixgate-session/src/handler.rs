/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! Session event callbacks.
//!
//! All callbacks run on the framer thread inside `poll`/`on_frame` and must
//! not block; hand work that can wait to another thread.

use fixgate_core::{DisconnectReason, SessionId};

/// Callbacks a FIX session delivers to its owning library.
pub trait FixSessionHandler {
    /// An application message was accepted in sequence order.
    fn on_message(&mut self, session_id: SessionId, seq_no: u64, frame: &[u8]);

    /// The logon exchange completed and the session is ACTIVE.
    fn on_session_ready(&mut self, session_id: SessionId);

    /// The session reached DISCONNECTED.
    fn on_disconnect(&mut self, session_id: SessionId, reason: DisconnectReason);
}

/// No-op handler for tests and fire-and-forget sessions.
#[derive(Debug, Default)]
pub struct NoOpSessionHandler;

impl FixSessionHandler for NoOpSessionHandler {
    fn on_message(&mut self, _session_id: SessionId, _seq_no: u64, _frame: &[u8]) {}

    fn on_session_ready(&mut self, _session_id: SessionId) {}

    fn on_disconnect(&mut self, _session_id: SessionId, _reason: DisconnectReason) {}
}
