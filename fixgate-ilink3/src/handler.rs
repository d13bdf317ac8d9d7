/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! ILink3 connection callbacks.
//!
//! All callbacks run on the framer thread inside `poll`/`on_frame` and must
//! not block.

use fixgate_core::{DisconnectReason, Ilink3Error, SessionId};

/// How to resolve a NotApplied from the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotAppliedResponse {
    /// Announce the current sequence number with a Sequence message; the
    /// missing range is skipped, nothing is replayed.
    GapFill,
    /// Replay the archived messages; business sends are locked out until
    /// the replay drains.
    Retransmit,
}

/// Callbacks an ILink3 connection delivers to its owning library.
pub trait Ilink3ConnectionHandler {
    /// A business message arrived, live or replayed, in stream order.
    fn on_message(
        &mut self,
        session_id: SessionId,
        template_id: u16,
        seq_no: u64,
        poss_retrans: bool,
        payload: &[u8],
    );

    /// The exchange reported a gap in our outbound stream.
    fn on_not_applied(&mut self, from_seq_no: u64, msg_count: u64) -> NotAppliedResponse;

    /// The exchange rejected one of our retransmit requests.
    fn on_retransmit_reject(
        &mut self,
        reason: &str,
        from_seq_no: u64,
        msg_count: u64,
        error_codes: u16,
    );

    /// The connection reached ESTABLISHED.
    fn on_session_ready(&mut self, session_id: SessionId);

    /// The connection reached UNBOUND and the transport is gone.
    fn on_disconnect(&mut self, session_id: SessionId, reason: DisconnectReason);

    /// A protocol error was observed that does not have its own callback,
    /// e.g. a Terminate carrying the wrong uuid.
    fn on_error(&mut self, error: &Ilink3Error);
}
