/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! FIX session state and role.
//!
//! The session is a runtime state machine: `poll` and the inbound dispatch
//! branch on the live state, so states are a plain enum rather than types.
//! Role-specific behaviour (who sends Logon first) hangs off [`SessionRole`].

use std::fmt;

/// Runtime state of a FIX session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FixSessionState {
    /// TCP connected; initiator has not yet sent Logon, acceptor is waiting
    /// for one.
    Connected,
    /// Initiator sent Logon, awaiting the counterparty's.
    SentLogon,
    /// Logon exchange complete, session traffic flowing.
    Active,
    /// Logout sent, awaiting the counterparty's Logout or the timeout.
    AwaitingLogout,
    /// Terminal: the connection is gone and final state is persisted.
    Disconnected,
}

impl FixSessionState {
    /// Returns true for the terminal state.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Disconnected)
    }

    /// Returns true while application messages may be sent.
    #[must_use]
    pub const fn can_send_application(self) -> bool {
        matches!(self, Self::Active)
    }

    /// Short name for logging.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Connected => "CONNECTED",
            Self::SentLogon => "SENT_LOGON",
            Self::Active => "ACTIVE",
            Self::AwaitingLogout => "AWAITING_LOGOUT",
            Self::Disconnected => "DISCONNECTED",
        }
    }
}

impl fmt::Display for FixSessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Which side of the logon handshake this session plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionRole {
    /// Connects out and sends Logon first.
    Initiator,
    /// Accepts the connection and replies to the inbound Logon.
    Acceptor,
}
