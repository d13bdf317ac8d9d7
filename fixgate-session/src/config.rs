/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! FIX session configuration.

use fixgate_core::{CompId, CompositeKey};

/// Default heartbeat interval.
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 30_000;

/// Default reasonable transmission time added to receive deadlines.
pub const DEFAULT_REASONABLE_TRANSMISSION_TIME_MS: u64 = 300;

/// Default tolerance for inbound SendingTime deviation.
pub const DEFAULT_SENDING_TIME_WINDOW_MS: u64 = 10_000;

/// Default wait for a counterparty Logout reply.
pub const DEFAULT_LOGOUT_TIMEOUT_MS: u64 = 10_000;

/// Configuration for a FIX session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Sender CompID (tag 49).
    pub sender_comp_id: CompId,
    /// Target CompID (tag 56).
    pub target_comp_id: CompId,
    /// Optional sender sub ID (tag 50).
    pub sender_sub_id: Option<CompId>,
    /// Optional sender location ID (tag 142).
    pub sender_location_id: Option<CompId>,
    /// FIX version BeginString (e.g., "FIX.4.4").
    pub begin_string: &'static str,
    /// Heartbeat interval in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// Grace added to receive deadlines before a TestRequest fires.
    pub reasonable_transmission_time_ms: u64,
    /// Tolerance for inbound SendingTime deviation from local time.
    pub sending_time_window_ms: u64,
    /// Wait for the counterparty's Logout before force-disconnecting.
    pub logout_timeout_ms: u64,
    /// Send Logon with sequence numbers reset to 1.
    pub reset_seq_num: bool,
    /// Permit a non-gap-fill SequenceReset to rewind inbound sequence
    /// numbers. Off unless an operator has authorised the rewind.
    pub allow_seq_no_rewind: bool,
    /// Emit and track LastMsgSeqNumProcessed (tag 369).
    pub enable_last_msg_seq_num_processed: bool,
    /// Username (tag 553) sent on Logon.
    pub username: Option<String>,
    /// Password (tag 554) sent on Logon.
    pub password: Option<String>,
}

impl SessionConfig {
    /// Creates a configuration with required identity fields and defaults
    /// for everything else.
    #[must_use]
    pub fn new(
        sender_comp_id: CompId,
        target_comp_id: CompId,
        begin_string: &'static str,
    ) -> Self {
        Self {
            sender_comp_id,
            target_comp_id,
            sender_sub_id: None,
            sender_location_id: None,
            begin_string,
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            reasonable_transmission_time_ms: DEFAULT_REASONABLE_TRANSMISSION_TIME_MS,
            sending_time_window_ms: DEFAULT_SENDING_TIME_WINDOW_MS,
            logout_timeout_ms: DEFAULT_LOGOUT_TIMEOUT_MS,
            reset_seq_num: false,
            allow_seq_no_rewind: false,
            enable_last_msg_seq_num_processed: false,
            username: None,
            password: None,
        }
    }

    /// Sets the heartbeat interval.
    #[must_use]
    pub const fn with_heartbeat_interval_ms(mut self, interval_ms: u64) -> Self {
        self.heartbeat_interval_ms = interval_ms;
        self
    }

    /// Sets whether to reset sequence numbers on logon.
    #[must_use]
    pub const fn with_reset_seq_num(mut self, reset: bool) -> Self {
        self.reset_seq_num = reset;
        self
    }

    /// Sets the sender sub ID.
    #[must_use]
    pub fn with_sender_sub_id(mut self, sub_id: CompId) -> Self {
        self.sender_sub_id = Some(sub_id);
        self
    }

    /// Sets the sender location ID.
    #[must_use]
    pub fn with_sender_location_id(mut self, location_id: CompId) -> Self {
        self.sender_location_id = Some(location_id);
        self
    }

    /// Sets the logon credentials.
    #[must_use]
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Sets the reasonable transmission time.
    #[must_use]
    pub const fn with_reasonable_transmission_time_ms(mut self, time_ms: u64) -> Self {
        self.reasonable_transmission_time_ms = time_ms;
        self
    }

    /// Sets the SendingTime tolerance window.
    #[must_use]
    pub const fn with_sending_time_window_ms(mut self, window_ms: u64) -> Self {
        self.sending_time_window_ms = window_ms;
        self
    }

    /// Sets the logout reply timeout.
    #[must_use]
    pub const fn with_logout_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.logout_timeout_ms = timeout_ms;
        self
    }

    /// Enables LastMsgSeqNumProcessed (tag 369) on outbound messages.
    #[must_use]
    pub const fn with_last_msg_seq_num_processed(mut self, enabled: bool) -> Self {
        self.enable_last_msg_seq_num_processed = enabled;
        self
    }

    /// Permits operator-authorised sequence number rewinds.
    #[must_use]
    pub const fn with_seq_no_rewind(mut self, allowed: bool) -> Self {
        self.allow_seq_no_rewind = allowed;
        self
    }

    /// The composite key identifying this session.
    #[must_use]
    pub fn composite_key(&self) -> CompositeKey {
        let mut key = CompositeKey::new(self.sender_comp_id.clone(), self.target_comp_id.clone());
        if let Some(sub) = &self.sender_sub_id {
            key = key.with_sender_sub_id(sub.clone());
        }
        if let Some(location) = &self.sender_location_id {
            key = key.with_sender_location_id(location.clone());
        }
        key
    }
}
