/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! ILink3 connection configuration.

use fixgate_core::{CompId, CompositeKey, Ilink3Error};

/// Protocol cap on the keep-alive interval.
pub const KEEP_ALIVE_INTERVAL_MAX_MS: u64 = 60_000;

/// Default keep-alive interval.
pub const DEFAULT_KEEP_ALIVE_INTERVAL_MS: u64 = 30_000;

/// Default window for a Negotiate reply, per attempt.
pub const DEFAULT_NEGOTIATE_TIMEOUT_MS: u64 = 5_000;

/// Default window for Establish and Terminate replies, per attempt.
pub const DEFAULT_REPLY_TIMEOUT_MS: u64 = 5_000;

/// Default maximum messages per retransmit request.
pub const DEFAULT_RETRANSMIT_BATCH_MAX: u64 = 2_500;

/// Configuration for an ILink3 initiator connection.
#[derive(Debug, Clone)]
pub struct Ilink3ConnectionConfiguration {
    /// Primary exchange host.
    pub host: String,
    /// Backup exchange host, used when `use_backup_host` is set.
    pub backup_host: Option<String>,
    /// Exchange port.
    pub port: u16,
    /// Session id, up to 3 ASCII characters.
    pub session_id: String,
    /// Firm id, up to 5 ASCII characters.
    pub firm_id: String,
    /// Access key id, up to 20 ASCII characters.
    pub access_key_id: String,
    /// Private key material for request signing.
    pub user_key: String,
    /// Requested keep-alive interval in milliseconds.
    pub keep_alive_interval_ms: u64,
    /// Window for a Negotiate reply, per attempt.
    pub negotiate_timeout_ms: u64,
    /// Window for Establish and Terminate replies, per attempt.
    pub reply_timeout_ms: u64,
    /// Maximum messages per retransmit request.
    pub retransmit_batch_max: u64,
    /// Skip Negotiate and re-establish the persisted uuid.
    pub re_establish_last_connection: bool,
    /// Connect to the backup host, continuing the same sequence state.
    pub use_backup_host: bool,
}

impl Ilink3ConnectionConfiguration {
    /// Starts a builder.
    #[must_use]
    pub fn builder() -> Ilink3ConnectionConfigurationBuilder {
        Ilink3ConnectionConfigurationBuilder::default()
    }

    /// The host profile this connection binds to, for duplicate-connection
    /// checks. Sequence state is shared across profiles; binds are not.
    #[must_use]
    pub fn host_profile(&self) -> &str {
        if self.use_backup_host {
            self.backup_host.as_deref().unwrap_or(&self.host)
        } else {
            &self.host
        }
    }

    /// The composite key identifying this connection's durable state.
    ///
    /// Keyed on session and firm only: a reconnection to the backup host
    /// continues the same sequence numbers.
    ///
    /// # Panics
    /// Never for configurations produced by the builder, which validates
    /// that both ids fit a `CompId`.
    #[must_use]
    pub fn composite_key(&self) -> CompositeKey {
        let sender = CompId::new(&self.session_id).expect("validated by builder");
        let target = CompId::new(&self.firm_id).expect("validated by builder");
        CompositeKey::new(sender, target)
    }
}

/// Builder for [`Ilink3ConnectionConfiguration`].
#[derive(Debug, Default)]
pub struct Ilink3ConnectionConfigurationBuilder {
    host: Option<String>,
    backup_host: Option<String>,
    port: Option<u16>,
    session_id: Option<String>,
    firm_id: Option<String>,
    access_key_id: Option<String>,
    user_key: Option<String>,
    keep_alive_interval_ms: Option<u64>,
    negotiate_timeout_ms: Option<u64>,
    reply_timeout_ms: Option<u64>,
    retransmit_batch_max: Option<u64>,
    re_establish_last_connection: bool,
    use_backup_host: bool,
}

impl Ilink3ConnectionConfigurationBuilder {
    /// Sets the primary host.
    #[must_use]
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Sets the backup host.
    #[must_use]
    pub fn backup_host(mut self, host: impl Into<String>) -> Self {
        self.backup_host = Some(host.into());
        self
    }

    /// Sets the port.
    #[must_use]
    pub const fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Sets the session id.
    #[must_use]
    pub fn session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Sets the firm id.
    #[must_use]
    pub fn firm_id(mut self, firm_id: impl Into<String>) -> Self {
        self.firm_id = Some(firm_id.into());
        self
    }

    /// Sets the access key id.
    #[must_use]
    pub fn access_key_id(mut self, access_key_id: impl Into<String>) -> Self {
        self.access_key_id = Some(access_key_id.into());
        self
    }

    /// Sets the private user key.
    #[must_use]
    pub fn user_key(mut self, user_key: impl Into<String>) -> Self {
        self.user_key = Some(user_key.into());
        self
    }

    /// Sets the requested keep-alive interval.
    #[must_use]
    pub const fn requested_keep_alive_interval_ms(mut self, interval_ms: u64) -> Self {
        self.keep_alive_interval_ms = Some(interval_ms);
        self
    }

    /// Sets the Negotiate reply window.
    #[must_use]
    pub const fn negotiate_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.negotiate_timeout_ms = Some(timeout_ms);
        self
    }

    /// Sets the Establish/Terminate reply window.
    #[must_use]
    pub const fn reply_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.reply_timeout_ms = Some(timeout_ms);
        self
    }

    /// Sets the retransmit batch cap.
    #[must_use]
    pub const fn retransmit_batch_max(mut self, batch_max: u64) -> Self {
        self.retransmit_batch_max = Some(batch_max);
        self
    }

    /// Re-establish the previous connection instead of negotiating.
    #[must_use]
    pub const fn re_establish_last_connection(mut self, re_establish: bool) -> Self {
        self.re_establish_last_connection = re_establish;
        self
    }

    /// Connect to the backup host.
    #[must_use]
    pub const fn use_backup_host(mut self, use_backup: bool) -> Self {
        self.use_backup_host = use_backup;
        self
    }

    /// Builds the configuration.
    ///
    /// # Errors
    /// Returns `Ilink3Error::KeepAliveIntervalTooLarge` when the requested
    /// keep-alive exceeds [`KEEP_ALIVE_INTERVAL_MAX_MS`], and
    /// `Ilink3Error::IllegalState` when a required field is missing.
    pub fn build(self) -> Result<Ilink3ConnectionConfiguration, Ilink3Error> {
        let keep_alive_interval_ms = self
            .keep_alive_interval_ms
            .unwrap_or(DEFAULT_KEEP_ALIVE_INTERVAL_MS);
        if keep_alive_interval_ms > KEEP_ALIVE_INTERVAL_MAX_MS {
            return Err(Ilink3Error::KeepAliveIntervalTooLarge {
                requested_ms: keep_alive_interval_ms,
                max_ms: KEEP_ALIVE_INTERVAL_MAX_MS,
            });
        }

        let require = |field: Option<String>, name: &str| {
            field.ok_or_else(|| Ilink3Error::IllegalState(format!("{name} is required")))
        };

        let session_id = require(self.session_id, "session_id")?;
        let firm_id = require(self.firm_id, "firm_id")?;
        for (value, name) in [(&session_id, "session_id"), (&firm_id, "firm_id")] {
            if CompId::new(value).is_none() || !value.is_ascii() {
                return Err(Ilink3Error::IllegalState(format!(
                    "{name} must be short ascii"
                )));
            }
        }

        Ok(Ilink3ConnectionConfiguration {
            host: require(self.host, "host")?,
            backup_host: self.backup_host,
            port: self.port.unwrap_or(0),
            session_id,
            firm_id,
            access_key_id: require(self.access_key_id, "access_key_id")?,
            user_key: self.user_key.unwrap_or_default(),
            keep_alive_interval_ms,
            negotiate_timeout_ms: self
                .negotiate_timeout_ms
                .unwrap_or(DEFAULT_NEGOTIATE_TIMEOUT_MS),
            reply_timeout_ms: self.reply_timeout_ms.unwrap_or(DEFAULT_REPLY_TIMEOUT_MS),
            retransmit_batch_max: self
                .retransmit_batch_max
                .unwrap_or(DEFAULT_RETRANSMIT_BATCH_MAX),
            re_establish_last_connection: self.re_establish_last_connection,
            use_backup_host: self.use_backup_host,
        })
    }
}
