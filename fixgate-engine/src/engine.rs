/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! The framer: the engine's single cooperative duty-cycle thread.
//!
//! Every session is pinned to one framer. Each `do_work` cycle drains the
//! cross-thread control queue, routes inbound transport events, and polls
//! every session; the returned work count drives [`IdleStrategy`] so a
//! quiet engine backs off from spinning to yielding to parking.
//!
//! Other threads never call into sessions directly: they post
//! [`ControlMessage`]s through a [`FramerHandle`], and transport tasks feed
//! [`TransportEvent`]s into the inbound queue.

use crate::publication::RingPublication;
use crate::registry::{GatewaySession, SessionRegistry};
use bytes::{Bytes, BytesMut};
use crossbeam_channel::{Receiver, Sender, unbounded};
use fixgate_core::{EngineError, EpochClock, GateError, SessionId};
use fixgate_ilink3::{
    Ilink3Connection, Ilink3ConnectionConfiguration, Ilink3ConnectionHandler, Ilink3Context,
};
use fixgate_session::{FixSession, FixSessionHandler, SessionConfig, SessionContext, SessionRole};
use fixgate_store::{MemoryArchive, SequenceStore};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default grace given to sessions during `close`.
pub const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 5_000;

/// Engine-level configuration.
#[derive(Debug, Clone, Default)]
pub struct EngineConfiguration {
    /// Directory for durable sequence files; `None` keeps state in memory
    /// and loses recovery across restarts.
    pub log_file_dir: Option<std::path::PathBuf>,
    /// Grace given to sessions during `close`.
    pub shutdown_timeout_ms: Option<u64>,
}

impl EngineConfiguration {
    /// Starts an empty configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the sequence file directory.
    #[must_use]
    pub fn log_file_dir(mut self, dir: impl Into<std::path::PathBuf>) -> Self {
        self.log_file_dir = Some(dir.into());
        self
    }

    /// Sets the shutdown grace.
    #[must_use]
    pub const fn shutdown_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.shutdown_timeout_ms = Some(timeout_ms);
        self
    }
}

/// Cross-thread request posted to the framer.
#[derive(Debug)]
pub enum ControlMessage {
    /// Terminate an ILink3 connection or log out a FIX session.
    Terminate {
        /// Target session.
        session_id: SessionId,
        /// Reason carried on the wire.
        reason: String,
        /// ILink3 error codes, ignored for FIX.
        error_codes: u16,
    },
    /// Begin engine shutdown.
    Shutdown,
}

/// Cheap cloneable handle for posting control messages from any thread.
#[derive(Debug, Clone)]
pub struct FramerHandle {
    tx: Sender<ControlMessage>,
}

impl FramerHandle {
    /// Requests a terminate/logout; idempotent, observed on the next poll.
    pub fn terminate(&self, session_id: SessionId, reason: impl Into<String>, error_codes: u16) {
        let _ = self.tx.send(ControlMessage::Terminate {
            session_id,
            reason: reason.into(),
            error_codes,
        });
    }

    /// Requests engine shutdown.
    pub fn shutdown(&self) {
        let _ = self.tx.send(ControlMessage::Shutdown);
    }
}

/// Event from a transport task.
#[derive(Debug)]
pub enum TransportEvent {
    /// A complete inbound frame for a bound connection.
    Frame {
        /// Transport connection id.
        connection_id: u64,
        /// The complete frame.
        frame: Bytes,
    },
    /// The TCP connection dropped.
    Disconnected {
        /// Transport connection id.
        connection_id: u64,
    },
}

/// Adaptive idle strategy for the framer thread.
///
/// Busy cycles reset it; consecutive idle cycles escalate from spinning to
/// yielding to a short park.
#[derive(Debug)]
pub struct IdleStrategy {
    max_spins: u32,
    max_yields: u32,
    idle_cycles: u32,
}

impl IdleStrategy {
    /// Creates the default strategy.
    #[must_use]
    pub fn new() -> Self {
        Self {
            max_spins: 100,
            max_yields: 100,
            idle_cycles: 0,
        }
    }

    /// Reacts to the work count of one duty cycle.
    pub fn idle(&mut self, work_count: u32) {
        if work_count > 0 {
            self.idle_cycles = 0;
            return;
        }
        self.idle_cycles = self.idle_cycles.saturating_add(1);
        if self.idle_cycles <= self.max_spins {
            std::hint::spin_loop();
        } else if self.idle_cycles <= self.max_spins + self.max_yields {
            std::thread::yield_now();
        } else {
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}

impl Default for IdleStrategy {
    fn default() -> Self {
        Self::new()
    }
}

/// The engine's session-owning duty-cycle driver.
pub struct Framer {
    clock: Box<dyn EpochClock>,
    registry: SessionRegistry,
    store: Box<dyn SequenceStore>,
    archives: HashMap<SessionId, MemoryArchive>,
    publications: HashMap<SessionId, RingPublication>,
    fix_handler: Box<dyn FixSessionHandler>,
    ilink3_handler: Box<dyn Ilink3ConnectionHandler>,
    control_tx: Sender<ControlMessage>,
    control_rx: Receiver<ControlMessage>,
    inbound_tx: Sender<TransportEvent>,
    inbound_rx: Receiver<TransportEvent>,
    shutdown_timeout_ms: u64,
}

impl Framer {
    /// Creates a framer over the given collaborators.
    #[must_use]
    pub fn new(
        clock: Box<dyn EpochClock>,
        store: Box<dyn SequenceStore>,
        fix_handler: Box<dyn FixSessionHandler>,
        ilink3_handler: Box<dyn Ilink3ConnectionHandler>,
    ) -> Self {
        let (control_tx, control_rx) = unbounded();
        let (inbound_tx, inbound_rx) = unbounded();
        Self {
            clock,
            registry: SessionRegistry::new(),
            store,
            archives: HashMap::new(),
            publications: HashMap::new(),
            fix_handler,
            ilink3_handler,
            control_tx,
            control_rx,
            inbound_tx,
            inbound_rx,
            shutdown_timeout_ms: DEFAULT_SHUTDOWN_TIMEOUT_MS,
        }
    }

    /// Creates a framer from an [`EngineConfiguration`], opening the
    /// file-backed sequence store when a log directory is configured.
    ///
    /// # Errors
    /// Store errors opening the sequence directory propagate.
    pub fn launch(
        configuration: &EngineConfiguration,
        clock: Box<dyn EpochClock>,
        fix_handler: Box<dyn FixSessionHandler>,
        ilink3_handler: Box<dyn Ilink3ConnectionHandler>,
    ) -> Result<Self, GateError> {
        let store: Box<dyn SequenceStore> = match &configuration.log_file_dir {
            Some(dir) => Box::new(fixgate_store::FileSequenceStore::open(dir)?),
            None => Box::new(fixgate_store::MemorySequenceStore::new()),
        };
        let mut framer = Self::new(clock, store, fix_handler, ilink3_handler);
        if let Some(timeout_ms) = configuration.shutdown_timeout_ms {
            framer.shutdown_timeout_ms = timeout_ms;
        }
        Ok(framer)
    }

    /// Sets the grace given to sessions during `close`.
    pub fn set_shutdown_timeout_ms(&mut self, timeout_ms: u64) {
        self.shutdown_timeout_ms = timeout_ms;
    }

    /// A handle for posting control messages from other threads.
    #[must_use]
    pub fn handle(&self) -> FramerHandle {
        FramerHandle {
            tx: self.control_tx.clone(),
        }
    }

    /// The sender transport tasks feed inbound events into.
    #[must_use]
    pub fn inbound_sender(&self) -> Sender<TransportEvent> {
        self.inbound_tx.clone()
    }

    /// Creates and binds a FIX session for a connected transport.
    ///
    /// # Errors
    /// `EngineError::DuplicateConnection` when the key is already bound on
    /// the host profile; store errors propagate.
    pub fn add_fix_session(
        &mut self,
        role: SessionRole,
        config: SessionConfig,
        connection_id: u64,
        host_profile: &str,
    ) -> Result<SessionId, GateError> {
        let key = config.composite_key();
        let (id, created) = self.registry.lookup_or_create(&key);
        self.registry.bind(connection_id, id, host_profile)?;

        let restored = self.store.load(&key)?;
        let now_ms = self.clock.time_ms();
        let session = FixSession::new(id, role, config, restored, now_ms);
        self.registry.insert(GatewaySession::Fix(session));
        self.publications.entry(id).or_default();
        self.archives.entry(id).or_default();

        info!(session_id = %id, key = %key, created, ?role, "fix session added");
        Ok(id)
    }

    /// Creates and binds an ILink3 connection for a connected transport.
    ///
    /// # Errors
    /// `EngineError::DuplicateConnection` when the session is already
    /// bound on the host profile, with no side effects on the live
    /// session; store errors propagate.
    pub fn add_ilink3_connection(
        &mut self,
        config: Ilink3ConnectionConfiguration,
        connection_id: u64,
    ) -> Result<SessionId, GateError> {
        let key = config.composite_key();
        let (id, created) = self.registry.lookup_or_create(&key);
        self.registry.bind(connection_id, id, config.host_profile())?;

        let restored = self.store.load(&key)?;
        let now_ms = self.clock.time_ms();
        let connection = Ilink3Connection::new(id, config, restored, now_ms);
        self.registry.insert(GatewaySession::Ilink3(connection));
        self.publications.entry(id).or_default();
        self.archives.entry(id).or_default();

        info!(session_id = %id, key = %key, created, "ilink3 connection added");
        Ok(id)
    }

    /// Sends a business message on an ILink3 connection.
    ///
    /// # Errors
    /// `EngineError::UnknownSession` for a missing session, otherwise the
    /// session's own send errors.
    pub fn send_ilink3_business(
        &mut self,
        session_id: SessionId,
        template_id: u16,
        payload: &[u8],
    ) -> Result<bool, GateError> {
        let now_ms = self.clock.time_ms();
        let Some(GatewaySession::Ilink3(connection)) = self.registry.get_mut(session_id) else {
            return Err(EngineError::UnknownSession {
                connection_id: session_id.value(),
            }
            .into());
        };
        let publication = self
            .publications
            .get_mut(&session_id)
            .ok_or(EngineError::UnknownSession {
                connection_id: session_id.value(),
            })?;
        let archive = self
            .archives
            .get(&session_id)
            .ok_or(EngineError::UnknownSession {
                connection_id: session_id.value(),
            })?;
        let mut ctx = Ilink3Context {
            publication,
            store: self.store.as_ref(),
            archive,
            handler: self.ilink3_handler.as_mut(),
        };
        connection.try_send_business(now_ms, &mut ctx, template_id, payload)
    }

    /// Sends an application message on a FIX session.
    ///
    /// # Errors
    /// `EngineError::UnknownSession` for a missing session, otherwise the
    /// session's own send errors.
    pub fn send_fix_application(
        &mut self,
        session_id: SessionId,
        encode: impl FnOnce(u64) -> BytesMut,
    ) -> Result<bool, GateError> {
        let now_ms = self.clock.time_ms();
        let Some(GatewaySession::Fix(session)) = self.registry.get_mut(session_id) else {
            return Err(EngineError::UnknownSession {
                connection_id: session_id.value(),
            }
            .into());
        };
        let publication = self
            .publications
            .get_mut(&session_id)
            .ok_or(EngineError::UnknownSession {
                connection_id: session_id.value(),
            })?;
        let archive = self
            .archives
            .get(&session_id)
            .ok_or(EngineError::UnknownSession {
                connection_id: session_id.value(),
            })?;
        let mut ctx = SessionContext {
            publication,
            store: self.store.as_ref(),
            archive,
            handler: self.fix_handler.as_mut(),
        };
        session.try_send(now_ms, &mut ctx, encode)
    }

    /// Pops the next committed outbound frame for a session's transport
    /// writer.
    pub fn drain_outbound(&mut self, session_id: SessionId) -> Option<Bytes> {
        self.publications.get_mut(&session_id)?.drain()
    }

    /// Borrows a session for inspection.
    #[must_use]
    pub fn session(&mut self, session_id: SessionId) -> Option<&mut GatewaySession> {
        self.registry.get_mut(session_id)
    }

    /// Number of live sessions.
    #[must_use]
    pub fn live_sessions(&self) -> usize {
        self.registry.live_sessions()
    }

    /// One duty cycle: drain control, route inbound, poll every session.
    ///
    /// Returns the amount of work done; callers feed it to an
    /// [`IdleStrategy`].
    ///
    /// # Errors
    /// Store failures propagate; the cycle may be retried.
    pub fn do_work(&mut self) -> Result<u32, GateError> {
        let mut work = 0;
        work += self.drain_control()?;
        work += self.drain_inbound()?;
        work += self.poll_sessions()?;

        for id in self.registry.reap_terminal() {
            debug!(session_id = %id, "reaped terminal session");
            self.publications.remove(&id);
            work += 1;
        }
        Ok(work)
    }

    /// Gracefully drains all sessions and stops.
    ///
    /// Each session gets up to the shutdown timeout to complete its
    /// Logout/Terminate handshake, then is force-disconnected with its
    /// final state persisted.
    ///
    /// # Errors
    /// Store failures propagate.
    pub fn close(&mut self) -> Result<(), GateError> {
        info!(live = self.registry.live_sessions(), "engine closing");
        for id in self.registry.session_ids() {
            self.request_close(id, "engine shutdown");
        }

        let deadline = self.clock.time_ms() + self.shutdown_timeout_ms;
        while self.registry.live_sessions() > 0 && self.clock.time_ms() < deadline {
            if self.do_work()? == 0 {
                std::thread::yield_now();
            }
        }

        // Grace expired: force the stragglers down.
        for id in self.registry.session_ids() {
            if let Some(session) = self.registry.get_mut(id) {
                match session {
                    GatewaySession::Fix(session) => session.on_transport_error(),
                    GatewaySession::Ilink3(connection) => connection.on_transport_error(),
                }
            }
        }
        self.do_work()?;
        info!("engine closed");
        Ok(())
    }

    fn request_close(&mut self, session_id: SessionId, reason: &str) {
        if let Some(session) = self.registry.get_mut(session_id) {
            match session {
                GatewaySession::Fix(session) => session.request_logout(reason),
                GatewaySession::Ilink3(connection) => connection.terminate(reason, 0),
            }
        }
    }

    fn drain_control(&mut self) -> Result<u32, GateError> {
        let mut work = 0;
        while let Ok(message) = self.control_rx.try_recv() {
            work += 1;
            match message {
                ControlMessage::Terminate {
                    session_id,
                    reason,
                    error_codes,
                } => match self.registry.get_mut(session_id) {
                    Some(GatewaySession::Fix(session)) => session.request_logout(reason),
                    Some(GatewaySession::Ilink3(connection)) => {
                        connection.terminate(reason, error_codes);
                    }
                    None => {
                        debug!(session_id = %session_id, "terminate for unknown session");
                    }
                },
                ControlMessage::Shutdown => {
                    for id in self.registry.session_ids() {
                        self.request_close(id, "engine shutdown");
                    }
                }
            }
        }
        Ok(work)
    }

    fn drain_inbound(&mut self) -> Result<u32, GateError> {
        let now_ms = self.clock.time_ms();
        let mut work = 0;
        while let Ok(event) = self.inbound_rx.try_recv() {
            match event {
                TransportEvent::Frame {
                    connection_id,
                    frame,
                } => match self.route_frame(connection_id, &frame, now_ms) {
                    Ok(progress) => work += progress,
                    Err(GateError::Engine(EngineError::UnknownSession { .. })) => {
                        warn!(connection_id, "frame for unknown session dropped");
                    }
                    Err(e) => return Err(e),
                },
                TransportEvent::Disconnected { connection_id } => {
                    if let Some(session_id) = self.registry.unbind(connection_id)
                        && let Some(session) = self.registry.get_mut(session_id)
                    {
                        info!(connection_id, session_id = %session_id, "transport dropped");
                        match session {
                            GatewaySession::Fix(session) => session.on_transport_error(),
                            GatewaySession::Ilink3(connection) => {
                                connection.on_transport_error();
                            }
                        }
                        work += 1;
                    }
                }
            }
        }
        Ok(work)
    }

    fn route_frame(
        &mut self,
        connection_id: u64,
        frame: &[u8],
        now_ms: u64,
    ) -> Result<u32, GateError> {
        let session = self.registry.route(connection_id)?;
        let id = session.id();
        let publication = self
            .publications
            .get_mut(&id)
            .ok_or(EngineError::UnknownSession { connection_id })?;
        let archive = self
            .archives
            .get(&id)
            .ok_or(EngineError::UnknownSession { connection_id })?;

        match session {
            GatewaySession::Fix(session) => {
                let mut ctx = SessionContext {
                    publication,
                    store: self.store.as_ref(),
                    archive,
                    handler: self.fix_handler.as_mut(),
                };
                session.on_frame(frame, now_ms, &mut ctx)
            }
            GatewaySession::Ilink3(connection) => {
                let mut ctx = Ilink3Context {
                    publication,
                    store: self.store.as_ref(),
                    archive,
                    handler: self.ilink3_handler.as_mut(),
                };
                connection.on_frame(frame, now_ms, &mut ctx)
            }
        }
    }

    fn poll_sessions(&mut self) -> Result<u32, GateError> {
        let now_ms = self.clock.time_ms();
        let mut work = 0;
        for session in self.registry.sessions_mut() {
            let id = session.id();
            let Some(publication) = self.publications.get_mut(&id) else {
                continue;
            };
            let Some(archive) = self.archives.get(&id) else {
                continue;
            };
            match session {
                GatewaySession::Fix(session) => {
                    let mut ctx = SessionContext {
                        publication,
                        store: self.store.as_ref(),
                        archive,
                        handler: self.fix_handler.as_mut(),
                    };
                    work += session.poll(now_ms, &mut ctx)?;
                }
                GatewaySession::Ilink3(connection) => {
                    let mut ctx = Ilink3Context {
                        publication,
                        store: self.store.as_ref(),
                        archive,
                        handler: self.ilink3_handler.as_mut(),
                    };
                    work += connection.poll(now_ms, &mut ctx)?;
                }
            }
        }
        Ok(work)
    }
}

impl std::fmt::Debug for Framer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Framer")
            .field("live_sessions", &self.registry.live_sessions())
            .field("shutdown_timeout_ms", &self.shutdown_timeout_ms)
            .finish_non_exhaustive()
    }
}
