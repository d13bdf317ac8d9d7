/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! The ILink3 initiator connection state machine.
//!
//! One [`Ilink3Connection`] per connection epoch, driven by the framer
//! thread: `poll(now_ms)` advances the handshake, keepalive, retransmit,
//! and terminate machinery; `on_frame` applies one inbound SBE frame.
//! Nothing suspends; work blocked on publication backpressure stays
//! represented as state and retries on the next poll.
//!
//! Negotiate and Establish are each retransmitted exactly once on timeout;
//! a second timeout fails the connection. Keepalive runs two independent
//! deadlines sized to the keep-alive interval: a quiet send deadline emits
//! `Sequence(NotLapsed)`, a lapsed receive deadline emits one warning
//! `Sequence(Lapsed)` and then a Terminate.

use crate::config::Ilink3ConnectionConfiguration;
use crate::handler::{Ilink3ConnectionHandler, NotAppliedResponse};
use crate::retransmit::{FillProgress, RetransmitBatch, Retransmitter};
use fixgate_codec::sbe::{
    self, Establish, Ilink3Message, KeepAliveLapsed, Negotiate, RetransmitRequest, Sequence,
    Terminate, fixed_str, fixed_str_value, frame_len,
};
use fixgate_core::{
    CompositeKey, DisconnectReason, GateError, Ilink3Error, Publication, SequenceState, SessionId,
    Uuid,
};
use fixgate_store::{MessageArchive, SequenceStore};
use smallvec::SmallVec;
use tracing::{debug, info, warn};

/// Runtime state of an ILink3 connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Ilink3SessionState {
    /// Negotiate sent, awaiting NegotiateResponse.
    SentNegotiate,
    /// Negotiation complete (or skipped on re-establish), Establish not yet
    /// sent.
    Negotiated,
    /// Establish sent, awaiting EstablishmentAck.
    SentEstablish,
    /// Session traffic flowing.
    Established,
    /// Established with one or more retransmit requests outstanding.
    AwaitingRetransmit,
    /// Terminate sent, awaiting the peer's echo.
    Unbinding,
    /// Terminal: the connection is gone and final state is persisted.
    Unbound,
}

impl Ilink3SessionState {
    /// Returns true for the terminal state.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Unbound)
    }

    /// Returns true while session traffic may flow.
    #[must_use]
    pub const fn is_established(self) -> bool {
        matches!(self, Self::Established | Self::AwaitingRetransmit)
    }

    /// Short name for logging.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::SentNegotiate => "SENT_NEGOTIATE",
            Self::Negotiated => "NEGOTIATED",
            Self::SentEstablish => "SENT_ESTABLISH",
            Self::Established => "ESTABLISHED",
            Self::AwaitingRetransmit => "AWAITING_RETRANSMIT",
            Self::Unbinding => "UNBINDING",
            Self::Unbound => "UNBOUND",
        }
    }
}

impl std::fmt::Display for Ilink3SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Collaborators a connection borrows for one `poll`/`on_frame` call.
pub struct Ilink3Context<'a> {
    /// Outbound byte sink.
    pub publication: &'a mut dyn Publication,
    /// Durable sequence store.
    pub store: &'a dyn SequenceStore,
    /// Outbound message archive for NotApplied replay.
    pub archive: &'a dyn MessageArchive,
    /// Library callbacks.
    pub handler: &'a mut dyn Ilink3ConnectionHandler,
}

/// An ILink3 initiator connection.
#[derive(Debug)]
pub struct Ilink3Connection {
    id: SessionId,
    config: Ilink3ConnectionConfiguration,
    key: CompositeKey,
    state: Ilink3SessionState,
    sequences: SequenceState,
    retransmitter: Retransmitter,

    handshake_sent: bool,
    handshake_retried: bool,
    handshake_started_at_ms: u64,
    handshake_deadline_ms: u64,

    keep_alive_ms: u64,
    next_send_deadline_ms: u64,
    next_receive_deadline_ms: u64,
    lapsed_warning_sent: bool,
    pending_lapsed_reply: bool,
    pending_sequence: bool,

    pending_terminate: Option<(String, u16, DisconnectReason)>,
    unbind_disposition: DisconnectReason,
    terminate_deadline_ms: Option<u64>,
    pending_terminate_reply: Option<DisconnectReason>,

    /// NotApplied replay in progress: (next, end exclusive).
    replaying: Option<(u64, u64)>,
    deferred_not_applied: SmallVec<[(u64, u64); 2]>,

    last_error: Option<Ilink3Error>,
}

impl Ilink3Connection {
    /// Creates a connection at TCP-connected time.
    ///
    /// With `re_establish_last_connection` set and a persisted uuid in
    /// `restored`, Negotiate is skipped and the previous epoch is
    /// re-established; otherwise a new uuid is assigned and negotiation
    /// starts on the first poll.
    #[must_use]
    pub fn new(
        id: SessionId,
        config: Ilink3ConnectionConfiguration,
        restored: Option<SequenceState>,
        now_ms: u64,
    ) -> Self {
        let key = config.composite_key();
        let mut sequences = restored.unwrap_or_default();

        let re_establish = config.re_establish_last_connection && !sequences.uuid.is_null();
        let state = if re_establish {
            Ilink3SessionState::Negotiated
        } else {
            sequences.begin_epoch(generate_uuid(now_ms, id.value()));
            Ilink3SessionState::SentNegotiate
        };

        let keep_alive_ms = config.keep_alive_interval_ms;
        let retransmitter = Retransmitter::new(config.retransmit_batch_max);
        Self {
            id,
            config,
            key,
            state,
            sequences,
            retransmitter,
            handshake_sent: false,
            handshake_retried: false,
            handshake_started_at_ms: now_ms,
            handshake_deadline_ms: 0,
            keep_alive_ms,
            next_send_deadline_ms: now_ms + keep_alive_ms,
            next_receive_deadline_ms: now_ms + keep_alive_ms,
            lapsed_warning_sent: false,
            pending_lapsed_reply: false,
            pending_sequence: false,
            pending_terminate: None,
            unbind_disposition: DisconnectReason::Graceful,
            terminate_deadline_ms: None,
            pending_terminate_reply: None,
            replaying: None,
            deferred_not_applied: SmallVec::new(),
            last_error: None,
        }
    }

    /// The registry-assigned session id.
    #[must_use]
    pub const fn id(&self) -> SessionId {
        self.id
    }

    /// The connection's durable-state key.
    #[must_use]
    pub const fn key(&self) -> &CompositeKey {
        &self.key
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> Ilink3SessionState {
        self.state
    }

    /// Current connection epoch.
    #[must_use]
    pub const fn uuid(&self) -> Uuid {
        self.sequences.uuid
    }

    /// Next inbound sequence number expected on the live stream.
    #[must_use]
    pub const fn next_recv_seq_no(&self) -> u64 {
        self.sequences.next_recv_seq_no
    }

    /// Next outbound sequence number to assign.
    #[must_use]
    pub const fn next_sent_seq_no(&self) -> u64 {
        self.sequences.next_sent_seq_no
    }

    /// Overrides the next outbound sequence number.
    ///
    /// Deliberately creates a gap the exchange will report via NotApplied;
    /// used by operational tooling.
    pub fn set_next_sent_seq_no(&mut self, seq_no: u64) {
        self.sequences.next_sent_seq_no = seq_no;
    }

    /// The sequence number completing the in-flight retransmit batch, or
    /// [`crate::retransmit::NOT_AWAITING_RETRANSMIT`].
    #[must_use]
    pub fn retransmit_fill_seq_no(&self) -> u64 {
        self.retransmitter.fill_seq_no()
    }

    /// True while a NotApplied replay locks out business sends.
    #[must_use]
    pub const fn is_replaying(&self) -> bool {
        self.replaying.is_some()
    }

    /// The most recent connection-fatal error, if any.
    #[must_use]
    pub const fn last_error(&self) -> Option<&Ilink3Error> {
        self.last_error.as_ref()
    }

    /// Time the next receive deadline expires; test and telemetry hook.
    #[must_use]
    pub const fn next_receive_deadline_ms(&self) -> u64 {
        self.next_receive_deadline_ms
    }

    /// Time the next send deadline expires; test and telemetry hook.
    #[must_use]
    pub const fn next_send_deadline_ms(&self) -> u64 {
        self.next_send_deadline_ms
    }

    /// Requests a graceful terminate; observed on the next poll. Idempotent
    /// and callable from control messages posted by other threads.
    pub fn terminate(&mut self, reason: impl Into<String>, error_codes: u16) {
        if self.pending_terminate.is_none()
            && !matches!(
                self.state,
                Ilink3SessionState::Unbinding | Ilink3SessionState::Unbound
            )
        {
            self.pending_terminate =
                Some((reason.into(), error_codes, DisconnectReason::Graceful));
        }
    }

    /// Reports that the transport dropped; the connection goes straight to
    /// UNBOUND on the next poll.
    pub fn on_transport_error(&mut self) {
        self.unbind_disposition = DisconnectReason::TransportFault;
        self.terminate_deadline_ms = Some(0);
        if !self.state.is_terminal() {
            self.state = Ilink3SessionState::Unbinding;
        }
    }

    /// Sends a business message.
    ///
    /// Returns `Ok(false)` on publication backpressure; the caller retries
    /// on a later poll.
    ///
    /// # Errors
    /// `Ilink3Error::IllegalState` while a NotApplied replay is draining or
    /// outside ESTABLISHED; store errors propagate.
    pub fn try_send_business(
        &mut self,
        now_ms: u64,
        ctx: &mut Ilink3Context<'_>,
        template_id: u16,
        payload: &[u8],
    ) -> Result<bool, GateError> {
        if self.replaying.is_some() {
            return Err(Ilink3Error::IllegalState(
                "retransmit in progress".to_string(),
            )
            .into());
        }
        if !self.state.is_established() {
            return Err(Ilink3Error::IllegalState(format!(
                "cannot send in state {}",
                self.state
            ))
            .into());
        }

        let seq = self.sequences.next_sent_seq_no;
        self.save_intended_sent(ctx, seq + 1)?;

        let uuid = self.sequences.uuid;
        let total = sbe::business_frame_len(payload.len());
        match ctx.publication.try_claim(total) {
            Some(slot) => {
                sbe::encode_business_into(slot, template_id, uuid, seq as u32, false, payload);
                ctx.publication.commit();
                self.next_send_deadline_ms = now_ms + self.keep_alive_ms;

                let frame = sbe::encode_business(template_id, uuid, seq as u32, false, payload);
                ctx.archive.store(seq, &frame)?;
                self.sequences.next_sent_seq_no = seq + 1;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Advances timers and flushes pending work.
    ///
    /// Returns the number of actions taken; zero means no progress was
    /// possible.
    ///
    /// # Errors
    /// Store failures propagate; the connection is left consistent and the
    /// call may be retried.
    pub fn poll(&mut self, now_ms: u64, ctx: &mut Ilink3Context<'_>) -> Result<u32, GateError> {
        if self.state.is_terminal() {
            return Ok(0);
        }

        let mut progress = 0;
        progress += self.poll_handshake(now_ms, ctx)?;

        if self.state.is_established() {
            // Must-reply to a peer Lapsed sequence, and NotApplied gap fill.
            if (self.pending_lapsed_reply || self.pending_sequence)
                && self.send_sequence(now_ms, ctx, KeepAliveLapsed::NotLapsed)
            {
                self.pending_lapsed_reply = false;
                self.pending_sequence = false;
                progress += 1;
            }

            // At most one retransmit request in flight.
            if let Some(batch) = self.retransmitter.request_due() {
                if self.send_retransmit_request(now_ms, ctx, batch) {
                    self.retransmitter.mark_sent();
                    progress += 1;
                }
            }

            progress += self.continue_replay(now_ms, ctx)?;
            progress += self.poll_keepalive(now_ms, ctx);
        }

        // Terminate owed.
        if let Some((reason, error_codes, disposition)) = self.pending_terminate.clone()
            && !matches!(
                self.state,
                Ilink3SessionState::Unbinding | Ilink3SessionState::Unbound
            )
            && self.send_terminate(now_ms, ctx, &reason, error_codes)
        {
            self.pending_terminate = None;
            self.unbind_disposition = disposition;
            self.terminate_deadline_ms = Some(now_ms + self.config.reply_timeout_ms);
            self.transition(Ilink3SessionState::Unbinding);
            progress += 1;
        }

        // Echo owed for a peer-initiated Terminate; disconnect follows.
        if let Some(disposition) = self.pending_terminate_reply
            && self.send_terminate(now_ms, ctx, "", 0)
        {
            self.pending_terminate_reply = None;
            self.disconnect(ctx, disposition)?;
            return Ok(progress + 1);
        }

        // Peer never echoed our Terminate.
        if self.state == Ilink3SessionState::Unbinding
            && let Some(deadline) = self.terminate_deadline_ms
            && now_ms >= deadline
        {
            let disposition = self.unbind_disposition;
            self.disconnect(ctx, disposition)?;
            return Ok(progress + 1);
        }

        Ok(progress)
    }

    /// Applies one inbound frame.
    ///
    /// # Errors
    /// Store failures propagate. Protocol violations do not error; they
    /// drive the state machine toward terminate/disconnect.
    pub fn on_frame(
        &mut self,
        frame: &[u8],
        now_ms: u64,
        ctx: &mut Ilink3Context<'_>,
    ) -> Result<u32, GateError> {
        if self.state.is_terminal() {
            return Ok(0);
        }

        let message = match sbe::decode_message(frame) {
            Ok(message) => message,
            Err(e) => {
                warn!(session_id = %self.id, error = %e, "malformed sbe frame");
                self.initiate_terminate(
                    format!("malformed frame: {e}"),
                    1,
                    DisconnectReason::ProtocolViolation,
                );
                let progress = self.poll(now_ms, ctx)?;
                return Ok(progress + 1);
            }
        };

        // Any inbound frame proves liveness, a Lapsed flag included.
        self.next_receive_deadline_ms = now_ms + self.keep_alive_ms;
        self.lapsed_warning_sent = false;

        match message {
            Ilink3Message::NegotiateResponse(_)
                if self.state == Ilink3SessionState::SentNegotiate =>
            {
                info!(session_id = %self.id, uuid = %self.sequences.uuid, "negotiated");
                self.transition(Ilink3SessionState::Negotiated);
                self.handshake_sent = false;
                self.handshake_retried = false;
            }
            Ilink3Message::NegotiateReject(reject) => {
                let reason = fixed_str_value(&reject.reason).to_string();
                self.fail_connect(
                    ctx,
                    Ilink3Error::NegotiateRejected { reason },
                )?;
            }
            Ilink3Message::EstablishmentAck(ack)
                if self.state == Ilink3SessionState::SentEstablish =>
            {
                self.on_establishment_ack(&ack, now_ms, ctx)?;
            }
            Ilink3Message::EstablishmentReject(reject) => {
                let reason = fixed_str_value(&reject.reason).to_string();
                self.fail_connect(
                    ctx,
                    Ilink3Error::EstablishmentRejected { reason },
                )?;
            }
            Ilink3Message::Sequence(sequence) => self.on_sequence(&sequence),
            Ilink3Message::Terminate(terminate) => self.on_terminate(&terminate, ctx)?,
            Ilink3Message::NotApplied(not_applied) => {
                self.on_not_applied(
                    u64::from(not_applied.from_seq_no),
                    u64::from(not_applied.msg_count),
                    ctx,
                );
            }
            Ilink3Message::Retransmission(accept) => {
                if !self
                    .retransmitter
                    .on_accepted(u64::from(accept.from_seq_no), u64::from(accept.msg_count))
                {
                    warn!(
                        session_id = %self.id,
                        from = accept.from_seq_no,
                        "retransmission ack does not match the in-flight request"
                    );
                }
            }
            Ilink3Message::RetransmitReject(reject) => {
                let reason = fixed_str_value(&reject.reason).to_string();
                if let Some(batch) = self.retransmitter.on_rejected() {
                    ctx.handler.on_retransmit_reject(
                        &reason,
                        batch.from_seq_no,
                        batch.msg_count,
                        reject.error_codes,
                    );
                }
                self.update_retransmit_state();
            }
            Ilink3Message::Business {
                template_id,
                uuid,
                seq_no,
                poss_retrans,
                payload,
            } => {
                self.on_business(
                    template_id,
                    uuid,
                    u64::from(seq_no),
                    poss_retrans,
                    payload,
                    ctx,
                );
            }
            other => {
                debug!(
                    session_id = %self.id,
                    state = %self.state,
                    message = ?message_name(&other),
                    "ignoring unexpected message"
                );
            }
        }

        let progress = self.poll(now_ms, ctx)?;
        Ok(progress + 1)
    }

    fn poll_handshake(
        &mut self,
        now_ms: u64,
        ctx: &mut Ilink3Context<'_>,
    ) -> Result<u32, GateError> {
        match self.state {
            Ilink3SessionState::SentNegotiate => {
                if !self.handshake_sent {
                    if self.send_negotiate(now_ms, ctx) {
                        self.handshake_sent = true;
                        self.handshake_deadline_ms = now_ms + self.config.negotiate_timeout_ms;
                        return Ok(1);
                    }
                } else if now_ms >= self.handshake_deadline_ms {
                    if self.handshake_retried {
                        self.fail_connect(
                            ctx,
                            Ilink3Error::NegotiateTimeout {
                                elapsed_ms: now_ms - self.handshake_started_at_ms,
                            },
                        )?;
                        return Ok(1);
                    }
                    // Retransmit Negotiate exactly once.
                    self.handshake_retried = true;
                    if self.send_negotiate(now_ms, ctx) {
                        self.handshake_deadline_ms = now_ms + self.config.negotiate_timeout_ms;
                    } else {
                        self.handshake_sent = false;
                    }
                    return Ok(1);
                }
            }
            Ilink3SessionState::Negotiated => {
                if self.send_establish(now_ms, ctx)? {
                    self.transition(Ilink3SessionState::SentEstablish);
                    self.handshake_sent = true;
                    self.handshake_retried = false;
                    self.handshake_started_at_ms = now_ms;
                    self.handshake_deadline_ms = now_ms + self.config.reply_timeout_ms;
                    return Ok(1);
                }
            }
            Ilink3SessionState::SentEstablish => {
                if now_ms >= self.handshake_deadline_ms {
                    if self.handshake_retried {
                        self.fail_connect(
                            ctx,
                            Ilink3Error::EstablishTimeout {
                                elapsed_ms: now_ms - self.handshake_started_at_ms,
                            },
                        )?;
                        return Ok(1);
                    }
                    self.handshake_retried = true;
                    if !self.send_establish(now_ms, ctx)? {
                        // Backpressure: retry on the next poll without
                        // burning the single permitted retransmit.
                        self.handshake_retried = false;
                    }
                    self.handshake_deadline_ms = now_ms + self.config.reply_timeout_ms;
                    return Ok(1);
                }
            }
            _ => {}
        }
        Ok(0)
    }

    fn poll_keepalive(&mut self, now_ms: u64, ctx: &mut Ilink3Context<'_>) -> u32 {
        let mut progress = 0;

        if now_ms >= self.next_send_deadline_ms
            && self.send_sequence(now_ms, ctx, KeepAliveLapsed::NotLapsed)
        {
            progress += 1;
        }

        if now_ms >= self.next_receive_deadline_ms {
            if self.lapsed_warning_sent {
                warn!(
                    session_id = %self.id,
                    "peer silent for two keep alive intervals, terminating"
                );
                self.initiate_terminate(
                    "keep alive interval lapsed".to_string(),
                    1,
                    DisconnectReason::Timeout,
                );
                progress += 1;
            } else if self.send_sequence(now_ms, ctx, KeepAliveLapsed::Lapsed) {
                self.lapsed_warning_sent = true;
                self.next_receive_deadline_ms = now_ms + self.keep_alive_ms;
                progress += 1;
            }
        }

        progress
    }

    fn on_establishment_ack(
        &mut self,
        ack: &sbe::EstablishmentAck,
        now_ms: u64,
        ctx: &mut Ilink3Context<'_>,
    ) -> Result<(), GateError> {
        let announced_next = u64::from(ack.next_seq_no);
        let expected = self.sequences.next_recv_seq_no;

        if announced_next < expected {
            // The exchange has forgotten messages we already consumed.
            let error = Ilink3Error::LowSequenceNumber {
                expected,
                received: announced_next,
            };
            warn!(session_id = %self.id, error = %error, "low sequence establishment ack");
            self.last_error = Some(error.clone());
            ctx.handler.on_error(&error);
            self.initiate_terminate(
                "establishment ack sequence too low".to_string(),
                1,
                DisconnectReason::ProtocolViolation,
            );
            return Ok(());
        }

        self.transition(Ilink3SessionState::Established);
        self.next_send_deadline_ms = now_ms + self.keep_alive_ms;
        self.next_receive_deadline_ms = now_ms + self.keep_alive_ms;

        // Gap on the live epoch.
        if announced_next > expected {
            debug!(
                session_id = %self.id,
                expected,
                announced = announced_next,
                "establish gap on live uuid"
            );
            self.retransmitter
                .on_gap(self.sequences.uuid, expected, announced_next - 1);
            self.sequences.next_recv_seq_no = announced_next;
        }

        // Gap against the previous epoch (cross-uuid retransmit).
        let previous_seq = u64::from(ack.previous_seq_no);
        if !ack.previous_uuid.is_null() && ack.previous_uuid != self.sequences.uuid {
            let recorded = if self.sequences.last_uuid == ack.previous_uuid {
                self.sequences.last_recv_seq_no
            } else {
                1
            };
            if previous_seq >= recorded {
                debug!(
                    session_id = %self.id,
                    previous_uuid = %ack.previous_uuid,
                    from = recorded,
                    to = previous_seq,
                    "establish gap on previous uuid"
                );
                self.retransmitter
                    .on_gap(ack.previous_uuid, recorded, previous_seq);
            }
        }

        self.update_retransmit_state();
        ctx.store.save(&self.key, &self.sequences)?;

        info!(
            session_id = %self.id,
            uuid = %self.sequences.uuid,
            next_sent = self.sequences.next_sent_seq_no,
            next_recv = self.sequences.next_recv_seq_no,
            "established"
        );
        ctx.handler.on_session_ready(self.id);
        Ok(())
    }

    fn on_sequence(&mut self, sequence: &Sequence) {
        if sequence.keep_alive_lapsed == KeepAliveLapsed::Lapsed {
            // Must-reply: answer with a NotLapsed sequence immediately.
            self.pending_lapsed_reply = true;
        }

        let announced_next = u64::from(sequence.next_seq_no);

        // At the batch boundary a Sequence gap-fills the retransmission.
        if self.retransmitter.on_sequence_gap_fill(announced_next) == FillProgress::Completed {
            debug!(session_id = %self.id, announced_next, "sequence gap fill ends retransmit");
            self.update_retransmit_state();
            return;
        }

        let expected = self.sequences.next_recv_seq_no;
        if announced_next > expected {
            self.retransmitter
                .on_gap(self.sequences.uuid, expected, announced_next - 1);
            self.sequences.next_recv_seq_no = announced_next;
            self.update_retransmit_state();
        } else if announced_next < expected {
            let error = Ilink3Error::LowSequenceNumber {
                expected,
                received: announced_next,
            };
            warn!(session_id = %self.id, error = %error, "low sequence message");
            self.last_error = Some(error);
            self.initiate_terminate(
                "sequence number too low".to_string(),
                1,
                DisconnectReason::ProtocolViolation,
            );
        }
    }

    fn on_terminate(
        &mut self,
        terminate: &Terminate,
        ctx: &mut Ilink3Context<'_>,
    ) -> Result<(), GateError> {
        if self.state == Ilink3SessionState::Unbinding {
            // Our Terminate came back; the handshake is complete.
            let disposition = self.unbind_disposition;
            self.disconnect(ctx, disposition)?;
            return Ok(());
        }

        info!(
            session_id = %self.id,
            reason = fixed_str_value(&terminate.reason),
            "peer initiated terminate"
        );
        let disposition = if terminate.uuid != self.sequences.uuid {
            let error = Ilink3Error::InvalidUuid {
                expected: self.sequences.uuid.value(),
                received: terminate.uuid.value(),
            };
            warn!(session_id = %self.id, error = %error, "terminate with wrong uuid");
            self.last_error = Some(error.clone());
            ctx.handler.on_error(&error);
            DisconnectReason::ProtocolViolation
        } else {
            DisconnectReason::Graceful
        };
        // Echo with the local uuid whatever the peer sent.
        self.pending_terminate_reply = Some(disposition);
        Ok(())
    }

    fn on_not_applied(&mut self, from: u64, count: u64, ctx: &mut Ilink3Context<'_>) {
        if self.replaying.is_some() {
            // A second NotApplied while a replay is draining waits its turn.
            self.deferred_not_applied.push((from, count));
            return;
        }

        match ctx.handler.on_not_applied(from, count) {
            NotAppliedResponse::GapFill => {
                debug!(session_id = %self.id, from, count, "gap filling not applied range");
                self.pending_sequence = true;
            }
            NotAppliedResponse::Retransmit => {
                info!(session_id = %self.id, from, count, "replaying not applied range");
                self.replaying = Some((from, from + count));
            }
        }
    }

    fn on_business(
        &mut self,
        template_id: u16,
        uuid: Uuid,
        seq_no: u64,
        poss_retrans: bool,
        payload: &[u8],
        ctx: &mut Ilink3Context<'_>,
    ) {
        if poss_retrans {
            ctx.handler
                .on_message(self.id, template_id, seq_no, true, payload);
            if self.retransmitter.on_replayed(uuid, seq_no) == FillProgress::Completed {
                self.update_retransmit_state();
            }
            return;
        }

        let expected = self.sequences.next_recv_seq_no;
        if seq_no >= expected {
            if seq_no > expected {
                debug!(
                    session_id = %self.id,
                    expected,
                    received = seq_no,
                    "gap on live stream"
                );
                self.retransmitter
                    .on_gap(self.sequences.uuid, expected, seq_no - 1);
                self.update_retransmit_state();
            }
            self.sequences.next_recv_seq_no = seq_no + 1;
            ctx.handler
                .on_message(self.id, template_id, seq_no, false, payload);
        } else {
            let error = Ilink3Error::LowSequenceNumber {
                expected,
                received: seq_no,
            };
            warn!(session_id = %self.id, error = %error, "low sequence business message");
            self.last_error = Some(error);
            self.initiate_terminate(
                "sequence number too low".to_string(),
                1,
                DisconnectReason::ProtocolViolation,
            );
        }
    }

    fn continue_replay(
        &mut self,
        now_ms: u64,
        ctx: &mut Ilink3Context<'_>,
    ) -> Result<u32, GateError> {
        let Some((next, end)) = self.replaying else {
            return Ok(0);
        };
        let mut progress = 0;
        let mut at = next;

        let frames = match ctx.archive.get_range(at, end - 1) {
            Ok(frames) => frames,
            Err(e) => {
                // Nothing retained: the range can only be gap filled.
                warn!(session_id = %self.id, error = %e, "replay range unavailable, gap filling");
                self.replaying = None;
                self.pending_sequence = true;
                self.take_deferred_not_applied(ctx);
                return Ok(1);
            }
        };

        for (seq, frame) in frames {
            if seq < at {
                continue;
            }
            match ctx.publication.try_claim(frame.len()) {
                Some(slot) => {
                    slot.copy_from_slice(&frame);
                    mark_poss_retrans(slot);
                    ctx.publication.commit();
                    self.next_send_deadline_ms = now_ms + self.keep_alive_ms;
                    at = seq + 1;
                    progress += 1;
                }
                None => {
                    self.replaying = Some((at, end));
                    return Ok(progress);
                }
            }
        }

        info!(session_id = %self.id, end, "not applied replay complete");
        self.replaying = None;
        self.take_deferred_not_applied(ctx);
        Ok(progress)
    }

    fn take_deferred_not_applied(&mut self, ctx: &mut Ilink3Context<'_>) {
        while self.replaying.is_none() && !self.deferred_not_applied.is_empty() {
            let (from, count) = self.deferred_not_applied.remove(0);
            self.on_not_applied(from, count, ctx);
        }
    }

    fn send_negotiate(&mut self, now_ms: u64, ctx: &mut Ilink3Context<'_>) -> bool {
        let message = Negotiate {
            uuid: self.sequences.uuid,
            request_timestamp: now_ms * 1_000_000,
            session_id: fixed_str(&self.config.session_id),
            firm_id: fixed_str(&self.config.firm_id),
            access_key_id: fixed_str(&self.config.access_key_id),
        };
        self.publish(now_ms, ctx, frame_len(Negotiate::BLOCK_LENGTH), |slot| {
            message.encode_into(slot);
        })
    }

    fn send_establish(
        &mut self,
        now_ms: u64,
        ctx: &mut Ilink3Context<'_>,
    ) -> Result<bool, GateError> {
        // Establish announces next_sent; persist the record first so a
        // crash cannot un-announce it.
        ctx.store.save(&self.key, &self.sequences)?;

        let message = Establish {
            uuid: self.sequences.uuid,
            request_timestamp: now_ms * 1_000_000,
            next_seq_no: self.sequences.next_sent_seq_no as u32,
            keep_alive_interval_ms: self.keep_alive_ms as u16,
            session_id: fixed_str(&self.config.session_id),
            firm_id: fixed_str(&self.config.firm_id),
            access_key_id: fixed_str(&self.config.access_key_id),
        };
        Ok(
            self.publish(now_ms, ctx, frame_len(Establish::BLOCK_LENGTH), |slot| {
                message.encode_into(slot);
            }),
        )
    }

    fn send_sequence(
        &mut self,
        now_ms: u64,
        ctx: &mut Ilink3Context<'_>,
        lapsed: KeepAliveLapsed,
    ) -> bool {
        let message = Sequence {
            uuid: self.sequences.uuid,
            next_seq_no: self.sequences.next_sent_seq_no as u32,
            keep_alive_lapsed: lapsed,
        };
        self.publish(now_ms, ctx, frame_len(Sequence::BLOCK_LENGTH), |slot| {
            message.encode_into(slot);
        })
    }

    fn send_retransmit_request(
        &mut self,
        now_ms: u64,
        ctx: &mut Ilink3Context<'_>,
        batch: RetransmitBatch,
    ) -> bool {
        let message = RetransmitRequest {
            uuid: self.sequences.uuid,
            last_uuid: batch.uuid,
            request_timestamp: now_ms * 1_000_000,
            from_seq_no: batch.from_seq_no as u32,
            msg_count: batch.msg_count as u16,
        };
        debug!(
            session_id = %self.id,
            from = batch.from_seq_no,
            count = batch.msg_count,
            of_uuid = %batch.uuid,
            "requesting retransmit"
        );
        self.publish(
            now_ms,
            ctx,
            frame_len(RetransmitRequest::BLOCK_LENGTH),
            |slot| {
                message.encode_into(slot);
            },
        )
    }

    fn send_terminate(
        &mut self,
        now_ms: u64,
        ctx: &mut Ilink3Context<'_>,
        reason: &str,
        error_codes: u16,
    ) -> bool {
        let message = Terminate {
            uuid: self.sequences.uuid,
            request_timestamp: now_ms * 1_000_000,
            error_codes,
            reason: fixed_str(reason),
        };
        self.publish(now_ms, ctx, frame_len(Terminate::BLOCK_LENGTH), |slot| {
            message.encode_into(slot);
        })
    }

    fn publish(
        &mut self,
        now_ms: u64,
        ctx: &mut Ilink3Context<'_>,
        length: usize,
        fill: impl FnOnce(&mut [u8]),
    ) -> bool {
        match ctx.publication.try_claim(length) {
            Some(slot) => {
                fill(slot);
                ctx.publication.commit();
                self.next_send_deadline_ms = now_ms + self.keep_alive_ms;
                true
            }
            None => false,
        }
    }

    fn save_intended_sent(
        &self,
        ctx: &mut Ilink3Context<'_>,
        next_sent: u64,
    ) -> Result<(), GateError> {
        let mut intended = self.sequences;
        intended.next_sent_seq_no = next_sent;
        ctx.store.save(&self.key, &intended)?;
        Ok(())
    }

    fn initiate_terminate(&mut self, reason: String, error_codes: u16, disposition: DisconnectReason) {
        if self.pending_terminate.is_none()
            && !matches!(
                self.state,
                Ilink3SessionState::Unbinding | Ilink3SessionState::Unbound
            )
        {
            self.pending_terminate = Some((reason, error_codes, disposition));
        }
    }

    fn fail_connect(
        &mut self,
        ctx: &mut Ilink3Context<'_>,
        error: Ilink3Error,
    ) -> Result<(), GateError> {
        warn!(session_id = %self.id, error = %error, "connect failed");
        self.last_error = Some(error.clone());
        ctx.handler.on_error(&error);
        let reason = match error {
            Ilink3Error::NegotiateTimeout { .. } | Ilink3Error::EstablishTimeout { .. } => {
                DisconnectReason::Timeout
            }
            _ => DisconnectReason::AuthenticationFailure,
        };
        self.disconnect(ctx, reason)
    }

    fn update_retransmit_state(&mut self) {
        if self.state.is_established() {
            self.state = if self.retransmitter.is_awaiting() {
                Ilink3SessionState::AwaitingRetransmit
            } else {
                Ilink3SessionState::Established
            };
        }
    }

    fn disconnect(
        &mut self,
        ctx: &mut Ilink3Context<'_>,
        reason: DisconnectReason,
    ) -> Result<(), GateError> {
        self.transition(Ilink3SessionState::Unbound);
        ctx.store.save(&self.key, &self.sequences)?;
        self.pending_terminate = None;
        self.pending_terminate_reply = None;
        self.pending_lapsed_reply = false;
        self.pending_sequence = false;
        self.replaying = None;
        self.deferred_not_applied.clear();
        info!(session_id = %self.id, %reason, "connection unbound");
        ctx.handler.on_disconnect(self.id, reason);
        Ok(())
    }

    fn transition(&mut self, to: Ilink3SessionState) {
        debug!(session_id = %self.id, from = %self.state, to = %to, "state transition");
        self.state = to;
    }
}

/// Sets the PossRetrans flag on an encoded business frame in place.
fn mark_poss_retrans(frame: &mut [u8]) {
    const POSS_RETRANS_OFFSET: usize = sbe::SOFH_LEN + sbe::SBE_HEADER_LEN + 12;
    if frame.len() > POSS_RETRANS_OFFSET {
        frame[POSS_RETRANS_OFFSET] = 1;
    }
}

fn message_name(message: &Ilink3Message<'_>) -> &'static str {
    match message {
        Ilink3Message::Negotiate(_) => "Negotiate",
        Ilink3Message::NegotiateResponse(_) => "NegotiateResponse",
        Ilink3Message::NegotiateReject(_) => "NegotiateReject",
        Ilink3Message::Establish(_) => "Establish",
        Ilink3Message::EstablishmentAck(_) => "EstablishmentAck",
        Ilink3Message::EstablishmentReject(_) => "EstablishmentReject",
        Ilink3Message::Sequence(_) => "Sequence",
        Ilink3Message::Terminate(_) => "Terminate",
        Ilink3Message::RetransmitRequest(_) => "RetransmitRequest",
        Ilink3Message::Retransmission(_) => "Retransmission",
        Ilink3Message::RetransmitReject(_) => "RetransmitReject",
        Ilink3Message::NotApplied(_) => "NotApplied",
        Ilink3Message::Business { .. } => "Business",
    }
}

fn generate_uuid(now_ms: u64, salt: u64) -> Uuid {
    let value = now_ms
        .wrapping_mul(1_000_003)
        .wrapping_add(salt)
        .max(1);
    Uuid::new(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retransmit::NOT_AWAITING_RETRANSMIT;
    use bytes::{BufMut, Bytes, BytesMut};
    use fixgate_codec::sbe::{
        EstablishmentAck, EstablishmentReject, NegotiateReject, NegotiateResponse, NotApplied,
        Retransmission, RetransmitReject, SbeHeader, TemplateId, decode_message,
    };
    use fixgate_store::{MemoryArchive, MemorySequenceStore};

    const KEEP_ALIVE_MS: u64 = 500;
    const ER_TEMPLATE: u16 = 532;

    #[derive(Default)]
    struct TestPublication {
        scratch: BytesMut,
        committed: Vec<Bytes>,
        full: bool,
    }

    impl Publication for TestPublication {
        fn try_claim(&mut self, length: usize) -> Option<&mut [u8]> {
            if self.full {
                return None;
            }
            self.scratch.clear();
            self.scratch.resize(length, 0);
            Some(&mut self.scratch)
        }

        fn commit(&mut self) {
            self.committed.push(Bytes::copy_from_slice(&self.scratch));
        }

        fn abort(&mut self) {
            self.scratch.clear();
        }
    }

    struct TestHandler {
        messages: Vec<(u16, u64, bool)>,
        not_applied: Vec<(u64, u64)>,
        not_applied_response: NotAppliedResponse,
        retransmit_rejects: Vec<(String, u64, u64, u16)>,
        errors: Vec<Ilink3Error>,
        ready: bool,
        disconnected: Option<DisconnectReason>,
    }

    impl Default for TestHandler {
        fn default() -> Self {
            Self {
                messages: Vec::new(),
                not_applied: Vec::new(),
                not_applied_response: NotAppliedResponse::GapFill,
                retransmit_rejects: Vec::new(),
                errors: Vec::new(),
                ready: false,
                disconnected: None,
            }
        }
    }

    impl Ilink3ConnectionHandler for TestHandler {
        fn on_message(
            &mut self,
            _session_id: SessionId,
            template_id: u16,
            seq_no: u64,
            poss_retrans: bool,
            _payload: &[u8],
        ) {
            self.messages.push((template_id, seq_no, poss_retrans));
        }

        fn on_not_applied(&mut self, from_seq_no: u64, msg_count: u64) -> NotAppliedResponse {
            self.not_applied.push((from_seq_no, msg_count));
            self.not_applied_response
        }

        fn on_retransmit_reject(
            &mut self,
            reason: &str,
            from_seq_no: u64,
            msg_count: u64,
            error_codes: u16,
        ) {
            self.retransmit_rejects
                .push((reason.to_string(), from_seq_no, msg_count, error_codes));
        }

        fn on_session_ready(&mut self, _session_id: SessionId) {
            self.ready = true;
        }

        fn on_disconnect(&mut self, _session_id: SessionId, reason: DisconnectReason) {
            self.disconnected = Some(reason);
        }

        fn on_error(&mut self, error: &Ilink3Error) {
            self.errors.push(error.clone());
        }
    }

    struct Harness {
        publication: TestPublication,
        store: MemorySequenceStore,
        archive: MemoryArchive,
        handler: TestHandler,
        connection: Ilink3Connection,
        now_ms: u64,
    }

    fn config(re_establish: bool) -> Ilink3ConnectionConfiguration {
        Ilink3ConnectionConfiguration::builder()
            .host("127.0.0.1")
            .port(9999)
            .session_id("ABC")
            .firm_id("DEFGH")
            .access_key_id("12345678901234567890")
            .user_key("somethingprivate")
            .requested_keep_alive_interval_ms(KEEP_ALIVE_MS)
            .negotiate_timeout_ms(1_000)
            .reply_timeout_ms(1_000)
            .re_establish_last_connection(re_establish)
            .build()
            .unwrap()
    }

    fn encode_frame(block: u16, encode: impl FnOnce(&mut [u8])) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_bytes(0, frame_len(block));
        encode(&mut buf);
        buf
    }

    impl Harness {
        fn new() -> Self {
            Self::with_config(config(false), None, 0)
        }

        fn with_config(
            config: Ilink3ConnectionConfiguration,
            restored: Option<SequenceState>,
            now_ms: u64,
        ) -> Self {
            Self {
                publication: TestPublication::default(),
                store: MemorySequenceStore::new(),
                archive: MemoryArchive::new(),
                handler: TestHandler::default(),
                connection: Ilink3Connection::new(SessionId::new(1), config, restored, now_ms),
                now_ms,
            }
        }

        fn poll(&mut self) -> u32 {
            let mut ctx = Ilink3Context {
                publication: &mut self.publication,
                store: &self.store,
                archive: &self.archive,
                handler: &mut self.handler,
            };
            self.connection.poll(self.now_ms, &mut ctx).unwrap()
        }

        fn deliver(&mut self, frame: &[u8]) {
            let mut ctx = Ilink3Context {
                publication: &mut self.publication,
                store: &self.store,
                archive: &self.archive,
                handler: &mut self.handler,
            };
            self.connection
                .on_frame(frame, self.now_ms, &mut ctx)
                .unwrap();
        }

        fn send_business(&mut self) -> Result<bool, GateError> {
            let mut ctx = Ilink3Context {
                publication: &mut self.publication,
                store: &self.store,
                archive: &self.archive,
                handler: &mut self.handler,
            };
            self.connection
                .try_send_business(self.now_ms, &mut ctx, ER_TEMPLATE, b"order")
        }

        fn sent(&self, index: usize) -> Ilink3Message<'_> {
            decode_message(&self.publication.committed[index]).unwrap()
        }

        fn sent_count(&self) -> usize {
            self.publication.committed.len()
        }

        fn last_sent(&self) -> Ilink3Message<'_> {
            self.sent(self.sent_count() - 1)
        }

        fn sent_template(&self, index: usize) -> u16 {
            SbeHeader::decode(&self.publication.committed[index][sbe::SOFH_LEN..])
                .unwrap()
                .template_id
        }

        fn uuid(&self) -> Uuid {
            self.connection.uuid()
        }

        /// Negotiate + establish, peer accepting everything.
        fn establish(&mut self) {
            self.poll();
            assert!(matches!(self.last_sent(), Ilink3Message::Negotiate(_)));

            let response = encode_frame(NegotiateResponse::BLOCK_LENGTH, |b| {
                NegotiateResponse {
                    uuid: self.uuid(),
                    request_timestamp: 0,
                    previous_seq_no: 0,
                    previous_uuid: Uuid::NULL,
                }
                .encode_into(b)
            });
            self.deliver(&response);
            assert!(matches!(self.last_sent(), Ilink3Message::Establish(_)));

            self.deliver_ack(0, Uuid::NULL, 1);
            assert_eq!(self.connection.state(), Ilink3SessionState::Established);
            assert!(self.handler.ready);
        }

        fn deliver_ack(&mut self, previous_seq_no: u32, previous_uuid: Uuid, next_seq_no: u32) {
            let uuid = self.uuid();
            let ack = encode_frame(EstablishmentAck::BLOCK_LENGTH, |b| {
                EstablishmentAck {
                    uuid,
                    request_timestamp: 0,
                    next_seq_no,
                    previous_seq_no,
                    previous_uuid,
                    keep_alive_interval_ms: KEEP_ALIVE_MS as u16,
                }
                .encode_into(b)
            });
            self.deliver(&ack);
        }

        fn deliver_sequence(&mut self, next_seq_no: u32, lapsed: KeepAliveLapsed) {
            let uuid = self.uuid();
            let frame = encode_frame(Sequence::BLOCK_LENGTH, |b| {
                Sequence {
                    uuid,
                    next_seq_no,
                    keep_alive_lapsed: lapsed,
                }
                .encode_into(b)
            });
            self.deliver(&frame);
        }

        fn deliver_business(&mut self, seq_no: u32, poss_retrans: bool) {
            self.deliver_business_on(self.uuid(), seq_no, poss_retrans);
        }

        fn deliver_business_on(&mut self, uuid: Uuid, seq_no: u32, poss_retrans: bool) {
            let frame = sbe::encode_business(ER_TEMPLATE, uuid, seq_no, poss_retrans, b"fill");
            self.deliver(&frame);
        }

        fn deliver_retrans_accept(&mut self, from_seq_no: u32, msg_count: u16) {
            self.deliver_retrans_accept_on(self.uuid(), from_seq_no, msg_count);
        }

        fn deliver_retrans_accept_on(&mut self, of_uuid: Uuid, from_seq_no: u32, msg_count: u16) {
            let uuid = self.uuid();
            let frame = encode_frame(Retransmission::BLOCK_LENGTH, |b| {
                Retransmission {
                    uuid,
                    last_uuid: of_uuid,
                    request_timestamp: 0,
                    from_seq_no,
                    msg_count,
                }
                .encode_into(b)
            });
            self.deliver(&frame);
        }

        fn deliver_retrans_reject(&mut self, from_seq_no: u32, msg_count: u16) {
            let uuid = self.uuid();
            let frame = encode_frame(RetransmitReject::BLOCK_LENGTH, |b| {
                RetransmitReject {
                    uuid,
                    last_uuid: uuid,
                    request_timestamp: 0,
                    from_seq_no,
                    msg_count,
                    error_codes: 9,
                    reason: fixed_str("out of range"),
                }
                .encode_into(b)
            });
            self.deliver(&frame);
        }

        fn deliver_terminate(&mut self, uuid: Uuid) {
            let frame = encode_frame(Terminate::BLOCK_LENGTH, |b| {
                Terminate {
                    uuid,
                    request_timestamp: 0,
                    error_codes: 0,
                    reason: fixed_str(""),
                }
                .encode_into(b)
            });
            self.deliver(&frame);
        }

        fn expect_retransmit_request(&self, from: u32, count: u16) {
            match self.last_sent() {
                Ilink3Message::RetransmitRequest(request) => {
                    assert_eq!(request.from_seq_no, from);
                    assert_eq!(request.msg_count, count);
                }
                other => panic!("expected retransmit request, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_happy_path_establishes() {
        let mut h = Harness::new();
        h.establish();

        assert!(!h.uuid().is_null());
        assert_eq!(h.connection.next_sent_seq_no(), 1);
        assert_eq!(h.connection.next_recv_seq_no(), 1);
    }

    #[test]
    fn test_negotiate_retransmitted_exactly_once_then_fails() {
        let mut h = Harness::new();
        h.poll();
        assert_eq!(h.sent_count(), 1);

        // First timeout: one retransmit.
        h.now_ms = 1_000;
        h.poll();
        assert_eq!(h.sent_count(), 2);
        assert!(matches!(h.sent(1), Ilink3Message::Negotiate(_)));

        // Second timeout: the connection fails.
        h.now_ms = 2_000;
        h.poll();
        assert_eq!(h.sent_count(), 2);
        assert_eq!(h.connection.state(), Ilink3SessionState::Unbound);
        assert!(matches!(
            h.handler.errors.as_slice(),
            [Ilink3Error::NegotiateTimeout { .. }]
        ));
        assert_eq!(h.handler.disconnected, Some(DisconnectReason::Timeout));
    }

    #[test]
    fn test_negotiate_reject_fails_connect() {
        let mut h = Harness::new();
        h.poll();

        let uuid = h.uuid();
        let reject = encode_frame(NegotiateReject::BLOCK_LENGTH, |b| {
            NegotiateReject {
                uuid,
                request_timestamp: 0,
                error_codes: 2,
                reason: fixed_str("bad credentials"),
            }
            .encode_into(b)
        });
        h.deliver(&reject);

        assert_eq!(h.connection.state(), Ilink3SessionState::Unbound);
        assert!(matches!(
            h.handler.errors.as_slice(),
            [Ilink3Error::NegotiateRejected { .. }]
        ));
        assert_eq!(
            h.handler.disconnected,
            Some(DisconnectReason::AuthenticationFailure)
        );
    }

    #[test]
    fn test_establishment_reject_fails_connect() {
        let mut h = Harness::new();
        h.poll();
        let uuid = h.uuid();
        let response = encode_frame(NegotiateResponse::BLOCK_LENGTH, |b| {
            NegotiateResponse {
                uuid,
                request_timestamp: 0,
                previous_seq_no: 0,
                previous_uuid: Uuid::NULL,
            }
            .encode_into(b)
        });
        h.deliver(&response);

        let reject = encode_frame(EstablishmentReject::BLOCK_LENGTH, |b| {
            EstablishmentReject {
                uuid,
                request_timestamp: 0,
                error_codes: 3,
                reason: fixed_str("no negotiation"),
            }
            .encode_into(b)
        });
        h.deliver(&reject);

        assert_eq!(h.connection.state(), Ilink3SessionState::Unbound);
        assert!(matches!(
            h.handler.errors.as_slice(),
            [Ilink3Error::EstablishmentRejected { .. }]
        ));
    }

    #[test]
    fn test_keepalive_sequence_then_terminate() {
        let mut h = Harness::new();
        h.establish();
        let sent_after_establish = h.sent_count();

        // Quiet for one interval on both sides: the NotLapsed heartbeat
        // goes out first, then the receive-side Lapsed warning.
        h.now_ms = KEEP_ALIVE_MS;
        h.poll();
        match h.sent(sent_after_establish) {
            Ilink3Message::Sequence(sequence) => {
                assert_eq!(sequence.next_seq_no, 1);
                assert_eq!(sequence.keep_alive_lapsed, KeepAliveLapsed::NotLapsed);
            }
            other => panic!("expected sequence, got {other:?}"),
        }
        match h.sent(sent_after_establish + 1) {
            Ilink3Message::Sequence(sequence) => {
                assert_eq!(sequence.keep_alive_lapsed, KeepAliveLapsed::Lapsed);
            }
            other => panic!("expected lapsed sequence, got {other:?}"),
        }
        assert_eq!(h.connection.state(), Ilink3SessionState::Established);

        // Still silent after a second interval: Terminate and unbind.
        h.now_ms = KEEP_ALIVE_MS * 2;
        h.poll();
        assert_eq!(h.connection.state(), Ilink3SessionState::Unbinding);
        assert!(matches!(h.last_sent(), Ilink3Message::Terminate(_)));
    }

    #[test]
    fn test_inbound_traffic_defers_lapse_warning() {
        let mut h = Harness::new();
        h.establish();

        // Peer traffic just before the deadline pushes it out.
        h.now_ms = KEEP_ALIVE_MS - 100;
        h.deliver_business(1, false);

        h.now_ms = KEEP_ALIVE_MS;
        h.poll();
        // Only the send-side NotLapsed heartbeat went out, no warning.
        match h.last_sent() {
            Ilink3Message::Sequence(sequence) => {
                assert_eq!(sequence.keep_alive_lapsed, KeepAliveLapsed::NotLapsed);
            }
            other => panic!("expected sequence, got {other:?}"),
        }
        assert_eq!(h.connection.state(), Ilink3SessionState::Established);
    }

    #[test]
    fn test_peer_lapsed_sequence_is_replied_immediately() {
        let mut h = Harness::new();
        h.establish();
        let sent_before = h.sent_count();

        h.deliver_sequence(1, KeepAliveLapsed::Lapsed);

        match h.sent(sent_before) {
            Ilink3Message::Sequence(sequence) => {
                assert_eq!(sequence.keep_alive_lapsed, KeepAliveLapsed::NotLapsed);
            }
            other => panic!("expected notlapsed reply, got {other:?}"),
        }
        // The inbound frame also reset the receive deadline.
        assert_eq!(
            h.connection.next_receive_deadline_ms(),
            h.now_ms + KEEP_ALIVE_MS
        );
    }

    #[test]
    fn test_retransmit_interleaves_live_and_replayed() {
        let mut h = Harness::new();
        h.establish();

        // Gap: peer's seq 3 arrives with next_recv 1.
        h.deliver_business(3, false);
        h.expect_retransmit_request(1, 2);
        assert_eq!(h.connection.state(), Ilink3SessionState::AwaitingRetransmit);
        assert_eq!(h.connection.next_recv_seq_no(), 4);

        h.deliver_retrans_accept(1, 2);
        assert_eq!(h.connection.retransmit_fill_seq_no(), 2);

        h.deliver_business(1, true);
        h.deliver_business(4, false);
        h.deliver_business(2, true);

        assert_eq!(h.connection.next_recv_seq_no(), 5);
        assert_eq!(h.connection.retransmit_fill_seq_no(), NOT_AWAITING_RETRANSMIT);
        assert_eq!(h.connection.state(), Ilink3SessionState::Established);

        // Delivery order preserves receipt order.
        let seqs: Vec<(u64, bool)> = h
            .handler
            .messages
            .iter()
            .map(|&(_, seq, retrans)| (seq, retrans))
            .collect();
        assert_eq!(seqs, vec![(3, false), (1, true), (4, false), (2, true)]);
    }

    #[test]
    fn test_large_gap_batches_sequentially() {
        let mut h = Harness::new();
        h.establish();

        h.deliver_business(5000, false);
        h.expect_retransmit_request(1, 2500);
        h.deliver_retrans_accept(1, 2500);

        for seq in 1..=2500u32 {
            h.deliver_business(seq, true);
        }
        h.expect_retransmit_request(2501, 2499);
        h.deliver_retrans_accept(2501, 2499);

        for seq in 2501..=4999u32 {
            h.deliver_business(seq, true);
        }

        assert_eq!(h.connection.next_recv_seq_no(), 5001);
        assert_eq!(h.connection.retransmit_fill_seq_no(), NOT_AWAITING_RETRANSMIT);
        assert_eq!(h.connection.state(), Ilink3SessionState::Established);
    }

    #[test]
    fn test_only_one_retransmit_request_in_flight() {
        let mut h = Harness::new();
        h.establish();

        h.deliver_business(2, false);
        h.expect_retransmit_request(1, 1);
        let requests_so_far = h.sent_count();

        // A second gap queues; no new request yet.
        h.deliver_business(4, false);
        assert_eq!(
            h.sent_count(),
            requests_so_far,
            "second request must wait for the first fill"
        );

        h.deliver_retrans_accept(1, 1);
        assert_eq!(h.connection.retransmit_fill_seq_no(), 1);
        h.deliver_business(1, true);

        h.expect_retransmit_request(3, 1);
        h.deliver_retrans_accept(3, 1);
        assert_eq!(h.connection.retransmit_fill_seq_no(), 3);
        h.deliver_business(3, true);

        assert_eq!(h.connection.retransmit_fill_seq_no(), NOT_AWAITING_RETRANSMIT);
        assert_eq!(h.connection.next_recv_seq_no(), 5);
    }

    #[test]
    fn test_retransmit_reject_does_not_stall() {
        let mut h = Harness::new();
        h.establish();

        h.deliver_business(5000, false);
        h.expect_retransmit_request(1, 2500);
        h.deliver_retrans_reject(1, 2500);

        h.expect_retransmit_request(2501, 2499);
        h.deliver_retrans_reject(2501, 2499);

        assert_eq!(h.connection.retransmit_fill_seq_no(), NOT_AWAITING_RETRANSMIT);
        assert_eq!(h.connection.next_recv_seq_no(), 5001);
        assert_eq!(h.connection.state(), Ilink3SessionState::Established);
        assert_eq!(h.handler.retransmit_rejects.len(), 2);
        assert_eq!(h.handler.retransmit_rejects[0].1, 1);
        assert_eq!(h.handler.retransmit_rejects[1].1, 2501);
    }

    #[test]
    fn test_sequence_acts_as_retransmit_gap_fill() {
        let mut h = Harness::new();
        h.establish();

        h.deliver_business(1, false);
        h.deliver_sequence(4, KeepAliveLapsed::NotLapsed);
        h.expect_retransmit_request(2, 2);
        h.deliver_retrans_accept(2, 2);

        // The peer gap-fills the whole batch with a Sequence at the
        // boundary instead of replaying.
        h.deliver_sequence(4, KeepAliveLapsed::NotLapsed);

        assert_eq!(h.connection.next_recv_seq_no(), 4);
        assert_eq!(h.connection.retransmit_fill_seq_no(), NOT_AWAITING_RETRANSMIT);

        h.deliver_business(4, false);
        assert_eq!(h.connection.next_recv_seq_no(), 5);
    }

    #[test]
    fn test_cross_uuid_retransmit_on_reconnect() {
        let mut h = Harness::new();
        h.establish();
        let old_uuid = h.uuid();
        assert!(h.send_business().unwrap());

        // Drop and reconnect with a fresh negotiation.
        h.connection.on_transport_error();
        h.poll();
        let restored = h.store.load(h.connection.key()).unwrap();

        let mut h2 = Harness::with_config(config(false), restored, 10);
        h2.store = h.store;
        h2.poll();
        assert_ne!(h2.uuid(), old_uuid);

        let uuid = h2.uuid();
        let response = encode_frame(NegotiateResponse::BLOCK_LENGTH, |b| {
            NegotiateResponse {
                uuid,
                request_timestamp: 0,
                previous_seq_no: 0,
                previous_uuid: Uuid::NULL,
            }
            .encode_into(b)
        });
        h2.deliver(&response);

        // Peer sent one message on the old uuid that we never received.
        h2.deliver_ack(1, old_uuid, 1);
        assert_eq!(h2.connection.state(), Ilink3SessionState::AwaitingRetransmit);
        match h2.last_sent() {
            Ilink3Message::RetransmitRequest(request) => {
                assert_eq!(request.last_uuid, old_uuid);
                assert_eq!(request.from_seq_no, 1);
                assert_eq!(request.msg_count, 1);
            }
            other => panic!("expected cross-uuid request, got {other:?}"),
        }

        h2.deliver_retrans_accept_on(old_uuid, 1, 1);
        h2.deliver_business_on(old_uuid, 1, true);
        h2.deliver_business(1, false);

        assert_eq!(h2.connection.retransmit_fill_seq_no(), NOT_AWAITING_RETRANSMIT);
        assert_eq!(h2.connection.state(), Ilink3SessionState::Established);
        let seqs: Vec<u64> = h2.handler.messages.iter().map(|&(_, s, _)| s).collect();
        assert_eq!(seqs, vec![1, 1]);
    }

    #[test]
    fn test_no_cross_uuid_request_without_gap() {
        let mut h = Harness::new();
        h.establish();
        let old_uuid = h.uuid();
        h.connection.on_transport_error();
        h.poll();
        let restored = h.store.load(h.connection.key()).unwrap();

        let mut h2 = Harness::with_config(config(false), restored, 10);
        h2.poll();
        let uuid = h2.uuid();
        let response = encode_frame(NegotiateResponse::BLOCK_LENGTH, |b| {
            NegotiateResponse {
                uuid,
                request_timestamp: 0,
                previous_seq_no: 0,
                previous_uuid: Uuid::NULL,
            }
            .encode_into(b)
        });
        h2.deliver(&response);

        // Peer sent nothing on the old uuid.
        h2.deliver_ack(0, old_uuid, 1);
        assert_eq!(h2.connection.state(), Ilink3SessionState::Established);
        assert_eq!(h2.connection.retransmit_fill_seq_no(), NOT_AWAITING_RETRANSMIT);
    }

    #[test]
    fn test_re_establish_skips_negotiate() {
        let mut h = Harness::new();
        h.establish();
        let old_uuid = h.uuid();
        assert!(h.send_business().unwrap());
        h.connection.on_transport_error();
        h.poll();
        let restored = h.store.load(h.connection.key()).unwrap();

        let mut h2 = Harness::with_config(config(true), restored, 0);
        h2.poll();

        match h2.last_sent() {
            Ilink3Message::Establish(establish) => {
                assert_eq!(establish.uuid, old_uuid);
                assert_eq!(establish.next_seq_no, 2);
            }
            other => panic!("expected establish, got {other:?}"),
        }

        h2.deliver_ack(0, Uuid::NULL, 1);
        assert_eq!(h2.connection.state(), Ilink3SessionState::Established);
        assert_eq!(h2.uuid(), old_uuid);
        assert_eq!(h2.connection.next_sent_seq_no(), 2);
    }

    #[test]
    fn test_low_sequence_message_terminates() {
        let mut h = Harness::new();
        h.establish();
        h.deliver_business(1, false);
        assert_eq!(h.connection.next_recv_seq_no(), 2);

        h.deliver_sequence(1, KeepAliveLapsed::NotLapsed);

        assert_eq!(h.connection.state(), Ilink3SessionState::Unbinding);
        assert!(matches!(h.last_sent(), Ilink3Message::Terminate(_)));

        // Peer echoes; we disconnect with next_recv preserved.
        let uuid = h.uuid();
        h.deliver_terminate(uuid);
        assert_eq!(h.connection.state(), Ilink3SessionState::Unbound);
        let persisted = h.store.load(h.connection.key()).unwrap().unwrap();
        assert_eq!(persisted.next_recv_seq_no, 2);
    }

    #[test]
    fn test_low_sequence_establishment_ack_terminates() {
        let mut h = Harness::new();
        h.establish();
        h.deliver_business(1, false);
        h.connection.on_transport_error();
        h.poll();
        let restored = h.store.load(h.connection.key()).unwrap();

        let mut h2 = Harness::with_config(config(true), restored, 0);
        h2.poll();
        // Same uuid, but the peer claims it will send 1 again.
        h2.deliver_ack(1, h2.uuid(), 1);

        assert_eq!(h2.connection.state(), Ilink3SessionState::Unbinding);
        assert!(matches!(h2.last_sent(), Ilink3Message::Terminate(_)));
    }

    #[test]
    fn test_initiator_terminate_handshake() {
        let mut h = Harness::new();
        h.establish();

        h.connection.terminate("shutdown", 0);
        h.poll();
        assert_eq!(h.connection.state(), Ilink3SessionState::Unbinding);
        match h.last_sent() {
            Ilink3Message::Terminate(terminate) => {
                assert_eq!(fixed_str_value(&terminate.reason), "shutdown");
            }
            other => panic!("expected terminate, got {other:?}"),
        }

        let uuid = h.uuid();
        h.deliver_terminate(uuid);
        assert_eq!(h.connection.state(), Ilink3SessionState::Unbound);
        assert_eq!(h.handler.disconnected, Some(DisconnectReason::Graceful));
    }

    #[test]
    fn test_terminate_timeout_force_disconnects() {
        let mut h = Harness::new();
        h.establish();

        h.connection.terminate("shutdown", 0);
        h.poll();
        assert_eq!(h.connection.state(), Ilink3SessionState::Unbinding);

        h.now_ms += 1_000;
        h.poll();
        assert_eq!(h.connection.state(), Ilink3SessionState::Unbound);
    }

    #[test]
    fn test_peer_terminate_is_echoed() {
        let mut h = Harness::new();
        h.establish();
        let sent_before = h.sent_count();

        let uuid = h.uuid();
        h.deliver_terminate(uuid);

        assert!(matches!(h.sent(sent_before), Ilink3Message::Terminate(_)));
        assert_eq!(h.connection.state(), Ilink3SessionState::Unbound);
        assert_eq!(h.handler.disconnected, Some(DisconnectReason::Graceful));
        assert!(h.handler.errors.is_empty());
    }

    #[test]
    fn test_wrong_uuid_terminate_still_echoed_and_surfaced() {
        let mut h = Harness::new();
        h.establish();
        let sent_before = h.sent_count();

        h.deliver_terminate(Uuid::NULL);

        // The echo carries our uuid, not the bogus one.
        match h.sent(sent_before) {
            Ilink3Message::Terminate(terminate) => assert_eq!(terminate.uuid, h.uuid()),
            other => panic!("expected terminate echo, got {other:?}"),
        }
        assert_eq!(h.connection.state(), Ilink3SessionState::Unbound);
        assert!(matches!(
            h.handler.errors.as_slice(),
            [Ilink3Error::InvalidUuid { received: 0, .. }]
        ));
    }

    #[test]
    fn test_not_applied_gap_fill_response() {
        let mut h = Harness::new();
        h.establish();
        h.connection.set_next_sent_seq_no(3);
        assert!(h.send_business().unwrap());
        let sent_before = h.sent_count();

        let uuid = h.uuid();
        let frame = encode_frame(NotApplied::BLOCK_LENGTH, |b| {
            NotApplied {
                uuid,
                from_seq_no: 1,
                msg_count: 3,
            }
            .encode_into(b)
        });
        h.deliver(&frame);

        assert_eq!(h.handler.not_applied, vec![(1, 3)]);
        match h.sent(sent_before) {
            Ilink3Message::Sequence(sequence) => {
                assert_eq!(sequence.next_seq_no, 4);
                assert_eq!(sequence.keep_alive_lapsed, KeepAliveLapsed::NotLapsed);
            }
            other => panic!("expected gap fill sequence, got {other:?}"),
        }
    }

    #[test]
    fn test_not_applied_retransmit_replays_and_locks_sends() {
        let mut h = Harness::new();
        h.establish();
        h.handler.not_applied_response = NotAppliedResponse::Retransmit;

        for _ in 0..3 {
            assert!(h.send_business().unwrap());
        }
        let sent_before = h.sent_count();

        // Peer missed 1 and 2. Build the NotApplied first so the handler's
        // response applies to it.
        let uuid = h.uuid();
        let frame = encode_frame(NotApplied::BLOCK_LENGTH, |b| {
            NotApplied {
                uuid,
                from_seq_no: 1,
                msg_count: 2,
            }
            .encode_into(b)
        });
        h.deliver(&frame);

        // Both messages replayed with PossRetrans set.
        assert_eq!(h.sent_count(), sent_before + 2);
        for (index, expected_seq) in [(sent_before, 1u32), (sent_before + 1, 2u32)] {
            match h.sent(index) {
                Ilink3Message::Business {
                    seq_no,
                    poss_retrans,
                    ..
                } => {
                    assert_eq!(seq_no, expected_seq);
                    assert!(poss_retrans);
                }
                other => panic!("expected replayed business, got {other:?}"),
            }
        }
        assert!(!h.connection.is_replaying());
    }

    #[test]
    fn test_sends_locked_out_during_replay() {
        let mut h = Harness::new();
        h.establish();
        h.handler.not_applied_response = NotAppliedResponse::Retransmit;

        for _ in 0..2 {
            assert!(h.send_business().unwrap());
        }

        // Stall the replay with a full publication so the lockout window
        // is observable.
        let uuid = h.uuid();
        let frame = encode_frame(NotApplied::BLOCK_LENGTH, |b| {
            NotApplied {
                uuid,
                from_seq_no: 1,
                msg_count: 2,
            }
            .encode_into(b)
        });
        h.publication.full = true;
        h.deliver(&frame);
        assert!(h.connection.is_replaying());

        let err = h.send_business().unwrap_err();
        assert!(matches!(
            err,
            GateError::Ilink3(Ilink3Error::IllegalState(_))
        ));

        // Backpressure clears; replay drains and sends unlock.
        h.publication.full = false;
        h.poll();
        assert!(!h.connection.is_replaying());
        assert!(h.send_business().unwrap());
    }

    #[test]
    fn test_second_not_applied_deferred_until_replay_drains() {
        let mut h = Harness::new();
        h.establish();
        h.handler.not_applied_response = NotAppliedResponse::Retransmit;

        for _ in 0..4 {
            assert!(h.send_business().unwrap());
        }

        let uuid = h.uuid();
        let first = encode_frame(NotApplied::BLOCK_LENGTH, |b| {
            NotApplied {
                uuid,
                from_seq_no: 1,
                msg_count: 2,
            }
            .encode_into(b)
        });
        let second = encode_frame(NotApplied::BLOCK_LENGTH, |b| {
            NotApplied {
                uuid,
                from_seq_no: 3,
                msg_count: 2,
            }
            .encode_into(b)
        });

        h.publication.full = true;
        h.deliver(&first);
        h.deliver(&second);
        // Only the first consulted the handler so far.
        assert_eq!(h.handler.not_applied, vec![(1, 2)]);

        h.publication.full = false;
        h.poll();
        h.poll();
        assert_eq!(h.handler.not_applied, vec![(1, 2), (3, 2)]);
        assert!(!h.connection.is_replaying());
    }

    #[test]
    fn test_business_send_carries_monotone_sequence() {
        let mut h = Harness::new();
        h.establish();
        let sent_before = h.sent_count();

        for _ in 0..3 {
            assert!(h.send_business().unwrap());
        }

        let seqs: Vec<u32> = (sent_before..h.sent_count())
            .map(|i| match h.sent(i) {
                Ilink3Message::Business { seq_no, .. } => seq_no,
                other => panic!("expected business, got {other:?}"),
            })
            .collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert_eq!(h.sent_template(sent_before), ER_TEMPLATE);

        // Persisted intent runs ahead of or equal to the wire.
        let persisted = h.store.load(h.connection.key()).unwrap().unwrap();
        assert_eq!(persisted.next_sent_seq_no, 4);
    }

    #[test]
    fn test_send_backpressure_reports_false() {
        let mut h = Harness::new();
        h.establish();

        h.publication.full = true;
        assert!(!h.send_business().unwrap());
        assert_eq!(h.connection.next_sent_seq_no(), 1);

        h.publication.full = false;
        assert!(h.send_business().unwrap());
        assert_eq!(h.connection.next_sent_seq_no(), 2);
    }
}
