//! Top-level session state machine.
//!
//! One `InvalidationClient` owns every other component and is driven from a
//! single thread: the host feeds it inbound bytes, application calls, and
//! timer ticks (`advance` at `next_deadline_ms`), and the exclusive borrow
//! on every method is the serialization guarantee. Nothing here blocks,
//! spawns, or reads a clock other than [`SystemResources::now_ms`].

use std::collections::BTreeMap;

use rand::SeedableRng;
use rand::rngs::StdRng;

use crate::config::ClientConfig;
use crate::core::{ApplicationClientId, ClientToken, Nonce, ObjectId, RegOpKind};

use super::backoff::ExponentialBackoff;
use super::error::{EngineError, InboundError};
use super::listener::{AckHandle, InvalidationListener};
use super::persistence::{PersistentState, Sha256Mac, decode_state, encode_state};
use super::proto::{
    ClientMessage, InfoMessage, InitializeMessage, InvalidationSection, ProtoLimits, ServerError,
    ServerErrorCode, ServerHeader, ServerMessage, TokenControl, TokenStatus, WireInvalidation,
};
use super::protocol::ProtocolHandler;
use super::registration::{RegistrationEvent, RegistrationManager};
use super::resources::SystemResources;
use super::scheduler::{OpId, OperationScheduler};
use super::smear::Smearer;
use super::statistics::Statistics;
use super::throttle::ThrottleDecision;

/// Outbound message ids are persisted at least this often; a restart seeds
/// the counter one stride past the persisted value, so ids stay strictly
/// increasing even when the final pre-crash writes were lost.
const MESSAGE_ID_PERSIST_STRIDE: u64 = 64;

#[derive(Clone, Debug)]
enum Session {
    Unassigned,
    AwaitingToken {
        nonce: Nonce,
    },
    Running {
        token: ClientToken,
    },
    /// The server flagged the token as stale. A fresh Initialize is in
    /// flight; local registration intent is kept.
    RunningStale {
        token: ClientToken,
        nonce: Nonce,
    },
}

impl Session {
    fn token(&self) -> Option<&ClientToken> {
        match self {
            Session::Running { token } | Session::RunningStale { token, .. } => Some(token),
            Session::Unassigned | Session::AwaitingToken { .. } => None,
        }
    }

    fn pending_nonce(&self) -> Option<Nonce> {
        match self {
            Session::AwaitingToken { nonce } | Session::RunningStale { nonce, .. } => Some(*nonce),
            Session::Unassigned | Session::Running { .. } => None,
        }
    }

    fn is_running(&self) -> bool {
        matches!(self, Session::Running { .. } | Session::RunningStale { .. })
    }
}

#[derive(Clone, Debug)]
enum AckEvent {
    Invalidation(WireInvalidation),
    /// Invalidate-all has nothing to echo to the server; acking it only
    /// retires the handle.
    All,
}

/// The client protocol engine.
pub struct InvalidationClient<L, R> {
    config: ClientConfig,
    application_id: ApplicationClientId,
    listener: L,
    resources: R,
    session: Session,
    /// Set once a token has ever been assigned or restored; gates the
    /// one-time `ready` upcall.
    had_token: bool,
    started: bool,
    stopped: bool,
    online: bool,
    registrations: RegistrationManager,
    protocol: ProtocolHandler,
    scheduler: OperationScheduler,
    backoff: ExponentialBackoff,
    stats: Statistics,
    mac: Sha256Mac,
    rng: StdRng,
    outstanding_acks: BTreeMap<u64, AckEvent>,
    next_ack_id: u64,
    heartbeat_due: bool,
    poll_due: bool,
    info_due: bool,
    init_due: bool,
    last_persisted_message_id: u64,
}

impl<L: InvalidationListener, R: SystemResources> InvalidationClient<L, R> {
    pub fn new(
        config: ClientConfig,
        application_id: ApplicationClientId,
        listener: L,
        resources: R,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let seed = config.rng_seed;
        let smearer = Smearer::new(config.smear_fraction, StdRng::seed_from_u64(seed));
        let backoff = ExponentialBackoff::new(
            config.initial_backoff_ms,
            config.max_backoff_factor,
            StdRng::seed_from_u64(seed.wrapping_add(1)),
        );
        let rng = StdRng::seed_from_u64(seed.wrapping_add(2));
        let limits = ProtoLimits {
            max_message_bytes: config.max_message_bytes,
            ..ProtoLimits::default()
        };
        let protocol =
            ProtocolHandler::new(application_id.client_type, &config.throttle_rules, limits);
        let mut scheduler = OperationScheduler::new(smearer);
        scheduler.register(OpId::Batcher, config.batching_delay_ms);
        scheduler.register(OpId::Heartbeat, config.heartbeat_interval_ms);
        scheduler.register(OpId::Poll, config.poll_interval_ms);
        Ok(Self {
            config,
            application_id,
            listener,
            resources,
            session: Session::Unassigned,
            had_token: false,
            started: false,
            stopped: false,
            online: true,
            registrations: RegistrationManager::new(),
            protocol,
            scheduler,
            backoff,
            stats: Statistics::default(),
            mac: Sha256Mac,
            rng,
            outstanding_acks: BTreeMap::new(),
            next_ack_id: 0,
            heartbeat_due: false,
            poll_due: false,
            info_due: false,
            init_due: false,
            last_persisted_message_id: 0,
        })
    }

    /// Restores persisted identity (or begins token acquisition) and arms
    /// the periodic schedule.
    pub fn start(&mut self) {
        if self.started || self.stopped {
            tracing::warn!("ignoring start on an already started or stopped engine");
            return;
        }
        self.started = true;
        let now = self.resources.now_ms();
        let restored = self
            .resources
            .read_state()
            .and_then(|blob| decode_state(&blob, &self.mac));
        match restored {
            Some(state) => {
                self.protocol
                    .seed_message_id(state.last_message_id + MESSAGE_ID_PERSIST_STRIDE);
                self.session = Session::Running {
                    token: state.client_token,
                };
                self.had_token = true;
                // Push the persisted floor forward immediately so a crash
                // before the next stride cannot reuse ids from this run.
                self.persist_state();
                self.listener.ready();
                if self.has_outbound_work() {
                    self.scheduler.schedule(OpId::Batcher, now);
                }
            }
            None => self.acquire_token(now),
        }
        self.scheduler
            .schedule_in(OpId::Heartbeat, now, self.config.initial_heartbeat_delay_ms);
        self.scheduler.schedule(OpId::Poll, now);
    }

    /// Cancels all timers. In-flight upcalls have already completed (the
    /// engine is single-threaded); nothing is flushed.
    pub fn stop(&mut self) {
        if !self.started || self.stopped {
            return;
        }
        self.stopped = true;
        self.scheduler.cancel_all();
    }

    pub fn register(&mut self, object: ObjectId) {
        self.enqueue(object, RegOpKind::Register);
    }

    pub fn unregister(&mut self, object: ObjectId) {
        self.enqueue(object, RegOpKind::Unregister);
    }

    /// Acks one delivered invalidation. Unknown handles (from a session
    /// that has since been reset) are dropped with a warning.
    pub fn acknowledge(&mut self, handle: AckHandle) {
        if self.stopped {
            return;
        }
        match self.outstanding_acks.remove(&handle.id) {
            Some(AckEvent::Invalidation(ack)) => {
                self.protocol.queue_ack(ack);
                let now = self.resources.now_ms();
                self.scheduler.schedule(OpId::Batcher, now);
            }
            Some(AckEvent::All) => {}
            None => {
                tracing::warn!(handle = handle.id, "ignoring unknown or stale ack handle");
            }
        }
    }

    /// Feeds one raw inbound message from the transport.
    pub fn receive(&mut self, bytes: &[u8]) {
        if !self.started || self.stopped {
            return;
        }
        self.stats.received_messages += 1;
        let current = self.session.token().cloned();
        match self.protocol.handle_inbound(bytes, current.as_ref()) {
            Ok(msg) => self.dispatch(msg),
            Err(InboundError::TokenMismatch) => {
                self.stats.incoming_dropped += 1;
                self.stats.token_mismatches += 1;
                tracing::info!("dropping message addressed to another client incarnation");
            }
            Err(err) => {
                self.stats.incoming_dropped += 1;
                tracing::warn!("dropping inbound message: {err}");
            }
        }
    }

    /// Transport connectivity changed. Going online re-arms the batcher if
    /// work accumulated while unreachable.
    pub fn network_status(&mut self, online: bool) {
        let was_online = self.online;
        self.online = online;
        if online && !was_online && self.started && !self.stopped {
            let now = self.resources.now_ms();
            if self.init_due || self.has_outbound_work() {
                self.scheduler.schedule(OpId::Batcher, now);
            }
        }
    }

    /// When the host should next call [`advance`](Self::advance).
    pub fn next_deadline_ms(&self) -> Option<u64> {
        if self.stopped {
            return None;
        }
        self.scheduler.next_deadline()
    }

    /// Runs every scheduled operation that is due at the resource clock's
    /// current time.
    pub fn advance(&mut self) {
        if !self.started || self.stopped {
            return;
        }
        let now = self.resources.now_ms();
        for op in self.scheduler.pop_due(now) {
            match op {
                OpId::Batcher => self.run_batcher(now),
                OpId::Heartbeat => {
                    self.heartbeat_due = true;
                    self.scheduler.schedule(OpId::Batcher, now);
                    self.scheduler.schedule(OpId::Heartbeat, now);
                }
                OpId::Poll => {
                    self.poll_due = true;
                    self.scheduler.schedule(OpId::Batcher, now);
                    self.scheduler.schedule(OpId::Poll, now);
                }
                OpId::InitRetry => self.on_init_retry(now),
            }
            if self.stopped {
                break;
            }
        }
    }

    pub fn statistics(&self) -> &Statistics {
        &self.stats
    }

    fn enqueue(&mut self, object: ObjectId, kind: RegOpKind) {
        if self.stopped {
            tracing::warn!("ignoring {} on a stopped engine", kind.as_str());
            return;
        }
        self.registrations.enqueue(object, kind);
        if matches!(self.session, Session::Running { .. }) {
            let now = self.resources.now_ms();
            self.scheduler.schedule(OpId::Batcher, now);
        }
    }

    fn has_outbound_work(&self) -> bool {
        self.registrations.has_pending_ops()
            || self.registrations.has_pending_subtrees()
            || self.protocol.has_pending_acks()
            || self.info_due
            || self.heartbeat_due
            || self.poll_due
            || self.registrations.summary_diverged()
    }

    /// The batching task: one fire sends at most one message carrying
    /// every pending category, subject to the throttle and size caps.
    fn run_batcher(&mut self, now: u64) {
        if !self.online {
            return;
        }
        let init_nonce = if self.init_due {
            self.session.pending_nonce()
        } else {
            None
        };
        let running = matches!(self.session, Session::Running { .. });
        if init_nonce.is_none() && !(running && self.has_outbound_work()) {
            return;
        }
        match self.protocol.check_throttle(now) {
            ThrottleDecision::Allowed => {}
            ThrottleDecision::DeferUntil(at) => {
                self.stats.throttled_sends += 1;
                self.scheduler.schedule_at(OpId::Batcher, at);
                return;
            }
        }

        let summary = self.registrations.local_summary();
        let msg = if let Some(nonce) = init_nonce {
            let header = self.protocol.next_header(None, summary, now);
            let mut msg = ClientMessage::header_only(header);
            msg.initialize = Some(InitializeMessage {
                nonce,
                application_client_id: self.application_id.clone(),
            });
            msg
        } else {
            let token = self.session.token().cloned();
            let header = self.protocol.next_header(token.as_ref(), summary, now);
            let mut msg = ClientMessage::header_only(header);
            msg.registrations = self
                .registrations
                .drain_pending(self.config.max_ops_per_message);
            msg.sync_subtrees = self.registrations.drain_subtrees();
            msg.invalidation_acks = self.protocol.drain_acks(self.config.max_ops_per_message);
            if self.info_due {
                msg.info = Some(self.build_info_message());
            }
            msg
        };

        if let Err(err) =
            self.protocol
                .send(&msg, &mut self.resources, self.config.max_message_bytes)
        {
            self.fatal(err);
            return;
        }

        self.stats.sent_messages += 1;
        self.stats.sent_registrations += msg.registrations.len() as u64;
        self.stats.sent_acks += msg.invalidation_acks.len() as u64;
        if msg.initialize.is_some() {
            self.stats.sent_initialize += 1;
            self.init_due = false;
            return;
        }
        if msg.is_header_only() && (self.heartbeat_due || self.poll_due) {
            self.stats.sent_heartbeats += 1;
        }
        self.heartbeat_due = false;
        self.poll_due = false;
        if msg.info.is_some() {
            self.info_due = false;
        }
        self.registrations.clear_summary_divergence();
        if self.protocol.last_message_id()
            >= self.last_persisted_message_id + MESSAGE_ID_PERSIST_STRIDE
        {
            self.persist_state();
        }
        // Capped drains may have left overflow behind.
        if self.registrations.has_pending_ops() || self.protocol.has_pending_acks() {
            self.scheduler.schedule(OpId::Batcher, now);
        }
    }

    fn build_info_message(&self) -> InfoMessage {
        InfoMessage {
            performance_counters: self
                .stats
                .counter_pairs()
                .into_iter()
                .map(|(name, value)| (name.to_string(), value))
                .collect(),
            config_params: self
                .config
                .config_params()
                .into_iter()
                .map(|(name, value)| (name.to_string(), value))
                .collect(),
        }
    }

    fn dispatch(&mut self, msg: ServerMessage) {
        self.absorb_header(&msg.header);
        if let Some(tc) = msg.token_control {
            self.handle_token_control(tc);
        }
        if let Some(error) = msg.error {
            self.handle_server_error(error);
        }
        if !msg.registration_statuses.is_empty() {
            self.handle_registration_statuses(&msg.registration_statuses);
        }
        if let Some(section) = msg.invalidations {
            self.handle_invalidations(section);
        }
        if msg.sync_request {
            self.handle_sync_request();
        }
        if !msg.info_request.is_empty() {
            self.info_due = true;
            let now = self.resources.now_ms();
            self.scheduler.schedule(OpId::Batcher, now);
        }
    }

    fn absorb_header(&mut self, header: &ServerHeader) {
        if let Some(interval) = header.next_heartbeat_interval_ms {
            self.scheduler.set_period(OpId::Heartbeat, interval);
        }
        if let Some(interval) = header.next_poll_interval_ms {
            self.scheduler.set_period(OpId::Poll, interval);
        }
        if let Some(summary) = &header.registration_summary
            && self.registrations.check_summary(summary)
        {
            tracing::debug!("server registration summary diverged from ours");
            let now = self.resources.now_ms();
            self.scheduler.schedule(OpId::Batcher, now);
        }
    }

    fn handle_token_control(&mut self, tc: TokenControl) {
        let now = self.resources.now_ms();
        match self.session.clone() {
            Session::AwaitingToken { nonce } => {
                if tc.nonce != Some(nonce) {
                    self.stats.token_mismatches += 1;
                    tracing::info!("dropping token control with stale nonce");
                    return;
                }
                match (tc.status, tc.new_token) {
                    (TokenStatus::Success, Some(new_token)) => {
                        self.adopt_token(new_token, None, now);
                    }
                    (TokenStatus::Success, None) => {
                        tracing::warn!("dropping token assignment without a token");
                    }
                    (TokenStatus::TransientFailure, _) => {
                        // The retry timer re-sends with backoff.
                    }
                    (TokenStatus::AuthFailure | TokenStatus::UnknownClient, _) => {
                        self.listener.inform_error("server rejected token request");
                    }
                }
            }
            Session::RunningStale { token, nonce } => {
                if tc.nonce != Some(nonce) {
                    self.stats.token_mismatches += 1;
                    tracing::info!("dropping token control with stale nonce");
                    return;
                }
                match (tc.status, tc.new_token) {
                    (TokenStatus::Success, Some(new_token)) => {
                        self.adopt_token(new_token, Some(token), now);
                    }
                    (TokenStatus::Success, None) => {
                        tracing::warn!("dropping token assignment without a token");
                    }
                    (TokenStatus::TransientFailure, _) => {}
                    (TokenStatus::AuthFailure | TokenStatus::UnknownClient, _) => {
                        self.lose_token();
                        self.acquire_token(now);
                    }
                }
            }
            Session::Running { token } => match tc.status {
                TokenStatus::AuthFailure | TokenStatus::UnknownClient => {
                    self.lose_token();
                    self.acquire_token(now);
                }
                TokenStatus::TransientFailure => self.enter_stale(token, now),
                TokenStatus::Success => match tc.new_token {
                    Some(new_token) if new_token != token => {
                        self.adopt_token(new_token, Some(token), now);
                    }
                    Some(_) => {}
                    // A successful destroy: the server withdrew the token.
                    None => {
                        self.lose_token();
                        self.acquire_token(now);
                    }
                },
            },
            Session::Unassigned => {
                tracing::info!("dropping token control while unassigned");
            }
        }
    }

    fn handle_server_error(&mut self, error: ServerError) {
        match error.code {
            ServerErrorCode::AuthFailure | ServerErrorCode::UnknownClient => {
                if self.session.is_running() {
                    let now = self.resources.now_ms();
                    self.lose_token();
                    self.acquire_token(now);
                } else {
                    self.listener.inform_error(&error.description);
                }
            }
            ServerErrorCode::Internal => self.listener.inform_error(&error.description),
        }
    }

    fn handle_registration_statuses(
        &mut self,
        statuses: &[super::proto::RegistrationStatus],
    ) {
        self.stats.received_reg_statuses += statuses.len() as u64;
        if !self.session.is_running() {
            tracing::info!("dropping registration statuses outside a session");
            return;
        }
        let events = self.registrations.apply_statuses(statuses);
        let mut retry = false;
        for event in events {
            match event {
                RegistrationEvent::Confirmed { object, state } => {
                    self.listener.registration_status(object, state);
                }
                RegistrationEvent::Failed {
                    object,
                    is_transient,
                    reason,
                } => {
                    retry = retry || is_transient;
                    self.listener
                        .registration_failure(object, is_transient, &reason);
                }
            }
        }
        if retry {
            let now = self.resources.now_ms();
            self.scheduler.schedule(OpId::Batcher, now);
        }
    }

    fn handle_invalidations(&mut self, section: InvalidationSection) {
        if !self.session.is_running() {
            tracing::info!("dropping invalidations outside a session");
            return;
        }
        self.stats.received_invalidations += section.invalidations.len() as u64;
        if section.invalidate_all {
            let handle = self.new_ack_handle(AckEvent::All);
            self.listener.invalidate_all(handle);
        }
        for wire in section.invalidations {
            let handle = self.new_ack_handle(AckEvent::Invalidation(wire.clone()));
            if wire.known_version {
                self.listener.invalidate(wire.invalidation, handle);
            } else {
                let object = wire.invalidation.object().clone();
                self.listener.invalidate_unknown_version(object, handle);
            }
        }
    }

    fn handle_sync_request(&mut self) {
        if !self.session.is_running() {
            return;
        }
        self.registrations.apply_sync_request();
        let now = self.resources.now_ms();
        self.scheduler.schedule(OpId::Batcher, now);
    }

    fn new_ack_handle(&mut self, event: AckEvent) -> AckHandle {
        self.next_ack_id += 1;
        self.outstanding_acks.insert(self.next_ack_id, event);
        AckHandle {
            id: self.next_ack_id,
        }
    }

    fn adopt_token(&mut self, new_token: ClientToken, old: Option<ClientToken>, now: u64) {
        if let Some(old) = old
            && old != new_token
        {
            self.signal_registrations_lost();
        }
        self.session = Session::Running { token: new_token };
        self.scheduler.cancel(OpId::InitRetry);
        self.backoff.reset();
        self.init_due = false;
        self.persist_state();
        if !self.had_token {
            self.had_token = true;
            self.listener.ready();
        }
        if self.has_outbound_work() {
            self.scheduler.schedule(OpId::Batcher, now);
        }
    }

    fn enter_stale(&mut self, token: ClientToken, now: u64) {
        let nonce = Nonce::generate(&mut self.rng);
        self.session = Session::RunningStale { token, nonce };
        self.init_due = true;
        self.scheduler.schedule(OpId::Batcher, now);
        self.schedule_init_retry(now);
    }

    fn acquire_token(&mut self, now: u64) {
        let nonce = Nonce::generate(&mut self.rng);
        self.session = Session::AwaitingToken { nonce };
        self.init_due = true;
        self.scheduler.schedule(OpId::Batcher, now);
        self.schedule_init_retry(now);
    }

    fn schedule_init_retry(&mut self, now: u64) {
        let delay = self.config.initial_backoff_ms + self.backoff.next_delay_ms();
        self.scheduler.cancel(OpId::InitRetry);
        self.scheduler.schedule_in(OpId::InitRetry, now, delay);
    }

    fn on_init_retry(&mut self, now: u64) {
        match self.session.clone() {
            Session::AwaitingToken { .. } => {
                let nonce = Nonce::generate(&mut self.rng);
                self.session = Session::AwaitingToken { nonce };
            }
            Session::RunningStale { token, .. } => {
                let nonce = Nonce::generate(&mut self.rng);
                self.session = Session::RunningStale { token, nonce };
            }
            Session::Unassigned | Session::Running { .. } => return,
        }
        self.init_due = true;
        self.scheduler.schedule(OpId::Batcher, now);
        self.schedule_init_retry(now);
    }

    /// Token-change authoritative signal: fired exactly once whenever an
    /// assigned token is cleared or replaced, before any further outbound
    /// message.
    fn signal_registrations_lost(&mut self) {
        self.registrations.reset_confirmed();
        self.outstanding_acks.clear();
        self.protocol.clear_acks();
        self.listener.registrations_lost();
        self.listener.reissue_registrations(&[], 0);
    }

    fn lose_token(&mut self) {
        self.signal_registrations_lost();
        self.session = Session::Unassigned;
        self.resources.delete_state();
    }

    fn persist_state(&mut self) {
        let Some(token) = self.session.token().cloned() else {
            return;
        };
        let state = PersistentState {
            client_token: token,
            last_message_id: self.protocol.last_message_id(),
        };
        match encode_state(&state, &self.mac) {
            Ok(blob) => match self.resources.write_state(blob) {
                Ok(()) => self.last_persisted_message_id = state.last_message_id,
                Err(err) => {
                    self.stats.persist_write_failures += 1;
                    tracing::warn!("persist failed, continuing: {err}");
                }
            },
            Err(err) => {
                self.stats.persist_write_failures += 1;
                tracing::warn!("persist encode failed, continuing: {err}");
            }
        }
    }

    /// The engine produced a message its own validator rejects. The state
    /// machine can no longer be trusted; stop.
    fn fatal(&mut self, err: EngineError) {
        tracing::error!("fatal internal error, stopping engine: {err}");
        self.listener
            .inform_error(&format!("internal error: {err}"));
        self.stopped = true;
        self.scheduler.cancel_all();
    }
}
