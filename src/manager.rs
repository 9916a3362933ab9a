//! Call-session lifecycle management
//!
//! [`CallSessionManager`] is the single owner of call state. It runs as
//! an actor: every user command, inbound signal, negotiation completion
//! and timer lands in one mailbox and is processed to completion before
//! the next, so no transition can interleave with another. Cloneable
//! [`CallManagerHandle`]s are the only way in.
//!
//! State is keyed by [`CallId`], never by peer id. Terminal ids are
//! latched, so a late or duplicate message for a finished call can never
//! resurrect it.

use crate::identity::{UserId, UserDirectory};
use crate::negotiation::{
    MediaDevices, NegotiationEngine, NegotiationError, PeerTransportFactory,
};
use crate::presence::PresenceTracker;
use crate::signaling::{
    SignalEnvelope, SignalPayload, SignalingChannel, SignalingError, SignalingTransport,
};
use crate::store::SessionStore;
use crate::types::{
    CallEvent, CallId, CallSession, CallStatus, CallType, IceCandidate, SessionDescription,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

/// Call-control errors
#[derive(Error, Debug)]
pub enum CallError {
    /// A call is already in progress; exactly one at a time
    #[error("a call is already in progress")]
    CallInProgress,

    /// No live or finished record of the given call
    #[error("call not found: {0}")]
    CallNotFound(CallId),

    /// Operation does not apply to the call's current state
    #[error("invalid call state: {0}")]
    InvalidState(&'static str),

    /// Media or transport negotiation failure
    #[error(transparent)]
    Media(#[from] NegotiationError),

    /// Signaling failure
    #[error(transparent)]
    Signaling(#[from] SignalingError),

    /// The manager task has shut down
    #[error("call manager closed")]
    ManagerClosed,
}

/// Manager tuning knobs
#[derive(Debug, Clone)]
pub struct CallManagerConfig {
    /// How long an unanswered call rings before it is ended
    pub ring_timeout: Duration,
    /// Extra send attempts per signal before giving up
    pub signal_send_retries: u32,
}

impl Default for CallManagerConfig {
    fn default() -> Self {
        Self {
            ring_timeout: Duration::from_secs(45),
            signal_send_retries: 3,
        }
    }
}

/// Where a live call is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallPhase {
    /// Outbound, offer still being created
    Initiating,
    /// Outbound, offer sent, waiting on the callee
    RingingOut,
    /// Inbound, waiting on the local user to accept or decline
    Incoming,
    /// Both descriptions applied, media flowing
    Active,
}

struct LiveCall {
    session: CallSession,
    phase: CallPhase,
    engine: NegotiationEngine,
    /// Remote offer held until the local user accepts
    pending_offer: Option<SessionDescription>,
    /// `start_call` reply held open until the offer is out (or failed)
    pending_reply: Option<oneshot::Sender<Result<CallId, CallError>>>,
    ring_timer: Option<JoinHandle<()>>,
}

enum Command {
    StartCall {
        callee: UserId,
        call_type: CallType,
        reply: oneshot::Sender<Result<CallId, CallError>>,
    },
    AcceptCall {
        call_id: CallId,
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    DeclineCall {
        call_id: CallId,
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    EndCall {
        call_id: CallId,
        reply: oneshot::Sender<Result<(), CallError>>,
    },
}

enum ManagerMsg {
    Command(Command),
    Signal(SignalEnvelope),
    OfferReady {
        call_id: CallId,
        result: Result<SessionDescription, NegotiationError>,
    },
    LocalCandidate {
        call_id: CallId,
        candidate: IceCandidate,
    },
    RingTimeout(CallId),
    Shutdown(oneshot::Sender<()>),
}

/// Mailbox depth; commands and signals share it
const MAILBOX_CAPACITY: usize = 128;

/// Event fan-out depth
const EVENT_CAPACITY: usize = 128;

/// Dependencies the manager actor runs over
pub struct ManagerDeps<T: SignalingTransport> {
    /// The local user all calls belong to
    pub local_user: UserId,
    /// Open signaling channel for the local user
    pub channel: Arc<SignalingChannel<T>>,
    /// Produces one fresh peer transport per call
    pub transport_factory: PeerTransportFactory,
    /// Local capture devices
    pub devices: Arc<dyn MediaDevices>,
    /// Durable session records; failures here never block a call
    pub store: Arc<dyn SessionStore>,
    /// Advisory reachability hints
    pub presence: Arc<dyn PresenceTracker>,
    /// Display-name resolution for notifications
    pub directory: Arc<dyn UserDirectory>,
}

/// Cloneable handle to a running [`CallSessionManager`]
#[derive(Clone)]
pub struct CallManagerHandle {
    tx: mpsc::Sender<ManagerMsg>,
    events: broadcast::Sender<CallEvent>,
}

impl CallManagerHandle {
    /// Subscribe to call events
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    async fn command<R>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<R, CallError>>) -> Command,
    ) -> Result<R, CallError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ManagerMsg::Command(make(reply)))
            .await
            .map_err(|_| CallError::ManagerClosed)?;
        rx.await.map_err(|_| CallError::ManagerClosed)?
    }

    /// Place a call to `callee`.
    ///
    /// Resolves once local media is captured and the offer has been
    /// delivered, so capture and delivery failures surface here rather
    /// than only as a later `Failed` event.
    ///
    /// # Errors
    ///
    /// Returns [`CallError::CallInProgress`] if a call is already live,
    /// [`CallError::Media`] when capture or offer creation fails, and
    /// [`CallError::Signaling`] when the offer cannot be delivered
    pub async fn start_call(
        &self,
        callee: UserId,
        call_type: CallType,
    ) -> Result<CallId, CallError> {
        self.command(|reply| Command::StartCall {
            callee,
            call_type,
            reply,
        })
        .await
    }

    /// Accept a ringing incoming call
    ///
    /// # Errors
    ///
    /// Returns [`CallError::CallNotFound`] for an unknown id and
    /// [`CallError::InvalidState`] if the call is not ringing inbound
    pub async fn accept_call(&self, call_id: CallId) -> Result<(), CallError> {
        self.command(|reply| Command::AcceptCall { call_id, reply })
            .await
    }

    /// Decline a ringing incoming call
    ///
    /// # Errors
    ///
    /// Returns [`CallError::CallNotFound`] for an unknown id and
    /// [`CallError::InvalidState`] if the call is not ringing inbound
    pub async fn decline_call(&self, call_id: CallId) -> Result<(), CallError> {
        self.command(|reply| Command::DeclineCall { call_id, reply })
            .await
    }

    /// Hang up (or cancel) a call. Idempotent for calls that already
    /// finished; only a never-seen id is an error.
    ///
    /// # Errors
    ///
    /// Returns [`CallError::CallNotFound`] for an id the manager has
    /// never seen
    pub async fn end_call(&self, call_id: CallId) -> Result<(), CallError> {
        self.command(|reply| Command::EndCall { call_id, reply })
            .await
    }

    /// Feed an inbound signaling envelope into the manager
    ///
    /// # Errors
    ///
    /// Returns [`CallError::ManagerClosed`] if the manager has shut down
    pub async fn deliver_signal(&self, envelope: SignalEnvelope) -> Result<(), CallError> {
        self.tx
            .send(ManagerMsg::Signal(envelope))
            .await
            .map_err(|_| CallError::ManagerClosed)
    }

    /// End all live calls and stop the manager task
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(ManagerMsg::Shutdown(reply)).await.is_ok() {
            let _ = rx.await;
        }
    }
}

/// The call-state actor. Constructed via [`CallSessionManager::spawn`],
/// driven entirely through [`CallManagerHandle`]s.
pub struct CallSessionManager<T: SignalingTransport> {
    deps: ManagerDeps<T>,
    config: CallManagerConfig,
    tx: mpsc::Sender<ManagerMsg>,
    events: broadcast::Sender<CallEvent>,
    calls: HashMap<CallId, LiveCall>,
    finished: HashSet<CallId>,
}

impl<T: SignalingTransport> CallSessionManager<T> {
    /// Spawn the manager task and return its handle
    #[must_use]
    pub fn spawn(deps: ManagerDeps<T>, config: CallManagerConfig) -> CallManagerHandle {
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let manager = Self {
            deps,
            config,
            tx: tx.clone(),
            events: events.clone(),
            calls: HashMap::new(),
            finished: HashSet::new(),
        };
        tokio::spawn(manager.run(rx));

        CallManagerHandle { tx, events }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<ManagerMsg>) {
        while let Some(msg) = rx.recv().await {
            match msg {
                ManagerMsg::Command(cmd) => self.handle_command(cmd).await,
                ManagerMsg::Signal(envelope) => self.handle_signal(envelope).await,
                ManagerMsg::OfferReady { call_id, result } => {
                    self.handle_offer_ready(call_id, result).await;
                }
                ManagerMsg::LocalCandidate { call_id, candidate } => {
                    self.handle_local_candidate(call_id, candidate).await;
                }
                ManagerMsg::RingTimeout(call_id) => self.handle_ring_timeout(call_id).await,
                ManagerMsg::Shutdown(reply) => {
                    let live: Vec<CallId> = self.calls.keys().copied().collect();
                    for call_id in live {
                        self.notify_peer(call_id, SignalPayload::CallEnd).await;
                        self.terminate(call_id, CallStatus::Ended).await;
                    }
                    let _ = reply.send(());
                    break;
                }
            }
        }
        tracing::debug!(user = %self.deps.local_user, "call manager stopped");
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::StartCall {
                callee,
                call_type,
                reply,
            } => {
                self.start_call(callee, call_type, reply).await;
            }
            Command::AcceptCall { call_id, reply } => {
                let _ = reply.send(self.accept_call(call_id).await);
            }
            Command::DeclineCall { call_id, reply } => {
                let _ = reply.send(self.decline_call(call_id).await);
            }
            Command::EndCall { call_id, reply } => {
                let _ = reply.send(self.end_call(call_id).await);
            }
        }
    }

    #[tracing::instrument(skip(self, reply), fields(user = %self.deps.local_user, callee = %callee))]
    async fn start_call(
        &mut self,
        callee: UserId,
        call_type: CallType,
        reply: oneshot::Sender<Result<CallId, CallError>>,
    ) {
        if !self.calls.is_empty() {
            let _ = reply.send(Err(CallError::CallInProgress));
            return;
        }

        if !self.deps.presence.is_online(&callee).await {
            // Advisory only; the offer itself is the reachability test.
            tracing::info!("callee appears offline, attempting anyway");
        }

        let call_id = CallId::new();
        let session = CallSession::new(
            call_id,
            call_type,
            self.deps.local_user.clone(),
            callee.clone(),
        );
        if let Err(e) = self.deps.store.create(&session).await {
            tracing::warn!(call_id = %call_id, error = %e, "session record not persisted");
        }

        let engine = match self.new_engine(call_id).await {
            Ok(engine) => engine,
            Err(e) => {
                tracing::warn!(call_id = %call_id, error = %e, "peer transport could not be built");
                let mut session = session;
                session.touch(CallStatus::Failed);
                if let Err(e) = self.deps.store.update(&session).await {
                    tracing::warn!(call_id = %call_id, error = %e, "session record not persisted");
                }
                self.finished.insert(call_id);
                self.emit_state(call_id, CallStatus::Failed);
                let _ = reply.send(Err(e.into()));
                return;
            }
        };

        // Media acquisition and offer creation run off the actor; the
        // result is re-dispatched by call id so an end or decline that
        // lands first simply makes it a no-op. The command reply is held
        // open until then, so the caller sees capture and delivery
        // failures instead of a call that rings and immediately dies.
        let offer_engine = engine.clone();
        let offer_tx = self.tx.clone();
        tokio::spawn(async move {
            let result = match offer_engine
                .acquire_local_media(true, call_type.has_video())
                .await
            {
                Ok(_) => offer_engine.create_offer().await,
                Err(e) => Err(e),
            };
            let _ = offer_tx.send(ManagerMsg::OfferReady { call_id, result }).await;
        });

        let ring_timer = self.spawn_ring_timer(call_id);
        self.calls.insert(
            call_id,
            LiveCall {
                session,
                phase: CallPhase::Initiating,
                engine,
                pending_offer: None,
                pending_reply: Some(reply),
                ring_timer: Some(ring_timer),
            },
        );
        tracing::info!(call_id = %call_id, "call initiated");
    }

    async fn accept_call(&mut self, call_id: CallId) -> Result<(), CallError> {
        let call = self
            .calls
            .get_mut(&call_id)
            .ok_or(CallError::CallNotFound(call_id))?;
        if call.phase != CallPhase::Incoming {
            return Err(CallError::InvalidState("call is not ringing inbound"));
        }
        let offer = call
            .pending_offer
            .take()
            .ok_or(CallError::InvalidState("no pending offer"))?;
        let engine = call.engine.clone();
        let call_type = call.session.call_type;

        let negotiated: Result<SessionDescription, NegotiationError> = async {
            engine
                .acquire_local_media(true, call_type.has_video())
                .await?;
            engine.apply_remote_description(offer).await?;
            engine.create_answer().await
        }
        .await;

        let answer = match negotiated {
            Ok(answer) => answer,
            Err(e) => {
                tracing::warn!(call_id = %call_id, error = %e, "accept failed during negotiation");
                self.notify_peer(call_id, SignalPayload::CallEnd).await;
                self.terminate(call_id, CallStatus::Failed).await;
                return Err(e.into());
            }
        };

        if let Err(e) = self
            .send_signal(call_id, SignalPayload::CallAnswer {
                description: answer,
            })
            .await
        {
            tracing::warn!(call_id = %call_id, error = %e, "answer could not be delivered");
            self.terminate(call_id, CallStatus::Failed).await;
            return Err(e.into());
        }

        self.activate(call_id).await;
        tracing::info!(call_id = %call_id, "call accepted");
        Ok(())
    }

    async fn decline_call(&mut self, call_id: CallId) -> Result<(), CallError> {
        let call = self
            .calls
            .get(&call_id)
            .ok_or(CallError::CallNotFound(call_id))?;
        if call.phase != CallPhase::Incoming {
            return Err(CallError::InvalidState("call is not ringing inbound"));
        }
        self.notify_peer(call_id, SignalPayload::CallDecline).await;
        self.terminate(call_id, CallStatus::Declined).await;
        tracing::info!(call_id = %call_id, "call declined");
        Ok(())
    }

    async fn end_call(&mut self, call_id: CallId) -> Result<(), CallError> {
        if self.calls.contains_key(&call_id) {
            self.notify_peer(call_id, SignalPayload::CallEnd).await;
            self.terminate(call_id, CallStatus::Ended).await;
            tracing::info!(call_id = %call_id, "call ended locally");
            return Ok(());
        }
        if self.finished.contains(&call_id) {
            // Hanging up twice is not an error.
            return Ok(());
        }
        Err(CallError::CallNotFound(call_id))
    }

    async fn handle_offer_ready(
        &mut self,
        call_id: CallId,
        result: Result<SessionDescription, NegotiationError>,
    ) {
        let Some(call) = self.calls.get_mut(&call_id) else {
            tracing::debug!(call_id = %call_id, "offer ready for a call that no longer exists");
            return;
        };
        if call.phase != CallPhase::Initiating {
            tracing::debug!(call_id = %call_id, "offer ready in unexpected phase, dropped");
            return;
        }

        let offer = match result {
            Ok(offer) => offer,
            Err(e) => {
                tracing::warn!(call_id = %call_id, error = %e, "media capture or offer creation failed");
                let reply = call.pending_reply.take();
                self.terminate(call_id, CallStatus::Failed).await;
                if let Some(reply) = reply {
                    let _ = reply.send(Err(e.into()));
                }
                return;
            }
        };
        let call_type = call.session.call_type;
        call.phase = CallPhase::RingingOut;

        match self
            .send_signal(call_id, SignalPayload::CallOffer {
                description: offer,
                call_type,
            })
            .await
        {
            Ok(()) => {
                // The call rings (and the caller learns its id) only once
                // the offer is actually out.
                self.emit_state(call_id, CallStatus::Ringing);
                if let Some(reply) = self
                    .calls
                    .get_mut(&call_id)
                    .and_then(|c| c.pending_reply.take())
                {
                    let _ = reply.send(Ok(call_id));
                }
            }
            Err(e) => {
                tracing::warn!(call_id = %call_id, error = %e, "offer could not be delivered");
                let reply = self
                    .calls
                    .get_mut(&call_id)
                    .and_then(|c| c.pending_reply.take());
                self.terminate(call_id, CallStatus::Failed).await;
                if let Some(reply) = reply {
                    let _ = reply.send(Err(e.into()));
                }
            }
        }
    }

    async fn handle_local_candidate(&mut self, call_id: CallId, candidate: IceCandidate) {
        if !self.calls.contains_key(&call_id) {
            return;
        }
        if let Err(e) = self
            .send_signal(call_id, SignalPayload::IceCandidate { candidate })
            .await
        {
            // A lost candidate degrades the path, it does not kill the call.
            tracing::warn!(call_id = %call_id, error = %e, "local candidate not delivered");
        }
    }

    async fn handle_ring_timeout(&mut self, call_id: CallId) {
        let Some(call) = self.calls.get(&call_id) else {
            return;
        };
        if call.phase == CallPhase::Active {
            return;
        }
        tracing::info!(call_id = %call_id, "ring timeout, ending unanswered call");
        self.notify_peer(call_id, SignalPayload::CallEnd).await;
        self.terminate(call_id, CallStatus::Ended).await;
    }

    async fn handle_signal(&mut self, envelope: SignalEnvelope) {
        let call_id = envelope.call_id;
        tracing::debug!(
            call_id = %call_id,
            from = %envelope.from,
            kind = envelope.payload.kind(),
            "signal received"
        );
        match envelope.payload {
            SignalPayload::CallOffer {
                description,
                call_type,
            } => {
                self.handle_incoming_offer(call_id, envelope.from, description, call_type)
                    .await;
            }
            SignalPayload::CallAnswer { description } => {
                self.handle_answer(call_id, description).await;
            }
            SignalPayload::IceCandidate { candidate } => {
                let Some(call) = self.calls.get(&call_id) else {
                    tracing::debug!(call_id = %call_id, "candidate for unknown or finished call, dropped");
                    return;
                };
                if let Err(e) = call.engine.add_remote_candidate(candidate).await {
                    tracing::warn!(call_id = %call_id, error = %e, "remote candidate rejected");
                }
            }
            SignalPayload::CallEnd => {
                if self.calls.contains_key(&call_id) {
                    self.terminate(call_id, CallStatus::Ended).await;
                    tracing::info!(call_id = %call_id, "call ended by peer");
                } else {
                    tracing::debug!(call_id = %call_id, "end for unknown or finished call, dropped");
                }
            }
            SignalPayload::CallDecline => {
                if self.calls.contains_key(&call_id) {
                    self.terminate(call_id, CallStatus::Declined).await;
                    tracing::info!(call_id = %call_id, "call declined by peer");
                } else {
                    tracing::debug!(call_id = %call_id, "decline for unknown or finished call, dropped");
                }
            }
        }
    }

    async fn handle_incoming_offer(
        &mut self,
        call_id: CallId,
        caller: UserId,
        description: SessionDescription,
        call_type: CallType,
    ) {
        if self.finished.contains(&call_id) {
            tracing::debug!(call_id = %call_id, "offer for finished call, dropped");
            return;
        }
        if self.calls.contains_key(&call_id) {
            // At-least-once delivery; the first copy won.
            tracing::debug!(call_id = %call_id, "duplicate offer, dropped");
            return;
        }
        if !self.calls.is_empty() {
            tracing::info!(call_id = %call_id, caller = %caller, "busy, declining incoming call");
            let decline = SignalEnvelope {
                call_id,
                from: self.deps.local_user.clone(),
                to: caller,
                payload: SignalPayload::CallDecline,
            };
            if let Err(e) = self.deps.channel.send_with_retry(decline, 0).await {
                tracing::warn!(call_id = %call_id, error = %e, "busy decline not delivered");
            }
            return;
        }

        let session = CallSession::new(call_id, call_type, caller.clone(), self.deps.local_user.clone());
        if let Err(e) = self.deps.store.create(&session).await {
            tracing::warn!(call_id = %call_id, error = %e, "session record not persisted");
        }

        let engine = match self.new_engine(call_id).await {
            Ok(engine) => engine,
            Err(e) => {
                tracing::warn!(call_id = %call_id, error = %e, "peer transport could not be built");
                let mut session = session;
                session.touch(CallStatus::Failed);
                if let Err(e) = self.deps.store.update(&session).await {
                    tracing::warn!(call_id = %call_id, error = %e, "session record not persisted");
                }
                self.finished.insert(call_id);
                self.emit_state(call_id, CallStatus::Failed);
                let decline = SignalEnvelope {
                    call_id,
                    from: self.deps.local_user.clone(),
                    to: caller,
                    payload: SignalPayload::CallDecline,
                };
                if let Err(e) = self.deps.channel.send_with_retry(decline, 0).await {
                    tracing::warn!(call_id = %call_id, error = %e, "failure decline not delivered");
                }
                return;
            }
        };
        let ring_timer = self.spawn_ring_timer(call_id);
        let caller_name = self
            .deps
            .directory
            .display_name(&caller)
            .await
            .unwrap_or_else(|| caller.to_string());

        let event_session = session.clone();
        self.calls.insert(
            call_id,
            LiveCall {
                session,
                phase: CallPhase::Incoming,
                engine,
                pending_offer: Some(description.clone()),
                pending_reply: None,
                ring_timer: Some(ring_timer),
            },
        );

        tracing::info!(call_id = %call_id, caller = %caller, "incoming call");
        let _ = self.events.send(CallEvent::IncomingCall {
            session: event_session,
            caller_id: caller,
            caller_name,
            offer: description,
        });
        self.emit_state(call_id, CallStatus::Ringing);
    }

    async fn handle_answer(&mut self, call_id: CallId, description: SessionDescription) {
        let Some(call) = self.calls.get(&call_id) else {
            tracing::debug!(call_id = %call_id, "answer for unknown or finished call, dropped");
            return;
        };
        if call.phase != CallPhase::RingingOut {
            tracing::debug!(call_id = %call_id, "answer in unexpected phase, dropped");
            return;
        }
        let engine = call.engine.clone();
        if let Err(e) = engine.apply_remote_description(description).await {
            tracing::warn!(call_id = %call_id, error = %e, "answer could not be applied");
            self.notify_peer(call_id, SignalPayload::CallEnd).await;
            self.terminate(call_id, CallStatus::Failed).await;
            return;
        }
        self.activate(call_id).await;
        tracing::info!(call_id = %call_id, "call answered");
    }

    /// Transition a live call to active: stop the ring timer, persist,
    /// and publish the change.
    async fn activate(&mut self, call_id: CallId) {
        let Some(call) = self.calls.get_mut(&call_id) else {
            return;
        };
        if let Some(timer) = call.ring_timer.take() {
            timer.abort();
        }
        call.phase = CallPhase::Active;
        call.session.touch(CallStatus::Active);
        let session = call.session.clone();
        if let Err(e) = self.deps.store.update(&session).await {
            tracing::warn!(call_id = %call_id, error = %e, "session record not persisted");
        }
        self.emit_state(call_id, CallStatus::Active);
    }

    /// Tear a live call down into a terminal status and latch its id
    async fn terminate(&mut self, call_id: CallId, status: CallStatus) {
        let Some(mut call) = self.calls.remove(&call_id) else {
            return;
        };
        if let Some(timer) = call.ring_timer.take() {
            timer.abort();
        }
        call.session.touch(status);
        if let Err(e) = self.deps.store.update(&call.session).await {
            tracing::warn!(call_id = %call_id, error = %e, "session record not persisted");
        }
        call.engine.teardown().await;
        // A timer or shutdown can end the call while its start command is
        // still waiting on the offer; the caller still gets the id.
        if let Some(reply) = call.pending_reply.take() {
            let _ = reply.send(Ok(call_id));
        }
        self.finished.insert(call_id);
        self.emit_state(call_id, status);
    }

    /// Build the per-call negotiation engine and bridge its locally
    /// discovered candidates back into the mailbox.
    async fn new_engine(&self, call_id: CallId) -> Result<NegotiationEngine, NegotiationError> {
        let transport = (self.deps.transport_factory)().await?;
        let engine = NegotiationEngine::new(transport, Arc::clone(&self.deps.devices));

        let (candidate_tx, mut candidate_rx) = mpsc::unbounded_channel();
        engine.on_local_ice_candidate(candidate_tx);
        let mailbox = self.tx.clone();
        tokio::spawn(async move {
            while let Some(candidate) = candidate_rx.recv().await {
                if mailbox
                    .send(ManagerMsg::LocalCandidate { call_id, candidate })
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });
        Ok(engine)
    }

    fn spawn_ring_timer(&self, call_id: CallId) -> JoinHandle<()> {
        let mailbox = self.tx.clone();
        let timeout = self.config.ring_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = mailbox.send(ManagerMsg::RingTimeout(call_id)).await;
        })
    }

    async fn send_signal(
        &self,
        call_id: CallId,
        payload: SignalPayload,
    ) -> Result<(), SignalingError> {
        let Some(call) = self.calls.get(&call_id) else {
            return Ok(());
        };
        let Some(peer) = call.session.peer_of(&self.deps.local_user).cloned() else {
            return Ok(());
        };
        let envelope = SignalEnvelope {
            call_id,
            from: self.deps.local_user.clone(),
            to: peer,
            payload,
        };
        self.deps
            .channel
            .send_with_retry(envelope, self.config.signal_send_retries)
            .await
    }

    /// Best-effort peer notification; failures are logged, never fatal
    async fn notify_peer(&self, call_id: CallId, payload: SignalPayload) {
        let kind = payload.kind();
        if let Err(e) = self.send_signal(call_id, payload).await {
            tracing::warn!(call_id = %call_id, kind, error = %e, "peer notification not delivered");
        }
    }

    fn emit_state(&self, call_id: CallId, status: CallStatus) {
        let _ = self.events.send(CallEvent::StateChanged { call_id, status });
    }
}
