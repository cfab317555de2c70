//! Per-session negotiation actor.
//!
//! Everything that can change a session (signaling arrivals, link callbacks,
//! timer firings, close requests) becomes a [`SessionEvent`] and is folded
//! through [`Negotiator::handle`] on a single task. Link callbacks and timers
//! only post events; they never touch session state.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use careline_protocol::{IceCandidate, IceConfig, NegotiationMessage, SessionDescription, TimerConfig};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

use crate::error::{CallFailure, NegotiationError, SignalingError};
use crate::link::{ActiveLink, LinkEvent, LinkEventKind, LinkEventSender, LinkFactory, LinkState, PeerLink, TransportPolicy};
use crate::media::{CallMode, LocalMedia, MediaStream, TrackInfo};
use crate::probe::PathReport;
use crate::retry::{RetryOutcome, RetryPolicy, retry_until};
use crate::signaling::{Route, SignalingTransport, Subscription};
use crate::state::{CallState, CallStatus};
use crate::surface::SurfaceBindings;
use crate::timers::{TimerFired, TimerKind, Timers};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Caller,
    Callee,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionParams {
    pub conversation_id: String,
    pub local_id: String,
    pub remote_id: String,
    pub role: Role,
    pub mode: CallMode,
}

impl SessionParams {
    pub fn route(&self) -> Route {
        Route {
            conversation_id: self.conversation_id.clone(),
            local_id: self.local_id.clone(),
            remote_id: self.remote_id.clone(),
        }
    }

    /// Status a freshly opened session starts in.
    pub fn initial_status(&self) -> CallStatus {
        match self.role {
            Role::Caller => CallStatus::Ringing,
            Role::Callee => CallStatus::Connecting,
        }
    }
}

#[derive(Debug)]
pub enum SessionEvent {
    OfferReceived { attempt: u32, description: SessionDescription },
    AnswerReceived { attempt: u32, description: SessionDescription },
    CandidateReceived { attempt: u32, candidate: IceCandidate },
    HangupReceived,
    LocalCandidate { generation: u64, candidate: IceCandidate },
    LinkStateChanged { generation: u64, state: LinkState },
    RemoteTrack { generation: u64, track: TrackInfo },
    TimerFired(TimerFired),
    CloseRequested { notify_peer: bool },
}

impl SessionEvent {
    /// Filter and convert an inbound signaling message.
    pub fn from_message(message: NegotiationMessage, route: &Route) -> Result<Self, SignalingError> {
        route.accept(&message)?;
        Ok(match message {
            NegotiationMessage::Offer {
                attempt,
                description,
                ..
            } => Self::OfferReceived {
                attempt,
                description,
            },
            NegotiationMessage::Answer {
                attempt,
                description,
                ..
            } => Self::AnswerReceived {
                attempt,
                description,
            },
            NegotiationMessage::Candidate {
                attempt, candidate, ..
            } => Self::CandidateReceived { attempt, candidate },
            NegotiationMessage::Hangup { .. } => Self::HangupReceived,
        })
    }
}

impl From<LinkEvent> for SessionEvent {
    fn from(event: LinkEvent) -> Self {
        let generation = event.generation;
        match event.kind {
            LinkEventKind::LocalCandidate(candidate) => Self::LocalCandidate {
                generation,
                candidate,
            },
            LinkEventKind::StateChanged(state) => Self::LinkStateChanged { generation, state },
            LinkEventKind::RemoteTrack(track) => Self::RemoteTrack { generation, track },
        }
    }
}

/// What the resend loops need to know to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct Progress {
    attempt: u32,
    remote_applied: bool,
    /// Connected or finished.
    settled: bool,
}

/// Candidates that arrived before the description of their round.
#[derive(Debug, Default)]
pub(crate) struct PendingCandidates {
    queue: Vec<(u32, IceCandidate)>,
}

impl PendingCandidates {
    pub(crate) fn push(&mut self, attempt: u32, candidate: IceCandidate) {
        self.queue.push((attempt, candidate));
    }

    /// Remove and return the candidates of `attempt` in arrival order. Older
    /// rounds are discarded, newer ones stay queued.
    pub(crate) fn take_ready(&mut self, attempt: u32) -> Vec<IceCandidate> {
        let mut ready = Vec::new();
        let mut later = Vec::new();
        for (round, candidate) in self.queue.drain(..) {
            if round == attempt {
                ready.push(candidate);
            } else if round > attempt {
                later.push((round, candidate));
            }
        }
        self.queue = later;
        ready
    }

    pub(crate) fn clear(&mut self) {
        self.queue.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.queue.len()
    }
}

/// Everything a negotiator is built from.
pub struct NegotiatorSetup {
    pub params: SessionParams,
    pub ice: IceConfig,
    pub timers: TimerConfig,
    pub paths: PathReport,
    pub relay_only: bool,
    pub media: LocalMedia,
    pub signaling: Arc<dyn SignalingTransport>,
    pub links: Arc<dyn LinkFactory>,
    pub state: Arc<watch::Sender<CallState>>,
    pub surfaces: Arc<SurfaceBindings>,
}

/// Event sources drained by [`Negotiator::run`].
pub struct Inbound {
    events: mpsc::UnboundedReceiver<SessionEvent>,
    links: mpsc::UnboundedReceiver<LinkEvent>,
    timers: mpsc::UnboundedReceiver<TimerFired>,
    subscription: Subscription,
}

pub struct Negotiator {
    params: SessionParams,
    route: Route,
    ice: IceConfig,
    config: TimerConfig,
    paths: PathReport,
    relay_only: bool,
    media: LocalMedia,
    signaling: Arc<dyn SignalingTransport>,
    links: Arc<dyn LinkFactory>,
    state: Arc<watch::Sender<CallState>>,
    surfaces: Arc<SurfaceBindings>,
    timers: Timers,
    progress: watch::Sender<Progress>,
    link_events: LinkEventSender,
    link: Option<ActiveLink>,
    link_state: LinkState,
    next_generation: u64,
    /// Caller: round of the current offer. Callee: highest offer handled (0 = none).
    attempt: u32,
    remote_applied: bool,
    answered: bool,
    connected: bool,
    finished: bool,
    pending: PendingCandidates,
    remote_tracks: Vec<TrackInfo>,
}

impl Negotiator {
    pub fn new(
        setup: NegotiatorSetup,
        events: mpsc::UnboundedReceiver<SessionEvent>,
        subscription: Subscription,
    ) -> (Self, Inbound) {
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        let (progress, _) = watch::channel(Progress::default());
        let route = setup.params.route();

        let negotiator = Self {
            params: setup.params,
            route,
            ice: setup.ice,
            config: setup.timers,
            paths: setup.paths,
            relay_only: setup.relay_only,
            media: setup.media,
            signaling: setup.signaling,
            links: setup.links,
            state: setup.state,
            surfaces: setup.surfaces,
            timers: Timers::new(timer_tx),
            progress,
            link_events: link_tx,
            link: None,
            link_state: LinkState::New,
            next_generation: 0,
            attempt: 0,
            remote_applied: false,
            answered: false,
            connected: false,
            finished: false,
            pending: PendingCandidates::default(),
            remote_tracks: Vec::new(),
        };
        let inbound = Inbound {
            events,
            links: link_rx,
            timers: timer_rx,
            subscription,
        };
        (negotiator, inbound)
    }

    /// Build the first link and, for the caller, send the first offer.
    /// On error the session is already finished as `failed`.
    pub async fn start(&mut self) -> Result<(), NegotiationError> {
        let policy = if self.relay_only {
            TransportPolicy::RelayOnly
        } else {
            TransportPolicy::All
        };
        let result = match self.install_link(policy).await {
            Ok(()) => match self.params.role {
                Role::Caller => {
                    self.attempt = 1;
                    self.timers.arm_once(TimerKind::Dial, self.config.dial_timeout());
                    self.timers.arm_every(TimerKind::DialTick, Duration::from_secs(1));
                    self.send_offer().await
                }
                Role::Callee => {
                    self.arm_connect_timers();
                    Ok(())
                }
            },
            Err(e) => Err(e),
        };

        if let Err(e) = &result {
            warn!(conversation_id = %self.route.conversation_id, "Session start failed: {e}");
            let _ = self
                .finish(CallStatus::Failed, Some(CallFailure::Negotiation(e.to_string())), true)
                .await;
        } else {
            self.publish_progress();
        }
        result
    }

    /// Drain every event source until the session reaches a terminal state.
    pub async fn run(mut self, mut inbound: Inbound) {
        let mut signaling_open = true;
        loop {
            let event = tokio::select! {
                event = inbound.events.recv() => {
                    event.unwrap_or(SessionEvent::CloseRequested { notify_peer: true })
                }
                Some(event) = inbound.links.recv() => SessionEvent::from(event),
                Some(fired) = inbound.timers.recv() => SessionEvent::TimerFired(fired),
                message = inbound.subscription.recv(), if signaling_open => match message {
                    Some(message) => match SessionEvent::from_message(message, &self.route) {
                        Ok(event) => event,
                        Err(e) => {
                            debug!(conversation_id = %self.route.conversation_id, "Dropped signaling message: {e}");
                            continue;
                        }
                    },
                    None => {
                        warn!(conversation_id = %self.route.conversation_id, "Signaling subscription closed");
                        signaling_open = false;
                        continue;
                    }
                },
            };
            if self.handle(event).await.is_break() {
                break;
            }
        }
        debug!(conversation_id = %self.route.conversation_id, "Session task finished");
    }

    /// Fold one event into the session. `Break` once the session is terminal.
    pub async fn handle(&mut self, event: SessionEvent) -> ControlFlow<()> {
        if self.finished {
            return ControlFlow::Break(());
        }
        match event {
            SessionEvent::OfferReceived {
                attempt,
                description,
            } => self.on_offer(attempt, description).await,
            SessionEvent::AnswerReceived {
                attempt,
                description,
            } => self.on_answer(attempt, description).await,
            SessionEvent::CandidateReceived { attempt, candidate } => {
                self.on_remote_candidate(attempt, candidate).await;
                ControlFlow::Continue(())
            }
            SessionEvent::HangupReceived => {
                info!(conversation_id = %self.route.conversation_id, "Peer hung up");
                self.finish(CallStatus::Ended, None, false).await
            }
            SessionEvent::LocalCandidate {
                generation,
                candidate,
            } => {
                self.on_local_candidate(generation, candidate).await;
                ControlFlow::Continue(())
            }
            SessionEvent::LinkStateChanged { generation, state } => {
                self.on_link_state(generation, state).await
            }
            SessionEvent::RemoteTrack { generation, track } => {
                self.on_remote_track(generation, track);
                ControlFlow::Continue(())
            }
            SessionEvent::TimerFired(fired) => self.on_timer(fired).await,
            SessionEvent::CloseRequested { notify_peer } => {
                self.finish(CallStatus::Ended, None, notify_peer).await
            }
        }
    }

    async fn on_offer(&mut self, attempt: u32, description: SessionDescription) -> ControlFlow<()> {
        if self.params.role == Role::Caller {
            debug!(attempt, "Caller ignores inbound offer");
            return ControlFlow::Continue(());
        }
        if attempt <= self.attempt {
            debug!(attempt, handled = self.attempt, "Duplicate offer ignored");
            return ControlFlow::Continue(());
        }
        if self.connected {
            debug!(attempt, "Renegotiation offer ignored while connected");
            return ControlFlow::Continue(());
        }

        if self.remote_applied {
            // Current link already holds the previous round
            let policy = if self.paths.relay {
                self.mark_relay_only();
                TransportPolicy::RelayOnly
            } else {
                TransportPolicy::All
            };
            if let Err(e) = self.install_link(policy).await {
                return self
                    .finish(CallStatus::Failed, Some(CallFailure::Negotiation(e.to_string())), true)
                    .await;
            }
            self.arm_connect_timers();
        }

        self.attempt = attempt;
        match self.accept_offer(description).await {
            Ok(()) => ControlFlow::Continue(()),
            Err(e) => self.negotiation_failed(e).await,
        }
    }

    async fn accept_offer(&mut self, description: SessionDescription) -> Result<(), NegotiationError> {
        let link = self.current_link()?;
        link.set_remote_description(description).await?;
        self.remote_applied = true;
        self.publish_progress();
        self.drain_pending(link.as_ref()).await;

        let answer = link.create_answer().await?;
        link.set_local_description(answer.clone()).await?;
        if let Err(e) = self
            .signaling
            .send_answer(&self.route, self.attempt, answer.clone())
            .await
        {
            warn!(attempt = self.attempt, "Answer not sent, resend will retry: {e}");
        }
        info!(
            conversation_id = %self.route.conversation_id,
            attempt = self.attempt,
            "Answer sent"
        );
        self.spawn_answer_resend(answer);
        Ok(())
    }

    async fn on_answer(&mut self, attempt: u32, description: SessionDescription) -> ControlFlow<()> {
        if self.params.role == Role::Callee {
            debug!(attempt, "Callee ignores inbound answer");
            return ControlFlow::Continue(());
        }
        if attempt != self.attempt {
            debug!(attempt, current = self.attempt, "Answer for another round ignored");
            return ControlFlow::Continue(());
        }
        if self.remote_applied {
            debug!(attempt, "Duplicate answer ignored");
            return ControlFlow::Continue(());
        }

        let link = match self.current_link() {
            Ok(link) => link,
            Err(e) => return self.negotiation_failed(e).await,
        };
        if let Err(e) = link.set_remote_description(description).await {
            return self.negotiation_failed(e).await;
        }
        self.remote_applied = true;
        self.answered = true;
        self.timers.cancel(TimerKind::ResendOffer);
        self.publish_progress();
        self.drain_pending(link.as_ref()).await;

        if self.status() == CallStatus::Ringing {
            self.set_status(CallStatus::Connecting);
        }
        self.arm_connect_timers();
        info!(conversation_id = %self.route.conversation_id, attempt, "Answer applied");
        ControlFlow::Continue(())
    }

    async fn on_remote_candidate(&mut self, attempt: u32, candidate: IceCandidate) {
        if attempt < self.attempt {
            debug!(attempt, current = self.attempt, "Candidate from an older round dropped");
            return;
        }
        if attempt == self.attempt && self.remote_applied {
            if let Ok(link) = self.current_link() {
                apply_candidate(link.as_ref(), candidate).await;
            }
            return;
        }
        self.pending.push(attempt, candidate);
        trace!(attempt, queued = self.pending.len(), "Candidate buffered");
    }

    async fn drain_pending(&mut self, link: &dyn PeerLink) {
        let ready = self.pending.take_ready(self.attempt);
        if !ready.is_empty() {
            debug!(count = ready.len(), attempt = self.attempt, "Applying buffered candidates");
        }
        for candidate in ready {
            apply_candidate(link, candidate).await;
        }
    }

    async fn on_local_candidate(&mut self, generation: u64, candidate: IceCandidate) {
        if Some(generation) != self.active_generation() {
            trace!(generation, "Candidate from a superseded link ignored");
            return;
        }
        if self.attempt == 0 {
            debug!("Local candidate before any offer, not sent");
            return;
        }
        if let Err(e) = self
            .signaling
            .send_candidate(&self.route, self.attempt, candidate)
            .await
        {
            debug!(attempt = self.attempt, "Candidate not sent: {e}");
        }
    }

    async fn on_link_state(&mut self, generation: u64, state: LinkState) -> ControlFlow<()> {
        if Some(generation) != self.active_generation() {
            debug!(generation, ?state, "State change from a superseded link ignored");
            return ControlFlow::Continue(());
        }
        self.link_state = state;
        match state {
            LinkState::Connected => {
                if !self.connected {
                    self.connected = true;
                    self.answered = true;
                    for kind in [
                        TimerKind::Dial,
                        TimerKind::DialTick,
                        TimerKind::ConnectWatchdog,
                        TimerKind::IceGather,
                        TimerKind::ResendOffer,
                        TimerKind::ResendAnswer,
                    ] {
                        self.timers.cancel(kind);
                    }
                    self.publish_progress();
                    self.set_status(CallStatus::Connected);
                }
                ControlFlow::Continue(())
            }
            LinkState::Failed | LinkState::Closed if self.connected => {
                info!(generation, ?state, "Connected link went away");
                self.finish(CallStatus::Ended, None, true).await
            }
            LinkState::Failed => self.negotiation_failed(NegotiationError::LinkFailed).await,
            LinkState::Disconnected => {
                warn!(generation, "Peer link disconnected, waiting for recovery");
                ControlFlow::Continue(())
            }
            LinkState::New | LinkState::Connecting | LinkState::Closed => ControlFlow::Continue(()),
        }
    }

    fn on_remote_track(&mut self, generation: u64, track: TrackInfo) {
        if Some(generation) != self.active_generation() {
            return;
        }
        if self.remote_tracks.iter().any(|t| t.id == track.id) {
            return;
        }
        self.remote_tracks.push(track);
        let tracks = self.remote_tracks.clone();
        self.state.send_modify(|s| s.remote_tracks = tracks.clone());
        self.surfaces.set_remote_stream(Some(MediaStream {
            id: format!("remote-{generation}"),
            tracks,
        }));
    }

    async fn on_timer(&mut self, fired: TimerFired) -> ControlFlow<()> {
        if !self.timers.is_current(&fired) {
            trace!(kind = ?fired.kind, token = fired.token, "Stale timer firing ignored");
            return ControlFlow::Continue(());
        }
        match fired.kind {
            TimerKind::Dial => {
                self.timers.finish(TimerKind::Dial);
                if !self.answered && !self.connected {
                    info!(conversation_id = %self.route.conversation_id, "No answer before dial timeout");
                    return self
                        .finish(CallStatus::Missed, Some(CallFailure::Unanswered), true)
                        .await;
                }
                ControlFlow::Continue(())
            }
            TimerKind::DialTick => {
                if !self.connected {
                    self.state.send_modify(|s| s.dial_seconds += 1);
                }
                ControlFlow::Continue(())
            }
            TimerKind::ConnectWatchdog => {
                self.timers.finish(TimerKind::ConnectWatchdog);
                if self.connected {
                    return ControlFlow::Continue(());
                }
                if self.can_fallback() {
                    warn!(attempt = self.attempt, "Connect watchdog expired, trying relay");
                    self.fallback().await
                } else {
                    warn!(attempt = self.attempt, "Connect watchdog expired");
                    self.finish(CallStatus::Failed, Some(CallFailure::ConnectTimeout), true)
                        .await
                }
            }
            TimerKind::IceGather => {
                self.timers.finish(TimerKind::IceGather);
                let stalled = matches!(self.link_state, LinkState::New | LinkState::Connecting);
                if self.connected || !stalled {
                    return ControlFlow::Continue(());
                }
                if self.can_fallback() {
                    warn!(attempt = self.attempt, "ICE gathering stalled, trying relay");
                    self.fallback().await
                } else {
                    debug!(attempt = self.attempt, "ICE gathering stalled, no relay to fall back to");
                    ControlFlow::Continue(())
                }
            }
            // Resend loops run on their own and never post firings
            TimerKind::ResendOffer | TimerKind::ResendAnswer => ControlFlow::Continue(()),
        }
    }

    async fn negotiation_failed(&mut self, error: NegotiationError) -> ControlFlow<()> {
        warn!(conversation_id = %self.route.conversation_id, attempt = self.attempt, "Negotiation failed: {error}");
        if self.can_fallback() {
            self.fallback().await
        } else {
            self.finish(
                CallStatus::Failed,
                Some(CallFailure::Negotiation(error.to_string())),
                true,
            )
            .await
        }
    }

    fn can_fallback(&self) -> bool {
        self.paths.relay && !self.relay_only
    }

    /// Rebuild on relay-only paths. The caller starts a new offer round, the
    /// callee waits for it.
    async fn fallback(&mut self) -> ControlFlow<()> {
        self.mark_relay_only();
        self.timers.cancel(TimerKind::ResendOffer);
        self.timers.cancel(TimerKind::ResendAnswer);

        if let Err(e) = self.install_link(TransportPolicy::RelayOnly).await {
            return self
                .finish(CallStatus::Failed, Some(CallFailure::Negotiation(e.to_string())), true)
                .await;
        }
        self.pending.clear();
        self.arm_connect_timers();

        if self.params.role == Role::Caller {
            self.attempt += 1;
            self.publish_progress();
            if let Err(e) = self.send_offer().await {
                return self
                    .finish(CallStatus::Failed, Some(CallFailure::Negotiation(e.to_string())), true)
                    .await;
            }
        } else {
            self.publish_progress();
        }
        info!(
            conversation_id = %self.route.conversation_id,
            attempt = self.attempt,
            "Renegotiating on relay-only paths"
        );
        ControlFlow::Continue(())
    }

    /// Build a link of the next generation, wire local tracks into it, then
    /// retire the previous one.
    async fn install_link(&mut self, policy: TransportPolicy) -> Result<(), NegotiationError> {
        self.next_generation += 1;
        let generation = self.next_generation;
        let link = ActiveLink::new(
            self.links
                .create(&self.ice, policy, generation, self.link_events.clone())
                .await?,
        );
        for track in self.media.tracks() {
            link.handle().add_track(Arc::clone(track)).await?;
        }

        let previous = self.link.replace(link);
        self.link_state = LinkState::New;
        self.remote_applied = false;
        if !self.remote_tracks.is_empty() {
            self.remote_tracks.clear();
            self.state.send_modify(|s| s.remote_tracks.clear());
            self.surfaces.set_remote_stream(None);
        }
        if let Some(previous) = previous {
            previous.shutdown().await;
        }
        debug!(generation, ?policy, "Peer link installed");
        Ok(())
    }

    async fn send_offer(&mut self) -> Result<(), NegotiationError> {
        let link = self.current_link()?;
        let offer = link.create_offer().await?;
        link.set_local_description(offer.clone()).await?;
        if let Err(e) = self
            .signaling
            .send_offer(&self.route, self.attempt, offer.clone())
            .await
        {
            warn!(attempt = self.attempt, "Offer not sent, resend will retry: {e}");
        }
        info!(
            conversation_id = %self.route.conversation_id,
            attempt = self.attempt,
            "Offer sent"
        );
        self.spawn_offer_resend(offer);
        Ok(())
    }

    fn resend_policy(&self) -> RetryPolicy {
        RetryPolicy {
            interval: self.config.resend_interval(),
            max_attempts: self.config.max_resend_attempts,
        }
    }

    fn spawn_offer_resend(&mut self, offer: SessionDescription) {
        let attempt = self.attempt;
        let policy = self.resend_policy();
        let progress = self.progress.subscribe();
        let signaling = Arc::clone(&self.signaling);
        let route = self.route.clone();
        self.timers.arm_task(TimerKind::ResendOffer, async move {
            let outcome = retry_until(
                policy,
                || {
                    let p = *progress.borrow();
                    p.settled || p.attempt != attempt || p.remote_applied
                },
                |n| {
                    let signaling = Arc::clone(&signaling);
                    let route = route.clone();
                    let offer = offer.clone();
                    async move {
                        debug!(attempt, resend = n, "Resending offer");
                        if let Err(e) = signaling.send_offer(&route, attempt, offer).await {
                            debug!(attempt, "Offer resend failed: {e}");
                        }
                    }
                },
            )
            .await;
            if let RetryOutcome::Exhausted { attempts } = outcome {
                warn!(conversation_id = %route.conversation_id, attempt, attempts, "Offer resend budget exhausted");
            }
        });
    }

    fn spawn_answer_resend(&mut self, answer: SessionDescription) {
        let attempt = self.attempt;
        let policy = self.resend_policy();
        let progress = self.progress.subscribe();
        let signaling = Arc::clone(&self.signaling);
        let route = self.route.clone();
        self.timers.arm_task(TimerKind::ResendAnswer, async move {
            let outcome = retry_until(
                policy,
                || {
                    let p = *progress.borrow();
                    p.settled || p.attempt != attempt
                },
                |n| {
                    let signaling = Arc::clone(&signaling);
                    let route = route.clone();
                    let answer = answer.clone();
                    async move {
                        debug!(attempt, resend = n, "Resending answer");
                        if let Err(e) = signaling.send_answer(&route, attempt, answer).await {
                            debug!(attempt, "Answer resend failed: {e}");
                        }
                    }
                },
            )
            .await;
            if let RetryOutcome::Exhausted { attempts } = outcome {
                warn!(conversation_id = %route.conversation_id, attempt, attempts, "Answer resend budget exhausted");
            }
        });
    }

    fn arm_connect_timers(&mut self) {
        self.timers
            .arm_once(TimerKind::ConnectWatchdog, self.config.connect_watchdog());
        self.timers
            .arm_once(TimerKind::IceGather, self.config.ice_gather_timeout());
    }

    /// Tear everything down and publish the terminal status.
    async fn finish(
        &mut self,
        status: CallStatus,
        failure: Option<CallFailure>,
        notify_peer: bool,
    ) -> ControlFlow<()> {
        if self.finished {
            return ControlFlow::Break(());
        }
        self.finished = true;
        self.timers.cancel_all();
        self.publish_progress();

        if notify_peer && let Err(e) = self.signaling.send_hangup(&self.route).await {
            debug!("Hangup notice not delivered: {e}");
        }
        if let Some(link) = self.link.take() {
            link.shutdown().await;
        }
        self.media.stop();
        self.surfaces.clear_streams();

        self.state.send_modify(|s| {
            s.status = status;
            if failure.is_some() {
                s.failure = failure;
            }
        });
        info!(
            conversation_id = %self.route.conversation_id,
            status = %status,
            attempt = self.attempt,
            "Call finished"
        );
        ControlFlow::Break(())
    }

    fn mark_relay_only(&mut self) {
        if !self.relay_only {
            self.relay_only = true;
            self.state.send_modify(|s| s.using_relay_only = true);
        }
    }

    fn set_status(&self, status: CallStatus) {
        self.state.send_modify(|s| s.status = status);
        info!(conversation_id = %self.route.conversation_id, status = %status, "Call status changed");
    }

    fn status(&self) -> CallStatus {
        self.state.borrow().status
    }

    fn publish_progress(&self) {
        self.progress.send_replace(Progress {
            attempt: self.attempt,
            remote_applied: self.remote_applied,
            settled: self.connected || self.finished,
        });
    }

    fn active_generation(&self) -> Option<u64> {
        self.link.as_ref().map(ActiveLink::generation)
    }

    fn current_link(&self) -> Result<Arc<dyn PeerLink>, NegotiationError> {
        self.link
            .as_ref()
            .map(ActiveLink::handle)
            .ok_or(NegotiationError::NoLink)
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Timers and resend loops still scheduled.
    pub fn pending_timers(&self) -> usize {
        self.timers.pending()
    }

    pub fn live_tracks(&self) -> usize {
        self.media.live_count()
    }
}

async fn apply_candidate(link: &dyn PeerLink, candidate: IceCandidate) {
    if let Err(e) = link.add_ice_candidate(candidate).await {
        warn!(generation = link.generation(), "Failed to add ICE candidate: {e}");
    }
}
