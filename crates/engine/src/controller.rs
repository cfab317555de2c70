//! Public per-call API. One controller drives at most one live session.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use careline_protocol::CallConfig;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{CallError, CallFailure};
use crate::link::LinkFactory;
use crate::media::{LocalTrack, MediaDevices, MediaKind, acquire};
use crate::negotiator::{Inbound, Negotiator, NegotiatorSetup, SessionEvent, SessionParams};
use crate::probe::{PathPlan, PathProber, probe_paths};
use crate::signaling::{Route, SignalingTransport};
use crate::state::{CallState, CallStatus};
use crate::surface::{MediaSurface, SurfaceBindings};

/// Everything a session is built from.
#[derive(Clone)]
pub struct CallDeps {
    pub signaling: Arc<dyn SignalingTransport>,
    pub devices: Arc<dyn MediaDevices>,
    pub prober: Arc<dyn PathProber>,
    pub links: Arc<dyn LinkFactory>,
    pub config: CallConfig,
}

enum Slot {
    Closed,
    Opening {
        cancel: watch::Sender<bool>,
        /// Closed once `open` has released everything it acquired.
        unwound: oneshot::Receiver<()>,
    },
    Running {
        inbox: mpsc::UnboundedSender<SessionEvent>,
        task: JoinHandle<()>,
        tracks: Vec<Arc<LocalTrack>>,
    },
}

/// A negotiator that has started but is not yet running on its own task.
struct Established {
    negotiator: Negotiator,
    inbound: Inbound,
    inbox: mpsc::UnboundedSender<SessionEvent>,
    tracks: Vec<Arc<LocalTrack>>,
}

pub struct CallController {
    deps: CallDeps,
    state: Arc<watch::Sender<CallState>>,
    surfaces: Arc<SurfaceBindings>,
    slot: Mutex<Slot>,
}

impl CallController {
    pub fn new(deps: CallDeps) -> Self {
        let (state, _) = watch::channel(CallState::default());
        Self {
            deps,
            state: Arc::new(state),
            surfaces: Arc::new(SurfaceBindings::default()),
            slot: Mutex::new(Slot::Closed),
        }
    }

    /// Acquire media, probe paths and start negotiating. Returns once the
    /// session runs on its own task; progress is then visible via
    /// [`subscribe`](Self::subscribe).
    pub async fn open(&self, params: SessionParams) -> Result<(), CallError> {
        // Declared first so it drops after every other local of this call
        let (mut cancel, _unwound) = {
            let mut slot = self.lock_slot();
            match &*slot {
                Slot::Closed => {}
                Slot::Running { task, .. } if task.is_finished() => {}
                _ => return Err(CallError::AlreadyOpen),
            }
            let (tx, rx) = watch::channel(false);
            let (unwound_tx, unwound_rx) = oneshot::channel::<()>();
            *slot = Slot::Opening {
                cancel: tx,
                unwound: unwound_rx,
            };
            (rx, unwound_tx)
        };

        let route = params.route();
        info!(
            conversation_id = %params.conversation_id,
            role = ?params.role,
            mode = ?params.mode,
            "Opening call"
        );

        let established = match self.establish(params, &mut cancel).await {
            Ok(established) => established,
            Err(e) => {
                {
                    let mut slot = self.lock_slot();
                    if matches!(*slot, Slot::Opening { .. }) && !*cancel.borrow() {
                        *slot = Slot::Closed;
                    }
                }
                if matches!(e, CallError::Cancelled) {
                    self.notify_hangup(&route).await;
                }
                warn!(conversation_id = %route.conversation_id, "Call did not open: {e}");
                return Err(e);
            }
        };

        let Established {
            mut negotiator,
            inbound,
            inbox,
            tracks,
        } = established;
        {
            let mut slot = self.lock_slot();
            let cancelled = *cancel.borrow() || !matches!(*slot, Slot::Opening { .. });
            if !cancelled {
                *slot = Slot::Running {
                    inbox,
                    task: tokio::spawn(negotiator.run(inbound)),
                    tracks,
                };
                return Ok(());
            }
        }

        info!(conversation_id = %route.conversation_id, "Call closed while opening");
        let _ = negotiator
            .handle(SessionEvent::CloseRequested { notify_peer: true })
            .await;
        drop(inbound);
        Err(CallError::Cancelled)
    }

    async fn establish(
        &self,
        params: SessionParams,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<Established, CallError> {
        if self.state.borrow().net_offline {
            self.state.send_modify(|s| {
                s.reset_for_open(CallStatus::Failed);
                s.failure = Some(CallFailure::Offline);
            });
            return Err(CallError::Offline);
        }
        self.state
            .send_modify(|s| s.reset_for_open(params.initial_status()));

        let route = params.route();
        let signaling = Arc::clone(&self.deps.signaling);

        let subscription = match step(cancel, signaling.subscribe(&params.local_id)).await? {
            Ok(subscription) => subscription,
            Err(e) => {
                self.fail(CallFailure::Signaling(e.to_string()));
                return Err(e.into());
            }
        };

        let media = match step(cancel, acquire(self.deps.devices.as_ref(), params.mode)).await? {
            Ok(media) => media,
            Err(e) => {
                warn!(conversation_id = %route.conversation_id, reason = e.reason(), "Media acquisition failed");
                self.state.send_modify(|s| {
                    s.status = CallStatus::Failed;
                    s.media_error = Some(e.clone());
                    s.failure = Some(CallFailure::Media(e.clone()));
                });
                self.notify_hangup(&route).await;
                return Err(e.into());
            }
        };
        {
            let state = self.state.borrow();
            media.set_kind_enabled(MediaKind::Audio, !state.muted);
            media.set_kind_enabled(MediaKind::Video, !state.camera_off);
        }
        self.surfaces.set_local_stream(Some(media.stream()));

        let ice = self.deps.config.ice.clone();
        let paths = step(cancel, probe_paths(self.deps.prober.as_ref(), &ice)).await?;
        self.state.send_modify(|s| {
            s.stun_ok = paths.direct;
            s.turn_ok = paths.relay;
        });
        let relay_only = match paths.plan() {
            Some(PathPlan::Direct) => false,
            Some(PathPlan::RelayOnly) => {
                info!(conversation_id = %route.conversation_id, "No direct path, starting relay-only");
                self.state.send_modify(|s| s.using_relay_only = true);
                true
            }
            None => {
                drop(media);
                self.surfaces.clear_streams();
                self.fail(CallFailure::NoNetworkPath);
                self.notify_hangup(&route).await;
                return Err(CallError::NoNetworkPath);
            }
        };

        let tracks = media.tracks().to_vec();
        let (inbox, events) = mpsc::unbounded_channel();
        let (mut negotiator, inbound) = Negotiator::new(
            NegotiatorSetup {
                params,
                ice,
                timers: self.deps.config.timers.clone(),
                paths,
                relay_only,
                media,
                signaling,
                links: Arc::clone(&self.deps.links),
                state: Arc::clone(&self.state),
                surfaces: Arc::clone(&self.surfaces),
            },
            events,
            subscription,
        );
        negotiator.start().await?;

        Ok(Established {
            negotiator,
            inbound,
            inbox,
            tracks,
        })
    }

    /// Tear the session down. Sends a hangup unless the session already ended.
    /// An `open` in flight is cancelled and waited for, so its capture and
    /// subscription are gone when this returns.
    pub async fn close(&self) {
        let previous = std::mem::replace(&mut *self.lock_slot(), Slot::Closed);
        match previous {
            Slot::Closed => {}
            Slot::Opening { cancel, unwound } => {
                debug!("Cancelling call setup");
                let _ = cancel.send(true);
                // Resolves with an error once `open` drops its guard
                let _ = unwound.await;
                self.state.send_modify(|s| {
                    if !s.status.is_terminal() {
                        s.status = CallStatus::Ended;
                    }
                });
            }
            Slot::Running { inbox, task, .. } => {
                let _ = inbox.send(SessionEvent::CloseRequested { notify_peer: true });
                if let Err(e) = task.await {
                    warn!("Session task ended abnormally: {e}");
                }
            }
        }
    }

    pub async fn hangup(&self) {
        self.close().await;
    }

    pub fn set_muted(&self, muted: bool) {
        self.state.send_modify(|s| s.muted = muted);
        self.toggle_kind(MediaKind::Audio, !muted);
    }

    pub fn set_camera_off(&self, off: bool) {
        self.state.send_modify(|s| s.camera_off = off);
        self.toggle_kind(MediaKind::Video, !off);
    }

    /// Connectivity hint from the host. Only gates `open`; a live session is
    /// left to its own timers.
    pub fn set_network_online(&self, online: bool) {
        let changed = self.state.send_if_modified(|s| {
            let was = s.net_offline;
            s.net_offline = !online;
            was != s.net_offline
        });
        if changed {
            info!(online, "Network reachability changed");
        }
    }

    pub fn bind_local_video(&self, surface: Arc<dyn MediaSurface>) {
        self.surfaces.bind_local_video(surface);
    }

    pub fn bind_remote_video(&self, surface: Arc<dyn MediaSurface>) {
        self.surfaces.bind_remote_video(surface);
    }

    pub fn bind_remote_audio(&self, surface: Arc<dyn MediaSurface>) {
        self.surfaces.bind_remote_audio(surface);
    }

    pub fn state(&self) -> CallState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<CallState> {
        self.state.subscribe()
    }

    /// A session is opening or still running.
    pub fn is_active(&self) -> bool {
        match &*self.lock_slot() {
            Slot::Closed => false,
            Slot::Opening { .. } => true,
            Slot::Running { task, .. } => !task.is_finished(),
        }
    }

    fn toggle_kind(&self, kind: MediaKind, enabled: bool) {
        if let Slot::Running { tracks, .. } = &*self.lock_slot() {
            for track in tracks.iter().filter(|t| t.kind() == kind) {
                track.set_enabled(enabled);
            }
        }
    }

    fn fail(&self, failure: CallFailure) {
        self.state.send_modify(|s| {
            s.status = CallStatus::Failed;
            s.failure = Some(failure);
        });
    }

    async fn notify_hangup(&self, route: &Route) {
        if let Err(e) = self.deps.signaling.send_hangup(route).await {
            debug!("Hangup notice not delivered: {e}");
        }
    }

    fn lock_slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Run `fut` unless the open is cancelled first.
async fn step<T>(cancel: &mut watch::Receiver<bool>, fut: impl Future<Output = T>) -> Result<T, CallError> {
    tokio::select! {
        biased;
        _ = cancelled(cancel) => Err(CallError::Cancelled),
        value = fut => Ok(value),
    }
}

async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    let _ = cancel.wait_for(|c| *c).await;
}
