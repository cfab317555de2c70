//! In-process doubles for the engine's seams.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use careline_protocol::{IceCandidate, IceConfig, SessionDescription};

use crate::error::NegotiationError;
use crate::link::{LinkEvent, LinkEventKind, LinkEventSender, LinkFactory, LinkState, PeerLink, TransportPolicy};
use crate::media::{
    CaptureConstraints, CaptureFailure, DeviceInfo, DeviceKind, LocalMedia, LocalTrack, MediaDevices, MediaKind,
    MediaStream, VideoConstraints,
};
use crate::probe::PathProber;
use crate::surface::{AttachOptions, MediaSurface, PlaybackError};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Audio and video tracks, live.
pub fn test_media() -> LocalMedia {
    LocalMedia::new(
        "local",
        vec![
            Arc::new(LocalTrack::new(MediaKind::Audio, "local")),
            Arc::new(LocalTrack::new(MediaKind::Video, "local")),
        ],
    )
}

// -- Devices --

struct DevicesInner {
    secure: bool,
    api: bool,
    inputs: Vec<DeviceKind>,
    revealed: Option<Vec<DeviceKind>>,
    failures: VecDeque<CaptureFailure>,
    calls: Vec<CaptureConstraints>,
    tracks: Vec<Arc<LocalTrack>>,
}

pub struct MockDevices {
    inner: Mutex<DevicesInner>,
}

impl MockDevices {
    /// Secure host with a microphone and a camera.
    pub fn new() -> Self {
        Self::with_inputs(&[DeviceKind::AudioInput, DeviceKind::VideoInput])
    }

    pub fn with_inputs(inputs: &[DeviceKind]) -> Self {
        Self {
            inner: Mutex::new(DevicesInner {
                secure: true,
                api: true,
                inputs: inputs.to_vec(),
                revealed: None,
                failures: VecDeque::new(),
                calls: Vec::new(),
                tracks: Vec::new(),
            }),
        }
    }

    pub fn set_secure(&self, secure: bool) {
        lock(&self.inner).secure = secure;
    }

    pub fn set_api_available(&self, available: bool) {
        lock(&self.inner).api = available;
    }

    /// Devices that become enumerable after the first successful capture.
    pub fn reveal_after_permission(&self, inputs: &[DeviceKind]) {
        lock(&self.inner).revealed = Some(inputs.to_vec());
    }

    /// Queue a failure for the next capture call.
    pub fn fail_next(&self, failure: CaptureFailure) {
        lock(&self.inner).failures.push_back(failure);
    }

    pub fn capture_calls(&self) -> usize {
        lock(&self.inner).calls.len()
    }

    /// Constraints of every capture call, in order.
    pub fn tiers(&self) -> Vec<CaptureConstraints> {
        lock(&self.inner).calls.clone()
    }

    /// Every track handed out, including throwaway ones.
    pub fn captured_tracks(&self) -> Vec<Arc<LocalTrack>> {
        lock(&self.inner).tracks.clone()
    }
}

#[async_trait]
impl MediaDevices for MockDevices {
    fn secure_context(&self) -> bool {
        lock(&self.inner).secure
    }

    fn capture_available(&self) -> bool {
        lock(&self.inner).api
    }

    async fn enumerate(&self) -> Result<Vec<DeviceInfo>, CaptureFailure> {
        let inner = lock(&self.inner);
        Ok(inner
            .inputs
            .iter()
            .enumerate()
            .map(|(i, kind)| DeviceInfo {
                id: format!("device-{i}"),
                kind: *kind,
                label: String::new(),
            })
            .collect())
    }

    async fn capture(&self, constraints: &CaptureConstraints) -> Result<LocalMedia, CaptureFailure> {
        let mut inner = lock(&self.inner);
        inner.calls.push(*constraints);
        if let Some(failure) = inner.failures.pop_front() {
            return Err(failure);
        }
        if let Some(revealed) = inner.revealed.take() {
            inner.inputs = revealed;
        }

        let stream_id = format!("capture-{}", inner.calls.len());
        let mut tracks = vec![Arc::new(LocalTrack::new(MediaKind::Audio, &stream_id))];
        if constraints.video != VideoConstraints::Disabled {
            tracks.push(Arc::new(LocalTrack::new(MediaKind::Video, &stream_id)));
        }
        inner.tracks.extend(tracks.iter().cloned());
        Ok(LocalMedia::new(stream_id, tracks))
    }
}

// -- Prober --

pub struct MockProber {
    direct: bool,
    relay: bool,
    delay: Duration,
    direct_calls: AtomicUsize,
    relay_calls: AtomicUsize,
}

impl MockProber {
    pub fn new(direct: bool, relay: bool) -> Self {
        Self {
            direct,
            relay,
            delay: Duration::ZERO,
            direct_calls: AtomicUsize::new(0),
            relay_calls: AtomicUsize::new(0),
        }
    }

    /// Each probe takes `delay` before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn direct_calls(&self) -> usize {
        self.direct_calls.load(Ordering::SeqCst)
    }

    pub fn relay_calls(&self) -> usize {
        self.relay_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PathProber for MockProber {
    async fn probe_direct(&self, _ice: &IceConfig) -> bool {
        self.direct_calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.direct
    }

    async fn probe_relay(&self, _ice: &IceConfig) -> bool {
        self.relay_calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.relay
    }
}

// -- Links --

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectRule {
    Always,
    Never,
    RelayOnly,
}

struct FactoryInner {
    connect: ConnectRule,
    fail_remote: bool,
    links: Vec<Arc<MockLink>>,
}

/// Builds [`MockLink`]s and remembers them. Cloning shares the record.
#[derive(Clone)]
pub struct MockLinkFactory {
    inner: Arc<Mutex<FactoryInner>>,
    answers: Arc<AtomicUsize>,
}

impl MockLinkFactory {
    fn with_rule(connect: ConnectRule) -> Self {
        Self {
            inner: Arc::new(Mutex::new(FactoryInner {
                connect,
                fail_remote: false,
                links: Vec::new(),
            })),
            answers: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Links connect once both descriptions are set.
    pub fn new() -> Self {
        Self::with_rule(ConnectRule::Always)
    }

    /// Links stop at `connecting`.
    pub fn never_connect() -> Self {
        Self::with_rule(ConnectRule::Never)
    }

    /// Only relay-only links connect.
    pub fn connect_only_relay() -> Self {
        Self::with_rule(ConnectRule::RelayOnly)
    }

    /// Every remote description is rejected.
    pub fn fail_remote_descriptions(self) -> Self {
        lock(&self.inner).fail_remote = true;
        self
    }

    pub fn links(&self) -> Vec<Arc<MockLink>> {
        lock(&self.inner).links.clone()
    }

    pub fn link(&self, index: usize) -> Arc<MockLink> {
        Arc::clone(&lock(&self.inner).links[index])
    }

    pub fn last(&self) -> Arc<MockLink> {
        let inner = lock(&self.inner);
        Arc::clone(inner.links.last().expect("no link created"))
    }

    pub fn policies(&self) -> Vec<TransportPolicy> {
        lock(&self.inner).links.iter().map(|l| l.policy).collect()
    }

    pub fn answers_created(&self) -> usize {
        self.answers.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LinkFactory for MockLinkFactory {
    async fn create(
        &self,
        _ice: &IceConfig,
        policy: TransportPolicy,
        generation: u64,
        events: LinkEventSender,
    ) -> Result<Arc<dyn PeerLink>, NegotiationError> {
        let mut inner = lock(&self.inner);
        let connects = match inner.connect {
            ConnectRule::Always => true,
            ConnectRule::Never => false,
            ConnectRule::RelayOnly => policy == TransportPolicy::RelayOnly,
        };
        let link = Arc::new(MockLink {
            generation,
            policy,
            connects,
            fail_remote: inner.fail_remote,
            events,
            answers: Arc::clone(&self.answers),
            state: Mutex::new(LinkRecord::default()),
        });
        inner.links.push(Arc::clone(&link));
        Ok(link)
    }
}

#[derive(Default)]
struct LinkRecord {
    log: Vec<String>,
    tracks: usize,
    local: bool,
    remote: bool,
    started: bool,
    closed: bool,
    offers: usize,
}

/// Scripted link. Emits one host candidate per local description and reports
/// connecting/connected once both descriptions are in place.
pub struct MockLink {
    generation: u64,
    policy: TransportPolicy,
    connects: bool,
    fail_remote: bool,
    events: LinkEventSender,
    answers: Arc<AtomicUsize>,
    state: Mutex<LinkRecord>,
}

impl MockLink {
    /// Descriptions and candidates applied, in order.
    pub fn log(&self) -> Vec<String> {
        lock(&self.state).log.clone()
    }

    pub fn tracks(&self) -> usize {
        lock(&self.state).tracks
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }

    fn emit(&self, kind: LinkEventKind) {
        let _ = self.events.send(LinkEvent {
            generation: self.generation,
            kind,
        });
    }

    fn maybe_connect(&self) {
        let start = {
            let mut record = lock(&self.state);
            let ready = record.local && record.remote && !record.started && !record.closed;
            if ready {
                record.started = true;
            }
            ready
        };
        if start {
            self.emit(LinkEventKind::StateChanged(LinkState::Connecting));
            if self.connects {
                self.emit(LinkEventKind::StateChanged(LinkState::Connected));
            }
        }
    }
}

#[async_trait]
impl PeerLink for MockLink {
    fn generation(&self) -> u64 {
        self.generation
    }

    fn policy(&self) -> TransportPolicy {
        self.policy
    }

    async fn add_track(&self, _track: Arc<LocalTrack>) -> Result<(), NegotiationError> {
        lock(&self.state).tracks += 1;
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
        let mut record = lock(&self.state);
        record.offers += 1;
        Ok(SessionDescription::offer(format!(
            "offer-g{}-{}",
            self.generation, record.offers
        )))
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        let n = self.answers.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(SessionDescription::answer(format!("answer-g{}-{n}", self.generation)))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), NegotiationError> {
        {
            let mut record = lock(&self.state);
            record.log.push(format!("local:{}", description.sdp));
            record.local = true;
        }
        self.emit(LinkEventKind::LocalCandidate(IceCandidate::new(format!(
            "candidate:{g} 1 udp 1 10.0.0.{g} 9 typ host",
            g = self.generation
        ))));
        self.maybe_connect();
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), NegotiationError> {
        if self.fail_remote {
            return Err(webrtc::Error::ErrSessionDescriptionNoFingerprint.into());
        }
        {
            let mut record = lock(&self.state);
            record.log.push(format!("remote:{}", description.sdp));
            record.remote = true;
        }
        self.maybe_connect();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        let mut record = lock(&self.state);
        if !record.remote {
            return Err(webrtc::Error::ErrNoRemoteDescription.into());
        }
        record.log.push(candidate.candidate);
        Ok(())
    }

    async fn close(&self) {
        let first = {
            let mut record = lock(&self.state);
            !std::mem::replace(&mut record.closed, true)
        };
        if first {
            self.emit(LinkEventKind::StateChanged(LinkState::Closed));
        }
    }
}

// -- Surfaces --

#[derive(Default)]
struct SurfaceRecord {
    refusals_left: u32,
    play_calls: u32,
    last_attach: Option<(Option<MediaStream>, AttachOptions)>,
}

pub struct MockSurface {
    record: Mutex<SurfaceRecord>,
}

impl MockSurface {
    /// Refuses the first `n` play calls.
    pub fn refusing(n: u32) -> Self {
        Self {
            record: Mutex::new(SurfaceRecord {
                refusals_left: n,
                ..Default::default()
            }),
        }
    }

    pub fn play_calls(&self) -> u32 {
        lock(&self.record).play_calls
    }

    pub fn last_attach(&self) -> Option<(Option<MediaStream>, AttachOptions)> {
        lock(&self.record).last_attach.clone()
    }
}

#[async_trait]
impl MediaSurface for MockSurface {
    fn attach(&self, stream: Option<&MediaStream>, options: AttachOptions) {
        lock(&self.record).last_attach = Some((stream.cloned(), options));
    }

    async fn play(&self) -> Result<(), PlaybackError> {
        let mut record = lock(&self.record);
        record.play_calls += 1;
        if record.refusals_left > 0 {
            record.refusals_left -= 1;
            return Err(PlaybackError("not allowed".to_string()));
        }
        Ok(())
    }
}
