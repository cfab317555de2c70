//! Local capture: device preflight, tiered constraint retry and owned tracks.
//!
//! Capture hardware sits behind [`MediaDevices`]. [`acquire`] walks the
//! preflight and constraint tiers and hands back a [`LocalMedia`] whose tracks
//! stop when it is dropped.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, info, warn};
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::error::MediaError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallMode {
    Audio,
    Video,
}

impl CallMode {
    pub fn wants_video(self) -> bool {
        matches!(self, Self::Video)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    AudioInput,
    VideoInput,
    AudioOutput,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub id: String,
    pub kind: DeviceKind,
    pub label: String,
}

/// Capture quality tiers, tried in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintTier {
    Relaxed,
    Strict,
    Fallback,
}

impl ConstraintTier {
    pub const ORDER: [ConstraintTier; 3] = [Self::Relaxed, Self::Strict, Self::Fallback];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    pub ideal: u32,
    pub max: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

impl Default for AudioConstraints {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoConstraints {
    /// No video requested.
    Disabled,
    /// Any camera, any format.
    Any,
    Shaped {
        width: Range,
        height: Range,
        frame_rate: Range,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureConstraints {
    pub audio: AudioConstraints,
    pub video: VideoConstraints,
}

impl CaptureConstraints {
    pub fn for_tier(mode: CallMode, tier: ConstraintTier) -> Self {
        let video = if !mode.wants_video() {
            VideoConstraints::Disabled
        } else {
            match tier {
                ConstraintTier::Relaxed => VideoConstraints::Shaped {
                    width: Range { ideal: 640, max: None },
                    height: Range { ideal: 360, max: None },
                    frame_rate: Range { ideal: 24, max: None },
                },
                ConstraintTier::Strict => VideoConstraints::Shaped {
                    width: Range { ideal: 1280, max: Some(1920) },
                    height: Range { ideal: 720, max: Some(1080) },
                    frame_rate: Range { ideal: 30, max: Some(60) },
                },
                ConstraintTier::Fallback => VideoConstraints::Any,
            }
        };
        Self {
            audio: AudioConstraints::default(),
            video,
        }
    }

    /// Unshaped request used once to unlock device enumeration.
    pub fn permission_probe(mode: CallMode) -> Self {
        Self {
            audio: AudioConstraints::default(),
            video: if mode.wants_video() {
                VideoConstraints::Any
            } else {
                VideoConstraints::Disabled
            },
        }
    }
}

/// Failure reported by a capture backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CaptureFailure {
    #[error("no device satisfies the requested constraints")]
    Overconstrained,
    #[error("device is in use")]
    DeviceBusy,
    #[error("permission denied")]
    PermissionDenied,
    #[error("device not found")]
    NotFound,
    #[error("{0}")]
    Other(String),
}

#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Whether the host allows capture at all (TLS origin, sandbox, ...).
    fn secure_context(&self) -> bool;
    fn capture_available(&self) -> bool;
    async fn enumerate(&self) -> Result<Vec<DeviceInfo>, CaptureFailure>;
    async fn capture(&self, constraints: &CaptureConstraints) -> Result<LocalMedia, CaptureFailure>;
}

/// Identity of a track as exposed to render surfaces and the call state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackInfo {
    pub id: String,
    pub kind: MediaKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaStream {
    pub id: String,
    pub tracks: Vec<TrackInfo>,
}

impl MediaStream {
    pub fn has_video(&self) -> bool {
        self.tracks.iter().any(|t| t.kind == MediaKind::Video)
    }
}

/// One live capture track. Shared between the session's `LocalMedia`, the
/// active peer link and the mute/camera toggles.
pub struct LocalTrack {
    id: String,
    kind: MediaKind,
    rtp: Arc<TrackLocalStaticSample>,
    enabled: AtomicBool,
    live: AtomicBool,
}

impl LocalTrack {
    pub fn new(kind: MediaKind, stream_id: &str) -> Self {
        let id = format!("{}-{}", kind_label(kind), uuid::Uuid::new_v4());
        let capability = match kind {
            MediaKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            },
            MediaKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_string(),
                clock_rate: 90000,
                ..Default::default()
            },
        };
        let rtp = Arc::new(TrackLocalStaticSample::new(
            capability,
            id.clone(),
            stream_id.to_string(),
        ));
        Self {
            id,
            kind,
            rtp,
            enabled: AtomicBool::new(true),
            live: AtomicBool::new(true),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn info(&self) -> TrackInfo {
        TrackInfo {
            id: self.id.clone(),
            kind: self.kind,
        }
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    /// Stop capture permanently. Idempotent.
    pub fn stop(&self) {
        if self.live.swap(false, Ordering::AcqRel) {
            debug!(track = %self.id, "Local track stopped");
        }
    }

    /// RTP sink the peer link sends from.
    pub fn rtp_track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.rtp)
    }

    /// Push one encoded frame. Silently skipped while stopped or disabled.
    pub async fn write_sample(&self, data: Bytes, duration: Duration) -> Result<(), webrtc::Error> {
        if !self.is_live() || !self.is_enabled() {
            return Ok(());
        }
        self.rtp
            .write_sample(&Sample {
                data,
                duration,
                ..Default::default()
            })
            .await
    }
}

impl std::fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("enabled", &self.is_enabled())
            .field("live", &self.is_live())
            .finish()
    }
}

fn kind_label(kind: MediaKind) -> &'static str {
    match kind {
        MediaKind::Audio => "audio",
        MediaKind::Video => "video",
    }
}

/// Owned set of capture tracks for one session. Dropping it stops every track.
#[derive(Debug)]
pub struct LocalMedia {
    stream_id: String,
    tracks: Vec<Arc<LocalTrack>>,
}

impl LocalMedia {
    pub fn new(stream_id: impl Into<String>, tracks: Vec<Arc<LocalTrack>>) -> Self {
        Self {
            stream_id: stream_id.into(),
            tracks,
        }
    }

    pub fn tracks(&self) -> &[Arc<LocalTrack>] {
        &self.tracks
    }

    pub fn has_video(&self) -> bool {
        self.tracks.iter().any(|t| t.kind() == MediaKind::Video)
    }

    pub fn stream(&self) -> MediaStream {
        MediaStream {
            id: self.stream_id.clone(),
            tracks: self.tracks.iter().map(|t| t.info()).collect(),
        }
    }

    pub fn set_kind_enabled(&self, kind: MediaKind, enabled: bool) {
        for track in self.tracks.iter().filter(|t| t.kind() == kind) {
            track.set_enabled(enabled);
        }
    }

    pub fn live_count(&self) -> usize {
        self.tracks.iter().filter(|t| t.is_live()).count()
    }

    pub fn stop(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

impl Drop for LocalMedia {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Obtain local capture for `mode`.
///
/// Order: preflight, enumeration (with one permission-unlocking capture when
/// nothing is enumerable), then the constraint tiers. Only "overconstrained"
/// advances to the next tier; every other capture failure aborts.
pub async fn acquire(devices: &dyn MediaDevices, mode: CallMode) -> Result<LocalMedia, MediaError> {
    if !devices.secure_context() {
        return Err(MediaError::InsecureContext);
    }
    if !devices.capture_available() {
        return Err(MediaError::ApiUnavailable);
    }

    let mut inputs = devices.enumerate().await.map_err(enumerate_error)?;
    if !inputs.iter().any(is_input) {
        debug!("No enumerable inputs, requesting a throwaway capture");
        match devices.capture(&CaptureConstraints::permission_probe(mode)).await {
            // Dropped immediately: its only job is to unlock enumeration.
            Ok(probe) => drop(probe),
            Err(CaptureFailure::PermissionDenied) => return Err(MediaError::PermissionDenied),
            Err(CaptureFailure::NotFound) => return Err(MediaError::NoMicrophone),
            Err(e) => return Err(MediaError::CaptureFailed(e.to_string())),
        }
        inputs = devices.enumerate().await.map_err(enumerate_error)?;
    }

    if !inputs.iter().any(|d| d.kind == DeviceKind::AudioInput) {
        return Err(MediaError::NoMicrophone);
    }
    if mode.wants_video() && !inputs.iter().any(|d| d.kind == DeviceKind::VideoInput) {
        return Err(MediaError::NoCamera);
    }

    for tier in ConstraintTier::ORDER {
        let constraints = CaptureConstraints::for_tier(mode, tier);
        match devices.capture(&constraints).await {
            Ok(media) => {
                info!(?tier, tracks = media.tracks().len(), "Local media acquired");
                return Ok(media);
            }
            Err(CaptureFailure::Overconstrained) => {
                warn!(?tier, "Capture overconstrained, relaxing");
            }
            Err(CaptureFailure::DeviceBusy) => return Err(MediaError::DeviceBusy),
            Err(CaptureFailure::PermissionDenied) => return Err(MediaError::PermissionDenied),
            Err(CaptureFailure::NotFound) => return Err(MediaError::DeviceNotFound),
            Err(CaptureFailure::Other(detail)) => return Err(MediaError::CaptureFailed(detail)),
        }
    }
    Err(MediaError::UnsatisfiableConstraints)
}

fn is_input(device: &DeviceInfo) -> bool {
    matches!(device.kind, DeviceKind::AudioInput | DeviceKind::VideoInput)
}

fn enumerate_error(failure: CaptureFailure) -> MediaError {
    match failure {
        CaptureFailure::PermissionDenied => MediaError::PermissionDenied,
        other => MediaError::CaptureFailed(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MockDevices;

    #[tokio::test]
    async fn insecure_context_fails_before_touching_devices() {
        let devices = MockDevices::new();
        devices.set_secure(false);
        let err = acquire(&devices, CallMode::Video).await.unwrap_err();
        assert_eq!(err, MediaError::InsecureContext);
        assert_eq!(devices.capture_calls(), 0);
    }

    #[tokio::test]
    async fn missing_api_is_reported() {
        let devices = MockDevices::new();
        devices.set_api_available(false);
        let err = acquire(&devices, CallMode::Audio).await.unwrap_err();
        assert_eq!(err.reason(), "api-unavailable");
    }

    #[tokio::test]
    async fn audio_mode_needs_only_a_microphone() {
        let devices = MockDevices::with_inputs(&[DeviceKind::AudioInput]);
        let media = acquire(&devices, CallMode::Audio).await.unwrap();
        assert!(!media.has_video());
        assert_eq!(media.live_count(), 1);
        assert_eq!(devices.tiers(), vec![CaptureConstraints::for_tier(CallMode::Audio, ConstraintTier::Relaxed)]);
    }

    #[tokio::test]
    async fn video_mode_without_camera_is_no_camera() {
        let devices = MockDevices::with_inputs(&[DeviceKind::AudioInput]);
        let err = acquire(&devices, CallMode::Video).await.unwrap_err();
        assert_eq!(err, MediaError::NoCamera);
    }

    #[tokio::test]
    async fn no_microphone_is_reported_first() {
        let devices = MockDevices::with_inputs(&[DeviceKind::VideoInput]);
        let err = acquire(&devices, CallMode::Video).await.unwrap_err();
        assert_eq!(err, MediaError::NoMicrophone);
    }

    #[tokio::test]
    async fn empty_enumeration_triggers_throwaway_capture() {
        let devices = MockDevices::with_inputs(&[]);
        devices.reveal_after_permission(&[DeviceKind::AudioInput, DeviceKind::VideoInput]);

        let media = acquire(&devices, CallMode::Video).await.unwrap();
        assert!(media.has_video());

        let captured = devices.captured_tracks();
        // Throwaway audio+video, then the relaxed tier's audio+video
        assert_eq!(captured.len(), 4);
        assert!(!captured[0].is_live());
        assert!(!captured[1].is_live());
        assert_eq!(media.live_count(), 2);
    }

    #[tokio::test]
    async fn throwaway_permission_denied() {
        let devices = MockDevices::with_inputs(&[]);
        devices.fail_next(CaptureFailure::PermissionDenied);
        let err = acquire(&devices, CallMode::Audio).await.unwrap_err();
        assert_eq!(err, MediaError::PermissionDenied);
    }

    #[tokio::test]
    async fn overconstrained_tiers_fall_back() {
        let devices = MockDevices::with_inputs(&[DeviceKind::AudioInput, DeviceKind::VideoInput]);
        devices.fail_next(CaptureFailure::Overconstrained);
        devices.fail_next(CaptureFailure::Overconstrained);

        let media = acquire(&devices, CallMode::Video).await.unwrap();
        assert_eq!(media.live_count(), 2);
        let tiers = devices.tiers();
        assert_eq!(tiers.len(), 3);
        assert_eq!(tiers[2].video, VideoConstraints::Any);
        assert!(tiers.iter().all(|c| c.audio == AudioConstraints::default()));
    }

    #[tokio::test]
    async fn all_tiers_overconstrained_is_unsatisfiable() {
        let devices = MockDevices::with_inputs(&[DeviceKind::AudioInput, DeviceKind::VideoInput]);
        for _ in 0..3 {
            devices.fail_next(CaptureFailure::Overconstrained);
        }
        let err = acquire(&devices, CallMode::Video).await.unwrap_err();
        assert_eq!(err, MediaError::UnsatisfiableConstraints);
    }

    #[tokio::test]
    async fn busy_device_aborts_without_trying_later_tiers() {
        let devices = MockDevices::with_inputs(&[DeviceKind::AudioInput, DeviceKind::VideoInput]);
        devices.fail_next(CaptureFailure::DeviceBusy);
        let err = acquire(&devices, CallMode::Video).await.unwrap_err();
        assert_eq!(err, MediaError::DeviceBusy);
        assert_eq!(devices.capture_calls(), 1);
    }

    #[tokio::test]
    async fn other_failures_map_to_capture_failed() {
        let devices = MockDevices::with_inputs(&[DeviceKind::AudioInput]);
        devices.fail_next(CaptureFailure::NotFound);
        assert_eq!(
            acquire(&devices, CallMode::Audio).await.unwrap_err(),
            MediaError::DeviceNotFound
        );

        devices.fail_next(CaptureFailure::Other("driver crashed".to_string()));
        assert_eq!(
            acquire(&devices, CallMode::Audio).await.unwrap_err().reason(),
            "capture-failed"
        );
    }

    #[test]
    fn strict_tier_caps_resolution() {
        let c = CaptureConstraints::for_tier(CallMode::Video, ConstraintTier::Strict);
        match c.video {
            VideoConstraints::Shaped { width, height, frame_rate } => {
                assert_eq!(width, Range { ideal: 1280, max: Some(1920) });
                assert_eq!(height, Range { ideal: 720, max: Some(1080) });
                assert_eq!(frame_rate, Range { ideal: 30, max: Some(60) });
            }
            other => panic!("Expected shaped video, got {other:?}"),
        }
        assert_eq!(
            CaptureConstraints::for_tier(CallMode::Audio, ConstraintTier::Strict).video,
            VideoConstraints::Disabled
        );
    }

    #[test]
    fn dropping_local_media_stops_tracks() {
        let track = Arc::new(LocalTrack::new(MediaKind::Audio, "s"));
        let media = LocalMedia::new("s", vec![Arc::clone(&track)]);
        assert!(track.is_live());
        drop(media);
        assert!(!track.is_live());
    }

    #[test]
    fn kind_toggle_only_touches_that_kind() {
        let audio = Arc::new(LocalTrack::new(MediaKind::Audio, "s"));
        let video = Arc::new(LocalTrack::new(MediaKind::Video, "s"));
        let media = LocalMedia::new("s", vec![Arc::clone(&audio), Arc::clone(&video)]);
        media.set_kind_enabled(MediaKind::Audio, false);
        assert!(!audio.is_enabled());
        assert!(video.is_enabled());
        assert_eq!(media.stream().tracks.len(), 2);
    }
}
