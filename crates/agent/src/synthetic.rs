//! Capture backend for headless hosts: a silent microphone and an idle camera.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use careline_engine::media::{CaptureConstraints, CaptureFailure, DeviceInfo, DeviceKind, VideoConstraints};
use careline_engine::{LocalMedia, LocalTrack, MediaDevices, MediaKind};
use tracing::{debug, trace};

/// One 20 ms Opus frame of silence.
const OPUS_SILENCE: [u8; 3] = [0xF8, 0xFF, 0xFE];
const FRAME: Duration = Duration::from_millis(20);

pub(crate) struct SyntheticDevices;

#[async_trait]
impl MediaDevices for SyntheticDevices {
    fn secure_context(&self) -> bool {
        true
    }

    fn capture_available(&self) -> bool {
        true
    }

    async fn enumerate(&self) -> Result<Vec<DeviceInfo>, CaptureFailure> {
        Ok(vec![
            DeviceInfo {
                id: "synthetic-mic".to_string(),
                kind: DeviceKind::AudioInput,
                label: "Silence".to_string(),
            },
            DeviceInfo {
                id: "synthetic-cam".to_string(),
                kind: DeviceKind::VideoInput,
                label: "Idle camera".to_string(),
            },
        ])
    }

    async fn capture(&self, constraints: &CaptureConstraints) -> Result<LocalMedia, CaptureFailure> {
        let stream_id = "careline-agent";
        let audio = Arc::new(LocalTrack::new(MediaKind::Audio, stream_id));
        tokio::spawn(pump_silence(Arc::clone(&audio)));

        let mut tracks = vec![audio];
        if constraints.video != VideoConstraints::Disabled {
            tracks.push(Arc::new(LocalTrack::new(MediaKind::Video, stream_id)));
        }
        debug!(tracks = tracks.len(), "Synthetic capture started");
        Ok(LocalMedia::new(stream_id, tracks))
    }
}

/// Feed silence until the track is stopped. Muted tracks send nothing.
async fn pump_silence(track: Arc<LocalTrack>) {
    let mut ticker = tokio::time::interval(FRAME);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    while track.is_live() {
        ticker.tick().await;
        if !track.is_enabled() {
            continue;
        }
        if let Err(e) = track
            .write_sample(Bytes::from_static(&OPUS_SILENCE), FRAME)
            .await
        {
            trace!(track = track.id(), "Silence frame not written: {e}");
        }
    }
    debug!(track = track.id(), "Silence pump stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use careline_engine::media::{ConstraintTier, acquire};
    use careline_engine::CallMode;

    #[tokio::test(start_paused = true)]
    async fn audio_call_gets_one_live_track() {
        let media = acquire(&SyntheticDevices, CallMode::Audio).await.unwrap();
        assert_eq!(media.live_count(), 1);
        assert!(!media.has_video());
    }

    #[tokio::test(start_paused = true)]
    async fn pump_ends_when_track_stops() {
        let constraints = CaptureConstraints::for_tier(CallMode::Video, ConstraintTier::Relaxed);
        let media = SyntheticDevices.capture(&constraints).await.unwrap();
        assert!(media.has_video());
        let audio = Arc::clone(&media.tracks()[0]);

        tokio::time::sleep(Duration::from_millis(100)).await;
        drop(media);
        assert!(!audio.is_live());
        tokio::time::sleep(Duration::from_millis(100)).await;
        // Pump task released its handle
        assert_eq!(Arc::strong_count(&audio), 1);
    }
}
