use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::media::MediaStream;

pub const PLAY_ATTEMPTS: u32 = 8;
pub const PLAY_RETRY_GAP: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AttachOptions {
    pub muted: bool,
    pub mirror: bool,
    pub autoplay: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("playback refused: {0}")]
pub struct PlaybackError(pub String);

/// Somewhere a stream is rendered (a video element, an audio sink).
#[async_trait]
pub trait MediaSurface: Send + Sync {
    /// Point the surface at `stream`, or detach it with `None`.
    fn attach(&self, stream: Option<&MediaStream>, options: AttachOptions);
    async fn play(&self) -> Result<(), PlaybackError>;
}

/// Autoplay can be refused until the platform is ready; try a few times.
pub async fn play_with_retry(surface: &dyn MediaSurface) -> bool {
    for attempt in 1..=PLAY_ATTEMPTS {
        match surface.play().await {
            Ok(()) => return true,
            Err(e) => debug!(attempt, "Play attempt failed: {e}"),
        }
        if attempt < PLAY_ATTEMPTS {
            tokio::time::sleep(PLAY_RETRY_GAP).await;
        }
    }
    warn!("Giving up on playback after {PLAY_ATTEMPTS} attempts");
    false
}

/// Surfaces bound by the UI and the streams they should show. Binding and
/// stream changes can happen in either order.
#[derive(Default)]
pub struct SurfaceBindings {
    inner: Mutex<Bound>,
}

#[derive(Default)]
struct Bound {
    local_video: Option<Arc<dyn MediaSurface>>,
    remote_video: Option<Arc<dyn MediaSurface>>,
    remote_audio: Option<Arc<dyn MediaSurface>>,
    local_stream: Option<MediaStream>,
    remote_stream: Option<MediaStream>,
}

const LOCAL_VIDEO: AttachOptions = AttachOptions {
    muted: true,
    mirror: true,
    autoplay: true,
};
const REMOTE_VIDEO: AttachOptions = AttachOptions {
    muted: true,
    mirror: false,
    autoplay: true,
};
const REMOTE_AUDIO: AttachOptions = AttachOptions {
    muted: false,
    mirror: false,
    autoplay: true,
};

impl SurfaceBindings {
    pub fn bind_local_video(&self, surface: Arc<dyn MediaSurface>) {
        let stream = {
            let mut bound = self.lock();
            bound.local_video = Some(Arc::clone(&surface));
            bound.local_stream.clone()
        };
        show(surface, stream, LOCAL_VIDEO);
    }

    pub fn bind_remote_video(&self, surface: Arc<dyn MediaSurface>) {
        let stream = {
            let mut bound = self.lock();
            bound.remote_video = Some(Arc::clone(&surface));
            bound.remote_stream.clone()
        };
        show(surface, stream, REMOTE_VIDEO);
    }

    pub fn bind_remote_audio(&self, surface: Arc<dyn MediaSurface>) {
        let stream = {
            let mut bound = self.lock();
            bound.remote_audio = Some(Arc::clone(&surface));
            bound.remote_stream.clone()
        };
        show(surface, stream, REMOTE_AUDIO);
    }

    pub fn set_local_stream(&self, stream: Option<MediaStream>) {
        let surface = {
            let mut bound = self.lock();
            bound.local_stream = stream.clone();
            bound.local_video.clone()
        };
        if let Some(surface) = surface {
            show(surface, stream, LOCAL_VIDEO);
        }
    }

    pub fn set_remote_stream(&self, stream: Option<MediaStream>) {
        let (video, audio) = {
            let mut bound = self.lock();
            bound.remote_stream = stream.clone();
            (bound.remote_video.clone(), bound.remote_audio.clone())
        };
        if let Some(surface) = video {
            show(surface, stream.clone(), REMOTE_VIDEO);
        }
        if let Some(surface) = audio {
            show(surface, stream, REMOTE_AUDIO);
        }
    }

    /// Detach everything. Surfaces stay bound for the next call.
    pub fn clear_streams(&self) {
        self.set_local_stream(None);
        self.set_remote_stream(None);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Bound> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn show(surface: Arc<dyn MediaSurface>, stream: Option<MediaStream>, options: AttachOptions) {
    surface.attach(stream.as_ref(), options);
    if stream.is_some() && options.autoplay {
        tokio::spawn(async move {
            play_with_retry(surface.as_ref()).await;
        });
    }
}
