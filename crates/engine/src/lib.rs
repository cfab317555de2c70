//! Call session establishment: local capture, path probing, offer/answer
//! negotiation with resend and relay fallback, and teardown.

pub mod controller;
pub mod error;
pub mod link;
pub mod manager;
pub mod media;
pub mod negotiator;
pub mod probe;
pub mod retry;
pub mod signaling;
pub mod state;
pub mod surface;
pub mod timers;
pub mod webrtc_link;

#[cfg(test)]
mod test_support;

pub use controller::{CallController, CallDeps};
pub use error::{CallError, CallFailure, MediaError, NegotiationError, SignalingError};
pub use link::{LinkFactory, PeerLink, TransportPolicy};
pub use manager::CallManager;
pub use media::{CallMode, LocalMedia, LocalTrack, MediaDevices, MediaKind};
pub use negotiator::{Role, SessionParams};
pub use probe::{IceProber, PathProber, PathReport};
pub use signaling::{MemoryHub, SignalingTransport, Subscription};
pub use state::{CallState, CallStatus};
pub use surface::MediaSurface;
pub use webrtc_link::WebRtcLinkFactory;
