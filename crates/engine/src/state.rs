use crate::error::{CallFailure, MediaError};
use crate::media::TrackInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallStatus {
    #[default]
    Idle,
    Ringing,
    Connecting,
    Connected,
    Ended,
    Failed,
    Missed,
}

impl CallStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ended | Self::Failed | Self::Missed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Ringing => "ringing",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Ended => "ended",
            Self::Failed => "failed",
            Self::Missed => "missed",
        }
    }
}

impl std::fmt::Display for CallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot published to the UI on every change.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CallState {
    pub status: CallStatus,
    pub media_error: Option<MediaError>,
    pub failure: Option<CallFailure>,
    /// Seconds spent ringing/connecting; frozen once connected.
    pub dial_seconds: u32,
    pub muted: bool,
    pub camera_off: bool,
    pub net_offline: bool,
    pub stun_ok: bool,
    pub turn_ok: bool,
    pub using_relay_only: bool,
    pub remote_tracks: Vec<TrackInfo>,
}

impl CallState {
    /// Fresh per-attempt state. User toggles and connectivity survive.
    pub fn reset_for_open(&mut self, status: CallStatus) {
        *self = Self {
            status,
            muted: self.muted,
            camera_off: self.camera_off,
            net_offline: self.net_offline,
            ..Self::default()
        };
    }

    /// The one message to show, if any.
    pub fn error_message(&self) -> Option<String> {
        self.failure.as_ref().map(CallFailure::message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(CallStatus::Missed.is_terminal());
        assert!(CallStatus::Failed.is_terminal());
        assert!(!CallStatus::Connected.is_terminal());
        assert!(!CallStatus::Idle.is_terminal());
    }

    #[test]
    fn reset_keeps_user_toggles() {
        let mut state = CallState {
            status: CallStatus::Failed,
            failure: Some(CallFailure::ConnectTimeout),
            dial_seconds: 42,
            muted: true,
            net_offline: true,
            using_relay_only: true,
            ..Default::default()
        };
        state.reset_for_open(CallStatus::Ringing);
        assert_eq!(state.status, CallStatus::Ringing);
        assert!(state.muted);
        assert!(state.net_offline);
        assert_eq!(state.dial_seconds, 0);
        assert_eq!(state.failure, None);
        assert!(!state.using_relay_only);
    }
}
