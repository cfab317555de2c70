use careline_protocol::MessageError;

/// Why local capture could not be started. Each variant carries the one
/// message shown to the user.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MediaError {
    #[error("Use HTTPS to access camera/mic.")]
    InsecureContext,
    #[error("Media devices API unavailable.")]
    ApiUnavailable,
    #[error("Allow Camera and Microphone for this site.")]
    PermissionDenied,
    #[error("No microphone found.")]
    NoMicrophone,
    #[error("No camera found.")]
    NoCamera,
    #[error("Could not match camera settings.")]
    UnsatisfiableConstraints,
    #[error("Camera or microphone is in use by another app.")]
    DeviceBusy,
    #[error("Requested device not found.")]
    DeviceNotFound,
    /// Detail is for logs only.
    #[error("Could not access microphone/camera.")]
    CaptureFailed(String),
}

impl MediaError {
    /// Stable machine-readable reason code.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::InsecureContext => "insecure-context",
            Self::ApiUnavailable => "api-unavailable",
            Self::PermissionDenied => "permission-denied",
            Self::NoMicrophone => "no-microphone",
            Self::NoCamera => "no-camera",
            Self::UnsatisfiableConstraints => "unsatisfiable-constraints",
            Self::DeviceBusy => "device-busy",
            Self::DeviceNotFound => "device-not-found",
            Self::CaptureFailed(_) => "capture-failed",
        }
    }

    pub fn user_message(&self) -> String {
        self.to_string()
    }
}

/// Inbound signaling problems. These are logged and dropped, never surfaced.
#[derive(Debug, thiserror::Error)]
pub enum SignalingError {
    #[error("message belongs to conversation {0}")]
    ForeignConversation(String),
    #[error("message from unexpected sender {0}")]
    ForeignSender(String),
    #[error(transparent)]
    Malformed(#[from] MessageError),
    #[error("signaling transport closed")]
    Closed,
    #[error("signaling transport error: {0}")]
    Transport(String),
}

#[derive(Debug, thiserror::Error)]
pub enum NegotiationError {
    #[error("webrtc: {0}")]
    WebRtc(#[from] webrtc::Error),
    #[error("peer link failed before connecting")]
    LinkFailed,
    #[error("no active peer link")]
    NoLink,
}

/// Terminal reason recorded in the call state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallFailure {
    Media(MediaError),
    Offline,
    NoNetworkPath,
    Negotiation(String),
    ConnectTimeout,
    Unanswered,
    Signaling(String),
}

impl CallFailure {
    /// The single user-facing message for this category.
    pub fn message(&self) -> String {
        match self {
            Self::Media(e) => e.user_message(),
            Self::Offline => "You’re offline. Reconnect to the Internet.".to_string(),
            Self::NoNetworkPath => {
                "No network path to the other person. Check your connection or firewall."
                    .to_string()
            }
            Self::Negotiation(_) => "Could not set up the call connection.".to_string(),
            Self::ConnectTimeout => {
                "Connection timed out. Your network may be blocking calls.".to_string()
            }
            Self::Unanswered => "No answer. Call timed out after 5 minutes.".to_string(),
            Self::Signaling(_) => "Call service unavailable. Try again.".to_string(),
        }
    }
}

/// Error returned by `CallController::open`.
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    #[error("a call is already open")]
    AlreadyOpen,
    #[error("call setup was cancelled")]
    Cancelled,
    #[error("network is offline")]
    Offline,
    #[error(transparent)]
    Media(#[from] MediaError),
    #[error("no direct or relayed network path is reachable")]
    NoNetworkPath,
    #[error("signaling: {0}")]
    Signaling(#[from] SignalingError),
    #[error("negotiation: {0}")]
    Negotiation(#[from] NegotiationError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn media_errors_have_distinct_reasons() {
        let all = [
            MediaError::InsecureContext,
            MediaError::ApiUnavailable,
            MediaError::PermissionDenied,
            MediaError::NoMicrophone,
            MediaError::NoCamera,
            MediaError::UnsatisfiableConstraints,
            MediaError::DeviceBusy,
            MediaError::DeviceNotFound,
            MediaError::CaptureFailed("boom".to_string()),
        ];
        let mut reasons: Vec<_> = all.iter().map(|e| e.reason()).collect();
        reasons.sort();
        reasons.dedup();
        assert_eq!(reasons.len(), all.len());
    }

    #[test]
    fn capture_failure_detail_stays_out_of_user_message() {
        let err = MediaError::CaptureFailed("v4l2 ioctl EIO".to_string());
        assert_eq!(err.user_message(), "Could not access microphone/camera.");
    }

    #[test]
    fn failure_messages() {
        assert_eq!(
            CallFailure::Media(MediaError::InsecureContext).message(),
            "Use HTTPS to access camera/mic."
        );
        assert_eq!(
            CallFailure::Unanswered.message(),
            "No answer. Call timed out after 5 minutes."
        );
        assert!(CallFailure::Offline.message().contains("offline"));
    }

    #[test]
    fn link_rejections_carry_the_webrtc_error() {
        let err: NegotiationError = webrtc::Error::ErrNoRemoteDescription.into();
        assert!(matches!(err, NegotiationError::WebRtc(webrtc::Error::ErrNoRemoteDescription)));
        assert!(err.to_string().starts_with("webrtc: "));
    }
}
