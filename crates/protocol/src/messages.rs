use serde::{Deserialize, Serialize};

/// Largest signaling frame accepted on either side of the relay.
pub const MAX_MESSAGE_BYTES: usize = 65_536;

/// Kind of a session description.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// A local or remote media/transport capability description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Network-path candidate in the browser's `RTCIceCandidateInit` shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

/// Path kind advertised by a candidate line (`typ <kind>`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateType {
    Host,
    ServerReflexive,
    PeerReflexive,
    Relay,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }

    /// Parse the `typ` attribute of the candidate line.
    pub fn candidate_type(&self) -> Option<CandidateType> {
        candidate_type(&self.candidate)
    }
}

/// Parse the `typ` attribute of a raw candidate line.
pub fn candidate_type(line: &str) -> Option<CandidateType> {
    let mut fields = line.split_whitespace();
    while let Some(field) = fields.next() {
        if field == "typ" {
            return match fields.next()? {
                "host" => Some(CandidateType::Host),
                "srflx" => Some(CandidateType::ServerReflexive),
                "prflx" => Some(CandidateType::PeerReflexive),
                "relay" => Some(CandidateType::Relay),
                _ => None,
            };
        }
    }
    None
}

/// Negotiation messages exchanged between the two peers of a call.
///
/// `attempt` numbers the offer/answer round. It starts at 1 and is bumped by
/// every relay-fallback renegotiation, so a resent offer (same attempt) can be
/// told apart from a new round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum NegotiationMessage {
    Offer {
        conversation_id: String,
        from_id: String,
        #[serde(default = "first_attempt")]
        attempt: u32,
        description: SessionDescription,
    },
    Answer {
        conversation_id: String,
        from_id: String,
        #[serde(default = "first_attempt")]
        attempt: u32,
        description: SessionDescription,
    },
    Candidate {
        conversation_id: String,
        from_id: String,
        #[serde(default = "first_attempt")]
        attempt: u32,
        candidate: IceCandidate,
    },
    Hangup {
        conversation_id: String,
        #[serde(default = "system_sender")]
        from_id: String,
    },
}

impl NegotiationMessage {
    pub fn conversation_id(&self) -> &str {
        match self {
            Self::Offer {
                conversation_id, ..
            }
            | Self::Answer {
                conversation_id, ..
            }
            | Self::Candidate {
                conversation_id, ..
            }
            | Self::Hangup {
                conversation_id, ..
            } => conversation_id,
        }
    }

    pub fn from_id(&self) -> &str {
        match self {
            Self::Offer { from_id, .. }
            | Self::Answer { from_id, .. }
            | Self::Candidate { from_id, .. }
            | Self::Hangup { from_id, .. } => from_id,
        }
    }

    /// Short name used in log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::Candidate { .. } => "candidate",
            Self::Hangup { .. } => "hangup",
        }
    }

    pub fn to_json(&self) -> Result<String, MessageError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self, MessageError> {
        if text.len() > MAX_MESSAGE_BYTES {
            return Err(MessageError::TooLarge(text.len()));
        }
        Ok(serde_json::from_str(text)?)
    }
}

/// Frame a relay client sends: deliver `message` to every connection of `to`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayEnvelope {
    pub to: String,
    pub message: NegotiationMessage,
}

#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("message too large: {0} bytes (max {MAX_MESSAGE_BYTES})")]
    TooLarge(usize),
}

fn first_attempt() -> u32 {
    1
}

fn system_sender() -> String {
    "system".to_string()
}
