//! Pre-negotiation reachability check for direct and relayed paths.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use careline_protocol::{CandidateType, IceConfig, candidate_type};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::api::APIBuilder;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;

use crate::link::TransportPolicy;
use crate::webrtc_link::{rtc_ice_servers, rtc_policy};

#[async_trait]
pub trait PathProber: Send + Sync {
    /// A server-reflexive candidate can be gathered.
    async fn probe_direct(&self, ice: &IceConfig) -> bool;
    /// A relay candidate can be gathered.
    async fn probe_relay(&self, ice: &IceConfig) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PathReport {
    pub direct: bool,
    pub relay: bool,
}

/// How negotiation should start given a `PathReport`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathPlan {
    Direct,
    RelayOnly,
}

impl PathReport {
    /// `None` when neither path is reachable.
    pub fn plan(self) -> Option<PathPlan> {
        match (self.direct, self.relay) {
            (true, _) => Some(PathPlan::Direct),
            (false, true) => Some(PathPlan::RelayOnly),
            (false, false) => None,
        }
    }
}

/// Run both probes concurrently. The relay probe only runs when TURN servers
/// are configured.
pub async fn probe_paths(prober: &dyn PathProber, ice: &IceConfig) -> PathReport {
    let relay = async {
        if ice.has_relay() {
            prober.probe_relay(ice).await
        } else {
            false
        }
    };
    let (direct, relay) = tokio::join!(prober.probe_direct(ice), relay);
    let report = PathReport { direct, relay };
    info!(direct, relay, "Network paths probed");
    report
}

/// Gathers candidates on a throwaway peer connection.
#[derive(Debug, Clone)]
pub struct IceProber {
    timeout: Duration,
}

impl IceProber {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn probe(&self, ice: &IceConfig, policy: TransportPolicy, wanted: CandidateType) -> bool {
        let pc = match throwaway_connection(ice, policy).await {
            Ok(pc) => pc,
            Err(e) => {
                warn!(?policy, "Probe connection could not be created: {e}");
                return false;
            }
        };

        let found = match tokio::time::timeout(self.timeout, wait_for_candidate(&pc, wanted)).await {
            Ok(Ok(found)) => found,
            Ok(Err(e)) => {
                warn!(?policy, "Probe failed: {e}");
                false
            }
            Err(_) => {
                debug!(?policy, timeout_ms = self.timeout.as_millis() as u64, "Probe timed out");
                false
            }
        };

        if let Err(e) = pc.close().await {
            debug!("Failed to close probe connection: {e}");
        }
        found
    }
}

#[async_trait]
impl PathProber for IceProber {
    async fn probe_direct(&self, ice: &IceConfig) -> bool {
        self.probe(ice, TransportPolicy::All, CandidateType::ServerReflexive)
            .await
    }

    async fn probe_relay(&self, ice: &IceConfig) -> bool {
        self.probe(ice, TransportPolicy::RelayOnly, CandidateType::Relay)
            .await
    }
}

async fn throwaway_connection(
    ice: &IceConfig,
    policy: TransportPolicy,
) -> Result<Arc<RTCPeerConnection>, webrtc::Error> {
    let api = APIBuilder::new().build();
    let config = RTCConfiguration {
        ice_servers: rtc_ice_servers(ice),
        ice_transport_policy: rtc_policy(policy),
        ..Default::default()
    };
    Ok(Arc::new(api.new_peer_connection(config).await?))
}

/// Resolve `true` as soon as a `wanted` candidate appears, `false` once
/// gathering completes without one.
async fn wait_for_candidate(pc: &RTCPeerConnection, wanted: CandidateType) -> Result<bool, webrtc::Error> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Option<String>>();
    pc.on_ice_candidate(Box::new(move |candidate| {
        match candidate {
            Some(c) => {
                if let Ok(json) = c.to_json() {
                    let _ = tx.send(Some(json.candidate));
                }
            }
            // End of gathering
            None => {
                let _ = tx.send(None);
            }
        }
        Box::pin(async {})
    }));

    pc.create_data_channel("probe", None).await?;
    let offer = pc.create_offer(None).await?;
    pc.set_local_description(offer).await?;

    while let Some(event) = rx.recv().await {
        match event {
            Some(line) if candidate_type(&line) == Some(wanted) => return Ok(true),
            Some(_) => continue,
            None => break,
        }
    }
    Ok(false)
}
