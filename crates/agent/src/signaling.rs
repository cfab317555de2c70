//! WebSocket client for the Careline relay.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use careline_engine::{SignalingError, SignalingTransport, Subscription};
use careline_protocol::{MAX_MESSAGE_BYTES, NegotiationMessage, RelayEnvelope};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const OUTBOX_CAPACITY: usize = 64;
const INITIAL_BACKOFF: Duration = Duration::from_secs(2);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

type Subscribers = Arc<Mutex<Vec<(u64, mpsc::UnboundedSender<NegotiationMessage>)>>>;

/// Relay connection for one user. Frames sent while disconnected wait in a
/// bounded outbox; inbound frames fan out to every live subscription.
pub(crate) struct WsSignaling {
    user_id: String,
    outbox: mpsc::Sender<RelayEnvelope>,
    subscribers: Subscribers,
    next_id: AtomicU64,
}

impl WsSignaling {
    /// Start the connection task for `user_id` against `relay_url`.
    pub fn connect(relay_url: &str, user_id: &str) -> (Arc<Self>, JoinHandle<()>) {
        let (outbox, outbox_rx) = mpsc::channel(OUTBOX_CAPACITY);
        let subscribers: Subscribers = Arc::default();
        let url = format!("{relay_url}/ws/{user_id}");
        let task = tokio::spawn(run_connection(url, outbox_rx, Arc::clone(&subscribers)));
        let client = Arc::new(Self {
            user_id: user_id.to_string(),
            outbox,
            subscribers,
            next_id: AtomicU64::new(1),
        });
        (client, task)
    }
}

fn lock(subscribers: &Subscribers) -> MutexGuard<'_, Vec<(u64, mpsc::UnboundedSender<NegotiationMessage>)>> {
    subscribers.lock().unwrap_or_else(|e| e.into_inner())
}

#[async_trait]
impl SignalingTransport for WsSignaling {
    async fn subscribe(&self, user_id: &str) -> Result<Subscription, SignalingError> {
        if user_id != self.user_id {
            return Err(SignalingError::Transport(format!(
                "connection belongs to {}, not {user_id}",
                self.user_id
            )));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.subscribers).push((id, tx));

        let subscribers = Arc::downgrade(&self.subscribers);
        Ok(Subscription::new(rx).with_cleanup(move || {
            if let Some(subscribers) = subscribers.upgrade() {
                lock(&subscribers).retain(|(sid, _)| *sid != id);
            }
        }))
    }

    async fn send(&self, to: &str, message: NegotiationMessage) -> Result<(), SignalingError> {
        let envelope = RelayEnvelope {
            to: to.to_string(),
            message,
        };
        self.outbox.try_send(envelope).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SignalingError::Transport("outbox full".to_string()),
            mpsc::error::TrySendError::Closed(_) => SignalingError::Closed,
        })
    }
}

/// Hand an inbound frame to every subscriber. Returns how many took it.
fn deliver(subscribers: &Subscribers, text: &str) -> usize {
    let message = match NegotiationMessage::from_json(text) {
        Ok(m) => m,
        Err(e) => {
            warn!("Invalid frame from relay: {e}");
            return 0;
        }
    };
    let mut subs = lock(subscribers);
    subs.retain(|(_, tx)| !tx.is_closed());
    for (_, tx) in subs.iter() {
        let _ = tx.send(message.clone());
    }
    subs.len()
}

async fn run_connection(url: String, mut outbox: mpsc::Receiver<RelayEnvelope>, subscribers: Subscribers) {
    let mut backoff = INITIAL_BACKOFF;
    loop {
        info!(url = %url, "Connecting to signaling relay");

        match connect_and_handle(&url, &mut outbox, &subscribers, &mut backoff).await {
            Ok(()) => {
                info!("Signaling client shut down");
                break;
            }
            Err(e) => {
                warn!("Signaling connection error: {e:#}");
                info!("Reconnecting in {} seconds...", backoff.as_secs());
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }
    }
}

/// `Ok` once every sender handle is gone; `Err` on any connection loss.
async fn connect_and_handle(
    url: &str,
    outbox: &mut mpsc::Receiver<RelayEnvelope>,
    subscribers: &Subscribers,
    backoff: &mut Duration,
) -> anyhow::Result<()> {
    use futures_util::{SinkExt, StreamExt};
    use tokio_tungstenite::tungstenite::Message;

    let mut ws_config = tokio_tungstenite::tungstenite::protocol::WebSocketConfig::default();
    ws_config.max_message_size = Some(MAX_MESSAGE_BYTES);
    let (ws_stream, _) = tokio_tungstenite::connect_async_with_config(url, Some(ws_config), false)
        .await
        .context("WebSocket connection failed")?;

    info!("Connected to signaling relay");
    *backoff = INITIAL_BACKOFF;
    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let delivered = deliver(subscribers, &text);
                        debug!(delivered, "Inbound negotiation frame");
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        anyhow::bail!("Relay closed the connection");
                    }
                    Some(Err(e)) => {
                        return Err(e.into());
                    }
                    _ => {}
                }
            }
            envelope = outbox.recv() => {
                let Some(envelope) = envelope else {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    return Ok(());
                };
                let text = serde_json::to_string(&envelope)?;
                ws_tx.send(Message::Text(text.into())).await?;
            }
        }
    }
}
