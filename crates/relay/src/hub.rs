use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::extract::ws::{Message, WebSocket};
use careline_protocol::{NegotiationMessage, RelayEnvelope};
use tokio::sync::{RwLock, broadcast};

/// A message on its way to a user, tagged with the connection that sent it.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub origin: u64,
    pub message: NegotiationMessage,
}

/// Per-user fan-out channel. Every connection of the user subscribes.
pub struct UserChannel {
    pub tx: broadcast::Sender<Delivery>,
}

/// Registry of user channels plus the connection id counter.
pub struct Hub {
    channels: RwLock<HashMap<String, Arc<UserChannel>>>,
    capacity: usize,
    next_connection: AtomicU64,
}

impl Hub {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            channels: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
            next_connection: AtomicU64::new(1),
        })
    }

    pub fn connection_id(&self) -> u64 {
        self.next_connection.fetch_add(1, Ordering::Relaxed)
    }

    /// Get or create the channel for `user_id`.
    pub async fn channel(&self, user_id: &str) -> Arc<UserChannel> {
        {
            let channels = self.channels.read().await;
            if let Some(ch) = channels.get(user_id) {
                return Arc::clone(ch);
            }
        }

        let mut channels = self.channels.write().await;
        channels
            .entry(user_id.to_string())
            .or_insert_with(|| {
                let (tx, _) = broadcast::channel(self.capacity);
                Arc::new(UserChannel { tx })
            })
            .clone()
    }

    /// Deliver to every live connection of `to`. Returns how many receivers
    /// got it; nothing is queued for users without a connection.
    pub async fn publish(&self, to: &str, delivery: Delivery) -> usize {
        let channel = {
            let channels = self.channels.read().await;
            channels.get(to).cloned()
        };
        match channel {
            Some(ch) => ch.tx.send(delivery).unwrap_or(0),
            None => 0,
        }
    }

    /// Drop the channel of `user_id` once nobody listens on it.
    pub async fn release(&self, user_id: &str) {
        let mut channels = self.channels.write().await;
        if channels
            .get(user_id)
            .is_some_and(|ch| ch.tx.receiver_count() == 0)
        {
            channels.remove(user_id);
            tracing::debug!(user_id, "User channel removed");
        }
    }

    pub async fn channel_count(&self) -> usize {
        self.channels.read().await.len()
    }

    /// Route one client frame sent on `user_id`'s connection. Returns how
    /// many receivers got it.
    pub async fn route_frame(&self, user_id: &str, connection: u64, text: &str) -> Result<usize, FrameRejected> {
        let envelope: RelayEnvelope =
            serde_json::from_str(text).map_err(|e| FrameRejected::Invalid(e.to_string()))?;
        let claimed = envelope.message.from_id();
        if claimed != user_id {
            return Err(FrameRejected::ForeignSender {
                claimed: claimed.to_string(),
            });
        }
        let kind = envelope.message.kind();
        let delivered = self
            .publish(&envelope.to, Delivery { origin: connection, message: envelope.message })
            .await;
        if delivered == 0 {
            tracing::debug!(%user_id, to = %envelope.to, kind, "No subscriber, message dropped");
        } else {
            tracing::debug!(%user_id, to = %envelope.to, kind, delivered, "Relayed");
        }
        Ok(delivered)
    }
}

/// Why a client frame was not relayed.
#[derive(Debug, PartialEq, Eq)]
pub enum FrameRejected {
    Invalid(String),
    /// `fromId` names a user other than the one the socket connected as.
    ForeignSender { claimed: String },
}

/// Serve one user connection: forward the user's channel to the socket and
/// route every envelope the socket sends to its addressee.
pub async fn handle_user_ws(mut socket: WebSocket, user_id: String, hub: Arc<Hub>) {
    let connection = hub.connection_id();
    let channel = hub.channel(&user_id).await;
    let mut inbox = channel.tx.subscribe();
    drop(channel);

    tracing::info!(%user_id, connection, "Relay WebSocket connected");

    loop {
        tokio::select! {
            result = inbox.recv() => {
                let delivery = match result {
                    Ok(d) => d,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(%user_id, skipped = n, "Consumer lagged, messages dropped");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                // No echo back to the connection that sent it
                if delivery.origin == connection {
                    continue;
                }
                let json = match serde_json::to_string(&delivery.message) {
                    Ok(j) => j,
                    Err(e) => {
                        tracing::error!("Failed to serialize negotiation message: {e}");
                        continue;
                    }
                };
                if socket.send(Message::Text(json.into())).await.is_err() {
                    tracing::debug!(%user_id, "WebSocket send failed");
                    break;
                }
            }
            Some(result) = socket.recv() => {
                match result {
                    Ok(Message::Text(text)) => {
                        match hub.route_frame(&user_id, connection, &text).await {
                            Ok(_) => {}
                            Err(FrameRejected::Invalid(e)) => {
                                tracing::warn!(%user_id, "Invalid relay frame: {e}");
                            }
                            Err(FrameRejected::ForeignSender { claimed }) => {
                                tracing::warn!(%user_id, %claimed, "Frame claims another sender, dropped");
                            }
                        }
                    }
                    Ok(Message::Close(_)) => {
                        tracing::info!(%user_id, "Relay WebSocket closed");
                        break;
                    }
                    Err(e) => {
                        tracing::debug!(%user_id, "Relay WebSocket error: {e}");
                        break;
                    }
                    _ => {}
                }
            }
            else => break,
        }
    }

    drop(inbox);
    hub.release(&user_id).await;
    tracing::info!(%user_id, connection, "Relay WebSocket disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hangup(from: &str) -> NegotiationMessage {
        NegotiationMessage::Hangup {
            conversation_id: "conv".to_string(),
            from_id: from.to_string(),
        }
    }

    #[tokio::test]
    async fn publish_reaches_every_subscriber_of_the_user() {
        let hub = Hub::new(8);
        let mut a = hub.channel("patient").await.tx.subscribe();
        let mut b = hub.channel("patient").await.tx.subscribe();

        let delivered = hub
            .publish("patient", Delivery { origin: 1, message: hangup("staff") })
            .await;
        assert_eq!(delivered, 2);
        assert_eq!(a.recv().await.unwrap().message, hangup("staff"));
        assert_eq!(b.recv().await.unwrap().message, hangup("staff"));
    }

    #[tokio::test]
    async fn publish_to_unknown_user_is_dropped() {
        let hub = Hub::new(8);
        assert_eq!(
            hub.publish("nobody", Delivery { origin: 1, message: hangup("staff") }).await,
            0
        );
        assert_eq!(hub.channel_count().await, 0);
    }

    #[tokio::test]
    async fn channel_removed_after_last_subscriber() {
        let hub = Hub::new(8);
        let first = hub.channel("staff").await.tx.subscribe();
        let second = hub.channel("staff").await.tx.subscribe();

        drop(first);
        hub.release("staff").await;
        assert_eq!(hub.channel_count().await, 1);

        drop(second);
        hub.release("staff").await;
        assert_eq!(hub.channel_count().await, 0);
    }

    #[tokio::test]
    async fn lagging_consumer_sees_lagged() {
        let hub = Hub::new(2);
        let mut slow = hub.channel("staff").await.tx.subscribe();
        for _ in 0..4 {
            hub.publish("staff", Delivery { origin: 9, message: hangup("patient") })
                .await;
        }
        assert!(matches!(
            slow.recv().await,
            Err(broadcast::error::RecvError::Lagged(2))
        ));
    }

    fn envelope(to: &str, from: &str) -> String {
        serde_json::to_string(&RelayEnvelope {
            to: to.to_string(),
            message: hangup(from),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn frames_route_to_the_addressee() {
        let hub = Hub::new(8);
        let mut patient = hub.channel("patient").await.tx.subscribe();

        assert_eq!(hub.route_frame("staff", 4, &envelope("patient", "staff")).await, Ok(1));
        let delivery = patient.recv().await.unwrap();
        assert_eq!(delivery.origin, 4);
        assert_eq!(delivery.message, hangup("staff"));
    }

    #[tokio::test]
    async fn frames_claiming_another_sender_are_dropped() {
        let hub = Hub::new(8);
        let mut patient = hub.channel("patient").await.tx.subscribe();

        assert_eq!(
            hub.route_frame("mallory", 5, &envelope("patient", "staff")).await,
            Err(FrameRejected::ForeignSender {
                claimed: "staff".to_string()
            })
        );
        assert!(matches!(
            patient.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn malformed_frames_are_rejected() {
        let hub = Hub::new(8);
        assert!(matches!(
            hub.route_frame("staff", 1, "{not json").await,
            Err(FrameRejected::Invalid(_))
        ));
    }

    #[test]
    fn connection_ids_are_unique() {
        let hub = Hub::new(8);
        assert_ne!(hub.connection_id(), hub.connection_id());
    }
}
