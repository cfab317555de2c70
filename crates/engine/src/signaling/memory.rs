use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use careline_protocol::NegotiationMessage;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::{SignalingTransport, Subscription};
use crate::error::SignalingError;

/// Loss injection: return `true` to drop a message addressed to `to`.
pub type DropRule = Box<dyn FnMut(&str, &NegotiationMessage) -> bool + Send>;

/// In-process signaling hub with per-user channels.
///
/// Messages addressed to a user with no live subscriber are dropped, like the
/// hosted bus. Cloning shares the hub.
#[derive(Clone, Default)]
pub struct MemoryHub {
    inner: Arc<Mutex<HubInner>>,
}

#[derive(Default)]
struct HubInner {
    subscribers: HashMap<String, Vec<(u64, mpsc::UnboundedSender<NegotiationMessage>)>>,
    next_id: u64,
    drop_rule: Option<DropRule>,
    sent: Vec<(String, NegotiationMessage)>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_drop_rule(&self, rule: impl FnMut(&str, &NegotiationMessage) -> bool + Send + 'static) {
        self.lock().drop_rule = Some(Box::new(rule));
    }

    pub fn clear_drop_rule(&self) {
        self.lock().drop_rule = None;
    }

    pub fn subscriber_count(&self, user_id: &str) -> usize {
        self.lock()
            .subscribers
            .get(user_id)
            .map(|subs| subs.len())
            .unwrap_or(0)
    }

    /// Every message handed to `send`, delivered or not, in send order.
    pub fn sent(&self) -> Vec<(String, NegotiationMessage)> {
        self.lock().sent.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HubInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl SignalingTransport for MemoryHub {
    async fn subscribe(&self, user_id: &str) -> Result<Subscription, SignalingError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = {
            let mut inner = self.lock();
            inner.next_id += 1;
            let id = inner.next_id;
            inner
                .subscribers
                .entry(user_id.to_string())
                .or_default()
                .push((id, tx));
            id
        };
        debug!(user_id, subscriber = id, "Subscribed to signaling channel");

        let hub = Arc::downgrade(&self.inner);
        let user = user_id.to_string();
        Ok(Subscription::new(rx).with_cleanup(move || {
            let Some(hub) = hub.upgrade() else { return };
            let mut inner = hub.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(subs) = inner.subscribers.get_mut(&user) {
                subs.retain(|(sid, _)| *sid != id);
                if subs.is_empty() {
                    inner.subscribers.remove(&user);
                }
            }
        }))
    }

    async fn send(&self, to: &str, message: NegotiationMessage) -> Result<(), SignalingError> {
        let mut inner = self.lock();
        inner.sent.push((to.to_string(), message.clone()));

        if let Some(rule) = inner.drop_rule.as_mut()
            && rule(to, &message)
        {
            trace!(to, kind = message.kind(), "Message dropped by loss rule");
            return Ok(());
        }

        match inner.subscribers.get(to) {
            Some(subs) => {
                for (_, tx) in subs {
                    let _ = tx.send(message.clone());
                }
            }
            None => trace!(to, kind = message.kind(), "No subscriber, message dropped"),
        }
        Ok(())
    }
}
