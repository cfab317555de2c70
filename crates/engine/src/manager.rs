use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info};

use crate::controller::{CallController, CallDeps};
use crate::error::CallError;
use crate::negotiator::SessionParams;

/// Live calls keyed by conversation id. The map lock is never held across
/// an await, so a call can be closed while another one is still opening.
pub struct CallManager {
    deps: CallDeps,
    calls: Mutex<HashMap<String, Arc<CallController>>>,
}

impl CallManager {
    pub fn new(deps: CallDeps) -> Self {
        Self {
            deps,
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// Open a call for `params.conversation_id`. A finished call for the same
    /// conversation is replaced; a live one is refused.
    pub async fn open(&self, params: SessionParams) -> Result<Arc<CallController>, CallError> {
        let conversation_id = params.conversation_id.clone();
        let controller = {
            let mut calls = self.lock();
            if let Some(existing) = calls.get(&conversation_id)
                && existing.is_active()
                && !existing.state().status.is_terminal()
            {
                return Err(CallError::AlreadyOpen);
            }
            let controller = Arc::new(CallController::new(self.deps.clone()));
            calls.insert(conversation_id.clone(), Arc::clone(&controller));
            controller
        };

        controller.open(params).await?;
        info!(conversation_id, active = self.lock().len(), "Call registered");
        Ok(controller)
    }

    pub fn get(&self, conversation_id: &str) -> Option<Arc<CallController>> {
        self.lock().get(conversation_id).cloned()
    }

    /// Tear down and forget a call, including one that is still opening.
    /// Returns whether one was registered.
    pub async fn close(&self, conversation_id: &str) -> bool {
        let removed = self.lock().remove(conversation_id);
        match removed {
            Some(controller) => {
                controller.close().await;
                true
            }
            None => false,
        }
    }

    /// Drop every call whose status is terminal.
    pub fn reap_finished(&self) -> usize {
        let mut calls = self.lock();
        let before = calls.len();
        calls.retain(|_, controller| !controller.state().status.is_terminal());
        let reaped = before - calls.len();
        if reaped > 0 {
            debug!(reaped, "Finished calls removed");
        }
        reaped
    }

    /// Conversations with a call that has not reached a terminal status.
    pub fn active(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .lock()
            .iter()
            .filter(|(_, c)| !c.state().status.is_terminal())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub async fn close_all(&self) {
        let calls: Vec<_> = self.lock().drain().map(|(_, c)| c).collect();
        for controller in calls {
            controller.close().await;
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<CallController>>> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use careline_protocol::CallConfig;

    use super::*;
    use crate::media::CallMode;
    use crate::negotiator::Role;
    use crate::signaling::MemoryHub;
    use crate::state::CallStatus;
    use crate::test_support::{MockDevices, MockLinkFactory, MockProber};

    fn manager(hub: &MemoryHub, prober: MockProber) -> CallManager {
        CallManager::new(CallDeps {
            signaling: Arc::new(hub.clone()),
            devices: Arc::new(MockDevices::new()),
            prober: Arc::new(prober),
            links: Arc::new(MockLinkFactory::new()),
            config: CallConfig::default(),
        })
    }

    fn params(conversation_id: &str) -> SessionParams {
        SessionParams {
            conversation_id: conversation_id.to_string(),
            local_id: "staff".to_string(),
            remote_id: format!("patient-{conversation_id}"),
            role: Role::Caller,
            mode: CallMode::Audio,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn one_live_call_per_conversation() {
        let hub = MemoryHub::new();
        let calls = manager(&hub, MockProber::new(true, false));
        calls.open(params("a")).await.unwrap();
        calls.open(params("b")).await.unwrap();
        assert!(matches!(calls.open(params("a")).await, Err(CallError::AlreadyOpen)));
        assert_eq!(calls.active(), vec!["a".to_string(), "b".to_string()]);

        assert!(calls.close("a").await);
        assert!(!calls.close("a").await);
        assert_eq!(calls.active(), vec!["b".to_string()]);
        calls.close_all().await;
        assert!(calls.active().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn finished_calls_are_reaped_and_replaceable() {
        let hub = MemoryHub::new();
        let calls = manager(&hub, MockProber::new(false, false));
        assert!(calls.open(params("a")).await.is_err());
        assert_eq!(
            calls.get("a").map(|c| c.state().status),
            Some(CallStatus::Failed)
        );
        assert!(calls.active().is_empty());

        // A failed call does not block a retry
        assert!(calls.open(params("a")).await.is_err());
        assert_eq!(calls.reap_finished(), 1);
        assert!(calls.get("a").is_none());
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn close_reaches_a_call_that_is_still_opening() {
        let hub = MemoryHub::new();
        let calls = Arc::new(manager(
            &hub,
            MockProber::new(true, false).with_delay(Duration::from_secs(5)),
        ));
        let opener = Arc::clone(&calls);
        let opening = tokio::spawn(async move { opener.open(params("a")).await });

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(calls.active(), vec!["a".to_string()]);
        assert!(calls.close("a").await);
        assert_eq!(hub.subscriber_count("staff"), 0);
        assert!(calls.get("a").is_none());

        assert!(matches!(opening.await.unwrap(), Err(CallError::Cancelled)));
    }
}
