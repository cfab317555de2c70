use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    Dial,
    DialTick,
    ConnectWatchdog,
    IceGather,
    ResendOffer,
    ResendAnswer,
}

/// Posted to the session inbox when a timer elapses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerFired {
    pub kind: TimerKind,
    pub token: u64,
}

struct Armed {
    token: u64,
    handle: JoinHandle<()>,
}

/// Per-session timer registry. At most one timer per kind; re-arming a kind
/// aborts the previous one. Every arm gets a fresh token so a firing that was
/// already queued when its timer got cancelled is recognisably stale.
pub struct Timers {
    fired: mpsc::UnboundedSender<TimerFired>,
    armed: HashMap<TimerKind, Armed>,
    next_token: u64,
}

impl Timers {
    pub fn new(fired: mpsc::UnboundedSender<TimerFired>) -> Self {
        Self {
            fired,
            armed: HashMap::new(),
            next_token: 0,
        }
    }

    /// Fire once after `after`.
    pub fn arm_once(&mut self, kind: TimerKind, after: Duration) -> u64 {
        let token = self.token();
        let tx = self.fired.clone();
        self.insert(
            kind,
            token,
            tokio::spawn(async move {
                tokio::time::sleep(after).await;
                let _ = tx.send(TimerFired { kind, token });
            }),
        );
        token
    }

    /// Fire every `period`, first firing one period from now.
    pub fn arm_every(&mut self, kind: TimerKind, period: Duration) -> u64 {
        let token = self.token();
        let tx = self.fired.clone();
        self.insert(
            kind,
            token,
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    if tx.send(TimerFired { kind, token }).is_err() {
                        break;
                    }
                }
            }),
        );
        token
    }

    /// Run a background loop (resend) owned by this registry.
    pub fn arm_task<F>(&mut self, kind: TimerKind, task: F) -> u64
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let token = self.token();
        self.insert(kind, token, tokio::spawn(task));
        token
    }

    pub fn cancel(&mut self, kind: TimerKind) -> bool {
        match self.armed.remove(&kind) {
            Some(armed) => {
                armed.handle.abort();
                trace!(?kind, token = armed.token, "Timer cancelled");
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&mut self) {
        for (_, armed) in self.armed.drain() {
            armed.handle.abort();
        }
    }

    /// Whether `fired` came from the currently armed timer of its kind.
    pub fn is_current(&self, fired: &TimerFired) -> bool {
        self.armed
            .get(&fired.kind)
            .is_some_and(|armed| armed.token == fired.token)
    }

    /// Forget a one-shot timer that has fired.
    pub fn finish(&mut self, kind: TimerKind) {
        self.armed.remove(&kind);
    }

    pub fn is_armed(&self, kind: TimerKind) -> bool {
        self.armed
            .get(&kind)
            .is_some_and(|armed| !armed.handle.is_finished())
    }

    /// Number of timers or loops still scheduled to run.
    pub fn pending(&self) -> usize {
        self.armed
            .values()
            .filter(|armed| !armed.handle.is_finished())
            .count()
    }

    fn token(&mut self) -> u64 {
        self.next_token += 1;
        self.next_token
    }

    fn insert(&mut self, kind: TimerKind, token: u64, handle: JoinHandle<()>) {
        if let Some(previous) = self.armed.insert(kind, Armed { token, handle }) {
            previous.handle.abort();
        }
    }
}

impl Drop for Timers {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
