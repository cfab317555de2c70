use std::future::Future;
use std::time::Duration;

/// Bounded periodic retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    /// The stop predicate became true.
    Stopped { attempts: u32 },
    /// The budget ran out first.
    Exhausted { attempts: u32 },
}

impl RetryOutcome {
    pub fn attempts(self) -> u32 {
        match self {
            Self::Stopped { attempts } | Self::Exhausted { attempts } => attempts,
        }
    }
}

/// Every `policy.interval`: return if `stop()` holds, return if the budget is
/// spent, otherwise run `action` with the 1-based attempt number.
///
/// The first action runs one interval after the call; the initial send is the
/// caller's job.
pub async fn retry_until<S, A, F>(policy: RetryPolicy, mut stop: S, mut action: A) -> RetryOutcome
where
    S: FnMut() -> bool,
    A: FnMut(u32) -> F,
    F: Future<Output = ()>,
{
    let mut attempts = 0;
    loop {
        tokio::time::sleep(policy.interval).await;
        if stop() {
            return RetryOutcome::Stopped { attempts };
        }
        if attempts >= policy.max_attempts {
            return RetryOutcome::Exhausted { attempts };
        }
        attempts += 1;
        action(attempts).await;
    }
}
