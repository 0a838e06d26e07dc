use crate::error::HarnessError;
use std::future::Future;
use tracing::warn;

/// Decision returned by the retry policy after one crash+recovery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// The target recovered: the scenario passed.
    Proceed,
    /// Recovery was not observed: run the whole cycle again (1-based attempt just finished).
    Retry { attempt: u32 },
    /// Every attempt came back without recovery.
    Exhausted,
}

/// Retry policy for timing-dependent recovery checks.
///
/// Where the crash lands is a matter of timing, so a single attempt that
/// never saw the recovery marker is not a failure. Only exhausting
/// `max_attempts` is.
pub struct RetryPolicy {
    max_attempts: u32,
    current_attempt: u32,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            current_attempt: 0,
        }
    }

    /// Record the outcome of one attempt and decide what to do next.
    pub fn evaluate(&mut self, recovered: bool) -> RetryDecision {
        self.current_attempt += 1;

        if recovered {
            return RetryDecision::Proceed;
        }

        if self.current_attempt < self.max_attempts {
            warn!(
                attempt = self.current_attempt,
                max_attempts = self.max_attempts,
                "recovery not observed, retrying"
            );
            RetryDecision::Retry {
                attempt: self.current_attempt,
            }
        } else {
            warn!(
                max_attempts = self.max_attempts,
                "recovery attempts exhausted"
            );
            RetryDecision::Exhausted
        }
    }

    /// Attempts made so far.
    pub fn current_attempt(&self) -> u32 {
        self.current_attempt
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

/// Run `attempt` until it reports recovery or the policy is exhausted.
///
/// `attempt` receives the 1-based attempt number. A hard error from any
/// attempt ends the loop immediately.
pub async fn run_with_retries<F, Fut>(
    policy: &mut RetryPolicy,
    label: &str,
    mut attempt: F,
) -> Result<RetryDecision, HarnessError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<bool, HarnessError>>,
{
    loop {
        let recovered = attempt(policy.current_attempt() + 1).await?;
        match policy.evaluate(recovered) {
            RetryDecision::Retry { attempt } => println!("{label} attempt {attempt}"),
            decision => return Ok(decision),
        }
    }
}
