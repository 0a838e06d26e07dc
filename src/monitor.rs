/// Deadline-bounded polling of a session's output.
///
/// A pure poller: sleep one tick, check the deadline, take one bounded read,
/// then look for a success line. There is no wait on channel readiness.
use crate::error::{FailReason, HarnessError};
use crate::matcher::{self, LinePattern, MatchResult};
use crate::session::Session;
use std::time::Duration;
use tokio::time::Instant;

/// An absolute point in time fixed when a bounded wait begins.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Instant,
}

impl Deadline {
    pub fn after(timeout: Duration) -> Self {
        Self {
            at: Instant::now() + timeout,
        }
    }

    pub fn expired(&self) -> bool {
        Instant::now() > self.at
    }

    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }
}

/// Result of a monitor that saw a success line.
#[derive(Debug)]
pub struct MonitorOutcome {
    pub matched: MatchResult,
    /// Poll ticks taken, including the one that matched.
    pub ticks: u32,
}

/// Poll `session` until a `success` pattern matches or `timeout` passes.
///
/// Lines matching `progress` are echoed for the operator and do not affect
/// the outcome. Passing the deadline enters the Fail terminal condition.
pub async fn monitor(
    session: &mut Session,
    success: &[LinePattern],
    progress: Option<&LinePattern>,
    timeout: Duration,
    tick: Duration,
) -> Result<MonitorOutcome, HarnessError> {
    let deadline = Deadline::after(timeout);
    tracing::info!(
        patterns = ?matcher::describe(success),
        timeout_secs = timeout.as_secs(),
        "monitoring target output"
    );

    let mut ticks = 0u32;
    loop {
        tokio::time::sleep(tick).await;
        ticks += 1;

        if deadline.expired() {
            tracing::warn!(ticks, "monitor deadline passed");
            return Err(session
                .fail(FailReason::Timeout {
                    patterns: matcher::describe(success),
                    timeout,
                })
                .await);
        }

        let bytes = session.read().await?;
        tracing::trace!(
            ticks,
            bytes,
            remaining_ms = deadline.remaining().as_millis() as u64,
            "monitor tick"
        );

        if let Some(matched) = session.find(success) {
            tracing::info!(ticks, line = %matched.line, "monitor matched");
            return Ok(MonitorOutcome { matched, ticks });
        }
        if let Some(progress) = progress {
            session.find(std::slice::from_ref(progress));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::tests::sh_config;

    #[test]
    fn test_deadline_expiry() {
        let past = Deadline::after(Duration::ZERO);
        std::thread::sleep(Duration::from_millis(5));
        assert!(past.expired());
        assert_eq!(past.remaining(), Duration::ZERO);

        let future = Deadline::after(Duration::from_secs(60));
        assert!(!future.expired());
        assert!(future.remaining() > Duration::from_secs(59));
    }

    #[tokio::test]
    async fn test_monitor_returns_early_on_success() {
        let dir = tempfile::tempdir().unwrap();
        let config = sh_config(
            dir.path(),
            "echo test sbrk: OK; sleep 0.25; echo ALL TESTS PASSED; sleep 30",
        );
        let mut session = Session::start(&config, false).await.unwrap();

        let success = matcher::compile(&["^ALL TESTS PASSED"]).unwrap();
        let progress = LinePattern::new("test").unwrap();
        let started = std::time::Instant::now();
        let outcome = monitor(
            &mut session,
            &success,
            Some(&progress),
            Duration::from_secs(10),
            Duration::from_millis(100),
        )
        .await
        .unwrap();

        assert_eq!(outcome.matched.line, "ALL TESTS PASSED");
        assert!(outcome.ticks < 20);
        assert!(started.elapsed() < Duration::from_secs(5));
        session.stop().await;
    }

    #[tokio::test]
    async fn test_progress_lines_do_not_count_as_success() {
        let dir = tempfile::tempdir().unwrap();
        let config = sh_config(dir.path(), "echo test a: OK; echo test b: OK; sleep 30");
        let mut session = Session::start(&config, false).await.unwrap();

        let success = matcher::compile(&["^ALL TESTS PASSED"]).unwrap();
        let progress = LinePattern::new("test").unwrap();
        let err = monitor(
            &mut session,
            &success,
            Some(&progress),
            Duration::from_millis(400),
            Duration::from_millis(100),
        )
        .await
        .unwrap_err();

        assert!(matches!(
            err,
            HarnessError::Fail {
                reason: FailReason::Timeout { .. }
            }
        ));
        assert!(!session.is_running());
        let saved = std::fs::read_to_string(dir.path().join("diagnostics.out")).unwrap();
        assert!(saved.contains("test b: OK"));
    }

    #[tokio::test]
    async fn test_monitor_times_out_on_silence() {
        let dir = tempfile::tempdir().unwrap();
        let config = sh_config(dir.path(), "sleep 30");
        let mut session = Session::start(&config, false).await.unwrap();

        let success = matcher::compile(&["^ALL TESTS PASSED"]).unwrap();
        let started = std::time::Instant::now();
        let err = monitor(
            &mut session,
            &success,
            None,
            Duration::from_millis(300),
            Duration::from_millis(100),
        )
        .await
        .unwrap_err();

        assert!(err.is_fail());
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
