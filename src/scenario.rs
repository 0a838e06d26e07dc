/// Named recovery scenarios composed from sessions, matching, monitoring and
/// crash injection.
use crate::config::HarnessConfig;
use crate::crash::{CrashInjector, ProcessTable};
use crate::error::{FailReason, HarnessError};
use crate::matcher::{self, LinePattern};
use crate::monitor;
use crate::registry::{self, ScenarioEntry, ScenarioKind, Selection};
use crate::retry::{run_with_retries, RetryDecision, RetryPolicy};
use crate::session::Session;
use std::time::Duration;

/// Per-run options taken from the command line.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Reduced-scope self-test with the shorter timeout.
    pub quick: bool,
}

/// Config patterns, compiled once.
struct Patterns {
    recovering: Vec<LinePattern>,
    artifact: Vec<LinePattern>,
    checkpoint: Vec<LinePattern>,
    reclaimed: Vec<LinePattern>,
    success: Vec<LinePattern>,
    progress: Option<LinePattern>,
}

impl Patterns {
    fn compile(config: &HarnessConfig) -> Result<Self, HarnessError> {
        let progress = match config.selftest.progress.as_str() {
            "" => None,
            p => Some(LinePattern::new(p)?),
        };
        Ok(Self {
            recovering: matcher::compile(&[config.log.recovering.as_str()])?,
            artifact: matcher::compile(&[config.log.artifact.as_str()])?,
            checkpoint: matcher::compile(&[config.orphan.checkpoint.as_str()])?,
            reclaimed: matcher::compile(&[config.orphan.reclaimed.as_str()])?,
            success: matcher::compile(&[config.selftest.success.as_str()])?,
            progress,
        })
    }
}

/// The self-test command line and its timeout.
///
/// Quick mode wins over a subset name.
pub fn self_test_command(config: &HarnessConfig, subset: &str, quick: bool) -> (String, Duration) {
    let selftest = &config.selftest;
    if quick {
        (
            format!("{} -q", selftest.command),
            Duration::from_secs(selftest.quick_timeout_secs),
        )
    } else if subset.is_empty() {
        (
            selftest.command.clone(),
            Duration::from_secs(selftest.timeout_secs),
        )
    } else {
        (
            format!("{} {subset}", selftest.command),
            Duration::from_secs(selftest.timeout_secs),
        )
    }
}

/// Runs scenarios against one target, one session at a time.
pub struct ScenarioRunner {
    config: HarnessConfig,
    options: RunOptions,
    injector: CrashInjector,
    patterns: Patterns,
}

impl ScenarioRunner {
    pub fn new(
        config: HarnessConfig,
        options: RunOptions,
        table: Box<dyn ProcessTable>,
    ) -> Result<Self, HarnessError> {
        let patterns = Patterns::compile(&config)?;
        Ok(Self {
            config,
            options,
            injector: CrashInjector::new(table),
            patterns,
        })
    }

    /// Resolve `selector` and run everything it selects.
    pub async fn run(&self, selector: &str) -> Result<(), HarnessError> {
        match registry::select(selector) {
            Selection::Scenarios(entries) => {
                for entry in entries {
                    tracing::info!(scenario = entry.name, "running scenario");
                    self.run_entry(entry).await?;
                }
                Ok(())
            }
            Selection::SelfTest { subset } => {
                tracing::info!(subset = %subset, "no scenario matched, running self-test");
                self.self_test(&subset).await
            }
        }
    }

    /// Human-readable description of what `run(selector)` would do.
    pub fn plan(&self, selector: &str) -> Vec<String> {
        let describe_self_test = |subset: &str| {
            let (command, timeout) = self_test_command(&self.config, subset, self.options.quick);
            format!("self-test: {command:?} (timeout {}s)", timeout.as_secs())
        };
        match registry::select(selector) {
            Selection::Scenarios(entries) => entries
                .iter()
                .map(|entry| match entry.kind {
                    ScenarioKind::SelfTest => describe_self_test(""),
                    _ => format!("{}: {}", entry.name, entry.description),
                })
                .collect(),
            Selection::SelfTest { subset } => vec![describe_self_test(&subset)],
        }
    }

    async fn run_entry(&self, entry: &ScenarioEntry) -> Result<(), HarnessError> {
        match entry.kind {
            ScenarioKind::LogRecovery => self.test_log().await,
            ScenarioKind::FileOrphan => self.test_orphan(&self.config.orphan.file_workload).await,
            ScenarioKind::DirOrphan => self.test_orphan(&self.config.orphan.dir_workload).await,
            ScenarioKind::AllCrashes => {
                self.test_log().await?;
                self.test_orphan(&self.config.orphan.file_workload).await?;
                self.test_orphan(&self.config.orphan.dir_workload).await
            }
            ScenarioKind::SelfTest => self.self_test("").await,
        }
    }

    async fn settle(&self, millis: u64) {
        tokio::time::sleep(Duration::from_millis(millis)).await;
    }

    /// Crash during log stress and check that the next boot replays the log.
    /// The whole cycle is retried since where the crash lands is timing-dependent.
    async fn test_log(&self) -> Result<(), HarnessError> {
        println!("Test recovery of log");
        let mut policy = RetryPolicy::new(self.config.log.max_attempts);
        tracing::debug!(max_attempts = policy.max_attempts(), "starting log recovery");
        let decision = run_with_retries(&mut policy, "log", |attempt| self.log_cycle(attempt)).await?;
        match decision {
            RetryDecision::Proceed => {
                println!("OK");
                Ok(())
            }
            _ => {
                println!("FAIL");
                Err(HarnessError::Fail {
                    reason: FailReason::RetriesExhausted {
                        scenario: "log".to_string(),
                        attempts: policy.current_attempt(),
                    },
                })
            }
        }
    }

    async fn log_cycle(&self, attempt: u32) -> Result<bool, HarnessError> {
        tracing::debug!(attempt, "log crash cycle");
        self.crash_log().await?;
        self.recover_log().await
    }

    async fn crash_log(&self) -> Result<(), HarnessError> {
        let mut session = Session::start(&self.config, true).await?;
        let result = async {
            session.write(format!("{}\n", self.config.log.workload)).await?;
            self.settle(self.config.timing.log_settle_ms).await;
            self.injector.crash(&mut session).await?;
            Ok::<_, HarnessError>(())
        }
        .await;
        session.finish(result).await
    }

    /// Boot without resetting. True if the log was replayed and the last
    /// file of the workload is present afterwards.
    async fn recover_log(&self) -> Result<bool, HarnessError> {
        let mut session = Session::start(&self.config, false).await?;
        let result = async {
            self.settle(self.config.timing.recover_wait_ms).await;
            session.read().await?;
            if session.find(&self.patterns.recovering).is_none() {
                return Ok::<_, HarnessError>(false);
            }

            session.write(format!("{}\n", self.config.log.listing)).await?;
            self.settle(self.config.timing.listing_wait_ms).await;
            session.read().await?;
            if session.find(&self.patterns.artifact).is_none() {
                tracing::warn!(
                    artifact = %self.config.log.artifact,
                    "log replayed but artifact missing from listing"
                );
                return Ok(false);
            }
            Ok(true)
        }
        .await;
        session.finish(result).await
    }

    /// Crash while the workload holds an unlinked resource open, then check
    /// that the next boot reclaims it.
    async fn test_orphan(&self, workload: &str) -> Result<(), HarnessError> {
        println!("Test recovery of an orphaned file");
        self.crash_orphan(workload).await?;
        self.recover_orphan().await?;
        println!("OK");
        Ok(())
    }

    async fn crash_orphan(&self, workload: &str) -> Result<(), HarnessError> {
        let mut session = Session::start(&self.config, true).await?;
        let result = async {
            session.write(format!("{workload}\n")).await?;
            self.settle(self.config.timing.orphan_settle_ms).await;
            session.read().await?;
            session.expect(&self.patterns.checkpoint).await?;
            self.injector.crash(&mut session).await?;
            Ok::<_, HarnessError>(())
        }
        .await;
        session.finish(result).await
    }

    async fn recover_orphan(&self) -> Result<(), HarnessError> {
        let mut session = Session::start(&self.config, false).await?;
        let result = async {
            self.settle(self.config.timing.recover_wait_ms).await;
            session.read().await?;
            session.expect(&self.patterns.reclaimed).await?;
            Ok::<_, HarnessError>(())
        }
        .await;
        session.finish(result).await
    }

    /// Run the self-test suite, optionally scoped to `subset`, until its
    /// success marker appears.
    async fn self_test(&self, subset: &str) -> Result<(), HarnessError> {
        let (command, timeout) = self_test_command(&self.config, subset, self.options.quick);
        let mut session = Session::start(&self.config, true).await?;
        let result = async {
            session.write(format!("{command}\n")).await?;
            monitor::monitor(
                &mut session,
                &self.patterns.success,
                self.patterns.progress.as_ref(),
                timeout,
                self.config.timing.poll_interval(),
            )
            .await
        }
        .await;
        let outcome = session.finish(result).await?;
        tracing::info!(
            command = %command,
            line = %outcome.matched.line,
            ticks = outcome.ticks,
            "self-test passed"
        );
        Ok(())
    }
}
