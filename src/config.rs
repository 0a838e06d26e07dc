use crate::error::HarnessError;
use crate::matcher::LinePattern;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration loaded from crashrex.toml.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct HarnessConfig {
    pub launcher: LauncherConfig,
    pub build: BuildConfig,
    pub reset: ResetConfig,
    pub timing: TimingConfig,
    pub log: LogScenarioConfig,
    pub orphan: OrphanScenarioConfig,
    pub selftest: SelfTestConfig,
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LauncherConfig {
    pub command: String,
    pub args: Vec<String>,
    pub warmup_ms: u64,
    pub stop_grace_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    pub command: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ResetConfig {
    pub remove: Vec<PathBuf>,
    pub command: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub poll_interval_ms: u64,
    pub read_wait_ms: u64,
    pub log_settle_ms: u64,
    pub recover_wait_ms: u64,
    pub listing_wait_ms: u64,
    pub orphan_settle_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogScenarioConfig {
    pub workload: String,
    pub recovering: String,
    pub listing: String,
    pub artifact: String,
    pub max_attempts: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrphanScenarioConfig {
    pub file_workload: String,
    pub dir_workload: String,
    pub checkpoint: String,
    pub reclaimed: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SelfTestConfig {
    pub command: String,
    pub success: String,
    pub progress: String,
    pub timeout_secs: u64,
    pub quick_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub diagnostics: PathBuf,
}

// --- Default implementations ---

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            command: "make".to_string(),
            args: vec!["qemu".to_string()],
            warmup_ms: 1000,
            stop_grace_ms: 2000,
        }
    }
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            command: vec!["make".to_string(), "kernel/kernel".to_string()],
        }
    }
}

impl Default for ResetConfig {
    fn default() -> Self {
        Self {
            remove: vec![PathBuf::from("fs.img")],
            command: vec!["make".to_string(), "fs.img".to_string()],
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            read_wait_ms: 100,
            log_settle_ms: 2000,
            recover_wait_ms: 2000,
            listing_wait_ms: 2000,
            orphan_settle_ms: 5000,
        }
    }
}

impl Default for LogScenarioConfig {
    fn default() -> Self {
        Self {
            workload: "logstress f0 f1 f2 f3 f4 f5".to_string(),
            recovering: "^recovering".to_string(),
            listing: "ls".to_string(),
            artifact: "f5".to_string(),
            max_attempts: 5,
        }
    }
}

impl Default for OrphanScenarioConfig {
    fn default() -> Self {
        Self {
            file_workload: "forphan".to_string(),
            dir_workload: "dorphan".to_string(),
            checkpoint: "wait".to_string(),
            reclaimed: "^ireclaim".to_string(),
        }
    }
}

impl Default for SelfTestConfig {
    fn default() -> Self {
        Self {
            command: "usertests".to_string(),
            success: "^ALL TESTS PASSED".to_string(),
            progress: "test".to_string(),
            timeout_secs: 600,
            quick_timeout_secs: 300,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            diagnostics: PathBuf::from("test-xv6.out"),
        }
    }
}

impl TimingConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn read_wait(&self) -> Duration {
        Duration::from_millis(self.read_wait_ms)
    }
}

impl HarnessConfig {
    /// Load config from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, HarnessError> {
        let config = match std::fs::read_to_string(path) {
            Ok(contents) => Self::parse(path, &contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                Self::default()
            }
            Err(e) => {
                return Err(HarnessError::Config {
                    path: path.to_path_buf(),
                    message: e.to_string(),
                })
            }
        };
        Ok(config)
    }

    fn parse(path: &Path, contents: &str) -> Result<Self, HarnessError> {
        let config: Self = toml::from_str(contents).map_err(|e| HarnessError::Config {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        config.validate(path)?;
        Ok(config)
    }

    /// Reject settings the scenarios cannot run with.
    pub fn validate(&self, path: &Path) -> Result<(), HarnessError> {
        let invalid = |message: String| HarnessError::Config {
            path: path.to_path_buf(),
            message,
        };

        if self.launcher.command.trim().is_empty() {
            return Err(invalid("launcher.command is empty".to_string()));
        }
        if self.log.max_attempts == 0 {
            return Err(invalid("log.max_attempts must be at least 1".to_string()));
        }
        if self.timing.poll_interval_ms == 0 {
            return Err(invalid(
                "timing.poll_interval_ms must be greater than 0".to_string(),
            ));
        }

        let patterns = [
            ("log.recovering", &self.log.recovering),
            ("log.artifact", &self.log.artifact),
            ("orphan.checkpoint", &self.orphan.checkpoint),
            ("orphan.reclaimed", &self.orphan.reclaimed),
            ("selftest.success", &self.selftest.success),
            ("selftest.progress", &self.selftest.progress),
        ];
        for (key, pattern) in patterns {
            LinePattern::new(pattern).map_err(|e| invalid(format!("{key}: {e}")))?;
        }
        Ok(())
    }
}
