/// Single target session: spawn the launcher with a piped control channel,
/// capture its merged stdout+stderr, match lines, and stop it.
use crate::config::HarnessConfig;
use crate::error::{FailReason, HarnessError};
use crate::matcher::{self, LinePattern, MatchResult};
use crate::output::OutputBuffer;
use crate::prepare;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::os::fd::OwnedFd;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::pipe;
use tokio::process::{Child, ChildStdin, Command};

/// Upper bound on bytes taken from the output channel per read.
pub const READ_CHUNK: usize = 4096;

/// One live launcher process and everything captured from it.
pub struct Session {
    child: Child,
    pid: u32,
    stdin: ChildStdin,
    stdout: pipe::Receiver,
    output: OutputBuffer,
    /// Highest line index already echoed to the operator.
    echoed: Option<usize>,
    read_wait: Duration,
    stop_grace: Duration,
    diagnostics: PathBuf,
}

impl Session {
    /// Launch the target, optionally rebuilding it and resetting its state first.
    ///
    /// Returns after the configured warm-up interval. There is no readiness
    /// handshake, so callers must not write before this returns.
    pub async fn start(config: &HarnessConfig, reset: bool) -> Result<Session, HarnessError> {
        if reset {
            let built = prepare::build_target(&config.build).await;
            let state_reset = prepare::reset_state(&config.reset).await;
            if !(built && state_reset) {
                tracing::warn!(built, state_reset, "starting target without a clean build and state");
            }
        }

        let launcher = &config.launcher;
        let command_line = std::iter::once(launcher.command.as_str())
            .chain(launcher.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ");
        let spawn_err = |e: std::io::Error| HarnessError::Spawn {
            command: command_line.clone(),
            source: e,
        };

        // stdout and stderr share one pipe so lines keep their emission order.
        let (reader, writer) = std::io::pipe().map_err(spawn_err)?;
        let writer_err = writer.try_clone().map_err(spawn_err)?;

        let mut command = Command::new(&launcher.command);
        command
            .args(&launcher.args)
            .stdin(Stdio::piped())
            .stdout(writer)
            .stderr(writer_err)
            .kill_on_drop(true);
        let spawned = command.spawn();
        // Drop our copies of the write end so EOF is observable.
        drop(command);
        let mut child = spawned.map_err(spawn_err)?;

        let pid = child.id().ok_or_else(|| HarnessError::Io {
            context: "reading launcher pid",
            source: std::io::Error::other("launcher exited before it was observed"),
        })?;
        let stdin = child.stdin.take().ok_or_else(|| HarnessError::Io {
            context: "opening control channel",
            source: std::io::Error::other("launcher stdin was not piped"),
        })?;
        let stdout = pipe::Receiver::from_file(std::fs::File::from(OwnedFd::from(reader)))
            .map_err(|e| HarnessError::Io {
                context: "opening output channel",
                source: e,
            })?;

        tracing::info!(pid, command = %command_line, reset, "launcher started");

        tokio::time::sleep(Duration::from_millis(launcher.warmup_ms)).await;

        Ok(Session {
            child,
            pid,
            stdin,
            stdout,
            output: OutputBuffer::new(),
            echoed: None,
            read_wait: config.timing.read_wait(),
            stop_grace: Duration::from_millis(launcher.stop_grace_ms),
            diagnostics: config.output.diagnostics.clone(),
        })
    }

    /// Pid of the launcher process (not the target it runs).
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Everything captured so far.
    #[cfg(test)]
    pub fn output(&self) -> &OutputBuffer {
        &self.output
    }

    /// Write the full payload to the control channel and flush it.
    pub async fn write(&mut self, input: impl AsRef<[u8]>) -> Result<(), HarnessError> {
        let bytes = input.as_ref();
        let io_err = |e| HarnessError::Io {
            context: "writing to control channel",
            source: e,
        };
        self.stdin.write_all(bytes).await.map_err(io_err)?;
        self.stdin.flush().await.map_err(io_err)?;
        tracing::debug!(pid = self.pid, bytes = bytes.len(), "wrote to target");
        Ok(())
    }

    /// One bounded read from the output channel.
    ///
    /// Takes whatever arrives within the read window, up to `READ_CHUNK`
    /// bytes. Nothing arriving (or EOF) is not an error and yields 0.
    pub async fn read(&mut self) -> Result<usize, HarnessError> {
        let mut chunk = [0u8; READ_CHUNK];
        match tokio::time::timeout(self.read_wait, self.stdout.read(&mut chunk)).await {
            Err(_) => Ok(0),
            Ok(Ok(n)) => {
                self.output.extend(&chunk[..n]);
                Ok(n)
            }
            Ok(Err(e)) => Err(HarnessError::Io {
                context: "reading target output",
                source: e,
            }),
        }
    }

    /// Current decoded lines.
    #[cfg(test)]
    pub fn lines(&self) -> Vec<&str> {
        self.output.lines()
    }

    /// Latest line matching any pattern, or None. Newly matched lines are
    /// echoed to stdout once each, but only after their newline has arrived.
    pub fn find(&mut self, patterns: &[LinePattern]) -> Option<MatchResult> {
        let lines = self.output.lines();
        let complete = self.output.complete_lines();
        for hit in matcher::find_all(&lines[..complete], patterns) {
            if self.echoed.is_none_or(|seen| hit.index > seen) {
                println!("{}", hit.line);
                self.echoed = Some(hit.index);
            }
        }
        matcher::find_latest(&lines, patterns)
    }

    /// Like `find`, but a miss enters the Fail terminal condition.
    pub async fn expect(&mut self, patterns: &[LinePattern]) -> Result<MatchResult, HarnessError> {
        match self.find(patterns) {
            Some(hit) => Ok(hit),
            None => Err(self
                .fail(FailReason::NoMatch {
                    patterns: matcher::describe(patterns),
                })
                .await),
        }
    }

    /// Enter the Fail terminal condition: persist everything captured, stop
    /// the launcher, and hand back the error that ends the run.
    pub async fn fail(&mut self, reason: FailReason) -> HarnessError {
        println!("FAIL: {reason}");
        self.save_output();
        self.stop().await;
        HarnessError::Fail { reason }
    }

    /// Close out a session whose work produced `result`.
    ///
    /// A Fail has already saved diagnostics and stopped the launcher. Any
    /// other error does both here before being passed on, and success stops
    /// the launcher normally.
    pub async fn finish<T>(&mut self, result: Result<T, HarnessError>) -> Result<T, HarnessError> {
        match result {
            Err(e) if e.is_fail() => Err(e),
            Err(e) => {
                tracing::error!(pid = self.pid, error = %e, "session aborted");
                self.save_output();
                self.stop().await;
                Err(e)
            }
            Ok(value) => {
                self.stop().await;
                Ok(value)
            }
        }
    }

    /// Write the decoded output to the diagnostics file.
    ///
    /// A write failure is logged, never raised, so it cannot mask the failure
    /// being diagnosed.
    pub fn save_output(&self) {
        match std::fs::write(&self.diagnostics, self.output.text()) {
            Ok(()) => tracing::info!(
                path = %self.diagnostics.display(),
                bytes = self.output.len(),
                "saved target output"
            ),
            Err(e) => tracing::error!(
                path = %self.diagnostics.display(),
                error = %e,
                "failed to save target output"
            ),
        }
    }

    /// Whether the launcher process is still alive (reaps it if not).
    pub fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Ask the launcher to shut down with SIGTERM and reap it.
    ///
    /// This is the graceful path. If the launcher is still alive after the
    /// grace period it is killed outright.
    pub async fn stop(&mut self) {
        if !self.is_running() {
            tracing::debug!(pid = self.pid, "launcher already exited");
            return;
        }

        match kill(Pid::from_raw(self.pid as i32), Signal::SIGTERM) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => tracing::warn!(pid = self.pid, error = %e, "failed to send SIGTERM"),
        }

        match tokio::time::timeout(self.stop_grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!(pid = self.pid, exit_code = ?status.code(), "launcher stopped")
            }
            Ok(Err(e)) => tracing::warn!(pid = self.pid, error = %e, "failed to reap launcher"),
            Err(_) => {
                tracing::warn!(
                    pid = self.pid,
                    grace_ms = self.stop_grace.as_millis() as u64,
                    "launcher ignored SIGTERM, killing"
                );
                if let Err(e) = self.child.kill().await {
                    tracing::warn!(pid = self.pid, error = %e, "failed to kill launcher");
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Config for a launcher that runs `sh -c <script>` with short timings.
    pub(crate) fn sh_config(dir: &std::path::Path, script: &str) -> HarnessConfig {
        let mut config = HarnessConfig::default();
        config.launcher.command = "sh".to_string();
        config.launcher.args = vec!["-c".to_string(), script.to_string()];
        config.launcher.warmup_ms = 50;
        config.launcher.stop_grace_ms = 1000;
        config.build.command = vec![];
        config.reset.remove = vec![];
        config.reset.command = vec![];
        config.timing.read_wait_ms = 50;
        config.output.diagnostics = dir.join("diagnostics.out");
        config
    }

    /// Read until `pattern` matches or about two seconds pass.
    pub(crate) async fn read_until(session: &mut Session, pattern: &str) -> bool {
        let patterns = matcher::compile(&[pattern]).unwrap();
        for _ in 0..40 {
            session.read().await.unwrap();
            if matcher::find_latest(&session.lines(), &patterns).is_some() {
                return true;
            }
        }
        false
    }

    #[tokio::test]
    async fn test_write_reaches_target() {
        let dir = tempfile::tempdir().unwrap();
        let config = sh_config(dir.path(), "exec cat");
        let mut session = Session::start(&config, false).await.unwrap();
        assert!(session.pid() > 0);

        session.write("hello target\n").await.unwrap();
        assert!(read_until(&mut session, "hello target").await);

        session.write(b"second\n".to_vec()).await.unwrap();
        assert!(read_until(&mut session, "second").await);
        assert_eq!(session.lines(), vec!["hello target", "second"]);

        session.stop().await;
        assert!(!session.is_running());
    }

    #[tokio::test]
    async fn test_stderr_is_merged_into_output() {
        let dir = tempfile::tempdir().unwrap();
        let config = sh_config(dir.path(), "echo to-stdout; echo to-stderr >&2; sleep 5");
        let mut session = Session::start(&config, false).await.unwrap();

        assert!(read_until(&mut session, "to-stderr").await);
        let text = session.output().text().to_string();
        assert!(text.contains("to-stdout"));
        assert!(text.find("to-stdout") < text.find("to-stderr"));
        session.stop().await;
    }

    #[tokio::test]
    async fn test_read_without_output_returns_zero() {
        let dir = tempfile::tempdir().unwrap();
        let config = sh_config(dir.path(), "sleep 5");
        let mut session = Session::start(&config, false).await.unwrap();

        let started = std::time::Instant::now();
        assert_eq!(session.read().await.unwrap(), 0);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(session.output().is_empty());
        session.stop().await;
    }

    #[tokio::test]
    async fn test_read_after_exit_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = sh_config(dir.path(), "echo bye");
        let mut session = Session::start(&config, false).await.unwrap();

        assert!(read_until(&mut session, "bye").await);
        assert_eq!(session.read().await.unwrap(), 0);
        session.stop().await;
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = sh_config(dir.path(), "");
        config.launcher.command = "nonexistent-binary-xyz".to_string();
        config.launcher.args = vec![];

        let err = Session::start(&config, false).await.err().unwrap();
        assert!(matches!(err, HarnessError::Spawn { .. }));
        assert!(err.to_string().contains("nonexistent-binary-xyz"));
    }

    #[tokio::test]
    async fn test_start_with_reset_survives_failing_collaborators() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = sh_config(dir.path(), "echo booted; sleep 5");
        config.build.command = vec!["false".to_string()];
        config.reset.command = vec!["false".to_string()];

        let mut session = Session::start(&config, true).await.unwrap();
        assert!(read_until(&mut session, "booted").await);
        session.stop().await;
    }

    #[tokio::test]
    async fn test_expect_miss_saves_diagnostics_and_stops() {
        let dir = tempfile::tempdir().unwrap();
        let config = sh_config(dir.path(), "echo init: starting sh; sleep 30");
        let mut session = Session::start(&config, false).await.unwrap();
        assert!(read_until(&mut session, "init").await);

        let patterns = matcher::compile(&["^ireclaim"]).unwrap();
        let err = session.expect(&patterns).await.unwrap_err();
        assert!(err.is_fail());
        assert!(!session.is_running());

        let saved = std::fs::read_to_string(dir.path().join("diagnostics.out")).unwrap();
        assert_eq!(saved, "init: starting sh\n");
    }

    #[tokio::test]
    async fn test_expect_returns_latest_match() {
        let dir = tempfile::tempdir().unwrap();
        let config = sh_config(dir.path(), "echo wait 1; echo other; echo wait 2; sleep 5");
        let mut session = Session::start(&config, false).await.unwrap();
        assert!(read_until(&mut session, "wait 2").await);

        let patterns = matcher::compile(&["wait"]).unwrap();
        let hit = session.expect(&patterns).await.unwrap();
        assert_eq!(hit.index, 2);
        assert_eq!(hit.line, "wait 2");
        // Repeated lookups see the same result.
        assert_eq!(session.find(&patterns), Some(hit));
        session.stop().await;
    }

    #[tokio::test]
    async fn test_partial_line_is_echoed_once_complete() {
        let dir = tempfile::tempdir().unwrap();
        let config = sh_config(dir.path(), "printf 'test foo: O'; sleep 0.5; echo K; sleep 5");
        let mut session = Session::start(&config, false).await.unwrap();
        assert!(read_until(&mut session, "test foo: O").await);

        let patterns = matcher::compile(&["test"]).unwrap();
        let partial = session.find(&patterns).unwrap();
        assert_eq!(partial.line, "test foo: O");
        assert_eq!(session.echoed, None);

        assert!(read_until(&mut session, "test foo: OK").await);
        let done = session.find(&patterns).unwrap();
        assert_eq!(done.index, partial.index);
        assert_eq!(session.echoed, Some(done.index));
        session.stop().await;
    }

    #[tokio::test]
    async fn test_finish_on_harness_error_saves_output_and_stops() {
        let dir = tempfile::tempdir().unwrap();
        let config = sh_config(dir.path(), "echo half booted; sleep 30");
        let mut session = Session::start(&config, false).await.unwrap();
        assert!(read_until(&mut session, "half booted").await);

        let aborted: Result<(), HarnessError> = Err(HarnessError::Io {
            context: "reading target output",
            source: std::io::Error::other("broken channel"),
        });
        let err = session.finish(aborted).await.unwrap_err();
        assert!(!err.is_fail());
        assert!(!session.is_running());
        let saved = std::fs::read_to_string(dir.path().join("diagnostics.out")).unwrap();
        assert_eq!(saved, "half booted\n");
    }

    #[tokio::test]
    async fn test_finish_on_success_stops_without_diagnostics() {
        let dir = tempfile::tempdir().unwrap();
        let config = sh_config(dir.path(), "sleep 30");
        let mut session = Session::start(&config, false).await.unwrap();

        assert_eq!(session.finish(Ok(7)).await.unwrap(), 7);
        assert!(!session.is_running());
        assert!(!dir.path().join("diagnostics.out").exists());
    }

    #[tokio::test]
    async fn test_stop_kills_launcher_ignoring_sigterm() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = sh_config(dir.path(), "trap '' TERM; echo armed; while :; do sleep 1; done");
        config.launcher.stop_grace_ms = 200;
        let mut session = Session::start(&config, false).await.unwrap();
        assert!(read_until(&mut session, "armed").await);

        session.stop().await;
        assert!(!session.is_running());
    }

    #[tokio::test]
    async fn test_stop_twice_is_harmless() {
        let dir = tempfile::tempdir().unwrap();
        let config = sh_config(dir.path(), "sleep 5");
        let mut session = Session::start(&config, false).await.unwrap();
        session.stop().await;
        session.stop().await;
        assert!(!session.is_running());
    }
}
