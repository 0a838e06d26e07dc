/// Crash injection: find the real target under the launcher and SIGKILL it.
///
/// The launcher is a thin wrapper (e.g. `make qemu`), so the emulator runs as
/// its direct child. SIGKILL cannot be caught, so the target gets no chance to
/// run any shutdown path, which is the point.
use crate::error::{FailReason, HarnessError};
use crate::session::Session;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::path::PathBuf;

/// Lists direct children of a process.
pub trait ProcessTable: Send + Sync {
    /// Pids whose parent is `pid`, in ascending order.
    fn children(&self, pid: u32) -> std::io::Result<Vec<u32>>;
}

/// Reads parent pids from `/proc/<pid>/stat`.
pub struct ProcFs {
    root: PathBuf,
}

impl ProcFs {
    pub fn new() -> Self {
        Self::with_root("/proc")
    }

    /// Scan a procfs mounted (or faked) somewhere other than `/proc`.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl Default for ProcFs {
    fn default() -> Self {
        Self::new()
    }
}

/// Extract the parent pid from the contents of a `/proc/<pid>/stat` file.
///
/// The command name sits in parentheses and may itself contain spaces or
/// parentheses, so fields are counted from the last `)`.
fn parse_ppid(stat: &str) -> Option<u32> {
    let after_comm = &stat[stat.rfind(')')? + 1..];
    let mut fields = after_comm.split_whitespace();
    let _state = fields.next()?;
    fields.next()?.parse().ok()
}

impl ProcessTable for ProcFs {
    fn children(&self, pid: u32) -> std::io::Result<Vec<u32>> {
        let mut kids = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let Ok(entry) = entry else { continue };
            let Some(candidate) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<u32>().ok())
            else {
                continue;
            };
            // Processes may exit between listing and reading.
            let Ok(stat) = std::fs::read_to_string(entry.path().join("stat")) else {
                continue;
            };
            if parse_ppid(&stat) == Some(pid) {
                kids.push(candidate);
            }
        }
        kids.sort_unstable();
        Ok(kids)
    }
}

/// Delivers the uncatchable kill to a session's target process.
pub struct CrashInjector {
    table: Box<dyn ProcessTable>,
}

impl CrashInjector {
    pub fn new(table: Box<dyn ProcessTable>) -> Self {
        Self { table }
    }

    /// SIGKILL the launcher's child. Returns the pid that was killed.
    ///
    /// A launcher without children is a HardFail: the harness is not driving
    /// the process tree it thinks it is.
    pub async fn crash(&self, session: &mut Session) -> Result<u32, HarnessError> {
        let launcher = session.pid();
        let kids = self
            .table
            .children(launcher)
            .map_err(|e| HarnessError::ProcessTable { source: e })?;

        let Some(&target) = kids.first() else {
            println!("no qemu");
            return Err(session.fail(FailReason::NoChild { pid: launcher }).await);
        };
        if kids.len() > 1 {
            tracing::warn!(launcher, children = ?kids, "launcher has several children, killing the first");
        }

        println!("kill {target}");
        kill(Pid::from_raw(target as i32), Signal::SIGKILL).map_err(|e| HarnessError::Signal {
            pid: target as i32,
            source: e,
        })?;
        tracing::info!(launcher, target, "crash injected");
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::tests::{read_until, sh_config};
    use std::process::Command;

    struct FixedTable(Vec<u32>);

    impl ProcessTable for FixedTable {
        fn children(&self, _pid: u32) -> std::io::Result<Vec<u32>> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn test_parse_ppid_simple() {
        let stat = "4242 (qemu-system-ris) S 4200 4200 31 34816 4200 4194560 1 0";
        assert_eq!(parse_ppid(stat), Some(4200));
    }

    #[test]
    fn test_parse_ppid_comm_with_spaces_and_parens() {
        let stat = "77 (weird) name (x)) R 12 77 77 0 -1";
        assert_eq!(parse_ppid(stat), Some(12));
    }

    #[test]
    fn test_parse_ppid_garbage() {
        assert_eq!(parse_ppid(""), None);
        assert_eq!(parse_ppid("12 (sh)"), None);
        assert_eq!(parse_ppid("12 (sh) S notanumber"), None);
    }

    #[test]
    fn test_procfs_scan_of_fake_root() {
        let dir = tempfile::tempdir().unwrap();
        let entries = [
            ("1", "1 (init) S 0 1 1 0 -1"),
            ("200", "200 (make) S 1 200 200 0 -1"),
            ("215", "215 (qemu-system-riscv64) S 200 200 200 0 -1"),
            ("230", "230 (sh) S 215 200 200 0 -1"),
            ("201", "201 (make) S 200 200 200 0 -1"),
        ];
        for (pid, stat) in entries {
            std::fs::create_dir(dir.path().join(pid)).unwrap();
            std::fs::write(dir.path().join(pid).join("stat"), stat).unwrap();
        }
        // Non-pid entries and pid dirs without stat are skipped.
        std::fs::create_dir(dir.path().join("self")).unwrap();
        std::fs::create_dir(dir.path().join("999")).unwrap();

        let table = ProcFs::with_root(dir.path());
        assert_eq!(table.children(200).unwrap(), vec![201, 215]);
        assert_eq!(table.children(215).unwrap(), vec![230]);
        assert!(table.children(230).unwrap().is_empty());
    }

    #[test]
    fn test_procfs_missing_root_is_error() {
        let table = ProcFs::with_root("/nonexistent-proc-root");
        assert!(table.children(1).is_err());
    }

    #[test]
    fn test_procfs_finds_direct_child() {
        let mut parent = Command::new("sh")
            .args(["-c", "sleep 30; true"])
            .spawn()
            .unwrap();
        let table = ProcFs::new();

        let mut kids = Vec::new();
        for _ in 0..50 {
            kids = table.children(parent.id()).unwrap();
            if !kids.is_empty() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
        assert_eq!(kids.len(), 1);

        for pid in kids {
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
        }
        let _ = parent.kill();
        let _ = parent.wait();
    }

    #[test]
    fn test_procfs_childless_process() {
        let mut lone = Command::new("sleep").arg("30").spawn().unwrap();
        let kids = ProcFs::new().children(lone.id()).unwrap();
        assert!(kids.is_empty());
        let _ = lone.kill();
        let _ = lone.wait();
    }

    #[tokio::test]
    async fn test_crash_kills_child_not_launcher() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = sh_config(dir.path(), "sleep 30; echo launcher survived; sleep 30");
        config.launcher.warmup_ms = 300;
        let mut session = Session::start(&config, false).await.unwrap();

        let injector = CrashInjector::new(Box::new(ProcFs::new()));
        let killed = injector.crash(&mut session).await.unwrap();
        assert_ne!(killed, session.pid());

        // The wrapper outlives its killed child and moves on.
        assert!(read_until(&mut session, "launcher survived").await);
        assert!(session.is_running());
        session.stop().await;
    }

    #[tokio::test]
    async fn test_crash_without_child_is_hard_fail() {
        let dir = tempfile::tempdir().unwrap();
        let config = sh_config(dir.path(), "echo booting; sleep 30");
        let mut session = Session::start(&config, false).await.unwrap();
        assert!(read_until(&mut session, "booting").await);

        let injector = CrashInjector::new(Box::new(FixedTable(vec![])));
        let err = injector.crash(&mut session).await.unwrap_err();
        assert!(matches!(
            err,
            HarnessError::Fail {
                reason: FailReason::NoChild { .. }
            }
        ));
        assert!(!session.is_running());
        assert!(dir.path().join("diagnostics.out").exists());
    }
}
