/// Static, ordered registry of named scenarios and selector resolution.
use regex::Regex;

/// What a registry entry runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScenarioKind {
    /// Crash mid write-ahead-log stress, check replay (retried).
    LogRecovery,
    /// Crash while an unlinked file is still open, check reclamation.
    FileOrphan,
    /// Crash while an unlinked directory is still open, check reclamation.
    DirOrphan,
    /// LogRecovery, FileOrphan and DirOrphan in sequence.
    AllCrashes,
    /// The full self-test suite.
    SelfTest,
}

#[derive(Debug, PartialEq, Eq)]
pub struct ScenarioEntry {
    pub name: &'static str,
    pub description: &'static str,
    pub kind: ScenarioKind,
}

/// Every scenario, in the order matches run.
pub const REGISTRY: &[ScenarioEntry] = &[
    ScenarioEntry {
        name: "log",
        description: "crash during log stress, expect log replay on reboot",
        kind: ScenarioKind::LogRecovery,
    },
    ScenarioEntry {
        name: "forphan",
        description: "crash holding an unlinked file, expect inode reclaim",
        kind: ScenarioKind::FileOrphan,
    },
    ScenarioEntry {
        name: "dorphan",
        description: "crash holding an unlinked directory, expect inode reclaim",
        kind: ScenarioKind::DirOrphan,
    },
    ScenarioEntry {
        name: "crash",
        description: "log, forphan and dorphan in sequence",
        kind: ScenarioKind::AllCrashes,
    },
    ScenarioEntry {
        name: "usertests",
        description: "full self-test suite",
        kind: ScenarioKind::SelfTest,
    },
];

/// What a selector resolved to.
#[derive(Debug, PartialEq, Eq)]
pub enum Selection<'a> {
    /// One or more registered scenarios, in registry order.
    Scenarios(Vec<&'a ScenarioEntry>),
    /// No scenario matched: run the self-test scoped to this name.
    SelfTest { subset: String },
}

/// Compile a selector as an unanchored regex, falling back to a literal
/// substring when it is not valid regex syntax.
fn selector_regex(selector: &str) -> Regex {
    Regex::new(selector).unwrap_or_else(|e| {
        tracing::debug!(selector, error = %e, "selector is not a regex, matching literally");
        Regex::new(&regex::escape(selector)).expect("escaped selector is a valid regex")
    })
}

/// Resolve `selector` against `registry`.
pub fn select_from<'a>(registry: &'a [ScenarioEntry], selector: &str) -> Selection<'a> {
    let rex = selector_regex(selector);
    let matches: Vec<&ScenarioEntry> = registry.iter().filter(|e| rex.is_match(e.name)).collect();
    if matches.is_empty() {
        Selection::SelfTest {
            subset: selector.to_string(),
        }
    } else {
        Selection::Scenarios(matches)
    }
}

/// Resolve `selector` against the built-in registry.
pub fn select(selector: &str) -> Selection<'static> {
    select_from(REGISTRY, selector)
}
