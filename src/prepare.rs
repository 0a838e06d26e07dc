/// External collaborators run before a fresh session: build the target binary
/// and recreate the backing filesystem image.
///
/// Failures here are logged and swallowed. The harness carries on against
/// whatever binary and image already exist.
use crate::config::{BuildConfig, ResetConfig};
use tokio::process::Command;

/// Run an argv-style command and report whether it succeeded.
async fn run_step(argv: &[String], label: &str) -> Result<(), String> {
    let Some((program, args)) = argv.split_first() else {
        return Err(format!("{label} command is empty"));
    };
    let status = Command::new(program)
        .args(args)
        .status()
        .await
        .map_err(|e| format!("Failed to run {label} ({}): {e}", argv.join(" ")))?;
    if !status.success() {
        return Err(match status.code() {
            Some(code) => format!("{label} failed with exit code {code}"),
            None => format!("{label} was killed by a signal"),
        });
    }
    Ok(())
}

/// Compile the target. Returns false (after logging) on failure.
pub async fn build_target(config: &BuildConfig) -> bool {
    if config.command.is_empty() {
        tracing::debug!("no build command configured, skipping build");
        return true;
    }
    tracing::info!(command = %config.command.join(" "), "building target");
    match run_step(&config.command, "build").await {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(error = %e, "build failed, continuing with existing binary");
            false
        }
    }
}

/// Delete the configured state files and regenerate them.
/// Returns false (after logging) if any step failed.
pub async fn reset_state(config: &ResetConfig) -> bool {
    let mut ok = true;
    for path in &config.remove {
        match std::fs::remove_file(path) {
            Ok(()) => tracing::debug!(path = %path.display(), "removed state file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "state file already absent");
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to remove state file");
                ok = false;
            }
        }
    }

    if config.command.is_empty() {
        return ok;
    }
    tracing::info!(command = %config.command.join(" "), "recreating target state");
    if let Err(e) = run_step(&config.command, "reset").await {
        tracing::warn!(error = %e, "state reset failed, continuing with existing image");
        ok = false;
    }
    ok
}
