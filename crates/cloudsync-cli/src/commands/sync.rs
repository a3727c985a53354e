//! Sync command handlers

use anyhow::{bail, Context, Result};

use cloudsync_core::sync::{ManualSyncOutcome, StartOutcome, StopReason};
use cloudsync_core::{Config, EnvCredentials, StatusStore};

use crate::engine::Engine;
use crate::output::Output;

/// Pull remote changes, then push every local store
pub async fn sync(config: &Config, output: &Output) -> Result<()> {
    let engine = Engine::open(config)?;
    ensure_enabled(&engine)?;

    output.message("Syncing with server...");

    let outcome = match engine.orchestrator.trigger_manual_sync().await {
        Ok(outcome) => outcome,
        Err(e) => {
            output.message(&format!("Sync failed: {}", e));
            return Err(e).context("Manual sync failed");
        }
    };

    if output.is_json() {
        println!("{}", outcome_json(&outcome));
        return Ok(());
    }

    output.success("Sync complete");
    output.message(&format!(
        "  Pulled: {} item(s) applied, cursor {}",
        outcome.pull.applied, outcome.pull.cursor
    ));
    output.message(&format!(
        "  Pushed: {} store(s), {} blob(s), {} deletion(s)",
        outcome.push.upserts, outcome.push.blobs_uploaded, outcome.push.deletes
    ));
    if outcome.push.conflicts > 0 {
        output.message(&format!(
            "  {} conflict(s) reported; remote state was pulled again",
            outcome.push.conflicts
        ));
    }
    Ok(())
}

/// Keep auto-sync running until Ctrl-C, then flush
pub async fn run(config: &Config, output: &Output) -> Result<()> {
    let engine = Engine::open(config)?;

    let started = engine
        .orchestrator
        .start_auto_sync()
        .await
        .context("Failed to start cloud sync")?;

    match started {
        StartOutcome::Started | StartOutcome::AlreadyRunning => {}
        StartOutcome::Disabled => {
            bail!("Cloud sync is disabled. Enable it with:\n  cloudsync enable");
        }
        StartOutcome::MissingCredentials => {
            bail!(
                "Missing credentials. Export {} and make sure a device id is set \
                 (cloudsync init).",
                EnvCredentials::TOKEN_VAR
            );
        }
    }

    output.message("Cloud sync running. Press Ctrl-C to stop.");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    output.message("Flushing local changes...");
    if let Err(e) = engine.orchestrator.flush_before_shutdown().await {
        tracing::warn!(error = %e, "Shutdown flush did not complete");
        output.message(&format!("Flush did not complete: {}", e));
    }
    engine.orchestrator.stop_auto_sync(StopReason::Shutdown);

    output.success("Cloud sync stopped");
    Ok(())
}

fn ensure_enabled(engine: &Engine) -> Result<()> {
    let state = engine
        .status
        .load()
        .context("Failed to read sync status")?;
    if !state.enabled {
        bail!("Cloud sync is disabled. Enable it with:\n  cloudsync enable");
    }
    Ok(())
}

fn outcome_json(outcome: &ManualSyncOutcome) -> serde_json::Value {
    serde_json::json!({
        "pull": {
            "pages": outcome.pull.pages,
            "applied": outcome.pull.applied,
            "cursor": outcome.pull.cursor,
        },
        "push": {
            "upserts": outcome.push.upserts,
            "deletes": outcome.push.deletes,
            "blobs_uploaded": outcome.push.blobs_uploaded,
            "ack_cursor": outcome.push.ack_cursor,
            "conflicts": outcome.push.conflicts,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloudsync_core::sync::{PullOutcome, PushOutcome};

    #[test]
    fn test_outcome_json() {
        let outcome = ManualSyncOutcome {
            pull: PullOutcome {
                pages: 1,
                applied: 2,
                cursor: 9,
            },
            push: PushOutcome {
                upserts: 3,
                ack_cursor: Some(12),
                ..PushOutcome::default()
            },
        };
        let value = outcome_json(&outcome);
        assert_eq!(value["pull"]["cursor"], 9);
        assert_eq!(value["push"]["upserts"], 3);
        assert_eq!(value["push"]["ack_cursor"], 12);
    }
}
