//! Status and enable/disable handlers

use anyhow::{Context, Result};

use cloudsync_core::{Config, StatusStore, SyncStatus};

use crate::engine::open_status;
use crate::output::Output;

/// Show the persisted sync status
pub fn show(config: &Config, output: &Output) -> Result<()> {
    let status = open_status(config)?;
    let state = status.load().context("Failed to read sync status")?;
    output.print_status(&state);
    Ok(())
}

/// Switch the sync subscription on
pub fn enable(config: &Config, output: &Output) -> Result<()> {
    let status = open_status(config)?;
    status
        .update(&mut |s| {
            s.enabled = true;
            if s.status == SyncStatus::Paused {
                s.status = SyncStatus::Idle;
            }
        })
        .context("Failed to update sync status")?;

    output.success("Cloud sync enabled");
    if config.api_base_url.is_none() {
        output.message("Set a server with: cloudsync config set api_base_url <url>");
    }
    Ok(())
}

/// Switch the sync subscription off
pub fn disable(config: &Config, output: &Output) -> Result<()> {
    let status = open_status(config)?;
    status
        .update(&mut |s| {
            s.enabled = false;
            s.status = SyncStatus::Paused;
            s.next_pull_at = None;
        })
        .context("Failed to update sync status")?;

    output.success("Cloud sync disabled");
    Ok(())
}
