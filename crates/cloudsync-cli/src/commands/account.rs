//! Quota and key-management handlers

use anyhow::{Context, Result};
use serde_json::Value;

use cloudsync_core::sync::wire::QuotaDelta;
use cloudsync_core::Config;

use crate::engine::{credentials, session_client};
use crate::output::Output;

/// Show account quotas, or check a prospective change against them
pub async fn quotas(config: &Config, delta: Option<QuotaDelta>, output: &Output) -> Result<()> {
    let session = session_client(config, credentials(config))?;
    let value = match delta {
        Some(delta) => session
            .validate_quotas(delta)
            .await
            .context("Quota validation failed")?,
        None => session.get_quotas().await.context("Failed to fetch quotas")?,
    };
    output.print_value(&value);
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAction {
    Register,
    Rotate,
}

/// Forward a key registration or rotation body to the server
pub async fn keys(config: &Config, action: KeyAction, body: &str, output: &Output) -> Result<()> {
    let body: Value = serde_json::from_str(body).context("Key body must be a JSON object")?;
    let session = session_client(config, credentials(config))?;

    let value = match action {
        KeyAction::Register => session
            .register_key(body)
            .await
            .context("Key registration failed")?,
        KeyAction::Rotate => session
            .rotate_key(body)
            .await
            .context("Key rotation failed")?,
    };
    output.print_value(&value);
    Ok(())
}
