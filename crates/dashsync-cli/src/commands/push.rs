//! Push command handler

use anyhow::{bail, Context, Result};
use serde_json::Value;
use tracing::warn;

use dashsync_core::{Config, Submission, SyncCoordinator};

use crate::output::Output;

/// Send one change, falling back to the offline queue
pub async fn run(config: &Config, change_type: String, data: String, output: &Output) -> Result<()> {
    let data = parse_payload(&data)?;
    let coordinator = SyncCoordinator::from_config(config)?;

    if let Err(e) = coordinator.connection().connect().await {
        if !e.is_retryable() {
            coordinator.shutdown();
            return Err(e).context("Server rejected the connection");
        }
        warn!("Could not connect: {}", e);
        output.warn(&format!("Server unreachable ({}), change will be queued", e));
    }

    let result = coordinator.submit_change(&change_type, data).await;

    let _ = coordinator.connection().disconnect().await;
    coordinator.shutdown();

    match result.context("Failed to submit change")? {
        Submission::Sent => output.success(&format!("Sent {}", change_type)),
        Submission::Queued { queue_size } => {
            if !config.sync.persist_queue {
                bail!("Server unreachable and sync.persist_queue is off; change discarded");
            }
            output.success(&format!(
                "Queued {} ({} change(s) pending)",
                change_type, queue_size
            ));
        }
    }
    Ok(())
}

fn parse_payload(raw: &str) -> Result<Value> {
    let value: Value = serde_json::from_str(raw).context("Payload is not valid JSON")?;
    if !value.is_object() {
        bail!("Payload must be a JSON object");
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_payload() {
        let value = parse_payload(r#"{"id":"t1","status":"done"}"#).unwrap();
        assert_eq!(value["id"], "t1");

        assert!(parse_payload("not json").is_err());
        assert!(parse_payload("[1,2]").is_err());
    }
}
