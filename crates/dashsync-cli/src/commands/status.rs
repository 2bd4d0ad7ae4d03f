//! Status command handler

use anyhow::Result;

use dashsync_core::sync::{OfflineQueue, SyncState};
use dashsync_core::Config;

use crate::output::{Output, OutputFormat};

/// Show local sync state without contacting the server
pub fn show(config: &Config, output: &Output) -> Result<()> {
    let last_sync = SyncState::with_path(config.sync_state_path())?.last_sync();

    let queued = OfflineQueue::persisted_len(&config.offline_queue_path())?;

    match output.format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({
                    "server_url": config.server_url,
                    "data_dir": config.data_dir,
                    "last_sync": last_sync,
                    "queued_changes": queued,
                    "persist_queue": config.sync.persist_queue,
                })
            );
        }
        OutputFormat::Quiet => {
            println!("{}", queued);
        }
        OutputFormat::Human => {
            println!("dashsync Status");
            println!("===============");
            println!();
            println!(
                "  Server:    {}",
                config.server_url.as_deref().unwrap_or("(not set)")
            );
            println!("  Data dir:  {}", config.data_dir.display());
            println!(
                "  Last sync: {}",
                last_sync
                    .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
                    .unwrap_or_else(|| "never".to_string())
            );
            println!("  Queued:    {} change(s)", queued);
            if !config.sync.persist_queue {
                println!("  (offline queue is in-memory only)");
            }
        }
    }

    Ok(())
}
