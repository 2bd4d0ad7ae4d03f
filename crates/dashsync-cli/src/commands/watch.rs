//! Watch command handler

use anyhow::{anyhow, bail, Context, Result};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};

use dashsync_core::{
    filters_from_pairs, Config, ConnectionEvent, Filters, SyncCoordinator, SyncEvent,
};

use crate::output::Output;

/// Subscribe to `kind` and print updates until interrupted
///
/// Exits after `count` updates when given. Reconnects are handled by the
/// connection manager; the command only fails once reconnection gives up.
pub async fn run(
    config: &Config,
    kind: String,
    filter: Vec<String>,
    count: Option<usize>,
    output: &Output,
) -> Result<()> {
    let filters = filters_from_pairs(&filter).map_err(|e| anyhow!(e))?;
    let coordinator = SyncCoordinator::from_config(config)?;

    // Subscribe to events before connecting so nothing is missed
    let mut sync_events = coordinator.events();
    let mut connection_events = coordinator.connection().events();

    let result = watch(
        &coordinator,
        &kind,
        filters,
        count,
        &mut sync_events,
        &mut connection_events,
        output,
    )
    .await;

    let _ = coordinator.connection().disconnect().await;
    coordinator.shutdown();
    result
}

async fn watch(
    coordinator: &SyncCoordinator,
    kind: &str,
    filters: Filters,
    count: Option<usize>,
    sync_events: &mut broadcast::Receiver<SyncEvent>,
    connection_events: &mut broadcast::Receiver<ConnectionEvent>,
    output: &Output,
) -> Result<()> {
    let connection_id = coordinator
        .connection()
        .connect()
        .await
        .context("Failed to connect to sync server")?;
    debug!("Connected as {}", connection_id);

    coordinator
        .subscribe_to_data_type(kind, filters)
        .await
        .with_context(|| format!("Failed to subscribe to {}", kind))?;
    output.success(&format!("Watching {} updates (Ctrl-C to stop)", kind));

    if count == Some(0) {
        return Ok(());
    }

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut seen = 0usize;

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                debug!("Interrupted");
                return Ok(());
            }
            event = sync_events.recv() => match event {
                Ok(SyncEvent::DataUpdated { kind: updated, entry, has_conflict }) => {
                    if updated != kind {
                        continue;
                    }
                    output.print_update(&updated, &entry, has_conflict);
                    seen += 1;
                    if count.is_some_and(|limit| seen >= limit) {
                        return Ok(());
                    }
                }
                Ok(SyncEvent::StatusChanged(status)) => output.print_status(status),
                Ok(SyncEvent::Error(e)) => output.warn(&e.to_string()),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Dropped {} sync events", skipped);
                }
                Err(RecvError::Closed) => bail!("Sync engine stopped"),
            },
            event = connection_events.recv() => match event {
                Ok(ConnectionEvent::StateChanged { to, .. }) => output.print_connection(to, ""),
                Ok(ConnectionEvent::Reconnecting { attempt, delay }) => {
                    debug!("Reconnect attempt {} in {:?}", attempt, delay);
                }
                Ok(ConnectionEvent::ReconnectionFailed { attempts }) => {
                    bail!("Gave up reconnecting after {} attempts", attempts);
                }
                Ok(ConnectionEvent::Error(message)) => output.warn(&message),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Dropped {} connection events", skipped);
                }
                Err(RecvError::Closed) => bail!("Connection task stopped"),
            },
        }
    }
}
