use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::index::{IndexOutcome, Indexer};
use crate::store::Store;

/// Periodic catch-up: once immediately and then on every tick, re-run the
/// indexer over every stored channel. Reaching an already indexed video just
/// means the channel is caught up.
pub async fn run(indexer: Indexer, store: Store, interval: Duration, cancel: CancellationToken) {
    if let Err(err) = check_new_uploads(&indexer, &store).await {
        warn!("checking new uploads: {err:#}");
    }

    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await; // the first tick fires immediately

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {
                if let Err(err) = check_new_uploads(&indexer, &store).await {
                    warn!("checking new uploads: {err:#}");
                }
            }
        }
    }
}

async fn check_new_uploads(indexer: &Indexer, store: &Store) -> Result<()> {
    for channel in store.channels().await.context("retrieving channels")? {
        info!("⏰ checking new uploads for {:?} - {:?}", channel.id, channel.title);

        match indexer
            .index_channel(&channel)
            .await
            .with_context(|| format!("indexing channel {:?}", channel.title))?
        {
            IndexOutcome::CaughtUp => info!("caught up with {:?}", channel.title),
            IndexOutcome::Completed => info!("walked all of {:?}", channel.title),
            IndexOutcome::QuotaExhausted => {
                warn!("quota exhausted while checking {:?}, resume recorded", channel.title);
                // No point hitting the remaining channels with a spent quota.
                break;
            }
        }
    }

    Ok(())
}
