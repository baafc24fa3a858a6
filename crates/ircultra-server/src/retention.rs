use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use ircultra_store::Store;

/// Background task that tombstones expired messages.
///
/// Runs once on start (the interval's first tick is immediate), then every
/// six hours. Tombstoned rows stay findable by id for audit but drop out
/// of history, search and replay.
pub async fn run_retention_loop(store: Arc<Store>, retention_days: i64) {
    let mut interval = tokio::time::interval(Duration::from_secs(6 * 60 * 60));

    loop {
        interval.tick().await;
        let swept = store.run_retention_cleanup(retention_days);
        if swept > 0 {
            info!(
                "Retention sweep tombstoned {} messages older than {} days",
                swept, retention_days
            );
        }
    }
}
