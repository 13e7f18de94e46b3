use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::engine::Engine;

const CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Background task that compacts the WAL once `threshold` events have been
/// appended since the last compaction.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(CHECK_INTERVAL);
    loop {
        interval.tick().await;
        compact_if_due(&engine, threshold).await;
    }
}

/// One compactor pass. Returns whether a compaction ran.
pub async fn compact_if_due(engine: &Engine, threshold: u64) -> bool {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        return false;
    }
    match engine.compact_wal().await {
        Ok(()) => {
            info!("compacted WAL after {appends} appends");
            true
        }
        Err(e) => {
            warn!("WAL compaction failed: {e}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::model::MINUTE_MS;
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotbook_test_compactor");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn compacts_only_past_threshold() {
        let path = test_wal_path("threshold.wal");
        let engine = Engine::new(path.clone(), EngineConfig::default()).unwrap();

        let item = Ulid::new();
        engine.create_item(item, "Room".into()).await.unwrap();
        let slot = Ulid::new();
        engine.create_slot(slot, item, 0, 60 * MINUTE_MS).await.unwrap();
        let user = Ulid::new();
        for _ in 0..5 {
            let b = engine.book(slot, user).await.unwrap();
            engine.cancel(b, user).await.unwrap();
        }
        assert_eq!(engine.wal_appends_since_compact().await, 12);

        assert!(!compact_if_due(&engine, 100).await);
        assert!(compact_if_due(&engine, 10).await);
        assert_eq!(engine.wal_appends_since_compact().await, 0);

        // item + slot survive, the booking churn does not
        let replayed = crate::wal::Wal::replay(&path).unwrap();
        assert_eq!(replayed.len(), 2);
    }
}
