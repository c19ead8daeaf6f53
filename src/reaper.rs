use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::{Engine, now_ms};
use crate::observability;

/// Background task that moves lapsed invitations to expired.
pub async fn run_reaper(engine: Arc<Engine>) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));
    loop {
        interval.tick().await;
        reap_expired_invitations(&engine).await;
    }
}

/// One reaper pass. Returns how many invitations were expired.
pub async fn reap_expired_invitations(engine: &Engine) -> usize {
    let mut reaped = 0;
    for id in engine.collect_expired_invitations(now_ms()) {
        match engine.expire_invitation(id).await {
            Ok(true) => {
                info!("expired invitation {id}");
                metrics::counter!(observability::INVITATIONS_EXPIRED_TOTAL).increment(1);
                reaped += 1;
            }
            // Accepted or revoked since it was collected
            Ok(false) => debug!("reaper skip {id}"),
            Err(e) => warn!("reaper failed on invitation {id}: {e}"),
        }
    }
    reaped
}

/// Background task that compacts the WAL once enough appends accumulate.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => {
                info!("compacted WAL after {appends} appends");
                metrics::counter!(observability::WAL_COMPACTIONS_TOTAL).increment(1);
            }
            Err(e) => warn!("WAL compaction failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::InvitationState;
    use crate::role::Role;
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("staydesk_test_reaper");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn reaper_expires_lapsed_invitations() {
        let path = test_wal_path("reaper_expire.wal");
        // One millisecond lifetime: lapsed by the time the reaper looks.
        let engine = Arc::new(Engine::new(path, 1).unwrap());
        let admin = engine.bootstrap_admin("root@hotel.test").await.unwrap().unwrap();

        let id = Ulid::new();
        engine
            .create_invitation(id, "late@hotel.test".into(), Role::Owner, None, admin.id)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert_eq!(reap_expired_invitations(&engine).await, 1);
        assert_eq!(
            engine.get_invitation(&id).unwrap().state,
            InvitationState::Expired
        );

        // Nothing left to do on the next pass
        assert_eq!(reap_expired_invitations(&engine).await, 0);
    }

    #[tokio::test]
    async fn reaper_leaves_live_invitations() {
        let path = test_wal_path("reaper_live.wal");
        let engine = Arc::new(Engine::new(path, 60_000).unwrap());
        let admin = engine.bootstrap_admin("root@hotel.test").await.unwrap().unwrap();

        let id = Ulid::new();
        engine
            .create_invitation(id, "soon@hotel.test".into(), Role::Owner, None, admin.id)
            .await
            .unwrap();

        assert_eq!(reap_expired_invitations(&engine).await, 0);
        assert_eq!(
            engine.get_invitation(&id).unwrap().state,
            InvitationState::Pending
        );
    }
}
