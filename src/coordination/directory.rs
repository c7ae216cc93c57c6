//! Live-instance directory.
//!
//! Coordinator instances announce themselves through heartbeat rows in the
//! `running_reapers` table (written by [`crate::heartbeat`], read-only
//! here).  Upstream scheduling divides its global concurrency budget by
//! the instance count; the count is clamped to at least one so an
//! isolated instance never divides by zero.  Entries are only as fresh as
//! the peers' heartbeats; stale reads are tolerated by design.

use tracing::debug;
use uuid::Uuid;

use super::Coordinator;
use crate::store::StoreError;

impl Coordinator {
    /// Every instance that has heartbeaten within its TTL.
    pub async fn get_running_reapers(&self) -> Result<Vec<Uuid>, StoreError> {
        let outcome = self.session().execute(&self.list_reapers, Vec::new()).await?;
        Ok(outcome
            .rows
            .iter()
            .filter_map(|row| row.uuid("reaper_instance_id"))
            .collect())
    }

    /// Number of live instances, never less than one.
    pub async fn count_running_reapers(&self) -> Result<usize, StoreError> {
        let running = self.get_running_reapers().await?.len();
        debug!(count = running, "running coordinator instances");
        Ok(running.max(1))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use uuid::Uuid;

    use crate::coordination::{Coordinator, StoreVersion};
    use crate::heartbeat;
    use crate::identity::InstanceIdentity;
    use crate::store::memory::MemorySession;
    use crate::store::StoreSession;

    async fn coordinator(session: &Arc<MemorySession>) -> Coordinator {
        Coordinator::new(
            StoreVersion::new("4.1.3"),
            InstanceIdentity::new(Uuid::new_v4(), "host-1"),
            Arc::clone(session) as Arc<dyn StoreSession>,
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn count_is_clamped_to_one_when_nobody_is_registered() {
        let session = Arc::new(MemorySession::new());
        let coordinator = coordinator(&session).await;

        assert!(coordinator.get_running_reapers().await.unwrap().is_empty());
        assert_eq!(coordinator.count_running_reapers().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn count_follows_registered_instances() {
        let session = Arc::new(MemorySession::new());
        let coordinator = coordinator(&session).await;

        let a = InstanceIdentity::new(Uuid::new_v4(), "host-a");
        let b = InstanceIdentity::new(Uuid::new_v4(), "host-b");
        heartbeat::heartbeat_once(session.as_ref(), &a, 60).await.unwrap();
        heartbeat::heartbeat_once(session.as_ref(), &b, 60).await.unwrap();

        let reapers = coordinator.get_running_reapers().await.unwrap();
        assert_eq!(reapers.len(), 2);
        assert!(reapers.contains(&a.id()) && reapers.contains(&b.id()));
        assert_eq!(coordinator.count_running_reapers().await.unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_heartbeats_drop_out_of_the_count() {
        let session = Arc::new(MemorySession::new());
        let coordinator = coordinator(&session).await;

        let a = InstanceIdentity::new(Uuid::new_v4(), "host-a");
        heartbeat::heartbeat_once(session.as_ref(), &a, 30).await.unwrap();
        assert_eq!(coordinator.count_running_reapers().await.unwrap(), 1);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(coordinator.get_running_reapers().await.unwrap().is_empty());
        assert_eq!(coordinator.count_running_reapers().await.unwrap(), 1);
    }
}
