//! Liveness registration for coordinator instances.
//!
//! Writes this instance's row in the `running_reapers` table on a fixed
//! interval with a TTL a few multiples longer.  If the process crashes the
//! row expires and the instance drops out of the live-instance directory;
//! on graceful shutdown [`deregister_instance`] removes it immediately.
//!
//! This writer lives outside the coordination registries on purpose: the
//! directory only ever reads `running_reapers`.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::identity::InstanceIdentity;
use crate::store::{Consistency, PreparedStatement, Statement, StoreError, StoreSession, Value};

const REGISTER_REAPER: &str = "INSERT INTO running_reapers \
     (reaper_instance_id, reaper_instance_host, last_heartbeat) \
     VALUES (?, ?, now()) USING TTL ?";

const DEREGISTER_REAPER: &str = "DELETE FROM running_reapers WHERE reaper_instance_id = ?";

/// Run the heartbeat loop.
///
/// Registers the instance once per `interval`, each write carrying
/// `ttl_secs`.  Tick failures are logged and the loop keeps going; only a
/// failure to prepare the statement ends it.  Never returns under normal
/// operation.
pub async fn run_heartbeat(
    session: Arc<dyn StoreSession>,
    identity: InstanceIdentity,
    interval: Duration,
    ttl_secs: u32,
) -> Result<(), StoreError> {
    let register = prepare_register(session.as_ref()).await?;
    info!(instance = %identity.id(), ?interval, "starting heartbeat loop");
    loop {
        if let Err(error) = beat(session.as_ref(), &register, &identity, ttl_secs).await {
            error!(error = %error, instance = %identity.id(), "heartbeat tick failed");
        }
        tokio::time::sleep(interval).await;
    }
}

/// Register the instance once, without starting a loop.
pub async fn heartbeat_once(
    session: &dyn StoreSession,
    identity: &InstanceIdentity,
    ttl_secs: u32,
) -> Result<(), StoreError> {
    let register = prepare_register(session).await?;
    beat(session, &register, identity, ttl_secs).await
}

/// Remove the instance's liveness row immediately (graceful shutdown).
pub async fn deregister_instance(
    session: &dyn StoreSession,
    identity: &InstanceIdentity,
) -> Result<(), StoreError> {
    let deregister = session
        .prepare(Statement::new(DEREGISTER_REAPER).with_consistency(Consistency::Quorum))
        .await?;
    session
        .execute(&deregister, vec![Value::Uuid(identity.id())])
        .await?;
    info!(instance = %identity.id(), "instance deregistered");
    Ok(())
}

async fn prepare_register(session: &dyn StoreSession) -> Result<PreparedStatement, StoreError> {
    session
        .prepare(Statement::new(REGISTER_REAPER).with_consistency(Consistency::Quorum))
        .await
}

async fn beat(
    session: &dyn StoreSession,
    register: &PreparedStatement,
    identity: &InstanceIdentity,
    ttl_secs: u32,
) -> Result<(), StoreError> {
    session
        .execute(
            register,
            vec![
                Value::Uuid(identity.id()),
                Value::from(identity.address()),
                crate::coordination::ttl_value(ttl_secs),
            ],
        )
        .await?;
    debug!(instance = %identity.id(), "heartbeat tick");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::{Coordinator, StoreVersion};
    use crate::store::memory::MemorySession;
    use uuid::Uuid;

    async fn directory(session: &Arc<MemorySession>) -> Coordinator {
        Coordinator::new(
            StoreVersion::new("4.1.3"),
            InstanceIdentity::new(Uuid::new_v4(), "observer"),
            Arc::clone(session) as Arc<dyn StoreSession>,
        )
        .await
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn single_beat_registers_until_ttl() {
        let session = Arc::new(MemorySession::new());
        let observer = directory(&session).await;
        let me = InstanceIdentity::new(Uuid::new_v4(), "host-a");

        heartbeat_once(session.as_ref(), &me, 30).await.unwrap();
        assert!(observer
            .get_running_reapers()
            .await
            .unwrap()
            .contains(&me.id()));

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(observer.get_running_reapers().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn deregister_removes_the_row_before_expiry() {
        let session = Arc::new(MemorySession::new());
        let observer = directory(&session).await;
        let me = InstanceIdentity::new(Uuid::new_v4(), "host-a");

        heartbeat_once(session.as_ref(), &me, 300).await.unwrap();
        deregister_instance(session.as_ref(), &me).await.unwrap();
        assert!(observer.get_running_reapers().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn loop_keeps_the_registration_alive() {
        let session = Arc::new(MemorySession::new());
        let observer = directory(&session).await;
        let me = InstanceIdentity::new(Uuid::new_v4(), "host-a");

        let handle = tokio::spawn(run_heartbeat(
            Arc::clone(&session) as Arc<dyn StoreSession>,
            me.clone(),
            Duration::from_secs(10),
            30,
        ));

        // Well past the 30 s TTL; the 10 s ticks must have kept the row.
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(observer
            .get_running_reapers()
            .await
            .unwrap()
            .contains(&me.id()));

        handle.abort();
    }
}
