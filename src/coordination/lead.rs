//! Segment-lead lease registry.
//!
//! A lead is a single-row lease in the `leader` table: insert-if-absent to
//! acquire, update-if-holder-matches to renew, delete-if-holder-matches to
//! release.  The row's TTL bounds how long a crashed holder can block
//! peers.  Losing an acquisition race is normal operation; losing a
//! renewal is not, and is logged loudly.

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{ttl_value, Coordinator};
use crate::store::{StoreError, Value};

impl Coordinator {
    /// Attempt to take the lead on `leader_id` with the default TTL.
    /// Returns `false` when a peer already holds it.
    pub async fn take_lead(&self, leader_id: Uuid) -> Result<bool, StoreError> {
        self.take_lead_with_ttl(leader_id, self.lead_ttl_secs()).await
    }

    /// Attempt to take the lead on `leader_id`.  On success this instance
    /// holds the lease for at most `ttl_secs` seconds unless renewed.
    pub async fn take_lead_with_ttl(
        &self,
        leader_id: Uuid,
        ttl_secs: u32,
    ) -> Result<bool, StoreError> {
        debug!(%leader_id, "trying to take lead on segment");
        let outcome = self
            .session()
            .execute(
                &self.take_lead,
                vec![
                    Value::Uuid(leader_id),
                    Value::Uuid(self.identity().id()),
                    Value::from(self.identity().address()),
                    ttl_value(ttl_secs),
                ],
            )
            .await?;

        if outcome.was_applied {
            debug!(%leader_id, "took lead on segment");
            if let Some(metrics) = self.metrics() {
                metrics.lead_acquisitions.inc();
            }
            return Ok(true);
        }

        // A peer won the insert race; the store's linearizable order picked
        // exactly one of us.
        debug!(%leader_id, "could not take lead on segment");
        if let Some(metrics) = self.metrics() {
            metrics.lead_conflicts.inc();
        }
        Ok(false)
    }

    /// Renew a held lead with the default TTL.
    pub async fn renew_lead(&self, leader_id: Uuid) -> Result<bool, StoreError> {
        self.renew_lead_with_ttl(leader_id, self.lead_ttl_secs()).await
    }

    /// Rewrite the heartbeat column and reset the TTL, conditional on this
    /// instance still holding the row.  A `false` return means the lease
    /// expired or was taken over; callers must stop driving the segment.
    pub async fn renew_lead_with_ttl(
        &self,
        leader_id: Uuid,
        ttl_secs: u32,
    ) -> Result<bool, StoreError> {
        let outcome = self.conditional_lead_refresh(leader_id, ttl_secs).await?;
        if outcome {
            debug!(%leader_id, "renewed lead on segment");
            return Ok(true);
        }
        error!(%leader_id, "failed to renew lead on segment");
        if let Some(metrics) = self.metrics() {
            metrics.lead_renewal_failures.inc();
        }
        Ok(false)
    }

    /// Probe whether this instance still leads `leader_id`.
    ///
    /// Deliberately a conditional write, not a read: a read could observe a
    /// row whose TTL elapses before the caller's next action, so the act of
    /// probing is also the act of refreshing.
    pub async fn has_lead_on_segment(&self, leader_id: Uuid) -> Result<bool, StoreError> {
        self.conditional_lead_refresh(leader_id, self.lead_ttl_secs())
            .await
    }

    async fn conditional_lead_refresh(
        &self,
        leader_id: Uuid,
        ttl_secs: u32,
    ) -> Result<bool, StoreError> {
        let outcome = self
            .session()
            .execute(
                &self.renew_lead,
                vec![
                    ttl_value(ttl_secs),
                    Value::Uuid(self.identity().id()),
                    Value::from(self.identity().address()),
                    Value::Uuid(leader_id),
                    Value::Uuid(self.identity().id()),
                ],
            )
            .await?;
        Ok(outcome.was_applied)
    }

    /// Enumerate every currently held lead.  Non-linearizable; for
    /// observability and reconciliation only.
    pub async fn get_leaders(&self) -> Result<Vec<Uuid>, StoreError> {
        let outcome = self.session().execute(&self.list_leaders, Vec::new()).await?;
        Ok(outcome
            .rows
            .iter()
            .filter_map(|row| row.uuid("leader_id"))
            .collect())
    }

    /// Release a held lead.  An unsuccessful release is logged and
    /// otherwise ignored: the lease expires on its own.
    pub async fn release_lead(&self, leader_id: Uuid) -> Result<(), StoreError> {
        info!(%leader_id, instance = %self.identity().id(), "trying to release lead on segment");
        let outcome = self
            .session()
            .execute(
                &self.release_lead,
                vec![Value::Uuid(leader_id), Value::Uuid(self.identity().id())],
            )
            .await?;

        if outcome.was_applied {
            info!(%leader_id, "released lead on segment");
            if let Some(metrics) = self.metrics() {
                metrics.lead_releases.inc();
            }
        } else {
            warn!(%leader_id, "could not release lead on segment; lease will expire by TTL");
        }
        Ok(())
    }
}
