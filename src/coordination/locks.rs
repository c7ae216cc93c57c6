//! Node-lock registry.
//!
//! Repairs that touch the same data-owning nodes must not run
//! concurrently, even when driven by different coordinator instances.
//! Each replica of a segment maps to one `(repair_id, node)` row in the
//! `running_repairs` table; acquiring a segment means transitioning every
//! replica's row from unowned to owned-by-me in a single conditional
//! batch.  The store applies the batch iff every per-row condition holds,
//! so acquisition over the replica set is all-or-nothing.
//!
//! Releasing writes null holder columns but leaves the row alive under
//! its TTL: the next acquirer conditions on `reaper_instance_id = null`
//! against a present row instead of racing row absence.

use std::collections::HashSet;

use tracing::debug;
use uuid::Uuid;

use super::{ttl_value, Coordinator, Segment};
use crate::store::{BoundStatement, ExecResult, StoreError, Value};

impl Coordinator {
    /// Attempt to lock every replica node of a segment for `repair_id`.
    /// Returns `false` (with the conflicts logged) when any node is held
    /// by another repair.
    pub async fn lock_running_repairs_for_nodes(
        &self,
        repair_id: Uuid,
        segment_id: Uuid,
        replicas: &HashSet<String>,
    ) -> Result<bool, StoreError> {
        let batch = self.running_repairs_batch(repair_id, segment_id, replicas, LockWrite::Acquire);
        let applied = self
            .apply_running_repairs_batch(batch, repair_id, segment_id)
            .await?;
        if let Some(metrics) = self.metrics() {
            if applied {
                metrics.node_lock_acquisitions.inc();
            } else {
                metrics.node_lock_conflicts.inc();
            }
        }
        Ok(applied)
    }

    /// Refresh the TTL on every node lock this instance holds for the
    /// segment.  Returns `false` when any row expired or changed hands.
    pub async fn renew_running_repairs_for_nodes(
        &self,
        repair_id: Uuid,
        segment_id: Uuid,
        replicas: &HashSet<String>,
    ) -> Result<bool, StoreError> {
        let batch = self.running_repairs_batch(repair_id, segment_id, replicas, LockWrite::Renew);
        self.apply_running_repairs_batch(batch, repair_id, segment_id)
            .await
    }

    /// Reset every node lock of the segment to the unowned state,
    /// conditional on this instance holding it.
    pub async fn release_running_repairs_for_nodes(
        &self,
        repair_id: Uuid,
        segment_id: Uuid,
        replicas: &HashSet<String>,
    ) -> Result<bool, StoreError> {
        let batch = self.running_repairs_batch(repair_id, segment_id, replicas, LockWrite::Release);
        let applied = self
            .apply_running_repairs_batch(batch, repair_id, segment_id)
            .await?;
        if applied {
            if let Some(metrics) = self.metrics() {
                metrics.node_lock_releases.inc();
            }
        }
        Ok(applied)
    }

    /// Probe whether this instance still holds the node locks for a
    /// segment.  Structurally a renewal: probing refreshes the TTL, for
    /// the same reason lead probing does.
    pub async fn has_lock_on_segment(&self, segment: &Segment) -> Result<bool, StoreError> {
        self.renew_running_repairs_for_nodes(segment.run_id, segment.id, &segment.replicas)
            .await
    }

    /// Segment ids locked anywhere for the given repair run.
    pub async fn get_locked_segments_for_run(
        &self,
        run_id: Uuid,
    ) -> Result<HashSet<Uuid>, StoreError> {
        let outcome = self
            .session()
            .execute(&self.get_running_repairs, vec![Value::Uuid(run_id)])
            .await?;
        Ok(outcome
            .rows
            .iter()
            .filter(|row| row.uuid("reaper_instance_id").is_some())
            .filter_map(|row| row.uuid("segment_id"))
            .collect())
    }

    /// Node names locked anywhere for the given repair run.
    pub async fn get_locked_nodes_for_run(
        &self,
        run_id: Uuid,
    ) -> Result<HashSet<String>, StoreError> {
        let outcome = self
            .session()
            .execute(&self.get_running_repairs, vec![Value::Uuid(run_id)])
            .await?;
        Ok(outcome
            .rows
            .iter()
            .filter(|row| row.uuid("reaper_instance_id").is_some())
            .filter_map(|row| row.text("node").map(String::from))
            .collect())
    }

    fn running_repairs_batch(
        &self,
        repair_id: Uuid,
        segment_id: Uuid,
        replicas: &HashSet<String>,
        write: LockWrite,
    ) -> Vec<BoundStatement> {
        let (host, instance, segment) = match write {
            // Acquire and renew write this instance as holder; release
            // writes the unowned sentinel.
            LockWrite::Acquire | LockWrite::Renew => (
                Value::from(self.identity().address()),
                Value::Uuid(self.identity().id()),
                Value::Uuid(segment_id),
            ),
            LockWrite::Release => (Value::Null, Value::Null, Value::Null),
        };
        let expected_holder = match write {
            LockWrite::Acquire => Value::Null,
            LockWrite::Renew | LockWrite::Release => Value::Uuid(self.identity().id()),
        };

        replicas
            .iter()
            .map(|node| {
                self.set_running_repair.bind(vec![
                    ttl_value(self.lead_ttl_secs()),
                    host.clone(),
                    instance.clone(),
                    segment.clone(),
                    Value::Uuid(repair_id),
                    Value::from(node.as_str()),
                    expected_holder.clone(),
                ])
            })
            .collect()
    }

    async fn apply_running_repairs_batch(
        &self,
        batch: Vec<BoundStatement>,
        repair_id: Uuid,
        segment_id: Uuid,
    ) -> Result<bool, StoreError> {
        let outcome = self.session().execute_batch(batch).await?;
        if !outcome.was_applied {
            self.log_failed_lock(&outcome, repair_id, segment_id);
        }
        Ok(outcome.was_applied)
    }

    fn log_failed_lock(&self, outcome: &ExecResult, repair_id: Uuid, segment_id: Uuid) {
        debug!(
            %repair_id,
            %segment_id,
            "could not take or renew node locks; segments are already running for some nodes"
        );
        for row in &outcome.rows {
            let holder_id = row
                .uuid("reaper_instance_id")
                .map_or_else(|| "unknown".to_string(), |id| id.to_string());
            let locked_segment = row
                .uuid("segment_id")
                .map_or_else(|| "unknown".to_string(), |id| id.to_string());
            debug!(
                node = row.text("node").unwrap_or("unknown"),
                holder_host = row.text("reaper_instance_host").unwrap_or("unknown"),
                holder = %holder_id,
                segment = %locked_segment,
                "node is locked by a peer"
            );
        }
    }
}

/// Which transition a `running_repairs` batch performs.
#[derive(Clone, Copy)]
enum LockWrite {
    Acquire,
    Renew,
    Release,
}
