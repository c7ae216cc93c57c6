//! Distributed concurrency registries for cooperating coordinator
//! instances.
//!
//! Several independent coordinator processes drive repairs against the
//! same cluster.  Two registries keep them out of each other's way, both
//! built on conditional writes with per-row TTL in the coordination store:
//!
//! - the **segment-lead registry** ([`lead`]) serializes a single action
//!   behind a one-row lease keyed by an opaque id;
//! - the **node-lock registry** ([`locks`]) serializes repairs that share
//!   replica nodes behind a batched multi-row lock keyed by
//!   `(repair run, node)`.
//!
//! A third component, the **live-instance directory** ([`directory`]),
//! enumerates peer coordinators so that upstream scheduling can divide its
//! concurrency budget.
//!
//! All three hang off one [`Coordinator`], constructed from a store
//! version, an instance identity, and a store session.  The TTL is the
//! only liveness bound: a crashed holder's rows expire on their own, and
//! no registry ever retries internally.

pub mod directory;
pub mod lead;
pub mod locks;

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use tracing::info;
use uuid::Uuid;

use crate::config::CoordinationConfig;
use crate::identity::InstanceIdentity;
use crate::metrics::Metrics;
use crate::store::{Consistency, PreparedStatement, Statement, StoreError, StoreSession, Value};

// ---------------------------------------------------------------------------
// Statement templates
// ---------------------------------------------------------------------------
// Table and column names are a stable contract shared with every other
// coordinator instance; peers running different builds must keep reading
// each other's rows.

pub(crate) const TAKE_LEAD: &str = "INSERT INTO leader \
     (leader_id, reaper_instance_id, reaper_instance_host, last_heartbeat) \
     VALUES (?, ?, ?, now()) IF NOT EXISTS USING TTL ?";

pub(crate) const RENEW_LEAD: &str = "UPDATE leader USING TTL ? \
     SET reaper_instance_id = ?, reaper_instance_host = ?, last_heartbeat = now() \
     WHERE leader_id = ? IF reaper_instance_id = ?";

pub(crate) const RELEASE_LEAD: &str =
    "DELETE FROM leader WHERE leader_id = ? IF reaper_instance_id = ?";

pub(crate) const SET_RUNNING_REPAIR: &str = "UPDATE running_repairs USING TTL ? \
     SET reaper_instance_host = ?, reaper_instance_id = ?, segment_id = ? \
     WHERE repair_id = ? AND node = ? IF reaper_instance_id = ?";

pub(crate) const GET_RUNNING_REPAIRS: &str =
    "SELECT repair_id, node, reaper_instance_host, reaper_instance_id, segment_id \
     FROM running_repairs WHERE repair_id = ?";

pub(crate) const LIST_LEADERS: &str = "SELECT * FROM leader";

pub(crate) const LIST_REAPERS: &str = "SELECT reaper_instance_id FROM running_reapers";

// ---------------------------------------------------------------------------
// Store version
// ---------------------------------------------------------------------------

/// Version marker of the coordination store a [`Coordinator`] runs against.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreVersion {
    raw: String,
}

impl StoreVersion {
    pub fn new(raw: impl Into<String>) -> Self {
        Self { raw: raw.into() }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Cross-row conditional batches within a partition first became usable
    /// in 2.1.  Unparseable versions are treated as unsupported.
    pub fn supports_conditional_batches(&self) -> bool {
        match self.major_minor() {
            Some((major, minor)) => major > 2 || (major == 2 && minor >= 1),
            None => false,
        }
    }

    fn major_minor(&self) -> Option<(u32, u32)> {
        let trimmed = self.raw.trim().trim_start_matches('v');
        let mut parts = trimmed.split('.');
        let major = parts.next()?.parse().ok()?;
        let minor = match parts.next() {
            Some(part) => part.parse().ok()?,
            None => 0,
        };
        Some((major, minor))
    }
}

impl fmt::Display for StoreVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

// ---------------------------------------------------------------------------
// Segment
// ---------------------------------------------------------------------------

/// A unit of repair work: the run it belongs to, its own id, and the
/// replica nodes owning its data.
#[derive(Clone, Debug)]
pub struct Segment {
    pub run_id: Uuid,
    pub id: Uuid,
    pub replicas: HashSet<String>,
}

impl Segment {
    pub fn new(
        run_id: Uuid,
        id: Uuid,
        replicas: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            run_id,
            id,
            replicas: replicas.into_iter().map(Into::into).collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

/// Handle to the coordination registries.
///
/// Construction prepares every statement eagerly; the value is unusable
/// until preparation has succeeded against the store.  The only in-process
/// state is the prepared statements and the session handle, so a
/// `Coordinator` is safe to share across tasks.
pub struct Coordinator {
    version: StoreVersion,
    identity: InstanceIdentity,
    session: Arc<dyn StoreSession>,
    lead_ttl_secs: u32,
    metrics: Option<Arc<Metrics>>,
    take_lead: PreparedStatement,
    renew_lead: PreparedStatement,
    release_lead: PreparedStatement,
    set_running_repair: PreparedStatement,
    get_running_repairs: PreparedStatement,
    list_leaders: PreparedStatement,
    list_reapers: PreparedStatement,
}

impl Coordinator {
    /// Construct with default tuning (90 s lease TTL).
    pub async fn new(
        version: StoreVersion,
        identity: InstanceIdentity,
        session: Arc<dyn StoreSession>,
    ) -> Result<Self, StoreError> {
        Self::with_config(version, identity, session, CoordinationConfig::default()).await
    }

    pub async fn with_config(
        version: StoreVersion,
        identity: InstanceIdentity,
        session: Arc<dyn StoreSession>,
        config: CoordinationConfig,
    ) -> Result<Self, StoreError> {
        if !version.supports_conditional_batches() {
            return Err(StoreError::UnsupportedVersion(version.to_string()));
        }

        let take_lead = session
            .prepare(Statement::new(TAKE_LEAD).with_consistency(Consistency::Quorum))
            .await?;
        let renew_lead = session
            .prepare(Statement::new(RENEW_LEAD).with_consistency(Consistency::Quorum))
            .await?;
        let release_lead = session
            .prepare(Statement::new(RELEASE_LEAD).with_consistency(Consistency::Quorum))
            .await?;
        let set_running_repair = session
            .prepare(
                Statement::new(SET_RUNNING_REPAIR)
                    .with_consistency(Consistency::Quorum)
                    .with_serial_consistency(Consistency::Serial)
                    .non_idempotent(),
            )
            .await?;
        let get_running_repairs = session
            .prepare(Statement::new(GET_RUNNING_REPAIRS).with_consistency(Consistency::Quorum))
            .await?;
        let list_leaders = session.prepare(Statement::new(LIST_LEADERS)).await?;
        let list_reapers = session.prepare(Statement::new(LIST_REAPERS)).await?;

        info!(
            store_version = %version,
            instance = %identity.id(),
            address = %identity.address(),
            "coordination statements prepared"
        );

        Ok(Self {
            version,
            identity,
            session,
            lead_ttl_secs: config.lead_ttl_secs,
            metrics: None,
            take_lead,
            renew_lead,
            release_lead,
            set_running_repair,
            get_running_repairs,
            list_leaders,
            list_reapers,
        })
    }

    /// Attach counters.  Optional so that the construction contract stays
    /// (version, identity, session).
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn identity(&self) -> &InstanceIdentity {
        &self.identity
    }

    pub fn store_version(&self) -> &StoreVersion {
        &self.version
    }

    /// Default lease duration in seconds.
    pub fn lead_ttl_secs(&self) -> u32 {
        self.lead_ttl_secs
    }

    pub(crate) fn metrics(&self) -> Option<&Metrics> {
        self.metrics.as_deref()
    }

    pub(crate) fn session(&self) -> &dyn StoreSession {
        self.session.as_ref()
    }
}

/// CQL TTLs are 32-bit; clamp rather than wrap for absurd inputs.
pub(crate) fn ttl_value(ttl_secs: u32) -> Value {
    Value::Int(i32::try_from(ttl_secs).unwrap_or(i32::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemorySession;

    #[test]
    fn store_version_gates_conditional_batches() {
        assert!(StoreVersion::new("2.1.22").supports_conditional_batches());
        assert!(StoreVersion::new("3.11.4").supports_conditional_batches());
        assert!(StoreVersion::new("v4.1").supports_conditional_batches());
        assert!(!StoreVersion::new("2.0.17").supports_conditional_batches());
        assert!(!StoreVersion::new("garbage").supports_conditional_batches());
    }

    #[tokio::test]
    async fn construction_rejects_pre_batch_stores() {
        let session: Arc<dyn StoreSession> = Arc::new(MemorySession::new());
        let result = Coordinator::new(
            StoreVersion::new("2.0.9"),
            InstanceIdentity::new(Uuid::new_v4(), "host-a"),
            session,
        )
        .await;
        assert!(matches!(result, Err(StoreError::UnsupportedVersion(_))));
    }

    #[tokio::test]
    async fn construction_prepares_eagerly() {
        let session: Arc<dyn StoreSession> = Arc::new(MemorySession::new());
        let coordinator = Coordinator::new(
            StoreVersion::new("4.1.3"),
            InstanceIdentity::new(Uuid::new_v4(), "host-a"),
            session,
        )
        .await
        .unwrap();
        assert_eq!(coordinator.lead_ttl_secs(), 90);
    }

    #[test]
    fn segment_collects_replicas() {
        let segment = Segment::new(Uuid::new_v4(), Uuid::new_v4(), ["n1", "n2", "n2"]);
        assert_eq!(segment.replicas.len(), 2);
    }
}
