//! In-process implementation of the coordination schema.
//!
//! [`MemorySession`] serves the same statement templates a real wide-column
//! store would, holding the three coordination tables behind a single mutex.
//! That mutex *is* the linearizable log: every execution observes and
//! mutates the tables at one point, and a conditional batch evaluates all
//! of its conditions and applies all of its writes without releasing it.
//!
//! Row expiry is tracked with [`tokio::time::Instant`] so that tests can
//! drive TTLs deterministically under a paused clock instead of sleeping.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tracing::trace;
use uuid::Uuid;

use super::{
    BoundStatement, ExecResult, PreparedStatement, Row, Statement, StoreError, StoreSession, Value,
};

// ---------------------------------------------------------------------------
// Template classification
// ---------------------------------------------------------------------------

/// The statement shapes this session serves, recognized by their text.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Template {
    TakeLead,
    RenewLead,
    ReleaseLead,
    SetRunningRepair,
    GetRunningRepairs,
    ListLeaders,
    ListReapers,
    RegisterReaper,
    DeregisterReaper,
}

fn classify(text: &str) -> Option<Template> {
    if text.starts_with("INSERT INTO leader") {
        Some(Template::TakeLead)
    } else if text.starts_with("UPDATE leader") {
        Some(Template::RenewLead)
    } else if text.starts_with("DELETE FROM leader") {
        Some(Template::ReleaseLead)
    } else if text.starts_with("UPDATE running_repairs") {
        Some(Template::SetRunningRepair)
    } else if text.starts_with("SELECT repair_id") {
        Some(Template::GetRunningRepairs)
    } else if text.starts_with("SELECT * FROM leader") {
        Some(Template::ListLeaders)
    } else if text.starts_with("SELECT reaper_instance_id FROM running_reapers") {
        Some(Template::ListReapers)
    } else if text.starts_with("INSERT INTO running_reapers") {
        Some(Template::RegisterReaper)
    } else if text.starts_with("DELETE FROM running_reapers") {
        Some(Template::DeregisterReaper)
    } else {
        None
    }
}

// ---------------------------------------------------------------------------
// Tables
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
struct LeaderRow {
    instance: Uuid,
    host: String,
    heartbeat: DateTime<Utc>,
    expires_at: Instant,
}

#[derive(Clone, Debug)]
struct RepairRow {
    instance: Option<Uuid>,
    host: Option<String>,
    segment: Option<Uuid>,
    expires_at: Instant,
}

#[derive(Clone, Debug)]
struct ReaperRow {
    expires_at: Instant,
}

#[derive(Default)]
struct Tables {
    leader: HashMap<Uuid, LeaderRow>,
    running_repairs: HashMap<(Uuid, String), RepairRow>,
    running_reapers: HashMap<Uuid, ReaperRow>,
}

/// Drop every row whose TTL has elapsed.  Runs at the head of each
/// execution so that expiry is observed before any condition is evaluated.
fn purge_expired(tables: &mut Tables, now: Instant) {
    tables.leader.retain(|_, row| row.expires_at > now);
    tables.running_repairs.retain(|_, row| row.expires_at > now);
    tables.running_reapers.retain(|_, row| row.expires_at > now);
}

// ---------------------------------------------------------------------------
// Bind-value extraction
// ---------------------------------------------------------------------------

fn arg<'a>(
    values: &'a [Value],
    index: usize,
    statement: &'static str,
) -> Result<&'a Value, StoreError> {
    values.get(index).ok_or_else(|| StoreError::BadBind {
        statement,
        detail: format!("missing bind value at position {index}"),
    })
}

fn uuid_arg(values: &[Value], index: usize, statement: &'static str) -> Result<Uuid, StoreError> {
    arg(values, index, statement)?
        .as_uuid()
        .ok_or_else(|| StoreError::BadBind {
            statement,
            detail: format!("expected a uuid at position {index}"),
        })
}

fn opt_uuid_arg(
    values: &[Value],
    index: usize,
    statement: &'static str,
) -> Result<Option<Uuid>, StoreError> {
    match arg(values, index, statement)? {
        Value::Null => Ok(None),
        Value::Uuid(id) => Ok(Some(*id)),
        other => Err(StoreError::BadBind {
            statement,
            detail: format!("expected a uuid or null at position {index}, got {other:?}"),
        }),
    }
}

fn text_arg<'a>(
    values: &'a [Value],
    index: usize,
    statement: &'static str,
) -> Result<&'a str, StoreError> {
    arg(values, index, statement)?
        .as_text()
        .ok_or_else(|| StoreError::BadBind {
            statement,
            detail: format!("expected text at position {index}"),
        })
}

fn opt_text_arg(
    values: &[Value],
    index: usize,
    statement: &'static str,
) -> Result<Option<String>, StoreError> {
    match arg(values, index, statement)? {
        Value::Null => Ok(None),
        Value::Text(text) => Ok(Some(text.clone())),
        other => Err(StoreError::BadBind {
            statement,
            detail: format!("expected text or null at position {index}, got {other:?}"),
        }),
    }
}

fn ttl_arg(values: &[Value], index: usize, statement: &'static str) -> Result<Duration, StoreError> {
    let secs = arg(values, index, statement)?
        .as_int()
        .ok_or_else(|| StoreError::BadBind {
            statement,
            detail: format!("expected a TTL integer at position {index}"),
        })?;
    if secs < 0 {
        return Err(StoreError::BadBind {
            statement,
            detail: format!("TTL must be non-negative, got {secs}"),
        });
    }
    Ok(Duration::from_secs(secs as u64))
}

// ---------------------------------------------------------------------------
// Diagnostics
// ---------------------------------------------------------------------------

fn leader_diagnostic(leader_id: Uuid, row: &LeaderRow) -> Row {
    Row::new()
        .with("leader_id", Value::Uuid(leader_id))
        .with("reaper_instance_id", Value::Uuid(row.instance))
        .with("reaper_instance_host", Value::Text(row.host.clone()))
        .with("last_heartbeat", Value::Timestamp(row.heartbeat))
}

fn repair_diagnostic(repair_id: Uuid, node: &str, row: &RepairRow) -> Row {
    Row::new()
        .with("repair_id", Value::Uuid(repair_id))
        .with("node", Value::Text(node.to_string()))
        .with("reaper_instance_id", row.instance.into())
        .with(
            "reaper_instance_host",
            row.host.clone().map_or(Value::Null, Value::Text),
        )
        .with("segment_id", row.segment.into())
}

// ---------------------------------------------------------------------------
// Parsed conditional repair write
// ---------------------------------------------------------------------------

struct RepairWrite {
    ttl: Duration,
    host: Option<String>,
    instance: Option<Uuid>,
    segment: Option<Uuid>,
    repair_id: Uuid,
    node: String,
    expected_holder: Option<Uuid>,
}

impl RepairWrite {
    fn parse(values: &[Value]) -> Result<Self, StoreError> {
        const STMT: &str = "UPDATE running_repairs";
        Ok(Self {
            ttl: ttl_arg(values, 0, STMT)?,
            host: opt_text_arg(values, 1, STMT)?,
            instance: opt_uuid_arg(values, 2, STMT)?,
            segment: opt_uuid_arg(values, 3, STMT)?,
            repair_id: uuid_arg(values, 4, STMT)?,
            node: text_arg(values, 5, STMT)?.to_string(),
            expected_holder: opt_uuid_arg(values, 6, STMT)?,
        })
    }

    /// The LWT condition: the row's current holder (null when the row is
    /// absent or released) must equal the expected holder.
    fn condition_holds(&self, tables: &Tables) -> bool {
        let current = tables
            .running_repairs
            .get(&(self.repair_id, self.node.clone()))
            .and_then(|row| row.instance);
        current == self.expected_holder
    }

    fn apply(self, tables: &mut Tables, now: Instant) {
        tables.running_repairs.insert(
            (self.repair_id, self.node),
            RepairRow {
                instance: self.instance,
                host: self.host,
                segment: self.segment,
                expires_at: now + self.ttl,
            },
        );
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// An in-process coordination store.
///
/// Useful for tests and single-process embeddings; every instance sharing
/// the same `MemorySession` observes the same tables, so multiple logical
/// coordinators can contend in one test.
#[derive(Default)]
pub struct MemorySession {
    tables: Mutex<Tables>,
}

impl MemorySession {
    pub fn new() -> Self {
        Self::default()
    }

    fn execute_template(
        &self,
        template: Template,
        values: &[Value],
    ) -> Result<ExecResult, StoreError> {
        let now = Instant::now();
        let mut tables = self.tables.lock().expect("store mutex poisoned");
        purge_expired(&mut tables, now);

        match template {
            Template::TakeLead => {
                const STMT: &str = "INSERT INTO leader";
                let leader_id = uuid_arg(values, 0, STMT)?;
                let instance = uuid_arg(values, 1, STMT)?;
                let host = text_arg(values, 2, STMT)?.to_string();
                let ttl = ttl_arg(values, 3, STMT)?;
                if let Some(existing) = tables.leader.get(&leader_id) {
                    return Ok(ExecResult::not_applied(vec![leader_diagnostic(
                        leader_id, existing,
                    )]));
                }
                tables.leader.insert(
                    leader_id,
                    LeaderRow {
                        instance,
                        host,
                        heartbeat: Utc::now(),
                        expires_at: now + ttl,
                    },
                );
                trace!(%leader_id, %instance, "leader row inserted");
                Ok(ExecResult::applied())
            }

            Template::RenewLead => {
                const STMT: &str = "UPDATE leader";
                let ttl = ttl_arg(values, 0, STMT)?;
                let instance = uuid_arg(values, 1, STMT)?;
                let host = text_arg(values, 2, STMT)?.to_string();
                let leader_id = uuid_arg(values, 3, STMT)?;
                let expected = opt_uuid_arg(values, 4, STMT)?;
                let current = tables.leader.get(&leader_id).map(|row| row.instance);
                if current != expected {
                    let rows = tables
                        .leader
                        .get(&leader_id)
                        .map(|row| vec![leader_diagnostic(leader_id, row)])
                        .unwrap_or_default();
                    return Ok(ExecResult::not_applied(rows));
                }
                tables.leader.insert(
                    leader_id,
                    LeaderRow {
                        instance,
                        host,
                        heartbeat: Utc::now(),
                        expires_at: now + ttl,
                    },
                );
                Ok(ExecResult::applied())
            }

            Template::ReleaseLead => {
                const STMT: &str = "DELETE FROM leader";
                let leader_id = uuid_arg(values, 0, STMT)?;
                let expected = opt_uuid_arg(values, 1, STMT)?;
                let current = tables.leader.get(&leader_id).map(|row| row.instance);
                if current != expected {
                    let rows = tables
                        .leader
                        .get(&leader_id)
                        .map(|row| vec![leader_diagnostic(leader_id, row)])
                        .unwrap_or_default();
                    return Ok(ExecResult::not_applied(rows));
                }
                tables.leader.remove(&leader_id);
                trace!(%leader_id, "leader row deleted");
                Ok(ExecResult::applied())
            }

            Template::SetRunningRepair => {
                let write = RepairWrite::parse(values)?;
                if !write.condition_holds(&tables) {
                    let rows = tables
                        .running_repairs
                        .get(&(write.repair_id, write.node.clone()))
                        .map(|row| vec![repair_diagnostic(write.repair_id, &write.node, row)])
                        .unwrap_or_default();
                    return Ok(ExecResult::not_applied(rows));
                }
                write.apply(&mut tables, now);
                Ok(ExecResult::applied())
            }

            Template::GetRunningRepairs => {
                const STMT: &str = "SELECT repair_id";
                let repair_id = uuid_arg(values, 0, STMT)?;
                let rows = tables
                    .running_repairs
                    .iter()
                    .filter(|((rid, _), _)| *rid == repair_id)
                    .map(|((rid, node), row)| repair_diagnostic(*rid, node, row))
                    .collect();
                Ok(ExecResult::with_rows(rows))
            }

            Template::ListLeaders => {
                let rows = tables
                    .leader
                    .iter()
                    .map(|(leader_id, row)| leader_diagnostic(*leader_id, row))
                    .collect();
                Ok(ExecResult::with_rows(rows))
            }

            Template::ListReapers => {
                let rows = tables
                    .running_reapers
                    .keys()
                    .map(|instance| Row::new().with("reaper_instance_id", Value::Uuid(*instance)))
                    .collect();
                Ok(ExecResult::with_rows(rows))
            }

            Template::RegisterReaper => {
                const STMT: &str = "INSERT INTO running_reapers";
                let instance = uuid_arg(values, 0, STMT)?;
                text_arg(values, 1, STMT)?;
                let ttl = ttl_arg(values, 2, STMT)?;
                tables.running_reapers.insert(
                    instance,
                    ReaperRow {
                        expires_at: now + ttl,
                    },
                );
                Ok(ExecResult::applied())
            }

            Template::DeregisterReaper => {
                const STMT: &str = "DELETE FROM running_reapers";
                let instance = uuid_arg(values, 0, STMT)?;
                tables.running_reapers.remove(&instance);
                Ok(ExecResult::applied())
            }
        }
    }
}

#[async_trait]
impl StoreSession for MemorySession {
    async fn prepare(&self, statement: Statement) -> Result<PreparedStatement, StoreError> {
        match classify(statement.text()) {
            Some(_) => Ok(PreparedStatement::new(statement)),
            None => Err(StoreError::UnrecognizedStatement(
                statement.text().to_string(),
            )),
        }
    }

    async fn execute(
        &self,
        statement: &PreparedStatement,
        values: Vec<Value>,
    ) -> Result<ExecResult, StoreError> {
        let template = classify(statement.statement().text()).ok_or_else(|| {
            StoreError::UnrecognizedStatement(statement.statement().text().to_string())
        })?;
        self.execute_template(template, &values)
    }

    async fn execute_batch(&self, batch: Vec<BoundStatement>) -> Result<ExecResult, StoreError> {
        if batch.is_empty() {
            return Ok(ExecResult::applied());
        }

        let mut writes = Vec::with_capacity(batch.len());
        for bound in &batch {
            let template = classify(bound.statement.statement().text()).ok_or_else(|| {
                StoreError::UnrecognizedStatement(bound.statement.statement().text().to_string())
            })?;
            if template != Template::SetRunningRepair {
                return Err(StoreError::InvalidBatch(
                    "only running_repairs conditional updates may be batched".to_string(),
                ));
            }
            writes.push(RepairWrite::parse(&bound.values)?);
        }

        let repair_id = writes[0].repair_id;
        if writes.iter().any(|write| write.repair_id != repair_id) {
            return Err(StoreError::InvalidBatch(format!(
                "batch spans more than one repair partition (first is {repair_id})"
            )));
        }

        let now = Instant::now();
        let mut tables = self.tables.lock().expect("store mutex poisoned");
        purge_expired(&mut tables, now);

        // Evaluate every condition before touching anything so that a batch
        // either transitions all of its rows or none of them.
        let mut conflicts = Vec::new();
        for write in &writes {
            if !write.condition_holds(&tables) {
                if let Some(row) = tables
                    .running_repairs
                    .get(&(write.repair_id, write.node.clone()))
                {
                    conflicts.push(repair_diagnostic(write.repair_id, &write.node, row));
                }
            }
        }
        let all_hold = writes.iter().all(|write| write.condition_holds(&tables));
        if !all_hold {
            return Ok(ExecResult::not_applied(conflicts));
        }

        for write in writes {
            write.apply(&mut tables, now);
        }
        trace!(%repair_id, rows = batch.len(), "repair lock batch applied");
        Ok(ExecResult::applied())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::coordination::{SET_RUNNING_REPAIR, TAKE_LEAD};
    use crate::store::Consistency;

    fn quorum(text: &str) -> Statement {
        Statement::new(text).with_consistency(Consistency::Quorum)
    }

    #[tokio::test]
    async fn prepare_rejects_foreign_statements() {
        let session = MemorySession::new();
        let result = session
            .prepare(Statement::new("SELECT * FROM repair_schedule"))
            .await;
        assert!(matches!(result, Err(StoreError::UnrecognizedStatement(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn insert_if_absent_honors_ttl() {
        let session = MemorySession::new();
        let take = session.prepare(quorum(TAKE_LEAD)).await.unwrap();
        let leader = Uuid::new_v4();
        let holder = Uuid::new_v4();

        let bind = |instance: Uuid| {
            vec![
                Value::Uuid(leader),
                Value::Uuid(instance),
                Value::from("host-a"),
                Value::Int(5),
            ]
        };

        let first = session.execute(&take, bind(holder)).await.unwrap();
        assert!(first.was_applied);

        let contender = session.execute(&take, bind(Uuid::new_v4())).await.unwrap();
        assert!(!contender.was_applied);
        assert_eq!(contender.rows[0].uuid("reaper_instance_id"), Some(holder));

        tokio::time::advance(Duration::from_secs(6)).await;

        let after_expiry = session.execute(&take, bind(Uuid::new_v4())).await.unwrap();
        assert!(after_expiry.was_applied);
    }

    #[tokio::test]
    async fn conditional_update_applies_against_absent_row() {
        let session = MemorySession::new();
        let set = session.prepare(quorum(SET_RUNNING_REPAIR)).await.unwrap();
        let repair = Uuid::new_v4();
        let me = Uuid::new_v4();

        // Expecting a null holder on a row that does not exist yet: the
        // condition holds and the write creates the row.
        let outcome = session
            .execute(
                &set,
                vec![
                    Value::Int(90),
                    Value::from("host-a"),
                    Value::Uuid(me),
                    Value::Uuid(Uuid::new_v4()),
                    Value::Uuid(repair),
                    Value::from("node1"),
                    Value::Null,
                ],
            )
            .await
            .unwrap();
        assert!(outcome.was_applied);

        // A second acquire against the now-held row must fail and describe
        // the holder.
        let conflict = session
            .execute(
                &set,
                vec![
                    Value::Int(90),
                    Value::from("host-b"),
                    Value::Uuid(Uuid::new_v4()),
                    Value::Uuid(Uuid::new_v4()),
                    Value::Uuid(repair),
                    Value::from("node1"),
                    Value::Null,
                ],
            )
            .await
            .unwrap();
        assert!(!conflict.was_applied);
        assert_eq!(conflict.rows[0].uuid("reaper_instance_id"), Some(me));
    }

    #[tokio::test]
    async fn batch_applies_all_rows_or_none() {
        let session = MemorySession::new();
        let set = session.prepare(quorum(SET_RUNNING_REPAIR)).await.unwrap();
        let repair = Uuid::new_v4();
        let other = Uuid::new_v4();
        let me = Uuid::new_v4();
        let segment = Uuid::new_v4();

        let acquire = |instance: Uuid, node: &str| {
            set.bind(vec![
                Value::Int(90),
                Value::from("host"),
                Value::Uuid(instance),
                Value::Uuid(segment),
                Value::Uuid(repair),
                Value::from(node),
                Value::Null,
            ])
        };

        // A peer already holds node2.
        let held = session
            .execute_batch(vec![acquire(other, "node2")])
            .await
            .unwrap();
        assert!(held.was_applied);

        let blocked = session
            .execute_batch(vec![
                acquire(me, "node1"),
                acquire(me, "node2"),
                acquire(me, "node3"),
            ])
            .await
            .unwrap();
        assert!(!blocked.was_applied);
        assert_eq!(blocked.rows.len(), 1);
        assert_eq!(blocked.rows[0].text("node"), Some("node2"));

        // node1 and node3 must not have been created by the failed batch.
        let get = session
            .prepare(quorum(
                "SELECT repair_id, node, reaper_instance_host, reaper_instance_id, segment_id \
                 FROM running_repairs WHERE repair_id = ?",
            ))
            .await
            .unwrap();
        let rows = session
            .execute(&get, vec![Value::Uuid(repair)])
            .await
            .unwrap();
        assert_eq!(rows.rows.len(), 1);
    }

    #[tokio::test]
    async fn batch_rejects_mixed_partitions() {
        let session = MemorySession::new();
        let set = session.prepare(quorum(SET_RUNNING_REPAIR)).await.unwrap();
        let me = Uuid::new_v4();

        let bind = |repair: Uuid| {
            set.bind(vec![
                Value::Int(90),
                Value::from("host"),
                Value::Uuid(me),
                Value::Uuid(Uuid::new_v4()),
                Value::Uuid(repair),
                Value::from("node1"),
                Value::Null,
            ])
        };

        let result = session
            .execute_batch(vec![bind(Uuid::new_v4()), bind(Uuid::new_v4())])
            .await;
        assert!(matches!(result, Err(StoreError::InvalidBatch(_))));
    }

    #[tokio::test]
    async fn empty_batch_trivially_applies() {
        let session = MemorySession::new();
        let outcome = session.execute_batch(Vec::new()).await.unwrap();
        assert!(outcome.was_applied);
        assert!(outcome.rows.is_empty());
    }
}
