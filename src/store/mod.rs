//! Coordination-store session abstraction.
//!
//! The registries in [`crate::coordination`] speak to the store exclusively
//! through [`StoreSession`]: statements are prepared once at construction
//! and executed per call, each execution reporting its result rows and the
//! conditional-write "applied" flag.  Everything the store needs to know
//! about a statement (consistency levels, idempotency) travels on the
//! [`Statement`] itself so that transports never have to guess.
//!
//! Implementations must never retry a conditional write: a replay after a
//! successful apply reads back as a conflict against the just-written value
//! and misreports success as failure.

pub mod memory;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failures surfaced by a [`StoreSession`].
///
/// A conditional write whose condition did not hold is *not* an error; it is
/// an `applied = false` result.  These variants cover transport failures and
/// caller mistakes only.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The session does not serve this statement text.
    #[error("statement is not part of the coordination schema: {0}")]
    UnrecognizedStatement(String),

    /// A bind value was missing, null where a value is required, or of the
    /// wrong type for its position.
    #[error("bad bind values for {statement}: {detail}")]
    BadBind {
        statement: &'static str,
        detail: String,
    },

    /// A conditional batch mixed statement kinds or spanned more than one
    /// repair partition, so the store cannot apply it as one linearizable
    /// transition.
    #[error("conditional batch must target a single repair partition: {0}")]
    InvalidBatch(String),

    /// The coordination store is too old to apply cross-row conditional
    /// batches.
    #[error("coordination store version {0} does not support conditional batches")]
    UnsupportedVersion(String),

    /// Network, timeout, or availability failure talking to the store.
    #[error("store transport error: {0}")]
    Transport(String),
}

// ---------------------------------------------------------------------------
// Consistency
// ---------------------------------------------------------------------------

/// Consistency levels a statement can request from the store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Consistency {
    One,
    Quorum,
    Serial,
}

// ---------------------------------------------------------------------------
// Statements
// ---------------------------------------------------------------------------

/// A parameterized statement plus the execution options it is always run
/// with.
#[derive(Clone, Debug)]
pub struct Statement {
    text: String,
    consistency: Consistency,
    serial_consistency: Option<Consistency>,
    idempotent: bool,
}

impl Statement {
    /// A statement with driver-default consistency, retryable by the
    /// transport.
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            consistency: Consistency::One,
            serial_consistency: None,
            idempotent: true,
        }
    }

    pub fn with_consistency(mut self, consistency: Consistency) -> Self {
        self.consistency = consistency;
        self
    }

    pub fn with_serial_consistency(mut self, consistency: Consistency) -> Self {
        self.serial_consistency = Some(consistency);
        self
    }

    /// Forbid transport-level replays of this statement.  Required for
    /// conditional writes whose success a replay would misreport.
    pub fn non_idempotent(mut self) -> Self {
        self.idempotent = false;
        self
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn consistency(&self) -> Consistency {
        self.consistency
    }

    pub fn serial_consistency(&self) -> Option<Consistency> {
        self.serial_consistency
    }

    pub fn is_idempotent(&self) -> bool {
        self.idempotent
    }
}

/// A statement a session has compiled and is ready to execute.
///
/// Cheap to clone; the underlying [`Statement`] is shared.
#[derive(Clone, Debug)]
pub struct PreparedStatement {
    statement: Arc<Statement>,
}

impl PreparedStatement {
    pub fn new(statement: Statement) -> Self {
        Self {
            statement: Arc::new(statement),
        }
    }

    pub fn statement(&self) -> &Statement {
        &self.statement
    }

    /// Pair this statement with bind values for batch execution.
    pub fn bind(&self, values: Vec<Value>) -> BoundStatement {
        BoundStatement {
            statement: self.clone(),
            values,
        }
    }
}

/// A prepared statement together with its bind values.
#[derive(Clone, Debug)]
pub struct BoundStatement {
    pub statement: PreparedStatement,
    pub values: Vec<Value>,
}

// ---------------------------------------------------------------------------
// Values and rows
// ---------------------------------------------------------------------------

/// A bind parameter or result column value.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Uuid(Uuid),
    Text(String),
    Int(i32),
    Timestamp(DateTime<Utc>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_uuid(&self) -> Option<Uuid> {
        match self {
            Value::Uuid(id) => Some(*id),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i32> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }
}

impl From<Uuid> for Value {
    fn from(id: Uuid) -> Self {
        Value::Uuid(id)
    }
}

impl From<Option<Uuid>> for Value {
    fn from(id: Option<Uuid>) -> Self {
        id.map_or(Value::Null, Value::Uuid)
    }
}

impl From<&str> for Value {
    fn from(text: &str) -> Self {
        Value::Text(text.to_string())
    }
}

impl From<String> for Value {
    fn from(text: String) -> Self {
        Value::Text(text)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Int(n)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(ts: DateTime<Utc>) -> Self {
        Value::Timestamp(ts)
    }
}

/// One result row: a column-name-to-value map with typed accessors.
///
/// Accessors return `None` for missing, mistyped, or null columns; callers
/// render those as `"unknown"` in diagnostics rather than failing.
#[derive(Clone, Debug, Default)]
pub struct Row {
    columns: HashMap<String, Value>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, column: impl Into<String>, value: Value) -> Self {
        self.columns.insert(column.into(), value);
        self
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns.get(column)
    }

    pub fn uuid(&self, column: &str) -> Option<Uuid> {
        self.columns.get(column).and_then(Value::as_uuid)
    }

    pub fn text(&self, column: &str) -> Option<&str> {
        self.columns.get(column).and_then(Value::as_text)
    }
}

// ---------------------------------------------------------------------------
// Execution outcome
// ---------------------------------------------------------------------------

/// Result of executing a statement or batch: the result rows and whether the
/// conditional write (if any) was applied.
///
/// Unconditional statements always report `was_applied = true`.
#[derive(Clone, Debug)]
pub struct ExecResult {
    pub was_applied: bool,
    pub rows: Vec<Row>,
}

impl ExecResult {
    /// A conditional write whose condition held, or an unconditional write.
    pub fn applied() -> Self {
        Self {
            was_applied: true,
            rows: Vec::new(),
        }
    }

    /// A conditional write whose condition did not hold.  `rows` describe
    /// the state that blocked it.
    pub fn not_applied(rows: Vec<Row>) -> Self {
        Self {
            was_applied: false,
            rows,
        }
    }

    /// A read result.
    pub fn with_rows(rows: Vec<Row>) -> Self {
        Self {
            was_applied: true,
            rows,
        }
    }
}

// ---------------------------------------------------------------------------
// Session trait
// ---------------------------------------------------------------------------

/// A session onto the coordination store with linearizable conditional
/// writes.
///
/// Sessions are internally synchronized: every method may be called
/// concurrently from any number of tasks.  Calls naming the same row are
/// ordered by the store's linearizable log, not by any in-process lock.
#[async_trait]
pub trait StoreSession: Send + Sync {
    /// Compile a statement.  Fails fast when the session cannot serve the
    /// statement text, so that constructing a registry on top of an
    /// incompatible store is an immediate error rather than a latent one.
    async fn prepare(&self, statement: Statement) -> Result<PreparedStatement, StoreError>;

    /// Execute one statement with the given bind values.
    async fn execute(
        &self,
        statement: &PreparedStatement,
        values: Vec<Value>,
    ) -> Result<ExecResult, StoreError>;

    /// Execute a set of conditional writes against a single repair
    /// partition as one linearizable transition: applied iff every per-row
    /// condition holds, with no partial application.
    async fn execute_batch(&self, batch: Vec<BoundStatement>) -> Result<ExecResult, StoreError>;
}
