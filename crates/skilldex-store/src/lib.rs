//! Abstract wide-column store contract + in-memory reference implementation.
//!
//! The backing store is modeled after a Cassandra-style keyspace: rows are
//! addressed by composite keys, `put` is a full-replace upsert, `delete` is
//! idempotent, and counters live in their own tables supporting only atomic
//! relative adjustments. There are no multi-row transactions.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

pub const CRATE_NAME: &str = "skilldex-store";

/// One component of a composite row key.
///
/// `At(None)` sorts ahead of every timestamp, which is what puts
/// unscheduled queue entries at the front of an ordered scan.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum KeyPart {
    Bool(bool),
    Int(i64),
    Text(String),
    At(Option<DateTime<Utc>>),
}

impl From<&str> for KeyPart {
    fn from(value: &str) -> Self {
        KeyPart::Text(value.to_string())
    }
}

impl From<String> for KeyPart {
    fn from(value: String) -> Self {
        KeyPart::Text(value)
    }
}

impl From<i64> for KeyPart {
    fn from(value: i64) -> Self {
        KeyPart::Int(value)
    }
}

impl From<bool> for KeyPart {
    fn from(value: bool) -> Self {
        KeyPart::Bool(value)
    }
}

/// Composite row key; ordering is lexicographic over the parts.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RowKey(pub Vec<KeyPart>);

impl RowKey {
    pub fn starts_with(&self, prefix: &RowKey) -> bool {
        self.0.len() >= prefix.0.len() && self.0[..prefix.0.len()] == prefix.0[..]
    }

    pub fn part(&self, index: usize) -> Option<&KeyPart> {
        self.0.get(index)
    }
}

impl From<Vec<KeyPart>> for RowKey {
    fn from(parts: Vec<KeyPart>) -> Self {
        RowKey(parts)
    }
}

/// Non-key column value, mirroring the column types the schema uses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Text(String),
    At(Option<DateTime<Utc>>),
    TextSet(BTreeSet<String>),
    TextMap(BTreeMap<String, String>),
}

impl Value {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_at(&self) -> Option<Option<DateTime<Utc>>> {
        match self {
            Value::At(at) => Some(*at),
            _ => None,
        }
    }

    pub fn as_text_set(&self) -> Option<&BTreeSet<String>> {
        match self {
            Value::TextSet(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_text_map(&self) -> Option<&BTreeMap<String, String>> {
        match self {
            Value::TextMap(m) => Some(m),
            _ => None,
        }
    }
}

/// Non-key columns of a row. May be empty for tables whose key carries all
/// the information (the skill index is one).
pub type Row = BTreeMap<String, Value>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable during {op} on {table}: {reason}")]
    Unavailable {
        op: &'static str,
        table: String,
        reason: String,
    },
    #[error("{op} on {table} exceeded its deadline")]
    Timeout { op: &'static str, table: String },
    #[error("undecodable row in {table}: {detail}")]
    Corrupt { table: String, detail: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_store_error(err: &StoreError) -> RetryDisposition {
    match err {
        StoreError::Unavailable { .. } | StoreError::Timeout { .. } => {
            RetryDisposition::Retryable
        }
        StoreError::Corrupt { .. } => RetryDisposition::NonRetryable,
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(3),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt_index + 1`: the base delay doubled
    /// per attempt already made, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let exponent = u32::try_from(attempt_index).unwrap_or(u32::MAX).min(31);
        let doubled = self.base_delay.saturating_mul(2u32.saturating_pow(exponent));
        doubled.min(self.max_delay)
    }
}

/// The five operations the reconciliation engine consumes. Every logical
/// update above this trait is a delete-then-insert; there is no native
/// read-modify-write primitive.
#[async_trait]
pub trait WideColumnStore: Send + Sync {
    async fn get(&self, table: &str, key: &RowKey) -> Result<Option<Row>, StoreError>;

    /// All rows whose key starts with `prefix`, in key order. `limit` bounds
    /// the result; `None` means unbounded.
    async fn scan(
        &self,
        table: &str,
        prefix: &RowKey,
        limit: Option<usize>,
    ) -> Result<Vec<(RowKey, Row)>, StoreError>;

    /// Upsert by full replace of the row's non-key columns.
    async fn put(&self, table: &str, key: RowKey, row: Row) -> Result<(), StoreError>;

    /// Idempotent; deleting an absent key is a no-op.
    async fn delete(&self, table: &str, key: &RowKey) -> Result<(), StoreError>;

    /// Atomic relative adjustment; the counter is created at `delta` if the
    /// key was absent. Commutative with concurrent adjusts to the same key.
    async fn counter_adjust(&self, table: &str, key: &RowKey, delta: i64)
        -> Result<(), StoreError>;
}

#[derive(Default)]
struct MemoryState {
    tables: HashMap<String, BTreeMap<RowKey, Row>>,
    counters: HashMap<String, BTreeMap<RowKey, i64>>,
}

/// Reference store used by tests and local runs. Counters are held apart
/// from the row tables, matching the backing store's layout.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of one counter, `None` if it was never adjusted.
    pub async fn counter_value(&self, table: &str, key: &RowKey) -> Option<i64> {
        let state = self.state.lock().await;
        state.counters.get(table).and_then(|t| t.get(key)).copied()
    }

    /// Snapshot of a whole counter table, for verification.
    pub async fn counter_snapshot(&self, table: &str) -> BTreeMap<RowKey, i64> {
        let state = self.state.lock().await;
        state.counters.get(table).cloned().unwrap_or_default()
    }

    pub async fn row_count(&self, table: &str) -> usize {
        let state = self.state.lock().await;
        state.tables.get(table).map(|t| t.len()).unwrap_or(0)
    }
}

#[async_trait]
impl WideColumnStore for MemoryStore {
    async fn get(&self, table: &str, key: &RowKey) -> Result<Option<Row>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.tables.get(table).and_then(|t| t.get(key)).cloned())
    }

    async fn scan(
        &self,
        table: &str,
        prefix: &RowKey,
        limit: Option<usize>,
    ) -> Result<Vec<(RowKey, Row)>, StoreError> {
        let state = self.state.lock().await;
        let rows = state
            .tables
            .get(table)
            .map(|t| {
                t.iter()
                    .filter(|(key, _)| key.starts_with(prefix))
                    .take(limit.unwrap_or(usize::MAX))
                    .map(|(key, row)| (key.clone(), row.clone()))
                    .collect()
            })
            .unwrap_or_default();
        Ok(rows)
    }

    async fn put(&self, table: &str, key: RowKey, row: Row) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        debug!(table, ?key, "put");
        state.tables.entry(table.to_string()).or_default().insert(key, row);
        Ok(())
    }

    async fn delete(&self, table: &str, key: &RowKey) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        debug!(table, ?key, "delete");
        if let Some(t) = state.tables.get_mut(table) {
            t.remove(key);
        }
        Ok(())
    }

    async fn counter_adjust(
        &self,
        table: &str,
        key: &RowKey,
        delta: i64,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        debug!(table, ?key, delta, "counter_adjust");
        *state
            .counters
            .entry(table.to_string())
            .or_default()
            .entry(key.clone())
            .or_insert(0) += delta;
        Ok(())
    }
}

/// Decorator bounding every store call with a caller-supplied deadline.
/// Elapsed deadlines surface as [`StoreError::Timeout`], which classifies
/// as retryable.
pub struct TimeoutStore<S> {
    inner: S,
    deadline: Duration,
}

impl<S> TimeoutStore<S> {
    pub fn new(inner: S, deadline: Duration) -> Self {
        Self { inner, deadline }
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S> TimeoutStore<S> {
    async fn bounded<T>(
        &self,
        op: &'static str,
        table: &str,
        fut: impl std::future::Future<Output = Result<T, StoreError>> + Send,
    ) -> Result<T, StoreError> {
        match tokio::time::timeout(self.deadline, fut).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout {
                op,
                table: table.to_string(),
            }),
        }
    }
}

#[async_trait]
impl<S: WideColumnStore> WideColumnStore for TimeoutStore<S> {
    async fn get(&self, table: &str, key: &RowKey) -> Result<Option<Row>, StoreError> {
        self.bounded("get", table, self.inner.get(table, key)).await
    }

    async fn scan(
        &self,
        table: &str,
        prefix: &RowKey,
        limit: Option<usize>,
    ) -> Result<Vec<(RowKey, Row)>, StoreError> {
        self.bounded("scan", table, self.inner.scan(table, prefix, limit))
            .await
    }

    async fn put(&self, table: &str, key: RowKey, row: Row) -> Result<(), StoreError> {
        self.bounded("put", table, self.inner.put(table, key, row))
            .await
    }

    async fn delete(&self, table: &str, key: &RowKey) -> Result<(), StoreError> {
        self.bounded("delete", table, self.inner.delete(table, key))
            .await
    }

    async fn counter_adjust(
        &self,
        table: &str,
        key: &RowKey,
        delta: i64,
    ) -> Result<(), StoreError> {
        self.bounded(
            "counter_adjust",
            table,
            self.inner.counter_adjust(table, key, delta),
        )
        .await
    }
}
