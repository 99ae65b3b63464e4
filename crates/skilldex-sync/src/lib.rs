//! Reconciliation engine keeping the denormalized offer views convergent.
//!
//! The backing store has no multi-row transactions, so consistency across
//! the canonical offer rows, the skill index, and the popularity counters
//! comes from a fixed write order: retract counters before deleting index
//! entries, write the canonical row, insert index entries before counting
//! their contributions, and clear the staging entry last. Re-running a
//! reconciliation after a partial failure re-derives the old state from
//! storage and applies only the remaining deltas.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use skilldex_core::{
    skill_map_subtract, Offer, OfferDelta, OfferId, QueuedOffer, SkillMap, StagedOffer,
};
use skilldex_store::{
    classify_store_error, KeyPart, RetryDisposition, RetryPolicy, Row, RowKey, StoreError,
    TimeoutStore, Value, WideColumnStore,
};

pub const CRATE_NAME: &str = "skilldex-sync";

const COL_FEATURES: &str = "features";
const COL_CAREERS: &str = "careers";
const COL_AUTO_PROCESS: &str = "auto_process";
const COL_PROCESS_AT: &str = "process_at";

/// Table names in the backing keyspace.
#[derive(Debug, Clone)]
pub struct Tables {
    pub offers: String,
    pub new_offers: String,
    pub offer_skills: String,
    pub counters: String,
    pub unprocessed: String,
    pub unprocessed_by_id: String,
}

impl Default for Tables {
    fn default() -> Self {
        Self {
            offers: "offers".to_string(),
            new_offers: "new_offers".to_string(),
            offer_skills: "offer_skills".to_string(),
            counters: "counter_table".to_string(),
            unprocessed: "unprocessed_offers".to_string(),
            unprocessed_by_id: "unprocessed_offers_by_id".to_string(),
        }
    }
}

impl Tables {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            offers: env_or("SKILLDEX_OFFERS_TABLE", defaults.offers),
            new_offers: env_or("SKILLDEX_NEW_OFFERS_TABLE", defaults.new_offers),
            offer_skills: env_or("SKILLDEX_OFFER_SKILLS_TABLE", defaults.offer_skills),
            counters: env_or("SKILLDEX_COUNTER_TABLE", defaults.counters),
            unprocessed: env_or("SKILLDEX_UNPROCESSED_TABLE", defaults.unprocessed),
            unprocessed_by_id: env_or(
                "SKILLDEX_UNPROCESSED_BY_ID_TABLE",
                defaults.unprocessed_by_id,
            ),
        }
    }
}

fn env_or(name: &str, default: String) -> String {
    std::env::var(name).unwrap_or(default)
}

fn env_parsed<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub tables: Tables,
    pub batch_limit: Option<usize>,
    pub op_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tables: Tables::default(),
            batch_limit: None,
            op_timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            tables: Tables::from_env(),
            batch_limit: env_parsed("SKILLDEX_BATCH_LIMIT"),
            op_timeout: env_parsed("SKILLDEX_OP_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.op_timeout),
            retry: RetryPolicy {
                max_retries: env_parsed("SKILLDEX_MAX_RETRIES")
                    .unwrap_or(defaults.retry.max_retries),
                base_delay: env_parsed("SKILLDEX_RETRY_BASE_DELAY_MS")
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.retry.base_delay),
                max_delay: env_parsed("SKILLDEX_RETRY_MAX_DELAY_MS")
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.retry.max_delay),
            },
        }
    }
}

// Row/key codecs. Keys mirror the keyspace schema: the offer identity leads
// every per-offer key, counters are keyed by period + career + field +
// skill, and the ordered queue key sorts by (auto_process, process_at).

fn offer_key(id: &OfferId) -> RowKey {
    RowKey(vec![
        KeyPart::Text(id.id.clone()),
        KeyPart::Int(i64::from(id.year)),
        KeyPart::Int(i64::from(id.month)),
    ])
}

fn skill_entry_key(id: &OfferId, field: &str, skill: &str) -> RowKey {
    let mut key = offer_key(id);
    key.0.push(KeyPart::Text(field.to_string()));
    key.0.push(KeyPart::Text(skill.to_string()));
    key
}

fn counter_key(year: i32, month: u32, career: &str, field: &str, skill: &str) -> RowKey {
    RowKey(vec![
        KeyPart::Int(i64::from(year)),
        KeyPart::Int(i64::from(month)),
        KeyPart::Text(career.to_string()),
        KeyPart::Text(field.to_string()),
        KeyPart::Text(skill.to_string()),
    ])
}

fn ordered_queue_key(queued: &QueuedOffer) -> RowKey {
    RowKey(vec![
        KeyPart::Bool(queued.auto_process),
        KeyPart::At(queued.process_at),
        KeyPart::Int(i64::from(queued.id.year)),
        KeyPart::Int(i64::from(queued.id.month)),
        KeyPart::Text(queued.id.id.clone()),
    ])
}

fn corrupt(table: &str, detail: impl Into<String>) -> StoreError {
    StoreError::Corrupt {
        table: table.to_string(),
        detail: detail.into(),
    }
}

fn offer_id_from_key(table: &str, key: &RowKey) -> Result<OfferId, StoreError> {
    match (key.part(0), key.part(1), key.part(2)) {
        (Some(KeyPart::Text(id)), Some(KeyPart::Int(year)), Some(KeyPart::Int(month))) => {
            Ok(OfferId::new(id.clone(), *year as i32, *month as u32))
        }
        _ => Err(corrupt(table, format!("malformed offer key {key:?}"))),
    }
}

fn queued_from_ordered_key(table: &str, key: &RowKey) -> Result<QueuedOffer, StoreError> {
    match (
        key.part(0),
        key.part(1),
        key.part(2),
        key.part(3),
        key.part(4),
    ) {
        (
            Some(KeyPart::Bool(auto_process)),
            Some(KeyPart::At(process_at)),
            Some(KeyPart::Int(year)),
            Some(KeyPart::Int(month)),
            Some(KeyPart::Text(id)),
        ) => Ok(QueuedOffer {
            id: OfferId::new(id.clone(), *year as i32, *month as u32),
            auto_process: *auto_process,
            process_at: *process_at,
        }),
        _ => Err(corrupt(table, format!("malformed queue key {key:?}"))),
    }
}

fn text_map_column(
    table: &str,
    row: &Row,
    name: &str,
) -> Result<BTreeMap<String, String>, StoreError> {
    match row.get(name) {
        None => Ok(BTreeMap::new()),
        Some(value) => value
            .as_text_map()
            .cloned()
            .ok_or_else(|| corrupt(table, format!("column {name} is not a text map"))),
    }
}

// A null careers column reads as the empty set.
fn text_set_column(table: &str, row: &Row, name: &str) -> Result<BTreeSet<String>, StoreError> {
    match row.get(name) {
        None => Ok(BTreeSet::new()),
        Some(value) => value
            .as_text_set()
            .cloned()
            .ok_or_else(|| corrupt(table, format!("column {name} is not a text set"))),
    }
}

fn bool_column(table: &str, row: &Row, name: &str) -> Result<bool, StoreError> {
    row.get(name)
        .and_then(Value::as_bool)
        .ok_or_else(|| corrupt(table, format!("column {name} is not a bool")))
}

fn at_column(
    table: &str,
    row: &Row,
    name: &str,
) -> Result<Option<DateTime<Utc>>, StoreError> {
    row.get(name)
        .and_then(Value::as_at)
        .ok_or_else(|| corrupt(table, format!("column {name} is not a timestamp")))
}

fn offer_columns(features: &BTreeMap<String, String>, careers: &BTreeSet<String>) -> Row {
    let mut row = Row::new();
    row.insert(COL_FEATURES.to_string(), Value::TextMap(features.clone()));
    row.insert(COL_CAREERS.to_string(), Value::TextSet(careers.clone()));
    row
}

/// Write-once intake area for freshly scraped offers, deduplicated by
/// identity. Duplicate scrapes before promotion collapse to the last write.
pub struct StagingBuffer<S> {
    store: Arc<S>,
    table: String,
}

impl<S: WideColumnStore> StagingBuffer<S> {
    pub fn new(store: Arc<S>, table: String) -> Self {
        Self { store, table }
    }

    pub async fn put(&self, staged: &StagedOffer) -> Result<(), StoreError> {
        self.store
            .put(
                &self.table,
                offer_key(&staged.id),
                offer_columns(&staged.features, &staged.careers),
            )
            .await
    }

    pub async fn list_all(&self, limit: Option<usize>) -> Result<Vec<StagedOffer>, StoreError> {
        let rows = self
            .store
            .scan(&self.table, &RowKey(Vec::new()), limit)
            .await?;
        let mut staged = Vec::with_capacity(rows.len());
        for (key, row) in rows {
            staged.push(StagedOffer {
                id: offer_id_from_key(&self.table, &key)?,
                features: text_map_column(&self.table, &row, COL_FEATURES)?,
                careers: text_set_column(&self.table, &row, COL_CAREERS)?,
            });
        }
        Ok(staged)
    }

    /// Idempotent; the underlying delete of an absent key is a no-op.
    pub async fn remove(&self, id: &OfferId) -> Result<(), StoreError> {
        self.store.delete(&self.table, &offer_key(id)).await
    }
}

/// Secondary structure mapping an offer to its current skills by field.
/// Purely derived from reconciliation; never edited by anything else.
pub struct SkillIndex<S> {
    store: Arc<S>,
    table: String,
}

impl<S: WideColumnStore> SkillIndex<S> {
    pub fn new(store: Arc<S>, table: String) -> Self {
        Self { store, table }
    }

    /// Reconstructs the full skill map for one offer from its index rows.
    pub async fn skills_of(&self, id: &OfferId) -> Result<SkillMap, StoreError> {
        let rows = self.store.scan(&self.table, &offer_key(id), None).await?;
        let mut skills = SkillMap::new();
        for (key, _) in rows {
            match (key.part(3), key.part(4)) {
                (Some(KeyPart::Text(field)), Some(KeyPart::Text(skill))) => {
                    skills
                        .entry(field.clone())
                        .or_default()
                        .insert(skill.clone());
                }
                _ => {
                    return Err(corrupt(
                        &self.table,
                        format!("malformed skill index key {key:?}"),
                    ))
                }
            }
        }
        Ok(skills)
    }

    pub async fn add(&self, id: &OfferId, field: &str, skill: &str) -> Result<(), StoreError> {
        self.store
            .put(&self.table, skill_entry_key(id, field, skill), Row::new())
            .await
    }

    pub async fn remove(&self, id: &OfferId, field: &str, skill: &str) -> Result<(), StoreError> {
        self.store
            .delete(&self.table, &skill_entry_key(id, field, skill))
            .await
    }
}

/// Aggregate skill-mention counts per (period, career, field, skill),
/// maintained through atomic relative adjustments only.
pub struct SkillCounters<S> {
    store: Arc<S>,
    table: String,
}

impl<S: WideColumnStore> SkillCounters<S> {
    pub fn new(store: Arc<S>, table: String) -> Self {
        Self { store, table }
    }

    pub async fn adjust(
        &self,
        id: &OfferId,
        career: &str,
        field: &str,
        skill: &str,
        delta: i64,
    ) -> Result<(), StoreError> {
        self.store
            .counter_adjust(
                &self.table,
                &counter_key(id.year, id.month, career, field, skill),
                delta,
            )
            .await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileStep {
    ReadState,
    RetractRemovals,
    WriteCanonical,
    ApplyAdditions,
    ClearStaging,
}

impl fmt::Display for ReconcileStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReconcileStep::ReadState => "read-state",
            ReconcileStep::RetractRemovals => "retract-removals",
            ReconcileStep::WriteCanonical => "write-canonical",
            ReconcileStep::ApplyAdditions => "apply-additions",
            ReconcileStep::ClearStaging => "clear-staging",
        };
        f.write_str(name)
    }
}

/// A reconciliation failure, carrying enough context to retry or alert.
#[derive(Debug, Error)]
#[error("reconciliation of {id} failed during {step}: {source}")]
pub struct ReconcileError {
    pub id: OfferId,
    pub step: ReconcileStep,
    #[source]
    pub source: StoreError,
}

fn fail(id: &OfferId, step: ReconcileStep) -> impl FnOnce(StoreError) -> ReconcileError + '_ {
    move |source| ReconcileError {
        id: id.clone(),
        step,
        source,
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileOutcome {
    pub contributions_retracted: usize,
    pub contributions_added: usize,
    pub index_removed: usize,
    pub index_added: usize,
}

/// Computes the diff between the stored and the freshly scraped state of one
/// offer and applies it across the canonical row, the skill index, and the
/// popularity counters.
///
/// A counter contribution is one (career, field, skill) triple attributable
/// to the offer. Careers and skills can change in the same pass, so
/// retractions are scoped to the old career set and additions to the new
/// one; a career added while a skill is retained still gains that skill's
/// contribution, and a career removed still loses it.
///
/// Callers must ensure at most one reconciliation per identity runs at a
/// time; concurrent passes for the same offer would double-count.
pub struct Reconciler<S> {
    store: Arc<S>,
    tables: Tables,
    staging: StagingBuffer<S>,
    index: SkillIndex<S>,
    counters: SkillCounters<S>,
}

impl<S: WideColumnStore> Reconciler<S> {
    pub fn new(store: Arc<S>, tables: Tables) -> Self {
        let staging = StagingBuffer::new(Arc::clone(&store), tables.new_offers.clone());
        let index = SkillIndex::new(Arc::clone(&store), tables.offer_skills.clone());
        let counters = SkillCounters::new(Arc::clone(&store), tables.counters.clone());
        Self {
            store,
            tables,
            staging,
            index,
            counters,
        }
    }

    pub fn staging(&self) -> &StagingBuffer<S> {
        &self.staging
    }

    pub fn index(&self) -> &SkillIndex<S> {
        &self.index
    }

    /// Canonical careers + features for one offer, `None` when the offer was
    /// never promoted.
    pub async fn load_canonical(
        &self,
        id: &OfferId,
    ) -> Result<Option<(BTreeMap<String, String>, BTreeSet<String>)>, StoreError> {
        let row = self.store.get(&self.tables.offers, &offer_key(id)).await?;
        row.map(|row| {
            Ok((
                text_map_column(&self.tables.offers, &row, COL_FEATURES)?,
                text_set_column(&self.tables.offers, &row, COL_CAREERS)?,
            ))
        })
        .transpose()
    }

    async fn put_canonical(
        &self,
        id: &OfferId,
        features: &BTreeMap<String, String>,
        careers: &BTreeSet<String>,
    ) -> Result<(), StoreError> {
        self.store
            .put(
                &self.tables.offers,
                offer_key(id),
                offer_columns(features, careers),
            )
            .await
    }

    /// Promote the freshly scraped state of one offer, converging all
    /// denormalized views and clearing its staging entry.
    ///
    /// Idempotent under retry: a rerun re-reads the now-partially-updated
    /// state and applies only what is still missing.
    pub async fn reconcile(&self, new_state: &Offer) -> Result<ReconcileOutcome, ReconcileError> {
        let span = info_span!("reconcile", offer = %new_state.id);
        self.reconcile_inner(new_state).instrument(span).await
    }

    async fn reconcile_inner(
        &self,
        new_state: &Offer,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let id = &new_state.id;

        // Old canonical state; absent row means empty state, never an error.
        // Skills are always re-derived from the index, not the canonical row.
        let (old_careers, old_skills) = match self
            .load_canonical(id)
            .await
            .map_err(fail(id, ReconcileStep::ReadState))?
        {
            Some((_features, careers)) => {
                let skills = self
                    .index
                    .skills_of(id)
                    .await
                    .map_err(fail(id, ReconcileStep::ReadState))?;
                (careers, skills)
            }
            None => (BTreeSet::new(), SkillMap::new()),
        };

        let delta = OfferDelta::between(&old_careers, &old_skills, &new_state.careers, &new_state.skills);
        let mut outcome = ReconcileOutcome::default();

        // Retractions, scoped to the old career set. Removed careers lose
        // their contribution for every retained skill; fully removed skills
        // are decremented for every old career before their index entry
        // goes, so a mid-crash leaves an undercount instead of a phantom
        // positive counter.
        let retained_old = skill_map_subtract(&old_skills, &delta.skills_removed);
        for (field, skills) in &retained_old {
            for skill in skills {
                for career in &delta.careers_removed {
                    self.counters
                        .adjust(id, career, field, skill, -1)
                        .await
                        .map_err(fail(id, ReconcileStep::RetractRemovals))?;
                    outcome.contributions_retracted += 1;
                }
            }
        }
        for (field, skills) in &delta.skills_removed {
            for skill in skills {
                for career in &old_careers {
                    self.counters
                        .adjust(id, career, field, skill, -1)
                        .await
                        .map_err(fail(id, ReconcileStep::RetractRemovals))?;
                    outcome.contributions_retracted += 1;
                }
                self.index
                    .remove(id, field, skill)
                    .await
                    .map_err(fail(id, ReconcileStep::RetractRemovals))?;
                outcome.index_removed += 1;
            }
        }

        // Canonical row carries only careers + features.
        self.put_canonical(id, &new_state.features, &new_state.careers)
            .await
            .map_err(fail(id, ReconcileStep::WriteCanonical))?;

        // Additions, scoped to the new career set. Index entries go in
        // before their counters so the index stays a conservative superset
        // of what has been counted.
        let retained_new = skill_map_subtract(&new_state.skills, &delta.skills_added);
        for (field, skills) in &retained_new {
            for skill in skills {
                for career in &delta.careers_added {
                    self.counters
                        .adjust(id, career, field, skill, 1)
                        .await
                        .map_err(fail(id, ReconcileStep::ApplyAdditions))?;
                    outcome.contributions_added += 1;
                }
            }
        }
        for (field, skills) in &delta.skills_added {
            for skill in skills {
                self.index
                    .add(id, field, skill)
                    .await
                    .map_err(fail(id, ReconcileStep::ApplyAdditions))?;
                outcome.index_added += 1;
                for career in &new_state.careers {
                    self.counters
                        .adjust(id, career, field, skill, 1)
                        .await
                        .map_err(fail(id, ReconcileStep::ApplyAdditions))?;
                    outcome.contributions_added += 1;
                }
            }
        }

        // Promotion complete; the staging entry is no longer needed.
        self.staging
            .remove(id)
            .await
            .map_err(fail(id, ReconcileStep::ClearStaging))?;

        debug!(
            offer = %id,
            retracted = outcome.contributions_retracted,
            added = outcome.contributions_added,
            "reconciled"
        );
        Ok(outcome)
    }

    /// Union `careers` into the canonical row and contribute every skill the
    /// offer currently holds once per newly added career. Returns the number
    /// of contributions made.
    pub async fn add_careers(
        &self,
        id: &OfferId,
        careers: &BTreeSet<String>,
    ) -> Result<usize, ReconcileError> {
        let (features, existing) = self
            .load_canonical(id)
            .await
            .map_err(fail(id, ReconcileStep::ReadState))?
            .unwrap_or_default();
        let newly: BTreeSet<String> = careers.difference(&existing).cloned().collect();
        if newly.is_empty() {
            return Ok(0);
        }

        let skills = self
            .index
            .skills_of(id)
            .await
            .map_err(fail(id, ReconcileStep::ReadState))?;

        let mut merged = existing;
        merged.extend(newly.iter().cloned());
        self.put_canonical(id, &features, &merged)
            .await
            .map_err(fail(id, ReconcileStep::WriteCanonical))?;

        let mut contributed = 0;
        for (field, field_skills) in &skills {
            for skill in field_skills {
                for career in &newly {
                    self.counters
                        .adjust(id, career, field, skill, 1)
                        .await
                        .map_err(fail(id, ReconcileStep::ApplyAdditions))?;
                    contributed += 1;
                }
            }
        }
        Ok(contributed)
    }

    pub async fn add_career(&self, id: &OfferId, career: &str) -> Result<usize, ReconcileError> {
        let mut set = BTreeSet::new();
        set.insert(career.to_string());
        self.add_careers(id, &set).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued(QueuedOffer),
    AlreadyQueued,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RepairSummary {
    pub ordered_restored: usize,
    pub lookups_restored: usize,
}

/// Offers awaiting manual or automatic processing, kept in two tables: an
/// ordered table for dequeue order and a lookup-by-identity table that is
/// the authoritative "is queued" signal. The pair is written lookup-first
/// and deleted lookup-first; [`UnprocessedQueue::repair`] closes the gap a
/// crash between the two writes leaves behind.
pub struct UnprocessedQueue<S> {
    store: Arc<S>,
    ordered_table: String,
    lookup_table: String,
}

impl<S: WideColumnStore> UnprocessedQueue<S> {
    pub fn new(store: Arc<S>, tables: &Tables) -> Self {
        Self {
            store,
            ordered_table: tables.unprocessed.clone(),
            lookup_table: tables.unprocessed_by_id.clone(),
        }
    }

    fn lookup_row(queued: &QueuedOffer) -> Row {
        let mut row = Row::new();
        row.insert(
            COL_AUTO_PROCESS.to_string(),
            Value::Bool(queued.auto_process),
        );
        row.insert(COL_PROCESS_AT.to_string(), Value::At(queued.process_at));
        row
    }

    fn queued_from_lookup(&self, id: &OfferId, row: &Row) -> Result<QueuedOffer, StoreError> {
        Ok(QueuedOffer {
            id: id.clone(),
            auto_process: bool_column(&self.lookup_table, row, COL_AUTO_PROCESS)?,
            process_at: at_column(&self.lookup_table, row, COL_PROCESS_AT)?,
        })
    }

    /// No-op when the offer is already queued. Auto-processed offers get a
    /// fresh timestamp; others are parked with a null timestamp, which sorts
    /// them to the front of the ordered table.
    pub async fn enqueue(
        &self,
        id: &OfferId,
        auto_process: bool,
    ) -> Result<EnqueueOutcome, StoreError> {
        let lookup_key = offer_key(id);
        if self
            .store
            .get(&self.lookup_table, &lookup_key)
            .await?
            .is_some()
        {
            return Ok(EnqueueOutcome::AlreadyQueued);
        }

        let queued = QueuedOffer {
            id: id.clone(),
            auto_process,
            process_at: auto_process.then(Utc::now),
        };

        // Lookup first: its presence is the "is queued" signal, and the
        // ordered row can be rebuilt from it by the repair pass.
        self.store
            .put(&self.lookup_table, lookup_key, Self::lookup_row(&queued))
            .await?;
        self.store
            .put(&self.ordered_table, ordered_queue_key(&queued), Row::new())
            .await?;
        Ok(EnqueueOutcome::Queued(queued))
    }

    /// Returns `false` when the offer was not queued. Mirrors enqueue's
    /// order: the lookup entry goes first so its absence immediately stops
    /// double-processing even if the ordered delete is lost.
    pub async fn remove(&self, id: &OfferId) -> Result<bool, StoreError> {
        let lookup_key = offer_key(id);
        let Some(row) = self.store.get(&self.lookup_table, &lookup_key).await? else {
            return Ok(false);
        };
        let queued = self.queued_from_lookup(id, &row)?;

        self.store.delete(&self.lookup_table, &lookup_key).await?;
        self.store
            .delete(&self.ordered_table, &ordered_queue_key(&queued))
            .await?;
        Ok(true)
    }

    /// Remove-then-enqueue with a freshly computed timestamp; not a rename.
    pub async fn reclassify(
        &self,
        id: &OfferId,
        auto_process: bool,
    ) -> Result<EnqueueOutcome, StoreError> {
        self.remove(id).await?;
        self.enqueue(id, auto_process).await
    }

    pub async fn is_queued(&self, id: &OfferId) -> Result<bool, StoreError> {
        Ok(self
            .store
            .get(&self.lookup_table, &offer_key(id))
            .await?
            .is_some())
    }

    /// Queued entries in processing order.
    pub async fn list(&self, limit: Option<usize>) -> Result<Vec<QueuedOffer>, StoreError> {
        self.scan_ordered(RowKey(Vec::new()), limit).await
    }

    /// Only the automatic or only the manual partition, in processing
    /// order. This is the consumer-facing dequeue path; the ordered key
    /// leads with the flag precisely so it scans as a prefix.
    pub async fn list_by_class(
        &self,
        auto_process: bool,
        limit: Option<usize>,
    ) -> Result<Vec<QueuedOffer>, StoreError> {
        self.scan_ordered(RowKey(vec![KeyPart::Bool(auto_process)]), limit)
            .await
    }

    async fn scan_ordered(
        &self,
        prefix: RowKey,
        limit: Option<usize>,
    ) -> Result<Vec<QueuedOffer>, StoreError> {
        let rows = self.store.scan(&self.ordered_table, &prefix, limit).await?;
        rows.iter()
            .map(|(key, _)| queued_from_ordered_key(&self.ordered_table, key))
            .collect()
    }

    /// Re-create the missing half of any asymmetric lookup/ordered pair.
    /// Idempotent and safe to run concurrently with normal traffic; it only
    /// ever adds rows.
    pub async fn repair(&self) -> Result<RepairSummary, StoreError> {
        let lookups = self
            .store
            .scan(&self.lookup_table, &RowKey(Vec::new()), None)
            .await?;
        let ordered = self
            .store
            .scan(&self.ordered_table, &RowKey(Vec::new()), None)
            .await?;

        let mut ordered_keys = BTreeSet::new();
        let mut ordered_entries = Vec::with_capacity(ordered.len());
        for (key, _) in &ordered {
            ordered_keys.insert(key.clone());
            ordered_entries.push(queued_from_ordered_key(&self.ordered_table, key)?);
        }

        let mut summary = RepairSummary::default();
        let mut lookup_ids = BTreeSet::new();

        for (key, row) in &lookups {
            let id = offer_id_from_key(&self.lookup_table, key)?;
            let queued = self.queued_from_lookup(&id, row)?;
            lookup_ids.insert(id.clone());
            let ordered_key = ordered_queue_key(&queued);
            if !ordered_keys.contains(&ordered_key) {
                warn!(offer = %id, "restoring missing ordered queue entry");
                self.store
                    .put(&self.ordered_table, ordered_key, Row::new())
                    .await?;
                summary.ordered_restored += 1;
            }
        }

        for queued in &ordered_entries {
            if !lookup_ids.contains(&queued.id) {
                warn!(offer = %queued.id, "restoring missing queue lookup entry");
                self.store
                    .put(
                        &self.lookup_table,
                        offer_key(&queued.id),
                        Self::lookup_row(queued),
                    )
                    .await?;
                summary.lookups_restored += 1;
            }
        }

        Ok(summary)
    }
}

/// Lazily grown map from offer identity to its reconciliation lock,
/// giving the at-most-one-pass-per-identity guarantee the engine requires.
#[derive(Default)]
pub struct IdentityLocks {
    locks: Mutex<HashMap<OfferId, Arc<Mutex<()>>>>,
}

impl IdentityLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock_for(&self, id: &OfferId) -> Arc<Mutex<()>> {
        let mut map = self.locks.lock().await;
        map.entry(id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

/// Derives the skill map for a staged offer during promotion. Implemented
/// by the template engine upstream; [`NoSkills`] is the hookless default.
pub trait SkillExtractor: Send + Sync {
    fn extract(&self, staged: &StagedOffer) -> SkillMap;
}

#[derive(Default)]
pub struct NoSkills;

impl SkillExtractor for NoSkills {
    fn extract(&self, _staged: &StagedOffer) -> SkillMap {
        SkillMap::new()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PromotionRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub scanned: usize,
    pub promoted: usize,
    pub failed: usize,
}

/// Batch driver: drains the staging buffer through the reconciler, one
/// offer at a time per identity, retrying transient store failures with
/// capped exponential backoff. Failures never abort the batch.
pub struct PromotionRunner<S> {
    engine: Reconciler<S>,
    locks: IdentityLocks,
    retry: RetryPolicy,
}

impl<S: WideColumnStore> PromotionRunner<S> {
    pub fn new(engine: Reconciler<S>, retry: RetryPolicy) -> Self {
        Self {
            engine,
            locks: IdentityLocks::new(),
            retry,
        }
    }

    pub fn engine(&self) -> &Reconciler<S> {
        &self.engine
    }

    pub async fn promote_all(
        &self,
        extractor: &dyn SkillExtractor,
        limit: Option<usize>,
    ) -> Result<PromotionRunSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();

        let staged = self
            .engine
            .staging()
            .list_all(limit)
            .await
            .context("listing staged offers")?;
        let scanned = staged.len();
        let mut promoted = 0usize;
        let mut failed = 0usize;

        for entry in staged {
            let lock = self.locks.lock_for(&entry.id).await;
            let _guard = lock.lock().await;

            let offer = Offer {
                id: entry.id.clone(),
                skills: extractor.extract(&entry),
                features: entry.features,
                careers: entry.careers,
            };

            match self.reconcile_with_retry(&offer).await {
                Ok(_) => promoted += 1,
                Err(err) => {
                    warn!(%run_id, offer = %offer.id, error = %err, "promotion failed");
                    failed += 1;
                }
            }
        }

        let summary = PromotionRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            scanned,
            promoted,
            failed,
        };
        info!(%run_id, scanned, promoted, failed, "promotion run complete");
        Ok(summary)
    }

    /// Whole-pass retry on transient errors: each attempt re-derives the old
    /// state from storage, so replays only apply the remaining deltas.
    async fn reconcile_with_retry(
        &self,
        offer: &Offer,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let mut attempt = 0;
        loop {
            match self.engine.reconcile(offer).await {
                Ok(outcome) => return Ok(outcome),
                Err(err) => {
                    let transient =
                        classify_store_error(&err.source) == RetryDisposition::Retryable;
                    if transient && attempt < self.retry.max_retries {
                        warn!(offer = %offer.id, attempt, error = %err, "transient store failure; retrying");
                        tokio::time::sleep(self.retry.delay_for_attempt(attempt)).await;
                        attempt += 1;
                    } else {
                        return Err(err);
                    }
                }
            }
        }
    }
}

/// Convenience entry point wiring the engine from environment config, with
/// every store call bounded by the configured deadline.
pub async fn promote_staged_from_env<S: WideColumnStore>(
    store: S,
    extractor: &dyn SkillExtractor,
) -> Result<PromotionRunSummary> {
    let config = EngineConfig::from_env();
    let store = Arc::new(TimeoutStore::new(store, config.op_timeout));
    let engine = Reconciler::new(store, config.tables.clone());
    let runner = PromotionRunner::new(engine, config.retry);
    runner.promote_all(extractor, config.batch_limit).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicIsize, Ordering};

    use async_trait::async_trait;
    use skilldex_store::MemoryStore;

    fn careers(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn skills(entries: &[(&str, &[&str])]) -> SkillMap {
        entries
            .iter()
            .map(|(field, names)| {
                (
                    field.to_string(),
                    names.iter().map(|s| s.to_string()).collect(),
                )
            })
            .collect()
    }

    fn offer(id: &OfferId, career_names: &[&str], skill_entries: &[(&str, &[&str])]) -> Offer {
        Offer {
            id: id.clone(),
            features: BTreeMap::new(),
            careers: careers(career_names),
            skills: skills(skill_entries),
        }
    }

    fn engine(store: &Arc<MemoryStore>) -> Reconciler<MemoryStore> {
        Reconciler::new(Arc::clone(store), Tables::default())
    }

    async fn counter(store: &MemoryStore, career: &str, field: &str, skill: &str) -> Option<i64> {
        store
            .counter_value("counter_table", &counter_key(2026, 7, career, field, skill))
            .await
    }

    #[tokio::test]
    async fn growing_careers_and_skills_counts_every_new_contribution() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine(&store);
        let id = OfferId::new("o1", 2026, 7);

        engine
            .reconcile(&offer(&id, &["ops"], &[("backend", &["go"])]))
            .await
            .unwrap();
        engine
            .reconcile(&offer(&id, &["ops", "data"], &[("backend", &["go", "rust"])]))
            .await
            .unwrap();

        assert_eq!(counter(&store, "ops", "backend", "go").await, Some(1));
        assert_eq!(counter(&store, "ops", "backend", "rust").await, Some(1));
        assert_eq!(counter(&store, "data", "backend", "go").await, Some(1));
        assert_eq!(counter(&store, "data", "backend", "rust").await, Some(1));

        let indexed = engine.index().skills_of(&id).await.unwrap();
        assert_eq!(indexed, skills(&[("backend", &["go", "rust"])]));

        let (_, canonical_careers) = engine.load_canonical(&id).await.unwrap().unwrap();
        assert_eq!(canonical_careers, careers(&["ops", "data"]));
    }

    #[tokio::test]
    async fn emptying_an_offer_retracts_its_contributions() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine(&store);
        let id = OfferId::new("o1", 2026, 7);

        engine
            .reconcile(&offer(&id, &["ops"], &[("backend", &["go"])]))
            .await
            .unwrap();
        engine.reconcile(&offer(&id, &[], &[])).await.unwrap();

        assert_eq!(counter(&store, "ops", "backend", "go").await, Some(0));
        assert!(engine.index().skills_of(&id).await.unwrap().is_empty());

        let (_, canonical_careers) = engine.load_canonical(&id).await.unwrap().unwrap();
        assert!(canonical_careers.is_empty());
    }

    #[tokio::test]
    async fn removed_career_loses_retained_skill_contributions() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine(&store);
        let id = OfferId::new("o1", 2026, 7);

        engine
            .reconcile(&offer(&id, &["ops", "data"], &[("backend", &["go"])]))
            .await
            .unwrap();
        engine
            .reconcile(&offer(&id, &["ops"], &[("backend", &["go"])]))
            .await
            .unwrap();

        assert_eq!(counter(&store, "ops", "backend", "go").await, Some(1));
        assert_eq!(counter(&store, "data", "backend", "go").await, Some(0));
        // The offer still lists the skill, so its index entry stays.
        assert_eq!(
            engine.index().skills_of(&id).await.unwrap(),
            skills(&[("backend", &["go"])])
        );
    }

    #[tokio::test]
    async fn reconcile_is_idempotent_for_identical_state() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine(&store);
        let id = OfferId::new("o1", 2026, 7);
        let state = offer(&id, &["ops"], &[("backend", &["go"]), ("cloud", &["aws"])]);

        engine.reconcile(&state).await.unwrap();
        let counters_once = store.counter_snapshot("counter_table").await;
        let second = engine.reconcile(&state).await.unwrap();

        assert_eq!(second, ReconcileOutcome::default());
        assert_eq!(store.counter_snapshot("counter_table").await, counters_once);
        assert_eq!(engine.index().skills_of(&id).await.unwrap(), state.skills);
    }

    #[tokio::test]
    async fn serial_history_converges_to_last_state() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine(&store);
        let id = OfferId::new("o1", 2026, 7);

        engine
            .reconcile(&offer(&id, &["ops"], &[("backend", &["go", "c"])]))
            .await
            .unwrap();
        engine
            .reconcile(&offer(&id, &["ops", "data"], &[("backend", &["go"])]))
            .await
            .unwrap();
        engine
            .reconcile(&offer(&id, &["data"], &[("backend", &["rust"]), ("cloud", &["aws"])]))
            .await
            .unwrap();

        assert_eq!(
            engine.index().skills_of(&id).await.unwrap(),
            skills(&[("backend", &["rust"]), ("cloud", &["aws"])])
        );

        // Every contribution a past state made and the last state no longer
        // implies must be back to zero; the live ones must be exactly one.
        assert_eq!(counter(&store, "ops", "backend", "go").await, Some(0));
        assert_eq!(counter(&store, "ops", "backend", "c").await, Some(0));
        assert_eq!(counter(&store, "data", "backend", "go").await, Some(0));
        assert_eq!(counter(&store, "data", "backend", "rust").await, Some(1));
        assert_eq!(counter(&store, "data", "cloud", "aws").await, Some(1));
    }

    #[tokio::test]
    async fn staging_collapses_duplicate_scrapes_to_the_latest() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine(&store);
        let id = OfferId::new("x", 2026, 7);

        let first = StagedOffer {
            id: id.clone(),
            features: BTreeMap::new(),
            careers: careers(&["ops"]),
        };
        let second = StagedOffer {
            id: id.clone(),
            features: BTreeMap::new(),
            careers: careers(&["data"]),
        };
        engine.staging().put(&first).await.unwrap();
        engine.staging().put(&second).await.unwrap();

        let staged = engine.staging().list_all(None).await.unwrap();
        assert_eq!(staged.len(), 1);
        assert_eq!(staged[0].careers, careers(&["data"]));

        struct FixedSkills;
        impl SkillExtractor for FixedSkills {
            fn extract(&self, _staged: &StagedOffer) -> SkillMap {
                skills(&[("backend", &["go"])])
            }
        }

        let runner = PromotionRunner::new(engine, RetryPolicy::default());
        let summary = runner.promote_all(&FixedSkills, None).await.unwrap();
        assert_eq!(summary.scanned, 1);
        assert_eq!(summary.promoted, 1);
        assert_eq!(summary.failed, 0);

        // Promotion used only the latest write and cleared the entry.
        let (_, canonical_careers) = runner
            .engine()
            .load_canonical(&id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(canonical_careers, careers(&["data"]));
        assert_eq!(counter(&store, "data", "backend", "go").await, Some(1));
        assert_eq!(counter(&store, "ops", "backend", "go").await, None);
        assert!(runner.engine().staging().list_all(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn duplicate_enqueue_is_a_noop() {
        let store = Arc::new(MemoryStore::new());
        let queue = UnprocessedQueue::new(Arc::clone(&store), &Tables::default());
        let id = OfferId::new("o1", 2026, 7);

        let first = queue.enqueue(&id, true).await.unwrap();
        assert!(matches!(first, EnqueueOutcome::Queued(_)));
        let second = queue.enqueue(&id, true).await.unwrap();
        assert_eq!(second, EnqueueOutcome::AlreadyQueued);

        assert_eq!(store.row_count("unprocessed_offers").await, 1);
        assert_eq!(store.row_count("unprocessed_offers_by_id").await, 1);
    }

    #[tokio::test]
    async fn queue_remove_and_reclassify() {
        let store = Arc::new(MemoryStore::new());
        let queue = UnprocessedQueue::new(Arc::clone(&store), &Tables::default());
        let id = OfferId::new("o1", 2026, 7);

        assert!(!queue.remove(&id).await.unwrap());

        queue.enqueue(&id, true).await.unwrap();
        assert!(queue.is_queued(&id).await.unwrap());
        assert!(queue.remove(&id).await.unwrap());
        assert!(!queue.is_queued(&id).await.unwrap());
        assert_eq!(store.row_count("unprocessed_offers").await, 0);

        // Reclassifying to manual parks the entry with a null timestamp.
        queue.enqueue(&id, true).await.unwrap();
        let outcome = queue.reclassify(&id, false).await.unwrap();
        let EnqueueOutcome::Queued(queued) = outcome else {
            panic!("reclassify should re-enqueue");
        };
        assert!(!queued.auto_process);
        assert_eq!(queued.process_at, None);
        assert_eq!(store.row_count("unprocessed_offers").await, 1);
    }

    #[tokio::test]
    async fn null_timestamp_entries_dequeue_first() {
        let store = Arc::new(MemoryStore::new());
        let queue = UnprocessedQueue::new(Arc::clone(&store), &Tables::default());

        queue
            .enqueue(&OfferId::new("auto", 2026, 7), true)
            .await
            .unwrap();
        queue
            .enqueue(&OfferId::new("manual", 2026, 7), false)
            .await
            .unwrap();

        let listed = queue.list(None).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id.id, "manual");
        assert_eq!(listed[0].process_at, None);
        assert_eq!(listed[1].id.id, "auto");
    }

    #[test]
    fn config_from_env_honors_overrides() {
        let vars = [
            ("SKILLDEX_OFFERS_TABLE", "offers_v2"),
            ("SKILLDEX_COUNTER_TABLE", "counter_table_v2"),
            ("SKILLDEX_BATCH_LIMIT", "25"),
            ("SKILLDEX_OP_TIMEOUT_MS", "1234"),
            ("SKILLDEX_MAX_RETRIES", "7"),
            ("SKILLDEX_RETRY_BASE_DELAY_MS", "40"),
            ("SKILLDEX_RETRY_MAX_DELAY_MS", "900"),
        ];
        for (name, value) in vars {
            std::env::set_var(name, value);
        }

        let config = EngineConfig::from_env();
        for (name, _) in vars {
            std::env::remove_var(name);
        }

        assert_eq!(config.tables.offers, "offers_v2");
        assert_eq!(config.tables.counters, "counter_table_v2");
        // Untouched names keep their defaults.
        assert_eq!(config.tables.new_offers, "new_offers");
        assert_eq!(config.batch_limit, Some(25));
        assert_eq!(config.op_timeout, Duration::from_millis(1234));
        assert_eq!(config.retry.max_retries, 7);
        assert_eq!(config.retry.base_delay, Duration::from_millis(40));
        assert_eq!(config.retry.max_delay, Duration::from_millis(900));
    }

    #[tokio::test]
    async fn list_by_class_scans_one_partition_in_order() {
        let store = Arc::new(MemoryStore::new());
        let queue = UnprocessedQueue::new(Arc::clone(&store), &Tables::default());

        queue
            .enqueue(&OfferId::new("auto-1", 2026, 7), true)
            .await
            .unwrap();
        queue
            .enqueue(&OfferId::new("manual-1", 2026, 7), false)
            .await
            .unwrap();
        queue
            .enqueue(&OfferId::new("auto-2", 2026, 7), true)
            .await
            .unwrap();

        let auto = queue.list_by_class(true, None).await.unwrap();
        assert_eq!(auto.len(), 2);
        assert!(auto.iter().all(|q| q.auto_process));
        // Earlier-enqueued auto offer dequeues first.
        assert_eq!(auto[0].id.id, "auto-1");
        assert_eq!(auto[1].id.id, "auto-2");

        let manual = queue.list_by_class(false, None).await.unwrap();
        assert_eq!(manual.len(), 1);
        assert_eq!(manual[0].id.id, "manual-1");

        let limited = queue.list_by_class(true, Some(1)).await.unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].id.id, "auto-1");
    }

    #[tokio::test]
    async fn repair_restores_both_missing_halves() {
        let store = Arc::new(MemoryStore::new());
        let queue = UnprocessedQueue::new(Arc::clone(&store), &Tables::default());
        let half_ordered = OfferId::new("lost-ordered", 2026, 7);
        let half_lookup = OfferId::new("lost-lookup", 2026, 7);

        let EnqueueOutcome::Queued(q1) = queue.enqueue(&half_ordered, true).await.unwrap() else {
            panic!("fresh enqueue");
        };
        let EnqueueOutcome::Queued(q2) = queue.enqueue(&half_lookup, false).await.unwrap() else {
            panic!("fresh enqueue");
        };

        // Simulate the two asymmetric crash outcomes.
        store
            .delete("unprocessed_offers", &ordered_queue_key(&q1))
            .await
            .unwrap();
        store
            .delete("unprocessed_offers_by_id", &offer_key(&q2.id))
            .await
            .unwrap();

        let summary = queue.repair().await.unwrap();
        assert_eq!(summary.ordered_restored, 1);
        assert_eq!(summary.lookups_restored, 1);

        assert!(queue.is_queued(&half_ordered).await.unwrap());
        assert!(queue.is_queued(&half_lookup).await.unwrap());
        assert_eq!(store.row_count("unprocessed_offers").await, 2);
        assert_eq!(store.row_count("unprocessed_offers_by_id").await, 2);

        // A second pass finds nothing to fix.
        assert_eq!(queue.repair().await.unwrap(), RepairSummary::default());
    }

    #[tokio::test]
    async fn add_careers_counts_existing_skills_once_per_new_career() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine(&store);
        let id = OfferId::new("o1", 2026, 7);

        engine
            .reconcile(&offer(&id, &["ops"], &[("backend", &["go", "rust"])]))
            .await
            .unwrap();

        let contributed = engine
            .add_careers(&id, &careers(&["ops", "data"]))
            .await
            .unwrap();
        assert_eq!(contributed, 2);
        assert_eq!(counter(&store, "data", "backend", "go").await, Some(1));
        assert_eq!(counter(&store, "data", "backend", "rust").await, Some(1));
        assert_eq!(counter(&store, "ops", "backend", "go").await, Some(1));

        let (_, canonical_careers) = engine.load_canonical(&id).await.unwrap().unwrap();
        assert_eq!(canonical_careers, careers(&["ops", "data"]));

        // Already-present careers are a no-op.
        assert_eq!(engine.add_career(&id, "data").await.unwrap(), 0);
    }

    /// Delegating store that fails exactly one write, counting puts,
    /// deletes, and counter adjusts in invocation order.
    struct FlakyStore {
        inner: MemoryStore,
        fail_on_write: AtomicIsize,
    }

    impl FlakyStore {
        fn failing_on(nth: isize) -> Self {
            Self {
                inner: MemoryStore::new(),
                fail_on_write: AtomicIsize::new(nth),
            }
        }

        fn check_write(&self, op: &'static str, table: &str) -> Result<(), StoreError> {
            if self.fail_on_write.fetch_sub(1, Ordering::SeqCst) == 1 {
                return Err(StoreError::Unavailable {
                    op,
                    table: table.to_string(),
                    reason: "injected fault".to_string(),
                });
            }
            Ok(())
        }
    }

    #[async_trait]
    impl WideColumnStore for FlakyStore {
        async fn get(&self, table: &str, key: &RowKey) -> Result<Option<Row>, StoreError> {
            self.inner.get(table, key).await
        }

        async fn scan(
            &self,
            table: &str,
            prefix: &RowKey,
            limit: Option<usize>,
        ) -> Result<Vec<(RowKey, Row)>, StoreError> {
            self.inner.scan(table, prefix, limit).await
        }

        async fn put(&self, table: &str, key: RowKey, row: Row) -> Result<(), StoreError> {
            self.check_write("put", table)?;
            self.inner.put(table, key, row).await
        }

        async fn delete(&self, table: &str, key: &RowKey) -> Result<(), StoreError> {
            self.check_write("delete", table)?;
            self.inner.delete(table, key).await
        }

        async fn counter_adjust(
            &self,
            table: &str,
            key: &RowKey,
            delta: i64,
        ) -> Result<(), StoreError> {
            self.check_write("counter_adjust", table)?;
            self.inner.counter_adjust(table, key, delta).await
        }
    }

    #[tokio::test]
    async fn retry_after_canonical_write_failure_converges() {
        // Promoting a fresh offer writes: canonical put, index put, counter
        // adjust, staging delete. Fail the very first write.
        let store = Arc::new(FlakyStore::failing_on(1));
        let engine = Reconciler::new(Arc::clone(&store), Tables::default());
        let id = OfferId::new("o1", 2026, 7);
        let state = offer(&id, &["ops"], &[("backend", &["go"])]);

        let err = engine.reconcile(&state).await.unwrap_err();
        assert_eq!(err.step, ReconcileStep::WriteCanonical);
        assert_eq!(err.id, id);

        engine.reconcile(&state).await.unwrap();
        assert_eq!(
            store
                .inner
                .counter_value("counter_table", &counter_key(2026, 7, "ops", "backend", "go"))
                .await,
            Some(1)
        );
        assert_eq!(engine.index().skills_of(&id).await.unwrap(), state.skills);
    }

    #[tokio::test]
    async fn retry_after_staging_clear_failure_applies_nothing_twice() {
        // Fail the fourth reconcile write (the fifth overall, after the
        // staging put below): everything applied, staging delete lost.
        let store = Arc::new(FlakyStore::failing_on(5));
        let engine = Reconciler::new(Arc::clone(&store), Tables::default());
        let id = OfferId::new("o1", 2026, 7);
        let state = offer(&id, &["ops"], &[("backend", &["go"])]);

        let staged = StagedOffer {
            id: id.clone(),
            features: BTreeMap::new(),
            careers: careers(&["ops"]),
        };
        engine.staging().put(&staged).await.unwrap();

        let err = engine.reconcile(&state).await.unwrap_err();
        assert_eq!(err.step, ReconcileStep::ClearStaging);

        // The rerun re-derives an empty delta and only clears staging.
        let outcome = engine.reconcile(&state).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::default());
        assert_eq!(
            store
                .inner
                .counter_value("counter_table", &counter_key(2026, 7, "ops", "backend", "go"))
                .await,
            Some(1)
        );
        assert!(engine.staging().list_all(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn runner_retries_transient_failures_to_completion() {
        let store = Arc::new(FlakyStore::failing_on(2));
        let engine = Reconciler::new(Arc::clone(&store), Tables::default());
        let id = OfferId::new("o1", 2026, 7);

        let staged = StagedOffer {
            id: id.clone(),
            features: BTreeMap::new(),
            careers: careers(&["ops"]),
        };
        engine.staging().put(&staged).await.unwrap();

        struct FixedSkills;
        impl SkillExtractor for FixedSkills {
            fn extract(&self, _staged: &StagedOffer) -> SkillMap {
                skills(&[("backend", &["go"])])
            }
        }

        let retry = RetryPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        };
        let runner = PromotionRunner::new(engine, retry);
        let summary = runner.promote_all(&FixedSkills, None).await.unwrap();
        assert_eq!(summary.promoted, 1);
        assert_eq!(summary.failed, 0);

        assert_eq!(
            store
                .inner
                .counter_value("counter_table", &counter_key(2026, 7, "ops", "backend", "go"))
                .await,
            Some(1)
        );
        assert!(runner.engine().staging().list_all(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn identity_locks_hand_out_one_mutex_per_identity() {
        let locks = IdentityLocks::new();
        let a = OfferId::new("a", 2026, 7);
        let b = OfferId::new("b", 2026, 7);

        let first = locks.lock_for(&a).await;
        let second = locks.lock_for(&a).await;
        let other = locks.lock_for(&b).await;

        assert!(Arc::ptr_eq(&first, &second));
        assert!(!Arc::ptr_eq(&first, &other));

        // Same identity really excludes: the second task must wait.
        let guard = first.lock().await;
        assert!(second.try_lock().is_err());
        drop(guard);
        assert!(second.try_lock().is_ok());
    }

    #[tokio::test]
    async fn promote_from_env_runs_with_defaults() {
        let store = MemoryStore::new();
        let summary = promote_staged_from_env(store, &NoSkills).await.unwrap();
        assert_eq!(summary.scanned, 0);
        assert_eq!(summary.promoted, 0);
        assert_eq!(summary.failed, 0);
    }
}
