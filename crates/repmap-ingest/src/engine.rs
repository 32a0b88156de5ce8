//! Reconciliation: one normalized record in, canonical state out.
//!
//! Writes for a canonical id are serialized through a keyed async lock so
//! concurrent producers cannot interleave the snapshot-then-merge sequence.
//! The whole step is idempotent: re-applying a byte-identical record replaces
//! the same snapshot and re-derives the same canonical row.

use std::collections::HashMap;
use std::future::Future;

use chrono::{DateTime, Utc};
use repmap_core::{CanonicalRepresentative, CrosswalkEntry, RepresentativeRecord, SourceSnapshot};
use repmap_storage::{BackoffPolicy, CanonicalStore, StorageError};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::crosswalk::{CrosswalkConfig, CrosswalkResolver, Resolution};
use crate::precedence::FieldPrecedence;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("record rejected: {0}")]
    Malformed(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// A new canonical representative was minted.
    Inserted,
    /// An existing canonical representative absorbed the record.
    Updated,
    /// The record was ambiguous and queued; canonical state untouched.
    Conflict,
}

#[derive(Debug, Clone)]
pub struct ReconcileReceipt {
    pub outcome: ReconcileOutcome,
    pub canonical_id: Option<Uuid>,
}

/// Retries an idempotent store operation on transient failures.
pub async fn retry_storage<T, F, Fut>(policy: &BackoffPolicy, mut op: F) -> Result<T, StorageError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StorageError>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < policy.max_retries => {
                let delay = policy.delay_for_attempt(attempt);
                warn!(error = %err, attempt, delay_ms = delay.as_millis() as u64, "transient store failure, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

pub struct ReconcileEngine {
    store: Arc<dyn CanonicalStore>,
    resolver: CrosswalkResolver,
    precedence: FieldPrecedence,
    retry: BackoffPolicy,
    locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl ReconcileEngine {
    pub fn new(
        store: Arc<dyn CanonicalStore>,
        precedence: FieldPrecedence,
        retry: BackoffPolicy,
    ) -> Self {
        let resolver = CrosswalkResolver::new(store.clone(), CrosswalkConfig::default());
        Self {
            store,
            resolver,
            precedence,
            retry,
            locks: Mutex::new(HashMap::new()),
        }
    }

    async fn lock_for(&self, canonical_id: Uuid) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(canonical_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn validate(record: &RepresentativeRecord) -> Result<(), ReconcileError> {
        if record.source_id.trim().is_empty() {
            return Err(ReconcileError::Malformed("empty source id".into()));
        }
        if record.display_name.trim().is_empty() {
            return Err(ReconcileError::Malformed("empty display name".into()));
        }
        if record.state.trim().is_empty() {
            return Err(ReconcileError::Malformed("empty state".into()));
        }
        Ok(())
    }

    pub async fn reconcile(
        &self,
        record: &RepresentativeRecord,
        now: DateTime<Utc>,
    ) -> Result<ReconcileReceipt, ReconcileError> {
        Self::validate(record)?;

        match self.resolver.resolve(record, now).await? {
            Resolution::Conflict(conflict) => {
                retry_storage(&self.retry, || self.store.record_conflict(conflict.clone()))
                    .await?;
                debug!(
                    source = %record.source,
                    source_id = %record.source_id,
                    "ambiguous record queued for manual resolution"
                );
                Ok(ReconcileReceipt {
                    outcome: ReconcileOutcome::Conflict,
                    canonical_id: None,
                })
            }
            Resolution::Existing(canonical_id) => {
                self.absorb(record, canonical_id, false, false, now).await
            }
            Resolution::Matched(canonical_id) => {
                self.absorb(record, canonical_id, true, false, now).await
            }
            Resolution::Minted(canonical_id) => {
                self.absorb(record, canonical_id, true, true, now).await
            }
        }
    }

    /// Snapshot-then-merge under the canonical id's lock.
    async fn absorb(
        &self,
        record: &RepresentativeRecord,
        canonical_id: Uuid,
        insert_mapping: bool,
        minted: bool,
        now: DateTime<Utc>,
    ) -> Result<ReconcileReceipt, ReconcileError> {
        let lock = self.lock_for(canonical_id).await;
        let _guard = lock.lock().await;

        if minted {
            // The crosswalk row references the canonical row, so the
            // placeholder must land first.
            let placeholder = CanonicalRepresentative {
                id: canonical_id,
                display_name: record.display_name.clone(),
                party: record.party.clone(),
                level: record.level,
                state: record.state.clone(),
                chamber: record.chamber,
                district: record.district.clone(),
                is_active: false,
                created_at: now,
                updated_at: now,
            };
            retry_storage(&self.retry, || {
                self.store.upsert_representative(placeholder.clone())
            })
            .await?;
        }

        let mut inserted = minted;
        let canonical_id = if insert_mapping {
            let entry = CrosswalkEntry {
                id: Uuid::new_v4(),
                canonical_id,
                source: record.source,
                source_id: record.source_id.clone(),
                superseded: false,
                created_at: now,
            };
            match retry_storage(&self.retry, || self.store.crosswalk_insert(entry.clone())).await
            {
                Ok(()) => canonical_id,
                // Another producer mapped the pair between resolve and insert;
                // defer to whichever mapping won.
                Err(StorageError::DuplicateMapping { .. }) => {
                    match self
                        .store
                        .crosswalk_lookup(record.source, &record.source_id)
                        .await?
                    {
                        Some(existing) if existing.canonical_id != canonical_id => {
                            if minted {
                                // The placeholder never got a mapping; drop it
                                // rather than leaving an unreachable row.
                                retry_storage(&self.retry, || {
                                    self.store.delete_representative(canonical_id)
                                })
                                .await?;
                                inserted = false;
                            }
                            existing.canonical_id
                        }
                        _ => canonical_id,
                    }
                }
                Err(err) => return Err(err.into()),
            }
        } else {
            canonical_id
        };

        let snapshot = SourceSnapshot::from_record(record);
        retry_storage(&self.retry, || {
            self.store
                .put_source_snapshot(canonical_id, record.source, snapshot.clone())
        })
        .await?;

        self.remerge(canonical_id, now).await?;

        Ok(ReconcileReceipt {
            outcome: if inserted {
                ReconcileOutcome::Inserted
            } else {
                ReconcileOutcome::Updated
            },
            canonical_id: Some(canonical_id),
        })
    }

    /// Re-derives the canonical row from every stored snapshot. Also used after
    /// manual conflict resolution to fold in the late mapping.
    pub async fn remerge(
        &self,
        canonical_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(), ReconcileError> {
        let snapshots =
            retry_storage(&self.retry, || self.store.source_snapshots(canonical_id)).await?;
        let merged = self
            .precedence
            .merge(&snapshots)
            .ok_or_else(|| ReconcileError::Malformed("no mergeable snapshot".into()))?;

        let reference = now.date_naive();
        let is_active = snapshots.iter().any(|(_, s)| s.has_current_role(reference));
        let created_at = self
            .store
            .representative(canonical_id)
            .await?
            .map(|r| r.created_at)
            .unwrap_or(now);

        let row = CanonicalRepresentative {
            id: canonical_id,
            display_name: merged.display_name,
            party: merged.party,
            level: merged.level,
            state: merged.state,
            chamber: merged.chamber,
            district: merged.district,
            is_active,
            created_at,
            updated_at: now,
        };
        let state = row.state.clone();
        retry_storage(&self.retry, || self.store.upsert_representative(row.clone())).await?;
        retry_storage(&self.retry, || self.store.record_touch(&state, now)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone};
    use repmap_core::{Level, Source};
    use repmap_storage::MemoryStore;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn engine(store: &Arc<MemoryStore>) -> ReconcileEngine {
        ReconcileEngine::new(
            store.clone(),
            FieldPrecedence::default(),
            BackoffPolicy::default(),
        )
    }

    fn corpus_record(term_end: Option<NaiveDate>) -> RepresentativeRecord {
        RepresentativeRecord {
            source: Source::StaticCorpus,
            source_id: "JS1".into(),
            display_name: "Jane Smith".into(),
            name_parts: Default::default(),
            party: Some("Independent".into()),
            level: Level::Federal,
            state: "CA".into(),
            chamber: None,
            district: Some("12".into()),
            term_start: Some(date(2023, 1, 3)),
            term_end,
            contacts: vec![],
            social: vec![],
            committees: vec![],
            offices: vec![],
            extra: Default::default(),
            fetched_at: now(),
        }
    }

    fn api_record() -> RepresentativeRecord {
        RepresentativeRecord {
            source: Source::LegislativeApi,
            source_id: "ocd-person-42".into(),
            display_name: "Jane Smith".into(),
            name_parts: Default::default(),
            party: Some("Democratic".into()),
            level: Level::Federal,
            state: "CA".into(),
            chamber: None,
            district: Some("12".into()),
            term_start: Some(date(2023, 1, 3)),
            term_end: None,
            contacts: vec![],
            social: vec![],
            committees: vec![],
            offices: vec![],
            extra: Default::default(),
            fetched_at: now(),
        }
    }

    #[tokio::test]
    async fn two_sources_converge_on_one_canonical_row() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine(&store);

        let first = engine
            .reconcile(&corpus_record(Some(date(2026, 1, 3))), now())
            .await
            .unwrap();
        assert_eq!(first.outcome, ReconcileOutcome::Inserted);
        let canonical_id = first.canonical_id.unwrap();

        let second = engine.reconcile(&api_record(), now()).await.unwrap();
        assert_eq!(second.outcome, ReconcileOutcome::Updated);
        assert_eq!(second.canonical_id, Some(canonical_id));

        let mappings = store.crosswalk_for_canonical(canonical_id).await.unwrap();
        assert_eq!(mappings.len(), 2);

        // Current-role precedence: the live API's party wins the merge.
        let rep = store.representative(canonical_id).await.unwrap().unwrap();
        assert_eq!(rep.party.as_deref(), Some("Democratic"));
        assert!(rep.is_active);
    }

    #[tokio::test]
    async fn expired_term_flips_is_active_without_disturbing_identity() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine(&store);

        let receipt = engine
            .reconcile(&corpus_record(Some(date(2026, 1, 3))), now())
            .await
            .unwrap();
        let canonical_id = receipt.canonical_id.unwrap();
        assert!(store.representative(canonical_id).await.unwrap().unwrap().is_active);

        // Same source id, term now in the past.
        let receipt = engine
            .reconcile(&corpus_record(Some(date(2025, 1, 3))), now())
            .await
            .unwrap();
        assert_eq!(receipt.outcome, ReconcileOutcome::Updated);
        assert_eq!(receipt.canonical_id, Some(canonical_id));

        let rep = store.representative(canonical_id).await.unwrap().unwrap();
        assert!(!rep.is_active);
        assert_eq!(
            store.crosswalk_for_canonical(canonical_id).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn reapplying_an_identical_record_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine(&store);
        let record = corpus_record(None);

        let first = engine.reconcile(&record, now()).await.unwrap();
        let canonical_id = first.canonical_id.unwrap();
        let before = store.representative(canonical_id).await.unwrap().unwrap();

        let again = engine.reconcile(&record, now()).await.unwrap();
        assert_eq!(again.outcome, ReconcileOutcome::Updated);
        assert_eq!(again.canonical_id, Some(canonical_id));

        let after = store.representative(canonical_id).await.unwrap().unwrap();
        assert_eq!(before, after);
        assert_eq!(store.source_snapshots(canonical_id).await.unwrap().len(), 1);
        assert_eq!(
            store.crosswalk_for_canonical(canonical_id).await.unwrap().len(),
            1
        );
    }

    async fn seed_twin(store: &MemoryStore, source_id: &str) {
        let id = Uuid::new_v4();
        store
            .upsert_representative(CanonicalRepresentative {
                id,
                display_name: "Jane Smith".into(),
                party: None,
                level: Level::Federal,
                state: "CA".into(),
                chamber: None,
                district: None,
                is_active: true,
                created_at: now(),
                updated_at: now(),
            })
            .await
            .unwrap();
        store
            .crosswalk_insert(CrosswalkEntry {
                id: Uuid::new_v4(),
                canonical_id: id,
                source: Source::StaticCorpus,
                source_id: source_id.into(),
                superseded: false,
                created_at: now(),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn ambiguous_record_lands_in_the_conflict_queue() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine(&store);

        // Two same-name statewide rows with equal corroboration.
        seed_twin(&store, "JS1").await;
        seed_twin(&store, "JS2").await;

        let mut incoming = api_record();
        incoming.district = None;
        let receipt = engine.reconcile(&incoming, now()).await.unwrap();
        assert_eq!(receipt.outcome, ReconcileOutcome::Conflict);
        assert!(receipt.canonical_id.is_none());

        let queued = store.open_conflicts().await.unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].source_id, "ocd-person-42");
    }

    #[tokio::test]
    async fn losing_a_mapping_race_leaves_no_orphan_row() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine(&store);

        // The pair is already mapped by the time the minted insert lands.
        let winner = engine
            .reconcile(&api_record(), now())
            .await
            .unwrap()
            .canonical_id
            .unwrap();

        let loser = Uuid::new_v4();
        let receipt = engine
            .absorb(&api_record(), loser, true, true, now())
            .await
            .unwrap();

        assert_eq!(receipt.outcome, ReconcileOutcome::Updated);
        assert_eq!(receipt.canonical_id, Some(winner));
        assert!(store.representative(loser).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn record_missing_identity_fields_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine(&store);
        let mut record = corpus_record(None);
        record.display_name = "   ".into();

        let err = engine.reconcile(&record, now()).await.unwrap_err();
        assert!(matches!(err, ReconcileError::Malformed(_)));
    }
}
