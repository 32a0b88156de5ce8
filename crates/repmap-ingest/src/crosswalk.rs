//! Identifier crosswalk resolution.
//!
//! Matching order: an existing (source, source_id) mapping always wins; then
//! cross-source identity matching on normalized name plus state/district;
//! then a fresh canonical id. Ambiguity is never guessed away: ties that
//! survive the corroboration tie-break become queued conflicts.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use repmap_core::{CrosswalkConflict, RepresentativeRecord};
use repmap_storage::{CanonicalIdentity, CanonicalStore, StorageError};
use strsim::jaro_winkler;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Copy)]
pub struct CrosswalkConfig {
    /// Floor for the jaro-winkler assist on normalized names.
    pub fuzzy_threshold: f64,
}

impl Default for CrosswalkConfig {
    fn default() -> Self {
        Self {
            fuzzy_threshold: 0.95,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Resolution {
    /// The (source, source_id) pair already maps to this canonical id.
    Existing(Uuid),
    /// First sighting of this pair, matched to a canonical id another source
    /// established. The caller inserts the crosswalk row.
    Matched(Uuid),
    /// No plausible match anywhere; a canonical id was minted.
    Minted(Uuid),
    /// Multiple equally plausible canonical candidates.
    Conflict(CrosswalkConflict),
}

pub struct CrosswalkResolver {
    store: Arc<dyn CanonicalStore>,
    config: CrosswalkConfig,
}

impl CrosswalkResolver {
    pub fn new(store: Arc<dyn CanonicalStore>, config: CrosswalkConfig) -> Self {
        Self { store, config }
    }

    fn is_plausible(&self, identity: &CanonicalIdentity, name: &str, record: &RepresentativeRecord) -> bool {
        if !identity.state.eq_ignore_ascii_case(&record.state) {
            return false;
        }
        if identity.district != record.district {
            return false;
        }
        identity.normalized_name == name
            || jaro_winkler(&identity.normalized_name, name) >= self.config.fuzzy_threshold
    }

    pub async fn resolve(
        &self,
        record: &RepresentativeRecord,
        now: DateTime<Utc>,
    ) -> Result<Resolution, StorageError> {
        if let Some(entry) = self
            .store
            .crosswalk_lookup(record.source, &record.source_id)
            .await?
        {
            return Ok(Resolution::Existing(entry.canonical_id));
        }

        let name = record.normalized_name();
        let mut candidates: Vec<CanonicalIdentity> = self
            .store
            .canonical_identities(&record.state)
            .await?
            .into_iter()
            .filter(|identity| self.is_plausible(identity, &name, record))
            .collect();

        match candidates.len() {
            0 => Ok(Resolution::Minted(Uuid::new_v4())),
            1 => Ok(Resolution::Matched(candidates[0].id)),
            _ => {
                // Prefer the candidate with the most corroborating source
                // mappings; a residual tie is an unresolved conflict.
                candidates.sort_by(|a, b| {
                    b.mapping_count
                        .cmp(&a.mapping_count)
                        .then_with(|| a.id.cmp(&b.id))
                });
                if candidates[0].mapping_count > candidates[1].mapping_count {
                    return Ok(Resolution::Matched(candidates[0].id));
                }
                debug!(
                    source = %record.source,
                    source_id = %record.source_id,
                    candidates = candidates.len(),
                    "ambiguous crosswalk match"
                );
                Ok(Resolution::Conflict(CrosswalkConflict {
                    id: Uuid::new_v4(),
                    source: record.source,
                    source_id: record.source_id.clone(),
                    normalized_name: name,
                    state: record.state.clone(),
                    district: record.district.clone(),
                    candidates: candidates.into_iter().map(|c| c.id).collect(),
                    recorded_at: now,
                }))
            }
        }
    }
}

/// Manual resolution primitive for a queued conflict: map the conflicted
/// (source, source_id) pair to the chosen canonical id, superseding any
/// mapping that appeared in the meantime, then close the queue entry.
pub async fn apply_conflict_resolution(
    store: &dyn CanonicalStore,
    conflict: &CrosswalkConflict,
    chosen_canonical: Uuid,
    now: DateTime<Utc>,
) -> Result<(), StorageError> {
    let replacement = repmap_core::CrosswalkEntry {
        id: Uuid::new_v4(),
        canonical_id: chosen_canonical,
        source: conflict.source,
        source_id: conflict.source_id.clone(),
        superseded: false,
        created_at: now,
    };
    match store
        .crosswalk_lookup(conflict.source, &conflict.source_id)
        .await?
    {
        Some(_) => {
            store
                .crosswalk_supersede(conflict.source, &conflict.source_id, replacement)
                .await?
        }
        None => store.crosswalk_insert(replacement).await?,
    }
    store.close_conflict(conflict.id).await
}
