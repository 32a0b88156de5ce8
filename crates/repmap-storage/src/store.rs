//! Canonical store seam: the trait both the reconciliation engine and the
//! read API talk to, plus the in-memory implementation used by tests and the
//! no-database fallback.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use repmap_core::{
    normalize_name, CanonicalRepresentative, Chamber, CrosswalkConflict, CrosswalkEntry, Level,
    Source, SourceSnapshot,
};
use tokio::sync::RwLock;
use uuid::Uuid;

// Display/Error are implemented by hand: thiserror would treat the `source`
// field as the error cause, but it is a data-source tag, not an error.
#[derive(Debug)]
pub enum StorageError {
    DuplicateMapping { source: Source, source_id: String },
    MappingNotFound { source: Source, source_id: String },
    Database(String),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::DuplicateMapping { source, source_id } => {
                write!(f, "crosswalk mapping for {source}:{source_id} already exists")
            }
            StorageError::MappingNotFound { source, source_id } => {
                write!(f, "no crosswalk mapping for {source}:{source_id}")
            }
            StorageError::Database(msg) => write!(f, "database error: {msg}"),
        }
    }
}

impl std::error::Error for StorageError {}

impl StorageError {
    /// Database errors are treated as transient and retried at the
    /// single-record level; constraint violations are not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageError::Database(_))
    }
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        StorageError::Database(err.to_string())
    }
}

#[derive(Debug, Clone, Default)]
pub struct RepresentativeFilter {
    pub level: Option<Level>,
    pub chamber: Option<Chamber>,
    pub active_only: bool,
    pub limit: Option<usize>,
}

/// Minimal identity view the crosswalk matcher runs against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalIdentity {
    pub id: Uuid,
    pub normalized_name: String,
    pub state: String,
    pub district: Option<String>,
    pub mapping_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeatmapPoint {
    pub latitude: f64,
    pub longitude: f64,
}

#[async_trait]
pub trait CanonicalStore: Send + Sync {
    async fn representative(
        &self,
        id: Uuid,
    ) -> Result<Option<CanonicalRepresentative>, StorageError>;

    async fn upsert_representative(
        &self,
        rep: CanonicalRepresentative,
    ) -> Result<(), StorageError>;

    /// Removes a canonical row that never acquired a crosswalk mapping or
    /// snapshot. Rows that are still referenced are refused.
    async fn delete_representative(&self, id: Uuid) -> Result<(), StorageError>;

    async fn representatives_by_state(
        &self,
        state: &str,
        filter: &RepresentativeFilter,
    ) -> Result<Vec<CanonicalRepresentative>, StorageError>;

    /// District lookup for the by-address path: district matches plus
    /// statewide officeholders (district-less rows) for the same state.
    async fn representatives_by_district(
        &self,
        state: &str,
        district: &str,
    ) -> Result<Vec<CanonicalRepresentative>, StorageError>;

    async fn crosswalk_lookup(
        &self,
        source: Source,
        source_id: &str,
    ) -> Result<Option<CrosswalkEntry>, StorageError>;

    async fn crosswalk_insert(&self, entry: CrosswalkEntry) -> Result<(), StorageError>;

    /// Append-only correction: marks the live mapping for the pair superseded
    /// and inserts the replacement in its place.
    async fn crosswalk_supersede(
        &self,
        source: Source,
        source_id: &str,
        replacement: CrosswalkEntry,
    ) -> Result<(), StorageError>;

    async fn crosswalk_for_canonical(
        &self,
        canonical_id: Uuid,
    ) -> Result<Vec<CrosswalkEntry>, StorageError>;

    async fn canonical_identities(
        &self,
        state: &str,
    ) -> Result<Vec<CanonicalIdentity>, StorageError>;

    async fn put_source_snapshot(
        &self,
        canonical_id: Uuid,
        source: Source,
        snapshot: SourceSnapshot,
    ) -> Result<(), StorageError>;

    async fn source_snapshots(
        &self,
        canonical_id: Uuid,
    ) -> Result<Vec<(Source, SourceSnapshot)>, StorageError>;

    async fn record_conflict(&self, conflict: CrosswalkConflict) -> Result<(), StorageError>;

    async fn open_conflicts(&self) -> Result<Vec<CrosswalkConflict>, StorageError>;

    async fn close_conflict(&self, conflict_id: Uuid) -> Result<(), StorageError>;

    async fn record_touch(&self, state: &str, at: DateTime<Utc>) -> Result<(), StorageError>;

    async fn last_touch(&self, state: &str) -> Result<Option<DateTime<Utc>>, StorageError>;

    /// Office coordinates of active representatives inside a bounding box.
    async fn office_points(
        &self,
        min_lat: f64,
        min_lon: f64,
        max_lat: f64,
        max_lon: f64,
    ) -> Result<Vec<HeatmapPoint>, StorageError>;
}

#[derive(Default)]
struct MemoryInner {
    reps: HashMap<Uuid, CanonicalRepresentative>,
    crosswalk: Vec<CrosswalkEntry>,
    snapshots: HashMap<(Uuid, Source), SourceSnapshot>,
    conflicts: Vec<(CrosswalkConflict, bool)>,
    touches: HashMap<String, DateTime<Utc>>,
}

/// In-memory canonical store. Enforces the same invariants as the Postgres
/// implementation so the reconciliation tests exercise real semantics.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn apply_filter(
    mut rows: Vec<CanonicalRepresentative>,
    filter: &RepresentativeFilter,
) -> Vec<CanonicalRepresentative> {
    rows.retain(|r| {
        filter.level.is_none_or(|l| r.level == l)
            && filter.chamber.is_none_or(|c| r.chamber == Some(c))
            && (!filter.active_only || r.is_active)
    });
    rows.sort_by(|a, b| {
        (a.district.as_deref(), a.display_name.as_str())
            .cmp(&(b.district.as_deref(), b.display_name.as_str()))
    });
    if let Some(limit) = filter.limit {
        rows.truncate(limit);
    }
    rows
}

#[async_trait]
impl CanonicalStore for MemoryStore {
    async fn representative(
        &self,
        id: Uuid,
    ) -> Result<Option<CanonicalRepresentative>, StorageError> {
        Ok(self.inner.read().await.reps.get(&id).cloned())
    }

    async fn upsert_representative(
        &self,
        rep: CanonicalRepresentative,
    ) -> Result<(), StorageError> {
        self.inner.write().await.reps.insert(rep.id, rep);
        Ok(())
    }

    async fn delete_representative(&self, id: Uuid) -> Result<(), StorageError> {
        let mut inner = self.inner.write().await;
        let referenced = inner.crosswalk.iter().any(|e| e.canonical_id == id)
            || inner.snapshots.keys().any(|(canonical_id, _)| *canonical_id == id);
        if referenced {
            return Err(StorageError::Database(format!(
                "representative {id} is still referenced"
            )));
        }
        inner.reps.remove(&id);
        Ok(())
    }

    async fn representatives_by_state(
        &self,
        state: &str,
        filter: &RepresentativeFilter,
    ) -> Result<Vec<CanonicalRepresentative>, StorageError> {
        let inner = self.inner.read().await;
        let rows = inner
            .reps
            .values()
            .filter(|r| r.state.eq_ignore_ascii_case(state))
            .cloned()
            .collect();
        Ok(apply_filter(rows, filter))
    }

    async fn representatives_by_district(
        &self,
        state: &str,
        district: &str,
    ) -> Result<Vec<CanonicalRepresentative>, StorageError> {
        let inner = self.inner.read().await;
        let rows = inner
            .reps
            .values()
            .filter(|r| {
                r.state.eq_ignore_ascii_case(state)
                    && (r.district.is_none() || r.district.as_deref() == Some(district))
            })
            .cloned()
            .collect();
        Ok(apply_filter(rows, &RepresentativeFilter::default()))
    }

    async fn crosswalk_lookup(
        &self,
        source: Source,
        source_id: &str,
    ) -> Result<Option<CrosswalkEntry>, StorageError> {
        let inner = self.inner.read().await;
        Ok(inner
            .crosswalk
            .iter()
            .find(|e| !e.superseded && e.source == source && e.source_id == source_id)
            .cloned())
    }

    async fn crosswalk_insert(&self, entry: CrosswalkEntry) -> Result<(), StorageError> {
        let mut inner = self.inner.write().await;
        if inner
            .crosswalk
            .iter()
            .any(|e| !e.superseded && e.source == entry.source && e.source_id == entry.source_id)
        {
            return Err(StorageError::DuplicateMapping {
                source: entry.source,
                source_id: entry.source_id,
            });
        }
        inner.crosswalk.push(entry);
        Ok(())
    }

    async fn crosswalk_supersede(
        &self,
        source: Source,
        source_id: &str,
        replacement: CrosswalkEntry,
    ) -> Result<(), StorageError> {
        let mut inner = self.inner.write().await;
        let existing = inner
            .crosswalk
            .iter_mut()
            .find(|e| !e.superseded && e.source == source && e.source_id == source_id);
        match existing {
            Some(entry) => entry.superseded = true,
            None => {
                return Err(StorageError::MappingNotFound {
                    source,
                    source_id: source_id.to_string(),
                })
            }
        }
        inner.crosswalk.push(replacement);
        Ok(())
    }

    async fn crosswalk_for_canonical(
        &self,
        canonical_id: Uuid,
    ) -> Result<Vec<CrosswalkEntry>, StorageError> {
        let inner = self.inner.read().await;
        Ok(inner
            .crosswalk
            .iter()
            .filter(|e| !e.superseded && e.canonical_id == canonical_id)
            .cloned()
            .collect())
    }

    async fn canonical_identities(
        &self,
        state: &str,
    ) -> Result<Vec<CanonicalIdentity>, StorageError> {
        let inner = self.inner.read().await;
        Ok(inner
            .reps
            .values()
            .filter(|r| r.state.eq_ignore_ascii_case(state))
            .map(|r| CanonicalIdentity {
                id: r.id,
                normalized_name: normalize_name(&r.display_name),
                state: r.state.clone(),
                district: r.district.clone(),
                mapping_count: inner
                    .crosswalk
                    .iter()
                    .filter(|e| !e.superseded && e.canonical_id == r.id)
                    .count(),
            })
            .collect())
    }

    async fn put_source_snapshot(
        &self,
        canonical_id: Uuid,
        source: Source,
        snapshot: SourceSnapshot,
    ) -> Result<(), StorageError> {
        self.inner
            .write()
            .await
            .snapshots
            .insert((canonical_id, source), snapshot);
        Ok(())
    }

    async fn source_snapshots(
        &self,
        canonical_id: Uuid,
    ) -> Result<Vec<(Source, SourceSnapshot)>, StorageError> {
        let inner = self.inner.read().await;
        let mut out: Vec<(Source, SourceSnapshot)> = inner
            .snapshots
            .iter()
            .filter(|((id, _), _)| *id == canonical_id)
            .map(|((_, source), snapshot)| (*source, snapshot.clone()))
            .collect();
        out.sort_by_key(|(source, _)| *source);
        Ok(out)
    }

    async fn record_conflict(&self, conflict: CrosswalkConflict) -> Result<(), StorageError> {
        self.inner.write().await.conflicts.push((conflict, false));
        Ok(())
    }

    async fn open_conflicts(&self) -> Result<Vec<CrosswalkConflict>, StorageError> {
        let inner = self.inner.read().await;
        Ok(inner
            .conflicts
            .iter()
            .filter(|(_, resolved)| !resolved)
            .map(|(c, _)| c.clone())
            .collect())
    }

    async fn close_conflict(&self, conflict_id: Uuid) -> Result<(), StorageError> {
        let mut inner = self.inner.write().await;
        for (conflict, resolved) in inner.conflicts.iter_mut() {
            if conflict.id == conflict_id {
                *resolved = true;
            }
        }
        Ok(())
    }

    async fn record_touch(&self, state: &str, at: DateTime<Utc>) -> Result<(), StorageError> {
        let mut inner = self.inner.write().await;
        let entry = inner.touches.entry(state.to_uppercase()).or_insert(at);
        if at > *entry {
            *entry = at;
        }
        Ok(())
    }

    async fn last_touch(&self, state: &str) -> Result<Option<DateTime<Utc>>, StorageError> {
        Ok(self
            .inner
            .read()
            .await
            .touches
            .get(&state.to_uppercase())
            .copied())
    }

    async fn office_points(
        &self,
        min_lat: f64,
        min_lon: f64,
        max_lat: f64,
        max_lon: f64,
    ) -> Result<Vec<HeatmapPoint>, StorageError> {
        let inner = self.inner.read().await;
        let mut points = Vec::new();
        for ((canonical_id, _), snapshot) in inner.snapshots.iter() {
            let active = inner
                .reps
                .get(canonical_id)
                .map(|r| r.is_active)
                .unwrap_or(false);
            if !active {
                continue;
            }
            for office in &snapshot.offices {
                if let (Some(lat), Some(lon)) = (office.latitude, office.longitude) {
                    if lat >= min_lat && lat <= max_lat && lon >= min_lon && lon <= max_lon {
                        points.push(HeatmapPoint {
                            latitude: lat,
                            longitude: lon,
                        });
                    }
                }
            }
        }
        Ok(points)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use repmap_core::OfficeAddress;

    fn mk_rep(state: &str, district: Option<&str>, active: bool) -> CanonicalRepresentative {
        let now = Utc.with_ymd_and_hms(2026, 8, 1, 0, 0, 0).single().unwrap();
        CanonicalRepresentative {
            id: Uuid::new_v4(),
            display_name: "Jane Smith".into(),
            party: Some("Independent".into()),
            level: Level::Federal,
            state: state.into(),
            chamber: Some(Chamber::Lower),
            district: district.map(Into::into),
            is_active: active,
            created_at: now,
            updated_at: now,
        }
    }

    fn mk_entry(canonical_id: Uuid, source: Source, source_id: &str) -> CrosswalkEntry {
        CrosswalkEntry {
            id: Uuid::new_v4(),
            canonical_id,
            source,
            source_id: source_id.into(),
            superseded: false,
            created_at: Utc.with_ymd_and_hms(2026, 8, 1, 0, 0, 0).single().unwrap(),
        }
    }

    #[tokio::test]
    async fn duplicate_live_mapping_is_rejected() {
        let store = MemoryStore::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        store
            .crosswalk_insert(mk_entry(a, Source::StaticCorpus, "X1"))
            .await
            .unwrap();
        let err = store
            .crosswalk_insert(mk_entry(b, Source::StaticCorpus, "X1"))
            .await
            .expect_err("second live mapping for the same pair must fail");
        assert!(matches!(err, StorageError::DuplicateMapping { .. }));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn delete_refuses_a_mapped_representative() {
        let store = MemoryStore::new();
        let mapped = mk_rep("CA", Some("12"), true);
        let unmapped = mk_rep("CA", Some("13"), true);
        let mapped_id = mapped.id;
        let unmapped_id = unmapped.id;
        store.upsert_representative(mapped).await.unwrap();
        store.upsert_representative(unmapped).await.unwrap();
        store
            .crosswalk_insert(mk_entry(mapped_id, Source::StaticCorpus, "X1"))
            .await
            .unwrap();

        store
            .delete_representative(mapped_id)
            .await
            .expect_err("mapped rows must survive deletion");
        assert!(store.representative(mapped_id).await.unwrap().is_some());

        store.delete_representative(unmapped_id).await.unwrap();
        assert!(store.representative(unmapped_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn supersede_hides_old_mapping_and_installs_replacement() {
        let store = MemoryStore::new();
        let old = Uuid::new_v4();
        let new = Uuid::new_v4();
        store
            .crosswalk_insert(mk_entry(old, Source::LegislativeApi, "L9"))
            .await
            .unwrap();
        store
            .crosswalk_supersede(
                Source::LegislativeApi,
                "L9",
                mk_entry(new, Source::LegislativeApi, "L9"),
            )
            .await
            .unwrap();

        let live = store
            .crosswalk_lookup(Source::LegislativeApi, "L9")
            .await
            .unwrap()
            .expect("replacement mapping should be live");
        assert_eq!(live.canonical_id, new);
        assert!(store
            .crosswalk_for_canonical(old)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn snapshot_put_is_wholesale_replacement() {
        let store = MemoryStore::new();
        let rep = mk_rep("CA", Some("12"), true);
        let id = rep.id;
        store.upsert_representative(rep).await.unwrap();

        let fetched_at = Utc.with_ymd_and_hms(2026, 8, 1, 0, 0, 0).single().unwrap();
        let mut snapshot = SourceSnapshot {
            display_name: "Jane Smith".into(),
            name_parts: Default::default(),
            party: None,
            level: Level::Federal,
            state: "CA".into(),
            chamber: Some(Chamber::Lower),
            district: Some("12".into()),
            roles: vec![],
            contacts: vec![],
            social: vec![],
            committees: vec![],
            offices: vec![],
            extra: Default::default(),
            fetched_at,
        };
        store
            .put_source_snapshot(id, Source::StaticCorpus, snapshot.clone())
            .await
            .unwrap();
        snapshot.offices.push(OfficeAddress {
            label: Some("district".into()),
            address: "100 Main St".into(),
            latitude: Some(37.77),
            longitude: Some(-122.42),
        });
        store
            .put_source_snapshot(id, Source::StaticCorpus, snapshot)
            .await
            .unwrap();

        let snapshots = store.source_snapshots(id).await.unwrap();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].1.offices.len(), 1);
    }

    #[tokio::test]
    async fn office_points_respect_bbox_and_activity() {
        let store = MemoryStore::new();
        let active = mk_rep("CA", Some("12"), true);
        let inactive = mk_rep("CA", Some("13"), false);
        let fetched_at = Utc.with_ymd_and_hms(2026, 8, 1, 0, 0, 0).single().unwrap();

        for (rep, lat) in [(&active, 37.5), (&inactive, 37.6)] {
            store.upsert_representative(rep.clone()).await.unwrap();
            let snapshot = SourceSnapshot {
                display_name: rep.display_name.clone(),
                name_parts: Default::default(),
                party: None,
                level: Level::Federal,
                state: "CA".into(),
                chamber: None,
                district: rep.district.clone(),
                roles: vec![],
                contacts: vec![],
                social: vec![],
                committees: vec![],
                offices: vec![OfficeAddress {
                    label: None,
                    address: "office".into(),
                    latitude: Some(lat),
                    longitude: Some(-122.0),
                }],
                extra: Default::default(),
                fetched_at,
            };
            store
                .put_source_snapshot(rep.id, Source::StaticCorpus, snapshot)
                .await
                .unwrap();
        }

        let points = store
            .office_points(37.0, -123.0, 38.0, -121.0)
            .await
            .unwrap();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].latitude, 37.5);

        let none = store.office_points(40.0, -123.0, 41.0, -121.0).await.unwrap();
        assert!(none.is_empty());
    }
}
