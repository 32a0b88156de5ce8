//! Postgres-backed canonical store.
//!
//! All queries are runtime `sqlx::query` calls; the per-canonical-id write
//! serialization the reconciliation engine needs is provided by wrapping each
//! multi-statement mutation in a single transaction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use repmap_core::{
    normalize_name, CanonicalRepresentative, Chamber, CrosswalkConflict, CrosswalkEntry, Level,
    Source, SourceSnapshot,
};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::store::{
    CanonicalIdentity, CanonicalStore, HeatmapPoint, RepresentativeFilter, StorageError,
};

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), StorageError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StorageError::Database(e.to_string()))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn parse_field<T: std::str::FromStr>(raw: &str, what: &str) -> Result<T, StorageError> {
    raw.parse()
        .map_err(|_| StorageError::Database(format!("unparseable {what} value {raw}")))
}

fn row_to_rep(row: &PgRow) -> Result<CanonicalRepresentative, StorageError> {
    let level: String = row.try_get("level")?;
    let chamber: Option<String> = row.try_get("chamber")?;
    Ok(CanonicalRepresentative {
        id: row.try_get("id")?,
        display_name: row.try_get("display_name")?,
        party: row.try_get("party")?,
        level: parse_field::<Level>(&level, "level")?,
        state: row.try_get("state")?,
        chamber: chamber
            .as_deref()
            .map(|c| parse_field::<Chamber>(c, "chamber"))
            .transpose()?,
        district: row.try_get("district")?,
        is_active: row.try_get("is_active")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_entry(row: &PgRow) -> Result<CrosswalkEntry, StorageError> {
    let source: String = row.try_get("source")?;
    Ok(CrosswalkEntry {
        id: row.try_get("id")?,
        canonical_id: row.try_get("canonical_id")?,
        source: parse_field::<Source>(&source, "source")?,
        source_id: row.try_get("source_id")?,
        superseded: row.try_get("superseded")?,
        created_at: row.try_get("created_at")?,
    })
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db) if matches!(db.kind(), sqlx::error::ErrorKind::UniqueViolation)
    )
}

#[async_trait]
impl CanonicalStore for PgStore {
    async fn representative(
        &self,
        id: Uuid,
    ) -> Result<Option<CanonicalRepresentative>, StorageError> {
        let row = sqlx::query(
            r#"
            SELECT id, display_name, party, level, state, chamber, district,
                   is_active, created_at, updated_at
              FROM representatives
             WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_rep).transpose()
    }

    async fn upsert_representative(
        &self,
        rep: CanonicalRepresentative,
    ) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO representatives
                   (id, display_name, party, level, state, chamber, district,
                    is_active, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (id) DO UPDATE SET
                display_name = excluded.display_name,
                party        = excluded.party,
                level        = excluded.level,
                state        = excluded.state,
                chamber      = excluded.chamber,
                district     = excluded.district,
                is_active    = excluded.is_active,
                updated_at   = excluded.updated_at
            "#,
        )
        .bind(rep.id)
        .bind(&rep.display_name)
        .bind(&rep.party)
        .bind(rep.level.as_str())
        .bind(&rep.state)
        .bind(rep.chamber.map(|c| c.as_str()))
        .bind(&rep.district)
        .bind(rep.is_active)
        .bind(rep.created_at)
        .bind(rep.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // Crosswalk and snapshot foreign keys refuse the delete for any row that
    // is still referenced.
    async fn delete_representative(&self, id: Uuid) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM representatives WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn representatives_by_state(
        &self,
        state: &str,
        filter: &RepresentativeFilter,
    ) -> Result<Vec<CanonicalRepresentative>, StorageError> {
        let limit = filter.limit.map(|l| l as i64).unwrap_or(500);
        let rows = sqlx::query(
            r#"
            SELECT id, display_name, party, level, state, chamber, district,
                   is_active, created_at, updated_at
              FROM representatives
             WHERE UPPER(state) = UPPER($1)
               AND ($2::text IS NULL OR level = $2)
               AND ($3::text IS NULL OR chamber = $3)
               AND (NOT $4 OR is_active)
             ORDER BY district NULLS FIRST, display_name
             LIMIT $5
            "#,
        )
        .bind(state)
        .bind(filter.level.map(|l| l.as_str()))
        .bind(filter.chamber.map(|c| c.as_str()))
        .bind(filter.active_only)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_rep).collect()
    }

    async fn representatives_by_district(
        &self,
        state: &str,
        district: &str,
    ) -> Result<Vec<CanonicalRepresentative>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT id, display_name, party, level, state, chamber, district,
                   is_active, created_at, updated_at
              FROM representatives
             WHERE UPPER(state) = UPPER($1)
               AND (district IS NULL OR district = $2)
             ORDER BY district NULLS FIRST, display_name
            "#,
        )
        .bind(state)
        .bind(district)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_rep).collect()
    }

    async fn crosswalk_lookup(
        &self,
        source: Source,
        source_id: &str,
    ) -> Result<Option<CrosswalkEntry>, StorageError> {
        let row = sqlx::query(
            r#"
            SELECT id, canonical_id, source, source_id, superseded, created_at
              FROM crosswalk
             WHERE source = $1 AND source_id = $2 AND NOT superseded
            "#,
        )
        .bind(source.as_str())
        .bind(source_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_entry).transpose()
    }

    async fn crosswalk_insert(&self, entry: CrosswalkEntry) -> Result<(), StorageError> {
        let result = sqlx::query(
            r#"
            INSERT INTO crosswalk (id, canonical_id, source, source_id, superseded, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(entry.id)
        .bind(entry.canonical_id)
        .bind(entry.source.as_str())
        .bind(&entry.source_id)
        .bind(entry.superseded)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(err) if is_unique_violation(&err) => Err(StorageError::DuplicateMapping {
                source: entry.source,
                source_id: entry.source_id,
            }),
            Err(err) => Err(err.into()),
        }
    }

    async fn crosswalk_supersede(
        &self,
        source: Source,
        source_id: &str,
        replacement: CrosswalkEntry,
    ) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query(
            r#"
            UPDATE crosswalk
               SET superseded = TRUE
             WHERE source = $1 AND source_id = $2 AND NOT superseded
            "#,
        )
        .bind(source.as_str())
        .bind(source_id)
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(StorageError::MappingNotFound {
                source,
                source_id: source_id.to_string(),
            });
        }
        sqlx::query(
            r#"
            INSERT INTO crosswalk (id, canonical_id, source, source_id, superseded, created_at)
            VALUES ($1, $2, $3, $4, FALSE, $5)
            "#,
        )
        .bind(replacement.id)
        .bind(replacement.canonical_id)
        .bind(replacement.source.as_str())
        .bind(&replacement.source_id)
        .bind(replacement.created_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn crosswalk_for_canonical(
        &self,
        canonical_id: Uuid,
    ) -> Result<Vec<CrosswalkEntry>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT id, canonical_id, source, source_id, superseded, created_at
              FROM crosswalk
             WHERE canonical_id = $1 AND NOT superseded
             ORDER BY source, source_id
            "#,
        )
        .bind(canonical_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_entry).collect()
    }

    async fn canonical_identities(
        &self,
        state: &str,
    ) -> Result<Vec<CanonicalIdentity>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT r.id, r.display_name, r.state, r.district,
                   COUNT(c.id) FILTER (WHERE NOT c.superseded) AS mapping_count
              FROM representatives r
              LEFT JOIN crosswalk c ON c.canonical_id = r.id
             WHERE UPPER(r.state) = UPPER($1)
             GROUP BY r.id, r.display_name, r.state, r.district
            "#,
        )
        .bind(state)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let display_name: String = row.try_get("display_name")?;
            let mapping_count: i64 = row.try_get("mapping_count")?;
            out.push(CanonicalIdentity {
                id: row.try_get("id")?,
                normalized_name: normalize_name(&display_name),
                state: row.try_get("state")?,
                district: row.try_get("district")?,
                mapping_count: mapping_count.max(0) as usize,
            });
        }
        Ok(out)
    }

    async fn put_source_snapshot(
        &self,
        canonical_id: Uuid,
        source: Source,
        snapshot: SourceSnapshot,
    ) -> Result<(), StorageError> {
        let data_json = serde_json::to_value(&snapshot)
            .map_err(|e| StorageError::Database(format!("serializing snapshot: {e}")))?;
        sqlx::query(
            r#"
            INSERT INTO source_snapshots (canonical_id, source, data_json, fetched_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (canonical_id, source) DO UPDATE SET
                data_json  = excluded.data_json,
                fetched_at = excluded.fetched_at
            "#,
        )
        .bind(canonical_id)
        .bind(source.as_str())
        .bind(data_json)
        .bind(snapshot.fetched_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn source_snapshots(
        &self,
        canonical_id: Uuid,
    ) -> Result<Vec<(Source, SourceSnapshot)>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT source, data_json
              FROM source_snapshots
             WHERE canonical_id = $1
             ORDER BY source
            "#,
        )
        .bind(canonical_id)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let source: String = row.try_get("source")?;
            let data_json: serde_json::Value = row.try_get("data_json")?;
            let snapshot: SourceSnapshot = serde_json::from_value(data_json)
                .map_err(|e| StorageError::Database(format!("deserializing snapshot: {e}")))?;
            out.push((parse_field::<Source>(&source, "source")?, snapshot));
        }
        Ok(out)
    }

    async fn record_conflict(&self, conflict: CrosswalkConflict) -> Result<(), StorageError> {
        let candidates = serde_json::to_value(&conflict.candidates)
            .map_err(|e| StorageError::Database(format!("serializing candidates: {e}")))?;
        sqlx::query(
            r#"
            INSERT INTO crosswalk_conflicts
                   (id, source, source_id, normalized_name, state, district, candidates, recorded_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(conflict.id)
        .bind(conflict.source.as_str())
        .bind(&conflict.source_id)
        .bind(&conflict.normalized_name)
        .bind(&conflict.state)
        .bind(&conflict.district)
        .bind(candidates)
        .bind(conflict.recorded_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn open_conflicts(&self) -> Result<Vec<CrosswalkConflict>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT id, source, source_id, normalized_name, state, district, candidates, recorded_at
              FROM crosswalk_conflicts
             WHERE resolved_at IS NULL
             ORDER BY recorded_at
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let source: String = row.try_get("source")?;
            let candidates: serde_json::Value = row.try_get("candidates")?;
            out.push(CrosswalkConflict {
                id: row.try_get("id")?,
                source: parse_field::<Source>(&source, "source")?,
                source_id: row.try_get("source_id")?,
                normalized_name: row.try_get("normalized_name")?,
                state: row.try_get("state")?,
                district: row.try_get("district")?,
                candidates: serde_json::from_value(candidates)
                    .map_err(|e| StorageError::Database(format!("deserializing candidates: {e}")))?,
                recorded_at: row.try_get("recorded_at")?,
            });
        }
        Ok(out)
    }

    async fn close_conflict(&self, conflict_id: Uuid) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            UPDATE crosswalk_conflicts
               SET resolved_at = NOW()
             WHERE id = $1 AND resolved_at IS NULL
            "#,
        )
        .bind(conflict_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_touch(&self, state: &str, at: DateTime<Utc>) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO ingest_touches (state, touched_at)
            VALUES (UPPER($1), $2)
            ON CONFLICT (state) DO UPDATE SET
                touched_at = GREATEST(ingest_touches.touched_at, excluded.touched_at)
            "#,
        )
        .bind(state)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn last_touch(&self, state: &str) -> Result<Option<DateTime<Utc>>, StorageError> {
        let row = sqlx::query(
            r#"
            SELECT touched_at FROM ingest_touches WHERE state = UPPER($1)
            "#,
        )
        .bind(state)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| r.try_get("touched_at"))
            .transpose()
            .map_err(Into::into)
    }

    async fn office_points(
        &self,
        min_lat: f64,
        min_lon: f64,
        max_lat: f64,
        max_lon: f64,
    ) -> Result<Vec<HeatmapPoint>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT (office ->> 'latitude')::float8  AS lat,
                   (office ->> 'longitude')::float8 AS lon
              FROM source_snapshots ss
              JOIN representatives r ON r.id = ss.canonical_id AND r.is_active
             CROSS JOIN LATERAL jsonb_array_elements(ss.data_json -> 'offices') AS office
             WHERE office ->> 'latitude' IS NOT NULL
               AND office ->> 'longitude' IS NOT NULL
               AND (office ->> 'latitude')::float8  BETWEEN $1 AND $2
               AND (office ->> 'longitude')::float8 BETWEEN $3 AND $4
            "#,
        )
        .bind(min_lat)
        .bind(max_lat)
        .bind(min_lon)
        .bind(max_lon)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(HeatmapPoint {
                latitude: row.try_get("lat")?,
                longitude: row.try_get("lon")?,
            });
        }
        Ok(out)
    }
}
