//! Per-state data quality scoring, read-side only.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use repmap_core::CoverageMetric;
use repmap_storage::{CanonicalStore, RepresentativeFilter, StorageError};
use serde::Deserialize;

const FULL_CREDIT_HOURS: f64 = 24.0;
const STALE_HOURS: f64 = 24.0 * 7.0;

/// Expected officeholder counts per state, the completeness baseline.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExpectedOffices {
    #[serde(default)]
    states: BTreeMap<String, u32>,
}

impl ExpectedOffices {
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::from_yaml_file(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn get(&self, state: &str) -> Option<u32> {
        self.states.get(&state.to_ascii_uppercase()).copied()
    }
}

/// 100 under one day old, linear decay to 0 at seven days. No touch on record
/// scores 0.
fn freshness_score(last_touch: Option<DateTime<Utc>>, now: DateTime<Utc>) -> f64 {
    let Some(touched) = last_touch else {
        return 0.0;
    };
    let age_hours = (now - touched).num_minutes() as f64 / 60.0;
    if age_hours <= FULL_CREDIT_HOURS {
        100.0
    } else if age_hours >= STALE_HOURS {
        0.0
    } else {
        100.0 * (STALE_HOURS - age_hours) / (STALE_HOURS - FULL_CREDIT_HOURS)
    }
}

fn completeness_score(active_count: u32, expected: Option<u32>) -> f64 {
    match expected {
        Some(expected) if expected > 0 => {
            (f64::from(active_count) / f64::from(expected)).min(1.0) * 100.0
        }
        // Without a baseline, presence of any active row is full credit.
        _ => {
            if active_count > 0 {
                100.0
            } else {
                0.0
            }
        }
    }
}

pub async fn compute_coverage(
    store: &dyn CanonicalStore,
    state: &str,
    expected: &ExpectedOffices,
    now: DateTime<Utc>,
) -> Result<CoverageMetric, StorageError> {
    let filter = RepresentativeFilter {
        level: None,
        chamber: None,
        active_only: true,
        limit: None,
    };
    let active_count = store.representatives_by_state(state, &filter).await?.len() as u32;
    let expected_offices = expected.get(state);
    let last_touch = store.last_touch(state).await?;

    let completeness = completeness_score(active_count, expected_offices);
    let freshness = freshness_score(last_touch, now);
    let quality_score = 0.6 * completeness + 0.4 * freshness;

    Ok(CoverageMetric {
        state: state.to_ascii_uppercase(),
        active_count,
        expected_offices,
        completeness,
        freshness,
        quality_score,
        last_touch,
        computed_at: now,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use repmap_core::{CanonicalRepresentative, Level};
    use repmap_storage::MemoryStore;
    use uuid::Uuid;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    fn expected(state: &str, count: u32) -> ExpectedOffices {
        let mut states = BTreeMap::new();
        states.insert(state.to_string(), count);
        ExpectedOffices { states }
    }

    async fn seed_rep(store: &MemoryStore, state: &str, active: bool) {
        store
            .upsert_representative(CanonicalRepresentative {
                id: Uuid::new_v4(),
                display_name: "Someone".into(),
                party: None,
                level: Level::Federal,
                state: state.into(),
                chamber: None,
                district: None,
                is_active: active,
                created_at: now(),
                updated_at: now(),
            })
            .await
            .unwrap();
    }

    #[test]
    fn freshness_has_full_credit_under_a_day() {
        assert_eq!(freshness_score(Some(now() - Duration::hours(2)), now()), 100.0);
    }

    #[test]
    fn freshness_decays_linearly_to_a_week() {
        let four_days = freshness_score(Some(now() - Duration::days(4)), now());
        assert!((four_days - 50.0).abs() < 0.1, "got {four_days}");
        assert_eq!(freshness_score(Some(now() - Duration::days(8)), now()), 0.0);
        assert_eq!(freshness_score(None, now()), 0.0);
    }

    #[tokio::test]
    async fn inactive_rows_do_not_count_toward_completeness() {
        let store = MemoryStore::new();
        seed_rep(&store, "CA", true).await;
        seed_rep(&store, "CA", false).await;
        store.record_touch("CA", now()).await.unwrap();

        let metric = compute_coverage(&store, "CA", &expected("CA", 2), now())
            .await
            .unwrap();
        assert_eq!(metric.active_count, 1);
        assert_eq!(metric.completeness, 50.0);
        assert_eq!(metric.freshness, 100.0);
        assert_eq!(metric.quality_score, 0.6 * 50.0 + 0.4 * 100.0);
    }

    #[tokio::test]
    async fn overfull_states_clamp_at_full_completeness() {
        let store = MemoryStore::new();
        seed_rep(&store, "WY", true).await;
        seed_rep(&store, "WY", true).await;
        seed_rep(&store, "WY", true).await;

        let metric = compute_coverage(&store, "WY", &expected("WY", 2), now())
            .await
            .unwrap();
        assert_eq!(metric.completeness, 100.0);
        // Never touched, so freshness drags the blended score down.
        assert_eq!(metric.freshness, 0.0);
        assert_eq!(metric.quality_score, 60.0);
    }
}
