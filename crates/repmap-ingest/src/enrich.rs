//! Campaign-finance enrichment, separate from the main reconcile pass.
//!
//! Only adds crosswalk entries; never touches snapshots or merged fields. The
//! finance source is an auxiliary identifier provider, not a data source.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use repmap_adapters::FinanceLookup;
use repmap_core::{CrosswalkEntry, Source};
use repmap_storage::{CanonicalStore, RepresentativeFilter, StorageError};
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnrichmentSummary {
    pub examined: usize,
    pub attached: usize,
    pub lookup_failures: usize,
}

pub struct EnrichmentPass {
    store: Arc<dyn CanonicalStore>,
    finance: Arc<dyn FinanceLookup>,
}

impl EnrichmentPass {
    pub fn new(store: Arc<dyn CanonicalStore>, finance: Arc<dyn FinanceLookup>) -> Self {
        Self { store, finance }
    }

    pub async fn run(
        &self,
        states: &[String],
        now: DateTime<Utc>,
    ) -> Result<EnrichmentSummary, StorageError> {
        let mut summary = EnrichmentSummary::default();
        let filter = RepresentativeFilter {
            level: None,
            chamber: None,
            active_only: true,
            limit: None,
        };

        for state in states {
            for rep in self.store.representatives_by_state(state, &filter).await? {
                summary.examined += 1;
                let mappings = self.store.crosswalk_for_canonical(rep.id).await?;
                if mappings
                    .iter()
                    .any(|e| !e.superseded && e.source == Source::CampaignFinance)
                {
                    continue;
                }

                let candidate_id =
                    match self.finance.candidate_id(&rep.display_name, &rep.state).await {
                        Ok(Some(id)) => id,
                        Ok(None) => continue,
                        Err(err) => {
                            warn!(rep = %rep.id, error = %err, "finance lookup failed");
                            summary.lookup_failures += 1;
                            continue;
                        }
                    };

                // The candidate id may already be claimed by another row.
                if self
                    .store
                    .crosswalk_lookup(Source::CampaignFinance, &candidate_id)
                    .await?
                    .is_some()
                {
                    continue;
                }

                self.store
                    .crosswalk_insert(CrosswalkEntry {
                        id: Uuid::new_v4(),
                        canonical_id: rep.id,
                        source: Source::CampaignFinance,
                        source_id: candidate_id,
                        superseded: false,
                        created_at: now,
                    })
                    .await?;
                summary.attached += 1;
            }
        }

        info!(
            examined = summary.examined,
            attached = summary.attached,
            failures = summary.lookup_failures,
            "enrichment pass complete"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use repmap_adapters::AdapterError;
    use repmap_core::{CanonicalRepresentative, Level};
    use repmap_storage::MemoryStore;

    struct StubFinance;

    #[async_trait]
    impl FinanceLookup for StubFinance {
        async fn candidate_id(
            &self,
            name: &str,
            _state: &str,
        ) -> Result<Option<String>, AdapterError> {
            if name == "Jane Smith" {
                Ok(Some("H0CA12345".into()))
            } else {
                Ok(None)
            }
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    async fn seed(store: &MemoryStore, name: &str) -> Uuid {
        let id = Uuid::new_v4();
        store
            .upsert_representative(CanonicalRepresentative {
                id,
                display_name: name.into(),
                party: None,
                level: Level::Federal,
                state: "CA".into(),
                chamber: None,
                district: Some("12".into()),
                is_active: true,
                created_at: now(),
                updated_at: now(),
            })
            .await
            .unwrap();
        id
    }

    #[tokio::test]
    async fn attaches_finance_id_once_and_skips_unknown_names() {
        let store = Arc::new(MemoryStore::new());
        let known = seed(&store, "Jane Smith").await;
        seed(&store, "Unknown Person").await;

        let pass = EnrichmentPass::new(store.clone(), Arc::new(StubFinance));
        let states = vec!["CA".to_string()];

        let summary = pass.run(&states, now()).await.unwrap();
        assert_eq!(summary.examined, 2);
        assert_eq!(summary.attached, 1);

        let entry = store
            .crosswalk_lookup(Source::CampaignFinance, "H0CA12345")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.canonical_id, known);

        // Second run finds the mapping in place and attaches nothing.
        let summary = pass.run(&states, now()).await.unwrap();
        assert_eq!(summary.attached, 0);
    }
}
