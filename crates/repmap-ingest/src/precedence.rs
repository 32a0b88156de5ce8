//! Field-level precedence when multiple sources disagree.
//!
//! The order is an explicit, versioned table rather than an undocumented
//! dependency on ingestion run order: the live legislative API outranks the
//! static corpus on current-role fields, the corpus outranks the API on
//! stable biographical fields. Overridable from `config/precedence.yaml`.

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use repmap_core::{Chamber, Level, Source, SourceSnapshot};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
struct PrecedenceFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    fields: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct FieldPrecedence {
    fields: BTreeMap<String, Vec<Source>>,
    default_order: Vec<Source>,
}

impl Default for FieldPrecedence {
    fn default() -> Self {
        let role_order = vec![Source::LegislativeApi, Source::StaticCorpus];
        let bio_order = vec![Source::StaticCorpus, Source::LegislativeApi];
        let mut fields = BTreeMap::new();
        fields.insert("name".to_string(), bio_order);
        for field in ["party", "level", "state", "chamber", "district"] {
            fields.insert(field.to_string(), role_order.clone());
        }
        Self {
            fields,
            default_order: vec![
                Source::LegislativeApi,
                Source::StaticCorpus,
                Source::CampaignFinance,
            ],
        }
    }
}

impl FieldPrecedence {
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let file: PrecedenceFile =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;

        let mut fields = BTreeMap::new();
        for (field, order) in file.fields {
            let order = order
                .iter()
                .map(|s| Source::from_str(s))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| anyhow::anyhow!("{}: field {field}: {e}", path.display()))?;
            fields.insert(field, order);
        }
        let defaults = Self::default();
        Ok(Self {
            fields,
            default_order: defaults.default_order,
        })
    }

    /// Built-in table unless an override file exists at `path`.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::from_yaml_file(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn order_for(&self, field: &str) -> &[Source] {
        self.fields
            .get(field)
            .map(|v| v.as_slice())
            .unwrap_or(&self.default_order)
    }

    fn pick<'a, T, F>(&self, field: &str, snapshots: &'a [(Source, SourceSnapshot)], get: F) -> Option<T>
    where
        F: Fn(&'a SourceSnapshot) -> Option<T>,
    {
        for wanted in self.order_for(field) {
            if let Some(value) = snapshots
                .iter()
                .find(|(source, _)| source == wanted)
                .and_then(|(_, snapshot)| get(snapshot))
            {
                return Some(value);
            }
        }
        // A source outside the configured order still beats an empty field.
        snapshots.iter().find_map(|(_, snapshot)| get(snapshot))
    }

    /// Fold all source snapshots into the canonical scalar fields.
    pub fn merge(&self, snapshots: &[(Source, SourceSnapshot)]) -> Option<MergedFields> {
        if snapshots.is_empty() {
            return None;
        }
        let display_name = self.pick("name", snapshots, |s| {
            (!s.display_name.trim().is_empty()).then(|| s.display_name.clone())
        })?;
        let level = self
            .pick("level", snapshots, |s| Some(s.level))
            .unwrap_or(Level::Federal);
        let state = self.pick("state", snapshots, |s| {
            (!s.state.trim().is_empty()).then(|| s.state.clone())
        })?;
        Some(MergedFields {
            display_name,
            party: self.pick("party", snapshots, |s| s.party.clone()),
            level,
            state,
            chamber: self.pick("chamber", snapshots, |s| s.chamber),
            district: self.pick("district", snapshots, |s| s.district.clone()),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergedFields {
    pub display_name: String,
    pub party: Option<String>,
    pub level: Level,
    pub state: String,
    pub chamber: Option<Chamber>,
    pub district: Option<String>,
}
