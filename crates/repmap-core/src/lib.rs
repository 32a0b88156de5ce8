//! Core domain model for the representative data pipeline.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "repmap-core";

/// External data sources that feed the canonical store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    StaticCorpus,
    LegislativeApi,
    CampaignFinance,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::StaticCorpus => "static_corpus",
            Source::LegislativeApi => "legislative_api",
            Source::CampaignFinance => "campaign_finance",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Source {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "static_corpus" => Ok(Source::StaticCorpus),
            "legislative_api" => Ok(Source::LegislativeApi),
            "campaign_finance" => Ok(Source::CampaignFinance),
            other => Err(format!("unknown source {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Level {
    Federal,
    State,
    Local,
}

impl Level {
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Federal => "federal",
            Level::State => "state",
            Level::Local => "local",
        }
    }
}

impl FromStr for Level {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "federal" => Ok(Level::Federal),
            "state" => Ok(Level::State),
            "local" => Ok(Level::Local),
            other => Err(format!("unknown level {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Chamber {
    Upper,
    Lower,
    Unicameral,
}

impl Chamber {
    pub fn as_str(&self) -> &'static str {
        match self {
            Chamber::Upper => "upper",
            Chamber::Lower => "lower",
            Chamber::Unicameral => "unicameral",
        }
    }
}

impl FromStr for Chamber {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "upper" => Ok(Chamber::Upper),
            "lower" => Ok(Chamber::Lower),
            "unicameral" => Ok(Chamber::Unicameral),
            other => Err(format!("unknown chamber {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub kind: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocialAccount {
    pub platform: String,
    pub handle: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitteeMembership {
    pub committee: String,
    pub role: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfficeAddress {
    pub label: Option<String>,
    pub address: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

/// One officeholder role as asserted by a single source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Role {
    pub level: Level,
    pub state: String,
    pub chamber: Option<Chamber>,
    pub district: Option<String>,
    pub party: Option<String>,
    pub term_start: Option<NaiveDate>,
    pub term_end: Option<NaiveDate>,
}

impl Role {
    /// A role is current when it has no end date or the end date has not passed.
    pub fn is_current(&self, reference: NaiveDate) -> bool {
        match self.term_end {
            None => true,
            Some(end) => end >= reference,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct NameParts {
    pub first: Option<String>,
    pub last: Option<String>,
}

/// Intermediate per-source record produced by an adapter. Created fresh on
/// every ingestion run, never mutated, discarded once merged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepresentativeRecord {
    pub source: Source,
    pub source_id: String,
    pub display_name: String,
    #[serde(default)]
    pub name_parts: NameParts,
    pub party: Option<String>,
    pub level: Level,
    pub state: String,
    pub chamber: Option<Chamber>,
    pub district: Option<String>,
    pub term_start: Option<NaiveDate>,
    pub term_end: Option<NaiveDate>,
    #[serde(default)]
    pub contacts: Vec<Contact>,
    #[serde(default)]
    pub social: Vec<SocialAccount>,
    #[serde(default)]
    pub committees: Vec<CommitteeMembership>,
    #[serde(default)]
    pub offices: Vec<OfficeAddress>,
    #[serde(default)]
    pub extra: BTreeMap<String, serde_json::Value>,
    pub fetched_at: DateTime<Utc>,
}

impl RepresentativeRecord {
    pub fn normalized_name(&self) -> String {
        normalize_name(&self.display_name)
    }

    pub fn is_current(&self, reference: NaiveDate) -> bool {
        match self.term_end {
            None => true,
            Some(end) => end >= reference,
        }
    }
}

/// Lowercase, strip punctuation, collapse whitespace.
pub fn normalize_name(input: &str) -> String {
    input
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Durable deduplicated entity: one row per real-world officeholder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRepresentative {
    pub id: Uuid,
    pub display_name: String,
    pub party: Option<String>,
    pub level: Level,
    pub state: String,
    pub chamber: Option<Chamber>,
    pub district: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Mapping from one source-native identifier to a canonical id. Append-only:
/// corrections insert a replacement row and mark the old one superseded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrosswalkEntry {
    pub id: Uuid,
    pub canonical_id: Uuid,
    pub source: Source,
    pub source_id: String,
    pub superseded: bool,
    pub created_at: DateTime<Utc>,
}

/// One source's full latest contribution for one canonical representative.
/// Replaced wholesale on every reconciliation of that (canonical, source)
/// pair, so stale child rows from a previous run cannot linger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSnapshot {
    pub display_name: String,
    #[serde(default)]
    pub name_parts: NameParts,
    pub party: Option<String>,
    pub level: Level,
    pub state: String,
    pub chamber: Option<Chamber>,
    pub district: Option<String>,
    #[serde(default)]
    pub roles: Vec<Role>,
    #[serde(default)]
    pub contacts: Vec<Contact>,
    #[serde(default)]
    pub social: Vec<SocialAccount>,
    #[serde(default)]
    pub committees: Vec<CommitteeMembership>,
    #[serde(default)]
    pub offices: Vec<OfficeAddress>,
    #[serde(default)]
    pub extra: BTreeMap<String, serde_json::Value>,
    pub fetched_at: DateTime<Utc>,
}

impl SourceSnapshot {
    pub fn from_record(record: &RepresentativeRecord) -> Self {
        let role = Role {
            level: record.level,
            state: record.state.clone(),
            chamber: record.chamber,
            district: record.district.clone(),
            party: record.party.clone(),
            term_start: record.term_start,
            term_end: record.term_end,
        };
        Self {
            display_name: record.display_name.clone(),
            name_parts: record.name_parts.clone(),
            party: record.party.clone(),
            level: record.level,
            state: record.state.clone(),
            chamber: record.chamber,
            district: record.district.clone(),
            roles: vec![role],
            contacts: record.contacts.clone(),
            social: record.social.clone(),
            committees: record.committees.clone(),
            offices: record.offices.clone(),
            extra: record.extra.clone(),
            fetched_at: record.fetched_at,
        }
    }

    pub fn has_current_role(&self, reference: NaiveDate) -> bool {
        self.roles.iter().any(|r| r.is_current(reference))
    }
}

/// An ambiguous crosswalk match, queued for manual resolution instead of a
/// guessed merge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrosswalkConflict {
    pub id: Uuid,
    pub source: Source,
    pub source_id: String,
    pub normalized_name: String,
    pub state: String,
    pub district: Option<String>,
    pub candidates: Vec<Uuid>,
    pub recorded_at: DateTime<Utc>,
}

/// Derived, read-only per-state data quality aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoverageMetric {
    pub state: String,
    pub active_count: u32,
    pub expected_offices: Option<u32>,
    pub completeness: f64,
    pub freshness: f64,
    pub quality_score: f64,
    pub last_touch: Option<DateTime<Utc>>,
    pub computed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrosswalkRef {
    pub source: Source,
    pub source_id: String,
}

/// Read-model join of a canonical row plus its crosswalk refs and merged
/// children, served by the by-id lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepresentativeProfile {
    pub representative: CanonicalRepresentative,
    pub crosswalk: Vec<CrosswalkRef>,
    pub roles: Vec<Role>,
    pub contacts: Vec<Contact>,
    pub social: Vec<SocialAccount>,
    pub committees: Vec<CommitteeMembership>,
    pub offices: Vec<OfficeAddress>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn role_with_no_end_date_is_current() {
        let role = Role {
            level: Level::Federal,
            state: "CA".into(),
            chamber: Some(Chamber::Lower),
            district: Some("12".into()),
            party: None,
            term_start: Some(date(2023, 1, 3)),
            term_end: None,
        };
        assert!(role.is_current(date(2026, 8, 1)));
    }

    #[test]
    fn role_ending_in_the_past_is_not_current() {
        let role = Role {
            level: Level::Federal,
            state: "CA".into(),
            chamber: Some(Chamber::Lower),
            district: Some("12".into()),
            party: None,
            term_start: Some(date(2021, 1, 3)),
            term_end: Some(date(2023, 1, 3)),
        };
        assert!(!role.is_current(date(2026, 8, 1)));
        assert!(role.is_current(date(2023, 1, 3)));
    }

    #[test]
    fn name_normalization_strips_punctuation_and_case() {
        assert_eq!(normalize_name("Smith, Jane  Q."), "smith jane q");
        assert_eq!(normalize_name("JANE SMITH"), "jane smith");
        assert_eq!(normalize_name("  "), "");
    }

    #[test]
    fn source_round_trips_through_str() {
        for source in [
            Source::StaticCorpus,
            Source::LegislativeApi,
            Source::CampaignFinance,
        ] {
            assert_eq!(source.as_str().parse::<Source>().unwrap(), source);
        }
    }
}
