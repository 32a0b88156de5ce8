//! Source adapter contracts and the per-source implementations.
//!
//! Each adapter talks to exactly one external source and normalizes its
//! native schema into [`RepresentativeRecord`]. Adapters never write to the
//! canonical store; downstream code never branches on source type again.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use repmap_core::{
    CommitteeMembership, Contact, Level, NameParts, OfficeAddress, RepresentativeRecord,
    SocialAccount, Source,
};
use repmap_storage::{FetchError, HttpFetcher, RateBudgetConfig};
use serde::Deserialize;
use uuid::Uuid;

pub const CRATE_NAME: &str = "repmap-adapters";

// Display/Error are implemented by hand: thiserror would treat the `source`
// field as the error cause, but it is a data-source tag, not an error.
#[derive(Debug)]
pub enum AdapterError {
    /// Network/auth failure. Aborts this source's contribution for the run,
    /// retryable on the next run; other sources are unaffected.
    Transport { source: Source, message: String },
    /// The payload itself could not be understood.
    Payload { source: Source, message: String },
    /// Read-path geocode lookup failure; never attributed to an ingestion
    /// source.
    Geocode { message: String },
}

impl std::fmt::Display for AdapterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AdapterError::Transport { source, message } => {
                write!(f, "transport failure for {source}: {message}")
            }
            AdapterError::Payload { source, message } => {
                write!(f, "malformed payload from {source}: {message}")
            }
            AdapterError::Geocode { message } => write!(f, "geocode failure: {message}"),
        }
    }
}

impl std::error::Error for AdapterError {}

impl AdapterError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, AdapterError::Transport { .. })
    }

    fn transport(source: Source, err: impl std::fmt::Display) -> Self {
        AdapterError::Transport {
            source,
            message: err.to_string(),
        }
    }

    fn payload(source: Source, err: impl std::fmt::Display) -> Self {
        AdapterError::Payload {
            source,
            message: err.to_string(),
        }
    }

    fn geocode(err: impl std::fmt::Display) -> Self {
        AdapterError::Geocode {
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub fetched_at: DateTime<Utc>,
}

/// One page of normalized records. Individual malformed records are skipped
/// and counted rather than failing the batch.
#[derive(Debug, Clone)]
pub struct FetchBatch {
    pub records: Vec<RepresentativeRecord>,
    pub next_cursor: Option<String>,
    pub skipped_malformed: usize,
    /// Raw page payload for the snapshot store, when the source has one.
    pub raw_payload: Option<Vec<u8>>,
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source(&self) -> Source;

    /// Provider-declared request budget; `None` for local sources.
    fn rate_limit(&self) -> Option<RateBudgetConfig> {
        None
    }

    async fn fetch_batch(
        &self,
        ctx: &AdapterContext,
        cursor: Option<String>,
    ) -> Result<FetchBatch, AdapterError>;
}

// ---------------------------------------------------------------------------
// Static YAML corpus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
struct CorpusId {
    corpus: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct CorpusName {
    first: Option<String>,
    last: Option<String>,
    official_full: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct CorpusTerm {
    level: Option<String>,
    state: String,
    chamber: Option<String>,
    district: Option<String>,
    party: Option<String>,
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
}

#[derive(Debug, Clone, Deserialize)]
struct CorpusEntry {
    id: CorpusId,
    name: CorpusName,
    #[serde(default)]
    party: Option<String>,
    #[serde(default)]
    terms: Vec<CorpusTerm>,
    #[serde(default)]
    contacts: Vec<Contact>,
    #[serde(default)]
    social: Vec<SocialAccount>,
    #[serde(default)]
    committees: Vec<CommitteeMembership>,
    #[serde(default)]
    offices: Vec<OfficeAddress>,
}

impl CorpusEntry {
    /// The most recent term drives jurisdiction fields; earlier terms are
    /// history the canonical store does not carry.
    fn latest_term(&self) -> Option<&CorpusTerm> {
        self.terms
            .iter()
            .max_by_key(|t| (t.start, t.end.is_none()))
    }

    fn into_record(self, fetched_at: DateTime<Utc>) -> Option<RepresentativeRecord> {
        let source_id = self.id.corpus.clone().filter(|s| !s.trim().is_empty())?;
        let display_name = self
            .name
            .official_full
            .clone()
            .or_else(|| match (&self.name.first, &self.name.last) {
                (Some(first), Some(last)) => Some(format!("{first} {last}")),
                _ => None,
            })
            .filter(|s| !s.trim().is_empty())?;
        let term = self.latest_term()?.clone();
        let level = term
            .level
            .as_deref()
            .and_then(|l| Level::from_str(l).ok())
            .unwrap_or(Level::Federal);

        Some(RepresentativeRecord {
            source: Source::StaticCorpus,
            source_id,
            display_name,
            name_parts: NameParts {
                first: self.name.first,
                last: self.name.last,
            },
            party: term.party.or(self.party),
            level,
            state: term.state.to_uppercase(),
            chamber: term.chamber.as_deref().and_then(|c| c.parse().ok()),
            district: term.district,
            term_start: term.start,
            term_end: term.end,
            contacts: self.contacts,
            social: self.social,
            committees: self.committees,
            offices: self.offices,
            extra: Default::default(),
            fetched_at,
        })
    }
}

/// Deterministic walk of a directory of YAML entry files, one logical record
/// per file. Cursor is the index into the sorted file list; no rate limit.
pub struct StaticCorpusAdapter {
    root: PathBuf,
    page_size: usize,
}

impl StaticCorpusAdapter {
    pub fn new(root: impl Into<PathBuf>, page_size: usize) -> Self {
        Self {
            root: root.into(),
            page_size: page_size.max(1),
        }
    }

    fn entry_files(&self) -> Result<Vec<PathBuf>, AdapterError> {
        let mut files: Vec<PathBuf> = std::fs::read_dir(&self.root)
            .map_err(|e| AdapterError::transport(Source::StaticCorpus, e))?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                matches!(
                    path.extension().and_then(|e| e.to_str()),
                    Some("yaml") | Some("yml")
                )
            })
            .collect();
        files.sort();
        Ok(files)
    }

    fn parse_entry(path: &Path, fetched_at: DateTime<Utc>) -> Option<RepresentativeRecord> {
        let text = std::fs::read_to_string(path).ok()?;
        let entry: CorpusEntry = serde_yaml::from_str(&text).ok()?;
        entry.into_record(fetched_at)
    }
}

#[async_trait]
impl SourceAdapter for StaticCorpusAdapter {
    fn source(&self) -> Source {
        Source::StaticCorpus
    }

    async fn fetch_batch(
        &self,
        ctx: &AdapterContext,
        cursor: Option<String>,
    ) -> Result<FetchBatch, AdapterError> {
        let start: usize = cursor
            .as_deref()
            .map(|c| {
                c.parse()
                    .map_err(|_| AdapterError::payload(Source::StaticCorpus, "bad cursor"))
            })
            .transpose()?
            .unwrap_or(0);

        let files = self.entry_files()?;
        let page: Vec<&PathBuf> = files.iter().skip(start).take(self.page_size).collect();

        let mut records = Vec::with_capacity(page.len());
        let mut skipped = 0usize;
        for path in &page {
            match Self::parse_entry(path, ctx.fetched_at) {
                Some(record) => records.push(record),
                None => skipped += 1,
            }
        }

        let consumed = start + page.len();
        let next_cursor = (consumed < files.len()).then(|| consumed.to_string());

        Ok(FetchBatch {
            records,
            next_cursor,
            skipped_malformed: skipped,
            raw_payload: None,
        })
    }
}

// ---------------------------------------------------------------------------
// Live legislative API
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
struct LegislatorsPage {
    #[serde(default)]
    results: Vec<serde_json::Value>,
    #[serde(default)]
    next_page: Option<u32>,
}

fn json_str(value: &serde_json::Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn json_date(value: &serde_json::Value, key: &str) -> Option<NaiveDate> {
    json_str(value, key).and_then(|s| s.parse().ok())
}

fn legislator_from_json(
    item: &serde_json::Value,
    fetched_at: DateTime<Utc>,
) -> Option<RepresentativeRecord> {
    let source_id = json_str(item, "id")?;
    let display_name = json_str(item, "name")?;
    let state = json_str(item, "state")?.to_uppercase();

    let contacts = item
        .get("contacts")
        .and_then(|v| serde_json::from_value::<Vec<Contact>>(v.clone()).ok())
        .unwrap_or_default();
    let social = item
        .get("social")
        .and_then(|v| serde_json::from_value::<Vec<SocialAccount>>(v.clone()).ok())
        .unwrap_or_default();
    let committees = item
        .get("committees")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|c| c.as_str())
                .map(|name| CommitteeMembership {
                    committee: name.to_string(),
                    role: None,
                })
                .collect()
        })
        .unwrap_or_default();
    let offices = item
        .get("offices")
        .and_then(|v| serde_json::from_value::<Vec<OfficeAddress>>(v.clone()).ok())
        .unwrap_or_default();

    Some(RepresentativeRecord {
        source: Source::LegislativeApi,
        source_id,
        display_name,
        name_parts: NameParts {
            first: json_str(item, "first_name"),
            last: json_str(item, "last_name"),
        },
        party: json_str(item, "party"),
        level: json_str(item, "level")
            .and_then(|l| l.parse().ok())
            .unwrap_or(Level::Federal),
        state,
        chamber: json_str(item, "chamber").and_then(|c| c.parse().ok()),
        district: json_str(item, "district"),
        term_start: json_date(item, "term_start"),
        term_end: json_date(item, "term_end"),
        contacts,
        social,
        committees,
        offices,
        extra: Default::default(),
        fetched_at,
    })
}

/// Parse one legislators page; split from fetching so it is testable on raw
/// bytes. Records missing an identity field are skipped and counted.
pub fn parse_legislators_page(
    bytes: &[u8],
    fetched_at: DateTime<Utc>,
) -> Result<(Vec<RepresentativeRecord>, Option<String>, usize), AdapterError> {
    let page: LegislatorsPage = serde_json::from_slice(bytes)
        .map_err(|e| AdapterError::payload(Source::LegislativeApi, e))?;

    let mut records = Vec::with_capacity(page.results.len());
    let mut skipped = 0usize;
    for item in &page.results {
        match legislator_from_json(item, fetched_at) {
            Some(record) => records.push(record),
            None => skipped += 1,
        }
    }
    Ok((records, page.next_page.map(|p| p.to_string()), skipped))
}

/// Paged JSON API for supplemental/enrichment data; self-throttles to the
/// provider's declared per-minute/per-day budget via the shared fetcher.
pub struct LegislativeApiAdapter {
    fetcher: Arc<HttpFetcher>,
    base_url: String,
    per_page: u32,
    rate_limit: RateBudgetConfig,
}

impl LegislativeApiAdapter {
    pub fn new(
        fetcher: Arc<HttpFetcher>,
        base_url: impl Into<String>,
        per_page: u32,
        rate_limit: RateBudgetConfig,
    ) -> Self {
        Self {
            fetcher,
            base_url: base_url.into(),
            per_page: per_page.max(1),
            rate_limit,
        }
    }
}

#[async_trait]
impl SourceAdapter for LegislativeApiAdapter {
    fn source(&self) -> Source {
        Source::LegislativeApi
    }

    fn rate_limit(&self) -> Option<RateBudgetConfig> {
        Some(self.rate_limit)
    }

    async fn fetch_batch(
        &self,
        ctx: &AdapterContext,
        cursor: Option<String>,
    ) -> Result<FetchBatch, AdapterError> {
        let page: u32 = cursor
            .as_deref()
            .map(|c| {
                c.parse()
                    .map_err(|_| AdapterError::payload(Source::LegislativeApi, "bad cursor"))
            })
            .transpose()?
            .unwrap_or(1);

        let url = format!(
            "{}/legislators?per_page={}&page={}",
            self.base_url.trim_end_matches('/'),
            self.per_page,
            page
        );
        let resp = self
            .fetcher
            .fetch_bytes(ctx.run_id, Source::LegislativeApi.as_str(), &url)
            .await
            .map_err(|e: FetchError| AdapterError::transport(Source::LegislativeApi, e))?;

        let (records, next_cursor, skipped) = parse_legislators_page(&resp.body, ctx.fetched_at)?;
        Ok(FetchBatch {
            records,
            next_cursor,
            skipped_malformed: skipped,
            raw_payload: Some(resp.body),
        })
    }
}

// ---------------------------------------------------------------------------
// Campaign-finance lookup (enrichment pass only)
// ---------------------------------------------------------------------------

#[async_trait]
pub trait FinanceLookup: Send + Sync {
    /// Auxiliary candidate identifier for a (name, state) pair, if the
    /// finance source knows one.
    async fn candidate_id(&self, name: &str, state: &str)
        -> Result<Option<String>, AdapterError>;
}

#[derive(Debug, Clone, Deserialize)]
struct CandidatePage {
    #[serde(default)]
    results: Vec<CandidateRow>,
}

#[derive(Debug, Clone, Deserialize)]
struct CandidateRow {
    candidate_id: String,
}

pub fn parse_candidate_response(bytes: &[u8]) -> Result<Option<String>, AdapterError> {
    let page: CandidatePage = serde_json::from_slice(bytes)
        .map_err(|e| AdapterError::payload(Source::CampaignFinance, e))?;
    Ok(page.results.into_iter().next().map(|r| r.candidate_id))
}

pub struct FinanceApiClient {
    fetcher: Arc<HttpFetcher>,
    base_url: String,
}

impl FinanceApiClient {
    pub fn new(fetcher: Arc<HttpFetcher>, base_url: impl Into<String>) -> Self {
        Self {
            fetcher,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl FinanceLookup for FinanceApiClient {
    async fn candidate_id(
        &self,
        name: &str,
        state: &str,
    ) -> Result<Option<String>, AdapterError> {
        let url = format!(
            "{}/candidates?name={}&state={}",
            self.base_url.trim_end_matches('/'),
            urlencode(name),
            urlencode(state)
        );
        let resp = self
            .fetcher
            .fetch_bytes(Uuid::new_v4(), Source::CampaignFinance.as_str(), &url)
            .await
            .map_err(|e| AdapterError::transport(Source::CampaignFinance, e))?;
        parse_candidate_response(&resp.body)
    }
}

// ---------------------------------------------------------------------------
// Geographic/civic API (read-path geocoding only, never a canonical source)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeocodedDivision {
    pub state: String,
    pub district: Option<String>,
}

#[async_trait]
pub trait Geocoder: Send + Sync {
    async fn resolve(&self, address: &str) -> Result<GeocodedDivision, AdapterError>;
}

#[derive(Debug, Clone, Deserialize)]
struct GeocodeResponse {
    state: String,
    #[serde(default)]
    district: Option<String>,
}

pub fn parse_geocode_response(bytes: &[u8]) -> Result<GeocodedDivision, AdapterError> {
    let resp: GeocodeResponse =
        serde_json::from_slice(bytes).map_err(AdapterError::geocode)?;
    Ok(GeocodedDivision {
        state: resp.state.to_uppercase(),
        district: resp.district,
    })
}

pub struct CivicApiGeocoder {
    fetcher: Arc<HttpFetcher>,
    base_url: String,
}

impl CivicApiGeocoder {
    pub fn new(fetcher: Arc<HttpFetcher>, base_url: impl Into<String>) -> Self {
        Self {
            fetcher,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl Geocoder for CivicApiGeocoder {
    async fn resolve(&self, address: &str) -> Result<GeocodedDivision, AdapterError> {
        let url = format!(
            "{}/geocode?address={}",
            self.base_url.trim_end_matches('/'),
            urlencode(address)
        );
        let resp = self
            .fetcher
            .fetch_bytes(Uuid::new_v4(), "civic_geocoder", &url)
            .await
            .map_err(AdapterError::geocode)?;
        parse_geocode_response(&resp.body)
    }
}

fn urlencode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            b' ' => out.push('+'),
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}
