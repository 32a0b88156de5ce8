//! JSON read API over the canonical store.
//!
//! Handlers never reach an ingestion source. The only external collaborator
//! is the geocoder, and only on the by-address path; everything else is the
//! canonical store behind a per-operation TTL cache.

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use repmap_adapters::Geocoder;
use repmap_core::{
    Chamber, CrosswalkRef, Level, RepresentativeProfile,
};
use repmap_ingest::{compute_coverage, ExpectedOffices};
use repmap_storage::{CanonicalStore, RepresentativeFilter, StorageError};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tracing::warn;
use uuid::Uuid;

pub const CRATE_NAME: &str = "repmap-web";

#[derive(Debug, Clone)]
pub struct WebConfig {
    pub port: u16,
    pub address_ttl: Duration,
    pub id_ttl: Duration,
    pub listing_ttl: Duration,
    /// Server-side floor for heatmap cell suppression; callers can raise the
    /// threshold but never lower it below this.
    pub heatmap_min_count: u64,
    /// Ceiling on live cache entries; address keys are caller-supplied, so the
    /// map must not grow with request variety.
    pub cache_max_entries: usize,
    pub expected_offices_path: PathBuf,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            port: 8000,
            address_ttl: Duration::from_secs(60),
            id_ttl: Duration::from_secs(300),
            listing_ttl: Duration::from_secs(900),
            heatmap_min_count: 5,
            cache_max_entries: 10_000,
            expected_offices_path: PathBuf::from("config/expected_offices.yaml"),
        }
    }
}

impl WebConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            port: std::env::var("REPMAP_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.port),
            heatmap_min_count: std::env::var("REPMAP_HEATMAP_MIN_COUNT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.heatmap_min_count),
            ..defaults
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum CacheTier {
    Address,
    Id,
    Listing,
}

struct CacheEntry {
    value: serde_json::Value,
    stored_at: Instant,
    ttl: Duration,
    last_updated: DateTime<Utc>,
}

/// Shared in-process cache keyed per operation. Entries expire by TTL only;
/// any miss degrades to a direct store query.
pub struct TieredCache {
    address_ttl: Duration,
    id_ttl: Duration,
    listing_ttl: Duration,
    max_entries: usize,
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl TieredCache {
    fn new(config: &WebConfig) -> Self {
        Self {
            address_ttl: config.address_ttl,
            id_ttl: config.id_ttl,
            listing_ttl: config.listing_ttl,
            max_entries: config.cache_max_entries.max(1),
            entries: RwLock::new(HashMap::new()),
        }
    }

    fn ttl_for(&self, tier: CacheTier) -> Duration {
        match tier {
            CacheTier::Address => self.address_ttl,
            CacheTier::Id => self.id_ttl,
            CacheTier::Listing => self.listing_ttl,
        }
    }

    async fn get(&self, key: &str) -> Option<(serde_json::Value, DateTime<Utc>)> {
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                Some(entry) if entry.stored_at.elapsed() < entry.ttl => {
                    return Some((entry.value.clone(), entry.last_updated));
                }
                Some(_) => {}
                None => return None,
            }
        }
        // Expired; drop the dead entry so it does not keep its map slot.
        let mut entries = self.entries.write().await;
        if entries
            .get(key)
            .is_some_and(|entry| entry.stored_at.elapsed() >= entry.ttl)
        {
            entries.remove(key);
        }
        None
    }

    async fn put(&self, tier: CacheTier, key: String, value: serde_json::Value) {
        let mut entries = self.entries.write().await;
        entries.retain(|_, entry| entry.stored_at.elapsed() < entry.ttl);
        if entries.len() >= self.max_entries && !entries.contains_key(&key) {
            // Full of live entries; this response goes uncached.
            return;
        }
        entries.insert(
            key,
            CacheEntry {
                value,
                stored_at: Instant::now(),
                ttl: self.ttl_for(tier),
                last_updated: Utc::now(),
            },
        );
    }
}

pub struct AppState {
    pub store: Arc<dyn CanonicalStore>,
    pub geocoder: Arc<dyn Geocoder>,
    pub config: WebConfig,
    cache: TieredCache,
    expected: ExpectedOffices,
}

impl AppState {
    pub fn new(
        store: Arc<dyn CanonicalStore>,
        geocoder: Arc<dyn Geocoder>,
        config: WebConfig,
    ) -> anyhow::Result<Self> {
        let expected = ExpectedOffices::load_or_default(&config.expected_offices_path)?;
        let cache = TieredCache::new(&config);
        Ok(Self {
            store,
            geocoder,
            config,
            cache,
            expected,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
struct ResponseMetadata {
    source_tier: &'static str,
    last_updated: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct ApiResponse {
    success: bool,
    data: Option<serde_json::Value>,
    error: Option<String>,
    metadata: ResponseMetadata,
}

fn ok_response(data: serde_json::Value, tier: &'static str, last_updated: DateTime<Utc>) -> Response {
    Json(ApiResponse {
        success: true,
        data: Some(data),
        error: None,
        metadata: ResponseMetadata {
            source_tier: tier,
            last_updated,
        },
    })
    .into_response()
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ApiResponse {
            success: false,
            data: None,
            error: Some(message.into()),
            metadata: ResponseMetadata {
                source_tier: "store",
                last_updated: Utc::now(),
            },
        }),
    )
        .into_response()
}

fn storage_error(err: StorageError) -> Response {
    warn!(error = %err, "store query failed");
    error_response(StatusCode::INTERNAL_SERVER_ERROR, "storage unavailable")
}

// Query parameters are taken as raw strings and parsed by hand so a bad value
// still gets the JSON error envelope instead of the extractor's plain-text 400.
fn parse_param<T: FromStr>(raw: Option<&str>, name: &str) -> Result<Option<T>, Response> {
    match raw {
        None => Ok(None),
        Some(value) => value.parse().map(Some).map_err(|_| {
            error_response(
                StatusCode::BAD_REQUEST,
                format!("malformed {name} query parameter"),
            )
        }),
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/representatives", get(list_representatives_handler))
        .route("/api/representatives/by-address", get(by_address_handler))
        .route("/api/representatives/{id}", get(by_id_handler))
        .route("/api/heatmap", get(heatmap_handler))
        .route("/api/coverage", get(coverage_handler))
        .route("/healthz", get(healthz_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState) -> anyhow::Result<()> {
    let port = state.config.port;
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(port, "read api listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn healthz_handler() -> Response {
    Json(serde_json::json!({ "status": "ok" })).into_response()
}

#[derive(Debug, Deserialize, Default)]
struct ListQuery {
    state: Option<String>,
    level: Option<String>,
    chamber: Option<String>,
    limit: Option<String>,
}

async fn list_representatives_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Response {
    let Some(us_state) = query.state.as_deref().filter(|s| !s.trim().is_empty()) else {
        return error_response(StatusCode::BAD_REQUEST, "state query parameter is required");
    };
    let us_state = us_state.to_ascii_uppercase();

    let level = match query.level.as_deref().map(Level::from_str).transpose() {
        Ok(level) => level,
        Err(_) => return error_response(StatusCode::BAD_REQUEST, "unknown level"),
    };
    let chamber = match query.chamber.as_deref().map(Chamber::from_str).transpose() {
        Ok(chamber) => chamber,
        Err(_) => return error_response(StatusCode::BAD_REQUEST, "unknown chamber"),
    };
    let limit = match parse_param::<usize>(query.limit.as_deref(), "limit") {
        Ok(limit) => limit,
        Err(resp) => return resp,
    };

    let cache_key = format!(
        "state:{us_state}:{}:{}:{}",
        query.level.as_deref().unwrap_or("-"),
        query.chamber.as_deref().unwrap_or("-"),
        query.limit.as_deref().unwrap_or("-")
    );
    if let Some((value, cached_at)) = state.cache.get(&cache_key).await {
        return ok_response(value, "cache", cached_at);
    }

    let filter = RepresentativeFilter {
        level,
        chamber,
        active_only: true,
        limit,
    };
    let reps = match state.store.representatives_by_state(&us_state, &filter).await {
        Ok(reps) => reps,
        Err(err) => return storage_error(err),
    };

    let value = match serde_json::to_value(&reps) {
        Ok(value) => value,
        Err(err) => {
            warn!(error = %err, "serializing representatives");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "serialization failed");
        }
    };
    state
        .cache
        .put(CacheTier::Listing, cache_key, value.clone())
        .await;
    ok_response(value, "store", Utc::now())
}

#[derive(Debug, Deserialize, Default)]
struct AddressQuery {
    address: Option<String>,
}

async fn by_address_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AddressQuery>,
) -> Response {
    let Some(address) = query.address.as_deref().filter(|a| !a.trim().is_empty()) else {
        return error_response(StatusCode::BAD_REQUEST, "address query parameter is required");
    };

    let cache_key = format!("address:{}", address.to_ascii_lowercase());
    if let Some((value, cached_at)) = state.cache.get(&cache_key).await {
        return ok_response(value, "cache", cached_at);
    }

    let division = match state.geocoder.resolve(address).await {
        Ok(division) => division,
        Err(err) => {
            warn!(error = %err, "geocode failed");
            return error_response(StatusCode::BAD_GATEWAY, "address lookup failed");
        }
    };

    let reps = match &division.district {
        Some(district) => {
            state
                .store
                .representatives_by_district(&division.state, district)
                .await
        }
        None => {
            let filter = RepresentativeFilter {
                level: None,
                chamber: None,
                active_only: true,
                limit: None,
            };
            state
                .store
                .representatives_by_state(&division.state, &filter)
                .await
        }
    };
    let reps = match reps {
        Ok(reps) => reps,
        Err(err) => return storage_error(err),
    };

    let value = serde_json::json!({
        "division": { "state": division.state, "district": division.district },
        "representatives": reps,
    });
    state
        .cache
        .put(CacheTier::Address, cache_key, value.clone())
        .await;
    ok_response(value, "store", Utc::now())
}

async fn by_id_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Response {
    let Ok(id) = Uuid::parse_str(&id) else {
        return error_response(StatusCode::BAD_REQUEST, "malformed representative id");
    };

    let cache_key = format!("id:{id}");
    if let Some((value, cached_at)) = state.cache.get(&cache_key).await {
        return ok_response(value, "cache", cached_at);
    }

    let representative = match state.store.representative(id).await {
        Ok(Some(rep)) => rep,
        Ok(None) => return error_response(StatusCode::NOT_FOUND, "representative not found"),
        Err(err) => return storage_error(err),
    };
    let entries = match state.store.crosswalk_for_canonical(id).await {
        Ok(entries) => entries,
        Err(err) => return storage_error(err),
    };
    let snapshots = match state.store.source_snapshots(id).await {
        Ok(snapshots) => snapshots,
        Err(err) => return storage_error(err),
    };

    let mut profile = RepresentativeProfile {
        representative,
        crosswalk: entries
            .into_iter()
            .filter(|e| !e.superseded)
            .map(|e| CrosswalkRef {
                source: e.source,
                source_id: e.source_id,
            })
            .collect(),
        roles: Vec::new(),
        contacts: Vec::new(),
        social: Vec::new(),
        committees: Vec::new(),
        offices: Vec::new(),
    };
    // Children are the union across sources; identical rows collapse.
    for (_, snapshot) in snapshots {
        for role in snapshot.roles {
            if !profile.roles.contains(&role) {
                profile.roles.push(role);
            }
        }
        for contact in snapshot.contacts {
            if !profile.contacts.contains(&contact) {
                profile.contacts.push(contact);
            }
        }
        for account in snapshot.social {
            if !profile.social.contains(&account) {
                profile.social.push(account);
            }
        }
        for membership in snapshot.committees {
            if !profile.committees.contains(&membership) {
                profile.committees.push(membership);
            }
        }
        for office in snapshot.offices {
            if !profile.offices.contains(&office) {
                profile.offices.push(office);
            }
        }
    }

    let value = match serde_json::to_value(&profile) {
        Ok(value) => value,
        Err(err) => {
            warn!(error = %err, "serializing profile");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "serialization failed");
        }
    };
    state.cache.put(CacheTier::Id, cache_key, value.clone()).await;
    ok_response(value, "store", Utc::now())
}

#[derive(Debug, Deserialize, Default)]
struct HeatmapQuery {
    min_lat: Option<String>,
    min_lon: Option<String>,
    max_lat: Option<String>,
    max_lon: Option<String>,
    precision: Option<String>,
    min_count: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct HeatmapCell {
    latitude: f64,
    longitude: f64,
    count: u64,
}

/// Grid aggregation with k-anonymity suppression: a cell is emitted only when
/// it holds at least `max(requested, server floor)` office points.
fn aggregate_heatmap(
    points: &[repmap_storage::HeatmapPoint],
    precision: u32,
    min_count: u64,
) -> Vec<HeatmapCell> {
    let scale = 10f64.powi(precision as i32);
    let mut cells: HashMap<(i64, i64), u64> = HashMap::new();
    for point in points {
        let key = (
            (point.latitude * scale).floor() as i64,
            (point.longitude * scale).floor() as i64,
        );
        *cells.entry(key).or_default() += 1;
    }

    let mut out: Vec<HeatmapCell> = cells
        .into_iter()
        .filter(|(_, count)| *count >= min_count)
        .map(|((lat_key, lon_key), count)| HeatmapCell {
            // Cell center, not the member points.
            latitude: (lat_key as f64 + 0.5) / scale,
            longitude: (lon_key as f64 + 0.5) / scale,
            count,
        })
        .collect();
    out.sort_by(|a, b| {
        a.latitude
            .total_cmp(&b.latitude)
            .then(a.longitude.total_cmp(&b.longitude))
    });
    out
}

async fn heatmap_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HeatmapQuery>,
) -> Response {
    let parsed = (|| {
        Ok::<_, Response>((
            parse_param::<f64>(query.min_lat.as_deref(), "min_lat")?,
            parse_param::<f64>(query.min_lon.as_deref(), "min_lon")?,
            parse_param::<f64>(query.max_lat.as_deref(), "max_lat")?,
            parse_param::<f64>(query.max_lon.as_deref(), "max_lon")?,
            parse_param::<u32>(query.precision.as_deref(), "precision")?,
            parse_param::<u64>(query.min_count.as_deref(), "min_count")?,
        ))
    })();
    let (min_lat, min_lon, max_lat, max_lon, precision, min_count) = match parsed {
        Ok(values) => values,
        Err(resp) => return resp,
    };
    let (Some(min_lat), Some(min_lon), Some(max_lat), Some(max_lon)) =
        (min_lat, min_lon, max_lat, max_lon)
    else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "min_lat, min_lon, max_lat and max_lon are required",
        );
    };
    if min_lat >= max_lat || min_lon >= max_lon {
        return error_response(StatusCode::BAD_REQUEST, "bounding box is empty");
    }
    let precision = precision.unwrap_or(1).min(4);
    let min_count = min_count.unwrap_or(0).max(state.config.heatmap_min_count);

    let cache_key = format!(
        "heatmap:{min_lat}:{min_lon}:{max_lat}:{max_lon}:{precision}:{min_count}"
    );
    if let Some((value, cached_at)) = state.cache.get(&cache_key).await {
        return ok_response(value, "cache", cached_at);
    }

    let points = match state
        .store
        .office_points(min_lat, min_lon, max_lat, max_lon)
        .await
    {
        Ok(points) => points,
        Err(err) => return storage_error(err),
    };
    let cells = aggregate_heatmap(&points, precision, min_count);

    let value = serde_json::json!({ "precision": precision, "cells": cells });
    state
        .cache
        .put(CacheTier::Listing, cache_key, value.clone())
        .await;
    ok_response(value, "store", Utc::now())
}

#[derive(Debug, Deserialize, Default)]
struct CoverageQuery {
    state: Option<String>,
}

async fn coverage_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CoverageQuery>,
) -> Response {
    let Some(us_state) = query.state.as_deref().filter(|s| !s.trim().is_empty()) else {
        return error_response(StatusCode::BAD_REQUEST, "state query parameter is required");
    };
    let us_state = us_state.to_ascii_uppercase();

    let cache_key = format!("coverage:{us_state}");
    if let Some((value, cached_at)) = state.cache.get(&cache_key).await {
        return ok_response(value, "cache", cached_at);
    }

    let metric = match compute_coverage(
        state.store.as_ref(),
        &us_state,
        &state.expected,
        Utc::now(),
    )
    .await
    {
        Ok(metric) => metric,
        Err(err) => return storage_error(err),
    };

    let value = match serde_json::to_value(&metric) {
        Ok(value) => value,
        Err(err) => {
            warn!(error = %err, "serializing coverage metric");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "serialization failed");
        }
    };
    state
        .cache
        .put(CacheTier::Listing, cache_key, value.clone())
        .await;
    ok_response(value, "store", Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use chrono::TimeZone;
    use http_body_util::BodyExt;
    use repmap_adapters::{AdapterError, GeocodedDivision};
    use repmap_core::{
        CanonicalRepresentative, OfficeAddress, RepresentativeRecord, Source, SourceSnapshot,
    };
    use repmap_storage::MemoryStore;
    use tower::ServiceExt;

    struct StubGeocoder;

    #[async_trait]
    impl Geocoder for StubGeocoder {
        async fn resolve(&self, _address: &str) -> Result<GeocodedDivision, AdapterError> {
            Ok(GeocodedDivision {
                state: "CA".into(),
                district: Some("12".into()),
            })
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    async fn seed_rep(
        store: &MemoryStore,
        name: &str,
        district: Option<&str>,
        offices: Vec<OfficeAddress>,
    ) -> Uuid {
        let id = Uuid::new_v4();
        store
            .upsert_representative(CanonicalRepresentative {
                id,
                display_name: name.into(),
                party: Some("Independent".into()),
                level: Level::Federal,
                state: "CA".into(),
                chamber: None,
                district: district.map(Into::into),
                is_active: true,
                created_at: now(),
                updated_at: now(),
            })
            .await
            .unwrap();
        let record = RepresentativeRecord {
            source: Source::StaticCorpus,
            source_id: format!("seed-{id}"),
            display_name: name.into(),
            name_parts: Default::default(),
            party: Some("Independent".into()),
            level: Level::Federal,
            state: "CA".into(),
            chamber: None,
            district: district.map(Into::into),
            term_start: None,
            term_end: None,
            contacts: vec![],
            social: vec![],
            committees: vec![],
            offices,
            extra: Default::default(),
            fetched_at: now(),
        };
        store
            .put_source_snapshot(id, Source::StaticCorpus, SourceSnapshot::from_record(&record))
            .await
            .unwrap();
        id
    }

    fn office(lat: f64, lon: f64) -> OfficeAddress {
        OfficeAddress {
            label: None,
            address: "1 Main St".into(),
            latitude: Some(lat),
            longitude: Some(lon),
        }
    }

    fn test_app(store: Arc<MemoryStore>) -> Router {
        let mut config = WebConfig::default();
        config.heatmap_min_count = 2;
        let state = AppState::new(store, Arc::new(StubGeocoder), config).unwrap();
        app(state)
    }

    async fn get_json(app: &Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let resp = app
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let value = serde_json::from_slice(&body).unwrap();
        (status, value)
    }

    #[tokio::test]
    async fn every_endpoint_serves_from_a_memory_store() {
        let store = Arc::new(MemoryStore::new());
        let id = seed_rep(&store, "Jane Smith", Some("12"), vec![]).await;
        store.record_touch("CA", now()).await.unwrap();
        let app = test_app(store);

        let (status, body) = get_json(&app, "/healthz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");

        let (status, body) = get_json(&app, "/api/representatives?state=ca").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["success"].as_bool().unwrap());
        assert_eq!(body["data"].as_array().unwrap().len(), 1);

        let (status, body) = get_json(&app, "/api/representatives/by-address?address=1+Main+St").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["division"]["state"], "CA");
        assert_eq!(body["data"]["representatives"].as_array().unwrap().len(), 1);

        let (status, body) = get_json(&app, &format!("/api/representatives/{id}")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["representative"]["display_name"], "Jane Smith");
        assert_eq!(body["data"]["roles"].as_array().unwrap().len(), 1);

        let (status, body) =
            get_json(&app, "/api/heatmap?min_lat=30&min_lon=-130&max_lat=45&max_lon=-110").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["success"].as_bool().unwrap());

        let (status, body) = get_json(&app, "/api/coverage?state=CA").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["state"], "CA");
        assert_eq!(body["data"]["freshness"], 100.0);
    }

    #[tokio::test]
    async fn missing_state_parameter_is_a_client_error() {
        let app = test_app(Arc::new(MemoryStore::new()));
        let (status, body) = get_json(&app, "/api/representatives").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(!body["success"].as_bool().unwrap());
        assert!(body["error"].as_str().unwrap().contains("state"));
    }

    #[tokio::test]
    async fn malformed_query_parameters_get_the_json_envelope() {
        let app = test_app(Arc::new(MemoryStore::new()));

        let (status, body) = get_json(&app, "/api/representatives?state=CA&limit=abc").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(!body["success"].as_bool().unwrap());
        assert!(body["error"].as_str().unwrap().contains("limit"));

        let (status, body) =
            get_json(&app, "/api/heatmap?min_lat=x&min_lon=-130&max_lat=45&max_lon=-110").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(!body["success"].as_bool().unwrap());
        assert!(body["error"].as_str().unwrap().contains("min_lat"));
    }

    #[tokio::test]
    async fn expired_cache_entries_are_evicted_on_read() {
        let mut config = WebConfig::default();
        config.address_ttl = Duration::ZERO;
        let cache = TieredCache::new(&config);

        cache
            .put(
                CacheTier::Address,
                "address:1 elm st".into(),
                serde_json::json!({"x": 1}),
            )
            .await;
        assert!(cache.get("address:1 elm st").await.is_none());
        assert!(cache.entries.read().await.is_empty());
    }

    #[tokio::test]
    async fn cache_inserts_sweep_dead_entries_and_respect_the_cap() {
        let mut config = WebConfig::default();
        config.address_ttl = Duration::ZERO;
        config.cache_max_entries = 2;
        let cache = TieredCache::new(&config);

        // Dead address entries do not pin map slots.
        cache
            .put(CacheTier::Address, "address:a".into(), serde_json::json!(1))
            .await;
        cache
            .put(CacheTier::Address, "address:b".into(), serde_json::json!(2))
            .await;
        cache
            .put(CacheTier::Listing, "state:CA".into(), serde_json::json!(3))
            .await;
        assert_eq!(cache.entries.read().await.len(), 1);

        // At the cap of live entries, further responses go uncached.
        cache
            .put(CacheTier::Listing, "state:NY".into(), serde_json::json!(4))
            .await;
        cache
            .put(CacheTier::Listing, "state:TX".into(), serde_json::json!(5))
            .await;
        assert_eq!(cache.entries.read().await.len(), 2);
        assert!(cache.get("state:TX").await.is_none());
        assert!(cache.get("state:CA").await.is_some());
    }

    #[tokio::test]
    async fn unknown_representative_id_is_not_found() {
        let app = test_app(Arc::new(MemoryStore::new()));
        let (status, _) =
            get_json(&app, &format!("/api/representatives/{}", Uuid::new_v4())).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = get_json(&app, "/api/representatives/not-a-uuid").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn sparse_heatmap_cells_are_suppressed() {
        let store = Arc::new(MemoryStore::new());
        // Three offices in one cell, a lone office in another.
        seed_rep(&store, "A Rep", Some("1"), vec![office(34.01, -118.01)]).await;
        seed_rep(&store, "B Rep", Some("2"), vec![office(34.02, -118.02)]).await;
        seed_rep(&store, "C Rep", Some("3"), vec![office(34.03, -118.03)]).await;
        seed_rep(&store, "D Rep", Some("4"), vec![office(40.71, -74.01)]).await;
        let app = test_app(store);

        let (status, body) = get_json(
            &app,
            "/api/heatmap?min_lat=30&min_lon=-130&max_lat=45&max_lon=-70&precision=1",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let cells = body["data"]["cells"].as_array().unwrap();
        assert_eq!(cells.len(), 1);
        assert_eq!(cells[0]["count"], 3);

        // A requested threshold below the server floor does not reveal more.
        let (_, body) = get_json(
            &app,
            "/api/heatmap?min_lat=30&min_lon=-130&max_lat=45&max_lon=-70&precision=1&min_count=1",
        )
        .await;
        assert_eq!(body["data"]["cells"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn repeated_listing_requests_hit_the_cache() {
        let store = Arc::new(MemoryStore::new());
        seed_rep(&store, "Jane Smith", Some("12"), vec![]).await;
        let app = test_app(store);

        let (_, first) = get_json(&app, "/api/representatives?state=CA").await;
        assert_eq!(first["metadata"]["source_tier"], "store");

        let (_, second) = get_json(&app, "/api/representatives?state=CA").await;
        assert_eq!(second["metadata"]["source_tier"], "cache");
        assert_eq!(first["data"], second["data"]);
    }

    #[test]
    fn heatmap_cells_center_on_the_grid() {
        let points = vec![
            repmap_storage::HeatmapPoint {
                latitude: 34.01,
                longitude: -118.01,
            },
            repmap_storage::HeatmapPoint {
                latitude: 34.04,
                longitude: -118.04,
            },
        ];
        let cells = aggregate_heatmap(&points, 1, 2);
        assert_eq!(cells.len(), 1);
        assert!((cells[0].latitude - 34.05).abs() < 1e-9);
        assert!((cells[0].longitude - (-118.05)).abs() < 1e-9);
    }
}
