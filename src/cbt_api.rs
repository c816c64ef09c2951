// Remote data gateway for the CTA Bus Tracker API
//
// Endpoints (all take `key` and `format=json`):
// - getroutes
// - getvehicles?rt=
// - getstops?rt=[&dir=]
// - getpredictions?stpid=[&rt=]
// - getservicebulletins?[rt=][&stpid=]
// - getdirections?rt=

use crate::cbt_models::{
    ApiErrorRecord, Bulletin, CBTError, Direction, Prediction, RawRoute, Result, Stop, Vehicle,
};
use futures::future::BoxFuture;
use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

// ============================================================================
// TTL Cache
// ============================================================================

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    payload: V,
    inserted_at: Instant,
    ttl: Duration,
}

impl<V> CacheEntry<V> {
    fn is_fresh(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.inserted_at) < self.ttl
    }
}

/// In-memory cache where every entry carries its own time-to-live.
/// Expired entries are dropped when they are next looked up.
#[derive(Debug)]
pub struct TtlCache<V> {
    entries: Mutex<HashMap<String, CacheEntry<V>>>,
}

impl<V: Clone> TtlCache<V> {
    pub fn new() -> Self {
        TtlCache {
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, CacheEntry<V>>> {
        // A panic while holding the lock cannot leave a half-written entry behind.
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let mut entries = self.lock();
        let now = Instant::now();

        match entries.get(key) {
            Some(entry) if entry.is_fresh(now) => Some(entry.payload.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, key: impl Into<String>, payload: V, ttl: Duration) {
        self.lock().insert(
            key.into(),
            CacheEntry {
                payload,
                inserted_at: Instant::now(),
                ttl,
            },
        );
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Number of stored entries, expired ones included until they are looked up.
    pub fn len(&self) -> usize {
        self.lock().len()
    }
}

impl<V: Clone> Default for TtlCache<V> {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Cache keys
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// Segment used when an optional parameter is absent.
    pub const ALL: &'static str = "all";

    pub fn new(operation: &str) -> Self {
        CacheKey(operation.to_string())
    }

    pub fn part(mut self, value: &str) -> Self {
        self.0.push('-');
        self.0.push_str(&Self::escape(value));
        self
    }

    pub fn optional(self, value: Option<&str>) -> Self {
        match value.filter(|v| !v.is_empty()) {
            Some(v) => self.part(v),
            None => self.sentinel(),
        }
    }

    pub fn list(mut self, values: &[String]) -> Self {
        if values.is_empty() {
            return self.sentinel();
        }
        let joined: Vec<String> = values.iter().map(|v| Self::escape(v)).collect();
        self.0.push('-');
        self.0.push_str(&joined.join(","));
        self
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn sentinel(mut self) -> Self {
        self.0.push('-');
        self.0.push_str(Self::ALL);
        self
    }

    // Separators and the sentinel itself are encoded so that distinct
    // parameter sets never produce the same key.
    fn escape(value: &str) -> String {
        if value == Self::ALL {
            return "%61ll".to_string();
        }
        value
            .replace('%', "%25")
            .replace('-', "%2D")
            .replace(',', "%2C")
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Transport
// ============================================================================

#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    pub body: String,
}

impl RawResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Outbound HTTP GET. Only the gateway calls this.
pub trait Transport: Send + Sync {
    fn get<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<RawResponse>>;
}

pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CBTError::Transport(format!("Failed to create HTTP client: {}", e)))?;

        Ok(HttpTransport { client })
    }
}

impl Transport for HttpTransport {
    fn get<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<RawResponse>> {
        Box::pin(async move {
            let response = self.client.get(url).send().await.map_err(|e| {
                CBTError::Transport(format!(
                    "Failed to reach the bus tracker: {}. Check your internet connection.",
                    e.without_url()
                ))
            })?;

            let status = response.status().as_u16();
            let body = response
                .text()
                .await
                .map_err(|e| CBTError::Transport(format!("Failed to read response: {}", e.without_url())))?;

            Ok(RawResponse { status, body })
        })
    }
}

// ============================================================================
// Gateway
// ============================================================================

struct Query<'a> {
    endpoint: &'static str,
    params: Vec<(&'static str, &'a str)>,
    field: &'static str,
    label: &'static str,
    key: CacheKey,
    ttl: Duration,
}

pub struct CTAGateway {
    transport: Arc<dyn Transport>,
    base_url: String,
    api_key: String,
    cache: TtlCache<Value>,
}

impl CTAGateway {
    pub const DEFAULT_TTL: Duration = Duration::from_secs(30);
    pub const PREDICTION_TTL: Duration = Duration::from_secs(60);

    const ENVELOPE: &'static str = "bustime-response";

    pub fn new(transport: Arc<dyn Transport>, base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        CTAGateway {
            transport,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            cache: TtlCache::new(),
        }
    }

    pub async fn get_routes(&self) -> Result<Vec<RawRoute>> {
        self.query(Query {
            endpoint: "getroutes",
            params: Vec::new(),
            field: "routes",
            label: "routes",
            key: CacheKey::new("routes"),
            ttl: Self::DEFAULT_TTL,
        })
        .await
    }

    pub async fn get_vehicles(&self, route_id: &str) -> Result<Vec<Vehicle>> {
        self.query(Query {
            endpoint: "getvehicles",
            params: vec![("rt", route_id)],
            field: "vehicle",
            label: "vehicles",
            key: CacheKey::new("vehicles").part(route_id),
            ttl: Self::DEFAULT_TTL,
        })
        .await
    }

    pub async fn get_stops(&self, route_id: &str, direction: Option<&str>) -> Result<Vec<Stop>> {
        let mut params = vec![("rt", route_id)];
        if let Some(dir) = direction.filter(|d| !d.is_empty()) {
            params.push(("dir", dir));
        }

        let mut stops: Vec<Stop> = self
            .query(Query {
                endpoint: "getstops",
                params,
                field: "stops",
                label: "stops",
                key: CacheKey::new("stops").part(route_id).optional(direction),
                ttl: Self::DEFAULT_TTL,
            })
            .await?;

        for stop in &mut stops {
            stop.route_id = route_id.to_string();
        }
        Ok(stops)
    }

    pub async fn get_predictions(&self, stop_id: &str, route_id: Option<&str>) -> Result<Vec<Prediction>> {
        let mut params = vec![("stpid", stop_id)];
        if let Some(rt) = route_id.filter(|r| !r.is_empty()) {
            params.push(("rt", rt));
        }

        self.query(Query {
            endpoint: "getpredictions",
            params,
            field: "prd",
            label: "predictions",
            key: CacheKey::new("predictions").part(stop_id).optional(route_id),
            ttl: Self::PREDICTION_TTL,
        })
        .await
    }

    pub async fn get_service_bulletins(&self, route_ids: &[String], stop_ids: &[String]) -> Result<Vec<Bulletin>> {
        let routes = route_ids.join(",");
        let stops = stop_ids.join(",");
        let mut params = Vec::new();
        if !route_ids.is_empty() {
            params.push(("rt", routes.as_str()));
        }
        if !stop_ids.is_empty() {
            params.push(("stpid", stops.as_str()));
        }

        self.query(Query {
            endpoint: "getservicebulletins",
            params,
            field: "sb",
            label: "service bulletins",
            key: CacheKey::new("bulletins").list(route_ids).list(stop_ids),
            ttl: Self::DEFAULT_TTL,
        })
        .await
    }

    pub async fn get_directions(&self, route_id: &str) -> Result<Vec<Direction>> {
        self.query(Query {
            endpoint: "getdirections",
            params: vec![("rt", route_id)],
            field: "directions",
            label: "directions",
            key: CacheKey::new("directions").part(route_id),
            ttl: Self::DEFAULT_TTL,
        })
        .await
    }

    /// Drops every cached response, used on manual refresh.
    pub fn clear_cache(&self) {
        debug!("Clearing {} cached responses", self.cache.len());
        self.cache.clear();
    }

    #[cfg(test)]
    pub fn cached_entries(&self) -> usize {
        self.cache.len()
    }

    async fn query<T: DeserializeOwned>(&self, query: Query<'_>) -> Result<Vec<T>> {
        if let Some(payload) = self.cache.get(query.key.as_str()) {
            debug!("Cache hit for {}", query.key);
            let (records, _) = Self::decode_records(payload, query.label)?;
            return Ok(records);
        }

        let url = self.build_url(query.endpoint, &query.params)?;
        debug!("Cache miss for {}, requesting {}", query.key, query.endpoint);

        let response = self.transport.get(url.as_str()).await.map_err(|e| {
            warn!("Request to {} failed: {}", query.endpoint, e);
            e
        })?;

        if !response.is_success() {
            warn!("{} returned HTTP {}", query.endpoint, response.status);
            return Err(CBTError::Upstream {
                status: response.status,
            });
        }

        let payload = Self::parse_envelope(&response.body, query.field).map_err(|e| {
            warn!("{} rejected: {}", query.endpoint, e);
            e
        })?;

        // Only records that decoded are cached, so a hit never fails.
        let (records, kept) = Self::decode_records(payload, query.label)?;
        self.cache.insert(query.key.as_str(), kept, query.ttl);
        Ok(records)
    }

    fn build_url(&self, endpoint: &str, params: &[(&str, &str)]) -> Result<reqwest::Url> {
        let base = format!("{}/{}", self.base_url, endpoint);
        let mut query: Vec<(&str, &str)> = vec![("key", self.api_key.as_str()), ("format", "json")];
        query.extend_from_slice(params);

        reqwest::Url::parse_with_params(&base, &query)
            .map_err(|e| CBTError::Config(format!("Invalid API URL '{}': {}", base, e)))
    }

    /// Extracts `field` from the envelope. A missing field is an empty result,
    /// an `error` array is a business-level failure.
    pub fn parse_envelope(body: &str, field: &str) -> Result<Value> {
        let json: Value = serde_json::from_str(body)
            .map_err(|e| CBTError::Parse(format!("Invalid JSON response: {}", e)))?;

        let envelope = json
            .get(Self::ENVELOPE)
            .ok_or_else(|| CBTError::Parse(format!("Missing '{}' envelope", Self::ENVELOPE)))?;

        if let Some(first) = envelope
            .get("error")
            .and_then(Value::as_array)
            .and_then(|errors| errors.first())
        {
            let record: ApiErrorRecord = serde_json::from_value(first.clone()).unwrap_or(ApiErrorRecord {
                msg: first.to_string(),
                rt: None,
            });
            return Err(CBTError::Api {
                message: record.msg,
                route: record.rt,
            });
        }

        Ok(match envelope.get(field) {
            Some(Value::Array(items)) => Value::Array(items.clone()),
            Some(Value::Object(item)) => Value::Array(vec![Value::Object(item.clone())]),
            _ => Value::Array(Vec::new()),
        })
    }

    /// Decodes each record on its own. Records that fail are logged and
    /// skipped; the query only fails when nothing decodes at all. Returns the
    /// records and the array of their source values.
    fn decode_records<T: DeserializeOwned>(payload: Value, what: &str) -> Result<(Vec<T>, Value)> {
        let items = match payload {
            Value::Array(items) => items,
            other => vec![other],
        };

        let mut records = Vec::with_capacity(items.len());
        let mut kept = Vec::with_capacity(items.len());
        let mut last_error = None;

        for item in items {
            match serde_json::from_value::<T>(item.clone()) {
                Ok(record) => {
                    records.push(record);
                    kept.push(item);
                }
                Err(e) => {
                    warn!("Skipping unreadable {} record: {}", what, e);
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) if records.is_empty() => Err(CBTError::Parse(format!("Invalid {} data: {}", what, e))),
            _ => Ok((records, Value::Array(kept))),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::cbt_models::Countdown;

    /// Serves canned bodies by endpoint name and records every URL requested.
    #[derive(Default)]
    pub(crate) struct ScriptedTransport {
        responses: Mutex<HashMap<String, Vec<RawResponse>>>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedTransport {
        pub(crate) fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        /// Queues a response; the last queued response for an endpoint repeats.
        pub(crate) fn respond(&self, endpoint: &str, status: u16, body: &str) {
            self.responses
                .lock()
                .unwrap()
                .entry(endpoint.to_string())
                .or_default()
                .push(RawResponse {
                    status,
                    body: body.to_string(),
                });
        }

        pub(crate) fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        pub(crate) fn calls_to(&self, endpoint: &str) -> usize {
            self.calls().iter().filter(|url| url.contains(&format!("/{}?", endpoint))).count()
        }
    }

    impl Transport for ScriptedTransport {
        fn get<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<RawResponse>> {
            Box::pin(async move {
                self.calls.lock().unwrap().push(url.to_string());
                let endpoint = url
                    .split('?')
                    .next()
                    .and_then(|path| path.rsplit('/').next())
                    .unwrap_or_default()
                    .to_string();

                let mut responses = self.responses.lock().unwrap();
                match responses.get_mut(&endpoint) {
                    Some(queue) if queue.len() > 1 => Ok(queue.remove(0)),
                    Some(queue) if !queue.is_empty() => Ok(queue[0].clone()),
                    _ => Err(CBTError::Transport(format!("no route to {}", endpoint))),
                }
            })
        }
    }

    pub(crate) const VEHICLES_22: &str = r#"{"bustime-response":{"vehicle":[
        {"vid":"1901","tmstmp":"20240315 08:30","lat":"41.92","lon":"-87.64","hdg":"180","rt":"22","des":"Harrison","spd":12},
        {"vid":"1902","tmstmp":"20240315 08:31","lat":"41.95","lon":"-87.65","hdg":"0","rt":"22","des":"Howard","spd":0}
    ]}}"#;

    fn gateway(transport: &Arc<ScriptedTransport>) -> CTAGateway {
        CTAGateway::new(transport.clone(), "https://bus.example/api/v2/", "secret")
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_cache_is_a_function_of_elapsed_time() {
        let cache: TtlCache<u32> = TtlCache::new();
        let ttl = Duration::from_secs(30);

        for elapsed in [0u64, 1, 15, 29] {
            cache.insert("k", 7, ttl);
            tokio::time::advance(Duration::from_secs(elapsed)).await;
            assert_eq!(cache.get("k"), Some(7), "elapsed {}s", elapsed);
        }

        for elapsed in [30u64, 31, 120] {
            cache.insert("k", 7, ttl);
            tokio::time::advance(Duration::from_secs(elapsed)).await;
            assert_eq!(cache.get("k"), None, "elapsed {}s", elapsed);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entries_are_evicted_lazily() {
        let cache: TtlCache<&str> = TtlCache::new();
        cache.insert("a", "x", Duration::from_secs(1));
        cache.insert("b", "y", Duration::from_secs(100));

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("b"), Some("y"));
    }

    #[test]
    fn filtered_and_unfiltered_keys_never_collide() {
        let unfiltered = CacheKey::new("predictions").part("1001").optional(None);
        let filtered = CacheKey::new("predictions").part("1001").optional(Some("22"));
        let literal_all = CacheKey::new("predictions").part("1001").optional(Some("all"));

        assert_eq!(unfiltered.as_str(), "predictions-1001-all");
        assert_eq!(filtered.as_str(), "predictions-1001-22");
        assert_ne!(unfiltered, filtered);
        assert_ne!(unfiltered, literal_all);

        let hyphenated = CacheKey::new("stops").part("a-b").optional(None);
        let split = CacheKey::new("stops").part("a").optional(Some("b-all"));
        assert_ne!(hyphenated, split);

        let joined = CacheKey::new("bulletins").list(&["22,151".to_string()]).list(&[]);
        let separate = CacheKey::new("bulletins").list(&["22".to_string(), "151".to_string()]).list(&[]);
        assert_ne!(joined, separate);
    }

    #[tokio::test(start_paused = true)]
    async fn vehicles_are_cached_until_cleared() {
        let transport = ScriptedTransport::new();
        transport.respond("getvehicles", 200, VEHICLES_22);
        let gateway = gateway(&transport);

        let first = gateway.get_vehicles("22").await.unwrap();
        tokio::time::advance(Duration::from_secs(20)).await;
        let second = gateway.get_vehicles("22").await.unwrap();

        assert_eq!(first.len(), 2);
        assert_eq!(first, second);
        assert_eq!(transport.calls_to("getvehicles"), 1);

        gateway.clear_cache();
        gateway.get_vehicles("22").await.unwrap();
        assert_eq!(transport.calls_to("getvehicles"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn vehicles_expire_after_thirty_seconds() {
        let transport = ScriptedTransport::new();
        transport.respond("getvehicles", 200, VEHICLES_22);
        let gateway = gateway(&transport);

        gateway.get_vehicles("22").await.unwrap();
        tokio::time::advance(Duration::from_secs(30)).await;
        gateway.get_vehicles("22").await.unwrap();

        assert_eq!(transport.calls_to("getvehicles"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn predictions_live_for_a_minute() {
        let transport = ScriptedTransport::new();
        transport.respond(
            "getpredictions",
            200,
            r#"{"bustime-response":{"prd":[{"rt":"22","des":"Harrison","prdctdn":"DUE","stpid":"1001"}]}}"#,
        );
        let gateway = gateway(&transport);

        let predictions = gateway.get_predictions("1001", None).await.unwrap();
        assert_eq!(predictions[0].countdown, Countdown::Due);

        tokio::time::advance(Duration::from_secs(45)).await;
        gateway.get_predictions("1001", None).await.unwrap();
        assert_eq!(transport.calls_to("getpredictions"), 1);

        tokio::time::advance(Duration::from_secs(16)).await;
        gateway.get_predictions("1001", None).await.unwrap();
        assert_eq!(transport.calls_to("getpredictions"), 2);
    }

    #[tokio::test]
    async fn route_filter_is_a_separate_prediction_query() {
        let transport = ScriptedTransport::new();
        transport.respond("getpredictions", 200, r#"{"bustime-response":{"prd":[]}}"#);
        let gateway = gateway(&transport);

        gateway.get_predictions("1001", None).await.unwrap();
        gateway.get_predictions("1001", Some("22")).await.unwrap();
        gateway.get_predictions("1001", Some("22")).await.unwrap();

        let calls = transport.calls();
        assert_eq!(calls.len(), 2);
        assert!(!calls[0].contains("rt="));
        assert!(calls[1].contains("rt=22"));
    }

    #[tokio::test]
    async fn requests_carry_key_and_format() {
        let transport = ScriptedTransport::new();
        transport.respond("getstops", 200, r#"{"bustime-response":{"stops":[{"stpid":"1001","stpnm":"Clark & Belmont","lat":41.94,"lon":-87.64}]}}"#);
        let gateway = gateway(&transport);

        let stops = gateway.get_stops("22", Some("Northbound")).await.unwrap();

        let url = &transport.calls()[0];
        assert!(url.starts_with("https://bus.example/api/v2/getstops?"));
        assert!(url.contains("key=secret"));
        assert!(url.contains("format=json"));
        assert!(url.contains("dir=Northbound"));
        assert_eq!(stops[0].route_id, "22");
        assert_eq!(stops[0].name, "Clark & Belmont");
    }

    #[tokio::test]
    async fn business_errors_carry_message_and_route_and_are_not_cached() {
        let transport = ScriptedTransport::new();
        transport.respond("getvehicles", 200, r#"{"bustime-response":{"error":[{"rt":"999","msg":"Invalid route"}]}}"#);
        transport.respond("getvehicles", 200, VEHICLES_22);
        let gateway = gateway(&transport);

        match gateway.get_vehicles("999").await {
            Err(CBTError::Api { message, route }) => {
                assert_eq!(message, "Invalid route");
                assert_eq!(route.as_deref(), Some("999"));
            }
            other => panic!("expected an API error, got {:?}", other),
        }
        assert_eq!(gateway.cached_entries(), 0);

        assert_eq!(gateway.get_vehicles("999").await.unwrap().len(), 2);
        assert_eq!(transport.calls_to("getvehicles"), 2);
    }

    #[tokio::test]
    async fn undecodable_results_are_not_cached() {
        let transport = ScriptedTransport::new();
        transport.respond(
            "getvehicles",
            200,
            r#"{"bustime-response":{"vehicle":[{"vid":"1901","tmstmp":"20240315 08:30","lon":"-87.64","rt":"22"}]}}"#,
        );
        transport.respond("getvehicles", 200, VEHICLES_22);
        let gateway = gateway(&transport);

        assert!(matches!(gateway.get_vehicles("22").await, Err(CBTError::Parse(_))));
        assert_eq!(gateway.cached_entries(), 0);

        assert_eq!(gateway.get_vehicles("22").await.unwrap().len(), 2);
        assert_eq!(transport.calls_to("getvehicles"), 2);
    }

    #[tokio::test]
    async fn unreadable_records_are_skipped() {
        let transport = ScriptedTransport::new();
        transport.respond(
            "getvehicles",
            200,
            r#"{"bustime-response":{"vehicle":[
                {"vid":"1901","tmstmp":"20240315 08:30","lat":"41.92","lon":"-87.64","rt":"22","des":"Harrison"},
                {"vid":"1903","tmstmp":"yesterday-ish","lat":"41.93","lon":"-87.64","rt":"22","des":"Howard"},
                {"vid":"1902","tmstmp":"20240315 08:31","lat":"41.95","lon":"-87.65","rt":"22","des":"Howard"}
            ]}}"#,
        );
        transport.respond(
            "getpredictions",
            200,
            r#"{"bustime-response":{"prd":[{"rt":"22","des":"Harrison","prdctdn":"DUE","stpid":"1001"},{"des":"Nowhere"}]}}"#,
        );
        let gateway = gateway(&transport);

        let ids: Vec<Option<String>> = gateway
            .get_vehicles("22")
            .await
            .unwrap()
            .into_iter()
            .map(|v| v.vehicle_id)
            .collect();
        assert_eq!(ids, vec![Some("1901".to_string()), Some("1902".to_string())]);
        assert_eq!(gateway.get_vehicles("22").await.unwrap().len(), 2);
        assert_eq!(transport.calls_to("getvehicles"), 1);

        assert_eq!(gateway.get_predictions("1001", None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn non_success_status_is_an_upstream_error() {
        let transport = ScriptedTransport::new();
        transport.respond("getroutes", 503, "Service Unavailable");
        let gateway = gateway(&transport);

        assert!(matches!(gateway.get_routes().await, Err(CBTError::Upstream { status: 503 })));
        assert!(matches!(gateway.get_routes().await, Err(CBTError::Upstream { status: 503 })));
        assert_eq!(transport.calls_to("getroutes"), 2);
    }

    #[tokio::test]
    async fn transport_failures_propagate() {
        let transport = ScriptedTransport::new();
        let gateway = gateway(&transport);

        assert!(matches!(gateway.get_directions("22").await, Err(CBTError::Transport(_))));
    }

    #[tokio::test]
    async fn missing_result_field_is_an_empty_cached_result() {
        let transport = ScriptedTransport::new();
        transport.respond("getservicebulletins", 200, r#"{"bustime-response":{}}"#);
        let gateway = gateway(&transport);

        let routes = vec!["22".to_string()];
        assert!(gateway.get_service_bulletins(&routes, &[]).await.unwrap().is_empty());
        assert!(gateway.get_service_bulletins(&routes, &[]).await.unwrap().is_empty());
        assert_eq!(transport.calls_to("getservicebulletins"), 1);
    }

    #[test]
    fn single_object_results_are_wrapped() {
        let payload = CTAGateway::parse_envelope(
            r#"{"bustime-response":{"directions":{"dir":"Eastbound"}}}"#,
            "directions",
        )
        .unwrap();
        let directions: Vec<Direction> = serde_json::from_value(payload).unwrap();
        assert_eq!(directions, vec![Direction { name: "Eastbound".to_string() }]);
    }

    #[test]
    fn invalid_json_is_a_parse_error() {
        assert!(matches!(CTAGateway::parse_envelope("<html>", "routes"), Err(CBTError::Parse(_))));
        assert!(matches!(CTAGateway::parse_envelope("{}", "routes"), Err(CBTError::Parse(_))));
    }
}
