// Domain models for the CTA (Chicago Transit Authority) bus tracker dashboard
// Upstream: CTA Bus Tracker API v2, https://www.ctabustracker.com/bustime/api/v2
//
// Every response is wrapped in a `bustime-response` envelope that carries either
// the named result array (routes, vehicle, stops, prd, sb, directions) or an
// `error` array with a message and the route it refers to.

use chrono::{NaiveDateTime, TimeZone, Utc};
use chrono_tz::America::Chicago;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use thiserror::Error;

// ============================================================================
// Error Handling
// ============================================================================

#[derive(Debug, Error)]
pub enum CBTError {
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("API Error: {status}")]
    Upstream { status: u16 },
    #[error("CTA API Error: {message} ({})", .route.as_deref().unwrap_or("no route"))]
    Api {
        message: String,
        route: Option<String>,
    },
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Malformed record: {0}")]
    MalformedRecord(String),
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, CBTError>;

// ============================================================================
// Geometry
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatLon {
    pub lat: f64,
    pub lon: f64,
}

impl LatLon {
    pub fn new(lat: f64, lon: f64) -> Self {
        LatLon { lat, lon }
    }

    pub fn to_coord(self) -> geo_types::Coord<f64> {
        geo_types::coord! { x: self.lon, y: self.lat }
    }
}

// ============================================================================
// Routes
// ============================================================================

/// Route record as it comes out of `getroutes`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawRoute {
    #[serde(default, deserialize_with = "de_opt_string")]
    pub rt: Option<String>,
    #[serde(default)]
    pub rtnm: Option<String>,
    #[serde(default)]
    pub rtdir1: Option<String>,
    #[serde(default)]
    pub rtdir2: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct RouteDirections {
    pub primary: Option<String>,
    pub secondary: Option<String>,
}

impl RouteDirections {
    pub fn label(&self) -> String {
        match (&self.primary, &self.secondary) {
            (Some(p), Some(s)) => format!("{} / {}", p, s),
            (Some(one), None) | (None, Some(one)) => one.clone(),
            (None, None) => String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Route {
    pub id: String,
    pub name: String,
    pub directions: RouteDirections,
    pub color: &'static str,
}

impl Route {
    pub const FALLBACK_COLOR: &'static str = "#8E8E93";

    const ROUTE_COLORS: &'static [(&'static str, &'static str)] = &[
        ("22", "#1A73E8"),
        ("151", "#FF9500"),
    ];

    /// Builds a route from its upstream record. A record without an identifier
    /// is rejected rather than turned into an unaddressable entity.
    pub fn from_record(record: RawRoute) -> Result<Route> {
        let id = record
            .rt
            .map(|rt| rt.trim().to_string())
            .filter(|rt| !rt.is_empty())
            .ok_or_else(|| {
                CBTError::MalformedRecord(format!(
                    "route record without identifier (name: {})",
                    record.rtnm.as_deref().unwrap_or("unknown")
                ))
            })?;

        let name = record
            .rtnm
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| id.clone());

        Ok(Route {
            color: Self::assign_color(&id),
            name,
            directions: RouteDirections {
                primary: record.rtdir1,
                secondary: record.rtdir2,
            },
            id,
        })
    }

    pub fn assign_color(route_id: &str) -> &'static str {
        Self::ROUTE_COLORS
            .iter()
            .find(|(id, _)| *id == route_id)
            .map(|(_, color)| *color)
            .unwrap_or(Self::FALLBACK_COLOR)
    }

    pub fn matches(&self, term_lowercase: &str) -> bool {
        self.id.to_lowercase().contains(term_lowercase)
            || self.name.to_lowercase().contains(term_lowercase)
    }
}

// ============================================================================
// Vehicles, Stops, Predictions
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vehicle {
    #[serde(rename = "vid", default, deserialize_with = "de_opt_string")]
    pub vehicle_id: Option<String>,
    #[serde(rename = "rt", deserialize_with = "de_string")]
    pub route_id: String,
    #[serde(deserialize_with = "de_f64")]
    pub lat: f64,
    #[serde(deserialize_with = "de_f64")]
    pub lon: f64,
    #[serde(rename = "hdg", default, deserialize_with = "de_opt_f64")]
    pub heading: Option<f64>,
    #[serde(rename = "spd", default, deserialize_with = "de_opt_f64")]
    pub speed: Option<f64>,
    #[serde(rename = "des", default)]
    pub destination: String,
    #[serde(rename = "tmstmp", deserialize_with = "de_timestamp")]
    pub last_update: i64,
}

impl Vehicle {
    pub fn position(&self) -> LatLon {
        LatLon::new(self.lat, self.lon)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stop {
    #[serde(rename = "stpid", deserialize_with = "de_string")]
    pub stop_id: String,
    #[serde(rename = "stpnm", default)]
    pub name: String,
    #[serde(deserialize_with = "de_f64")]
    pub lat: f64,
    #[serde(deserialize_with = "de_f64")]
    pub lon: f64,
    /// Filled in by the gateway from the query, the feed does not echo it.
    #[serde(skip_deserializing, default)]
    pub route_id: String,
}

impl Stop {
    pub fn position(&self) -> LatLon {
        LatLon::new(self.lat, self.lon)
    }
}

/// Countdown until a predicted arrival. `DUE` is the upstream sentinel for a
/// vehicle arriving now; anything else is kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Countdown {
    Due,
    Minutes(String),
}

impl Countdown {
    pub const DUE_SENTINEL: &'static str = "DUE";

    pub fn parse(raw: &str) -> Countdown {
        let raw = raw.trim();
        if raw.eq_ignore_ascii_case(Self::DUE_SENTINEL) {
            Countdown::Due
        } else {
            Countdown::Minutes(raw.to_string())
        }
    }

    pub fn label(&self) -> &str {
        match self {
            Countdown::Due => "Now",
            Countdown::Minutes(minutes) => minutes,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    #[serde(rename = "rt", deserialize_with = "de_string")]
    pub route_id: String,
    #[serde(rename = "des", default)]
    pub destination: String,
    #[serde(rename = "prdctdn", deserialize_with = "de_countdown")]
    pub countdown: Countdown,
    #[serde(rename = "stpid", deserialize_with = "de_string")]
    pub stop_id: String,
    #[serde(rename = "stpnm", default)]
    pub stop_name: Option<String>,
    #[serde(rename = "vid", default, deserialize_with = "de_opt_string")]
    pub vehicle_id: Option<String>,
}

// ============================================================================
// Bulletins & Directions
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulletinService {
    #[serde(default, deserialize_with = "de_opt_string")]
    pub rt: Option<String>,
    #[serde(default, deserialize_with = "de_opt_string")]
    pub stpid: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bulletin {
    #[serde(rename = "nm", default)]
    pub name: String,
    #[serde(rename = "sbj", default)]
    pub subject: String,
    #[serde(rename = "dtl", default)]
    pub detail: String,
    #[serde(rename = "brf", default)]
    pub brief: Option<String>,
    #[serde(rename = "prty", default)]
    pub priority: Option<String>,
    #[serde(rename = "srvc", default)]
    pub services: Vec<BulletinService>,
}

impl Bulletin {
    pub fn summary(&self) -> &str {
        self.brief
            .as_deref()
            .filter(|b| !b.is_empty())
            .unwrap_or(&self.subject)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Direction {
    #[serde(rename = "dir", alias = "name", alias = "id")]
    pub name: String,
}

/// Business-level error carried inside the envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiErrorRecord {
    #[serde(default)]
    pub msg: String,
    #[serde(default, deserialize_with = "de_opt_string")]
    pub rt: Option<String>,
}

// ============================================================================
// Lenient field decoding
// ============================================================================

// The feed encodes most numbers as strings, and a few as numbers depending on
// the endpoint version.
fn value_to_string(value: Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn de_string<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<String, D::Error> {
    value_to_string(Value::deserialize(d)?)
        .ok_or_else(|| serde::de::Error::custom("expected a string or number"))
}

fn de_opt_string<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Option<String>, D::Error> {
    Ok(Option::<Value>::deserialize(d)?.and_then(value_to_string))
}

fn value_to_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn de_f64<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<f64, D::Error> {
    let value = Value::deserialize(d)?;
    value_to_f64(&value)
        .ok_or_else(|| serde::de::Error::custom(format!("expected a coordinate, got {}", value)))
}

fn de_opt_f64<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Option<f64>, D::Error> {
    Ok(Option::<Value>::deserialize(d)?.as_ref().and_then(value_to_f64))
}

fn de_countdown<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Countdown, D::Error> {
    Ok(Countdown::parse(&de_string(d)?))
}

fn de_timestamp<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<i64, D::Error> {
    let raw = de_string(d)?;
    CBTModels::parse_timestamp(&raw)
        .ok_or_else(|| serde::de::Error::custom(format!("unrecognised timestamp '{}'", raw)))
}

// ============================================================================
// Helpers
// ============================================================================

pub struct CBTModels;

impl CBTModels {
    /// Accepts epoch seconds or the feed's `YYYYMMDD HH:MM[:SS]` Chicago local time.
    pub fn parse_timestamp(raw: &str) -> Option<i64> {
        let raw = raw.trim();
        if let Ok(epoch) = raw.parse::<i64>() {
            return Some(epoch);
        }

        let naive = NaiveDateTime::parse_from_str(raw, "%Y%m%d %H:%M:%S")
            .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y%m%d %H:%M"))
            .ok()?;

        Chicago
            .from_local_datetime(&naive)
            .earliest()
            .map(|dt| dt.timestamp())
    }

    pub fn format_timestamp(timestamp: i64) -> String {
        match Utc.timestamp_opt(timestamp, 0).single() {
            Some(dt) => dt.with_timezone(&Chicago).format("%H:%M:%S").to_string(),
            None => "??:??:??".to_string(),
        }
    }

    /// Builds routes from raw records, returning the records that were rejected.
    pub fn build_routes(records: Vec<RawRoute>) -> (Vec<Route>, Vec<CBTError>) {
        let mut routes: Vec<Route> = Vec::with_capacity(records.len());
        let mut rejected = Vec::new();

        for record in records {
            match Route::from_record(record) {
                Ok(route) if routes.iter().any(|r| r.id == route.id) => {
                    log::debug!("Skipping duplicate route {}", route.id);
                }
                Ok(route) => routes.push(route),
                Err(e) => rejected.push(e),
            }
        }

        (routes, rejected)
    }

    /// Case-insensitive substring match on identifier or name, preserving order.
    pub fn filter_routes<'a>(routes: &'a [Route], term: &str) -> Vec<&'a Route> {
        let term = term.to_lowercase();
        routes.iter().filter(|r| r.matches(&term)).collect()
    }

    pub fn parse_hex_color(hex_color: &str) -> (u8, u8, u8) {
        let hex = hex_color.trim_start_matches('#');
        if hex.len() != 6 || !hex.is_ascii() {
            return (142, 142, 147);
        }

        let channel = |range: std::ops::Range<usize>| u8::from_str_radix(&hex[range], 16).unwrap_or(128);
        (channel(0..2), channel(2..4), channel(4..6))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(rt: &str, name: &str) -> RawRoute {
        RawRoute {
            rt: Some(rt.to_string()),
            rtnm: Some(name.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn known_routes_get_their_palette_color() {
        assert_eq!(Route::assign_color("22"), "#1A73E8");
        assert_eq!(Route::assign_color("151"), "#FF9500");
    }

    #[test]
    fn unknown_routes_fall_back_to_gray() {
        for id in ["", "9", "X9", "220", "1511", "22 "] {
            assert_eq!(Route::assign_color(id), Route::FALLBACK_COLOR, "route {:?}", id);
        }
    }

    #[test]
    fn route_without_identifier_is_rejected() {
        let missing = RawRoute {
            rtnm: Some("Ghost".to_string()),
            ..Default::default()
        };
        assert!(matches!(Route::from_record(missing), Err(CBTError::MalformedRecord(_))));

        let blank = raw("   ", "Blank");
        assert!(Route::from_record(blank).is_err());
    }

    #[test]
    fn route_keeps_both_direction_labels() {
        let record: RawRoute = serde_json::from_value(json!({
            "rt": "22", "rtnm": "Clark", "rtdir1": "Northbound", "rtdir2": "Southbound"
        }))
        .unwrap();
        let route = Route::from_record(record).unwrap();

        assert_eq!(route.id, "22");
        assert_eq!(route.color, "#1A73E8");
        assert_eq!(route.directions.label(), "Northbound / Southbound");
    }

    #[test]
    fn numeric_route_ids_are_accepted() {
        let record: RawRoute = serde_json::from_value(json!({ "rt": 151, "rtnm": "Sheridan" })).unwrap();
        assert_eq!(Route::from_record(record).unwrap().id, "151");
    }

    #[test]
    fn build_routes_skips_bad_and_duplicate_records() {
        let records = vec![raw("22", "Clark"), RawRoute::default(), raw("22", "Clark again"), raw("8", "Halsted")];
        let (routes, rejected) = CBTModels::build_routes(records);

        let ids: Vec<&str> = routes.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["22", "8"]);
        assert_eq!(rejected.len(), 1);
    }

    #[test]
    fn filtering_is_case_insensitive_on_id_or_name() {
        let (routes, _) = CBTModels::build_routes(vec![
            raw("22", "Clark"),
            raw("151", "Sheridan"),
            raw("X9", "Ashland Express"),
        ]);

        let ids = |term: &str| -> Vec<String> {
            CBTModels::filter_routes(&routes, term).iter().map(|r| r.id.clone()).collect()
        };

        assert_eq!(ids("CLARK"), vec!["22"]);
        assert_eq!(ids("x9"), vec!["X9"]);
        assert_eq!(ids("1"), vec!["151"]);
        assert!(ids("nowhere").is_empty());
        assert_eq!(ids("land ex"), vec!["X9"]);
        assert!(ids(" clark").is_empty());
    }

    #[test]
    fn empty_filter_returns_everything_in_order() {
        let (routes, _) = CBTModels::build_routes(vec![raw("8", "Halsted"), raw("22", "Clark"), raw("3", "King Drive")]);
        let all: Vec<&Route> = CBTModels::filter_routes(&routes, "");
        assert_eq!(all, routes.iter().collect::<Vec<_>>());
    }

    #[test]
    fn countdown_sentinel_renders_as_now() {
        assert_eq!(Countdown::parse("DUE").label(), "Now");
        assert_eq!(Countdown::parse("7").label(), "7");
        assert_eq!(Countdown::parse("DLY").label(), "DLY");
    }

    #[test]
    fn vehicles_decode_string_encoded_numbers() {
        let vehicle: Vehicle = serde_json::from_value(json!({
            "vid": "1234", "rt": "22", "lat": "41.9101", "lon": "-87.6313",
            "hdg": "358", "des": "Howard", "tmstmp": "20240315 08:30"
        }))
        .unwrap();

        assert_eq!(vehicle.vehicle_id.as_deref(), Some("1234"));
        assert!((vehicle.lat - 41.9101).abs() < 1e-9);
        assert_eq!(vehicle.heading, Some(358.0));
        assert_eq!(vehicle.speed, None);
        // 08:30 CDT is 13:30 UTC
        assert_eq!(vehicle.last_update, 1_710_509_400);
    }

    #[test]
    fn vehicles_accept_epoch_timestamps() {
        let vehicle: Vehicle = serde_json::from_value(json!({
            "rt": "151", "lat": 41.88, "lon": -87.62, "hdg": 90, "spd": 17,
            "des": "Union Station", "tmstmp": 1700000000
        }))
        .unwrap();

        assert_eq!(vehicle.last_update, 1_700_000_000);
        assert_eq!(vehicle.speed, Some(17.0));
    }

    #[test]
    fn prediction_decodes_due_countdown() {
        let prediction: Prediction = serde_json::from_value(json!({
            "rt": "22", "des": "Harrison", "prdctdn": "DUE", "stpid": "1001", "stpnm": "Clark & Belmont"
        }))
        .unwrap();

        assert_eq!(prediction.countdown, Countdown::Due);
        assert_eq!(prediction.stop_id, "1001");
    }

    #[test]
    fn bulletin_summary_prefers_brief() {
        let mut bulletin: Bulletin = serde_json::from_value(json!({
            "nm": "Reroute", "sbj": "Route 22 reroute", "dtl": "<p>detail</p>", "srvc": [{ "rt": "22" }]
        }))
        .unwrap();
        assert_eq!(bulletin.summary(), "Route 22 reroute");

        bulletin.brief = Some("Buses detoured".to_string());
        assert_eq!(bulletin.summary(), "Buses detoured");
    }

    #[test]
    fn api_error_display_includes_route_context() {
        let err = CBTError::Api {
            message: "Invalid route".to_string(),
            route: Some("999".to_string()),
        };
        assert_eq!(err.to_string(), "CTA API Error: Invalid route (999)");
    }

    #[test]
    fn hex_colors_parse_with_fallback() {
        assert_eq!(CBTModels::parse_hex_color("#1A73E8"), (0x1A, 0x73, 0xE8));
        assert_eq!(CBTModels::parse_hex_color("nope"), (142, 142, 147));
    }
}
