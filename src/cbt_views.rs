// Views for the CTA bus tracker: notification surface, map surface, route list
// surface, and the terminal renderings of each.
use crate::cbt_models::{Bulletin, CBTModels, Countdown, Direction, LatLon, Prediction, Route, Vehicle};
use geo::BoundingRect;
use geo_types::{MultiPoint, Rect};
use log::debug;
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

// ============================================================================
// Notifications
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Success,
    Error,
    Info,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Toast {
    pub message: String,
    pub severity: Severity,
    pub duration: Option<Duration>,
}

impl Toast {
    pub fn new(message: impl Into<String>, severity: Severity) -> Self {
        Toast {
            message: message.into(),
            severity,
            duration: None,
        }
    }

    pub fn success(message: impl Into<String>) -> Self {
        Self::new(message, Severity::Success)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(message, Severity::Error)
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new(message, Severity::Info)
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }
}

/// Fire-and-forget user feedback.
pub trait Notifier {
    fn show(&mut self, toast: Toast);
}

pub struct ConsoleNotifier;

impl Notifier for ConsoleNotifier {
    fn show(&mut self, toast: Toast) {
        let icon = match toast.severity {
            Severity::Success => "✓",
            Severity::Error => "✗",
            Severity::Info => "ℹ️ ",
        };
        match toast.severity {
            Severity::Error => eprintln!("{} {}", icon, toast.message),
            _ => println!("{} {}", icon, toast.message),
        }
    }
}

// ============================================================================
// Map
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MapLayer {
    Standard,
    Satellite,
    Dark,
}

impl MapLayer {
    pub const ALL: [MapLayer; 3] = [MapLayer::Standard, MapLayer::Satellite, MapLayer::Dark];

    pub fn name(self) -> &'static str {
        match self {
            MapLayer::Standard => "standard",
            MapLayer::Satellite => "satellite",
            MapLayer::Dark => "dark",
        }
    }

    /// Accepts the stored name or the layer-control label ("Dark Mode").
    pub fn from_name(name: &str) -> Option<MapLayer> {
        match name.trim().to_lowercase().as_str() {
            "standard" => Some(MapLayer::Standard),
            "satellite" => Some(MapLayer::Satellite),
            "dark" | "dark mode" => Some(MapLayer::Dark),
            _ => None,
        }
    }

    pub fn tile_url(self) -> &'static str {
        match self {
            MapLayer::Standard => "https://{s}.tile.openstreetmap.org/{z}/{x}/{y}.png",
            MapLayer::Satellite => {
                "https://server.arcgisonline.com/ArcGIS/rest/services/World_Imagery/MapServer/tile/{z}/{y}/{x}"
            }
            MapLayer::Dark => "https://{s}.basemaps.cartocdn.com/dark_all/{z}/{x}/{y}.png",
        }
    }

    pub fn attribution(self) -> &'static str {
        match self {
            MapLayer::Standard => "© OpenStreetMap",
            MapLayer::Satellite => "© Esri",
            MapLayer::Dark => "© CartoDB",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MarkerId(Uuid);

impl MarkerId {
    pub fn new() -> Self {
        MarkerId(Uuid::new_v4())
    }
}

impl Default for MarkerId {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MarkerKind {
    Bus { route_id: String, heading: Option<f64> },
    Stop { route_id: String, stop_id: String },
    User,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MarkerSpec {
    pub position: LatLon,
    pub kind: MarkerKind,
    pub color: &'static str,
    pub popup: Option<String>,
}

/// Map widget primitives. The controller is the only caller.
pub trait MapSurface {
    fn set_view(&mut self, center: LatLon, zoom: u8);
    fn add_marker(&mut self, marker: MarkerSpec) -> MarkerId;
    fn remove_marker(&mut self, id: MarkerId);
    fn fit_bounds(&mut self, bounds: Rect<f64>, padding_px: u32);
    fn set_base_layer(&mut self, layer: MapLayer);
    fn open_popup(&mut self, position: LatLon, content: String);
}

/// Prints map changes to stdout and keeps the live marker set.
#[derive(Default)]
pub struct TerminalMap {
    markers: HashMap<MarkerId, MarkerSpec>,
    layer: Option<MapLayer>,
}

impl MapSurface for TerminalMap {
    fn set_view(&mut self, center: LatLon, zoom: u8) {
        println!("🗺️  View centered on ({:.5}, {:.5}) at zoom {}", center.lat, center.lon, zoom);
    }

    fn add_marker(&mut self, marker: MarkerSpec) -> MarkerId {
        let id = MarkerId::new();
        match &marker.kind {
            MarkerKind::Bus { route_id, heading } => println!(
                "  🚌 {} at ({:.5}, {:.5}) heading {}",
                CBTViews::colorize_route(route_id, marker.color),
                marker.position.lat,
                marker.position.lon,
                heading.map(|h| format!("{:.0}°", h)).unwrap_or_else(|| "?".to_string())
            ),
            MarkerKind::Stop { stop_id, .. } => debug!("Stop marker {} placed", stop_id),
            MarkerKind::User => println!(
                "  📍 You are here ({:.5}, {:.5})",
                marker.position.lat, marker.position.lon
            ),
        }
        self.markers.insert(id, marker);
        id
    }

    fn remove_marker(&mut self, id: MarkerId) {
        self.markers.remove(&id);
    }

    fn fit_bounds(&mut self, bounds: Rect<f64>, padding_px: u32) {
        println!(
            "🗺️  Fitting view to ({:.4}, {:.4}) – ({:.4}, {:.4}), padding {}px",
            bounds.min().y,
            bounds.min().x,
            bounds.max().y,
            bounds.max().x,
            padding_px
        );
    }

    fn set_base_layer(&mut self, layer: MapLayer) {
        if self.layer != Some(layer) {
            println!("🗺️  Base layer: {} ({})", layer.name(), layer.attribution());
            debug!("Tiles from {}", layer.tile_url());
            self.layer = Some(layer);
        }
    }

    fn open_popup(&mut self, _position: LatLon, content: String) {
        println!("\n{}", "─".repeat(60));
        println!("{}", content);
        println!("{}", "─".repeat(60));
    }
}

// ============================================================================
// Route list
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteListItem {
    pub id: String,
    pub name: String,
    pub directions: String,
    pub color: &'static str,
    pub favorite: bool,
    pub active: bool,
}

pub trait RouteListSurface {
    fn render(&mut self, items: &[RouteListItem]);
    /// Updates a single item's favorite marker without re-rendering the list.
    fn set_favorite(&mut self, route_id: &str, favorite: bool);
    fn highlight(&mut self, route_id: &str);
}

pub struct TerminalRouteList;

impl RouteListSurface for TerminalRouteList {
    fn render(&mut self, items: &[RouteListItem]) {
        println!("\n{}", "═".repeat(60));
        println!("🚌 ROUTES ({})", items.len());
        println!("{}", "═".repeat(60));
        if items.is_empty() {
            println!("  No routes match");
        }
        for item in items {
            println!("{}", CBTViews::route_list_line(item));
        }
        println!("{}", "─".repeat(60));
    }

    fn set_favorite(&mut self, route_id: &str, favorite: bool) {
        println!("  {} Route {}", if favorite { "★" } else { "☆" }, route_id);
    }

    fn highlight(&mut self, route_id: &str) {
        println!("\n➜ Tracking route {}", route_id);
    }
}

// ============================================================================
// Formatting
// ============================================================================

pub struct CBTViews;

impl CBTViews {
    pub const PANEL_MIN_HEIGHT: f64 = 150.0;
    pub const PANEL_MAX_FRACTION: f64 = 0.8;

    pub fn colorize_route(code: &str, hex_color: &str) -> String {
        let (r, g, b) = CBTModels::parse_hex_color(hex_color);
        let luminance = (0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32) / 255.0;
        let text_color = if luminance > 0.5 { "30" } else { "97" };

        format!("\x1b[48;2;{};{};{}m\x1b[{}m {} \x1b[0m", r, g, b, text_color, code)
    }

    pub fn route_list_line(item: &RouteListItem) -> String {
        let mut line = format!(
            "{} {} {}",
            if item.active { "➜" } else { " " },
            Self::colorize_route(&item.id, item.color),
            item.name
        );
        if !item.directions.is_empty() {
            line.push_str(&format!("  ({})", item.directions));
        }
        if item.favorite {
            line.push_str("  ★");
        }
        line
    }

    pub fn bus_popup(vehicle: &Vehicle) -> String {
        let speed = vehicle
            .speed
            .map(|s| format!("{:.0} mph", s))
            .unwrap_or_else(|| "unknown".to_string());

        format!(
            "Route {}\nDestination: {}\nSpeed: {}\nUpdated: {}",
            vehicle.route_id,
            vehicle.destination,
            speed,
            CBTModels::format_timestamp(vehicle.last_update)
        )
    }

    pub fn prediction_row(prediction: &Prediction) -> String {
        let countdown = match &prediction.countdown {
            Countdown::Due => prediction.countdown.label().to_string(),
            Countdown::Minutes(_) => format!("{} min", prediction.countdown.label()),
        };
        format!(
            "{} To {}  {}",
            Self::colorize_route(&prediction.route_id, Route::assign_color(&prediction.route_id)),
            prediction.destination,
            countdown
        )
    }

    pub fn predictions_popup(stop_name: &str, predictions: &[Prediction]) -> String {
        let mut lines = vec![format!("🕐 Arrivals at {}", stop_name)];
        if predictions.is_empty() {
            lines.push("  No upcoming arrivals".to_string());
        }
        lines.extend(predictions.iter().map(|p| format!("  {}", Self::prediction_row(p))));
        lines.join("\n")
    }

    pub fn bulletin_line(bulletin: &Bulletin) -> String {
        match &bulletin.priority {
            Some(priority) if !priority.is_empty() => format!("⚠️  [{}] {}", priority, bulletin.summary()),
            _ => format!("⚠️  {}", bulletin.summary()),
        }
    }

    pub fn directions_line(route_id: &str, directions: &[Direction]) -> String {
        let names: Vec<&str> = directions.iter().map(|d| d.name.as_str()).collect();
        format!("Route {} runs {}", route_id, names.join(" / "))
    }

    /// Bounding box of the given positions, `None` when there are none.
    pub fn bounds_of(positions: &[LatLon]) -> Option<Rect<f64>> {
        let points: MultiPoint<f64> = positions.iter().map(|p| geo_types::Point::from(p.to_coord())).collect();
        points.bounding_rect()
    }

    /// Height of the route panel after dragging its handle `drag_up_px` upwards
    /// (negative drags it down).
    pub fn clamp_panel_height(start_height: f64, drag_up_px: f64, viewport_height: f64) -> f64 {
        let requested = start_height + drag_up_px;
        let max_height = viewport_height * Self::PANEL_MAX_FRACTION;

        if requested > max_height {
            max_height
        } else if requested < Self::PANEL_MIN_HEIGHT {
            Self::PANEL_MIN_HEIGHT
        } else {
            requested
        }
    }

    pub fn show_help() {
        println!("\n{}", "═".repeat(60));
        println!("     🚌 CTA BUS TRACKER");
        println!("{}", "═".repeat(60));
        println!("  list                 show routes");
        println!("  search <text>        filter routes by number or name");
        println!("  select <route>       track a route's buses");
        println!("  fav <route>          add or remove a favorite");
        println!("  refresh              clear cached data and reload routes");
        println!("  stops on|off         show stops for the tracked route");
        println!("  auto on|off          auto-refresh the tracked route");
        println!("  predict <stop>       arrivals at a stop");
        println!("  alerts               service bulletins for the tracked route");
        println!("  dirs                 directions of the tracked route");
        println!("  locate               center the map on your position");
        println!("  dark on|off          dark mode");
        println!("  layer <name>         standard, satellite or dark");
        println!("  panel <px> <viewport> drag the route panel up (negative: down)");
        println!("  quit                 exit");
        println!("{}", "─".repeat(60));
    }

    pub fn show_fallback(error: &str) {
        eprintln!("\n{}", "═".repeat(70));
        eprintln!("⚠️  Application Error");
        eprintln!("{}", "═".repeat(70));
        eprintln!("\n{}", error);
        eprintln!("\n💡 Restart the tracker to reload.");
        eprintln!("{}", "═".repeat(70));
    }
}
