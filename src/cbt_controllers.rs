// Controller for the CTA bus tracker: startup, route tracking, auto-refresh,
// favorites, search, arrivals, geolocation and the terminal command loop.
use crate::cbt_api::CTAGateway;
use crate::cbt_config::DashboardSettings;
use crate::cbt_models::{CBTModels, LatLon, RawRoute, Result, Route, Stop, Vehicle};
use crate::cbt_prefs::{PreferenceStore, Settings};
use crate::cbt_views::{
    CBTViews, MapLayer, MapSurface, MarkerId, MarkerKind, MarkerSpec, Notifier, RouteListItem,
    RouteListSurface, Toast,
};
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, Stream, StreamExt};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{Instant, Interval, MissedTickBehavior};

// ============================================================================
// Geolocation
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum GeolocationError {
    #[error("geolocation is not supported")]
    Unsupported,
    #[error("position unavailable")]
    Unavailable,
    #[error("timed out")]
    Timeout,
}

impl GeolocationError {
    pub fn message(self) -> &'static str {
        match self {
            GeolocationError::Unsupported => "Geolocation not supported",
            GeolocationError::Timeout => "Location request timed out",
            GeolocationError::Unavailable => "Location access denied",
        }
    }
}

pub trait Geolocator {
    fn current_position(&self) -> BoxFuture<'_, std::result::Result<LatLon, GeolocationError>>;
}

/// Reports a position given on the command line, or no support at all. A
/// position outside valid latitude/longitude ranges is unavailable.
pub struct FixedGeolocator {
    position: Option<LatLon>,
}

impl FixedGeolocator {
    pub fn new(position: Option<LatLon>) -> Self {
        FixedGeolocator { position }
    }
}

impl Geolocator for FixedGeolocator {
    fn current_position(&self) -> BoxFuture<'_, std::result::Result<LatLon, GeolocationError>> {
        let position = match self.position {
            None => Err(GeolocationError::Unsupported),
            Some(p) if (-90.0..=90.0).contains(&p.lat) && (-180.0..=180.0).contains(&p.lon) => Ok(p),
            Some(_) => Err(GeolocationError::Unavailable),
        };
        Box::pin(async move { position })
    }
}

// ============================================================================
// Refresh timer
// ============================================================================

/// At most one recurring tick source. Restarting replaces the previous one.
pub struct RefreshTimer {
    interval: Option<Interval>,
}

impl RefreshTimer {
    pub fn new() -> Self {
        RefreshTimer { interval: None }
    }

    pub fn start(&mut self, period: Duration) {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        self.interval = Some(interval);
    }

    pub fn cancel(&mut self) {
        self.interval = None;
    }

    #[cfg(test)]
    pub fn is_running(&self) -> bool {
        self.interval.is_some()
    }

    /// Resolves on the next tick; never resolves while cancelled.
    pub async fn tick(&mut self) {
        match self.interval.as_mut() {
            Some(interval) => {
                interval.tick().await;
            }
            None => std::future::pending::<()>().await,
        }
    }
}

impl Default for RefreshTimer {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Route loading
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisplayState {
    Idle,
    Loading { route_id: String, previous: Option<String> },
    Displaying { route_id: String },
}

#[derive(Debug, Clone)]
pub struct RouteData {
    pub vehicles: Vec<Vehicle>,
    /// `None` when stops were not requested.
    pub stops: Option<Vec<Stop>>,
}

/// Result of a route fetch, tagged with the selection it was issued for.
#[derive(Debug)]
pub struct RouteLoad {
    ticket: u64,
    route_id: String,
    result: Result<RouteData>,
}

pub type PendingRouteLoad = BoxFuture<'static, RouteLoad>;

pub struct Surfaces {
    pub map: Box<dyn MapSurface>,
    pub route_list: Box<dyn RouteListSurface>,
    pub notifier: Box<dyn Notifier>,
}

// ============================================================================
// Commands
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Help,
    List,
    Search(String),
    Select(String),
    Favorite(String),
    Refresh,
    Stops(bool),
    Auto(bool),
    Predict(String),
    Alerts,
    Directions,
    Locate,
    Dark(bool),
    Layer(MapLayer),
    Panel { drag_px: f64, viewport_px: f64 },
    Quit,
}

impl Command {
    pub fn parse(line: &str) -> std::result::Result<Command, String> {
        let line = line.trim();
        let (verb, rest) = match line.split_once(char::is_whitespace) {
            Some((verb, rest)) => (verb, rest.trim()),
            None => (line, ""),
        };

        let required = |what: &str| -> std::result::Result<String, String> {
            if rest.is_empty() {
                Err(format!("Missing {} after '{}'", what, verb))
            } else {
                Ok(rest.to_string())
            }
        };

        let switch = || -> std::result::Result<bool, String> {
            match rest.to_lowercase().as_str() {
                "on" | "true" | "yes" => Ok(true),
                "off" | "false" | "no" => Ok(false),
                _ => Err(format!("Use '{} on' or '{} off'", verb, verb)),
            }
        };

        match verb.to_lowercase().as_str() {
            "" | "help" | "?" => Ok(Command::Help),
            "list" | "ls" => Ok(Command::List),
            "search" | "find" => Ok(Command::Search(rest.to_string())),
            "select" | "track" => required("route").map(Command::Select),
            "fav" | "favorite" => required("route").map(Command::Favorite),
            "refresh" => Ok(Command::Refresh),
            "stops" => switch().map(Command::Stops),
            "auto" => switch().map(Command::Auto),
            "predict" | "arrivals" => required("stop id").map(Command::Predict),
            "alerts" => Ok(Command::Alerts),
            "dirs" | "directions" => Ok(Command::Directions),
            "locate" => Ok(Command::Locate),
            "dark" => switch().map(Command::Dark),
            "layer" => MapLayer::from_name(rest).map(Command::Layer).ok_or_else(|| {
                let names: Vec<&str> = MapLayer::ALL.iter().map(|l| l.name()).collect();
                format!("Unknown layer '{}'. Try {}.", rest, names.join(", "))
            }),
            "panel" => {
                let numbers: Vec<f64> = rest.split_whitespace().filter_map(|n| n.parse().ok()).collect();
                match numbers.as_slice() {
                    [drag_px, viewport_px] if *viewport_px > 0.0 => Ok(Command::Panel {
                        drag_px: *drag_px,
                        viewport_px: *viewport_px,
                    }),
                    _ => Err("Usage: panel <drag px> <viewport px>".to_string()),
                }
            }
            "quit" | "exit" | "q" => Ok(Command::Quit),
            other => Err(format!("Unknown command '{}'. Type 'help' for options.", other)),
        }
    }
}

// ============================================================================
// Controller
// ============================================================================

pub struct CBTControllers {
    gateway: Arc<CTAGateway>,
    prefs: PreferenceStore,
    map: Box<dyn MapSurface>,
    route_list: Box<dyn RouteListSurface>,
    notifier: Box<dyn Notifier>,
    geolocator: Box<dyn Geolocator>,
    dashboard: DashboardSettings,

    routes: Vec<Route>,
    settings: Settings,
    search_filter: String,
    active_route: Option<String>,
    display_state: DisplayState,
    selection_ticket: u64,

    bus_markers: HashMap<String, Vec<(MarkerId, LatLon)>>,
    stop_markers: HashMap<String, Vec<MarkerId>>,
    known_stops: HashMap<String, Stop>,
    user_marker: Option<MarkerId>,
    panel_height: f64,

    refresh_timer: RefreshTimer,
}

impl CBTControllers {
    const DEFAULT_PANEL_HEIGHT: f64 = 300.0;

    pub fn new(
        gateway: Arc<CTAGateway>,
        prefs: PreferenceStore,
        surfaces: Surfaces,
        geolocator: Box<dyn Geolocator>,
        dashboard: DashboardSettings,
    ) -> Self {
        CBTControllers {
            gateway,
            prefs,
            map: surfaces.map,
            route_list: surfaces.route_list,
            notifier: surfaces.notifier,
            geolocator,
            dashboard,
            routes: Vec::new(),
            settings: Settings::default(),
            search_filter: String::new(),
            active_route: None,
            display_state: DisplayState::Idle,
            selection_ticket: 0,
            bus_markers: HashMap::new(),
            stop_markers: HashMap::new(),
            known_stops: HashMap::new(),
            user_marker: None,
            panel_height: Self::DEFAULT_PANEL_HEIGHT,
            refresh_timer: RefreshTimer::new(),
        }
    }

    fn notify(&mut self, toast: Toast) {
        self.notifier.show(toast);
    }

    // ------------------------------------------------------------------------
    // Startup
    // ------------------------------------------------------------------------

    pub async fn init(&mut self) {
        self.map.set_view(self.dashboard.default_center, self.dashboard.default_zoom);
        self.map.set_base_layer(self.settings.selected_layer);

        self.load_initial_data().await;

        if self.settings.auto_refresh {
            self.setup_auto_refresh();
        }

        self.notify(Toast::success("CTA Tracker Ready!"));
    }

    /// Routes and preferences load side by side; each failure is reported on
    /// its own and the route list is rendered once both are done.
    pub async fn load_initial_data(&mut self) {
        let gateway = Arc::clone(&self.gateway);
        let prefs = &self.prefs;
        let (routes, settings) = futures::join!(gateway.get_routes(), async { prefs.load_settings() });

        match routes {
            Ok(records) => self.apply_routes(records),
            Err(e) => {
                warn!("Initial route load failed: {}", e);
                self.notify(Toast::error("Failed to load routes"));
            }
        }

        match settings {
            Ok(settings) => self.apply_settings(settings),
            Err(e) => {
                warn!("Preferences unavailable: {}", e);
                self.notify(Toast::error("Failed to load preferences"));
            }
        }

        let filter = self.search_filter.clone();
        self.render_route_list(&filter);
    }

    fn apply_settings(&mut self, settings: Settings) {
        let dark_mode = settings.dark_mode;
        self.settings = settings;
        self.map.set_base_layer(self.settings.selected_layer);
        self.switch_layer_for_theme(dark_mode);
    }

    fn apply_routes(&mut self, records: Vec<RawRoute>) {
        let (routes, rejected) = CBTModels::build_routes(records);
        for error in &rejected {
            warn!("Skipping route: {}", error);
        }
        info!("Loaded {} routes", routes.len());
        self.routes = routes;
    }

    /// Fetches the route list again, keeping the current one on failure.
    pub async fn load_routes(&mut self) -> bool {
        match self.gateway.get_routes().await {
            Ok(records) => {
                self.apply_routes(records);
                let filter = self.search_filter.clone();
                self.render_route_list(&filter);
                true
            }
            Err(e) => {
                warn!("Route load failed: {}", e);
                self.notify(Toast::error("Failed to load routes"));
                false
            }
        }
    }

    // ------------------------------------------------------------------------
    // Route list
    // ------------------------------------------------------------------------

    pub fn render_route_list(&mut self, filter: &str) {
        self.search_filter = filter.to_string();
        let favorites = self.prefs.favorites();
        let active = self.active_route.as_deref();

        let items: Vec<RouteListItem> = CBTModels::filter_routes(&self.routes, filter)
            .into_iter()
            .map(|route| RouteListItem {
                id: route.id.clone(),
                name: route.name.clone(),
                directions: route.directions.label(),
                color: route.color,
                favorite: favorites.contains(&route.id),
                active: active == Some(route.id.as_str()),
            })
            .collect();

        self.route_list.render(&items);
    }

    pub fn search(&mut self, text: &str) {
        self.render_route_list(text);
    }

    pub fn toggle_favorite(&mut self, route_id: &str) {
        let route_id = self.canonical_route_id(route_id);
        match self.prefs.toggle_favorite(&route_id) {
            Ok(outcome) => {
                self.route_list.set_favorite(&route_id, outcome.is_favorite());
                self.notify(Toast::success(outcome.message()));
            }
            Err(e) => {
                warn!("Favorite for {} not saved: {}", route_id, e);
                self.notify(Toast::error("Could not update favorites"));
            }
        }
    }

    fn canonical_route_id(&self, input: &str) -> String {
        let input = input.trim();
        self.routes
            .iter()
            .find(|r| r.id.eq_ignore_ascii_case(input))
            .map(|r| r.id.clone())
            .unwrap_or_else(|| input.to_string())
    }

    // ------------------------------------------------------------------------
    // Route tracking
    // ------------------------------------------------------------------------

    /// Makes `route_id` the active route and starts fetching its data. The
    /// returned load must be handed back to `apply_route_load`.
    pub fn begin_route_selection(&mut self, route_id: &str) -> PendingRouteLoad {
        let route_id = self.canonical_route_id(route_id);
        info!("Selecting route {}", route_id);

        self.active_route = Some(route_id.clone());
        self.route_list.highlight(&route_id);
        self.begin_load(route_id)
    }

    pub async fn select_route(&mut self, route_id: &str) -> bool {
        let load = self.begin_route_selection(route_id).await;
        self.apply_route_load(load)
    }

    fn displayed_route(&self) -> Option<String> {
        match &self.display_state {
            DisplayState::Idle => None,
            DisplayState::Loading { previous, .. } => previous.clone(),
            DisplayState::Displaying { route_id } => Some(route_id.clone()),
        }
    }

    fn begin_load(&mut self, route_id: String) -> PendingRouteLoad {
        self.selection_ticket += 1;
        self.display_state = DisplayState::Loading {
            route_id: route_id.clone(),
            previous: self.displayed_route(),
        };

        let ticket = self.selection_ticket;
        let gateway = Arc::clone(&self.gateway);
        let show_stops = self.settings.show_stops;

        Box::pin(async move {
            let result = Self::fetch_route_data(&gateway, &route_id, show_stops).await;
            RouteLoad {
                ticket,
                route_id,
                result,
            }
        })
    }

    async fn fetch_route_data(gateway: &CTAGateway, route_id: &str, show_stops: bool) -> Result<RouteData> {
        let stops = async {
            if show_stops {
                gateway.get_stops(route_id, None).await.map(Some)
            } else {
                Ok(None)
            }
        };

        let (vehicles, stops) = futures::try_join!(gateway.get_vehicles(route_id), stops)?;
        Ok(RouteData { vehicles, stops })
    }

    /// Renders a finished load if it still belongs to the active selection.
    /// Returns whether anything was rendered.
    pub fn apply_route_load(&mut self, load: RouteLoad) -> bool {
        if load.ticket != self.selection_ticket || self.active_route.as_deref() != Some(load.route_id.as_str()) {
            debug!("Discarding superseded data for route {}", load.route_id);
            return false;
        }

        match load.result {
            Ok(data) => {
                self.render_bus_markers(&load.route_id, &data.vehicles);
                match data.stops {
                    Some(stops) => self.render_stop_markers(&load.route_id, stops),
                    None => self.clear_stop_markers(&load.route_id),
                }
                self.zoom_to_route(&load.route_id);
                self.display_state = DisplayState::Displaying {
                    route_id: load.route_id,
                };
                true
            }
            Err(e) => {
                warn!("Route {} data unavailable: {}", load.route_id, e);
                self.display_state = match self.displayed_route() {
                    Some(route_id) => DisplayState::Displaying { route_id },
                    None => DisplayState::Idle,
                };
                self.notify(Toast::error("Failed to load route data"));
                false
            }
        }
    }

    fn route_color(&self, route_id: &str) -> &'static str {
        self.routes
            .iter()
            .find(|r| r.id == route_id)
            .map(|r| r.color)
            .unwrap_or_else(|| Route::assign_color(route_id))
    }

    fn render_bus_markers(&mut self, route_id: &str, vehicles: &[Vehicle]) {
        self.clear_bus_markers(route_id);
        let color = self.route_color(route_id);

        let markers = vehicles
            .iter()
            .map(|vehicle| {
                let id = self.map.add_marker(MarkerSpec {
                    position: vehicle.position(),
                    kind: MarkerKind::Bus {
                        route_id: route_id.to_string(),
                        heading: vehicle.heading,
                    },
                    color,
                    popup: Some(CBTViews::bus_popup(vehicle)),
                });
                (id, vehicle.position())
            })
            .collect();

        debug!("Route {}: {} buses on the map", route_id, vehicles.len());
        self.bus_markers.insert(route_id.to_string(), markers);
    }

    fn render_stop_markers(&mut self, route_id: &str, stops: Vec<Stop>) {
        self.clear_stop_markers(route_id);
        let color = self.route_color(route_id);

        let mut markers = Vec::with_capacity(stops.len());
        for stop in stops {
            let id = self.map.add_marker(MarkerSpec {
                position: stop.position(),
                kind: MarkerKind::Stop {
                    route_id: route_id.to_string(),
                    stop_id: stop.stop_id.clone(),
                },
                color,
                popup: Some(stop.name.clone()),
            });
            markers.push(id);
            self.known_stops.insert(stop.stop_id.clone(), stop);
        }

        self.stop_markers.insert(route_id.to_string(), markers);
    }

    fn clear_bus_markers(&mut self, route_id: &str) {
        if let Some(markers) = self.bus_markers.remove(route_id) {
            for (id, _) in markers {
                self.map.remove_marker(id);
            }
        }
    }

    fn clear_stop_markers(&mut self, route_id: &str) {
        if let Some(markers) = self.stop_markers.remove(route_id) {
            for id in markers {
                self.map.remove_marker(id);
            }
        }
    }

    fn zoom_to_route(&mut self, route_id: &str) {
        let positions: Vec<LatLon> = self
            .bus_markers
            .get(route_id)
            .map(|markers| markers.iter().map(|(_, position)| *position).collect())
            .unwrap_or_default();

        if let Some(bounds) = CBTViews::bounds_of(&positions) {
            self.map.fit_bounds(bounds, self.dashboard.fit_padding_px);
        }
    }

    // ------------------------------------------------------------------------
    // Refresh
    // ------------------------------------------------------------------------

    pub fn setup_auto_refresh(&mut self) {
        self.refresh_timer.start(self.dashboard.refresh_interval);
        debug!("Auto-refresh every {:?}", self.dashboard.refresh_interval);
    }

    /// Re-fetches the active route on a timer tick; nothing to do without one.
    pub fn on_refresh_tick(&mut self) -> Option<PendingRouteLoad> {
        let route_id = self.active_route.clone()?;
        debug!("Refreshing route {}", route_id);
        Some(self.begin_load(route_id))
    }

    pub fn set_auto_refresh(&mut self, enabled: bool) {
        self.settings.auto_refresh = enabled;
        if let Err(e) = self.prefs.set_auto_refresh(enabled) {
            warn!("Auto-refresh preference not saved: {}", e);
        }

        if enabled {
            self.setup_auto_refresh();
            self.notify(Toast::info("Auto-refresh on"));
        } else {
            self.refresh_timer.cancel();
            self.notify(Toast::info("Auto-refresh off"));
        }
    }

    pub async fn manual_refresh(&mut self) {
        self.gateway.clear_cache();
        if self.load_routes().await {
            self.notify(Toast::success("Data refreshed"));
        }
    }

    pub fn set_show_stops(&mut self, enabled: bool) -> Option<PendingRouteLoad> {
        self.settings.show_stops = enabled;
        if let Err(e) = self.prefs.set_show_stops(enabled) {
            warn!("Show-stops preference not saved: {}", e);
        }

        if !enabled {
            let routes: Vec<String> = self.stop_markers.keys().cloned().collect();
            for route_id in routes {
                self.clear_stop_markers(&route_id);
            }
        }

        let route_id = self.active_route.clone()?;
        Some(self.begin_load(route_id))
    }

    // ------------------------------------------------------------------------
    // Arrivals, bulletins, directions
    // ------------------------------------------------------------------------

    pub async fn display_predictions(&mut self, stop_id: &str) {
        let stop_id = stop_id.trim();
        match self.gateway.get_predictions(stop_id, None).await {
            Ok(predictions) => {
                let (position, name) = match self.known_stops.get(stop_id) {
                    Some(stop) => (stop.position(), stop.name.clone()),
                    None => (
                        self.dashboard.default_center,
                        predictions
                            .iter()
                            .find_map(|p| p.stop_name.clone())
                            .unwrap_or_else(|| format!("stop {}", stop_id)),
                    ),
                };
                self.map.open_popup(position, CBTViews::predictions_popup(&name, &predictions));
            }
            Err(e) => {
                warn!("Predictions for stop {} unavailable: {}", stop_id, e);
                self.notify(Toast::error("Failed to load predictions"));
            }
        }
    }

    pub async fn show_bulletins(&mut self) {
        let Some(route_id) = self.active_route.clone() else {
            self.notify(Toast::info("Select a route first"));
            return;
        };

        match self.gateway.get_service_bulletins(&[route_id.clone()], &[]).await {
            Ok(bulletins) if bulletins.is_empty() => {
                self.notify(Toast::info(format!("No service alerts for route {}", route_id)));
            }
            Ok(bulletins) => {
                for bulletin in &bulletins {
                    self.notify(Toast::info(CBTViews::bulletin_line(bulletin)));
                }
            }
            Err(e) => {
                warn!("Bulletins for {} unavailable: {}", route_id, e);
                self.notify(Toast::error("Failed to load service alerts"));
            }
        }
    }

    pub async fn show_directions(&mut self) {
        let Some(route_id) = self.active_route.clone() else {
            self.notify(Toast::info("Select a route first"));
            return;
        };

        match self.gateway.get_directions(&route_id).await {
            Ok(directions) => {
                self.notify(Toast::info(CBTViews::directions_line(&route_id, &directions)));
            }
            Err(e) => {
                warn!("Directions for {} unavailable: {}", route_id, e);
                self.notify(Toast::error("Failed to load directions"));
            }
        }
    }

    // ------------------------------------------------------------------------
    // Geolocation
    // ------------------------------------------------------------------------

    pub async fn locate_user(&mut self) {
        self.notify(Toast::info("Locating...").with_duration(self.dashboard.geolocation_timeout));

        let outcome = tokio::time::timeout(self.dashboard.geolocation_timeout, self.geolocator.current_position())
            .await
            .unwrap_or(Err(GeolocationError::Timeout));

        match outcome {
            Ok(position) => {
                self.map.set_view(position, self.dashboard.location_zoom);
                if let Some(previous) = self.user_marker.take() {
                    self.map.remove_marker(previous);
                }
                self.user_marker = Some(self.map.add_marker(MarkerSpec {
                    position,
                    kind: MarkerKind::User,
                    color: Route::FALLBACK_COLOR,
                    popup: None,
                }));
                self.notify(Toast::success("Location found"));
            }
            Err(e) => {
                debug!("Geolocation failed: {}", e);
                self.notify(Toast::error(e.message()));
            }
        }
    }

    // ------------------------------------------------------------------------
    // Appearance
    // ------------------------------------------------------------------------

    pub fn toggle_dark_mode(&mut self, enable: bool) {
        if let Err(e) = self.prefs.set_dark_mode(enable) {
            warn!("Dark mode preference not saved: {}", e);
        }
        self.switch_layer_for_theme(enable);
    }

    fn switch_layer_for_theme(&mut self, enable: bool) {
        self.settings.dark_mode = enable;
        if enable && self.settings.selected_layer != MapLayer::Dark {
            self.settings.selected_layer = MapLayer::Dark;
            self.map.set_base_layer(MapLayer::Dark);
        } else if !enable && self.settings.selected_layer == MapLayer::Dark {
            self.settings.selected_layer = MapLayer::Standard;
            self.map.set_base_layer(MapLayer::Standard);
        }
    }

    pub fn select_layer(&mut self, layer: MapLayer) {
        self.settings.selected_layer = layer;
        self.map.set_base_layer(layer);
        if let Err(e) = self.prefs.set_map_layer(layer) {
            warn!("Map layer preference not saved: {}", e);
        }
    }

    pub fn resize_panel(&mut self, drag_px: f64, viewport_px: f64) -> f64 {
        self.panel_height = CBTViews::clamp_panel_height(self.panel_height, drag_px, viewport_px);
        self.panel_height
    }

    /// Stops the timer and takes every marker off the map.
    pub fn destroy(&mut self) {
        self.refresh_timer.cancel();

        let buses: Vec<String> = self.bus_markers.keys().cloned().collect();
        for route_id in buses {
            self.clear_bus_markers(&route_id);
        }
        let stops: Vec<String> = self.stop_markers.keys().cloned().collect();
        for route_id in stops {
            self.clear_stop_markers(&route_id);
        }
        if let Some(marker) = self.user_marker.take() {
            self.map.remove_marker(marker);
        }

        self.active_route = None;
        self.display_state = DisplayState::Idle;
    }

    // ------------------------------------------------------------------------
    // Command loop
    // ------------------------------------------------------------------------

    /// Runs commands from `input` until it ends or `quit` arrives, while the
    /// refresh timer and outstanding route loads progress alongside.
    pub async fn run<S>(&mut self, mut input: S, initial_route: Option<String>)
    where
        S: Stream<Item = String> + Unpin,
    {
        let mut pending: FuturesUnordered<PendingRouteLoad> = FuturesUnordered::new();
        if let Some(route_id) = initial_route {
            pending.push(self.begin_route_selection(&route_id));
        }

        loop {
            tokio::select! {
                line = input.next() => {
                    let Some(line) = line else { break };
                    match Command::parse(&line) {
                        Ok(Command::Quit) => break,
                        Ok(command) => {
                            if let Some(load) = self.execute(command).await {
                                pending.push(load);
                            }
                        }
                        Err(message) => self.notify(Toast::error(message)),
                    }
                }
                _ = self.refresh_timer.tick() => {
                    if let Some(load) = self.on_refresh_tick() {
                        pending.push(load);
                    }
                }
                Some(load) = pending.next(), if !pending.is_empty() => {
                    self.apply_route_load(load);
                }
            }
        }

        self.destroy();
    }

    pub async fn execute(&mut self, command: Command) -> Option<PendingRouteLoad> {
        match command {
            Command::Help => CBTViews::show_help(),
            Command::List => self.render_route_list(""),
            Command::Search(text) => self.search(&text),
            Command::Select(route_id) => return Some(self.begin_route_selection(&route_id)),
            Command::Favorite(route_id) => self.toggle_favorite(&route_id),
            Command::Refresh => self.manual_refresh().await,
            Command::Stops(enabled) => return self.set_show_stops(enabled),
            Command::Auto(enabled) => self.set_auto_refresh(enabled),
            Command::Predict(stop_id) => self.display_predictions(&stop_id).await,
            Command::Alerts => self.show_bulletins().await,
            Command::Directions => self.show_directions().await,
            Command::Locate => self.locate_user().await,
            Command::Dark(enabled) => self.toggle_dark_mode(enabled),
            Command::Layer(layer) => self.select_layer(layer),
            Command::Panel { drag_px, viewport_px } => {
                let height = self.resize_panel(drag_px, viewport_px);
                println!("  Panel height: {:.0}px", height);
            }
            Command::Quit => {}
        }
        None
    }
}

#[cfg(test)]
impl CBTControllers {
    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn active_route(&self) -> Option<&str> {
        self.active_route.as_deref()
    }

    pub fn display_state(&self) -> &DisplayState {
        &self.display_state
    }

    pub fn is_auto_refreshing(&self) -> bool {
        self.refresh_timer.is_running()
    }

    pub fn visible_routes(&self) -> Vec<&Route> {
        CBTModels::filter_routes(&self.routes, &self.search_filter)
    }

    pub fn bus_marker_count(&self, route_id: &str) -> usize {
        self.bus_markers.get(route_id).map_or(0, Vec::len)
    }

    pub fn stop_marker_count(&self, route_id: &str) -> usize {
        self.stop_markers.get(route_id).map_or(0, Vec::len)
    }
}
