// Command-line and environment configuration for the CTA bus tracker
use crate::cbt_models::{CBTError, LatLon, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Parser)]
#[command(name = "cbt", version, about = "Live CTA bus positions and arrivals in your terminal")]
pub struct CBTConfig {
    /// CTA Bus Tracker API key
    #[arg(long, env = "CTA_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    #[arg(long, env = "CTA_BASE_URL", default_value = "https://www.ctabustracker.com/bustime/api/v2")]
    pub base_url: String,

    /// Seconds between automatic refreshes of the tracked route
    #[arg(long, default_value_t = 30)]
    pub refresh_interval: u64,

    /// HTTP request timeout in seconds
    #[arg(long, default_value_t = 15)]
    pub request_timeout: u64,

    /// Seconds to wait for a position fix
    #[arg(long, default_value_t = 10)]
    pub geolocation_timeout: u64,

    /// Preferences file (defaults to the user config directory)
    #[arg(long, env = "CTA_PREFS_PATH")]
    pub prefs_path: Option<PathBuf>,

    /// Your latitude, used by `locate`
    #[arg(long, requires = "lon", allow_hyphen_values = true)]
    pub lat: Option<f64>,

    /// Your longitude, used by `locate`
    #[arg(long, requires = "lat", allow_hyphen_values = true)]
    pub lon: Option<f64>,

    /// Route to start tracking right away
    #[arg(long)]
    pub route: Option<String>,
}

/// Values the controller needs at runtime, resolved from `CBTConfig`.
#[derive(Debug, Clone, PartialEq)]
pub struct DashboardSettings {
    pub default_center: LatLon,
    pub default_zoom: u8,
    pub location_zoom: u8,
    pub fit_padding_px: u32,
    pub refresh_interval: Duration,
    pub geolocation_timeout: Duration,
}

impl Default for DashboardSettings {
    fn default() -> Self {
        DashboardSettings {
            default_center: LatLon::new(41.8781, -87.6298),
            default_zoom: 13,
            location_zoom: 15,
            fit_padding_px: 50,
            refresh_interval: Duration::from_secs(30),
            geolocation_timeout: Duration::from_secs(10),
        }
    }
}

impl CBTConfig {
    pub fn api_key(&self) -> Result<&str> {
        self.api_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .ok_or_else(|| CBTError::Config("No API key. Set CTA_API_KEY or pass --api-key.".to_string()))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout.max(1))
    }

    pub fn position(&self) -> Option<LatLon> {
        match (self.lat, self.lon) {
            (Some(lat), Some(lon)) => Some(LatLon::new(lat, lon)),
            _ => None,
        }
    }

    pub fn dashboard(&self) -> Result<DashboardSettings> {
        if self.refresh_interval == 0 {
            return Err(CBTError::Config("--refresh-interval must be at least 1 second".to_string()));
        }

        Ok(DashboardSettings {
            refresh_interval: Duration::from_secs(self.refresh_interval),
            geolocation_timeout: Duration::from_secs(self.geolocation_timeout.max(1)),
            ..DashboardSettings::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> CBTConfig {
        CBTConfig::try_parse_from(std::iter::once("cbt").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn defaults_match_the_dashboard() {
        let config = parse(&["--api-key", "abc"]);
        let dashboard = config.dashboard().unwrap();

        assert_eq!(config.api_key().unwrap(), "abc");
        assert_eq!(dashboard.refresh_interval, Duration::from_secs(30));
        assert_eq!(dashboard.default_zoom, 13);
        assert_eq!(config.request_timeout(), Duration::from_secs(15));
        assert!(config.position().is_none());
    }

    #[test]
    fn blank_api_key_is_a_config_error() {
        let config = parse(&["--api-key", "  "]);
        assert!(matches!(config.api_key(), Err(CBTError::Config(_))));
    }

    #[test]
    fn zero_refresh_interval_is_rejected() {
        let config = parse(&["--api-key", "abc", "--refresh-interval", "0"]);
        assert!(config.dashboard().is_err());
    }

    #[test]
    fn coordinates_must_come_in_pairs() {
        assert!(CBTConfig::try_parse_from(["cbt", "--lat", "41.9"]).is_err());

        let config = parse(&["--lat", "41.9", "--lon", "-87.6"]);
        assert_eq!(config.position(), Some(LatLon::new(41.9, -87.6)));
    }
}
