// Local preference store: favorites and display settings, kept in a flat
// key-value file so they survive restarts.

use crate::cbt_models::{CBTError, Result};
use crate::cbt_views::MapLayer;
use log::{debug, warn};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

// ============================================================================
// Key-value backends
// ============================================================================

pub trait KeyValueStore: Send {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
}

/// JSON object on disk, rewritten in full on every `set`.
pub struct FileStore {
    path: PathBuf,
    entries: Mutex<HashMap<String, String>>,
}

impl FileStore {
    pub fn default_path() -> PathBuf {
        let mut path = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
        path.push("cta_bus_tracker");
        path.push("preferences.json");
        path
    }

    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        let entries = if path.exists() {
            let contents = fs::read_to_string(&path)
                .map_err(|e| CBTError::Storage(format!("Failed to read {:?}: {}", path, e)))?;
            match serde_json::from_str::<HashMap<String, String>>(&contents) {
                Ok(entries) => {
                    debug!("Loaded {} preferences from {:?}", entries.len(), path);
                    entries
                }
                Err(e) => {
                    warn!("Preferences file {:?} is corrupt ({}), starting fresh", path, e);
                    HashMap::new()
                }
            }
        } else {
            debug!("No preferences file at {:?}", path);
            HashMap::new()
        };

        Ok(FileStore {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, entries: &HashMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| CBTError::Storage(format!("Failed to create {:?}: {}", parent, e)))?;
        }

        let json = serde_json::to_string_pretty(entries)
            .map_err(|e| CBTError::Storage(format!("Failed to serialize preferences: {}", e)))?;

        fs::write(&self.path, json)
            .map_err(|e| CBTError::Storage(format!("Failed to write {:?}: {}", self.path, e)))
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        entries.insert(key.to_string(), value.to_string());
        self.persist(&entries)
    }
}

/// Volatile store for tests.
#[cfg(test)]
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

#[cfg(test)]
impl MemoryStore {
    pub fn with_entries<'a>(entries: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        MemoryStore {
            entries: Mutex::new(
                entries
                    .into_iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
        }
    }
}

#[cfg(test)]
impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.lock().unwrap_or_else(|p| p.into_inner()).get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entries
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}

// ============================================================================
// Preferences
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FavoriteToggle {
    Added,
    Removed,
}

impl FavoriteToggle {
    pub fn is_favorite(self) -> bool {
        self == FavoriteToggle::Added
    }

    pub fn message(self) -> &'static str {
        match self {
            FavoriteToggle::Added => "Added to favorites",
            FavoriteToggle::Removed => "Removed from favorites",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub auto_refresh: bool,
    pub show_stops: bool,
    pub dark_mode: bool,
    pub selected_layer: MapLayer,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            auto_refresh: true,
            show_stops: false,
            dark_mode: false,
            selected_layer: MapLayer::Standard,
        }
    }
}

pub struct PreferenceStore {
    store: Box<dyn KeyValueStore>,
}

impl PreferenceStore {
    pub const FAVORITES_KEY: &'static str = "cta-favorites";
    pub const DARK_MODE_KEY: &'static str = "darkMode";
    pub const MAP_LAYER_KEY: &'static str = "mapLayer";
    pub const SHOW_STOPS_KEY: &'static str = "showStops";
    pub const AUTO_REFRESH_KEY: &'static str = "autoRefresh";

    pub fn new(store: Box<dyn KeyValueStore>) -> Self {
        PreferenceStore { store }
    }

    /// Read from storage on every call; nothing is cached in memory.
    pub fn favorites(&self) -> Vec<String> {
        let raw = match self.store.get(Self::FAVORITES_KEY) {
            Ok(Some(raw)) => raw,
            Ok(None) => return Vec::new(),
            Err(e) => {
                warn!("Could not read favorites: {}", e);
                return Vec::new();
            }
        };

        let mut favorites: Vec<String> = serde_json::from_str(&raw).unwrap_or_else(|e| {
            warn!("Ignoring unreadable favorites ({})", e);
            Vec::new()
        });

        let mut seen = std::collections::HashSet::new();
        favorites.retain(|id| seen.insert(id.clone()));
        favorites
    }

    #[cfg(test)]
    pub fn is_favorite(&self, route_id: &str) -> bool {
        self.favorites().iter().any(|id| id == route_id)
    }

    pub fn toggle_favorite(&self, route_id: &str) -> Result<FavoriteToggle> {
        let mut favorites = self.favorites();

        let outcome = match favorites.iter().position(|id| id == route_id) {
            Some(index) => {
                favorites.remove(index);
                FavoriteToggle::Removed
            }
            None => {
                favorites.push(route_id.to_string());
                FavoriteToggle::Added
            }
        };

        let json = serde_json::to_string(&favorites)
            .map_err(|e| CBTError::Storage(format!("Failed to encode favorites: {}", e)))?;
        self.store.set(Self::FAVORITES_KEY, &json)?;

        Ok(outcome)
    }

    pub fn load_settings(&self) -> Result<Settings> {
        let defaults = Settings::default();

        let flag = |key: &str, default: bool| -> Result<bool> {
            Ok(self.store.get(key)?.map(|v| v == "true").unwrap_or(default))
        };

        let selected_layer = match self.store.get(Self::MAP_LAYER_KEY)? {
            Some(name) => MapLayer::from_name(&name).unwrap_or_else(|| {
                warn!("Unknown map layer '{}', using {}", name, defaults.selected_layer.name());
                defaults.selected_layer
            }),
            None => defaults.selected_layer,
        };

        Ok(Settings {
            auto_refresh: flag(Self::AUTO_REFRESH_KEY, defaults.auto_refresh)?,
            show_stops: flag(Self::SHOW_STOPS_KEY, defaults.show_stops)?,
            dark_mode: flag(Self::DARK_MODE_KEY, defaults.dark_mode)?,
            selected_layer,
        })
    }

    pub fn set_dark_mode(&self, enabled: bool) -> Result<()> {
        self.store.set(Self::DARK_MODE_KEY, &enabled.to_string())
    }

    pub fn set_map_layer(&self, layer: MapLayer) -> Result<()> {
        self.store.set(Self::MAP_LAYER_KEY, layer.name())
    }

    pub fn set_show_stops(&self, enabled: bool) -> Result<()> {
        self.store.set(Self::SHOW_STOPS_KEY, &enabled.to_string())
    }

    pub fn set_auto_refresh(&self, enabled: bool) -> Result<()> {
        self.store.set(Self::AUTO_REFRESH_KEY, &enabled.to_string())
    }
}
