//! Persisted user preferences.
//!
//! Kept apart from the query cache: preferences are loaded when a session
//! starts and saved when they change, and cache eviction never sees them.

use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::path::Path;
use tracing::{debug, warn};

use super::Database;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
  #[default]
  Light,
  Dark,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChartType {
  #[default]
  Area,
  Line,
  Bar,
}

/// Time window for progress views.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProgressRange {
  #[serde(rename = "7d")]
  Week,
  #[default]
  #[serde(rename = "30d")]
  Month,
  #[serde(rename = "90d")]
  Quarter,
  #[serde(rename = "1y")]
  Year,
}

impl ProgressRange {
  pub fn as_str(&self) -> &'static str {
    match self {
      ProgressRange::Week => "7d",
      ProgressRange::Month => "30d",
      ProgressRange::Quarter => "90d",
      ProgressRange::Year => "1y",
    }
  }
}

impl fmt::Display for ProgressRange {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preferences {
  pub theme: Theme,
  pub sound_enabled: bool,
  pub notifications_enabled: bool,
  pub progress_time_range: ProgressRange,
  pub progress_chart_type: ChartType,
}

impl Default for Preferences {
  fn default() -> Self {
    Self {
      theme: Theme::Light,
      sound_enabled: true,
      notifications_enabled: true,
      progress_time_range: ProgressRange::Month,
      progress_chart_type: ChartType::Area,
    }
  }
}

impl Preferences {
  fn to_map(&self) -> Result<Map<String, Value>> {
    match serde_json::to_value(self) {
      Ok(Value::Object(map)) => Ok(map),
      Ok(_) => Err(eyre!("Preferences did not serialize to an object")),
      Err(e) => Err(eyre!("Failed to serialize preferences: {}", e)),
    }
  }

  fn from_map(map: Map<String, Value>) -> serde_json::Result<Self> {
    serde_json::from_value(Value::Object(map))
  }

  /// Field names accepted by [`PreferencesStore::set`].
  pub fn keys() -> Vec<String> {
    Self::default()
      .to_map()
      .map(|map| map.keys().cloned().collect())
      .unwrap_or_default()
  }
}

/// SQLite-backed preferences store
pub struct PreferencesStore {
  db: Database,
}

impl PreferencesStore {
  /// Open the store at the default location
  pub fn open() -> Result<Self> {
    Self::open_at(&Database::default_path()?)
  }

  pub fn open_at(path: &Path) -> Result<Self> {
    Ok(Self {
      db: Database::open_at(path)?,
    })
  }

  /// Load preferences; missing or unreadable fields fall back to defaults.
  pub fn load(&self) -> Result<Preferences> {
    let mut stmt = self
      .db
      .conn()
      .prepare("SELECT key, value FROM preferences")
      .map_err(|e| eyre!("Failed to read preferences: {}", e))?;
    let rows = stmt
      .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
      .map_err(|e| eyre!("Failed to read preferences: {}", e))?;

    let defaults = Preferences::default();
    let mut merged = defaults.to_map()?;
    for row in rows {
      let (key, raw) = row.map_err(|e| eyre!("Failed to read preference row: {}", e))?;
      if !merged.contains_key(&key) {
        debug!(%key, "ignoring unknown preference");
        continue;
      }
      let Ok(value) = serde_json::from_str::<Value>(&raw) else {
        warn!(%key, "ignoring unreadable preference value");
        continue;
      };
      // Validate each field on its own so one bad value keeps the rest
      let mut candidate = merged.clone();
      candidate.insert(key.clone(), value);
      if Preferences::from_map(candidate.clone()).is_ok() {
        merged = candidate;
      } else {
        warn!(%key, "ignoring invalid preference value");
      }
    }

    Preferences::from_map(merged).map_err(|e| eyre!("Failed to decode preferences: {}", e))
  }

  /// Save every field of `preferences`
  pub fn save(&self, preferences: &Preferences) -> Result<()> {
    let now = Utc::now().to_rfc3339();
    let tx = self
      .db
      .conn()
      .unchecked_transaction()
      .map_err(|e| eyre!("Failed to start transaction: {}", e))?;

    for (key, value) in preferences.to_map()? {
      tx.execute(
        "INSERT INTO preferences (key, value, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        params![key, value.to_string(), now],
      )
      .map_err(|e| eyre!("Failed to save preference {}: {}", key, e))?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to save preferences: {}", e))?;
    debug!("preferences saved");
    Ok(())
  }

  /// Set one field from its textual form, e.g. `theme dark` or
  /// `sound_enabled false`, and save the result.
  pub fn set(&self, key: &str, raw: &str) -> Result<Preferences> {
    let mut map = self.load()?.to_map()?;
    if !map.contains_key(key) {
      return Err(eyre!(
        "Unknown preference {}. Known preferences: {}",
        key,
        Preferences::keys().join(", ")
      ));
    }

    let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    map.insert(key.to_string(), value);
    let preferences = Preferences::from_map(map)
      .map_err(|e| eyre!("Invalid value {:?} for {}: {}", raw, key, e))?;

    self.save(&preferences)?;
    Ok(preferences)
  }
}
