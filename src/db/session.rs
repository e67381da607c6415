//! Stored login token, so a session outlives one command.

use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, OptionalExtension};
use std::path::Path;
use tracing::debug;

use super::Database;

pub struct SessionStore {
  db: Database,
}

impl SessionStore {
  pub fn open() -> Result<Self> {
    Self::open_at(&Database::default_path()?)
  }

  pub fn open_at(path: &Path) -> Result<Self> {
    Ok(Self {
      db: Database::open_at(path)?,
    })
  }

  pub fn token(&self) -> Result<Option<String>> {
    self
      .db
      .conn()
      .query_row("SELECT token FROM session WHERE id = 1", [], |row| row.get(0))
      .optional()
      .map_err(|e| eyre!("Failed to read session: {}", e))
  }

  /// Replace the stored token.
  pub fn save(&self, token: &str) -> Result<()> {
    self
      .db
      .conn()
      .execute(
        "INSERT INTO session (id, token, created_at) VALUES (1, ?1, ?2)
         ON CONFLICT(id) DO UPDATE SET token = excluded.token, created_at = excluded.created_at",
        params![token, Utc::now().to_rfc3339()],
      )
      .map_err(|e| eyre!("Failed to save session: {}", e))?;
    debug!("session saved");
    Ok(())
  }

  pub fn clear(&self) -> Result<()> {
    self
      .db
      .conn()
      .execute("DELETE FROM session", [])
      .map_err(|e| eyre!("Failed to clear session: {}", e))?;
    debug!("session cleared");
    Ok(())
  }
}
