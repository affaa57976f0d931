// Durable session storage backed by SQLite

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};

use super::types::{PersistedRecord, Session, UserProfile};
use crate::error::ApiError;

const RECORD_KEY: &str = "gym:auth:record";

/// Durable key-value persistence for the current session and user profile
///
/// The record is a single row, so every save replaces it in one statement and
/// a reader never observes a half-written session. Writers are serialized by
/// the connection mutex.
#[derive(Clone)]
pub struct AuthStore {
    conn: Arc<Mutex<Connection>>,
}

impl AuthStore {
    /// Open (creating if needed) the database at `path`
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create storage directory: {}", parent.display())
                })?;
            }
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open SQLite database: {}", path.display()))?;
        Self::from_connection(conn)
    }

    /// Non-durable store, mostly for tests and ephemeral sessions
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory SQLite")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS auth_kv (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
            [],
        )
        .context("Failed to create auth_kv table")?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Load the persisted session and profile
    ///
    /// Missing or corrupt records come back empty; nothing is propagated.
    pub async fn load(&self) -> (Option<Session>, Option<UserProfile>) {
        let conn = self.conn.clone();
        let result = tokio::task::spawn_blocking(move || -> Result<Option<String>> {
            let conn = conn
                .lock()
                .map_err(|_| anyhow::anyhow!("auth store lock poisoned"))?;
            conn.query_row(
                "SELECT value FROM auth_kv WHERE key = ?",
                [RECORD_KEY],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to read auth record")
        })
        .await;

        let raw = match result {
            Ok(Ok(Some(raw))) => raw,
            Ok(Ok(None)) => {
                tracing::debug!("No persisted session found");
                return (None, None);
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Auth store unreadable, treating as signed out");
                return (None, None);
            }
            Err(e) => {
                tracing::warn!(error = %e, "Auth store load task failed, treating as signed out");
                return (None, None);
            }
        };

        match decode_record(&raw) {
            Some(record) => {
                tracing::debug!(saved_at = %record.saved_at, "Loaded persisted session");
                (Some(record.session), Some(record.user))
            }
            None => (None, None),
        }
    }

    /// Replace the persisted record atomically
    pub async fn save(&self, session: &Session, user: &UserProfile) -> Result<(), ApiError> {
        let record = PersistedRecord {
            session: session.clone(),
            user: user.clone(),
            saved_at: chrono::Utc::now(),
        };
        let value = serde_json::to_string(&record)
            .map_err(|e| ApiError::Storage(format!("Failed to encode auth record: {}", e)))?;

        self.write(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT OR REPLACE INTO auth_kv (key, value) VALUES (?1, ?2)",
                [RECORD_KEY, value.as_str()],
            )?;
            tx.commit()
        })
        .await
    }

    /// Remove the persisted record. Idempotent.
    pub async fn clear(&self) -> Result<(), ApiError> {
        self.write(|conn| {
            conn.execute("DELETE FROM auth_kv WHERE key = ?", [RECORD_KEY])
                .map(|_| ())
        })
        .await
    }

    async fn write<F>(&self, op: F) -> Result<(), ApiError>
    where
        F: FnOnce(&mut Connection) -> rusqlite::Result<()> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|_| ApiError::Storage("auth store lock poisoned".to_string()))?;
            op(&mut conn).map_err(|e| ApiError::Storage(e.to_string()))
        })
        .await
        .map_err(|e| ApiError::Storage(format!("Storage task failed: {}", e)))?
    }

    #[cfg(test)]
    pub(crate) async fn write_raw(&self, value: &str) {
        let value = value.to_string();
        self.write(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO auth_kv (key, value) VALUES (?1, ?2)",
                [RECORD_KEY, value.as_str()],
            )
            .map(|_| ())
        })
        .await
        .unwrap();
    }
}

/// Decode a stored record; anything malformed or incomplete is corruption
fn decode_record(raw: &str) -> Option<PersistedRecord> {
    match serde_json::from_str::<PersistedRecord>(raw) {
        Ok(record) if record.session.is_complete() => Some(record),
        Ok(_) => {
            tracing::warn!("Persisted session has empty tokens, treating as signed out");
            None
        }
        Err(e) => {
            tracing::warn!(error = %e, "Persisted session is corrupt, treating as signed out");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn user() -> UserProfile {
        UserProfile {
            id: "1".to_string(),
            name: "Rafael".to_string(),
            email: "a@b.com".to_string(),
            avatar_ref: None,
        }
    }

    #[tokio::test]
    async fn test_save_load_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("auth.sqlite3");

        {
            let store = AuthStore::open(&path).unwrap();
            store.save(&Session::new("t1", "r1"), &user()).await.unwrap();
        }

        let store = AuthStore::open(&path).unwrap();
        let (session, profile) = store.load().await;
        assert_eq!(session, Some(Session::new("t1", "r1")));
        assert_eq!(profile, Some(user()));
    }

    #[tokio::test]
    async fn test_save_overwrites_previous_record() {
        let store = AuthStore::open_in_memory().unwrap();
        store.save(&Session::new("t1", "r1"), &user()).await.unwrap();
        store.save(&Session::new("t2", "r2"), &user()).await.unwrap();

        let (session, _) = store.load().await;
        assert_eq!(session, Some(Session::new("t2", "r2")));
    }

    #[tokio::test]
    async fn test_load_missing_record() {
        let store = AuthStore::open_in_memory().unwrap();
        let (session, profile) = store.load().await;
        assert!(session.is_none());
        assert!(profile.is_none());
    }

    #[tokio::test]
    async fn test_load_corrupt_record_is_empty() {
        let store = AuthStore::open_in_memory().unwrap();
        store.write_raw("{not json").await;
        assert_eq!(store.load().await, (None, None));

        store
            .write_raw(r#"{"session":{"accessToken":"","refreshToken":"r1"},"user":{"id":"1","name":"A","email":"a@b.com"},"savedAt":"2025-01-12T10:30:00Z"}"#)
            .await;
        assert_eq!(store.load().await, (None, None));
    }

    #[tokio::test]
    async fn test_clear_is_idempotent() {
        let store = AuthStore::open_in_memory().unwrap();
        store.save(&Session::new("t1", "r1"), &user()).await.unwrap();

        store.clear().await.unwrap();
        store.clear().await.unwrap();
        assert_eq!(store.load().await, (None, None));
    }

    #[tokio::test]
    async fn test_concurrent_writers_leave_a_whole_record() {
        let store = AuthStore::open_in_memory().unwrap();
        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let session = Session::new(format!("t{}", i), format!("r{}", i));
                store.save(&session, &user()).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let (session, _) = store.load().await;
        let session = session.expect("a record should be present");
        // Pair must come from the same writer
        assert_eq!(&session.access_token[1..], &session.refresh_token[1..]);
    }
}
