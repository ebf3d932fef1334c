//! facefinder-store: durable sessions, uploaded photos and match history.
//!
//! Three tables keyed by session id: `sessions`, `photos` and `matches`.
//! All access goes through a `tokio-rusqlite` connection, so callers stay
//! async while SQLite runs on its own thread. Concurrent writers to the
//! same session are last-writer-wins.

use chrono::{DateTime, Utc};
use facefinder_core::{CandidatePhoto, Embedding, MatchRun, MatchThreshold};
use rusqlite::{params, OptionalExtension};
use std::path::Path;
use thiserror::Error;
use tokio_rusqlite::Connection;

const SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS sessions (
    session_id TEXT PRIMARY KEY,
    created_at TEXT NOT NULL,
    threshold  REAL NOT NULL
);

CREATE TABLE IF NOT EXISTS photos (
    photo_id    INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id  TEXT NOT NULL REFERENCES sessions (session_id),
    filename    TEXT NOT NULL,
    file_data   BLOB NOT NULL,
    uploaded_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_photos_session ON photos (session_id);

CREATE TABLE IF NOT EXISTS matches (
    match_id         INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id       TEXT NOT NULL REFERENCES sessions (session_id),
    target_face_data BLOB NOT NULL,
    target_name      TEXT NOT NULL,
    threshold        REAL NOT NULL,
    matched_photos   TEXT NOT NULL,
    detected_at      TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_matches_session ON matches (session_id);
"#;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database: {0}")]
    Database(#[from] tokio_rusqlite::Error),
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// A row of `sessions`.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionRecord {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub threshold: MatchThreshold,
}

/// A session with its photo count, for listings.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub threshold: MatchThreshold,
    pub photo_count: usize,
}

#[derive(Clone)]
pub struct SessionStore {
    conn: Connection,
}

impl SessionStore {
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).await?;
        tracing::info!(path = %path.display(), "opened session store");
        Self::init(conn).await
    }

    pub async fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory().await?).await
    }

    async fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.call(|conn| {
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await?;
        Ok(Self { conn })
    }

    /// Insert a session row. Returns false if the id already existed.
    pub async fn insert_session(
        &self,
        session_id: &str,
        created_at: DateTime<Utc>,
        threshold: MatchThreshold,
    ) -> Result<bool, StoreError> {
        let id = session_id.to_string();
        let inserted = self
            .conn
            .call(move |conn| {
                let n = conn.execute(
                    "INSERT OR IGNORE INTO sessions (session_id, created_at, threshold) VALUES (?1, ?2, ?3)",
                    params![id, created_at.to_rfc3339(), threshold.value()],
                )?;
                Ok(n > 0)
            })
            .await?;
        Ok(inserted)
    }

    pub async fn update_threshold(&self, session_id: &str, threshold: MatchThreshold) -> Result<(), StoreError> {
        let id = session_id.to_string();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE sessions SET threshold = ?1 WHERE session_id = ?2",
                    params![threshold.value(), id],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn load_session(&self, session_id: &str) -> Result<Option<SessionRecord>, StoreError> {
        let id = session_id.to_string();
        let row = self
            .conn
            .call(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT session_id, created_at, threshold FROM sessions WHERE session_id = ?1",
                        [id],
                        |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, f64>(2)?)),
                    )
                    .optional()?)
            })
            .await?;

        row.map(|(session_id, created_at, threshold)| {
            Ok(SessionRecord {
                session_id,
                created_at: parse_time(&created_at)?,
                threshold: MatchThreshold::from_stored(threshold),
            })
        })
        .transpose()
    }

    /// Append photos in one transaction. Returns how many were written.
    pub async fn insert_photos(&self, session_id: &str, photos: Vec<CandidatePhoto>) -> Result<usize, StoreError> {
        self.write_photos(session_id, photos, false).await
    }

    /// Replace the session's photo set in one transaction.
    pub async fn replace_photos(&self, session_id: &str, photos: Vec<CandidatePhoto>) -> Result<usize, StoreError> {
        self.write_photos(session_id, photos, true).await
    }

    async fn write_photos(&self, session_id: &str, photos: Vec<CandidatePhoto>, replace: bool) -> Result<usize, StoreError> {
        let id = session_id.to_string();
        let written = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                if replace {
                    tx.execute("DELETE FROM photos WHERE session_id = ?1", [&id])?;
                }
                {
                    let mut stmt = tx.prepare(
                        "INSERT INTO photos (session_id, filename, file_data, uploaded_at) VALUES (?1, ?2, ?3, ?4)",
                    )?;
                    for photo in &photos {
                        stmt.execute(params![id, photo.filename, &photo.bytes[..], photo.uploaded_at.to_rfc3339()])?;
                    }
                }
                tx.commit()?;
                Ok(photos.len())
            })
            .await?;

        tracing::debug!(session = session_id, written, replace, "photos stored");
        Ok(written)
    }

    /// Photos in upload order.
    pub async fn list_photos(&self, session_id: &str) -> Result<Vec<CandidatePhoto>, StoreError> {
        let id = session_id.to_string();
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT filename, file_data, uploaded_at FROM photos WHERE session_id = ?1 ORDER BY photo_id",
                )?;
                let rows = stmt
                    .query_map([id], |row| {
                        Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?, row.get::<_, String>(2)?))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        rows.into_iter()
            .map(|(filename, bytes, uploaded_at)| {
                Ok(CandidatePhoto::with_uploaded_at(&filename, bytes, parse_time(&uploaded_at)?))
            })
            .collect()
    }

    pub async fn count_photos(&self, session_id: &str) -> Result<usize, StoreError> {
        let id = session_id.to_string();
        let count = self
            .conn
            .call(move |conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM photos WHERE session_id = ?1", [id], |row| {
                    row.get::<_, i64>(0)
                })?)
            })
            .await?;
        Ok(count as usize)
    }

    pub async fn insert_match_run(&self, session_id: &str, run: &MatchRun) -> Result<i64, StoreError> {
        let id = session_id.to_string();
        let embedding = run.target_embedding.to_le_bytes();
        let label = run.target_label.clone();
        let threshold = run.threshold.value();
        let matched = serde_json::to_string(&run.matched_filenames)
            .map_err(|e| StoreError::Corrupt(format!("matched filenames: {e}")))?;
        let detected_at = run.detected_at.to_rfc3339();

        let match_id = self
            .conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO matches (session_id, target_face_data, target_name, threshold, matched_photos, detected_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![id, embedding, label, threshold, matched, detected_at],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await?;
        Ok(match_id)
    }

    /// Match history, oldest first.
    pub async fn list_match_runs(&self, session_id: &str) -> Result<Vec<MatchRun>, StoreError> {
        let id = session_id.to_string();
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT target_face_data, target_name, threshold, matched_photos, detected_at
                     FROM matches WHERE session_id = ?1 ORDER BY match_id",
                )?;
                let rows = stmt
                    .query_map([id], |row| {
                        Ok((
                            row.get::<_, Vec<u8>>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, f64>(2)?,
                            row.get::<_, String>(3)?,
                            row.get::<_, String>(4)?,
                        ))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        rows.into_iter()
            .map(|(embedding, target_label, threshold, matched, detected_at)| {
                let target_embedding = Embedding::from_le_bytes(&embedding)
                    .ok_or_else(|| StoreError::Corrupt(format!("embedding of {} bytes", embedding.len())))?;
                let matched_filenames = serde_json::from_str(&matched)
                    .map_err(|e| StoreError::Corrupt(format!("matched filenames: {e}")))?;
                Ok(MatchRun {
                    target_embedding,
                    target_label,
                    threshold: MatchThreshold::from_stored(threshold),
                    matched_filenames,
                    detected_at: parse_time(&detected_at)?,
                })
            })
            .collect()
    }

    /// Most recently created sessions first.
    pub async fn list_recent_sessions(&self, limit: usize) -> Result<Vec<SessionSummary>, StoreError> {
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT s.session_id, s.created_at, s.threshold, COUNT(p.photo_id)
                     FROM sessions s LEFT JOIN photos p ON p.session_id = s.session_id
                     GROUP BY s.session_id
                     ORDER BY s.created_at DESC, s.rowid DESC
                     LIMIT ?1",
                )?;
                let rows = stmt
                    .query_map([limit as i64], |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, f64>(2)?,
                            row.get::<_, i64>(3)?,
                        ))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        rows.into_iter()
            .map(|(session_id, created_at, threshold, count)| {
                Ok(SessionSummary {
                    session_id,
                    created_at: parse_time(&created_at)?,
                    threshold: MatchThreshold::from_stored(threshold),
                    photo_count: count as usize,
                })
            })
            .collect()
    }

    /// Remove a session with its photos and history. Returns false if it did not exist.
    pub async fn delete_session(&self, session_id: &str) -> Result<bool, StoreError> {
        let id = session_id.to_string();
        let deleted = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute("DELETE FROM photos WHERE session_id = ?1", [&id])?;
                tx.execute("DELETE FROM matches WHERE session_id = ?1", [&id])?;
                let n = tx.execute("DELETE FROM sessions WHERE session_id = ?1", [&id])?;
                tx.commit()?;
                Ok(n > 0)
            })
            .await?;
        Ok(deleted)
    }

    /// Close the connection. Calls through other clones fail afterwards.
    pub async fn close(self) -> Result<(), StoreError> {
        self.conn.close().await?;
        tracing::info!("session store closed");
        Ok(())
    }
}

fn parse_time(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("timestamp {s:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    async fn store_with_session(id: &str) -> SessionStore {
        let store = SessionStore::open_in_memory().await.unwrap();
        store.insert_session(id, at(0), MatchThreshold::default()).await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_insert_session_idempotent() {
        let store = store_with_session("s1").await;
        let again = store
            .insert_session("s1", at(50), MatchThreshold::new(0.6).unwrap())
            .await
            .unwrap();
        assert!(!again);

        let record = store.load_session("s1").await.unwrap().unwrap();
        assert_eq!(record.created_at, at(0));
        assert_eq!(record.threshold, MatchThreshold::default());
        assert!(store.load_session("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_threshold() {
        let store = store_with_session("s1").await;
        store.update_threshold("s1", MatchThreshold::new(0.35).unwrap()).await.unwrap();
        let record = store.load_session("s1").await.unwrap().unwrap();
        assert_eq!(record.threshold.value(), 0.35);
    }

    #[tokio::test]
    async fn test_photos_roundtrip_in_order() {
        let store = store_with_session("s1").await;
        let photos = vec![
            CandidatePhoto::with_uploaded_at("b.jpg", vec![2, 2], at(1)),
            CandidatePhoto::with_uploaded_at("a.jpg", vec![1], at(2)),
            CandidatePhoto::with_uploaded_at("b.jpg", vec![3], at(3)),
        ];
        assert_eq!(store.insert_photos("s1", photos.clone()).await.unwrap(), 3);

        let loaded = store.list_photos("s1").await.unwrap();
        let names: Vec<&str> = loaded.iter().map(|p| p.filename.as_str()).collect();
        assert_eq!(names, vec!["b.jpg", "a.jpg", "b.jpg"]);
        assert_eq!(&loaded[0].bytes[..], &[2, 2]);
        assert_eq!(loaded[2].content_hash, photos[2].content_hash);
        assert_eq!(loaded[1].uploaded_at, at(2));
        assert_eq!(store.count_photos("s1").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_replace_photos() {
        let store = store_with_session("s1").await;
        store
            .insert_photos("s1", vec![CandidatePhoto::new("old.jpg", vec![1])])
            .await
            .unwrap();
        store
            .replace_photos("s1", vec![CandidatePhoto::new("new1.jpg", vec![2]), CandidatePhoto::new("new2.jpg", vec![3])])
            .await
            .unwrap();
        let names: Vec<String> = store
            .list_photos("s1")
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.filename)
            .collect();
        assert_eq!(names, vec!["new1.jpg", "new2.jpg"]);
    }

    #[tokio::test]
    async fn test_unknown_session_has_no_photos() {
        let store = SessionStore::open_in_memory().await.unwrap();
        assert!(store.list_photos("nope").await.unwrap().is_empty());
        assert_eq!(store.count_photos("nope").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_photos_require_session() {
        let store = SessionStore::open_in_memory().await.unwrap();
        let result = store.insert_photos("ghost", vec![CandidatePhoto::new("a.jpg", vec![1])]).await;
        assert!(matches!(result, Err(StoreError::Database(_))));
    }

    #[tokio::test]
    async fn test_match_runs_append_only_history() {
        let store = store_with_session("s1").await;
        let run = |label: &str, files: &[&str], secs| MatchRun {
            target_embedding: Embedding::new(vec![0.25, -1.0, 3.5]),
            target_label: label.to_string(),
            threshold: MatchThreshold::new(0.45).unwrap(),
            matched_filenames: files.iter().map(|f| f.to_string()).collect(),
            detected_at: at(secs),
        };
        store.insert_match_run("s1", &run("me.jpg", &["a.jpg", "c.jpg"], 10)).await.unwrap();
        store.insert_match_run("s1", &run("camera", &["b.jpg"], 20)).await.unwrap();

        let history = store.list_match_runs("s1").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].target_label, "me.jpg");
        assert_eq!(history[0].matched_filenames, vec!["a.jpg", "c.jpg"]);
        assert_eq!(history[0].target_embedding.values, vec![0.25, -1.0, 3.5]);
        assert_eq!(history[0].threshold.value(), 0.45);
        assert_eq!(history[1].detected_at, at(20));
    }

    #[tokio::test]
    async fn test_list_recent_sessions_with_counts() {
        let store = SessionStore::open_in_memory().await.unwrap();
        store.insert_session("old", at(0), MatchThreshold::default()).await.unwrap();
        store.insert_session("new", at(100), MatchThreshold::default()).await.unwrap();
        store.insert_session("mid", at(50), MatchThreshold::default()).await.unwrap();
        store
            .insert_photos("mid", vec![CandidatePhoto::new("a.jpg", vec![1]), CandidatePhoto::new("b.jpg", vec![2])])
            .await
            .unwrap();

        let recent = store.list_recent_sessions(2).await.unwrap();
        let ids: Vec<&str> = recent.iter().map(|s| s.session_id.as_str()).collect();
        assert_eq!(ids, vec!["new", "mid"]);
        assert_eq!(recent[0].photo_count, 0);
        assert_eq!(recent[1].photo_count, 2);
    }

    #[tokio::test]
    async fn test_delete_session() {
        let store = store_with_session("s1").await;
        store.insert_photos("s1", vec![CandidatePhoto::new("a.jpg", vec![1])]).await.unwrap();
        assert!(store.delete_session("s1").await.unwrap());
        assert!(!store.delete_session("s1").await.unwrap());
        assert!(store.load_session("s1").await.unwrap().is_none());
        assert_eq!(store.count_photos("s1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_closed_store_rejects_calls() {
        let store = store_with_session("s1").await;
        let other = store.clone();
        store.close().await.unwrap();
        assert!(matches!(
            other.load_session("s1").await,
            Err(StoreError::Database(tokio_rusqlite::Error::ConnectionClosed))
        ));
    }
}
