//! SQLite persistence for the enrollment roster, attendance sessions,
//! and confirmed attendance events.
//!
//! The deduplicator already guarantees at-most-once emission per
//! (identity, session); the schema backs that up with a UNIQUE
//! constraint so a retried delivery is ignored rather than corrupting
//! the roster.

use chrono::{DateTime, Utc};
use rollcall_core::attendance::{AttendanceEvent, AttendanceRecorder, RecorderError};
use rollcall_core::gallery::GalleryError;
use rollcall_core::{AttendanceSession, Embedding, EnrolledIdentity, Gallery, SessionId};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("database directory: {0}")]
    Io(#[from] std::io::Error),
    #[error("embedding serialization: {0}")]
    Serde(#[from] serde_json::Error),
    #[error(transparent)]
    Gallery(#[from] GalleryError),
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

/// Roster entry summary for listings.
#[derive(Debug, Clone, Serialize)]
pub struct IdentitySummary {
    pub id: String,
    pub display_name: String,
    pub reference_count: usize,
}

/// Session summary for listings.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub id: String,
    pub camera_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub attended: usize,
}

/// One persisted attendance record, joined with the roster.
#[derive(Debug, Clone, Serialize)]
pub struct AttendanceRow {
    pub identity_id: String,
    pub display_name: String,
    pub recorded_at: DateTime<Utc>,
    pub confidence: f32,
}

/// SQLite-backed store. Lives on one thread; the engine owns it.
#[derive(Debug)]
pub struct Store {
    conn: Connection,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS identities (
                id           TEXT PRIMARY KEY,
                display_name TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS reference_embeddings (
                rowid_pk     INTEGER PRIMARY KEY AUTOINCREMENT,
                identity_id  TEXT NOT NULL REFERENCES identities(id) ON DELETE CASCADE,
                vector       TEXT NOT NULL,
                model_version TEXT
            );
            CREATE TABLE IF NOT EXISTS sessions (
                id         TEXT PRIMARY KEY,
                camera_id  TEXT NOT NULL,
                started_at TEXT NOT NULL,
                ended_at   TEXT
            );
            CREATE TABLE IF NOT EXISTS attendance (
                identity_id TEXT NOT NULL,
                session_id  TEXT NOT NULL REFERENCES sessions(id),
                recorded_at TEXT NOT NULL,
                confidence  REAL NOT NULL,
                UNIQUE(identity_id, session_id)
            );",
        )?;
        Ok(Self { conn })
    }

    /// Persist an identity, replacing its reference set wholesale.
    pub fn enroll_identity(&mut self, identity: &EnrolledIdentity) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO identities (id, display_name) VALUES (?1, ?2)
             ON CONFLICT(id) DO UPDATE SET display_name = excluded.display_name",
            params![identity.id, identity.display_name],
        )?;
        tx.execute(
            "DELETE FROM reference_embeddings WHERE identity_id = ?1",
            params![identity.id],
        )?;
        for reference in &identity.references {
            tx.execute(
                "INSERT INTO reference_embeddings (identity_id, vector, model_version)
                 VALUES (?1, ?2, ?3)",
                params![
                    identity.id,
                    serde_json::to_string(&reference.values)?,
                    reference.model_version,
                ],
            )?;
        }
        tx.commit()?;
        tracing::info!(
            identity = %identity.id,
            references = identity.references.len(),
            "identity enrolled"
        );
        Ok(())
    }

    /// Remove an identity and its references. Returns false if absent.
    pub fn remove_identity(&mut self, identity_id: &str) -> Result<bool, StoreError> {
        let changed = self
            .conn
            .execute("DELETE FROM identities WHERE id = ?1", params![identity_id])?;
        Ok(changed > 0)
    }

    /// Load the whole roster into an in-memory gallery.
    pub fn load_gallery(&self) -> Result<Gallery, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT i.id, i.display_name, r.vector, r.model_version
             FROM identities i
             JOIN reference_embeddings r ON r.identity_id = i.id
             ORDER BY i.id",
        )?;

        let mut identities: HashMap<String, EnrolledIdentity> = HashMap::new();
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
            ))
        })?;

        for row in rows {
            let (id, display_name, vector, model_version) = row?;
            let values: Vec<f32> = serde_json::from_str(&vector)?;
            identities
                .entry(id.clone())
                .or_insert_with(|| EnrolledIdentity {
                    id,
                    display_name,
                    references: Vec::new(),
                })
                .references
                .push(Embedding {
                    values,
                    model_version,
                });
        }

        let gallery = Gallery::new();
        for identity in identities.into_values() {
            gallery.enroll(identity)?;
        }
        tracing::info!(enrolled = gallery.len(), "gallery loaded");
        Ok(gallery)
    }

    pub fn list_identities(&self) -> Result<Vec<IdentitySummary>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT i.id, i.display_name, COUNT(r.rowid_pk)
             FROM identities i
             LEFT JOIN reference_embeddings r ON r.identity_id = i.id
             GROUP BY i.id ORDER BY i.id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(IdentitySummary {
                id: row.get(0)?,
                display_name: row.get(1)?,
                reference_count: row.get::<_, i64>(2)? as usize,
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn create_session(
        &self,
        session: &AttendanceSession,
        camera_id: &str,
    ) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO sessions (id, camera_id, started_at) VALUES (?1, ?2, ?3)",
            params![
                session.id.to_string(),
                camera_id,
                session.started_at.to_rfc3339()
            ],
        )?;
        Ok(())
    }

    pub fn close_session(&self, session: &AttendanceSession) -> Result<(), StoreError> {
        let ended_at = session.ended_at.unwrap_or_else(Utc::now);
        self.conn.execute(
            "UPDATE sessions SET ended_at = ?2 WHERE id = ?1",
            params![session.id.to_string(), ended_at.to_rfc3339()],
        )?;
        Ok(())
    }

    /// Rebuild the most recent unfinished session, with its recorded
    /// attendance preloaded so a restart cannot emit duplicates.
    pub fn latest_open_session(&self) -> Result<Option<AttendanceSession>, StoreError> {
        let row = self
            .conn
            .query_row(
                "SELECT id, started_at FROM sessions
                 WHERE ended_at IS NULL ORDER BY started_at DESC LIMIT 1",
                [],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?;

        let Some((id, started_at)) = row else {
            return Ok(None);
        };

        let session_id = SessionId(parse_uuid(&id)?);
        let started_at = parse_time(&started_at)?;

        let mut stmt = self.conn.prepare(
            "SELECT identity_id, recorded_at FROM attendance WHERE session_id = ?1",
        )?;
        let rows = stmt.query_map(params![id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut attended = HashMap::new();
        for row in rows {
            let (identity_id, recorded_at) = row?;
            attended.insert(identity_id, parse_time(&recorded_at)?);
        }

        Ok(Some(AttendanceSession::resume(
            session_id, started_at, attended,
        )))
    }

    pub fn list_sessions(&self) -> Result<Vec<SessionSummary>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT s.id, s.camera_id, s.started_at, s.ended_at, COUNT(a.identity_id)
             FROM sessions s
             LEFT JOIN attendance a ON a.session_id = s.id
             GROUP BY s.id ORDER BY s.started_at DESC",
        )?;
        let raw: Vec<(String, String, String, Option<String>, i64)> = stmt
            .query_map([], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                ))
            })?
            .collect::<Result<_, _>>()?;

        let mut sessions = Vec::with_capacity(raw.len());
        for (id, camera_id, started_at, ended_at, attended) in raw {
            sessions.push(SessionSummary {
                id,
                camera_id,
                started_at: parse_time(&started_at)?,
                ended_at: ended_at.as_deref().map(parse_time).transpose()?,
                attended: attended as usize,
            });
        }
        Ok(sessions)
    }

    pub fn attendance_for(&self, session_id: &str) -> Result<Vec<AttendanceRow>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT a.identity_id, COALESCE(i.display_name, a.identity_id),
                    a.recorded_at, a.confidence
             FROM attendance a
             LEFT JOIN identities i ON i.id = a.identity_id
             WHERE a.session_id = ?1
             ORDER BY a.recorded_at",
        )?;
        let raw: Vec<(String, String, String, f64)> = stmt
            .query_map(params![session_id], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })?
            .collect::<Result<_, _>>()?;

        let mut rows = Vec::with_capacity(raw.len());
        for (identity_id, display_name, recorded_at, confidence) in raw {
            rows.push(AttendanceRow {
                identity_id,
                display_name,
                recorded_at: parse_time(&recorded_at)?,
                confidence: confidence as f32,
            });
        }
        Ok(rows)
    }
}

impl AttendanceRecorder for Store {
    fn record(&mut self, event: &AttendanceEvent) -> Result<(), RecorderError> {
        let changed = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO attendance
                 (identity_id, session_id, recorded_at, confidence)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    event.identity_id,
                    event.session_id.to_string(),
                    event.timestamp.to_rfc3339(),
                    event.confidence as f64,
                ],
            )
            .map_err(RecorderError::new)?;

        if changed == 0 {
            // Retried delivery; the UNIQUE constraint kept the original.
            tracing::debug!(
                identity = %event.identity_id,
                session = %event.session_id,
                "attendance row already present, delivery ignored"
            );
        }
        Ok(())
    }
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("bad timestamp {raw:?}: {e}")))
}

fn parse_uuid(raw: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(raw).map_err(|e| StoreError::Corrupt(format!("bad session id {raw:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(millis: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_700_000_000_000 + millis).unwrap()
    }

    fn unit(values: Vec<f32>) -> Embedding {
        Embedding::unit(values, None).unwrap()
    }

    fn ada() -> EnrolledIdentity {
        EnrolledIdentity {
            id: "s1".into(),
            display_name: "Ada".into(),
            references: vec![unit(vec![1.0, 0.0]), unit(vec![0.9, 0.1])],
        }
    }

    fn event(session: &AttendanceSession, identity: &str) -> AttendanceEvent {
        AttendanceEvent {
            identity_id: identity.into(),
            display_name: "Ada".into(),
            timestamp: ts(100),
            confidence: 0.92,
            session_id: session.id,
        }
    }

    #[test]
    fn test_open_creates_directories_and_reports_io_failures() {
        let base = std::env::temp_dir().join(format!("rollcall-store-{}", std::process::id()));
        std::fs::create_dir_all(&base).unwrap();

        let nested = base.join("a/b/attendance.db");
        Store::open(&nested).unwrap();
        assert!(nested.exists());

        // A file where a directory is needed must surface as an I/O
        // error, not an opaque sqlite failure.
        let blocker = base.join("blocker");
        std::fs::write(&blocker, b"").unwrap();
        let err = Store::open(&blocker.join("db/attendance.db")).unwrap_err();
        assert!(matches!(err, StoreError::Io(_)));

        std::fs::remove_dir_all(&base).unwrap();
    }

    #[test]
    fn test_enroll_and_load_gallery_roundtrip() {
        let mut store = Store::open_in_memory().unwrap();
        store.enroll_identity(&ada()).unwrap();

        let gallery = store.load_gallery().unwrap();
        assert_eq!(gallery.len(), 1);
        assert_eq!(gallery.dim(), Some(2));

        let result = gallery.lookup(&unit(vec![1.0, 0.0]), 1).unwrap();
        assert_eq!(result[0].identity_id, "s1");
        assert!(result[0].distance.abs() < 1e-6);
    }

    #[test]
    fn test_reenroll_replaces_references() {
        let mut store = Store::open_in_memory().unwrap();
        store.enroll_identity(&ada()).unwrap();

        let mut updated = ada();
        updated.references = vec![unit(vec![0.0, 1.0])];
        store.enroll_identity(&updated).unwrap();

        let listed = store.list_identities().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].reference_count, 1);
    }

    #[test]
    fn test_remove_cascades_references() {
        let mut store = Store::open_in_memory().unwrap();
        store.enroll_identity(&ada()).unwrap();

        assert!(store.remove_identity("s1").unwrap());
        assert!(!store.remove_identity("s1").unwrap());
        assert!(store.load_gallery().unwrap().is_empty());
    }

    #[test]
    fn test_record_is_idempotent() {
        let mut store = Store::open_in_memory().unwrap();
        store.enroll_identity(&ada()).unwrap();

        let session = AttendanceSession::begin(ts(0));
        store.create_session(&session, "cam0").unwrap();

        let event = event(&session, "s1");
        store.record(&event).unwrap();
        // Retried delivery must not create a second row
        store.record(&event).unwrap();

        let rows = store.attendance_for(&session.id.to_string()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].identity_id, "s1");
        assert!((rows[0].confidence - 0.92).abs() < 1e-6);
    }

    #[test]
    fn test_session_lifecycle_and_listing() {
        let mut store = Store::open_in_memory().unwrap();
        store.enroll_identity(&ada()).unwrap();

        let mut session = AttendanceSession::begin(ts(0));
        store.create_session(&session, "cam0").unwrap();
        store.record(&event(&session, "s1")).unwrap();

        session.end(ts(60_000));
        store.close_session(&session).unwrap();

        let sessions = store.list_sessions().unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].attended, 1);
        assert!(sessions[0].ended_at.is_some());
    }

    #[test]
    fn test_remove_identity_keeps_attendance_history() {
        let mut store = Store::open_in_memory().unwrap();
        store.enroll_identity(&ada()).unwrap();

        let session = AttendanceSession::begin(ts(0));
        store.create_session(&session, "cam0").unwrap();
        store.record(&event(&session, "s1")).unwrap();

        assert!(store.remove_identity("s1").unwrap());
        let rows = store.attendance_for(&session.id.to_string()).unwrap();
        assert_eq!(rows.len(), 1);
        // Display name falls back to the id once the roster entry is gone
        assert_eq!(rows[0].display_name, "s1");
    }

    #[test]
    fn test_latest_open_session_resumes_attendance() {
        let mut store = Store::open_in_memory().unwrap();
        store.enroll_identity(&ada()).unwrap();

        let session = AttendanceSession::begin(ts(0));
        store.create_session(&session, "cam0").unwrap();
        store.record(&event(&session, "s1")).unwrap();

        let resumed = store.latest_open_session().unwrap().unwrap();
        assert_eq!(resumed.id, session.id);
        assert!(resumed.has_attended("s1"));
        assert_eq!(resumed.attended_count(), 1);
    }

    #[test]
    fn test_latest_open_session_ignores_closed() {
        let store = Store::open_in_memory().unwrap();
        let mut session = AttendanceSession::begin(ts(0));
        store.create_session(&session, "cam0").unwrap();
        session.end(ts(1000));
        store.close_session(&session).unwrap();

        assert!(store.latest_open_session().unwrap().is_none());
    }
}
