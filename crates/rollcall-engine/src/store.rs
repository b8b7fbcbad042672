//! SQLite-backed template store and attendance ledger.
//!
//! Templates are stored as raw wire bytes (see [`FaceTemplate::to_bytes`]),
//! one per identity. The ledger holds at most one row per identity per
//! calendar day, enforced by the table's `UNIQUE(identity, date)` constraint.

use chrono::{DateTime, Local, NaiveDate, Utc};
use rollcall_core::{Encoding, Enrollment, FaceTemplate, TemplateError, TEMPLATE_LEN};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use std::path::Path;
use thiserror::Error;
use uuid::Uuid;

const DATE_FORMAT: &str = "%Y-%m-%d";

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS templates (
    identity    TEXT PRIMARY KEY,
    id          TEXT NOT NULL,
    template    BLOB NOT NULL,
    confidence  REAL NOT NULL,
    enrolled_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS attendance (
    id               TEXT PRIMARY KEY,
    identity         TEXT NOT NULL,
    date             TEXT NOT NULL,
    time_in          TEXT NOT NULL,
    status           TEXT NOT NULL DEFAULT 'present',
    confidence_score REAL NOT NULL,
    UNIQUE(identity, date)
);
";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("creating database directory {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("stored template for {identity} is corrupt: {source}")]
    CorruptTemplate {
        identity: String,
        #[source]
        source: TemplateError,
    },
}

/// Enrollment metadata (the template itself is not included).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TemplateRecord {
    pub id: String,
    pub identity: String,
    pub confidence: f64,
    pub enrolled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttendanceRecord {
    pub id: String,
    pub identity: String,
    pub date: NaiveDate,
    pub time_in: DateTime<Utc>,
    pub status: String,
    pub confidence_score: f64,
}

/// Result of an insert-if-absent on the ledger.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MarkOutcome {
    Marked(AttendanceRecord),
    /// The identity already has a row for that date; the existing row.
    AlreadyMarked(AttendanceRecord),
}

impl MarkOutcome {
    pub fn record(&self) -> &AttendanceRecord {
        match self {
            MarkOutcome::Marked(r) | MarkOutcome::AlreadyMarked(r) => r,
        }
    }
}

pub struct Store {
    conn: Connection,
    template_len: usize,
}

impl Store {
    /// Open (creating if needed) the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(|source| StoreError::Io {
                path: dir.display().to_string(),
                source,
            })?;
        }
        let store = Self::init(Connection::open(path)?)?;
        tracing::info!(path = %path.display(), "opened store");
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn,
            template_len: TEMPLATE_LEN,
        })
    }

    /// Decode stored templates as `len` components (the encoder's patch area).
    pub fn with_template_len(mut self, len: usize) -> Self {
        self.template_len = len;
        self
    }

    pub fn template_len(&self) -> usize {
        self.template_len
    }

    /// Store `encoding` as the template for `identity`, replacing any previous one.
    pub fn save_template(&self, identity: &str, encoding: &Encoding) -> Result<TemplateRecord, StoreError> {
        let record = TemplateRecord {
            id: Uuid::new_v4().to_string(),
            identity: identity.to_string(),
            confidence: encoding.confidence,
            enrolled_at: Utc::now(),
        };
        self.conn.execute(
            "INSERT INTO templates (identity, id, template, confidence, enrolled_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(identity) DO UPDATE SET
                id = excluded.id,
                template = excluded.template,
                confidence = excluded.confidence,
                enrolled_at = excluded.enrolled_at",
            params![
                record.identity,
                record.id,
                encoding.template.to_bytes(),
                record.confidence,
                record.enrolled_at.to_rfc3339(),
            ],
        )?;
        tracing::info!(identity, id = %record.id, confidence = record.confidence, "template saved");
        Ok(record)
    }

    pub fn template(&self, identity: &str) -> Result<Option<FaceTemplate>, StoreError> {
        let bytes: Option<Vec<u8>> = self
            .conn
            .query_row(
                "SELECT template FROM templates WHERE identity = ?1",
                params![identity],
                |row| row.get(0),
            )
            .optional()?;
        bytes
            .map(|b| decode_template(identity, &b, self.template_len))
            .transpose()
    }

    /// Every enrolled template, oldest enrollment first.
    pub fn gallery(&self) -> Result<Vec<Enrollment>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT identity, template FROM templates ORDER BY enrolled_at, identity")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?)))?;

        let mut gallery = Vec::new();
        for row in rows {
            let (identity, bytes) = row?;
            let template = decode_template(&identity, &bytes, self.template_len)?;
            gallery.push(Enrollment::new(identity, template));
        }
        Ok(gallery)
    }

    pub fn templates(&self) -> Result<Vec<TemplateRecord>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, identity, confidence, enrolled_at FROM templates ORDER BY enrolled_at, identity",
        )?;
        let records = stmt
            .query_map([], |row| {
                Ok(TemplateRecord {
                    id: row.get(0)?,
                    identity: row.get(1)?,
                    confidence: row.get(2)?,
                    enrolled_at: timestamp(row, 3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Record `identity` as present on `date` unless it already is.
    pub fn mark_attendance(
        &self,
        identity: &str,
        date: NaiveDate,
        confidence_score: f64,
    ) -> Result<MarkOutcome, StoreError> {
        let record = AttendanceRecord {
            id: Uuid::new_v4().to_string(),
            identity: identity.to_string(),
            date,
            time_in: Utc::now(),
            status: "present".to_string(),
            confidence_score,
        };
        let inserted = self.conn.execute(
            "INSERT INTO attendance (id, identity, date, time_in, status, confidence_score)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(identity, date) DO NOTHING",
            params![
                record.id,
                record.identity,
                date.format(DATE_FORMAT).to_string(),
                record.time_in.to_rfc3339(),
                record.status,
                record.confidence_score,
            ],
        )?;

        if inserted == 0 {
            let existing = self.conn.query_row(
                "SELECT id, identity, date, time_in, status, confidence_score
                 FROM attendance WHERE identity = ?1 AND date = ?2",
                params![identity, date.format(DATE_FORMAT).to_string()],
                attendance_row,
            )?;
            tracing::info!(identity, %date, "attendance already marked");
            return Ok(MarkOutcome::AlreadyMarked(existing));
        }

        tracing::info!(identity, %date, confidence_score, "attendance marked");
        Ok(MarkOutcome::Marked(record))
    }

    /// Ledger rows for `date`, earliest arrival first, optionally for one identity.
    pub fn attendance_on(
        &self,
        date: NaiveDate,
        identity: Option<&str>,
    ) -> Result<Vec<AttendanceRecord>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, identity, date, time_in, status, confidence_score
             FROM attendance WHERE date = ?1 AND (?2 IS NULL OR identity = ?2)
             ORDER BY time_in, identity",
        )?;
        let records = stmt
            .query_map(params![date.format(DATE_FORMAT).to_string(), identity], attendance_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }
}

/// Today's date in the local timezone.
pub fn today() -> NaiveDate {
    Local::now().date_naive()
}

fn decode_template(identity: &str, bytes: &[u8], len: usize) -> Result<FaceTemplate, StoreError> {
    FaceTemplate::from_bytes_with_len(bytes, len).map_err(|source| StoreError::CorruptTemplate {
        identity: identity.to_string(),
        source,
    })
}

fn attendance_row(row: &Row<'_>) -> rusqlite::Result<AttendanceRecord> {
    let raw_date: String = row.get(2)?;
    let date = NaiveDate::parse_from_str(&raw_date, DATE_FORMAT)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(e)))?;
    Ok(AttendanceRecord {
        id: row.get(0)?,
        identity: row.get(1)?,
        date,
        time_in: timestamp(row, 3)?,
        status: row.get(4)?,
        confidence_score: row.get(5)?,
    })
}

fn timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}
