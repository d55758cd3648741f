//! rollcall-store: SQLite-backed [`MemberStore`].
//!
//! Ids are random UUIDs. Timestamps are stored as fixed-width RFC 3339 UTC
//! text with microsecond precision, so string order is time order. Face
//! signatures are stored as JSON.

use async_trait::async_trait;
use chrono::{DateTime, Local, NaiveDate, SecondsFormat, SubsecRound, Utc};
use rollcall_core::{
    AttendanceRecord, FaceSignature, Member, MemberStatus, MemberStore, NewMember, StoreError,
};
use rusqlite::{params, OptionalExtension, Row};
use std::path::Path;
use tokio_rusqlite::Connection;

const SCHEMA: &str = r"
    CREATE TABLE IF NOT EXISTS members (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        email TEXT,
        face_signature TEXT,
        status TEXT NOT NULL DEFAULT 'active',
        created_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS attendance (
        id TEXT PRIMARY KEY,
        member_id TEXT NOT NULL,
        check_in_time TEXT NOT NULL,
        FOREIGN KEY (member_id) REFERENCES members(id) ON DELETE CASCADE
    );

    CREATE INDEX IF NOT EXISTS idx_attendance_time
    ON attendance(check_in_time);

    CREATE INDEX IF NOT EXISTS idx_attendance_member
    ON attendance(member_id, check_in_time);
";

const MEMBER_COLUMNS: &str = "id, name, email, face_signature, status, created_at";

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open or create the database at `path`, creating parent directories.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StoreError::Backend(format!("failed to create {}: {e}", parent.display()))
                })?;
            }
        }
        let conn = Connection::open(path).await.map_err(backend)?;
        tracing::info!(path = %path.display(), "member store opened");
        Self::initialize(conn).await
    }

    /// In-memory database, used by tests and `ROLLCALL_DB_PATH=:memory:`.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().await.map_err(backend)?;
        Self::initialize(conn).await
    }

    async fn initialize(conn: Connection) -> Result<Self, StoreError> {
        conn.call(|db| {
            db.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
            db.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await
        .map_err(backend)?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl MemberStore for SqliteStore {
    async fn list_members(&self) -> Result<Vec<Member>, StoreError> {
        self.conn
            .call(|db| {
                let mut stmt = db.prepare(&format!(
                    "SELECT {MEMBER_COLUMNS} FROM members ORDER BY created_at, rowid"
                ))?;
                let members = stmt
                    .query_map([], member_from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(members)
            })
            .await
            .map_err(backend)
    }

    async fn get_member(&self, id: &str) -> Result<Member, StoreError> {
        let key = id.to_string();
        self.conn
            .call(move |db| {
                let member = db
                    .query_row(
                        &format!("SELECT {MEMBER_COLUMNS} FROM members WHERE id = ?1"),
                        params![key],
                        member_from_row,
                    )
                    .optional()?;
                Ok(member)
            })
            .await
            .map_err(backend)?
            .ok_or_else(|| StoreError::MemberNotFound(id.to_string()))
    }

    async fn create_member(&self, member: NewMember) -> Result<Member, StoreError> {
        let member = member.validate()?;
        let created = Member {
            id: uuid::Uuid::new_v4().to_string(),
            name: member.name,
            email: member.email,
            face_signature: Some(member.face_signature),
            status: MemberStatus::Active,
            created_at: now(),
        };
        let signature = encode_signature(&member.face_signature)?;

        let row = created.clone();
        self.conn
            .call(move |db| {
                db.execute(
                    "INSERT INTO members (id, name, email, face_signature, status, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        row.id,
                        row.name,
                        row.email,
                        signature,
                        row.status.as_str(),
                        format_timestamp(&row.created_at),
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(backend)?;

        tracing::info!(member_id = %created.id, name = %created.name, "member registered");
        Ok(created)
    }

    async fn update_face_signature(
        &self,
        id: &str,
        signature: FaceSignature,
    ) -> Result<Member, StoreError> {
        if !signature.is_valid() {
            return Err(rollcall_core::ValidationError::InvalidSignature.into());
        }
        let encoded = encode_signature(&signature)?;
        let key = id.to_string();
        let changed = self
            .conn
            .call(move |db| {
                Ok(db.execute(
                    "UPDATE members SET face_signature = ?1 WHERE id = ?2",
                    params![encoded, key],
                )?)
            })
            .await
            .map_err(backend)?;
        if changed == 0 {
            return Err(StoreError::MemberNotFound(id.to_string()));
        }
        tracing::info!(member_id = id, "face signature updated");
        self.get_member(id).await
    }

    async fn record_attendance(&self, member_id: &str) -> Result<AttendanceRecord, StoreError> {
        let record_id = uuid::Uuid::new_v4().to_string();
        let check_in_time = now();
        let key = member_id.to_string();
        let stamp = format_timestamp(&check_in_time);

        let inserted = self
            .conn
            .call(move |db| {
                let tx = db.transaction()?;
                let name: Option<String> = tx
                    .query_row(
                        "SELECT name FROM members WHERE id = ?1",
                        params![key],
                        |row| row.get(0),
                    )
                    .optional()?;
                let Some(name) = name else {
                    return Ok(None);
                };
                tx.execute(
                    "INSERT INTO attendance (id, member_id, check_in_time) VALUES (?1, ?2, ?3)",
                    params![record_id, key, stamp],
                )?;
                tx.commit()?;
                Ok(Some((record_id, name)))
            })
            .await
            .map_err(backend)?;

        let (id, name) = inserted.ok_or_else(|| StoreError::MemberNotFound(member_id.to_string()))?;
        Ok(AttendanceRecord {
            id,
            member_id: member_id.to_string(),
            check_in_time,
            member_name: Some(name),
        })
    }

    async fn recent_attendance(&self, limit: usize) -> Result<Vec<AttendanceRecord>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.conn
            .call(move |db| {
                let mut stmt = db.prepare(
                    "SELECT a.id, a.member_id, a.check_in_time, m.name
                     FROM attendance a JOIN members m ON m.id = a.member_id
                     ORDER BY a.check_in_time DESC, a.rowid DESC
                     LIMIT ?1",
                )?;
                let records = stmt
                    .query_map(params![limit], record_from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(records)
            })
            .await
            .map_err(backend)
    }

    async fn member_attendance(
        &self,
        member_id: &str,
    ) -> Result<Vec<AttendanceRecord>, StoreError> {
        // Distinguish an unknown member from one with no check-ins.
        self.get_member(member_id).await?;
        let key = member_id.to_string();
        self.conn
            .call(move |db| {
                let mut stmt = db.prepare(
                    "SELECT a.id, a.member_id, a.check_in_time, m.name
                     FROM attendance a JOIN members m ON m.id = a.member_id
                     WHERE a.member_id = ?1
                     ORDER BY a.check_in_time DESC, a.rowid DESC",
                )?;
                let records = stmt
                    .query_map(params![key], record_from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(records)
            })
            .await
            .map_err(backend)
    }

    async fn daily_attendance_count(&self) -> Result<u64, StoreError> {
        let (start, end) = local_day_bounds(Local::now());
        let (start, end) = (format_timestamp(&start), format_timestamp(&end));
        let count: i64 = self
            .conn
            .call(move |db| {
                Ok(db.query_row(
                    "SELECT COUNT(*) FROM attendance
                     WHERE check_in_time >= ?1 AND check_in_time < ?2",
                    params![start, end],
                    |row| row.get(0),
                )?)
            })
            .await
            .map_err(backend)?;
        Ok(count.max(0) as u64)
    }
}

fn backend(e: tokio_rusqlite::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn encode_signature(signature: &FaceSignature) -> Result<String, StoreError> {
    serde_json::to_string(signature)
        .map_err(|e| StoreError::Backend(format!("failed to encode face signature: {e}")))
}

/// Current time at the precision timestamps are stored with.
fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

fn format_timestamp(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(s).map(|t| t.with_timezone(&Utc))
}

/// UTC instants bounding the local calendar day containing `now`.
fn local_day_bounds(now: DateTime<Local>) -> (DateTime<Utc>, DateTime<Utc>) {
    let day = now.date_naive();
    let start = local_midnight(day).unwrap_or_else(|| now.with_timezone(&Utc));
    let end = day
        .succ_opt()
        .and_then(local_midnight)
        .unwrap_or_else(|| start + chrono::Duration::days(1));
    (start, end)
}

fn local_midnight(day: NaiveDate) -> Option<DateTime<Utc>> {
    day.and_hms_opt(0, 0, 0)?
        .and_local_timezone(Local)
        .earliest()
        .map(|t| t.with_timezone(&Utc))
}

fn conversion_error<E>(column: usize, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(e))
}

fn member_from_row(row: &Row<'_>) -> rusqlite::Result<Member> {
    let signature: Option<String> = row.get(3)?;
    let status: String = row.get(4)?;
    let created_at: String = row.get(5)?;
    Ok(Member {
        id: row.get(0)?,
        name: row.get(1)?,
        email: row.get(2)?,
        face_signature: signature
            .map(|s| serde_json::from_str(&s))
            .transpose()
            .map_err(|e| conversion_error(3, e))?,
        status: status.parse().map_err(|e| conversion_error(4, e))?,
        created_at: parse_timestamp(&created_at).map_err(|e| conversion_error(5, e))?,
    })
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<AttendanceRecord> {
    let check_in_time: String = row.get(2)?;
    Ok(AttendanceRecord {
        id: row.get(0)?,
        member_id: row.get(1)?,
        check_in_time: parse_timestamp(&check_in_time).map_err(|e| conversion_error(2, e))?,
        member_name: row.get(3)?,
    })
}
