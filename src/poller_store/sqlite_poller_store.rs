use super::schema::POLLER_VERSIONED_SCHEMAS;
use super::SubjectRegistry;
use crate::poller::{
    DeliveryOutcome, DeliveryRecord, DeliveryRecordStore, Recipient, RecipientStore,
    SubjectStore, TrackedSubject, Watermark, WatermarkKind,
};
use crate::sqlite_persistence::open_versioned;
use anyhow::{bail, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

const SUBJECT_COLUMNS: &str = "id, label, target, selector, kind, missing_since";

pub struct SqlitePollerStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqlitePollerStore {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let path = db_path.as_ref();
        if !path.exists() {
            info!("Creating new poller database at {:?}", path);
        }
        let mut conn = Connection::open(path)
            .with_context(|| format!("Failed to open poller database {:?}", path))?;
        open_versioned(&mut conn, POLLER_VERSIONED_SCHEMAS)
            .with_context(|| format!("Failed to prepare poller database {:?}", path))?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Fixed-width RFC 3339 so stored timestamps sort lexicographically.
    fn format_datetime(dt: &DateTime<Utc>) -> String {
        dt.to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
    }

    fn row_to_subject(row: &rusqlite::Row) -> rusqlite::Result<TrackedSubject> {
        let kind_str: String = row.get("kind")?;
        let kind = WatermarkKind::parse(&kind_str).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                4,
                rusqlite::types::Type::Text,
                format!("unknown watermark kind {}", kind_str).into(),
            )
        })?;
        let missing_since: Option<String> = row.get("missing_since")?;

        Ok(TrackedSubject {
            id: row.get("id")?,
            label: row.get("label")?,
            target: row.get("target")?,
            selector: row.get("selector")?,
            kind,
            missing_since: missing_since.as_deref().and_then(Self::parse_datetime),
        })
    }

    fn row_to_recipient(row: &rusqlite::Row) -> rusqlite::Result<Recipient> {
        Ok(Recipient {
            id: row.get("id")?,
            address: row.get("address")?,
            notifications_enabled: row.get::<_, i64>("notifications_enabled")? != 0,
        })
    }

    fn row_to_delivery(row: &rusqlite::Row) -> rusqlite::Result<DeliveryRecord> {
        let outcome_str: String = row.get("outcome")?;
        let first: String = row.get("first_attempt_at")?;
        let last: String = row.get("last_attempt_at")?;

        Ok(DeliveryRecord {
            subject_id: row.get("subject_id")?,
            change_id: row.get("change_id")?,
            recipient_id: row.get("recipient_id")?,
            outcome: DeliveryOutcome::parse(&outcome_str)
                .unwrap_or(DeliveryOutcome::TransientError),
            attempts: row.get::<_, i64>("attempts")?.max(0) as u32,
            last_error: row.get("last_error")?,
            first_attempt_at: Self::parse_datetime(&first).unwrap_or_else(Utc::now),
            last_attempt_at: Self::parse_datetime(&last).unwrap_or_else(Utc::now),
        })
    }

    fn read_watermark(conn: &Connection, subject_id: &str) -> Result<Option<Watermark>> {
        let row: Option<(String, String)> = conn
            .query_row(
                "SELECT kind, value FROM watermarks WHERE subject_id = ?1",
                params![subject_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let Some((kind_str, value)) = row else {
            return Ok(None);
        };
        let kind = WatermarkKind::parse(&kind_str)
            .with_context(|| format!("Unknown watermark kind {} for {}", kind_str, subject_id))?;
        let watermark = Watermark::parse(kind, &value)
            .with_context(|| format!("Corrupt {} watermark {:?} for {}", kind, value, subject_id))?;
        Ok(Some(watermark))
    }
}

impl SubjectStore for SqlitePollerStore {
    fn list_subjects(&self) -> Result<Vec<TrackedSubject>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM subjects ORDER BY id",
            SUBJECT_COLUMNS
        ))?;
        let subjects = stmt
            .query_map([], Self::row_to_subject)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(subjects)
    }

    fn get_watermark(&self, subject_id: &str) -> Result<Option<Watermark>> {
        let conn = self.conn.lock().unwrap();
        Self::read_watermark(&conn, subject_id)
    }

    fn set_watermark(&self, subject_id: &str, watermark: &Watermark) -> Result<bool> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        if let Some(current) = Self::read_watermark(&tx, subject_id)? {
            if !watermark.is_newer_than(&current) {
                debug!(
                    "Refusing to move {} from {} to {}",
                    subject_id, current, watermark
                );
                return Ok(false);
            }
        }

        tx.execute(
            "INSERT INTO watermarks (subject_id, kind, value, updated_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(subject_id) DO UPDATE SET
                kind = excluded.kind,
                value = excluded.value,
                updated_at = excluded.updated_at",
            params![
                subject_id,
                watermark.kind().as_str(),
                watermark.encode(),
                Self::format_datetime(&Utc::now()),
            ],
        )
        .with_context(|| format!("Failed to store watermark for {}", subject_id))?;
        tx.commit()?;
        Ok(true)
    }

    fn mark_missing(&self, subject_id: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            "UPDATE subjects SET missing_since = ?2 WHERE id = ?1 AND missing_since IS NULL",
            params![subject_id, Self::format_datetime(&Utc::now())],
        )?;
        Ok(updated > 0)
    }

    fn clear_missing(&self, subject_id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE subjects SET missing_since = NULL WHERE id = ?1",
            params![subject_id],
        )?;
        Ok(())
    }
}

impl RecipientStore for SqlitePollerStore {
    fn recipients_for(&self, subject_id: &str) -> Result<Vec<Recipient>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT r.id, r.address, r.notifications_enabled
             FROM recipients r
             JOIN subscriptions s ON s.recipient_id = r.id
             WHERE s.subject_id = ?1
             ORDER BY r.id",
        )?;
        let recipients = stmt
            .query_map(params![subject_id], Self::row_to_recipient)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(recipients)
    }
}

impl DeliveryRecordStore for SqlitePollerStore {
    fn has_succeeded(&self, subject_id: &str, change_id: &str, recipient_id: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM delivery_records
             WHERE subject_id = ?1 AND change_id = ?2 AND recipient_id = ?3 AND outcome = 'delivered'",
            params![subject_id, change_id, recipient_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn get_delivery(
        &self,
        subject_id: &str,
        change_id: &str,
        recipient_id: &str,
    ) -> Result<Option<DeliveryRecord>> {
        let conn = self.conn.lock().unwrap();
        let record = conn
            .query_row(
                "SELECT * FROM delivery_records
                 WHERE subject_id = ?1 AND change_id = ?2 AND recipient_id = ?3",
                params![subject_id, change_id, recipient_id],
                Self::row_to_delivery,
            )
            .optional()?;
        Ok(record)
    }

    fn record(
        &self,
        subject_id: &str,
        change_id: &str,
        recipient_id: &str,
        outcome: DeliveryOutcome,
        error: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let now = Self::format_datetime(&Utc::now());
        conn.execute(
            "INSERT INTO delivery_records
                (subject_id, change_id, recipient_id, outcome, attempts, last_error, first_attempt_at, last_attempt_at)
             VALUES (?1, ?2, ?3, ?4, 1, ?5, ?6, ?6)
             ON CONFLICT(subject_id, change_id, recipient_id) DO UPDATE SET
                outcome = excluded.outcome,
                attempts = delivery_records.attempts + 1,
                last_error = excluded.last_error,
                last_attempt_at = excluded.last_attempt_at
             WHERE delivery_records.outcome != 'delivered'",
            params![subject_id, change_id, recipient_id, outcome.as_str(), error, now],
        )
        .with_context(|| {
            format!(
                "Failed to record delivery of {} to {} for {}",
                change_id, recipient_id, subject_id
            )
        })?;
        Ok(())
    }

    fn prune_delivery_records(&self, before: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let deleted = conn.execute(
            "DELETE FROM delivery_records WHERE last_attempt_at < ?1",
            params![Self::format_datetime(&before)],
        )?;
        Ok(deleted)
    }
}

impl SubjectRegistry for SqlitePollerStore {
    fn add_subject(&self, subject: &TrackedSubject) -> Result<()> {
        if subject.id.trim().is_empty() {
            bail!("Subject id must not be empty");
        }
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO subjects (id, label, target, selector, kind) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                subject.id,
                subject.label,
                subject.target,
                subject.selector,
                subject.kind.as_str()
            ],
        )
        .with_context(|| format!("Failed to add subject {}", subject.id))?;
        Ok(())
    }

    fn remove_subject(&self, subject_id: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let deleted = conn.execute("DELETE FROM subjects WHERE id = ?1", params![subject_id])?;
        Ok(deleted > 0)
    }

    fn get_subject(&self, subject_id: &str) -> Result<Option<TrackedSubject>> {
        let conn = self.conn.lock().unwrap();
        let subject = conn
            .query_row(
                &format!("SELECT {} FROM subjects WHERE id = ?1", SUBJECT_COLUMNS),
                params![subject_id],
                Self::row_to_subject,
            )
            .optional()?;
        Ok(subject)
    }

    fn add_recipient(&self, recipient: &Recipient) -> Result<()> {
        if recipient.id.trim().is_empty() {
            bail!("Recipient id must not be empty");
        }
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO recipients (id, address, notifications_enabled) VALUES (?1, ?2, ?3)",
            params![
                recipient.id,
                recipient.address,
                recipient.notifications_enabled as i64
            ],
        )
        .with_context(|| format!("Failed to add recipient {}", recipient.id))?;
        Ok(())
    }

    fn remove_recipient(&self, recipient_id: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let deleted = conn.execute("DELETE FROM recipients WHERE id = ?1", params![recipient_id])?;
        Ok(deleted > 0)
    }

    fn set_notifications_enabled(&self, recipient_id: &str, enabled: bool) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            "UPDATE recipients SET notifications_enabled = ?2 WHERE id = ?1",
            params![recipient_id, enabled as i64],
        )?;
        Ok(updated > 0)
    }

    fn list_recipients(&self) -> Result<Vec<Recipient>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT id, address, notifications_enabled FROM recipients ORDER BY id")?;
        let recipients = stmt
            .query_map([], Self::row_to_recipient)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(recipients)
    }

    fn subscribe(&self, subject_id: &str, recipient_id: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO subscriptions (subject_id, recipient_id) VALUES (?1, ?2)",
                params![subject_id, recipient_id],
            )
            .with_context(|| format!("Failed to subscribe {} to {}", recipient_id, subject_id))?;
        Ok(inserted > 0)
    }

    fn unsubscribe(&self, subject_id: &str, recipient_id: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let deleted = conn.execute(
            "DELETE FROM subscriptions WHERE subject_id = ?1 AND recipient_id = ?2",
            params![subject_id, recipient_id],
        )?;
        Ok(deleted > 0)
    }

    fn list_missing_subjects(&self) -> Result<Vec<TrackedSubject>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM subjects WHERE missing_since IS NOT NULL ORDER BY missing_since",
            SUBJECT_COLUMNS
        ))?;
        let subjects = stmt
            .query_map([], Self::row_to_subject)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(subjects)
    }

    fn list_deliveries(&self, subject_id: &str) -> Result<Vec<DeliveryRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT * FROM delivery_records WHERE subject_id = ?1
             ORDER BY last_attempt_at DESC, id DESC",
        )?;
        let records = stmt
            .query_map(params![subject_id], Self::row_to_delivery)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }
}
