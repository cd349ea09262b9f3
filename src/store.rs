// SQLite persistence - system of record for SMEs, accounts, evidence,
// transactions, and the audit trail. WAL mode for crash recovery. Inserts
// that hit a UNIQUE constraint count as duplicates, not errors.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use crate::auth::{UserAccount, UserRole};
use crate::evidence::{EvidenceItem, EvidenceKind, ReviewOutcome};
use crate::ledger::{TxnDirection, TxnRecord};
use crate::sme::{City, Industry, SmeRecord, VerificationStatus};

pub fn setup_database(conn: &Connection) -> Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.busy_timeout(std::time::Duration::from_secs(5))?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS smes (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            email TEXT NOT NULL,
            industry TEXT NOT NULL,
            location TEXT NOT NULL,
            founded_date TEXT,
            description TEXT NOT NULL,
            status TEXT NOT NULL,
            pulse_score INTEGER,
            profit_score INTEGER,
            cycle INTEGER NOT NULL,
            failure_reason TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS users (
            id TEXT PRIMARY KEY,
            email TEXT UNIQUE NOT NULL,
            role TEXT NOT NULL,
            company TEXT,
            credential_hash TEXT NOT NULL,
            salt TEXT NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS evidence (
            id TEXT PRIMARY KEY,
            sme_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            fingerprint TEXT NOT NULL,
            cycle INTEGER NOT NULL,
            outcome TEXT NOT NULL,
            superseded INTEGER NOT NULL DEFAULT 0,
            reject_reason TEXT,
            submitted_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS transactions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            sme_id TEXT NOT NULL,
            external_id TEXT NOT NULL,
            amount REAL NOT NULL,
            direction TEXT NOT NULL,
            timestamp TEXT NOT NULL,
            category TEXT,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
            UNIQUE(sme_id, external_id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT UNIQUE NOT NULL,
            timestamp TEXT NOT NULL,
            event_type TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            data TEXT NOT NULL,
            actor TEXT NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_evidence_sme_cycle ON evidence(sme_id, cycle)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_transactions_sme ON transactions(sme_id, timestamp)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_events_entity ON events(entity_type, entity_id)",
        [],
    )?;

    Ok(())
}

// ============================================================================
// SME RECORDS
// ============================================================================

pub fn upsert_sme(conn: &Connection, record: &SmeRecord) -> Result<()> {
    conn.execute(
        "INSERT INTO smes (
            id, name, email, industry, location, founded_date, description,
            status, pulse_score, profit_score, cycle, failure_reason,
            created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
        ON CONFLICT(id) DO UPDATE SET
            name = excluded.name,
            email = excluded.email,
            industry = excluded.industry,
            location = excluded.location,
            founded_date = excluded.founded_date,
            description = excluded.description,
            status = excluded.status,
            pulse_score = excluded.pulse_score,
            profit_score = excluded.profit_score,
            cycle = excluded.cycle,
            failure_reason = excluded.failure_reason,
            updated_at = excluded.updated_at",
        params![
            record.id,
            record.name,
            record.email,
            record.industry.as_str(),
            record.location.as_str(),
            record.founded_date.map(|d| d.to_string()),
            record.description,
            record.status.as_str(),
            record.pulse_score,
            record.profit_score,
            record.cycle,
            record.failure_reason,
            record.created_at.to_rfc3339(),
            record.updated_at.to_rfc3339(),
        ],
    )
    .context("Failed to upsert SME record")?;

    Ok(())
}

fn sme_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SmeRecord> {
    let industry_str: String = row.get(3)?;
    let location_str: String = row.get(4)?;
    let founded_str: Option<String> = row.get(5)?;
    let status_str: String = row.get(7)?;
    let created_str: String = row.get(12)?;
    let updated_str: String = row.get(13)?;

    Ok(SmeRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        email: row.get(2)?,
        industry: Industry::parse(&industry_str).ok_or(rusqlite::Error::InvalidQuery)?,
        location: City::parse(&location_str).ok_or(rusqlite::Error::InvalidQuery)?,
        founded_date: founded_str.and_then(|s| NaiveDate::parse_from_str(&s, "%Y-%m-%d").ok()),
        description: row.get(6)?,
        status: VerificationStatus::parse(&status_str).ok_or(rusqlite::Error::InvalidQuery)?,
        pulse_score: row.get(8)?,
        profit_score: row.get(9)?,
        cycle: row.get(10)?,
        failure_reason: row.get(11)?,
        created_at: parse_rfc3339(&created_str)?,
        updated_at: parse_rfc3339(&updated_str)?,
    })
}

fn parse_rfc3339(value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| rusqlite::Error::InvalidQuery)
}

const SME_COLUMNS: &str = "id, name, email, industry, location, founded_date, description, \
     status, pulse_score, profit_score, cycle, failure_reason, created_at, updated_at";

pub fn get_sme(conn: &Connection, sme_id: &str) -> Result<Option<SmeRecord>> {
    let mut stmt = conn.prepare(&format!("SELECT {} FROM smes WHERE id = ?1", SME_COLUMNS))?;
    let mut rows = stmt.query_map(params![sme_id], sme_from_row)?;
    match rows.next() {
        Some(row) => Ok(Some(row?)),
        None => Ok(None),
    }
}

pub fn get_all_smes(conn: &Connection) -> Result<Vec<SmeRecord>> {
    let mut stmt = conn.prepare(&format!("SELECT {} FROM smes ORDER BY created_at", SME_COLUMNS))?;
    let records = stmt
        .query_map([], sme_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(records)
}

pub fn count_smes(conn: &Connection) -> Result<i64> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM smes", [], |row| row.get(0))?;
    Ok(count)
}

// ============================================================================
// USER ACCOUNTS
// ============================================================================

/// Returns false when the email is already registered.
pub fn insert_user(conn: &Connection, account: &UserAccount) -> Result<bool> {
    let result = conn.execute(
        "INSERT INTO users (id, email, role, company, credential_hash, salt, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            account.id,
            account.email.trim().to_lowercase(),
            account.role.as_str(),
            account.company,
            account.credential_hash,
            account.salt,
            account.created_at.to_rfc3339(),
        ],
    );

    match result {
        Ok(_) => Ok(true),
        Err(rusqlite::Error::SqliteFailure(err, _))
            if err.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            Ok(false)
        }
        Err(e) => Err(e.into()),
    }
}

pub fn get_all_users(conn: &Connection) -> Result<Vec<UserAccount>> {
    let mut stmt = conn.prepare(
        "SELECT id, email, role, company, credential_hash, salt, created_at FROM users",
    )?;

    let accounts = stmt
        .query_map([], |row| {
            let role_str: String = row.get(2)?;
            let created_str: String = row.get(6)?;
            Ok(UserAccount {
                id: row.get(0)?,
                email: row.get(1)?,
                role: UserRole::parse(&role_str).ok_or(rusqlite::Error::InvalidQuery)?,
                company: row.get(3)?,
                credential_hash: row.get(4)?,
                salt: row.get(5)?,
                created_at: parse_rfc3339(&created_str)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(accounts)
}

pub fn count_users(conn: &Connection) -> Result<i64> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))?;
    Ok(count)
}

// ============================================================================
// EVIDENCE
// ============================================================================

pub fn upsert_evidence(conn: &Connection, item: &EvidenceItem) -> Result<()> {
    conn.execute(
        "INSERT INTO evidence (
            id, sme_id, kind, fingerprint, cycle, outcome, superseded,
            reject_reason, submitted_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        ON CONFLICT(id) DO UPDATE SET
            outcome = excluded.outcome,
            superseded = excluded.superseded,
            reject_reason = excluded.reject_reason",
        params![
            item.id,
            item.sme_id,
            item.kind.as_str(),
            item.fingerprint,
            item.cycle,
            item.outcome.as_str(),
            item.superseded as i64,
            item.reject_reason,
            item.submitted_at.to_rfc3339(),
        ],
    )
    .context("Failed to upsert evidence item")?;

    Ok(())
}

pub fn get_evidence_for_sme(conn: &Connection, sme_id: &str) -> Result<Vec<EvidenceItem>> {
    let mut stmt = conn.prepare(
        "SELECT id, sme_id, kind, fingerprint, cycle, outcome, superseded,
                reject_reason, submitted_at
         FROM evidence WHERE sme_id = ?1 ORDER BY submitted_at",
    )?;

    let items = stmt
        .query_map(params![sme_id], |row| {
            let kind_str: String = row.get(2)?;
            let outcome_str: String = row.get(5)?;
            let superseded: i64 = row.get(6)?;
            let submitted_str: String = row.get(8)?;
            Ok(EvidenceItem {
                id: row.get(0)?,
                sme_id: row.get(1)?,
                kind: EvidenceKind::parse(&kind_str).ok_or(rusqlite::Error::InvalidQuery)?,
                fingerprint: row.get(3)?,
                cycle: row.get(4)?,
                outcome: ReviewOutcome::parse(&outcome_str).ok_or(rusqlite::Error::InvalidQuery)?,
                superseded: superseded != 0,
                reject_reason: row.get(7)?,
                submitted_at: parse_rfc3339(&submitted_str)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(items)
}

// ============================================================================
// TRANSACTIONS
// ============================================================================

/// Idempotent batch insert. Duplicates (same sme_id + external_id) are
/// skipped via the UNIQUE constraint and reported in the count only.
pub fn insert_transactions(conn: &Connection, sme_id: &str, records: &[TxnRecord]) -> Result<usize> {
    let mut inserted = 0;
    let mut duplicates = 0;

    for record in records {
        let result = conn.execute(
            "INSERT INTO transactions (sme_id, external_id, amount, direction, timestamp, category)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                sme_id,
                record.external_id,
                record.amount,
                record.direction.as_str(),
                record.timestamp.to_rfc3339(),
                record.category,
            ],
        );

        match result {
            Ok(_) => inserted += 1,
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                duplicates += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }

    tracing::debug!(sme_id, inserted, duplicates, "transaction batch stored");
    Ok(inserted)
}

pub fn get_transactions_for_sme(conn: &Connection, sme_id: &str) -> Result<Vec<TxnRecord>> {
    let mut stmt = conn.prepare(
        "SELECT external_id, amount, direction, timestamp, category
         FROM transactions WHERE sme_id = ?1 ORDER BY timestamp, id",
    )?;

    let records = stmt
        .query_map(params![sme_id], |row| {
            let direction_str: String = row.get(2)?;
            let timestamp_str: String = row.get(3)?;
            Ok(TxnRecord {
                external_id: row.get(0)?,
                amount: row.get(1)?,
                direction: TxnDirection::parse(&direction_str)
                    .ok_or(rusqlite::Error::InvalidQuery)?,
                timestamp: parse_rfc3339(&timestamp_str)?,
                category: row.get(4)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(records)
}

pub fn count_transactions(conn: &Connection, sme_id: &str) -> Result<i64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM transactions WHERE sme_id = ?1",
        params![sme_id],
        |row| row.get(0),
    )?;
    Ok(count)
}

pub fn count_all_transactions(conn: &Connection) -> Result<i64> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM transactions", [], |row| row.get(0))?;
    Ok(count)
}

// ============================================================================
// AUDIT TRAIL
// ============================================================================

/// Audit event: every accept, supersede, transition, and publish is recorded.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Event {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub entity_type: String,
    pub entity_id: String,
    pub data: serde_json::Value,
    pub actor: String,
}

impl Event {
    pub fn new(
        event_type: &str,
        entity_type: &str,
        entity_id: &str,
        data: serde_json::Value,
        actor: &str,
    ) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            data,
            actor: actor.to_string(),
        }
    }
}

pub fn insert_event(conn: &Connection, event: &Event) -> Result<()> {
    let data_json = serde_json::to_string(&event.data)?;

    conn.execute(
        "INSERT INTO events (event_id, timestamp, event_type, entity_type, entity_id, data, actor)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            event.event_id,
            event.timestamp.to_rfc3339(),
            event.event_type,
            event.entity_type,
            event.entity_id,
            data_json,
            event.actor,
        ],
    )?;

    Ok(())
}

pub fn get_events_for_entity(
    conn: &Connection,
    entity_type: &str,
    entity_id: &str,
) -> Result<Vec<Event>> {
    let mut stmt = conn.prepare(
        "SELECT event_id, timestamp, event_type, entity_type, entity_id, data, actor
         FROM events
         WHERE entity_type = ?1 AND entity_id = ?2
         ORDER BY timestamp DESC",
    )?;

    let events = stmt
        .query_map(params![entity_type, entity_id], |row| {
            let timestamp_str: String = row.get(1)?;
            let data_json: String = row.get(5)?;

            Ok(Event {
                event_id: row.get(0)?,
                timestamp: parse_rfc3339(&timestamp_str)?,
                event_type: row.get(2)?,
                entity_type: row.get(3)?,
                entity_id: row.get(4)?,
                data: serde_json::from_str(&data_json)
                    .map_err(|_| rusqlite::Error::InvalidQuery)?,
                actor: row.get(6)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evidence::fingerprint;
    use crate::sme::SmeProfile;
    use chrono::TimeZone;

    fn create_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        conn
    }

    fn create_record() -> SmeRecord {
        SmeRecord::new(
            "owner@acme.test".to_string(),
            SmeProfile {
                name: "Acme Stores".to_string(),
                industry: Industry::Retail,
                location: City::Lagos,
                founded_date: NaiveDate::from_ymd_opt(2019, 6, 1),
                description: "Neighborhood retail chain".to_string(),
            },
        )
    }

    fn create_txn(external_id: &str) -> TxnRecord {
        TxnRecord {
            external_id: external_id.to_string(),
            amount: 250.0,
            direction: TxnDirection::Credit,
            timestamp: Utc.with_ymd_and_hms(2025, 2, 14, 9, 30, 0).unwrap(),
            category: Some("sales".to_string()),
        }
    }

    #[test]
    fn test_sme_roundtrip_and_upsert() {
        let conn = create_conn();
        let mut record = create_record();
        upsert_sme(&conn, &record).unwrap();

        let loaded = get_sme(&conn, &record.id).unwrap().unwrap();
        assert_eq!(loaded.name, "Acme Stores");
        assert_eq!(loaded.industry, Industry::Retail);
        assert_eq!(loaded.founded_date, NaiveDate::from_ymd_opt(2019, 6, 1));
        assert_eq!(loaded.status, VerificationStatus::Pending);

        record.status = VerificationStatus::Verified;
        record.pulse_score = Some(88);
        record.profit_score = Some(74);
        upsert_sme(&conn, &record).unwrap();

        let updated = get_sme(&conn, &record.id).unwrap().unwrap();
        assert_eq!(updated.status, VerificationStatus::Verified);
        assert_eq!(updated.pulse_score, Some(88));
        assert_eq!(count_smes(&conn).unwrap(), 1);
    }

    #[test]
    fn test_user_duplicate_email_reported_not_errored() {
        let conn = create_conn();
        let first = UserAccount::new(
            "u1".to_string(),
            "a@b.test".to_string(),
            UserRole::Lender,
            "pw",
            None,
        );
        let second = UserAccount::new(
            "u2".to_string(),
            "a@b.test".to_string(),
            UserRole::Sme,
            "pw",
            None,
        );

        assert!(insert_user(&conn, &first).unwrap());
        assert!(!insert_user(&conn, &second).unwrap());
        assert_eq!(get_all_users(&conn).unwrap().len(), 1);
    }

    #[test]
    fn test_evidence_roundtrip_with_outcome_update() {
        let conn = create_conn();
        let mut item = EvidenceItem::new(
            "sme-1",
            EvidenceKind::LinkedAccountToken,
            fingerprint(b"token"),
            1,
            ReviewOutcome::Pending,
        );
        upsert_evidence(&conn, &item).unwrap();

        item.outcome = ReviewOutcome::Accepted;
        upsert_evidence(&conn, &item).unwrap();

        let items = get_evidence_for_sme(&conn, "sme-1").unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].outcome, ReviewOutcome::Accepted);
        assert_eq!(items[0].kind, EvidenceKind::LinkedAccountToken);
    }

    #[test]
    fn test_transaction_replay_is_idempotent() {
        let conn = create_conn();
        let batch = vec![create_txn("tx-1"), create_txn("tx-2")];

        assert_eq!(insert_transactions(&conn, "sme-1", &batch).unwrap(), 2);
        assert_eq!(insert_transactions(&conn, "sme-1", &batch).unwrap(), 0);
        assert_eq!(count_transactions(&conn, "sme-1").unwrap(), 2);

        // Same external id under a different SME is a distinct record.
        assert_eq!(insert_transactions(&conn, "sme-2", &batch).unwrap(), 2);
    }

    #[test]
    fn test_event_audit_trail() {
        let conn = create_conn();
        let event = Event::new(
            "evidence_accepted",
            "sme",
            "sme-1",
            serde_json::json!({"kind": "attestation-video"}),
            "engine",
        );
        insert_event(&conn, &event).unwrap();

        let events = get_events_for_entity(&conn, "sme", "sme-1").unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "evidence_accepted");
    }
}
