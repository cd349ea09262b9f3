// Transaction ledger cache - append-only, deduplicated, time-ordered history
// Dedup key is the provider's external transaction id. Scoring only ever reads
// an immutable snapshot, never the mutating live set.

use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;

// ============================================================================
// TRANSACTION RECORD
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxnDirection {
    Credit,
    Debit,
}

impl TxnDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxnDirection::Credit => "credit",
            TxnDirection::Debit => "debit",
        }
    }

    pub fn parse(value: &str) -> Option<TxnDirection> {
        match value.trim().to_lowercase().as_str() {
            "credit" => Some(TxnDirection::Credit),
            "debit" => Some(TxnDirection::Debit),
            _ => None,
        }
    }
}

/// One normalized transaction from the linked-account feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxnRecord {
    /// Provider-assigned id. Dedup key: never stored twice for one SME.
    pub external_id: String,

    /// Absolute amount; direction carries the sign.
    pub amount: f64,

    pub direction: TxnDirection,
    pub timestamp: DateTime<Utc>,
    pub category: Option<String>,
}

// ============================================================================
// PER-SME LEDGER
// ============================================================================

/// Mutable per-SME transaction set. Merge is idempotent under replay and
/// never reorders previously stored records.
#[derive(Debug, Default)]
pub struct SmeLedger {
    records: Vec<TxnRecord>,
    seen: HashSet<String>,
}

impl SmeLedger {
    pub fn new() -> Self {
        SmeLedger::default()
    }

    /// Merge a batch by external id. Returns how many records were new.
    pub fn merge(&mut self, batch: Vec<TxnRecord>) -> usize {
        let mut inserted = 0;
        for record in batch {
            if self.seen.contains(&record.external_id) {
                continue;
            }
            self.seen.insert(record.external_id.clone());
            self.records.push(record);
            inserted += 1;
        }
        if inserted > 0 {
            // Stable sort: equal timestamps keep their stored order.
            self.records.sort_by_key(|r| r.timestamp);
        }
        inserted
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Immutable view of everything at or before `as_of`.
    pub fn snapshot(&self, as_of: DateTime<Utc>) -> LedgerSnapshot {
        LedgerSnapshot {
            as_of,
            records: self
                .records
                .iter()
                .filter(|r| r.timestamp <= as_of)
                .cloned()
                .collect(),
        }
    }
}

// ============================================================================
// SNAPSHOT
// ============================================================================

/// Frozen, time-ordered view handed to the scoring engine.
#[derive(Debug, Clone)]
pub struct LedgerSnapshot {
    pub as_of: DateTime<Utc>,
    records: Vec<TxnRecord>,
}

impl LedgerSnapshot {
    pub fn empty(as_of: DateTime<Utc>) -> Self {
        LedgerSnapshot {
            as_of,
            records: Vec::new(),
        }
    }

    pub fn records(&self) -> &[TxnRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Distinct calendar months covered by the history.
    pub fn months_of_history(&self) -> u32 {
        let months: BTreeSet<(i32, u32)> = self
            .records
            .iter()
            .map(|r| (r.timestamp.year(), r.timestamp.month()))
            .collect();
        months.len() as u32
    }

    pub fn total_credits(&self) -> f64 {
        self.records
            .iter()
            .filter(|r| r.direction == TxnDirection::Credit)
            .map(|r| r.amount.abs())
            .sum()
    }

    pub fn total_debits(&self) -> f64 {
        self.records
            .iter()
            .filter(|r| r.direction == TxnDirection::Debit)
            .map(|r| r.amount.abs())
            .sum()
    }

    /// Per-month (credits, debits) in chronological order.
    pub fn monthly_flows(&self) -> Vec<(f64, f64)> {
        let mut months: BTreeMap<(i32, u32), (f64, f64)> = BTreeMap::new();
        for record in &self.records {
            let key = (record.timestamp.year(), record.timestamp.month());
            let entry = months.entry(key).or_insert((0.0, 0.0));
            match record.direction {
                TxnDirection::Credit => entry.0 += record.amount.abs(),
                TxnDirection::Debit => entry.1 += record.amount.abs(),
            }
        }
        months.into_values().collect()
    }
}

// ============================================================================
// CSV FEED BACKFILL
// ============================================================================

/// Row of a normalized feed export, for offline backfill through the same
/// idempotent ingestion path.
#[derive(Debug, Deserialize)]
struct FeedRow {
    #[serde(rename = "External_Id")]
    external_id: String,

    #[serde(rename = "Amount")]
    amount: f64,

    #[serde(rename = "Direction")]
    direction: String,

    #[serde(rename = "Timestamp")]
    timestamp: String,

    #[serde(rename = "Category")]
    category: Option<String>,
}

pub fn load_feed_csv(csv_path: &Path) -> Result<Vec<TxnRecord>> {
    let mut rdr = csv::Reader::from_path(csv_path).context("Failed to open feed CSV")?;

    let mut records = Vec::new();
    for result in rdr.deserialize() {
        let row: FeedRow = result.context("Failed to deserialize feed row")?;

        let direction = TxnDirection::parse(&row.direction)
            .with_context(|| format!("Unknown direction: {}", row.direction))?;
        let timestamp = DateTime::parse_from_rfc3339(&row.timestamp)
            .with_context(|| format!("Bad timestamp: {}", row.timestamp))?
            .with_timezone(&Utc);

        records.push(TxnRecord {
            external_id: row.external_id,
            amount: row.amount,
            direction,
            timestamp,
            category: row.category.filter(|c| !c.is_empty()),
        });
    }

    Ok(records)
}
