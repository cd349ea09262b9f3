// Marketplace query service - the lender-facing read side
// A denormalized, verified-only projection of SME records. Rows are replaced
// atomically on publish; readers never block on the per-SME write path.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use crate::error::{EngineError, EngineResult};
use crate::sme::{City, Industry, SmeRecord, VerificationStatus};

// ============================================================================
// VIEW ROW
// ============================================================================

/// Read-optimized projection of one verified SME.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketplaceRow {
    pub id: String,
    pub name: String,
    pub industry: Industry,
    pub location: City,
    pub pulse_score: u32,
    pub profit_score: u32,
    pub published_at: DateTime<Utc>,
}

impl MarketplaceRow {
    /// Project a record into the view. Only a verified record with both
    /// scores yields a row; anything else has no marketplace presence.
    pub fn from_record(record: &SmeRecord) -> Option<MarketplaceRow> {
        if record.status != VerificationStatus::Verified {
            return None;
        }
        let (pulse, profit) = match (record.pulse_score, record.profit_score) {
            (Some(pulse), Some(profit)) => (pulse, profit),
            _ => return None,
        };

        Some(MarketplaceRow {
            id: record.id.clone(),
            name: record.name.clone(),
            industry: record.industry,
            location: record.location,
            pulse_score: pulse,
            profit_score: profit,
            published_at: Utc::now(),
        })
    }
}

// ============================================================================
// FILTER
// ============================================================================

/// Explicit filter configuration. All provided filters AND together; absent
/// filters are no-ops. Unknown keys are rejected, not ignored.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MarketplaceFilter {
    pub industry: Option<Industry>,
    pub location: Option<City>,
    pub min_profit_score: Option<u32>,
}

impl MarketplaceFilter {
    pub fn none() -> Self {
        MarketplaceFilter::default()
    }

    /// Parse query parameters. Returns the filter plus the requested page
    /// (1-based, defaulting to 1).
    pub fn from_params(params: &HashMap<String, String>) -> EngineResult<(Self, usize)> {
        let mut filter = MarketplaceFilter::none();
        let mut page = 1usize;

        for (key, value) in params {
            match key.as_str() {
                "industry" => {
                    filter.industry = Some(Industry::parse(value).ok_or_else(|| {
                        EngineError::InvalidFilter(format!("unknown industry: {}", value))
                    })?);
                }
                "location" => {
                    filter.location = Some(City::parse(value).ok_or_else(|| {
                        EngineError::InvalidFilter(format!("unknown location: {}", value))
                    })?);
                }
                "min_profit_score" => {
                    let score: u32 = value.parse().map_err(|_| {
                        EngineError::InvalidFilter(format!("min_profit_score not a number: {}", value))
                    })?;
                    if score > 100 {
                        return Err(EngineError::InvalidFilter(
                            "min_profit_score out of range (0..=100)".to_string(),
                        ));
                    }
                    filter.min_profit_score = Some(score);
                }
                "page" => {
                    page = value.parse().map_err(|_| {
                        EngineError::InvalidFilter(format!("page not a number: {}", value))
                    })?;
                    if page == 0 {
                        return Err(EngineError::InvalidFilter("page is 1-based".to_string()));
                    }
                }
                other => {
                    return Err(EngineError::InvalidFilter(format!(
                        "unrecognized filter key: {}",
                        other
                    )));
                }
            }
        }

        Ok((filter, page))
    }

    pub fn matches(&self, row: &MarketplaceRow) -> bool {
        if let Some(industry) = self.industry {
            if row.industry != industry {
                return false;
            }
        }
        if let Some(location) = self.location {
            if row.location != location {
                return false;
            }
        }
        if let Some(min) = self.min_profit_score {
            if row.profit_score < min {
                return false;
            }
        }
        true
    }
}

// ============================================================================
// PAGINATION
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct PageResult<T> {
    pub items: Vec<T>,
    pub page: usize,
    pub per_page: usize,
    pub total_items: usize,
    pub total_pages: usize,
}

// ============================================================================
// VIEW
// ============================================================================

/// The published view: single authoritative writer (the state machine's
/// publish step), many concurrent readers. Each publish replaces a whole row,
/// so readers never observe a half-updated pair of scores.
#[derive(Debug, Default)]
pub struct MarketplaceView {
    rows: RwLock<HashMap<String, MarketplaceRow>>,
    version: AtomicU64,
}

impl MarketplaceView {
    pub fn new() -> Self {
        MarketplaceView::default()
    }

    /// Publish or replace one SME's row atomically.
    pub fn publish(&self, row: MarketplaceRow) {
        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::info!(sme_id = %row.id, version, "marketplace row published");
        self.rows.write().unwrap().insert(row.id.clone(), row);
    }

    /// Remove an SME from the view (failed or re-entered verification).
    pub fn retract(&self, sme_id: &str) -> bool {
        let removed = self.rows.write().unwrap().remove(sme_id).is_some();
        if removed {
            self.version.fetch_add(1, Ordering::SeqCst);
            tracing::info!(sme_id, "marketplace row retracted");
        }
        removed
    }

    /// Filtered, stably-ordered, paginated listing. Ordering is pulse score
    /// descending with id as the tiebreak, so unchanged data pages the same
    /// way every time.
    pub fn query(
        &self,
        filter: &MarketplaceFilter,
        page: usize,
        per_page: usize,
    ) -> PageResult<MarketplaceRow> {
        let rows = self.rows.read().unwrap();
        let mut matched: Vec<MarketplaceRow> = rows
            .values()
            .filter(|row| filter.matches(row))
            .cloned()
            .collect();
        drop(rows);

        matched.sort_by(|a, b| {
            b.pulse_score
                .cmp(&a.pulse_score)
                .then_with(|| a.id.cmp(&b.id))
        });

        let total_items = matched.len();
        let per_page = per_page.max(1);
        let total_pages = total_items.div_ceil(per_page);
        let page = page.max(1);

        let items = matched
            .into_iter()
            .skip((page - 1) * per_page)
            .take(per_page)
            .collect();

        PageResult {
            items,
            page,
            per_page,
            total_items,
            total_pages,
        }
    }

    /// Single-row lookup. None for anything unpublished, including SMEs that
    /// exist but are not verified - invisible is the contract.
    pub fn get_detail(&self, sme_id: &str) -> Option<MarketplaceRow> {
        self.rows.read().unwrap().get(sme_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.rows.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.read().unwrap().is_empty()
    }

    /// Monotonic publish counter; bumps on every publish/retract.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }
}
