// Verification state machine - per-SME lifecycle controller
// pending -> verified | failed, exactly one terminal transition per cycle.
// Re-submission from a terminal state opens a fresh cycle; the closed cycle
// is never mutated in place.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::ScoringConfig;
use crate::error::{EngineError, EngineResult};
use crate::evidence::{CycleEvidence, EvidenceItem, EvidenceKind, ReviewOutcome};
use crate::ledger::LedgerSnapshot;
use crate::scoring::{compute_scores, EvidenceSnapshot, ScorePair};
use crate::sme::{SmeRecord, VerificationStatus};

// ============================================================================
// CYCLE
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleClosure {
    pub status: VerificationStatus,
    pub reason: Option<String>,
    pub at: DateTime<Utc>,
}

/// One verification attempt: its evidence set and, once closed, its outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationCycle {
    pub number: u32,
    pub evidence: CycleEvidence,
    pub scores: Option<ScorePair>,
    pub opened_at: DateTime<Utc>,
    pub closure: Option<CycleClosure>,
}

impl VerificationCycle {
    pub fn new(number: u32) -> Self {
        VerificationCycle {
            number,
            evidence: CycleEvidence::new(number),
            scores: None,
            opened_at: Utc::now(),
            closure: None,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closure.is_some()
    }
}

// ============================================================================
// ADVANCE OUTCOME
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum AdvanceOutcome {
    Verified(ScorePair),
    Failed(String),
    Pending(PendingReason),
}

#[derive(Debug, Clone, PartialEq)]
pub enum PendingReason {
    /// Required kinds not yet submitted or not yet accepted.
    MissingEvidence(Vec<EvidenceKind>),

    /// Evidence complete but the ledger window is still too short.
    AwaitingLedger { months: u32, required: u32 },
}

// ============================================================================
// SME STATE
// ============================================================================

/// The authoritative per-SME state: record plus current cycle. The engine
/// reaches it only through the per-SME mutex, so every method here runs
/// serialized for a given id.
#[derive(Debug)]
pub struct SmeState {
    pub record: SmeRecord,
    pub cycle: VerificationCycle,

    /// Current link token for ledger refresh. Kept in memory only.
    pub link_token: Option<String>,
}

impl SmeState {
    pub fn new(record: SmeRecord) -> Self {
        let cycle = VerificationCycle::new(record.cycle);
        SmeState {
            record,
            cycle,
            link_token: None,
        }
    }

    /// Rebuild state from persisted rows at startup. A terminal record gets a
    /// closed cycle so restart cannot re-open an already-decided attempt.
    pub fn restore(record: SmeRecord, items: Vec<EvidenceItem>) -> Self {
        let mut cycle = VerificationCycle::new(record.cycle);
        cycle.opened_at = record.updated_at;
        cycle.evidence = CycleEvidence::from_items(record.cycle, items);

        if record.status.is_terminal() {
            cycle.scores = match (record.pulse_score, record.profit_score) {
                (Some(pulse), Some(profit)) => Some(ScorePair { pulse, profit }),
                _ => None,
            };
            cycle.closure = Some(CycleClosure {
                status: record.status,
                reason: record.failure_reason.clone(),
                at: record.updated_at,
            });
        }

        SmeState {
            record,
            cycle,
            link_token: None,
        }
    }

    /// Open a fresh verification attempt. The terminal cycle stays closed;
    /// the record re-enters pending with scores cleared.
    pub fn begin_new_cycle(&mut self) {
        let next = self.record.cycle + 1;
        tracing::info!(sme_id = %self.record.id, cycle = next, "opening new verification cycle");

        self.record.cycle = next;
        self.record.status = VerificationStatus::Pending;
        self.record.pulse_score = None;
        self.record.profit_score = None;
        self.record.failure_reason = None;
        self.record.updated_at = Utc::now();
        self.cycle = VerificationCycle::new(next);
        self.link_token = None;
    }

    /// Store an evidence item in the current cycle. A submission against a
    /// terminal record implicitly opens the next cycle.
    pub fn submit(&mut self, item: EvidenceItem) -> EngineResult<EvidenceItem> {
        if self.record.status.is_terminal() {
            self.begin_new_cycle();
        }

        let mut item = item;
        item.cycle = self.cycle.number;
        self.cycle.evidence.submit(item.clone())?;
        self.record.updated_at = Utc::now();
        Ok(item)
    }

    /// Evaluate the cycle. Idempotent: a closed cycle reports its terminal
    /// outcome again without re-transitioning.
    pub fn evaluate(&mut self, ledger: &LedgerSnapshot, config: &ScoringConfig) -> AdvanceOutcome {
        if let Some(closure) = &self.cycle.closure {
            return match closure.status {
                VerificationStatus::Verified => {
                    // A verified closure always carries scores; fall back to
                    // the record copy rather than panic.
                    let scores = self.cycle.scores.unwrap_or(ScorePair {
                        pulse: self.record.pulse_score.unwrap_or(0),
                        profit: self.record.profit_score.unwrap_or(0),
                    });
                    AdvanceOutcome::Verified(scores)
                }
                _ => AdvanceOutcome::Failed(
                    closure.reason.clone().unwrap_or_else(|| "rejected".to_string()),
                ),
            };
        }

        // An explicit rejection always wins over a late-arriving score.
        if let Some(rejected) = self.cycle.evidence.first_rejection() {
            let reason = format!(
                "{} rejected: {}",
                rejected.kind.as_str(),
                rejected
                    .reject_reason
                    .clone()
                    .unwrap_or_else(|| "review failed".to_string())
            );
            self.close(VerificationStatus::Failed, Some(reason.clone()), None);
            return AdvanceOutcome::Failed(reason);
        }

        let missing = self.cycle.evidence.missing_kinds();
        if !missing.is_empty() {
            return AdvanceOutcome::Pending(PendingReason::MissingEvidence(missing));
        }

        let snapshot =
            EvidenceSnapshot::from_cycle(&self.cycle.evidence, self.record.profile_complete());
        match compute_scores(&snapshot, ledger, config) {
            Ok(scores) => {
                self.close(VerificationStatus::Verified, None, Some(scores));
                AdvanceOutcome::Verified(scores)
            }
            // Not a failure: the SME may link more history later.
            Err(EngineError::InsufficientData { months, required }) => {
                AdvanceOutcome::Pending(PendingReason::AwaitingLedger { months, required })
            }
            Err(err) => {
                tracing::error!(sme_id = %self.record.id, error = %err, "scoring error");
                AdvanceOutcome::Pending(PendingReason::AwaitingLedger {
                    months: 0,
                    required: config.min_history_months,
                })
            }
        }
    }

    /// Explicit failure path. Returns false when the cycle is already closed
    /// (the terminal transition already happened; nothing is overwritten).
    pub fn reject(&mut self, reason: &str) -> bool {
        if self.cycle.is_closed() {
            tracing::debug!(sme_id = %self.record.id, cycle = self.cycle.number, "reject on closed cycle ignored");
            return false;
        }
        self.close(VerificationStatus::Failed, Some(reason.to_string()), None);
        true
    }

    /// Record the outcome of a linked-account review if the fingerprint is
    /// still current. Used by the provider refresh path.
    pub fn mark_link_outcome(
        &mut self,
        fingerprint: &str,
        outcome: ReviewOutcome,
        reject_reason: Option<String>,
    ) -> bool {
        self.cycle.evidence.mark_outcome(
            EvidenceKind::LinkedAccountToken,
            fingerprint,
            outcome,
            reject_reason,
        )
    }

    fn close(
        &mut self,
        status: VerificationStatus,
        reason: Option<String>,
        scores: Option<ScorePair>,
    ) {
        debug_assert!(!self.cycle.is_closed(), "cycle closed twice");

        let now = Utc::now();
        self.cycle.scores = scores;
        self.cycle.closure = Some(CycleClosure {
            status,
            reason: reason.clone(),
            at: now,
        });

        self.record.status = status;
        self.record.failure_reason = reason;
        self.record.pulse_score = scores.map(|s| s.pulse);
        self.record.profit_score = scores.map(|s| s.profit);
        self.record.updated_at = now;

        tracing::info!(
            sme_id = %self.record.id,
            cycle = self.cycle.number,
            status = self.record.status.as_str(),
            "verification cycle closed"
        );
    }
}
