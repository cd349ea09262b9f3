// Scoring engine - pure computation over frozen inputs
// (EvidenceSnapshot, LedgerSnapshot) -> (pulse_score, profit_score).
// Deterministic: no clock, no randomness. Same inputs, same scores.

use serde::{Deserialize, Serialize};

use crate::config::ScoringConfig;
use crate::error::{EngineError, EngineResult};
use crate::evidence::{CycleEvidence, EvidenceKind, ReviewOutcome};
use crate::ledger::LedgerSnapshot;

// ============================================================================
// INPUTS / OUTPUTS
// ============================================================================

/// Boolean summary of the evidence a cycle has accepted.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EvidenceSnapshot {
    pub has_incorporation: bool,
    pub has_attestation: bool,
    pub account_linked: bool,
    pub profile_complete: bool,
}

impl EvidenceSnapshot {
    pub fn from_cycle(evidence: &CycleEvidence, profile_complete: bool) -> Self {
        let accepted = |kind: EvidenceKind| {
            evidence
                .current(kind)
                .map(|item| item.outcome == ReviewOutcome::Accepted)
                .unwrap_or(false)
        };

        EvidenceSnapshot {
            has_incorporation: accepted(EvidenceKind::IncorporationDocument),
            has_attestation: accepted(EvidenceKind::AttestationVideo),
            account_linked: accepted(EvidenceKind::LinkedAccountToken),
            profile_complete,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScorePair {
    pub pulse: u32,
    pub profit: u32,
}

// ============================================================================
// SCORING
// ============================================================================

// Pulse component weights: incorporation 25, attestation 22, bank link 20,
// profile consistency 20, activity regularity up to 13. Total caps at 100.
const PULSE_INCORPORATION: f64 = 25.0;
const PULSE_ATTESTATION: f64 = 22.0;
const PULSE_BANK_LINK: f64 = 20.0;
const PULSE_PROFILE: f64 = 20.0;
const PULSE_REGULARITY: f64 = 13.0;

// Profit component weights: margin 40, monthly cash-flow positivity 30,
// growth trend 30.
const PROFIT_MARGIN: f64 = 40.0;
const PROFIT_CASH_FLOW: f64 = 30.0;
const PROFIT_GROWTH: f64 = 30.0;

/// Compute both trust metrics, or fail with `InsufficientData` when the
/// ledger window is shorter than the configured minimum.
pub fn compute_scores(
    evidence: &EvidenceSnapshot,
    ledger: &LedgerSnapshot,
    config: &ScoringConfig,
) -> EngineResult<ScorePair> {
    let months = ledger.months_of_history();
    if months < config.min_history_months {
        return Err(EngineError::InsufficientData {
            months,
            required: config.min_history_months,
        });
    }

    Ok(ScorePair {
        pulse: pulse_score(evidence, ledger, months),
        profit: profit_score(ledger),
    })
}

fn pulse_score(evidence: &EvidenceSnapshot, ledger: &LedgerSnapshot, months: u32) -> u32 {
    let mut score = 0.0;

    if evidence.has_incorporation {
        score += PULSE_INCORPORATION;
    }
    if evidence.has_attestation {
        score += PULSE_ATTESTATION;
    }
    if evidence.account_linked {
        score += PULSE_BANK_LINK;
    }
    if evidence.profile_complete {
        score += PULSE_PROFILE;
    }

    // Regularity: fraction of covered months with at least one credit.
    let flows = ledger.monthly_flows();
    let active_months = flows.iter().filter(|(credits, _)| *credits > 0.0).count();
    if months > 0 {
        score += PULSE_REGULARITY * active_months as f64 / months as f64;
    }

    clamp_score(score)
}

fn profit_score(ledger: &LedgerSnapshot) -> u32 {
    let credits = ledger.total_credits();
    let debits = ledger.total_debits();

    // Margin: share of inflow kept after outflow.
    let margin = if credits > 0.0 {
        ((credits - debits) / credits).clamp(0.0, 1.0)
    } else {
        0.0
    };

    // Cash flow: fraction of months that closed positive.
    let flows = ledger.monthly_flows();
    let positive_months = flows.iter().filter(|(c, d)| c - d > 0.0).count();
    let cash_flow = if flows.is_empty() {
        0.0
    } else {
        positive_months as f64 / flows.len() as f64
    };

    // Growth: later-half inflow against earlier-half inflow, capped at 2x.
    let half = flows.len() / 2;
    let first_half: f64 = flows[..half].iter().map(|(c, _)| c).sum();
    let second_half: f64 = flows[half..].iter().map(|(c, _)| c).sum();
    let growth = if first_half > 0.0 {
        (second_half / first_half).min(2.0) / 2.0
    } else {
        0.5
    };

    clamp_score(margin * PROFIT_MARGIN + cash_flow * PROFIT_CASH_FLOW + growth * PROFIT_GROWTH)
}

fn clamp_score(raw: f64) -> u32 {
    (raw.round() as i64).clamp(0, 100) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{SmeLedger, TxnDirection, TxnRecord};
    use chrono::{TimeZone, Utc};

    fn full_evidence() -> EvidenceSnapshot {
        EvidenceSnapshot {
            has_incorporation: true,
            has_attestation: true,
            account_linked: true,
            profile_complete: true,
        }
    }

    fn config(min_months: u32) -> ScoringConfig {
        ScoringConfig {
            min_history_months: min_months,
        }
    }

    /// `months` of history: one credit and a smaller debit per month.
    fn create_ledger(months: u32) -> LedgerSnapshot {
        let mut ledger = SmeLedger::new();
        let mut batch = Vec::new();
        for m in 0..months {
            let ts = Utc
                .with_ymd_and_hms(2025, 1, 1, 0, 0, 0)
                .unwrap()
                .checked_add_months(chrono::Months::new(m))
                .unwrap();
            batch.push(TxnRecord {
                external_id: format!("credit-{}", m),
                amount: 1000.0 + m as f64 * 100.0,
                direction: TxnDirection::Credit,
                timestamp: ts,
                category: None,
            });
            batch.push(TxnRecord {
                external_id: format!("debit-{}", m),
                amount: 600.0,
                direction: TxnDirection::Debit,
                timestamp: ts,
                category: None,
            });
        }
        ledger.merge(batch);
        ledger.snapshot(Utc.with_ymd_and_hms(2026, 12, 31, 0, 0, 0).unwrap())
    }

    #[test]
    fn test_short_history_is_insufficient_data() {
        let err = compute_scores(&full_evidence(), &create_ledger(4), &config(6)).unwrap_err();
        match err {
            EngineError::InsufficientData { months, required } => {
                assert_eq!(months, 4);
                assert_eq!(required, 6);
            }
            other => panic!("expected InsufficientData, got {:?}", other),
        }
    }

    #[test]
    fn test_deterministic_for_identical_inputs() {
        let evidence = full_evidence();
        let ledger = create_ledger(8);
        let cfg = config(6);

        let first = compute_scores(&evidence, &ledger, &cfg).unwrap();
        let second = compute_scores(&evidence, &ledger, &cfg).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_scores_stay_in_bounds() {
        let pair = compute_scores(&full_evidence(), &create_ledger(24), &config(6)).unwrap();
        assert!(pair.pulse <= 100);
        assert!(pair.profit <= 100);
        assert!(pair.pulse > 0);
        assert!(pair.profit > 0);
    }

    #[test]
    fn test_missing_evidence_lowers_pulse() {
        let ledger = create_ledger(8);
        let cfg = config(6);

        let with_all = compute_scores(&full_evidence(), &ledger, &cfg).unwrap();
        let without_video = compute_scores(
            &EvidenceSnapshot {
                has_attestation: false,
                ..full_evidence()
            },
            &ledger,
            &cfg,
        )
        .unwrap();

        assert!(without_video.pulse < with_all.pulse);
        assert_eq!(without_video.profit, with_all.profit);
    }

    #[test]
    fn test_loss_making_ledger_scores_low_profit() {
        let mut ledger = SmeLedger::new();
        let mut batch = Vec::new();
        for m in 0..8u32 {
            let ts = Utc
                .with_ymd_and_hms(2025, 1, 1, 0, 0, 0)
                .unwrap()
                .checked_add_months(chrono::Months::new(m))
                .unwrap();
            batch.push(TxnRecord {
                external_id: format!("credit-{}", m),
                amount: 500.0,
                direction: TxnDirection::Credit,
                timestamp: ts,
                category: None,
            });
            batch.push(TxnRecord {
                external_id: format!("debit-{}", m),
                amount: 900.0,
                direction: TxnDirection::Debit,
                timestamp: ts,
                category: None,
            });
        }
        ledger.merge(batch);
        let losing = ledger.snapshot(Utc.with_ymd_and_hms(2026, 12, 31, 0, 0, 0).unwrap());

        let pair = compute_scores(&full_evidence(), &losing, &config(6)).unwrap();
        let healthy = compute_scores(&full_evidence(), &create_ledger(8), &config(6)).unwrap();
        assert!(pair.profit < healthy.profit);
    }
}
