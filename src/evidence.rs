// Evidence store - content-addressed submission artifacts per SME
// Fingerprint (sha256 of payload) is the dedup key; the UUID is identity.
// Re-submission of a kind supersedes the prior item; history is kept for audit.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

use crate::error::{EngineError, EngineResult};

// ============================================================================
// EVIDENCE KIND
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EvidenceKind {
    IncorporationDocument,
    AttestationVideo,
    LinkedAccountToken,
}

impl EvidenceKind {
    /// Every kind is required before a cycle can verify.
    pub const REQUIRED: [EvidenceKind; 3] = [
        EvidenceKind::IncorporationDocument,
        EvidenceKind::AttestationVideo,
        EvidenceKind::LinkedAccountToken,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EvidenceKind::IncorporationDocument => "incorporation-document",
            EvidenceKind::AttestationVideo => "attestation-video",
            EvidenceKind::LinkedAccountToken => "linked-account-token",
        }
    }

    pub fn parse(value: &str) -> Option<EvidenceKind> {
        EvidenceKind::REQUIRED
            .iter()
            .copied()
            .find(|k| k.as_str() == value)
    }
}

// ============================================================================
// REVIEW OUTCOME
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewOutcome {
    Pending,
    Accepted,
    Rejected,
}

impl ReviewOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewOutcome::Pending => "pending",
            ReviewOutcome::Accepted => "accepted",
            ReviewOutcome::Rejected => "rejected",
        }
    }

    pub fn parse(value: &str) -> Option<ReviewOutcome> {
        match value {
            "pending" => Some(ReviewOutcome::Pending),
            "accepted" => Some(ReviewOutcome::Accepted),
            "rejected" => Some(ReviewOutcome::Rejected),
            _ => None,
        }
    }
}

// ============================================================================
// EVIDENCE ITEM
// ============================================================================

/// One submitted artifact. Belongs to exactly one SME and one cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceItem {
    pub id: String,
    pub sme_id: String,
    pub kind: EvidenceKind,

    /// Content fingerprint (sha256 hex). Dedup key, NOT identity.
    pub fingerprint: String,

    pub cycle: u32,
    pub submitted_at: DateTime<Utc>,
    pub outcome: ReviewOutcome,

    /// A later submission of the same kind replaced this item for scoring.
    /// Superseded items stay on record for audit.
    pub superseded: bool,

    pub reject_reason: Option<String>,
}

impl EvidenceItem {
    pub fn new(
        sme_id: &str,
        kind: EvidenceKind,
        fingerprint: String,
        cycle: u32,
        outcome: ReviewOutcome,
    ) -> Self {
        EvidenceItem {
            id: uuid::Uuid::new_v4().to_string(),
            sme_id: sme_id.to_string(),
            kind,
            fingerprint,
            cycle,
            submitted_at: Utc::now(),
            outcome,
            superseded: false,
            reject_reason: None,
        }
    }
}

/// Content fingerprint for idempotent dedup.
pub fn fingerprint(payload: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    format!("{:x}", hasher.finalize())
}

// ============================================================================
// CYCLE EVIDENCE
// ============================================================================

/// The working evidence set of one verification cycle: at most one current
/// item per kind, plus the superseded history.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CycleEvidence {
    pub cycle: u32,
    current: HashMap<EvidenceKind, EvidenceItem>,
    history: Vec<EvidenceItem>,
}

impl CycleEvidence {
    pub fn new(cycle: u32) -> Self {
        CycleEvidence {
            cycle,
            current: HashMap::new(),
            history: Vec::new(),
        }
    }

    /// Submit an item. Fails with `DuplicateEvidence` when the same
    /// fingerprint is already the current item of that kind (unless that item
    /// was rejected); otherwise the prior item is superseded into history.
    pub fn submit(&mut self, item: EvidenceItem) -> EngineResult<()> {
        if let Some(existing) = self.current.get(&item.kind) {
            if existing.fingerprint == item.fingerprint
                && existing.outcome != ReviewOutcome::Rejected
            {
                return Err(EngineError::DuplicateEvidence(format!(
                    "{} with fingerprint {} already submitted in cycle {}",
                    item.kind.as_str(),
                    &item.fingerprint[..12.min(item.fingerprint.len())],
                    self.cycle
                )));
            }
        }

        if let Some(mut prior) = self.current.remove(&item.kind) {
            prior.superseded = true;
            self.history.push(prior);
        }

        self.current.insert(item.kind, item);
        Ok(())
    }

    /// Record a review outcome, but only if `fingerprint` still names the
    /// current item of that kind. Last-accepted-evidence wins: a result for a
    /// superseded submission is discarded here.
    pub fn mark_outcome(
        &mut self,
        kind: EvidenceKind,
        fingerprint: &str,
        outcome: ReviewOutcome,
        reject_reason: Option<String>,
    ) -> bool {
        match self.current.get_mut(&kind) {
            Some(item) if item.fingerprint == fingerprint => {
                item.outcome = outcome;
                item.reject_reason = reject_reason;
                true
            }
            _ => false,
        }
    }

    pub fn current(&self, kind: EvidenceKind) -> Option<&EvidenceItem> {
        self.current.get(&kind)
    }

    /// All required kinds are present and accepted.
    pub fn is_complete(&self) -> bool {
        EvidenceKind::REQUIRED.iter().all(|kind| {
            self.current
                .get(kind)
                .map(|item| item.outcome == ReviewOutcome::Accepted)
                .unwrap_or(false)
        })
    }

    pub fn missing_kinds(&self) -> Vec<EvidenceKind> {
        EvidenceKind::REQUIRED
            .iter()
            .copied()
            .filter(|kind| {
                self.current
                    .get(kind)
                    .map(|item| item.outcome != ReviewOutcome::Accepted)
                    .unwrap_or(true)
            })
            .collect()
    }

    /// First rejected item of the cycle, if any. A rejection fails the cycle.
    pub fn first_rejection(&self) -> Option<&EvidenceItem> {
        self.current
            .values()
            .find(|item| item.outcome == ReviewOutcome::Rejected)
    }

    /// Current and superseded items, for persistence and the owner dashboard.
    pub fn all_items(&self) -> Vec<&EvidenceItem> {
        self.current.values().chain(self.history.iter()).collect()
    }

    /// Rebuild a cycle's working set from stored items.
    pub fn from_items(cycle: u32, items: Vec<EvidenceItem>) -> Self {
        let mut evidence = CycleEvidence::new(cycle);
        for item in items {
            if item.cycle != cycle {
                continue;
            }
            if item.superseded {
                evidence.history.push(item);
            } else {
                evidence.current.insert(item.kind, item);
            }
        }
        evidence
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_item(kind: EvidenceKind, payload: &[u8], outcome: ReviewOutcome) -> EvidenceItem {
        EvidenceItem::new("sme-1", kind, fingerprint(payload), 1, outcome)
    }

    #[test]
    fn test_fingerprint_is_stable() {
        assert_eq!(fingerprint(b"certificate"), fingerprint(b"certificate"));
        assert_ne!(fingerprint(b"certificate"), fingerprint(b"video"));
        assert_eq!(fingerprint(b"x").len(), 64);
    }

    #[test]
    fn test_duplicate_fingerprint_rejected_and_first_unchanged() {
        let mut evidence = CycleEvidence::new(1);
        let first = create_item(
            EvidenceKind::IncorporationDocument,
            b"cac.pdf",
            ReviewOutcome::Accepted,
        );
        let first_id = first.id.clone();
        evidence.submit(first).unwrap();

        let second = create_item(
            EvidenceKind::IncorporationDocument,
            b"cac.pdf",
            ReviewOutcome::Accepted,
        );
        let err = evidence.submit(second).unwrap_err();
        assert!(matches!(err, EngineError::DuplicateEvidence(_)));

        // The first record is untouched.
        let current = evidence
            .current(EvidenceKind::IncorporationDocument)
            .unwrap();
        assert_eq!(current.id, first_id);
        assert!(!current.superseded);
    }

    #[test]
    fn test_resubmission_supersedes_but_keeps_history() {
        let mut evidence = CycleEvidence::new(1);
        evidence
            .submit(create_item(
                EvidenceKind::AttestationVideo,
                b"take-one",
                ReviewOutcome::Accepted,
            ))
            .unwrap();
        evidence
            .submit(create_item(
                EvidenceKind::AttestationVideo,
                b"take-two",
                ReviewOutcome::Accepted,
            ))
            .unwrap();

        let current = evidence.current(EvidenceKind::AttestationVideo).unwrap();
        assert_eq!(current.fingerprint, fingerprint(b"take-two"));

        let all = evidence.all_items();
        assert_eq!(all.len(), 2);
        assert_eq!(all.iter().filter(|i| i.superseded).count(), 1);
    }

    #[test]
    fn test_same_fingerprint_allowed_after_rejection() {
        let mut evidence = CycleEvidence::new(1);
        let mut item = create_item(
            EvidenceKind::LinkedAccountToken,
            b"token",
            ReviewOutcome::Rejected,
        );
        item.reject_reason = Some("revoked".to_string());
        evidence.submit(item).unwrap();

        let retry = create_item(
            EvidenceKind::LinkedAccountToken,
            b"token",
            ReviewOutcome::Pending,
        );
        assert!(evidence.submit(retry).is_ok());
    }

    #[test]
    fn test_completeness_requires_all_kinds_accepted() {
        let mut evidence = CycleEvidence::new(1);
        assert!(!evidence.is_complete());
        assert_eq!(evidence.missing_kinds().len(), 3);

        evidence
            .submit(create_item(
                EvidenceKind::IncorporationDocument,
                b"doc",
                ReviewOutcome::Accepted,
            ))
            .unwrap();
        evidence
            .submit(create_item(
                EvidenceKind::AttestationVideo,
                b"video",
                ReviewOutcome::Accepted,
            ))
            .unwrap();
        evidence
            .submit(create_item(
                EvidenceKind::LinkedAccountToken,
                b"token",
                ReviewOutcome::Pending,
            ))
            .unwrap();

        // Token still pending review.
        assert!(!evidence.is_complete());
        assert_eq!(
            evidence.missing_kinds(),
            vec![EvidenceKind::LinkedAccountToken]
        );

        evidence.mark_outcome(
            EvidenceKind::LinkedAccountToken,
            &fingerprint(b"token"),
            ReviewOutcome::Accepted,
            None,
        );
        assert!(evidence.is_complete());
    }

    #[test]
    fn test_mark_outcome_ignores_superseded_fingerprint() {
        let mut evidence = CycleEvidence::new(1);
        evidence
            .submit(create_item(
                EvidenceKind::LinkedAccountToken,
                b"old-token",
                ReviewOutcome::Pending,
            ))
            .unwrap();
        evidence
            .submit(create_item(
                EvidenceKind::LinkedAccountToken,
                b"new-token",
                ReviewOutcome::Pending,
            ))
            .unwrap();

        // A late result for the superseded token must not land.
        let applied = evidence.mark_outcome(
            EvidenceKind::LinkedAccountToken,
            &fingerprint(b"old-token"),
            ReviewOutcome::Accepted,
            None,
        );
        assert!(!applied);
        assert_eq!(
            evidence
                .current(EvidenceKind::LinkedAccountToken)
                .unwrap()
                .outcome,
            ReviewOutcome::Pending
        );
    }

    #[test]
    fn test_from_items_rebuilds_current_and_history() {
        let mut old = create_item(EvidenceKind::AttestationVideo, b"v1", ReviewOutcome::Accepted);
        old.cycle = 2;
        old.superseded = true;
        let mut new = create_item(EvidenceKind::AttestationVideo, b"v2", ReviewOutcome::Accepted);
        new.cycle = 2;
        // Still on cycle 1; must be filtered out of the rebuilt set.
        let stale = create_item(EvidenceKind::AttestationVideo, b"v0", ReviewOutcome::Accepted);

        let evidence = CycleEvidence::from_items(2, vec![old, new, stale]);
        assert_eq!(
            evidence
                .current(EvidenceKind::AttestationVideo)
                .unwrap()
                .fingerprint,
            fingerprint(b"v2")
        );
        assert_eq!(evidence.all_items().len(), 2);
    }
}
