// Pulse Engine - SME Trust & Verification Engine
// Exposes all modules for use in the CLI, API server, and tests

pub mod auth;
pub mod config;
pub mod engine;
pub mod error;
pub mod evidence;
pub mod ledger;
pub mod marketplace;
pub mod provider;
pub mod scoring;
pub mod sme;
pub mod store;
pub mod verification;

// Re-export commonly used types
pub use auth::{AccessGate, PublicUser, Session, UserAccount, UserRole};
pub use config::EngineConfig;
pub use engine::{DashboardData, EngineStats, EvidenceStatus, TrustEngine};
pub use error::{EngineError, EngineResult};
pub use evidence::{fingerprint, CycleEvidence, EvidenceItem, EvidenceKind, ReviewOutcome};
pub use ledger::{load_feed_csv, LedgerSnapshot, SmeLedger, TxnDirection, TxnRecord};
pub use marketplace::{MarketplaceFilter, MarketplaceRow, MarketplaceView, PageResult};
pub use provider::{fetch_with_retry, FixedProvider, LinkedAccountProvider, ProviderError};
pub use scoring::{compute_scores, EvidenceSnapshot, ScorePair};
pub use sme::{City, Industry, SmeProfile, SmeRecord, VerificationStatus};
pub use verification::{AdvanceOutcome, PendingReason, SmeState, VerificationCycle};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
