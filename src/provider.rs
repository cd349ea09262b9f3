// Linked-account provider boundary
// The engine consumes a normalized transaction feed; vendor wire formats stay
// behind this trait. Transient failures retry with backoff, terminal failures
// surface once and map to evidence rejection.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use crate::config::ProviderConfig;
use crate::ledger::TxnRecord;

// ============================================================================
// PROVIDER ERRORS
// ============================================================================

#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    /// Retryable: network hiccup, provider overloaded, timeout.
    #[error("transient provider failure: {0}")]
    Transient(String),

    /// Permanent: revoked link, unknown token. Never retried.
    #[error("terminal provider failure: {0}")]
    Terminal(String),
}

// ============================================================================
// PROVIDER TRAIT
// ============================================================================

/// Pluggable source of normalized transaction history for a linked account.
#[async_trait]
pub trait LinkedAccountProvider: Send + Sync {
    /// Exchange a link token for the account's transaction history.
    async fn fetch_transactions(&self, link_token: &str) -> Result<Vec<TxnRecord>, ProviderError>;
}

/// Fetch with a per-attempt timeout and exponential backoff on transient
/// failures. Terminal failures return immediately.
pub async fn fetch_with_retry(
    provider: &dyn LinkedAccountProvider,
    link_token: &str,
    config: &ProviderConfig,
) -> Result<Vec<TxnRecord>, ProviderError> {
    let attempts = config.max_attempts.max(1);
    let mut delay = Duration::from_millis(config.base_delay_ms);
    let timeout = Duration::from_secs(config.timeout_secs);

    let mut last_error = ProviderError::Transient("no attempts made".to_string());

    for attempt in 1..=attempts {
        let result = tokio::time::timeout(timeout, provider.fetch_transactions(link_token)).await;

        match result {
            Ok(Ok(records)) => return Ok(records),
            Ok(Err(ProviderError::Terminal(msg))) => {
                tracing::warn!(error = %msg, "provider link permanently rejected");
                return Err(ProviderError::Terminal(msg));
            }
            Ok(Err(ProviderError::Transient(msg))) => {
                tracing::warn!(attempt, error = %msg, "transient provider failure");
                last_error = ProviderError::Transient(msg);
            }
            Err(_) => {
                tracing::warn!(attempt, timeout_secs = config.timeout_secs, "provider call timed out");
                last_error = ProviderError::Transient("provider call timed out".to_string());
            }
        }

        if attempt < attempts {
            tokio::time::sleep(delay).await;
            delay *= 2;
        }
    }

    Err(last_error)
}

// ============================================================================
// FIXED PROVIDER
// ============================================================================

/// Deterministic in-process provider backing the CLI demo and tests.
/// Each token maps to a scripted response queue; the last response is sticky,
/// so a single-entry script behaves like a stable account.
#[derive(Default)]
pub struct FixedProvider {
    scripts: Mutex<HashMap<String, Vec<Result<Vec<TxnRecord>, ProviderError>>>>,
}

impl FixedProvider {
    pub fn new() -> Self {
        FixedProvider::default()
    }

    /// Map a token to a single, stable transaction history.
    pub fn with_history(self, token: &str, records: Vec<TxnRecord>) -> Self {
        self.with_script(token, vec![Ok(records)])
    }

    /// Map a token to a sequence of responses, consumed in order.
    pub fn with_script(
        self,
        token: &str,
        responses: Vec<Result<Vec<TxnRecord>, ProviderError>>,
    ) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(token.to_string(), responses);
        self
    }
}

#[async_trait]
impl LinkedAccountProvider for FixedProvider {
    async fn fetch_transactions(&self, link_token: &str) -> Result<Vec<TxnRecord>, ProviderError> {
        let mut scripts = self.scripts.lock().unwrap();
        match scripts.get_mut(link_token) {
            Some(queue) if queue.len() > 1 => queue.remove(0),
            Some(queue) if queue.len() == 1 => queue[0].clone(),
            _ => Err(ProviderError::Terminal(format!(
                "unknown link token: {}",
                link_token
            ))),
        }
    }
}
