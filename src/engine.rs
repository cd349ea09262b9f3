// Trust engine - wires the components into one multi-principal service
// Request-parallel, with per-SME serialization for every mutating operation:
// each SME id maps to one async mutex guarding its authoritative state.
// Marketplace reads never touch those locks; they read the published view.

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use crate::auth::{AccessGate, PublicUser, Session, UserAccount, UserRole};
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::evidence::{fingerprint, EvidenceItem, EvidenceKind, ReviewOutcome};
use crate::ledger::{LedgerSnapshot, SmeLedger, TxnRecord};
use crate::marketplace::{MarketplaceFilter, MarketplaceRow, MarketplaceView, PageResult};
use crate::provider::{fetch_with_retry, LinkedAccountProvider, ProviderError};
use crate::sme::{SmeProfile, SmeRecord, VerificationStatus};
use crate::store::{self, Event};
use crate::verification::{AdvanceOutcome, SmeState};

// ============================================================================
// ENGINE
// ============================================================================

#[derive(Clone)]
pub struct TrustEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    db: Mutex<Connection>,
    config: EngineConfig,
    gate: AccessGate,
    /// One keyed mutex per SME: the serialization scope for mutations.
    states: RwLock<HashMap<String, Arc<tokio::sync::Mutex<SmeState>>>>,
    ledgers: RwLock<HashMap<String, SmeLedger>>,
    view: MarketplaceView,
    provider: Arc<dyn LinkedAccountProvider>,
}

impl TrustEngine {
    pub fn open(config: EngineConfig, provider: Arc<dyn LinkedAccountProvider>) -> Result<Self> {
        let conn = Connection::open(&config.database.path)?;
        Self::with_connection(conn, config, provider)
    }

    pub fn in_memory(config: EngineConfig, provider: Arc<dyn LinkedAccountProvider>) -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?, config, provider)
    }

    fn with_connection(
        conn: Connection,
        config: EngineConfig,
        provider: Arc<dyn LinkedAccountProvider>,
    ) -> Result<Self> {
        store::setup_database(&conn)?;

        let gate = AccessGate::new(config.session.ttl_minutes);
        let engine = TrustEngine {
            inner: Arc::new(EngineInner {
                db: Mutex::new(conn),
                config,
                gate,
                states: RwLock::new(HashMap::new()),
                ledgers: RwLock::new(HashMap::new()),
                view: MarketplaceView::new(),
                provider,
            }),
        };
        engine.hydrate()?;
        Ok(engine)
    }

    /// Load persisted accounts, records, evidence, and ledgers; republish
    /// verified rows into the view.
    fn hydrate(&self) -> Result<()> {
        let (users, smes) = {
            let conn = self.inner.db.lock().unwrap();
            (store::get_all_users(&conn)?, store::get_all_smes(&conn)?)
        };

        self.inner.gate.hydrate(users);

        for record in smes {
            let (evidence, transactions) = {
                let conn = self.inner.db.lock().unwrap();
                (
                    store::get_evidence_for_sme(&conn, &record.id)?,
                    store::get_transactions_for_sme(&conn, &record.id)?,
                )
            };

            if !transactions.is_empty() {
                let mut ledgers = self.inner.ledgers.write().unwrap();
                ledgers
                    .entry(record.id.clone())
                    .or_default()
                    .merge(transactions);
            }

            if let Some(row) = MarketplaceRow::from_record(&record) {
                self.inner.view.publish(row);
            }

            let state = SmeState::restore(record, evidence);
            self.inner
                .states
                .write()
                .unwrap()
                .insert(state.record.id.clone(), Arc::new(tokio::sync::Mutex::new(state)));
        }

        tracing::info!(
            smes = self.inner.states.read().unwrap().len(),
            accounts = self.inner.gate.account_count(),
            published = self.inner.view.len(),
            "engine hydrated"
        );
        Ok(())
    }

    // ========================================================================
    // IDENTITY
    // ========================================================================

    pub fn register_sme(
        &self,
        email: &str,
        password: &str,
        profile: SmeProfile,
    ) -> EngineResult<SmeRecord> {
        validate_password(password)?;

        let record = SmeRecord::new(email.to_string(), profile);
        let account = UserAccount::new(
            record.id.clone(),
            email.to_string(),
            UserRole::Sme,
            password,
            None,
        );
        self.inner.gate.register(account.clone())?;

        {
            let conn = self.inner.db.lock().unwrap();
            if !store::insert_user(&conn, &account).map_err(EngineError::storage)? {
                return Err(EngineError::Validation("email already registered".to_string()));
            }
            store::upsert_sme(&conn, &record).map_err(EngineError::storage)?;
            let event = Event::new(
                "sme_registered",
                "sme",
                &record.id,
                serde_json::json!({ "industry": record.industry.as_str() }),
                "engine",
            );
            if let Err(err) = store::insert_event(&conn, &event) {
                tracing::warn!(error = %err, "failed to record audit event");
            }
        }

        self.inner.states.write().unwrap().insert(
            record.id.clone(),
            Arc::new(tokio::sync::Mutex::new(SmeState::new(record.clone()))),
        );

        tracing::info!(sme_id = %record.id, "SME registered");
        Ok(record)
    }

    pub fn register_lender(
        &self,
        email: &str,
        password: &str,
        company: Option<String>,
    ) -> EngineResult<PublicUser> {
        validate_password(password)?;

        let account = UserAccount::new(
            uuid::Uuid::new_v4().to_string(),
            email.to_string(),
            UserRole::Lender,
            password,
            company,
        );
        self.inner.gate.register(account.clone())?;

        let conn = self.inner.db.lock().unwrap();
        if !store::insert_user(&conn, &account).map_err(EngineError::storage)? {
            return Err(EngineError::Validation("email already registered".to_string()));
        }

        tracing::info!(lender_id = %account.id, "lender registered");
        Ok(account.public())
    }

    pub fn login(
        &self,
        email: &str,
        password: &str,
        role: UserRole,
    ) -> EngineResult<(Session, PublicUser)> {
        let session = self.inner.gate.login(email, password, role)?;
        let user = self
            .inner
            .gate
            .account(&session.user_id)
            .map(|account| account.public())
            .ok_or(EngineError::InvalidCredentials)?;
        Ok((session, user))
    }

    pub fn logout(&self, token: &str) -> bool {
        self.inner.gate.revoke(token)
    }

    pub fn authenticate(&self, token: &str) -> EngineResult<Session> {
        self.inner.gate.authenticate(token)
    }

    // ========================================================================
    // EVIDENCE SUBMISSION
    // ========================================================================

    /// Store an evidence payload for the owner's current cycle and schedule
    /// re-evaluation. Returns as soon as the item is durable; scoring never
    /// blocks the caller.
    pub async fn submit_evidence(
        &self,
        session: &Session,
        sme_id: &str,
        kind: EvidenceKind,
        payload: &[u8],
    ) -> EngineResult<EvidenceItem> {
        self.inner.gate.require_owner(session, sme_id)?;
        if payload.is_empty() {
            return Err(EngineError::Validation("empty evidence payload".to_string()));
        }

        // Documents and video are accepted at submission (content review is
        // out of band); a linked-account token stays pending until the
        // provider feed confirms it.
        let outcome = match kind {
            EvidenceKind::LinkedAccountToken => ReviewOutcome::Pending,
            _ => ReviewOutcome::Accepted,
        };

        let state_handle = self.state(sme_id)?;
        let stored = {
            let mut state = state_handle.lock().await;
            let was_verified = state.record.status == VerificationStatus::Verified;

            let item = EvidenceItem::new(sme_id, kind, fingerprint(payload), state.record.cycle, outcome);
            let stored = state.submit(item)?;

            // A re-verifying SME disappears from the marketplace until the
            // new cycle closes.
            if was_verified {
                self.inner.view.retract(sme_id);
            }

            self.persist_state(&state)?;
            stored
        };

        self.record_event(
            "evidence_submitted",
            sme_id,
            serde_json::json!({ "kind": stored.kind.as_str(), "cycle": stored.cycle }),
        );
        self.schedule_evaluation(sme_id);
        Ok(stored)
    }

    /// Link a bank account: stores the token as pending evidence, then
    /// fetches the transaction feed in the background.
    pub async fn connect_linked_account(
        &self,
        session: &Session,
        sme_id: &str,
        link_token: &str,
    ) -> EngineResult<EvidenceItem> {
        self.inner.gate.require_owner(session, sme_id)?;
        if link_token.trim().is_empty() {
            return Err(EngineError::Validation("link token is required".to_string()));
        }

        let state_handle = self.state(sme_id)?;
        let stored = {
            let mut state = state_handle.lock().await;
            let was_verified = state.record.status == VerificationStatus::Verified;

            let item = EvidenceItem::new(
                sme_id,
                EvidenceKind::LinkedAccountToken,
                fingerprint(link_token.as_bytes()),
                state.record.cycle,
                ReviewOutcome::Pending,
            );
            let stored = state.submit(item)?;

            if was_verified {
                self.inner.view.retract(sme_id);
            }

            state.link_token = Some(link_token.to_string());
            self.persist_state(&state)?;
            stored
        };

        self.record_event(
            "account_linked",
            sme_id,
            serde_json::json!({ "fingerprint": stored.fingerprint }),
        );

        let engine = self.clone();
        let id = sme_id.to_string();
        tokio::spawn(async move {
            if let Err(err) = engine.refresh_ledger(&id).await {
                tracing::warn!(sme_id = %id, error = %err, "background ledger refresh failed");
            }
        });

        Ok(stored)
    }

    // ========================================================================
    // LEDGER
    // ========================================================================

    /// Pull the provider feed for an SME's linked account and re-evaluate.
    /// Transient failures leave the link pending (refresh lags, the
    /// submission already succeeded); terminal failures reject the link and
    /// fail the cycle.
    pub async fn refresh_ledger(&self, sme_id: &str) -> EngineResult<()> {
        let state_handle = self.state(sme_id)?;
        let (token, token_fingerprint) = {
            let state = state_handle.lock().await;
            let token = state
                .link_token
                .clone()
                .ok_or_else(|| EngineError::Validation("no linked account to refresh".to_string()))?;
            let fp = fingerprint(token.as_bytes());
            (token, fp)
        };

        let fetched = fetch_with_retry(
            self.inner.provider.as_ref(),
            &token,
            &self.inner.config.provider,
        )
        .await;

        match fetched {
            Ok(records) => {
                let received = records.len();
                let inserted = self.ingest(sme_id, records)?;
                tracing::info!(sme_id, received, inserted, "ledger refreshed");

                let mut state = state_handle.lock().await;
                // Last-accepted-evidence wins: a result for a token that has
                // since been replaced is discarded at this write.
                if state.mark_link_outcome(&token_fingerprint, ReviewOutcome::Accepted, None) {
                    self.persist_state(&state)?;
                }
                self.advance_locked(&mut state)?;
                Ok(())
            }
            Err(ProviderError::Terminal(msg)) => {
                let mut state = state_handle.lock().await;
                if state.mark_link_outcome(
                    &token_fingerprint,
                    ReviewOutcome::Rejected,
                    Some(msg.clone()),
                ) {
                    self.persist_state(&state)?;
                    self.advance_locked(&mut state)?;
                }
                Err(EngineError::TerminalProviderFailure(msg))
            }
            Err(ProviderError::Transient(msg)) => {
                tracing::warn!(sme_id, error = %msg, "ledger refresh lagging after retries");
                Err(EngineError::TransientProviderFailure(msg))
            }
        }
    }

    /// Merge a normalized transaction batch. Idempotent under replay; used by
    /// the provider path and the CSV backfill.
    pub fn ingest(&self, sme_id: &str, records: Vec<TxnRecord>) -> EngineResult<usize> {
        self.state(sme_id)?;

        {
            let conn = self.inner.db.lock().unwrap();
            store::insert_transactions(&conn, sme_id, &records).map_err(EngineError::storage)?;
        }

        let mut ledgers = self.inner.ledgers.write().unwrap();
        Ok(ledgers.entry(sme_id.to_string()).or_default().merge(records))
    }

    // ========================================================================
    // STATE MACHINE
    // ========================================================================

    /// Idempotent: evaluates the current cycle and applies at most one
    /// terminal transition. Concurrent calls serialize on the SME's mutex.
    pub async fn advance(&self, sme_id: &str) -> EngineResult<VerificationStatus> {
        let state_handle = self.state(sme_id)?;
        let mut state = state_handle.lock().await;
        self.advance_locked(&mut state)
    }

    fn advance_locked(&self, state: &mut SmeState) -> EngineResult<VerificationStatus> {
        if state.cycle.is_closed() {
            return Ok(state.record.status);
        }

        let snapshot = self.ledger_snapshot(&state.record.id);
        let outcome = state.evaluate(&snapshot, &self.inner.config.scoring);

        match &outcome {
            AdvanceOutcome::Verified(_) => {
                self.persist_state(state)?;
                if let Some(row) = MarketplaceRow::from_record(&state.record) {
                    self.inner.view.publish(row);
                }
                self.record_event(
                    "sme_verified",
                    &state.record.id,
                    serde_json::json!({
                        "cycle": state.cycle.number,
                        "pulse_score": state.record.pulse_score,
                        "profit_score": state.record.profit_score,
                    }),
                );
            }
            AdvanceOutcome::Failed(reason) => {
                self.persist_state(state)?;
                self.inner.view.retract(&state.record.id);
                self.record_event(
                    "sme_failed",
                    &state.record.id,
                    serde_json::json!({ "cycle": state.cycle.number, "reason": reason }),
                );
            }
            AdvanceOutcome::Pending(reason) => {
                tracing::debug!(sme_id = %state.record.id, reason = ?reason, "verification still pending");
            }
        }

        Ok(state.record.status)
    }

    /// Explicit rejection: expired evidence, failed liveness check,
    /// disqualifying ledger pattern. Terminal for the cycle; a no-op if the
    /// cycle already closed.
    pub async fn reject(&self, sme_id: &str, reason: &str) -> EngineResult<VerificationStatus> {
        let state_handle = self.state(sme_id)?;
        let mut state = state_handle.lock().await;

        if state.reject(reason) {
            self.persist_state(&state)?;
            self.inner.view.retract(sme_id);
            self.record_event(
                "sme_rejected",
                sme_id,
                serde_json::json!({ "cycle": state.cycle.number, "reason": reason }),
            );
        }
        Ok(state.record.status)
    }

    // ========================================================================
    // READ SIDE
    // ========================================================================

    /// Owner dashboard: the authoritative record, including scores the
    /// marketplace would not yet expose.
    pub async fn dashboard(&self, session: &Session) -> EngineResult<DashboardData> {
        self.inner.gate.require_role(session, UserRole::Sme)?;
        let state_handle = self.state(&session.user_id)?;
        let state = state_handle.lock().await;

        let snapshot = self.ledger_snapshot(&state.record.id);
        let mut evidence: Vec<EvidenceStatus> = state
            .cycle
            .evidence
            .all_items()
            .into_iter()
            .map(|item| EvidenceStatus {
                kind: item.kind,
                outcome: item.outcome,
                submitted_at: item.submitted_at,
                superseded: item.superseded,
            })
            .collect();
        evidence.sort_by_key(|status| status.submitted_at);

        Ok(DashboardData {
            record: state.record.clone(),
            evidence,
            months_of_history: snapshot.months_of_history(),
            transaction_count: snapshot.len(),
            marketplace_published: self.inner.view.get_detail(&state.record.id).is_some(),
        })
    }

    /// Lender marketplace listing: filtered, ordered, paginated, and reading
    /// only the published view.
    pub fn marketplace(
        &self,
        session: &Session,
        params: &HashMap<String, String>,
    ) -> EngineResult<PageResult<MarketplaceRow>> {
        self.inner.gate.require_role(session, UserRole::Lender)?;
        let (filter, page) = MarketplaceFilter::from_params(params)?;
        Ok(self
            .inner
            .view
            .query(&filter, page, self.inner.config.marketplace.page_size))
    }

    /// Single published row. Unverified SMEs are NotFound by design, even
    /// when a pending record exists underneath.
    pub fn marketplace_detail(&self, session: &Session, sme_id: &str) -> EngineResult<MarketplaceRow> {
        self.inner.gate.require_role(session, UserRole::Lender)?;
        self.inner
            .view
            .get_detail(sme_id)
            .ok_or_else(|| EngineError::NotFound(format!("sme {}", sme_id)))
    }

    pub fn stats(&self) -> EngineResult<EngineStats> {
        let conn = self.inner.db.lock().unwrap();
        Ok(EngineStats {
            smes: store::count_smes(&conn).map_err(EngineError::storage)?,
            users: store::count_users(&conn).map_err(EngineError::storage)?,
            transactions: store::count_all_transactions(&conn).map_err(EngineError::storage)?,
            published: self.inner.view.len(),
        })
    }

    // ========================================================================
    // BACKGROUND WORK
    // ========================================================================

    fn schedule_evaluation(&self, sme_id: &str) {
        let engine = self.clone();
        let sme_id = sme_id.to_string();
        tokio::spawn(async move {
            if let Err(err) = engine.advance(&sme_id).await {
                tracing::warn!(sme_id = %sme_id, error = %err, "scheduled evaluation failed");
            }
        });
    }

    /// Periodic ledger refresh for every SME with a live link. Disabled when
    /// the configured interval is 0.
    pub fn spawn_refresh_schedule(&self) {
        let interval_secs = self.inner.config.provider.refresh_interval_secs;
        if interval_secs == 0 {
            return;
        }

        let engine = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let handles: Vec<(String, Arc<tokio::sync::Mutex<SmeState>>)> = engine
                    .inner
                    .states
                    .read()
                    .unwrap()
                    .iter()
                    .map(|(id, handle)| (id.clone(), handle.clone()))
                    .collect();

                for (sme_id, handle) in handles {
                    let linked = handle.lock().await.link_token.is_some();
                    if !linked {
                        continue;
                    }
                    if let Err(err) = engine.refresh_ledger(&sme_id).await {
                        tracing::debug!(sme_id = %sme_id, error = %err, "scheduled refresh skipped");
                    }
                }
            }
        });
    }

    // ========================================================================
    // INTERNALS
    // ========================================================================

    fn state(&self, sme_id: &str) -> EngineResult<Arc<tokio::sync::Mutex<SmeState>>> {
        self.inner
            .states
            .read()
            .unwrap()
            .get(sme_id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("sme {}", sme_id)))
    }

    fn ledger_snapshot(&self, sme_id: &str) -> LedgerSnapshot {
        let now = Utc::now();
        self.inner
            .ledgers
            .read()
            .unwrap()
            .get(sme_id)
            .map(|ledger| ledger.snapshot(now))
            .unwrap_or_else(|| LedgerSnapshot::empty(now))
    }

    fn persist_state(&self, state: &SmeState) -> EngineResult<()> {
        let conn = self.inner.db.lock().unwrap();
        store::upsert_sme(&conn, &state.record).map_err(EngineError::storage)?;
        for item in state.cycle.evidence.all_items() {
            store::upsert_evidence(&conn, item).map_err(EngineError::storage)?;
        }
        Ok(())
    }

    fn record_event(&self, event_type: &str, sme_id: &str, data: serde_json::Value) {
        let conn = self.inner.db.lock().unwrap();
        let event = Event::new(event_type, "sme", sme_id, data, "engine");
        if let Err(err) = store::insert_event(&conn, &event) {
            tracing::warn!(error = %err, "failed to record audit event");
        }
    }
}

fn validate_password(password: &str) -> EngineResult<()> {
    if password.len() < 8 {
        return Err(EngineError::Validation(
            "password must be at least 8 characters".to_string(),
        ));
    }
    Ok(())
}

// ============================================================================
// READ MODELS
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct EvidenceStatus {
    pub kind: EvidenceKind,
    pub outcome: ReviewOutcome,
    pub submitted_at: DateTime<Utc>,
    pub superseded: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct DashboardData {
    pub record: SmeRecord,
    pub evidence: Vec<EvidenceStatus>,
    pub months_of_history: u32,
    pub transaction_count: usize,
    pub marketplace_published: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub smes: i64,
    pub users: i64,
    pub transactions: i64,
    pub published: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::TxnDirection;
    use crate::provider::FixedProvider;
    use crate::sme::{City, Industry};
    use chrono::TimeZone;

    const SME_EMAIL: &str = "owner@acme.test";
    const SME_PASSWORD: &str = "hunter2hunter2";
    const LENDER_EMAIL: &str = "funds@capital.test";
    const LENDER_PASSWORD: &str = "lendme-lendme";

    fn create_profile() -> SmeProfile {
        SmeProfile {
            name: "Acme Stores".to_string(),
            industry: Industry::Retail,
            location: City::Lagos,
            founded_date: None,
            description: "Neighborhood retail chain".to_string(),
        }
    }

    /// `months` of qualifying history: a growing credit and a smaller debit
    /// per month. External ids are stable, so a longer fetch of the same
    /// account is a superset of a shorter one.
    fn history(months: u32) -> Vec<TxnRecord> {
        let mut records = Vec::new();
        for m in 0..months {
            let ts = Utc
                .with_ymd_and_hms(2025, 1, 10, 9, 0, 0)
                .unwrap()
                .checked_add_months(chrono::Months::new(m))
                .unwrap();
            records.push(TxnRecord {
                external_id: format!("txn-credit-{}", m),
                amount: 1500.0 + m as f64 * 50.0,
                direction: TxnDirection::Credit,
                timestamp: ts,
                category: Some("sales".to_string()),
            });
            records.push(TxnRecord {
                external_id: format!("txn-debit-{}", m),
                amount: 800.0,
                direction: TxnDirection::Debit,
                timestamp: ts,
                category: None,
            });
        }
        records
    }

    fn create_provider() -> FixedProvider {
        FixedProvider::new()
            .with_history("tok-short", history(4))
            .with_history("tok-long", history(8))
            .with_script(
                "tok-revoked",
                vec![Err(ProviderError::Terminal("bank link revoked".to_string()))],
            )
    }

    fn create_engine() -> TrustEngine {
        let mut config = EngineConfig::default();
        // Keep retry pauses negligible in tests.
        config.provider.base_delay_ms = 1;
        TrustEngine::in_memory(config, Arc::new(create_provider())).unwrap()
    }

    fn onboard_sme(engine: &TrustEngine) -> (Session, SmeRecord) {
        let record = engine
            .register_sme(SME_EMAIL, SME_PASSWORD, create_profile())
            .unwrap();
        let (session, _) = engine.login(SME_EMAIL, SME_PASSWORD, UserRole::Sme).unwrap();
        (session, record)
    }

    fn onboard_lender(engine: &TrustEngine) -> Session {
        engine
            .register_lender(LENDER_EMAIL, LENDER_PASSWORD, Some("Capital Partners".to_string()))
            .unwrap();
        let (session, _) = engine
            .login(LENDER_EMAIL, LENDER_PASSWORD, UserRole::Lender)
            .unwrap();
        session
    }

    async fn submit_documents(engine: &TrustEngine, session: &Session, sme_id: &str) {
        engine
            .submit_evidence(session, sme_id, EvidenceKind::IncorporationDocument, b"cac.pdf")
            .await
            .unwrap();
        engine
            .submit_evidence(session, sme_id, EvidenceKind::AttestationVideo, b"video.mp4")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_fingerprint_rejected_first_unchanged() {
        let engine = create_engine();
        let (session, record) = onboard_sme(&engine);

        let first = engine
            .submit_evidence(&session, &record.id, EvidenceKind::IncorporationDocument, b"cac.pdf")
            .await
            .unwrap();

        let err = engine
            .submit_evidence(&session, &record.id, EvidenceKind::IncorporationDocument, b"cac.pdf")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::DuplicateEvidence(_)));

        let dashboard = engine.dashboard(&session).await.unwrap();
        let docs: Vec<_> = dashboard
            .evidence
            .iter()
            .filter(|e| e.kind == EvidenceKind::IncorporationDocument)
            .collect();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].submitted_at, first.submitted_at);
    }

    #[tokio::test]
    async fn test_short_history_stays_pending_without_error() {
        let engine = create_engine();
        let (session, record) = onboard_sme(&engine);
        submit_documents(&engine, &session, &record.id).await;

        // The connect call itself succeeds; InsufficientData never surfaces.
        engine
            .connect_linked_account(&session, &record.id, "tok-short")
            .await
            .unwrap();
        engine.refresh_ledger(&record.id).await.unwrap();

        let status = engine.advance(&record.id).await.unwrap();
        assert_eq!(status, VerificationStatus::Pending);

        let dashboard = engine.dashboard(&session).await.unwrap();
        assert_eq!(dashboard.record.status, VerificationStatus::Pending);
        assert!(dashboard.record.pulse_score.is_none());
        assert!(dashboard.record.profit_score.is_none());
        assert_eq!(dashboard.months_of_history, 4);
    }

    #[tokio::test]
    async fn test_longer_history_verifies_and_publishes_once() {
        let engine = create_engine();
        let (session, record) = onboard_sme(&engine);
        submit_documents(&engine, &session, &record.id).await;

        engine
            .connect_linked_account(&session, &record.id, "tok-short")
            .await
            .unwrap();
        engine.refresh_ledger(&record.id).await.unwrap();
        assert_eq!(
            engine.advance(&record.id).await.unwrap(),
            VerificationStatus::Pending
        );

        // Re-link with eight months of history.
        engine
            .connect_linked_account(&session, &record.id, "tok-long")
            .await
            .unwrap();
        engine.refresh_ledger(&record.id).await.unwrap();

        let status = engine.advance(&record.id).await.unwrap();
        assert_eq!(status, VerificationStatus::Verified);

        let dashboard = engine.dashboard(&session).await.unwrap();
        assert!(dashboard.record.scores_complete());
        assert!(dashboard.marketplace_published);

        let lender = onboard_lender(&engine);
        let page = engine.marketplace(&lender, &HashMap::new()).unwrap();
        let matches: Vec<_> = page.items.iter().filter(|r| r.id == record.id).collect();
        assert_eq!(matches.len(), 1);
        assert_eq!(page.total_items, 1);
    }

    #[tokio::test]
    async fn test_pending_sme_invisible_to_lenders_but_not_owner() {
        let engine = create_engine();
        let (session, record) = onboard_sme(&engine);
        let lender = onboard_lender(&engine);

        // Owner sees the record; the lender gets NotFound for the same id.
        assert!(engine.dashboard(&session).await.is_ok());
        let err = engine.marketplace_detail(&lender, &record.id).unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));

        let page = engine.marketplace(&lender, &HashMap::new()).unwrap();
        assert!(page.items.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_same_kind_submissions_one_current() {
        let engine = create_engine();
        let (session, record) = onboard_sme(&engine);

        let (a, b) = tokio::join!(
            engine.submit_evidence(&session, &record.id, EvidenceKind::AttestationVideo, b"take-one"),
            engine.submit_evidence(&session, &record.id, EvidenceKind::AttestationVideo, b"take-two"),
        );
        assert!(a.is_ok());
        assert!(b.is_ok());

        let dashboard = engine.dashboard(&session).await.unwrap();
        let videos: Vec<_> = dashboard
            .evidence
            .iter()
            .filter(|e| e.kind == EvidenceKind::AttestationVideo)
            .collect();
        assert_eq!(videos.len(), 2);
        // Exactly one current; the other is superseded history, not dropped.
        assert_eq!(videos.iter().filter(|e| !e.superseded).count(), 1);
        assert_eq!(videos.iter().filter(|e| e.superseded).count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_advance_single_terminal_transition() {
        let engine = create_engine();
        let (session, record) = onboard_sme(&engine);
        submit_documents(&engine, &session, &record.id).await;
        engine
            .connect_linked_account(&session, &record.id, "tok-long")
            .await
            .unwrap();
        engine.refresh_ledger(&record.id).await.unwrap();

        let (a, b) = tokio::join!(engine.advance(&record.id), engine.advance(&record.id));
        assert_eq!(a.unwrap(), VerificationStatus::Verified);
        assert_eq!(b.unwrap(), VerificationStatus::Verified);

        // verified implies both scores non-null, and exactly one row published.
        let dashboard = engine.dashboard(&session).await.unwrap();
        assert!(dashboard.record.scores_complete());

        let lender = onboard_lender(&engine);
        let page = engine.marketplace(&lender, &HashMap::new()).unwrap();
        assert_eq!(page.total_items, 1);
    }

    #[tokio::test]
    async fn test_terminal_provider_failure_fails_cycle_with_reason() {
        let engine = create_engine();
        let (session, record) = onboard_sme(&engine);
        submit_documents(&engine, &session, &record.id).await;

        engine
            .connect_linked_account(&session, &record.id, "tok-revoked")
            .await
            .unwrap();
        let err = engine.refresh_ledger(&record.id).await.unwrap_err();
        assert!(matches!(err, EngineError::TerminalProviderFailure(_)));

        let dashboard = engine.dashboard(&session).await.unwrap();
        assert_eq!(dashboard.record.status, VerificationStatus::Failed);
        let reason = dashboard.record.failure_reason.unwrap();
        assert!(reason.contains("bank link revoked"));
    }

    #[tokio::test]
    async fn test_resubmission_after_failure_starts_cycle_two() {
        let engine = create_engine();
        let (session, record) = onboard_sme(&engine);
        engine.reject(&record.id, "liveness check failed").await.unwrap();

        let item = engine
            .submit_evidence(&session, &record.id, EvidenceKind::IncorporationDocument, b"cac-v2.pdf")
            .await
            .unwrap();
        assert_eq!(item.cycle, 2);

        let dashboard = engine.dashboard(&session).await.unwrap();
        assert_eq!(dashboard.record.status, VerificationStatus::Pending);
        assert_eq!(dashboard.record.cycle, 2);
        assert!(dashboard.record.failure_reason.is_none());
    }

    #[tokio::test]
    async fn test_ledger_replay_is_idempotent() {
        let engine = create_engine();
        let (_, record) = onboard_sme(&engine);

        assert_eq!(engine.ingest(&record.id, history(4)).unwrap(), 8);
        assert_eq!(engine.ingest(&record.id, history(4)).unwrap(), 0);
        assert_eq!(engine.stats().unwrap().transactions, 8);
    }

    #[tokio::test]
    async fn test_role_and_ownership_enforced() {
        let engine = create_engine();
        let (sme_session, record) = onboard_sme(&engine);
        let lender_session = onboard_lender(&engine);

        // SME principals cannot query the marketplace.
        assert!(matches!(
            engine.marketplace(&sme_session, &HashMap::new()),
            Err(EngineError::Unauthorized(_))
        ));

        // Lenders cannot submit evidence, even against a real SME id.
        assert!(matches!(
            engine
                .submit_evidence(&lender_session, &record.id, EvidenceKind::AttestationVideo, b"v")
                .await,
            Err(EngineError::Unauthorized(_))
        ));

        // An SME session cannot act on another SME's id.
        assert!(matches!(
            engine
                .submit_evidence(&sme_session, "some-other-sme", EvidenceKind::AttestationVideo, b"v")
                .await,
            Err(EngineError::Unauthorized(_))
        ));
    }

    #[tokio::test]
    async fn test_logout_revokes_session_immediately() {
        let engine = create_engine();
        let (session, _) = onboard_sme(&engine);

        assert!(engine.authenticate(&session.token).is_ok());
        assert!(engine.logout(&session.token));
        assert!(matches!(
            engine.authenticate(&session.token),
            Err(EngineError::InvalidCredentials)
        ));
    }

    #[tokio::test]
    async fn test_unknown_filter_key_rejected_at_query() {
        let engine = create_engine();
        let lender = onboard_lender(&engine);

        let mut params = HashMap::new();
        params.insert("min_pulse_score".to_string(), "80".to_string());
        assert!(matches!(
            engine.marketplace(&lender, &params),
            Err(EngineError::InvalidFilter(_))
        ));
    }

    #[tokio::test]
    async fn test_restart_rehydrates_records_and_view() {
        let db_path = std::env::temp_dir().join(format!("pulse-test-{}.db", uuid::Uuid::new_v4()));
        let mut config = EngineConfig::default();
        config.database.path = db_path.to_string_lossy().to_string();
        config.provider.base_delay_ms = 1;

        let record_id;
        {
            let engine =
                TrustEngine::open(config.clone(), Arc::new(create_provider())).unwrap();
            let (session, record) = onboard_sme(&engine);
            record_id = record.id.clone();
            submit_documents(&engine, &session, &record.id).await;
            engine
                .connect_linked_account(&session, &record.id, "tok-long")
                .await
                .unwrap();
            engine.refresh_ledger(&record.id).await.unwrap();
            assert_eq!(
                engine.advance(&record.id).await.unwrap(),
                VerificationStatus::Verified
            );
        }

        // Fresh engine over the same database: accounts, records, and the
        // published view come back; sessions do not.
        let engine = TrustEngine::open(config, Arc::new(create_provider())).unwrap();
        let (session, _) = engine.login(SME_EMAIL, SME_PASSWORD, UserRole::Sme).unwrap();
        let dashboard = engine.dashboard(&session).await.unwrap();
        assert_eq!(dashboard.record.status, VerificationStatus::Verified);
        assert!(dashboard.record.scores_complete());
        assert_eq!(dashboard.months_of_history, 8);

        let lender = onboard_lender(&engine);
        let row = engine.marketplace_detail(&lender, &record_id).unwrap();
        assert_eq!(row.id, record_id);

        let _ = std::fs::remove_file(&db_path);
    }
}
