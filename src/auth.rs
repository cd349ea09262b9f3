// Access/identity gate - two disjoint principal kinds, revocable sessions
// A credential authenticates as exactly one role. Session tokens are opaque,
// short-lived, and held server-side so logout (or a compromised SME) can be
// invalidated immediately. Stateless tokens alone would not allow that.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::RwLock;

use crate::error::{EngineError, EngineResult};

// ============================================================================
// ROLES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Sme,
    Lender,
}

impl UserRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserRole::Sme => "sme",
            UserRole::Lender => "lender",
        }
    }

    pub fn parse(value: &str) -> Option<UserRole> {
        match value.trim().to_lowercase().as_str() {
            "sme" => Some(UserRole::Sme),
            "lender" => Some(UserRole::Lender),
            _ => None,
        }
    }
}

// ============================================================================
// ACCOUNTS
// ============================================================================

/// An authenticatable principal. SME accounts share their id with the
/// SME record they own; lender accounts have an independent lifecycle.
#[derive(Debug, Clone)]
pub struct UserAccount {
    pub id: String,
    pub email: String,
    pub role: UserRole,
    pub company: Option<String>,
    pub credential_hash: String,
    pub salt: String,
    pub created_at: DateTime<Utc>,
}

impl UserAccount {
    pub fn new(
        id: String,
        email: String,
        role: UserRole,
        password: &str,
        company: Option<String>,
    ) -> Self {
        let salt = uuid::Uuid::new_v4().to_string();
        let credential_hash = hash_credential(&salt, password);
        UserAccount {
            id,
            email,
            role,
            company,
            credential_hash,
            salt,
            created_at: Utc::now(),
        }
    }

    pub fn verify_password(&self, password: &str) -> bool {
        hash_credential(&self.salt, password) == self.credential_hash
    }

    /// The shape exposed in API responses - never the hash or salt.
    pub fn public(&self) -> PublicUser {
        PublicUser {
            id: self.id.clone(),
            email: self.email.clone(),
            role: self.role,
            company: self.company.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicUser {
    pub id: String,
    pub email: String,
    pub role: UserRole,
    pub company: Option<String>,
}

fn hash_credential(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{}:{}", salt, password));
    format!("{:x}", hasher.finalize())
}

// ============================================================================
// SESSIONS
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct Session {
    /// Opaque bearer token (UUID). Carries no claims; the server-side map is
    /// the source of truth.
    pub token: String,
    pub user_id: String,
    pub role: UserRole,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

// ============================================================================
// GATE
// ============================================================================

pub struct AccessGate {
    accounts: RwLock<HashMap<String, UserAccount>>,
    email_index: RwLock<HashMap<String, String>>,
    sessions: RwLock<HashMap<String, Session>>,
    session_ttl: Duration,
}

impl AccessGate {
    pub fn new(ttl_minutes: i64) -> Self {
        AccessGate {
            accounts: RwLock::new(HashMap::new()),
            email_index: RwLock::new(HashMap::new()),
            sessions: RwLock::new(HashMap::new()),
            session_ttl: Duration::minutes(ttl_minutes),
        }
    }

    /// Register an account. Emails are unique across both roles.
    pub fn register(&self, account: UserAccount) -> EngineResult<()> {
        let email = account.email.trim().to_lowercase();
        if email.is_empty() || !email.contains('@') {
            return Err(EngineError::Validation(format!("invalid email: {}", account.email)));
        }

        let mut index = self.email_index.write().unwrap();
        if index.contains_key(&email) {
            return Err(EngineError::Validation("email already registered".to_string()));
        }
        index.insert(email, account.id.clone());
        self.accounts
            .write()
            .unwrap()
            .insert(account.id.clone(), account);
        Ok(())
    }

    /// Authenticate a credential as one role. A valid password with the
    /// wrong role is still InvalidCredentials - the two principal kinds
    /// are disjoint.
    pub fn login(&self, email: &str, password: &str, role: UserRole) -> EngineResult<Session> {
        let email = email.trim().to_lowercase();
        let account = {
            let index = self.email_index.read().unwrap();
            let accounts = self.accounts.read().unwrap();
            index
                .get(&email)
                .and_then(|id| accounts.get(id))
                .cloned()
        };

        let account = match account {
            Some(account) if account.verify_password(password) && account.role == role => account,
            _ => {
                tracing::warn!(email = %email, role = role.as_str(), "login rejected");
                return Err(EngineError::InvalidCredentials);
            }
        };

        let now = Utc::now();
        let session = Session {
            token: uuid::Uuid::new_v4().to_string(),
            user_id: account.id.clone(),
            role: account.role,
            issued_at: now,
            expires_at: now + self.session_ttl,
        };
        self.sessions
            .write()
            .unwrap()
            .insert(session.token.clone(), session.clone());

        tracing::info!(user_id = %session.user_id, role = session.role.as_str(), "session issued");
        Ok(session)
    }

    /// Resolve a bearer token. Unknown, revoked, and expired tokens are all
    /// InvalidCredentials; expired ones are dropped on the way out.
    pub fn authenticate(&self, token: &str) -> EngineResult<Session> {
        let session = self
            .sessions
            .read()
            .unwrap()
            .get(token)
            .cloned()
            .ok_or(EngineError::InvalidCredentials)?;

        if session.is_expired(Utc::now()) {
            self.sessions.write().unwrap().remove(token);
            return Err(EngineError::InvalidCredentials);
        }

        Ok(session)
    }

    /// Revoke a session server-side. Returns whether a session was live.
    pub fn revoke(&self, token: &str) -> bool {
        self.sessions.write().unwrap().remove(token).is_some()
    }

    pub fn require_role(&self, session: &Session, role: UserRole) -> EngineResult<()> {
        if session.role == role {
            Ok(())
        } else {
            Err(EngineError::Unauthorized(format!(
                "operation requires {} role",
                role.as_str()
            )))
        }
    }

    /// Only the owning SME's session may act on that SME id.
    pub fn require_owner(&self, session: &Session, sme_id: &str) -> EngineResult<()> {
        self.require_role(session, UserRole::Sme)?;
        if session.user_id == sme_id {
            Ok(())
        } else {
            Err(EngineError::Unauthorized(
                "session does not own this SME".to_string(),
            ))
        }
    }

    pub fn account(&self, user_id: &str) -> Option<UserAccount> {
        self.accounts.read().unwrap().get(user_id).cloned()
    }

    /// Load persisted accounts at startup (sessions are not persisted).
    /// Lock order matches register: email index first, then accounts.
    pub fn hydrate(&self, accounts: Vec<UserAccount>) {
        let mut index = self.email_index.write().unwrap();
        let mut map = self.accounts.write().unwrap();
        for account in accounts {
            index.insert(account.email.trim().to_lowercase(), account.id.clone());
            map.insert(account.id.clone(), account);
        }
    }

    pub fn account_count(&self) -> usize {
        self.accounts.read().unwrap().len()
    }
}
