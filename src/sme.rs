// SME records - the authoritative entity the verification state machine owns
// Identity is a UUID; status and scores are values that change across cycles.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// INDUSTRY
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Industry {
    Retail,
    Manufacturing,
    Services,
    Agriculture,
    Fashion,
    Fintech,
}

impl Industry {
    pub const ALL: [Industry; 6] = [
        Industry::Retail,
        Industry::Manufacturing,
        Industry::Services,
        Industry::Agriculture,
        Industry::Fashion,
        Industry::Fintech,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Industry::Retail => "retail",
            Industry::Manufacturing => "manufacturing",
            Industry::Services => "services",
            Industry::Agriculture => "agriculture",
            Industry::Fashion => "fashion",
            Industry::Fintech => "fintech",
        }
    }

    pub fn parse(value: &str) -> Option<Industry> {
        Industry::ALL
            .iter()
            .copied()
            .find(|i| i.as_str() == value.trim().to_lowercase())
    }
}

// ============================================================================
// CITY
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum City {
    Lagos,
    Abuja,
    Kano,
    PortHarcourt,
    Ibadan,
    Enugu,
}

impl City {
    pub const ALL: [City; 6] = [
        City::Lagos,
        City::Abuja,
        City::Kano,
        City::PortHarcourt,
        City::Ibadan,
        City::Enugu,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            City::Lagos => "lagos",
            City::Abuja => "abuja",
            City::Kano => "kano",
            City::PortHarcourt => "port-harcourt",
            City::Ibadan => "ibadan",
            City::Enugu => "enugu",
        }
    }

    pub fn parse(value: &str) -> Option<City> {
        let normalized = value.trim().to_lowercase().replace(' ', "-");
        City::ALL.iter().copied().find(|c| c.as_str() == normalized)
    }
}

// ============================================================================
// VERIFICATION STATUS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerificationStatus {
    Pending,
    Verified,
    Failed,
}

impl VerificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerificationStatus::Pending => "pending",
            VerificationStatus::Verified => "verified",
            VerificationStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<VerificationStatus> {
        match value {
            "pending" => Some(VerificationStatus::Pending),
            "verified" => Some(VerificationStatus::Verified),
            "failed" => Some(VerificationStatus::Failed),
            _ => None,
        }
    }

    /// Terminal states close a verification cycle; a fresh cycle is the only
    /// way forward from here.
    pub fn is_terminal(&self) -> bool {
        matches!(self, VerificationStatus::Verified | VerificationStatus::Failed)
    }
}

// ============================================================================
// SME RECORD
// ============================================================================

/// Profile attributes supplied at registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmeProfile {
    pub name: String,
    pub industry: Industry,
    pub location: City,
    pub founded_date: Option<NaiveDate>,
    pub description: String,
}

/// Authoritative SME record. Only the verification state machine writes it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmeRecord {
    /// Stable identity (UUID) - never changes across verification cycles.
    pub id: String,

    pub name: String,
    pub email: String,
    pub industry: Industry,
    pub location: City,
    pub founded_date: Option<NaiveDate>,
    pub description: String,

    pub status: VerificationStatus,

    /// Operational-health trust metric, 0..=100. None until computed.
    pub pulse_score: Option<u32>,

    /// Profitability-signal trust metric, 0..=100. None until computed.
    pub profit_score: Option<u32>,

    /// Current verification cycle number, starting at 1.
    pub cycle: u32,

    /// Recorded cause when status is failed. Never set implicitly.
    pub failure_reason: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SmeRecord {
    pub fn new(email: String, profile: SmeProfile) -> Self {
        let now = Utc::now();
        SmeRecord {
            id: uuid::Uuid::new_v4().to_string(),
            name: profile.name,
            email,
            industry: profile.industry,
            location: profile.location,
            founded_date: profile.founded_date,
            description: profile.description,
            status: VerificationStatus::Pending,
            pulse_score: None,
            profit_score: None,
            cycle: 1,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Invariant check: verified implies both scores present.
    pub fn scores_complete(&self) -> bool {
        self.pulse_score.is_some() && self.profit_score.is_some()
    }

    /// Profile consistency signal used by scoring: the stated truth is filled in.
    pub fn profile_complete(&self) -> bool {
        !self.name.trim().is_empty() && !self.description.trim().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_industry_parse_roundtrip() {
        for industry in Industry::ALL {
            assert_eq!(Industry::parse(industry.as_str()), Some(industry));
        }
        assert_eq!(Industry::parse("RETAIL"), Some(Industry::Retail));
        assert_eq!(Industry::parse("mining"), None);
    }

    #[test]
    fn test_city_parse_accepts_spaces() {
        assert_eq!(City::parse("Port Harcourt"), Some(City::PortHarcourt));
        assert_eq!(City::parse("port-harcourt"), Some(City::PortHarcourt));
        assert_eq!(City::parse("atlantis"), None);
    }

    #[test]
    fn test_status_terminality() {
        assert!(!VerificationStatus::Pending.is_terminal());
        assert!(VerificationStatus::Verified.is_terminal());
        assert!(VerificationStatus::Failed.is_terminal());
    }

    #[test]
    fn test_new_record_starts_pending() {
        let record = SmeRecord::new(
            "owner@acme.test".to_string(),
            SmeProfile {
                name: "Acme Stores".to_string(),
                industry: Industry::Retail,
                location: City::Lagos,
                founded_date: None,
                description: "Neighborhood retail chain".to_string(),
            },
        );

        assert_eq!(record.status, VerificationStatus::Pending);
        assert_eq!(record.cycle, 1);
        assert!(record.pulse_score.is_none());
        assert!(record.profit_score.is_none());
        assert!(record.profile_complete());
    }
}
