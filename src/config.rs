// Engine configuration
// Defaults → optional config/default.toml → PULSE__* environment overrides.

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct EngineConfig {
    pub database: DatabaseConfig,
    pub server: ServerConfig,
    pub scoring: ScoringConfig,
    pub provider: ProviderConfig,
    pub session: SessionConfig,
    pub marketplace: MarketplaceConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub path: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ScoringConfig {
    /// Minimum distinct months of transaction history before scores compute.
    pub min_history_months: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProviderConfig {
    /// Retry budget for transient failures, including the first attempt.
    pub max_attempts: u32,

    /// Initial backoff delay; doubles per retry.
    pub base_delay_ms: u64,

    /// Per-attempt timeout for the provider call.
    pub timeout_secs: u64,

    /// Background ledger refresh interval. 0 disables the schedule.
    pub refresh_interval_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SessionConfig {
    pub ttl_minutes: i64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MarketplaceConfig {
    pub page_size: usize,
}

impl EngineConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let config = Config::builder()
            .set_default("database.path", "pulse.db")?
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8000)?
            .set_default("scoring.min_history_months", 6)?
            .set_default("provider.max_attempts", 3)?
            .set_default("provider.base_delay_ms", 500)?
            .set_default("provider.timeout_secs", 10)?
            .set_default("provider.refresh_interval_secs", 3600)?
            .set_default("session.ttl_minutes", 30)?
            .set_default("marketplace.page_size", 10)?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            // PULSE__SERVER__PORT etc. Double underscore separates nested keys.
            .add_source(
                Environment::with_prefix("PULSE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            database: DatabaseConfig {
                path: "pulse.db".to_string(),
            },
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8000,
            },
            scoring: ScoringConfig {
                min_history_months: 6,
            },
            provider: ProviderConfig {
                max_attempts: 3,
                base_delay_ms: 500,
                timeout_secs: 10,
                refresh_interval_secs: 3600,
            },
            session: SessionConfig { ttl_minutes: 30 },
            marketplace: MarketplaceConfig { page_size: 10 },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_consistent() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.scoring.min_history_months, 6);
        assert_eq!(cfg.marketplace.page_size, 10);
        assert_eq!(cfg.server_addr(), "0.0.0.0:8000");
    }
}
