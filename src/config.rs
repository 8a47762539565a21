use serde::Deserialize;

use crate::settlement::reconciler::MAX_RECONCILE_LIMIT;
use crate::settlement::scheduler::ReconcileFrequency;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_address: String,
    pub db_max_connections: u32,
    /// Conversion rate applied when a payment carries no explicit credit amount
    pub cents_per_credit: i64,
    pub default_pool_slug: String,
    pub reconcile_limit: i64,
    /// "daily", "hourly" or "off"
    pub reconcile_schedule: String,
    pub reconcile_hour_utc: u32,
}

impl Config {
    pub fn from_env() -> Result<Self, config::ConfigError> {
        let settings = config::Config::builder()
            .set_default("database_url", "postgresql://localhost/volunteer_ledger")?
            .set_default("bind_address", "0.0.0.0:8080")?
            .set_default("db_max_connections", 20)?
            .set_default("cents_per_credit", 100)?
            .set_default("default_pool_slug", "general")?
            .set_default("reconcile_limit", 200)?
            .set_default("reconcile_schedule", "hourly")?
            .set_default("reconcile_hour_utc", 2)?
            .add_source(config::Environment::default().try_parsing(true))
            .build()?;

        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), config::ConfigError> {
        if self.cents_per_credit <= 0 {
            return Err(config::ConfigError::Message(format!(
                "CENTS_PER_CREDIT must be positive, got {}",
                self.cents_per_credit
            )));
        }
        if self.reconcile_hour_utc > 23 {
            return Err(config::ConfigError::Message(format!(
                "RECONCILE_HOUR_UTC must be 0-23, got {}",
                self.reconcile_hour_utc
            )));
        }
        if crate::ledger::slug::PoolSlug::parse(&self.default_pool_slug).is_err() {
            return Err(config::ConfigError::Message(format!(
                "DEFAULT_POOL_SLUG is not a valid slug: {:?}",
                self.default_pool_slug
            )));
        }
        self.frequency()?;
        Ok(())
    }

    /// Batch size for reconciliation runs, clamped to the hard cap
    pub fn reconcile_limit(&self) -> i64 {
        self.reconcile_limit.clamp(1, MAX_RECONCILE_LIMIT)
    }

    pub fn frequency(&self) -> Result<Option<ReconcileFrequency>, config::ConfigError> {
        match self.reconcile_schedule.to_ascii_lowercase().as_str() {
            "daily" => Ok(Some(ReconcileFrequency::Daily)),
            "hourly" => Ok(Some(ReconcileFrequency::Hourly)),
            "off" | "none" | "disabled" => Ok(None),
            other => Err(config::ConfigError::Message(format!(
                "RECONCILE_SCHEDULE must be daily, hourly or off, got {:?}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Config {
        Config {
            database_url: "postgresql://localhost/test".to_string(),
            bind_address: "127.0.0.1:0".to_string(),
            db_max_connections: 5,
            cents_per_credit: 100,
            default_pool_slug: "general".to_string(),
            reconcile_limit: 200,
            reconcile_schedule: "hourly".to_string(),
            reconcile_hour_utc: 2,
        }
    }

    #[test]
    fn test_reconcile_limit_is_capped() {
        let mut config = sample();
        config.reconcile_limit = 50_000;
        assert_eq!(config.reconcile_limit(), MAX_RECONCILE_LIMIT);

        config.reconcile_limit = 0;
        assert_eq!(config.reconcile_limit(), 1);
    }

    #[test]
    fn test_schedule_parsing() {
        let mut config = sample();
        assert_eq!(config.frequency().unwrap(), Some(ReconcileFrequency::Hourly));

        config.reconcile_schedule = "OFF".to_string();
        assert_eq!(config.frequency().unwrap(), None);

        config.reconcile_schedule = "weekly".to_string();
        assert!(config.frequency().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_rate() {
        let mut config = sample();
        config.cents_per_credit = 0;
        assert!(config.validate().is_err());
    }
}
