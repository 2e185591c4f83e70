//! Configuration for Turnstile
//!
//! CLI arguments and environment variable handling using clap.

use clap::Parser;
use std::time::Duration;

/// Turnstile - token metering and progression sync engine
#[derive(Parser, Debug, Clone)]
#[command(name = "turnstile")]
#[command(about = "Meters token consumption against weekly quotas and syncs progression state")]
pub struct Args {
    /// MongoDB connection URI (usage-metering store)
    #[arg(long, env = "MONGODB_URI", default_value = "mongodb://localhost:27017")]
    pub mongodb_uri: String,

    /// MongoDB database name
    #[arg(long, env = "MONGODB_DB", default_value = "turnstile")]
    pub mongodb_db: String,

    /// PostgreSQL connection URL (gamification store)
    #[arg(long, env = "DATABASE_URL", default_value = "postgres://localhost:5432/turnstile")]
    pub database_url: String,

    /// Maximum PostgreSQL pool connections
    #[arg(long, env = "PG_MAX_CONNECTIONS", default_value = "5")]
    pub pg_max_connections: u32,

    /// Tokens a user may spend per reset window
    #[arg(long, env = "WEEKLY_LIMIT", default_value = "100000")]
    pub weekly_limit: i64,

    /// Unprocessed-token balance required before a conversion batch runs
    #[arg(long, env = "CONVERSION_THRESHOLD", default_value = "300000")]
    pub conversion_threshold: i64,

    /// Tokens converted into one experience point
    #[arg(long, env = "TOKENS_PER_EXPERIENCE", default_value = "10000")]
    pub tokens_per_experience: i64,

    /// Experience points per level
    #[arg(long, env = "EXPERIENCE_PER_LEVEL", default_value = "500")]
    pub experience_per_level: i64,

    /// Seconds between reconciliation sweeps
    #[arg(long, env = "SWEEP_INTERVAL_SECS", default_value = "3600")]
    pub sweep_interval_secs: u64,

    /// Per-user deadline during a sweep, in milliseconds
    #[arg(long, env = "SWEEP_USER_TIMEOUT_MS", default_value = "5000")]
    pub sweep_user_timeout_ms: u64,

    /// Maximum application attempts for a failed identity change
    #[arg(long, env = "FEED_MAX_ATTEMPTS", default_value = "5")]
    pub feed_max_attempts: u32,

    /// Seconds before a failed identity change is retried
    #[arg(long, env = "FEED_RETRY_DELAY_SECS", default_value = "30")]
    pub feed_retry_delay_secs: u64,

    /// Enable development mode (in-memory stores, no external connections)
    #[arg(long, env = "DEV_MODE", default_value = "false")]
    pub dev_mode: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Args {
    /// Conversion parameters for the engine
    pub fn conversion_config(&self) -> crate::conversion::ConversionConfig {
        crate::conversion::ConversionConfig {
            conversion_threshold: self.conversion_threshold,
            tokens_per_experience: self.tokens_per_experience,
            experience_per_level: self.experience_per_level,
        }
    }

    /// Sweep cadence and per-user deadline
    pub fn sweep_config(&self) -> crate::reconcile::SweepConfig {
        crate::reconcile::SweepConfig {
            interval: Duration::from_secs(self.sweep_interval_secs),
            user_timeout: Duration::from_millis(self.sweep_user_timeout_ms),
        }
    }

    /// Retry bounds for the identity change processor
    pub fn processor_config(&self) -> crate::feed::processor::ProcessorConfig {
        crate::feed::processor::ProcessorConfig {
            max_attempts: self.feed_max_attempts,
            retry_delay: Duration::from_secs(self.feed_retry_delay_secs),
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.weekly_limit <= 0 {
            return Err("WEEKLY_LIMIT must be positive".to_string());
        }
        if self.tokens_per_experience <= 0 {
            return Err("TOKENS_PER_EXPERIENCE must be positive".to_string());
        }
        if self.experience_per_level <= 0 {
            return Err("EXPERIENCE_PER_LEVEL must be positive".to_string());
        }
        if self.conversion_threshold < self.tokens_per_experience {
            return Err(
                "CONVERSION_THRESHOLD must be at least TOKENS_PER_EXPERIENCE, otherwise a batch can convert to zero experience"
                    .to_string(),
            );
        }
        if self.feed_max_attempts == 0 {
            return Err("FEED_MAX_ATTEMPTS must be at least 1".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_args() -> Args {
        Args::parse_from(["turnstile"])
    }

    #[test]
    fn test_default_constants() {
        let args = default_args();
        assert_eq!(args.weekly_limit, 100_000);
        assert_eq!(args.conversion_threshold, 300_000);
        assert_eq!(args.tokens_per_experience, 10_000);
        assert_eq!(args.experience_per_level, 500);
        assert_eq!(args.sweep_interval_secs, 3600);
        assert!(args.validate().is_ok());
    }

    #[test]
    fn test_threshold_must_cover_one_experience_point() {
        let mut args = default_args();
        args.conversion_threshold = 5_000;
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_rejects_non_positive_limit() {
        let mut args = default_args();
        args.weekly_limit = 0;
        assert!(args.validate().is_err());
    }
}
