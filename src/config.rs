use std::time::Duration;

use chrono::FixedOffset;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub bind_address: String,
    /// PostgreSQL connection string; in-memory stores are used when absent
    pub database_url: Option<String>,
    /// Base URL of the platform API backing ledger, profile and payout calls
    pub platform_api_url: Option<String>,
    /// Optional endpoint that receives every lifecycle event
    pub event_webhook_url: Option<String>,
    pub external_call_timeout_secs: u64,
    pub fees: FeeConfig,
    pub retry: RetryConfig,
    pub scheduler: SchedulerConfig,
}

/// Fee rates, overridable per deployment
#[derive(Debug, Deserialize, Clone)]
pub struct FeeConfig {
    pub platform_fee_rate: Decimal,
    pub processing_fee_rate: Decimal,
    /// Flat fee in whole units of the base currency
    pub withdrawal_fee: Decimal,
    pub international_fee_rate: Decimal,
    pub base_currency: String,
    /// Decimal places kept on every computed line item (0 for KRW)
    pub currency_scale: u32,
}

impl Default for FeeConfig {
    fn default() -> Self {
        Self {
            platform_fee_rate: dec!(0.15),
            processing_fee_rate: dec!(0.029),
            withdrawal_fee: dec!(1000),
            international_fee_rate: dec!(0.01),
            base_currency: "KRW".to_string(),
            currency_scale: 0,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    /// Payout attempts before a settlement is left FAILED for an operator
    pub max_attempts: u32,
    /// Linear backoff unit: the n-th retry waits `n * base_delay_secs`
    pub base_delay_secs: u64,
    pub poll_interval_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_secs: 60,
            poll_interval_secs: 5,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SchedulerConfig {
    pub tick_interval_secs: u64,
    /// Upper bound on users settled in parallel within one tick
    pub max_concurrency: usize,
    /// Wall-clock hour (in the users' zone) every schedule lands on
    pub run_hour: u32,
    pub utc_offset_minutes: i32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 3600,
            max_concurrency: 8,
            run_hour: 9,
            utc_offset_minutes: 9 * 60,
        }
    }
}

impl SchedulerConfig {
    pub fn timezone(&self) -> Result<FixedOffset, config::ConfigError> {
        FixedOffset::east_opt(self.utc_offset_minutes * 60).ok_or_else(|| {
            config::ConfigError::Message(format!(
                "scheduler.utc_offset_minutes out of range: {}",
                self.utc_offset_minutes
            ))
        })
    }
}

impl Config {
    /// Load configuration from `.env` and `SETTLEMENT_*` environment variables.
    ///
    /// Nested keys use a double underscore, e.g. `SETTLEMENT_FEES__PLATFORM_FEE_RATE=0.12`.
    pub fn from_env() -> Result<Self, config::ConfigError> {
        dotenv::dotenv().ok();

        let fees = FeeConfig::default();
        let retry = RetryConfig::default();
        let scheduler = SchedulerConfig::default();

        let settings = config::Config::builder()
            .set_default("bind_address", "0.0.0.0:8080")?
            .set_default("external_call_timeout_secs", 30)?
            .set_default("fees.platform_fee_rate", fees.platform_fee_rate.to_string())?
            .set_default("fees.processing_fee_rate", fees.processing_fee_rate.to_string())?
            .set_default("fees.withdrawal_fee", fees.withdrawal_fee.to_string())?
            .set_default("fees.international_fee_rate", fees.international_fee_rate.to_string())?
            .set_default("fees.base_currency", fees.base_currency)?
            .set_default("fees.currency_scale", fees.currency_scale)?
            .set_default("retry.max_attempts", retry.max_attempts)?
            .set_default("retry.base_delay_secs", retry.base_delay_secs)?
            .set_default("retry.poll_interval_secs", retry.poll_interval_secs)?
            .set_default("scheduler.tick_interval_secs", scheduler.tick_interval_secs)?
            .set_default("scheduler.max_concurrency", scheduler.max_concurrency as u64)?
            .set_default("scheduler.run_hour", scheduler.run_hour)?
            .set_default("scheduler.utc_offset_minutes", scheduler.utc_offset_minutes)?
            .add_source(config::Environment::with_prefix("SETTLEMENT").separator("__"))
            .build()?;

        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn external_call_timeout(&self) -> Duration {
        Duration::from_secs(self.external_call_timeout_secs)
    }

    fn validate(&self) -> Result<(), config::ConfigError> {
        let rates = [
            ("fees.platform_fee_rate", self.fees.platform_fee_rate),
            ("fees.processing_fee_rate", self.fees.processing_fee_rate),
            ("fees.international_fee_rate", self.fees.international_fee_rate),
        ];
        for (key, rate) in rates {
            if rate < Decimal::ZERO || rate > Decimal::ONE {
                return Err(config::ConfigError::Message(format!(
                    "{} must be within [0, 1], got {}",
                    key, rate
                )));
            }
        }
        if self.fees.withdrawal_fee < Decimal::ZERO {
            return Err(config::ConfigError::Message(
                "fees.withdrawal_fee must not be negative".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(config::ConfigError::Message(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.scheduler.run_hour > 23 {
            return Err(config::ConfigError::Message(format!(
                "scheduler.run_hour must be 0-23, got {}",
                self.scheduler.run_hour
            )));
        }
        if self.scheduler.max_concurrency == 0 {
            return Err(config::ConfigError::Message(
                "scheduler.max_concurrency must be at least 1".to_string(),
            ));
        }
        self.scheduler.timezone()?;
        Ok(())
    }
}
