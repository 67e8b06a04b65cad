use crate::models::Provider;
use crate::services::{RotationSettings, TierThresholds};
use rust_decimal::Decimal;
use secrecy::Secret;
use service_core::config::{self as core_config, get_env, optional_env, parse_env};
use service_core::error::AppError;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct CredentialServiceConfig {
    pub common: core_config::Config,
    pub service_name: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    /// Base64 32-byte key for secret encryption at rest.
    pub encryption_key: Secret<String>,
    pub rotation: RotationConfig,
    pub tiers: TierConfig,
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone)]
pub struct RotationConfig {
    pub providers: Vec<Provider>,
    pub cooldown_seconds: i64,
}

#[derive(Debug, Clone)]
pub struct TierConfig {
    pub standard_threshold_pct: Decimal,
    pub fallback_threshold_pct: Decimal,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub interval_seconds: u64,
}

impl CredentialServiceConfig {
    pub fn from_env() -> Result<Self, AppError> {
        // Handles .env and APP__PORT
        let common = core_config::Config::load()?;

        let config = Self {
            common,
            service_name: get_env("SERVICE_NAME", Some("credential-service"))?,
            log_level: get_env("LOG_LEVEL", Some("info"))?,
            otlp_endpoint: optional_env("OTLP_ENDPOINT"),
            database: DatabaseConfig {
                url: get_env("DATABASE_URL", None)?,
                max_connections: parse_env("DB_MAX_CONNECTIONS", "10")?,
                min_connections: parse_env("DB_MIN_CONNECTIONS", "1")?,
            },
            encryption_key: Secret::new(get_env("CREDENTIAL_ENCRYPTION_KEY", None)?),
            rotation: RotationConfig {
                providers: parse_providers(&get_env(
                    "ROTATION_PROVIDERS",
                    Some("openai,anthropic"),
                )?)?,
                cooldown_seconds: parse_env("ROTATION_COOLDOWN_SECONDS", "3600")?,
            },
            tiers: TierConfig {
                standard_threshold_pct: parse_env("TIER_STANDARD_THRESHOLD_PCT", "85")?,
                fallback_threshold_pct: parse_env("TIER_FALLBACK_THRESHOLD_PCT", "100")?,
            },
            scheduler: SchedulerConfig {
                enabled: parse_env("ROTATION_SCHEDULER_ENABLED", "true")?,
                interval_seconds: parse_env("ROTATION_SCHEDULER_INTERVAL_SECONDS", "300")?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.database.min_connections > self.database.max_connections {
            return Err(config_error(
                "DB_MIN_CONNECTIONS must not exceed DB_MAX_CONNECTIONS",
            ));
        }
        if self.rotation.cooldown_seconds < 0 {
            return Err(config_error("ROTATION_COOLDOWN_SECONDS must not be negative"));
        }
        let tiers = &self.tiers;
        if tiers.standard_threshold_pct <= Decimal::ZERO
            || tiers.standard_threshold_pct > tiers.fallback_threshold_pct
        {
            return Err(config_error(
                "tier thresholds must satisfy 0 < standard <= fallback",
            ));
        }
        if self.scheduler.enabled && self.scheduler.interval_seconds == 0 {
            return Err(config_error(
                "ROTATION_SCHEDULER_INTERVAL_SECONDS must be positive",
            ));
        }
        Ok(())
    }

    pub fn rotation_settings(&self) -> RotationSettings {
        RotationSettings {
            providers: self.rotation.providers.clone(),
            cooldown: chrono::Duration::seconds(self.rotation.cooldown_seconds),
        }
    }

    pub fn tier_thresholds(&self) -> TierThresholds {
        TierThresholds {
            standard_pct: self.tiers.standard_threshold_pct,
            fallback_pct: self.tiers.fallback_threshold_pct,
        }
    }
}

impl SchedulerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }
}

fn config_error(message: &str) -> AppError {
    AppError::ConfigError(anyhow::anyhow!("{}", message))
}

/// Comma separated, duplicates dropped, order kept.
fn parse_providers(raw: &str) -> Result<Vec<Provider>, AppError> {
    let mut providers = Vec::new();
    for item in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let provider: Provider = item
            .parse()
            .map_err(|e: String| AppError::ConfigError(anyhow::anyhow!(e)))?;
        if !providers.contains(&provider) {
            providers.push(provider);
        }
    }
    Ok(providers)
}
