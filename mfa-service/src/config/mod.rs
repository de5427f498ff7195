use serde::Deserialize;
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Upper bound on device trust, in days. Keeps expiry arithmetic in range.
pub const MAX_TRUST_LIFETIME_DAYS: i64 = 3650;

#[derive(Debug, Clone, Deserialize)]
pub struct MfaConfig {
    #[serde(flatten)]
    pub common: core_config::Config,
    pub environment: Environment,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub redis: RedisConfig,
    pub mfa: MfaSettings,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Dev,
    Prod,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MfaSettings {
    /// Provider codes this deployment offers.
    pub allowed_providers: Vec<String>,
    /// Base URL of the remote code verifier.
    pub verifier_url: String,
    pub verifier_timeout_ms: u64,
    pub trust_devices_enabled: bool,
    pub trust_lifetime_days: i64,
    /// Upper bound for best-effort work (trust recording, alert writes).
    pub side_effect_timeout_ms: u64,
    pub alert_queue_capacity: usize,
    pub cookie_secure: bool,
}

impl MfaSettings {
    pub fn verifier_timeout(&self) -> Duration {
        Duration::from_millis(self.verifier_timeout_ms)
    }

    pub fn side_effect_timeout(&self) -> Duration {
        Duration::from_millis(self.side_effect_timeout_ms)
    }

    pub fn trust_lifetime(&self) -> chrono::Duration {
        chrono::Duration::days(self.trust_lifetime_days)
    }
}

impl MfaConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common_config = core_config::Config::load()?;

        let env_str = env::var("ENVIRONMENT").unwrap_or_else(|_| "dev".to_string());
        let environment: Environment = env_str
            .parse()
            .map_err(|e: String| AppError::ConfigError(anyhow::anyhow!(e)))?;

        let is_prod = environment == Environment::Prod;

        let config = MfaConfig {
            common: common_config,
            environment: environment.clone(),
            service_name: get_env("SERVICE_NAME", Some("mfa-service"), is_prod)?,
            service_version: get_env("SERVICE_VERSION", Some(env!("CARGO_PKG_VERSION")), is_prod)?,
            log_level: get_env("LOG_LEVEL", Some("info"), is_prod)?,
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok().filter(|s| !s.is_empty()),
            redis: RedisConfig {
                url: get_env("REDIS_URL", Some("redis://127.0.0.1:6379"), is_prod)?,
            },
            mfa: MfaSettings {
                allowed_providers: parse_list(&get_env(
                    "MFA_ALLOWED_PROVIDERS",
                    Some("google"),
                    is_prod,
                )?),
                verifier_url: get_env("MFA_VERIFIER_URL", Some("http://localhost:8091"), is_prod)?,
                verifier_timeout_ms: get_parsed("MFA_VERIFIER_TIMEOUT_MS", "2000", is_prod)?,
                trust_devices_enabled: get_parsed("MFA_TRUST_DEVICES_ENABLED", "true", is_prod)?,
                trust_lifetime_days: get_parsed("MFA_TRUST_LIFETIME_DAYS", "30", is_prod)?,
                side_effect_timeout_ms: get_parsed("MFA_SIDE_EFFECT_TIMEOUT_MS", "500", is_prod)?,
                alert_queue_capacity: get_parsed("MFA_ALERT_QUEUE_CAPACITY", "1024", is_prod)?,
                cookie_secure: get_parsed("MFA_COOKIE_SECURE", "true", is_prod)?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.common.port == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "PORT must be greater than 0"
            )));
        }

        if self.mfa.allowed_providers.is_empty() {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "MFA_ALLOWED_PROVIDERS must name at least one provider"
            )));
        }

        if self.mfa.trust_lifetime_days <= 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "MFA_TRUST_LIFETIME_DAYS must be positive"
            )));
        }

        if self.mfa.trust_lifetime_days > MAX_TRUST_LIFETIME_DAYS {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "MFA_TRUST_LIFETIME_DAYS must not exceed {}",
                MAX_TRUST_LIFETIME_DAYS
            )));
        }

        if self.mfa.side_effect_timeout_ms == 0 || self.mfa.verifier_timeout_ms == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "MFA timeouts must be positive"
            )));
        }

        if self.mfa.alert_queue_capacity == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "MFA_ALERT_QUEUE_CAPACITY must be positive"
            )));
        }

        // In production, ensure stricter validation
        if self.environment == Environment::Prod && !self.mfa.cookie_secure {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "MFA_COOKIE_SECURE must be enabled in production"
            )));
        }

        Ok(())
    }
}

fn get_env(key: &str, default: Option<&str>, is_prod: bool) -> Result<String, AppError> {
    match env::var(key) {
        Ok(val) => Ok(val),
        Err(_) => {
            if is_prod {
                Err(AppError::ConfigError(anyhow::anyhow!(format!(
                    "{} is required in production but not set",
                    key
                ))))
            } else if let Some(def) = default {
                Ok(def.to_string())
            } else {
                Err(AppError::ConfigError(anyhow::anyhow!(format!(
                    "{} is required but not set",
                    key
                ))))
            }
        }
    }
}

fn get_parsed<T>(key: &str, default: &str, is_prod: bool) -> Result<T, AppError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    get_env(key, Some(default), is_prod)?
        .trim()
        .parse()
        .map_err(|e: T::Err| AppError::ConfigError(anyhow::anyhow!("Invalid {}: {}", key, e)))
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}

impl std::str::FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "dev" => Ok(Environment::Dev),
            "prod" => Ok(Environment::Prod),
            _ => Err(format!("Invalid environment: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> MfaConfig {
        MfaConfig {
            common: core_config::Config::default(),
            environment: Environment::Dev,
            service_name: "mfa-service".to_string(),
            service_version: "test".to_string(),
            log_level: "error".to_string(),
            otlp_endpoint: None,
            redis: RedisConfig {
                url: "redis://127.0.0.1:6379".to_string(),
            },
            mfa: MfaSettings {
                allowed_providers: vec!["google".to_string()],
                verifier_url: "http://localhost:8091".to_string(),
                verifier_timeout_ms: 2000,
                trust_devices_enabled: true,
                trust_lifetime_days: 30,
                side_effect_timeout_ms: 500,
                alert_queue_capacity: 16,
                cookie_secure: true,
            },
        }
    }

    #[test]
    fn test_valid_config_passes() {
        assert!(config().validate().is_ok());
    }

    #[test]
    fn test_rejects_empty_providers_and_bad_lifetime() {
        let mut cfg = config();
        cfg.mfa.allowed_providers.clear();
        assert!(matches!(cfg.validate(), Err(AppError::ConfigError(_))));

        let mut cfg = config();
        cfg.mfa.trust_lifetime_days = 0;
        assert!(matches!(cfg.validate(), Err(AppError::ConfigError(_))));
    }

    #[test]
    fn test_rejects_oversized_lifetime() {
        let mut cfg = config();
        cfg.mfa.trust_lifetime_days = MAX_TRUST_LIFETIME_DAYS;
        assert!(cfg.validate().is_ok());

        for days in [MAX_TRUST_LIFETIME_DAYS + 1, 100_000_000, i64::MAX] {
            cfg.mfa.trust_lifetime_days = days;
            assert!(matches!(cfg.validate(), Err(AppError::ConfigError(_))));
        }
    }

    #[test]
    fn test_prod_requires_secure_cookie() {
        let mut cfg = config();
        cfg.environment = Environment::Prod;
        cfg.mfa.cookie_secure = false;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_parse_list() {
        assert_eq!(parse_list(" Google, totp ,,"), vec!["google", "totp"]);
        assert!(parse_list("").is_empty());
    }

    #[test]
    fn test_environment_from_str() {
        assert_eq!("PROD".parse::<Environment>(), Ok(Environment::Prod));
        assert!("staging".parse::<Environment>().is_err());
    }
}
