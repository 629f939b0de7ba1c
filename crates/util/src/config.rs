use std::{env, fmt, time::Duration};

use url::Url;

pub const DEFAULT_JWT_SECRET: &str = "applytrack-dev-secret";
pub const DEFAULT_SESSION_TTL_SECS: u64 = 3600;
pub const DEFAULT_STORAGE_PUBLIC_URL: &str = "http://localhost:54321";
pub const DEFAULT_RECONNECT_ATTEMPTS: u32 = 5;
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 1000;

/// Application runtime environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
    Test,
}

impl Environment {
    fn from_str(value: &str) -> Result<Self, ConfigError> {
        match value {
            "development" | "dev" => Ok(Self::Development),
            "production" | "prod" => Ok(Self::Production),
            "test" => Ok(Self::Test),
            other => Err(ConfigError::InvalidEnvironment(other.to_string())),
        }
    }

    /// Returns `true` when the current environment should behave as development.
    pub fn is_development(self) -> bool {
        matches!(self, Self::Development)
    }

    /// Returns the canonical name used for logging/metrics labels.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
            Self::Test => "test",
        }
    }
}

/// How the mock database treats mutations aimed at rows the caller does not own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RlsViolationMode {
    #[default]
    Skip,
    Reject,
}

impl RlsViolationMode {
    fn from_str(value: &str) -> Result<Self, ConfigError> {
        match value {
            "skip" => Ok(Self::Skip),
            "reject" => Ok(Self::Reject),
            other => Err(ConfigError::InvalidRlsViolation(other.to_string())),
        }
    }
}

/// Runtime configuration resolved from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub environment: Environment,
    pub jwt_secret: String,
    pub session_ttl: Duration,
    /// Delay applied to every simulated backend call.
    pub simulated_latency: Duration,
    pub storage_public_url: Url,
    pub realtime_reconnect_attempts: u32,
    pub realtime_reconnect_delay: Duration,
    pub rls_violation: RlsViolationMode,
}

impl AppConfig {
    /// Constructs the configuration by reading and validating environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let env_value = env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());
        let environment = Environment::from_str(&env_value)?;

        let jwt_secret = match env::var("APP_JWT_SECRET") {
            Ok(secret) if !secret.trim().is_empty() => secret,
            _ if environment == Environment::Production => {
                return Err(ConfigError::Missing("APP_JWT_SECRET"))
            }
            _ => DEFAULT_JWT_SECRET.to_string(),
        };

        let session_ttl = Duration::from_secs(parse_number(
            "APP_SESSION_TTL_SECS",
            DEFAULT_SESSION_TTL_SECS,
        )?);
        if session_ttl.is_zero() {
            return Err(ConfigError::InvalidNumber {
                var: "APP_SESSION_TTL_SECS",
                value: "0".to_string(),
            });
        }
        let simulated_latency = Duration::from_millis(parse_number("APP_SIMULATED_LATENCY_MS", 0)?);

        let url_value = env::var("APP_STORAGE_PUBLIC_URL")
            .unwrap_or_else(|_| DEFAULT_STORAGE_PUBLIC_URL.to_string());
        let storage_public_url = Url::parse(&url_value).map_err(ConfigError::StorageUrl)?;

        let realtime_reconnect_attempts =
            parse_number("APP_REALTIME_RECONNECT_ATTEMPTS", DEFAULT_RECONNECT_ATTEMPTS)?;
        let realtime_reconnect_delay = Duration::from_millis(parse_number(
            "APP_REALTIME_RECONNECT_DELAY_MS",
            DEFAULT_RECONNECT_DELAY_MS,
        )?);
        if realtime_reconnect_attempts == 0 {
            return Err(ConfigError::InvalidNumber {
                var: "APP_REALTIME_RECONNECT_ATTEMPTS",
                value: "0".to_string(),
            });
        }

        let rls_violation = match env::var("APP_RLS_VIOLATION") {
            Ok(value) => RlsViolationMode::from_str(&value)?,
            Err(_) => RlsViolationMode::default(),
        };

        Ok(Self {
            environment,
            jwt_secret,
            session_ttl,
            simulated_latency,
            storage_public_url,
            realtime_reconnect_attempts,
            realtime_reconnect_delay,
            rls_violation,
        })
    }
}

fn parse_number<T: std::str::FromStr>(var: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(var) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidNumber { var, value }),
        Err(_) => Ok(default),
    }
}

/// Errors that can occur during configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    InvalidEnvironment(String),
    Missing(&'static str),
    InvalidNumber { var: &'static str, value: String },
    StorageUrl(url::ParseError),
    InvalidRlsViolation(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidEnvironment(value) => write!(
                f,
                "APP_ENV must be one of 'development', 'production', or 'test' (got {value})"
            ),
            Self::Missing(var) => write!(f, "{var} must be set in production"),
            Self::InvalidNumber { var, value } => {
                write!(f, "{var} must be a positive integer (got {value})")
            }
            Self::StorageUrl(err) => write!(f, "invalid APP_STORAGE_PUBLIC_URL value: {err}"),
            Self::InvalidRlsViolation(value) => write!(
                f,
                "APP_RLS_VIOLATION must be 'skip' or 'reject' (got {value})"
            ),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{LazyLock, Mutex};

    static ENV_GUARD: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

    const VARS: [&str; 8] = [
        "APP_ENV",
        "APP_JWT_SECRET",
        "APP_SESSION_TTL_SECS",
        "APP_SIMULATED_LATENCY_MS",
        "APP_STORAGE_PUBLIC_URL",
        "APP_REALTIME_RECONNECT_ATTEMPTS",
        "APP_REALTIME_RECONNECT_DELAY_MS",
        "APP_RLS_VIOLATION",
    ];

    fn clear_env() {
        for var in VARS {
            env::remove_var(var);
        }
    }

    #[test]
    fn loads_defaults_in_development() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        clear_env();

        let config = AppConfig::from_env().expect("config should load with defaults");
        assert_eq!(config.environment, Environment::Development);
        assert_eq!(config.jwt_secret, DEFAULT_JWT_SECRET);
        assert_eq!(config.session_ttl, Duration::from_secs(3600));
        assert_eq!(config.simulated_latency, Duration::ZERO);
        assert_eq!(config.storage_public_url.as_str(), "http://localhost:54321/");
        assert_eq!(config.realtime_reconnect_attempts, 5);
        assert_eq!(config.realtime_reconnect_delay, Duration::from_millis(1000));
        assert_eq!(config.rls_violation, RlsViolationMode::Skip);
    }

    #[test]
    fn rejects_invalid_environment() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        clear_env();
        env::set_var("APP_ENV", "invalid");

        let err = AppConfig::from_env().expect_err("invalid env should error");
        assert!(matches!(err, ConfigError::InvalidEnvironment(value) if value == "invalid"));

        clear_env();
    }

    #[test]
    fn production_requires_jwt_secret() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        clear_env();
        env::set_var("APP_ENV", "production");

        let err = AppConfig::from_env().expect_err("secret required");
        assert!(matches!(err, ConfigError::Missing("APP_JWT_SECRET")));

        env::set_var("APP_JWT_SECRET", "prod-secret");
        let config = AppConfig::from_env().expect("config should load");
        assert_eq!(config.environment, Environment::Production);
        assert_eq!(config.jwt_secret, "prod-secret");

        clear_env();
    }

    #[test]
    fn parses_custom_values() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        clear_env();
        env::set_var("APP_ENV", "test");
        env::set_var("APP_SESSION_TTL_SECS", "60");
        env::set_var("APP_SIMULATED_LATENCY_MS", "25");
        env::set_var("APP_STORAGE_PUBLIC_URL", "https://files.example.test/api");
        env::set_var("APP_REALTIME_RECONNECT_ATTEMPTS", "2");
        env::set_var("APP_REALTIME_RECONNECT_DELAY_MS", "10");
        env::set_var("APP_RLS_VIOLATION", "reject");

        let config = AppConfig::from_env().expect("config should load");
        assert_eq!(config.environment, Environment::Test);
        assert_eq!(config.session_ttl, Duration::from_secs(60));
        assert_eq!(config.simulated_latency, Duration::from_millis(25));
        assert_eq!(config.storage_public_url.host_str(), Some("files.example.test"));
        assert_eq!(config.realtime_reconnect_attempts, 2);
        assert_eq!(config.realtime_reconnect_delay, Duration::from_millis(10));
        assert_eq!(config.rls_violation, RlsViolationMode::Reject);

        clear_env();
    }

    #[test]
    fn rejects_malformed_values() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        clear_env();

        env::set_var("APP_SIMULATED_LATENCY_MS", "soon");
        let err = AppConfig::from_env().expect_err("bad latency");
        assert!(
            matches!(err, ConfigError::InvalidNumber { var: "APP_SIMULATED_LATENCY_MS", .. })
        );
        env::remove_var("APP_SIMULATED_LATENCY_MS");

        env::set_var("APP_SESSION_TTL_SECS", "0");
        assert!(matches!(
            AppConfig::from_env(),
            Err(ConfigError::InvalidNumber { var: "APP_SESSION_TTL_SECS", .. })
        ));
        env::remove_var("APP_SESSION_TTL_SECS");

        env::set_var("APP_REALTIME_RECONNECT_ATTEMPTS", "0");
        assert!(matches!(
            AppConfig::from_env(),
            Err(ConfigError::InvalidNumber { var: "APP_REALTIME_RECONNECT_ATTEMPTS", .. })
        ));
        env::remove_var("APP_REALTIME_RECONNECT_ATTEMPTS");

        env::set_var("APP_RLS_VIOLATION", "ignore");
        assert!(matches!(
            AppConfig::from_env(),
            Err(ConfigError::InvalidRlsViolation(value)) if value == "ignore"
        ));

        env::set_var("APP_RLS_VIOLATION", "skip");
        env::set_var("APP_STORAGE_PUBLIC_URL", "not a url");
        assert!(matches!(
            AppConfig::from_env(),
            Err(ConfigError::StorageUrl(_))
        ));

        clear_env();
    }
}
