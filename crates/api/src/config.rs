//! Application configuration

use std::env;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    // Server
    pub bind_address: String,
    pub public_url: String,

    // Database
    pub database_url: String,
    pub database_max_connections: u32,

    // Redis. Without it the rate limiter counts in process memory.
    pub redis_url: Option<String>,

    // Authentication
    pub jwt_secret: String,
    pub jwt_expiry_hours: i64,
    pub api_key_hmac_secret: String,

    // Feature flags
    pub enable_billing: bool,

    /// Upper bound for request bodies, webhook forms included
    pub max_request_body_bytes: usize,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            // Server
            bind_address: env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string()),
            public_url: env::var("PUBLIC_URL")
                .unwrap_or_else(|_| "http://localhost:3000".to_string()),

            // Database
            database_url: env::var("DATABASE_URL")
                .map_err(|_| ConfigError::Missing("DATABASE_URL"))?,
            database_max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "20".to_string())
                .parse()
                .unwrap_or(20),

            // Redis
            redis_url: env::var("REDIS_URL").ok().filter(|url| !url.is_empty()),

            // Authentication
            jwt_secret: require_secret("JWT_SECRET")?,
            jwt_expiry_hours: env::var("JWT_EXPIRY_HOURS")
                .unwrap_or_else(|_| "24".to_string())
                .parse()
                .unwrap_or(24),
            api_key_hmac_secret: require_secret("API_KEY_HMAC_SECRET")?,

            // Feature flags
            enable_billing: env::var("ENABLE_BILLING")
                .unwrap_or_else(|_| "true".to_string())
                .parse()
                .unwrap_or(true),

            max_request_body_bytes: env::var("MAX_REQUEST_BODY_BYTES")
                .unwrap_or_else(|_| "262144".to_string()) // 256KB default
                .parse()
                .unwrap_or(262_144),
        })
    }
}

/// Signing secrets must be present and at least 32 characters
fn require_secret(name: &'static str) -> Result<String, ConfigError> {
    let secret = env::var(name).map_err(|_| ConfigError::Missing(name))?;
    if secret.len() < 32 {
        return Err(ConfigError::WeakSecret(name));
    }
    Ok(secret)
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("Weak secret: {0} must be at least 32 characters")]
    WeakSecret(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    /// Helper to set required env vars for testing
    fn setup_minimal_config() {
        env::set_var("DATABASE_URL", "postgres://test");
        env::set_var(
            "JWT_SECRET",
            "test-jwt-secret-must-be-at-least-32-characters-long",
        );
        env::set_var(
            "API_KEY_HMAC_SECRET",
            "test-hmac-secret-must-be-at-least-32-chars",
        );
    }

    /// Helper to clear env vars after tests
    fn cleanup_config() {
        for var in [
            "DATABASE_URL",
            "JWT_SECRET",
            "API_KEY_HMAC_SECRET",
            "REDIS_URL",
            "ENABLE_BILLING",
        ] {
            env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn test_minimal_config_defaults() {
        cleanup_config();
        setup_minimal_config();

        let config = Config::from_env().unwrap();
        assert_eq!(config.bind_address, "0.0.0.0:3000");
        assert_eq!(config.database_max_connections, 20);
        assert!(config.redis_url.is_none());
        assert!(config.enable_billing);

        cleanup_config();
    }

    #[test]
    #[serial]
    fn test_secret_validation() {
        cleanup_config();
        setup_minimal_config();

        env::remove_var("JWT_SECRET");
        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::Missing("JWT_SECRET"))
        ));

        env::set_var("JWT_SECRET", "too-short");
        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::WeakSecret("JWT_SECRET"))
        ));

        setup_minimal_config();
        env::set_var("API_KEY_HMAC_SECRET", "short");
        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::WeakSecret("API_KEY_HMAC_SECRET"))
        ));

        cleanup_config();
    }

    #[test]
    #[serial]
    fn test_empty_redis_url_means_in_memory() {
        cleanup_config();
        setup_minimal_config();
        env::set_var("REDIS_URL", "");
        env::set_var("ENABLE_BILLING", "false");

        let config = Config::from_env().unwrap();
        assert!(config.redis_url.is_none());
        assert!(!config.enable_billing);

        cleanup_config();
    }
}
