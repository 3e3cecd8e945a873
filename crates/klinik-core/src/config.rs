use std::time::Duration;

use anyhow::Result;
use config::Config;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub database: DatabaseConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub jwt: JwtConfig,
    pub authz: AuthzConfig,
    #[serde(default)]
    pub bootstrap: Option<BootstrapConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u8,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    /// ## Summary
    /// Returns the bind address in the format "host:port".
    #[must_use]
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

/// Token signing and lifetime settings.
#[derive(Clone, Deserialize)]
pub struct JwtConfig {
    pub access_secret: String,
    pub refresh_secret: String,
    pub issuer: String,
    pub access_ttl_minutes: u32,
    pub refresh_ttl_hours: u32,
    pub leeway_seconds: u64,
}

impl JwtConfig {
    #[must_use]
    pub fn access_ttl(&self) -> Duration {
        Duration::from_secs(u64::from(self.access_ttl_minutes) * 60)
    }

    #[must_use]
    pub fn refresh_ttl(&self) -> Duration {
        Duration::from_secs(u64::from(self.refresh_ttl_hours) * 3600)
    }

    /// Lifetime of a session marker. An access token is still accepted
    /// `leeway_seconds` past its `exp`, so the marker outlives it by as much.
    #[must_use]
    pub fn session_ttl(&self) -> Duration {
        self.access_ttl() + Duration::from_secs(self.leeway_seconds)
    }
}

// Secrets stay out of the startup log line.
impl std::fmt::Debug for JwtConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtConfig")
            .field("access_secret", &"<redacted>")
            .field("refresh_secret", &"<redacted>")
            .field("issuer", &self.issuer)
            .field("access_ttl_minutes", &self.access_ttl_minutes)
            .field("refresh_ttl_hours", &self.refresh_ttl_hours)
            .field("leeway_seconds", &self.leeway_seconds)
            .finish()
    }
}

/// Policy synchronization and decision settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthzConfig {
    pub sync_retry_attempts: u32,
    pub sync_retry_backoff_ms: u64,
    pub decision_timeout_ms: u64,
    /// Minimum spacing between durable cross-checks of one user's denials.
    pub mismatch_check_interval_ms: u64,
}

impl AuthzConfig {
    #[must_use]
    pub fn sync_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.sync_retry_backoff_ms)
    }

    #[must_use]
    pub fn decision_timeout(&self) -> Duration {
        Duration::from_millis(self.decision_timeout_ms)
    }

    #[must_use]
    pub fn mismatch_check_interval(&self) -> Duration {
        Duration::from_millis(self.mismatch_check_interval_ms)
    }
}

impl Default for AuthzConfig {
    fn default() -> Self {
        Self {
            sync_retry_attempts: 3,
            sync_retry_backoff_ms: 50,
            decision_timeout_ms: 250,
            mismatch_check_interval_ms: 5000,
        }
    }
}

/// Superuser account created at startup when it does not exist yet.
#[derive(Clone, Deserialize)]
pub struct BootstrapConfig {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for BootstrapConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BootstrapConfig")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl Settings {
    /// ## Summary
    /// Loads configuration from `.env` file, environment variables and `config.toml`.
    /// Environment variables use the `KLINIK_` prefix and `__` between sections,
    /// e.g. `KLINIK_JWT__ACCESS_SECRET`.
    ///
    /// ## Errors
    /// Returns an error if building the configuration or deserializing it fails.
    pub fn load() -> Result<Self> {
        Ok(Config::builder()
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8080)?
            .set_default("database.max_connections", 4)?
            .set_default("logging.level", "info")?
            .set_default("jwt.issuer", "klinik-rbac")?
            .set_default("jwt.access_ttl_minutes", 15)?
            .set_default("jwt.refresh_ttl_hours", 168)?
            .set_default("jwt.leeway_seconds", 0)?
            .set_default("authz.sync_retry_attempts", 3)?
            .set_default("authz.sync_retry_backoff_ms", 50)?
            .set_default("authz.decision_timeout_ms", 250)?
            .set_default("authz.mismatch_check_interval_ms", 5000)?
            // TOML file
            .add_source(config::File::with_name("config.toml").required(false))
            // Env (and .env file, loaded by `load_config`) wins over the file
            .add_source(
                config::Environment::with_prefix("KLINIK")
                    .prefix_separator("_")
                    .separator("__")
                    .ignore_empty(true)
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize::<Settings>()?)
    }
}

/// ## Summary
/// Loads configuration from environment variables and `.env` file.
///
/// ## Errors
/// Returns an error if loading or deserializing the configuration fails.
pub fn load_config() -> Result<Settings> {
    dotenvy::dotenv().ok();

    Settings::load()
}
