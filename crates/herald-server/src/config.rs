//! Server configuration loaded from environment variables and config files.
//!
//! Supports `.env` files for development and environment variables for
//! production. Precedence: env vars > .env file > config.toml > defaults.

use serde::Deserialize;
use std::sync::OnceLock;

static CONFIG: OnceLock<AppConfig> = OnceLock::new();

/// Get the global application configuration.
///
/// # Panics
/// Panics if config has not been initialized via [`init`].
pub fn get() -> &'static AppConfig {
    CONFIG.get().expect("Config not initialized. Call config::init() first.")
}

/// Initialize the global configuration from the environment.
///
/// Call once at startup, before anything else reads config.
pub fn init() -> Result<&'static AppConfig, config::ConfigError> {
    // Load .env file if present (development)
    let _ = dotenvy::dotenv();

    let cfg = config::Config::builder()
        // Defaults
        .set_default("server.host", "0.0.0.0")?
        .set_default("server.s2s_port", 5269)? // standard S2S port
        .set_default("server.domains", "localhost")?
        .set_default("limits.max_frame_bytes", 65_536)?
        // Optional config file
        .add_source(config::File::with_name("config").required(false))
        // Environment variables (HERALD__SERVER__DOMAINS, etc.)
        .add_source(
            config::Environment::with_prefix("HERALD")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    let app_config: AppConfig = cfg.try_deserialize()?;
    Ok(CONFIG.get_or_init(|| app_config))
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub limits: LimitsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address for the S2S listener.
    pub host: String,
    /// Port for server-to-server federation (default 5269).
    pub s2s_port: u16,
    /// Comma-separated list of domains this server hosts,
    /// e.g. `a.example,b.example`.
    pub domains: String,
}

impl ServerConfig {
    /// The hosted domains, trimmed and lowercased.
    pub fn domain_list(&self) -> Vec<String> {
        self.domains
            .split(',')
            .map(|d| d.trim().to_ascii_lowercase())
            .filter(|d| !d.is_empty())
            .collect()
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LimitsConfig {
    /// Maximum size of a single wire frame.
    pub max_frame_bytes: usize,
}
