// src/utils/config.rs
//! Agent configuration
//!
//! Every recognized option carries an explicit default. Sources are layered
//! in order: struct defaults, optional config file (`lumen.toml`, or the path
//! in `LUMEN_CONFIG`), then `LUMEN__*` environment variables
//! (e.g. `LUMEN__QUEUE__MAX_BATCH_SIZE=100`).

use crate::delivery::batch::Envelope;
use crate::delivery::queue::QueueConfig;
use crate::interception::http_interceptor::InterceptorConfig;
use crate::observability::LoggingConfig;
use crate::recording::manager::RecordingConfig;
use crate::session::controller::SessionConfig;
use crate::utils::errors::{AgentError, Result};
use serde::{Deserialize, Serialize};

/// Top-level agent configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Collector base URL; every path is appended to it
    pub api_url: String,

    /// Project API key (bearer token and body field)
    pub api_key: String,

    /// Application identifier
    pub app_id: String,

    /// Deployment environment
    pub environment: String,

    /// Release / build identifier
    pub release: Option<String>,

    /// Log delivery failures and raise the default log level
    pub debug: bool,

    /// SQLite file backing the durable identity store; in memory when unset
    pub storage_path: Option<String>,

    pub queue: QueueConfig,
    pub session: SessionConfig,
    pub recording: RecordingConfig,
    pub interception: InterceptorConfig,
    pub logging: LoggingConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            api_url: String::new(),
            api_key: String::new(),
            app_id: String::new(),
            environment: "production".to_string(),
            release: None,
            debug: false,
            storage_path: None,
            queue: QueueConfig::default(),
            session: SessionConfig::default(),
            recording: RecordingConfig::default(),
            interception: InterceptorConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl AgentConfig {
    /// Load from file and environment, then validate
    pub fn load() -> Result<Self> {
        let path = std::env::var("LUMEN_CONFIG").unwrap_or_else(|_| "lumen".to_string());

        let settings = config::Config::builder()
            .add_source(config::File::with_name(&path).required(false))
            .add_source(
                config::Environment::with_prefix("LUMEN")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("interception.ignore_hosts")
                    .try_parsing(true),
            )
            .build()?;

        let config: AgentConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document layered over the defaults
    pub fn from_toml(source: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from_str(source, config::FileFormat::Toml))
            .build()?;

        let config: AgentConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Refuse configurations that would produce malformed telemetry
    pub fn validate(&self) -> Result<()> {
        if self.api_url.trim().is_empty() {
            return Err(AgentError::Config("api_url is required".to_string()));
        }
        if !self.api_url.starts_with("http://") && !self.api_url.starts_with("https://") {
            return Err(AgentError::Config(format!(
                "api_url must be an http(s) URL: {}",
                self.api_url
            )));
        }
        if self.api_key.trim().is_empty() {
            return Err(AgentError::Config("api_key is required".to_string()));
        }
        if self.app_id.trim().is_empty() {
            return Err(AgentError::Config("app_id is required".to_string()));
        }
        if self.queue.max_batch_size == 0 {
            return Err(AgentError::Config(
                "queue.max_batch_size must be at least 1".to_string(),
            ));
        }
        if self.queue.flush_interval_ms == 0 || self.session.heartbeat_interval_ms == 0 {
            return Err(AgentError::Config(
                "flush and heartbeat intervals must be non-zero".to_string(),
            ));
        }

        self.recording.validate().map_err(AgentError::Config)?;

        Ok(())
    }

    pub(crate) fn envelope(&self) -> Envelope {
        Envelope {
            api_key: self.api_key.clone(),
            app_id: self.app_id.clone(),
            environment: self.environment.clone(),
            release: self.release.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> AgentConfig {
        AgentConfig {
            api_url: "https://collector.example.com".to_string(),
            api_key: "key_123".to_string(),
            app_id: "app_abc".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults() {
        let config = AgentConfig::default();
        assert_eq!(config.environment, "production");
        assert_eq!(config.queue.max_batch_size, 50);
        assert_eq!(config.queue.flush_interval_ms, 5_000);
        assert_eq!(config.session.heartbeat_interval_ms, 30_000);
        assert_eq!(config.recording.max_batch_events, 20);
        assert!(!config.debug);
    }

    #[test]
    fn test_missing_identity_fields_rejected() {
        assert!(matches!(
            AgentConfig::default().validate(),
            Err(AgentError::Config(_))
        ));

        let mut config = valid();
        config.api_key = "  ".to_string();
        assert!(config.validate().is_err());

        let mut config = valid();
        config.app_id.clear();
        assert!(config.validate().is_err());

        let mut config = valid();
        config.api_url = "collector.example.com".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_valid_config() {
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn test_from_toml_merges_defaults() {
        let config = AgentConfig::from_toml(
            r#"
            api_url = "http://localhost:4318"
            api_key = "key_123"
            app_id = "shop"
            release = "2.0.1"

            [queue]
            max_batch_size = 10

            [recording]
            sample_rate = 0.5
            "#,
        )
        .unwrap();

        assert_eq!(config.queue.max_batch_size, 10);
        assert_eq!(config.queue.flush_interval_ms, 5_000);
        assert_eq!(config.recording.sample_rate, 0.5);
        assert_eq!(config.release.as_deref(), Some("2.0.1"));
        assert_eq!(config.environment, "production");
    }

    #[test]
    fn test_from_toml_rejects_zero_threshold() {
        let result = AgentConfig::from_toml(
            r#"
            api_url = "http://localhost:4318"
            api_key = "key_123"
            app_id = "shop"

            [queue]
            max_batch_size = 0
            "#,
        );
        assert!(result.is_err());
    }
}
