use anyhow::Result;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::types::SessionContext;

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub backend: BackendConfig,
    pub http: HttpConfig,
    pub pipeline: PipelineConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub base_url: String,
    pub access_token: Option<String>,
    pub anon_key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    /// Applies to the byte transfer only
    pub upload_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub finalize_max_attempts: u32,
    /// Attempt `n` waits `n * finalize_backoff` before the next try
    pub finalize_backoff: Duration,
    pub upload_settle: Duration,
    pub dimension_probe_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub filter: String,
    pub log_dir: Option<PathBuf>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:54321".to_string(),
            access_token: None,
            anon_key: None,
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            upload_timeout: Duration::from_secs(60),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            finalize_max_attempts: 3,
            finalize_backoff: Duration::from_millis(1000),
            upload_settle: Duration::from_millis(1000),
            dimension_probe_timeout: Duration::from_millis(5000),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "fortune_uploader=debug".to_string(),
            log_dir: None,
        }
    }
}

impl BackendConfig {
    pub fn session(&self) -> SessionContext {
        SessionContext {
            base_url: self.base_url.clone(),
            access_token: self.access_token.clone(),
            anon_key: self.anon_key.clone(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the configuration from any key lookup; empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        Ok(Self {
            backend: BackendConfig {
                base_url: var("SUPABASE_URL")
                    .unwrap_or_else(|| "http://localhost:54321".to_string()),
                access_token: var("SUPABASE_ACCESS_TOKEN"),
                anon_key: var("SUPABASE_ANON_KEY"),
            },
            http: HttpConfig {
                connect_timeout: Duration::from_secs(
                    var("HTTP_CONNECT_TIMEOUT_SECS")
                        .unwrap_or_else(|| "10".to_string())
                        .parse()?,
                ),
                request_timeout: Duration::from_secs(
                    var("HTTP_REQUEST_TIMEOUT_SECS")
                        .unwrap_or_else(|| "30".to_string())
                        .parse()?,
                ),
                upload_timeout: Duration::from_secs(
                    var("UPLOAD_TIMEOUT_SECS")
                        .unwrap_or_else(|| "60".to_string())
                        .parse()?,
                ),
            },
            pipeline: PipelineConfig {
                finalize_max_attempts: var("FINALIZE_MAX_ATTEMPTS")
                    .unwrap_or_else(|| "3".to_string())
                    .parse()?,
                finalize_backoff: Duration::from_millis(
                    var("FINALIZE_BACKOFF_MS")
                        .unwrap_or_else(|| "1000".to_string())
                        .parse()?,
                ),
                upload_settle: Duration::from_millis(
                    var("UPLOAD_SETTLE_MS")
                        .unwrap_or_else(|| "1000".to_string())
                        .parse()?,
                ),
                dimension_probe_timeout: Duration::from_millis(
                    var("DIMENSION_PROBE_TIMEOUT_MS")
                        .unwrap_or_else(|| "5000".to_string())
                        .parse()?,
                ),
            },
            logging: LoggingConfig {
                filter: var("RUST_LOG").unwrap_or_else(|| "fortune_uploader=debug".to_string()),
                log_dir: var("LOG_DIR").map(PathBuf::from),
            },
        })
    }
}
