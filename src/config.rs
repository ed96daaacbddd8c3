//! Configuration types, built from environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Which fax carrier delivers outbound faxes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Mock,
    Phaxio,
    Srfax,
}

impl FromStr for TransportKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mock" => Ok(Self::Mock),
            "phaxio" => Ok(Self::Phaxio),
            "srfax" => Ok(Self::Srfax),
            other => Err(ConfigError::InvalidValue {
                key: "FAX_TRANSPORT".into(),
                message: format!("unknown transport '{other}' (expected mock, phaxio or srfax)"),
            }),
        }
    }
}

/// Phaxio credentials.
#[derive(Debug, Clone)]
pub struct PhaxioConfig {
    pub api_key: SecretString,
    pub api_secret: SecretString,
}

impl PhaxioConfig {
    pub fn from_env() -> Option<Self> {
        let api_key = std::env::var("PHAXIO_API_KEY").ok()?;
        let api_secret = std::env::var("PHAXIO_API_SECRET").ok()?;
        Some(Self {
            api_key: SecretString::from(api_key),
            api_secret: SecretString::from(api_secret),
        })
    }
}

/// SRFax credentials.
#[derive(Debug, Clone)]
pub struct SrfaxConfig {
    pub access_id: String,
    pub password: SecretString,
    pub caller_id: String,
    pub sender_email: String,
}

impl SrfaxConfig {
    pub fn from_env() -> Option<Self> {
        let access_id = std::env::var("SRFAX_ACCESS_ID").ok()?;
        let password = std::env::var("SRFAX_PASSWORD").ok()?;
        Some(Self {
            access_id,
            password: SecretString::from(password),
            caller_id: std::env::var("SRFAX_CALLER_ID").unwrap_or_default(),
            sender_email: std::env::var("SRFAX_SENDER_EMAIL").unwrap_or_default(),
        })
    }
}

/// Outbound dispatch configuration.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub transport: TransportKind,
    /// Optional HTTP renderer endpoint; the built-in cover sheet is used when unset.
    pub renderer_url: Option<String>,
    /// In-progress claims older than this are released at the start of a sweep.
    pub claim_timeout: Duration,
    /// Optional in-process sweep schedule (cron syntax with seconds).
    pub sweep_cron: Option<String>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::Mock,
            renderer_url: None,
            claim_timeout: Duration::from_secs(600), // 10 minutes
            sweep_cron: None,
        }
    }
}

impl DispatchConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let transport = match std::env::var("FAX_TRANSPORT") {
            Ok(s) => s.parse()?,
            Err(_) => defaults.transport,
        };

        let claim_timeout = env_parse::<u64>("FAX_CLAIM_TIMEOUT_SECS")
            .map(Duration::from_secs)
            .unwrap_or(defaults.claim_timeout);

        let sweep_cron = std::env::var("FAX_SWEEP_CRON")
            .ok()
            .filter(|s| !s.trim().is_empty());
        if let Some(ref schedule) = sweep_cron {
            cron::Schedule::from_str(schedule).map_err(|e| ConfigError::InvalidValue {
                key: "FAX_SWEEP_CRON".into(),
                message: e.to_string(),
            })?;
        }

        Ok(Self {
            transport,
            renderer_url: std::env::var("FAX_RENDERER_URL")
                .ok()
                .filter(|s| !s.trim().is_empty()),
            claim_timeout,
            sweep_cron,
        })
    }
}

/// SMTP notification settings. `None` when `NOTIFY_SMTP_HOST` is unset.
#[derive(Debug, Clone)]
pub struct NotifyConfig {
    pub smtp_host: String,
    pub smtp_port: u16,
    pub username: String,
    pub password: SecretString,
    pub from_address: String,
    pub to_address: String,
}

impl NotifyConfig {
    pub fn from_env() -> Option<Self> {
        let smtp_host = std::env::var("NOTIFY_SMTP_HOST").ok()?;
        let smtp_port = env_parse::<u16>("NOTIFY_SMTP_PORT").unwrap_or(587);
        let username = std::env::var("NOTIFY_USERNAME").unwrap_or_default();
        let password = std::env::var("NOTIFY_PASSWORD").unwrap_or_default();
        let from_address = std::env::var("NOTIFY_FROM").unwrap_or_else(|_| username.clone());
        let to_address = std::env::var("NOTIFY_TO").unwrap_or_else(|_| from_address.clone());

        Some(Self {
            smtp_host,
            smtp_port,
            username,
            password: SecretString::from(password),
            from_address,
            to_address,
        })
    }
}

/// Service configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_path: PathBuf,
    pub port: u16,
    pub dispatch: DispatchConfig,
    pub retention_days: u32,
    pub ocr_language: String,
    pub notify: Option<NotifyConfig>,
    pub phaxio: Option<PhaxioConfig>,
    pub srfax: Option<SrfaxConfig>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let db_path = std::env::var("FAX_DESK_DB_PATH")
            .unwrap_or_else(|_| "./data/fax-desk.db".to_string());

        Ok(Self {
            db_path: PathBuf::from(db_path),
            port: env_parse("FAX_DESK_PORT").unwrap_or(8080),
            dispatch: DispatchConfig::from_env()?,
            retention_days: env_parse("FAX_RETENTION_DAYS").unwrap_or(90),
            ocr_language: std::env::var("OCR_LANGUAGE").unwrap_or_else(|_| "jpn".to_string()),
            notify: NotifyConfig::from_env(),
            phaxio: PhaxioConfig::from_env(),
            srfax: SrfaxConfig::from_env(),
        })
    }
}

/// Parse an environment variable, warning (and returning `None`) on bad input.
fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Ignoring invalid configuration value");
            None
        }
    }
}
