//! Runtime settings read from the environment (after `.env` is loaded).

use anyhow::{bail, Context, Result};
use sqlx::mysql::MySqlConnectOptions;
use std::str::FromStr;
use std::time::Duration;

use crate::header::HEADER_SCAN_ROWS;
use crate::upsert::{BatchSettings, DEFAULT_BATCH_SIZE, DEFAULT_MAX_ATTEMPTS};

/// Database connection settings. Either `url` is set, or the discrete parts
/// from `DB_USER`, `DB_PASSWORD`, `DB_HOST`, `DB_PORT`, `DB_NAME`.
#[derive(Debug, Clone)]
pub struct DbSettings {
    pub url: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub host: String,
    pub port: u16,
    pub name: Option<String>,
    pub max_connections: u32,
    pub lock_wait_timeout_secs: u64,
}

impl DbSettings {
    pub fn connect_options(&self) -> Result<MySqlConnectOptions> {
        if let Some(url) = &self.url {
            return MySqlConnectOptions::from_str(url).context("DB_URL is not a valid MySQL URL");
        }

        let (Some(user), Some(name)) = (&self.user, &self.name) else {
            bail!("database not configured: set DB_URL, or DB_USER and DB_NAME");
        };
        let mut options = MySqlConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(user)
            .database(name);
        if let Some(password) = &self.password {
            options = options.password(password);
        }
        Ok(options)
    }

    /// Where the importer connects, without credentials.
    pub fn describe(&self) -> String {
        match (&self.url, &self.name) {
            (Some(_), _) => "DB_URL".to_string(),
            (None, Some(name)) => format!("{}:{}/{}", self.host, self.port, name),
            (None, None) => "<unconfigured>".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub db: DbSettings,
    pub batch_size: usize,
    pub max_attempts: u32,
    pub header_scan_rows: usize,
    pub strict_header: bool,
    pub seed_cache: bool,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let settings = Self {
            db: DbSettings {
                url: var("DB_URL"),
                user: var("DB_USER"),
                password: lookup("DB_PASSWORD"),
                host: var("DB_HOST").unwrap_or_else(|| "127.0.0.1".to_string()),
                port: parse_or(var("DB_PORT"), "DB_PORT", 3306)?,
                name: var("DB_NAME"),
                max_connections: parse_or(var("DB_MAX_CONNECTIONS"), "DB_MAX_CONNECTIONS", 2)?,
                lock_wait_timeout_secs: parse_or(
                    var("IMPORT_LOCK_WAIT_TIMEOUT_SECS"),
                    "IMPORT_LOCK_WAIT_TIMEOUT_SECS",
                    120,
                )?,
            },
            batch_size: parse_or(var("IMPORT_BATCH_SIZE"), "IMPORT_BATCH_SIZE", DEFAULT_BATCH_SIZE)?,
            max_attempts: parse_or(
                var("IMPORT_MAX_ATTEMPTS"),
                "IMPORT_MAX_ATTEMPTS",
                DEFAULT_MAX_ATTEMPTS,
            )?,
            header_scan_rows: parse_or(
                var("IMPORT_HEADER_SCAN_ROWS"),
                "IMPORT_HEADER_SCAN_ROWS",
                HEADER_SCAN_ROWS,
            )?,
            strict_header: parse_flag(var("IMPORT_STRICT_HEADER"), "IMPORT_STRICT_HEADER", false)?,
            seed_cache: parse_flag(var("IMPORT_SEED_CACHE"), "IMPORT_SEED_CACHE", true)?,
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            bail!("batch size must be at least 1");
        }
        if self.max_attempts == 0 {
            bail!("max attempts must be at least 1");
        }
        if self.db.max_connections == 0 {
            bail!("DB_MAX_CONNECTIONS must be at least 1");
        }
        Ok(())
    }

    pub fn batch(&self) -> BatchSettings {
        BatchSettings {
            batch_size: self.batch_size,
            max_attempts: self.max_attempts,
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(8),
        }
    }
}

fn parse_or<T>(value: Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match value {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{key} has an invalid value: {raw:?}")),
        None => Ok(default),
    }
}

fn parse_flag(value: Option<String>, key: &str, default: bool) -> Result<bool> {
    match value.as_deref().map(|v| v.trim().to_ascii_lowercase()) {
        None => Ok(default),
        Some(v) => match v.as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => bail!("{key} must be true or false, got {v:?}"),
        },
    }
}
