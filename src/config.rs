//! Configuration management for the crash report server

use serde::Deserialize;
use std::env;
use std::path::PathBuf;

use crate::conversation::digest::{DEFAULT_SHARED_SALT, DEFAULT_TOKEN_SALT, DIGEST_METHOD};
use crate::conversation::types::{MAX_UPLOAD_BYTES, SESSION_TIMEOUT_MINUTES};
use crate::error::{AppError, Result};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub archive: ArchiveConfig,
    pub protocol: ProtocolConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
}

/// Where uploaded archives end up
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum ArchiveConfig {
    Local { path: PathBuf },
    S3(S3Config),
}

#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    pub endpoint: String,
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
    pub region: Option<String>,
    pub prefix: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProtocolConfig {
    pub shared_salt: String,
    pub token_salt: String,
    pub digest_method: String,
    pub tool_name: String,
    /// Base of the phase-2 URL handed to clients
    pub upload_url: String,
    pub session_timeout_minutes: i64,
    pub max_upload_bytes: usize,
}

impl ProtocolConfig {
    pub fn session_timeout(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.session_timeout_minutes)
    }
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        ProtocolConfig {
            shared_salt: DEFAULT_SHARED_SALT.to_string(),
            token_salt: DEFAULT_TOKEN_SALT.to_string(),
            digest_method: DIGEST_METHOD.to_string(),
            tool_name: "client-app".to_string(),
            upload_url: "http://localhost:3000/api/v1/report".to_string(),
            session_timeout_minutes: SESSION_TIMEOUT_MINUTES,
            max_upload_bytes: MAX_UPLOAD_BYTES,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 3000,
            },
            database: DatabaseConfig {
                url: "sqlite:./crash_reports.db".to_string(),
            },
            archive: ArchiveConfig::Local {
                path: PathBuf::from("./archives"),
            },
            protocol: ProtocolConfig::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build the configuration from `lookup`, which maps a variable name to
    /// its value. Unset variables take their defaults; set but invalid ones
    /// are errors.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let vars = Vars(lookup);
        let defaults = ProtocolConfig::default();

        let archive = match vars.or("ARCHIVE_BACKEND", "local").as_str() {
            "s3" => ArchiveConfig::S3(S3Config {
                endpoint: vars.required("S3_ENDPOINT")?,
                bucket: vars.required("S3_BUCKET")?,
                access_key: vars.required("S3_ACCESS_KEY")?,
                secret_key: vars.required("S3_SECRET_KEY")?,
                region: vars.get("S3_REGION"),
                prefix: vars.or("S3_PREFIX", "reports"),
            }),
            "local" => ArchiveConfig::Local {
                path: PathBuf::from(vars.or("ARCHIVE_PATH", "./archives")),
            },
            other => {
                return Err(AppError::Config(format!("unknown ARCHIVE_BACKEND '{}'", other)));
            }
        };

        let session_timeout_minutes =
            vars.parsed("SESSION_TIMEOUT_MINUTES", defaults.session_timeout_minutes)?;
        if !SESSION_TIMEOUT_RANGE.contains(&session_timeout_minutes) {
            return Err(AppError::Config(format!(
                "SESSION_TIMEOUT_MINUTES must be between {} and {}, got {}",
                SESSION_TIMEOUT_RANGE.start(),
                SESSION_TIMEOUT_RANGE.end(),
                session_timeout_minutes
            )));
        }

        let max_upload_bytes = vars.parsed("MAX_UPLOAD_BYTES", defaults.max_upload_bytes)?;
        if max_upload_bytes == 0 {
            return Err(AppError::Config("MAX_UPLOAD_BYTES must be positive".to_string()));
        }

        Ok(Config {
            server: ServerConfig {
                host: vars.or("SERVER_HOST", "0.0.0.0"),
                port: vars.parsed("SERVER_PORT", 3000)?,
            },
            database: DatabaseConfig {
                url: vars.or("DATABASE_URL", "sqlite:./crash_reports.db"),
            },
            archive,
            protocol: ProtocolConfig {
                shared_salt: vars.or("SHARED_SALT", &defaults.shared_salt),
                token_salt: vars.or("TOKEN_SALT", &defaults.token_salt),
                digest_method: vars.or("DIGEST_METHOD", &defaults.digest_method),
                tool_name: vars.or("TOOL_NAME", &defaults.tool_name),
                upload_url: vars.or("UPLOAD_URL", &defaults.upload_url),
                session_timeout_minutes,
                max_upload_bytes,
            },
        })
    }
}

/// Accepted `SESSION_TIMEOUT_MINUTES`: one minute to one day
const SESSION_TIMEOUT_RANGE: std::ops::RangeInclusive<i64> = 1..=1440;

struct Vars<F>(F);

impl<F: Fn(&str) -> Option<String>> Vars<F> {
    fn get(&self, name: &str) -> Option<String> {
        (self.0)(name)
    }

    fn or(&self, name: &str, default: &str) -> String {
        self.get(name).unwrap_or_else(|| default.to_string())
    }

    fn required(&self, name: &str) -> Result<String> {
        self.get(name)
            .ok_or_else(|| AppError::Config(format!("{} must be set", name)))
    }

    fn parsed<T: std::str::FromStr>(&self, name: &str, default: T) -> Result<T> {
        match self.get(name) {
            Some(raw) => raw
                .trim()
                .parse()
                .map_err(|_| AppError::Config(format!("{} is not a valid number: {}", name, raw))),
            None => Ok(default),
        }
    }
}
