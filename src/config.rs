use std::path::PathBuf;

use serde::Deserialize;

use crate::cli::Cli;

pub const DEFAULT_PORT: u16 = 25625;

/// Optional settings read from `~/.histdb/config.toml`. Every field can
/// also be given as a flag or environment variable, which win over the
/// file.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub database: Option<PathBuf>,
    pub remote: Option<String>,
    pub port: Option<u16>,
    pub key: Option<String>,
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let path = Self::path();
        if !path.exists() {
            tracing::debug!("no config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        // The file may hold the sync passphrase.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Ok(meta) = std::fs::metadata(&path) {
                if meta.permissions().mode() & 0o077 != 0 {
                    eprintln!(
                        "histdb: warning: {} is readable by other users. Consider: chmod 600 {}",
                        path.display(),
                        path.display()
                    );
                }
            }
        }
        let content = std::fs::read_to_string(&path)?;
        Ok(toml::from_str(&content)?)
    }

    pub fn path() -> PathBuf {
        histdb_dir().join("config.toml")
    }
}

/// Directory holding the history database and configuration.
pub fn histdb_dir() -> PathBuf {
    dirs::home_dir()
        .expect("Could not determine home directory")
        .join(".histdb")
}

/// Fully resolved runtime settings, built once at startup and passed to
/// everything that needs them.
#[derive(Debug, Clone)]
pub struct Settings {
    pub db: PathBuf,
    pub user: String,
    pub host: String,
    pub remote: Option<String>,
    pub port: u16,
    pub key: Option<String>,
}

impl Settings {
    pub fn resolve(cli: &Cli, config: &Config) -> anyhow::Result<Self> {
        let db = cli
            .db
            .clone()
            .or_else(|| config.database.clone())
            .unwrap_or_else(|| histdb_dir().join("history.db"));
        let user = match cli.user.clone().or_else(|| std::env::var("USER").ok()) {
            Some(u) if !u.is_empty() => u,
            _ => anyhow::bail!("could not read username from $USER and no --user flag was given"),
        };
        let host = cli.host.clone().unwrap_or_else(detect_hostname);
        let remote = cli.remote.clone().or_else(|| config.remote.clone());
        let port = cli.port.or(config.port).unwrap_or(DEFAULT_PORT);
        let key = cli.key.clone().or_else(|| config.key.clone());
        Ok(Self {
            db,
            user,
            host,
            remote,
            port,
            key,
        })
    }
}

fn detect_hostname() -> String {
    std::process::Command::new("hostname")
        .output()
        .ok()
        .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
        .unwrap_or_else(|| "unknown".into())
}
