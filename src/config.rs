use crate::error::{Error, Result};
use dirs::home_dir;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

const CONFIG_FILE: &str = "config.json";
const DB_FILE: &str = "logs.db";

pub const DIR_ENV: &str = "PROCLOG_DIR";
pub const MAX_AGE_ENV: &str = "PROCLOG_MAX_AGE_HOURS";

/// Two weeks.
pub const DEFAULT_MAX_AGE_HOURS: u64 = 14 * 24;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub log_dir: PathBuf,
    /// `None` disables the startup prune.
    pub auto_prune_max_age_hours: Option<u64>,
}

impl Config {
    /// Resolve settings from the environment, a local `.env`, then
    /// `config.json` in the default directory.
    pub fn load() -> Result<Self> {
        dotenv::dotenv().ok();

        let file = read_config_file(&default_log_dir().join(CONFIG_FILE))?;

        let log_dir = env::var(DIR_ENV)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
            .or_else(|| file.log_dir.clone())
            .unwrap_or_else(default_log_dir);

        let auto_prune_max_age_hours = match env::var(MAX_AGE_ENV) {
            Ok(raw) => parse_max_age(&raw)?,
            Err(_) => match file.max_age {
                Some(raw) => parse_max_age(&raw)?,
                None => Some(DEFAULT_MAX_AGE_HOURS),
            },
        };

        Ok(Config {
            log_dir,
            auto_prune_max_age_hours,
        })
    }

    pub fn with_dir(log_dir: impl Into<PathBuf>) -> Self {
        Config {
            log_dir: log_dir.into(),
            auto_prune_max_age_hours: Some(DEFAULT_MAX_AGE_HOURS),
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.log_dir.join(DB_FILE)
    }
}

pub fn default_log_dir() -> PathBuf {
    if let Some(home) = home_dir() {
        home.join(".proclog")
    } else {
        let uid = std::process::id();
        PathBuf::from(format!("/tmp/proclog_{}", uid))
    }
}

#[derive(Debug, Default)]
struct FileSettings {
    log_dir: Option<PathBuf>,
    max_age: Option<String>,
}

fn read_config_file(path: &Path) -> Result<FileSettings> {
    if !path.exists() {
        return Ok(FileSettings::default());
    }

    let content = fs::read_to_string(path)?;
    let config: serde_json::Value = serde_json::from_str(&content)?;

    let max_age = match config.get("max_age_hours") {
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        Some(serde_json::Value::String(s)) => Some(s.clone()),
        _ => None,
    };

    Ok(FileSettings {
        log_dir: config
            .get("log_dir")
            .and_then(|v| v.as_str())
            .map(PathBuf::from),
        max_age,
    })
}

/// `0`, `off` and `none` disable auto-pruning.
fn parse_max_age(raw: &str) -> Result<Option<u64>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(Some(DEFAULT_MAX_AGE_HOURS));
    }
    if matches!(raw.to_ascii_lowercase().as_str(), "off" | "none") {
        return Ok(None);
    }
    match raw.parse::<u64>() {
        Ok(0) => Ok(None),
        Ok(hours) => Ok(Some(hours)),
        Err(_) => Err(Error::validation(format!(
            "{} must be a number of hours or 'off', got '{}'",
            MAX_AGE_ENV, raw
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn max_age_parsing() {
        assert_eq!(parse_max_age("48").unwrap(), Some(48));
        assert_eq!(parse_max_age("0").unwrap(), None);
        assert_eq!(parse_max_age("OFF").unwrap(), None);
        assert_eq!(parse_max_age("").unwrap(), Some(DEFAULT_MAX_AGE_HOURS));
        assert!(matches!(parse_max_age("two weeks"), Err(Error::Validation(_))));
    }

    #[test]
    fn config_file_values_are_read() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        fs::write(&path, r#"{"log_dir": "/var/tmp/pl", "max_age_hours": 72}"#).unwrap();

        let settings = read_config_file(&path).unwrap();
        assert_eq!(settings.log_dir, Some(PathBuf::from("/var/tmp/pl")));
        assert_eq!(settings.max_age.as_deref(), Some("72"));
    }

    #[test]
    fn missing_config_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let settings = read_config_file(&dir.path().join(CONFIG_FILE)).unwrap();
        assert!(settings.log_dir.is_none());
        assert!(settings.max_age.is_none());
    }

    #[test]
    fn db_lives_in_log_dir() {
        let config = Config::with_dir("/srv/logs");
        assert_eq!(config.db_path(), PathBuf::from("/srv/logs/logs.db"));
        assert_eq!(config.auto_prune_max_age_hours, Some(336));
    }
}
