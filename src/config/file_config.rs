use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

/// Contents of the optional TOML configuration file.
///
/// ```toml
/// db_path = "/var/lib/pezzottify/jobs.db"
///
/// [queue]
/// default_queue = "default"
/// expiry_secs = 60
/// busy_timeout_ms = 5000
/// ```
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FileConfig {
    pub db_path: Option<String>,
    pub queue: Option<QueueConfig>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct QueueConfig {
    pub default_queue: Option<String>,
    pub expiry_secs: Option<u64>,
    pub busy_timeout_ms: Option<u64>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_full_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
db_path = "/tmp/jobs.db"

[queue]
default_queue = "emails"
expiry_secs = 90
busy_timeout_ms = 250
"#
        )
        .unwrap();

        let config = FileConfig::load(file.path()).unwrap();
        assert_eq!(config.db_path.as_deref(), Some("/tmp/jobs.db"));
        let queue = config.queue.unwrap();
        assert_eq!(queue.default_queue.as_deref(), Some("emails"));
        assert_eq!(queue.expiry_secs, Some(90));
        assert_eq!(queue.busy_timeout_ms, Some(250));
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[queue]\nexpiry_secs = 30").unwrap();

        let config = FileConfig::load(file.path()).unwrap();
        assert!(config.db_path.is_none());
        let queue = config.queue.unwrap();
        assert_eq!(queue.expiry_secs, Some(30));
        assert!(queue.default_queue.is_none());
    }

    #[test]
    fn test_load_invalid_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "expiry_secs = [").unwrap();

        let err = FileConfig::load(file.path()).unwrap_err();
        assert!(err.to_string().contains("Failed to parse config file"));
    }

    #[test]
    fn test_load_missing_file() {
        let err = FileConfig::load(Path::new("/nonexistent/jobs.toml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
