//! Server configuration loaded from a `KEY=VALUE` file

use std::fmt::Display;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::warn;

/// Runtime configuration for the server.
///
/// Every field has a default, so a missing key falls back rather than
/// failing. A malformed value is an error: silently running on a default
/// port after a typo'd `PORT` line is worse than refusing to start.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Host name or address the listener binds to.
    pub host: String,
    /// TCP port the listener binds to. `0` picks an ephemeral port.
    pub port: u16,
    /// Listen backlog, and the rough ceiling on concurrent connections.
    pub max_clients: usize,
    /// Connections idle longer than this are swept.
    pub timeout_sec: u64,
    /// Capacity of the bounded task queue.
    pub queue_capacity: usize,
    /// Number of worker threads executing connection steps.
    pub worker_threads: usize,
    /// Directory that `static/` paths and video paths resolve under.
    pub root_dir: PathBuf,
    /// SQLite database file.
    pub db_path: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8080,
            max_clients: 1000,
            timeout_sec: 30,
            queue_capacity: 1000,
            worker_threads: 10,
            root_dir: PathBuf::from("."),
            db_path: PathBuf::from("ott.db"),
        }
    }
}

/// Failures while reading or interpreting the configuration file.
#[derive(Debug)]
pub enum ConfigError {
    /// The file could not be read.
    Io(io::Error),
    /// A key had a value that does not parse as its expected type.
    BadValue {
        /// The offending key.
        key: String,
        /// The value as written in the file.
        value: String,
    },
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "cannot read config file: {e}"),
            ConfigError::BadValue { key, value } => {
                write!(f, "invalid value '{value}' for config key '{key}'")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<io::Error> for ConfigError {
    fn from(value: io::Error) -> Self {
        ConfigError::Io(value)
    }
}

impl ServerConfig {
    /// Reads configuration from `path`.
    ///
    /// The format is one `KEY=VALUE` pair per line. `#` starts a comment,
    /// whitespace around keys and values is ignored, unknown keys are
    /// logged and skipped.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        let mut config = Self::default();

        for line in text.lines() {
            let line = match line.find('#') {
                Some(pos) => &line[..pos],
                None => line,
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                warn!("ignoring malformed config line '{line}'");
                continue;
            };
            let (key, value) = (key.trim(), value.trim());

            match key {
                "HOST" => config.host = value.to_string(),
                "PORT" => config.port = parse_int(key, value)?,
                "MAX_CLIENTS" => config.max_clients = parse_int(key, value)?,
                "TIMEOUT_SEC" => config.timeout_sec = parse_int(key, value)?,
                "QUEUE_CAPACITY" => config.queue_capacity = parse_int(key, value)?,
                "WORKER_THREAD_COUNT" => config.worker_threads = parse_int(key, value)?,
                "ROOT_DIR" => config.root_dir = PathBuf::from(value),
                "DB_PATH" => config.db_path = PathBuf::from(value),
                _ => warn!("unknown config key '{key}'"),
            }
        }

        Ok(config)
    }
}

fn parse_int<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::BadValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[cfg(test)]
mod test {
    use std::io::Write;

    use super::{ConfigError, ServerConfig};

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn load_applies_defaults_for_missing_keys() {
        let file = write_config("PORT = 9090\n");
        let config = ServerConfig::load(file.path()).unwrap();
        assert_eq!(9090, config.port);
        assert_eq!(1000, config.max_clients);
        assert_eq!(10, config.worker_threads);
        assert_eq!("localhost", config.host);
    }

    #[test]
    fn load_trims_whitespace_and_strips_comments() {
        let file = write_config(
            "# main settings\n  HOST =  0.0.0.0  \nPORT=8181 # override\n\nQUEUE_CAPACITY=32\n",
        );
        let config = ServerConfig::load(file.path()).unwrap();
        assert_eq!("0.0.0.0", config.host);
        assert_eq!(8181, config.port);
        assert_eq!(32, config.queue_capacity);
    }

    #[test]
    fn load_rejects_malformed_integers() {
        let file = write_config("MAX_CLIENTS=lots\n");
        match ServerConfig::load(file.path()) {
            Err(ConfigError::BadValue { key, value }) => {
                assert_eq!("MAX_CLIENTS", key);
                assert_eq!("lots", value);
            }
            other => panic!("expected BadValue, got {other:?}"),
        }
    }

    #[test]
    fn load_skips_unknown_keys() {
        let file = write_config("LOG_LEVEL=2\nTIMEOUT_SEC=5\n");
        let config = ServerConfig::load(file.path()).unwrap();
        assert_eq!(5, config.timeout_sec);
    }

    #[test]
    fn load_fails_for_missing_file() {
        assert!(matches!(
            ServerConfig::load(std::path::Path::new("/nonexistent/server.conf")),
            Err(ConfigError::Io(_))
        ));
    }
}
