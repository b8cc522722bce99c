//! Configuration for the recorder orchestrator.

use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};

use crate::error::ConfigError;

/// Memory ceiling for a single recorder container (2 GiB).
pub const RECORDER_MEMORY_LIMIT_BYTES: i64 = 2 * 1024 * 1024 * 1024;

/// Main configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub queue: QueueConfig,
    pub database: DatabaseConfig,
    pub recorder: RecorderConfig,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        Ok(Self {
            queue: QueueConfig::from_env()?,
            database: DatabaseConfig::from_env()?,
            recorder: RecorderConfig::from_env()?,
        })
    }
}

/// Queue server and queue key configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub redis_url: SecretString,
    /// Queue the external API pushes join requests onto.
    pub join_queue: String,
    /// Queue the external API pushes cancellation requests onto.
    pub kill_queue: String,
    /// Downstream queue notified once a recording completes.
    pub transcription_queue: String,
    /// How long a single blocking pop waits before returning empty.
    pub pop_timeout: Duration,
    /// Pause after a failed queue read.
    pub error_backoff: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            redis_url: SecretString::from("redis://127.0.0.1:6379".to_string()),
            join_queue: "join_meet_queue".to_string(),
            kill_queue: "kill_recorder_queue".to_string(),
            transcription_queue: "transcription-queue".to_string(),
            pop_timeout: Duration::from_secs(5),
            error_backoff: Duration::from_millis(1000),
        }
    }
}

impl QueueConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let redis_url = optional_env("REDIS_URL")?
            .map(SecretString::from)
            .unwrap_or(defaults.redis_url);

        let pop_timeout_secs: u64 = parse_optional_env("QUEUE_POP_TIMEOUT_SECS", 5)?;
        let error_backoff_ms: u64 = parse_optional_env("QUEUE_ERROR_BACKOFF_MS", 1000)?;

        Ok(Self {
            redis_url,
            join_queue: optional_env("JOIN_QUEUE")?.unwrap_or(defaults.join_queue),
            kill_queue: optional_env("KILL_QUEUE")?.unwrap_or(defaults.kill_queue),
            transcription_queue: optional_env("TRANSCRIPTION_QUEUE")?
                .unwrap_or(defaults.transcription_queue),
            pop_timeout: Duration::from_secs(pop_timeout_secs),
            error_backoff: Duration::from_millis(error_backoff_ms),
        })
    }

    /// Get the Redis URL (exposes the secret).
    pub fn redis_url(&self) -> &str {
        self.redis_url.expose_secret()
    }
}

/// Database configuration.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: SecretString,
    pub pool_size: usize,
    /// Table holding recording rows.
    pub table: String,
    /// Column names inside `table`.
    pub columns: RecordingColumns,
}

/// Column layout of the recordings table.
///
/// `status` holds the SCREAMING_SNAKE_CASE status name, either as text or as
/// a Postgres enum named by `status_type`. `error_metadata` is JSON or JSONB.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordingColumns {
    pub id: String,
    pub status: String,
    pub error_metadata: String,
    pub file_name: String,
    /// Enum type of the status column; `None` when it is plain text.
    pub status_type: Option<String>,
}

impl Default for RecordingColumns {
    fn default() -> Self {
        Self {
            id: "id".to_string(),
            status: "status".to_string(),
            error_metadata: "error_metadata".to_string(),
            file_name: "file_name".to_string(),
            status_type: None,
        }
    }
}

impl RecordingColumns {
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let column = |key: &str, default: String| -> Result<String, ConfigError> {
            let name = optional_env(key)?.unwrap_or(default);
            validate_identifier(key, &name)?;
            Ok(name)
        };

        let status_type = optional_env("RECORDINGS_STATUS_TYPE")?;
        if let Some(name) = &status_type {
            validate_identifier("RECORDINGS_STATUS_TYPE", name)?;
        }

        Ok(Self {
            id: column("RECORDINGS_ID_COLUMN", defaults.id)?,
            status: column("RECORDINGS_STATUS_COLUMN", defaults.status)?,
            error_metadata: column("RECORDINGS_METADATA_COLUMN", defaults.error_metadata)?,
            file_name: column("RECORDINGS_FILE_NAME_COLUMN", defaults.file_name)?,
            status_type,
        })
    }
}

impl DatabaseConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let url = optional_env("DATABASE_URL")?.ok_or_else(|| ConfigError::MissingRequired {
            key: "DATABASE_URL".to_string(),
            hint: "Set DATABASE_URL to the PostgreSQL instance that owns recordings".to_string(),
        })?;

        let pool_size: usize = parse_optional_env("DATABASE_POOL_SIZE", 10)?;
        if pool_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "DATABASE_POOL_SIZE".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        let table = optional_env("RECORDINGS_TABLE")?.unwrap_or_else(|| "recordings".to_string());
        validate_identifier("RECORDINGS_TABLE", &table)?;

        Ok(Self {
            url: SecretString::from(url),
            pool_size,
            table,
            columns: RecordingColumns::from_env()?,
        })
    }

    /// Get the database URL (exposes the secret).
    pub fn url(&self) -> &str {
        self.url.expose_secret()
    }
}

/// Recorder container and retry configuration.
#[derive(Debug, Clone)]
pub struct RecorderConfig {
    /// Worker image reference.
    pub image: String,
    /// Global cap on concurrently running recorder containers.
    pub max_concurrent_containers: usize,
    /// Attempts per recording, counting the first.
    pub max_retries: u32,
    /// Recordings directory as seen by this process.
    pub recordings_dir: PathBuf,
    /// Recordings directory as seen by the container runtime host.
    pub recordings_host_dir: PathBuf,
    /// Pause between a failed attempt and the next one.
    pub retry_backoff: Duration,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        let recordings_dir = default_recordings_dir();
        Self {
            image: "ghcr.io/meet-recorder/recorder:latest".to_string(),
            max_concurrent_containers: 2,
            max_retries: 3,
            recordings_host_dir: recordings_dir.clone(),
            recordings_dir,
            retry_backoff: Duration::from_millis(2000),
        }
    }
}

impl RecorderConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let max_concurrent_containers: usize = parse_optional_env("MAX_CONCURRENT_CONTAINERS", 2)?;
        if max_concurrent_containers == 0 {
            return Err(ConfigError::InvalidValue {
                key: "MAX_CONCURRENT_CONTAINERS".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        let max_retries: u32 = parse_optional_env("MAX_RETRIES", 3)?;
        if max_retries == 0 {
            return Err(ConfigError::InvalidValue {
                key: "MAX_RETRIES".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        let recordings_dir = optional_env("RECORDINGS_DIR")?
            .map(PathBuf::from)
            .map(absolutize)
            .unwrap_or(defaults.recordings_dir);
        let recordings_host_dir = optional_env("RECORDINGS_HOST_DIR")?
            .map(PathBuf::from)
            .map(absolutize)
            .unwrap_or_else(|| recordings_dir.clone());

        let retry_backoff_ms: u64 = parse_optional_env("RETRY_BACKOFF_MS", 2000)?;

        Ok(Self {
            image: optional_env("RECORDER_IMAGE")?.unwrap_or(defaults.image),
            max_concurrent_containers,
            max_retries,
            recordings_dir,
            recordings_host_dir,
            retry_backoff: Duration::from_millis(retry_backoff_ms),
        })
    }

    /// Create the recordings directory if it does not exist yet.
    pub fn ensure_recordings_dir(&self) -> Result<&Path, ConfigError> {
        std::fs::create_dir_all(&self.recordings_dir)?;
        Ok(&self.recordings_dir)
    }

    /// Bind spec for the shared recordings directory.
    pub fn recordings_bind(&self) -> String {
        format!(
            "{}:{}:rw",
            self.recordings_host_dir.display(),
            crate::container::RECORDINGS_MOUNT
        )
    }
}

fn default_recordings_dir() -> PathBuf {
    std::env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join("recordings")
}

/// Docker binds need absolute host paths.
fn absolutize(path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        return path;
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(&path))
        .unwrap_or(path)
}

fn validate_identifier(key: &str, value: &str) -> Result<(), ConfigError> {
    let valid = !value.is_empty()
        && value
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && value.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("'{value}' is not a plain SQL identifier"),
        })
    }
}

/// Read an env var, treating empty values as unset.
pub(crate) fn optional_env(key: &str) -> Result<Option<String>, ConfigError> {
    match std::env::var(key) {
        Ok(val) if val.is_empty() => Ok(None),
        Ok(val) => Ok(Some(val)),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("failed to read: {e}"),
        }),
    }
}

pub(crate) fn parse_optional_env<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    optional_env(key)?
        .map(|s| {
            s.parse().map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("{e}"),
            })
        })
        .transpose()
        .map(|opt| opt.unwrap_or(default))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Env vars are process-global, so serialize tests that mutate them.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn optional_env_treats_empty_as_unset() {
        let _lock = ENV_LOCK.lock();
        unsafe { std::env::set_var("_TEST_MR_EMPTY_7", "") };
        assert_eq!(optional_env("_TEST_MR_EMPTY_7").unwrap(), None);
        unsafe { std::env::remove_var("_TEST_MR_EMPTY_7") };
    }

    #[test]
    fn parse_optional_env_returns_default_when_missing() {
        let _lock = ENV_LOCK.lock();
        unsafe { std::env::remove_var("_TEST_MR_PARSE_MISSING_7") };
        let result: usize = parse_optional_env("_TEST_MR_PARSE_MISSING_7", 2).unwrap();
        assert_eq!(result, 2);
    }

    #[test]
    fn parse_optional_env_rejects_garbage() {
        let _lock = ENV_LOCK.lock();
        unsafe { std::env::set_var("_TEST_MR_PARSE_BAD_7", "two") };
        let result: Result<usize, _> = parse_optional_env("_TEST_MR_PARSE_BAD_7", 0);
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
        unsafe { std::env::remove_var("_TEST_MR_PARSE_BAD_7") };
    }

    #[test]
    fn recorder_config_defaults() {
        let _lock = ENV_LOCK.lock();
        for key in [
            "MAX_CONCURRENT_CONTAINERS",
            "MAX_RETRIES",
            "RECORDER_IMAGE",
            "RECORDINGS_DIR",
            "RECORDINGS_HOST_DIR",
            "RETRY_BACKOFF_MS",
        ] {
            unsafe { std::env::remove_var(key) };
        }

        let config = RecorderConfig::from_env().unwrap();
        assert_eq!(config.max_concurrent_containers, 2);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.retry_backoff, Duration::from_secs(2));
        assert!(config.recordings_dir.is_absolute());
        assert_eq!(config.recordings_dir, config.recordings_host_dir);
    }

    #[test]
    fn zero_container_limit_is_rejected() {
        let _lock = ENV_LOCK.lock();
        unsafe { std::env::set_var("MAX_CONCURRENT_CONTAINERS", "0") };
        let result = RecorderConfig::from_env();
        unsafe { std::env::remove_var("MAX_CONCURRENT_CONTAINERS") };
        assert!(matches!(
            result,
            Err(ConfigError::InvalidValue { ref key, .. }) if key == "MAX_CONCURRENT_CONTAINERS"
        ));
    }

    #[test]
    fn database_url_is_required() {
        let _lock = ENV_LOCK.lock();
        unsafe { std::env::remove_var("DATABASE_URL") };
        assert!(matches!(
            DatabaseConfig::from_env(),
            Err(ConfigError::MissingRequired { .. })
        ));
    }

    #[test]
    fn recording_columns_from_env() {
        let _lock = ENV_LOCK.lock();
        unsafe {
            std::env::set_var("RECORDINGS_METADATA_COLUMN", "errorMetadata");
            std::env::set_var("RECORDINGS_FILE_NAME_COLUMN", "fileName");
            std::env::set_var("RECORDINGS_STATUS_TYPE", "RecordingStatus");
            std::env::remove_var("RECORDINGS_ID_COLUMN");
            std::env::remove_var("RECORDINGS_STATUS_COLUMN");
        }
        let columns = RecordingColumns::from_env();
        unsafe {
            std::env::set_var("RECORDINGS_STATUS_COLUMN", "status\"; --");
        }
        let rejected = RecordingColumns::from_env();
        for key in [
            "RECORDINGS_METADATA_COLUMN",
            "RECORDINGS_FILE_NAME_COLUMN",
            "RECORDINGS_STATUS_TYPE",
            "RECORDINGS_STATUS_COLUMN",
        ] {
            unsafe { std::env::remove_var(key) };
        }

        let columns = columns.unwrap();
        assert_eq!(columns.id, "id");
        assert_eq!(columns.status, "status");
        assert_eq!(columns.error_metadata, "errorMetadata");
        assert_eq!(columns.file_name, "fileName");
        assert_eq!(columns.status_type.as_deref(), Some("RecordingStatus"));
        assert!(matches!(
            rejected,
            Err(ConfigError::InvalidValue { ref key, .. }) if key == "RECORDINGS_STATUS_COLUMN"
        ));
    }

    #[test]
    fn table_name_must_be_identifier() {
        assert!(validate_identifier("T", "recordings").is_ok());
        assert!(validate_identifier("T", "_Recording2").is_ok());
        assert!(validate_identifier("T", "rec; drop table x").is_err());
        assert!(validate_identifier("T", "1recordings").is_err());
    }

    #[test]
    fn ensure_recordings_dir_creates_missing_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("nested").join("recordings");
        let config = RecorderConfig {
            recordings_dir: dir.clone(),
            recordings_host_dir: dir.clone(),
            ..RecorderConfig::default()
        };
        config.ensure_recordings_dir().unwrap();
        assert!(dir.is_dir());
    }

    #[test]
    fn recordings_bind_uses_host_dir() {
        let config = RecorderConfig {
            recordings_dir: PathBuf::from("/srv/app/recordings"),
            recordings_host_dir: PathBuf::from("/data/recordings"),
            ..RecorderConfig::default()
        };
        assert_eq!(
            config.recordings_bind(),
            "/data/recordings:/app/recordings:rw"
        );
    }
}
