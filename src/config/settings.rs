use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::config::env::{self, EnvKey};
use crate::media::rendition::{self, RenditionSpec};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AppMode {
    Api,
    Worker,
    All,
}

impl AppMode {
    pub fn runs_api(self) -> bool {
        matches!(self, AppMode::Api | AppMode::All)
    }

    pub fn runs_worker(self) -> bool {
        matches!(self, AppMode::Worker | AppMode::All)
    }
}

impl std::str::FromStr for AppMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "api" => Ok(AppMode::Api),
            "worker" => Ok(AppMode::Worker),
            "all" | "" => Ok(AppMode::All),
            other => Err(format!("unknown mode '{}', expected api|worker|all", other)),
        }
    }
}

/// Encoder invocation and timeout budget.
#[derive(Clone, Debug)]
pub struct TranscodeSettings {
    pub ffmpeg_path: PathBuf,
    pub renditions: Vec<RenditionSpec>,
    pub segment_seconds: u32,
    pub timeout_base: Duration,
    pub timeout_per_mb: Duration,
    pub timeout_max: Duration,
}

impl TranscodeSettings {
    /// Wall-clock budget for a whole job, proportional to the input size.
    pub fn timeout_for(&self, input_bytes: u64) -> Duration {
        let megabytes = input_bytes.div_ceil(1024 * 1024);
        let scaled = self
            .timeout_per_mb
            .saturating_mul(u32::try_from(megabytes).unwrap_or(u32::MAX));
        self.timeout_base.saturating_add(scaled).min(self.timeout_max)
    }
}

impl Default for TranscodeSettings {
    fn default() -> Self {
        Self {
            ffmpeg_path: PathBuf::from("ffmpeg"),
            renditions: rendition::default_ladder(),
            segment_seconds: 4,
            timeout_base: Duration::from_secs(300),
            timeout_per_mb: Duration::from_secs(6),
            timeout_max: Duration::from_secs(4 * 60 * 60),
        }
    }
}

#[derive(Clone, Debug)]
pub struct PublishSettings {
    pub concurrency: usize,
    pub max_attempts: u32,
    pub upload_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for PublishSettings {
    fn default() -> Self {
        Self {
            concurrency: 4,
            max_attempts: 3,
            upload_timeout: Duration::from_secs(60),
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(8),
        }
    }
}

#[derive(Clone, Debug)]
pub struct WorkerSettings {
    pub worker_id: String,
    pub staging_dir: PathBuf,
    pub work_dir: PathBuf,
    pub lease: Duration,
    pub busy_requeue_delay: Duration,
    pub keep_failed_artifacts: bool,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            worker_id: default_worker_id(),
            staging_dir: std::env::temp_dir().join("lecture-pipeline/staging"),
            work_dir: std::env::temp_dir().join("lecture-pipeline/work"),
            lease: Duration::from_secs(120),
            busy_requeue_delay: Duration::from_secs(5),
            keep_failed_artifacts: false,
        }
    }
}

fn default_worker_id() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "worker".to_string());
    format!("{}-{}", host, std::process::id())
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub server_port: u16,
    pub mode: AppMode,
    pub database_url: String,
    pub db_max_connections: u32,
    pub redis_url: String,
    pub rabbitmq_url: String,
    pub minio_url: String,
    pub minio_bucket: String,
    pub minio_access_key: String,
    pub minio_secret_key: String,
    pub minio_region: String,
    pub public_base_url: Option<String>,
    pub max_upload_bytes: u64,
    pub transcode: TranscodeSettings,
    pub publish: PublishSettings,
    pub worker: WorkerSettings,
}

fn required(key: EnvKey) -> Result<String, ConfigError> {
    let name = key.as_str();
    env::get(key).map_err(|_| ConfigError::Missing(name))
}

fn secs(key: EnvKey, default: u64) -> Duration {
    Duration::from_secs(env::get_parsed(key, default))
}

impl AppConfig {
    pub fn new() -> Result<Self, ConfigError> {
        let mode = env::get_or(EnvKey::AppMode, "all")
            .parse::<AppMode>()
            .map_err(|reason| ConfigError::Invalid { key: EnvKey::AppMode.as_str(), reason })?;

        let public_base_url = match env::get_opt(EnvKey::PublicBaseUrl) {
            Some(raw) => {
                url::Url::parse(&raw).map_err(|e| ConfigError::Invalid {
                    key: EnvKey::PublicBaseUrl.as_str(),
                    reason: e.to_string(),
                })?;
                Some(raw.trim_end_matches('/').to_string())
            }
            None => None,
        };

        let renditions = match env::get_opt(EnvKey::HlsRenditions) {
            Some(raw) => rendition::parse_ladder(&raw).map_err(|reason| ConfigError::Invalid {
                key: EnvKey::HlsRenditions.as_str(),
                reason,
            })?,
            None => rendition::default_ladder(),
        };

        let transcode_defaults = TranscodeSettings::default();
        let transcode = TranscodeSettings {
            ffmpeg_path: PathBuf::from(env::get_or(EnvKey::FfmpegPath, "ffmpeg")),
            renditions,
            segment_seconds: env::get_parsed(EnvKey::HlsSegmentSeconds, 4u32).max(1),
            timeout_base: secs(EnvKey::TranscodeTimeoutBaseSecs, transcode_defaults.timeout_base.as_secs()),
            timeout_per_mb: secs(EnvKey::TranscodeTimeoutPerMbSecs, transcode_defaults.timeout_per_mb.as_secs()),
            timeout_max: secs(EnvKey::TranscodeTimeoutMaxSecs, transcode_defaults.timeout_max.as_secs()),
        };

        let publish = PublishSettings {
            concurrency: env::get_parsed(EnvKey::UploadConcurrency, 4usize).clamp(1, 16),
            max_attempts: env::get_parsed(EnvKey::UploadMaxAttempts, 3u32).max(1),
            upload_timeout: secs(EnvKey::UploadTimeoutSecs, 60),
            ..PublishSettings::default()
        };

        let worker_defaults = WorkerSettings::default();
        let worker = WorkerSettings {
            worker_id: env::get_opt(EnvKey::WorkerId).unwrap_or(worker_defaults.worker_id),
            staging_dir: env::get_opt(EnvKey::StagingDir)
                .map(PathBuf::from)
                .unwrap_or(worker_defaults.staging_dir),
            work_dir: env::get_opt(EnvKey::WorkDir)
                .map(PathBuf::from)
                .unwrap_or(worker_defaults.work_dir),
            lease: secs(EnvKey::JobLeaseSecs, 120).max(Duration::from_secs(15)),
            keep_failed_artifacts: env::get_parsed(EnvKey::KeepFailedArtifacts, false),
            ..worker_defaults
        };

        Ok(Self {
            server_port: env::get_parsed(EnvKey::ServerPort, 3000),
            mode,
            database_url: required(EnvKey::DatabaseUrl)?,
            db_max_connections: env::get_parsed(EnvKey::DbMaxConnections, 20u32).max(1),
            redis_url: required(EnvKey::RedisUrl)?,
            rabbitmq_url: required(EnvKey::RabbitMqUrl)?,
            minio_url: required(EnvKey::MinioUrl)?,
            minio_bucket: required(EnvKey::MinioBucket)?,
            minio_access_key: required(EnvKey::MinioAccessKey)?,
            minio_secret_key: required(EnvKey::MinioSecretKey)?,
            minio_region: env::get_or(EnvKey::MinioRegion, "us-east-1"),
            public_base_url,
            max_upload_bytes: env::get_parsed(EnvKey::MaxUploadBytes, 4u64 * 1024 * 1024 * 1024),
            transcode,
            publish,
            worker,
        })
    }
}
