use std::env;
use std::str::FromStr;

pub enum EnvKey {
    ServerPort,
    AppMode,
    DatabaseUrl,
    DbMaxConnections,
    RedisUrl,
    RabbitMqUrl,
    MinioUrl,
    MinioBucket,
    MinioAccessKey,
    MinioSecretKey,
    MinioRegion,
    PublicBaseUrl,
    StagingDir,
    WorkDir,
    FfmpegPath,
    HlsRenditions,
    HlsSegmentSeconds,
    TranscodeTimeoutBaseSecs,
    TranscodeTimeoutPerMbSecs,
    TranscodeTimeoutMaxSecs,
    UploadConcurrency,
    UploadMaxAttempts,
    UploadTimeoutSecs,
    JobLeaseSecs,
    MaxUploadBytes,
    KeepFailedArtifacts,
    WorkerId,
}

impl EnvKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvKey::ServerPort => "APP_PORT",
            EnvKey::AppMode => "APP_MODE",
            EnvKey::DatabaseUrl => "DATABASE_URL",
            EnvKey::DbMaxConnections => "DB_MAX_CONNECTIONS",
            EnvKey::RedisUrl => "REDIS_URL",
            EnvKey::RabbitMqUrl => "RABBITMQ_URL",
            EnvKey::MinioUrl => "MINIO_ENDPOINT",
            EnvKey::MinioBucket => "MINIO_BUCKET_VIDEOS",
            EnvKey::MinioAccessKey => "AWS_ACCESS_KEY_ID",
            EnvKey::MinioSecretKey => "AWS_SECRET_ACCESS_KEY",
            EnvKey::MinioRegion => "AWS_REGION",
            EnvKey::PublicBaseUrl => "PUBLIC_BASE_URL",
            EnvKey::StagingDir => "STAGING_DIR",
            EnvKey::WorkDir => "WORK_DIR",
            EnvKey::FfmpegPath => "FFMPEG_PATH",
            EnvKey::HlsRenditions => "HLS_RENDITIONS",
            EnvKey::HlsSegmentSeconds => "HLS_SEGMENT_SECONDS",
            EnvKey::TranscodeTimeoutBaseSecs => "TRANSCODE_TIMEOUT_BASE_SECS",
            EnvKey::TranscodeTimeoutPerMbSecs => "TRANSCODE_TIMEOUT_PER_MB_SECS",
            EnvKey::TranscodeTimeoutMaxSecs => "TRANSCODE_TIMEOUT_MAX_SECS",
            EnvKey::UploadConcurrency => "UPLOAD_CONCURRENCY",
            EnvKey::UploadMaxAttempts => "UPLOAD_MAX_ATTEMPTS",
            EnvKey::UploadTimeoutSecs => "UPLOAD_TIMEOUT_SECS",
            EnvKey::JobLeaseSecs => "JOB_LEASE_SECS",
            EnvKey::MaxUploadBytes => "MAX_UPLOAD_BYTES",
            EnvKey::KeepFailedArtifacts => "KEEP_FAILED_ARTIFACTS",
            EnvKey::WorkerId => "WORKER_ID",
        }
    }
}

pub fn get(key: EnvKey) -> Result<String, env::VarError> {
    env::var(key.as_str())
}

pub fn get_opt(key: EnvKey) -> Option<String> {
    env::var(key.as_str()).ok().filter(|v| !v.trim().is_empty())
}

pub fn get_or(key: EnvKey, default: &str) -> String {
    env::var(key.as_str()).unwrap_or_else(|_| default.to_string())
}

pub fn get_parsed<T: FromStr>(key: EnvKey, default: T) -> T {
    match get(key) {
        Ok(val) => val.parse::<T>().unwrap_or(default),
        Err(_) => default,
    }
}
