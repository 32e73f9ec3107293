use std::path::{Path, PathBuf};

use axum::{body::Bytes, extract::multipart::Field};
use futures_util::{Stream, StreamExt};
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{error, warn};

#[derive(Debug, Error)]
pub enum StagingError {
    #[error("upload exceeds the {limit} byte limit")]
    TooLarge { limit: u64 },

    #[error("uploaded file is empty")]
    Empty,

    #[error("upload stream interrupted: {0}")]
    Interrupted(String),

    #[error("failed to write staging file: {0}")]
    Io(#[from] std::io::Error),
}

/// Buffered writer for one staged upload. Dropping it without `finish` leaves
/// a partial file behind; call `abort` on every error path.
pub struct StagingWriter {
    path: PathBuf,
    file: BufWriter<File>,
    written: u64,
    limit: u64,
}

impl StagingWriter {
    pub async fn create(path: &Path, limit: u64) -> Result<Self, StagingError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = File::create(path).await?;

        Ok(Self {
            path: path.to_path_buf(),
            file: BufWriter::new(file),
            written: 0,
            limit,
        })
    }

    pub async fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), StagingError> {
        let len = chunk.len() as u64;
        if self.written + len > self.limit {
            return Err(StagingError::TooLarge { limit: self.limit });
        }

        self.file.write_all(chunk).await?;
        self.written += len;
        Ok(())
    }

    pub async fn finish(mut self) -> Result<u64, StagingError> {
        if self.written == 0 {
            self.abort().await;
            return Err(StagingError::Empty);
        }
        self.file.flush().await?;
        self.file.get_mut().sync_all().await?;
        Ok(self.written)
    }

    pub async fn abort(self) {
        drop(self.file);
        if let Err(e) = tokio::fs::remove_file(&self.path).await {
            warn!("Failed to remove partial upload {}: {}", self.path.display(), e);
        }
    }
}

/// Streams a byte stream to `path`, returning the number of bytes written.
/// The partial file is removed on any failure.
pub async fn stream_to_file<S, E>(mut stream: S, path: &Path, limit: u64) -> Result<u64, StagingError>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: std::fmt::Display,
{
    let mut writer = StagingWriter::create(path, limit).await?;

    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(c) => c,
            Err(e) => {
                error!("Stream error: {}", e);
                writer.abort().await;
                return Err(StagingError::Interrupted(e.to_string()));
            }
        };

        if let Err(e) = writer.write_chunk(&chunk).await {
            error!("Staging error: {}", e);
            writer.abort().await;
            return Err(e);
        }
    }

    writer.finish().await
}

/// Stages a multipart file field on local disk.
pub async fn stage_field(field: Field<'_>, path: &Path, limit: u64) -> Result<u64, StagingError> {
    stream_to_file(field, path, limit).await
}
