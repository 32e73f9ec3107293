//! Uploads a local HLS tree to object storage.
//!
//! Segments and rendition playlists go first with bounded concurrency; the
//! master playlist is uploaded only after every other file landed, so a
//! partially published tree is never reachable through its master URL.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{stream, StreamExt};
use thiserror::Error;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::common::slug;
use crate::config::settings::PublishSettings;
use crate::infrastructure::storage::{ObjectMeta, ObjectStore, StoreError};
use crate::media::transcoder::MASTER_PLAYLIST;

const PLAYLIST_TYPE: &str = "application/vnd.apple.mpegurl";
const SEGMENT_TYPE: &str = "video/mp2t";
const DEFAULT_TYPE: &str = "application/octet-stream";

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("failed to enumerate artifacts under {root}: {source}")]
    Walk {
        root: PathBuf,
        source: walkdir::Error,
    },

    #[error("no master.m3u8 found under {0}")]
    MissingMaster(PathBuf),

    #[error("invalid remote folder key '{0}'")]
    InvalidFolderKey(String),

    #[error("{} of {total} uploads failed: {}", .failed_keys.len(), .failed_keys.join(", "))]
    Incomplete { failed_keys: Vec<String>, total: usize },
}

/// A file of the local tree and its `/`-separated path relative to the root.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Artifact {
    pub path: PathBuf,
    pub relative: String,
}

/// Lazy depth-first walk over every regular file under `root`, entries of
/// each directory visited in lexical order. Symlinks are not followed.
pub fn artifacts(root: &Path) -> impl Iterator<Item = Result<Artifact, walkdir::Error>> + use<> {
    let base = root.to_path_buf();
    WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_map(move |entry| match entry {
            Ok(entry) if entry.file_type().is_file() => Some(Ok(Artifact {
                relative: relative_key(&base, entry.path()),
                path: entry.into_path(),
            })),
            Ok(_) => None,
            Err(e) => Some(Err(e)),
        })
}

fn relative_key(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

pub fn content_type(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("m3u8") => PLAYLIST_TYPE,
        Some("ts") => SEGMENT_TYPE,
        _ => DEFAULT_TYPE,
    }
}

pub fn cache_control(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("m3u8") => "no-cache",
        Some("ts") => "public, max-age=31536000, immutable",
        _ => "public, max-age=3600",
    }
}

pub fn object_meta(path: &Path) -> ObjectMeta {
    ObjectMeta {
        content_type: content_type(path),
        cache_control: cache_control(path),
    }
}

pub struct ArtifactPublisher {
    store: Arc<dyn ObjectStore>,
    settings: PublishSettings,
}

impl ArtifactPublisher {
    pub fn new(store: Arc<dyn ObjectStore>, settings: PublishSettings) -> Self {
        Self { store, settings }
    }

    /// Uploads every file under `local_dir` to `<folder>/<relative path>` and
    /// returns the public URL of `<folder>/master.m3u8`.
    pub async fn publish(&self, local_dir: &Path, folder: &str) -> Result<String, PublishError> {
        if !slug::is_valid(folder) {
            return Err(PublishError::InvalidFolderKey(folder.to_string()));
        }

        let started = Instant::now();
        let files = artifacts(local_dir)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|source| PublishError::Walk { root: local_dir.to_path_buf(), source })?;

        let (masters, rest): (Vec<Artifact>, Vec<Artifact>) =
            files.into_iter().partition(|a| a.relative == MASTER_PLAYLIST);
        let Some(master) = masters.into_iter().next() else {
            return Err(PublishError::MissingMaster(local_dir.to_path_buf()));
        };
        let total = rest.len() + 1;

        let mut failed_keys: Vec<String> = stream::iter(rest)
            .map(|artifact| async move {
                let key = format!("{}/{}", folder, artifact.relative);
                match self.upload_with_retry(&key, &artifact.path).await {
                    Ok(()) => None,
                    Err(_) => Some(key),
                }
            })
            .buffer_unordered(self.settings.concurrency.max(1))
            .filter_map(|failed| async move { failed })
            .collect()
            .await;

        if !failed_keys.is_empty() {
            failed_keys.sort();
            return Err(PublishError::Incomplete { failed_keys, total });
        }

        let master_key = format!("{}/{}", folder, master.relative);
        if self.upload_with_retry(&master_key, &master.path).await.is_err() {
            return Err(PublishError::Incomplete { failed_keys: vec![master_key], total });
        }

        info!(
            folder,
            files = total,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "☁️ Published HLS tree"
        );
        Ok(self.store.public_url(&master_key))
    }

    /// Best-effort removal of everything published under `folder`.
    pub async fn remove(&self, folder: &str) -> Result<usize, StoreError> {
        if !slug::is_valid(folder) {
            return Err(StoreError::permanent(format!("invalid remote folder key '{}'", folder)));
        }
        self.store.delete_prefix(folder).await
    }

    async fn upload_with_retry(&self, key: &str, path: &Path) -> Result<(), StoreError> {
        let meta = object_meta(path);
        let max_attempts = self.settings.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let result = match tokio::time::timeout(
                self.settings.upload_timeout,
                self.store.put_file(key, path, &meta),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(StoreError::transient(format!(
                    "upload timed out after {}ms",
                    self.settings.upload_timeout.as_millis()
                ))),
            };

            match result {
                Ok(()) => return Ok(()),
                Err(e) if e.transient && attempt < max_attempts => {
                    let delay = self.backoff(attempt);
                    warn!(key, attempt, retry_in_ms = delay.as_millis() as u64, "Upload failed, retrying: {}", e);
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    warn!(key, attempt, transient = e.transient, "Upload failed permanently: {}", e);
                    return Err(e);
                }
            }
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.settings
            .backoff_base
            .saturating_mul(factor)
            .min(self.settings.backoff_max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::storage::memory::MemoryStore;
    use async_trait::async_trait;
    use std::sync::Mutex;

    const FOLDER: &str = "intro-to-rust-3f9a1c";

    fn fast_settings() -> PublishSettings {
        PublishSettings {
            concurrency: 3,
            max_attempts: 3,
            upload_timeout: Duration::from_secs(5),
            backoff_base: Duration::from_millis(1),
            backoff_max: Duration::from_millis(5),
        }
    }

    fn write_tree(root: &Path) {
        for label in ["240p", "720p"] {
            let dir = root.join(label);
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(dir.join("index.m3u8"), format!("#EXTM3U\n# {label}\n")).unwrap();
            std::fs::write(dir.join("segment_000.ts"), format!("{label}-0")).unwrap();
            std::fs::write(dir.join("segment_001.ts"), format!("{label}-1")).unwrap();
        }
        std::fs::write(root.join("master.m3u8"), "#EXTM3U\n").unwrap();
    }

    fn publisher(store: &Arc<MemoryStore>) -> ArtifactPublisher {
        ArtifactPublisher::new(store.clone(), fast_settings())
    }

    #[test]
    fn walk_is_lexical_and_slash_separated() {
        let dir = tempfile::tempdir().unwrap();
        write_tree(dir.path());

        let relative: Vec<String> = artifacts(dir.path()).map(|a| a.unwrap().relative).collect();
        assert_eq!(
            relative,
            vec![
                "240p/index.m3u8",
                "240p/segment_000.ts",
                "240p/segment_001.ts",
                "720p/index.m3u8",
                "720p/segment_000.ts",
                "720p/segment_001.ts",
                "master.m3u8",
            ]
        );
    }

    #[cfg(unix)]
    #[test]
    fn walk_skips_symlinks_instead_of_looping() {
        let dir = tempfile::tempdir().unwrap();
        write_tree(dir.path());
        std::os::unix::fs::symlink(dir.path(), dir.path().join("240p/loop")).unwrap();
        std::os::unix::fs::symlink(dir.path().join("master.m3u8"), dir.path().join("alias.m3u8")).unwrap();

        let relative: Vec<String> = artifacts(dir.path()).map(|a| a.unwrap().relative).collect();
        assert_eq!(relative.len(), 7);
        assert!(relative.iter().all(|r| !r.contains("loop") && r != "alias.m3u8"));
    }

    #[test]
    fn walk_of_missing_root_yields_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut walk = artifacts(&dir.path().join("absent"));
        assert!(walk.next().unwrap().is_err());
    }

    #[test]
    fn headers_by_extension() {
        assert_eq!(content_type(Path::new("a/master.m3u8")), "application/vnd.apple.mpegurl");
        assert_eq!(content_type(Path::new("a/240p/segment_000.ts")), "video/mp2t");
        assert_eq!(content_type(Path::new("a/poster.jpg")), "application/octet-stream");
        assert_eq!(cache_control(Path::new("index.m3u8")), "no-cache");
        assert!(cache_control(Path::new("segment_000.ts")).contains("immutable"));
    }

    #[tokio::test]
    async fn publishes_every_file_and_returns_master_url() {
        let dir = tempfile::tempdir().unwrap();
        write_tree(dir.path());
        let store = Arc::new(MemoryStore::new());

        let url = publisher(&store).publish(dir.path(), FOLDER).await.unwrap();

        assert_eq!(url, format!("https://cdn.test/{FOLDER}/master.m3u8"));
        assert_eq!(store.keys().len(), 7);
        let master = store.get(&format!("{FOLDER}/master.m3u8")).unwrap();
        assert_eq!(master.meta.content_type, PLAYLIST_TYPE);
        assert_eq!(master.meta.cache_control, "no-cache");
        let segment = store.get(&format!("{FOLDER}/720p/segment_001.ts")).unwrap();
        assert_eq!(segment.body, b"720p-1");
        assert_eq!(segment.meta.content_type, SEGMENT_TYPE);
    }

    #[tokio::test]
    async fn transient_failures_are_retried_without_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        write_tree(dir.path());
        let store = Arc::new(MemoryStore::new());
        let flaky = format!("{FOLDER}/240p/segment_001.ts");
        store.fail_transiently(&flaky, 2);

        let url = publisher(&store).publish(dir.path(), FOLDER).await.unwrap();

        assert!(url.ends_with("/master.m3u8"));
        assert_eq!(store.put_calls(&flaky), 3);
        assert_eq!(store.keys().iter().filter(|k| **k == flaky).count(), 1);
        assert_eq!(store.keys().len(), 7);
    }

    #[tokio::test]
    async fn exhausted_retries_fail_and_withhold_master() {
        let dir = tempfile::tempdir().unwrap();
        write_tree(dir.path());
        let store = Arc::new(MemoryStore::new());
        let flaky = format!("{FOLDER}/720p/segment_000.ts");
        store.fail_transiently(&flaky, 10);

        let err = publisher(&store).publish(dir.path(), FOLDER).await.unwrap_err();

        match err {
            PublishError::Incomplete { failed_keys, total } => {
                assert_eq!(failed_keys, vec![flaky.clone()]);
                assert_eq!(total, 7);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(store.put_calls(&flaky), 3);
        assert!(store.get(&format!("{FOLDER}/master.m3u8")).is_none());
    }

    #[tokio::test]
    async fn permanent_failures_are_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        write_tree(dir.path());
        let store = Arc::new(MemoryStore::new());
        let denied = format!("{FOLDER}/240p/index.m3u8");
        store.fail_permanently(&denied);

        let err = publisher(&store).publish(dir.path(), FOLDER).await.unwrap_err();

        assert!(matches!(err, PublishError::Incomplete { .. }));
        assert_eq!(store.put_calls(&denied), 1);
    }

    #[tokio::test]
    async fn republishing_overwrites_in_place() {
        let dir = tempfile::tempdir().unwrap();
        write_tree(dir.path());
        let store = Arc::new(MemoryStore::new());
        let publisher = publisher(&store);

        publisher.publish(dir.path(), FOLDER).await.unwrap();
        let first: Vec<(String, Vec<u8>)> = store
            .keys()
            .into_iter()
            .map(|k| (k.clone(), store.get(&k).unwrap().body))
            .collect();

        publisher.publish(dir.path(), FOLDER).await.unwrap();
        let second: Vec<(String, Vec<u8>)> = store
            .keys()
            .into_iter()
            .map(|k| (k.clone(), store.get(&k).unwrap().body))
            .collect();

        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn tree_without_master_is_rejected_before_upload() {
        let dir = tempfile::tempdir().unwrap();
        write_tree(dir.path());
        std::fs::remove_file(dir.path().join("master.m3u8")).unwrap();
        let store = Arc::new(MemoryStore::new());

        let err = publisher(&store).publish(dir.path(), FOLDER).await.unwrap_err();

        assert!(matches!(err, PublishError::MissingMaster(_)));
        assert!(store.keys().is_empty());
    }

    #[tokio::test]
    async fn traversal_folder_keys_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write_tree(dir.path());
        let store = Arc::new(MemoryStore::new());

        let err = publisher(&store).publish(dir.path(), "../escape").await.unwrap_err();
        assert!(matches!(err, PublishError::InvalidFolderKey(_)));
        assert!(publisher(&store).remove("a/../b").await.is_err());
    }

    #[tokio::test]
    async fn remove_only_touches_its_folder() {
        let dir = tempfile::tempdir().unwrap();
        write_tree(dir.path());
        let store = Arc::new(MemoryStore::new());
        let publisher = publisher(&store);
        publisher.publish(dir.path(), FOLDER).await.unwrap();
        publisher.publish(dir.path(), "other-lecture-aaaaaa").await.unwrap();

        let removed = publisher.remove(FOLDER).await.unwrap();

        assert_eq!(removed, 7);
        assert!(store.keys().iter().all(|k| k.starts_with("other-lecture-aaaaaa/")));
        assert_eq!(publisher.remove(FOLDER).await.unwrap(), 0);
    }

    /// Stalls the first upload of every key past the per-file timeout.
    struct StallingStore {
        inner: MemoryStore,
        stalled: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ObjectStore for StallingStore {
        async fn put_file(&self, key: &str, path: &Path, meta: &ObjectMeta) -> Result<(), StoreError> {
            let first = {
                let mut stalled = self.stalled.lock().unwrap();
                if stalled.iter().any(|k| k == key) {
                    false
                } else {
                    stalled.push(key.to_string());
                    true
                }
            };
            if first {
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
            self.inner.put_file(key, path, meta).await
        }

        async fn delete_prefix(&self, prefix: &str) -> Result<usize, StoreError> {
            self.inner.delete_prefix(prefix).await
        }

        fn public_url(&self, key: &str) -> String {
            self.inner.public_url(key)
        }
    }

    #[tokio::test]
    async fn stalled_uploads_time_out_and_retry() {
        let dir = tempfile::tempdir().unwrap();
        write_tree(dir.path());
        let store = Arc::new(StallingStore { inner: MemoryStore::new(), stalled: Mutex::new(Vec::new()) });
        let publisher = ArtifactPublisher::new(
            store.clone(),
            PublishSettings { upload_timeout: Duration::from_millis(50), ..fast_settings() },
        );

        publisher.publish(dir.path(), FOLDER).await.unwrap();
        assert_eq!(store.inner.keys().len(), 7);
    }
}
