//! HLS transcoding through an external `ffmpeg` process.
//!
//! Each rendition is encoded by its own ffmpeg invocation into
//! `<output>/<label>/index.m3u8` + `<output>/<label>/segment_NNN.ts`. Once every
//! rendition succeeded, `<output>/master.m3u8` is synthesized from the ladder.
//! Nothing is written at the root when any rendition fails.

use std::collections::VecDeque;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{ChildStderr, Command};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::settings::TranscodeSettings;
use crate::media::rendition::RenditionSpec;

pub const MASTER_PLAYLIST: &str = "master.m3u8";
const STDERR_TAIL_LINES: usize = 20;

#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error("encoder `{binary}` was not found on PATH; install ffmpeg or set FFMPEG_PATH")]
    EncoderNotFound { binary: String },

    #[error("encoder failed on rendition {rendition} ({}): {stderr_tail}", describe_exit(.exit_code))]
    EncoderFailed {
        rendition: String,
        exit_code: Option<i32>,
        stderr_tail: String,
    },

    #[error("encoder produced no playable output for rendition {rendition}")]
    MissingOutput { rendition: String },

    #[error("transcode timed out after {after_secs}s")]
    TimedOut { after_secs: u64 },

    #[error("transcode cancelled")]
    Cancelled,

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {}", code),
        None => "terminated by signal".to_string(),
    }
}

/// Coarse progress of the rendition currently being encoded.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TranscodeProgress {
    pub rendition: String,
    pub completed_renditions: usize,
    pub total_renditions: usize,
    pub out_time_ms: i64,
}

#[derive(Clone, Debug)]
pub struct RenditionOutput {
    pub label: String,
    pub playlist: PathBuf,
    pub segments: usize,
}

/// Local rendition tree produced for one job.
#[derive(Clone, Debug)]
pub struct ArtifactSet {
    pub root: PathBuf,
    pub master_playlist: PathBuf,
    pub renditions: Vec<RenditionOutput>,
}

#[derive(Clone, Debug)]
pub struct HlsTranscoder {
    settings: TranscodeSettings,
}

impl HlsTranscoder {
    pub fn new(settings: TranscodeSettings) -> Self {
        Self { settings }
    }

    pub fn renditions(&self) -> &[RenditionSpec] {
        &self.settings.renditions
    }

    pub fn build_args(&self, source: &Path, output_dir: &Path, spec: &RenditionSpec) -> Vec<String> {
        let rendition_dir = output_dir.join(&spec.label);
        let segments = rendition_dir.join("segment_%03d.ts");
        let playlist = rendition_dir.join("index.m3u8");

        let mut args: Vec<String> = Vec::with_capacity(48);
        let mut push = |items: &[&str]| args.extend(items.iter().map(|s| s.to_string()));

        push(&["-y", "-hide_banner", "-nostats", "-loglevel", "error", "-progress", "pipe:2"]);
        push(&["-i", &source.to_string_lossy()]);
        push(&["-map", "0:v:0", "-map", "0:a:0?"]);
        push(&["-vf", &format!("scale={}:{}", spec.width, spec.height)]);
        push(&["-c:v", "libx264", "-preset", "veryfast", "-profile:v", "main"]);
        push(&["-b:v", &spec.rate_arg(), "-maxrate", &spec.rate_arg(), "-bufsize", &spec.bufsize_arg()]);
        push(&["-c:a", "aac", "-ar", "48000", "-ac", "2", "-b:a", "128k"]);
        push(&["-f", "hls", "-hls_time", &self.settings.segment_seconds.to_string()]);
        push(&["-hls_playlist_type", "vod"]);
        push(&["-hls_segment_filename", &segments.to_string_lossy()]);
        push(&[&playlist.to_string_lossy()]);

        args
    }

    /// Encodes `source` into every rendition under `output_dir`.
    ///
    /// `output_dir` is wiped first, so re-running a job overwrites earlier
    /// partial output. The whole call is bounded by a wall-clock budget derived
    /// from the input size; on timeout or cancellation the running encoder is
    /// killed.
    pub async fn transcode(
        &self,
        source: &Path,
        output_dir: &Path,
        renditions: &[RenditionSpec],
        cancel: &CancellationToken,
        progress: Option<&watch::Sender<TranscodeProgress>>,
    ) -> Result<ArtifactSet, TranscodeError> {
        if renditions.is_empty() {
            return Err(TranscodeError::InvalidInput("no renditions configured".to_string()));
        }

        let input_bytes = match tokio::fs::metadata(source).await {
            Ok(meta) if meta.is_file() && meta.len() > 0 => meta.len(),
            Ok(_) => {
                return Err(TranscodeError::InvalidInput(format!(
                    "{} is empty or not a regular file",
                    source.display()
                )));
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(TranscodeError::InvalidInput(format!(
                    "{} does not exist",
                    source.display()
                )));
            }
            Err(e) => return Err(e.into()),
        };

        reset_dir(output_dir).await?;
        for spec in renditions {
            tokio::fs::create_dir_all(output_dir.join(&spec.label)).await?;
        }

        let budget = self.settings.timeout_for(input_bytes);
        info!(
            source = %source.display(),
            renditions = renditions.len(),
            budget_secs = budget.as_secs(),
            "🎞️ Transcoding to HLS"
        );

        let encode_all = async {
            for (index, spec) in renditions.iter().enumerate() {
                if let Some(tx) = progress {
                    tx.send_replace(TranscodeProgress {
                        rendition: spec.label.clone(),
                        completed_renditions: index,
                        total_renditions: renditions.len(),
                        out_time_ms: 0,
                    });
                }
                self.encode_rendition(source, output_dir, spec, progress).await?;
            }
            Ok::<(), TranscodeError>(())
        };

        // Dropping `encode_all` drops the child, and kill_on_drop reaps the encoder.
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TranscodeError::Cancelled),
            outcome = tokio::time::timeout(budget, encode_all) => match outcome {
                Ok(result) => result?,
                Err(_) => return Err(TranscodeError::TimedOut { after_secs: budget.as_secs() }),
            },
        }

        let mut outputs = Vec::with_capacity(renditions.len());
        for spec in renditions {
            outputs.push(inspect_rendition(output_dir, spec).await?);
        }

        let master_path = output_dir.join(MASTER_PLAYLIST);
        tokio::fs::write(&master_path, master_playlist(renditions)).await?;

        if let Some(tx) = progress {
            tx.send_modify(|p| p.completed_renditions = renditions.len());
        }

        Ok(ArtifactSet {
            root: output_dir.to_path_buf(),
            master_playlist: master_path,
            renditions: outputs,
        })
    }

    async fn encode_rendition(
        &self,
        source: &Path,
        output_dir: &Path,
        spec: &RenditionSpec,
        progress: Option<&watch::Sender<TranscodeProgress>>,
    ) -> Result<(), TranscodeError> {
        let args = self.build_args(source, output_dir, spec);
        let binary = self.settings.ffmpeg_path.to_string_lossy().to_string();
        debug!("Running encoder: {} {}", binary, args.join(" "));

        let mut child = Command::new(&self.settings.ffmpeg_path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => TranscodeError::EncoderNotFound { binary: binary.clone() },
                _ => TranscodeError::Io(e),
            })?;

        let stderr = child.stderr.take();
        let (status, stderr_tail) = tokio::join!(child.wait(), drain_stderr(stderr, progress));
        let status = status?;

        if !status.success() {
            return Err(TranscodeError::EncoderFailed {
                rendition: spec.label.clone(),
                exit_code: status.code(),
                stderr_tail,
            });
        }

        info!(rendition = %spec.label, resolution = %spec.resolution(), "Rendition encoded");
        Ok(())
    }
}

/// `#EXTM3U` master listing every rendition in ladder order.
pub fn master_playlist(renditions: &[RenditionSpec]) -> String {
    let mut out = String::from("#EXTM3U\n#EXT-X-VERSION:3\n");
    for spec in renditions {
        out.push_str(&format!(
            "#EXT-X-STREAM-INF:BANDWIDTH={},RESOLUTION={}\n{}\n",
            spec.bandwidth(),
            spec.resolution(),
            spec.playlist_path()
        ));
    }
    out
}

async fn reset_dir(dir: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    tokio::fs::create_dir_all(dir).await
}

async fn inspect_rendition(output_dir: &Path, spec: &RenditionSpec) -> Result<RenditionOutput, TranscodeError> {
    let dir = output_dir.join(&spec.label);
    let playlist = dir.join("index.m3u8");

    let mut segments = 0;
    let mut entries = tokio::fs::read_dir(&dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.path().extension().is_some_and(|ext| ext == "ts") {
            segments += 1;
        }
    }

    if segments == 0 || !tokio::fs::try_exists(&playlist).await? {
        return Err(TranscodeError::MissingOutput { rendition: spec.label.clone() });
    }

    Ok(RenditionOutput {
        label: spec.label.clone(),
        playlist,
        segments,
    })
}

/// Reads encoder stderr to the end. Progress lines feed `progress`, the rest
/// is kept as a bounded tail for error reporting.
async fn drain_stderr(
    stderr: Option<ChildStderr>,
    progress: Option<&watch::Sender<TranscodeProgress>>,
) -> String {
    let Some(stderr) = stderr else {
        return String::new();
    };

    let mut tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL_LINES);
    let mut lines = BufReader::new(stderr).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some((key, value)) = progress_pair(line) {
            if let (Some(tx), Some(ms)) = (progress, out_time_ms(key, value)) {
                tx.send_modify(|p| p.out_time_ms = ms);
            }
            continue;
        }
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line.to_string());
    }

    Vec::from(tail).join("\n")
}

/// `-progress` output is a stream of bare `key=value` lines.
fn progress_pair(line: &str) -> Option<(&str, &str)> {
    let (key, value) = line.split_once('=')?;
    let is_key = !key.is_empty() && key.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    (is_key && !value.contains(' ')).then_some((key, value))
}

fn out_time_ms(key: &str, value: &str) -> Option<i64> {
    match key {
        // ffmpeg reports microseconds under both names
        "out_time_us" | "out_time_ms" => value.parse::<i64>().ok().map(|us| us / 1000),
        _ => None,
    }
}
