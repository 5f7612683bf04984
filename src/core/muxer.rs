//! Lossless combination of separately fetched audio and video

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::core::config::MuxConfig;
use crate::core::error_handling::{errors, DownloadResult, MuxFailure};

/// Something that can place one audio and one video stream into a single container
#[async_trait]
pub trait MediaProcessor: Send + Sync {
    /// Combine without re-encoding. `output` must not be assumed to exist on failure.
    async fn mux_streams(&self, audio: &Path, video: &Path, output: &Path) -> DownloadResult<()>;
}

/// Stream-copy muxing through an ffmpeg binary
pub struct FfmpegProcessor {
    binary: PathBuf,
    timeout: Duration,
}

impl FfmpegProcessor {
    pub fn new(binary: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }

    pub fn from_config(config: &MuxConfig) -> Self {
        Self::new(&config.ffmpeg_path, Duration::from_secs(config.timeout_seconds))
    }

    /// Check the binary runs at all
    pub async fn is_available(&self) -> bool {
        matches!(
            Command::new(&self.binary)
                .arg("-version")
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await,
            Ok(status) if status.success()
        )
    }

    fn arguments(audio: &Path, video: &Path, output: &Path) -> Vec<std::ffi::OsString> {
        let mut args: Vec<std::ffi::OsString> = Vec::new();
        args.push("-y".into());
        args.push("-i".into());
        args.push(video.as_os_str().to_owned());
        args.push("-i".into());
        args.push(audio.as_os_str().to_owned());
        for flag in [
            "-map", "0:v:0", "-map", "1:a:0", "-c", "copy",
            // 去掉时间戳和编码器标签，保证重复合并得到相同的字节
            "-map_metadata", "-1", "-fflags", "+bitexact", "-flags:v", "+bitexact",
            "-flags:a", "+bitexact",
        ] {
            args.push(flag.into());
        }
        args.push(output.as_os_str().to_owned());
        args
    }
}

/// Sort ffmpeg's complaint into the merge failure taxonomy
fn classify_stderr(stderr: &str) -> MuxFailure {
    let lower = stderr.to_lowercase();
    let codec_markers = [
        "could not find tag for codec",
        "codec not currently supported in container",
        "incompatible",
        "tag mismatch",
        "does not support",
    ];
    if codec_markers.iter().any(|m| lower.contains(m)) {
        MuxFailure::IncompatibleCodecs
    } else {
        MuxFailure::IoError
    }
}

#[async_trait]
impl MediaProcessor for FfmpegProcessor {
    async fn mux_streams(&self, audio: &Path, video: &Path, output: &Path) -> DownloadResult<()> {
        let started = Instant::now();
        let child = Command::new(&self.binary)
            .args(Self::arguments(audio, video, output))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    errors::mux(
                        MuxFailure::ToolUnavailable,
                        format!("{} not found", self.binary.display()),
                    )
                } else {
                    errors::mux(MuxFailure::IoError, format!("spawn ffmpeg: {}", e))
                }
            })?;

        let output_result = match tokio::time::timeout(self.timeout, child.wait_with_output()).await
        {
            Ok(result) => result
                .map_err(|e| errors::mux(MuxFailure::IoError, format!("wait ffmpeg: {}", e)))?,
            Err(_) => {
                return Err(errors::mux(
                    MuxFailure::IoError,
                    format!("ffmpeg did not finish within {:?}", self.timeout),
                ))
            }
        };

        if output_result.status.success() {
            debug!("ffmpeg finished in {:.2}s", started.elapsed().as_secs_f64());
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output_result.stderr);
        let tail: String = stderr
            .lines()
            .rev()
            .take(5)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect::<Vec<_>>()
            .join(" | ");
        Err(errors::mux(
            classify_stderr(&stderr),
            format!("ffmpeg exited with {}: {}", output_result.status, tail),
        ))
    }
}

/// Produces final files from completed partials
#[derive(Clone)]
pub struct Muxer {
    processor: Arc<dyn MediaProcessor>,
}

impl Muxer {
    pub fn new(processor: Arc<dyn MediaProcessor>) -> Self {
        Self { processor }
    }

    /// Combine `audio` and `video` into `output`.
    ///
    /// Writes to a sibling temp file and renames it over `output` only on
    /// success. Partials are removed after success and kept after failure.
    /// Calling again after a successful merge is a no-op.
    pub async fn merge(&self, audio: &Path, video: &Path, output: &Path) -> DownloadResult<()> {
        let audio_present = audio.exists();
        let video_present = video.exists();

        if !audio_present && !video_present && output.exists() {
            debug!("{:?} already merged, nothing to do", output);
            return Ok(());
        }
        if !audio_present || !video_present {
            return Err(errors::mux(
                MuxFailure::IoError,
                format!(
                    "missing input for merge (audio present: {}, video present: {})",
                    audio_present, video_present
                ),
            ));
        }

        let temp = temp_output_path(output);
        remove_if_exists(&temp).await;

        info!("🎬 Merging {:?} + {:?} -> {:?}", video, audio, output);
        if let Err(err) = self.processor.mux_streams(audio, video, &temp).await {
            warn!("Merge into {:?} failed: {}", output, err);
            remove_if_exists(&temp).await;
            return Err(err);
        }

        tokio::fs::rename(&temp, output)
            .await
            .map_err(|e| errors::mux(MuxFailure::IoError, format!("rename merged file: {}", e)))?;

        remove_if_exists(audio).await;
        remove_if_exists(video).await;
        Ok(())
    }

    /// Promote a single muxed partial to the final output
    pub async fn finalize_single(&self, partial: &Path, output: &Path) -> DownloadResult<()> {
        if !partial.exists() {
            if output.exists() {
                return Ok(());
            }
            return Err(errors::mux(
                MuxFailure::IoError,
                format!("partial {:?} is missing", partial),
            ));
        }
        tokio::fs::rename(partial, output)
            .await
            .map_err(|e| errors::mux(MuxFailure::IoError, format!("rename partial: {}", e)))
    }
}

/// `<stem>.muxing.<ext>` next to the output so the container is still inferred from the extension
fn temp_output_path(output: &Path) -> PathBuf {
    let stem = output
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    let name = match output.extension() {
        Some(ext) => format!("{}.muxing.{}", stem, ext.to_string_lossy()),
        None => format!("{}.muxing", stem),
    };
    output.with_file_name(name)
}

async fn remove_if_exists(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove {:?}: {}", path, e);
        }
    }
}
