//! ffmpeg/ffprobe subprocess driver.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info};

use super::error::TranscodeError;
use super::probe::parse_probe_output;
use super::{Operation, TranscodeProgress, Transcoder, preview_duration_secs};
use crate::modules::resource::model::MediaProbe;

/// Widest preview we render.
const PREVIEW_MAX_WIDTH: u32 = 1280;

/// Diagnostic lines kept from stderr for error reports.
const STDERR_TAIL: usize = 20;

#[derive(Debug, Clone)]
pub struct TranscoderConfig {
    pub ffmpeg_path: PathBuf,
    pub ffprobe_path: PathBuf,
    /// Upper bound for a single ffmpeg or ffprobe invocation.
    pub timeout: Duration,
    pub log_level: String,
}

impl Default for TranscoderConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: PathBuf::from("ffmpeg"),
            ffprobe_path: PathBuf::from("ffprobe"),
            timeout: Duration::from_secs(3600),
            log_level: "error".to_string(),
        }
    }
}

pub struct FfmpegTranscoder {
    config: TranscoderConfig,
    progress_tx: Option<mpsc::Sender<TranscodeProgress>>,
}

impl FfmpegTranscoder {
    pub fn new(config: TranscoderConfig) -> Self {
        Self {
            config,
            progress_tx: None,
        }
    }

    /// Progress is dropped when the channel is full; encoding never waits
    /// on the receiver.
    pub fn with_progress_sender(mut self, tx: mpsc::Sender<TranscodeProgress>) -> Self {
        self.progress_tx = Some(tx);
        self
    }

    /// Checks that both binaries can be executed.
    pub async fn validate(&self) -> Result<(), TranscodeError> {
        for (path, is_ffmpeg) in [(&self.config.ffmpeg_path, true), (&self.config.ffprobe_path, false)] {
            let output = Command::new(path).arg("-version").output().await.map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    if is_ffmpeg {
                        TranscodeError::FfmpegNotFound { path: path.clone() }
                    } else {
                        TranscodeError::FfprobeNotFound { path: path.clone() }
                    }
                } else {
                    TranscodeError::Io(e)
                }
            })?;

            if !output.status.success() {
                return Err(TranscodeError::failed(
                    "validate",
                    format!("{} -version exited with code {:?}", path.display(), output.status.code()),
                    None,
                ));
            }

            let version = String::from_utf8_lossy(&output.stdout);
            info!(
                binary = %path.display(),
                version = version.lines().next().unwrap_or_default(),
                "Found media tool"
            );
        }
        Ok(())
    }

    fn common_output_args(&self, output: &Path) -> Vec<String> {
        vec![
            "-loglevel".to_string(),
            self.config.log_level.clone(),
            "-nostats".to_string(),
            "-progress".to_string(),
            "pipe:2".to_string(),
            output.to_string_lossy().to_string(),
        ]
    }

    fn build_convert_args(&self, input: &Path, output: &Path) -> Vec<String> {
        let mut args = vec![
            "-y".to_string(),
            "-i".to_string(),
            input.to_string_lossy().to_string(),
            "-map".to_string(),
            "0:v:0".to_string(),
            "-c:v".to_string(),
            "libx264".to_string(),
            "-profile:v".to_string(),
            "high".to_string(),
            "-pix_fmt".to_string(),
            "yuv420p".to_string(),
            // yuv420p needs even dimensions
            "-vf".to_string(),
            "scale=trunc(iw/2)*2:trunc(ih/2)*2".to_string(),
            "-preset".to_string(),
            "medium".to_string(),
            "-crf".to_string(),
            "23".to_string(),
            "-movflags".to_string(),
            "+faststart".to_string(),
            "-an".to_string(),
        ];
        args.extend(self.common_output_args(output));
        args
    }

    fn build_preview_args(&self, input: &Path, output: &Path, clip_secs: f64) -> Vec<String> {
        let mut args = vec![
            "-y".to_string(),
            "-i".to_string(),
            input.to_string_lossy().to_string(),
            "-t".to_string(),
            format!("{clip_secs:.3}"),
            "-map".to_string(),
            "0:v:0".to_string(),
            "-vf".to_string(),
            format!("scale='min({PREVIEW_MAX_WIDTH},trunc(iw/2)*2)':-2"),
            "-c:v".to_string(),
            "libx264".to_string(),
            "-profile:v".to_string(),
            "high".to_string(),
            "-pix_fmt".to_string(),
            "yuv420p".to_string(),
            "-preset".to_string(),
            "veryfast".to_string(),
            "-crf".to_string(),
            "28".to_string(),
            "-movflags".to_string(),
            "+faststart".to_string(),
            "-an".to_string(),
        ];
        args.extend(self.common_output_args(output));
        args
    }

    fn build_thumbnail_args(&self, input: &Path, output: &Path, seek_secs: f64) -> Vec<String> {
        let mut args = vec![
            "-y".to_string(),
            "-ss".to_string(),
            format!("{seek_secs:.3}"),
            "-i".to_string(),
            input.to_string_lossy().to_string(),
            "-frames:v".to_string(),
            "1".to_string(),
            "-q:v".to_string(),
            "2".to_string(),
            "-an".to_string(),
        ];
        args.extend(self.common_output_args(output));
        args
    }

    async fn run_ffmpeg(
        &self,
        operation: Operation,
        args: Vec<String>,
        output: &Path,
        duration_secs: Option<f64>,
    ) -> Result<PathBuf, TranscodeError> {
        let start = Instant::now();
        debug!(operation = operation.as_str(), ?args, "Running ffmpeg");

        let mut child = Command::new(&self.config.ffmpeg_path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    TranscodeError::FfmpegNotFound {
                        path: self.config.ffmpeg_path.clone(),
                    }
                } else {
                    TranscodeError::Io(e)
                }
            })?;

        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| TranscodeError::failed(operation.as_str(), "stderr was not captured", None))?;
        let mut reader = BufReader::new(stderr).lines();

        let result = timeout(self.config.timeout, async {
            let mut state = ProgressState::default();
            let mut diagnostics = VecDeque::with_capacity(STDERR_TAIL);

            while let Some(line) = reader.next_line().await? {
                match state.apply(&line) {
                    LineKind::Report => {
                        if let Some(ref tx) = self.progress_tx {
                            let _ = tx.try_send(TranscodeProgress {
                                operation,
                                time_secs: state.time_secs,
                                duration_secs,
                                speed: state.speed.clone(),
                            });
                        }
                    }
                    LineKind::Field => {}
                    LineKind::Diagnostic => {
                        if diagnostics.len() == STDERR_TAIL {
                            diagnostics.pop_front();
                        }
                        diagnostics.push_back(line);
                    }
                }
            }

            let status = child.wait().await?;
            Ok::<_, std::io::Error>((status, diagnostics))
        })
        .await;

        match result {
            Ok(Ok((status, diagnostics))) => {
                if !status.success() {
                    let stderr = (!diagnostics.is_empty()).then(|| Vec::from(diagnostics).join("\n"));
                    return Err(TranscodeError::failed(
                        operation.as_str(),
                        format!("ffmpeg exited with code {:?}", status.code()),
                        stderr,
                    ));
                }
            }
            Ok(Err(e)) => return Err(TranscodeError::Io(e)),
            Err(_) => {
                let _ = child.kill().await;
                return Err(TranscodeError::Timeout {
                    operation: operation.as_str(),
                    timeout_secs: self.config.timeout.as_secs(),
                });
            }
        }

        let size = tokio::fs::metadata(output).await.map(|m| m.len()).unwrap_or(0);
        if size == 0 {
            return Err(TranscodeError::failed(operation.as_str(), "output file not created", None));
        }

        info!(
            operation = operation.as_str(),
            output_bytes = size,
            duration_ms = start.elapsed().as_millis() as u64,
            "ffmpeg finished"
        );
        Ok(output.to_path_buf())
    }
}

#[derive(Debug, PartialEq, Eq)]
enum LineKind {
    /// `progress=continue|end`, closes one report block.
    Report,
    Field,
    Diagnostic,
}

#[derive(Debug, Default)]
struct ProgressState {
    time_secs: f64,
    speed: Option<String>,
}

impl ProgressState {
    fn apply(&mut self, line: &str) -> LineKind {
        let Some((key, value)) = line.split_once('=') else {
            return LineKind::Diagnostic;
        };
        if key.is_empty() || !key.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_') {
            return LineKind::Diagnostic;
        }

        match key {
            // out_time_ms is microseconds as well
            "out_time_us" | "out_time_ms" => {
                if let Ok(us) = value.trim().parse::<f64>() {
                    self.time_secs = us / 1_000_000.0;
                }
            }
            "speed" => {
                let speed = value.trim();
                if speed != "N/A" {
                    self.speed = Some(speed.to_string());
                }
            }
            "progress" => return LineKind::Report,
            _ => {}
        }
        LineKind::Field
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn probe(&self, path: &Path) -> Result<MediaProbe, TranscodeError> {
        if !path.exists() {
            return Err(TranscodeError::InputNotFound {
                path: path.to_path_buf(),
            });
        }

        let run = Command::new(&self.config.ffprobe_path)
            .args(["-v", "error", "-print_format", "json", "-show_format", "-show_streams"])
            .arg(path)
            .kill_on_drop(true)
            .output();

        let output = timeout(self.config.timeout, run)
            .await
            .map_err(|_| TranscodeError::Timeout {
                operation: "probe",
                timeout_secs: self.config.timeout.as_secs(),
            })?
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    TranscodeError::FfprobeNotFound {
                        path: self.config.ffprobe_path.clone(),
                    }
                } else {
                    TranscodeError::Io(e)
                }
            })?;

        if !output.status.success() {
            return Err(TranscodeError::probe_failed(format!(
                "ffprobe failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        parse_probe_output(&String::from_utf8_lossy(&output.stdout))
    }

    async fn convert_to_normalized(&self, input: &Path, output: &Path) -> Result<PathBuf, TranscodeError> {
        // Best effort: only used to turn progress into a percentage.
        let duration = self.probe(input).await.ok().and_then(|p| p.duration_seconds);
        let args = self.build_convert_args(input, output);
        self.run_ffmpeg(Operation::Convert, args, output, duration).await
    }

    async fn generate_preview(
        &self,
        input: &Path,
        output: &Path,
        source_duration: Option<f64>,
    ) -> Result<PathBuf, TranscodeError> {
        let clip_secs = preview_duration_secs(source_duration);
        let args = self.build_preview_args(input, output, clip_secs);
        self.run_ffmpeg(Operation::Preview, args, output, Some(clip_secs)).await
    }

    async fn extract_thumbnail(&self, input: &Path, output: &Path) -> Result<PathBuf, TranscodeError> {
        let seek_secs = match self.probe(input).await {
            Ok(probe) => probe.duration_seconds.map(|d| d / 2.0).unwrap_or(0.0),
            Err(e) => {
                debug!(error = %e, "Could not probe thumbnail input, using first frame");
                0.0
            }
        };
        let args = self.build_thumbnail_args(input, output, seek_secs);
        self.run_ffmpeg(Operation::Thumbnail, args, output, None).await
    }
}
