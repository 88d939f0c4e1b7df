//! `FfmpegTranscoder`: a `Transcoder` implementation that shells out to
//! `ffmpeg`/`ffprobe`.
//!
//! Generalizes
//! `ferrex_server::stream::transcoding::worker::{build_ffmpeg_command,
//! run_ffmpeg_command, monitor_ffmpeg_progress_with_errors}`: instead of
//! writing an HLS playlist to a job's output directory, encoded bytes are
//! piped from the child's stdout into the bound `GrowableBuffer`
//! incrementally across repeated `step()` calls. Duration probing follows
//! `songbird::input::ffmpeg_src::is_stereo`'s `ffprobe -of json` + serde_json
//! parsing idiom.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tracing::{debug, info, warn};

use tcache_core::buffer::GrowableBuffer;
use tcache_core::error::{CacheError, Result};
use tcache_core::key::{GainMode, TargetFormat, TargetRecipe};
use tcache_core::transcoder::{StepOutcome, Transcoder};

use crate::codec::id3v1::{Id3v1Tag, ID3V1_TAG_LENGTH};

/// Container-overhead headroom added on top of the naive `bitrate ×
/// duration` estimate so `predict_size` stays a conservative upper bound
/// per SPEC_FULL.md §9 Open Question 1.
const CONTAINER_OVERHEAD_BYTES: u64 = 64 * 1024;

/// Assumed source bitrate (kbps) used only when `ffprobe` cannot report a
/// source bitrate directly, to convert file size into a duration estimate.
const FALLBACK_SOURCE_KBPS: u64 = 1_000;

const READ_CHUNK: usize = 64 * 1024;

pub struct FfmpegTranscoder {
    ffmpeg_path: String,
    ffprobe_path: String,
    recipe: TargetRecipe,
    source_path: PathBuf,
    source_mtime: SystemTime,
    duration_secs: f64,
    child: Option<Child>,
    stdout: Option<tokio::process::ChildStdout>,
    buffer: Option<Arc<GrowableBuffer>>,
    tag_buf: Vec<u8>,
    read_buf: Vec<u8>,
}

impl FfmpegTranscoder {
    pub fn new(ffmpeg_path: impl Into<String>, ffprobe_path: impl Into<String>, recipe: TargetRecipe) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
            ffprobe_path: ffprobe_path.into(),
            recipe,
            source_path: PathBuf::new(),
            source_mtime: SystemTime::UNIX_EPOCH,
            duration_secs: 0.0,
            child: None,
            stdout: None,
            buffer: None,
            tag_buf: Vec::new(),
            read_buf: vec![0u8; READ_CHUNK],
        }
    }

    fn buffer(&self) -> &GrowableBuffer {
        self.buffer
            .as_deref()
            .expect("open_output must be called before step/finish")
    }

    async fn probe_duration_secs(&self) -> Result<f64> {
        let out = Command::new(&self.ffprobe_path)
            .args(["-v", "quiet", "-of", "json", "-show_format"])
            .arg(&self.source_path)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(CacheError::Io)?;

        let value: Value = serde_json::from_slice(&out.stdout).map_err(|e| {
            CacheError::SourceCorrupt(format!("ffprobe produced unparsable json: {e}"))
        })?;
        let duration = value
            .get("format")
            .and_then(|f| f.get("duration"))
            .and_then(Value::as_str)
            .and_then(|s| s.parse::<f64>().ok());
        duration.ok_or_else(|| CacheError::SourceCorrupt("ffprobe reported no duration".into()))
    }

    fn build_command(&self) -> Command {
        let mut cmd = Command::new(&self.ffmpeg_path);
        cmd.arg("-hide_banner").arg("-y");
        cmd.arg("-i").arg(&self.source_path);
        cmd.arg("-vn"); // audio only: no source video stream emitted

        match self.recipe.format {
            TargetFormat::Mp3 => {
                cmd.arg("-acodec").arg("libmp3lame");
                if self.recipe.vbr {
                    cmd.arg("-q:a").arg(self.recipe.quality.to_string());
                } else if let Some(kbps) = self.recipe.bitrate_kbps {
                    cmd.arg("-b:a").arg(format!("{kbps}k"));
                }
                if let Some(rate) = self.recipe.sample_rate_cap {
                    cmd.arg("-ar").arg(rate.to_string());
                }
                // ID3v1 is spliced in by this module rather than ffmpeg's own
                // muxer, so suppress ffmpeg's tag writer entirely.
                cmd.arg("-write_id3v1").arg("0");
                cmd.arg("-id3v2_version").arg("0");
                cmd.arg("-f").arg("mp3");
            }
            TargetFormat::Mp4 => {
                cmd.arg("-acodec").arg("aac");
                if let Some(kbps) = self.recipe.bitrate_kbps {
                    cmd.arg("-b:a").arg(format!("{kbps}k"));
                }
                if let Some(rate) = self.recipe.sample_rate_cap {
                    cmd.arg("-ar").arg(rate.to_string());
                }
                cmd.arg("-movflags").arg("frag_keyframe+empty_moov");
                cmd.arg("-f").arg("mp4");
            }
        }

        if self.recipe.gain_mode != GainMode::Off {
            cmd.arg("-af").arg("loudnorm");
        }

        cmd.arg("pipe:1");
        cmd
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn open_input(&mut self, source_path: &Path) -> Result<()> {
        if !source_path.exists() {
            return Err(CacheError::SourceMissing(source_path.to_path_buf()));
        }
        self.source_path = source_path.to_path_buf();
        self.source_mtime = std::fs::metadata(source_path)?.modified()?;
        self.duration_secs = self.probe_duration_secs().await?;

        // The ID3v1 tag only depends on source metadata, so it is known
        // before a single byte is encoded; this lets the tail-read shortcut
        // serve it immediately (SPEC_FULL.md §4.4).
        if self.recipe.format == TargetFormat::Mp3 {
            let tag = Id3v1Tag {
                title: self
                    .source_path
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                ..Id3v1Tag::new()
            };
            self.tag_buf = tag.render().to_vec();
            debug_assert_eq!(self.tag_buf.len(), ID3V1_TAG_LENGTH);
        }
        Ok(())
    }

    fn source_mtime(&self) -> SystemTime {
        self.source_mtime
    }

    fn predict_size(&self) -> u64 {
        let kbps = self
            .recipe
            .bitrate_kbps
            .unwrap_or(FALLBACK_SOURCE_KBPS) as f64;
        let bytes = (self.duration_secs * kbps * 1000.0 / 8.0) as u64;
        let tag_len = self.recipe.trailing_tag_len().unwrap_or(0);
        bytes + CONTAINER_OVERHEAD_BYTES + tag_len
    }

    fn open_output(&mut self, buffer: Arc<GrowableBuffer>) {
        self.buffer = Some(buffer);
    }

    async fn step(&mut self) -> Result<StepOutcome> {
        if self.child.is_none() {
            let mut cmd = self.build_command();
            info!(?cmd, "spawning ffmpeg");
            let mut child = cmd
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .stdin(Stdio::null())
                .spawn()
                .map_err(CacheError::Io)?;
            let stdout = child.stdout.take().expect("stdout was piped");
            if let Some(stderr) = child.stderr.take() {
                tokio::spawn(drain_stderr(stderr));
            }
            self.child = Some(child);
            self.stdout = Some(stdout);
        }

        let stdout = self.stdout.as_mut().expect("set above");
        let n = stdout.read(&mut self.read_buf).await.map_err(CacheError::Io)?;
        if n == 0 {
            return Ok(StepOutcome::EndOfStream);
        }
        self.buffer().append(&self.read_buf[..n])?;
        Ok(StepOutcome::Progress)
    }

    async fn finish(&mut self) -> Result<()> {
        if let Some(mut child) = self.child.take() {
            let status = child.wait().await.map_err(CacheError::Io)?;
            if !status.success() {
                return Err(CacheError::SourceCorrupt(format!(
                    "ffmpeg exited with status {status}"
                )));
            }
        }

        // The tag was computed in `open_input`; append it now as the actual
        // trailing bytes of the artifact (ffmpeg itself was told to write
        // neither ID3v1 nor ID3v2 frames, see `build_command`).
        if !self.tag_buf.is_empty() {
            self.buffer().append(&self.tag_buf)?;
        }
        Ok(())
    }

    fn trailing_tag(&self) -> &[u8] {
        &self.tag_buf
    }
}

async fn drain_stderr(stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    let mut tail = String::new();
    while let Ok(Some(line)) = lines.next_line().await {
        tail.push_str(&line);
        tail.push('\n');
        if tail.len() > 4096 {
            tail.drain(..tail.len() - 4096);
        }
    }
    if !tail.is_empty() {
        warn!(stderr = %tail, "ffmpeg stderr tail");
    } else {
        debug!("ffmpeg stderr closed with no output");
    }
}
