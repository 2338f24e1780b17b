use std::path::Path;
use std::process::Stdio;

use image::ImageEncoder;
use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

use crate::models::emotion::EmotionTimeline;

/// Frames are scaled down to the classifier's input geometry before leaving
/// the decoder; this also bounds per-frame memory.
pub const FRAME_WIDTH: u32 = 224;
pub const FRAME_HEIGHT: u32 = 224;

const FRAME_BYTES: usize = (FRAME_WIDTH * FRAME_HEIGHT * 3) as usize;

/// Rendering caps the drawtext filter count so the ffmpeg command line stays
/// bounded on long inputs.
const MAX_ANNOTATION_SPANS: usize = 512;

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("ffmpeg binary not found on PATH")]
    FfmpegNotFound,

    #[error("ffprobe binary not found on PATH")]
    FfprobeNotFound,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ffmpeg failed: {message}")]
    Ffmpeg { message: String },

    #[error("not a decodable video: {0}")]
    InvalidVideo(String),

    #[error("truncated frame: expected {expected} bytes, got {got}")]
    TruncatedFrame { expected: usize, got: usize },

    #[error("frame encoding failed: {0}")]
    Encode(#[from] image::ImageError),
}

/// Source video facts from ffprobe.
#[derive(Debug, Clone)]
pub struct VideoInfo {
    /// Duration in seconds.
    pub duration: f64,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    format: FfprobeFormat,
    streams: Vec<FfprobeStream>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: String,
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
}

fn parse_frame_rate(rate: &str) -> Option<f64> {
    match rate.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.parse().ok()?;
            let den: f64 = den.parse().ok()?;
            (den != 0.0).then(|| num / den)
        }
        None => rate.parse().ok(),
    }
}

/// Probe a video file for duration and geometry.
pub async fn probe_video(path: impl AsRef<Path>) -> Result<VideoInfo, DecodeError> {
    let path = path.as_ref();
    which::which("ffprobe").map_err(|_| DecodeError::FfprobeNotFound)?;

    let output = Command::new("ffprobe")
        .args([
            "-v",
            "quiet",
            "-print_format",
            "json",
            "-show_format",
            "-show_streams",
        ])
        .arg(path)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await?;

    if !output.status.success() {
        return Err(DecodeError::InvalidVideo(
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ));
    }

    let probe: FfprobeOutput = serde_json::from_slice(&output.stdout)
        .map_err(|e| DecodeError::InvalidVideo(format!("unreadable ffprobe output: {e}")))?;

    let video_stream = probe
        .streams
        .iter()
        .find(|s| s.codec_type == "video")
        .ok_or_else(|| DecodeError::InvalidVideo("no video stream found".to_string()))?;

    let duration = probe
        .format
        .duration
        .as_deref()
        .and_then(|d| d.parse::<f64>().ok())
        .ok_or_else(|| DecodeError::InvalidVideo("missing duration".to_string()))?;

    Ok(VideoInfo {
        duration,
        width: video_stream.width.unwrap_or(0),
        height: video_stream.height.unwrap_or(0),
        fps: video_stream
            .r_frame_rate
            .as_deref()
            .and_then(parse_frame_rate)
            .unwrap_or(0.0),
    })
}

/// One decoded rgb24 frame at the sampling rate.
#[derive(Debug, Clone)]
pub struct Frame {
    pub index: u64,
    /// Seconds from the start of the video.
    pub timestamp: f64,
    pub rgb: Vec<u8>,
}

impl Frame {
    /// JPEG-encode the frame for the inference payload.
    pub fn to_jpeg(&self) -> Result<Vec<u8>, DecodeError> {
        let mut out = Vec::new();
        let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, 85);
        encoder.write_image(
            &self.rgb,
            FRAME_WIDTH,
            FRAME_HEIGHT,
            image::ExtendedColorType::Rgb8,
        )?;
        Ok(out)
    }
}

/// Streaming frame source: reads one rawvideo frame at a time from an ffmpeg
/// child, never buffering the whole video.
pub struct FrameStream {
    reader: Box<dyn AsyncRead + Send + Unpin>,
    child: Option<Child>,
    stderr_drain: Option<JoinHandle<String>>,
    sample_fps: f64,
    next_index: u64,
    finished: bool,
}

impl FrameStream {
    /// Spawn ffmpeg decoding `path` at `sample_fps`, scaled to the
    /// classifier's input size.
    pub async fn open(path: impl AsRef<Path>, sample_fps: f64) -> Result<Self, DecodeError> {
        which::which("ffmpeg").map_err(|_| DecodeError::FfmpegNotFound)?;

        let mut child = Command::new("ffmpeg")
            .args(["-hide_banner", "-loglevel", "error", "-i"])
            .arg(path.as_ref())
            .args([
                "-vf",
                &format!("fps={sample_fps},scale={FRAME_WIDTH}:{FRAME_HEIGHT}"),
                "-pix_fmt",
                "rgb24",
                "-f",
                "rawvideo",
                "-",
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child.stdout.take().ok_or_else(|| DecodeError::Ffmpeg {
            message: "failed to capture ffmpeg stdout".to_string(),
        })?;
        let mut stderr = child.stderr.take().ok_or_else(|| DecodeError::Ffmpeg {
            message: "failed to capture ffmpeg stderr".to_string(),
        })?;

        // Drain stderr concurrently so a chatty ffmpeg can't block on a full
        // pipe while we read frames.
        let stderr_drain = tokio::spawn(async move {
            let mut buf = String::new();
            let _ = stderr.read_to_string(&mut buf).await;
            buf
        });

        Ok(Self {
            reader: Box::new(tokio::io::BufReader::new(stdout)),
            child: Some(child),
            stderr_drain: Some(stderr_drain),
            sample_fps,
            next_index: 0,
            finished: false,
        })
    }

    /// Frame source over an in-memory rawvideo buffer. Test seam.
    #[cfg(test)]
    pub fn from_raw(data: Vec<u8>, sample_fps: f64) -> Self {
        Self {
            reader: Box::new(std::io::Cursor::new(data)),
            child: None,
            stderr_drain: None,
            sample_fps,
            next_index: 0,
            finished: false,
        }
    }

    /// Next decoded frame, or `None` at clean end of stream.
    pub async fn next_frame(&mut self) -> Result<Option<Frame>, DecodeError> {
        if self.finished {
            return Ok(None);
        }

        let mut buf = vec![0u8; FRAME_BYTES];
        let mut filled = 0usize;
        while filled < FRAME_BYTES {
            let n = self.reader.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }

        if filled == 0 {
            self.finished = true;
            self.check_exit().await?;
            return Ok(None);
        }
        if filled < FRAME_BYTES {
            self.finished = true;
            return Err(DecodeError::TruncatedFrame {
                expected: FRAME_BYTES,
                got: filled,
            });
        }

        let index = self.next_index;
        self.next_index += 1;
        Ok(Some(Frame {
            index,
            timestamp: index as f64 / self.sample_fps,
            rgb: buf,
        }))
    }

    /// Frames decoded so far.
    pub fn frames_read(&self) -> u64 {
        self.next_index
    }

    async fn check_exit(&mut self) -> Result<(), DecodeError> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        let status = child.wait().await?;
        if status.success() {
            return Ok(());
        }

        let stderr = match self.stderr_drain.take() {
            Some(handle) => handle.await.unwrap_or_default(),
            None => String::new(),
        };
        Err(DecodeError::Ffmpeg {
            message: format!(
                "exit status {:?}: {}",
                status.code(),
                stderr.trim()
            ),
        })
    }
}

/// Render a copy of the video with the dominant emotion drawn onto each
/// span of the timeline.
pub async fn render_annotated(
    input: impl AsRef<Path>,
    timeline: &EmotionTimeline,
    output: impl AsRef<Path>,
) -> Result<(), DecodeError> {
    which::which("ffmpeg").map_err(|_| DecodeError::FfmpegNotFound)?;

    let spans = timeline.dominant_spans();
    let mut cmd = Command::new("ffmpeg");
    cmd.args(["-y", "-hide_banner", "-loglevel", "error", "-i"])
        .arg(input.as_ref());

    if spans.is_empty() {
        cmd.args(["-c", "copy"]);
    } else {
        let filters: Vec<String> = spans
            .iter()
            .take(MAX_ANNOTATION_SPANS)
            .map(|(start, end, label, score)| {
                format!(
                    "drawtext=text='{label} {score:.2}'\
                     :enable='between(t\\,{start:.3}\\,{end:.3})'\
                     :x=16:y=16:fontsize=32:fontcolor=white:box=1:boxcolor=black@0.5"
                )
            })
            .collect();
        cmd.args(["-vf", &filters.join(","), "-c:a", "copy"]);
    }

    let result = cmd
        .arg(output.as_ref())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()
        .await?;

    if !result.status.success() {
        return Err(DecodeError::Ffmpeg {
            message: String::from_utf8_lossy(&result.stderr).trim().to_string(),
        });
    }
    Ok(())
}
