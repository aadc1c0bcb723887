use std::collections::HashMap;
use std::process::Stdio;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::headers::HeaderBlock;
use crate::task::DedupKey;

/// Whatever ffprobe could tell us. Every field is optional; an all-empty value
/// means "unknown" and callers carry on without it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaInfo {
    pub container: Option<String>,
    pub duration: Option<f64>,
    pub bit_rate: Option<u64>,
    pub size: Option<u64>,
    pub video_codec: Option<String>,
    pub pix_fmt: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub frame_rate: Option<f64>,
    pub video_bit_rate: Option<u64>,
    pub audio_codec: Option<String>,
    pub audio_channels: Option<u32>,
    pub audio_sample_rate: Option<u32>,
    pub audio_bit_rate: Option<u64>,
}

impl MediaInfo {
    pub fn is_empty(&self) -> bool {
        *self == MediaInfo::default()
    }

    /// Container names as ffprobe reports them (`"mov,mp4,m4a"` -> three names).
    pub fn container_names(&self) -> impl Iterator<Item = &str> {
        self.container
            .as_deref()
            .unwrap_or("")
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    pub fn from_ffprobe_json(json: &[u8]) -> Option<Self> {
        let out: FfprobeOutput = serde_json::from_slice(json).ok()?;
        let mut info = MediaInfo::default();

        if let Some(format) = out.format {
            info.container = format.format_name;
            info.duration = parse_num(format.duration.as_deref()).filter(|d| *d > 0.0);
            info.bit_rate = parse_num(format.bit_rate.as_deref());
            info.size = parse_num(format.size.as_deref());
        }

        if let Some(video) = out.streams.iter().find(|s| s.codec_type.as_deref() == Some("video")) {
            info.video_codec = video.codec_name.clone();
            info.pix_fmt = video.pix_fmt.clone();
            info.width = video.width;
            info.height = video.height;
            info.frame_rate = video.r_frame_rate.as_deref().and_then(parse_ratio);
            info.video_bit_rate = parse_num(video.bit_rate.as_deref());
            if info.duration.is_none() {
                info.duration = parse_num(video.duration.as_deref()).filter(|d| *d > 0.0);
            }
        }

        if let Some(audio) = out.streams.iter().find(|s| s.codec_type.as_deref() == Some("audio")) {
            info.audio_codec = audio.codec_name.clone();
            info.audio_channels = audio.channels;
            info.audio_sample_rate = parse_num(audio.sample_rate.as_deref());
            info.audio_bit_rate = parse_num(audio.bit_rate.as_deref());
        }

        Some(info)
    }
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    streams: Vec<FfprobeStream>,
    format: Option<FfprobeFormat>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
    pix_fmt: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
    bit_rate: Option<String>,
    duration: Option<String>,
    channels: Option<u32>,
    sample_rate: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    format_name: Option<String>,
    duration: Option<String>,
    bit_rate: Option<String>,
    size: Option<String>,
}

fn parse_num<T: std::str::FromStr>(v: Option<&str>) -> Option<T> {
    v?.trim().parse().ok()
}

fn parse_ratio(v: &str) -> Option<f64> {
    let (num, den) = v.split_once('/')?;
    let num: f64 = num.parse().ok()?;
    let den: f64 = den.parse().ok()?;
    (den > 0.0 && num > 0.0).then(|| num / den)
}

/// Runs ffprobe against remote sources and caches the answers per source.
pub struct MediaProber {
    ffprobe_path: String,
    timeout: Duration,
    ttl: Duration,
    cache: Mutex<HashMap<DedupKey, (Instant, MediaInfo)>>,
}

impl MediaProber {
    pub fn new(ffprobe_path: impl Into<String>, timeout: Duration, ttl: Duration) -> Self {
        Self {
            ffprobe_path: ffprobe_path.into(),
            timeout,
            ttl,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Probe `url` with the same headers the encoder will send. Never fails:
    /// a missing binary, a timeout or unparsable output all yield an empty `MediaInfo`.
    pub async fn probe(&self, key: &DedupKey, url: &str, headers: &HeaderBlock) -> MediaInfo {
        {
            let mut cache = self.cache.lock().await;
            match cache.get(key) {
                Some((at, info)) if at.elapsed() < self.ttl => {
                    debug!("probe cache hit: key={}", key);
                    return info.clone();
                }
                Some(_) => {
                    cache.remove(key);
                }
                None => {}
            }
        }

        let info = self.run(url, headers).await;
        if !info.is_empty() {
            self.cache
                .lock()
                .await
                .insert(key.clone(), (Instant::now(), info.clone()));
        }
        info
    }

    async fn run(&self, url: &str, headers: &HeaderBlock) -> MediaInfo {
        let mut args: Vec<String> = vec![
            "-v".into(),
            "error".into(),
            "-print_format".into(),
            "json".into(),
            "-show_format".into(),
            "-show_streams".into(),
        ];
        if !headers.is_empty() {
            args.push("-headers".into());
            args.push(headers.to_ffmpeg_block());
        }
        args.push("-i".into());
        args.push(url.to_string());

        let child = Command::new(&self.ffprobe_path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let started = Instant::now();
        let output = match tokio::time::timeout(self.timeout, child).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("ffprobe not found at {}; continuing without media info", self.ffprobe_path);
                return MediaInfo::default();
            }
            Ok(Err(e)) => {
                warn!("ffprobe failed to start: {}", e);
                return MediaInfo::default();
            }
            Err(_) => {
                warn!("ffprobe timed out after {:?}", self.timeout);
                return MediaInfo::default();
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(
                "ffprobe exited with {}: {}",
                output.status,
                stderr.lines().last().unwrap_or("<no stderr>")
            );
            return MediaInfo::default();
        }

        match MediaInfo::from_ffprobe_json(&output.stdout) {
            Some(info) => {
                info!(
                    "probed source in {:?}: container={:?} video={:?} audio={:?} duration={:?}",
                    started.elapsed(),
                    info.container,
                    info.video_codec,
                    info.audio_codec,
                    info.duration
                );
                info
            }
            None => {
                warn!("ffprobe output was not valid JSON");
                MediaInfo::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "streams": [
            {"codec_type": "video", "codec_name": "hevc", "pix_fmt": "yuv420p10le",
             "width": 1920, "height": 1080, "r_frame_rate": "24000/1001"},
            {"codec_type": "audio", "codec_name": "ac3", "channels": 6, "sample_rate": "48000",
             "bit_rate": "384000"}
        ],
        "format": {"format_name": "matroska,webm", "duration": "5400.250000",
                   "bit_rate": "8000000", "size": "5400250000"}
    }"#;

    #[test]
    fn parses_ffprobe_json() {
        let info = MediaInfo::from_ffprobe_json(SAMPLE.as_bytes()).unwrap();
        assert_eq!(info.video_codec.as_deref(), Some("hevc"));
        assert_eq!(info.width, Some(1920));
        assert_eq!(info.audio_channels, Some(6));
        assert_eq!(info.audio_sample_rate, Some(48000));
        assert_eq!(info.duration, Some(5400.25));
        assert!((info.frame_rate.unwrap() - 23.976).abs() < 0.001);
        assert_eq!(info.container_names().collect::<Vec<_>>(), vec!["matroska", "webm"]);
    }

    #[test]
    fn garbage_is_not_media_info() {
        assert!(MediaInfo::from_ffprobe_json(b"not json").is_none());
        assert!(MediaInfo::default().is_empty());
    }

    #[tokio::test]
    async fn missing_binary_yields_empty_info() {
        let prober = MediaProber::new(
            "/nonexistent/ffprobe",
            Duration::from_secs(1),
            Duration::from_secs(60),
        );
        let key = DedupKey::from_source("abc");
        let info = prober
            .probe(&key, "http://127.0.0.1:9/x.mkv", &HeaderBlock::default())
            .await;
        assert!(info.is_empty());
    }
}
