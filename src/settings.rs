use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// What the player is given as playlist.
///
/// `Streaming` serves the encoder's growing playlist. `Vod` synthesizes the
/// full timeline whenever the total duration is known.
#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HlsMode {
    Streaming,
    Vod,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TranscodeConfig {
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,
    #[serde(default = "default_ffprobe_path")]
    pub ffprobe_path: String,

    /// `auto`, `cpu`, `qsv`, `vaapi`, `nvenc` or `videotoolbox`.
    #[serde(default = "default_hw_accel")]
    pub hw_accel: String,
    #[serde(default = "default_vaapi_device")]
    pub vaapi_device: String,
    #[serde(default = "default_video_encoder_sw")]
    pub video_encoder_sw: String,
    #[serde(default = "default_audio_encoder")]
    pub audio_encoder: String,
    #[serde(default)]
    pub video_bitrate: Option<String>,
    #[serde(default)]
    pub maxrate: Option<String>,
    #[serde(default)]
    pub bufsize: Option<String>,
    #[serde(default)]
    pub audio_bitrate: Option<String>,
    #[serde(default)]
    pub audio_channels: Option<u32>,
    #[serde(default)]
    pub audio_sample_rate: Option<u32>,
    #[serde(default = "default_gop_size")]
    pub gop_size: u32,
    #[serde(default = "default_qsv_preset")]
    pub qsv_preset: String,
    #[serde(default = "default_x264_preset")]
    pub x264_preset: String,
    #[serde(default = "default_threads")]
    pub threads: u8,
    #[serde(default = "default_loglevel")]
    pub loglevel: String,

    #[serde(default = "default_hls_mode")]
    pub hls_mode: HlsMode,
    #[serde(default = "default_segment_duration")]
    pub segment_duration: u32,

    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
    #[serde(default = "default_probe_cache_ttl_secs")]
    pub probe_cache_ttl_secs: u64,
    #[serde(default = "default_ready_timeout_secs")]
    pub ready_timeout_secs: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,

    #[serde(default = "default_seek_grace_secs")]
    pub seek_grace_secs: f64,
    #[serde(default = "default_seek_on_target_secs")]
    pub seek_on_target_secs: f64,
    #[serde(default = "default_segment_wait_timeout_secs")]
    pub segment_wait_timeout_secs: u64,
    #[serde(default = "default_segment_wait_ahead")]
    pub segment_wait_ahead: u64,
    #[serde(default = "default_skip_behind_segments")]
    pub skip_behind_segments: u64,

    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,

    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub headers: HeaderDefaults,
}

impl Default for TranscodeConfig {
    fn default() -> Self {
        Self {
            work_dir: default_work_dir(),
            ffmpeg_path: default_ffmpeg_path(),
            ffprobe_path: default_ffprobe_path(),
            hw_accel: default_hw_accel(),
            vaapi_device: default_vaapi_device(),
            video_encoder_sw: default_video_encoder_sw(),
            audio_encoder: default_audio_encoder(),
            video_bitrate: None,
            maxrate: None,
            bufsize: None,
            audio_bitrate: None,
            audio_channels: None,
            audio_sample_rate: None,
            gop_size: default_gop_size(),
            qsv_preset: default_qsv_preset(),
            x264_preset: default_x264_preset(),
            threads: default_threads(),
            loglevel: default_loglevel(),
            hls_mode: default_hls_mode(),
            segment_duration: default_segment_duration(),
            max_concurrent_tasks: default_max_concurrent_tasks(),
            probe_timeout_secs: default_probe_timeout_secs(),
            probe_cache_ttl_secs: default_probe_cache_ttl_secs(),
            ready_timeout_secs: default_ready_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            stop_grace_ms: default_stop_grace_ms(),
            seek_grace_secs: default_seek_grace_secs(),
            seek_on_target_secs: default_seek_on_target_secs(),
            segment_wait_timeout_secs: default_segment_wait_timeout_secs(),
            segment_wait_ahead: default_segment_wait_ahead(),
            skip_behind_segments: default_skip_behind_segments(),
            idle_timeout_secs: default_idle_timeout_secs(),
            retention_secs: default_retention_secs(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
            policy: PolicyConfig::default(),
            headers: HeaderDefaults::default(),
        }
    }
}

impl TranscodeConfig {
    pub fn segment_secs(&self) -> f64 {
        f64::from(self.segment_duration.max(1))
    }

    /// Segment index that covers `time` seconds into the source.
    pub fn segment_index_at(&self, time: f64) -> u64 {
        (time.max(0.0) / self.segment_secs()).floor() as u64
    }

    /// Round a time down onto the segment grid.
    pub fn align_to_segment(&self, time: f64) -> f64 {
        self.segment_index_at(time) as f64 * self.segment_secs()
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(10))
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    pub fn segment_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.segment_wait_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("data/transcode")
}

fn default_ffmpeg_path() -> String {
    "ffmpeg".to_string()
}

fn default_ffprobe_path() -> String {
    "ffprobe".to_string()
}

fn default_hw_accel() -> String {
    "auto".to_string()
}

fn default_vaapi_device() -> String {
    "/dev/dri/renderD128".to_string()
}

fn default_video_encoder_sw() -> String {
    "libx264".to_string()
}

fn default_audio_encoder() -> String {
    "aac".to_string()
}

fn default_gop_size() -> u32 {
    60
}

fn default_qsv_preset() -> String {
    "7".to_string()
}

fn default_x264_preset() -> String {
    "medium".to_string()
}

fn default_threads() -> u8 {
    4
}

fn default_loglevel() -> String {
    "warning".to_string()
}

fn default_hls_mode() -> HlsMode {
    HlsMode::Vod
}

fn default_segment_duration() -> u32 {
    3
}

fn default_max_concurrent_tasks() -> usize {
    2
}

fn default_probe_timeout_secs() -> u64 {
    30
}

fn default_probe_cache_ttl_secs() -> u64 {
    3600
}

fn default_ready_timeout_secs() -> u64 {
    60
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_stop_grace_ms() -> u64 {
    3000
}

fn default_seek_grace_secs() -> f64 {
    2.0
}

fn default_seek_on_target_secs() -> f64 {
    5.0
}

fn default_segment_wait_timeout_secs() -> u64 {
    30
}

fn default_segment_wait_ahead() -> u64 {
    10
}

fn default_skip_behind_segments() -> u64 {
    10
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_retention_secs() -> u64 {
    3600
}

fn default_cleanup_interval_secs() -> u64 {
    300
}

/// Inputs that force a transcode before any probing happens.
#[derive(Debug, Clone, Deserialize)]
pub struct PolicyConfig {
    #[serde(default = "default_trigger_extensions")]
    pub trigger_extensions: Vec<String>,
    #[serde(default = "default_filename_tokens")]
    pub filename_tokens: Vec<String>,
    #[serde(default = "default_trigger_codecs")]
    pub trigger_codecs: Vec<String>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            trigger_extensions: default_trigger_extensions(),
            filename_tokens: default_filename_tokens(),
            trigger_codecs: default_trigger_codecs(),
        }
    }
}

fn default_trigger_extensions() -> Vec<String> {
    ["mkv", "avi", "wmv", "asf", "rmvb", "rm", "flv", "ts", "m2ts", "mpg", "mpeg", "vob"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_filename_tokens() -> Vec<String> {
    ["x265", "h265", "hevc", "xvid", "divx", "10bit"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_trigger_codecs() -> Vec<String> {
    [
        "hevc", "h265", "mpeg4", "msmpeg4v2", "msmpeg4v3", "mpeg1video", "mpeg2video", "wmv1",
        "wmv2", "wmv3", "vc1", "rv40", "av1", "vp9",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

/// Header values used when the upstream response does not carry them.
#[derive(Debug, Clone, Deserialize)]
pub struct HeaderDefaults {
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default)]
    pub referer: Option<String>,
    #[serde(default)]
    pub origin: Option<String>,
    #[serde(default = "default_accept")]
    pub accept: String,
}

impl Default for HeaderDefaults {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
            referer: None,
            origin: None,
            accept: default_accept(),
        }
    }
}

fn default_user_agent() -> String {
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0 Safari/537.36".to_string()
}

fn default_accept() -> String {
    "*/*".to_string()
}
