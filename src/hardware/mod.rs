use std::fmt;
use std::path::Path;

use serde::Serialize;
use tracing::info;

use crate::probe::MediaInfo;
use crate::settings::TranscodeConfig;

pub mod cpu;
pub mod nvenc;
pub mod qsv;
pub mod vaapi;
pub mod videotoolbox;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Accel {
    Cpu,
    Qsv,
    Vaapi,
    Nvenc,
    VideoToolbox,
}

impl fmt::Display for Accel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Accel::Cpu => "cpu",
            Accel::Qsv => "qsv",
            Accel::Vaapi => "vaapi",
            Accel::Nvenc => "nvenc",
            Accel::VideoToolbox => "videotoolbox",
        };
        f.write_str(name)
    }
}

impl Accel {
    fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "cpu" | "software" | "none" => Some(Accel::Cpu),
            "qsv" => Some(Accel::Qsv),
            "vaapi" => Some(Accel::Vaapi),
            "nvenc" | "cuda" => Some(Accel::Nvenc),
            "videotoolbox" => Some(Accel::VideoToolbox),
            _ => None,
        }
    }
}

/// Resolve the configured backend, probing the platform when it is `auto`.
pub fn detect(configured: &str, vaapi_device: &str) -> Accel {
    if let Some(accel) = Accel::from_name(configured) {
        return accel;
    }
    if !configured.eq_ignore_ascii_case("auto") {
        info!("Unknown hw_accel '{}', using 'cpu'", configured);
        return Accel::Cpu;
    }

    #[cfg(target_os = "linux")]
    let accel = vaapi::detect_auto(Path::new(vaapi_device));

    #[cfg(target_os = "macos")]
    let accel = {
        let _ = vaapi_device;
        videotoolbox::detect_auto()
    };

    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    let accel = {
        let _ = vaapi_device;
        info!("No hardware auto-detection on this platform. Using 'cpu' mode.");
        Accel::Cpu
    };

    accel
}

/// How the encoder gets frames into the hardware encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodePath {
    /// Decode and encode on the device.
    Hardware,
    /// Decode in software, then upload frames. Needed for old codecs and
    /// containers the hardware decoders reject.
    SoftwareUpload,
}

const LEGACY_CODECS: &[&str] = &["mpeg4", "msmpeg4v1", "msmpeg4v2", "msmpeg4v3", "mpeg1video"];
const LEGACY_CONTAINERS: &[&str] = &["avi", "asf"];
const LEGACY_EXTENSIONS: &[&str] = &["avi", "asf", "wmv"];

pub fn is_legacy_input(media: &MediaInfo, file_name: &str) -> bool {
    if let Some(codec) = media.video_codec.as_deref() {
        let codec = codec.to_ascii_lowercase();
        if LEGACY_CODECS.contains(&codec.as_str()) || codec.starts_with("wmv") {
            return true;
        }
    }
    if media
        .container_names()
        .any(|c| LEGACY_CONTAINERS.iter().any(|l| c.eq_ignore_ascii_case(l)))
    {
        return true;
    }
    Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|ext| LEGACY_EXTENSIONS.iter().any(|l| ext.eq_ignore_ascii_case(l)))
        .unwrap_or(false)
}

pub fn decode_path(media: &MediaInfo, file_name: &str) -> DecodePath {
    if is_legacy_input(media, file_name) {
        DecodePath::SoftwareUpload
    } else {
        DecodePath::Hardware
    }
}

/// Backend-specific pieces of the ffmpeg command line.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AccelArgs {
    /// Before any input (device setup).
    pub global: Vec<String>,
    /// Input options, placed right before `-i`.
    pub input: Vec<String>,
    /// Video encoder, filters and preset.
    pub video: Vec<String>,
}

pub fn ffmpeg_args(accel: Accel, path: DecodePath, cfg: &TranscodeConfig) -> AccelArgs {
    match accel {
        Accel::Cpu => cpu::args(cfg),
        Accel::Qsv => qsv::args(path, cfg),
        Accel::Vaapi => vaapi::args(path, cfg),
        Accel::Nvenc => nvenc::args(path, cfg),
        Accel::VideoToolbox => videotoolbox::args(path, cfg),
    }
}
