use super::{AccelArgs, DecodePath};
use crate::settings::TranscodeConfig;

#[cfg(target_os = "macos")]
pub fn detect_auto() -> super::Accel {
    // VideoToolbox is always available on modern macOS.
    tracing::info!("Auto-detected macOS. Using 'videotoolbox' mode.");
    super::Accel::VideoToolbox
}

pub fn args(path: DecodePath, _cfg: &TranscodeConfig) -> AccelArgs {
    let input = match path {
        DecodePath::Hardware => vec!["-hwaccel".into(), "videotoolbox".into()],
        DecodePath::SoftwareUpload => Vec::new(),
    };
    AccelArgs {
        global: Vec::new(),
        input,
        video: vec![
            "-c:v".into(), "h264_videotoolbox".into(),
            "-pix_fmt".into(), "yuv420p".into(),
            "-profile:v".into(), "high".into(),
            // Fall back to the software encoder if the engine is busy.
            "-allow_sw".into(), "1".into(),
        ],
    }
}
