use super::{AccelArgs, DecodePath};
use crate::settings::TranscodeConfig;

/// NVIDIA NVENC. The encoder accepts system-memory frames, so legacy inputs
/// only drop the CUDA decoder.
pub fn args(path: DecodePath, _cfg: &TranscodeConfig) -> AccelArgs {
    let mut video: Vec<String> = vec!["-c:v".into(), "h264_nvenc".into()];
    let input = match path {
        DecodePath::Hardware => vec![
            "-hwaccel".into(), "cuda".into(),
            "-hwaccel_output_format".into(), "cuda".into(),
        ],
        DecodePath::SoftwareUpload => {
            video.extend(["-pix_fmt".into(), "yuv420p".into()]);
            Vec::new()
        }
    };
    video.extend([
        "-preset".into(), "p4".into(),
        "-forced-idr".into(), "1".into(),
    ]);
    AccelArgs {
        global: Vec::new(),
        input,
        video,
    }
}
