use super::{AccelArgs, DecodePath};
use crate::settings::TranscodeConfig;

/// Intel Quick Sync.
pub fn args(path: DecodePath, cfg: &TranscodeConfig) -> AccelArgs {
    match path {
        DecodePath::Hardware => AccelArgs {
            global: Vec::new(),
            input: vec![
                "-hwaccel".into(), "qsv".into(),
                "-hwaccel_output_format".into(), "qsv".into(),
            ],
            video: vec![
                "-c:v".into(), "h264_qsv".into(),
                // Frames stay on the GPU; only the surface format is fixed up.
                "-vf".into(), "vpp_qsv=format=nv12".into(),
                "-preset".into(), cfg.qsv_preset.clone(),
            ],
        },
        DecodePath::SoftwareUpload => AccelArgs {
            global: vec![
                "-init_hw_device".into(), "qsv=hw".into(),
                "-filter_hw_device".into(), "hw".into(),
            ],
            input: Vec::new(),
            video: vec![
                "-c:v".into(), "h264_qsv".into(),
                "-vf".into(), "format=nv12,hwupload=extra_hw_frames=64".into(),
                "-preset".into(), cfg.qsv_preset.clone(),
            ],
        },
    }
}
