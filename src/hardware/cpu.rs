use super::AccelArgs;
use crate::settings::TranscodeConfig;

pub fn args(cfg: &TranscodeConfig) -> AccelArgs {
    AccelArgs {
        global: Vec::new(),
        input: Vec::new(),
        video: vec![
            "-c:v".into(), cfg.video_encoder_sw.clone(),
            // Keyframes only on the GOP grid so segment cuts stay time-aligned.
            "-sc_threshold".into(), "0".into(),
            "-pix_fmt".into(), "yuv420p".into(),
            "-profile:v".into(), "high".into(),
            "-preset".into(), cfg.x264_preset.clone(),
        ],
    }
}
