use super::{AccelArgs, DecodePath};
use crate::settings::TranscodeConfig;

#[cfg(target_os = "linux")]
pub fn detect_auto(device: &std::path::Path) -> super::Accel {
    use super::Accel;
    use tracing::{info, warn};

    if !device.exists() {
        info!("Auto-detection: No VAAPI device found at {:?}. Using 'cpu' mode.", device);
        return Accel::Cpu;
    }
    match std::fs::File::open(device) {
        Ok(_) => {
            info!("Auto-detected VAAPI device at {:?}. Using 'vaapi' mode.", device);
            Accel::Vaapi
        }
        Err(e) => {
            warn!(
                "Auto-detection: VAAPI device found at {:?} but cannot be opened ({}). Falling back to 'cpu'. Check that the service user is in the render group.",
                device, e
            );
            Accel::Cpu
        }
    }
}

pub fn args(path: DecodePath, cfg: &TranscodeConfig) -> AccelArgs {
    let device = cfg.vaapi_device.clone();
    match path {
        DecodePath::Hardware => AccelArgs {
            global: Vec::new(),
            input: vec![
                "-hwaccel".into(), "vaapi".into(),
                "-hwaccel_device".into(), device,
                "-hwaccel_output_format".into(), "vaapi".into(),
            ],
            video: vec![
                "-vf".into(), "scale_vaapi=format=nv12".into(),
                "-c:v".into(), "h264_vaapi".into(),
            ],
        },
        DecodePath::SoftwareUpload => AccelArgs {
            global: vec![
                "-init_hw_device".into(), format!("vaapi=va:{device}"),
                "-filter_hw_device".into(), "va".into(),
            ],
            input: Vec::new(),
            video: vec![
                "-vf".into(), "format=nv12,hwupload".into(),
                "-c:v".into(), "h264_vaapi".into(),
            ],
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hardware_path_uses_configured_device() {
        let cfg = TranscodeConfig {
            vaapi_device: "/dev/dri/renderD129".into(),
            ..Default::default()
        };
        let args = args(DecodePath::Hardware, &cfg);
        assert!(args.input.contains(&"/dev/dri/renderD129".to_string()));
        assert!(args.global.is_empty());
    }
}
