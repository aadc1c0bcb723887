use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;

use crate::probe::MediaInfo;
use crate::settings::PolicyConfig;

lazy_static! {
    static ref TOKEN_SPLIT: Regex = Regex::new(r"[^a-z0-9]+").unwrap();
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Decision {
    pub transcode: bool,
    pub reasons: Vec<String>,
}

/// Decides whether a file can be handed to the browser as-is.
pub struct TranscodePolicy {
    config: PolicyConfig,
}

impl TranscodePolicy {
    pub fn new(config: PolicyConfig) -> Self {
        Self { config }
    }

    /// Whether the codec rule is configured, which means a probe is worth running.
    pub fn uses_codecs(&self) -> bool {
        !self.config.trigger_codecs.is_empty()
    }

    /// Extension and filename checks only; no media info needed.
    pub fn check_name(&self, file_name: &str) -> Decision {
        let lower = file_name.to_ascii_lowercase();
        let mut reasons = Vec::new();

        if let Some((_, ext)) = lower.rsplit_once('.') {
            if self.config.trigger_extensions.iter().any(|e| e.eq_ignore_ascii_case(ext)) {
                reasons.push(format!("extension .{ext}"));
            }
        }

        let stem = lower.rsplit_once('.').map(|(s, _)| s).unwrap_or(&lower);
        for token in TOKEN_SPLIT.split(stem).filter(|t| !t.is_empty()) {
            if self.config.filename_tokens.iter().any(|t| t.eq_ignore_ascii_case(token)) {
                reasons.push(format!("filename token {token}"));
            }
        }

        Decision {
            transcode: !reasons.is_empty(),
            reasons,
        }
    }

    /// Full decision. `media` is consulted only when the name alone did not decide.
    pub fn should_transcode(&self, file_name: &str, media: Option<&MediaInfo>) -> Decision {
        let by_name = self.check_name(file_name);
        if by_name.transcode {
            return by_name;
        }

        let codec = media.and_then(|m| m.video_codec.as_deref());
        if let Some(codec) = codec {
            if self.config.trigger_codecs.iter().any(|c| c.eq_ignore_ascii_case(codec)) {
                return Decision {
                    transcode: true,
                    reasons: vec![format!("video codec {codec}")],
                };
            }
        }
        Decision::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> TranscodePolicy {
        TranscodePolicy::new(PolicyConfig::default())
    }

    #[test]
    fn extension_triggers_transcode() {
        let d = policy().check_name("Some.Movie.AVI");
        assert!(d.transcode);
        assert_eq!(d.reasons, vec!["extension .avi"]);
    }

    #[test]
    fn filename_token_triggers_transcode() {
        let d = policy().check_name("Show.S01E02.1080p.x265-GRP.mp4");
        assert!(d.transcode);
        assert!(d.reasons.iter().any(|r| r.contains("x265")));
    }

    #[test]
    fn token_must_match_whole_word() {
        // "hevcx" is not the token "hevc"
        assert!(!policy().check_name("hevcx.mp4").transcode);
    }

    #[test]
    fn probed_codec_triggers_transcode() {
        let media = MediaInfo {
            video_codec: Some("hevc".into()),
            ..Default::default()
        };
        let d = policy().should_transcode("plain.mp4", Some(&media));
        assert!(d.transcode);
        assert_eq!(d.reasons, vec!["video codec hevc"]);
    }

    #[test]
    fn h264_mp4_plays_directly() {
        let media = MediaInfo {
            video_codec: Some("h264".into()),
            ..Default::default()
        };
        assert!(!policy().should_transcode("plain.mp4", Some(&media)).transcode);
        assert!(!policy().should_transcode("plain.mp4", None).transcode);
    }
}
