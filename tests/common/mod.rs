#![allow(dead_code)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use vodhls::hardware::Accel;
use vodhls::resolver::DirectResolver;
use vodhls::service::TranscodeService;
use vodhls::settings::{HlsMode, TranscodeConfig};
use vodhls::task::{TaskId, TaskStatus, TaskView};

/// How the stand-in encoder behaves once it has written its segments.
#[derive(Clone, Copy)]
pub enum Finish {
    /// Keep running like a live encode.
    Hang,
    /// Write ENDLIST and exit 0.
    Exit,
}

/// When the stand-in encoder publishes its playlist.
#[derive(Clone, Copy)]
pub enum PlaylistWrite {
    /// Once the segments are written, while still running.
    Incremental,
    /// Only when it exits, as ffmpeg does for a VOD playlist type.
    AtExit,
}

/// Writes `segments` two-second segments starting at `-start_number`, each
/// containing `segment-<n>`, and publishes the playlist as `write` says.
fn fake_ffmpeg(segments: u32, finish: Finish, write: PlaylistWrite) -> String {
    let publish = match write {
        PlaylistWrite::Incremental => "mv \"$tmp\" \"$playlist\"",
        PlaylistWrite::AtExit => "",
    };
    let tail = match (finish, write) {
        (Finish::Hang, _) => "exec sleep 60",
        (Finish::Exit, PlaylistWrite::Incremental) => {
            "echo '#EXT-X-ENDLIST' >> \"$playlist\"\nexit 0"
        }
        (Finish::Exit, PlaylistWrite::AtExit) => {
            "echo '#EXT-X-ENDLIST' >> \"$tmp\"\nmv \"$tmp\" \"$playlist\"\nexit 0"
        }
    };
    format!(
        r##"#!/bin/sh
start=0
pattern=""
playlist=""
while [ $# -gt 0 ]; do
  case "$1" in
    -start_number) start="$2"; shift ;;
    -hls_segment_filename) pattern="$2"; shift ;;
  esac
  playlist="$1"
  shift
done
dir=$(dirname "$playlist")
echo "$start" >> "$dir/starts.txt"
tmp="$dir/index.m3u8.tmp"
{{
  echo "#EXTM3U"
  echo "#EXT-X-VERSION:3"
  echo "#EXT-X-TARGETDURATION:2"
  echo "#EXT-X-MEDIA-SEQUENCE:$start"
}} > "$tmp"
n=0
while [ $n -lt {segments} ]; do
  i=$((start + n))
  printf 'segment-%s' "$i" > "$(printf "$pattern" "$i")"
  echo "#EXTINF:2.000000," >> "$tmp"
  echo "segment$i.ts" >> "$tmp"
  n=$((n + 1))
done
{publish}
{tail}
"##
    )
}

fn fake_ffprobe(codec: &str, duration: f64) -> String {
    format!(
        r##"#!/bin/sh
cat <<'EOF'
{{"format":{{"format_name":"matroska,webm","duration":"{duration:.3}"}},"streams":[{{"codec_type":"video","codec_name":"{codec}","width":1920,"height":1080}},{{"codec_type":"audio","codec_name":"aac","channels":2}}]}}
EOF
"##
    )
}

fn write_script(path: &Path, body: &str) {
    std::fs::write(path, body).unwrap();
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

pub struct Harness {
    pub dir: TempDir,
    pub config: TranscodeConfig,
}

impl Harness {
    pub fn new(segments: u32, finish: Finish) -> Self {
        Self::for_mode(HlsMode::Streaming, segments, finish)
    }

    /// In `Vod` mode the stand-in encoder holds its playlist back until it exits.
    pub fn for_mode(mode: HlsMode, segments: u32, finish: Finish) -> Self {
        let write = match mode {
            HlsMode::Streaming => PlaylistWrite::Incremental,
            HlsMode::Vod => PlaylistWrite::AtExit,
        };
        Self::build(mode, write, segments, finish, "hevc", 600.0)
    }

    pub fn with_probe(segments: u32, finish: Finish, codec: &str, duration: f64) -> Self {
        Self::build(HlsMode::Streaming, PlaylistWrite::Incremental, segments, finish, codec, duration)
    }

    fn build(
        mode: HlsMode,
        write: PlaylistWrite,
        segments: u32,
        finish: Finish,
        codec: &str,
        duration: f64,
    ) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let ffmpeg = dir.path().join("ffmpeg");
        let ffprobe = dir.path().join("ffprobe");
        write_script(&ffmpeg, &fake_ffmpeg(segments, finish, write));
        write_script(&ffprobe, &fake_ffprobe(codec, duration));

        let config = TranscodeConfig {
            work_dir: dir.path().join("work"),
            ffmpeg_path: ffmpeg.to_string_lossy().into_owned(),
            ffprobe_path: ffprobe.to_string_lossy().into_owned(),
            hls_mode: mode,
            segment_duration: 2,
            poll_interval_ms: 20,
            stop_grace_ms: 100,
            segment_wait_timeout_secs: 5,
            ..TranscodeConfig::default()
        };
        Self { dir, config }
    }

    pub fn service(&self) -> TranscodeService {
        TranscodeService::with_accel(self.config.clone(), Arc::new(DirectResolver), Accel::Cpu)
    }

    pub fn output_dir(&self, id: &TaskId) -> PathBuf {
        self.config.work_dir.join(id.as_str())
    }

    /// Offsets (`-start_number` values) the encoder was launched with, in order.
    pub fn launches(&self, id: &TaskId) -> Vec<u64> {
        std::fs::read_to_string(self.output_dir(id).join("starts.txt"))
            .unwrap_or_default()
            .lines()
            .filter_map(|l| l.trim().parse().ok())
            .collect()
    }
}

pub async fn wait_for_status(service: &TranscodeService, id: &TaskId, status: TaskStatus) -> TaskView {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let view = service.registry().get(id).await.unwrap();
        if view.status == status {
            return view;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("task {id} stuck in {:?}, wanted {:?}", view.status, status);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
