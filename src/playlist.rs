use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::path::Path;

use crate::hls;

#[derive(Debug, Clone, PartialEq)]
pub struct PlaylistEntry {
    pub index: u64,
    pub duration: f64,
}

/// What ffmpeg has written so far.
#[derive(Debug, Clone, Default)]
pub struct EncoderPlaylist {
    pub entries: Vec<PlaylistEntry>,
    pub target_duration: Option<u64>,
    pub ended: bool,
}

impl EncoderPlaylist {
    pub fn parse(text: &str) -> Self {
        let mut out = EncoderPlaylist::default();
        let mut pending: Option<f64> = None;

        for line in text.lines().map(str::trim) {
            if let Some(rest) = line.strip_prefix("#EXTINF:") {
                let dur = rest.split(',').next().unwrap_or("").trim();
                pending = dur.parse::<f64>().ok();
            } else if let Some(rest) = line.strip_prefix("#EXT-X-TARGETDURATION:") {
                out.target_duration = rest.trim().parse().ok();
            } else if line == "#EXT-X-ENDLIST" {
                out.ended = true;
            } else if !line.is_empty() && !line.starts_with('#') {
                let name = line.rsplit('/').next().unwrap_or(line);
                if let (Some(duration), Some(index)) =
                    (pending.take(), hls::segment_index_from_name(name))
                {
                    out.entries.push(PlaylistEntry { index, duration });
                }
            }
        }
        out
    }

    pub async fn load(path: &Path) -> Option<Self> {
        let text = tokio::fs::read_to_string(path).await.ok()?;
        Some(Self::parse(&text))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Seconds of media produced by the current run.
    pub fn covered_duration(&self) -> f64 {
        self.entries.iter().map(|e| e.duration).sum()
    }

    pub fn contains(&self, index: u64) -> bool {
        self.entries.iter().any(|e| e.index == index)
    }

    /// Highest segment index written so far.
    pub fn head(&self) -> Option<u64> {
        self.entries.iter().map(|e| e.index).max()
    }
}

/// Output of the current encoder run, judged from the segment files as well
/// as the playlist. ffmpeg lists a segment only after closing it, and some
/// playlist types are written only when the encode ends.
#[derive(Debug, Clone, Default)]
pub struct RunOutput {
    pub listed: EncoderPlaylist,
    pub on_disk: BTreeSet<u64>,
}

impl RunOutput {
    pub async fn scan(dir: &Path) -> Self {
        Self {
            listed: EncoderPlaylist::load(&hls::playlist_path(dir))
                .await
                .unwrap_or_default(),
            on_disk: hls::segments_on_disk(dir).await,
        }
    }

    /// A segment file is finished once it is listed, once the next one exists,
    /// or once the encoder is gone.
    pub fn is_complete(&self, index: u64, encoder_running: bool) -> bool {
        self.listed.contains(index)
            || (self.on_disk.contains(&index)
                && (!encoder_running || self.on_disk.contains(&(index + 1))))
    }

    /// At least one segment can be served.
    pub fn has_complete(&self, encoder_running: bool) -> bool {
        !self.listed.is_empty()
            || self
                .on_disk
                .iter()
                .any(|&i| self.is_complete(i, encoder_running))
    }

    /// Highest segment index written so far, finished or not.
    pub fn newest(&self) -> Option<u64> {
        self.listed.head().max(self.on_disk.last().copied())
    }

    /// Seconds of finished media from `start_index` on without a gap.
    pub fn covered_duration(&self, start_index: u64, segment_secs: f64, encoder_running: bool) -> f64 {
        let contiguous = (start_index..)
            .take_while(|&i| self.is_complete(i, encoder_running))
            .count();
        self.listed
            .covered_duration()
            .max(contiguous as f64 * segment_secs)
    }
}

/// Rewrite ffmpeg's playlist for players: segment URIs become delivery URLs
/// relative to the playlist URL and TARGETDURATION always covers the longest EXTINF.
pub fn rewrite_encoder_playlist(text: &str) -> String {
    let parsed = EncoderPlaylist::parse(text);
    let longest = parsed
        .entries
        .iter()
        .map(|e| e.duration)
        .fold(0.0_f64, f64::max)
        .ceil() as u64;
    let target = parsed.target_duration.unwrap_or(0).max(longest).max(1);

    let mut saw_version = false;
    let mut saw_target = false;
    let mut lines: Vec<String> = Vec::new();

    for line in text.lines().map(str::trim) {
        if line.is_empty() || line == "#EXT-X-INDEPENDENT-SEGMENTS" {
            continue;
        }
        if line.starts_with("#EXT-X-VERSION:") {
            saw_version = true;
            lines.push("#EXT-X-VERSION:3".to_string());
        } else if line.starts_with("#EXT-X-TARGETDURATION:") {
            saw_target = true;
            lines.push(format!("#EXT-X-TARGETDURATION:{target}"));
        } else if line.starts_with('#') {
            lines.push(line.to_string());
        } else {
            let name = line.rsplit('/').next().unwrap_or(line);
            match hls::segment_index_from_name(name) {
                Some(index) => lines.push(format!("segment/{index}")),
                None => lines.push(line.to_string()),
            }
        }
    }

    // ffmpeg always writes both tags, but a truncated read may not have them yet.
    let mut missing = Vec::new();
    if !saw_version {
        missing.push("#EXT-X-VERSION:3".to_string());
    }
    if !saw_target {
        missing.push(format!("#EXT-X-TARGETDURATION:{target}"));
    }
    let at = lines
        .iter()
        .position(|l| l == "#EXTM3U")
        .map(|i| i + 1)
        .unwrap_or(0);
    lines.splice(at..at, missing);

    lines.join("\n") + "\n"
}

/// A complete VOD playlist for a source of known length. Every segment is
/// listed so players can show the full timeline; segments that do not exist
/// yet are produced on request.
pub fn vod_playlist(total_duration: f64, segment_secs: f64, start_offset: f64) -> String {
    let segment_secs = segment_secs.max(1.0);
    let count = (total_duration / segment_secs).ceil().max(1.0) as u64;

    let mut out = String::new();
    out.push_str("#EXTM3U\n#EXT-X-VERSION:3\n");
    let _ = writeln!(out, "#EXT-X-TARGETDURATION:{}", segment_secs.ceil() as u64);
    out.push_str("#EXT-X-MEDIA-SEQUENCE:0\n#EXT-X-PLAYLIST-TYPE:VOD\n");
    if start_offset > 0.0 {
        let _ = writeln!(out, "#EXT-X-START:TIME-OFFSET={start_offset:.3},PRECISE=YES");
    }

    for index in 0..count {
        let remaining = total_duration - index as f64 * segment_secs;
        let duration = remaining.min(segment_secs).max(0.001);
        let _ = writeln!(out, "#EXTINF:{duration:.6},");
        let _ = writeln!(out, "segment/{index}");
    }
    out.push_str("#EXT-X-ENDLIST\n");
    out
}
