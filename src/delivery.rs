use std::time::{Duration, Instant};

use bytes::Bytes;

use tracing::{debug, info};

use crate::error::{Result, TranscodeError};
use crate::hls;
use crate::metrics::SEGMENTS_SKIPPED;
use crate::playlist::{self, EncoderPlaylist, RunOutput};
use crate::registry::{TaskRegistry, TaskSnapshot};
use crate::settings::HlsMode;
use crate::task::TaskId;

const PLAYLIST_WAIT: Duration = Duration::from_secs(1);
const PLAYLIST_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct PlaylistBody {
    pub content: String,
    /// Total length of the source, for the player's timeline.
    pub duration: Option<f64>,
}

#[derive(Debug)]
pub enum SegmentFetch {
    Data(Bytes),
    /// The segment lies behind the current encode and will not be produced.
    Skip,
}

/// Where a requested segment stands relative to the running encode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Placement {
    Complete,
    Skip,
    Wait,
    Restart,
}

impl TaskRegistry {
    pub async fn playlist(&self, id: &TaskId) -> Result<PlaylistBody> {
        let snap = self.snapshot(id, true).await?;
        let cfg = self.config();

        if cfg.hls_mode == HlsMode::Vod {
            if let Some(duration) = snap.duration.filter(|d| *d > 0.0) {
                return Ok(PlaylistBody {
                    content: playlist::vod_playlist(duration, cfg.segment_secs(), snap.seek_time),
                    duration: Some(duration),
                });
            }
        }

        // Wait briefly for the encoder's own playlist; players retry on 503.
        let path = hls::playlist_path(&snap.output_dir);
        let deadline = Instant::now() + PLAYLIST_WAIT;
        loop {
            if let Ok(text) = tokio::fs::read_to_string(&path).await {
                if !EncoderPlaylist::parse(&text).is_empty() {
                    return Ok(PlaylistBody {
                        content: playlist::rewrite_encoder_playlist(&text),
                        duration: snap.duration,
                    });
                }
            }
            if Instant::now() >= deadline {
                return Err(TranscodeError::PlaylistNotReady);
            }
            self.watcher().wait_for_change(&snap.output_dir, PLAYLIST_POLL).await;
        }
    }

    /// Fetch segment `index`, waiting for it or restarting the encoder at it
    /// when needed.
    pub async fn segment(&self, id: &TaskId, index: u64) -> Result<SegmentFetch> {
        let snap = self.snapshot(id, true).await?;
        let cfg = self.config();
        if let Some(duration) = snap.duration {
            if index as f64 * cfg.segment_secs() >= duration {
                return Err(TranscodeError::InvalidRequest(format!(
                    "segment {index} is past the end of the source"
                )));
            }
        }

        match self.placement(&snap, index).await {
            Placement::Complete => {
                return self.read_segment(&snap, index).await.map(SegmentFetch::Data)
            }
            Placement::Skip => {
                SEGMENTS_SKIPPED.inc();
                info!("Segment skipped: task={} index={} start={}", id, index, snap.seek_time);
                return Ok(SegmentFetch::Skip);
            }
            Placement::Wait => {}
            Placement::Restart => self.restart_for_segment(id, index).await?,
        }

        self.wait_for_segment(id, index).await.map(SegmentFetch::Data)
    }

    async fn placement(&self, snap: &TaskSnapshot, index: u64) -> Placement {
        let cfg = self.config();
        let active = snap.state.is_active();
        let output = RunOutput::scan(&snap.output_dir).await;
        if output.is_complete(index, active) {
            return Placement::Complete;
        }

        let start = cfg.segment_index_at(snap.seek_time);
        if index + cfg.skip_behind_segments < start {
            return Placement::Skip;
        }
        let newest = output.newest().unwrap_or(start).max(start);
        if active && index >= start && index <= newest + cfg.segment_wait_ahead {
            return Placement::Wait;
        }
        Placement::Restart
    }

    /// Restart at the segment unless another request already did.
    async fn restart_for_segment(&self, id: &TaskId, index: u64) -> Result<()> {
        let gate = self.gate(id).await?;
        let _guard = gate.lock().await;

        let snap = self.snapshot(id, false).await?;
        if self.placement(&snap, index).await == Placement::Restart {
            let time = index as f64 * self.config().segment_secs();
            info!("Segment {} outside the current encode of task={}, restarting at {:.1}s", index, id, time);
            self.restart_locked(id, time).await?;
        }
        Ok(())
    }

    async fn wait_for_segment(&self, id: &TaskId, index: u64) -> Result<Bytes> {
        let cfg = self.config();
        let deadline = Instant::now() + cfg.segment_wait_timeout();
        loop {
            let snap = self.snapshot(id, false).await?;
            if self.placement(&snap, index).await == Placement::Complete {
                return self.read_segment(&snap, index).await;
            }
            if snap.state.is_terminal() || Instant::now() >= deadline {
                debug!("segment {} of task={} not ready (status {:?})", index, id, snap.state.status());
                return Err(TranscodeError::SegmentNotReady(index));
            }
            self.watcher()
                .wait_for_change(&snap.output_dir, cfg.poll_interval())
                .await;
        }
    }

    async fn read_segment(&self, snap: &TaskSnapshot, index: u64) -> Result<Bytes> {
        let path = hls::segment_path(&snap.output_dir, index);
        tokio::fs::read(&path).await.map(Bytes::from).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                TranscodeError::SegmentNotReady(index)
            } else {
                TranscodeError::Io(e)
            }
        })
    }
}
