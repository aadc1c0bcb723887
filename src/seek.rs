use serde::Serialize;
use tracing::{info, warn};

use crate::error::{Result, TranscodeError};
use crate::hls;
use crate::playlist::RunOutput;
use crate::registry::{clamp_to_duration, TaskRegistry, TaskSnapshot};
use crate::task::{StopReason, TaskId, TaskState, TaskStatus, TaskView};

#[derive(Debug, Clone, Serialize)]
pub struct SeekOutcome {
    pub task_id: TaskId,
    pub restarted: bool,
    pub already_covered: bool,
    pub current_seek_time: f64,
    pub target: f64,
    pub status: TaskStatus,
    pub task: TaskView,
}

impl TaskRegistry {
    /// Move playback of a task to `target` seconds.
    ///
    /// Time already encoded by the current run, and a target right next to
    /// where an active run started, are served as they are. Anything else
    /// restarts the encoder at the segment containing `target`.
    pub async fn seek(&self, id: &TaskId, target: f64) -> Result<SeekOutcome> {
        if !target.is_finite() {
            return Err(TranscodeError::InvalidRequest(format!("invalid seek time {target}")));
        }

        let gate = self.gate(id).await?;
        let _guard = gate.lock().await;

        let snap = self.snapshot(id, true).await?;
        let target = clamp_to_duration(target, snap.duration);

        if self.covers(&snap, target).await {
            info!("Seek task={} to {:.1}s: already covered", id, target);
            let task = self.get(id).await?;
            return Ok(SeekOutcome {
                task_id: id.clone(),
                restarted: false,
                already_covered: true,
                current_seek_time: snap.seek_time,
                target,
                status: task.status,
                task,
            });
        }

        let task = self.restart_locked(id, target).await?;
        Ok(SeekOutcome {
            task_id: id.clone(),
            restarted: true,
            already_covered: false,
            current_seek_time: task.current_seek_time,
            target,
            status: task.status,
            task,
        })
    }

    /// Whether the current run has produced, or is about to produce, `target`.
    async fn covers(&self, snap: &TaskSnapshot, target: f64) -> bool {
        let cfg = self.config();
        let active = snap.state.is_active();
        let covered = RunOutput::scan(&snap.output_dir).await.covered_duration(
            cfg.segment_index_at(snap.seek_time),
            cfg.segment_secs(),
            active,
        );

        if target >= snap.seek_time && target <= snap.seek_time + covered + cfg.seek_grace_secs {
            // A finished run keeps its segments only if it got that far.
            return covered > 0.0 || active;
        }
        active && (target - snap.seek_time).abs() <= cfg.seek_on_target_secs
    }

    /// Stop the current run, drop its segments, refresh an expiring source URL
    /// and queue a new attempt at `time`. The caller holds the task gate.
    pub(crate) async fn restart_locked(&self, id: &TaskId, time: f64) -> Result<TaskView> {
        let (worker, dir, source_key, key) = {
            let mut state = self.inner.state.lock().await;
            let task = state
                .tasks
                .get_mut(id)
                .ok_or_else(|| TranscodeError::TaskNotFound(id.to_string()))?;
            if task.state.is_active() {
                task.transition(TaskState::Cancelled {
                    reason: StopReason::Seek,
                });
            }
            (
                task.worker.take(),
                task.output_dir.clone(),
                task.source_key.clone(),
                task.key.clone(),
            )
        };

        if let Some(worker) = worker {
            worker.shutdown().await;
        }
        if let Err(e) = hls::clear_run_output(&dir).await {
            warn!("task={} could not clear segments before restart: {}", id, e);
        }

        let refreshed = if self.inner.resolver.is_time_limited() {
            match self.inner.resolver.resolve(&source_key).await {
                Ok(source) => {
                    let headers = self.inner.headers.build(&source, &key);
                    Some((source.url, headers))
                }
                Err(e) => {
                    warn!("task={} source refresh failed, keeping previous URL: {}", id, e);
                    None
                }
            }
        } else {
            None
        };

        let mut state = self.inner.state.lock().await;
        let task = state
            .tasks
            .get_mut(id)
            .ok_or_else(|| TranscodeError::TaskNotFound(id.to_string()))?;
        if let Some((url, headers)) = refreshed {
            task.source_url = url;
            task.headers = headers;
        }
        let time = clamp_to_duration(time, task.duration);
        task.seek_time = self.inner.config.align_to_segment(time);
        task.attempt += 1;
        task.ready_at = None;
        task.transition(TaskState::Queued);
        info!(
            "Restarting task={} at {:.1}s (attempt {})",
            id, task.seek_time, task.attempt
        );
        self.spawn_worker(task);
        let view = task.view();
        state.publish_gauge();
        Ok(view)
    }
}
