use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tracing::{info, warn};

use crate::error::{Result, TranscodeError};
use crate::hardware::Accel;
use crate::headers::HeaderBuilder;
use crate::hls::OutputWatcher;
use crate::metrics::{ADMISSION_REJECTIONS, TASKS_ACTIVE};
use crate::resolver::SourceResolver;
use crate::settings::TranscodeConfig;
use crate::task::{DedupKey, NewTask, StopReason, Task, TaskId, TaskState, TaskView, Worker};
use crate::transcoder::{EncodeJob, EncoderCommand};
use crate::worker;

/// The only owner of transcode tasks. Every read hands out a copy and every
/// mutation happens under one lock; processes are stopped and files removed
/// after the lock is released.
#[derive(Clone)]
pub struct TaskRegistry {
    pub(crate) inner: Arc<Inner>,
}

pub(crate) struct Inner {
    pub state: Mutex<RegistryState>,
    pub config: Arc<TranscodeConfig>,
    pub accel: Accel,
    pub resolver: Arc<dyn SourceResolver>,
    pub headers: HeaderBuilder,
    pub watcher: OutputWatcher,
}

#[derive(Default)]
pub(crate) struct RegistryState {
    pub tasks: HashMap<TaskId, Task>,
    pub by_key: HashMap<DedupKey, TaskId>,
}

impl RegistryState {
    pub fn active_count(&self) -> usize {
        self.tasks.values().filter(|t| t.state.is_active()).count()
    }

    pub fn publish_gauge(&self) {
        TASKS_ACTIVE.set(self.active_count() as i64);
    }

    /// Drop a task from both maps; `by_key` only if it still points at this task.
    pub fn remove(&mut self, id: &TaskId) -> Option<Task> {
        let task = self.tasks.remove(id)?;
        if self.by_key.get(&task.key) == Some(id) {
            self.by_key.remove(&task.key);
        }
        Some(task)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistrySummary {
    pub total: usize,
    pub active: usize,
    pub max_concurrent: usize,
}

/// What the worker needs to launch one attempt.
pub(crate) struct LaunchPlan {
    pub command: EncoderCommand,
    pub output_dir: PathBuf,
}

/// Internal copy of the fields delivery and seek decide on.
#[derive(Debug, Clone)]
pub(crate) struct TaskSnapshot {
    pub state: TaskState,
    pub output_dir: PathBuf,
    pub seek_time: f64,
    pub duration: Option<f64>,
}

pub(crate) enum Outcome {
    Exited { code: Option<i32>, stderr: Option<String> },
    LaunchFailed(String),
}

impl TaskRegistry {
    pub fn new(
        config: TranscodeConfig,
        accel: Accel,
        resolver: Arc<dyn SourceResolver>,
        headers: HeaderBuilder,
        watcher: OutputWatcher,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(RegistryState::default()),
                config: Arc::new(config),
                accel,
                resolver,
                headers,
                watcher,
            }),
        }
    }

    pub fn config(&self) -> &TranscodeConfig {
        &self.inner.config
    }

    pub(crate) fn watcher(&self) -> &OutputWatcher {
        &self.inner.watcher
    }

    /// Return the live task for `key`, or admit and start a new one.
    ///
    /// Completed tasks are reused as well: their segments are still on disk.
    /// A failed or cancelled task is replaced.
    pub async fn get_or_create(&self, key: DedupKey, new: NewTask) -> Result<(TaskView, bool)> {
        let mut state = self.inner.state.lock().await;

        if let Some(task) = state
            .by_key
            .get(&key)
            .cloned()
            .and_then(|id| state.tasks.get_mut(&id))
        {
            if task.state.is_reusable() {
                task.touch();
                return Ok((task.view(), false));
            }
        }

        let max = self.inner.config.max_concurrent_tasks;
        let active = state.active_count();
        if active >= max {
            ADMISSION_REJECTIONS.inc();
            warn!("Rejecting transcode for key={}: {} of {} slots busy", key, active, max);
            return Err(TranscodeError::ConcurrencyLimit(max));
        }

        let replaced = state
            .by_key
            .get(&key)
            .cloned()
            .and_then(|old| state.remove(&old));

        let id = TaskId::generate();
        let output_dir = self.inner.config.work_dir.join(id.as_str());
        let start = clamp_to_duration(new.start_time, new.duration);
        let seek_time = self.inner.config.align_to_segment(start);
        let mut task = Task::new(id.clone(), key.clone(), output_dir, seek_time, new);
        info!(
            "Created transcode task={} key={} file={:?} start={}",
            id, key, task.file_name, seek_time
        );

        self.spawn_worker(&mut task);
        let view = task.view();
        state.by_key.insert(key, id.clone());
        state.tasks.insert(id, task);
        state.publish_gauge();
        drop(state);

        if let Some(old) = replaced {
            info!("Replacing {:?} task={} for key={}", old.state.status(), old.id, view.dedup_key);
            self.dispose(old).await;
        }
        Ok((view, true))
    }

    /// Non-terminal or completed task for `key`, touching it.
    pub async fn find_reusable(&self, key: &DedupKey) -> Option<TaskView> {
        let mut state = self.inner.state.lock().await;
        let id = state.by_key.get(key).cloned()?;
        let task = state.tasks.get_mut(&id)?;
        if !task.state.is_reusable() {
            return None;
        }
        task.touch();
        Some(task.view())
    }

    pub async fn get(&self, id: &TaskId) -> Result<TaskView> {
        let mut state = self.inner.state.lock().await;
        let task = state
            .tasks
            .get_mut(id)
            .ok_or_else(|| TranscodeError::TaskNotFound(id.to_string()))?;
        task.touch();
        Ok(task.view())
    }

    pub async fn list(&self) -> Vec<TaskView> {
        let state = self.inner.state.lock().await;
        let mut views: Vec<TaskView> = state.tasks.values().map(Task::view).collect();
        views.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        views
    }

    pub async fn summary(&self) -> RegistrySummary {
        let state = self.inner.state.lock().await;
        RegistrySummary {
            total: state.tasks.len(),
            active: state.active_count(),
            max_concurrent: self.inner.config.max_concurrent_tasks,
        }
    }

    /// Stop the encoder and mark the task cancelled. Stopping a task that is
    /// already terminal changes nothing.
    pub async fn stop(&self, id: &TaskId, reason: StopReason) -> Result<TaskView> {
        let gate = self.gate(id).await?;
        let _guard = gate.lock().await;

        let (worker, view) = {
            let mut state = self.inner.state.lock().await;
            let task = state
                .tasks
                .get_mut(id)
                .ok_or_else(|| TranscodeError::TaskNotFound(id.to_string()))?;
            if task.state.is_active() {
                info!("Stopping task={} reason={:?}", id, reason);
                task.transition(TaskState::Cancelled { reason });
            }
            let worker = task.worker.take();
            let view = task.view();
            state.publish_gauge();
            (worker, view)
        };

        if let Some(worker) = worker {
            worker.shutdown().await;
        }
        Ok(view)
    }

    /// Stop and forget the task, removing its output directory.
    pub async fn delete(&self, id: &TaskId) -> Result<()> {
        let gate = self.gate(id).await?;
        let _guard = gate.lock().await;

        let task = {
            let mut state = self.inner.state.lock().await;
            let mut task = state
                .remove(id)
                .ok_or_else(|| TranscodeError::TaskNotFound(id.to_string()))?;
            if task.state.is_active() {
                task.transition(TaskState::Cancelled {
                    reason: StopReason::Deleted,
                });
            }
            state.publish_gauge();
            task
        };
        info!("Deleted task={}", id);
        self.dispose(task).await;
        Ok(())
    }

    /// Stop every active task. Used on server shutdown.
    pub async fn shutdown(&self) {
        let ids: Vec<TaskId> = {
            let state = self.inner.state.lock().await;
            state
                .tasks
                .values()
                .filter(|t| t.state.is_active() || t.worker.is_some())
                .map(|t| t.id.clone())
                .collect()
        };
        info!("Stopping {} transcode task(s)", ids.len());
        for id in ids {
            let _ = self.stop(&id, StopReason::Shutdown).await;
        }
    }

    /// Stop a removed task's worker and delete its files.
    pub(crate) async fn dispose(&self, mut task: Task) {
        if let Some(worker) = task.worker.take() {
            worker.shutdown().await;
        }
        self.inner.watcher.unregister(&task.output_dir);
        match tokio::fs::remove_dir_all(&task.output_dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove {}: {}", task.output_dir.display(), e),
        }
    }

    pub(crate) async fn gate(&self, id: &TaskId) -> Result<Arc<Mutex<()>>> {
        let state = self.inner.state.lock().await;
        state
            .tasks
            .get(id)
            .map(|t| Arc::clone(&t.gate))
            .ok_or_else(|| TranscodeError::TaskNotFound(id.to_string()))
    }

    pub(crate) async fn snapshot(&self, id: &TaskId, touch: bool) -> Result<TaskSnapshot> {
        let mut state = self.inner.state.lock().await;
        let task = state
            .tasks
            .get_mut(id)
            .ok_or_else(|| TranscodeError::TaskNotFound(id.to_string()))?;
        if touch {
            task.touch();
        }
        Ok(TaskSnapshot {
            state: task.state.clone(),
            output_dir: task.output_dir.clone(),
            seek_time: task.seek_time,
            duration: task.duration,
        })
    }

    /// Start the worker for the task's current attempt. Caller holds the state lock.
    pub(crate) fn spawn_worker(&self, task: &mut Task) {
        let (stop_tx, stop_rx) = watch::channel(false);
        let registry = self.clone();
        let id = task.id.clone();
        let attempt = task.attempt;
        let handle = tokio::spawn(async move {
            worker::run(registry, id, attempt, stop_rx).await;
        });
        task.worker = Some(Worker {
            attempt,
            stop: stop_tx,
            handle,
        });
    }

    /// Queued -> Starting for the given attempt, returning how to launch it.
    /// `None` means the attempt was superseded or cancelled before it started.
    pub(crate) async fn begin_launch(&self, id: &TaskId, attempt: u32) -> Option<LaunchPlan> {
        let mut state = self.inner.state.lock().await;
        let task = state.tasks.get_mut(id)?;
        if task.attempt != attempt || task.state != TaskState::Queued {
            return None;
        }
        task.transition(TaskState::Starting);
        let job = EncodeJob {
            source_url: &task.source_url,
            headers: &task.headers,
            media: &task.media,
            file_name: &task.file_name,
            output_dir: &task.output_dir,
            start_time: task.seek_time,
        };
        let command = EncoderCommand::build(&self.inner.config, self.inner.accel, &job);
        Some(LaunchPlan {
            command,
            output_dir: task.output_dir.clone(),
        })
    }

    /// Starting -> Running once the process exists.
    pub(crate) async fn mark_running(&self, id: &TaskId, attempt: u32) -> bool {
        self.advance(id, attempt, TaskState::Starting, TaskState::Running).await
    }

    /// Running -> Ready once the first segment is listed.
    pub(crate) async fn mark_ready(&self, id: &TaskId, attempt: u32) -> bool {
        self.advance(id, attempt, TaskState::Running, TaskState::Ready).await
    }

    async fn advance(&self, id: &TaskId, attempt: u32, from: TaskState, to: TaskState) -> bool {
        let mut state = self.inner.state.lock().await;
        match state.tasks.get_mut(id) {
            Some(task) if task.attempt == attempt && task.state == from => {
                task.transition(to);
                true
            }
            _ => false,
        }
    }

    /// Whether `attempt` is still the one the task wants running.
    pub(crate) async fn is_current(&self, id: &TaskId, attempt: u32) -> bool {
        let state = self.inner.state.lock().await;
        state
            .tasks
            .get(id)
            .map(|t| t.attempt == attempt && t.state.is_active())
            .unwrap_or(false)
    }

    /// Record how an attempt ended. Cancelled or superseded attempts are left alone.
    pub(crate) async fn finish(&self, id: &TaskId, attempt: u32, outcome: Outcome) {
        let mut state = self.inner.state.lock().await;
        let Some(task) = state.tasks.get_mut(id) else {
            return;
        };
        if task.attempt != attempt || !task.state.is_active() {
            return;
        }
        let next = match outcome {
            Outcome::Exited { code: Some(0), .. } => {
                info!("Transcode finished: task={} attempt={}", id, attempt);
                TaskState::Completed { exit_code: 0 }
            }
            Outcome::Exited { code, stderr } => {
                let message = match (code, stderr) {
                    (Some(c), Some(line)) => format!("ffmpeg exited with code {c}: {line}"),
                    (Some(c), None) => format!("ffmpeg exited with code {c}"),
                    (None, Some(line)) => format!("ffmpeg terminated by signal: {line}"),
                    (None, None) => "ffmpeg terminated by signal".to_string(),
                };
                warn!("Transcode failed: task={} attempt={} {}", id, attempt, message);
                TaskState::Error {
                    message,
                    exit_code: code,
                }
            }
            Outcome::LaunchFailed(message) => {
                warn!("Transcode launch failed: task={} attempt={} {}", id, attempt, message);
                TaskState::Error {
                    message,
                    exit_code: None,
                }
            }
        };
        task.transition(next);
        state.publish_gauge();
    }
}

/// Keep a start or seek target inside the file when its length is known.
pub(crate) fn clamp_to_duration(time: f64, duration: Option<f64>) -> f64 {
    let time = if time.is_finite() { time.max(0.0) } else { 0.0 };
    match duration {
        Some(d) if d > 1.0 => time.min(d - 1.0),
        _ => time,
    }
}
