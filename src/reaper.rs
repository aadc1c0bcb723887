use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReadDirStream;
use tracing::{debug, info, warn};

use crate::hls;
use crate::registry::TaskRegistry;
use crate::task::{StopReason, Task, TaskId, TaskState};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReapReport {
    pub reconciled: usize,
    pub idle_stopped: usize,
    pub removed: usize,
    pub orphans_removed: usize,
}

impl ReapReport {
    pub fn is_empty(&self) -> bool {
        *self == ReapReport::default()
    }
}

impl TaskRegistry {
    /// One cleanup pass.
    pub async fn reap(&self) -> ReapReport {
        let cfg = self.config();
        let idle_limit = chrono::Duration::seconds(cfg.idle_timeout_secs as i64);
        let retention = chrono::Duration::seconds(cfg.retention_secs as i64);
        let mut report = ReapReport::default();

        // Workers that died without recording an outcome, and idle tasks.
        let idle: Vec<TaskId> = {
            let mut state = self.inner.state.lock().await;
            let now = Utc::now();
            for task in state.tasks.values_mut() {
                if task.state.is_active() && worker_gone(task) {
                    warn!("task={} worker ended without a final status", task.id);
                    task.worker = None;
                    task.transition(TaskState::Error {
                        message: "encoder worker exited unexpectedly".to_string(),
                        exit_code: None,
                    });
                    report.reconciled += 1;
                }
            }
            state.publish_gauge();
            state
                .tasks
                .values()
                .filter(|t| t.state.is_active() && now - t.last_access_at >= idle_limit)
                .map(|t| t.id.clone())
                .collect()
        };

        for id in idle {
            info!("Stopping idle task={}", id);
            if self.stop(&id, StopReason::Idle).await.is_ok() {
                report.idle_stopped += 1;
            }
        }

        // Terminal tasks past retention.
        let (expired, owned): (Vec<Task>, HashSet<PathBuf>) = {
            let mut state = self.inner.state.lock().await;
            let now = Utc::now();
            let ids: Vec<TaskId> = state
                .tasks
                .values()
                .filter(|t| t.state.is_terminal() && now - t.last_activity() >= retention)
                .map(|t| t.id.clone())
                .collect();
            let expired = ids.iter().filter_map(|id| state.remove(id)).collect();
            let owned = state.tasks.values().map(|t| t.output_dir.clone()).collect();
            (expired, owned)
        };

        for task in expired {
            info!("Removing expired task={} ({:?})", task.id, task.state.status());
            self.dispose(task).await;
            report.removed += 1;
        }

        report.orphans_removed = self.remove_orphans(&owned, cfg.retention_secs).await;
        report
    }

    /// Delete directories in the work dir that no task owns, e.g. after a crash.
    async fn remove_orphans(&self, owned: &HashSet<PathBuf>, retention_secs: u64) -> usize {
        let work_dir = &self.config().work_dir;
        let entries = match tokio::fs::read_dir(work_dir).await {
            Ok(d) => d,
            Err(e) => {
                debug!("cannot scan {}: {}", work_dir.display(), e);
                return 0;
            }
        };

        let retention = Duration::from_secs(retention_secs);
        let mut removed = 0;
        let mut entries = ReadDirStream::new(entries);
        while let Some(entry) = entries.next().await {
            let Ok(entry) = entry else { continue };
            let path = entry.path();
            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            if !is_dir || owned.contains(&path) {
                continue;
            }
            let age = hls::modified_age(&path).await.unwrap_or_default();
            if age < retention {
                continue;
            }
            match tokio::fs::remove_dir_all(&path).await {
                Ok(()) => {
                    info!("Removed orphaned output {}", path.display());
                    removed += 1;
                }
                Err(e) => warn!("Failed to remove orphan {}: {}", path.display(), e),
            }
        }
        removed
    }
}

fn worker_gone(task: &Task) -> bool {
    match &task.worker {
        Some(w) => w.attempt == task.attempt && w.handle.is_finished(),
        None => true,
    }
}

pub fn spawn_reaper(registry: TaskRegistry, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so startup is quiet.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let report = registry.reap().await;
            if report.is_empty() {
                debug!("cleanup pass: nothing to do");
            } else {
                info!(
                    "cleanup pass: reconciled={} idle_stopped={} removed={} orphans_removed={}",
                    report.reconciled, report.idle_stopped, report.removed, report.orphans_removed
                );
            }
        }
    })
}
