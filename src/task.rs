use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::headers::HeaderBlock;
use crate::probe::MediaInfo;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for TaskId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of a source file. Two requests for the same file share one task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct DedupKey(String);

impl DedupKey {
    pub fn from_source(source_key: &str) -> Self {
        let digest = Sha256::digest(source_key.trim().as_bytes());
        Self(hex::encode(&digest[..8]))
    }
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StopReason {
    Idle,
    Seek,
    Requested,
    Deleted,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Starting,
    Running,
    Ready,
    Completed,
    Error,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TaskState {
    Queued,
    Starting,
    Running,
    Ready,
    Completed { exit_code: i32 },
    Error { message: String, exit_code: Option<i32> },
    Cancelled { reason: StopReason },
}

impl TaskState {
    pub fn status(&self) -> TaskStatus {
        match self {
            TaskState::Queued => TaskStatus::Queued,
            TaskState::Starting => TaskStatus::Starting,
            TaskState::Running => TaskStatus::Running,
            TaskState::Ready => TaskStatus::Ready,
            TaskState::Completed { .. } => TaskStatus::Completed,
            TaskState::Error { .. } => TaskStatus::Error,
            TaskState::Cancelled { .. } => TaskStatus::Cancelled,
        }
    }

    /// Counts against the concurrency ceiling.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            TaskState::Queued | TaskState::Starting | TaskState::Running | TaskState::Ready
        )
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }

    /// A new start request for the same source reuses the task in this state.
    pub fn is_reusable(&self) -> bool {
        !matches!(self, TaskState::Error { .. } | TaskState::Cancelled { .. })
    }
}

/// Everything needed to create a task for a resolved, probed source.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub source_key: String,
    pub source_url: String,
    pub headers: HeaderBlock,
    pub file_name: String,
    pub media: MediaInfo,
    pub duration: Option<f64>,
    pub start_time: f64,
}

/// Handle on the background worker that owns the encoder process of one attempt.
pub(crate) struct Worker {
    pub attempt: u32,
    pub stop: watch::Sender<bool>,
    pub handle: JoinHandle<()>,
}

impl Worker {
    /// Ask the worker to stop its encoder and wait until it has.
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        let _ = self.handle.await;
    }
}

pub(crate) struct Task {
    pub id: TaskId,
    pub key: DedupKey,
    pub source_key: String,
    pub state: TaskState,
    pub source_url: String,
    pub headers: HeaderBlock,
    pub file_name: String,
    pub media: MediaInfo,
    pub duration: Option<f64>,
    pub output_dir: PathBuf,
    /// Start offset of the current encoder run, on the segment grid.
    pub seek_time: f64,
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub ready_at: Option<DateTime<Utc>>,
    pub last_access_at: DateTime<Utc>,
    pub access_count: u64,
    pub worker: Option<Worker>,
    /// Serializes stop, seek and restart for this task.
    pub gate: Arc<Mutex<()>>,
}

impl Task {
    pub fn new(id: TaskId, key: DedupKey, output_dir: PathBuf, seek_time: f64, new: NewTask) -> Self {
        let now = Utc::now();
        Self {
            id,
            key,
            source_key: new.source_key,
            state: TaskState::Queued,
            source_url: new.source_url,
            headers: new.headers,
            file_name: new.file_name,
            media: new.media,
            duration: new.duration,
            output_dir,
            seek_time,
            attempt: 1,
            created_at: now,
            updated_at: now,
            ready_at: None,
            last_access_at: now,
            access_count: 1,
            worker: None,
            gate: Arc::new(Mutex::new(())),
        }
    }

    pub fn transition(&mut self, next: TaskState) {
        if next == TaskState::Ready {
            self.ready_at = Some(Utc::now());
        }
        self.state = next;
        self.updated_at = Utc::now();
    }

    pub fn touch(&mut self) {
        self.last_access_at = Utc::now();
        self.access_count += 1;
    }

    /// Most recent of the last update and the last viewer access.
    pub fn last_activity(&self) -> DateTime<Utc> {
        self.updated_at.max(self.last_access_at)
    }

    pub fn view(&self) -> TaskView {
        let (error, exit_code, cancel_reason) = match &self.state {
            TaskState::Completed { exit_code } => (None, Some(*exit_code), None),
            TaskState::Error { message, exit_code } => (Some(message.clone()), *exit_code, None),
            TaskState::Cancelled { reason } => (None, None, Some(*reason)),
            _ => (None, None, None),
        };
        TaskView {
            task_id: self.id.clone(),
            dedup_key: self.key.clone(),
            status: self.state.status(),
            ready: matches!(self.state, TaskState::Ready | TaskState::Completed { .. }),
            error,
            exit_code,
            cancel_reason,
            file_name: self.file_name.clone(),
            duration: self.duration,
            current_seek_time: self.seek_time,
            attempt: self.attempt,
            media: self.media.clone(),
            playlist_url: format!("/transcode/{}/playlist", self.id),
            created_at: self.created_at,
            updated_at: self.updated_at,
            ready_at: self.ready_at,
            last_access_at: self.last_access_at,
            access_count: self.access_count,
        }
    }
}

/// Point-in-time copy of a task, safe to hand out of the registry.
#[derive(Debug, Clone, Serialize)]
pub struct TaskView {
    pub task_id: TaskId,
    pub dedup_key: DedupKey,
    pub status: TaskStatus,
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancel_reason: Option<StopReason>,
    pub file_name: String,
    pub duration: Option<f64>,
    pub current_seek_time: f64,
    pub attempt: u32,
    pub media: MediaInfo,
    pub playlist_url: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub ready_at: Option<DateTime<Utc>>,
    pub last_access_at: DateTime<Utc>,
    pub access_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_key_is_stable() {
        let a = DedupKey::from_source("pick-123");
        let b = DedupKey::from_source(" pick-123 ");
        assert_eq!(a, b);
        assert_eq!(a.to_string().len(), 16);
        assert_ne!(a, DedupKey::from_source("pick-124"));
    }

    #[test]
    fn task_ids_are_unique() {
        assert_ne!(TaskId::generate(), TaskId::generate());
        assert_eq!(TaskId::generate().as_str().len(), 32);
    }

    #[test]
    fn state_classes() {
        assert!(TaskState::Ready.is_active());
        assert!(TaskState::Completed { exit_code: 0 }.is_terminal());
        assert!(TaskState::Completed { exit_code: 0 }.is_reusable());
        assert!(!TaskState::Cancelled { reason: StopReason::Idle }.is_reusable());
        assert!(!TaskState::Error {
            message: "boom".into(),
            exit_code: Some(1)
        }
        .is_reusable());
    }
}
