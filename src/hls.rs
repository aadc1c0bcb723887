use std::{
    collections::{BTreeSet, HashMap},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::{Duration, SystemTime},
};

use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

pub const PLAYLIST_NAME: &str = "index.m3u8";
pub const SEGMENT_TEMPLATE: &str = "segment%d.ts";
pub const LOG_NAME: &str = "transcode.log";

pub fn playlist_path(dir: &Path) -> PathBuf {
    dir.join(PLAYLIST_NAME)
}

pub fn segment_file_name(index: u64) -> String {
    format!("segment{index}.ts")
}

pub fn segment_path(dir: &Path, index: u64) -> PathBuf {
    dir.join(segment_file_name(index))
}

/// Parse `segment<N>.ts` back into `N`.
pub fn segment_index_from_name(name: &str) -> Option<u64> {
    name.strip_prefix("segment")?
        .strip_suffix(".ts")?
        .parse()
        .ok()
}

fn is_run_output(name: &str) -> bool {
    name == PLAYLIST_NAME
        || name.starts_with("index.m3u8.")
        || (name.starts_with("segment") && (name.ends_with(".ts") || name.ends_with(".ts.tmp")))
}

/// Indices of the non-empty segment files in `dir`.
pub async fn segments_on_disk(dir: &Path) -> BTreeSet<u64> {
    let mut found = BTreeSet::new();
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return found;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name();
        let Some(index) = name.to_str().and_then(segment_index_from_name) else {
            continue;
        };
        if entry.metadata().await.map(|m| m.len() > 0).unwrap_or(false) {
            found.insert(index);
        }
    }
    found
}

/// Remove the playlist and every segment of the previous encoder run.
/// The encoder log is kept so consecutive attempts stay in one file.
pub async fn clear_run_output(dir: &Path) -> std::io::Result<usize> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };

    let mut removed = 0;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if let Some(name) = path.file_name().and_then(|s| s.to_str()) {
            if is_run_output(name) && tokio::fs::remove_file(&path).await.is_ok() {
                removed += 1;
            }
        }
    }
    Ok(removed)
}

/// Time since the path was last modified, if the filesystem reports it.
pub async fn modified_age(path: &Path) -> Option<Duration> {
    let modified = tokio::fs::metadata(path).await.ok()?.modified().ok()?;
    SystemTime::now().duration_since(modified).ok()
}

/// Wakes waiters whenever something changes inside a registered output directory.
///
/// Filesystem events are a latency optimisation only. If the platform watcher
/// cannot be created every waiter still polls, so callers must always combine
/// `notified()` with a timeout.
#[derive(Clone)]
pub struct OutputWatcher {
    inner: Arc<WatcherInner>,
}

struct WatcherInner {
    dirs: Mutex<HashMap<PathBuf, Arc<Notify>>>,
    _watcher: Option<Mutex<RecommendedWatcher>>,
}

impl OutputWatcher {
    pub fn new(base_dir: &Path) -> Self {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<Event>();

        let watcher = std::fs::create_dir_all(base_dir)
            .map_err(notify::Error::io)
            .and_then(|_| {
                let mut watcher =
                    notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
                        if let Ok(event) = res {
                            let _ = tx.send(event);
                        }
                    })?;
                watcher.watch(base_dir, RecursiveMode::Recursive)?;
                Ok(watcher)
            });

        let watcher = match watcher {
            Ok(w) => {
                info!("Watching {} for encoder output", base_dir.display());
                Some(Mutex::new(w))
            }
            Err(e) => {
                warn!(
                    "File watcher unavailable for {} ({}); falling back to polling",
                    base_dir.display(),
                    e
                );
                None
            }
        };

        let inner = Arc::new(WatcherInner {
            dirs: Mutex::new(HashMap::new()),
            _watcher: watcher,
        });

        let weak = Arc::downgrade(&inner);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                for path in &event.paths {
                    let Some(parent) = path.parent() else {
                        continue;
                    };
                    let notify = inner
                        .dirs
                        .lock()
                        .ok()
                        .and_then(|dirs| dirs.get(parent).cloned());
                    if let Some(notify) = notify {
                        debug!("output changed: {}", path.display());
                        notify.notify_waiters();
                    }
                }
            }
        });

        Self { inner }
    }

    /// Notifier for `dir`, registering it on first use.
    pub fn notifier(&self, dir: &Path) -> Arc<Notify> {
        match self.inner.dirs.lock() {
            Ok(mut dirs) => dirs
                .entry(dir.to_path_buf())
                .or_insert_with(|| Arc::new(Notify::new()))
                .clone(),
            Err(_) => Arc::new(Notify::new()),
        }
    }

    pub fn unregister(&self, dir: &Path) {
        if let Ok(mut dirs) = self.inner.dirs.lock() {
            dirs.remove(dir);
        }
    }

    /// Wait for a change in `dir` or until `max_wait` elapses, whichever comes first.
    pub async fn wait_for_change(&self, dir: &Path, max_wait: Duration) {
        let notify = self.notifier(dir);
        let _ = tokio::time::timeout(max_wait, notify.notified()).await;
    }
}
