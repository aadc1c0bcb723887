use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::Result;
use crate::hardware::{self, Accel};
use crate::headers::HeaderBuilder;
use crate::hls::OutputWatcher;
use crate::policy::TranscodePolicy;
use crate::probe::{MediaInfo, MediaProber};
use crate::registry::TaskRegistry;
use crate::resolver::{file_name_from_url, SourceResolver};
use crate::settings::TranscodeConfig;
use crate::task::{DedupKey, NewTask, TaskStatus, TaskView};

#[derive(Debug, Clone, Deserialize)]
pub struct StartRequest {
    /// Stable identity of the file with the storage provider.
    pub source_key: String,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub start_time: Option<f64>,
    /// Length known to the caller, used when probing cannot tell.
    #[serde(default)]
    pub known_duration: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum StartOutcome {
    Transcode {
        transcode: bool,
        task_id: String,
        status: TaskStatus,
        created: bool,
        task: TaskView,
    },
    DirectPlay {
        transcode: bool,
        url: String,
        reasons: Vec<String>,
    },
}

/// Entry point used by the HTTP layer: resolves, decides and hands off to the registry.
#[derive(Clone)]
pub struct TranscodeService {
    registry: TaskRegistry,
    prober: Arc<MediaProber>,
    policy: Arc<TranscodePolicy>,
    resolver: Arc<dyn SourceResolver>,
}

impl TranscodeService {
    /// Must be called inside a Tokio runtime.
    pub fn new(config: TranscodeConfig, resolver: Arc<dyn SourceResolver>) -> Self {
        let accel = hardware::detect(&config.hw_accel, &config.vaapi_device);
        Self::with_accel(config, resolver, accel)
    }

    pub fn with_accel(config: TranscodeConfig, resolver: Arc<dyn SourceResolver>, accel: Accel) -> Self {
        info!(
            "Transcoder: accel={} hls_mode={:?} segment={}s max_tasks={} work_dir={}",
            accel,
            config.hls_mode,
            config.segment_duration,
            config.max_concurrent_tasks,
            config.work_dir.display()
        );
        let prober = Arc::new(MediaProber::new(
            config.ffprobe_path.clone(),
            config.probe_timeout(),
            Duration::from_secs(config.probe_cache_ttl_secs),
        ));
        let policy = Arc::new(TranscodePolicy::new(config.policy.clone()));
        let watcher = OutputWatcher::new(&config.work_dir);
        let registry = TaskRegistry::new(
            config.clone(),
            accel,
            Arc::clone(&resolver),
            HeaderBuilder::new(config.headers.clone()),
            watcher,
        );
        Self {
            registry,
            prober,
            policy,
            resolver,
        }
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    pub async fn start(&self, req: StartRequest) -> Result<StartOutcome> {
        let key = DedupKey::from_source(&req.source_key);

        if let Some(task) = self.registry.find_reusable(&key).await {
            info!("Reusing task={} for key={}", task.task_id, key);
            return Ok(transcode(task, false));
        }

        let source = self.resolver.resolve(&req.source_key).await?;
        let file_name = req
            .file_name
            .clone()
            .or_else(|| source.file_name.clone())
            .or_else(|| file_name_from_url(&source.url))
            .unwrap_or_else(|| req.source_key.clone());
        let headers = self.registry.inner.headers.build(&source, &key);

        let mut decision = self.policy.check_name(&file_name);
        let mut media: Option<MediaInfo> = None;
        if !decision.transcode && self.policy.uses_codecs() {
            let probed = self.prober.probe(&key, &source.url, &headers).await;
            decision = self.policy.should_transcode(&file_name, Some(&probed));
            media = Some(probed);
        }

        if !decision.transcode {
            info!("Direct play for {:?}: no transcode trigger", file_name);
            return Ok(StartOutcome::DirectPlay {
                transcode: false,
                url: source.url,
                reasons: decision.reasons,
            });
        }
        info!("Transcode needed for {:?}: {}", file_name, decision.reasons.join(", "));

        let media = match media {
            Some(m) => m,
            None => self.prober.probe(&key, &source.url, &headers).await,
        };
        let duration = media
            .duration
            .or(source.duration)
            .or(req.known_duration)
            .filter(|d| d.is_finite() && *d > 0.0);

        let new = NewTask {
            source_key: req.source_key,
            source_url: source.url,
            headers,
            file_name,
            media,
            duration,
            start_time: req.start_time.unwrap_or(0.0),
        };
        let (task, created) = self.registry.get_or_create(key, new).await?;
        Ok(transcode(task, created))
    }
}

fn transcode(task: TaskView, created: bool) -> StartOutcome {
    StartOutcome::Transcode {
        transcode: true,
        task_id: task.task_id.to_string(),
        status: task.status,
        created,
        task,
    }
}
