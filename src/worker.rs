use std::time::Instant;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::hls;
use crate::metrics::ENCODER_LAUNCHES;
use crate::playlist::RunOutput;
use crate::registry::{Outcome, TaskRegistry};
use crate::task::TaskId;

enum LoopEvent {
    Exited(Option<i32>),
    Stop,
    Tick,
}

/// Run one attempt of a task: launch ffmpeg, watch for the first playable
/// output and record how the process ended.
///
/// The task state is re-read on every tick. A cancelled or superseded attempt
/// stops its encoder even if nobody signals the stop channel.
pub(crate) async fn run(
    registry: TaskRegistry,
    id: TaskId,
    attempt: u32,
    mut stop_rx: watch::Receiver<bool>,
) {
    let Some(plan) = registry.begin_launch(&id, attempt).await else {
        debug!("task={} attempt={} superseded before launch", id, attempt);
        return;
    };
    let config = std::sync::Arc::clone(&registry.inner.config);
    let dir = plan.output_dir;

    if let Err(e) = tokio::fs::create_dir_all(&dir).await {
        registry
            .finish(&id, attempt, Outcome::LaunchFailed(format!("cannot create {}: {e}", dir.display())))
            .await;
        return;
    }
    if let Err(e) = hls::clear_run_output(&dir).await {
        warn!("task={} could not clear old output: {}", id, e);
    }
    let notify = registry.watcher().notifier(&dir);

    let mut process = match plan.command.spawn(&dir.join(hls::LOG_NAME), id.as_str()).await {
        Ok(p) => p,
        Err(e) => {
            registry.finish(&id, attempt, Outcome::LaunchFailed(e.to_string())).await;
            return;
        }
    };
    ENCODER_LAUNCHES.inc();

    if !registry.mark_running(&id, attempt).await {
        process.terminate(config.stop_grace()).await;
        return;
    }

    let ready_deadline = Instant::now() + config.ready_timeout();
    let mut ready = false;
    let mut warned = false;
    let mut ticker = tokio::time::interval(config.poll_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        let event = tokio::select! {
            status = process.wait() => LoopEvent::Exited(status.ok().and_then(|s| s.code())),
            _ = stop_rx.changed() => LoopEvent::Stop,
            _ = notify.notified() => LoopEvent::Tick,
            _ = ticker.tick() => LoopEvent::Tick,
        };

        match event {
            LoopEvent::Exited(code) => {
                let stderr = process.last_stderr_line().await;
                registry.finish(&id, attempt, Outcome::Exited { code, stderr }).await;
                break;
            }
            LoopEvent::Stop => {
                process.terminate(config.stop_grace()).await;
                break;
            }
            LoopEvent::Tick => {
                if !registry.is_current(&id, attempt).await {
                    info!("task={} attempt={} no longer current, stopping encoder", id, attempt);
                    process.terminate(config.stop_grace()).await;
                    break;
                }
                if ready {
                    continue;
                }
                let has_segment = RunOutput::scan(&dir).await.has_complete(true);
                if has_segment {
                    ready = registry.mark_ready(&id, attempt).await;
                    if ready {
                        info!("task={} ready (first segment written)", id);
                    }
                } else if !warned && Instant::now() >= ready_deadline {
                    warned = true;
                    warn!(
                        "task={} produced no segment within {:?}; still waiting for the encoder",
                        id,
                        config.ready_timeout()
                    );
                }
            }
        }
    }
}
