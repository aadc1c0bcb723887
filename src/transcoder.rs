use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use sysinfo::{Pid, System};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::error::{Result, TranscodeError};
use crate::hardware::{self, Accel, DecodePath};
use crate::headers::HeaderBlock;
use crate::hls;
use crate::metrics::ENCODER_CPU_USAGE;
use crate::probe::MediaInfo;
use crate::settings::TranscodeConfig;

const STDERR_RING_LINES: usize = 50;
const CPU_SAMPLE_INTERVAL: Duration = Duration::from_secs(5);

/// One encoder run: which source, where to, and from which offset.
pub struct EncodeJob<'a> {
    pub source_url: &'a str,
    pub headers: &'a HeaderBlock,
    pub media: &'a MediaInfo,
    pub file_name: &'a str,
    pub output_dir: &'a Path,
    pub start_time: f64,
}

#[derive(Debug, Clone)]
pub struct EncoderCommand {
    program: String,
    args: Vec<String>,
    decode_path: DecodePath,
}

impl EncoderCommand {
    pub fn build(cfg: &TranscodeConfig, accel: Accel, job: &EncodeJob<'_>) -> Self {
        let decode_path = match accel {
            Accel::Cpu => DecodePath::Hardware,
            _ => hardware::decode_path(job.media, job.file_name),
        };
        let hw = hardware::ffmpeg_args(accel, decode_path, cfg);
        let segment_secs = cfg.segment_duration.max(1);

        let mut args: Vec<String> = vec![
            "-hide_banner".into(),
            "-nostats".into(),
            "-loglevel".into(),
            cfg.loglevel.clone(),
        ];
        args.extend(hw.global);

        if !job.headers.is_empty() {
            args.extend(["-headers".into(), job.headers.to_ffmpeg_block()]);
        }
        // Input seeking: ffmpeg jumps straight to the nearest keyframe instead of decoding up to it.
        if job.start_time > 0.0 {
            args.extend(["-ss".into(), format!("{:.3}", job.start_time)]);
        }
        args.extend(hw.input);
        args.extend(["-i".into(), job.source_url.to_string()]);

        args.extend(["-map".into(), "0:v:0".into(), "-map".into(), "0:a:0?".into()]);
        args.extend(hw.video);
        if let Some(b) = &cfg.video_bitrate {
            args.extend(["-b:v".into(), b.clone()]);
        }
        if let Some(m) = &cfg.maxrate {
            args.extend(["-maxrate".into(), m.clone()]);
        }
        if let Some(b) = &cfg.bufsize {
            args.extend(["-bufsize".into(), b.clone()]);
        }
        args.extend([
            "-g".into(),
            cfg.gop_size.to_string(),
            "-keyint_min".into(),
            cfg.gop_size.to_string(),
            // With -copyts `t` starts at the seek offset, so count the grid from there.
            "-force_key_frames".into(),
            format!("expr:gte(t,{:.3}+n_forced*{segment_secs})", job.start_time),
        ]);

        args.extend(["-c:a".into(), cfg.audio_encoder.clone()]);
        if let Some(b) = &cfg.audio_bitrate {
            args.extend(["-b:a".into(), b.clone()]);
        }
        if let Some(ch) = cfg.audio_channels {
            args.extend(["-ac".into(), ch.to_string()]);
        }
        if let Some(sr) = cfg.audio_sample_rate {
            args.extend(["-ar".into(), sr.to_string()]);
        }

        let start_number = cfg.segment_index_at(job.start_time);
        let segment_pattern = job.output_dir.join(hls::SEGMENT_TEMPLATE);
        let playlist = hls::playlist_path(job.output_dir);
        args.extend([
            "-map_metadata".into(), "-1".into(),
            "-map_chapters".into(), "-1".into(),
            "-threads".into(), cfg.threads.to_string(),
            // Keep source timestamps so segment N always holds the same media time.
            "-copyts".into(),
            "-avoid_negative_ts".into(), "disabled".into(),
            "-max_muxing_queue_size".into(), "1024".into(),
            "-max_delay".into(), "5000000".into(),
            "-f".into(), "hls".into(),
            // Always EVENT: the playlist has to grow while segments are written.
            "-hls_playlist_type".into(), "event".into(),
            "-hls_list_size".into(), "0".into(),
            "-hls_time".into(), segment_secs.to_string(),
            "-hls_segment_type".into(), "mpegts".into(),
            "-start_number".into(), start_number.to_string(),
            "-hls_segment_filename".into(), segment_pattern.to_string_lossy().into_owned(),
            "-y".into(),
            playlist.to_string_lossy().into_owned(),
        ]);

        Self {
            program: cfg.ffmpeg_path.clone(),
            args,
            decode_path,
        }
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn decode_path(&self) -> DecodePath {
        self.decode_path
    }

    /// The command line with the `-headers` value replaced by header names.
    pub fn display_redacted(&self) -> String {
        let mut out = vec![self.program.clone()];
        let mut iter = self.args.iter();
        while let Some(arg) = iter.next() {
            out.push(arg.clone());
            if arg == "-headers" {
                if let Some(block) = iter.next() {
                    let names: Vec<&str> = block
                        .split("\r\n")
                        .filter_map(|l| l.split_once(':').map(|(n, _)| n))
                        .collect();
                    out.push(format!("<{}>", names.join(",")));
                }
            }
        }
        out.join(" ")
    }

    /// Spawn ffmpeg. stderr is appended to `log_path` and the tail kept in memory;
    /// `label` tags the CPU usage gauge.
    pub async fn spawn(&self, log_path: &Path, label: &str) -> Result<EncoderProcess> {
        let mut log = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)
            .await?;
        let banner = format!(
            "\n=== {} {}\n",
            chrono::Utc::now().to_rfc3339(),
            self.display_redacted()
        );
        log.write_all(banner.as_bytes()).await?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    TranscodeError::EncoderNotFound(PathBuf::from(&self.program))
                } else {
                    TranscodeError::Spawn(e)
                }
            })?;

        let pid = child.id();
        info!("ffmpeg spawned: pid={:?} task={} decode={:?}", pid, label, self.decode_path);
        debug!("ffmpeg command: {}", self.display_redacted());

        let stdin = child.stdin.take();
        let stderr_tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_RING_LINES)));
        if let Some(stderr) = child.stderr.take() {
            let ring = Arc::clone(&stderr_tail);
            let label = label.to_string();
            tokio::spawn(async move {
                let mut reader = tokio::io::BufReader::new(stderr);
                let mut buffer = String::new();
                while let Ok(n) = reader.read_line(&mut buffer).await {
                    if n == 0 {
                        break;
                    }
                    let _ = log.write_all(buffer.as_bytes()).await;
                    let line = buffer.trim().to_string();
                    if !line.is_empty() {
                        let mut ring = ring.lock().await;
                        if ring.len() >= STDERR_RING_LINES {
                            ring.pop_front();
                        }
                        ring.push_back(line.clone());
                    }
                    // Run with `RUST_LOG=vodhls::transcoder=debug` to see it.
                    debug!("ffmpeg[{}]: {}", label, line);
                    buffer.clear();
                }
                let _ = log.flush().await;
            });
        }

        let (monitor_stop, monitor_rx) = watch::channel(false);
        if let Some(pid) = pid {
            spawn_cpu_monitor(pid, label.to_string(), monitor_rx);
        }

        Ok(EncoderProcess {
            child,
            stdin,
            stderr_tail,
            label: label.to_string(),
            monitor_stop,
        })
    }
}

fn spawn_cpu_monitor(pid: u32, label: String, mut stop_rx: watch::Receiver<bool>) {
    tokio::spawn(async move {
        let mut sys = System::new();
        let pid = Pid::from_u32(pid);
        loop {
            tokio::select! {
                _ = stop_rx.changed() => break,
                _ = tokio::time::sleep(CPU_SAMPLE_INTERVAL) => {
                    let processes = sysinfo::ProcessesToUpdate::Some(&[pid]);
                    sys.refresh_processes(processes, true);
                    match sys.process(pid) {
                        Some(process) => {
                            ENCODER_CPU_USAGE
                                .with_label_values(&[&label])
                                .set(process.cpu_usage() as f64);
                        }
                        None => break,
                    }
                }
            }
        }
        let _ = ENCODER_CPU_USAGE.remove_label_values(&[&label]);
    });
}

/// A running ffmpeg. Dropping it kills the process.
pub struct EncoderProcess {
    child: Child,
    stdin: Option<ChildStdin>,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
    label: String,
    monitor_stop: watch::Sender<bool>,
}

impl EncoderProcess {
    /// Wait for the process to exit. Cancel safe.
    pub async fn wait(&mut self) -> std::io::Result<ExitStatus> {
        self.child.wait().await
    }

    /// Ask ffmpeg to finish (`q` on stdin), then kill it if it is still alive after `grace`.
    pub async fn terminate(&mut self, grace: Duration) -> Option<ExitStatus> {
        if let Ok(Some(status)) = self.child.try_wait() {
            return Some(status);
        }

        if let Some(mut stdin) = self.stdin.take() {
            let _ = stdin.write_all(b"q\n").await;
            let _ = stdin.flush().await;
        }

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                info!("ffmpeg stopped (requested): task={} status={}", self.label, status);
                Some(status)
            }
            Ok(Err(e)) => {
                warn!("ffmpeg wait() failed: task={} err={}", self.label, e);
                None
            }
            Err(_) => {
                warn!("ffmpeg ignored quit after {:?}, killing: task={}", grace, self.label);
                if let Err(e) = self.child.kill().await {
                    warn!("ffmpeg kill failed: task={} err={}", self.label, e);
                }
                self.child.try_wait().ok().flatten()
            }
        }
    }

    pub async fn last_stderr_line(&self) -> Option<String> {
        self.stderr_tail.lock().await.back().cloned()
    }
}

impl Drop for EncoderProcess {
    fn drop(&mut self) {
        let _ = self.monitor_stop.send(true);
    }
}
