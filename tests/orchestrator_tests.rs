#![cfg(unix)]

mod common;

use common::{wait_for_status, Finish, Harness};
use vodhls::delivery::SegmentFetch;
use vodhls::error::TranscodeError;
use vodhls::service::{StartOutcome, StartRequest, TranscodeService};
use vodhls::settings::HlsMode;
use vodhls::task::{StopReason, TaskId, TaskStatus};

fn request(source_key: &str) -> StartRequest {
    StartRequest {
        source_key: source_key.to_string(),
        file_name: None,
        start_time: None,
        known_duration: None,
    }
}

async fn start(service: &TranscodeService, source_key: &str) -> (TaskId, bool) {
    match service.start(request(source_key)).await.unwrap() {
        StartOutcome::Transcode { task, created, .. } => (task.task_id, created),
        StartOutcome::DirectPlay { url, .. } => panic!("unexpected direct play of {url}"),
    }
}

async fn segment_text(service: &TranscodeService, id: &TaskId, index: u64) -> String {
    match service.registry().segment(id, index).await.unwrap() {
        SegmentFetch::Data(bytes) => String::from_utf8(bytes.to_vec()).unwrap(),
        SegmentFetch::Skip => panic!("segment {index} skipped"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_starts_share_one_task() {
    let h = Harness::new(10, Finish::Hang);
    let service = h.service();

    let (a, b) = tokio::join!(
        start(&service, "/media/Show.S01E01.mkv"),
        start(&service, "/media/Show.S01E01.mkv")
    );
    assert_eq!(a.0, b.0);
    assert!(a.1 ^ b.1, "exactly one request creates the task");

    wait_for_status(&service, &a.0, TaskStatus::Ready).await;
    let summary = service.registry().summary().await;
    assert_eq!(summary.total, 1);
    assert_eq!(summary.active, 1);
    assert_eq!(h.launches(&a.0), vec![0]);

    // A later request reuses the running task as well.
    let (again, created) = start(&service, "/media/Show.S01E01.mkv").await;
    assert_eq!(again, a.0);
    assert!(!created);

    service.registry().shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn admission_is_limited_by_active_tasks() {
    let mut h = Harness::new(5, Finish::Hang);
    h.config.max_concurrent_tasks = 1;
    let service = h.service();

    let (first, _) = start(&service, "/media/One.mkv").await;
    let err = service.start(request("/media/Two.mkv")).await.unwrap_err();
    assert!(matches!(err, TranscodeError::ConcurrencyLimit(1)));
    assert!(err.is_retryable());

    service.registry().stop(&first, StopReason::Requested).await.unwrap();
    let (second, created) = start(&service, "/media/Two.mkv").await;
    assert!(created);
    assert_ne!(first, second);

    service.registry().shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn segment_past_the_end_is_rejected() {
    let h = Harness::new(3, Finish::Hang);
    let service = h.service();
    let (id, _) = start(&service, "/media/Movie.mkv").await;

    let err = service.registry().segment(&id, 300).await.unwrap_err();
    assert!(matches!(err, TranscodeError::InvalidRequest(_)));

    service.registry().shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn finished_encode_is_reused_and_served() {
    let h = Harness::new(5, Finish::Exit);
    let service = h.service();
    let (id, _) = start(&service, "/media/Short.mkv").await;

    let view = wait_for_status(&service, &id, TaskStatus::Completed).await;
    assert_eq!(view.exit_code, Some(0));
    assert_eq!(segment_text(&service, &id, 4).await, "segment-4");

    let (again, created) = start(&service, "/media/Short.mkv").await;
    assert_eq!(again, id);
    assert!(!created);

    let outcome = service.registry().seek(&id, 4.0).await.unwrap();
    assert!(outcome.already_covered);

    service.registry().shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failed_task_is_replaced_on_next_start() {
    let mut h = Harness::new(5, Finish::Hang);
    h.config.ffmpeg_path = h.dir.path().join("missing-ffmpeg").to_string_lossy().into_owned();
    let service = h.service();

    let (id, _) = start(&service, "/media/Broken.mkv").await;
    let view = wait_for_status(&service, &id, TaskStatus::Error).await;
    assert!(view.error.unwrap().contains("not found"));

    let (replacement, created) = start(&service, "/media/Broken.mkv").await;
    assert!(created);
    assert_ne!(replacement, id);
    assert!(service.registry().get(&id).await.is_err());

    service.registry().shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stop_is_idempotent_and_delete_removes_output() {
    let h = Harness::new(5, Finish::Hang);
    let service = h.service();
    let (id, _) = start(&service, "/media/Movie.mkv").await;
    wait_for_status(&service, &id, TaskStatus::Ready).await;

    let first = service.registry().stop(&id, StopReason::Requested).await.unwrap();
    let second = service.registry().stop(&id, StopReason::Idle).await.unwrap();
    assert_eq!(first.status, TaskStatus::Cancelled);
    assert_eq!(second.cancel_reason, Some(StopReason::Requested));
    assert_eq!(service.registry().summary().await.active, 0);

    service.registry().delete(&id).await.unwrap();
    assert!(matches!(
        service.registry().get(&id).await,
        Err(TranscodeError::TaskNotFound(_))
    ));
    assert!(!h.output_dir(&id).exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reaper_stops_idle_tasks_and_removes_expired_output() {
    let mut h = Harness::new(5, Finish::Hang);
    h.config.idle_timeout_secs = 0;
    h.config.retention_secs = 0;
    let service = h.service();
    let (id, _) = start(&service, "/media/Movie.mkv").await;
    wait_for_status(&service, &id, TaskStatus::Ready).await;

    let stray = h.config.work_dir.join("left-over-from-a-crash");
    std::fs::create_dir_all(&stray).unwrap();

    let report = service.registry().reap().await;
    assert_eq!(report.idle_stopped, 1);
    assert_eq!(report.removed, 1);
    assert_eq!(report.orphans_removed, 1);
    assert!(service.registry().get(&id).await.is_err());
    assert!(!h.output_dir(&id).exists());
    assert!(!stray.exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn compatible_file_plays_directly() {
    let h = Harness::with_probe(5, Finish::Hang, "h264", 60.0);
    let service = h.service();

    match service.start(request("/media/clip.mp4")).await.unwrap() {
        StartOutcome::DirectPlay { url, transcode, .. } => {
            assert!(!transcode);
            assert_eq!(url, "/media/clip.mp4");
        }
        StartOutcome::Transcode { .. } => panic!("h264 mp4 should not be transcoded"),
    }
    assert_eq!(service.registry().summary().await.total, 0);

    // Same codec but the container alone forces a transcode.
    let (_, created) = start(&service, "/media/clip.mkv").await;
    assert!(created);
    service.registry().shutdown().await;
}

async fn fresh_start_becomes_ready_and_serves_segments(mode: HlsMode) {
    let h = Harness::for_mode(mode, 10, Finish::Hang);
    let service = h.service();

    let (id, created) = start(&service, "/media/Movie.2019.mkv").await;
    assert!(created);

    let view = wait_for_status(&service, &id, TaskStatus::Ready).await;
    assert!(view.ready);
    assert_eq!(view.duration, Some(600.0));
    assert_eq!(view.media.video_codec.as_deref(), Some("hevc"));
    assert_eq!(view.file_name, "Movie.2019.mkv");

    let playlist = service.registry().playlist(&id).await.unwrap();
    assert!(playlist.content.contains("segment/0\n"));
    assert!(playlist.content.contains("segment/9\n"));
    assert!(!playlist.content.contains(".ts"));

    assert_eq!(segment_text(&service, &id, 3).await, "segment-3");
    assert!(h.output_dir(&id).join("transcode.log").exists());

    service.registry().shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fresh_start_serves_segments_streaming() {
    fresh_start_becomes_ready_and_serves_segments(HlsMode::Streaming).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fresh_start_serves_segments_vod() {
    fresh_start_becomes_ready_and_serves_segments(HlsMode::Vod).await;
}

async fn seek_inside_encoded_range_keeps_the_encoder(mode: HlsMode) {
    let h = Harness::for_mode(mode, 10, Finish::Hang);
    let service = h.service();
    let (id, _) = start(&service, "/media/Movie.mkv").await;
    wait_for_status(&service, &id, TaskStatus::Ready).await;

    let outcome = service.registry().seek(&id, 6.0).await.unwrap();
    assert!(outcome.already_covered);
    assert!(!outcome.restarted);
    assert_eq!(outcome.task.attempt, 1);
    assert_eq!(h.launches(&id), vec![0]);

    service.registry().shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn seek_inside_keeps_the_encoder_streaming() {
    seek_inside_encoded_range_keeps_the_encoder(HlsMode::Streaming).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn seek_inside_keeps_the_encoder_vod() {
    seek_inside_encoded_range_keeps_the_encoder(HlsMode::Vod).await;
}

async fn seek_beyond_encoded_range_restarts_at_target(mode: HlsMode) {
    let h = Harness::for_mode(mode, 10, Finish::Hang);
    let service = h.service();
    let (id, _) = start(&service, "/media/Movie.mkv").await;
    wait_for_status(&service, &id, TaskStatus::Ready).await;

    let outcome = service.registry().seek(&id, 101.0).await.unwrap();
    assert!(outcome.restarted);
    assert_eq!(outcome.task_id, id);
    assert_eq!(outcome.current_seek_time, 100.0);
    assert_eq!(outcome.task.attempt, 2);

    wait_for_status(&service, &id, TaskStatus::Ready).await;
    assert_eq!(h.launches(&id), vec![0, 50]);
    assert_eq!(segment_text(&service, &id, 52).await, "segment-52");
    // Output of the first run is gone.
    assert!(!h.output_dir(&id).join("segment3.ts").exists());

    // Far behind the new start: the player is told to move on.
    let fetch = service.registry().segment(&id, 10).await.unwrap();
    assert!(matches!(fetch, SegmentFetch::Skip));

    service.registry().shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn seek_beyond_restarts_at_target_streaming() {
    seek_beyond_encoded_range_restarts_at_target(HlsMode::Streaming).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn seek_beyond_restarts_at_target_vod() {
    seek_beyond_encoded_range_restarts_at_target(HlsMode::Vod).await;
}

async fn segment_far_ahead_restarts_the_encoder(mode: HlsMode) {
    let h = Harness::for_mode(mode, 10, Finish::Hang);
    let service = h.service();
    let (id, _) = start(&service, "/media/Movie.mkv").await;
    wait_for_status(&service, &id, TaskStatus::Ready).await;

    assert_eq!(segment_text(&service, &id, 40).await, "segment-40");
    assert_eq!(h.launches(&id), vec![0, 40]);

    let view = service.registry().get(&id).await.unwrap();
    assert_eq!(view.current_seek_time, 80.0);
    assert_eq!(view.attempt, 2);

    service.registry().shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn segment_far_ahead_restarts_streaming() {
    segment_far_ahead_restarts_the_encoder(HlsMode::Streaming).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn segment_far_ahead_restarts_vod() {
    segment_far_ahead_restarts_the_encoder(HlsMode::Vod).await;
}

async fn start_time_is_aligned_to_the_segment_grid(mode: HlsMode) {
    let h = Harness::for_mode(mode, 4, Finish::Hang);
    let service = h.service();
    let mut req = request("/media/Movie.mkv");
    req.start_time = Some(33.0);
    let StartOutcome::Transcode { task, .. } = service.start(req).await.unwrap() else {
        panic!("expected a transcode");
    };
    assert_eq!(task.current_seek_time, 32.0);

    wait_for_status(&service, &task.task_id, TaskStatus::Ready).await;
    assert_eq!(h.launches(&task.task_id), vec![16]);
    assert_eq!(segment_text(&service, &task.task_id, 17).await, "segment-17");

    service.registry().shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn start_time_is_aligned_streaming() {
    start_time_is_aligned_to_the_segment_grid(HlsMode::Streaming).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn start_time_is_aligned_vod() {
    start_time_is_aligned_to_the_segment_grid(HlsMode::Vod).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn vod_mode_lists_the_whole_timeline_up_front() {
    let h = Harness::for_mode(HlsMode::Vod, 3, Finish::Hang);
    let service = h.service();
    let (id, _) = start(&service, "/media/Movie.mkv").await;

    let playlist = service.registry().playlist(&id).await.unwrap();
    assert_eq!(playlist.duration, Some(600.0));
    assert!(playlist.content.contains("#EXT-X-PLAYLIST-TYPE:VOD"));
    assert!(playlist.content.contains("segment/299\n"));
    assert!(playlist.content.ends_with("#EXT-X-ENDLIST\n"));

    service.registry().shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unlisted_segments_on_disk_are_served_without_restart() {
    // The encoder keeps running and never publishes a playlist.
    let h = Harness::for_mode(HlsMode::Vod, 40, Finish::Hang);
    let service = h.service();
    let (id, _) = start(&service, "/media/Movie.mkv").await;
    wait_for_status(&service, &id, TaskStatus::Ready).await;
    let last = h.output_dir(&id).join("segment39.ts");
    for _ in 0..500 {
        if last.exists() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert!(!h.output_dir(&id).join("index.m3u8").exists());

    assert_eq!(segment_text(&service, &id, 15).await, "segment-15");
    assert_eq!(h.launches(&id), vec![0]);
    assert!(h.output_dir(&id).join("segment3.ts").exists());

    let outcome = service.registry().seek(&id, 40.0).await.unwrap();
    assert!(outcome.already_covered);
    assert!(!outcome.restarted);
    assert_eq!(h.launches(&id), vec![0]);

    service.registry().shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn finished_vod_encode_publishes_its_playlist_at_exit() {
    let h = Harness::for_mode(HlsMode::Vod, 5, Finish::Exit);
    let service = h.service();
    let (id, _) = start(&service, "/media/Short.mkv").await;

    wait_for_status(&service, &id, TaskStatus::Completed).await;
    // The last segment has no successor; it counts once the encoder is gone.
    assert_eq!(segment_text(&service, &id, 4).await, "segment-4");
    let outcome = service.registry().seek(&id, 8.0).await.unwrap();
    assert!(outcome.already_covered);

    service.registry().shutdown().await;
}

#[tokio::test]
async fn unknown_task_is_not_found() {
    let h = Harness::new(1, Finish::Hang);
    let service = h.service();
    let id = TaskId::from("nope".to_string());
    assert!(matches!(
        service.registry().seek(&id, 10.0).await,
        Err(TranscodeError::TaskNotFound(_))
    ));
    assert!(matches!(
        service.registry().playlist(&id).await,
        Err(TranscodeError::TaskNotFound(_))
    ));
}
