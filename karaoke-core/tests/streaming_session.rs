//! End-to-end session behaviour against the fake engine and codec.

mod common;

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use common::{
    cpu_profile, cuda_profile, decode_raw, encode_raw, events_until_done, harness,
    make_stereo_signal, TEST_RATE,
};
use karaoke_core::engine::Device;
use karaoke_core::events::SessionEvent;
use karaoke_core::service::{StartRequest, WireStatus};
use karaoke_core::KaraokeError;

fn start(id: &str, url: &str) -> StartRequest {
    StartRequest {
        url: url.into(),
        track_id: id.into(),
        predict_next: Vec::new(),
    }
}

#[test]
fn first_chunk_then_updates_then_complete() {
    let h = harness(cpu_profile(), |_| {});
    let rx = h.service.subscribe();

    let resp = h.service.start(start("song", "fake://60")).unwrap();
    assert!(resp.success);
    assert!(!resp.is_cached);
    assert_eq!(resp.first_chunk_url, "/stream/result/song");
    assert_eq!(resp.full_track_url, "/stream/full/song");
    assert!(resp.estimated_total_seconds > 0.0);

    let events = events_until_done(&rx, "song");

    let first = events
        .iter()
        .position(|e| matches!(e, SessionEvent::FirstChunk { .. }))
        .unwrap();
    let updates: Vec<usize> = events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::ChunkUpdated { chunk, .. } => Some(*chunk),
            _ => None,
        })
        .collect();
    assert_eq!(updates, vec![2, 3, 4, 5, 6, 7]);
    assert!(events
        .iter()
        .skip(first + 1)
        .all(|e| !matches!(e, SessionEvent::FirstChunk { .. })));
    assert_eq!(
        events.last(),
        Some(&SessionEvent::Complete {
            track_id: "song".into(),
            url: "/stream/full/song".into(),
        })
    );

    let progress: Vec<u8> = events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::Progress { progress, .. } => Some(*progress),
            _ => None,
        })
        .collect();
    assert!(progress.windows(2).all(|w| w[0] <= w[1]));

    let status = h.service.status("song");
    assert_eq!(status.status, WireStatus::Complete);
    assert_eq!(status.progress, Some(100));

    let body = h.service.result("song").unwrap();
    assert!(body.is_final);
    let audio = decode_raw(&body.bytes);
    assert_eq!(audio.len(), 60 * TEST_RATE as usize);
    assert_eq!(h.stats.call_count(), 7);
}

#[test]
fn instrumental_excludes_vocals() {
    let h = harness(cpu_profile(), |_| {});
    let input = make_stereo_signal(12.0, TEST_RATE);
    let bytes = h
        .service
        .separate_bytes(encode_raw(&input), Some("application/octet-stream".into()))
        .unwrap();
    let output = decode_raw(&bytes);
    assert_eq!(output.len(), input.len());
    for (a, b) in output.left.iter().zip(&input.left) {
        assert!((a - b).abs() < 1e-5);
    }
}

#[test]
fn cached_track_issues_no_engine_calls() {
    let h = harness(cpu_profile(), |_| {});
    h.service.start(start("hit", "fake://15")).unwrap();
    h.service.wait_for_result("hit").unwrap();
    let calls = h.stats.call_count();

    let resp = h.service.start(start("hit", "fake://15")).unwrap();
    assert!(resp.is_cached);
    assert!(resp.is_complete);
    assert_eq!(resp.estimated_total_seconds, 0.0);
    assert_eq!(h.stats.call_count(), calls);
}

#[test]
fn device_failure_mid_track_completes_on_cpu() {
    let h = harness(cuda_profile(), |_| {});
    *h.stats.fail_gpu_on_call.lock() = Some(3);
    let rx = h.service.subscribe();

    h.service.start(start("gpu", "fake://60")).unwrap();
    let events = events_until_done(&rx, "gpu");
    assert!(matches!(events.last(), Some(SessionEvent::Complete { .. })));

    let updates = events
        .iter()
        .filter(|e| matches!(e, SessionEvent::ChunkUpdated { .. }))
        .count();
    assert_eq!(updates + 1, 7);

    let audio = decode_raw(&h.service.wait_for_result("gpu").unwrap().bytes);
    assert_eq!(audio.len(), 60 * TEST_RATE as usize);

    let health = h.service.health();
    assert!(health.gpu_failed);
    assert_eq!(health.device, Device::Cpu);

    // Chunks 1-2 on the GPU, the failed third, then everything on the CPU.
    let calls = h.stats.calls.lock().clone();
    assert_eq!(&calls[..3], &[Device::Cuda, Device::Cuda, Device::Cuda]);
    assert!(calls[3..].iter().all(|d| *d == Device::Cpu));
    assert_eq!(calls.len(), 8);

    // A new session goes straight to the CPU.
    let loads_before = h.stats.loads.lock().len();
    h.service.start(start("after", "fake://20")).unwrap();
    h.service.wait_for_result("after").unwrap();
    let calls = h.stats.calls.lock().clone();
    assert!(calls[8..].iter().all(|d| *d == Device::Cpu));
    assert_eq!(h.stats.loads.lock().len(), loads_before);
}

#[test]
fn fallback_replans_remaining_audio_with_smaller_chunks() {
    let h = harness(cuda_profile(), |c| c.fallback_chunk_seconds = 5.0);
    *h.stats.fail_gpu_on_call.lock() = Some(2);
    let rx = h.service.subscribe();

    h.service.start(start("replan", "fake://60")).unwrap();
    let events = events_until_done(&rx, "replan");
    let last_chunk = events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::ChunkUpdated { chunk, .. } => Some(*chunk),
            _ => None,
        })
        .max()
        .unwrap();
    // Two 10 s windows, then nine 5 s windows for the remaining 41 s.
    assert_eq!(last_chunk, 11);

    let audio = decode_raw(&h.service.wait_for_result("replan").unwrap().bytes);
    assert_eq!(audio.len(), 60 * TEST_RATE as usize);
}

#[test]
fn decode_failure_ends_in_error() {
    let h = harness(cpu_profile(), |_| {});
    let rx = h.service.subscribe();
    h.service.start(start("broken", "fake://fail")).unwrap();

    let events = events_until_done(&rx, "broken");
    match events.last() {
        Some(SessionEvent::Error { error, .. }) => assert!(error.contains("cannot open")),
        other => panic!("expected error event, got {other:?}"),
    }
    let status = h.service.status("broken");
    assert_eq!(status.status, WireStatus::Error);
    assert!(status.error.unwrap().contains("decode failed"));

    let err = h.service.wait_for_result("broken").unwrap_err();
    assert_eq!(err.code(), "KARAOKE-SESSION-FAILED");
    assert_eq!(h.stats.call_count(), 0);
}

#[test]
fn cancel_between_chunks() {
    let h = harness(cpu_profile(), |_| {});
    *h.stats.delay.lock() = Duration::from_millis(40);
    let rx = h.service.subscribe();
    h.service.start(start("stop", "fake://60")).unwrap();

    loop {
        let event = rx.recv_timeout(Duration::from_secs(10)).unwrap();
        if matches!(event, SessionEvent::FirstChunk { .. }) {
            break;
        }
    }
    assert!(h.service.cancel("stop").unwrap());

    let events = events_until_done(&rx, "stop");
    assert_eq!(
        events.last(),
        Some(&SessionEvent::Error {
            track_id: "stop".into(),
            error: "processing cancelled".into(),
        })
    );
    assert!(h.stats.call_count() < 7);
    assert!(matches!(
        h.service.result("stop").unwrap_err(),
        KaraokeError::NotFound(_)
    ));
}

#[test]
fn repeated_start_does_not_spawn_a_second_worker() {
    let h = harness(cpu_profile(), |_| {});
    *h.stats.delay.lock() = Duration::from_millis(5);
    h.service.start(start("dup", "fake://30")).unwrap();
    let again = h.service.start(start("dup", "fake://30")).unwrap();
    assert!(!again.is_cached);
    h.service.wait_for_result("dup").unwrap();
    assert_eq!(h.stats.call_count(), 4);
    assert_eq!(h.codec.decodes.load(Ordering::SeqCst), 1);
}

#[test]
fn unknown_tracks_are_not_found() {
    let h = harness(cpu_profile(), |_| {});
    assert_eq!(h.service.status("nope").status, WireStatus::NotFound);
    assert_eq!(h.service.result("nope").unwrap_err().code(), "KARAOKE-NOT-FOUND");
    assert_eq!(h.service.wait_for_result("nope").unwrap_err().code(), "KARAOKE-NOT-FOUND");
    assert_eq!(h.service.cancel("nope").unwrap_err().code(), "KARAOKE-NOT-FOUND");
}

#[test]
fn oversized_result_is_served_from_progressive_file() {
    let h = harness(cpu_profile(), |c| c.cache_capacity_bytes = 16);
    h.service.start(start("big", "fake://12")).unwrap();
    let body = h.service.wait_for_result("big").unwrap();
    assert!(body.is_final);
    assert_eq!(decode_raw(&body.bytes).len(), 12 * TEST_RATE as usize);
    assert_eq!(h.service.health().cache.entries, 0);
}

#[test]
fn one_shot_separation_is_cached_by_content() {
    let h = harness(cpu_profile(), |_| {});
    let input = encode_raw(&make_stereo_signal(4.0, TEST_RATE));
    let first = h.service.separate_bytes(input.clone(), None).unwrap();
    let calls = h.stats.call_count();
    let second = h.service.separate_bytes(input, None).unwrap();
    assert_eq!(first, second);
    assert_eq!(h.stats.call_count(), calls);

    let err = h.service.separate_bytes(Vec::new(), None).unwrap_err();
    assert_eq!(err.code(), "KARAOKE-INVALID-REQUEST");
}

#[test]
fn clear_cache_forgets_finished_tracks() {
    let h = harness(cpu_profile(), |_| {});
    h.service.start(start("gone", "fake://5")).unwrap();
    h.service.wait_for_result("gone").unwrap();
    let cleared = h.service.clear_cache().unwrap();
    assert_eq!(cleared.removed_entries, 1);
    assert_eq!(h.service.health().cache.entries, 0);
}

#[test]
fn concurrent_sessions_share_a_single_instance() {
    let h = harness(cpu_profile(), |c| c.model_instances = Some(1));
    *h.stats.delay.lock() = Duration::from_millis(5);
    let rx = h.service.subscribe();

    h.service.start(start("left", "fake://30")).unwrap();
    h.service.start(start("right", "fake://20")).unwrap();

    let mut progress: HashMap<String, Vec<u8>> = HashMap::new();
    let mut finished: HashMap<String, SessionEvent> = HashMap::new();
    while finished.len() < 2 {
        let event = rx
            .recv_timeout(Duration::from_secs(20))
            .expect("timed out waiting for session events");
        match &event {
            SessionEvent::Progress {
                track_id,
                progress: p,
                ..
            } => progress.entry(track_id.clone()).or_default().push(*p),
            SessionEvent::Complete { track_id, .. } | SessionEvent::Error { track_id, .. } => {
                finished.insert(track_id.clone(), event.clone());
            }
            _ => {}
        }
    }

    for (id, seconds) in [("left", 30), ("right", 20)] {
        assert!(
            matches!(finished[id], SessionEvent::Complete { .. }),
            "{id}: {:?}",
            finished[id]
        );
        assert!(progress[id].windows(2).all(|w| w[0] <= w[1]), "{id} went backwards");
        let audio = decode_raw(&h.service.wait_for_result(id).unwrap().bytes);
        assert_eq!(audio.len(), seconds * TEST_RATE as usize);
    }

    let health = h.service.health();
    assert_eq!(health.instances, 1);
    assert_eq!(health.idle_instances, 1);
    assert_eq!(health.active_sessions, 0);
}

#[test]
fn restart_right_after_failure_runs_a_fresh_session() {
    let h = harness(cpu_profile(), |_| {});
    let rx = h.service.subscribe();
    h.service.start(start("retry", "fake://fail")).unwrap();
    let events = events_until_done(&rx, "retry");
    assert!(matches!(events.last(), Some(SessionEvent::Error { .. })));

    // No gap between the error and the claim being free again.
    h.service.start(start("retry", "fake://5")).unwrap();
    let status = h.service.status("retry");
    assert_eq!(status.status, WireStatus::Processing);
    assert_eq!(status.error, None);

    let events = events_until_done(&rx, "retry");
    assert!(matches!(events.last(), Some(SessionEvent::Complete { .. })));
    let audio = decode_raw(&h.service.wait_for_result("retry").unwrap().bytes);
    assert_eq!(audio.len(), 5 * TEST_RATE as usize);
}

#[test]
fn expired_session_takes_its_progressive_file_along() {
    let h = harness(cpu_profile(), |c| {
        c.cache_capacity_bytes = 16;
        c.session_retention_secs = 0;
    });
    let rx = h.service.subscribe();
    h.service.start(start("gone", "fake://12")).unwrap();
    let events = events_until_done(&rx, "gone");
    assert!(matches!(events.last(), Some(SessionEvent::Complete { .. })));

    let serving = h.dir.path().join("serving");
    let progressive_files = || {
        std::fs::read_dir(&serving)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".progressive."))
            .count()
    };
    let deadline = Instant::now() + Duration::from_secs(10);
    while h.service.status("gone").status != WireStatus::NotFound || progressive_files() > 0 {
        assert!(Instant::now() < deadline, "expired session left its output behind");
        std::thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(h.service.result("gone").unwrap_err().code(), "KARAOKE-NOT-FOUND");
}

#[test]
fn start_rejects_ids_that_cannot_form_a_url() {
    let h = harness(cpu_profile(), |_| {});
    for id in ["a/b", "a?b", "a#b", ".."] {
        let err = h.service.start(start(id, "fake://5")).unwrap_err();
        assert_eq!(err.code(), "KARAOKE-INVALID-REQUEST", "{id}");
    }
    assert_eq!(h.stats.call_count(), 0);
}
