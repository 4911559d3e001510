mod common;

use std::sync::Arc;
use std::time::Duration;

use aperture::capture::{
    DeviceSession, StreamRequest, StreamRole, VirtualCameraManager, VirtualSpec,
};
use aperture::sink::FrameSink;

use common::{in_circulation, wait_for, CollectingSink, SlowSink};

fn start(manager: &VirtualCameraManager, id: &str, index: usize, sink: Arc<dyn FrameSink>) -> DeviceSession {
    let mut session = DeviceSession::open(manager, id, index, sink).unwrap();
    session
        .configure(StreamRole::Viewfinder, &StreamRequest::default())
        .unwrap();
    session.start().unwrap();
    session
}

fn spec(id: &str, interval_ms: u64) -> VirtualSpec {
    VirtualSpec::new(id)
        .with_sizes(&[(64, 48)])
        .with_frame_interval(Duration::from_millis(interval_ms))
}

#[test]
fn two_cameras_stream_independently() {
    let manager = VirtualCameraManager::new(vec![spec("cam0", 2), spec("cam1", 3)]);
    let first = CollectingSink::new();
    let second = CollectingSink::new();

    let mut sessions = vec![
        start(&manager, "cam0", 0, first.clone()),
        start(&manager, "cam1", 1, second.clone()),
    ];

    assert!(wait_for(Duration::from_secs(5), || {
        assert!(sessions.iter().all(|s| in_circulation(s) == 4));
        first.len() >= 20 && second.len() >= 20
    }));

    for session in &mut sessions {
        session.stop();
    }

    for (index, sink) in [first, second].iter().enumerate() {
        let frames = sink.frames();
        assert!(frames.iter().all(|f| f.device == index));
        assert!(frames
            .windows(2)
            .all(|pair| pair[1].sequence == pair[0].sequence + 1));
    }
    for session in &sessions {
        let stats = session.stats();
        assert_eq!(stats.frames_dropped, 0);
        assert_eq!(stats.mappings_open, 0);
    }
}

#[test]
fn slow_sink_only_throttles_its_own_camera() {
    let manager = VirtualCameraManager::new(vec![spec("cam0", 1), spec("cam1", 1)]);
    let slow = SlowSink::new(Duration::from_millis(50));
    let fast = CollectingSink::new();

    let mut slow_session = start(&manager, "cam0", 0, slow.clone());
    let mut fast_session = start(&manager, "cam1", 1, fast.clone());

    assert!(wait_for(Duration::from_secs(5), || fast.len() >= 100));
    slow_session.stop();
    fast_session.stop();

    let slow_frames = slow_session.stats().frames_delivered;
    let fast_frames = fast_session.stats().frames_delivered;
    assert!(fast_frames > slow_frames * 3, "{} vs {}", fast_frames, slow_frames);
    assert_eq!(in_circulation(&slow_session), 0);
}
