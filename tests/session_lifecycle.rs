mod common;

use std::sync::Arc;

use aperture::capture::request::RequestState;
use aperture::capture::stream::FocusMode;
use aperture::capture::{
    DeviceSession, FrameControls, SessionState, StreamRequest, StreamRole, VirtualCameraManager,
    VirtualSpec,
};
use aperture::sink::NullSink;
use aperture::CaptureError;

use common::{configured_session, in_circulation, CollectingSink};

#[test]
fn completed_request_is_requeued_behind_the_others() {
    let sink = CollectingSink::new();
    let (camera, mut session) = configured_session(VirtualSpec::new("cam").manual(), sink.clone());
    session.start().unwrap();

    assert_eq!(session.pool_size(), Some(4));
    let requests = session.requests().unwrap().clone();
    assert_eq!(requests.in_flight_order(), vec![0, 1, 2, 3]);
    assert_eq!(camera.queued_len(), 4);

    assert!(camera.complete(1));
    assert_eq!(requests.in_flight_order(), vec![0, 2, 3, 1]);
    assert_eq!(requests.counts(), (4, 0));
    assert_eq!(camera.queued_len(), 4);

    let frames = sink.frames();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].sequence, 0);

    for _ in 0..8 {
        assert!(camera.complete_next().is_some());
        assert_eq!(in_circulation(&session), 4);
    }
    assert_eq!(requests.in_flight_order(), vec![0, 2, 3, 1]);
    assert_eq!(sink.len(), 9);

    session.stop();
    assert_eq!(session.state(), SessionState::Stopped);
    assert!(!camera.is_running());
}

#[test]
fn oversized_request_is_clamped_by_the_device() {
    let sink = CollectingSink::new();
    let manager = VirtualCameraManager::new(vec![VirtualSpec::new("cam")
        .with_sizes(&[(640, 480), (1280, 720)])
        .manual()]);
    let mut session = DeviceSession::open(&manager, "cam", 0, sink.clone()).unwrap();

    let validated = session
        .configure(StreamRole::Viewfinder, &StreamRequest::size(1920, 1080))
        .unwrap();
    assert_eq!(validated.size(), (1280, 720));
    assert_eq!(session.configuration().map(|c| c.size()), Some((1280, 720)));

    session.start().unwrap();
    let camera = manager.camera("cam").unwrap();
    camera.complete_next().unwrap();

    let frames = sink.frames();
    assert_eq!((frames[0].width, frames[0].height), (1280, 720));
}

#[test]
fn failed_allocation_never_starts_the_device() {
    let sink = CollectingSink::new();
    let (camera, mut session) = configured_session(
        VirtualSpec::new("cam").manual().failing_allocation(),
        sink.clone(),
    );

    let err = session.start().unwrap_err();
    assert!(matches!(err, CaptureError::AllocationFailed(_)));
    assert_eq!(err.stage(), "start");
    assert!(!camera.is_running());
    assert_eq!(camera.queued_len(), 0);
    assert!(session.requests().is_none());
    assert_eq!(session.state(), SessionState::Configured);
    assert_eq!(sink.len(), 0);

    session.stop();
    assert_eq!(session.state(), SessionState::Stopped);
}

#[test]
fn stop_is_idempotent_and_releases_the_camera() {
    let manager = VirtualCameraManager::new(vec![VirtualSpec::new("cam").manual()]);

    let mut idle = DeviceSession::open(&manager, "cam", 0, Arc::new(NullSink)).unwrap();
    idle.stop();
    assert_eq!(idle.state(), SessionState::Idle);
    drop(idle);

    let mut session = DeviceSession::open(&manager, "cam", 0, Arc::new(NullSink)).unwrap();
    session
        .configure(StreamRole::Viewfinder, &StreamRequest::default())
        .unwrap();
    session.start().unwrap();
    session.stop();
    session.stop();
    assert_eq!(session.state(), SessionState::Stopped);
    assert_eq!(session.buffers().map(|b| b.len()), None);

    let requests = session.requests().unwrap();
    assert!(requests.is_drained());
    assert!((0..4).all(|slot| requests.state(slot) == Some(RequestState::Retired)));

    assert!(DeviceSession::open(&manager, "cam", 1, Arc::new(NullSink)).is_ok());
}

#[test]
fn acquisition_errors_are_reported() {
    let manager = VirtualCameraManager::new(vec![VirtualSpec::new("cam").manual()]);
    let _held = DeviceSession::open(&manager, "cam", 0, Arc::new(NullSink)).unwrap();

    let busy = DeviceSession::open(&manager, "cam", 1, Arc::new(NullSink)).unwrap_err();
    assert!(matches!(busy, CaptureError::DeviceUnavailable(_)));
    assert_eq!(busy.stage(), "open");

    let missing = DeviceSession::open(&manager, "other", 1, Arc::new(NullSink)).unwrap_err();
    assert!(matches!(missing, CaptureError::NotFound(_)));
}

#[test]
fn operations_out_of_order_are_rejected() {
    let manager = VirtualCameraManager::new(vec![VirtualSpec::new("cam").manual()]);
    let mut session = DeviceSession::open(&manager, "cam", 0, Arc::new(NullSink)).unwrap();

    assert!(matches!(session.start(), Err(CaptureError::InvalidState(_))));

    session
        .configure(StreamRole::Viewfinder, &StreamRequest::default())
        .unwrap();
    session.start().unwrap();

    assert!(matches!(
        session.configure(StreamRole::Viewfinder, &StreamRequest::default()),
        Err(CaptureError::InvalidState(_))
    ));
    assert!(matches!(
        session.set_controls(FrameControls::default()),
        Err(CaptureError::InvalidState(_))
    ));
    assert!(matches!(session.start(), Err(CaptureError::InvalidState(_))));
}

#[test]
fn controls_ride_along_with_every_submission() {
    let (camera, mut session) =
        configured_session(VirtualSpec::new("cam").manual(), Arc::new(NullSink));
    let controls = FrameControls {
        focus_mode: Some(FocusMode::Continuous),
        frame_duration_limits: None,
    };
    session.set_controls(controls).unwrap();
    session.start().unwrap();

    assert_eq!(camera.last_controls(), Some(controls));
    camera.complete_next().unwrap();
    assert_eq!(camera.last_controls(), Some(controls));
    assert_eq!(session.controls(), controls);
}

#[test]
fn request_creation_failure_frees_buffers() {
    let sink = CollectingSink::new();
    let (camera, mut session) = configured_session(
        VirtualSpec::new("cam").manual().failing_request_creation(2),
        sink.clone(),
    );

    let err = session.start().unwrap_err();
    assert!(matches!(err, CaptureError::RequestCreationFailed { slot: 2, .. }));
    assert_eq!(err.stage(), "start");
    assert_eq!(session.state(), SessionState::Configured);
    assert!(session.buffers().is_none());
    assert!(session.requests().is_none());
    assert!(!camera.is_running());
    assert_eq!(camera.queued_len(), 0);
    assert_eq!(sink.len(), 0);
}

#[test]
fn device_start_failure_unwinds_setup() {
    let sink = CollectingSink::new();
    let (camera, mut session) = configured_session(
        VirtualSpec::new("cam").manual().failing_start(),
        sink.clone(),
    );

    assert!(session.start().is_err());
    assert_eq!(session.state(), SessionState::Configured);
    assert!(session.buffers().is_none());
    assert!(!camera.is_running());
    assert_eq!(camera.queued_len(), 0);
    assert_eq!(sink.len(), 0);

    session.stop();
    assert_eq!(session.state(), SessionState::Stopped);
}

#[test]
fn partial_initial_fill_tears_the_session_down() {
    let sink = CollectingSink::new();
    let (camera, mut session) = configured_session(
        VirtualSpec::new("cam").manual().failing_queue_after(2),
        sink.clone(),
    );

    let err = session.start().unwrap_err();
    assert!(matches!(err, CaptureError::QueueFailed { slot: 2, .. }));
    assert_eq!(session.state(), SessionState::Stopped);
    assert!(session.buffers().is_none());
    assert!(!camera.is_running());
    assert_eq!(camera.queued_len(), 0);
    assert_eq!(sink.len(), 0);

    let requests = session.requests().unwrap();
    assert!(requests.is_drained());
    assert!((0..4).all(|slot| requests.state(slot) == Some(RequestState::Retired)));
}

#[test]
fn refused_resubmission_retires_only_that_request() {
    let sink = CollectingSink::new();
    let (camera, mut session) = configured_session(
        VirtualSpec::new("cam").manual().failing_queue_after(4),
        sink.clone(),
    );
    session.start().unwrap();

    assert_eq!(camera.complete_next(), Some(0));
    assert_eq!(sink.len(), 1);
    assert_eq!(session.stats().requeue_failures, 1);
    assert_eq!(session.stats().requests_retired, 1);
    assert_eq!(session.requests().unwrap().state(0), Some(RequestState::Retired));
    assert_eq!(in_circulation(&session), 3);
    assert_eq!(camera.queued_len(), 3);

    while camera.complete_next().is_some() {}
    assert_eq!(sink.len(), 4);
    assert_eq!(session.stats().requeue_failures, 4);
    assert_eq!(in_circulation(&session), 0);
    assert_eq!(session.state(), SessionState::Running);

    session.stop();
    assert_eq!(session.state(), SessionState::Stopped);
}
