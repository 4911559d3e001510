//! Completion callback: map, hand off, unmap, recycle

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crossbeam::utils::CachePadded;
use metrics::{counter, Counter};
use tracing::{debug, error, trace, warn};

use crate::capture::buffer::BufferPool;
use crate::capture::device::{CameraDevice, Completion, RequestStatus};
use crate::capture::frame::{FrameMetadata, FrameView, MAX_PLANES};
use crate::capture::mmap::PlaneMapping;
use crate::capture::request::{RequestPool, RequestState};
use crate::capture::stream::{FrameControls, StreamConfiguration};
use crate::error::CaptureError;
use crate::sink::FrameSink;
use crate::Metrics;

/// Per-session counters, updated from the completion thread.
pub struct SessionStats {
    local: CachePadded<Counts>,
    exported: ExportedCounters,
}

#[derive(Default)]
struct Counts {
    frames_delivered: AtomicU64,
    frames_dropped: AtomicU64,
    map_failures: AtomicU64,
    sink_failures: AtomicU64,
    requests_retired: AtomicU64,
    requeue_failures: AtomicU64,
    sequence_gaps: AtomicU64,
    mappings_opened: AtomicU64,
    mappings_closed: AtomicU64,
    last_sequence: AtomicI64,
}

/// `metrics` handles registered once so the hot path never builds labels.
struct ExportedCounters {
    delivered: Counter,
    dropped: Counter,
    map_failures: Counter,
    sink_failures: Counter,
}

impl SessionStats {
    pub fn new(device_index: usize) -> Self {
        let device = device_index.to_string();
        let local = Counts {
            last_sequence: AtomicI64::new(-1),
            ..Counts::default()
        };
        Self {
            local: CachePadded::new(local),
            exported: ExportedCounters {
                delivered: counter!("aperture_frames_delivered", "device" => device.clone()),
                dropped: counter!("aperture_frames_dropped", "device" => device.clone()),
                map_failures: counter!("aperture_map_failures", "device" => device.clone()),
                sink_failures: counter!("aperture_sink_failures", "device" => device),
            },
        }
    }

    fn delivered(&self, sequence: u32) {
        self.local.frames_delivered.fetch_add(1, Ordering::Relaxed);
        self.exported.delivered.increment(1);

        let sequence = i64::from(sequence);
        let previous = self.local.last_sequence.swap(sequence, Ordering::Relaxed);
        if previous >= 0 && sequence != previous + 1 {
            self.local.sequence_gaps.fetch_add(1, Ordering::Relaxed);
            debug!("Sequence jumped from {} to {}", previous, sequence);
        }
    }

    fn dropped(&self) {
        self.local.frames_dropped.fetch_add(1, Ordering::Relaxed);
        self.exported.dropped.increment(1);
    }

    fn map_failed(&self) {
        self.local.map_failures.fetch_add(1, Ordering::Relaxed);
        self.exported.map_failures.increment(1);
    }

    fn sink_failed(&self) {
        self.local.sink_failures.fetch_add(1, Ordering::Relaxed);
        self.exported.sink_failures.increment(1);
    }

    pub fn snapshot(&self) -> Metrics {
        let c = &self.local;
        let opened = c.mappings_opened.load(Ordering::Relaxed);
        let closed = c.mappings_closed.load(Ordering::Relaxed);
        Metrics {
            frames_delivered: c.frames_delivered.load(Ordering::Relaxed),
            frames_dropped: c.frames_dropped.load(Ordering::Relaxed),
            map_failures: c.map_failures.load(Ordering::Relaxed),
            sink_failures: c.sink_failures.load(Ordering::Relaxed),
            requests_retired: c.requests_retired.load(Ordering::Relaxed),
            requeue_failures: c.requeue_failures.load(Ordering::Relaxed),
            sequence_gaps: c.sequence_gaps.load(Ordering::Relaxed),
            mappings_opened: opened,
            mappings_open: opened.saturating_sub(closed),
        }
    }
}

/// Run the sink, turning both an error return and a panic into
/// `SinkDeliveryFailed`.
fn deliver_guarded(sink: &dyn FrameSink, frame: &FrameView<'_>) -> Result<(), CaptureError> {
    match panic::catch_unwind(AssertUnwindSafe(|| sink.deliver(frame))) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(CaptureError::SinkDeliveryFailed(e.to_string())),
        Err(payload) => Err(CaptureError::SinkDeliveryFailed(format!(
            "sink panicked: {}",
            panic_message(payload.as_ref())
        ))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.as_str()
    } else {
        "unknown panic"
    }
}

/// Handles one device's completions.
///
/// Invoked on the device's completion thread, once per request. Frame bytes
/// are only ever touched through scoped [`PlaneMapping`]s, and every
/// non-cancelled request is resubmitted before the callback returns.
pub struct FrameHandler {
    device_index: usize,
    device: Weak<dyn CameraDevice>,
    buffers: Arc<BufferPool>,
    requests: Arc<RequestPool>,
    sink: Arc<dyn FrameSink>,
    config: StreamConfiguration,
    controls: FrameControls,
    stopping: AtomicBool,
    stats: Arc<SessionStats>,
}

impl FrameHandler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        device_index: usize,
        device: &Arc<dyn CameraDevice>,
        buffers: Arc<BufferPool>,
        requests: Arc<RequestPool>,
        sink: Arc<dyn FrameSink>,
        config: StreamConfiguration,
        controls: FrameControls,
        stats: Arc<SessionStats>,
    ) -> Self {
        Self {
            device_index,
            device: Arc::downgrade(device),
            buffers,
            requests,
            sink,
            config,
            controls,
            stopping: AtomicBool::new(false),
            stats,
        }
    }

    /// From here on completions are retired without touching buffer memory.
    pub fn begin_stop(&self) {
        self.stopping.store(true, Ordering::Release);
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    pub fn on_complete(&self, completion: Completion) {
        let slot = completion.slot;

        if completion.status == RequestStatus::Cancelled || self.is_stopping() {
            trace!(device = self.device_index, slot, "retiring request");
            self.retire(slot);
            return;
        }

        if let Err(e) = self.requests.complete(slot) {
            warn!(device = self.device_index, slot, "Ignoring completion: {}", e);
            return;
        }

        self.hand_off(slot, &completion.metadata);
        self.recycle(slot);
    }

    /// Map every plane, deliver to the sink, then unmap on all paths.
    fn hand_off(&self, slot: usize, metadata: &FrameMetadata) {
        let Some(buffer) = self.buffers.get(slot) else {
            warn!(device = self.device_index, slot, "Completion for unknown buffer");
            self.stats.dropped();
            return;
        };

        let planes = buffer.planes();
        let plane_count = planes.len().min(MAX_PLANES);
        let mut mappings: [Option<PlaneMapping<'_>>; MAX_PLANES] = Default::default();

        for (index, plane) in planes.iter().take(MAX_PLANES).enumerate() {
            match PlaneMapping::map(slot, index, plane) {
                Ok(mapping) => {
                    self.stats
                        .local
                        .mappings_opened
                        .fetch_add(1, Ordering::Relaxed);
                    mappings[index] = Some(mapping);
                }
                Err(e) => self.frame_error(metadata.sequence, e),
            }
        }

        if mappings.iter().any(Option::is_some) {
            let used = metadata.planes();
            let views: [Option<&[u8]>; MAX_PLANES] = std::array::from_fn(|i| {
                mappings[i].as_ref().map(|m| match used.get(i) {
                    Some(p) if p.bytes_used > 0 => m.used(p.bytes_used),
                    _ => m.data(),
                })
            });
            let frame = FrameView::new(
                self.device_index,
                self.config.format,
                self.config.width,
                self.config.height,
                *metadata,
                views,
                plane_count,
            );

            match deliver_guarded(self.sink.as_ref(), &frame) {
                Ok(()) => self.stats.delivered(metadata.sequence),
                Err(e) => self.frame_error(metadata.sequence, e),
            }
        } else {
            self.stats.dropped();
        }

        for mapping in mappings.iter_mut().filter_map(Option::take) {
            if let Err(e) = mapping.unmap() {
                warn!(device = self.device_index, slot, "Failed to unmap plane: {}", e);
            }
            self.stats
                .local
                .mappings_closed
                .fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Count and log a frame-level failure. The session keeps running.
    fn frame_error(&self, sequence: u32, e: CaptureError) {
        if e.is_per_frame() {
            warn!(device = self.device_index, seq = sequence, "{}", e);
        } else {
            error!(device = self.device_index, seq = sequence, "Unexpected frame error: {}", e);
        }

        match e {
            CaptureError::MapFailed { .. } => self.stats.map_failed(),
            CaptureError::SinkDeliveryFailed(_) => {
                self.stats.sink_failed();
                self.stats.dropped();
            }
            _ => self.stats.dropped(),
        }
    }

    fn recycle(&self, slot: usize) {
        if self.is_stopping() {
            self.retire(slot);
            return;
        }

        if let Err(e) = self.requests.reuse(slot) {
            warn!(device = self.device_index, slot, "Cannot recycle request: {}", e);
            return;
        }

        let Some(device) = self.device.upgrade() else {
            self.retire(slot);
            return;
        };

        if let Err(e) = device.queue(slot, &self.controls) {
            warn!(device = self.device_index, slot, "Failed to requeue request: {}", e);
            self.stats
                .local
                .requeue_failures
                .fetch_add(1, Ordering::Relaxed);
            self.retire(slot);
        }
    }

    fn retire(&self, slot: usize) {
        match self.requests.retire(slot) {
            Ok(RequestState::Retired) => {}
            Ok(previous) => {
                trace!(device = self.device_index, slot, ?previous, "request retired");
                self.stats
                    .local
                    .requests_retired
                    .fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => warn!(device = self.device_index, slot, "{}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::frame::PixelFormat;
    use crate::sink::{NullSink, SinkError};

    struct Rejecting;

    impl FrameSink for Rejecting {
        fn deliver(&self, _frame: &FrameView<'_>) -> Result<(), SinkError> {
            Err(SinkError::Rejected("queue full".into()))
        }
    }

    struct Exploding;

    impl FrameSink for Exploding {
        fn deliver(&self, frame: &FrameView<'_>) -> Result<(), SinkError> {
            panic!("bad frame {}", frame.sequence());
        }
    }

    fn frame(data: &[u8]) -> FrameView<'_> {
        FrameView::new(
            0,
            PixelFormat::Yuyv,
            2,
            1,
            FrameMetadata::new(42, None, &[data.len() as u32]),
            [Some(data), None, None, None],
            1,
        )
    }

    #[test]
    fn sink_error_becomes_per_frame_delivery_failure() {
        let data = [0u8; 4];
        let err = deliver_guarded(&Rejecting, &frame(&data)).unwrap_err();
        assert!(matches!(err, CaptureError::SinkDeliveryFailed(ref msg) if msg.contains("queue full")));
        assert!(err.is_per_frame());
        assert_eq!(err.stage(), "frame");
    }

    #[test]
    fn sink_panic_is_caught_with_its_message() {
        let data = [0u8; 4];
        let err = deliver_guarded(&Exploding, &frame(&data)).unwrap_err();
        assert!(matches!(err, CaptureError::SinkDeliveryFailed(ref msg) if msg.contains("bad frame 42")));
        assert!(err.is_per_frame());
    }

    #[test]
    fn healthy_sink_delivers() {
        let data = [0u8; 4];
        assert!(deliver_guarded(&NullSink, &frame(&data)).is_ok());
    }

    #[test]
    fn failures_are_counted_by_kind() {
        let stats = SessionStats::new(9);
        stats.map_failed();
        stats.sink_failed();
        stats.dropped();
        stats.delivered(0);
        stats.delivered(2);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.map_failures, 1);
        assert_eq!(snapshot.sink_failures, 1);
        assert_eq!(snapshot.frames_dropped, 1);
        assert_eq!(snapshot.frames_delivered, 2);
        assert_eq!(snapshot.sequence_gaps, 1);
    }
}
