//! Frame sinks
//!
//! A sink receives each completed frame synchronously on the device's
//! completion thread. Its processing time is the pipeline's backpressure:
//! a slow sink lowers that device's frame rate. Sinks must not keep the
//! frame view (or any slice of it) past `deliver`.

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;
use tracing::info;

use crate::capture::FrameView;
use crate::{SinkConfig, SinkKind};

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("{0}")]
    Rejected(String),
}

pub trait FrameSink: Send + Sync {
    fn deliver(&self, frame: &FrameView<'_>) -> Result<(), SinkError>;
}

/// Build the sink configured for device `device_index`.
pub fn from_config(config: &SinkConfig, device_index: usize) -> io::Result<Arc<dyn FrameSink>> {
    Ok(match config.kind {
        SinkKind::Null => Arc::new(NullSink),
        SinkKind::Log => Arc::new(LogSink::new(config.log_every)),
        SinkKind::Raw => Arc::new(RawFileSink::create(&config.output_dir, device_index)?),
    })
}

/// Discards every frame
#[derive(Debug, Default)]
pub struct NullSink;

impl FrameSink for NullSink {
    fn deliver(&self, _frame: &FrameView<'_>) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Logs frame metadata and the leading bytes of each plane.
#[derive(Debug)]
pub struct LogSink {
    every: u64,
    seen: AtomicU64,
}

impl LogSink {
    /// Log one frame out of every `every` (at least 1).
    pub fn new(every: u64) -> Self {
        Self {
            every: every.max(1),
            seen: AtomicU64::new(0),
        }
    }
}

impl FrameSink for LogSink {
    fn deliver(&self, frame: &FrameView<'_>) -> Result<(), SinkError> {
        let n = self.seen.fetch_add(1, Ordering::Relaxed);
        if n % self.every != 0 {
            return Ok(());
        }

        let used: Vec<String> = frame
            .metadata
            .planes()
            .iter()
            .map(|p| p.bytes_used.to_string())
            .collect();
        let head = frame
            .plane(0)
            .map(|data| &data[..data.len().min(8)])
            .unwrap_or(&[]);

        info!(
            device = frame.device,
            seq = frame.sequence(),
            "frame {:06} bytesused: {} ({} total) head: {:02x?}",
            frame.sequence(),
            used.join("/"),
            frame.metadata.total_bytes_used(),
            head
        );
        Ok(())
    }
}

/// Appends raw plane data to `<dir>/camera<index>.raw`.
pub struct RawFileSink {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl RawFileSink {
    pub fn create(dir: &Path, device_index: usize) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(format!("camera{}.raw", device_index));
        let file = File::create(&path)?;
        info!("Recording camera {} to {}", device_index, path.display());
        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn flush(&self) -> io::Result<()> {
        self.writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .flush()
    }
}

impl FrameSink for RawFileSink {
    fn deliver(&self, frame: &FrameView<'_>) -> Result<(), SinkError> {
        if !frame.is_complete() {
            return Err(SinkError::Rejected(format!(
                "frame {} is missing planes",
                frame.sequence()
            )));
        }

        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        for data in frame.planes().flatten() {
            writer.write_all(data)?;
        }
        Ok(())
    }
}

impl Drop for RawFileSink {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::frame::{FrameMetadata, PixelFormat};

    fn view<'a>(data: &'a [u8], second: Option<&'a [u8]>) -> FrameView<'a> {
        FrameView::new(
            1,
            PixelFormat::Nv12,
            4,
            2,
            FrameMetadata::new(3, None, &[data.len() as u32, 4]),
            [Some(data), second, None, None],
            2,
        )
    }

    #[test]
    fn raw_sink_writes_planes_in_order() {
        let dir = std::env::temp_dir().join(format!("aperture-sink-{}", std::process::id()));
        let sink = RawFileSink::create(&dir, 1).unwrap();
        assert!(sink.path().ends_with("camera1.raw"));

        let luma = [1u8; 8];
        let chroma = [2u8; 4];
        sink.deliver(&view(&luma, Some(&chroma))).unwrap();
        sink.flush().unwrap();

        let written = fs::read(sink.path()).unwrap();
        assert_eq!(&written[..8], &luma);
        assert_eq!(&written[8..], &chroma);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn raw_sink_rejects_partial_frames() {
        let dir = std::env::temp_dir().join(format!("aperture-partial-{}", std::process::id()));
        let sink = RawFileSink::create(&dir, 0).unwrap();
        let luma = [1u8; 8];
        assert!(matches!(
            sink.deliver(&view(&luma, None)),
            Err(SinkError::Rejected(_))
        ));
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn configured_raw_sink_creates_its_file() {
        let dir = std::env::temp_dir().join(format!("aperture-config-{}", std::process::id()));
        let config = SinkConfig {
            kind: SinkKind::Raw,
            output_dir: dir.clone(),
            log_every: 1,
        };
        let sink = from_config(&config, 3).unwrap();
        drop(sink);
        assert!(dir.join("camera3.raw").exists());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn log_sink_accepts_frames() {
        let sink = LogSink::new(2);
        let luma = [9u8; 8];
        let chroma = [2u8; 4];
        for _ in 0..3 {
            sink.deliver(&view(&luma, Some(&chroma))).unwrap();
        }
        assert_eq!(sink.seen.load(Ordering::Relaxed), 3);
    }
}
