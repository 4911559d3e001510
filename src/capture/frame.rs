use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Upper bound on planes per buffer; covers packed, semi-planar and fully planar YUV.
pub const MAX_PLANES: usize = 4;

/// Pixel formats we support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    Rgb24,
    Bgr24,
    Yuyv,
    Mjpeg,
    Nv12,
    Yuv420,
}

impl PixelFormat {
    /// V4L2/DRM fourcc code
    pub fn fourcc(self) -> [u8; 4] {
        match self {
            PixelFormat::Rgb24 => *b"RGB3",
            PixelFormat::Bgr24 => *b"BGR3",
            PixelFormat::Yuyv => *b"YUYV",
            PixelFormat::Mjpeg => *b"MJPG",
            PixelFormat::Nv12 => *b"NV12",
            PixelFormat::Yuv420 => *b"YU12",
        }
    }

    pub fn from_fourcc(code: [u8; 4]) -> Option<Self> {
        match &code {
            b"RGB3" => Some(PixelFormat::Rgb24),
            b"BGR3" => Some(PixelFormat::Bgr24),
            b"YUYV" => Some(PixelFormat::Yuyv),
            b"MJPG" | b"JPEG" => Some(PixelFormat::Mjpeg),
            b"NV12" => Some(PixelFormat::Nv12),
            b"YU12" => Some(PixelFormat::Yuv420),
            _ => None,
        }
    }

    /// Number of memory planes a buffer of this format carries when the
    /// device exposes each colour component separately.
    pub fn plane_count(self) -> usize {
        match self {
            PixelFormat::Nv12 => 2,
            PixelFormat::Yuv420 => 3,
            _ => 1,
        }
    }

    /// Byte size of each plane for a frame of the given dimensions.
    /// Compressed formats report a worst-case size.
    pub fn plane_sizes(self, width: u32, height: u32) -> [usize; MAX_PLANES] {
        let (w, h) = (width as usize, height as usize);
        let mut sizes = [0; MAX_PLANES];
        match self {
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => sizes[0] = w * h * 3,
            PixelFormat::Yuyv | PixelFormat::Mjpeg => sizes[0] = w * h * 2,
            PixelFormat::Nv12 => {
                sizes[0] = w * h;
                sizes[1] = w * h / 2;
            }
            PixelFormat::Yuv420 => {
                sizes[0] = w * h;
                sizes[1] = w * h / 4;
                sizes[2] = w * h / 4;
            }
        }
        sizes
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = self.fourcc();
        write!(f, "{}", String::from_utf8_lossy(&code))
    }
}

/// Per-plane metadata reported by the device on completion
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlaneMetadata {
    pub bytes_used: u32,
}

/// Frame metadata
///
/// Fixed-size so completions can be passed around without allocating.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameMetadata {
    pub sequence: u32,
    pub timestamp: Option<Duration>, // Hardware timestamp if available
    planes: [PlaneMetadata; MAX_PLANES],
    plane_count: usize,
}

impl FrameMetadata {
    pub fn new(sequence: u32, timestamp: Option<Duration>, bytes_used: &[u32]) -> Self {
        let mut planes = [PlaneMetadata::default(); MAX_PLANES];
        let plane_count = bytes_used.len().min(MAX_PLANES);
        for (slot, used) in planes.iter_mut().zip(bytes_used) {
            slot.bytes_used = *used;
        }
        Self {
            sequence,
            timestamp,
            planes,
            plane_count,
        }
    }

    pub fn planes(&self) -> &[PlaneMetadata] {
        &self.planes[..self.plane_count]
    }

    pub fn total_bytes_used(&self) -> usize {
        self.planes().iter().map(|p| p.bytes_used as usize).sum()
    }
}

/// Borrowed view of one completed frame, handed to a sink.
///
/// The plane slices point straight into the mapped hardware buffers and are
/// only valid for the duration of the completion callback. A plane whose
/// mapping failed is `None`.
pub struct FrameView<'a> {
    pub device: usize,
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub metadata: FrameMetadata,
    planes: [Option<&'a [u8]>; MAX_PLANES],
    plane_count: usize,
}

impl<'a> FrameView<'a> {
    pub fn new(
        device: usize,
        format: PixelFormat,
        width: u32,
        height: u32,
        metadata: FrameMetadata,
        planes: [Option<&'a [u8]>; MAX_PLANES],
        plane_count: usize,
    ) -> Self {
        Self {
            device,
            format,
            width,
            height,
            metadata,
            planes,
            plane_count: plane_count.min(MAX_PLANES),
        }
    }

    pub fn sequence(&self) -> u32 {
        self.metadata.sequence
    }

    pub fn plane_count(&self) -> usize {
        self.plane_count
    }

    /// Mapped bytes of plane `index`, trimmed to the bytes the device wrote.
    pub fn plane(&self, index: usize) -> Option<&'a [u8]> {
        if index >= self.plane_count {
            return None;
        }
        self.planes[index]
    }

    pub fn planes(&self) -> impl Iterator<Item = Option<&'a [u8]>> + '_ {
        self.planes[..self.plane_count].iter().copied()
    }

    /// True when every plane was mapped.
    pub fn is_complete(&self) -> bool {
        self.planes().all(|p| p.is_some())
    }
}

impl fmt::Debug for FrameView<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameView")
            .field("device", &self.device)
            .field("format", &self.format)
            .field("size", &(self.width, self.height))
            .field("sequence", &self.metadata.sequence)
            .field("planes", &self.plane_count)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fourcc_round_trips_for_known_formats() {
        for format in [
            PixelFormat::Rgb24,
            PixelFormat::Yuyv,
            PixelFormat::Nv12,
            PixelFormat::Yuv420,
        ] {
            assert_eq!(PixelFormat::from_fourcc(format.fourcc()), Some(format));
        }
        assert_eq!(PixelFormat::from_fourcc(*b"XXXX"), None);
    }

    #[test]
    fn planar_formats_split_sizes() {
        let sizes = PixelFormat::Nv12.plane_sizes(1280, 720);
        assert_eq!(sizes[0], 1280 * 720);
        assert_eq!(sizes[1], 1280 * 720 / 2);
        assert_eq!(sizes[2], 0);
    }

    #[test]
    fn metadata_truncates_to_max_planes() {
        let meta = FrameMetadata::new(7, None, &[1, 2, 3, 4, 5]);
        assert_eq!(meta.planes().len(), MAX_PLANES);
        assert_eq!(meta.total_bytes_used(), 10);
    }

    #[test]
    fn view_hides_unmapped_and_out_of_range_planes() {
        let data = [1u8, 2, 3];
        let view = FrameView::new(
            0,
            PixelFormat::Nv12,
            2,
            2,
            FrameMetadata::new(1, None, &[3, 0]),
            [Some(&data[..]), None, None, None],
            2,
        );
        assert_eq!(view.plane(0), Some(&data[..]));
        assert_eq!(view.plane(1), None);
        assert_eq!(view.plane(2), None);
        assert!(!view.is_complete());
    }
}
