use std::path::Path;

use tracing::{debug, info};
use v4l::{capability::Flags, video::Capture, Device};

use crate::capture::frame::PixelFormat;

/// Video nodes probed when enumerating cameras
const MAX_VIDEO_NODES: usize = 64;

/// Paths of every `/dev/video*` node that supports streaming capture.
pub fn list_capture_devices() -> Vec<String> {
    let mut found = Vec::new();

    for i in 0..MAX_VIDEO_NODES {
        let path = format!("/dev/video{}", i);
        if !Path::new(&path).exists() {
            continue;
        }

        let Ok(dev) = Device::with_path(&path) else {
            continue;
        };
        let Ok(caps) = dev.query_caps() else {
            continue;
        };
        if caps
            .capabilities
            .contains(Flags::VIDEO_CAPTURE | Flags::STREAMING)
        {
            debug!("Found capture node {} - {}", path, caps.card);
            found.push(path);
        }
    }

    found
}

/// First capture device offering a format we can hand to sinks.
pub fn auto_detect_device() -> Option<String> {
    info!("Auto-detecting capture devices...");

    for path in list_capture_devices() {
        let Ok(dev) = Device::with_path(&path) else {
            continue;
        };
        let Ok(formats) = dev.enum_formats() else {
            continue;
        };
        if let Some(format) = formats
            .iter()
            .find_map(|f| PixelFormat::from_fourcc(f.fourcc.repr))
        {
            info!("Found {} device: {}", format, path);
            return Some(path);
        }
    }

    None
}
