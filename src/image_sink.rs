use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use canonical_error::{CanonicalError, failed_precondition_error};
use chrono::{DateTime, Utc};
use image::{GrayImage, ImageBuffer, Luma};
use log::{debug, warn};

use crate::abstract_camera::{Frame, FrameSink, PixelDepth, VideoMode};

pub type Gray16Image = ImageBuffer<Luma<u16>, Vec<u16>>;

/// A frame copied out of the driver.
#[derive(Clone, Debug)]
pub enum CapturedFrame {
    Gray8(GrayImage),
    Gray16(Gray16Image),
}

impl CapturedFrame {
    pub fn dimensions(&self) -> (u32, u32) {
        match self {
            CapturedFrame::Gray8(image) => image.dimensions(),
            CapturedFrame::Gray16(image) => image.dimensions(),
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), CanonicalError> {
        let result = match self {
            CapturedFrame::Gray8(image) => image.save(path),
            CapturedFrame::Gray16(image) => image.save(path),
        };
        match result {
            Ok(()) => Ok(()),
            Err(e) => Err(failed_precondition_error(&e.to_string())),
        }
    }
}

struct SinkState {
    start_timestamp: Option<DateTime<Utc>>,
    video_mode: VideoMode,
    max_size: Option<(u32, u32)>,
    size_changes: u32,

    // Most recent frames, oldest first.
    frames: VecDeque<CapturedFrame>,
    frames_received: u64,

    // Ask the driver to stop once this many frames were received.
    stop_after: Option<u64>,
}

/// FrameSink that converts incoming frames into `image` buffers and keeps the
/// most recent `capacity` of them.
pub struct ImageSink {
    capacity: usize,
    state: Mutex<SinkState>,
}

impl ImageSink {
    pub fn new(capacity: usize) -> Self {
        ImageSink{capacity,
                  state: Mutex::new(SinkState{start_timestamp: None,
                                              video_mode: VideoMode::Y8,
                                              max_size: None,
                                              size_changes: 0,
                                              frames: VecDeque::new(),
                                              frames_received: 0,
                                              stop_after: None})}
    }

    fn lock(&self) -> MutexGuard<SinkState> {
        self.state.lock().unwrap()
    }

    pub fn set_stop_after(&self, stop_after: Option<u64>) {
        self.lock().stop_after = stop_after;
    }

    pub fn start_timestamp(&self) -> Option<DateTime<Utc>> {
        self.lock().start_timestamp
    }
    pub fn frames_received(&self) -> u64 {
        self.lock().frames_received
    }
    pub fn size_changes(&self) -> u32 {
        self.lock().size_changes
    }
    pub fn max_size(&self) -> Option<(u32, u32)> {
        self.lock().max_size
    }
    pub fn latest_frame(&self) -> Option<CapturedFrame> {
        self.lock().frames.back().cloned()
    }
}

fn convert(frame: &Frame) -> Option<CapturedFrame> {
    let (width, height) = (frame.width, frame.height);
    let num_pixels = width as usize * height as usize;
    match frame.video_mode {
        VideoMode::Y8 => {
            if frame.data.len() < num_pixels {
                return None;
            }
            GrayImage::from_raw(width, height, frame.data[..num_pixels].to_vec())
                .map(CapturedFrame::Gray8)
        },
        VideoMode::Y16 => {
            if frame.data.len() < 2 * num_pixels {
                return None;
            }
            let pixels = frame.data[..2 * num_pixels].chunks_exact(2)
                .map(|b| u16::from_le_bytes([b[0], b[1]])).collect();
            Gray16Image::from_raw(width, height, pixels).map(CapturedFrame::Gray16)
        },
    }
}

impl FrameSink for ImageSink {
    fn set_start_timestamp(&self, start: DateTime<Utc>) {
        self.lock().start_timestamp = Some(start);
    }

    fn video_mode(&self) -> VideoMode {
        self.lock().video_mode
    }

    fn new_image(&self, frame: &Frame) -> bool {
        let captured = convert(frame);
        let mut locked_state = self.lock();
        locked_state.frames_received += 1;
        match captured {
            Some(captured) => {
                if self.capacity > 0 {
                    if locked_state.frames.len() == self.capacity {
                        locked_state.frames.pop_front();
                    }
                    locked_state.frames.push_back(captured);
                }
            },
            None => {
                warn!("Frame data too short for {}x{} {:?}",
                      frame.width, frame.height, frame.video_mode);
            },
        }
        match locked_state.stop_after {
            Some(n) => locked_state.frames_received < n,
            None => true,
        }
    }

    fn max_image_size_changed(&self, size: (u32, u32), depth: PixelDepth) {
        debug!("Max image size changed to {:?} {:?}", size, depth);
        let mut locked_state = self.lock();
        locked_state.max_size = Some(size);
        locked_state.video_mode = match depth {
            PixelDepth::Bpp8 => VideoMode::Y8,
            PixelDepth::Bpp16 => VideoMode::Y16,
        };
        locked_state.size_changes += 1;
        // Buffered frames no longer match.
        locked_state.frames.clear();
    }
}
