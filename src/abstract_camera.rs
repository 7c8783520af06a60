use std::fmt;
use std::time::Duration;

use canonical_error::CanonicalError;
use chrono::{DateTime, Utc};

/// Abstract camera gain values range from 0.0 to 1.0, inclusive, as a fraction
/// of the camera's maximum gain. Each camera type scales this value to its
/// native gain units.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Gain(f64);

impl fmt::Display for Gain {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)  // Just re-use Debug.
    }
}

impl Gain {
    pub fn new(gain: f64) -> Gain {
        assert!(gain >= 0.0);
        assert!(gain <= 1.0);
        Gain(gain)
    }

    pub fn value(&self) -> f64 {
        self.0
    }
}

/// Acquisition status as seen by the framework.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Status {
    Ready,
    Exposure,
    Readout,
    Fault,
}

/// Trigger modes understood by the framework. A given camera only maps a
/// subset of these; the rest are rejected.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TriggerMode {
    Internal,
    InternalMulti,
    ExternalSingle,
    ExternalMulti,
    ExternalGate,
    ExternalStartStop,
}

/// Pixel encodings a camera can deliver.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum VideoMode {
    Y8,   // 8-bit monochrome.
    Y16,  // 16-bit monochrome.
}

impl VideoMode {
    pub fn pixel_depth(&self) -> PixelDepth {
        match self {
            VideoMode::Y8 => PixelDepth::Bpp8,
            VideoMode::Y16 => PixelDepth::Bpp16,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PixelDepth {
    Bpp8,
    Bpp16,
}

impl PixelDepth {
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            PixelDepth::Bpp8 => 1,
            PixelDepth::Bpp16 => 2,
        }
    }
}

/// Binning requested by the framework. Cameras that have no hardware binning
/// accept the request and leave the image unbinned.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum BinFactor {
    X1,  // Unbinned.
    X2,  // Each output pixel is the combined value of 2x2 input pixels.
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct RegionOfInterest {
    /// (x, y) from top left.
    pub capture_startpos: (u32, u32),

    /// (width, height).
    pub capture_dimensions: (u32, u32),
}

/// A frame as handed to a `FrameSink`. The pixel data is borrowed from the
/// driver's retrieval buffer and is only valid for the duration of the
/// `FrameSink::new_image()` call; sinks copy what they want to keep.
pub struct Frame<'a> {
    /// Pixel data in row major order. For `VideoMode::Y16` each pixel is two
    /// little-endian bytes.
    pub data: &'a [u8],
    pub width: u32,
    pub height: u32,
    pub video_mode: VideoMode,
}

/// The downstream consumer of acquired frames (buffering, dispatch to the
/// imaging framework). A driver calls these methods from its acquisition
/// thread as well as from the caller's thread, hence `Send + Sync`.
pub trait FrameSink: Send + Sync {
    /// Records when an acquisition run was started.
    fn set_start_timestamp(&self, start: DateTime<Utc>);

    /// The pixel encoding frames are currently being delivered in.
    fn video_mode(&self) -> VideoMode;

    /// Accepts a newly acquired frame. Returns false if acquisition should
    /// stop after this frame.
    fn new_image(&self, frame: &Frame) -> bool;

    /// Tells the sink that the maximum image size or pixel depth changed, so
    /// that it can re-allocate its buffers.
    fn max_image_size_changed(&self, size: (u32, u32), depth: PixelDepth);
}

/// AbstractCamera is the generic acquisition-device contract consumed by the
/// imaging framework. Frames are not returned by this trait; once started, the
/// camera pushes them into the `FrameSink` it was constructed with.
pub trait AbstractCamera {
    // Unchanging attributes.

    /// Returns (vendor, model), e.g. ("Point Grey Research", "Grasshopper3").
    fn vendor_and_model(&self) -> (String, String);

    /// Returns the (width, height) of this camera's sensor.
    fn dimensions(&self) -> (u32, u32);

    // Acquisition control.

    /// Resets the acquired frame count ahead of a new acquisition.
    fn prepare_acquisition(&mut self) -> Result<(), CanonicalError>;
    fn start_acquisition(&mut self) -> Result<(), CanonicalError>;

    /// Blocks until the acquisition thread has finished its run.
    fn stop_acquisition(&mut self) -> Result<(), CanonicalError>;

    fn status(&self) -> Status;

    /// Number of frames to acquire per run. Zero means acquire until
    /// stop_acquisition() is called.
    fn set_frame_count(&mut self, frame_count: u32);
    fn get_frame_count(&self) -> u32;

    /// Number of frames dispatched to the sink in the current run.
    fn acquired_frame_count(&self) -> u32;

    // Changeable parameters that influence subsequent frames.

    fn set_trigger_mode(&mut self, mode: TriggerMode) -> Result<(), CanonicalError>;
    fn get_trigger_mode(&self) -> Result<TriggerMode, CanonicalError>;

    fn set_exposure_duration(&mut self, exp_duration: Duration)
                             -> Result<(), CanonicalError>;
    /// Returns the current exposure duration. If the camera is in auto
    /// exposure mode the value is re-read from the hardware.
    fn get_exposure_duration(&mut self) -> Result<Duration, CanonicalError>;
    /// (min, max) exposure duration supported by the camera.
    fn exposure_duration_range(&self) -> (Duration, Duration);
    fn set_auto_exposure(&mut self, auto: bool) -> Result<(), CanonicalError>;
    fn get_auto_exposure(&self) -> bool;

    /// Latency is the dead time between frames. Cameras that do not manage it
    /// report zero.
    fn set_latency_time(&mut self, latency: Duration);
    fn get_latency_time(&self) -> Duration;

    fn set_gain(&mut self, gain: Gain) -> Result<(), CanonicalError>;
    fn get_gain(&mut self) -> Result<Gain, CanonicalError>;
    fn set_auto_gain(&mut self, auto: bool) -> Result<(), CanonicalError>;
    fn get_auto_gain(&self) -> bool;

    fn set_video_mode(&mut self, mode: VideoMode) -> Result<(), CanonicalError>;
    fn get_video_mode(&self) -> VideoMode;

    // Region of interest and binning. Cameras without hardware support pass
    // requests through unchanged.

    fn check_roi(&self, roi: RegionOfInterest) -> RegionOfInterest;
    fn set_region_of_interest(&mut self, roi: RegionOfInterest)
                              -> Result<(), CanonicalError>;
    fn get_region_of_interest(&self) -> RegionOfInterest;

    fn check_binning(&self, binning: BinFactor) -> BinFactor;
    fn set_binning(&mut self, binning: BinFactor) -> Result<(), CanonicalError>;
    fn get_binning(&self) -> BinFactor;
}
