use std::sync::Arc;
use std::time::Duration;

use canonical_error::CanonicalError;
use chrono::Utc;
use log::{debug, error, info, warn};

use crate::abstract_camera::{AbstractCamera, BinFactor, FrameSink, Gain,
                             RegionOfInterest, Status, TriggerMode, VideoMode};
use crate::acquisition::{AcquisitionThread, SharedState};
use crate::camera_sdk::{BusManager, CameraDevice, CameraInfo,
                        Format7ImageSettings, Format7Info, Format7Mode,
                        PixelFormat, PropertyType};
use crate::control::Control;
use crate::error::CameraError;
use crate::select_camera::{CameraId, select_camera};

/// Selects the byte order of 16-bit pixel data. Bit 0 clear means the
/// little-endian layout that `Frame` promises.
const IMAGE_DATA_FORMAT_REGISTER: u32 = 0x1048;

pub struct PointGreyCamera {
    // The connection, shared with the acquisition thread.
    device: Arc<dyn CameraDevice>,

    // Unchanging camera info.
    info: CameraInfo,
    format7_info: Format7Info,

    // Currently applied image format.
    format: Format7ImageSettings,

    frame_rate: Control,
    exposure: Control,
    exposure_range: (Duration, Duration),
    gain: Control,

    sink: Arc<dyn FrameSink>,
    shared: Arc<SharedState>,
    acq_thread: AcquisitionThread,
}

impl PointGreyCamera {
    /// Connects to the camera identified by `camera_id`, configures it for
    /// full-sensor 8-bit acquisition and starts the (idle) acquisition thread.
    /// Frames will be delivered to `sink`.
    pub fn new(bus: &dyn BusManager, camera_id: &CameraId,
               sink: Arc<dyn FrameSink>) -> Result<Self, CameraError> {
        let device = select_camera(bus, camera_id)?;
        match Self::init(device.clone(), sink) {
            Ok(camera) => Ok(camera),
            Err(e) => {
                // No half-initialized camera; let go of the connection.
                if let Err(de) = device.disconnect() {
                    warn!("Error disconnecting camera: {}", de);
                }
                Err(e)
            }
        }
    }

    fn init(device: Arc<dyn CameraDevice>, sink: Arc<dyn FrameSink>)
            -> Result<Self, CameraError> {
        let info = match device.camera_info() {
            Ok(x) => x,
            Err(e) => return Err(CameraError::Hardware(
                format!("Failed to get camera info: {}", e)))
        };
        info!("Camera {} {} serial {}", info.vendor_name, info.model_name,
              info.serial_number);

        let (format7_info, format) = negotiate_format(device.as_ref())?;
        normalize_endianness(device.as_ref())?;

        // Frame rate control off means that the current frame rate will not
        // limit the range of valid exposure times; the frame rate is adjusted
        // to allow the requested exposure time.
        let mut frame_rate = Control::load(device.as_ref(), PropertyType::FrameRate)?;
        let property = frame_rate.cached().with_on_off(false)
            .with_auto(frame_rate.info().auto_supported);
        frame_rate.apply(device.as_ref(), property)?;

        // Exposure and gain in absolute units, auto if supported.
        let mut exposure = Control::load(device.as_ref(), PropertyType::Shutter)?;
        let property = exposure.cached().with_on_off(true).with_abs_control(true)
            .with_auto(exposure.info().auto_supported);
        exposure.apply(device.as_ref(), property)?;
        let exposure_range = (ms_to_duration(exposure.info().abs_min)?,
                              ms_to_duration(exposure.info().abs_max)?);

        let mut gain = Control::load(device.as_ref(), PropertyType::Gain)?;
        let property = gain.cached().with_on_off(true).with_abs_control(true)
            .with_auto(gain.info().auto_supported);
        gain.apply(device.as_ref(), property)?;

        let shared = Arc::new(SharedState::new(/*frame_count=*/1));
        let acq_thread = AcquisitionThread::spawn(
            shared.clone(), device.clone(), sink.clone())?;
        Ok(PointGreyCamera{device, info, format7_info, format,
                           frame_rate, exposure, exposure_range, gain,
                           sink, shared, acq_thread})
    }

    pub fn camera_info(&self) -> &CameraInfo { &self.info }

    pub fn prepare_acquisition(&mut self) {
        self.shared.reset_image_number();
    }

    /// Starts the camera's capture and hands the run to the acquisition
    /// thread. Does nothing if a run is already armed; a run that is still
    /// winding down is waited for.
    pub fn start_acquisition(&mut self) -> Result<(), CameraError> {
        if self.shared.is_armed() {
            warn!("Acquisition already running");
            return Ok(());
        }
        // The previous run may still be stopping the camera's capture.
        self.shared.wait_until_idle();
        self.shared.reset_image_number();
        self.begin_run()
    }

    // Start sequence without touching the frame counter.
    fn begin_run(&mut self) -> Result<(), CameraError> {
        info!("Start acquisition");
        self.sink.set_start_timestamp(Utc::now());
        if let Err(e) = self.device.start_capture() {
            return Err(CameraError::CaptureStart(e.to_string()));
        }
        // Only this thread arms, and the acquisition thread is idle.
        let armed = self.shared.arm();
        debug_assert!(armed);
        Ok(())
    }

    /// Ends the current run, if any, and returns once the acquisition thread
    /// has stopped the camera's capture.
    pub fn stop_acquisition(&mut self) -> Result<(), CameraError> {
        if !self.shared.stop() {
            return Ok(());
        }
        // The run was armed but never picked up; stopping capture is on us.
        info!("Stop acquisition");
        if let Err(e) = self.device.stop_capture() {
            return Err(CameraError::CaptureStop(e.to_string()));
        }
        self.shared.set_status(Status::Ready, false);
        Ok(())
    }

    pub fn status(&self) -> Status {
        self.shared.status()
    }

    pub fn set_frame_count(&mut self, frame_count: u32) {
        self.shared.set_frame_count(frame_count);
    }
    pub fn frame_count(&self) -> u32 {
        self.shared.frame_count()
    }
    pub fn acquired_frame_count(&self) -> u32 {
        self.shared.image_number()
    }

    pub fn detector_size(&self) -> (u32, u32) {
        (self.format7_info.max_width, self.format7_info.max_height)
    }

    pub fn get_trigger_mode(&self) -> Result<TriggerMode, CameraError> {
        match self.device.trigger_mode() {
            Ok(hw_mode) => Ok(if hw_mode.on_off { TriggerMode::ExternalSingle }
                              else { TriggerMode::Internal }),
            Err(e) => Err(CameraError::Hardware(
                format!("Unable to get trigger mode settings: {}", e)))
        }
    }

    /// Cameras without a trigger input silently keep internal triggering
    /// (an error is logged).
    pub fn set_trigger_mode(&mut self, mode: TriggerMode) -> Result<(), CameraError> {
        debug!("set_trigger_mode {:?}", mode);
        let trigger_info = match self.device.trigger_mode_info() {
            Ok(x) => x,
            Err(e) => return Err(CameraError::Hardware(
                format!("Unable to get trigger mode info from camera: {}", e)))
        };
        if !trigger_info.present {
            error!("Camera does not support external trigger");
            return Ok(());
        }
        let mut hw_mode = match self.device.trigger_mode() {
            Ok(x) => x,
            Err(e) => return Err(CameraError::Hardware(
                format!("Unable to get trigger mode settings: {}", e)))
        };
        match mode {
            TriggerMode::Internal => {
                hw_mode.on_off = false;
            },
            TriggerMode::ExternalSingle => {
                hw_mode.on_off = true;
                hw_mode.mode = 0;
                hw_mode.source = 0;
            },
            _ => {
                return Err(CameraError::UnsupportedMode(
                    format!("Trigger mode {:?} is not supported", mode)));
            },
        }
        match self.device.set_trigger_mode(&hw_mode) {
            Ok(()) => Ok(()),
            Err(e) => Err(CameraError::Hardware(
                format!("Unable to set trigger mode settings: {}", e)))
        }
    }

    pub fn get_exposure_duration(&mut self) -> Result<Duration, CameraError> {
        ms_to_duration(self.exposure.current(self.device.as_ref())?.abs_value)
    }
    pub fn set_exposure_duration(&mut self, exp_duration: Duration)
                                 -> Result<(), CameraError> {
        let ms = 1.0e3 * exp_duration.as_secs_f64();
        self.exposure.set_manual(self.device.as_ref(), ms as f32)
    }
    pub fn exposure_duration_range(&self) -> (Duration, Duration) {
        self.exposure_range
    }
    pub fn get_auto_exposure(&self) -> bool {
        self.exposure.is_auto()
    }
    pub fn set_auto_exposure(&mut self, auto: bool) -> Result<(), CameraError> {
        self.exposure.set_auto(self.device.as_ref(), auto)
    }

    pub fn get_gain(&mut self) -> Result<Gain, CameraError> {
        let abs_value = self.gain.current(self.device.as_ref())?.abs_value;
        let abs_max = self.gain.info().abs_max;
        if abs_max <= 0.0 {
            return Ok(Gain::new(0.0));
        }
        Ok(Gain::new((abs_value / abs_max).clamp(0.0, 1.0) as f64))
    }
    pub fn set_gain(&mut self, gain: Gain) -> Result<(), CameraError> {
        let abs_value = gain.value() as f32 * self.gain.info().abs_max;
        self.gain.set_manual(self.device.as_ref(), abs_value)
    }
    pub fn get_auto_gain(&self) -> bool {
        self.gain.is_auto()
    }
    pub fn set_auto_gain(&mut self, auto: bool) -> Result<(), CameraError> {
        self.gain.set_auto(self.device.as_ref(), auto)
    }

    /// Frames per second.
    pub fn get_frame_rate(&mut self) -> Result<f32, CameraError> {
        Ok(self.frame_rate.current(self.device.as_ref())?.abs_value)
    }
    /// Switches the frame rate control on, in manual mode.
    pub fn set_frame_rate(&mut self, fps: f32) -> Result<(), CameraError> {
        let property = self.frame_rate.cached().with_on_off(true).with_auto(false)
            .with_one_push(false).with_value(fps);
        self.frame_rate.apply(self.device.as_ref(), property)
    }
    pub fn get_auto_frame_rate(&self) -> bool {
        self.frame_rate.is_auto()
    }
    pub fn set_auto_frame_rate(&mut self, auto: bool) -> Result<(), CameraError> {
        self.frame_rate.set_auto(self.device.as_ref(), auto)
    }

    pub fn get_video_mode(&self) -> VideoMode {
        match self.format.pixel_format {
            PixelFormat::Mono8 => VideoMode::Y8,
            PixelFormat::Mono16 => VideoMode::Y16,
        }
    }

    /// Changes the pixel encoding, pausing a running acquisition around the
    /// change. On failure the previous format stays in effect.
    pub fn set_video_mode(&mut self, mode: VideoMode) -> Result<(), CameraError> {
        debug!("set_video_mode {:?}", mode);
        let pixel_format = match mode {
            VideoMode::Y8 => PixelFormat::Mono8,
            VideoMode::Y16 => PixelFormat::Mono16,
        };
        if pixel_format == self.format.pixel_format {
            return Ok(());  // No changes.
        }
        let settings = Format7ImageSettings{pixel_format, ..self.format};

        let pause_acq = self.shared.is_armed();
        // Also waits out a run that is already ending on its own.
        self.stop_acquisition()?;
        apply_format(self.device.as_ref(), &settings)?;
        self.format = settings;
        self.sink.max_image_size_changed(self.detector_size(), mode.pixel_depth());
        if pause_acq {
            self.begin_run()?;
        }
        Ok(())
    }
}

/// We arrange for the acquisition thread to finish before the connection to
/// the camera goes away.
impl Drop for PointGreyCamera {
    fn drop(&mut self) {
        self.acq_thread.shutdown();
        if let Err(e) = self.device.disconnect() {
            error!("Error disconnecting camera serial {}: {}",
                   self.info.serial_number, e);
        }
    }
}

// The camera's exposure control works in milliseconds.
fn ms_to_duration(ms: f32) -> Result<Duration, CameraError> {
    match Duration::try_from_secs_f64(1.0e-3 * ms.max(0.0) as f64) {
        Ok(x) => Ok(x),
        Err(e) => Err(CameraError::Hardware(
            format!("Exposure time {} ms out of range: {}", ms, e)))
    }
}

// Sets up extended-format mode 0 spanning the whole sensor, 8 bits per pixel.
fn negotiate_format(device: &dyn CameraDevice)
                    -> Result<(Format7Info, Format7ImageSettings), CameraError> {
    let (format7_info, supported) = match device.format7_info(Format7Mode::Mode0) {
        Ok(x) => x,
        Err(e) => return Err(CameraError::Hardware(
            format!("Failed to get Format7 info: {}", e)))
    };
    if !supported {
        return Err(CameraError::UnsupportedCapability(
            "Format7 is not supported".to_string()));
    }
    let settings = Format7ImageSettings{mode: format7_info.mode,
                                        offset_x: 0,
                                        offset_y: 0,
                                        width: format7_info.max_width,
                                        height: format7_info.max_height,
                                        pixel_format: PixelFormat::Mono8};
    apply_format(device, &settings)?;
    Ok((format7_info, settings))
}

// Settings are always validated before being applied, with the packet size the
// camera recommends for them.
fn apply_format(device: &dyn CameraDevice, settings: &Format7ImageSettings)
                -> Result<(), CameraError> {
    let (valid, packet_info) = match device.validate_format7_settings(settings) {
        Ok(x) => x,
        Err(e) => return Err(CameraError::Hardware(
            format!("Unable to validate image format settings: {}", e)))
    };
    if !valid {
        return Err(CameraError::InvalidFormat(
            format!("Unsupported image format settings {:?}", settings)));
    }
    match device.set_format7_configuration(settings,
                                           packet_info.recommended_bytes_per_packet) {
        Ok(()) => Ok(()),
        Err(e) => Err(CameraError::Hardware(
            format!("Unable to apply image format settings: {}", e)))
    }
}

// Makes 16-bit pixel data little-endian.
fn normalize_endianness(device: &dyn CameraDevice) -> Result<(), CameraError> {
    let value = match device.read_register(IMAGE_DATA_FORMAT_REGISTER) {
        Ok(x) => x,
        Err(e) => return Err(CameraError::RegisterIo(
            format!("Failed to read camera register: {}", e)))
    };
    match device.write_register(IMAGE_DATA_FORMAT_REGISTER, value & !0x1) {
        Ok(()) => Ok(()),
        Err(e) => Err(CameraError::RegisterIo(
            format!("Failed to write camera register: {}", e)))
    }
}

impl AbstractCamera for PointGreyCamera {
    fn vendor_and_model(&self) -> (String, String) {
        (self.info.vendor_name.clone(), self.info.model_name.clone())
    }

    fn dimensions(&self) -> (u32, u32) {
        self.detector_size()
    }

    fn prepare_acquisition(&mut self) -> Result<(), CanonicalError> {
        PointGreyCamera::prepare_acquisition(self);
        Ok(())
    }
    fn start_acquisition(&mut self) -> Result<(), CanonicalError> {
        Ok(PointGreyCamera::start_acquisition(self)?)
    }
    fn stop_acquisition(&mut self) -> Result<(), CanonicalError> {
        Ok(PointGreyCamera::stop_acquisition(self)?)
    }

    fn status(&self) -> Status {
        PointGreyCamera::status(self)
    }

    fn set_frame_count(&mut self, frame_count: u32) {
        PointGreyCamera::set_frame_count(self, frame_count)
    }
    fn get_frame_count(&self) -> u32 {
        self.frame_count()
    }
    fn acquired_frame_count(&self) -> u32 {
        PointGreyCamera::acquired_frame_count(self)
    }

    fn set_trigger_mode(&mut self, mode: TriggerMode) -> Result<(), CanonicalError> {
        Ok(PointGreyCamera::set_trigger_mode(self, mode)?)
    }
    fn get_trigger_mode(&self) -> Result<TriggerMode, CanonicalError> {
        Ok(PointGreyCamera::get_trigger_mode(self)?)
    }

    fn set_exposure_duration(&mut self, exp_duration: Duration)
                             -> Result<(), CanonicalError> {
        Ok(PointGreyCamera::set_exposure_duration(self, exp_duration)?)
    }
    fn get_exposure_duration(&mut self) -> Result<Duration, CanonicalError> {
        Ok(PointGreyCamera::get_exposure_duration(self)?)
    }
    fn exposure_duration_range(&self) -> (Duration, Duration) {
        PointGreyCamera::exposure_duration_range(self)
    }
    fn set_auto_exposure(&mut self, auto: bool) -> Result<(), CanonicalError> {
        Ok(PointGreyCamera::set_auto_exposure(self, auto)?)
    }
    fn get_auto_exposure(&self) -> bool {
        PointGreyCamera::get_auto_exposure(self)
    }

    // Latency is not managed.
    fn set_latency_time(&mut self, _latency: Duration) {}
    fn get_latency_time(&self) -> Duration { Duration::ZERO }

    fn set_gain(&mut self, gain: Gain) -> Result<(), CanonicalError> {
        Ok(PointGreyCamera::set_gain(self, gain)?)
    }
    fn get_gain(&mut self) -> Result<Gain, CanonicalError> {
        Ok(PointGreyCamera::get_gain(self)?)
    }
    fn set_auto_gain(&mut self, auto: bool) -> Result<(), CanonicalError> {
        Ok(PointGreyCamera::set_auto_gain(self, auto)?)
    }
    fn get_auto_gain(&self) -> bool {
        PointGreyCamera::get_auto_gain(self)
    }

    fn set_video_mode(&mut self, mode: VideoMode) -> Result<(), CanonicalError> {
        Ok(PointGreyCamera::set_video_mode(self, mode)?)
    }
    fn get_video_mode(&self) -> VideoMode {
        PointGreyCamera::get_video_mode(self)
    }

    // No hardware region of interest or binning; requests pass through.
    fn check_roi(&self, roi: RegionOfInterest) -> RegionOfInterest { roi }
    fn set_region_of_interest(&mut self, _roi: RegionOfInterest)
                              -> Result<(), CanonicalError> {
        Ok(())
    }
    fn get_region_of_interest(&self) -> RegionOfInterest {
        RegionOfInterest{capture_startpos: (0, 0),
                         capture_dimensions: self.detector_size()}
    }

    fn check_binning(&self, binning: BinFactor) -> BinFactor { binning }
    fn set_binning(&mut self, _binning: BinFactor) -> Result<(), CanonicalError> {
        Ok(())
    }
    fn get_binning(&self) -> BinFactor { BinFactor::X1 }
}
