// Fake camera SDK whose cameras yield a fixed image. For testing, and for
// exercising the driver without hardware.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use image::GrayImage;

use crate::abstract_camera::PixelDepth;
use crate::camera_sdk::{BusManager, CameraDevice, CameraGuid, CameraInfo,
                        Format7ImageSettings, Format7Info, Format7Mode,
                        Format7PacketInfo, HwTriggerMode, HwTriggerModeInfo,
                        Image, PixelFormat, Property, PropertyInfo,
                        PropertyType, SdkError};

/// Register holding the byte order of 16-bit pixel data. Bit 0 set means
/// big-endian.
pub const IMAGE_DATA_FORMAT_REGISTER: u32 = 0x1048;

const RECOMMENDED_BYTES_PER_PACKET: u32 = 4096;
const MAX_BYTES_PER_PACKET: u32 = 9000;

/// Scripted result of the next `retrieve_buffer()` call. Once the script runs
/// out, every retrieval yields a frame.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum RetrievalOutcome {
    Frame,
    ConsistencyError,
    FatalError,
}

struct DeviceState {
    connected: bool,
    capturing: bool,

    format7_supported: bool,
    rejected_formats: Vec<PixelFormat>,
    format: Format7ImageSettings,

    trigger_supported: bool,
    trigger: HwTriggerMode,

    properties: HashMap<PropertyType, Property>,
    infos: HashMap<PropertyType, PropertyInfo>,
    registers: HashMap<u32, u32>,

    outcomes: VecDeque<RetrievalOutcome>,
    frame_interval: Duration,

    // Failure injection.
    fail_connect: bool,
    fail_register_io: bool,
    fail_start_capture: bool,
    fail_stop_capture: bool,
    fail_property_writes: bool,

    // Instrumentation.
    hardware_calls: usize,
    property_reads: HashMap<PropertyType, usize>,
    one_push_requests: HashMap<PropertyType, usize>,
}

pub struct ImageDevice {
    serial_number: u32,
    image: GrayImage,
    state: Mutex<DeviceState>,
}

fn default_controls() -> (HashMap<PropertyType, Property>,
                          HashMap<PropertyType, PropertyInfo>) {
    let mut properties = HashMap::new();
    let mut infos = HashMap::new();
    // (kind, min, max, value, one_push_supported) in native units: fps, ms, dB.
    for (kind, abs_min, abs_max, abs_value, one_push_supported) in [
        (PropertyType::FrameRate, 1.0, 120.0, 30.0, false),
        (PropertyType::Shutter, 0.01, 3000.0, 10.0, true),
        (PropertyType::Gain, 0.0, 24.0, 0.0, true),
    ] {
        infos.insert(kind, PropertyInfo{kind,
                                        present: true,
                                        auto_supported: true,
                                        manual_supported: true,
                                        on_off_supported: true,
                                        one_push_supported,
                                        abs_min,
                                        abs_max});
        properties.insert(kind, Property{kind,
                                         on_off: true,
                                         auto_manual_mode: false,
                                         one_push: false,
                                         abs_control: false,
                                         abs_value});
    }
    (properties, infos)
}

impl ImageDevice {
    /// The sensor's resolution is that of `image`.
    pub fn new(serial_number: u32, image: GrayImage) -> Self {
        let (properties, infos) = default_controls();
        let format = Format7ImageSettings{mode: Format7Mode::Mode0,
                                          offset_x: 0,
                                          offset_y: 0,
                                          width: image.width(),
                                          height: image.height(),
                                          pixel_format: PixelFormat::Mono8};
        ImageDevice{
            serial_number,
            image,
            state: Mutex::new(DeviceState{
                connected: false,
                capturing: false,
                format7_supported: true,
                rejected_formats: vec![],
                format,
                trigger_supported: true,
                trigger: HwTriggerMode::default(),
                properties,
                infos,
                // Cameras power up in big-endian 16-bit mode.
                registers: HashMap::from([(IMAGE_DATA_FORMAT_REGISTER, 0x8000_0001)]),
                outcomes: VecDeque::new(),
                frame_interval: Duration::from_micros(200),
                fail_connect: false,
                fail_register_io: false,
                fail_start_capture: false,
                fail_stop_capture: false,
                fail_property_writes: false,
                hardware_calls: 0,
                property_reads: HashMap::new(),
                one_push_requests: HashMap::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<DeviceState> {
        self.state.lock().unwrap()
    }

    // Every CameraDevice method goes through here, so it is counted.
    fn call(&self) -> MutexGuard<DeviceState> {
        let mut locked_state = self.lock();
        locked_state.hardware_calls += 1;
        locked_state
    }

    // Setup and failure injection.

    pub fn set_frame_interval(&self, frame_interval: Duration) {
        self.lock().frame_interval = frame_interval;
    }
    pub fn push_outcome(&self, outcome: RetrievalOutcome) {
        self.lock().outcomes.push_back(outcome);
    }
    pub fn set_format7_supported(&self, supported: bool) {
        self.lock().format7_supported = supported;
    }
    /// Settings with this pixel format will fail validation.
    pub fn reject_pixel_format(&self, pixel_format: PixelFormat) {
        self.lock().rejected_formats.push(pixel_format);
    }
    pub fn set_trigger_supported(&self, supported: bool) {
        self.lock().trigger_supported = supported;
    }
    pub fn set_auto_supported(&self, kind: PropertyType, supported: bool) {
        if let Some(info) = self.lock().infos.get_mut(&kind) {
            info.auto_supported = supported;
        }
    }
    pub fn set_property_range(&self, kind: PropertyType, abs_min: f32, abs_max: f32) {
        if let Some(info) = self.lock().infos.get_mut(&kind) {
            info.abs_min = abs_min;
            info.abs_max = abs_max;
        }
    }
    pub fn set_one_push_supported(&self, kind: PropertyType, supported: bool) {
        if let Some(info) = self.lock().infos.get_mut(&kind) {
            info.one_push_supported = supported;
        }
    }
    pub fn fail_connect(&self, fail: bool) {
        self.lock().fail_connect = fail;
    }
    pub fn fail_register_io(&self, fail: bool) {
        self.lock().fail_register_io = fail;
    }
    pub fn fail_start_capture(&self, fail: bool) {
        self.lock().fail_start_capture = fail;
    }
    pub fn fail_stop_capture(&self, fail: bool) {
        self.lock().fail_stop_capture = fail;
    }
    pub fn fail_property_writes(&self, fail: bool) {
        self.lock().fail_property_writes = fail;
    }

    // Inspection. None of these count as hardware calls.

    pub fn serial_number(&self) -> u32 { self.serial_number }
    pub fn is_connected(&self) -> bool { self.lock().connected }
    pub fn is_capturing(&self) -> bool { self.lock().capturing }
    pub fn format(&self) -> Format7ImageSettings { self.lock().format }
    pub fn hw_trigger(&self) -> HwTriggerMode { self.lock().trigger }
    pub fn hw_property(&self, kind: PropertyType) -> Property {
        self.lock().properties[&kind]
    }
    pub fn register(&self, address: u32) -> u32 {
        self.lock().registers.get(&address).copied().unwrap_or(0)
    }
    pub fn hardware_calls(&self) -> usize { self.lock().hardware_calls }
    pub fn property_reads(&self, kind: PropertyType) -> usize {
        self.lock().property_reads.get(&kind).copied().unwrap_or(0)
    }
    pub fn one_push_requests(&self, kind: PropertyType) -> usize {
        self.lock().one_push_requests.get(&kind).copied().unwrap_or(0)
    }

    fn connect(&self) -> Result<(), SdkError> {
        let mut locked_state = self.lock();
        if locked_state.fail_connect {
            return Err(SdkError::Failed("Link could not be established".to_string()));
        }
        locked_state.connected = true;
        Ok(())
    }

    // Crops the fixed image to the current format and encodes it.
    fn make_frame(&self, locked_state: &DeviceState) -> Image {
        let format = &locked_state.format;
        let big_endian = locked_state.registers
            .get(&IMAGE_DATA_FORMAT_REGISTER).copied().unwrap_or(0) & 0x1 != 0;
        let bytes_per_pixel = match format.pixel_format {
            PixelFormat::Mono8 => PixelDepth::Bpp8,
            PixelFormat::Mono16 => PixelDepth::Bpp16,
        }.bytes_per_pixel();
        let mut data = Vec::with_capacity(
            format.width as usize * format.height as usize * bytes_per_pixel);
        for y in format.offset_y..format.offset_y + format.height {
            for x in format.offset_x..format.offset_x + format.width {
                let p = self.image.get_pixel(x, y).0[0];
                match format.pixel_format {
                    PixelFormat::Mono8 => data.push(p),
                    PixelFormat::Mono16 => {
                        let v = (p as u16) << 8 | p as u16;
                        if big_endian {
                            data.extend_from_slice(&v.to_be_bytes());
                        } else {
                            data.extend_from_slice(&v.to_le_bytes());
                        }
                    },
                }
            }
        }
        Image{data, cols: format.width, rows: format.height,
              pixel_format: format.pixel_format}
    }
}

impl CameraDevice for ImageDevice {
    fn disconnect(&self) -> Result<(), SdkError> {
        let mut locked_state = self.call();
        locked_state.capturing = false;
        locked_state.connected = false;
        Ok(())
    }

    fn camera_info(&self) -> Result<CameraInfo, SdkError> {
        let _locked_state = self.call();
        Ok(CameraInfo{serial_number: self.serial_number,
                      vendor_name: "Point Grey Research".to_string(),
                      model_name: "ImageCamera".to_string(),
                      sensor_resolution: format!("{}x{}", self.image.width(),
                                                 self.image.height()),
                      firmware_version: "0.0.0".to_string()})
    }

    fn format7_info(&self, mode: Format7Mode)
                    -> Result<(Format7Info, bool), SdkError> {
        let locked_state = self.call();
        Ok((Format7Info{mode,
                        max_width: self.image.width(),
                        max_height: self.image.height()},
            locked_state.format7_supported))
    }

    fn validate_format7_settings(&self, settings: &Format7ImageSettings)
                                 -> Result<(bool, Format7PacketInfo), SdkError> {
        let locked_state = self.call();
        let valid = locked_state.format7_supported &&
            !locked_state.rejected_formats.contains(&settings.pixel_format) &&
            settings.offset_x + settings.width <= self.image.width() &&
            settings.offset_y + settings.height <= self.image.height();
        Ok((valid, Format7PacketInfo{
            recommended_bytes_per_packet: RECOMMENDED_BYTES_PER_PACKET,
            max_bytes_per_packet: MAX_BYTES_PER_PACKET}))
    }

    fn set_format7_configuration(&self, settings: &Format7ImageSettings,
                                 bytes_per_packet: u32) -> Result<(), SdkError> {
        let mut locked_state = self.call();
        if locked_state.capturing {
            return Err(SdkError::Failed(
                "Cannot change format while capturing".to_string()));
        }
        if bytes_per_packet == 0 || bytes_per_packet > MAX_BYTES_PER_PACKET {
            return Err(SdkError::Failed(
                format!("Invalid packet size {}", bytes_per_packet)));
        }
        locked_state.format = *settings;
        Ok(())
    }

    fn trigger_mode_info(&self) -> Result<HwTriggerModeInfo, SdkError> {
        let locked_state = self.call();
        Ok(HwTriggerModeInfo{present: locked_state.trigger_supported})
    }

    fn trigger_mode(&self) -> Result<HwTriggerMode, SdkError> {
        Ok(self.call().trigger)
    }

    fn set_trigger_mode(&self, mode: &HwTriggerMode) -> Result<(), SdkError> {
        let mut locked_state = self.call();
        if !locked_state.trigger_supported {
            return Err(SdkError::Failed("No trigger input".to_string()));
        }
        locked_state.trigger = *mode;
        Ok(())
    }

    fn property_info(&self, kind: PropertyType) -> Result<PropertyInfo, SdkError> {
        Ok(self.call().infos[&kind])
    }

    fn property(&self, kind: PropertyType) -> Result<Property, SdkError> {
        let mut locked_state = self.call();
        *locked_state.property_reads.entry(kind).or_insert(0) += 1;
        let info = locked_state.infos[&kind];
        let Some(property) = locked_state.properties.get_mut(&kind) else {
            return Err(SdkError::Failed(format!("No such property {:?}", kind)));
        };
        if property.auto_manual_mode {
            // The camera settles on the middle of the range.
            property.abs_value = (info.abs_min + info.abs_max) / 2.0;
        }
        Ok(*property)
    }

    fn set_property(&self, property: &Property) -> Result<(), SdkError> {
        let mut locked_state = self.call();
        if locked_state.fail_property_writes {
            return Err(SdkError::Failed("Register write timed out".to_string()));
        }
        let info = locked_state.infos[&property.kind];
        if property.auto_manual_mode && !info.auto_supported {
            return Err(SdkError::Failed(
                format!("{:?} has no auto mode", property.kind)));
        }
        if !property.auto_manual_mode &&
            (property.abs_value < info.abs_min || property.abs_value > info.abs_max)
        {
            return Err(SdkError::Failed(
                format!("{:?} value {} out of range", property.kind,
                        property.abs_value)));
        }
        if property.one_push {
            *locked_state.one_push_requests.entry(property.kind).or_insert(0) += 1;
        }
        // One-push is consumed by the camera.
        locked_state.properties.insert(property.kind,
                                       Property{one_push: false, ..*property});
        Ok(())
    }

    fn read_register(&self, address: u32) -> Result<u32, SdkError> {
        let locked_state = self.call();
        if locked_state.fail_register_io {
            return Err(SdkError::Failed(format!("Failed to read register {:#x}", address)));
        }
        Ok(locked_state.registers.get(&address).copied().unwrap_or(0))
    }

    fn write_register(&self, address: u32, value: u32) -> Result<(), SdkError> {
        let mut locked_state = self.call();
        if locked_state.fail_register_io {
            return Err(SdkError::Failed(format!("Failed to write register {:#x}", address)));
        }
        locked_state.registers.insert(address, value);
        Ok(())
    }

    fn start_capture(&self) -> Result<(), SdkError> {
        let mut locked_state = self.call();
        if locked_state.fail_start_capture {
            return Err(SdkError::Failed("Isochronous start failed".to_string()));
        }
        if locked_state.capturing {
            return Err(SdkError::Failed("Isochronous transfer already started".to_string()));
        }
        locked_state.capturing = true;
        Ok(())
    }

    fn stop_capture(&self) -> Result<(), SdkError> {
        let mut locked_state = self.call();
        if locked_state.fail_stop_capture {
            return Err(SdkError::Failed("Isochronous stop failed".to_string()));
        }
        locked_state.capturing = false;
        Ok(())
    }

    fn retrieve_buffer(&self) -> Result<Image, SdkError> {
        let frame_interval = self.call().frame_interval;
        // Exposure plus transfer; the device is not locked meanwhile.
        if !frame_interval.is_zero() {
            thread::sleep(frame_interval);
        }
        let mut locked_state = self.lock();
        if !locked_state.capturing {
            return Err(SdkError::Failed("Isochronous transfer not started".to_string()));
        }
        match locked_state.outcomes.pop_front().unwrap_or(RetrievalOutcome::Frame) {
            RetrievalOutcome::Frame => Ok(self.make_frame(&locked_state)),
            RetrievalOutcome::ConsistencyError => Err(SdkError::ImageConsistency(
                "Image consistency error: packets missing".to_string())),
            RetrievalOutcome::FatalError => Err(SdkError::Failed(
                "Bus reset during transfer".to_string())),
        }
    }
}

/// A bus with a fixed set of ImageDevices on it.
pub struct ImageBus {
    devices: Vec<Arc<ImageDevice>>,
}

impl ImageBus {
    pub fn new(devices: Vec<ImageDevice>) -> Self {
        ImageBus{devices: devices.into_iter().map(Arc::new).collect()}
    }

    /// Access to a device for setup and inspection, also after connecting.
    pub fn device(&self, index: usize) -> Option<Arc<ImageDevice>> {
        self.devices.get(index).cloned()
    }
}

impl BusManager for ImageBus {
    fn num_cameras(&self) -> Result<u32, SdkError> {
        Ok(self.devices.len() as u32)
    }

    fn camera_from_serial_number(&self, serial_number: u32)
                                 -> Result<CameraGuid, SdkError> {
        match self.devices.iter().position(|d| d.serial_number == serial_number) {
            Some(index) => Ok(CameraGuid(index as u64)),
            None => Err(SdkError::Failed(
                format!("No camera with serial number {}", serial_number))),
        }
    }

    fn serial_number_from_index(&self, index: u32) -> Result<u32, SdkError> {
        match self.devices.get(index as usize) {
            Some(device) => Ok(device.serial_number),
            None => Err(SdkError::Failed(format!("Invalid camera index {}", index))),
        }
    }

    fn connect(&self, guid: CameraGuid) -> Result<Arc<dyn CameraDevice>, SdkError> {
        let Some(device) = self.devices.get(guid.0 as usize) else {
            return Err(SdkError::Failed(format!("Invalid camera guid {:?}", guid)));
        };
        device.connect()?;
        Ok(device.clone())
    }
}

#[cfg(test)]
mod tests {
    use image::Luma;

    use super::*;

    fn gradient(width: u32, height: u32) -> GrayImage {
        GrayImage::from_fn(width, height, |x, y| Luma([(x + y * width) as u8]))
    }

    #[test]
    fn test_frame_follows_format() {
        let device = ImageDevice::new(1, gradient(4, 2));
        device.start_capture().unwrap();
        let image = device.retrieve_buffer().unwrap();
        assert_eq!((image.cols, image.rows), (4, 2));
        assert_eq!(image.data, vec![0, 1, 2, 3, 4, 5, 6, 7]);
    }

    #[test]
    fn test_mono16_byte_order() {
        let device = ImageDevice::new(1, gradient(2, 1));
        let mut settings = device.format();
        settings.pixel_format = PixelFormat::Mono16;
        device.set_format7_configuration(&settings, RECOMMENDED_BYTES_PER_PACKET)
            .unwrap();
        device.start_capture().unwrap();
        // Power-up default is big-endian.
        assert_eq!(device.retrieve_buffer().unwrap().data, vec![0, 0, 1, 1]);

        device.write_register(IMAGE_DATA_FORMAT_REGISTER, 0x8000_0000).unwrap();
        let image = device.retrieve_buffer().unwrap();
        assert_eq!(u16::from_le_bytes([image.data[2], image.data[3]]), 0x0101);
    }

    #[test]
    fn test_scripted_outcomes() {
        let device = ImageDevice::new(1, gradient(2, 2));
        device.set_frame_interval(Duration::ZERO);
        assert!(matches!(device.retrieve_buffer(), Err(SdkError::Failed(_))));
        device.start_capture().unwrap();
        device.push_outcome(RetrievalOutcome::ConsistencyError);
        device.push_outcome(RetrievalOutcome::FatalError);
        assert!(matches!(device.retrieve_buffer(), Err(SdkError::ImageConsistency(_))));
        assert!(matches!(device.retrieve_buffer(), Err(SdkError::Failed(_))));
        assert!(device.retrieve_buffer().is_ok());
    }

    #[test]
    fn test_format_change_refused_while_capturing() {
        let device = ImageDevice::new(1, gradient(2, 2));
        device.start_capture().unwrap();
        let settings = device.format();
        assert!(device.set_format7_configuration(&settings, 1024).is_err());
    }
}
