// Safe, plain-value view of the vendor machine-vision SDK. The driver only
// talks to the hardware through these two traits, so a simulated SDK (see
// image_sdk.rs) can stand in for the real one.

use std::sync::Arc;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SdkError {
    /// The frame arrived corrupted or incomplete. The device is still
    /// streaming; the next retrieval may well succeed.
    #[error("image consistency error: {0}")]
    ImageConsistency(String),

    #[error("{0}")]
    Failed(String),
}

/// Bus-level identifier of a camera, valid until the bus is re-enumerated.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct CameraGuid(pub u64);

#[derive(Clone, Debug, Default)]
pub struct CameraInfo {
    pub serial_number: u32,
    pub vendor_name: String,
    pub model_name: String,
    pub sensor_resolution: String,
    pub firmware_version: String,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PixelFormat {
    Mono8,
    Mono16,
}

/// Extended-format (custom image) modes. Only mode 0, full sensor without
/// binning, is used.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Format7Mode {
    Mode0,
}

#[derive(Copy, Clone, Debug)]
pub struct Format7Info {
    pub mode: Format7Mode,
    pub max_width: u32,
    pub max_height: u32,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Format7ImageSettings {
    pub mode: Format7Mode,
    pub offset_x: u32,
    pub offset_y: u32,
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
}

#[derive(Copy, Clone, Debug)]
pub struct Format7PacketInfo {
    pub recommended_bytes_per_packet: u32,
    pub max_bytes_per_packet: u32,
}

#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct HwTriggerMode {
    pub on_off: bool,
    pub mode: u32,
    pub source: u32,
}

#[derive(Copy, Clone, Debug, Default)]
pub struct HwTriggerModeInfo {
    pub present: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum PropertyType {
    FrameRate,
    Shutter,
    Gain,
}

/// Value of one camera control. This is a plain value: reading it from the
/// hardware yields a fresh copy and writing it takes a copy, so a control's
/// auto/one-push flags never leak from one call into another.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Property {
    pub kind: PropertyType,
    pub on_off: bool,
    pub auto_manual_mode: bool,
    pub one_push: bool,
    pub abs_control: bool,
    /// In the control's native unit: fps, milliseconds, or dB.
    pub abs_value: f32,
}

impl Property {
    pub fn with_value(self, abs_value: f32) -> Property {
        Property{abs_value, ..self}
    }
    pub fn with_on_off(self, on_off: bool) -> Property {
        Property{on_off, ..self}
    }
    pub fn with_auto(self, auto_manual_mode: bool) -> Property {
        Property{auto_manual_mode, ..self}
    }
    pub fn with_one_push(self, one_push: bool) -> Property {
        Property{one_push, ..self}
    }
    pub fn with_abs_control(self, abs_control: bool) -> Property {
        Property{abs_control, ..self}
    }
}

/// What a camera control is capable of.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct PropertyInfo {
    pub kind: PropertyType,
    pub present: bool,
    pub auto_supported: bool,
    pub manual_supported: bool,
    pub on_off_supported: bool,
    pub one_push_supported: bool,
    pub abs_min: f32,
    pub abs_max: f32,
}

/// A retrieved frame, owned by the caller of `retrieve_buffer()`.
#[derive(Clone, Debug)]
pub struct Image {
    pub data: Vec<u8>,
    pub cols: u32,
    pub rows: u32,
    pub pixel_format: PixelFormat,
}

/// Enumeration and connection.
pub trait BusManager {
    fn num_cameras(&self) -> Result<u32, SdkError>;
    fn camera_from_serial_number(&self, serial_number: u32)
                                 -> Result<CameraGuid, SdkError>;
    fn serial_number_from_index(&self, index: u32) -> Result<u32, SdkError>;

    /// Establishes the link to a camera. The returned device is shared between
    /// the caller's thread and the acquisition thread.
    fn connect(&self, guid: CameraGuid)
               -> Result<Arc<dyn CameraDevice>, SdkError>;
}

/// A connected camera. All methods take `&self`: the SDK serialises access
/// internally, and `retrieve_buffer()` blocks without holding up the others.
pub trait CameraDevice: Send + Sync {
    fn disconnect(&self) -> Result<(), SdkError>;
    fn camera_info(&self) -> Result<CameraInfo, SdkError>;

    /// Returns the mode's capabilities and whether the mode is supported at
    /// all.
    fn format7_info(&self, mode: Format7Mode)
                    -> Result<(Format7Info, bool), SdkError>;
    /// Returns whether the settings are acceptable, along with the packet
    /// sizing to use when applying them.
    fn validate_format7_settings(&self, settings: &Format7ImageSettings)
                                 -> Result<(bool, Format7PacketInfo), SdkError>;
    fn set_format7_configuration(&self, settings: &Format7ImageSettings,
                                 bytes_per_packet: u32) -> Result<(), SdkError>;

    fn trigger_mode_info(&self) -> Result<HwTriggerModeInfo, SdkError>;
    fn trigger_mode(&self) -> Result<HwTriggerMode, SdkError>;
    fn set_trigger_mode(&self, mode: &HwTriggerMode) -> Result<(), SdkError>;

    fn property_info(&self, kind: PropertyType) -> Result<PropertyInfo, SdkError>;
    fn property(&self, kind: PropertyType) -> Result<Property, SdkError>;
    fn set_property(&self, property: &Property) -> Result<(), SdkError>;

    fn read_register(&self, address: u32) -> Result<u32, SdkError>;
    fn write_register(&self, address: u32, value: u32) -> Result<(), SdkError>;

    fn start_capture(&self) -> Result<(), SdkError>;
    fn stop_capture(&self) -> Result<(), SdkError>;

    /// Blocks until the next frame is available.
    fn retrieve_buffer(&self) -> Result<Image, SdkError>;
}
