use log::warn;

use crate::camera_sdk::{CameraDevice, Property, PropertyInfo, PropertyType};
use crate::error::CameraError;

/// Cached state of one camera control: the last value read from or written to
/// the hardware, plus the control's capabilities. The cached value is stale
/// whenever the control is in auto mode, since the camera adjusts it on its
/// own; see `current()`.
#[derive(Copy, Clone, Debug)]
pub struct Control {
    value: Property,
    info: PropertyInfo,
}

impl Control {
    /// Reads the control's capabilities and current value from the camera.
    pub fn load(device: &dyn CameraDevice, kind: PropertyType)
                -> Result<Control, CameraError> {
        let info = match device.property_info(kind) {
            Ok(x) => x,
            Err(e) => return Err(CameraError::Hardware(
                format!("Failed to get camera property info for {:?}: {}", kind, e)))
        };
        let value = read_property(device, kind)?;
        Ok(Control{value, info})
    }

    pub fn kind(&self) -> PropertyType { self.info.kind }
    pub fn info(&self) -> &PropertyInfo { &self.info }

    /// The cached value, without touching the hardware.
    pub fn cached(&self) -> &Property { &self.value }

    pub fn is_auto(&self) -> bool { self.value.auto_manual_mode }

    /// Returns the control's value, re-reading it from the camera first if the
    /// control is in auto mode.
    pub fn current(&mut self, device: &dyn CameraDevice)
                   -> Result<Property, CameraError> {
        if self.value.auto_manual_mode {
            // Value might have changed.
            self.value = read_property(device, self.kind())?;
        }
        Ok(self.value)
    }

    /// Writes `property` to the camera. The cache is only updated once the
    /// write succeeded.
    pub fn apply(&mut self, device: &dyn CameraDevice, property: Property)
                 -> Result<(), CameraError> {
        if let Err(e) = device.set_property(&property) {
            return Err(CameraError::Hardware(
                format!("Failed to set camera property {:?}: {}", property.kind, e)));
        }
        self.value = property;
        Ok(())
    }

    /// Forces manual mode and writes `abs_value` (in the control's native
    /// unit).
    pub fn set_manual(&mut self, device: &dyn CameraDevice, abs_value: f32)
                      -> Result<(), CameraError> {
        let property = self.value.with_auto(false).with_one_push(false)
            .with_value(abs_value);
        self.apply(device, property)
    }

    /// Switches auto mode on or off. Turning it on also requests a one-push
    /// adjustment when the control supports it. Controls without auto support
    /// are left alone.
    pub fn set_auto(&mut self, device: &dyn CameraDevice, auto: bool)
                    -> Result<(), CameraError> {
        if !self.info.auto_supported {
            warn!("Auto mode is not supported for {:?}", self.kind());
            return Ok(());
        }
        let one_push = auto && self.info.one_push_supported;
        let property = self.value.with_auto(auto).with_one_push(one_push);
        self.apply(device, property)?;
        // One-push is a single-shot request, not a setting.
        self.value.one_push = false;
        Ok(())
    }
}

fn read_property(device: &dyn CameraDevice, kind: PropertyType)
                 -> Result<Property, CameraError> {
    match device.property(kind) {
        Ok(x) => Ok(x),
        Err(e) => Err(CameraError::Hardware(
            format!("Failed to get camera property {:?}: {}", kind, e)))
    }
}

#[cfg(test)]
mod tests {
    use image::GrayImage;

    use super::*;
    use crate::image_sdk::ImageDevice;

    fn device() -> ImageDevice {
        ImageDevice::new(1234, GrayImage::new(64, 48))
    }

    #[test]
    fn test_manual_value_is_cached() {
        let device = device();
        let mut control = Control::load(&device, PropertyType::Shutter).unwrap();
        control.set_manual(&device, 12.5).unwrap();
        let reads = device.property_reads(PropertyType::Shutter);

        assert_eq!(control.current(&device).unwrap().abs_value, 12.5);
        assert_eq!(control.current(&device).unwrap().abs_value, 12.5);
        assert_eq!(device.property_reads(PropertyType::Shutter), reads);
        assert!(!control.is_auto());
    }

    #[test]
    fn test_auto_value_is_refreshed() {
        let device = device();
        let mut control = Control::load(&device, PropertyType::Gain).unwrap();
        control.set_auto(&device, true).unwrap();
        let reads = device.property_reads(PropertyType::Gain);

        control.current(&device).unwrap();
        control.current(&device).unwrap();
        assert_eq!(device.property_reads(PropertyType::Gain), reads + 2);
    }

    #[test]
    fn test_one_push_not_retained() {
        let device = device();
        let mut control = Control::load(&device, PropertyType::Gain).unwrap();
        control.set_auto(&device, true).unwrap();

        assert_eq!(device.one_push_requests(PropertyType::Gain), 1);
        assert!(control.is_auto());
        assert!(!control.cached().one_push);

        // Going back to manual is not a one-push request.
        control.set_auto(&device, false).unwrap();
        assert_eq!(device.one_push_requests(PropertyType::Gain), 1);
    }

    #[test]
    fn test_auto_without_one_push() {
        let device = device();
        device.set_one_push_supported(PropertyType::Shutter, false);
        let mut control = Control::load(&device, PropertyType::Shutter).unwrap();
        control.set_auto(&device, true).unwrap();

        assert!(control.is_auto());
        assert!(device.hw_property(PropertyType::Shutter).auto_manual_mode);
        assert_eq!(device.one_push_requests(PropertyType::Shutter), 0);
    }

    #[test]
    fn test_auto_unsupported_is_ignored() {
        let device = device();
        device.set_auto_supported(PropertyType::Shutter, false);
        let mut control = Control::load(&device, PropertyType::Shutter).unwrap();
        control.set_manual(&device, 5.0).unwrap();
        let calls = device.hardware_calls();

        control.set_auto(&device, true).unwrap();
        assert!(!control.is_auto());
        assert_eq!(device.hardware_calls(), calls);
    }

    #[test]
    fn test_failed_write_keeps_cache() {
        let device = device();
        let mut control = Control::load(&device, PropertyType::Shutter).unwrap();
        control.set_manual(&device, 5.0).unwrap();
        device.fail_property_writes(true);

        assert!(matches!(control.set_manual(&device, 7.0),
                         Err(CameraError::Hardware(_))));
        assert_eq!(control.cached().abs_value, 5.0);
    }
}
