use std::sync::Arc;

use log::info;

use crate::camera_sdk::{BusManager, CameraDevice};
use crate::error::CameraError;

/// How the caller identifies the camera to connect to.
#[derive(Clone, Debug, PartialEq)]
pub enum CameraId {
    SerialNumber(u32),
    IpAddress(String),
}

/// Returns the serial numbers of all cameras present on the bus.
pub fn enumerate_cameras(bus: &dyn BusManager) -> Result<Vec<u32>, CameraError> {
    let num_cameras = match bus.num_cameras() {
        Ok(x) => x,
        Err(e) => return Err(CameraError::ConnectionError(
            format!("Failed to enumerate cameras: {}", e)))
    };
    let mut serial_numbers = Vec::with_capacity(num_cameras as usize);
    for index in 0..num_cameras {
        match bus.serial_number_from_index(index) {
            Ok(x) => serial_numbers.push(x),
            Err(e) => return Err(CameraError::ConnectionError(
                format!("Failed to get serial number of camera {}: {}", index, e)))
        }
    }
    Ok(serial_numbers)
}

// Locates the camera identified by `camera_id` among the cameras present on
// the bus and connects to it:
// * Fails with NotFound if the bus has no cameras at all, or none matching
//   `camera_id`.
// * Lookup by IP address is not supported.
// * Fails with ConnectionError if the camera is there but the link cannot be
//   established.
pub fn select_camera(bus: &dyn BusManager, camera_id: &CameraId)
                     -> Result<Arc<dyn CameraDevice>, CameraError> {
    let num_cameras = match bus.num_cameras() {
        Ok(x) => x,
        Err(e) => return Err(CameraError::ConnectionError(
            format!("Failed to enumerate cameras: {}", e)))
    };
    if num_cameras < 1 {
        return Err(CameraError::NotFound("No cameras found".to_string()));
    }
    let guid = match camera_id {
        CameraId::SerialNumber(serial_number) => {
            match bus.camera_from_serial_number(*serial_number) {
                Ok(x) => x,
                Err(e) => return Err(CameraError::NotFound(
                    format!("Camera with serial number {} not found: {}",
                            serial_number, e)))
            }
        },
        CameraId::IpAddress(address) => {
            return Err(CameraError::NotImplemented(
                format!("Camera lookup via IP address ({}) has not been implemented",
                        address)));
        },
    };
    match bus.connect(guid) {
        Ok(device) => {
            info!("Connected to camera {:?}", camera_id);
            Ok(device)
        },
        Err(e) => Err(CameraError::ConnectionError(
            format!("Failed to connect to camera: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use image::GrayImage;

    use super::*;
    use crate::image_sdk::{ImageBus, ImageDevice};

    fn bus() -> ImageBus {
        ImageBus::new(vec![ImageDevice::new(1111, GrayImage::new(16, 16)),
                           ImageDevice::new(2222, GrayImage::new(32, 16))])
    }

    #[test]
    fn test_enumerate() {
        assert_eq!(enumerate_cameras(&bus()).unwrap(), vec![1111, 2222]);
        assert!(enumerate_cameras(&ImageBus::new(vec![])).unwrap().is_empty());
    }

    #[test]
    fn test_select_by_serial_number() {
        let bus = bus();
        let device = select_camera(&bus, &CameraId::SerialNumber(2222)).unwrap();
        assert_eq!(device.camera_info().unwrap().serial_number, 2222);
        assert!(bus.device(1).unwrap().is_connected());
        assert!(!bus.device(0).unwrap().is_connected());
    }

    #[test]
    fn test_empty_bus() {
        let bus = ImageBus::new(vec![]);
        assert!(matches!(select_camera(&bus, &CameraId::SerialNumber(1111)),
                         Err(CameraError::NotFound(_))));
    }

    #[test]
    fn test_unknown_serial_number() {
        assert!(matches!(select_camera(&bus(), &CameraId::SerialNumber(3333)),
                         Err(CameraError::NotFound(_))));
    }

    #[test]
    fn test_ip_address_lookup() {
        let id = CameraId::IpAddress("10.0.0.12".to_string());
        assert!(matches!(select_camera(&bus(), &id),
                         Err(CameraError::NotImplemented(_))));
    }

    #[test]
    fn test_connect_failure() {
        let bus = bus();
        bus.device(0).unwrap().fail_connect(true);
        assert!(matches!(select_camera(&bus, &CameraId::SerialNumber(1111)),
                         Err(CameraError::ConnectionError(_))));
    }
}
