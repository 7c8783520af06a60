use canonical_error::{CanonicalError, failed_precondition_error, internal_error,
                      invalid_argument_error, not_found_error,
                      unavailable_error, unimplemented_error};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CameraError {
    #[error("camera not found: {0}")]
    NotFound(String),

    #[error("camera connection failed: {0}")]
    ConnectionError(String),

    #[error("not implemented: {0}")]
    NotImplemented(String),

    #[error("capability not supported: {0}")]
    UnsupportedCapability(String),

    #[error("mode not supported: {0}")]
    UnsupportedMode(String),

    #[error("format not supported: {0}")]
    UnsupportedFormat(String),

    #[error("invalid image format settings: {0}")]
    InvalidFormat(String),

    #[error("register I/O failed: {0}")]
    RegisterIo(String),

    #[error("unable to start image capture: {0}")]
    CaptureStart(String),

    #[error("unable to stop image capture: {0}")]
    CaptureStop(String),

    #[error("frame consistency error: {0}")]
    FrameConsistency(String),

    #[error("frame retrieval failed: {0}")]
    Retrieval(String),

    #[error("hardware error: {0}")]
    Hardware(String),
}

impl From<CameraError> for CanonicalError {
    fn from(e: CameraError) -> CanonicalError {
        let msg = e.to_string();
        match e {
            CameraError::NotFound(_) => not_found_error(&msg),
            CameraError::ConnectionError(_) => unavailable_error(&msg),
            CameraError::NotImplemented(_) |
            CameraError::UnsupportedCapability(_) |
            CameraError::UnsupportedMode(_) |
            CameraError::UnsupportedFormat(_) => unimplemented_error(&msg),
            CameraError::InvalidFormat(_) => invalid_argument_error(&msg),
            CameraError::Retrieval(_) => internal_error(&msg),
            _ => failed_precondition_error(&msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_carries_context() {
        let e = CameraError::NotFound("serial 7".to_string());
        assert_eq!(e.to_string(), "camera not found: serial 7");
        let e = CameraError::CaptureStart("isoch not started".to_string());
        assert_eq!(e.to_string(), "unable to start image capture: isoch not started");
    }

    #[test]
    fn test_canonical_message() {
        let e: CanonicalError =
            CameraError::UnsupportedMode("ExternalGate".to_string()).into();
        assert!(format!("{:?}", e).contains("ExternalGate"));
    }
}
