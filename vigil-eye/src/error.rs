//! Error types for vigil-eye

use thiserror::Error;

#[derive(Error, Debug)]
pub enum VisionError {
    #[error("Camera error: {0}")]
    Camera(String),

    #[error("Model error: {0}")]
    Model(String),

    #[error("Processing error: {0}")]
    Processing(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[cfg(feature = "opencv")]
    #[error("OpenCV error: {0}")]
    OpenCv(String),
}

#[cfg(feature = "opencv")]
impl From<opencv::Error> for VisionError {
    fn from(err: opencv::Error) -> Self {
        VisionError::OpenCv(err.message)
    }
}

/// Failures of the source acquisition layer.
///
/// `CodecDegraded` is not listed here: it rides along with a
/// successful read (see [`crate::source::CodecDegraded`]).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AcquireError {
    /// Terminal for the descriptor that produced it.
    #[error("Source unavailable at {address}: {reason}")]
    SourceUnavailable { address: String, reason: String },

    /// Normal end of stream.
    #[error("Stream ended at {address}")]
    StreamEnded { address: String },

    /// A run of consecutive decode failures exhausted its budget.
    #[error("Decoding stalled at {address} after {failures} consecutive failures")]
    DecodeStalled { address: String, failures: u32 },
}

impl AcquireError {
    pub fn unavailable(address: impl Into<String>, reason: impl Into<String>) -> Self {
        AcquireError::SourceUnavailable {
            address: address.into(),
            reason: reason.into(),
        }
    }

    /// Address of the source the error refers to
    pub fn address(&self) -> &str {
        match self {
            AcquireError::SourceUnavailable { address, .. }
            | AcquireError::StreamEnded { address }
            | AcquireError::DecodeStalled { address, .. } => address,
        }
    }
}

/// Identity registry failures. None of these abort a session.
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Registry file {path} could not be loaded: {reason}")]
    LoadWarning { path: String, reason: String },

    #[error("Registry write to {path} failed: {reason}")]
    WriteFailure { path: String, reason: String },

    #[error("Embedding has {actual} dimensions, registry expects {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
}

/// Errors that end a session before or during the run.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("No usable video source (tried {}){}", .tried.join(", "), suggestion_suffix(.suggestion))]
    SourceExhausted {
        tried: Vec<String>,
        suggestion: Option<String>,
    },

    #[error("Configuration error: {0}")]
    Config(String),
}

fn suggestion_suffix(suggestion: &Option<String>) -> String {
    match suggestion {
        Some(address) => format!("; try {} instead", address),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vision_error_display() {
        let err = VisionError::Camera("Test error".to_string());
        assert!(err.to_string().contains("Camera error"));
        assert!(err.to_string().contains("Test error"));
    }

    #[test]
    fn test_vision_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "File not found");
        let vision_err: VisionError = io_err.into();
        match vision_err {
            VisionError::Io(_) => {}
            _ => panic!("Expected Io error"),
        }
    }

    #[test]
    fn test_acquire_error_address() {
        let err = AcquireError::unavailable("rtsp://10.0.0.5:8080/h264_ulaw.sdp", "timeout");
        assert_eq!(err.address(), "rtsp://10.0.0.5:8080/h264_ulaw.sdp");

        let err = AcquireError::StreamEnded { address: "http://a/video".to_string() };
        assert_eq!(err.address(), "http://a/video");
        assert!(err.to_string().contains("Stream ended"));
    }

    #[test]
    fn test_session_error_carries_suggestion() {
        let err = SessionError::SourceExhausted {
            tried: vec!["rtsp://h:8080/x".to_string(), "http://h:8080/video".to_string()],
            suggestion: Some("http://h:8080/mjpegfeed".to_string()),
        };
        let msg = err.to_string();
        assert!(msg.contains("rtsp://h:8080/x, http://h:8080/video"));
        assert!(msg.contains("try http://h:8080/mjpegfeed instead"));

        let err = SessionError::SourceExhausted { tried: vec!["0".to_string()], suggestion: None };
        assert!(!err.to_string().contains("try"));
    }
}
