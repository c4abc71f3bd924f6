//! Local capture devices

use super::{CaptureStream, FrameCapture};
use crate::config::SourceConfig;
use crate::error::{AcquireError, VisionError};
use tracing::info;

/// Opens a capture device by index
#[cfg_attr(test, mockall::automock)]
pub trait DeviceOpener: Send + Sync {
    fn open(&self, index: u32, config: &SourceConfig) -> Result<Box<dyn FrameCapture>, VisionError>;
}

/// Open device `index`. There is no retry: a failure means the caller
/// has to pick another index.
pub fn open(opener: &dyn DeviceOpener, index: u32, config: &SourceConfig) -> Result<CaptureStream, AcquireError> {
    let address = format!("device:{}", index);
    let capture = opener
        .open(index, config)
        .map_err(|e| AcquireError::unavailable(&address, e.to_string()))?;

    info!(
        "Camera {} opened at {}x{} @ {}fps",
        index, config.resolution.0, config.resolution.1, config.frame_rate
    );
    Ok(CaptureStream::new(address, capture, config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;
    use crate::source::MockFrameCapture;
    use mockall::predicate::eq;

    #[test]
    fn test_open_failure_is_terminal() {
        let mut opener = MockDeviceOpener::new();
        opener
            .expect_open()
            .with(eq(3), mockall::predicate::always())
            .times(1)
            .returning(|_, _| Err(VisionError::Camera("Camera 3 failed to open".to_string())));

        match open(&opener, 3, &SourceConfig::default()) {
            Err(AcquireError::SourceUnavailable { address, reason }) => {
                assert_eq!(address, "device:3");
                assert!(reason.contains("failed to open"));
            }
            Err(other) => panic!("unexpected {:?}", other),
            Ok(_) => panic!("open must fail"),
        }
    }

    #[test]
    fn test_open_reads_frames() {
        let mut opener = MockDeviceOpener::new();
        opener.expect_open().times(1).returning(|_, _| {
            let mut capture = MockFrameCapture::new();
            capture
                .expect_grab()
                .returning(|| Ok(Some(Frame::solid(8, 6, [30, 60, 90]).unwrap())));
            Ok(Box::new(capture) as Box<dyn FrameCapture>)
        });

        let mut stream = open(&opener, 0, &SourceConfig::default()).unwrap();
        let read = stream.read().unwrap();
        assert_eq!((read.frame.width(), read.frame.height()), (8, 6));
        assert!(read.degraded.is_none());
        assert_eq!(stream.health().frames_delivered, 1);
    }
}
