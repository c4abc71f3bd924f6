//! OpenCV / FFmpeg capture backends

use super::{DeviceOpener, FrameCapture, RtspConnector, RtspTransport};
use crate::config::SourceConfig;
use crate::error::VisionError;
use crate::frame::Frame;
use opencv::{
    core::{Mat, Vector},
    imgproc,
    prelude::*,
    videoio::{
        VideoCapture, CAP_ANY, CAP_FFMPEG, CAP_PROP_BUFFERSIZE, CAP_PROP_FPS, CAP_PROP_FRAME_HEIGHT,
        CAP_PROP_FRAME_WIDTH, CAP_PROP_OPEN_TIMEOUT_MSEC, CAP_PROP_READ_TIMEOUT_MSEC,
    },
};
use parking_lot::Mutex;
use std::time::Duration;
use tracing::{debug, warn};

/// Environment variable read by OpenCV's FFmpeg backend at open time.
/// The transport can only be chosen through it.
const FFMPEG_OPTIONS_VAR: &str = "OPENCV_FFMPEG_CAPTURE_OPTIONS";

/// Held from setting `FFMPEG_OPTIONS_VAR` until the open has read it, so
/// concurrent UDP and TCP attempts never see each other's transport.
/// Nothing else in the process reads or writes the variable.
static FFMPEG_OPTIONS_LOCK: Mutex<()> = parking_lot::const_mutex(());

/// BGR `VideoCapture` converted to RGB frames
pub struct OpenCvCapture {
    capture: VideoCapture,
}

impl OpenCvCapture {
    fn mat_to_frame(mat: &Mat) -> Result<Frame, VisionError> {
        let mut rgb = Mat::default();
        imgproc::cvt_color(mat, &mut rgb, imgproc::COLOR_BGR2RGB, 0)?;
        let width = rgb.cols() as u32;
        let height = rgb.rows() as u32;
        Frame::new(width, height, rgb.data_bytes()?.to_vec())
    }
}

impl FrameCapture for OpenCvCapture {
    fn grab(&mut self) -> Result<Option<Frame>, VisionError> {
        let mut mat = Mat::default();
        if !self.capture.read(&mut mat)? {
            return Ok(None);
        }
        if mat.empty() {
            return Err(VisionError::Camera("Empty frame from capture".to_string()));
        }
        Self::mat_to_frame(&mat).map(Some)
    }
}

impl Drop for OpenCvCapture {
    fn drop(&mut self) {
        if let Err(e) = self.capture.release() {
            warn!("Failed to release capture: {}", e);
        }
    }
}

/// Opens local cameras by index
#[derive(Debug, Default, Clone, Copy)]
pub struct OpenCvDeviceOpener;

impl DeviceOpener for OpenCvDeviceOpener {
    fn open(&self, index: u32, config: &SourceConfig) -> Result<Box<dyn FrameCapture>, VisionError> {
        let mut capture = VideoCapture::new(index as i32, CAP_ANY)
            .map_err(|e| VisionError::Camera(format!("Failed to open camera {}: {}", index, e)))?;

        if !capture
            .is_opened()
            .map_err(|e| VisionError::Camera(format!("Camera {} not opened: {}", index, e)))?
        {
            return Err(VisionError::Camera(format!("Camera {} failed to open", index)));
        }

        capture
            .set(CAP_PROP_FRAME_WIDTH, config.resolution.0 as f64)
            .map_err(|e| VisionError::Camera(format!("Failed to set width: {}", e)))?;
        capture
            .set(CAP_PROP_FRAME_HEIGHT, config.resolution.1 as f64)
            .map_err(|e| VisionError::Camera(format!("Failed to set height: {}", e)))?;
        capture
            .set(CAP_PROP_FPS, config.frame_rate as f64)
            .map_err(|e| VisionError::Camera(format!("Failed to set FPS: {}", e)))?;
        // Keep only the newest frame in the driver queue
        if let Err(e) = capture.set(CAP_PROP_BUFFERSIZE, 1.0) {
            debug!("Camera {} ignores buffer size: {}", index, e);
        }

        Ok(Box::new(OpenCvCapture { capture }))
    }
}

/// Opens RTSP streams through FFmpeg with an explicit transport.
///
/// Open and read calls are bounded by FFmpeg itself; the caller bounds the
/// whole attempt as well.
#[derive(Debug, Clone, Copy)]
pub struct OpenCvRtspConnector {
    timeout: Duration,
}

impl OpenCvRtspConnector {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl RtspConnector for OpenCvRtspConnector {
    fn connect(&self, address: &str, transport: RtspTransport) -> Result<Box<dyn FrameCapture>, VisionError> {
        let millis = self.timeout.as_millis().clamp(1, i32::MAX as u128) as i32;
        let params = Vector::<i32>::from_slice(&[
            CAP_PROP_OPEN_TIMEOUT_MSEC,
            millis,
            CAP_PROP_READ_TIMEOUT_MSEC,
            millis,
        ]);

        let mut capture = {
            let _guard = FFMPEG_OPTIONS_LOCK.lock();
            std::env::set_var(FFMPEG_OPTIONS_VAR, format!("rtsp_transport;{}", transport.as_str()));
            VideoCapture::from_file_with_params(address, CAP_FFMPEG, &params)
                .map_err(|e| VisionError::Camera(format!("Failed to open {}: {}", address, e)))?
        };
        if !capture.is_opened()? {
            return Err(VisionError::Camera(format!("{} did not open over {}", address, transport)));
        }
        if let Err(e) = capture.set(CAP_PROP_BUFFERSIZE, 1.0) {
            debug!("{} ignores buffer size: {}", address, e);
        }

        Ok(Box::new(OpenCvCapture { capture }))
    }
}
