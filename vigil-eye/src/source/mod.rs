//! Source acquisition
//!
//! One [`SourceAcquirer`] opens local devices, HTTP/MJPEG endpoints and
//! RTSP streams behind a single [`StreamHandle`]. Each transport kind owns
//! its own connection policy; the session only sees frames, a non-fatal
//! [`CodecDegraded`] hint and the [`AcquireError`] taxonomy.

pub mod http;
pub mod local;
pub mod mjpeg;
#[cfg(feature = "opencv")]
pub mod opencv_backend;
pub mod rtsp;
pub mod slot;

pub use http::{HttpConnector, HttpStream, ReqwestConnector};
pub use local::DeviceOpener;
pub use rtsp::{DarkFrameMonitor, RtspConnector, RtspTransport};

use crate::config::SourceConfig;
use crate::error::{AcquireError, VisionError};
use crate::frame::Frame;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Transport family of a source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Local,
    Http,
    Rtsp,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SourceKind::Local => "local",
            SourceKind::Http => "http",
            SourceKind::Rtsp => "rtsp",
        })
    }
}

/// Operator-supplied video source
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceDescriptor {
    Local(u32),
    Http(String),
    Rtsp(String),
}

impl SourceDescriptor {
    /// Parse a device index, `http(s)://` or `rtsp://` address
    pub fn parse(input: &str) -> Result<Self, VisionError> {
        let input = input.trim();
        if !input.is_empty() && input.bytes().all(|b| b.is_ascii_digit()) {
            return input
                .parse::<u32>()
                .map(SourceDescriptor::Local)
                .map_err(|e| VisionError::Config(format!("Invalid device index {}: {}", input, e)));
        }

        let lower = input.to_ascii_lowercase();
        if lower.starts_with("http://") || lower.starts_with("https://") {
            Ok(SourceDescriptor::Http(input.to_string()))
        } else if lower.starts_with("rtsp://") {
            Ok(SourceDescriptor::Rtsp(input.to_string()))
        } else {
            Err(VisionError::Config(format!(
                "Unrecognized source '{}': expected a device index, http:// or rtsp:// address",
                input
            )))
        }
    }

    pub fn kind(&self) -> SourceKind {
        match self {
            SourceDescriptor::Local(_) => SourceKind::Local,
            SourceDescriptor::Http(_) => SourceKind::Http,
            SourceDescriptor::Rtsp(_) => SourceKind::Rtsp,
        }
    }

    pub fn address(&self) -> String {
        match self {
            SourceDescriptor::Local(index) => format!("device:{}", index),
            SourceDescriptor::Http(address) | SourceDescriptor::Rtsp(address) => address.clone(),
        }
    }
}

impl fmt::Display for SourceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.address())
    }
}

/// Running counters of a stream's health
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HealthCounters {
    pub frames_delivered: u64,
    pub frames_dropped: u64,
    pub consecutive_decode_failures: u32,
    /// Only tracked for RTSP sources
    pub consecutive_dark_frames: u32,
    /// Frames delivered during the last full second
    pub fps: u32,
}

/// Non-fatal hint that the decoder produces frames without pixel data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecDegraded {
    pub consecutive_dark: u32,
    /// Same host and port with a simpler path
    pub suggested_address: String,
}

/// One successful read
#[derive(Debug)]
pub struct FrameRead {
    pub frame: Frame,
    pub degraded: Option<CodecDegraded>,
}

impl FrameRead {
    pub fn plain(frame: Frame) -> Self {
        Self { frame, degraded: None }
    }
}

/// Frame grabber over a decoding backend.
///
/// `Ok(None)` means the backend has no more frames; `Err` is a single
/// failed decode.
#[cfg_attr(test, mockall::automock)]
pub trait FrameCapture: Send {
    fn grab(&mut self) -> Result<Option<Frame>, VisionError>;
}

/// Backend used when the crate is built without a decoding library
#[derive(Debug, Default, Clone, Copy)]
pub struct UnsupportedBackend;

impl UnsupportedBackend {
    fn error(what: &str) -> VisionError {
        VisionError::Camera(format!("{} capture requires the `opencv` feature", what))
    }
}

impl DeviceOpener for UnsupportedBackend {
    fn open(&self, _index: u32, _config: &SourceConfig) -> Result<Box<dyn FrameCapture>, VisionError> {
        Err(Self::error("Local device"))
    }
}

impl RtspConnector for UnsupportedBackend {
    fn connect(&self, _address: &str, _transport: RtspTransport) -> Result<Box<dyn FrameCapture>, VisionError> {
        Err(Self::error("RTSP"))
    }
}

/// Synchronous stream over a [`FrameCapture`], used for local devices
/// and RTSP
pub struct CaptureStream {
    address: String,
    capture: Option<Box<dyn FrameCapture>>,
    transport: Option<RtspTransport>,
    pending: Option<Frame>,
    max_failures: u32,
    decode_failures: u32,
    delivered: u64,
    dark: Option<(DarkFrameMonitor, String)>,
    fps: u32,
    frames_this_second: u32,
    second_started: Instant,
}

impl CaptureStream {
    pub fn new(address: impl Into<String>, capture: Box<dyn FrameCapture>, config: &SourceConfig) -> Self {
        Self {
            address: address.into(),
            capture: Some(capture),
            transport: None,
            pending: None,
            max_failures: config.max_consecutive_decode_failures,
            decode_failures: 0,
            delivered: 0,
            dark: None,
            fps: 0,
            frames_this_second: 0,
            second_started: Instant::now(),
        }
    }

    pub fn with_transport(mut self, transport: RtspTransport) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Deliver `frame` on the next read before grabbing again
    pub fn with_first_frame(mut self, frame: Frame) -> Self {
        self.pending = Some(frame);
        self
    }

    /// Watch luminance and suggest `fallback_address` on a dark run
    pub fn with_dark_monitor(mut self, monitor: DarkFrameMonitor, fallback_address: String) -> Self {
        self.dark = Some((monitor, fallback_address));
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn transport(&self) -> Option<RtspTransport> {
        self.transport
    }

    pub fn fallback_address(&self) -> Option<&str> {
        self.dark.as_ref().map(|(_, address)| address.as_str()).filter(|a| !a.is_empty())
    }

    pub fn read(&mut self) -> Result<FrameRead, AcquireError> {
        let frame = match self.pending.take() {
            Some(frame) => frame,
            None => self.grab()?,
        };

        self.delivered += 1;
        self.frames_this_second += 1;
        if self.second_started.elapsed() >= Duration::from_secs(1) {
            self.fps = self.frames_this_second;
            self.frames_this_second = 0;
            self.second_started = Instant::now();
        }

        let mut degraded = None;
        if let Some((monitor, suggested)) = self.dark.as_mut() {
            if monitor.observe(frame.mean_luminance()) {
                warn!(
                    "{} delivered {} consecutive near-black frames; the codec may be unsupported, try {}",
                    self.address,
                    monitor.consecutive(),
                    suggested
                );
                degraded = Some(CodecDegraded {
                    consecutive_dark: monitor.consecutive(),
                    suggested_address: suggested.clone(),
                });
            }
        }

        Ok(FrameRead { frame, degraded })
    }

    fn grab(&mut self) -> Result<Frame, AcquireError> {
        let Some(capture) = self.capture.as_mut() else {
            return Err(AcquireError::StreamEnded {
                address: self.address.clone(),
            });
        };

        loop {
            match capture.grab() {
                Ok(Some(frame)) => {
                    self.decode_failures = 0;
                    return Ok(frame);
                }
                Ok(None) => {
                    info!("Stream {} has no more frames", self.address);
                    return Err(AcquireError::StreamEnded {
                        address: self.address.clone(),
                    });
                }
                Err(e) => {
                    self.decode_failures += 1;
                    debug!("Decode failure {} on {}: {}", self.decode_failures, self.address, e);
                    if self.decode_failures > self.max_failures {
                        return Err(AcquireError::DecodeStalled {
                            address: self.address.clone(),
                            failures: self.decode_failures,
                        });
                    }
                }
            }
        }
    }

    pub fn health(&self) -> HealthCounters {
        HealthCounters {
            frames_delivered: self.delivered,
            frames_dropped: 0,
            consecutive_decode_failures: self.decode_failures,
            consecutive_dark_frames: self.dark.as_ref().map(|(m, _)| m.consecutive()).unwrap_or(0),
            fps: self.fps,
        }
    }

    /// Close the backend; later reads report `StreamEnded`
    pub fn release(&mut self) {
        if self.capture.take().is_some() {
            debug!("Released capture for {}", self.address);
        }
        self.pending = None;
    }
}

/// An open source, one variant per transport kind
pub enum StreamHandle {
    Local(CaptureStream),
    Http(HttpStream),
    Rtsp(CaptureStream),
}

impl StreamHandle {
    pub fn read(&mut self) -> Result<FrameRead, AcquireError> {
        match self {
            StreamHandle::Local(stream) | StreamHandle::Rtsp(stream) => stream.read(),
            StreamHandle::Http(stream) => stream.read(),
        }
    }

    pub fn health(&self) -> HealthCounters {
        match self {
            StreamHandle::Local(stream) | StreamHandle::Rtsp(stream) => stream.health(),
            StreamHandle::Http(stream) => stream.health(),
        }
    }

    /// Stop producers and close the backend
    pub fn release(&mut self) {
        match self {
            StreamHandle::Local(stream) | StreamHandle::Rtsp(stream) => stream.release(),
            StreamHandle::Http(stream) => stream.release(),
        }
    }

    pub fn address(&self) -> &str {
        match self {
            StreamHandle::Local(stream) | StreamHandle::Rtsp(stream) => stream.address(),
            StreamHandle::Http(stream) => stream.address(),
        }
    }

    pub fn kind(&self) -> SourceKind {
        match self {
            StreamHandle::Local(_) => SourceKind::Local,
            StreamHandle::Http(_) => SourceKind::Http,
            StreamHandle::Rtsp(_) => SourceKind::Rtsp,
        }
    }

    pub fn active_transport(&self) -> Option<RtspTransport> {
        match self {
            StreamHandle::Rtsp(stream) => stream.transport(),
            _ => None,
        }
    }

    /// HTTP substitute for an RTSP stream
    pub fn fallback_address(&self) -> Option<&str> {
        match self {
            StreamHandle::Rtsp(stream) => stream.fallback_address(),
            _ => None,
        }
    }
}

/// Opens descriptors against pluggable backends
pub struct SourceAcquirer {
    config: SourceConfig,
    devices: Box<dyn DeviceOpener>,
    http: Box<dyn HttpConnector>,
    rtsp: Arc<dyn RtspConnector>,
}

impl SourceAcquirer {
    /// Acquirer with the backends this build supports
    pub fn new(config: SourceConfig) -> Result<Self, VisionError> {
        let http = Box::new(ReqwestConnector::new(config.http_connect_timeout, config.http_read_timeout)?);

        #[cfg(feature = "opencv")]
        let (devices, rtsp): (Box<dyn DeviceOpener>, Box<dyn RtspConnector>) = (
            Box::new(opencv_backend::OpenCvDeviceOpener),
            Box::new(opencv_backend::OpenCvRtspConnector::new(config.rtsp_attempt_timeout)),
        );
        #[cfg(not(feature = "opencv"))]
        let (devices, rtsp): (Box<dyn DeviceOpener>, Box<dyn RtspConnector>) =
            (Box::new(UnsupportedBackend), Box::new(UnsupportedBackend));

        Ok(Self::with_backends(config, devices, http, rtsp))
    }

    pub fn with_backends(
        config: SourceConfig,
        devices: Box<dyn DeviceOpener>,
        http: Box<dyn HttpConnector>,
        rtsp: Box<dyn RtspConnector>,
    ) -> Self {
        Self {
            config,
            devices,
            http,
            rtsp: Arc::from(rtsp),
        }
    }

    pub fn config(&self) -> &SourceConfig {
        &self.config
    }

    /// Open a source. Failure is terminal for this descriptor.
    pub fn open(&self, descriptor: &SourceDescriptor) -> Result<StreamHandle, AcquireError> {
        info!("Opening {} source {}", descriptor.kind(), descriptor);
        match descriptor {
            SourceDescriptor::Local(index) => {
                local::open(self.devices.as_ref(), *index, &self.config).map(StreamHandle::Local)
            }
            SourceDescriptor::Http(address) => self.open_http(address),
            SourceDescriptor::Rtsp(address) => {
                let fallback = http_fallback_for(address).unwrap_or_default();
                rtsp::negotiate(&self.rtsp, address, fallback, &self.config).map(StreamHandle::Rtsp)
            }
        }
    }

    fn open_http(&self, address: &str) -> Result<StreamHandle, AcquireError> {
        let body = self
            .http
            .connect(address)
            .map_err(|e| AcquireError::unavailable(address, e.to_string()))?;
        let stream = HttpStream::spawn(address, body, &self.config)
            .map_err(|e| AcquireError::unavailable(address, e.to_string()))?;
        stream.wait_for_first_frame(self.config.http_first_frame_wait, self.config.http_progress_interval)?;
        Ok(StreamHandle::Http(stream))
    }
}

/// HTTP address on the same host and port as an RTSP address.
///
/// Pure string substitution: user info is dropped, the path becomes
/// `/video` and a missing port defaults to 554.
pub fn http_fallback_for(rtsp_address: &str) -> Option<String> {
    let trimmed = rtsp_address.trim();
    let scheme_end = trimmed.find("://")?;
    if !trimmed[..scheme_end].eq_ignore_ascii_case("rtsp") {
        return None;
    }

    let rest = &trimmed[scheme_end + 3..];
    let authority = rest.split(['/', '?', '#']).next().unwrap_or_default();
    let host_port = authority.rsplit('@').next().unwrap_or_default();

    let (host, port) = if let Some(bracketed) = host_port.strip_prefix('[') {
        let close = bracketed.find(']')?;
        let host = &host_port[..close + 2];
        let port = bracketed[close + 1..].strip_prefix(':').unwrap_or("");
        (host, port)
    } else {
        match host_port.rsplit_once(':') {
            Some((host, port)) => (host, port),
            None => (host_port, ""),
        }
    };

    if host.is_empty() {
        return None;
    }
    let port = if port.is_empty() { "554" } else { port };
    Some(format!("http://{}:{}/video", host, port))
}

/// A known stream address for a phone or IP camera
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceCandidate {
    pub app: &'static str,
    pub address: String,
}

/// Addresses worth trying for a camera at `ip`, most likely first
pub fn candidate_addresses(ip: &str) -> Vec<SourceCandidate> {
    let ip = ip.trim();
    let table: [(&'static str, &[&str]); 3] = [
        (
            "IP Webcam",
            &[
                "rtsp://{}:8080/h264_ulaw.sdp",
                "rtsp://{}:8080/h264_pcm.sdp",
                "http://{}:8080/video",
                "http://{}:8080/mjpegfeed",
                "rtsp://{}:8080/mpeg4",
            ],
        ),
        (
            "DroidCam",
            &[
                "rtsp://{}:4747/mjpegfeed",
                "rtsp://{}:4747/video",
                "rtsp://{}:4747/h264",
                "http://{}:4747/mjpegfeed",
            ],
        ),
        (
            "Generic RTSP",
            &[
                "rtsp://{}:554/stream",
                "rtsp://{}:554/live",
                "rtsp://{}:8554/stream",
                "rtsp://{}:1935/live/stream",
                "rtsp://{}:5000/stream",
            ],
        ),
    ];

    let mut candidates: Vec<SourceCandidate> = Vec::new();
    for (app, patterns) in table {
        for pattern in patterns {
            let address = pattern.replace("{}", ip);
            if !candidates.iter().any(|c| c.address == address) {
                candidates.push(SourceCandidate { app, address });
            }
        }
    }
    candidates
}
