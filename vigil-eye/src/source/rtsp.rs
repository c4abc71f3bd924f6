//! RTSP transport negotiation and dark-frame monitoring

use super::{CaptureStream, FrameCapture};
use crate::config::SourceConfig;
use crate::error::{AcquireError, VisionError};
use crate::frame::Frame;
use crossbeam::channel::{self, RecvTimeoutError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Transport used for RTSP media delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RtspTransport {
    Udp,
    Tcp,
}

impl RtspTransport {
    /// Negotiation order
    pub const ORDER: [RtspTransport; 2] = [RtspTransport::Udp, RtspTransport::Tcp];

    pub fn as_str(&self) -> &'static str {
        match self {
            RtspTransport::Udp => "udp",
            RtspTransport::Tcp => "tcp",
        }
    }
}

impl fmt::Display for RtspTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opens an RTSP address over a specific transport
#[cfg_attr(test, mockall::automock)]
pub trait RtspConnector: Send + Sync {
    fn connect(&self, address: &str, transport: RtspTransport) -> Result<Box<dyn FrameCapture>, VisionError>;
}

/// Heuristic detector for decoders that deliver frames without pixel data.
///
/// A genuinely dark scene trips it just the same; it is a hint, not proof.
#[derive(Debug, Clone)]
pub struct DarkFrameMonitor {
    threshold: f64,
    run_length: u32,
    consecutive: u32,
}

impl DarkFrameMonitor {
    pub fn new(threshold: f64, run_length: u32) -> Self {
        Self {
            threshold,
            run_length: run_length.max(1),
            consecutive: 0,
        }
    }

    /// Record one frame's mean luminance; true exactly when the dark run
    /// reaches the configured length
    pub fn observe(&mut self, luminance: f64) -> bool {
        if luminance < self.threshold {
            self.consecutive = self.consecutive.saturating_add(1);
            self.consecutive == self.run_length
        } else {
            self.consecutive = 0;
            false
        }
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }
}

/// Wait for one valid frame from a freshly connected capture
fn first_frame(capture: &mut dyn FrameCapture, timeout: Duration) -> Option<Frame> {
    let started = Instant::now();
    loop {
        match capture.grab() {
            Ok(Some(frame)) => return Some(frame),
            Ok(None) | Err(_) => {}
        }
        if started.elapsed() >= timeout {
            return None;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
}

type Attempt = Result<(Box<dyn FrameCapture>, Frame), String>;

/// One transport attempt, bounded by `timeout` even when the backend
/// blocks in `connect` or `grab`. An abandoned attempt finishes on its own
/// thread and drops its capture.
fn attempt(connector: &Arc<dyn RtspConnector>, address: &str, transport: RtspTransport, timeout: Duration) -> Attempt {
    let (tx, rx) = channel::bounded::<Attempt>(1);
    let connector = connector.clone();
    let owned = address.to_string();

    let spawned = std::thread::Builder::new()
        .name(format!("vigil-rtsp-{}", transport))
        .spawn(move || {
            let result = match connector.connect(&owned, transport) {
                Ok(mut capture) => match first_frame(capture.as_mut(), timeout) {
                    Some(frame) => Ok((capture, frame)),
                    None => Err("no frame within timeout".to_string()),
                },
                Err(e) => Err(e.to_string()),
            };
            if tx.send(result).is_err() {
                debug!("RTSP {} attempt on {} finished after it was abandoned", transport, owned);
            }
        });
    if let Err(e) = spawned {
        return Err(format!("could not start attempt: {}", e));
    }

    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) => Err("no frame within timeout".to_string()),
        Err(RecvTimeoutError::Disconnected) => Err("attempt ended without a result".to_string()),
    }
}

/// Connect to `address`, trying UDP first and TCP second, each attempt
/// bounded by `rtsp_attempt_timeout`.
///
/// Returns the open stream with its first frame buffered. URL substitution
/// is left to the caller.
pub fn negotiate(
    connector: &Arc<dyn RtspConnector>,
    address: &str,
    fallback_address: String,
    config: &SourceConfig,
) -> Result<CaptureStream, AcquireError> {
    let mut failures = Vec::new();

    for transport in RtspTransport::ORDER {
        info!("Connecting to {} over {}", address, transport);
        match attempt(connector, address, transport, config.rtsp_attempt_timeout) {
            Ok((capture, frame)) => {
                info!("RTSP stream {} delivering frames over {}", address, transport);
                let stream = CaptureStream::new(address, capture, config)
                    .with_transport(transport)
                    .with_first_frame(frame)
                    .with_dark_monitor(
                        DarkFrameMonitor::new(config.dark_luminance_threshold, config.dark_frame_run),
                        fallback_address,
                    );
                return Ok(stream);
            }
            Err(reason) => {
                warn!(
                    "RTSP {} attempt on {} failed within {:.1}s: {}",
                    transport,
                    address,
                    config.rtsp_attempt_timeout.as_secs_f32(),
                    reason
                );
                failures.push(format!("{}: {}", transport, reason));
            }
        }
    }

    Err(AcquireError::unavailable(address, failures.join("; ")))
}
