//! HTTP / MJPEG ingestion
//!
//! A producer thread reads the response body in 1 KiB chunks, splits out
//! JPEG images and decodes them into the latest-frame slot.

use super::mjpeg::MjpegSplitter;
use super::slot::{LatestFrameSlot, ProducerStatus, SlotRead};
use super::{FrameRead, HealthCounters};
use crate::config::SourceConfig;
use crate::error::{AcquireError, VisionError};
use crate::frame::Frame;
use std::io::{self, ErrorKind, Read};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const CHUNK_SIZE: usize = 1024;
/// Extra wait on release beyond one read timeout
const JOIN_GRACE: Duration = Duration::from_secs(1);

/// Opens the HTTP body of a stream.
///
/// Reads on the returned body must give up after a bounded time with
/// `ErrorKind::TimedOut` (or `WouldBlock`), so the producer can notice a
/// release while the server is silent.
#[cfg_attr(test, mockall::automock)]
pub trait HttpConnector: Send + Sync {
    fn connect(&self, address: &str) -> Result<Box<dyn Read + Send>, VisionError>;
}

/// Blocking reqwest client for MJPEG endpoints
pub struct ReqwestConnector {
    client: reqwest::blocking::Client,
}

impl ReqwestConnector {
    /// `read_timeout` bounds the response headers and every body read
    pub fn new(connect_timeout: Duration, read_timeout: Duration) -> Result<Self, VisionError> {
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(read_timeout)
            .build()?;
        Ok(Self { client })
    }
}

impl HttpConnector for ReqwestConnector {
    fn connect(&self, address: &str) -> Result<Box<dyn Read + Send>, VisionError> {
        let response = self.client.get(address).send()?;
        let status = response.status();
        if !status.is_success() {
            return Err(VisionError::Camera(format!("HTTP {} from {}", status, address)));
        }
        Ok(Box::new(ResponseBody(response)))
    }
}

/// Response body that reports reqwest read timeouts as `ErrorKind::TimedOut`
struct ResponseBody(reqwest::blocking::Response);

impl Read for ResponseBody {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf).map_err(|e| {
            let timed_out = e
                .get_ref()
                .and_then(|inner| inner.downcast_ref::<reqwest::Error>())
                .is_some_and(reqwest::Error::is_timeout);
            if timed_out {
                io::Error::new(ErrorKind::TimedOut, e)
            } else {
                e
            }
        })
    }
}

/// Live HTTP stream backed by a producer thread
pub struct HttpStream {
    address: String,
    slot: Arc<LatestFrameSlot>,
    running: Arc<AtomicBool>,
    decode_failures: Arc<AtomicU32>,
    stale_wait: Duration,
    join_wait: Duration,
    producer: Option<JoinHandle<()>>,
}

impl HttpStream {
    /// Start decoding `body` on a background thread
    pub fn spawn(
        address: impl Into<String>,
        body: Box<dyn Read + Send>,
        config: &SourceConfig,
    ) -> Result<Self, VisionError> {
        let address = address.into();
        let slot = Arc::new(LatestFrameSlot::new());
        let running = Arc::new(AtomicBool::new(true));
        let decode_failures = Arc::new(AtomicU32::new(0));

        let producer = Producer {
            address: address.clone(),
            body,
            slot: slot.clone(),
            running: running.clone(),
            decode_failures: decode_failures.clone(),
            max_failures: config.max_consecutive_decode_failures,
        };
        let handle = std::thread::Builder::new()
            .name("vigil-http-producer".to_string())
            .spawn(move || producer.run())?;

        Ok(Self {
            address,
            slot,
            running,
            decode_failures,
            stale_wait: config.http_first_frame_wait,
            join_wait: config.http_read_timeout + JOIN_GRACE,
            producer: Some(handle),
        })
    }

    /// Block until the first frame is buffered, logging progress
    pub fn wait_for_first_frame(&self, wait: Duration, progress_every: Duration) -> Result<(), AcquireError> {
        let started = Instant::now();
        let mut next_progress = started + progress_every;

        loop {
            if self.slot.has_frame() {
                info!("Connected to {} in {:.1}s", self.address, started.elapsed().as_secs_f32());
                return Ok(());
            }
            match self.slot.status() {
                ProducerStatus::Running => {}
                ProducerStatus::Ended => {
                    return Err(AcquireError::unavailable(&self.address, "stream closed before the first frame"));
                }
                ProducerStatus::Stalled { failures } => {
                    return Err(AcquireError::unavailable(
                        &self.address,
                        format!("{} undecodable images before the first frame", failures),
                    ));
                }
            }

            let now = Instant::now();
            if now >= started + wait {
                return Err(AcquireError::unavailable(
                    &self.address,
                    format!("timeout waiting for frames after {:.1}s", wait.as_secs_f32()),
                ));
            }
            if now >= next_progress {
                info!(
                    "Still connecting to {} ({:.0}/{:.0}s)",
                    self.address,
                    (now - started).as_secs_f32(),
                    wait.as_secs_f32()
                );
                next_progress += progress_every;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Take the newest frame
    pub fn read(&mut self) -> Result<FrameRead, AcquireError> {
        match self.slot.take(self.stale_wait) {
            SlotRead::Frame(frame) => Ok(FrameRead::plain(frame)),
            SlotRead::Finished(ProducerStatus::Stalled { failures }) => Err(AcquireError::DecodeStalled {
                address: self.address.clone(),
                failures,
            }),
            SlotRead::Finished(_) => Err(AcquireError::StreamEnded {
                address: self.address.clone(),
            }),
            SlotRead::TimedOut => {
                warn!(
                    "No frames from {} for {:.1}s, treating the stream as ended",
                    self.address,
                    self.stale_wait.as_secs_f32()
                );
                Err(AcquireError::StreamEnded {
                    address: self.address.clone(),
                })
            }
        }
    }

    pub fn health(&self) -> HealthCounters {
        let (frames_delivered, frames_dropped) = self.slot.counters();
        HealthCounters {
            frames_delivered,
            frames_dropped,
            consecutive_decode_failures: self.decode_failures.load(Ordering::Relaxed),
            consecutive_dark_frames: 0,
            fps: self.slot.fps(),
        }
    }

    /// Stop the producer and join it. The producer notices the stop flag
    /// within one body read timeout and drops the connection on exit.
    pub fn release(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        let Some(handle) = self.producer.take() else {
            return;
        };

        let deadline = Instant::now() + self.join_wait;
        while !handle.is_finished() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        if handle.is_finished() {
            let _ = handle.join();
            debug!("HTTP producer for {} joined", self.address);
        } else {
            warn!("HTTP producer for {} did not stop within {:?}", self.address, self.join_wait);
        }
    }
}

impl Drop for HttpStream {
    fn drop(&mut self) {
        self.release();
    }
}

struct Producer {
    address: String,
    body: Box<dyn Read + Send>,
    slot: Arc<LatestFrameSlot>,
    running: Arc<AtomicBool>,
    decode_failures: Arc<AtomicU32>,
    max_failures: u32,
}

impl Producer {
    /// Consumes the producer, so the body (the connection) is closed on return
    fn run(mut self) {
        let status = self.pump();
        match status {
            ProducerStatus::Ended => info!("HTTP stream {} closed by server", self.address),
            ProducerStatus::Stalled { failures } => {
                warn!("HTTP stream {}: {} consecutive decode errors", self.address, failures)
            }
            ProducerStatus::Running => {}
        }
        self.slot.finish(if status == ProducerStatus::Running {
            ProducerStatus::Ended
        } else {
            status
        });
        debug!("HTTP producer for {} stopped", self.address);
    }

    fn pump(&mut self) -> ProducerStatus {
        let mut splitter = MjpegSplitter::new();
        let mut chunk = [0u8; CHUNK_SIZE];
        let mut failures = 0u32;
        let mut frames_this_second = 0u32;
        let mut second_started = Instant::now();

        while self.running.load(Ordering::Relaxed) {
            let n = match self.body.read(&mut chunk) {
                Ok(0) => return ProducerStatus::Ended,
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                // Silent server: poll the stop flag and keep waiting
                Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => continue,
                Err(e) => {
                    warn!("HTTP stream {} read error: {}", self.address, e);
                    return ProducerStatus::Ended;
                }
            };

            splitter.push(&chunk[..n]);
            failures += splitter.take_overflows();

            while let Some(jpeg) = splitter.next_image() {
                match Frame::from_jpeg(&jpeg) {
                    Ok(frame) => {
                        failures = 0;
                        self.slot.put(frame);
                        frames_this_second += 1;
                    }
                    Err(e) => {
                        failures += 1;
                        debug!("HTTP stream {} decode error: {}", self.address, e);
                    }
                }
                self.decode_failures.store(failures, Ordering::Relaxed);
                if failures > self.max_failures {
                    return ProducerStatus::Stalled { failures };
                }
            }
            self.decode_failures.store(failures, Ordering::Relaxed);

            if second_started.elapsed() >= Duration::from_secs(1) {
                self.slot.set_fps(frames_this_second);
                frames_this_second = 0;
                second_started = Instant::now();
            }
        }

        ProducerStatus::Running
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::sync::atomic::AtomicUsize;

    /// Connected server that never sends; every read times out
    struct SilentBody {
        read_timeout: Duration,
        reads: Arc<AtomicUsize>,
        closed: Arc<AtomicBool>,
    }

    impl Read for SilentBody {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.read_timeout);
            Err(io::Error::new(ErrorKind::TimedOut, "read timed out"))
        }
    }

    impl Drop for SilentBody {
        fn drop(&mut self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    fn jpeg_part(value: u8) -> Vec<u8> {
        let jpeg = Frame::solid(8, 8, [value, value, value]).unwrap().to_jpeg().unwrap();
        let mut out = format!("--boundary\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n", jpeg.len())
            .into_bytes();
        out.extend(jpeg);
        out.extend_from_slice(b"\r\n");
        out
    }

    fn config() -> SourceConfig {
        SourceConfig {
            http_first_frame_wait: Duration::from_secs(2),
            max_consecutive_decode_failures: 5,
            ..SourceConfig::default()
        }
    }

    #[test]
    fn test_stream_delivers_frames_then_ends() {
        let mut body = Vec::new();
        for v in [10u8, 120, 240] {
            body.extend(jpeg_part(v));
        }
        let mut stream = HttpStream::spawn("http://10.0.0.5:8080/video", Box::new(Cursor::new(body)), &config()).unwrap();

        let first = stream.read().unwrap();
        assert_eq!(first.frame.width(), 8);
        assert!(first.degraded.is_none());

        let mut ended = false;
        for _ in 0..5 {
            match stream.read() {
                Ok(_) => continue,
                Err(AcquireError::StreamEnded { address }) => {
                    assert_eq!(address, "http://10.0.0.5:8080/video");
                    ended = true;
                    break;
                }
                Err(other) => panic!("unexpected {:?}", other),
            }
        }
        assert!(ended);
        stream.release();
    }

    #[test]
    fn test_single_bad_image_is_tolerated() {
        let mut body = vec![0xFF, 0xD8, 1, 2, 3, 0xFF, 0xD9];
        body.extend(jpeg_part(50));
        let mut stream = HttpStream::spawn("http://cam/video", Box::new(Cursor::new(body)), &config()).unwrap();

        assert!(stream.read().is_ok());
        assert!(matches!(stream.read(), Err(AcquireError::StreamEnded { .. })));
    }

    #[test]
    fn test_run_of_bad_images_stalls() {
        let mut body = Vec::new();
        for _ in 0..10 {
            body.extend_from_slice(&[0xFF, 0xD8, 0, 0, 0xFF, 0xD9]);
        }
        body.extend(jpeg_part(50));
        let mut stream = HttpStream::spawn("http://cam/video", Box::new(Cursor::new(body)), &config()).unwrap();

        match stream.read() {
            Err(AcquireError::DecodeStalled { failures, .. }) => assert_eq!(failures, 6),
            other => panic!("expected DecodeStalled, got {:?}", other.map(|r| r.frame.width())),
        }
    }

    #[test]
    fn test_wait_for_first_frame_on_empty_body() {
        let stream = HttpStream::spawn("http://cam/video", Box::new(Cursor::new(Vec::new())), &config()).unwrap();
        let err = stream
            .wait_for_first_frame(Duration::from_secs(1), Duration::from_millis(100))
            .unwrap_err();
        assert!(matches!(err, AcquireError::SourceUnavailable { .. }));
    }

    #[test]
    fn test_release_closes_silent_connection() {
        let config = SourceConfig {
            http_read_timeout: Duration::from_millis(100),
            http_first_frame_wait: Duration::from_millis(300),
            ..config()
        };
        let reads = Arc::new(AtomicUsize::new(0));
        let closed = Arc::new(AtomicBool::new(false));
        let body = SilentBody {
            read_timeout: config.http_read_timeout,
            reads: reads.clone(),
            closed: closed.clone(),
        };
        let mut stream = HttpStream::spawn("http://cam/video", Box::new(body), &config).unwrap();

        while reads.load(Ordering::SeqCst) == 0 {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(matches!(stream.read(), Err(AcquireError::StreamEnded { .. })));
        assert!(!closed.load(Ordering::SeqCst));

        let started = Instant::now();
        stream.release();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(closed.load(Ordering::SeqCst));
    }
}
