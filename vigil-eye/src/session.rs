//! Session loop
//!
//! Drives one run: `Init -> Running -> (PausedToggle)* -> ShuttingDown -> Closed`.
//! Each cycle reads the newest frame, advances the scheduler, runs the
//! orchestrator, hands the annotations to the renderer and polls control
//! input. Shutdown always flushes the registry and releases the source.

use crate::config::VisionConfig;
use crate::error::{AcquireError, RegistryError, SessionError};
use crate::frame::Frame;
use crate::orchestrator::{AnnotationSet, RecognitionOrchestrator};
use crate::registry::IdentityRegistry;
use crate::scheduler::{FrameScheduler, RecognizerKind};
use crate::source::{http_fallback_for, RtspTransport, SourceAcquirer, SourceDescriptor, SourceKind, StreamHandle};
use chrono::Utc;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const FPS_WINDOW: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Init,
    Running,
    PausedToggle,
    ShuttingDown,
    Closed,
}

/// Operator command, polled once per cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    Quit,
    SaveFrame,
    Toggle(RecognizerKind),
}

/// Non-blocking source of operator commands
pub trait ControlInput: Send {
    fn poll(&mut self) -> Option<ControlCommand>;
}

/// What the renderer shows besides the annotations
#[derive(Debug, Clone, PartialEq)]
pub struct SessionStatus {
    pub fps: f32,
    pub cycle: u64,
    pub active: Vec<RecognizerKind>,
    pub source: SourceKind,
    pub address: String,
    pub transport: Option<RtspTransport>,
}

/// Draws or prints one cycle's output
pub trait Renderer: Send {
    fn render(&mut self, frame: &Frame, annotations: &AnnotationSet, status: &SessionStatus);
}

/// Frames per second over half-second windows
#[derive(Debug, Clone)]
pub struct FpsMeter {
    window_start: Instant,
    frames: u32,
    fps: f32,
}

impl Default for FpsMeter {
    fn default() -> Self {
        Self::new(Instant::now())
    }
}

impl FpsMeter {
    pub fn new(now: Instant) -> Self {
        Self {
            window_start: now,
            frames: 0,
            fps: 0.0,
        }
    }

    pub fn tick(&mut self, now: Instant) -> f32 {
        self.frames += 1;
        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed >= FPS_WINDOW {
            self.fps = self.frames as f32 / elapsed.as_secs_f32();
            self.frames = 0;
            self.window_start = now;
        }
        self.fps
    }

    pub fn fps(&self) -> f32 {
        self.fps
    }
}

/// Why the loop stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    Quit,
    Interrupted,
    StreamEnded { address: String },
    DecodeStalled { address: String, failures: u32 },
}

/// Summary returned by [`Session::run`]
#[derive(Debug, Clone, PartialEq)]
pub struct SessionReport {
    pub cycles: u64,
    pub frames_saved: u64,
    pub identities: usize,
    pub reason: ShutdownReason,
    pub fallback_used: bool,
    /// Every state the session entered, in order
    pub states: Vec<SessionState>,
}

enum Recovery {
    Switched,
    Continue,
    Stop(ShutdownReason),
}

/// One run from source open to resource release
pub struct Session {
    config: VisionConfig,
    acquirer: SourceAcquirer,
    orchestrator: RecognitionOrchestrator,
    controls: Box<dyn ControlInput>,
    renderer: Box<dyn Renderer>,
    interrupt: Arc<AtomicBool>,
    registry: Option<IdentityRegistry>,
    scheduler: FrameScheduler,
    handle: Option<StreamHandle>,
    state: SessionState,
    states: Vec<SessionState>,
    fallback_used: bool,
    tried: Vec<String>,
    degraded_warned: bool,
    cycles: u64,
    frames_saved: u64,
}

impl Session {
    pub fn new(
        config: VisionConfig,
        acquirer: SourceAcquirer,
        orchestrator: RecognitionOrchestrator,
        controls: Box<dyn ControlInput>,
        renderer: Box<dyn Renderer>,
    ) -> Self {
        Self {
            config,
            acquirer,
            orchestrator,
            controls,
            renderer,
            interrupt: Arc::new(AtomicBool::new(false)),
            registry: None,
            scheduler: FrameScheduler::new(),
            handle: None,
            state: SessionState::Init,
            states: vec![SessionState::Init],
            fallback_used: false,
            tried: Vec::new(),
            degraded_warned: false,
            cycles: 0,
            frames_saved: 0,
        }
    }

    /// Share an interrupt flag with other collaborators
    pub fn with_interrupt(mut self, interrupt: Arc<AtomicBool>) -> Self {
        self.interrupt = interrupt;
        self
    }

    /// Flag checked once per cycle; set it to stop the session
    pub fn interrupt_handle(&self) -> Arc<AtomicBool> {
        self.interrupt.clone()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Registry of the last run, once loaded
    pub fn registry(&self) -> Option<&IdentityRegistry> {
        self.registry.as_ref()
    }

    fn enter(&mut self, state: SessionState) {
        if self.state != state {
            debug!("Session {:?} -> {:?}", self.state, state);
            self.state = state;
            self.states.push(state);
        }
    }

    /// Run until quit, interrupt, end of stream or source exhaustion
    pub fn run(&mut self) -> Result<SessionReport, SessionError> {
        let descriptor = SourceDescriptor::parse(&self.config.source.descriptor)
            .map_err(|e| SessionError::Config(e.to_string()))?;

        let (registry, warning) =
            IdentityRegistry::load(self.config.registry.path.clone(), self.config.registry.match_threshold);
        if let Some(warning) = warning {
            warn!("{}; starting with an empty registry", warning);
        }
        info!("Loaded {} known identities", registry.len());
        self.registry = Some(registry);

        self.scheduler = FrameScheduler::from_config(&self.config.cadence, &self.orchestrator.available());

        match self.open_with_fallback(&descriptor) {
            Ok(handle) => self.handle = Some(handle),
            Err(e) => {
                self.shutdown();
                return Err(e);
            }
        }

        self.enter(SessionState::Running);
        let outcome = self.run_cycles();
        self.shutdown();

        let reason = outcome?;
        info!("Session closed after {} cycles ({:?})", self.cycles, reason);
        Ok(SessionReport {
            cycles: self.cycles,
            frames_saved: self.frames_saved,
            identities: self.registry.as_ref().map(IdentityRegistry::len).unwrap_or(0),
            reason,
            fallback_used: self.fallback_used,
            states: self.states.clone(),
        })
    }

    fn run_cycles(&mut self) -> Result<ShutdownReason, SessionError> {
        let mut fps = FpsMeter::default();

        loop {
            if self.interrupt.load(Ordering::Relaxed) {
                info!("Interrupted, shutting down");
                return Ok(ShutdownReason::Interrupted);
            }

            let Some(handle) = self.handle.as_mut() else {
                return Err(SessionError::SourceExhausted {
                    tried: self.tried.clone(),
                    suggestion: None,
                });
            };

            let read = match handle.read() {
                Ok(read) => read,
                Err(e) => match self.recover(e)? {
                    Recovery::Switched | Recovery::Continue => continue,
                    Recovery::Stop(reason) => return Ok(reason),
                },
            };

            if read.degraded.is_some() {
                self.degraded_warned = false;
            }
            if self.codec_grace_exhausted() {
                match self.codec_fallback()? {
                    Recovery::Switched => continue,
                    Recovery::Continue => {}
                    Recovery::Stop(reason) => return Ok(reason),
                }
            }

            self.cycles += 1;
            let frame = read.frame;
            let scheduled = self.scheduler.advance();
            let Some(registry) = self.registry.as_mut() else {
                return Err(SessionError::Config("registry not loaded".to_string()));
            };
            let annotations = self.orchestrator.process(&frame, &scheduled, registry);

            let status = SessionStatus {
                fps: fps.tick(Instant::now()),
                cycle: self.cycles,
                active: self.scheduler.active(),
                source: self.handle.as_ref().map(StreamHandle::kind).unwrap_or(SourceKind::Local),
                address: self.handle.as_ref().map(|h| h.address().to_string()).unwrap_or_default(),
                transport: self.handle.as_ref().and_then(StreamHandle::active_transport),
            };
            self.renderer.render(&frame, annotations, &status);

            while let Some(command) = self.controls.poll() {
                match command {
                    ControlCommand::Quit => {
                        info!("Quit requested");
                        return Ok(ShutdownReason::Quit);
                    }
                    ControlCommand::SaveFrame => self.save_frame(&frame),
                    ControlCommand::Toggle(kind) => self.toggle(kind),
                }
            }
        }
    }

    fn toggle(&mut self, kind: RecognizerKind) {
        self.enter(SessionState::PausedToggle);
        match self.scheduler.toggle(kind) {
            Some(true) => info!("{} recognition enabled", kind),
            Some(false) => {
                self.orchestrator.clear(kind);
                info!("{} recognition disabled", kind);
            }
            None => warn!("No {} recognizer is configured", kind),
        }
        self.enter(SessionState::Running);
    }

    fn save_frame(&mut self, frame: &Frame) {
        let name = format!("frame_{}_{}.jpg", Utc::now().timestamp(), self.cycles);
        let path: PathBuf = self.config.operator.capture_dir.join(name);
        match frame.save(&path) {
            Ok(()) => {
                self.frames_saved += 1;
                info!("Frame saved to {}", path.display());
            }
            Err(e) => warn!("Failed to save frame to {}: {}", path.display(), e),
        }
    }

    fn can_fall_back(&self) -> bool {
        self.config.source.fallback_enabled && !self.fallback_used
    }

    fn open_with_fallback(&mut self, descriptor: &SourceDescriptor) -> Result<StreamHandle, SessionError> {
        let error = match self.acquirer.open(descriptor) {
            Ok(handle) => return Ok(handle),
            Err(e) => e,
        };
        warn!("{}", error);
        self.tried.push(descriptor.address());

        let SourceDescriptor::Rtsp(address) = descriptor else {
            return Err(SessionError::SourceExhausted {
                tried: self.tried.clone(),
                suggestion: None,
            });
        };
        let alternative = http_fallback_for(address);

        match alternative {
            Some(alternative) if self.can_fall_back() => {
                self.open_fallback(alternative).ok_or_else(|| SessionError::SourceExhausted {
                    tried: self.tried.clone(),
                    suggestion: None,
                })
            }
            suggestion => Err(SessionError::SourceExhausted {
                tried: self.tried.clone(),
                suggestion,
            }),
        }
    }

    /// The single RTSP -> HTTP substitution
    fn open_fallback(&mut self, address: String) -> Option<StreamHandle> {
        self.fallback_used = true;
        info!("Falling back to {}", address);
        let descriptor = SourceDescriptor::Http(address);
        match self.acquirer.open(&descriptor) {
            Ok(handle) => Some(handle),
            Err(e) => {
                error!("Fallback failed: {}", e);
                self.tried.push(descriptor.address());
                None
            }
        }
    }

    /// Replace the current RTSP handle with its HTTP alternative
    fn switch_to_fallback(&mut self) -> Result<Recovery, SessionError> {
        let alternative = self.handle.as_ref().and_then(|h| h.fallback_address().map(str::to_string));
        if let Some(mut old) = self.handle.take() {
            self.tried.push(old.address().to_string());
            old.release();
        }

        let Some(alternative) = alternative else {
            return Err(SessionError::SourceExhausted {
                tried: self.tried.clone(),
                suggestion: None,
            });
        };
        match self.open_fallback(alternative) {
            Some(handle) => {
                self.handle = Some(handle);
                self.degraded_warned = false;
                Ok(Recovery::Switched)
            }
            None => Err(SessionError::SourceExhausted {
                tried: self.tried.clone(),
                suggestion: None,
            }),
        }
    }

    fn recover(&mut self, error: AcquireError) -> Result<Recovery, SessionError> {
        let is_rtsp = self.handle.as_ref().map(StreamHandle::kind) == Some(SourceKind::Rtsp);
        match error {
            AcquireError::DecodeStalled { address, failures } => {
                warn!("Decoding stalled on {} after {} failures", address, failures);
                if is_rtsp && self.can_fall_back() {
                    self.switch_to_fallback()
                } else {
                    Ok(Recovery::Stop(ShutdownReason::DecodeStalled { address, failures }))
                }
            }
            AcquireError::StreamEnded { address } => {
                info!("Stream {} ended", address);
                Ok(Recovery::Stop(ShutdownReason::StreamEnded { address }))
            }
            AcquireError::SourceUnavailable { address, reason } => {
                warn!("Source {} became unavailable: {}", address, reason);
                Ok(Recovery::Stop(ShutdownReason::StreamEnded { address }))
            }
        }
    }

    /// True once a degraded RTSP stream stayed dark past its grace period
    fn codec_grace_exhausted(&self) -> bool {
        let Some(handle) = self.handle.as_ref() else {
            return false;
        };
        if handle.kind() != SourceKind::Rtsp {
            return false;
        }
        let source = &self.config.source;
        handle.health().consecutive_dark_frames >= source.dark_frame_run.saturating_add(source.codec_grace_frames)
    }

    fn codec_fallback(&mut self) -> Result<Recovery, SessionError> {
        if self.can_fall_back() {
            warn!("Stream still dark after the grace period");
            return self.switch_to_fallback();
        }
        if !self.degraded_warned {
            let suggestion = self.handle.as_ref().and_then(StreamHandle::fallback_address).unwrap_or("-");
            warn!("Stream is still dark and no fallback is left; try {}", suggestion);
            self.degraded_warned = true;
        }
        Ok(Recovery::Continue)
    }

    fn shutdown(&mut self) {
        self.enter(SessionState::ShuttingDown);

        if let Some(registry) = self.registry.as_mut() {
            if let Err(e) = registry.flush() {
                match e {
                    RegistryError::WriteFailure { .. } => error!("{}; identities from this session are lost", e),
                    other => warn!("{}", other),
                }
            }
        }

        if let Some(mut handle) = self.handle.take() {
            handle.release();
            info!("Released {}", handle.address());
        }

        self.enter(SessionState::Closed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OperatorConfig;
    use crate::error::VisionError;
    use crate::orchestrator::{ManualClock, MockPrompter};
    use crate::source::http::MockHttpConnector;
    use crate::source::local::MockDeviceOpener;
    use crate::source::rtsp::MockRtspConnector;
    use crate::source::{FrameCapture, MockFrameCapture};
    use mockall::predicate::eq;
    use std::collections::VecDeque;
    use std::io::{Cursor, Read};
    use tempfile::TempDir;

    struct ScriptedControls(VecDeque<Option<ControlCommand>>);

    impl ControlInput for ScriptedControls {
        fn poll(&mut self) -> Option<ControlCommand> {
            self.0.pop_front().flatten()
        }
    }

    struct NullRenderer;

    impl Renderer for NullRenderer {
        fn render(&mut self, _frame: &Frame, _annotations: &AnnotationSet, _status: &SessionStatus) {}
    }

    fn mjpeg_body(parts: usize) -> Vec<u8> {
        let jpeg = Frame::solid(8, 8, [90, 90, 90]).unwrap().to_jpeg().unwrap();
        let mut body = Vec::new();
        for _ in 0..parts {
            body.extend_from_slice(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n");
            body.extend_from_slice(&jpeg);
            body.extend_from_slice(b"\r\n");
        }
        body
    }

    fn config(dir: &TempDir, descriptor: &str) -> VisionConfig {
        let mut config = VisionConfig::default();
        config.source.descriptor = descriptor.to_string();
        config.source.rtsp_attempt_timeout = Duration::from_millis(50);
        config.source.http_first_frame_wait = Duration::from_secs(2);
        config.registry.path = dir.path().join("identities.bin");
        config.operator = OperatorConfig {
            capture_dir: dir.path().join("captures"),
            ..OperatorConfig::default()
        };
        config
    }

    fn session(
        config: &VisionConfig,
        devices: MockDeviceOpener,
        http: MockHttpConnector,
        rtsp: MockRtspConnector,
        controls: Vec<Option<ControlCommand>>,
    ) -> Session {
        let acquirer =
            SourceAcquirer::with_backends(config.source.clone(), Box::new(devices), Box::new(http), Box::new(rtsp));
        let orchestrator = RecognitionOrchestrator::new(
            Vec::new(),
            config.recognizers.clone(),
            &config.operator,
            Box::new(MockPrompter::new()),
            Box::new(ManualClock::new()),
        );
        Session::new(
            config.clone(),
            acquirer,
            orchestrator,
            Box::new(ScriptedControls(controls.into_iter().collect())),
            Box::new(NullRenderer),
        )
    }

    fn endless_camera(value: u8) -> MockDeviceOpener {
        let mut devices = MockDeviceOpener::new();
        devices.expect_open().returning(move |_, _| {
            let mut capture = MockFrameCapture::new();
            capture
                .expect_grab()
                .returning(move || Ok(Some(Frame::solid(8, 8, [value, value, value]).unwrap())));
            Ok(Box::new(capture) as Box<dyn FrameCapture>)
        });
        devices
    }

    /// RTSP camera that answers over UDP, delivers one frame, then only fails to decode
    fn stalling_rtsp(address: &'static str) -> MockRtspConnector {
        let mut rtsp = MockRtspConnector::new();
        rtsp.expect_connect()
            .with(eq(address), eq(RtspTransport::Udp))
            .times(1)
            .returning(|_, _| {
                let mut delivered = false;
                let mut capture = MockFrameCapture::new();
                capture.expect_grab().returning(move || {
                    if delivered {
                        return Err(VisionError::Camera("corrupt packet".to_string()));
                    }
                    delivered = true;
                    Ok(Some(Frame::solid(8, 8, [128, 128, 128]).unwrap()))
                });
                Ok(Box::new(capture) as Box<dyn FrameCapture>)
            });
        rtsp
    }

    #[test]
    fn test_fps_meter_updates_every_half_second() {
        let start = Instant::now();
        let mut meter = FpsMeter::new(start);
        for i in 1..=9 {
            assert_eq!(meter.tick(start + Duration::from_millis(50 * i)), 0.0);
        }
        let fps = meter.tick(start + Duration::from_millis(500));
        assert!((fps - 20.0).abs() < 0.01);
    }

    #[test]
    fn test_http_end_of_stream_shuts_down_without_fallback() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir, "http://10.0.0.5:8080/video");

        let mut http = MockHttpConnector::new();
        http.expect_connect()
            .with(eq("http://10.0.0.5:8080/video"))
            .times(1)
            .returning(|_| Ok(Box::new(Cursor::new(mjpeg_body(3))) as Box<dyn Read + Send>));
        let mut rtsp = MockRtspConnector::new();
        rtsp.expect_connect().times(0);

        let mut session = session(&config, MockDeviceOpener::new(), http, rtsp, Vec::new());
        let report = session.run().unwrap();

        assert_eq!(
            report.reason,
            ShutdownReason::StreamEnded {
                address: "http://10.0.0.5:8080/video".to_string()
            }
        );
        assert!(report.cycles >= 1);
        assert!(!report.fallback_used);
        assert_eq!(
            report.states,
            vec![
                SessionState::Init,
                SessionState::Running,
                SessionState::ShuttingDown,
                SessionState::Closed
            ]
        );
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn test_unavailable_rtsp_falls_back_to_http_once() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir, "rtsp://192.168.0.107:8080/h264_ulaw.sdp");

        let mut rtsp = MockRtspConnector::new();
        rtsp.expect_connect()
            .times(2)
            .returning(|_, _| Err(VisionError::Camera("connection refused".to_string())));
        let mut http = MockHttpConnector::new();
        http.expect_connect()
            .with(eq("http://192.168.0.107:8080/video"))
            .times(1)
            .returning(|_| Ok(Box::new(Cursor::new(mjpeg_body(2))) as Box<dyn Read + Send>));

        let mut session = session(&config, MockDeviceOpener::new(), http, rtsp, Vec::new());
        let report = session.run().unwrap();
        assert!(report.fallback_used);
        assert!(matches!(report.reason, ShutdownReason::StreamEnded { .. }));
    }

    #[test]
    fn test_failed_fallback_exhausts_sources() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir, "rtsp://192.168.0.107:8080/h264_ulaw.sdp");

        let mut rtsp = MockRtspConnector::new();
        rtsp.expect_connect()
            .times(2)
            .returning(|_, _| Err(VisionError::Camera("connection refused".to_string())));
        let mut http = MockHttpConnector::new();
        http.expect_connect()
            .times(1)
            .returning(|_| Err(VisionError::Camera("HTTP 404 Not Found".to_string())));

        let mut session = session(&config, MockDeviceOpener::new(), http, rtsp, Vec::new());
        match session.run() {
            Err(SessionError::SourceExhausted { tried, .. }) => {
                assert_eq!(
                    tried,
                    vec![
                        "rtsp://192.168.0.107:8080/h264_ulaw.sdp".to_string(),
                        "http://192.168.0.107:8080/video".to_string()
                    ]
                );
            }
            other => panic!("expected SourceExhausted, got {:?}", other),
        }
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn test_disabled_fallback_suggests_alternative() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir, "rtsp://cam:8080/h264_ulaw.sdp");
        config.source.fallback_enabled = false;

        let mut rtsp = MockRtspConnector::new();
        rtsp.expect_connect()
            .returning(|_, _| Err(VisionError::Camera("connection refused".to_string())));
        let mut http = MockHttpConnector::new();
        http.expect_connect().times(0);

        let mut session = session(&config, MockDeviceOpener::new(), http, rtsp, Vec::new());
        let err = session.run().unwrap_err();
        assert!(err.to_string().contains("try http://cam:8080/video instead"));
    }

    #[test]
    fn test_controls_save_toggle_and_quit() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir, "0");
        let controls = vec![
            None,
            Some(ControlCommand::SaveFrame),
            None,
            Some(ControlCommand::Toggle(RecognizerKind::Text)),
            None,
            Some(ControlCommand::Quit),
        ];

        let mut session = session(&config, endless_camera(128), MockHttpConnector::new(), MockRtspConnector::new(), controls);
        let report = session.run().unwrap();

        assert_eq!(report.reason, ShutdownReason::Quit);
        assert_eq!(report.cycles, 4);
        assert_eq!(report.frames_saved, 1);
        assert!(report.states.contains(&SessionState::PausedToggle));
        assert_eq!(report.states.last(), Some(&SessionState::Closed));

        let saved: Vec<_> = std::fs::read_dir(dir.path().join("captures")).unwrap().collect();
        assert_eq!(saved.len(), 1);
    }

    #[test]
    fn test_interrupt_stops_before_first_cycle() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir, "0");
        let mut session = session(&config, endless_camera(128), MockHttpConnector::new(), MockRtspConnector::new(), Vec::new());
        session.interrupt_handle().store(true, Ordering::Relaxed);

        let report = session.run().unwrap();
        assert_eq!(report.reason, ShutdownReason::Interrupted);
        assert_eq!(report.cycles, 0);
    }

    #[test]
    fn test_dark_rtsp_switches_to_http_after_grace() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir, "rtsp://cam:8080/h264_ulaw.sdp");
        config.source.dark_frame_run = 3;
        config.source.codec_grace_frames = 2;

        let mut rtsp = MockRtspConnector::new();
        rtsp.expect_connect()
            .with(eq("rtsp://cam:8080/h264_ulaw.sdp"), eq(RtspTransport::Udp))
            .times(1)
            .returning(|_, _| {
                let mut capture = MockFrameCapture::new();
                capture
                    .expect_grab()
                    .returning(|| Ok(Some(Frame::solid(8, 8, [0, 0, 0]).unwrap())));
                Ok(Box::new(capture) as Box<dyn FrameCapture>)
            });
        let mut http = MockHttpConnector::new();
        http.expect_connect()
            .with(eq("http://cam:8080/video"))
            .times(1)
            .returning(|_| Ok(Box::new(Cursor::new(mjpeg_body(1))) as Box<dyn Read + Send>));

        let mut session = session(&config, MockDeviceOpener::new(), http, rtsp, Vec::new());
        let report = session.run().unwrap();

        assert!(report.fallback_used);
        assert_eq!(
            report.reason,
            ShutdownReason::StreamEnded {
                address: "http://cam:8080/video".to_string()
            }
        );
        assert_eq!(report.cycles, 5);
    }

    #[test]
    fn test_stalled_rtsp_decoding_switches_to_http() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir, "rtsp://cam:8080/h264_ulaw.sdp");
        config.source.max_consecutive_decode_failures = 3;

        let rtsp = stalling_rtsp("rtsp://cam:8080/h264_ulaw.sdp");
        let mut http = MockHttpConnector::new();
        http.expect_connect()
            .with(eq("http://cam:8080/video"))
            .times(1)
            .returning(|_| Ok(Box::new(Cursor::new(mjpeg_body(1))) as Box<dyn Read + Send>));

        let mut session = session(&config, MockDeviceOpener::new(), http, rtsp, Vec::new());
        let report = session.run().unwrap();

        assert!(report.fallback_used);
        assert_eq!(
            report.reason,
            ShutdownReason::StreamEnded {
                address: "http://cam:8080/video".to_string()
            }
        );
        assert!(report.cycles >= 2);
    }

    #[test]
    fn test_stalled_rtsp_with_failed_fallback_exhausts_sources() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir, "rtsp://cam:8080/h264_ulaw.sdp");
        config.source.max_consecutive_decode_failures = 3;

        let rtsp = stalling_rtsp("rtsp://cam:8080/h264_ulaw.sdp");
        let mut http = MockHttpConnector::new();
        http.expect_connect()
            .with(eq("http://cam:8080/video"))
            .times(1)
            .returning(|_| Err(VisionError::Camera("connection refused".to_string())));

        let mut session = session(&config, MockDeviceOpener::new(), http, rtsp, Vec::new());
        match session.run() {
            Err(SessionError::SourceExhausted { tried, suggestion }) => {
                assert_eq!(
                    tried,
                    vec![
                        "rtsp://cam:8080/h264_ulaw.sdp".to_string(),
                        "http://cam:8080/video".to_string()
                    ]
                );
                assert_eq!(suggestion, None);
            }
            other => panic!("expected SourceExhausted, got {:?}", other),
        }
        assert_eq!(session.state(), SessionState::Closed);
    }
}
