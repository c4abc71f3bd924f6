//! vigil-eye: frame scheduling and stream resilience for a live
//! face, object and text annotation pipeline
//!
//! Frames come from a local camera, an HTTP/MJPEG endpoint or an RTSP
//! stream. Each cycle the scheduler picks which recognizers run, the
//! orchestrator merges their detections and identifies faces against a
//! durable registry, and the session loop renders, handles operator
//! commands and falls back from RTSP to HTTP when a stream will not decode.

pub mod config;
pub mod error;
pub mod frame;
pub mod orchestrator;
pub mod recognizer;
pub mod registry;
pub mod scheduler;
pub mod session;
pub mod source;

pub use config::VisionConfig;
pub use error::{AcquireError, RegistryError, SessionError, VisionError};
pub use frame::{BoundingBox, Frame};
pub use orchestrator::{Annotation, AnnotationSet, Clock, FaceIdentity, Prompter, RecognitionOrchestrator, SystemClock};
pub use recognizer::{Detection, HttpRecognizer, Recognizer};
pub use registry::{IdentityRecord, IdentityRegistry, Registration};
pub use scheduler::{FrameScheduler, RecognizerKind, ScheduledSet};
pub use session::{ControlCommand, ControlInput, Renderer, Session, SessionReport, SessionStatus, ShutdownReason};
pub use source::{SourceAcquirer, SourceDescriptor, SourceKind, StreamHandle};
