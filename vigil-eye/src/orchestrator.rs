//! Recognition orchestration
//!
//! Runs the recognizers the scheduler selected, merges their output into
//! one [`AnnotationSet`] and drives face identification: registry lookup,
//! the rate-limited naming prompt and the rate-limited "known" status line.
//!
//! Annotations are sticky: a recognizer that was not scheduled this cycle
//! keeps the annotations of its last run.

use crate::config::{OperatorConfig, RecognizersConfig};
use crate::error::RegistryError;
use crate::frame::{BoundingBox, Frame};
use crate::recognizer::{filter_detections, Detection, Recognizer};
use crate::registry::{IdentityRegistry, Registration};
use crate::scheduler::{RecognizerKind, ScheduledSet};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Monotonic time source
pub trait Clock: Send {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to. Clones share the same time.
#[derive(Debug, Clone)]
pub struct ManualClock {
    origin: Instant,
    offset: Arc<Mutex<Duration>>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            offset: Arc::new(Mutex::new(Duration::ZERO)),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.offset.lock() += by;
    }

    pub fn elapsed(&self) -> Duration {
        *self.offset.lock()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + *self.offset.lock()
    }
}

/// Asks the operator to name an unknown face.
///
/// `face` holds the pixels under `region`. An empty answer means "skip".
/// The frame cycle is suspended until this returns.
#[cfg_attr(test, mockall::automock)]
pub trait Prompter: Send {
    fn request_label(&mut self, face: &Frame, region: &BoundingBox) -> String;
}

/// Global cooldown shared by every event of one kind
#[derive(Debug, Clone)]
pub struct CooldownGate {
    cooldown: Duration,
    last: Option<Instant>,
}

impl CooldownGate {
    pub fn new(cooldown: Duration) -> Self {
        Self { cooldown, last: None }
    }

    pub fn is_ready(&self, now: Instant) -> bool {
        match self.last {
            Some(last) => now.saturating_duration_since(last) >= self.cooldown,
            None => true,
        }
    }

    pub fn mark(&mut self, now: Instant) {
        self.last = Some(now);
    }

    pub fn last(&self) -> Option<Instant> {
        self.last
    }
}

/// Cooldown for the "known face" line. Faces reappearing after a cycle
/// without faces always log.
#[derive(Debug, Clone)]
pub struct LogGate {
    gate: CooldownGate,
    faces_present: bool,
}

impl LogGate {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            gate: CooldownGate::new(cooldown),
            faces_present: false,
        }
    }

    /// Record one face pass; true if a status line with `known` faces
    /// should be emitted now
    pub fn observe(&mut self, now: Instant, faces_present: bool, known: usize) -> bool {
        let appeared = faces_present && !self.faces_present;
        self.faces_present = faces_present;

        if known == 0 || !(appeared || self.gate.is_ready(now)) {
            return false;
        }
        self.gate.mark(now);
        true
    }
}

/// Identity attached to a face annotation
#[derive(Debug, Clone, PartialEq)]
pub enum FaceIdentity {
    Known { label: String, distance: f32 },
    Unknown,
}

/// One item for the renderer
#[derive(Debug, Clone, PartialEq)]
pub struct Annotation {
    pub kind: RecognizerKind,
    pub region: BoundingBox,
    pub confidence: f32,
    /// Text to draw next to the region
    pub caption: String,
    pub identity: Option<FaceIdentity>,
}

impl Annotation {
    fn from_detection(kind: RecognizerKind, detection: &Detection) -> Self {
        let caption = match kind {
            RecognizerKind::Faces => "Unknown".to_string(),
            RecognizerKind::Objects => detection.label.clone().unwrap_or_else(|| "object".to_string()),
            RecognizerKind::Text => detection.text.clone().unwrap_or_default(),
        };
        Self {
            kind,
            region: detection.region,
            confidence: detection.confidence,
            caption,
            identity: None,
        }
    }

    fn face(detection: &Detection, identity: FaceIdentity) -> Self {
        let caption = match &identity {
            FaceIdentity::Known { label, .. } => label.clone(),
            FaceIdentity::Unknown => "Unknown".to_string(),
        };
        Self {
            kind: RecognizerKind::Faces,
            region: detection.region,
            confidence: detection.confidence,
            caption,
            identity: Some(identity),
        }
    }
}

/// Latest annotations per recognizer
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnnotationSet {
    by_kind: BTreeMap<RecognizerKind, Vec<Annotation>>,
}

impl AnnotationSet {
    pub fn get(&self, kind: RecognizerKind) -> &[Annotation] {
        self.by_kind.get(&kind).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn iter(&self) -> impl Iterator<Item = &Annotation> {
        self.by_kind.values().flatten()
    }

    pub fn len(&self) -> usize {
        self.by_kind.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn replace(&mut self, kind: RecognizerKind, annotations: Vec<Annotation>) {
        self.by_kind.insert(kind, annotations);
    }

    fn clear(&mut self, kind: RecognizerKind) {
        self.by_kind.remove(&kind);
    }
}

/// Counters over a session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OrchestratorStats {
    pub prompts: u64,
    pub registrations: u64,
    pub skipped_registrations: u64,
    pub known_logs: u64,
    pub recognizer_errors: u64,
}

/// Calls recognizers and merges their results
pub struct RecognitionOrchestrator {
    recognizers: BTreeMap<RecognizerKind, Box<dyn Recognizer>>,
    config: RecognizersConfig,
    prompter: Box<dyn Prompter>,
    clock: Box<dyn Clock>,
    prompt_gate: CooldownGate,
    log_gate: LogGate,
    annotations: AnnotationSet,
    stats: OrchestratorStats,
}

impl RecognitionOrchestrator {
    pub fn new(
        recognizers: Vec<(RecognizerKind, Box<dyn Recognizer>)>,
        config: RecognizersConfig,
        operator: &OperatorConfig,
        prompter: Box<dyn Prompter>,
        clock: Box<dyn Clock>,
    ) -> Self {
        Self {
            recognizers: recognizers.into_iter().collect(),
            config,
            prompter,
            clock,
            prompt_gate: CooldownGate::new(operator.prompt_cooldown),
            log_gate: LogGate::new(operator.log_cooldown),
            annotations: AnnotationSet::default(),
            stats: OrchestratorStats::default(),
        }
    }

    /// Kinds that have a recognizer attached
    pub fn available(&self) -> Vec<RecognizerKind> {
        self.recognizers.keys().copied().collect()
    }

    pub fn annotations(&self) -> &AnnotationSet {
        &self.annotations
    }

    pub fn stats(&self) -> OrchestratorStats {
        self.stats
    }

    /// Drop the annotations of a recognizer that was switched off
    pub fn clear(&mut self, kind: RecognizerKind) {
        self.annotations.clear(kind);
    }

    /// Run the scheduled recognizers on `frame`.
    ///
    /// A failing recognizer yields no detections for this cycle; the
    /// others are unaffected.
    pub fn process(&mut self, frame: &Frame, scheduled: &ScheduledSet, registry: &mut IdentityRegistry) -> &AnnotationSet {
        for &kind in scheduled {
            let Some(recognizer) = self.recognizers.get_mut(&kind) else {
                continue;
            };

            let detections = match recognizer.detect(frame) {
                Ok(detections) => filter_detections(kind, detections, &self.config),
                Err(e) => {
                    warn!("{} recognizer failed: {}", kind, e);
                    self.stats.recognizer_errors += 1;
                    Vec::new()
                }
            };

            let annotations = match kind {
                RecognizerKind::Faces => self.identify_faces(frame, &detections, registry),
                _ => detections.iter().map(|d| Annotation::from_detection(kind, d)).collect(),
            };
            self.annotations.replace(kind, annotations);
        }

        &self.annotations
    }

    fn identify_faces(&mut self, frame: &Frame, detections: &[Detection], registry: &mut IdentityRegistry) -> Vec<Annotation> {
        let mut annotations = Vec::with_capacity(detections.len());

        for detection in detections {
            let identity = match &detection.embedding {
                None => FaceIdentity::Unknown,
                Some(embedding) => match registry.match_embedding(embedding) {
                    Some((label, distance)) => FaceIdentity::Known {
                        label: label.to_string(),
                        distance,
                    },
                    None => self.maybe_prompt(frame, detection, embedding, registry),
                },
            };
            annotations.push(Annotation::face(detection, identity));
        }

        let known: Vec<&str> = annotations
            .iter()
            .filter_map(|a| match &a.identity {
                Some(FaceIdentity::Known { label, .. }) => Some(label.as_str()),
                _ => None,
            })
            .collect();
        if self.log_gate.observe(self.clock.now(), !annotations.is_empty(), known.len()) {
            info!("Recognized: {}", known.join(", "));
            self.stats.known_logs += 1;
        }

        annotations
    }

    fn maybe_prompt(
        &mut self,
        frame: &Frame,
        detection: &Detection,
        embedding: &[f32],
        registry: &mut IdentityRegistry,
    ) -> FaceIdentity {
        if !self.prompt_gate.is_ready(self.clock.now()) {
            return FaceIdentity::Unknown;
        }

        info!("Unknown face detected, asking for a name");
        self.stats.prompts += 1;
        let face = match frame.crop(&detection.region) {
            Ok(face) => face,
            Err(e) => {
                debug!("Showing the whole frame for {:?}: {}", detection.region, e);
                frame.clone()
            }
        };
        let label = self.prompter.request_label(&face, &detection.region);
        self.prompt_gate.mark(self.clock.now());

        match registry.register(embedding.to_vec(), &label) {
            Ok(Registration::Stored(record)) | Ok(Registration::Merged(record)) => {
                self.stats.registrations += 1;
                FaceIdentity::Known {
                    label: record.label,
                    distance: 0.0,
                }
            }
            Ok(Registration::Skipped) => {
                info!("Skipped naming unknown face");
                self.stats.skipped_registrations += 1;
                FaceIdentity::Unknown
            }
            Err(RegistryError::WriteFailure { path, reason }) => {
                warn!(
                    "Identity '{}' kept in memory only, registry persistence is broken ({}: {})",
                    label.trim(),
                    path,
                    reason
                );
                self.stats.registrations += 1;
                FaceIdentity::Known {
                    label: label.trim().to_string(),
                    distance: 0.0,
                }
            }
            Err(e) => {
                warn!("Could not register face: {}", e);
                FaceIdentity::Unknown
            }
        }
    }
}
