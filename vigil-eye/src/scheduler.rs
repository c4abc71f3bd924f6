//! Per-frame recognizer scheduling
//!
//! Each recognizer runs on its own cadence. The scheduler is pure counter
//! logic: no clocks, no I/O.

use crate::config::CadenceConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// The three recognition stages
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecognizerKind {
    Faces,
    Objects,
    Text,
}

impl RecognizerKind {
    pub const ALL: [RecognizerKind; 3] = [RecognizerKind::Faces, RecognizerKind::Objects, RecognizerKind::Text];

    pub fn name(&self) -> &'static str {
        match self {
            RecognizerKind::Faces => "faces",
            RecognizerKind::Objects => "objects",
            RecognizerKind::Text => "text",
        }
    }
}

impl fmt::Display for RecognizerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for RecognizerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "faces" | "face" => Ok(RecognizerKind::Faces),
            "objects" | "object" => Ok(RecognizerKind::Objects),
            "text" | "ocr" => Ok(RecognizerKind::Text),
            other => Err(format!("Unknown recognizer '{}'", other)),
        }
    }
}

/// Cadence state of one recognizer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecognitionCadence {
    pub kind: RecognizerKind,
    pub period_in_frames: u32,
    pub frames_since_last_run: u32,
    pub enabled: bool,
}

impl RecognitionCadence {
    pub fn new(kind: RecognizerKind, period_in_frames: u32) -> Self {
        Self {
            kind,
            period_in_frames: period_in_frames.max(1),
            frames_since_last_run: 0,
            enabled: true,
        }
    }

    /// Count one frame; true when the recognizer is due this cycle
    fn tick(&mut self) -> bool {
        if !self.enabled {
            return false;
        }
        self.frames_since_last_run += 1;
        if self.frames_since_last_run >= self.period_in_frames {
            self.frames_since_last_run = 0;
            true
        } else {
            false
        }
    }
}

/// Recognizers selected for one cycle
pub type ScheduledSet = BTreeSet<RecognizerKind>;

/// Decides which recognizers run on each frame
#[derive(Debug, Clone, Default)]
pub struct FrameScheduler {
    cadences: Vec<RecognitionCadence>,
}

impl FrameScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from configuration, registering only the given kinds
    pub fn from_config(config: &CadenceConfig, available: &[RecognizerKind]) -> Self {
        let mut scheduler = Self::new();
        for kind in RecognizerKind::ALL {
            if !available.contains(&kind) {
                continue;
            }
            let entry = config.get(kind);
            scheduler.register(kind, entry.period);
            scheduler.set_enabled(kind, entry.enabled);
        }
        scheduler
    }

    /// Add a recognizer, or change the period of one already registered
    pub fn register(&mut self, kind: RecognizerKind, period_in_frames: u32) {
        match self.cadences.iter_mut().find(|c| c.kind == kind) {
            Some(cadence) => cadence.period_in_frames = period_in_frames.max(1),
            None => self.cadences.push(RecognitionCadence::new(kind, period_in_frames)),
        }
    }

    /// Advance every enabled cadence by one frame and return the due set
    pub fn advance(&mut self) -> ScheduledSet {
        self.cadences
            .iter_mut()
            .filter_map(|c| c.tick().then_some(c.kind))
            .collect()
    }

    /// Enable or disable a recognizer. Disabled cadences keep their counter
    /// untouched until re-enabled. Returns false for unknown recognizers.
    pub fn set_enabled(&mut self, kind: RecognizerKind, enabled: bool) -> bool {
        match self.cadences.iter_mut().find(|c| c.kind == kind) {
            Some(cadence) => {
                cadence.enabled = enabled;
                true
            }
            None => false,
        }
    }

    /// Flip a recognizer's enabled flag; returns the new state
    pub fn toggle(&mut self, kind: RecognizerKind) -> Option<bool> {
        let cadence = self.cadences.iter_mut().find(|c| c.kind == kind)?;
        cadence.enabled = !cadence.enabled;
        Some(cadence.enabled)
    }

    pub fn is_enabled(&self, kind: RecognizerKind) -> bool {
        self.cadences.iter().any(|c| c.kind == kind && c.enabled)
    }

    /// Currently enabled recognizers
    pub fn active(&self) -> Vec<RecognizerKind> {
        self.cadences.iter().filter(|c| c.enabled).map(|c| c.kind).collect()
    }

    pub fn cadence(&self, kind: RecognizerKind) -> Option<&RecognitionCadence> {
        self.cadences.iter().find(|c| c.kind == kind)
    }
}
