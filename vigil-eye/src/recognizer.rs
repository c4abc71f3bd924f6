//! Recognizer collaborators
//!
//! Face, object and text recognition are external services. The
//! orchestrator sees all three through [`Recognizer`].

use crate::config::{RecognizerSettings, RecognizersConfig};
use crate::error::VisionError;
use crate::frame::{BoundingBox, Frame};
use crate::scheduler::RecognizerKind;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use tracing::{debug, info};

fn full_confidence() -> f32 {
    1.0
}

/// One raw detection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub region: BoundingBox,
    #[serde(default = "full_confidence")]
    pub confidence: f32,
    /// Face identity features
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
    /// Recognized text
    #[serde(default)]
    pub text: Option<String>,
    /// Object class name
    #[serde(default)]
    pub label: Option<String>,
}

impl Detection {
    pub fn new(region: BoundingBox, confidence: f32) -> Self {
        Self {
            region,
            confidence,
            embedding: None,
            text: None,
            label: None,
        }
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

/// External detection model
#[cfg_attr(test, mockall::automock)]
pub trait Recognizer: Send {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>, VisionError>;
}

/// Overlap above which two same-class detections count as one
const DUPLICATE_IOU: f32 = 0.4;

/// Keep the most confident of each group of overlapping same-class
/// detections. Input must be sorted by descending confidence.
fn suppress_duplicates(detections: Vec<Detection>) -> Vec<Detection> {
    let mut kept: Vec<Detection> = Vec::with_capacity(detections.len());
    for detection in detections {
        let duplicate = kept
            .iter()
            .any(|k| k.label == detection.label && k.region.iou(&detection.region) > DUPLICATE_IOU);
        if !duplicate {
            kept.push(detection);
        }
    }
    kept
}

/// Drop low-confidence and undersized detections, merge overlapping
/// duplicates, then keep the highest-confidence ones up to the per-frame cap
pub fn filter_detections(
    kind: RecognizerKind,
    mut detections: Vec<Detection>,
    config: &RecognizersConfig,
) -> Vec<Detection> {
    let settings = config.get(kind);
    let before = detections.len();

    detections.retain(|d| d.confidence.is_finite() && d.confidence >= settings.confidence_threshold);
    if kind == RecognizerKind::Text {
        detections.retain(|d| d.region.width >= config.min_text_width && d.region.height >= config.min_text_height);
    }

    detections.sort_by(|a, b| b.confidence.partial_cmp(&a.confidence).unwrap_or(Ordering::Equal));
    let mut detections = suppress_duplicates(detections);
    detections.truncate(settings.max_per_frame);

    if detections.len() != before {
        debug!("{} filter kept {} of {} detections", kind, detections.len(), before);
    }
    detections
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DetectResponse {
    List(Vec<Detection>),
    Wrapped { detections: Vec<Detection> },
}

/// Parse a model service reply: a JSON list or `{"detections": [...]}`
pub fn parse_detections(body: &[u8]) -> Result<Vec<Detection>, VisionError> {
    match serde_json::from_slice::<DetectResponse>(body) {
        Ok(DetectResponse::List(detections)) | Ok(DetectResponse::Wrapped { detections }) => Ok(detections),
        Err(e) => Err(VisionError::Serialization(format!("Invalid detection response: {}", e))),
    }
}

/// Recognizer backed by an HTTP model service.
///
/// Each call posts the frame as a JPEG and expects a JSON reply.
pub struct HttpRecognizer {
    kind: RecognizerKind,
    endpoint: String,
    client: reqwest::blocking::Client,
}

impl HttpRecognizer {
    pub fn new(kind: RecognizerKind, endpoint: impl Into<String>, settings: &RecognizerSettings) -> Result<Self, VisionError> {
        let client = reqwest::blocking::Client::builder().timeout(settings.timeout).build()?;
        Ok(Self {
            kind,
            endpoint: endpoint.into(),
            client,
        })
    }

    pub fn kind(&self) -> RecognizerKind {
        self.kind
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl Recognizer for HttpRecognizer {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>, VisionError> {
        let jpeg = frame.to_jpeg()?;
        let response = self
            .client
            .post(&self.endpoint)
            .header(reqwest::header::CONTENT_TYPE, "image/jpeg")
            .body(jpeg)
            .send()?;

        let status = response.status();
        if !status.is_success() {
            return Err(VisionError::Model(format!(
                "{} service at {} returned {}",
                self.kind, self.endpoint, status
            )));
        }
        parse_detections(&response.bytes()?)
    }
}

/// HTTP recognizers for every kind with a configured endpoint
pub fn recognizers_from_config(
    config: &RecognizersConfig,
) -> Result<Vec<(RecognizerKind, Box<dyn Recognizer>)>, VisionError> {
    let mut recognizers: Vec<(RecognizerKind, Box<dyn Recognizer>)> = Vec::new();
    for kind in RecognizerKind::ALL {
        let settings = config.get(kind);
        if let Some(endpoint) = &settings.endpoint {
            info!("{} recognizer at {}", kind, endpoint);
            recognizers.push((kind, Box::new(HttpRecognizer::new(kind, endpoint.clone(), settings)?)));
        }
    }
    Ok(recognizers)
}
