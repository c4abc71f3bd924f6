//! Configuration for vigil-eye

use crate::error::VisionError;
use crate::scheduler::RecognizerKind;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Durations written as (fractional) seconds, e.g. `http_first_frame_wait = 2.5`
mod seconds {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(duration.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(|_| D::Error::custom(format!("invalid duration: {} s", secs)))
    }
}

/// Video source settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Device index, `http://host:port/path` or `rtsp://host:port/path`
    pub descriptor: String,
    /// Requested capture resolution (width, height) for local devices
    pub resolution: (u32, u32),
    /// Requested frame rate for local devices
    pub frame_rate: u32,
    #[serde(with = "seconds")]
    pub http_connect_timeout: Duration,
    /// Bound on every HTTP body read; a silent server is noticed within it
    #[serde(with = "seconds")]
    pub http_read_timeout: Duration,
    /// How long `open` waits for the first HTTP frame
    #[serde(with = "seconds")]
    pub http_first_frame_wait: Duration,
    /// Interval between "still connecting" progress lines
    #[serde(with = "seconds")]
    pub http_progress_interval: Duration,
    /// Consecutive decode failures tolerated before `DecodeStalled`
    pub max_consecutive_decode_failures: u32,
    /// Bounded wait per RTSP transport attempt
    #[serde(with = "seconds")]
    pub rtsp_attempt_timeout: Duration,
    /// Frames whose mean luma is below this count as dark (0-255 scale)
    pub dark_luminance_threshold: f64,
    /// Consecutive dark frames before `CodecDegraded` is raised
    pub dark_frame_run: u32,
    /// Further dark frames tolerated after `CodecDegraded` before falling back
    pub codec_grace_frames: u32,
    /// Allow the one RTSP -> HTTP substitution per session
    pub fallback_enabled: bool,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            descriptor: "0".to_string(),
            resolution: (1280, 720),
            frame_rate: 30,
            http_connect_timeout: Duration::from_secs(5),
            http_read_timeout: Duration::from_secs(5),
            http_first_frame_wait: Duration::from_secs(5),
            http_progress_interval: Duration::from_secs(1),
            max_consecutive_decode_failures: 20,
            rtsp_attempt_timeout: Duration::from_secs(5),
            dark_luminance_threshold: 8.0,
            dark_frame_run: 30,
            codec_grace_frames: 60,
            fallback_enabled: true,
        }
    }
}

/// Identity registry settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub path: PathBuf,
    /// Euclidean distance under which an embedding matches a record
    pub match_threshold: f32,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        let path = dirs::home_dir()
            .map(|mut p| {
                p.push(".vigil");
                p.push("identities.bin");
                p
            })
            .unwrap_or_else(|| PathBuf::from("./data/identities.bin"));

        Self {
            path,
            match_threshold: 0.5,
        }
    }
}

/// Run period of one recognizer, in frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CadenceEntry {
    pub period: u32,
    pub enabled: bool,
}

impl Default for CadenceEntry {
    fn default() -> Self {
        Self { period: 1, enabled: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CadenceConfig {
    pub faces: CadenceEntry,
    pub objects: CadenceEntry,
    pub text: CadenceEntry,
}

impl Default for CadenceConfig {
    fn default() -> Self {
        Self {
            faces: CadenceEntry { period: 2, enabled: true },
            objects: CadenceEntry { period: 3, enabled: true },
            text: CadenceEntry { period: 10, enabled: true },
        }
    }
}

impl CadenceConfig {
    pub fn get(&self, kind: RecognizerKind) -> CadenceEntry {
        match kind {
            RecognizerKind::Faces => self.faces,
            RecognizerKind::Objects => self.objects,
            RecognizerKind::Text => self.text,
        }
    }

    pub fn get_mut(&mut self, kind: RecognizerKind) -> &mut CadenceEntry {
        match kind {
            RecognizerKind::Faces => &mut self.faces,
            RecognizerKind::Objects => &mut self.objects,
            RecognizerKind::Text => &mut self.text,
        }
    }
}

/// Settings for one external recognizer service
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecognizerSettings {
    /// HTTP endpoint of the model service; `None` leaves the recognizer out
    pub endpoint: Option<String>,
    #[serde(with = "seconds")]
    pub timeout: Duration,
    /// Detections below this confidence are dropped
    pub confidence_threshold: f32,
    /// Keep at most this many detections per frame (highest confidence first)
    pub max_per_frame: usize,
}

impl Default for RecognizerSettings {
    fn default() -> Self {
        Self {
            endpoint: None,
            timeout: Duration::from_secs(2),
            confidence_threshold: 0.0,
            max_per_frame: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecognizersConfig {
    pub faces: RecognizerSettings,
    pub objects: RecognizerSettings,
    pub text: RecognizerSettings,
    /// Text regions narrower than this are treated as noise
    pub min_text_width: f32,
    /// Text regions shorter than this are treated as noise
    pub min_text_height: f32,
}

impl Default for RecognizersConfig {
    fn default() -> Self {
        Self {
            faces: RecognizerSettings {
                max_per_frame: 10,
                ..Default::default()
            },
            objects: RecognizerSettings {
                confidence_threshold: 0.5,
                max_per_frame: 100,
                ..Default::default()
            },
            text: RecognizerSettings {
                confidence_threshold: 0.3,
                max_per_frame: 50,
                ..Default::default()
            },
            min_text_width: 20.0,
            min_text_height: 15.0,
        }
    }
}

impl RecognizersConfig {
    pub fn get(&self, kind: RecognizerKind) -> &RecognizerSettings {
        match kind {
            RecognizerKind::Faces => &self.faces,
            RecognizerKind::Objects => &self.objects,
            RecognizerKind::Text => &self.text,
        }
    }
}

/// Operator interaction settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OperatorConfig {
    /// Minimum time between two naming prompts, across all unknown faces
    #[serde(with = "seconds")]
    pub prompt_cooldown: Duration,
    /// Minimum time between two "known face" status lines
    #[serde(with = "seconds")]
    pub log_cooldown: Duration,
    /// Where save-frame writes its JPEGs
    pub capture_dir: PathBuf,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            prompt_cooldown: Duration::from_secs(30),
            log_cooldown: Duration::from_secs(5),
            capture_dir: PathBuf::from("logs"),
        }
    }
}

/// Vision pipeline configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VisionConfig {
    pub source: SourceConfig,
    pub registry: RegistryConfig,
    pub cadence: CadenceConfig,
    pub recognizers: RecognizersConfig,
    pub operator: OperatorConfig,
}

impl VisionConfig {
    /// Load configuration from a TOML or JSON file
    pub fn from_file(path: &Path) -> Result<Self, VisionError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| VisionError::Config(format!("Failed to read {}: {}", path.display(), e)))?;
        Self::from_str(&content)
    }

    /// Parse configuration, trying JSON first and TOML second
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self, VisionError> {
        if let Ok(config) = serde_json::from_str::<VisionConfig>(content) {
            return Ok(config);
        }

        toml::from_str::<VisionConfig>(content)
            .map_err(|e| VisionError::Config(format!("Unrecognized configuration: {}", e)))
    }

    /// Apply `VIGIL_*` environment overrides
    pub fn apply_env(&mut self) {
        if let Ok(source) = std::env::var("VIGIL_SOURCE") {
            self.source.descriptor = source;
        }

        if let Ok(path) = std::env::var("VIGIL_REGISTRY") {
            self.registry.path = PathBuf::from(path);
        }

        if let Ok(dir) = std::env::var("VIGIL_CAPTURE_DIR") {
            self.operator.capture_dir = PathBuf::from(dir);
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        let source = &self.source;
        if source.descriptor.trim().is_empty() {
            return Err("Source descriptor must not be empty".to_string());
        }

        if source.frame_rate == 0 || source.frame_rate > 120 {
            return Err("Frame rate must be between 1 and 120".to_string());
        }

        if source.resolution.0 == 0 || source.resolution.1 == 0 {
            return Err("Resolution must be non-zero".to_string());
        }

        if source.resolution.0 > 7680 || source.resolution.1 > 4320 {
            return Err("Resolution too large (max 8K)".to_string());
        }

        if source.max_consecutive_decode_failures == 0 {
            return Err("Decode failure budget must be at least 1".to_string());
        }

        if source.dark_frame_run == 0 {
            return Err("Dark frame run must be at least 1".to_string());
        }

        if !source.dark_luminance_threshold.is_finite() || source.dark_luminance_threshold < 0.0 {
            return Err("Dark luminance threshold must be a finite, non-negative value".to_string());
        }

        if source.rtsp_attempt_timeout.is_zero()
            || source.http_first_frame_wait.is_zero()
            || source.http_read_timeout.is_zero()
        {
            return Err("Source timeouts must be non-zero".to_string());
        }

        let threshold = self.registry.match_threshold;
        if !threshold.is_finite() || threshold <= 0.0 {
            return Err("Match threshold must be a positive, finite value".to_string());
        }

        for kind in RecognizerKind::ALL {
            if self.cadence.get(kind).period == 0 {
                return Err(format!("Cadence period for {} must be at least 1", kind));
            }

            let settings = self.recognizers.get(kind);
            if !settings.confidence_threshold.is_finite()
                || !(0.0..=1.0).contains(&settings.confidence_threshold)
            {
                return Err(format!("Confidence threshold for {} must be within 0..=1", kind));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = VisionConfig::default();
        assert_eq!(config.source.descriptor, "0");
        assert_eq!(config.source.frame_rate, 30);
        assert_eq!(config.source.dark_frame_run, 30);
        assert_eq!(config.cadence.faces.period, 2);
        assert_eq!(config.cadence.objects.period, 3);
        assert_eq!(config.cadence.text.period, 10);
        assert_eq!(config.recognizers.objects.confidence_threshold, 0.5);
        assert_eq!(config.recognizers.text.max_per_frame, 50);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_from_toml() {
        let config = VisionConfig::from_str(
            r#"
            [source]
            descriptor = "rtsp://192.168.0.107:8080/h264_ulaw.sdp"
            dark_frame_run = 45

            [cadence.text]
            period = 20
            enabled = false

            [operator]
            capture_dir = "captures"
            "#,
        )
        .unwrap();

        assert_eq!(config.source.descriptor, "rtsp://192.168.0.107:8080/h264_ulaw.sdp");
        assert_eq!(config.source.dark_frame_run, 45);
        assert_eq!(config.source.frame_rate, 30);
        assert_eq!(config.cadence.text, CadenceEntry { period: 20, enabled: false });
        assert_eq!(config.cadence.faces.period, 2);
        assert_eq!(config.operator.capture_dir, PathBuf::from("captures"));
    }

    #[test]
    fn test_config_durations_are_seconds() {
        let config = VisionConfig::from_str(
            r#"
            [source]
            http_first_frame_wait = 2.5
            rtsp_attempt_timeout = 3

            [recognizers.faces]
            timeout = 0.75

            [operator]
            prompt_cooldown = 45
            "#,
        )
        .unwrap();

        assert_eq!(config.source.http_first_frame_wait, Duration::from_millis(2500));
        assert_eq!(config.source.rtsp_attempt_timeout, Duration::from_secs(3));
        assert_eq!(config.source.http_read_timeout, Duration::from_secs(5));
        assert_eq!(config.recognizers.faces.timeout, Duration::from_millis(750));
        assert_eq!(config.operator.prompt_cooldown, Duration::from_secs(45));
        assert_eq!(config.operator.log_cooldown, Duration::from_secs(5));

        let written = toml::to_string(&config).unwrap();
        assert!(written.contains("http_first_frame_wait = 2.5"));
        assert!(VisionConfig::from_str("[source]\nrtsp_attempt_timeout = -1").is_err());
    }

    #[test]
    fn test_config_from_json() {
        let config = VisionConfig::from_str(r#"{"registry": {"match_threshold": 0.4}}"#).unwrap();
        assert_eq!(config.registry.match_threshold, 0.4);
    }

    #[test]
    fn test_config_from_garbage() {
        assert!(VisionConfig::from_str("this is [not valid").is_err());
    }

    #[test]
    fn test_config_validation_frame_rate() {
        let mut config = VisionConfig::default();
        config.source.frame_rate = 0;
        assert!(config.validate().is_err());
        config.source.frame_rate = 121;
        assert!(config.validate().is_err());
        config.source.frame_rate = 120;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation_resolution() {
        let mut config = VisionConfig::default();
        config.source.resolution = (0, 480);
        assert!(config.validate().is_err());
        config.source.resolution = (7681, 4320);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_zero_cadence() {
        let mut config = VisionConfig::default();
        config.cadence.objects.period = 0;
        let err = config.validate().unwrap_err();
        assert!(err.contains("objects"));
    }

    #[test]
    fn test_config_validation_thresholds() {
        let mut config = VisionConfig::default();
        config.registry.match_threshold = f32::NAN;
        assert!(config.validate().is_err());

        let mut config = VisionConfig::default();
        config.recognizers.text.confidence_threshold = 1.5;
        assert!(config.validate().is_err());

        let mut config = VisionConfig::default();
        config.source.dark_frame_run = 0;
        assert!(config.validate().is_err());

        let mut config = VisionConfig::default();
        config.source.max_consecutive_decode_failures = 0;
        assert!(config.validate().is_err());
    }
}
