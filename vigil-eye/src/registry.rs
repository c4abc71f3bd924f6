//! Durable face identity registry
//!
//! Records live in memory in insertion order and are written to a single
//! bincode file after every mutation. Writes go to a temporary file that is
//! synced and then renamed over the previous one, so an interrupted write
//! leaves the last complete registry in place.

use crate::error::RegistryError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const REGISTRY_VERSION: u32 = 1;

/// One stored identity
#[derive(Debug, Clone, PartialEq)]
pub struct IdentityRecord {
    pub embedding: Vec<f32>,
    pub label: String,
    pub created_at: DateTime<Utc>,
}

/// On-disk layout: parallel lists plus a write timestamp
#[derive(Debug, Serialize, Deserialize)]
struct RegistryFile {
    version: u32,
    embeddings: Vec<Vec<f32>>,
    labels: Vec<String>,
    created_at: Vec<DateTime<Utc>>,
    written_at: DateTime<Utc>,
}

/// Result of a registration attempt
#[derive(Debug, Clone, PartialEq)]
pub enum Registration {
    /// A new record was appended
    Stored(IdentityRecord),
    /// The same label already holds a record within the match threshold
    Merged(IdentityRecord),
    /// Empty label: seen, intentionally not stored
    Skipped,
}

/// Summary for status output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryStats {
    pub records: usize,
    pub labels: Vec<String>,
}

/// Euclidean distance between two embeddings of equal length
pub fn embedding_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum::<f32>()
        .sqrt()
}

/// Identity store keyed by embedding distance
pub struct IdentityRegistry {
    path: PathBuf,
    threshold: f32,
    records: Vec<IdentityRecord>,
    dirty: bool,
}

impl IdentityRegistry {
    /// Empty registry that will persist to `path`
    pub fn new(path: impl Into<PathBuf>, threshold: f32) -> Self {
        Self {
            path: path.into(),
            threshold,
            records: Vec::new(),
            dirty: false,
        }
    }

    /// Load the registry from `path`.
    ///
    /// A missing file yields an empty registry and no warning. An unreadable
    /// or corrupt file yields an empty registry plus a `LoadWarning` for the
    /// caller to surface.
    pub fn load(path: impl Into<PathBuf>, threshold: f32) -> (Self, Option<RegistryError>) {
        let mut registry = Self::new(path, threshold);

        if !registry.path.exists() {
            info!("No identity registry at {}, starting fresh", registry.path.display());
            return (registry, None);
        }

        match registry.read_file() {
            Ok(records) => {
                info!("Loaded {} known identities from {}", records.len(), registry.path.display());
                registry.records = records;
                (registry, None)
            }
            Err(reason) => {
                let err = RegistryError::LoadWarning {
                    path: registry.path.display().to_string(),
                    reason,
                };
                warn!("{}; continuing with an empty registry", err);
                (registry, Some(err))
            }
        }
    }

    fn read_file(&self) -> Result<Vec<IdentityRecord>, String> {
        let bytes = fs::read(&self.path).map_err(|e| e.to_string())?;
        let file: RegistryFile = bincode::deserialize(&bytes).map_err(|e| format!("corrupt registry: {}", e))?;

        if file.version != REGISTRY_VERSION {
            return Err(format!("unsupported registry version {}", file.version));
        }
        if file.embeddings.len() != file.labels.len() || file.labels.len() != file.created_at.len() {
            return Err(format!(
                "mismatched record lists ({} embeddings, {} labels, {} timestamps)",
                file.embeddings.len(),
                file.labels.len(),
                file.created_at.len()
            ));
        }
        if let Some(first) = file.embeddings.first() {
            if file.embeddings.iter().any(|e| e.len() != first.len()) {
                return Err("embeddings have inconsistent dimensions".to_string());
            }
        }

        Ok(file
            .embeddings
            .into_iter()
            .zip(file.labels)
            .zip(file.created_at)
            .map(|((embedding, label), created_at)| IdentityRecord {
                embedding,
                label,
                created_at,
            })
            .collect())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[IdentityRecord] {
        &self.records
    }

    /// True when in-memory state has not reached disk
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Embedding length every record shares, once known
    pub fn dimension(&self) -> Option<usize> {
        self.records.first().map(|r| r.embedding.len())
    }

    /// Closest record under the threshold.
    ///
    /// Ties resolve to the record stored first. Embeddings of the wrong
    /// dimension never match.
    pub fn match_embedding(&self, embedding: &[f32]) -> Option<(&str, f32)> {
        if self.dimension().is_some_and(|d| d != embedding.len()) {
            return None;
        }

        let mut best: Option<(&IdentityRecord, f32)> = None;
        for record in &self.records {
            let distance = embedding_distance(&record.embedding, embedding);
            if !distance.is_finite() || distance >= self.threshold {
                continue;
            }
            match best {
                Some((_, best_distance)) if distance >= best_distance => {}
                _ => best = Some((record, distance)),
            }
        }

        best.map(|(record, distance)| (record.label.as_str(), distance))
    }

    /// Store `embedding` under `label` and persist.
    ///
    /// An empty label is a deliberate skip and never touches storage. On a
    /// write failure the record stays in memory and the registry is marked
    /// dirty so [`flush`](Self::flush) can retry.
    pub fn register(&mut self, embedding: Vec<f32>, label: &str) -> Result<Registration, RegistryError> {
        let label = label.trim();
        if label.is_empty() {
            return Ok(Registration::Skipped);
        }

        if let Some(expected) = self.dimension() {
            if expected != embedding.len() {
                return Err(RegistryError::DimensionMismatch {
                    expected,
                    actual: embedding.len(),
                });
            }
        }

        if let Some(existing) = self
            .records
            .iter()
            .find(|r| r.label == label && embedding_distance(&r.embedding, &embedding) < self.threshold)
        {
            return Ok(Registration::Merged(existing.clone()));
        }

        let record = IdentityRecord {
            embedding,
            label: label.to_string(),
            created_at: Utc::now(),
        };
        self.records.push(record.clone());
        self.dirty = true;
        info!("Added new identity: {}", record.label);

        self.persist()?;
        Ok(Registration::Stored(record))
    }

    /// Persist if there are unsaved changes
    pub fn flush(&mut self) -> Result<(), RegistryError> {
        if self.dirty {
            self.persist()?;
        }
        Ok(())
    }

    /// Write the whole registry atomically
    pub fn persist(&mut self) -> Result<(), RegistryError> {
        self.write_file().map_err(|reason| RegistryError::WriteFailure {
            path: self.path.display().to_string(),
            reason,
        })?;
        self.dirty = false;
        info!("Saved {} identities to {}", self.records.len(), self.path.display());
        Ok(())
    }

    fn write_file(&self) -> Result<(), String> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| format!("failed to create directory: {}", e))?;
            }
        }

        let file = RegistryFile {
            version: REGISTRY_VERSION,
            embeddings: self.records.iter().map(|r| r.embedding.clone()).collect(),
            labels: self.records.iter().map(|r| r.label.clone()).collect(),
            created_at: self.records.iter().map(|r| r.created_at).collect(),
            written_at: Utc::now(),
        };
        let bytes = bincode::serialize(&file).map_err(|e| format!("failed to serialize: {}", e))?;

        let temp_path = self.path.with_extension("tmp");
        {
            let mut out = fs::File::create(&temp_path).map_err(|e| format!("failed to create temp file: {}", e))?;
            out.write_all(&bytes).map_err(|e| {
                let _ = fs::remove_file(&temp_path);
                format!("failed to write: {}", e)
            })?;
            out.sync_all().map_err(|e| {
                let _ = fs::remove_file(&temp_path);
                format!("failed to sync: {}", e)
            })?;
        }

        fs::rename(&temp_path, &self.path).map_err(|e| {
            let _ = fs::remove_file(&temp_path);
            format!("failed to replace registry file: {}", e)
        })
    }

    pub fn stats(&self) -> RegistryStats {
        let labels: BTreeSet<&str> = self.records.iter().map(|r| r.label.as_str()).collect();
        RegistryStats {
            records: self.records.len(),
            labels: labels.into_iter().map(str::to_string).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn registry_in(dir: &TempDir) -> IdentityRegistry {
        IdentityRegistry::new(dir.path().join("identities.bin"), 0.5)
    }

    #[test]
    fn test_load_missing_file_is_empty_without_warning() {
        let dir = TempDir::new().unwrap();
        let (registry, warning) = IdentityRegistry::load(dir.path().join("nope.bin"), 0.5);
        assert!(registry.is_empty());
        assert!(warning.is_none());
    }

    #[test]
    fn test_load_corrupt_file_warns() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("identities.bin");
        fs::write(&path, b"definitely not bincode").unwrap();

        let (registry, warning) = IdentityRegistry::load(&path, 0.5);
        assert!(registry.is_empty());
        assert!(matches!(warning, Some(RegistryError::LoadWarning { .. })));
    }

    #[test]
    fn test_register_then_match_same_embedding() {
        let dir = TempDir::new().unwrap();
        let mut registry = registry_in(&dir);

        let result = registry.register(vec![0.1, 0.2, 0.3], "Alice").unwrap();
        assert!(matches!(result, Registration::Stored(ref r) if r.label == "Alice"));

        let (label, distance) = registry.match_embedding(&[0.1, 0.2, 0.3]).unwrap();
        assert_eq!(label, "Alice");
        assert!(distance.abs() < 1e-6);
        assert!(!registry.is_dirty());
    }

    #[test]
    fn test_skip_does_not_touch_storage() {
        let dir = TempDir::new().unwrap();
        let mut registry = registry_in(&dir);

        assert_eq!(registry.register(vec![1.0, 0.0], "   ").unwrap(), Registration::Skipped);
        assert!(registry.is_empty());
        assert!(!registry.path().exists());
    }

    #[test]
    fn test_distant_embeddings_do_not_match() {
        let dir = TempDir::new().unwrap();
        let mut registry = registry_in(&dir);
        registry.register(vec![0.0, 0.0], "Alice").unwrap();
        registry.register(vec![1.0, 0.0], "Bob").unwrap();

        assert_eq!(registry.match_embedding(&[0.0, 0.1]).map(|(l, _)| l), Some("Alice"));
        assert_eq!(registry.match_embedding(&[0.9, 0.0]).map(|(l, _)| l), Some("Bob"));
        assert!(registry.match_embedding(&[0.5, 0.5]).is_none());
    }

    #[test]
    fn test_exact_tie_prefers_first_stored() {
        let dir = TempDir::new().unwrap();
        let mut registry = IdentityRegistry::new(dir.path().join("r.bin"), 1.0);
        registry.register(vec![0.0, 0.2], "first").unwrap();
        registry.register(vec![0.0, -0.2], "second").unwrap();

        let (label, _) = registry.match_embedding(&[0.0, 0.0]).unwrap();
        assert_eq!(label, "first");
    }

    #[test]
    fn test_same_label_within_threshold_merges() {
        let dir = TempDir::new().unwrap();
        let mut registry = registry_in(&dir);
        registry.register(vec![0.0, 0.0], "Alice").unwrap();

        let again = registry.register(vec![0.1, 0.0], "Alice").unwrap();
        assert!(matches!(again, Registration::Merged(_)));
        assert_eq!(registry.len(), 1);

        // A second angle under a different label is allowed
        let other = registry.register(vec![0.1, 0.0], "Alicia").unwrap();
        assert!(matches!(other, Registration::Stored(_)));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_dimension_mismatch() {
        let dir = TempDir::new().unwrap();
        let mut registry = registry_in(&dir);
        registry.register(vec![0.0, 0.0, 0.0], "Alice").unwrap();

        assert!(registry.match_embedding(&[0.0, 0.0]).is_none());
        assert!(matches!(
            registry.register(vec![0.0, 0.0], "Bob"),
            Err(RegistryError::DimensionMismatch { expected: 3, actual: 2 })
        ));
    }

    #[test]
    fn test_persisted_records_survive_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("identities.bin");
        {
            let mut registry = IdentityRegistry::new(&path, 0.5);
            registry.register(vec![0.4, 0.4], "Alice").unwrap();
            registry.register(vec![-0.4, 0.4], "Bob").unwrap();
        }

        let (registry, warning) = IdentityRegistry::load(&path, 0.5);
        assert!(warning.is_none());
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.records()[0].label, "Alice");
        assert_eq!(registry.records()[1].embedding, vec![-0.4, 0.4]);
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_write_failure_keeps_record_in_memory() {
        let dir = TempDir::new().unwrap();
        // Parent of the registry path is a regular file, so writes fail
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, b"x").unwrap();
        let mut registry = IdentityRegistry::new(blocker.join("identities.bin"), 0.5);

        let result = registry.register(vec![0.0, 1.0], "Alice");
        assert!(matches!(result, Err(RegistryError::WriteFailure { .. })));
        assert_eq!(registry.len(), 1);
        assert!(registry.is_dirty());
        assert_eq!(registry.match_embedding(&[0.0, 1.0]).map(|(l, _)| l), Some("Alice"));
        assert!(registry.flush().is_err());
    }

    #[test]
    fn test_stats_lists_distinct_labels() {
        let dir = TempDir::new().unwrap();
        let mut registry = registry_in(&dir);
        registry.register(vec![0.0, 0.0], "Bob").unwrap();
        registry.register(vec![5.0, 0.0], "Alice").unwrap();
        registry.register(vec![0.0, 5.0], "Bob").unwrap();

        let stats = registry.stats();
        assert_eq!(stats.records, 3);
        assert_eq!(stats.labels, vec!["Alice".to_string(), "Bob".to_string()]);
    }
}
