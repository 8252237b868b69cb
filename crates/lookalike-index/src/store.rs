//! Feature store: the persisted mapping from image identifier to vector.
//!
//! On disk a store is a JSON Lines file. The first line is a [`StoreHeader`]
//! naming the extractor that built the store, the vector dimension and the
//! number of entries; every following line is one `{"id", "vector"}` record
//! in identifier order. Loading validates the header against every record, so
//! a store is either fully loaded or rejected.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::extract::FeatureExtractor;
use crate::vector::FeatureVector;

/// Format tag written into every header.
pub const STORE_FORMAT: &str = "lookalike-store";
/// Current on-disk schema version.
pub const STORE_VERSION: u32 = 1;

/// Error type for feature store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Store file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed store at line {line}: {source}")]
    Deserialization {
        line: usize,
        source: serde_json::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(serde_json::Error),

    #[error("Corrupt store: {0}")]
    Corrupt(String),

    #[error("Unsupported store version {found}, expected {expected}")]
    UnsupportedVersion { found: u32, expected: u32 },

    #[error("Vector for '{id}' has {actual} dimensions, store expects {expected}")]
    DimensionMismatch {
        id: String,
        expected: usize,
        actual: usize,
    },

    #[error("Failed to persist store: {0}")]
    Persist(#[from] tempfile::PersistError),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// First line of a store file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreHeader {
    pub format: String,
    pub version: u32,
    pub extractor_id: String,
    pub dimension: usize,
    pub entry_count: usize,
    pub built_at: DateTime<Utc>,
}

#[derive(Serialize)]
struct EntryRef<'a> {
    id: &'a str,
    vector: &'a FeatureVector,
}

#[derive(Deserialize)]
struct EntryRecord {
    id: String,
    vector: FeatureVector,
}

/// In-memory catalog of feature vectors, all of one dimension.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureStore {
    extractor_id: String,
    dimension: usize,
    built_at: DateTime<Utc>,
    entries: BTreeMap<String, FeatureVector>,
}

impl FeatureStore {
    /// Create an empty store for vectors of `dimension` produced by the
    /// extractor named `extractor_id`.
    pub fn new(extractor_id: impl Into<String>, dimension: usize) -> Self {
        Self {
            extractor_id: extractor_id.into(),
            dimension,
            built_at: Utc::now(),
            entries: BTreeMap::new(),
        }
    }

    /// Create an empty store matching an extractor.
    pub fn for_extractor(extractor: &dyn FeatureExtractor) -> Self {
        Self::new(extractor.id(), extractor.dimension())
    }

    /// Insert or replace an entry.
    ///
    /// Returns the vector previously stored under `id`, if any. Fails if the
    /// vector dimension differs from the store's.
    pub fn insert(
        &mut self,
        id: impl Into<String>,
        vector: FeatureVector,
    ) -> Result<Option<FeatureVector>> {
        let id = id.into();
        if vector.dimension() != self.dimension {
            return Err(StoreError::DimensionMismatch {
                id,
                expected: self.dimension,
                actual: vector.dimension(),
            });
        }
        Ok(self.entries.insert(id, vector))
    }

    pub fn get(&self, id: &str) -> Option<&FeatureVector> {
        self.entries.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate entries in identifier order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &FeatureVector)> {
        self.entries.iter().map(|(id, v)| (id.as_str(), v))
    }

    pub fn identifiers(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn extractor_id(&self) -> &str {
        &self.extractor_id
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn built_at(&self) -> DateTime<Utc> {
        self.built_at
    }

    /// Header describing this store as it would be written.
    pub fn header(&self) -> StoreHeader {
        StoreHeader {
            format: STORE_FORMAT.to_string(),
            version: STORE_VERSION,
            extractor_id: self.extractor_id.clone(),
            dimension: self.dimension,
            entry_count: self.entries.len(),
            built_at: self.built_at,
        }
    }

    /// Serialize the header and all entries.
    pub fn write_to<W: Write>(&self, mut writer: W) -> Result<()> {
        serde_json::to_writer(&mut writer, &self.header()).map_err(StoreError::Serialization)?;
        writer.write_all(b"\n")?;

        for (id, vector) in &self.entries {
            serde_json::to_writer(&mut writer, &EntryRef { id, vector })
                .map_err(StoreError::Serialization)?;
            writer.write_all(b"\n")?;
        }

        writer.flush()?;
        Ok(())
    }

    /// Persist the store to `path`, replacing any existing file atomically.
    ///
    /// The store is written to a temporary file in the target directory and
    /// renamed into place, so readers see either the old file or the new one.
    pub fn save(&self, path: &Path) -> Result<()> {
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(dir)?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        self.write_to(BufWriter::new(tmp.as_file_mut()))?;
        tmp.as_file().sync_all()?;
        tmp.persist(path)?;

        tracing::info!(
            "Saved {} entries ({} x {}) to {}",
            self.len(),
            self.extractor_id,
            self.dimension,
            path.display()
        );
        Ok(())
    }

    /// Load and fully validate a store file.
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => StoreError::NotFound(path.to_path_buf()),
            _ => StoreError::Io(e),
        })?;

        let store = Self::read_from(BufReader::new(file))?;
        tracing::info!(
            "Loaded {} entries ({} x {}) from {}",
            store.len(),
            store.extractor_id,
            store.dimension,
            path.display()
        );
        Ok(store)
    }

    /// Read the header line only.
    pub fn read_header(path: &Path) -> Result<StoreHeader> {
        let file = File::open(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => StoreError::NotFound(path.to_path_buf()),
            _ => StoreError::Io(e),
        })?;
        let mut lines = BufReader::new(file).lines();
        parse_header(lines.next())
    }

    /// Parse a store from any buffered reader.
    pub fn read_from<R: BufRead>(reader: R) -> Result<Self> {
        let mut lines = reader.lines();
        let header = parse_header(lines.next())?;

        let mut store = Self {
            extractor_id: header.extractor_id,
            dimension: header.dimension,
            built_at: header.built_at,
            entries: BTreeMap::new(),
        };

        for (idx, line) in lines.enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            // Header is line 1.
            let line_no = idx + 2;
            let record: EntryRecord = serde_json::from_str(&line)
                .map_err(|source| StoreError::Deserialization {
                    line: line_no,
                    source,
                })?;

            if !record.vector.is_finite() {
                return Err(StoreError::Corrupt(format!(
                    "non-finite vector for '{}' at line {}",
                    record.id, line_no
                )));
            }

            let id = record.id.clone();
            if store.insert(record.id, record.vector)?.is_some() {
                return Err(StoreError::Corrupt(format!(
                    "duplicate identifier '{}' at line {}",
                    id, line_no
                )));
            }
        }

        if store.len() != header.entry_count {
            return Err(StoreError::Corrupt(format!(
                "header declares {} entries, found {}",
                header.entry_count,
                store.len()
            )));
        }

        Ok(store)
    }
}

fn parse_header(line: Option<std::io::Result<String>>) -> Result<StoreHeader> {
    let line = line.ok_or_else(|| StoreError::Corrupt("empty store file".to_string()))??;
    let header: StoreHeader = serde_json::from_str(&line)
        .map_err(|source| StoreError::Deserialization { line: 1, source })?;

    if header.format != STORE_FORMAT {
        return Err(StoreError::Corrupt(format!(
            "unknown format '{}'",
            header.format
        )));
    }
    if header.version != STORE_VERSION {
        return Err(StoreError::UnsupportedVersion {
            found: header.version,
            expected: STORE_VERSION,
        });
    }
    if header.dimension == 0 {
        return Err(StoreError::Corrupt("zero vector dimension".to_string()));
    }

    Ok(header)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_store() -> FeatureStore {
        let mut store = FeatureStore::new("test-extractor", 3);
        store
            .insert("b.png", FeatureVector::new(vec![0.0, 1.0, 0.5]))
            .unwrap();
        store
            .insert("a.png", FeatureVector::new(vec![1.0, 0.25, 0.0]))
            .unwrap();
        store
    }

    #[test]
    fn test_insert_and_get() {
        let store = sample_store();
        assert_eq!(store.len(), 2);
        assert!(store.contains("a.png"));
        assert_eq!(store.get("a.png").unwrap().as_slice(), &[1.0, 0.25, 0.0]);
        assert!(store.get("missing.png").is_none());
    }

    #[test]
    fn test_iteration_is_identifier_ordered() {
        let store = sample_store();
        let ids: Vec<_> = store.identifiers().collect();
        assert_eq!(ids, vec!["a.png", "b.png"]);
    }

    #[test]
    fn test_insert_overwrites() {
        let mut store = sample_store();
        let previous = store
            .insert("a.png", FeatureVector::new(vec![0.0, 0.0, 1.0]))
            .unwrap();
        assert_eq!(previous.unwrap().as_slice(), &[1.0, 0.25, 0.0]);
        assert_eq!(store.len(), 2);
        assert_eq!(store.get("a.png").unwrap().as_slice(), &[0.0, 0.0, 1.0]);
    }

    #[test]
    fn test_insert_rejects_wrong_dimension() {
        let mut store = sample_store();
        let err = store
            .insert("c.png", FeatureVector::new(vec![1.0, 2.0]))
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::DimensionMismatch {
                expected: 3,
                actual: 2,
                ..
            }
        ));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("catalog.jsonl");
        let store = sample_store();

        store.save(&path).expect("Should save");
        let loaded = FeatureStore::load(&path).expect("Should load");

        assert_eq!(loaded, store);
        assert_eq!(loaded.header(), store.header());
    }

    #[test]
    fn test_empty_store_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("empty.jsonl");
        let store = FeatureStore::new("test-extractor", 8);

        store.save(&path).unwrap();
        let loaded = FeatureStore::load(&path).unwrap();
        assert!(loaded.is_empty());
        assert_eq!(loaded.dimension(), 8);
    }

    #[test]
    fn test_file_layout() {
        let mut buf = Vec::new();
        sample_store().write_to(&mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        let lines: Vec<_> = text.lines().collect();

        assert_eq!(lines.len(), 3);
        let header: StoreHeader = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(header.format, STORE_FORMAT);
        assert_eq!(header.version, STORE_VERSION);
        assert_eq!(header.extractor_id, "test-extractor");
        assert_eq!(header.dimension, 3);
        assert_eq!(header.entry_count, 2);
        assert_eq!(lines[1], r#"{"id":"a.png","vector":[1.0,0.25,0.0]}"#);
    }

    #[test]
    fn test_read_header_only() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("catalog.jsonl");
        sample_store().save(&path).unwrap();

        let header = FeatureStore::read_header(&path).unwrap();
        assert_eq!(header.entry_count, 2);
        assert_eq!(header.extractor_id, "test-extractor");
    }

    #[test]
    fn test_save_replaces_existing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("catalog.jsonl");
        std::fs::write(&path, "stale contents").unwrap();

        sample_store().save(&path).unwrap();
        assert_eq!(FeatureStore::load(&path).unwrap().len(), 2);

        // Only the store itself remains, no temp files.
        let files: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(files.len(), 1);
    }

    #[test]
    fn test_save_creates_parent_dirs() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("deeper").join("catalog.jsonl");
        sample_store().save(&path).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_load_missing_file() {
        let err = FeatureStore::load(Path::new("/nonexistent/catalog.jsonl")).unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn test_load_empty_file() {
        let err = FeatureStore::read_from("".as_bytes()).unwrap_err();
        assert!(matches!(err, StoreError::Corrupt(_)));
    }

    #[test]
    fn test_load_garbage_header() {
        let err = FeatureStore::read_from("\u{80}\u{2}pickle".as_bytes()).unwrap_err();
        assert!(matches!(err, StoreError::Deserialization { line: 1, .. }));
    }

    #[test]
    fn test_load_rejects_foreign_format() {
        let text = r#"{"format":"other","version":1,"extractor_id":"x","dimension":2,"entry_count":0,"built_at":"2026-01-01T00:00:00Z"}"#;
        let err = FeatureStore::read_from(text.as_bytes()).unwrap_err();
        assert!(matches!(err, StoreError::Corrupt(_)));
    }

    #[test]
    fn test_load_rejects_future_version() {
        let text = r#"{"format":"lookalike-store","version":9,"extractor_id":"x","dimension":2,"entry_count":0,"built_at":"2026-01-01T00:00:00Z"}"#;
        let err = FeatureStore::read_from(text.as_bytes()).unwrap_err();
        assert!(matches!(
            err,
            StoreError::UnsupportedVersion {
                found: 9,
                expected: 1
            }
        ));
    }

    #[test]
    fn test_load_rejects_wrong_vector_dimension() {
        let text = concat!(
            r#"{"format":"lookalike-store","version":1,"extractor_id":"x","dimension":2,"entry_count":1,"built_at":"2026-01-01T00:00:00Z"}"#,
            "\n",
            r#"{"id":"a","vector":[1.0,2.0,3.0]}"#,
            "\n"
        );
        let err = FeatureStore::read_from(text.as_bytes()).unwrap_err();
        assert!(matches!(err, StoreError::DimensionMismatch { .. }));
    }

    #[test]
    fn test_load_rejects_truncated_file() {
        let mut buf = Vec::new();
        sample_store().write_to(&mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        let truncated: String = text.lines().take(2).map(|l| format!("{l}\n")).collect();

        let err = FeatureStore::read_from(truncated.as_bytes()).unwrap_err();
        assert!(matches!(err, StoreError::Corrupt(msg) if msg.contains("declares 2")));
    }

    #[test]
    fn test_load_rejects_duplicate_ids() {
        let text = concat!(
            r#"{"format":"lookalike-store","version":1,"extractor_id":"x","dimension":1,"entry_count":2,"built_at":"2026-01-01T00:00:00Z"}"#,
            "\n",
            r#"{"id":"a","vector":[1.0]}"#,
            "\n",
            r#"{"id":"a","vector":[2.0]}"#,
            "\n"
        );
        let err = FeatureStore::read_from(text.as_bytes()).unwrap_err();
        assert!(matches!(err, StoreError::Corrupt(msg) if msg.contains("duplicate")));
    }

    #[test]
    fn test_load_reports_bad_entry_line() {
        let text = concat!(
            r#"{"format":"lookalike-store","version":1,"extractor_id":"x","dimension":1,"entry_count":1,"built_at":"2026-01-01T00:00:00Z"}"#,
            "\n",
            r#"{"id":"a","vector":"oops"}"#,
            "\n"
        );
        let err = FeatureStore::read_from(text.as_bytes()).unwrap_err();
        assert!(matches!(err, StoreError::Deserialization { line: 2, .. }));
    }
}
