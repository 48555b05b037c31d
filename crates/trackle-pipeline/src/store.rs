//! Durable, frame-indexed tabular storage.
//!
//! A [`FrameStore`] owns one [`ParticleTable`] plus a metadata map and
//! persists both to a single Parquet file: `frame` (u64) and `particle`
//! (nullable u64) columns, every measurement column as nullable f64, and
//! the metadata map riding in the file's key-value metadata as JSON.
//!
//! In-memory mutation never appears on disk until [`FrameStore::save`],
//! and saving replaces the file atomically (write to a sibling temp file,
//! then rename) so a failed save never leaves a half-written store.
//!
//! Store files are named by appending a stage suffix to the base data
//! name before the extension: `run1` + `track` -> `run1_track.parquet`.
//! The `_temp` store is the single-frame preview variant and is
//! overwritten freely.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow_array::{Array, ArrayRef, Float64Array, RecordBatch, UInt64Array};
use arrow_schema::{DataType, Field, Schema};
use indexmap::IndexMap;
use parquet::arrow::ArrowWriter;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::errors::ParquetError;
use parquet::file::properties::WriterProperties;
use parquet::format::KeyValue;

use crate::table::ParticleTable;

/// Key under which the metadata map is stored in the Parquet file.
const META_KEY: &str = "trackle.meta";

/// Metadata map attached to a store.
pub type StoreMeta = IndexMap<String, serde_json::Value>;

/// Errors raised by store persistence.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The store file could not be opened (absent, unreadable).
    #[error("failed to open store file {path}: {source}")]
    Open {
        /// Store file path.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: std::io::Error,
    },

    /// The store file could not be read or decoded.
    #[error("failed to read store file {path}: {source}")]
    Read {
        /// Store file path.
        path: PathBuf,
        /// Underlying Parquet/Arrow failure.
        #[source]
        source: ParquetError,
    },

    /// The store file decodes but does not look like a particle table.
    #[error("store file {path} has an unexpected layout: {detail}")]
    Layout {
        /// Store file path.
        path: PathBuf,
        /// What was unexpected.
        detail: String,
    },

    /// The store file's metadata payload is corrupt.
    #[error("metadata of store file {path} is corrupt: {source}")]
    Metadata {
        /// Store file path.
        path: PathBuf,
        /// Underlying JSON failure.
        #[source]
        source: serde_json::Error,
    },

    /// The store file could not be written.
    #[error("failed to write store file {path}: {source}")]
    Write {
        /// Store file path.
        path: PathBuf,
        /// Underlying Parquet/Arrow failure.
        #[source]
        source: ParquetError,
    },

    /// The freshly written file could not replace the old one.
    #[error("failed to replace store file {path}: {source}")]
    Replace {
        /// Store file path.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: std::io::Error,
    },
}

/// Compose a stage store path: `<dir>/<stem>_<suffix>.parquet`.
///
/// Any extension on `base` is treated as the data-file extension and
/// replaced; the suffix lands before the store extension.
#[must_use]
pub fn stage_path(base: &Path, suffix: &str) -> PathBuf {
    let stem = base
        .file_stem()
        .map_or_else(|| "store".to_owned(), |s| s.to_string_lossy().into_owned());
    base.with_file_name(format!("{stem}_{suffix}.parquet"))
}

/// A persisted, frame-indexed particle table with attached metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameStore {
    path: PathBuf,
    table: ParticleTable,
    meta: StoreMeta,
}

impl FrameStore {
    /// Create an empty store that will save to `path`.
    #[must_use]
    pub fn create(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            table: ParticleTable::new(),
            meta: StoreMeta::new(),
        }
    }

    /// Load a store from its file.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the file is absent, corrupt, or not a
    /// particle table.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let file = File::open(&path).map_err(|source| StoreError::Open {
            path: path.clone(),
            source,
        })?;
        let builder =
            ParquetRecordBatchReaderBuilder::try_new(file).map_err(|source| StoreError::Read {
                path: path.clone(),
                source,
            })?;

        let meta = match builder
            .metadata()
            .file_metadata()
            .key_value_metadata()
            .and_then(|entries| entries.iter().find(|entry| entry.key == META_KEY))
            .and_then(|entry| entry.value.clone())
        {
            None => StoreMeta::new(),
            Some(payload) => {
                serde_json::from_str(&payload).map_err(|source| StoreError::Metadata {
                    path: path.clone(),
                    source,
                })?
            }
        };

        let schema = builder.schema().clone();
        let reader = builder.build().map_err(|source| StoreError::Read {
            path: path.clone(),
            source,
        })?;

        let mut frames: Vec<u64> = Vec::new();
        let mut particles: Vec<Option<u64>> = Vec::new();
        let mut columns: IndexMap<String, Vec<Option<f64>>> = IndexMap::new();
        let value_fields: Vec<&str> = schema
            .fields()
            .iter()
            .map(|field| field.name().as_str())
            .filter(|name| *name != "frame" && *name != "particle")
            .collect();
        for name in &value_fields {
            columns.insert((*name).to_owned(), Vec::new());
        }

        for maybe_batch in reader {
            let batch = maybe_batch.map_err(|source| StoreError::Read {
                path: path.clone(),
                source: ParquetError::from(source),
            })?;
            let frame_column = typed_column::<UInt64Array>(&batch, &path, "frame")?;
            for value in frame_column {
                frames.push(value.ok_or_else(|| StoreError::Layout {
                    path: path.clone(),
                    detail: "null frame index".to_owned(),
                })?);
            }
            let particle_column = typed_column::<UInt64Array>(&batch, &path, "particle")?;
            particles.extend(particle_column.iter());
            for name in &value_fields {
                let values = typed_column::<Float64Array>(&batch, &path, name)?;
                if let Some(column) = columns.get_mut(*name) {
                    column.extend(values.iter());
                }
            }
        }

        let mut table = ParticleTable::new();
        table.extend_raw(frames, particles, columns);
        Ok(Self { path, table, meta })
    }

    /// The store's default file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The owned table.
    #[must_use]
    pub const fn table(&self) -> &ParticleTable {
        &self.table
    }

    /// Replace the owned table wholesale.
    pub fn replace(&mut self, table: ParticleTable) {
        self.table = table;
    }

    /// Merge rows for one frame: existing rows of that frame are
    /// overwritten, other frames are untouched, and new columns extend
    /// the table (existing columns keep their type — every measurement
    /// column is f64 here, so no promotion arises).
    pub fn append_frame(&mut self, rows: &ParticleTable, frame: u64) {
        self.table.remove_frame(frame);
        self.table.append(rows);
        self.table.sort_by_frame();
    }

    /// The metadata map.
    #[must_use]
    pub const fn meta(&self) -> &StoreMeta {
        &self.meta
    }

    /// Insert or replace one metadata entry.
    pub fn set_meta(&mut self, key: &str, value: serde_json::Value) {
        self.meta.insert(key.to_owned(), value);
    }

    /// Rows of one frame. Does not mutate the stored table.
    #[must_use]
    pub fn get_frame(&self, frame: u64) -> ParticleTable {
        self.table.frame_slice(frame)
    }

    /// Rows of the frame range `[lo, hi]`, clamped to the stored table's
    /// `[min_frame, max_frame]` — early/late windows shrink rather than
    /// fail, and a negative lower bound never underflows.
    #[must_use]
    pub fn get_range(&self, lo: i64, hi: i64) -> ParticleTable {
        self.table.range_slice(lo, hi)
    }

    /// Serialize table plus metadata to `path` (or the store's default).
    ///
    /// The column-name list and row/frame counts are refreshed into the
    /// metadata map first. The file is replaced atomically; this is the
    /// only point at which the persisted file is touched.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when encoding or the file replacement
    /// fails.
    pub fn save(&mut self, path: Option<&Path>) -> Result<(), StoreError> {
        let target = path.unwrap_or(&self.path).to_path_buf();
        self.refresh_meta();

        let batch = self.to_batch(&target)?;
        let meta_payload =
            serde_json::to_string(&self.meta).map_err(|source| StoreError::Metadata {
                path: target.clone(),
                source,
            })?;
        let properties = WriterProperties::builder()
            .set_key_value_metadata(Some(vec![KeyValue::new(META_KEY.to_owned(), meta_payload)]))
            .build();

        let temp = target.with_extension("parquet.partial");
        let file = File::create(&temp).map_err(|source| StoreError::Open {
            path: temp.clone(),
            source,
        })?;
        let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(properties)).map_err(
            |source| StoreError::Write {
                path: temp.clone(),
                source,
            },
        )?;
        writer.write(&batch).map_err(|source| StoreError::Write {
            path: temp.clone(),
            source,
        })?;
        writer.close().map_err(|source| StoreError::Write {
            path: temp.clone(),
            source,
        })?;
        std::fs::rename(&temp, &target).map_err(|source| StoreError::Replace {
            path: target.clone(),
            source,
        })?;
        tracing::debug!(path = %target.display(), rows = self.table.len(), "store saved");
        Ok(())
    }

    /// Run a unit of work against the store with a guaranteed save on
    /// every exit path.
    ///
    /// The store is saved whether `work` succeeds or fails, so a failed
    /// stage never leaves a half-written file. A work error takes
    /// precedence over a save error (the latter is logged).
    ///
    /// # Errors
    ///
    /// Returns the work error, or the save error when only the save
    /// failed.
    pub fn scoped<T, E>(mut self, work: impl FnOnce(&mut Self) -> Result<T, E>) -> Result<T, E>
    where
        E: From<StoreError>,
    {
        let outcome = work(&mut self);
        let saved = self.save(None);
        match (outcome, saved) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(save_error)) => Err(E::from(save_error)),
            (Err(work_error), saved) => {
                if let Err(save_error) = saved {
                    tracing::warn!(
                        path = %self.path.display(),
                        error = %save_error,
                        "save failed while unwinding a failed stage",
                    );
                }
                Err(work_error)
            }
        }
    }

    fn refresh_meta(&mut self) {
        let columns: Vec<serde_json::Value> = self
            .table
            .column_names()
            .map(|name| serde_json::Value::String(name.to_owned()))
            .collect();
        self.meta
            .insert("columns".to_owned(), serde_json::Value::Array(columns));
        self.meta
            .insert("rows".to_owned(), serde_json::json!(self.table.len()));
        self.meta.insert(
            "frame_count".to_owned(),
            serde_json::json!(self.table.frame_values().len()),
        );
    }

    fn to_batch(&self, path: &Path) -> Result<RecordBatch, StoreError> {
        let mut fields = vec![
            Field::new("frame", DataType::UInt64, false),
            Field::new("particle", DataType::UInt64, true),
        ];
        let mut arrays: Vec<ArrayRef> = vec![
            Arc::new(UInt64Array::from(self.table.frames().to_vec())),
            Arc::new(UInt64Array::from(self.table.particles().to_vec())),
        ];
        for name in self.table.column_names() {
            fields.push(Field::new(name, DataType::Float64, true));
            let values = self.table.column(name).unwrap_or(&[]).to_vec();
            arrays.push(Arc::new(Float64Array::from(values)));
        }
        RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays).map_err(|source| {
            StoreError::Write {
                path: path.to_path_buf(),
                source: ParquetError::from(source),
            }
        })
    }
}

/// Downcast a named batch column to its concrete Arrow array type.
fn typed_column<'a, A: Array + 'static>(
    batch: &'a RecordBatch,
    path: &Path,
    name: &str,
) -> Result<&'a A, StoreError> {
    batch
        .column_by_name(name)
        .and_then(|column| column.as_any().downcast_ref::<A>())
        .ok_or_else(|| StoreError::Layout {
            path: path.to_path_buf(),
            detail: format!("column '{name}' is missing or has the wrong type"),
        })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn sample_table() -> ParticleTable {
        let mut table = ParticleTable::new();
        table.push_row(0, Some(1), &[("x", 1.0), ("y", 2.0)]);
        table.push_row(0, None, &[("x", 3.0)]);
        table.push_row(1, Some(1), &[("x", 1.5), ("y", 2.5)]);
        table.push_row(3, Some(2), &[("x", 8.0), ("y", 9.0)]);
        table
    }

    #[test]
    fn stage_path_appends_suffix_before_extension() {
        assert_eq!(
            stage_path(Path::new("clips/run1"), "track"),
            PathBuf::from("clips/run1_track.parquet")
        );
        assert_eq!(
            stage_path(Path::new("clips/run1.avi"), "temp"),
            PathBuf::from("clips/run1_temp.parquet")
        );
    }

    #[test]
    fn save_load_round_trip_preserves_table_and_meta() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip_link.parquet");
        let mut store = FrameStore::create(&path);
        store.replace(sample_table());
        store.set_meta("fps", serde_json::json!(25.0));
        store.save(None).unwrap();

        let loaded = FrameStore::load(&path).unwrap();
        assert_eq!(loaded.table(), store.table());
        assert_eq!(loaded.meta(), store.meta());
        // Refreshed bookkeeping keys landed in the metadata map.
        assert_eq!(loaded.meta()["rows"], serde_json::json!(4));
        assert_eq!(
            loaded.meta()["columns"],
            serde_json::json!(["x", "y"])
        );
    }

    #[test]
    fn load_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let result = FrameStore::load(dir.path().join("absent.parquet"));
        assert!(matches!(result, Err(StoreError::Open { .. })));
    }

    #[test]
    fn load_corrupt_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("garbage.parquet");
        std::fs::write(&path, b"not a parquet file").unwrap();
        let result = FrameStore::load(&path);
        assert!(matches!(result, Err(StoreError::Read { .. })));
    }

    #[test]
    fn get_range_clamps_to_stored_frames() {
        let mut store = FrameStore::create("unused.parquet");
        store.replace(sample_table());
        // min_frame = 0: rows start no earlier than frame 0.
        let range = store.get_range(-4, 1);
        assert_eq!(range.frame_values(), vec![0, 1]);
        let all = store.get_range(-100, 100);
        assert_eq!(all.len(), 4);
    }

    #[test]
    fn get_frame_does_not_mutate() {
        let mut store = FrameStore::create("unused.parquet");
        store.replace(sample_table());
        let before = store.table().clone();
        let _ = store.get_frame(0);
        assert_eq!(store.table(), &before);
    }

    #[test]
    fn append_frame_overwrites_existing_rows() {
        let mut store = FrameStore::create("unused.parquet");
        store.replace(sample_table());
        let mut replacement = ParticleTable::new();
        replacement.push_row(0, Some(9), &[("x", 99.0)]);
        store.append_frame(&replacement, 0);
        let frame0 = store.get_frame(0);
        assert_eq!(frame0.len(), 1);
        assert_eq!(frame0.particles(), &[Some(9)]);
        // Other frames untouched.
        assert_eq!(store.get_frame(1).len(), 1);
    }

    #[test]
    fn save_overwrites_previous_file_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip_temp.parquet");
        let mut store = FrameStore::create(&path);
        store.replace(sample_table());
        store.save(None).unwrap();

        let mut second = ParticleTable::new();
        second.push_row(7, Some(4), &[("x", 0.5)]);
        store.replace(second.clone());
        store.save(None).unwrap();

        let loaded = FrameStore::load(&path).unwrap();
        assert_eq!(loaded.table(), &second);
        // No leftover partial file.
        assert!(!path.with_extension("parquet.partial").exists());
    }

    #[test]
    fn scoped_saves_on_success_and_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip_track.parquet");

        let ok: Result<(), StoreError> = FrameStore::create(&path).scoped(|store| {
            store.replace(sample_table());
            Ok(())
        });
        ok.unwrap();
        assert_eq!(FrameStore::load(&path).unwrap().table().len(), 4);

        // A failing unit of work still saves what it wrote so far.
        let failed: Result<(), StoreError> = FrameStore::create(&path).scoped(|store| {
            store.replace(ParticleTable::new());
            Err(StoreError::Layout {
                path: path.clone(),
                detail: "synthetic".to_owned(),
            })
        });
        assert!(failed.is_err());
        assert!(FrameStore::load(&path).unwrap().table().is_empty());
    }

    #[test]
    fn empty_store_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty_postprocess.parquet");
        let mut store = FrameStore::create(&path);
        store.save(None).unwrap();
        let loaded = FrameStore::load(&path).unwrap();
        assert!(loaded.table().is_empty());
    }
}
