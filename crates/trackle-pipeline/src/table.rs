//! Columnar in-memory particle table.
//!
//! One row per (frame, particle) observation: a frame index, an optional
//! particle identity (`None` before linking), and a set of named `f64`
//! measurement columns where `None` marks a missing value. All column
//! vectors are row-aligned; [`ParticleTable`] enforces that invariant at
//! every mutation.
//!
//! Column order is preserved (insertion order) so a table survives a
//! store round-trip byte-for-byte; see `store`.

use indexmap::IndexMap;

/// Errors raised by table mutations.
#[derive(Debug, thiserror::Error)]
pub enum TableError {
    /// A column being merged does not match the table's row count.
    #[error("column '{column}' has {found} values but the table has {expected} rows")]
    LengthMismatch {
        /// Offending column name.
        column: String,
        /// Row count of the table.
        expected: usize,
        /// Length of the rejected column.
        found: usize,
    },
}

/// A frame- and particle-indexed measurement table.
///
/// Rows are kept in insertion order; [`sort_by_frame`](Self::sort_by_frame)
/// establishes frame order when a stage requires it. Within one frame,
/// particle identities are unique (guaranteed by the linking step that
/// produces them, relied upon here).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParticleTable {
    frames: Vec<u64>,
    particles: Vec<Option<u64>>,
    columns: IndexMap<String, Vec<Option<f64>>>,
}

impl ParticleTable {
    /// Create an empty table with no columns.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Returns `true` if the table has no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Frame index of every row.
    #[must_use]
    pub fn frames(&self) -> &[u64] {
        &self.frames
    }

    /// Particle identity of every row (`None` before linking).
    #[must_use]
    pub fn particles(&self) -> &[Option<u64>] {
        &self.particles
    }

    /// The values of a named column, or `None` if the column is absent.
    #[must_use]
    pub fn column(&self, name: &str) -> Option<&[Option<f64>]> {
        self.columns.get(name).map(Vec::as_slice)
    }

    /// Column names in column order.
    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(String::as_str)
    }

    /// A single cell value. `None` when the column is absent, the row is
    /// out of range, or the value itself is missing.
    #[must_use]
    pub fn value(&self, row: usize, column: &str) -> Option<f64> {
        self.columns.get(column)?.get(row).copied().flatten()
    }

    /// Smallest frame index present, or `None` for an empty table.
    #[must_use]
    pub fn min_frame(&self) -> Option<u64> {
        self.frames.iter().copied().min()
    }

    /// Largest frame index present, or `None` for an empty table.
    #[must_use]
    pub fn max_frame(&self) -> Option<u64> {
        self.frames.iter().copied().max()
    }

    /// Append one row.
    ///
    /// Columns named in `values` but absent from the table are created and
    /// backfilled with `None` for all earlier rows; existing columns absent
    /// from `values` receive `None` for this row.
    pub fn push_row(&mut self, frame: u64, particle: Option<u64>, values: &[(&str, f64)]) {
        let row = self.frames.len();
        self.frames.push(frame);
        self.particles.push(particle);
        for column in self.columns.values_mut() {
            column.push(None);
        }
        for &(name, value) in values {
            let column = self
                .columns
                .entry(name.to_owned())
                .or_insert_with(|| vec![None; row + 1]);
            if column.len() < row + 1 {
                column.resize(row + 1, None);
            }
            column[row] = Some(value);
        }
    }

    /// Insert or overwrite a whole column.
    ///
    /// # Errors
    ///
    /// Returns [`TableError::LengthMismatch`] if `values` does not match
    /// the table's row count.
    pub fn merge_column(&mut self, name: &str, values: Vec<Option<f64>>) -> Result<(), TableError> {
        if values.len() != self.frames.len() {
            return Err(TableError::LengthMismatch {
                column: name.to_owned(),
                expected: self.frames.len(),
                found: values.len(),
            });
        }
        self.columns.insert(name.to_owned(), values);
        Ok(())
    }

    /// Replace the particle-identity column wholesale (the linking path).
    ///
    /// # Errors
    ///
    /// Returns [`TableError::LengthMismatch`] if `particles` does not
    /// match the table's row count.
    pub fn set_particles(&mut self, particles: Vec<Option<u64>>) -> Result<(), TableError> {
        if particles.len() != self.frames.len() {
            return Err(TableError::LengthMismatch {
                column: "particle".to_owned(),
                expected: self.frames.len(),
                found: particles.len(),
            });
        }
        self.particles = particles;
        Ok(())
    }

    /// Append every row of `other`, unifying the column sets.
    ///
    /// Columns missing on either side are padded with `None`.
    pub fn append(&mut self, other: &Self) {
        let before = self.frames.len();
        self.frames.extend_from_slice(&other.frames);
        self.particles.extend_from_slice(&other.particles);
        let after = self.frames.len();
        for name in other.columns.keys() {
            self.columns
                .entry(name.clone())
                .or_insert_with(|| vec![None; before]);
        }
        for (name, column) in &mut self.columns {
            if let Some(theirs) = other.columns.get(name) {
                column.extend_from_slice(theirs);
            } else {
                column.resize(after, None);
            }
        }
    }

    /// Rows whose frame index equals `frame`, as a new table.
    #[must_use]
    pub fn frame_slice(&self, frame: u64) -> Self {
        self.select(|row| self.frames[row] == frame)
    }

    /// Rows whose frame index falls in `[lo, hi]`, as a new table.
    ///
    /// Bounds are clamped to the table's `[min_frame, max_frame]` rather
    /// than failing, so windows near the sequence boundaries shrink
    /// naturally. Negative `lo` never underflows.
    #[must_use]
    pub fn range_slice(&self, lo: i64, hi: i64) -> Self {
        let (Some(min), Some(max)) = (self.min_frame(), self.max_frame()) else {
            return Self::new();
        };
        let lo = u64::try_from(lo.max(0)).unwrap_or(0).max(min);
        let hi = u64::try_from(hi.max(0)).unwrap_or(0).min(max);
        if lo > hi {
            return Self::new();
        }
        self.select(|row| (lo..=hi).contains(&self.frames[row]))
    }

    /// Sorted, deduplicated list of frame indices present in the table.
    #[must_use]
    pub fn frame_values(&self) -> Vec<u64> {
        let mut frames = self.frames.clone();
        frames.sort_unstable();
        frames.dedup();
        frames
    }

    /// Group rows by particle identity.
    ///
    /// Returns identity -> row indices, each group sorted by frame index
    /// (stable within a frame). Rows without an identity are excluded:
    /// grouping is by identity value, never by row position, so a particle
    /// absent for some frames still groups correctly and row order within
    /// a frame is irrelevant.
    #[must_use]
    pub fn group_by_particle(&self) -> IndexMap<u64, Vec<usize>> {
        let mut groups: IndexMap<u64, Vec<usize>> = IndexMap::new();
        for (row, particle) in self.particles.iter().enumerate() {
            if let Some(id) = particle {
                groups.entry(*id).or_default().push(row);
            }
        }
        for rows in groups.values_mut() {
            rows.sort_by_key(|&row| self.frames[row]);
        }
        groups
    }

    /// Drop every row of the given frame (columns are kept even if
    /// emptied).
    pub fn remove_frame(&mut self, frame: u64) {
        *self = self.select(|row| self.frames[row] != frame);
    }

    /// Stable-sort all rows by frame index.
    pub fn sort_by_frame(&mut self) {
        let mut order: Vec<usize> = (0..self.frames.len()).collect();
        order.sort_by_key(|&row| self.frames[row]);
        self.frames = order.iter().map(|&row| self.frames[row]).collect();
        self.particles = order.iter().map(|&row| self.particles[row]).collect();
        for column in self.columns.values_mut() {
            *column = order.iter().map(|&row| column[row]).collect();
        }
    }

    /// Adopt decoded storage wholesale (store loading path). Columns
    /// shorter than the row count are padded with `None`.
    pub(crate) fn extend_raw(
        &mut self,
        frames: Vec<u64>,
        particles: Vec<Option<u64>>,
        mut columns: IndexMap<String, Vec<Option<f64>>>,
    ) {
        let rows = frames.len();
        for column in columns.values_mut() {
            column.resize(rows, None);
        }
        self.frames = frames;
        self.particles = particles;
        self.columns = columns;
    }

    fn select(&self, keep: impl Fn(usize) -> bool) -> Self {
        let rows: Vec<usize> = (0..self.frames.len()).filter(|&row| keep(row)).collect();
        let mut out = Self {
            frames: rows.iter().map(|&row| self.frames[row]).collect(),
            particles: rows.iter().map(|&row| self.particles[row]).collect(),
            columns: IndexMap::new(),
        };
        for (name, column) in &self.columns {
            out.columns.insert(
                name.clone(),
                rows.iter().map(|&row| column[row]).collect(),
            );
        }
        out
    }
}
