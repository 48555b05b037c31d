//! Windowed per-particle aggregation: derived columns that depend on a
//! particle's own history.
//!
//! All window arithmetic is **frame-indexed** and grouped by particle
//! identity, never by row position. A particle absent for some frames
//! inside a window simply contributes fewer observations; it cannot
//! pollute another particle's computation, and row order within a frame
//! is irrelevant.
//!
//! Boundary policy: windows never reach below frame 0 — the effective
//! span truncates at the start of the sequence. A window holding no
//! observation for a particle yields `None` for that row; a partial
//! window still yields a value.

use crate::table::ParticleTable;

/// Errors raised by windowed computations.
#[derive(Debug, thiserror::Error)]
pub enum WindowError {
    /// The input column is not in the table.
    #[error("column '{column}' is not in the table")]
    MissingColumn {
        /// The absent column.
        column: String,
    },
}

/// Which windowed operation to apply.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WindowOp {
    /// Value now minus value `span` frames earlier (anchored at frame 0
    /// near the sequence start).
    Difference,
    /// Mean over the trailing window of `span` frames.
    RollingMean,
    /// Median over the trailing window of `span` frames.
    RollingMedian,
    /// Difference scaled by frames-per-second: a per-second rate under a
    /// uniform sampling assumption. Non-uniform frame rates must be
    /// resampled upstream.
    Rate {
        /// Recording frame rate.
        fps: f64,
    },
}

/// Compute a windowed column over the whole table.
///
/// Returns one entry per row, aligned with the table's row order. Rows
/// without a particle identity get `None`; so do rows whose window holds
/// no usable observation.
///
/// Semantics per row at frame `f` for a particle's group:
/// - [`WindowOp::Difference`]: `col(f) − col(base)` with
///   `base = max(0, f − span)`; `None` if the particle has no value at
///   the anchor frame.
/// - [`WindowOp::Rate`]: the same difference multiplied by `fps`.
/// - [`WindowOp::RollingMean`] / [`WindowOp::RollingMedian`]: over the
///   particle's observations at frames in `[max(0, f − span + 1), f]`.
///   Partial windows produce values; an empty window produces `None`.
///
/// # Errors
///
/// Returns [`WindowError::MissingColumn`] when `column` is absent.
pub fn windowed_column(
    table: &ParticleTable,
    column: &str,
    span: u64,
    op: WindowOp,
) -> Result<Vec<Option<f64>>, WindowError> {
    let values = table
        .column(column)
        .ok_or_else(|| WindowError::MissingColumn {
            column: column.to_owned(),
        })?;
    let frames = table.frames();
    let mut out = vec![None; table.len()];

    for rows in table.group_by_particle().values() {
        // One observation per frame within a group (identities are unique
        // within a frame); rows are already frame-sorted.
        let series: Vec<(u64, usize)> = rows.iter().map(|&row| (frames[row], row)).collect();
        for &(frame, row) in &series {
            out[row] = match op {
                WindowOp::Difference => anchored_difference(&series, values, frame, row, span),
                WindowOp::Rate { fps } => {
                    anchored_difference(&series, values, frame, row, span).map(|d| d * fps)
                }
                WindowOp::RollingMean => {
                    let window = window_values(&series, values, frame, span);
                    mean(&window)
                }
                WindowOp::RollingMedian => {
                    let window = window_values(&series, values, frame, span);
                    median(window)
                }
            };
        }
    }
    Ok(out)
}

/// Drift-normalized trajectories: subtract the ensemble drift from the
/// `x`/`y` columns.
///
/// The drift is the cumulative sum of the per-frame mean displacement of
/// all particles present in consecutive frames, optionally smoothed with
/// a trailing rolling mean of width `span` (`span <= 1` disables
/// smoothing). Frames where no particle survives from the previous frame
/// contribute zero drift.
///
/// Returns the corrected `(x, y)` columns, row-aligned with the table.
///
/// # Errors
///
/// Returns [`WindowError::MissingColumn`] when `x` or `y` is absent.
#[allow(clippy::type_complexity)]
pub fn drift_corrected(
    table: &ParticleTable,
    span: u64,
) -> Result<(Vec<Option<f64>>, Vec<Option<f64>>), WindowError> {
    let xs = table.column("x").ok_or_else(|| WindowError::MissingColumn {
        column: "x".to_owned(),
    })?;
    let ys = table.column("y").ok_or_else(|| WindowError::MissingColumn {
        column: "y".to_owned(),
    })?;
    let frames = table.frames();
    let frame_values = table.frame_values();

    // Per-frame mean displacement of particles present in both frames of
    // each consecutive pair.
    let mut deltas: Vec<(f64, f64)> = vec![(0.0, 0.0); frame_values.len()];
    let groups = table.group_by_particle();
    for (pair_index, pair) in frame_values.windows(2).enumerate() {
        let (prev, next) = (pair[0], pair[1]);
        let mut dx_sum = 0.0;
        let mut dy_sum = 0.0;
        let mut count = 0u64;
        for rows in groups.values() {
            let at = |frame: u64| {
                rows.iter()
                    .find(|&&row| frames[row] == frame)
                    .map(|&row| (xs[row], ys[row]))
            };
            if let (Some((Some(x0), Some(y0))), Some((Some(x1), Some(y1)))) = (at(prev), at(next)) {
                dx_sum += x1 - x0;
                dy_sum += y1 - y0;
                count += 1;
            }
        }
        if count > 0 {
            #[allow(clippy::cast_precision_loss)]
            let n = count as f64;
            deltas[pair_index + 1] = (dx_sum / n, dy_sum / n);
        }
    }

    // Optional trailing smoothing of the delta series.
    if span > 1 {
        let raw = deltas.clone();
        let width = usize::try_from(span).unwrap_or(usize::MAX);
        for (i, slot) in deltas.iter_mut().enumerate() {
            let lo = i.saturating_sub(width - 1);
            let window = &raw[lo..=i];
            #[allow(clippy::cast_precision_loss)]
            let n = window.len() as f64;
            let dx: f64 = window.iter().map(|d| d.0).sum();
            let dy: f64 = window.iter().map(|d| d.1).sum();
            *slot = (dx / n, dy / n);
        }
    }

    // Cumulative drift per frame.
    let mut drift: Vec<(f64, f64)> = Vec::with_capacity(deltas.len());
    let mut acc = (0.0, 0.0);
    for delta in &deltas {
        acc = (acc.0 + delta.0, acc.1 + delta.1);
        drift.push(acc);
    }

    let drift_at = |frame: u64| {
        frame_values
            .binary_search(&frame)
            .ok()
            .map(|index| drift[index])
    };
    let mut out_x = vec![None; table.len()];
    let mut out_y = vec![None; table.len()];
    for row in 0..table.len() {
        if let (Some(x), Some(y), Some((dx, dy))) = (xs[row], ys[row], drift_at(frames[row])) {
            out_x[row] = Some(x - dx);
            out_y[row] = Some(y - dy);
        }
    }
    Ok((out_x, out_y))
}

/// `col(f) − col(base)` with the anchor clamped at frame 0.
fn anchored_difference(
    series: &[(u64, usize)],
    values: &[Option<f64>],
    frame: u64,
    row: usize,
    span: u64,
) -> Option<f64> {
    let base_frame = frame.saturating_sub(span);
    let base_row = series
        .iter()
        .find(|&&(f, _)| f == base_frame)
        .map(|&(_, r)| r)?;
    match (values[row], values[base_row]) {
        (Some(now), Some(then)) => Some(now - then),
        _ => None,
    }
}

/// The particle's observed values at frames in `[max(0, f−span+1), f]`.
fn window_values(
    series: &[(u64, usize)],
    values: &[Option<f64>],
    frame: u64,
    span: u64,
) -> Vec<f64> {
    let lo = frame.saturating_sub(span.saturating_sub(1));
    let start = series.partition_point(|&(f, _)| f < lo);
    let end = series.partition_point(|&(f, _)| f <= frame);
    series[start..end]
        .iter()
        .filter_map(|&(_, row)| values[row])
        .collect()
}

fn mean(window: &[f64]) -> Option<f64> {
    if window.is_empty() {
        return None;
    }
    #[allow(clippy::cast_precision_loss)]
    let n = window.len() as f64;
    Some(window.iter().sum::<f64>() / n)
}

fn median(mut window: Vec<f64>) -> Option<f64> {
    if window.is_empty() {
        return None;
    }
    window.sort_by(f64::total_cmp);
    let mid = window.len() / 2;
    if window.len() % 2 == 1 {
        Some(window[mid])
    } else {
        Some(f64::midpoint(window[mid - 1], window[mid]))
    }
}
