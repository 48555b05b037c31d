//! Built-in steps and the default registries.
//!
//! The image-side steps are deliberately primitive: real filtering and
//! detection algorithms live in collaborator crates and register their
//! own handlers. What ships here is enough to crop, prepare, detect and
//! link a clean sequence end-to-end, plus the full set of postprocessing
//! methods (windowed and spatial derived columns) — the part of the
//! pipeline this crate owns outright.

use image::GrayImage;

use crate::chain::{
    DetectStep, ImageStep, StepContext, StepError, StepOutput, StepRegistries, TableStep,
};
use crate::spatial::{self, FramePoint};
use crate::table::{ParticleTable, TableError};
use crate::windowed::{self, WindowError, WindowOp};

/// Hint attached to missing `x`/`y` errors.
const POSITION_HINT: &str = "requires a detector producing x/y to have been run in Track";

fn table_failure(error: TableError) -> StepError {
    StepError::Failed {
        detail: error.to_string(),
    }
}

fn column_failure(error: WindowError, hint: &str) -> StepError {
    match error {
        WindowError::MissingColumn { column } => StepError::MissingColumn {
            column,
            hint: hint.to_owned(),
        },
    }
}

// ───────────────────────────── Crop steps ────────────────────────────────

/// Rectangular region-of-interest crop (`roi`).
///
/// Parameters: `left`, `top` (default 0), `width`, `height` (default:
/// the remainder of the frame). The rectangle is clamped to the frame.
pub struct RoiCrop;

impl ImageStep for RoiCrop {
    fn apply(
        &self,
        frame: &GrayImage,
        ctx: &StepContext,
    ) -> Result<StepOutput<GrayImage>, StepError> {
        let left = ctx.u64_or("left", 0)?.min(u64::from(frame.width()));
        let top = ctx.u64_or("top", 0)?.min(u64::from(frame.height()));
        let width = ctx
            .u64_or("width", u64::from(frame.width()) - left)?
            .min(u64::from(frame.width()) - left);
        let height = ctx
            .u64_or("height", u64::from(frame.height()) - top)?
            .min(u64::from(frame.height()) - top);
        if width == 0 || height == 0 {
            return Err(StepError::Failed {
                detail: "crop rectangle has zero area after clamping".to_owned(),
            });
        }
        let view = image::imageops::crop_imm(
            frame,
            u32::try_from(left).unwrap_or(u32::MAX),
            u32::try_from(top).unwrap_or(u32::MAX),
            u32::try_from(width).unwrap_or(u32::MAX),
            u32::try_from(height).unwrap_or(u32::MAX),
        );
        Ok(StepOutput::Value(view.to_image()))
    }
}

/// Circular mask (`circle_mask`): pixels outside the circle become 0.
///
/// Parameters: `cx`, `cy` (default: frame centre), `radius` (default:
/// half the shorter frame side).
pub struct CircleMask;

impl ImageStep for CircleMask {
    fn apply(
        &self,
        frame: &GrayImage,
        ctx: &StepContext,
    ) -> Result<StepOutput<GrayImage>, StepError> {
        let cx = ctx.f64_or("cx", f64::from(frame.width()) / 2.0)?;
        let cy = ctx.f64_or("cy", f64::from(frame.height()) / 2.0)?;
        let radius = ctx.f64_or("radius", f64::from(frame.width().min(frame.height())) / 2.0)?;
        let radius_sq = radius * radius;
        let mut out = frame.clone();
        for (x, y, pixel) in out.enumerate_pixels_mut() {
            let dx = f64::from(x) - cx;
            let dy = f64::from(y) - cy;
            if dx.mul_add(dx, dy * dy) > radius_sq {
                pixel.0[0] = 0;
            }
        }
        Ok(StepOutput::Value(out))
    }
}

// ─────────────────────────── Preprocess steps ────────────────────────────

/// Intensity inversion (`invert`).
pub struct Invert;

impl ImageStep for Invert {
    fn apply(
        &self,
        frame: &GrayImage,
        _ctx: &StepContext,
    ) -> Result<StepOutput<GrayImage>, StepError> {
        let mut out = frame.clone();
        for pixel in out.pixels_mut() {
            pixel.0[0] = 255 - pixel.0[0];
        }
        Ok(StepOutput::Value(out))
    }
}

/// Linear min-max contrast stretch (`normalize`).
///
/// A flat frame has nothing to stretch and passes through unchanged.
pub struct Normalize;

impl ImageStep for Normalize {
    fn apply(
        &self,
        frame: &GrayImage,
        _ctx: &StepContext,
    ) -> Result<StepOutput<GrayImage>, StepError> {
        let (mut lo, mut hi) = (u8::MAX, u8::MIN);
        for pixel in frame.pixels() {
            lo = lo.min(pixel.0[0]);
            hi = hi.max(pixel.0[0]);
        }
        if lo == hi {
            return Ok(StepOutput::Empty);
        }
        let range = f64::from(hi) - f64::from(lo);
        let mut out = frame.clone();
        for pixel in out.pixels_mut() {
            let stretched = (f64::from(pixel.0[0]) - f64::from(lo)) / range * 255.0;
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            {
                pixel.0[0] = stretched.round().clamp(0.0, 255.0) as u8;
            }
        }
        Ok(StepOutput::Value(out))
    }
}

// ───────────────────────────── Track steps ───────────────────────────────

/// Intensity-weighted whole-frame centroid (`centroid`).
///
/// Parameters: `threshold` (default 0); pixels below it carry no
/// weight. Produces one detection per frame with `x`, `y`, `mass`;
/// `Empty` when no pixel clears the threshold. Real detectors (blob and
/// feature locators, Hough transforms) are collaborator-registered; this
/// one exists so a bright single-particle clip tracks out of the box.
pub struct CentroidDetect;

impl DetectStep for CentroidDetect {
    fn apply(
        &self,
        frame: &GrayImage,
        ctx: &StepContext,
    ) -> Result<StepOutput<ParticleTable>, StepError> {
        let threshold = ctx.f64_or("threshold", 0.0)?;
        let mut mass = 0.0;
        let mut x_sum = 0.0;
        let mut y_sum = 0.0;
        for (x, y, pixel) in frame.enumerate_pixels() {
            let value = f64::from(pixel.0[0]);
            if value > 0.0 && value >= threshold {
                mass += value;
                x_sum += f64::from(x) * value;
                y_sum += f64::from(y) * value;
            }
        }
        if mass <= 0.0 {
            return Ok(StepOutput::Empty);
        }
        let frame_index = ctx.frame().unwrap_or(0);
        let mut rows = ParticleTable::new();
        rows.push_row(
            frame_index,
            None,
            &[("x", x_sum / mass), ("y", y_sum / mass), ("mass", mass)],
        );
        Ok(StepOutput::Value(rows))
    }
}

// ───────────────────────────── Link steps ────────────────────────────────

/// Linking parameters handed to a [`Linker`].
#[derive(Debug, Clone, Copy)]
pub struct LinkParams {
    /// Maximum displacement between consecutive frames.
    pub search_range: f64,
    /// Frames a lost particle may stay linkable.
    pub memory: u64,
}

/// The trajectory-linking collaborator.
///
/// Given frame-indexed detections, return the same rows with stable
/// particle identities assigned. The algorithm itself is opaque to the
/// pipeline; anything honouring the identity invariants (unique within a
/// frame, stable along a trajectory) can be plugged in.
pub trait Linker: Send + Sync {
    /// Assign particle identities.
    ///
    /// # Errors
    ///
    /// Returns [`StepError`] when required columns are missing.
    fn link(&self, detections: ParticleTable, params: LinkParams)
    -> Result<ParticleTable, StepError>;
}

/// Greedy frame-to-frame nearest-neighbour linker.
///
/// Deliberately simple: detections claim the nearest unclaimed active
/// track within `search_range`, in row order; unmatched detections open
/// new tracks; tracks unseen for more than `memory` frames are retired.
/// Rows without a position stay unlinked.
pub struct NearestLinker;

struct ActiveTrack {
    id: u64,
    x: f64,
    y: f64,
    last_seen: u64,
}

impl Linker for NearestLinker {
    fn link(
        &self,
        detections: ParticleTable,
        params: LinkParams,
    ) -> Result<ParticleTable, StepError> {
        if detections.is_empty() {
            return Ok(detections);
        }
        let xs = detections
            .column("x")
            .ok_or_else(|| StepError::MissingColumn {
                column: "x".to_owned(),
                hint: POSITION_HINT.to_owned(),
            })?
            .to_vec();
        let ys = detections
            .column("y")
            .ok_or_else(|| StepError::MissingColumn {
                column: "y".to_owned(),
                hint: POSITION_HINT.to_owned(),
            })?
            .to_vec();

        let frames = detections.frames().to_vec();
        let mut identities: Vec<Option<u64>> = vec![None; detections.len()];
        let mut active: Vec<ActiveTrack> = Vec::new();
        let mut next_id = 0u64;

        for frame in detections.frame_values() {
            active.retain(|track| frame - track.last_seen <= params.memory + 1);
            let mut claimed: Vec<u64> = Vec::new();
            for row in (0..detections.len()).filter(|&row| frames[row] == frame) {
                let (Some(x), Some(y)) = (xs[row], ys[row]) else {
                    continue;
                };
                let nearest = active
                    .iter_mut()
                    .filter(|track| !claimed.contains(&track.id))
                    .map(|track| {
                        let distance = (track.x - x).hypot(track.y - y);
                        (track, distance)
                    })
                    .filter(|(_, distance)| *distance <= params.search_range)
                    .min_by(|(_, a), (_, b)| a.total_cmp(b));
                let id = if let Some((track, _)) = nearest {
                    track.x = x;
                    track.y = y;
                    track.last_seen = frame;
                    track.id
                } else {
                    let id = next_id;
                    next_id += 1;
                    active.push(ActiveTrack {
                        id,
                        x,
                        y,
                        last_seen: frame,
                    });
                    id
                };
                claimed.push(id);
                identities[row] = Some(id);
            }
        }

        let mut linked = detections;
        linked.set_particles(identities).map_err(table_failure)?;
        Ok(linked)
    }
}

/// The `link` chain step: delegates to a [`Linker`].
///
/// Parameters: `search_range` (default 15.0), `memory` (default 0).
pub struct LinkStep {
    linker: Box<dyn Linker>,
}

impl LinkStep {
    /// Wrap any linking collaborator as a chain step.
    #[must_use]
    pub fn new(linker: Box<dyn Linker>) -> Self {
        Self { linker }
    }
}

impl TableStep for LinkStep {
    fn apply(
        &self,
        table: ParticleTable,
        ctx: &StepContext,
    ) -> Result<StepOutput<ParticleTable>, StepError> {
        let params = LinkParams {
            search_range: ctx.f64_or("search_range", 15.0)?,
            memory: ctx.u64_or("memory", 0)?,
        };
        Ok(StepOutput::Value(self.linker.link(table, params)?))
    }
}

// ────────────────────────── Postprocess steps ────────────────────────────

/// A windowed derived column (`difference`, `rolling_mean`,
/// `rolling_median`, `rate`).
///
/// Parameters: `column` (required), `span` (required, positive),
/// `output` (default `<column>_<suffix>`), and for `rate` an `fps`
/// (default 1.0). The computation runs over whatever table it receives
/// (the whole sequence in batch mode, the orchestrator-sized context
/// window in single-frame mode), so both modes share one code path.
pub struct WindowedStep {
    op: fn(&StepContext) -> Result<WindowOp, StepError>,
    suffix: &'static str,
}

impl WindowedStep {
    /// The `difference` step.
    #[must_use]
    pub fn difference() -> Self {
        Self {
            op: |_| Ok(WindowOp::Difference),
            suffix: "diff",
        }
    }

    /// The `rolling_mean` step.
    #[must_use]
    pub fn rolling_mean() -> Self {
        Self {
            op: |_| Ok(WindowOp::RollingMean),
            suffix: "mean",
        }
    }

    /// The `rolling_median` step.
    #[must_use]
    pub fn rolling_median() -> Self {
        Self {
            op: |_| Ok(WindowOp::RollingMedian),
            suffix: "median",
        }
    }

    /// The `rate` step (difference scaled by `fps`).
    #[must_use]
    pub fn rate() -> Self {
        Self {
            op: |ctx| {
                Ok(WindowOp::Rate {
                    fps: ctx.f64_or("fps", 1.0)?,
                })
            },
            suffix: "rate",
        }
    }
}

impl TableStep for WindowedStep {
    fn apply(
        &self,
        mut table: ParticleTable,
        ctx: &StepContext,
    ) -> Result<StepOutput<ParticleTable>, StepError> {
        let column = ctx.require_str("column")?;
        let span = ctx.require_span("span")?;
        let output = ctx.str_or("output", &format!("{column}_{}", self.suffix))?;
        let op = (self.op)(ctx)?;
        let values = windowed::windowed_column(&table, &column, span, op).map_err(|e| {
            column_failure(
                e,
                "requires an upstream step to have produced it (a Track detector or an earlier Postprocess step)",
            )
        })?;
        table.merge_column(&output, values).map_err(table_failure)?;
        Ok(StepOutput::Value(table))
    }
}

/// Drift-normalized trajectories (`drift`).
///
/// Parameters: `span` (smoothing width, default 1 = unsmoothed). Writes
/// `x_drift`/`y_drift`: positions with the ensemble drift subtracted.
pub struct DriftStep;

impl TableStep for DriftStep {
    fn apply(
        &self,
        mut table: ParticleTable,
        ctx: &StepContext,
    ) -> Result<StepOutput<ParticleTable>, StepError> {
        let span = ctx.u64_or("span", 1)?;
        let (xs, ys) = windowed::drift_corrected(&table, span)
            .map_err(|e| column_failure(e, POSITION_HINT))?;
        table.merge_column("x_drift", xs).map_err(table_failure)?;
        table.merge_column("y_drift", ys).map_err(table_failure)?;
        Ok(StepOutput::Value(table))
    }
}

/// Which neighbour relation the `neighbours` step builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NeighbourKind {
    Proximity,
    KdTree,
}

/// Per-frame neighbour counts (`neighbours`).
///
/// Parameters: `kind` (`"proximity"` default, or `"kdtree"`), `cutoff`
/// (default unlimited), `k` (k-NN only, default 6), `output` (default
/// `n_neighbours`). Writes each linked row's neighbour-list length; the
/// lists themselves are per-side authoritative and not symmetric after
/// cutoff filtering, so only the count is tabulated.
pub struct NeighbourStep;

impl TableStep for NeighbourStep {
    fn apply(
        &self,
        mut table: ParticleTable,
        ctx: &StepContext,
    ) -> Result<StepOutput<ParticleTable>, StepError> {
        let kind = match ctx.str_or("kind", "proximity")?.as_str() {
            "proximity" => NeighbourKind::Proximity,
            "kdtree" => NeighbourKind::KdTree,
            other => {
                return Err(StepError::InvalidParam {
                    param: "kind".to_owned(),
                    detail: format!("expected 'proximity' or 'kdtree', got '{other}'"),
                });
            }
        };
        let cutoff = ctx.f64_or("cutoff", f64::INFINITY)?;
        let k = usize::try_from(ctx.u64_or("k", 6)?).unwrap_or(usize::MAX);
        let output = ctx.str_or("output", "n_neighbours")?;

        let mut counts: Vec<Option<f64>> = vec![None; table.len()];
        for frame in table.frame_values() {
            let (rows, points) = frame_points(&table, frame)?;
            let lists = match kind {
                NeighbourKind::Proximity => spatial::proximity_graph_neighbours(&points, cutoff),
                NeighbourKind::KdTree => spatial::kdtree_neighbours(&points, k, cutoff),
            }
            .map_err(|e| StepError::Failed {
                detail: e.to_string(),
            })?;
            for (row, list) in rows.into_iter().zip(&lists) {
                #[allow(clippy::cast_precision_loss)]
                {
                    counts[row] = Some(list.len() as f64);
                }
            }
        }
        table.merge_column(&output, counts).map_err(table_failure)?;
        Ok(StepOutput::Value(table))
    }
}

/// Per-frame tessellation cell areas (`tessellation`).
///
/// Parameters: `output` (default `cell_area`). Cells open to infinity
/// are written as `+∞`: explicitly unbounded, never clipped to a
/// finite number.
pub struct TessellationStep;

impl TableStep for TessellationStep {
    fn apply(
        &self,
        mut table: ParticleTable,
        ctx: &StepContext,
    ) -> Result<StepOutput<ParticleTable>, StepError> {
        let output = ctx.str_or("output", "cell_area")?;
        let mut areas: Vec<Option<f64>> = vec![None; table.len()];
        for frame in table.frame_values() {
            let (rows, points) = frame_points(&table, frame)?;
            let cells = spatial::tessellation_areas(&points).map_err(|e| StepError::Failed {
                detail: e.to_string(),
            })?;
            for (row, cell) in rows.into_iter().zip(&cells) {
                areas[row] = Some(cell.as_f64());
            }
        }
        table.merge_column(&output, areas).map_err(table_failure)?;
        Ok(StepOutput::Value(table))
    }
}

/// Linked rows of one frame as spatial points, with their row indices.
///
/// Unlinked rows and rows with a missing/non-finite position are left
/// out (their derived values stay `None`).
fn frame_points(
    table: &ParticleTable,
    frame: u64,
) -> Result<(Vec<usize>, Vec<FramePoint>), StepError> {
    let xs = table.column("x").ok_or_else(|| StepError::MissingColumn {
        column: "x".to_owned(),
        hint: POSITION_HINT.to_owned(),
    })?;
    let ys = table.column("y").ok_or_else(|| StepError::MissingColumn {
        column: "y".to_owned(),
        hint: POSITION_HINT.to_owned(),
    })?;
    let mut rows = Vec::new();
    let mut points = Vec::new();
    for row in (0..table.len()).filter(|&row| table.frames()[row] == frame) {
        let Some(particle) = table.particles()[row] else {
            continue;
        };
        if let (Some(x), Some(y)) = (xs[row], ys[row])
            && x.is_finite()
            && y.is_finite()
        {
            rows.push(row);
            points.push(FramePoint { particle, x, y });
        }
    }
    Ok((rows, points))
}

// ─────────────────────────── Default registries ──────────────────────────

impl StepRegistries {
    /// Registries populated with the built-in steps.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registries = Self::empty();
        registries.crop.register("roi", Box::new(RoiCrop));
        registries.crop.register("circle_mask", Box::new(CircleMask));
        registries.preprocess.register("invert", Box::new(Invert));
        registries
            .preprocess
            .register("normalize", Box::new(Normalize));
        registries.track.register("centroid", Box::new(CentroidDetect));
        registries
            .link
            .register("link", Box::new(LinkStep::new(Box::new(NearestLinker))));
        registries
            .postprocess
            .register("difference", Box::new(WindowedStep::difference()));
        registries
            .postprocess
            .register("rolling_mean", Box::new(WindowedStep::rolling_mean()));
        registries
            .postprocess
            .register("rolling_median", Box::new(WindowedStep::rolling_median()));
        registries
            .postprocess
            .register("rate", Box::new(WindowedStep::rate()));
        registries.postprocess.register("drift", Box::new(DriftStep));
        registries
            .postprocess
            .register("neighbours", Box::new(NeighbourStep));
        registries
            .postprocess
            .register("tessellation", Box::new(TessellationStep));
        registries
    }
}

impl Default for StepRegistries {
    fn default() -> Self {
        Self::with_builtins()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::Params;

    fn ctx(pairs: &[(&str, serde_json::Value)]) -> StepContext {
        let params: Params = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), v.clone()))
            .collect();
        StepContext::new(Some(0), 0, params)
    }

    fn uniform_frame(width: u32, height: u32, value: u8) -> GrayImage {
        GrayImage::from_pixel(width, height, image::Luma([value]))
    }

    #[test]
    fn roi_crop_clamps_and_crops() {
        let frame = uniform_frame(10, 8, 50);
        let out = RoiCrop
            .apply(
                &frame,
                &ctx(&[
                    ("left", serde_json::json!(2)),
                    ("top", serde_json::json!(1)),
                    ("width", serde_json::json!(100)),
                    ("height", serde_json::json!(3)),
                ]),
            )
            .unwrap();
        match out {
            StepOutput::Value(cropped) => {
                assert_eq!((cropped.width(), cropped.height()), (8, 3));
            }
            StepOutput::Empty => unreachable!("crop always yields a frame"),
        }
    }

    #[test]
    fn roi_crop_zero_area_is_an_error() {
        let frame = uniform_frame(4, 4, 0);
        let result = RoiCrop.apply(&frame, &ctx(&[("left", serde_json::json!(4))]));
        assert!(matches!(result, Err(StepError::Failed { .. })));
    }

    #[test]
    fn circle_mask_zeroes_outside() {
        let frame = uniform_frame(9, 9, 200);
        let out = CircleMask
            .apply(&frame, &ctx(&[("radius", serde_json::json!(2.0))]))
            .unwrap();
        let StepOutput::Value(masked) = out else {
            unreachable!("mask always yields a frame");
        };
        assert_eq!(masked.get_pixel(4, 4).0[0], 200);
        assert_eq!(masked.get_pixel(0, 0).0[0], 0);
    }

    #[test]
    fn invert_flips_intensities() {
        let frame = uniform_frame(2, 2, 10);
        let StepOutput::Value(inverted) = Invert.apply(&frame, &ctx(&[])).unwrap() else {
            unreachable!("invert always yields a frame");
        };
        assert_eq!(inverted.get_pixel(0, 0).0[0], 245);
    }

    #[test]
    fn normalize_flat_frame_is_empty() {
        let frame = uniform_frame(3, 3, 77);
        assert!(matches!(
            Normalize.apply(&frame, &ctx(&[])).unwrap(),
            StepOutput::Empty
        ));
    }

    #[test]
    fn normalize_stretches_to_full_range() {
        let mut frame = uniform_frame(2, 1, 100);
        frame.put_pixel(1, 0, image::Luma([150]));
        let StepOutput::Value(stretched) = Normalize.apply(&frame, &ctx(&[])).unwrap() else {
            unreachable!("non-flat frame stretches");
        };
        assert_eq!(stretched.get_pixel(0, 0).0[0], 0);
        assert_eq!(stretched.get_pixel(1, 0).0[0], 255);
    }

    #[test]
    fn centroid_finds_bright_spot() {
        let mut frame = uniform_frame(11, 11, 0);
        frame.put_pixel(3, 6, image::Luma([200]));
        frame.put_pixel(4, 6, image::Luma([200]));
        let out = CentroidDetect
            .apply(&frame, &ctx(&[("threshold", serde_json::json!(10.0))]))
            .unwrap();
        let StepOutput::Value(rows) = out else {
            unreachable!("bright frame detects");
        };
        assert_eq!(rows.len(), 1);
        assert!((rows.value(0, "x").unwrap() - 3.5).abs() < 1e-9);
        assert!((rows.value(0, "y").unwrap() - 6.0).abs() < 1e-9);
        assert!((rows.value(0, "mass").unwrap() - 400.0).abs() < 1e-9);
    }

    #[test]
    fn centroid_dark_frame_is_empty() {
        let frame = uniform_frame(5, 5, 0);
        assert!(matches!(
            CentroidDetect.apply(&frame, &ctx(&[])).unwrap(),
            StepOutput::Empty
        ));
    }

    fn detections(rows: &[(u64, f64, f64)]) -> ParticleTable {
        let mut table = ParticleTable::new();
        for &(frame, x, y) in rows {
            table.push_row(frame, None, &[("x", x), ("y", y)]);
        }
        table
    }

    #[test]
    fn nearest_linker_follows_two_particles() {
        let table = detections(&[
            (0, 0.0, 0.0),
            (0, 10.0, 0.0),
            (1, 0.5, 0.2),
            (1, 10.4, 0.1),
            (2, 1.0, 0.4),
            (2, 10.8, 0.2),
        ]);
        let linked = NearestLinker
            .link(
                table,
                LinkParams {
                    search_range: 2.0,
                    memory: 0,
                },
            )
            .unwrap();
        let ids = linked.particles();
        assert_eq!(ids[0], ids[2]);
        assert_eq!(ids[2], ids[4]);
        assert_eq!(ids[1], ids[3]);
        assert_eq!(ids[3], ids[5]);
        assert_ne!(ids[0], ids[1]);
    }

    #[test]
    fn nearest_linker_memory_bridges_a_gap() {
        let gap = detections(&[(0, 5.0, 5.0), (2, 5.3, 5.1)]);
        let without_memory = NearestLinker
            .link(
                gap.clone(),
                LinkParams {
                    search_range: 2.0,
                    memory: 0,
                },
            )
            .unwrap();
        assert_ne!(without_memory.particles()[0], without_memory.particles()[1]);

        let with_memory = NearestLinker
            .link(
                gap,
                LinkParams {
                    search_range: 2.0,
                    memory: 1,
                },
            )
            .unwrap();
        assert_eq!(with_memory.particles()[0], with_memory.particles()[1]);
    }

    #[test]
    fn nearest_linker_requires_positions() {
        let mut table = ParticleTable::new();
        table.push_row(0, None, &[("mass", 4.0)]);
        let result = NearestLinker.link(
            table,
            LinkParams {
                search_range: 1.0,
                memory: 0,
            },
        );
        assert!(
            matches!(result, Err(StepError::MissingColumn { ref column, .. }) if column == "x")
        );
    }

    fn linked_pair() -> ParticleTable {
        let mut table = ParticleTable::new();
        for frame in 0..4u64 {
            #[allow(clippy::cast_precision_loss)]
            let t = frame as f64;
            table.push_row(frame, Some(1), &[("x", t), ("y", 0.0)]);
            table.push_row(frame, Some(2), &[("x", 5.0 + t), ("y", 1.0)]);
        }
        table
    }

    #[test]
    fn windowed_step_default_output_name() {
        let out = WindowedStep::rolling_mean()
            .apply(
                linked_pair(),
                &ctx(&[
                    ("column", serde_json::json!("x")),
                    ("span", serde_json::json!(2)),
                ]),
            )
            .unwrap();
        let StepOutput::Value(table) = out else {
            unreachable!("windowed steps always yield a table");
        };
        assert!(table.column("x_mean").is_some());
    }

    #[test]
    fn windowed_step_missing_column_names_prerequisite() {
        let err = WindowedStep::difference()
            .apply(
                linked_pair(),
                &ctx(&[
                    ("column", serde_json::json!("cell_area")),
                    ("span", serde_json::json!(2)),
                ]),
            )
            .unwrap_err();
        let StepError::MissingColumn { column, hint } = err else {
            unreachable!("missing column must be typed");
        };
        assert_eq!(column, "cell_area");
        assert!(hint.contains("Postprocess"));
    }

    #[test]
    fn drift_step_writes_both_columns() {
        let StepOutput::Value(table) = DriftStep.apply(linked_pair(), &ctx(&[])).unwrap() else {
            unreachable!("drift always yields a table");
        };
        assert!(table.column("x_drift").is_some());
        assert!(table.column("y_drift").is_some());
    }

    #[test]
    fn neighbour_step_counts_per_frame() {
        let StepOutput::Value(table) = NeighbourStep
            .apply(
                linked_pair(),
                &ctx(&[
                    ("kind", serde_json::json!("kdtree")),
                    ("cutoff", serde_json::json!(10.0)),
                    ("k", serde_json::json!(3)),
                ]),
            )
            .unwrap()
        else {
            unreachable!("neighbour step always yields a table");
        };
        let counts = table.column("n_neighbours").unwrap();
        // Two particles per frame, both within cutoff of each other.
        assert!(counts.iter().all(|count| *count == Some(1.0)));
    }

    #[test]
    fn neighbour_step_rejects_unknown_kind() {
        let result = NeighbourStep.apply(
            linked_pair(),
            &ctx(&[("kind", serde_json::json!("voronoi"))]),
        );
        assert!(matches!(result, Err(StepError::InvalidParam { .. })));
    }

    #[test]
    fn tessellation_step_marks_unbounded_cells() {
        let StepOutput::Value(table) = TessellationStep
            .apply(linked_pair(), &ctx(&[]))
            .unwrap()
        else {
            unreachable!("tessellation always yields a table");
        };
        let areas = table.column("cell_area").unwrap();
        // Two points per frame: every cell is open to infinity.
        assert!(areas.iter().all(|area| area.is_some_and(f64::is_infinite)));
    }

    #[test]
    fn default_registries_know_the_builtins() {
        let registries = StepRegistries::default();
        let names: Vec<&str> = registries.postprocess.names().collect();
        for expected in [
            "difference",
            "rolling_mean",
            "rolling_median",
            "rate",
            "drift",
            "neighbours",
            "tessellation",
        ] {
            assert!(names.contains(&expected), "missing {expected}");
        }
        assert!(registries.track.names().any(|n| n == "centroid"));
        assert!(registries.link.names().any(|n| n == "link"));
    }
}
