//! End-to-end orchestration scenarios: batch runs, lock-level preview,
//! and windowed context propagation.

#![allow(clippy::unwrap_used)]

use image::{GrayImage, RgbaImage};
use trackle_pipeline::chain::{AnnotateStep, DetectStep, StepContext, StepError, StepOutput};
use trackle_pipeline::config::Params;
use trackle_pipeline::orchestrator::Orchestrator;
use trackle_pipeline::source::MemorySequence;
use trackle_pipeline::store::stage_path;
use trackle_pipeline::{
    FrameStore, LockLevel, ParticleTable, PipelineConfig, StageKind, StepRegistries,
};

/// Three synthetic particles per frame at fixed offsets, drifting right
/// one pixel per frame — a detector standing in for the real locators
/// that collaborator crates register.
struct TripleDetect;

impl DetectStep for TripleDetect {
    fn apply(
        &self,
        _frame: &GrayImage,
        ctx: &StepContext,
    ) -> Result<StepOutput<ParticleTable>, StepError> {
        let frame = ctx.frame().unwrap_or(0);
        #[allow(clippy::cast_precision_loss)]
        let t = frame as f64;
        let mut rows = ParticleTable::new();
        for (offset_x, offset_y) in [(5.0, 5.0), (15.0, 6.0), (9.0, 18.0)] {
            rows.push_row(
                frame,
                None,
                &[("x", offset_x + t), ("y", offset_y), ("mass", 100.0)],
            );
        }
        Ok(StepOutput::Value(rows))
    }
}

fn blank_clip(frames: u64) -> MemorySequence {
    MemorySequence::new((0..frames).map(|_| GrayImage::new(32, 32)).collect())
}

fn registries_with_triple() -> StepRegistries {
    let mut registries = StepRegistries::default();
    registries.track.register("triple", Box::new(TripleDetect));
    registries
}

fn json_params(pairs: &[(&str, serde_json::Value)]) -> Params {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_owned(), v.clone()))
        .collect()
}

fn full_config() -> PipelineConfig {
    let mut config = PipelineConfig::new();
    config.push_step(StageKind::Track, "triple", Params::new());
    config.push_step(
        StageKind::Link,
        "link",
        json_params(&[("search_range", serde_json::json!(2.5))]),
    );
    config.push_step(
        StageKind::Postprocess,
        "rolling_mean",
        json_params(&[
            ("column", serde_json::json!("x")),
            ("span", serde_json::json!(3)),
        ]),
    );
    config.push_step(
        StageKind::Postprocess,
        "rate",
        json_params(&[
            ("column", serde_json::json!("x")),
            ("span", serde_json::json!(2)),
            ("fps", serde_json::json!(10.0)),
        ]),
    );
    config.push_step(
        StageKind::Postprocess,
        "neighbours",
        json_params(&[("cutoff", serde_json::json!(50.0))]),
    );
    config.push_step(StageKind::Postprocess, "tessellation", Params::new());
    config
}

#[test]
fn batch_pipeline_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("clip");
    let config = full_config();
    let registries = registries_with_triple();
    let orchestrator = Orchestrator::new(&config, &registries, &base);

    let summary = orchestrator.run(&blank_clip(6), &mut |_| {}).unwrap();
    assert_eq!(summary.frames, 6);
    assert_eq!(summary.detections, 18);
    assert_eq!(summary.trajectories, 3);

    let store = FrameStore::load(stage_path(&base, "postprocess")).unwrap();
    let table = store.table();
    for column in ["x", "y", "mass", "x_mean", "x_rate", "n_neighbours", "cell_area"] {
        assert!(table.column(column).is_some(), "missing column {column}");
    }
    // Rate at frame 5: (x(5) - x(3)) * fps = 2 * 10.
    let row = (0..table.len())
        .find(|&r| table.frames()[r] == 5 && table.value(r, "x").unwrap() < 12.0)
        .unwrap();
    assert!((table.value(row, "x_rate").unwrap() - 20.0).abs() < 1e-9);
    // Three particles per frame: tessellation cells are all unbounded,
    // and the proximity graph connects everything within the cutoff.
    assert!(
        table
            .column("cell_area")
            .unwrap()
            .iter()
            .all(|a| a.is_some_and(f64::is_infinite))
    );
    assert!(
        table
            .column("n_neighbours")
            .unwrap()
            .iter()
            .all(|n| *n == Some(2.0))
    );
}

#[test]
fn link_locked_preview_reads_committed_store_with_span_context() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("clip");

    // A committed Link store the preview must treat as authoritative:
    // one particle with x equal to its frame index over frames 0..=20.
    let mut link = FrameStore::create(stage_path(&base, "link"));
    let mut table = ParticleTable::new();
    for frame in 0..=20u64 {
        #[allow(clippy::cast_precision_loss)]
        table.push_row(frame, Some(1), &[("x", frame as f64), ("y", 4.0)]);
    }
    link.replace(table.clone());
    link.save(None).unwrap();

    // Track/Link chains are configured but must be skipped under the
    // lock; if they ran, the blank frames would detect nothing and x
    // values would vanish.
    let mut config = full_config();
    config.push_step(StageKind::Postprocess, "drift", Params::new());
    let registries = registries_with_triple();
    let orchestrator =
        Orchestrator::new(&config, &registries, &base).with_lock(LockLevel::LinkLocked);

    let preview = orchestrator.preview(&blank_clip(21), 10);
    assert!(preview.is_ok(), "unexpected error: {:?}", preview.error);

    // Focus rows come from the committed store, not from detection.
    assert_eq!(preview.rows.len(), 1);
    assert_eq!(preview.rows.frames(), &[10]);
    assert!((preview.rows.value(0, "x").unwrap() - 10.0).abs() < 1e-9);

    // max span is 3 -> half span 1 -> context frames [9, 11]. The
    // rolling mean (span 3, trailing) at frame 10 therefore sees frames
    // {9, 10}: mean 9.5. Without the context window it would be 10.0;
    // with the whole table it would be 9.0.
    assert!((preview.rows.value(0, "x_mean").unwrap() - 9.5).abs() < 1e-9);

    // Only the focus frame lands in the temp store.
    let temp = FrameStore::load(stage_path(&base, "temp")).unwrap();
    assert_eq!(temp.table().frame_values(), vec![10]);
    assert!(temp.table().column("x_mean").is_some());

    // The committed store is untouched: same rows, no derived columns.
    let reloaded = FrameStore::load(stage_path(&base, "link")).unwrap();
    assert_eq!(reloaded.table(), &table);
    assert!(reloaded.table().column("x_mean").is_none());
}

#[test]
fn track_locked_preview_relinks_the_single_frame() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("clip");

    // A committed Track store: unlinked detections.
    let mut track = FrameStore::create(stage_path(&base, "track"));
    let mut table = ParticleTable::new();
    for frame in 0..5u64 {
        table.push_row(frame, None, &[("x", 3.0), ("y", 4.0)]);
        table.push_row(frame, None, &[("x", 20.0), ("y", 4.0)]);
    }
    track.replace(table);
    track.save(None).unwrap();

    let mut config = PipelineConfig::new();
    config.push_step(StageKind::Track, "triple", Params::new());
    config.push_step(
        StageKind::Link,
        "link",
        json_params(&[("search_range", serde_json::json!(2.5))]),
    );
    let registries = registries_with_triple();
    let orchestrator =
        Orchestrator::new(&config, &registries, &base).with_lock(LockLevel::TrackLocked);

    let preview = orchestrator.preview(&blank_clip(5), 3);
    assert!(preview.is_ok(), "unexpected error: {:?}", preview.error);
    // The committed detections for frame 3 were re-linked within the
    // frame: fresh identities, one per detection, not the detector's
    // three synthetic rows.
    assert_eq!(preview.rows.len(), 2);
    let mut ids: Vec<u64> = preview.rows.particles().iter().map(|p| p.unwrap()).collect();
    ids.sort_unstable();
    assert_eq!(ids, vec![0, 1]);
}

#[test]
fn preview_failure_reports_stage_and_step_and_returns_last_good() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("clip");

    let mut config = PipelineConfig::new();
    config.push_step(StageKind::Track, "triple", Params::new());
    config.push_step(StageKind::Link, "link", Params::new());
    // Postprocess step over a column no step produces.
    config.push_step(
        StageKind::Postprocess,
        "rolling_median",
        json_params(&[
            ("column", serde_json::json!("bbox_w")),
            ("span", serde_json::json!(3)),
        ]),
    );
    let registries = registries_with_triple();
    let orchestrator = Orchestrator::new(&config, &registries, &base);

    let preview = orchestrator.preview(&blank_clip(4), 1);
    let error = preview.error.as_ref().unwrap();
    let trackle_pipeline::PipelineError::Stage(stage_error) = error else {
        unreachable!("expected a stage error, got {error:?}");
    };
    assert_eq!(stage_error.stage(), StageKind::Postprocess);
    assert_eq!(stage_error.step(), "rolling_median");
    // Last good output: the linked focus rows survive the failure.
    assert_eq!(preview.rows.len(), 3);
    assert!(preview.rows.particles().iter().all(Option::is_some));
    // Nothing was committed.
    assert!(!stage_path(&base, "postprocess").exists());
}

/// Marks each particle's pixel red; `Empty` when the frame has no rows
/// (nothing to draw is a state, not a failure).
struct MarkParticles;

impl AnnotateStep for MarkParticles {
    fn apply(
        &self,
        mut image: RgbaImage,
        rows: &ParticleTable,
        _ctx: &StepContext,
    ) -> Result<StepOutput<RgbaImage>, StepError> {
        if rows.is_empty() {
            return Ok(StepOutput::Empty);
        }
        for row in 0..rows.len() {
            if let (Some(x), Some(y)) = (rows.value(row, "x"), rows.value(row, "y")) {
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                let (px, py) = (x.round() as u32, y.round() as u32);
                if px < image.width() && py < image.height() {
                    image.put_pixel(px, py, image::Rgba([255, 0, 0, 255]));
                }
            }
        }
        Ok(StepOutput::Value(image))
    }
}

#[test]
fn annotate_chain_draws_rows_and_skips_blank_frames() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("clip");

    let mut config = PipelineConfig::new();
    config.push_step(StageKind::Track, "triple", Params::new());
    config.push_step(
        StageKind::Link,
        "link",
        json_params(&[("search_range", serde_json::json!(2.5))]),
    );
    config.push_step(StageKind::Annotate, "mark", Params::new());
    let mut registries = registries_with_triple();
    registries.annotate.register("mark", Box::new(MarkParticles));
    let orchestrator = Orchestrator::new(&config, &registries, &base);

    // Preview: the annotate chain paints the detected positions.
    let preview = orchestrator.preview(&blank_clip(4), 2);
    assert!(preview.is_ok(), "unexpected error: {:?}", preview.error);
    // Particle at (5 + 2, 5) for frame 2.
    assert_eq!(preview.image.get_pixel(7, 5).0, [255, 0, 0, 255]);
    assert_eq!(preview.image.get_pixel(0, 0).0, [0, 0, 0, 255]);

    // Batch: annotated frames flow to the caller's sink, one per frame.
    orchestrator.run(&blank_clip(4), &mut |_| {}).unwrap();
    let mut delivered = Vec::new();
    orchestrator
        .run_with_annotations(&blank_clip(4), &mut |_| {}, &mut |frame, image| {
            delivered.push((frame, image));
        })
        .unwrap();
    assert_eq!(delivered.len(), 4);
    assert_eq!(delivered[0].0, 0);
    assert_eq!(delivered[3].1.get_pixel(8, 5).0, [255, 0, 0, 255]);
}

#[test]
fn repeated_steps_compose_under_call_indices() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("clip");

    let mut config = PipelineConfig::new();
    config.push_step(StageKind::Track, "triple", Params::new());
    config.push_step(
        StageKind::Link,
        "link",
        json_params(&[("search_range", serde_json::json!(2.5))]),
    );
    // The same step twice with different configurations: x then y.
    config.push_step(
        StageKind::Postprocess,
        "rolling_mean",
        json_params(&[
            ("column", serde_json::json!("x")),
            ("span", serde_json::json!(2)),
            ("output", serde_json::json!("x_smooth")),
        ]),
    );
    config.push_step(
        StageKind::Postprocess,
        "rolling_mean",
        json_params(&[
            ("column", serde_json::json!("y")),
            ("span", serde_json::json!(2)),
            ("output", serde_json::json!("y_smooth")),
        ]),
    );
    let registries = registries_with_triple();
    let orchestrator = Orchestrator::new(&config, &registries, &base);
    orchestrator.run(&blank_clip(4), &mut |_| {}).unwrap();

    let store = FrameStore::load(stage_path(&base, "postprocess")).unwrap();
    assert!(store.table().column("x_smooth").is_some());
    assert!(store.table().column("y_smooth").is_some());
}
