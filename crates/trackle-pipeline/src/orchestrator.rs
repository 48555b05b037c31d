//! The stage orchestrator: one state machine over
//! Crop → Preprocess → Track → Link → Postprocess → Annotate.
//!
//! Two execution modes share the staged data model and the chain code
//! paths:
//!
//! - **Batch** ([`Orchestrator::run`]): every enabled stage reads the
//!   prior stage's committed store and writes its own
//!   (`<base>_track.parquet`, `_link`, `_postprocess`), frame by frame,
//!   to completion.
//! - **Preview** ([`Orchestrator::preview`]): a single focus frame is
//!   re-evaluated. Stages at or below the lock level are skipped and
//!   their committed store is read as-is; stages above it run against
//!   the `_temp` store. Preview never mutates a committed store.
//!
//! A stage with an empty method chain performs an explicit identity copy
//! from its input store to its output store — never "do nothing and
//! leave stale data". A step failure aborts the current stage only:
//! earlier committed stages stay valid, and the caller gets the
//! originating stage and step plus the last good frame/output instead of
//! an unwound stack.

use std::path::PathBuf;

use image::{DynamicImage, GrayImage, RgbaImage};
use tracing::{debug, info};

use crate::chain::{self, StepRegistries};
use crate::config::{FrameSelector, LockLevel, PipelineConfig, StageKind};
use crate::error::{PipelineError, StageError};
use crate::source::FrameSource;
use crate::store::{FrameStore, StoreError, stage_path};
use crate::table::ParticleTable;

/// Per-stage enable flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnabledStages {
    /// Run the Crop chain.
    pub crop: bool,
    /// Run the Preprocess chain.
    pub preprocess: bool,
    /// Run the Track stage.
    pub track: bool,
    /// Run the Link stage.
    pub link: bool,
    /// Run the Postprocess stage.
    pub postprocess: bool,
    /// Run the Annotate chain.
    pub annotate: bool,
}

impl EnabledStages {
    /// Everything on.
    #[must_use]
    pub const fn all() -> Self {
        Self {
            crop: true,
            preprocess: true,
            track: true,
            link: true,
            postprocess: true,
            annotate: true,
        }
    }

    /// Whether one stage is enabled.
    #[must_use]
    pub const fn stage(self, stage: StageKind) -> bool {
        match stage {
            StageKind::Crop => self.crop,
            StageKind::Preprocess => self.preprocess,
            StageKind::Track => self.track,
            StageKind::Link => self.link,
            StageKind::Postprocess => self.postprocess,
            StageKind::Annotate => self.annotate,
        }
    }
}

impl Default for EnabledStages {
    fn default() -> Self {
        Self::all()
    }
}

/// Progress events for an external counter (GUI/CLI side channel, never
/// control flow).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// A stage began.
    StageStarted {
        /// The stage.
        stage: StageKind,
    },
    /// One frame of a per-frame stage finished.
    FrameDone {
        /// The stage.
        stage: StageKind,
        /// Frames finished so far.
        done: u64,
        /// Frames in the sequence.
        total: u64,
    },
    /// A stage finished and its store is committed.
    StageFinished {
        /// The stage.
        stage: StageKind,
    },
}

/// Outcome of a whole-sequence batch run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    /// Frames processed.
    pub frames: u64,
    /// Detection rows written by Track.
    pub detections: usize,
    /// Distinct trajectories after Link.
    pub trajectories: usize,
    /// Stages that ran (enabled), in order.
    pub stages_run: Vec<StageKind>,
}

/// What a single-frame preview hands back: always displayable, with any
/// failure attached rather than raised.
#[derive(Debug)]
pub struct PreviewFrame {
    /// The focus frame index.
    pub frame: u64,
    /// Display image: the last good image for this frame, annotated when
    /// the Annotate stage succeeded.
    pub image: RgbaImage,
    /// The focus frame's rows: the last good table output.
    pub rows: ParticleTable,
    /// The first failure encountered, if any. Stages before it produced
    /// the image/rows above; stages after it did not run.
    pub error: Option<PipelineError>,
}

impl PreviewFrame {
    /// Whether every stage completed.
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Outcome of [`Orchestrator::process`], by frame selector.
#[derive(Debug)]
pub enum Outcome {
    /// Whole-sequence batch result.
    Batch(RunSummary),
    /// Single-frame preview result.
    Preview(Box<PreviewFrame>),
}

/// The top-level pipeline state machine.
pub struct Orchestrator<'a> {
    config: &'a PipelineConfig,
    registries: &'a StepRegistries,
    base: PathBuf,
    enabled: EnabledStages,
    lock: LockLevel,
}

impl<'a> Orchestrator<'a> {
    /// Build an orchestrator for one data set.
    ///
    /// `base` is the data's base path; stage stores are named from it
    /// (`<base>_track.parquet`, …). All stages start enabled, lock level
    /// [`LockLevel::Unlocked`].
    #[must_use]
    pub fn new(
        config: &'a PipelineConfig,
        registries: &'a StepRegistries,
        base: impl Into<PathBuf>,
    ) -> Self {
        Self {
            config,
            registries,
            base: base.into(),
            enabled: EnabledStages::all(),
            lock: LockLevel::Unlocked,
        }
    }

    /// Replace the per-stage enable flags.
    #[must_use]
    pub const fn with_enabled(mut self, enabled: EnabledStages) -> Self {
        self.enabled = enabled;
        self
    }

    /// Set the lock level for preview.
    #[must_use]
    pub const fn with_lock(mut self, lock: LockLevel) -> Self {
        self.lock = lock;
        self
    }

    /// The current lock level.
    #[must_use]
    pub const fn lock(&self) -> LockLevel {
        self.lock
    }

    /// The committed store path for a stage.
    #[must_use]
    pub fn store_path(&self, stage: StageKind) -> PathBuf {
        stage_path(&self.base, stage.name())
    }

    /// The temporary (preview) store path.
    #[must_use]
    pub fn temp_path(&self) -> PathBuf {
        stage_path(&self.base, "temp")
    }

    /// Dispatch on the frame selector: batch or preview.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError`] only for batch failures; preview
    /// failures ride inside the [`PreviewFrame`].
    pub fn process(
        &self,
        source: &dyn FrameSource,
        selector: FrameSelector,
        progress: &mut dyn FnMut(Progress),
    ) -> Result<Outcome, PipelineError> {
        match selector {
            FrameSelector::Whole => Ok(Outcome::Batch(self.run(source, progress)?)),
            FrameSelector::Single(focus) => {
                Ok(Outcome::Preview(Box::new(self.preview(source, focus))))
            }
        }
    }

    // ───────────────────────────── Batch ─────────────────────────────

    /// Run the whole sequence through every enabled stage.
    ///
    /// # Errors
    ///
    /// Returns the first stage failure. Stages committed before it
    /// remain valid on disk.
    pub fn run(
        &self,
        source: &dyn FrameSource,
        progress: &mut dyn FnMut(Progress),
    ) -> Result<RunSummary, PipelineError> {
        self.run_with_annotations(source, progress, &mut |_, _| {})
    }

    /// Batch run that also delivers annotated frames to `sink`.
    ///
    /// Writing annotated frames anywhere is the caller's business
    /// (encoding is a collaborator concern); the sink receives each
    /// frame exactly once, in order.
    ///
    /// # Errors
    ///
    /// Returns the first stage failure.
    pub fn run_with_annotations(
        &self,
        source: &dyn FrameSource,
        progress: &mut dyn FnMut(Progress),
        sink: &mut dyn FnMut(u64, RgbaImage),
    ) -> Result<RunSummary, PipelineError> {
        let total = source.len();
        let mut summary = RunSummary {
            frames: total,
            detections: 0,
            trajectories: 0,
            stages_run: Vec::new(),
        };
        info!(base = %self.base.display(), frames = total, "batch run started");

        if self.enabled.track {
            progress(Progress::StageStarted {
                stage: StageKind::Track,
            });
            summary.detections = self.run_track_stage(source, total, progress)?;
            summary.stages_run.push(StageKind::Track);
            progress(Progress::StageFinished {
                stage: StageKind::Track,
            });
        }

        if self.enabled.link {
            progress(Progress::StageStarted {
                stage: StageKind::Link,
            });
            summary.trajectories = self.run_table_stage(StageKind::Link, StageKind::Track)?;
            summary.stages_run.push(StageKind::Link);
            progress(Progress::StageFinished {
                stage: StageKind::Link,
            });
        }

        if self.enabled.postprocess {
            progress(Progress::StageStarted {
                stage: StageKind::Postprocess,
            });
            self.run_table_stage(StageKind::Postprocess, StageKind::Link)?;
            summary.stages_run.push(StageKind::Postprocess);
            progress(Progress::StageFinished {
                stage: StageKind::Postprocess,
            });
        }

        if self.enabled.annotate && !self.config.chain(StageKind::Annotate).is_empty() {
            progress(Progress::StageStarted {
                stage: StageKind::Annotate,
            });
            self.run_annotate_stage(source, total, progress, sink)?;
            summary.stages_run.push(StageKind::Annotate);
            progress(Progress::StageFinished {
                stage: StageKind::Annotate,
            });
        }

        info!(
            detections = summary.detections,
            trajectories = summary.trajectories,
            "batch run finished",
        );
        Ok(summary)
    }

    /// Crop + Preprocess + Track over every frame, committed to the
    /// track store. Returns the number of detection rows.
    fn run_track_stage(
        &self,
        source: &dyn FrameSource,
        total: u64,
        progress: &mut dyn FnMut(Progress),
    ) -> Result<usize, PipelineError> {
        FrameStore::create(self.store_path(StageKind::Track)).scoped(|store| {
            let mut all = ParticleTable::new();
            for frame in 0..total {
                let image = self.prepared_frame(source, frame)?;
                let rows = chain::run_detect_chain(
                    &self.registries.track,
                    self.config,
                    StageKind::Track,
                    &image,
                    frame,
                )
                .map_err(|e| StageError::from_chain(StageKind::Track, e))?;
                all.append(&rows);
                progress(Progress::FrameDone {
                    stage: StageKind::Track,
                    done: frame + 1,
                    total,
                });
            }
            all.sort_by_frame();
            let count = all.len();
            store.set_meta("source_frames", serde_json::json!(total));
            store.replace(all);
            debug!(rows = count, "track stage committed");
            Ok(count)
        })
    }

    /// One whole-table stage: read the prior stage's committed store,
    /// run the chain, commit the result. The store is seeded with an
    /// identity copy of its input first, so an empty chain is an
    /// explicit copy and a failed chain still commits a valid file.
    /// Returns the distinct-trajectory count of the result.
    fn run_table_stage(&self, stage: StageKind, input: StageKind) -> Result<usize, PipelineError> {
        let input_store = self.load_committed(input)?;
        FrameStore::create(self.store_path(stage)).scoped(|store| {
            store.replace(input_store.table().clone());
            let table = chain::run_table_chain(
                registry_for(self.registries, stage),
                self.config,
                stage,
                input_store.table().clone(),
                None,
            )
            .map_err(|e| StageError::from_chain(stage, e))?;
            let trajectories = table.group_by_particle().len();
            store.replace(table);
            debug!(stage = %stage, trajectories, "table stage committed");
            Ok(trajectories)
        })
    }

    /// Annotate every frame against the postprocess store, delivering
    /// results to the caller's sink.
    fn run_annotate_stage(
        &self,
        source: &dyn FrameSource,
        total: u64,
        progress: &mut dyn FnMut(Progress),
        sink: &mut dyn FnMut(u64, RgbaImage),
    ) -> Result<(), PipelineError> {
        let store = self.load_committed(StageKind::Postprocess)?;
        for frame in 0..total {
            let image = to_display(&self.prepared_frame(source, frame)?);
            let rows = store.get_frame(frame);
            let annotated = chain::run_annotate_chain(
                &self.registries.annotate,
                self.config,
                StageKind::Annotate,
                image,
                &rows,
                frame,
            )
            .map_err(|e| StageError::from_chain(StageKind::Annotate, e))?;
            sink(frame, annotated);
            progress(Progress::FrameDone {
                stage: StageKind::Annotate,
                done: frame + 1,
                total,
            });
        }
        Ok(())
    }

    // ──────────────────────────── Preview ────────────────────────────

    /// Re-evaluate a single focus frame.
    ///
    /// Stages at or below the lock level are skipped (their committed
    /// store is read as-is); stages above it run on the focus frame
    /// alone. Before Postprocess, a context window of
    /// `focus ± max_span / 2` is read from the committed Link store when
    /// Link is locked, so windowed steps see real history; only the
    /// focus frame's rows are written back, into the `_temp` store.
    ///
    /// Never returns an error: the result always carries a displayable
    /// image and the last good rows, with any failure attached.
    #[must_use]
    pub fn preview(&self, source: &dyn FrameSource, focus: u64) -> PreviewFrame {
        let mut error: Option<PipelineError> = None;

        // Image stages run for display regardless of lock level; frames
        // are not stored, so recomputing is the committed behaviour.
        let mut image = match source.frame(focus) {
            Ok(image) => image,
            Err(e) => {
                return PreviewFrame {
                    frame: focus,
                    image: to_display(&GrayImage::new(1, 1)),
                    rows: ParticleTable::new(),
                    error: Some(e.into()),
                };
            }
        };
        for stage in [StageKind::Crop, StageKind::Preprocess] {
            if error.is_none() && self.enabled.stage(stage) {
                match chain::run_image_chain(
                    image_registry(self.registries, stage),
                    self.config,
                    stage,
                    image.clone(),
                    focus,
                ) {
                    Ok(next) => image = next,
                    Err(e) => error = Some(StageError::from_chain(stage, e).into()),
                }
            }
        }

        // Table stages: seed rows + context per the lock level.
        let mut rows = ParticleTable::new();
        let mut context = ParticleTable::new();
        if error.is_none() {
            match self.preview_rows(&image, focus) {
                Ok((focus_rows, window)) => {
                    rows = focus_rows;
                    context = window;
                }
                Err(e) => error = Some(e),
            }
        }

        if error.is_none() && self.enabled.postprocess {
            match chain::run_table_chain(
                &self.registries.postprocess,
                self.config,
                StageKind::Postprocess,
                context,
                Some(focus),
            ) {
                Ok(processed) => rows = processed.frame_slice(focus),
                Err(e) => {
                    error = Some(StageError::from_chain(StageKind::Postprocess, e).into());
                }
            }
        }

        // The temp store holds exactly the focus frame and is freely
        // overwritten on every preview step.
        if error.is_none() {
            let mut temp = FrameStore::create(self.temp_path());
            temp.replace(rows.clone());
            if let Err(e) = temp.save(None) {
                error = Some(e.into());
            }
        }

        let mut display = to_display(&image);
        if error.is_none() && self.enabled.annotate {
            match chain::run_annotate_chain(
                &self.registries.annotate,
                self.config,
                StageKind::Annotate,
                display.clone(),
                &rows,
                focus,
            ) {
                Ok(annotated) => display = annotated,
                Err(e) => error = Some(StageError::from_chain(StageKind::Annotate, e).into()),
            }
        }

        PreviewFrame {
            frame: focus,
            image: display,
            rows,
            error,
        }
    }

    /// Focus-frame rows plus the Postprocess context window, per lock
    /// level.
    fn preview_rows(
        &self,
        image: &GrayImage,
        focus: u64,
    ) -> Result<(ParticleTable, ParticleTable), PipelineError> {
        if self.lock.covers(StageKind::Link) {
            // Track and Link are frozen: read the committed Link store,
            // and hand Postprocess a window of focus ± half the largest
            // configured span (clamped at the sequence edges).
            let store = self.load_committed(StageKind::Link)?;
            let half = i64::try_from(self.config.max_span(StageKind::Postprocess) / 2)
                .unwrap_or(i64::MAX);
            let focus_signed = i64::try_from(focus).unwrap_or(i64::MAX);
            let context =
                store.get_range(focus_signed.saturating_sub(half), focus_signed.saturating_add(half));
            return Ok((store.get_frame(focus), context));
        }

        let detections = if self.lock.covers(StageKind::Track) {
            // Track is frozen: seed from its committed output.
            self.load_committed(StageKind::Track)?.get_frame(focus)
        } else if self.enabled.track {
            // Fully unlocked: detect on the freshly prepared frame.
            chain::run_detect_chain(
                &self.registries.track,
                self.config,
                StageKind::Track,
                image,
                focus,
            )
            .map_err(|e| StageError::from_chain(StageKind::Track, e))?
        } else {
            ParticleTable::new()
        };

        let rows = if self.enabled.link {
            // Single-frame linking: identities are fabricated within the
            // frame and are not comparable to committed ones.
            chain::run_table_chain(
                &self.registries.link,
                self.config,
                StageKind::Link,
                detections,
                Some(focus),
            )
            .map_err(|e| StageError::from_chain(StageKind::Link, e))?
        } else {
            detections
        };
        Ok((rows.clone(), rows))
    }

    // ──────────────────────────── Helpers ────────────────────────────

    /// Source frame with the Crop and Preprocess chains applied.
    fn prepared_frame(
        &self,
        source: &dyn FrameSource,
        frame: u64,
    ) -> Result<GrayImage, PipelineError> {
        let mut image = source.frame(frame)?;
        for stage in [StageKind::Crop, StageKind::Preprocess] {
            if self.enabled.stage(stage) {
                image = chain::run_image_chain(
                    image_registry(self.registries, stage),
                    self.config,
                    stage,
                    image,
                    frame,
                )
                .map_err(|e| StageError::from_chain(stage, e))?;
            }
        }
        Ok(image)
    }

    /// Load a stage's committed store, mapping an absent file to
    /// [`PipelineError::MissingStore`].
    fn load_committed(&self, stage: StageKind) -> Result<FrameStore, PipelineError> {
        let path = self.store_path(stage);
        FrameStore::load(&path).map_err(|error| {
            if let StoreError::Open { source, .. } = &error
                && source.kind() == std::io::ErrorKind::NotFound
            {
                return PipelineError::MissingStore { stage, path };
            }
            PipelineError::Store(error)
        })
    }
}

/// The table-step registry owning a given stage.
fn registry_for(
    registries: &StepRegistries,
    stage: StageKind,
) -> &chain::Registry<dyn chain::TableStep> {
    match stage {
        StageKind::Link => &registries.link,
        _ => &registries.postprocess,
    }
}

/// The image-step registry owning a given stage.
fn image_registry(
    registries: &StepRegistries,
    stage: StageKind,
) -> &chain::Registry<dyn chain::ImageStep> {
    match stage {
        StageKind::Crop => &registries.crop,
        _ => &registries.preprocess,
    }
}

/// Grayscale working frame to RGBA display image.
fn to_display(image: &GrayImage) -> RgbaImage {
    DynamicImage::ImageLuma8(image.clone()).to_rgba8()
}
