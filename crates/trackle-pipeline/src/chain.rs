//! Method chains: step capability traits, name-based registries, and the
//! uniform invocation path.
//!
//! Every configured step resolves in two explicit phases:
//!
//! 1. **Resolve** — registry lookup by base name (unknown names are a
//!    [`StepError::MethodNotFound`], not a runtime attribute error) and
//!    parameter-block resolution from the configuration document (full
//!    `name*N` key first, base-name fallback).
//! 2. **Invoke** — the handler is called with the payload, the frame
//!    index, and its already-resolved parameters via [`StepContext`].
//!
//! Steps return a tagged [`StepOutput`]: `Value` carries the transformed
//! payload, `Empty` means "nothing to contribute for this input"; a
//! deliberate state distinct from an error, so callers can tell a blank
//! frame from a broken step. Configuration is handed to steps as a copy;
//! a step can never mutate the shared document.

use image::{GrayImage, RgbaImage};
use indexmap::IndexMap;

use crate::config::{MethodKey, Params, PipelineConfig, StageKind};
use crate::table::ParticleTable;

/// Failure of a single configured step.
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    /// No registered method under the requested name.
    #[error("no method registered under '{step}'")]
    MethodNotFound {
        /// Full step identifier (`name` or `name*N`).
        step: String,
    },

    /// The step requires a column an upstream step has not produced.
    #[error("column '{column}' is missing: {hint}")]
    MissingColumn {
        /// The absent column.
        column: String,
        /// Which upstream step/stage would have produced it.
        hint: String,
    },

    /// A parameter is absent or has the wrong shape.
    #[error("parameter '{param}': {detail}")]
    InvalidParam {
        /// Parameter name.
        param: String,
        /// What was wrong.
        detail: String,
    },

    /// The step ran and failed.
    #[error("{detail}")]
    Failed {
        /// Human-readable failure description.
        detail: String,
    },
}

/// Tagged step result: a transformed value, or explicitly nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutput<T> {
    /// The step produced a value; it becomes the next step's input.
    Value(T),
    /// The step had nothing to contribute (no data this frame). The
    /// previous value flows on unchanged.
    Empty,
}

/// Per-invocation context handed to every step.
///
/// Carries the focus frame (`None` in whole-table batch mode), the call
/// index distinguishing repeated steps, and the resolved parameter block.
#[derive(Debug, Clone)]
pub struct StepContext {
    frame: Option<u64>,
    call: usize,
    params: Params,
}

impl StepContext {
    /// Build a context from already-resolved parameters.
    #[must_use]
    pub const fn new(frame: Option<u64>, call: usize, params: Params) -> Self {
        Self {
            frame,
            call,
            params,
        }
    }

    /// Focus frame index, or `None` in whole-table mode.
    #[must_use]
    pub const fn frame(&self) -> Option<u64> {
        self.frame
    }

    /// Call index of this step within its chain (0 for `name`, N for
    /// `name*N`).
    #[must_use]
    pub const fn call(&self) -> usize {
        self.call
    }

    /// Raw parameter value, if present.
    #[must_use]
    pub fn raw(&self, name: &str) -> Option<&serde_json::Value> {
        self.params.get(name)
    }

    /// Float parameter with a default.
    ///
    /// # Errors
    ///
    /// Returns [`StepError::InvalidParam`] when present but not numeric.
    pub fn f64_or(&self, name: &str, default: f64) -> Result<f64, StepError> {
        match self.params.get(name) {
            None => Ok(default),
            Some(value) => value.as_f64().ok_or_else(|| StepError::InvalidParam {
                param: name.to_owned(),
                detail: format!("expected a number, got {value}"),
            }),
        }
    }

    /// Integer parameter with a default.
    ///
    /// # Errors
    ///
    /// Returns [`StepError::InvalidParam`] when present but not a
    /// non-negative integer.
    pub fn u64_or(&self, name: &str, default: u64) -> Result<u64, StepError> {
        match self.params.get(name) {
            None => Ok(default),
            Some(value) => value.as_u64().ok_or_else(|| StepError::InvalidParam {
                param: name.to_owned(),
                detail: format!("expected a non-negative integer, got {value}"),
            }),
        }
    }

    /// String parameter with a default.
    ///
    /// # Errors
    ///
    /// Returns [`StepError::InvalidParam`] when present but not a string.
    pub fn str_or(&self, name: &str, default: &str) -> Result<String, StepError> {
        match self.params.get(name) {
            None => Ok(default.to_owned()),
            Some(value) => value
                .as_str()
                .map(ToOwned::to_owned)
                .ok_or_else(|| StepError::InvalidParam {
                    param: name.to_owned(),
                    detail: format!("expected a string, got {value}"),
                }),
        }
    }

    /// Required string parameter.
    ///
    /// # Errors
    ///
    /// Returns [`StepError::InvalidParam`] when absent or not a string.
    pub fn require_str(&self, name: &str) -> Result<String, StepError> {
        match self.params.get(name) {
            None => Err(StepError::InvalidParam {
                param: name.to_owned(),
                detail: "required parameter is missing".to_owned(),
            }),
            Some(_) => self.str_or(name, ""),
        }
    }

    /// Required positive integer parameter.
    ///
    /// # Errors
    ///
    /// Returns [`StepError::InvalidParam`] when absent, non-integer, or
    /// zero.
    pub fn require_span(&self, name: &str) -> Result<u64, StepError> {
        let span = match self.params.get(name) {
            None => Err(StepError::InvalidParam {
                param: name.to_owned(),
                detail: "required parameter is missing".to_owned(),
            }),
            Some(_) => self.u64_or(name, 0),
        }?;
        if span == 0 {
            return Err(StepError::InvalidParam {
                param: name.to_owned(),
                detail: "must be a positive integer".to_owned(),
            });
        }
        Ok(span)
    }
}

// ───────────────────────── Step capability traits ────────────────────────

/// Image-to-image step (Crop and Preprocess chains).
pub trait ImageStep {
    /// Transform one frame.
    ///
    /// # Errors
    ///
    /// Returns [`StepError`] when parameters are invalid or the
    /// transformation fails.
    fn apply(&self, frame: &GrayImage, ctx: &StepContext) -> Result<StepOutput<GrayImage>, StepError>;
}

/// Image-to-detections step (Track chain). Each detector contributes
/// rows for the current frame; `Empty` means no detections.
pub trait DetectStep {
    /// Detect particles in one frame.
    ///
    /// # Errors
    ///
    /// Returns [`StepError`] when parameters are invalid or detection
    /// fails outright (distinct from finding nothing).
    fn apply(
        &self,
        frame: &GrayImage,
        ctx: &StepContext,
    ) -> Result<StepOutput<ParticleTable>, StepError>;
}

/// Table-to-table step (Link and Postprocess chains).
pub trait TableStep {
    /// Transform the table; the result feeds the next step.
    ///
    /// # Errors
    ///
    /// Returns [`StepError`] when a prerequisite column is missing,
    /// parameters are invalid, or the computation fails.
    fn apply(
        &self,
        table: ParticleTable,
        ctx: &StepContext,
    ) -> Result<StepOutput<ParticleTable>, StepError>;
}

/// Overlay step (Annotate chain): draws this frame's rows onto a display
/// image. `Empty` means nothing to draw for this frame.
pub trait AnnotateStep {
    /// Render overlays for one frame.
    ///
    /// # Errors
    ///
    /// Returns [`StepError`] when the step is misconfigured or rendering
    /// fails (distinct from having nothing to draw).
    fn apply(
        &self,
        image: RgbaImage,
        rows: &ParticleTable,
        ctx: &StepContext,
    ) -> Result<StepOutput<RgbaImage>, StepError>;
}

// ───────────────────────────── Registries ────────────────────────────────

/// Name-to-handler registry for one step capability.
pub struct Registry<S: ?Sized> {
    steps: IndexMap<String, Box<S>>,
}

impl<S: ?Sized> Default for Registry<S> {
    fn default() -> Self {
        Self {
            steps: IndexMap::new(),
        }
    }
}

impl<S: ?Sized> Registry<S> {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a handler under a base method name.
    pub fn register(&mut self, name: &str, step: Box<S>) {
        self.steps.insert(name.to_owned(), step);
    }

    /// Resolve a configured step to its handler by base name.
    ///
    /// # Errors
    ///
    /// Returns [`StepError::MethodNotFound`] naming the full step
    /// identifier when nothing is registered under its base name.
    pub fn resolve(&self, key: &MethodKey) -> Result<&S, StepError> {
        self.steps
            .get(key.base())
            .map(|step| &**step)
            .ok_or_else(|| StepError::MethodNotFound {
                step: key.to_string(),
            })
    }

    /// Registered base names, in registration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.steps.keys().map(String::as_str)
    }
}

/// The full set of registries, one per chain payload shape.
pub struct StepRegistries {
    /// Crop chain steps.
    pub crop: Registry<dyn ImageStep>,
    /// Preprocess chain steps.
    pub preprocess: Registry<dyn ImageStep>,
    /// Track chain detectors.
    pub track: Registry<dyn DetectStep>,
    /// Link chain steps.
    pub link: Registry<dyn TableStep>,
    /// Postprocess chain steps.
    pub postprocess: Registry<dyn TableStep>,
    /// Annotate chain steps.
    pub annotate: Registry<dyn AnnotateStep>,
}

impl StepRegistries {
    /// Registries with nothing registered (collaborators add their own).
    #[must_use]
    pub fn empty() -> Self {
        Self {
            crop: Registry::new(),
            preprocess: Registry::new(),
            track: Registry::new(),
            link: Registry::new(),
            postprocess: Registry::new(),
            annotate: Registry::new(),
        }
    }
}

// ─────────────────────────── Chain invocation ────────────────────────────

/// A step failure annotated with the offending step's full identifier.
#[derive(Debug, thiserror::Error)]
#[error("step '{step}' failed: {source}")]
pub struct ChainError {
    /// Full identifier of the failing step.
    pub step: String,
    /// The underlying step failure.
    #[source]
    pub source: StepError,
}

fn context(config: &PipelineConfig, stage: StageKind, key: &MethodKey, frame: Option<u64>) -> StepContext {
    StepContext::new(frame, key.call(), config.resolved_params(stage, key))
}

fn annotate_err(key: &MethodKey) -> impl FnOnce(StepError) -> ChainError {
    let step = key.to_string();
    move |source| ChainError { step, source }
}

/// Run an image chain left-to-right; each step's output feeds the next.
///
/// # Errors
///
/// Returns the first failing step's [`ChainError`].
pub fn run_image_chain(
    registry: &Registry<dyn ImageStep>,
    config: &PipelineConfig,
    stage: StageKind,
    mut image: GrayImage,
    frame: u64,
) -> Result<GrayImage, ChainError> {
    for key in config.chain(stage) {
        let step = registry.resolve(key).map_err(annotate_err(key))?;
        let ctx = context(config, stage, key, Some(frame));
        match step.apply(&image, &ctx).map_err(annotate_err(key))? {
            StepOutput::Value(next) => image = next,
            StepOutput::Empty => {}
        }
    }
    Ok(image)
}

/// Run the Track chain on one frame; detector outputs accumulate.
///
/// # Errors
///
/// Returns the first failing detector's [`ChainError`].
pub fn run_detect_chain(
    registry: &Registry<dyn DetectStep>,
    config: &PipelineConfig,
    stage: StageKind,
    image: &GrayImage,
    frame: u64,
) -> Result<ParticleTable, ChainError> {
    let mut detections = ParticleTable::new();
    for key in config.chain(stage) {
        let step = registry.resolve(key).map_err(annotate_err(key))?;
        let ctx = context(config, stage, key, Some(frame));
        match step.apply(image, &ctx).map_err(annotate_err(key))? {
            StepOutput::Value(rows) => detections.append(&rows),
            StepOutput::Empty => {}
        }
    }
    Ok(detections)
}

/// Run a table chain left-to-right.
///
/// `frame` is `Some` in single-frame mode and `None` in whole-table
/// batch mode; windowed steps use it to emit only the focus frame's
/// values.
///
/// # Errors
///
/// Returns the first failing step's [`ChainError`].
pub fn run_table_chain(
    registry: &Registry<dyn TableStep>,
    config: &PipelineConfig,
    stage: StageKind,
    mut table: ParticleTable,
    frame: Option<u64>,
) -> Result<ParticleTable, ChainError> {
    for key in config.chain(stage) {
        let step = registry.resolve(key).map_err(annotate_err(key))?;
        let ctx = context(config, stage, key, frame);
        match step.apply(table.clone(), &ctx).map_err(annotate_err(key))? {
            StepOutput::Value(next) => table = next,
            StepOutput::Empty => {}
        }
    }
    Ok(table)
}

/// Run the Annotate chain for one frame's display image.
///
/// # Errors
///
/// Returns the first failing step's [`ChainError`].
pub fn run_annotate_chain(
    registry: &Registry<dyn AnnotateStep>,
    config: &PipelineConfig,
    stage: StageKind,
    mut image: RgbaImage,
    rows: &ParticleTable,
    frame: u64,
) -> Result<RgbaImage, ChainError> {
    for key in config.chain(stage) {
        let step = registry.resolve(key).map_err(annotate_err(key))?;
        let ctx = context(config, stage, key, Some(frame));
        match step.apply(image.clone(), rows, &ctx).map_err(annotate_err(key))? {
            StepOutput::Value(next) => image = next,
            StepOutput::Empty => {}
        }
    }
    Ok(image)
}
