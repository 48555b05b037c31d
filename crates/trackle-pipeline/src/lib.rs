//! trackle-pipeline: staged particle-tracking pipeline engine.
//!
//! Converts image sequences into particle measurement tables through six
//! stages: crop -> preprocess -> track -> link -> postprocess ->
//! annotate. Each stage runs a user-ordered chain of named steps and
//! commits its whole-sequence output to a Parquet-backed
//! [`store::FrameStore`]; a single-frame preview mode re-evaluates one
//! focus frame against the same staged data model, honouring a lock
//! level that freezes early stages while later ones are iterated.
//!
//! The crate is sans-IO except for the store files themselves: frame
//! acquisition is behind [`source::FrameSource`], detection and
//! filtering algorithms register through [`chain::StepRegistries`], and
//! rendering/encoding stay with the caller.
//!
//! ```no_run
//! use trackle_pipeline::{
//!     Orchestrator, PipelineConfig, StageKind, StepRegistries, source::ImageSequence,
//! };
//!
//! # fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let mut config = PipelineConfig::new();
//! config.push_step(StageKind::Track, "centroid", Default::default());
//! config.push_step(StageKind::Link, "link", Default::default());
//!
//! let registries = StepRegistries::default();
//! let source = ImageSequence::open("clips/run1".as_ref())?;
//! let summary = Orchestrator::new(&config, &registries, "clips/run1")
//!     .run(&source, &mut |_| {})?;
//! println!("{} trajectories", summary.trajectories);
//! # Ok(())
//! # }
//! ```

pub mod batch;
pub mod chain;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod source;
pub mod spatial;
pub mod steps;
pub mod store;
pub mod table;
pub mod windowed;

pub use batch::{BatchOptions, BatchReport, run_glob};
pub use chain::{StepContext, StepError, StepOutput, StepRegistries};
pub use config::{FrameSelector, LockLevel, MethodKey, Params, PipelineConfig, StageKind};
pub use error::{PipelineError, StageError};
pub use orchestrator::{EnabledStages, Orchestrator, Outcome, PreviewFrame, Progress, RunSummary};
pub use store::FrameStore;
pub use table::ParticleTable;
