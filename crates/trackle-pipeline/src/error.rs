//! Pipeline error taxonomy.
//!
//! Step failures are caught at the stage boundary and converted to the
//! stage's error kind, keeping the offending step's full identifier and
//! any prerequisite hint. Stages that already completed and saved are
//! never rolled back; callers receive a structured error (kind + message
//! + step name) sufficient for a one-line diagnostic.

use std::path::PathBuf;

use crate::chain::ChainError;
use crate::config::StageKind;
use crate::source::SourceError;
use crate::store::StoreError;

/// A step failure attributed to its pipeline stage.
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    /// A Crop chain step failed.
    #[error("crop mask error: {0}")]
    CropMask(ChainError),

    /// A Preprocess chain step failed.
    #[error("preprocessor error: {0}")]
    Preprocessor(ChainError),

    /// A Track chain detector failed.
    #[error("track error: {0}")]
    Track(ChainError),

    /// A Link chain step failed.
    #[error("link error: {0}")]
    Link(ChainError),

    /// A Postprocess chain step failed.
    #[error("postprocessor error: {0}")]
    Postprocessor(ChainError),

    /// An Annotate chain step failed.
    #[error("annotator error: {0}")]
    Annotator(ChainError),
}

impl StageError {
    /// Attribute a chain failure to its stage.
    #[must_use]
    pub fn from_chain(stage: StageKind, error: ChainError) -> Self {
        match stage {
            StageKind::Crop => Self::CropMask(error),
            StageKind::Preprocess => Self::Preprocessor(error),
            StageKind::Track => Self::Track(error),
            StageKind::Link => Self::Link(error),
            StageKind::Postprocess => Self::Postprocessor(error),
            StageKind::Annotate => Self::Annotator(error),
        }
    }

    /// The stage the failure originated in.
    #[must_use]
    pub const fn stage(&self) -> StageKind {
        match self {
            Self::CropMask(_) => StageKind::Crop,
            Self::Preprocessor(_) => StageKind::Preprocess,
            Self::Track(_) => StageKind::Track,
            Self::Link(_) => StageKind::Link,
            Self::Postprocessor(_) => StageKind::Postprocess,
            Self::Annotator(_) => StageKind::Annotate,
        }
    }

    /// Full identifier of the failing step.
    #[must_use]
    pub fn step(&self) -> &str {
        match self {
            Self::CropMask(e)
            | Self::Preprocessor(e)
            | Self::Track(e)
            | Self::Link(e)
            | Self::Postprocessor(e)
            | Self::Annotator(e) => &e.step,
        }
    }
}

/// Any failure surfaced by the orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// A stage's step failed.
    #[error(transparent)]
    Stage(#[from] StageError),

    /// A store file could not be loaded or saved.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A frame could not be produced.
    #[error(transparent)]
    Source(#[from] SourceError),

    /// A stage is locked or disabled but its committed store does not
    /// exist yet.
    #[error(
        "committed {stage} store {path} is missing — run the {stage} stage unlocked once to create it"
    )]
    MissingStore {
        /// The stage whose output was needed.
        stage: StageKind,
        /// Where the store was expected.
        path: PathBuf,
    },
}
