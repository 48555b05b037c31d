//! Batch entry point: run the full pipeline over every input matching a
//! filename glob.
//!
//! One configuration document applies to every matched input; each input
//! runs with lock level unlocked. Inputs are isolated: an unrecoverable
//! error is fatal for that input only, and the remaining matches still
//! run. The optional tabular export writes the final committed table of
//! each input as CSV next to its stores.

use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::chain::StepRegistries;
use crate::config::{PipelineConfig, StageKind};
use crate::error::PipelineError;
use crate::orchestrator::{EnabledStages, Orchestrator, Progress, RunSummary};
use crate::source::ImageSequence;
use crate::store::{FrameStore, stage_path};
use crate::table::ParticleTable;

/// A batch cannot even start.
#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    /// The selector is not a valid glob pattern.
    #[error("invalid glob pattern '{pattern}': {source}")]
    Pattern {
        /// The offending pattern.
        pattern: String,
        /// Underlying parse failure.
        #[source]
        source: glob::PatternError,
    },
}

/// A single input's failure (the batch continues past it).
#[derive(Debug, thiserror::Error)]
pub enum ItemError {
    /// A matched path could not be inspected.
    #[error("failed to read glob match: {source}")]
    Walk {
        /// Underlying failure.
        #[source]
        source: glob::GlobError,
    },

    /// A matched path is not an image-sequence directory.
    #[error("{path} is not an image-sequence directory")]
    NotASequence {
        /// The offending path.
        path: PathBuf,
    },

    /// The pipeline failed for this input.
    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    /// The CSV export could not be written.
    #[error("failed to export {path}: {source}")]
    ExportCsv {
        /// Export file path.
        path: PathBuf,
        /// Underlying CSV failure.
        #[source]
        source: csv::Error,
    },

    /// The CSV export could not be flushed.
    #[error("failed to export {path}: {source}")]
    ExportIo {
        /// Export file path.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: std::io::Error,
    },
}

/// Batch-wide options.
#[derive(Debug, Clone, Copy)]
pub struct BatchOptions {
    /// Per-stage enable flags applied to every input.
    pub enabled: EnabledStages,
    /// Export each input's final committed table as CSV.
    pub export_table: bool,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            enabled: EnabledStages::all(),
            export_table: false,
        }
    }
}

/// One input's result.
#[derive(Debug)]
pub struct BatchItem {
    /// The matched input path.
    pub input: PathBuf,
    /// What happened to it.
    pub outcome: Result<RunSummary, ItemError>,
}

/// Results for every matched input, in match order.
#[derive(Debug, Default)]
pub struct BatchReport {
    /// Per-input outcomes.
    pub items: Vec<BatchItem>,
}

impl BatchReport {
    /// Inputs that completed.
    #[must_use]
    pub fn succeeded(&self) -> usize {
        self.items.iter().filter(|item| item.outcome.is_ok()).count()
    }

    /// Inputs that failed.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.items.len() - self.succeeded()
    }
}

/// Run the pipeline over every image-sequence directory matching
/// `pattern`.
///
/// `progress` receives counter events tagged with the input being
/// processed. Zero matches yield an empty report, not an error.
///
/// # Errors
///
/// Returns [`BatchError`] only when the pattern itself is invalid;
/// per-input failures land in the report.
pub fn run_glob(
    pattern: &str,
    config: &PipelineConfig,
    registries: &StepRegistries,
    options: &BatchOptions,
    progress: &mut dyn FnMut(&Path, Progress),
) -> Result<BatchReport, BatchError> {
    let matches = glob::glob(pattern).map_err(|source| BatchError::Pattern {
        pattern: pattern.to_owned(),
        source,
    })?;

    let mut report = BatchReport::default();
    for matched in matches {
        let input = match matched {
            Ok(path) => path,
            Err(source) => {
                let error = ItemError::Walk { source };
                warn!(error = %error, "skipping unreadable glob match");
                report.items.push(BatchItem {
                    input: PathBuf::new(),
                    outcome: Err(error),
                });
                continue;
            }
        };
        let outcome = run_one(&input, config, registries, options, progress);
        if let Err(error) = &outcome {
            warn!(input = %input.display(), error = %error, "input failed, continuing batch");
        }
        report.items.push(BatchItem { input, outcome });
    }
    info!(
        succeeded = report.succeeded(),
        failed = report.failed(),
        "batch finished",
    );
    Ok(report)
}

fn run_one(
    input: &Path,
    config: &PipelineConfig,
    registries: &StepRegistries,
    options: &BatchOptions,
    progress: &mut dyn FnMut(&Path, Progress),
) -> Result<RunSummary, ItemError> {
    if !input.is_dir() {
        return Err(ItemError::NotASequence {
            path: input.to_path_buf(),
        });
    }
    let source = ImageSequence::open(input).map_err(PipelineError::from)?;
    let orchestrator = Orchestrator::new(config, registries, input).with_enabled(options.enabled);
    let summary = orchestrator.run(&source, &mut |event| progress(input, event))?;
    if options.export_table {
        export_final_table(input)?;
    }
    Ok(summary)
}

/// Write the last committed table stage of an input as CSV.
///
/// Prefers the postprocess store, then link, then track — whichever was
/// committed last for this input.
fn export_final_table(input: &Path) -> Result<(), ItemError> {
    let stage = [StageKind::Postprocess, StageKind::Link, StageKind::Track]
        .into_iter()
        .find(|stage| stage_path(input, stage.name()).exists());
    let Some(stage) = stage else {
        // Nothing committed (all table stages disabled): nothing to export.
        return Ok(());
    };
    let store = FrameStore::load(stage_path(input, stage.name())).map_err(PipelineError::from)?;
    let csv_path = stage_path(input, stage.name()).with_extension("csv");
    write_csv(store.table(), &csv_path)?;
    info!(path = %csv_path.display(), rows = store.table().len(), "table exported");
    Ok(())
}

fn write_csv(table: &ParticleTable, path: &Path) -> Result<(), ItemError> {
    let csv_error = |source| ItemError::ExportCsv {
        path: path.to_path_buf(),
        source,
    };
    let mut writer = csv::Writer::from_path(path).map_err(csv_error)?;

    let mut header = vec!["frame".to_owned(), "particle".to_owned()];
    header.extend(table.column_names().map(ToOwned::to_owned));
    writer.write_record(&header).map_err(csv_error)?;

    for row in 0..table.len() {
        let mut record = vec![
            table.frames()[row].to_string(),
            table.particles()[row].map_or_else(String::new, |p| p.to_string()),
        ];
        for name in table.column_names() {
            record.push(
                table
                    .value(row, name)
                    .map_or_else(String::new, |v| v.to_string()),
            );
        }
        writer.write_record(&record).map_err(csv_error)?;
    }
    writer.flush().map_err(|source| ItemError::ExportIo {
        path: path.to_path_buf(),
        source,
    })
}
