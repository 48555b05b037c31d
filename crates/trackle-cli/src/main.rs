//! Batch runner: apply one pipeline configuration to every image
//! sequence matching a glob pattern.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use trackle_pipeline::{
    BatchOptions, EnabledStages, PipelineConfig, Progress, StepRegistries, run_glob,
};

/// Run the trackle pipeline over matching image-sequence directories.
#[derive(Parser)]
#[command(version)]
struct Args {
    /// Glob pattern selecting input directories (e.g. "clips/*_run").
    pattern: String,

    /// Pipeline configuration document (JSON).
    #[arg(short, long)]
    config: PathBuf,

    /// Skip the Crop stage.
    #[arg(long)]
    no_crop: bool,

    /// Skip the Preprocess stage.
    #[arg(long)]
    no_preprocess: bool,

    /// Skip the Track stage (reuse committed track stores).
    #[arg(long)]
    no_track: bool,

    /// Skip the Link stage (reuse committed link stores).
    #[arg(long)]
    no_link: bool,

    /// Skip the Postprocess stage.
    #[arg(long)]
    no_postprocess: bool,

    /// Skip the Annotate stage.
    #[arg(long)]
    no_annotate: bool,

    /// Export each input's final table as CSV next to its stores.
    #[arg(long)]
    export: bool,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let text = std::fs::read_to_string(&args.config)
        .with_context(|| format!("reading configuration {}", args.config.display()))?;
    let config = PipelineConfig::from_json(&text)
        .with_context(|| format!("parsing configuration {}", args.config.display()))?;

    let options = BatchOptions {
        enabled: EnabledStages {
            crop: !args.no_crop,
            preprocess: !args.no_preprocess,
            track: !args.no_track,
            link: !args.no_link,
            postprocess: !args.no_postprocess,
            annotate: !args.no_annotate,
        },
        export_table: args.export,
    };

    let registries = StepRegistries::default();
    let report = run_glob(
        &args.pattern,
        &config,
        &registries,
        &options,
        &mut |input, event| {
            if let Progress::FrameDone {
                stage,
                done,
                total,
            } = event
            {
                if done == total || done.is_multiple_of(50) {
                    eprintln!("{}: {stage} {done}/{total}", input.display());
                }
            }
        },
    )?;

    for item in &report.items {
        match &item.outcome {
            Ok(summary) => println!(
                "{}: {} frames, {} detections, {} trajectories",
                item.input.display(),
                summary.frames,
                summary.detections,
                summary.trajectories,
            ),
            Err(error) => println!("{}: FAILED: {error}", item.input.display()),
        }
    }
    if report.items.is_empty() {
        println!("no inputs matched '{}'", args.pattern);
    }
    anyhow::ensure!(
        report.failed() == 0,
        "{} of {} inputs failed",
        report.failed(),
        report.items.len(),
    );
    Ok(())
}
