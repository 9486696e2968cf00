use std::collections::BTreeSet;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use match_warp::data::config::RegistrationParameters;
use match_warp::pipeline::{Pipeline, PipelineOptions};

#[derive(Parser, Debug)]
#[command(name = "match-warp", version, about = "Apply non-rigid registration results to image and spectral frames")]
struct Cli {
    /// Log every frame step
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Warp every frame of a run folder, then average the results
    Warp {
        /// Run folder holding the .par config, images/ and nonrigid_results/
        folder: PathBuf,
        /// Stage folder to read (default: final stage)
        #[arg(long)]
        stage: Option<usize>,
        /// Worker threads (default: one per core)
        #[arg(short = 'j', long)]
        threads: Option<usize>,
        /// Skip writing the averaged products
        #[arg(long)]
        no_aggregate: bool,
    },
    /// Average frames already warped by an earlier run
    Aggregate {
        folder: PathBuf,
    },
    /// Write a registration config for a run folder
    Config {
        /// Output .par file
        output: PathBuf,
        /// Frame name pattern, e.g. images/frame_%04d.tiff
        #[arg(long)]
        pattern: String,
        #[arg(long)]
        frames: usize,
        /// Comma-separated frame indices to leave out
        #[arg(long, value_delimiter = ',')]
        skip: Vec<usize>,
        /// Precision / stop level
        #[arg(long, default_value_t = 8)]
        level: u32,
        #[arg(long, default_value_t = 2)]
        extra_stages: usize,
        /// Deformation regularization weight
        #[arg(long, default_value_t = 200.0)]
        lambda: f64,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();

    match cli.command {
        Command::Warp {
            folder,
            stage,
            threads,
            no_aggregate,
        } => {
            let options = PipelineOptions {
                stage,
                threads,
                aggregate: !no_aggregate,
                ..PipelineOptions::default()
            };
            let pipeline = Pipeline::open(&folder, options)?;
            let report = pipeline.run()?;
            for failure in &report.failures {
                eprintln!("frame {}: {:#}", failure.index, failure.error);
            }
            println!("{}", report.status_line());
        }
        Command::Aggregate { folder } => {
            let pipeline = Pipeline::open(&folder, PipelineOptions::default())?;
            let result = pipeline.aggregate_existing()?;
            let summary = serde_json::to_string_pretty(&result.summary())?;
            println!("{summary}");
        }
        Command::Config {
            output,
            pattern,
            frames,
            skip,
            level,
            extra_stages,
            lambda,
        } => {
            let root = output
                .parent()
                .map(PathBuf::from)
                .unwrap_or_default();
            let params = RegistrationParameters {
                name_pattern: pattern,
                root,
                precision_level: level,
                frame_count: frames,
                skip_frames: skip.into_iter().collect::<BTreeSet<_>>(),
                extra_stages,
                regularization: lambda,
                ..RegistrationParameters::default()
            };
            params
                .write(&output)
                .with_context(|| format!("writing {}", output.display()))?;
            println!("Wrote {}", output.display());
        }
    }
    Ok(())
}
