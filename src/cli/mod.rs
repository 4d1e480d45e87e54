use crate::config::{Arguments, Config, META_FILE_NAME};
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// muben: molecular property prediction with uncertainty quantification
#[derive(Parser, Debug)]
#[command(name = "muben")]
#[command(about = "Molecular property prediction with uncertainty quantification")]
#[command(version)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Train, calibrate and test a model
    Train(ExperimentArgs),

    /// Featurize the dataset partitions and write the feature cache
    Prepare(ExperimentArgs),

    /// Score saved test predictions of a finished run
    Evaluate(EvaluateArgs),
}

/// Experiment arguments shared by `train` and `prepare`
#[derive(Args, Debug)]
pub struct ExperimentArgs {
    #[command(flatten)]
    pub arguments: Arguments,

    /// JSON configuration applied on top of the command line values
    #[arg(long)]
    pub config_file: Option<PathBuf>,

    /// Directory of `meta.json`; defaults to the dataset split directory
    #[arg(long)]
    pub meta_dir: Option<PathBuf>,
}

impl ExperimentArgs {
    /// Build the run configuration: arguments, optional config file, then dataset metadata
    pub fn build_config(&self) -> Result<Config> {
        let mut config = Config::from_args(&self.arguments);
        if let Some(path) = &self.config_file {
            config
                .load(path)
                .with_context(|| format!("Failed to apply configuration file {:?}", path))?;
            config.finalize();
        }
        config.get_meta(self.meta_dir.as_deref(), META_FILE_NAME)?;
        config.validate()?;
        Ok(config)
    }
}

/// Evaluation arguments
#[derive(Args, Debug)]
pub struct EvaluateArgs {
    /// Result directory of a finished run (holds `config.json` and `preds.json`)
    #[arg(short, long, required = true)]
    pub run_dir: PathBuf,

    /// Output file for the evaluation report
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

/// Parse CLI arguments
pub fn parse_args() -> Cli {
    Cli::parse()
}

/// Setup logging based on verbosity; `RUST_LOG` takes precedence when set
pub fn setup_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}
