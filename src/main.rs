use anyhow::{bail, Context, Result};
use burn::backend::Autodiff;
use burn::tensor::backend::AutodiffBackend;
use muben::cli::{parse_args, setup_logging, Commands, EvaluateArgs, ExperimentArgs};
use muben::config::{Config, DeviceKind};
use muben::data::{Dataset, Featurizer, Partition};
use muben::predict::Predictions;
use muben::training::metrics::evaluate;
use muben::training::runner::prepare_datasets;
use muben::training::run_experiment;
use muben::training::trainer::{flat_targets, AGGREGATED_PREDS_FILE};
use muben::utils::write_json;
use muben::DefaultBackend;
use tracing::{error, info};

fn main() {
    let cli = parse_args();

    setup_logging(cli.verbose);

    info!("{}", muben::info());

    let result = match cli.command {
        Commands::Train(args) => run_train(args),
        Commands::Prepare(args) => run_prepare(args),
        Commands::Evaluate(args) => run_evaluate(args),
    };

    if let Err(e) = result {
        error!("Error: {:?}", e);
        std::process::exit(1);
    }
}

fn run_train(args: ExperimentArgs) -> Result<()> {
    let config = args.build_config()?;
    info!(
        "Training {} with {} on {}",
        config.model_name, config.uncertainty_method, config.dataset_name
    );

    match config.device() {
        DeviceKind::Cpu => train_on::<Autodiff<DefaultBackend>>(&config, &Default::default()),
        #[cfg(feature = "cuda")]
        DeviceKind::Cuda => train_on::<Autodiff<burn::backend::CudaJit>>(&config, &Default::default()),
        #[cfg(not(feature = "cuda"))]
        DeviceKind::Cuda => bail!("This binary was built without CUDA support"),
    }
}

fn train_on<B: AutodiffBackend>(config: &Config, device: &B::Device) -> Result<()> {
    let featurizer = Featurizer::from_config(config)?;
    let output = run_experiment::<B>(config, device, &featurizer).context("Training failed")?;

    info!("=== Results ===");
    for (idx, run) in output.runs.iter().enumerate() {
        info!(
            "Run {}: {} epochs, best validation {:?}, {:.1}s",
            idx,
            run.state.epoch,
            run.state.best_metric,
            run.duration_secs
        );
    }
    info!("Test metrics: {}", output.metrics.summary());
    Ok(())
}

fn run_prepare(args: ExperimentArgs) -> Result<()> {
    let config = args.build_config()?;
    let featurizer = Featurizer::from_config(&config)?;
    let datasets = prepare_datasets(&config, &featurizer)?;
    info!(
        "Prepared {} / {} / {} molecules",
        datasets.training.len(),
        datasets.valid.len(),
        datasets.test.len()
    );
    Ok(())
}

fn run_evaluate(args: EvaluateArgs) -> Result<()> {
    let config = Config::from_file(&args.run_dir)?;
    let predictions = Predictions::load(args.run_dir.join(AGGREGATED_PREDS_FILE))?;

    let mut dataset = Dataset::new();
    dataset.read_csv(config.data_dir.join(format!("{}.csv", Partition::Test)))?;
    if dataset.len() < predictions.len() {
        bail!(
            "{} predictions but only {} test molecules",
            predictions.len(),
            dataset.len()
        );
    }

    let (mut lbs, mut masks) = flat_targets(&dataset);
    // Debug runs score a prefix of the test set
    lbs.truncate(predictions.len() * predictions.n_tasks);
    masks.truncate(predictions.len() * predictions.n_tasks);

    let metrics = evaluate(&predictions, &lbs, &masks)?;
    info!("=== Evaluation Results ===");
    info!("{}", metrics.summary());

    if let Some(output) = args.output {
        write_json(&metrics, &output)?;
        info!("Evaluation report saved to: {:?}", output);
    }
    Ok(())
}
