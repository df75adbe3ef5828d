use clap::Parser;
use std::{error::Error, fs, path::PathBuf};
use tch::Device;

mod accu;
mod aggregate;
mod config;
mod dataset;
mod error;
mod eval;
mod model;
mod noise;
mod sampler;
mod tasks;

#[derive(Parser)]
#[clap(
    name = "gan-eval",
    version = env!("CARGO_PKG_VERSION"),
    author = env!("CARGO_PKG_AUTHORS"),
    about = env!("CARGO_PKG_DESCRIPTION"),
)]
struct Entry {
    #[clap(subcommand)]
    subcommand: Subcommand,
}

#[derive(clap::Subcommand)]
enum Subcommand {
    /// Evaluate a generator against real images
    Eval(EvalArgs),
    /// Write a freshly initialised generator module
    Export {
        /// Module directory
        module: PathBuf,
        /// Latent dimension
        #[clap(long, default_value = "128")]
        z_dim: i64,
        /// Class count of a conditional generator
        #[clap(long)]
        num_classes: Option<i64>,
        /// Width multiplier of the convolution stack
        #[clap(long, default_value = "64")]
        base_channels: i64,
    },
}

#[derive(clap::Args)]
struct EvalArgs {
    /// Generator module directory
    module: PathBuf,
    /// Directory of real images
    dataset: PathBuf,
    /// TorchScript Inception returning (activations, logits)
    inception: PathBuf,
    #[clap(long, default_value = "64")]
    eval_batch_size: i64,
    /// Only generate one label, conditional generators only
    #[clap(long)]
    force_label: Option<i64>,
    /// Latent distribution
    #[clap(long, arg_enum, default_value = "uniform")]
    distribution: noise::Distribution,
    #[clap(long, default_value = "-1.0", allow_hyphen_values = true)]
    minval: f64,
    #[clap(long, default_value = "1.0")]
    maxval: f64,
    #[clap(long, default_value = "1.0")]
    stddev: f64,
    /// How many times each metric is computed
    #[clap(long, default_value = "1")]
    num_averaging_runs: usize,
    /// Sample on the accelerator
    #[clap(long)]
    distributed: bool,
    /// Examples used to update batch-norm accumulators
    #[clap(long, default_value = "204800")]
    num_accu_examples: i64,
    /// Class count of the real dataset
    #[clap(long)]
    num_classes: Option<i64>,
    #[clap(long, default_value = "10000")]
    eval_test_samples: i64,
    #[clap(long, default_value = "64")]
    image_size: i64,
    /// Save generated examples here
    #[clap(long)]
    examples_dir: Option<PathBuf>,
    /// Name of the evaluated step
    #[clap(long, default_value = "0")]
    step: String,
    /// Write results as JSON
    #[clap(long)]
    output: Option<PathBuf>,
}

impl EvalArgs {
    fn config(&self) -> config::EvalConfig {
        config::EvalConfig {
            eval_batch_size: self.eval_batch_size,
            force_label: self.force_label,
            noise: noise::NoiseConfig {
                distribution: self.distribution,
                minval: self.minval,
                maxval: self.maxval,
                stddev: self.stddev,
            },
            num_averaging_runs: self.num_averaging_runs,
            distributed: self.distributed,
            num_accu_examples: self.num_accu_examples,
            examples_dir: self.examples_dir.clone(),
            step: self.step.clone(),
        }
    }
}

fn run_eval(args: EvalArgs) -> Result<(), Box<dyn Error>> {
    let config = args.config();
    config.validate(args.eval_test_samples)?;
    let device = if args.distributed {
        Device::cuda_if_available()
    } else {
        Device::Cpu
    };
    let generator = model::GanModule::load(&args.module, config.eval_batch_size, device)?;
    let dataset = dataset::ImageDirDataset {
        dir: args.dataset.clone(),
        image_size: args.image_size,
        num_classes: args.num_classes,
        eval_test_samples: args.eval_test_samples,
    };
    let extractor = dataset::InceptionExtractor::load(&args.inception, device)?;
    let tasks: Vec<Box<dyn tasks::EvalTask>> =
        vec![Box::new(tasks::FidTask), Box::new(tasks::InceptionScoreTask)];

    let results = match eval::evaluate(generator, &dataset, &extractor, &tasks, &config)? {
        Some(results) => results,
        None => return Ok(()),
    };
    for (key, value) in &results {
        tracing::info!("{} = {}", key, value);
    }
    let json = serde_json::to_string_pretty(&results)?;
    match args.output {
        Some(path) => fs::write(path, json)?,
        None => println!("{}", json),
    }
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Entry::parse();
    match args.subcommand {
        Subcommand::Eval(args) => run_eval(args),
        Subcommand::Export {
            module,
            z_dim,
            num_classes,
            base_channels,
        } => {
            let spec = model::ModuleSpec::new(z_dim, num_classes, base_channels);
            let generator = model::GanModule::new(&module, spec, Device::Cpu);
            generator.export()?;
            tracing::info!(
                "exported generator to {}: {:?}",
                module.display(),
                generator.spec()
            );
            Ok(())
        }
    }
}
