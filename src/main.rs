use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::Device;
use clap::{Parser, Subcommand};
use log::info;

use engine_sounds::PipelineConfig;

/// Train and evaluate the car / motorcycle sound classifier.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Log level: error, warn, info, debug, trace.
    #[arg(long, default_value = "info", global = true)]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Train a model from the configured class directories.
    Train {
        /// TOML configuration file; defaults are used when omitted.
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Output directory for the model, manifest and history.
        #[arg(long)]
        out: Option<PathBuf>,

        /// Enable waveform augmentation.
        #[arg(long, default_value_t = false)]
        augment: bool,

        /// Also write an int8 quantized model.
        #[arg(long, default_value_t = false)]
        quantize: bool,

        /// Override the number of epochs.
        #[arg(long)]
        epochs: Option<usize>,
    },
    /// Classify the configured test directories with a saved model.
    Infer {
        /// Model file written by `train`.
        #[arg(short, long)]
        model: PathBuf,

        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Print the default configuration as TOML.
    DefaultConfig,
}

fn load_config(path: Option<&Path>) -> Result<PipelineConfig> {
    match path {
        Some(path) => PipelineConfig::load(path)
            .with_context(|| format!("loading configuration from {}", path.display())),
        None => Ok(PipelineConfig::default()),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::new()
        .filter_level(cli.log_level.parse().unwrap_or(log::LevelFilter::Info))
        .format_timestamp_millis()
        .init();

    let device = Device::Cpu;
    match cli.command {
        Command::Train {
            config,
            out,
            augment,
            quantize,
            epochs,
        } => {
            let mut config = load_config(config.as_deref())?;
            if let Some(out) = out {
                config.export.out_dir = out;
            }
            config.augmentation.enabled |= augment;
            config.export.quantize |= quantize;
            if let Some(epochs) = epochs {
                config.training.epochs = epochs;
            }

            let outcome = engine_sounds::run_training(&config, &device).context("training failed")?;
            if let Some(last) = outcome.history.epochs.last() {
                info!(
                    "final epoch: loss {:.4}, accuracy {:.4}",
                    last.loss, last.accuracy
                );
            }
            println!("model: {}", outcome.model_path.display());
            if let Some(path) = &outcome.quantized_path {
                println!("quantized model: {}", path.display());
            }
            println!("history: {}", outcome.history_path.display());
        }
        Command::Infer { model, config } => {
            let config = load_config(config.as_deref())?;
            let report = engine_sounds::run_inference(&config, &model, &device)
                .with_context(|| format!("inference with {}", model.display()))?;
            print!("{report}");
        }
        Command::DefaultConfig => {
            print!("{}", PipelineConfig::default().to_toml()?);
        }
    }
    Ok(())
}
