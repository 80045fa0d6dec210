//! trash_sort CLI
//!
//! Entry point for splitting, training, evaluating, exporting and running the
//! trash classifier. `run` chains every step.

use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing::info;

use trash_sort::backend::{backend_name, default_device, InferenceBackend, TrainingBackend};
use trash_sort::dataset::split::MANIFEST_FILE;
use trash_sort::model::PipelineConfig;
use trash_sort::pipeline;
use trash_sort::utils::logging::{init_logging, LogConfig, LogLevel};

/// Trash and recyclables classifier
///
/// Two-stage EfficientNet transfer learning with MixUp, flip-averaged
/// evaluation and ONNX export, built on Burn.
#[derive(Parser, Debug)]
#[command(name = "trash_sort")]
#[command(version)]
#[command(about = "Two-stage transfer learning for trash sorting with Burn", long_about = None)]
struct Cli {
    /// Enable verbose logging (includes export converter details)
    #[arg(short, long, default_value = "false", global = true)]
    verbose: bool,

    /// Only log errors
    #[arg(short, long, default_value = "false", global = true, conflicts_with = "verbose")]
    quiet: bool,

    /// Log level (trace, debug, info, warn, error); overrides --verbose/--quiet
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Pipeline configuration JSON; command-line flags override it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Subcommand to execute
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Split, train, evaluate and export in one go
    Run {
        /// Class-per-directory source images
        #[arg(short, long)]
        source: PathBuf,

        /// Working directory for the split and all artifacts
        #[arg(short, long, default_value = "work")]
        work: PathBuf,

        /// Pretrained backbone weights (Burn record)
        #[arg(long)]
        backbone_weights: Option<PathBuf>,
    },

    /// Split a class-per-directory folder into train/validation/test
    Split {
        /// Class-per-directory source images
        #[arg(short, long)]
        source: PathBuf,

        /// Destination for the split
        #[arg(short, long)]
        dest: PathBuf,

        /// Random seed for the shuffle
        #[arg(long)]
        seed: Option<u64>,
    },

    /// Train the classifier in two stages on an existing split
    Train {
        /// Split directory (with train/ and validation/)
        #[arg(short, long)]
        data: PathBuf,

        /// Output directory for checkpoints, history and the native model
        #[arg(short, long, default_value = "output")]
        output: PathBuf,

        /// Pretrained backbone weights (Burn record)
        #[arg(long)]
        backbone_weights: Option<PathBuf>,

        /// Epochs with the backbone frozen
        #[arg(long)]
        epochs_stage1: Option<usize>,

        /// Fine-tuning epochs
        #[arg(long)]
        epochs_stage2: Option<usize>,

        /// Batch size
        #[arg(short, long)]
        batch_size: Option<usize>,

        /// First backbone layer group trained in stage 2
        #[arg(long)]
        fine_tune_at: Option<usize>,

        /// Random seed
        #[arg(long)]
        seed: Option<u64>,
    },

    /// Evaluate a saved model on the test split with TTA
    Evaluate {
        /// Split directory (with test/)
        #[arg(short, long)]
        data: PathBuf,

        /// Native model file
        #[arg(short, long)]
        model: PathBuf,

        /// labels.txt written next to the model
        #[arg(short, long)]
        labels: PathBuf,

        /// Number of flip-averaged passes
        #[arg(long)]
        tta_passes: Option<usize>,
    },

    /// Export a saved model to ONNX (FP32, FP16, INT8)
    Export {
        /// Native model file
        #[arg(short, long)]
        model: PathBuf,

        /// labels.txt written next to the model
        #[arg(short, long)]
        labels: PathBuf,

        /// Split directory; train/ provides the INT8 calibration images
        #[arg(short, long)]
        data: PathBuf,

        /// Output directory
        #[arg(short, long, default_value = "export")]
        output: PathBuf,
    },

    /// Classify a single image
    Infer {
        /// Native model file
        #[arg(short, long)]
        model: PathBuf,

        /// labels.txt written next to the model
        #[arg(short, long)]
        labels: PathBuf,

        /// Image to classify
        #[arg(short, long)]
        input: PathBuf,
    },

    /// Show class statistics for a dataset or split directory
    Stats {
        /// Dataset or split directory
        #[arg(short, long)]
        data: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut log_config = if cli.verbose {
        LogConfig::verbose()
    } else if cli.quiet {
        LogConfig::quiet()
    } else {
        LogConfig::default()
    };
    if let Some(level) = &cli.log_level {
        log_config.level = LogLevel::parse(level);
    }

    let _ = init_logging(&log_config);

    print_banner();

    let mut config = pipeline::load_pipeline_config(cli.config.as_deref())?;
    let device = default_device();
    info!("Backend: {}", backend_name());

    match cli.command {
        Commands::Run {
            source,
            work,
            backbone_weights,
        } => {
            print_config(&config);
            pipeline::run_pipeline::<TrainingBackend>(&config, &source, &work, backbone_weights.as_deref(), &device)?;
        }

        Commands::Split { source, dest, seed } => {
            if let Some(seed) = seed {
                config.split.seed = seed;
            }
            pipeline::split(&source, &dest, &config)?;
        }

        Commands::Train {
            data,
            output,
            backbone_weights,
            epochs_stage1,
            epochs_stage2,
            batch_size,
            fine_tune_at,
            seed,
        } => {
            if let Some(epochs) = epochs_stage1 {
                config.stage1.epochs = epochs;
            }
            if let Some(epochs) = epochs_stage2 {
                config.stage2.epochs = epochs;
            }
            if let Some(batch_size) = batch_size {
                config.batch_size = batch_size;
            }
            if let Some(k) = fine_tune_at {
                config.fine_tune_at = k;
            }
            if let Some(seed) = seed {
                config.seed = seed;
            }
            config.validate()?;
            print_config(&config);
            cmd_train(&config, &data, &output, backbone_weights.as_deref())?;
        }

        Commands::Evaluate {
            data,
            model,
            labels,
            tta_passes,
        } => {
            let passes = tta_passes.unwrap_or(config.tta.passes);
            pipeline::evaluate_saved::<InferenceBackend>(&data, &model, &labels, &config, passes, &device)?;
        }

        Commands::Export {
            model,
            labels,
            data,
            output,
        } => {
            pipeline::export_saved::<InferenceBackend>(&model, &labels, &data, &output, &config, &device)?;
        }

        Commands::Infer { model, labels, input } => {
            pipeline::infer::<InferenceBackend>(&model, &labels, &input, &device)?;
        }

        Commands::Stats { data } => {
            pipeline::stats(&data)?;
        }
    }

    Ok(())
}

fn cmd_train(config: &PipelineConfig, data: &Path, output: &Path, backbone_weights: Option<&Path>) -> Result<()> {
    if !data.join(MANIFEST_FILE).exists() {
        println!(
            "{} no {} in {:?}; is this a split directory?",
            "Warning:".yellow(),
            MANIFEST_FILE,
            data
        );
    }

    let device = default_device();
    let splits = pipeline::load_splits(data, config.image_size)?;
    let trained = pipeline::train::<TrainingBackend>(config, &splits, backbone_weights, output, &device)?;

    let artifacts = trash_sort::export::save_native(&trained.model, &trained.model_config, &splits.classes, output)?;
    println!("{} {:?}", "Model saved to".green().bold(), artifacts.model);
    Ok(())
}

fn print_config(config: &PipelineConfig) {
    println!("{}", "Configuration:".cyan().bold());
    println!("  Backend:        {}", backend_name());
    println!("  Image size:     {}", config.image_size);
    println!("  Batch size:     {}", config.batch_size);
    println!(
        "  Epochs:         {} frozen + {} fine-tune (from group {})",
        config.stage1.epochs, config.stage2.epochs, config.fine_tune_at
    );
    println!("  MixUp alpha:    {}", config.mixup.alpha);
    println!("  Seed:           {}", config.seed);
    println!();
}

fn print_banner() {
    println!(
        "{}",
        r#"
 ╔══════════════════════════════════════════════════════════════╗
 ║   ♻  trash_sort                                               ║
 ║   Two-stage EfficientNet transfer learning with Burn + Rust   ║
 ╚══════════════════════════════════════════════════════════════╝
  "#
        .green()
    );
}
