//! Command-line interface and run-mode orchestration.
//!
//! Each run mode is explicit: `Train` produces the checkpoints, while
//! `Evaluate` and `Submit` rebuild their classifier from the persisted
//! checkpoints instead of relying on state left behind by an earlier branch.

use crate::pipeline::config::Config;
use crate::pipeline::dataset::ensure_competition_data;
use crate::pipeline::evaluate::{evaluate, DEFAULT_THRESHOLD};
use crate::pipeline::loader::{load_test_input, load_train_input};
use crate::pipeline::report::{ConsoleReporter, Reporter};
use crate::pipeline::submission::write_submission;
use crate::pipeline::train::train_classifier;
use crate::vgg::load_fine_tuned;
use std::error::Error;

/// The explicit set of pipeline run modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Fetch data if needed, run both training phases, persist checkpoints
    Train,
    /// Score the persisted model against the training inputs
    Evaluate,
    /// Generate the submission CSV from the persisted model
    Submit,
}

impl RunMode {
    /// Parse a CLI command word.
    pub fn parse(command: &str) -> Option<RunMode> {
        match command {
            "train" => Some(RunMode::Train),
            "evaluate" | "eval" => Some(RunMode::Evaluate),
            "submit" => Some(RunMode::Submit),
            _ => None,
        }
    }
}

/// Print command-line usage information.
pub fn print_usage() {
    println!("Usage:");
    println!("  terratag [COMMAND] [OPTIONS]\n");
    println!("Commands:");
    println!("  train              Download data if needed, train and fine-tune the model");
    println!("  evaluate           F2 sanity check of the saved model on the training data");
    println!("  submit             Write the submission CSV from the saved model");
    println!("  help               Show this help\n");
    println!("Options:");
    println!("  --no-annealing     Reset the head before each fine-tuning schedule entry");
    println!("  --threshold T      Multi-label decision threshold (default 0.2)\n");
    println!("Examples:");
    println!("  ./target/release/terratag train");
    println!("  ./target/release/terratag train --no-annealing");
    println!("  ./target/release/terratag submit --threshold 0.25");
}

/// Main entry point: parse arguments, load configuration, dispatch the mode.
pub fn run(args: Vec<String>) -> Result<(), Box<dyn Error>> {
    let command = if args.len() > 1 { args[1].as_str() } else { "help" };
    if matches!(command, "help" | "--help" | "-h") {
        print_usage();
        return Ok(());
    }
    let Some(mode) = RunMode::parse(command) else {
        println!("Unknown command: {}\n", command);
        print_usage();
        return Ok(());
    };

    let mut config = Config::load("config.toml").unwrap_or_else(|e| {
        eprintln!("Warning: Could not load config.toml: {}", e);
        eprintln!("Using default configuration\n");
        Config::default()
    });
    apply_flags(&mut config, &args[2..])?;

    let reporter = ConsoleReporter::new();
    dispatch(mode, &config, &reporter)
}

/// Apply command-line overrides on top of the loaded configuration.
pub fn apply_flags(config: &mut Config, flags: &[String]) -> Result<(), Box<dyn Error>> {
    let mut iter = flags.iter();
    while let Some(flag) = iter.next() {
        match flag.as_str() {
            "--no-annealing" => config.fine_tune.annealing = false,
            "--threshold" => {
                let value = iter.next().ok_or("--threshold requires a value")?;
                config.model.classification_threshold = Some(value.parse::<f64>()?);
            }
            other => return Err(format!("unknown option: {}", other).into()),
        }
    }
    Ok(())
}

/// Run one mode with its precursor state loaded explicitly.
pub fn dispatch(
    mode: RunMode,
    config: &Config,
    reporter: &dyn Reporter,
) -> Result<(), Box<dyn Error>> {
    match mode {
        RunMode::Train => run_train(config, reporter),
        RunMode::Evaluate => run_evaluate(config, reporter),
        RunMode::Submit => run_submit(config, reporter),
    }
}

fn run_train(config: &Config, reporter: &dyn Reporter) -> Result<(), Box<dyn Error>> {
    print_training_header(config, reporter);
    ensure_competition_data(&config.data, reporter)?;
    let (x_input, y_true, _y_map) = load_train_input(&config.data, reporter)?;
    let _classifier = train_classifier(config, &x_input, &y_true, reporter)?;
    reporter.info("Training complete.");
    Ok(())
    // input tensors and classifier released at scope exit
}

fn run_evaluate(config: &Config, reporter: &dyn Reporter) -> Result<(), Box<dyn Error>> {
    let (x_input, y_true, y_map) = load_train_input(&config.data, reporter)?;
    let mut classifier = load_fine_tuned(
        config.data.img_size,
        y_map.len() as i64,
        config.model.n_frozen_layers,
        &config.output.top_weights,
        &config.output.full_weights,
        reporter,
    )?;
    classifier.classification_threshold = config.model.classification_threshold;

    let (f2, threshold) = evaluate(&classifier, &x_input, &y_true, None, config.training.batch_size);
    reporter.info("WARNING: This eval is a rough sanity check, it will include training data.");
    reporter.info(&format!("F2(c_thresh={}): {}", threshold, f2));
    Ok(())
}

fn run_submit(config: &Config, reporter: &dyn Reporter) -> Result<(), Box<dyn Error>> {
    // The label map defines the prediction columns; the training tensors
    // themselves are not needed and are released at the end of this block.
    let y_map = {
        let (_x_input, _y_true, y_map) = load_train_input(&config.data, reporter)?;
        y_map
    };
    let (x_test, filenames) = load_test_input(&config.data, reporter)?;

    let mut classifier = load_fine_tuned(
        config.data.img_size,
        y_map.len() as i64,
        config.model.n_frozen_layers,
        &config.output.top_weights,
        &config.output.full_weights,
        reporter,
    )?;
    classifier.classification_threshold = config.model.classification_threshold;
    let threshold = classifier
        .classification_threshold
        .unwrap_or(DEFAULT_THRESHOLD);

    write_submission(
        classifier,
        &x_test,
        &filenames,
        &y_map,
        threshold,
        config.training.batch_size,
        &config.output.submission_file,
        reporter,
    )
}

fn print_training_header(config: &Config, reporter: &dyn Reporter) {
    reporter.info("\n===================================================================");
    reporter.info("  terratag: VGG16 multi-label satellite tagging");
    reporter.info("===================================================================\n");
    reporter.info("Configuration:");
    reporter.info(&format!("  Train images: {}", config.data.train_jpeg_dir));
    reporter.info(&format!(
        "  Image size: {}x{}",
        config.data.img_size, config.data.img_size
    ));
    reporter.info(&format!(
        "  Validation split: {:.0}%",
        config.training.validation_split * 100.0
    ));
    reporter.info(&format!("  Batch size: {}", config.training.batch_size));
    reporter.info(&format!(
        "  Top schedule: {:?} epochs @ {:?}",
        config.training.top_epochs, config.training.top_learn_rates
    ));
    reporter.info(&format!(
        "  Fine-tune schedule: {:?} epochs @ {:?}, momentum {:?}",
        config.fine_tune.epochs, config.fine_tune.learn_rates, config.fine_tune.momentum
    ));
    reporter.info(&format!(
        "  Max fine-tune time: {} h",
        config.fine_tune.max_train_time_hrs
    ));
    reporter.info(&format!("  Annealing: {}", config.fine_tune.annealing));
    reporter.info("\n===================================================================\n");
}
