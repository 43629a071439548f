//! Joint fine-tuning of the backbone tail and dense head under a wall-clock
//! budget.

use crate::pipeline::config::{Config, FineScheduleEntry};
use crate::pipeline::evaluate::{fbeta_score, DEFAULT_THRESHOLD};
use crate::pipeline::report::Reporter;
use crate::pipeline::train::{split_train_valid, store_losses};
use crate::vgg::{Checkpoint, Vgg16TagClassifier};
use std::error::Error;
use std::time::{Duration, Instant};
use tch::Tensor;

/// Wall-clock training budget, checked after each schedule entry completes.
pub struct TrainBudget {
    max_secs: f64,
}

impl TrainBudget {
    pub fn from_hours(hours: f64) -> Self {
        TrainBudget {
            max_secs: hours * 60.0 * 60.0,
        }
    }

    pub fn max_secs(&self) -> f64 {
        self.max_secs
    }

    /// True once the elapsed time exceeds the budget.
    pub fn expired(&self, elapsed: Duration) -> bool {
        elapsed.as_secs_f64() > self.max_secs
    }
}

/// Unfreeze the backbone above the configured split layer and train it
/// jointly with the head.
///
/// Consumes one `(learn_rate, epochs, momentum)` schedule entry per
/// iteration, in array order. Without annealing, the head is reset to its
/// pre-fine-tuning weights before every entry so only the rate/momentum
/// regime varies; with annealing each entry continues from the previous one.
/// The loop stops after the first entry that exhausts the wall-clock budget;
/// entries never stop mid-epoch. Best-checkpointed weights are restored
/// before returning.
pub fn fine_tune_full_model(
    config: &Config,
    classifier: &mut Vgg16TagClassifier,
    schedule: &[FineScheduleEntry],
    checkpoint: &mut Checkpoint,
    x_input: &Tensor,
    y_true: &Tensor,
    reporter: &dyn Reporter,
) -> Result<(), Box<dyn Error>> {
    let budget = TrainBudget::from_hours(config.fine_tune.max_train_time_hrs);
    let (x_train, y_train, x_valid, y_valid) =
        split_train_valid(x_input, y_true, config.training.validation_split);

    reporter.info("Fine tuning top model and VGG16 layers.");
    reporter.info(&format!(
        "Will train for max {} min.",
        budget.max_secs() / 60.0
    ));

    let init_top_weights = classifier.split_fine_tuning(config.model.n_frozen_layers);
    reporter.info(&format!("Splitting at: {}", classifier.split_layer_name()));

    // The boundary moved, so features cached during head training are stale;
    // recompute once and drop the raw partitions again at scope exit.
    classifier.precompute_bottleneck(x_train, x_valid, config.training.batch_size);
    reporter.info("Bottleneck features calculated.");

    let mut train_losses = Vec::new();
    let mut val_losses = Vec::new();
    let mut executed_epochs = 0i64;
    let start = Instant::now();
    for entry in schedule {
        if !config.fine_tune.annealing {
            reporter.debug("Resetting top model to pre-fine-tuning weights.");
            classifier.set_top_weights(&init_top_weights);
        }
        let (entry_train, entry_val) = classifier.fine_tune_full_model(
            &y_train,
            &y_valid,
            entry.learn_rate,
            entry.momentum,
            entry.epochs,
            config.training.batch_size,
            checkpoint,
            reporter,
        )?;
        train_losses.extend(entry_train);
        val_losses.extend(entry_val);
        executed_epochs += entry.epochs;

        let threshold = classifier
            .classification_threshold
            .unwrap_or(DEFAULT_THRESHOLD);
        let probs = classifier.predict_validation(config.training.batch_size)?;
        let f2 = fbeta_score(&y_valid, &probs, threshold, 2.0);
        reporter.info(&format!("learn_rate : {}", entry.learn_rate));
        reporter.info(&format!("epochs : {}", entry.epochs));
        reporter.info(&format!("momentum : {}", entry.momentum));
        reporter.info(&format!("fbeta_score : {}", f2));
        reporter.info(&format!("classification_threshold : {}", threshold));

        let elapsed = start.elapsed();
        if budget.expired(elapsed) {
            reporter.info("Training canceled due to max train time parameter.");
            break;
        }
        reporter.debug(&format!(
            "Keep training: {:.0} < {:.0}",
            elapsed.as_secs_f64(),
            budget.max_secs()
        ));
    }

    let elapsed = start.elapsed().as_secs_f64();
    reporter.info(&format!("Training time [min]: {:.2}", elapsed / 60.0));
    if executed_epochs > 0 {
        reporter.info(&format!(
            "Training time [s/epoch]: {:.2}",
            elapsed / executed_epochs as f64
        ));
    }

    classifier.load_weights(&config.output.full_weights)?;

    store_losses("fine_train_losses.npy", &train_losses)?;
    store_losses("fine_val_losses.npy", &val_losses)?;

    let threshold = classifier
        .classification_threshold
        .unwrap_or(DEFAULT_THRESHOLD);
    let probs = classifier.predict_validation(config.training.batch_size)?;
    let f2 = fbeta_score(&y_valid, &probs, threshold, 2.0);
    reporter.info(&format!("Best fine-tuning F2: {}", f2));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::config::Config;
    use crate::vgg::{Checkpoint, Vgg16TagClassifier};
    use std::cell::RefCell;
    use tch::{Device, Kind};

    struct RecordingReporter {
        messages: RefCell<Vec<String>>,
    }

    impl RecordingReporter {
        fn new() -> Self {
            RecordingReporter {
                messages: RefCell::new(Vec::new()),
            }
        }

        fn count_containing(&self, needle: &str) -> usize {
            self.messages
                .borrow()
                .iter()
                .filter(|m| m.contains(needle))
                .count()
        }
    }

    impl Reporter for RecordingReporter {
        fn info(&self, message: &str) {
            self.messages.borrow_mut().push(message.to_string());
        }

        fn debug(&self, message: &str) {
            self.messages.borrow_mut().push(message.to_string());
        }
    }

    #[test]
    fn test_budget_conversion_and_boundary() {
        let budget = TrainBudget::from_hours(2.0);
        assert_eq!(budget.max_secs(), 7200.0);
        assert!(!budget.expired(Duration::from_secs(7200)));
        assert!(budget.expired(Duration::from_secs(7201)));
    }

    fn tiny_config(dir: &std::path::Path, annealing: bool, max_hours: f64) -> Config {
        let mut config = Config::default();
        config.data.img_size = 32;
        config.training.batch_size = 4;
        config.training.validation_split = 0.25;
        config.fine_tune.epochs = vec![1, 1];
        config.fine_tune.learn_rates = vec![0.001, 0.001];
        config.fine_tune.momentum = vec![0.9, 0.9];
        config.fine_tune.annealing = annealing;
        config.fine_tune.max_train_time_hrs = max_hours;
        config.output.full_weights = dir.join("full.ot").to_str().unwrap().to_string();
        config
    }

    fn tiny_inputs() -> (Tensor, Tensor) {
        let x = Tensor::rand(&[8, 3, 32, 32], (Kind::Float, Device::Cpu));
        let y = Tensor::rand(&[8, 2], (Kind::Float, Device::Cpu)).ge(0.5).to_kind(Kind::Float);
        (x, y)
    }

    #[test]
    fn test_zero_budget_cancels_after_first_entry() {
        let dir = tempfile::tempdir().unwrap();
        let config = tiny_config(dir.path(), true, 0.0);
        let (x, y) = tiny_inputs();
        let mut classifier = Vgg16TagClassifier::new(32, 2).unwrap();
        let mut checkpoint = Checkpoint::new(&config.output.full_weights);
        let reporter = RecordingReporter::new();
        let schedule = config.fine_tune.schedule().unwrap();

        fine_tune_full_model(
            &config,
            &mut classifier,
            &schedule,
            &mut checkpoint,
            &x,
            &y,
            &reporter,
        )
        .unwrap();

        assert_eq!(
            reporter.count_containing("Training canceled due to max train time parameter."),
            1
        );
        // Only the first of the two entries may have run.
        assert_eq!(reporter.count_containing("momentum :"), 1);
    }

    #[test]
    fn test_annealing_controls_head_reset() {
        let dir = tempfile::tempdir().unwrap();
        let (x, y) = tiny_inputs();

        let config = tiny_config(dir.path(), false, 10.0);
        let mut classifier = Vgg16TagClassifier::new(32, 2).unwrap();
        let mut checkpoint = Checkpoint::new(&config.output.full_weights);
        let reporter = RecordingReporter::new();
        let schedule = config.fine_tune.schedule().unwrap();
        fine_tune_full_model(&config, &mut classifier, &schedule, &mut checkpoint, &x, &y, &reporter)
            .unwrap();
        assert_eq!(
            reporter.count_containing("Resetting top model to pre-fine-tuning weights."),
            2
        );

        let config = tiny_config(dir.path(), true, 10.0);
        let mut classifier = Vgg16TagClassifier::new(32, 2).unwrap();
        let mut checkpoint = Checkpoint::new(&config.output.full_weights);
        let reporter = RecordingReporter::new();
        let schedule = config.fine_tune.schedule().unwrap();
        fine_tune_full_model(&config, &mut classifier, &schedule, &mut checkpoint, &x, &y, &reporter)
            .unwrap();
        assert_eq!(
            reporter.count_containing("Resetting top model to pre-fine-tuning weights."),
            0
        );
    }
}
