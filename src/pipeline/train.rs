//! Two-phase training pipeline: dense head first, then fine-tuning.

use crate::pipeline::config::{Config, TopScheduleEntry};
use crate::pipeline::evaluate::{fbeta_score, DEFAULT_THRESHOLD};
use crate::pipeline::fine_tune::fine_tune_full_model;
use crate::pipeline::report::Reporter;
use crate::vgg::{Checkpoint, Vgg16TagClassifier};
use rand::seq::SliceRandom;
use rand::thread_rng;
use std::error::Error;
use std::path::Path;
use std::time::Instant;
use tch::Tensor;

/// Train the classifier end to end: a dense head on frozen-backbone
/// bottleneck features, then joint fine-tuning of the last convolutional
/// layers together with the head.
///
/// Both schedules are validated up front so malformed configuration fails
/// before any training starts.
pub fn train_classifier(
    config: &Config,
    x_input: &Tensor,
    y_true: &Tensor,
    reporter: &dyn Reporter,
) -> Result<Vgg16TagClassifier, Box<dyn Error>> {
    let top_schedule = config.training.schedule()?;
    let fine_schedule = config.fine_tune.schedule()?;

    let mut checkpoint_top = Checkpoint::new(&config.output.top_weights);
    let mut checkpoint_full = Checkpoint::new(&config.output.full_weights);

    let mut classifier = train_top_model(
        config,
        &top_schedule,
        &mut checkpoint_top,
        x_input,
        y_true,
        reporter,
    )?;
    fine_tune_full_model(
        config,
        &mut classifier,
        &fine_schedule,
        &mut checkpoint_full,
        x_input,
        y_true,
        reporter,
    )?;
    Ok(classifier)
}

/// Random unstratified train/validation split.
/// Returns `(x_train, y_train, x_valid, y_valid)` as owned tensors.
pub(crate) fn split_train_valid(
    x: &Tensor,
    y: &Tensor,
    validation_split: f64,
) -> (Tensor, Tensor, Tensor, Tensor) {
    let n = x.size()[0];
    let mut indices: Vec<i64> = (0..n).collect();
    indices.shuffle(&mut thread_rng());
    let n_valid = ((n as f64) * validation_split).round() as usize;
    let valid_idx = Tensor::from_slice(&indices[..n_valid]);
    let train_idx = Tensor::from_slice(&indices[n_valid..]);
    (
        x.index_select(0, &train_idx),
        y.index_select(0, &train_idx),
        x.index_select(0, &valid_idx),
        y.index_select(0, &valid_idx),
    )
}

/// Persist one loss history as a `.npy` array.
pub(crate) fn store_losses(path: &str, losses: &[f64]) -> Result<(), Box<dyn Error>> {
    Tensor::from_slice(losses).write_npy(path)?;
    Ok(())
}

/// Train the dense head on bottleneck features of the fully frozen backbone.
///
/// Consumes one `(learn_rate, epochs)` schedule entry per iteration, in
/// array order, checkpointing on the best validation accuracy seen so far.
/// The best-checkpointed weights are restored before returning, even when a
/// later schedule entry degraded validation accuracy.
pub fn train_top_model(
    config: &Config,
    schedule: &[TopScheduleEntry],
    checkpoint: &mut Checkpoint,
    x_input: &Tensor,
    y_true: &Tensor,
    reporter: &dyn Reporter,
) -> Result<Vgg16TagClassifier, Box<dyn Error>> {
    let n_classes = y_true.size()[1];
    let (x_train, y_train, x_valid, y_valid) =
        split_train_valid(x_input, y_true, config.training.validation_split);

    reporter.info("Training dense top model.");
    let mut classifier = Vgg16TagClassifier::new(config.data.img_size, n_classes)?;
    classifier.classification_threshold = config.model.classification_threshold;
    reporter.info("Vgg16 built.");

    if let Some(weights) = &config.model.pretrained_weights {
        if Path::new(weights).exists() {
            classifier.load_pretrained_features(Path::new(weights), reporter)?;
        }
    }

    // The partitions are consumed here: once the frozen forward pass is
    // cached they are dead weight and freed at scope exit.
    classifier.precompute_bottleneck(x_train, x_valid, config.training.batch_size);
    reporter.info("Vgg16 bottleneck features calculated.");
    reporter.info("Top built, ready to train.");

    let mut train_losses = Vec::new();
    let mut val_losses = Vec::new();
    let start = Instant::now();
    for entry in schedule {
        let (entry_train, entry_val) = classifier.train_top_model(
            &y_train,
            &y_valid,
            entry.learn_rate,
            entry.epochs,
            config.training.batch_size,
            checkpoint,
            reporter,
        )?;
        train_losses.extend(entry_train);
        val_losses.extend(entry_val);

        let threshold = classifier
            .classification_threshold
            .unwrap_or(DEFAULT_THRESHOLD);
        let probs = classifier.predict_validation(config.training.batch_size)?;
        let f2 = fbeta_score(&y_valid, &probs, threshold, 2.0);
        reporter.info(&format!("learn_rate : {}", entry.learn_rate));
        reporter.info(&format!("epochs : {}", entry.epochs));
        reporter.info(&format!("fbeta_score : {}", f2));
        reporter.info(&format!("classification_threshold : {}", threshold));
    }
    let total_epochs: i64 = schedule.iter().map(|e| e.epochs).sum();
    if total_epochs > 0 {
        reporter.info(&format!(
            "Training time [s/epoch]: {:.2}",
            start.elapsed().as_secs_f64() / total_epochs as f64
        ));
    }

    classifier.load_weights(&config.output.top_weights)?;
    reporter.info("Weights loaded");

    store_losses("top_train_losses.npy", &train_losses)?;
    store_losses("top_val_losses.npy", &val_losses)?;

    let threshold = classifier
        .classification_threshold
        .unwrap_or(DEFAULT_THRESHOLD);
    let probs = classifier.predict_validation(config.training.batch_size)?;
    let f2 = fbeta_score(&y_valid, &probs, threshold, 2.0);
    reporter.info(&format!("Best top model F2: {}", f2));
    Ok(classifier)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{Device, Kind};

    #[test]
    fn test_split_partitions_all_samples() {
        let x = Tensor::rand(&[10, 3, 4, 4], (Kind::Float, Device::Cpu));
        let y = Tensor::rand(&[10, 2], (Kind::Float, Device::Cpu));
        let (x_train, y_train, x_valid, y_valid) = split_train_valid(&x, &y, 0.2);
        assert_eq!(x_train.size()[0], 8);
        assert_eq!(y_train.size()[0], 8);
        assert_eq!(x_valid.size()[0], 2);
        assert_eq!(y_valid.size()[0], 2);
        assert_eq!(x_train.size()[1..], x.size()[1..]);
    }

    #[test]
    fn test_split_keeps_rows_aligned() {
        // y rows mirror x rows, so any permutation must keep them paired.
        let x = Tensor::arange(6, (Kind::Float, Device::Cpu)).view([6, 1]);
        let y = x.copy();
        let (x_train, y_train, x_valid, y_valid) = split_train_valid(&x, &y, 0.5);
        assert!(x_train.allclose(&y_train, 1e-6, 1e-8, false));
        assert!(x_valid.allclose(&y_valid, 1e-6, 1e-8, false));
    }

    #[test]
    fn test_store_losses_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("losses.npy");
        let losses = vec![0.9, 0.5, 0.25];
        store_losses(path.to_str().unwrap(), &losses).unwrap();
        let restored = Tensor::read_npy(&path).unwrap();
        assert!(restored.allclose(&Tensor::from_slice(&losses), 1e-9, 1e-12, false));
    }
}
