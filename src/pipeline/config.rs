//! Configuration structures for the satellite tagging pipeline.
//!
//! This module provides strongly-typed configuration management using TOML
//! files. The configuration covers data locations, the backbone split,
//! the two training schedules, and output paths.

use serde::Deserialize;
use std::error::Error;

/// Main configuration structure loaded from `config.toml`.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Competition data locations and cache roots
    pub data: DataConfig,
    /// Model architecture and decision threshold
    pub model: ModelConfig,
    /// Head-training hyperparameters
    pub training: TrainingConfig,
    /// Fine-tuning hyperparameters
    pub fine_tune: FineTuneConfig,
    /// Output paths configuration
    pub output: OutputConfig,
}

/// Competition data locations and cache roots.
#[derive(Debug, Deserialize)]
pub struct DataConfig {
    /// Kaggle competition name used for downloads
    pub competition: String,
    /// Directory archives are downloaded into and extracted under
    pub destination_dir: String,
    /// Directory of training JPEG chips
    pub train_jpeg_dir: String,
    /// Directory of test JPEG chips
    pub test_jpeg_dir: String,
    /// Directory of additional test JPEG chips
    pub test_additional_jpeg_dir: String,
    /// CSV mapping training image names to space-separated tags
    pub train_csv: String,
    /// Cache root for preprocessed training tensors (keyed by image size)
    pub train_cache_dir: String,
    /// Cache root for preprocessed test tensors (keyed by image size)
    pub test_cache_dir: String,
    /// Square resize dimension; must be a multiple of 32
    pub img_size: i64,
}

/// Model architecture and decision threshold.
#[derive(Debug, Deserialize)]
pub struct ModelConfig {
    /// Number of backbone layers kept frozen during fine-tuning
    pub n_frozen_layers: usize,
    /// Probability threshold for multi-label decisions (default 0.2)
    pub classification_threshold: Option<f64>,
    /// Optional named-tensor file with pretrained backbone weights
    pub pretrained_weights: Option<String>,
}

/// Head-training hyperparameters.
#[derive(Debug, Deserialize)]
pub struct TrainingConfig {
    /// Batch size for both training phases
    pub batch_size: i64,
    /// Fraction of samples held out for validation
    pub validation_split: f64,
    /// Epoch counts, consumed in order alongside `top_learn_rates`
    pub top_epochs: Vec<i64>,
    /// Adam learning rates, parallel to `top_epochs`
    pub top_learn_rates: Vec<f64>,
}

/// Fine-tuning hyperparameters.
#[derive(Debug, Deserialize)]
pub struct FineTuneConfig {
    /// Epoch counts, consumed in order alongside the rate/momentum arrays
    pub epochs: Vec<i64>,
    /// SGD learning rates, parallel to `epochs`
    pub learn_rates: Vec<f64>,
    /// SGD momentum values, parallel to `epochs`
    pub momentum: Vec<f64>,
    /// Wall-clock budget; the schedule loop stops once exceeded
    pub max_train_time_hrs: f64,
    /// Continue each schedule entry from the previous one instead of
    /// resetting the head to its pre-fine-tuning weights
    pub annealing: bool,
}

/// Output paths configuration.
#[derive(Debug, Deserialize)]
pub struct OutputConfig {
    /// Best head-training weights checkpoint
    pub top_weights: String,
    /// Best fine-tuning weights checkpoint
    pub full_weights: String,
    /// Submission CSV path
    pub submission_file: String,
}

/// One head-training schedule step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TopScheduleEntry {
    pub learn_rate: f64,
    pub epochs: i64,
}

/// One fine-tuning schedule step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FineScheduleEntry {
    pub learn_rate: f64,
    pub epochs: i64,
    pub momentum: f64,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self, Box<dyn Error>> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }
}

impl TrainingConfig {
    /// Zip the parallel schedule arrays into ordered entries. Fails when the
    /// array lengths differ, before any training starts.
    pub fn schedule(&self) -> Result<Vec<TopScheduleEntry>, Box<dyn Error>> {
        if self.top_epochs.len() != self.top_learn_rates.len() {
            return Err(format!(
                "top_epochs ({}) and top_learn_rates ({}) must have the same length",
                self.top_epochs.len(),
                self.top_learn_rates.len()
            )
            .into());
        }
        Ok(self
            .top_learn_rates
            .iter()
            .zip(self.top_epochs.iter())
            .map(|(&learn_rate, &epochs)| TopScheduleEntry { learn_rate, epochs })
            .collect())
    }
}

impl FineTuneConfig {
    /// Zip the parallel schedule arrays into ordered entries. Fails when the
    /// array lengths differ, before any training starts.
    pub fn schedule(&self) -> Result<Vec<FineScheduleEntry>, Box<dyn Error>> {
        if self.epochs.len() != self.learn_rates.len() || self.epochs.len() != self.momentum.len() {
            return Err(format!(
                "fine_tune epochs ({}), learn_rates ({}) and momentum ({}) must have the same length",
                self.epochs.len(),
                self.learn_rates.len(),
                self.momentum.len()
            )
            .into());
        }
        Ok(self
            .learn_rates
            .iter()
            .zip(self.epochs.iter())
            .zip(self.momentum.iter())
            .map(|((&learn_rate, &epochs), &momentum)| FineScheduleEntry {
                learn_rate,
                epochs,
                momentum,
            })
            .collect())
    }
}

impl Default for Config {
    /// Get default configuration if `config.toml` is not available.
    fn default() -> Self {
        Config {
            data: DataConfig {
                competition: "planet-understanding-the-amazon-from-space".to_string(),
                destination_dir: "input".to_string(),
                train_jpeg_dir: "input/train-jpg".to_string(),
                test_jpeg_dir: "input/test-jpg".to_string(),
                test_additional_jpeg_dir: "input/test-jpg-additional".to_string(),
                train_csv: "input/train_v2.csv".to_string(),
                train_cache_dir: "preprocessing/train".to_string(),
                test_cache_dir: "preprocessing/test".to_string(),
                img_size: 96,
            },
            model: ModelConfig {
                n_frozen_layers: 10,
                classification_threshold: Some(0.2),
                pretrained_weights: None,
            },
            training: TrainingConfig {
                batch_size: 128,
                validation_split: 0.2,
                top_epochs: vec![50],
                top_learn_rates: vec![0.00001],
            },
            fine_tune: FineTuneConfig {
                epochs: vec![5, 50],
                learn_rates: vec![0.01, 0.001],
                momentum: vec![0.9, 0.9],
                max_train_time_hrs: 3.0,
                annealing: true,
            },
            output: OutputConfig {
                top_weights: "weights_top_best.ot".to_string(),
                full_weights: "weights_full_best.ot".to_string(),
                submission_file: "submission_file.csv".to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_schedules_are_consistent() {
        let config = Config::default();
        let top = config.training.schedule().unwrap();
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].epochs, 50);

        let fine = config.fine_tune.schedule().unwrap();
        assert_eq!(fine.len(), 2);
        assert_eq!(fine[0].learn_rate, 0.01);
        assert_eq!(fine[1].momentum, 0.9);
    }

    #[test]
    fn test_schedule_preserves_array_order() {
        let training = TrainingConfig {
            batch_size: 32,
            validation_split: 0.2,
            top_epochs: vec![10, 5, 5],
            top_learn_rates: vec![0.001, 0.0001, 0.00001],
        };
        let schedule = training.schedule().unwrap();
        assert_eq!(
            schedule,
            vec![
                TopScheduleEntry { learn_rate: 0.001, epochs: 10 },
                TopScheduleEntry { learn_rate: 0.0001, epochs: 5 },
                TopScheduleEntry { learn_rate: 0.00001, epochs: 5 },
            ]
        );
    }

    #[test]
    fn test_mismatched_top_schedule_fails_fast() {
        let training = TrainingConfig {
            batch_size: 32,
            validation_split: 0.2,
            top_epochs: vec![10, 5],
            top_learn_rates: vec![0.001],
        };
        assert!(training.schedule().is_err());
    }

    #[test]
    fn test_mismatched_fine_schedule_fails_fast() {
        let fine_tune = FineTuneConfig {
            epochs: vec![5, 50],
            learn_rates: vec![0.01, 0.001],
            momentum: vec![0.9],
            max_train_time_hrs: 3.0,
            annealing: true,
        };
        assert!(fine_tune.schedule().is_err());
    }

    #[test]
    fn test_parse_toml() {
        let toml_str = r#"
            [data]
            competition = "planet-understanding-the-amazon-from-space"
            destination_dir = "input"
            train_jpeg_dir = "input/train-jpg"
            test_jpeg_dir = "input/test-jpg"
            test_additional_jpeg_dir = "input/test-jpg-additional"
            train_csv = "input/train_v2.csv"
            train_cache_dir = "preprocessing/train"
            test_cache_dir = "preprocessing/test"
            img_size = 64

            [model]
            n_frozen_layers = 10

            [training]
            batch_size = 64
            validation_split = 0.2
            top_epochs = [50]
            top_learn_rates = [0.00001]

            [fine_tune]
            epochs = [5, 50]
            learn_rates = [0.01, 0.001]
            momentum = [0.9, 0.9]
            max_train_time_hrs = 3.0
            annealing = false

            [output]
            top_weights = "weights_top_best.ot"
            full_weights = "weights_full_best.ot"
            submission_file = "submission_file.csv"
        "#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.data.img_size, 64);
        assert_eq!(config.model.classification_threshold, None);
        assert!(!config.fine_tune.annealing);
    }
}
