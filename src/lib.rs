//! # terratag - Amazon satellite tagging
//!
//! Multi-label tagging of Planet satellite imagery ("Planet: Understanding
//! the Amazon from Space") with a fine-tuned VGG16, built on tch (LibTorch).
//!
//! ## Features
//!
//! - **Two-phase training**: dense head on frozen-backbone bottleneck
//!   features, then joint fine-tuning of the last convolutional block
//! - **Schedule driven**: ordered learning-rate/epoch/momentum schedules
//!   with best-validation-accuracy checkpointing
//! - **Bounded fine-tuning**: wall-clock budget checked between schedule
//!   entries
//! - **Cached preprocessing**: tensors cached on disk per resize dimension
//! - **GPU acceleration**: CUDA when available, CPU otherwise
//!
//! ## Quick Start
//!
//! ```bash
//! # Download data (needs KAGGLE_USER / KAGGLE_PASSWD), train, checkpoint
//! ./target/release/terratag train
//!
//! # Write submission_file.csv from the saved checkpoints
//! ./target/release/terratag submit
//! ```
//!
//! ### As a Library
//!
//! ```no_run
//! use terratag::pipeline::config::Config;
//! use terratag::pipeline::loader::load_train_input;
//! use terratag::pipeline::report::ConsoleReporter;
//! use terratag::pipeline::train::train_classifier;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::default();
//!     let reporter = ConsoleReporter::new();
//!     let (x_input, y_true, _y_map) = load_train_input(&config.data, &reporter)?;
//!     let classifier = train_classifier(&config, &x_input, &y_true, &reporter)?;
//!     let _ = classifier;
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration
//!
//! Create a `config.toml` file to customize the run:
//!
//! ```toml
//! [data]
//! competition = "planet-understanding-the-amazon-from-space"
//! destination_dir = "input"
//! train_jpeg_dir = "input/train-jpg"
//! test_jpeg_dir = "input/test-jpg"
//! test_additional_jpeg_dir = "input/test-jpg-additional"
//! train_csv = "input/train_v2.csv"
//! train_cache_dir = "preprocessing/train"
//! test_cache_dir = "preprocessing/test"
//! img_size = 96
//!
//! [model]
//! n_frozen_layers = 10
//! classification_threshold = 0.2
//!
//! [training]
//! batch_size = 128
//! validation_split = 0.2
//! top_epochs = [50]
//! top_learn_rates = [0.00001]
//!
//! [fine_tune]
//! epochs = [5, 50]
//! learn_rates = [0.01, 0.001]
//! momentum = [0.9, 0.9]
//! max_train_time_hrs = 3.0
//! annealing = true
//!
//! [output]
//! top_weights = "weights_top_best.ot"
//! full_weights = "weights_full_best.ot"
//! submission_file = "submission_file.csv"
//! ```

pub mod pipeline;
pub mod vgg;
