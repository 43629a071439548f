//! VGG16 retrainer for multi-label satellite tagging using tch (PyTorch bindings).
//!
//! The backbone is kept as an explicit list of feature layers so it can be
//! split into a frozen part and a trainable tail. Bottleneck activations of
//! the frozen part are computed once per split point and reused as fixed
//! input while the trainable part iterates.

use crate::pipeline::report::Reporter;
use std::collections::{HashMap, HashSet};
use std::error::Error;
use std::path::{Path, PathBuf};
use tch::{nn, nn::Module, nn::ModuleT, nn::OptimizerConfig, Device, Kind, Reduction, Tensor};

/// Block layout of the VGG16 feature extractor: (conv count, channels).
const VGG16_BLOCKS: [(usize, i64); 5] = [(2, 64), (2, 128), (3, 256), (3, 512), (3, 512)];

/// One entry of the feature extractor. Pooling layers carry no weights but
/// still count as layers for the fine-tuning split index.
enum FeatureLayer {
    Conv(nn::Conv2D),
    Pool,
}

/// Frozen-part activations for the current split point.
struct BottleneckFeatures {
    train: Tensor,
    valid: Tensor,
}

/// Best-validation-accuracy weight checkpoint (save-best-only).
pub struct Checkpoint {
    path: PathBuf,
    best_val_acc: Option<f64>,
}

impl Checkpoint {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Checkpoint {
            path: path.into(),
            best_val_acc: None,
        }
    }

    /// Save the model weights if `val_acc` beats the best value seen so far.
    pub fn consider(
        &mut self,
        vs: &nn::VarStore,
        val_acc: f64,
        reporter: &dyn Reporter,
    ) -> Result<(), Box<dyn Error>> {
        if let Some(best) = self.best_val_acc {
            if val_acc <= best {
                return Ok(());
            }
        }
        vs.save(&self.path)?;
        reporter.info(&format!(
            "  val_acc improved to {:.5}, saving weights to {}",
            val_acc,
            self.path.display()
        ));
        self.best_val_acc = Some(val_acc);
        Ok(())
    }

    pub fn best_val_acc(&self) -> Option<f64> {
        self.best_val_acc
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

pub struct Vgg16TagClassifier {
    device: Device,
    vs: nn::VarStore,
    layers: Vec<(String, FeatureLayer)>,
    top: nn::SequentialT,
    n_classes: i64,
    split_index: usize,
    bottleneck: Option<BottleneckFeatures>,
    pub classification_threshold: Option<f64>,
}

impl Vgg16TagClassifier {
    /// Build the VGG16 backbone plus a dense head sized to `n_classes`.
    /// All feature layers start out frozen; only the head is trainable until
    /// `split_fine_tuning` moves the boundary.
    pub fn new(img_size: i64, n_classes: i64) -> Result<Self, Box<dyn Error>> {
        if img_size % 32 != 0 {
            return Err(format!(
                "img_size must be a multiple of 32 (five pooling halvings), got {}",
                img_size
            )
            .into());
        }

        // Auto-detect GPU
        let device = if tch::Cuda::is_available() {
            Device::Cuda(0)
        } else {
            Device::Cpu
        };

        let vs = nn::VarStore::new(device);
        let root = vs.root();
        let features = root.sub("features");

        let mut layers = Vec::new();
        let mut in_channels = 3i64;
        for (block, &(n_convs, channels)) in VGG16_BLOCKS.iter().enumerate() {
            for conv in 0..n_convs {
                let name = format!("block{}_conv{}", block + 1, conv + 1);
                let conv2d = nn::conv2d(
                    &features / name.as_str(),
                    in_channels,
                    channels,
                    3,
                    nn::ConvConfig {
                        padding: 1,
                        ..Default::default()
                    },
                );
                layers.push((name, FeatureLayer::Conv(conv2d)));
                in_channels = channels;
            }
            layers.push((format!("block{}_pool", block + 1), FeatureLayer::Pool));
        }

        let feature_dim = 512 * (img_size / 32) * (img_size / 32);
        let classifier = root.sub("classifier");
        let top = nn::seq_t()
            .add_fn(|x| x.flatten(1, -1))
            .add(nn::linear(
                &classifier / "fc1",
                feature_dim,
                256,
                Default::default(),
            ))
            .add_fn(|x| x.relu())
            .add_fn_t(|x, train| x.dropout(0.5, train))
            .add(nn::linear(
                &classifier / "output",
                256,
                n_classes,
                Default::default(),
            ));

        let split_index = layers.len();
        let mut model = Vgg16TagClassifier {
            device,
            vs,
            layers,
            top,
            n_classes,
            split_index,
            bottleneck: None,
            classification_threshold: None,
        };
        model.refresh_trainability();
        Ok(model)
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn n_classes(&self) -> i64 {
        self.n_classes
    }

    pub fn n_feature_layers(&self) -> usize {
        self.layers.len()
    }

    /// Name of the first trainable feature layer, or `"classifier"` when the
    /// whole backbone is frozen.
    pub fn split_layer_name(&self) -> &str {
        match self.layers.get(self.split_index) {
            Some((name, _)) => name,
            None => "classifier",
        }
    }

    /// Copy pretrained backbone weights from a named-tensor file. Only
    /// `features.*` entries with matching shapes are copied; returns how many
    /// tensors were taken over.
    pub fn load_pretrained_features(
        &mut self,
        path: &Path,
        reporter: &dyn Reporter,
    ) -> Result<usize, Box<dyn Error>> {
        let named = Tensor::load_multi(path)?;
        let mut vars = self.vs.variables();
        let mut copied = 0usize;
        tch::no_grad(|| {
            for (name, src) in &named {
                if !name.starts_with("features.") {
                    continue;
                }
                if let Some(dst) = vars.get_mut(name) {
                    if dst.size() == src.size() {
                        dst.copy_(src);
                        copied += 1;
                    }
                }
            }
        });
        if copied == 0 {
            return Err(format!("no backbone tensors copied from {}", path.display()).into());
        }
        reporter.info(&format!(
            "  ✓ Copied {} pretrained backbone tensors from {}",
            copied,
            path.display()
        ));
        Ok(copied)
    }

    /// Move the frozen/trainable boundary: the first `n_frozen_layers`
    /// feature layers stay frozen, everything above becomes trainable.
    /// Invalidates bottleneck features cached for the old boundary and
    /// returns a snapshot of the current head weights (the baseline for
    /// non-annealed fine-tuning runs).
    pub fn split_fine_tuning(&mut self, n_frozen_layers: usize) -> HashMap<String, Tensor> {
        self.split_index = n_frozen_layers.min(self.layers.len());
        self.bottleneck = None;
        self.refresh_trainability();
        self.top_weights()
    }

    fn refresh_trainability(&mut self) {
        let frozen: HashSet<&str> = self.layers[..self.split_index]
            .iter()
            .map(|(name, _)| name.as_str())
            .collect();
        for (name, var) in self.vs.variables() {
            if let Some(rest) = name.strip_prefix("features.") {
                let layer = rest.split('.').next().unwrap_or(rest);
                let _ = var.set_requires_grad(!frozen.contains(layer));
            }
        }
    }

    /// Deep-copied snapshot of the dense head weights.
    pub fn top_weights(&self) -> HashMap<String, Tensor> {
        self.vs
            .variables()
            .iter()
            .filter(|(name, _)| name.starts_with("classifier."))
            .map(|(name, var)| (name.clone(), var.detach().copy()))
            .collect()
    }

    /// Restore the dense head from a snapshot taken with `top_weights`.
    pub fn set_top_weights(&mut self, weights: &HashMap<String, Tensor>) {
        let mut vars = self.vs.variables();
        tch::no_grad(|| {
            for (name, snapshot) in weights {
                if let Some(var) = vars.get_mut(name) {
                    var.copy_(snapshot);
                }
            }
        });
    }

    /// Run the frozen part of the backbone over both partitions exactly once
    /// and cache the activations. The raw image partitions are consumed here:
    /// they are no longer needed once the bottleneck is computed and are the
    /// largest live allocation, so they are dropped at scope exit.
    pub fn precompute_bottleneck(&mut self, x_train: Tensor, x_valid: Tensor, batch_size: i64) {
        let train = self.forward_frozen(&x_train, batch_size);
        let valid = self.forward_frozen(&x_valid, batch_size);
        self.bottleneck = Some(BottleneckFeatures { train, valid });
    }

    fn forward_frozen(&self, x: &Tensor, batch_size: i64) -> Tensor {
        tch::no_grad(|| {
            let n = x.size()[0];
            let mut chunks = Vec::new();
            let mut start = 0i64;
            while start < n {
                let len = batch_size.min(n - start);
                let xb = x.narrow(0, start, len).to(self.device);
                let out = self.forward_features(&xb, 0, self.split_index);
                chunks.push(out.to(Device::Cpu));
                start += len;
            }
            Tensor::cat(&chunks, 0)
        })
    }

    fn forward_features(&self, x: &Tensor, from: usize, to: usize) -> Tensor {
        let mut out = x.shallow_clone();
        for (_, layer) in &self.layers[from..to] {
            out = match layer {
                FeatureLayer::Conv(conv) => conv.forward(&out).relu(),
                FeatureLayer::Pool => out.max_pool2d_default(2),
            };
        }
        out
    }

    /// Trainable tail (feature layers above the split) plus the dense head.
    fn forward_tail(&self, bottleneck: &Tensor, train: bool) -> Tensor {
        let feats = self.forward_features(bottleneck, self.split_index, self.layers.len());
        self.top.forward_t(&feats, train)
    }

    /// Train the dense head on the cached bottleneck features with Adam at a
    /// fixed learning rate. Returns per-epoch (train, validation) losses.
    pub fn train_top_model(
        &mut self,
        y_train: &Tensor,
        y_valid: &Tensor,
        learn_rate: f64,
        epochs: i64,
        batch_size: i64,
        checkpoint: &mut Checkpoint,
        reporter: &dyn Reporter,
    ) -> Result<(Vec<f64>, Vec<f64>), Box<dyn Error>> {
        let mut opt = nn::Adam::default().build(&self.vs, learn_rate)?;
        self.run_training_entry(&mut opt, y_train, y_valid, epochs, batch_size, checkpoint, reporter)
    }

    /// Jointly train the unfrozen backbone tail and the head with
    /// SGD(momentum). Returns per-epoch (train, validation) losses.
    pub fn fine_tune_full_model(
        &mut self,
        y_train: &Tensor,
        y_valid: &Tensor,
        learn_rate: f64,
        momentum: f64,
        epochs: i64,
        batch_size: i64,
        checkpoint: &mut Checkpoint,
        reporter: &dyn Reporter,
    ) -> Result<(Vec<f64>, Vec<f64>), Box<dyn Error>> {
        let mut opt = nn::Sgd {
            momentum,
            ..Default::default()
        }
        .build(&self.vs, learn_rate)?;
        self.run_training_entry(&mut opt, y_train, y_valid, epochs, batch_size, checkpoint, reporter)
    }

    fn run_training_entry(
        &self,
        opt: &mut nn::Optimizer,
        y_train: &Tensor,
        y_valid: &Tensor,
        epochs: i64,
        batch_size: i64,
        checkpoint: &mut Checkpoint,
        reporter: &dyn Reporter,
    ) -> Result<(Vec<f64>, Vec<f64>), Box<dyn Error>> {
        let bottleneck = self
            .bottleneck
            .as_ref()
            .ok_or("bottleneck features not computed")?;
        let n = bottleneck.train.size()[0];

        let mut train_losses = Vec::with_capacity(epochs as usize);
        let mut val_losses = Vec::with_capacity(epochs as usize);

        for epoch in 0..epochs {
            let perm = Tensor::randperm(n, (Kind::Int64, Device::Cpu));
            let x_shuffled = bottleneck.train.index_select(0, &perm);
            let y_shuffled = y_train.index_select(0, &perm);

            let mut total_loss = 0.0;
            let mut batches = 0;
            let mut start = 0i64;
            while start < n {
                let len = batch_size.min(n - start);
                let xb = x_shuffled.narrow(0, start, len).to(self.device);
                let yb = y_shuffled.narrow(0, start, len).to(self.device);

                let logits = self.forward_tail(&xb, true);
                let loss = logits.binary_cross_entropy_with_logits::<Tensor>(
                    &yb,
                    None,
                    None,
                    Reduction::Mean,
                );
                opt.backward_step(&loss);

                total_loss += loss.double_value(&[]);
                batches += 1;
                start += len;
            }

            let (val_loss, val_acc) = self.validate(y_valid, batch_size);
            train_losses.push(total_loss / batches as f64);
            val_losses.push(val_loss);

            if (epoch + 1) % 5 == 0 {
                reporter.debug(&format!(
                    "  Epoch {:3}/{}: loss={:.4}, val_loss={:.4}, val_acc={:.2}%",
                    epoch + 1,
                    epochs,
                    total_loss / batches as f64,
                    val_loss,
                    val_acc * 100.0
                ));
            }
            checkpoint.consider(&self.vs, val_acc, reporter)?;
        }

        Ok((train_losses, val_losses))
    }

    /// Loss and element-wise binary accuracy on the validation bottleneck.
    fn validate(&self, y_valid: &Tensor, batch_size: i64) -> (f64, f64) {
        tch::no_grad(|| {
            let bottleneck = match &self.bottleneck {
                Some(b) => b,
                None => return (0.0, 0.0),
            };
            let n = bottleneck.valid.size()[0];
            let mut total_loss = 0.0;
            let mut batches = 0;
            let mut correct = 0i64;
            let mut seen = 0i64;
            let mut start = 0i64;
            while start < n {
                let len = batch_size.min(n - start);
                let xb = bottleneck.valid.narrow(0, start, len).to(self.device);
                let yb = y_valid.narrow(0, start, len).to(self.device);

                let logits = self.forward_tail(&xb, false);
                let loss = logits.binary_cross_entropy_with_logits::<Tensor>(
                    &yb,
                    None,
                    None,
                    Reduction::Mean,
                );
                total_loss += loss.double_value(&[]);
                batches += 1;

                let preds = logits.sigmoid().ge(0.5).to_kind(Kind::Float);
                correct += preds
                    .eq_tensor(&yb)
                    .sum(Kind::Int64)
                    .int64_value(&[]);
                seen += preds.numel() as i64;
                start += len;
            }
            let acc = if seen > 0 {
                correct as f64 / seen as f64
            } else {
                0.0
            };
            let loss = if batches > 0 {
                total_loss / batches as f64
            } else {
                0.0
            };
            (loss, acc)
        })
    }

    /// Prediction probabilities for the cached validation partition.
    pub fn predict_validation(&self, batch_size: i64) -> Result<Tensor, Box<dyn Error>> {
        let bottleneck = self
            .bottleneck
            .as_ref()
            .ok_or("bottleneck features not computed")?;
        Ok(tch::no_grad(|| {
            let n = bottleneck.valid.size()[0];
            let mut chunks = Vec::new();
            let mut start = 0i64;
            while start < n {
                let len = batch_size.min(n - start);
                let xb = bottleneck.valid.narrow(0, start, len).to(self.device);
                chunks.push(self.forward_tail(&xb, false).sigmoid().to(Device::Cpu));
                start += len;
            }
            Tensor::cat(&chunks, 0)
        }))
    }

    /// Batched inference over raw images: full backbone plus head, sigmoid
    /// probabilities on the CPU.
    pub fn predict(&self, x: &Tensor, batch_size: i64) -> Tensor {
        tch::no_grad(|| {
            let n = x.size()[0];
            let mut chunks = Vec::new();
            let mut start = 0i64;
            while start < n {
                let len = batch_size.min(n - start);
                let xb = x.narrow(0, start, len).to(self.device);
                let feats = self.forward_features(&xb, 0, self.layers.len());
                let logits = self.top.forward_t(&feats, false);
                chunks.push(logits.sigmoid().to(Device::Cpu));
                start += len;
            }
            Tensor::cat(&chunks, 0)
        })
    }

    /// Save all model weights to file
    pub fn save_weights(&self, path: &str) -> Result<(), Box<dyn Error>> {
        self.vs.save(path)?;
        Ok(())
    }

    /// Load model weights from file
    pub fn load_weights(&mut self, path: &str) -> Result<(), Box<dyn Error>> {
        self.vs.load(path)?;
        Ok(())
    }
}

/// Rebuild a fine-tuned classifier from its persisted checkpoints: construct
/// the model, restore the head-training weights, move the split boundary,
/// then restore the fine-tuned weights.
pub fn load_fine_tuned(
    img_size: i64,
    n_classes: i64,
    n_frozen_layers: usize,
    top_weights_path: &str,
    full_weights_path: &str,
    reporter: &dyn Reporter,
) -> Result<Vgg16TagClassifier, Box<dyn Error>> {
    let mut classifier = Vgg16TagClassifier::new(img_size, n_classes)?;
    classifier.load_weights(top_weights_path)?;
    let _ = classifier.split_fine_tuning(n_frozen_layers);
    classifier.load_weights(full_weights_path)?;
    reporter.debug("Loaded fine-tuned VGG16 model.");
    Ok(classifier)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::report::NullReporter;

    #[test]
    fn test_backbone_layer_layout() {
        let classifier = Vgg16TagClassifier::new(32, 3).unwrap();
        // 13 convolutions + 5 pools
        assert_eq!(classifier.n_feature_layers(), 18);
        assert_eq!(classifier.split_layer_name(), "classifier");
    }

    #[test]
    fn test_split_moves_boundary() {
        let mut classifier = Vgg16TagClassifier::new(32, 3).unwrap();
        let baseline = classifier.split_fine_tuning(10);
        assert_eq!(classifier.split_layer_name(), "block4_conv1");
        // fc1 weight/bias + output weight/bias
        assert_eq!(baseline.len(), 4);
    }

    #[test]
    fn test_predict_shape_and_range() {
        let classifier = Vgg16TagClassifier::new(32, 4).unwrap();
        let x = Tensor::rand(&[2, 3, 32, 32], (Kind::Float, Device::Cpu));
        let probs = classifier.predict(&x, 2);
        assert_eq!(probs.size(), vec![2, 4]);
        let max = probs.max().double_value(&[]);
        let min = probs.min().double_value(&[]);
        assert!((0.0..=1.0).contains(&min));
        assert!((0.0..=1.0).contains(&max));
    }

    #[test]
    fn test_top_weight_snapshot_roundtrip() {
        let mut classifier = Vgg16TagClassifier::new(32, 3).unwrap();
        let snapshot = classifier.top_weights();

        // Perturb the head, then restore the snapshot.
        {
            let mut vars = classifier.vs.variables();
            let fc1 = vars.get_mut("classifier.fc1.weight").unwrap();
            tch::no_grad(|| {
                let _ = fc1.fill_(1.0);
            });
        }
        let perturbed = classifier.vs.variables();
        assert!(!perturbed["classifier.fc1.weight"]
            .allclose(&snapshot["classifier.fc1.weight"], 1e-5, 1e-8, false));

        classifier.set_top_weights(&snapshot);
        let restored = classifier.vs.variables();
        assert!(restored["classifier.fc1.weight"]
            .allclose(&snapshot["classifier.fc1.weight"], 1e-5, 1e-8, false));
    }

    #[test]
    fn test_checkpoint_keeps_best_weights() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("best.ot");

        let vs = nn::VarStore::new(Device::Cpu);
        let mut var = vs.root().zeros("w", &[2]);
        let mut checkpoint = Checkpoint::new(&path);
        let reporter = NullReporter;

        // First observation always saves.
        checkpoint.consider(&vs, 0.5, &reporter).unwrap();
        assert_eq!(checkpoint.best_val_acc(), Some(0.5));

        // A worse epoch must not overwrite the stored weights.
        tch::no_grad(|| {
            let _ = var.fill_(1.0);
        });
        checkpoint.consider(&vs, 0.4, &reporter).unwrap();
        assert_eq!(checkpoint.best_val_acc(), Some(0.5));

        let mut restored = nn::VarStore::new(Device::Cpu);
        let mut restored_var = restored.root().zeros("w", &[2]);
        tch::no_grad(|| {
            let _ = restored_var.fill_(9.0);
        });
        restored.load(&path).unwrap();
        let value = restored.variables()["w"].double_value(&[0]);
        assert_eq!(value, 0.0);
    }
}
