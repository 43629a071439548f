//! Multi-label F-beta evaluation.

use crate::vgg::Vgg16TagClassifier;
use tch::{Kind, Tensor};

/// Fallback decision threshold when neither the caller nor the classifier
/// supplies one.
pub const DEFAULT_THRESHOLD: f64 = 0.2;

/// Samples-averaged F-beta over a thresholded prediction matrix.
///
/// Probabilities at or above `threshold` count as predicted labels. Rows
/// without any true or predicted label score zero.
pub fn fbeta_score(y_true: &Tensor, y_prob: &Tensor, threshold: f64, beta: f64) -> f64 {
    let predicted = y_prob.ge(threshold).to_kind(Kind::Float);
    let actual = y_true.to_kind(Kind::Float);

    let tp = (&predicted * &actual).sum_dim_intlist(Some([1i64].as_slice()), false, Kind::Float);
    let predicted_pos = predicted.sum_dim_intlist(Some([1i64].as_slice()), false, Kind::Float);
    let actual_pos = actual.sum_dim_intlist(Some([1i64].as_slice()), false, Kind::Float);

    let precision = &tp / predicted_pos.clamp_min(1e-12);
    let recall = &tp / actual_pos.clamp_min(1e-12);

    let beta2 = beta * beta;
    let numerator = (&precision * &recall) * (1.0 + beta2);
    let denominator = (precision * beta2 + recall).clamp_min(1e-12);
    (numerator / denominator).mean(Kind::Float).double_value(&[])
}

/// F2 score of the classifier's predictions against gold labels.
///
/// The threshold falls back from the supplied value to the classifier's own,
/// then to [`DEFAULT_THRESHOLD`]. Returns `(f2, threshold_used)`; read-only
/// with respect to classifier state.
pub fn evaluate(
    classifier: &Vgg16TagClassifier,
    x_input: &Tensor,
    y_true: &Tensor,
    threshold: Option<f64>,
    batch_size: i64,
) -> (f64, f64) {
    let threshold = threshold
        .or(classifier.classification_threshold)
        .unwrap_or(DEFAULT_THRESHOLD);
    let prediction = classifier.predict(x_input, batch_size);
    let f2 = fbeta_score(y_true, &prediction, threshold, 2.0);
    (f2, threshold)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Device;

    fn matrix(values: &[f32], rows: i64, cols: i64) -> Tensor {
        Tensor::from_slice(values)
            .view([rows, cols])
            .to_kind(Kind::Float)
            .to(Device::Cpu)
    }

    #[test]
    fn test_perfect_prediction_scores_one() {
        let y_true = matrix(&[1.0, 0.0, 1.0], 1, 3);
        let y_prob = matrix(&[0.3, 0.1, 0.4], 1, 3);
        let f2 = fbeta_score(&y_true, &y_prob, 0.2, 2.0);
        assert!((f2 - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_recall_weighted_more_than_precision() {
        // One false positive: precision 2/3, recall 1.
        let fp = fbeta_score(
            &matrix(&[1.0, 0.0, 1.0], 1, 3),
            &matrix(&[0.9, 0.9, 0.9], 1, 3),
            0.5,
            2.0,
        );
        // One false negative: precision 1, recall 1/2.
        let fnr = fbeta_score(
            &matrix(&[1.0, 0.0, 1.0], 1, 3),
            &matrix(&[0.9, 0.1, 0.1], 1, 3),
            0.5,
            2.0,
        );
        assert!(fp > fnr);
    }

    #[test]
    fn test_empty_row_scores_zero() {
        let y_true = matrix(&[0.0, 0.0], 1, 2);
        let y_prob = matrix(&[0.1, 0.1], 1, 2);
        let f2 = fbeta_score(&y_true, &y_prob, 0.5, 2.0);
        assert_eq!(f2, 0.0);
    }

    #[test]
    fn test_averages_over_samples() {
        // First row perfect, second row completely missed.
        let y_true = matrix(&[1.0, 0.0, 0.0, 1.0], 2, 2);
        let y_prob = matrix(&[0.9, 0.1, 0.1, 0.1], 2, 2);
        let f2 = fbeta_score(&y_true, &y_prob, 0.5, 2.0);
        assert!((f2 - 0.5).abs() < 1e-6);
    }
}
