//! Submission file generation for the test set.

use crate::pipeline::report::Reporter;
use crate::vgg::Vgg16TagClassifier;
use std::error::Error;
use tch::{Kind, Tensor};

/// Map a probability matrix to tag strings: for each row, every column whose
/// probability reaches its threshold contributes the corresponding label-map
/// entry, in column order.
pub fn map_predictions(
    predictions: &Tensor,
    label_map: &[String],
    thresholds: &[f64],
) -> Result<Vec<Vec<String>>, Box<dyn Error>> {
    let size = predictions.size();
    let (rows, cols) = (size[0] as usize, size[1] as usize);
    if cols != label_map.len() || cols != thresholds.len() {
        return Err(format!(
            "prediction columns ({}), label map ({}) and thresholds ({}) must agree",
            cols,
            label_map.len(),
            thresholds.len()
        )
        .into());
    }

    let flat_t = predictions.to_kind(Kind::Double).flatten(0, -1);
    let flat = Vec::<f64>::try_from(&flat_t)?;

    let mut labels = Vec::with_capacity(rows);
    for row in 0..rows {
        let tags: Vec<String> = (0..cols)
            .filter(|&col| flat[row * cols + col] >= thresholds[col])
            .map(|col| label_map[col].clone())
            .collect();
        labels.push(tags);
    }
    Ok(labels)
}

/// Run inference over the test tensor and write the two-column submission
/// CSV (`image_name,tags`). A single threshold is applied uniformly to all
/// tag columns. Consumes the classifier, releasing its resources afterwards.
pub fn write_submission(
    classifier: Vgg16TagClassifier,
    x_test: &Tensor,
    filenames: &[String],
    label_map: &[String],
    classification_threshold: f64,
    batch_size: i64,
    path: &str,
    reporter: &dyn Reporter,
) -> Result<(), Box<dyn Error>> {
    let predictions = classifier.predict(x_test, batch_size);
    let first_row_t = predictions.get(0).to_kind(Kind::Double);
    let first_row = Vec::<f64>::try_from(&first_row_t)?;
    reporter.info(&format!(
        "Predictions shape: {:?}\nFiles name count: {}\n1st predictions entry: {:?}",
        predictions.size(),
        filenames.len(),
        first_row
    ));

    let thresholds = vec![classification_threshold; label_map.len()];
    let predicted_labels = map_predictions(&predictions, label_map, &thresholds)?;

    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(["image_name", "tags"])?;
    for (filename, tags) in filenames.iter().zip(predicted_labels.iter()) {
        let image_name = filename.split('.').next().unwrap_or(filename.as_str());
        let tags = tags.join(" ");
        writer.write_record([image_name, tags.as_str()])?;
    }
    writer.flush()?;

    reporter.info(&format!("  ✓ Submission written to {}", path));
    Ok(())
    // classifier dropped here, releasing model resources
}
