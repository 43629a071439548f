//! Data structures for competition label records.

use serde::Deserialize;

/// One row of the training label CSV: an image identifier and its
/// space-separated weather/land-use tags.
#[derive(Debug, Deserialize, Clone)]
pub struct TrainRecord {
    /// Image file stem, e.g. "train_0"
    pub image_name: String,
    /// Space-separated tags, e.g. "clear primary water"
    pub tags: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_label_csv() {
        let data = "image_name,tags\ntrain_0,haze primary\ntrain_1,clear agriculture water\n";
        let mut rdr = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_reader(data.as_bytes());
        let records: Vec<TrainRecord> = rdr.deserialize().collect::<Result<_, _>>().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].image_name, "train_0");
        assert_eq!(records[1].tags, "clear agriculture water");
    }
}
