//! Tensor loading and preprocessing with a dimension-keyed disk cache.
//!
//! The first load for a given resize dimension decodes the raw JPEG chips
//! (in parallel) and persists the canonical tensors; later loads come
//! straight from the cache. Raw per-image buffers only live inside the
//! preprocessing scope and are released when it ends.

use crate::pipeline::config::DataConfig;
use crate::pipeline::data::TrainRecord;
use crate::pipeline::report::Reporter;
use csv::ReaderBuilder;
use rayon::prelude::*;
use std::collections::{BTreeSet, HashMap};
use std::error::Error;
use std::fs;
use std::fs::File;
use std::path::{Path, PathBuf};
use tch::{Kind, Tensor};

/// Cache directory for one resize dimension.
pub fn cache_dir(root: &str, img_size: i64) -> PathBuf {
    Path::new(root).join(img_size.to_string())
}

/// Read all rows of the training label CSV.
pub fn read_label_records(path: &str) -> Result<Vec<TrainRecord>, Box<dyn Error>> {
    let file = File::open(path)?;
    let mut rdr = ReaderBuilder::new().has_headers(true).from_reader(file);
    let records: Vec<TrainRecord> = rdr.deserialize().collect::<Result<_, _>>()?;
    Ok(records)
}

/// Sorted unique tag vocabulary over all records. The resulting order
/// defines the label-tensor columns and stays stable across phases.
pub fn tag_vocabulary(records: &[TrainRecord]) -> Vec<String> {
    let tags: BTreeSet<String> = records
        .iter()
        .flat_map(|r| r.tags.split_whitespace().map(str::to_string))
        .collect();
    tags.into_iter().collect()
}

/// Multi-hot encode one space-separated tag string.
pub fn encode_tags(tags: &str, index: &HashMap<String, usize>, n_classes: usize) -> Vec<f32> {
    let mut row = vec![0.0; n_classes];
    for tag in tags.split_whitespace() {
        if let Some(&i) = index.get(tag) {
            row[i] = 1.0;
        }
    }
    row
}

/// Decode one JPEG into a float CHW tensor scaled to [0, 1].
fn decode_jpeg(path: &Path, img_size: i64) -> Result<Tensor, String> {
    let img = image::open(path).map_err(|e| format!("failed to load {}: {}", path.display(), e))?;
    let img = img.resize_exact(
        img_size as u32,
        img_size as u32,
        image::imageops::FilterType::Triangle,
    );
    let raw = img.to_rgb8().into_raw();
    let tensor = Tensor::from_slice(&raw)
        .view([img_size, img_size, 3])
        .permute(&[2, 0, 1])
        .to_kind(Kind::Float)
        / 255.0;
    Ok(tensor)
}

/// Load the training tensors for `data.img_size`, preprocessing and caching
/// them on the first call. Returns `(images, labels, label_map)`.
pub fn load_train_input(
    data: &DataConfig,
    reporter: &dyn Reporter,
) -> Result<(Tensor, Tensor, Vec<String>), Box<dyn Error>> {
    let cache = cache_dir(&data.train_cache_dir, data.img_size);
    let (x_input, y_true, label_map) = if cache.exists() {
        load_train_cache(&cache)?
    } else {
        let records = read_label_records(&data.train_csv)?;
        let label_map = tag_vocabulary(&records);
        reporter.info(&format!(
            "There are {} unique tags including {:?}",
            label_map.len(),
            label_map
        ));
        let (x_input, y_true) =
            preprocess_train(&records, &data.train_jpeg_dir, data.img_size, &label_map)?;
        store_train_cache(&cache, &x_input, &y_true, &label_map)?;
        (x_input, y_true, label_map)
    };

    reporter.debug(&format!("x_input shape: {:?}", x_input.size()));
    reporter.debug(&format!("y_true shape: {:?}", y_true.size()));
    reporter.debug(&format!("Label mapping: {:?}", label_map));
    Ok((x_input, y_true, label_map))
}

/// Load the test tensors for `data.img_size`, preprocessing and caching them
/// on the first call. Returns `(images, filenames)` over the test and
/// additional-test directories, in directory order.
pub fn load_test_input(
    data: &DataConfig,
    reporter: &dyn Reporter,
) -> Result<(Tensor, Vec<String>), Box<dyn Error>> {
    let cache = cache_dir(&data.test_cache_dir, data.img_size);
    let (x_test, filenames) = if cache.exists() {
        load_test_cache(&cache)?
    } else {
        let (x_test, filenames) = preprocess_test(
            &[&data.test_jpeg_dir, &data.test_additional_jpeg_dir],
            data.img_size,
        )?;
        store_test_cache(&cache, &x_test, &filenames)?;
        (x_test, filenames)
    };

    reporter.debug(&format!("x_test shape: {:?}", x_test.size()));
    reporter.debug(&format!("x_test filenames: {}", filenames.len()));
    Ok((x_test, filenames))
}

fn preprocess_train(
    records: &[TrainRecord],
    jpeg_dir: &str,
    img_size: i64,
    label_map: &[String],
) -> Result<(Tensor, Tensor), Box<dyn Error>> {
    if !Path::new(jpeg_dir).exists() {
        return Err(format!("training JPEG directory {} does not exist", jpeg_dir).into());
    }
    let index: HashMap<String, usize> = label_map
        .iter()
        .enumerate()
        .map(|(i, tag)| (tag.clone(), i))
        .collect();

    let decoded: Vec<(Tensor, Vec<f32>)> = records
        .par_iter()
        .map(|record| {
            let path = Path::new(jpeg_dir).join(format!("{}.jpg", record.image_name));
            let image = decode_jpeg(&path, img_size)?;
            Ok((image, encode_tags(&record.tags, &index, label_map.len())))
        })
        .collect::<Result<_, String>>()?;

    let n = decoded.len() as i64;
    let n_classes = label_map.len() as i64;
    let mut images = Vec::with_capacity(decoded.len());
    let mut labels = Vec::with_capacity(decoded.len() * label_map.len());
    for (image, row) in decoded {
        images.push(image);
        labels.extend(row);
    }
    let x = Tensor::stack(&images, 0);
    let y = Tensor::from_slice(&labels).view([n, n_classes]);
    Ok((x, y))
}

fn preprocess_test(
    jpeg_dirs: &[&str],
    img_size: i64,
) -> Result<(Tensor, Vec<String>), Box<dyn Error>> {
    let mut paths = Vec::new();
    for dir in jpeg_dirs {
        if !Path::new(dir).exists() {
            return Err(format!("test JPEG directory {} does not exist", dir).into());
        }
        let mut entries: Vec<PathBuf> = fs::read_dir(dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().and_then(|s| s.to_str()) == Some("jpg"))
            .collect();
        entries.sort();
        paths.extend(entries);
    }

    let filenames: Vec<String> = paths
        .iter()
        .filter_map(|p| p.file_name().and_then(|s| s.to_str()).map(str::to_string))
        .collect();

    let images: Vec<Tensor> = paths
        .par_iter()
        .map(|path| decode_jpeg(path, img_size))
        .collect::<Result<_, String>>()?;

    let x = Tensor::stack(&images, 0);
    Ok((x, filenames))
}

fn store_train_cache(
    dir: &Path,
    x: &Tensor,
    y: &Tensor,
    label_map: &[String],
) -> Result<(), Box<dyn Error>> {
    fs::create_dir_all(dir)?;
    x.write_npy(dir.join("images.npy"))?;
    y.write_npy(dir.join("labels.npy"))?;
    fs::write(
        dir.join("label_map.json"),
        serde_json::to_string_pretty(&label_map)?,
    )?;
    Ok(())
}

fn load_train_cache(dir: &Path) -> Result<(Tensor, Tensor, Vec<String>), Box<dyn Error>> {
    let x = Tensor::read_npy(dir.join("images.npy"))?;
    let y = Tensor::read_npy(dir.join("labels.npy"))?;
    let label_map: Vec<String> = serde_json::from_str(&fs::read_to_string(dir.join("label_map.json"))?)?;
    Ok((x, y, label_map))
}

fn store_test_cache(dir: &Path, x: &Tensor, filenames: &[String]) -> Result<(), Box<dyn Error>> {
    fs::create_dir_all(dir)?;
    x.write_npy(dir.join("images.npy"))?;
    fs::write(
        dir.join("filenames.json"),
        serde_json::to_string_pretty(&filenames)?,
    )?;
    Ok(())
}

fn load_test_cache(dir: &Path) -> Result<(Tensor, Vec<String>), Box<dyn Error>> {
    let x = Tensor::read_npy(dir.join("images.npy"))?;
    let filenames: Vec<String> =
        serde_json::from_str(&fs::read_to_string(dir.join("filenames.json"))?)?;
    Ok((x, filenames))
}
