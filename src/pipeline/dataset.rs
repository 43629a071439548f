//! Competition data acquisition.
//!
//! Idempotent: when the expected JPEG directories and label CSV already
//! exist nothing is downloaded. Otherwise the four competition archives are
//! fetched with the caller's Kaggle credentials and unpacked, removing each
//! intermediate compressed artifact along the way. Decompression is a thin
//! wrapper over the system `7z`/`tar`/`unzip` tools.

use crate::pipeline::config::DataConfig;
use crate::pipeline::report::Reporter;
use reqwest::blocking::Client;
use std::env;
use std::error::Error;
use std::fs;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::Command;

/// One downloadable competition archive. `unpacked` names the intermediate
/// archive produced by the first extraction step, if any.
pub struct CompetitionArchive {
    pub archive: &'static str,
    pub unpacked: Option<&'static str>,
}

/// The four archives that make up the competition dataset.
pub const ARCHIVES: [CompetitionArchive; 4] = [
    CompetitionArchive {
        archive: "train-jpg.tar.7z",
        unpacked: Some("train-jpg.tar"),
    },
    CompetitionArchive {
        archive: "test-jpg.tar.7z",
        unpacked: Some("test-jpg.tar"),
    },
    CompetitionArchive {
        archive: "test-jpg-additional.tar.7z",
        unpacked: Some("test-jpg-additional.tar"),
    },
    CompetitionArchive {
        archive: "train_v2.csv.zip",
        unpacked: None,
    },
];

/// Kaggle data API endpoint for one competition file.
pub fn download_url(competition: &str, file: &str) -> String {
    format!(
        "https://www.kaggle.com/api/v1/competitions/data/download/{}/{}",
        competition, file
    )
}

/// Paths whose presence means the dataset is already extracted.
pub fn expected_paths(data: &DataConfig) -> [&str; 4] {
    [
        &data.train_jpeg_dir,
        &data.test_jpeg_dir,
        &data.test_additional_jpeg_dir,
        &data.train_csv,
    ]
}

/// Check whether competition data exists locally, downloading and extracting
/// it otherwise. Requires `KAGGLE_USER` and `KAGGLE_PASSWD` when a download
/// is needed.
pub fn ensure_competition_data(
    data: &DataConfig,
    reporter: &dyn Reporter,
) -> Result<(), Box<dyn Error>> {
    // If the folders already exist the files were already extracted.
    if expected_paths(data).iter().all(|p| Path::new(p).exists()) {
        reporter.info("All datasets are present.");
        return Ok(());
    }

    let user = env::var("KAGGLE_USER")
        .map_err(|_| "KAGGLE_USER must be set to download competition data")?;
    let passwd = env::var("KAGGLE_PASSWD")
        .map_err(|_| "KAGGLE_PASSWD must be set to download competition data")?;

    let destination = Path::new(&data.destination_dir);
    fs::create_dir_all(destination)?;
    let client = Client::builder().timeout(None).build()?;

    for entry in &ARCHIVES {
        reporter.info(&format!("Downloading {}...", entry.archive));
        let archive_path = download(
            &client,
            &user,
            &passwd,
            &data.competition,
            entry.archive,
            destination,
        )?;

        decompress(&archive_path, destination)?;
        fs::remove_file(&archive_path)?;

        if let Some(inner) = entry.unpacked {
            let inner_path = destination.join(inner);
            decompress(&inner_path, destination)?;
            fs::remove_file(&inner_path)?;
        }
        reporter.info(&format!("  ✓ {} extracted", entry.archive));
    }
    Ok(())
}

fn download(
    client: &Client,
    user: &str,
    passwd: &str,
    competition: &str,
    file: &str,
    destination: &Path,
) -> Result<PathBuf, Box<dyn Error>> {
    let url = download_url(competition, file);
    let mut response = client
        .get(&url)
        .basic_auth(user, Some(passwd))
        .send()?
        .error_for_status()?;

    let path = destination.join(file);
    let mut out = File::create(&path)?;
    response.copy_to(&mut out)?;
    Ok(path)
}

/// Unpack one archive into `destination`, dispatching on the file extension.
fn decompress(path: &Path, destination: &Path) -> Result<(), Box<dyn Error>> {
    let extension = path
        .extension()
        .and_then(|s| s.to_str())
        .ok_or_else(|| format!("{} has no file extension", path.display()))?;

    let status = match extension {
        "7z" => Command::new("7z")
            .arg("x")
            .arg("-y")
            .arg(format!("-o{}", destination.display()))
            .arg(path)
            .status()?,
        "zip" => Command::new("unzip")
            .arg("-o")
            .arg(path)
            .arg("-d")
            .arg(destination)
            .status()?,
        "tar" => Command::new("tar")
            .arg("xf")
            .arg(path)
            .arg("-C")
            .arg(destination)
            .status()?,
        other => return Err(format!("unsupported archive extension: {}", other).into()),
    };

    if !status.success() {
        return Err(format!("failed to extract {}", path.display()).into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::config::Config;
    use crate::pipeline::report::NullReporter;

    #[test]
    fn test_archive_table() {
        assert_eq!(ARCHIVES.len(), 4);
        assert_eq!(ARCHIVES[0].archive, "train-jpg.tar.7z");
        assert_eq!(ARCHIVES[0].unpacked, Some("train-jpg.tar"));
        assert_eq!(ARCHIVES[3].archive, "train_v2.csv.zip");
        assert_eq!(ARCHIVES[3].unpacked, None);
    }

    #[test]
    fn test_download_url() {
        let url = download_url("planet-understanding-the-amazon-from-space", "train-jpg.tar.7z");
        assert_eq!(
            url,
            "https://www.kaggle.com/api/v1/competitions/data/download/planet-understanding-the-amazon-from-space/train-jpg.tar.7z"
        );
    }

    #[test]
    fn test_present_data_short_circuits() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        let base = dir.path();
        for sub in ["train-jpg", "test-jpg", "test-jpg-additional"] {
            fs::create_dir_all(base.join(sub)).unwrap();
        }
        fs::write(base.join("train_v2.csv"), "image_name,tags\n").unwrap();

        config.data.train_jpeg_dir = base.join("train-jpg").to_str().unwrap().to_string();
        config.data.test_jpeg_dir = base.join("test-jpg").to_str().unwrap().to_string();
        config.data.test_additional_jpeg_dir =
            base.join("test-jpg-additional").to_str().unwrap().to_string();
        config.data.train_csv = base.join("train_v2.csv").to_str().unwrap().to_string();

        // No credentials in the environment, yet this must succeed.
        ensure_competition_data(&config.data, &NullReporter).unwrap();
    }

    #[test]
    fn test_unknown_extension_rejected() {
        let err = decompress(Path::new("weights.rar"), Path::new(".")).unwrap_err();
        assert!(err.to_string().contains("unsupported archive extension"));
    }
}
