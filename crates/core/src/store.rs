//! Current, baseline and diff image trees
//!
//! All three trees are addressed by the same relative file name, derived from
//! the [`TargetKey`].

use std::path::PathBuf;

use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::error::ShotResult;
use crate::shot::TargetKey;

/// Configuration for the image trees
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ImagePaths {
    pub baseline_path: PathBuf,
    pub current_path: PathBuf,
    pub difference_path: PathBuf,
}

impl Default for ImagePaths {
    fn default() -> Self {
        Self {
            baseline_path: PathBuf::from(".shotdrift/baseline"),
            current_path: PathBuf::from(".shotdrift/current"),
            difference_path: PathBuf::from(".shotdrift/difference"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ImageStore {
    baseline_dir: PathBuf,
    current_dir: PathBuf,
    diff_dir: PathBuf,
}

impl ImageStore {
    /// Create the store, making sure all three directories exist
    pub fn new(paths: &ImagePaths) -> ShotResult<Self> {
        std::fs::create_dir_all(&paths.baseline_path)?;
        std::fs::create_dir_all(&paths.current_path)?;
        std::fs::create_dir_all(&paths.difference_path)?;

        Ok(Self {
            baseline_dir: paths.baseline_path.clone(),
            current_dir: paths.current_path.clone(),
            diff_dir: paths.difference_path.clone(),
        })
    }

    pub fn current_path(&self, key: &TargetKey) -> PathBuf {
        self.current_dir.join(key.file_name())
    }

    pub fn baseline_path(&self, key: &TargetKey) -> PathBuf {
        self.baseline_dir.join(key.file_name())
    }

    pub fn diff_path(&self, key: &TargetKey) -> PathBuf {
        self.diff_dir.join(key.file_name())
    }

    pub fn write_current(&self, key: &TargetKey, bytes: &[u8]) -> ShotResult<PathBuf> {
        let path = self.current_path(key);
        std::fs::write(&path, bytes)?;
        debug!("Wrote current image {}", path.display());
        Ok(path)
    }

    /// Read a baseline, `None` when it does not exist yet
    pub fn read_baseline(&self, key: &TargetKey) -> ShotResult<Option<Vec<u8>>> {
        match std::fs::read(self.baseline_path(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn write_baseline(&self, key: &TargetKey, bytes: &[u8]) -> ShotResult<PathBuf> {
        let path = self.baseline_path(key);
        std::fs::write(&path, bytes)?;
        info!("Created baseline for '{}'", key);
        Ok(path)
    }

    pub fn write_diff(&self, key: &TargetKey, diff: &image::RgbaImage) -> ShotResult<PathBuf> {
        let path = self.diff_path(key);
        diff.save(&path)?;
        Ok(path)
    }

    /// Remove images left over from a previous run in the current and diff trees
    pub fn clean_outputs(&self) -> ShotResult<()> {
        for dir in [&self.current_dir, &self.diff_dir] {
            for entry in std::fs::read_dir(dir)? {
                let path = entry?.path();
                if path.extension().map(|e| e == "png").unwrap_or(false) {
                    std::fs::remove_file(&path)?;
                }
            }
        }
        Ok(())
    }

    /// List all baseline keys
    pub fn list_baselines(&self) -> ShotResult<Vec<String>> {
        let mut baselines = Vec::new();

        for entry in std::fs::read_dir(&self.baseline_dir)? {
            let path = entry?.path();
            if path.extension().map(|e| e == "png").unwrap_or(false) {
                if let Some(name) = path.file_stem() {
                    baselines.push(name.to_string_lossy().to_string());
                }
            }
        }

        baselines.sort();
        Ok(baselines)
    }
}

/// SHA256 of an in-memory image file
pub fn hash_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store_in(tmp: &TempDir) -> ImageStore {
        ImageStore::new(&ImagePaths {
            baseline_path: tmp.path().join("baseline"),
            current_path: tmp.path().join("current"),
            difference_path: tmp.path().join("difference"),
        })
        .unwrap()
    }

    #[test]
    fn test_default_paths() {
        let paths = ImagePaths::default();
        assert_eq!(paths.baseline_path, PathBuf::from(".shotdrift/baseline"));
    }

    #[test]
    fn test_parallel_trees_share_file_name() {
        let tmp = TempDir::new().unwrap();
        let store = store_in(&tmp);
        let key = TargetKey::new("Home", Some(375));

        assert_eq!(store.current_path(&key).file_name(), store.baseline_path(&key).file_name());
        assert_eq!(store.diff_path(&key), tmp.path().join("difference/home__w375px.png"));
    }

    #[test]
    fn test_missing_baseline_reads_none() {
        let tmp = TempDir::new().unwrap();
        let store = store_in(&tmp);
        let key = TargetKey::new("new-page", None);

        assert!(store.read_baseline(&key).unwrap().is_none());
        store.write_baseline(&key, b"png").unwrap();
        assert_eq!(store.read_baseline(&key).unwrap().unwrap(), b"png");
        assert_eq!(store.list_baselines().unwrap(), vec!["new-page".to_string()]);
    }

    #[test]
    fn test_clean_outputs_keeps_baselines() {
        let tmp = TempDir::new().unwrap();
        let store = store_in(&tmp);
        let key = TargetKey::new("home", None);

        store.write_current(&key, b"a").unwrap();
        store.write_baseline(&key, b"b").unwrap();
        store.clean_outputs().unwrap();

        assert!(!store.current_path(&key).exists());
        assert!(store.baseline_path(&key).exists());
    }

    #[test]
    fn test_hash_bytes_is_stable() {
        assert_eq!(hash_bytes(b"abc"), hash_bytes(b"abc"));
        assert_ne!(hash_bytes(b"abc"), hash_bytes(b"abd"));
    }
}
