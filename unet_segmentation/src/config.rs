use std::path::{Path, PathBuf};

use burn::config::Config;

pub const DATASET_URL: &str = "https://github.com/PanJan44/BIAI-dataset";
pub const DATASET_ROOT: &str = "./dataset";

pub const WIDTH: u32 = 800;
pub const HEIGHT: u32 = 600;
pub const MIN_SIZE: u32 = 480;

#[derive(Config, Debug, PartialEq)]
pub struct SplitDirs {
    pub images_dir: PathBuf,
    pub masks_dir: PathBuf,
}

impl SplitDirs {
    pub fn under<P: AsRef<Path>>(root: P, split: &str) -> Self {
        let root = root.as_ref();
        Self::new(root.join("Images").join(split), root.join("Masks").join(split))
    }
}

/// Where the dataset lives and how its splits are laid out.
///
/// The published dataset only ships a `Train` split, so every split points
/// at it by default.
#[derive(Config, Debug, PartialEq)]
pub struct DatasetConfig {
    #[config(default = "PathBuf::from(DATASET_ROOT)")]
    pub root: PathBuf,
    #[config(default = "String::from(DATASET_URL)")]
    pub url: String,
    #[config(default = "SplitDirs::under(DATASET_ROOT, \"Train\")")]
    pub train: SplitDirs,
    #[config(default = "SplitDirs::under(DATASET_ROOT, \"Train\")")]
    pub valid: SplitDirs,
    #[config(default = "SplitDirs::under(DATASET_ROOT, \"Train\")")]
    pub test: SplitDirs,
    #[config(default = "WIDTH")]
    pub width: u32,
    #[config(default = "HEIGHT")]
    pub height: u32,
    #[config(default = "MIN_SIZE")]
    pub min_size: u32,
}

impl DatasetConfig {
    /// Default layout moved under another root.
    pub fn rooted_at<P: AsRef<Path>>(root: P) -> Self {
        let root = root.as_ref();
        Self::new()
            .with_train(SplitDirs::under(root, "Train"))
            .with_valid(SplitDirs::under(root, "Train"))
            .with_test(SplitDirs::under(root, "Train"))
            .with_root(root.to_path_buf())
    }

    /// Every directory the resize pass has to visit, without duplicates.
    pub fn split_dirs(&self) -> Vec<&SplitDirs> {
        let mut dirs: Vec<&SplitDirs> = Vec::new();
        for split in [&self.train, &self.valid, &self.test] {
            if !dirs.contains(&split) {
                dirs.push(split);
            }
        }
        dirs
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn default_layout_points_every_split_at_train() {
        let config = DatasetConfig::new();
        assert_eq!(config.root, Path::new(DATASET_ROOT));
        assert_eq!(config.train.images_dir, Path::new("./dataset/Images/Train"));
        assert_eq!(config.test.masks_dir, Path::new("./dataset/Masks/Train"));
        assert_eq!((config.width, config.height, config.min_size), (800, 600, 480));
        assert_eq!(config.split_dirs().len(), 1);
    }

    #[test]
    fn rooted_layout_moves_every_split() {
        let config = DatasetConfig::rooted_at("/data/biai");
        assert_eq!(config.root, Path::new("/data/biai"));
        assert_eq!(config.valid.masks_dir, Path::new("/data/biai/Masks/Train"));
        assert_eq!(config.url, DATASET_URL);
    }

    #[test]
    fn saves_and_loads_through_burn_config() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("dataset.json");
        let config = DatasetConfig::rooted_at(tmp.path()).with_valid(SplitDirs::under(tmp.path(), "Valid"));

        config.save(&path).unwrap();
        let loaded = DatasetConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.split_dirs().len(), 2);
    }

    #[test]
    fn malformed_layout_fails_to_load() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("dataset.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(DatasetConfig::load(&path).is_err());
    }
}
