use std::{
    fs::{read_dir, remove_file},
    path::{Path, PathBuf},
};

use image::{imageops::FilterType, GenericImageView, ImageFormat};
use log::{debug, info, warn};

use crate::{
    config::{HEIGHT, MIN_SIZE, WIDTH},
    error::{Result, SegmentationError},
};

#[derive(Debug, Clone, Copy)]
pub struct ResizeConfig {
    pub width: u32,
    pub height: u32,
    pub filter: FilterType,
    /// The pass overwrites and deletes files; it only runs when set.
    pub confirmed: bool,
}

impl ResizeConfig {
    pub fn new(width: u32, height: u32, min_size: u32) -> Result<Self> {
        if width < min_size || height < min_size {
            return Err(SegmentationError::InvalidConfig(format!(
                "target {width}x{height} is below the minimum size {min_size}"
            )));
        }
        Ok(Self {
            width,
            height,
            filter: FilterType::Triangle,
            confirmed: false,
        })
    }

    /// Nearest-neighbour resampling, so mask colors stay exact.
    pub fn for_masks(mut self) -> Self {
        self.filter = FilterType::Nearest;
        self
    }

    pub fn confirmed(mut self, confirmed: bool) -> Self {
        self.confirmed = confirmed;
        self
    }
}

impl Default for ResizeConfig {
    fn default() -> Self {
        Self {
            width: WIDTH,
            height: HEIGHT,
            filter: FilterType::Triangle,
            confirmed: false,
        }
    }
}

#[derive(Debug, Default)]
pub struct ResizeReport {
    pub resized: Vec<PathBuf>,
    pub unchanged: Vec<PathBuf>,
    /// Files that could not be decoded, with the reason.
    pub skipped: Vec<(PathBuf, String)>,
}

impl ResizeReport {
    pub fn visited(&self) -> usize {
        self.resized.len() + self.unchanged.len() + self.skipped.len()
    }
}

/// Rewrites every image under `root` as a `width`x`height` PNG, in place.
///
/// Files that fail to decode are logged and skipped. A partially completed
/// pass is not rolled back.
pub fn resize_tree<P: AsRef<Path>>(root: P, config: &ResizeConfig) -> Result<ResizeReport> {
    let root = root.as_ref();
    if !config.confirmed {
        return Err(SegmentationError::Unconfirmed(root.to_path_buf()));
    }

    let mut files = Vec::new();
    collect_files(root, &mut files)?;

    let mut report = ResizeReport::default();
    for path in files {
        resize_file(&path, config, &mut report)?;
    }
    info!(
        "resized {} files under {} ({} unchanged, {} skipped)",
        report.resized.len(),
        root.display(),
        report.unchanged.len(),
        report.skipped.len()
    );
    Ok(report)
}

fn collect_files(dir: &Path, files: &mut Vec<PathBuf>) -> Result<()> {
    let mut entries = read_dir(dir)
        .map_err(|err| SegmentationError::io(dir, err))?
        .map(|entry| entry.map(|entry| entry.path()))
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(|err| SegmentationError::io(dir, err))?;
    entries.sort();

    for path in entries {
        if path.is_dir() {
            collect_files(&path, files)?;
        } else {
            files.push(path);
        }
    }
    Ok(())
}

fn resize_file(path: &Path, config: &ResizeConfig, report: &mut ResizeReport) -> Result<()> {
    let image = match image::open(path) {
        Ok(image) => image,
        Err(err) => {
            warn!("skipping {}: {err}", path.display());
            report.skipped.push((path.to_path_buf(), err.to_string()));
            return Ok(());
        }
    };

    let write_path = path.with_extension("png");
    let same_size = image.width() == config.width && image.height() == config.height;
    if same_size && write_path == path {
        debug!("{} already {}x{}", path.display(), config.width, config.height);
        report.unchanged.push(path.to_path_buf());
        return Ok(());
    }

    let resized = if same_size {
        image
    } else {
        image.resize_exact(config.width, config.height, config.filter)
    };
    resized
        .save_with_format(&write_path, ImageFormat::Png)
        .map_err(|err| SegmentationError::image(&write_path, err))?;
    if write_path != path {
        remove_file(path).map_err(|err| SegmentationError::io(path, err))?;
    }

    report.resized.push(write_path);
    Ok(())
}
