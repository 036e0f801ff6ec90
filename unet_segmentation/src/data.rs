use std::{
    ffi::OsString,
    fs::read_dir,
    path::{Path, PathBuf},
};

use burn::data::dataset::Dataset;
use derive_new::new;
use image::{Rgb, RgbImage};
use log::warn;
use ndarray::Array3;

use crate::{
    config::SplitDirs,
    error::{Result, SegmentationError},
    palette::{decode_mask, ClassSelection},
    transform::Transform,
};

/// One image with its decoded mask, both in `(height, width, channels)`
/// layout.
#[derive(Debug, Clone, PartialEq, new)]
pub struct SegmentationItem {
    pub image: Array3<f32>,
    pub mask: Array3<f32>,
}

/// Image/mask pairs read lazily from two directories sharing file names.
/// Ids are the raw file names, so names that are not valid UTF-8 still load.
///
/// Every call to [`SegmentationDataset::get`] reads both files again and
/// re-runs the transforms, so random augmentations differ between calls.
pub struct SegmentationDataset {
    ids: Vec<OsString>,
    images_dir: PathBuf,
    masks_dir: PathBuf,
    selection: ClassSelection,
    augmentation: Option<Box<dyn Transform>>,
    preprocessing: Option<Box<dyn Transform>>,
}

impl SegmentationDataset {
    pub fn new<P: AsRef<Path>, Q: AsRef<Path>>(
        images_dir: P,
        masks_dir: Q,
        selection: ClassSelection,
    ) -> Result<Self> {
        let images_dir = images_dir.as_ref().to_path_buf();
        let ids = Self::load_ids(&images_dir)?;

        Ok(Self {
            ids,
            images_dir,
            masks_dir: masks_dir.as_ref().to_path_buf(),
            selection,
            augmentation: None,
            preprocessing: None,
        })
    }

    pub fn from_split(split: &SplitDirs, classes: &[String]) -> Result<Self> {
        let selection = ClassSelection::new(classes)?;
        Self::new(&split.images_dir, &split.masks_dir, selection)
    }

    pub fn with_augmentation(mut self, transform: impl Transform + 'static) -> Self {
        self.augmentation = Some(Box::new(transform));
        self
    }

    pub fn with_preprocessing(mut self, transform: impl Transform + 'static) -> Self {
        self.preprocessing = Some(Box::new(transform));
        self
    }

    pub fn ids(&self) -> &[OsString] {
        &self.ids
    }

    pub fn selection(&self) -> &ClassSelection {
        &self.selection
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn get(&self, index: usize) -> Result<SegmentationItem> {
        let id = self
            .ids
            .get(index)
            .ok_or(SegmentationError::IndexOutOfRange {
                index,
                len: self.ids.len(),
            })?;

        let image = load_rgb(&self.images_dir.join(id))?;

        let mask_path = self.masks_dir.join(id);
        if !mask_path.is_file() {
            return Err(SegmentationError::MissingMask {
                id: id.to_string_lossy().into_owned(),
                path: mask_path,
            });
        }
        let mask = load_rgb(&mask_path)?;

        if image.dimensions() != mask.dimensions() {
            return Err(SegmentationError::ShapeMismatch(format!(
                "image `{}` is {:?} but its mask is {:?}",
                id.to_string_lossy(),
                image.dimensions(),
                mask.dimensions()
            )));
        }

        let mut item = SegmentationItem::new(image_to_array(&image), decode_mask(&mask, &self.selection));

        if let Some(augmentation) = &self.augmentation {
            item = augmentation.apply(item)?;
        }
        if let Some(preprocessing) = &self.preprocessing {
            item = preprocessing.apply(item)?;
        }
        Ok(item)
    }

    fn load_ids(images_dir: &Path) -> Result<Vec<OsString>> {
        let entries = read_dir(images_dir).map_err(|err| SegmentationError::io(images_dir, err))?;

        let mut ids = Vec::new();
        for entry in entries {
            let path = entry
                .map_err(|err| SegmentationError::io(images_dir, err))?
                .path();
            if !path.is_file() {
                continue;
            }
            if let Some(name) = path.file_name() {
                ids.push(name.to_os_string());
            }
        }
        ids.sort();
        Ok(ids)
    }
}

impl Dataset<SegmentationItem> for SegmentationDataset {
    fn get(&self, index: usize) -> Option<SegmentationItem> {
        match SegmentationDataset::get(self, index) {
            Ok(item) => Some(item),
            Err(err) => {
                warn!("skipping sample {index}: {err}");
                None
            }
        }
    }

    fn len(&self) -> usize {
        self.ids.len()
    }
}

/// Decodes any supported image file into 8-bit RGB.
pub fn load_rgb(path: &Path) -> Result<RgbImage> {
    let image = image::open(path).map_err(|err| SegmentationError::image(path, err))?;
    Ok(match image {
        image::DynamicImage::ImageRgb8(rgb) => rgb,
        _ => image.into_rgb8(),
    })
}

pub fn image_to_array(image: &RgbImage) -> Array3<f32> {
    let (width, height) = image.dimensions();
    Array3::from_shape_fn((height as usize, width as usize, 3), |(y, x, c)| {
        image.get_pixel(x as u32, y as u32).0[c] as f32
    })
}

/// Converts an `(height, width, 3)` array of 0-255 values back to an image,
/// clamping out-of-range values.
pub fn array_to_image(array: &Array3<f32>) -> RgbImage {
    let (height, width, channels) = array.dim();
    RgbImage::from_fn(width as u32, height as u32, |x, y| {
        let (x, y) = (x as usize, y as usize);
        let channel = |c: usize| array[[y, x, c.min(channels - 1)]].round().clamp(0.0, 255.0) as u8;
        Rgb([channel(0), channel(1), channel(2)])
    })
}

#[cfg(test)]
mod tests {
    use std::{
        fs,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
    };

    use image::Rgb;
    use tempfile::tempdir;

    use super::*;

    fn write_pair<P: AsRef<Path>>(root: &Path, id: P, size: u32, mask_color: [u8; 3]) {
        let id = id.as_ref();
        RgbImage::from_pixel(size, size, Rgb([10, 20, 30]))
            .save(root.join("images").join(id))
            .unwrap();
        RgbImage::from_pixel(size, size, Rgb(mask_color))
            .save(root.join("masks").join(id))
            .unwrap();
    }

    fn layout() -> tempfile::TempDir {
        let tmp = tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("images")).unwrap();
        fs::create_dir_all(tmp.path().join("masks")).unwrap();
        tmp
    }

    fn animal() -> ClassSelection {
        ClassSelection::new(&["animal"]).unwrap()
    }

    #[test]
    fn loads_rgb_image_and_decoded_mask() {
        let tmp = layout();
        write_pair(tmp.path(), "a.png", 8, [0, 0, 255]);

        let dataset = SegmentationDataset::new(tmp.path().join("images"), tmp.path().join("masks"), animal()).unwrap();
        assert_eq!(dataset.len(), 1);

        let item = dataset.get(0).unwrap();
        assert_eq!(item.image.dim(), (8, 8, 3));
        assert_eq!(item.mask.dim(), (8, 8, 1));
        assert_eq!(item.image[[0, 0, 0]], 10.0);
        assert_eq!(item.image[[0, 0, 2]], 30.0);
        assert_eq!(item.mask.sum(), 64.0);
    }

    #[test]
    fn ids_skip_subdirectories_and_are_sorted() {
        let tmp = layout();
        write_pair(tmp.path(), "b.png", 4, [0, 0, 0]);
        write_pair(tmp.path(), "a.png", 4, [0, 0, 0]);
        fs::create_dir_all(tmp.path().join("images").join("nested")).unwrap();

        let dataset = SegmentationDataset::new(tmp.path().join("images"), tmp.path().join("masks"), animal()).unwrap();
        assert_eq!(dataset.ids(), ["a.png", "b.png"]);
    }

    #[test]
    fn out_of_range_index_is_an_error() {
        let tmp = layout();
        write_pair(tmp.path(), "a.png", 4, [0, 0, 0]);
        let dataset = SegmentationDataset::new(tmp.path().join("images"), tmp.path().join("masks"), animal()).unwrap();

        assert!(matches!(
            dataset.get(1),
            Err(SegmentationError::IndexOutOfRange { index: 1, len: 1 })
        ));
    }

    #[test]
    fn missing_mask_fails_on_get_not_on_construction() {
        let tmp = layout();
        write_pair(tmp.path(), "a.png", 4, [0, 0, 0]);
        fs::remove_file(tmp.path().join("masks").join("a.png")).unwrap();

        let dataset = SegmentationDataset::new(tmp.path().join("images"), tmp.path().join("masks"), animal()).unwrap();
        assert!(matches!(dataset.get(0), Err(SegmentationError::MissingMask { id, .. }) if id == "a.png"));
        assert!(Dataset::get(&dataset, 0).is_none());
    }

    #[test]
    fn mask_of_another_size_is_rejected() {
        let tmp = layout();
        write_pair(tmp.path(), "a.png", 4, [0, 0, 0]);
        RgbImage::new(5, 4).save(tmp.path().join("masks").join("a.png")).unwrap();

        let dataset = SegmentationDataset::new(tmp.path().join("images"), tmp.path().join("masks"), animal()).unwrap();
        assert!(matches!(dataset.get(0), Err(SegmentationError::ShapeMismatch(_))));
    }

    #[test]
    fn augmentation_runs_before_preprocessing() {
        let tmp = layout();
        write_pair(tmp.path(), "a.png", 4, [0, 0, 0]);

        let dataset = SegmentationDataset::new(tmp.path().join("images"), tmp.path().join("masks"), animal())
            .unwrap()
            .with_augmentation(|mut item: SegmentationItem| -> Result<SegmentationItem> {
                item.image.fill(1.0);
                Ok(item)
            })
            .with_preprocessing(|mut item: SegmentationItem| -> Result<SegmentationItem> {
                item.image.mapv_inplace(|v| v * 3.0);
                Ok(item)
            });

        let item = dataset.get(0).unwrap();
        assert!(item.image.iter().all(|v| *v == 3.0));
    }

    #[test]
    fn every_get_rereads_files_and_reruns_augmentation() {
        let tmp = layout();
        write_pair(tmp.path(), "a.png", 4, [0, 0, 255]);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        let dataset = SegmentationDataset::new(tmp.path().join("images"), tmp.path().join("masks"), animal())
            .unwrap()
            .with_augmentation(move |item: SegmentationItem| -> Result<SegmentationItem> {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(item)
            });

        assert_eq!(dataset.get(0).unwrap().image[[0, 0, 0]], 10.0);
        RgbImage::from_pixel(4, 4, Rgb([200, 20, 30]))
            .save(tmp.path().join("images").join("a.png"))
            .unwrap();
        assert_eq!(dataset.get(0).unwrap().image[[0, 0, 0]], 200.0);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[cfg(unix)]
    #[test]
    fn non_utf8_file_names_are_kept() {
        use std::{ffi::OsStr, os::unix::ffi::OsStrExt};

        let tmp = layout();
        write_pair(tmp.path(), "a.png", 4, [0, 0, 255]);
        let name = OsStr::from_bytes(b"b\xff.png");
        write_pair(tmp.path(), name, 4, [0, 0, 255]);

        let dataset = SegmentationDataset::new(tmp.path().join("images"), tmp.path().join("masks"), animal()).unwrap();
        assert_eq!(dataset.len(), 2);
        assert_eq!(dataset.ids()[1].as_os_str(), name);
        assert_eq!(dataset.get(1).unwrap().mask.sum(), 16.0);
    }

    #[test]
    fn array_round_trips_through_image() {
        let mut image = RgbImage::new(3, 2);
        image.put_pixel(2, 1, Rgb([1, 2, 3]));
        assert_eq!(array_to_image(&image_to_array(&image)), image);
    }
}
