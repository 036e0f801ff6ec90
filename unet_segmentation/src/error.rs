use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SegmentationError>;

#[derive(Debug, Error)]
pub enum SegmentationError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("image error at {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("unknown class `{0}`")]
    UnknownClass(String),
    #[error("class selection must name at least one class")]
    EmptySelection,
    #[error("no mask for sample `{id}` (expected {path})")]
    MissingMask { id: String, path: PathBuf },
    #[error("index {index} out of range for length {len}")]
    IndexOutOfRange { index: usize, len: usize },
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),
    #[error("cannot stack batch: {0}")]
    Stack(#[from] ndarray::ShapeError),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("refusing to rewrite {0} in place without confirmation")]
    Unconfirmed(PathBuf),
    #[error("dataset acquisition failed: {0}")]
    Acquire(String),
}

impl SegmentationError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn image(path: impl Into<PathBuf>, source: image::ImageError) -> Self {
        Self::Image {
            path: path.into(),
            source,
        }
    }
}
