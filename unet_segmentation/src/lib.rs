pub mod acquire;
pub mod augment;
pub mod config;
pub mod data;
pub mod error;
pub mod inference;
pub mod loader;
pub mod loss;
pub mod metric;
pub mod model;
pub mod palette;
pub mod resize;
pub mod training;
pub mod transform;
pub mod visualize;

pub use data::{SegmentationDataset, SegmentationItem};
pub use error::{Result, SegmentationError};
pub use loader::{ArrayBatch, BatchLoader, SegmentationBatch};
pub use model::{UNet, UNetConfig};
pub use palette::{decode, decode_mask, ClassSelection, CLASS_COLORS};
pub use transform::{Compose, OneOf, Transform};
