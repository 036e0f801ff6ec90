use burn::tensor::{backend::Backend, Data, Shape, Tensor};
use ndarray::{stack, Array4, ArrayView3, Axis};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

use crate::{
    data::{SegmentationDataset, SegmentationItem},
    error::{Result, SegmentationError},
};

/// Images and masks of one batch in `(batch, height, width, channels)`
/// layout.
#[derive(Debug, Clone, PartialEq)]
pub struct ArrayBatch {
    pub images: Array4<f32>,
    pub masks: Array4<f32>,
}

#[derive(Debug, Clone)]
pub struct SegmentationBatch<B: Backend> {
    /// `[batch, 3, height, width]`
    pub images: Tensor<B, 4>,
    /// `[batch, classes, height, width]`
    pub masks: Tensor<B, 4>,
}

impl ArrayBatch {
    /// Stacks samples along a new leading axis. Every image must share one
    /// shape and every mask another.
    pub fn stack(items: &[SegmentationItem]) -> Result<Self> {
        let images: Vec<ArrayView3<f32>> = items.iter().map(|item| item.image.view()).collect();
        let masks: Vec<ArrayView3<f32>> = items.iter().map(|item| item.mask.view()).collect();

        Ok(Self {
            images: stack(Axis(0), &images)?,
            masks: stack(Axis(0), &masks)?,
        })
    }

    /// Moves the batch to `device`, channels first.
    pub fn to_tensors<B: Backend>(&self, device: &B::Device) -> SegmentationBatch<B> {
        SegmentationBatch {
            images: nchw_tensor(&self.images, device),
            masks: nchw_tensor(&self.masks, device),
        }
    }
}

fn nchw_tensor<B: Backend>(array: &Array4<f32>, device: &B::Device) -> Tensor<B, 4> {
    let (n, h, w, c) = array.dim();
    let values: Vec<f32> = array.view().permuted_axes([0, 3, 1, 2]).iter().copied().collect();
    let data = Data::new(values, Shape::new([n, c, h, w]));
    Tensor::<B, 4>::from_data(data.convert(), device)
}

/// Groups dataset samples into fixed-size batches.
///
/// The trailing samples that do not fill a whole batch are dropped. With
/// `shuffle` the sample order is permuted on construction and on every
/// [`BatchLoader::on_epoch_end`]; the caller decides where epochs end.
pub struct BatchLoader {
    dataset: SegmentationDataset,
    batch_size: usize,
    shuffle: bool,
    indices: Vec<usize>,
    rng: StdRng,
}

impl BatchLoader {
    pub fn new(dataset: SegmentationDataset, batch_size: usize, shuffle: bool) -> Result<Self> {
        Self::build(dataset, batch_size, shuffle, StdRng::from_entropy())
    }

    pub fn with_seed(
        dataset: SegmentationDataset,
        batch_size: usize,
        shuffle: bool,
        seed: u64,
    ) -> Result<Self> {
        Self::build(dataset, batch_size, shuffle, StdRng::seed_from_u64(seed))
    }

    fn build(dataset: SegmentationDataset, batch_size: usize, shuffle: bool, rng: StdRng) -> Result<Self> {
        if batch_size == 0 {
            return Err(SegmentationError::InvalidConfig(String::from(
                "batch size must be at least 1",
            )));
        }
        let indices = (0..dataset.len()).collect();
        let mut loader = Self {
            dataset,
            batch_size,
            shuffle,
            indices,
            rng,
        };
        loader.on_epoch_end();
        Ok(loader)
    }

    /// Number of whole batches per epoch.
    pub fn len(&self) -> usize {
        self.indices.len() / self.batch_size
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn dataset(&self) -> &SegmentationDataset {
        &self.dataset
    }

    /// Current sample order.
    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    pub fn get_batch(&self, index: usize) -> Result<ArrayBatch> {
        if index >= self.len() {
            return Err(SegmentationError::IndexOutOfRange {
                index,
                len: self.len(),
            });
        }
        let start = index * self.batch_size;
        let items = self.indices[start..start + self.batch_size]
            .iter()
            .map(|&sample| self.dataset.get(sample))
            .collect::<Result<Vec<_>>>()?;

        ArrayBatch::stack(&items)
    }

    pub fn on_epoch_end(&mut self) {
        if self.shuffle {
            self.indices.shuffle(&mut self.rng);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = Result<ArrayBatch>> + '_ {
        (0..self.len()).map(move |index| self.get_batch(index))
    }
}
