use rand::{seq::SliceRandom, thread_rng, Rng};

use crate::{data::SegmentationItem, error::Result};

/// A joint transform over an image and its decoded mask.
///
/// Geometric transforms must move both arrays together so that the mask
/// keeps the spatial size of the image.
pub trait Transform: Send + Sync {
    fn apply(&self, item: SegmentationItem) -> Result<SegmentationItem>;
}

impl<F> Transform for F
where
    F: Fn(SegmentationItem) -> Result<SegmentationItem> + Send + Sync,
{
    fn apply(&self, item: SegmentationItem) -> Result<SegmentationItem> {
        self(item)
    }
}

/// Applies its transforms in order.
#[derive(Default)]
pub struct Compose {
    transforms: Vec<Box<dyn Transform>>,
}

impl Compose {
    pub fn new(transforms: Vec<Box<dyn Transform>>) -> Self {
        Self { transforms }
    }

    pub fn then(mut self, transform: impl Transform + 'static) -> Self {
        self.transforms.push(Box::new(transform));
        self
    }
}

impl Transform for Compose {
    fn apply(&self, mut item: SegmentationItem) -> Result<SegmentationItem> {
        for transform in &self.transforms {
            item = transform.apply(item)?;
        }
        Ok(item)
    }
}

/// With probability `p`, applies one of its transforms picked uniformly.
pub struct OneOf {
    transforms: Vec<Box<dyn Transform>>,
    p: f64,
}

impl OneOf {
    pub fn new(transforms: Vec<Box<dyn Transform>>, p: f64) -> Self {
        Self { transforms, p }
    }
}

impl Transform for OneOf {
    fn apply(&self, item: SegmentationItem) -> Result<SegmentationItem> {
        let mut rng = thread_rng();
        if rng.gen::<f64>() >= self.p {
            return Ok(item);
        }
        match self.transforms.choose(&mut rng) {
            Some(transform) => transform.apply(item),
            None => Ok(item),
        }
    }
}

#[cfg(test)]
mod tests {
    use ndarray::Array3;

    use super::*;

    fn item() -> SegmentationItem {
        SegmentationItem::new(Array3::zeros((2, 2, 3)), Array3::zeros((2, 2, 1)))
    }

    fn add_one(mut item: SegmentationItem) -> Result<SegmentationItem> {
        item.image.mapv_inplace(|v| v + 1.0);
        Ok(item)
    }

    fn double(mut item: SegmentationItem) -> Result<SegmentationItem> {
        item.image.mapv_inplace(|v| v * 2.0);
        Ok(item)
    }

    #[test]
    fn compose_applies_in_order() {
        let pipeline = Compose::default().then(add_one).then(double);
        let out = pipeline.apply(item()).unwrap();
        assert!(out.image.iter().all(|v| *v == 2.0));

        let reversed = Compose::default().then(double).then(add_one);
        let out = reversed.apply(item()).unwrap();
        assert!(out.image.iter().all(|v| *v == 1.0));
    }

    #[test]
    fn one_of_with_zero_probability_is_identity() {
        let one_of = OneOf::new(vec![Box::new(add_one), Box::new(double)], 0.0);
        let out = one_of.apply(item()).unwrap();
        assert_eq!(out.image, item().image);
    }

    #[test]
    fn one_of_with_certain_probability_applies_exactly_one() {
        let one_of = OneOf::new(vec![Box::new(add_one), Box::new(add_one)], 1.0);
        let out = one_of.apply(item()).unwrap();
        assert!(out.image.iter().all(|v| *v == 1.0));
    }
}
