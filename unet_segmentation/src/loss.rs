use burn::{
    config::Config,
    tensor::{backend::Backend, Tensor},
};

use crate::metric::{confusion, SMOOTH};

const EPSILON: f32 = 1e-7;

/// Dice loss plus a weighted focal loss.
///
/// The focal term is binary for a single class and categorical otherwise;
/// its focusing parameter is fixed at 2.
#[derive(Config, Debug)]
pub struct SegmentationLossConfig {
    #[config(default = 1.0)]
    pub focal_weight: f32,
    #[config(default = 0.25)]
    pub alpha: f32,
}

impl SegmentationLossConfig {
    pub fn init(&self) -> SegmentationLoss {
        SegmentationLoss {
            focal_weight: self.focal_weight,
            alpha: self.alpha,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SegmentationLoss {
    focal_weight: f32,
    alpha: f32,
}

impl SegmentationLoss {
    /// `probabilities` and `target` are both `[batch, classes, height, width]`.
    pub fn forward<B: Backend>(&self, probabilities: Tensor<B, 4>, target: Tensor<B, 4>) -> Tensor<B, 1> {
        let [_, classes, _, _] = probabilities.dims();
        let dice = dice_loss(probabilities.clone(), target.clone());
        let focal = if classes == 1 {
            binary_focal_loss(probabilities, target, self.alpha)
        } else {
            categorical_focal_loss(probabilities, target, self.alpha)
        };
        dice.add(focal.mul_scalar(self.focal_weight))
    }
}

/// One minus the soft Dice coefficient, averaged over classes.
pub fn dice_loss<B: Backend>(probabilities: Tensor<B, 4>, target: Tensor<B, 4>) -> Tensor<B, 1> {
    let (tp, fp, fn_) = confusion(probabilities, target);
    let numerator = tp.mul_scalar(2.0);
    let denominator = numerator.clone().add(fp).add(fn_);
    let score = numerator.add_scalar(SMOOTH).div(denominator.add_scalar(SMOOTH));
    score.mean().neg().add_scalar(1.0)
}

pub fn binary_focal_loss<B: Backend>(probabilities: Tensor<B, 4>, target: Tensor<B, 4>, alpha: f32) -> Tensor<B, 1> {
    let p = probabilities.clamp(EPSILON, 1.0 - EPSILON);
    let q = p.clone().neg().add_scalar(1.0);
    let background = target.clone().neg().add_scalar(1.0);

    let positive = target
        .mul(q.clone().mul(q.clone()))
        .mul(p.clone().log())
        .mul_scalar(alpha);
    let negative = background
        .mul(p.clone().mul(p))
        .mul(q.log())
        .mul_scalar(1.0 - alpha);

    positive.add(negative).neg().mean()
}

pub fn categorical_focal_loss<B: Backend>(
    probabilities: Tensor<B, 4>,
    target: Tensor<B, 4>,
    alpha: f32,
) -> Tensor<B, 1> {
    let p = probabilities.clamp(EPSILON, 1.0 - EPSILON);
    let q = p.clone().neg().add_scalar(1.0);

    target
        .mul(q.clone().mul(q))
        .mul(p.log())
        .mul_scalar(alpha)
        .neg()
        .mean()
}

#[cfg(test)]
mod tests {
    use burn::backend::NdArray;

    use super::*;

    type TestBackend = NdArray;

    fn value(t: Tensor<TestBackend, 1>) -> f32 {
        t.into_data().convert::<f32>().value[0]
    }

    fn tensor(values: [f32; 4]) -> Tensor<TestBackend, 4> {
        Tensor::from_floats([[[[values[0], values[1]], [values[2], values[3]]]]], &Default::default())
    }

    #[test]
    fn perfect_prediction_has_near_zero_dice_loss() {
        let target = tensor([1.0, 0.0, 0.0, 1.0]);
        assert!(value(dice_loss(target.clone(), target)) < 1e-4);
    }

    #[test]
    fn disjoint_prediction_has_dice_loss_near_one() {
        let target = tensor([1.0, 0.0, 0.0, 1.0]);
        let prediction = tensor([0.0, 1.0, 1.0, 0.0]);
        assert!(value(dice_loss(prediction, target)) > 0.99);
    }

    #[test]
    fn confident_errors_cost_more_focal_loss() {
        let target = tensor([1.0, 0.0, 0.0, 1.0]);
        let good = value(binary_focal_loss(tensor([0.9, 0.1, 0.1, 0.9]), target.clone(), 0.25));
        let bad = value(binary_focal_loss(tensor([0.1, 0.9, 0.9, 0.1]), target, 0.25));
        assert!(good >= 0.0);
        assert!(bad > good);
    }

    #[test]
    fn categorical_focal_ignores_background_channels() {
        let device = Default::default();
        // two classes, one pixel; target is class 1
        let target = Tensor::<TestBackend, 4>::from_floats([[[[0.0]], [[1.0]]]], &device);
        let right = Tensor::<TestBackend, 4>::from_floats([[[[0.2]], [[0.8]]]], &device);
        let wrong = Tensor::<TestBackend, 4>::from_floats([[[[0.8]], [[0.2]]]], &device);

        let right = value(categorical_focal_loss(right, target.clone(), 0.25));
        let wrong = value(categorical_focal_loss(wrong, target, 0.25));
        assert!(wrong > right);
    }

    #[test]
    fn total_loss_weights_the_focal_term() {
        let target = tensor([1.0, 0.0, 0.0, 1.0]);
        let prediction = tensor([0.6, 0.4, 0.3, 0.7]);

        let dice = value(dice_loss(prediction.clone(), target.clone()));
        let focal = value(binary_focal_loss(prediction.clone(), target.clone(), 0.25));
        let total = value(
            SegmentationLossConfig::new()
                .with_focal_weight(2.0)
                .init()
                .forward(prediction, target),
        );
        assert!((total - (dice + 2.0 * focal)).abs() < 1e-5);
    }
}
