use burn::tensor::{backend::Backend, Tensor};
use serde::{Deserialize, Serialize};

pub(crate) const SMOOTH: f32 = 1e-5;

/// True positives, false positives and false negatives per class, each
/// shaped `[classes, 1]`. Batch and spatial axes are pooled.
pub(crate) fn confusion<B: Backend>(
    prediction: Tensor<B, 4>,
    target: Tensor<B, 4>,
) -> (Tensor<B, 2>, Tensor<B, 2>, Tensor<B, 2>) {
    let [batch, classes, height, width] = prediction.dims();
    let flat = |t: Tensor<B, 4>| t.swap_dims(0, 1).reshape([classes, batch * height * width]);
    let (prediction, target) = (flat(prediction), flat(target));

    let tp = prediction.clone().mul(target.clone()).sum_dim(1);
    let fp = prediction.sum_dim(1).sub(tp.clone());
    let fn_ = target.sum_dim(1).sub(tp.clone());
    (tp, fp, fn_)
}

fn binarize<B: Backend>(probabilities: Tensor<B, 4>, threshold: f32) -> Tensor<B, 4> {
    probabilities.greater_elem(threshold).float()
}

pub(crate) fn scalar<B: Backend>(t: Tensor<B, 1>) -> f32 {
    t.into_data().convert::<f32>().value[0]
}

/// Intersection over union of probabilities binarized at `threshold`,
/// averaged over classes.
pub fn iou_score<B: Backend>(probabilities: Tensor<B, 4>, target: Tensor<B, 4>, threshold: f32) -> f32 {
    let (tp, fp, fn_) = confusion(binarize(probabilities, threshold), target);
    let union = tp.clone().add(fp).add(fn_);
    scalar(tp.add_scalar(SMOOTH).div(union.add_scalar(SMOOTH)).mean())
}

/// F1 score of probabilities binarized at `threshold`, averaged over
/// classes.
pub fn f_score<B: Backend>(probabilities: Tensor<B, 4>, target: Tensor<B, 4>, threshold: f32) -> f32 {
    let (tp, fp, fn_) = confusion(binarize(probabilities, threshold), target);
    let numerator = tp.mul_scalar(2.0);
    let denominator = numerator.clone().add(fp).add(fn_);
    scalar(numerator.add_scalar(SMOOTH).div(denominator.add_scalar(SMOOTH)).mean())
}

/// Running means of loss, IoU and F-score over the batches of one pass.
#[derive(Debug, Default, Clone)]
pub struct ScoreAccumulator {
    loss: f64,
    iou: f64,
    f_score: f64,
    batches: usize,
}

impl ScoreAccumulator {
    pub fn update(&mut self, loss: f32, iou: f32, f_score: f32) {
        self.loss += loss as f64;
        self.iou += iou as f64;
        self.f_score += f_score as f64;
        self.batches += 1;
    }

    pub fn batches(&self) -> usize {
        self.batches
    }

    pub fn scores(&self) -> Scores {
        let n = self.batches.max(1) as f64;
        Scores {
            loss: self.loss / n,
            iou_score: self.iou / n,
            f_score: self.f_score / n,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Scores {
    pub loss: f64,
    pub iou_score: f64,
    pub f_score: f64,
}

#[cfg(test)]
mod tests {
    use burn::backend::NdArray;

    use super::*;

    type TestBackend = NdArray;

    fn tensor(values: [[f32; 4]; 2]) -> Tensor<TestBackend, 4> {
        // [batch 1, classes 2, height 2, width 2]
        Tensor::from_floats(
            [[
                [[values[0][0], values[0][1]], [values[0][2], values[0][3]]],
                [[values[1][0], values[1][1]], [values[1][2], values[1][3]]],
            ]],
            &Default::default(),
        )
    }

    #[test]
    fn perfect_prediction_scores_one() {
        let target = tensor([[1.0, 0.0, 1.0, 0.0], [0.0, 1.0, 0.0, 1.0]]);
        let probabilities = tensor([[0.9, 0.1, 0.8, 0.2], [0.1, 0.9, 0.2, 0.8]]);

        assert!((iou_score(probabilities.clone(), target.clone(), 0.5) - 1.0).abs() < 1e-4);
        assert!((f_score(probabilities, target, 0.5) - 1.0).abs() < 1e-4);
    }

    #[test]
    fn half_overlap() {
        // class 0: tp 1, fp 1, fn 0; class 1: tp 1, fp 0, fn 1
        let target = tensor([[1.0, 0.0, 0.0, 0.0], [1.0, 1.0, 0.0, 0.0]]);
        let probabilities = tensor([[0.9, 0.7, 0.0, 0.0], [0.9, 0.4, 0.0, 0.0]]);

        assert!((iou_score(probabilities.clone(), target.clone(), 0.5) - 0.5).abs() < 1e-4);
        assert!((f_score(probabilities, target, 0.5) - 2.0 / 3.0).abs() < 1e-4);
    }

    #[test]
    fn accumulator_averages_batches() {
        let mut acc = ScoreAccumulator::default();
        assert_eq!(acc.scores(), Scores::default());
        acc.update(1.0, 0.5, 0.2);
        acc.update(3.0, 0.7, 0.4);

        let scores = acc.scores();
        assert_eq!(acc.batches(), 2);
        assert!((scores.loss - 2.0).abs() < 1e-9);
        assert!((scores.iou_score - 0.6).abs() < 1e-6);
        assert!((scores.f_score - 0.3).abs() < 1e-6);
    }
}
