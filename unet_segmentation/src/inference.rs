use anyhow::{anyhow, Context};
use burn::{
    config::Config,
    record::{CompactRecorder, Recorder},
    tensor::backend::Backend,
};
use log::info;
use ndarray::Array3;

use crate::{
    data::SegmentationItem,
    loader::{ArrayBatch, BatchLoader},
    metric::Scores,
    model::UNet,
    training::{validate, TrainingConfig, BEST_MODEL, CONFIG_FILE},
};

/// Restores the configuration and best checkpoint written by training.
pub fn load_model<B: Backend>(artifact_dir: &str, device: &B::Device) -> anyhow::Result<(TrainingConfig, UNet<B>)> {
    let config = TrainingConfig::load(format!("{artifact_dir}/{CONFIG_FILE}"))
        .map_err(|err| anyhow!("loading {artifact_dir}/{CONFIG_FILE}: {err:?}"))?;
    let record = CompactRecorder::new()
        .load(format!("{artifact_dir}/{BEST_MODEL}").into(), device)
        .map_err(|err| anyhow!("loading {artifact_dir}/{BEST_MODEL}: {err:?}"))?;

    let model = config.model.init_with::<B>(record, device);
    Ok((config, model))
}

/// Scores a restored model on every batch of `loader`, with the loss and
/// threshold it was trained with.
pub fn evaluate<B: Backend>(
    config: &TrainingConfig,
    model: &UNet<B>,
    loader: &BatchLoader,
    device: &B::Device,
) -> anyhow::Result<Scores> {
    let scores = validate(model, loader, &config.loss(), config.threshold, device)
        .context("evaluating the test split")?;

    info!("Loss: {:.5}", scores.loss);
    info!("mean iou_score: {:.5}", scores.iou_score);
    info!("mean f1-score: {:.5}", scores.f_score);
    Ok(scores)
}

/// Predicted mask of one sample in `(height, width, classes)` layout, each
/// value rounded to 0 or 1.
pub fn predict<B: Backend>(model: &UNet<B>, item: &SegmentationItem, device: &B::Device) -> anyhow::Result<Array3<f32>> {
    let batch = ArrayBatch::stack(std::slice::from_ref(item))?.to_tensors::<B>(device);
    let [_, classes, height, width] = batch.masks.dims();

    let values = model
        .forward_probabilities(batch.images)
        .into_data()
        .convert::<f32>()
        .value;
    let chw = Array3::from_shape_vec((classes, height, width), values)?;

    let mut mask = chw.permuted_axes([1, 2, 0]).as_standard_layout().into_owned();
    mask.mapv_inplace(f32::round);
    Ok(mask)
}
