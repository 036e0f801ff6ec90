use std::{fs, path::Path};

use anyhow::{anyhow, bail, ensure, Context};
use burn::{
    config::Config,
    module::{AutodiffModule, Module},
    optim::{AdamConfig, GradientsParams, Optimizer},
    record::CompactRecorder,
    tensor::backend::{AutodiffBackend, Backend},
};
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::{
    loader::BatchLoader,
    loss::{SegmentationLoss, SegmentationLossConfig},
    metric::{f_score, iou_score, scalar, ScoreAccumulator, Scores},
    model::{UNet, UNetConfig},
};

pub const CONFIG_FILE: &str = "config.json";
pub const HISTORY_FILE: &str = "history.json";
pub const BEST_MODEL: &str = "best_model";

#[derive(Config)]
pub struct TrainingConfig {
    pub model: UNetConfig,
    pub optimizer: AdamConfig,
    /// Palette classes the model predicts, in channel order.
    pub classes: Vec<String>,
    #[config(default = 1)]
    pub num_epochs: usize,
    #[config(default = 8)]
    pub batch_size: usize,
    #[config(default = 1.0e-4)]
    pub learning_rate: f64,
    #[config(default = 42)]
    pub seed: u64,
    #[config(default = 1.0)]
    pub focal_weight: f32,
    #[config(default = 10)]
    pub lr_patience: usize,
    #[config(default = 0.1)]
    pub lr_factor: f64,
    #[config(default = 0.0)]
    pub min_lr: f64,
    #[config(default = 0.5)]
    pub threshold: f32,
}

impl TrainingConfig {
    pub fn loss(&self) -> SegmentationLoss {
        SegmentationLossConfig::new()
            .with_focal_weight(self.focal_weight)
            .init()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochRecord {
    pub epoch: usize,
    pub learning_rate: f64,
    pub train: Scores,
    pub valid: Scores,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingHistory {
    pub epochs: Vec<EpochRecord>,
    pub best_epoch: Option<usize>,
}

impl TrainingHistory {
    pub fn best(&self) -> Option<&EpochRecord> {
        let best = self.best_epoch?;
        self.epochs.iter().find(|record| record.epoch == best)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json).with_context(|| format!("writing {}", path.display()))
    }

    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// Multiplies the learning rate by `factor` once validation loss has not
/// improved for `patience` epochs.
#[derive(Debug, Clone)]
pub struct PlateauScheduler {
    lr: f64,
    factor: f64,
    patience: usize,
    min_lr: f64,
    min_delta: f64,
    best: f64,
    wait: usize,
}

impl PlateauScheduler {
    pub fn new(lr: f64, factor: f64, patience: usize, min_lr: f64) -> Self {
        Self {
            lr,
            factor,
            patience,
            min_lr,
            min_delta: 1e-4,
            best: f64::INFINITY,
            wait: 0,
        }
    }

    pub fn lr(&self) -> f64 {
        self.lr
    }

    /// Records one epoch's validation loss and returns the rate for the next.
    pub fn step(&mut self, loss: f64) -> f64 {
        if loss < self.best - self.min_delta {
            self.best = loss;
            self.wait = 0;
            return self.lr;
        }

        self.wait += 1;
        if self.wait >= self.patience {
            let reduced = (self.lr * self.factor).max(self.min_lr);
            if reduced < self.lr {
                info!("reducing learning rate to {reduced:e}");
                self.lr = reduced;
            }
            self.wait = 0;
        }
        self.lr
    }
}

pub fn train<B: AutodiffBackend>(
    artifact_dir: &str,
    config: TrainingConfig,
    train_loader: &mut BatchLoader,
    valid_loader: &mut BatchLoader,
    device: B::Device,
) -> anyhow::Result<TrainingHistory> {
    ensure!(
        config.model.num_classes == config.classes.len(),
        "model predicts {} classes but {} are configured",
        config.model.num_classes,
        config.classes.len()
    );
    for loader in [&*train_loader, &*valid_loader] {
        let selected = loader.dataset().selection().names();
        ensure!(
            selected == config.classes.as_slice(),
            "dataset selects {selected:?} but the model is configured for {:?}",
            config.classes
        );
    }
    if train_loader.is_empty() {
        bail!(
            "training loader holds fewer samples than one batch of {}",
            train_loader.batch_size()
        );
    }

    fs::create_dir_all(artifact_dir).with_context(|| format!("creating {artifact_dir}"))?;
    config
        .save(format!("{artifact_dir}/{CONFIG_FILE}"))
        .with_context(|| format!("saving {artifact_dir}/{CONFIG_FILE}"))?;

    B::seed(config.seed);

    let loss_fn = config.loss();
    let mut model: UNet<B> = config.model.init(&device);
    let mut optim = config.optimizer.init();
    let mut scheduler = PlateauScheduler::new(
        config.learning_rate,
        config.lr_factor,
        config.lr_patience,
        config.min_lr,
    );
    let mut history = TrainingHistory::default();
    let mut best_loss = f64::INFINITY;

    for epoch in 1..=config.num_epochs {
        let lr = scheduler.lr();
        let mut train_scores = ScoreAccumulator::default();

        for index in 0..train_loader.len() {
            let batch = train_loader.get_batch(index)?.to_tensors::<B>(&device);

            let probabilities = model.forward_probabilities(batch.images);
            let loss = loss_fn.forward(probabilities.clone(), batch.masks.clone());
            let loss_value = scalar(loss.clone().detach());

            let grads = GradientsParams::from_grads(loss.backward(), &model);
            model = optim.step(lr, model, grads);

            let probabilities = probabilities.detach();
            train_scores.update(
                loss_value,
                iou_score(probabilities.clone(), batch.masks.clone(), config.threshold),
                f_score(probabilities, batch.masks, config.threshold),
            );
            debug!(
                "epoch {epoch} batch {}/{}: loss {loss_value:.4}",
                index + 1,
                train_loader.len()
            );
        }

        let valid = validate(&model.valid(), valid_loader, &loss_fn, config.threshold, &device)?;
        let train = train_scores.scores();
        info!(
            "epoch {epoch}/{}: loss {:.4} iou {:.4} f1 {:.4} | val_loss {:.4} val_iou {:.4} val_f1 {:.4}",
            config.num_epochs,
            train.loss,
            train.iou_score,
            train.f_score,
            valid.loss,
            valid.iou_score,
            valid.f_score
        );

        if valid.loss < best_loss {
            best_loss = valid.loss;
            history.best_epoch = Some(epoch);
            model
                .clone()
                .save_file(format!("{artifact_dir}/{BEST_MODEL}"), &CompactRecorder::new())
                .map_err(|err| anyhow!("saving {artifact_dir}/{BEST_MODEL}: {err:?}"))?;
            info!("val_loss improved to {best_loss:.4}, saved {artifact_dir}/{BEST_MODEL}");
        }

        history.epochs.push(EpochRecord {
            epoch,
            learning_rate: lr,
            train,
            valid,
        });
        scheduler.step(valid.loss);

        train_loader.on_epoch_end();
        valid_loader.on_epoch_end();
    }

    history.save(format!("{artifact_dir}/{HISTORY_FILE}"))?;
    Ok(history)
}

/// Mean loss, IoU and F-score of `model` over every batch of `loader`.
pub fn validate<B: Backend>(
    model: &UNet<B>,
    loader: &BatchLoader,
    loss_fn: &SegmentationLoss,
    threshold: f32,
    device: &B::Device,
) -> anyhow::Result<Scores> {
    let mut scores = ScoreAccumulator::default();
    for batch in loader.iter() {
        let batch = batch?.to_tensors::<B>(device);
        let probabilities = model.forward_probabilities(batch.images);
        let loss = scalar(loss_fn.forward(probabilities.clone(), batch.masks.clone()));
        scores.update(
            loss,
            iou_score(probabilities.clone(), batch.masks.clone(), threshold),
            f_score(probabilities, batch.masks, threshold),
        );
    }
    if scores.batches() == 0 {
        bail!("validation loader holds fewer samples than one batch");
    }
    Ok(scores.scores())
}
