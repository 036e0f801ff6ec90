use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::Context;
use burn::{
    backend::{ndarray::NdArrayDevice, Autodiff, NdArray},
    config::Config,
    optim::AdamConfig,
    tensor::backend::{AutodiffBackend, Backend},
};
use clap::{Args, Parser, Subcommand};
use env_logger::Env;
use log::info;
use ndarray::{ArrayView2, Axis};
use rand::{seq::IteratorRandom, thread_rng};

use unet_segmentation::{
    acquire::ensure_dataset,
    augment::{preprocessing, training_augmentation, validation_augmentation},
    config::{DatasetConfig, DATASET_ROOT},
    inference::{evaluate, load_model, predict},
    palette::class_names,
    resize::{resize_tree, ResizeConfig},
    training::{self, TrainingConfig},
    visualize::{denormalize, save_history_plot, save_panels},
    BatchLoader, SegmentationDataset, SegmentationError, UNetConfig,
};

type MyBackend = NdArray<f32>;
type MyAutodiffBackend = Autodiff<MyBackend>;

const HISTORY_PLOT: &str = "history.png";

#[derive(Parser, Debug)]
#[command(name = "unet_segmentation", about = "Animal segmentation with a U-Net")]
struct Cli {
    /// Dataset root holding `Images/` and `Masks/`.
    #[arg(long, global = true, default_value = DATASET_ROOT)]
    root: PathBuf,
    /// JSON dataset layout; overrides --root.
    #[arg(long, global = true)]
    dataset_config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Clone the dataset repository if it is not present.
    Fetch,
    /// Resize every image and mask in place to the configured size.
    Resize {
        /// Confirm that files may be overwritten and deleted.
        #[arg(long)]
        yes: bool,
    },
    Train(TrainArgs),
    Eval(EvalArgs),
    /// Write one dataset sample with all of its class planes.
    Show(ShowArgs),
}

#[derive(Args, Debug)]
struct TrainArgs {
    #[arg(long, default_value = "./artifacts")]
    artifact_dir: String,
    #[arg(long, value_delimiter = ',', default_value = "animal")]
    classes: Vec<String>,
    #[arg(long, default_value_t = 1)]
    epochs: usize,
    #[arg(long, default_value_t = 8)]
    batch_size: usize,
    #[arg(long, default_value_t = 1e-4)]
    lr: f64,
    #[arg(long, default_value_t = 42)]
    seed: u64,
    #[arg(long, default_value_t = 16)]
    base_channels: usize,
}

#[derive(Args, Debug)]
struct EvalArgs {
    #[arg(long, default_value = "./artifacts")]
    artifact_dir: String,
    /// Number of random test predictions to write as images.
    #[arg(long, default_value_t = 5)]
    samples: usize,
}

#[derive(Args, Debug)]
struct ShowArgs {
    #[arg(long, default_value_t = 4)]
    index: usize,
    /// Apply the training augmentation before rendering.
    #[arg(long)]
    augment: bool,
    #[arg(long, default_value = "sample.png")]
    output: PathBuf,
}

impl Cli {
    fn dataset(&self) -> anyhow::Result<DatasetConfig> {
        match &self.dataset_config {
            Some(path) => DatasetConfig::load(path)
                .map_err(|err| anyhow::anyhow!("loading dataset layout {}: {err:?}", path.display())),
            None => Ok(DatasetConfig::rooted_at(&self.root)),
        }
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let dataset = cli.dataset()?;

    match &cli.command {
        Command::Fetch => {
            ensure_dataset(&dataset)?;
        }
        Command::Resize { yes } => resize(&dataset, *yes)?,
        Command::Show(args) => show(&dataset, args)?,
        Command::Train(args) => train::<MyAutodiffBackend>(&dataset, args, NdArrayDevice::Cpu)?,
        Command::Eval(args) => eval::<MyBackend>(&dataset, args, NdArrayDevice::Cpu)?,
    }
    Ok(())
}

fn resize(dataset: &DatasetConfig, confirmed: bool) -> anyhow::Result<()> {
    let images = ResizeConfig::new(dataset.width, dataset.height, dataset.min_size)?.confirmed(confirmed);
    for split in dataset.split_dirs() {
        resize_tree(&split.images_dir, &images).map_err(confirmation_hint)?;
        resize_tree(&split.masks_dir, &images.for_masks()).map_err(confirmation_hint)?;
    }
    Ok(())
}

fn confirmation_hint(err: SegmentationError) -> anyhow::Error {
    match err {
        SegmentationError::Unconfirmed(_) => anyhow::Error::new(err).context("pass --yes to resize in place"),
        err => err.into(),
    }
}

fn train<B: AutodiffBackend>(dataset: &DatasetConfig, args: &TrainArgs, device: B::Device) -> anyhow::Result<()> {
    let config = TrainingConfig::new(
        UNetConfig::new(args.classes.len()).with_base_channels(args.base_channels),
        AdamConfig::new(),
        args.classes.clone(),
    )
    .with_num_epochs(args.epochs)
    .with_batch_size(args.batch_size)
    .with_learning_rate(args.lr)
    .with_seed(args.seed);

    let train_set = SegmentationDataset::from_split(&dataset.train, &config.classes)?
        .with_augmentation(training_augmentation(dataset.min_size as usize))
        .with_preprocessing(preprocessing());
    let valid_set = SegmentationDataset::from_split(&dataset.valid, &config.classes)?
        .with_augmentation(validation_augmentation(dataset.width as usize, dataset.height as usize))
        .with_preprocessing(preprocessing());
    info!("{} training and {} validation samples", train_set.len(), valid_set.len());

    let mut train_loader = BatchLoader::with_seed(train_set, config.batch_size, true, config.seed)?;
    let mut valid_loader = BatchLoader::with_seed(valid_set, 1, false, config.seed)?;

    let history = training::train::<B>(&args.artifact_dir, config, &mut train_loader, &mut valid_loader, device)?;
    if let Some(best) = history.best() {
        info!("best epoch {} with val_loss {:.4}", best.epoch, best.valid.loss);
    }

    let plot = Path::new(&args.artifact_dir).join(HISTORY_PLOT);
    save_history_plot(&plot, &history)?;
    info!("wrote {}", plot.display());
    Ok(())
}

fn eval<B: Backend>(dataset: &DatasetConfig, args: &EvalArgs, device: B::Device) -> anyhow::Result<()> {
    let (config, model) = load_model::<B>(&args.artifact_dir, &device)?;
    let test_set = SegmentationDataset::from_split(&dataset.test, &config.classes)?
        .with_augmentation(validation_augmentation(dataset.width as usize, dataset.height as usize))
        .with_preprocessing(preprocessing());
    let loader = BatchLoader::new(test_set, 1, false)?;

    evaluate(&config, &model, &loader, &device)?;

    let out_dir = Path::new(&args.artifact_dir).join("predictions");
    fs::create_dir_all(&out_dir).with_context(|| format!("creating {}", out_dir.display()))?;

    let test_set = loader.dataset();
    let picks = (0..test_set.len()).choose_multiple(&mut thread_rng(), args.samples);
    for index in picks {
        let item = test_set.get(index)?;
        let predicted = predict(&model, &item, &device)?;

        let labels: Vec<(String, String)> = config
            .classes
            .iter()
            .map(|name| (format!("{name} ground truth"), format!("{name} predicted")))
            .collect();
        let mut planes: Vec<(&str, ArrayView2<f32>)> = Vec::new();
        for (k, (truth, guess)) in labels.iter().enumerate() {
            planes.push((truth.as_str(), item.mask.index_axis(Axis(2), k)));
            planes.push((guess.as_str(), predicted.index_axis(Axis(2), k)));
        }

        let path = out_dir.join(format!("{index:04}.png"));
        save_panels(&path, &denormalize(&item.image), &planes)?;
        info!("wrote {}", path.display());
    }
    Ok(())
}

fn show(dataset: &DatasetConfig, args: &ShowArgs) -> anyhow::Result<()> {
    let classes: Vec<String> = class_names().map(String::from).collect();
    let mut samples = SegmentationDataset::from_split(&dataset.train, &classes)?;
    if args.augment {
        samples = samples.with_augmentation(training_augmentation(dataset.min_size as usize));
    }

    let item = samples.get(args.index)?;
    let image = item.image.mapv(|v| v / 255.0);
    let planes: Vec<(&str, ArrayView2<f32>)> = classes
        .iter()
        .enumerate()
        .map(|(k, name)| (name.as_str(), item.mask.index_axis(Axis(2), k)))
        .collect();

    save_panels(&args.output, &image, &planes)?;
    info!("wrote sample {} to {}", args.index, args.output.display());
    Ok(())
}
