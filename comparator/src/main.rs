use std::path::PathBuf;

use anyhow::Context;
use burn::{backend::{wgpu::{AutoGraphicsApi, WgpuDevice}, Autodiff, NdArray, Wgpu}, optim::AdamConfig};
use clap::{Parser, ValueEnum};
use instance_gen::{annotation_file, ensure_extracted, BoundingBoxImageGenerator, CocoDataset, COCO_ANNOTATIONS, COCO_TRAIN_IMAGES, COCO_VAL_IMAGES};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::{data::{mapping_images, InstanceSource}, model::ComparatorConfig, optim::LookaheadConfig, training::TrainingConfig};

mod checkpoint;
mod data;
mod model;
mod optim;
mod training;

#[derive(ValueEnum, Clone, Copy, Debug)]
enum BackendKind {
    Wgpu,
    #[value(name = "ndarray")]
    NdArray,
}

#[derive(Parser, Debug)]
#[command(name = "comparator", about = "Train the instance comparator on COCO bounding box crops")]
struct Args {
    #[arg(long, default_value = "data")]
    data_dir: PathBuf,
    /// COCO image split used for training.
    #[arg(long, default_value = "train2017")]
    train: String,
    #[arg(long, default_value = "val2017")]
    val: String,
    /// Directory under --data-dir holding instances_<split>.json.
    #[arg(long, default_value = "annotations")]
    annotations: String,
    /// Zip archive fetched when --data-dir/<train> is missing.
    #[arg(long, default_value = COCO_TRAIN_IMAGES)]
    train_remote: String,
    #[arg(long, default_value = COCO_VAL_IMAGES)]
    val_remote: String,
    #[arg(long, default_value = COCO_ANNOTATIONS)]
    annotations_remote: String,
    #[arg(long, default_value = "train_instances")]
    train_instances: String,
    #[arg(long, default_value = "val_instances")]
    val_instances: String,
    /// Use the instance directories as they are.
    #[arg(long)]
    skip_generation: bool,
    #[arg(long, default_value = "jpg")]
    format: String,

    #[arg(long, default_value_t = 10)]
    epochs: usize,
    #[arg(long, default_value_t = 5e-5)]
    lr: f64,
    #[arg(long, default_value_t = 16)]
    batch_size: usize,
    /// Run name; artifacts go to <checkpoint-dir>/<checkpoint>.
    #[arg(long, default_value = "comparator")]
    checkpoint: String,
    #[arg(long, default_value = "checkpoint")]
    checkpoint_dir: PathBuf,

    #[arg(long, default_value_t = 320)]
    image_size: usize,
    #[arg(long, default_value_t = 32)]
    patch_size: usize,
    #[arg(long, default_value_t = 1024)]
    token_size: usize,
    /// Number of attention heads.
    #[arg(long, default_value_t = 8)]
    head_size: usize,
    #[arg(long, default_value_t = 1024)]
    intermediate_size: usize,
    #[arg(long, default_value_t = 0.4)]
    dropout: f64,
    /// Number of self-attention layers.
    #[arg(long, default_value_t = 2)]
    self_attention_size: usize,
    /// Probability of a random flip/brightness change on each query.
    #[arg(long, default_value_t = 0.3)]
    processing_rate: f64,

    #[arg(long, default_value_t = 42)]
    seed: u64,
    /// Epochs without validation improvement before stopping, 0 to disable.
    #[arg(long, default_value_t = 1)]
    patience: usize,
    #[arg(long, value_enum, default_value_t = BackendKind::Wgpu)]
    backend: BackendKind,
}

impl Args {
    fn training_config(&self) -> TrainingConfig {
        let model = ComparatorConfig::new()
            .with_image_size(self.image_size)
            .with_patch_size(self.patch_size)
            .with_token_size(self.token_size)
            .with_head_size(self.head_size)
            .with_intermediate_size(self.intermediate_size)
            .with_dropout(self.dropout)
            .with_self_attention_size(self.self_attention_size);

        TrainingConfig::new(model, AdamConfig::new(), LookaheadConfig::new())
            .with_num_epochs(self.epochs)
            .with_batch_size(self.batch_size)
            .with_processing_rate(self.processing_rate)
            .with_seed(self.seed)
            .with_learning_rate(self.lr)
            .with_patience(self.patience)
    }
}

/// Brings `<data>/<instances>/<split>` up to date with the COCO split,
/// downloading the split and annotations first when they are missing, and
/// returns where its instances and mapping images live.
fn prepare_instances(args: &Args, split: &str, remote: &str, instances: &str) -> anyhow::Result<InstanceSource> {
    let root = args.data_dir.join(instances);

    if !args.skip_generation {
        let images = args.data_dir.join(split);
        let annotations = args.data_dir.join(&args.annotations);
        ensure_extracted(remote, &images)
            .with_context(|| format!("failed to fetch COCO split {} from {remote}", images.display()))?;
        ensure_extracted(&args.annotations_remote, &annotations).with_context(|| {
            format!("failed to fetch COCO annotations {} from {}", annotations.display(), args.annotations_remote)
        })?;

        let annotations = annotation_file(annotations, split);
        let dataset = CocoDataset::open(&images, &annotations)
            .with_context(|| format!("failed to open COCO split {}", images.display()))?;

        let generator = BoundingBoxImageGenerator::new(dataset, &root, &args.format)?;
        let report = generator
            .generate(false)
            .with_context(|| format!("failed to generate instances into {}", generator.path().display()))?;
        info!("{split}: {} instances, {} newly cropped", report.total, report.produced);
    }

    Ok(InstanceSource::new(root.join(split), mapping_images(&root).join(split)))
}

fn artifact_dir(args: &Args) -> anyhow::Result<String> {
    let dir = args.checkpoint_dir.join(&args.checkpoint);
    dir.to_str()
        .map(String::from)
        .with_context(|| format!("checkpoint path {} is not valid UTF-8", dir.display()))
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = args.training_config();
    config.model.check()?;

    let train = prepare_instances(&args, &args.train, &args.train_remote, &args.train_instances)?;
    let valid = prepare_instances(&args, &args.val, &args.val_remote, &args.val_instances)?;
    let artifact_dir = artifact_dir(&args)?;

    match args.backend {
        BackendKind::Wgpu => {
            type MyBackend = Wgpu<AutoGraphicsApi, f32, i32>;
            type MyAutodiffBackend = Autodiff<MyBackend>;

            let device = WgpuDevice::BestAvailable;
            training::train::<MyAutodiffBackend>(&artifact_dir, config, &train, &valid, device)
        }
        BackendKind::NdArray => {
            type MyAutodiffBackend = Autodiff<NdArray>;

            training::train::<MyAutodiffBackend>(&artifact_dir, config, &train, &valid, Default::default())
        }
    }
}
