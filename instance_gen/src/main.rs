use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use instance_gen::{BoundingBoxImageGenerator, CocoDataset};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "instance_gen",
    about = "Crop every COCO bounding box into its own numbered instance directory"
)]
struct Args {
    /// Directory with the source images, e.g. data/train2017.
    #[arg(long)]
    images: PathBuf,
    /// COCO instances annotation file for the same split.
    #[arg(long)]
    annotations: PathBuf,
    /// Output root; instances land in <output>/<images dir name>/<index>/.
    #[arg(long)]
    output: PathBuf,
    /// Image format (file extension) of the crops.
    #[arg(long, default_value = "jpg")]
    format: String,
    /// Delete previously generated instances instead of resuming.
    #[arg(long)]
    force: bool,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let dataset = CocoDataset::open(&args.images, &args.annotations).with_context(|| {
        format!(
            "failed to open COCO dataset {} with {}",
            args.images.display(),
            args.annotations.display()
        )
    })?;
    let generator = BoundingBoxImageGenerator::new(dataset, &args.output, &args.format)?;
    let report = generator
        .generate(args.force)
        .with_context(|| format!("failed to generate instances into {}", generator.path().display()))?;

    println!(
        "{} boxes: {} produced, {} already present",
        report.total, report.produced, report.skipped
    );
    Ok(())
}
