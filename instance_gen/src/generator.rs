use std::{fs, path::{Path, PathBuf}};

use derive_new::new;
use image::{DynamicImage, ImageFormat};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{debug, info};

use crate::{coco::{BoundingBox, DetectionSource}, error::{GeneratorError, Result}};

/// Position of the generator in the (image, box) enumeration.
///
/// Indices below `threshold` were produced by an earlier run and are skipped
/// without touching the filesystem; once the cursor passes the threshold it
/// stays in the producing phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, new)]
pub struct ResumeCursor {
    threshold: usize,
    #[new(default)]
    position: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Skip(usize),
    Produce(usize),
}

impl ResumeCursor {
    pub fn advance(&mut self) -> Step {
        let index = self.position;
        self.position += 1;
        if index < self.threshold {
            Step::Skip(index)
        } else {
            Step::Produce(index)
        }
    }

    pub fn position(&self) -> usize {
        self.position
    }

    /// Whether the next `advance` produces.
    pub fn is_producing(&self) -> bool {
        self.position >= self.threshold
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GenerationReport {
    pub total: usize,
    pub skipped: usize,
    pub produced: usize,
}

/// Writes every annotated box of a detection dataset as
/// `<path>/<dataset name>/<index>/0.<format>`.
pub struct BoundingBoxImageGenerator<D: DetectionSource> {
    dataset: D,
    path: PathBuf,
    format: String,
    image_format: ImageFormat,
}

impl<D: DetectionSource> BoundingBoxImageGenerator<D> {
    pub fn new(dataset: D, path: impl AsRef<Path>, format: &str) -> Result<Self> {
        let image_format = ImageFormat::from_extension(format)
            .ok_or_else(|| GeneratorError::UnsupportedFormat(format.to_string()))?;
        let path = path.as_ref().join(dataset.name());

        Ok(Self {
            dataset,
            path,
            format: format.to_string(),
            image_format,
        })
    }

    /// Directory holding the numbered instance directories.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn dataset(&self) -> &D {
        &self.dataset
    }

    pub fn instance_file(&self, index: usize) -> PathBuf {
        self.path.join(index.to_string()).join(format!("0.{}", self.format))
    }

    /// Whether `<index>/` already holds an image, whatever its format.
    pub fn has_instance(&self, index: usize) -> bool {
        fs::read_dir(self.path.join(index.to_string()))
            .map(|mut entries| entries.any(|entry| entry.map_or(false, |entry| entry.path().is_file())))
            .unwrap_or(false)
    }

    /// Number of instances `0..n` already on disk.
    pub fn produced_prefix(&self) -> usize {
        (0..).take_while(|&index| self.has_instance(index)).count()
    }

    pub fn generate(&self, force: bool) -> Result<GenerationReport> {
        if force && self.path.exists() {
            info!("Removing previous instances at {}", self.path.display());
            fs::remove_dir_all(&self.path).map_err(GeneratorError::io(&self.path))?;
        }
        fs::create_dir_all(&self.path).map_err(GeneratorError::io(&self.path))?;

        let existed_data_size = self.produced_prefix();
        let mut cursor = ResumeCursor::new(existed_data_size);
        let mut report = GenerationReport::default();

        info!(
            "Generate bounding box images from {} to {} ({} already present)",
            self.dataset.name(),
            self.path.display(),
            existed_data_size
        );

        let progress = ProgressBar::new(self.dataset.len() as u64);
        progress.set_style(
            ProgressStyle::default_bar()
                .template("{bar:40.cyan/blue} {pos}/{len} [{elapsed}<{eta}] {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );

        for index in 0..self.dataset.len() {
            let mut pending: Vec<(usize, &BoundingBox)> = Vec::new();
            for bbox in self.dataset.boxes(index) {
                report.total += 1;
                match cursor.advance() {
                    Step::Skip(_) => report.skipped += 1,
                    Step::Produce(instance) if self.has_instance(instance) => {
                        report.skipped += 1
                    }
                    Step::Produce(instance) => pending.push((instance, bbox)),
                }
            }

            if !pending.is_empty() {
                let image = self.dataset.image(index)?;
                for (instance, bbox) in pending {
                    self.write_instance(&image, bbox, instance)?;
                    report.produced += 1;
                }
            }
            progress.inc(1);
        }
        progress.finish_with_message(format!("{} produced", report.produced));

        info!(
            "Generated {} instances into {} ({} skipped)",
            report.produced,
            self.path.display(),
            report.skipped
        );
        Ok(report)
    }

    fn write_instance(&self, image: &DynamicImage, bbox: &BoundingBox, index: usize) -> Result<()> {
        let file = self.instance_file(index);
        if let Some(dir) = file.parent() {
            fs::create_dir_all(dir).map_err(GeneratorError::io(dir))?;
        }

        let instance_image = bbox.crop(image);
        // jpeg has no alpha channel
        let instance_image = match self.image_format {
            ImageFormat::Jpeg => DynamicImage::ImageRgb8(instance_image.to_rgb8()),
            _ => instance_image,
        };
        instance_image
            .save_with_format(&file, self.image_format)
            .map_err(GeneratorError::image(&file))?;

        debug!("wrote {}", file.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use image::{GenericImageView, Rgb, RgbImage};

    use super::*;

    struct MemorySource {
        items: Vec<(RgbImage, Vec<BoundingBox>)>,
        decoded: RefCell<Vec<usize>>,
    }

    impl MemorySource {
        /// Three images with two, zero and one boxes.
        fn scenario() -> Self {
            let items = vec![
                (
                    RgbImage::from_pixel(16, 16, Rgb([200, 0, 0])),
                    vec![
                        BoundingBox::new(0.0, 0.0, 4.0, 4.0),
                        BoundingBox::new(4.0, 4.0, 12.0, 10.0),
                    ],
                ),
                (RgbImage::from_pixel(16, 16, Rgb([0, 200, 0])), vec![]),
                (
                    RgbImage::from_pixel(8, 8, Rgb([0, 0, 200])),
                    vec![BoundingBox::new(1.0, 1.0, 7.0, 3.0)],
                ),
            ];
            Self {
                items,
                decoded: RefCell::new(Vec::new()),
            }
        }

        fn take_decoded(&self) -> Vec<usize> {
            self.decoded.borrow_mut().drain(..).collect()
        }
    }

    impl DetectionSource for MemorySource {
        fn name(&self) -> &str {
            "memory"
        }

        fn len(&self) -> usize {
            self.items.len()
        }

        fn boxes(&self, index: usize) -> &[BoundingBox] {
            &self.items[index].1
        }

        fn image(&self, index: usize) -> Result<DynamicImage> {
            self.decoded.borrow_mut().push(index);
            Ok(DynamicImage::ImageRgb8(self.items[index].0.clone()))
        }
    }

    fn instance_dirs(root: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(root)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn cursor_skips_until_threshold() {
        let mut cursor = ResumeCursor::new(2);

        assert!(!cursor.is_producing());
        assert_eq!(cursor.advance(), Step::Skip(0));
        assert!(!cursor.is_producing());
        assert_eq!(cursor.advance(), Step::Skip(1));
        assert!(cursor.is_producing());
        assert_eq!(cursor.advance(), Step::Produce(2));
        assert!(cursor.is_producing());
        assert_eq!(cursor.advance(), Step::Produce(3));
        assert_eq!(cursor.position(), 4);
    }

    #[test]
    fn fresh_cursor_without_threshold_produces() {
        let mut cursor = ResumeCursor::new(0);

        assert!(cursor.is_producing());
        assert_eq!(cursor.advance(), Step::Produce(0));
    }

    #[test]
    fn one_directory_per_box() {
        let dir = tempfile::tempdir().unwrap();
        let generator = BoundingBoxImageGenerator::new(MemorySource::scenario(), dir.path(), "jpg").unwrap();

        let report = generator.generate(true).unwrap();

        assert_eq!(report, GenerationReport { total: 3, skipped: 0, produced: 3 });
        assert_eq!(generator.path(), dir.path().join("memory"));
        assert_eq!(instance_dirs(generator.path()), vec!["0", "1", "2"]);
        for index in 0..3 {
            assert_eq!(instance_dirs(&generator.path().join(index.to_string())), vec!["0.jpg"]);
        }

        let second = image::open(generator.instance_file(1)).unwrap();
        assert_eq!(second.dimensions(), (8, 6));
        let third = image::open(generator.instance_file(2)).unwrap();
        assert_eq!(third.dimensions(), (6, 2));
        // the image without boxes is never decoded
        assert_eq!(generator.dataset().take_decoded(), vec![0, 2]);
    }

    #[test]
    fn rerun_without_force_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let generator = BoundingBoxImageGenerator::new(MemorySource::scenario(), dir.path(), "png").unwrap();
        generator.generate(false).unwrap();
        generator.dataset().take_decoded();

        let report = generator.generate(false).unwrap();

        assert_eq!(report, GenerationReport { total: 3, skipped: 3, produced: 0 });
        assert_eq!(instance_dirs(generator.path()), vec!["0", "1", "2"]);
        assert!(generator.dataset().take_decoded().is_empty());
    }

    #[test]
    fn resume_reproduces_only_missing_tail() {
        let dir = tempfile::tempdir().unwrap();
        let generator = BoundingBoxImageGenerator::new(MemorySource::scenario(), dir.path(), "jpg").unwrap();
        generator.generate(true).unwrap();
        generator.dataset().take_decoded();
        let untouched = fs::metadata(generator.instance_file(0)).unwrap().modified().unwrap();

        fs::remove_dir_all(generator.path().join("2")).unwrap();
        let report = generator.generate(false).unwrap();

        assert_eq!(report, GenerationReport { total: 3, skipped: 2, produced: 1 });
        assert!(generator.instance_file(2).is_file());
        assert_eq!(generator.dataset().take_decoded(), vec![2]);
        assert_eq!(
            fs::metadata(generator.instance_file(0)).unwrap().modified().unwrap(),
            untouched
        );
    }

    #[test]
    fn resume_fills_a_hole_without_rewriting_later_instances() {
        let dir = tempfile::tempdir().unwrap();
        let generator = BoundingBoxImageGenerator::new(MemorySource::scenario(), dir.path(), "png").unwrap();
        generator.generate(false).unwrap();
        generator.dataset().take_decoded();

        fs::remove_dir_all(generator.path().join("1")).unwrap();
        assert_eq!(generator.produced_prefix(), 1);
        let report = generator.generate(false).unwrap();

        assert_eq!(report, GenerationReport { total: 3, skipped: 2, produced: 1 });
        assert_eq!(generator.dataset().take_decoded(), vec![0]);
        assert_eq!(instance_dirs(generator.path()), vec!["0", "1", "2"]);
    }

    #[test]
    fn rerun_in_another_format_keeps_existing_instances() {
        let dir = tempfile::tempdir().unwrap();
        BoundingBoxImageGenerator::new(MemorySource::scenario(), dir.path(), "jpg")
            .unwrap()
            .generate(false)
            .unwrap();

        let generator = BoundingBoxImageGenerator::new(MemorySource::scenario(), dir.path(), "png").unwrap();
        assert_eq!(generator.produced_prefix(), 3);
        let report = generator.generate(false).unwrap();

        assert_eq!(report, GenerationReport { total: 3, skipped: 3, produced: 0 });
        for index in 0..3 {
            assert_eq!(instance_dirs(&generator.path().join(index.to_string())), vec!["0.jpg"]);
        }
        assert!(generator.dataset().take_decoded().is_empty());
    }

    #[test]
    fn force_discards_previous_output() {
        let dir = tempfile::tempdir().unwrap();
        let generator = BoundingBoxImageGenerator::new(MemorySource::scenario(), dir.path(), "jpg").unwrap();
        generator.generate(false).unwrap();
        fs::create_dir_all(generator.path().join("17")).unwrap();

        let report = generator.generate(true).unwrap();

        assert_eq!(report.produced, 3);
        assert_eq!(instance_dirs(generator.path()), vec!["0", "1", "2"]);
    }

    #[test]
    fn unknown_format_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let result = BoundingBoxImageGenerator::new(MemorySource::scenario(), dir.path(), "xyz");

        assert!(matches!(result, Err(GeneratorError::UnsupportedFormat(format)) if format == "xyz"));
    }
}
