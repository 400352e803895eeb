use std::{fs::File, io::BufReader, path::{Path, PathBuf}};

use derive_new::new;
use image::{io::Reader as ImageReader, DynamicImage, GenericImageView};
use serde::Deserialize;

use crate::error::{GeneratorError, Result};

/// Box corners in pixels, `[x1, y1, x2, y2]`.
#[derive(Debug, Clone, Copy, PartialEq, new)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl From<[f32; 4]> for BoundingBox {
    fn from(value: [f32; 4]) -> Self {
        BoundingBox {
            x1: value[0],
            y1: value[1],
            x2: value[2],
            y2: value[3],
        }
    }
}

impl BoundingBox {
    /// Crops `image` to this box. Corners are rounded to whole pixels and
    /// clamped to the image; the result is never smaller than 1x1.
    pub fn crop(&self, image: &DynamicImage) -> DynamicImage {
        let (width, height) = image.dimensions();
        let clamp = |value: f32, limit: u32| (value.round().max(0.0) as u32).min(limit);

        let x1 = clamp(self.x1, width.saturating_sub(1));
        let y1 = clamp(self.y1, height.saturating_sub(1));
        let x2 = clamp(self.x2, width).max(x1 + 1);
        let y2 = clamp(self.y2, height).max(y1 + 1);

        image.crop_imm(x1, y1, x2 - x1, y2 - y1)
    }
}

/// An object-detection dataset enumerated in a fixed order.
///
/// `boxes` must be cheap: the generator asks for them on every run and only
/// decodes an image when one of its boxes still has to be written.
pub trait DetectionSource {
    fn name(&self) -> &str;
    fn len(&self) -> usize;
    fn boxes(&self, index: usize) -> &[BoundingBox];
    fn image(&self, index: usize) -> Result<DynamicImage>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Deserialize, Debug)]
struct CocoFile {
    images: Vec<CocoImage>,
    #[serde(default)]
    annotations: Vec<CocoAnnotation>,
}

#[derive(Deserialize, Debug)]
struct CocoImage {
    id: u64,
    file_name: String,
}

#[derive(Deserialize, Debug)]
struct CocoAnnotation {
    id: u64,
    image_id: u64,
    bbox: [f32; 4],
}

#[derive(Debug)]
struct CocoItem {
    file_name: String,
    boxes: Vec<BoundingBox>,
}

/// COCO `instances_*.json` annotations over a directory of images.
///
/// Images are ordered by id and their boxes by annotation id, so the
/// enumeration is identical on every run over the same files.
#[derive(Debug)]
pub struct CocoDataset {
    name: String,
    images_dir: PathBuf,
    items: Vec<CocoItem>,
}

impl CocoDataset {
    pub fn open(images_dir: impl AsRef<Path>, annotation_file: impl AsRef<Path>) -> Result<Self> {
        let images_dir = images_dir.as_ref().to_path_buf();
        let annotation_file = annotation_file.as_ref();

        let file = File::open(annotation_file).map_err(GeneratorError::io(annotation_file))?;
        let coco: CocoFile = serde_json::from_reader(BufReader::new(file)).map_err(|source| {
            GeneratorError::Annotations {
                path: annotation_file.to_path_buf(),
                source,
            }
        })?;

        let mut images = coco.images;
        images.sort_by_key(|image| image.id);

        let mut annotations = coco.annotations;
        annotations.sort_by_key(|annotation| (annotation.image_id, annotation.id));

        let mut items = Vec::with_capacity(images.len());
        let mut cursor = annotations.iter().peekable();
        for image in images {
            // skip annotations pointing at images missing from the file
            while cursor.next_if(|annotation| annotation.image_id < image.id).is_some() {}

            let mut boxes = Vec::new();
            while let Some(annotation) = cursor.next_if(|annotation| annotation.image_id == image.id) {
                let [x, y, w, h] = annotation.bbox;
                boxes.push(BoundingBox::new(x, y, x + w, y + h));
            }
            items.push(CocoItem { file_name: image.file_name, boxes });
        }

        let name = images_dir
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| String::from("dataset"));

        Ok(Self { name, images_dir, items })
    }

    pub fn images_dir(&self) -> &Path {
        &self.images_dir
    }

    pub fn num_boxes(&self) -> usize {
        self.items.iter().map(|item| item.boxes.len()).sum()
    }
}

impl DetectionSource for CocoDataset {
    fn name(&self) -> &str {
        &self.name
    }

    fn len(&self) -> usize {
        self.items.len()
    }

    fn boxes(&self, index: usize) -> &[BoundingBox] {
        self.items
            .get(index)
            .map(|item| item.boxes.as_slice())
            .unwrap_or(&[])
    }

    fn image(&self, index: usize) -> Result<DynamicImage> {
        let item = self.items.get(index).ok_or(GeneratorError::OutOfRange {
            index,
            len: self.items.len(),
        })?;
        let path = self.images_dir.join(&item.file_name);
        ImageReader::open(&path)
            .map_err(GeneratorError::io(&path))?
            .decode()
            .map_err(GeneratorError::image(&path))
    }
}

/// Location of the COCO annotation file for a split, e.g.
/// `annotations/instances_val2017.json`.
pub fn annotation_file(annotations_dir: impl AsRef<Path>, split: &str) -> PathBuf {
    annotations_dir.as_ref().join(format!("instances_{split}.json"))
}
