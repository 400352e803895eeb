pub mod coco;
pub mod error;
pub mod generator;
pub mod remote;

pub use coco::{annotation_file, BoundingBox, CocoDataset, DetectionSource};
pub use error::{GeneratorError, Result};
pub use generator::{BoundingBoxImageGenerator, GenerationReport, ResumeCursor, Step};
pub use remote::{ensure_extracted, COCO_ANNOTATIONS, COCO_TRAIN_IMAGES, COCO_VAL_IMAGES};
