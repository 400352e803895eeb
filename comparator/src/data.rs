use std::{fs::read_dir, io, path::{Path, PathBuf}};

use burn::{data::{dataloader::batcher::Batcher, dataset::Dataset}, tensor::{backend::Backend, Data, Shape, Tensor}};
use derive_new::new;
use image::{imageops::FilterType::Nearest, io::Reader as ImageReader, DynamicImage, GenericImageView};
use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};
use rayon::iter::{IndexedParallelIterator, IntoParallelRefIterator, ParallelIterator};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DataError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to decode image {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("instance {0} is out of range")]
    MissingItem(usize),
}

impl DataError {
    fn io(path: &Path) -> impl FnOnce(io::Error) -> Self {
        let path = path.to_path_buf();
        move |source| Self::Io { path, source }
    }
}

/// Where a split's instances live: the generator output and the parallel
/// directory of mapping images used as queries.
#[derive(Debug, Clone, new)]
pub struct InstanceSource {
    pub instances: PathBuf,
    pub mapping: PathBuf,
}

/// `data/train_instances` -> `data/train_instances_mapping`
pub fn mapping_images(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!("{name}_mapping"))
}

/// Random processing applied to queries, and the square size every image is
/// resized to.
#[derive(Debug, Clone, Copy, new)]
pub struct Processing {
    pub image_size: usize,
    pub rate: f64,
}

#[derive(Debug, Clone)]
pub struct InstanceRef {
    pub index: usize,
    pub key_path: PathBuf,
    pub query_path: Option<PathBuf>,
}

/// Decoded key/query pair, CHW floats in `[0, 1]`.
#[derive(Debug, Clone)]
pub struct InstanceItem {
    pub key: Vec<f32>,
    pub query: Vec<f32>,
    pub image_size: usize,
}

impl InstanceRef {
    pub fn load<R: Rng>(&self, processing: &Processing, rng: &mut R) -> Result<InstanceItem, DataError> {
        let key = load_image(&self.key_path, processing.image_size)?;
        let query = match &self.query_path {
            Some(path) => load_image(path, processing.image_size)?,
            None => key.clone(),
        };

        let query = if rng.gen_bool(processing.rate.clamp(0.0, 1.0)) {
            process(query, rng)
        } else {
            query
        };

        Ok(InstanceItem {
            key: to_chw(&key),
            query: to_chw(&query),
            image_size: processing.image_size,
        })
    }
}

fn load_image(path: &Path, image_size: usize) -> Result<DynamicImage, DataError> {
    let image = ImageReader::open(path)
        .map_err(DataError::io(path))?
        .decode()
        .map_err(|source| DataError::Image { path: path.to_path_buf(), source })?;

    let size = image_size as u32;
    if image.dimensions() != (size, size) {
        Ok(image.resize_exact(size, size, Nearest))
    } else {
        Ok(image)
    }
}

fn process<R: Rng>(image: DynamicImage, rng: &mut R) -> DynamicImage {
    let image = if rng.gen_bool(0.5) { image.fliph() } else { image };
    image.brighten(rng.gen_range(-32..=32))
}

fn to_chw(image: &DynamicImage) -> Vec<f32> {
    let rgb = image.to_rgb8();
    let (width, height) = rgb.dimensions();
    let plane = (width * height) as usize;

    let mut chw = vec![0f32; 3 * plane];
    for (x, y, pixel) in rgb.enumerate_pixels() {
        let offset = (y * width + x) as usize;
        for channel in 0..3 {
            chw[channel * plane + offset] = pixel.0[channel] as f32 / 255.0;
        }
    }
    chw
}

/// Generated instances of one split, ordered by index.
#[derive(Debug)]
pub struct InstanceDataset {
    instances: Vec<InstanceRef>,
}

impl Dataset<InstanceRef> for InstanceDataset {
    fn get(&self, index: usize) -> Option<InstanceRef> {
        self.instances.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.instances.len()
    }
}

impl InstanceDataset {
    pub fn open(source: &InstanceSource) -> Result<Self, DataError> {
        let root = &source.instances;
        let mut instances = Vec::new();

        for entry in read_dir(root).map_err(DataError::io(root))? {
            let entry = entry.map_err(DataError::io(root))?;
            let index = match entry.file_name().to_str().and_then(|name| name.parse::<usize>().ok()) {
                Some(index) => index,
                None => continue,
            };
            // a directory without its image is an interrupted write
            let key_path = match first_file(&entry.path())? {
                Some(path) => path,
                None => continue,
            };
            let query_path = first_file(&source.mapping.join(index.to_string()))?;

            instances.push(InstanceRef { index, key_path, query_path });
        }
        instances.sort_by_key(|instance| instance.index);

        Ok(Self { instances })
    }
}

fn first_file(dir: &Path) -> Result<Option<PathBuf>, DataError> {
    if !dir.is_dir() {
        return Ok(None);
    }
    let mut files = Vec::new();
    for entry in read_dir(dir).map_err(DataError::io(dir))? {
        let path = entry.map_err(DataError::io(dir))?.path();
        if path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files.into_iter().next())
}

#[derive(new)]
pub struct ComparatorBatcher<B: Backend> {
    device: B::Device,
}

/// Query `i` matches key `i`; every other pair is a negative.
#[derive(Debug, Clone)]
pub struct ComparatorBatch<B: Backend> {
    pub keys: Tensor<B, 4>,
    pub queries: Tensor<B, 4>,
    pub labels: Tensor<B, 2>,
}

impl<B: Backend> ComparatorBatcher<B> {
    fn image_tensor(&self, pixels: &[f32], image_size: usize) -> Tensor<B, 3> {
        let data = Data::new(pixels.to_vec(), Shape::new([3, image_size, image_size]));
        Tensor::<B, 3>::from_data(data.convert(), &self.device)
    }
}

impl<B: Backend> Batcher<InstanceItem, ComparatorBatch<B>> for ComparatorBatcher<B> {
    fn batch(&self, items: Vec<InstanceItem>) -> ComparatorBatch<B> {
        let size = items.len();

        let keys = items
            .iter()
            .map(|item| self.image_tensor(&item.key, item.image_size))
            .collect::<Vec<Tensor<B, 3>>>();
        let queries = items
            .iter()
            .map(|item| self.image_tensor(&item.query, item.image_size))
            .collect::<Vec<Tensor<B, 3>>>();

        let labels = (0..size * size)
            .map(|i| if i / size == i % size { 1f32 } else { 0f32 })
            .collect::<Vec<f32>>();
        let labels = Tensor::<B, 2>::from_data(Data::new(labels, Shape::new([size, size])).convert(), &self.device);

        ComparatorBatch {
            keys: Tensor::stack(keys, 0),
            queries: Tensor::stack(queries, 0),
            labels,
        }
    }
}

/// Fixed-size batches over an [`InstanceDataset`].
///
/// The trailing partial batch is dropped so that every score matrix has the
/// same shape as the positive weight of the loss.
pub struct ComparatorDataloader<B: Backend> {
    dataset: InstanceDataset,
    batcher: ComparatorBatcher<B>,
    processing: Processing,
    batch_size: usize,
    order: Vec<usize>,
    rng: StdRng,
    /// Seed of the per-item processing RNGs of the current pass.
    pass_seed: u64,
}

impl<B: Backend> ComparatorDataloader<B> {
    pub fn new(
        dataset: InstanceDataset,
        batcher: ComparatorBatcher<B>,
        processing: Processing,
        batch_size: usize,
        seed: u64,
    ) -> Self {
        let order = (0..dataset.len()).collect();
        Self {
            dataset,
            batcher,
            processing,
            batch_size: batch_size.max(1),
            order,
            rng: StdRng::seed_from_u64(seed),
            pass_seed: seed,
        }
    }

    /// Reorders the items and draws new processing seeds for the next pass.
    pub fn shuffle(&mut self) {
        self.order.shuffle(&mut self.rng);
        self.pass_seed = self.rng.gen();
    }

    /// Number of batches per pass.
    pub fn len(&self) -> usize {
        self.order.len() / self.batch_size
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn num_items(&self) -> usize {
        self.dataset.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = Result<ComparatorBatch<B>, DataError>> + '_ {
        self.order
            .chunks_exact(self.batch_size)
            .enumerate()
            .map(move |(batch, chunk)| self.load_batch(batch * self.batch_size, chunk))
    }

    fn load_batch(&self, start: usize, chunk: &[usize]) -> Result<ComparatorBatch<B>, DataError> {
        let items = chunk
            .par_iter()
            .enumerate()
            .map(|(offset, &index)| {
                // one RNG per position keeps processing independent of rayon scheduling
                let position = (start + offset) as u64;
                let mut rng = StdRng::seed_from_u64(self.pass_seed.wrapping_add(position));
                self.dataset
                    .get(index)
                    .ok_or(DataError::MissingItem(index))
                    .and_then(|instance| instance.load(&self.processing, &mut rng))
            })
            .collect::<Result<Vec<InstanceItem>, DataError>>()?;

        Ok(self.batcher.batch(items))
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use std::{fs, path::Path};

    use image::{Rgb, RgbImage};

    /// Writes `count` instances laid out like the generator output.
    pub fn write_instances(root: &Path, count: usize, size: u32) {
        for index in 0..count {
            let dir = root.join(index.to_string());
            fs::create_dir_all(&dir).unwrap();
            let shade = (index * 37 % 256) as u8;
            RgbImage::from_fn(size, size, |x, y| Rgb([shade, (x * 16) as u8, (y * 16) as u8]))
                .save(dir.join("0.png"))
                .unwrap();
        }
    }
}
