use burn::{config::Config, module::Module, nn::{conv::{Conv2d, Conv2dConfig}, transformer::{TransformerEncoder, TransformerEncoderConfig, TransformerEncoderInput}, Dropout, DropoutConfig, Embedding, EmbeddingConfig, Linear, LinearConfig}, tensor::{backend::Backend, Data, Int, Shape, Tensor}};
use derive_new::new;

use crate::data::ComparatorBatch;

#[derive(Config, Debug)]
pub struct ComparatorConfig {
    #[config(default = 320)]
    pub image_size: usize,
    #[config(default = 32)]
    pub patch_size: usize,
    #[config(default = 1024)]
    pub token_size: usize,
    /// Number of attention heads.
    #[config(default = 8)]
    pub head_size: usize,
    #[config(default = 1024)]
    pub intermediate_size: usize,
    #[config(default = 0.4)]
    pub dropout: f64,
    /// Number of stacked self-attention layers.
    #[config(default = 2)]
    pub self_attention_size: usize,
}

impl ComparatorConfig {
    pub fn check(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.patch_size > 0 && self.image_size % self.patch_size == 0,
            "image size {} is not a multiple of patch size {}",
            self.image_size,
            self.patch_size
        );
        anyhow::ensure!(
            self.head_size > 0 && self.token_size % self.head_size == 0,
            "token size {} is not divisible by {} heads",
            self.token_size,
            self.head_size
        );
        anyhow::ensure!(
            (0.0..1.0).contains(&self.dropout),
            "dropout {} is outside [0, 1)",
            self.dropout
        );
        Ok(())
    }

    pub fn patches(&self) -> usize {
        let side = self.image_size / self.patch_size;
        side * side
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> Comparator<B> {
        let patch = [self.patch_size, self.patch_size];

        Comparator {
            patch_embedding: Conv2dConfig::new([3, self.token_size], patch)
                .with_stride(patch)
                .init(device),
            position_embedding: EmbeddingConfig::new(self.patches(), self.token_size).init(device),
            encoder: TransformerEncoderConfig::new(
                self.token_size,
                self.intermediate_size,
                self.head_size,
                self.self_attention_size,
            )
            .with_dropout(self.dropout)
            .init(device),
            key_projection: LinearConfig::new(self.token_size, self.token_size).init(device),
            query_projection: LinearConfig::new(self.token_size, self.token_size).init(device),
            dropout: DropoutConfig::new(self.dropout).init(),
        }
    }
}

/// Siamese image encoder scoring every query against every key.
#[derive(Module, Debug)]
pub struct Comparator<B: Backend> {
    patch_embedding: Conv2d<B>,
    position_embedding: Embedding<B>,
    encoder: TransformerEncoder<B>,
    key_projection: Linear<B>,
    query_projection: Linear<B>,
    dropout: Dropout,
}

impl<B: Backend> Comparator<B> {
    /// `[N, 3, S, S]` images to `[N, token_size]` embeddings.
    pub fn embed(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let [batch_size, _, _, _] = images.dims();

        // patches: [N, token_size, S/P, S/P] -> [N, S/P * S/P, token_size]
        let x = self.patch_embedding.forward(images);
        let [_, channels, height, width] = x.dims();
        let patches = height * width;
        let x = x.reshape([batch_size, channels, patches]).swap_dims(1, 2);

        let positions = (0..batch_size)
            .flat_map(|_| 0..patches as i64)
            .collect::<Vec<i64>>();
        let positions = Tensor::<B, 2, Int>::from_data(
            Data::new(positions, Shape::new([batch_size, patches])).convert(),
            &x.device(),
        );

        let x = x + self.position_embedding.forward(positions);
        let x = self.dropout.forward(x);
        let x = self.encoder.forward(TransformerEncoderInput::new(x));

        x.mean_dim(1).reshape([batch_size, channels])
    }

    /// Scores `[queries, keys]`; entry `(i, j)` is the logit that query `i`
    /// shows the same instance as key `j`.
    pub fn forward(&self, keys: Tensor<B, 4>, queries: Tensor<B, 4>) -> Tensor<B, 2> {
        let keys = self.key_projection.forward(self.embed(keys));
        let queries = self.query_projection.forward(self.embed(queries));
        let [_, token_size] = keys.dims();

        queries
            .matmul(keys.transpose())
            .div_scalar((token_size as f64).sqrt())
    }

    pub fn forward_loss(&self, batch: ComparatorBatch<B>, criterion: &BinaryCrossEntropyWithLogits) -> Tensor<B, 1> {
        let device = batch.keys.device();
        let scores = self.forward(batch.keys, batch.queries);
        let labels = batch.labels.to_device(&device);
        criterion.forward(scores, labels)
    }
}

#[derive(Config, Debug)]
pub struct BinaryCrossEntropyWithLogitsConfig {
    /// Weight of the positive class; the trainer sets it to the batch size,
    /// the number of negatives per positive plus one.
    #[config(default = 1.0)]
    pub pos_weight: f64,
}

impl BinaryCrossEntropyWithLogitsConfig {
    pub fn init(&self) -> BinaryCrossEntropyWithLogits {
        BinaryCrossEntropyWithLogits {
            pos_weight: self.pos_weight,
        }
    }
}

/// Mean binary cross entropy on raw logits.
#[derive(Debug, Clone, new)]
pub struct BinaryCrossEntropyWithLogits {
    pos_weight: f64,
}

impl BinaryCrossEntropyWithLogits {
    pub fn forward<B: Backend, const D: usize>(&self, logits: Tensor<B, D>, targets: Tensor<B, D>) -> Tensor<B, 1> {
        // (1 - y) * x + (1 + (w - 1) * y) * (log(1 + exp(-|x|)) + max(-x, 0))
        let log_weight = targets.clone().mul_scalar(self.pos_weight - 1.0).add_scalar(1.0);
        let softplus = logits.clone().abs().neg().exp().add_scalar(1.0).log()
            + logits.clone().neg().clamp_min(0.0);
        let loss = targets.neg().add_scalar(1.0).mul(logits) + log_weight.mul(softplus);

        loss.mean()
    }
}


#[cfg(test)]
mod tests {
    use burn::{backend::NdArray, tensor::ElementConversion};

    use super::{fixtures::tiny_config, *};

    type TestBackend = NdArray;

    fn scalar(tensor: Tensor<TestBackend, 1>) -> f64 {
        tensor.into_scalar().elem::<f64>()
    }

    #[test]
    fn scores_every_query_against_every_key() {
        let device = Default::default();
        let model = tiny_config().init::<TestBackend>(&device);

        let keys = Tensor::<TestBackend, 4>::ones([2, 3, 16, 16], &device);
        let queries = Tensor::<TestBackend, 4>::zeros([3, 3, 16, 16], &device);
        let scores = model.forward(keys, queries);

        assert_eq!(scores.dims(), [3, 2]);
        assert!(scores.to_data().convert::<f32>().value.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn rejects_inconsistent_shapes() {
        assert!(tiny_config().check().is_ok());
        assert!(tiny_config().with_patch_size(5).check().is_err());
        assert!(tiny_config().with_head_size(3).check().is_err());
        assert!(tiny_config().with_dropout(1.0).check().is_err());
        assert_eq!(ComparatorConfig::new().patches(), 100);
    }

    #[test]
    fn bce_with_logits_matches_reference_values() {
        let device = Default::default();
        let logits = Tensor::<TestBackend, 2>::from_floats([[0.0, 0.0], [2.0, -3.0]], &device);
        let targets = Tensor::<TestBackend, 2>::from_floats([[1.0, 0.0], [1.0, 0.0]], &device);

        let loss = BinaryCrossEntropyWithLogitsConfig::new().init().forward(logits, targets);

        // -ln(sigmoid(x)) for positives, -ln(1 - sigmoid(x)) for negatives
        let ln2 = 2f64.ln();
        let expected = (ln2 + ln2 + (1.0 + (-2f64).exp()).ln() + (1.0 + (-3f64).exp()).ln()) / 4.0;
        assert!((scalar(loss) - expected).abs() < 1e-5);
    }

    #[test]
    fn positive_weight_scales_only_positive_terms() {
        let device = Default::default();
        let logits = Tensor::<TestBackend, 1>::from_floats([0.0, 0.0], &device);
        let targets = Tensor::<TestBackend, 1>::from_floats([1.0, 0.0], &device);

        let loss = BinaryCrossEntropyWithLogitsConfig::new()
            .with_pos_weight(3.0)
            .init()
            .forward(logits, targets);

        let ln2 = 2f64.ln();
        assert!((scalar(loss) - (3.0 * ln2 + ln2) / 2.0).abs() < 1e-5);
    }

    #[test]
    fn large_logits_stay_finite() {
        let device = Default::default();
        let logits = Tensor::<TestBackend, 1>::from_floats([200.0, -200.0], &device);
        let targets = Tensor::<TestBackend, 1>::from_floats([0.0, 1.0], &device);

        let loss = BinaryCrossEntropyWithLogits::new(1.0).forward(logits, targets);

        assert!((scalar(loss) - 200.0).abs() < 1e-3);
    }
}
