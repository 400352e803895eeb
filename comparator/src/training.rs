use std::{fs, time::Instant};

use anyhow::{bail, Context};
use burn::{config::Config, data::dataset::Dataset, module::{AutodiffModule, Module}, record::CompactRecorder, optim::{AdamConfig, GradientsParams, Optimizer}, tensor::{backend::AutodiffBackend, ElementConversion}};
use derive_new::new;
use tracing::info;

use crate::{checkpoint::{CheckpointManager, TrainingState}, data::{ComparatorBatcher, ComparatorDataloader, InstanceDataset, InstanceSource, Processing}, model::{BinaryCrossEntropyWithLogits, BinaryCrossEntropyWithLogitsConfig, Comparator, ComparatorConfig}, optim::{Lookahead, LookaheadConfig}};

#[derive(Config)]
pub struct TrainingConfig {
    pub model: ComparatorConfig,
    pub optimizer: AdamConfig,
    pub lookahead: LookaheadConfig,
    #[config(default = 10)]
    pub num_epochs: usize,
    #[config(default = 16)]
    pub batch_size: usize,
    #[config(default = 0.3)]
    pub processing_rate: f64,
    #[config(default = 42)]
    pub seed: u64,
    #[config(default = 5.0e-5)]
    pub learning_rate: f64,
    /// Epochs without validation improvement before stopping; 0 never stops.
    #[config(default = 1)]
    pub patience: usize,
    #[config(default = 2)]
    pub keep_checkpoints: usize,
}

/// Number of batches between two progress lines, never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogInterval(usize);

impl LogInterval {
    pub fn new(num_batches: usize) -> Self {
        Self((num_batches / 100).max(1))
    }

    pub fn get(&self) -> usize {
        self.0
    }

    pub fn should_log(&self, batch: usize) -> bool {
        batch > 0 && batch % self.0 == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressReport {
    pub mean_loss: f64,
    pub ms_per_batch: f64,
    pub perplexity: f64,
}

/// Loss and wall time accumulated since the last progress line.
#[derive(Debug)]
pub struct LossWindow {
    total: f64,
    started: Instant,
}

impl Default for LossWindow {
    fn default() -> Self {
        Self {
            total: 0.0,
            started: Instant::now(),
        }
    }
}

impl LossWindow {
    pub fn record(&mut self, loss: f64) {
        self.total += loss;
    }

    pub fn flush(&mut self, interval: LogInterval) -> ProgressReport {
        let interval = interval.get() as f64;
        let mean_loss = self.total / interval;
        let report = ProgressReport {
            mean_loss,
            ms_per_batch: self.started.elapsed().as_secs_f64() * 1000.0 / interval,
            perplexity: mean_loss.exp(),
        };
        *self = Self::default();
        report
    }
}

#[derive(Debug, Clone, Copy, new)]
pub struct EarlyStopping {
    patience: usize,
}

impl EarlyStopping {
    /// Records an epoch's validation loss; true when it is a new best.
    pub fn update(&self, state: &mut TrainingState, valid_loss: f64) -> bool {
        let improved = state.best_valid_loss.map_or(true, |best| valid_loss < best);
        if improved {
            state.best_valid_loss = Some(valid_loss);
            state.epochs_without_improvement = 0;
        } else {
            state.epochs_without_improvement += 1;
        }
        improved
    }

    pub fn should_stop(&self, state: &TrainingState) -> bool {
        self.patience > 0 && state.epochs_without_improvement >= self.patience
    }
}

pub struct ComparatorTrainer<B: AutodiffBackend, O> {
    model: Comparator<B>,
    optimizer: Lookahead<O, B>,
    criterion: BinaryCrossEntropyWithLogits,
    train_loader: ComparatorDataloader<B>,
    valid_loader: ComparatorDataloader<B::InnerBackend>,
    checkpoints: CheckpointManager,
    early_stopping: EarlyStopping,
    state: TrainingState,
    learning_rate: f64,
    device: B::Device,
}

impl<B, O> ComparatorTrainer<B, O>
where
    B: AutodiffBackend,
    O: Optimizer<Comparator<B>, B>,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        model: Comparator<B>,
        optimizer: Lookahead<O, B>,
        train_loader: ComparatorDataloader<B>,
        valid_loader: ComparatorDataloader<B::InnerBackend>,
        checkpoints: CheckpointManager,
        early_stopping: EarlyStopping,
        learning_rate: f64,
        device: B::Device,
    ) -> Self {
        // one positive per row against batch_size - 1 negatives
        let criterion = BinaryCrossEntropyWithLogitsConfig::new()
            .with_pos_weight(train_loader.batch_size() as f64)
            .init();

        Self {
            model,
            optimizer,
            criterion,
            train_loader,
            valid_loader,
            checkpoints,
            early_stopping,
            state: TrainingState::default(),
            learning_rate,
            device,
        }
    }

    /// Continues from the latest checkpoint, if any.
    pub fn resume(self) -> anyhow::Result<Self> {
        let Self {
            model,
            optimizer,
            criterion,
            train_loader,
            valid_loader,
            checkpoints,
            early_stopping,
            state,
            learning_rate,
            device,
        } = self;

        let (model, mut optimizer, restored) = checkpoints.restore::<B, _, _>(model, optimizer, &device)?;
        let state = restored.unwrap_or(state);
        optimizer.set_steps(state.optimizer_steps);

        Ok(Self {
            model,
            optimizer,
            criterion,
            train_loader,
            valid_loader,
            checkpoints,
            early_stopping,
            state,
            learning_rate,
            device,
        })
    }

    pub fn model(&self) -> &Comparator<B> {
        &self.model
    }

    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    /// One pass over the shuffled training set; returns the mean batch loss.
    pub fn train_epoch(&mut self, epoch: usize) -> anyhow::Result<f64> {
        self.train_loader.shuffle();

        let num_batches = self.train_loader.len();
        let interval = LogInterval::new(num_batches);
        let mut window = LossWindow::default();
        let mut epoch_loss = 0.0;

        for (i, batch) in self.train_loader.iter().enumerate() {
            let batch = batch.with_context(|| format!("failed to load training batch {i}"))?;

            let loss = self.model.forward_loss(batch, &self.criterion);
            let loss_value = loss.clone().into_scalar().elem::<f64>();
            let grads = GradientsParams::from_grads(loss.backward(), &self.model);
            self.model = self.optimizer.step(self.learning_rate, self.model.clone(), grads);

            window.record(loss_value);
            epoch_loss += loss_value;

            if interval.should_log(i) {
                let report = window.flush(interval);
                info!(
                    "| {:3} epoch | {:5}/{:5} batches | {:5.2} ms/batch | {:5.2} loss | {:8.2} ppl |",
                    epoch, i, num_batches, report.ms_per_batch, report.mean_loss, report.perplexity
                );
            }
        }

        Ok(epoch_loss / num_batches.max(1) as f64)
    }

    /// Mean validation loss, computed on the non-autodiff copy of the model.
    pub fn evaluate(&mut self) -> anyhow::Result<f64> {
        if self.valid_loader.is_empty() {
            bail!(
                "validation set has {} instances, fewer than one batch of {}",
                self.valid_loader.num_items(),
                self.valid_loader.batch_size()
            );
        }
        self.valid_loader.shuffle();

        let model = self.model.valid();
        let mut total_loss = 0.0;
        for (i, batch) in self.valid_loader.iter().enumerate() {
            let batch = batch.with_context(|| format!("failed to load validation batch {i}"))?;
            let loss = model.forward_loss(batch, &self.criterion);
            total_loss += loss.into_scalar().elem::<f64>();
        }

        Ok(total_loss / self.valid_loader.len() as f64)
    }

    /// Trains until `epochs` epochs are done or validation stops improving.
    pub fn run(&mut self, epochs: usize) -> anyhow::Result<&TrainingState> {
        if self.train_loader.is_empty() {
            bail!(
                "training set has {} instances, fewer than one batch of {}",
                self.train_loader.num_items(),
                self.train_loader.batch_size()
            );
        }

        if self.early_stopping.should_stop(&self.state) {
            info!(
                "Stopped early at epoch {} after {} epochs without validation improvement",
                self.state.epoch, self.state.epochs_without_improvement
            );
            return Ok(&self.state);
        }

        let first = self.state.epoch + 1;
        if first > epochs {
            info!("Already trained for {} epochs", self.state.epoch);
        }

        for epoch in first..=epochs {
            let started = Instant::now();
            let train_loss = self.train_epoch(epoch)?;
            let valid_loss = self.evaluate()?;

            self.state.epoch = epoch;
            self.state.optimizer_steps = self.optimizer.steps();
            let improved = self.early_stopping.update(&mut self.state, valid_loss);
            self.checkpoints
                .save::<B, _, _>(&self.state, &self.model, &self.optimizer)?;
            if improved {
                let path = self.checkpoints.save_best::<B, _>(&self.model)?;
                info!("New best validation loss {:.4}, saved {}", valid_loss, path.display());
            }

            info!(
                "| end of epoch {:3} | time: {:5.2}s | {:6} steps | train loss {:5.2} | valid loss {:5.2} | valid ppl {:8.2} |",
                epoch,
                started.elapsed().as_secs_f64(),
                self.optimizer.steps(),
                train_loss,
                valid_loss,
                valid_loss.exp()
            );

            if self.early_stopping.should_stop(&self.state) {
                info!(
                    "No validation improvement for {} epochs, stopping after epoch {}",
                    self.state.epochs_without_improvement, epoch
                );
                break;
            }
        }

        Ok(&self.state)
    }
}

/// Assembles a trainer over the instance directories of both splits.
pub fn build_trainer<B: AutodiffBackend>(
    artifact_dir: &str,
    config: &TrainingConfig,
    train: &InstanceSource,
    valid: &InstanceSource,
    device: B::Device,
) -> anyhow::Result<ComparatorTrainer<B, impl Optimizer<Comparator<B>, B>>> {
    config.model.check()?;

    let processing = Processing::new(config.model.image_size, config.processing_rate);
    let train_dataset = InstanceDataset::open(train)
        .with_context(|| format!("failed to read instances in {}", train.instances.display()))?;
    let valid_dataset = InstanceDataset::open(valid)
        .with_context(|| format!("failed to read instances in {}", valid.instances.display()))?;
    info!(
        "{} training and {} validation instances",
        train_dataset.len(),
        valid_dataset.len()
    );

    let train_loader = ComparatorDataloader::new(
        train_dataset,
        ComparatorBatcher::<B>::new(device.clone()),
        processing,
        config.batch_size,
        config.seed,
    );
    let valid_loader = ComparatorDataloader::new(
        valid_dataset,
        ComparatorBatcher::<B::InnerBackend>::new(device.clone()),
        processing,
        config.batch_size,
        config.seed,
    );

    let model = config.model.init::<B>(&device);
    let optimizer = config
        .lookahead
        .init(config.optimizer.init::<B, Comparator<B>>());
    let checkpoints = CheckpointManager::new(artifact_dir, config.keep_checkpoints)?;
    info!("Checkpoints are written to {}", checkpoints.directory().display());

    Ok(ComparatorTrainer::new(
        model,
        optimizer,
        train_loader,
        valid_loader,
        checkpoints,
        EarlyStopping::new(config.patience),
        config.learning_rate,
        device,
    ))
}

pub fn train<B: AutodiffBackend>(
    artifact_dir: &str,
    config: TrainingConfig,
    train: &InstanceSource,
    valid: &InstanceSource,
    device: B::Device,
) -> anyhow::Result<()> {
    fs::create_dir_all(artifact_dir).with_context(|| format!("failed to create {artifact_dir}"))?;
    config
        .save(format!("{artifact_dir}/config.json"))
        .context("failed to save training config")?;

    B::seed(config.seed);

    let mut trainer = build_trainer::<B>(artifact_dir, &config, train, valid, device)?.resume()?;
    trainer.run(config.num_epochs)?;
    let state = trainer.state();
    info!(
        "Finished at epoch {} (best validation loss {:?})",
        state.epoch, state.best_valid_loss
    );

    trainer
        .model()
        .clone()
        .save_file(format!("{artifact_dir}/model"), &CompactRecorder::new())
        .map_err(|err| anyhow::anyhow!("failed to save trained model: {err:?}"))?;
    Ok(())
}
