use std::{fs::{self, File}, io::{BufReader, BufWriter, Write}, path::{Path, PathBuf}};

use anyhow::{anyhow, Context};
use burn::{module::{AutodiffModule, Module}, optim::Optimizer, record::CompactRecorder, tensor::backend::AutodiffBackend, train::checkpoint::{Checkpointer, FileCheckpointer}};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

const STATE_FILE: &str = "state.json";
const BEST_MODEL: &str = "best";

/// Progress persisted next to the records so an interrupted run resumes at
/// the following epoch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingState {
    pub epoch: usize,
    pub best_valid_loss: Option<f64>,
    pub epochs_without_improvement: usize,
    /// Optimizer steps taken so far, across resumes.
    #[serde(default)]
    pub optimizer_steps: usize,
}

pub struct CheckpointManager {
    directory: PathBuf,
    keep: usize,
    model: FileCheckpointer<CompactRecorder>,
    optim: FileCheckpointer<CompactRecorder>,
}

impl CheckpointManager {
    pub fn new(directory: impl AsRef<Path>, keep: usize) -> anyhow::Result<Self> {
        let directory = directory.as_ref().join("checkpoint");
        fs::create_dir_all(&directory)
            .with_context(|| format!("failed to create {}", directory.display()))?;

        let path = directory.to_string_lossy().into_owned();
        Ok(Self {
            model: FileCheckpointer::new(CompactRecorder::new(), &path, "model"),
            optim: FileCheckpointer::new(CompactRecorder::new(), &path, "optim"),
            directory,
            keep: keep.max(1),
        })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Writes the records of `state.epoch`, then the state file, then drops
    /// the epoch falling out of the retention window.
    pub fn save<B, M, O>(&self, state: &TrainingState, model: &M, optimizer: &O) -> anyhow::Result<()>
    where
        B: AutodiffBackend,
        M: AutodiffModule<B>,
        O: Optimizer<M, B>,
    {
        let epoch = state.epoch;
        Checkpointer::<<M as Module<B>>::Record, B>::save(&self.model, epoch, model.clone().into_record())
            .map_err(|err| anyhow!("failed to save model checkpoint {epoch}: {err:?}"))?;
        Checkpointer::<O::Record, B>::save(&self.optim, epoch, optimizer.to_record())
            .map_err(|err| anyhow!("failed to save optimizer checkpoint {epoch}: {err:?}"))?;
        self.write_state(state)?;

        if let Some(stale) = epoch.checked_sub(self.keep) {
            Checkpointer::<<M as Module<B>>::Record, B>::delete(&self.model, stale)
                .map_err(|err| anyhow!("failed to delete model checkpoint {stale}: {err:?}"))?;
            Checkpointer::<O::Record, B>::delete(&self.optim, stale)
                .map_err(|err| anyhow!("failed to delete optimizer checkpoint {stale}: {err:?}"))?;
        }

        debug!("saved checkpoint {} to {}", epoch, self.directory.display());
        Ok(())
    }

    /// Loads the latest checkpoint into `model` and `optimizer`. Returns the
    /// inputs untouched and no state when nothing was saved yet.
    pub fn restore<B, M, O>(&self, model: M, optimizer: O, device: &B::Device) -> anyhow::Result<(M, O, Option<TrainingState>)>
    where
        B: AutodiffBackend,
        M: AutodiffModule<B>,
        O: Optimizer<M, B>,
    {
        let state = match self.read_state()? {
            Some(state) => state,
            None => return Ok((model, optimizer, None)),
        };
        let epoch = state.epoch;

        let record = Checkpointer::<<M as Module<B>>::Record, B>::restore(&self.model, epoch, device)
            .map_err(|err| anyhow!("failed to restore model checkpoint {epoch}: {err:?}"))?;
        let model = model.load_record(record);
        let record = Checkpointer::<O::Record, B>::restore(&self.optim, epoch, device)
            .map_err(|err| anyhow!("failed to restore optimizer checkpoint {epoch}: {err:?}"))?;
        let optimizer = optimizer.load_record(record);

        info!("Resumed from checkpoint {} in {}", epoch, self.directory.display());
        Ok((model, optimizer, Some(state)))
    }

    pub fn save_best<B, M>(&self, model: &M) -> anyhow::Result<PathBuf>
    where
        B: AutodiffBackend,
        M: AutodiffModule<B>,
    {
        let path = self.directory.join(BEST_MODEL);
        model
            .clone()
            .save_file(&path, &CompactRecorder::new())
            .map_err(|err| anyhow!("failed to save best model to {}: {err:?}", path.display()))?;
        Ok(path)
    }

    pub fn read_state(&self) -> anyhow::Result<Option<TrainingState>> {
        let path = self.directory.join(STATE_FILE);
        if !path.is_file() {
            return Ok(None);
        }
        let file = File::open(&path).with_context(|| format!("failed to open {}", path.display()))?;
        let state = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(Some(state))
    }

    fn write_state(&self, state: &TrainingState) -> anyhow::Result<()> {
        let path = self.directory.join(STATE_FILE);
        let file = File::create(&path).with_context(|| format!("failed to create {}", path.display()))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, state)
            .with_context(|| format!("failed to write {}", path.display()))?;
        writer
            .flush()
            .with_context(|| format!("failed to write {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use burn::{backend::{Autodiff, NdArray}, nn::{Linear, LinearConfig}, optim::AdamConfig, tensor::ElementConversion};

    use super::*;

    type TestBackend = Autodiff<NdArray>;

    fn files(dir: &Path, prefix: &str) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| name.starts_with(prefix))
            .collect();
        names.sort();
        names
    }

    fn weights(linear: &Linear<TestBackend>) -> Vec<f32> {
        linear.weight.val().to_data().convert::<f32>().value
    }

    #[test]
    fn fresh_directory_has_nothing_to_restore() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path(), 2).unwrap();
        let device = Default::default();
        let model = LinearConfig::new(2, 2).init::<TestBackend>(&device);
        let optimizer = AdamConfig::new().init::<TestBackend, Linear<TestBackend>>();

        let (_, _, state) = manager.restore::<TestBackend, _, _>(model, optimizer, &device).unwrap();

        assert!(state.is_none());
        assert!(manager.directory().is_dir());
    }

    #[test]
    fn restores_the_latest_epoch_and_keeps_a_window() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path(), 2).unwrap();
        let device = Default::default();
        let model = LinearConfig::new(2, 2).init::<TestBackend>(&device);
        let optimizer = AdamConfig::new().init::<TestBackend, Linear<TestBackend>>();

        for epoch in 1..=3 {
            let state = TrainingState {
                epoch,
                best_valid_loss: Some(1.0 / epoch as f64),
                epochs_without_improvement: 0,
                optimizer_steps: 10 * epoch,
            };
            manager.save::<TestBackend, _, _>(&state, &model, &optimizer).unwrap();
        }

        assert_eq!(files(manager.directory(), "model-").len(), 2);
        assert_eq!(files(manager.directory(), "optim-").len(), 2);
        assert!(files(manager.directory(), "model-1").is_empty());

        let fresh = LinearConfig::new(2, 2).init::<TestBackend>(&device);
        let fresh_optimizer = AdamConfig::new().init::<TestBackend, Linear<TestBackend>>();
        let (restored, _, state) = manager.restore::<TestBackend, _, _>(fresh, fresh_optimizer, &device).unwrap();

        let state = state.unwrap();
        assert_eq!(state.epoch, 3);
        assert_eq!(state.best_valid_loss, Some(1.0 / 3.0));
        assert_eq!(state.optimizer_steps, 30);
        for (got, want) in weights(&restored).iter().zip(weights(&model)) {
            // compact records store half precision
            assert!((got - want).abs() < 1e-2);
        }
    }

    #[test]
    fn best_model_is_loadable() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path(), 1).unwrap();
        let device = Default::default();
        let model = LinearConfig::new(1, 1).with_bias(false).init::<TestBackend>(&device);

        let path = manager.save_best::<TestBackend, _>(&model).unwrap();
        let loaded = LinearConfig::new(1, 1)
            .with_bias(false)
            .init::<TestBackend>(&device)
            .load_file(path, &CompactRecorder::new(), &device)
            .unwrap();

        let want = model.weight.val().into_scalar().elem::<f64>();
        let got = loaded.weight.val().into_scalar().elem::<f64>();
        assert!((got - want).abs() < 1e-2);
    }
}
