use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use burn::{
    module::Module,
    optim::Optimizer,
    record::{FullPrecisionSettings, NamedMpkGzFileRecorder, Recorder},
    tensor::backend::AutodiffBackend,
};
use serde::{Deserialize, Serialize};

use crate::error::GlowError;
use crate::nn::model::GlowModel;

/// Extension the recorder appends to every record file
const RECORD_EXTENSION: &str = "mpk.gz";

type CheckpointRecorder = NamedMpkGzFileRecorder<FullPrecisionSettings>;

/// Written next to each model/optimizer pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub saved_at: String,
    pub iteration: usize,
    pub epoch: usize,
    pub learning_rate: f64,
    pub model_file: String,
    pub optimizer_file: String,
}

/// Path without any extension (`glow_model_100.mpk.gz` -> `glow_model_100`).
pub fn checkpoint_stem(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let stem = name.split('.').next().unwrap_or_default().to_string();
    path.with_file_name(stem)
}

/// Iteration encoded after the last `_` of a checkpoint name.
pub fn parse_checkpoint_iteration(path: &Path) -> Result<usize, GlowError> {
    let stem = checkpoint_stem(path);
    let name = stem
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.rsplit_once('_')
        .and_then(|(_, iter)| iter.parse().ok())
        .ok_or_else(|| GlowError::CheckpointName(path.display().to_string()))
}

/// `.../glow_model_<iter>` -> `.../glow_optimizer_<iter>`
pub fn sibling_optimizer(model_path: &Path) -> Option<PathBuf> {
    let stem = checkpoint_stem(model_path);
    let name = stem.file_name()?.to_string_lossy().into_owned();
    let (head, iter) = name.rsplit_once('_')?;
    let prefix = head.strip_suffix("_model")?;
    Some(stem.with_file_name(format!("{prefix}_optimizer_{iter}")))
}

fn record_file(stem: &Path) -> PathBuf {
    stem.with_extension(RECORD_EXTENSION)
}

/// Saves model and optimizer records each epoch, keeping the newest `keep`.
pub struct CheckpointSaver {
    dir: PathBuf,
    prefix: String,
    keep: usize,
    saved: VecDeque<Vec<PathBuf>>,
}

impl CheckpointSaver {
    pub fn new(dir: &Path, prefix: &str, keep: usize) -> Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create checkpoint directory '{}'", dir.display()))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            prefix: prefix.to_string(),
            keep: keep.max(1),
            saved: VecDeque::new(),
        })
    }

    /// Write `<prefix>_model_<iter>`, `<prefix>_optimizer_<iter>` and the
    /// metadata JSON. Returns the model record path.
    pub fn save<B, O>(
        &mut self,
        model: &GlowModel<B>,
        optim: &O,
        epoch: usize,
        iteration: usize,
        learning_rate: f64,
    ) -> Result<PathBuf>
    where
        B: AutodiffBackend,
        O: Optimizer<GlowModel<B>, B>,
    {
        let recorder = CheckpointRecorder::default();
        let model_stem = self.dir.join(format!("{}_model_{}", self.prefix, iteration));
        let optim_stem = self.dir.join(format!("{}_optimizer_{}", self.prefix, iteration));
        let meta_path = self
            .dir
            .join(format!("{}_checkpoint_{}.json", self.prefix, iteration));

        model
            .clone()
            .save_file(&model_stem, &recorder)
            .map_err(|e| anyhow!("Failed to save model: {}", e))?;
        Recorder::<B>::record(&recorder, optim.to_record(), optim_stem.clone())
            .map_err(|e| anyhow!("Failed to save optimizer: {}", e))?;

        let model_path = record_file(&model_stem);
        let optim_path = record_file(&optim_stem);
        let metadata = CheckpointMetadata {
            saved_at: chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            iteration,
            epoch,
            learning_rate,
            model_file: file_name(&model_path),
            optimizer_file: file_name(&optim_path),
        };
        let json = serde_json::to_string_pretty(&metadata)?;
        fs::write(&meta_path, json)
            .with_context(|| format!("Failed to write '{}'", meta_path.display()))?;

        tracing::info!("Checkpoint saved to {}", model_path.display());

        self.saved
            .push_back(vec![model_path.clone(), optim_path, meta_path]);
        while self.saved.len() > self.keep {
            if let Some(old) = self.saved.pop_front() {
                for path in old {
                    if let Err(e) = fs::remove_file(&path) {
                        tracing::warn!("Failed to remove old checkpoint {}: {}", path.display(), e);
                    }
                }
            }
        }

        Ok(model_path)
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

pub fn load_metadata(path: &Path) -> Result<CheckpointMetadata> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read '{}'", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("Failed to parse '{}'", path.display()))
}

/// Restored training state: weights, optimizer moments and the iteration
/// the checkpoint was taken at.
pub struct Resumed<B: AutodiffBackend, O> {
    pub model: GlowModel<B>,
    pub optim: O,
    pub iteration: usize,
}

/// Load `saved_model` into `model` and the optimizer record into `optim`.
///
/// Without an explicit `saved_optimizer` the sibling `<prefix>_optimizer_<iter>`
/// is used; when none exists the optimizer starts fresh.
pub fn resume<B, O>(
    model: GlowModel<B>,
    optim: O,
    saved_model: &Path,
    saved_optimizer: Option<&Path>,
    device: &B::Device,
) -> Result<Resumed<B, O>>
where
    B: AutodiffBackend,
    O: Optimizer<GlowModel<B>, B>,
{
    let iteration = parse_checkpoint_iteration(saved_model)?;
    let recorder = CheckpointRecorder::default();

    let model = model
        .load_file(checkpoint_stem(saved_model), &recorder, device)
        .map_err(|e| anyhow!("Failed to load model '{}': {}", saved_model.display(), e))?;
    tracing::info!("Loaded model from {} (iteration {})", saved_model.display(), iteration);

    let optim_stem = saved_optimizer
        .map(checkpoint_stem)
        .or_else(|| sibling_optimizer(saved_model));
    let optim = match optim_stem {
        Some(stem) if record_file(&stem).exists() => {
            let record = Recorder::<B>::load(&recorder, stem.clone(), device)
                .map_err(|e| anyhow!("Failed to load optimizer '{}': {}", stem.display(), e))?;
            tracing::info!("Loaded optimizer state from {}", record_file(&stem).display());
            optim.load_record(record)
        }
        _ => {
            tracing::warn!("No optimizer state found next to {}; starting fresh", saved_model.display());
            optim
        }
    };

    Ok(Resumed {
        model,
        optim,
        iteration,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FlowCoupling, FlowPermutation};
    use crate::nn::model::GlowConfig;
    use crate::nn::optim::AdamaxConfig;
    use burn::backend::{Autodiff, NdArray};
    use burn::module::{ModuleVisitor, ParamId};
    use burn::tensor::Tensor;
    use rand::{rngs::StdRng, SeedableRng};

    type TestAutodiff = Autodiff<NdArray>;

    fn tiny_model(seed: u64) -> GlowModel<TestAutodiff> {
        let config = GlowConfig {
            height: 4,
            width: 4,
            channels: 1,
            hidden_channels: 4,
            k: 1,
            l: 1,
            actnorm_scale: 1.0,
            flow_permutation: FlowPermutation::Reverse,
            flow_coupling: FlowCoupling::Additive,
            lu_decomposed: false,
            num_classes: 1,
            learn_top: false,
            y_condition: false,
        };
        config.init(&Default::default(), &mut StdRng::seed_from_u64(seed))
    }

    struct Weights(Vec<f32>);

    impl<B: burn::tensor::backend::Backend> ModuleVisitor<B> for Weights {
        fn visit_float<const D: usize>(&mut self, _id: ParamId, tensor: &Tensor<B, D>) {
            self.0.extend(tensor.clone().into_data().convert::<f32>().to_vec::<f32>().unwrap());
        }
    }

    fn weights(model: &GlowModel<TestAutodiff>) -> Vec<f32> {
        let mut visitor = Weights(Vec::new());
        model.visit(&mut visitor);
        visitor.0
    }

    #[test]
    fn test_parse_checkpoint_iteration() {
        let it = parse_checkpoint_iteration(Path::new("results/run/checkpoints/glow_model_350.mpk.gz"));
        assert_eq!(it.unwrap(), 350);
        assert_eq!(parse_checkpoint_iteration(Path::new("glow_model_7")).unwrap(), 7);
        assert!(matches!(
            parse_checkpoint_iteration(Path::new("glow_model_final.mpk.gz")),
            Err(GlowError::CheckpointName(_))
        ));
        assert!(parse_checkpoint_iteration(Path::new("model")).is_err());
    }

    #[test]
    fn test_sibling_optimizer_path() {
        let p = sibling_optimizer(Path::new("ck/glow_model_12.mpk.gz")).unwrap();
        assert_eq!(p, Path::new("ck/glow_optimizer_12"));
        assert!(sibling_optimizer(Path::new("ck/weights_12.mpk.gz")).is_none());
        assert_eq!(checkpoint_stem(Path::new("a/b.mpk.gz")), Path::new("a/b"));
    }

    #[test]
    fn test_saver_keeps_newest_checkpoint_only() {
        let dir = tempfile::tempdir().unwrap();
        let model = tiny_model(1);
        let optim = AdamaxConfig::new().init::<TestAutodiff, GlowModel<TestAutodiff>>();
        let mut saver = CheckpointSaver::new(dir.path(), "glow", 1).unwrap();

        let first = saver.save(&model, &optim, 1, 10, 1e-4).unwrap();
        assert!(first.exists());
        let second = saver.save(&model, &optim, 2, 20, 2e-4).unwrap();

        assert!(!first.exists());
        assert!(!dir.path().join("glow_checkpoint_10.json").exists());
        assert!(second.ends_with("glow_model_20.mpk.gz"));
        assert!(dir.path().join("glow_optimizer_20.mpk.gz").exists());

        let meta = load_metadata(&dir.path().join("glow_checkpoint_20.json")).unwrap();
        assert_eq!(meta.iteration, 20);
        assert_eq!(meta.epoch, 2);
        assert_eq!(meta.optimizer_file, "glow_optimizer_20.mpk.gz");
    }

    #[test]
    fn test_resume_restores_weights_and_iteration() {
        let dir = tempfile::tempdir().unwrap();
        let saved = tiny_model(1);
        let optim = AdamaxConfig::new().init::<TestAutodiff, GlowModel<TestAutodiff>>();
        let mut saver = CheckpointSaver::new(dir.path(), "glow", 1).unwrap();
        let path = saver.save(&saved, &optim, 3, 30, 1e-3).unwrap();

        let device = Default::default();
        let fresh = tiny_model(2);
        let fresh_optim = AdamaxConfig::new().init::<TestAutodiff, GlowModel<TestAutodiff>>();
        let resumed = resume(fresh, fresh_optim, &path, None, &device).unwrap();
        assert_eq!(resumed.iteration, 30);

        assert_eq!(weights(&saved), weights(&resumed.model));
        assert_ne!(weights(&saved), weights(&tiny_model(2)));
    }

    #[test]
    fn test_resume_without_optimizer_record() {
        let dir = tempfile::tempdir().unwrap();
        let saved = tiny_model(1);
        let optim = AdamaxConfig::new().init::<TestAutodiff, GlowModel<TestAutodiff>>();
        let mut saver = CheckpointSaver::new(dir.path(), "glow", 1).unwrap();
        let path = saver.save(&saved, &optim, 1, 5, 1e-3).unwrap();
        fs::remove_file(dir.path().join("glow_optimizer_5.mpk.gz")).unwrap();

        let resumed = resume(
            tiny_model(3),
            AdamaxConfig::new().init::<TestAutodiff, GlowModel<TestAutodiff>>(),
            &path,
            None,
            &Default::default(),
        )
        .unwrap();
        assert_eq!(resumed.iteration, 5);
    }
}
