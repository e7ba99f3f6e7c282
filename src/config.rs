use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, ValueEnum};
use serde::{Deserialize, Serialize};

use crate::error::GlowError;

/// Root folder that holds one directory per run
pub const RESULTS_DIR: &str = "results";

/// Bits per color channel kept by the dequantizer
pub const N_BITS: u32 = 8;

/// Adamax weight decay
pub const WEIGHT_DECAY: f64 = 5e-5;

/// Iterations between two sampling rounds
pub const SAMPLE_EVERY: usize = 50;
/// Images drawn per sampling round (the unconditional prior batch)
pub const NUM_SAMPLES: usize = 32;
pub const SAMPLE_TEMPERATURE: f64 = 1.0;

/// Sample grid layout
pub const GRID_IMAGES: usize = 30;
pub const GRID_NROW: usize = 5;
pub const GRID_PADDING: usize = 10;

/// Running average smoothing for progress metrics
pub const RUNNING_AVERAGE_ALPHA: f64 = 0.98;

/// Checkpoint file prefix and how many checkpoints stay on disk
pub const CHECKPOINT_PREFIX: &str = "glow";
pub const CHECKPOINTS_KEPT: usize = 1;

/// Channel permutation used inside each flow step
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowPermutation {
    Invconv,
    Shuffle,
    Reverse,
}

/// Coupling layer flavour
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowCoupling {
    Additive,
    Affine,
}

/// Train a Glow normalizing flow on rock image patches
#[derive(Parser, Debug, Clone, Serialize, Deserialize)]
#[command(author, version, about = "Train a Glow model on rock image patches")]
pub struct Options {
    // Dataset
    /// Type of the dataset to be used (repeat for several modalities)
    #[arg(long = "dataset", action = ArgAction::Append)]
    pub dataset: Vec<String>,

    /// Path to dataset
    #[arg(long = "dataroot", default_value = "./")]
    pub dataroot: PathBuf,

    /// Downloads dataset
    #[arg(long = "download")]
    pub download: bool,

    /// Preprocess binary data for numerical stability
    #[arg(long = "binary_data")]
    pub binary_data: bool,

    // Architecture
    /// Do not augment training data
    #[arg(long = "no_augment", action = ArgAction::SetFalse)]
    pub augment: bool,

    /// Number of hidden channels
    #[arg(long = "hidden_channels", default_value = "256")]
    pub hidden_channels: usize,

    /// Number of layers per block
    #[arg(long = "K", default_value = "32")]
    #[serde(rename = "K")]
    pub k: usize,

    /// Number of blocks
    #[arg(long = "L", default_value = "3")]
    #[serde(rename = "L")]
    pub l: usize,

    /// Act norm scale
    #[arg(long = "actnorm_scale", default_value = "1.0")]
    pub actnorm_scale: f64,

    /// Type of flow permutation
    #[arg(long = "flow_permutation", value_enum, default_value = "invconv")]
    pub flow_permutation: FlowPermutation,

    /// Type of flow coupling
    #[arg(long = "flow_coupling", value_enum, default_value = "affine")]
    pub flow_coupling: FlowCoupling,

    /// Train without LU decomposed 1x1 convs
    #[arg(long = "no_LU_decomposed", action = ArgAction::SetFalse)]
    #[serde(rename = "LU_decomposed")]
    pub lu_decomposed: bool,

    /// Size of input rock image patches
    #[arg(long = "patch_size", default_value = "128")]
    pub patch_size: usize,

    // Training
    /// Do not train top layer (prior)
    #[arg(long = "no_learn_top", action = ArgAction::SetFalse)]
    pub learn_top: bool,

    /// Train using class condition
    #[arg(long = "y_condition")]
    pub y_condition: bool,

    /// Weight for class condition loss
    #[arg(long = "y_weight", default_value = "0.01")]
    pub y_weight: f64,

    /// Max gradient value (clip above - 0 for off)
    #[arg(long = "max_grad_clip", default_value = "0")]
    pub max_grad_clip: f64,

    /// Max norm of gradient (clip above - 0 for off)
    #[arg(long = "max_grad_norm", default_value = "0")]
    pub max_grad_norm: f64,

    /// Number of data loading workers
    #[arg(long = "n_workers", default_value = "6")]
    pub n_workers: usize,

    /// Batch size used during training
    #[arg(long = "batch_size", default_value = "4")]
    pub batch_size: usize,

    /// Batch size used during evaluation
    #[arg(long = "eval_batch_size", default_value = "8")]
    pub eval_batch_size: usize,

    /// Number of epochs to train for
    #[arg(long = "epochs", default_value = "20")]
    pub epochs: usize,

    /// Learning rate
    #[arg(long = "lr", default_value = "5e-4")]
    pub lr: f64,

    /// Epochs over which the learning rate warms up linearly from zero
    #[arg(long = "warmup", default_value = "5")]
    pub warmup: f64,

    /// Number of batches to use for Act Norm initialisation
    #[arg(long = "n_init_batches", default_value = "8")]
    pub n_init_batches: usize,

    /// Disables the GPU backend
    #[arg(long = "no_cuda", action = ArgAction::SetFalse)]
    pub cuda: bool,

    // I/O
    /// Name of model and directory to output logs and model checkpoints
    #[arg(long = "name", default_value = "output/")]
    pub name: String,

    /// Remove output directory before starting
    #[arg(long = "fresh")]
    #[serde(skip)]
    pub fresh: bool,

    /// Path to model to load for continuing training
    #[arg(long = "saved_model", default_value = "")]
    pub saved_model: String,

    /// Path to optimizer to load for continuing training
    #[arg(long = "saved_optimizer", default_value = "")]
    pub saved_optimizer: String,

    /// Manual seed (0 picks one at random)
    #[arg(long = "seed", default_value = "0")]
    pub seed: u64,

    /// Output directory for saved results
    #[arg(long = "output_dir")]
    pub output_dir: Option<PathBuf>,
}

impl Options {
    /// Directory every artefact of this run is written to.
    ///
    /// Only meaningful after [`prepare_output_dir`] resolved the default.
    pub fn output_dir(&self) -> PathBuf {
        self.output_dir
            .clone()
            .unwrap_or_else(|| Path::new(RESULTS_DIR).join(&self.name))
    }

    pub fn saved_model(&self) -> Option<&Path> {
        non_empty_path(&self.saved_model)
    }

    pub fn saved_optimizer(&self) -> Option<&Path> {
        non_empty_path(&self.saved_optimizer)
    }

    /// Reject settings the flow cannot be built with.
    pub fn validate(&self) -> Result<(), GlowError> {
        let invalid = |msg: String| Err(GlowError::InvalidConfig(msg));

        if self.dataset.is_empty() {
            return invalid("at least one --dataset is required".into());
        }
        if self.k == 0 || self.l == 0 {
            return invalid(format!("K and L must be positive (K={}, L={})", self.k, self.l));
        }
        let factor = 1usize << self.l;
        if self.patch_size == 0 || self.patch_size % factor != 0 {
            return invalid(format!(
                "patch_size {} must be a positive multiple of 2^L = {}",
                self.patch_size, factor
            ));
        }
        if self.hidden_channels == 0 {
            return invalid("hidden_channels must be positive".into());
        }
        if self.batch_size == 0 || self.eval_batch_size == 0 {
            return invalid("batch sizes must be positive".into());
        }
        if self.n_init_batches == 0 {
            return invalid("n_init_batches must be positive".into());
        }
        if self.max_grad_clip < 0.0 || self.max_grad_norm < 0.0 {
            return invalid("gradient clipping thresholds cannot be negative".into());
        }
        if self.lr <= 0.0 {
            return invalid(format!("learning rate must be positive, got {}", self.lr));
        }
        Ok(())
    }
}

fn non_empty_path(s: &str) -> Option<&Path> {
    if s.trim().is_empty() {
        None
    } else {
        Some(Path::new(s))
    }
}

/// Resolve the output directory and create it, wiping it first when `fresh` is set.
pub fn prepare_output_dir(options: &mut Options) -> Result<PathBuf> {
    fs::create_dir_all(RESULTS_DIR)
        .with_context(|| format!("Failed to create '{RESULTS_DIR}'"))?;

    let dir = options.output_dir();
    options.output_dir = Some(dir.clone());

    if dir.exists() && options.fresh {
        tracing::info!("Removing existing output directory {}", dir.display());
        fs::remove_dir_all(&dir)
            .with_context(|| format!("Failed to remove '{}'", dir.display()))?;
    }
    fs::create_dir_all(&dir).with_context(|| format!("Failed to create '{}'", dir.display()))?;

    Ok(dir)
}

/// Write all options except `fresh` to `hparams.json`, sorted, 4-space indented.
pub fn write_hparams(options: &Options, dir: &Path) -> Result<PathBuf> {
    // serde_json::Map is ordered by key unless `preserve_order` is enabled
    let value = serde_json::to_value(options).context("Failed to serialize options")?;

    let mut buf = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
    value.serialize(&mut ser).context("Failed to format hparams")?;

    let path = dir.join("hparams.json");
    fs::write(&path, buf).with_context(|| format!("Failed to write '{}'", path.display()))?;
    Ok(path)
}

/// Seed 0 means "pick one"; the choice is logged so a run can be repeated.
pub fn resolve_seed(seed: u64) -> u64 {
    let seed = if seed == 0 {
        use rand::Rng;
        rand::thread_rng().gen_range(1..=10_000)
    } else {
        seed
    };
    tracing::info!("Using seed: {}", seed);
    seed
}
