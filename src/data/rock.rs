use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use image::{imageops::FilterType, DynamicImage};
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::config::Options;
use crate::error::GlowError;

const IMAGE_EXTENSIONS: [&str; 7] = ["png", "jpg", "jpeg", "tif", "tiff", "bmp", "gif"];

/// Class name used when a split has no class sub-directories
const SINGLE_CLASS: &str = "rock";

/// One patch ready for batching
#[derive(Debug, Clone, PartialEq)]
pub struct RockSample {
    /// Channel-major pixels in `[0, 1]`, `channels * patch * patch` long
    pub pixels: Vec<f32>,
    pub label: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    Train,
    Test,
}

impl Split {
    fn dir_name(self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Test => "test",
        }
    }
}

/// Same image across every modality
#[derive(Debug, Clone)]
struct RockItem {
    paths: Vec<PathBuf>,
    label: usize,
}

/// Patches cut from the rock images of one split.
///
/// Train items get a random crop (plus flips and a 90° turn when augmenting),
/// test items a center crop.
#[derive(Debug)]
pub struct RockDataset {
    items: Vec<RockItem>,
    modalities: Vec<String>,
    classes: Vec<String>,
    split: Split,
    patch_size: usize,
    binary: bool,
    augment: bool,
    seed: u64,
    draws: AtomicU64,
}

impl RockDataset {
    pub fn new(
        root: &Path,
        modalities: &[String],
        split: Split,
        patch_size: usize,
        binary: bool,
        augment: bool,
        seed: u64,
    ) -> Result<Self> {
        let (first, rest) = modalities
            .split_first()
            .ok_or_else(|| GlowError::Dataset("no modality given".into()))?;

        let (classes, primary) = discover(&root.join(first).join(split.dir_name()))?;
        if primary.is_empty() {
            return Err(GlowError::Dataset(format!(
                "no images under {}",
                root.join(first).join(split.dir_name()).display()
            ))
            .into());
        }

        let mut lookups = Vec::with_capacity(rest.len());
        for modality in rest {
            let (_, found) = discover(&root.join(modality).join(split.dir_name()))?;
            let by_key: HashMap<(usize, String), PathBuf> = found
                .into_iter()
                .map(|(path, label)| ((label, file_stem(&path)), path))
                .collect();
            lookups.push((modality, by_key));
        }

        let mut items = Vec::with_capacity(primary.len());
        for (path, label) in primary {
            let dims = image::image_dimensions(&path)
                .with_context(|| format!("Failed to read image header of '{}'", path.display()))?;
            let mut paths = vec![path.clone()];
            for (modality, by_key) in &lookups {
                let other = by_key.get(&(label, file_stem(&path))).ok_or_else(|| {
                    GlowError::Dataset(format!(
                        "modality '{}' has no counterpart for '{}'",
                        modality,
                        path.display()
                    ))
                })?;
                let other_dims = image::image_dimensions(other)
                    .with_context(|| format!("Failed to read image header of '{}'", other.display()))?;
                if other_dims != dims {
                    return Err(GlowError::Dataset(format!(
                        "'{}' is {:?} but '{}' is {:?}",
                        path.display(),
                        dims,
                        other.display(),
                        other_dims
                    ))
                    .into());
                }
                paths.push(other.clone());
            }
            items.push(RockItem { paths, label });
        }

        tracing::info!(
            "{} split: {} images, {} classes, modalities {:?}",
            split.dir_name(),
            items.len(),
            classes.len(),
            modalities
        );

        Ok(Self {
            items,
            modalities: modalities.to_vec(),
            classes,
            split,
            patch_size,
            binary,
            augment,
            seed,
            draws: AtomicU64::new(0),
        })
    }

    pub fn modalities(&self) -> &[String] {
        &self.modalities
    }

    pub fn num_modalities(&self) -> usize {
        self.modalities.len()
    }

    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    pub fn num_classes(&self) -> usize {
        self.classes.len()
    }

    /// RGB for a single modality, one gray channel per modality otherwise.
    pub fn channels(&self) -> usize {
        channels_for(self.modalities.len())
    }

    /// `(height, width, channels)` of every sample
    pub fn image_shape(&self) -> (usize, usize, usize) {
        (self.patch_size, self.patch_size, self.channels())
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Express labels against `classes` so this split agrees with another one.
    ///
    /// Every class of this split must appear in `classes`.
    pub fn relabel(mut self, classes: &[String]) -> Result<Self> {
        let mut mapping = Vec::with_capacity(self.classes.len());
        for name in &self.classes {
            let index = classes.iter().position(|c| c == name).ok_or_else(|| {
                GlowError::Dataset(format!(
                    "{} class '{}' is not one of {:?}",
                    self.split.dir_name(),
                    name,
                    classes
                ))
            })?;
            mapping.push(index);
        }
        for item in &mut self.items {
            item.label = mapping[item.label];
        }
        self.classes = classes.to_vec();
        Ok(self)
    }

    /// Decode, crop and convert sample `index`. Unreadable files are errors.
    pub fn get(&self, index: usize) -> Result<RockSample> {
        let item = self
            .items
            .get(index)
            .ok_or_else(|| GlowError::Dataset(format!("index {index} out of range")))?;

        let mut images = Vec::with_capacity(item.paths.len());
        for path in &item.paths {
            let img = image::open(path)
                .with_context(|| format!("Failed to open image '{}'", path.display()))?;
            images.push(upscale_to_patch(img, self.patch_size as u32));
        }

        let (width, height) = (images[0].width(), images[0].height());
        let patch = self.patch_size as u32;
        let view = match self.split {
            Split::Train => {
                let draw = self.draws.fetch_add(1, Ordering::Relaxed);
                let mut rng = StdRng::seed_from_u64(mix(self.seed, index as u64, draw));
                PatchView::random(&mut rng, width, height, patch, self.augment)
            }
            Split::Test => PatchView::center(width, height, patch),
        };

        let multi = images.len() > 1;
        let mut pixels = Vec::with_capacity(self.channels() * self.patch_size * self.patch_size);
        for img in images {
            let patch_img = view.apply(img);
            let planes = if multi {
                luma_planes(&patch_img)
            } else {
                rgb_planes(&patch_img)
            };
            pixels.extend(planes);
        }
        if self.binary {
            binarize(&mut pixels);
        }

        Ok(RockSample {
            pixels,
            label: item.label,
        })
    }
}

/// What the training run needs from the data layer
pub struct RockData {
    pub image_shape: (usize, usize, usize),
    pub num_classes: usize,
    pub train: RockDataset,
    pub test: RockDataset,
}

/// Build the train and test splits for the modalities named by `--dataset`.
pub fn get_rock_dataset(options: &Options, seed: u64) -> Result<RockData> {
    if options.download {
        tracing::warn!(
            "--download has no remote source; expecting data under {}",
            options.dataroot.display()
        );
    }

    let train = RockDataset::new(
        &options.dataroot,
        &options.dataset,
        Split::Train,
        options.patch_size,
        options.binary_data,
        options.augment,
        seed,
    )?;
    let test = RockDataset::new(
        &options.dataroot,
        &options.dataset,
        Split::Test,
        options.patch_size,
        options.binary_data,
        false,
        seed,
    )?
    .relabel(train.classes())?;

    Ok(RockData {
        image_shape: train.image_shape(),
        num_classes: train.num_classes(),
        train,
        test,
    })
}

pub fn channels_for(num_modalities: usize) -> usize {
    if num_modalities > 1 {
        num_modalities
    } else {
        3
    }
}

/// Sorted `(path, label)` pairs and class names found in one split directory.
fn discover(split_dir: &Path) -> Result<(Vec<String>, Vec<(PathBuf, usize)>)> {
    let (dirs, files) = list_dir(split_dir)?;

    if dirs.is_empty() {
        let items = files.into_iter().map(|p| (p, 0)).collect();
        return Ok((vec![SINGLE_CLASS.to_string()], items));
    }

    let mut classes = Vec::with_capacity(dirs.len());
    let mut items = Vec::new();
    for (label, dir) in dirs.iter().enumerate() {
        classes.push(file_name(dir));
        let (_, class_files) = list_dir(dir)?;
        items.extend(class_files.into_iter().map(|p| (p, label)));
    }
    Ok((classes, items))
}

/// Sub-directories and image files of `dir`, each sorted by name.
fn list_dir(dir: &Path) -> Result<(Vec<PathBuf>, Vec<PathBuf>)> {
    let entries =
        fs::read_dir(dir).with_context(|| format!("Failed to list '{}'", dir.display()))?;

    let mut dirs = Vec::new();
    let mut files = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.is_dir() {
            dirs.push(path);
        } else if is_image(&path) {
            files.push(path);
        }
    }
    dirs.sort();
    files.sort();
    Ok((dirs, files))
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn mix(seed: u64, index: u64, draw: u64) -> u64 {
    seed ^ index.wrapping_mul(0x9E37_79B9_7F4A_7C15) ^ draw.wrapping_mul(0xC2B2_AE3D_27D4_EB4F)
}

/// Upscale so the short side is at least `patch`, keeping the aspect ratio.
fn upscale_to_patch(img: DynamicImage, patch: u32) -> DynamicImage {
    let short = img.width().min(img.height());
    if short >= patch {
        return img;
    }
    let scale = patch as f64 / short as f64;
    let width = ((img.width() as f64 * scale).ceil() as u32).max(patch);
    let height = ((img.height() as f64 * scale).ceil() as u32).max(patch);
    img.resize_exact(width, height, FilterType::Triangle)
}

/// Crop window plus augmentation draws, shared by every modality of an item
#[derive(Debug, Clone, Copy, PartialEq)]
struct PatchView {
    x: u32,
    y: u32,
    size: u32,
    flip_h: bool,
    flip_v: bool,
    rotate: bool,
}

impl PatchView {
    fn center(width: u32, height: u32, size: u32) -> Self {
        Self {
            x: (width - size) / 2,
            y: (height - size) / 2,
            size,
            flip_h: false,
            flip_v: false,
            rotate: false,
        }
    }

    fn random<R: Rng>(rng: &mut R, width: u32, height: u32, size: u32, augment: bool) -> Self {
        let x = rng.gen_range(0..=width - size);
        let y = rng.gen_range(0..=height - size);
        let (flip_h, flip_v, rotate) = if augment {
            (rng.gen_bool(0.5), rng.gen_bool(0.5), rng.gen_bool(0.5))
        } else {
            (false, false, false)
        };
        Self {
            x,
            y,
            size,
            flip_h,
            flip_v,
            rotate,
        }
    }

    fn apply(&self, img: DynamicImage) -> DynamicImage {
        let mut out = img.crop_imm(self.x, self.y, self.size, self.size);
        if self.flip_h {
            out = out.fliph();
        }
        if self.flip_v {
            out = out.flipv();
        }
        if self.rotate {
            out = out.rotate90();
        }
        out
    }
}

fn rgb_planes(img: &DynamicImage) -> Vec<f32> {
    let rgb = img.to_rgb8();
    let n = (rgb.width() * rgb.height()) as usize;
    let mut out = vec![0.0; 3 * n];
    for (i, px) in rgb.pixels().enumerate() {
        for c in 0..3 {
            out[c * n + i] = px.0[c] as f32 / 255.0;
        }
    }
    out
}

fn luma_planes(img: &DynamicImage) -> Vec<f32> {
    img.to_luma8().pixels().map(|px| px.0[0] as f32 / 255.0).collect()
}

fn binarize(pixels: &mut [f32]) {
    for v in pixels.iter_mut() {
        *v = if *v > 0.0 { 1.0 } else { 0.0 };
    }
}
