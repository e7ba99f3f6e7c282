use std::path::Path;

use anyhow::{anyhow, Context, Result};
use burn::tensor::{backend::Backend, Tensor};
use image::{GrayImage, RgbImage};

use crate::config::{GRID_NROW, GRID_PADDING};

/// Byte images in `[N, C, H, W]` order
#[derive(Debug, Clone, PartialEq)]
pub struct ImageBatch {
    pub data: Vec<u8>,
    pub dims: [usize; 4],
}

impl ImageBatch {
    pub fn new(data: Vec<u8>, dims: [usize; 4]) -> Result<Self> {
        let expected: usize = dims.iter().product();
        if data.len() != expected {
            return Err(anyhow!(
                "image batch {:?} needs {} bytes, got {}",
                dims,
                expected,
                data.len()
            ));
        }
        Ok(Self { data, dims })
    }

    /// First `n` images only.
    pub fn take(&self, n: usize) -> Self {
        let [count, c, h, w] = self.dims;
        let n = n.min(count);
        Self {
            data: self.data[..n * c * h * w].to_vec(),
            dims: [n, c, h, w],
        }
    }

    /// Single channel of every image, `[N, 1, H, W]`.
    pub fn channel(&self, channel: usize) -> Self {
        let [n, c, h, w] = self.dims;
        let plane = h * w;
        let mut data = Vec::with_capacity(n * plane);
        for i in 0..n {
            let start = (i * c + channel) * plane;
            data.extend_from_slice(&self.data[start..start + plane]);
        }
        Self {
            data,
            dims: [n, 1, h, w],
        }
    }
}

/// Tile images into one canvas, `nrow` images per row, zero-filled padding
/// around and between them.
///
/// Returns the canvas as `(channels, height, width, CHW bytes)`.
pub fn make_grid(batch: &ImageBatch, nrow: usize, padding: usize) -> (usize, usize, usize, Vec<u8>) {
    let [n, c, h, w] = batch.dims;
    let xmaps = nrow.min(n).max(1);
    let ymaps = n.div_ceil(xmaps);
    let cell_h = h + padding;
    let cell_w = w + padding;
    let height = ymaps * cell_h + padding;
    let width = xmaps * cell_w + padding;

    let mut canvas = vec![0u8; c * height * width];
    for k in 0..n {
        let (gy, gx) = (k / xmaps, k % xmaps);
        let top = gy * cell_h + padding;
        let left = gx * cell_w + padding;
        for ch in 0..c {
            for y in 0..h {
                let src = ((k * c + ch) * h + y) * w;
                let dst = (ch * height + top + y) * width + left;
                canvas[dst..dst + w].copy_from_slice(&batch.data[src..src + w]);
            }
        }
    }
    (c, height, width, canvas)
}

/// Save a sample grid as PNG: gray for one channel, RGB for three.
pub fn save_grid(batch: &ImageBatch, path: &Path) -> Result<()> {
    let (c, height, width, canvas) = make_grid(batch, GRID_NROW, GRID_PADDING);
    let plane = height * width;

    let saved = match c {
        1 => GrayImage::from_raw(width as u32, height as u32, canvas)
            .ok_or_else(|| anyhow!("Failed to build gray grid buffer"))?
            .save(path),
        3 => {
            let mut interleaved = Vec::with_capacity(3 * plane);
            for i in 0..plane {
                interleaved.extend([canvas[i], canvas[plane + i], canvas[2 * plane + i]]);
            }
            RgbImage::from_raw(width as u32, height as u32, interleaved)
                .ok_or_else(|| anyhow!("Failed to build RGB grid buffer"))?
                .save(path)
        }
        other => return Err(anyhow!("cannot save a grid with {other} channels")),
    };
    saved.with_context(|| format!("Failed to save sample grid '{}'", path.display()))
}

/// One-hot labels cycling through every class, `num_samples` rows.
pub fn cyclic_onehot<B: Backend>(num_classes: usize, num_samples: usize, device: &B::Device) -> Tensor<B, 2> {
    let mut data = vec![0.0f32; num_samples * num_classes];
    if num_classes > 0 {
        for row in 0..num_samples {
            data[row * num_classes + row % num_classes] = 1.0;
        }
    }
    Tensor::<B, 1>::from_floats(data.as_slice(), device).reshape([num_samples, num_classes])
}
