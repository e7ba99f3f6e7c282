use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::nn::sampling::{save_grid, ImageBatch};

/// One line of `scalars.jsonl`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalarEvent {
    pub tag: String,
    pub step: usize,
    pub value: f64,
    pub wall_time: f64,
}

/// One line of `images.jsonl`; `path` is relative to the log directory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageEvent {
    pub tag: String,
    pub step: usize,
    pub path: PathBuf,
    pub wall_time: f64,
}

/// Append-only training log: scalars and sample grids keyed by step.
pub struct SummaryWriter {
    dir: PathBuf,
    scalars: BufWriter<File>,
    images: BufWriter<File>,
}

impl SummaryWriter {
    pub fn new(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir.join("images"))
            .with_context(|| format!("Failed to create log directory '{}'", dir.display()))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            scalars: append(&dir.join("scalars.jsonl"))?,
            images: append(&dir.join("images.jsonl"))?,
        })
    }

    pub fn add_scalar(&mut self, tag: &str, value: f64, step: usize) -> Result<()> {
        let event = ScalarEvent {
            tag: tag.to_string(),
            step,
            value,
            wall_time: wall_time(),
        };
        write_line(&mut self.scalars, &event)
    }

    /// Save `batch` as a grid PNG and record it.
    pub fn add_image(&mut self, tag: &str, batch: &ImageBatch, step: usize) -> Result<PathBuf> {
        let file = format!("{}_{}.png", sanitize(tag), step);
        let relative = Path::new("images").join(file);
        save_grid(batch, &self.dir.join(&relative))?;

        let event = ImageEvent {
            tag: tag.to_string(),
            step,
            path: relative.clone(),
            wall_time: wall_time(),
        };
        write_line(&mut self.images, &event)?;
        Ok(relative)
    }

    pub fn flush(&mut self) -> Result<()> {
        self.scalars.flush().context("Failed to flush scalar log")?;
        self.images.flush().context("Failed to flush image log")?;
        Ok(())
    }

    pub fn close(mut self) -> Result<()> {
        self.flush()
    }
}

fn append(path: &Path) -> Result<BufWriter<File>> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open '{}'", path.display()))?;
    Ok(BufWriter::new(file))
}

fn write_line<T: Serialize>(out: &mut BufWriter<File>, event: &T) -> Result<()> {
    serde_json::to_writer(&mut *out, event).context("Failed to serialize summary event")?;
    out.write_all(b"\n").context("Failed to write summary event")?;
    Ok(())
}

fn wall_time() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1e6
}

fn sanitize(tag: &str) -> String {
    tag.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalars_are_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = SummaryWriter::new(dir.path()).unwrap();
        writer.add_scalar("Total_loss", 3.5, 50).unwrap();
        writer.add_scalar("Total_loss", 3.25, 100).unwrap();
        writer.close().unwrap();

        let text = fs::read_to_string(dir.path().join("scalars.jsonl")).unwrap();
        let events: Vec<ScalarEvent> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].tag, "Total_loss");
        assert_eq!(events[1].step, 100);
        assert_eq!(events[1].value, 3.25);
        assert!(events[0].wall_time > 0.0);
    }

    #[test]
    fn test_add_image_writes_grid_and_record() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = SummaryWriter::new(dir.path()).unwrap();
        let batch = ImageBatch::new(vec![200; 2 * 3 * 4 * 4], [2, 3, 4, 4]).unwrap();
        let rel = writer.add_image("Sample output", &batch, 50).unwrap();
        writer.flush().unwrap();

        assert_eq!(rel, Path::new("images").join("Sample_output_50.png"));
        assert!(dir.path().join(&rel).exists());
        let line = fs::read_to_string(dir.path().join("images.jsonl")).unwrap();
        let event: ImageEvent = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(event.step, 50);
        assert_eq!(event.path, rel);
    }

    #[test]
    fn test_reopening_appends() {
        let dir = tempfile::tempdir().unwrap();
        for step in [1, 2] {
            let mut writer = SummaryWriter::new(dir.path()).unwrap();
            writer.add_scalar("x", 1.0, step).unwrap();
            writer.close().unwrap();
        }
        let text = fs::read_to_string(dir.path().join("scalars.jsonl")).unwrap();
        assert_eq!(text.lines().count(), 2);
    }
}
