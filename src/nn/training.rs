use std::fs;
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use burn::{
    backend::{Autodiff, NdArray, Wgpu},
    module::{AutodiffModule, Module},
    optim::{adaptor::OptimizerAdaptor, GradientsParams, Optimizer},
    tensor::{
        backend::{AutodiffBackend, Backend},
        Tensor,
    },
};
use indicatif::{ProgressBar, ProgressStyle};
use rand::{rngs::StdRng, SeedableRng};

use crate::config::{
    self, Options, CHECKPOINTS_KEPT, CHECKPOINT_PREFIX, GRID_IMAGES, NUM_SAMPLES,
    RUNNING_AVERAGE_ALPHA, SAMPLE_EVERY, SAMPLE_TEMPERATURE, WEIGHT_DECAY,
};
use crate::data::get_rock_dataset;
use crate::engine::{Average, DataSource, Engine, Event, RunningAverage, State, Timer};
use crate::error::GlowError;
use crate::nn::dataset::{postprocess, Loader, RockBatch, RockBatcher};
use crate::nn::gpu::{probe_gpu, ComputeMonitor};
use crate::nn::loss::{compute_loss, compute_loss_y, LossValues, Reduction};
use crate::nn::model::{GlowConfig, GlowModel};
use crate::nn::optim::{clip_grad_norm, clip_grad_value, Adamax, AdamaxConfig, WarmupSchedule};
use crate::nn::persistence::{resume, CheckpointSaver};
use crate::nn::sampling::{cyclic_onehot, save_grid, ImageBatch};
use crate::summary::SummaryWriter;

/// GPU training backend: Wgpu with autodiff
pub type GpuBackend = Autodiff<Wgpu>;

/// CPU training backend: NdArray with autodiff
pub type CpuBackend = Autodiff<NdArray>;

type GlowOptimizer<B> = OptimizerAdaptor<Adamax, GlowModel<B>, B>;

/// Labels are single-class; the multi-label loss is never selected from the command line
const MULTI_CLASS: bool = false;

/// Run the full training pipeline, selecting GPU or CPU backend.
pub fn train(options: Options, seed: u64) -> Result<()> {
    let gpu = if options.cuda { probe_gpu() } else { None };

    match gpu {
        Some(info) => {
            tracing::info!("Starting GPU training with Wgpu backend on {}", info.name);
            let label = format!("WGPU GPU: {}", info.name);
            train_impl::<GpuBackend>(options, seed, &label, true)
        }
        None => {
            if options.cuda {
                tracing::info!("No NVIDIA GPU detected, training on the CPU");
            }
            tracing::info!("Starting CPU training with NdArray backend");
            train_impl::<CpuBackend>(options, seed, "NdArray (CPU) + Autodiff", false)
        }
    }
}

/// Model, optimizer and sinks shared by every training handler
pub struct Trainer<B: AutodiffBackend> {
    model: GlowModel<B>,
    optim: GlowOptimizer<B>,
    schedule: WarmupSchedule,
    options: Options,
    output_dir: PathBuf,
    train: Loader<B>,
    test: Loader<B::InnerBackend>,
    modalities: Vec<String>,
    num_classes: usize,
    writer: SummaryWriter,
    saver: CheckpointSaver,
    timer: Timer,
    monitor: ComputeMonitor,
    epoch_started: Instant,
    progress: Option<ProgressBar>,
    resume_iter: Option<usize>,
}

impl<B: AutodiffBackend> Trainer<B> {
    fn train_step(&mut self, batch: RockBatch<B>) -> Result<LossValues> {
        let y = self.options.y_condition.then(|| batch.targets.clone());
        let out = self.model.forward(batch.images, y.clone());
        let losses = match (y, out.y_logits) {
            (Some(y), Some(logits)) => compute_loss_y(
                out.nll,
                logits,
                self.options.y_weight,
                y,
                MULTI_CLASS,
                Reduction::Mean,
            ),
            _ => compute_loss(out.nll, Reduction::Mean),
        };
        let values = losses.values()?;

        let grads = losses.total_loss.backward();
        let mut grads = GradientsParams::from_grads(grads, &self.model);
        if self.options.max_grad_clip > 0.0 {
            grads = clip_grad_value::<B, _>(&self.model, grads, self.options.max_grad_clip);
        }
        if self.options.max_grad_norm > 0.0 {
            let (clipped, _) = clip_grad_norm::<B, _>(&self.model, grads, self.options.max_grad_norm);
            grads = clipped;
        }

        self.model = self.optim.step(self.schedule.lr(), self.model.clone(), grads);
        Ok(values)
    }

    fn resume_counters(&mut self, state: &mut State<LossValues>) -> Result<()> {
        if let Some(iter) = self.resume_iter {
            state.epoch = iter / state.epoch_length;
            state.iteration = iter;
            tracing::info!("Resuming at epoch {} (iteration {})", state.epoch, state.iteration);
        }
        Ok(())
    }

    /// Data-dependent actnorm init from the first `n_init_batches` train batches.
    fn init_actnorm(&mut self) -> Result<()> {
        if self.resume_iter.is_some() {
            return Ok(());
        }
        let n = self.options.n_init_batches;
        let images = self
            .train
            .iter()
            .take(n)
            .map(|b| b.map(|b| b.images))
            .collect::<Result<Vec<Tensor<B, 4>>>>()?;
        let got: usize = images.iter().map(|x| x.dims()[0]).sum();
        let expected = n * self.options.batch_size;
        if images.is_empty() || got != expected {
            return Err(GlowError::InitBatchMismatch { expected, got }.into());
        }

        self.model = self.model.clone().initialize(Tensor::cat(images, 0));
        tracing::info!("Actnorm initialised on {} samples", got);
        Ok(())
    }

    fn sample(&mut self, state: &State<LossValues>) -> Result<()> {
        let dir = self.output_dir.join("example_imgs");
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create '{}'", dir.display()))?;

        let device = <B::InnerBackend as Backend>::Device::default();
        let model = self.model.valid();
        let y = self
            .options
            .y_condition
            .then(|| cyclic_onehot::<B::InnerBackend>(self.num_classes, NUM_SAMPLES, &device));
        let images = model.reverse(y, SAMPLE_TEMPERATURE, NUM_SAMPLES, &device)?;
        let dims = images.dims();
        let batch = ImageBatch::new(postprocess(images, config::N_BITS)?, dims)?.take(GRID_IMAGES);

        let iter = state.iteration;
        if self.modalities.len() > 1 {
            for (i, modality) in self.modalities.iter().enumerate() {
                let grid = batch.channel(i);
                save_grid(&grid, &dir.join(format!("{iter}_{modality}.png")))?;
                self.writer
                    .add_image(&format!("Sample output {modality}"), &grid, iter)?;
            }
        } else {
            save_grid(&batch, &dir.join(format!("{iter}.png")))?;
            self.writer.add_image("Sample output", &batch, iter)?;
        }

        if let Some(loss) = state.metric("total_loss") {
            self.writer.add_scalar("Total_loss", loss, iter)?;
        }
        self.writer.flush()
    }

    fn checkpoint(&mut self, state: &State<LossValues>) -> Result<()> {
        self.saver.save(
            &self.model,
            &self.optim,
            state.epoch,
            state.iteration,
            self.schedule.lr(),
        )?;
        Ok(())
    }

    fn evaluate(&mut self, state: &State<LossValues>) -> Result<()> {
        let mut ctx = EvalContext {
            model: self.model.valid(),
            y_condition: self.options.y_condition,
            y_weight: self.options.y_weight,
        };
        let mut evaluator = evaluator::<B::InnerBackend>(self.options.y_condition);
        let eval_state = evaluator.run(&mut ctx, &self.test, 1)?;
        self.schedule.step();

        let losses: Vec<String> = evaluator
            .metric_names()
            .iter()
            .filter_map(|name| eval_state.metric(name).map(|v| format!("{name}: {v:.2}")))
            .collect();
        tracing::info!("Validation Results - Epoch: {} {}", state.epoch, losses.join(", "));
        Ok(())
    }

    fn print_times(&mut self, state: &State<LossValues>) -> Result<()> {
        tracing::info!(
            "Epoch {} done. Time per batch: {:.3}[s]",
            state.epoch,
            self.timer.value()
        );
        self.timer.reset();

        let epoch_ms = self.epoch_started.elapsed().as_millis() as u64;
        let samples = state.epoch_length * self.options.batch_size;
        self.monitor
            .snapshot(epoch_ms, samples, self.model.num_params())
            .log();
        Ok(())
    }

    fn start_progress(&mut self, state: &State<LossValues>) -> Result<()> {
        let pb = ProgressBar::new(state.epoch_length as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("Epoch [{prefix}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")?
                .progress_chars("#>-"),
        );
        pb.set_prefix(format!("{}/{}", state.epoch, state.max_epochs));
        self.progress = Some(pb);
        self.epoch_started = Instant::now();
        Ok(())
    }

    fn update_progress(&mut self, state: &State<LossValues>, metric_names: &[&str]) -> Result<()> {
        if let Some(pb) = &self.progress {
            let msg: Vec<String> = metric_names
                .iter()
                .filter_map(|name| state.metric(name).map(|v| format!("{name}={v:.2e}")))
                .collect();
            pb.set_message(msg.join(" "));
            pb.inc(1);
        }
        Ok(())
    }

    fn finish_progress(&mut self) -> Result<()> {
        if let Some(pb) = self.progress.take() {
            pb.finish_and_clear();
        }
        Ok(())
    }
}

/// Evaluation only needs the inference model
struct EvalContext<B: Backend> {
    model: GlowModel<B>,
    y_condition: bool,
    y_weight: f64,
}

fn eval_step<B: Backend>(ctx: &mut EvalContext<B>, batch: RockBatch<B>) -> Result<LossValues> {
    let y = ctx.y_condition.then(|| batch.targets.clone());
    let out = ctx.model.forward(batch.images, y.clone());
    let losses = match (y, out.y_logits) {
        (Some(y), Some(logits)) => {
            compute_loss_y(out.nll, logits, ctx.y_weight, y, MULTI_CLASS, Reduction::None)
        }
        _ => compute_loss(out.nll, Reduction::None),
    };
    losses.values()
}

/// Per-sample mean of `total_loss` (and `nll` when class-conditional) over the test split.
fn evaluator<B: Backend>(y_condition: bool) -> Engine<EvalContext<B>, RockBatch<B>, LossValues> {
    let mut engine = Engine::new(|ctx: &mut EvalContext<B>, _state: &State<LossValues>, batch| {
        eval_step(ctx, batch)
    });
    engine.attach("total_loss", Average::new(|o: &LossValues| o.total_loss.clone()));
    if y_condition {
        engine.attach("nll", Average::new(|o: &LossValues| o.nll.clone()));
    }
    engine
}

fn trainer_engine<B: AutodiffBackend>(
    y_condition: bool,
) -> Engine<Trainer<B>, RockBatch<B>, LossValues> {
    let mut engine = Engine::new(|t: &mut Trainer<B>, _state: &State<LossValues>, batch| {
        t.train_step(batch)
    });

    engine.on(Event::EpochCompleted, |t: &mut Trainer<B>, _s: &mut State<LossValues>| {
        t.finish_progress()
    });
    engine.on(Event::EpochCompleted, |t: &mut Trainer<B>, s: &mut State<LossValues>| {
        t.checkpoint(s)
    });

    engine.attach(
        "total_loss",
        RunningAverage::new(RUNNING_AVERAGE_ALPHA, |o: &LossValues| o.total_loss.clone()),
    );
    let monitored: &'static [&'static str] = if y_condition {
        engine.attach(
            "nll",
            RunningAverage::new(RUNNING_AVERAGE_ALPHA, |o: &LossValues| o.nll.clone()),
        );
        &["total_loss", "nll"]
    } else {
        &["total_loss"]
    };

    engine.on(Event::EpochStarted, |t: &mut Trainer<B>, s: &mut State<LossValues>| {
        t.start_progress(s)
    });
    engine.on(Event::IterationCompleted, move |t: &mut Trainer<B>, s: &mut State<LossValues>| {
        t.update_progress(s, monitored)
    });

    engine.on(Event::Started, |t: &mut Trainer<B>, s: &mut State<LossValues>| {
        t.resume_counters(s)
    });
    engine.on(Event::Started, |t: &mut Trainer<B>, _s: &mut State<LossValues>| {
        t.init_actnorm()
    });

    engine.on(
        Event::IterationCompleted.every(SAMPLE_EVERY),
        |t: &mut Trainer<B>, s: &mut State<LossValues>| t.sample(s),
    );

    engine.on(Event::EpochCompleted, |t: &mut Trainer<B>, s: &mut State<LossValues>| {
        t.evaluate(s)
    });

    engine.on(Event::EpochStarted, |t: &mut Trainer<B>, _s: &mut State<LossValues>| {
        t.timer.reset();
        Ok(())
    });
    engine.on(Event::IterationStarted, |t: &mut Trainer<B>, _s: &mut State<LossValues>| {
        t.timer.resume();
        Ok(())
    });
    engine.on(Event::IterationCompleted, |t: &mut Trainer<B>, _s: &mut State<LossValues>| {
        t.timer.step();
        Ok(())
    });

    engine.on(Event::EpochCompleted, |t: &mut Trainer<B>, s: &mut State<LossValues>| {
        t.print_times(s)
    });

    engine
}

/// Load the data, build model and optimizer (resuming when asked) and the sinks.
fn setup<B: AutodiffBackend>(
    options: Options,
    seed: u64,
    backend_name: &str,
    using_gpu: bool,
) -> Result<Trainer<B>> {
    let device = B::Device::default();
    let inner_device = <B::InnerBackend as Backend>::Device::default();
    B::seed(seed);
    let mut rng = StdRng::seed_from_u64(seed);

    let data = get_rock_dataset(&options, seed)?;
    let image_shape = data.image_shape;
    let num_classes = data.num_classes;
    let modalities = data.train.modalities().to_vec();

    let train = Loader::train(
        RockBatcher::<B>::new(device.clone(), image_shape, num_classes),
        data.train,
        options.batch_size,
        options.n_workers,
        seed,
    )?;
    let test = Loader::eval(
        RockBatcher::<B::InnerBackend>::new(inner_device, image_shape, num_classes),
        data.test,
        options.eval_batch_size,
        options.n_workers,
    )?;
    if train.len() == 0 {
        return Err(GlowError::Dataset(format!(
            "{} training images cannot fill a batch of {}",
            train.num_items(),
            options.batch_size
        ))
        .into());
    }

    let output_dir = options.output_dir();
    let writer = SummaryWriter::new(&output_dir.join("logging"))?;
    let saver = CheckpointSaver::new(&output_dir.join("checkpoints"), CHECKPOINT_PREFIX, CHECKPOINTS_KEPT)?;

    let model = GlowConfig::from_options(&options, image_shape, num_classes).init::<B, _>(&device, &mut rng);
    let optim = AdamaxConfig::new()
        .with_weight_decay(WEIGHT_DECAY)
        .init::<B, GlowModel<B>>();

    let (model, optim, resume_iter) = match options.saved_model() {
        Some(path) => {
            let resumed = resume(model, optim, path, options.saved_optimizer(), &device)?;
            (resumed.model, resumed.optim, Some(resumed.iteration))
        }
        None => (model, optim, None),
    };
    let schedule = WarmupSchedule::new(options.lr, options.warmup)
        .at_epoch(resume_iter.map(|it| it / train.len()).unwrap_or(0));

    tracing::info!(
        "Glow with {} parameters, image shape {:?}, {} classes, {} train / {} test images",
        model.num_params(),
        image_shape,
        num_classes,
        train.num_items(),
        test.num_items()
    );

    Ok(Trainer {
        model,
        optim,
        schedule,
        options,
        output_dir,
        train,
        test,
        modalities,
        num_classes,
        writer,
        saver,
        timer: Timer::new(),
        monitor: ComputeMonitor::new(backend_name, using_gpu),
        epoch_started: Instant::now(),
        progress: None,
        resume_iter,
    })
}

/// Generic training implementation that works with any autodiff backend.
fn train_impl<B: AutodiffBackend>(
    options: Options,
    seed: u64,
    backend_name: &str,
    using_gpu: bool,
) -> Result<()> {
    let epochs = options.epochs;
    let mut engine = trainer_engine::<B>(options.y_condition);
    let mut trainer = setup::<B>(options, seed, backend_name, using_gpu)?;
    let train = trainer.train.clone();

    let state = engine.run(&mut trainer, &train, epochs)?;
    tracing::info!(
        "Training finished after {} epochs ({} iterations)",
        state.epoch,
        state.iteration
    );
    trainer.writer.close()
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use image::{GrayImage, Luma, Rgb, RgbImage};

    fn write_split(root: &std::path::Path, split: &str, class: &str, n: usize) {
        for i in 0..n {
            let path = root.join(format!("ct/{split}/{class}/{i}.png"));
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            RgbImage::from_fn(8, 8, |x, y| Rgb([(x * 30) as u8, (y * 30) as u8, (i * 40) as u8]))
                .save(path)
                .unwrap();
        }
    }

    /// Small-model options; a flag given in `extra` replaces its default here.
    fn options(root: &std::path::Path, out: &std::path::Path, extra: &[&str]) -> Options {
        let mut argv = vec![
            "rock-glow".to_string(),
            "--dataroot".into(),
            root.display().to_string(),
            "--output_dir".into(),
            out.display().to_string(),
            "--no_cuda".into(),
        ];
        let defaults = [
            ("--dataset", "ct"),
            ("--patch_size", "8"),
            ("--K", "1"),
            ("--L", "2"),
            ("--hidden_channels", "4"),
            ("--batch_size", "2"),
            ("--eval_batch_size", "2"),
            ("--n_init_batches", "1"),
            ("--n_workers", "1"),
            ("--epochs", "1"),
        ];
        for (flag, value) in defaults {
            if !extra.contains(&flag) {
                argv.push(flag.to_string());
                argv.push(value.to_string());
            }
        }
        argv.extend(extra.iter().map(|s| s.to_string()));
        Options::try_parse_from(argv).unwrap()
    }

    fn write_gray_split(root: &std::path::Path, modality: &str, split: &str, class: &str, n: usize) {
        for i in 0..n {
            let path = root.join(format!("{modality}/{split}/{class}/{i}.png"));
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            GrayImage::from_fn(4, 4, |x, y| Luma([(x * 50 + y * 12 + i as u32 * 2) as u8]))
                .save(path)
                .unwrap();
        }
    }

    fn read_lines(path: &std::path::Path) -> Vec<serde_json::Value> {
        fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn test_one_epoch_writes_checkpoint_and_logs() {
        let data = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        write_split(data.path(), "train", "a", 4);
        write_split(data.path(), "test", "a", 3);

        train_impl::<CpuBackend>(options(data.path(), out.path(), &[]), 7, "cpu", false).unwrap();

        let ck = out.path().join("checkpoints");
        assert!(ck.join("glow_model_2.mpk.gz").exists());
        assert!(ck.join("glow_optimizer_2.mpk.gz").exists());
        assert!(ck.join("glow_checkpoint_2.json").exists());
        assert!(out.path().join("logging/scalars.jsonl").exists());
    }

    #[test]
    fn test_resume_continues_from_checkpoint_iteration() {
        let data = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        write_split(data.path(), "train", "a", 4);
        write_split(data.path(), "test", "a", 2);

        train_impl::<CpuBackend>(options(data.path(), out.path(), &[]), 7, "cpu", false).unwrap();
        let saved = out.path().join("checkpoints/glow_model_2.mpk.gz");

        let resumed = options(
            data.path(),
            out.path(),
            &["--epochs", "2", "--saved_model", &saved.display().to_string()],
        );
        train_impl::<CpuBackend>(resumed, 7, "cpu", false).unwrap();

        // epoch 1 restored from iteration 2, one more epoch of 2 batches
        assert!(out.path().join("checkpoints/glow_model_4.mpk.gz").exists());
        assert!(!out.path().join("checkpoints/glow_model_6.mpk.gz").exists());
    }

    #[test]
    fn test_too_few_images_for_a_batch() {
        let data = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        write_split(data.path(), "train", "a", 1);
        write_split(data.path(), "test", "a", 1);

        let err = train_impl::<CpuBackend>(options(data.path(), out.path(), &[]), 1, "cpu", false)
            .unwrap_err();
        assert!(err.to_string().contains("cannot fill a batch"));
    }

    #[test]
    fn test_init_batch_mismatch_is_reported() {
        let data = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        write_split(data.path(), "train", "a", 2);
        write_split(data.path(), "test", "a", 1);

        // one full batch available, three requested
        let err = train_impl::<CpuBackend>(
            options(data.path(), out.path(), &["--n_init_batches", "3"]),
            1,
            "cpu",
            false,
        )
        .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<GlowError>(),
            Some(GlowError::InitBatchMismatch { expected: 6, got: 2 })
        ));
    }

    #[test]
    fn test_evaluator_reports_per_sample_mean() {
        let device = Default::default();
        let mut rng = StdRng::seed_from_u64(0);
        let opts = Options::try_parse_from([
            "rock-glow", "--dataset", "ct", "--patch_size", "8", "--K", "1", "--L", "1",
            "--hidden_channels", "4",
        ])
        .unwrap();
        let model = GlowConfig::from_options(&opts, (8, 8, 3), 1).init::<NdArray, _>(&device, &mut rng);

        struct Batches(Vec<RockBatch<NdArray>>);
        impl DataSource<RockBatch<NdArray>> for Batches {
            fn len(&self) -> usize {
                self.0.len()
            }
            fn iter(&self) -> Box<dyn Iterator<Item = Result<RockBatch<NdArray>>> + '_> {
                Box::new(self.0.iter().cloned().map(Ok))
            }
        }
        let batch = |n: usize| RockBatch {
            images: Tensor::<NdArray, 4>::zeros([n, 3, 8, 8], &device),
            targets: Tensor::<NdArray, 2>::ones([n, 1], &device),
            labels: vec![0; n],
        };

        let mut ctx = EvalContext { model, y_condition: false, y_weight: 0.0 };
        let mut engine = evaluator::<NdArray>(false);
        let state = engine.run(&mut ctx, &Batches(vec![batch(2), batch(1)]), 1).unwrap();
        let loss = state.metric("total_loss").unwrap();
        assert!(loss.is_finite());
        assert!(state.metric("nll").is_none());
        assert_eq!(state.output.unwrap().total_loss.len(), 1);
    }

    #[test]
    fn test_default_worker_count_trains_small_split() {
        let data = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        write_split(data.path(), "train", "a", 4);
        write_split(data.path(), "test", "a", 2);

        // six workers over four images still yields two full batches
        let opts = options(data.path(), out.path(), &["--n_workers", "6", "--n_init_batches", "2"]);
        train_impl::<CpuBackend>(opts, 3, "cpu", false).unwrap();
        assert!(out.path().join("checkpoints/glow_model_2.mpk.gz").exists());
    }

    #[test]
    fn test_sample_writes_grid_and_total_loss() {
        let data = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        write_split(data.path(), "train", "a", 2);
        write_split(data.path(), "test", "a", 1);

        let mut trainer =
            setup::<CpuBackend>(options(data.path(), out.path(), &["--n_workers", "0"]), 5, "cpu", false)
                .unwrap();
        let mut state = State::new(1, trainer.train.len());
        state.iteration = 50;
        state.metrics.insert("total_loss".to_string(), 4.5);
        trainer.sample(&state).unwrap();

        assert!(out.path().join("example_imgs/50.png").exists());
        let img = image::open(out.path().join("example_imgs/50.png")).unwrap();
        // 30 of 32 samples, five per row, 8 px images, 10 px padding
        assert_eq!((img.width(), img.height()), (5 * 18 + 10, 6 * 18 + 10));

        let scalars = read_lines(&out.path().join("logging/scalars.jsonl"));
        assert_eq!(scalars.len(), 1);
        assert_eq!(scalars[0]["tag"], "Total_loss");
        assert_eq!(scalars[0]["step"], 50);
        assert_eq!(scalars[0]["value"], 4.5);
        let images = read_lines(&out.path().join("logging/images.jsonl"));
        assert_eq!(images[0]["tag"], "Sample output");
    }

    #[test]
    fn test_conditional_two_modality_run_samples_each_modality() {
        let data = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        for modality in ["ct", "sem"] {
            write_gray_split(data.path(), modality, "train", "a", 25);
            write_gray_split(data.path(), modality, "train", "b", 25);
            write_gray_split(data.path(), modality, "test", "a", 1);
            write_gray_split(data.path(), modality, "test", "b", 1);
        }

        let opts = options(
            data.path(),
            out.path(),
            &[
                "--dataset", "ct", "--dataset", "sem", "--patch_size", "4", "--L", "1",
                "--batch_size", "1", "--y_condition", "--max_grad_clip", "5",
                "--max_grad_norm", "100", "--n_workers", "2",
            ],
        );
        train_impl::<CpuBackend>(opts, 11, "cpu", false).unwrap();

        // 50 batches of one: the sampling handler fires once at iteration 50
        let imgs = out.path().join("example_imgs");
        assert!(imgs.join("50_ct.png").exists());
        assert!(imgs.join("50_sem.png").exists());
        assert!(!imgs.join("50.png").exists());
        assert!(out.path().join("checkpoints/glow_model_50.mpk.gz").exists());

        let tags: Vec<String> = read_lines(&out.path().join("logging/images.jsonl"))
            .iter()
            .map(|e| e["tag"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(tags, vec!["Sample output ct", "Sample output sem"]);
        let scalars = read_lines(&out.path().join("logging/scalars.jsonl"));
        assert_eq!(scalars.len(), 1);
        assert_eq!(scalars[0]["tag"], "Total_loss");
        assert_eq!(scalars[0]["step"], 50);
    }

    #[test]
    fn test_conditional_sampling_cycles_classes() {
        let data = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        write_split(data.path(), "train", "a", 2);
        write_split(data.path(), "train", "b", 2);
        write_split(data.path(), "test", "b", 1);

        let mut trainer = setup::<CpuBackend>(
            options(data.path(), out.path(), &["--y_condition", "--L", "1"]),
            2,
            "cpu",
            false,
        )
        .unwrap();
        assert_eq!(trainer.num_classes, 2);
        assert!(trainer.model.is_conditional());

        let batch = trainer.train.iter().next().unwrap().unwrap();
        let values = trainer.train_step(batch).unwrap();
        assert!(values.loss_classes.is_some());
        assert!(values.total_loss[0].is_finite());

        let mut state = State::new(1, trainer.train.len());
        state.iteration = 100;
        trainer.sample(&state).unwrap();
        assert!(out.path().join("example_imgs/100.png").exists());
    }
}
