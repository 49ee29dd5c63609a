use std::path::PathBuf;
use std::time::{Duration, Instant, SystemTime};

use anyhow::{Context, Result};
use burn_core::config::Config;
use burn_tensor::backend::Backend;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use burn_rolling_sink::config::DeviceSelection;
use burn_rolling_sink::loader::{encode_safetensors, SafetensorsWeightStore, WeightStore};
use burn_rolling_sink::reference::ReferenceModelConfig;
use burn_rolling_sink::video::output_path;
use burn_rolling_sink::{Engine, EngineConfig, GenerationRequest};

#[derive(Parser, Debug)]
#[command(name = "rollsink", version, about = "Long video generation with a rolling attention sink")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate a video from a prompt.
    Generate(GenerateArgs),
    /// Write freshly initialised reference weights as safetensors.
    InitWeights(InitWeightsArgs),
}

#[derive(Args, Debug)]
struct ModelArgs {
    /// Engine configuration JSON (defaults when omitted)
    #[arg(long)]
    config: Option<PathBuf>,
    /// Reference model configuration JSON
    #[arg(long)]
    model_config: Option<PathBuf>,
    /// Override the latent height
    #[arg(long)]
    latent_height: Option<usize>,
    /// Override the latent width
    #[arg(long)]
    latent_width: Option<usize>,
}

#[derive(Args, Debug)]
struct GenerateArgs {
    #[arg(short, long)]
    prompt: String,
    /// Requested length in seconds (clamped to the configured range)
    #[arg(short, long, default_value_t = 15.0)]
    duration: f64,
    #[arg(long)]
    seed: Option<u64>,
    /// Directory holding safetensors weights; random weights when omitted
    #[arg(long)]
    weights: Option<PathBuf>,
    #[arg(long, default_value = "model")]
    weights_id: String,
    #[arg(short, long, default_value = "videos")]
    out_dir: PathBuf,
    /// Abort between blocks once this many seconds have passed
    #[arg(long)]
    timeout_secs: Option<u64>,
    /// Print a JSON summary of the run
    #[arg(long)]
    summary: bool,
    #[command(flatten)]
    model: ModelArgs,
}

#[derive(Args, Debug)]
struct InitWeightsArgs {
    /// Output safetensors file
    #[arg(short, long)]
    out: PathBuf,
    #[command(flatten)]
    model: ModelArgs,
}

#[derive(Serialize)]
struct RunSummary {
    path: PathBuf,
    requested_secs: f64,
    effective_secs: f64,
    clamped: bool,
    blocks: usize,
    latent_frames: usize,
    frames: usize,
    width: usize,
    height: usize,
    fps: usize,
    cache_evictions: u64,
    cache_peak: usize,
    elapsed_ms: u128,
}

fn load_configs(args: &ModelArgs) -> Result<(EngineConfig, ReferenceModelConfig)> {
    let mut engine = match &args.config {
        Some(path) => EngineConfig::load(path).with_context(|| format!("reading {}", path.display()))?,
        None => EngineConfig::new(),
    };
    if let Some(h) = args.latent_height {
        engine.latent_height = h;
    }
    if let Some(w) = args.latent_width {
        engine.latent_width = w;
    }
    engine.validate()?;
    let model = match &args.model_config {
        Some(path) => ReferenceModelConfig::load(path).with_context(|| format!("reading {}", path.display()))?,
        None => ReferenceModelConfig::new(),
    };
    Ok((engine, model))
}

fn generate<B: Backend>(args: GenerateArgs, engine_cfg: EngineConfig, model_cfg: ReferenceModelConfig, device: B::Device) -> Result<()>
where
    B::Device: Send + Sync,
{
    let admission = engine_cfg.admission;
    let weights_dir = args.weights.clone();
    let weights_id = args.weights_id.clone();
    let engine = Engine::new(admission, move || {
        let weights = match &weights_dir {
            Some(dir) => Some(SafetensorsWeightStore::new(dir).load(&weights_id)?),
            None => None,
        };
        model_cfg.build::<B>(engine_cfg.clone(), weights.as_ref(), device.clone())
    });
    engine.warm_up().context("model initialisation failed")?;

    let started = Instant::now();
    let mut request = GenerationRequest::new(args.prompt.clone(), args.duration);
    if let Some(seed) = args.seed {
        request = request.with_seed(seed);
    }
    if let Some(secs) = args.timeout_secs {
        request = request.with_deadline(started + Duration::from_secs(secs));
    }
    let output = engine.generate(&request)?;

    let path = output_path(&args.out_dir, &args.prompt, SystemTime::now());
    output.video.save(&path)?;
    info!(path = %path.display(), frames = output.video.num_frames, "video written");

    if args.summary {
        let summary = RunSummary {
            path,
            requested_secs: output.plan.requested_secs,
            effective_secs: output.plan.effective_secs,
            clamped: output.plan.was_clamped(),
            blocks: output.plan.num_blocks,
            latent_frames: output.plan.latent_frames,
            frames: output.video.num_frames,
            width: output.video.width,
            height: output.video.height,
            fps: output.video.fps,
            cache_evictions: output.cache_stats.evictions,
            cache_peak: output.cache_stats.peak_len,
            elapsed_ms: started.elapsed().as_millis(),
        };
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!(
            "wrote {} frames at {} fps to {}",
            output.video.num_frames,
            output.video.fps,
            path.display()
        );
    }
    Ok(())
}

fn init_weights<B: Backend>(args: InitWeightsArgs, engine_cfg: EngineConfig, model_cfg: ReferenceModelConfig, device: B::Device) -> Result<()> {
    let weights = model_cfg.init_weights::<B>(&engine_cfg, &device)?;
    let bytes = encode_safetensors(&weights)?;
    if let Some(parent) = args.out.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&args.out, bytes).with_context(|| format!("writing {}", args.out.display()))?;
    println!("wrote {} tensors to {}", weights.len(), args.out.display());
    Ok(())
}

fn run<B: Backend>(command: Command, engine_cfg: EngineConfig, model_cfg: ReferenceModelConfig, device: B::Device) -> Result<()>
where
    B::Device: Send + Sync,
{
    match command {
        Command::Generate(args) => generate::<B>(args, engine_cfg, model_cfg, device),
        Command::InitWeights(args) => init_weights::<B>(args, engine_cfg, model_cfg, device),
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let model_args = match &cli.command {
        Command::Generate(args) => &args.model,
        Command::InitWeights(args) => &args.model,
    };
    let (engine_cfg, model_cfg) = load_configs(model_args)?;

    let selection = engine_cfg.device;
    match selection {
        DeviceSelection::Cpu => {
            type B = burn_ndarray::NdArray<f32>;
            run::<B>(cli.command, engine_cfg, model_cfg, Default::default())
        }
        #[cfg(feature = "wgpu")]
        DeviceSelection::Gpu(index) => {
            type B = burn_wgpu::Wgpu;
            run::<B>(cli.command, engine_cfg, model_cfg, burn_wgpu::WgpuDevice::DiscreteGpu(index))
        }
        #[cfg(not(feature = "wgpu"))]
        DeviceSelection::Gpu(_) => anyhow::bail!("GPU selection requires the `wgpu` feature"),
    }
}
