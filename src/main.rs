use std::{path::PathBuf, sync::Arc};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

use video_stylizer::{
    config::Config,
    pipeline::{self, Job, JobRunner, JobStatus, ProgressEvent},
    styles::StyleRegistry,
    video::{FfmpegEncoder, FfmpegSource, VideoSource},
};

#[derive(Parser)]
#[command(
    name = "video-stylizer",
    version,
    about = "Apply artistic styles to videos in resumable chunks",
    long_about = "Video-Stylizer splits a video into keyframe-aligned chunks, stylizes and encodes them through a bounded pipeline, and checkpoints each finished chunk so an interrupted run picks up where it stopped."
)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Stylize a video
    Process {
        /// Input video file
        #[arg(short, long)]
        input: PathBuf,

        /// Output video file
        #[arg(short, long)]
        output: PathBuf,

        /// Styles to apply, in order (comma separated)
        #[arg(short, long, value_delimiter = ',', default_value = "cinematic")]
        styles: Vec<String>,

        /// Named preset (speed, balanced, quality)
        #[arg(short, long)]
        preset: Option<String>,

        /// Configuration file (optional, overrides the preset)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Job id; defaults to one derived from the input name and styles
        #[arg(long)]
        job_id: Option<String>,

        /// Where checkpoint records are kept
        #[arg(long)]
        checkpoint_dir: Option<PathBuf>,
    },

    /// Print the chunk plan for a video
    Plan {
        /// Input video file
        input: PathBuf,

        /// Named preset (speed, balanced, quality)
        #[arg(short, long)]
        preset: Option<String>,

        /// Configuration file (optional, overrides the preset)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// List available styles
    Styles,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("video_stylizer={}", log_level)));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Command::Process {
            input,
            output,
            styles,
            preset,
            config,
            job_id,
            checkpoint_dir,
        } => {
            let mut config = load_config(config, preset)?;
            if let Some(dir) = checkpoint_dir {
                config.pipeline.checkpoint_dir = dir;
            }
            process(config, input, output, styles, job_id).await
        }
        Command::Plan { input, preset, config } => {
            let config = load_config(config, preset)?;
            print_plan(&config, input)
        }
        Command::Styles => {
            let registry = StyleRegistry::new();
            for name in registry.available_styles() {
                if let Some(style) = registry.get_style(&name) {
                    println!("{:<12} {}", name, style.description());
                }
            }
            Ok(())
        }
    }
}

fn load_config(path: Option<PathBuf>, preset: Option<String>) -> Result<Config> {
    match (path, preset) {
        (Some(path), preset) => {
            if let Some(preset) = preset {
                warn!("Ignoring preset '{}' in favour of {:?}", preset, path);
            }
            info!("Loading configuration from {:?}", path);
            Ok(Config::from_file(&path)?)
        }
        (None, Some(preset)) => {
            info!("Using '{}' preset", preset);
            Ok(Config::preset(&preset)?)
        }
        (None, None) => {
            info!("Using default configuration");
            Ok(Config::default())
        }
    }
}

async fn process(
    config: Config,
    input: PathBuf,
    output: PathBuf,
    styles: Vec<String>,
    job_id: Option<String>,
) -> Result<()> {
    info!("Starting Video-Stylizer v{}", env!("CARGO_PKG_VERSION"));
    if !FfmpegEncoder::check_ffmpeg_available() {
        bail!("ffmpeg was not found on PATH; install it to process videos");
    }

    let id = job_id.unwrap_or_else(|| Job::derive_id(&input, &styles));
    let mut job = Job::new(id, input.clone(), output, styles);

    let runner = JobRunner::with_ffmpeg(config, &input)
        .map_err(|e| anyhow::anyhow!(e.user_message()))?
        .with_progress(Arc::new(|event: ProgressEvent| {
            info!(
                chunk = event.chunk_index,
                "{:>5.1}% ({}/{} frames, {:.1} fps)",
                event.fraction() * 100.0,
                event.frames_done,
                event.total_frames,
                event.estimated_fps
            );
        }));

    let cancel = runner.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping after the current frame");
            cancel.cancel();
        }
    });

    match runner.run(&mut job).await {
        Ok(report) => {
            info!(
                "Done! {} frames in {} chunks saved to {:?}",
                report.frames, report.chunks, report.output
            );
            Ok(())
        }
        Err(_) => match job.status {
            JobStatus::Cancelled => {
                info!("Job '{}' cancelled; rerun the same command to resume", job.id);
                Ok(())
            }
            status => Err(anyhow::anyhow!("Job '{}' {}", job.id, status)),
        },
    }
}

fn print_plan(config: &Config, input: PathBuf) -> Result<()> {
    config.validate()?;
    let source = FfmpegSource::open(&input).with_context(|| format!("Could not open {:?}", input))?;
    let info = source.probe()?;
    let keyframes = source.random_access_points()?;
    let plan = pipeline::plan(
        info.total_frames,
        info.fps,
        config.pipeline.chunk_duration_secs,
        &keyframes,
    )?;

    println!(
        "{:?}: {} frames at {:.3} fps, {} chunks",
        input,
        plan.total_frames,
        plan.fps,
        plan.len()
    );
    for chunk in &plan.chunks {
        println!(
            "  #{:<4} frames {:>8}..{:<8} {:>9.3}s - {:>9.3}s{}",
            chunk.index,
            chunk.start_frame,
            chunk.end_frame,
            chunk.start_timestamp,
            chunk.end_timestamp,
            if chunk.is_random_access_aligned { "" } else { "  (unaligned)" }
        );
    }
    Ok(())
}
