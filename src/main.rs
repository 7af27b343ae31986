//! Argus multi-camera recorder

use std::path::PathBuf;

use argus::capture::Systems;
use argus::writer::encoder::EncoderParams;
use argus::{trigger, Recording, RecordingConfig, StopReason};
use clap::Parser;
use color_eyre::eyre::{eyre, WrapErr};
use color_eyre::Result;
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "argus", version, about = "Synchronized multi-camera recorder")]
struct Cli {
    /// Recording configuration (TOML or YAML)
    config: PathBuf,

    /// Validate the configuration and print each camera's encoder command
    #[arg(long)]
    dry_run: bool,

    /// Log preview images instead of discarding them
    #[arg(long)]
    preview: bool,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("argus=info"));
    let fmt = tracing_subscriber::fmt::layer().with_timer(tracing_subscriber::fmt::time::uptime());
    let registry = tracing_subscriber::registry().with(filter).with(fmt);
    #[cfg(feature = "profiling")]
    let registry = registry.with(tracing_tracy::TracyLayer::default());
    registry.init();
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    init_tracing();
    let cli = Cli::parse();

    info!("Argus launching...");

    let config = RecordingConfig::load(&cli.config)
        .wrap_err_with(|| format!("Failed to load {}", cli.config.display()))?;
    let triggers = trigger::from_config(&config).wrap_err("Failed to set up triggers")?;

    if cli.dry_run {
        return dry_run(&config);
    }

    let systems = Systems::load(&config).wrap_err("Failed to load camera systems")?;
    let mut recording = Recording::prepare(config.clone(), systems, triggers, cli.preview)
        .wrap_err("Failed to prepare cameras")?;
    let stops = recording.stop_handles();
    let pipelines = recording.take_pipelines();

    // Ctrl-C stops every camera; pipelines drain and finalize as usual
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping all cameras");
            for stop in &stops {
                stop.raise(StopReason::Requested);
            }
        }
    });

    let handles: Vec<_> = pipelines
        .into_iter()
        .map(|pipeline| {
            let name = pipeline.camera_name().to_string();
            tokio::task::spawn_blocking(move || (name, pipeline.run()))
        })
        .collect();

    let mut failed = 0;
    for handle in handles {
        let (name, result) = match handle.await {
            Ok(joined) => joined,
            Err(e) => {
                failed += 1;
                error!("Camera pipeline panicked: {}", e);
                continue;
            }
        };
        match result {
            Ok(report) if report.is_success() => info!(
                "{}: {} frames recorded ({})",
                name, report.frames_written, report.stop_reason
            ),
            Ok(report) => {
                failed += 1;
                error!("{}: stopped early ({})", name, report.stop_reason);
            }
            Err(e) => {
                failed += 1;
                error!("{}: {}", name, e);
            }
        }
    }

    recording.finish();

    if failed > 0 {
        return Err(eyre!("{} of {} cameras failed", failed, config.num_cams));
    }
    info!("Argus shutting down");
    Ok(())
}

fn dry_run(config: &RecordingConfig) -> Result<()> {
    for n in 0..config.num_cams {
        let camera = config.camera_config(n)?;
        let params = EncoderParams::derive(&camera)?;
        println!(
            "{}: {} {}",
            camera.camera_name,
            camera.ffmpeg_path,
            params.command_args(&camera).join(" ")
        );
    }
    Ok(())
}
