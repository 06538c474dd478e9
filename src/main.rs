mod config;
mod error;
mod frames;
mod imaging;
mod matting;
mod output;
mod refiner;
mod service;
mod session;
mod tracking;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use config::ServiceConfig;
use error::Status;
use matting::{parse_points, ProtocolVersion};
use refiner::{LossKind, OutputMode};
use service::{MattingRequest, MattingResponse, MattingService};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(author, version, about = "Point-prompted video object matting", long_about = None)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct GlobalArgs {
    /// Root directory of all sessions
    #[arg(long, env = "MATTING_DATA_ROOT", default_value = "/tmp/matting", global = true)]
    data_root: PathBuf,

    /// Working resolution width
    #[arg(long, env = "MATTING_WORKING_WIDTH", default_value_t = config::WORKING_RESOLUTION.0, global = true)]
    working_width: u32,

    /// Working resolution height
    #[arg(long, env = "MATTING_WORKING_HEIGHT", default_value_t = config::WORKING_RESOLUTION.1, global = true)]
    working_height: u32,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Store a directory of decoded frames as a session
    Upload {
        /// Directory of frame images, in file name order
        #[arg(long)]
        frames: PathBuf,

        /// Frame rate of the source video
        #[arg(long, default_value_t = 25.0)]
        fps: f32,

        /// Session hash; the SHA-256 of the frames when omitted
        #[arg(long)]
        hash: Option<String>,
    },

    /// Print the stored metadata of a session
    Info {
        hash: String,
    },

    /// Track a prompted object and write its mattes
    Matte(MatteArgs),

    /// Compare predicted mattes against ground truth
    Score {
        /// Predicted matte image, or a directory of them
        #[arg(long)]
        predicted: PathBuf,

        /// Ground-truth matte image, or a directory with matching file names
        #[arg(long)]
        truth: PathBuf,

        #[arg(long, value_enum, default_value_t = LossKind::L1)]
        loss: LossKind,
    },
}

#[derive(Args, Debug)]
struct MatteArgs {
    #[arg(long)]
    hash: String,

    /// Prompt points as JSON, e.g. `[[0.5, 0.4], [0.52, 0.6]]`
    #[arg(long)]
    points: String,

    /// First frame, prompted
    #[arg(long, default_value_t = 0)]
    start: usize,

    /// Frame after the last one to matte
    #[arg(long)]
    finish: usize,

    /// Cut out everything the tracker considers background
    #[arg(long)]
    zero: bool,

    /// Also write binary masks
    #[arg(long)]
    masks: bool,

    /// Write mattes at the uploaded video's resolution
    #[arg(long)]
    native_output: bool,

    /// Refine at the uploaded video's resolution instead of the working one
    #[arg(long)]
    native_refine: bool,

    /// Coordinate convention of `--points`
    #[arg(long, value_enum, env = "MATTING_PROTOCOL", default_value_t = ProtocolVersion::UnitInterval)]
    protocol: ProtocolVersion,

    /// Directory with the tracker's ONNX graphs
    #[arg(long, env = "MATTING_TRACKER_DIR", default_value = "models/sam2")]
    tracker_dir: PathBuf,

    /// Refiner weights file or checkpoint directory
    #[arg(long, env = "MATTING_REFINER_WEIGHTS", default_value = "models/refiner.safetensors")]
    refiner_weights: PathBuf,

    /// Override the refiner's output head
    #[arg(long, value_enum)]
    refiner_mode: Option<OutputMode>,

    /// Request timeout in seconds
    #[arg(long, env = "MATTING_TIMEOUT_SECS", default_value_t = 600)]
    timeout_secs: u64,

    /// ONNX Runtime intra-op threads per graph
    #[arg(long, env = "MATTING_INTRA_THREADS", default_value_t = 4)]
    intra_threads: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env file is fine
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.global.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let mut config = ServiceConfig {
        data_root: cli.global.data_root.clone(),
        working_resolution: (cli.global.working_width, cli.global.working_height),
        ..Default::default()
    };
    tracing::info!("Data root: {}", config.data_root.display());
    tracing::info!(
        "Working resolution: {}x{}",
        config.working_resolution.0,
        config.working_resolution.1
    );

    match cli.command {
        Command::Upload { frames, fps, hash } => {
            let hash = match hash {
                Some(hash) => hash,
                None => hash_frames(&frames)?,
            };
            let store = session::SessionStore::new(&config.data_root, config.working_resolution);
            let response = match store.ingest(&hash, &frames, fps) {
                Ok(ingested) if ingested.created => respond("Uploaded", &ingested.metadata)?,
                Ok(ingested) => respond("Already exists", &ingested.metadata)?,
                Err(e) => MattingResponse::failure(&e),
            };
            report(&response)
        }
        Command::Info { hash } => {
            let store = session::SessionStore::new(&config.data_root, config.working_resolution);
            let response = match store.metadata(&hash) {
                Ok(metadata) => respond("Session found", &metadata)?,
                Err(e) => MattingResponse::failure(&e),
            };
            report(&response)
        }
        Command::Matte(args) => {
            config.tracker_dir = args.tracker_dir;
            config.refiner_weights = args.refiner_weights;
            config.refiner_mode = args.refiner_mode;
            config.protocol = args.protocol;
            config.request_timeout = Duration::from_secs(args.timeout_secs);
            config.intra_threads = args.intra_threads;

            let points = match parse_points(&args.points) {
                Ok(points) => points,
                Err(e) => return report(&MattingResponse::failure(&e)),
            };

            let service = MattingService::load(config).context("Failed to initialize models")?;
            tracing::info!("{}", service.ready().message);

            let cancel = CancellationToken::new();
            let on_interrupt = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("Interrupted, cancelling request");
                    on_interrupt.cancel();
                }
            });

            let request = MattingRequest {
                hash: args.hash,
                points,
                start: args.start,
                finish: args.finish,
                zero: args.zero,
                protocol: Some(args.protocol),
                masks: args.masks,
                native_output: args.native_output,
                native_refine: args.native_refine,
            };
            let response = service.matting(request, cancel).await;
            report(&response)
        }
        Command::Score {
            predicted,
            truth,
            loss,
        } => score(&predicted, &truth, loss),
    }
}

fn respond<T: serde::Serialize>(message: &str, data: &T) -> Result<MattingResponse> {
    Ok(MattingResponse::success(message, Some(serde_json::to_value(data)?)))
}

/// Print the response as JSON; a non-success status is the process's error
fn report(response: &MattingResponse) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(response)?);
    if response.status != Status::Success {
        anyhow::bail!("{}", response.message);
    }
    Ok(())
}

fn hash_frames(dir: &Path) -> Result<String> {
    let files = session::frame_sources(dir)
        .with_context(|| format!("Failed to list frames in {}", dir.display()))?;
    let hash = session::content_hash(&files)?;
    tracing::info!("Session hash {} over {} files", hash, files.len());
    Ok(hash)
}

fn score(predicted: &Path, truth: &Path, kind: LossKind) -> Result<()> {
    let pairs: Vec<(PathBuf, PathBuf)> = if predicted.is_dir() {
        let mut names: Vec<_> = std::fs::read_dir(predicted)
            .with_context(|| format!("Failed to read {}", predicted.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.file_name()))
            .collect();
        names.sort();
        names
            .into_iter()
            .map(|name| (predicted.join(&name), truth.join(&name)))
            .filter(|(_, t)| t.is_file())
            .collect()
    } else {
        vec![(predicted.to_path_buf(), truth.to_path_buf())]
    };
    if pairs.is_empty() {
        anyhow::bail!("No matching mattes between {} and {}", predicted.display(), truth.display());
    }

    let mut total = 0.0f64;
    for (p, t) in &pairs {
        let load = |path: &Path| -> Result<ndarray::Array2<f32>> {
            let image = image::open(path)
                .with_context(|| format!("Failed to read {}", path.display()))?
                .to_luma8();
            Ok(imaging::gray_to_plane(&image))
        };
        let matte_score = refiner::weighted_matte_loss(load(p)?.view(), load(t)?.view(), kind)?;
        total += matte_score.weighted as f64;

        let line = serde_json::json!({ "file": p, "score": matte_score });
        println!("{line}");
    }

    tracing::info!(
        "Mean weighted {:?} loss over {} mattes: {:.5}",
        kind,
        pairs.len(),
        total / pairs.len() as f64
    );
    Ok(())
}
