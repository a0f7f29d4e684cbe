use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::Context as _;
use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing_subscriber::EnvFilter;

use mupattern::{
    cache::ArrayHandleCache,
    config::global_config,
    crop::CropRequest,
    discovery::{discover_with_timeout, list_positions, DiscoveryMode},
    movie::{Colormap, MovieRenderer, MovieRequest},
    storage::{FilesystemStore, ReadableListableStorage},
    task::{TaskEvent, TaskManager, TaskRecord, TaskStatus},
};

#[derive(Parser, Debug)]
#[command(name = "mupattern", version)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Extract the crop arrays of a microscope position.
    Crop(CropArgs),
    /// Render a crop over time to a movie (requires `ffmpeg`).
    Movie(MovieArgs),
    /// List the positions and crops of a crop store as JSON.
    Discover(DiscoverArgs),
    /// List the positions of a crop store.
    Positions(PositionsArgs),
}

#[derive(Parser, Debug)]
struct CropArgs {
    /// Directory containing the `Pos{N}` directories of source TIFFs.
    #[arg(long)]
    input: PathBuf,

    /// Position number.
    #[arg(long)]
    pos: u32,

    /// Bounding box CSV (`crop,x,y,w,h`).
    #[arg(long)]
    bbox: PathBuf,

    /// Output crop store.
    #[arg(long)]
    output: PathBuf,

    /// Also write the per-frame background median.
    #[arg(long)]
    background: bool,

    /// Directory to persist the task record in.
    #[arg(long)]
    task_dir: Option<PathBuf>,
}

#[derive(Parser, Debug)]
struct MovieArgs {
    /// Crop store.
    #[arg(long)]
    input: PathBuf,

    /// Position identifier (e.g. `150`).
    #[arg(long)]
    pos: String,

    /// Crop identifier (e.g. `000`).
    #[arg(long)]
    crop: String,

    /// Channel index.
    #[arg(long, default_value_t = 0)]
    channel: u64,

    /// Time selection: `all`, or comma separated indices and `start:stop:step` slices.
    #[arg(long, default_value = "all")]
    time: String,

    /// Output movie path.
    #[arg(long)]
    output: PathBuf,

    /// Frames per second.
    #[arg(long, default_value_t = 10)]
    fps: u32,

    /// Colormap.
    #[arg(long, value_enum, default_value_t = ColormapChoice::Grayscale)]
    colormap: ColormapChoice,

    /// Spots CSV (`t,crop,y,x`) to overlay.
    #[arg(long)]
    spots: Option<PathBuf>,

    /// Encoder program, overriding the configured `ffmpeg`.
    #[arg(long)]
    ffmpeg: Option<PathBuf>,

    /// Directory to persist the task record in.
    #[arg(long)]
    task_dir: Option<PathBuf>,
}

#[derive(Parser, Debug)]
struct DiscoverArgs {
    /// Crop store.
    #[arg(long)]
    input: PathBuf,

    /// Discovery mode.
    #[arg(long, value_enum, default_value_t = ModeChoice::Fast)]
    mode: ModeChoice,

    /// Only discover these positions.
    #[arg(long = "pos")]
    positions: Vec<String>,

    /// Give up after this many seconds (defaults to the configured discovery timeout).
    #[arg(long)]
    timeout_secs: Option<u64>,
}

#[derive(Parser, Debug)]
struct PositionsArgs {
    /// Crop store.
    #[arg(long)]
    input: PathBuf,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ColormapChoice {
    Grayscale,
    Hot,
    Viridis,
}

impl From<ColormapChoice> for Colormap {
    fn from(choice: ColormapChoice) -> Self {
        match choice {
            ColormapChoice::Grayscale => Self::Grayscale,
            ColormapChoice::Hot => Self::Hot,
            ColormapChoice::Viridis => Self::Viridis,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ModeChoice {
    Fast,
    Full,
}

impl From<ModeChoice> for DiscoveryMode {
    fn from(choice: ModeChoice) -> Self {
        match choice {
            ModeChoice::Fast => Self::Fast,
            ModeChoice::Full => Self::Full,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.cmd {
        Command::Crop(args) => cmd_crop(args).await,
        Command::Movie(args) => cmd_movie(args).await,
        Command::Discover(args) => cmd_discover(args).await,
        Command::Positions(args) => cmd_positions(args).await,
    }
}

fn task_manager(task_dir: Option<&Path>) -> anyhow::Result<TaskManager> {
    match task_dir {
        Some(dir) => TaskManager::with_storage_dir(dir)
            .with_context(|| format!("create task directory '{}'", dir.display())),
        None => Ok(TaskManager::new()),
    }
}

fn open_store(path: &Path) -> anyhow::Result<ReadableListableStorage> {
    let store = FilesystemStore::new(path)
        .with_context(|| format!("open crop store '{}'", path.display()))?;
    Ok(Arc::new(store))
}

/// Print the events of `record` to stderr until it finishes, then print its final record to stdout.
async fn follow_task(
    manager: &TaskManager,
    mut events: broadcast::Receiver<TaskEvent>,
    record: TaskRecord,
) -> anyhow::Result<()> {
    let task_id = record.id.clone();
    let printer = {
        let task_id = task_id.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) if event.task_id() == task_id => match event {
                        TaskEvent::Progress { event, .. } => {
                            eprintln!("[{:5.1}%] {}", event.progress * 100.0, event.message);
                        }
                        TaskEvent::Log { message, .. } => eprintln!("{message}"),
                        TaskEvent::Status { status, .. } if status.is_terminal() => break,
                        TaskEvent::Status { .. } => {}
                    },
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => break,
                }
            }
        })
    };

    let record = manager
        .wait(&task_id)
        .await
        .with_context(|| format!("task {task_id} disappeared"))?;
    printer.abort();
    println!("{}", serde_json::to_string_pretty(&record)?);
    if record.status != TaskStatus::Succeeded {
        anyhow::bail!(
            "task {task_id} {}: {}",
            record.status,
            record.error.as_deref().unwrap_or("no error recorded")
        );
    }
    Ok(())
}

async fn cmd_crop(args: CropArgs) -> anyhow::Result<()> {
    let manager = task_manager(args.task_dir.as_deref())?;
    let events = manager.subscribe();
    let record = manager.submit_crop(CropRequest {
        input_dir: args.input,
        pos: args.pos,
        bbox_path: args.bbox,
        output_root: args.output,
        background: args.background,
    });
    follow_task(&manager, events, record).await
}

async fn cmd_movie(args: MovieArgs) -> anyhow::Result<()> {
    let manager = task_manager(args.task_dir.as_deref())?;
    let events = manager.subscribe();
    let mut renderer = MovieRenderer::new(Arc::new(ArrayHandleCache::new()));
    if let Some(ffmpeg) = args.ffmpeg {
        renderer = renderer.with_encoder_program(ffmpeg);
    }
    let record = manager.submit_movie(
        MovieRequest {
            array_root: args.input,
            pos: args.pos,
            crop: args.crop,
            channel: args.channel,
            time: args.time,
            output_path: args.output,
            fps: args.fps,
            colormap: args.colormap.into(),
            spots_csv: args.spots,
        },
        renderer,
    );
    follow_task(&manager, events, record).await
}

async fn cmd_discover(args: DiscoverArgs) -> anyhow::Result<()> {
    let store = open_store(&args.input)?;
    let cache = ArrayHandleCache::new();
    let timeout = args
        .timeout_secs
        .map_or_else(|| global_config().discovery_timeout(), Duration::from_secs);
    let positions = (!args.positions.is_empty()).then_some(args.positions.as_slice());
    let index = discover_with_timeout(&store, &cache, positions, args.mode.into(), timeout)
        .await
        .with_context(|| format!("discover '{}'", args.input.display()))?;
    println!("{}", serde_json::to_string_pretty(&index)?);
    Ok(())
}

async fn cmd_positions(args: PositionsArgs) -> anyhow::Result<()> {
    let store = open_store(&args.input)?;
    let positions = list_positions(&store)
        .await
        .with_context(|| format!("list positions of '{}'", args.input.display()))?;
    for position in positions {
        println!("{position}");
    }
    Ok(())
}
