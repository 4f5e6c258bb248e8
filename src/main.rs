use album_thumbs::catalog::{CatalogEvent, CatalogModel, FilterType, SortOrder, ThumbnailState};
use album_thumbs::config::ThumbnailConfig;
use album_thumbs::errors::api_error::ApiError;
use album_thumbs::errors::domain::map_api_result;
use album_thumbs::remote::{DeviceConnection, LocalFs, RemoteFs};
use album_thumbs::thumbnails::Thumbnail;
use clap::{Parser, ValueEnum};
use image::codecs::png::{CompressionType as PngCompression, FilterType as PngFilter, PngEncoder};
use image::ImageEncoder;
use once_cell::sync::OnceCell;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

const COMPLETION_POLL: Duration = Duration::from_millis(250);

#[derive(Parser)]
#[command(
    name = "album-thumbs",
    version,
    about = "Render thumbnails for every photo and video of a device album"
)]
struct Cli {
    /// Local directory served as the device filesystem root
    #[arg(long)]
    root: PathBuf,

    /// Album path on the device, e.g. /DCIM/100APPLE
    album: String,

    /// Where the PNG thumbnails go (default: the user cache directory)
    #[arg(short, long)]
    out: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = FilterArg::All)]
    filter: FilterArg,

    #[arg(long, value_enum, default_value_t = SortArg::Newest)]
    sort: SortArg,

    /// JSON config file (default: album-thumbs/config.json in the user config directory)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Also write logs to this file
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Print the album listing as JSON instead of rendering
    #[arg(long)]
    list: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum FilterArg {
    All,
    Images,
    Videos,
}

impl From<FilterArg> for FilterType {
    fn from(arg: FilterArg) -> Self {
        match arg {
            FilterArg::All => FilterType::All,
            FilterArg::Images => FilterType::ImagesOnly,
            FilterArg::Videos => FilterType::VideosOnly,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum SortArg {
    Newest,
    Oldest,
}

impl From<SortArg> for SortOrder {
    fn from(arg: SortArg) -> Self {
        match arg {
            SortArg::Newest => SortOrder::NewestFirst,
            SortArg::Oldest => SortOrder::OldestFirst,
        }
    }
}

fn init_logging(log_file: Option<&Path>) {
    static GUARD: OnceCell<tracing_appender::non_blocking::WorkerGuard> = OnceCell::new();
    let filter = || {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    };

    let result = match log_file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            if let Err(e) = std::fs::create_dir_all(dir) {
                eprintln!("Failed to create log dir {:?}: {}", dir, e);
                return;
            }
            let file_name = path
                .file_name()
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("album-thumbs.log"));
            let file_appender = tracing_appender::rolling::never(dir, file_name);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let _ = GUARD.set(guard);
            tracing_subscriber::fmt()
                .with_env_filter(filter())
                .with_ansi(false)
                .with_writer(non_blocking)
                .try_init()
        }
        None => tracing_subscriber::fmt()
            .with_env_filter(filter())
            .with_writer(std::io::stderr)
            .try_init(),
    };
    if let Err(e) = result {
        eprintln!("Failed to init tracing subscriber: {e}");
    }
}

fn default_config_path() -> Option<PathBuf> {
    dirs_next::config_dir().map(|dir| dir.join("album-thumbs").join("config.json"))
}

fn default_output_dir() -> PathBuf {
    dirs_next::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("album-thumbs")
}

fn load_config(explicit: Option<&Path>) -> Result<ThumbnailConfig, String> {
    let config = match explicit {
        Some(path) => ThumbnailConfig::from_json_file(path)?,
        None => match default_config_path() {
            Some(path) if path.is_file() => ThumbnailConfig::from_json_file(&path)?,
            _ => ThumbnailConfig::default(),
        },
    };
    Ok(config.with_env_overrides())
}

fn describe(error: ApiError) -> String {
    format!("{}: {}", error.code, error.message)
}

fn write_png(thumb: &Thumbnail, dest: &Path) -> Result<(), String> {
    let file = std::fs::File::create(dest)
        .map_err(|e| format!("Save thumbnail failed for {}: {e}", dest.display()))?;
    let writer = std::io::BufWriter::new(file);
    // Fast compression and no filters; these are throwaway previews.
    let encoder = PngEncoder::new_with_quality(writer, PngCompression::Fast, PngFilter::NoFilter);
    encoder
        .write_image(
            thumb.pixels(),
            thumb.width(),
            thumb.height(),
            image::ExtendedColorType::Rgba8,
        )
        .map_err(|e| format!("Save thumbnail failed for {}: {e}", dest.display()))
}

fn run(cli: &Cli) -> Result<(), String> {
    let config = load_config(cli.config.as_deref())?;
    let fs: Arc<dyn RemoteFs> = Arc::new(LocalFs::new(&cli.root));
    let device = Arc::new(DeviceConnection::new(cli.root.display().to_string(), fs));

    let mut model = map_api_result(CatalogModel::new(device, &config)).map_err(describe)?;
    model.set_filter_type(cli.filter.into());
    model.set_sort_order(cli.sort.into());
    map_api_result(model.set_album_path(&cli.album)).map_err(describe)?;

    if cli.list {
        let entries: Vec<_> = (0..model.entry_count())
            .filter_map(|i| model.entry_at(i))
            .collect();
        let json = serde_json::to_string_pretty(&entries)
            .map_err(|e| format!("Failed to serialize listing: {e}"))?;
        println!("{json}");
        return Ok(());
    }

    let out_dir = cli.out.clone().unwrap_or_else(default_output_dir);
    std::fs::create_dir_all(&out_dir)
        .map_err(|e| format!("Failed to create output dir {}: {e}", out_dir.display()))?;

    let started = Instant::now();
    let total = model.entry_count();
    for index in 0..total {
        model.request_thumbnail_for(index);
    }

    let mut written = 0usize;
    while model.pipeline().in_flight_len() > 0 {
        for event in model.wait_for_completions(COMPLETION_POLL) {
            let CatalogEvent::ThumbnailChanged { index, path } = event;
            let Some(thumb) = model.cached_thumbnail(index) else {
                warn!(path = %path, "thumbnail evicted before it could be written");
                continue;
            };
            let Some(name) = model.display_name(index) else {
                continue;
            };
            let dest = out_dir.join(format!("{name}.png"));
            match write_png(&thumb, &dest) {
                Ok(()) => written += 1,
                Err(e) => warn!(path = %path, error = %e, "failed to write thumbnail"),
            }
        }
    }

    let failed = (0..total)
        .filter(|&i| model.thumbnail_state(i) == Some(ThumbnailState::Failed))
        .count();
    info!(
        album = %cli.album,
        total,
        written,
        failed,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "album rendered"
    );
    println!(
        "{written} written, {failed} failed, {total} entries -> {}",
        out_dir.display()
    );
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.log_file.as_deref());
    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}
