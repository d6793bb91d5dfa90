//! pixload - load images through the pixcache pipeline
//!
//! Warms a disk cache from local files and reports how each load was
//! served, then prints cache statistics.

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use pixcache::{
    CacheConfig, CompressFormat, DeliveryMode, DisplayTarget, FileSource, Handle, ImageLoader,
    ImageRequest, LoadStatus, LoaderConfig,
};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Image files or file:// URIs
    #[arg(required = true)]
    files: Vec<String>,

    /// JSON configuration with optional "cache" and "loader" sections
    #[arg(long)]
    config: Option<PathBuf>,

    /// Disk cache directory
    #[arg(short, long)]
    cache_dir: Option<PathBuf>,

    /// Share of --max-memory given to the memory cache (0.01 to 0.8)
    #[arg(short, long)]
    mem_percent: Option<f32>,

    /// Memory budget the share applies to, in bytes
    #[arg(long)]
    max_memory: Option<u64>,

    /// Disk cache size bound in bytes
    #[arg(short, long)]
    disk_size: Option<u64>,

    /// Requested width; images are down-sampled towards it
    #[arg(long)]
    width: Option<u32>,

    /// Requested height; images are down-sampled towards it
    #[arg(long)]
    height: Option<u32>,

    /// Disk cache encoding
    #[arg(short, long, value_enum)]
    format: Option<Format>,

    /// Disk cache encoder quality (0 to 100)
    #[arg(short, long)]
    quality: Option<u8>,

    /// Empty both cache tiers before loading
    #[arg(long)]
    clear: bool,

    /// Load every file this many times
    #[arg(short, long, default_value_t = 1)]
    repeat: u32,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Format {
    Png,
    Jpeg,
}

impl From<Format> for CompressFormat {
    fn from(format: Format) -> Self {
        match format {
            Format::Png => CompressFormat::Png,
            Format::Jpeg => CompressFormat::Jpeg,
        }
    }
}

/// Contents of a --config file
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    cache: CacheConfig,
    loader: LoaderConfig,
}

impl FileConfig {
    fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Command-line arguments win over the file
    fn apply(&mut self, args: &Args) -> Result<()> {
        let cache = &mut self.cache;
        if let Some(dir) = &args.cache_dir {
            cache.disk_cache_dir = dir.clone();
        }
        if let Some(percent) = args.mem_percent {
            cache.set_mem_cache_size_percent(percent)?;
        }
        if let Some(bytes) = args.max_memory {
            cache.max_memory_bytes = bytes;
        }
        if let Some(bytes) = args.disk_size {
            cache.disk_cache_size_bytes = bytes;
        }
        if let Some(width) = args.width {
            cache.decode_width = width;
        }
        if let Some(height) = args.height {
            cache.decode_height = height;
        }
        if let Some(format) = args.format {
            cache.compress_format = format.into();
        }
        if let Some(quality) = args.quality {
            cache.compress_quality = quality;
        }
        cache.validate()?;
        Ok(())
    }
}

#[derive(Debug)]
enum Loaded {
    Image { width: u32, height: u32 },
    Failed,
}

#[derive(Debug)]
struct Report {
    index: usize,
    loaded: Loaded,
}

/// Forwards deliveries for one file to the main task
struct ConsoleTarget {
    index: usize,
    reports: UnboundedSender<Report>,
}

impl DisplayTarget for ConsoleTarget {
    fn set_image(&self, image: Option<Handle>) {
        let Some(image) = image else {
            return;
        };
        let loaded = match image.get() {
            Ok(bitmap) => Loaded::Image {
                width: bitmap.width(),
                height: bitmap.height(),
            },
            Err(_) => Loaded::Failed,
        };
        let _ = self.reports.send(Report {
            index: self.index,
            loaded,
        });
    }

    fn on_image_loading_failed(&self) {
        let _ = self.reports.send(Report {
            index: self.index,
            loaded: Loaded::Failed,
        });
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => FileConfig::load(path)?,
        None => FileConfig::default(),
    };
    config.apply(&args)?;
    let caller_thread = config.loader.delivery == DeliveryMode::CallerThread;

    info!("Starting pixload v{}", env!("CARGO_PKG_VERSION"));
    info!("Cache directory: {}", config.cache.disk_cache_dir.display());
    info!(
        "Memory cache: {} bytes, disk cache: {} bytes",
        config.cache.memory_cache_bytes(),
        config.cache.disk_cache_size_bytes
    );

    let loader = ImageLoader::new(
        config.cache,
        config.loader,
        Arc::new(FileSource::new()),
        tokio::runtime::Handle::current(),
    )
    .context("Failed to create image loader")?;

    if args.clear {
        loader.clear_cache_async().await??;
        info!("Cache cleared");
    }

    let (sender, mut receiver) = mpsc::unbounded_channel();
    let targets: Vec<Arc<dyn DisplayTarget>> = (0..args.files.len())
        .map(|index| {
            Arc::new(ConsoleTarget {
                index,
                reports: sender.clone(),
            }) as Arc<dyn DisplayTarget>
        })
        .collect();

    let started = Instant::now();
    for pass in 1..=args.repeat.max(1) {
        println!("\nPass {}", pass);
        let mut statuses = Vec::with_capacity(args.files.len());
        for (file, target) in args.files.iter().zip(&targets) {
            let status = loader.load(ImageRequest::new(file.as_str()), target);
            debug!(file = %file, ?status, "load requested");
            statuses.push(status);
        }

        let reports = collect(&loader, &mut receiver, args.files.len(), caller_thread).await;
        for report in reports {
            let file = &args.files[report.index];
            let served = match statuses[report.index] {
                LoadStatus::MemoryHit => "memory",
                LoadStatus::Dispatched | LoadStatus::AlreadyInFlight => "worker",
            };
            match report.loaded {
                Loaded::Image { width, height } => {
                    println!("  {:<8} {}x{:<6} {}", served, width, height, file)
                }
                Loaded::Failed => println!("  {:<8} {:<11} {}", served, "FAILED", file),
            }
        }
    }
    let elapsed = started.elapsed();

    loader.flush_async().await??;

    let stats = loader.stats();
    println!("\nStatistics ({:.1?})", elapsed);
    println!("   Memory hits:     {}", stats.memory_hits());
    println!("   Memory misses:   {}", stats.memory_misses());
    println!("   Hit ratio:       {:.1}%", stats.memory_hit_ratio() * 100.0);
    println!("   Disk hits:       {}", stats.disk_hits());
    println!("   Disk misses:     {}", stats.disk_misses());
    println!("   Decodes:         {}", stats.decodes());
    println!("   Decode failures: {}", stats.decode_failures());
    println!("   Failed loads:    {}", stats.failed());
    println!("   Evictions:       {}", stats.evictions());
    println!("   Buffer reuses:   {}", stats.reuses());
    if let Some(memory) = loader.cache().memory_cache() {
        println!(
            "   Memory cache:    {} / {} bytes",
            memory.size_bytes(),
            memory.max_bytes()
        );
    }
    println!(
        "   Disk cache:      {} bytes",
        loader.cache().disk_cache().size_bytes()
    );

    loader.close_async().await??;
    Ok(())
}

/// Wait for one report per file
async fn collect(
    loader: &ImageLoader,
    receiver: &mut UnboundedReceiver<Report>,
    expected: usize,
    caller_thread: bool,
) -> Vec<Report> {
    let mut reports = Vec::with_capacity(expected);
    while reports.len() < expected {
        if caller_thread {
            loader.run_pending();
            match tokio::time::timeout(Duration::from_millis(10), receiver.recv()).await {
                Ok(Some(report)) => reports.push(report),
                Ok(None) => break,
                Err(_) => continue,
            }
        } else {
            match receiver.recv().await {
                Some(report) => reports.push(report),
                None => break,
            }
        }
    }
    reports.sort_by_key(|report| report.index);
    reports
}
