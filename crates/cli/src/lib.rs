use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use imgcache_core::{BlurHashOptions, CacheConfig, CacheManager, EntryState, ImageSource};
use serde::Serialize;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Parser)]
#[command(name = "imgcache")]
#[command(about = "Image cache and blur-hash tool")]
pub struct Cli {
    /// Disk cache directory. Overrides the config file and environment.
    #[arg(long, global = true, value_name = "DIR")]
    cache_dir: Option<PathBuf>,

    /// TOML configuration file.
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Load an image through the cache and print its blur hash.
    Encode {
        #[arg(value_name = "SOURCE")]
        source: String,
        #[arg(long, default_value_t = 4)]
        components_x: u32,
        #[arg(long, default_value_t = 3)]
        components_y: u32,
    },
    /// Render a blur hash into a PNG placeholder.
    Decode {
        #[arg(value_name = "HASH")]
        hash: String,
        #[arg(long, default_value_t = 32)]
        width: u32,
        #[arg(long, default_value_t = 32)]
        height: u32,
        #[arg(long, default_value_t = 1.0)]
        punch: f64,
        #[arg(long)]
        output: PathBuf,
    },
    /// Load sources into the cache and report which ones succeeded.
    Prefetch {
        #[arg(value_name = "SOURCE", required = true)]
        sources: Vec<String>,
    },
    /// Delete every disk cache entry.
    ClearDisk,
    /// Print machine-readable cache statistics.
    Stats,
    /// Print CLI version.
    Version,
}

#[derive(Debug, Serialize)]
struct PrefetchOutput {
    requested: usize,
    ready: usize,
    failed: Vec<String>,
}

#[derive(Debug, Serialize)]
struct StatsOutput {
    memory: TierOutput,
    disk: Option<TierOutput>,
}

#[derive(Debug, Serialize)]
struct TierOutput {
    entries: usize,
    used_bytes: usize,
    limit_bytes: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    dir: Option<String>,
}

pub fn run<I, T>(args: I) -> Result<()>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let Cli { cache_dir, config, command } = Cli::parse_from(args);

    match command {
        Commands::Decode { hash, width, height, punch, output } => {
            run_decode(&hash, width, height, punch, &output)
        }
        Commands::Version => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        command => {
            let config = load_config(config.as_deref(), cache_dir)?;
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("failed to start async runtime")?;
            runtime.block_on(run_with_cache(command, config))
        }
    }
}

/// Config file, then `IMGCACHE_*` environment, then `--cache-dir`.
fn load_config(path: Option<&Path>, cache_dir: Option<PathBuf>) -> Result<CacheConfig> {
    let config = match path {
        Some(path) => CacheConfig::from_file(path)
            .with_context(|| format!("failed to read config {}", path.display()))?,
        None => CacheConfig::default(),
    };
    let mut config = config.merge_env().context("invalid IMGCACHE_* environment")?;
    if let Some(dir) = cache_dir {
        config.disk_cache_dir = dir;
    }
    Ok(config)
}

async fn run_with_cache(command: Commands, config: CacheConfig) -> Result<()> {
    let manager = CacheManager::with_defaults(config);

    match command {
        Commands::Encode { source, components_x, components_y } => {
            let hash = manager
                .encode_blur_hash(&ImageSource::new(source.as_str()), components_x, components_y)
                .await
                .with_context(|| format!("failed to encode {source}"))?;
            println!("{hash}");
            Ok(())
        }
        Commands::Prefetch { sources } => run_prefetch(&manager, sources).await,
        Commands::ClearDisk => {
            println!("{}", manager.clear_disk_cache().await);
            Ok(())
        }
        Commands::Stats => print_json(&stats(&manager)),
        Commands::Decode { .. } | Commands::Version => Ok(()),
    }
}

async fn run_prefetch(manager: &CacheManager, sources: Vec<String>) -> Result<()> {
    for handle in manager.prefetch_many(sources.iter().map(String::as_str)) {
        handle.await.context("prefetch task panicked")?;
    }

    let failed: Vec<String> = sources
        .iter()
        .filter(|uri| manager.state(&ImageSource::new(uri.as_str())) != Some(EntryState::Ready))
        .cloned()
        .collect();
    let payload =
        PrefetchOutput { requested: sources.len(), ready: sources.len() - failed.len(), failed };
    print_json(&payload)?;

    if !payload.failed.is_empty() {
        anyhow::bail!("{} of {} sources failed to load", payload.failed.len(), payload.requested);
    }
    Ok(())
}

fn stats(manager: &CacheManager) -> StatsOutput {
    let memory = manager.memory_stats();
    let disk = manager.disk_stats().map(|disk| TierOutput {
        entries: disk.entry_count,
        used_bytes: disk.disk_used,
        limit_bytes: manager.config().disk_cache_size,
        dir: Some(manager.config().disk_cache_dir.display().to_string()),
    });

    StatsOutput {
        memory: TierOutput {
            entries: memory.entry_count,
            used_bytes: memory.memory_used,
            limit_bytes: memory.memory_limit,
            dir: None,
        },
        disk,
    }
}

fn run_decode(hash: &str, width: u32, height: u32, punch: f64, output: &Path) -> Result<()> {
    let pixels = BlurHashOptions::new(hash)
        .with_size(width, height)
        .with_punch(punch)
        .decode()
        .context("invalid blur hash")?;

    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    pixels
        .into_rgba_image()
        .save(output)
        .with_context(|| format!("failed to write image to {}", output.display()))?;

    println!("{}", output.display());
    Ok(())
}

fn print_json<T: Serialize>(payload: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(payload)?;
    println!("{json}");
    Ok(())
}
