// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! nzbfs — a thin CLI that drives the read path directly.
//!
//! The real front-ends (HTTP/WebDAV/FUSE) are out of scope for this crate;
//! this binary exists so a developer can exercise `VirtualFile` without
//! standing one up.
//!
//! Usage:
//!   nzbfs stat --config config.toml <path>
//!   nzbfs ls   --config config.toml <dir>
//!   nzbfs cat  --config config.toml <path> [--from N] [--to N]

use std::io::{SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::EnvFilter;

use nzbfs::cache::LruSegmentCache;
use nzbfs::config::Config;
use nzbfs::file::{ReadHint, VirtualFile};
use nzbfs::health::InMemoryHealthStore;
use nzbfs::pool::ArticlePool;
use nzbfs::store::{FsMetadataStore, MetadataStore};

#[derive(Parser)]
#[command(name = "nzbfs", about = "Usenet-backed virtual filesystem read path", version)]
struct Cli {
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the logical size and status of a virtual file.
    Stat { path: String },
    /// List files and subdirectories under a virtual directory.
    Ls { dir: String },
    /// Stream a virtual file's bytes (optionally a sub-range) to stdout.
    Cat {
        path: String,
        #[arg(long)]
        from: Option<u64>,
        #[arg(long)]
        to: Option<u64>,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let cfg = match Config::from_file(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let metadata: Arc<dyn MetadataStore> =
        Arc::new(FsMetadataStore::new(cfg.store.root.clone(), cfg.store.protected_dirs.clone()));
    let health = Arc::new(InMemoryHealthStore::new());
    let pool: Arc<dyn ArticlePool> = Arc::new(UnconfiguredArticlePool);
    let cache = if cfg.cache.enabled {
        Some(Arc::new(LruSegmentCache::new(cfg.cache.capacity)) as Arc<dyn nzbfs::cache::SegmentCache>)
    } else {
        None
    };

    let result = match cli.command {
        Command::Stat { path } => run_stat(metadata, &path),
        Command::Ls { dir } => run_ls(metadata, &dir),
        Command::Cat { path, from, to } => {
            run_cat(metadata, health, pool, cache, cfg.downloader.clone(), &path, from, to).await
        }
    };

    if let Err(e) = result {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn run_stat(metadata: Arc<dyn MetadataStore>, path: &str) -> nzbfs::error::Result<()> {
    let descriptor = metadata.read_descriptor(path)?;
    println!("path       : {path}");
    println!("size       : {} bytes", descriptor.size);
    println!("status     : {}", if descriptor.is_corrupted() { "corrupted" } else { "ok" });
    println!("encryption : {:?}", descriptor.encryption_kind());
    println!("segments   : {}", descriptor.segments.len());
    if !descriptor.nested_sources.is_empty() {
        println!("nested     : {} sources", descriptor.nested_sources.len());
    }
    Ok(())
}

fn run_ls(metadata: Arc<dyn MetadataStore>, dir: &str) -> nzbfs::error::Result<()> {
    for sub in metadata.list_subdirs(dir)? {
        println!("{sub}/");
    }
    for file in metadata.list_files(dir)? {
        println!("{file}");
    }
    Ok(())
}

async fn run_cat(
    metadata: Arc<dyn MetadataStore>,
    health: Arc<nzbfs::health::InMemoryHealthStore>,
    pool: Arc<dyn ArticlePool>,
    cache: Option<Arc<dyn nzbfs::cache::SegmentCache>>,
    downloader_config: nzbfs::config::DownloaderConfig,
    path: &str,
    from: Option<u64>,
    to: Option<u64>,
) -> nzbfs::error::Result<()> {
    let vf = VirtualFile::open(path, metadata, health, pool, cache, downloader_config)?;
    if let Some(start) = from {
        vf.seek(SeekFrom::Start(start)).await?;
    }
    let hint = to.map(|range_end| ReadHint { range_end: Some(range_end), ..Default::default() });

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = vf.read(&mut buf, hint.as_ref()).await?;
        if n == 0 {
            break;
        }
        out.write_all(&buf[..n]).map_err(nzbfs::error::ReaderError::Io)?;
    }
    vf.close().await
}

/// Placeholder pool used only so the CLI links and runs against metadata
/// that has no real NNTP backend configured; every fetch fails with the
/// permanent "article not found" error rather than hanging. A real
/// deployment injects an actual `ArticlePool` implementation instead.
struct UnconfiguredArticlePool;

#[async_trait::async_trait]
impl ArticlePool for UnconfiguredArticlePool {
    async fn body_stream(&self, message_id: &str, _sink: &mut Vec<u8>) -> nzbfs::error::Result<usize> {
        Err(nzbfs::error::ReaderError::ArticleNotFound { message_id: message_id.to_string() })
    }
}
