//! `tcachefs`: the reference CLI host for the on-demand transcoding cache.
//!
//! Wires `tcache_core::Cache` to the `FfmpegTranscoderFactory` and the
//! reference `VirtualView` adapter, the way `ferrex-server`'s `main.rs`
//! wires its `TranscodingService` to the rest of the server (SPEC_FULL.md
//! §10.1/§10.3/§10.4). No FUSE mount is attempted (DESIGN.md Open Question
//! 6); `serve` instead runs the maintenance leader loop against a real
//! source tree so the persistence/eviction/leader-election machinery can be
//! exercised end-to-end, while `probe`/`read`/`stats` exercise the
//! `VirtualView` surface directly.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tcache_core::config::CoreConfig;
use tcache_core::key::{GainMode, TargetFormat, TargetRecipe};
use tcache_core::leader::MaintenanceLeader;
use tcache_core::registry::{probe_disk_pressure, Cache};
use tcache_fs::codec::factory::FfmpegTranscoderFactory;
use tcache_fs::VirtualView;

/// Command line arguments for the `tcachefs` reference host.
#[derive(Parser, Debug)]
#[command(name = "tcachefs")]
#[command(about = "Read-only transcoding cache: presents a source audio/video library as a different format, transcoding on demand")]
struct Args {
    /// Directory holding the original source files.
    #[arg(long, env = "TCACHE_SOURCE_ROOT")]
    source_root: PathBuf,

    /// Directory under which cache artifacts live (overrides TCACHE_CACHE_ROOT).
    #[arg(long, env = "TCACHE_CACHE_ROOT")]
    cache_root: Option<PathBuf>,

    /// Target output format.
    #[arg(long, default_value = "mp3")]
    target_format: TargetFormatArg,

    /// Constant bitrate in kbps (ignored if `--vbr` is set).
    #[arg(long, default_value_t = 192)]
    bitrate_kbps: u32,

    /// Use VBR encoding instead of a fixed bitrate.
    #[arg(long)]
    vbr: bool,

    /// Path to the `ffmpeg` binary.
    #[arg(long, env = "TCACHE_FFMPEG_PATH", default_value = "ffmpeg")]
    ffmpeg_path: String,

    /// Path to the `ffprobe` binary.
    #[arg(long, env = "TCACHE_FFPROBE_PATH", default_value = "ffprobe")]
    ffprobe_path: String,

    /// Source extensions this view treats as decodable.
    #[arg(long, value_delimiter = ',', default_value = "flac,ogg,oga")]
    source_extensions: Vec<String>,

    #[command(subcommand)]
    command: TcacheCommand,
}

#[derive(Clone, Debug, clap::ValueEnum)]
enum TargetFormatArg {
    Mp3,
    Mp4,
}

impl From<TargetFormatArg> for TargetFormat {
    fn from(v: TargetFormatArg) -> Self {
        match v {
            TargetFormatArg::Mp3 => TargetFormat::Mp3,
            TargetFormatArg::Mp4 => TargetFormat::Mp4,
        }
    }
}

#[derive(Subcommand, Debug)]
enum TcacheCommand {
    /// Run the maintenance leader loop until interrupted. Does not mount a
    /// file system (no FUSE binding is used by this workspace); this is the
    /// reference host for persistence/eviction/leader-election.
    Serve {
        /// Interval between maintenance ticks.
        #[arg(long, default_value = "30s")]
        tick_interval: String,
    },
    /// `getattr` a single virtual path and print its best-known size.
    Probe { virtual_path: PathBuf },
    /// Read a byte range of a virtual path and write it to stdout.
    Read {
        virtual_path: PathBuf,
        #[arg(long, default_value_t = 0)]
        offset: u64,
        #[arg(long, default_value_t = 65536)]
        len: usize,
    },
    /// List the virtual directory's entries.
    Readdir { dir: Option<PathBuf> },
    /// Run one eviction pass and print what was deleted.
    Prune,
    /// Print summary statistics about the in-memory registry.
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "tcache_fs=info,tcache_core=info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let mut config = CoreConfig::from_env();
    if let Some(root) = &args.cache_root {
        config.cache_root = root.clone();
    }
    let config = Arc::new(config);
    info!(cache_root = %config.cache_root.display(), mount_id = %config.mount_id(), "tcachefs starting");

    let recipe = TargetRecipe {
        format: args.target_format.into(),
        bitrate_kbps: if args.vbr { None } else { Some(args.bitrate_kbps) },
        vbr: args.vbr,
        gain_mode: GainMode::Off,
        sample_rate_cap: None,
        quality: 2,
    };

    let factory = Arc::new(FfmpegTranscoderFactory::new(args.ffmpeg_path.clone(), args.ffprobe_path.clone()));
    let cache = Arc::new(Cache::new(config.clone(), factory));
    let view = VirtualView::new(args.source_root.clone(), cache.clone(), recipe, args.source_extensions.clone());

    match args.command {
        TcacheCommand::Serve { tick_interval } => run_serve(cache, config, &tick_interval).await?,
        TcacheCommand::Probe { virtual_path } => {
            let attr = view.getattr(&virtual_path).await?;
            println!("size={} mtime={:?}", attr.size, attr.mtime);
        }
        TcacheCommand::Read { virtual_path, offset, len } => {
            let mut buf = vec![0u8; len];
            let n = view.read(&virtual_path, &mut buf, offset, len).await?;
            use std::io::Write;
            std::io::stdout().write_all(&buf[..n])?;
        }
        TcacheCommand::Readdir { dir } => {
            let entries = view.readdir(dir.as_deref().unwrap_or_else(|| std::path::Path::new("")))?;
            for entry in entries {
                println!("{}{}", entry.name, if entry.is_dir { "/" } else { "" });
            }
        }
        TcacheCommand::Prune => {
            let disk = probe_disk_pressure(&config.cache_root);
            let decisions = cache.prune(&disk)?;
            println!("evicted {} entries", decisions.len());
            for d in decisions {
                println!("  {} ({:?})", d.id, d.reason);
            }
        }
        TcacheCommand::Stats => {
            println!("entries: {}", cache.len());
        }
    }

    Ok(())
}

async fn run_serve(cache: Arc<Cache>, config: Arc<CoreConfig>, tick_interval: &str) -> anyhow::Result<()> {
    let interval = humantime::parse_duration(tick_interval).unwrap_or(Duration::from_secs(30));
    let shutting_down = cache.shutting_down_flag();
    let leader = Arc::new(MaintenanceLeader::new(&config.cache_root, &config.mount_id(), shutting_down.clone())?);

    let cache_for_sweep = cache.clone();
    let config_for_sweep = config.clone();
    let leader_task = tokio::spawn(leader.run(interval, move || {
        let cache = cache_for_sweep.clone();
        let config = config_for_sweep.clone();
        async move {
            let disk = probe_disk_pressure(&config.cache_root);
            match cache.prune(&disk) {
                Ok(decisions) if !decisions.is_empty() => {
                    info!(count = decisions.len(), "maintenance sweep evicted entries")
                }
                Ok(_) => {}
                Err(err) => warn!(%err, "maintenance sweep failed"),
            }
        }
    }));

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested, draining producers");
    cache.request_shutdown();
    leader_task.abort();
    Ok(())
}
