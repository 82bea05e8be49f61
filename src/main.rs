//! blockcache - block-granular read-through disk cache
//!
//! Runs the cache daemon with its control socket, or one-shot commands
//! against the local cache directory.

use anyhow::{anyhow, Context, Result};
use std::env;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use blockcache::daemon::read_through;
use blockcache::ipc::IpcServer;
use blockcache::purge::{self, PurgePolicy};
use blockcache::{CacheDaemon, CacheFileInfo, Config};

/// CLI command
#[derive(Debug)]
enum Command {
    /// Run the daemon (default)
    Serve,
    /// Read a file through the cache to stdout
    Cat { url: String },
    /// Print a cache info file
    Dump { path: PathBuf },
    /// Run one purge sweep
    Purge,
    /// Show help
    Help,
}

fn print_help() {
    eprintln!(
        r#"blockcache - Block-granular read-through disk cache

USAGE:
    blockcache                      # Run daemon (default)
    blockcache serve
    blockcache cat <url>
    blockcache dump <file.cinfo>
    blockcache purge
    blockcache help

COMMANDS:
    serve   Run the daemon and its control socket
    cat     Read a remote file through the cache and write it to stdout
    dump    Print block size, progress and access records of a .cinfo file
    purge   Remove stale cache entries once and exit
    help    Show this help message

ENVIRONMENT:
    BLOCKCACHE_CONFIG   Path to a JSON config file
    RUST_LOG            Log level (trace, debug, info, warn, error)
"#
    );
}

fn parse_args() -> Result<Command> {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        return Ok(Command::Serve);
    }

    match args[1].as_str() {
        "serve" => Ok(Command::Serve),
        "cat" => {
            let url = args.get(2).ok_or_else(|| anyhow!("Usage: blockcache cat <url>"))?;
            Ok(Command::Cat { url: url.clone() })
        }
        "dump" => {
            let path = args
                .get(2)
                .ok_or_else(|| anyhow!("Usage: blockcache dump <file.cinfo>"))?;
            Ok(Command::Dump {
                path: PathBuf::from(path),
            })
        }
        "purge" => Ok(Command::Purge),
        "help" | "--help" | "-h" => Ok(Command::Help),
        _ => {
            eprintln!("Unknown command: {}", args[1]);
            Ok(Command::Help)
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    let log_level = env::var("RUST_LOG")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(Level::INFO);

    // Logs go to stderr so `cat` output stays clean.
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let command = match parse_args() {
        Ok(cmd) => cmd,
        Err(e) => {
            eprintln!("Error: {}", e);
            print_help();
            std::process::exit(1);
        }
    };

    match command {
        Command::Serve => serve().await,
        Command::Cat { url } => {
            let daemon = CacheDaemon::new(Config::load()?)?;
            let bytes = tokio::task::spawn_blocking(move || cat(&daemon, &url)).await??;
            info!(bytes = bytes, "Done");
            Ok(())
        }
        Command::Dump { path } => dump(&path),
        Command::Purge => {
            let config = Config::load()?;
            let policy = PurgePolicy::from(&config.purge);
            let root = config.cache_dir.clone();
            let report = tokio::task::spawn_blocking(move || purge::sweep(&root, &policy, |_| false)).await??;
            for path in &report.removed {
                println!("{}", path);
            }
            Ok(())
        }
        Command::Help => {
            print_help();
            Ok(())
        }
    }
}

async fn serve() -> Result<()> {
    info!("Starting blockcache daemon");

    let config = Config::load()?;
    let socket_path = config.socket_path.clone();
    let daemon = Arc::new(CacheDaemon::new(config)?);

    let mut ipc_server = IpcServer::new(Arc::clone(&daemon), socket_path);
    if let Err(e) = ipc_server.start().await {
        error!(error = %e, "Failed to start IPC server");
        return Err(e);
    }
    let ipc_server = Arc::new(ipc_server);

    let server = Arc::clone(&ipc_server);
    let ipc_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "IPC server error");
        }
    });
    let purge_handle = daemon.spawn_purge_timer();

    info!("Daemon ready. Waiting for commands...");

    // Wait for Ctrl+C
    tokio::signal::ctrl_c().await?;

    info!("Received shutdown signal, stopping fetchers...");
    purge_handle.abort();
    ipc_handle.abort();
    daemon.shutdown().await;
    ipc_server.stop()?;

    info!("Shutdown complete.");
    Ok(())
}

/// Stream a file through the cache to stdout
fn cat(daemon: &CacheDaemon, url: &str) -> Result<u64> {
    let origin = daemon.open_origin(url)?;
    let stdout = io::stdout();
    let mut out = stdout.lock();
    read_through(
        daemon.registry(),
        origin,
        daemon.config().block_size as usize,
        &mut out,
    )
}

/// Print the contents of a `.cinfo` file
fn dump(path: &Path) -> Result<()> {
    let file = File::open(path).with_context(|| format!("Failed to open {:?}", path))?;
    let mut info = CacheFileInfo::new(0);
    if info.read_header(&file)? == 0 {
        return Err(anyhow!("{:?} is not a valid cache info file", path));
    }

    let map = info.block_map();
    println!("file:        {}", path.display());
    println!("block size:  {}", info.block_size());
    println!("blocks:      {}", info.block_count());
    println!("downloaded:  {}", info.downloaded_blocks());
    println!("complete:    {}", info.is_complete());

    let bits: String = (0..map.len())
        .map(|i| if map.test(i) { '1' } else { '0' })
        .collect();
    println!("bitmap:      {}", bits);

    println!("accesses:    {}", info.access_count());
    for (i, stat) in info.access_stats().iter().enumerate() {
        println!(
            "  [{}] open {} close {} bytes {} hits {} misses {}",
            i, stat.open_time, stat.close_time, stat.bytes_transferred, stat.hits, stat.misses
        );
    }
    Ok(())
}
