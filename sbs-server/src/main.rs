//! sbs-tracker: CLI + live tracker for BaseStation (SBS-1) feeds.

use std::future::Future;
use std::io::{self, BufRead};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use clap::{Args, Parser, Subcommand};
use comfy_table::{Cell, Table};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use sbs_core::cache::AggregateCache;
use sbs_core::config::{self, Config};
use sbs_core::plane::PlaneSummary;
use sbs_core::store::{MemoryStore, PlaneStore};
use sbs_core::types::*;

use crate::db::Database;
use crate::dispatcher::{Dispatcher, DispatcherConfig};
use crate::feed::FeedConfig;
use crate::web::AppState;

mod db;
mod dispatcher;
mod feed;
mod web;

#[derive(Parser)]
#[command(name = "sbs", version, about = "BaseStation (SBS-1) aircraft tracker")]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace). RUST_LOG overrides.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Config file [default: ~/.sbs-tracker/config.yaml]
    #[arg(long, global = true, env = "SBS_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to a feed, track aircraft and serve the JSON API
    Serve(ServeArgs),

    /// Decode an SBS capture file and print an aircraft table
    Replay {
        /// Path to file with one SBS record per line, or - for stdin
        file: PathBuf,
    },

    /// List aircraft stored in the database
    Planes {
        /// SQLite database path
        #[arg(long, env = "SBS_DB_PATH")]
        db_path: Option<String>,

        /// Only aircraft seen after this unix time (seconds)
        #[arg(long)]
        since: Option<f64>,
    },

    /// Show database statistics
    Stats {
        /// SQLite database path
        #[arg(long, env = "SBS_DB_PATH")]
        db_path: Option<String>,
    },

    /// Print the effective configuration
    Config {
        /// Write it to the config file
        #[arg(long)]
        save: bool,
    },
}

/// Overrides for values normally taken from the config file.
#[derive(Args, Default)]
struct ServeArgs {
    /// BaseStation feed address (host:port)
    #[arg(short = 'a', long, env = "SBS_FEED")]
    feed: Option<String>,

    /// HTTP bind address
    #[arg(long, env = "SBS_HOST")]
    host: Option<String>,

    /// HTTP port
    #[arg(short, long, env = "SBS_PORT")]
    port: Option<u16>,

    /// SQLite database path
    #[arg(long, env = "SBS_DB_PATH")]
    db_path: Option<String>,

    /// Directory for static files
    #[arg(long)]
    web_root: Option<String>,

    /// Seconds between eviction passes
    #[arg(long)]
    evict_interval: Option<u64>,

    /// Seconds of silence before an aircraft is evicted
    #[arg(long)]
    evict_window: Option<u64>,

    /// Report queue capacity
    #[arg(long)]
    queue_capacity: Option<usize>,

    /// Reconnect backoff cap in seconds
    #[arg(long)]
    max_backoff: Option<u64>,
}

impl ServeArgs {
    fn apply(self, config: &mut Config) {
        if let Some(v) = self.feed {
            config.feed.addr = v;
        }
        if let Some(v) = self.max_backoff {
            config.feed.max_backoff_secs = v;
        }
        if let Some(v) = self.host {
            config.server.host = v;
        }
        if let Some(v) = self.port {
            config.server.port = v;
        }
        if let Some(v) = self.web_root {
            config.server.web_root = v;
        }
        if let Some(v) = self.db_path {
            config.database.path = v;
        }
        if let Some(v) = self.evict_interval {
            config.cache.evict_interval_secs = v;
        }
        if let Some(v) = self.evict_window {
            config.cache.evict_window_secs = v;
        }
        if let Some(v) = self.queue_capacity {
            config.cache.queue_capacity = v;
        }
    }
}

fn log_level(verbose: u8) -> &'static str {
    match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    }
}

fn init_logging(verbose: u8) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level(verbose)));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut config = config::load_config(cli.config.as_deref());

    match cli.command {
        Commands::Serve(args) => {
            args.apply(&mut config);
            cmd_serve(config).await;
        }
        Commands::Replay { file } => cmd_replay(file),
        Commands::Planes { db_path, since } => {
            cmd_planes(&db_path.unwrap_or(config.database.path), since)
        }
        Commands::Stats { db_path } => cmd_stats(&db_path.unwrap_or(config.database.path)),
        Commands::Config { save } => cmd_config(&config, cli.config, save),
    }
}

fn open_db(path: &str) -> Database {
    Database::open(path).unwrap_or_else(|e| {
        error!("cannot open database {path}: {e}");
        std::process::exit(1);
    })
}

/// Resolves once `true` is sent on the stop channel (or the sender is dropped).
fn stopped(mut rx: watch::Receiver<bool>) -> impl Future<Output = ()> + Send + 'static {
    async move {
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

async fn cmd_serve(config: Config) {
    let evict_window = config.cache.evict_window().unwrap_or_else(|e| {
        error!("{e}");
        std::process::exit(1);
    });
    let store = Arc::new(open_db(&config.database.path));
    info!("database at {}", config.database.path);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .unwrap_or_else(|e| {
            error!("cannot listen on {addr}: {e}");
            std::process::exit(1);
        });

    let (dispatcher, handle, reports) = Dispatcher::new(
        store,
        DispatcherConfig {
            evict_interval: Duration::from_secs(config.cache.evict_interval_secs.max(1)),
            evict_window,
            queue_capacity: config.cache.queue_capacity,
        },
    );

    let (stop_tx, stop_rx) = watch::channel(false);

    let feed_task = tokio::spawn(feed::run(
        FeedConfig::new(
            config.feed.addr.clone(),
            Duration::from_secs(config.feed.max_backoff_secs),
        ),
        reports,
    ));
    let dispatcher_task = tokio::spawn(dispatcher.run(stopped(stop_rx.clone())));

    let app = web::build_router(Arc::new(AppState { dispatcher: handle }), &config.server.web_root);
    let server_task = tokio::spawn(web::serve(listener, app, stopped(stop_rx)));

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("interrupt received, shutting down"),
        Err(e) => error!("cannot listen for interrupt, shutting down: {e}"),
    }
    let _ = stop_tx.send(true);
    feed_task.abort();

    if let Err(e) = dispatcher_task.await {
        error!("dispatcher task failed: {e}");
    }
    match server_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("http server failed: {e}"),
        Err(e) => error!("http server task failed: {e}"),
    }
}

fn cmd_replay(file: PathBuf) {
    let reader: Box<dyn BufRead> = if file.to_str() == Some("-") {
        Box::new(io::stdin().lock())
    } else {
        let f = std::fs::File::open(&file).unwrap_or_else(|e| {
            error!("cannot open {}: {e}", file.display());
            std::process::exit(1);
        });
        Box::new(io::BufReader::new(f))
    };

    let store = MemoryStore::new();
    let mut cache = AggregateCache::new();
    let mut total_lines = 0u64;
    let mut decoded = 0u64;

    for line in reader.lines() {
        let Ok(line) = line else { continue };
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        total_lines += 1;

        if let Some(report) = feed::decode_logged(line) {
            decoded += 1;
            cache.get_or_create(report.icao, &store).apply(&report);
        }
    }

    println!();
    println!(
        "Lines: {total_lines} read, {decoded} decoded, {} aircraft",
        cache.len()
    );
    println!();

    let planes: Vec<PlaneSummary> = cache.active_since(None).iter().map(|p| p.summary()).collect();
    print_planes(&planes);
}

fn cmd_planes(db_path: &str, since: Option<f64>) {
    let database = open_db(db_path);
    let since = since.and_then(from_unix_secs);

    let planes = database.load_all_since(since).unwrap_or_else(|e| {
        error!("cannot read aircraft from {db_path}: {e}");
        std::process::exit(1);
    });

    println!();
    println!("{} aircraft in {db_path}", planes.len());
    println!();

    let summaries: Vec<PlaneSummary> = planes.iter().map(|p| p.summary()).collect();
    print_planes(&summaries);
}

fn cmd_stats(db_path: &str) {
    let database = open_db(db_path);
    let stats = database.stats().unwrap_or_else(|e| {
        error!("cannot read stats from {db_path}: {e}");
        std::process::exit(1);
    });

    let when = |t: Option<chrono::DateTime<chrono::Utc>>| {
        t.map(|t| t.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or("-".into())
    };

    println!();
    println!("Database: {db_path}");
    println!();
    println!("  Aircraft:   {}", stats.planes);
    println!("  Callsigns:  {}", stats.callsigns);
    println!("  Squawks:    {}", stats.squawks);
    println!("  Locations:  {}", stats.locations);
    println!("  Messages:   {}", stats.messages);
    println!("  Oldest:     {}", when(stats.oldest_seen));
    println!("  Newest:     {}", when(stats.newest_seen));
    println!();
}

fn cmd_config(config: &Config, path: Option<PathBuf>, save: bool) {
    print!("{}", config::serialize_config(config));
    if save {
        match config::save_config(config, path.as_deref()) {
            Ok(written) => info!("config written to {}", written.display()),
            Err(e) => {
                error!("{e}");
                std::process::exit(1);
            }
        }
    }
}

fn print_planes(planes: &[PlaneSummary]) {
    if planes.is_empty() {
        return;
    }

    let mut table = Table::new();
    table.set_header(vec![
        "ICAO", "Callsign", "Squawk", "Alt (ft)", "Speed (kts)", "Track", "VRate", "Lat", "Lon",
        "Flags", "Last seen",
    ]);

    for p in planes {
        let mut flags = String::new();
        for (set, c) in [
            (p.emergency, 'E'),
            (p.squawk_change, 'S'),
            (p.ident, 'I'),
            (p.on_ground, 'G'),
        ] {
            if set {
                flags.push(c);
            }
        }

        table.add_row(vec![
            Cell::new(&p.icao),
            Cell::new(p.callsign.as_deref().unwrap_or("-")),
            Cell::new(p.squawk.as_deref().unwrap_or("-")),
            Cell::new(p.altitude_ft),
            Cell::new(format!("{:.0}", p.speed_kts)),
            Cell::new(format!("{:.1}", p.track_deg)),
            Cell::new(format!("{:+}", p.vertical_rate_fpm)),
            Cell::new(
                p.location
                    .map(|l| format!("{:.4}", l.lat))
                    .unwrap_or("-".into()),
            ),
            Cell::new(
                p.location
                    .map(|l| format!("{:.4}", l.lon))
                    .unwrap_or("-".into()),
            ),
            Cell::new(if flags.is_empty() { "-".into() } else { flags }),
            Cell::new(
                p.last_seen
                    .map(|t| t.with_timezone(&Local).format("%H:%M:%S").to_string())
                    .unwrap_or("-".into()),
            ),
        ]);
    }

    println!("{table}");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level() {
        assert_eq!(log_level(0), "info");
        assert_eq!(log_level(1), "debug");
        assert_eq!(log_level(5), "trace");
    }

    #[test]
    fn test_serve_overrides() {
        let mut config = Config::default();
        ServeArgs {
            feed: Some("radar:30003".into()),
            port: Some(9000),
            evict_window: Some(300),
            ..Default::default()
        }
        .apply(&mut config);

        assert_eq!(config.feed.addr, "radar:30003");
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.cache.evict_window_secs, 300);
        assert_eq!(config.server.host, Config::default().server.host);
    }

    #[test]
    fn test_cli_parses() {
        let cli = Cli::try_parse_from(["sbs", "-vv", "serve", "-a", "radar:30003", "-p", "9000"])
            .unwrap();
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Commands::Serve(args) => {
                assert_eq!(args.feed.as_deref(), Some("radar:30003"));
                assert_eq!(args.port, Some(9000));
            }
            _ => panic!("expected serve"),
        }
    }

    #[tokio::test]
    async fn test_stopped_resolves_on_signal() {
        let (tx, rx) = watch::channel(false);
        let wait = tokio::spawn(stopped(rx));
        tx.send(true).unwrap();
        wait.await.unwrap();
    }
}
