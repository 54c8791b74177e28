//! Binary entrypoint for the meshtrace CLI.
//!
//! Commands:
//! - `start` - subscribe to the MQTT feed and store every packet until Ctrl-C
//! - `init` - write a starter `config.toml`
//! - `cleanup` - run one retention pass against the configured database
//! - `trace <record-id>` - print one reconstructed traceroute as JSON
//! - `graph <probe-id>` - print the combined graph of every reception of a probe as JSON
//!
//! See the library crate docs for module-level details: `meshtrace::`.
use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use log::info;

use meshtrace::config::Config;
use meshtrace::node_id::parse_node_id;
use meshtrace::service::CollectorService;

#[derive(Parser)]
#[command(name = "meshtrace")]
#[command(about = "Meshtastic MQTT collector with traceroute path reconstruction")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Subscribe to the feed and store packets
    Start,
    /// Write a default configuration file
    Init,
    /// Run one retention cleanup pass
    Cleanup,
    /// Print one stored traceroute, reconstructed
    Trace {
        /// Row id in packet_history
        record_id: i64,
    },
    /// Print the combined graph for a probe
    Graph {
        /// Probe (mesh packet) id, decimal or `!xxxxxxxx`/hex
        probe_id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Init = cli.command {
        init_logging(&None, cli.verbose);
        Config::create_default(&cli.config).await?;
        println!("Wrote default configuration to {}", cli.config);
        return Ok(());
    }

    let config = Config::load(&cli.config).await?;
    init_logging(&Some(config.clone()), cli.verbose);

    match cli.command {
        Commands::Start => {
            info!("Starting meshtrace v{}", env!("CARGO_PKG_VERSION"));
            let mut service = CollectorService::open(config)?;
            service.start();
            service.wait().await;
            let totals = service.shutdown().await;
            println!("{}", totals);
        }
        Commands::Cleanup => {
            let service = CollectorService::open(config)?;
            match service.cleanup_once().await {
                Some(report) => println!(
                    "Removed {} packets and {} nodes",
                    report.packets_deleted, report.nodes_deleted
                ),
                None => println!("Nothing removed (retention disabled or pass failed)"),
            }
        }
        Commands::Trace { record_id } => {
            let service = CollectorService::open(config)?;
            let packet = service.traceroute(record_id)?;
            println!("{}", serde_json::to_string_pretty(&packet.summary())?);
        }
        Commands::Graph { probe_id } => {
            let probe = probe_id
                .parse::<u32>()
                .ok()
                .or_else(|| parse_node_id(&probe_id))
                .ok_or_else(|| anyhow!("invalid probe id '{}'", probe_id))?;
            let service = CollectorService::open(config)?;
            let graph = service.probe_graph(probe)?;
            println!("{}", serde_json::to_string_pretty(&graph)?);
        }
        Commands::Init => {}
    }

    Ok(())
}

fn init_logging(config: &Option<Config>, verbosity: u8) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    // CLI verbosity overrides the configured level
    let base_level = match verbosity {
        0 => config
            .as_ref()
            .and_then(|c| c.logging.level.parse::<log::LevelFilter>().ok())
            .unwrap_or(log::LevelFilter::Info),
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(base_level);

    let log_file = config
        .as_ref()
        .and_then(|cfg| cfg.logging.file.as_ref())
        .and_then(|file| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(file)
                .ok()
        });

    match log_file {
        Some(f) => {
            let write_mutex = std::sync::Arc::new(std::sync::Mutex::new(f));
            // Mirror to the console only when attached to a terminal
            let is_tty = atty::is(atty::Stream::Stdout);
            builder.format(move |fmt, record| {
                let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
                let line = format!("{} [{}] {}", ts, record.level(), record.args());
                if let Ok(mut guard) = write_mutex.lock() {
                    let _ = writeln!(guard, "{}", line);
                }
                if is_tty {
                    writeln!(fmt, "{}", line)
                } else {
                    Ok(())
                }
            });
        }
        None => {
            builder.format(|fmt, record| {
                let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
                writeln!(fmt, "{} [{}] {}", ts, record.level(), record.args())
            });
        }
    }
    let _ = builder.try_init();
}
