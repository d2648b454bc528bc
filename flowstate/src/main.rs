//! flowstate-sim: drive synthetic traffic through a flow table
//!
//! Runs a table with its maintenance scheduler, replays a deterministic mix
//! of TCP, UDP and rate-limited flows against it and prints the resulting
//! statistics as JSON.
//!
//! # Usage
//!
//! ```bash
//! # Run with defaults
//! ./flowstate-sim
//!
//! # Run with a configuration file for 30 seconds
//! ./flowstate-sim -c /path/to/config.json --seconds 30
//!
//! # Run with environment overrides
//! FLOWSTATE_LOG_LEVEL=debug ./flowstate-sim --flows 5000
//! ```

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::signal;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

use flowstate::config::{load_config_with_env, SimulatorConfig};
use flowstate::flow::{
    FlowKey, IpProtocol, LimitMask, LimitSpec, PacketInfo, RuleRef, TcpFlags, TrackKind,
};
use flowstate::{ChannelSink, FlowTable, MaintenanceScheduler};

const KEEP_STATE_RULE: RuleRef = RuleRef::new(100, 0);
const LIMIT_RULE: RuleRef = RuleRef::new(200, 0);
const UDP_RULE: RuleRef = RuleRef::new(300, 1);

/// Concurrent flows allowed per source address under `LIMIT_RULE`
const FLOWS_PER_SOURCE: u32 = 4;

/// Command-line arguments
struct Args {
    /// Configuration file path
    config_path: Option<PathBuf>,
    /// Generate default configuration
    generate_config: bool,
    /// Check configuration only
    check_config: bool,
    /// Flows to create
    flows: u32,
    /// Simulated run time
    seconds: u64,
}

impl Args {
    fn parse() -> Self {
        let mut args = std::env::args().skip(1);
        let mut config_path = None;
        let mut generate_config = false;
        let mut check_config = false;
        let mut flows = 1000;
        let mut seconds = 10;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-c" | "--config" => {
                    if let Some(path) = args.next() {
                        config_path = Some(PathBuf::from(path));
                    }
                }
                "-g" | "--generate-config" => {
                    generate_config = true;
                }
                "--check" => {
                    check_config = true;
                }
                "--flows" => {
                    flows = parse_number(&arg, args.next());
                }
                "--seconds" => {
                    seconds = parse_number(&arg, args.next());
                }
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "-v" | "--version" => {
                    println!("flowstate-sim v{}", flowstate::VERSION);
                    std::process::exit(0);
                }
                _ => {
                    eprintln!("Unknown argument: {arg}");
                    print_help();
                    std::process::exit(1);
                }
            }
        }

        Self {
            config_path,
            generate_config,
            check_config,
            flows,
            seconds,
        }
    }
}

fn parse_number<T: std::str::FromStr>(flag: &str, value: Option<String>) -> T {
    match value.as_deref().map(str::parse::<T>) {
        Some(Ok(n)) => n,
        _ => {
            eprintln!("{flag} expects a number");
            std::process::exit(1);
        }
    }
}

fn print_help() {
    println!(
        r#"flowstate-sim v{}

Drive synthetic flows through a stateful flow table.

USAGE:
    flowstate-sim [OPTIONS]

OPTIONS:
    -c, --config <PATH>     Configuration file path [default: built-in defaults]
    -g, --generate-config   Write the default configuration to --config and exit
    --check                 Check configuration and exit
    --flows <N>             Flows to create [default: 1000]
    --seconds <N>           Run time in seconds [default: 10]
    -h, --help              Print help information
    -v, --version           Print version information

ENVIRONMENT:
    FLOWSTATE_LOG_LEVEL     Override log level (trace, debug, info, warn, error)
    FLOWSTATE_MAX_RECORDS   Override the record limit
    FLOWSTATE_BUCKETS       Override the initial bucket count
"#,
        flowstate::VERSION
    );
}

/// Initialize logging
fn init_logging(config: &SimulatorConfig) -> Result<()> {
    let level = match config.log.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("tokio=warn".parse()?);

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.log.target)
        .with_span_events(FmtSpan::CLOSE);

    if config.log.format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
    Ok(())
}

/// Source and destination of the `i`th synthetic flow
fn endpoints(i: u32) -> (SocketAddr, SocketAddr) {
    let [_, hi, mid, lo] = i.to_be_bytes();
    // 64 sources, so limited flows pile up per source
    let src = IpAddr::V4(Ipv4Addr::new(10, hi, mid % 4, lo % 16));
    let dst = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1 + (lo % 8)));
    #[allow(clippy::cast_possible_truncation)]
    let sport = 20_000 + (i % 40_000) as u16;
    (SocketAddr::new(src, sport), SocketAddr::new(dst, 443))
}

/// Open a flow the way a firewall would: miss, install, then the handshake
fn open_flow(table: &FlowTable, key: FlowKey, kind: TrackKind, owner: RuleRef) -> bool {
    let syn = PacketInfo::tcp(TcpFlags::SYN, 0, 60);
    if table.lookup(&key, &syn).is_some() {
        return true;
    }
    if let Err(e) = table.install(key, &syn, kind, owner).map(drop) {
        debug!(flow = %key, error = %e, "Flow refused");
        return false;
    }
    drop(table.lookup(&key.reversed(), &PacketInfo::tcp(TcpFlags::SYN | TcpFlags::ACK, 1, 60)));
    drop(table.lookup(&key, &PacketInfo::tcp(TcpFlags::ACK, 1, 52)));
    true
}

/// Exchange one round of data so both directions ack new bytes
fn exchange(table: &FlowTable, key: &FlowKey, round: u32) {
    let ack = round.wrapping_mul(1460).wrapping_add(2);
    drop(table.lookup(key, &PacketInfo::tcp(TcpFlags::ACK | TcpFlags::PSH, ack, 1500)));
    drop(table.lookup(&key.reversed(), &PacketInfo::tcp(TcpFlags::ACK, ack, 52)));
}

fn close_flow(table: &FlowTable, key: &FlowKey) {
    drop(table.lookup(key, &PacketInfo::tcp(TcpFlags::FIN | TcpFlags::ACK, 2, 52)));
    drop(table.lookup(&key.reversed(), &PacketInfo::tcp(TcpFlags::FIN | TcpFlags::ACK, 3, 52)));
}

/// Create the initial flow mix and return the long-lived TCP flows
fn populate(table: &FlowTable, flows: u32) -> Vec<FlowKey> {
    let limit = TrackKind::Limit(LimitSpec::new(LimitMask::SRC_ADDR, FLOWS_PER_SOURCE));
    let mut live = Vec::new();
    let mut refused = 0u32;

    for i in 0..flows {
        let (src, dst) = endpoints(i);
        match i % 4 {
            0 => {
                let key = FlowKey::tcp(src, dst);
                if open_flow(table, key, TrackKind::KeepState, KEEP_STATE_RULE) {
                    close_flow(table, &key);
                }
            }
            1 => {
                let key = FlowKey::tcp(src, dst);
                if open_flow(table, key, TrackKind::KeepState, KEEP_STATE_RULE) {
                    live.push(key);
                }
            }
            2 => {
                let key = FlowKey::tcp(src, dst);
                if !open_flow(table, key, limit, LIMIT_RULE) {
                    refused += 1;
                }
            }
            _ => {
                let key = FlowKey::new(IpProtocol::Udp, src, SocketAddr::new(dst.ip(), 53));
                let query = PacketInfo::other(80);
                if table.lookup(&key, &query).is_none() {
                    if let Err(e) = table.install(key, &query, TrackKind::KeepState, UDP_RULE).map(drop) {
                        debug!(flow = %key, error = %e, "Flow refused");
                        refused += 1;
                    }
                }
            }
        }
    }

    info!(flows, live = live.len(), refused, records = table.len(), "Initial flows created");
    live
}

/// Main application entry point
#[tokio::main]
async fn main() -> Result<()> {
    let start_time = Instant::now();

    // Parse arguments
    let args = Args::parse();

    // Handle generate-config
    if args.generate_config {
        let path = args
            .config_path
            .clone()
            .unwrap_or_else(|| PathBuf::from("flowstate.json"));
        flowstate::config::create_default_config(&path)?;
        println!("Generated default configuration at {}", path.display());
        return Ok(());
    }

    // Load configuration
    let config = match &args.config_path {
        Some(path) => load_config_with_env(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => SimulatorConfig::default(),
    };

    // Handle check-config
    if args.check_config {
        println!("Configuration is valid");
        return Ok(());
    }

    init_logging(&config)?;
    info!("flowstate-sim v{}", flowstate::VERSION);

    // Control segments go to a transmit task; here it only counts them
    let (sink, mut segments) = ChannelSink::new();
    let table = Arc::new(
        FlowTable::new(config.table.clone())
            .context("Failed to create flow table")?
            .with_sink(Arc::new(sink)),
    );

    let transmitted = Arc::new(AtomicU64::new(0));
    let transmit_handle = {
        let transmitted = Arc::clone(&transmitted);
        tokio::spawn(async move {
            while let Some(segment) = segments.recv().await {
                debug!(
                    flow = %segment.key,
                    flags = ?segment.flags,
                    direction = ?segment.direction,
                    seq = segment.seq,
                    ack = segment.ack,
                    "Control segment"
                );
                transmitted.fetch_add(1, Ordering::Relaxed);
            }
        })
    };

    let scheduler = MaintenanceScheduler::new(Arc::clone(&table));
    let scheduler_handle = scheduler.spawn();

    let live = populate(&table, args.flows);

    // Keep half of the long-lived flows busy, let the rest go quiet
    let mut traffic = tokio::time::interval(Duration::from_millis(500));
    let deadline = tokio::time::sleep(Duration::from_secs(args.seconds));
    tokio::pin!(deadline);
    let mut round = 1u32;

    loop {
        tokio::select! {
            _ = traffic.tick() => {
                for key in live.iter().step_by(2) {
                    exchange(&table, key, round);
                }
                round += 1;
            }
            () = &mut deadline => {
                info!("Simulation finished");
                break;
            }
            result = signal::ctrl_c() => {
                if let Err(e) = result {
                    warn!(error = %e, "Failed to listen for ctrl-c");
                }
                info!("Received shutdown signal");
                break;
            }
        }
    }

    let removed = table.expire_owned_by(LIMIT_RULE.rule);
    info!(removed, "Limit rule deleted");

    scheduler.shutdown();
    if let Err(e) = scheduler_handle.await {
        warn!(error = %e, "Scheduler task failed");
    }
    if let Some(report) = scheduler.last_report() {
        debug!(?report, "Last maintenance pass");
    }

    print_final_stats(&table)?;

    // Releasing the table drops the sink, which ends the transmit task
    drop(scheduler);
    drop(table);
    if let Err(e) = transmit_handle.await {
        warn!(error = %e, "Transmit task failed");
    }

    info!(
        control_segments = transmitted.load(Ordering::Relaxed),
        elapsed = ?start_time.elapsed(),
        "flowstate-sim shutdown complete"
    );
    Ok(())
}

/// Print statistics as JSON
fn print_final_stats(table: &FlowTable) -> Result<()> {
    let stats = table.stats_snapshot();
    let tracked = table.export();
    println!("{}", serde_json::to_string_pretty(&stats)?);
    info!(
        tracked = tracked.len(),
        hit_ratio = stats.hit_ratio(),
        "Final table state"
    );
    Ok(())
}
