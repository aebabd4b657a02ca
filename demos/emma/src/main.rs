//! Runs the EMMA broker-overlay scenario over a three-region topology and
//! writes the message trace as CSV.

use std::fs::File;
use std::io::Write;
use std::path::PathBuf;

use clap::Parser;
use fogsim_core::{Connection, EmmaScenario, ScenarioConfig, Topology, REGIONS};

/// Evaluate client-to-broker assignment in a multi-region pub/sub overlay.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Print per-minute scenario state
    #[arg(short, long)]
    verbose: bool,

    /// Path for the CSV message trace
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Publisher loops per client
    #[arg(long, default_value_t = 7)]
    publishers_per_client: usize,

    /// Publish interval in milliseconds
    #[arg(long, default_value_t = 100.0)]
    publish_interval: f64,

    /// Clients per client group
    #[arg(long, default_value_t = 10)]
    clients_per_group: usize,

    /// Require acknowledgement handshakes
    #[arg(long)]
    enable_ack: bool,

    /// Run Vivaldi and use coordinates for broker selection
    #[arg(long)]
    vivaldi: bool,

    /// Directory containing `<source>_latest.graphml` latency graphs;
    /// without it, a built-in latency triangle is used
    #[arg(long)]
    graph_dir: Option<PathBuf>,

    /// Latency graph source name
    #[arg(long, default_value = "cloudping")]
    graph_source: String,

    /// Seed for all randomized decisions
    #[arg(long, default_value_t = 0)]
    seed: u64,
}

/// Maps cloudping's region names onto the scenario's.
const REGION_MAP: [(&str, &str); 3] = [
    ("internet_eu-central-1", "eu-central"),
    ("internet_eu-west-1", "eu-west"),
    ("internet_us-east-1", "us-east"),
];

/// Rough cloudping medians, one-way milliseconds.
const FALLBACK_LATENCIES: [(&str, &str, f64); 3] = [
    ("eu-central", "eu-west", 12.5),
    ("eu-central", "us-east", 44.0),
    ("eu-west", "us-east", 38.0),
];

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_max_level(if args.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        })
        .init();

    let mut topology = Topology::with_seed(args.seed);
    match &args.graph_dir {
        Some(dir) => {
            topology.load_inet_graph(&args.graph_source, dir)?;
            for (from, to) in REGION_MAP {
                topology.relabel_relay(from, to);
            }
        }
        None => {
            tracing::info!(regions = ?REGIONS, "using the built-in latency triangle");
            for (a, b, latency) in FALLBACK_LATENCIES {
                topology.add_connection(Connection::new(a, b).with_latency(latency), false)?;
            }
        }
    }

    let trace: Option<Box<dyn Write>> = match &args.output {
        Some(path) => Some(Box::new(File::create(path)?)),
        None => None,
    };

    let config = ScenarioConfig::builder()
        .name("emma")
        .use_vivaldi(args.vivaldi)
        .enable_ack(args.enable_ack)
        .publishers_per_client(args.publishers_per_client)
        .publish_interval_ms(args.publish_interval)
        .clients_per_group(args.clients_per_group)
        .seed(args.seed)
        .build();
    let scenario = EmmaScenario::new(config, topology, trace);
    scenario.run();

    let history = scenario.protocol().history();
    tracing::info!(
        messages = history.len(),
        brokers = scenario.brokers().len(),
        clients = scenario.clients().len(),
        "scenario finished"
    );
    Ok(())
}
