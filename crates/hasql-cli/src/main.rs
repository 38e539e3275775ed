//! # hasql CLI Entry Point
//!
//! ## Usage
//!
//! ```bash
//! # Two healthy nodes, default workload
//! hasql simulate -n db1 -n db2
//!
//! # Weighted reads, with db2 failing its first write
//! hasql simulate -n db1=1 -n db2=3 --balancer weighted --fail db2:execute:1
//!
//! # Writes in one transaction while db3 is down
//! hasql simulate -n db1 -n db2 -n db3 --fail db3:offline --transactional
//! ```

use anyhow::Result;
use argh::FromArgs;
use hasql_cli::simulate::{FaultSpec, NodeSpec, Simulation};
use hasql_cluster::BalancerKind;
use std::time::Duration;

/// Main CLI structure parsed from command-line arguments.
#[derive(FromArgs)]
/// hasql - highly available database access over a simulated cluster
struct Cli {
    #[argh(subcommand)]
    command: Commands,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Commands {
    Simulate(SimulateArgs),
    Balancers(BalancersArgs),
}

/// Arguments for a simulated workload.
///
/// Builds a cluster over in-memory nodes, applies the faults, runs the writes
/// on every node and the reads on one node each, then prints a JSON report.
#[derive(FromArgs)]
#[argh(subcommand, name = "simulate")]
/// run a workload against a simulated cluster
struct SimulateArgs {
    /// node to add, as `id` or `id=weight`; repeatable
    #[argh(option, short = 'n', long = "node")]
    nodes: Vec<NodeSpec>,

    /// balancer for single-node reads: round-robin, random, weighted or load
    #[argh(option, short = 'b', default = "BalancerKind::RoundRobin")]
    balancer: BalancerKind,

    /// seed for the random balancer
    #[argh(option)]
    seed: Option<u64>,

    /// fault to inject: `node:offline`, `node:method` or `node:method:times`
    #[argh(option, short = 'f', long = "fail")]
    faults: Vec<FaultSpec>,

    /// number of writes to run
    #[argh(option, short = 'w', default = "10")]
    writes: usize,

    /// number of reads to run
    #[argh(option, short = 'r', default = "10")]
    reads: usize,

    /// per-node operation timeout in milliseconds
    #[argh(option, long = "timeout-ms", default = "5000")]
    timeout_ms: u64,

    /// run the writes inside one transaction
    #[argh(switch, short = 't')]
    transactional: bool,

    /// pretty-print the report
    #[argh(switch, short = 'p')]
    pretty: bool,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "balancers")]
/// list the available balancer policies
struct BalancersArgs {}

impl SimulateArgs {
    fn into_simulation(self) -> Simulation {
        let defaults = Simulation::default();
        Simulation {
            nodes: if self.nodes.is_empty() {
                defaults.nodes
            } else {
                self.nodes
            },
            balancer: self.balancer,
            seed: self.seed,
            faults: self.faults,
            writes: self.writes,
            reads: self.reads,
            operation_timeout: Duration::from_millis(self.timeout_ms),
            transactional: self.transactional,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    // Logs go to stderr so the report on stdout stays pipeable.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Simulate(args) => {
            let pretty = args.pretty;
            let report = args.into_simulation().run().await?;
            let output = if pretty {
                serde_json::to_string_pretty(&report)?
            } else {
                serde_json::to_string(&report)?
            };
            println!("{}", output);
        }
        Commands::Balancers(_) => {
            for kind in BalancerKind::ALL {
                println!("{}", kind);
            }
        }
    }

    Ok(())
}
