mod scenario_churn;
mod scenario_common;
mod scenario_ledger;
mod scenario_loop;
mod scenario_multipath;
mod scenario_runner;

use clap::{Parser, Subcommand};

use scenario_common::ScenarioResult;

#[derive(Parser)]
#[command(
    name = "relaymesh-sim",
    about = "Drive in-memory relay meshes through protocol scenarios"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Flood over a ring with random chords: no loops, bounded reach.
    Loop {
        /// Number of nodes on the ring.
        #[arg(long, default_value = "12")]
        nodes: usize,

        /// Extra random links across the ring.
        #[arg(long, default_value = "6")]
        chords: usize,

        /// TTL for the flooded messages.
        #[arg(long, default_value = "6")]
        ttl: u32,
    },

    /// Drop spokes off a hub and watch the monitor heal.
    Churn {
        /// Spokes linked to the hub.
        #[arg(long, default_value = "10")]
        spokes: usize,

        /// Unlinked peers available to discovery.
        #[arg(long, default_value = "4")]
        spares: usize,
    },

    /// Parallel relays between a source and a sink, one of them forging.
    Multipath {
        /// Disjoint relay paths.
        #[arg(long, default_value = "3")]
        paths: usize,

        /// Messages sent across all paths.
        #[arg(long, default_value = "20")]
        sends: u32,
    },

    /// Signed payments along a line of keyed nodes.
    Ledger {
        /// Hops between payer and payee.
        #[arg(long, default_value = "4")]
        hops: usize,

        /// Payments to make.
        #[arg(long, default_value = "5")]
        payments: u32,
    },

    /// Run every scenario with its defaults.
    All,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    eprintln!("relaymesh-sim v{}", env!("CARGO_PKG_VERSION"));

    let result = match cli.command {
        Command::Loop { nodes, chords, ttl } => {
            scenario_loop::run(scenario_loop::LoopConfig { nodes, chords, ttl }).await?
        }
        Command::Churn { spokes, spares } => {
            scenario_churn::run(scenario_churn::ChurnConfig { spokes, spares }).await?
        }
        Command::Multipath { paths, sends } => {
            scenario_multipath::run(scenario_multipath::MultipathConfig { paths, sends }).await?
        }
        Command::Ledger { hops, payments } => {
            scenario_ledger::run(scenario_ledger::LedgerConfig { hops, payments }).await?
        }
        Command::All => return scenario_runner::run().await,
    };

    report(&result);
    Ok(())
}

fn report(result: &ScenarioResult) {
    result.print_summary();
    result.emit_jsonl();
    if !result.success() {
        std::process::exit(1);
    }
}
