use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use arq_lab_abstract::{ArqConfig, PriorityRule, SimConfig};
use arq_lab_net::{ReceiverHandle, run_sender, spawn_receiver};
use arq_lab_protocol::{Sender, fault};
use arq_lab_simulator::{SimulationReport, Transfer, scenario_runner};

const DEFAULT_RECEIVER_ADDR: &str = "127.0.0.1:24680";

#[derive(Parser, Debug)]
#[command(author, version, about = "Priority-scheduled sliding-window ARQ lab")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one transfer over the simulated channel.
    Simulate {
        #[command(flatten)]
        arq: ConfigArgs,

        #[arg(long, default_value_t = 10)]
        min_latency: u64,
        #[arg(long, default_value_t = 100)]
        max_latency: u64,
        #[arg(long, default_value_t = 0.0)]
        corrupt_rate: f64,
        #[arg(long, default_value_t = 0.0)]
        duplicate_rate: f64,
        /// Seed for the channel's latency and fault draws.
        #[arg(long, default_value_t = 0)]
        channel_seed: u64,

        /// Write a JSON trace of the finished simulation.
        #[arg(long)]
        trace_out: Option<PathBuf>,
    },
    /// Run a TOML scenario and check its assertions.
    Scenario {
        path: PathBuf,

        #[command(flatten)]
        arq: ConfigArgs,

        #[arg(long)]
        trace_out: Option<PathBuf>,
    },
    /// Send the transfer to a receiver over UDP.
    Send {
        #[command(flatten)]
        arq: ConfigArgs,

        #[arg(long, default_value = "127.0.0.1:0")]
        bind: SocketAddr,
        #[arg(long, default_value = DEFAULT_RECEIVER_ADDR)]
        peer: SocketAddr,
    },
    /// Receive over UDP until `total_messages` arrive or Ctrl-C.
    Receive {
        #[command(flatten)]
        arq: ConfigArgs,

        #[arg(long, default_value = DEFAULT_RECEIVER_ADDR)]
        bind: SocketAddr,
    },
    /// Receiver and sender in one process over loopback UDP.
    Demo {
        #[command(flatten)]
        arq: ConfigArgs,

        #[arg(long, default_value = DEFAULT_RECEIVER_ADDR)]
        addr: SocketAddr,
    },
}

/// `--config` file plus per-option overrides.
#[derive(Args, Debug)]
struct ConfigArgs {
    /// TOML file with ARQ settings.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    window_capacity: Option<usize>,
    #[arg(long)]
    total_messages: Option<u32>,
    #[arg(long)]
    loss_probability: Option<f64>,
    #[arg(long)]
    ack_timeout_ms: Option<u64>,
    /// Mark every n-th sequence number high priority.
    #[arg(long)]
    priority_every: Option<u32>,
    #[arg(long)]
    max_consecutive_losses: Option<u32>,
    /// Seed for the loss injector.
    #[arg(long)]
    seed: Option<u64>,
}

impl ConfigArgs {
    fn resolve(&self) -> Result<ArqConfig> {
        let mut config = match &self.config {
            Some(path) => ArqConfig::load(path)
                .with_context(|| format!("Failed to load config {}", path.display()))?,
            None => ArqConfig::default(),
        };
        if let Some(v) = self.window_capacity {
            config.window_capacity = v;
        }
        if let Some(v) = self.total_messages {
            config.total_messages = v;
        }
        if let Some(v) = self.loss_probability {
            config.loss_probability = v;
        }
        if let Some(v) = self.ack_timeout_ms {
            config.ack_timeout_ms = v;
        }
        if let Some(n) = self.priority_every {
            config.priority_rule = PriorityRule::EveryNth { n };
        }
        if let Some(v) = self.max_consecutive_losses {
            config.max_consecutive_losses = v;
        }
        if self.seed.is_some() {
            config.seed = self.seed;
        }
        config.validate().context("Invalid configuration")?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    match cli.command {
        Command::Simulate {
            arq,
            min_latency,
            max_latency,
            corrupt_rate,
            duplicate_rate,
            channel_seed,
            trace_out,
        } => {
            let arq = arq.resolve()?;
            let sim = SimConfig {
                corrupt_rate,
                duplicate_rate,
                min_latency,
                max_latency,
                seed: channel_seed,
                ..Default::default()
            };
            sim.validate().context("Invalid channel settings")?;
            let report = run_simulation(arq, sim);
            print_summary(&report);
            if let Some(path) = &trace_out {
                write_trace(path, &report)?;
            }
        }
        Command::Scenario {
            path,
            arq,
            trace_out,
        } => {
            let base = arq.resolve()?;
            let report = scenario_runner::run_scenario_file(&path, base)?;
            print_summary(&report);
            if let Some(path) = &trace_out {
                write_trace(path, &report)?;
            }
        }
        Command::Send { arq, bind, peer } => {
            let arq = arq.resolve()?;
            send(arq, bind, peer).await?;
        }
        Command::Receive { arq, bind } => {
            let arq = arq.resolve()?;
            let total = arq.total_messages;
            let receiver = spawn_receiver(&arq, bind)
                .await
                .with_context(|| format!("Failed to start receiver on {bind}"))?;
            receive(receiver, total).await?;
        }
        Command::Demo { arq, addr } => {
            let arq = arq.resolve()?;
            let total = arq.total_messages;
            let receiver = spawn_receiver(&arq, addr)
                .await
                .with_context(|| format!("Failed to start receiver on {addr}"))?;
            // Give the receiver a head start before the first burst.
            tokio::time::sleep(Duration::from_secs(1)).await;
            let peer = receiver.local_addr;
            let bind: SocketAddr = "127.0.0.1:0"
                .parse()
                .context("Invalid loopback address")?;
            send(arq, bind, peer).await?;
            receive(receiver, total).await?;
        }
    }

    Ok(())
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn run_simulation(arq: ArqConfig, sim: SimConfig) -> SimulationReport {
    info!("Starting headless simulation…");
    let injector = fault::from_config(&arq);
    let mut transfer = Transfer::transfer(arq, sim, injector);
    let completion = transfer.run_until_complete();
    info!("Simulation complete.");
    transfer.export_report(completion)
}

async fn send(arq: ArqConfig, bind: SocketAddr, peer: SocketAddr) -> Result<()> {
    let injector = fault::from_config(&arq);
    let mut sender = Sender::try_new(arq, injector).context("Invalid sender configuration")?;
    run_sender(&mut sender, bind, peer)
        .await
        .with_context(|| format!("Sender to {peer} failed"))?;
    let stats = sender.stats();
    info!(
        transmissions = stats.transmissions,
        simulated_losses = stats.simulated_losses,
        timeouts = stats.timeouts,
        "all {} messages acknowledged",
        sender.total_messages()
    );
    Ok(())
}

async fn receive(mut receiver: ReceiverHandle, total: u32) -> Result<()> {
    let mut delivered = 0u32;
    while delivered < total {
        tokio::select! {
            delivery = receiver.next_delivery() => match delivery {
                Some(delivery) => {
                    println!("{:>6}  {}", delivery.seq_num, delivery.payload);
                    delivered += 1;
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                warn!("interrupted after {delivered} of {total} deliveries");
                break;
            }
        }
    }

    let state = receiver.stop().await.context("Receiver failed")?;
    let stats = state.stats();
    info!(
        delivered = stats.delivered,
        duplicates = stats.duplicates,
        buffered = stats.buffered,
        checksum_failures = stats.checksum_failures,
        "receiver stopped"
    );
    Ok(())
}

fn print_summary(report: &SimulationReport) {
    let stats = &report.sender_stats;
    println!(
        "completion: {:?} after {} ms",
        report.completion, report.duration_ms
    );
    println!(
        "delivered {}/{} (in order: {}, duplicates: {})",
        report.deliveries.len(),
        report.total_messages,
        report.delivered_in_order(),
        report.has_duplicate_delivery()
    );
    println!(
        "transmissions: {}, simulated losses: {}, timeouts: {}, stale acks: {}",
        stats.transmissions, stats.simulated_losses, stats.timeouts, stats.stale_acks
    );
    println!("max window in flight: {}", report.max_window_in_flight());
}

fn write_trace(path: &Path, report: &SimulationReport) -> Result<()> {
    let data = serde_json::to_vec_pretty(report).context("Failed to serialize simulation trace")?;
    fs::write(path, &data)
        .with_context(|| format!("Failed to write trace file {}", path.display()))?;
    Ok(())
}
