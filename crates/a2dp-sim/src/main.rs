//! A2DP engine simulator.
//!
//! Runs a scripted scenario against the engine with mock collaborators and
//! prints what happened.
//!
//! Run with: `cargo run -p a2dp-sim -- crates/a2dp-sim/scenarios/handoff.toml`

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use tracing::info;

use a2dp_core::EngineConfig;

mod scenario;

use scenario::{Report, Scenario};

/// A2DP engine simulator - replay connection scenarios against mock devices.
#[derive(Parser, Debug)]
#[command(name = "a2dp-sim")]
#[command(version, about, long_about = None)]
struct Args {
    /// Scenario file (TOML).
    scenario: PathBuf,

    /// Engine configuration file (overrides the scenario's [engine] table).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Output format.
    #[arg(short, long, value_enum, default_value_t = Format::Text)]
    format: Format,

    /// Use the wall clock instead of virtual time for `wait` steps.
    #[arg(long)]
    real_time: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Format {
    Text,
    Json,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("a2dp_sim=info".parse()?)
                .add_directive("a2dp_core=info".parse()?),
        )
        .init();

    let scenario = Scenario::load(&args.scenario)?;
    let config = args.config.as_ref().map(EngineConfig::load).transpose()?;

    if !args.real_time {
        tokio::time::pause();
    }
    info!(
        "Running {} ({} steps)",
        args.scenario.display(),
        scenario.steps.len()
    );
    let report = scenario::run(&scenario, config).await?;

    match args.format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        Format::Text => print_text(&report)?,
    }
    Ok(())
}

fn print_text(report: &Report) -> anyhow::Result<()> {
    for record in &report.steps {
        println!("#{:<3} {:?}", record.index, record.step);
        println!("     -> {}", record.outcome);
        for event in &record.events {
            println!("        {}", serde_json::to_string(event)?);
        }
    }

    println!();
    println!("Native commands:");
    for command in &report.native_commands {
        println!("  {command:?}");
    }

    println!();
    println!(
        "Active device: {}",
        report
            .dump
            .active_device
            .map_or_else(|| "none".to_string(), |p| p.to_string())
    );
    for peer in &report.dump.peers {
        println!(
            "  {}  {:<13} playing={} codec={}",
            peer.peer,
            peer.state.to_string(),
            peer.playing,
            peer.codec_status
                .as_ref()
                .map_or_else(|| "-".to_string(), |s| format!("{:?}", s.config.codec_type))
        );
    }
    Ok(())
}
