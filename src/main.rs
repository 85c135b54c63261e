//! shardnet CLI
//!
//! Trains the models described by prototext files.
//!
//! The process topology is read from `SHARDNET_RANK`, `SHARDNET_WORLD_SIZE` and
//! `SHARDNET_PROCS_PER_MODEL`. Every process reads the same files.

use anyhow::{Context, Result};
use clap::Parser;
use env_logger::Env;
use log::info;
use shardnet::{
    comm::Comm,
    data::ExecutionMode,
    proto::{load_prototext, PrototextArgs, TrainingConfig},
};
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    #[command(flatten)]
    prototext: PrototextArgs,
    /// Overrides the number of epochs of every model.
    #[arg(long = "num_epochs")]
    num_epochs: Option<usize>,
    /// Overrides the number of processes per model.
    #[arg(long = "procs_per_model")]
    procs_per_model: Option<usize>,
    /// Prints the configuration of every model as json and exits.
    #[arg(long = "print_config")]
    print_config: bool,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    let comm = match Comm::from_env().and_then(|comm| match cli.procs_per_model {
        Some(procs_per_model) => Comm::new(comm.rank(), comm.world_size(), procs_per_model),
        None => Ok(comm),
    }) {
        Ok(comm) => comm,
        Err(e) => {
            // without a valid topology, rank 0 reports
            if Comm::env_rank().map_or(true, |rank| rank == 0) {
                eprintln!("error: {e}");
            }
            return ExitCode::FAILURE;
        }
    };

    match run(&cli, comm) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if comm.is_world_master() {
                eprintln!("error: {e:#}");
            }
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli, comm: Comm) -> Result<()> {
    let master = comm.is_world_master();
    let docs = load_prototext(master, &cli.prototext)?;
    let configs = docs
        .iter()
        .enumerate()
        .map(|(i, doc)| TrainingConfig::from_document(doc).with_context(|| format!("model {i}")))
        .collect::<Result<Vec<_>>>()?;

    if cli.print_config {
        if master {
            println!("{}", serde_json::to_string_pretty(&configs)?);
        }
        return Ok(());
    }

    if master {
        info!("shardnet v{}", env!("CARGO_PKG_VERSION"));
        info!(
            "world size: {} procs per model: {} models: {}",
            comm.world_size(),
            comm.procs_per_model(),
            configs.len()
        );
    }

    for (i, config) in configs.iter().enumerate() {
        let mut model = config
            .build_model(comm)
            .with_context(|| format!("failed to build model {i}"))?;
        let num_epochs = cli.num_epochs.unwrap_or(config.model.num_epochs);
        let summary = model
            .train(num_epochs)
            .with_context(|| format!("failed to train model {i}"))?;
        if master {
            info!(
                "model {i}: trained {} epochs in {:?}",
                summary.epoch(),
                summary.total_time()
            );
        }
        if model.has_reader(ExecutionMode::Testing) {
            let stats = model
                .evaluate(ExecutionMode::Testing)
                .with_context(|| format!("failed to test model {i}"))?;
            if master {
                match stats.objective() {
                    Some(objective) => info!(
                        "model {i}: test objective: {objective:.6} samples: {}",
                        stats.count()
                    ),
                    None => info!("model {i}: no test samples"),
                }
            }
        }
    }
    Ok(())
}
