mod config;
mod gateway;
mod model;
mod netlink;
mod partition;
mod probe;
mod profiles;
mod tunnel;
mod worker;

use anyhow::{Context, Result};
use clap::Parser;
use config::{AppConfig, Args};
use model::{BatchTally, FinalResult};
use netlink::Netlink;
use probe::ProbeSettings;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info};
use tunnel::RunContext;

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let config = match AppConfig::from_args(args) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("invalid configuration: {:#}", err);
            emit(FinalResult::fatal(format!("invalid configuration: {:#}", err)));
        }
    };
    init_logging(config.debug_level);
    let result = match run_batch(&config).await {
        Ok(result) => result,
        Err(err) => {
            error!("batch aborted: {:#}", err);
            FinalResult::fatal(format!("{:#}", err))
        }
    };
    emit(result);
}

/// Prints the verdict on stdout (the only thing that goes there) and
/// exits with 0 iff the batch status is ok.
fn emit(result: FinalResult) -> ! {
    match serde_json::to_string(&result) {
        Ok(line) => println!("{}", line),
        Err(err) => {
            eprintln!("failed to serialize verdict: {}", err);
            std::process::exit(1);
        }
    }
    std::process::exit(result.exit_code());
}

fn init_logging(mask: u32) {
    tracing_subscriber::fmt()
        .with_max_level(config::log_level(mask))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

async fn run_batch(config: &AppConfig) -> Result<FinalResult> {
    let default_gateway = gateway::default_gateway().context("default gateway discovery failed")?;
    debug!("default gateway: {}", default_gateway);

    let profiles = profiles::load(config).await?;
    let total = profiles.len();
    info!("loaded {} profile(s)", total);

    let buckets = partition::partition(profiles, config.workers);
    let active_workers = buckets.len();
    debug!("partitioned into {} worker bucket(s)", active_workers);

    let netlink = Netlink::new().await.context("netlink connection failed")?;
    let ctx = Arc::new(RunContext {
        netlink,
        default_gateway,
        settings: ProbeSettings::from_config(config),
    });

    let (tx, mut rx) = mpsc::channel(total.max(1));
    worker::spawn_workers(buckets, ctx, tx);

    let mut tally = BatchTally::new(total, active_workers);
    let deadline = tokio::time::sleep(config.batch_timeout);
    tokio::pin!(deadline);
    for _ in 0..total {
        tokio::select! {
            _ = &mut deadline => {
                info!("batch deadline reached; abandoning outstanding workers");
                return Ok(tally.into_deadline_result());
            }
            outcome = rx.recv() => {
                match outcome {
                    Some(outcome) => tally.record(outcome),
                    // All workers gone; the tally below reports the gap.
                    None => break,
                }
            }
        }
    }
    Ok(tally.into_result())
}
