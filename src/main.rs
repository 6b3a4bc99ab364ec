// notary - run and inspect an otnotary instance

use clap::{Parser, Subcommand};
use otnotary::notary::{Notary, NotaryConfig, NotaryError};
use otnotary::storage::SledStore;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(version, about = "Notary-mediated ledger")]
struct Opts {
    #[arg(long, default_value = "./notary-data", help = "Directory holding the notary database")]
    data_dir: PathBuf,

    #[arg(long, default_value = "20", help = "Transaction numbers issued per request")]
    numbers_per_batch: u32,

    #[arg(long, default_value = "400", help = "Cap on outstanding numbers per nym")]
    max_outstanding_numbers: usize,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the notary key and print the notary id
    Init,
    /// Print the notary id, key and storage statistics
    Info,
    /// Run cron ticks until interrupted
    Cron {
        #[arg(long, default_value = "10", help = "Seconds between ticks")]
        interval_secs: u64,
    },
}

fn open(opts: &Opts, config: NotaryConfig) -> Result<(Notary, Arc<SledStore>), NotaryError> {
    let store = Arc::new(SledStore::open(&opts.data_dir)?);
    let notary = Notary::open(store.clone(), config)?;
    Ok((notary, store))
}

async fn run(opts: Opts) -> Result<(), NotaryError> {
    let mut config = NotaryConfig::new()
        .with_numbers_per_batch(opts.numbers_per_batch)
        .with_max_outstanding_numbers(opts.max_outstanding_numbers);
    if let Command::Cron { interval_secs } = &opts.command {
        config = config.with_cron_interval_secs(*interval_secs);
    }

    match &opts.command {
        Command::Init => {
            let (notary, _) = open(&opts, config)?;
            notary.flush()?;
            println!("notary id: {}", notary.id());
            println!("notary nym: {}", notary.nym());
        }
        Command::Info => {
            let (notary, store) = open(&opts, config)?;
            let stats = store.stats();
            println!("notary id:   {}", notary.id());
            println!("notary nym:  {}", notary.nym());
            println!("public key:  {}", hex::encode(notary.public_key().as_bytes()));
            println!("cron items:  {}", notary.cron_queue().len());
            println!("vouchers:    {}", notary.outstanding_vouchers().await.len());
            println!("keys:        {}", stats.key_count);
            println!("disk bytes:  {}", stats.disk_size_bytes);
        }
        Command::Cron { .. } => {
            let (notary, _) = open(&opts, config)?;
            let mut ticker = tokio::time::interval(Duration::from_secs(notary.config().cron_interval_secs));
            info!(notary = %notary.id(), interval = notary.config().cron_interval_secs, "cron running");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let report = notary.process_cron(chrono::Utc::now().timestamp()).await;
                        if report.processed > 0 {
                            info!(
                                processed = report.processed,
                                payments = report.payments,
                                trades = report.trades,
                                expired = report.expired.len(),
                                errors = report.errors,
                                "cron tick"
                            );
                        }
                    }
                    _ = tokio::signal::ctrl_c() => {
                        info!("shutting down");
                        break;
                    }
                }
            }
            notary.flush()?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Err(err) = run(Opts::parse()).await {
        error!(error = %err, "notary failed");
        std::process::exit(1);
    }
}
