use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use dotenv::dotenv;
use ph_adapters::SourceFilter;
use ph_core::SourceOrder;
use ph_sync::{
    build_scheduler, run_configured_sync, run_duplicate_scan, SyncConfig, SyncRequest,
    WatermarkStore,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "ph-cli")]
#[command(about = "Parent Helper directory sync: Postgres businesses -> Airtable")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one reconciliation pass (the default).
    Sync(SyncArgs),
    /// Report likely duplicates in the source table.
    Duplicates(SourceArgs),
    /// Inspect or clear the stored resume point.
    Watermark {
        #[command(subcommand)]
        action: WatermarkAction,
    },
    /// Run the sync on PH_SYNC_CRON until Ctrl-C.
    Schedule(SyncArgs),
}

#[derive(Debug, Subcommand)]
enum WatermarkAction {
    Show {
        #[arg(long, default_value = "default")]
        job: String,
    },
    Reset {
        #[arg(long, default_value = "default")]
        job: String,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
enum OrderArg {
    #[default]
    Id,
    Name,
    Sample,
}

#[derive(Debug, Clone, Default, Args)]
struct SourceArgs {
    /// Read records from a JSON file instead of Postgres.
    #[arg(long)]
    fixture: Option<PathBuf>,
    /// Inclusive lower bound on the business name.
    #[arg(long)]
    name_from: Option<String>,
    /// Exclusive upper bound on the business name.
    #[arg(long)]
    name_to: Option<String>,
    /// Skip rows marked inactive.
    #[arg(long)]
    active_only: bool,
    #[arg(long)]
    page_size: Option<usize>,
}

#[derive(Debug, Clone, Default, Args)]
struct SyncArgs {
    #[command(flatten)]
    source: SourceArgs,
    /// Name under which the watermark is stored.
    #[arg(long)]
    job: Option<String>,
    #[arg(long, value_enum, default_value_t = OrderArg::Id)]
    order: OrderArg,
    /// Seed for the reproducible sample ordering.
    #[arg(long, required_if_eq("order", "sample"))]
    seed: Option<String>,
    #[arg(long)]
    batch_size: Option<usize>,
    #[arg(long)]
    workers: Option<usize>,
    /// Stop after this many records have been processed.
    #[arg(long)]
    max_records: Option<u64>,
    /// Ignore the stored watermark and start from the beginning.
    #[arg(long)]
    fresh: bool,
    /// Load the whole destination table once for existence checks.
    #[arg(long)]
    preload: bool,
}

impl SourceArgs {
    fn filter(&self) -> SourceFilter {
        SourceFilter {
            name_from: self.name_from.clone(),
            name_to: self.name_to.clone(),
            active_only: self.active_only,
        }
    }

    fn to_request(&self) -> SyncRequest {
        SyncRequest {
            filter: self.filter(),
            page_size: self.page_size,
            fixture: self.fixture.clone(),
            ..Default::default()
        }
    }
}

impl SyncArgs {
    fn to_request(&self) -> Result<SyncRequest> {
        let order = match self.order {
            OrderArg::Id => SourceOrder::Id,
            OrderArg::Name => SourceOrder::Name,
            OrderArg::Sample => match &self.seed {
                Some(seed) => SourceOrder::Sample { seed: seed.clone() },
                None => bail!("--order sample requires --seed"),
            },
        };
        Ok(SyncRequest {
            job: self.job.clone().unwrap_or_else(|| "default".to_string()),
            order,
            batch_size: self.batch_size,
            workers: self.workers,
            max_records: self.max_records,
            fresh: self.fresh,
            preload: self.preload,
            ..self.source.to_request()
        })
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}

fn cancel_on_ctrl_c(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl-C received; stopping after the current batch");
            cancel.cancel();
        }
    });
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenv().ok();
    init_tracing();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let config = SyncConfig::from_env()?;

    match cli.command.unwrap_or_else(|| Commands::Sync(SyncArgs::default())) {
        Commands::Sync(args) => {
            let request = args.to_request()?;
            let cancel = CancellationToken::new();
            cancel_on_ctrl_c(cancel.clone());

            let outcome = run_configured_sync(&config, &request, &cancel).await?;
            let s = &outcome.summary;
            println!(
                "sync {:?} ({:?}): run_id={} processed={} added={} skipped={} failed={} retries={} report={}",
                s.final_state,
                s.stop_reason,
                s.run_id,
                s.counters.processed,
                s.counters.added,
                s.counters.skipped,
                s.counters.failed,
                s.counters.retries,
                outcome.report.dir.display()
            );
            if let Some(err) = &s.error {
                eprintln!("aborted: {err}");
            }
            Ok(if s.is_done() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Commands::Duplicates(args) => {
            let report = run_duplicate_scan(&config, &args.to_request()).await?;
            print!("{}", report.to_markdown());
            Ok(ExitCode::SUCCESS)
        }
        Commands::Watermark { action } => {
            let store = WatermarkStore::new(&config.state_dir);
            match action {
                WatermarkAction::Show { job } => match store.load(&job).await? {
                    Some(stored) => println!(
                        "{}",
                        serde_json::to_string_pretty(&stored).context("serializing watermark")?
                    ),
                    None => println!("no watermark stored for job {job}"),
                },
                WatermarkAction::Reset { job } => {
                    if store.reset(&job).await? {
                        println!("watermark for job {job} removed");
                    } else {
                        println!("no watermark stored for job {job}");
                    }
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Schedule(args) => {
            if !config.scheduler_enabled {
                bail!("scheduler is disabled; set PH_SCHEDULER_ENABLED=true");
            }
            let request = args.to_request()?;
            let cron = config.sync_cron.clone();
            let shutdown = CancellationToken::new();
            let mut sched = build_scheduler(Arc::new(config), request, shutdown.clone()).await?;
            sched.start().await.context("starting scheduler")?;
            info!(%cron, "scheduler started; Ctrl-C to stop");

            tokio::signal::ctrl_c()
                .await
                .context("waiting for Ctrl-C")?;
            info!("stopping scheduler");
            shutdown.cancel();
            sched.shutdown().await.context("stopping scheduler")?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_subcommand_means_sync() {
        let cli = Cli::try_parse_from(["ph-cli"]).unwrap();
        assert!(cli.command.is_none());
    }

    #[test]
    fn sync_flags_become_a_request() {
        let cli = Cli::try_parse_from([
            "ph-cli",
            "sync",
            "--job",
            "spring",
            "--order",
            "sample",
            "--seed",
            "2026",
            "--name-from",
            "a",
            "--name-to",
            "m",
            "--page-size",
            "50",
            "--workers",
            "3",
            "--max-records",
            "200",
            "--fresh",
        ])
        .unwrap();
        let Some(Commands::Sync(args)) = cli.command else {
            panic!("expected sync");
        };
        let request = args.to_request().unwrap();
        assert_eq!(request.job, "spring");
        assert_eq!(request.order, SourceOrder::Sample { seed: "2026".into() });
        assert_eq!(request.filter.name_from.as_deref(), Some("a"));
        assert_eq!(request.page_size, Some(50));
        assert_eq!(request.workers, Some(3));
        assert_eq!(request.max_records, Some(200));
        assert!(request.fresh);
        assert!(!request.preload);
    }

    #[test]
    fn sample_order_needs_a_seed() {
        assert!(Cli::try_parse_from(["ph-cli", "sync", "--order", "sample"]).is_err());
    }

    #[test]
    fn watermark_reset_takes_a_job() {
        let cli = Cli::try_parse_from(["ph-cli", "watermark", "reset", "--job", "nightly"]).unwrap();
        match cli.command {
            Some(Commands::Watermark {
                action: WatermarkAction::Reset { job },
            }) => assert_eq!(job, "nightly"),
            other => panic!("unexpected {other:?}"),
        }
    }
}
