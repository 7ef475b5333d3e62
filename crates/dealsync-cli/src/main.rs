use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use dealsync_sync::{SyncConfig, SyncPipeline};
use tracing::warn;

#[derive(Debug, Parser)]
#[command(name = "dealsync")]
#[command(about = "Reconcile bulk and live deal snapshots and push the merged view")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Load, reconcile and dispatch once.
    Sync {
        /// Exit successfully even when some deals failed to dispatch.
        #[arg(long)]
        allow_failures: bool,
    },
    /// Load and reconcile only; print what would be sent.
    Plan {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let cli = Cli::parse();
    let pipeline = SyncPipeline::new(SyncConfig::from_env())?;

    match cli.command.unwrap_or(Commands::Sync {
        allow_failures: false,
    }) {
        Commands::Sync { allow_failures } => {
            let run = pipeline
                .run_once_until(async {
                    match tokio::signal::ctrl_c().await {
                        Ok(()) => warn!("interrupt received; finishing in-flight requests"),
                        Err(err) => {
                            warn!(%err, "interrupt handler unavailable");
                            std::future::pending::<()>().await
                        }
                    }
                })
                .await?;
            println!(
                "sync complete: run_id={} reconciled={} sent={} succeeded={} failed={}{}",
                run.run_id,
                run.stats.reconciled,
                run.summary.total,
                run.summary.succeeded,
                run.summary.failed,
                run.report_dir
                    .as_deref()
                    .map(|dir| format!(" report={dir}"))
                    .unwrap_or_default()
            );
            for failure in &run.summary.failures {
                eprintln!("failed: {}: {}", failure.title, failure.reason);
            }
            if !run.summary.is_clean() && !allow_failures {
                bail!("{} of {} deals failed to dispatch", run.summary.failed, run.summary.total);
            }
        }
        Commands::Plan { limit } => {
            let plan = pipeline.plan().await?;
            let stats = plan.stats;
            println!(
                "plan: run_id={} bulk={} live={} reconciled={} matched={} value_overrides={} bulk_only={} live_only={}",
                plan.run_id,
                stats.bulk_records,
                stats.live_records,
                stats.reconciled,
                stats.matched,
                stats.value_overrides,
                stats.bulk_only,
                stats.live_only
            );
            for deal in plan.deals.iter().take(limit) {
                println!(
                    "  {} value={} currency={} status={}",
                    deal.title,
                    deal.value,
                    deal.currency.as_deref().unwrap_or("-"),
                    deal.status.as_deref().unwrap_or("-")
                );
            }
            if plan.deals.len() > limit {
                println!("  ... {} more", plan.deals.len() - limit);
            }
        }
    }

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();
}
