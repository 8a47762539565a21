//! Run ledger reconciliation jobs once and print their summaries as JSON.
//!
//! Per-row failures are counted in the summaries and never change the exit
//! status; only a failure to connect, migrate or query candidates does.

use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing::info;

use volunteer_ledger::{
    bootstrap,
    ledger::LedgerRepository,
    settlement::{EarnShiftFunder, ReconcileJob, Reconciler, RunOptions},
    telemetry, Config,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum JobSelector {
    BackfillWalletCredits,
    ResolveUnattributedReceipts,
    ClosePoolDeficits,
    All,
}

impl JobSelector {
    fn jobs(self) -> Vec<ReconcileJob> {
        match self {
            JobSelector::BackfillWalletCredits => vec![ReconcileJob::BackfillWalletCredits],
            JobSelector::ResolveUnattributedReceipts => {
                vec![ReconcileJob::ResolveUnattributedReceipts]
            }
            JobSelector::ClosePoolDeficits => vec![ReconcileJob::ClosePoolDeficits],
            JobSelector::All => ReconcileJob::ALL.to_vec(),
        }
    }
}

/// `reconcile` command arguments.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "reconcile",
    about = "Repair wallet credits, donor receipts and pool deficits left by failed signals",
    version
)]
struct CliArgs {
    /// Job to run.
    #[arg(value_enum, default_value = "all")]
    job: JobSelector,
    /// Maximum candidates per job. Falls back to `RECONCILE_LIMIT` when omitted.
    #[arg(long = "limit", value_name = "rows")]
    limit: Option<i64>,
    /// Plan every row and roll back instead of writing.
    #[arg(long = "dry-run")]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    telemetry::init_tracing();

    let args = CliArgs::parse();
    let config = Config::from_env()?;

    let pool = bootstrap::initialize_database(&config).await?;
    let ledger = Arc::new(LedgerRepository::new(pool));
    let funder = Arc::new(EarnShiftFunder::new(ledger, config.default_pool_slug.clone()));
    let reconciler = Reconciler::new(funder);

    let options = RunOptions {
        limit: args.limit.unwrap_or_else(|| config.reconcile_limit()),
        dry_run: args.dry_run,
    };

    info!(job = ?args.job, limit = options.limit, dry_run = options.dry_run, "🔧 Reconciliation requested");

    let mut summaries = Vec::new();
    for job in args.job.jobs() {
        summaries.push(reconciler.run(job, options).await?);
    }

    println!("{}", serde_json::to_string_pretty(&summaries)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_job_and_flags() {
        let args =
            CliArgs::try_parse_from(["reconcile", "close-pool-deficits", "--limit", "25", "--dry-run"])
                .unwrap();
        assert_eq!(args.job, JobSelector::ClosePoolDeficits);
        assert_eq!(args.limit, Some(25));
        assert!(args.dry_run);
    }

    #[test]
    fn test_default_job_runs_everything_in_order() {
        let args = CliArgs::try_parse_from(["reconcile"]).unwrap();
        assert_eq!(args.job.jobs(), ReconcileJob::ALL.to_vec());
        assert!(!args.dry_run);
    }

    #[test]
    fn test_unknown_job_is_rejected() {
        assert!(CliArgs::try_parse_from(["reconcile", "vacuum"]).is_err());
    }
}
