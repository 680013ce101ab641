use std::io::Write;

use anyhow::{Context, Result, bail};
use clap::Parser;
use marketplace_escrow_runtime::{
    EscrowStores,
    config::Config,
    ledger::{LedgerError, WalletLedgerService},
    notifications::types::NotificationStatusV1,
};
use serde_json::json;

/// Compares every wallet's counters against its ledger projection and lists
/// notifications the dispatcher gave up on. Output is one JSON object per line.
#[derive(Parser, Debug)]
struct Args {
    /// Only check these accounts. Defaults to every known account.
    #[arg(long = "account")]
    accounts: Vec<String>,

    /// Also print accounts that reconcile cleanly.
    #[arg(long)]
    all: bool,

    /// Maximum number of failed notifications to list.
    #[arg(long, default_value_t = 100)]
    failed_notification_limit: i64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = Config::from_env().context("load escrow config")?;
    if config.db_url.is_none() {
        tracing::warn!("DB_URL not set; reconciling an empty in-memory store");
    }
    let stores = EscrowStores::from_config(&config).await?;
    let ledger = WalletLedgerService::new_with_policy(stores.ledger.clone(), config.wallet_policy);

    let account_ids = if args.accounts.is_empty() {
        ledger
            .account_ids()
            .await
            .context("list wallet accounts")?
    } else {
        args.accounts.clone()
    };

    let mut stdout = std::io::stdout().lock();
    let mut mismatches = 0_usize;
    for account_id in &account_ids {
        let report = match ledger.reconcile(account_id).await {
            Ok(report) => report,
            Err(LedgerError::NotFound) => {
                writeln!(
                    stdout,
                    "{}",
                    json!({ "kind": "account_missing", "account_id": account_id })
                )?;
                continue;
            }
            Err(error) => bail!("reconcile {account_id}: {}", error.message()),
        };
        if !report.matches {
            mismatches += 1;
        }
        if !report.matches || args.all {
            let kind = if report.matches {
                "account_ok"
            } else {
                "account_mismatch"
            };
            writeln!(stdout, "{}", json!({ "kind": kind, "report": report }))?;
        }
    }

    let failed = stores
        .contracts
        .list_notifications_by_status(
            NotificationStatusV1::Failed,
            args.failed_notification_limit.max(1),
        )
        .await
        .context("list failed notifications")?;
    for notification in &failed {
        writeln!(
            stdout,
            "{}",
            json!({ "kind": "failed_notification", "notification": notification })
        )?;
    }
    stdout.flush()?;

    tracing::info!(
        accounts = account_ids.len(),
        mismatches,
        failed_notifications = failed.len(),
        "escrow reconciliation finished"
    );
    if mismatches > 0 {
        bail!("{mismatches} account(s) disagree with their ledger projection");
    }
    Ok(())
}
