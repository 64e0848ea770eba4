//! ledgerd - ledger core daemon
//!
//! ```text
//! ┌──────────┐    ┌──────────┐    ┌────────────┐    ┌──────────┐
//! │  Config  │───▶│ PgPool + │───▶│ Orchestr.  │───▶│ Postgres │
//! │  (YAML)  │    │  Schema  │    │ / Accounts │    │  (rows)  │
//! └──────────┘    └──────────┘    └─────┬──────┘    └──────────┘
//!                                       │ try_send
//!                                       ▼
//!                                 ┌────────────┐
//!                                 │   Task     │
//!                                 │ Processor  │
//!                                 └────────────┘
//! ```
//!
//! Usage:
//! - `ledgerd [-e dev]` runs until Ctrl-C, draining background tasks
//! - `ledgerd --open-account <owner>:<currency>` opens an account and exits
//! - `ledgerd --transfer <from>:<to>:<amount>` runs one transfer and exits
//! - `ledgerd --reconcile <id>[,<id>...]` checks balances against the journal

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use ledger_core::config::AppConfig;
use ledger_core::db::Database;
use ledger_core::logging::init_logging;
use ledger_core::workers::{TaskDistributor, TaskProcessor, task_channel};
use ledger_core::{
    AccountService, Journal, PgLedgerStore, RequestContext, TransferOrchestrator, TransferParams,
};

const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);

// ============================================================
// ARGUMENTS
// ============================================================

fn get_arg(names: &[&str]) -> Option<String> {
    let args: Vec<String> = std::env::args().collect();
    args.windows(2)
        .find(|w| names.contains(&w[0].as_str()))
        .map(|w| w[1].clone())
}

fn get_env() -> String {
    get_arg(&["--env", "-e"]).unwrap_or_else(|| "dev".to_string())
}

enum Command {
    Serve,
    OpenAccount { owner: String, currency: String },
    Transfer(TransferParams),
    Reconcile(Vec<i64>),
}

fn parse_command() -> anyhow::Result<Command> {
    if let Some(arg) = get_arg(&["--open-account"]) {
        let (owner, currency) = arg
            .split_once(':')
            .context("--open-account expects <owner>:<currency>")?;
        return Ok(Command::OpenAccount {
            owner: owner.to_string(),
            currency: currency.to_string(),
        });
    }

    if let Some(arg) = get_arg(&["--transfer"]) {
        let parts: Vec<&str> = arg.split(':').collect();
        let [from, to, amount] = parts.as_slice() else {
            bail!("--transfer expects <from>:<to>:<amount>, got '{}'", arg);
        };
        return Ok(Command::Transfer(TransferParams {
            from_account_id: from.parse().context("invalid from account id")?,
            to_account_id: to.parse().context("invalid to account id")?,
            amount: amount.parse().context("invalid amount")?,
        }));
    }

    if let Some(arg) = get_arg(&["--reconcile"]) {
        let ids = arg
            .split(',')
            .map(|s| s.trim().parse::<i64>())
            .collect::<Result<Vec<_>, _>>()
            .context("--reconcile expects comma-separated account ids")?;
        return Ok(Command::Reconcile(ids));
    }

    Ok(Command::Serve)
}

// ============================================================
// MAIN
// ============================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = get_env();
    let config = AppConfig::load(&env).with_context(|| format!("loading config for '{}'", env))?;
    let _guard = init_logging(&config);

    info!(
        env = %env,
        version = env!("CARGO_PKG_VERSION"),
        git_hash = env!("GIT_HASH"),
        "Starting ledgerd"
    );

    let command = parse_command()?;

    let db = Database::connect(&config.database)
        .await
        .context("connecting to PostgreSQL")?;
    db.migrate().await.context("applying schema")?;

    let store = Arc::new(PgLedgerStore::new(db.pool().clone()));
    let (distributor, receiver) = task_channel(config.tasks.queue_size);
    let distributor: Arc<dyn TaskDistributor> = Arc::new(distributor);

    let shutdown = CancellationToken::new();
    let processor = tokio::spawn(TaskProcessor::new(receiver).run(shutdown.clone()));

    let accounts = AccountService::new(store.clone(), distributor.clone(), config.pagination);
    let mut orchestrator = TransferOrchestrator::new(store.clone())
        .with_overdraft_policy(config.transfer.overdraft);
    if let Some(timeout) = config.transfer.timeout() {
        orchestrator = orchestrator.with_timeout(timeout);
    }
    let journal = Journal::new(store.clone());

    let outcome = match command {
        Command::Serve => serve(&db, &shutdown).await,
        Command::OpenAccount { owner, currency } => accounts
            .create_account(&owner, &currency)
            .await
            .map(|account| info!(account_id = account.id, "Account opened"))
            .map_err(Into::into),
        Command::Transfer(params) => orchestrator
            .transfer(&RequestContext::with_cancellation(shutdown.clone()), params)
            .await
            .map(|result| {
                info!(
                    transfer_id = result.transfer.id,
                    from_balance = result.from_account.balance,
                    to_balance = result.to_account.balance,
                    "Transfer done"
                )
            })
            .map_err(Into::into),
        Command::Reconcile(ids) => reconcile(&journal, &ids).await,
    };

    // Dropping every distributor closes the queue; the processor drains what
    // is left and exits.
    drop(accounts);
    drop(distributor);
    match processor.await {
        Ok(processed) => info!(processed, "Task processor stopped"),
        Err(e) => error!(error = %e, "Task processor panicked"),
    }

    db.close().await;
    info!("ledgerd stopped");
    outcome
}

/// Run until Ctrl-C, checking the database periodically.
async fn serve(db: &Database, shutdown: &CancellationToken) -> anyhow::Result<()> {
    info!("ledgerd ready");
    let mut ticker = tokio::time::interval(HEALTH_CHECK_INTERVAL);

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("listening for Ctrl-C")?;
                info!("Shutdown signal received");
                shutdown.cancel();
                return Ok(());
            }
            _ = ticker.tick() => {
                if let Err(e) = db.health_check().await {
                    warn!(error = %e, "Database health check failed");
                }
            }
        }
    }
}

async fn reconcile(journal: &Journal<PgLedgerStore>, ids: &[i64]) -> anyhow::Result<()> {
    let mut drifted = 0;
    for &id in ids {
        let report = journal.reconcile(id).await?;
        info!(
            account_id = id,
            balance = report.balance,
            journal_sum = report.journal_sum,
            drift = report.drift(),
            "Reconciled"
        );
        if !report.is_balanced() {
            drifted += 1;
        }
    }
    if drifted > 0 {
        bail!("{} of {} accounts do not match their journal", drifted, ids.len());
    }
    Ok(())
}
