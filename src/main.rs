//! Bank Ledger - operator entry point
//!
//! ```text
//! bank_ledger [--env dev] [--memory] transfer <from> <to> <amount> [reason]
//! bank_ledger [--env dev] [--memory] reverse <transfer_id>
//! bank_ledger [--env dev] [--memory] balance <account_id>
//! ```
//!
//! Without `--memory` the PostgreSQL store from `postgres_url` (or
//! `DATABASE_URL`) is used. With `--memory` two demo accounts are opened
//! first so a smoke run has something to move.

use std::sync::Arc;

use anyhow::{Context, bail};
use bank_ledger::config::AppConfig;
use bank_ledger::db::Database;
use bank_ledger::ledger::{Currency, LedgerQueries, NewAccount, TransferExecutor, TransferRequest};
use bank_ledger::store::{LedgerStore, MemoryLedgerStore, PgLedgerStore};

fn get_env(args: &[String]) -> String {
    for i in 0..args.len() {
        if (args[i] == "--env" || args[i] == "-e") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }
    "dev".to_string()
}

fn use_memory_store(args: &[String]) -> bool {
    args.iter().any(|a| a == "--memory")
}

/// Positional arguments, flags and their values removed
fn command_args(args: &[String]) -> Vec<String> {
    let mut out = Vec::new();
    let mut skip = false;
    for arg in args.iter().skip(1) {
        if skip {
            skip = false;
            continue;
        }
        match arg.as_str() {
            "--env" | "-e" => skip = true,
            "--memory" => {}
            _ => out.push(arg.clone()),
        }
    }
    out
}

fn parse_i64(value: Option<&String>, name: &str) -> anyhow::Result<i64> {
    let value = value.with_context(|| format!("missing <{}>", name))?;
    value
        .parse()
        .with_context(|| format!("<{}> must be an integer, got {:?}", name, value))
}

async fn open_store(config: &AppConfig, memory: bool) -> anyhow::Result<Arc<dyn LedgerStore>> {
    if memory {
        let store = MemoryLedgerStore::new();
        for owner in ["demo-a", "demo-b"] {
            let account = store
                .create_account(&NewAccount::new(owner, 1_000, Currency::USD))
                .await?;
            tracing::info!(account_id = account.id, owner, "Demo account opened");
        }
        return Ok(Arc::new(store));
    }

    let url = config
        .postgres_url
        .as_deref()
        .context("postgres_url not configured (set it in config or DATABASE_URL)")?;
    let db = Database::connect(url, &config.pool)
        .await
        .context("connect to PostgreSQL")?;
    db.health_check().await.context("database health check")?;
    db.apply_schema().await.context("apply ledger schema")?;
    Ok(Arc::new(PgLedgerStore::new(db.pool().clone())))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let env = get_env(&args);
    let config = AppConfig::load(&env)?;
    let _log_guard = bank_ledger::logging::init_logging(&config);

    let memory = use_memory_store(&args);
    let store = open_store(&config, memory).await?;
    tracing::info!(env = %env, store = store.name(), "Bank ledger starting");

    let executor = TransferExecutor::new(store.clone(), &config.executor);
    let queries = LedgerQueries::new(store);

    let command = command_args(&args);
    match command.first().map(String::as_str) {
        Some("transfer") => {
            let from = parse_i64(command.get(1), "from")?;
            let to = parse_i64(command.get(2), "to")?;
            let amount = parse_i64(command.get(3), "amount")?;
            let mut request = TransferRequest::new(from, to, amount);
            if let Some(reason) = command.get(4) {
                request = request.with_reason(reason.clone());
            }
            let transfer = executor.execute(request).await?;
            println!("{}", serde_json::to_string_pretty(&transfer)?);
        }
        Some("reverse") => {
            let id = parse_i64(command.get(1), "transfer_id")?;
            let reversal = executor.reverse(id, None).await?;
            println!("{}", serde_json::to_string_pretty(&reversal)?);
        }
        Some("balance") => {
            let id = parse_i64(command.get(1), "account_id")?;
            let account = queries.get_account(id).await?;
            println!("{}", serde_json::to_string_pretty(&account)?);
        }
        Some(other) => bail!("unknown command {:?} (expected transfer, reverse or balance)", other),
        None => bail!("usage: bank_ledger [--env ENV] [--memory] <transfer|reverse|balance> ..."),
    }

    Ok(())
}
