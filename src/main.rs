use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use bank_persistence::{load_csv, logging, AccountMgr, Store, StoreConfig};

#[derive(Parser)]
#[command(name = "bank", version, about = "Account store with session-level persistence")]
struct Cli {
    /// JSON store config file
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Database file (overrides config and BANK_DATABASE_PATH)
    #[arg(long, short = 'd')]
    database: Option<PathBuf>,

    #[arg(long, short = 'v')]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create an account with a zero balance
    Create { account_nr: i64 },
    /// Show the account with this number
    Get { account_nr: i64 },
    /// List all accounts
    List,
    /// Import accounts from a CSV file (account_nr,balance)
    Import { csv: PathBuf },
    /// Show the audit trail of one account id
    Events { id: i64 },
    /// Delete all accounts and events
    Clean,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let config = load_config(&cli)?;
    let store = Store::open(config).context("Failed to open store")?;
    let mgr = AccountMgr::new(store);

    match cli.command {
        Command::Create { account_nr } => {
            let account = mgr.create_account(account_nr)?;
            println!("{}", serde_json::to_string_pretty(&account)?);
        }
        Command::Get { account_nr } => match mgr.get_account(account_nr)? {
            Some(account) => println!("{}", serde_json::to_string_pretty(&account)?),
            None => {
                eprintln!("No account with number {}", account_nr);
                std::process::exit(1);
            }
        },
        Command::List => {
            let accounts = mgr.list_accounts()?;
            println!("{}", serde_json::to_string_pretty(&accounts)?);
        }
        Command::Import { csv } => {
            let records = load_csv(&csv)
                .with_context(|| format!("Failed to read {}", csv.display()))?;
            let imported = mgr.import_accounts(records)?;
            println!("Imported {} accounts", imported.len());
        }
        Command::Events { id } => {
            let events = mgr.store().events_for_account(id)?;
            println!("{}", serde_json::to_string_pretty(&events)?);
        }
        Command::Clean => {
            mgr.store().clean()?;
            println!("Store cleaned");
        }
    }

    Ok(())
}

fn load_config(cli: &Cli) -> Result<StoreConfig> {
    let mut config = match &cli.config {
        Some(path) => StoreConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => StoreConfig::default(),
    }
    .with_env_overrides();

    if let Some(database) = &cli.database {
        config.database_path = database.clone();
    }

    Ok(config)
}
