//! ndbpool: connect a pool over the in-memory driver and query its dictionary.
//!
//! ```text
//! ndbpool --config pool.toml --catalog catalog.toml list-tables --db shop
//! ndbpool --catalog catalog.toml describe orders --format json
//! ndbpool --catalog catalog.toml stats
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "ndbpool",
    about = "Inspect an NDB connection pool",
    version,
    propagate_version = true
)]
struct Cli {
    /// Pool properties (TOML). Defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Table catalog served by the in-memory driver (TOML).
    #[arg(long, global = true)]
    catalog: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List the tables of a database
    ListTables {
        /// Database (default: the pool's database)
        #[arg(long)]
        db: Option<String>,
        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },
    /// Show the columns of a table
    Describe {
        table: String,
        /// Database (default: the pool's database)
        #[arg(long)]
        db: Option<String>,
        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },
    /// Print pool and connection statistics as JSON
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("ndbpool=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let pool = commands::open(cli.config.as_deref(), cli.catalog.as_deref()).await?;

    let output = match cli.command {
        Command::ListTables { db, format } => commands::list_tables(&pool, db.as_deref(), &format).await,
        Command::Describe { table, db, format } => {
            commands::describe(&pool, &table, db.as_deref(), &format).await
        }
        Command::Stats => commands::stats(&pool).await,
    };

    pool.close().await?;
    println!("{}", output?);
    Ok(())
}
