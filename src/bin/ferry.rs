//! ferry: operator CLI for the outbox and the dead-letter stream.
//!
//! ## Commands
//! - `init-schema`: create the outbox table and indexes
//! - `dispatch`: run the dispatcher until Ctrl+C
//! - `dispatch-once`: run a single dispatch cycle and print what it did
//! - `dlq list|replay|discard`: inspect and act on dead letters
//!
//! ## Configuration
//! - `--config <FILE>` or FERRY_CONFIG: YAML configuration file
//! - FERRY__SECTION__KEY: overrides for individual keys
//! - FERRY_LOG: log filter (default: info)

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;

use ferry::config::Config;
use ferry::dispatcher::Dispatcher;
use ferry::dlq::DeadLetterQueue;
use ferry::outbox::PostgresOutboxStore;
use ferry::stream::{RedisClient, RedisEventLog};
use ferry::utils::bootstrap::{cancel_on_ctrl_c, init_tracing};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Cli {
    /// Configuration file to load on top of the defaults.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create the outbox table and its indexes if missing.
    InitSchema,
    /// Run the dispatcher until interrupted.
    Dispatch,
    /// Run one dispatch cycle.
    DispatchOnce,
    /// Dead-letter stream tooling.
    #[command(subcommand)]
    Dlq(DlqCommand),
}

#[derive(Debug, Subcommand)]
enum DlqCommand {
    /// Print the oldest dead letters.
    List {
        #[arg(short, long, default_value_t = 20)]
        count: usize,
    },
    /// Re-append a dead letter's event to the main stream.
    Replay { id: String },
    /// Delete a dead letter.
    Discard { id: String },
}

async fn connect_store(config: &Config) -> Result<Arc<PostgresOutboxStore>, Box<dyn std::error::Error>> {
    let store =
        PostgresOutboxStore::connect(&config.database.url, config.database.max_connections).await?;
    Ok(Arc::new(store))
}

async fn connect_log(config: &Config) -> Result<Arc<RedisEventLog>, Box<dyn std::error::Error>> {
    let client = RedisClient::connect(&config.redis.url).await?;
    Ok(Arc::new(RedisEventLog::new(&client).await?))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let cli = Cli::parse();
    let config_path = cli.config.as_ref().and_then(|p| p.to_str());
    let config = Config::load(config_path)?;

    match cli.command {
        Command::InitSchema => {
            connect_store(&config).await?.init().await?;
        }
        Command::Dispatch => {
            let dispatcher = Dispatcher::new(
                connect_store(&config).await?,
                connect_log(&config).await?,
                &config.stream,
                config.dispatcher.clone(),
            );
            let token = CancellationToken::new();
            cancel_on_ctrl_c(token.clone());
            dispatcher.run(token).await;
        }
        Command::DispatchOnce => {
            let mut dispatcher = Dispatcher::new(
                connect_store(&config).await?,
                connect_log(&config).await?,
                &config.stream,
                config.dispatcher.clone(),
            );
            let report = dispatcher.run_once().await?;
            println!(
                "claimed={} published={} purged={}",
                report.claimed, report.published, report.purged
            );
        }
        Command::Dlq(command) => {
            let dlq = DeadLetterQueue::new(connect_log(&config).await?, &config.stream);
            match command {
                DlqCommand::List { count } => {
                    for entry in dlq.list(count).await? {
                        let letter = &entry.dead_letter;
                        println!(
                            "{}\t{}\t{}\tattempts={}\tfailed_at={}\t{}",
                            entry.id,
                            letter.event_id().unwrap_or("-"),
                            letter.event_type().unwrap_or("-"),
                            letter.attempts,
                            letter.failed_at.to_rfc3339(),
                            letter.error
                        );
                    }
                }
                DlqCommand::Replay { id } => {
                    let new_id = dlq.replay(&id).await?;
                    info!(dead_letter_id = %id, entry_id = %new_id, "Replayed");
                    println!("{new_id}");
                }
                DlqCommand::Discard { id } => {
                    dlq.discard(&id).await?;
                    info!(dead_letter_id = %id, "Discarded");
                }
            }
        }
    }

    Ok(())
}
