//! Dispatch - transactional outbox drain and webhook delivery service.

mod app;
mod commands;
mod http;
mod output;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use dispatch_core::{DeliveryStatus, DispatchConfig};
use dispatch_database::{queries::DEFAULT_PAGE_SIZE, AsyncDatabase};
use observability::LogConfig;

/// Dispatch command-line interface.
#[derive(Parser)]
#[command(name = "dispatch")]
#[command(about = "Outbox drain and webhook delivery service")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Log level (trace, debug, info, warn, error). Defaults to DISPATCH_LOG_LEVEL or info
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// SQLite database file. Defaults to DISPATCH_DATABASE_PATH or ~/.dispatch/dispatch.db
    #[arg(long, global = true)]
    database_path: Option<PathBuf>,

    /// Output format (text or json)
    #[arg(short, long, default_value = "text", global = true)]
    format: output::OutputFormat,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the drain, delivery workers and sweeper
    Run {
        /// Use a process-local broker instead of Redis
        #[arg(long)]
        in_memory_broker: bool,
    },

    /// Manage webhook endpoints
    Endpoints {
        #[command(subcommand)]
        command: EndpointCommands,
    },

    /// Inspect and replay deliveries
    Deliveries {
        #[command(subcommand)]
        command: DeliveryCommands,
    },

    /// Stage a domain event in the outbox
    Emit {
        #[arg(long)]
        tenant: String,
        /// Event type, e.g. order.created
        #[arg(long = "type")]
        event_type: String,
        /// JSON payload
        #[arg(long, default_value = "{}")]
        payload: String,
    },
}

#[derive(Subcommand)]
enum EndpointCommands {
    /// Register an endpoint
    Add {
        #[arg(long)]
        tenant: String,
        #[arg(long)]
        url: String,
        /// Signing secret shared with the receiver
        #[arg(long)]
        secret: String,
    },
    /// List a tenant's endpoints
    List {
        #[arg(long)]
        tenant: String,
    },
    /// Enable an endpoint
    Enable {
        #[arg(long)]
        id: String,
    },
    /// Disable an endpoint
    Disable {
        #[arg(long)]
        id: String,
    },
}

#[derive(Subcommand)]
enum DeliveryCommands {
    /// List a tenant's deliveries, newest first
    List {
        #[arg(long)]
        tenant: String,
        /// pending, retrying, delivered, failed or dead
        #[arg(long)]
        status: Option<DeliveryStatus>,
        #[arg(long, default_value_t = DEFAULT_PAGE_SIZE)]
        limit: usize,
        #[arg(long, default_value_t = 0)]
        offset: usize,
    },
    /// Reset a delivery to pending; a running service picks it up
    Replay {
        #[arg(long)]
        tenant: String,
        #[arg(long)]
        id: String,
    },
}

impl Cli {
    fn config(&self) -> DispatchConfig {
        let mut config = DispatchConfig::new();
        if let Some(level) = &self.log_level {
            config.log_level = level.clone();
        }
        if let Some(path) = &self.database_path {
            config.database_path = path.clone();
        }
        config
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = cli.config();
    let format = cli.format;

    let serving = matches!(cli.command, None | Some(Commands::Run { .. }));
    observability::init_with_config(LogConfig {
        service_name: "dispatch".into(),
        default_level: config.log_level.clone(),
        log_path: serving.then(observability::default_log_path),
        ..Default::default()
    })?;

    let command = cli.command.unwrap_or(Commands::Run {
        in_memory_broker: false,
    });

    if let Commands::Run { in_memory_broker } = command {
        return app::run_service(config, in_memory_broker).await;
    }

    let db = AsyncDatabase::open(&config.database_path).await?;
    let result = match command {
        Commands::Endpoints { command } => match command {
            EndpointCommands::Add {
                tenant,
                url,
                secret,
            } => {
                commands::endpoints::add(&db, &tenant, &url, &secret, &format)
                    .await
                    .map(drop)
            }
            EndpointCommands::List { tenant } => {
                commands::endpoints::list(&db, &tenant, &format).await.map(drop)
            }
            EndpointCommands::Enable { id } => {
                commands::endpoints::set_enabled(&db, &id, true, &format).await
            }
            EndpointCommands::Disable { id } => {
                commands::endpoints::set_enabled(&db, &id, false, &format).await
            }
        },
        Commands::Deliveries { command } => match command {
            DeliveryCommands::List {
                tenant,
                status,
                limit,
                offset,
            } => {
                commands::deliveries::list(&db, &tenant, status, limit, offset, &format)
                    .await
                    .map(drop)
            }
            DeliveryCommands::Replay { tenant, id } => {
                commands::deliveries::replay(&db, &tenant, &id, &format)
                    .await
                    .map(drop)
            }
        },
        Commands::Emit {
            tenant,
            event_type,
            payload,
        } => {
            commands::emit::emit(&db, &tenant, &event_type, &payload, &format)
                .await
                .map(drop)
        }
        Commands::Run { .. } => Ok(()),
    };

    db.close().await?;
    result
}
