use anyhow::Result;
use clap::{Parser, Subcommand};
use uuid::Uuid;

mod commands;

#[derive(Parser)]
#[command(name = "encore")]
#[command(about = "Encore bidding-round operator CLI", long_about = None)]
struct Cli {
    /// Layered config paths in merge order. Falls back to ENCORE_CONFIG.
    #[arg(long = "config", global = true)]
    config_paths: Vec<String>,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Database commands
    Db {
        #[command(subcommand)]
        cmd: DbCmd,
    },

    /// Compute layered config hash + print canonical JSON
    ConfigHash {
        /// Paths in merge order (base -> env -> org overrides...)
        #[arg(required = true)]
        paths: Vec<String>,
    },

    /// Round inspection and administrative overrides
    Round {
        #[command(subcommand)]
        cmd: RoundCmd,
    },

    /// Print the bid history of one request, oldest first
    Bids {
        #[arg(long)]
        request_id: Uuid,
    },

    /// Run one scheduler sweep (close, settle, retry holds, open next rounds)
    Sweep,
}

#[derive(Subcommand)]
enum DbCmd {
    Status,

    /// Apply SQL migrations. Guardrail: refuses while any round is CLOSING unless --yes is provided.
    Migrate {
        /// Acknowledge that a settlement may be in flight.
        #[arg(long, default_value_t = false)]
        yes: bool,
    },
}

#[derive(Subcommand)]
enum RoundCmd {
    /// Print a round and its participating requests
    Show {
        #[arg(long)]
        round_id: Uuid,
    },

    /// Print the open round of an organization, if any
    Active {
        #[arg(long)]
        org_id: Uuid,
    },

    /// Settle a closing round (idempotent)
    Settle {
        #[arg(long)]
        round_id: Uuid,
    },

    /// Cancel a pending/active round and release every hold
    Cancel {
        #[arg(long)]
        round_id: Uuid,

        /// Human reason (logged only)
        #[arg(long)]
        reason: String,
    },

    /// Print the hold dispositions recorded for a round
    Holds {
        #[arg(long)]
        round_id: Uuid,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::from_filename(".env.local");

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.cmd {
        Commands::Db { cmd } => match cmd {
            DbCmd::Status => commands::db::status(&cli.config_paths).await?,
            DbCmd::Migrate { yes } => commands::db::migrate(&cli.config_paths, yes).await?,
        },

        Commands::ConfigHash { paths } => {
            let path_refs: Vec<&str> = paths.iter().map(|s| s.as_str()).collect();
            let loaded = encore_config::load_layered_yaml(&path_refs)?;
            println!("config_hash={}", loaded.config_hash);
            println!("{}", loaded.canonical_json);
        }

        Commands::Round { cmd } => {
            let engine = commands::connect_engine(&cli.config_paths).await?;
            match cmd {
                RoundCmd::Show { round_id } => commands::round::show(&engine, round_id).await?,
                RoundCmd::Active { org_id } => commands::round::active(&engine, org_id).await?,
                RoundCmd::Settle { round_id } => commands::round::settle(&engine, round_id).await?,
                RoundCmd::Cancel { round_id, reason } => {
                    commands::round::cancel(&engine, round_id, &reason).await?
                }
                RoundCmd::Holds { round_id } => commands::round::holds(&engine, round_id).await?,
            }
        }

        Commands::Bids { request_id } => {
            let engine = commands::connect_engine(&cli.config_paths).await?;
            commands::round::bids(&engine, request_id).await?;
        }

        Commands::Sweep => {
            let engine = commands::connect_engine(&cli.config_paths).await?;
            commands::round::sweep(&engine).await?;
        }
    }

    Ok(())
}
