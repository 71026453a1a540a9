mod commands;
mod helpers;
mod output;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use miette::Result;
use tollgate_core::MaintenancePolicy;
use tracing::debug;

use crate::helpers::Env;

#[derive(Parser)]
#[command(name = "tollgate")]
#[command(about = "Tenant credential vault and shared token pools")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(long, short = 'c', env = "TOLLGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Database file path (overrides config)
    #[arg(long, env = "TOLLGATE_DB_PATH")]
    db_path: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Long-lived credentials
    Credential {
        #[command(subcommand)]
        cmd: CredentialCommands,
    },
    /// Shared access tokens
    Token {
        #[command(subcommand)]
        cmd: TokenCommands,
    },
    /// Cross-tenant cleanup of expired tokens, old usage and idle leases
    Maintenance {
        #[arg(long, default_value_t = 40)]
        token_retention_minutes: i64,
        #[arg(long, default_value_t = 30)]
        usage_retention_days: i64,
    },
    /// Master key management
    Key {
        #[command(subcommand)]
        cmd: KeyCommands,
    },
}

#[derive(Subcommand)]
enum CredentialCommands {
    /// Store or replace a credential
    Set {
        tenant: String,
        system: String,
        #[arg(long)]
        auth_type: String,
        /// JSON object with the secret fields
        #[arg(long)]
        payload: String,
        #[arg(long)]
        expires_in_hours: Option<i64>,
    },
    /// Show a decrypted credential
    Get { tenant: String, system: String },
    /// Delete a credential
    Delete { tenant: String, system: String },
    /// List a tenant's credentials (metadata only)
    List {
        tenant: String,
        #[arg(long)]
        include_expired: bool,
    },
}

#[derive(Subcommand)]
enum TokenCommands {
    /// Add a token to the pool
    Store {
        tenant: String,
        provider: String,
        value: String,
    },
    /// Dispense a usable token
    Get { tenant: String, provider: String },
    /// Pool and lock statistics
    Stats { tenant: String, provider: String },
    /// Deactivate expired tokens
    Cleanup {
        tenant: String,
        provider: String,
        /// Wait for the cleanup lock, then run even without it
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand)]
enum KeyCommands {
    /// Print a fresh base64 master key
    Generate,
}

fn init_tracing(debug: bool) {
    use tracing_subscriber::{EnvFilter, fmt};

    let default_filter = if debug {
        "tollgate_core=debug,tollgate_db=debug,tollgate_cli=debug,info"
    } else {
        "tollgate_core=info,tollgate_db=warn,tollgate_cli=info,warn"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let builder = fmt().with_env_filter(filter).with_writer(std::io::stderr);
    if debug {
        builder.with_file(true).with_line_number(true).pretty().init();
    } else {
        builder.with_target(false).compact().init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if it exists
    let _ = dotenvy::dotenv();
    miette::set_hook(Box::new(|_| {
        Box::new(
            miette::MietteHandlerOpts::new()
                .terminal_links(true)
                .with_cause_chain()
                .color(true)
                .context_lines(3)
                .build(),
        )
    }))?;
    miette::set_panic_hook();
    let cli = Cli::parse();
    init_tracing(cli.debug);

    if let Commands::Key { cmd } = &cli.command {
        return match cmd {
            KeyCommands::Generate => commands::key::generate(),
        };
    }

    let env = Env::load(cli.config.as_deref(), cli.db_path.clone()).await?;
    debug!("Using vault at {:?}", env.config.database.path);

    match &cli.command {
        Commands::Credential { cmd } => match cmd {
            CredentialCommands::Set {
                tenant,
                system,
                auth_type,
                payload,
                expires_in_hours,
            } => {
                commands::credential::set(&env, tenant, system, auth_type, payload, *expires_in_hours)
                    .await?
            }
            CredentialCommands::Get { tenant, system } => {
                commands::credential::get(&env, tenant, system).await?
            }
            CredentialCommands::Delete { tenant, system } => {
                commands::credential::delete(&env, tenant, system).await?
            }
            CredentialCommands::List {
                tenant,
                include_expired,
            } => commands::credential::list(&env, tenant, *include_expired).await?,
        },
        Commands::Token { cmd } => match cmd {
            TokenCommands::Store {
                tenant,
                provider,
                value,
            } => commands::token::store(&env, tenant, provider, value).await?,
            TokenCommands::Get { tenant, provider } => {
                commands::token::get(&env, tenant, provider).await?
            }
            TokenCommands::Stats { tenant, provider } => {
                commands::token::stats(&env, tenant, provider).await?
            }
            TokenCommands::Cleanup {
                tenant,
                provider,
                force,
            } => commands::token::cleanup(&env, tenant, provider, *force).await?,
        },
        Commands::Maintenance {
            token_retention_minutes,
            usage_retention_days,
        } => {
            commands::maintenance::run(
                &env,
                MaintenancePolicy {
                    token_retention_minutes: *token_retention_minutes,
                    usage_retention_days: *usage_retention_days,
                },
            )
            .await?
        }
        Commands::Key { .. } => {}
    }

    Ok(())
}
