//! social-chat - terminal client for direct and group chat
//!
//! Talks STOMP over WebSocket for live messages and REST for history.

mod api;
mod auth;
mod config;
mod messaging;
mod models;
mod stomp;
mod terminal;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use models::{GroupId, UserId};

#[derive(Parser)]
#[command(name = "social-chat")]
#[command(about = "Terminal client for direct and group chat", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Log in as the user with this email
    Login {
        email: String,

        /// Bearer token for REST calls
        #[arg(long)]
        token: Option<String>,

        /// Look the user up again even if already logged in
        #[arg(short, long)]
        force: bool,
    },

    /// Forget the stored identity and token
    Logout,

    /// Show login status and endpoints
    Status,

    /// Show the logged-in user's profile
    Whoami,

    /// Print the direct conversation with a user
    History {
        /// The other user's numeric id
        user_id: UserId,
    },

    /// Print a group's conversation
    GroupHistory { group_id: GroupId },

    /// List groups you belong to
    Groups,

    /// Open an interactive direct chat
    Chat {
        /// The other user's numeric id
        user_id: UserId,
    },

    /// Open an interactive group chat
    Group { group_id: GroupId },

    /// Print all live traffic until Ctrl+C
    Listen {
        /// Also follow these groups
        #[arg(short, long = "group")]
        groups: Vec<GroupId>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    match cli.command {
        Commands::Login {
            email,
            token,
            force,
        } => {
            auth::login(&email, token, force).await?;
        }
        Commands::Logout => {
            tracing::info!("Logging out...");
            auth::logout().await?;
        }
        Commands::Status => {
            auth::status().await?;
        }
        Commands::Whoami => {
            api::whoami().await?;
        }
        Commands::History { user_id } => {
            api::print_history(user_id).await?;
        }
        Commands::GroupHistory { group_id } => {
            api::print_group_history(group_id).await?;
        }
        Commands::Groups => {
            api::list_groups().await?;
        }
        Commands::Chat { user_id } => {
            terminal::run_direct(user_id).await?;
        }
        Commands::Group { group_id } => {
            terminal::run_group(group_id).await?;
        }
        Commands::Listen { groups } => {
            terminal::listen(groups).await?;
        }
    }

    Ok(())
}
