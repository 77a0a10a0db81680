//! Statsor: football club data from the command line
//!
//! Thin front end over `statsor-sync`. Subcommands:
//! - `login` / `demo` / `logout` / `status`: session management
//! - `players`, `teams`, `matches`, `attendance`, `club`: read and edit data
//! - `watch`: stream change notifications for one table

use std::path::PathBuf;

use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use miette::Result;
use statsor_sync::ListFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;

/// Parse a `column=value` filter.
fn parse_filter(s: &str) -> Result<ListFilter, String> {
    ListFilter::parse(s).ok_or_else(|| format!("invalid filter '{}', expected column=value", s))
}

#[derive(Parser)]
#[command(name = "statsor")]
#[command(about = "Football club data with offline fallback", long_about = None)]
struct Cli {
    /// REST API base URL
    #[arg(long, env = "STATSOR_API_URL", default_value = "http://localhost:3001/api")]
    api_url: String,

    /// Changefeed WebSocket URL
    #[arg(
        long,
        env = "STATSOR_CHANGEFEED_URL",
        default_value = "ws://localhost:3001/realtime"
    )]
    changefeed_url: String,

    /// Directory for the persisted session and demo dataset
    #[arg(long, env = "STATSOR_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Cache entry lifetime in seconds
    #[arg(long, default_value = "30")]
    ttl_secs: u64,

    /// Deadline for live fetches in milliseconds
    #[arg(long, default_value = "5000")]
    timeout_ms: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sign in to the real backend
    Login {
        /// Account (profile) id
        #[arg(long, env = "STATSOR_ACCOUNT")]
        account: String,

        /// Bearer token
        #[arg(long, env = "STATSOR_TOKEN")]
        token: String,
    },

    /// Switch to the local demo dataset
    Demo,

    /// Sign out and remove local demo data
    Logout,

    /// Show the current session
    Status,

    /// Players
    Players {
        #[command(subcommand)]
        action: PlayerCommand,
    },

    /// Teams
    Teams {
        #[command(subcommand)]
        action: TeamCommand,
    },

    /// Matches
    Matches {
        #[command(subcommand)]
        action: MatchCommand,
    },

    /// List attendance records
    Attendance {
        /// Only rows where column=value
        #[arg(long, value_parser = parse_filter)]
        filter: Option<ListFilter>,
    },

    /// Club profile
    Club {
        #[command(subcommand)]
        action: ClubCommand,
    },

    /// Print change notifications for a table as JSON lines
    Watch {
        /// Table name (players, teams, matches, club_data, attendance)
        table: String,

        /// Only rows where column=value
        #[arg(long, value_parser = parse_filter)]
        filter: Option<ListFilter>,

        /// Stop after this many seconds (default: until interrupted)
        #[arg(long)]
        for_secs: Option<u64>,
    },
}

#[derive(Subcommand)]
pub enum PlayerCommand {
    List {
        #[arg(long, value_parser = parse_filter)]
        filter: Option<ListFilter>,
    },
    Get {
        id: String,
    },
    Add {
        #[arg(long)]
        name: String,
        #[arg(long)]
        position: String,
        #[command(flatten)]
        fields: PlayerFields,
    },
    Update {
        id: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        position: Option<String>,
        #[command(flatten)]
        fields: PlayerFields,
    },
    Delete {
        id: String,
    },
}

#[derive(clap::Args)]
pub struct PlayerFields {
    #[arg(long)]
    pub team_id: Option<String>,
    #[arg(long)]
    pub jersey_number: Option<i32>,
    #[arg(long)]
    pub age: Option<i32>,
    #[arg(long)]
    pub email: Option<String>,
    #[arg(long)]
    pub nationality: Option<String>,
}

#[derive(Subcommand)]
pub enum TeamCommand {
    List,
    Add {
        #[arg(long)]
        name: String,
        #[arg(long)]
        category: Option<String>,
        #[arg(long)]
        formation: Option<String>,
        #[arg(long)]
        founded: Option<i32>,
    },
    Delete {
        id: String,
    },
}

#[derive(Subcommand)]
pub enum MatchCommand {
    List {
        #[arg(long, value_parser = parse_filter)]
        filter: Option<ListFilter>,
    },
    Add {
        #[arg(long)]
        opponent: String,
        /// Match date (YYYY-MM-DD)
        #[arg(long)]
        date: NaiveDate,
        #[arg(long)]
        team_id: Option<String>,
        #[arg(long)]
        venue: Option<String>,
        #[arg(long)]
        home: bool,
    },
    Delete {
        id: String,
    },
}

#[derive(Subcommand)]
pub enum ClubCommand {
    Show,
    Update {
        id: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        stadium: Option<String>,
        #[arg(long)]
        city: Option<String>,
        #[arg(long)]
        founded: Option<i32>,
        #[arg(long)]
        colors: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr so stdout stays machine-readable.
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "statsor=info,statsor_sync=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let ctx = commands::Context::open(&cli)?;

    match cli.command {
        Commands::Login { account, token } => ctx.login(&account, &token).await,
        Commands::Demo => ctx.demo().await,
        Commands::Logout => ctx.logout().await,
        Commands::Status => ctx.status().await,
        Commands::Players { action } => ctx.players(action).await,
        Commands::Teams { action } => ctx.teams(action).await,
        Commands::Matches { action } => ctx.matches(action).await,
        Commands::Attendance { filter } => ctx.attendance(filter).await,
        Commands::Club { action } => ctx.club(action).await,
        Commands::Watch {
            table,
            filter,
            for_secs,
        } => ctx.watch(&table, filter, for_secs).await,
    }
}
