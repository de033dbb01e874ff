//! TaskSync CLI: key and token tooling, and inspection of a device's
//! offline queue.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;

use commands::{KeepSide, KindArg, OpArg};

/// TaskSync - multi-device task sync
#[derive(Parser, Debug)]
#[command(name = "tasksync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Manage token signing keys
    Keys {
        #[command(subcommand)]
        command: KeyCommands,
    },

    /// Issue a signed token
    Token {
        /// File holding the hex secret key
        #[arg(short, long)]
        key: PathBuf,
        /// User id the token is issued to
        #[arg(short, long)]
        user: String,
        /// Lifetime in seconds
        #[arg(long, default_value_t = 3600)]
        ttl: u64,
        /// Issue a refresh token instead of an access token
        #[arg(long)]
        refresh: bool,
    },

    /// Inspect and edit the offline queue
    Queue {
        /// Queue log file
        #[arg(short, long, default_value = "tasksync-queue.log")]
        store: PathBuf,
        #[command(subcommand)]
        command: QueueCommands,
    },

    /// Inspect and resolve conflicts
    Conflicts {
        /// Queue log file
        #[arg(short, long, default_value = "tasksync-queue.log")]
        store: PathBuf,
        #[command(subcommand)]
        command: ConflictCommands,
    },

    /// Replay the offline queue to a sync node
    Sync {
        /// Queue log file
        #[arg(short, long, default_value = "tasksync-queue.log")]
        store: PathBuf,
        /// WebSocket URL of the node
        #[arg(long, default_value = "ws://127.0.0.1:8080/ws")]
        url: String,
        /// Access token
        #[arg(long, env = "TASKSYNC_TOKEN")]
        token: String,
    },

    /// Show version information
    Version,
}

#[derive(Subcommand, Debug)]
enum KeyCommands {
    /// Generate a signing key pair
    Generate {
        /// Write the secret key to this file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Subcommand, Debug)]
enum QueueCommands {
    /// List queued mutations in replay order
    List,
    /// Queue a mutation
    Add {
        #[arg(value_enum)]
        op: OpArg,
        #[arg(value_enum)]
        kind: KindArg,
        /// Resource id
        id: String,
        /// Resource fields as a JSON object
        #[arg(long, default_value = "{}")]
        data: String,
        /// Server version the edit is based on
        #[arg(long)]
        base_version: Option<u64>,
    },
    /// Send a failed item again
    Retry { id: String },
    /// Drop a failed item
    Discard { id: String },
    /// Rewrite the log without superseded records
    Compact,
}

#[derive(Subcommand, Debug)]
enum ConflictCommands {
    /// List conflicts
    List {
        /// Include resolved conflicts
        #[arg(long)]
        all: bool,
    },
    /// Resolve a conflict
    Resolve {
        id: String,
        /// Which side wins
        #[arg(long, value_enum)]
        keep: KeepSide,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("tasksync={log_level}").into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let result = match cli.command {
        Commands::Keys { command } => match command {
            KeyCommands::Generate { output } => commands::keys_generate(output.as_deref()),
        },
        Commands::Token {
            key,
            user,
            ttl,
            refresh,
        } => commands::token_issue(&key, &user, ttl, refresh),
        Commands::Queue { store, command } => match command {
            QueueCommands::List => commands::queue_list(&store),
            QueueCommands::Add {
                op,
                kind,
                id,
                data,
                base_version,
            } => commands::queue_add(&store, op, kind, &id, &data, base_version),
            QueueCommands::Retry { id } => commands::queue_retry(&store, &id),
            QueueCommands::Discard { id } => commands::queue_discard(&store, &id),
            QueueCommands::Compact => commands::queue_compact(&store),
        },
        Commands::Conflicts { store, command } => match command {
            ConflictCommands::List { all } => commands::conflicts_list(&store, all),
            ConflictCommands::Resolve { id, keep } => {
                commands::conflicts_resolve(&store, &id, keep)
            }
        },
        Commands::Sync { store, url, token } => commands::sync(&store, &url, &token).await,
        Commands::Version => {
            println!("tasksync {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
