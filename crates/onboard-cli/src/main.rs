//! onboard - customer-onboarding request management CLI.
//!
//! Admin front end over the core library: list/inspect requests, drive the
//! lifecycle (create, update, approve, reject, delete), pull the upstream
//! feed, and verify two-factor codes.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod commands;

/// onboard - customer-onboarding request management
#[derive(Parser, Debug)]
#[command(name = "onboard")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "onboard.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,

    /// Acting username recorded in the audit history
    #[arg(long)]
    actor: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List requests (pulls the upstream feed first unless --no-sync)
    #[command(alias = "ls")]
    List {
        /// Skip the upstream feed pull
        #[arg(long)]
        no_sync: bool,

        /// Filter by status (Pending, Rejected, Completed)
        #[arg(long)]
        status: Option<String>,

        /// Filter by company-name substring (case-insensitive)
        #[arg(long)]
        company: Option<String>,

        /// Filter by email substring (case-insensitive)
        #[arg(long)]
        email: Option<String>,

        /// Filter by role tag
        #[arg(long)]
        role: Option<String>,
    },

    /// Show one request with persons, history, and attachments
    Show {
        /// Request id
        id: i64,
    },

    /// Create a request from a JSON file
    Create {
        /// Path to the JSON request body
        file: PathBuf,
    },

    /// Apply a JSON patch to a request
    Update {
        /// Request id
        id: i64,

        /// Path to the JSON patch body
        file: PathBuf,
    },

    /// Attach a local file to a request
    Attach {
        /// Request id
        id: i64,

        /// File to attach
        file: PathBuf,
    },

    /// Remove an attachment from a request
    Detach {
        /// Request id
        id: i64,

        /// Attachment id
        attachment_id: i64,
    },

    /// Approve a request, optionally granting the customer code and roles
    Approve {
        /// Request id
        id: i64,

        /// Customer code to assign
        #[arg(long)]
        customer_code: Option<String>,

        /// Role tag to grant (repeatable)
        #[arg(long = "role")]
        roles: Vec<String>,
    },

    /// Reject a request
    Reject {
        /// Request id
        id: i64,

        /// Rejection notes
        #[arg(long)]
        notes: Option<String>,
    },

    /// Soft-delete a request
    Delete {
        /// Request id
        id: i64,
    },

    /// Pull the upstream feed once
    Sync,

    /// Show counts of active requests by status
    Stats,

    /// Verify a two-factor code
    Verify {
        /// Username the code was issued for
        username: String,

        /// The 4-digit code
        code: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let app = commands::App::new(&cli.config, cli.actor)?;

    match cli.command {
        Commands::List {
            no_sync,
            status,
            company,
            email,
            role,
        } => app.list(no_sync, status.as_deref(), company, email, role),
        Commands::Show { id } => app.show(id),
        Commands::Create { file } => app.create(&file),
        Commands::Update { id, file } => app.update(id, &file),
        Commands::Attach { id, file } => app.attach(id, &file),
        Commands::Detach { id, attachment_id } => app.detach(id, attachment_id),
        Commands::Approve {
            id,
            customer_code,
            roles,
        } => app.approve(id, customer_code, roles),
        Commands::Reject { id, notes } => app.reject(id, notes.as_deref()),
        Commands::Delete { id } => app.delete(id),
        Commands::Sync => app.sync(),
        Commands::Stats => app.stats(),
        Commands::Verify { username, code } => app.verify(&username, &code),
    }
}
