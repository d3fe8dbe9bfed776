//! murmur: offline-first client cache
//!
//! Main binary with subcommands:
//! - `list`, `post`, `comment`, `chat`: read and write collections
//! - `like`, `unlike`, `hide`, `edit`, `delete`: optimistic edits
//! - `support`: support inbox
//! - `sync`, `evict`: maintenance
//! - `watch`: realtime feed and background reconciliation

use clap::{Parser, Subcommand};
use miette::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod app;
mod commands;
mod watch;

use app::{CollectionArg, GlobalArgs};

/// Parse boolean from environment variable, accepting common truthy values.
/// Accepts "1", "true", "yes", "on" (case-insensitive) as true.
/// Accepts "0", "false", "no", "off", "" (case-insensitive) as false.
pub(crate) fn parse_bool_env(s: &str) -> Result<bool, String> {
    match s.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(format!(
            "invalid boolean value '{}', expected 1/true/yes/on or 0/false/no/off",
            s
        )),
    }
}

#[derive(Parser)]
#[command(name = "murmur")]
#[command(about = "Offline-first cache for posts, comments and chat", long_about = None)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sign in locally as an identity
    Login {
        /// Identity id
        #[arg(long)]
        id: String,

        /// Display name
        #[arg(long)]
        name: String,

        /// Role (user, support, admin)
        #[arg(long, default_value = "user")]
        role: String,
    },

    /// Forget the signed-in identity
    Logout,

    /// Show the signed-in identity, refreshed from the backend when configured
    Whoami,

    /// List a collection
    List {
        collection: CollectionArg,

        /// Only show the first N records
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Publish a post
    Post { text: String },

    /// Comment on a post
    Comment {
        /// Id of the post
        post_id: String,
        text: String,
    },

    /// Send a community chat message
    Chat { text: String },

    /// Like a record as the signed-in identity
    Like { collection: CollectionArg, id: String },

    /// Remove a like
    Unlike { collection: CollectionArg, id: String },

    /// Hide a record from every view
    Hide { collection: CollectionArg, id: String },

    /// Replace a record's text
    Edit {
        collection: CollectionArg,
        id: String,
        text: String,
    },

    /// Delete a record, applying the delete policy to its children
    Delete { collection: CollectionArg, id: String },

    /// Support chat
    Support {
        #[command(subcommand)]
        action: SupportAction,
    },

    /// Change the signed-in identity's name or avatar everywhere
    Rename {
        #[arg(long)]
        name: Option<String>,

        #[arg(long)]
        avatar: Option<String>,
    },

    /// Reconcile every collection and push pending writes
    Sync,

    /// Free local storage and report what was removed
    Evict,

    /// Follow realtime changes until interrupted
    Watch,
}

#[derive(Subcommand)]
enum SupportAction {
    /// Send a message; staff must name the conversation
    Send {
        text: String,

        /// Conversation to answer (staff only)
        #[arg(long)]
        to: Option<String>,
    },

    /// List conversations with unread counts
    Inbox,

    /// Open a conversation as staff, marking it read
    Open { conversation: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "murmur=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let app = app::App::open(&cli.global).await?;

    let result = match cli.command {
        Commands::Login { id, name, role } => commands::login(&app, id, name, &role),
        Commands::Logout => commands::logout(&app),
        Commands::Whoami => commands::whoami(&app).await,
        Commands::List { collection, limit } => {
            commands::list(&app, collection.into(), limit).await
        }
        Commands::Post { text } => commands::post(&app, text),
        Commands::Comment { post_id, text } => commands::comment(&app, &post_id, text).await,
        Commands::Chat { text } => commands::chat(&app, text),
        Commands::Like { collection, id } => {
            commands::like(&app, collection.into(), &id, true).await
        }
        Commands::Unlike { collection, id } => {
            commands::like(&app, collection.into(), &id, false).await
        }
        Commands::Hide { collection, id } => commands::hide(&app, collection.into(), &id).await,
        Commands::Edit {
            collection,
            id,
            text,
        } => commands::edit(&app, collection.into(), &id, text).await,
        Commands::Delete { collection, id } => {
            commands::delete(&app, collection.into(), &id).await
        }
        Commands::Support { action } => match action {
            SupportAction::Send { text, to } => commands::support_send(&app, text, to).await,
            SupportAction::Inbox => commands::support_inbox(&app).await,
            SupportAction::Open { conversation } => {
                commands::support_open(&app, &conversation).await
            }
        },
        Commands::Rename { name, avatar } => commands::rename(&app, name, avatar),
        Commands::Sync => commands::sync(&app).await,
        Commands::Evict => commands::evict(&app),
        Commands::Watch => watch::run(&app).await,
    };

    // Push what can be pushed and persist, even after a failed command
    app.finish().await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bool_env() {
        assert_eq!(parse_bool_env("YES"), Ok(true));
        assert_eq!(parse_bool_env(""), Ok(false));
        assert!(parse_bool_env("maybe").is_err());
    }

    #[test]
    fn test_cli_parses_global_flags_anywhere() {
        let cli = Cli::try_parse_from([
            "murmur",
            "--offline",
            "true",
            "comment",
            "42",
            "nice post",
            "--network",
            "mobile",
        ])
        .unwrap();
        assert!(cli.global.offline);
        assert_eq!(cli.global.network, murmur_cache::NetworkClass::Mobile);
        assert!(matches!(cli.command, Commands::Comment { ref post_id, .. } if post_id == "42"));
    }

    #[test]
    fn test_cli_rejects_unknown_collection() {
        assert!(Cli::try_parse_from(["murmur", "list", "stories"]).is_err());
    }
}
