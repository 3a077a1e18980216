use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use chat_sync::config::{FileConfig, Profile, SyncConfig, load_config};
use chat_sync::credential::{decode_claims, expires_at};
use chat_sync::frame::{Frame, kind};
use chat_sync::{
    ConnectionManager, ConnectionStatus, StaticCredentials, WebSocketTransport, extract_user_id,
    is_expired, websocket_url,
};

const TOKEN_ENV: &str = "CHAT_SYNC_TOKEN";

#[derive(Parser)]
#[command(name = "chat-sync")]
#[command(about = "Realtime chat sync client: reconnecting WebSocket with exactly-once delivery")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Directory holding chat-sync.toml (defaults to the current directory)
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    /// Configuration preset
    #[arg(long, global = true, value_enum)]
    profile: Option<Profile>,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and log every accepted event until Ctrl-C
    Listen(ListenArgs),

    /// Decode a bearer token and print its claims
    Token(TokenArgs),

    /// Print the realtime URL derived from the configured server
    Url,
}

#[derive(Parser)]
struct ListenArgs {
    /// Bearer token (falls back to $CHAT_SYNC_TOKEN)
    #[arg(short, long)]
    token: Option<String>,

    /// Only log these event kinds (default: all)
    #[arg(short, long)]
    kind: Vec<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[derive(Parser)]
struct TokenArgs {
    token: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_dir = cli.config_dir.unwrap_or_else(|| PathBuf::from("."));

    let file_config: FileConfig = load_config(&config_dir, cli.profile.as_ref())
        .extract()
        .context("Failed to load configuration")?;

    match cli.command {
        Commands::Listen(args) => listen(args, &file_config).await,
        Commands::Token(args) => token_command(&args.token),
        Commands::Url => {
            let url = websocket_url(&file_config.server.url, &file_config.server.path)?;
            println!("{url}");
            Ok(())
        }
    }
}

async fn listen(args: ListenArgs, file_config: &FileConfig) -> Result<()> {
    let default_directive = if args.debug {
        "chat_sync=debug,info"
    } else {
        "chat_sync=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    let config = SyncConfig::from_file(file_config).context("Invalid configuration")?;
    let token = args.token.or_else(|| std::env::var(TOKEN_ENV).ok());

    let mut dispatcher = config.dedup.dispatcher();
    let kinds: Vec<String> = if args.kind.is_empty() {
        kind::EVENTS.iter().map(|k| k.to_string()).collect()
    } else {
        args.kind
    };
    for k in kinds {
        dispatcher.on(k, |frame: &Frame| {
            info!(kind = %frame.kind, timestamp = %frame.timestamp, payload = %frame.payload, "event");
            Ok(())
        });
    }

    info!(url = %config.connection.url, "Starting chat-sync listener");

    let handle = ConnectionManager::spawn(
        config.connection.clone(),
        WebSocketTransport::new(config.connection.connect_timeout),
        Arc::new(StaticCredentials::new(token)),
        dispatcher,
    );
    if let Err(e) = handle.connect().await {
        if e.is_credential_failure() {
            warn!(code = e.error_code(), "pass --token or set {TOKEN_ENV}");
        }
        return Err(e).context("Failed to connect");
    }

    let mut watcher = handle.watch();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                handle.disconnect().await?;
                break;
            }
            snapshot = watcher.changed() => {
                let Some(snapshot) = snapshot else { break };
                let status = snapshot.status();
                info!(
                    status = status.label(),
                    attempts = snapshot.attempts,
                    max_attempts = snapshot.max_attempts,
                    "status"
                );
                if status == ConnectionStatus::Error {
                    warn!(state = %snapshot.state, "giving up");
                    break;
                }
            }
        }
    }

    let (dispatch, cache) = handle.stats().await?;
    info!(
        delivered = dispatch.delivered,
        duplicates = dispatch.duplicates,
        malformed = dispatch.malformed,
        handler_failures = dispatch.handler_failures,
        cached_keys = cache.total_processed,
        by_kind = ?cache.by_kind,
        "Final stats"
    );
    Ok(())
}

fn token_command(token: &str) -> Result<()> {
    let claims = decode_claims(token).context("Token has no decodable claims segment")?;
    let info = serde_json::json!({
        "user_id": extract_user_id(token),
        "expired": is_expired(token),
        "expires_at": expires_at(token).map(|t| t.to_rfc3339()),
        "claims": claims,
    });
    println!("{}", serde_json::to_string_pretty(&info)?);
    Ok(())
}
