//! Sessionwire CLI - probe servers and issue authenticated calls.
//!
//! This is the binary entry point. See the `sessionwire` library for the
//! session layer itself.

use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use sessionwire::{
    CallChannel, CallOptions, ClientConfig, SessionManager, SessionOptions, Strategy,
};
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "sessionwire")]
#[command(version)]
#[command(about = "Encrypted, resumable session transport client")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum StrategyArg {
    Ecdhe,
    Srp,
    Key,
}

#[derive(Subcommand)]
enum Commands {
    /// Check that a server answers, without authenticating
    Probe {
        /// URL to GET
        url: String,
        /// Timeout in seconds (defaults to the configured probe timeout)
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Authenticate and call a remote method
    Call {
        /// Server URL (defaults to the configured server)
        #[arg(long)]
        url: Option<String>,
        /// Method name
        #[arg(long)]
        method: String,
        /// JSON parameters
        #[arg(long, default_value = "{}")]
        params: String,
        /// Key agreement to use
        #[arg(long, value_enum, default_value = "ecdhe")]
        strategy: StrategyArg,
        /// SRP identity
        #[arg(long)]
        username: Option<String>,
        /// Environment variable holding the SRP password
        #[arg(long, default_value = "SESSIONWIRE_PASSWORD")]
        password_env: String,
        /// Identifier of the pre-shared key
        #[arg(long)]
        key_id: Option<String>,
        /// Environment variable holding the base64 pre-shared key
        #[arg(long, default_value = "SESSIONWIRE_KEY")]
        key_env: String,
        /// Send over the shared WebSocket instead of HTTP
        #[arg(long)]
        websocket: bool,
        /// Send unkeyed, without authenticating
        #[arg(long)]
        plain: bool,
    },
}

fn read_env(name: &str) -> Result<String> {
    std::env::var(name).with_context(|| format!("environment variable {name} is not set"))
}

fn build_strategy(
    strategy: StrategyArg,
    username: Option<String>,
    password_env: &str,
    key_id: Option<String>,
    key_env: &str,
) -> Result<Strategy> {
    use base64::{engine::general_purpose::STANDARD, Engine};

    Ok(match strategy {
        StrategyArg::Ecdhe => Strategy::Ecdhe,
        StrategyArg::Srp => Strategy::Srp {
            username: username.context("--username is required for srp")?,
            password: read_env(password_env)?,
            mixer: None,
        },
        StrategyArg::Key => Strategy::Key {
            key_id: key_id.context("--key-id is required for key")?,
            key: STANDARD
                .decode(read_env(key_env)?.trim())
                .context("pre-shared key is not valid base64")?,
        },
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();

    let cli = Cli::parse();
    let config = ClientConfig::load()?;
    let manager = SessionManager::new(config)?;

    match cli.command {
        Commands::Probe { url, timeout } => {
            let result = manager
                .probe(&url, timeout.map(Duration::from_secs))
                .await?;
            println!(
                "{} -> HTTP {} in {} ms",
                url,
                result.status,
                result.latency.as_millis()
            );
        }
        Commands::Call {
            url,
            method,
            params,
            strategy,
            username,
            password_env,
            key_id,
            key_env,
            websocket,
            plain,
        } => {
            let params: serde_json::Value =
                serde_json::from_str(&params).context("--params is not valid JSON")?;

            let result = if plain {
                manager.send_plain(url.as_deref(), &method, params).await?
            } else {
                let strategy = build_strategy(strategy, username, &password_env, key_id, &key_env)?;
                let mut options = SessionOptions::new(strategy);
                options.server_url = url;
                let session = manager.create_session(options).await?;

                let cancel = CancellationToken::new();
                let ctrl_c = cancel.clone();
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        ctrl_c.cancel();
                    }
                });

                let call_options = CallOptions {
                    channel: if websocket {
                        CallChannel::WebSocket
                    } else {
                        CallChannel::Http
                    },
                    ..CallOptions::default()
                };
                let result = session.send(&method, params, call_options, &cancel).await;
                session.disconnect();
                result?
            };
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
    }

    manager.shutdown();
    Ok(())
}
