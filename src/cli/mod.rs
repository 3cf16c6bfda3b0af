//! Thin command-line surface over the gateway. Exit codes: 0 on success,
//! 1 on handled failure (including an unreachable gateway), 2 on usage
//! errors (from clap).

use crate::config::{config_path, load_config, save_config, Config};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;
use tokio_tungstenite::tungstenite::Message;

#[derive(Parser)]
#[command(name = "moonbot", version, about = "Local-first agent runtime")]
pub struct Cli {
    /// Emit machine-readable JSON instead of human-oriented output.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Gateway lifecycle.
    Gateway {
        #[command(subcommand)]
        command: GatewayCommand,
    },
    /// Call an arbitrary gateway method.
    Call {
        method: String,
        /// Params as a JSON object.
        params: Option<String>,
        /// Response timeout in milliseconds.
        #[arg(long, default_value_t = 30_000)]
        timeout: u64,
    },
    /// Pending approval management.
    Approvals {
        #[command(subcommand)]
        command: ApprovalsCommand,
    },
    /// Configuration management.
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Subcommand)]
enum GatewayCommand {
    /// Run the gateway in the foreground.
    Start {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
    /// Query a running gateway for status.
    Status,
}

#[derive(Subcommand)]
enum ApprovalsCommand {
    List,
    Approve { request_id: String },
    Deny { request_id: String },
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Print the config file location.
    Path,
    /// Print the effective configuration.
    Export,
    /// Replace the configuration from a JSON file.
    Import { file: PathBuf },
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(None)?;

    match cli.command {
        Command::Gateway { command } => match command {
            GatewayCommand::Start { host, port } => {
                let mut config = config;
                if let Some(host) = host {
                    config.gateway.host = host;
                }
                if let Some(port) = port {
                    config.gateway.port = port;
                }
                crate::server::run(config).await
            }
            GatewayCommand::Status => {
                let info = call(&config, "gateway.info", Value::Null, 10_000).await?;
                if cli.json {
                    println!("{}", serde_json::to_string(&info)?);
                } else {
                    println!(
                        "moonbot {} — up {}s, {} client(s), {} pending approval(s)",
                        info["version"].as_str().unwrap_or("?"),
                        info["uptimeSecs"],
                        info["clients"],
                        info["pendingApprovals"],
                    );
                }
                Ok(())
            }
        },
        Command::Call {
            method,
            params,
            timeout,
        } => {
            let params = match params {
                Some(raw) => serde_json::from_str(&raw).context("params must be valid JSON")?,
                None => Value::Null,
            };
            let result = call(&config, &method, params, timeout).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
        Command::Approvals { command } => {
            let result = match command {
                ApprovalsCommand::List => {
                    let result = call(&config, "approval.list", Value::Null, 10_000).await?;
                    if cli.json {
                        println!("{}", serde_json::to_string(&result)?);
                    } else {
                        let requests = result["requests"].as_array().cloned().unwrap_or_default();
                        if requests.is_empty() {
                            println!("no pending approvals");
                        }
                        for request in requests {
                            println!(
                                "{}  {}  expires {}",
                                request["id"].as_str().unwrap_or("?"),
                                request["toolId"].as_str().unwrap_or("?"),
                                request["expiresAt"].as_str().unwrap_or("?"),
                            );
                        }
                    }
                    return Ok(());
                }
                ApprovalsCommand::Approve { request_id } => {
                    call(
                        &config,
                        "approval.respond",
                        serde_json::json!({ "requestId": request_id, "approved": true }),
                        10_000,
                    )
                    .await?
                }
                ApprovalsCommand::Deny { request_id } => {
                    call(
                        &config,
                        "approval.respond",
                        serde_json::json!({ "requestId": request_id, "approved": false }),
                        10_000,
                    )
                    .await?
                }
            };
            println!("{}", serde_json::to_string(&result)?);
            Ok(())
        }
        Command::Config { command } => match command {
            ConfigCommand::Path => {
                println!("{}", config_path()?.display());
                Ok(())
            }
            ConfigCommand::Export => {
                println!("{}", serde_json::to_string_pretty(&config)?);
                Ok(())
            }
            ConfigCommand::Import { file } => {
                let content = std::fs::read_to_string(&file)
                    .with_context(|| format!("failed to read {}", file.display()))?;
                let imported: Config =
                    serde_json::from_str(&content).context("invalid config JSON")?;
                imported.validate()?;
                save_config(&imported, None)?;
                println!("configuration imported");
                Ok(())
            }
        },
    }
}

/// One-shot JSON-RPC call over a fresh WebSocket connection: handshake with
/// `connect`, then the requested method.
async fn call(config: &Config, method: &str, params: Value, timeout_ms: u64) -> Result<Value> {
    let url = format!("ws://{}:{}/", config.gateway.host, config.gateway.port);
    let (stream, _) = tokio_tungstenite::connect_async(url.as_str())
        .await
        .with_context(|| format!("gateway unreachable at {}", url))?;
    let (mut write, mut read) = stream.split();
    let timeout = Duration::from_millis(timeout_ms);

    let token = std::env::var("MOONBOT_GATEWAY_TOKEN").ok();
    let connect_params = serde_json::json!({
        "clientType": "cli",
        "version": crate::VERSION,
        "token": token,
    });
    rpc(&mut write, &mut read, 1, "connect", connect_params, timeout).await?;
    rpc(&mut write, &mut read, 2, method, params, timeout).await
}

async fn rpc<W, R>(
    write: &mut W,
    read: &mut R,
    id: u64,
    method: &str,
    params: Value,
    timeout: Duration,
) -> Result<Value>
where
    W: SinkExt<Message> + Unpin,
    W::Error: std::error::Error + Send + Sync + 'static,
    R: StreamExt<Item = std::result::Result<Message, tokio_tungstenite::tungstenite::Error>>
        + Unpin,
{
    let frame = serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": method,
        "params": params,
    });
    write
        .send(Message::text(frame.to_string()))
        .await
        .context("failed to send request")?;

    // Skip interleaved notifications until our id comes back.
    loop {
        let next = tokio::time::timeout(timeout, read.next())
            .await
            .context("timed out waiting for gateway response")?;
        let message = next.context("connection closed")??;
        if !message.is_text() {
            continue;
        }
        let text = message.into_text()?;
        let parsed: Value = serde_json::from_str(text.as_str())
            .context("gateway sent invalid JSON")?;
        if parsed.get("id").and_then(Value::as_u64) != Some(id) {
            continue;
        }
        if let Some(error) = parsed.get("error") {
            anyhow::bail!(
                "{} ({})",
                error["message"].as_str().unwrap_or("gateway error"),
                error["data"]["code"].as_str().unwrap_or("UNKNOWN"),
            );
        }
        return Ok(parsed["result"].clone());
    }
}
