//! CLI entry point for the MCP bridge.

use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::Value;

use crate::bridge::{Bridge, ExecuteToolRequest};
use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};

/// MCP bridge CLI
#[derive(Parser, Debug)]
#[command(name = "mcp-bridge", version, about = "Bridge MCP tool servers to webhooks")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Connect configured servers and deliver events until interrupted
    Serve,
    /// Run one tool call and print the result
    Exec(ExecArgs),
    /// Connect configured servers and print their state
    Servers,
}

/// Arguments for `mcp-bridge exec`.
#[derive(Parser, Debug)]
pub struct ExecArgs {
    /// Server id from the server list
    pub server: String,

    /// Tool name
    pub tool: String,

    /// Tool arguments as a JSON object
    #[arg(short, long, default_value = "{}")]
    pub params: String,

    /// Timeout in milliseconds
    #[arg(short, long)]
    pub timeout: Option<u64>,
}

impl ExecArgs {
    fn into_request(self) -> Result<ExecuteToolRequest> {
        let parameters: Value = serde_json::from_str(&self.params)
            .map_err(|e| BridgeError::InvalidArgument(format!("--params: {e}")))?;
        if !parameters.is_object() {
            return Err(BridgeError::InvalidArgument(
                "--params must be a JSON object".into(),
            ));
        }
        let mut request = ExecuteToolRequest::new(self.server, self.tool, parameters);
        request.options.timeout = self.timeout;
        Ok(request)
    }
}

impl Cli {
    /// Parse CLI arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

/// Run the parsed command to completion.
pub async fn run(cli: Cli) -> Result<()> {
    let config = BridgeConfig::from_env()?;
    match cli.command {
        Commands::Serve => handle_serve(&config).await,
        Commands::Exec(args) => handle_exec(&config, args).await,
        Commands::Servers => handle_servers(&config).await,
    }
}

async fn handle_serve(config: &BridgeConfig) -> Result<()> {
    let bridge = Bridge::from_config(config).await?;
    let health = bridge.health().await;
    tracing::info!(
        connected_servers = health.connected_servers,
        active_webhooks = health.active_webhooks,
        "Serving; press Ctrl-C to stop"
    );

    tokio::signal::ctrl_c().await?;
    bridge.shutdown().await;
    Ok(())
}

async fn handle_exec(config: &BridgeConfig, args: ExecArgs) -> Result<()> {
    let request = args.into_request()?;
    let bridge = Bridge::from_config(config).await?;
    let outcome = bridge.execute_tool(request).await;
    bridge.shutdown().await;

    let execution = outcome?;
    print_json(&execution)?;
    if execution.success {
        Ok(())
    } else {
        Err(BridgeError::ToolExecution {
            tool_name: execution.tool,
            message: execution.error.unwrap_or_default(),
        })
    }
}

async fn handle_servers(config: &BridgeConfig) -> Result<()> {
    let bridge = Bridge::from_config(config).await?;
    let servers = bridge.list_servers().await;
    bridge.shutdown().await;
    print_json(&servers)
}

fn print_json(value: &impl Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
