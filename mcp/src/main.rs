use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use netdash_mcp_runtime::{McpCommands, RuntimeOptions, run as run_mcp};

#[derive(Parser)]
#[command(
    name = "netdash-mcp",
    version,
    about = "netdash MCP server: the dashboard API as schema-validated tools over stdio"
)]
struct Cli {
    /// Dashboard API base URL (overrides api.base_url from the config file)
    #[arg(long, env = "NETDASH_API_URL")]
    api_url: Option<String>,

    /// Configuration file (default: <config dir>/netdash/config.json)
    #[arg(long, env = "NETDASH_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: McpCommands,
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();

    // stdout carries the MCP stream, so logs go to stderr.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "netdash_mcp_runtime=info,netdash_mcp=info".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr),
        )
        .init();

    let cli = Cli::parse();
    let options = RuntimeOptions {
        api_url: cli.api_url,
        config_path: cli.config,
    };
    let code = run_mcp(options, cli.command).await;
    std::process::exit(code);
}
