use anyhow::Result;
use clap::{Parser, Subcommand};
use clawdbot::config::Config;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "clawdbot", about = "Trust & control core of the clawdbot gateway")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the WebSocket gateway.
    Gateway {
        /// Bind host override.
        #[arg(long)]
        host: Option<String>,
        /// Bind port override.
        #[arg(long)]
        port: Option<u16>,
    },
    /// Print the effective configuration and exit.
    Doctor,
}

#[tokio::main]
async fn main() -> Result<()> {
    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let mut config = Config::load()?;

    match cli.command {
        Command::Gateway { host, port } => {
            if let Some(host) = host {
                config.gateway.host = host;
            }
            if let Some(port) = port {
                config.gateway.port = port;
            }
            clawdbot::gateway::run_gateway(&config).await
        }
        Command::Doctor => {
            println!("state dir: {}", config.state_dir.display());
            println!(
                "gateway:   {}:{} (public bind {})",
                config.gateway.host,
                config.gateway.port,
                if config.gateway.allow_public_bind {
                    "allowed"
                } else {
                    "refused"
                }
            );
            println!(
                "origins:   {}",
                if config.gateway.allowed_origins.is_empty() {
                    "local only".to_string()
                } else {
                    config.gateway.allowed_origins.join(", ")
                }
            );
            println!("mode:      {}", config.permissions.parsed_mode().as_str());
            println!(
                "sessions:  encryption {}",
                if config.session.encryption { "on" } else { "off" }
            );
            Ok(())
        }
    }
}
