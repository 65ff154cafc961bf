use anyhow::Result;
use clap::{Parser, Subcommand};
use sandpreview::config::Config;
use sandpreview::gateway::{self, AppState};
use tracing_subscriber::{fmt, fmt::time::ChronoLocal, EnvFilter};

/// Chat with an AI assistant and preview the generated app in a cloud sandbox.
#[derive(Parser, Debug)]
#[command(name = "sandpreview", version, about, long_about = None)]
struct Cli {
    /// Path to config.toml (default: ~/.sandpreview/config.toml)
    #[arg(long, global = true)]
    config: Option<String>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP gateway and web UI
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
    /// Chat in the terminal
    Chat,
    /// Inspect configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the JSON Schema of the config file
    Schema,
    /// Print the effective config with secrets redacted
    Show,
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    fmt()
        .with_env_filter(filter)
        .with_timer(ChronoLocal::rfc_3339())
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref())?;

    // Keep the terminal chat quiet unless asked otherwise.
    let default_level = match cli.command {
        Commands::Chat => "warn",
        _ => "info",
    };
    let level = cli
        .log_level
        .clone()
        .or_else(|| config.log_level.clone())
        .unwrap_or_else(|| default_level.to_string());
    init_tracing(&level);

    match cli.command {
        Commands::Serve { host, port } => {
            if let Some(host) = host {
                config.gateway.host = host;
            }
            if let Some(port) = port {
                config.gateway.port = port;
            }
            let state = AppState::from_config(config)?;
            gateway::run_gateway(state).await
        }
        Commands::Chat => sandpreview::repl::run(config).await,
        Commands::Config { action } => {
            match action {
                ConfigAction::Schema => {
                    println!("{}", serde_json::to_string_pretty(&Config::json_schema())?);
                }
                ConfigAction::Show => print!("{}", config.redacted().to_toml()?),
            }
            Ok(())
        }
    }
}
