use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::error;

use tailglot::config::{AppConfig, SettingsConfig, DEFAULT_CONFIG_FILE};
use tailglot::RunOptions;

/// Tail a game chat log and translate incoming messages.
#[derive(Parser, Debug)]
#[command(name = "tailglot", version, about)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Also translate lines typed on stdin (outgoing messages).
    #[arg(long)]
    stdin: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match AppConfig::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            tailglot::init_tracing(&SettingsConfig::default());
            error!(error = %e, path = %args.config.display(), "cannot start");
            return ExitCode::FAILURE;
        }
    };
    tailglot::init_tracing(&config.settings);

    let options = RunOptions {
        config_path: args.config,
        stdin: args.stdin,
    };
    match tailglot::run(config, options).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "startup failed");
            ExitCode::FAILURE
        }
    }
}
