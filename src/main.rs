//! routebox CLI entry point.

use clap::Parser;
use routebox::{Gateway, Options, VERSION};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "routebox")]
#[command(version = VERSION)]
#[command(about = "Userspace multi-protocol proxy/router runtime")]
struct Args {
    /// Path to configuration file (JSON or YAML)
    #[arg(short = 'c', long = "config", default_value = "config.json")]
    config: PathBuf,

    /// Working directory
    #[arg(short = 'd', long = "directory")]
    directory: Option<PathBuf>,

    /// Parse the configuration, then exit
    #[arg(long = "check")]
    check: bool,
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("routebox={}", level)));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if let Some(directory) = &args.directory {
        if let Err(err) = std::env::set_current_dir(directory) {
            eprintln!("enter directory {}: {}", directory.display(), err);
            std::process::exit(1);
        }
    }

    let content = match std::fs::read_to_string(&args.config) {
        Ok(content) => content,
        Err(err) => {
            eprintln!("read config {}: {}", args.config.display(), err);
            std::process::exit(1);
        }
    };
    let options = match Options::parse_str(&content) {
        Ok(options) => options,
        Err(err) => {
            eprintln!("parse config: {}", err);
            std::process::exit(1);
        }
    };

    init_logging(&options.log.level);
    info!("routebox v{}", VERSION);

    if args.check {
        info!("configuration OK");
        return;
    }

    let gateway = match Gateway::new(options) {
        Ok(gateway) => gateway,
        Err(err) => {
            error!("create service: {}", err);
            std::process::exit(1);
        }
    };
    if let Err(err) = gateway.start().await {
        error!("start service: {}", err);
        std::process::exit(1);
    }

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("wait for signal: {}", err);
    }
    info!("received shutdown signal");
    if let Err(err) = gateway.close().await {
        error!("close service: {}", err);
    }
}
