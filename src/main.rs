//! trojan-client — a TLS-tunneled SOCKS5 circumvention proxy client.
//!
//! Reads a TOML configuration file and runs either the SOCKS5 local
//! listener (`run`) or the NAT-mode UDP forwarder (`nat`), per spec.md §3/§7.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use trojan_client::config::Config;
use trojan_client::listener;

const VERSION: &str = env!("CARGO_PKG_VERSION");
const BUILD_DATE: &str = env!("BUILD_DATE");
const GIT_HASH: &str = env!("GIT_HASH");

#[derive(Parser)]
#[command(name = "trojan-client")]
#[command(version = VERSION)]
#[command(about = "TLS-tunneled SOCKS5 circumvention proxy client", long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", default_value = "config.toml", global = true)]
    config: PathBuf,

    /// Enable verbose logging (-v info, -vv debug, -vvv trace, -vvvv all modules trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the SOCKS5 local listener
    Run,
    /// Run the NAT-mode UDP forwarder to a fixed target
    Nat,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    log::info!("trojan-client {VERSION} ({GIT_HASH}, built {BUILD_DATE})");

    let config = Config::load(&cli.config)
        .with_context(|| format!("failed to load configuration file {}", cli.config.display()))?;

    match cli.command {
        Commands::Run => listener::run_socks5(config).await,
        Commands::Nat => listener::run_nat(config).await,
    }
}

fn init_logging(verbose: u8) {
    let log_level = match verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        3 => log::LevelFilter::Trace,
        _ => log::LevelFilter::Trace,
    };

    let mut logger = env_logger::Builder::from_default_env();

    if verbose >= 4 {
        logger.filter_level(log::LevelFilter::Trace);
    } else if verbose >= 3 {
        logger.filter_module("trojan_client", log::LevelFilter::Trace);
        logger.filter_level(log::LevelFilter::Debug);
    } else {
        logger.filter_level(log_level);
    }

    logger.format_timestamp_millis().format_module_path(true).init();
}
