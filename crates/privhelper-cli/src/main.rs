//! privhelper - install, remove and talk to the privileged helper.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod commands;

use commands::exit_codes;

/// privhelper - privileged helper lifecycle manager
#[derive(Parser, Debug)]
#[command(name = "privhelper")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "privhelper.toml", env = "PRIVHELPER_CONFIG")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,

    /// Per-request deadline in milliseconds (overrides `client.request_timeout_ms`)
    #[arg(long)]
    request_timeout_ms: Option<u64>,

    /// Machine-readable output
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Install (bless) the helper
    Install {
        /// Fail instead of prompting for consent
        #[arg(long)]
        non_interactive: bool,
    },

    /// Stop the helper and remove its artifacts
    Uninstall {
        /// Fail instead of prompting for consent
        #[arg(long)]
        non_interactive: bool,
    },

    /// Show the installed state derived from disk
    Status,

    /// Ask the running helper for its version
    Version,

    /// Run the helper's privileged operation
    Exec {
        /// Payload passed to the operation
        #[arg(long, default_value = "")]
        payload: String,
    },

    /// Check the helper bundle before installing
    Check,
}

fn main() {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let exit_code = run(&cli);
    std::process::exit(i32::from(exit_code));
}

fn run(cli: &Cli) -> u8 {
    let config = match commands::load_config(&cli.config, cli.request_timeout_ms) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e:#}");
            return exit_codes::USAGE;
        },
    };
    let out = commands::Output::new(cli.json);

    match &cli.command {
        Commands::Install { non_interactive } => {
            commands::lifecycle::install(&config, !non_interactive, out)
        },
        Commands::Uninstall { non_interactive } => {
            commands::lifecycle::uninstall(&config, !non_interactive, out)
        },
        Commands::Status => commands::lifecycle::status(&config, out),
        Commands::Version => commands::helper::version(&config, out),
        Commands::Exec { payload } => commands::helper::exec(&config, payload, out),
        Commands::Check => commands::check::run(&config, out),
    }
}
