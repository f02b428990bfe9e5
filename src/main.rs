//! wireup: assembly host entry point.
//!
//! Startup sequence:
//!   1. Load .env (if present)
//!   2. Load host config
//!   3. Resolve effective log level (CLI `-v` flags > env > config)
//!   4. Init logger once
//!   5. Register stock modules
//!   6. Load the document (extension or forced format) and assemble it
//!   7. Spawn Ctrl-C → shutdown signal watcher
//!   8. Run modules until they finish, or until shutdown plus the grace period

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use wireup::assembly::{Assembler, Registry, runner};
use wireup::config::{self, Overrides};
use wireup::error::AppError;
use wireup::logger::LogSettings;
use wireup::{document, logger, stock};

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), AppError> {
    // .env is optional.
    let _ = dotenvy::dotenv();

    let args = parse_cli_args();

    let config_path = args.config_path.as_deref().unwrap_or(Path::new(config::DEFAULT_CONFIG_PATH));
    let mut overrides = Overrides::from_env();
    if let Some(document) = &args.document {
        overrides.document = Some(document.display().to_string());
    }
    if let Some(format) = &args.format {
        overrides.document_format = Some(format.clone());
    }
    let config = config::load_from(config_path, &overrides)?;

    let effective_log_level = args.log_level.unwrap_or(config.log_level.as_str());
    logger::init(&LogSettings {
        filter: effective_log_level,
        from_cli: args.log_level.is_some(),
        file: config.log_file.as_deref(),
    })?;

    info!(
        config = %config_path.display(),
        document = %config.document.display(),
        document_format = ?config.document_format,
        configured_log_level = %config.log_level,
        effective_log_level = %effective_log_level,
        "config loaded"
    );

    let mut registry = Registry::new();
    stock::register(&mut registry);

    let doc = document::load_as(&config.document, config.document_format)?;
    let mut assembler = Assembler::new(Arc::new(registry));
    if let Some(timeout) = config.assemble_timeout {
        assembler = assembler.with_timeout(timeout);
    }
    let assembly = assembler.assemble(&doc).await?;
    info!(modules = ?assembly.names(), "modules assembled");

    if args.check || !config.run {
        info!("run disabled, exiting after assembly");
        return Ok(());
    }

    // Ctrl-C cancels the token every module watches.
    let shutdown = CancellationToken::new();
    let ctrlc_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl-c received, initiating shutdown");
            ctrlc_token.cancel();
        }
    });

    runner::run_with_grace(&assembly, shutdown, config.shutdown_grace).await?;
    info!("all modules stopped");
    Ok(())
}

struct CliArgs {
    log_level: Option<&'static str>,
    config_path: Option<PathBuf>,
    document: Option<PathBuf>,
    format: Option<String>,
    check: bool,
}

fn parse_cli_args() -> CliArgs {
    let mut verbosity = 0u8;
    let mut config_path = None;
    let mut document = None;
    let mut format = None;
    let mut check = false;

    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        if arg == "--" {
            break;
        }

        match arg.as_str() {
            "-h" | "--help" => {
                println!("Usage: wireup [OPTIONS]");
                println!();
                println!("Options:");
                println!("  -h, --help                 Print help");
                println!("  -f, --config <PATH>        Host configuration file (default: config/default.toml)");
                println!("  -d, --document <PATH>      Assembly document, overrides [engine].document");
                println!("      --format <FORMAT>      Document syntax: auto, toml or json");
                println!("      --check                Assemble, then exit without running modules");
                println!("  -v, -vv, -vvv              Increase logging verbosity");
                std::process::exit(0);
            }
            "-f" | "--config" => config_path = Some(path_arg(&arg, iter.next())),
            "-d" | "--document" => document = Some(path_arg(&arg, iter.next())),
            "--format" => match iter.next() {
                Some(value) => format = Some(value),
                None => {
                    eprintln!("error: --format requires a value");
                    std::process::exit(1);
                }
            },
            "--check" => check = true,
            "--verbose" => verbosity = verbosity.saturating_add(1),
            a if a.starts_with('-') && a.len() > 1 && a.chars().skip(1).all(|c| c == 'v') => {
                verbosity = verbosity.saturating_add((a.len() - 1) as u8);
            }
            other => eprintln!("warning: ignoring unknown argument {other}"),
        }
    }

    CliArgs { log_level: logger::verbosity_level(verbosity), config_path, document, format, check }
}

fn path_arg(flag: &str, value: Option<String>) -> PathBuf {
    match value {
        Some(path) => PathBuf::from(path),
        None => {
            eprintln!("error: {flag} requires a path argument");
            std::process::exit(1);
        }
    }
}
