//! graceful - Run blocking workloads until SIGINT/SIGTERM, then stop them cleanly
//!
//! Demonstrates the coordinator on an HTTP(S) server and on a plain
//! CPU-bound loop.

use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};

mod cmd;
mod config;

use config::Config;

#[derive(Parser)]
#[command(name = "graceful")]
#[command(about = "Run blocking workloads and shut them down gracefully on SIGINT/SIGTERM")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    /// Only log warnings and errors
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Config file path (default: ./graceful.toml or ~/.config/graceful/config.toml)
    #[arg(short, long, global = true)]
    config: Option<std::path::PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Serve "Hello World" over HTTP or HTTPS
    Serve(cmd::serve::ServeArgs),
    /// Print Fibonacci numbers until interrupted
    Fib(cmd::fib::FibArgs),
    /// Show current configuration
    Config,
}

fn load_config(path: Option<std::path::PathBuf>) -> Result<Config> {
    match path {
        Some(path) => Config::from_file(&path),
        None => Config::load(),
    }
}

fn show_config(config: &Config) {
    use comfy_table::{Cell, Color, Table, modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL};

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(vec![
            Cell::new("Setting").fg(Color::Cyan),
            Cell::new("Value").fg(Color::Cyan),
        ]);

    table.add_row(vec!["Listen address", &config.server.addr]);
    table.add_row(vec![
        "Handler delay",
        &format!("{}ms", config.server.delay_ms),
    ]);
    table.add_row(vec![
        "Read timeout",
        &config
            .server
            .read_timeout()
            .map_or_else(|| "none".to_string(), |t| format!("{}s", t.as_secs())),
    ]);
    table.add_row(vec![
        "TLS",
        match (&config.server.cert, &config.server.key) {
            (Some(_), Some(_)) => "configured",
            (None, None) => "off",
            _ => "incomplete",
        },
    ]);
    table.add_row(vec![
        "Shutdown timeout",
        &match config.shutdown.timeout_secs {
            0 => "unbounded".to_string(),
            secs => format!("{secs}s"),
        },
    ]);
    table.add_row(vec![
        "Force exit on repeat",
        if config.shutdown.force_exit_on_repeat {
            "yes"
        } else {
            "no"
        },
    ]);
    table.add_row(vec!["Fib step", &format!("{}ms", config.fib.step_ms)]);

    eprintln!("\n{table}");
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    graceful_core::init_logging(cli.quiet, cli.debug);

    let config = match load_config(cli.config) {
        Ok(c) => c,
        Err(e) => {
            log::error!("Configuration error: {e:#}");
            return ExitCode::from(cmd::EXIT_SHUTDOWN_FAILED);
        }
    };

    let result = match cli.command {
        Command::Serve(args) => cmd::serve::run(args, &config),
        Command::Fib(args) => cmd::fib::run(args, &config),
        Command::Config => {
            show_config(&config);
            Ok(cmd::EXIT_OK)
        }
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            log::error!("Fatal error: {e:#}");
            ExitCode::from(cmd::EXIT_SHUTDOWN_FAILED)
        }
    }
}
