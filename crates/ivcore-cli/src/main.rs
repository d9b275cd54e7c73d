//! `ivcore-cli` – ivcore Command Line Interface
//!
//! This binary is the operator entry point for the IV-sweep control core.  It:
//!
//! 1. Checks for `~/.ivcore/config.toml`; runs a **First-Run Wizard** when the
//!    file is absent and the interactive shell was requested.
//! 2. Builds one [`InstrumentService`] from the effective configuration.
//! 3. Either drops the user into an **interactive REPL** (`ivcore`), runs a
//!    protocol file once (`ivcore run <protocol>`), lists protocol files
//!    (`ivcore list`) or prints the protocol JSON schema (`ivcore schema`).
//! 4. Intercepts **Ctrl-C** to abort the run manager, which stops the live
//!    monitor and disables idle outputs; a running sweep switches its own
//!    output off at its next abort check.

mod config;
mod repl;

use clap::{Parser, Subcommand};
use colored::Colorize;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use tracing::{info, warn};

use ivcore_hal::sim::SimRelayBoard;
use ivcore_runtime::engine::{LED_BOARD, PIXEL_BOARD};
use ivcore_runtime::protocol::{action_schema, document_schema};
use ivcore_runtime::{InstrumentService, init_tracing};

/// Relays on each simulated board.
const SIM_RELAY_CHANNELS: u32 = 8;

#[derive(Debug, Parser)]
#[command(name = "ivcore", version, about = "Source-measure unit IV-sweep control")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a protocol file once and exit (status 1 unless it completed).
    Run {
        /// Protocol id: path under the protocols directory without extension.
        protocol: String,
        /// Use simulated instruments and relay boards.
        #[arg(long)]
        mock: bool,
        /// Print the full result as JSON.
        #[arg(long)]
        json: bool,
    },
    /// List protocol files.
    List,
    /// Print the JSON schema of the protocol file format.
    Schema {
        /// Schema of the typed `{action, params}` set instead of the document.
        #[arg(long)]
        actions: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // RUST_LOG filters (default "info"); IVCORE_LOG_FORMAT=json switches to
    // newline-delimited JSON.  User-facing output still uses println!.
    let _telemetry = init_tracing("ivcore");

    match cli.command {
        Some(Command::Schema { actions }) => print_schema(actions),
        Some(Command::List) => {
            let Some(service) = build_service(load_config(), false) else {
                return ExitCode::FAILURE;
            };
            repl::print_protocols(&service);
            ExitCode::SUCCESS
        }
        Some(Command::Run { protocol, mock, json }) => run_once(&protocol, mock, json),
        None => interactive(),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Modes
// ─────────────────────────────────────────────────────────────────────────────

fn interactive() -> ExitCode {
    print_banner();

    match config::load() {
        Ok(None) => run_first_run_wizard(),
        Ok(Some(_)) => {
            println!(
                "  Config loaded from {}",
                config::config_path().display().to_string().bold()
            );
        }
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            println!("  Using default configuration.");
        }
    }

    let cfg = load_config();
    let Some(service) = build_service(cfg.clone(), false) else {
        return ExitCode::FAILURE;
    };
    install_abort_handler(&service);

    println!(
        "  Instrument: {} ({}){}",
        cfg.smu_address.bold(),
        cfg.smu_type,
        if cfg.mock { " [mock]".yellow().to_string() } else { String::new() }
    );
    println!("  Protocols : {}", cfg.protocols_dir.display().to_string().dimmed());
    println!();
    println!("  Type {} for a list of commands.\n", "/help".bold().cyan());

    let shutdown = Arc::new(AtomicBool::new(false));
    repl::run(service, cfg, shutdown);
    ExitCode::SUCCESS
}

fn run_once(protocol: &str, mock: bool, json: bool) -> ExitCode {
    let Some(service) = build_service(load_config(), mock) else {
        return ExitCode::FAILURE;
    };
    install_abort_handler(&service);

    info!(protocol, mock, "running protocol");
    let resp = service.run_protocol_file(protocol);
    let Some(result) = resp.data else {
        eprintln!("{}: {}", "Error".red(), resp.message);
        return ExitCode::FAILURE;
    };

    if json {
        match serde_json::to_string_pretty(&result) {
            Ok(text) => println!("{text}"),
            Err(e) => eprintln!("{}: {}", "Failed to serialise result".red(), e),
        }
    } else {
        repl::print_protocol_result(&result);
    }
    if result.success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn print_schema(actions: bool) -> ExitCode {
    let text = if actions {
        serde_json::to_string_pretty(&action_schema())
    } else {
        serde_json::to_string_pretty(&document_schema())
    };
    match text {
        Ok(text) => {
            println!("{text}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("{}: {}", "Failed to render schema".red(), e);
            ExitCode::FAILURE
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Wiring
// ─────────────────────────────────────────────────────────────────────────────

fn load_config() -> config::Config {
    config::effective().unwrap_or_else(|e| {
        warn!(error = %e, "config unreadable; using defaults");
        config::Config::default()
    })
}

fn build_service(mut cfg: config::Config, force_mock: bool) -> Option<Arc<InstrumentService>> {
    cfg.mock |= force_mock;
    let options = match cfg.service_options() {
        Ok(o) => o,
        Err(e) => {
            eprintln!("{}: {}", "Invalid configuration".red(), e);
            return None;
        }
    };
    let service = InstrumentService::new(options);
    if cfg.mock {
        // No relay hardware driver ships with the CLI; mock runs get
        // simulated boards so relay steps execute.
        service.register_board(PIXEL_BOARD, Box::new(SimRelayBoard::new(PIXEL_BOARD, SIM_RELAY_CHANNELS)));
        service.register_board(LED_BOARD, Box::new(SimRelayBoard::new(LED_BOARD, SIM_RELAY_CHANNELS)));
    }
    Some(Arc::new(service))
}

fn install_abort_handler(service: &Arc<InstrumentService>) {
    let service = service.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – aborting …".yellow().bold());
        let resp = service.abort();
        if resp.success {
            println!("{}", "  ✓ Abort sent, run manager back to IDLE.".green());
            println!("    {}", resp.message.dimmed());
        } else {
            println!("  {} {}", "✗".red(), resp.message);
        }
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; Ctrl-C will not abort runs");
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// First-Run Wizard
// ─────────────────────────────────────────────────────────────────────────────

fn run_first_run_wizard() {
    println!();
    println!("{}", "  ╔══════════════════════════════════════╗".bold().cyan());
    println!("{}", "  ║       ivcore First-Run Wizard        ║".bold().cyan());
    println!("{}", "  ╚══════════════════════════════════════╝".bold().cyan());
    println!();
    println!("  No configuration found.  Let's set up ivcore.\n");

    let mut cfg = config::Config::default();

    println!("  How is the SMU reached?");
    println!("    1) Simulated instrument  (default, no hardware)");
    println!("    2) LAN (raw-socket SCPI)");
    let choice = prompt_line("  Enter choice [1]: ", "1");
    if choice.trim() == "2" {
        cfg.mock = false;
        cfg.smu_address = prompt_line(
            "  Instrument address [TCPIP0::192.168.1.50::INSTR]: ",
            "TCPIP0::192.168.1.50::INSTR",
        );
        let tag = prompt_line("  SMU type (auto, keysight_b2901, keysight_b2902, keithley_2400) [auto]: ", "auto");
        match ivcore_hal::SmuType::parse_tag(&tag) {
            Ok(_) => cfg.smu_type = tag.to_lowercase(),
            Err(e) => println!("  {} {} – keeping auto", "Warning:".yellow(), e),
        }
    }

    let ch = prompt_line(
        &format!("  Default channel [{}]: ", cfg.default_channel),
        &cfg.default_channel.to_string(),
    );
    if let Ok(c) = ch.trim().parse::<u8>()
        && c >= 1
    {
        cfg.default_channel = c;
    }

    let dir = prompt_line(
        &format!("  Protocols directory [{}]: ", cfg.protocols_dir.display()),
        &cfg.protocols_dir.display().to_string(),
    );
    cfg.protocols_dir = dir.into();

    match config::save(&cfg) {
        Ok(()) => println!(
            "\n  {} Config saved to {}\n",
            "✓".green().bold(),
            config::config_path().display().to_string().bold()
        ),
        Err(e) => println!("{}: {}", "Error saving config".red(), e),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("{}", r#"   _                        "#.bold().cyan());
    println!("{}", r#"  (_)  __ __  __  ___  _ _  ___ "#.bold().cyan());
    println!("{}", r#"  | |  \ V / / _|/ _ \| '_|/ -_)"#.bold().cyan());
    println!("{}", r#"  |_|   \_/  \__|\___/|_|  \___|"#.bold().cyan());
    println!();
    println!(
        "  {} {}",
        "ivcore".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Source-measure unit IV-sweep control");
    println!();
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

fn prompt_line(msg: &str, default: &str) -> String {
    use std::io::{BufRead, Write};
    print!("{}", msg);
    std::io::stdout().flush().ok();
    let mut line = String::new();
    match std::io::stdin().lock().read_line(&mut line) {
        Ok(_) => {
            let t = line.trim().to_string();
            if t.is_empty() { default.to_string() } else { t }
        }
        Err(_) => default.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_run_subcommand() {
        let cli = Cli::try_parse_from(["ivcore", "run", "dark_iv", "--mock"]).unwrap();
        match cli.command {
            Some(Command::Run { protocol, mock, json }) => {
                assert_eq!(protocol, "dark_iv");
                assert!(mock);
                assert!(!json);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn no_subcommand_means_repl() {
        assert!(Cli::try_parse_from(["ivcore"]).unwrap().command.is_none());
        assert!(Cli::try_parse_from(["ivcore", "run"]).is_err());
    }

    #[test]
    fn mock_service_gets_simulated_boards() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config::Config {
            mock: false,
            protocols_dir: dir.path().to_path_buf(),
            ..config::Config::default()
        };
        let service = build_service(cfg.clone(), true).unwrap();
        assert_eq!(service.engine().board_names(), vec![LED_BOARD.to_string(), PIXEL_BOARD.to_string()]);

        let service = build_service(cfg, false).unwrap();
        assert!(service.engine().board_names().is_empty());
    }
}
