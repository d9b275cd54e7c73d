//! REPL – Read-Eval-Print Loop for the ivcore interactive shell.
//!
//! Supported slash-commands:
//!   /connect [address] [type] [channel] – open the instrument
//!   /disconnect                         – close it
//!   /measure [channel]                  – one voltage/current reading
//!   /sweep <start> <stop> <points> [channel] – linear voltage sweep
//!   /run <protocol>                     – run a protocol file
//!   /abort                              – abort and disable all outputs
//!   /status                             – run state and instrument status
//!   /protocols                          – list protocol files
//!   /monitor start|stop|status          – live monitor on the default channel
//!   /settings                           – edit `~/.ivcore/config.toml`
//!   /help                               – show this list
//!   /quit | /exit                       – disable outputs and exit

use colored::Colorize;
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use ivcore_hal::{SweepRequest, sweep::SweepShape};
use ivcore_runtime::{InstrumentService, ProtocolResult, StopReason};
use ivcore_types::SweepResult;

use crate::config::{self, Config};

/// A parsed REPL line.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplCommand {
    Connect {
        address: Option<String>,
        smu_type: Option<String>,
        channel: Option<u8>,
    },
    Disconnect,
    Measure {
        channel: Option<u8>,
    },
    Sweep {
        start: f64,
        stop: f64,
        points: usize,
        channel: Option<u8>,
    },
    Run {
        protocol: String,
    },
    Abort,
    Status,
    Protocols,
    Monitor(MonitorCommand),
    Settings,
    Help,
    Quit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorCommand {
    Start,
    Stop,
    Status,
}

/// Parse one input line.  Errors carry the message shown to the user.
pub fn parse_command(line: &str) -> Result<ReplCommand, String> {
    let mut words = line.split_whitespace();
    let Some(head) = words.next() else {
        return Err("empty command".into());
    };
    let args: Vec<&str> = words.collect();

    let channel_at = |i: usize| -> Result<Option<u8>, String> {
        args.get(i)
            .map(|raw| {
                raw.parse::<u8>()
                    .ok()
                    .filter(|ch| *ch >= 1)
                    .ok_or_else(|| format!("'{raw}' is not a valid channel"))
            })
            .transpose()
    };
    let number = |i: usize, what: &str| -> Result<f64, String> {
        let raw = args.get(i).ok_or_else(|| format!("missing {what}"))?;
        raw.parse::<f64>().map_err(|_| format!("'{raw}' is not a valid {what}"))
    };
    let at_most = |n: usize| -> Result<(), String> {
        if args.len() > n {
            Err(format!("too many arguments for {head}"))
        } else {
            Ok(())
        }
    };

    match head {
        "/connect" => {
            at_most(3)?;
            Ok(ReplCommand::Connect {
                address: args.first().map(|s| s.to_string()),
                smu_type: args.get(1).map(|s| s.to_string()),
                channel: channel_at(2)?,
            })
        }
        "/disconnect" => at_most(0).map(|()| ReplCommand::Disconnect),
        "/measure" => {
            at_most(1)?;
            Ok(ReplCommand::Measure { channel: channel_at(0)? })
        }
        "/sweep" => {
            at_most(4)?;
            let start = number(0, "start voltage")?;
            let stop = number(1, "stop voltage")?;
            let raw_points = args.get(2).ok_or("missing point count")?;
            let points = raw_points
                .parse::<usize>()
                .ok()
                .filter(|p| *p >= 1)
                .ok_or_else(|| format!("'{raw_points}' is not a valid point count"))?;
            Ok(ReplCommand::Sweep {
                start,
                stop,
                points,
                channel: channel_at(3)?,
            })
        }
        "/run" => match args.as_slice() {
            [protocol] => Ok(ReplCommand::Run {
                protocol: protocol.to_string(),
            }),
            [] => Err("usage: /run <protocol>".into()),
            _ => Err(format!("too many arguments for {head}")),
        },
        "/abort" => at_most(0).map(|()| ReplCommand::Abort),
        "/status" => at_most(0).map(|()| ReplCommand::Status),
        "/protocols" => at_most(0).map(|()| ReplCommand::Protocols),
        "/monitor" => match args.as_slice() {
            ["start"] => Ok(ReplCommand::Monitor(MonitorCommand::Start)),
            ["stop"] => Ok(ReplCommand::Monitor(MonitorCommand::Stop)),
            ["status"] | [] => Ok(ReplCommand::Monitor(MonitorCommand::Status)),
            _ => Err("usage: /monitor start|stop|status".into()),
        },
        "/settings" => Ok(ReplCommand::Settings),
        "/help" => Ok(ReplCommand::Help),
        "/quit" | "/exit" => Ok(ReplCommand::Quit),
        other => Err(format!("Unknown command: '{other}'")),
    }
}

/// Entry point for the interactive REPL.
///
/// `shutdown` is polled each iteration; when set the REPL exits cleanly.
pub fn run(service: Arc<InstrumentService>, cfg: Config, shutdown: Arc<AtomicBool>) {
    let mut rl = match DefaultEditor::new() {
        Ok(rl) => rl,
        Err(e) => {
            eprintln!("{}: {}", "Terminal error".red(), e);
            return;
        }
    };
    let mut cfg = cfg;

    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }

        let line = match rl.readline("ivcore> ") {
            Ok(line) => line,
            Err(ReadlineError::Interrupted) => {
                println!("{}", "(Ctrl-C) type /quit to exit".dimmed());
                continue;
            }
            Err(ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("{}: {}", "Read error".red(), e);
                break;
            }
        };

        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        rl.add_history_entry(line).ok();

        match parse_command(line) {
            Ok(ReplCommand::Quit) => {
                service.disconnect();
                println!("{}", "Goodbye.".green());
                shutdown.store(true, Ordering::SeqCst);
                break;
            }
            Ok(ReplCommand::Settings) => cmd_settings(&mut rl, &mut cfg),
            Ok(cmd) => dispatch(&service, &cfg, cmd),
            Err(msg) => println!("{} Type {} for available commands.", msg.red(), "/help".bold()),
        }
    }
}

fn dispatch(service: &InstrumentService, cfg: &Config, cmd: ReplCommand) {
    let channel = |ch: Option<u8>| ch.unwrap_or(cfg.default_channel);
    match cmd {
        ReplCommand::Connect {
            address,
            smu_type,
            channel: ch,
        } => {
            let address = address.unwrap_or_else(|| cfg.smu_address.clone());
            let smu_type = smu_type.unwrap_or_else(|| cfg.smu_type.clone());
            let mock = cfg.mock || address.eq_ignore_ascii_case("mock");
            let resp = service.connect(&address, &smu_type, mock, channel(ch));
            report(resp.success, &resp.message);
        }
        ReplCommand::Disconnect => {
            let resp = service.disconnect();
            report(resp.success, &resp.message);
        }
        ReplCommand::Measure { channel: ch } => {
            let resp = service.measure(channel(ch));
            match resp.data {
                Some(r) => println!(
                    "  V = {}   I = {}",
                    fmt_value(r.voltage, "V").bold(),
                    fmt_value(r.current, "A").bold()
                ),
                None => report(false, &resp.message),
            }
        }
        ReplCommand::Sweep {
            start,
            stop,
            points,
            channel: ch,
        } => {
            let request = SweepRequest::new(SweepShape::linear(start, stop, points));
            println!("  Sweeping {start} V → {stop} V ({points} points). Ctrl-C aborts.");
            let resp = service.sweep(channel(ch), &request);
            match resp.data {
                Some(result) => print_sweep(&result),
                None => report(false, &resp.message),
            }
        }
        ReplCommand::Run { protocol } => {
            println!("  Running protocol {}. Ctrl-C aborts.", protocol.bold());
            let resp = service.run_protocol_file(&protocol);
            match resp.data {
                Some(result) => print_protocol_result(&result),
                None => report(false, &resp.message),
            }
        }
        ReplCommand::Abort => {
            let resp = service.abort();
            report(resp.success, &resp.message);
        }
        ReplCommand::Status => print_status(service),
        ReplCommand::Protocols => print_protocols(service),
        ReplCommand::Monitor(MonitorCommand::Start) => {
            let resp = service.monitor_configure(cfg.monitor_config());
            if !resp.success {
                report(false, &resp.message);
                return;
            }
            let resp = service.monitor_start();
            report(resp.success, &resp.message);
        }
        ReplCommand::Monitor(MonitorCommand::Stop) => {
            let resp = service.monitor_stop();
            report(resp.success, &resp.message);
        }
        ReplCommand::Monitor(MonitorCommand::Status) => {
            let status = service.monitor_status();
            println!(
                "  running: {}   samples: {}   buffered: {}   skipped: {}",
                status.running, status.measurement_count, status.buffer_size, status.skipped_ticks
            );
            if let Some(last) = status.last_value {
                println!(
                    "  last: V = {}   I = {}",
                    fmt_value(last.voltage, "V"),
                    fmt_value(last.current, "A")
                );
            }
            if let Some(err) = status.error {
                println!("  {} {}", "error:".red(), err);
            }
        }
        ReplCommand::Help => cmd_help(),
        ReplCommand::Settings | ReplCommand::Quit => {}
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Command handlers
// ─────────────────────────────────────────────────────────────────────────────

fn cmd_help() {
    println!();
    println!("{}", "ivcore Commands".bold().underline());
    let rows = [
        ("/connect [addr] [type] [ch]", "open the instrument (type: auto, keysight_b2902, ...)"),
        ("/disconnect", "disable outputs and close the instrument"),
        ("/measure [ch]", "single voltage/current reading"),
        ("/sweep <start> <stop> <n> [ch]", "linear voltage sweep"),
        ("/run <protocol>", "run a protocol file by id"),
        ("/abort", "abort the run and disable every output"),
        ("/status", "run state and instrument status"),
        ("/protocols", "list protocol files"),
        ("/monitor start|stop|status", "live monitor on the default channel"),
        ("/settings", "edit ~/.ivcore/config.toml"),
        ("/quit  /exit", "exit the CLI"),
    ];
    for (cmd, what) in rows {
        println!("  {:<32} {}", cmd.bold().cyan(), what);
    }
    println!();
}

fn cmd_settings(rl: &mut DefaultEditor, cfg: &mut Config) {
    println!("{}", "Settings Editor".bold().underline());
    println!("  (press Enter to keep the current value)");

    let mut edit = |label: &str, current: String| -> String {
        match rl.readline_with_initial(&format!("  {label:<18}: "), (&current, "")) {
            Ok(v) if !v.trim().is_empty() => v.trim().to_string(),
            _ => current,
        }
    };

    let mut next = cfg.clone();
    next.smu_address = edit("SMU address", next.smu_address.clone());
    next.smu_type = edit("SMU type", next.smu_type.clone());
    let mock = edit("Mock mode", next.mock.to_string());
    match config::parse_bool(&mock) {
        Some(v) => next.mock = v,
        None => println!("  {} '{}' is not a boolean, keeping {}", "Warning:".yellow(), mock, next.mock),
    }
    let ch = edit("Default channel", next.default_channel.to_string());
    match ch.parse::<u8>() {
        Ok(v) if v >= 1 => next.default_channel = v,
        _ => println!(
            "  {} '{}' is not a valid channel, keeping {}",
            "Warning:".yellow(),
            ch,
            next.default_channel
        ),
    }
    next.protocols_dir = edit("Protocols dir", next.protocols_dir.display().to_string()).into();
    next.data_dir = edit("Data dir", next.data_dir.display().to_string()).into();

    if let Err(e) = next.service_options() {
        println!("{}: {}", "Invalid settings".red(), e);
        return;
    }
    match config::save(&next) {
        Ok(()) => {
            println!(
                "{} {}",
                "✓ Settings saved to".green(),
                config::config_path().display().to_string().bold()
            );
            println!("  Address, type and channel apply to the next /connect; directories apply after restart.");
            *cfg = next;
        }
        Err(e) => println!("{}: {}", "Error saving config".red(), e),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Output
// ─────────────────────────────────────────────────────────────────────────────

fn report(success: bool, message: &str) {
    if success {
        println!("  {} {}", "✓".green().bold(), message);
    } else {
        println!("  {} {}", "✗".red().bold(), message.red());
    }
}

/// Format a reading component; `None` is an instrument overload.
pub(crate) fn fmt_value(value: Option<f64>, unit: &str) -> String {
    match value {
        Some(v) => format!("{v:.6e} {unit}"),
        None => "overload".to_string(),
    }
}

fn print_sweep(result: &SweepResult) {
    println!("  {:>14} {:>16} {:>16}", "set", "voltage", "current");
    for s in &result.results {
        println!(
            "  {:>14.6} {:>16} {:>16}",
            s.set_value,
            fmt_value(s.voltage, "V"),
            fmt_value(s.current, "A")
        );
    }
    if result.aborted {
        println!("  {} after {} point(s)", "ABORTED".yellow().bold(), result.results.len());
    } else {
        println!("  {} {} point(s)", "✓".green().bold(), result.results.len());
    }
}

pub(crate) fn print_protocol_result(result: &ProtocolResult) {
    let verdict = match result.stop_reason {
        StopReason::Completed => "COMPLETED".green().bold(),
        StopReason::Aborted => "ABORTED".yellow().bold(),
        StopReason::Failed => "FAILED".red().bold(),
    };
    println!(
        "  {} {}/{} step(s) in {:.0} ms",
        verdict, result.steps_completed, result.total_steps, result.duration_ms
    );
    if let Some(err) = &result.error {
        let at = result.failed_step.as_deref().unwrap_or("?");
        println!("  {} step {}: {}", "error at".red(), at, err);
    }
    if !result.captured_data.is_empty() {
        let names: Vec<&str> = result.captured_data.keys().map(String::as_str).collect();
        println!("  captured: {}", names.join(", "));
    }
}

fn print_status(service: &InstrumentService) {
    let status = service.get_status();
    println!("  run state     : {}", status.state.to_string().bold());
    if let Some(d) = status.run_duration {
        println!("  run duration  : {d:.1} s");
    }
    println!("  abort flag    : {}", status.abort_requested);
    println!("  protocol      : {}", if status.protocol_running { "running" } else { "idle" });
    match status.instrument {
        Some(inst) if inst.connected => {
            println!(
                "  instrument    : {} ({}{})",
                inst.address.unwrap_or_default().bold(),
                inst.smu_type.map(|t| t.to_string()).unwrap_or_else(|| "?".into()),
                if inst.mock { ", mock" } else { "" }
            );
            for ch in inst.channels {
                println!(
                    "    ch{} {:<10} output {:<3} {} {:.4} V / {:.4e} A",
                    ch.channel,
                    ch.state.to_string(),
                    if ch.output_enabled { "on" } else { "off" },
                    ch.source_mode,
                    ch.voltage,
                    ch.current
                );
            }
        }
        Some(_) => println!("  instrument    : {}", "not connected".dimmed()),
        None => println!("  instrument    : {}", "busy".yellow()),
    }
    println!("  monitor       : {}", if status.monitor.running { "running" } else { "stopped" });
}

pub(crate) fn print_protocols(service: &InstrumentService) {
    let list = service.list_protocols();
    if list.is_empty() {
        println!(
            "  No protocols found in {}",
            service.loader().dir().display().to_string().dimmed()
        );
        return;
    }
    for p in list {
        match p.error {
            Some(err) => println!("  {} {}", p.id.red(), err.dimmed()),
            None => println!(
                "  {:<28} {} ({} steps) {}",
                p.id.bold(),
                p.name,
                p.steps,
                p.description.dimmed()
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_connect_with_optional_arguments() {
        assert_eq!(
            parse_command("/connect").unwrap(),
            ReplCommand::Connect {
                address: None,
                smu_type: None,
                channel: None
            }
        );
        assert_eq!(
            parse_command("/connect TCPIP0::10.0.0.7::INSTR keysight_b2902 2").unwrap(),
            ReplCommand::Connect {
                address: Some("TCPIP0::10.0.0.7::INSTR".into()),
                smu_type: Some("keysight_b2902".into()),
                channel: Some(2)
            }
        );
        assert!(parse_command("/connect MOCK auto 0").is_err());
    }

    #[test]
    fn parses_sweep() {
        assert_eq!(
            parse_command("/sweep -0.5 1.5 21").unwrap(),
            ReplCommand::Sweep {
                start: -0.5,
                stop: 1.5,
                points: 21,
                channel: None
            }
        );
        assert_eq!(
            parse_command("  /sweep 0 1 5 2 ").unwrap(),
            ReplCommand::Sweep {
                start: 0.0,
                stop: 1.0,
                points: 5,
                channel: Some(2)
            }
        );
    }

    #[test]
    fn rejects_bad_sweep_arguments() {
        assert!(parse_command("/sweep 0 1").unwrap_err().contains("point count"));
        assert!(parse_command("/sweep zero 1 5").unwrap_err().contains("start voltage"));
        assert!(parse_command("/sweep 0 1 0").is_err());
        assert!(parse_command("/sweep 0 1 5 1 extra").unwrap_err().contains("too many"));
    }

    #[test]
    fn parses_simple_commands() {
        assert_eq!(parse_command("/measure").unwrap(), ReplCommand::Measure { channel: None });
        assert_eq!(parse_command("/measure 2").unwrap(), ReplCommand::Measure { channel: Some(2) });
        assert_eq!(parse_command("/abort").unwrap(), ReplCommand::Abort);
        assert_eq!(parse_command("/status").unwrap(), ReplCommand::Status);
        assert_eq!(parse_command("/protocols").unwrap(), ReplCommand::Protocols);
        assert_eq!(parse_command("/exit").unwrap(), ReplCommand::Quit);
        assert_eq!(
            parse_command("/monitor").unwrap(),
            ReplCommand::Monitor(MonitorCommand::Status)
        );
        assert_eq!(
            parse_command("/monitor stop").unwrap(),
            ReplCommand::Monitor(MonitorCommand::Stop)
        );
        assert!(parse_command("/disconnect now").is_err());
    }

    #[test]
    fn run_requires_exactly_one_protocol() {
        assert_eq!(
            parse_command("/run users/alice/dark_iv").unwrap(),
            ReplCommand::Run {
                protocol: "users/alice/dark_iv".into()
            }
        );
        assert!(parse_command("/run").is_err());
        assert!(parse_command("/run a b").is_err());
    }

    #[test]
    fn unknown_commands_are_reported() {
        assert!(parse_command("/frobnicate").unwrap_err().contains("/frobnicate"));
        assert!(parse_command("   ").is_err());
    }

    #[test]
    fn overload_is_printed_as_text() {
        assert_eq!(fmt_value(None, "A"), "overload");
        assert_eq!(fmt_value(Some(0.5), "V"), "5.000000e-1 V");
    }
}
