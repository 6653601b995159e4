use clap::Parser;
use crossbeam_channel::{Receiver, never, select, unbounded};
use electro_control::{
    AppConfig, CandidateEdit, ControlLoop, Controller, DataLogger, Field, Instruments, Outcome,
    Quantity, TelemetrySample, TelemetryView, load_config,
};
use env_logger::Env;
use log::{LevelFilter, debug, error, info, warn};
use std::{
    io::{self, BufRead},
    path::{Path, PathBuf},
    process::ExitCode,
    thread,
};

const EXIT_CONFIG: u8 = 2;
const EXIT_DATA_LOG: u8 = 8;

/// Electrolyzer test stand controller
#[derive(Parser, Debug)]
#[command(name = "electro-control")]
#[command(about = "Power, flow and temperature control for an electrolyzer test stand", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Override the telemetry CSV path
    #[arg(short, long, value_name = "FILE")]
    data_file: Option<PathBuf>,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let mut config = match load_config(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    if let Some(path) = args.data_file {
        config.data_log.path = path;
    }

    let log_level = args
        .log_level
        .unwrap_or_else(|| config.console.verbosity.clone());
    initialize_logging(&log_level);
    log_startup_info(&config, args.config.as_deref());

    // Every instrument must answer before anything is written to disk
    let instruments = match Instruments::open_all(&config) {
        Ok(instruments) => instruments,
        Err(failure) => {
            error!("{failure}");
            return ExitCode::from(failure.role.exit_code());
        }
    };

    let logger = match DataLogger::create(&config.data_log.path) {
        Ok(logger) => logger,
        Err(e) => {
            error!("{e}");
            return ExitCode::from(EXIT_DATA_LOG);
        }
    };

    let instruments = instruments.into_workers(config.timing.device_timeout());
    let (controller, handle) = ControlLoop::new(instruments, logger, &config).spawn();
    setup_shutdown_handler(controller.clone());

    match controller.subscribe() {
        Ok(telemetry) => run_shell(&controller, telemetry),
        Err(e) => error!("{e}"),
    }

    info!("Cleaning up and shutting down...");
    controller.request_shutdown();
    drop(controller);
    if handle.join().is_err() {
        error!("Control loop panicked");
    }
    info!("Cleanup complete");

    ExitCode::SUCCESS
}

/// Log startup information
fn log_startup_info(config: &AppConfig, config_path: Option<&Path>) {
    info!("=== Electrolyzer Control ===");
    match config_path {
        Some(path) => info!("Configuration: {}", path.display()),
        None => info!("Configuration: defaults"),
    }
    info!("Supply: {} @ {} baud", config.supply.port, config.supply.baud_rate);
    info!(
        "Heater: {} (slave {})",
        config.heater.primary.port, config.heater.primary.slave_address
    );
    if let Some(secondary) = &config.heater.secondary {
        info!(
            "Cell heater: {} (slave {}, scale {})",
            secondary.controller.port, secondary.controller.slave_address, secondary.setpoint_scale
        );
    }
    info!("Data log: {}", config.data_log.path.display());
}

/// Setup Ctrl+C handler for graceful shutdown
fn setup_shutdown_handler(controller: Controller) {
    let result = ctrlc::set_handler(move || {
        info!("Ctrl+C received - driving instruments to safe state...");
        controller.request_shutdown();
    });
    if let Err(e) = result {
        warn!("Could not install Ctrl+C handler: {e}");
    }
}

/// What woke the shell up.
#[derive(Debug)]
enum ShellInput {
    Sample(TelemetrySample),
    Line(String),
}

/// Wait for the next telemetry sample or operator line.
///
/// A closed stdin is not a reason to stop: the shell keeps following
/// telemetry until the control loop goes away. Returns `None` once it has.
fn next_input(
    telemetry: &Receiver<TelemetrySample>,
    lines: &mut Receiver<String>,
) -> Option<ShellInput> {
    loop {
        let input_closed = select! {
            recv(telemetry) -> sample => return sample.ok().map(ShellInput::Sample),
            recv(*lines) -> line => match line {
                Ok(line) => return Some(ShellInput::Line(line)),
                Err(_) => true,
            },
        };
        if input_closed {
            info!("Console input closed; running headless until Ctrl+C");
            *lines = never();
        }
    }
}

/// Read operator commands until `quit` or until the control loop stops.
fn run_shell(controller: &Controller, telemetry: Receiver<TelemetrySample>) {
    let (lines_tx, mut lines) = unbounded();
    thread::spawn(move || {
        for line in io::stdin().lock().lines() {
            match line {
                Ok(line) => {
                    if lines_tx.send(line).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    let mut view = TelemetryView::new();
    println!("Commands: commit voltage=<V> current=<mA> flow=<mL/min> temperature=<°C> | terminate | stop-flow | status | quit");

    while let Some(input) = next_input(&telemetry, &mut lines) {
        match input {
            ShellInput::Sample(sample) => {
                debug!("{sample:?}");
                view.update(&sample);
            }
            ShellInput::Line(line) => {
                if !handle_command(controller, &view, line.trim()) {
                    break;
                }
            }
        }
    }
}

/// Returns false when the operator asked to quit.
fn handle_command(controller: &Controller, view: &TelemetryView, line: &str) -> bool {
    let mut words = line.split_whitespace();
    match words.next() {
        None => {}
        Some("commit") => match parse_edits(words) {
            Ok(edits) => match controller.commit(edits) {
                Ok(result) => {
                    for (quantity, outcome) in &result.outcomes {
                        println!("  {:<12} {}", quantity.to_string(), describe(*quantity, outcome));
                    }
                    for warning in &result.warnings {
                        println!("  warning: {warning}");
                    }
                }
                Err(e) => println!("Commit refused: {e}"),
            },
            Err(message) => println!("{message}"),
        },
        Some("terminate") => match controller.terminate() {
            Ok(report) if report.is_clean() => println!("All instruments at safe state"),
            Ok(report) => {
                for failure in &report.failures {
                    println!("  {} {:?}: {}", failure.device, failure.command, failure.error);
                }
            }
            Err(e) => println!("{e}"),
        },
        Some("stop-flow") => match controller.stop_flow() {
            Ok(report) if report.is_clean() => println!("Flow stopped"),
            Ok(report) => println!("Stop flow incomplete: {} failure(s)", report.failures.len()),
            Err(e) => println!("{e}"),
        },
        Some("status") => print_status(controller, view),
        Some("quit") | Some("exit") => return false,
        Some(other) => println!("Unknown command '{other}'"),
    }
    true
}

/// `voltage=10.5 flow=100` into candidate edits; unnamed quantities stay unchanged.
fn parse_edits<'a>(words: impl Iterator<Item = &'a str>) -> Result<Vec<CandidateEdit>, String> {
    words
        .map(|word| {
            let (key, value) = word
                .split_once('=')
                .ok_or_else(|| format!("Expected <quantity>=<value>, got '{word}'"))?;
            let quantity = Quantity::try_from(key).map_err(|e| e.to_string())?;
            Ok(CandidateEdit::new(quantity, value))
        })
        .collect()
}

fn describe(quantity: Quantity, outcome: &Outcome) -> String {
    let unit = quantity.unit();
    match outcome {
        Outcome::Applied(value) => format!("set to {value} {unit}"),
        Outcome::Refreshed(value) => format!("kept at {value} {unit}"),
        Outcome::Skipped(reason) => format!("skipped ({reason:?})"),
        Outcome::Rejected { text } => format!("rejected '{text}'"),
        Outcome::Failed { message, .. } => format!("failed: {message}"),
    }
}

fn print_status(controller: &Controller, view: &TelemetryView) {
    println!("State: {}", controller.run_state());
    for (field, label, unit) in [
        (Field::Voltage, "Stack voltage", "V"),
        (Field::Current, "Stack current", "mA"),
        (Field::Power, "Stack power", "W"),
        (Field::Resistivity, "Resistivity", "MΩ"),
        (Field::Flow, "Flow rate", "mL/min"),
        (Field::Temperature, "Temperature", "°C"),
    ] {
        let value = view
            .value(field)
            .map(|v| format!("{v} {unit}"))
            .unwrap_or_else(|| "--".to_string());
        let stale = if view.is_stale(field) { " (stale)" } else { "" };
        println!("  {label:<14} {value}{stale}");
    }
}

/// Initialize logging with configurable level
fn initialize_logging(log_level: &str) {
    let level = match log_level.to_lowercase().as_str() {
        "trace" => LevelFilter::Trace,
        "debug" => LevelFilter::Debug,
        "info" => LevelFilter::Info,
        "warn" => LevelFilter::Warn,
        "error" => LevelFilter::Error,
        _ => {
            eprintln!("Warning: Invalid log level '{}', using 'info'", log_level);
            LevelFilter::Info
        }
    };

    env_logger::Builder::from_env(Env::default())
        .filter_level(level)
        .format_timestamp_millis()
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;
    use electro_control::RunState;

    #[test]
    fn closed_stdin_keeps_following_telemetry() {
        let (sample_tx, telemetry) = bounded(4);
        let (lines_tx, mut lines) = unbounded::<String>();
        drop(lines_tx);

        sample_tx.send(TelemetrySample::empty(RunState::Running)).unwrap();
        assert!(matches!(
            next_input(&telemetry, &mut lines),
            Some(ShellInput::Sample(_))
        ));

        drop(sample_tx);
        assert!(next_input(&telemetry, &mut lines).is_none());
    }

    #[test]
    fn operator_lines_are_delivered() {
        let (_sample_tx, telemetry) = bounded::<TelemetrySample>(4);
        let (lines_tx, mut lines) = unbounded();
        lines_tx.send("status".to_string()).unwrap();

        match next_input(&telemetry, &mut lines) {
            Some(ShellInput::Line(line)) => assert_eq!(line, "status"),
            other => panic!("unexpected input {other:?}"),
        }
    }

    #[test]
    fn edits_parse_from_key_value_words() {
        let edits = parse_edits("voltage=10.5 flow=100".split_whitespace()).unwrap();
        assert_eq!(edits.len(), 2);
        assert!(parse_edits("voltage".split_whitespace()).is_err());
    }
}
