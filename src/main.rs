use std::io::{self, Write};
use std::path::PathBuf;
use std::thread;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use crossterm::{
    cursor, execute,
    style::Print,
    terminal::{Clear, ClearType},
};
use serialport::SerialPortType;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use xray_ctrl::{
    CancelToken, Delay, PhysicalReading, Port, PulseSequencer, SerialTransport, Settings,
    SimulatedTube, StepRecord, SweepConfig, SweepMode, SweepObserver, SweepOutcome,
    ThreadDelay, TubeController,
};

#[derive(Parser)]
#[command(name = "sweep_cli", version, about = "X-ray tube current sweeps over RS-232")]
struct Cli {
    /// Log filter used when RUST_LOG is not set.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// List the serial ports on this machine.
    Ports,
    /// Run current sweeps.
    Run(RunArgs),
}

#[derive(Args)]
struct RunArgs {
    /// TOML settings file.
    #[arg(short, long)]
    config: Option<PathBuf>,
    #[arg(long, value_enum)]
    mode: Option<SweepMode>,
    #[arg(long)]
    port: Option<String>,
    #[arg(long)]
    baud: Option<u32>,
    /// Talk to an in-memory tube instead of a serial port.
    #[arg(long)]
    simulate: bool,
    /// Exit after one sweep instead of offering another run.
    #[arg(long)]
    once: bool,
}

// The main entry point for the sweep command-line tool.
fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    match cli.command {
        CliCommand::Ports => list_ports(),
        CliCommand::Run(args) => run(args),
    }
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}

// Prints every serial port the OS reports.
fn list_ports() -> Result<()> {
    let ports = serialport::available_ports().context("could not enumerate serial ports")?;

    if ports.is_empty() {
        println!("No serial ports found.");
        return Ok(());
    }

    println!("Available serial ports:");
    for port in ports {
        println!("  {}: {}", port.port_name, describe_port(&port.port_type));
    }
    Ok(())
}

fn describe_port(port_type: &SerialPortType) -> String {
    match port_type {
        SerialPortType::UsbPort(usb) => usb
            .product
            .clone()
            .unwrap_or_else(|| format!("USB {:04x}:{:04x}", usb.vid, usb.pid)),
        SerialPortType::PciPort => String::from("PCI"),
        SerialPortType::BluetoothPort => String::from("Bluetooth"),
        SerialPortType::Unknown => String::from("n/a"),
    }
}

// Loads settings, opens the link and hands over to the sweep loop.
fn run(args: RunArgs) -> Result<()> {
    let mut settings =
        Settings::load(args.config.as_deref()).context("failed to load settings")?;
    if let Some(mode) = args.mode {
        settings.sweep.mode = mode;
    }
    if let Some(port) = args.port {
        settings.serial.port = port;
    }
    if let Some(baud) = args.baud {
        settings.serial.baud_rate = baud;
    }
    // Fail here, before the port is even opened.
    settings.validate().context("invalid settings")?;

    let cancel = CancelToken::new();
    spawn_interrupt_watcher(cancel.clone())?;

    println!("Press Ctrl+C at any time to interrupt the sweep and exit safely.\n");

    if args.simulate {
        info!("using the simulated tube interface");
        let transport = SerialTransport::new(SimulatedTube::new(), ThreadDelay);
        let mut tube = TubeController::new(transport);
        return run_sessions(&mut tube, &settings.sweep, &cancel, args.once);
    }

    let serial = &settings.serial;
    let mut tube = TubeController::open(&serial.port, serial.baud_rate, serial.read_timeout)?;
    println!("Opened {} @ {} baud\n", serial.port, serial.baud_rate);
    run_sessions(&mut tube, &settings.sweep, &cancel, args.once)
}

// Runs sweeps until the operator declines another run or interrupts one.
fn run_sessions<P: Port, D: Delay>(
    tube: &mut TubeController<P, D>,
    sweep: &SweepConfig,
    cancel: &CancelToken,
    once: bool,
) -> Result<()> {
    loop {
        cancel.reset();
        let report = PulseSequencer::new(tube, sweep.clone(), cancel.clone())
            .with_observer(Box::new(ConsoleDisplay))
            .run()
            .context("sweep failed")?;

        if report.outcome == SweepOutcome::Cancelled {
            println!("\nInterrupted by user. X-Ray turned OFF for safety.");
            return Ok(());
        }
        println!("\nSweep complete: {} steps, X-Ray is OFF.", report.steps.len());

        if once || !ask_another_run()? || cancel.is_cancelled() {
            println!("Exiting.");
            return Ok(());
        }
    }
}

fn ask_another_run() -> Result<bool> {
    print!("\nAnother run? (yes/no): ");
    io::stdout().flush()?;

    let mut answer = String::new();
    io::stdin().read_line(&mut answer)?;
    Ok(matches!(answer.trim().to_lowercase().as_str(), "yes" | "y"))
}

// Turns Ctrl+C into a cancellation request instead of killing the process,
// so the sequencer gets to switch the beam off.
fn spawn_interrupt_watcher(cancel: CancelToken) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start the signal runtime")?;

    thread::Builder::new()
        .name(String::from("ctrl-c"))
        .spawn(move || {
            runtime.block_on(async {
                while tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received, stopping the sweep");
                    cancel.cancel();
                }
            })
        })
        .context("failed to spawn the interrupt watcher")?;
    Ok(())
}

// Live progress on stdout; logs go to stderr.
struct ConsoleDisplay;

impl SweepObserver for ConsoleDisplay {
    fn on_countdown(&mut self, remaining_secs: u64) {
        let line = if remaining_secs > 0 {
            format!("Starting in {remaining_secs} seconds...")
        } else {
            String::from("Starting now!\n")
        };
        let mut stdout = io::stdout();
        if let Err(e) = execute!(
            stdout,
            cursor::MoveToColumn(0),
            Clear(ClearType::CurrentLine),
            Print(line)
        ) {
            debug!("countdown display failed: {e}");
        }
    }

    fn on_step(&mut self, step: &StepRecord) {
        println!(
            "  step {:>2}: {:>7.2} µA (VB{})  kV {}  µA {}",
            step.index + 1,
            step.setpoint_ua,
            step.counts,
            show_reading(step.kv),
            show_reading(step.ua),
        );
    }
}

fn show_reading(reading: Option<PhysicalReading>) -> String {
    reading.map_or_else(|| String::from("unavailable"), |r| r.to_string())
}
