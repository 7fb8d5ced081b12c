//! Command-line entry point for the PiSpec host.

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use log::info;
use pispec::adapters::SerialFactory;
use pispec::config::Settings;
use pispec::data::MemorySink;
use pispec::discovery;
use pispec::engine::{Action, ExperimentEngine};
use pispec::link::DeviceLink;
use pispec::parameter::ParameterSet;
use pispec::watchdog::ConnectionWatchdog;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "pispec", about = "Host control for the PiSpec LED-pulse photometer")]
struct Cli {
    /// Path to a TOML settings file.
    #[arg(short, long)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Connect and run the built-in two-wavelength P700 demo protocol.
    Run {
        /// Serial device path (overrides config and discovery).
        #[arg(long)]
        port: Option<String>,

        /// Baud rate override.
        #[arg(long)]
        baud: Option<u32>,
    },
    /// List serial ports, marking known instrument vendor IDs.
    ListPorts,
    /// Ask the instrument to echo its current parameter set.
    Probe {
        #[arg(long)]
        port: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut settings = Settings::new(cli.config.as_deref()).context("loading settings")?;

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(settings.log_level.as_filter().to_string()),
    )
    .init();

    match cli.command {
        Command::Run { port, baud } => {
            if let Some(port) = port {
                settings.link.port = Some(port);
            }
            if let Some(baud) = baud {
                settings.link.baud_rate = baud;
            }
            settings.validate()?;
            run_demo(&settings).await
        }
        Command::ListPorts => list_ports(),
        Command::Probe { port } => {
            if let Some(port) = port {
                settings.link.port = Some(port);
            }
            probe(&settings).await
        }
    }
}

fn resolve_port(settings: &Settings) -> anyhow::Result<String> {
    if let Some(port) = &settings.link.port {
        return Ok(port.clone());
    }
    discovery::find_port(discovery::TRACE_CONTROLLER_VID)?
        .ok_or_else(|| anyhow!("no trace controller found; pass --port or set link.port"))
}

fn connect_pieces(settings: &Settings) -> anyhow::Result<DeviceLink> {
    let port = resolve_port(settings)?;
    let factory = Arc::new(SerialFactory::new(port, settings.link.baud_rate));
    Ok(DeviceLink::new(factory, &settings.link))
}

async fn run_demo(settings: &Settings) -> anyhow::Result<()> {
    let link = connect_pieces(settings)?;
    link.connect().await?;
    let mut watchdog = ConnectionWatchdog::spawn(link.clone(), settings.watchdog.poll_interval());

    let sink = MemorySink::new();
    let mut engine = ExperimentEngine::new(link, Box::new(sink.clone()));
    engine.load_experiment(p700_demo(), true);
    engine.run().await?;

    for record in sink.saved() {
        info!(
            "trace {} [{}] {:?}: {} bytes acquired between {} and {}",
            record.trace_num,
            record.note,
            record.status,
            record.buffer.len(),
            record.trace_begun,
            record.trace_end,
        );
    }

    watchdog.shutdown().await;
    Ok(())
}

/// The classic two-wavelength P700 measurement: one trace at 800 nm, a dark
/// pause, one trace at 900 nm.
fn p700_demo() -> Vec<Action> {
    let base = ParameterSet {
        num_points: 1000,
        pulse_interval: 1000,
        pulse_length: 50,
        meas_led_vis: 0,
        sat_pulse_begin: 200,
        sat_pulse_end: 400,
        pulse_mode: 1,
        ..ParameterSet::default()
    };
    let trace_800 = ParameterSet {
        meas_led_ir: 5,
        trace_note: "800nm".to_string(),
        ..base.clone()
    };
    let trace_900 = ParameterSet {
        meas_led_ir: 6,
        trace_note: "900nm".to_string(),
        ..base
    };

    vec![
        Action::SetParameters(trace_800),
        Action::Wait(1.0),
        Action::ExecuteTrace,
        Action::SaveData,
        Action::Wait(2.0),
        Action::SetParameters(trace_900),
        Action::Wait(1.0),
        Action::ExecuteTrace,
        Action::SaveData,
        Action::EndStep,
    ]
}

fn list_ports() -> anyhow::Result<()> {
    let ports = discovery::list_ports()?;
    if ports.is_empty() {
        println!("no serial ports found");
        return Ok(());
    }
    for port in &ports {
        let role = match &port.port_type {
            serialport::SerialPortType::UsbPort(usb) if usb.vid == discovery::TRACE_CONTROLLER_VID => {
                " (trace controller)"
            }
            serialport::SerialPortType::UsbPort(usb) if usb.vid == discovery::DATA_LOGGER_VID => {
                " (data logger)"
            }
            _ => "",
        };
        println!("{}{}", port.port_name, role);
    }
    Ok(())
}

async fn probe(settings: &Settings) -> anyhow::Result<()> {
    let link = connect_pieces(settings)?;
    link.connect().await?;

    let outcome = link.request_parameters().await?;
    if outcome.is_data() {
        println!("{}", outcome.buffer.trim());
        if let Ok(params) = ParameterSet::parse(outcome.buffer.trim().trim_end_matches(';')) {
            info!("parsed firmware parameters: {params:?}");
        }
    } else {
        println!("instrument did not answer the parameter request");
    }
    Ok(())
}
