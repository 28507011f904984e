//! Command-line entry point: parses arguments and drives either the CAN or
//! serial flashing flow.
//!
//! Grounded on `flashtool.py::main`/`CanSocket.run`/`SerialSocket.run`.

use clap::Parser;
use katapult_flash::can::{CanTransport, NodeManager};
use katapult_flash::command::CommandEngine;
use katapult_flash::endpoint::Transport;
use katapult_flash::flash::FlashEngine;
use katapult_flash::uuid::Uuid48;
use katapult_flash::{logging, KatapultError};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "katapult-flash", about = "Katapult bootloader flash utility")]
struct Args {
    /// Serial device. When omitted, the tool talks CAN instead.
    #[arg(short = 'd', long)]
    device: Option<String>,

    /// Serial baud rate.
    #[arg(short = 'b', long, default_value_t = 250_000)]
    baud: u32,

    /// CAN interface name.
    #[arg(short = 'i', long, default_value = "can0")]
    interface: String,

    /// Path to the firmware binary.
    #[arg(short = 'f', long)]
    firmware: Option<PathBuf>,

    /// CAN device UUID, as 12 hex digits.
    #[arg(short = 'u', long)]
    uuid: Option<String>,

    /// Query bootloader device UUIDs and exit.
    #[arg(short = 'q', long)]
    query: bool,

    /// Verbose logging.
    #[arg(short = 'v', long)]
    verbose: bool,

    /// Request the device enter its bootloader, then exit.
    #[arg(short = 'r', long = "request-bootloader")]
    request_bootloader: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    logging::init(args.verbose);

    match run(args).await {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            log::error!("Flash Error: {e}");
            println!("{e}");
            std::process::exit(1);
        }
    }
}

async fn run(args: Args) -> Result<(), KatapultError> {
    if let Some(device) = &args.device {
        run_serial(device, &args).await
    } else {
        run_can(&args).await
    }
}

async fn run_can(args: &Args) -> Result<(), KatapultError> {
    let transport = CanTransport::open(&args.interface).await?;
    let manager = NodeManager::new(transport.clone());

    if args.query {
        manager.clear_node_ids().await?;
        tokio::time::sleep(Duration::from_millis(500)).await;
        let devices = manager.query_unassigned().await?;
        for device in &devices {
            println!("Detected UUID: {}, Application: {:?}", device.uuid, device.app);
        }
        println!("Query Complete");
        return Ok(());
    }

    let Some(uuid_str) = &args.uuid else {
        return Err(KatapultError::invalid_input(
            "the 'uuid' option must be specified to flash a device",
        ));
    };
    let target_uuid = Uuid48::parse(uuid_str)?;

    println!("Sending bootloader jump command...");
    manager.jump_to_bootloader(target_uuid).await?;
    tokio::time::sleep(Duration::from_millis(500)).await;

    if args.request_bootloader {
        println!("Bootloader request command sent");
        return Ok(());
    }

    println!("Resetting all bootloader node IDs...");
    manager.clear_node_ids().await?;
    tokio::time::sleep(Duration::from_secs(1)).await;

    let devices = manager.query_unassigned().await?;
    katapult_flash::can::require_discovered(&devices, target_uuid)?;

    let endpoint = manager.set_node_id(target_uuid).await?;
    tokio::time::sleep(Duration::from_millis(500)).await;

    let firmware = require_firmware(args)?;
    let engine = CommandEngine::new(transport as Arc<dyn Transport>, endpoint.id(), endpoint);
    let mut flash_engine = FlashEngine::new(engine, firmware)?;

    let result = async {
        flash_engine.connect().await?;
        flash_engine.verify_canbus_uuid(target_uuid).await?;
        flash_engine.send_file().await?;
        flash_engine.verify_file().await?;
        Ok::<(), KatapultError>(())
    }
    .await;
    flash_engine.finish().await;
    result?;

    println!("Flash Success");
    Ok(())
}

async fn run_serial(device: &str, args: &Args) -> Result<(), KatapultError> {
    use katapult_flash::serial::{self, SerialOpen};

    let opened = serial::open(device, args.baud, args.request_bootloader).await?;
    let (transport, needs_priming) = match opened {
        SerialOpen::RequestSatisfied => return Ok(()),
        SerialOpen::Ready { transport, needs_priming } => (transport, needs_priming),
    };

    let firmware = require_firmware(args)?;
    let endpoint = transport.endpoint();
    let engine = CommandEngine::new(transport as Arc<dyn Transport>, endpoint.id(), endpoint);
    let mut flash_engine = FlashEngine::new(engine, firmware)?;

    let result = async {
        if needs_priming {
            flash_engine.prime().await?;
        }
        flash_engine.connect().await?;
        flash_engine.send_file().await?;
        flash_engine.verify_file().await?;
        Ok::<(), KatapultError>(())
    }
    .await;
    flash_engine.finish().await;
    result?;

    println!("Flash Success");
    Ok(())
}

fn require_firmware(args: &Args) -> Result<PathBuf, KatapultError> {
    args.firmware
        .clone()
        .ok_or_else(|| KatapultError::invalid_input("the 'firmware' option must be specified to flash a device"))
}
