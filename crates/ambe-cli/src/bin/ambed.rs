//! `ambed` — serve a local vocoder dongle to remote clients.
//!
//! ```text
//! ambed -s /dev/ttyUSB0 -p 50051
//! ```

use std::net::TcpListener;
use std::sync::Arc;

use ambe_driver::{rpc, Api, Device, DeviceManager, MultiQueueScheduler, Scheduler, Usb3003};
use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "ambed", about = "AMBE vocoder gateway server", version)]
struct Args {
    /// Port number to listen on.
    #[arg(short = 'p', default_value_t = 50051)]
    port: u16,

    /// Serial port with a vocoder chip.
    #[arg(short = 's')]
    serial: String,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();

    let device = Arc::new(Usb3003::new(args.serial.as_str()));
    let scheduler = Arc::new(MultiQueueScheduler::new(device.clone(), device.channels())?);
    device.start()?;
    scheduler.start()?;

    let api = Api::new(device.clone(), scheduler.clone(), true);
    info!("resetting chip on {}", args.serial);
    api.reset(true)?;
    info!("found chip {} version {}", api.prodid()?, api.verstring()?);
    info!("disabling parity");
    api.parity_mode(0)?;
    info!("disabling companding");
    api.compand(false, false)?;

    let manager = Arc::new(DeviceManager::new());
    manager.add(args.serial.clone(), device.clone(), scheduler.clone())?;

    let listener = TcpListener::bind(("0.0.0.0", args.port))
        .with_context(|| format!("cannot listen on port {}", args.port))?;
    info!("vocoder gateway listening on 0.0.0.0:{}", args.port);

    rpc::serve(listener, manager)?;
    Ok(())
}
