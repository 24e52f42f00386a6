//! `ambec` — compress and decompress audio through a vocoder device.
//!
//! ```text
//! ambec -u usb:/dev/ttyUSB0 -i input.wav -o output.wav
//! ambec -u grpc:localhost:50051 -i input.wav -t -p 4 -x 33
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use ambe_cli::client;
use ambe_driver::{
    Api, Device, FifoScheduler, MultiQueueScheduler, RpcDevice, Scheduler, Uri, UriKind, Usb3003,
};
use ambe_proto::Rate;
use anyhow::{ensure, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "ambec", about = "AMBE vocoder client", version)]
struct Args {
    /// Number of channels to use simultaneously (0 = all available).
    #[arg(short = 'c', default_value_t = 0)]
    channels: usize,

    /// Run in concurrent mode (default is synchronous mode).
    #[arg(short = 't')]
    concurrent: bool,

    /// Request pipeline depth in concurrent mode.
    #[arg(short = 'p', default_value_t = 2)]
    pipeline: usize,

    /// Input .wav file (8000 Hz, mono, 16-bit PCM).
    #[arg(short = 'i')]
    input: PathBuf,

    /// Optional .wav file to write decoded audio to.
    #[arg(short = 'o')]
    output: Option<PathBuf>,

    /// Device URI: usb:<device-path> or grpc:<host:port>.
    #[arg(short = 'u')]
    uri: String,

    /// Rate: a table index (0-255) or six comma-separated rate words.
    #[arg(short = 'x', default_value = "33")]
    rate: String,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    ensure!(args.channels <= 3, "the chip supports up to 3 channels");
    ensure!(args.pipeline >= 1, "invalid pipeline size (must be >= 1)");

    let rate: Rate = args.rate.parse()?;
    let uri: Uri = args.uri.parse()?;

    let options = client::Options {
        channels: args.channels,
        concurrent: args.concurrent,
        pipeline: args.pipeline,
        rate,
        input: args.input,
        output: args.output,
    };

    match uri.kind {
        UriKind::Usb => run_usb(&uri.authority, &options),
        UriKind::Rpc => run_rpc(&uri.authority, &options),
    }
}

fn run_usb(path: &str, options: &client::Options) -> Result<()> {
    let device = Arc::new(Usb3003::new(path));
    let scheduler = Arc::new(MultiQueueScheduler::new(device.clone(), device.channels())?);
    device.start()?;
    scheduler.start()?;

    let api = Api::new(device.clone(), scheduler.clone(), true);
    info!("resetting device");
    api.reset(true)?;
    info!("disabling parity");
    api.parity_mode(0)?;
    info!("disabling companding");
    api.compand(false, false)?;

    let channels: Vec<u8> = (0..device.channels() as u8).collect();
    let result = client::run(&api, &channels, options);

    scheduler.stop()?;
    device.stop()?;
    result
}

fn run_rpc(authority: &str, options: &client::Options) -> Result<()> {
    info!("connecting to {authority}");
    let device = Arc::new(RpcDevice::new(authority));
    let scheduler = Arc::new(FifoScheduler::new(device.clone()));
    device.start()?;
    scheduler.start()?;

    // The gateway already reset and configured the chip; this client only
    // owns its assigned channel.
    let api = Api::new(device.clone(), scheduler.clone(), true);
    let channels = vec![device.assigned_channel()];
    let result = client::run(&api, &channels, options);

    scheduler.stop()?;
    device.stop()?;
    result
}
