//! Driver for DVSI's AMBE vocoder dongles.
//!
//! The chips behind these dongles compress 20 ms audio frames into codec
//! bit frames (and back) on up to three parallel channels. Requests and
//! responses carry nothing that correlates them: the chip answers strictly
//! in the order it received requests, its input buffer is small, and
//! overflowing it corrupts the stream. The heart of this crate is therefore
//! the request scheduler, which keeps every channel busy without ever
//! exceeding the chip's bounds.
//!
//! # Architecture
//!
//! ```text
//! caller → Api (builds packet)
//!        → Scheduler::submit_async (buffers, picks ordering)
//!        → device send (bytes out)
//!        … reader thread → scheduler recv (matches oldest outstanding)
//!        → response callback (parses packet) → caller
//! ```
//!
//! Transports come in two shapes: [`FifoDevice`] for order-preserving
//! serial links, scheduled by [`MultiQueueScheduler`], and
//! [`TaggingDevice`] for the remote gateway, scheduled by
//! [`FifoScheduler`].
//!
//! # Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use ambe_driver::{Api, Device, MultiQueueScheduler, Scheduler, Usb3003};
//! use ambe_proto::Rate;
//!
//! # fn main() -> ambe_driver::Result<()> {
//! let device = Arc::new(Usb3003::new("/dev/ttyUSB0"));
//! let scheduler = Arc::new(MultiQueueScheduler::new(device.clone(), 3)?);
//!
//! device.start()?;
//! scheduler.start()?;
//!
//! let api = Api::new(device.clone(), scheduler.clone(), true);
//! api.reset(true)?;
//! api.rate(0, &Rate::Table { index: 33 })?;
//! api.init(0, true, true)?;
//!
//! scheduler.stop()?;
//! device.stop()?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_panics_doc)]

mod api;
mod device;
mod error;
mod manager;
pub mod mock;
pub mod rpc;
mod scheduler;
mod serial;
mod uri;

pub use api::Api;
pub use device::{
    Device, DeviceEvent, FifoCallback, FifoDevice, HardResettable, ParityFlag, TaggedCallback,
    TaggingDevice,
};
pub use error::{DriverError, Result};
pub use manager::DeviceManager;
pub use rpc::RpcDevice;
pub use scheduler::{
    FifoScheduler, MultiQueueScheduler, Response, ResponseCallback, Scheduler, MAX_CHANNELS,
    QUEUES_PER_CHANNEL,
};
pub use serial::{SerialDevice, Usb3000, Usb3003};
pub use uri::{Uri, UriKind};
