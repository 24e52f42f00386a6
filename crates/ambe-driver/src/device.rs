//! Device abstraction for vocoder transports.
//!
//! Two transport shapes exist. A FIFO transport (the serial dongles)
//! preserves order: the chip sends responses in exactly the order it
//! received requests, and the scheduler relies on that. A tagging transport
//! (the RPC gateway) may reorder responses between clients, so each request
//! carries a client-chosen tag the far end echoes back.
//!
//! The traits are object-safe; schedulers are parameterized over the shape
//! they require, never over a concrete transport.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::Result;

/// What a transport reader delivers to its subscriber.
///
/// `P` is the packet payload shape: raw bytes for FIFO transports, a
/// `(tag, bytes)` pair for tagging transports.
pub enum DeviceEvent<P> {
    /// One complete framed packet.
    Packet(P),
    /// The reader reached EOF or a hard error without `stop`.
    ///
    /// This is fatal: the link is gone and no outstanding request will
    /// ever be answered. Subscribers must resolve everything in flight
    /// with [`crate::DriverError::DeviceLinkLost`] and shut down.
    LinkLost {
        /// What happened to the link.
        reason: String,
    },
}

/// Callback receiving events from a FIFO transport.
///
/// Invoked on the device's reader thread for every framed packet, and
/// once more if the link dies.
pub type FifoCallback = Box<dyn FnMut(DeviceEvent<Vec<u8>>) + Send>;

/// Callback receiving events from a tagging transport.
pub type TaggedCallback = Box<dyn FnMut(DeviceEvent<(i32, Vec<u8>)>) + Send>;

/// An abstract vocoder device.
///
/// Covers locally attached dongles as well as devices reached over the
/// network. `set_callback` (on the shape traits) may be called before
/// `start`; every other method only after.
pub trait Device: Send + Sync {
    /// Start the device and its reader thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport cannot be opened or configured.
    fn start(&self) -> Result<()>;

    /// Stop the device.
    ///
    /// Joins the reader thread; after `stop` returns the device no longer
    /// invokes its callback.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport cannot be shut down cleanly.
    fn stop(&self) -> Result<()>;

    /// Number of channels the device provides.
    fn channels(&self) -> usize;

    /// Whether packets currently carry trailing parity fields.
    ///
    /// Written by the API during reset and parity mode changes, read by the
    /// schedulers when parsing responses. Mode changes must not run
    /// concurrently with other requests.
    fn uses_parity(&self) -> bool;

    /// Record a parity mode change.
    fn set_uses_parity(&self, uses_parity: bool);

    /// The FIFO transport shape of this device, if it has one.
    fn as_fifo(&self) -> Option<&dyn FifoDevice> {
        None
    }

    /// The hardware reset capability of this device, if it has one.
    fn as_hard_resettable(&self) -> Option<&dyn HardResettable> {
        None
    }
}

/// A device that preserves request/response order.
///
/// The callback set through [`FifoDevice::set_callback`] receives responses
/// in the order in which requests were submitted through
/// [`FifoDevice::send`].
pub trait FifoDevice: Device {
    /// Send a framed packet to the device.
    ///
    /// Blocking and single-producer: invoking it concurrently from several
    /// threads is not supported. There is no way to learn whether the chip
    /// accepted the bytes; a write error is unrecoverable, terminates the
    /// enclosing scheduler, and the process is expected to restart.
    ///
    /// # Errors
    ///
    /// Returns [`crate::DriverError::DeviceSendFailed`] on a write error.
    fn send(&self, packet: &[u8]) -> Result<()>;

    /// Install a packet callback, returning the previous one.
    ///
    /// The callback is invoked on the reader thread. Passing `None` clears
    /// the slot; `stop` must clear it before the device is dropped.
    fn set_callback(&self, callback: Option<FifoCallback>) -> Option<FifoCallback>;
}

/// A device that correlates requests and responses with tags.
///
/// Remote devices reorder requests from multiple clients for fairness, so
/// the FIFO semantic is lost; the far end echoes the client-chosen tag in
/// the corresponding response instead.
pub trait TaggingDevice: Device {
    /// Send a framed packet with a correlation tag.
    ///
    /// Same blocking and failure contract as [`FifoDevice::send`].
    ///
    /// # Errors
    ///
    /// Returns [`crate::DriverError::DeviceSendFailed`] on a write error.
    fn send(&self, tag: i32, packet: &[u8]) -> Result<()>;

    /// Install a tagged packet callback, returning the previous one.
    fn set_callback(&self, callback: Option<TaggedCallback>) -> Option<TaggedCallback>;
}

/// Hardware reset capability.
///
/// Not every dongle supports a hardware reset; code wanting one queries for
/// this capability via [`Device::as_hard_resettable`].
pub trait HardResettable {
    /// Reset the device hardware. May block while the reset completes.
    ///
    /// # Errors
    ///
    /// Returns an error if the reset signal cannot be sent.
    fn hard_reset(&self) -> Result<()>;
}

/// Shared parity mode flag for device implementations.
///
/// The flag is only mutated outside the concurrent data path (during reset
/// and parity mode changes), so relaxed ordering suffices.
#[derive(Debug)]
pub struct ParityFlag(AtomicBool);

impl Default for ParityFlag {
    fn default() -> Self {
        // Chips power up with parity enabled.
        Self(AtomicBool::new(true))
    }
}

impl ParityFlag {
    /// Read the flag.
    pub fn get(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    /// Write the flag.
    pub fn set(&self, uses_parity: bool) {
        self.0.store(uses_parity, Ordering::Relaxed);
    }
}
