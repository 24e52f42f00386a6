//! Request schedulers.
//!
//! The chip sends one response per request, and requests and responses
//! carry nothing that would correlate them, so the chip answers strictly in
//! the order it received requests. Processing a request takes non-trivial
//! time and the chip's input buffer is small. A scheduler buffers requests
//! from callers and decides the order in which they reach the device,
//! maximizing channel utilization while keeping the input buffer bounded,
//! then matches each received packet back to its submitter.

mod fifo;
mod multiqueue;

use std::time::Duration;

use ambe_proto::Packet;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};

use crate::error::{DriverError, Result};

pub use fifo::FifoScheduler;
pub use multiqueue::{MultiQueueScheduler, MAX_CHANNELS, QUEUES_PER_CHANNEL};

/// Callback resolving one submitted request with its response or error.
pub type ResponseCallback = Box<dyn FnOnce(Result<Packet>) + Send>;

/// A request scheduler for vocoder devices.
///
/// Ordering guarantee for every implementation: responses for requests that
/// share a single FIFO pipeline to the chip are delivered to callbacks in
/// the order those requests were transmitted. Requests for which the chip
/// produces no response must not go through a scheduler; submitting one is
/// a caller bug.
pub trait Scheduler: Send + Sync {
    /// Start the scheduler: subscribe to the device and spawn any
    /// background thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the scheduler was already started.
    fn start(&self) -> Result<()>;

    /// Stop the scheduler cleanly, waiting for requests submitted before
    /// the stop to complete, then unsubscribe from the device.
    ///
    /// # Errors
    ///
    /// Returns an error if outstanding requests cannot complete because
    /// the transport failed.
    fn stop(&self) -> Result<()>;

    /// Submit a request; the callback resolves with the response.
    ///
    /// Never blocks on device I/O (at most briefly on an internal lock).
    /// The callback is resolved with an error if the request cannot be
    /// sent.
    fn submit_async(&self, packet: Packet, callback: ResponseCallback);

    /// Submit a request and receive the response through a [`Response`]
    /// handle.
    fn submit(&self, packet: Packet) -> Response {
        let (tx, rx) = bounded(1);
        self.submit_async(
            packet,
            Box::new(move |result| {
                // The caller may have abandoned the response; that must not
                // disturb the scheduler.
                let _ = tx.send(result);
            }),
        );
        Response { rx }
    }
}

/// A pending response to a submitted request.
///
/// Dropping a `Response` abandons the request without cancelling it; the
/// request keeps running in the background and the scheduler state stays
/// intact.
#[derive(Debug)]
pub struct Response {
    rx: Receiver<Result<Packet>>,
}

impl Response {
    /// Block until the response arrives.
    ///
    /// # Errors
    ///
    /// Returns the error the scheduler resolved the request with, or
    /// [`DriverError::DeviceSendFailed`] if the scheduler went away without
    /// resolving it.
    pub fn wait(self) -> Result<Packet> {
        self.rx
            .recv()
            .unwrap_or_else(|_| Err(DriverError::send_failed("request dropped by scheduler")))
    }

    /// Block until the response arrives or the deadline expires.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::DeadlineExceeded`] on timeout; the request
    /// itself continues in the background.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<Packet> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(DriverError::DeadlineExceeded {
                waited_ms: timeout.as_millis() as u64,
            }),
            Err(RecvTimeoutError::Disconnected) => {
                Err(DriverError::send_failed("request dropped by scheduler"))
            }
        }
    }
}
