//! In-memory transports for tests and CI.
//!
//! These devices implement the transport traits without any hardware: they
//! record everything sent and let the test (or an installed responder)
//! inject the chip's side of the conversation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::device::{
    Device, DeviceEvent, FifoCallback, FifoDevice, HardResettable, ParityFlag, TaggedCallback,
    TaggingDevice,
};
use crate::error::{DriverError, Result};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Produces the response the virtual chip sends for a written packet, or
/// `None` to swallow it.
pub type Responder = Box<dyn FnMut(&[u8]) -> Option<Vec<u8>> + Send>;

/// A virtual FIFO device.
///
/// `send` records the packet; responses are produced by an installed
/// [`Responder`] or injected explicitly with
/// [`MockFifoDevice::push_response`]. Setting `fail_sends` makes every
/// write fail, which exercises the schedulers' fatal error path.
#[derive(Default)]
pub struct MockFifoDevice {
    channels: usize,
    sent: Mutex<Vec<Vec<u8>>>,
    callback: Mutex<Option<FifoCallback>>,
    responder: Mutex<Option<Responder>>,
    fail_sends: AtomicBool,
    hard_resets: AtomicBool,
    parity: ParityFlag,
}

impl MockFifoDevice {
    /// Create a virtual device with the given channel count.
    pub fn new(channels: usize) -> Self {
        Self {
            channels,
            ..Self::default()
        }
    }

    /// Install a responder driving the virtual chip.
    pub fn set_responder(&self, responder: Option<Responder>) {
        *lock(&self.responder) = responder;
    }

    /// Make every subsequent send fail.
    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Deliver a raw buffer to the installed callback, as the reader
    /// thread would.
    pub fn push_response(&self, bytes: Vec<u8>) {
        if let Some(cb) = lock(&self.callback).as_mut() {
            cb(DeviceEvent::Packet(bytes));
        }
    }

    /// Report the link as lost, as the reader thread would on an
    /// unexpected EOF.
    pub fn drop_link(&self, reason: &str) {
        if let Some(cb) = lock(&self.callback).as_mut() {
            cb(DeviceEvent::LinkLost {
                reason: reason.to_string(),
            });
        }
    }

    /// Everything sent so far.
    pub fn sent(&self) -> Vec<Vec<u8>> {
        lock(&self.sent).clone()
    }

    /// Number of packets sent so far.
    pub fn sent_count(&self) -> usize {
        lock(&self.sent).len()
    }

    /// Drain the send log.
    pub fn take_sent(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut *lock(&self.sent))
    }

    /// Whether a hardware reset was triggered.
    pub fn was_hard_reset(&self) -> bool {
        self.hard_resets.load(Ordering::SeqCst)
    }
}

impl Device for MockFifoDevice {
    fn start(&self) -> Result<()> {
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        Ok(())
    }

    fn channels(&self) -> usize {
        self.channels
    }

    fn uses_parity(&self) -> bool {
        self.parity.get()
    }

    fn set_uses_parity(&self, uses_parity: bool) {
        self.parity.set(uses_parity);
    }

    fn as_fifo(&self) -> Option<&dyn FifoDevice> {
        Some(self)
    }

    fn as_hard_resettable(&self) -> Option<&dyn HardResettable> {
        Some(self)
    }
}

impl FifoDevice for MockFifoDevice {
    fn send(&self, packet: &[u8]) -> Result<()> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(DriverError::send_failed("mock write failure"));
        }
        lock(&self.sent).push(packet.to_vec());

        let response = lock(&self.responder)
            .as_mut()
            .and_then(|responder| responder(packet));
        if let Some(bytes) = response {
            self.push_response(bytes);
        }
        Ok(())
    }

    fn set_callback(&self, callback: Option<FifoCallback>) -> Option<FifoCallback> {
        std::mem::replace(&mut *lock(&self.callback), callback)
    }
}

impl HardResettable for MockFifoDevice {
    fn hard_reset(&self) -> Result<()> {
        self.hard_resets.store(true, Ordering::SeqCst);
        let response = lock(&self.responder)
            .as_mut()
            .and_then(|responder| responder(&[]));
        if let Some(bytes) = response {
            self.push_response(bytes);
        }
        Ok(())
    }
}

/// A virtual tagging device.
///
/// Records `(tag, packet)` pairs; the test injects responses in any order
/// with [`MockTaggingDevice::respond`], which is exactly the freedom the
/// tagging transport contract allows.
#[derive(Default)]
pub struct MockTaggingDevice {
    sent: Mutex<Vec<(i32, Vec<u8>)>>,
    callback: Mutex<Option<TaggedCallback>>,
    fail_sends: AtomicBool,
    parity: ParityFlag,
}

impl MockTaggingDevice {
    /// Create a virtual tagging device.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent send fail.
    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Deliver a tagged buffer to the installed callback.
    pub fn respond(&self, tag: i32, bytes: Vec<u8>) {
        if let Some(cb) = lock(&self.callback).as_mut() {
            cb(DeviceEvent::Packet((tag, bytes)));
        }
    }

    /// Report the link as lost, as the reader thread would on an
    /// unexpected EOF.
    pub fn drop_link(&self, reason: &str) {
        if let Some(cb) = lock(&self.callback).as_mut() {
            cb(DeviceEvent::LinkLost {
                reason: reason.to_string(),
            });
        }
    }

    /// Everything sent so far.
    pub fn sent(&self) -> Vec<(i32, Vec<u8>)> {
        lock(&self.sent).clone()
    }
}

impl Device for MockTaggingDevice {
    fn start(&self) -> Result<()> {
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        Ok(())
    }

    fn channels(&self) -> usize {
        1
    }

    fn uses_parity(&self) -> bool {
        self.parity.get()
    }

    fn set_uses_parity(&self, uses_parity: bool) {
        self.parity.set(uses_parity);
    }
}

impl TaggingDevice for MockTaggingDevice {
    fn send(&self, tag: i32, packet: &[u8]) -> Result<()> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(DriverError::send_failed("mock write failure"));
        }
        lock(&self.sent).push((tag, packet.to_vec()));
        Ok(())
    }

    fn set_callback(&self, callback: Option<TaggedCallback>) -> Option<TaggedCallback> {
        std::mem::replace(&mut *lock(&self.callback), callback)
    }
}
