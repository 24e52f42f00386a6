//! First in, first out scheduler for tagging transports.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use ambe_proto::Packet;
use crossbeam_channel::{bounded, Sender};
use tracing::{error, warn};

use crate::device::{DeviceEvent, TaggingDevice};
use crate::error::{DriverError, Result};
use crate::scheduler::{ResponseCallback, Scheduler};

/// The simplest possible request scheduler.
///
/// Packets go to the device in arrival order. Because the transport tags
/// every request and echoes the tag in the response, responses may come
/// back in any order; the scheduler keeps a map from tag to callback and
/// resolves each response against it.
///
/// The callback is resolved with an error if the scheduler fails to write
/// the request to the device.
pub struct FifoScheduler {
    device: Arc<dyn TaggingDevice>,
    state: Arc<Mutex<FifoState>>,
}

#[derive(Default)]
struct FifoState {
    tag: i32,
    submitted: HashMap<i32, ResponseCallback>,
    quit: bool,
    drained: Option<Sender<()>>,
}

fn lock(state: &Mutex<FifoState>) -> MutexGuard<'_, FifoState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl FifoScheduler {
    /// Create a scheduler for the given tagging device.
    pub fn new(device: Arc<dyn TaggingDevice>) -> Self {
        Self {
            device,
            state: Arc::new(Mutex::new(FifoState::default())),
        }
    }

    /// The transport died: nothing in the map will ever be answered.
    /// Resolve every outstanding request with the error and let a waiting
    /// `stop` proceed.
    fn link_lost(state: &Mutex<FifoState>, reason: &str) {
        error!("device link lost: {reason}; failing outstanding requests");

        let (callbacks, drained) = {
            let mut guard = lock(state);
            let callbacks: Vec<ResponseCallback> =
                guard.submitted.drain().map(|(_, callback)| callback).collect();
            (callbacks, guard.drained.take())
        };
        for callback in callbacks {
            callback(Err(DriverError::link_lost(reason)));
        }
        if let Some(tx) = drained {
            let _ = tx.send(());
        }
    }

    /// Handle one tagged packet from the device reader thread.
    fn recv(
        state: &Mutex<FifoState>,
        device: &Weak<dyn TaggingDevice>,
        tag: i32,
        bytes: Vec<u8>,
    ) {
        let Some(device) = device.upgrade() else {
            return;
        };
        let uses_parity = device.uses_parity();

        let mut guard = lock(state);
        let Some(callback) = guard.submitted.remove(&tag) else {
            drop(guard);
            warn!(tag, "received response with unknown tag");
            return;
        };
        let drained = if guard.quit && guard.submitted.is_empty() {
            guard.drained.take()
        } else {
            None
        };
        drop(guard);

        // Parity is not verified here; the requester decides whether to
        // check it.
        callback(Packet::parse(bytes, uses_parity, false).map_err(DriverError::from));

        if let Some(tx) = drained {
            let _ = tx.send(());
        }
    }
}

impl Scheduler for FifoScheduler {
    fn start(&self) -> Result<()> {
        {
            let mut state = lock(&self.state);
            state.tag = 0;
            state.quit = false;
            state.drained = None;
        }

        let state = Arc::clone(&self.state);
        let device = Arc::downgrade(&self.device);
        self.device.set_callback(Some(Box::new(move |event| match event {
            DeviceEvent::Packet((tag, bytes)) => Self::recv(&state, &device, tag, bytes),
            DeviceEvent::LinkLost { reason } => Self::link_lost(&state, &reason),
        })));
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        let mut state = lock(&self.state);

        // With outstanding requests on the map, wait for the reader to
        // resolve all of them before unsubscribing.
        if !state.submitted.is_empty() {
            state.quit = true;
            let (tx, rx) = bounded(1);
            state.drained = Some(tx);
            drop(state);
            let _ = rx.recv();
        } else {
            drop(state);
        }

        self.device.set_callback(None);
        Ok(())
    }

    fn submit_async(&self, packet: Packet, callback: ResponseCallback) {
        // Locking across the send is fine: a tagging transport's send does
        // not wait for the packet to reach the chip.
        let mut state = lock(&self.state);
        state.tag = state.tag.wrapping_add(1);
        let tag = state.tag;

        match self.device.send(tag, packet.as_bytes()) {
            Ok(()) => {
                state.submitted.insert(tag, callback);
            }
            Err(e) => {
                // The tag is not recorded; the request never reached the
                // device and is resolved with the send error.
                drop(state);
                error!("failed to send request {tag}: {e}");
                callback(Err(e));
            }
        }
    }
}
