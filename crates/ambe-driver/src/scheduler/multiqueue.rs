//! Multi-queue scheduler for direct serial chips.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use ambe_proto::{Packet, PacketType};
use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::{error, warn};

use crate::device::{DeviceEvent, FifoDevice};
use crate::error::{DriverError, Result};
use crate::scheduler::{ResponseCallback, Scheduler};

/// Pipeline slots the chip reserves per channel: one request being
/// processed by the DSP core and one waiting in the input buffer.
pub const QUEUES_PER_CHANNEL: usize = 2;

/// Largest channel count of any supported chip.
pub const MAX_CHANNELS: usize = 3;

type Entry = (Packet, ResponseCallback);

enum Event {
    Request {
        packet: Packet,
        callback: ResponseCallback,
    },
    Response(Result<Packet>),
    LinkLost {
        reason: String,
    },
}

/// A request scheduler for chips with multiple channels.
///
/// The multi-channel dongles run two independent DSP stages per channel.
/// This scheduler keeps one FIFO queue per stage, plus one high-priority
/// queue for device-wide control requests. Incoming packets are filed by
/// channel and operation; when picking the next packet to transmit, the
/// scheduler fills every stage while keeping the chip's small input buffer
/// from overflowing.
///
/// Control requests that address the entire device (no channel field) are
/// sent as soon as input buffer space allows, ahead of queued channel
/// traffic.
pub struct MultiQueueScheduler {
    device: Arc<dyn FifoDevice>,
    channels: usize,
    tx: Sender<Event>,
    rx: Mutex<Option<Receiver<Event>>>,
    runner: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MultiQueueScheduler {
    /// Create a scheduler for a device with the given channel count.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::InvalidConfiguration`] if the channel count
    /// is zero or above [`MAX_CHANNELS`].
    pub fn new(device: Arc<dyn FifoDevice>, channels: usize) -> Result<Self> {
        if channels == 0 || channels > MAX_CHANNELS {
            return Err(DriverError::invalid_configuration(format!(
                "invalid number of channels: {channels}"
            )));
        }
        let (tx, rx) = unbounded();
        Ok(Self {
            device,
            channels,
            tx,
            rx: Mutex::new(Some(rx)),
            runner: Mutex::new(None),
        })
    }
}

impl Scheduler for MultiQueueScheduler {
    fn start(&self) -> Result<()> {
        let rx = lock(&self.rx)
            .take()
            .ok_or_else(|| DriverError::invalid_state("scheduler already started"))?;

        // The device callback runs on the reader thread; it only parses and
        // forwards, the scheduling thread does everything else.
        let tx = self.tx.clone();
        let device = Arc::downgrade(&self.device);
        self.device.set_callback(Some(Box::new(move |event| {
            let event = match event {
                DeviceEvent::Packet(bytes) => {
                    let Some(device) = device.upgrade() else {
                        return;
                    };
                    let parsed = Packet::parse(bytes, device.uses_parity(), false);
                    Event::Response(parsed.map_err(DriverError::from))
                }
                DeviceEvent::LinkLost { reason } => Event::LinkLost { reason },
            };
            let _ = tx.send(event);
        })));

        let device = Arc::clone(&self.device);
        let channels = self.channels;
        let handle = thread::Builder::new()
            .name("ambe-scheduler".into())
            .spawn(move || run(&rx, &device, channels))?;
        *lock(&self.runner) = Some(handle);
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        // Hand the scheduling thread an empty packet. Its response arrives
        // once every request buffered before it has completed.
        let result = self.submit(Packet::default()).wait();

        if let Some(handle) = lock(&self.runner).take() {
            let _ = handle.join();
        }
        self.device.set_callback(None);
        result.map(|_| ())
    }

    fn submit_async(&self, packet: Packet, callback: ResponseCallback) {
        if let Err(e) = self.tx.send(Event::Request { packet, callback }) {
            let Event::Request { callback, .. } = e.into_inner() else {
                return;
            };
            callback(Err(DriverError::send_failed("scheduler is not running")));
        }
    }
}

/// Compression and decompression ride different DSP stages; the stage index
/// doubles as the per-type in-flight counter index. Control packets share
/// the speech stage: the chip answers them immediately without keeping a
/// core busy.
fn type_index(packet: &Packet) -> usize {
    match packet.kind() {
        PacketType::Channel => 1,
        PacketType::Speech | PacketType::Control => 0,
    }
}

/// Queue index for a packet: `None` for device-wide packets (no channel
/// field), which go to the high-priority queue.
///
/// # Errors
///
/// Returns [`DriverError::InvalidConfiguration`] if the packet addresses a
/// channel this device does not provide.
fn queue_index(packet: &Packet, nqueues: usize) -> Result<Option<usize>> {
    let Some(channel) = packet.channel() else {
        return Ok(None);
    };
    let index = QUEUES_PER_CHANNEL * usize::from(channel) + type_index(packet);
    if index >= nqueues {
        return Err(DriverError::invalid_configuration(format!(
            "channel {channel} not provided by this device"
        )));
    }
    Ok(Some(index))
}

/// Admission predicate: can this packet be written to the chip right now?
fn can_send(
    packet: &Packet,
    nqueues: usize,
    channels: usize,
    in_flight: usize,
    by_type: &[usize; QUEUES_PER_CHANNEL],
    by_queue: &[usize],
) -> bool {
    // The input buffer holds four packets beyond the one each pipeline slot
    // is working on, so at most one packet per channel queue plus four may
    // be outstanding.
    if in_flight >= nqueues + 4 {
        return false;
    }

    // Of those four buffer slots, two take CHANNEL packets and two take
    // SPEECH packets: per type, one in-flight packet per channel plus two.
    // Control packets count against the speech budget.
    if by_type[type_index(packet)] >= channels + 2 {
        return false;
    }

    // A channel that runs out of data would let the bounds above overcommit
    // the buffer, so additionally: two in-flight packets per queue, one
    // processing and one waiting.
    if let Ok(Some(index)) = queue_index(packet, nqueues) {
        if by_queue[index] >= 2 {
            return false;
        }
    }

    true
}

#[allow(clippy::too_many_lines)]
fn run(rx: &Receiver<Event>, device: &Arc<dyn FifoDevice>, channels: usize) {
    let nqueues = channels * QUEUES_PER_CHANNEL;

    // High-priority queue for device-wide control requests.
    let mut device_queue: VecDeque<Entry> = VecDeque::new();
    let mut channel_queue: Vec<VecDeque<Entry>> = (0..nqueues).map(|_| VecDeque::new()).collect();

    // Requests written to the chip but not answered yet, oldest first, with
    // in-flight counts broken down by type and by channel queue.
    let mut submitted: VecDeque<Entry> = VecDeque::new();
    let mut submitted_by_type = [0usize; QUEUES_PER_CHANNEL];
    let mut submitted_by_queue = vec![0usize; nqueues];

    let mut next = 0;
    let mut queued = 0usize;
    let mut quit = false;
    let mut terminated: Option<ResponseCallback> = None;

    while !quit || queued > 0 || !submitted.is_empty() {
        let event = match rx.recv() {
            Ok(event) => event,
            Err(_) => break,
        };

        match event {
            Event::Request { packet, callback } => {
                if packet.is_empty() {
                    // Termination sentinel: keep going until all buffered
                    // work has completed, then notify the stop method.
                    quit = true;
                    terminated = Some(callback);
                } else {
                    match queue_index(&packet, nqueues) {
                        Ok(None) => {
                            device_queue.push_back((packet, callback));
                            queued += 1;
                        }
                        Ok(Some(index)) => {
                            channel_queue[index].push_back((packet, callback));
                            queued += 1;
                        }
                        Err(e) => callback(Err(e)),
                    }
                }
            }
            Event::Response(result) => {
                // The chip answers in transmit order, so the response
                // belongs to the oldest outstanding request.
                if let Some((request, callback)) = submitted.pop_front() {
                    if let Ok(Some(index)) = queue_index(&request, nqueues) {
                        submitted_by_type[type_index(&request)] -= 1;
                        submitted_by_queue[index] -= 1;
                    }
                    callback(result);
                } else {
                    warn!("received a response with no outstanding request");
                }
            }
            Event::LinkLost { reason } => {
                // Nothing outstanding will ever be answered; same fatal
                // treatment as a failed write.
                error!("device link lost: {reason}; scheduler terminating");
                abort(
                    || DriverError::link_lost(reason.as_str()),
                    device_queue,
                    channel_queue,
                    submitted,
                    terminated,
                );
                return;
            }
        }

        // Drain the device queue first: device-wide control requests go out
        // as soon as the input buffer has room.
        loop {
            let admissible = match device_queue.front() {
                Some((packet, _)) => can_send(
                    packet,
                    nqueues,
                    channels,
                    submitted.len(),
                    &submitted_by_type,
                    &submitted_by_queue,
                ),
                None => false,
            };
            if !admissible {
                break;
            }
            let Some((packet, callback)) = device_queue.pop_front() else {
                break;
            };
            if let Err(e) = device.send(packet.as_bytes()) {
                let reason = e.to_string();
                error!("device send failed: {reason}; scheduler terminating");
                callback(Err(DriverError::send_failed(reason.as_str())));
                abort(
                    || DriverError::send_failed(reason.as_str()),
                    device_queue,
                    channel_queue,
                    submitted,
                    terminated,
                );
                return;
            }
            // Device-wide packets count toward the total in-flight bound
            // only.
            submitted.push_back((packet, callback));
            queued -= 1;
        }

        // Round-robin over the channel queues, one packet per queue per
        // pass, restarting the scan after every successful send so the
        // scheduler never idles while admissible work exists.
        let mut pass = 0;
        while pass < nqueues && queued > 0 {
            let index = next;
            next = (next + 1) % nqueues;

            let admissible = match channel_queue[index].front() {
                Some((packet, _)) => can_send(
                    packet,
                    nqueues,
                    channels,
                    submitted.len(),
                    &submitted_by_type,
                    &submitted_by_queue,
                ),
                None => false,
            };
            if !admissible {
                pass += 1;
                continue;
            }
            let Some((packet, callback)) = channel_queue[index].pop_front() else {
                pass += 1;
                continue;
            };
            if let Err(e) = device.send(packet.as_bytes()) {
                let reason = e.to_string();
                error!("device send failed: {reason}; scheduler terminating");
                callback(Err(DriverError::send_failed(reason.as_str())));
                abort(
                    || DriverError::send_failed(reason.as_str()),
                    device_queue,
                    channel_queue,
                    submitted,
                    terminated,
                );
                return;
            }
            submitted_by_type[type_index(&packet)] += 1;
            if let Ok(Some(queue)) = queue_index(&packet, nqueues) {
                submitted_by_queue[queue] += 1;
            }
            submitted.push_back((packet, callback));
            queued -= 1;
            pass = 1;
        }
    }

    if let Some(callback) = terminated {
        callback(Ok(Packet::default()));
    }
}

/// The transport is unrecoverably gone (failed write or lost link):
/// resolve every queued and outstanding request with the error and
/// terminate the scheduling thread. Later submissions fail immediately
/// because the event channel is closed.
fn abort(
    make: impl Fn() -> DriverError,
    device_queue: VecDeque<Entry>,
    channel_queue: Vec<VecDeque<Entry>>,
    submitted: VecDeque<Entry>,
    terminated: Option<ResponseCallback>,
) {
    for (_, callback) in submitted {
        callback(Err(make()));
    }
    for (_, callback) in device_queue {
        callback(Err(make()));
    }
    for queue in channel_queue {
        for (_, callback) in queue {
            callback(Err(make()));
        }
    }
    if let Some(callback) = terminated {
        callback(Err(make()));
    }
}
