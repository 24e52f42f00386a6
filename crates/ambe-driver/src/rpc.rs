//! Remote vocoder gateway: stream protocol, client device, and server.
//!
//! A gateway process owns a local dongle and serves its channels to remote
//! clients over TCP. Each connection is one bidirectional stream of framed
//! messages; the server assigns the client a channel in the handshake and
//! echoes the client-chosen tag with every response, because requests from
//! several clients are interleaved on the chip and responses do not come
//! back in any one client's submission order.
//!
//! ```text
//! frame  = kind:u8  tag:i32be  len:u16be  payload[len]
//! kind   = 0 HELLO    server → client: channel:u8, uses_parity:u8
//!          1 PACKET   both ways: one chip-framed packet, tag echoed
//!          2 PING     both ways: payload echoed verbatim
//!          3 REFUSED  server → client instead of HELLO: UTF-8 reason
//! ```

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use ambe_proto::Packet;
use tracing::{error, info, warn};

use crate::device::{Device, DeviceEvent, ParityFlag, TaggedCallback, TaggingDevice};
use crate::error::{DriverError, Result};
use crate::manager::DeviceManager;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Frame codec for the gateway stream.
pub mod wire {
    use super::{io, Read, Write};

    /// Server greeting carrying the assigned channel and parity mode.
    pub const HELLO: u8 = 0;
    /// A tagged chip packet, in either direction.
    pub const PACKET: u8 = 1;
    /// Liveness echo.
    pub const PING: u8 = 2;
    /// Admission failure, sent instead of `HELLO`.
    pub const REFUSED: u8 = 3;

    /// Write one frame.
    pub fn write_frame(w: &mut impl Write, kind: u8, tag: i32, payload: &[u8]) -> io::Result<()> {
        debug_assert!(payload.len() <= usize::from(u16::MAX));
        let mut frame = Vec::with_capacity(7 + payload.len());
        frame.push(kind);
        frame.extend_from_slice(&tag.to_be_bytes());
        frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        frame.extend_from_slice(payload);
        w.write_all(&frame)
    }

    /// Read one frame; `None` on a clean end of stream.
    pub fn read_frame(r: &mut impl Read) -> io::Result<Option<(u8, i32, Vec<u8>)>> {
        let mut kind = [0u8; 1];
        loop {
            match r.read(&mut kind) {
                Ok(0) => return Ok(None),
                Ok(_) => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        let mut rest = [0u8; 6];
        r.read_exact(&mut rest)?;
        let tag = i32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]);
        let len = usize::from(u16::from_be_bytes([rest[4], rest[5]]));

        let mut payload = vec![0u8; len];
        r.read_exact(&mut payload)?;
        Ok(Some((kind[0], tag, payload)))
    }
}

/// A remote vocoder channel served by a gateway.
///
/// The gateway assigns one chip channel per connection, so the device
/// always reports a single channel; [`RpcDevice::assigned_channel`] tells
/// which chip channel requests should address.
pub struct RpcDevice {
    authority: String,
    stream: Mutex<Option<TcpStream>>,
    callback: Arc<Mutex<Option<TaggedCallback>>>,
    terminating: Arc<AtomicBool>,
    reader: Mutex<Option<JoinHandle<()>>>,
    channel: AtomicU8,
    parity: ParityFlag,
}

impl RpcDevice {
    /// Create a client for the gateway at `authority` (`host:port`).
    pub fn new(authority: impl Into<String>) -> Self {
        Self {
            authority: authority.into(),
            stream: Mutex::new(None),
            callback: Arc::new(Mutex::new(None)),
            terminating: Arc::new(AtomicBool::new(false)),
            reader: Mutex::new(None),
            channel: AtomicU8::new(0),
            parity: ParityFlag::default(),
        }
    }

    /// The chip channel the gateway assigned in the handshake.
    pub fn assigned_channel(&self) -> u8 {
        self.channel.load(Ordering::Relaxed)
    }
}

impl Device for RpcDevice {
    fn start(&self) -> Result<()> {
        let mut slot = lock(&self.stream);
        if slot.is_some() {
            return Err(DriverError::invalid_state("device already started"));
        }

        info!("connecting to vocoder gateway at {}", self.authority);
        let stream = TcpStream::connect(self.authority.as_str())?;

        let mut reader = &stream;
        match wire::read_frame(&mut reader)? {
            Some((wire::HELLO, _, payload)) if payload.len() >= 2 => {
                self.channel.store(payload[0], Ordering::Relaxed);
                self.parity.set(payload[1] != 0);
                info!(
                    "gateway assigned channel {} (parity {})",
                    payload[0],
                    payload[1] != 0
                );
            }
            Some((wire::REFUSED, _, payload)) => {
                let reason = String::from_utf8_lossy(&payload).into_owned();
                return Err(if reason == DriverError::NoChannelsLeft.to_string() {
                    DriverError::NoChannelsLeft
                } else {
                    DriverError::link_lost(reason)
                });
            }
            _ => return Err(DriverError::link_lost("gateway handshake failed")),
        }

        self.terminating.store(false, Ordering::SeqCst);
        let reader_stream = stream.try_clone()?;
        let callback = Arc::clone(&self.callback);
        let terminating = Arc::clone(&self.terminating);
        let authority = self.authority.clone();
        let handle = thread::Builder::new()
            .name("ambe-gateway-rx".into())
            .spawn(move || read_loop(reader_stream, &callback, &terminating, &authority))?;

        *lock(&self.reader) = Some(handle);
        *slot = Some(stream);
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        self.terminating.store(true, Ordering::SeqCst);

        // Closing the outbound side tells the gateway we are done; it
        // releases the channel and closes its end, which lets the reader
        // run to a clean end of stream.
        if let Some(stream) = lock(&self.stream).take() {
            let _ = stream.shutdown(Shutdown::Write);
        }
        if let Some(handle) = lock(&self.reader).take() {
            let _ = handle.join();
        }
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

impl TaggingDevice for RpcDevice {
    fn send(&self, tag: i32, packet: &[u8]) -> Result<()> {
        let mut guard = lock(&self.stream);
        let Some(stream) = guard.as_mut() else {
            return Err(DriverError::invalid_state("device not started"));
        };
        wire::write_frame(stream, wire::PACKET, tag, packet)
            .map_err(|e| DriverError::send_failed(format!("write to {}: {e}", self.authority)))
    }

    fn set_callback(&self, callback: Option<TaggedCallback>) -> Option<TaggedCallback> {
        std::mem::replace(&mut *lock(&self.callback), callback)
    }
}

fn read_loop(
    mut stream: TcpStream,
    callback: &Mutex<Option<TaggedCallback>>,
    terminating: &AtomicBool,
    authority: &str,
) {
    loop {
        match wire::read_frame(&mut stream) {
            Ok(Some((wire::PACKET, tag, payload))) => {
                if let Some(cb) = lock(callback).as_mut() {
                    cb(DeviceEvent::Packet((tag, payload)));
                }
            }
            Ok(Some((wire::PING, ..))) => {}
            Ok(Some((kind, ..))) => warn!("[{authority}] unexpected frame kind {kind}"),
            Ok(None) => break,
            Err(e) => {
                if !terminating.load(Ordering::SeqCst) {
                    error!("[{authority}] gateway link lost: {e}");
                    link_lost(callback, format!("gateway {authority}: {e}"));
                }
                return;
            }
        }
    }

    // An end of stream we did not ask for is link loss too. Reconnecting
    // on our own would hand us a different channel; leave the recovery
    // decision to the application.
    if !terminating.load(Ordering::SeqCst) {
        error!("[{authority}] gateway closed the connection");
        link_lost(callback, format!("gateway {authority} closed the connection"));
    }
}

fn link_lost(callback: &Mutex<Option<TaggedCallback>>, reason: String) {
    if let Some(cb) = lock(callback).as_mut() {
        cb(DeviceEvent::LinkLost { reason });
    }
}

/// Accept gateway clients forever.
///
/// Every registered device channel can be bound by one client at a time;
/// each accepted connection is served on its own thread.
///
/// # Errors
///
/// Returns an error if a session thread cannot be spawned.
pub fn serve(listener: TcpListener, manager: Arc<DeviceManager>) -> Result<()> {
    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let manager = Arc::clone(&manager);
                thread::Builder::new()
                    .name("ambe-gateway".into())
                    .spawn(move || {
                        if let Err(e) = handle_client(&stream, &manager) {
                            warn!("client session ended with error: {e}");
                        }
                    })?;
            }
            Err(e) => warn!("accept failed: {e}"),
        }
    }
    Ok(())
}

/// Serve one client connection: admission, handshake, then packet relay.
fn handle_client(stream: &TcpStream, manager: &DeviceManager) -> Result<()> {
    let peer = stream
        .peer_addr()
        .map_or_else(|_| "?".to_string(), |addr| addr.to_string());

    let (id, channel) = match manager.acquire_channel() {
        Ok(slot) => slot,
        Err(e) => {
            warn!("refusing client {peer}: {e}");
            let mut out = stream;
            let _ = wire::write_frame(&mut out, wire::REFUSED, 0, e.to_string().as_bytes());
            return Ok(());
        }
    };

    info!("client {peer} bound to {id} channel {channel}");
    let result = serve_channel(stream, manager, &id, channel);
    manager.release_channel(&id, channel)?;
    info!("client {peer} released {id} channel {channel}");
    result
}

fn serve_channel(
    stream: &TcpStream,
    manager: &DeviceManager,
    id: &str,
    channel: usize,
) -> Result<()> {
    let Some((device, scheduler)) = manager.get(id) else {
        return Err(DriverError::invalid_state(format!("device {id} not found")));
    };

    // Response callbacks run on the scheduler thread and write to the
    // stream concurrently with ping echoes, hence the shared writer.
    let writer = Arc::new(Mutex::new(stream.try_clone()?));

    wire::write_frame(
        &mut *lock(&writer),
        wire::HELLO,
        0,
        &[channel as u8, u8::from(device.uses_parity())],
    )?;

    let mut reader = stream;
    while let Some((kind, tag, payload)) = wire::read_frame(&mut reader)? {
        match kind {
            wire::PACKET => {
                let packet = match Packet::parse(payload, device.uses_parity(), false) {
                    Ok(packet) => packet,
                    Err(e) => {
                        warn!("malformed packet from client {id}/{channel}: {e}");
                        break;
                    }
                };
                let writer = Arc::clone(&writer);
                scheduler.submit_async(
                    packet,
                    Box::new(move |result| {
                        let response = match result {
                            Ok(packet) => packet.as_bytes().to_vec(),
                            Err(e) => {
                                // The frame format has no error variant; an
                                // empty payload tells the client the request
                                // died.
                                error!("gateway request failed: {e}");
                                Vec::new()
                            }
                        };
                        if let Err(e) =
                            wire::write_frame(&mut *lock(&writer), wire::PACKET, tag, &response)
                        {
                            error!("failed to send response to client: {e}");
                        }
                    }),
                );
            }
            wire::PING => {
                wire::write_frame(&mut *lock(&writer), wire::PING, tag, &payload)?;
            }
            other => warn!("unexpected frame kind {other} from client"),
        }
    }
    Ok(())
}
