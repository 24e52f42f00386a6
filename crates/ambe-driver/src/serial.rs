//! UART (RS-232) attached vocoder dongles.
//!
//! All USB dongle variants contain an FT232-class USB-to-serial bridge; the
//! chip behind it speaks the framed packet protocol at a fixed baud rate
//! with hardware flow control. Packets are read on a dedicated thread and
//! handed to the callback installed by the scheduler.

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use ambe_proto::{HEADER_LEN, START_BYTE};
use rustix::fd::BorrowedFd;
use rustix::fs::{fcntl_lock, FlockOperation};
use rustix::io::Errno;
use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits, TTYPort};
use std::os::unix::io::AsRawFd;
use tracing::{error, info, warn};

use crate::device::{Device, DeviceEvent, FifoCallback, FifoDevice, HardResettable, ParityFlag};
use crate::error::{DriverError, Result};

/// How often the reader thread checks the stop flag while idle.
const READ_POLL: Duration = Duration::from_millis(50);

/// Length of the BREAK pulse used for hardware reset.
const BREAK_PULSE: Duration = Duration::from_millis(250);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A vocoder dongle on a serial port.
///
/// This is the common implementation behind the concrete dongle types
/// [`Usb3003`] and [`Usb3000`]: raw 8N1 with hardware flow control, an
/// exclusive lock on the device file, the Linux low-latency receive mode,
/// and a reader thread that frames incoming bytes into packets.
pub struct SerialDevice {
    path: String,
    baud: u32,
    channels: usize,
    writer: Mutex<Option<TTYPort>>,
    callback: Arc<Mutex<Option<FifoCallback>>>,
    running: Arc<AtomicBool>,
    reader: Mutex<Option<JoinHandle<()>>>,
    parity: ParityFlag,
}

impl SerialDevice {
    /// Create a device for the serial port at `path`.
    ///
    /// Nothing is opened until [`Device::start`].
    pub fn new(path: impl Into<String>, baud: u32, channels: usize) -> Self {
        Self {
            path: path.into(),
            baud,
            channels,
            writer: Mutex::new(None),
            callback: Arc::new(Mutex::new(None)),
            running: Arc::new(AtomicBool::new(false)),
            reader: Mutex::new(None),
            parity: ParityFlag::default(),
        }
    }

    /// Pulse a BREAK on the line.
    ///
    /// Dongles that support hardware reset restart the chip when they see
    /// a BREAK; the chip then announces itself with a READY packet.
    fn send_break(&self) -> Result<()> {
        let mut guard = lock(&self.writer);
        let Some(port) = guard.as_mut() else {
            return Err(DriverError::invalid_state("device not started"));
        };
        port.clear(ClearBuffer::All)?;
        port.set_break()?;
        thread::sleep(BREAK_PULSE);
        port.clear_break()?;
        Ok(())
    }
}

impl Device for SerialDevice {
    fn start(&self) -> Result<()> {
        let mut writer = lock(&self.writer);
        if writer.is_some() {
            return Err(DriverError::invalid_state("device already started"));
        }

        info!("opening serial port {} (baud rate {})", self.path, self.baud);

        let mut port = serialport::new(self.path.as_str(), self.baud)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::Hardware)
            .timeout(READ_POLL)
            .open_native()?;

        port.set_exclusive(true)?;
        lock_device_file(&port, &self.path)?;
        low_latency::set(&port, true)?;

        // Discard whatever sits in the buffers before the reader starts.
        // USB-to-serial bridges need a moment before the flush takes
        // effect; there is no bullet-proof way to flush them (see kernel
        // bug 5730).
        thread::sleep(Duration::from_millis(1));
        port.clear(ClearBuffer::All)?;

        let reader_port = port.try_clone_native()?;
        self.running.store(true, Ordering::SeqCst);

        let callback = Arc::clone(&self.callback);
        let running = Arc::clone(&self.running);
        let path = self.path.clone();
        let handle = thread::Builder::new()
            .name("ambe-serial-rx".into())
            .spawn(move || read_loop(reader_port, &callback, &running, &path))?;

        *lock(&self.reader) = Some(handle);
        *writer = Some(port);
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = lock(&self.reader).take() {
            let _ = handle.join();
        }
        if let Some(port) = lock(&self.writer).take() {
            if let Err(e) = low_latency::set(&port, false) {
                warn!("failed to restore latency mode on {}: {e}", self.path);
            }
        }
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
}

impl FifoDevice for SerialDevice {
    fn send(&self, packet: &[u8]) -> Result<()> {
        let mut guard = lock(&self.writer);
        let Some(port) = guard.as_mut() else {
            return Err(DriverError::invalid_state("device not started"));
        };
        port.write_all(packet)
            .map_err(|e| DriverError::send_failed(format!("write to {}: {e}", self.path)))
    }

    fn set_callback(&self, callback: Option<FifoCallback>) -> Option<FifoCallback> {
        std::mem::replace(&mut *lock(&self.callback), callback)
    }
}

/// Hold an advisory write lock on the device file so that cooperating
/// processes do not open the same dongle.
fn lock_device_file(port: &TTYPort, path: &str) -> Result<()> {
    // SAFETY: the fd is valid for the lifetime of the borrowed port.
    let fd = unsafe { BorrowedFd::borrow_raw(port.as_raw_fd()) };
    fcntl_lock(fd, FlockOperation::NonBlockingLockExclusive).map_err(|e| match e {
        Errno::AGAIN | Errno::ACCESS => DriverError::DeviceBusy {
            path: path.to_string(),
        },
        other => DriverError::Io {
            source: other.into(),
        },
    })
}

fn read_loop(
    mut port: TTYPort,
    callback: &Mutex<Option<FifoCallback>>,
    running: &AtomicBool,
    path: &str,
) {
    loop {
        match read_packet(&mut port, running) {
            Ok(Some(buffer)) => {
                if let Some(cb) = lock(callback).as_mut() {
                    cb(DeviceEvent::Packet(buffer));
                }
            }
            // Stop was requested; exit cleanly.
            Ok(None) => return,
            Err(e) => {
                // Anything but a requested stop is link loss; tell the
                // subscriber so in-flight requests do not wait forever.
                if running.load(Ordering::SeqCst) {
                    error!("[{path}] serial link lost: {e}");
                    if let Some(cb) = lock(callback).as_mut() {
                        cb(DeviceEvent::LinkLost {
                            reason: format!("serial port {path}: {e}"),
                        });
                    }
                }
                return;
            }
        }
    }
}

/// Read one complete packet: scan byte by byte for the start byte, read the
/// rest of the fixed-size header, then read the number of payload bytes the
/// header announces. Returns `None` when stop was requested.
fn read_packet(port: &mut TTYPort, running: &AtomicBool) -> io::Result<Option<Vec<u8>>> {
    let mut byte = [0u8; 1];
    loop {
        if !read_exact_cancellable(port, &mut byte, running)? {
            return Ok(None);
        }
        if byte[0] == START_BYTE {
            break;
        }
    }

    let mut header = [0u8; HEADER_LEN - 1];
    if !read_exact_cancellable(port, &mut header, running)? {
        return Ok(None);
    }
    let length = usize::from(u16::from_be_bytes([header[0], header[1]]));

    let mut buffer = vec![0u8; HEADER_LEN + length];
    buffer[0] = START_BYTE;
    buffer[1..HEADER_LEN].copy_from_slice(&header);
    if !read_exact_cancellable(port, &mut buffer[HEADER_LEN..], running)? {
        return Ok(None);
    }
    Ok(Some(buffer))
}

/// Fill `buf`, polling the stop flag on every read timeout. Returns `false`
/// when stop was requested before the buffer filled.
fn read_exact_cancellable(
    port: &mut TTYPort,
    buf: &mut [u8],
    running: &AtomicBool,
) -> io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        if !running.load(Ordering::SeqCst) {
            return Ok(false);
        }
        match port.read(&mut buf[filled..]) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "serial port closed",
                ))
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::TimedOut => continue,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

/// Driver for three-channel USB dongles.
///
/// Each device provides three independent channels, and the chip can be
/// hardware reset by signalling a BREAK on the serial line.
pub struct Usb3003 {
    inner: SerialDevice,
}

impl Usb3003 {
    /// Fixed baud rate of the dongle's USB-to-serial bridge.
    pub const BAUD_RATE: u32 = 921_600;

    /// Create a driver for the dongle at `path`.
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            inner: SerialDevice::new(path, Self::BAUD_RATE, 3),
        }
    }
}

impl Device for Usb3003 {
    fn start(&self) -> Result<()> {
        self.inner.start()
    }

    fn stop(&self) -> Result<()> {
        self.inner.stop()
    }

    fn channels(&self) -> usize {
        self.inner.channels()
    }

    fn uses_parity(&self) -> bool {
        self.inner.uses_parity()
    }

    fn set_uses_parity(&self, uses_parity: bool) {
        self.inner.set_uses_parity(uses_parity);
    }

    fn as_fifo(&self) -> Option<&dyn FifoDevice> {
        Some(self)
    }

    fn as_hard_resettable(&self) -> Option<&dyn HardResettable> {
        Some(self)
    }
}

impl FifoDevice for Usb3003 {
    fn send(&self, packet: &[u8]) -> Result<()> {
        self.inner.send(packet)
    }

    fn set_callback(&self, callback: Option<FifoCallback>) -> Option<FifoCallback> {
        self.inner.set_callback(callback)
    }
}

impl HardResettable for Usb3003 {
    fn hard_reset(&self) -> Result<()> {
        self.inner.send_break()
    }
}

/// Driver for single-channel USB dongles.
///
/// Provides one channel and no hardware reset.
pub struct Usb3000 {
    inner: SerialDevice,
}

impl Usb3000 {
    /// Fixed baud rate of the dongle's USB-to-serial bridge.
    pub const BAUD_RATE: u32 = 460_800;

    /// Create a driver for the dongle at `path`.
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            inner: SerialDevice::new(path, Self::BAUD_RATE, 1),
        }
    }
}

impl Device for Usb3000 {
    fn start(&self) -> Result<()> {
        self.inner.start()
    }

    fn stop(&self) -> Result<()> {
        self.inner.stop()
    }

    fn channels(&self) -> usize {
        self.inner.channels()
    }

    fn uses_parity(&self) -> bool {
        self.inner.uses_parity()
    }

    fn set_uses_parity(&self, uses_parity: bool) {
        self.inner.set_uses_parity(uses_parity);
    }

    fn as_fifo(&self) -> Option<&dyn FifoDevice> {
        Some(self)
    }
}

impl FifoDevice for Usb3000 {
    fn send(&self, packet: &[u8]) -> Result<()> {
        self.inner.send(packet)
    }

    fn set_callback(&self, callback: Option<FifoCallback>) -> Option<FifoCallback> {
        self.inner.set_callback(callback)
    }
}

#[cfg(target_os = "linux")]
mod low_latency {
    //! The Linux low-latency mode for FT232-class adapters.
    //!
    //! By default the ftdi_sio driver delays received bytes by about 16 ms
    //! to reduce USB load; the low-latency flag drops that to about 1 ms,
    //! which matters for 20 ms audio frames.

    use std::io;
    use std::os::unix::io::AsRawFd;

    const TIOCGSERIAL: libc::c_ulong = 0x541e;
    const TIOCSSERIAL: libc::c_ulong = 0x541f;
    const ASYNC_LOW_LATENCY: libc::c_int = 0x2000;

    /// Mirror of the kernel's `struct serial_struct`.
    #[allow(dead_code)]
    #[repr(C)]
    #[derive(Clone, Copy)]
    struct SerialStruct {
        kind: libc::c_int,
        line: libc::c_int,
        port: libc::c_uint,
        irq: libc::c_int,
        flags: libc::c_int,
        xmit_fifo_size: libc::c_int,
        custom_divisor: libc::c_int,
        baud_base: libc::c_int,
        close_delay: libc::c_ushort,
        io_type: libc::c_char,
        reserved_char: [libc::c_char; 1],
        hub6: libc::c_int,
        closing_wait: libc::c_ushort,
        closing_wait2: libc::c_ushort,
        iomem_base: *mut libc::c_uchar,
        iomem_reg_shift: libc::c_ushort,
        port_high: libc::c_uint,
        iomap_base: libc::c_ulong,
    }

    pub(super) fn set(port: &impl AsRawFd, enabled: bool) -> io::Result<()> {
        let fd = port.as_raw_fd();

        // SAFETY: the fd is an open tty and the struct matches the kernel
        // layout for these ioctls.
        let mut serial: SerialStruct = unsafe { std::mem::zeroed() };
        if unsafe { libc::ioctl(fd, TIOCGSERIAL as _, &mut serial) } < 0 {
            return Err(io::Error::last_os_error());
        }

        if enabled {
            serial.flags |= ASYNC_LOW_LATENCY;
        } else {
            serial.flags &= !ASYNC_LOW_LATENCY;
        }

        if unsafe { libc::ioctl(fd, TIOCSSERIAL as _, &serial) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

#[cfg(not(target_os = "linux"))]
mod low_latency {
    use std::io;
    use std::os::unix::io::AsRawFd;

    pub(super) fn set(_port: &impl AsRawFd, _enabled: bool) -> io::Result<()> {
        Ok(())
    }
}
