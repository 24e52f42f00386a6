//! C ABI for external consumers of the vocoder driver.
//!
//! Four plain-C symbols: `ambe_open`, `ambe_close`, `ambe_compress`, and
//! `ambe_decompress`. A handle owns one gateway connection with one
//! assigned chip channel; see `include/ambe.h` for the C prototypes.
//!
//! Data functions return 0 on success and a negative code on failure; a
//! request that misses its deadline keeps running in the background and
//! only the caller's wait is abandoned.
//!
//! Samples cross this boundary in host (little-endian) order; the
//! conversion to the chip's wire order happens inside.

#![allow(clippy::missing_safety_doc)]

use std::ffi::CStr;
use std::os::raw::{c_char, c_int};
use std::sync::Arc;
use std::time::Duration;

use ambe_driver::{
    Api, Device, DriverError, FifoScheduler, RpcDevice, Scheduler, Uri, UriKind,
};
use ambe_proto::{swap_samples, AmbeFrame, Rate, FRAME_SAMPLES};
use tracing::error;

/// Success.
pub const AMBE_OK: c_int = 0;
/// The response did not arrive within the configured deadline.
pub const AMBE_ERR_DEADLINE: c_int = -1;
/// A null pointer, bad buffer size, or invalid parameter.
pub const AMBE_ERR_ARGUMENT: c_int = -2;
/// The device reported an error.
pub const AMBE_ERR_INTERNAL: c_int = -3;

/// Opaque handle to one gateway connection.
pub struct AmbeHandle {
    device: Arc<RpcDevice>,
    scheduler: Arc<FifoScheduler>,
    api: Api,
    channel: u8,
    deadline: Duration,
}

/// Open a device, configure its rate, and return a handle.
///
/// Only `grpc:` URIs are supported here; directly attached dongles need
/// the richer Rust API. Returns null on failure.
///
/// # Safety
///
/// `uri` and `rate` must be valid null-terminated C strings.
#[no_mangle]
pub unsafe extern "C" fn ambe_open(
    uri: *const c_char,
    rate: *const c_char,
    deadline_ms: c_int,
) -> *mut AmbeHandle {
    if uri.is_null() || rate.is_null() || deadline_ms < 0 {
        return std::ptr::null_mut();
    }
    let Ok(uri) = CStr::from_ptr(uri).to_str() else {
        return std::ptr::null_mut();
    };
    let Ok(rate) = CStr::from_ptr(rate).to_str() else {
        return std::ptr::null_mut();
    };

    match open(uri, rate, Duration::from_millis(deadline_ms as u64)) {
        Ok(handle) => Box::into_raw(Box::new(handle)),
        Err(e) => {
            error!("ambe_open failed: {e}");
            std::ptr::null_mut()
        }
    }
}

fn open(uri: &str, rate: &str, deadline: Duration) -> Result<AmbeHandle, DriverError> {
    let uri: Uri = uri.parse()?;
    if uri.kind != UriKind::Rpc {
        return Err(DriverError::Unsupported {
            operation: "only grpc devices are supported here".to_string(),
        });
    }
    let rate: Rate = rate.parse::<Rate>()?;

    let device = Arc::new(RpcDevice::new(uri.authority));
    let scheduler = Arc::new(FifoScheduler::new(device.clone()));
    device.start()?;
    if let Err(e) = scheduler.start() {
        let _ = device.stop();
        return Err(e);
    }

    let api = Api::new(device.clone(), scheduler.clone(), true);
    let channel = device.assigned_channel();
    let configured = api.rate(channel, &rate).and_then(|()| api.init(channel, true, true));
    if let Err(e) = configured {
        let _ = scheduler.stop();
        let _ = device.stop();
        return Err(e);
    }

    Ok(AmbeHandle {
        device,
        scheduler,
        api,
        channel,
        deadline,
    })
}

/// Close a handle opened with [`ambe_open`]. Waits for requests submitted
/// before the close to complete.
///
/// # Safety
///
/// `handle` must be null or a pointer returned by [`ambe_open`] that has
/// not been closed yet.
#[no_mangle]
pub unsafe extern "C" fn ambe_close(handle: *mut AmbeHandle) {
    if handle.is_null() {
        return;
    }
    let handle = Box::from_raw(handle);
    if let Err(e) = handle.scheduler.stop() {
        error!("ambe_close: scheduler stop failed: {e}");
    }
    if let Err(e) = handle.device.stop() {
        error!("ambe_close: device stop failed: {e}");
    }
}

/// Compress one 160-sample frame.
///
/// On entry `*bit_count` is the capacity of `bits` in bits; on success it
/// holds the number of compressed bits written.
///
/// # Safety
///
/// `bits` must point to at least `ceil(*bit_count / 8)` writable bytes,
/// `bit_count` must be a valid pointer, `handle` must be a live handle,
/// and `samples` must point to `sample_count` readable samples.
#[no_mangle]
pub unsafe extern "C" fn ambe_compress(
    bits: *mut u8,
    bit_count: *mut usize,
    handle: *mut AmbeHandle,
    samples: *const i16,
    sample_count: usize,
) -> c_int {
    if bits.is_null() || bit_count.is_null() || handle.is_null() || samples.is_null() {
        return AMBE_ERR_ARGUMENT;
    }
    if sample_count != FRAME_SAMPLES {
        error!("ambe_compress: only {FRAME_SAMPLES}-sample frames are supported");
        return AMBE_ERR_ARGUMENT;
    }
    let handle = &*handle;

    let mut frame = [0i16; FRAME_SAMPLES];
    swap_samples(&mut frame, std::slice::from_raw_parts(samples, sample_count));

    let response = match handle.api.compress(handle.channel, &frame) {
        Ok(response) => response,
        Err(e) => {
            error!("ambe_compress: {e}");
            return AMBE_ERR_INTERNAL;
        }
    };
    let packet = match response.wait_timeout(handle.deadline) {
        Ok(packet) => packet,
        Err(DriverError::DeadlineExceeded { .. }) => return AMBE_ERR_DEADLINE,
        Err(e) => {
            error!("ambe_compress: {e}");
            return AMBE_ERR_INTERNAL;
        }
    };

    let (data, count) = match packet.bits() {
        Ok(bits) => bits,
        Err(e) => {
            error!("ambe_compress: {e}");
            return AMBE_ERR_INTERNAL;
        }
    };
    if *bit_count < count {
        error!("ambe_compress: destination buffer too small for {count} bits");
        return AMBE_ERR_ARGUMENT;
    }
    std::ptr::copy_nonoverlapping(data.as_ptr(), bits, AmbeFrame::byte_len(count));
    *bit_count = count;
    AMBE_OK
}

/// Decompress one frame of bits into 160 samples.
///
/// On entry `*sample_count` is the capacity of `samples`; on success it
/// holds the number of samples written.
///
/// # Safety
///
/// `samples` must point to `*sample_count` writable samples,
/// `sample_count` must be a valid pointer, `handle` must be a live handle,
/// and `bits` must point to `ceil(bit_count / 8)` readable bytes.
#[no_mangle]
pub unsafe extern "C" fn ambe_decompress(
    samples: *mut i16,
    sample_count: *mut usize,
    handle: *mut AmbeHandle,
    bits: *const u8,
    bit_count: usize,
) -> c_int {
    if samples.is_null() || sample_count.is_null() || handle.is_null() || bits.is_null() {
        return AMBE_ERR_ARGUMENT;
    }
    let handle = &*handle;
    let bits = std::slice::from_raw_parts(bits, AmbeFrame::byte_len(bit_count));

    let response = match handle.api.decompress(handle.channel, bits, bit_count) {
        Ok(response) => response,
        Err(e) => {
            error!("ambe_decompress: {e}");
            return AMBE_ERR_INTERNAL;
        }
    };
    let packet = match response.wait_timeout(handle.deadline) {
        Ok(packet) => packet,
        Err(DriverError::DeadlineExceeded { .. }) => return AMBE_ERR_DEADLINE,
        Err(e) => {
            error!("ambe_decompress: {e}");
            return AMBE_ERR_INTERNAL;
        }
    };

    let decoded = match packet.samples() {
        Ok(decoded) => decoded,
        Err(e) => {
            error!("ambe_decompress: {e}");
            return AMBE_ERR_INTERNAL;
        }
    };
    if *sample_count < decoded.len() {
        error!(
            "ambe_decompress: destination buffer too small for {} samples",
            decoded.len()
        );
        return AMBE_ERR_ARGUMENT;
    }
    let out = std::slice::from_raw_parts_mut(samples, decoded.len());
    swap_samples(out, &decoded);
    *sample_count = decoded.len();
    AMBE_OK
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;

    #[test]
    fn open_rejects_bad_arguments() {
        let uri = CString::new("usb:/dev/ttyUSB0").unwrap();
        let rate = CString::new("33").unwrap();

        // Null pointers and non-gateway URIs yield a null handle.
        unsafe {
            assert!(ambe_open(std::ptr::null(), rate.as_ptr(), 100).is_null());
            assert!(ambe_open(uri.as_ptr(), std::ptr::null(), 100).is_null());
            assert!(ambe_open(uri.as_ptr(), rate.as_ptr(), -1).is_null());
            assert!(ambe_open(uri.as_ptr(), rate.as_ptr(), 100).is_null());
        }
    }

    #[test]
    fn data_calls_reject_null_handles() {
        let mut bits = [0u8; 32];
        let mut bit_count = 256usize;
        let samples = [0i16; 160];
        let mut out = [0i16; 160];
        let mut out_count = 160usize;

        unsafe {
            assert_eq!(
                ambe_compress(
                    bits.as_mut_ptr(),
                    &mut bit_count,
                    std::ptr::null_mut(),
                    samples.as_ptr(),
                    160
                ),
                AMBE_ERR_ARGUMENT
            );
            assert_eq!(
                ambe_decompress(
                    out.as_mut_ptr(),
                    &mut out_count,
                    std::ptr::null_mut(),
                    bits.as_ptr(),
                    88
                ),
                AMBE_ERR_ARGUMENT
            );
        }
    }
}
