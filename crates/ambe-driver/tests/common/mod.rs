//! Shared helpers for driver tests.

#![allow(dead_code)]

use std::time::{Duration, Instant};

/// Build a raw wire packet: header, payload, optional parity field.
pub fn frame(kind: u8, payload: &[u8], parity: bool) -> Vec<u8> {
    let extra = if parity { 2 } else { 0 };
    let length = (payload.len() + extra) as u16;

    let mut buf = vec![0x61];
    buf.extend_from_slice(&length.to_be_bytes());
    buf.push(kind);
    buf.extend_from_slice(payload);
    if parity {
        buf.push(0x2f);
        let value = buf[1..].iter().fold(0u8, |acc, byte| acc ^ byte);
        buf.push(value);
    }
    buf
}

/// A CONTROL response with the given payload.
pub fn control_frame(payload: &[u8], parity: bool) -> Vec<u8> {
    frame(0x00, payload, parity)
}

/// Poll `cond` until it holds or the timeout expires.
pub fn wait_until(timeout: Duration, cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    cond()
}
