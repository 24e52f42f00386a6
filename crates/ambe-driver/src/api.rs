//! Typed request/response facade over a device and its scheduler.
//!
//! Each operation builds a packet, submits it, awaits the response, and
//! validates the echoed status fields. The facade is stateful because the
//! chip's wire format has modes: whether packets carry parity fields
//! changes with resets and `PARITYMODE` requests, and the device's parity
//! flag must track the chip at all times.

use std::sync::Arc;

use ambe_proto::{field, AudioFrame, ModeFlags, Packet, PacketType, Rate};
use crossbeam_channel::bounded;
use tracing::debug;

use crate::device::{Device, DeviceEvent};
use crate::error::{DriverError, Result};
use crate::scheduler::{Response, Scheduler};

/// Typed API for a vocoder device.
pub struct Api {
    device: Arc<dyn Device>,
    scheduler: Arc<dyn Scheduler>,
    check_parity: bool,
}

impl Api {
    /// Create an API over a started device and scheduler.
    ///
    /// With `check_parity` set, response parity is verified whenever the
    /// chip is in parity mode.
    pub fn new(device: Arc<dyn Device>, scheduler: Arc<dyn Scheduler>, check_parity: bool) -> Self {
        Self {
            device,
            scheduler,
            check_parity,
        }
    }

    /// Reset the chip and restore its power-up parity mode.
    ///
    /// A soft reset first writes 350 groups of ten zero bytes to terminate
    /// any half-written packet, then submits `RESET` and waits for `READY`.
    /// A hard reset uses the device's hardware reset capability instead and
    /// resumes on `READY`.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Unsupported`] if the device lacks the needed
    /// transport shape or reset capability.
    pub fn reset(&self, hard: bool) -> Result<()> {
        if hard {
            self.hard_reset()?;
        } else {
            self.soft_reset()?;
        }
        // The chip reverts to its power-up parity mode after any reset.
        self.device.set_uses_parity(true);
        Ok(())
    }

    fn hard_reset(&self) -> Result<()> {
        let fifo = self
            .device
            .as_fifo()
            .ok_or_else(|| DriverError::unsupported("hard reset over a non-FIFO transport"))?;
        let resettable = self
            .device
            .as_hard_resettable()
            .ok_or_else(|| DriverError::unsupported("hardware reset"))?;

        debug!("hard resetting device");

        // Swap in a callback that discards everything except READY, reset
        // the hardware, wait for READY, then restore the previous callback.
        let (tx, rx) = bounded(1);
        let previous = fifo.set_callback(Some(Box::new(move |event| match event {
            DeviceEvent::Packet(bytes) => {
                if is_ready(bytes) {
                    let _ = tx.send(Ok(()));
                }
            }
            DeviceEvent::LinkLost { reason } => {
                let _ = tx.send(Err(DriverError::link_lost(reason)));
            }
        })));

        let result = resettable.hard_reset().and_then(|()| match rx.recv() {
            Ok(signal) => signal,
            Err(_) => Err(DriverError::link_lost(
                "device stopped while waiting for READY",
            )),
        });

        fifo.set_callback(previous);
        result
    }

    fn soft_reset(&self) -> Result<()> {
        let fifo = self
            .device
            .as_fifo()
            .ok_or_else(|| DriverError::unsupported("soft reset over a non-FIFO transport"))?;

        debug!("soft resetting device");

        // Zero bytes terminate any previously sent unfinished packet.
        let zeros = [0u8; 10];
        for _ in 0..350 {
            fifo.send(&zeros)?;
        }

        // RESET always goes out with a parity field so the chip accepts it
        // no matter which mode it is in.
        let mut request = Packet::new(PacketType::Control);
        request.append_field(field::RESET);
        request.finalize(true);

        let response = self.scheduler.submit(request).wait()?;

        // Parity is not checked on READY; the chip starts in an
        // indeterminate mode.
        let payload = expect_control(&response)?;
        if payload.first() != Some(&field::READY) {
            return Err(DriverError::invalid_response("READY expected after reset"));
        }
        Ok(())
    }

    /// Enable (`mode > 0`) or disable (`mode == 0`) parity fields.
    ///
    /// Output packets switch format beginning with the response to this
    /// request, so the device's parity flag is flipped before the request
    /// is submitted. Must not be issued concurrently with other requests.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::ChipCommandFailed`] on a non-zero status.
    pub fn parity_mode(&self, mode: u8) -> Result<()> {
        let uses_parity = mode > 0;

        let mut request = Packet::new(PacketType::Control);
        request.append_parity_mode(u8::from(uses_parity));
        request.finalize(self.device.uses_parity());

        // Reconfigure before submitting so the response, which is already
        // in the new format, parses correctly.
        self.device.set_uses_parity(uses_parity);

        let response = self.scheduler.submit(request).wait()?;
        self.check_response_parity(&response)?;
        read_status(expect_control(&response)?, 0, field::PARITYMODE, "PARITYMODE")
    }

    /// Configure companding: enable and a-law (as opposed to µ-law).
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::ChipCommandFailed`] on a non-zero status.
    pub fn compand(&self, enabled: bool, alaw: bool) -> Result<()> {
        let mut request = Packet::new(PacketType::Control);
        request.append_compand(enabled, alaw);
        let response = self.roundtrip(request)?;
        read_status(expect_control(&response)?, 0, field::COMPAND, "COMPAND")
    }

    /// Set encoder cmode flags for a channel.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::ChipCommandFailed`] on a non-zero status.
    pub fn ecmode(&self, channel: u8, flags: ModeFlags) -> Result<()> {
        self.set_mode(channel, field::ECMODE, flags, "ECMODE")
    }

    /// Set decoder cmode flags for a channel.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::ChipCommandFailed`] on a non-zero status.
    pub fn dcmode(&self, channel: u8, flags: ModeFlags) -> Result<()> {
        self.set_mode(channel, field::DCMODE, flags, "DCMODE")
    }

    fn set_mode(&self, channel: u8, tag: u8, flags: ModeFlags, command: &str) -> Result<()> {
        let mut request = Packet::new(PacketType::Control);
        request.append_channel(channel)?;
        request.append_mode(tag, flags);
        let response = self.roundtrip(request)?;
        read_status(expect_control(&response)?, 0, tag, command)
    }

    /// Select a rate from the chip's built-in table for a channel.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::ChipCommandFailed`] on a non-zero status.
    pub fn ratet(&self, channel: u8, index: u8) -> Result<()> {
        let mut request = Packet::new(PacketType::Control);
        request.append_channel(channel)?;
        request.append_ratet(index);
        let response = self.roundtrip(request)?;
        let payload = expect_control(&response)?;
        read_channel_status(payload, channel)?;
        read_status(payload, 2, field::RATET, "RATET")
    }

    /// Configure a custom rate for a channel from six rate control words.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::ChipCommandFailed`] on a non-zero status.
    pub fn ratep(&self, channel: u8, rcw: &[u16; 6]) -> Result<()> {
        let mut request = Packet::new(PacketType::Control);
        request.append_channel(channel)?;
        request.append_ratep(rcw);
        let response = self.roundtrip(request)?;
        let payload = expect_control(&response)?;
        read_channel_status(payload, channel)?;
        read_status(payload, 2, field::RATEP, "RATEP")
    }

    /// Configure a channel's rate, dispatching on the rate kind.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::ChipCommandFailed`] on a non-zero status.
    pub fn rate(&self, channel: u8, rate: &Rate) -> Result<()> {
        match rate {
            Rate::Table { index } => self.ratet(channel, *index),
            Rate::Custom { rcw } => self.ratep(channel, rcw),
        }
    }

    /// Initialize a channel's encoder and/or decoder.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::ChipCommandFailed`] on a non-zero status.
    pub fn init(&self, channel: u8, encoder: bool, decoder: bool) -> Result<()> {
        let mut request = Packet::new(PacketType::Control);
        request.append_channel(channel)?;
        request.append_init(encoder, decoder);
        let response = self.roundtrip(request)?;
        let payload = expect_control(&response)?;
        read_channel_status(payload, channel)?;
        read_status(payload, 2, field::INIT, "INIT")
    }

    /// Query the chip's product identification string.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::InvalidResponse`] if the response carries a
    /// different field.
    pub fn prodid(&self) -> Result<String> {
        let mut request = Packet::new(PacketType::Control);
        request.append_field(field::PRODID);
        let response = self.roundtrip(request)?;
        read_cstring(expect_control(&response)?, field::PRODID)
    }

    /// Query the chip's version string.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::InvalidResponse`] if the response carries a
    /// different field.
    pub fn verstring(&self) -> Result<String> {
        let mut request = Packet::new(PacketType::Control);
        request.append_field(field::VERSTRING);
        let response = self.roundtrip(request)?;
        read_cstring(expect_control(&response)?, field::VERSTRING)
    }

    /// Compress one audio frame on a channel.
    ///
    /// Samples must be in the chip's big-endian wire order, see
    /// [`ambe_proto::swap_samples`]. The returned response resolves to a
    /// `CHANNEL` packet carrying the compressed bits.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Proto`] for an invalid channel number.
    pub fn compress(&self, channel: u8, samples: &AudioFrame) -> Result<Response> {
        let mut request = Packet::new(PacketType::Speech);
        request.append_channel(channel)?;
        request.append_spchd(samples)?;
        request.finalize(self.device.uses_parity());
        Ok(self.scheduler.submit(request))
    }

    /// Decompress one frame of bits on a channel.
    ///
    /// The returned response resolves to a `SPEECH` packet carrying the
    /// decoded samples in wire order.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Proto`] for an invalid channel number or a
    /// bit count the buffer cannot cover.
    pub fn decompress(&self, channel: u8, bits: &[u8], bit_count: usize) -> Result<Response> {
        let mut request = Packet::new(PacketType::Channel);
        request.append_channel(channel)?;
        request.append_chand(bits, bit_count)?;
        request.finalize(self.device.uses_parity());
        Ok(self.scheduler.submit(request))
    }

    /// Finalize for the current parity mode, submit, await, verify parity.
    fn roundtrip(&self, mut request: Packet) -> Result<Packet> {
        request.finalize(self.device.uses_parity());
        let response = self.scheduler.submit(request).wait()?;
        self.check_response_parity(&response)?;
        Ok(response)
    }

    fn check_response_parity(&self, response: &Packet) -> Result<()> {
        if self.check_parity && self.device.uses_parity() {
            response.verify_parity()?;
        }
        Ok(())
    }
}

/// Whether a raw buffer is a READY packet. Parity is never checked here;
/// READY arrives while the chip's mode is indeterminate.
fn is_ready(bytes: Vec<u8>) -> bool {
    Packet::parse(bytes, true, false)
        .map(|packet| packet.payload().first() == Some(&field::READY))
        .unwrap_or(false)
}

fn expect_control(response: &Packet) -> Result<&[u8]> {
    if response.kind() != PacketType::Control {
        return Err(DriverError::invalid_response("control response expected"));
    }
    Ok(response.payload())
}

/// Validate a two-byte status field at `offset`: the echoed request tag
/// followed by a status byte, zero on success.
fn read_status(payload: &[u8], offset: usize, tag: u8, command: &str) -> Result<()> {
    if payload.get(offset) != Some(&tag) {
        return Err(DriverError::invalid_response(format!(
            "{command}: expected status field 0x{tag:02x}"
        )));
    }
    let status = *payload
        .get(offset + 1)
        .ok_or_else(|| DriverError::invalid_response(format!("{command}: truncated status")))?;
    if status != 0 {
        return Err(DriverError::ChipCommandFailed {
            command: command.to_string(),
            status,
        });
    }
    Ok(())
}

/// Validate the channel status prefix of a channel-scoped response.
///
/// Multi-channel chips acknowledge the channel-select field itself with a
/// status field before the status of the actual command.
fn read_channel_status(payload: &[u8], channel: u8) -> Result<()> {
    if payload.first() != Some(&field::channel_tag(channel)) {
        return Err(DriverError::invalid_response(
            "response for the wrong channel",
        ));
    }
    let status = *payload.get(1).ok_or_else(|| {
        DriverError::invalid_response("truncated channel status")
    })?;
    if status != 0 {
        return Err(DriverError::ChipCommandFailed {
            command: format!("channel {channel} select"),
            status,
        });
    }
    Ok(())
}

fn read_cstring(payload: &[u8], tag: u8) -> Result<String> {
    if payload.first() != Some(&tag) {
        return Err(DriverError::invalid_response(format!(
            "expected string field 0x{tag:02x}"
        )));
    }
    let body = &payload[1..];
    let end = body.iter().position(|&b| b == 0).unwrap_or(body.len());
    Ok(String::from_utf8_lossy(&body[..end]).into_owned())
}
