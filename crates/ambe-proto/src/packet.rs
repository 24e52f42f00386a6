//! Packet framing: header, typed fields, parity.
//!
//! A packet is a contiguous byte buffer laid out as
//! `Header | Field* | ParityField?`. The header is 4 bytes: the start byte
//! `0x61`, a big-endian `u16` payload length (bytes after the header), and
//! the packet type. The optional trailing parity field is two bytes: the
//! `PARITY` tag and the XOR of every packet byte except the start byte and
//! the parity value itself.

use bytes::BufMut;

use crate::error::{ProtoError, Result};
use crate::field;
use crate::frame::AmbeFrame;

/// First byte of every packet on the wire.
pub const START_BYTE: u8 = 0x61;

/// Size of the packet header in bytes.
pub const HEADER_LEN: usize = 4;

/// Size of the trailing parity field in bytes.
const PARITY_LEN: usize = 2;

/// Top-level packet class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    /// Configuration requests and responses for the chip or a channel.
    Control = 0x00,
    /// Compressed (channel) bits.
    Channel = 0x01,
    /// PCM speech samples.
    Speech = 0x02,
}

impl PacketType {
    fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            0x00 => Ok(Self::Control),
            0x01 => Ok(Self::Channel),
            0x02 => Ok(Self::Speech),
            other => Err(ProtoError::malformed(format!(
                "invalid packet type 0x{other:02x}"
            ))),
        }
    }
}

/// Encoder/decoder cmode flags carried by `ECMODE` / `DCMODE` fields.
///
/// The flags are packed into a single byte at bit positions 6, 7, 8, 11,
/// 12, and 14. Positions 8 and above fall outside an 8-bit value and are
/// truncated to zero on the wire; the layout is preserved byte-exactly
/// because changing it would need validation against real hardware.
#[derive(Debug, Clone, Copy, Default)]
pub struct ModeFlags {
    /// Noise suppression enable.
    pub ns_e: bool,
    /// Compand select.
    pub cp_s: bool,
    /// Compand enable.
    pub cp_e: bool,
    /// Discontinuous transmit enable.
    pub dtx_e: bool,
    /// Tone detection enable.
    pub td_e: bool,
    /// Tone send enable.
    pub ts_e: bool,
}

impl ModeFlags {
    fn to_byte(self) -> u8 {
        let packed = (u32::from(self.ns_e) << 6)
            | (u32::from(self.cp_s) << 7)
            | (u32::from(self.cp_e) << 8)
            | (u32::from(self.dtx_e) << 11)
            | (u32::from(self.td_e) << 12)
            | (u32::from(self.ts_e) << 14);
        (packed & 0xff) as u8
    }
}

/// One field of a packet payload, as produced by [`Packet::fields`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field<'a> {
    /// Field type tag (see [`crate::field`]).
    pub tag: u8,
    /// Field body, excluding the tag.
    pub body: &'a [u8],
}

/// A framed AMBE packet.
#[derive(Debug, Clone)]
pub struct Packet {
    buf: Vec<u8>,
    has_parity: bool,
}

impl Default for Packet {
    fn default() -> Self {
        Self::new(PacketType::Control)
    }
}

impl Packet {
    /// Create an empty packet of the given type.
    ///
    /// The buffer contains only a zeroed header; append fields and call
    /// [`Packet::finalize`] before putting it on the wire.
    pub fn new(kind: PacketType) -> Self {
        let mut buf = Vec::with_capacity(HEADER_LEN + 16);
        buf.put_u8(START_BYTE);
        buf.put_u16(0);
        buf.put_u8(kind as u8);
        Self {
            buf,
            has_parity: false,
        }
    }

    /// Parse a received buffer into a packet.
    ///
    /// `has_parity` states whether the sender was in parity mode, i.e.
    /// whether the buffer ends in a parity field. When `check_parity` is
    /// also set, the parity value is verified so that corruption is caught
    /// before any other processing.
    ///
    /// # Errors
    ///
    /// Returns [`ProtoError::MalformedPacket`] if the start byte, type,
    /// length, or parity check fails.
    pub fn parse(bytes: Vec<u8>, has_parity: bool, check_parity: bool) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(ProtoError::malformed("packet too short to have a header"));
        }

        if has_parity {
            if bytes.len() < HEADER_LEN + PARITY_LEN {
                return Err(ProtoError::malformed(
                    "packet too short to have a parity field",
                ));
            }
            if bytes[bytes.len() - PARITY_LEN] != field::PARITY {
                return Err(ProtoError::malformed("invalid parity field tag"));
            }
            if check_parity {
                let value = bytes[bytes.len() - 1];
                if xor_parity(&bytes) != value {
                    return Err(ProtoError::malformed("parity mismatch"));
                }
            }
        }

        if bytes[0] != START_BYTE {
            return Err(ProtoError::malformed(format!(
                "invalid start byte 0x{:02x}",
                bytes[0]
            )));
        }

        let length = usize::from(u16::from_be_bytes([bytes[1], bytes[2]]));
        if length != bytes.len() - HEADER_LEN {
            return Err(ProtoError::malformed(format!(
                "header length {length} does not match buffer length {}",
                bytes.len()
            )));
        }

        PacketType::from_byte(bytes[3])?;

        Ok(Self {
            buf: bytes,
            has_parity,
        })
    }

    /// Packet type from the header.
    pub fn kind(&self) -> PacketType {
        // The type byte is validated in parse and fixed in new.
        PacketType::from_byte(self.buf[3]).unwrap_or(PacketType::Control)
    }

    /// Payload length in bytes, excluding header and parity field.
    pub fn payload_len(&self) -> usize {
        let trailer = if self.has_parity { PARITY_LEN } else { 0 };
        self.buf.len().saturating_sub(HEADER_LEN + trailer)
    }

    /// Whether the payload is empty.
    ///
    /// Empty packets never go on the wire; the schedulers use one as a
    /// termination sentinel.
    pub fn is_empty(&self) -> bool {
        self.payload_len() == 0
    }

    /// Payload bytes, excluding header and parity field.
    pub fn payload(&self) -> &[u8] {
        &self.buf[HEADER_LEN..HEADER_LEN + self.payload_len()]
    }

    /// The whole buffer as it appears on the wire.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// The channel the packet is for.
    ///
    /// A packet has a channel if and only if the first payload field is one
    /// of the channel selector tags. A packet may in principle carry fields
    /// for several channels; the driver never builds such packets, and only
    /// the first selector counts.
    pub fn channel(&self) -> Option<u8> {
        self.payload().first().copied().and_then(field::channel_of)
    }

    /// Append a bare field consisting of a tag only.
    pub fn append_field(&mut self, tag: u8) {
        self.buf.put_u8(tag);
    }

    /// Append a channel selector field.
    ///
    /// # Errors
    ///
    /// Returns [`ProtoError::InvalidPayload`] for channel numbers above 2.
    pub fn append_channel(&mut self, channel: u8) -> Result<()> {
        if channel > 2 {
            return Err(ProtoError::invalid_payload(format!(
                "invalid channel number {channel}"
            )));
        }
        self.buf.put_u8(field::channel_tag(channel));
        Ok(())
    }

    /// Append a speech data field: sample count followed by raw samples.
    ///
    /// Samples are copied in their in-memory byte order; the chip expects
    /// big-endian, see [`crate::swap_samples`].
    ///
    /// # Errors
    ///
    /// Returns [`ProtoError::InvalidPayload`] if more than 255 samples are
    /// given.
    pub fn append_spchd(&mut self, samples: &[i16]) -> Result<()> {
        let count = u8::try_from(samples.len())
            .map_err(|_| ProtoError::invalid_payload("too many samples for one field"))?;
        self.buf.put_u8(field::SPCHD);
        self.buf.put_u8(count);
        for sample in samples {
            self.buf.put_i16_ne(*sample);
        }
        Ok(())
    }

    /// Append a channel data field: bit count followed by the packed bits.
    ///
    /// # Errors
    ///
    /// Returns [`ProtoError::InvalidPayload`] if the bit count exceeds 255
    /// or `bits` is shorter than the count requires.
    pub fn append_chand(&mut self, bits: &[u8], bit_count: usize) -> Result<()> {
        let count = u8::try_from(bit_count)
            .map_err(|_| ProtoError::invalid_payload("too many bits for one field"))?;
        let bytes = AmbeFrame::byte_len(bit_count);
        if bits.len() < bytes {
            return Err(ProtoError::invalid_payload(format!(
                "{bit_count} bits need {bytes} bytes, got {}",
                bits.len()
            )));
        }
        self.buf.put_u8(field::CHAND);
        self.buf.put_u8(count);
        self.buf.put_slice(&bits[..bytes]);
        Ok(())
    }

    /// Append a table rate selection field.
    pub fn append_ratet(&mut self, index: u8) {
        self.buf.put_u8(field::RATET);
        self.buf.put_u8(index);
    }

    /// Append a custom rate field with six big-endian rate control words.
    pub fn append_ratep(&mut self, rcw: &[u16; 6]) {
        self.buf.put_u8(field::RATEP);
        for word in rcw {
            self.buf.put_u16(*word);
        }
    }

    /// Append an encoder/decoder initialization field.
    pub fn append_init(&mut self, encoder: bool, decoder: bool) {
        self.buf.put_u8(field::INIT);
        self.buf
            .put_u8(u8::from(encoder) | (u8::from(decoder) << 1));
    }

    /// Append an `ECMODE` or `DCMODE` field.
    pub fn append_mode(&mut self, tag: u8, flags: ModeFlags) {
        self.buf.put_u8(tag);
        self.buf.put_u8(flags.to_byte());
    }

    /// Append a parity mode field.
    pub fn append_parity_mode(&mut self, mode: u8) {
        self.buf.put_u8(field::PARITYMODE);
        self.buf.put_u8(mode);
    }

    /// Append a companding configuration field.
    pub fn append_compand(&mut self, enabled: bool, alaw: bool) {
        self.buf.put_u8(field::COMPAND);
        self.buf.put_u8(u8::from(enabled) | (u8::from(alaw) << 1));
    }

    /// Update the header length and the trailing parity field.
    ///
    /// With `with_parity` the parity field is appended (or rewritten) with
    /// the correct XOR value; without it, an existing parity field is
    /// stripped. Idempotent for a given flag. Returns the wire bytes.
    pub fn finalize(&mut self, with_parity: bool) -> &[u8] {
        if self.has_parity && !with_parity {
            self.buf.truncate(self.buf.len() - PARITY_LEN);
            self.has_parity = false;
        } else if !self.has_parity && with_parity {
            self.buf.put_u8(field::PARITY);
            self.buf.put_u8(0);
            self.has_parity = true;
        }

        let length = (self.buf.len() - HEADER_LEN) as u16;
        self.buf[1..3].copy_from_slice(&length.to_be_bytes());

        if self.has_parity {
            let value = xor_parity(&self.buf);
            let last = self.buf.len() - 1;
            self.buf[last] = value;
        }
        &self.buf
    }

    /// Verify the trailing parity field.
    ///
    /// # Errors
    ///
    /// Returns [`ProtoError::MalformedPacket`] if the packet has no parity
    /// field or the value does not match.
    pub fn verify_parity(&self) -> Result<()> {
        if !self.has_parity
            || self.buf.len() < HEADER_LEN + PARITY_LEN
            || self.buf[self.buf.len() - PARITY_LEN] != field::PARITY
        {
            return Err(ProtoError::malformed(
                "parity field not found at the end of packet",
            ));
        }
        if xor_parity(&self.buf) != self.buf[self.buf.len() - 1] {
            return Err(ProtoError::malformed("parity mismatch"));
        }
        Ok(())
    }

    /// Speech samples carried by a `SPEECH` packet.
    ///
    /// Valid if and only if the first field is a channel selector and the
    /// second a speech data field. Samples are returned in their wire byte
    /// order, see [`crate::swap_samples`].
    ///
    /// # Errors
    ///
    /// Returns [`ProtoError::InvalidPayload`] if the packet has a different
    /// shape.
    pub fn samples(&self) -> Result<Vec<i16>> {
        if self.kind() != PacketType::Speech {
            return Err(ProtoError::invalid_payload("speech packet expected"));
        }
        let payload = self.payload();
        if payload.first().copied().and_then(field::channel_of).is_none() {
            return Err(ProtoError::invalid_payload("invalid packet channel"));
        }
        if payload.get(1) != Some(&field::SPCHD) {
            return Err(ProtoError::invalid_payload("speech data field expected"));
        }
        let count = usize::from(
            *payload
                .get(2)
                .ok_or_else(|| ProtoError::invalid_payload("truncated speech data field"))?,
        );
        let data = payload
            .get(3..3 + 2 * count)
            .ok_or_else(|| ProtoError::invalid_payload("truncated speech samples"))?;
        Ok(data
            .chunks_exact(2)
            .map(|pair| i16::from_ne_bytes([pair[0], pair[1]]))
            .collect())
    }

    /// Compressed bits carried by a `CHANNEL` packet, with their bit count.
    ///
    /// Valid if and only if the first field is a channel selector and the
    /// second a channel data field.
    ///
    /// # Errors
    ///
    /// Returns [`ProtoError::InvalidPayload`] if the packet has a different
    /// shape.
    pub fn bits(&self) -> Result<(&[u8], usize)> {
        if self.kind() != PacketType::Channel {
            return Err(ProtoError::invalid_payload("channel packet expected"));
        }
        let payload = self.payload();
        if payload.first().copied().and_then(field::channel_of).is_none() {
            return Err(ProtoError::invalid_payload("invalid packet channel"));
        }
        if payload.get(1) != Some(&field::CHAND) {
            return Err(ProtoError::invalid_payload("channel data field expected"));
        }
        let count = usize::from(
            *payload
                .get(2)
                .ok_or_else(|| ProtoError::invalid_payload("truncated channel data field"))?,
        );
        let data = payload
            .get(3..3 + AmbeFrame::byte_len(count))
            .ok_or_else(|| ProtoError::invalid_payload("truncated channel bits"))?;
        Ok((data, count))
    }

    /// Iterate over the payload fields.
    ///
    /// Only the field tags this driver emits are understood; an unknown tag
    /// yields an error item and ends the iteration.
    pub fn fields(&self) -> FieldIter<'_> {
        FieldIter {
            payload: self.payload(),
            offset: 0,
        }
    }
}

/// XOR of every packet byte except the start byte and the trailing parity
/// value.
fn xor_parity(buf: &[u8]) -> u8 {
    buf[1..buf.len() - 1].iter().fold(0, |acc, byte| acc ^ byte)
}

/// Iterator over packet payload fields, see [`Packet::fields`].
pub struct FieldIter<'a> {
    payload: &'a [u8],
    offset: usize,
}

impl<'a> Iterator for FieldIter<'a> {
    type Item = Result<Field<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.payload.len() {
            return None;
        }
        let tag = self.payload[self.offset];
        let rest = &self.payload[self.offset + 1..];

        let body_len = match body_len(tag, rest) {
            Ok(len) => len,
            Err(e) => {
                self.offset = self.payload.len();
                return Some(Err(e));
            }
        };
        if rest.len() < body_len {
            self.offset = self.payload.len();
            return Some(Err(ProtoError::invalid_payload(format!(
                "truncated field 0x{tag:02x}"
            ))));
        }

        self.offset += 1 + body_len;
        Some(Ok(Field {
            tag,
            body: &rest[..body_len],
        }))
    }
}

/// Body length of a field with the given tag, given the bytes after the tag.
fn body_len(tag: u8, rest: &[u8]) -> Result<usize> {
    let counted = |per_unit: fn(usize) -> usize| -> Result<usize> {
        let count = usize::from(
            *rest
                .first()
                .ok_or_else(|| ProtoError::invalid_payload("field missing count byte"))?,
        );
        Ok(1 + per_unit(count))
    };

    match tag {
        field::SPCHD => counted(|samples| 2 * samples),
        field::CHAND => counted(AmbeFrame::byte_len),
        field::RATEP => Ok(12),
        field::GAIN => Ok(2),
        field::RATET
        | field::INIT
        | field::ECMODE
        | field::DCMODE
        | field::PARITYMODE
        | field::COMPAND
        | field::PARITY
        | field::LOWPOWER => Ok(1),
        field::CHANNEL0..=field::CHANNEL2
        | field::PRODID
        | field::VERSTRING
        | field::RESET
        | field::RESETSOFTCFG
        | field::HALT
        | field::GETCFG
        | field::READCFG
        | field::READY => Ok(0),
        other => Err(ProtoError::invalid_payload(format!(
            "unknown field tag 0x{other:02x}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prodid_request_bytes() {
        let mut packet = Packet::new(PacketType::Control);
        packet.append_field(field::PRODID);
        let wire = packet.finalize(true).to_vec();

        // parity = 0x00 ^ 0x03 ^ 0x00 ^ 0x30 ^ 0x2f
        assert_eq!(wire, [0x61, 0x00, 0x03, 0x00, 0x30, 0x2f, 0x1c]);

        let parsed = Packet::parse(wire, true, true).expect("round trip");
        assert_eq!(parsed.kind(), PacketType::Control);
        assert_eq!(parsed.payload(), [0x30]);
    }

    #[test]
    fn finalize_strips_parity() {
        let mut packet = Packet::new(PacketType::Control);
        packet.append_field(field::PRODID);
        packet.finalize(true);
        let wire = packet.finalize(false).to_vec();
        assert_eq!(wire, [0x61, 0x00, 0x01, 0x00, 0x30]);
    }

    #[test]
    fn finalize_is_idempotent() {
        let mut packet = Packet::new(PacketType::Control);
        packet.append_field(field::RESET);
        let once = packet.finalize(true).to_vec();
        let twice = packet.finalize(true).to_vec();
        assert_eq!(once, twice);
    }

    #[test]
    fn parity_value_is_xor_of_interior_bytes() {
        let mut packet = Packet::new(PacketType::Speech);
        packet.append_channel(1).unwrap();
        packet.append_spchd(&[0x1234, -2]).unwrap();
        let wire = packet.finalize(true).to_vec();

        let expected = wire[1..wire.len() - 1]
            .iter()
            .fold(0u8, |acc, b| acc ^ b);
        assert_eq!(wire[wire.len() - 1], expected);

        Packet::parse(wire, true, true).expect("parity verifies");
    }

    #[test]
    fn corrupted_parity_is_rejected() {
        let mut packet = Packet::new(PacketType::Control);
        packet.append_field(field::RESET);
        let mut wire = packet.finalize(true).to_vec();
        wire[4] ^= 0x40;
        let err = Packet::parse(wire, true, true).unwrap_err();
        assert!(matches!(err, ProtoError::MalformedPacket { .. }));
    }

    #[test]
    fn header_checks() {
        assert!(Packet::parse(vec![0x61, 0x00], false, false).is_err());
        // Wrong start byte.
        assert!(Packet::parse(vec![0x60, 0x00, 0x00, 0x00], false, false).is_err());
        // Wrong type.
        assert!(Packet::parse(vec![0x61, 0x00, 0x00, 0x07], false, false).is_err());
        // Wrong length.
        assert!(Packet::parse(vec![0x61, 0x00, 0x02, 0x00, 0x30], false, false).is_err());
        // Minimal valid packet.
        assert!(Packet::parse(vec![0x61, 0x00, 0x00, 0x00], false, false).is_ok());
    }

    #[test]
    fn channel_accessor() {
        for channel in 0..3u8 {
            let mut packet = Packet::new(PacketType::Control);
            packet.append_channel(channel).unwrap();
            packet.append_ratet(33);
            packet.finalize(false);
            assert_eq!(packet.channel(), Some(channel));
        }

        let mut device_wide = Packet::new(PacketType::Control);
        device_wide.append_field(field::RESET);
        device_wide.finalize(false);
        assert_eq!(device_wide.channel(), None);

        assert_eq!(Packet::new(PacketType::Control).channel(), None);
        assert!(Packet::new(PacketType::Control).append_channel(3).is_err());
    }

    #[test]
    fn field_iteration_round_trip() {
        let mut packet = Packet::new(PacketType::Control);
        packet.append_channel(2).unwrap();
        packet.append_ratep(&[0x0558, 0x086b, 0x1030, 0, 0, 0x0190]);
        packet.append_init(true, true);
        packet.finalize(true);

        let parsed = Packet::parse(packet.as_bytes().to_vec(), true, true).unwrap();
        let fields: Vec<_> = parsed.fields().collect::<Result<_>>().unwrap();
        // The trailing parity field is framing, not payload.
        assert_eq!(fields.len(), 3);
        assert_eq!(fields[0].tag, field::CHANNEL2);
        assert!(fields[0].body.is_empty());
        assert_eq!(fields[1].tag, field::RATEP);
        assert_eq!(fields[1].body, [0x05, 0x58, 0x08, 0x6b, 0x10, 0x30, 0, 0, 0, 0, 0x01, 0x90]);
        assert_eq!(fields[2].tag, field::INIT);
        assert_eq!(fields[2].body, [0x03]);
    }

    #[test]
    fn mode_flags_truncate_to_one_byte() {
        // Positions 8, 11, 12, and 14 fall outside the byte and vanish.
        let flags = ModeFlags {
            ns_e: true,
            cp_s: true,
            cp_e: true,
            dtx_e: true,
            td_e: true,
            ts_e: true,
        };
        assert_eq!(flags.to_byte(), 0xc0);

        let high_only = ModeFlags {
            cp_e: true,
            dtx_e: true,
            td_e: true,
            ts_e: true,
            ..ModeFlags::default()
        };
        assert_eq!(high_only.to_byte(), 0x00);
    }

    #[test]
    fn speech_getter() {
        let samples: Vec<i16> = (0..160).collect();
        let mut packet = Packet::new(PacketType::Speech);
        packet.append_channel(0).unwrap();
        packet.append_spchd(&samples).unwrap();
        packet.finalize(false);

        assert_eq!(packet.samples().unwrap(), samples);
        assert!(matches!(
            packet.bits(),
            Err(ProtoError::InvalidPayload { .. })
        ));
    }

    #[test]
    fn bits_getter() {
        let bits = [0xde, 0xad, 0xbe];
        let mut packet = Packet::new(PacketType::Channel);
        packet.append_channel(1).unwrap();
        packet.append_chand(&bits, 20).unwrap();
        packet.finalize(false);

        let (data, count) = packet.bits().unwrap();
        assert_eq!(count, 20);
        assert_eq!(data, &bits[..3]);
        assert!(matches!(
            packet.samples(),
            Err(ProtoError::InvalidPayload { .. })
        ));
    }

    #[test]
    fn empty_packet_is_sentinel() {
        let packet = Packet::new(PacketType::Control);
        assert!(packet.is_empty());
        assert_eq!(packet.payload_len(), 0);
    }
}
