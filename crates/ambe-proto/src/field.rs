//! Field type tags used in AMBE packet payloads.
//!
//! Every field in a packet payload starts with one of these one-byte tags.
//! The tag determines the layout of the field body; see [`crate::Packet`]
//! for the builders.

/// Field carries speech samples.
pub const SPCHD: u8 = 0x00;
/// Field carries AMBE channel bits.
pub const CHAND: u8 = 0x01;
/// Encoder cmode flags for the current channel.
pub const ECMODE: u8 = 0x05;
/// Decoder cmode flags for the current channel.
pub const DCMODE: u8 = 0x06;
/// Select a rate from the built-in table for the current channel.
pub const RATET: u8 = 0x09;
/// Select a custom rate for the current channel.
pub const RATEP: u8 = 0x0a;
/// Initialize encoder and/or decoder for the current channel.
pub const INIT: u8 = 0x0b;
/// Enable or disable low-power mode.
pub const LOWPOWER: u8 = 0x10;
/// Sets the format of the output channel packet.
pub const CHANFMT: u8 = 0x15;
/// Sets the format of the output speech packet.
pub const SPCHFMT: u8 = 0x16;
/// Per-packet parity field.
pub const PARITY: u8 = 0x2f;
/// Query for product identification.
pub const PRODID: u8 = 0x30;
/// Query for product version string.
pub const VERSTRING: u8 = 0x31;
/// Companding on/off and a-law/µ-law selection.
pub const COMPAND: u8 = 0x32;
/// Reset the device using hard configuration via pins.
pub const RESET: u8 = 0x33;
/// Reset the device with software configuration.
pub const RESETSOFTCFG: u8 = 0x34;
/// Put the chip into its lowest power mode.
pub const HALT: u8 = 0x35;
/// Query for configuration pin state at power-up or reset.
pub const GETCFG: u8 = 0x36;
/// Query for the current state of the configuration pins.
pub const READCFG: u8 = 0x37;
/// Indicates that the device is ready to receive packets.
pub const READY: u8 = 0x39;
/// Enable (default) / disable parity fields.
pub const PARITYMODE: u8 = 0x3f;
/// The subsequent fields are for channel 0.
pub const CHANNEL0: u8 = 0x40;
/// The subsequent fields are for channel 1.
pub const CHANNEL1: u8 = 0x41;
/// The subsequent fields are for channel 2.
pub const CHANNEL2: u8 = 0x42;
/// Delay the next control field processing (microseconds).
pub const DELAYNUS: u8 = 0x49;
/// Delay the next control field processing (nanoseconds).
pub const DELAYNNS: u8 = 0x4a;
/// Set input and output gain (-90 to +90 dB).
pub const GAIN: u8 = 0x4b;
/// Set the flow control thresholds.
pub const RTSTHRESH: u8 = 0x4e;

/// Channel selector tag for the given channel number.
///
/// Valid channel numbers are 0 to 2; larger values produce tags the chip
/// will reject.
pub const fn channel_tag(channel: u8) -> u8 {
    CHANNEL0 + channel
}

/// Channel number encoded by a field tag, if the tag is a channel selector.
pub const fn channel_of(tag: u8) -> Option<u8> {
    match tag {
        CHANNEL0..=CHANNEL2 => Some(tag - CHANNEL0),
        _ => None,
    }
}
