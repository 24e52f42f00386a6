//! Wire protocol for DVSI's AMBE vocoder chips.
//!
//! Every exchange with an AMBE chip is a framed packet: a 4-byte header
//! (start byte, big-endian payload length, packet type) followed by a
//! sequence of self-describing fields and, depending on the chip's parity
//! mode, a trailing XOR parity field. This crate implements the framing
//! only; transports and request scheduling live in `ambe-driver`.
//!
//! # Quick start
//!
//! ```
//! use ambe_proto::{field, Packet, PacketType};
//!
//! let mut request = Packet::new(PacketType::Control);
//! request.append_field(field::PRODID);
//! let wire = request.finalize(true).to_vec();
//!
//! let parsed = Packet::parse(wire, true, true)?;
//! assert_eq!(parsed.kind(), PacketType::Control);
//! # Ok::<(), ambe_proto::ProtoError>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

mod error;
pub mod field;
mod frame;
mod packet;
mod rate;

pub use error::{ProtoError, Result};
pub use frame::{
    swap_samples, AmbeFrame, AudioFrame, FRAME_DURATION_MS, FRAME_SAMPLES, SAMPLE_RATE,
};
pub use packet::{Field, FieldIter, ModeFlags, Packet, PacketType, HEADER_LEN, START_BYTE};
pub use rate::Rate;
