//! Vocoder rate selection.

use std::fmt;
use std::str::FromStr;

use crate::error::ProtoError;

/// A vocoder rate: either an index into the chip's built-in rate table
/// (`RATET`) or six custom rate control words (`RATEP`).
///
/// Rate strings accept a single integer in `0..=255` (table index) or six
/// comma-separated integers in `0..=65535` (rate control words). Table
/// index 33 selects the 3600 bit/s half-rate mode with FEC that is
/// interoperable with APCO P25 half rate and DMR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rate {
    /// Rate selected from the chip's built-in table.
    Table {
        /// Table index.
        index: u8,
    },
    /// Custom rate described by six rate control words.
    Custom {
        /// Rate control words, host order; big-endian on the wire.
        rcw: [u16; 6],
    },
}

impl FromStr for Rate {
    type Err = ProtoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ProtoError::InvalidRate {
            value: s.to_string(),
        };

        if !s.contains(',') {
            let index = s.trim().parse::<u8>().map_err(|_| invalid())?;
            return Ok(Self::Table { index });
        }

        let mut rcw = [0u16; 6];
        let mut words = s.split(',');
        for slot in &mut rcw {
            let word = words.next().ok_or_else(invalid)?;
            *slot = parse_word(word.trim()).ok_or_else(invalid)?;
        }
        if words.next().is_some() {
            return Err(invalid());
        }
        Ok(Self::Custom { rcw })
    }
}

/// Parse one rate control word, accepting decimal or `0x`-prefixed hex.
fn parse_word(word: &str) -> Option<u16> {
    if let Some(hex) = word.strip_prefix("0x").or_else(|| word.strip_prefix("0X")) {
        u16::from_str_radix(hex, 16).ok()
    } else {
        word.parse().ok()
    }
}

impl fmt::Display for Rate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Table { index } => write!(f, "{index}"),
            Self::Custom { rcw } => {
                for (i, word) in rcw.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "0x{word:04x}")?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_table_index() {
        assert_eq!("33".parse::<Rate>().unwrap(), Rate::Table { index: 33 });
        assert_eq!("0".parse::<Rate>().unwrap(), Rate::Table { index: 0 });
        assert!("256".parse::<Rate>().is_err());
        assert!("-1".parse::<Rate>().is_err());
        assert!("x".parse::<Rate>().is_err());
    }

    #[test]
    fn parses_rate_control_words() {
        // P.25 full-rate with FEC (7200 bit/s).
        let rate = "0x0558,0x086b,0x1030,0x0000,0x0000,0x0190"
            .parse::<Rate>()
            .unwrap();
        assert_eq!(
            rate,
            Rate::Custom {
                rcw: [0x0558, 0x086b, 0x1030, 0, 0, 0x0190]
            }
        );

        assert_eq!(
            "1,2,3,4,5,6".parse::<Rate>().unwrap(),
            Rate::Custom {
                rcw: [1, 2, 3, 4, 5, 6]
            }
        );

        assert!("1,2,3".parse::<Rate>().is_err());
        assert!("1,2,3,4,5,6,7".parse::<Rate>().is_err());
        assert!("1,2,3,4,5,65536".parse::<Rate>().is_err());
    }

    #[test]
    fn display_round_trips() {
        for input in ["33", "0x0558,0x086b,0x1030,0x0000,0x0000,0x0190"] {
            let rate = input.parse::<Rate>().unwrap();
            assert_eq!(rate.to_string().parse::<Rate>().unwrap(), rate);
        }
    }
}
