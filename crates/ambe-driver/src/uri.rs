//! Device URIs.
//!
//! A device is selected with `scheme:authority`. The `usb` scheme names a
//! local serial device path (`usb:/dev/ttyUSB0`); the `grpc` scheme names a
//! remote gateway as `host:port` (`grpc:example.org:50051`). Schemes are
//! case-insensitive.

use std::str::FromStr;

use crate::error::DriverError;

/// Transport selected by a URI scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UriKind {
    /// Locally attached serial dongle.
    Usb,
    /// Remote gateway.
    Rpc,
}

/// A parsed device URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Uri {
    /// Transport kind derived from the scheme.
    pub kind: UriKind,
    /// The scheme as given, original case.
    pub scheme: String,
    /// Everything after the first colon.
    pub authority: String,
}

impl FromStr for Uri {
    type Err = DriverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(DriverError::invalid_configuration("URI must not be empty"));
        }
        let Some((scheme, authority)) = s.split_once(':') else {
            return Err(DriverError::invalid_configuration(format!(
                "invalid URI {s:?}, expected <scheme>:<authority>"
            )));
        };

        let kind = match scheme.to_ascii_lowercase().as_str() {
            "usb" => UriKind::Usb,
            "grpc" => UriKind::Rpc,
            other => {
                return Err(DriverError::invalid_configuration(format!(
                    "unknown URI scheme {other:?}"
                )))
            }
        };

        Ok(Self {
            kind,
            scheme: scheme.to_string(),
            authority: authority.to_string(),
        })
    }
}
