//! Machine identity, parsed from the firmware's `$I` response.

use crate::error::{Error, ProtocolError};
use regex::Regex;
use std::sync::LazyLock;

static IDENTITY_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[PolyShaper (.+)\]\[(\S+) (\S+) (\S+)\]").unwrap()
});

/// Immutable identity of a discovered controller, parsed once at discovery time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineIdentity {
    pub name: String,
    pub part_number: String,
    pub serial: String,
    pub firmware_version: String,
}

impl MachineIdentity {
    /// Parse the accumulated response to a `$I` request.
    ///
    /// Expects `[PolyShaper NAME][PART SERIAL VERSION]` somewhere in `raw`
    /// (the firmware also echoes a trailing `ok`, which is ignored).
    pub fn parse(raw: &str) -> Result<Self, Error> {
        let captures = IDENTITY_PATTERN
            .captures(raw)
            .ok_or_else(|| ProtocolError::UnrecognizedIdentity { raw: raw.to_string() })?;
        Ok(Self {
            name: captures[1].to_string(),
            part_number: captures[2].to_string(),
            serial: captures[3].to_string(),
            firmware_version: captures[4].to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_identity() {
        let identity = MachineIdentity::parse("[PolyShaper Oranje][PN SN 1.2]ok\r\n").unwrap();
        assert_eq!(identity.name, "Oranje");
        assert_eq!(identity.part_number, "PN");
        assert_eq!(identity.serial, "SN");
        assert_eq!(identity.firmware_version, "1.2");
    }

    #[test]
    fn rejects_malformed_identity() {
        assert!(MachineIdentity::parse("garbage").is_err());
    }
}
