//! G-code command framing and correlation identifiers.

use crate::error::ProtocolError;

/// Firmware receive buffer size the windowed sender must never exceed.
pub const GRBL_BUFFER_SIZE: usize = 128;

/// Opaque identifier correlating a submitted command with its eventual reply.
pub type CommandId = u64;

/// A single G-code line, normalized and validated for submission to the sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    bytes: Vec<u8>,
}

impl Command {
    /// Normalize and validate a command.
    ///
    /// Appends a trailing `\n` if absent, then rejects anything over
    /// [`GRBL_BUFFER_SIZE`] bytes, anything containing a `\r`, or anything
    /// with a `\n` that isn't the final byte.
    pub fn new(mut bytes: Vec<u8>) -> Result<Self, ProtocolError> {
        if bytes.last() != Some(&b'\n') {
            bytes.push(b'\n');
        }
        if bytes.iter().any(|&b| b == b'\r') {
            return Err(ProtocolError::EmbeddedCarriageReturn);
        }
        if bytes.iter().filter(|&&b| b == b'\n').count() != 1 {
            return Err(ProtocolError::MalformedTerminator);
        }
        if bytes.len() > GRBL_BUFFER_SIZE {
            return Err(ProtocolError::CommandTooLarge { size: bytes.len(), limit: GRBL_BUFFER_SIZE });
        }
        Ok(Self { bytes })
    }

    /// Build a command from an ASCII line, e.g. `"M3"` or `"G01 X100"`.
    pub fn from_line(line: impl AsRef<str>) -> Result<Self, ProtocolError> {
        Self::new(line.as_ref().as_bytes().to_vec())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_missing_newline() {
        let cmd = Command::from_line("M3").unwrap();
        assert_eq!(cmd.as_bytes(), b"M3\n");
    }

    #[test]
    fn rejects_embedded_carriage_return() {
        assert!(Command::new(b"G01\rX1\n".to_vec()).is_err());
    }

    #[test]
    fn rejects_embedded_newline() {
        assert!(Command::new(b"G01\nX1\n".to_vec()).is_err());
    }

    #[test]
    fn rejects_oversized_command() {
        let long = vec![b'X'; GRBL_BUFFER_SIZE];
        assert!(Command::new(long).is_err());
    }

    #[test]
    fn accepts_command_at_exact_limit() {
        let mut bytes = vec![b'X'; GRBL_BUFFER_SIZE - 1];
        bytes.push(b'\n');
        assert!(Command::new(bytes).is_ok());
    }
}
