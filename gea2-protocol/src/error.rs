//! Protocol error types.

use thiserror::Error;

/// Protocol-level errors that can occur while framing or decoding GEA2 data.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed frame for command {command:#04x}: {reason}")]
    MalformedFrame { command: u16, reason: String },

    #[error("too many items for one frame: {0} (max 255)")]
    TooManyItems(usize),

    #[error("ERD value too long: {0} bytes (max 255)")]
    ValueTooLong(usize),

    #[error("value length mismatch: expected {expected} bytes, got {actual}")]
    ValueLength { expected: usize, actual: usize },

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("unknown value kind: {0}")]
    UnknownValueKind(String),

    #[error("invalid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),

    #[error("invalid packet size byte {0}: must be at least 8")]
    InvalidPacket(u8),

    #[error("packet too large: {size} data bytes (max {max})")]
    PacketTooLarge { size: usize, max: usize },

    #[error("command {0:#06x} does not fit the 8-bit wire field")]
    CommandNotWireable(u16),
}

impl ProtocolError {
    pub(crate) fn malformed(command: u16, reason: impl Into<String>) -> Self {
        ProtocolError::MalformedFrame {
            command,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_error_display() {
        let err = ProtocolError::malformed(0xF0, "length 4 does not match 2 items");
        let msg = err.to_string();
        assert!(msg.contains("0xf0"));
        assert!(msg.contains("2 items"));

        let err = ProtocolError::TooManyItems(300);
        assert!(err.to_string().contains("300"));

        let err = ProtocolError::ValueLength {
            expected: 2,
            actual: 1,
        };
        assert!(err.to_string().contains("expected 2"));

        let err = ProtocolError::InvalidPacket(3);
        assert!(err.to_string().contains("3"));

        let err = ProtocolError::CommandNotWireable(0xDE10);
        assert!(err.to_string().contains("0xde10"));

        let err = ProtocolError::UnknownValueKind("float".to_string());
        assert!(err.to_string().contains("float"));
    }

    #[test]
    fn test_hex_error_conversion() {
        let err: ProtocolError = hex::decode("0").unwrap_err().into();
        assert!(matches!(err, ProtocolError::InvalidHex(_)));
    }
}
