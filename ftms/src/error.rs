//! Error types shared by the gateway components.

use thiserror::Error;

/// A control point write that could not be turned into a command.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// The write carried no opcode at all.
    #[error("empty control point write")]
    Empty,
    /// The payload after the opcode is shorter than the opcode requires.
    #[error("opcode 0x{opcode:02x} needs {needed} payload bytes, got {got}")]
    Truncated { opcode: u8, needed: usize, got: usize },
}

impl DecodeError {
    /// Opcode to echo in the response indication, if there is one.
    pub fn opcode(&self) -> Option<u8> {
        match self {
            Self::Empty => None,
            Self::Truncated { opcode, .. } => Some(*opcode),
        }
    }
}

/// Advertising start failure reported by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdvertiseError {
    /// The local radio cannot advertise at all. Not retried.
    #[error("advertising not supported by the local adapter")]
    Unsupported,
    /// Anything else; retried on a fixed delay.
    #[error("advertising failed: {0}")]
    Transient(String),
}

impl AdvertiseError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Unsupported)
    }
}

/// A service the transport refused to register.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("service registration failed: {0}")]
pub struct RegistrationError(pub String);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_error_opcode() {
        assert_eq!(DecodeError::Empty.opcode(), None);
        let err = DecodeError::Truncated { opcode: 0x02, needed: 2, got: 0 };
        assert_eq!(err.opcode(), Some(0x02));
        assert_eq!(err.to_string(), "opcode 0x02 needs 2 payload bytes, got 0");
    }

    #[test]
    fn test_advertise_error_fatality() {
        assert!(AdvertiseError::Unsupported.is_fatal());
        assert!(!AdvertiseError::Transient("busy".into()).is_fatal());
    }
}
