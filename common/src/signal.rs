//! Door sensor payloads.
//!
//! The sensor publishes the literal strings `OPEN` and `CLOSED`.  Matching
//! is case-sensitive; surrounding ASCII whitespace is tolerated so that a
//! trailing newline from a command-line publisher still counts.

use std::fmt;

/// A state change reported by the door sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoorSignal {
    Opened,
    Closed,
}

impl DoorSignal {
    /// Decode a raw message payload.  Anything else is `None`.
    pub fn from_payload(payload: &[u8]) -> Option<Self> {
        match payload.trim_ascii() {
            b"OPEN" => Some(Self::Opened),
            b"CLOSED" => Some(Self::Closed),
            _ => None,
        }
    }
}

impl fmt::Display for DoorSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Opened => f.write_str("OPEN"),
            Self::Closed => f.write_str("CLOSED"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_payloads() {
        assert_eq!(DoorSignal::from_payload(b"OPEN"), Some(DoorSignal::Opened));
        assert_eq!(DoorSignal::from_payload(b"CLOSED"), Some(DoorSignal::Closed));
        assert_eq!(DoorSignal::from_payload(b"OPEN\n"), Some(DoorSignal::Opened));
    }

    #[test]
    fn test_other_payloads_ignored() {
        assert_eq!(DoorSignal::from_payload(b"open"), None);
        assert_eq!(DoorSignal::from_payload(b"CLOSE"), None);
        assert_eq!(DoorSignal::from_payload(b""), None);
        assert_eq!(DoorSignal::from_payload(&[0xff, 0xfe]), None);
    }
}
