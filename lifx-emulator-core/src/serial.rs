//! A device's serial number: the 6-byte MAC-style address carried in [lifx_protocol::FrameAddress::target].

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Serial(pub [u8; 6]);

#[derive(Debug, Error)]
pub enum InvalidSerial {
    #[error("serial must be 12 hex characters, got `{0}`")]
    WrongLength(String),
    #[error("serial contains non-hex characters: `{0}`")]
    NotHex(String),
}

impl Serial {
    /// Build a [Serial] from the lower 48 bits of a [lifx_protocol::FrameAddress::target] value.
    pub fn from_target(target: u64) -> Serial {
        let bytes = target.to_le_bytes();
        Serial([bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5]])
    }

    /// Pack this serial into the 64-bit target field, zero-extended.
    pub fn as_target(&self) -> u64 {
        let mut bytes = [0u8; 8];
        bytes[..6].copy_from_slice(&self.0);
        u64::from_le_bytes(bytes)
    }
}

impl fmt::Display for Serial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Serial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Serial({})", self)
    }
}

impl FromStr for Serial {
    type Err = InvalidSerial;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 12 {
            return Err(InvalidSerial::WrongLength(s.to_string()));
        }
        let mut out = [0u8; 6];
        for (idx, chunk) in out.iter_mut().enumerate() {
            let byte_str = &s[idx * 2..idx * 2 + 2];
            *chunk = u8::from_str_radix(byte_str, 16)
                .map_err(|_| InvalidSerial::NotHex(s.to_string()))?;
        }
        Ok(Serial(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_string() {
        let s: Serial = "d073d5112233".parse().unwrap();
        assert_eq!(s.to_string(), "d073d5112233");
    }

    #[test]
    fn round_trips_through_target() {
        let s: Serial = "d073d5112233".parse().unwrap();
        let target = s.as_target();
        assert_eq!(Serial::from_target(target), s);
    }

    #[test]
    fn rejects_wrong_length() {
        assert!("abc".parse::<Serial>().is_err());
    }

    #[test]
    fn rejects_non_hex() {
        assert!("zzzzzzzzzzzz".parse::<Serial>().is_err());
    }
}
