use std::{fmt, str::FromStr};

use thiserror::Error;
use uuid::Uuid;

/// Development-only fallback used when no credential is configured.
pub const DEV_PLACEHOLDER: &str = "12345678-1234-1234-1234-123456789abc";

pub const CREDENTIAL_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("empty credential")]
    Empty,
    #[error("invalid credential (expected a UUID): {0}")]
    Invalid(#[from] uuid::Error),
}

/// The 16-byte identifier a client must present to open a tunnel.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Credential([u8; CREDENTIAL_LEN]);

impl Credential {
    pub fn as_bytes(&self) -> &[u8; CREDENTIAL_LEN] {
        &self.0
    }

    pub fn dev_placeholder() -> Self {
        Self(*Uuid::from_u128(0x12345678_1234_1234_1234_123456789abc).as_bytes())
    }

    pub fn generate() -> Self {
        Self(*Uuid::new_v4().as_bytes())
    }

    /// Byte-for-byte comparison against a presented value.
    ///
    /// All bytes are visited even after a mismatch so the time taken does not
    /// depend on the position of the first differing byte.
    pub fn matches(&self, presented: &[u8]) -> bool {
        if presented.len() != CREDENTIAL_LEN {
            return false;
        }
        let diff = self
            .0
            .iter()
            .zip(presented)
            .fold(0u8, |acc, (a, b)| acc | (a ^ b));
        diff == 0
    }
}

impl FromStr for Credential {
    type Err = CredentialError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(CredentialError::Empty);
        }
        let id = Uuid::parse_str(s)?;
        Ok(Self(*id.as_bytes()))
    }
}

impl fmt::Display for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Uuid::from_bytes(self.0).hyphenated())
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholder_matches_its_text_form() {
        let parsed: Credential = DEV_PLACEHOLDER.parse().unwrap();
        assert_eq!(parsed, Credential::dev_placeholder());
        assert_eq!(parsed.to_string(), DEV_PLACEHOLDER);
        assert_eq!(parsed.as_bytes()[0], 0x12);
        assert_eq!(parsed.as_bytes()[15], 0xbc);
    }

    #[test]
    fn parse_accepts_uppercase_and_padding() {
        let c: Credential = "  12345678-1234-1234-1234-123456789ABC ".parse().unwrap();
        assert_eq!(c, Credential::dev_placeholder());
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(matches!("".parse::<Credential>(), Err(CredentialError::Empty)));
        assert!(matches!(
            "not-a-uuid".parse::<Credential>(),
            Err(CredentialError::Invalid(_))
        ));
    }

    #[test]
    fn matches_rejects_every_single_byte_flip() {
        let c = Credential::generate();
        assert!(c.matches(c.as_bytes()));
        for i in 0..CREDENTIAL_LEN {
            let mut other = *c.as_bytes();
            other[i] ^= 0x01;
            assert!(!c.matches(&other), "byte {i} flip accepted");
        }
    }

    #[test]
    fn matches_rejects_wrong_length() {
        let c = Credential::dev_placeholder();
        assert!(!c.matches(&c.as_bytes()[..15]));
        let mut longer = c.as_bytes().to_vec();
        longer.push(0);
        assert!(!c.matches(&longer));
    }

    #[test]
    fn debug_does_not_leak_value() {
        let c = Credential::dev_placeholder();
        assert!(!format!("{c:?}").contains("1234"));
    }
}
