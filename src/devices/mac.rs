// MIT License - Copyright (c) 2026 Peter Wright
// Sensor MAC addresses

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, Result};

/// A sensor or keypad radio address: 8 hex characters, stored uppercase.
///
/// The bridge reports an all-zero address for slots that are not bound to a
/// device, so `00000000` is never a valid MAC.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Mac(String);

impl Mac {
    /// Parse and normalize a MAC string. Surrounding whitespace is ignored.
    pub fn parse(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        let valid = trimmed.len() == 8
            && trimmed.chars().all(|c| c.is_ascii_hexdigit())
            && trimmed != "00000000";
        if !valid {
            return Err(GatewayError::InvalidMac { mac: s.to_string() });
        }
        Ok(Self(trimmed.to_ascii_uppercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Mac {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Mac {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Mac {
    type Error = GatewayError;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<Mac> for String {
    fn from(mac: Mac) -> Self {
        mac.0
    }
}
