//! Error types. None of these escape the crate's callback handlers: malformed input is logged and
//! dropped where it is detected.

use thiserror::Error;

use crate::hal::BtPropertyType;

/// A property buffer from the HAL that could not be decoded.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PropertyError {
    #[error("{prop:?}: expected at least {expected} bytes, got {actual}")]
    TooShort { prop: BtPropertyType, expected: usize, actual: usize },

    #[error("{prop:?}: length {actual} is not a multiple of {unit}")]
    BadLength { prop: BtPropertyType, unit: usize, actual: usize },

    #[error("{prop:?}: unexpected value {value}")]
    InvalidValue { prop: BtPropertyType, value: u32 },
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid log level: {0}")]
    InvalidLogLevel(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_property_error_display() {
        let err = PropertyError::TooShort {
            prop: BtPropertyType::LocalLeFeatures,
            expected: 20,
            actual: 3,
        };
        assert_eq!(err.to_string(), "LocalLeFeatures: expected at least 20 bytes, got 3");

        let err = PropertyError::InvalidValue { prop: BtPropertyType::AdapterScanMode, value: 9 };
        assert_eq!(err.to_string(), "AdapterScanMode: unexpected value 9");
    }
}
