//! Error types for the pktdef-core library.
//!
//! This module provides error handling using the `thiserror` crate, with
//! variants grouped by when they occur: at definition time (bad field
//! geometry, bad configuration), at decode time (overflow, unknown value
//! types or states), and when a buffer does not fit its layout.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for pktdef operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for all pktdef operations
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Failed to read a definition file
    #[error("failed to read file '{path}': {source}")]
    FileRead {
        /// Path to the file that failed to read
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Invalid field geometry or type combination
    #[error("{item}: {details}")]
    InvalidDefinition {
        /// Item the definition belongs to
        item: String,
        /// Description of the problem
        details: String,
    },

    /// Error while processing definition keywords
    #[error("{location}: {details}")]
    Config {
        /// Where the offending keyword came from (file:line or keyword)
        location: String,
        /// Description of the problem
        details: String,
    },

    /// Value does not fit the field under its overflow policy
    #[error("value of {value} invalid for {bit_size}-bit {data_type}")]
    Overflow {
        /// The rejected value, rendered as text
        value: String,
        /// Field width in bits
        bit_size: usize,
        /// Field data type
        data_type: String,
    },

    /// Value of the wrong kind for the field
    #[error("invalid value for {data_type}: {details}")]
    InvalidValue {
        /// Field data type
        data_type: String,
        /// Description of the problem
        details: String,
    },

    /// Value outside a command parameter's minimum/maximum
    #[error("value {value} out of range for {item} ({minimum}..{maximum})")]
    OutOfRange {
        /// Item being written
        item: String,
        /// The rejected value
        value: String,
        /// Minimum allowed value
        minimum: String,
        /// Maximum allowed value
        maximum: String,
    },

    /// Unknown value type name
    #[error("unknown value type: {0}, must be RAW, CONVERTED, FORMATTED, or WITH_UNITS")]
    UnknownValueType(String),

    /// Unknown state name on a CONVERTED write
    #[error("unknown state {state} for {item}, must be one of {valid}")]
    UnknownState {
        /// Item being written
        item: String,
        /// The state name given
        state: String,
        /// Comma separated list of valid states
        valid: String,
    },

    /// Write that the item cannot accept
    #[error("cannot write {item}: {details}")]
    ReadOnly {
        /// Item being written
        item: String,
        /// Description of the problem
        details: String,
    },

    /// Buffer shorter than the defined length
    #[error("buffer length less than defined length ({actual} < {defined} bytes)")]
    ShortBuffer {
        /// Bytes given
        actual: usize,
        /// Bytes defined
        defined: usize,
    },

    /// Buffer longer than a fixed size definition
    #[error("buffer length greater than defined length ({actual} > {defined} bytes)")]
    LongBuffer {
        /// Bytes given
        actual: usize,
        /// Bytes defined
        defined: usize,
    },

    /// Item does not exist
    #[error("unknown item: {0}")]
    UnknownItem(String),

    /// Packet does not exist in the target
    #[error("packet '{target} {packet}' does not exist")]
    UnknownPacket {
        /// Target name
        target: String,
        /// Packet name
        packet: String,
    },

    /// Target does not exist
    #[error("target '{0}' does not exist")]
    UnknownTarget(String),

    /// A conversion failed
    #[error("conversion failed: {0}")]
    Conversion(String),

    /// Error annotated with the packet and item it happened in
    #[error("{target} {packet} {item}: {source}")]
    Context {
        /// Target name
        target: String,
        /// Packet name
        packet: String,
        /// Item name
        item: String,
        /// Underlying error
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Creates a new file read error
    pub fn file_read(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::FileRead {
            path: path.into(),
            source,
        }
    }

    /// Creates a new definition error
    pub fn invalid_definition(item: impl Into<String>, details: impl Into<String>) -> Self {
        Self::InvalidDefinition {
            item: item.into(),
            details: details.into(),
        }
    }

    /// Creates a new configuration error
    pub fn config(location: impl Into<String>, details: impl Into<String>) -> Self {
        Self::Config {
            location: location.into(),
            details: details.into(),
        }
    }

    /// Creates a new overflow error
    pub fn overflow(value: impl ToString, bit_size: usize, data_type: impl ToString) -> Self {
        Self::Overflow {
            value: value.to_string(),
            bit_size,
            data_type: data_type.to_string(),
        }
    }

    /// Creates a new invalid value error
    pub fn invalid_value(data_type: impl ToString, details: impl Into<String>) -> Self {
        Self::InvalidValue {
            data_type: data_type.to_string(),
            details: details.into(),
        }
    }

    /// Creates a new read-only error
    pub fn read_only(item: impl Into<String>, details: impl Into<String>) -> Self {
        Self::ReadOnly {
            item: item.into(),
            details: details.into(),
        }
    }

    /// Creates a new conversion error
    pub fn conversion(msg: impl Into<String>) -> Self {
        Self::Conversion(msg.into())
    }

    /// Wraps this error with target/packet/item context.
    ///
    /// Errors that already carry context are returned unchanged.
    pub fn with_context(self, target: &str, packet: &str, item: &str) -> Self {
        match self {
            Self::Context { .. } => self,
            other => Self::Context {
                target: target.to_string(),
                packet: packet.to_string(),
                item: item.to_string(),
                source: Box::new(other),
            },
        }
    }

    /// Returns the innermost error, skipping context wrappers
    pub fn root(&self) -> &Error {
        match self {
            Self::Context { source, .. } => source.root(),
            other => other,
        }
    }

    /// Returns true if this error happened while defining a layout
    pub fn is_definition_error(&self) -> bool {
        matches!(
            self.root(),
            Self::InvalidDefinition { .. } | Self::Config { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::overflow(256, 8, "UINT");
        assert_eq!(err.to_string(), "value of 256 invalid for 8-bit UINT");
    }

    #[test]
    fn test_context_wraps_once() {
        let err = Error::overflow(256, 8, "UINT")
            .with_context("INST", "HEALTH_STATUS", "TEMP1")
            .with_context("OTHER", "PKT", "ITEM");
        let msg = err.to_string();
        assert!(msg.starts_with("INST HEALTH_STATUS TEMP1:"));
        assert!(matches!(err.root(), Error::Overflow { .. }));
    }

    #[test]
    fn test_is_definition_error() {
        assert!(Error::invalid_definition("ITEM", "bad").is_definition_error());
        assert!(!Error::UnknownItem("X".into()).is_definition_error());
    }
}
