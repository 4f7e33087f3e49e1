//! # pktdef-core
//!
//! A packet definition and decoding engine for spacecraft ground systems.
//!
//! This crate provides the core functionality for:
//! - Describing fixed and variable layout binary packets bit by bit
//! - Reading and writing typed values at exact bit positions
//! - Converting raw values to engineering units, states and formatted text
//! - Evaluating limits with persistence
//! - Identifying which defined packet a raw buffer holds
//!
//! ## Architecture
//!
//! The library is organized into several modules:
//!
//! - [`structure`]: Field descriptors, the bit-level accessor and buffer-owning structures
//! - [`packet`]: Packets with conversions, states, limits, snapshots and fingerprints
//! - [`registry`]: Definition parsing, per-target identification and lookups
//! - [`value`]: Dynamically typed field values
//! - [`error`]: Error types and handling
//!
//! ## Example
//!
//! ```
//! use pktdef_core::{DefinitionParser, ValueType};
//!
//! let mut parser = DefinitionParser::default();
//! parser.parse_str(
//!     r#"
//! TELEMETRY INST HEALTH BIG_ENDIAN "Health and status"
//!   APPEND_ID_ITEM OPCODE 8 UINT 1
//!   APPEND_ITEM TEMP 16 UINT
//!     POLY_READ_CONVERSION -40.0 0.01
//!     UNITS Celsius C
//!     FORMAT_STRING "%0.1f"
//! "#,
//!     "inst.txt",
//! )?;
//! let registry = parser.finish()?;
//!
//! let packet = registry
//!     .identify_and_define(&[1, 0x17, 0x70], None)?
//!     .expect("buffer is identified");
//! assert_eq!(packet.packet_name(), "HEALTH");
//! assert_eq!(packet.read("TEMP", ValueType::WithUnits)?.to_string(), "20.0 C");
//! # Ok::<(), pktdef_core::Error>(())
//! ```
//!
//! ## Extensibility
//!
//! - [`Conversion`]: Custom read and write conversions
//! - [`CommandValidator`]: Checks run before and after sending a command
//! - [`ParserConfig`]: Registers both with the definition parser by name

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unreachable_pub)]

pub mod error;
pub mod packet;
pub mod registry;
pub mod structure;
pub mod value;

// Re-export primary types for convenience
pub use error::{Error, Result};
pub use packet::{
    Check, CommandValidator, Conversion, ConversionContext, Decom, Limits, LimitsBand,
    LimitsChange, LimitsState, Packet, PacketItem, ValueType,
};
pub use registry::{DefinitionParser, IdMode, PacketKind, ParserConfig, Registry};
pub use structure::{BinaryAccessor, DataType, Endianness, OverflowPolicy, Structure, StructureItem};
pub use value::Value;

/// Crate version for programmatic access
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
