//! Field descriptors.
//!
//! A [`StructureItem`] describes where one field lives in a buffer and how
//! its bits are interpreted. Geometry is validated when the item is built,
//! so an item that exists is always decodable.

use crate::error::{Error, Result};
use std::cmp::Ordering;
use std::fmt;

/// Field data types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    /// Two's complement signed integer, 1 to 64 bits
    Int,
    /// Unsigned integer, 1 to 64 bits
    Uint,
    /// IEEE-754 float, 32 or 64 bits
    Float,
    /// NUL terminated text
    String,
    /// Raw bytes
    Block,
    /// No buffer bits; the value comes from a conversion
    Derived,
}

impl DataType {
    /// Returns the definition keyword for this type
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Int => "INT",
            DataType::Uint => "UINT",
            DataType::Float => "FLOAT",
            DataType::String => "STRING",
            DataType::Block => "BLOCK",
            DataType::Derived => "DERIVED",
        }
    }

    /// Returns true for INT and UINT
    pub fn is_integer(&self) -> bool {
        matches!(self, DataType::Int | DataType::Uint)
    }

    /// Returns true for STRING and BLOCK
    pub fn is_bytes(&self) -> bool {
        matches!(self, DataType::String | DataType::Block)
    }
}

impl TryFrom<&str> for DataType {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self> {
        match value.to_ascii_uppercase().as_str() {
            "INT" => Ok(DataType::Int),
            "UINT" => Ok(DataType::Uint),
            "FLOAT" => Ok(DataType::Float),
            "STRING" => Ok(DataType::String),
            "BLOCK" => Ok(DataType::Block),
            "DERIVED" => Ok(DataType::Derived),
            other => Err(Error::invalid_value(
                "DATA_TYPE",
                format!("unknown data type '{}'", other),
            )),
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Byte order of a field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Endianness {
    /// Most significant byte first
    #[default]
    Big,
    /// Least significant byte first
    Little,
}

impl Endianness {
    /// Returns the definition keyword for this byte order
    pub fn as_str(&self) -> &'static str {
        match self {
            Endianness::Big => "BIG_ENDIAN",
            Endianness::Little => "LITTLE_ENDIAN",
        }
    }
}

impl TryFrom<&str> for Endianness {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self> {
        match value.to_ascii_uppercase().as_str() {
            "BIG_ENDIAN" => Ok(Endianness::Big),
            "LITTLE_ENDIAN" => Ok(Endianness::Little),
            other => Err(Error::invalid_value(
                "ENDIANNESS",
                format!("unknown endianness '{}', must be BIG_ENDIAN or LITTLE_ENDIAN", other),
            )),
        }
    }
}

impl fmt::Display for Endianness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What to do when a written value does not fit its field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum OverflowPolicy {
    /// Reject the value
    #[default]
    Error,
    /// Reject unless the value fits as an unsigned bit pattern
    ErrorAllowHex,
    /// Keep the low bits (or leading bytes)
    Truncate,
    /// Clamp to the nearest representable value
    Saturate,
}

impl OverflowPolicy {
    /// Returns the definition keyword for this policy
    pub fn as_str(&self) -> &'static str {
        match self {
            OverflowPolicy::Error => "ERROR",
            OverflowPolicy::ErrorAllowHex => "ERROR_ALLOW_HEX",
            OverflowPolicy::Truncate => "TRUNCATE",
            OverflowPolicy::Saturate => "SATURATE",
        }
    }
}

impl TryFrom<&str> for OverflowPolicy {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self> {
        match value.to_ascii_uppercase().as_str() {
            "ERROR" => Ok(OverflowPolicy::Error),
            "ERROR_ALLOW_HEX" => Ok(OverflowPolicy::ErrorAllowHex),
            "TRUNCATE" => Ok(OverflowPolicy::Truncate),
            "SATURATE" => Ok(OverflowPolicy::Saturate),
            other => Err(Error::invalid_value(
                "OVERFLOW",
                format!("unknown overflow policy '{}'", other),
            )),
        }
    }
}

impl fmt::Display for OverflowPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Size of an item taken from a sibling length item.
///
/// For STRING, BLOCK and arrays the size in bits is
/// `length * length_bits_per_count + length_value_bit_offset`. Scalar
/// INT/UINT items use the QUIC sizes instead: a length value of 0, 1, 2 or 3
/// selects 6, 14, 30 or 62 bits.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VariableBitSize {
    /// Name of the item holding the length
    pub length_item_name: String,
    /// Bits per unit of the length value
    pub length_bits_per_count: i32,
    /// Bits added to the computed size
    pub length_value_bit_offset: i32,
}

impl VariableBitSize {
    /// Creates a variable size with the default 8 bits per count and no offset
    pub fn new(length_item_name: impl Into<String>) -> Self {
        Self {
            length_item_name: length_item_name.into().to_uppercase(),
            length_bits_per_count: 8,
            length_value_bit_offset: 0,
        }
    }

    /// Sets the bits per count
    pub fn bits_per_count(mut self, bits: i32) -> Self {
        self.length_bits_per_count = bits;
        self
    }

    /// Sets the value bit offset
    pub fn value_bit_offset(mut self, bits: i32) -> Self {
        self.length_value_bit_offset = bits;
        self
    }
}

/// QUIC variable-length integer sizes in bits, indexed by length value
pub const QUIC_BIT_SIZES: [i32; 4] = [6, 14, 30, 62];

/// Signed field geometry: offset, size and optional array size in bits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    /// Offset from the buffer start (or end, when negative)
    pub bit_offset: i32,
    /// Size of one value
    pub bit_size: i32,
    /// Size of the whole array
    pub array_size: Option<i32>,
}

impl Geometry {
    /// Bits covered by the field (array size for arrays)
    pub fn total_bit_size(&self) -> i32 {
        self.array_size.unwrap_or(self.bit_size)
    }
}

/// Describes one field of a structure
#[derive(Debug, Clone, PartialEq)]
pub struct StructureItem {
    name: String,
    key: String,
    bit_offset: i32,
    bit_size: i32,
    data_type: DataType,
    endianness: Endianness,
    array_size: Option<i32>,
    overflow: OverflowPolicy,
    variable_bit_size: Option<VariableBitSize>,
    overlap: bool,
    create_index: u64,
}

impl StructureItem {
    /// Creates and validates a new item.
    ///
    /// The name is normalized to uppercase. `array_size` is the size in bits
    /// of the whole array; zero or negative fills to the buffer end minus
    /// that many bits.
    pub fn new(
        name: impl AsRef<str>,
        bit_offset: i32,
        bit_size: i32,
        data_type: DataType,
        endianness: Endianness,
        array_size: Option<i32>,
        overflow: OverflowPolicy,
    ) -> Result<Self> {
        let name = name.as_ref().trim().to_uppercase();
        if name.is_empty() {
            return Err(Error::invalid_definition("ITEM", "name must not be empty"));
        }
        let item = Self {
            key: name.clone(),
            name,
            bit_offset,
            bit_size,
            data_type,
            endianness,
            array_size,
            overflow,
            variable_bit_size: None,
            overlap: false,
            create_index: 0,
        };
        item.verify()?;
        Ok(item)
    }

    /// Shorthand for a big endian scalar with the ERROR overflow policy
    pub fn scalar(
        name: impl AsRef<str>,
        bit_offset: i32,
        bit_size: i32,
        data_type: DataType,
    ) -> Result<Self> {
        Self::new(
            name,
            bit_offset,
            bit_size,
            data_type,
            Endianness::Big,
            None,
            OverflowPolicy::Error,
        )
    }

    /// Item name (uppercase)
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Lookup key; defaults to the name
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Defined bit offset
    pub fn bit_offset(&self) -> i32 {
        self.bit_offset
    }

    /// Defined bit size
    pub fn bit_size(&self) -> i32 {
        self.bit_size
    }

    /// Data type
    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    /// Byte order
    pub fn endianness(&self) -> Endianness {
        self.endianness
    }

    /// Defined array size in bits
    pub fn array_size(&self) -> Option<i32> {
        self.array_size
    }

    /// Overflow policy
    pub fn overflow(&self) -> OverflowPolicy {
        self.overflow
    }

    /// Variable size description, if any
    pub fn variable_bit_size(&self) -> Option<&VariableBitSize> {
        self.variable_bit_size.as_ref()
    }

    /// Whether overlap with other items is expected
    pub fn overlap(&self) -> bool {
        self.overlap
    }

    /// Creation index assigned by the owning structure
    pub fn create_index(&self) -> u64 {
        self.create_index
    }

    /// Geometry as defined, before any variable size adjustment
    pub fn geometry(&self) -> Geometry {
        Geometry {
            bit_offset: self.bit_offset,
            bit_size: self.bit_size,
            array_size: self.array_size,
        }
    }

    /// Whether the item's size depends on the buffer contents
    pub fn is_variable(&self) -> bool {
        self.data_type != DataType::Derived
            && (self.variable_bit_size.is_some()
                || self.bit_size <= 0
                || self.array_size.map(|a| a <= 0).unwrap_or(false))
    }

    /// Sets the lookup key
    pub fn set_key(&mut self, key: impl Into<String>) {
        self.key = key.into();
    }

    /// Moves the item, re-validating its geometry
    pub fn set_bit_offset(&mut self, bit_offset: i32) -> Result<()> {
        let previous = self.bit_offset;
        self.bit_offset = bit_offset;
        if let Err(e) = self.verify() {
            self.bit_offset = previous;
            return Err(e);
        }
        Ok(())
    }

    /// Changes the byte order, re-validating its geometry
    pub fn set_endianness(&mut self, endianness: Endianness) -> Result<()> {
        let previous = self.endianness;
        self.endianness = endianness;
        if let Err(e) = self.verify() {
            self.endianness = previous;
            return Err(e);
        }
        Ok(())
    }

    /// Changes the overflow policy
    pub fn set_overflow(&mut self, overflow: OverflowPolicy) -> Result<()> {
        if !(self.data_type.is_integer() || self.data_type.is_bytes()) {
            return Err(Error::invalid_definition(
                &self.name,
                format!("overflow policy cannot be set on {} items", self.data_type),
            ));
        }
        self.overflow = overflow;
        Ok(())
    }

    /// Marks the item as intentionally overlapping others
    pub fn set_overlap(&mut self, overlap: bool) {
        self.overlap = overlap;
    }

    /// Takes the item's size from a sibling length item
    pub fn set_variable_bit_size(&mut self, variable: VariableBitSize) -> Result<()> {
        let previous = self.variable_bit_size.replace(variable);
        if let Err(e) = self.verify() {
            self.variable_bit_size = previous;
            return Err(e);
        }
        Ok(())
    }

    pub(crate) fn set_name(&mut self, name: &str) {
        let name = name.trim().to_uppercase();
        if self.key == self.name {
            self.key = name.clone();
        }
        self.name = name;
    }

    pub(crate) fn set_create_index(&mut self, index: u64) {
        self.create_index = index;
    }

    fn verify(&self) -> Result<()> {
        let fail = |details: String| Err(Error::invalid_definition(&self.name, details));
        let (offset, size) = (self.bit_offset, self.bit_size);

        match self.data_type {
            DataType::Derived => {
                if offset != 0 {
                    return fail(format!("DERIVED items must have bit_offset of zero, not {}", offset));
                }
                if size != 0 {
                    return fail(format!("DERIVED items must have bit_size of zero, not {}", size));
                }
                if self.array_size.is_some() || self.variable_bit_size.is_some() {
                    return fail("DERIVED items cannot be arrays or variably sized".to_string());
                }
                return Ok(());
            }
            DataType::Int | DataType::Uint => {
                if size <= 0 {
                    return fail(format!(
                        "bit_size cannot be negative or zero for {} items: {}",
                        self.data_type, size
                    ));
                }
                if size > 64 {
                    return fail(format!(
                        "bit_size of {} is not supported for {} items (maximum 64)",
                        size, self.data_type
                    ));
                }
            }
            DataType::Float => {
                if offset % 8 != 0 {
                    return fail(format!("bit_offset for FLOAT items must be byte aligned: {}", offset));
                }
                if size != 32 && size != 64 {
                    return fail(format!("bit_size for FLOAT items must be 32 or 64, not {}", size));
                }
            }
            DataType::String | DataType::Block => {
                if offset % 8 != 0 {
                    return fail(format!(
                        "bit_offset for {} items must be byte aligned: {}",
                        self.data_type, offset
                    ));
                }
                if size % 8 != 0 {
                    return fail(format!(
                        "bit_size for {} items must be a multiple of 8: {}",
                        self.data_type, size
                    ));
                }
            }
        }

        if offset < 0 {
            if size <= 0 {
                return fail(format!(
                    "negative or zero bit_size ({}) cannot be given with negative bit_offset ({})",
                    size, offset
                ));
            }
            let extent = self.array_size.unwrap_or(size);
            if extent <= 0 {
                return fail(format!(
                    "negative or zero array_size ({}) cannot be given with negative bit_offset ({})",
                    extent, offset
                ));
            }
            if extent > -offset {
                return fail(format!(
                    "bit_offset {} and size {} extend past the end of the buffer",
                    offset, extent
                ));
            }
            if self.variable_bit_size.is_some() {
                return fail("variably sized items cannot have a negative bit_offset".to_string());
            }
        }

        if let Some(array_size) = self.array_size {
            if size <= 0 {
                return fail(format!("array items must have a positive bit_size, not {}", size));
            }
            if array_size > 0 && array_size % size != 0 {
                return fail(format!(
                    "array_size {} is not a multiple of bit_size {}",
                    array_size, size
                ));
            }
        }

        if self.endianness == Endianness::Little && self.data_type.is_integer() && offset >= 0 {
            let byte_aligned = offset % 8 == 0 && size % 8 == 0;
            if !byte_aligned {
                let num_bytes = ((offset % 8) + size - 1) / 8 + 1;
                let upper = offset / 8;
                if upper - num_bytes + 1 < 0 {
                    return fail(format!(
                        "LITTLE_ENDIAN bitfield with bit_offset {} and bit_size {} is invalid",
                        offset, size
                    ));
                }
            }
        }

        if let Some(variable) = &self.variable_bit_size {
            if variable.length_bits_per_count <= 0 {
                return fail(format!(
                    "length_bits_per_count must be positive, not {}",
                    variable.length_bits_per_count
                ));
            }
        }

        Ok(())
    }

    /// Ordering used for the structure's sorted item list.
    ///
    /// DERIVED items come first by creation index, then items with a
    /// non-negative offset ascending, then negative offsets ascending. At an
    /// equal offset variable sized items precede fixed ones, then creation
    /// index breaks the tie.
    pub fn layout_cmp(&self, other: &StructureItem) -> Ordering {
        self.layout_key().cmp(&other.layout_key())
    }

    fn layout_key(&self) -> (u8, i32, u8, u64) {
        let class = match self.data_type {
            DataType::Derived => 0,
            _ if self.bit_offset >= 0 => 1,
            _ => 2,
        };
        let offset = if class == 0 { 0 } else { self.bit_offset };
        let variable = if self.is_variable() { 0 } else { 1 };
        (class, offset, variable, self.create_index)
    }
}

impl AsRef<StructureItem> for StructureItem {
    fn as_ref(&self) -> &StructureItem {
        self
    }
}

impl AsMut<StructureItem> for StructureItem {
    fn as_mut(&mut self) -> &mut StructureItem {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(offset: i32, size: i32, data_type: DataType) -> Result<StructureItem> {
        StructureItem::scalar("TEST", offset, size, data_type)
    }

    #[test]
    fn test_name_is_uppercased() {
        let item = StructureItem::scalar("temp1", 0, 8, DataType::Uint).unwrap();
        assert_eq!(item.name(), "TEMP1");
        assert_eq!(item.key(), "TEMP1");
    }

    #[test]
    fn test_float_rules() {
        assert!(item(0, 32, DataType::Float).is_ok());
        assert!(item(0, 64, DataType::Float).is_ok());
        assert!(item(0, 16, DataType::Float).is_err());
        assert!(item(4, 32, DataType::Float).is_err());
    }

    #[test]
    fn test_string_block_alignment() {
        assert!(item(8, 16, DataType::String).is_ok());
        assert!(item(8, 0, DataType::Block).is_ok());
        assert!(item(3, 16, DataType::String).is_err());
        assert!(item(8, 12, DataType::Block).is_err());
    }

    #[test]
    fn test_derived_rules() {
        assert!(item(0, 0, DataType::Derived).is_ok());
        assert!(item(8, 0, DataType::Derived).is_err());
        assert!(item(0, 8, DataType::Derived).is_err());
    }

    #[test]
    fn test_integer_sizes() {
        assert!(item(0, 0, DataType::Uint).is_err());
        assert!(item(0, 65, DataType::Int).is_err());
        assert!(item(3, 13, DataType::Int).is_ok());
    }

    #[test]
    fn test_negative_offsets() {
        assert!(item(-16, 16, DataType::Uint).is_ok());
        assert!(item(-8, 16, DataType::Uint).is_err());
        assert!(item(-16, 0, DataType::String).is_err());
    }

    #[test]
    fn test_array_rules() {
        let ok = StructureItem::new(
            "ARR",
            0,
            8,
            DataType::Uint,
            Endianness::Big,
            Some(64),
            OverflowPolicy::Error,
        );
        assert!(ok.is_ok());
        let bad = StructureItem::new(
            "ARR",
            0,
            8,
            DataType::Uint,
            Endianness::Big,
            Some(60),
            OverflowPolicy::Error,
        );
        assert!(bad.is_err());
    }

    #[test]
    fn test_little_endian_bitfield_window() {
        let little = |offset, size| {
            StructureItem::new(
                "LE",
                offset,
                size,
                DataType::Uint,
                Endianness::Little,
                None,
                OverflowPolicy::Error,
            )
        };
        // MSB in byte 1, window reaches back into byte 0
        assert!(little(12, 12).is_ok());
        // MSB in byte 0, window would need byte -1
        assert!(little(4, 12).is_err());
        // Byte aligned fields are not bitfields
        assert!(little(0, 16).is_ok());
    }

    #[test]
    fn test_layout_ordering() {
        let mut derived = item(0, 0, DataType::Derived).unwrap();
        derived.set_create_index(5);
        let mut first = item(0, 8, DataType::Uint).unwrap();
        first.set_create_index(1);
        let mut variable = item(0, 0, DataType::String).unwrap();
        variable.set_create_index(2);
        let mut negative = item(-8, 8, DataType::Uint).unwrap();
        negative.set_create_index(0);

        let mut items = vec![negative.clone(), first.clone(), variable.clone(), derived.clone()];
        items.sort_by(|a, b| a.layout_cmp(b));
        let order: Vec<u64> = items.iter().map(|i| i.create_index()).collect();
        assert_eq!(order, vec![5, 2, 1, 0]);
    }

    #[test]
    fn test_failed_setter_restores_previous() {
        let mut item = item(4, 12, DataType::Uint).unwrap();
        assert!(item.set_endianness(Endianness::Little).is_err());
        assert_eq!(item.endianness(), Endianness::Big);
    }
}
