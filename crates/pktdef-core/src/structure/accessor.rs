//! Bit-level field codec.
//!
//! [`BinaryAccessor`] reads and writes single fields of a byte buffer.
//! Signed item geometry is first resolved into an absolute [`Extent`] for the
//! buffer at hand, so the bit arithmetic below only ever sees non-negative
//! offsets.
//!
//! ## Bitfields
//!
//! Fields that are byte aligned and a whole number of bytes are copied as
//! bytes (reversed for little endian). Anything else is a bitfield, decoded
//! from the smallest window of bytes covering it:
//!
//! - BIG_ENDIAN: the window starts at `bit_offset / 8` and runs forward.
//! - LITTLE_ENDIAN: `bit_offset` names the field's most significant bit. The
//!   window ends at `bit_offset / 8` and runs backward, and its bytes are
//!   reversed before the field is masked out.

use super::item::{DataType, Endianness, Geometry, OverflowPolicy, StructureItem};
use crate::error::{Error, Result};
use crate::value::Value;
use tracing::trace;

/// Absolute location of a field inside a specific buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    /// Bit offset from the start of the buffer
    pub bit_offset: usize,
    /// Size of one value in bits
    pub bit_size: usize,
    /// Number of array elements, `None` for scalars
    pub count: Option<usize>,
}

impl Extent {
    /// Bits covered by the whole field
    pub fn total_bits(&self) -> usize {
        self.bit_size * self.count.unwrap_or(1)
    }

    /// Bytes needed in the buffer to hold the whole field
    pub fn end_byte(&self) -> usize {
        (self.bit_offset + self.total_bits()).div_ceil(8)
    }
}

/// Stateless binary codec
#[derive(Debug, Clone, Copy, Default)]
pub struct BinaryAccessor;

impl BinaryAccessor {
    /// Resolves signed geometry against a buffer of `buffer_len` bytes.
    ///
    /// Negative offsets count back from the end of the buffer; zero or
    /// negative sizes fill to the end minus that many bits.
    pub fn resolve(geometry: &Geometry, buffer_len: usize) -> Result<Extent> {
        let buffer_bits = buffer_len as i64 * 8;
        let offset = if geometry.bit_offset < 0 {
            buffer_bits + geometry.bit_offset as i64
        } else {
            geometry.bit_offset as i64
        };
        if offset < 0 {
            return Err(Error::invalid_value(
                "BUFFER",
                format!(
                    "bit_offset {} is before the start of a {} byte buffer",
                    geometry.bit_offset, buffer_len
                ),
            ));
        }
        let remaining = |adjust: i32| (buffer_bits - offset + adjust as i64).max(0) as usize;

        let bit_size = if geometry.bit_size > 0 {
            geometry.bit_size as usize
        } else {
            remaining(geometry.bit_size)
        };

        let count = match geometry.array_size {
            None => None,
            Some(_) if bit_size == 0 => Some(0),
            Some(array_size) if array_size > 0 => Some(array_size as usize / bit_size),
            Some(array_size) => Some(remaining(array_size) / bit_size),
        };

        Ok(Extent {
            bit_offset: offset as usize,
            bit_size,
            count,
        })
    }

    /// Reads an item at the given (possibly adjusted) geometry.
    ///
    /// Bytes past the end of a short buffer read as zero; STRING and BLOCK
    /// values contain only the bytes present.
    pub fn read(item: &StructureItem, geometry: &Geometry, buffer: &[u8]) -> Result<Value> {
        if item.data_type() == DataType::Derived {
            return Ok(Value::Null);
        }
        let extent = Self::resolve(geometry, buffer.len())?;
        trace!(
            "read {} at bit {} size {} from {} bytes",
            item.name(),
            extent.bit_offset,
            extent.bit_size,
            buffer.len()
        );
        match extent.count {
            None => read_scalar(
                extent.bit_offset,
                extent.bit_size,
                item.data_type(),
                item.endianness(),
                buffer,
            ),
            Some(count) => (0..count)
                .map(|i| {
                    read_scalar(
                        extent.bit_offset + i * extent.bit_size,
                        extent.bit_size,
                        item.data_type(),
                        item.endianness(),
                        buffer,
                    )
                })
                .collect::<Result<Vec<_>>>()
                .map(Value::Array),
        }
    }

    /// Writes an item at the given (possibly adjusted) geometry.
    ///
    /// The buffer is zero-extended when the field reaches past its end.
    /// Open-ended STRING/BLOCK items and open-ended arrays resize the buffer
    /// to fit the value.
    pub fn write(
        item: &StructureItem,
        geometry: &Geometry,
        value: &Value,
        buffer: &mut Vec<u8>,
    ) -> Result<()> {
        let data_type = item.data_type();
        if data_type == DataType::Derived {
            return Err(Error::read_only(item.name(), "DERIVED items have no buffer bits"));
        }
        let extent = Self::resolve(geometry, buffer.len())?;
        trace!(
            "write {} at bit {} size {} into {} bytes",
            item.name(),
            extent.bit_offset,
            extent.bit_size,
            buffer.len()
        );

        if geometry.array_size.is_some() {
            return write_array(item, geometry, extent, value, buffer);
        }

        if data_type.is_bytes() && geometry.bit_size <= 0 {
            let bytes = bytes_of(data_type, value)?;
            let start = extent.bit_offset / 8;
            if buffer.len() < start {
                buffer.resize(start, 0);
            }
            let end = start + extent.bit_size / 8;
            splice(buffer, start, end - start, bytes);
            return Ok(());
        }

        ensure_len(
            buffer,
            required_len(extent.bit_offset, extent.bit_size, data_type, item.endianness()),
        );
        write_scalar(
            extent.bit_offset,
            extent.bit_size,
            data_type,
            item.endianness(),
            item.overflow(),
            value,
            buffer,
        )
    }
}

/// Replaces `old_len` bytes at `start` with `bytes`, growing or shrinking the buffer
pub(crate) fn splice(buffer: &mut Vec<u8>, start: usize, old_len: usize, bytes: &[u8]) {
    let end = (start + old_len).min(buffer.len());
    let start = start.min(buffer.len());
    buffer.splice(start..end, bytes.iter().copied());
}

/// Bytes a buffer must hold to write one value at `bit_offset`.
///
/// Little endian bitfields run backward from the byte holding their most
/// significant bit, so that byte is the last one touched.
fn required_len(bit_offset: usize, bit_size: usize, data_type: DataType, endianness: Endianness) -> usize {
    let bitfield = bit_offset % 8 != 0 || bit_size % 8 != 0;
    if bitfield && endianness == Endianness::Little && data_type.is_integer() {
        bit_offset / 8 + 1
    } else {
        (bit_offset + bit_size).div_ceil(8)
    }
}

fn ensure_len(buffer: &mut Vec<u8>, len: usize) {
    if buffer.len() < len {
        buffer.resize(len, 0);
    }
}

/// Copies `len` bytes starting at `start`, zero-filling past the buffer end
fn window(buffer: &[u8], start: usize, len: usize) -> Vec<u8> {
    let mut out = vec![0u8; len];
    if start < buffer.len() {
        let available = (buffer.len() - start).min(len);
        out[..available].copy_from_slice(&buffer[start..start + available]);
    }
    out
}

fn accumulate(bytes: &[u8]) -> u128 {
    bytes.iter().fold(0u128, |acc, &b| (acc << 8) | b as u128)
}

fn mask(bit_size: usize) -> u128 {
    if bit_size >= 128 {
        u128::MAX
    } else {
        (1u128 << bit_size) - 1
    }
}

/// Location of an integer field's byte window
struct Window {
    lower: usize,
    num_bytes: usize,
    reversed: bool,
    end_bits: usize,
}

fn integer_window(bit_offset: usize, bit_size: usize, endianness: Endianness) -> Result<Window> {
    let byte_aligned = bit_offset % 8 == 0 && bit_size % 8 == 0;
    if byte_aligned {
        return Ok(Window {
            lower: bit_offset / 8,
            num_bytes: bit_size / 8,
            reversed: endianness == Endianness::Little,
            end_bits: 0,
        });
    }
    let start_bits = bit_offset % 8;
    match endianness {
        Endianness::Big => {
            let lower = bit_offset / 8;
            let upper = (bit_offset + bit_size - 1) / 8;
            let num_bytes = upper - lower + 1;
            Ok(Window {
                lower,
                num_bytes,
                reversed: false,
                end_bits: num_bytes * 8 - start_bits - bit_size,
            })
        }
        Endianness::Little => {
            let num_bytes = (start_bits + bit_size - 1) / 8 + 1;
            let upper = bit_offset / 8;
            if upper + 1 < num_bytes {
                return Err(Error::invalid_value(
                    "LITTLE_ENDIAN",
                    format!(
                        "bitfield with bit_offset {} and bit_size {} is invalid",
                        bit_offset, bit_size
                    ),
                ));
            }
            Ok(Window {
                lower: upper + 1 - num_bytes,
                num_bytes,
                reversed: true,
                end_bits: num_bytes * 8 - start_bits - bit_size,
            })
        }
    }
}

fn read_integer(bit_offset: usize, bit_size: usize, endianness: Endianness, buffer: &[u8]) -> Result<u64> {
    let w = integer_window(bit_offset, bit_size, endianness)?;
    let mut bytes = window(buffer, w.lower, w.num_bytes);
    if w.reversed {
        bytes.reverse();
    }
    Ok(((accumulate(&bytes) >> w.end_bits) & mask(bit_size)) as u64)
}

fn write_integer(
    bit_offset: usize,
    bit_size: usize,
    endianness: Endianness,
    pattern: u64,
    buffer: &mut [u8],
) -> Result<()> {
    let w = integer_window(bit_offset, bit_size, endianness)?;
    let region = &mut buffer[w.lower..w.lower + w.num_bytes];
    if w.reversed {
        region.reverse();
    }
    let field_mask = mask(bit_size) << w.end_bits;
    let temp = (accumulate(region) & !field_mask) | (((pattern as u128) << w.end_bits) & field_mask);
    for (i, byte) in region.iter_mut().rev().enumerate() {
        *byte = (temp >> (8 * i)) as u8;
    }
    if w.reversed {
        region.reverse();
    }
    Ok(())
}

fn sign_extend(raw: u64, bit_size: usize) -> i64 {
    if bit_size >= 64 {
        raw as i64
    } else {
        let shift = 64 - bit_size;
        ((raw << shift) as i64) >> shift
    }
}

fn read_scalar(
    bit_offset: usize,
    bit_size: usize,
    data_type: DataType,
    endianness: Endianness,
    buffer: &[u8],
) -> Result<Value> {
    match data_type {
        DataType::Int => Ok(Value::Int(sign_extend(
            read_integer(bit_offset, bit_size, endianness, buffer)?,
            bit_size,
        ))),
        DataType::Uint => Ok(Value::UInt(read_integer(bit_offset, bit_size, endianness, buffer)?)),
        DataType::Float => {
            let mut bytes = window(buffer, bit_offset / 8, bit_size / 8);
            if endianness == Endianness::Little {
                bytes.reverse();
            }
            match bit_size {
                32 => Ok(Value::Float(f32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f64)),
                64 => {
                    let mut raw = [0u8; 8];
                    raw.copy_from_slice(&bytes);
                    Ok(Value::Float(f64::from_be_bytes(raw)))
                }
                other => Err(Error::invalid_value(
                    DataType::Float,
                    format!("bit_size must be 32 or 64, not {}", other),
                )),
            }
        }
        DataType::String | DataType::Block => {
            let start = (bit_offset / 8).min(buffer.len());
            let end = (start + bit_size / 8).min(buffer.len());
            let bytes = &buffer[start..end];
            if data_type == DataType::String {
                let text = match bytes.iter().position(|&b| b == 0) {
                    Some(nul) => &bytes[..nul],
                    None => bytes,
                };
                Ok(Value::String(String::from_utf8_lossy(text).into_owned()))
            } else {
                Ok(Value::Block(bytes.to_vec()))
            }
        }
        DataType::Derived => Ok(Value::Null),
    }
}

/// Applies the overflow policy and returns the field's bit pattern
pub(crate) fn integer_pattern(
    value: i128,
    bit_size: usize,
    data_type: DataType,
    overflow: OverflowPolicy,
) -> Result<u64> {
    let (min, max, hex_max) = if data_type == DataType::Int {
        let half = 1i128 << (bit_size - 1);
        (-half, half - 1, (1i128 << bit_size) - 1)
    } else {
        let max = (1i128 << bit_size) - 1;
        (0, max, max)
    };

    let mut value = value;
    if value < min || value > max {
        match overflow {
            OverflowPolicy::Error => return Err(Error::overflow(value, bit_size, data_type)),
            OverflowPolicy::ErrorAllowHex => {
                if value < min || value > hex_max {
                    return Err(Error::overflow(value, bit_size, data_type));
                }
            }
            OverflowPolicy::Truncate => {}
            OverflowPolicy::Saturate => value = value.clamp(min, max),
        }
    }
    Ok(((value as u128) & mask(bit_size)) as u64)
}

fn bytes_of(data_type: DataType, value: &Value) -> Result<&[u8]> {
    value.as_bytes().ok_or_else(|| {
        Error::invalid_value(
            data_type,
            format!("expected a string or block, got {}", value.type_name()),
        )
    })
}

fn write_scalar(
    bit_offset: usize,
    bit_size: usize,
    data_type: DataType,
    endianness: Endianness,
    overflow: OverflowPolicy,
    value: &Value,
    buffer: &mut [u8],
) -> Result<()> {
    match data_type {
        DataType::Int | DataType::Uint => {
            let pattern = integer_pattern(value.to_integer()?, bit_size, data_type, overflow)?;
            write_integer(bit_offset, bit_size, endianness, pattern, buffer)
        }
        DataType::Float => {
            let v = value.to_float()?;
            let mut bytes = match bit_size {
                32 => (v as f32).to_be_bytes().to_vec(),
                _ => v.to_be_bytes().to_vec(),
            };
            if endianness == Endianness::Little {
                bytes.reverse();
            }
            let start = bit_offset / 8;
            buffer[start..start + bytes.len()].copy_from_slice(&bytes);
            Ok(())
        }
        DataType::String | DataType::Block => {
            let bytes = bytes_of(data_type, value)?;
            let byte_size = bit_size / 8;
            let bytes = if bytes.len() > byte_size {
                if overflow != OverflowPolicy::Truncate {
                    return Err(Error::invalid_value(
                        data_type,
                        format!("value of {} bytes does not fit into {} bytes", bytes.len(), byte_size),
                    ));
                }
                &bytes[..byte_size]
            } else {
                bytes
            };
            let start = bit_offset / 8;
            let region = &mut buffer[start..start + byte_size];
            region.fill(0);
            region[..bytes.len()].copy_from_slice(bytes);
            Ok(())
        }
        DataType::Derived => Ok(()),
    }
}

fn write_array(
    item: &StructureItem,
    geometry: &Geometry,
    extent: Extent,
    value: &Value,
    buffer: &mut Vec<u8>,
) -> Result<()> {
    let values = value.as_array().ok_or_else(|| {
        Error::invalid_value(
            item.data_type(),
            format!("array items require an array value, got {}", value.type_name()),
        )
    })?;
    let open_ended = geometry.array_size.map(|a| a <= 0).unwrap_or(false);
    let capacity = extent.count.unwrap_or(0);

    if open_ended && values.len() != capacity {
        if extent.bit_offset % 8 != 0 || extent.bit_size % 8 != 0 {
            return Err(Error::invalid_value(
                item.data_type(),
                "open-ended arrays of bitfields cannot change size",
            ));
        }
        let start = extent.bit_offset / 8;
        ensure_len(buffer, start);
        let old_len = capacity * extent.bit_size / 8;
        let new_len = values.len() * extent.bit_size / 8;
        splice(buffer, start, old_len, &vec![0u8; new_len]);
    } else if values.len() > capacity {
        return Err(Error::invalid_value(
            item.data_type(),
            format!("array of {} elements does not fit into {} elements", values.len(), capacity),
        ));
    }

    let count = if open_ended { values.len() } else { capacity };
    let needed = match count.checked_sub(1) {
        Some(last) => required_len(
            extent.bit_offset + last * extent.bit_size,
            extent.bit_size,
            item.data_type(),
            item.endianness(),
        ),
        None => extent.bit_offset.div_ceil(8),
    };
    ensure_len(buffer, needed);
    let zero = match item.data_type() {
        DataType::String | DataType::Block => Value::Block(Vec::new()),
        _ => Value::Int(0),
    };
    for i in 0..count {
        write_scalar(
            extent.bit_offset + i * extent.bit_size,
            extent.bit_size,
            item.data_type(),
            item.endianness(),
            item.overflow(),
            values.get(i).unwrap_or(&zero),
            buffer,
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn item(
        offset: i32,
        size: i32,
        data_type: DataType,
        endianness: Endianness,
        overflow: OverflowPolicy,
    ) -> StructureItem {
        StructureItem::new("TEST", offset, size, data_type, endianness, None, overflow).unwrap()
    }

    fn read(item: &StructureItem, buffer: &[u8]) -> Value {
        BinaryAccessor::read(item, &item.geometry(), buffer).unwrap()
    }

    fn write(item: &StructureItem, value: Value, buffer: &mut Vec<u8>) -> Result<()> {
        BinaryAccessor::write(item, &item.geometry(), &value, buffer)
    }

    #[test]
    fn test_aligned_integers_both_endians() {
        let data = [0x12, 0x34, 0x56, 0x78];
        let big = item(0, 16, DataType::Uint, Endianness::Big, OverflowPolicy::Error);
        let little = item(0, 16, DataType::Uint, Endianness::Little, OverflowPolicy::Error);
        assert_eq!(read(&big, &data), Value::UInt(0x1234));
        assert_eq!(read(&little, &data), Value::UInt(0x3412));

        let wide = item(0, 32, DataType::Int, Endianness::Big, OverflowPolicy::Error);
        assert_eq!(read(&wide, &[0xFF, 0xFF, 0xFF, 0xFE]), Value::Int(-2));
    }

    #[test]
    fn test_big_endian_bitfield() {
        let data = [0b1010_1100, 0b0101_0000];
        let field = item(4, 8, DataType::Uint, Endianness::Big, OverflowPolicy::Error);
        assert_eq!(read(&field, &data), Value::UInt(0b1100_0101));

        let signed = item(0, 4, DataType::Int, Endianness::Big, OverflowPolicy::Error);
        assert_eq!(read(&signed, &data), Value::Int(-6));
    }

    #[test]
    fn test_little_endian_bitfield_msb_convention() {
        // MSB nibble sits in the low half of byte 1, the low byte in byte 0
        let data = [0x34, 0x12];
        let field = item(12, 12, DataType::Uint, Endianness::Little, OverflowPolicy::Error);
        assert_eq!(read(&field, &data), Value::UInt(0x234));

        let mut buffer = vec![0x00, 0xF0];
        write(&field, Value::UInt(0xABC), &mut buffer).unwrap();
        assert_eq!(buffer, vec![0xBC, 0xFA]);
        assert_eq!(read(&field, &buffer), Value::UInt(0xABC));
    }

    #[test]
    fn test_little_endian_bitfield_write_keeps_exact_buffer() {
        // window covers bytes 1..=2; the forward extent would reach byte 3
        let field = item(19, 10, DataType::Uint, Endianness::Little, OverflowPolicy::Error);
        let mut buffer = vec![0xFF, 0x00, 0x00];
        write(&field, Value::UInt(0x3FF), &mut buffer).unwrap();
        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer[0], 0xFF);
        assert_eq!(read(&field, &buffer), Value::UInt(0x3FF));

        write(&field, Value::UInt(0x155), &mut buffer).unwrap();
        assert_eq!(buffer.len(), 3);
        assert_eq!(read(&field, &buffer), Value::UInt(0x155));
    }

    #[test]
    fn test_bitfield_write_preserves_neighbors() {
        let mut buffer = vec![0xFF, 0xFF];
        let field = item(4, 6, DataType::Uint, Endianness::Big, OverflowPolicy::Error);
        write(&field, Value::UInt(0), &mut buffer).unwrap();
        assert_eq!(buffer, vec![0xF0, 0x3F]);
    }

    #[test]
    fn test_unaligned_64_bit_field() {
        let field = item(4, 64, DataType::Uint, Endianness::Big, OverflowPolicy::Error);
        let mut buffer = vec![0u8; 9];
        write(&field, Value::UInt(u64::MAX), &mut buffer).unwrap();
        assert_eq!(buffer[0], 0x0F);
        assert_eq!(buffer[8], 0xF0);
        assert_eq!(read(&field, &buffer), Value::UInt(u64::MAX));
    }

    #[test]
    fn test_overflow_policies() {
        let mut buffer = vec![0u8; 1];
        let truncate = item(0, 8, DataType::Uint, Endianness::Big, OverflowPolicy::Truncate);
        write(&truncate, Value::Int(256), &mut buffer).unwrap();
        assert_eq!(read(&truncate, &buffer), Value::UInt(0));

        let saturate = item(0, 8, DataType::Uint, Endianness::Big, OverflowPolicy::Saturate);
        write(&saturate, Value::Int(256), &mut buffer).unwrap();
        assert_eq!(read(&saturate, &buffer), Value::UInt(255));

        let error = item(0, 8, DataType::Uint, Endianness::Big, OverflowPolicy::Error);
        assert!(matches!(
            write(&error, Value::Int(256), &mut buffer),
            Err(Error::Overflow { .. })
        ));
    }

    #[test]
    fn test_error_allow_hex() {
        let mut buffer = vec![0u8; 1];
        let field = item(0, 8, DataType::Int, Endianness::Big, OverflowPolicy::ErrorAllowHex);
        write(&field, Value::Int(0xFF), &mut buffer).unwrap();
        assert_eq!(read(&field, &buffer), Value::Int(-1));
        assert!(write(&field, Value::Int(0x100), &mut buffer).is_err());
        assert!(write(&field, Value::Int(-129), &mut buffer).is_err());
    }

    #[test]
    fn test_floats() {
        let mut buffer = vec![0u8; 12];
        let single = item(0, 32, DataType::Float, Endianness::Little, OverflowPolicy::Error);
        let double = item(32, 64, DataType::Float, Endianness::Big, OverflowPolicy::Error);
        write(&single, Value::Float(1.5), &mut buffer).unwrap();
        write(&double, Value::Int(-3), &mut buffer).unwrap();
        assert_eq!(&buffer[..4], &[0x00, 0x00, 0xC0, 0x3F]);
        assert_eq!(read(&single, &buffer), Value::Float(1.5));
        assert_eq!(read(&double, &buffer), Value::Float(-3.0));
    }

    #[test]
    fn test_strings_and_blocks() {
        let mut buffer = vec![0u8; 6];
        let string = item(0, 32, DataType::String, Endianness::Big, OverflowPolicy::Error);
        write(&string, Value::from("AB"), &mut buffer).unwrap();
        assert_eq!(&buffer[..4], b"AB\0\0");
        assert_eq!(read(&string, &buffer), Value::from("AB"));
        assert!(write(&string, Value::from("TOOLONG"), &mut buffer).is_err());

        let truncating = item(0, 32, DataType::String, Endianness::Big, OverflowPolicy::Truncate);
        write(&truncating, Value::from("TOOLONG"), &mut buffer).unwrap();
        assert_eq!(read(&truncating, &buffer), Value::from("TOOL"));

        let block = item(32, 16, DataType::Block, Endianness::Big, OverflowPolicy::Error);
        write(&block, Value::Block(vec![0xDE, 0xAD]), &mut buffer).unwrap();
        assert_eq!(read(&block, &buffer), Value::Block(vec![0xDE, 0xAD]));
    }

    #[test]
    fn test_open_ended_block_resizes_buffer() {
        let block = item(16, 0, DataType::Block, Endianness::Big, OverflowPolicy::Error);
        let mut buffer = vec![1, 2, 3, 4];
        assert_eq!(read(&block, &buffer), Value::Block(vec![3, 4]));
        write(&block, Value::Block(vec![9, 9, 9]), &mut buffer).unwrap();
        assert_eq!(buffer, vec![1, 2, 9, 9, 9]);

        let trailing = item(16, -8, DataType::Block, Endianness::Big, OverflowPolicy::Error);
        assert_eq!(read(&trailing, &buffer), Value::Block(vec![9, 9]));
    }

    #[test]
    fn test_negative_offsets_resolve_from_end() {
        let field = item(-16, 16, DataType::Uint, Endianness::Big, OverflowPolicy::Error);
        assert_eq!(read(&field, &[0, 0, 0, 0xAB, 0xCD]), Value::UInt(0xABCD));
        let extent = BinaryAccessor::resolve(&field.geometry(), 5).unwrap();
        assert_eq!(extent.bit_offset, 24);
        assert!(BinaryAccessor::resolve(&field.geometry(), 1).is_err());
    }

    #[test]
    fn test_arrays() {
        let array = StructureItem::new(
            "ARR",
            8,
            8,
            DataType::Uint,
            Endianness::Big,
            Some(24),
            OverflowPolicy::Error,
        )
        .unwrap();
        let mut buffer = vec![0u8; 4];
        write(&array, Value::Array(vec![Value::UInt(1), Value::UInt(2)]), &mut buffer).unwrap();
        assert_eq!(buffer, vec![0, 1, 2, 0]);
        assert_eq!(
            read(&array, &buffer),
            Value::Array(vec![Value::UInt(1), Value::UInt(2), Value::UInt(0)])
        );
        let too_many = Value::Array(vec![Value::UInt(1); 4]);
        assert!(write(&array, too_many, &mut buffer).is_err());
    }

    #[test]
    fn test_open_ended_array() {
        let array = StructureItem::new(
            "ARR",
            8,
            16,
            DataType::Int,
            Endianness::Little,
            Some(0),
            OverflowPolicy::Error,
        )
        .unwrap();
        let mut buffer = vec![0xAA, 0xFF, 0xFF, 0x02, 0x00];
        assert_eq!(
            read(&array, &buffer),
            Value::Array(vec![Value::Int(-1), Value::Int(2)])
        );
        write(&array, Value::Array(vec![Value::Int(7)]), &mut buffer).unwrap();
        assert_eq!(buffer, vec![0xAA, 0x07, 0x00]);
    }

    #[test]
    fn test_short_buffer_reads_zero() {
        let field = item(8, 16, DataType::Uint, Endianness::Big, OverflowPolicy::Error);
        assert_eq!(read(&field, &[0x01, 0x02]), Value::UInt(0x0200));
        let string = item(0, 64, DataType::String, Endianness::Big, OverflowPolicy::Error);
        assert_eq!(read(&string, b"HI"), Value::from("HI"));
    }

    #[test]
    fn test_write_extends_buffer() {
        let field = item(16, 16, DataType::Uint, Endianness::Big, OverflowPolicy::Error);
        let mut buffer = vec![0xAA];
        write(&field, Value::UInt(0x0102), &mut buffer).unwrap();
        assert_eq!(buffer, vec![0xAA, 0x00, 0x01, 0x02]);
    }

    #[test]
    fn test_round_trip_across_sizes() {
        for endianness in [Endianness::Big, Endianness::Little] {
            for size in [3, 8, 13, 16, 24, 32, 48, 64] {
                let offset = if endianness == Endianness::Little && size % 8 != 0 { 71 } else { 8 };
                let field = item(offset, size, DataType::Int, endianness, OverflowPolicy::Error);
                let mut buffer = vec![0u8; 24];
                let value = i64::MIN >> (64 - size);
                write(&field, Value::Int(value), &mut buffer).unwrap();
                assert_eq!(read(&field, &buffer), Value::Int(value), "size {} {:?}", size, endianness);
                let before = buffer.clone();
                let current = read(&field, &buffer);
                write(&field, current, &mut buffer).unwrap();
                assert_eq!(buffer, before);
            }
        }
    }
}
