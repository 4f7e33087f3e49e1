//! Read and write conversions.
//!
//! A [`Conversion`] turns a RAW value into a CONVERTED one (read) or back
//! (write). Conversions run while the packet's buffer lock is held and get a
//! [`ConversionContext`] for reading sibling items through that same lock.

use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;

use super::{Packet, PacketGuard, ValueType};
use crate::error::{Error, Result};
use crate::structure::DataType;
use crate::value::Value;

/// Access to the packet a conversion is running for
pub struct ConversionContext<'g, 'a> {
    packet: &'g Packet,
    guard: &'g mut PacketGuard<'a>,
}

impl<'g, 'a> ConversionContext<'g, 'a> {
    pub(crate) fn new(packet: &'g Packet, guard: &'g mut PacketGuard<'a>) -> Self {
        Self { packet, guard }
    }

    /// The packet definition
    pub fn packet(&self) -> &Packet {
        self.packet
    }

    /// Reads another item of the same packet instance
    pub fn read(&mut self, name: &str, value_type: ValueType) -> Result<Value> {
        let index = self.packet.index_of(name)?;
        self.packet.read_locked(self.guard, index, value_type)
    }

    /// Current buffer contents
    pub fn buffer(&self) -> &[u8] {
        self.guard.buffer()
    }

    /// Time the current buffer was received
    pub fn received_time(&self) -> Option<DateTime<Utc>> {
        self.guard.ext().received_time
    }

    /// Number of buffers received by this packet
    pub fn received_count(&self) -> u64 {
        self.guard.ext().received_count
    }
}

/// A read or write conversion
pub trait Conversion: fmt::Debug + Send + Sync {
    /// Converts one value
    fn call(&self, value: &Value, ctx: &mut ConversionContext<'_, '_>) -> Result<Value>;

    /// Data type of the converted value, if known
    fn converted_type(&self) -> Option<DataType> {
        None
    }

    /// Bit size of the converted value, if known
    fn converted_bit_size(&self) -> Option<i32> {
        None
    }

    /// Stable text identifying the conversion and its parameters
    fn fingerprint(&self) -> String;

    /// The segments of a segmented polynomial, so later definitions can extend it
    fn as_segmented(&self) -> Option<&SegmentedPolynomialConversion> {
        None
    }
}

fn to_f64(value: &Value) -> Result<f64> {
    value
        .to_float()
        .map_err(|_| Error::conversion(format!("cannot convert {} to a number", value.type_name())))
}

fn map_numeric(value: &Value, f: impl Fn(f64) -> f64) -> Result<Value> {
    match value {
        Value::Array(values) => values
            .iter()
            .map(|v| to_f64(v).map(|x| Value::Float(f(x))))
            .collect::<Result<Vec<_>>>()
            .map(Value::Array),
        other => to_f64(other).map(|x| Value::Float(f(x))),
    }
}

fn evaluate(coefficients: &[f64], x: f64) -> f64 {
    coefficients.iter().rev().fold(0.0, |acc, c| acc * x + c)
}

fn coefficient_text(coefficients: &[f64]) -> String {
    coefficients
        .iter()
        .map(|c| format!("{:?}", c))
        .collect::<Vec<_>>()
        .join(" ")
}

/// `c0 + c1*x + c2*x^2 + ...`
#[derive(Debug, Clone, PartialEq)]
pub struct PolynomialConversion {
    coefficients: Vec<f64>,
}

impl PolynomialConversion {
    /// Creates a polynomial from coefficients in ascending power order
    pub fn new(coefficients: Vec<f64>) -> Result<Self> {
        if coefficients.is_empty() {
            return Err(Error::conversion("polynomial needs at least one coefficient"));
        }
        Ok(Self { coefficients })
    }

    /// Coefficients in ascending power order
    pub fn coefficients(&self) -> &[f64] {
        &self.coefficients
    }
}

impl Conversion for PolynomialConversion {
    fn call(&self, value: &Value, _ctx: &mut ConversionContext<'_, '_>) -> Result<Value> {
        map_numeric(value, |x| evaluate(&self.coefficients, x))
    }

    fn converted_type(&self) -> Option<DataType> {
        Some(DataType::Float)
    }

    fn converted_bit_size(&self) -> Option<i32> {
        Some(64)
    }

    fn fingerprint(&self) -> String {
        format!("PolynomialConversion {}", coefficient_text(&self.coefficients))
    }
}

/// Piecewise polynomial selected by the input value
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SegmentedPolynomialConversion {
    // descending by lower bound
    segments: Vec<(f64, Vec<f64>)>,
}

impl SegmentedPolynomialConversion {
    /// Creates a conversion with no segments
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a segment used for inputs at or above `lower_bound`
    pub fn add_segment(&mut self, lower_bound: f64, coefficients: Vec<f64>) -> Result<()> {
        if coefficients.is_empty() {
            return Err(Error::conversion("segment needs at least one coefficient"));
        }
        self.segments.push((lower_bound, coefficients));
        self.segments
            .sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        Ok(())
    }

    fn apply(&self, x: f64) -> f64 {
        let segment = self
            .segments
            .iter()
            .find(|(lower, _)| x >= *lower)
            .or_else(|| self.segments.last());
        segment.map(|(_, c)| evaluate(c, x)).unwrap_or(x)
    }
}

impl Conversion for SegmentedPolynomialConversion {
    fn call(&self, value: &Value, _ctx: &mut ConversionContext<'_, '_>) -> Result<Value> {
        if self.segments.is_empty() {
            return Err(Error::conversion("segmented polynomial has no segments"));
        }
        map_numeric(value, |x| self.apply(x))
    }

    fn converted_type(&self) -> Option<DataType> {
        Some(DataType::Float)
    }

    fn converted_bit_size(&self) -> Option<i32> {
        Some(64)
    }

    fn as_segmented(&self) -> Option<&SegmentedPolynomialConversion> {
        Some(self)
    }

    fn fingerprint(&self) -> String {
        let segments: Vec<String> = self
            .segments
            .iter()
            .map(|(lower, c)| format!("[{:?}: {}]", lower, coefficient_text(c)))
            .collect();
        format!("SegmentedPolynomialConversion {}", segments.join(" "))
    }
}

/// Received time as floating point seconds since the Unix epoch
#[derive(Debug, Clone, Copy, Default)]
pub struct ReceivedTimeSecondsConversion;

impl Conversion for ReceivedTimeSecondsConversion {
    fn call(&self, _value: &Value, ctx: &mut ConversionContext<'_, '_>) -> Result<Value> {
        let seconds = ctx
            .received_time()
            .map(|t| t.timestamp() as f64 + t.timestamp_subsec_nanos() as f64 / 1e9)
            .unwrap_or(0.0);
        Ok(Value::Float(seconds))
    }

    fn converted_type(&self) -> Option<DataType> {
        Some(DataType::Float)
    }

    fn converted_bit_size(&self) -> Option<i32> {
        Some(64)
    }

    fn fingerprint(&self) -> String {
        "ReceivedTimeSecondsConversion".into()
    }
}

/// Received time as `YYYY/MM/DD HH:MM:SS.sss` UTC
#[derive(Debug, Clone, Copy, Default)]
pub struct ReceivedTimeFormattedConversion;

impl Conversion for ReceivedTimeFormattedConversion {
    fn call(&self, _value: &Value, ctx: &mut ConversionContext<'_, '_>) -> Result<Value> {
        Ok(Value::String(match ctx.received_time() {
            Some(t) => t.format("%Y/%m/%d %H:%M:%S%.3f").to_string(),
            None => "No Packet Received Time".into(),
        }))
    }

    fn converted_type(&self) -> Option<DataType> {
        Some(DataType::String)
    }

    fn fingerprint(&self) -> String {
        "ReceivedTimeFormattedConversion".into()
    }
}

/// Number of buffers the packet has received
#[derive(Debug, Clone, Copy, Default)]
pub struct ReceivedCountConversion;

impl Conversion for ReceivedCountConversion {
    fn call(&self, _value: &Value, ctx: &mut ConversionContext<'_, '_>) -> Result<Value> {
        Ok(Value::UInt(ctx.received_count()))
    }

    fn converted_type(&self) -> Option<DataType> {
        Some(DataType::Uint)
    }

    fn converted_bit_size(&self) -> Option<i32> {
        Some(64)
    }

    fn fingerprint(&self) -> String {
        "ReceivedCountConversion".into()
    }
}

type ConversionFn = dyn Fn(&Value, &mut ConversionContext<'_, '_>) -> Result<Value> + Send + Sync;

/// Conversion backed by a closure
#[derive(Clone)]
pub struct GenericConversion {
    name: String,
    converted_type: Option<DataType>,
    converted_bit_size: Option<i32>,
    f: Arc<ConversionFn>,
}

impl GenericConversion {
    /// Wraps a closure; `name` identifies it in layout fingerprints
    pub fn new<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&Value, &mut ConversionContext<'_, '_>) -> Result<Value> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            converted_type: None,
            converted_bit_size: None,
            f: Arc::new(f),
        }
    }

    /// Declares the converted data type and bit size
    pub fn with_type(mut self, data_type: DataType, bit_size: i32) -> Self {
        self.converted_type = Some(data_type);
        self.converted_bit_size = Some(bit_size);
        self
    }
}

impl fmt::Debug for GenericConversion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GenericConversion")
            .field("name", &self.name)
            .field("converted_type", &self.converted_type)
            .finish_non_exhaustive()
    }
}

impl Conversion for GenericConversion {
    fn call(&self, value: &Value, ctx: &mut ConversionContext<'_, '_>) -> Result<Value> {
        (self.f)(value, ctx)
    }

    fn converted_type(&self) -> Option<DataType> {
        self.converted_type
    }

    fn converted_bit_size(&self) -> Option<i32> {
        self.converted_bit_size
    }

    fn fingerprint(&self) -> String {
        format!("GenericConversion {}", self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{Packet, PacketItem};
    use crate::structure::Endianness;
    use chrono::TimeZone;

    fn run(conversion: &dyn Conversion, packet: &Packet, value: Value) -> Result<Value> {
        let mut guard = packet.lock();
        let mut ctx = ConversionContext::new(packet, &mut guard);
        conversion.call(&value, &mut ctx)
    }

    fn packet() -> Packet {
        let mut packet = Packet::new("INST", "PKT", Endianness::Big);
        packet
            .append_item(PacketItem::new("RAW", 0, 8, DataType::Uint).unwrap())
            .unwrap();
        packet
    }

    #[test]
    fn test_polynomial() {
        let p = packet();
        let poly = PolynomialConversion::new(vec![1.0, 2.0, 0.5]).unwrap();
        assert_eq!(run(&poly, &p, Value::UInt(2)).unwrap(), Value::Float(7.0));
        assert_eq!(
            run(&poly, &p, Value::Array(vec![Value::Int(0), Value::Int(2)])).unwrap(),
            Value::Array(vec![Value::Float(1.0), Value::Float(7.0)])
        );
        assert!(run(&poly, &p, Value::Block(vec![1])).is_err());
        assert!(PolynomialConversion::new(vec![]).is_err());
    }

    #[test]
    fn test_segmented_polynomial() {
        let p = packet();
        let mut seg = SegmentedPolynomialConversion::new();
        seg.add_segment(0.0, vec![0.0, 1.0]).unwrap();
        seg.add_segment(10.0, vec![100.0]).unwrap();
        assert_eq!(run(&seg, &p, Value::Int(5)).unwrap(), Value::Float(5.0));
        assert_eq!(run(&seg, &p, Value::Int(10)).unwrap(), Value::Float(100.0));
        // below every bound falls back to the lowest segment
        assert_eq!(run(&seg, &p, Value::Int(-3)).unwrap(), Value::Float(-3.0));
    }

    #[test]
    fn test_received_time_conversions() {
        let p = packet();
        assert_eq!(
            run(&ReceivedTimeFormattedConversion, &p, Value::Null).unwrap(),
            Value::from("No Packet Received Time")
        );
        let time = Utc.with_ymd_and_hms(2024, 3, 5, 12, 30, 15).unwrap();
        p.set_received_time(Some(time));
        p.set_received_count(7);
        assert_eq!(
            run(&ReceivedTimeFormattedConversion, &p, Value::Null).unwrap(),
            Value::from("2024/03/05 12:30:15.000")
        );
        assert_eq!(
            run(&ReceivedTimeSecondsConversion, &p, Value::Null).unwrap(),
            Value::Float(time.timestamp() as f64)
        );
        assert_eq!(
            run(&ReceivedCountConversion, &p, Value::Null).unwrap(),
            Value::UInt(7)
        );
    }

    #[test]
    fn test_generic_reads_siblings() {
        let p = packet();
        p.write("RAW", Value::UInt(21), ValueType::Raw).unwrap();
        let double = GenericConversion::new("double", |_, ctx| {
            let raw = ctx.read("RAW", ValueType::Raw)?;
            Ok(Value::from_i128(raw.to_integer()? * 2))
        });
        assert_eq!(run(&double, &p, Value::Null).unwrap(), Value::Int(42));
        assert_eq!(double.fingerprint(), "GenericConversion double");
    }
}
