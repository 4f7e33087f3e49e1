//! Packets: structures with value types, conversions, states and limits.
//!
//! A [`Packet`] owns a [`Structure`] of [`PacketItem`]s. Every read or write
//! names a [`ValueType`]:
//!
//! - `RAW` is exactly what the buffer bits hold;
//! - `CONVERTED` runs the read conversion and then maps the result through
//!   the item's states;
//! - `FORMATTED` renders the converted value through the format string;
//! - `WITH_UNITS` appends the units to the formatted text.
//!
//! Converted values are cached per buffer. The cache, the received time and
//! count, and the limits runtime live next to the buffer under the same lock,
//! so each instance created with [`Packet::instance`] has its own.
//!
//! # Example
//!
//! ```
//! use pktdef_core::packet::{Packet, PacketItem, ValueType};
//! use pktdef_core::structure::{DataType, Endianness};
//!
//! let mut packet = Packet::new("INST", "HEALTH", Endianness::Big);
//! packet.append_item(PacketItem::new("TEMP", 0, 16, DataType::Uint).unwrap()).unwrap();
//! packet.set_buffer(&[0x01, 0x00]).unwrap();
//! assert_eq!(packet.read("TEMP", ValueType::Raw).unwrap().to_string(), "256");
//! ```

pub mod conversion;
pub mod format;
pub mod item;
pub mod limits;

pub use conversion::{
    Conversion, ConversionContext, GenericConversion, PolynomialConversion,
    ReceivedCountConversion, ReceivedTimeFormattedConversion, ReceivedTimeSecondsConversion,
    SegmentedPolynomialConversion,
};
pub use item::{PacketItem, State, StateValue, States};
pub use limits::{Limits, LimitsBand, LimitsChange, LimitsRuntime, LimitsState, DEFAULT_LIMITS_SET};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::ser::{Serialize, SerializeMap, Serializer};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, trace};

use crate::error::{Error, Result};
use crate::structure::{
    BinaryAccessor, BufferExt, BufferGuard, DataType, Endianness, Structure, StructureItem,
};
use crate::value::Value;

/// View of an item's value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    /// Buffer bits
    Raw,
    /// After the read conversion and states
    Converted,
    /// Converted, rendered as text
    Formatted,
    /// Formatted with units appended
    WithUnits,
}

impl ValueType {
    /// Returns the keyword for this value type
    pub fn as_str(&self) -> &'static str {
        match self {
            ValueType::Raw => "RAW",
            ValueType::Converted => "CONVERTED",
            ValueType::Formatted => "FORMATTED",
            ValueType::WithUnits => "WITH_UNITS",
        }
    }
}

impl TryFrom<&str> for ValueType {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self> {
        match value.to_ascii_uppercase().as_str() {
            "RAW" => Ok(ValueType::Raw),
            "CONVERTED" => Ok(ValueType::Converted),
            "FORMATTED" => Ok(ValueType::Formatted),
            "WITH_UNITS" => Ok(ValueType::WithUnits),
            _ => Err(Error::UnknownValueType(value.to_string())),
        }
    }
}

impl std::str::FromStr for ValueType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::try_from(s)
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-instance state guarded with the buffer
#[derive(Debug, Clone, Default)]
pub struct PacketState {
    pub(crate) received_time: Option<DateTime<Utc>>,
    pub(crate) received_count: u64,
    cache: HashMap<usize, Arc<Value>>,
    limits: HashMap<usize, LimitsRuntime>,
}

impl BufferExt for PacketState {
    fn buffer_changed(&mut self) {
        self.cache.clear();
    }
}

/// Lock guard over a packet's buffer and instance state
pub type PacketGuard<'a> = BufferGuard<'a, PacketItem, PacketState>;

/// Result of a command validator check
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Check {
    /// `Some(false)` fails the command; `None` means no opinion
    pub passed: Option<bool>,
    /// Optional explanation
    pub message: Option<String>,
}

impl Check {
    /// A passing check
    pub fn pass() -> Self {
        Self {
            passed: Some(true),
            message: None,
        }
    }

    /// A failing check with a reason
    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            passed: Some(false),
            message: Some(message.into()),
        }
    }
}

/// Checks run before and after a command is sent
pub trait CommandValidator: fmt::Debug + Send + Sync {
    /// Runs before the command is sent
    fn pre_check(&self, command: &Packet) -> Result<Check>;

    /// Runs after the command is sent
    fn post_check(&self, _command: &Packet) -> Result<Check> {
        Ok(Check::default())
    }
}

/// Flattened snapshot of every item's values.
///
/// Keys are the item name for RAW, plus `__C`, `__F`, `__U` and `__L`
/// suffixes for the converted, formatted, with-units and limits views when
/// the item has them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Decom {
    entries: Vec<(String, Value)>,
}

impl Decom {
    fn insert(&mut self, key: String, value: Value) {
        self.entries.push((key, value));
    }

    /// Value for a key
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Keys in layout order
    pub fn keys(&self) -> impl Iterator<Item = &str> + '_ {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    /// Entries in layout order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> + '_ {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if there are no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Serialize for Decom {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (key, value) in &self.entries {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

/// A command or telemetry packet definition and instance
#[derive(Debug, Clone)]
pub struct Packet {
    target_name: String,
    packet_name: String,
    description: Option<String>,
    hazardous: Option<String>,
    is_virtual: bool,
    hidden: bool,
    disabled: bool,
    restricted: bool,
    validator: Option<Arc<dyn CommandValidator>>,
    structure: Structure<PacketItem, PacketState>,
    id_items: Vec<usize>,
    limits_items: Vec<usize>,
    obfuscated_items: Vec<usize>,
}

impl Packet {
    /// Creates an empty packet; names are uppercased
    pub fn new(target_name: &str, packet_name: &str, default_endianness: Endianness) -> Self {
        Self {
            target_name: target_name.to_uppercase(),
            packet_name: packet_name.to_uppercase(),
            description: None,
            hazardous: None,
            is_virtual: false,
            hidden: false,
            disabled: false,
            restricted: false,
            validator: None,
            structure: Structure::new(default_endianness),
            id_items: Vec::new(),
            limits_items: Vec::new(),
            obfuscated_items: Vec::new(),
        }
    }

    /// Target name
    pub fn target_name(&self) -> &str {
        &self.target_name
    }

    /// Packet name
    pub fn packet_name(&self) -> &str {
        &self.packet_name
    }

    /// Description
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Sets the description
    pub fn set_description(&mut self, description: impl Into<String>) {
        self.description = Some(description.into());
    }

    /// Marks the whole packet hazardous, with an optional description
    pub fn set_hazardous(&mut self, description: Option<String>) {
        self.hazardous = Some(description.unwrap_or_default());
    }

    /// Only selectable by name, never identified
    pub fn is_virtual(&self) -> bool {
        self.is_virtual
    }

    /// Sets the virtual flag
    pub fn set_virtual(&mut self, is_virtual: bool) {
        self.is_virtual = is_virtual;
    }

    /// Hidden from listings
    pub fn hidden(&self) -> bool {
        self.hidden
    }

    /// Sets the hidden flag
    pub fn set_hidden(&mut self, hidden: bool) {
        self.hidden = hidden;
    }

    /// Disabled packets are also hidden
    pub fn disabled(&self) -> bool {
        self.disabled
    }

    /// Sets the disabled flag, which also hides the packet
    pub fn set_disabled(&mut self, disabled: bool) {
        self.disabled = disabled;
        if disabled {
            self.hidden = true;
        }
    }

    /// Restricted commands need extra authorization to send
    pub fn restricted(&self) -> bool {
        self.restricted
    }

    /// Sets the restricted flag
    pub fn set_restricted(&mut self, restricted: bool) {
        self.restricted = restricted;
    }

    /// Accepts buffers shorter than the defined length
    pub fn set_short_buffer_allowed(&mut self, allowed: bool) {
        self.structure.set_short_buffer_allowed(allowed);
    }

    /// Suppresses overlap warnings
    pub fn set_ignore_overlap(&mut self, ignore: bool) {
        self.structure.set_ignore_overlap(ignore);
    }

    /// Command validator
    pub fn validator(&self) -> Option<&Arc<dyn CommandValidator>> {
        self.validator.as_ref()
    }

    /// Sets the command validator
    pub fn set_validator(&mut self, validator: Arc<dyn CommandValidator>) {
        self.validator = Some(validator);
    }

    /// The underlying structure
    pub fn structure(&self) -> &Structure<PacketItem, PacketState> {
        &self.structure
    }

    /// Defined length in bytes
    pub fn defined_length(&self) -> usize {
        self.structure.defined_length()
    }

    // ----- definition -----

    /// Defines an item, replacing any existing item with the same name
    pub fn define_item(&mut self, item: PacketItem) -> Result<()> {
        self.structure.define(item).map_err(|e| self.context(e, ""))?;
        self.refresh_indexes();
        Ok(())
    }

    /// Defines an item at the current end of the packet
    pub fn append_item(&mut self, item: PacketItem) -> Result<()> {
        self.structure.append(item).map_err(|e| self.context(e, ""))?;
        self.refresh_indexes();
        Ok(())
    }

    /// Modifies an item in place
    pub fn update_item<F>(&mut self, name: &str, update: F) -> Result<()>
    where
        F: FnOnce(&mut PacketItem) -> Result<()>,
    {
        self.structure.update_item(name, update)?;
        self.refresh_indexes();
        Ok(())
    }

    /// Renames an item
    pub fn rename_item(&mut self, old: &str, new: &str) -> Result<()> {
        self.structure.rename_item(old, new)?;
        self.refresh_indexes();
        Ok(())
    }

    /// Removes an item
    pub fn delete_item(&mut self, name: &str) -> Result<PacketItem> {
        let item = self.structure.delete_item(name)?;
        self.refresh_indexes();
        Ok(item)
    }

    /// Adds the DERIVED received time and count items
    pub fn add_received_items(&mut self) -> Result<()> {
        let builtins: [(&str, Arc<dyn Conversion>, &str); 3] = [
            (
                "RECEIVED_TIMESECONDS",
                Arc::new(ReceivedTimeSecondsConversion),
                "Time the packet was received, in seconds since the Unix epoch",
            ),
            (
                "RECEIVED_TIMEFORMATTED",
                Arc::new(ReceivedTimeFormattedConversion),
                "Time the packet was received, formatted",
            ),
            (
                "RECEIVED_COUNT",
                Arc::new(ReceivedCountConversion),
                "Number of times the packet has been received",
            ),
        ];
        for (name, conversion, description) in builtins {
            let mut item = PacketItem::new(name, 0, 0, DataType::Derived)?;
            item.set_read_conversion(conversion);
            item.set_description(description);
            self.define_item(item)?;
        }
        Ok(())
    }

    fn refresh_indexes(&mut self) {
        let layout = self.structure.layout();
        let sorted = layout.sorted_indices();
        self.id_items = sorted
            .iter()
            .copied()
            .filter(|&i| layout.item_at(i).id_value().is_some())
            .collect();
        self.limits_items = sorted
            .iter()
            .copied()
            .filter(|&i| layout.item_at(i).has_limits())
            .collect();
        self.obfuscated_items = sorted
            .iter()
            .copied()
            .filter(|&i| layout.item_at(i).obfuscate())
            .collect();
    }

    /// Item by name
    pub fn get_item(&self, name: &str) -> Result<&PacketItem> {
        self.structure.get_item(name)
    }

    /// Items in definition order
    pub fn items(&self) -> impl Iterator<Item = &PacketItem> + '_ {
        self.structure.layout().items()
    }

    /// Items in layout order
    pub fn sorted_items(&self) -> impl Iterator<Item = &PacketItem> + '_ {
        self.structure.layout().sorted_items()
    }

    /// Items with an identification value, in layout order
    pub fn id_items(&self) -> impl Iterator<Item = &PacketItem> + '_ {
        let layout = self.structure.layout();
        self.id_items.iter().map(move |&i| layout.item_at(i))
    }

    /// Items with limits or colored states, in layout order
    pub fn limits_items(&self) -> impl Iterator<Item = &PacketItem> + '_ {
        let layout = self.structure.layout();
        self.limits_items.iter().map(move |&i| layout.item_at(i))
    }

    pub(crate) fn index_of(&self, name: &str) -> Result<usize> {
        self.structure
            .layout()
            .index_of(name)
            .ok_or_else(|| self.context(Error::UnknownItem(name.to_uppercase()), name))
    }

    /// Overlap warnings prefixed with the packet name
    pub fn check_bit_offsets(&self) -> Vec<String> {
        self.structure
            .check_bit_offsets()
            .into_iter()
            .map(|w| format!("{} {}: {}", self.target_name, self.packet_name, w))
            .collect()
    }

    fn context(&self, error: Error, item: &str) -> Error {
        error.with_context(&self.target_name, &self.packet_name, item)
    }

    // ----- buffer -----

    /// Takes the instance lock
    pub fn lock(&self) -> PacketGuard<'_> {
        self.structure.lock()
    }

    /// Replaces the buffer with a copy of `bytes`
    pub fn set_buffer(&self, bytes: &[u8]) -> Result<()> {
        trace!(
            "Setting {} {} buffer of {} bytes",
            self.target_name,
            self.packet_name,
            bytes.len()
        );
        self.structure.set_buffer(bytes)
    }

    /// Copy of the buffer
    pub fn buffer(&self) -> Vec<u8> {
        self.structure.buffer()
    }

    /// Time the current buffer was received
    pub fn received_time(&self) -> Option<DateTime<Utc>> {
        self.lock().ext().received_time
    }

    /// Sets the received time, invalidating cached conversions
    pub fn set_received_time(&self, time: Option<DateTime<Utc>>) {
        let mut guard = self.lock();
        let state = guard.ext_mut();
        state.received_time = time;
        state.cache.clear();
    }

    /// Number of buffers received
    pub fn received_count(&self) -> u64 {
        self.lock().ext().received_count
    }

    /// Sets the received count, invalidating cached conversions
    pub fn set_received_count(&self, count: u64) {
        let mut guard = self.lock();
        let state = guard.ext_mut();
        state.received_count = count;
        state.cache.clear();
    }

    /// Counts one more received buffer and returns the new count
    pub fn increment_received_count(&self) -> u64 {
        let mut guard = self.lock();
        let state = guard.ext_mut();
        state.received_count += 1;
        state.cache.clear();
        state.received_count
    }

    /// Clears received metadata and limits runtime
    pub fn reset(&self) {
        let mut guard = self.lock();
        *guard.ext_mut() = PacketState::default();
    }

    /// Copy of this packet with its own buffer and instance state.
    ///
    /// The layout and definitions stay shared.
    pub fn instance(&self) -> Packet {
        self.clone()
    }

    // ----- reads and writes -----

    /// Reads one item
    pub fn read(&self, name: &str, value_type: ValueType) -> Result<Value> {
        let index = self.index_of(name)?;
        let mut guard = self.lock();
        self.read_locked(&mut guard, index, value_type)
            .map_err(|e| self.context(e, name))
    }

    /// Reads one item unless another thread holds the lock
    pub fn try_read(&self, name: &str, value_type: ValueType) -> Option<Result<Value>> {
        let index = match self.index_of(name) {
            Ok(index) => index,
            Err(e) => return Some(Err(e)),
        };
        let mut guard = self.structure.try_lock()?;
        Some(
            self.read_locked(&mut guard, index, value_type)
                .map_err(|e| self.context(e, name)),
        )
    }

    /// Reads every item in layout order
    pub fn read_all(&self, value_type: ValueType) -> Result<Vec<(String, Value)>> {
        let mut guard = self.lock();
        let layout = guard.layout();
        layout
            .sorted_indices()
            .iter()
            .map(|&index| {
                let name = layout.item_at(index).name();
                self.read_locked(&mut guard, index, value_type)
                    .map(|v| (name.to_string(), v))
                    .map_err(|e| self.context(e, name))
            })
            .collect()
    }

    /// Writes one item
    pub fn write(&self, name: &str, value: impl Into<Value>, value_type: ValueType) -> Result<()> {
        let index = self.index_of(name)?;
        let mut guard = self.lock();
        self.write_locked(&mut guard, index, &value.into(), value_type)
            .map_err(|e| self.context(e, name))
    }

    pub(crate) fn read_locked(
        &self,
        guard: &mut PacketGuard<'_>,
        index: usize,
        value_type: ValueType,
    ) -> Result<Value> {
        let item = guard.layout().item_at(index);
        match value_type {
            ValueType::Raw => {
                if item.as_ref().data_type() == DataType::Derived {
                    self.conversion_value(guard, index)
                } else {
                    guard.read_index(index)
                }
            }
            ValueType::Converted => self.converted_value(guard, index).map(|(v, _)| v),
            ValueType::Formatted | ValueType::WithUnits => {
                let (value, from_state) = self.converted_value(guard, index)?;
                let text = if from_state {
                    value
                } else {
                    format_item(item, &value)?
                };
                Ok(match (value_type, item.units()) {
                    (ValueType::WithUnits, Some(units)) => with_units(text, units),
                    _ => text,
                })
            }
        }
    }

    /// Read conversion output, or RAW when the item has none
    fn conversion_value(&self, guard: &mut PacketGuard<'_>, index: usize) -> Result<Value> {
        let item = guard.layout().item_at(index);
        let derived = item.as_ref().data_type() == DataType::Derived;
        let Some(conversion) = item.read_conversion() else {
            return if derived {
                Ok(Value::Null)
            } else {
                guard.read_index(index)
            };
        };
        if let Some(cached) = guard.ext().cache.get(&index) {
            return Ok(Value::clone(cached));
        }
        let raw = if derived {
            Value::Null
        } else {
            guard.read_index(index)?
        };
        let converted = {
            let mut ctx = ConversionContext::new(self, guard);
            conversion.call(&raw, &mut ctx)?
        };
        guard
            .ext_mut()
            .cache
            .insert(index, Arc::new(converted.clone()));
        Ok(converted)
    }

    /// Converted value and whether it came from a state name
    fn converted_value(&self, guard: &mut PacketGuard<'_>, index: usize) -> Result<(Value, bool)> {
        let item = guard.layout().item_at(index);
        let value = self.conversion_value(guard, index)?;
        let Some(states) = item.states() else {
            return Ok((value, false));
        };
        match value {
            Value::Array(values) => Ok((
                Value::Array(
                    values
                        .into_iter()
                        .map(|v| match states.state_for(&v) {
                            Some(state) => Value::String(state.name.clone()),
                            None => v,
                        })
                        .collect(),
                ),
                false,
            )),
            scalar => match states.state_for(&scalar) {
                Some(state) => Ok((Value::String(state.name.clone()), true)),
                None => Ok((scalar, false)),
            },
        }
    }

    pub(crate) fn write_locked(
        &self,
        guard: &mut PacketGuard<'_>,
        index: usize,
        value: &Value,
        value_type: ValueType,
    ) -> Result<()> {
        let item = guard.layout().item_at(index);
        let derived = item.as_ref().data_type() == DataType::Derived;
        match value_type {
            ValueType::Raw => {
                if derived {
                    return Err(Error::read_only(item.name(), "DERIVED items have no buffer bits"));
                }
                guard.write_index(index, value)
            }
            ValueType::Converted => {
                let mut value = match item.states() {
                    Some(states) => states.value_for(item.name(), value)?,
                    None => {
                        item.range_check(value)?;
                        value.clone()
                    }
                };
                match item.write_conversion() {
                    Some(conversion) => {
                        let mut ctx = ConversionContext::new(self, guard);
                        value = conversion.call(&value, &mut ctx)?;
                    }
                    None if derived => {
                        return Err(Error::read_only(
                            item.name(),
                            "DERIVED items need a write conversion",
                        ));
                    }
                    None => {}
                }
                if derived {
                    return Ok(());
                }
                guard.write_index(index, &value)
            }
            ValueType::Formatted | ValueType::WithUnits => Err(Error::read_only(
                item.name(),
                format!("{} values cannot be written", value_type),
            )),
        }
    }

    /// Writes every parameter's default value
    pub fn restore_defaults(&self) -> Result<()> {
        let mut guard = self.lock();
        let layout = guard.layout();
        for &index in layout.sorted_indices() {
            let item = layout.item_at(index);
            let Some(default) = item.default_value() else {
                continue;
            };
            if item.as_ref().data_type() == DataType::Derived {
                continue;
            }
            self.write_locked(&mut guard, index, default, ValueType::Converted)
                .map_err(|e| self.context(e, item.name()))?;
        }
        Ok(())
    }

    /// Fails if a required parameter is missing from `given`
    pub fn check_required<'n>(&self, given: impl IntoIterator<Item = &'n str>) -> Result<()> {
        let given: Vec<String> = given.into_iter().map(str::to_uppercase).collect();
        for item in self.sorted_items().filter(|i| i.required()) {
            if !given.iter().any(|g| g == item.name()) {
                return Err(self.context(
                    Error::invalid_value(item.as_ref().data_type(), "required parameter not given"),
                    item.name(),
                ));
            }
        }
        Ok(())
    }

    // ----- identification -----

    /// Returns true if `buffer` holds this packet.
    ///
    /// Every ID item read from `buffer` must equal its id value. Short
    /// buffers read as zero past their end. A packet without ID items
    /// matches everything.
    pub fn identify(&self, buffer: &[u8]) -> bool {
        let layout = self.structure.layout();
        self.id_items.iter().all(|&index| {
            let item = layout.item_at(index);
            let expected = item.id_value();
            BinaryAccessor::read(item.as_ref(), &item.as_ref().geometry(), buffer)
                .map(|v| expected.map(|e| v.raw_eq(e)).unwrap_or(false))
                .unwrap_or(false)
        })
    }

    /// ID values read from `buffer`, in layout order
    pub fn read_id_values(&self, buffer: &[u8]) -> Option<Vec<Value>> {
        let layout = self.structure.layout();
        self.id_items
            .iter()
            .map(|&index| {
                let item = layout.item_at(index).as_ref();
                BinaryAccessor::read(item, &item.geometry(), buffer).ok()
            })
            .collect()
    }

    /// Declared ID values, in layout order
    pub fn id_values(&self) -> Vec<Value> {
        self.id_items().filter_map(|i| i.id_value().cloned()).collect()
    }

    /// Description of where the ID items sit; equal for packets that can
    /// share a hash lookup
    pub(crate) fn id_signature(&self) -> Vec<String> {
        self.id_items()
            .map(|i| {
                let item = i.as_ref();
                format!(
                    "{} {} {} {} {:?}",
                    item.bit_offset(),
                    item.bit_size(),
                    item.data_type(),
                    item.endianness(),
                    item.array_size()
                )
            })
            .collect()
    }

    // ----- limits -----

    /// Runs the limits check; see [`Packet::check_limits_with`]
    pub fn check_limits(&self, limits_set: &str, ignore_persistence: bool) -> Vec<LimitsChange> {
        self.check_limits_with(limits_set, ignore_persistence, |_| {})
    }

    /// Evaluates every enabled item with limits against its current value.
    ///
    /// Colored states are applied at once. Numeric limits go through the
    /// persistence filter of [`LimitsRuntime::update`]. `callback` is called
    /// for each committed change after the lock is released.
    pub fn check_limits_with<F>(
        &self,
        limits_set: &str,
        ignore_persistence: bool,
        mut callback: F,
    ) -> Vec<LimitsChange>
    where
        F: FnMut(&LimitsChange),
    {
        let limits_set = limits_set.to_uppercase();
        let mut changes = Vec::new();
        {
            let mut guard = self.lock();
            let layout = guard.layout();
            for &index in &self.limits_items {
                let item = layout.item_at(index);
                if !runtime(&mut guard, item, index).enabled {
                    continue;
                }
                let value = match self.conversion_value(&mut guard, index) {
                    Ok(value) => value,
                    Err(e) => {
                        debug!("Skipping limits for {}: {}", item.name(), e);
                        continue;
                    }
                };

                let change = match (item.states().filter(|s| s.has_colors()), item.limits()) {
                    (Some(states), _) => {
                        let state = states.state_for(&value);
                        let color = state.and_then(|s| s.color);
                        let reported = state
                            .map(|s| Value::String(s.name.clone()))
                            .unwrap_or_else(|| value.clone());
                        runtime(&mut guard, item, index)
                            .set_state_color(color)
                            .map(|previous| (previous, color, reported))
                    }
                    (None, Some(limits)) => {
                        let (Some(x), Some(band)) = (value.as_f64(), limits.band(&limits_set))
                        else {
                            continue;
                        };
                        let computed = band.evaluate(x);
                        runtime(&mut guard, item, index)
                            .update(computed, limits.persistence(), ignore_persistence)
                            .map(|previous| (previous, Some(computed), value.clone()))
                    }
                    (None, None) => None,
                };

                if let Some((old_state, new_state, value)) = change {
                    info!(
                        "{} {} {} limits change {} -> {} ({})",
                        self.target_name,
                        self.packet_name,
                        item.name(),
                        old_state.map(|s| s.as_str()).unwrap_or("NONE"),
                        new_state.map(|s| s.as_str()).unwrap_or("NONE"),
                        value
                    );
                    changes.push(LimitsChange {
                        target: self.target_name.clone(),
                        packet: self.packet_name.clone(),
                        item: item.name().to_string(),
                        old_state,
                        new_state,
                        value,
                    });
                }
            }
        }
        for change in &changes {
            callback(change);
        }
        changes
    }

    fn limits_index(&self, name: &str) -> Result<usize> {
        let index = self.index_of(name)?;
        if !self.limits_items.contains(&index) {
            return Err(self.context(Error::invalid_value("LIMITS", "item has no limits"), name));
        }
        Ok(index)
    }

    /// Enables or disables limits checking of one item in this instance.
    ///
    /// Disabling clears the item's color.
    pub fn set_limits_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        let index = self.limits_index(name)?;
        let mut guard = self.lock();
        let item = guard.layout().item_at(index);
        let runtime = runtime(&mut guard, item, index);
        runtime.enabled = enabled;
        if !enabled {
            runtime.state = None;
            runtime.persistence_count = 0;
        }
        Ok(())
    }

    /// Whether limits checking is enabled for an item
    pub fn limits_enabled(&self, name: &str) -> Result<bool> {
        let index = self.limits_index(name)?;
        let mut guard = self.lock();
        let item = guard.layout().item_at(index);
        Ok(runtime(&mut guard, item, index).enabled)
    }

    /// Current color of an item
    pub fn limits_state(&self, name: &str) -> Result<Option<LimitsState>> {
        let index = self.index_of(name)?;
        Ok(self.lock().ext().limits.get(&index).and_then(|r| r.state))
    }

    /// Items whose current color needs attention
    pub fn out_of_limits(&self) -> Vec<(String, LimitsState)> {
        let guard = self.lock();
        let layout = guard.layout();
        self.limits_items
            .iter()
            .filter_map(|&index| {
                let state = guard.ext().limits.get(&index)?.state?;
                (!state.is_good()).then(|| (layout.item_at(index).name().to_string(), state))
            })
            .collect()
    }

    // ----- snapshots -----

    /// Flattened snapshot of every item
    pub fn decom(&self) -> Result<Decom> {
        let mut guard = self.lock();
        self.decom_locked(&mut guard)
    }

    /// Snapshot unless another thread holds the lock
    pub fn try_decom(&self) -> Option<Result<Decom>> {
        let mut guard = self.structure.try_lock()?;
        Some(self.decom_locked(&mut guard))
    }

    fn decom_locked(&self, guard: &mut PacketGuard<'_>) -> Result<Decom> {
        let mut decom = Decom::default();
        let layout = guard.layout();
        for &index in layout.sorted_indices() {
            let item = layout.item_at(index);
            let name = item.name();
            let derived = item.as_ref().data_type() == DataType::Derived;
            let mut views = vec![(name.to_string(), ValueType::Raw)];
            if item.states().is_some() || (item.read_conversion().is_some() && !derived) {
                views.push((format!("{}__C", name), ValueType::Converted));
            }
            if item.format_string().is_some() {
                views.push((format!("{}__F", name), ValueType::Formatted));
            }
            if item.units().is_some() {
                views.push((format!("{}__U", name), ValueType::WithUnits));
            }
            for (key, value_type) in views {
                let value = self
                    .read_locked(guard, index, value_type)
                    .map_err(|e| self.context(e, name))?;
                decom.insert(key, value);
            }
            if let Some(state) = guard.ext().limits.get(&index).and_then(|r| r.state) {
                decom.insert(format!("{}__L", name), Value::from(state.as_str()));
            }
        }
        Ok(decom)
    }

    /// Copy of the buffer with obfuscated items zeroed.
    ///
    /// The live buffer is left untouched.
    pub fn obfuscated_buffer(&self) -> Result<Bytes> {
        let guard = self.lock();
        let mut buffer = guard.buffer().to_vec();
        let length = buffer.len();
        let layout = guard.layout();
        for &index in &self.obfuscated_items {
            let item: &StructureItem = layout.item_at(index).as_ref();
            let geometry = guard.geometry(index);
            let extent = guard.extent(index)?;
            if item.data_type().is_bytes()
                || (item.array_size().is_some() && extent.bit_offset % 8 == 0 && extent.total_bits() % 8 == 0)
            {
                let start = (extent.bit_offset / 8).min(buffer.len());
                let end = extent.end_byte().min(buffer.len());
                buffer[start..end].fill(0);
                continue;
            }
            let zero = match item.data_type() {
                DataType::Float => Value::Float(0.0),
                _ => Value::Int(0),
            };
            let zero = match extent.count {
                Some(count) => Value::Array(vec![zero; count]),
                None => zero,
            };
            BinaryAccessor::write(item, &geometry, &zero, &mut buffer)
                .map_err(|e| self.context(e, item.name()))?;
        }
        buffer.truncate(length);
        Ok(Bytes::from(buffer))
    }

    /// Digest of the packet's layout.
    ///
    /// Covers the target and packet names and every item's geometry, type,
    /// states and conversions. Changes whenever a stored buffer of this
    /// packet would decode differently.
    pub fn config_name(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(format!("{} {}\n", self.target_name, self.packet_name).as_bytes());
        for item in self.sorted_items() {
            hasher.update(item.fingerprint().as_bytes());
            hasher.update(b"\n");
        }
        hasher.finalize().to_hex().to_string()
    }

    // ----- commands -----

    /// Hazard description when the packet, or a state of its current
    /// values, is hazardous
    pub fn hazardous_description(&self) -> Option<String> {
        if let Some(description) = &self.hazardous {
            return Some(description.clone());
        }
        let mut guard = self.lock();
        let layout = guard.layout();
        for &index in layout.sorted_indices() {
            let item = layout.item_at(index);
            let Some(states) = item.states() else {
                continue;
            };
            if states.iter().all(|s| s.hazardous.is_none()) {
                continue;
            }
            let Ok(value) = self.conversion_value(&mut guard, index) else {
                continue;
            };
            if let Some(state) = states.state_for(&value) {
                if let Some(description) = &state.hazardous {
                    return Some(format!("{} = {}: {}", item.name(), state.name, description));
                }
            }
        }
        None
    }

    /// Returns true if sending this command needs confirmation
    pub fn is_hazardous(&self) -> bool {
        self.hazardous_description().is_some()
    }

    /// Runs the validator's pre-send check
    pub fn pre_check(&self) -> Result<Check> {
        match &self.validator {
            Some(validator) => validator.pre_check(self),
            None => Ok(Check::default()),
        }
    }

    /// Runs the validator's post-send check
    pub fn post_check(&self) -> Result<Check> {
        match &self.validator {
            Some(validator) => validator.post_check(self),
            None => Ok(Check::default()),
        }
    }
}

fn runtime<'g>(guard: &'g mut PacketGuard<'_>, item: &PacketItem, index: usize) -> &'g mut LimitsRuntime {
    let enabled = item.limits().map(Limits::enabled).unwrap_or(true);
    guard
        .ext_mut()
        .limits
        .entry(index)
        .or_insert_with(|| LimitsRuntime::new(enabled))
}

fn format_item(item: &PacketItem, value: &Value) -> Result<Value> {
    let render = |v: &Value| -> Result<String> {
        match item.format_string() {
            Some(format) if !v.is_null() => format::format_value(format, v),
            _ => Ok(v.to_string()),
        }
    };
    match value {
        Value::Array(values) => values
            .iter()
            .map(|v| render(v).map(Value::String))
            .collect::<Result<Vec<_>>>()
            .map(Value::Array),
        other => render(other).map(Value::String),
    }
}

fn with_units(text: Value, units: &str) -> Value {
    match text {
        Value::Array(values) => Value::Array(
            values
                .into_iter()
                .map(|v| Value::String(format!("{} {}", v, units)))
                .collect(),
        ),
        other => Value::String(format!("{} {}", other, units)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structure::{OverflowPolicy, VariableBitSize};
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn uint(name: &str, offset: i32, size: i32) -> PacketItem {
        PacketItem::new(name, offset, size, DataType::Uint).unwrap()
    }

    fn health() -> Packet {
        let mut packet = Packet::new("inst", "health", Endianness::Big);
        let mut id = uint("OPCODE", 0, 8);
        id.set_id_value(Value::UInt(5));
        packet.append_item(id).unwrap();

        let mut temp = uint("TEMP", 0, 16);
        temp.set_read_conversion(Arc::new(PolynomialConversion::new(vec![0.0, 0.5]).unwrap()));
        temp.set_format_string("%0.1f");
        temp.set_units("Celsius", "C");
        temp.set_limits(Limits::new(LimitsBand::new(0.0, 1.0, 9.0, 10.0).unwrap()));
        packet.append_item(temp).unwrap();

        let mut mode = uint("MODE", 0, 8);
        mode.add_state(State::new("SAFE", StateValue::Exact(Value::UInt(0))).with_color(LimitsState::Yellow));
        mode.add_state(State::new("NOMINAL", StateValue::Exact(Value::UInt(1))).with_color(LimitsState::Green));
        mode.add_state(State::new("BURN", StateValue::Exact(Value::UInt(2))).with_hazardous("fires thrusters"));
        packet.append_item(mode).unwrap();
        packet.add_received_items().unwrap();
        packet
    }

    #[test]
    fn test_value_types() {
        let packet = health();
        packet.set_buffer(&[5, 0x00, 0x0A, 1]).unwrap();
        assert_eq!(packet.read("TEMP", ValueType::Raw).unwrap(), Value::UInt(10));
        assert_eq!(packet.read("TEMP", ValueType::Converted).unwrap(), Value::Float(5.0));
        assert_eq!(packet.read("TEMP", ValueType::Formatted).unwrap(), Value::from("5.0"));
        assert_eq!(packet.read("TEMP", ValueType::WithUnits).unwrap(), Value::from("5.0 C"));
        assert_eq!(packet.read("MODE", ValueType::Converted).unwrap(), Value::from("NOMINAL"));
        assert_eq!(packet.read("MODE", ValueType::WithUnits).unwrap(), Value::from("NOMINAL"));
        assert_eq!(
            "with_units".parse::<ValueType>().unwrap(),
            ValueType::WithUnits
        );
        assert!(matches!(
            ValueType::try_from("BOGUS"),
            Err(Error::UnknownValueType(_))
        ));
    }

    #[test]
    fn test_unknown_state_value_passes_through() {
        let packet = health();
        packet.write("MODE", Value::UInt(9), ValueType::Raw).unwrap();
        assert_eq!(packet.read("MODE", ValueType::Converted).unwrap(), Value::UInt(9));
    }

    #[test]
    fn test_converted_writes() {
        let packet = health();
        packet.write("MODE", "safe", ValueType::Converted).unwrap();
        assert_eq!(packet.read("MODE", ValueType::Raw).unwrap(), Value::UInt(0));

        let err = packet.write("MODE", "LAUNCH", ValueType::Converted).unwrap_err();
        assert!(matches!(err.root(), Error::UnknownState { .. }));
        assert!(err.to_string().starts_with("INST HEALTH MODE:"));

        assert!(packet.write("TEMP", "x", ValueType::Formatted).is_err());
        assert!(packet
            .write("RECEIVED_COUNT", Value::UInt(1), ValueType::Raw)
            .is_err());
    }

    #[test]
    fn test_cache_invalidated_on_write_and_time() {
        let mut packet = Packet::new("INST", "PKT", Endianness::Big);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let mut item = uint("VALUE", 0, 8);
        item.set_read_conversion(Arc::new(GenericConversion::new("count", move |v, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(v.clone())
        })));
        packet.append_item(item).unwrap();

        packet.read("VALUE", ValueType::Converted).unwrap();
        packet.read("VALUE", ValueType::Converted).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        packet.write("VALUE", Value::UInt(3), ValueType::Raw).unwrap();
        assert_eq!(packet.read("VALUE", ValueType::Converted).unwrap(), Value::UInt(3));
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        packet.set_received_time(Some(Utc::now()));
        packet.read("VALUE", ValueType::Converted).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_derived_items() {
        let packet = health();
        let time = Utc.with_ymd_and_hms(2023, 1, 2, 3, 4, 5).unwrap();
        packet.set_received_time(Some(time));
        packet.set_received_count(4);
        assert_eq!(packet.read("RECEIVED_COUNT", ValueType::Raw).unwrap(), Value::UInt(4));
        assert_eq!(
            packet.read("RECEIVED_TIMEFORMATTED", ValueType::Converted).unwrap(),
            Value::from("2023/01/02 03:04:05.000")
        );
    }

    #[test]
    fn test_identify_short_buffer() {
        let packet = health();
        assert!(packet.identify(&[5]));
        assert!(!packet.identify(&[6, 0, 0, 0]));
        assert!(!packet.identify(&[]));
        assert_eq!(packet.read_id_values(&[5]), Some(vec![Value::UInt(5)]));
    }

    #[test]
    fn test_limits_persistence_and_callback() {
        let mut packet = Packet::new("INST", "PKT", Endianness::Big);
        let mut value = uint("VALUE", 0, 8);
        let mut limits = Limits::new(LimitsBand::new(0.0, 1.0, 9.0, 10.0).unwrap());
        limits.set_persistence(3);
        value.set_limits(limits);
        packet.append_item(value).unwrap();

        packet.set_buffer(&[5]).unwrap();
        assert_eq!(packet.check_limits(DEFAULT_LIMITS_SET, false).len(), 1);

        packet.set_buffer(&[11]).unwrap();
        let mut seen = Vec::new();
        for _ in 0..2 {
            let changes = packet.check_limits_with("DEFAULT", false, |c| seen.push(c.clone()));
            assert!(changes.is_empty());
        }
        let changes = packet.check_limits_with("DEFAULT", false, |c| seen.push(c.clone()));
        assert_eq!(changes.len(), 1);
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].old_state, Some(LimitsState::Green));
        assert_eq!(seen[0].new_state, Some(LimitsState::RedHigh));
        assert_eq!(packet.out_of_limits(), vec![("VALUE".to_string(), LimitsState::RedHigh)]);

        packet.set_buffer(&[5]).unwrap();
        let changes = packet.check_limits("DEFAULT", false);
        assert_eq!(changes[0].new_state, Some(LimitsState::Green));
        assert!(packet.out_of_limits().is_empty());
    }

    #[test]
    fn test_state_colors_apply_immediately() {
        let packet = health();
        packet.set_buffer(&[5, 0, 10, 0]).unwrap();
        packet.check_limits("DEFAULT", false);
        assert_eq!(packet.limits_state("MODE").unwrap(), Some(LimitsState::Yellow));
        packet.write("MODE", "NOMINAL", ValueType::Converted).unwrap();
        let changes = packet.check_limits("DEFAULT", false);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].value, Value::from("NOMINAL"));
        assert_eq!(packet.limits_state("MODE").unwrap(), Some(LimitsState::Green));
    }

    #[test]
    fn test_disable_limits() {
        let packet = health();
        packet.set_buffer(&[5, 0, 10, 0]).unwrap();
        packet.check_limits("DEFAULT", true);
        packet.set_limits_enabled("TEMP", false).unwrap();
        assert!(!packet.limits_enabled("TEMP").unwrap());
        assert_eq!(packet.limits_state("TEMP").unwrap(), None);
        assert!(packet.check_limits("DEFAULT", true).iter().all(|c| c.item != "TEMP"));
        assert!(packet.set_limits_enabled("OPCODE", false).is_err());
    }

    #[test]
    fn test_decom_keys() {
        let packet = health();
        packet.set_buffer(&[5, 0, 10, 1]).unwrap();
        packet.check_limits("DEFAULT", true);
        let decom = packet.decom().unwrap();
        let temp_keys: Vec<&str> = decom.keys().filter(|k| k.starts_with("TEMP")).collect();
        assert_eq!(temp_keys, vec!["TEMP", "TEMP__C", "TEMP__F", "TEMP__U", "TEMP__L"]);
        assert_eq!(decom.get("TEMP__L"), Some(&Value::from("GREEN")));
        assert_eq!(decom.get("MODE__C"), Some(&Value::from("NOMINAL")));
        assert!(decom.get("RECEIVED_COUNT__C").is_none());

        let json = serde_json::to_value(&decom).unwrap();
        assert_eq!(json["TEMP__C"], serde_json::json!(5.0));
        assert_eq!(json["OPCODE"], serde_json::json!(5));
    }

    #[test]
    fn test_decom_conversion_and_format_only() {
        let mut packet = Packet::new("INST", "PKT", Endianness::Big);
        let mut item = uint("VOLTS", 0, 8);
        item.set_read_conversion(Arc::new(PolynomialConversion::new(vec![0.0, 2.0]).unwrap()));
        item.set_format_string("%d");
        packet.append_item(item).unwrap();
        let decom = packet.decom().unwrap();
        assert_eq!(decom.keys().collect::<Vec<_>>(), vec!["VOLTS", "VOLTS__C", "VOLTS__F"]);
    }

    #[test]
    fn test_try_decom_when_locked() {
        let packet = health();
        let guard = packet.lock();
        assert!(packet.try_decom().is_none());
        assert!(packet.try_read("TEMP", ValueType::Raw).is_none());
        drop(guard);
        assert!(packet.try_decom().is_some());
    }

    #[test]
    fn test_obfuscated_buffer_is_a_copy() {
        let mut packet = Packet::new("INST", "LOGIN", Endianness::Big);
        packet.append_item(uint("ID", 0, 4)).unwrap();
        let mut key = uint("KEY", 0, 4);
        key.set_obfuscate(true);
        packet.append_item(key).unwrap();
        let mut password = PacketItem::new("PASSWORD", 0, 32, DataType::String).unwrap();
        password.set_obfuscate(true);
        packet.append_item(password).unwrap();

        packet.set_buffer(&[0xAB, b'a', b'b', b'c', b'd']).unwrap();
        let obfuscated = packet.obfuscated_buffer().unwrap();
        assert_eq!(obfuscated.as_ref(), &[0xA0, 0, 0, 0, 0]);
        assert_eq!(packet.buffer(), vec![0xAB, b'a', b'b', b'c', b'd']);
    }

    #[test]
    fn test_obfuscated_little_endian_bitfield_keeps_length() {
        let mut packet = Packet::new("INST", "KEYS", Endianness::Little);
        packet.define_item(uint("HIGH", 8, 4)).unwrap();
        let mut secret = uint("SECRET", 12, 12);
        let field: &mut StructureItem = secret.as_mut();
        field.set_endianness(Endianness::Little).unwrap();
        secret.set_obfuscate(true);
        packet.define_item(secret).unwrap();

        packet.set_buffer(&[0x34, 0x12, 0xEE]).unwrap();
        assert_eq!(packet.read("SECRET", ValueType::Raw).unwrap(), Value::UInt(0x234));
        let obfuscated = packet.obfuscated_buffer().unwrap();
        assert_eq!(obfuscated.as_ref(), &[0x00, 0x10, 0xEE]);
        assert_eq!(packet.buffer(), vec![0x34, 0x12, 0xEE]);
    }

    #[test]
    fn test_config_name() {
        let a = health();
        let b = health();
        assert_eq!(a.config_name(), b.config_name());
        assert_eq!(a.config_name().len(), 64);

        let mut c = health();
        c.update_item("TEMP", |item| {
            item.set_read_conversion(Arc::new(PolynomialConversion::new(vec![1.0, 0.5]).unwrap()));
            Ok(())
        })
        .unwrap();
        assert_ne!(a.config_name(), c.config_name());
    }

    #[test]
    fn test_instance_is_independent() {
        let packet = health();
        packet.set_buffer(&[5, 0, 1, 0]).unwrap();
        let instance = packet.instance();
        instance.set_buffer(&[5, 0, 2, 0]).unwrap();
        instance.set_received_count(9);
        assert_eq!(packet.read("TEMP", ValueType::Raw).unwrap(), Value::UInt(1));
        assert_eq!(packet.received_count(), 0);
        assert_eq!(instance.read("TEMP", ValueType::Raw).unwrap(), Value::UInt(2));
    }

    #[test]
    fn test_command_defaults_range_and_hazards() {
        let mut cmd = Packet::new("INST", "SET", Endianness::Big);
        let mut level = uint("LEVEL", 0, 8);
        level.set_range(Value::Int(0), Value::Int(10));
        level.set_default_value(Value::Int(3));
        level.set_required(true);
        cmd.append_item(level).unwrap();
        let mut mode = uint("MODE", 0, 8);
        mode.add_state(State::new("IDLE", StateValue::Exact(Value::UInt(0))));
        mode.add_state(State::new("BURN", StateValue::Exact(Value::UInt(1))).with_hazardous("fires thrusters"));
        mode.set_default_value(Value::from("IDLE"));
        cmd.append_item(mode).unwrap();

        cmd.restore_defaults().unwrap();
        assert_eq!(cmd.buffer(), vec![3, 0]);
        assert!(!cmd.is_hazardous());

        let err = cmd.write("LEVEL", Value::Int(11), ValueType::Converted).unwrap_err();
        assert!(matches!(err.root(), Error::OutOfRange { .. }));
        cmd.write("LEVEL", Value::Int(11), ValueType::Raw).unwrap();

        cmd.write("MODE", "BURN", ValueType::Converted).unwrap();
        assert_eq!(
            cmd.hazardous_description().as_deref(),
            Some("MODE = BURN: fires thrusters")
        );

        assert!(cmd.check_required(["level"]).is_ok());
        assert!(cmd.check_required(["MODE"]).is_err());
    }

    #[derive(Debug)]
    struct RejectHighLevel;

    impl CommandValidator for RejectHighLevel {
        fn pre_check(&self, command: &Packet) -> Result<Check> {
            let level = command.read("LEVEL", ValueType::Raw)?.to_integer()?;
            Ok(if level > 5 {
                Check::fail("level too high")
            } else {
                Check::pass()
            })
        }
    }

    #[test]
    fn test_validator() {
        let mut cmd = Packet::new("INST", "SET", Endianness::Big);
        cmd.append_item(uint("LEVEL", 0, 8)).unwrap();
        assert_eq!(cmd.pre_check().unwrap(), Check::default());
        cmd.set_validator(Arc::new(RejectHighLevel));
        cmd.write("LEVEL", Value::UInt(7), ValueType::Raw).unwrap();
        assert_eq!(cmd.pre_check().unwrap(), Check::fail("level too high"));
        assert_eq!(cmd.post_check().unwrap(), Check::default());
    }

    #[test]
    fn test_variable_string_packet() {
        let mut packet = Packet::new("INST", "MSG", Endianness::Big);
        packet.append_item(uint("LEN", 0, 8)).unwrap();
        let mut text = PacketItem::with_geometry(
            "TEXT",
            8,
            16,
            DataType::String,
            Endianness::Big,
            None,
            OverflowPolicy::Error,
        )
        .unwrap();
        text.as_mut()
            .set_variable_bit_size(VariableBitSize::new("LEN"))
            .unwrap();
        packet.define_item(text).unwrap();
        packet.append_item(uint("CRC", 0, 16)).unwrap();

        let mut buffer = vec![2, b'h', b'i', 0x12, 0x34];
        packet.set_buffer(&buffer).unwrap();
        assert_eq!(packet.read("CRC", ValueType::Raw).unwrap(), Value::UInt(0x1234));

        buffer = vec![10];
        buffer.extend_from_slice(b"abcdefghij");
        buffer.extend_from_slice(&[0x56, 0x78]);
        packet.set_buffer(&buffer).unwrap();
        let guard = packet.lock();
        let crc = packet.structure().layout().index_of("CRC").unwrap();
        assert_eq!(guard.geometry(crc).bit_offset - 24, (10 - 2) * 8);
        drop(guard);
        assert_eq!(packet.read("CRC", ValueType::Raw).unwrap(), Value::UInt(0x5678));
    }
}
