//! Packet items: a structure field plus its conversions, states and limits.

use std::fmt;
use std::sync::Arc;

use super::conversion::Conversion;
use super::limits::{Limits, LimitsState};
use crate::error::{Error, Result};
use crate::structure::{DataType, Endianness, OverflowPolicy, StructureItem};
use crate::value::Value;

/// Value matched by a state
#[derive(Debug, Clone, PartialEq)]
pub enum StateValue {
    /// Matches one raw value
    Exact(Value),
    /// Matches any value no other state matches
    Any,
}

impl fmt::Display for StateValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateValue::Exact(v) => write!(f, "{}", v),
            StateValue::Any => f.write_str("ANY"),
        }
    }
}

/// One enumerated state of an item
#[derive(Debug, Clone, PartialEq)]
pub struct State {
    /// State name (uppercase)
    pub name: String,
    /// Value the state stands for
    pub value: StateValue,
    /// Limits color shown while the item is in this state
    pub color: Option<LimitsState>,
    /// Set when commanding this state is hazardous; holds the description
    pub hazardous: Option<String>,
}

impl State {
    /// Creates a state with no color
    pub fn new(name: impl AsRef<str>, value: StateValue) -> Self {
        Self {
            name: name.as_ref().to_uppercase(),
            value,
            color: None,
            hazardous: None,
        }
    }

    /// Sets the limits color
    pub fn with_color(mut self, color: LimitsState) -> Self {
        self.color = Some(color);
        self
    }

    /// Marks the state as hazardous
    pub fn with_hazardous(mut self, description: impl Into<String>) -> Self {
        self.hazardous = Some(description.into());
        self
    }
}

/// Ordered set of states of one item
#[derive(Debug, Clone, Default, PartialEq)]
pub struct States {
    states: Vec<State>,
}

impl States {
    /// Adds or replaces a state by name
    pub fn insert(&mut self, state: State) {
        match self.states.iter_mut().find(|s| s.name == state.name) {
            Some(existing) => *existing = state,
            None => self.states.push(state),
        }
    }

    /// States in definition order
    pub fn iter(&self) -> impl Iterator<Item = &State> + '_ {
        self.states.iter()
    }

    /// Returns true if no states are defined
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Returns true if any state carries a color
    pub fn has_colors(&self) -> bool {
        self.states.iter().any(|s| s.color.is_some())
    }

    /// State for a value: an exact match, else the ANY state
    pub fn state_for(&self, value: &Value) -> Option<&State> {
        self.states
            .iter()
            .find(|s| matches!(&s.value, StateValue::Exact(v) if v.raw_eq(value)))
            .or_else(|| self.states.iter().find(|s| s.value == StateValue::Any))
    }

    /// Resolves a value given on a CONVERTED write.
    ///
    /// A state name maps to its value. A value equal to some state's value,
    /// or any value when an ANY state exists, passes through unchanged.
    /// Everything else is an unknown state.
    pub fn value_for(&self, item: &str, value: &Value) -> Result<Value> {
        if let Some(name) = value.as_str() {
            let upper = name.to_uppercase();
            if let Some(state) = self.states.iter().find(|s| s.name == upper) {
                return match &state.value {
                    StateValue::Exact(v) => Ok(v.clone()),
                    StateValue::Any => Err(Error::UnknownState {
                        item: item.to_string(),
                        state: name.to_string(),
                        valid: self.names(),
                    }),
                };
            }
        }
        let known = self.states.iter().any(|s| match &s.value {
            StateValue::Exact(v) => v.raw_eq(value),
            StateValue::Any => true,
        });
        if known {
            Ok(value.clone())
        } else {
            Err(Error::UnknownState {
                item: item.to_string(),
                state: value.to_string(),
                valid: self.names(),
            })
        }
    }

    fn names(&self) -> String {
        self.states
            .iter()
            .map(|s| s.name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// A field of a packet
#[derive(Debug, Clone)]
pub struct PacketItem {
    item: StructureItem,
    description: Option<String>,
    units: Option<String>,
    units_full: Option<String>,
    format_string: Option<String>,
    read_conversion: Option<Arc<dyn Conversion>>,
    write_conversion: Option<Arc<dyn Conversion>>,
    states: Option<States>,
    limits: Option<Limits>,
    id_value: Option<Value>,
    default: Option<Value>,
    minimum: Option<Value>,
    maximum: Option<Value>,
    required: bool,
    obfuscate: bool,
}

impl PacketItem {
    /// Wraps a validated structure item
    pub fn from_item(item: StructureItem) -> Self {
        Self {
            item,
            description: None,
            units: None,
            units_full: None,
            format_string: None,
            read_conversion: None,
            write_conversion: None,
            states: None,
            limits: None,
            id_value: None,
            default: None,
            minimum: None,
            maximum: None,
            required: false,
            obfuscate: false,
        }
    }

    /// Big endian scalar item
    pub fn new(name: impl AsRef<str>, bit_offset: i32, bit_size: i32, data_type: DataType) -> Result<Self> {
        StructureItem::scalar(name, bit_offset, bit_size, data_type).map(Self::from_item)
    }

    /// Item with every geometry parameter given
    pub fn with_geometry(
        name: impl AsRef<str>,
        bit_offset: i32,
        bit_size: i32,
        data_type: DataType,
        endianness: Endianness,
        array_size: Option<i32>,
        overflow: OverflowPolicy,
    ) -> Result<Self> {
        StructureItem::new(name, bit_offset, bit_size, data_type, endianness, array_size, overflow)
            .map(Self::from_item)
    }

    /// Item name
    pub fn name(&self) -> &str {
        self.item.name()
    }

    /// Description
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Sets the description
    pub fn set_description(&mut self, description: impl Into<String>) {
        self.description = Some(description.into());
    }

    /// Units abbreviation
    pub fn units(&self) -> Option<&str> {
        self.units.as_deref()
    }

    /// Full units name
    pub fn units_full(&self) -> Option<&str> {
        self.units_full.as_deref()
    }

    /// Sets the full and abbreviated units
    pub fn set_units(&mut self, full: impl Into<String>, abbreviated: impl Into<String>) {
        self.units_full = Some(full.into());
        self.units = Some(abbreviated.into());
    }

    /// printf-style format string
    pub fn format_string(&self) -> Option<&str> {
        self.format_string.as_deref()
    }

    /// Sets the format string
    pub fn set_format_string(&mut self, format: impl Into<String>) {
        self.format_string = Some(format.into());
    }

    /// Read conversion
    pub fn read_conversion(&self) -> Option<&Arc<dyn Conversion>> {
        self.read_conversion.as_ref()
    }

    /// Sets the read conversion
    pub fn set_read_conversion(&mut self, conversion: Arc<dyn Conversion>) {
        self.read_conversion = Some(conversion);
    }

    /// Write conversion
    pub fn write_conversion(&self) -> Option<&Arc<dyn Conversion>> {
        self.write_conversion.as_ref()
    }

    /// Sets the write conversion
    pub fn set_write_conversion(&mut self, conversion: Arc<dyn Conversion>) {
        self.write_conversion = Some(conversion);
    }

    /// States, if any
    pub fn states(&self) -> Option<&States> {
        self.states.as_ref()
    }

    /// Adds a state, creating the state set if needed
    pub fn add_state(&mut self, state: State) {
        self.states.get_or_insert_with(States::default).insert(state);
    }

    /// Limits definition
    pub fn limits(&self) -> Option<&Limits> {
        self.limits.as_ref()
    }

    /// Limits definition, mutable
    pub fn limits_mut(&mut self) -> Option<&mut Limits> {
        self.limits.as_mut()
    }

    /// Sets the limits definition
    pub fn set_limits(&mut self, limits: Limits) {
        self.limits = Some(limits);
    }

    /// Returns true if the item has limits or colored states
    pub fn has_limits(&self) -> bool {
        self.limits.is_some() || self.states.as_ref().map(States::has_colors).unwrap_or(false)
    }

    /// Identification value
    pub fn id_value(&self) -> Option<&Value> {
        self.id_value.as_ref()
    }

    /// Sets the identification value
    pub fn set_id_value(&mut self, value: Value) {
        self.id_value = Some(value);
    }

    /// Default value for command parameters
    pub fn default_value(&self) -> Option<&Value> {
        self.default.as_ref()
    }

    /// Sets the default value
    pub fn set_default_value(&mut self, value: Value) {
        self.default = Some(value);
    }

    /// Minimum value for command parameters
    pub fn minimum(&self) -> Option<&Value> {
        self.minimum.as_ref()
    }

    /// Maximum value for command parameters
    pub fn maximum(&self) -> Option<&Value> {
        self.maximum.as_ref()
    }

    /// Sets the allowed range
    pub fn set_range(&mut self, minimum: Value, maximum: Value) {
        self.minimum = Some(minimum);
        self.maximum = Some(maximum);
    }

    /// Sets the minimum only
    pub fn set_minimum(&mut self, minimum: Value) {
        self.minimum = Some(minimum);
    }

    /// Sets the maximum only
    pub fn set_maximum(&mut self, maximum: Value) {
        self.maximum = Some(maximum);
    }

    /// Whether a command must supply this parameter
    pub fn required(&self) -> bool {
        self.required
    }

    /// Sets the required flag
    pub fn set_required(&mut self, required: bool) {
        self.required = required;
    }

    /// Whether the item is zeroed in obfuscated buffers
    pub fn obfuscate(&self) -> bool {
        self.obfuscate
    }

    /// Sets the obfuscate flag
    pub fn set_obfuscate(&mut self, obfuscate: bool) {
        self.obfuscate = obfuscate;
    }

    /// Checks a value against the minimum and maximum
    pub fn range_check(&self, value: &Value) -> Result<()> {
        let Some(v) = value.as_f64() else {
            return Ok(());
        };
        let below = self.minimum.as_ref().and_then(Value::as_f64).map(|m| v < m);
        let above = self.maximum.as_ref().and_then(Value::as_f64).map(|m| v > m);
        if below == Some(true) || above == Some(true) {
            let text = |b: &Option<Value>| b.as_ref().map(|v| v.to_string()).unwrap_or_default();
            return Err(Error::OutOfRange {
                item: self.name().to_string(),
                value: value.to_string(),
                minimum: text(&self.minimum),
                maximum: text(&self.maximum),
            });
        }
        Ok(())
    }

    /// Canonical definition line used in layout fingerprints
    pub(crate) fn fingerprint(&self) -> String {
        let item = &self.item;
        let mut line = format!(
            "ITEM {} {} {} {} {} {} {}",
            item.name(),
            item.bit_offset(),
            item.bit_size(),
            item.data_type(),
            item.array_size().map(|a| a.to_string()).unwrap_or_else(|| "-".into()),
            item.endianness(),
            item.overflow(),
        );
        if let Some(states) = &self.states {
            for state in states.iter() {
                line.push_str(&format!(" STATE {}={}", state.name, state.value));
            }
        }
        if let Some(conversion) = &self.read_conversion {
            line.push_str(&format!(" READ {}", conversion.fingerprint()));
        }
        if let Some(conversion) = &self.write_conversion {
            line.push_str(&format!(" WRITE {}", conversion.fingerprint()));
        }
        line
    }
}

impl AsRef<StructureItem> for PacketItem {
    fn as_ref(&self) -> &StructureItem {
        &self.item
    }
}

impl AsMut<StructureItem> for PacketItem {
    fn as_mut(&mut self) -> &mut StructureItem {
        &mut self.item
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn states() -> States {
        let mut states = States::default();
        states.insert(State::new("off", StateValue::Exact(Value::UInt(0))).with_color(LimitsState::Red));
        states.insert(State::new("ON", StateValue::Exact(Value::UInt(1))).with_color(LimitsState::Green));
        states
    }

    #[test]
    fn test_state_lookup() {
        let mut states = states();
        assert_eq!(states.state_for(&Value::Int(1)).map(|s| s.name.as_str()), Some("ON"));
        assert!(states.state_for(&Value::Int(7)).is_none());
        states.insert(State::new("OTHER", StateValue::Any));
        assert_eq!(states.state_for(&Value::Int(7)).map(|s| s.name.as_str()), Some("OTHER"));
    }

    #[test]
    fn test_state_write_resolution() {
        let states = states();
        assert_eq!(states.value_for("PWR", &Value::from("on")).unwrap(), Value::UInt(1));
        assert_eq!(states.value_for("PWR", &Value::Int(0)).unwrap(), Value::Int(0));
        let err = states.value_for("PWR", &Value::from("MAYBE")).unwrap_err();
        assert_eq!(
            err.to_string(),
            "unknown state MAYBE for PWR, must be one of OFF, ON"
        );
        assert!(states.value_for("PWR", &Value::Int(5)).is_err());
    }

    #[test]
    fn test_range_check() {
        let mut item = PacketItem::new("P", 0, 8, DataType::Uint).unwrap();
        item.set_range(Value::Int(0), Value::Int(10));
        assert!(item.range_check(&Value::Int(10)).is_ok());
        assert!(matches!(
            item.range_check(&Value::Int(11)),
            Err(Error::OutOfRange { .. })
        ));
        assert!(item.range_check(&Value::from("text")).is_ok());
    }

    #[test]
    fn test_has_limits_from_colored_states() {
        let mut item = PacketItem::new("P", 0, 8, DataType::Uint).unwrap();
        assert!(!item.has_limits());
        item.add_state(State::new("ON", StateValue::Exact(Value::UInt(1))));
        assert!(!item.has_limits());
        item.add_state(State::new("OFF", StateValue::Exact(Value::UInt(0))).with_color(LimitsState::Red));
        assert!(item.has_limits());
    }
}
