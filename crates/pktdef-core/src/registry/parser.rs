//! Definition keyword processing.
//!
//! The [`DefinitionParser`] consumes `(keyword, params)` pairs and builds a
//! [`Registry`]. Text input is tokenized by [`split_line`]: whitespace
//! separated words, single or double quoted strings, and `#` comments.
//!
//! ```text
//! TELEMETRY INST HEALTH BIG_ENDIAN "Health and status"
//!   APPEND_ID_ITEM OPCODE 8 UINT 1 "Packet id"
//!   APPEND_ITEM TEMP 16 UINT "Board temperature"
//!     POLY_READ_CONVERSION -40.0 0.01
//!     UNITS Celsius C
//!     LIMITS DEFAULT 3 ENABLED -20 -10 50 60
//! ```

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, trace};

use super::{PacketKind, Registry};
use crate::error::{Error, Result};
use crate::packet::format::format_value;
use crate::packet::{
    CommandValidator, Conversion, Limits, LimitsBand, LimitsState, Packet, PacketItem,
    PolynomialConversion, SegmentedPolynomialConversion, State, StateValue, DEFAULT_LIMITS_SET,
};
use crate::structure::{DataType, Endianness, OverflowPolicy, StructureItem, VariableBitSize};
use crate::value::{parse_float, parse_integer, Value};

/// Builds a conversion from its definition parameters
pub type ConversionFactory =
    Arc<dyn Fn(&[String]) -> Result<Arc<dyn Conversion>> + Send + Sync>;

/// Builds a command validator from its definition parameters
pub type ValidatorFactory =
    Arc<dyn Fn(&[String]) -> Result<Arc<dyn CommandValidator>> + Send + Sync>;

/// Configuration for the definition parser
#[derive(Clone)]
pub struct ParserConfig {
    /// Endianness used when a packet keyword leaves it out
    pub default_endianness: Endianness,
    /// Collect overlap warnings when a packet is complete
    pub warn_on_overlap: bool,
    /// Add the received time and count items to every telemetry packet
    pub received_items: bool,
    conversions: HashMap<String, ConversionFactory>,
    validators: HashMap<String, ValidatorFactory>,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            default_endianness: Endianness::Big,
            warn_on_overlap: true,
            received_items: true,
            conversions: HashMap::new(),
            validators: HashMap::new(),
        }
    }
}

impl fmt::Debug for ParserConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParserConfig")
            .field("default_endianness", &self.default_endianness)
            .field("warn_on_overlap", &self.warn_on_overlap)
            .field("received_items", &self.received_items)
            .field("conversions", &self.conversions.keys().collect::<Vec<_>>())
            .field("validators", &self.validators.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ParserConfig {
    /// Creates a parser config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the default endianness
    pub fn default_endianness(mut self, endianness: Endianness) -> Self {
        self.default_endianness = endianness;
        self
    }

    /// Enables or disables overlap warnings
    pub fn warn_on_overlap(mut self, warn: bool) -> Self {
        self.warn_on_overlap = warn;
        self
    }

    /// Enables or disables the built-in received items
    pub fn received_items(mut self, enabled: bool) -> Self {
        self.received_items = enabled;
        self
    }

    /// Registers a conversion for `READ_CONVERSION`/`WRITE_CONVERSION`
    pub fn conversion<F>(mut self, name: &str, factory: F) -> Self
    where
        F: Fn(&[String]) -> Result<Arc<dyn Conversion>> + Send + Sync + 'static,
    {
        self.conversions.insert(name.to_uppercase(), Arc::new(factory));
        self
    }

    /// Registers a validator for `VALIDATOR`
    pub fn validator<F>(mut self, name: &str, factory: F) -> Self
    where
        F: Fn(&[String]) -> Result<Arc<dyn CommandValidator>> + Send + Sync + 'static,
    {
        self.validators.insert(name.to_uppercase(), Arc::new(factory));
        self
    }
}

/// Splits a definition line into words.
///
/// Quoted strings become one word without their quotes. Everything after
/// an unquoted `#` is ignored.
pub fn split_line(line: &str) -> Result<Vec<String>> {
    let mut words = Vec::new();
    let mut chars = line.chars().peekable();
    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }
        if c == '#' {
            break;
        }
        if c == '"' || c == '\'' {
            chars.next();
            let mut word = String::new();
            loop {
                match chars.next() {
                    Some(q) if q == c => break,
                    Some(other) => word.push(other),
                    None => {
                        return Err(Error::config(
                            line.trim(),
                            format!("unterminated {} quote", c),
                        ))
                    }
                }
            }
            words.push(word);
            continue;
        }
        let mut word = String::new();
        while let Some(&w) = chars.peek() {
            if w.is_whitespace() {
                break;
            }
            word.push(w);
            chars.next();
        }
        words.push(word);
    }
    Ok(words)
}

#[derive(Debug, Clone, Copy)]
struct ItemKeyword {
    append: bool,
    id: bool,
    array: bool,
    parameter: bool,
}

impl ItemKeyword {
    fn parse(keyword: &str) -> Option<Self> {
        let (append, rest) = match keyword.strip_prefix("APPEND_") {
            Some(rest) => (true, rest),
            None => (false, keyword),
        };
        let (id, array, base) = if let Some(base) = rest.strip_prefix("ID_") {
            (true, false, base)
        } else if let Some(base) = rest.strip_prefix("ARRAY_") {
            (false, true, base)
        } else {
            (false, false, rest)
        };
        let parameter = match base {
            "ITEM" => false,
            "PARAMETER" => true,
            _ => return None,
        };
        Some(Self {
            append,
            id,
            array,
            parameter,
        })
    }
}

#[derive(Debug)]
struct Current {
    kind: PacketKind,
    packet: Packet,
    item: Option<String>,
    segments: HashMap<(String, bool), SegmentedPolynomialConversion>,
}

/// Builds a [`Registry`] from definition keywords
#[derive(Debug)]
pub struct DefinitionParser {
    config: ParserConfig,
    registry: Registry,
    current: Option<Current>,
    limits_group: Option<String>,
    location: String,
}

impl Default for DefinitionParser {
    fn default() -> Self {
        Self::new(ParserConfig::default())
    }
}

impl DefinitionParser {
    /// Creates a parser producing a new registry
    pub fn new(config: ParserConfig) -> Self {
        Self::with_registry(Registry::new(), config)
    }

    /// Creates a parser adding to an existing registry
    pub fn with_registry(registry: Registry, config: ParserConfig) -> Self {
        Self {
            config,
            registry,
            current: None,
            limits_group: None,
            location: String::new(),
        }
    }

    /// The registry built so far, without the packet being defined
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Parses a definition file
    pub fn parse_file(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        debug!("Parsing definitions from {}", path.display());
        let text = std::fs::read_to_string(path).map_err(|e| Error::file_read(path, e))?;
        self.parse_str(&text, &path.display().to_string())
    }

    /// Parses definition text; `source` names it in errors
    pub fn parse_str(&mut self, text: &str, source: &str) -> Result<()> {
        for (number, line) in text.lines().enumerate() {
            let mut words = split_line(line)
                .map_err(|e| Error::config(format!("{}:{}", source, number + 1), e.to_string()))?;
            if words.is_empty() {
                continue;
            }
            let keyword = words.remove(0);
            self.location = format!("{}:{}", source, number + 1);
            self.process(&keyword, &words)?;
        }
        self.commit()
    }

    /// Processes one keyword with its parameters
    pub fn process(&mut self, keyword: &str, params: &[String]) -> Result<()> {
        let keyword = keyword.to_uppercase();
        trace!("{} {} {:?}", self.location, keyword, params);
        let location = if self.location.is_empty() {
            keyword.clone()
        } else {
            format!("{} {}", self.location, keyword)
        };
        self.dispatch(&keyword, params).map_err(|e| match e {
            Error::Config { location: ref at, ref details } if at.is_empty() => {
                Error::config(location, details.clone())
            }
            Error::Config { .. } => e,
            other => Error::config(location, other.to_string()),
        })
    }

    /// Registers the packet being defined and returns the registry
    pub fn finish(mut self) -> Result<Registry> {
        self.commit()?;
        Ok(self.registry)
    }

    fn dispatch(&mut self, keyword: &str, params: &[String]) -> Result<()> {
        match keyword {
            "COMMAND" | "TELEMETRY" => self.define_packet(keyword, params),
            "SELECT_COMMAND" | "SELECT_TELEMETRY" => self.select_packet(keyword, params),
            "SELECT_ITEM" | "SELECT_PARAMETER" => {
                expect_params(params, 1, 1)?;
                let current = self.current()?;
                let name = current.packet.get_item(&params[0])?.name().to_string();
                current.item = Some(name);
                Ok(())
            }
            "DELETE_ITEM" | "DELETE_PARAMETER" => {
                expect_params(params, 1, 1)?;
                let current = self.current()?;
                current.packet.delete_item(&params[0])?;
                current.item = None;
                Ok(())
            }
            "LIMITS_GROUP" => {
                expect_params(params, 1, 1)?;
                self.registry.add_limits_group(&params[0]);
                self.limits_group = Some(params[0].to_uppercase());
                Ok(())
            }
            "LIMITS_GROUP_ITEM" => {
                expect_params(params, 3, 3)?;
                let group = self
                    .limits_group
                    .clone()
                    .ok_or_else(|| Error::config("", "LIMITS_GROUP_ITEM requires a LIMITS_GROUP"))?;
                self.registry
                    .add_limits_group_item(&group, &params[0], &params[1], &params[2])
            }
            _ => {
                if let Some(item_keyword) = ItemKeyword::parse(keyword) {
                    return self.define_item(item_keyword, params);
                }
                if self.packet_modifier(keyword, params)? {
                    return Ok(());
                }
                self.item_modifier(keyword, params)
            }
        }
    }

    fn current(&mut self) -> Result<&mut Current> {
        self.current
            .as_mut()
            .ok_or_else(|| Error::config("", "no COMMAND or TELEMETRY is being defined"))
    }

    fn commit(&mut self) -> Result<()> {
        let Some(mut current) = self.current.take() else {
            return Ok(());
        };
        let packet = &mut current.packet;
        if current.kind == PacketKind::Telemetry
            && self.config.received_items
            && packet.get_item("RECEIVED_COUNT").is_err()
        {
            packet.add_received_items()?;
        }
        if self.config.warn_on_overlap {
            for warning in packet.check_bit_offsets() {
                self.registry.push_warning(warning);
            }
        }
        let untyped: Vec<String> = packet
            .items()
            .filter(|item| item.as_ref().data_type() == DataType::Derived)
            .filter(|item| {
                item.read_conversion()
                    .map(|c| c.converted_type().is_none())
                    .unwrap_or(false)
            })
            .map(|item| item.name().to_string())
            .collect();
        for name in untyped {
            self.registry.push_warning(format!(
                "{} {} {}: read conversion of DERIVED item does not report a converted type",
                packet.target_name(),
                packet.packet_name(),
                name
            ));
        }
        self.registry.add_packet(current.kind, current.packet);
        Ok(())
    }

    fn define_packet(&mut self, keyword: &str, params: &[String]) -> Result<()> {
        expect_params(params, 2, 4)?;
        self.commit()?;
        let endianness = match params.get(2) {
            Some(text) => Endianness::try_from(text.as_str())?,
            None => self.config.default_endianness,
        };
        let mut packet = Packet::new(&params[0], &params[1], endianness);
        if let Some(description) = params.get(3) {
            packet.set_description(description.as_str());
        }
        let kind = if keyword == "COMMAND" {
            PacketKind::Command
        } else {
            PacketKind::Telemetry
        };
        debug!("Defining {} {} {}", kind, packet.target_name(), packet.packet_name());
        self.current = Some(Current {
            kind,
            packet,
            item: None,
            segments: HashMap::new(),
        });
        Ok(())
    }

    fn select_packet(&mut self, keyword: &str, params: &[String]) -> Result<()> {
        expect_params(params, 2, 2)?;
        self.commit()?;
        let kind = if keyword == "SELECT_COMMAND" {
            PacketKind::Command
        } else {
            PacketKind::Telemetry
        };
        let packet = Packet::clone(self.registry.packet(kind, &params[0], &params[1])?);
        self.current = Some(Current {
            kind,
            packet,
            item: None,
            segments: HashMap::new(),
        });
        Ok(())
    }

    fn define_item(&mut self, keyword: ItemKeyword, params: &[String]) -> Result<()> {
        let mut next = 0;
        let mut take = |name: &str| -> Result<String> {
            let param = params
                .get(next)
                .ok_or_else(|| Error::config("", format!("missing {} parameter", name)))?;
            next += 1;
            Ok(param.clone())
        };

        let name = take("name")?;
        let bit_offset = if keyword.append { 0 } else { int_param(&take("bit offset")?)? };
        let bit_size = int_param(&take("bit size")?)?;
        let data_type = DataType::try_from(take("data type")?.as_str())?;
        let array_size = if keyword.array {
            Some(int_param(&take("array size")?)?)
        } else {
            None
        };

        let mut range = None;
        let mut default = None;
        let mut id_value = None;
        if keyword.parameter && !keyword.array {
            if data_type.is_integer() || data_type == DataType::Float {
                let minimum = take("minimum")?;
                let maximum = take("maximum")?;
                range = Some((minimum, maximum));
            }
            let text = take("default")?;
            if keyword.id {
                id_value = Some(text.clone());
            }
            default = Some(text);
        } else if keyword.id {
            id_value = Some(take("id value")?);
        }
        let description = params.get(next).cloned();
        let endianness = params.get(next + 1);
        if params.len() > next + 2 {
            return Err(Error::config("", format!("too many parameters ({})", params.len())));
        }

        let current = self.current()?;
        let endianness = match endianness {
            Some(text) => Endianness::try_from(text.as_str())?,
            None => current.packet.structure().layout().default_endianness(),
        };
        let mut item = PacketItem::with_geometry(
            &name,
            bit_offset,
            bit_size,
            data_type,
            endianness,
            array_size,
            OverflowPolicy::Error,
        )?;
        if let Some(description) = description {
            item.set_description(description);
        }
        if let Some((minimum, maximum)) = range {
            item.set_range(
                bound_value(data_type, bit_size, &minimum)?,
                bound_value(data_type, bit_size, &maximum)?,
            );
        }
        if let Some(default) = default {
            item.set_default_value(Value::parse_for(data_type, &default)?);
        }
        if let Some(id_value) = id_value {
            item.set_id_value(Value::parse_for(data_type, &id_value)?);
        }
        let name = item.name().to_string();
        if keyword.append {
            current.packet.append_item(item)?;
        } else {
            current.packet.define_item(item)?;
        }
        current.item = Some(name);
        Ok(())
    }

    /// Returns false when `keyword` is not a packet modifier
    fn packet_modifier(&mut self, keyword: &str, params: &[String]) -> Result<bool> {
        let validator = if keyword == "VALIDATOR" {
            expect_params(params, 1, usize::MAX)?;
            let factory = self
                .config
                .validators
                .get(&params[0].to_uppercase())
                .ok_or_else(|| Error::config("", format!("unknown validator {}", params[0])))?;
            Some(factory(&params[1..])?)
        } else {
            None
        };
        let packet = match keyword {
            "HAZARDOUS" | "DISABLED" | "HIDDEN" | "VIRTUAL" | "RESTRICTED" | "ALLOW_SHORT"
            | "IGNORE_OVERLAP" | "VALIDATOR" => &mut self.current()?.packet,
            _ => return Ok(false),
        };
        match keyword {
            "HAZARDOUS" => {
                expect_params(params, 0, 1)?;
                packet.set_hazardous(params.first().cloned());
            }
            "DISABLED" => packet.set_disabled(true),
            "HIDDEN" => packet.set_hidden(true),
            "VIRTUAL" => packet.set_virtual(true),
            "RESTRICTED" => packet.set_restricted(true),
            "ALLOW_SHORT" => packet.set_short_buffer_allowed(true),
            "IGNORE_OVERLAP" => packet.set_ignore_overlap(true),
            _ => {
                if let Some(validator) = validator {
                    packet.set_validator(validator);
                }
            }
        }
        Ok(true)
    }

    fn item_modifier(&mut self, keyword: &str, params: &[String]) -> Result<()> {
        let conversion = match keyword {
            "READ_CONVERSION" | "WRITE_CONVERSION" => {
                expect_params(params, 1, usize::MAX)?;
                let factory = self
                    .config
                    .conversions
                    .get(&params[0].to_uppercase())
                    .ok_or_else(|| Error::config("", format!("unknown conversion {}", params[0])))?;
                Some(factory(&params[1..])?)
            }
            _ => None,
        };

        let current = self.current()?;
        let name = current
            .item
            .clone()
            .ok_or_else(|| Error::config("", format!("{} requires an item", keyword)))?;
        let packet = &mut current.packet;
        let segments = &mut current.segments;

        match keyword {
            "STATE" => {
                expect_params(params, 2, 4)?;
                let data_type = packet.get_item(&name)?.as_ref().data_type();
                let value = if params[1].eq_ignore_ascii_case("ANY") {
                    StateValue::Any
                } else {
                    StateValue::Exact(state_value(data_type, &params[1])?)
                };
                let mut state = State::new(&params[0], value);
                match params.get(2).map(|p| p.to_uppercase()) {
                    Some(flag) if flag == "HAZARDOUS" => {
                        state = state.with_hazardous(params.get(3).cloned().unwrap_or_default());
                    }
                    Some(color) => {
                        expect_params(params, 2, 3)?;
                        state = state.with_color(LimitsState::state_color(&color)?);
                    }
                    None => {}
                }
                packet.update_item(&name, |item| {
                    item.add_state(state);
                    Ok(())
                })
            }
            "LIMITS" => {
                expect_params(params, 7, 9)?;
                let set = params[0].to_uppercase();
                let persistence = u32::try_from(int_param(&params[1])?)
                    .map_err(|_| Error::config("", "persistence must not be negative"))?;
                let enabled = match params[2].to_uppercase().as_str() {
                    "ENABLED" => true,
                    "DISABLED" => false,
                    other => {
                        return Err(Error::config(
                            "",
                            format!("expected ENABLED or DISABLED, found {}", other),
                        ))
                    }
                };
                let values = params[3..]
                    .iter()
                    .map(|p| float_param(p))
                    .collect::<Result<Vec<_>>>()?;
                let mut band = LimitsBand::new(values[0], values[1], values[2], values[3])?;
                if values.len() == 6 {
                    band = band.with_green(values[4], values[5])?;
                } else if values.len() != 4 {
                    return Err(Error::config("", "green limits need both a low and a high value"));
                }
                packet.update_item(&name, |item| {
                    if item.limits().is_none() {
                        if set != DEFAULT_LIMITS_SET {
                            return Err(Error::config(
                                "",
                                "DEFAULT limits must be defined before other limits sets",
                            ));
                        }
                        item.set_limits(Limits::new(band.clone()));
                    }
                    let limits = item
                        .limits_mut()
                        .ok_or_else(|| Error::config("", "limits were not stored"))?;
                    limits.set_band(&set, band);
                    limits.set_persistence(persistence);
                    limits.set_enabled(enabled);
                    Ok(())
                })
            }
            "UNITS" => {
                expect_params(params, 2, 2)?;
                packet.update_item(&name, |item| {
                    item.set_units(params[0].as_str(), params[1].as_str());
                    Ok(())
                })
            }
            "FORMAT_STRING" => {
                expect_params(params, 1, 1)?;
                let data_type = packet.get_item(&name)?.as_ref().data_type();
                let sample = match data_type {
                    DataType::Float => Value::Float(0.0),
                    DataType::String | DataType::Block => Value::String(String::new()),
                    _ => Value::Int(0),
                };
                format_value(&params[0], &sample)?;
                packet.update_item(&name, |item| {
                    item.set_format_string(params[0].as_str());
                    Ok(())
                })
            }
            "DESCRIPTION" => {
                expect_params(params, 1, 1)?;
                packet.update_item(&name, |item| {
                    item.set_description(params[0].as_str());
                    Ok(())
                })
            }
            "KEY" => {
                expect_params(params, 1, 1)?;
                packet.update_item(&name, |item| {
                    item.as_mut().set_key(params[0].as_str());
                    Ok(())
                })
            }
            "OVERFLOW" => {
                expect_params(params, 1, 1)?;
                let policy = OverflowPolicy::try_from(params[0].as_str())?;
                packet.update_item(&name, |item| item.as_mut().set_overflow(policy))
            }
            "OVERLAP" => packet.update_item(&name, |item| {
                item.as_mut().set_overlap(true);
                Ok(())
            }),
            "OBFUSCATE" => packet.update_item(&name, |item| {
                item.set_obfuscate(true);
                Ok(())
            }),
            "REQUIRED" => packet.update_item(&name, |item| {
                item.set_required(true);
                Ok(())
            }),
            "MINIMUM_VALUE" | "MAXIMUM_VALUE" | "DEFAULT_VALUE" => {
                expect_params(params, 1, 1)?;
                let item: &StructureItem = packet.get_item(&name)?.as_ref();
                let (data_type, bit_size) = (item.data_type(), item.bit_size());
                let value = if keyword == "DEFAULT_VALUE" {
                    Value::parse_for(data_type, &params[0])?
                } else {
                    bound_value(data_type, bit_size, &params[0])?
                };
                packet.update_item(&name, |item| {
                    match keyword {
                        "MINIMUM_VALUE" => item.set_minimum(value),
                        "MAXIMUM_VALUE" => item.set_maximum(value),
                        _ => item.set_default_value(value),
                    }
                    Ok(())
                })
            }
            "VARIABLE_BIT_SIZE" => {
                expect_params(params, 1, 3)?;
                let mut variable = VariableBitSize::new(params[0].as_str());
                if let Some(bits) = params.get(1) {
                    variable = variable.bits_per_count(int_param(bits)?);
                }
                if let Some(offset) = params.get(2) {
                    variable = variable.value_bit_offset(int_param(offset)?);
                }
                packet.update_item(&name, |item| item.as_mut().set_variable_bit_size(variable))
            }
            "POLY_READ_CONVERSION" | "POLY_WRITE_CONVERSION" => {
                expect_params(params, 1, usize::MAX)?;
                let coefficients = params.iter().map(|p| float_param(p)).collect::<Result<Vec<_>>>()?;
                let conversion: Arc<dyn Conversion> = Arc::new(PolynomialConversion::new(coefficients)?);
                set_conversion(packet, &name, keyword.starts_with("POLY_READ"), conversion)
            }
            "SEG_POLY_READ_CONVERSION" | "SEG_POLY_WRITE_CONVERSION" => {
                expect_params(params, 2, usize::MAX)?;
                let lower_bound = float_param(&params[0])?;
                let coefficients = params[1..].iter().map(|p| float_param(p)).collect::<Result<Vec<_>>>()?;
                let read = keyword.starts_with("SEG_POLY_READ");
                let key = (name.clone(), read);
                if !segments.contains_key(&key) {
                    let item = packet.get_item(&name)?;
                    let existing = if read { item.read_conversion() } else { item.write_conversion() };
                    let seed = existing
                        .and_then(|c| c.as_segmented())
                        .cloned()
                        .unwrap_or_default();
                    segments.insert(key.clone(), seed);
                }
                let segmented = segments.entry(key).or_default();
                segmented.add_segment(lower_bound, coefficients)?;
                let conversion: Arc<dyn Conversion> = Arc::new(segmented.clone());
                set_conversion(packet, &name, read, conversion)
            }
            "READ_CONVERSION" | "WRITE_CONVERSION" => match conversion {
                Some(conversion) => set_conversion(packet, &name, keyword == "READ_CONVERSION", conversion),
                None => Err(Error::config("", format!("{} has no conversion", keyword))),
            },
            _ => Err(Error::config("", format!("unknown keyword {}", keyword))),
        }
        .map_err(|e| match e {
            Error::Config { .. } => e,
            other => other.with_context(packet.target_name(), packet.packet_name(), &name),
        })
    }
}

fn set_conversion(
    packet: &mut Packet,
    name: &str,
    read: bool,
    conversion: Arc<dyn Conversion>,
) -> Result<()> {
    packet.update_item(name, |item| {
        if read {
            item.set_read_conversion(conversion);
        } else {
            item.set_write_conversion(conversion);
        }
        Ok(())
    })
}

fn expect_params(params: &[String], min: usize, max: usize) -> Result<()> {
    if params.len() < min {
        return Err(Error::config(
            "",
            format!("expected at least {} parameters, found {}", min, params.len()),
        ));
    }
    if params.len() > max {
        return Err(Error::config(
            "",
            format!("expected at most {} parameters, found {}", max, params.len()),
        ));
    }
    Ok(())
}

fn int_param(text: &str) -> Result<i32> {
    parse_integer(text)
        .and_then(|v| i32::try_from(v).ok())
        .ok_or_else(|| Error::config("", format!("'{}' is not an integer", text)))
}

fn float_param(text: &str) -> Result<f64> {
    parse_float(text).ok_or_else(|| Error::config("", format!("'{}' is not a number", text)))
}

/// State values of DERIVED items are compared with converted values
fn state_value(data_type: DataType, text: &str) -> Result<Value> {
    match data_type {
        DataType::Derived => Value::parse_for(DataType::Derived, text),
        other => Value::parse_for(other, text).or_else(|_| Value::parse_for(DataType::Derived, text)),
    }
}

/// Parses a minimum or maximum, accepting `MIN` and `MAX` for the range of
/// the data type
fn bound_value(data_type: DataType, bit_size: i32, text: &str) -> Result<Value> {
    let upper = text.to_uppercase();
    if upper != "MIN" && upper != "MAX" {
        return Value::parse_for(data_type, text);
    }
    let max = upper == "MAX";
    let bits = bit_size.clamp(1, 64) as u32;
    Ok(match data_type {
        DataType::Uint => {
            if max {
                Value::UInt(u64::MAX >> (64 - bits))
            } else {
                Value::UInt(0)
            }
        }
        DataType::Int => {
            let limit = 1i128 << (bits - 1);
            Value::from_i128(if max { limit - 1 } else { -limit })
        }
        DataType::Float if bit_size == 32 => Value::Float(if max { f32::MAX as f64 } else { f32::MIN as f64 }),
        DataType::Float => Value::Float(if max { f64::MAX } else { f64::MIN }),
        other => {
            return Err(Error::invalid_value(
                other,
                format!("{} has no {} value", other, upper),
            ))
        }
    })
}
