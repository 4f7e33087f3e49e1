//! Definition registry and identification service.
//!
//! A [`Registry`] owns every defined command and telemetry packet, grouped
//! by target. It keeps, per target:
//!
//! - the packets in definition order, looked up by name;
//! - an [`IdTable`] used to identify raw buffers;
//! - for telemetry, an index from item name to the packets containing it,
//!   used to resolve the `LATEST` packet name.
//!
//! Registries are plain values. Build one with a
//! [`DefinitionParser`](parser::DefinitionParser) or by calling
//! [`Registry::add_packet`] directly.

pub mod identify;
pub mod parser;

pub use identify::{id_key, IdMode, IdTable};
pub use parser::{split_line, ConversionFactory, DefinitionParser, ParserConfig, ValidatorFactory};

use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::packet::{LimitsChange, LimitsState, Packet, ValueType, DEFAULT_LIMITS_SET};
use crate::structure::Endianness;
use crate::value::Value;

/// Name of the packet every target resolves unidentified data to
pub const UNKNOWN: &str = "UNKNOWN";

/// Packet name selecting the most recently received packet with an item
pub const LATEST: &str = "LATEST";

/// Command or telemetry namespace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketKind {
    /// Commands sent to a target
    Command,
    /// Telemetry received from a target
    Telemetry,
}

impl fmt::Display for PacketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketKind::Command => f.write_str("COMMAND"),
            PacketKind::Telemetry => f.write_str("TELEMETRY"),
        }
    }
}

/// One member of a limits group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimitsGroupItem {
    /// Target name
    pub target: String,
    /// Packet name, possibly `LATEST`
    pub packet: String,
    /// Item name
    pub item: String,
}

/// An item currently outside its green range
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutOfLimits {
    /// Target name
    pub target: String,
    /// Packet name
    pub packet: String,
    /// Item name
    pub item: String,
    /// Current color
    pub state: LimitsState,
}

#[derive(Debug, Clone, Default)]
struct Target {
    packets: Vec<Arc<Packet>>,
    index: HashMap<String, usize>,
    ids: IdTable,
    /// Item name to the packets containing it, in definition order
    latest: BTreeMap<String, Vec<Arc<Packet>>>,
}

impl Target {
    fn get(&self, name: &str) -> Option<&Arc<Packet>> {
        self.index.get(name).map(|&i| &self.packets[i])
    }

    fn insert(&mut self, name: &str, packet: Arc<Packet>, kind: PacketKind) {
        match self.index.get(name) {
            Some(&i) => self.packets[i] = packet,
            None => {
                self.index.insert(name.to_string(), self.packets.len());
                self.packets.push(packet);
            }
        }
        let target = self.packets[0].target_name().to_string();
        self.ids = IdTable::build(&target, &self.packets);
        if kind == PacketKind::Telemetry {
            self.latest.clear();
            for packet in &self.packets {
                for item in packet.items() {
                    self.latest
                        .entry(item.name().to_string())
                        .or_default()
                        .push(Arc::clone(packet));
                }
            }
        }
    }
}

/// All defined packets, grouped by target
#[derive(Debug, Clone)]
pub struct Registry {
    commands: BTreeMap<String, Target>,
    telemetry: BTreeMap<String, Target>,
    unknown: Arc<Packet>,
    limits_groups: BTreeMap<String, Vec<LimitsGroupItem>>,
    limits_set: String,
    warnings: Vec<String>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    /// Creates an empty registry
    pub fn new() -> Self {
        let mut unknown = Packet::new(UNKNOWN, UNKNOWN, Endianness::Big);
        unknown.set_description("Unknown packet");
        unknown.set_hidden(true);
        unknown.set_short_buffer_allowed(true);
        Self {
            commands: BTreeMap::new(),
            telemetry: BTreeMap::new(),
            unknown: Arc::new(unknown),
            limits_groups: BTreeMap::new(),
            limits_set: DEFAULT_LIMITS_SET.to_string(),
            warnings: Vec::new(),
        }
    }

    fn targets(&self, kind: PacketKind) -> &BTreeMap<String, Target> {
        match kind {
            PacketKind::Command => &self.commands,
            PacketKind::Telemetry => &self.telemetry,
        }
    }

    fn target(&self, kind: PacketKind, target: &str) -> Result<&Target> {
        let target = target.to_uppercase();
        self.targets(kind)
            .get(&target)
            .ok_or(Error::UnknownTarget(target))
    }

    /// Registers a packet, replacing any packet with the same name
    pub fn add_packet(&mut self, kind: PacketKind, packet: Packet) -> Arc<Packet> {
        debug!(
            "Registering {} {} {}",
            kind,
            packet.target_name(),
            packet.packet_name()
        );
        let target_name = packet.target_name().to_string();
        let packet_name = packet.packet_name().to_string();
        let packet = Arc::new(packet);
        let targets = match kind {
            PacketKind::Command => &mut self.commands,
            PacketKind::Telemetry => &mut self.telemetry,
        };
        targets
            .entry(target_name)
            .or_default()
            .insert(&packet_name, Arc::clone(&packet), kind);
        packet
    }

    /// Definition warnings collected while loading
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub(crate) fn push_warning(&mut self, warning: String) {
        warn!("{}", warning);
        self.warnings.push(warning);
    }

    /// Target names with packets of the given kind
    pub fn target_names(&self, kind: PacketKind) -> impl Iterator<Item = &str> + '_ {
        self.targets(kind).keys().map(String::as_str)
    }

    /// A target's packets in definition order
    pub fn packets(&self, kind: PacketKind, target: &str) -> Result<&[Arc<Packet>]> {
        Ok(&self.target(kind, target)?.packets)
    }

    /// Packet by name; `UNKNOWN UNKNOWN` always exists
    pub fn packet(&self, kind: PacketKind, target: &str, packet: &str) -> Result<&Arc<Packet>> {
        let target = target.to_uppercase();
        let packet = packet.to_uppercase();
        if target == UNKNOWN && packet == UNKNOWN {
            return Ok(&self.unknown);
        }
        self.target(kind, &target)?
            .get(&packet)
            .ok_or(Error::UnknownPacket { target, packet })
    }

    /// Command by name
    pub fn command(&self, target: &str, packet: &str) -> Result<&Arc<Packet>> {
        self.packet(PacketKind::Command, target, packet)
    }

    /// Telemetry packet by name
    pub fn telemetry(&self, target: &str, packet: &str) -> Result<&Arc<Packet>> {
        self.packet(PacketKind::Telemetry, target, packet)
    }

    /// The packet unidentified telemetry is stored in
    pub fn unknown(&self) -> &Arc<Packet> {
        &self.unknown
    }

    /// Identification table of a target
    pub fn id_table(&self, kind: PacketKind, target: &str) -> Result<&IdTable> {
        Ok(&self.target(kind, target)?.ids)
    }

    // ----- identification -----

    /// Finds the telemetry packet `buffer` holds.
    ///
    /// Only `targets` are searched when given. Returns `None` when no
    /// packet and no catch-all packet matches.
    pub fn identify(&self, buffer: &[u8], targets: Option<&[&str]>) -> Option<Arc<Packet>> {
        self.identify_kind(PacketKind::Telemetry, buffer, targets)
    }

    /// Finds the command `buffer` holds
    pub fn identify_command(&self, buffer: &[u8], targets: Option<&[&str]>) -> Option<Arc<Packet>> {
        self.identify_kind(PacketKind::Command, buffer, targets)
    }

    fn identify_kind(
        &self,
        kind: PacketKind,
        buffer: &[u8],
        targets: Option<&[&str]>,
    ) -> Option<Arc<Packet>> {
        let all = self.targets(kind);
        let found = match targets {
            Some(names) => names.iter().find_map(|name| {
                let target = all.get(&name.to_uppercase());
                if target.is_none() {
                    debug!("Skipping unknown target {} during identification", name);
                }
                target.and_then(|t| t.ids.identify(buffer))
            }),
            None => all.values().find_map(|t| t.ids.identify(buffer)),
        };
        found.cloned()
    }

    /// Identifies `buffer` and returns a fresh instance holding it.
    ///
    /// The definition counts every buffer it identifies, and the instance
    /// carries that running count.
    pub fn identify_and_define(
        &self,
        buffer: &[u8],
        targets: Option<&[&str]>,
    ) -> Result<Option<Packet>> {
        let Some(definition) = self.identify(buffer, targets) else {
            return Ok(None);
        };
        let packet = definition.instance();
        packet.set_buffer(buffer)?;
        packet.set_received_time(Some(Utc::now()));
        packet.set_received_count(definition.increment_received_count());
        Ok(Some(packet))
    }

    /// Stores a received buffer in a defined telemetry packet
    pub fn update(&self, target: &str, packet: &str, buffer: &[u8]) -> Result<Arc<Packet>> {
        let packet = Arc::clone(self.telemetry(target, packet)?);
        packet.set_buffer(buffer)?;
        packet.set_received_time(Some(Utc::now()));
        packet.increment_received_count();
        Ok(packet)
    }

    // ----- lookups -----

    /// Telemetry packets of a target containing `item`, in definition order
    pub fn packets_with_item(&self, target: &str, item: &str) -> Result<&[Arc<Packet>]> {
        let target_name = target.to_uppercase();
        let item = item.to_uppercase();
        self.target(PacketKind::Telemetry, &target_name)?
            .latest
            .get(&item)
            .map(Vec::as_slice)
            .ok_or_else(|| {
                Error::UnknownItem(item.clone()).with_context(&target_name, LATEST, &item)
            })
    }

    /// Most recently received packet containing `item`.
    ///
    /// Packets never received sort first; on equal times the later
    /// defined packet wins.
    pub fn latest_packet(&self, target: &str, item: &str) -> Result<Arc<Packet>> {
        let mut best: Option<(&Arc<Packet>, _)> = None;
        for packet in self.packets_with_item(target, item)? {
            let time = packet.received_time();
            if best.as_ref().map_or(true, |(_, t)| time >= *t) {
                best = Some((packet, time));
            }
        }
        best.map(|(p, _)| Arc::clone(p)).ok_or_else(|| Error::UnknownPacket {
            target: target.to_uppercase(),
            packet: LATEST.to_string(),
        })
    }

    /// Reads a telemetry item; `packet` may be `LATEST`
    pub fn read(&self, target: &str, packet: &str, item: &str, value_type: ValueType) -> Result<Value> {
        if packet.eq_ignore_ascii_case(LATEST) {
            return self.latest_packet(target, item)?.read(item, value_type);
        }
        self.telemetry(target, packet)?.read(item, value_type)
    }

    /// Reads a value named by a `TARGET__PACKET__ITEM__VALUETYPE` key.
    ///
    /// The value type may be left off, in which case the value is
    /// CONVERTED. Item names may themselves contain `__`.
    pub fn read_key(&self, key: &str) -> Result<Value> {
        let parts: Vec<&str> = key.split("__").collect();
        if parts.len() < 3 {
            return Err(Error::invalid_value(
                "KEY",
                format!("'{}' is not TARGET__PACKET__ITEM__VALUETYPE", key),
            ));
        }
        let last = parts[parts.len() - 1];
        let (item_parts, value_type) = match ValueType::try_from(last) {
            Ok(value_type) if parts.len() > 3 => (&parts[2..parts.len() - 1], value_type),
            _ => (&parts[2..], ValueType::Converted),
        };
        self.read(parts[0], parts[1], &item_parts.join("__"), value_type)
    }

    // ----- commands -----

    /// Builds a command instance from parameter values.
    ///
    /// Defaults are written first, then each given parameter, CONVERTED
    /// unless `raw` is set. Missing required parameters and a failing
    /// validator pre-check are errors.
    pub fn build_command(
        &self,
        target: &str,
        packet: &str,
        params: &[(&str, Value)],
        raw: bool,
    ) -> Result<Packet> {
        let definition = self.command(target, packet)?;
        let command = definition.instance();
        command.restore_defaults()?;
        command.check_required(params.iter().map(|(name, _)| *name))?;
        let value_type = if raw { ValueType::Raw } else { ValueType::Converted };
        for (name, value) in params {
            command.write(name, value.clone(), value_type)?;
        }
        let check = command.pre_check()?;
        if check.passed == Some(false) {
            return Err(Error::invalid_value(
                "COMMAND",
                format!(
                    "{} {} failed validation: {}",
                    command.target_name(),
                    command.packet_name(),
                    check.message.unwrap_or_default()
                ),
            ));
        }
        Ok(command)
    }

    // ----- limits -----

    fn limits_packets(&self, target: &str, packet: &str, item: &str) -> Result<Vec<Arc<Packet>>> {
        if packet.eq_ignore_ascii_case(LATEST) {
            Ok(self.packets_with_item(target, item)?.to_vec())
        } else {
            Ok(vec![Arc::clone(self.telemetry(target, packet)?)])
        }
    }

    /// Enables limits checking of an item; `packet` may be `LATEST`
    pub fn enable_limits(&self, target: &str, packet: &str, item: &str) -> Result<()> {
        for packet in self.limits_packets(target, packet, item)? {
            packet.set_limits_enabled(item, true)?;
        }
        Ok(())
    }

    /// Disables limits checking of an item and clears its color
    pub fn disable_limits(&self, target: &str, packet: &str, item: &str) -> Result<()> {
        for packet in self.limits_packets(target, packet, item)? {
            packet.set_limits_enabled(item, false)?;
        }
        Ok(())
    }

    /// Whether limits checking of an item is enabled
    pub fn limits_enabled(&self, target: &str, packet: &str, item: &str) -> Result<bool> {
        let packets = self.limits_packets(target, packet, item)?;
        for packet in &packets {
            if !packet.limits_enabled(item)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Creates an empty limits group, or keeps an existing one
    pub fn add_limits_group(&mut self, group: &str) {
        self.limits_groups.entry(group.to_uppercase()).or_default();
    }

    /// Adds an item to a limits group
    pub fn add_limits_group_item(&mut self, group: &str, target: &str, packet: &str, item: &str) -> Result<()> {
        let entry = self
            .limits_groups
            .get_mut(&group.to_uppercase())
            .ok_or_else(|| unknown_group(group))?;
        entry.push(LimitsGroupItem {
            target: target.to_uppercase(),
            packet: packet.to_uppercase(),
            item: item.to_uppercase(),
        });
        Ok(())
    }

    /// Limits groups and their members
    pub fn limits_groups(&self) -> &BTreeMap<String, Vec<LimitsGroupItem>> {
        &self.limits_groups
    }

    fn set_group_enabled(&self, group: &str, enabled: bool) -> Result<()> {
        let members = self
            .limits_groups
            .get(&group.to_uppercase())
            .ok_or_else(|| unknown_group(group))?;
        info!(
            "{} limits group {}",
            if enabled { "Enabling" } else { "Disabling" },
            group.to_uppercase()
        );
        for member in members {
            if enabled {
                self.enable_limits(&member.target, &member.packet, &member.item)?;
            } else {
                self.disable_limits(&member.target, &member.packet, &member.item)?;
            }
        }
        Ok(())
    }

    /// Enables every item of a limits group
    pub fn enable_limits_group(&self, group: &str) -> Result<()> {
        self.set_group_enabled(group, true)
    }

    /// Disables every item of a limits group
    pub fn disable_limits_group(&self, group: &str) -> Result<()> {
        self.set_group_enabled(group, false)
    }

    /// Every limits set defined by any item, `DEFAULT` included
    pub fn limits_sets(&self) -> Vec<String> {
        let mut sets = BTreeSet::new();
        sets.insert(DEFAULT_LIMITS_SET.to_string());
        for target in self.telemetry.values() {
            for packet in &target.packets {
                for item in packet.limits_items() {
                    if let Some(limits) = item.limits() {
                        sets.extend(limits.sets().map(str::to_string));
                    }
                }
            }
        }
        sets.into_iter().collect()
    }

    /// Limits set used by [`Registry::check_limits`]
    pub fn limits_set(&self) -> &str {
        &self.limits_set
    }

    /// Selects the active limits set
    pub fn set_limits_set(&mut self, set: &str) -> Result<()> {
        let set = set.to_uppercase();
        if !self.limits_sets().contains(&set) {
            return Err(Error::invalid_value(
                "LIMITS_SET",
                format!("limits set {} is not defined", set),
            ));
        }
        info!("Limits set changed to {}", set);
        self.limits_set = set;
        Ok(())
    }

    /// Checks limits of every telemetry packet against the active set
    pub fn check_limits(&self, ignore_persistence: bool) -> Vec<LimitsChange> {
        self.telemetry
            .values()
            .flat_map(|t| t.packets.iter())
            .flat_map(|p| p.check_limits(&self.limits_set, ignore_persistence))
            .collect()
    }

    /// Items of all telemetry packets whose color needs attention
    pub fn out_of_limits(&self) -> Vec<OutOfLimits> {
        let mut out = Vec::new();
        for target in self.telemetry.values() {
            for packet in &target.packets {
                for (item, state) in packet.out_of_limits() {
                    out.push(OutOfLimits {
                        target: packet.target_name().to_string(),
                        packet: packet.packet_name().to_string(),
                        item,
                        state,
                    });
                }
            }
        }
        out
    }
}

fn unknown_group(group: &str) -> Error {
    Error::invalid_value(
        "LIMITS_GROUP",
        format!("limits group {} does not exist", group.to_uppercase()),
    )
}
