//! Per-target identification tables.
//!
//! A target identifies buffers in one of two modes. In [`IdMode::Hash`] the
//! ID values read from the buffer are looked up in a table, falling back to
//! the target's catch-all packet. Hash mode is only possible when every
//! packet with ID items places them identically and no two packets share
//! the same ID values. Otherwise the target uses [`IdMode::Scan`], which
//! asks each packet in definition order.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::packet::Packet;
use crate::value::Value;

/// How a target identifies buffers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdMode {
    /// Table lookup of the ID value tuple
    Hash,
    /// Ask each packet in turn
    Scan,
}

/// Identification table of one target
#[derive(Debug, Clone)]
pub struct IdTable {
    mode: IdMode,
    /// Non-virtual packets with ID items, in definition order
    packets: Vec<Arc<Packet>>,
    hash: HashMap<Vec<String>, Arc<Packet>>,
    catchall: Option<Arc<Packet>>,
}

impl Default for IdTable {
    fn default() -> Self {
        Self {
            mode: IdMode::Hash,
            packets: Vec::new(),
            hash: HashMap::new(),
            catchall: None,
        }
    }
}

impl IdTable {
    /// Builds the table for a target's packets, given in definition order
    pub fn build<'p>(target: &str, packets: impl IntoIterator<Item = &'p Arc<Packet>>) -> Self {
        let mut table = IdTable::default();
        let mut signature: Option<Vec<String>> = None;

        for packet in packets.into_iter().filter(|p| !p.is_virtual()) {
            if packet.id_items().next().is_none() {
                if table.catchall.is_none() {
                    table.catchall = Some(Arc::clone(packet));
                }
                continue;
            }
            table.packets.push(Arc::clone(packet));
            if table.mode == IdMode::Scan {
                continue;
            }

            let this = packet.id_signature();
            match &signature {
                Some(existing) if *existing != this => {
                    debug!(
                        "{} uses scan identification: {} places its ID items differently",
                        target,
                        packet.packet_name()
                    );
                    table.mode = IdMode::Scan;
                    continue;
                }
                Some(_) => {}
                None => signature = Some(this),
            }
            let key: Vec<String> = packet.id_values().iter().map(id_key).collect();
            if let Some(previous) = table.hash.insert(key, Arc::clone(packet)) {
                debug!(
                    "{} uses scan identification: {} and {} share ID values",
                    target,
                    previous.packet_name(),
                    packet.packet_name()
                );
                table.mode = IdMode::Scan;
            }
        }
        if table.mode == IdMode::Scan {
            table.hash.clear();
        }
        debug!(
            "{} identification table: {:?} mode, {} packets, catchall {}",
            target,
            table.mode,
            table.packets.len(),
            table
                .catchall
                .as_ref()
                .map(|p| p.packet_name())
                .unwrap_or("none")
        );
        table
    }

    /// Identification mode chosen for the target
    pub fn mode(&self) -> IdMode {
        self.mode
    }

    /// Packet used when no ID values match
    pub fn catchall(&self) -> Option<&Arc<Packet>> {
        self.catchall.as_ref()
    }

    /// Finds the packet `buffer` holds
    pub fn identify(&self, buffer: &[u8]) -> Option<&Arc<Packet>> {
        let found = match self.mode {
            IdMode::Hash => self.packets.first().and_then(|first| {
                let values = first.read_id_values(buffer)?;
                let key: Vec<String> = values.iter().map(id_key).collect();
                self.hash.get(&key)
            }),
            IdMode::Scan => self.packets.iter().find(|p| p.identify(buffer)),
        };
        let found = found.or(self.catchall.as_ref());
        trace!(
            "Identified {} bytes as {}",
            buffer.len(),
            found.map(|p| p.packet_name()).unwrap_or("nothing")
        );
        found
    }
}

/// Normalizes a value so that values comparing equal with
/// [`Value::raw_eq`] produce the same key
pub fn id_key(value: &Value) -> String {
    match value {
        Value::Null => "null".into(),
        Value::Int(_) | Value::UInt(_) => format!("i{}", value.as_i128().unwrap_or_default()),
        Value::Float(f) => {
            if f.is_finite() && f.fract() == 0.0 && f.abs() < 1e36 {
                format!("i{}", *f as i128)
            } else {
                format!("f{:?}", f)
            }
        }
        Value::String(s) => hex_key(s.as_bytes()),
        Value::Block(b) => hex_key(b),
        Value::Array(values) => {
            let inner: Vec<String> = values.iter().map(id_key).collect();
            format!("[{}]", inner.join(","))
        }
    }
}

fn hex_key(bytes: &[u8]) -> String {
    let hex: String = bytes.iter().map(|byte| format!("{:02x}", byte)).collect();
    format!("b{}", hex)
}
