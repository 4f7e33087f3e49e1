//! Structures: an ordered set of fields bound to one byte buffer.
//!
//! A [`Structure`] is split in two halves:
//!
//! - a [`Layout`] holding the field definitions. It is shared behind an
//!   `Arc` and only changes through `&mut self` methods, so once a structure
//!   is shared its layout is frozen;
//! - a buffer state behind a mutex: the bytes, the live geometry of
//!   variably sized fields, and any extra per-buffer state the owner needs.
//!
//! All buffer access goes through a [`BufferGuard`]. Top-level operations
//! take the lock once and pass the guard down to nested reads, so a read
//! never has to lock twice.

pub mod accessor;
pub mod item;

pub use accessor::{BinaryAccessor, Extent};
pub use item::{
    DataType, Endianness, Geometry, OverflowPolicy, StructureItem, VariableBitSize, QUIC_BIT_SIZES,
};

use crate::error::{Error, Result};
use crate::value::Value;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};
use tracing::{debug, warn};

/// Items that can be stored in a structure
pub trait Field: AsRef<StructureItem> + AsMut<StructureItem> + Clone + Send + Sync {}

impl<T> Field for T where T: AsRef<StructureItem> + AsMut<StructureItem> + Clone + Send + Sync {}

/// Extra state stored next to the buffer and guarded by the same lock
pub trait BufferExt: Clone + Default + Send {
    /// Called after every change to the buffer contents
    fn buffer_changed(&mut self) {}
}

impl BufferExt for () {}

/// Field definitions of a structure
#[derive(Debug, Clone)]
pub struct Layout<T> {
    default_endianness: Endianness,
    items: Vec<T>,
    index: HashMap<String, usize>,
    sorted: Vec<usize>,
    pos_bit_size: i64,
    neg_bit_size: i64,
    fixed_size: bool,
    short_buffer_allowed: bool,
    ignore_overlap: bool,
    next_create_index: u64,
}

impl<T: Field> Layout<T> {
    fn new(default_endianness: Endianness) -> Self {
        Self {
            default_endianness,
            items: Vec::new(),
            index: HashMap::new(),
            sorted: Vec::new(),
            pos_bit_size: 0,
            neg_bit_size: 0,
            fixed_size: true,
            short_buffer_allowed: false,
            ignore_overlap: false,
            next_create_index: 0,
        }
    }

    /// Byte order used for items that don't specify one
    pub fn default_endianness(&self) -> Endianness {
        self.default_endianness
    }

    /// Number of items
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns true if no items are defined
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Item by position in definition order
    pub fn item_at(&self, index: usize) -> &T {
        &self.items[index]
    }

    /// Position of an item by (case-insensitive) name
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.index
            .get(name)
            .or_else(|| self.index.get(&name.to_uppercase()))
            .copied()
    }

    /// Item by name
    pub fn get(&self, name: &str) -> Option<&T> {
        self.index_of(name).map(|i| &self.items[i])
    }

    /// Items in definition order
    pub fn items(&self) -> impl Iterator<Item = &T> + '_ {
        self.items.iter()
    }

    /// Positions of the items in layout order
    pub fn sorted_indices(&self) -> &[usize] {
        &self.sorted
    }

    /// Items in layout order
    pub fn sorted_items(&self) -> impl Iterator<Item = &T> + '_ {
        self.sorted.iter().map(move |&i| &self.items[i])
    }

    /// Defined length in bits
    pub fn defined_length_bits(&self) -> i64 {
        self.pos_bit_size + self.neg_bit_size
    }

    /// Defined length in bytes, rounded up
    pub fn defined_length(&self) -> usize {
        (self.defined_length_bits().max(0) as usize).div_ceil(8)
    }

    /// False if any item's size depends on the buffer
    pub fn is_fixed_size(&self) -> bool {
        self.fixed_size
    }

    /// Whether buffers shorter than the defined length are accepted
    pub fn short_buffer_allowed(&self) -> bool {
        self.short_buffer_allowed
    }

    /// Whether overlap warnings are suppressed
    pub fn ignore_overlap(&self) -> bool {
        self.ignore_overlap
    }

    fn define(&mut self, mut item: T) -> Result<usize> {
        self.verify_variable_bit_size(item.as_ref())?;
        let name = item.as_ref().name().to_string();

        if let Some(&index) = self.index.get(&name) {
            let create_index = self.items[index].as_ref().create_index();
            item.as_mut().set_create_index(create_index);
            self.items[index] = item;
            self.sort();
            self.recompute_lengths();
            return Ok(index);
        }

        item.as_mut().set_create_index(self.next_create_index);
        self.next_create_index += 1;
        let index = self.items.len();
        self.update_lengths(item.as_ref());
        self.items.push(item);
        self.index.insert(name, index);

        let out_of_order = self
            .sorted
            .last()
            .map(|&last| {
                self.items[last].as_ref().layout_cmp(self.items[index].as_ref()) == Ordering::Greater
            })
            .unwrap_or(false);
        self.sorted.push(index);
        if out_of_order {
            self.sort();
        }
        Ok(index)
    }

    fn verify_variable_bit_size(&self, item: &StructureItem) -> Result<()> {
        let Some(variable) = item.variable_bit_size() else {
            return Ok(());
        };
        let length_item = self.get(&variable.length_item_name).ok_or_else(|| {
            Error::invalid_definition(
                item.name(),
                format!("length item {} is not defined", variable.length_item_name),
            )
        })?;
        let length_item = length_item.as_ref();
        if !length_item.data_type().is_integer() || length_item.array_size().is_some() {
            return Err(Error::invalid_definition(
                item.name(),
                format!("length item {} must be a scalar INT or UINT", length_item.name()),
            ));
        }
        if length_item.bit_offset() < 0 || length_item.bit_offset() >= item.bit_offset() {
            return Err(Error::invalid_definition(
                item.name(),
                format!("length item {} must precede the item it sizes", length_item.name()),
            ));
        }
        Ok(())
    }

    fn sort(&mut self) {
        let items = &self.items;
        self.sorted
            .sort_by(|&a, &b| items[a].as_ref().layout_cmp(items[b].as_ref()));
    }

    fn update_lengths(&mut self, item: &StructureItem) {
        if item.data_type() == DataType::Derived {
            return;
        }
        let geometry = item.geometry();
        let offset = geometry.bit_offset as i64;
        let size = geometry.total_bit_size() as i64;
        if offset < 0 {
            self.neg_bit_size = self.neg_bit_size.max(-offset);
        } else if size > 0 {
            self.pos_bit_size = self.pos_bit_size.max(offset + size);
        } else {
            self.pos_bit_size = self.pos_bit_size.max(offset);
        }
        if item.is_variable() {
            self.fixed_size = false;
        }
    }

    fn recompute_lengths(&mut self) {
        self.pos_bit_size = 0;
        self.neg_bit_size = 0;
        self.fixed_size = true;
        let items = std::mem::take(&mut self.items);
        for item in &items {
            self.update_lengths(item.as_ref());
        }
        self.items = items;
    }

    fn rebuild_index(&mut self) {
        self.index = self
            .items
            .iter()
            .enumerate()
            .map(|(i, item)| (item.as_ref().name().to_string(), i))
            .collect();
        self.sorted = (0..self.items.len()).collect();
        self.sort();
        self.recompute_lengths();
    }

    /// Bit offset where an appended item would start
    fn append_offset(&self) -> Result<i64> {
        let open = self.items.iter().map(|i| i.as_ref()).find(|i| {
            i.bit_offset() >= 0 && i.is_variable() && i.variable_bit_size().is_none()
        });
        if let Some(open) = open {
            return Err(Error::invalid_definition(
                open.name(),
                "cannot append an item after an open-ended item",
            ));
        }
        Ok(self.pos_bit_size)
    }

    /// Finds items whose bit ranges overlap.
    ///
    /// Items marked `overlap` and DERIVED items are skipped; the whole check
    /// is disabled by `ignore_overlap`.
    pub fn check_bit_offsets(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.ignore_overlap {
            return warnings;
        }
        let mut expected_next: Option<i64> = None;
        let mut previous: Option<&StructureItem> = None;
        let mut negative_section = false;

        for item in self.sorted_items().map(|i| i.as_ref()) {
            if item.data_type() == DataType::Derived {
                continue;
            }
            let offset = item.bit_offset() as i64;
            if offset < 0 && !negative_section {
                negative_section = true;
                expected_next = None;
            }
            if let (Some(next), Some(prev)) = (expected_next, previous) {
                if offset < next && !item.overlap() {
                    let msg = format!(
                        "bit definition overlap at bit offset {} for items {} and {}",
                        offset,
                        item.name(),
                        prev.name()
                    );
                    warn!("{}", msg);
                    warnings.push(msg);
                }
            }
            let size = item.geometry().total_bit_size() as i64;
            let next = if size > 0 { offset + size } else { i64::MAX };
            expected_next = Some(expected_next.map_or(next, |n| n.max(next)));
            previous = Some(item);
        }
        warnings
    }
}

/// Buffer and per-buffer state guarded by the structure's lock
#[derive(Debug, Clone, Default)]
struct BufferState<X> {
    buffer: Option<Vec<u8>>,
    live: Vec<Geometry>,
    ext: X,
}

/// An ordered collection of fields bound to one resizable buffer
#[derive(Debug)]
pub struct Structure<T = StructureItem, X = ()> {
    layout: Arc<Layout<T>>,
    state: Mutex<BufferState<X>>,
}

impl<T: Field, X: BufferExt> Clone for Structure<T, X> {
    fn clone(&self) -> Self {
        let state = self.lock_state().clone();
        Self {
            layout: Arc::clone(&self.layout),
            state: Mutex::new(state),
        }
    }
}

impl<T: Field, X: BufferExt> Default for Structure<T, X> {
    fn default() -> Self {
        Self::new(Endianness::Big)
    }
}

impl<T: Field, X: BufferExt> Structure<T, X> {
    /// Creates an empty structure
    pub fn new(default_endianness: Endianness) -> Self {
        Self {
            layout: Arc::new(Layout::new(default_endianness)),
            state: Mutex::new(BufferState::default()),
        }
    }

    /// Field definitions
    pub fn layout(&self) -> &Layout<T> {
        &self.layout
    }

    /// Item by name
    pub fn get_item(&self, name: &str) -> Result<&T> {
        self.layout
            .get(name)
            .ok_or_else(|| Error::UnknownItem(name.to_uppercase()))
    }

    /// Defined length in bytes
    pub fn defined_length(&self) -> usize {
        self.layout.defined_length()
    }

    /// False if any item's size depends on the buffer
    pub fn is_fixed_size(&self) -> bool {
        self.layout.is_fixed_size()
    }

    /// Defines an item, replacing any existing item with the same name
    pub fn define(&mut self, item: T) -> Result<()> {
        debug!("define item {}", item.as_ref().name());
        Arc::make_mut(&mut self.layout).define(item)?;
        self.refresh_state();
        Ok(())
    }

    /// Defines an item at the current end of the structure
    pub fn append(&mut self, mut item: T) -> Result<()> {
        if item.as_ref().data_type() != DataType::Derived {
            let offset = self.layout.append_offset()?;
            let offset = i32::try_from(offset).map_err(|_| {
                Error::invalid_definition(item.as_ref().name(), "structure too large to append to")
            })?;
            item.as_mut().set_bit_offset(offset)?;
        }
        self.define(item)
    }

    /// Modifies an item in place, re-validating the layout afterwards
    pub fn update_item<F>(&mut self, name: &str, update: F) -> Result<()>
    where
        F: FnOnce(&mut T) -> Result<()>,
    {
        let layout = Arc::make_mut(&mut self.layout);
        let index = layout
            .index_of(name)
            .ok_or_else(|| Error::UnknownItem(name.to_uppercase()))?;
        let mut item = layout.items[index].clone();
        update(&mut item)?;
        layout.define(item)?;
        self.refresh_state();
        Ok(())
    }

    /// Renames an item
    pub fn rename_item(&mut self, old: &str, new: &str) -> Result<()> {
        if self.layout.get(new).is_some() {
            return Err(Error::invalid_definition(new, "an item with this name already exists"));
        }
        let layout = Arc::make_mut(&mut self.layout);
        let index = layout
            .index_of(old)
            .ok_or_else(|| Error::UnknownItem(old.to_uppercase()))?;
        layout.items[index].as_mut().set_name(new);
        layout.rebuild_index();
        Ok(())
    }

    /// Removes an item
    pub fn delete_item(&mut self, name: &str) -> Result<T> {
        let layout = Arc::make_mut(&mut self.layout);
        let index = layout
            .index_of(name)
            .ok_or_else(|| Error::UnknownItem(name.to_uppercase()))?;
        let item = layout.items.remove(index);
        layout.rebuild_index();
        self.refresh_state();
        Ok(item)
    }

    /// Accepts buffers shorter than the defined length
    pub fn set_short_buffer_allowed(&mut self, allowed: bool) {
        Arc::make_mut(&mut self.layout).short_buffer_allowed = allowed;
    }

    /// Suppresses overlap warnings
    pub fn set_ignore_overlap(&mut self, ignore: bool) {
        Arc::make_mut(&mut self.layout).ignore_overlap = ignore;
    }

    /// Finds overlapping items; see [`Layout::check_bit_offsets`]
    pub fn check_bit_offsets(&self) -> Vec<String> {
        self.layout.check_bit_offsets()
    }

    fn lock_state(&self) -> MutexGuard<'_, BufferState<X>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Takes the buffer lock, blocking until it is free
    pub fn lock(&self) -> BufferGuard<'_, T, X> {
        BufferGuard::new(&self.layout, self.lock_state())
    }

    /// Takes the buffer lock only if no other thread holds it
    pub fn try_lock(&self) -> Option<BufferGuard<'_, T, X>> {
        let state = match self.state.try_lock() {
            Ok(state) => state,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return None,
        };
        Some(BufferGuard::new(&self.layout, state))
    }

    /// Reads an item's raw value
    pub fn read(&self, name: &str) -> Result<Value> {
        self.lock().read(name)
    }

    /// Writes an item's raw value
    pub fn write(&self, name: &str, value: impl Into<Value>) -> Result<()> {
        self.lock().write(name, &value.into())
    }

    /// Reads every item in layout order
    pub fn read_all(&self) -> Result<Vec<(String, Value)>> {
        let guard = self.lock();
        self.layout
            .sorted_indices()
            .iter()
            .map(|&i| {
                let name = self.layout.items[i].as_ref().name().to_string();
                guard.read_index(i).map(|v| (name, v))
            })
            .collect()
    }

    /// Replaces the buffer with a copy of `bytes`
    pub fn set_buffer(&self, bytes: &[u8]) -> Result<()> {
        self.lock().set_buffer(bytes)
    }

    /// Copy of the current buffer
    pub fn buffer(&self) -> Vec<u8> {
        self.lock().buffer().to_vec()
    }

    /// Current buffer length in bytes
    pub fn length(&self) -> usize {
        self.lock().buffer().len()
    }

    fn refresh_state(&mut self) {
        let layout: &Layout<T> = &self.layout;
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        state.live.clear();
        if let Some(buffer) = state.buffer.as_mut() {
            if buffer.len() < layout.defined_length() {
                buffer.resize(layout.defined_length(), 0);
            }
            if !layout.is_fixed_size() {
                state.live = recalculate_bit_offsets(layout, buffer);
            }
        }
        state.ext.buffer_changed();
    }
}

impl<X: BufferExt> Structure<StructureItem, X> {
    /// Builds and defines a scalar or array item in the structure's
    /// default byte order
    pub fn define_item(
        &mut self,
        name: &str,
        bit_offset: i32,
        bit_size: i32,
        data_type: DataType,
        array_size: Option<i32>,
    ) -> Result<()> {
        let item = StructureItem::new(
            name,
            bit_offset,
            bit_size,
            data_type,
            self.layout.default_endianness(),
            array_size,
            OverflowPolicy::Error,
        )?;
        self.define(item)
    }

    /// Builds an item and appends it at the current end
    pub fn append_item(
        &mut self,
        name: &str,
        bit_size: i32,
        data_type: DataType,
        array_size: Option<i32>,
    ) -> Result<()> {
        let item = StructureItem::new(
            name,
            0,
            bit_size,
            data_type,
            self.layout.default_endianness(),
            array_size,
            OverflowPolicy::Error,
        )?;
        self.append(item)
    }
}

/// Walks the items in layout order and shifts everything after a variably
/// sized item by the difference between its defined and actual size.
///
/// Items with negative offsets are anchored to the buffer end and are left
/// alone. Length items must precede the items they size.
fn recalculate_bit_offsets<T: Field>(layout: &Layout<T>, buffer: &[u8]) -> Vec<Geometry> {
    let mut live: Vec<Geometry> = layout.items.iter().map(|i| i.as_ref().geometry()).collect();
    let mut adjustment: i64 = 0;

    for &index in &layout.sorted {
        let item = layout.items[index].as_ref();
        let original = item.geometry();
        if item.data_type() == DataType::Derived || original.bit_offset < 0 {
            continue;
        }
        let mut geometry = original;
        geometry.bit_offset = (original.bit_offset as i64 + adjustment) as i32;

        if let Some(variable) = item.variable_bit_size() {
            let length = layout
                .index_of(&variable.length_item_name)
                .and_then(|li| {
                    BinaryAccessor::read(layout.items[li].as_ref(), &live[li], buffer).ok()
                })
                .and_then(|v| v.as_i128())
                .unwrap_or(0)
                .max(0) as i64;
            let bits = length * variable.length_bits_per_count as i64
                + variable.length_value_bit_offset as i64;
            if original.array_size.is_some() {
                geometry.array_size = Some(bits as i32);
            } else if item.data_type().is_integer() {
                geometry.bit_size = QUIC_BIT_SIZES[length.min(3) as usize];
            } else {
                geometry.bit_size = bits as i32;
            }
            adjustment += (geometry.total_bit_size() - original.total_bit_size()) as i64;
        }
        live[index] = geometry;
    }
    live
}

/// Exclusive access to a structure's buffer.
///
/// Obtained from [`Structure::lock`] or [`Structure::try_lock`]; pass it to
/// nested helpers instead of locking again.
pub struct BufferGuard<'a, T, X> {
    layout: &'a Layout<T>,
    state: MutexGuard<'a, BufferState<X>>,
}

impl<'a, T: Field, X: BufferExt> BufferGuard<'a, T, X> {
    fn new(layout: &'a Layout<T>, mut state: MutexGuard<'a, BufferState<X>>) -> Self {
        if state.buffer.is_none() {
            let buffer = vec![0u8; layout.defined_length()];
            if !layout.is_fixed_size() {
                state.live = recalculate_bit_offsets(layout, &buffer);
            }
            state.buffer = Some(buffer);
        }
        Self { layout, state }
    }

    /// Field definitions
    pub fn layout(&self) -> &'a Layout<T> {
        self.layout
    }

    /// Current buffer contents
    pub fn buffer(&self) -> &[u8] {
        self.state.buffer.as_deref().unwrap_or(&[])
    }

    /// Extra per-buffer state
    pub fn ext(&self) -> &X {
        &self.state.ext
    }

    /// Extra per-buffer state, mutable
    pub fn ext_mut(&mut self) -> &mut X {
        &mut self.state.ext
    }

    /// Live geometry of an item, including variable size adjustments
    pub fn geometry(&self, index: usize) -> Geometry {
        self.state
            .live
            .get(index)
            .copied()
            .unwrap_or_else(|| self.layout.items[index].as_ref().geometry())
    }

    /// Absolute extent of an item in the current buffer
    pub fn extent(&self, index: usize) -> Result<Extent> {
        BinaryAccessor::resolve(&self.geometry(index), self.buffer().len())
    }

    fn index(&self, name: &str) -> Result<usize> {
        self.layout
            .index_of(name)
            .ok_or_else(|| Error::UnknownItem(name.to_uppercase()))
    }

    /// Reads an item's raw value by position
    pub fn read_index(&self, index: usize) -> Result<Value> {
        let item = self.layout.items[index].as_ref();
        let geometry = self.geometry(index);
        if item.variable_bit_size().is_some() && geometry.total_bit_size() == 0 {
            return Ok(empty_value(item));
        }
        BinaryAccessor::read(item, &geometry, self.buffer())
    }

    /// Reads an item's raw value by name
    pub fn read(&self, name: &str) -> Result<Value> {
        self.read_index(self.index(name)?)
    }

    /// Writes an item's raw value by name
    pub fn write(&mut self, name: &str, value: &Value) -> Result<()> {
        let index = self.index(name)?;
        self.write_index(index, value)
    }

    /// Writes an item's raw value by position
    pub fn write_index(&mut self, index: usize, value: &Value) -> Result<()> {
        let layout = self.layout;
        let item = layout.items[index].as_ref();
        if item.variable_bit_size().is_some() {
            self.write_variable(index, value)?;
        } else {
            let geometry = self.geometry(index);
            let buffer = self.state.buffer.get_or_insert_with(Vec::new);
            BinaryAccessor::write(item, &geometry, value, buffer)?;
            if item.is_variable() {
                self.recalculate();
            }
        }
        self.state.ext.buffer_changed();
        Ok(())
    }

    /// Writes a variably sized item and its length item.
    ///
    /// The buffer and live geometry are restored when any step fails, so a
    /// rejected value leaves every item readable as before.
    fn write_variable(&mut self, index: usize, value: &Value) -> Result<()> {
        let buffer = self.state.buffer.clone();
        let live = self.state.live.clone();
        let result = self.resize_and_write(index, value);
        if result.is_err() {
            self.state.buffer = buffer;
            self.state.live = live;
        }
        result
    }

    fn resize_and_write(&mut self, index: usize, value: &Value) -> Result<()> {
        let layout = self.layout;
        let item = layout.items[index].as_ref();
        let Some(variable) = item.variable_bit_size() else {
            return Ok(());
        };
        let current = self.geometry(index);
        let mut target = current;
        let per_count = variable.length_bits_per_count as i64;
        let value_offset = variable.length_value_bit_offset as i64;

        let length_value = if let Some(values) = value.as_array() {
            let bits = values.len() as i64 * item.bit_size() as i64;
            let length = ((bits - value_offset).max(0) + per_count - 1) / per_count;
            target.array_size = Some((length * per_count + value_offset) as i32);
            length
        } else if item.data_type().is_integer() {
            let v = value.to_integer()?;
            let length = QUIC_BIT_SIZES
                .iter()
                .position(|&size| fits(v, size as u32, item.data_type()))
                .unwrap_or(QUIC_BIT_SIZES.len() - 1);
            target.bit_size = QUIC_BIT_SIZES[length];
            length as i64
        } else {
            let bytes = value.as_bytes().ok_or_else(|| {
                Error::invalid_value(
                    item.data_type(),
                    format!("expected a string or block, got {}", value.type_name()),
                )
            })?;
            let bits = bytes.len() as i64 * 8;
            let length = ((bits - value_offset).max(0) + per_count - 1) / per_count;
            target.bit_size = (length * per_count + value_offset) as i32;
            length
        };

        let old_bits = current.total_bit_size() as i64;
        let new_bits = target.total_bit_size() as i64;
        if old_bits != new_bits {
            let end_bit = current.bit_offset as i64 + old_bits;
            if end_bit % 8 != 0 || (new_bits - old_bits) % 8 != 0 {
                return Err(Error::invalid_value(
                    item.data_type(),
                    format!("{} cannot change size by a partial byte", item.name()),
                ));
            }
            let buffer = self.state.buffer.get_or_insert_with(Vec::new);
            let end_byte = (end_bit / 8) as usize;
            if new_bits > old_bits {
                let grow = ((new_bits - old_bits) / 8) as usize;
                accessor::splice(buffer, end_byte, 0, &vec![0u8; grow]);
            } else {
                let shrink = ((old_bits - new_bits) / 8) as usize;
                accessor::splice(buffer, end_byte - shrink, shrink, &[]);
            }
        }

        let length_index = self.index(&variable.length_item_name)?;
        let length_item = layout.items[length_index].as_ref();
        let length_geometry = self.geometry(length_index);
        let buffer = self.state.buffer.get_or_insert_with(Vec::new);
        BinaryAccessor::write(length_item, &length_geometry, &Value::Int(length_value), buffer)?;
        self.recalculate();

        let geometry = self.geometry(index);
        if geometry.total_bit_size() == 0 {
            return Ok(());
        }
        let buffer = self.state.buffer.get_or_insert_with(Vec::new);
        BinaryAccessor::write(item, &geometry, value, buffer)
    }

    fn recalculate(&mut self) {
        if self.layout.is_fixed_size() {
            return;
        }
        let live = recalculate_bit_offsets(self.layout, self.buffer());
        self.state.live = live;
    }

    /// Replaces the buffer with a copy of `bytes`.
    ///
    /// Shorter buffers are zero padded when the layout allows short buffers
    /// and rejected otherwise, leaving the current buffer in place. Longer
    /// buffers are rejected for fixed size layouts.
    pub fn set_buffer(&mut self, bytes: &[u8]) -> Result<()> {
        let defined = self.layout.defined_length();
        let mut buffer = bytes.to_vec();
        if buffer.len() < defined {
            if !self.layout.short_buffer_allowed() {
                return Err(Error::ShortBuffer {
                    actual: buffer.len(),
                    defined,
                });
            }
            debug!(
                "zero padding short buffer from {} to {} bytes",
                buffer.len(),
                defined
            );
            buffer.resize(defined, 0);
        } else if buffer.len() > defined && self.layout.is_fixed_size() && defined > 0 {
            return Err(Error::LongBuffer {
                actual: buffer.len(),
                defined,
            });
        }
        self.state.buffer = Some(buffer);
        self.state.live.clear();
        self.recalculate();
        self.state.ext.buffer_changed();
        Ok(())
    }
}

fn empty_value(item: &StructureItem) -> Value {
    if item.array_size().is_some() {
        return Value::Array(Vec::new());
    }
    match item.data_type() {
        DataType::String => Value::String(String::new()),
        DataType::Block => Value::Block(Vec::new()),
        _ => Value::Null,
    }
}

fn fits(value: i128, bit_size: u32, data_type: DataType) -> bool {
    if data_type == DataType::Int {
        let half = 1i128 << (bit_size - 1);
        value >= -half && value < half
    } else {
        value >= 0 && value < (1i128 << bit_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn uint(name: &str, offset: i32, size: i32) -> StructureItem {
        StructureItem::scalar(name, offset, size, DataType::Uint).unwrap()
    }

    #[test]
    fn test_define_and_lengths() {
        let mut s: Structure = Structure::default();
        s.define(uint("A", 0, 8)).unwrap();
        s.define(uint("B", 8, 16)).unwrap();
        s.define(uint("TRAILER", -8, 8)).unwrap();
        assert_eq!(s.defined_length(), 4);
        assert!(s.is_fixed_size());
        assert_eq!(s.buffer(), vec![0u8; 4]);
    }

    #[test]
    fn test_convenience_constructors_use_default_endianness() {
        let mut s: Structure = Structure::new(Endianness::Little);
        s.append_item("A", 16, DataType::Uint, None).unwrap();
        s.define_item("LIST", 16, 8, DataType::Uint, Some(24)).unwrap();
        assert_eq!(s.get_item("A").unwrap().endianness(), Endianness::Little);
        assert_eq!(s.defined_length(), 5);

        s.set_buffer(&[0x34, 0x12, 1, 2, 3]).unwrap();
        assert_eq!(s.read("A").unwrap(), Value::UInt(0x1234));
        assert_eq!(
            s.read("LIST").unwrap(),
            Value::Array(vec![Value::UInt(1), Value::UInt(2), Value::UInt(3)])
        );
    }

    #[test]
    fn test_append_places_items_at_end() {
        let mut s: Structure = Structure::default();
        s.append(uint("A", 0, 8)).unwrap();
        s.append(uint("B", 0, 16)).unwrap();
        s.append(StructureItem::scalar("D", 0, 0, DataType::Derived).unwrap())
            .unwrap();
        assert_eq!(s.get_item("B").unwrap().bit_offset(), 8);
        assert_eq!(s.get_item("D").unwrap().bit_offset(), 0);
        assert_eq!(s.defined_length(), 3);
    }

    #[test]
    fn test_sorted_order() {
        let mut s: Structure = Structure::default();
        s.define(uint("LATE", 16, 8)).unwrap();
        s.define(uint("END", -8, 8)).unwrap();
        s.define(uint("EARLY", 0, 8)).unwrap();
        s.define(StructureItem::scalar("DERIVED", 0, 0, DataType::Derived).unwrap())
            .unwrap();
        s.define(StructureItem::scalar("OPEN", 16, 0, DataType::Block).unwrap())
            .unwrap();
        let names: Vec<&str> = s.layout().sorted_items().map(|i| i.name()).collect();
        assert_eq!(names, vec!["DERIVED", "EARLY", "OPEN", "LATE", "END"]);
    }

    #[test]
    fn test_redefine_keeps_position() {
        let mut s: Structure = Structure::default();
        s.define(uint("A", 0, 8)).unwrap();
        s.define(uint("B", 8, 8)).unwrap();
        s.define(uint("A", 16, 8)).unwrap();
        assert_eq!(s.layout().len(), 2);
        assert_eq!(s.get_item("A").unwrap().create_index(), 0);
        let names: Vec<&str> = s.layout().sorted_items().map(|i| i.name()).collect();
        assert_eq!(names, vec!["B", "A"]);
    }

    #[test]
    fn test_read_write_by_name() {
        let mut s: Structure = Structure::default();
        s.define(uint("A", 0, 8)).unwrap();
        s.define(uint("B", 8, 16)).unwrap();
        s.write("b", 0x1234u32).unwrap();
        assert_eq!(s.read("B").unwrap(), Value::UInt(0x1234));
        assert_eq!(s.buffer(), vec![0x00, 0x12, 0x34]);
        assert!(matches!(s.read("NOPE"), Err(Error::UnknownItem(_))));
    }

    #[test]
    fn test_buffer_length_checks() {
        let mut s: Structure = Structure::default();
        s.define(uint("A", 0, 16)).unwrap();
        assert!(matches!(s.set_buffer(&[1]), Err(Error::ShortBuffer { .. })));
        assert!(matches!(s.set_buffer(&[1, 2, 3]), Err(Error::LongBuffer { .. })));

        s.set_short_buffer_allowed(true);
        s.set_buffer(&[0xAB]).unwrap();
        assert_eq!(s.buffer(), vec![0xAB, 0x00]);
    }

    #[test]
    fn test_overlap_warnings() {
        let mut s: Structure = Structure::default();
        s.define(uint("A", 0, 16)).unwrap();
        s.define(uint("B", 8, 8)).unwrap();
        let warnings = s.check_bit_offsets();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("B and A"));

        s.update_item("B", |item| {
            item.set_overlap(true);
            Ok(())
        })
        .unwrap();
        assert!(s.check_bit_offsets().is_empty());

        s.define(uint("C", 8, 4)).unwrap();
        assert_eq!(s.check_bit_offsets().len(), 1);
        s.set_ignore_overlap(true);
        assert!(s.check_bit_offsets().is_empty());
    }

    fn variable_structure() -> Structure {
        let mut s: Structure = Structure::default();
        s.append(uint("LEN", 0, 8)).unwrap();
        let mut text = StructureItem::scalar("TEXT", 0, 16, DataType::String).unwrap();
        text.set_bit_offset(8).unwrap();
        text.set_variable_bit_size(VariableBitSize::new("LEN")).unwrap();
        s.define(text).unwrap();
        s.append(uint("AFTER", 0, 16)).unwrap();
        s
    }

    #[test]
    fn test_variable_string_shifts_following_items() {
        let s = variable_structure();
        assert!(!s.is_fixed_size());
        assert_eq!(s.defined_length(), 5);

        let mut buffer = vec![10u8];
        buffer.extend_from_slice(b"0123456789");
        buffer.extend_from_slice(&[0xBE, 0xEF]);
        s.set_buffer(&buffer).unwrap();

        let guard = s.lock();
        let after = s.layout().index_of("AFTER").unwrap();
        assert_eq!(guard.geometry(after).bit_offset, 24 + (10 - 2) * 8);
        assert_eq!(guard.read("AFTER").unwrap(), Value::UInt(0xBEEF));
        assert_eq!(guard.read("TEXT").unwrap(), Value::from("0123456789"));
    }

    #[test]
    fn test_variable_string_write_updates_length() {
        let s = variable_structure();
        s.set_buffer(b"\x02AB\x00\x00").unwrap();
        s.write("AFTER", 0x0102u32).unwrap();
        assert_eq!(s.buffer(), b"\x02AB\x01\x02".to_vec());
        s.write("TEXT", "HELLO").unwrap();
        assert_eq!(s.read("LEN").unwrap(), Value::UInt(5));
        assert_eq!(s.read("AFTER").unwrap(), Value::UInt(0x0102));
        assert_eq!(s.buffer(), b"\x05HELLO\x01\x02".to_vec());

        s.write("TEXT", "A").unwrap();
        assert_eq!(s.buffer(), b"\x01A\x01\x02".to_vec());
    }

    #[test]
    fn test_failed_variable_write_leaves_buffer_intact() {
        let s = variable_structure();
        s.set_buffer(b"\x02hi\x00\x07").unwrap();

        // 300 does not fit the 8 bit LEN item
        let long = "x".repeat(300);
        let err = s.write("TEXT", long.as_str()).unwrap_err();
        assert!(matches!(err.root(), Error::Overflow { .. }));
        assert_eq!(s.buffer(), b"\x02hi\x00\x07".to_vec());
        assert_eq!(s.read("LEN").unwrap(), Value::UInt(2));
        assert_eq!(s.read("TEXT").unwrap(), Value::from("hi"));
        assert_eq!(s.read("AFTER").unwrap(), Value::UInt(7));

        s.write("TEXT", "ok!").unwrap();
        assert_eq!(s.buffer(), b"\x03ok!\x00\x07".to_vec());
    }

    #[test]
    fn test_shrinking_variable_write_keeps_trailing_item() {
        let s = variable_structure();
        s.set_buffer(b"\x05HELLO\xBE\xEF").unwrap();
        s.write("TEXT", "AB").unwrap();
        assert_eq!(s.length(), 5);
        assert_eq!(s.read("LEN").unwrap(), Value::UInt(2));
        assert_eq!(s.read("AFTER").unwrap(), Value::UInt(0xBEEF));

        s.write("TEXT", "").unwrap();
        assert_eq!(s.buffer(), b"\x00\xBE\xEF".to_vec());
        assert_eq!(s.read("AFTER").unwrap(), Value::UInt(0xBEEF));
    }

    #[test]
    fn test_zero_length_reads_empty() {
        let s = variable_structure();
        s.set_buffer(&[0, 0xAA, 0xBB, 0, 0]).unwrap();
        assert_eq!(s.read("TEXT").unwrap(), Value::from(""));
        assert_eq!(s.read("AFTER").unwrap(), Value::UInt(0xAABB));
    }

    #[test]
    fn test_quic_sized_integer() {
        let mut s: Structure = Structure::default();
        s.append(uint("LEN", 0, 2)).unwrap();
        let mut value = StructureItem::scalar("VALUE", 2, 6, DataType::Uint).unwrap();
        value.set_variable_bit_size(VariableBitSize::new("LEN")).unwrap();
        s.define(value).unwrap();
        s.append(uint("NEXT", 0, 8)).unwrap();

        s.write("VALUE", 37u32).unwrap();
        assert_eq!(s.buffer(), vec![37, 0]);
        s.write("NEXT", 0xAAu32).unwrap();
        s.write("VALUE", 1000u32).unwrap();
        assert_eq!(s.read("LEN").unwrap(), Value::UInt(1));
        assert_eq!(s.buffer(), vec![0x40 | (1000 >> 8) as u8, (1000 & 0xFF) as u8, 0xAA]);
        assert_eq!(s.read("VALUE").unwrap(), Value::UInt(1000));
        assert_eq!(s.read("NEXT").unwrap(), Value::UInt(0xAA));
    }

    #[test]
    fn test_length_item_must_precede() {
        let mut s: Structure = Structure::default();
        let mut text = StructureItem::scalar("TEXT", 0, 16, DataType::String).unwrap();
        text.set_variable_bit_size(VariableBitSize::new("LEN")).unwrap();
        assert!(s.define(text).is_err());
    }

    #[test]
    fn test_try_lock_skips_when_busy() {
        let mut s: Structure = Structure::default();
        s.define(uint("A", 0, 8)).unwrap();
        let guard = s.lock();
        assert!(s.try_lock().is_none());
        drop(guard);
        assert!(s.try_lock().is_some());
    }

    #[test]
    fn test_clone_has_independent_buffer() {
        let mut s: Structure = Structure::default();
        s.define(uint("A", 0, 8)).unwrap();
        s.write("A", 1u32).unwrap();
        let copy = s.clone();
        copy.write("A", 2u32).unwrap();
        assert_eq!(s.read("A").unwrap(), Value::UInt(1));
        assert_eq!(copy.read("A").unwrap(), Value::UInt(2));
    }

    #[test]
    fn test_delete_and_rename() {
        let mut s: Structure = Structure::default();
        s.define(uint("A", 0, 8)).unwrap();
        s.define(uint("B", 8, 8)).unwrap();
        s.rename_item("A", "FIRST").unwrap();
        assert!(s.get_item("FIRST").is_ok());
        s.delete_item("B").unwrap();
        assert_eq!(s.defined_length(), 1);
        assert!(s.get_item("B").is_err());
    }
}
