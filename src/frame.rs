//! Stack-slot bookkeeping for one def's frame.
//!
//! Slots are handed out in declaration order and never move once declared.
//! Blocks push a scope: their locals extend the same frame at the next
//! block level, and resolution walks from the innermost live level outward,
//! so an inner declaration shadows an outer one of the same name. Popping a
//! scope retires its slots and frees their byte region for a sibling block,
//! while the high-water mark keeps the def's total frame size accurate.

use crate::environ::TypeId;

#[derive(Clone, Debug)]
pub struct Slot {
    pub name: String,
    pub ty: TypeId,
    pub offset: u32,
    pub block_level: u32,
}

#[derive(Clone, Copy)]
struct SavedScope {
    bytesize: u32,
    slots_len: usize,
}

#[derive(Default)]
pub struct LocalFrame {
    slots: Vec<Slot>,
    bytesize: u32,
    max_bytesize: u32,
    block_level: u32,
    saved: Vec<SavedScope>,
}

impl LocalFrame {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a slot of `aligned_size` bytes and returns its offset. A
    /// name already declared at the current block level keeps its slot.
    pub fn declare(&mut self, name: &str, ty: TypeId, aligned_size: u32) -> u32 {
        if let Some(slot) = self
            .slots
            .iter()
            .rev()
            .find(|s| s.block_level == self.block_level && s.name == name)
        {
            debug_assert_eq!(slot.ty, ty, "redeclaration of `{name}` at another type");
            return slot.offset;
        }
        let offset = self.bytesize;
        self.slots.push(Slot {
            name: name.to_string(),
            ty,
            offset,
            block_level: self.block_level,
        });
        self.bytesize += aligned_size;
        self.max_bytesize = self.max_bytesize.max(self.bytesize);
        offset
    }

    /// Resolves a name, innermost block level first.
    pub fn resolve(&self, name: &str) -> Option<&Slot> {
        self.slots
            .iter()
            .rev()
            .find(|s| s.block_level <= self.block_level && s.name == name)
    }

    pub fn push_block(&mut self) {
        self.saved.push(SavedScope {
            bytesize: self.bytesize,
            slots_len: self.slots.len(),
        });
        self.block_level += 1;
    }

    pub fn pop_block(&mut self) {
        let saved = self.saved.pop().expect("pop_block without a push_block");
        self.slots.truncate(saved.slots_len);
        self.bytesize = saved.bytesize;
        self.block_level -= 1;
    }

    /// Bytes currently occupied by live slots.
    pub fn bytesize(&self) -> u32 {
        self.bytesize
    }

    /// High-water mark over the whole compilation; the frame size the
    /// interpreter must reserve.
    pub fn max_bytesize(&self) -> u32 {
        self.max_bytesize
    }

    pub fn block_level(&self) -> u32 {
        self.block_level
    }
}
