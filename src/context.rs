//! Long-lived compilation state shared by every lowering invocation in a
//! process: interning pools, constant and class-variable slots, compiled
//! defs and blocks, foreign-function descriptors and tuple-unpack shapes.
//!
//! Everything here is append-only during a session; instructions reference
//! entries through small integer handles rather than embedded pointers, so
//! a buffer stays meaningful as long as its context lives.

use crate::ast::{BlockId, ClassVarId, ConstId, DefId};
use crate::buffer::InstrBuffer;
use crate::environ::TypeId;
use crate::ffi::LibFunction;
use crate::frame::LocalFrame;
use cranelift_entity::{entity_impl, PrimaryMap};
use std::collections::HashMap;

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct StrId(u32);
entity_impl!(StrId, "str");

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SymId(u32);
entity_impl!(SymId, "sym");

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConstSlot(u32);
entity_impl!(ConstSlot, "cslot");

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClassVarSlot(u32);
entity_impl!(ClassVarSlot, "cvslot");

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CompiledDefId(u32);
entity_impl!(CompiledDefId, "cdef");

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CompiledBlockId(u32);
entity_impl!(CompiledBlockId, "cblock");

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct LibFunId(u32);
entity_impl!(LibFunId, "libfun");

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct UnpackId(u32);
entity_impl!(UnpackId, "unpack");

/// Bytecode plus frame metadata for one def instantiation.
///
/// Executing `instructions` with `args_bytesize` bytes prepopulated on the
/// stack and the frame pointer positioned accordingly produces exactly one
/// value of the def's return type on top on normal completion.
pub struct CompiledDef {
    /// The AST def, when one exists; dispatch trampolines and synthetic
    /// entry defs have none.
    pub def: Option<DefId>,
    pub name: String,
    pub args_bytesize: u32,
    pub locals_bytesize: u32,
    pub return_bytesize: u32,
    pub instructions: InstrBuffer,
    pub local_vars: LocalFrame,
}

/// An inlined block: bytecode executed inside the calling def's frame.
pub struct CompiledBlock {
    pub block: BlockId,
    pub instructions: InstrBuffer,
    /// Bytes `call_block` copies into the block's argument slots.
    pub args_bytesize: u32,
    /// The caller-frame region `[start, end)` reserved for the block's
    /// locals.
    pub locals_start: u32,
    pub locals_end: u32,
    pub block_level: u32,
}

/// A constant slot: one `initialized` byte followed by the payload.
pub struct ConstantSlot {
    pub decl: ConstId,
    pub initializer: CompiledDefId,
    /// Byte offset of the slot in the constants memory.
    pub offset: u32,
    pub bytesize: u32,
}

pub struct ClassVarSlotInfo {
    pub decl: ClassVarId,
    pub initializer: Option<CompiledDefId>,
    pub offset: u32,
    pub bytesize: u32,
}

/// The shape `unpack_tuple` applies: where each element sits inside the
/// tuple and how many bytes its target block argument takes.
pub struct TupleUnpack {
    pub tuple_bytesize: u32,
    /// `(offset, inner size, target aligned size)` per element.
    pub elements: Vec<(u32, u32, u32)>,
}

#[derive(Default)]
pub struct Context {
    strings: PrimaryMap<StrId, String>,
    string_index: HashMap<String, StrId>,
    symbols: PrimaryMap<SymId, String>,
    symbol_index: HashMap<String, SymId>,

    pub consts: PrimaryMap<ConstSlot, ConstantSlot>,
    const_index: HashMap<ConstId, ConstSlot>,
    const_bytesize: u32,

    pub class_vars: PrimaryMap<ClassVarSlot, ClassVarSlotInfo>,
    class_var_index: HashMap<ClassVarId, ClassVarSlot>,
    class_var_bytesize: u32,

    pub defs: PrimaryMap<CompiledDefId, CompiledDef>,
    pub def_cache: HashMap<DefId, CompiledDefId>,
    pub dispatch_cache: HashMap<(Option<TypeId>, Vec<DefId>), CompiledDefId>,

    pub blocks: PrimaryMap<CompiledBlockId, CompiledBlock>,

    pub lib_funs: PrimaryMap<LibFunId, LibFunction>,
    pub lib_cache: HashMap<DefId, LibFunId>,

    pub unpacks: PrimaryMap<UnpackId, TupleUnpack>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intern_string(&mut self, s: &str) -> StrId {
        if let Some(&id) = self.string_index.get(s) {
            return id;
        }
        let id = self.strings.push(s.to_string());
        self.string_index.insert(s.to_string(), id);
        id
    }

    pub fn string(&self, id: StrId) -> &str {
        &self.strings[id]
    }

    pub fn intern_symbol(&mut self, s: &str) -> SymId {
        if let Some(&id) = self.symbol_index.get(s) {
            return id;
        }
        let id = self.symbols.push(s.to_string());
        self.symbol_index.insert(s.to_string(), id);
        id
    }

    pub fn symbol(&self, id: SymId) -> &str {
        &self.symbols[id]
    }

    /// Allocates a compiled-def slot up front so recursive references can
    /// name it while its body is still being lowered.
    pub fn reserve_def(
        &mut self,
        name: impl Into<String>,
        def: Option<DefId>,
        args_bytesize: u32,
        return_bytesize: u32,
    ) -> CompiledDefId {
        self.defs.push(CompiledDef {
            def,
            name: name.into(),
            args_bytesize,
            locals_bytesize: 0,
            return_bytesize,
            instructions: InstrBuffer::new(),
            local_vars: LocalFrame::new(),
        })
    }

    pub fn finish_def(&mut self, id: CompiledDefId, instructions: InstrBuffer, frame: LocalFrame) {
        let def = &mut self.defs[id];
        def.locals_bytesize = frame.max_bytesize();
        def.instructions = instructions;
        def.local_vars = frame;
    }

    pub fn const_slot(&self, decl: ConstId) -> Option<ConstSlot> {
        self.const_index.get(&decl).copied()
    }

    pub fn declare_const(
        &mut self,
        decl: ConstId,
        initializer: CompiledDefId,
        payload_bytesize: u32,
    ) -> ConstSlot {
        let bytesize = 1 + payload_bytesize;
        let slot = self.consts.push(ConstantSlot {
            decl,
            initializer,
            offset: self.const_bytesize,
            bytesize,
        });
        self.const_bytesize += bytesize;
        self.const_index.insert(decl, slot);
        slot
    }

    pub fn class_var_slot(&self, decl: ClassVarId) -> Option<ClassVarSlot> {
        self.class_var_index.get(&decl).copied()
    }

    pub fn declare_class_var(
        &mut self,
        decl: ClassVarId,
        initializer: Option<CompiledDefId>,
        payload_bytesize: u32,
    ) -> ClassVarSlot {
        let bytesize = 1 + payload_bytesize;
        let slot = self.class_vars.push(ClassVarSlotInfo {
            decl,
            initializer,
            offset: self.class_var_bytesize,
            bytesize,
        });
        self.class_var_bytesize += bytesize;
        self.class_var_index.insert(decl, slot);
        slot
    }

    /// Total bytes of constants memory declared so far.
    pub fn const_bytesize(&self) -> u32 {
        self.const_bytesize
    }

    pub fn class_var_bytesize(&self) -> u32 {
        self.class_var_bytesize
    }
}
