//! The instruction set of the stack interpreter, defined once as a
//! descriptor table.
//!
//! `for_each_instruction!` names every opcode together with its ordered,
//! fixed-width operand list; everything else is generated from it: the
//! `Opcode` enum (one byte, in encoding order), per-opcode operand widths,
//! one type-safe emit method per instruction on [`InstrBuffer`], and the
//! decoder behind the disassembly `Display` used by tests.
//!
//! Operand encoding is little-endian: `i64`/`f64` immediates are 8 bytes,
//! `u32` operands (offsets, sizes, slots, handles) 4 bytes. Jump targets
//! are absolute byte offsets into the instruction buffer, emitted as 0 and
//! back-patched once the destination is known.
//!
//! Stack conventions: every value occupies its type's aligned size (a
//! multiple of 8; nil is 0 bytes). Booleans are one 8-byte slot holding 0
//! or 1; `branch_if`/`branch_unless` pop 8 bytes. `f32` payloads live in
//! the low 4 bytes of their slot.

use crate::buffer::InstrBuffer;
use core::fmt;
use smallvec::SmallVec;

pub(crate) trait Operand: Copy {
    const WIDTH: usize;
    fn to_raw(self) -> u64;
}

impl Operand for i64 {
    const WIDTH: usize = 8;
    fn to_raw(self) -> u64 {
        self as u64
    }
}

impl Operand for u32 {
    const WIDTH: usize = 4;
    fn to_raw(self) -> u64 {
        u64::from(self)
    }
}

impl Operand for f64 {
    const WIDTH: usize = 8;
    fn to_raw(self) -> u64 {
        self.to_bits()
    }
}

macro_rules! for_each_instruction {
    ($mac:ident) => {
        $mac! {
            nop = Nop();

            // Typed pushes. `put_nil` pushes nothing (nil is 0 bytes) and
            // exists for the node map at nil-valued positions.
            put_nil = PutNil();
            put_i64 = PutI64(imm: i64);
            put_f64 = PutF64(imm: f64);
            put_f32 = PutF32(bits: u32);
            put_type = PutType(id: u32);
            put_self = PutSelf(size: u32);
            put_string = PutString(string: u32);

            // Frame access. Offsets are byte offsets from the frame base.
            get_local = GetLocal(offset: u32, size: u32);
            set_local = SetLocal(offset: u32, size: u32);
            pointerof_var = PointerofVar(offset: u32);

            // Instance variables of `self` (the receiver slot is always a
            // pointer when self is a struct, and a reference otherwise, so
            // both read through it).
            get_self_ivar = GetSelfIvar(offset: u32, size: u32);
            set_self_ivar = SetSelfIvar(offset: u32, size: u32);
            pointerof_ivar = PointerofIvar(offset: u32);
            // Reads a field through a reference popped off the stack.
            get_ivar = GetIvar(offset: u32, size: u32);

            // Class variables: slot layout is [initialized: 1 byte][payload].
            get_class_var = GetClassVar(slot: u32, size: u32);
            set_class_var = SetClassVar(slot: u32, size: u32);
            class_var_initialized = ClassVarInitialized(slot: u32);
            pointerof_class_var = PointerofClassVar(slot: u32);

            // Constants, same slot layout as class variables.
            get_const = GetConst(slot: u32, size: u32);
            set_const = SetConst(slot: u32, size: u32);
            const_initialized = ConstInitialized(slot: u32);
            get_const_pointer = GetConstPointer(slot: u32);

            // Stack shuffling.
            dup = Dup(size: u32);
            pop = Pop(size: u32);
            // Removes the `offset` bytes lying beneath the top `size`
            // bytes; the top `size` bytes stay.
            pop_from_offset = PopFromOffset(offset: u32, size: u32);
            push_zeros = PushZeros(amount: u32);
            // Pushes a pointer to the `size` bytes currently on top.
            put_stack_top_pointer = PutStackTopPointer(size: u32);

            // Control flow. Targets are absolute buffer offsets.
            jump = Jump(target: u32);
            branch_if = BranchIf(target: u32);
            branch_unless = BranchUnless(target: u32);

            // Calls. `def`/`block`/`fun` are handles into the context's
            // side tables.
            call = Call(def: u32);
            call_with_block = CallWithBlock(def: u32);
            call_block = CallBlock(block: u32);
            lib_call = LibCall(fun: u32);
            proc_call = ProcCall(args_bytesize: u32);

            // Returns. `leave` exits the current def or block with `size`
            // result bytes; `leave_def` exits the enclosing def from inside
            // an inlined block; `break_block` exits the call the block was
            // passed to.
            leave = Leave(size: u32);
            leave_def = LeaveDef(size: u32);
            break_block = BreakBlock(size: u32);

            // Runtime type tests.
            reference_is_a = ReferenceIsA(id: u32);
            union_is_a = UnionIsA(size: u32, id: u32);
            union_to_bool = UnionToBool(size: u32);
            pointer_is_null = PointerIsNull();
            pointer_is_not_null = PointerIsNotNull();
            logical_not = LogicalNot();

            // Mixed-union adaptation: grow to the union width, zero the
            // high bytes and write the tag; or drop the tag and shrink.
            put_in_union = PutInUnion(id: u32, from_size: u32, union_size: u32);
            remove_from_union = RemoveFromUnion(union_size: u32, value_size: u32);

            // Tuples.
            unpack_tuple = UnpackTuple(unpack: u32);
            tuple_element = TupleElement(tuple_size: u32, offset: u32, size: u32);

            // 64-bit integer arithmetic and comparison intrinsics.
            add_i64 = AddI64();
            sub_i64 = SubI64();
            mul_i64 = MulI64();
            div_i64 = DivI64();
            rem_i64 = RemI64();
            div_u64 = DivU64();
            rem_u64 = RemU64();
            lt_i64 = LtI64();
            le_i64 = LeI64();
            gt_i64 = GtI64();
            ge_i64 = GeI64();
            lt_u64 = LtU64();
            le_u64 = LeU64();
            gt_u64 = GtU64();
            ge_u64 = GeU64();
            eq_i64 = EqI64();
            ne_i64 = NeI64();

            // Float intrinsics. The f32 forms operate on the low 4 bytes
            // of their slots.
            add_f64 = AddF64();
            sub_f64 = SubF64();
            mul_f64 = MulF64();
            div_f64 = DivF64();
            lt_f64 = LtF64();
            le_f64 = LeF64();
            gt_f64 = GtF64();
            ge_f64 = GeF64();
            eq_f64 = EqF64();
            ne_f64 = NeF64();
            add_f32 = AddF32();
            sub_f32 = SubF32();
            mul_f32 = MulF32();
            div_f32 = DivF32();
            lt_f32 = LtF32();
            le_f32 = LeF32();
            gt_f32 = GtF32();
            ge_f32 = GeF32();
            eq_f32 = EqF32();
            ne_f32 = NeF32();

            // Numeric conversions. Extension operands name the source bit
            // width.
            sign_extend = SignExtend(bits: u32);
            zero_extend = ZeroExtend(bits: u32);
            i64_to_f64 = I64ToF64();
            u64_to_f64 = U64ToF64();
            f64_to_i64 = F64ToI64();
            f64_to_u64 = F64ToU64();
            f32_to_f64 = F32ToF64();
            f64_to_f32 = F64ToF32();

            // Pointers and allocation. `pointer_set` writes the value and
            // leaves it on the stack.
            pointer_malloc = PointerMalloc(element_size: u32);
            pointer_get = PointerGet(inner_size: u32, aligned_size: u32);
            pointer_set = PointerSet(inner_size: u32, aligned_size: u32);
            pointer_add = PointerAdd(element_size: u32);
            allocate_class = AllocateClass(size: u32, id: u32);

            unreachable = Unreachable(message: u32);
        }
    };
}

macro_rules! define_instructions {
    ($($snake:ident = $Name:ident ( $( $field:ident : $ty:ty ),* );)*) => {
        /// One-byte opcodes, in encoding order.
        #[derive(Clone, Copy, PartialEq, Eq, Debug)]
        #[repr(u8)]
        pub enum Opcode {
            $($Name,)*
        }

        /// Every opcode, indexed by its encoding byte.
        pub const OPCODES: &[Opcode] = &[$(Opcode::$Name,)*];

        impl Opcode {
            pub fn name(self) -> &'static str {
                match self {
                    $(Opcode::$Name => stringify!($snake),)*
                }
            }

            pub fn from_byte(byte: u8) -> Option<Opcode> {
                OPCODES.get(usize::from(byte)).copied()
            }

            /// Fixed widths of the operands, in order.
            pub fn operand_widths(self) -> &'static [usize] {
                match self {
                    $(Opcode::$Name => &[$(<$ty as Operand>::WIDTH),*],)*
                }
            }
        }

        impl InstrBuffer {
            $(
                pub fn $snake(&mut self $(, $field: $ty)*) {
                    self.op(Opcode::$Name);
                    $(self.raw_operand(Operand::to_raw($field), <$ty as Operand>::WIDTH);)*
                }
            )*
        }
    };
}

for_each_instruction!(define_instructions);

/// One decoded instruction; operands hold the raw little-endian payloads.
#[derive(Clone, Debug)]
pub struct DecodedInstr {
    pub offset: u32,
    pub op: Opcode,
    pub operands: SmallVec<[u64; 3]>,
}

/// Decodes an instruction buffer. Stops at the first malformed byte, which
/// only ever happens on a buffer the patcher has not finished with.
pub fn decode(bytes: &[u8]) -> Vec<DecodedInstr> {
    let mut out = Vec::new();
    let mut pos = 0usize;
    while pos < bytes.len() {
        let offset = pos as u32;
        let op = match Opcode::from_byte(bytes[pos]) {
            Some(op) => op,
            None => break,
        };
        pos += 1;
        let mut operands = SmallVec::new();
        for &width in op.operand_widths() {
            if pos + width > bytes.len() {
                return out;
            }
            let mut raw = 0u64;
            for (i, byte) in bytes[pos..pos + width].iter().enumerate() {
                raw |= u64::from(*byte) << (8 * i);
            }
            pos += width;
            operands.push(raw);
        }
        out.push(DecodedInstr {
            offset,
            op,
            operands,
        });
    }
    out
}

impl fmt::Display for DecodedInstr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.op.name())?;
        for (i, raw) in self.operands.iter().enumerate() {
            let sep = if i == 0 { " " } else { ", " };
            match self.op {
                Opcode::PutI64 => write!(f, "{sep}{}", *raw as i64)?,
                Opcode::PutF64 => write!(f, "{sep}{}", f64::from_bits(*raw))?,
                Opcode::PutF32 => write!(f, "{sep}{}", f32::from_bits(*raw as u32))?,
                _ => write!(f, "{sep}{raw}")?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_bytes_round_trip() {
        for (i, op) in OPCODES.iter().enumerate() {
            assert_eq!(Opcode::from_byte(i as u8), Some(*op));
        }
        assert_eq!(Opcode::from_byte(OPCODES.len() as u8), None);
    }

    #[test]
    fn decode_reads_operand_widths() {
        let mut buffer = InstrBuffer::new();
        buffer.put_i64(-7);
        buffer.get_local(16, 8);
        buffer.add_i64();
        buffer.leave(8);

        let instrs = decode(buffer.bytes());
        assert_eq!(instrs.len(), 4);
        assert_eq!(instrs[0].op, Opcode::PutI64);
        assert_eq!(instrs[0].operands[0] as i64, -7);
        assert_eq!(instrs[1].op, Opcode::GetLocal);
        assert_eq!(&instrs[1].operands[..], &[16, 8]);
        assert_eq!(instrs[2].offset, 9 + 9);
        assert_eq!(instrs[3].op, Opcode::Leave);
    }

    #[test]
    fn float_immediates_keep_their_bits() {
        let mut buffer = InstrBuffer::new();
        buffer.put_f64(3.25);
        let instrs = decode(buffer.bytes());
        assert_eq!(f64::from_bits(instrs[0].operands[0]), 3.25);
        assert_eq!(instrs[0].to_string(), "put_f64 3.25");
    }
}
