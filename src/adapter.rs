//! Widening and narrowing of the value on top of the stack between its
//! static type and the type the surrounding context expects.
//!
//! The contract both directions share: whatever leaves the stack for the
//! target type has exactly `aligned_size(target)` bytes. Mixed unions are
//! the only representation change that moves bytes; every reference-shaped
//! adaptation is a no-op because the pointee carries its own type-id.

use crate::environ::{TypeEnvironment, TypeId, TypeKind};
use crate::lowerer::Lowerer;
use crate::{LowerError, LowerResult};

impl<'a, E: TypeEnvironment> Lowerer<'a, E> {
    /// Widens the top of the stack from `from` to `to`.
    pub(crate) fn upcast(&mut self, from: TypeId, to: TypeId) -> LowerResult<()> {
        if from == to {
            return Ok(());
        }
        let env = self.env;
        let from = env.remove_indirection(from);
        let to = env.remove_indirection(to);
        if from == to || env.kind(from) == TypeKind::NoReturn {
            return Ok(());
        }
        let from_size = self.asize(from);
        let to_size = self.asize(to);
        match env.kind(to) {
            TypeKind::MixedUnion => match env.kind(from) {
                // a union keeps its tag when it only grows
                TypeKind::MixedUnion => self.push_zero_bytes(to_size - from_size),
                TypeKind::Nil => {
                    self.buffer.put_in_union(env.runtime_id(from), 0, to_size);
                }
                _ => {
                    self.buffer
                        .put_in_union(env.runtime_id(from), from_size, to_size);
                }
            },
            TypeKind::NilableReference
            | TypeKind::NilableReferenceUnion
            | TypeKind::ReferenceUnion
            | TypeKind::Virtual { .. }
            | TypeKind::VirtualMetaclass => match env.kind(from) {
                TypeKind::Nil => self.buffer.put_i64(0),
                _ if from_size == 8 => {}
                _ => return Err(self.width_mismatch(from_size, to_size)),
            },
            _ if from_size == to_size => {}
            _ => return Err(self.width_mismatch(from_size, to_size)),
        }
        Ok(())
    }

    /// Narrows the top of the stack from `from` to `to`. Only valid when
    /// the dynamic value is known to be representable in `to`.
    pub(crate) fn downcast(&mut self, from: TypeId, to: TypeId) -> LowerResult<()> {
        if from == to {
            return Ok(());
        }
        let env = self.env;
        let from = env.remove_indirection(from);
        let to = env.remove_indirection(to);
        if from == to || env.kind(to) == TypeKind::NoReturn {
            return Ok(());
        }
        let from_size = self.asize(from);
        let to_size = self.asize(to);
        match env.kind(from) {
            TypeKind::MixedUnion => match env.kind(to) {
                TypeKind::MixedUnion => self.pop_bytes(from_size - to_size),
                TypeKind::Nil => self.pop_bytes(from_size),
                _ => self.buffer.remove_from_union(from_size, to_size),
            },
            TypeKind::NilableReference
            | TypeKind::NilableReferenceUnion
            | TypeKind::ReferenceUnion
            | TypeKind::Virtual { .. }
            | TypeKind::VirtualMetaclass => match env.kind(to) {
                TypeKind::Nil => self.pop_bytes(8),
                _ if to_size == 8 => {}
                _ => return Err(self.width_mismatch(from_size, to_size)),
            },
            TypeKind::NoReturn => {}
            _ if from_size == to_size => {}
            _ => return Err(self.width_mismatch(from_size, to_size)),
        }
        Ok(())
    }

    fn width_mismatch(&self, from_bytes: u32, to_bytes: u32) -> LowerError {
        LowerError::WidthMismatch {
            from_bytes,
            to_bytes,
        }
    }
}
