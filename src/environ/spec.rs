//! The `TypeEnvironment` trait pins down everything the lowering pass needs
//! to know about types without owning the type system itself: layout (stack
//! footprint and payload footprint), runtime identity, instance-variable and
//! tuple-element placement, union membership, and the handful of algebraic
//! operations (`filter_by`, `merge`) the frontend already implements for
//! inference.
//!
//! All queries must be deterministic for a given type identity. The pass
//! re-reads `node.ty` on every visit, so an environment is free to narrow a
//! node's type between two compilations; it must never change the answers
//! for a `TypeId` it already handed out.

use crate::ast::NumberKind;
use crate::ffi::FfiType;
use cranelift_entity::entity_impl;

/// An opaque reference to a type owned by the external type system.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeId(u32);
entity_impl!(TypeId, "type");

/// The discriminant of a type, as far as lowering cares.
///
/// Reference-carrying kinds (`Class { is_struct: false }`, virtual types,
/// reference unions, nilables) are all represented on the stack as one
/// 8-byte pointer whose pointee carries the runtime type-id. Mixed unions
/// are the only tagged representation: an 8-byte type-id tag followed by
/// the widest payload.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TypeKind {
    Nil,
    Bool,
    Char,
    Symbol,
    Integer(NumberKind),
    Float(NumberKind),
    Pointer,
    Proc,
    Tuple,
    NamedTuple,
    Enum,
    StaticArray,
    /// A non-generic class or struct.
    Class { is_struct: bool },
    /// An instantiated generic class or struct.
    GenericInstance { is_struct: bool },
    /// A module used as an instance type; `struct_includers` is true when
    /// every including type is a struct.
    Module { struct_includers: bool },
    Virtual { is_struct: bool },
    VirtualMetaclass,
    Metaclass,
    MixedUnion,
    ReferenceUnion,
    NilableReference,
    NilableReferenceUnion,
    TypeDef,
    Alias,
    Lib,
    NoReturn,
}

/// Placement of an instance variable inside its owner.
///
/// For reference owners the offset already accounts for the object header.
#[derive(Clone, Copy, Debug)]
pub struct InstanceVar {
    pub offset: u32,
    pub ty: TypeId,
}

/// The type system's interface, as required by the lowering core.
pub trait TypeEnvironment {
    fn kind(&self, ty: TypeId) -> TypeKind;

    /// Bytes the value occupies on the operand stack, trailing padding
    /// included. Always a multiple of 8; nil is 0.
    fn aligned_size(&self, ty: TypeId) -> u32;

    /// Bytes the value occupies inside an aggregate (no trailing padding).
    fn inner_size(&self, ty: TypeId) -> u32;

    /// The runtime type-id, as stored in object headers and union tags.
    fn runtime_id(&self, ty: TypeId) -> u32;

    /// Heap footprint of one instance of a reference type, header included.
    fn instance_size(&self, ty: TypeId) -> u32 {
        self.inner_size(ty)
    }

    fn instance_var(&self, ty: TypeId, name: &str) -> Option<InstanceVar>;

    /// Member types of a union (or of a virtual type's subtype set).
    fn union_variants(&self, ty: TypeId) -> Vec<TypeId>;

    /// Element types of a tuple, in declaration order.
    fn tuple_types(&self, ty: TypeId) -> Vec<TypeId>;

    /// Byte offset of a tuple element inside the tuple payload.
    fn tuple_offset(&self, ty: TypeId, index: usize) -> u32;

    /// Offset and type of a named-tuple entry.
    fn named_tuple_entry(&self, ty: TypeId, name: &str) -> Option<(u32, TypeId)>;

    /// Enum members as `(name, value)` pairs, declaration order.
    fn enum_members(&self, ty: TypeId) -> Vec<(String, i64)>;

    /// The integer type an enum is backed by.
    fn enum_base(&self, ty: TypeId) -> TypeId;

    fn proc_params(&self, ty: TypeId) -> Vec<TypeId>;

    fn proc_return(&self, ty: TypeId) -> TypeId;

    /// `T` for `Pointer(T)` and for static arrays.
    fn pointer_element(&self, ty: TypeId) -> TypeId;

    /// Narrow `ty` by `target`: the subset of `ty` that is also `target`,
    /// or `None` when the two cannot overlap.
    fn filter_by(&self, ty: TypeId, target: TypeId) -> Option<TypeId>;

    /// Strip typedef/alias indirection.
    fn remove_indirection(&self, ty: TypeId) -> TypeId;

    /// The least common ancestor of two types (union-forming).
    fn merge(&self, a: TypeId, b: TypeId) -> TypeId;

    fn no_return(&self) -> TypeId;

    fn nil(&self) -> TypeId;

    fn bool_(&self) -> TypeId;

    /// The foreign representation of `ty` for lib calls.
    fn ffi_type(&self, ty: TypeId) -> FfiType;

    fn is_nil(&self, ty: TypeId) -> bool {
        self.kind(ty) == TypeKind::Nil
    }

    fn is_pointer(&self, ty: TypeId) -> bool {
        self.kind(ty) == TypeKind::Pointer
    }

    fn is_struct(&self, ty: TypeId) -> bool {
        match self.kind(ty) {
            TypeKind::Class { is_struct }
            | TypeKind::GenericInstance { is_struct }
            | TypeKind::Virtual { is_struct } => is_struct,
            TypeKind::Module { struct_includers } => struct_includers,
            TypeKind::StaticArray => true,
            TypeKind::TypeDef | TypeKind::Alias => self.is_struct(self.remove_indirection(ty)),
            _ => false,
        }
    }

    /// Whether the representation is a bare pointer that may not be nil.
    fn is_reference_like(&self, ty: TypeId) -> bool {
        match self.kind(ty) {
            TypeKind::Class { is_struct }
            | TypeKind::GenericInstance { is_struct }
            | TypeKind::Virtual { is_struct } => !is_struct,
            TypeKind::ReferenceUnion => true,
            TypeKind::TypeDef | TypeKind::Alias => {
                self.is_reference_like(self.remove_indirection(ty))
            }
            _ => false,
        }
    }

    /// Whether values are copied rather than shared when passed around.
    fn passed_by_value(&self, ty: TypeId) -> bool {
        match self.kind(ty) {
            TypeKind::Tuple | TypeKind::NamedTuple | TypeKind::StaticArray | TypeKind::MixedUnion => {
                true
            }
            TypeKind::Class { is_struct }
            | TypeKind::GenericInstance { is_struct }
            | TypeKind::Virtual { is_struct } => is_struct,
            TypeKind::Module { struct_includers } => struct_includers,
            TypeKind::TypeDef | TypeKind::Alias => {
                self.passed_by_value(self.remove_indirection(ty))
            }
            _ => false,
        }
    }

    /// Whether a receiver of this type must reach its methods through a
    /// pointer so that mutation is visible to the caller: mutable
    /// aggregates that are not hidden inside a union.
    fn needs_struct_pointer(&self, ty: TypeId) -> bool {
        match self.kind(ty) {
            TypeKind::StaticArray => true,
            TypeKind::Class { is_struct }
            | TypeKind::GenericInstance { is_struct }
            | TypeKind::Virtual { is_struct } => is_struct,
            TypeKind::Module { struct_includers } => struct_includers,
            TypeKind::TypeDef | TypeKind::Alias => {
                self.needs_struct_pointer(self.remove_indirection(ty))
            }
            _ => false,
        }
    }
}
