//! A miniature concrete type system for testing the lowering pass without a
//! real inference frontend.
//!
//! `DummyTypeEnvironment` keeps one `TypeDecl` record per type and answers
//! the `TypeEnvironment` queries straight from it. Layouts follow the
//! production conventions: stack footprints are multiples of 8, reference
//! objects carry an 8-byte type-id header, mixed unions an 8-byte tag ahead
//! of the widest payload.

use crate::ast::NumberKind;
use crate::environ::spec::{InstanceVar, TypeEnvironment, TypeId, TypeKind};
use crate::ffi::FfiType;
use cranelift_entity::PrimaryMap;

/// Everything the dummy environment records about one type.
#[derive(Clone, Debug)]
pub struct TypeDecl {
    pub kind: TypeKind,
    pub aligned: u32,
    pub inner: u32,
    /// Instance variables: `(name, offset, type)`.
    pub ivars: Vec<(String, u32, TypeId)>,
    /// Union members or virtual subtypes.
    pub variants: Vec<TypeId>,
    /// Tuple elements: `(offset, type)`.
    pub elements: Vec<(u32, TypeId)>,
    /// Named-tuple keys, parallel to `elements`.
    pub names: Vec<String>,
    /// Heap footprint of a reference instance, header included.
    pub instance: u32,
    pub enum_members: Vec<(String, i64)>,
    /// Enum base, typedef/alias underlying, pointer element or proc return.
    pub base: Option<TypeId>,
    /// Proc parameter types.
    pub params: Vec<TypeId>,
    pub ffi: FfiType,
}

impl TypeDecl {
    fn new(kind: TypeKind, aligned: u32, inner: u32) -> Self {
        Self {
            kind,
            aligned,
            inner,
            ivars: Vec::new(),
            variants: Vec::new(),
            elements: Vec::new(),
            names: Vec::new(),
            instance: 0,
            enum_members: Vec::new(),
            base: None,
            params: Vec::new(),
            ffi: FfiType::Pointer,
        }
    }
}

pub struct DummyTypeEnvironment {
    decls: PrimaryMap<TypeId, TypeDecl>,
    nil: TypeId,
    bool_: TypeId,
    no_return: TypeId,
}

fn align8(n: u32) -> u32 {
    (n + 7) & !7
}

impl DummyTypeEnvironment {
    pub fn new() -> Self {
        let mut decls = PrimaryMap::new();
        let nil = decls.push(TypeDecl::new(TypeKind::Nil, 0, 0));
        let bool_ = decls.push(TypeDecl::new(TypeKind::Bool, 8, 1));
        let no_return = decls.push(TypeDecl::new(TypeKind::NoReturn, 0, 0));
        Self {
            decls,
            nil,
            bool_,
            no_return,
        }
    }

    pub fn declare(&mut self, decl: TypeDecl) -> TypeId {
        self.decls.push(decl)
    }

    pub fn int(&mut self, kind: NumberKind) -> TypeId {
        let inner = kind.byte_width();
        let mut d = TypeDecl::new(TypeKind::Integer(kind), 8, inner);
        d.ffi = FfiType::for_int(kind);
        self.declare(d)
    }

    pub fn float(&mut self, kind: NumberKind) -> TypeId {
        let inner = kind.byte_width();
        let mut d = TypeDecl::new(TypeKind::Float(kind), 8, inner);
        d.ffi = if inner == 4 {
            FfiType::Float32
        } else {
            FfiType::Float64
        };
        self.declare(d)
    }

    pub fn char(&mut self) -> TypeId {
        self.declare(TypeDecl::new(TypeKind::Char, 8, 4))
    }

    pub fn symbol(&mut self) -> TypeId {
        self.declare(TypeDecl::new(TypeKind::Symbol, 8, 4))
    }

    /// A heap class; instance vars get an 8-byte header before them.
    pub fn reference_class(&mut self, ivars: &[(&str, TypeId)]) -> TypeId {
        let mut d = TypeDecl::new(TypeKind::Class { is_struct: false }, 8, 8);
        let mut offset = 8;
        for (name, ty) in ivars {
            let inner = self.decls[*ty].inner;
            offset = align_to(offset, inner);
            d.ivars.push((name.to_string(), offset, *ty));
            offset += inner;
        }
        d.instance = align8(offset.max(8));
        self.declare(d)
    }

    /// A by-value struct; instance vars start at offset 0.
    pub fn value_struct(&mut self, ivars: &[(&str, TypeId)]) -> TypeId {
        let mut d = TypeDecl::new(TypeKind::Class { is_struct: true }, 0, 0);
        let mut offset = 0;
        for (name, ty) in ivars {
            let inner = self.decls[*ty].inner;
            offset = align_to(offset, inner);
            d.ivars.push((name.to_string(), offset, *ty));
            offset += inner;
        }
        d.inner = offset.max(1);
        d.aligned = align8(d.inner);
        self.declare(d)
    }

    pub fn mixed_union(&mut self, variants: &[TypeId]) -> TypeId {
        let widest = variants
            .iter()
            .map(|v| self.decls[*v].aligned)
            .max()
            .unwrap_or(0);
        let mut d = TypeDecl::new(TypeKind::MixedUnion, 8 + widest, 8 + widest);
        d.variants = variants.to_vec();
        self.declare(d)
    }

    pub fn reference_union(&mut self, variants: &[TypeId]) -> TypeId {
        let mut d = TypeDecl::new(TypeKind::ReferenceUnion, 8, 8);
        d.variants = variants.to_vec();
        self.declare(d)
    }

    pub fn nilable(&mut self, of: TypeId) -> TypeId {
        let mut d = TypeDecl::new(TypeKind::NilableReference, 8, 8);
        d.variants = vec![self.nil, of];
        self.declare(d)
    }

    pub fn virtual_of(&mut self, subtypes: &[TypeId], is_struct: bool) -> TypeId {
        let mut d = TypeDecl::new(TypeKind::Virtual { is_struct }, 8, 8);
        d.variants = subtypes.to_vec();
        self.declare(d)
    }

    pub fn tuple_of(&mut self, elements: &[TypeId]) -> TypeId {
        let mut d = TypeDecl::new(TypeKind::Tuple, 0, 0);
        let mut offset = 0;
        for ty in elements {
            let inner = self.decls[*ty].inner;
            offset = align_to(offset, inner);
            d.elements.push((offset, *ty));
            offset += inner;
        }
        d.inner = offset.max(1);
        d.aligned = align8(d.inner);
        self.declare(d)
    }

    pub fn named_tuple_of(&mut self, entries: &[(&str, TypeId)]) -> TypeId {
        let types: Vec<TypeId> = entries.iter().map(|(_, t)| *t).collect();
        let id = self.tuple_of(&types);
        self.decls[id].kind = TypeKind::NamedTuple;
        self.decls[id].names = entries.iter().map(|(n, _)| n.to_string()).collect();
        id
    }

    pub fn enum_type(&mut self, base: TypeId, members: &[(&str, i64)]) -> TypeId {
        let mut d = TypeDecl::new(TypeKind::Enum, 8, self.decls[base].inner);
        d.base = Some(base);
        d.enum_members = members
            .iter()
            .map(|(n, v)| (n.to_string(), *v))
            .collect();
        d.ffi = self.decls[base].ffi;
        self.declare(d)
    }

    pub fn pointer_to(&mut self, element: TypeId) -> TypeId {
        let mut d = TypeDecl::new(TypeKind::Pointer, 8, 8);
        d.base = Some(element);
        self.declare(d)
    }

    pub fn static_array(&mut self, element: TypeId, len: u32) -> TypeId {
        let inner = self.decls[element].inner * len;
        let mut d = TypeDecl::new(TypeKind::StaticArray, align8(inner), inner);
        d.base = Some(element);
        self.declare(d)
    }

    pub fn proc_type(&mut self, params: &[TypeId], ret: TypeId) -> TypeId {
        let mut d = TypeDecl::new(TypeKind::Proc, 16, 16);
        d.params = params.to_vec();
        d.base = Some(ret);
        self.declare(d)
    }

    pub fn lib_type(&mut self) -> TypeId {
        self.declare(TypeDecl::new(TypeKind::Lib, 0, 0))
    }

    pub fn metaclass(&mut self) -> TypeId {
        self.declare(TypeDecl::new(TypeKind::Metaclass, 8, 4))
    }
}

fn align_to(offset: u32, width: u32) -> u32 {
    let w = width.clamp(1, 8);
    (offset + w - 1) / w * w
}

impl Default for DummyTypeEnvironment {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeEnvironment for DummyTypeEnvironment {
    fn kind(&self, ty: TypeId) -> TypeKind {
        self.decls[ty].kind
    }

    fn aligned_size(&self, ty: TypeId) -> u32 {
        self.decls[ty].aligned
    }

    fn inner_size(&self, ty: TypeId) -> u32 {
        self.decls[ty].inner
    }

    fn runtime_id(&self, ty: TypeId) -> u32 {
        ty.as_u32()
    }

    fn instance_size(&self, ty: TypeId) -> u32 {
        let decl = &self.decls[ty];
        if decl.instance != 0 {
            decl.instance
        } else {
            decl.inner
        }
    }

    fn instance_var(&self, ty: TypeId, name: &str) -> Option<InstanceVar> {
        self.decls[ty]
            .ivars
            .iter()
            .find(|(n, _, _)| n == name)
            .map(|&(_, offset, ty)| InstanceVar { offset, ty })
    }

    fn union_variants(&self, ty: TypeId) -> Vec<TypeId> {
        self.decls[ty].variants.clone()
    }

    fn tuple_types(&self, ty: TypeId) -> Vec<TypeId> {
        self.decls[ty].elements.iter().map(|&(_, t)| t).collect()
    }

    fn tuple_offset(&self, ty: TypeId, index: usize) -> u32 {
        self.decls[ty].elements[index].0
    }

    fn named_tuple_entry(&self, ty: TypeId, name: &str) -> Option<(u32, TypeId)> {
        let decl = &self.decls[ty];
        decl.names
            .iter()
            .position(|n| n == name)
            .map(|i| decl.elements[i])
    }

    fn enum_members(&self, ty: TypeId) -> Vec<(String, i64)> {
        self.decls[ty].enum_members.clone()
    }

    fn enum_base(&self, ty: TypeId) -> TypeId {
        self.decls[ty].base.expect("enum without a base type")
    }

    fn proc_params(&self, ty: TypeId) -> Vec<TypeId> {
        self.decls[ty].params.clone()
    }

    fn proc_return(&self, ty: TypeId) -> TypeId {
        self.decls[ty].base.expect("proc without a return type")
    }

    fn pointer_element(&self, ty: TypeId) -> TypeId {
        self.decls[ty].base.expect("pointer without an element type")
    }

    fn filter_by(&self, ty: TypeId, target: TypeId) -> Option<TypeId> {
        if ty == target {
            return Some(ty);
        }
        if self.decls[ty].variants.contains(&target) {
            return Some(target);
        }
        if self.decls[target].variants.contains(&ty) {
            return Some(ty);
        }
        None
    }

    fn remove_indirection(&self, ty: TypeId) -> TypeId {
        match self.decls[ty].kind {
            TypeKind::TypeDef | TypeKind::Alias => {
                self.remove_indirection(self.decls[ty].base.expect("typedef without underlying"))
            }
            _ => ty,
        }
    }

    fn merge(&self, a: TypeId, b: TypeId) -> TypeId {
        if a == b {
            return a;
        }
        if a == self.no_return {
            return b;
        }
        if b == self.no_return {
            return a;
        }
        for (id, decl) in self.decls.iter() {
            let unites = matches!(
                decl.kind,
                TypeKind::MixedUnion
                    | TypeKind::ReferenceUnion
                    | TypeKind::NilableReference
                    | TypeKind::NilableReferenceUnion
            );
            if unites && decl.variants.contains(&a) && decl.variants.contains(&b) {
                return id;
            }
        }
        panic!("dummy environment has no type uniting the two operands of merge");
    }

    fn no_return(&self) -> TypeId {
        self.no_return
    }

    fn nil(&self) -> TypeId {
        self.nil
    }

    fn bool_(&self) -> TypeId {
        self.bool_
    }

    fn ffi_type(&self, ty: TypeId) -> FfiType {
        self.decls[ty].ffi
    }
}
