//! Foreign-function call descriptors and the lowering rule for calls whose
//! receiver is a lib type.
//!
//! The core only serializes arguments and references a prebuilt descriptor;
//! the actual invocation mechanism lives in the interpreter. Descriptors
//! for fixed-arity functions are cached per target def. Variadic
//! descriptors are parameterized by the actual argument count and types of
//! one call site, so they are rebuilt every time.

use crate::ast::{CallData, DefId, NodeId, NodeKind, NumberKind};
use crate::context::LibFunId;
use crate::environ::{TypeEnvironment, TypeId, TypeKind};
use crate::lowerer::Lowerer;
use crate::LowerResult;

/// The foreign representation of a value crossing a lib boundary.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FfiType {
    Void,
    SInt8,
    SInt16,
    SInt32,
    SInt64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float32,
    Float64,
    Pointer,
}

impl FfiType {
    pub fn for_int(kind: NumberKind) -> FfiType {
        match kind {
            NumberKind::I8 => FfiType::SInt8,
            NumberKind::I16 => FfiType::SInt16,
            NumberKind::I32 => FfiType::SInt32,
            NumberKind::I64 => FfiType::SInt64,
            NumberKind::U8 => FfiType::UInt8,
            NumberKind::U16 => FfiType::UInt16,
            NumberKind::U32 => FfiType::UInt32,
            NumberKind::U64 => FfiType::UInt64,
            NumberKind::F32 => FfiType::Float32,
            NumberKind::F64 => FfiType::Float64,
        }
    }
}

/// A prebuilt call descriptor for one foreign function (or callback
/// interface), referenced by `lib_call` operands.
#[derive(Clone, Debug)]
pub struct LibFunction {
    pub name: String,
    pub arg_types: Vec<FfiType>,
    /// Bytes each argument occupies on the operand stack.
    pub arg_bytesizes: Vec<u32>,
    pub return_type: FfiType,
    pub variadic: bool,
}

impl<'a, E: TypeEnvironment> Lowerer<'a, E> {
    /// Lowers a call to a `lib` fun: serialize the arguments, resolve or
    /// build the descriptor, emit `lib_call`.
    pub(crate) fn lower_lib_call(
        &mut self,
        node: NodeId,
        call: &CallData,
        def_id: DefId,
        variadic: bool,
    ) -> LowerResult<()> {
        let program = self.program;
        let env = self.env;
        let def = &program.defs[def_id];

        if call.block.is_some() || call.block_arg.is_some() || !call.named_args.is_empty() {
            return Err(self.err_unsupported("lib funs take positional arguments only", node));
        }

        let mut arg_types = Vec::with_capacity(call.args.len());
        let mut arg_bytesizes = Vec::with_capacity(call.args.len());
        for (i, &arg) in call.args.iter().enumerate() {
            let arg_ty = program.nodes[arg].ty;
            match &program.nodes[arg].kind {
                // nil crosses the boundary as a null pointer
                NodeKind::Nil => {
                    self.buffer.locate(arg);
                    self.buffer.put_i64(0);
                    arg_types.push(FfiType::Pointer);
                    arg_bytesizes.push(8);
                }
                NodeKind::Out(target) => {
                    self.lower_out_arg(*target)?;
                    arg_types.push(FfiType::Pointer);
                    arg_bytesizes.push(8);
                }
                _ if env.kind(arg_ty) == TypeKind::Proc => {
                    // a callback: the proc value plus its call-interface
                    // descriptor
                    self.lower_value(arg)?;
                    let interface = self.callback_interface(arg_ty);
                    self.buffer.put_i64(i64::from(interface.as_u32()));
                    arg_types.push(FfiType::Pointer);
                    arg_bytesizes.push(24);
                }
                _ => {
                    self.lower_value(arg)?;
                    let target_ty = match def.params.get(i) {
                        Some(param) => {
                            self.upcast(arg_ty, param.ty)?;
                            param.ty
                        }
                        None => arg_ty,
                    };
                    arg_types.push(env.ffi_type(target_ty));
                    arg_bytesizes.push(self.asize(target_ty));
                }
            }
        }

        let return_type = if env.is_nil(def.return_type) {
            FfiType::Void
        } else {
            env.ffi_type(def.return_type)
        };
        let descriptor = LibFunction {
            name: def.name.clone(),
            arg_types,
            arg_bytesizes,
            return_type,
            variadic,
        };
        let fun = if variadic {
            self.ctx.lib_funs.push(descriptor)
        } else if let Some(&fun) = self.ctx.lib_cache.get(&def_id) {
            fun
        } else {
            let fun = self.ctx.lib_funs.push(descriptor);
            self.ctx.lib_cache.insert(def_id, fun);
            fun
        };

        self.buffer.locate(node);
        self.buffer.lib_call(fun.as_u32());

        let ret_size = self.asize(def.return_type);
        if !self.wants_value {
            self.pop_bytes(ret_size);
        }
        Ok(())
    }

    /// An `out` argument: a pointer-width argument aimed at the underlying
    /// variable.
    fn lower_out_arg(&mut self, target: NodeId) -> LowerResult<()> {
        let program = self.program;
        self.buffer.locate(target);
        match &program.nodes[target].kind {
            NodeKind::Var(name) => {
                let offset = self.resolve_var(name, target)?.offset;
                self.buffer.pointerof_var(offset);
                Ok(())
            }
            NodeKind::InstanceVar(name) => {
                let ivar = self.resolve_self_ivar(name, target)?;
                self.buffer.pointerof_ivar(ivar.offset);
                Ok(())
            }
            _ => Err(self.err_unsupported("out requires a variable", target)),
        }
    }

    /// Builds the call-interface descriptor a callback argument carries.
    fn callback_interface(&mut self, proc_ty: TypeId) -> LibFunId {
        let env = self.env;
        let params = env.proc_params(proc_ty);
        let ret = env.proc_return(proc_ty);
        let descriptor = LibFunction {
            name: "<callback>".to_string(),
            arg_types: params.iter().map(|&p| env.ffi_type(p)).collect(),
            arg_bytesizes: params.iter().map(|&p| env.aligned_size(p)).collect(),
            return_type: if env.is_nil(ret) {
                FfiType::Void
            } else {
                env.ffi_type(ret)
            },
            variadic: false,
        };
        self.ctx.lib_funs.push(descriptor)
    }
}
