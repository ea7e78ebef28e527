//! Trampolines for calls with more than one candidate target.
//!
//! The builder synthesizes one dispatch def per (receiver type, target
//! list) pair: its body re-reads the receiver and arguments out of its own
//! frame, tests their runtime identity against each candidate's parameter
//! types in source order (the frontend sorts most-specific first), and
//! tail-calls the first match. The last candidate runs unconditionally;
//! the frontend guarantees the list is exhaustive. The synthesized def is
//! cached and invoked like any other compiled def.

use crate::ast::{CallData, DefBody, NodeId};
use crate::context::CompiledDefId;
use crate::environ::{TypeEnvironment, TypeId};
use crate::frame::LocalFrame;
use crate::lowerer::Lowerer;
use crate::LowerResult;
use log::trace;
use smallvec::SmallVec;

impl<'a, E: TypeEnvironment> Lowerer<'a, E> {
    pub(crate) fn dispatch_def(
        &mut self,
        node: NodeId,
        call: &CallData,
        call_ty: TypeId,
    ) -> LowerResult<CompiledDefId> {
        let program = self.program;
        let env = self.env;

        if call.block.is_some() || call.block_arg.is_some() || !call.named_args.is_empty() {
            return Err(self.err_unsupported(
                "multidispatch over blocks or named arguments",
                node,
            ));
        }

        let receiver_ty = call.receiver.map(|r| program.nodes[r].ty);
        let key = (receiver_ty, call.target_defs.clone());
        if let Some(&cached) = self.ctx.dispatch_cache.get(&key) {
            trace!("dispatch cache hit for `{}`", call.name);
            return Ok(cached);
        }

        // The trampoline's frame mirrors the call site: receiver first
        // (struct receivers arrive as a pointer), then the arguments at
        // their static types.
        let mut frame = LocalFrame::new();
        let mut receiver_slot = None;
        if let Some(rty) = receiver_ty {
            let size = if env.is_struct(rty) && env.passed_by_value(rty) {
                8
            } else {
                env.aligned_size(rty)
            };
            frame.declare("self", rty, size);
            receiver_slot = Some((0u32, size, rty));
        }
        let mut arg_slots = Vec::with_capacity(call.args.len());
        for (i, &arg) in call.args.iter().enumerate() {
            let ty = program.nodes[arg].ty;
            let size = env.aligned_size(ty);
            let offset = frame.declare(&format!("%arg{i}"), ty, size);
            arg_slots.push((offset, size, ty));
        }
        let args_bytesize = frame.bytesize();

        let cd = self.ctx.reserve_def(
            format!("{}:dispatch", call.name),
            None,
            args_bytesize,
            env.aligned_size(call_ty),
        );
        // cached before the candidates compile, so a recursive call with
        // the same target set resolves to this trampoline
        self.ctx.dispatch_cache.insert(key, cd);

        let mut candidates = Vec::with_capacity(call.target_defs.len());
        for &target in &call.target_defs {
            match program.defs[target].body {
                DefBody::Expr(_) | DefBody::Primitive(_) => {
                    candidates.push((target, self.compile_def(target, None)?));
                }
                DefBody::LibFun { .. } => {
                    return Err(self.err_unsupported("multidispatch over lib funs", node));
                }
            }
        }

        let mut inner = Lowerer::new(self.program, self.env, &mut *self.ctx, frame, None, call_ty);
        let last = candidates.len() - 1;
        for (i, &(target, target_cd)) in candidates.iter().enumerate() {
            let def = &program.defs[target];
            let mut fails: SmallVec<[_; 4]> = SmallVec::new();

            if i < last {
                if let (Some((offset, size, rty)), Some(owner)) = (receiver_slot, def.owner) {
                    if rty != owner && inner.is_polymorphic(rty) {
                        inner.buffer.get_local(offset, size);
                        inner.emit_runtime_type_test(rty, owner)?;
                        inner.buffer.branch_unless(0);
                        fails.push(inner.buffer.patch_location());
                    }
                }
                for (&(offset, size, ty), param) in arg_slots.iter().zip(&def.params) {
                    if ty != param.ty && inner.is_polymorphic(ty) {
                        inner.buffer.get_local(offset, size);
                        inner.emit_runtime_type_test(ty, param.ty)?;
                        inner.buffer.branch_unless(0);
                        fails.push(inner.buffer.patch_location());
                    }
                }
            }

            if let Some((offset, size, rty)) = receiver_slot {
                inner.buffer.get_local(offset, size);
                if let Some(owner) = def.owner {
                    if !(env.is_struct(rty) && env.passed_by_value(rty)) {
                        inner.downcast(rty, owner)?;
                    }
                }
            }
            for (&(offset, size, ty), param) in arg_slots.iter().zip(&def.params) {
                inner.buffer.get_local(offset, size);
                inner.downcast(ty, param.ty)?;
            }
            inner.buffer.call(target_cd.as_u32());
            inner.upcast(def.return_type, call_ty)?;
            inner.buffer.leave(env.aligned_size(call_ty));

            for loc in fails {
                inner.buffer.patch_jump(loc);
            }
        }

        let (buffer, frame) = inner.into_parts();
        self.ctx.finish_def(cd, buffer, frame);
        trace!("synthesized dispatch `{}:dispatch`", call.name);
        Ok(cd)
    }
}
