//! This module contains the bulk of the interesting code performing the
//! lowering from the typed AST to interpreter bytecode.
//!
//! The lowering is done in one pass, node by node, emitting instructions in
//! strict evaluation order; forward jumps are back-patched as soon as their
//! destination exists. Two ambient flags shape what a node leaves on the
//! operand stack:
//!
//! - `wants_value`: when false, the node's result is not pushed. Sequences
//!   use it to avoid dead pushes for discarded intermediate expressions.
//! - `wants_struct_pointer`: when true, the node leaves a region of
//!   `aligned_size` bytes followed by a pointer to a live value of its
//!   type. Reads of variables and fields point straight at their storage;
//!   any branch that computes the value fresh pushes it and points at the
//!   stack top. Either way a mutable-struct method gets a self pointer,
//!   and the region below the call result is popped afterwards.
//!
//! Both flags are saved and restored around every recursive descent that
//! must not inherit them.
//!
//! Control-flow exits consult a stack of contexts: `while` loops keep their
//! pending break/next patch lists, and a block body records the call it can
//! `break` out of. Everything type-shaped is delegated to the
//! [`TypeEnvironment`] the frontend supplies.

use crate::ast::{
    BinaryOp, BlockId, CallData, DefBody, DefId, NodeId, NodeKind, NumberKind, NumberLiteral,
    Primitive, Program,
};
use crate::buffer::{InstrBuffer, PatchLoc};
use crate::context::{CompiledBlock, CompiledBlockId, CompiledDefId, ConstSlot, ClassVarSlot, Context, TupleUnpack};
use crate::environ::{InstanceVar, TypeEnvironment, TypeId, TypeKind};
use crate::frame::LocalFrame;
use crate::{LowerError, LowerResult};
use log::{debug, trace};
use smallvec::SmallVec;

/// A resolved local: where it lives and what the slot holds.
#[derive(Clone, Copy)]
pub(crate) struct VarSlot {
    pub offset: u32,
    pub ty: TypeId,
}

/// Pending exits of the innermost `while`.
struct WhileScope {
    ty: TypeId,
    breaks: SmallVec<[PatchLoc; 4]>,
    nexts: SmallVec<[PatchLoc; 4]>,
}

/// Set while lowering a block body: `break` leaves the call the block was
/// passed to with a value of `break_type`.
struct BlockScope {
    block: BlockId,
    break_type: TypeId,
}

pub(crate) struct Lowerer<'a, E: TypeEnvironment> {
    pub(crate) program: &'a Program,
    pub(crate) env: &'a E,
    pub(crate) ctx: &'a mut Context,
    pub(crate) buffer: InstrBuffer,
    pub(crate) frame: LocalFrame,
    /// Receiver type of the def being lowered; `None` at program scope.
    self_type: Option<TypeId>,
    /// The def's observable return type (merged with the block's break
    /// type when one is inlined).
    return_type: TypeId,
    pub(crate) wants_value: bool,
    pub(crate) wants_struct_pointer: bool,
    whiles: Vec<WhileScope>,
    block_scope: Option<BlockScope>,
    /// The inlined block `yield` invokes, when lowering a yielding def.
    compiled_block: Option<CompiledBlockId>,
    /// Frame slot of a captured block parameter, when the block arrived as
    /// a proc value instead.
    captured_block: Option<(u32, TypeId)>,
}

impl<'a, E: TypeEnvironment> Lowerer<'a, E> {
    pub(crate) fn new(
        program: &'a Program,
        env: &'a E,
        ctx: &'a mut Context,
        frame: LocalFrame,
        self_type: Option<TypeId>,
        return_type: TypeId,
    ) -> Self {
        Self {
            program,
            env,
            ctx,
            buffer: InstrBuffer::new(),
            frame,
            self_type,
            return_type,
            wants_value: true,
            wants_struct_pointer: false,
            whiles: Vec::new(),
            block_scope: None,
            compiled_block: None,
            captured_block: None,
        }
    }

    #[cfg(test)]
    pub(crate) fn for_tests(program: &'a Program, env: &'a E, ctx: &'a mut Context) -> Self {
        let nil = env.nil();
        Self::new(program, env, ctx, LocalFrame::new(), None, nil)
    }

    pub(crate) fn into_parts(self) -> (InstrBuffer, LocalFrame) {
        (self.buffer, self.frame)
    }

    /// Lowers one node under the current flags. This wrapper owns the
    /// struct-pointer discipline; the per-kind rules live in
    /// [`lower_inner`](Self::lower_inner).
    fn lower(&mut self, node: NodeId) -> LowerResult<()> {
        self.buffer.locate(node);
        if self.wants_struct_pointer {
            match &self.program.nodes[node].kind {
                // reads point straight at existing storage
                NodeKind::Var(_) | NodeKind::InstanceVar(_) | NodeKind::ClassVar(_) => {
                    return self.lower_struct_pointer(node);
                }
                // these forward the flag into their live subexpression
                NodeKind::If { .. }
                | NodeKind::Expressions(_)
                | NodeKind::ExceptionHandler { .. } => {}
                // everything else computes the value, then points at it
                _ => {
                    let size = self.asize(self.program.nodes[node].ty);
                    self.with_flags(true, false, |l| l.lower(node))?;
                    self.buffer.put_stack_top_pointer(size);
                    return Ok(());
                }
            }
        }
        self.lower_inner(node)
    }

    fn lower_inner(&mut self, node: NodeId) -> LowerResult<()> {
        let program = self.program;
        let env = self.env;
        let node_ref = &program.nodes[node];
        let node_ty = node_ref.ty;

        match &node_ref.kind {
            /********************************* Literals *********************************
             * Pushed only when a value is wanted. Numbers are widened to one
             * 8-byte slot; strings push a handle to the interned object and
             * symbols their table index.
             ****************************************************************************/
            NodeKind::Nil => {
                if self.wants_value {
                    self.buffer.put_nil();
                }
            }
            NodeKind::Bool(b) => {
                if self.wants_value {
                    self.buffer.put_i64(i64::from(*b));
                }
            }
            NodeKind::Number(lit) => {
                if self.wants_value {
                    self.emit_number(lit);
                }
            }
            NodeKind::Char(c) => {
                if self.wants_value {
                    self.buffer.put_i64(i64::from(u32::from(*c)));
                }
            }
            NodeKind::Str(s) => {
                if self.wants_value {
                    let id = self.ctx.intern_string(s);
                    self.buffer.put_string(id.as_u32());
                }
            }
            NodeKind::Symbol(s) => {
                if self.wants_value {
                    let id = self.ctx.intern_symbol(s);
                    self.buffer.put_i64(i64::from(id.as_u32()));
                }
            }

            /***************************** Tuple literals *******************************
             * Elements are laid out directly on the stack: after each push,
             * pad or shrink to the next element's offset so the stacked
             * bytes mirror the tuple's in-memory layout.
             ****************************************************************************/
            NodeKind::Tuple(elements) => self.lower_tuple(node, elements)?,
            NodeKind::NamedTuple(entries) => self.lower_named_tuple(node, entries)?,

            /***************************** Variable reads *******************************/
            NodeKind::Var(name) => {
                if !self.wants_value {
                    return Ok(());
                }
                if name == "self" {
                    let sty = self
                        .self_type
                        .ok_or_else(|| self.err_unsupported("self outside a method", node))?;
                    if env.is_struct(sty) && env.passed_by_value(sty) {
                        // the receiver slot holds a pointer; materialize
                        self.buffer.get_self_ivar(0, self.asize(sty));
                    } else {
                        self.buffer.put_self(self.asize(sty));
                    }
                    self.downcast(sty, node_ty)?;
                } else {
                    let slot = self.resolve_var(name, node)?;
                    self.buffer.get_local(slot.offset, self.asize(slot.ty));
                    self.downcast(slot.ty, node_ty)?;
                }
            }
            NodeKind::InstanceVar(name) => {
                if !self.wants_value {
                    return Ok(());
                }
                if self.self_type.is_none() {
                    // instance variables outside a method silently read nil
                    self.buffer.put_nil();
                    self.upcast(env.nil(), node_ty)?;
                    return Ok(());
                }
                let ivar = self.resolve_self_ivar(name, node)?;
                self.buffer.get_self_ivar(ivar.offset, self.asize(ivar.ty));
                self.downcast(ivar.ty, node_ty)?;
            }
            NodeKind::ClassVar(id) => {
                if !self.wants_value {
                    return Ok(());
                }
                let slot = self.ensure_class_var(*id)?;
                self.emit_class_var_guard(slot);
                let decl_ty = program.class_vars[self.ctx.class_vars[slot].decl].ty;
                self.buffer.get_class_var(slot.as_u32(), self.asize(decl_ty));
                self.downcast(decl_ty, node_ty)?;
            }

            /******************************* Constants **********************************
             * Simple literals are inlined at the use site. Everything else
             * reads through the lazy-init guard.
             ****************************************************************************/
            NodeKind::Path(id) => {
                if !self.wants_value {
                    return Ok(());
                }
                let decl = &program.consts[*id];
                if program.nodes[decl.value].kind.is_simple_literal() {
                    self.lower(decl.value)?;
                    self.upcast(program.nodes[decl.value].ty, node_ty)?;
                } else {
                    let slot = self.ensure_const(*id)?;
                    self.emit_const_guard(slot);
                    self.buffer.get_const(slot.as_u32(), self.asize(decl.ty));
                    self.downcast(decl.ty, node_ty)?;
                }
            }

            NodeKind::Assign { target, value } => self.lower_assign(node, *target, *value)?,

            /****************************** Control flow ********************************/
            NodeKind::If {
                cond,
                then_branch,
                else_branch,
            } => self.lower_if(node, *cond, *then_branch, *else_branch)?,
            NodeKind::While { cond, body } => self.lower_while(node, *cond, *body)?,
            NodeKind::Return(value) => {
                let value = *value;
                self.lower_value_or_nil(value, node)?;
                let vty = value.map_or(env.nil(), |v| program.nodes[v].ty);
                self.upcast(vty, self.return_type)?;
                let size = self.asize(self.return_type);
                self.buffer.locate(node);
                if self.block_scope.is_some() {
                    self.buffer.leave_def(size);
                } else {
                    self.buffer.leave(size);
                }
            }
            NodeKind::Break(value) => self.lower_break(node, *value)?,
            NodeKind::Next(value) => self.lower_next(node, *value)?,
            NodeKind::Yield { args, has_splat } => self.lower_yield(node, args, *has_splat)?,

            NodeKind::Call(call) => self.lower_call(node, call)?,

            NodeKind::Expressions(list) => {
                if list.is_empty() {
                    if self.wants_value {
                        self.buffer.put_nil();
                        self.upcast(env.nil(), node_ty)?;
                    }
                    return Ok(());
                }
                for &expr in &list[..list.len() - 1] {
                    self.lower_discard(expr)?;
                }
                self.lower(list[list.len() - 1])?;
            }

            /**************************** Address and type ops **************************/
            NodeKind::PointerOf(target) => {
                if !self.wants_value {
                    return Ok(());
                }
                self.lower_pointerof(node, *target)?;
            }
            NodeKind::SizeOf(ty) => {
                if self.wants_value {
                    self.buffer.put_i64(i64::from(env.inner_size(*ty)));
                }
            }
            NodeKind::TypeOf(ty) => {
                if self.wants_value {
                    self.buffer.put_type(env.runtime_id(*ty));
                }
            }
            NodeKind::IsA {
                receiver,
                target,
                nil_check: _,
            } => self.lower_is_a(node, *receiver, *target)?,
            NodeKind::Cast { receiver, target } => self.lower_cast(node, *receiver, *target, false)?,
            NodeKind::NilableCast { receiver, target } => {
                self.lower_cast(node, *receiver, *target, true)?
            }
            NodeKind::Not(receiver) => {
                if !self.wants_value {
                    return self.lower_discard(*receiver);
                }
                let rty = program.nodes[*receiver].ty;
                self.lower_value(*receiver)?;
                self.coerce_to_bool(rty);
                self.buffer.logical_not();
            }
            NodeKind::ReadInstanceVar { receiver, name } => {
                self.lower_read_instance_var(node, *receiver, name)?;
            }

            NodeKind::Out(_) => {
                return Err(self.err_unsupported("out is only valid in a lib call", node));
            }
            NodeKind::UninitializedVar(name) => {
                // the slot exists; its bytes are whatever they are
                self.resolve_var(name, node)?;
                if self.wants_value {
                    self.push_zero_bytes(self.asize(node_ty));
                }
            }
            NodeKind::ProcLiteral { def, is_closure } => {
                if *is_closure {
                    return Err(
                        self.err_unsupported("closures are not supported in proc literals", node)
                    );
                }
                if !self.wants_value {
                    return Ok(());
                }
                let cd = self.compile_def(*def, None)?;
                self.buffer.locate(node);
                self.buffer.put_i64(i64::from(cd.as_u32()));
                self.buffer.put_i64(0);
            }
            NodeKind::ExceptionHandler {
                body,
                ensure,
                has_rescues,
                has_else,
            } => {
                if *has_rescues || *has_else {
                    return Err(
                        self.err_unsupported("rescue and else clauses are not supported", node)
                    );
                }
                self.lower(*body)?;
                if let Some(ensure) = ensure {
                    self.lower_discard(*ensure)?;
                }
            }
            NodeKind::TypeDeclaration { var, value } => match value {
                Some(value) => self.lower_assign(node, *var, *value)?,
                None => {
                    if self.wants_value {
                        self.buffer.put_nil();
                    }
                }
            },

            /******************************* Declarations *******************************
             * Type-level declarations carry no runtime behavior of their
             * own; class and module bodies run for effect.
             ****************************************************************************/
            NodeKind::ClassDef { body } | NodeKind::ModuleDef { body } => {
                if let Some(body) = body {
                    self.lower_discard(*body)?;
                }
                if self.wants_value {
                    self.buffer.put_nil();
                }
            }
            NodeKind::EnumDef
            | NodeKind::LibDef
            | NodeKind::FunDef
            | NodeKind::MacroDef
            | NodeKind::AliasDef
            | NodeKind::AnnotationDef
            | NodeKind::Include
            | NodeKind::Extend => {
                if self.wants_value {
                    self.buffer.put_nil();
                }
            }
            NodeKind::VisibilityModifier(expr) => self.lower(*expr)?,

            NodeKind::FileNode { body, vars } => {
                // the file body becomes a synthetic nil-returning def
                let cd = self.compile_file(*body, vars)?;
                self.buffer.locate(node);
                self.buffer.call(cd.as_u32());
            }
            NodeKind::Unreachable(message) => {
                let id = self.ctx.intern_string(message);
                self.buffer.unreachable(id.as_u32());
            }
        }
        Ok(())
    }

    /**************************** Literal aggregates ****************************/

    fn lower_tuple(&mut self, node: NodeId, elements: &[NodeId]) -> LowerResult<()> {
        if !self.wants_value {
            for &e in elements {
                self.lower_discard(e)?;
            }
            return Ok(());
        }
        let program = self.program;
        let env = self.env;
        let tuple_ty = program.nodes[node].ty;
        let types = env.tuple_types(tuple_ty);
        let total = self.asize(tuple_ty);
        for (i, &element) in elements.iter().enumerate() {
            self.lower_value(element)?;
            self.upcast(program.nodes[element].ty, types[i])?;
            let occupied =
                i64::from(env.tuple_offset(tuple_ty, i)) + i64::from(self.asize(types[i]));
            let next = if i + 1 < elements.len() {
                i64::from(env.tuple_offset(tuple_ty, i + 1))
            } else {
                i64::from(total)
            };
            self.adjust_stack(next - occupied);
        }
        Ok(())
    }

    fn lower_named_tuple(&mut self, node: NodeId, entries: &[(String, NodeId)]) -> LowerResult<()> {
        if !self.wants_value {
            for (_, e) in entries {
                self.lower_discard(*e)?;
            }
            return Ok(());
        }
        let program = self.program;
        let env = self.env;
        let tuple_ty = program.nodes[node].ty;
        let total = self.asize(tuple_ty);
        for (i, (name, element)) in entries.iter().enumerate() {
            let (offset, entry_ty) = env
                .named_tuple_entry(tuple_ty, name)
                .ok_or_else(|| self.err_unsupported("named-tuple entry not in type", node))?;
            self.lower_value(*element)?;
            self.upcast(program.nodes[*element].ty, entry_ty)?;
            let occupied = i64::from(offset) + i64::from(self.asize(entry_ty));
            let next = if i + 1 < entries.len() {
                i64::from(env.named_tuple_entry(tuple_ty, &entries[i + 1].0).unwrap().0)
            } else {
                i64::from(total)
            };
            self.adjust_stack(next - occupied);
        }
        Ok(())
    }

    /// Pad with zeros or shrink so the stack top lands on the next layout
    /// offset.
    fn adjust_stack(&mut self, diff: i64) {
        if diff > 0 {
            self.push_zero_bytes(diff as u32);
        } else if diff < 0 {
            self.pop_bytes((-diff) as u32);
        }
    }

    /******************************** Assignment ********************************/

    fn lower_assign(&mut self, node: NodeId, target: NodeId, value: NodeId) -> LowerResult<()> {
        let program = self.program;
        let env = self.env;
        let wants_value = self.wants_value;
        let node_ty = program.nodes[node].ty;
        let vty = program.nodes[value].ty;

        match &program.nodes[target].kind {
            NodeKind::Var(name) if name == "_" => {
                // underscore evaluates the value and discards the store
                self.with_flags(wants_value, false, |l| l.lower(value))?;
            }
            NodeKind::Var(name) => {
                let slot = self.resolve_var(name, target)?;
                self.lower_value(value)?;
                if wants_value {
                    self.dup_bytes(self.asize(vty));
                }
                self.upcast(vty, slot.ty)?;
                self.buffer.locate(node);
                self.buffer.set_local(slot.offset, self.asize(slot.ty));
            }
            NodeKind::InstanceVar(name) => {
                if self.self_type.is_none() {
                    // outside a method the store silently yields nil
                    self.lower_discard(value)?;
                    if wants_value {
                        self.buffer.locate(node);
                        self.buffer.put_nil();
                        self.upcast(env.nil(), node_ty)?;
                    }
                    return Ok(());
                }
                let ivar = self.resolve_self_ivar(name, target)?;
                self.lower_value(value)?;
                if wants_value {
                    self.dup_bytes(self.asize(vty));
                }
                self.upcast(vty, ivar.ty)?;
                self.buffer.locate(node);
                self.buffer.set_self_ivar(ivar.offset, self.asize(ivar.ty));
            }
            NodeKind::ClassVar(id) => {
                if self.self_type.is_none() {
                    self.lower_discard(value)?;
                    if wants_value {
                        self.buffer.locate(node);
                        self.buffer.put_nil();
                        self.upcast(env.nil(), node_ty)?;
                    }
                    return Ok(());
                }
                let slot = self.ensure_class_var(*id)?;
                // the initializer must not clobber this store later
                self.emit_class_var_guard(slot);
                let decl_ty = program.class_vars[*id].ty;
                self.lower_value(value)?;
                if wants_value {
                    self.dup_bytes(self.asize(vty));
                }
                self.upcast(vty, decl_ty)?;
                self.buffer.locate(node);
                self.buffer.set_class_var(slot.as_u32(), self.asize(decl_ty));
            }
            NodeKind::Path(id) => {
                // a constant definition site
                let decl = &program.consts[*id];
                if program.nodes[decl.value].kind.is_simple_literal() {
                    // inlined at every read; nothing to initialize
                    if wants_value {
                        self.lower(value)?;
                    }
                } else {
                    let slot = self.ensure_const(*id)?;
                    let init = self.ctx.consts[slot].initializer;
                    self.buffer.locate(node);
                    self.buffer.call(init.as_u32());
                    self.buffer.set_const(slot.as_u32(), self.asize(decl.ty));
                    if wants_value {
                        self.buffer.get_const(slot.as_u32(), self.asize(decl.ty));
                    }
                }
            }
            _ => return Err(self.err_unsupported("unhandled assignment target", node)),
        }
        Ok(())
    }

    /******************************* Conditionals *******************************/

    fn lower_if(
        &mut self,
        node: NodeId,
        cond: NodeId,
        then_branch: NodeId,
        else_branch: Option<NodeId>,
    ) -> LowerResult<()> {
        let program = self.program;
        let env = self.env;
        let node_ty = program.nodes[node].ty;

        // a literal condition selects its branch at compile time; the dead
        // branch emits nothing
        if let Some(truth) = program.nodes[cond].kind.literal_truthiness() {
            let live = if truth { Some(then_branch) } else { else_branch };
            match live {
                Some(branch) => {
                    self.lower(branch)?;
                    if self.wants_value && !self.wants_struct_pointer {
                        self.upcast(program.nodes[branch].ty, node_ty)?;
                    }
                }
                None => {
                    if self.wants_value {
                        self.buffer.put_nil();
                        self.upcast(env.nil(), node_ty)?;
                    }
                }
            }
            return Ok(());
        }

        let adapt = self.wants_value && !self.wants_struct_pointer;
        let cond_ty = program.nodes[cond].ty;
        self.with_flags(true, false, |l| l.lower(cond))?;
        self.coerce_to_bool(cond_ty);
        self.buffer.branch_unless(0);
        let else_loc = self.buffer.patch_location();

        self.lower(then_branch)?;
        if adapt {
            self.upcast(program.nodes[then_branch].ty, node_ty)?;
        }
        self.buffer.jump(0);
        let end_loc = self.buffer.patch_location();

        self.buffer.patch_jump(else_loc);
        match else_branch {
            Some(branch) => {
                self.lower(branch)?;
                if adapt {
                    self.upcast(program.nodes[branch].ty, node_ty)?;
                }
            }
            None => {
                if adapt {
                    self.buffer.put_nil();
                    self.upcast(env.nil(), node_ty)?;
                }
            }
        }
        self.buffer.patch_jump(end_loc);
        Ok(())
    }

    /********************************** Loops ***********************************/

    fn lower_while(&mut self, node: NodeId, cond: NodeId, body: NodeId) -> LowerResult<()> {
        let program = self.program;
        let env = self.env;
        let node_ty = program.nodes[node].ty;

        self.buffer.jump(0);
        let cond_loc = self.buffer.patch_location();
        let body_index = self.buffer.here();

        self.whiles.push(WhileScope {
            ty: node_ty,
            breaks: SmallVec::new(),
            nexts: SmallVec::new(),
        });
        self.with_flags(false, false, |l| l.lower(body))?;
        let scope = self.whiles.pop().expect("while scope vanished");

        // `next` re-evaluates the condition
        for loc in &scope.nexts {
            self.buffer.patch_jump(*loc);
        }
        self.buffer.patch_jump(cond_loc);
        let cond_ty = program.nodes[cond].ty;
        self.with_flags(true, false, |l| l.lower(cond))?;
        self.coerce_to_bool(cond_ty);
        self.buffer.branch_if(body_index);

        // normal exit yields nil; breaks jump past it carrying their value
        self.buffer.put_nil();
        self.upcast(env.nil(), node_ty)?;
        for loc in &scope.breaks {
            self.buffer.patch_jump(*loc);
        }
        if !self.wants_value {
            self.pop_bytes(self.asize(node_ty));
        }
        Ok(())
    }

    fn lower_break(&mut self, node: NodeId, value: Option<NodeId>) -> LowerResult<()> {
        let program = self.program;
        let env = self.env;
        let vty = value.map_or(env.nil(), |v| program.nodes[v].ty);
        if let Some(while_ty) = self.whiles.last().map(|scope| scope.ty) {
            self.lower_value_or_nil(value, node)?;
            self.upcast(vty, while_ty)?;
            self.buffer.locate(node);
            self.buffer.jump(0);
            let loc = self.buffer.patch_location();
            self.whiles
                .last_mut()
                .expect("while scope vanished")
                .breaks
                .push(loc);
            Ok(())
        } else if let Some(break_type) = self.block_scope.as_ref().map(|scope| scope.break_type) {
            self.lower_value_or_nil(value, node)?;
            self.upcast(vty, break_type)?;
            self.buffer.locate(node);
            self.buffer.break_block(self.asize(break_type));
            Ok(())
        } else {
            Err(self.err_unsupported("break outside a while or block", node))
        }
    }

    fn lower_next(&mut self, node: NodeId, value: Option<NodeId>) -> LowerResult<()> {
        let program = self.program;
        let env = self.env;
        if !self.whiles.is_empty() {
            if let Some(value) = value {
                self.lower_discard(value)?;
            }
            self.buffer.locate(node);
            self.buffer.jump(0);
            let loc = self.buffer.patch_location();
            self.whiles
                .last_mut()
                .expect("while scope vanished")
                .nexts
                .push(loc);
            Ok(())
        } else if let Some(block) = self.block_scope.as_ref().map(|scope| scope.block) {
            let block_ty = program.blocks[block].ty;
            let vty = value.map_or(env.nil(), |v| program.nodes[v].ty);
            self.lower_value_or_nil(value, node)?;
            self.upcast(vty, block_ty)?;
            self.buffer.locate(node);
            self.buffer.leave(self.asize(block_ty));
            Ok(())
        } else {
            Err(self.err_unsupported("next outside a while or block", node))
        }
    }

    /*********************************** Calls **********************************/

    fn lower_call(&mut self, node: NodeId, call: &'a CallData) -> LowerResult<()> {
        let program = self.program;
        let env = self.env;
        let node_ty = program.nodes[node].ty;

        // lib receivers go through the foreign-function path
        if let Some(receiver) = call.receiver {
            if env.kind(program.nodes[receiver].ty) == TypeKind::Lib {
                let def_id = *call
                    .target_defs
                    .first()
                    .ok_or_else(|| self.no_targets(call, node))?;
                let variadic = match program.defs[def_id].body {
                    DefBody::LibFun { variadic } => variadic,
                    _ => return Err(self.err_unsupported("lib call to a non-fun", node)),
                };
                return self.lower_lib_call(node, call, def_id, variadic);
            }
        }

        if call.target_defs.is_empty() {
            return Err(self.no_targets(call, node));
        }

        // several candidates: go through a dispatch trampoline carrying
        // the call site's static types
        if call.target_defs.len() > 1 {
            let cd = self.dispatch_def(node, call, node_ty)?;
            let mut cleanup = 0;
            if let Some(receiver) = call.receiver {
                cleanup = self.lower_call_receiver(receiver, program.nodes[receiver].ty)?;
            }
            for &arg in &call.args {
                self.lower_value(arg)?;
            }
            self.buffer.locate(node);
            self.buffer.call(cd.as_u32());
            return self.finish_call(node_ty, cleanup);
        }

        let def_id = call.target_defs[0];
        let def = &program.defs[def_id];
        match def.body {
            DefBody::Primitive(p) => return self.lower_primitive_call(node, call, def_id, p),
            DefBody::LibFun { variadic } => {
                return self.lower_lib_call(node, call, def_id, variadic)
            }
            DefBody::Expr(_) => {}
        }

        // an inlined block specializes the callee per call site
        let compiled_block = match call.block {
            Some(block) => Some(self.compile_block(block, def_id)?),
            None => None,
        };
        let cd = self.compile_def(def_id, compiled_block)?;

        let mut cleanup = 0;
        match call.receiver {
            Some(receiver) => {
                let owner = def.owner.unwrap_or(program.nodes[receiver].ty);
                cleanup = self.lower_call_receiver(receiver, owner)?;
            }
            None => {
                if def.owner.is_some() {
                    let sty = self.self_type.ok_or_else(|| {
                        self.err_unsupported("method call without a receiver at program scope", node)
                    })?;
                    if env.is_struct(sty) && env.passed_by_value(sty) {
                        self.buffer.get_local(0, 8);
                    } else {
                        self.buffer.put_self(self.asize(sty));
                    }
                }
            }
        }

        // positional arguments, then named ones in the def's parameter
        // order
        for (i, param) in def.params.iter().enumerate() {
            if i < call.args.len() {
                self.lower_call_arg(call.args[i], param.ty)?;
            } else {
                let (_, arg) = call
                    .named_args
                    .iter()
                    .find(|(name, _)| name == &param.name)
                    .ok_or_else(|| self.err_unsupported("missing call argument", node))?;
                self.lower_call_arg(*arg, param.ty)?;
            }
        }
        if let Some(block_arg) = call.block_arg {
            let param_ty = def
                .block_param
                .as_ref()
                .map_or(program.nodes[block_arg].ty, |p| p.ty);
            self.lower_call_arg(block_arg, param_ty)?;
        }

        self.buffer.locate(node);
        if compiled_block.is_some() {
            self.buffer.call_with_block(cd.as_u32());
        } else {
            self.buffer.call(cd.as_u32());
        }

        let ret_ty = self.merged_return_type(def_id, compiled_block);
        self.upcast(ret_ty, node_ty)?;
        self.finish_call(node_ty, cleanup)
    }

    /// Lowers a call receiver. Struct receivers arrive as a pointer; the
    /// return value is how many stacked bytes must be popped from under
    /// the call result afterwards.
    fn lower_call_receiver(&mut self, receiver: NodeId, owner: TypeId) -> LowerResult<u32> {
        let program = self.program;
        let env = self.env;
        let rty = program.nodes[receiver].ty;

        if !(env.is_struct(rty) && env.passed_by_value(rty)) {
            self.lower_value(receiver)?;
            self.upcast(rty, owner)?;
            return Ok(0);
        }

        self.buffer.locate(receiver);
        match &program.nodes[receiver].kind {
            NodeKind::Var(name) if name == "self" => {
                self.buffer.get_local(0, 8);
                return Ok(0);
            }
            NodeKind::Var(name) => {
                let slot = self.resolve_var(name, receiver)?;
                if slot.ty == rty {
                    self.buffer.pointerof_var(slot.offset);
                    return Ok(0);
                }
                if env.kind(slot.ty) == TypeKind::MixedUnion {
                    // skip the union tag to reach the payload
                    self.buffer.pointerof_var(slot.offset + 8);
                    return Ok(0);
                }
            }
            NodeKind::InstanceVar(name) => {
                if self.self_type.is_some() {
                    let ivar = self.resolve_self_ivar(name, receiver)?;
                    self.buffer.pointerof_ivar(ivar.offset);
                    return Ok(0);
                }
            }
            NodeKind::ClassVar(id) => {
                let slot = self.ensure_class_var(*id)?;
                self.emit_class_var_guard(slot);
                self.buffer.pointerof_class_var(slot.as_u32());
                return Ok(0);
            }
            NodeKind::Path(id) => {
                let slot = self.ensure_const(*id)?;
                self.emit_const_guard(slot);
                self.buffer.get_const_pointer(slot.as_u32());
                return Ok(0);
            }
            _ => {}
        }

        let size = self.asize(rty);
        if env.needs_struct_pointer(rty) {
            self.with_flags(true, true, |l| l.lower(receiver))?;
        } else {
            self.with_flags(true, false, |l| l.lower(receiver))?;
            self.buffer.put_stack_top_pointer(size);
        }
        Ok(size)
    }

    /// One argument: autocasts first (symbol to enum member, number
    /// literal re-emitted at the target kind), then widens to the
    /// parameter's declared type.
    fn lower_call_arg(&mut self, arg: NodeId, param_ty: TypeId) -> LowerResult<()> {
        let program = self.program;
        let env = self.env;
        let anode = &program.nodes[arg];
        match (&anode.kind, env.kind(param_ty)) {
            (NodeKind::Symbol(name), TypeKind::Enum) => {
                if let Some(value) = self.autocast_symbol(name, param_ty) {
                    self.buffer.locate(arg);
                    self.buffer.put_i64(value);
                    return Ok(());
                }
            }
            (NodeKind::Number(lit), TypeKind::Integer(kind) | TypeKind::Float(kind))
                if anode.ty != param_ty =>
            {
                self.buffer.locate(arg);
                self.emit_number(&NumberLiteral {
                    kind,
                    value: lit.value,
                });
                return Ok(());
            }
            _ => {}
        }
        self.lower_value(arg)?;
        self.upcast(anode.ty, param_ty)
    }

    /// Post-call cleanup: drop a struct region hiding under the result,
    /// then honor the ambient flags.
    fn finish_call(&mut self, result_ty: TypeId, cleanup: u32) -> LowerResult<()> {
        let size = self.asize(result_ty);
        if cleanup > 0 {
            self.buffer.pop_from_offset(cleanup, size);
        }
        if !self.wants_value {
            self.pop_bytes(size);
        }
        Ok(())
    }

    fn merged_return_type(&self, def_id: DefId, block: Option<CompiledBlockId>) -> TypeId {
        let def = &self.program.defs[def_id];
        match block {
            Some(cb) => {
                let info = &self.program.blocks[self.ctx.blocks[cb].block];
                match info.break_type {
                    Some(bt) => self.env.merge(def.return_type, bt),
                    None => def.return_type,
                }
            }
            None => def.return_type,
        }
    }

    /*********************************** Yield **********************************/

    fn lower_yield(&mut self, node: NodeId, args: &[NodeId], has_splat: bool) -> LowerResult<()> {
        let program = self.program;
        let env = self.env;
        let node_ty = program.nodes[node].ty;
        if has_splat {
            return Err(self.err_unsupported("splat inside yield", node));
        }

        // a captured block is invoked through its proc value
        if let Some((offset, proc_ty)) = self.captured_block {
            self.buffer.locate(node);
            self.buffer.get_local(offset, 16);
            let params = env.proc_params(proc_ty);
            let mut args_bytesize = 0;
            for (&arg, &param_ty) in args.iter().zip(&params) {
                self.lower_call_arg(arg, param_ty)?;
                args_bytesize += self.asize(param_ty);
            }
            self.buffer.locate(node);
            self.buffer.proc_call(args_bytesize);
            self.upcast(env.proc_return(proc_ty), node_ty)?;
            return self.finish_call(node_ty, 0);
        }

        let cb = self
            .compiled_block
            .ok_or_else(|| self.err_unsupported("yield outside a def taking a block", node))?;
        let block_id = self.ctx.blocks[cb].block;
        let block = &program.blocks[block_id];

        let unpacks = args.len() == 1
            && block.args.len() >= 2
            && env.kind(program.nodes[args[0]].ty) == TypeKind::Tuple;
        if unpacks {
            // one tuple fans out across the block's parameters
            let tuple_ty = program.nodes[args[0]].ty;
            self.lower_value(args[0])?;
            let elements = env.tuple_types(tuple_ty);
            let shape = TupleUnpack {
                tuple_bytesize: self.asize(tuple_ty),
                elements: block
                    .args
                    .iter()
                    .enumerate()
                    .map(|(i, param)| {
                        (
                            env.tuple_offset(tuple_ty, i),
                            env.inner_size(elements[i]),
                            self.asize(param.ty),
                        )
                    })
                    .collect(),
            };
            let unpack = self.ctx.unpacks.push(shape);
            self.buffer.locate(node);
            self.buffer.unpack_tuple(unpack.as_u32());
        } else {
            for (&arg, param) in args.iter().zip(&block.args) {
                self.lower_call_arg(arg, param.ty)?;
            }
            // surplus yield values are evaluated and dropped
            for &arg in args.iter().skip(block.args.len()) {
                self.lower_discard(arg)?;
            }
        }

        self.buffer.locate(node);
        self.buffer.call_block(cb.as_u32());
        self.upcast(block.ty, node_ty)?;
        self.finish_call(node_ty, 0)
    }

    /**************************** Defs and blocks *******************************/

    /// Fetches or builds the compiled form of a def. Defs without an
    /// inlined block are cached per target; a blockful def is re-emitted
    /// for each call site.
    pub(crate) fn compile_def(
        &mut self,
        def_id: DefId,
        block: Option<CompiledBlockId>,
    ) -> LowerResult<CompiledDefId> {
        let program = self.program;
        let env = self.env;
        let def = &program.defs[def_id];

        if block.is_none() {
            if let Some(&cd) = self.ctx.def_cache.get(&def_id) {
                trace!("compiled-def cache hit for `{}`", def.name);
                return Ok(cd);
            }
        }
        if def.has_splat {
            return Err(LowerError::Unsupported {
                message: format!("def `{}` has a splat parameter", def.name),
                loc: Default::default(),
            });
        }
        debug!("lowering def `{}`", def.name);

        let mut frame = LocalFrame::new();
        if let Some(owner) = def.owner {
            let size = if env.is_struct(owner) && env.passed_by_value(owner) {
                8
            } else {
                env.aligned_size(owner)
            };
            frame.declare("self", owner, size);
        }
        let mut param_slots = Vec::with_capacity(def.params.len() + 1);
        if def.owner.is_some() {
            param_slots.push((0, frame.bytesize()));
        }
        for param in &def.params {
            let size = env.aligned_size(param.ty);
            let offset = frame.declare(&param.name, param.ty, size);
            param_slots.push((offset, size));
        }
        let captured_block = def.block_param.as_ref().map(|param| {
            let offset = frame.declare(&param.name, param.ty, env.aligned_size(param.ty));
            (offset, param.ty)
        });
        let args_bytesize = frame.bytesize();
        for (name, ty) in &def.vars {
            frame.declare(name, *ty, env.aligned_size(*ty));
        }

        let return_type = self.merged_return_type(def_id, block);
        let cd = self.ctx.reserve_def(
            def.name.clone(),
            Some(def_id),
            args_bytesize,
            env.aligned_size(return_type),
        );
        let cacheable = block.is_none();
        if cacheable {
            // cached before the body lowers, so recursion lands here
            self.ctx.def_cache.insert(def_id, cd);
        }

        let result = match def.body {
            DefBody::Expr(body) => {
                let mut inner = Lowerer::new(
                    self.program,
                    self.env,
                    &mut *self.ctx,
                    frame,
                    def.owner,
                    return_type,
                );
                inner.compiled_block = block;
                inner.captured_block = captured_block;
                lower_def_body(inner, body, return_type)
            }
            DefBody::Primitive(p) => {
                let inner = Lowerer::new(
                    self.program,
                    self.env,
                    &mut *self.ctx,
                    frame,
                    def.owner,
                    return_type,
                );
                lower_primitive_body(inner, def_id, p, &param_slots, return_type)
            }
            DefBody::LibFun { .. } => Err(LowerError::Unsupported {
                message: format!("lib fun `{}` has no lowered body", def.name),
                loc: Default::default(),
            }),
        };
        match result {
            Ok((buffer, finished_frame)) => {
                self.ctx.finish_def(cd, buffer, finished_frame);
                Ok(cd)
            }
            Err(e) => {
                if cacheable {
                    self.ctx.def_cache.remove(&def_id);
                }
                Err(e)
            }
        }
    }

    /// Pre-builds the block of a call: its locals extend the current frame
    /// one block level down, its body lowers into its own buffer.
    fn compile_block(
        &mut self,
        block_id: BlockId,
        target_def: DefId,
    ) -> LowerResult<CompiledBlockId> {
        let program = self.program;
        let env = self.env;
        let block = &program.blocks[block_id];
        if block.has_splat {
            return Err(LowerError::Unsupported {
                message: "block with a splat parameter".to_string(),
                loc: program.nodes[block.body].loc,
            });
        }
        let def = &program.defs[target_def];
        let break_type = match block.break_type {
            Some(bt) => env.merge(def.return_type, bt),
            None => def.return_type,
        };

        self.frame.push_block();
        let locals_start = self.frame.bytesize();
        let mut args_bytesize = 0;
        for param in &block.args {
            let size = env.aligned_size(param.ty);
            self.frame.declare(&param.name, param.ty, size);
            args_bytesize += size;
        }
        for (name, ty) in &block.vars {
            self.frame.declare(name, *ty, env.aligned_size(*ty));
        }
        let locals_end = self.frame.bytesize();
        let block_level = self.frame.block_level();

        let frame = core::mem::take(&mut self.frame);
        let mut inner = Lowerer::new(
            self.program,
            self.env,
            &mut *self.ctx,
            frame,
            self.self_type,
            self.return_type,
        );
        inner.block_scope = Some(BlockScope {
            block: block_id,
            break_type,
        });
        // yields inside the block body still target the enclosing def's
        // own block
        inner.compiled_block = self.compiled_block;
        inner.captured_block = self.captured_block;
        inner.lower_value(block.body)?;
        inner.upcast(program.nodes[block.body].ty, block.ty)?;
        inner.buffer.leave(env.aligned_size(block.ty));
        let (buffer, frame) = inner.into_parts();
        self.frame = frame;
        self.frame.pop_block();

        Ok(self.ctx.blocks.push(CompiledBlock {
            block: block_id,
            instructions: buffer,
            args_bytesize,
            locals_start,
            locals_end,
            block_level,
        }))
    }

    /// The synthetic nil-returning def wrapping a file's top-level body.
    fn compile_file(&mut self, body: NodeId, vars: &[(String, TypeId)]) -> LowerResult<CompiledDefId> {
        let env = self.env;
        let mut frame = LocalFrame::new();
        for (name, ty) in vars {
            frame.declare(name, *ty, env.aligned_size(*ty));
        }
        let cd = self.ctx.reserve_def("<file>", None, 0, 0);
        let mut inner = Lowerer::new(self.program, self.env, &mut *self.ctx, frame, None, env.nil());
        inner.lower_discard(body)?;
        inner.buffer.put_nil();
        inner.buffer.leave(0);
        let (buffer, frame) = inner.into_parts();
        self.ctx.finish_def(cd, buffer, frame);
        Ok(cd)
    }

    /**************************** Intrinsic bodies ******************************/

    fn lower_primitive_call(
        &mut self,
        node: NodeId,
        call: &CallData,
        def_id: DefId,
        p: Primitive,
    ) -> LowerResult<()> {
        let program = self.program;
        let env = self.env;
        let node_ty = program.nodes[node].ty;
        let def = &program.defs[def_id];

        match p {
            // metaclass receivers carry no runtime value
            Primitive::PointerMalloc => {
                if let Some(receiver) = call.receiver {
                    self.lower_discard(receiver)?;
                }
                self.lower_value(call.args[0])?;
                let element = env.pointer_element(node_ty);
                self.buffer.locate(node);
                self.buffer.pointer_malloc(env.inner_size(element));
            }
            Primitive::PointerNew => {
                if let Some(receiver) = call.receiver {
                    self.lower_discard(receiver)?;
                }
                // the address is already the pointer representation
                self.lower_value(call.args[0])?;
            }
            Primitive::Allocate => {
                if let Some(receiver) = call.receiver {
                    self.lower_discard(receiver)?;
                }
                self.buffer.locate(node);
                self.buffer
                    .allocate_class(env.instance_size(node_ty), env.runtime_id(node_ty));
            }
            Primitive::TupleIndexer => {
                let receiver = call.receiver
                    .ok_or_else(|| self.err_unsupported("tuple indexer without receiver", node))?;
                let rty = program.nodes[receiver].ty;
                let index = match &program.nodes[call.args[0]].kind {
                    NodeKind::Number(lit) => lit.as_i64() as usize,
                    _ => {
                        return Err(
                            self.err_unsupported("tuple index must be a literal number", node)
                        )
                    }
                };
                self.lower_value(receiver)?;
                let element = env.tuple_types(rty)[index];
                self.buffer.locate(node);
                self.buffer.tuple_element(
                    self.asize(rty),
                    env.tuple_offset(rty, index),
                    self.asize(element),
                );
                self.downcast(element, node_ty)?;
            }
            _ => {
                if let Some(receiver) = call.receiver {
                    self.lower_value(receiver)?;
                }
                for (i, &arg) in call.args.iter().enumerate() {
                    match def.params.get(i) {
                        Some(param) => self.lower_call_arg(arg, param.ty)?,
                        None => self.lower_value(arg)?,
                    }
                }
                self.buffer.locate(node);
                self.emit_intrinsic(def_id, p)?;
            }
        }
        if !self.wants_value {
            self.pop_bytes(self.asize(node_ty));
        }
        Ok(())
    }

    /// Emits the instruction(s) of an intrinsic whose operands are already
    /// on the stack.
    fn emit_intrinsic(&mut self, def_id: DefId, p: Primitive) -> LowerResult<()> {
        let program = self.program;
        let env = self.env;
        let def = &program.defs[def_id];
        match p {
            Primitive::Binary(op) => {
                let owner = def.owner.ok_or_else(|| LowerError::Unsupported {
                    message: "binary primitive without an owner".to_string(),
                    loc: Default::default(),
                })?;
                self.emit_binary(owner, op)
            }
            Primitive::Convert(to) => {
                let owner = def.owner.ok_or_else(|| LowerError::Unsupported {
                    message: "conversion primitive without an owner".to_string(),
                    loc: Default::default(),
                })?;
                self.emit_convert(owner, to);
                Ok(())
            }
            Primitive::PointerGet => {
                let element = env.pointer_element(def.owner.expect("pointer primitive owner"));
                self.buffer
                    .pointer_get(env.inner_size(element), self.asize(element));
                Ok(())
            }
            Primitive::PointerSet => {
                let element = env.pointer_element(def.owner.expect("pointer primitive owner"));
                self.buffer
                    .pointer_set(env.inner_size(element), self.asize(element));
                Ok(())
            }
            Primitive::PointerAdd => {
                let element = env.pointer_element(def.owner.expect("pointer primitive owner"));
                self.buffer.pointer_add(env.inner_size(element));
                Ok(())
            }
            Primitive::PointerAddress => Ok(()),
            Primitive::ProcCall => {
                let owner = def.owner.expect("proc_call owner");
                let args_bytesize = env
                    .proc_params(owner)
                    .iter()
                    .map(|&ty| env.aligned_size(ty))
                    .sum();
                self.buffer.proc_call(args_bytesize);
                Ok(())
            }
            Primitive::PointerMalloc
            | Primitive::PointerNew
            | Primitive::Allocate
            | Primitive::TupleIndexer => Err(LowerError::Unsupported {
                message: "primitive needs its literal call site".to_string(),
                loc: Default::default(),
            }),
        }
    }

    fn emit_binary(&mut self, owner: TypeId, op: BinaryOp) -> LowerResult<()> {
        let env = self.env;
        let numeric = match env.kind(owner) {
            TypeKind::Integer(kind) => kind,
            TypeKind::Float(kind) => kind,
            TypeKind::Enum => match env.kind(env.enum_base(owner)) {
                TypeKind::Integer(kind) => kind,
                _ => NumberKind::I64,
            },
            TypeKind::Bool | TypeKind::Char | TypeKind::Symbol => NumberKind::I64,
            _ => {
                return Err(LowerError::Unsupported {
                    message: "binary primitive on a non-numeric receiver".to_string(),
                    loc: Default::default(),
                })
            }
        };
        let b = &mut self.buffer;
        if numeric == NumberKind::F64 {
            match op {
                BinaryOp::Add => b.add_f64(),
                BinaryOp::Sub => b.sub_f64(),
                BinaryOp::Mul => b.mul_f64(),
                BinaryOp::Div => b.div_f64(),
                BinaryOp::Lt => b.lt_f64(),
                BinaryOp::Le => b.le_f64(),
                BinaryOp::Gt => b.gt_f64(),
                BinaryOp::Ge => b.ge_f64(),
                BinaryOp::Eq => b.eq_f64(),
                BinaryOp::Ne => b.ne_f64(),
                BinaryOp::Rem => {
                    return Err(LowerError::Unsupported {
                        message: "remainder on floats".to_string(),
                        loc: Default::default(),
                    })
                }
            }
        } else if numeric == NumberKind::F32 {
            match op {
                BinaryOp::Add => b.add_f32(),
                BinaryOp::Sub => b.sub_f32(),
                BinaryOp::Mul => b.mul_f32(),
                BinaryOp::Div => b.div_f32(),
                BinaryOp::Lt => b.lt_f32(),
                BinaryOp::Le => b.le_f32(),
                BinaryOp::Gt => b.gt_f32(),
                BinaryOp::Ge => b.ge_f32(),
                BinaryOp::Eq => b.eq_f32(),
                BinaryOp::Ne => b.ne_f32(),
                BinaryOp::Rem => {
                    return Err(LowerError::Unsupported {
                        message: "remainder on floats".to_string(),
                        loc: Default::default(),
                    })
                }
            }
        } else if numeric.is_unsigned_int() {
            match op {
                BinaryOp::Add => b.add_i64(),
                BinaryOp::Sub => b.sub_i64(),
                BinaryOp::Mul => b.mul_i64(),
                BinaryOp::Div => b.div_u64(),
                BinaryOp::Rem => b.rem_u64(),
                BinaryOp::Lt => b.lt_u64(),
                BinaryOp::Le => b.le_u64(),
                BinaryOp::Gt => b.gt_u64(),
                BinaryOp::Ge => b.ge_u64(),
                BinaryOp::Eq => b.eq_i64(),
                BinaryOp::Ne => b.ne_i64(),
            }
        } else {
            match op {
                BinaryOp::Add => b.add_i64(),
                BinaryOp::Sub => b.sub_i64(),
                BinaryOp::Mul => b.mul_i64(),
                BinaryOp::Div => b.div_i64(),
                BinaryOp::Rem => b.rem_i64(),
                BinaryOp::Lt => b.lt_i64(),
                BinaryOp::Le => b.le_i64(),
                BinaryOp::Gt => b.gt_i64(),
                BinaryOp::Ge => b.ge_i64(),
                BinaryOp::Eq => b.eq_i64(),
                BinaryOp::Ne => b.ne_i64(),
            }
        }
        Ok(())
    }

    fn emit_convert(&mut self, owner: TypeId, to: NumberKind) {
        let from = match self.env.kind(owner) {
            TypeKind::Integer(kind) | TypeKind::Float(kind) => kind,
            _ => NumberKind::I64,
        };
        let b = &mut self.buffer;
        match (from.is_float(), to.is_float()) {
            (false, true) => {
                if from.is_unsigned_int() {
                    b.u64_to_f64();
                } else {
                    b.i64_to_f64();
                }
                if to == NumberKind::F32 {
                    b.f64_to_f32();
                }
            }
            (true, false) => {
                if from == NumberKind::F32 {
                    b.f32_to_f64();
                }
                if to.is_unsigned_int() {
                    b.f64_to_u64();
                } else {
                    b.f64_to_i64();
                }
            }
            (true, true) => {
                if from == NumberKind::F32 && to == NumberKind::F64 {
                    b.f32_to_f64();
                } else if from == NumberKind::F64 && to == NumberKind::F32 {
                    b.f64_to_f32();
                }
            }
            (false, false) => {
                let bits = to.byte_width() * 8;
                if bits < 64 {
                    if to.is_unsigned_int() {
                        b.zero_extend(bits);
                    } else {
                        b.sign_extend(bits);
                    }
                }
            }
        }
    }

    /**************************** Runtime type tests ****************************/

    fn lower_is_a(&mut self, node: NodeId, receiver: NodeId, target: TypeId) -> LowerResult<()> {
        let program = self.program;
        let env = self.env;
        if !self.wants_value {
            return self.lower_discard(receiver);
        }
        let rty = program.nodes[receiver].ty;
        if !self.is_polymorphic(rty) {
            // statically decided; the receiver still runs for effect
            let truth = env.filter_by(rty, target) == Some(rty);
            self.lower_discard(receiver)?;
            self.buffer.locate(node);
            self.buffer.put_i64(i64::from(truth));
            return Ok(());
        }
        self.lower_value(receiver)?;
        self.buffer.locate(node);
        self.emit_runtime_type_test(rty, target)
    }

    /// Emits the test for a value of `value_ty` already on the stack,
    /// leaving a bool.
    pub(crate) fn emit_runtime_type_test(
        &mut self,
        value_ty: TypeId,
        target: TypeId,
    ) -> LowerResult<()> {
        let env = self.env;
        match env.kind(value_ty) {
            TypeKind::MixedUnion => {
                self.buffer
                    .union_is_a(self.asize(value_ty), env.runtime_id(target));
            }
            TypeKind::NilableReference => {
                if env.is_nil(target) {
                    self.buffer.pointer_is_null();
                } else if env.filter_by(value_ty, target).is_some() {
                    self.buffer.pointer_is_not_null();
                } else {
                    self.pop_bytes(8);
                    self.buffer.put_i64(0);
                }
            }
            TypeKind::NilableReferenceUnion => {
                if env.is_nil(target) {
                    self.buffer.pointer_is_null();
                } else {
                    self.buffer.reference_is_a(env.runtime_id(target));
                }
            }
            TypeKind::ReferenceUnion | TypeKind::Virtual { .. } | TypeKind::VirtualMetaclass => {
                self.buffer.reference_is_a(env.runtime_id(target));
            }
            _ => {
                self.pop_bytes(self.asize(value_ty));
                self.buffer.put_i64(i64::from(value_ty == target));
            }
        }
        Ok(())
    }

    fn lower_cast(
        &mut self,
        node: NodeId,
        receiver: NodeId,
        target: TypeId,
        nilable: bool,
    ) -> LowerResult<()> {
        let program = self.program;
        let env = self.env;
        let node_ty = program.nodes[node].ty;
        if !self.wants_value {
            return self.lower_discard(receiver);
        }
        let rty = program.nodes[receiver].ty;
        self.lower_value(receiver)?;

        if !self.is_polymorphic(rty) || env.filter_by(rty, target) == Some(rty) {
            // statically certain: adapt only
            match env.filter_by(rty, target) {
                Some(_) => {
                    self.upcast(rty, node_ty)?;
                }
                None => {
                    self.pop_bytes(self.asize(rty));
                    let msg = self.ctx.intern_string("cast failed");
                    self.buffer.locate(node);
                    self.buffer.unreachable(msg.as_u32());
                }
            }
            return Ok(());
        }

        let size = self.asize(rty);
        self.dup_bytes(size);
        self.buffer.locate(node);
        self.emit_runtime_type_test(rty, target)?;
        self.buffer.branch_if(0);
        let ok_loc = self.buffer.patch_location();

        if nilable {
            self.pop_bytes(size);
            self.buffer.put_nil();
            self.upcast(env.nil(), node_ty)?;
            self.buffer.jump(0);
            let done_loc = self.buffer.patch_location();
            self.buffer.patch_jump(ok_loc);
            self.downcast(rty, target)?;
            self.upcast(target, node_ty)?;
            self.buffer.patch_jump(done_loc);
        } else {
            let msg = self.ctx.intern_string("cast failed");
            self.buffer.unreachable(msg.as_u32());
            self.buffer.patch_jump(ok_loc);
            self.downcast(rty, node_ty)?;
        }
        Ok(())
    }

    /************************** Addresses and fields ****************************/

    fn lower_pointerof(&mut self, node: NodeId, target: NodeId) -> LowerResult<()> {
        let program = self.program;
        self.buffer.locate(node);
        match &program.nodes[target].kind {
            NodeKind::Var(name) => {
                let slot = self.resolve_var(name, target)?;
                self.buffer.pointerof_var(slot.offset);
                Ok(())
            }
            NodeKind::InstanceVar(name) => {
                let ivar = self.resolve_self_ivar(name, target)?;
                self.buffer.pointerof_ivar(ivar.offset);
                Ok(())
            }
            NodeKind::ClassVar(id) => {
                let slot = self.ensure_class_var(*id)?;
                self.emit_class_var_guard(slot);
                self.buffer.pointerof_class_var(slot.as_u32());
                Ok(())
            }
            _ => Err(self.err_unsupported("pointerof requires a variable", node)),
        }
    }

    fn lower_read_instance_var(
        &mut self,
        node: NodeId,
        receiver: NodeId,
        name: &str,
    ) -> LowerResult<()> {
        let program = self.program;
        let env = self.env;
        let node_ty = program.nodes[node].ty;
        let rty = program.nodes[receiver].ty;
        let ivar = env
            .instance_var(rty, name)
            .ok_or_else(|| self.err_unsupported("unknown instance variable", node))?;
        let field_size = self.asize(ivar.ty);

        if env.is_struct(rty) && env.passed_by_value(rty) {
            let cleanup = self.lower_call_receiver(receiver, rty)?;
            self.buffer.locate(node);
            self.buffer.get_ivar(ivar.offset, field_size);
            if cleanup > 0 {
                self.buffer.pop_from_offset(cleanup, field_size);
            }
        } else {
            self.lower_value(receiver)?;
            self.buffer.locate(node);
            self.buffer.get_ivar(ivar.offset, field_size);
        }
        self.downcast(ivar.ty, node_ty)?;
        if !self.wants_value {
            self.pop_bytes(self.asize(node_ty));
        }
        Ok(())
    }

    /// Zeros region plus pointer, for reads that can hand out their
    /// storage address directly.
    fn lower_struct_pointer(&mut self, node: NodeId) -> LowerResult<()> {
        let program = self.program;
        let env = self.env;
        let node_ty = program.nodes[node].ty;
        let size = self.asize(node_ty);
        match &program.nodes[node].kind {
            NodeKind::Var(name) if name == "self" => {
                self.push_zero_bytes(size);
                self.buffer.get_local(0, 8);
            }
            NodeKind::Var(name) => {
                let slot = self.resolve_var(name, node)?;
                self.push_zero_bytes(size);
                let extra = if env.kind(slot.ty) == TypeKind::MixedUnion {
                    8
                } else {
                    0
                };
                self.buffer.pointerof_var(slot.offset + extra);
            }
            NodeKind::InstanceVar(name) => {
                let ivar = self.resolve_self_ivar(name, node)?;
                self.push_zero_bytes(size);
                self.buffer.pointerof_ivar(ivar.offset);
            }
            NodeKind::ClassVar(id) => {
                let slot = self.ensure_class_var(*id)?;
                self.emit_class_var_guard(slot);
                self.push_zero_bytes(size);
                self.buffer.pointerof_class_var(slot.as_u32());
            }
            _ => unreachable!("lower_struct_pointer on a computing node"),
        }
        Ok(())
    }

    /*************************** Lazy-init tables *******************************/

    fn ensure_const(&mut self, id: crate::ast::ConstId) -> LowerResult<ConstSlot> {
        if let Some(slot) = self.ctx.const_slot(id) {
            return Ok(slot);
        }
        let decl = &self.program.consts[id];
        let size = self.asize(decl.ty);
        let init =
            self.compile_initializer(format!("{}:init", decl.name), decl.value, decl.ty)?;
        Ok(self.ctx.declare_const(id, init, size))
    }

    fn ensure_class_var(&mut self, id: crate::ast::ClassVarId) -> LowerResult<ClassVarSlot> {
        if let Some(slot) = self.ctx.class_var_slot(id) {
            return Ok(slot);
        }
        let decl = &self.program.class_vars[id];
        let size = self.asize(decl.ty);
        let init = match decl.initializer {
            Some(value) => Some(self.compile_initializer(
                format!("{}:init", decl.name),
                value,
                decl.ty,
            )?),
            None => None,
        };
        Ok(self.ctx.declare_class_var(id, init, size))
    }

    fn compile_initializer(
        &mut self,
        name: String,
        value: NodeId,
        ty: TypeId,
    ) -> LowerResult<CompiledDefId> {
        let size = self.asize(ty);
        let cd = self.ctx.reserve_def(name, None, 0, size);
        let mut inner = Lowerer::new(
            self.program,
            self.env,
            &mut *self.ctx,
            LocalFrame::new(),
            None,
            ty,
        );
        inner.lower_value(value)?;
        inner.upcast(self.program.nodes[value].ty, ty)?;
        inner.buffer.leave(size);
        let (buffer, frame) = inner.into_parts();
        self.ctx.finish_def(cd, buffer, frame);
        Ok(cd)
    }

    /// The read-site guard: run the initializer once, then fall through.
    fn emit_const_guard(&mut self, slot: ConstSlot) {
        let init = self.ctx.consts[slot].initializer;
        let size = self.ctx.consts[slot].bytesize - 1;
        self.buffer.const_initialized(slot.as_u32());
        self.buffer.branch_if(0);
        let done = self.buffer.patch_location();
        self.buffer.call(init.as_u32());
        self.buffer.set_const(slot.as_u32(), size);
        self.buffer.patch_jump(done);
    }

    fn emit_class_var_guard(&mut self, slot: ClassVarSlot) {
        let Some(init) = self.ctx.class_vars[slot].initializer else {
            return;
        };
        let size = self.ctx.class_vars[slot].bytesize - 1;
        self.buffer.class_var_initialized(slot.as_u32());
        self.buffer.branch_if(0);
        let done = self.buffer.patch_location();
        self.buffer.call(init.as_u32());
        self.buffer.set_class_var(slot.as_u32(), size);
        self.buffer.patch_jump(done);
    }

    /******************************** Utilities *********************************/

    /// Converts the top of the stack into a bool: only nil, false and null
    /// pointers are falsy.
    fn coerce_to_bool(&mut self, ty: TypeId) {
        match self.env.kind(ty) {
            TypeKind::Bool | TypeKind::NoReturn => {}
            TypeKind::Nil => self.buffer.put_i64(0),
            TypeKind::NilableReference | TypeKind::NilableReferenceUnion | TypeKind::Pointer => {
                self.buffer.pointer_is_not_null();
            }
            TypeKind::MixedUnion => self.buffer.union_to_bool(self.asize(ty)),
            _ => {
                self.pop_bytes(self.asize(ty));
                self.buffer.put_i64(1);
            }
        }
    }

    fn emit_number(&mut self, lit: &NumberLiteral) {
        match lit.kind {
            NumberKind::F64 => self.buffer.put_f64(lit.as_f64()),
            NumberKind::F32 => self.buffer.put_f32((lit.as_f64() as f32).to_bits()),
            _ => self.buffer.put_i64(lit.as_i64()),
        }
    }

    fn autocast_symbol(&self, name: &str, enum_ty: TypeId) -> Option<i64> {
        self.env
            .enum_members(enum_ty)
            .iter()
            .find(|(member, _)| underscored_eq(member, name))
            .map(|&(_, value)| value)
    }

    fn lower_value_or_nil(&mut self, value: Option<NodeId>, node: NodeId) -> LowerResult<()> {
        match value {
            Some(value) => self.lower_value(value),
            None => {
                self.buffer.locate(node);
                self.buffer.put_nil();
                Ok(())
            }
        }
    }

    pub(crate) fn is_polymorphic(&self, ty: TypeId) -> bool {
        matches!(
            self.env.kind(ty),
            TypeKind::MixedUnion
                | TypeKind::ReferenceUnion
                | TypeKind::NilableReference
                | TypeKind::NilableReferenceUnion
                | TypeKind::Virtual { .. }
                | TypeKind::VirtualMetaclass
        )
    }

    pub(crate) fn resolve_var(&self, name: &str, node: NodeId) -> LowerResult<VarSlot> {
        self.frame
            .resolve(name)
            .map(|slot| VarSlot {
                offset: slot.offset,
                ty: slot.ty,
            })
            .ok_or_else(|| LowerError::UnknownVariable {
                name: name.to_string(),
                loc: self.program.nodes[node].loc,
            })
    }

    pub(crate) fn resolve_self_ivar(&self, name: &str, node: NodeId) -> LowerResult<InstanceVar> {
        let sty = self
            .self_type
            .ok_or_else(|| self.err_unsupported("instance variable outside a method", node))?;
        self.env
            .instance_var(sty, name)
            .ok_or_else(|| self.err_unsupported("unknown instance variable", node))
    }

    fn with_flags<R>(
        &mut self,
        wants_value: bool,
        wants_struct_pointer: bool,
        f: impl FnOnce(&mut Self) -> R,
    ) -> R {
        let saved = (self.wants_value, self.wants_struct_pointer);
        self.wants_value = wants_value;
        self.wants_struct_pointer = wants_struct_pointer;
        let result = f(self);
        (self.wants_value, self.wants_struct_pointer) = saved;
        result
    }

    pub(crate) fn lower_value(&mut self, node: NodeId) -> LowerResult<()> {
        self.with_flags(true, false, |l| l.lower(node))
    }

    fn lower_discard(&mut self, node: NodeId) -> LowerResult<()> {
        self.with_flags(false, false, |l| l.lower(node))
    }

    pub(crate) fn asize(&self, ty: TypeId) -> u32 {
        self.env.aligned_size(ty)
    }

    pub(crate) fn pop_bytes(&mut self, n: u32) {
        if n > 0 {
            self.buffer.pop(n);
        }
    }

    pub(crate) fn push_zero_bytes(&mut self, n: u32) {
        if n > 0 {
            self.buffer.push_zeros(n);
        }
    }

    fn dup_bytes(&mut self, n: u32) {
        if n > 0 {
            self.buffer.dup(n);
        }
    }

    pub(crate) fn err_unsupported(&self, message: impl Into<String>, node: NodeId) -> LowerError {
        LowerError::Unsupported {
            message: message.into(),
            loc: self.program.nodes[node].loc,
        }
    }

    fn no_targets(&self, call: &CallData, node: NodeId) -> LowerError {
        LowerError::NoTargets {
            name: call.name.clone(),
            loc: self.program.nodes[node].loc,
        }
    }
}

/// Body of a user def: value, widen to the observable return type, leave.
fn lower_def_body<E: TypeEnvironment>(
    mut inner: Lowerer<'_, E>,
    body: NodeId,
    return_type: TypeId,
) -> LowerResult<(InstrBuffer, LocalFrame)> {
    inner.lower_value(body)?;
    inner.upcast(inner.program.nodes[body].ty, return_type)?;
    let size = inner.asize(return_type);
    inner.buffer.leave(size);
    Ok(inner.into_parts())
}

/// Wraps an intrinsic in a callable body, for dispatch trampolines that
/// mix primitive and user candidates.
fn lower_primitive_body<E: TypeEnvironment>(
    mut inner: Lowerer<'_, E>,
    def_id: DefId,
    p: Primitive,
    param_slots: &[(u32, u32)],
    return_type: TypeId,
) -> LowerResult<(InstrBuffer, LocalFrame)> {
    for &(offset, size) in param_slots {
        inner.buffer.get_local(offset, size);
    }
    inner.emit_intrinsic(def_id, p)?;
    let size = inner.asize(return_type);
    inner.buffer.leave(size);
    Ok(inner.into_parts())
}

/// Case-insensitive comparison that ignores underscores, for symbol to
/// enum-member autocasting.
fn underscored_eq(member: &str, symbol: &str) -> bool {
    let mut m = member.chars().filter(|c| *c != '_').map(|c| c.to_ascii_lowercase());
    let mut s = symbol.chars().filter(|c| *c != '_').map(|c| c.to_ascii_lowercase());
    loop {
        match (m.next(), s.next()) {
            (None, None) => return true,
            (Some(a), Some(b)) if a == b => {}
            _ => return false,
        }
    }
}
