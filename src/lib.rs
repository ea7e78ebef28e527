//! Lowering from the typed Beryl AST to interpreter bytecode.
//!
//! This crate is the code-generation core behind the Beryl REPL: it takes
//! the fully type-inferred AST the frontend produces and turns each
//! top-level expression into a flat instruction stream for the stack-based
//! interpreter, together with the frame metadata the interpreter needs to
//! run it.
//!
//! The main data structures are the instruction buffer with its
//! back-patcher ([`buffer::InstrBuffer`]), the per-def local-variable frame
//! ([`frame::LocalFrame`]), and the long-lived [`context::Context`] holding
//! everything call sites share: interned strings and symbols, lazily
//! initialized constant and class-variable slots, the compiled-def cache,
//! dispatch trampolines and foreign-function descriptors.
//!
//! The type system stays external: the pass reaches it only through the
//! [`environ::TypeEnvironment`] trait, which pins down the layout and
//! identity queries lowering depends on. [`environ::DummyTypeEnvironment`]
//! is a miniature implementation for tests and experiments.
//!
//! ```
//! use beryl_lower::ast::{NodeKind, NumberKind, NumberLiteral, Loc, Program};
//! use beryl_lower::context::Context;
//! use beryl_lower::environ::DummyTypeEnvironment;
//!
//! let mut env = DummyTypeEnvironment::new();
//! let i64t = env.int(NumberKind::I64);
//! let mut program = Program::new();
//! let root = program.node(
//!     NodeKind::Number(NumberLiteral::int(NumberKind::I64, 42)),
//!     i64t,
//!     Loc::new(1, 1),
//! );
//! let mut ctx = Context::new();
//! let main = beryl_lower::compile_program(&program, &env, &mut ctx, root).unwrap();
//! assert_eq!(ctx.defs[main].instructions.to_string(), "put_i64 42\nleave 8");
//! ```

pub mod ast;
pub mod buffer;
pub mod context;
pub mod environ;
pub mod ffi;
pub mod frame;
pub mod instr;

mod adapter;
mod dispatch;
mod lowerer;

use crate::ast::{Loc, NodeId, Program};
use crate::context::{CompiledDefId, Context};
use crate::environ::TypeEnvironment;
use crate::frame::LocalFrame;
use crate::lowerer::Lowerer;
use thiserror::Error;

/// Everything that can stop a compilation. There is no recovery: the first
/// error unwinds to the driver and the partial instruction buffer is
/// dropped; the shared context keeps only completed entries.
#[derive(Debug, Error)]
pub enum LowerError {
    /// A construct the pass cannot lower (or one the frontend should never
    /// have let through).
    #[error("{message} (at {loc})")]
    Unsupported { message: String, loc: Loc },

    /// The frontend produced a call with an empty candidate list.
    #[error("call `{name}` has no candidate targets (at {loc})")]
    NoTargets { name: String, loc: Loc },

    /// A name the frontend's var map never declared.
    #[error("unknown variable `{name}` (at {loc})")]
    UnknownVariable { name: String, loc: Loc },

    /// An upcast/downcast whose operand widths cannot be reconciled; a
    /// lowering bug, not a user error.
    #[error("cannot adapt a stack value of {from_bytes} bytes to {to_bytes} bytes")]
    WidthMismatch { from_bytes: u32, to_bytes: u32 },
}

pub type LowerResult<T> = Result<T, LowerError>;

/// Lowers one top-level expression (a REPL line or a whole file node) into
/// a synthetic zero-argument entry def and returns its handle.
///
/// The context accumulates across calls: constants stay initialized-once,
/// compiled defs are reused, and string identities persist for the session.
pub fn compile_program<E: TypeEnvironment>(
    program: &Program,
    env: &E,
    ctx: &mut Context,
    root: NodeId,
) -> LowerResult<CompiledDefId> {
    let root_ty = program.nodes[root].ty;
    let mut frame = LocalFrame::new();
    for (name, ty) in &program.toplevel_vars {
        frame.declare(name, *ty, env.aligned_size(*ty));
    }
    let cd = ctx.reserve_def("<main>", None, 0, env.aligned_size(root_ty));
    let mut lowerer = Lowerer::new(program, env, ctx, frame, None, root_ty);
    lowerer.lower_value(root)?;
    let size = lowerer.asize(root_ty);
    lowerer.buffer.leave(size);
    let (buffer, frame) = lowerer.into_parts();
    ctx.finish_def(cd, buffer, frame);
    Ok(cd)
}
