//! End-to-end lowering tests: a typed AST goes in, the disassembled
//! instruction stream comes out.

use beryl_lower::ast::{
    BinaryOp, BlockInfo, CallData, ClassVarDecl, ConstDecl, Def, DefBody, Loc, NodeId, NodeKind,
    NumberKind, NumberLiteral, Param, Primitive, Program,
};
use beryl_lower::compile_program;
use beryl_lower::context::{CompiledDefId, Context};
use beryl_lower::environ::{DummyTypeEnvironment, TypeEnvironment, TypeId};
use beryl_lower::ffi::FfiType;
use beryl_lower::instr::Opcode;

fn logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn loc() -> Loc {
    Loc::new(1, 1)
}

fn i32_lit(program: &mut Program, ty: TypeId, value: i64) -> NodeId {
    program.node(
        NodeKind::Number(NumberLiteral::int(NumberKind::I32, value)),
        ty,
        loc(),
    )
}

fn binary_def(owner: TypeId, name: &str, op: BinaryOp, ret: TypeId) -> Def {
    Def {
        name: name.to_string(),
        owner: Some(owner),
        params: vec![Param::new("other", owner)],
        vars: vec![],
        body: DefBody::Primitive(Primitive::Binary(op)),
        return_type: ret,
        yields: false,
        block_param: None,
        has_splat: false,
    }
}

fn call(
    program: &mut Program,
    receiver: Option<NodeId>,
    name: &str,
    args: Vec<NodeId>,
    targets: Vec<beryl_lower::ast::DefId>,
    ty: TypeId,
) -> NodeId {
    program.node(
        NodeKind::Call(CallData {
            receiver,
            name: name.to_string(),
            args,
            named_args: vec![],
            block: None,
            block_arg: None,
            target_defs: targets,
        }),
        ty,
        loc(),
    )
}

fn disas(ctx: &Context, cd: CompiledDefId) -> String {
    ctx.defs[cd].instructions.to_string()
}

#[track_caller]
fn assert_disas(ctx: &Context, cd: CompiledDefId, expected: &str) {
    assert_eq!(disas(ctx, cd), expected.trim());
}

#[test]
fn adds_two_literals() {
    logs();
    let mut env = DummyTypeEnvironment::new();
    let i32t = env.int(NumberKind::I32);
    let mut program = Program::new();
    let plus = program.def(binary_def(i32t, "+", BinaryOp::Add, i32t));
    let one = i32_lit(&mut program, i32t, 1);
    let two = i32_lit(&mut program, i32t, 2);
    let root = call(&mut program, Some(one), "+", vec![two], vec![plus], i32t);

    let mut ctx = Context::new();
    let main = compile_program(&program, &env, &mut ctx, root).unwrap();
    assert_disas(
        &ctx,
        main,
        r#"
put_i64 1
put_i64 2
add_i64
leave 8"#,
    );
}

#[test]
fn assigns_and_reads_a_local() {
    let mut env = DummyTypeEnvironment::new();
    let i32t = env.int(NumberKind::I32);
    let mut program = Program::new();
    program.toplevel_vars.push(("a".to_string(), i32t));
    let one = i32_lit(&mut program, i32t, 1);
    let target = program.node(NodeKind::Var("a".to_string()), i32t, loc());
    let assign = program.node(
        NodeKind::Assign {
            target,
            value: one,
        },
        i32t,
        loc(),
    );
    let read = program.node(NodeKind::Var("a".to_string()), i32t, loc());
    let root = program.node(NodeKind::Expressions(vec![assign, read]), i32t, loc());

    let mut ctx = Context::new();
    let main = compile_program(&program, &env, &mut ctx, root).unwrap();
    assert_disas(
        &ctx,
        main,
        r#"
put_i64 1
set_local 0, 8
get_local 0, 8
leave 8"#,
    );
}

#[test]
fn elides_the_dead_branch_of_a_literal_condition() {
    let mut env = DummyTypeEnvironment::new();
    let i32t = env.int(NumberKind::I32);
    let mut program = Program::new();
    let cond = program.node(NodeKind::Bool(true), env.bool_(), loc());
    let then_branch = i32_lit(&mut program, i32t, 10);
    let else_branch = i32_lit(&mut program, i32t, 20);
    let root = program.node(
        NodeKind::If {
            cond,
            then_branch,
            else_branch: Some(else_branch),
        },
        i32t,
        loc(),
    );

    let mut ctx = Context::new();
    let main = compile_program(&program, &env, &mut ctx, root).unwrap();
    assert_disas(
        &ctx,
        main,
        r#"
put_i64 10
leave 8"#,
    );
}

#[test]
fn branches_on_a_runtime_condition() {
    let mut env = DummyTypeEnvironment::new();
    let i32t = env.int(NumberKind::I32);
    let boolt = env.bool_();
    let mut program = Program::new();
    program.toplevel_vars.push(("b".to_string(), boolt));
    let cond = program.node(NodeKind::Var("b".to_string()), boolt, loc());
    let then_branch = i32_lit(&mut program, i32t, 10);
    let else_branch = i32_lit(&mut program, i32t, 20);
    let root = program.node(
        NodeKind::If {
            cond,
            then_branch,
            else_branch: Some(else_branch),
        },
        i32t,
        loc(),
    );

    let mut ctx = Context::new();
    let main = compile_program(&program, &env, &mut ctx, root).unwrap();
    assert_disas(
        &ctx,
        main,
        r#"
get_local 0, 8
branch_unless 28
put_i64 10
jump 37
put_i64 20
leave 8"#,
    );
}

#[test]
fn lowers_a_while_loop() {
    logs();
    let mut env = DummyTypeEnvironment::new();
    let i32t = env.int(NumberKind::I32);
    let boolt = env.bool_();
    let nil = env.nil();
    let mut program = Program::new();
    program.toplevel_vars.push(("i".to_string(), i32t));
    let plus = program.def(binary_def(i32t, "+", BinaryOp::Add, i32t));
    let lt = program.def(binary_def(i32t, "<", BinaryOp::Lt, boolt));

    let i_read = program.node(NodeKind::Var("i".to_string()), i32t, loc());
    let one = i32_lit(&mut program, i32t, 1);
    let inc = call(&mut program, Some(i_read), "+", vec![one], vec![plus], i32t);
    let i_target = program.node(NodeKind::Var("i".to_string()), i32t, loc());
    let body = program.node(
        NodeKind::Assign {
            target: i_target,
            value: inc,
        },
        i32t,
        loc(),
    );
    let i_cond = program.node(NodeKind::Var("i".to_string()), i32t, loc());
    let three = i32_lit(&mut program, i32t, 3);
    let cond = call(&mut program, Some(i_cond), "<", vec![three], vec![lt], boolt);
    let root = program.node(NodeKind::While { cond, body }, nil, loc());

    let mut ctx = Context::new();
    let main = compile_program(&program, &env, &mut ctx, root).unwrap();
    assert_disas(
        &ctx,
        main,
        r#"
jump 33
get_local 0, 8
put_i64 1
add_i64
set_local 0, 8
get_local 0, 8
put_i64 3
lt_i64
branch_if 5
put_nil
leave 0"#,
    );
}

#[test]
fn guards_constant_initialization_at_every_read() {
    let mut env = DummyTypeEnvironment::new();
    let i32t = env.int(NumberKind::I32);
    let mut program = Program::new();
    let plus = program.def(binary_def(i32t, "+", BinaryOp::Add, i32t));
    let one = i32_lit(&mut program, i32t, 1);
    let two = i32_lit(&mut program, i32t, 2);
    let init = call(&mut program, Some(one), "+", vec![two], vec![plus], i32t);
    let x = program.constant(ConstDecl {
        name: "X".to_string(),
        ty: i32t,
        value: init,
    });
    let read1 = program.node(NodeKind::Path(x), i32t, loc());
    let read2 = program.node(NodeKind::Path(x), i32t, loc());
    let root = call(&mut program, Some(read1), "+", vec![read2], vec![plus], i32t);

    let mut ctx = Context::new();
    let main = compile_program(&program, &env, &mut ctx, root).unwrap();
    // one slot, one initializer, a guard at each of the two reads
    assert_eq!(ctx.consts.len(), 1);
    assert_disas(
        &ctx,
        main,
        r#"
const_initialized 0
branch_if 24
call 1
set_const 0, 8
get_const 0, 8
const_initialized 0
branch_if 57
call 1
set_const 0, 8
get_const 0, 8
add_i64
leave 8"#,
    );
    let init_cd = ctx.consts[ctx.const_slot(x).unwrap()].initializer;
    assert_disas(
        &ctx,
        init_cd,
        r#"
put_i64 1
put_i64 2
add_i64
leave 8"#,
    );
}

#[test]
fn inlines_simple_literal_constants() {
    let mut env = DummyTypeEnvironment::new();
    let f64t = env.float(NumberKind::F64);
    let mut program = Program::new();
    let value = program.node(
        NodeKind::Number(NumberLiteral::float(NumberKind::F64, 3.25)),
        f64t,
        loc(),
    );
    let pi = program.constant(ConstDecl {
        name: "PI".to_string(),
        ty: f64t,
        value,
    });
    let root = program.node(NodeKind::Path(pi), f64t, loc());

    let mut ctx = Context::new();
    let main = compile_program(&program, &env, &mut ctx, root).unwrap();
    assert_eq!(ctx.consts.len(), 0);
    assert_disas(
        &ctx,
        main,
        r#"
put_f64 3.25
leave 8"#,
    );
}

#[test]
fn synthesizes_a_dispatch_def() {
    logs();
    let mut env = DummyTypeEnvironment::new();
    let i32t = env.int(NumberKind::I32);
    let string = env.reference_class(&[]);
    let union = env.mixed_union(&[i32t, string]);
    let mut program = Program::new();
    program.toplevel_vars.push(("x".to_string(), union));

    let body_i = i32_lit(&mut program, i32t, 1);
    let foo_i = program.def(Def {
        name: "foo".to_string(),
        owner: None,
        params: vec![Param::new("x", i32t)],
        vars: vec![],
        body: DefBody::Expr(body_i),
        return_type: i32t,
        yields: false,
        block_param: None,
        has_splat: false,
    });
    let body_s = i32_lit(&mut program, i32t, 2);
    let foo_s = program.def(Def {
        name: "foo".to_string(),
        owner: None,
        params: vec![Param::new("x", string)],
        vars: vec![],
        body: DefBody::Expr(body_s),
        return_type: i32t,
        yields: false,
        block_param: None,
        has_splat: false,
    });

    let arg1 = program.node(NodeKind::Var("x".to_string()), union, loc());
    let root1 = call(&mut program, None, "foo", vec![arg1], vec![foo_i, foo_s], i32t);
    let arg2 = program.node(NodeKind::Var("x".to_string()), union, loc());
    let root2 = call(&mut program, None, "foo", vec![arg2], vec![foo_i, foo_s], i32t);

    let mut ctx = Context::new();
    let main1 = compile_program(&program, &env, &mut ctx, root1).unwrap();
    // main, dispatch, and one compiled def per candidate
    assert_eq!(ctx.defs.len(), 4);
    assert_disas(
        &ctx,
        main1,
        r#"
get_local 0, 16
call 1
leave 8"#,
    );

    let id32 = env.runtime_id(i32t);
    let dispatch = CompiledDefId::from_u32(1);
    assert_eq!(ctx.defs[dispatch].name, "foo:dispatch");
    assert_eq!(
        disas(&ctx, dispatch),
        format!(
            r#"
get_local 0, 16
union_is_a 16, {id32}
branch_unless 51
get_local 0, 16
remove_from_union 16, 8
call 2
leave 8
get_local 0, 16
remove_from_union 16, 8
call 3
leave 8"#
        )
        .trim()
    );

    // a second call site reuses the cached trampoline
    let _main2 = compile_program(&program, &env, &mut ctx, root2).unwrap();
    assert_eq!(ctx.defs.len(), 5);
}

#[test]
fn reuses_compiled_defs_without_blocks() {
    let mut env = DummyTypeEnvironment::new();
    let i32t = env.int(NumberKind::I32);
    let mut program = Program::new();
    let body = i32_lit(&mut program, i32t, 1);
    let bar = program.def(Def {
        name: "bar".to_string(),
        owner: None,
        params: vec![],
        vars: vec![],
        body: DefBody::Expr(body),
        return_type: i32t,
        yields: false,
        block_param: None,
        has_splat: false,
    });
    let call1 = call(&mut program, None, "bar", vec![], vec![bar], i32t);
    let call2 = call(&mut program, None, "bar", vec![], vec![bar], i32t);
    let root = program.node(NodeKind::Expressions(vec![call1, call2]), i32t, loc());

    let mut ctx = Context::new();
    let main = compile_program(&program, &env, &mut ctx, root).unwrap();
    assert_eq!(ctx.defs.len(), 2);
    assert_disas(
        &ctx,
        main,
        r#"
call 1
pop 8
call 1
leave 8"#,
    );
}

#[test]
fn respecializes_defs_with_blocks() {
    let mut env = DummyTypeEnvironment::new();
    let i32t = env.int(NumberKind::I32);
    let mut program = Program::new();

    let block_body1 = i32_lit(&mut program, i32t, 42);
    let block1 = program.block(BlockInfo {
        args: vec![],
        vars: vec![],
        body: block_body1,
        ty: i32t,
        break_type: None,
        has_splat: false,
    });
    let block_body2 = i32_lit(&mut program, i32t, 42);
    let block2 = program.block(BlockInfo {
        args: vec![],
        vars: vec![],
        body: block_body2,
        ty: i32t,
        break_type: None,
        has_splat: false,
    });

    let yield_node = program.node(
        NodeKind::Yield {
            args: vec![],
            has_splat: false,
        },
        i32t,
        loc(),
    );
    let each = program.def(Def {
        name: "each".to_string(),
        owner: None,
        params: vec![],
        vars: vec![],
        body: DefBody::Expr(yield_node),
        return_type: i32t,
        yields: true,
        block_param: None,
        has_splat: false,
    });

    let mut call_with_block = |program: &mut Program, block| {
        program.node(
            NodeKind::Call(CallData {
                receiver: None,
                name: "each".to_string(),
                args: vec![],
                named_args: vec![],
                block: Some(block),
                block_arg: None,
                target_defs: vec![each],
            }),
            i32t,
            loc(),
        )
    };
    let call1 = call_with_block(&mut program, block1);
    let call2 = call_with_block(&mut program, block2);
    let root = program.node(NodeKind::Expressions(vec![call1, call2]), i32t, loc());

    let mut ctx = Context::new();
    let main = compile_program(&program, &env, &mut ctx, root).unwrap();
    // the block is inlined, so each call site owns a fresh specialization
    assert_eq!(ctx.defs.len(), 3);
    assert_eq!(ctx.blocks.len(), 2);
    assert_disas(
        &ctx,
        main,
        r#"
call_with_block 1
pop 8
call_with_block 2
leave 8"#,
    );
    assert_disas(
        &ctx,
        CompiledDefId::from_u32(1),
        r#"
call_block 0
leave 8"#,
    );
    assert_eq!(
        ctx.blocks[beryl_lower::context::CompiledBlockId::from_u32(0)]
            .instructions
            .to_string(),
        "put_i64 42\nleave 8"
    );
}

#[test]
fn merges_the_block_break_type_at_leave() {
    let mut env = DummyTypeEnvironment::new();
    let i32t = env.int(NumberKind::I32);
    let nil = env.nil();
    let union = env.mixed_union(&[nil, i32t]);
    let no_return = env.no_return();
    let mut program = Program::new();

    let five = i32_lit(&mut program, i32t, 5);
    let brk = program.node(NodeKind::Break(Some(five)), no_return, loc());
    let block = program.block(BlockInfo {
        args: vec![],
        vars: vec![],
        body: brk,
        ty: nil,
        break_type: Some(i32t),
        has_splat: false,
    });
    let yield_node = program.node(
        NodeKind::Yield {
            args: vec![],
            has_splat: false,
        },
        nil,
        loc(),
    );
    let each = program.def(Def {
        name: "each".to_string(),
        owner: None,
        params: vec![],
        vars: vec![],
        body: DefBody::Expr(yield_node),
        return_type: nil,
        yields: true,
        block_param: None,
        has_splat: false,
    });
    let root = program.node(
        NodeKind::Call(CallData {
            receiver: None,
            name: "each".to_string(),
            args: vec![],
            named_args: vec![],
            block: Some(block),
            block_arg: None,
            target_defs: vec![each],
        }),
        union,
        loc(),
    );

    let mut ctx = Context::new();
    let main = compile_program(&program, &env, &mut ctx, root).unwrap();
    let id32 = env.runtime_id(i32t);
    let id_nil = env.runtime_id(nil);
    // break carries its value out at the merged width
    assert_eq!(
        ctx.blocks[beryl_lower::context::CompiledBlockId::from_u32(0)]
            .instructions
            .to_string(),
        format!("put_i64 5\nput_in_union {id32}, 8, 16\nbreak_block 16\nleave 0")
    );
    // and every leave of the yielding def is widened the same way
    assert_eq!(
        disas(&ctx, CompiledDefId::from_u32(1)),
        format!("call_block 0\nput_in_union {id_nil}, 0, 16\nleave 16")
    );
    assert_disas(
        &ctx,
        main,
        r#"
call_with_block 1
leave 16"#,
    );
}

#[test]
fn returns_from_inside_a_block_with_leave_def() {
    let mut env = DummyTypeEnvironment::new();
    let i32t = env.int(NumberKind::I32);
    let nil = env.nil();
    let no_return = env.no_return();
    let mut program = Program::new();

    let seven = i32_lit(&mut program, i32t, 7);
    let ret = program.node(NodeKind::Return(Some(seven)), no_return, loc());
    let block = program.block(BlockInfo {
        args: vec![],
        vars: vec![],
        body: ret,
        ty: nil,
        break_type: None,
        has_splat: false,
    });
    let nine = i32_lit(&mut program, i32t, 9);
    let each = program.def(Def {
        name: "each".to_string(),
        owner: None,
        params: vec![],
        vars: vec![],
        body: DefBody::Expr(nine),
        return_type: i32t,
        yields: true,
        block_param: None,
        has_splat: false,
    });
    let root = program.node(
        NodeKind::Call(CallData {
            receiver: None,
            name: "each".to_string(),
            args: vec![],
            named_args: vec![],
            block: Some(block),
            block_arg: None,
            target_defs: vec![each],
        }),
        i32t,
        loc(),
    );

    let mut ctx = Context::new();
    let _main = compile_program(&program, &env, &mut ctx, root).unwrap();
    assert_eq!(
        ctx.blocks[beryl_lower::context::CompiledBlockId::from_u32(0)]
            .instructions
            .to_string(),
        "put_i64 7\nleave_def 8\nleave 0"
    );
}

#[test]
fn round_trips_a_value_through_a_mixed_union() {
    let mut env = DummyTypeEnvironment::new();
    let i32t = env.int(NumberKind::I32);
    let nil = env.nil();
    let union = env.mixed_union(&[nil, i32t]);
    let mut program = Program::new();
    program.toplevel_vars.push(("x".to_string(), union));

    let one = i32_lit(&mut program, i32t, 1);
    let target = program.node(NodeKind::Var("x".to_string()), union, loc());
    let assign = program.node(
        NodeKind::Assign {
            target,
            value: one,
        },
        i32t,
        loc(),
    );
    let read = program.node(NodeKind::Var("x".to_string()), union, loc());
    let cast = program.node(
        NodeKind::Cast {
            receiver: read,
            target: i32t,
        },
        i32t,
        loc(),
    );
    let root = program.node(NodeKind::Expressions(vec![assign, cast]), i32t, loc());

    let mut ctx = Context::new();
    let main = compile_program(&program, &env, &mut ctx, root).unwrap();
    let id32 = env.runtime_id(i32t);
    assert_eq!(
        disas(&ctx, main),
        format!(
            r#"
put_i64 1
put_in_union {id32}, 8, 16
set_local 0, 16
get_local 0, 16
dup 16
union_is_a 16, {id32}
branch_if 64
unreachable 0
remove_from_union 16, 8
leave 8"#
        )
        .trim()
    );
}

#[test]
fn reads_tuple_elements_in_layout_order() {
    let mut env = DummyTypeEnvironment::new();
    let i32t = env.int(NumberKind::I32);
    let boolt = env.bool_();
    let tuple = env.tuple_of(&[i32t, boolt]);
    let mut program = Program::new();
    program.toplevel_vars.push(("t".to_string(), tuple));

    let one = i32_lit(&mut program, i32t, 1);
    let yes = program.node(NodeKind::Bool(true), boolt, loc());
    let literal = program.node(NodeKind::Tuple(vec![one, yes]), tuple, loc());
    let target = program.node(NodeKind::Var("t".to_string()), tuple, loc());
    let assign = program.node(
        NodeKind::Assign {
            target,
            value: literal,
        },
        tuple,
        loc(),
    );

    let indexer_i = program.def(Def {
        name: "[]".to_string(),
        owner: Some(tuple),
        params: vec![Param::new("index", i32t)],
        vars: vec![],
        body: DefBody::Primitive(Primitive::TupleIndexer),
        return_type: i32t,
        yields: false,
        block_param: None,
        has_splat: false,
    });
    let indexer_b = program.def(Def {
        name: "[]".to_string(),
        owner: Some(tuple),
        params: vec![Param::new("index", i32t)],
        vars: vec![],
        body: DefBody::Primitive(Primitive::TupleIndexer),
        return_type: boolt,
        yields: false,
        block_param: None,
        has_splat: false,
    });

    let recv0 = program.node(NodeKind::Var("t".to_string()), tuple, loc());
    let idx0 = i32_lit(&mut program, i32t, 0);
    let read0 = call(&mut program, Some(recv0), "[]", vec![idx0], vec![indexer_i], i32t);
    let recv1 = program.node(NodeKind::Var("t".to_string()), tuple, loc());
    let idx1 = i32_lit(&mut program, i32t, 1);
    let read1 = call(&mut program, Some(recv1), "[]", vec![idx1], vec![indexer_b], boolt);
    let root = program.node(
        NodeKind::Expressions(vec![assign, read0, read1]),
        boolt,
        loc(),
    );

    let mut ctx = Context::new();
    let main = compile_program(&program, &env, &mut ctx, root).unwrap();
    assert_disas(
        &ctx,
        main,
        r#"
put_i64 1
pop 4
put_i64 1
pop 4
set_local 0, 8
get_local 0, 8
tuple_element 8, 0, 8
pop 8
get_local 0, 8
tuple_element 8, 4, 8
leave 8"#,
    );
}

#[test]
fn takes_a_struct_receiver_by_pointer() {
    logs();
    let mut env = DummyTypeEnvironment::new();
    let i32t = env.int(NumberKind::I32);
    let point = env.value_struct(&[("x", i32t), ("y", i32t)]);
    let mut program = Program::new();
    program.toplevel_vars.push(("p".to_string(), point));

    let ivar_read = program.node(NodeKind::InstanceVar("x".to_string()), i32t, loc());
    let getx = program.def(Def {
        name: "x".to_string(),
        owner: Some(point),
        params: vec![],
        vars: vec![],
        body: DefBody::Expr(ivar_read),
        return_type: i32t,
        yields: false,
        block_param: None,
        has_splat: false,
    });
    let recv = program.node(NodeKind::Var("p".to_string()), point, loc());
    let root = call(&mut program, Some(recv), "x", vec![], vec![getx], i32t);

    let mut ctx = Context::new();
    let main = compile_program(&program, &env, &mut ctx, root).unwrap();
    // a variable receiver hands out its own storage address
    assert_disas(
        &ctx,
        main,
        r#"
pointerof_var 0
call 1
leave 8"#,
    );
    assert_disas(
        &ctx,
        CompiledDefId::from_u32(1),
        r#"
get_self_ivar 0, 8
leave 8"#,
    );
}

#[test]
fn spills_a_computed_struct_receiver_and_pops_it_after_the_call() {
    let mut env = DummyTypeEnvironment::new();
    let i32t = env.int(NumberKind::I32);
    let point = env.value_struct(&[("x", i32t), ("y", i32t)]);
    let mut program = Program::new();
    program.toplevel_vars.push(("p".to_string(), point));

    let ivar_read = program.node(NodeKind::InstanceVar("x".to_string()), i32t, loc());
    let getx = program.def(Def {
        name: "x".to_string(),
        owner: Some(point),
        params: vec![],
        vars: vec![],
        body: DefBody::Expr(ivar_read),
        return_type: i32t,
        yields: false,
        block_param: None,
        has_splat: false,
    });
    let param_read = program.node(NodeKind::Var("q".to_string()), point, loc());
    let make = program.def(Def {
        name: "make".to_string(),
        owner: None,
        params: vec![Param::new("q", point)],
        vars: vec![],
        body: DefBody::Expr(param_read),
        return_type: point,
        yields: false,
        block_param: None,
        has_splat: false,
    });
    let arg = program.node(NodeKind::Var("p".to_string()), point, loc());
    let made = call(&mut program, None, "make", vec![arg], vec![make], point);
    let root = call(&mut program, Some(made), "x", vec![], vec![getx], i32t);

    let mut ctx = Context::new();
    let main = compile_program(&program, &env, &mut ctx, root).unwrap();
    assert_disas(
        &ctx,
        main,
        r#"
get_local 0, 8
call 2
put_stack_top_pointer 8
call 1
pop_from_offset 8, 8
leave 8"#,
    );
}

#[test]
fn tests_nilable_references_by_null_check() {
    let mut env = DummyTypeEnvironment::new();
    let string = env.reference_class(&[]);
    let nilable = env.nilable(string);
    let mut program = Program::new();
    program.toplevel_vars.push(("s".to_string(), nilable));

    let read = program.node(NodeKind::Var("s".to_string()), nilable, loc());
    let root = program.node(
        NodeKind::IsA {
            receiver: read,
            target: string,
            nil_check: false,
        },
        env.bool_(),
        loc(),
    );

    let mut ctx = Context::new();
    let main = compile_program(&program, &env, &mut ctx, root).unwrap();
    assert_disas(
        &ctx,
        main,
        r#"
get_local 0, 8
pointer_is_not_null
leave 8"#,
    );
}

#[test]
fn serializes_lib_call_arguments() {
    let mut env = DummyTypeEnvironment::new();
    let f64t = env.float(NumberKind::F64);
    let lib = env.lib_type();
    let mut program = Program::new();

    let abs = program.def(Def {
        name: "fabs".to_string(),
        owner: Some(lib),
        params: vec![Param::new("x", f64t)],
        vars: vec![],
        body: DefBody::LibFun { variadic: false },
        return_type: f64t,
        yields: false,
        block_param: None,
        has_splat: false,
    });
    let lib_ref = program.node(NodeKind::LibDef, lib, loc());
    let arg = program.node(
        NodeKind::Number(NumberLiteral::float(NumberKind::F64, 3.25)),
        f64t,
        loc(),
    );
    let root = call(&mut program, Some(lib_ref), "fabs", vec![arg], vec![abs], f64t);

    let mut ctx = Context::new();
    let main = compile_program(&program, &env, &mut ctx, root).unwrap();
    assert_disas(
        &ctx,
        main,
        r#"
put_f64 3.25
lib_call 0
leave 8"#,
    );
    let fun = &ctx.lib_funs[beryl_lower::context::LibFunId::from_u32(0)];
    assert_eq!(fun.name, "fabs");
    assert_eq!(fun.arg_types, vec![FfiType::Float64]);
    assert_eq!(fun.return_type, FfiType::Float64);
    assert!(!fun.variadic);
}

#[test]
fn autocasts_symbols_to_enum_members() {
    let mut env = DummyTypeEnvironment::new();
    let i32t = env.int(NumberKind::I32);
    let nil = env.nil();
    let color = env.enum_type(i32t, &[("Red", 0), ("Green", 1)]);
    let mut program = Program::new();

    let body = program.node(NodeKind::Nil, nil, loc());
    let paint = program.def(Def {
        name: "paint".to_string(),
        owner: None,
        params: vec![Param::new("c", color)],
        vars: vec![],
        body: DefBody::Expr(body),
        return_type: nil,
        yields: false,
        block_param: None,
        has_splat: false,
    });
    let arg = program.node(NodeKind::Symbol("green".to_string()), color, loc());
    let root = call(&mut program, None, "paint", vec![arg], vec![paint], nil);

    let mut ctx = Context::new();
    let main = compile_program(&program, &env, &mut ctx, root).unwrap();
    assert_disas(
        &ctx,
        main,
        r#"
put_i64 1
call 1
leave 0"#,
    );
}

#[test]
fn jumps_land_inside_the_buffer() {
    let mut env = DummyTypeEnvironment::new();
    let i32t = env.int(NumberKind::I32);
    let boolt = env.bool_();
    let nil = env.nil();
    let mut program = Program::new();
    program.toplevel_vars.push(("i".to_string(), i32t));
    let plus = program.def(binary_def(i32t, "+", BinaryOp::Add, i32t));
    let lt = program.def(binary_def(i32t, "<", BinaryOp::Lt, boolt));

    let i_read = program.node(NodeKind::Var("i".to_string()), i32t, loc());
    let one = i32_lit(&mut program, i32t, 1);
    let inc = call(&mut program, Some(i_read), "+", vec![one], vec![plus], i32t);
    let i_target = program.node(NodeKind::Var("i".to_string()), i32t, loc());
    let body = program.node(
        NodeKind::Assign {
            target: i_target,
            value: inc,
        },
        i32t,
        loc(),
    );
    let i_cond = program.node(NodeKind::Var("i".to_string()), i32t, loc());
    let three = i32_lit(&mut program, i32t, 3);
    let cond = call(&mut program, Some(i_cond), "<", vec![three], vec![lt], boolt);
    let root = program.node(NodeKind::While { cond, body }, nil, loc());

    let mut ctx = Context::new();
    let main = compile_program(&program, &env, &mut ctx, root).unwrap();
    let buffer = &ctx.defs[main].instructions;
    let len = u64::from(buffer.here());
    for instr in buffer.instructions() {
        if matches!(
            instr.op,
            Opcode::Jump | Opcode::BranchIf | Opcode::BranchUnless
        ) {
            assert!(instr.operands[0] <= len, "{instr} escapes the buffer");
        }
    }
}

#[test]
fn class_vars_guard_reads_and_writes() {
    let mut env = DummyTypeEnvironment::new();
    let i32t = env.int(NumberKind::I32);
    let point = env.value_struct(&[("x", i32t)]);
    let mut program = Program::new();

    let zero = i32_lit(&mut program, i32t, 0);
    let plus = program.def(binary_def(i32t, "+", BinaryOp::Add, i32t));
    let one = i32_lit(&mut program, i32t, 1);
    let init = call(&mut program, Some(zero), "+", vec![one], vec![plus], i32t);
    let count = program.class_var(ClassVarDecl {
        name: "@@count".to_string(),
        ty: i32t,
        initializer: Some(init),
    });

    // the read happens inside a method, where class vars are visible
    let read = program.node(NodeKind::ClassVar(count), i32t, loc());
    let getter = program.def(Def {
        name: "count".to_string(),
        owner: Some(point),
        params: vec![],
        vars: vec![],
        body: DefBody::Expr(read),
        return_type: i32t,
        yields: false,
        block_param: None,
        has_splat: false,
    });
    let recv = program.node(NodeKind::Var("p".to_string()), point, loc());
    program.toplevel_vars.push(("p".to_string(), point));
    let root = call(&mut program, Some(recv), "count", vec![], vec![getter], i32t);

    let mut ctx = Context::new();
    let _main = compile_program(&program, &env, &mut ctx, root).unwrap();
    assert_eq!(ctx.class_vars.len(), 1);
    assert_disas(
        &ctx,
        CompiledDefId::from_u32(1),
        r#"
class_var_initialized 0
branch_if 24
call 2
set_class_var 0, 8
get_class_var 0, 8
leave 8"#,
    );
}
