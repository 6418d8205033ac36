// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! End-to-end tests of compiled methods against the interpreter.

use std::sync::Arc;

use hyperdrive_jit::{CompileOptions, IterationStrategy, Jit, Outcome, StackStrategy};
use hyperdrive_vm::iseq::{CatchKind, Instruction, Iseq, IseqBuilder, Literal};
use hyperdrive_vm::runtime::{MethodState, Runtime, RuntimeConfig};
use hyperdrive_vm::{RuntimeError, Value};

fn int(n: i64) -> Value {
    Value::fixnum(n).unwrap()
}

/// A runtime that compiles every method as soon as it is defined.
fn compiling(options: CompileOptions, methods: &[Iseq]) -> (Runtime, Arc<Jit>) {
    compiling_with(RuntimeConfig::default(), options, methods)
}

fn compiling_with(config: RuntimeConfig, options: CompileOptions, methods: &[Iseq]) -> (Runtime, Arc<Jit>) {
    let mut rt = Runtime::new(config);
    let options = CompileOptions {
        precompile: true,
        ..options
    };
    let jit = Jit::new(options).install(&mut rt);
    for iseq in methods {
        rt.define_method("Object", iseq.clone()).unwrap();
    }
    (rt, jit)
}

fn interpreting(methods: &[Iseq]) -> Runtime {
    let mut rt = Runtime::new(RuntimeConfig::default());
    for iseq in methods {
        rt.define_method("Object", iseq.clone()).unwrap();
    }
    rt
}

fn state(rt: &Runtime, name: &str) -> MethodState {
    rt.find_iseq_method("Object", name).unwrap().state()
}

fn assert_compiled(rt: &Runtime, name: &str) {
    let state = state(rt, name);
    assert!(matches!(state, MethodState::Compiled(_)), "`{}` is {:?}", name, state);
}

/// Calls `name` and renders the result, or the error, as a string.
fn call(rt: &mut Runtime, name: &str, args: &[Value]) -> String {
    let main = rt.main_object();
    match rt.call_method(main, name, args) {
        Ok(value) => rt.inspect(value),
        Err(err) => err.to_string(),
    }
}

/// Asserts that compiled and interpreted runs agree, returning the result.
fn agree(options: CompileOptions, methods: &[Iseq], name: &str, args: &[Value]) -> String {
    let mut interpreted = interpreting(methods);
    let expected = call(&mut interpreted, name, args);
    let (mut rt, _) = compiling(options, methods);
    assert_compiled(&rt, name);
    let actual = call(&mut rt, name, args);
    assert_eq!(actual, expected, "`{}` with {:?}", name, options);
    assert_eq!(rt.thread.tag_head, None);
    assert_eq!(rt.thread.sp, 0);
    actual
}

fn stack_strategies() -> [CompileOptions; 3] {
    [StackStrategy::Static, StackStrategy::Dynamic, StackStrategy::Auto].map(|stack| CompileOptions {
        stack,
        ..Default::default()
    })
}

// ============================================================================
// Programs
// ============================================================================

fn fib() -> Iseq {
    let mut b = IseqBuilder::method("fib");
    b.required("n");
    let recurse = b.label();
    b.getlocal("n").int(2).op(Instruction::OptLt).branchunless(recurse);
    b.getlocal("n").leave();
    b.place(recurse);
    b.putself().getlocal("n").int(1).op(Instruction::OptMinus).fcall("fib", 1);
    b.putself().getlocal("n").int(2).op(Instruction::OptMinus).fcall("fib", 1);
    b.op(Instruction::OptPlus).leave();
    b.build().unwrap()
}

/// `begin; raise "boom"; rescue; 42; end`
fn rescuer() -> Iseq {
    let mut b = IseqBuilder::method("rescuer");
    let (start, end, handler, cont) = (b.label(), b.label(), b.label(), b.label());
    b.place(start);
    b.putself().putstring("boom").fcall("raise", 1);
    b.place(end);
    b.jump(cont);
    b.place(handler);
    b.set_depth(1);
    b.pop().int(42);
    b.place(cont);
    b.leave();
    b.rescue(start, end, handler, cont, 0);
    b.build().unwrap()
}

/// `[1, 2, 3].each { break 99 }`
fn breaker() -> Iseq {
    let mut blk = IseqBuilder::block("block in breaker");
    blk.int(99).throw(2);
    let blk = blk.build().unwrap();

    let mut b = IseqBuilder::method("breaker");
    b.duparray(vec![Literal::Int(1), Literal::Int(2), Literal::Int(3)]);
    b.send_with_block("each", 0, blk).leave();
    b.build().unwrap()
}

/// `def f(n) = n < 2 ? 1 : f(n - 2) + f(n - 1)`
fn f() -> Iseq {
    let mut b = IseqBuilder::method("f");
    b.required("n");
    let recurse = b.label();
    b.getlocal("n").int(2).op(Instruction::OptLt).branchunless(recurse);
    b.int(1).leave();
    b.place(recurse);
    b.putself().getlocal("n").int(2).op(Instruction::OptMinus).fcall("f", 1);
    b.putself().getlocal("n").int(1).op(Instruction::OptMinus).fcall("f", 1);
    b.op(Instruction::OptPlus).leave();
    b.build().unwrap()
}

/// `[1, 2, 3].each { |x| break 99 if x == 2 }`
fn conditional_breaker() -> Iseq {
    let mut blk = IseqBuilder::block("block in conditional_breaker");
    blk.required("x");
    let skip = blk.label();
    blk.getlocal("x").int(2).op(Instruction::OptEq).branchunless(skip);
    blk.int(99).throw(2);
    blk.place(skip);
    blk.putnil().leave();
    let blk = blk.build().unwrap();

    let mut b = IseqBuilder::method("conditional_breaker");
    b.duparray(vec![Literal::Int(1), Literal::Int(2), Literal::Int(3)]);
    b.send_with_block("each", 0, blk).leave();
    b.build().unwrap()
}

/// `x = 5; [1, 2].each { |x| }; x`
fn shadower() -> Iseq {
    let mut blk = IseqBuilder::block("block in shadower");
    blk.required("x");
    blk.putnil().leave();
    let blk = blk.build().unwrap();

    let mut b = IseqBuilder::method("shadower");
    b.local("x");
    b.int(5).setlocal("x");
    b.duparray(vec![Literal::Int(1), Literal::Int(2)]);
    b.send_with_block("each", 0, blk).pop();
    b.getlocal("x").leave();
    b.build().unwrap()
}

/// `s = 0; [1, 2].each { |x| s += x }; [3].each { |x| s += x }; s`
fn two_loops() -> Iseq {
    let body = |name: &str| {
        let mut blk = IseqBuilder::block(name);
        blk.required("x");
        blk.getdynamic(0, 1).getlocal("x").op(Instruction::OptPlus).dup().setdynamic(0, 1).leave();
        blk.build().unwrap()
    };
    let mut b = IseqBuilder::method("two_loops");
    b.local("s");
    b.int(0).setlocal("s");
    b.duparray(vec![Literal::Int(1), Literal::Int(2)]);
    b.send_with_block("each", 0, body("first block")).pop();
    b.duparray(vec![Literal::Int(3)]);
    b.send_with_block("each", 0, body("second block")).pop();
    b.getlocal("s").leave();
    b.build().unwrap()
}

/// ```text
/// n = 0
/// begin
///   n += 1
///   raise "again" if n < 3
///   n
/// rescue
///   retry
/// end
/// ```
fn retrier() -> Iseq {
    let mut b = IseqBuilder::method("retrier");
    b.local("n");
    let (start, end, handler, cont) = (b.label(), b.label(), b.label(), b.label());
    let (ok, retry_start) = (b.label(), b.label());
    b.int(0).setlocal("n");
    b.place(start);
    b.getlocal("n").int(1).op(Instruction::OptPlus).setlocal("n");
    b.getlocal("n").int(3).op(Instruction::OptLt).branchunless(ok);
    b.putself().putstring("again").fcall("raise", 1).pop();
    b.place(ok);
    b.getlocal("n");
    b.place(end);
    b.jump(cont);
    b.place(handler);
    b.set_depth(1);
    b.pop();
    b.place(retry_start);
    b.putnil().throw(4);
    b.place(cont);
    b.leave();
    b.rescue(start, end, handler, cont, 0);
    b.region(CatchKind::Retry, retry_start, cont, start, None, 0);
    b.build().unwrap()
}

/// `def each_twice; yield 1; yield 2; end`
fn each_twice() -> Iseq {
    let mut m = IseqBuilder::method("each_twice");
    m.int(1).invokeblock(1).pop();
    m.int(2).invokeblock(1).leave();
    m.build().unwrap()
}

/// `r = []; each_twice { |x| next 0 if x == 1; r << x }; r`
fn collector() -> Iseq {
    let mut blk = IseqBuilder::block("block in collect");
    blk.required("x");
    let skip = blk.label();
    blk.getlocal("x").int(1).op(Instruction::OptEq).branchunless(skip);
    blk.int(0).throw(3);
    blk.place(skip);
    blk.getdynamic(0, 1).getlocal("x").op(Instruction::OptLtlt).leave();
    let blk = blk.build().unwrap();

    let mut b = IseqBuilder::method("collect");
    b.newarray(0).setlocal("r");
    b.putself().send_with_block("each_twice", 0, blk).pop();
    b.getlocal("r").leave();
    b.build().unwrap()
}

/// `c = 0; [1].each { c += 1; redo if c < 3; c }; c`
fn redoer() -> Iseq {
    let mut blk = IseqBuilder::block("block in redoer");
    let done = blk.label();
    blk.getdynamic(0, 1).int(1).op(Instruction::OptPlus).setdynamic(0, 1);
    blk.getdynamic(0, 1).int(3).op(Instruction::OptLt).branchunless(done);
    blk.putnil().throw(5);
    blk.place(done);
    blk.getdynamic(0, 1).leave();
    let blk = blk.build().unwrap();

    let mut b = IseqBuilder::method("redoer");
    b.local("c");
    b.int(0).setlocal("c");
    b.duparray(vec![Literal::Int(1)]).send_with_block("each", 0, blk).pop();
    b.getlocal("c").leave();
    b.build().unwrap()
}

/// `begin; raise "boom"; ensure; puts "ensured"; end`
fn ensurer() -> Iseq {
    let mut b = IseqBuilder::method("ensurer");
    let (start, end, handler, cont) = (b.label(), b.label(), b.label(), b.label());
    b.place(start);
    b.putstring("boom").throw(0);
    b.place(end);
    b.place(handler);
    b.set_depth(2);
    b.putself().putstring("ensured").fcall("puts", 1).pop().rethrow();
    b.ensure(start, end, handler, cont, 0);
    b.place(cont);
    b.putnil().leave();
    b.build().unwrap()
}

/// ```text
/// begin
///   begin
///     raise "inner"
///   rescue
///     raise "outer"
///   end
/// rescue => e
///   e.message
/// end
/// ```
fn nested() -> Iseq {
    let mut b = IseqBuilder::method("nested");
    let (o_start, o_end, o_handler, cont) = (b.label(), b.label(), b.label(), b.label());
    let (i_start, i_end, i_handler, i_cont) = (b.label(), b.label(), b.label(), b.label());
    b.place(o_start);
    b.place(i_start);
    b.putself().putstring("inner").fcall("raise", 1);
    b.place(i_end);
    b.jump(i_cont);
    b.place(i_handler);
    b.set_depth(1);
    b.pop().putself().putstring("outer").fcall("raise", 1);
    b.place(i_cont);
    b.place(o_end);
    b.jump(cont);
    b.place(o_handler);
    b.set_depth(1);
    b.send("message", 0);
    b.place(cont);
    b.leave();
    b.rescue(i_start, i_end, i_handler, i_cont, 0);
    b.rescue(o_start, o_end, o_handler, cont, 0);
    b.build().unwrap()
}

/// `begin; begin; return 7; rescue; end; rescue; end`
fn early_return() -> Iseq {
    let mut b = IseqBuilder::method("early_return");
    let (o_start, o_end, o_handler, cont) = (b.label(), b.label(), b.label(), b.label());
    let (i_start, i_end, i_handler) = (b.label(), b.label(), b.label());
    b.place(o_start);
    b.place(i_start);
    b.int(7).leave();
    b.place(i_end);
    b.place(i_handler);
    b.set_depth(1);
    b.leave();
    b.place(o_end);
    b.place(o_handler);
    b.set_depth(1);
    b.place(cont);
    b.leave();
    b.rescue(i_start, i_end, i_handler, cont, 0);
    b.rescue(o_start, o_end, o_handler, cont, 0);
    b.build().unwrap()
}

fn binary(name: &str, insn: Instruction) -> Iseq {
    let mut b = IseqBuilder::method(name);
    b.required("a");
    b.required("b");
    b.getlocal("a").getlocal("b").op(insn).leave();
    b.build().unwrap()
}

fn unary(name: &str, insn: Instruction) -> Iseq {
    let mut b = IseqBuilder::method(name);
    b.required("a");
    b.getlocal("a").op(insn).leave();
    b.build().unwrap()
}

/// `def opt(a, b = 10) = a + b`
fn optional() -> Iseq {
    let mut b = IseqBuilder::method("opt");
    b.required("a");
    b.optional("b");
    b.opt_entry();
    b.int(10).setlocal("b");
    b.opt_entry();
    b.getlocal("a").getlocal("b").op(Instruction::OptPlus).leave();
    b.build().unwrap()
}

/// `def count_rest(a, *r) = r.length`
fn count_rest() -> Iseq {
    let mut b = IseqBuilder::method("count_rest");
    b.required("a");
    b.rest("r");
    b.getlocal("r").send("length", 0).leave();
    b.build().unwrap()
}

/// `acc = 0; [1, 2].each { acc += 1 }; acc`
fn counter() -> Iseq {
    let mut blk = IseqBuilder::block("block in counter");
    blk.getdynamic(0, 1).int(1).op(Instruction::OptPlus).dup().setdynamic(0, 1).leave();
    let blk = blk.build().unwrap();

    let mut b = IseqBuilder::method("counter");
    b.local("acc");
    b.int(0).setlocal("acc");
    b.duparray(vec![Literal::Int(1), Literal::Int(2)]);
    b.send_with_block("each", 0, blk).pop();
    b.getlocal("acc").leave();
    b.build().unwrap()
}

/// `[1, 2, 3].map { |x| x * 2 }.inspect`
fn doubler() -> Iseq {
    let mut blk = IseqBuilder::block("block in doubler");
    blk.required("x");
    blk.getlocal("x").int(2).op(Instruction::OptMult).leave();
    let blk = blk.build().unwrap();

    let mut b = IseqBuilder::method("doubler");
    b.duparray(vec![Literal::Int(1), Literal::Int(2), Literal::Int(3)]);
    b.send_with_block("map", 0, blk);
    b.send("inspect", 0).leave();
    b.build().unwrap()
}

/// A loop that keeps a value on the stack across its back edge:
///
/// ```text
/// putnil
/// loop: pop; n -= 1; push n; dup; branchif n > 0 -> loop
/// leave
/// ```
fn stack_carrier() -> Iseq {
    let mut b = IseqBuilder::method("carry");
    b.required("n");
    let head = b.label();
    b.putnil();
    b.place(head);
    b.pop();
    b.getlocal("n").int(1).op(Instruction::OptMinus).setlocal("n");
    b.getlocal("n").dup().int(0).op(Instruction::OptGt).branchif(head);
    b.leave();
    b.build().unwrap()
}

// ============================================================================
// Tests
// ============================================================================

#[test]
fn test_recursive_method_under_every_stack_model() {
    for options in stack_strategies() {
        assert_eq!(agree(options, &[fib()], "fib", &[int(20)]), "6765");
    }
}

#[test]
fn test_rescue_continues_in_handler() {
    for options in stack_strategies() {
        assert_eq!(agree(options, &[rescuer()], "rescuer", &[]), "42");
    }
}

#[test]
fn test_break_from_block_lands_after_call() {
    for options in stack_strategies() {
        assert_eq!(agree(options, &[breaker()], "breaker", &[]), "99");
    }
}

#[test]
fn test_doubly_recursive_function() {
    for options in stack_strategies() {
        assert_eq!(agree(options, &[f()], "f", &[int(10)]), "89");
        assert_eq!(agree(options, &[f()], "f", &[int(1)]), "1");
    }
}

#[test]
fn test_conditional_break_inside_block() {
    for options in stack_strategies() {
        assert_eq!(agree(options, &[conditional_breaker()], "conditional_breaker", &[]), "99");
    }
}

#[test]
fn test_block_parameter_shadowing_local_stays_interpreted() {
    let mut interpreted = interpreting(&[shadower()]);
    assert_eq!(call(&mut interpreted, "shadower", &[]), "5");

    for options in stack_strategies() {
        let (mut rt, jit) = compiling(options, &[shadower()]);
        assert_eq!(state(&rt, "shadower"), MethodState::Interpreted);
        assert_eq!(call(&mut rt, "shadower", &[]), "5");
        assert!(matches!(
            jit.decisions()[0].outcome,
            Outcome::Fallback {
                kind: "unsupported_construct",
                ..
            }
        ));
    }
}

#[test]
fn test_sibling_blocks_with_same_parameter_name() {
    for options in stack_strategies() {
        assert_eq!(agree(options, &[two_loops()], "two_loops", &[]), "6");
    }
}

#[test]
fn test_retry_reenters_protected_code() {
    for options in stack_strategies() {
        assert_eq!(agree(options, &[retrier()], "retrier", &[]), "3");
    }
}

#[test]
fn test_next_and_yield_between_compiled_methods() {
    let methods = [each_twice(), collector()];
    assert_eq!(agree(CompileOptions::default(), &methods, "collect", &[]), "[2]");
}

#[test]
fn test_redo_restarts_block_body() {
    assert_eq!(agree(CompileOptions::default(), &[redoer()], "redoer", &[]), "3");
}

#[test]
fn test_ensure_runs_then_reraises() {
    let (mut rt, _) = compiling(CompileOptions::default(), &[ensurer()]);
    assert_compiled(&rt, "ensurer");
    let main = rt.main_object();
    let err = rt.call_method(main, "ensurer", &[]).unwrap_err();
    assert_eq!(err.to_string(), "RuntimeError: boom");
    assert_eq!(rt.output(), "ensured\n");
    assert_eq!(rt.thread.tag_head, None);
}

#[test]
fn test_nested_regions_restore_handler_chain() {
    for options in stack_strategies() {
        assert_eq!(agree(options, &[nested()], "nested", &[]), "\"outer\"");
        assert_eq!(agree(options, &[early_return()], "early_return", &[]), "7");
    }
}

#[test]
fn test_fixnum_boundaries_match_generic_arithmetic() {
    let (max, min) = (Value::FIXNUM_MAX, Value::FIXNUM_MIN);
    let methods = [
        binary("plus", Instruction::OptPlus),
        binary("minus", Instruction::OptMinus),
        binary("mult", Instruction::OptMult),
        binary("lt", Instruction::OptLt),
        binary("eq", Instruction::OptEq),
        unary("succ", Instruction::OptSucc),
        unary("not", Instruction::OptNot),
    ];
    let cases: &[(&str, &[i64])] = &[
        ("plus", &[max, 1]),
        ("plus", &[min, -1]),
        ("plus", &[max - 1, 1]),
        ("minus", &[min, 1]),
        ("minus", &[max, -1]),
        ("minus", &[0, min]),
        ("mult", &[max, 2]),
        ("mult", &[min, -1]),
        ("mult", &[-1, min]),
        ("mult", &[1 << 31, 1 << 31]),
        ("mult", &[-7, 6]),
        ("lt", &[min, max]),
        ("eq", &[max, max]),
        ("succ", &[max]),
        ("succ", &[-1]),
        ("not", &[0]),
    ];
    for optimization_level in [0, 2] {
        let options = CompileOptions {
            optimization_level,
            ..Default::default()
        };
        for (name, args) in cases {
            let args: Vec<Value> = args.iter().map(|&n| int(n)).collect();
            agree(options, &methods, name, &args);
        }
    }
}

#[test]
fn test_fast_paths_fall_back_for_other_receivers() {
    let methods = [
        binary("aref", Instruction::OptAref),
        binary("ltlt", Instruction::OptLtlt),
        binary("plus", Instruction::OptPlus),
    ];
    let (mut rt, _) = compiling(CompileOptions::default(), &methods);
    let array = {
        let items = vec![int(1), int(2), int(3)];
        rt.ary_new(items)
    };
    assert_eq!(call(&mut rt, "aref", &[array, int(-1)]), "3");
    assert_eq!(call(&mut rt, "aref", &[array, int(7)]), "nil");
    let s = rt.str_new("ab");
    assert_eq!(call(&mut rt, "ltlt", &[s, s]), "\"abab\"");
    let t = rt.str_new("x");
    assert_eq!(call(&mut rt, "plus", &[t, t]), "\"xx\"");
    let err = call(&mut rt, "plus", &[int(1), t]);
    assert_eq!(err, "TypeError: String can't be coerced into Integer");
}

#[test]
fn test_optional_and_rest_arguments() {
    let methods = [optional(), count_rest()];
    let options = CompileOptions::default();
    assert_eq!(agree(options, &methods, "opt", &[int(1)]), "11");
    assert_eq!(agree(options, &methods, "opt", &[int(1), int(2)]), "3");
    assert_eq!(
        agree(options, &methods, "opt", &[]),
        "ArgumentError: wrong number of arguments (given 0, expected 1..2)"
    );
    assert_eq!(
        agree(options, &methods, "opt", &[int(1), int(2), int(3)]),
        "ArgumentError: wrong number of arguments (given 3, expected 1..2)"
    );
    assert_eq!(agree(options, &methods, "count_rest", &[int(1), int(2), int(3)]), "2");
    assert_eq!(agree(options, &methods, "count_rest", &[int(1)]), "0");
}

#[test]
fn test_fixed_arity_mismatch_raises() {
    let (mut rt, _) = compiling(CompileOptions::default(), &[fib()]);
    assert_eq!(
        call(&mut rt, "fib", &[]),
        "ArgumentError: wrong number of arguments (given 0, expected 1)"
    );
}

#[test]
fn test_every_iteration_strategy() {
    for iteration_strategy in [IterationStrategy::Fast, IterationStrategy::Proc, IterationStrategy::Splat] {
        let options = CompileOptions {
            iteration_strategy,
            ..Default::default()
        };
        assert_eq!(agree(options, &[counter()], "counter", &[]), "2");
        assert_eq!(agree(options, &[doubler()], "doubler", &[]), "\"[2, 4, 6]\"");
    }
}

#[test]
fn test_stub_compiles_on_first_call() {
    let mut rt = Runtime::new(RuntimeConfig::default());
    let jit = Jit::new(CompileOptions::default()).install(&mut rt);
    rt.define_method("Object", fib()).unwrap();
    assert_eq!(state(&rt, "fib"), MethodState::Stub);

    assert_eq!(call(&mut rt, "fib", &[int(10)]), "55");
    assert_compiled(&rt, "fib");
    assert_eq!(jit.decisions().len(), 1);
}

#[test]
fn test_unsupported_method_stays_interpreted() {
    let mut b = IseqBuilder::method("with_block_param");
    b.block_param("blk");
    b.int(1).leave();
    let (mut rt, jit) = compiling(CompileOptions::default(), &[b.build().unwrap()]);

    assert_eq!(state(&rt, "with_block_param"), MethodState::Interpreted);
    assert_eq!(call(&mut rt, "with_block_param", &[]), "1");
    let decisions = jit.decisions();
    assert!(matches!(
        decisions[0].outcome,
        Outcome::Fallback {
            kind: "unsupported_construct",
            ..
        }
    ));
}

#[test]
fn test_dont_compile_leaves_everything_interpreted() {
    let options = CompileOptions {
        dont_compile: true,
        ..Default::default()
    };
    let (mut rt, jit) = compiling(options, &[fib()]);
    assert_eq!(state(&rt, "fib"), MethodState::Interpreted);
    assert_eq!(call(&mut rt, "fib", &[int(10)]), "55");
    assert!(jit.decisions().is_empty());

    let err = hyperdrive_jit::compile(&fib(), &options, &rt.symbols).unwrap_err();
    assert_eq!(err.to_string(), "not compiling `fib`");
}

#[test]
fn test_unsafe_branch_needs_dynamic_stack() {
    let methods = [stack_carrier()];

    let options = CompileOptions::default();
    let (mut rt, jit) = compiling(options, &methods);
    assert_eq!(state(&rt, "carry"), MethodState::Interpreted);
    assert!(matches!(
        jit.decisions()[0].outcome,
        Outcome::Fallback {
            kind: "unsafe_branch",
            ..
        }
    ));
    assert_eq!(call(&mut rt, "carry", &[int(3)]), "0");

    for stack in [StackStrategy::Dynamic, StackStrategy::Auto] {
        let options = CompileOptions {
            stack,
            ..Default::default()
        };
        assert_eq!(agree(options, &methods, "carry", &[int(3)]), "0");
    }
}

#[test]
fn test_compiled_blocks_survive_gc_stress() {
    let config = RuntimeConfig {
        gc_stress: true,
        ..RuntimeConfig::default()
    };
    for options in stack_strategies() {
        let methods = [doubler(), counter(), retrier()];
        let (mut rt, _) = compiling_with(config.clone(), options, &methods);
        assert_eq!(call(&mut rt, "doubler", &[]), "\"[2, 4, 6]\"");
        assert_eq!(call(&mut rt, "counter", &[]), "2");
        assert_eq!(call(&mut rt, "retrier", &[]), "3");
        assert!(rt.heap.stats().collections > 0);
    }
}

#[test]
fn test_uncaught_error_reports_class() {
    let mut b = IseqBuilder::method("fail");
    b.putself().putstring("nope").fcall("raise", 1).leave();
    let (mut rt, _) = compiling(CompileOptions::default(), &[b.build().unwrap()]);
    let main = rt.main_object();
    let err = rt.call_method(main, "fail", &[]).unwrap_err();
    assert!(matches!(err, RuntimeError::Uncaught { ref class, .. } if class == "RuntimeError"));
    assert_eq!(rt.thread.tag_head, None);
}

#[test]
fn test_demo_program_runs_compiled() {
    let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("../../demos/fib.json");
    let program = hyperdrive_vm::iseq::Program::load(&path).unwrap();
    let mut rt = Runtime::new(RuntimeConfig::default());
    let jit = Jit::new(CompileOptions::default()).install(&mut rt);
    rt.run(&program).unwrap();
    assert_eq!(rt.output(), "75025\n");
    assert_compiled(&rt, "fib");
    assert_eq!(jit.decisions().len(), 1);
}
