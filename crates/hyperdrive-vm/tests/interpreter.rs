// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! End-to-end tests of the reference interpreter.

use hyperdrive_vm::iseq::{Instruction, Iseq, IseqBuilder, Literal, Program};
use hyperdrive_vm::runtime::{Runtime, RuntimeConfig};
use hyperdrive_vm::{RuntimeError, Value};

fn int(n: i64) -> Value {
    Value::fixnum(n).unwrap()
}

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

#[test]
fn test_recursive_method() {
    let mut rt = Runtime::new(RuntimeConfig::default());
    rt.define_method("Object", fib()).unwrap();
    let main = rt.main_object();
    assert_eq!(rt.call_method(main, "fib", &[int(10)]).unwrap(), int(55));
}

#[test]
fn test_program_from_json() {
    let source = r#"{
        "methods": [{
            "iseq": {
                "name": "double",
                "kind": "method",
                "params": { "required": ["x"] },
                "locals": ["x"],
                "code": [
                    { "op": "getlocal", "index": 0 },
                    { "op": "putobject", "value": { "int": 2 } },
                    { "op": "opt_mult" },
                    { "op": "leave" }
                ]
            }
        }],
        "main": {
            "name": "main",
            "kind": "top",
            "code": [
                { "op": "putself" },
                { "op": "putobject", "value": { "int": 21 } },
                { "op": "send", "mid": "double", "argc": 1, "flags": { "fcall": true } },
                { "op": "leave" }
            ]
        }
    }"#;
    let program = Program::from_json(source).unwrap();
    let mut rt = Runtime::new(RuntimeConfig::default());
    assert_eq!(rt.run(&program).unwrap(), int(42));
}

#[test]
fn test_ensure_runs_then_reraises() {
    let mut b = IseqBuilder::top("main");
    let start = b.label();
    let end = b.label();
    let handler = b.label();
    let cont = b.label();
    b.place(start);
    b.putstring("boom").throw(0);
    b.place(end);
    b.place(handler);
    b.set_depth(2);
    b.putself().putstring("ensured").fcall("puts", 1).pop().rethrow();
    b.ensure(start, end, handler, cont, 0);
    b.place(cont);
    b.putnil().leave();

    let mut rt = Runtime::new(RuntimeConfig::default());
    let err = rt.run_main(&b.build().unwrap()).unwrap_err();
    assert_eq!(err.to_string(), "RuntimeError: boom");
    assert_eq!(rt.output(), "ensured\n");
}

#[test]
fn test_optional_and_rest_parameters() {
    let mut opt = IseqBuilder::method("opt");
    opt.required("a");
    opt.optional("b");
    opt.opt_entry();
    opt.int(10).setlocal("b");
    opt.opt_entry();
    opt.getlocal("a").getlocal("b").op(Instruction::OptPlus).leave();

    let mut rest = IseqBuilder::method("count_rest");
    rest.required("a");
    rest.rest("r");
    rest.getlocal("r").send("length", 0).leave();

    let mut rt = Runtime::new(RuntimeConfig::default());
    rt.define_method("Object", opt.build().unwrap()).unwrap();
    rt.define_method("Object", rest.build().unwrap()).unwrap();
    let main = rt.main_object();

    assert_eq!(rt.call_method(main, "opt", &[int(1)]).unwrap(), int(11));
    assert_eq!(rt.call_method(main, "opt", &[int(1), int(2)]).unwrap(), int(3));
    let err = rt.call_method(main, "opt", &[]).unwrap_err();
    assert_eq!(
        err.to_string(),
        "ArgumentError: wrong number of arguments (given 0, expected 1..2)"
    );
    assert_eq!(
        rt.call_method(main, "count_rest", &[int(1), int(2), int(3)]).unwrap(),
        int(2)
    );
}

#[test]
fn test_unbounded_recursion_is_stack_error() {
    let mut b = IseqBuilder::method("down");
    b.putself().fcall("down", 0).leave();
    let mut rt = Runtime::new(RuntimeConfig::default());
    rt.define_method("Object", b.build().unwrap()).unwrap();
    let main = rt.main_object();
    let err = rt.call_method(main, "down", &[]).unwrap_err();
    assert!(matches!(err, RuntimeError::Uncaught { ref class, .. } if class == "SystemStackError"));
    assert_eq!(rt.thread.depth, 0);
    assert_eq!(rt.thread.sp, 0);
}

#[test]
fn test_map_survives_gc_stress() {
    let mut blk = IseqBuilder::block("block in main");
    blk.required("x");
    blk.getlocal("x").int(2).op(Instruction::OptMult).leave();
    let blk = blk.build().unwrap();

    let mut b = IseqBuilder::top("main");
    b.duparray(vec![Literal::Int(1), Literal::Int(2), Literal::Int(3)]);
    b.send_with_block("map", 0, blk);
    b.send("inspect", 0).leave();

    let config = RuntimeConfig {
        gc_stress: true,
        ..RuntimeConfig::default()
    };
    let mut rt = Runtime::new(config);
    let result = rt.run_main(&b.build().unwrap()).unwrap();
    assert_eq!(rt.heap.string(result), Some("[2, 4, 6]"));
    assert!(rt.heap.stats().collections > 0);
}

#[test]
fn test_next_and_yield_from_method() {
    // def each_twice; yield 1; yield 2; end
    // r = []; each_twice { |x| next 0 if x == 1; r << x }; r
    let mut m = IseqBuilder::method("each_twice");
    m.int(1).invokeblock(1).pop();
    m.int(2).invokeblock(1).leave();

    let mut blk = IseqBuilder::block("block in main");
    blk.required("x");
    let skip = blk.label();
    blk.getlocal("x").int(1).op(Instruction::OptEq).branchunless(skip);
    blk.int(0).throw(3);
    blk.place(skip);
    blk.getdynamic(0, 1).getlocal("x").op(Instruction::OptLtlt).leave();
    let blk = blk.build().unwrap();

    let mut b = IseqBuilder::top("main");
    b.newarray(0).setlocal("r");
    b.putself().send_with_block("each_twice", 0, blk).pop();
    b.getlocal("r").leave();

    let mut rt = Runtime::new(RuntimeConfig::default());
    rt.define_method("Object", m.build().unwrap()).unwrap();
    let result = rt.run_main(&b.build().unwrap()).unwrap();
    assert_eq!(rt.inspect(result), "[2]");
}
