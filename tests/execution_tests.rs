//! End-to-end execution tests
//!
//! Every program runs twice, once under `InterpretOnly` and once under
//! `PreferNative`, and the two results (values or error kinds) must agree.

#![cfg(feature = "native")]

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tessera::ast::{build::*, BinaryOp, Intrinsic, Module};
use tessera::types::StructField;
use tessera::{
    invoke_parallel, load, AbortHandle, Dim, Dispatcher, EngineOptions, ExecutionMode, ExecutionPolicy, FunctionId,
    Invocation, ParallelConfig, Result, RuntimeErrorKind, ScalarKind, TargetFeatures, Type, TypedValue,
};

// =============================================================================
// HELPERS
// =============================================================================

fn interpreted(module: &Module) -> Dispatcher {
    load(module, EngineOptions::default().policy(ExecutionPolicy::InterpretOnly)).unwrap()
}

fn native(module: &Module) -> Dispatcher {
    load(module, EngineOptions::default().policy(ExecutionPolicy::PreferNative)).unwrap()
}

/// Run in both modes and require identical outcomes
fn run_both(module: &Module, name: &str, args: Vec<TypedValue>) -> Result<TypedValue> {
    let a = interpreted(module).invoke_by_name(name, args.clone());
    let n = native(module);
    let b = n.invoke_by_name(name, args);
    let id = n.unit().function_id(name).unwrap();
    assert_eq!(n.mode(id), Some(ExecutionMode::Native), "{} should run natively", name);
    match (&a, &b) {
        (Ok(x), Ok(y)) => assert_eq!(x, y, "modes disagree on {}", name),
        (Err(x), Err(y)) => assert_eq!(x.runtime_kind(), y.runtime_kind(), "modes disagree on {}", name),
        _ => panic!("modes disagree on {}: {:?} vs {:?}", name, a, b),
    }
    a
}

fn kind(result: Result<TypedValue>) -> Option<RuntimeErrorKind> {
    result.unwrap_err().runtime_kind()
}

fn i32_add(checked_add: bool) -> Module {
    let body = if checked_add {
        checked(BinaryOp::Add, var("a"), var("b"))
    } else {
        add(var("a"), var("b"))
    };
    module(vec![func(
        "add",
        vec![param("a", Type::I32), param("b", Type::I32)],
        Type::I32,
        vec![ret(body)],
    )])
}

// =============================================================================
// ARITHMETIC POLICY
// =============================================================================

#[test]
fn test_i32_add_wraps_in_both_modes() {
    let result = run_both(&i32_add(false), "add", vec![TypedValue::i32(2147483647), TypedValue::i32(1)]);
    assert_eq!(result.unwrap(), TypedValue::i32(-2147483648));
}

#[test]
fn test_checked_i32_add_overflows_in_both_modes() {
    let result = run_both(&i32_add(true), "add", vec![TypedValue::i32(2147483647), TypedValue::i32(1)]);
    assert_eq!(kind(result), Some(RuntimeErrorKind::Overflow));
    let ok = run_both(&i32_add(true), "add", vec![TypedValue::i32(40), TypedValue::i32(2)]);
    assert_eq!(ok.unwrap(), TypedValue::i32(42));
}

#[test]
fn test_division_by_zero() {
    let m = module(vec![func(
        "quot",
        vec![param("a", Type::I64), param("b", Type::I64)],
        Type::I64,
        vec![ret(div(var("a"), var("b")))],
    )]);
    assert_eq!(run_both(&m, "quot", vec![TypedValue::i64(-7), TypedValue::i64(2)]).unwrap(), TypedValue::i64(-3));
    let err = run_both(&m, "quot", vec![TypedValue::i64(1), TypedValue::i64(0)]);
    assert_eq!(kind(err), Some(RuntimeErrorKind::DivisionByZero));
}

#[test]
fn test_saturating_float_to_int_cast() {
    let m = module(vec![func(
        "trunc",
        vec![param("x", Type::F64)],
        Type::I32,
        vec![ret(cast(var("x"), Type::I32))],
    )]);
    assert_eq!(run_both(&m, "trunc", vec![TypedValue::f64(-3.9)]).unwrap(), TypedValue::i32(-3));
    assert_eq!(run_both(&m, "trunc", vec![TypedValue::f64(3.9e10)]).unwrap(), TypedValue::i32(i32::MAX));
    assert_eq!(run_both(&m, "trunc", vec![TypedValue::f64(f64::NAN)]).unwrap(), TypedValue::i32(0));
}

#[test]
fn test_mixed_signedness_promotes_in_both_modes() {
    let m = module(vec![func(
        "mix",
        vec![param("a", Type::I8), param("b", Type::U64)],
        Type::U64,
        vec![ret(add(var("a"), var("b")))],
    )]);
    let r = run_both(&m, "mix", vec![TypedValue::i8(-1), TypedValue::u64(2)]).unwrap();
    assert_eq!(r, TypedValue::u64(1));
    let r = run_both(&m, "mix", vec![TypedValue::i8(5), TypedValue::u64(7)]).unwrap();
    assert_eq!(r, TypedValue::u64(12));
}

// =============================================================================
// CONTROL FLOW
// =============================================================================

#[test]
fn test_short_circuit_skips_division() {
    let m = module(vec![func(
        "safe",
        vec![param("n", Type::I64)],
        Type::BOOL,
        vec![ret(and(gt(var("n"), int(0)), eq(div(int(10), var("n")), int(5))))],
    )]);
    assert_eq!(run_both(&m, "safe", vec![TypedValue::i64(0)]).unwrap(), TypedValue::boolean(false));
    assert_eq!(run_both(&m, "safe", vec![TypedValue::i64(2)]).unwrap(), TypedValue::boolean(true));
    assert_eq!(run_both(&m, "safe", vec![TypedValue::i64(3)]).unwrap(), TypedValue::boolean(false));
}

#[test]
fn test_loops_and_recursion() {
    let m = module(vec![
        func(
            "tri",
            vec![param("n", Type::I64)],
            Type::I64,
            vec![
                let_mut("acc", int(0)),
                let_mut("i", int(0)),
                while_(
                    lt(var("i"), var("n")),
                    vec![
                        assign("i", add(var("i"), int(1))),
                        assign("acc", add(var("acc"), var("i"))),
                    ],
                ),
                ret(var("acc")),
            ],
        ),
        func(
            "fib",
            vec![param("n", Type::I64)],
            Type::I64,
            vec![
                if_(lt(var("n"), int(2)), vec![ret(var("n"))], vec![]),
                ret(add(
                    call("fib", vec![sub(var("n"), int(1))]),
                    call("fib", vec![sub(var("n"), int(2))]),
                )),
            ],
        ),
    ]);
    assert_eq!(run_both(&m, "tri", vec![TypedValue::i64(100)]).unwrap(), TypedValue::i64(5050));
    assert_eq!(run_both(&m, "fib", vec![TypedValue::i64(15)]).unwrap(), TypedValue::i64(610));
}

#[test]
fn test_call_depth_limit_in_both_modes() {
    let m = module(vec![func(
        "down",
        vec![param("n", Type::I64)],
        Type::I64,
        vec![
            if_(eq(var("n"), int(0)), vec![ret(int(0))], vec![]),
            ret(call("down", vec![sub(var("n"), int(1))])),
        ],
    )]);
    for policy in [ExecutionPolicy::InterpretOnly, ExecutionPolicy::PreferNative] {
        let d = load(&m, EngineOptions::default().policy(policy).max_call_depth(32)).unwrap();
        assert_eq!(d.invoke_by_name("down", vec![TypedValue::i64(20)]).unwrap(), TypedValue::i64(0));
        let err = d.invoke_by_name("down", vec![TypedValue::i64(40)]).unwrap_err();
        assert_eq!(err.runtime_kind(), Some(RuntimeErrorKind::StackOverflow));
    }
}

fn counting_down() -> Module {
    module(vec![func(
        "down",
        vec![param("n", Type::I64)],
        Type::I64,
        vec![
            if_(eq(var("n"), int(0)), vec![ret(int(0))], vec![]),
            ret(add(call("down", vec![sub(var("n"), int(1))]), int(1))),
        ],
    )])
}

#[test]
fn test_default_call_depth_in_both_modes() {
    let m = counting_down();
    let ok = run_both(&m, "down", vec![TypedValue::i64(255)]);
    assert_eq!(ok.unwrap(), TypedValue::i64(255));
    let err = run_both(&m, "down", vec![TypedValue::i64(256)]);
    assert_eq!(kind(err), Some(RuntimeErrorKind::StackOverflow));
    let err = run_both(&m, "down", vec![TypedValue::i64(100_000)]);
    assert_eq!(kind(err), Some(RuntimeErrorKind::StackOverflow));
}

#[test]
fn test_deep_recursion_off_the_host_stack() {
    let m = counting_down();
    for policy in [ExecutionPolicy::InterpretOnly, ExecutionPolicy::PreferNative] {
        let d = load(&m, EngineOptions::default().policy(policy).max_call_depth(50_000)).unwrap();
        let r = d.invoke_by_name("down", vec![TypedValue::i64(20_000)]).unwrap();
        assert_eq!(r, TypedValue::i64(20_000));
    }
}

#[test]
fn test_mutual_recursion_across_modes() {
    let m = module(vec![
        func(
            "ping",
            vec![param("n", Type::I64)],
            Type::I64,
            vec![
                if_(eq(var("n"), int(0)), vec![ret(int(0))], vec![]),
                ret(add(call("pong", vec![sub(var("n"), int(1))]), int(1))),
            ],
        ),
        func(
            "pong",
            vec![param("n", Type::I64)],
            Type::I64,
            vec![
                if_(eq(var("n"), int(0)), vec![ret(int(0))], vec![]),
                ret(add(call("ping", vec![sub(var("n"), int(1))]), int(1))),
            ],
        ),
    ]);
    let d = native(&m);
    d.pin(FunctionId(0), ExecutionMode::Interpreted).unwrap();
    assert_eq!(d.invoke_by_name("ping", vec![TypedValue::i64(20)]).unwrap(), TypedValue::i64(20));
    assert_eq!(d.mode(FunctionId(1)), Some(ExecutionMode::Native));

    // every call switches modes; the nesting limit stops this cleanly
    let err = d.invoke_by_name("ping", vec![TypedValue::i64(100)]).unwrap_err();
    assert_eq!(err.runtime_kind(), Some(RuntimeErrorKind::StackOverflow));
    assert_eq!(d.invoke_by_name("pong", vec![TypedValue::i64(7)]).unwrap(), TypedValue::i64(7));
}

// =============================================================================
// AGGREGATES
// =============================================================================

#[test]
fn test_dynamic_tensor_shape_mismatch_in_both_modes() {
    let dynamic = Type::Tensor(Box::new(Type::F64), vec![Dim::Dynamic]);
    let m = module(vec![func(
        "vadd",
        vec![param("a", dynamic.clone()), param("b", dynamic.clone())],
        dynamic,
        vec![ret(add(var("a"), var("b")))],
    )]);
    let a = TypedValue::tensor_f64(vec![Dim::Dynamic], vec![2], &[1.0, 2.0]).unwrap();
    let b = TypedValue::tensor_f64(vec![Dim::Dynamic], vec![3], &[1.0, 2.0, 3.0]).unwrap();
    let err = run_both(&m, "vadd", vec![a.clone(), b]);
    assert_eq!(kind(err), Some(RuntimeErrorKind::ShapeMismatch));
    let sum = run_both(&m, "vadd", vec![a.clone(), a]).unwrap();
    assert_eq!(sum.to_f64_vec(), Some(vec![2.0, 4.0]));
}

#[test]
fn test_loop_temporaries_do_not_exhaust_native_heap() {
    let dynamic = Type::Tensor(Box::new(Type::F64), vec![Dim::Dynamic]);
    let m = module(vec![func(
        "loop_sum",
        vec![param("t", dynamic), param("n", Type::I64)],
        Type::F64,
        vec![
            let_mut("acc", float(0.0)),
            let_mut("i", int(0)),
            while_(
                lt(var("i"), var("n")),
                vec![
                    assign(
                        "acc",
                        add(var("acc"), intrinsic(Intrinsic::Sum, vec![add(var("t"), var("t"))])),
                    ),
                    assign("i", add(var("i"), int(1))),
                ],
            ),
            ret(var("acc")),
        ],
    )]);
    // 400 temporaries of 800 KB each outgrow the 256 MiB native heap
    // unless dead buffers are reclaimed
    let t = TypedValue::tensor_f64(vec![Dim::Dynamic], vec![100_000], &vec![1.0; 100_000]).unwrap();
    let r = run_both(&m, "loop_sum", vec![t, TypedValue::i64(400)]).unwrap();
    assert_eq!(r, TypedValue::f64(80_000_000.0));
}

#[test]
fn test_tensor_intrinsics() {
    let square = Type::Tensor(Box::new(Type::F64), vec![Dim::Fixed(2), Dim::Fixed(2)]);
    let dynamic = Type::Tensor(Box::new(Type::F64), vec![Dim::Dynamic]);
    let m = module(vec![
        func(
            "mm",
            vec![],
            square,
            vec![ret(intrinsic(
                Intrinsic::MatMul,
                vec![
                    tensor(vec![2, 2], vec![float(1.0), float(2.0), float(3.0), float(4.0)]),
                    tensor(vec![2, 2], vec![float(5.0), float(6.0), float(7.0), float(8.0)]),
                ],
            ))],
        ),
        func(
            "len",
            vec![param("t", dynamic)],
            Type::I64,
            vec![ret(intrinsic(Intrinsic::Dim(0), vec![var("t")]))],
        ),
        func(
            "at",
            vec![param("i", Type::I64)],
            Type::F64,
            vec![
                let_("v", vector(vec![float(1.0), float(2.0)])),
                ret(index(var("v"), vec![var("i")])),
            ],
        ),
    ]);
    let product = run_both(&m, "mm", vec![]).unwrap();
    assert_eq!(product.to_f64_vec(), Some(vec![19.0, 22.0, 43.0, 50.0]));
    let t = TypedValue::tensor_f64(vec![Dim::Dynamic], vec![3], &[0.0; 3]).unwrap();
    assert_eq!(run_both(&m, "len", vec![t]).unwrap(), TypedValue::i64(3));
    assert_eq!(run_both(&m, "at", vec![TypedValue::i64(1)]).unwrap(), TypedValue::f64(2.0));
    let err = run_both(&m, "at", vec![TypedValue::i64(2)]);
    assert_eq!(kind(err), Some(RuntimeErrorKind::IndexOutOfBounds));
}

#[test]
fn test_complex_arithmetic() {
    let c = Type::complex(ScalarKind::F64);
    let m = module(vec![func(
        "cmul",
        vec![param("a", c.clone()), param("b", c.clone())],
        c,
        vec![ret(mul(var("a"), var("b")))],
    )]);
    let r = run_both(&m, "cmul", vec![TypedValue::complex64(1.0, 2.0), TypedValue::complex64(3.0, 4.0)]);
    assert_eq!(r.unwrap().as_complex(), Some((-5.0, 10.0)));
}

#[test]
fn test_struct_arguments() {
    let point = Type::Struct(vec![
        StructField {
            name: "x".into(),
            ty: Type::I32,
        },
        StructField {
            name: "y".into(),
            ty: Type::F64,
        },
    ]);
    let m = module(vec![func(
        "norm1",
        vec![param("p", point)],
        Type::F64,
        vec![ret(add(field(var("p"), "y"), cast(field(var("p"), "x"), Type::F64)))],
    )]);
    let p = TypedValue::structure(vec![("x", TypedValue::i32(3)), ("y", TypedValue::f64(0.5))]);
    assert_eq!(run_both(&m, "norm1", vec![p]).unwrap(), TypedValue::f64(3.5));
}

// =============================================================================
// DISPATCHER
// =============================================================================

#[test]
fn test_missing_native_feature_falls_back() {
    let v3 = Type::Vector(Box::new(Type::F64), 3);
    let m = module(vec![
        func("total", vec![param("v", v3)], Type::F64, vec![ret(intrinsic(Intrinsic::Sum, vec![var("v")]))]),
        func("inc", vec![param("x", Type::I64)], Type::I64, vec![ret(add(var("x"), int(1)))]),
    ]);
    let d = load(&m, EngineOptions::default().target(TargetFeatures::minimal())).unwrap();
    let total = d.invoke_by_name("total", vec![TypedValue::vector_f64(&[1.0, 2.0, 3.0])]).unwrap();
    assert_eq!(total, TypedValue::f64(6.0));
    assert_eq!(d.mode(FunctionId(0)), Some(ExecutionMode::Interpreted));
    assert_eq!(d.invoke_by_name("inc", vec![TypedValue::i64(1)]).unwrap(), TypedValue::i64(2));
    assert_eq!(d.mode(FunctionId(1)), Some(ExecutionMode::Native));
}

#[test]
fn test_interpreted_caller_native_callee() {
    let m = module(vec![
        func("sq", vec![param("x", Type::I64)], Type::I64, vec![ret(mul(var("x"), var("x")))]),
        func(
            "sum_sq",
            vec![param("a", Type::I64), param("b", Type::I64)],
            Type::I64,
            vec![ret(add(call("sq", vec![var("a")]), call("sq", vec![var("b")])))],
        ),
    ]);
    let d = native(&m);
    assert_eq!(d.pin(FunctionId(1), ExecutionMode::Interpreted).unwrap(), ExecutionMode::Interpreted);
    let r = d.invoke_by_name("sum_sq", vec![TypedValue::i64(3), TypedValue::i64(4)]).unwrap();
    assert_eq!(r, TypedValue::i64(25));
    assert_eq!(d.mode(FunctionId(0)), Some(ExecutionMode::Native));
    assert_eq!(d.mode(FunctionId(1)), Some(ExecutionMode::Interpreted));
}

#[test]
fn test_abort_running_native_loop() {
    let m = module(vec![func(
        "spin",
        vec![],
        Type::I64,
        vec![
            let_mut("i", int(0)),
            while_(boolean(true), vec![assign("i", add(var("i"), int(1)))]),
            ret(var("i")),
        ],
    )]);
    for policy in [ExecutionPolicy::InterpretOnly, ExecutionPolicy::PreferNative] {
        let d = Arc::new(load(&m, EngineOptions::default().policy(policy)).unwrap());
        let handle = AbortHandle::new();
        let remote = handle.clone();
        let aborter = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            remote.abort();
        });
        let err = d.invoke_abortable(FunctionId(0), vec![], &handle).unwrap_err();
        assert_eq!(err.runtime_kind(), Some(RuntimeErrorKind::Aborted));
        aborter.join().unwrap();
    }
}

#[test]
fn test_parallel_batch_fail_fast() {
    let m = module(vec![
        func("inc", vec![param("x", Type::I64)], Type::I64, vec![ret(add(var("x"), int(1)))]),
        func(
            "spin",
            vec![param("x", Type::I64)],
            Type::I64,
            vec![while_(boolean(true), vec![]), ret(var("x"))],
        ),
    ]);
    let d = native(&m);

    let batch = (0..16).map(|i| Invocation::new(FunctionId(0), vec![TypedValue::i64(i)])).collect();
    let results = invoke_parallel(&d, batch, &ParallelConfig::default());
    for (i, r) in results.into_iter().enumerate() {
        assert_eq!(r.unwrap(), TypedValue::i64(i as i64 + 1));
    }

    let batch = vec![
        Invocation::new(FunctionId(0), vec![TypedValue::f64(1.0)]),
        Invocation::new(FunctionId(1), vec![TypedValue::i64(0)]),
    ];
    let results = invoke_parallel(&d, batch, &ParallelConfig::default().max_parallelism(2).fail_fast());
    assert_eq!(results[0].as_ref().unwrap_err().runtime_kind(), Some(RuntimeErrorKind::ArgumentMismatch));
    assert_eq!(results[1].as_ref().unwrap_err().runtime_kind(), Some(RuntimeErrorKind::Aborted));
}
