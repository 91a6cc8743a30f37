//! Property-based tests for mode equivalence and the overflow policy
//!
//! These tests use proptest to generate operands and verify that:
//! 1. Interpreted and native execution agree bit for bit
//! 2. Unchecked integer arithmetic wraps like Rust's `wrapping_*`
//! 3. Checked arithmetic fails with `Overflow` exactly when Rust's `checked_*` does

#![cfg(feature = "native")]

use proptest::prelude::*;
use tessera::ast::{build::*, BinaryOp, Expr, Module};
use tessera::{load, Dispatcher, EngineOptions, ExecutionPolicy, RuntimeErrorKind, Type, TypedValue};

// =============================================================================
// FIXTURES
// =============================================================================

fn binary_module(ty: Type, op: fn(Expr, Expr) -> Expr) -> Module {
    module(vec![func(
        "f",
        vec![param("a", ty.clone()), param("b", ty.clone())],
        ty,
        vec![ret(op(var("a"), var("b")))],
    )])
}

fn checked_add(a: Expr, b: Expr) -> Expr {
    checked(BinaryOp::Add, a, b)
}

fn checked_mul(a: Expr, b: Expr) -> Expr {
    checked(BinaryOp::Mul, a, b)
}

fn engines(m: &Module) -> (Dispatcher, Dispatcher) {
    let interp = load(m, EngineOptions::default().policy(ExecutionPolicy::InterpretOnly)).unwrap();
    let native = load(m, EngineOptions::default().policy(ExecutionPolicy::PreferNative)).unwrap();
    (interp, native)
}

fn outcome(d: &Dispatcher, args: Vec<TypedValue>) -> Result<TypedValue, Option<RuntimeErrorKind>> {
    d.invoke_by_name("f", args).map_err(|e| e.runtime_kind())
}

// =============================================================================
// PROPERTIES
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn wrapping_i32_matches_rust(a in any::<i32>(), b in any::<i32>()) {
        let cases: [(fn(Expr, Expr) -> Expr, i32); 3] = [
            (add, a.wrapping_add(b)),
            (sub, a.wrapping_sub(b)),
            (mul, a.wrapping_mul(b)),
        ];
        for (op, expected) in cases {
            let (interp, native) = engines(&binary_module(Type::I32, op));
            let args = vec![TypedValue::i32(a), TypedValue::i32(b)];
            prop_assert_eq!(outcome(&interp, args.clone()), Ok(TypedValue::i32(expected)));
            prop_assert_eq!(outcome(&native, args), Ok(TypedValue::i32(expected)));
        }
    }

    #[test]
    fn checked_i64_matches_rust(a in any::<i64>(), b in any::<i64>()) {
        let cases: [(fn(Expr, Expr) -> Expr, Option<i64>); 2] = [
            (checked_add, a.checked_add(b)),
            (checked_mul, a.checked_mul(b)),
        ];
        for (op, expected) in cases {
            let expected = expected.map(TypedValue::i64).ok_or(Some(RuntimeErrorKind::Overflow));
            let (interp, native) = engines(&binary_module(Type::I64, op));
            let args = vec![TypedValue::i64(a), TypedValue::i64(b)];
            prop_assert_eq!(outcome(&interp, args.clone()), expected.clone());
            prop_assert_eq!(outcome(&native, args), expected);
        }
    }

    #[test]
    fn unsigned_division_agrees(a in any::<u16>(), b in any::<u16>()) {
        let (interp, native) = engines(&binary_module(Type::U16, div));
        let args = vec![TypedValue::u16(a), TypedValue::u16(b)];
        let expected = a
            .checked_div(b)
            .map(TypedValue::u16)
            .ok_or(Some(RuntimeErrorKind::DivisionByZero));
        prop_assert_eq!(outcome(&interp, args.clone()), expected.clone());
        prop_assert_eq!(outcome(&native, args), expected);
    }

    #[test]
    fn float_arithmetic_is_bit_exact(a in any::<f64>(), b in any::<f64>()) {
        for op in [add as fn(Expr, Expr) -> Expr, sub, mul, div] {
            let (interp, native) = engines(&binary_module(Type::F64, op));
            let args = vec![TypedValue::f64(a), TypedValue::f64(b)];
            prop_assert_eq!(outcome(&interp, args.clone()), outcome(&native, args));
        }
    }

    #[test]
    fn casts_agree(x in any::<f32>()) {
        let m = module(vec![func(
            "f",
            vec![param("x", Type::F32)],
            Type::U8,
            vec![ret(cast(var("x"), Type::U8))],
        )]);
        let (interp, native) = engines(&m);
        let expected = Ok(TypedValue::u8(x as u8));
        prop_assert_eq!(outcome(&interp, vec![TypedValue::f32(x)]), expected.clone());
        prop_assert_eq!(outcome(&native, vec![TypedValue::f32(x)]), expected);
    }
}
