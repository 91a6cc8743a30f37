//! Layout stability and IR serialization tests

use std::sync::Arc;

use tessera::ast::{build::*, Intrinsic, Module};
use tessera::compiler::ir::serial::{decode_module, encode_module};
use tessera::compiler::layout::{compute_layout, Storage};
use tessera::compiler::debug::{dump_ir_json, format_module};
use tessera::runtime::abi::{decode, encode, record_type};
use tessera::runtime::ScratchMemory;
use tessera::types::StructField;
use tessera::{
    load, CompileOptions, Compiler, Dim, Dispatcher, EngineOptions, ExecutionPolicy, ScalarKind, Type,
    TypedValue,
};

fn sample() -> Module {
    let v3 = Type::Vector(Box::new(Type::F64), 3);
    module(vec![
        func(
            "poly",
            vec![param("x", Type::I32)],
            Type::I32,
            vec![
                let_mut_typed("acc", Type::I32, int(1)),
                let_mut_typed("i", Type::I32, int(0)),
                while_(
                    lt(var("i"), int(3)),
                    vec![
                        assign("acc", add(mul(var("acc"), var("x")), int(2))),
                        assign("i", add(var("i"), int(1))),
                    ],
                ),
                ret(var("acc")),
            ],
        ),
        func(
            "norm2",
            vec![param("v", v3)],
            Type::F64,
            vec![ret(intrinsic(Intrinsic::Dot, vec![var("v"), var("v")]))],
        ),
    ])
}

// =============================================================================
// LAYOUTS
// =============================================================================

#[test]
fn test_struct_layout_follows_declaration_order() {
    let s = Type::Struct(vec![
        StructField {
            name: "a".into(),
            ty: Type::U8,
        },
        StructField {
            name: "b".into(),
            ty: Type::F64,
        },
        StructField {
            name: "c".into(),
            ty: Type::I16,
        },
    ]);
    let layout = compute_layout(&s);
    assert_eq!(layout.field_offsets, vec![0, 8, 16]);
    assert_eq!(layout.size, 24);
    assert_eq!(layout.align, 8);
    assert_eq!(layout.storage, Storage::Struct);
    assert_eq!(compute_layout(&Type::unit()).size, 0);
}

#[test]
fn test_aggregate_layouts() {
    let c32 = compute_layout(&Type::complex(ScalarKind::F32));
    assert_eq!((c32.size, c32.align, c32.storage), (8, 4, Storage::Complex));

    let v3 = compute_layout(&Type::Vector(Box::new(Type::I16), 3));
    assert_eq!(v3.size, 6);
    assert_eq!(v3.storage, Storage::Inline { elem_size: 2, count: 3 });

    let dynamic = compute_layout(&Type::Tensor(Box::new(Type::F64), vec![Dim::Dynamic, Dim::Fixed(4)]));
    assert_eq!(dynamic.storage, Storage::Descriptor { rank: 2 });
    assert_eq!(dynamic.size, 24);
}

#[test]
fn test_layouts_stable_across_units() {
    let a = Compiler::new(CompileOptions::default()).compile(&sample()).unwrap();
    let b = Compiler::new(CompileOptions::default().opt_level(0)).compile(&sample()).unwrap();
    for (id, ty) in a.module.types.iter() {
        let la = a.layouts.layout_of(&a.module.types, id).unwrap();
        let other = b.module.types.lookup(ty).unwrap();
        let lb = b.layouts.layout_of(&b.module.types, other).unwrap();
        assert_eq!(la, lb, "layout of {} differs", ty);
        assert_eq!(*la, compute_layout(ty));
    }
}

#[test]
fn test_argument_record_encoding() {
    let unit = Compiler::new(CompileOptions::default())
        .compile(&module(vec![func(
            "pick",
            vec![param("tag", Type::U8), param("x", Type::F64)],
            Type::F64,
            vec![ret(var("x"))],
        )]))
        .unwrap();
    let record = record_type(&[Type::U8, Type::F64]);
    assert!(unit.module.types.lookup(&record).is_some());

    let layouts = unit.resolver();
    let value = TypedValue::structure(vec![("0", TypedValue::u8(7)), ("1", TypedValue::f64(1.5))]);
    assert_eq!(value.ty(), &record);
    let mut mem = ScratchMemory::new(0x1000, 1 << 12);
    let bytes = encode(&value, layouts, &mut mem).unwrap();
    assert_eq!(bytes.len(), 16);
    assert_eq!(bytes[0], 7);
    assert_eq!(&bytes[8..], &1.5f64.to_le_bytes());
    assert_eq!(decode(&record, &bytes, layouts, &mem).unwrap(), value);

    let memoized = layouts.of(&record);
    assert!(Arc::ptr_eq(&memoized, &unit.resolver().of(&record)));
}

// =============================================================================
// SERIALIZATION
// =============================================================================

#[test]
fn test_encoded_module_runs_identically() {
    let unit = Compiler::new(CompileOptions::default()).compile(&sample()).unwrap();
    let bytes = encode_module(&unit.module);
    assert_eq!(&bytes[..4], b"TSIR");

    let decoded = decode_module(&bytes).unwrap();
    assert_eq!(decoded, unit.module);
    assert_eq!(encode_module(&decoded), bytes);

    let reloaded = Compiler::new(CompileOptions::default()).compile_ir(decoded).unwrap();
    let options = EngineOptions::default().policy(ExecutionPolicy::InterpretOnly);
    let fresh = load(&sample(), options.clone()).unwrap();
    let restored = Dispatcher::new(Arc::new(reloaded), options);

    let args = vec![TypedValue::i32(3)];
    assert_eq!(
        restored.invoke_by_name("poly", args.clone()).unwrap(),
        fresh.invoke_by_name("poly", args).unwrap()
    );
    let v = vec![TypedValue::vector_f64(&[1.0, 2.0, 2.0])];
    assert_eq!(restored.invoke_by_name("norm2", v).unwrap(), TypedValue::f64(9.0));
}

#[test]
fn test_text_and_json_dumps() {
    let unit = Compiler::new(CompileOptions::default()).compile(&sample()).unwrap();
    let text = format_module(&unit.module);
    assert!(text.contains("poly"));
    assert!(text.contains("norm2"));
    let json = dump_ir_json(&unit.module).unwrap();
    let value: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert_eq!(value["functions"].as_array().unwrap().len(), 2);
}

#[test]
fn test_ast_json_round_trip() {
    let m = sample();
    let json = serde_json::to_string(&m).unwrap();
    let back: Module = serde_json::from_str(&json).unwrap();
    assert_eq!(back, m);
}
