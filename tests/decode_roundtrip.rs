//! Decodes and validates this crate's binary output through a conformant
//! WebAssembly decoder, directly exercising the property that a `wasmforge`
//! build produces bytes a real implementation accepts.

use wasmforge::backend::binary::BinaryModule;
use wasmforge::{ConstLiteral, Exchange, LocalOp, Module, OperandOp, Param, ValType};

fn validate(bytes: &[u8]) {
    wasmparser::validate(bytes).unwrap_or_else(|e| panic!("wasmparser rejected output: {e}"));
}

#[test]
fn empty_module_round_trips() {
    let mut backend = BinaryModule::new();
    let module = Module::new(&mut backend);
    module.close().unwrap();
    validate(&backend.output());
}

#[test]
fn add_function_round_trips() {
    let mut backend = BinaryModule::new();
    let mut module = Module::new(&mut backend);
    let sig = module
        .declare_prototype(
            "add",
            vec![Param::new(ValType::I32), Param::new(ValType::I32)],
            vec![ValType::I32],
        )
        .unwrap();
    let add = module
        .declare_function(Some("add"), sig, Exchange::export())
        .unwrap();

    let mut sink = module.open_sink(add).unwrap();
    let a = sink.param(0).unwrap();
    let b = sink.param(1).unwrap();
    sink.local_access(LocalOp::Get, a).unwrap();
    sink.local_access(LocalOp::Get, b).unwrap();
    sink.operand(OperandOp::Add, ValType::I32).unwrap();
    sink.close().unwrap();

    module.close().unwrap();
    validate(&backend.output());
}

#[test]
fn memory_table_global_and_segments_round_trip() {
    use wasmforge::{RefType, Value};

    let mut backend = BinaryModule::new();
    let mut module = Module::new(&mut backend);

    let memory = module
        .declare_memory(Some("mem"), wasmforge::Limit::new(1), Exchange::export())
        .unwrap();
    module
        .write_data(memory, Value::I32(0), b"hello".to_vec())
        .unwrap();

    let table = module
        .declare_table(Some("tbl"), RefType::Func, wasmforge::Limit::new(2), Exchange::none())
        .unwrap();

    let global = module
        .declare_global(Some("g"), ValType::I32, true, Exchange::none())
        .unwrap();
    module
        .set_global_value(global, Value::I32(7))
        .unwrap();

    let sig = module.declare_prototype("thunk", vec![], vec![]).unwrap();
    let f = module
        .declare_function(Some("thunk"), sig, Exchange::none())
        .unwrap();
    let mut sink = module.open_sink(f).unwrap();
    sink.close().unwrap();

    module
        .write_elements(table, Value::I32(0), vec![Value::RefFunc(Some(f))])
        .unwrap();

    module.close().unwrap();
    validate(&backend.output());
}

#[test]
fn bulk_memory_and_table_ops_round_trip() {
    use wasmforge::{MemoryOp, RefType, TableOp};

    let mut backend = BinaryModule::new();
    let mut module = Module::new(&mut backend);

    let mem_a = module.declare_memory(Some("a"), wasmforge::Limit::new(1), Exchange::none()).unwrap();
    let mem_b = module.declare_memory(Some("b"), wasmforge::Limit::new(1), Exchange::none()).unwrap();
    let tbl_a = module.declare_table(Some("ta"), RefType::Func, wasmforge::Limit::new(1), Exchange::none()).unwrap();
    let tbl_b = module.declare_table(Some("tb"), RefType::Func, wasmforge::Limit::new(1), Exchange::none()).unwrap();

    let sig = module.declare_prototype("bulk", vec![], vec![]).unwrap();
    let f = module.declare_function(Some("bulk"), sig, Exchange::none()).unwrap();
    let mut sink = module.open_sink(f).unwrap();
    sink.konst(ConstLiteral::I32(0)).unwrap();
    sink.konst(ConstLiteral::I32(0)).unwrap();
    sink.konst(ConstLiteral::I32(0)).unwrap();
    sink.memory_copy(mem_a, mem_b).unwrap();
    sink.konst(ConstLiteral::I32(0)).unwrap();
    sink.konst(ConstLiteral::I32(0)).unwrap();
    sink.konst(ConstLiteral::I32(0)).unwrap();
    sink.memory(MemoryOp::Fill, ValType::I32, mem_a, 0).unwrap();
    sink.konst(ConstLiteral::I32(0)).unwrap();
    sink.konst(ConstLiteral::I32(0)).unwrap();
    sink.konst(ConstLiteral::I32(0)).unwrap();
    sink.table_copy(tbl_a, tbl_b).unwrap();
    sink.table(TableOp::Size, tbl_a).unwrap();
    sink.simple(wasmforge::SimpleOp::Drop).unwrap();
    sink.close().unwrap();

    module.close().unwrap();
    validate(&backend.output());
}

#[test]
fn control_flow_round_trips() {
    let mut backend = BinaryModule::new();
    let mut module = Module::new(&mut backend);
    let sig = module
        .declare_prototype("choose", vec![Param::new(ValType::I32)], vec![ValType::I32])
        .unwrap();
    let f = module
        .declare_function(Some("choose"), sig, Exchange::export())
        .unwrap();

    let mut sink = module.open_sink(f).unwrap();
    let p0 = sink.param(0).unwrap();
    sink.local_access(LocalOp::Get, p0).unwrap();
    sink.with_if_then(
        &[],
        &[ValType::I32],
        None,
        |s| s.konst(ConstLiteral::I32(1)),
        Some(|s: &mut wasmforge::Sink<'_, '_>| s.konst(ConstLiteral::I32(0))),
    )
    .unwrap();
    sink.close().unwrap();

    module.close().unwrap();
    validate(&backend.output());
}
