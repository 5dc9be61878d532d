//! The binary `.wasm` encoder: the one `ModuleBackend`/`SinkBackend` pair
//! every build in this crate ultimately bottoms out at.
//!
//! Grounded in `writer/binary/{binary-base,binary-module,binary-sink}.cpp`:
//! the section buffer shapes (`Section` vs `Deferred`), the numeric/string/
//! type encodings, and the full instruction opcode table are translated
//! here close to 1:1, with the C++ back-pointer (`binary::Module*` stored on
//! every `binary::Sink`) replaced by a shared `Rc<RefCell<_>>` — the scope
//! that pointer was valid for (the lifetime of one open [`crate::Sink`]) is
//! exactly what Rust's borrow checker already enforces on [`crate::Sink`]
//! itself, so the `RefCell` is never actually contended.

use std::cell::RefCell;
use std::rc::Rc;

use crate::entity::{FunctionId, GlobalId, MemoryId, PrototypeId, TableId};
use crate::inst::{Instruction, MemoryOp, OperandOp, SimpleOp, TableOp, WidthOp};
use crate::leb::{uleb128_len, write_sleb128, write_uleb128};
use crate::sink::ScopeKind;
use crate::ty::{RefType, ValType};
use crate::value::Value;

use super::{
    FunctionView, GlobalView, MemoryView, ModuleBackend, PrototypeView, SinkBackend, TableView,
    TargetInfo,
};

fn write_type(buf: &mut Vec<u8>, ty: ValType) {
    buf.push(ty.binary_tag());
}

fn write_limit(buf: &mut Vec<u8>, limit: crate::ty::Limit) {
    buf.push(if limit.max().is_some() { 0x01 } else { 0x00 });
    write_uleb128(buf, limit.min() as u64);
    if let Some(max) = limit.max() {
        write_uleb128(buf, max as u64);
    }
}

fn write_string(buf: &mut Vec<u8>, s: &str) {
    write_uleb128(buf, s.len() as u64);
    buf.extend_from_slice(s.as_bytes());
}

/// A constant expression, as used for a global initializer, a data/element
/// segment's offset, or a `funcref`/`externref` element item: one constant
/// instruction followed by `end` (`0x0b`).
fn write_value(buf: &mut Vec<u8>, value: &Value) {
    match *value {
        Value::I32(v) => {
            buf.push(0x41);
            write_sleb128(buf, v as i64);
        }
        Value::I64(v) => {
            buf.push(0x42);
            write_sleb128(buf, v);
        }
        Value::F32(v) => {
            buf.push(0x43);
            buf.extend_from_slice(&v.to_le_bytes());
        }
        Value::F64(v) => {
            buf.push(0x44);
            buf.extend_from_slice(&v.to_le_bytes());
        }
        Value::RefFunc(Some(f)) => {
            buf.push(0xd2);
            write_uleb128(buf, f.index() as u64);
        }
        Value::RefFunc(None) => {
            buf.push(0xd0);
            write_type(buf, ValType::RefFunc);
        }
        Value::RefExternNull => {
            buf.push(0xd0);
            write_type(buf, ValType::RefExtern);
        }
        Value::Global(g) => {
            buf.push(0x23);
            write_uleb128(buf, g.index() as u64);
        }
    }
    buf.push(0x0b);
}

/// A section written as a single accumulating buffer plus an element count:
/// type, import, function, export, element and data all have this shape —
/// every entry is fully known the moment it is added.
#[derive(Default)]
struct Section {
    buffer: Vec<u8>,
    count: u32,
}

/// A section whose entries are allocated up front but filled in across
/// multiple events: table/memory/global entries may have their limit or
/// initializer supplied by a later call, and a function's code entry is not
/// complete until its `Sink` closes. `index_offset` is the global entity
/// index of the first *non-imported* member (imports of the same kind are
/// written straight into the `import` section instead), so a later
/// `set_memory_limit`-style call can find its slot by `index - index_offset`.
#[derive(Default)]
struct Deferred {
    data: Vec<Vec<u8>>,
    index_offset: u32,
}

impl Deferred {
    fn alloc(&mut self, index: u32) -> usize {
        if self.data.is_empty() {
            self.index_offset = index;
        }
        self.data.push(Vec::new());
        self.data.len() - 1
    }

    fn slot(&mut self, index: u32) -> &mut Vec<u8> {
        let slot = (index - self.index_offset) as usize;
        &mut self.data[slot]
    }
}

struct Inner {
    prototype: Section,
    import: Section,
    function: Section,
    table: Deferred,
    memory: Deferred,
    global: Deferred,
    export: Section,
    start: Section,
    element: Section,
    code: Deferred,
    data: Section,
    table_ref_kinds: Vec<RefType>,
    output: Vec<u8>,
    closed: bool,
}

impl Inner {
    fn new() -> Self {
        Inner {
            prototype: Section::default(),
            import: Section::default(),
            function: Section::default(),
            table: Deferred::default(),
            memory: Deferred::default(),
            global: Deferred::default(),
            export: Section::default(),
            start: Section::default(),
            element: Section::default(),
            code: Deferred::default(),
            data: Section::default(),
            table_ref_kinds: Vec::new(),
            output: Vec::new(),
            closed: false,
        }
    }

    fn write_import(&mut self, import_module: &str, id: &str, kind: u8) {
        write_string(&mut self.import.buffer, import_module);
        write_string(&mut self.import.buffer, id);
        self.import.buffer.push(kind);
        self.import.count += 1;
    }

    fn write_export(&mut self, id: &str, kind: u8, index: u32) {
        write_string(&mut self.export.buffer, id);
        self.export.buffer.push(kind);
        write_uleb128(&mut self.export.buffer, index as u64);
        self.export.count += 1;
    }

    fn write_section(output: &mut Vec<u8>, section: &Section, place_count: bool, id: u8) {
        if section.count == 0 {
            return;
        }
        output.push(id);
        let mut size = section.buffer.len() as u64;
        if place_count {
            size += uleb128_len(section.count as u64) as u64;
        }
        write_uleb128(output, size);
        if place_count {
            write_uleb128(output, section.count as u64);
        }
        output.extend_from_slice(&section.buffer);
    }

    fn write_deferred(output: &mut Vec<u8>, deferred: &Deferred, place_slot_size: bool, id: u8) {
        if deferred.data.is_empty() {
            return;
        }
        output.push(id);
        let mut size = 0u64;
        for slot in &deferred.data {
            size += slot.len() as u64;
            if place_slot_size {
                size += uleb128_len(slot.len() as u64) as u64;
            }
        }
        size += uleb128_len(deferred.data.len() as u64) as u64;
        write_uleb128(output, size);
        write_uleb128(output, deferred.data.len() as u64);
        for slot in &deferred.data {
            if place_slot_size {
                write_uleb128(output, slot.len() as u64);
            }
            output.extend_from_slice(slot);
        }
    }

    fn close(&mut self) {
        self.output
            .extend_from_slice(&[0x00, 0x61, 0x73, 0x6d, 0x01, 0x00, 0x00, 0x00]);
        let mut out = std::mem::take(&mut self.output);
        Self::write_section(&mut out, &self.prototype, true, 0x01);
        Self::write_section(&mut out, &self.import, true, 0x02);
        Self::write_section(&mut out, &self.function, true, 0x03);
        Self::write_deferred(&mut out, &self.table, false, 0x04);
        Self::write_deferred(&mut out, &self.memory, false, 0x05);
        Self::write_deferred(&mut out, &self.global, false, 0x06);
        Self::write_section(&mut out, &self.export, true, 0x07);
        Self::write_section(&mut out, &self.start, false, 0x08);
        Self::write_section(&mut out, &self.element, true, 0x09);
        Self::write_deferred(&mut out, &self.code, true, 0x0a);
        Self::write_section(&mut out, &self.data, true, 0x0b);
        self.output = out;
        self.closed = true;
        log::debug!("binary module closed, {} bytes emitted", self.output.len());
    }
}

/// The binary-encoding [`ModuleBackend`]. Shares its section state with the
/// [`BinarySink`]s it hands out via `Rc<RefCell<_>>` — see the module docs
/// for why this is sound despite `Sink`'s methods taking `&mut self`.
pub struct BinaryModule {
    inner: Rc<RefCell<Inner>>,
}

impl BinaryModule {
    pub fn new() -> Self {
        BinaryModule {
            inner: Rc::new(RefCell::new(Inner::new())),
        }
    }

    /// The assembled module bytes. Panics if called before the owning
    /// [`crate::Module`] has been closed.
    pub fn output(&self) -> Vec<u8> {
        let inner = self.inner.borrow();
        assert!(
            inner.closed,
            "binary output requested before the module was closed"
        );
        inner.output.clone()
    }
}

impl Default for BinaryModule {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for BinaryModule {
    /// A cheap handle clone: the clone shares the same underlying section
    /// state, so `output()` on either one after `close()` sees the same
    /// bytes. Lets a caller hand one `BinaryModule` into a [`super::split::SplitModule`]
    /// while keeping a handle to read its output back afterward.
    fn clone(&self) -> Self {
        BinaryModule {
            inner: self.inner.clone(),
        }
    }
}

impl ModuleBackend for BinaryModule {
    fn sink(&mut self, function: FunctionId) -> Box<dyn SinkBackend> {
        let slot = {
            let mut inner = self.inner.borrow_mut();
            (function.index() - inner.code.index_offset) as usize
        };
        Box::new(BinarySink {
            module: self.inner.clone(),
            slot,
            locals: Vec::new(),
            code: Vec::new(),
        })
    }

    fn add_prototype(&mut self, _id: PrototypeId, view: &PrototypeView<'_>) {
        let mut inner = self.inner.borrow_mut();
        inner.prototype.buffer.push(0x60);
        inner.prototype.count += 1;
        write_uleb128(&mut inner.prototype.buffer, view.params.len() as u64);
        for p in view.params {
            let ty = p.ty;
            write_type(&mut inner.prototype.buffer, ty);
        }
        write_uleb128(&mut inner.prototype.buffer, view.results.len() as u64);
        for &ty in view.results {
            write_type(&mut inner.prototype.buffer, ty);
        }
    }

    fn add_memory(&mut self, id: MemoryId, view: &MemoryView<'_>) {
        let mut inner = self.inner.borrow_mut();
        if view.exported {
            inner.write_export(view.id.unwrap(), 0x02, id.index());
        }
        if let Some(module) = view.import_module {
            inner.write_import(module, view.id.unwrap(), 0x02);
            write_limit(&mut inner.import.buffer, view.limit);
        } else {
            let slot = inner.memory.alloc(id.index());
            if view.limit.is_valid() {
                let limit = view.limit;
                write_limit(&mut inner.memory.data[slot], limit);
            }
        }
    }

    fn add_table(&mut self, id: TableId, view: &TableView<'_>) {
        let mut inner = self.inner.borrow_mut();
        inner.table_ref_kinds.push(view.ref_kind);
        if view.exported {
            inner.write_export(view.id.unwrap(), 0x01, id.index());
        }
        let tag = if view.ref_kind == RefType::Func {
            0x70
        } else {
            0x6f
        };
        if let Some(module) = view.import_module {
            inner.write_import(module, view.id.unwrap(), 0x01);
            inner.import.buffer.push(tag);
            let limit = view.limit;
            write_limit(&mut inner.import.buffer, limit);
        } else {
            let slot = inner.table.alloc(id.index());
            inner.table.data[slot].push(tag);
            if view.limit.is_valid() {
                let limit = view.limit;
                write_limit(&mut inner.table.data[slot], limit);
            }
        }
    }

    fn add_global(&mut self, id: GlobalId, view: &GlobalView<'_>) {
        let mut inner = self.inner.borrow_mut();
        if view.exported {
            inner.write_export(view.id.unwrap(), 0x03, id.index());
        }
        if let Some(module) = view.import_module {
            inner.write_import(module, view.id.unwrap(), 0x03);
            let ty = view.val_type;
            write_type(&mut inner.import.buffer, ty);
            inner.import.buffer.push(view.mutating as u8);
        } else {
            let slot = inner.global.alloc(id.index());
            let ty = view.val_type;
            write_type(&mut inner.global.data[slot], ty);
            inner.global.data[slot].push(view.mutating as u8);
        }
    }

    fn add_function(&mut self, id: FunctionId, view: &FunctionView<'_>) {
        let mut inner = self.inner.borrow_mut();
        if view.exported {
            inner.write_export(view.id.unwrap(), 0x00, id.index());
        }
        if let Some(module) = view.import_module {
            inner.write_import(module, view.id.unwrap(), 0x00);
            let idx = view.prototype.index() as u64;
            write_uleb128(&mut inner.import.buffer, idx);
        } else {
            inner.code.alloc(id.index());
            inner.function.count += 1;
            let idx = view.prototype.index() as u64;
            write_uleb128(&mut inner.function.buffer, idx);
        }
    }

    fn set_memory_limit(&mut self, id: MemoryId, limit: crate::ty::Limit) {
        let mut inner = self.inner.borrow_mut();
        let slot = inner.memory.slot(id.index());
        write_limit(slot, limit);
    }

    fn set_table_limit(&mut self, id: TableId, limit: crate::ty::Limit) {
        let mut inner = self.inner.borrow_mut();
        let slot = inner.table.slot(id.index());
        write_limit(slot, limit);
    }

    fn set_global_value(&mut self, id: GlobalId, value: &Value) {
        let mut inner = self.inner.borrow_mut();
        let slot = inner.global.slot(id.index());
        write_value(slot, value);
    }

    fn set_startup(&mut self, id: FunctionId) {
        let mut inner = self.inner.borrow_mut();
        inner.start.count += 1;
        write_uleb128(&mut inner.start.buffer, id.index() as u64);
    }

    fn write_data(&mut self, memory: MemoryId, offset: &Value, bytes: &[u8]) {
        let mut inner = self.inner.borrow_mut();
        inner.data.count += 1;
        inner.data.buffer.push(0x02);
        write_uleb128(&mut inner.data.buffer, memory.index() as u64);
        write_value(&mut inner.data.buffer, offset);
        write_uleb128(&mut inner.data.buffer, bytes.len() as u64);
        inner.data.buffer.extend_from_slice(bytes);
    }

    fn write_elements(&mut self, table: TableId, offset: &Value, values: &[Value]) {
        let mut inner = self.inner.borrow_mut();
        let all_functions = values
            .iter()
            .all(|v| matches!(v, Value::RefFunc(Some(_))));
        let ref_kind = inner.table_ref_kinds[table.index() as usize];

        inner.element.count += 1;
        inner.element.buffer.push(if all_functions { 0x02 } else { 0x06 });
        write_uleb128(&mut inner.element.buffer, table.index() as u64);
        write_value(&mut inner.element.buffer, offset);
        if all_functions {
            inner.element.buffer.push(0x00);
        } else {
            write_type(&mut inner.element.buffer, ref_kind.val_type());
        }
        write_uleb128(&mut inner.element.buffer, values.len() as u64);
        if all_functions {
            for v in values {
                if let Value::RefFunc(Some(f)) = v {
                    write_uleb128(&mut inner.element.buffer, f.index() as u64);
                }
            }
        } else {
            for v in values {
                write_value(&mut inner.element.buffer, v);
            }
        }
    }

    fn close(&mut self) {
        self.inner.borrow_mut().close();
    }
}

struct Local {
    count: u32,
    ty: ValType,
}

/// The binary-encoding [`SinkBackend`]: one per open [`crate::Sink`].
/// Accumulates its locals and instruction bytes locally, then writes both
/// into the owning module's pre-allocated code slot on `close`.
struct BinarySink {
    module: Rc<RefCell<Inner>>,
    slot: usize,
    locals: Vec<Local>,
    code: Vec<u8>,
}

impl BinarySink {
    fn push(&mut self, byte: u8) {
        self.code.push(byte);
    }

    fn push_bytes(&mut self, bytes: &[u8]) {
        self.code.extend_from_slice(bytes);
    }

    fn push_width(&mut self, is_32: bool, op32: u8, op64: u8) {
        self.push(if is_32 { op32 } else { op64 });
    }

    fn push_select(&mut self, ty: ValType, i32_op: u8, i64_op: u8, f32_op: u8, f64_op: u8) {
        self.push(match ty {
            ValType::I32 => i32_op,
            ValType::I64 => i64_op,
            ValType::F32 => f32_op,
            ValType::F64 => f64_op,
            ValType::RefFunc | ValType::RefExtern => {
                unreachable!("operand/width ops are never applied to reference types")
            }
        });
    }
}

impl SinkBackend for BinarySink {
    fn add_local(&mut self, ty: ValType) {
        if let Some(last) = self.locals.last_mut() {
            if last.ty == ty {
                last.count += 1;
                return;
            }
        }
        self.locals.push(Local { count: 1, ty });
    }

    fn push_scope(&mut self, target: &TargetInfo<'_>) {
        self.push(match target.kind {
            ScopeKind::Conditional => 0x04,
            ScopeKind::Loop => 0x03,
            ScopeKind::Block => 0x02,
        });
        if target.params.is_empty() && target.results.is_empty() {
            self.push(0x40);
        } else if target.params.is_empty() && target.results.len() == 1 {
            self.push(target.results[0].binary_tag());
        } else {
            let idx = target.prototype.index() as i64;
            write_sleb128(&mut self.code, idx);
        }
    }

    fn pop_scope(&mut self, _kind: ScopeKind) {
        self.push(0x0b);
    }

    fn toggle_conditional(&mut self) {
        self.push(0x05);
    }

    fn add_inst(&mut self, inst: &Instruction) {
        match *inst {
            Instruction::Simple(op) => self.add_simple(op),
            Instruction::Const(lit) => self.add_const(lit),
            Instruction::Operand { op, ty } => self.add_operand(op, ty),
            Instruction::Width { op, ty } => self.add_width(op, ty),
            Instruction::Memory { op, ty, memory, offset } => self.add_memory(op, ty, memory, offset),
            Instruction::MemoryCopy { destination, source } => {
                self.push_bytes(&[0xfc, 0x0a]);
                write_uleb128(&mut self.code, destination.index() as u64);
                write_uleb128(&mut self.code, source.index() as u64);
            }
            Instruction::Table { op, table } => self.add_table(op, table),
            Instruction::TableCopy { destination, source } => {
                self.push_bytes(&[0xfc, 0x0e]);
                write_uleb128(&mut self.code, destination.index() as u64);
                write_uleb128(&mut self.code, source.index() as u64);
            }
            Instruction::Local { op, var } => {
                self.push(match op {
                    crate::inst::LocalOp::Get => 0x20,
                    crate::inst::LocalOp::Set => 0x21,
                    crate::inst::LocalOp::Tee => 0x22,
                });
                write_uleb128(&mut self.code, var.index() as u64);
            }
            Instruction::Global { op, global } => {
                self.push(match op {
                    crate::inst::GlobalOp::Get => 0x23,
                    crate::inst::GlobalOp::Set => 0x24,
                });
                write_uleb128(&mut self.code, global.index() as u64);
            }
            Instruction::RefFunc(function) => {
                self.push(0xd2);
                write_uleb128(&mut self.code, function.index() as u64);
            }
            Instruction::Call(function) => {
                self.push(0x10);
                write_uleb128(&mut self.code, function.index() as u64);
            }
            Instruction::ReturnCall(function) => {
                self.push(0x12);
                write_uleb128(&mut self.code, function.index() as u64);
            }
            Instruction::CallIndirect { table, prototype } => {
                self.push(0x11);
                write_uleb128(&mut self.code, prototype.index() as u64);
                write_uleb128(&mut self.code, table.index() as u64);
            }
            Instruction::ReturnCallIndirect { table, prototype } => {
                self.push(0x13);
                write_uleb128(&mut self.code, prototype.index() as u64);
                write_uleb128(&mut self.code, table.index() as u64);
            }
            Instruction::Branch(depth) => {
                self.push(0x0c);
                write_uleb128(&mut self.code, depth as u64);
            }
            Instruction::BranchIf(depth) => {
                self.push(0x0d);
                write_uleb128(&mut self.code, depth as u64);
            }
            Instruction::BranchTable { ref targets, default } => {
                self.push(0x0e);
                write_uleb128(&mut self.code, targets.len() as u64);
                for &t in targets {
                    write_uleb128(&mut self.code, t as u64);
                }
                write_uleb128(&mut self.code, default as u64);
            }
        }
    }

    fn close(self: Box<Self>) {
        let mut inner = self.module.borrow_mut();
        let buffer = &mut inner.code.data[self.slot];
        write_uleb128(buffer, self.locals.len() as u64);
        for local in &self.locals {
            write_uleb128(buffer, local.count as u64);
            buffer.push(local.ty.binary_tag());
        }
        buffer.extend_from_slice(&self.code);
        buffer.push(0x0b);
    }
}

impl BinarySink {
    fn add_simple(&mut self, op: SimpleOp) {
        match op {
            SimpleOp::Unreachable => self.push(0x00),
            SimpleOp::Nop => self.push(0x01),
            SimpleOp::Return => self.push(0x0f),
            SimpleOp::Drop => self.push(0x1a),
            SimpleOp::Select => self.push(0x1b),
            SimpleOp::SelectTyped(ty) => self.push_bytes(&[0x1c, 0x01, ty.binary_tag()]),
            SimpleOp::RefIsNull => self.push(0xd1),
            SimpleOp::RefNullFunc => self.push_bytes(&[0xd0, ValType::RefFunc.binary_tag()]),
            SimpleOp::RefNullExtern => self.push_bytes(&[0xd0, ValType::RefExtern.binary_tag()]),
            SimpleOp::ExtendI32Signed => self.push(0xac),
            SimpleOp::ExtendI32Unsigned => self.push(0xad),
            SimpleOp::WrapI64 => self.push(0xa7),
            SimpleOp::PromoteF32 => self.push(0xbb),
            SimpleOp::DemoteF64 => self.push(0xb6),
        }
    }

    fn add_const(&mut self, lit: crate::inst::ConstLiteral) {
        use crate::inst::ConstLiteral::*;
        match lit {
            I32(v) => {
                self.push(0x41);
                write_sleb128(&mut self.code, v as i64);
            }
            I64(v) => {
                self.push(0x42);
                write_sleb128(&mut self.code, v);
            }
            F32(v) => {
                self.push(0x43);
                self.push_bytes(&v.to_le_bytes());
            }
            F64(v) => {
                self.push(0x44);
                self.push_bytes(&v.to_le_bytes());
            }
        }
    }

    fn add_operand(&mut self, op: OperandOp, ty: ValType) {
        match op {
            OperandOp::Equal => self.push_select(ty, 0x46, 0x51, 0x5b, 0x61),
            OperandOp::NotEqual => self.push_select(ty, 0x47, 0x52, 0x5c, 0x62),
            OperandOp::Add => self.push_select(ty, 0x6a, 0x7c, 0x92, 0xa0),
            OperandOp::Sub => self.push_select(ty, 0x6b, 0x7d, 0x93, 0xa1),
            OperandOp::Mul => self.push_select(ty, 0x6c, 0x7e, 0x94, 0xa2),
        }
    }

    fn add_width(&mut self, op: WidthOp, ty: ValType) {
        use WidthOp::*;
        let is_32 = matches!(ty, ValType::I32 | ValType::F32);
        match op {
            EqualZero => self.push_width(is_32, 0x45, 0x50),
            GreaterSigned => self.push_width(is_32, 0x4a, 0x55),
            GreaterUnsigned => self.push_width(is_32, 0x4b, 0x56),
            LessSigned => self.push_width(is_32, 0x48, 0x53),
            LessUnsigned => self.push_width(is_32, 0x49, 0x54),
            GreaterEqualSigned => self.push_width(is_32, 0x4e, 0x59),
            GreaterEqualUnsigned => self.push_width(is_32, 0x4f, 0x5a),
            LessEqualSigned => self.push_width(is_32, 0x4c, 0x57),
            LessEqualUnsigned => self.push_width(is_32, 0x4d, 0x58),
            DivSigned => self.push_width(is_32, 0x6d, 0x7f),
            DivUnsigned => self.push_width(is_32, 0x6e, 0x80),
            ModSigned => self.push_width(is_32, 0x6f, 0x81),
            ModUnsigned => self.push_width(is_32, 0x70, 0x82),
            ConvertToF32Signed => self.push_width(is_32, 0xb2, 0xb4),
            ConvertToF32Unsigned => self.push_width(is_32, 0xb3, 0xb5),
            ConvertToF64Signed => self.push_width(is_32, 0xb7, 0xb9),
            ConvertToF64Unsigned => self.push_width(is_32, 0xb8, 0xba),
            ConvertFromF32Signed => self.push_width(is_32, 0xa8, 0xae),
            ConvertFromF32Unsigned => self.push_width(is_32, 0xa9, 0xaf),
            ConvertFromF64Signed => self.push_width(is_32, 0xaa, 0xb0),
            ConvertFromF64Unsigned => self.push_width(is_32, 0xab, 0xb1),
            ConvertFromF32SignedSaturating => self.push_bytes(&[0xfc, if is_32 { 0x00 } else { 0x04 }]),
            ConvertFromF32UnsignedSaturating => self.push_bytes(&[0xfc, if is_32 { 0x01 } else { 0x05 }]),
            ConvertFromF64SignedSaturating => self.push_bytes(&[0xfc, if is_32 { 0x02 } else { 0x06 }]),
            ConvertFromF64UnsignedSaturating => self.push_bytes(&[0xfc, if is_32 { 0x03 } else { 0x07 }]),
            ReinterpretAsFloat => self.push_width(is_32, 0xbe, 0xbf),
            BitAnd => self.push_width(is_32, 0x71, 0x83),
            BitOr => self.push_width(is_32, 0x72, 0x84),
            BitXor => self.push_width(is_32, 0x73, 0x85),
            ShiftLeft => self.push_width(is_32, 0x74, 0x86),
            ShiftRightSigned => self.push_width(is_32, 0x75, 0x87),
            ShiftRightUnsigned => self.push_width(is_32, 0x76, 0x88),
            RotateLeft => self.push_width(is_32, 0x77, 0x89),
            RotateRight => self.push_width(is_32, 0x78, 0x8a),
            LeadingZeros => self.push_width(is_32, 0x67, 0x79),
            TrailingZeros => self.push_width(is_32, 0x68, 0x7a),
            PopCount => self.push_width(is_32, 0x69, 0x7b),
            Greater => self.push_width(is_32, 0x5e, 0x64),
            Less => self.push_width(is_32, 0x5d, 0x63),
            GreaterEqual => self.push_width(is_32, 0x60, 0x66),
            LessEqual => self.push_width(is_32, 0x5f, 0x65),
            Div => self.push_width(is_32, 0x95, 0xa3),
            ReinterpretAsInt => self.push_width(is_32, 0xbc, 0xbd),
            Min => self.push_width(is_32, 0x96, 0xa4),
            Max => self.push_width(is_32, 0x97, 0xa5),
            Floor => self.push_width(is_32, 0x8e, 0x9c),
            Round => self.push_width(is_32, 0x90, 0x9e),
            Ceil => self.push_width(is_32, 0x8d, 0x9b),
            Truncate => self.push_width(is_32, 0x8f, 0x9d),
            Absolute => self.push_width(is_32, 0x8b, 0x99),
            Negate => self.push_width(is_32, 0x8c, 0x9a),
            SquareRoot => self.push_width(is_32, 0x91, 0x9f),
            CopySign => self.push_width(is_32, 0x98, 0xa6),
        }
    }

    fn add_memory(&mut self, op: MemoryOp, ty: ValType, memory: MemoryId, offset: u32) {
        use MemoryOp::*;
        let mut writes_memory_and_offset = true;
        match op {
            Load => self.push_select(ty, 0x28, 0x29, 0x2a, 0x2b),
            Load8Unsigned => self.push_width(ty == ValType::I32, 0x2d, 0x31),
            Load8Signed => self.push_width(ty == ValType::I32, 0x2c, 0x30),
            Load16Unsigned => self.push_width(ty == ValType::I32, 0x2f, 0x33),
            Load16Signed => self.push_width(ty == ValType::I32, 0x2e, 0x32),
            Load32Unsigned => self.push(0x35),
            Load32Signed => self.push(0x34),
            Store => self.push_select(ty, 0x36, 0x37, 0x38, 0x39),
            Store8 => self.push_width(ty == ValType::I32, 0x3a, 0x3c),
            Store16 => self.push_width(ty == ValType::I32, 0x3b, 0x3d),
            Store32 => self.push(0x3e),
            Size => {
                self.push(0x3f);
                write_uleb128(&mut self.code, memory.index() as u64);
                writes_memory_and_offset = false;
            }
            Grow => {
                self.push(0x40);
                write_uleb128(&mut self.code, memory.index() as u64);
                writes_memory_and_offset = false;
            }
            Fill => {
                self.push_bytes(&[0xfc, 0x0b]);
                write_uleb128(&mut self.code, memory.index() as u64);
                writes_memory_and_offset = false;
            }
        }
        if writes_memory_and_offset {
            if memory.index() != 0 {
                self.push(0x40);
                write_uleb128(&mut self.code, memory.index() as u64);
            } else {
                self.push(0x00);
            }
            write_uleb128(&mut self.code, offset as u64);
        }
    }

    fn add_table(&mut self, op: TableOp, table: TableId) {
        match op {
            TableOp::Get => self.push(0x25),
            TableOp::Set => self.push(0x26),
            TableOp::Size => self.push_bytes(&[0xfc, 0x10]),
            TableOp::Grow => self.push_bytes(&[0xfc, 0x0f]),
            TableOp::Fill => self.push_bytes(&[0xfc, 0x11]),
        }
        write_uleb128(&mut self.code, table.index() as u64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::{Exchange, Module};
    use crate::ty::{Limit, Param, ValType};

    #[test]
    fn empty_module() {
        let mut backend = BinaryModule::new();
        let module = Module::new(&mut backend);
        module.close().unwrap();
        assert_eq!(
            backend.output(),
            vec![0x00, 0x61, 0x73, 0x6d, 0x01, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn identity_function() {
        let mut backend = BinaryModule::new();
        let mut module = Module::new(&mut backend);
        let proto = module
            .declare_prototype(
                "id-sig",
                vec![Param::new(ValType::I32)],
                vec![ValType::I32],
            )
            .unwrap();
        let id = module
            .declare_function(Some("id"), proto, Exchange::none())
            .unwrap();
        let mut sink = module.open_sink(id).unwrap();
        let p0 = sink.param(0).unwrap();
        sink.local_access(crate::inst::LocalOp::Get, p0).unwrap();
        sink.close().unwrap();
        module.close().unwrap();

        let out = backend.output();
        // magic + version, type section, function section, code section
        assert!(out.starts_with(&[0x00, 0x61, 0x73, 0x6d, 0x01, 0x00, 0x00, 0x00]));
        // the code section's single body is `00 20 00 0b` (no locals, local.get 0, end)
        let code_body = [0x00u8, 0x20, 0x00, 0x0b];
        assert!(out.windows(code_body.len()).any(|w| w == code_body));
    }

    #[test]
    fn exported_constant_function() {
        let mut backend = BinaryModule::new();
        let mut module = Module::new(&mut backend);
        let proto = module
            .declare_prototype("k-sig", vec![], vec![ValType::I32])
            .unwrap();
        let k = module
            .declare_function(Some("k"), proto, Exchange::export())
            .unwrap();
        let mut sink = module.open_sink(k).unwrap();
        sink.konst(crate::inst::ConstLiteral::I32(42)).unwrap();
        sink.close().unwrap();
        module.close().unwrap();

        let out = backend.output();
        let export_entry = [0x01u8, 0x6b, 0x00, 0x00];
        assert!(out.windows(export_entry.len()).any(|w| w == export_entry));
        let code_body = [0x00u8, 0x41, 0x2a, 0x0b];
        assert!(out.windows(code_body.len()).any(|w| w == code_body));
    }

    #[test]
    fn block_with_result() {
        let mut backend = BinaryModule::new();
        let mut module = Module::new(&mut backend);
        let proto = module
            .declare_prototype("blk-sig", vec![], vec![ValType::I32])
            .unwrap();
        let f = module
            .declare_function(Some("blk"), proto, Exchange::none())
            .unwrap();
        let mut sink = module.open_sink(f).unwrap();
        let target = sink.open_block(&[], &[ValType::I32], None).unwrap();
        sink.konst(crate::inst::ConstLiteral::I32(7)).unwrap();
        sink.close_scope(target).unwrap();
        sink.close().unwrap();
        module.close().unwrap();

        let out = backend.output();
        let code_body = [0x00u8, 0x02, 0x7f, 0x41, 0x07, 0x0b, 0x0b];
        assert!(out.windows(code_body.len()).any(|w| w == code_body));
    }

    #[test]
    fn memory_without_limit_fails_close() {
        let mut backend = BinaryModule::new();
        let mut module = Module::new(&mut backend);
        module
            .declare_memory(Some("mem"), Limit::unset(), Exchange::none())
            .unwrap();
        let err = module.close().unwrap_err();
        assert!(matches!(err, crate::error::Error::Structural { .. }));
    }

    /// `f32.reinterpret_i32`/`f64.reinterpret_i64` and their inverses are easy
    /// to transpose since both directions share one `WidthOp` pair; pin the
    /// four bytes down directly rather than relying on a decoder to catch a
    /// swap.
    #[test]
    fn reinterpret_opcodes_are_not_swapped() {
        let mut backend = BinaryModule::new();
        let mut module = Module::new(&mut backend);
        let proto = module
            .declare_prototype("reinterpret", vec![Param::new(ValType::I32)], vec![ValType::I32])
            .unwrap();
        let f = module
            .declare_function(Some("reinterpret"), proto, Exchange::none())
            .unwrap();
        let mut sink = module.open_sink(f).unwrap();
        let p0 = sink.param(0).unwrap();
        sink.local_access(crate::inst::LocalOp::Get, p0).unwrap();
        sink.width(crate::inst::WidthOp::ReinterpretAsFloat, ValType::I32).unwrap();
        sink.width(crate::inst::WidthOp::ReinterpretAsInt, ValType::F32).unwrap();
        sink.close().unwrap();
        module.close().unwrap();

        let out = backend.output();
        // local.get 0, f32.reinterpret_i32 (0xbe), i32.reinterpret_f32 (0xbc), end
        let code_body = [0x00u8, 0x20, 0x00, 0xbe, 0xbc, 0x0b];
        assert!(out.windows(code_body.len()).any(|w| w == code_body));
    }

    /// Non-trapping (saturating) float-to-int conversions live at `FC 0x00`
    /// through `FC 0x07`; the four sub-opcodes pair (target width, source
    /// width, signedness) in a way that's easy to get backwards.
    #[test]
    fn saturating_trunc_opcodes_match_the_proposal_table() {
        let mut backend = BinaryModule::new();
        let mut module = Module::new(&mut backend);
        let proto = module
            .declare_prototype("sat", vec![Param::new(ValType::F32)], vec![ValType::I64])
            .unwrap();
        let f = module
            .declare_function(Some("sat"), proto, Exchange::none())
            .unwrap();
        let mut sink = module.open_sink(f).unwrap();
        let p0 = sink.param(0).unwrap();
        sink.local_access(crate::inst::LocalOp::Get, p0).unwrap();
        sink.width(crate::inst::WidthOp::ConvertFromF32SignedSaturating, ValType::I64).unwrap();
        sink.close().unwrap();
        module.close().unwrap();

        let out = backend.output();
        // local.get 0, i64.trunc_sat_f32_s (FC 0x04), end
        let code_body = [0x00u8, 0x20, 0x00, 0xfc, 0x04, 0x0b];
        assert!(out.windows(code_body.len()).any(|w| w == code_body));
    }
}
