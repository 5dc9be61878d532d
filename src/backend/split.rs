//! A backend that fans every call out to a fixed set of child backends.
//!
//! Grounded in `writer/split/{split-module,split-sink}.h/.cpp`: `Module`
//! there holds a `vector<ModuleInterface*>` and forwards every method to
//! each one in order; `Sink` does the same with `vector<SinkInterface*>`.
//! Useful for building a binary module and a text dump from one builder
//! pass.

use crate::entity::{FunctionId, GlobalId, MemoryId, PrototypeId, TableId};
use crate::inst::Instruction;
use crate::sink::ScopeKind;
use crate::ty::Limit;
use crate::value::Value;

use super::{
    FunctionView, GlobalView, MemoryView, ModuleBackend, PrototypeView, SinkBackend, TableView,
    TargetInfo,
};

/// Forwards every [`ModuleBackend`] call to each of its children, in order.
pub struct SplitModule {
    children: Vec<Box<dyn ModuleBackend>>,
}

impl SplitModule {
    pub fn new(children: Vec<Box<dyn ModuleBackend>>) -> Self {
        SplitModule { children }
    }
}

impl ModuleBackend for SplitModule {
    fn sink(&mut self, function: FunctionId) -> Box<dyn SinkBackend> {
        let sinks = self.children.iter_mut().map(|c| c.sink(function)).collect();
        Box::new(SplitSink { children: sinks })
    }

    fn add_prototype(&mut self, id: PrototypeId, view: &PrototypeView<'_>) {
        for c in &mut self.children {
            c.add_prototype(id, view);
        }
    }

    fn add_memory(&mut self, id: MemoryId, view: &MemoryView<'_>) {
        for c in &mut self.children {
            c.add_memory(id, view);
        }
    }

    fn add_table(&mut self, id: TableId, view: &TableView<'_>) {
        for c in &mut self.children {
            c.add_table(id, view);
        }
    }

    fn add_global(&mut self, id: GlobalId, view: &GlobalView<'_>) {
        for c in &mut self.children {
            c.add_global(id, view);
        }
    }

    fn add_function(&mut self, id: FunctionId, view: &FunctionView<'_>) {
        for c in &mut self.children {
            c.add_function(id, view);
        }
    }

    fn set_memory_limit(&mut self, id: MemoryId, limit: Limit) {
        for c in &mut self.children {
            c.set_memory_limit(id, limit);
        }
    }

    fn set_table_limit(&mut self, id: TableId, limit: Limit) {
        for c in &mut self.children {
            c.set_table_limit(id, limit);
        }
    }

    fn set_global_value(&mut self, id: GlobalId, value: &Value) {
        for c in &mut self.children {
            c.set_global_value(id, value);
        }
    }

    fn set_startup(&mut self, id: FunctionId) {
        for c in &mut self.children {
            c.set_startup(id);
        }
    }

    fn write_data(&mut self, memory: MemoryId, offset: &Value, bytes: &[u8]) {
        for c in &mut self.children {
            c.write_data(memory, offset, bytes);
        }
    }

    fn write_elements(&mut self, table: TableId, offset: &Value, values: &[Value]) {
        for c in &mut self.children {
            c.write_elements(table, offset, values);
        }
    }

    fn close(&mut self) {
        for c in &mut self.children {
            c.close();
        }
    }
}

/// Forwards every [`SinkBackend`] call to each of its children, in order.
struct SplitSink {
    children: Vec<Box<dyn SinkBackend>>,
}

impl SinkBackend for SplitSink {
    fn add_local(&mut self, ty: crate::ty::ValType) {
        for c in &mut self.children {
            c.add_local(ty);
        }
    }

    fn push_scope(&mut self, target: &TargetInfo<'_>) {
        for c in &mut self.children {
            c.push_scope(target);
        }
    }

    fn pop_scope(&mut self, kind: ScopeKind) {
        for c in &mut self.children {
            c.pop_scope(kind);
        }
    }

    fn toggle_conditional(&mut self) {
        for c in &mut self.children {
            c.toggle_conditional();
        }
    }

    fn add_comment(&mut self, text: &str) {
        for c in &mut self.children {
            c.add_comment(text);
        }
    }

    fn add_inst(&mut self, inst: &Instruction) {
        for c in &mut self.children {
            c.add_inst(inst);
        }
    }

    fn close(self: Box<Self>) {
        for c in self.children {
            c.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::binary::BinaryModule;
    use crate::module::{Exchange, Module};
    use crate::ty::{Param, ValType};

    #[test]
    fn forwards_to_every_child() {
        let a = BinaryModule::new();
        let b = BinaryModule::new();
        let a_handle = a.clone();
        let b_handle = b.clone();
        let children: Vec<Box<dyn ModuleBackend>> = vec![Box::new(a), Box::new(b)];
        let mut split = SplitModule::new(children);

        let mut module = Module::new(&mut split);
        let proto = module
            .declare_prototype("sig", vec![Param::new(ValType::I32)], vec![ValType::I32])
            .unwrap();
        module
            .declare_function(Some("f"), proto, Exchange::none())
            .unwrap();
        module.close().unwrap();

        assert_eq!(a_handle.output(), b_handle.output());
    }
}
