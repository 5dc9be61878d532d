//! Constant initializer expressions: global values, data/element segment
//! offsets, and `funcref`/`externref` element items.
//!
//! The binary encoding of a `Value` is always a single constant instruction
//! followed by the `end` byte (`0x0b`); see `backend::binary`.

use crate::entity::{FunctionId, GlobalId};
use crate::ty::ValType;

/// A constant value usable anywhere the spec calls for a "value expression":
/// a global's initializer, a data/element segment's offset, or an element
/// segment's `funcref`/`externref` item.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    /// `ref.func $f`, or the null `funcref` if `None`.
    RefFunc(Option<FunctionId>),
    /// The null `externref` (there is no non-null externref literal).
    RefExternNull,
    /// `global.get $g` — only legal where the surrounding context allows an
    /// imported-immutable-global reference (enforced by the caller, not by
    /// this type).
    Global(GlobalId),
}

impl Value {
    /// The value type this constant produces, as seen by the type checker.
    pub fn ty(self) -> ValType {
        match self {
            Value::I32(_) => ValType::I32,
            Value::I64(_) => ValType::I64,
            Value::F32(_) => ValType::F32,
            Value::F64(_) => ValType::F64,
            Value::RefFunc(_) => ValType::RefFunc,
            Value::RefExternNull => ValType::RefExtern,
            // The type of a `global.get` value is resolved by the caller
            // against the referenced global's declared type; callers must
            // not rely on this method for `Value::Global`.
            Value::Global(_) => ValType::I32,
        }
    }
}
