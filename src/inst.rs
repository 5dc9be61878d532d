//! Instruction descriptors: a tagged sum type covering every instruction the
//! validator understands and the binary encoder can serialize.
//!
//! Per the design notes, each instruction family is modeled as one variant
//! carrying exactly the fields both the validator and the encoder need; the
//! tag is never erased to a string or a dynamic object, so a new family can
//! only be added by extending this enum and exhaustively handling it on both
//! sides.

use crate::entity::{FunctionId, GlobalId, MemoryId, PrototypeId, TableId};
use crate::ty::ValType;

/// A numeric literal; the variant selects both the WebAssembly wire opcode
/// and the pushed operand type.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConstLiteral {
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
}

impl ConstLiteral {
    pub fn ty(self) -> ValType {
        match self {
            ConstLiteral::I32(_) => ValType::I32,
            ConstLiteral::I64(_) => ValType::I64,
            ConstLiteral::F32(_) => ValType::F32,
            ConstLiteral::F64(_) => ValType::F64,
        }
    }
}

/// The `select`-like instructions and other nullary/near-nullary ops whose
/// type rule does not depend on a width or operand-type parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimpleOp {
    Unreachable,
    Nop,
    Return,
    Drop,
    /// Untyped `select`: both options must already share a type.
    Select,
    /// Typed `select t`, constrained to exactly `ty`.
    SelectTyped(ValType),
    RefIsNull,
    RefNullFunc,
    RefNullExtern,
    /// `i64.extend_i32_s`
    ExtendI32Signed,
    /// `i64.extend_i32_u`
    ExtendI32Unsigned,
    /// `i32.wrap_i64`
    WrapI64,
    /// `f64.promote_f32`
    PromoteF32,
    /// `f32.demote_f64`
    DemoteF64,
}

/// Binary arithmetic/comparison operators that exist identically across all
/// four numeric types (`i32.add`, `i64.add`, `f32.add`, ... `i32.eq`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandOp {
    Equal,
    NotEqual,
    Add,
    Sub,
    Mul,
}

/// Operators whose opcode differs between the 32- and 64-bit member of their
/// numeric family (integer or float), modeled once and dispatched on `ty`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WidthOp {
    // integer family (valid ty: I32, I64)
    EqualZero,
    GreaterSigned,
    GreaterUnsigned,
    LessSigned,
    LessUnsigned,
    GreaterEqualSigned,
    GreaterEqualUnsigned,
    LessEqualSigned,
    LessEqualUnsigned,
    DivSigned,
    DivUnsigned,
    ModSigned,
    ModUnsigned,
    ConvertToF32Signed,
    ConvertToF32Unsigned,
    ConvertToF64Signed,
    ConvertToF64Unsigned,
    ConvertFromF32Signed,
    ConvertFromF32Unsigned,
    ConvertFromF64Signed,
    ConvertFromF64Unsigned,
    /// Non-trapping (saturating) counterparts, `FC 0x00`-`0x07`.
    ConvertFromF32SignedSaturating,
    ConvertFromF32UnsignedSaturating,
    ConvertFromF64SignedSaturating,
    ConvertFromF64UnsignedSaturating,
    ReinterpretAsFloat,
    BitAnd,
    BitOr,
    BitXor,
    ShiftLeft,
    ShiftRightSigned,
    ShiftRightUnsigned,
    RotateLeft,
    RotateRight,
    LeadingZeros,
    TrailingZeros,
    PopCount,
    // float family (valid ty: F32, F64)
    Greater,
    Less,
    GreaterEqual,
    LessEqual,
    Div,
    ReinterpretAsInt,
    Min,
    Max,
    Floor,
    Round,
    Ceil,
    Truncate,
    Absolute,
    Negate,
    SquareRoot,
    CopySign,
}

/// A memory access or bulk-memory operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryOp {
    /// `{i32,i64,f32,f64}.load`
    Load,
    Load8Signed,
    Load8Unsigned,
    Load16Signed,
    Load16Unsigned,
    /// `i64.load32_{s,u}` — only valid with `ty == I64`.
    Load32Signed,
    Load32Unsigned,
    /// `{i32,i64,f32,f64}.store`
    Store,
    Store8,
    Store16,
    /// `i64.store32` — only valid with `ty == I64`.
    Store32,
    Size,
    Grow,
    /// `memory.fill` — pops `i32, i32, i32` (destination, value, length); the
    /// two-memory `memory.copy` has its own [`Instruction::MemoryCopy`] shape.
    Fill,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableOp {
    Get,
    Set,
    Size,
    Grow,
    /// `table.fill` — the two-table `table.copy` has its own
    /// [`Instruction::TableCopy`] shape.
    Fill,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalOp {
    Get,
    Set,
    Tee,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GlobalOp {
    Get,
    Set,
}

/// A variable handle within a single [`crate::Sink`]: the index is only
/// meaningful together with the `function` it was issued for, mirroring how
/// [`crate::entity`] handles stamp themselves with their owning module. A
/// function is bound to at most one sink for its entire lifetime, so
/// `function` doubles as that sink's identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VariableId {
    pub(crate) function: FunctionId,
    pub(crate) index: u32,
}

impl VariableId {
    pub fn index(self) -> u32 {
        self.index
    }

    /// Does this handle originate from the sink bound to `function`?
    pub fn originates_from(self, function: FunctionId) -> bool {
        self.function == function
    }
}

/// One instruction fed into a [`crate::Sink`].
///
/// Branch instructions and everything that creates/closes a scope are *not*
/// instruction descriptors: scopes are managed through `Sink::open_*`/
/// `close_scope`/`toggle_else`, which notify the backend directly (see
/// `SinkBackend::push_scope`/`pop_scope`/`toggle_conditional`).
#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    Simple(SimpleOp),
    Const(ConstLiteral),
    Operand { op: OperandOp, ty: ValType },
    Width { op: WidthOp, ty: ValType },
    Memory { op: MemoryOp, ty: ValType, memory: MemoryId, offset: u32 },
    /// Destination memory first, source second — both the descriptor field
    /// order and the wire encoding agree (`memory.copy $dst $src`).
    MemoryCopy { destination: MemoryId, source: MemoryId },
    Table { op: TableOp, table: TableId },
    /// Destination table first, source second; see [`Instruction::MemoryCopy`].
    TableCopy { destination: TableId, source: TableId },
    Local { op: LocalOp, var: VariableId },
    Global { op: GlobalOp, global: GlobalId },
    RefFunc(FunctionId),
    Call(FunctionId),
    ReturnCall(FunctionId),
    CallIndirect { table: TableId, prototype: PrototypeId },
    ReturnCallIndirect { table: TableId, prototype: PrototypeId },
    /// Branch depth, counting outward from the innermost open scope (`0` is
    /// the innermost); resolved by the sink at the point the instruction is
    /// emitted, since closing scopes afterward would otherwise change it.
    Branch(u32),
    BranchIf(u32),
    BranchTable { targets: Vec<u32>, default: u32 },
}
