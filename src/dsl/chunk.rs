use std::fmt;
use std::rc::Rc;

use super::table::Key;
use super::value::Array;

/// Bytecode operations for the stack VM. Operands follow the opcode byte:
/// one byte for constant and slot indices and argument counts, two bytes
/// (big-endian) for jump offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    /// Push `constants[operand]`.
    Constant,
    /// Push the untyped empty array.
    Nil,
    /// Push `[true]`.
    True,
    /// Push `[false]`.
    False,
    /// Pop 1.
    Pop,
    /// Push `stack[slot_base + operand]`.
    GetLocal,
    /// Store the top of stack into `stack[slot_base + operand]` without popping.
    SetLocal,
    /// Push the global named by the key constant `operand`.
    GetGlobal,
    /// Pop into a new global named by the key constant `operand`.
    DefineGlobal,
    /// Store the top of stack into the global named by `operand`, creating it if absent.
    SetGlobal,
    /// Pop right, pop left, push the elementwise `left == right`.
    Equal,
    /// Pop right, pop left, push the elementwise `left > right`.
    Greater,
    /// Pop right, pop left, push the elementwise `left < right`.
    Less,
    /// Pop 2, push the broadcast sum.
    Add,
    /// Pop 2, push the broadcast difference.
    Subtract,
    /// Pop 2, push the broadcast product.
    Multiply,
    /// Pop 2, push the broadcast float quotient.
    Divide,
    /// Pop 1 boolean array, push its negation.
    Not,
    /// Pop 1, push it with every sign flipped.
    Negate,
    /// Pop 1, push its sum over the last axis.
    PreAdd,
    /// Pop 1, push its dims as an integer vector.
    GetDims,
    /// Pop 2, push the product summed over the last axis.
    DotProduct,
    /// Pop 1, push `[true]` if every element is truthy.
    All,
    /// Pop 1, push `[true]` if any element is truthy.
    Any,
    /// Pop indices, pop source, push the gathered elements.
    Lookup,
    /// Pop 1 and write it to the output.
    Print,
    /// Skip forward by the 16-bit operand. No stack effect.
    Jump,
    /// Skip forward by the 16-bit operand when the top of stack is falsy.
    /// Peeks; the condition stays on the stack.
    JumpIfFalse,
    /// Jump backward by the 16-bit operand. No stack effect.
    Loop,
    /// Operand: argument count. The callee and its arguments stay on the
    /// stack as the new frame's slots.
    Call,
    /// Pop the result, drop the frame's slots, push the result for the caller.
    Return,
}

impl OpCode {
    const ALL: [OpCode; 31] = [
        OpCode::Constant,
        OpCode::Nil,
        OpCode::True,
        OpCode::False,
        OpCode::Pop,
        OpCode::GetLocal,
        OpCode::SetLocal,
        OpCode::GetGlobal,
        OpCode::DefineGlobal,
        OpCode::SetGlobal,
        OpCode::Equal,
        OpCode::Greater,
        OpCode::Less,
        OpCode::Add,
        OpCode::Subtract,
        OpCode::Multiply,
        OpCode::Divide,
        OpCode::Not,
        OpCode::Negate,
        OpCode::PreAdd,
        OpCode::GetDims,
        OpCode::DotProduct,
        OpCode::All,
        OpCode::Any,
        OpCode::Lookup,
        OpCode::Print,
        OpCode::Jump,
        OpCode::JumpIfFalse,
        OpCode::Loop,
        OpCode::Call,
        OpCode::Return,
    ];

    /// Listing name, e.g. `OP_GET_LOCAL`.
    pub fn name(self) -> &'static str {
        match self {
            OpCode::Constant => "OP_CONSTANT",
            OpCode::Nil => "OP_NIL",
            OpCode::True => "OP_TRUE",
            OpCode::False => "OP_FALSE",
            OpCode::Pop => "OP_POP",
            OpCode::GetLocal => "OP_GET_LOCAL",
            OpCode::SetLocal => "OP_SET_LOCAL",
            OpCode::GetGlobal => "OP_GET_GLOBAL",
            OpCode::DefineGlobal => "OP_DEFINE_GLOBAL",
            OpCode::SetGlobal => "OP_SET_GLOBAL",
            OpCode::Equal => "OP_EQUAL",
            OpCode::Greater => "OP_GREATER",
            OpCode::Less => "OP_LESS",
            OpCode::Add => "OP_ADD",
            OpCode::Subtract => "OP_SUBTRACT",
            OpCode::Multiply => "OP_MULTIPLY",
            OpCode::Divide => "OP_DIVIDE",
            OpCode::Not => "OP_NOT",
            OpCode::Negate => "OP_NEGATE",
            OpCode::PreAdd => "OP_PRE_ADD",
            OpCode::GetDims => "OP_GET_DIMS",
            OpCode::DotProduct => "OP_DOT_PRODUCT",
            OpCode::All => "OP_ALL",
            OpCode::Any => "OP_ANY",
            OpCode::Lookup => "OP_LOOKUP",
            OpCode::Print => "OP_PRINT",
            OpCode::Jump => "OP_JUMP",
            OpCode::JumpIfFalse => "OP_JUMP_IF_FALSE",
            OpCode::Loop => "OP_LOOP",
            OpCode::Call => "OP_CALL",
            OpCode::Return => "OP_RETURN",
        }
    }
}

impl TryFrom<u8> for OpCode {
    type Error = u8;

    fn try_from(byte: u8) -> Result<Self, u8> {
        Self::ALL.get(usize::from(byte)).copied().ok_or(byte)
    }
}

impl From<OpCode> for u8 {
    fn from(op: OpCode) -> u8 {
        op as u8
    }
}

/// A compiled unit of bytecode with its line table and constant pool.
#[derive(Debug, Clone, Default)]
pub struct Chunk {
    pub code: Vec<u8>,
    /// `lines[i]` is the source line that produced `code[i]`.
    pub lines: Vec<usize>,
    pub constants: Vec<Rc<Array>>,
}

impl Chunk {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write(&mut self, byte: u8, line: usize) {
        self.code.push(byte);
        self.lines.push(line);
    }

    pub fn write_op(&mut self, op: OpCode, line: usize) {
        self.write(op.into(), line);
    }

    /// Append to the constant pool and return its index. Callers enforce the
    /// one-byte operand limit.
    pub fn add_constant(&mut self, value: Rc<Array>) -> usize {
        self.constants.push(value);
        self.constants.len() - 1
    }

    pub fn line_at(&self, offset: usize) -> usize {
        self.lines.get(offset).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }
}

/// A compiled function. The top-level script is a function with no name.
#[derive(Debug, Default)]
pub struct Function {
    pub arity: usize,
    pub chunk: Chunk,
    pub name: Option<Rc<Key>>,
}

impl Function {
    /// Name for traces and listings; `None` for the script.
    pub fn display_name(&self) -> Option<&str> {
        self.name.as_deref().map(Key::as_str)
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.display_name() {
            Some(name) => write!(f, "<fn {name}>"),
            None => f.write_str("<script>"),
        }
    }
}
