//! Human-readable bytecode listings for `--print-code` and execution traces.

use std::fmt::Write;

use super::chunk::{Chunk, Function, OpCode};

/// Full listing of `chunk` under a `== name ==` header.
pub fn disassemble_chunk(chunk: &Chunk, name: &str) -> String {
    let mut out = format!("== {name} ==\n");
    let mut offset = 0;
    while offset < chunk.len() {
        let (line, next) = disassemble_instruction(chunk, offset);
        out.push_str(&line);
        out.push('\n');
        offset = next;
    }
    out
}

/// Listing of `function` followed by every function nested in its constants.
pub fn disassemble_function(function: &Function) -> String {
    let mut out = disassemble_chunk(&function.chunk, function.display_name().unwrap_or("<script>"));
    for constant in &function.chunk.constants {
        if let Some(inner) = constant.as_function() {
            out.push_str(&disassemble_function(inner));
        }
    }
    out
}

/// One instruction as `OFFSET LINE OPCODE operands`, plus the offset of the
/// next instruction.
pub fn disassemble_instruction(chunk: &Chunk, offset: usize) -> (String, usize) {
    let mut out = format!("{offset:04} ");
    if offset > 0 && chunk.line_at(offset) == chunk.line_at(offset - 1) {
        out.push_str("   | ");
    } else {
        let _ = write!(out, "{:4} ", chunk.line_at(offset));
    }

    let byte = chunk.code.get(offset).copied().unwrap_or_default();
    let Ok(op) = OpCode::try_from(byte) else {
        let _ = write!(out, "Unknown opcode {byte}");
        return (out, offset + 1);
    };

    let next = match op {
        OpCode::Constant | OpCode::GetGlobal | OpCode::DefineGlobal | OpCode::SetGlobal => {
            let index = operand(chunk, offset + 1);
            let value = chunk
                .constants
                .get(usize::from(index))
                .map_or_else(|| "?".to_string(), ToString::to_string);
            let _ = write!(out, "{:<16} {index:4} '{value}'", op.name());
            offset + 2
        }
        OpCode::GetLocal | OpCode::SetLocal | OpCode::Call => {
            let _ = write!(out, "{:<16} {:4}", op.name(), operand(chunk, offset + 1));
            offset + 2
        }
        OpCode::Jump | OpCode::JumpIfFalse | OpCode::Loop => {
            let jump = usize::from(u16::from_be_bytes([
                operand(chunk, offset + 1),
                operand(chunk, offset + 2),
            ]));
            let target = if op == OpCode::Loop {
                (offset + 3).saturating_sub(jump)
            } else {
                offset + 3 + jump
            };
            let _ = write!(out, "{:<16} {offset:4} -> {target}", op.name());
            offset + 3
        }
        _ => {
            out.push_str(op.name());
            offset + 1
        }
    };
    (out, next)
}

fn operand(chunk: &Chunk, offset: usize) -> u8 {
    chunk.code.get(offset).copied().unwrap_or_default()
}
