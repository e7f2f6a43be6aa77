use std::io::{self, Stdout, Write};
use std::rc::Rc;

use super::chunk::{Function, OpCode};
use super::compiler::Compiler;
use super::debug::disassemble_instruction;
use super::error::{InterpretError, RuntimeError, TraceFrame, ValueError};
use super::table::{Interner, Key, Table};
use super::value::{dot_product, elementwise_apply, Array, BinaryOp};
use crate::settings::Settings;

/// One active function invocation.
#[derive(Debug)]
struct CallFrame {
    function: Rc<Function>,
    ip: usize,
    /// Stack index of the callee; arguments and locals follow it.
    slot_base: usize,
}

impl CallFrame {
    fn read_byte(&mut self) -> u8 {
        // Every chunk ends in RETURN, so running off the end cannot happen
        // for compiler output.
        let byte = self
            .function
            .chunk
            .code
            .get(self.ip)
            .copied()
            .unwrap_or(OpCode::Return as u8);
        self.ip += 1;
        byte
    }

    fn read_short(&mut self) -> usize {
        let hi = self.read_byte();
        let lo = self.read_byte();
        usize::from(u16::from_be_bytes([hi, lo]))
    }

    fn read_constant(&mut self) -> Option<Rc<Array>> {
        let index = usize::from(self.read_byte());
        self.function.chunk.constants.get(index).cloned()
    }

    /// Source line of the instruction being executed.
    fn line(&self) -> usize {
        self.function.chunk.line_at(self.ip.saturating_sub(1))
    }
}

/// Bytecode interpreter. One instance owns its globals, interned names and
/// value stack; separate instances share nothing.
///
/// Program output goes to `W`, stdout by default.
pub struct Vm<W: Write = Stdout> {
    /// Callers of the running frame, outermost first.
    frames: Vec<CallFrame>,
    stack: Vec<Rc<Array>>,
    globals: Table<Rc<Array>>,
    strings: Interner,
    settings: Settings,
    out: W,
    empty: Rc<Array>,
}

impl Vm<Stdout> {
    pub fn new(settings: Settings) -> Self {
        Self::with_output(settings, io::stdout())
    }
}

impl Default for Vm<Stdout> {
    fn default() -> Self {
        Self::new(Settings::default())
    }
}

impl<W: Write> Vm<W> {
    pub fn with_output(settings: Settings, out: W) -> Self {
        Self {
            frames: Vec::with_capacity(settings.frames_max),
            stack: Vec::with_capacity(settings.stack_max),
            globals: Table::new(),
            strings: Interner::new(),
            settings,
            out,
            empty: Rc::new(Array::empty()),
        }
    }

    pub fn output(&self) -> &W {
        &self.out
    }

    /// Look up a global by name.
    pub fn global(&self, name: &str) -> Option<Rc<Array>> {
        let key = self.strings.get(name)?;
        self.globals.get(&key).cloned()
    }

    /// Compile and run `source`. Globals persist across calls, so a REPL can
    /// feed one line at a time.
    pub fn interpret(&mut self, source: &str) -> Result<(), InterpretError> {
        tracing::debug!(bytes = source.len(), "interpret");
        let function = Compiler::new(source, &mut self.strings)
            .print_code(self.settings.print_code)
            .compile()?;

        self.stack.push(Rc::new(Array::function(Rc::clone(&function))));
        let frame = CallFrame {
            function,
            ip: 0,
            slot_base: self.stack.len() - 1,
        };
        let result = self.run(frame);
        if let Err(error) = &result {
            tracing::debug!(error = %error.message, "runtime error");
            self.reset_stack();
        } else {
            tracing::debug!(globals = self.globals.len(), "interpret finished");
        }
        result.map_err(InterpretError::from)
    }

    fn reset_stack(&mut self) {
        self.stack.clear();
        self.frames.clear();
    }

    fn push(&mut self, value: Rc<Array>) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Rc<Array> {
        self.stack.pop().unwrap_or_else(|| Rc::clone(&self.empty))
    }

    fn peek(&self, distance: usize) -> &Rc<Array> {
        self.stack
            .len()
            .checked_sub(distance + 1)
            .and_then(|i| self.stack.get(i))
            .unwrap_or(&self.empty)
    }

    /// Build a runtime error carrying the call stack, innermost frame first.
    fn runtime_error(&self, frame: &CallFrame, message: impl Into<String>) -> RuntimeError {
        let trace = std::iter::once(frame)
            .chain(self.frames.iter().rev())
            .map(|f| TraceFrame {
                line: f.line(),
                function: f.function.display_name().map(String::from),
            })
            .collect();
        RuntimeError {
            message: message.into(),
            trace,
        }
    }

    fn value_error(&self, frame: &CallFrame, error: &ValueError) -> RuntimeError {
        self.runtime_error(frame, error.to_string())
    }

    fn read_key(&self, frame: &mut CallFrame) -> Result<Rc<Key>, RuntimeError> {
        frame
            .read_constant()
            .and_then(|c| c.as_key().cloned())
            .ok_or_else(|| self.runtime_error(frame, "Operand is not a variable name."))
    }

    fn binary(&mut self, frame: &CallFrame, op: BinaryOp) -> Result<(), RuntimeError> {
        let b = self.pop();
        let a = self.pop();
        let result = elementwise_apply(&a, &b, op).map_err(|e| self.value_error(frame, &e))?;
        self.push(Rc::new(result));
        Ok(())
    }

    fn unary(
        &mut self,
        frame: &CallFrame,
        op: impl FnOnce(&Array) -> Result<Array, ValueError>,
    ) -> Result<(), RuntimeError> {
        let a = self.pop();
        let result = op(&a).map_err(|e| self.value_error(frame, &e))?;
        self.push(Rc::new(result));
        Ok(())
    }

    /// Enter the function on the stack below its `arg_count` arguments.
    fn call_value(&mut self, frame: &mut CallFrame, arg_count: usize) -> Result<(), RuntimeError> {
        let Some(function) = self.peek(arg_count).as_function().cloned() else {
            return Err(self.runtime_error(frame, "Can only call functions."));
        };
        if arg_count != function.arity {
            return Err(self.runtime_error(
                frame,
                format!("Expected {} arguments but got {arg_count}.", function.arity),
            ));
        }
        if self.frames.len() + 1 >= self.settings.frames_max || self.stack.len() >= self.settings.stack_max {
            return Err(self.runtime_error(frame, "Stack overflow."));
        }
        let callee = CallFrame {
            function,
            ip: 0,
            slot_base: self.stack.len() - arg_count - 1,
        };
        let caller = std::mem::replace(frame, callee);
        self.frames.push(caller);
        Ok(())
    }

    #[allow(clippy::too_many_lines)]
    fn run(&mut self, mut frame: CallFrame) -> Result<(), RuntimeError> {
        loop {
            if self.settings.trace_execution {
                let (text, _) = disassemble_instruction(&frame.function.chunk, frame.ip);
                tracing::trace!(depth = self.stack.len(), "{text}");
            }

            let byte = frame.read_byte();
            let Ok(op) = OpCode::try_from(byte) else {
                return Err(self.runtime_error(&frame, format!("Unknown opcode {byte}.")));
            };

            match op {
                OpCode::Constant => {
                    let value = frame
                        .read_constant()
                        .ok_or_else(|| self.runtime_error(&frame, "Constant index out of range."))?;
                    self.push(value);
                }
                OpCode::Nil => self.push(Rc::clone(&self.empty)),
                OpCode::True => self.push(Rc::new(Array::bools(vec![true]))),
                OpCode::False => self.push(Rc::new(Array::bools(vec![false]))),
                OpCode::Pop => {
                    self.pop();
                }

                OpCode::GetLocal => {
                    let slot = frame.slot_base + usize::from(frame.read_byte());
                    let value = self.stack.get(slot).cloned().unwrap_or_else(|| Rc::clone(&self.empty));
                    self.push(value);
                }
                OpCode::SetLocal => {
                    let slot = frame.slot_base + usize::from(frame.read_byte());
                    let value = Rc::clone(self.peek(0));
                    if let Some(target) = self.stack.get_mut(slot) {
                        *target = value;
                    }
                }
                OpCode::GetGlobal => {
                    let key = self.read_key(&mut frame)?;
                    let Some(value) = self.globals.get(&key).cloned() else {
                        return Err(self.runtime_error(&frame, format!("Undefined variable '{key}'.")));
                    };
                    self.push(value);
                }
                OpCode::DefineGlobal => {
                    let key = self.read_key(&mut frame)?;
                    let value = self.pop();
                    self.globals.set(key, value);
                }
                OpCode::SetGlobal => {
                    // Assignment to an unknown name defines it.
                    let key = self.read_key(&mut frame)?;
                    let value = Rc::clone(self.peek(0));
                    self.globals.set(key, value);
                }

                OpCode::Equal => self.binary(&frame, BinaryOp::Equal)?,
                OpCode::Greater => self.binary(&frame, BinaryOp::Greater)?,
                OpCode::Less => self.binary(&frame, BinaryOp::Less)?,
                OpCode::Add => self.binary(&frame, BinaryOp::Add)?,
                OpCode::Subtract => self.binary(&frame, BinaryOp::Subtract)?,
                OpCode::Multiply => self.binary(&frame, BinaryOp::Multiply)?,
                OpCode::Divide => self.binary(&frame, BinaryOp::Divide)?,
                OpCode::DotProduct => {
                    let b = self.pop();
                    let a = self.pop();
                    let result = dot_product(&a, &b).map_err(|e| self.value_error(&frame, &e))?;
                    self.push(Rc::new(result));
                }

                OpCode::Not => self.unary(&frame, Array::not)?,
                OpCode::Negate => self.unary(&frame, Array::negate)?,
                OpCode::PreAdd => self.unary(&frame, Array::reduce_last_axis)?,
                OpCode::GetDims => self.unary(&frame, |a| Ok(a.dims_array()))?,
                OpCode::All => self.unary(&frame, Array::all)?,
                OpCode::Any => self.unary(&frame, Array::any)?,

                OpCode::Lookup => {
                    let indices = self.pop();
                    let source = self.pop();
                    let result = source.gather(&indices).map_err(|e| self.value_error(&frame, &e))?;
                    self.push(Rc::new(result));
                }

                OpCode::Print => {
                    let value = self.pop();
                    writeln!(self.out, "{value}")
                        .map_err(|e| self.runtime_error(&frame, format!("Failed to write output: {e}")))?;
                }

                OpCode::Jump => {
                    let offset = frame.read_short();
                    frame.ip += offset;
                }
                OpCode::JumpIfFalse => {
                    let offset = frame.read_short();
                    let truthy = self.peek(0).truthiness().map_err(|e| self.value_error(&frame, &e))?;
                    if !truthy {
                        frame.ip += offset;
                    }
                }
                OpCode::Loop => {
                    let offset = frame.read_short();
                    frame.ip -= offset;
                }

                OpCode::Call => {
                    let arg_count = usize::from(frame.read_byte());
                    self.call_value(&mut frame, arg_count)?;
                }
                OpCode::Return => {
                    let result = self.pop();
                    self.stack.truncate(frame.slot_base);
                    let Some(caller) = self.frames.pop() else {
                        return Ok(());
                    };
                    self.push(result);
                    frame = caller;
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::dsl::error::InterpretResult;

    fn vm() -> Vm<Vec<u8>> {
        Vm::with_output(Settings::default(), Vec::new())
    }

    fn output(vm: &Vm<Vec<u8>>) -> String {
        String::from_utf8(vm.output().clone()).unwrap()
    }

    fn run(src: &str) -> String {
        let mut vm = vm();
        if let Err(e) = vm.interpret(src) {
            panic!("interpret failed: {e}");
        }
        output(&vm)
    }

    fn run_err(src: &str) -> RuntimeError {
        let mut vm = vm();
        match vm.interpret(src) {
            Err(InterpretError::Runtime(e)) => e,
            other => panic!("expected runtime error, got {other:?}"),
        }
    }

    #[test]
    fn assign_and_print_round_trip() {
        assert_eq!(run("x = [1,2,3]; print x;"), "[1,2,3]\n");
    }

    #[test]
    fn single_element_broadcasts() {
        assert_eq!(run("var a = [1,2,3]; var b = [10]; print a + b;"), "[11,12,13]\n");
        assert_eq!(run("print [10] - [1,2,3];"), "[9,8,7]\n");
    }

    #[test]
    fn shape_mismatch_is_a_runtime_error() {
        let err = run_err("print [1,2,3] + [1,2];");
        assert_eq!(err.message, "Shape mismatch: [3] and [2].");
        assert_eq!(err.to_string(), "Shape mismatch: [3] and [2].\n[line 1] in script");
    }

    #[test]
    fn gather_by_index() {
        assert_eq!(run("print [10,20,30] @ [2,0];"), "[30,10]\n");
        let err = run_err("print [10,20,30] @ [3];");
        assert_eq!(err.message, "Index 3 out of range for array of 3 elements.");
    }

    #[test]
    fn dot_product_sums_products() {
        assert_eq!(run("print [1,2,3] . [4,5,6];"), "[32]\n");
    }

    #[test]
    fn block_local_falls_back_to_undefined_global() {
        let err = run_err("{ var inner = [1]; }\nprint inner;");
        assert_eq!(err.message, "Undefined variable 'inner'.");
        assert_eq!(err.line(), Some(2));
    }

    #[test]
    fn block_local_shadow_ends_with_block() {
        assert_eq!(run("var a = [1]; { var a = [2]; print a; } print a;"), "[2]\n[1]\n");
    }

    #[test]
    fn while_false_at_entry_never_runs() {
        assert_eq!(run("var ran = [0]; while ([1] < [0]) { ran = [1]; } print ran;"), "[0]\n");
    }

    #[test]
    fn for_loop_updates_once_per_iteration() {
        assert_eq!(
            run("for (var i = 0; i < 3; i = i + 1) print i;"),
            "[0]\n[1]\n[2]\n"
        );
        assert_eq!(
            run("var n = 0; for (var i = 0; i < 4; i = i + 1) n = n + 1; print n;"),
            "[4]\n"
        );
    }

    #[test]
    fn arity_mismatch_reports_counts() {
        let err = run_err("fun f(a, b) { return a + b; }\nf(1);");
        assert_eq!(err.message, "Expected 2 arguments but got 1.");
        assert_eq!(err.trace, vec![TraceFrame { line: 2, function: None }]);
    }

    #[test]
    fn functions_return_values() {
        assert_eq!(run("fun add(a, b) { return a + b; } print add([1,2], [3]);"), "[4,5]\n");
        assert_eq!(run("fun f() {} print f();"), "[]\n");
        assert_eq!(run("fun f() {} print f;"), "<fn f>\n");
    }

    #[test]
    fn recursion() {
        let src = "fun fib(n) { if (n < 2) return n; return fib(n - 1) + fib(n - 2); } print fib(10);";
        assert_eq!(run(src), "[55]\n");
    }

    #[test]
    fn runtime_error_trace_is_innermost_first() {
        let err = run_err("fun inner() {\n  return [1,2] + [1,2,3];\n}\nfun outer() { return inner(); }\nouter();");
        assert_eq!(
            err.to_string(),
            "Shape mismatch: [2] and [3].\n[line 2] in inner()\n[line 4] in outer()\n[line 5] in script"
        );
    }

    #[test]
    fn unbounded_recursion_overflows() {
        let err = run_err("fun f() { return f(); } f();");
        assert_eq!(err.message, "Stack overflow.");
        assert_eq!(err.trace.len(), 64);
    }

    #[test]
    fn frame_limit_comes_from_settings() {
        let settings = Settings { frames_max: 4, ..Settings::default() };
        let mut vm = Vm::with_output(settings, Vec::new());
        let src = "fun d(n) { if (n > 0) return d(n - 1); return n; } print d(2);";
        vm.interpret(src).unwrap();
        let err = vm.interpret("print d(5);").unwrap_err();
        assert_eq!(err.to_string().lines().next(), Some("Stack overflow."));
    }

    #[test]
    fn calling_a_non_function() {
        assert_eq!(run_err("var x = [1]; x();").message, "Can only call functions.");
    }

    #[test]
    fn condition_must_be_single_element() {
        let err = run_err("if ([1,1]) print 1;");
        assert_eq!(err.message, "Condition must have exactly one element, got 2.");
    }

    #[test]
    fn and_or_short_circuit() {
        assert_eq!(run("print false and missing;"), "[false]\n");
        assert_eq!(run("print true or missing;"), "[true]\n");
        assert_eq!(run("print true and [2];"), "[2]\n");
    }

    #[test]
    fn unary_operators() {
        assert_eq!(run("print -[1,-2];"), "[-1,2]\n");
        assert_eq!(run("print +[[1,2],[3,4]];"), "[3,7]\n");
        assert_eq!(run("print #[[1,2,3],[4,5,6]];"), "[2,3]\n");
        assert_eq!(run("print &[1,0]; print |[1,0];"), "[false]\n[true]\n");
        assert_eq!(run("print !([1] == [1,2]);"), "[false,true]\n");
    }

    #[test]
    fn comparisons_and_division() {
        assert_eq!(run("print [1,2,3] >= [2];"), "[false,true,true]\n");
        assert_eq!(run("print [1,2,3] != [1,0,3];"), "[false,true,false]\n");
        assert_eq!(run("print [3] / [2];"), "[1.5]\n");
    }

    #[test]
    fn matrices_and_text_print_nested() {
        assert_eq!(run("print [[1,2,3],[4,5,6]];"), "[[1,2,3],[4,5,6]]\n");
        assert_eq!(run("print [hello];"), "[hello]\n");
        assert_eq!(run("print [abc] == [abd];"), "[true,true,false]\n");
    }

    #[test]
    fn empty_literal_is_untyped() {
        assert_eq!(run("print []; print #[];"), "[]\n[0]\n");
        assert_eq!(run_err("print [] + [1];").message, "Array has no element type.");
        assert_eq!(run("var x; print x;"), "[]\n");
    }

    #[test]
    fn globals_persist_across_interpret_calls() {
        let mut vm = vm();
        vm.interpret("var total = [1,2];").unwrap();
        vm.interpret("total = total * [3];").unwrap();
        vm.interpret("print total;").unwrap();
        assert_eq!(output(&vm), "[3,6]\n");
        assert_eq!(vm.global("total").unwrap().to_string(), "[3,6]");
    }

    #[test]
    fn global_lookup_leaves_interner_alone() {
        let mut vm = vm();
        vm.interpret("var seen = [1];").unwrap();
        let interned = vm.strings.len();
        assert!(vm.global("never_defined").is_none());
        assert_eq!(vm.strings.len(), interned);
        assert!(vm.global("seen").is_some());
    }

    #[test]
    fn non_ascii_text_prints_intact() {
        assert_eq!(run("print [héllo];"), "[héllo]\n");
        assert_eq!(run("print #[héllo];"), "[6]\n");
    }

    #[test]
    fn comments_inside_literals() {
        assert_eq!(run("print [1, 2 // two\n, 3];"), "[1,2,3]\n");
    }

    #[test]
    fn a_full_local_table_still_runs() {
        let decls: String = (0..255).map(|i| format!("var v{i} = {i}; ")).collect();
        assert_eq!(run(&format!("{{ {decls}print v254; print v0; }}")), "[254]\n[0]\n");
    }

    #[test]
    fn vm_recovers_after_runtime_error() {
        let mut vm = vm();
        let result = vm.interpret("print missing;");
        assert_eq!(InterpretResult::from(&result), InterpretResult::RuntimeError);
        vm.interpret("print [1];").unwrap();
        assert_eq!(output(&vm), "[1]\n");
    }

    #[test]
    fn compile_errors_do_not_run() {
        let mut vm = vm();
        let result = vm.interpret("print [1]; print (;");
        assert_eq!(InterpretResult::from(&result), InterpretResult::CompileError);
        assert_eq!(output(&vm), "", "nothing executes when compilation fails");
    }

    #[test]
    fn tracing_execution_keeps_output() {
        let settings = Settings { trace_execution: true, print_code: true, ..Settings::default() };
        let mut vm = Vm::with_output(settings, Vec::new());
        vm.interpret("print [1] + [2];").unwrap();
        assert_eq!(output(&vm), "[3]\n");
    }
}
