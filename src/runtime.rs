//! Runtime responsible for executing decoded JVM bytecode.
//!
//! Execution is a recursive fetch-decode-execute loop over one method
//! at a time. Every invocation owns a freshly allocated operand stack
//! bounded by the method's `max_stack` and receives its locals from the
//! caller; the class image and the heap are shared by every active
//! frame.
use crate::bytecode::OPCode;
use crate::heap::{Heap, IntArray};
use crate::program::{Method, Program, ResolveError};

use log::debug;
use std::fmt;
use std::io::{self, Write};

/// Name of the entry point method.
pub const MAIN_METHOD: &str = "main";
/// Descriptor of `main(String[] args)`.
pub const MAIN_DESCRIPTOR: &str = "([Ljava/lang/String;)V";

/// The `newarray` element type tag for `int`.
const T_INT: u8 = 10;

/// `RuntimeErrorKind` represents the possible errors that can occur
/// during execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeErrorKind {
    MethodNotFound {
        name: String,
        descriptor: String,
    },
    BadMethodRef(u16),
    DivisionByZero,
    BadReference(i32),
    BadArrayIndex {
        reference: i32,
        index: i32,
    },
    NegativeArraySize(i32),
    UnsupportedArrayType(u8),
    StackOverflow,
    StackUnderflow,
    BadLocalIndex(usize),
    BadConstant(u16),
    BranchOutOfBounds(i64),
    TruncatedCode,
    UnknownOpcode(u8),
    UnknownIntrinsic {
        class: String,
        name: String,
        descriptor: String,
    },
    NonVoidMain,
    IoError(String),
}

/// `RuntimeError` is the fatal failure type of the interpreter. Errors
/// are never caught or retried; they abort the whole execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeError {
    kind: RuntimeErrorKind,
}

impl RuntimeError {
    fn new(kind: RuntimeErrorKind) -> Self {
        Self { kind }
    }

    pub fn kind(&self) -> &RuntimeErrorKind {
        &self.kind
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            RuntimeErrorKind::MethodNotFound { name, descriptor } => {
                write!(f, "method {name}{descriptor} not found")
            }
            RuntimeErrorKind::BadMethodRef(index) => {
                write!(
                    f,
                    "constant pool index {index} does not resolve to a method reference"
                )
            }
            RuntimeErrorKind::DivisionByZero => write!(f, "division by zero"),
            RuntimeErrorKind::BadReference(reference) => {
                write!(f, "dangling heap reference {reference}")
            }
            RuntimeErrorKind::BadArrayIndex { reference, index } => {
                write!(f, "index {index} out of bounds for array {reference}")
            }
            RuntimeErrorKind::NegativeArraySize(length) => {
                write!(f, "negative array size {length}")
            }
            RuntimeErrorKind::UnsupportedArrayType(atype) => {
                write!(f, "unsupported array element type {atype}")
            }
            RuntimeErrorKind::StackOverflow => write!(f, "operand stack overflow"),
            RuntimeErrorKind::StackUnderflow => {
                write!(f, "operand stack underflow")
            }
            RuntimeErrorKind::BadLocalIndex(index) => {
                write!(f, "local variable index {index} out of range")
            }
            RuntimeErrorKind::BadConstant(index) => {
                write!(f, "constant pool index {index} does not hold an integer")
            }
            RuntimeErrorKind::BranchOutOfBounds(target) => {
                write!(f, "branch target {target} outside the method body")
            }
            RuntimeErrorKind::TruncatedCode => {
                write!(f, "bytecode ended in the middle of an instruction")
            }
            RuntimeErrorKind::UnknownOpcode(byte) => {
                write!(f, "unknown opcode 0x{byte:02x}")
            }
            RuntimeErrorKind::UnknownIntrinsic {
                class,
                name,
                descriptor,
            } => {
                write!(f, "no intrinsic registered for {class}.{name}{descriptor}")
            }
            RuntimeErrorKind::NonVoidMain => write!(f, "main must return void"),
            RuntimeErrorKind::IoError(message) => write!(f, "io error: {message}"),
        }
    }
}

impl std::error::Error for RuntimeError {}

impl From<ResolveError> for RuntimeError {
    fn from(err: ResolveError) -> Self {
        let kind = match err {
            ResolveError::MethodNotFound { name, descriptor } => {
                RuntimeErrorKind::MethodNotFound { name, descriptor }
            }
            ResolveError::BadMethodRef(index) => {
                RuntimeErrorKind::BadMethodRef(index)
            }
        };
        Self::new(kind)
    }
}

impl From<io::Error> for RuntimeError {
    fn from(err: io::Error) -> Self {
        Self::new(RuntimeErrorKind::IoError(err.to_string()))
    }
}

/// Per-frame operand stack, bounded by the method's `max_stack`.
#[derive(Debug)]
struct OperandStack {
    values: Vec<i32>,
    limit: usize,
}

impl OperandStack {
    fn new(max_stack: u16) -> Self {
        Self {
            values: Vec::with_capacity(max_stack as usize),
            limit: max_stack as usize,
        }
    }

    fn push(&mut self, value: i32) -> Result<(), RuntimeError> {
        if self.values.len() == self.limit {
            return Err(RuntimeError::new(RuntimeErrorKind::StackOverflow));
        }
        self.values.push(value);
        Ok(())
    }

    fn pop(&mut self) -> Result<i32, RuntimeError> {
        self.values
            .pop()
            .ok_or_else(|| RuntimeError::new(RuntimeErrorKind::StackUnderflow))
    }
}

/// Host functions standing in for library methods the class may call.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Intrinsic {
    PrintlnInt,
}

/// Registry of resolved (class, name, descriptor) call targets the
/// runtime services itself.
const INTRINSICS: &[(&str, &str, &str, Intrinsic)] =
    &[("java/io/PrintStream", "println", "(I)V", Intrinsic::PrintlnInt)];

fn resolve_intrinsic(
    program: &Program,
    index: u16,
) -> Result<Intrinsic, RuntimeError> {
    let (class, name, descriptor) = program.method_ref_target(index)?;
    INTRINSICS
        .iter()
        .find(|(c, n, d, _)| *c == class && *n == name && *d == descriptor)
        .map(|(_, _, _, intrinsic)| *intrinsic)
        .ok_or_else(|| {
            RuntimeError::new(RuntimeErrorKind::UnknownIntrinsic {
                class: class.to_string(),
                name: name.to_string(),
                descriptor: descriptor.to_string(),
            })
        })
}

/// `Runtime` owns everything one program execution needs: the class
/// image, the heap, and the output sink the println intrinsic writes
/// to.
pub struct Runtime<W: Write> {
    program: Program,
    heap: Heap,
    out: W,
}

impl Runtime<io::Stdout> {
    /// Creates a runtime printing to stdout.
    pub fn new(program: Program) -> Self {
        Self::with_output(program, io::stdout())
    }
}

impl<W: Write> Runtime<W> {
    /// Creates a runtime printing to an arbitrary sink.
    pub fn with_output(program: Program, out: W) -> Self {
        Self {
            program,
            heap: Heap::new(),
            out,
        }
    }

    /// Locates `main([Ljava/lang/String;)V` and runs it to completion.
    /// Slot 0 of its locals, which would hold the argv reference, stays
    /// zero.
    pub fn run(&mut self) -> Result<(), RuntimeError> {
        let main_method =
            self.program.find_method(MAIN_METHOD, MAIN_DESCRIPTOR)?;
        let locals = vec![0i32; usize::from(main_method.max_locals)];
        match execute(
            main_method,
            locals,
            &self.program,
            &mut self.heap,
            &mut self.out,
        )? {
            None => Ok(()),
            Some(_) => Err(RuntimeError::new(RuntimeErrorKind::NonVoidMain)),
        }
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn output(&self) -> &W {
        &self.out
    }
}

/// Runs a method's instructions until it returns. Returns the method's
/// value: `None` for void, `Some` for integer or reference returns.
pub fn execute<W: Write>(
    method: &Method,
    mut locals: Vec<i32>,
    program: &Program,
    heap: &mut Heap,
    out: &mut W,
) -> Result<Option<i32>, RuntimeError> {
    debug!("executing {}{}", method.name, method.descriptor);
    let code = &method.code;
    let mut stack = OperandStack::new(method.max_stack);
    let mut pc = 0usize;

    while pc < code.len() {
        let opcode = OPCode::try_from(code[pc])
            .map_err(|byte| RuntimeError::new(RuntimeErrorKind::UnknownOpcode(byte)))?;
        match opcode {
            OPCode::NOP => pc += 1,
            OPCode::IconstM1 => {
                stack.push(-1)?;
                pc += 1;
            }
            OPCode::Iconst0 => {
                stack.push(0)?;
                pc += 1;
            }
            OPCode::Iconst1 => {
                stack.push(1)?;
                pc += 1;
            }
            OPCode::Iconst2 => {
                stack.push(2)?;
                pc += 1;
            }
            OPCode::Iconst3 => {
                stack.push(3)?;
                pc += 1;
            }
            OPCode::Iconst4 => {
                stack.push(4)?;
                pc += 1;
            }
            OPCode::Iconst5 => {
                stack.push(5)?;
                pc += 1;
            }
            OPCode::BiPush => {
                let value = operand(code, pc + 1)? as i8;
                stack.push(i32::from(value))?;
                pc += 2;
            }
            OPCode::SiPush => {
                let hi = operand(code, pc + 1)?;
                let lo = operand(code, pc + 2)?;
                let value = (u16::from(hi) << 8 | u16::from(lo)) as i16;
                stack.push(i32::from(value))?;
                pc += 3;
            }
            OPCode::Ldc => {
                // The pool is 1-based; the index is used verbatim.
                let index = u16::from(operand(code, pc + 1)?);
                let value = program
                    .integer_at(index)
                    .ok_or_else(|| RuntimeError::new(RuntimeErrorKind::BadConstant(index)))?;
                stack.push(value)?;
                pc += 2;
            }
            OPCode::ILoad | OPCode::ALoad => {
                let index = usize::from(operand(code, pc + 1)?);
                stack.push(local(&locals, index)?)?;
                pc += 2;
            }
            OPCode::ILoad0 | OPCode::ALoad0 => {
                stack.push(local(&locals, 0)?)?;
                pc += 1;
            }
            OPCode::ILoad1 | OPCode::ALoad1 => {
                stack.push(local(&locals, 1)?)?;
                pc += 1;
            }
            OPCode::ILoad2 | OPCode::ALoad2 => {
                stack.push(local(&locals, 2)?)?;
                pc += 1;
            }
            OPCode::ILoad3 | OPCode::ALoad3 => {
                stack.push(local(&locals, 3)?)?;
                pc += 1;
            }
            OPCode::IStore | OPCode::AStore => {
                let index = usize::from(operand(code, pc + 1)?);
                let value = stack.pop()?;
                store_local(&mut locals, index, value)?;
                pc += 2;
            }
            OPCode::IStore0 | OPCode::AStore0 => {
                let value = stack.pop()?;
                store_local(&mut locals, 0, value)?;
                pc += 1;
            }
            OPCode::IStore1 | OPCode::AStore1 => {
                let value = stack.pop()?;
                store_local(&mut locals, 1, value)?;
                pc += 1;
            }
            OPCode::IStore2 | OPCode::AStore2 => {
                let value = stack.pop()?;
                store_local(&mut locals, 2, value)?;
                pc += 1;
            }
            OPCode::IStore3 | OPCode::AStore3 => {
                let value = stack.pop()?;
                store_local(&mut locals, 3, value)?;
                pc += 1;
            }
            OPCode::IInc => {
                let index = usize::from(operand(code, pc + 1)?);
                let delta = operand(code, pc + 2)? as i8;
                let value = local(&locals, index)?.wrapping_add(i32::from(delta));
                store_local(&mut locals, index, value)?;
                pc += 3;
            }
            OPCode::IAdd => {
                let rhs = stack.pop()?;
                let lhs = stack.pop()?;
                stack.push(lhs.wrapping_add(rhs))?;
                pc += 1;
            }
            OPCode::ISub => {
                let rhs = stack.pop()?;
                let lhs = stack.pop()?;
                stack.push(lhs.wrapping_sub(rhs))?;
                pc += 1;
            }
            OPCode::IMul => {
                let rhs = stack.pop()?;
                let lhs = stack.pop()?;
                stack.push(lhs.wrapping_mul(rhs))?;
                pc += 1;
            }
            OPCode::IDiv => {
                let rhs = stack.pop()?;
                let lhs = stack.pop()?;
                if rhs == 0 {
                    return Err(RuntimeError::new(RuntimeErrorKind::DivisionByZero));
                }
                // i32::MIN / -1 wraps back to i32::MIN.
                stack.push(lhs.wrapping_div(rhs))?;
                pc += 1;
            }
            OPCode::IRem => {
                let rhs = stack.pop()?;
                let lhs = stack.pop()?;
                if rhs == 0 {
                    return Err(RuntimeError::new(RuntimeErrorKind::DivisionByZero));
                }
                stack.push(lhs.wrapping_rem(rhs))?;
                pc += 1;
            }
            OPCode::INeg => {
                let value = stack.pop()?;
                stack.push(value.wrapping_neg())?;
                pc += 1;
            }
            OPCode::IShl => {
                let count = stack.pop()?;
                let value = stack.pop()?;
                // Shift counts take effect modulo 32.
                stack.push(value.wrapping_shl(count as u32))?;
                pc += 1;
            }
            OPCode::IShr => {
                let count = stack.pop()?;
                let value = stack.pop()?;
                stack.push(value.wrapping_shr(count as u32))?;
                pc += 1;
            }
            OPCode::IUShr => {
                let count = stack.pop()?;
                let value = stack.pop()?;
                stack.push(((value as u32).wrapping_shr(count as u32)) as i32)?;
                pc += 1;
            }
            OPCode::IAnd => {
                let rhs = stack.pop()?;
                let lhs = stack.pop()?;
                stack.push(lhs & rhs)?;
                pc += 1;
            }
            OPCode::IOr => {
                let rhs = stack.pop()?;
                let lhs = stack.pop()?;
                stack.push(lhs | rhs)?;
                pc += 1;
            }
            OPCode::IXor => {
                let rhs = stack.pop()?;
                let lhs = stack.pop()?;
                stack.push(lhs ^ rhs)?;
                pc += 1;
            }
            OPCode::Dup => {
                let value = stack.pop()?;
                stack.push(value)?;
                stack.push(value)?;
                pc += 1;
            }
            OPCode::IfEq
            | OPCode::IfNe
            | OPCode::IfLt
            | OPCode::IfGe
            | OPCode::IfGt
            | OPCode::IfLe => {
                let target = branch_target(code, pc)?;
                let value = stack.pop()?;
                let taken = match opcode {
                    OPCode::IfEq => value == 0,
                    OPCode::IfNe => value != 0,
                    OPCode::IfLt => value < 0,
                    OPCode::IfGe => value >= 0,
                    OPCode::IfGt => value > 0,
                    _ => value <= 0,
                };
                pc = if taken { target } else { pc + 3 };
            }
            OPCode::IfICmpEq
            | OPCode::IfICmpNe
            | OPCode::IfICmpLt
            | OPCode::IfICmpGe
            | OPCode::IfICmpGt
            | OPCode::IfICmpLe => {
                let target = branch_target(code, pc)?;
                let rhs = stack.pop()?;
                let lhs = stack.pop()?;
                let taken = match opcode {
                    OPCode::IfICmpEq => lhs == rhs,
                    OPCode::IfICmpNe => lhs != rhs,
                    OPCode::IfICmpLt => lhs < rhs,
                    OPCode::IfICmpGe => lhs >= rhs,
                    OPCode::IfICmpGt => lhs > rhs,
                    _ => lhs <= rhs,
                };
                pc = if taken { target } else { pc + 3 };
            }
            OPCode::Goto => {
                pc = branch_target(code, pc)?;
            }
            OPCode::IReturn | OPCode::AReturn => {
                return Ok(Some(stack.pop()?));
            }
            OPCode::Return => {
                return Ok(None);
            }
            OPCode::GetStatic => {
                // The field reference this pushes in a real JVM is only
                // ever consumed by an intrinsic call; it never reaches
                // the operand stack here.
                pc += 3;
            }
            OPCode::InvokeVirtual => {
                let index = pool_index(code, pc)?;
                match resolve_intrinsic(program, index)? {
                    Intrinsic::PrintlnInt => {
                        let value = stack.pop()?;
                        writeln!(out, "{value}")?;
                    }
                }
                pc += 3;
            }
            OPCode::InvokeStatic => {
                let index = pool_index(code, pc)?;
                let callee = program.find_method_from_index(index)?;
                let mut callee_locals =
                    vec![0i32; usize::from(callee.max_locals)];
                // Arguments come off the stack in reverse so the
                // leftmost parameter lands in slot 0.
                for slot in (0..usize::from(callee.parameter_count())).rev() {
                    let value = stack.pop()?;
                    store_local(&mut callee_locals, slot, value)?;
                }
                if let Some(value) =
                    execute(callee, callee_locals, program, heap, out)?
                {
                    stack.push(value)?;
                }
                pc += 3;
            }
            OPCode::NewArray => {
                let atype = operand(code, pc + 1)?;
                if atype != T_INT {
                    return Err(RuntimeError::new(
                        RuntimeErrorKind::UnsupportedArrayType(atype),
                    ));
                }
                let length = stack.pop()?;
                if length < 0 {
                    return Err(RuntimeError::new(
                        RuntimeErrorKind::NegativeArraySize(length),
                    ));
                }
                let reference = heap.add(IntArray::new(length as usize));
                stack.push(reference)?;
                pc += 2;
            }
            OPCode::ArrayLength => {
                let reference = stack.pop()?;
                let array = heap.get(reference).ok_or_else(|| {
                    RuntimeError::new(RuntimeErrorKind::BadReference(reference))
                })?;
                stack.push(array.len() as i32)?;
                pc += 1;
            }
            OPCode::IALoad => {
                let index = stack.pop()?;
                let reference = stack.pop()?;
                let array = heap.get(reference).ok_or_else(|| {
                    RuntimeError::new(RuntimeErrorKind::BadReference(reference))
                })?;
                let value = usize::try_from(index)
                    .ok()
                    .and_then(|i| array.get(i))
                    .ok_or_else(|| {
                        RuntimeError::new(RuntimeErrorKind::BadArrayIndex {
                            reference,
                            index,
                        })
                    })?;
                stack.push(value)?;
                pc += 1;
            }
            OPCode::IAStore => {
                let value = stack.pop()?;
                let index = stack.pop()?;
                let reference = stack.pop()?;
                let array = heap.get_mut(reference).ok_or_else(|| {
                    RuntimeError::new(RuntimeErrorKind::BadReference(reference))
                })?;
                usize::try_from(index)
                    .ok()
                    .and_then(|i| array.set(i, value))
                    .ok_or_else(|| {
                        RuntimeError::new(RuntimeErrorKind::BadArrayIndex {
                            reference,
                            index,
                        })
                    })?;
                pc += 1;
            }
        }
    }

    // Running off the end of the code is tolerated as a void return.
    Ok(None)
}

fn operand(code: &[u8], index: usize) -> Result<u8, RuntimeError> {
    code.get(index)
        .copied()
        .ok_or_else(|| RuntimeError::new(RuntimeErrorKind::TruncatedCode))
}

// Reads a big-endian u16 from the two operand bytes after `pc`.
fn pool_index(code: &[u8], pc: usize) -> Result<u16, RuntimeError> {
    let hi = operand(code, pc + 1)?;
    let lo = operand(code, pc + 2)?;
    Ok(u16::from(hi) << 8 | u16::from(lo))
}

// Branch offsets are signed 16-bit, relative to the opcode's own
// address. Both bytes are read unsigned and the combined value is
// sign-extended.
fn branch_target(code: &[u8], pc: usize) -> Result<usize, RuntimeError> {
    let offset = i32::from(pool_index(code, pc)? as i16);
    let target = pc as i64 + i64::from(offset);
    if (0..code.len() as i64).contains(&target) {
        Ok(target as usize)
    } else {
        Err(RuntimeError::new(RuntimeErrorKind::BranchOutOfBounds(target)))
    }
}

fn local(locals: &[i32], index: usize) -> Result<i32, RuntimeError> {
    locals
        .get(index)
        .copied()
        .ok_or_else(|| RuntimeError::new(RuntimeErrorKind::BadLocalIndex(index)))
}

fn store_local(
    locals: &mut [i32],
    index: usize,
    value: i32,
) -> Result<(), RuntimeError> {
    locals
        .get_mut(index)
        .map(|slot| *slot = value)
        .ok_or_else(|| RuntimeError::new(RuntimeErrorKind::BadLocalIndex(index)))
}
