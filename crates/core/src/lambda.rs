//! Lambdas and bytecode chunks
//!
//! A lambda is either compiled bytecode (a [`Chunk`] plus closure layout)
//! or a native function binding. The byte stream is a true byte code:
//! opcodes with fixed-width little-endian immediates interpreted out of a
//! flat `Vec<u8>`.

use crate::error::arity_error;
use crate::object::Obj;
use crate::value::Value;
use std::sync::{Arc, Mutex};

/// Opcode set. Immediates noted per variant; everything else is bare.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Op {
    Nop = 0x00,
    /// push nil
    Nil = 0x01,
    /// u64 constant index
    Const = 0x02,
    /// f64 literal
    Float = 0x03,
    /// i64 literal
    Int = 0x04,
    /// u64 closure slot
    LoadLocal = 0x05,
    /// u64 closure slot; assigns top, leaves it on the stack
    SetLocal = 0x06,
    /// u64 constant index of a symbol; module lookup with core fallback
    LoadGlobal = 0x07,
    /// u64 constant index of a symbol; bind in the current module
    SetGlobal = 0x08,
    /// pop rest, pop first, push cons cell
    Cons = 0x09,
    /// callee on top, args list beneath
    Call = 0x0a,
    /// u64 constant index of a lambda template
    MakeFunc = 0x0b,
    /// allocate this call's closure slab
    MakeClosure = 0x0c,
    /// u64 closure slot; pop one argument from the args list into it
    ArgPop = 0x0d,
    Return = 0x0e,
    /// discard top (sequencing)
    Skip = 0x0f,
    /// i32 relative offset
    Jmp = 0x10,
    /// i32 relative offset; pops the condition
    JmpIfFalse = 0x11,
    Exit = 0x12,
    /// i32 handler offset, u64 error slot
    PushHandler = 0x13,
    PopHandler = 0x14,
}

impl Op {
    pub fn from_u8(byte: u8) -> Option<Op> {
        use Op::*;
        Some(match byte {
            0x00 => Nop,
            0x01 => Nil,
            0x02 => Const,
            0x03 => Float,
            0x04 => Int,
            0x05 => LoadLocal,
            0x06 => SetLocal,
            0x07 => LoadGlobal,
            0x08 => SetGlobal,
            0x09 => Cons,
            0x0a => Call,
            0x0b => MakeFunc,
            0x0c => MakeClosure,
            0x0d => ArgPop,
            0x0e => Return,
            0x0f => Skip,
            0x10 => Jmp,
            0x11 => JmpIfFalse,
            0x12 => Exit,
            0x13 => PushHandler,
            0x14 => PopHandler,
            _ => return None,
        })
    }
}

/// A compiled unit: byte stream, constant pool and stack/closure layout.
#[derive(Debug, Default)]
pub struct Chunk {
    pub code: Vec<u8>,
    pub consts: Vec<Value>,
    /// declared working-stack depth (informational; the VM stack grows)
    pub stack_size: u32,
    /// offset just past the MAKE_CLOSURE / ARG_POP prelude; primed lambdas
    /// begin executing here so deposited arguments are not popped again
    pub prelude_end: usize,
}

impl Chunk {
    pub fn new() -> Self {
        Chunk::default()
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    pub fn emit(&mut self, op: Op) {
        self.code.push(op as u8);
    }

    pub fn emit_u64(&mut self, v: u64) {
        self.code.extend_from_slice(&v.to_le_bytes());
    }

    pub fn emit_i64(&mut self, v: i64) {
        self.code.extend_from_slice(&v.to_le_bytes());
    }

    pub fn emit_f64(&mut self, v: f64) {
        self.code.extend_from_slice(&v.to_le_bytes());
    }

    pub fn emit_i32(&mut self, v: i32) {
        self.code.extend_from_slice(&v.to_le_bytes());
    }

    pub fn patch_i32(&mut self, at: usize, v: i32) {
        self.code[at..at + 4].copy_from_slice(&v.to_le_bytes());
    }

    pub fn push_const(&mut self, v: Value) -> usize {
        self.consts.push(v);
        self.consts.len() - 1
    }

    pub fn read_u8(&self, at: usize) -> Option<u8> {
        self.code.get(at).copied()
    }

    pub fn read_u64(&self, at: usize) -> Option<u64> {
        let bytes = self.code.get(at..at + 8)?;
        Some(u64::from_le_bytes(bytes.try_into().ok()?))
    }

    pub fn read_i64(&self, at: usize) -> Option<i64> {
        self.read_u64(at).map(|v| v as i64)
    }

    pub fn read_f64(&self, at: usize) -> Option<f64> {
        self.read_u64(at).map(f64::from_bits)
    }

    pub fn read_i32(&self, at: usize) -> Option<i32> {
        let bytes = self.code.get(at..at + 4)?;
        Some(i32::from_le_bytes(bytes.try_into().ok()?))
    }

    /// Recompute `prelude_end` by scanning the leading MAKE_CLOSURE /
    /// ARG_POP sequence. Used when a chunk is rebuilt from a byte stream.
    pub fn scan_prelude(&mut self) {
        let mut at = 0;
        loop {
            match self.read_u8(at).and_then(Op::from_u8) {
                Some(Op::MakeClosure) => at += 1,
                Some(Op::ArgPop) => at += 9,
                _ => break,
            }
        }
        self.prelude_end = at;
    }
}

/// Per-call closure storage: locals and captured upvalues live in shared
/// slots so inner lambdas observe later assignments.
pub type Closure = Arc<Mutex<Vec<Value>>>;

pub fn closure_with_size(n: usize) -> Closure {
    Arc::new(Mutex::new(vec![Value::nil(); n]))
}

/// What a native binding asks the VM to do next.
pub enum Control {
    Value(Value),
    /// the calling fiber has been queued on a channel; do not reschedule
    Park,
    /// push nil, then surrender the slice for at least this many ms
    Sleep(u64),
    /// push nil, then surrender the slice
    Yield,
}

/// Context handed to native bindings.
pub struct CallContext<'a> {
    /// the fiber executing the call, when one exists (absent for nested
    /// host calls that never entered the VM)
    pub fiber: Option<&'a Arc<Obj>>,
    /// the module the calling code was compiled in, or nil
    pub module: Value,
}

pub type NativeFn = fn(&[Value], &mut CallContext) -> Result<Control, Value>;

#[derive(Clone)]
pub enum Code {
    Chunk(Arc<Chunk>),
    Native(&'static str, NativeFn),
}

impl std::fmt::Debug for Code {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Code::Chunk(c) => write!(f, "Chunk({} bytes)", c.len()),
            Code::Native(name, _) => write!(f, "Native({name})"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Lambda {
    pub code: Code,
    /// first closure slot holding an argument
    pub arg_index: u32,
    /// declared parameter count (the vararg rest slot included)
    pub argc: u32,
    pub vararg: bool,
    /// slot count for the slab MAKE_CLOSURE allocates; templates carry 0
    /// and inherit the unit total when materialized
    pub closure_size: u32,
    pub closure: Option<Closure>,
    /// arguments already deposited; start execution past the prelude
    pub primed: bool,
    pub is_macro: bool,
    pub name: Value,
    pub defining: Value,
    pub module: Value,
    pub bound_self: Option<Value>,
}

impl Lambda {
    pub fn from_chunk(chunk: Arc<Chunk>) -> Lambda {
        Lambda {
            code: Code::Chunk(chunk),
            arg_index: 0,
            argc: 0,
            vararg: false,
            closure_size: 0,
            closure: None,
            primed: false,
            is_macro: false,
            name: Value::nil(),
            defining: Value::nil(),
            module: Value::nil(),
            bound_self: None,
        }
    }

    pub fn native(name: &'static str, f: NativeFn) -> Lambda {
        // the printable name comes from the Code::Native tag; interning a
        // symbol here would touch the type registry during its own
        // bootstrap
        Lambda {
            code: Code::Native(name, f),
            arg_index: 0,
            argc: 0,
            vararg: false,
            closure_size: 0,
            closure: None,
            primed: false,
            is_macro: false,
            name: Value::nil(),
            defining: Value::nil(),
            module: Value::nil(),
            bound_self: None,
        }
    }

    pub fn is_native(&self) -> bool {
        matches!(self.code, Code::Native(..))
    }

    pub fn chunk(&self) -> Option<&Arc<Chunk>> {
        match &self.code {
            Code::Chunk(c) => Some(c),
            Code::Native(..) => None,
        }
    }

    /// Shallow clone for per-call priming; the closure slab stays shared.
    pub fn copy(&self) -> Lambda {
        self.clone()
    }

    pub fn display_name(&self) -> String {
        if !self.name.is_nil() {
            return self.name.to_human_string();
        }
        match &self.code {
            Code::Native(name, _) => (*name).to_string(),
            Code::Chunk(_) => "anonymous".to_string(),
        }
    }

    /// Validate arity and deposit `args` into this lambda's closure slots.
    ///
    /// Non-vararg lambdas take exactly `argc` arguments. Vararg lambdas
    /// take at least `argc - 1`; the excess is collected into a list bound
    /// to the final slot.
    pub fn prime_args(&mut self, args: &[Value]) -> Result<(), Value> {
        let argc = self.argc as usize;
        if self.vararg {
            let fixed = argc.saturating_sub(1);
            if args.len() < fixed {
                return Err(arity_error(
                    &self.display_name(),
                    format!("at least {fixed}"),
                    args.len(),
                ));
            }
        } else if args.len() != argc {
            return Err(arity_error(&self.display_name(), argc, args.len()));
        }

        let size = (self.closure_size as usize).max(self.arg_index as usize + argc);
        let needs_fresh = match &self.closure {
            Some(existing) => {
                existing
                    .lock()
                    .expect("prime_args: closure poisoned")
                    .len()
                    < size
            }
            None => true,
        };
        let slab = if needs_fresh {
            // a slab narrower than this lambda's layout belongs to an
            // enclosing unit that never allocated; replace it, carrying
            // over whatever was captured
            let fresh = closure_with_size(size);
            if let Some(existing) = &self.closure {
                let old = existing
                    .lock()
                    .expect("prime_args: closure poisoned")
                    .clone();
                fresh.lock().expect("prime_args: closure poisoned")[..old.len()]
                    .clone_from_slice(&old);
            }
            self.closure = Some(fresh.clone());
            fresh
        } else {
            self.closure.clone().expect("closure checked above")
        };

        {
            let mut slots = slab.lock().expect("prime_args: closure poisoned");
            let base = self.arg_index as usize;
            if self.vararg {
                let fixed = argc.saturating_sub(1);
                for (i, arg) in args[..fixed].iter().enumerate() {
                    slots[base + i] = arg.clone();
                }
                slots[base + fixed] = Value::list_from(&args[fixed..]);
            } else {
                for (i, arg) in args.iter().enumerate() {
                    slots[base + i] = arg.clone();
                }
            }
        }
        self.primed = true;
        Ok(())
    }

    /// Copy of this lambda with `self` bound, as handed out by attribute
    /// lookup so `(obj.method …)` sees the receiver first.
    pub fn bind(&self, receiver: Value) -> Lambda {
        let mut bound = self.copy();
        bound.bound_self = Some(receiver);
        bound
    }

    /// Detach a private copy of the closure slab, carrying the captured
    /// values over. Runs that happen outside the defining fiber (macro
    /// expansion, constructors, spawned thunks) prime into the copy so
    /// concurrent calls cannot clobber one another's slots.
    pub fn isolate_closure(&mut self) {
        if let Some(slab) = &self.closure {
            let copied = slab
                .lock()
                .expect("isolate_closure: closure poisoned")
                .clone();
            self.closure = Some(Arc::new(Mutex::new(copied)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_roundtrips_immediates() {
        let mut c = Chunk::new();
        c.emit(Op::Int);
        c.emit_i64(-42);
        c.emit(Op::Float);
        c.emit_f64(2.5);
        c.emit(Op::Jmp);
        c.emit_i32(-9);
        assert_eq!(c.read_u8(0).and_then(Op::from_u8), Some(Op::Int));
        assert_eq!(c.read_i64(1), Some(-42));
        assert_eq!(c.read_f64(10), Some(2.5));
        assert_eq!(c.read_i32(19), Some(-9));
        assert_eq!(c.read_u64(c.len()), None);
    }

    #[test]
    fn patching_jump_targets() {
        let mut c = Chunk::new();
        c.emit(Op::Jmp);
        let at = c.len();
        c.emit_i32(0);
        c.patch_i32(at, 123);
        assert_eq!(c.read_i32(at), Some(123));
    }

    #[test]
    fn scan_prelude_covers_closure_and_args() {
        let mut c = Chunk::new();
        c.emit(Op::MakeClosure);
        c.emit(Op::ArgPop);
        c.emit_u64(0);
        c.emit(Op::ArgPop);
        c.emit_u64(1);
        c.emit(Op::Nil);
        c.scan_prelude();
        assert_eq!(c.prelude_end, 1 + 9 + 9);
    }

    #[test]
    fn prime_exact_arity() {
        let mut c = Chunk::new();
        c.emit(Op::Nil);
        c.emit(Op::Return);
        let mut l = Lambda::from_chunk(Arc::new(c));
        l.arg_index = 0;
        l.argc = 2;
        l.closure_size = 3;
        l.prime_args(&[Value::Int(1), Value::Int(2)]).unwrap();
        assert!(l.primed);
        let slab = l.closure.as_ref().unwrap().lock().unwrap();
        assert_eq!(slab[0], Value::Int(1));
        assert_eq!(slab[1], Value::Int(2));
        assert_eq!(slab.len(), 3);
    }

    #[test]
    fn prime_wrong_arity_throws() {
        let mut l = Lambda::from_chunk(Arc::new(Chunk::new()));
        l.argc = 1;
        let err = l.prime_args(&[]).unwrap_err();
        assert!(err.to_human_string().contains("arity-error"));
    }

    #[test]
    fn prime_vararg_collects_rest() {
        let mut l = Lambda::from_chunk(Arc::new(Chunk::new()));
        l.argc = 2;
        l.vararg = true;
        l.prime_args(&[Value::Int(1), Value::Int(2), Value::Int(3)])
            .unwrap();
        let slab = l.closure.as_ref().unwrap().lock().unwrap();
        assert_eq!(slab[0], Value::Int(1));
        let rest = slab[1].clone();
        assert_eq!(
            rest,
            Value::list_from(&[Value::Int(2), Value::Int(3)])
        );
    }

    #[test]
    fn prime_vararg_empty_rest_is_nil() {
        let mut l = Lambda::from_chunk(Arc::new(Chunk::new()));
        l.argc = 1;
        l.vararg = true;
        l.prime_args(&[]).unwrap();
        let slab = l.closure.as_ref().unwrap().lock().unwrap();
        assert!(slab[0].is_nil());
    }
}
