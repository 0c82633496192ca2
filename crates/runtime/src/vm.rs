//! The bytecode interpreter
//!
//! A dispatch loop over a fiber's value stack and frame list. Each `CALL`
//! reserves the four convention cells `[args-list][callee][saved-fp]
//! [saved-ip]` under the callee's working stack; `ARG_POP` feeds declared
//! closure slots from the args list; `RETURN` unwinds back to the saved
//! frame. Thrown values unwind through the fiber's handler stack; slice
//! expiry is checked at back-edges only.

use cedar_core::error::{arity_error, type_error, unbound_error};
use cedar_core::fiber::{FiberState, Frame, Handler};
use cedar_core::lambda::{CallContext, Code, Control, Lambda, Op, closure_with_size};
use cedar_core::module::{core_module, module_find};
use cedar_core::object::Obj;
use cedar_core::types;
use cedar_core::value::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Why a `run_fiber` slice ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Done,
    Yielded,
    Sleeping(u64),
    Parked,
}

/// Frame-chain ceiling; blowing it is irrecoverable runtime state.
const MAX_FRAMES: usize = 1 << 16;

enum Flow {
    Continue,
    /// back-edge; the caller may preempt here
    BackEdge,
    Done(Value),
    Park,
    SleepFor(u64),
    YieldNow,
}

struct Vm<'a> {
    state: &'a mut FiberState,
    fiber: &'a Arc<Obj>,
}

/// Run `fiber` until it finishes, suspends, or the slice expires.
/// `slice = None` runs without preemption (nested evaluation).
pub fn run_fiber(fiber: &Arc<Obj>, slice: Option<Duration>) -> RunOutcome {
    let data = fiber
        .as_fiber()
        .expect("run_fiber: not a fiber object");
    if data.is_done() {
        return RunOutcome::Done;
    }

    let started = Instant::now();
    let mut guard = data
        .state
        .lock()
        .expect("run_fiber: fiber state poisoned");

    loop {
        let mut vm = Vm {
            state: &mut *guard,
            fiber,
        };
        match vm.step() {
            Ok(Flow::Continue) => {}
            Ok(Flow::BackEdge) => {
                if let Some(budget) = slice {
                    if started.elapsed() >= budget {
                        return RunOutcome::Yielded;
                    }
                }
            }
            Ok(Flow::Done(value)) => {
                drop(guard);
                data.finish(value, false);
                return RunOutcome::Done;
            }
            Ok(Flow::Park) => return RunOutcome::Parked,
            Ok(Flow::SleepFor(ms)) => return RunOutcome::Sleeping(ms),
            Ok(Flow::YieldNow) => return RunOutcome::Yielded,
            Err(thrown) => {
                if let Err(uncaught) = deliver_throw(&mut *guard, thrown) {
                    drop(guard);
                    data.finish(uncaught, true);
                    return RunOutcome::Done;
                }
            }
        }
    }
}

/// Unwind to the innermost `try` handler: truncate frames and stack to the
/// recorded depths, deposit the thrown value in the handler's slot, resume
/// at the handler address. With no handler installed the value is
/// uncaught.
fn deliver_throw(state: &mut FiberState, thrown: Value) -> Result<(), Value> {
    let Some(handler) = state.handlers.pop() else {
        return Err(thrown);
    };
    state.frames.truncate(handler.frame_depth);
    state.stack.truncate(handler.stack_depth);
    let frame = state
        .frames
        .last_mut()
        .expect("handler recorded a live frame");
    frame.ip = handler.ip;
    let mut slots = frame
        .closure
        .lock()
        .expect("deliver_throw: closure poisoned");
    let slot = handler.slot as usize;
    if slot >= slots.len() {
        slots.resize(slot + 1, Value::nil());
    }
    slots[slot] = thrown;
    Ok(())
}

impl Vm<'_> {
    fn corrupt(&self, msg: &str) -> ! {
        eprintln!("cedar: corrupt bytecode: {msg}");
        dump_callstack(self.state);
        panic!("corrupt bytecode: {msg}");
    }

    fn push(&mut self, v: Value) {
        self.state.stack.push(v);
    }

    fn pop(&mut self) -> Value {
        match self.state.stack.pop() {
            Some(v) => v,
            None => self.corrupt("value stack underflow"),
        }
    }

    fn step(&mut self) -> Result<Flow, Value> {
        let (chunk, at) = {
            let frame = self
                .state
                .frames
                .last_mut()
                .expect("step: no live frame");
            (frame.chunk.clone(), frame.ip)
        };
        let Some(op) = chunk.read_u8(at).and_then(Op::from_u8) else {
            self.corrupt("instruction pointer out of range or unknown opcode");
        };
        self.frame().ip = at + 1;

        match op {
            Op::Nop => Ok(Flow::Continue),
            Op::Nil => {
                self.push(Value::nil());
                Ok(Flow::Continue)
            }
            Op::Const => {
                let index = self.read_u64(at + 1) as usize;
                let Some(v) = chunk.consts.get(index).cloned() else {
                    self.corrupt("constant index out of range");
                };
                self.push(v);
                Ok(Flow::Continue)
            }
            Op::Float => {
                let Some(f) = chunk.read_f64(at + 1) else {
                    self.corrupt("truncated float immediate");
                };
                self.frame().ip += 8;
                self.push(Value::Float(f));
                Ok(Flow::Continue)
            }
            Op::Int => {
                let Some(n) = chunk.read_i64(at + 1) else {
                    self.corrupt("truncated int immediate");
                };
                self.frame().ip += 8;
                self.push(Value::Int(n));
                Ok(Flow::Continue)
            }
            Op::LoadLocal => {
                let slot = self.read_u64(at + 1) as usize;
                let closure = self.frame().closure.clone();
                let found = {
                    let slots = closure.lock().expect("closure poisoned");
                    slots.get(slot).cloned().ok_or(slots.len())
                };
                match found {
                    Ok(v) => self.push(v),
                    Err(len) => self.corrupt_slot(slot, len),
                }
                Ok(Flow::Continue)
            }
            Op::SetLocal => {
                let slot = self.read_u64(at + 1) as usize;
                let v = match self.state.stack.last() {
                    Some(v) => v.clone(),
                    None => self.corrupt("SET_LOCAL on empty stack"),
                };
                let closure = self.frame().closure.clone();
                let len = {
                    let mut slots = closure.lock().expect("closure poisoned");
                    if slot < slots.len() {
                        slots[slot] = v;
                        None
                    } else {
                        Some(slots.len())
                    }
                };
                if let Some(len) = len {
                    self.corrupt_slot(slot, len);
                }
                Ok(Flow::Continue)
            }
            Op::LoadGlobal => {
                let index = self.read_u64(at + 1) as usize;
                let Some(symbol) = chunk.consts.get(index) else {
                    self.corrupt("LOAD_GLOBAL constant index out of range");
                };
                let Some(id) = symbol.symbol_id() else {
                    self.corrupt("LOAD_GLOBAL constant is not a symbol");
                };
                let module = self.frame().module.clone();
                match module_find(&module, id, &module) {
                    Some(v) => {
                        self.push(v);
                        Ok(Flow::Continue)
                    }
                    None => Err(unbound_error(&symbol.to_human_string())),
                }
            }
            Op::SetGlobal => {
                let index = self.read_u64(at + 1) as usize;
                let Some(symbol) = chunk.consts.get(index).cloned() else {
                    self.corrupt("SET_GLOBAL constant index out of range");
                };
                let Some(id) = symbol.symbol_id() else {
                    self.corrupt("SET_GLOBAL constant is not a symbol");
                };
                let v = self.pop();
                let module = self.frame().module.clone();
                let target = if module.is_nil() { core_module() } else { module };
                target
                    .as_obj()
                    .and_then(|o| o.as_module())
                    .expect("SET_GLOBAL target is a module")
                    .def(id, v.clone());
                self.push(v);
                Ok(Flow::Continue)
            }
            Op::Cons => {
                let rest = self.pop();
                let first = self.pop();
                self.push(Value::cons(first, rest));
                Ok(Flow::Continue)
            }
            Op::Call => self.op_call(),
            Op::MakeFunc => {
                let index = self.read_u64(at + 1) as usize;
                let Some(template) = chunk.consts.get(index) else {
                    self.corrupt("MAKE_FUNC constant index out of range");
                };
                let Some(l) = template.as_obj().and_then(|o| o.as_lambda()) else {
                    self.corrupt("MAKE_FUNC constant is not a lambda");
                };
                let mut materialized = l.lock().expect("lambda poisoned").copy();
                let frame = self.frame();
                materialized.closure = Some(frame.closure.clone());
                materialized.closure_size = frame.closure_size;
                if materialized.module.is_nil() {
                    materialized.module = frame.module.clone();
                }
                self.push(Value::lambda(materialized));
                Ok(Flow::Continue)
            }
            Op::MakeClosure => {
                let frame = self.frame();
                frame.closure = closure_with_size(frame.closure_size as usize);
                Ok(Flow::Continue)
            }
            Op::ArgPop => {
                let slot = self.read_u64(at + 1) as usize;
                let fp = self.frame().fp;
                let args = self.state.stack[fp].clone();
                let first = args.first()?;
                let rest = args.rest()?;
                self.state.stack[fp] = rest;
                let closure = self.frame().closure.clone();
                let len = {
                    let mut slots = closure.lock().expect("closure poisoned");
                    if slot < slots.len() {
                        slots[slot] = first;
                        None
                    } else {
                        Some(slots.len())
                    }
                };
                if let Some(len) = len {
                    self.corrupt_slot(slot, len);
                }
                Ok(Flow::Continue)
            }
            Op::Return => {
                let value = self.pop();
                let finished = self
                    .state
                    .frames
                    .pop()
                    .expect("RETURN with no live frame");
                if self.state.frames.is_empty() {
                    return Ok(Flow::Done(value));
                }
                self.state.stack.truncate(finished.fp);
                self.push(value);
                Ok(Flow::BackEdge)
            }
            Op::Skip => {
                self.pop();
                Ok(Flow::Continue)
            }
            Op::Jmp => {
                let Some(off) = chunk.read_i32(at + 1) else {
                    self.corrupt("truncated jump offset");
                };
                let base = at + 1 + 4;
                self.frame().ip = offset_ip(base, off);
                Ok(Flow::BackEdge)
            }
            Op::JmpIfFalse => {
                let Some(off) = chunk.read_i32(at + 1) else {
                    self.corrupt("truncated jump offset");
                };
                let base = at + 1 + 4;
                let cond = self.pop();
                if cond.truthy() {
                    self.frame().ip = base;
                } else {
                    self.frame().ip = offset_ip(base, off);
                }
                Ok(Flow::BackEdge)
            }
            Op::Exit => {
                let value = self.pop();
                Ok(Flow::Done(value))
            }
            Op::PushHandler => {
                let Some(off) = chunk.read_i32(at + 1) else {
                    self.corrupt("truncated handler offset");
                };
                let slot = self.read_u64(at + 5);
                let base = at + 1 + 12;
                self.frame().ip = base;
                let handler = Handler {
                    frame_depth: self.state.frames.len(),
                    stack_depth: self.state.stack.len(),
                    ip: offset_ip(base, off),
                    slot: slot as u32,
                };
                self.state.handlers.push(handler);
                Ok(Flow::Continue)
            }
            Op::PopHandler => {
                self.state.handlers.pop();
                Ok(Flow::Continue)
            }
        }
    }

    fn frame(&mut self) -> &mut Frame {
        self.state
            .frames
            .last_mut()
            .expect("no live frame")
    }

    /// Read a u64 immediate and advance past it.
    fn read_u64(&mut self, at: usize) -> u64 {
        let read = self.frame().chunk.clone().read_u64(at);
        let Some(v) = read else {
            self.corrupt("truncated u64 immediate");
        };
        self.frame().ip = at + 8;
        v
    }

    fn corrupt_slot(&self, slot: usize, len: usize) -> ! {
        self.corrupt(&format!(
            "closure slot {slot} out of range for slab of {len}"
        ))
    }

    fn op_call(&mut self) -> Result<Flow, Value> {
        let callee = self.pop();

        if let Some(l) = callee.as_obj().and_then(|o| o.as_lambda()) {
            let lambda = l.lock().expect("lambda poisoned").copy();
            return match &lambda.code {
                Code::Chunk(_) => self.call_bytecode(callee.clone(), lambda),
                Code::Native(name, f) => self.call_native(name, *f, &lambda),
            };
        }

        if callee
            .as_obj()
            .map(|o| o.as_type().is_some())
            .unwrap_or(false)
        {
            let args_list = self.pop();
            let args = args_list.list_items()?;
            let instance = types::construct(&callee, &args)?;
            self.push(instance);
            return Ok(Flow::BackEdge);
        }

        Err(type_error(format!(
            "value of type {} is not callable",
            callee.type_name()
        )))
    }

    fn call_bytecode(&mut self, callee: Value, lambda: Lambda) -> Result<Flow, Value> {
        if self.state.frames.len() >= MAX_FRAMES {
            eprintln!("cedar: fiber call stack exhausted");
            dump_callstack(self.state);
            panic!("fiber call stack exhausted");
        }

        let fp = self.state.stack.len() - 1;
        if let Some(receiver) = &lambda.bound_self {
            let args = self.state.stack[fp].clone();
            self.state.stack[fp] = Value::cons(receiver.clone(), args);
        }

        // arity check and vararg collection happen before the callee runs
        let items = self.state.stack[fp].list_items()?;
        let argc = lambda.argc as usize;
        if lambda.vararg {
            let fixed = argc.saturating_sub(1);
            if items.len() < fixed {
                return Err(arity_error(
                    &lambda.display_name(),
                    format!("at least {fixed}"),
                    items.len(),
                ));
            }
            let mut reshaped = items[..fixed].to_vec();
            reshaped.push(Value::list_from(&items[fixed..]));
            self.state.stack[fp] = Value::list_from(&reshaped);
        } else if items.len() != argc {
            return Err(arity_error(&lambda.display_name(), argc, items.len()));
        }

        let chunk = lambda
            .chunk()
            .expect("call_bytecode: bytecode lambda")
            .clone();
        let closure = lambda
            .closure
            .clone()
            .unwrap_or_else(|| closure_with_size(lambda.closure_size as usize));
        let module = if lambda.module.is_nil() {
            self.frame().module.clone()
        } else {
            lambda.module.clone()
        };
        let ip = if lambda.primed { chunk.prelude_end } else { 0 };

        let caller = self.frame();
        let saved_fp = caller.fp;
        let saved_ip = caller.ip;
        self.push(callee.clone());
        self.push(Value::Ptr(saved_fp));
        self.push(Value::Ptr(saved_ip));

        self.state.frames.push(Frame {
            lambda: callee,
            chunk,
            closure,
            closure_size: lambda.closure_size,
            module,
            ip,
            fp,
        });
        Ok(Flow::BackEdge)
    }

    fn call_native(
        &mut self,
        _name: &str,
        f: cedar_core::lambda::NativeFn,
        lambda: &Lambda,
    ) -> Result<Flow, Value> {
        let args_list = self.pop();
        let mut args = args_list.list_items()?;
        if let Some(receiver) = &lambda.bound_self {
            args.insert(0, receiver.clone());
        }
        let module = self.frame().module.clone();
        let mut ctx = CallContext {
            fiber: Some(self.fiber),
            module,
        };
        match f(&args, &mut ctx)? {
            Control::Value(v) => {
                self.push(v);
                Ok(Flow::BackEdge)
            }
            Control::Park => Ok(Flow::Park),
            Control::Sleep(ms) => {
                self.push(Value::nil());
                Ok(Flow::SleepFor(ms))
            }
            Control::Yield => {
                self.push(Value::nil());
                Ok(Flow::YieldNow)
            }
        }
    }
}

fn offset_ip(base: usize, off: i32) -> usize {
    (base as i64 + off as i64) as usize
}

/// Frame list diagnostic printed before a panic takes the process down.
fn dump_callstack(state: &FiberState) {
    eprintln!("fiber callstack ({} frames):", state.frames.len());
    for (depth, frame) in state.frames.iter().enumerate().rev() {
        let name = frame
            .lambda
            .as_obj()
            .and_then(|o| o.as_lambda())
            .map(|l| l.lock().expect("lambda poisoned").display_name())
            .unwrap_or_else(|| "?".to_string());
        eprintln!("  #{depth} {name} at instruction offset {}", frame.ip);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cedar_core::fiber::new_fiber;
    use cedar_core::lambda::Chunk;

    fn fiber_for(chunk: Chunk) -> Arc<Obj> {
        let mut lambda = Lambda::from_chunk(Arc::new(chunk));
        lambda.prime_args(&[]).expect("zero-arity prime");
        new_fiber(lambda).expect("bytecode fiber")
    }

    #[test]
    fn int_literal_runs_to_done() {
        let mut chunk = Chunk::new();
        chunk.emit(Op::Int);
        chunk.emit_i64(7);
        chunk.emit(Op::Exit);
        let fiber = fiber_for(chunk);
        assert_eq!(run_fiber(&fiber, None), RunOutcome::Done);
        let data = fiber.as_fiber().unwrap();
        assert!(data.is_done());
        assert_eq!(data.take_result(), Value::Int(7));
    }

    #[test]
    fn jmp_if_false_takes_the_else_path() {
        // nil condition jumps over the 9-byte Int(1)
        let mut chunk = Chunk::new();
        chunk.emit(Op::Nil);
        chunk.emit(Op::JmpIfFalse);
        chunk.emit_i32(9);
        chunk.emit(Op::Int);
        chunk.emit_i64(1);
        chunk.emit(Op::Int);
        chunk.emit_i64(2);
        chunk.emit(Op::Exit);
        let fiber = fiber_for(chunk);
        assert_eq!(run_fiber(&fiber, None), RunOutcome::Done);
        assert_eq!(fiber.as_fiber().unwrap().take_result(), Value::Int(2));
    }

    #[test]
    fn slice_expiry_yields_at_back_edges() {
        // a tight self-jump never finishes; the slice must preempt it
        let mut chunk = Chunk::new();
        chunk.emit(Op::Jmp);
        chunk.emit_i32(-5);
        let fiber = fiber_for(chunk);
        assert_eq!(
            run_fiber(&fiber, Some(Duration::from_millis(1))),
            RunOutcome::Yielded
        );
        assert!(!fiber.as_fiber().unwrap().is_done());
    }

    #[test]
    fn done_fiber_stays_done() {
        let mut chunk = Chunk::new();
        chunk.emit(Op::Nil);
        chunk.emit(Op::Exit);
        let fiber = fiber_for(chunk);
        assert_eq!(run_fiber(&fiber, None), RunOutcome::Done);
        assert_eq!(run_fiber(&fiber, None), RunOutcome::Done);
    }
}
