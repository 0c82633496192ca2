//! Fiber records
//!
//! A fiber owns a growable value stack and a list of call frames; the run
//! loop lives in the runtime crate. Suspension never switches OS stacks:
//! parking a fiber just means its state sits untouched until a peer or
//! scheduler picks it back up.

use crate::lambda::{Chunk, Closure, Lambda, closure_with_size};
use crate::object::{Obj, Payload};
use crate::types;
use crate::value::Value;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Condvar, Mutex};

/// One call frame. The calling-convention cells
/// `[args-list][callee][saved-fp][saved-ip]` sit at `fp..fp+4` on the value
/// stack; the frame record is the authoritative copy of the live fields.
#[derive(Debug)]
pub struct Frame {
    /// the lambda object being executed
    pub lambda: Value,
    pub chunk: Arc<Chunk>,
    pub closure: Closure,
    pub closure_size: u32,
    pub module: Value,
    pub ip: usize,
    pub fp: usize,
}

/// An installed `try` handler.
#[derive(Debug, Clone, Copy)]
pub struct Handler {
    pub frame_depth: usize,
    pub stack_depth: usize,
    /// resume address within the installing frame
    pub ip: usize,
    /// closure slot that receives the thrown value
    pub slot: u32,
}

#[derive(Debug, Default)]
pub struct FiberState {
    pub stack: Vec<Value>,
    pub frames: Vec<Frame>,
    pub handlers: Vec<Handler>,
}

#[derive(Debug)]
pub struct FiberData {
    pub state: Mutex<FiberState>,
    pub done: AtomicBool,
    /// set when the fiber terminated on an uncaught thrown value
    pub failed: AtomicBool,
    pub result: Mutex<Value>,
    /// id of the scheduler this fiber is pinned to; -1 for nested fibers
    /// driven to completion on the calling thread
    pub home: AtomicI64,
    ready: Mutex<bool>,
    ready_cv: Condvar,
}

impl FiberData {
    fn new(state: FiberState) -> FiberData {
        FiberData {
            state: Mutex::new(state),
            done: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            result: Mutex::new(Value::nil()),
            home: AtomicI64::new(-1),
            ready: Mutex::new(false),
            ready_cv: Condvar::new(),
        }
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    pub fn finish(&self, value: Value, failed: bool) {
        *self
            .result
            .lock()
            .expect("fiber finish: result slot poisoned") = value;
        self.failed.store(failed, Ordering::Release);
        self.done.store(true, Ordering::Release);
    }

    pub fn take_result(&self) -> Value {
        self.result
            .lock()
            .expect("fiber result: result slot poisoned")
            .clone()
    }

    /// Signal a parked fiber that its rendezvous completed. For scheduled
    /// fibers the scheduler re-enqueues instead; this event only unblocks
    /// nested runs waiting on the calling thread.
    pub fn notify_ready(&self) {
        let mut flag = self
            .ready
            .lock()
            .expect("fiber notify: ready flag poisoned");
        *flag = true;
        self.ready_cv.notify_all();
    }

    pub fn wait_ready(&self) {
        let mut flag = self.ready.lock().expect("fiber wait: ready flag poisoned");
        while !*flag {
            flag = self
                .ready_cv
                .wait(flag)
                .expect("fiber wait: ready condvar poisoned");
        }
        *flag = false;
    }
}

/// Build a fiber around a primed lambda. The stack is seeded with the four
/// convention cells and a single root frame pointing past the prelude.
pub fn new_fiber(lambda: Lambda) -> Result<Arc<Obj>, Value> {
    let chunk = match lambda.chunk() {
        Some(c) => c.clone(),
        None => {
            return Err(crate::error::type_error(
                "a fiber requires a bytecode lambda",
            ));
        }
    };
    let closure = lambda
        .closure
        .clone()
        .unwrap_or_else(|| closure_with_size(lambda.closure_size as usize));
    let ip = if lambda.primed { chunk.prelude_end } else { 0 };
    let closure_size = lambda.closure_size;
    let module = lambda.module.clone();
    let lambda_value = Value::lambda(lambda);

    let state = FiberState {
        stack: vec![
            Value::nil(),
            lambda_value.clone(),
            Value::Ptr(0),
            Value::Ptr(0),
        ],
        frames: vec![Frame {
            lambda: lambda_value,
            chunk,
            closure,
            closure_size,
            module,
            ip,
            fp: 0,
        }],
        handlers: Vec::new(),
    };
    Ok(Obj::new(
        types::builtins().fiber_t.clone(),
        Payload::Fiber(FiberData::new(state)),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lambda::Op;

    #[test]
    fn new_fiber_seeds_convention_cells() {
        let mut chunk = Chunk::new();
        chunk.emit(Op::Nil);
        chunk.emit(Op::Exit);
        let mut lambda = Lambda::from_chunk(Arc::new(chunk));
        lambda.prime_args(&[]).unwrap();
        let fiber = new_fiber(lambda).unwrap();
        let data = fiber.as_fiber().unwrap();
        let st = data.state.lock().unwrap();
        assert_eq!(st.stack.len(), 4);
        assert!(st.stack[0].is_nil());
        assert_eq!(st.frames.len(), 1);
        assert_eq!(st.frames[0].fp, 0);
        assert!(!data.is_done());
    }

    #[test]
    fn ready_event_roundtrip() {
        let data = FiberData::new(FiberState::default());
        data.notify_ready();
        // flag already set: wait returns immediately and resets it
        data.wait_ready();
    }

    #[test]
    fn native_lambda_cannot_back_a_fiber() {
        fn nothing(
            _: &[Value],
            _: &mut crate::lambda::CallContext,
        ) -> Result<crate::lambda::Control, Value> {
            Ok(crate::lambda::Control::Value(Value::nil()))
        }
        let err = new_fiber(Lambda::native("nothing", nothing)).unwrap_err();
        assert!(err.to_human_string().contains("type-error"));
    }
}
