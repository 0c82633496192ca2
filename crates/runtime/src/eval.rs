//! Evaluation entry points and runtime initialization
//!
//! `init` wires the process together in its required order: core
//! bootstrap, host installation, native bindings, scheduler pool, then the
//! embedded prelude. `call_function` is the synchronous path used by
//! macroexpansion, method dispatch and instance construction: it primes a
//! copy of the lambda and drives a nested fiber to completion on the
//! calling thread.

use crate::scheduler;
use crate::vm::{RunOutcome, run_fiber};
use cedar_core::error::syntax_error;
use cedar_core::error::type_error;
use cedar_core::fiber::new_fiber;
use cedar_core::host::{Host, set_host};
use cedar_core::lambda::{CallContext, Code, Control};
use cedar_core::module::{core_module, new_module};
use cedar_core::object::Obj;
use cedar_core::types;
use cedar_core::value::Value;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Once};
use std::time::Duration;

/// The prelude evaluated into the core module at startup.
const PRELUDE: &str = include_str!("../stdlib/core.cdr");

struct RuntimeHost;

static RUNTIME_HOST: RuntimeHost = RuntimeHost;

impl Host for RuntimeHost {
    fn call(&self, func: &Value, args: &[Value]) -> Result<Value, Value> {
        call_function(func, args)
    }

    fn spawn(&self, fiber: Arc<Obj>) {
        scheduler::spawn_fiber(fiber);
    }

    fn wake(&self, fiber: Arc<Obj>) {
        scheduler::wake_fiber(fiber);
    }
}

static INIT: Once = Once::new();

fn scheduler_threads() -> usize {
    std::env::var("CEDARPROCS")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|&n| n > 0)
        .unwrap_or(1)
}

/// Initialize the runtime. Idempotent and safe to call from any thread.
pub fn init() {
    INIT.call_once(|| {
        cedar_core::bootstrap();
        set_host(&RUNTIME_HOST);
        crate::builtins::install();
        scheduler::start(scheduler_threads());
        let core = core_module();
        eval_str(PRELUDE, &core).expect("prelude must evaluate cleanly");
        tracing::debug!(threads = scheduler_threads(), "cedar runtime initialized");
    });
}

/// Run a lambda value (or construct through a type value) to completion,
/// synchronously with respect to the caller.
pub fn call_function(func: &Value, args: &[Value]) -> Result<Value, Value> {
    if func
        .as_obj()
        .map(|o| o.as_type().is_some())
        .unwrap_or(false)
    {
        return types::construct(func, args);
    }

    let Some(l) = func.as_obj().and_then(|o| o.as_lambda()) else {
        return Err(type_error(format!(
            "value of type {} is not callable",
            func.type_name()
        )));
    };
    let mut lambda = l.lock().expect("lambda poisoned").copy();

    let bound = lambda.bound_self.take();
    let mut full_args;
    let args = match bound {
        Some(receiver) => {
            full_args = Vec::with_capacity(args.len() + 1);
            full_args.push(receiver);
            full_args.extend_from_slice(args);
            full_args.as_slice()
        }
        None => args,
    };

    let native = match &lambda.code {
        Code::Native(_, f) => Some(*f),
        Code::Chunk(_) => None,
    };

    if let Some(f) = native {
        let mut ctx = CallContext {
            fiber: None,
            module: lambda.module.clone(),
        };
        return match f(args, &mut ctx)? {
            Control::Value(v) => Ok(v),
            Control::Sleep(ms) => {
                std::thread::sleep(Duration::from_millis(ms));
                Ok(Value::nil())
            }
            Control::Yield => Ok(Value::nil()),
            Control::Park => Err(type_error("operation would block outside a fiber")),
        };
    }

    lambda.isolate_closure();
    lambda.prime_args(args)?;
    let fiber = new_fiber(lambda)?;
    run_to_completion(&fiber)
}

/// Drive a fiber on the current thread until done, waiting out parks and
/// sleeps. Macro expansion and constructor calls rely on this staying
/// synchronous.
pub fn run_to_completion(fiber: &Arc<Obj>) -> Result<Value, Value> {
    let data = fiber
        .as_fiber()
        .expect("run_to_completion: not a fiber");
    loop {
        match run_fiber(fiber, None) {
            RunOutcome::Done => break,
            RunOutcome::Parked => data.wait_ready(),
            RunOutcome::Sleeping(ms) => std::thread::sleep(Duration::from_millis(ms)),
            RunOutcome::Yielded => {}
        }
    }
    let value = data.take_result();
    if data.failed.load(Ordering::Acquire) {
        Err(value)
    } else {
        Ok(value)
    }
}

/// Read, compile and evaluate every form in `src` within `module`,
/// returning the last value.
pub fn eval_str(src: &str, module: &Value) -> Result<Value, Value> {
    let forms = cedar_compiler::read_all(src).map_err(syntax_error)?;
    let mut last = Value::nil();
    for form in forms {
        let mut unit = cedar_compiler::compile_unit(&form, module)?;
        unit.prime_args(&[])?;
        let fiber = new_fiber(unit)?;
        last = run_to_completion(&fiber)?;
    }
    Ok(last)
}

/// A fresh module for user code (one per file or REPL session).
pub fn new_user_module(name: &str) -> Value {
    new_module(name)
}
