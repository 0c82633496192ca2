//! Evaluator hooks
//!
//! The object model needs to run lambdas (operator dispatch, constructors,
//! macroexpansion) and to hand fibers to a scheduler, but both live in the
//! runtime crate. The runtime installs its implementation here once at
//! startup, mirroring the original's process-wide `call_function`/`add_job`
//! entry points.

use crate::object::Obj;
use crate::value::Value;
use std::sync::{Arc, OnceLock};

pub trait Host: Send + Sync {
    /// Run a lambda value to completion with the given arguments and
    /// return its result. Must be synchronous with respect to the caller.
    fn call(&self, func: &Value, args: &[Value]) -> Result<Value, Value>;

    /// Accept a fresh fiber onto a scheduler work queue.
    fn spawn(&self, fiber: Arc<Obj>);

    /// Re-enqueue a parked fiber after a rendezvous completed.
    fn wake(&self, fiber: Arc<Obj>);
}

static HOST: OnceLock<&'static dyn Host> = OnceLock::new();

/// Install the evaluator. Later installs are ignored.
pub fn set_host(host: &'static dyn Host) {
    let _ = HOST.set(host);
}

/// The installed evaluator, or a thrown value when none is registered.
pub fn host() -> Result<&'static dyn Host, Value> {
    HOST.get().copied().ok_or_else(|| {
        crate::error::type_error("runtime not initialized: no evaluator host installed")
    })
}
