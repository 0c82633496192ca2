//! Cedar runtime
//!
//! The bytecode VM, the cooperative fiber scheduler, channel rendezvous,
//! the module loader and the core native bindings. `init()` must run
//! before any evaluation; everything else hangs off `eval_str` and
//! `call_function`.

pub mod builtins;
pub mod channel;
pub mod eval;
pub mod modules;
pub mod scheduler;
pub mod vm;

pub use eval::{call_function, eval_str, init, new_user_module, run_to_completion};
pub use vm::{RunOutcome, run_fiber};
