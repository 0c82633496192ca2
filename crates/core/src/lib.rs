//! Cedar core object model
//!
//! The value representation, type system, intern table and core data
//! objects shared by the compiler and the runtime. The crate is pure data
//! plus dispatch plumbing: running bytecode, scheduling fibers and channel
//! rendezvous live in `cedar-runtime`, reached from here through the host
//! hooks in [`host`].

pub mod channel;
pub mod dict;
pub mod error;
pub mod fiber;
pub mod host;
pub mod intern;
pub mod lambda;
pub mod module;
pub mod object;
pub mod serialize;
pub mod types;
pub mod value;
pub mod vector;

pub use value::Value;

use std::sync::Once;

static BOOTSTRAP: Once = Once::new();

/// Establish the process-wide state in its required order: intern table,
/// type registry, then the core module with the builtin type names bound.
/// Idempotent; the runtime calls this from `init()` before installing the
/// host and loading the prelude.
pub fn bootstrap() {
    BOOTSTRAP.call_once(|| {
        intern::intern("nil");
        types::builtins();
        module::core_module();
        types::bind_type_names();
    });
}
