//! Cedar compiler
//!
//! Reads source text into value trees and compiles them into bytecode
//! lambdas. Macro expansion runs through the host hook installed by the
//! runtime, so expansion is synchronous with the compiling thread.

pub mod compiler;
pub mod reader;

pub use compiler::{compile_unit, quasiquote};
pub use reader::{Reader, read_all, read_one};
