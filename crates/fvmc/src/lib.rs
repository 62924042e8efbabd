//! FastVM bytecode to IR compiler.
//!
//! Translates a contiguous buffer of stack-machine bytecode into a callable
//! module exposing `execute(rt) -> i32`. The core does not interpret or
//! execute bytecode; it only emits IR through the `fvmc-backend` traits and
//! relies on the backend's optimizer.

#![cfg_attr(not(test), warn(unused_extern_crates))]

#[macro_use]
extern crate tracing;

mod bytecode;
pub use bytecode::*;

mod compiler;
pub use compiler::{schedule, step_cost, CompilerConfig, EvmCompiler};

mod evm;
pub use evm::*;

pub mod runtime;

mod ext;

#[cfg(test)]
mod tests;

#[allow(ambiguous_glob_reexports)]
#[doc(inline)]
pub use fvmc_backend::*;
