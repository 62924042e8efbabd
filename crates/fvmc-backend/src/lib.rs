//! Backend abstraction for the FastVM compiler.
//!
//! The compiler core emits IR exclusively through the [`Builder`] trait, so
//! any backend that can represent integers, pointers, basic blocks and calls
//! can carry the emitted module.

#![cfg_attr(not(test), warn(unused_extern_crates))]

mod traits;
pub use traits::*;

#[doc(no_inline)]
pub use eyre;
#[doc(no_inline)]
pub use ruint::{self, aliases::U256, uint};

/// Compilation result.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Compilation error.
pub type Error = eyre::Error;
