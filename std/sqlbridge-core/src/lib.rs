//!
//! sqlbridge-core - Core Binding Types
//!
//! This crate provides the pieces every other sqlbridge crate builds on:
//!
//! - `arena` for allocations in the engine heap, typed scalar views and the
//!   transient stack region used for call-scoped strings
//! - `NativeHandle` for single-owner references into the engine
//! - `Value`, `Params` and `QueryOptions` for marshaled host values
//! - `SqlError` and `ArenaError` for everything that can go wrong
//!
//! Nothing here is `Send`: the engine is single-threaded, and the arena and
//! every handle belong to the thread that created them.
//!

pub mod arena;
pub mod error;
pub mod handle;
pub mod value;

pub use arena::{ArenaPtr, ArenaStats, EncodedBuffer, StackFrame};
pub use error::*;
pub use handle::*;
pub use value::*;
