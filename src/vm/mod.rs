//! Execution: contexts, the bytecode interpreter, the stop-the-world
//! rendezvous and runtime options.
pub mod context;
pub mod interpreter;
pub mod options;
pub mod safepoint;
pub mod sync;
