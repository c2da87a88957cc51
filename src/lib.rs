//! An embeddable, thread-safe scripting runtime.
//!
//! A host creates a [`Runtime`], takes a [`Context`] per thread, compiles
//! source text with [`Context::compile`] and runs it with [`Context::call`].
//! Host functions are exposed to scripts as natives registered into the
//! namespace the code runs in.

pub mod bytecode;
pub mod compiler;
pub mod error;
pub mod gc;
pub mod runtime;
pub mod utils;
pub mod vm;

pub mod prelude {
    pub use crate::error::{CompileError, Error, RtResult, RuntimeError, TraceFrame};
    pub use crate::runtime::{
        libraries,
        object::{GhostType, NativeFn, NativeFnWithData},
        value::Value,
        Runtime, SaveKey,
    };
    pub use crate::throw;
    pub use crate::vm::{
        context::{Context, Ctx, SubContext},
        options::RuntimeOptions,
    };
}

pub use prelude::*;
