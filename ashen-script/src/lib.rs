//! Embedded scripting runtime for game logic.
//!
//! This crate compiles a small imperative language to bytecode, runs it on a
//! tagged-value stack VM, and schedules script events against game time
//! through cooperative triggers. The host wires itself in through a native
//! function registry and drives the scheduler once per tick.

pub mod bytecode;
pub mod compiler;
pub mod context;
pub mod disasm;
pub mod error;
pub mod program;
pub mod registry;
pub mod scheduler;
pub mod stack;
pub mod value;
pub mod vm;

pub use compiler::{compile, CompileError};
pub use context::ScriptContext;
pub use error::RuntimeError;
pub use program::Program;
pub use registry::{NativeCtx, NativeRegistry};
pub use scheduler::{ContextId, SavedTrigger, Scheduler, SchedulerRequest};
pub use value::{TypeRegistry, TypeTag, Value};
pub use vm::{RunOutcome, Vm, VmFault};
