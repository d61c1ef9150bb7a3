use crate::value::TypeTag;

/// A fault raised while executing bytecode. Aborts the current top-level run
/// only; the scheduler and other contexts are unaffected.
#[derive(thiserror::Error, Debug)]
pub enum RuntimeError {
    #[error("stack underflow")]
    StackUnderflow,

    #[error("stack overflow (limit={limit})")]
    StackOverflow { limit: usize },

    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch { expected: TypeTag, found: TypeTag },

    #[error("division by zero")]
    DivisionByZero,

    #[error("operand of type {found} cannot be converted to text")]
    BadConcatOperand { found: TypeTag },

    #[error("{op} is not defined for {lhs} and {rhs}")]
    BadOperands {
        op: &'static str,
        lhs: TypeTag,
        rhs: TypeTag,
    },

    #[error("cannot cast {from} to {to}")]
    BadCast { from: TypeTag, to: TypeTag },

    #[error("pc out of range: pc=0x{pc:X}, range=0x{start:X}..0x{end:X}")]
    PcOutOfRange { pc: u32, start: u32, end: u32 },

    #[error("jump target 0x{target:X} outside code range 0x{start:X}..0x{end:X}")]
    JumpOutOfRange { target: i64, start: u32, end: u32 },

    #[error("invalid opcode: 0x{opcode:02X} at pc=0x{pc:X}")]
    InvalidOpcode { opcode: u8, pc: u32 },

    #[error("malformed operand at pc=0x{pc:X}: {what}")]
    BadOperand { pc: u32, what: &'static str },

    #[error("array {array}: index {index} out of range for dimension {dim} (extent {extent})")]
    ArrayIndexOutOfRange {
        array: u16,
        dim: usize,
        index: i32,
        extent: u32,
    },

    #[error("global slot {slot} out of range (storage holds {len})")]
    GlobalOutOfRange { slot: u32, len: u32 },

    #[error("local slot {slot} out of range (frame holds {len})")]
    LocalOutOfRange { slot: u8, len: usize },

    #[error("call stack underflow")]
    CallStackUnderflow,

    #[error("call depth limit exceeded (limit={limit})")]
    CallDepthExceeded { limit: usize },

    #[error("instruction limit exceeded (limit={limit}); probable infinite loop")]
    StepLimitExceeded { limit: usize },

    #[error("interpreter invoked while already running")]
    Reentrant,

    #[error("unknown native function index {index}")]
    UnknownNative { index: u16 },

    #[error("no accessor registered for member index {index}")]
    UnknownAccessor { index: u16 },

    #[error("native function {name:?} failed: {msg}")]
    NativeFailed { name: String, msg: String },

    #[error("trigger {index} has no boolean test body")]
    TriggerHasNoTest { index: u16 },

    #[error("trigger index {index} out of range")]
    TriggerOutOfRange { index: u16 },

    #[error("event index {index} out of range")]
    EventOutOfRange { index: u16 },
}
