//! Compile-time diagnostics. Every error carries the source line it was
//! detected on; compilation aborts at the first error.

use thiserror::Error;

use crate::value::TypeTag;

#[derive(Debug, Clone, Error)]
pub enum CompileError {
    #[error("line {line}: unexpected character '{ch}'")]
    UnexpectedChar { line: u32, ch: char },

    #[error("line {line}: unterminated string literal")]
    UnterminatedString { line: u32 },

    #[error("line {line}: numeric literal out of range")]
    BadNumber { line: u32 },

    #[error("line {line}: {msg}")]
    Syntax { line: u32, msg: String },

    #[error("line {line}: type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        line: u32,
        expected: TypeTag,
        found: TypeTag,
    },

    #[error("line {line}: operator '{op}' cannot be applied to {lhs} and {rhs}")]
    BadOperands {
        line: u32,
        op: &'static str,
        lhs: TypeTag,
        rhs: TypeTag,
    },

    #[error("line {line}: '{name}' expects {expected} argument(s), got {found}")]
    ArityMismatch {
        line: u32,
        name: String,
        expected: usize,
        found: usize,
    },

    #[error("line {line}: undeclared symbol '{name}'")]
    Undeclared { line: u32, name: String },

    #[error("line {line}: duplicate symbol '{name}'")]
    Duplicate { line: u32, name: String },

    #[error("line {line}: unknown type '{name}'")]
    UnknownType { line: u32, name: String },

    #[error("line {line}: unknown callback '{name}'")]
    UnknownCallback { line: u32, name: String },

    #[error("line {line}: type {ty} has no member '{name}'")]
    UnknownMember {
        line: u32,
        ty: TypeTag,
        name: String,
    },

    #[error("line {line}: '{name}' is not callable")]
    NotCallable { line: u32, name: String },

    #[error("line {line}: '{name}' is not an array")]
    NotAnArray { line: u32, name: String },

    #[error("line {line}: array '{name}' has {expected} dimension(s), got {found}")]
    DimensionMismatch {
        line: u32,
        name: String,
        expected: usize,
        found: usize,
    },

    #[error("line {line}: return outside a function")]
    ReturnOutsideFunction { line: u32 },

    #[error("line {line}: function '{name}' can reach the end of its body without a return")]
    MissingReturn { line: u32, name: String },

    #[error("line {line}: pause is only legal inside an event body")]
    PauseOutsideEvent { line: u32 },

    #[error("line {line}: cannot cast {from} to {to}")]
    BadCast {
        line: u32,
        from: TypeTag,
        to: TypeTag,
    },

    #[error("line {line}: global initializer must be a literal or named constant")]
    NonConstantInitializer { line: u32 },

    #[error("line {line}: trigger '{name}' is already bound to another event")]
    TriggerRebound { line: u32, name: String },

    #[error("line {line}: too many {what} (limit {limit})")]
    TooMany {
        line: u32,
        what: &'static str,
        limit: usize,
    },
}
