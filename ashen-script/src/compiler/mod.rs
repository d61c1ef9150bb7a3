//! Source-to-program compiler: lexer, recursive-descent parser and the
//! type-checking code generator.

pub mod ast;
pub mod codegen;
pub mod error;
pub mod lexer;
pub mod parser;

pub use error::CompileError;

use crate::program::Program;
use crate::registry::Externs;

/// Compile a source unit against the host's registration snapshot.
pub fn compile(source: &str, externs: &Externs) -> Result<Program, CompileError> {
    let tokens = lexer::Lexer::new(source).tokenize()?;
    let items = parser::Parser::new(tokens).parse_program()?;
    codegen::generate(externs, &items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::TriggerKind;
    use crate::registry::NativeSig;
    use crate::value::{TypeTag, Value};
    use pretty_assertions::assert_eq;

    #[test]
    fn global_and_array_slot_layout() {
        let program = compile(
            "int x = 7;\nint grid[2][3];\nfloat f;",
            &Externs::default(),
        )
        .unwrap();
        assert_eq!(program.globals.len(), 8);
        assert_eq!(program.global_slot("x"), Some(0));
        assert_eq!(program.global_slot("grid"), Some(1));
        assert_eq!(program.global_slot("f"), Some(7));
        assert_eq!(program.inits[0], Some(Value::Int(7)));
        assert_eq!(program.inits[1], None);
        assert_eq!(program.arrays[0].base, 1);
        assert_eq!(program.arrays[0].extents, vec![2, 3]);
    }

    #[test]
    fn trigger_table_kinds_and_test_range() {
        let program = compile(
            "int x;\n\
             trigger t0(init);\n\
             trigger t1(wait, 100);\n\
             trigger t2(every, 10);\n\
             trigger t3(test: x > 3, 5);\n\
             event e(t2) { x = x + 1; }",
            &Externs::default(),
        )
        .unwrap();
        assert_eq!(program.triggers.len(), 4);
        assert_eq!(program.triggers[0].kind, TriggerKind::Init);
        assert_eq!(program.triggers[1].kind, TriggerKind::Wait);
        assert_eq!(program.triggers[1].interval, 100);
        assert_eq!(program.triggers[2].kind, TriggerKind::Every);
        assert_eq!(program.triggers[3].kind, TriggerKind::Code);
        assert!(program.triggers[3].has_test());
        assert!(!program.triggers[2].has_test());
        let test = program.triggers[3].test.unwrap();
        assert!(test.end > test.start);
        assert_eq!(program.events[0].trigger, Some(2));
    }

    #[test]
    fn assignment_type_mismatch_is_rejected() {
        let err = compile(
            "int x;\nevent e() { x = \"nope\"; }",
            &Externs::default(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            CompileError::TypeMismatch { line: 2, expected: TypeTag::Int, found: TypeTag::Str }
        ));
    }

    #[test]
    fn concat_accepts_mixed_scalars() {
        assert!(compile(
            "string s;\nevent e() { s = \"x=\" & 3 & \" f=\" & 1.5 & \" b=\" & true; }",
            &Externs::default(),
        )
        .is_ok());
    }

    #[test]
    fn undeclared_symbol_is_rejected() {
        let err = compile("event e() { nope = 1; }", &Externs::default()).unwrap_err();
        assert!(matches!(err, CompileError::Undeclared { .. }));
    }

    #[test]
    fn duplicate_symbol_is_rejected() {
        let err = compile("int x;\nfloat x;", &Externs::default()).unwrap_err();
        assert!(matches!(err, CompileError::Duplicate { line: 2, .. }));
    }

    #[test]
    fn return_outside_function_is_rejected() {
        let err = compile("event e() { return 1; }", &Externs::default()).unwrap_err();
        assert!(matches!(err, CompileError::ReturnOutsideFunction { .. }));
    }

    #[test]
    fn function_that_can_fall_off_the_end_is_rejected() {
        let err = compile(
            "int x;\nfunction int f() { if (x > 0) { return 1; } }",
            &Externs::default(),
        )
        .unwrap_err();
        assert!(matches!(err, CompileError::MissingReturn { line: 2, .. }));
    }

    #[test]
    fn function_returning_on_both_branches_compiles() {
        assert!(compile(
            "int x;\n\
             function int f() { if (x > 0) { return 1; } else { return 0; } }\n\
             event e() { x = f(); }",
            &Externs::default(),
        )
        .is_ok());
    }

    #[test]
    fn pause_outside_event_is_rejected() {
        let err = compile(
            "function void f() { pause(10); }",
            &Externs::default(),
        )
        .unwrap_err();
        assert!(matches!(err, CompileError::PauseOutsideEvent { .. }));
    }

    #[test]
    fn native_arity_is_checked() {
        let mut externs = Externs::default();
        externs.natives.push(NativeSig {
            name: "spawn".into(),
            params: vec![TypeTag::Int, TypeTag::Int],
            ret: TypeTag::Void,
        });
        let err = compile("event e() { spawn(1); }", &externs).unwrap_err();
        assert!(matches!(
            err,
            CompileError::ArityMismatch { expected: 2, found: 1, .. }
        ));
        assert!(compile("event e() { spawn(1, 2); }", &externs).is_ok());
    }

    #[test]
    fn function_return_type_is_checked() {
        let err = compile(
            "function int f() { return 1.5; }",
            &Externs::default(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            CompileError::TypeMismatch { expected: TypeTag::Int, found: TypeTag::Float, .. }
        ));
    }

    #[test]
    fn array_dimension_count_is_checked() {
        let err = compile(
            "int grid[2][3];\nevent e() { grid[1] = 0; }",
            &Externs::default(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            CompileError::DimensionMismatch { expected: 2, found: 1, .. }
        ));
    }

    #[test]
    fn test_trigger_expression_must_be_bool() {
        let err = compile(
            "int x;\ntrigger t(test: x + 1, 5);",
            &Externs::default(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            CompileError::TypeMismatch { expected: TypeTag::Bool, .. }
        ));
    }

    #[test]
    fn two_events_cannot_share_a_trigger() {
        let err = compile(
            "trigger t(every, 10);\nevent a(t) {}\nevent b(t) {}",
            &Externs::default(),
        )
        .unwrap_err();
        assert!(matches!(err, CompileError::TriggerRebound { .. }));
    }

    #[test]
    fn unknown_callback_is_rejected() {
        let err = compile(
            "trigger t(callback, on_attacked);",
            &Externs::default(),
        )
        .unwrap_err();
        assert!(matches!(err, CompileError::UnknownCallback { .. }));
    }

    #[test]
    fn events_end_with_exit() {
        let program = compile("event e() {}", &Externs::default()).unwrap();
        let range = program.events[0].range;
        assert_eq!(&program.code[range.start as usize..range.end as usize], &[0x00]);
    }
}
