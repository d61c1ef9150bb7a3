//! The fetch-decode-execute loop.
//!
//! A [`Vm`] owns the operand stack and the call-frame stack and nothing else;
//! the program, the context's globals and the native registry are borrowed
//! per run. One top-level run goes from an event or trigger-test entry point
//! to [`RunOutcome::Halted`], or suspends at a pause instruction. The stack
//! is reset on entry, so a faulted run never poisons the next one.

use std::any::Any;
use std::fmt;

use crate::bytecode::{CodeReader, Opcode};
use crate::context::GlobalStore;
use crate::error::RuntimeError;
use crate::program::{CodeRange, Program};
use crate::registry::{NativeCtx, NativeRegistry};
use crate::scheduler::SchedulerRequest;
use crate::stack::{BinaryOp, CastKind, UnaryOp, ValueStack};
use crate::value::{TypeTag, Value, VarSlot};

/// Runaway-loop guard: the only timeout mechanism, there is no preemption.
pub const STEP_LIMIT: usize = 1_000_000;

pub const MAX_CALL_DEPTH: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Halted,
    /// A pause instruction fired: suspend and re-enter later at
    /// `resume_offset`, `delay` time units from now.
    Paused { resume_offset: u32, delay: u32 },
}

/// What the top-level run was entered for; carried into fault diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOrigin {
    Event(u16),
    TriggerTest(u16),
}

/// A runtime fault plus the call-trace snapshot taken when it surfaced.
#[derive(Debug, thiserror::Error)]
#[error("{error} (pc=0x{pc:X}, call depth {depth})")]
pub struct VmFault {
    #[source]
    pub error: RuntimeError,
    pub pc: u32,
    /// Event the faulting frame was executing, if any.
    pub event: Option<u16>,
    pub origin: RunOrigin,
    pub depth: usize,
}

impl VmFault {
    /// Human-readable report resolved against the program's debug info.
    pub fn describe(&self, program: &Program) -> String {
        let mut out = String::new();
        match self.origin {
            RunOrigin::Event(idx) => {
                let name = program.event_name(idx).unwrap_or("?");
                out.push_str(&format!("event '{name}'"));
            }
            RunOrigin::TriggerTest(idx) => {
                let name = program.trigger_name(idx).unwrap_or("?");
                out.push_str(&format!("test of trigger '{name}'"));
            }
        }
        if let Some(current) = self.event {
            let matches_origin = matches!(self.origin, RunOrigin::Event(idx) if idx == current);
            if !matches_origin {
                let name = program.event_name(current).unwrap_or("?");
                out.push_str(&format!(", currently in '{name}'"));
            }
        }
        if let Some(line) = program.debug.as_ref().and_then(|d| d.line_at(self.pc)) {
            out.push_str(&format!(" at line {line}"));
        }
        format!("{out}: {self}")
    }
}

struct Frame {
    pc: u32,
    range: CodeRange,
    event: Option<u16>,
    locals: Vec<Value>,
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("pc", &self.pc)
            .field("event", &self.event)
            .field("locals", &self.locals.len())
            .finish()
    }
}

#[derive(Default)]
pub struct Vm {
    stack: ValueStack,
    frames: Vec<Frame>,
    running: bool,
    step_limit: usize,
}

impl Vm {
    pub fn new() -> Self {
        Vm {
            stack: ValueStack::new(),
            frames: Vec::new(),
            running: false,
            step_limit: STEP_LIMIT,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_step_limit(limit: usize) -> Self {
        let mut vm = Vm::new();
        vm.step_limit = limit;
        vm
    }

    /// Run one event body to completion or to a pause point. `resume` re-enters
    /// after a pause; the resume offset is the only state carried across it.
    #[allow(clippy::too_many_arguments)]
    pub fn run_event(
        &mut self,
        program: &Program,
        globals: &mut GlobalStore,
        registry: &NativeRegistry,
        host: &mut dyn Any,
        requests: &mut Vec<SchedulerRequest>,
        event: u16,
        resume: Option<u32>,
    ) -> Result<RunOutcome, VmFault> {
        let origin = RunOrigin::Event(event);
        let def = match program.event(event) {
            Some(def) => def,
            None => return Err(self.fault(RuntimeError::EventOutOfRange { index: event }, origin)),
        };
        let locals = def.locals.iter().map(|&t| Value::default_for(t)).collect();
        let pc = resume.unwrap_or(def.range.start);
        let frame = Frame { pc, range: def.range, event: Some(event), locals };
        self.run(program, globals, registry, host, requests, frame, origin)
    }

    /// Run a code trigger's boolean test body and return its verdict.
    #[allow(clippy::too_many_arguments)]
    pub fn run_test(
        &mut self,
        program: &Program,
        globals: &mut GlobalStore,
        registry: &NativeRegistry,
        host: &mut dyn Any,
        requests: &mut Vec<SchedulerRequest>,
        trigger: u16,
    ) -> Result<bool, VmFault> {
        let origin = RunOrigin::TriggerTest(trigger);
        let def = match program.trigger(trigger) {
            Some(def) => def,
            None => {
                return Err(self.fault(RuntimeError::TriggerOutOfRange { index: trigger }, origin))
            }
        };
        let range = match def.test {
            Some(range) => range,
            None => {
                return Err(self.fault(RuntimeError::TriggerHasNoTest { index: trigger }, origin))
            }
        };
        let frame = Frame { pc: range.start, range, event: None, locals: Vec::new() };
        self.run(program, globals, registry, host, requests, frame, origin)?;
        match self.stack.pop() {
            Ok(Value::Bool(verdict)) => Ok(verdict),
            Ok(other) => Err(self.fault(
                RuntimeError::TypeMismatch {
                    expected: TypeTag::Bool,
                    found: other.type_tag(),
                },
                origin,
            )),
            Err(e) => Err(self.fault(e, origin)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn run(
        &mut self,
        program: &Program,
        globals: &mut GlobalStore,
        registry: &NativeRegistry,
        host: &mut dyn Any,
        requests: &mut Vec<SchedulerRequest>,
        frame: Frame,
        origin: RunOrigin,
    ) -> Result<RunOutcome, VmFault> {
        // Script execution never nests; native call-outs must not loop back
        // into the interpreter synchronously.
        debug_assert!(!self.running, "re-entrant interpreter invocation");
        if self.running {
            return Err(self.fault(RuntimeError::Reentrant, origin));
        }
        self.running = true;
        self.stack.reset();
        self.frames.clear();
        self.frames.push(frame);

        let result = self.dispatch(program, globals, registry, host, requests);
        let outcome = result.map_err(|error| {
            let (pc, event) = self
                .frames
                .last()
                .map(|f| (f.pc, f.event))
                .unwrap_or((0, None));
            VmFault { error, pc, event, origin, depth: self.frames.len() }
        });
        self.frames.clear();
        self.running = false;
        outcome
    }

    fn fault(&self, error: RuntimeError, origin: RunOrigin) -> VmFault {
        VmFault { error, pc: 0, event: None, origin, depth: 0 }
    }

    fn dispatch(
        &mut self,
        program: &Program,
        globals: &mut GlobalStore,
        registry: &NativeRegistry,
        host: &mut dyn Any,
        requests: &mut Vec<SchedulerRequest>,
    ) -> Result<RunOutcome, RuntimeError> {
        let mut steps: usize = 0;
        loop {
            steps += 1;
            if steps > self.step_limit {
                return Err(RuntimeError::StepLimitExceeded { limit: self.step_limit });
            }

            let (range, pc) = {
                let frame = self.frames.last().ok_or(RuntimeError::CallStackUnderflow)?;
                (frame.range, frame.pc)
            };
            let mut reader = CodeReader::new(&program.code, range.start, range.end, pc);
            let op_pc = reader.pc;
            let byte = reader.read_u8()?;
            let op = Opcode::decode(byte)
                .ok_or(RuntimeError::InvalidOpcode { opcode: byte, pc: op_pc })?;

            match op {
                Opcode::Exit => {
                    self.frames.pop();
                    if self.frames.is_empty() {
                        return Ok(RunOutcome::Halted);
                    }
                    continue;
                }
                Opcode::PushInt => {
                    let v = reader.read_i32()?;
                    self.stack.push(Value::Int(v))?;
                }
                Opcode::PushFloat => {
                    let bits = reader.read_u32()?;
                    self.stack.push(Value::Float(f32::from_bits(bits)))?;
                }
                Opcode::PushBool => {
                    let v = reader.read_u8()?;
                    self.stack.push(Value::Bool(v != 0))?;
                }
                Opcode::PushStr => {
                    let s = reader.read_str()?;
                    self.stack.push(Value::Str(s))?;
                }
                Opcode::PushTrigger => {
                    let index = reader.read_u16()?;
                    if program.trigger(index).is_none() {
                        return Err(RuntimeError::TriggerOutOfRange { index });
                    }
                    self.stack.push(Value::Trigger(index))?;
                }
                Opcode::PushEvent => {
                    let index = reader.read_u16()?;
                    if program.event(index).is_none() {
                        return Err(RuntimeError::EventOutOfRange { index });
                    }
                    self.stack.push(Value::Event(index))?;
                }
                Opcode::PushGlobal => {
                    let slot = reader.read_u16()? as u32;
                    let v = globals.get(slot)?.clone();
                    self.stack.push(v)?;
                }
                Opcode::PushLocal => {
                    let slot = reader.read_u8()?;
                    let v = {
                        let frame =
                            self.frames.last().ok_or(RuntimeError::CallStackUnderflow)?;
                        frame.locals.get(slot as usize).cloned().ok_or(
                            RuntimeError::LocalOutOfRange { slot, len: frame.locals.len() },
                        )?
                    };
                    self.stack.push(v)?;
                }
                Opcode::PushGlobalRef => {
                    let slot = reader.read_u16()? as u32;
                    let ty = program
                        .globals
                        .get(slot as usize)
                        .copied()
                        .ok_or(RuntimeError::GlobalOutOfRange { slot, len: globals.len() })?;
                    self.stack
                        .push(Value::Ref { slot: VarSlot::Global(slot), ty })?;
                }
                Opcode::PushLocalRef => {
                    let slot = reader.read_u8()?;
                    let ty = {
                        let frame =
                            self.frames.last().ok_or(RuntimeError::CallStackUnderflow)?;
                        frame
                            .locals
                            .get(slot as usize)
                            .map(Value::type_tag)
                            .ok_or(RuntimeError::LocalOutOfRange {
                                slot,
                                len: frame.locals.len(),
                            })?
                    };
                    self.stack
                        .push(Value::Ref { slot: VarSlot::Local(slot), ty })?;
                }
                Opcode::PopDiscard => {
                    self.stack.pop()?;
                }
                Opcode::PopGlobal => {
                    let slot = reader.read_u16()? as u32;
                    let v = self.stack.pop()?;
                    globals.set(slot, v)?;
                }
                Opcode::PopLocal => {
                    let slot = reader.read_u8()?;
                    let v = self.stack.pop()?;
                    let frame =
                        self.frames.last_mut().ok_or(RuntimeError::CallStackUnderflow)?;
                    let len = frame.locals.len();
                    let target = frame
                        .locals
                        .get_mut(slot as usize)
                        .ok_or(RuntimeError::LocalOutOfRange { slot, len })?;
                    *target = v;
                }
                Opcode::LoadArray => {
                    let index = reader.read_u16()?;
                    let offset = self.pop_array_offset(program, registry, index, op_pc)?;
                    let v = globals.get(offset)?.clone();
                    self.stack.push(v)?;
                }
                Opcode::StoreArray => {
                    let index = reader.read_u16()?;
                    let v = self.stack.pop()?;
                    let offset = self.pop_array_offset(program, registry, index, op_pc)?;
                    globals.set(offset, v)?;
                }
                Opcode::Call => {
                    let index = reader.read_u16()?;
                    let def = program
                        .event(index)
                        .ok_or(RuntimeError::EventOutOfRange { index })?;
                    if self.frames.len() >= MAX_CALL_DEPTH {
                        return Err(RuntimeError::CallDepthExceeded { limit: MAX_CALL_DEPTH });
                    }
                    let caller =
                        self.frames.last_mut().ok_or(RuntimeError::CallStackUnderflow)?;
                    caller.pc = reader.pc;
                    let locals = def.locals.iter().map(|&t| Value::default_for(t)).collect();
                    self.frames.push(Frame {
                        pc: def.range.start,
                        range: def.range,
                        event: Some(index),
                        locals,
                    });
                    continue;
                }
                Opcode::CallNative => {
                    let index = reader.read_u16()?;
                    let mut ctx = NativeCtx {
                        stack: &mut self.stack,
                        types: registry.types(),
                        host: &mut *host,
                        requests: &mut *requests,
                    };
                    registry.call_native(index, &mut ctx)?;
                }
                Opcode::MemberGet => {
                    let index = reader.read_u16()?;
                    let object = self.stack.pop()?;
                    let value = {
                        let mut ctx = NativeCtx {
                            stack: &mut self.stack,
                            types: registry.types(),
                            host: &mut *host,
                            requests: &mut *requests,
                        };
                        registry.member_get(index, &mut ctx, &object)?
                    };
                    self.stack.push(value)?;
                }
                Opcode::MemberSet => {
                    let index = reader.read_u16()?;
                    let value = self.stack.pop()?;
                    let object = self.stack.pop()?;
                    let mut ctx = NativeCtx {
                        stack: &mut self.stack,
                        types: registry.types(),
                        host: &mut *host,
                        requests: &mut *requests,
                    };
                    registry.member_set(index, &mut ctx, &object, value)?;
                }
                Opcode::Jump => {
                    let rel = reader.read_i32()?;
                    reader.jump(rel)?;
                }
                Opcode::JumpIfFalse => {
                    let rel = reader.read_i32()?;
                    let v = self.stack.pop_typed(TypeTag::Bool, registry.types())?;
                    if v == Value::Bool(false) {
                        reader.jump(rel)?;
                    }
                }
                Opcode::Binary => {
                    let code = reader.read_u8()?;
                    let op = BinaryOp::from_byte(code).ok_or(RuntimeError::BadOperand {
                        pc: op_pc,
                        what: "unknown binary operator",
                    })?;
                    self.stack.binary(op, registry.types(), Some(registry.op_equals()))?;
                }
                Opcode::Unary => {
                    let code = reader.read_u8()?;
                    let op = UnaryOp::from_byte(code).ok_or(RuntimeError::BadOperand {
                        pc: op_pc,
                        what: "unknown unary operator",
                    })?;
                    match op {
                        UnaryOp::Inc | UnaryOp::Dec => {
                            self.step_ref(globals, op == UnaryOp::Inc)?
                        }
                        _ => self.stack.unary(op)?,
                    }
                }
                Opcode::Cast => {
                    let code = reader.read_u8()?;
                    let kind = CastKind::from_byte(code).ok_or(RuntimeError::BadOperand {
                        pc: op_pc,
                        what: "unknown cast",
                    })?;
                    self.stack.cast(kind)?;
                }
                Opcode::Pause => {
                    let delay = match self.stack.pop_typed(TypeTag::Int, registry.types())? {
                        Value::Int(d) => d,
                        _ => unreachable!("pop_typed returned a non-int"),
                    };
                    if self.frames.len() > 1 {
                        return Err(RuntimeError::BadOperand {
                            pc: op_pc,
                            what: "pause inside a nested call",
                        });
                    }
                    if delay < 0 {
                        return Err(RuntimeError::BadOperand {
                            pc: op_pc,
                            what: "negative pause delay",
                        });
                    }
                    return Ok(RunOutcome::Paused {
                        resume_offset: reader.pc,
                        delay: delay as u32,
                    });
                }
            }

            if let Some(frame) = self.frames.last_mut() {
                frame.pc = reader.pc;
            }
        }
    }

    /// Pop one index per dimension (innermost dimension on top) and resolve
    /// the global slot of the addressed element, bounds-checking each
    /// dimension.
    fn pop_array_offset(
        &mut self,
        program: &Program,
        registry: &NativeRegistry,
        index: u16,
        pc: u32,
    ) -> Result<u32, RuntimeError> {
        let def = program
            .arrays
            .get(index as usize)
            .ok_or(RuntimeError::BadOperand { pc, what: "array id out of range" })?;
        let mut offset: u32 = 0;
        for dim in (0..def.extents.len()).rev() {
            let idx = match self.stack.pop_typed(TypeTag::Int, registry.types())? {
                Value::Int(v) => v,
                _ => unreachable!("pop_typed returned a non-int"),
            };
            let extent = def.extents[dim];
            if idx < 0 || idx as u32 >= extent {
                return Err(RuntimeError::ArrayIndexOutOfRange {
                    array: index,
                    dim,
                    index: idx,
                    extent,
                });
            }
            offset += idx as u32 * def.stride(dim);
        }
        Ok(def.base + offset)
    }

    /// Increment/decrement through a reference popped from the stack; the
    /// stack copy is discarded, the referenced slot mutates.
    fn step_ref(&mut self, globals: &mut GlobalStore, increment: bool) -> Result<(), RuntimeError> {
        let (slot, _ty) = self.stack.pop_ref()?;
        let delta: i32 = if increment { 1 } else { -1 };
        let target = match slot {
            VarSlot::Global(i) => globals.get_mut(i)?,
            VarSlot::Local(i) => {
                let frame = self.frames.last_mut().ok_or(RuntimeError::CallStackUnderflow)?;
                let len = frame.locals.len();
                frame
                    .locals
                    .get_mut(i as usize)
                    .ok_or(RuntimeError::LocalOutOfRange { slot: i, len })?
            }
        };
        match target {
            Value::Int(v) => *v = v.wrapping_add(delta),
            Value::Float(v) => *v += delta as f32,
            other => {
                return Err(RuntimeError::TypeMismatch {
                    expected: TypeTag::Int,
                    found: other.type_tag(),
                })
            }
        }
        Ok(())
    }

    /// True while a run is in flight; used to assert non-reentrancy from the
    /// scheduler side.
    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn stack_len(&self) -> usize {
        self.stack.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compile;
    use crate::registry::Externs;
    use crate::value::TypeTag;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    struct Rig {
        program: Arc<Program>,
        globals: GlobalStore,
        registry: NativeRegistry,
        vm: Vm,
        requests: Vec<SchedulerRequest>,
    }

    impl Rig {
        fn new(src: &str) -> Self {
            Self::with_registry(src, NativeRegistry::new())
        }

        fn with_registry(src: &str, registry: NativeRegistry) -> Self {
            let program = Arc::new(compile(src, &registry.externs()).unwrap());
            let globals = GlobalStore::new(&program, &registry);
            Rig {
                program,
                globals,
                registry,
                vm: Vm::new(),
                requests: Vec::new(),
            }
        }

        fn run(&mut self, event: &str) -> Result<RunOutcome, VmFault> {
            let index = self.program.event_index(event).unwrap();
            self.vm.run_event(
                &self.program,
                &mut self.globals,
                &self.registry,
                &mut (),
                &mut self.requests,
                index,
                None,
            )
        }

        fn resume(&mut self, event: &str, offset: u32) -> Result<RunOutcome, VmFault> {
            let index = self.program.event_index(event).unwrap();
            self.vm.run_event(
                &self.program,
                &mut self.globals,
                &self.registry,
                &mut (),
                &mut self.requests,
                index,
                Some(offset),
            )
        }

        fn global(&self, name: &str) -> Value {
            let slot = self.program.global_slot(name).unwrap();
            self.globals.get(slot).unwrap().clone()
        }
    }

    #[test]
    fn arithmetic_and_global_stores() {
        let mut rig = Rig::new("int x;\nevent e() { x = 1 + 2 * 3; }");
        assert_eq!(rig.run("e").unwrap(), RunOutcome::Halted);
        assert_eq!(rig.global("x"), Value::Int(7));
        assert_eq!(rig.vm.stack_len(), 0);
    }

    #[test]
    fn mixed_numeric_comparison_runs() {
        let mut rig = Rig::new(
            "int x;\nfloat f;\n\
             event e() {\n\
               if (x < 1.5) { x = 1; }\n\
               if (f <= 2) { f = 2.5; }\n\
             }",
        );
        assert_eq!(rig.run("e").unwrap(), RunOutcome::Halted);
        assert_eq!(rig.global("x"), Value::Int(1));
        assert_eq!(rig.global("f"), Value::Float(2.5));
    }

    #[test]
    fn while_loop_accumulates() {
        let mut rig = Rig::new(
            "int total;\n\
             event e() {\n\
               int i = 0;\n\
               while (i < 5) { total = total + i; i++; }\n\
             }",
        );
        rig.run("e").unwrap();
        assert_eq!(rig.global("total"), Value::Int(10));
    }

    #[test]
    fn if_else_branches() {
        let mut rig = Rig::new(
            "int x;\nint y;\n\
             event e() {\n\
               if (x > 0) { y = 1; } else { y = 2; }\n\
             }",
        );
        rig.run("e").unwrap();
        assert_eq!(rig.global("y"), Value::Int(2));
        rig.globals.set(0, Value::Int(5)).unwrap();
        rig.run("e").unwrap();
        assert_eq!(rig.global("y"), Value::Int(1));
    }

    #[test]
    fn recursive_function_call() {
        let mut rig = Rig::new(
            "int out;\n\
             function int fact(int n) {\n\
               if (n <= 1) { return 1; }\n\
               return n * fact(n - 1);\n\
             }\n\
             event e() { out = fact(5); }",
        );
        rig.run("e").unwrap();
        assert_eq!(rig.global("out"), Value::Int(120));
        assert_eq!(rig.vm.stack_len(), 0);
    }

    #[test]
    fn recursion_restores_caller_locals() {
        // Each frame owns its locals; the callee must not clobber the
        // caller's slot 0.
        let mut rig = Rig::new(
            "int keep;\n\
             function int dig(int depth) {\n\
               int mine = depth * 10;\n\
               if (depth > 0) { dig(depth - 1); }\n\
               return mine;\n\
             }\n\
             event e() { keep = dig(3); }",
        );
        rig.run("e").unwrap();
        assert_eq!(rig.global("keep"), Value::Int(30));
    }

    #[test]
    fn division_by_zero_faults() {
        let mut rig = Rig::new("int x;\nevent e() { x = 1 / (x - x); }");
        let fault = rig.run("e").unwrap_err();
        assert!(matches!(fault.error, RuntimeError::DivisionByZero));
        // The next run starts from a clean stack.
        let mut ok = Rig::new("int x;\nevent e() { x = 3; }");
        ok.run("e").unwrap();
    }

    #[test]
    fn array_round_trip_and_bounds() {
        let mut rig = Rig::new(
            "int grid[2][3];\nint out;\n\
             event fill() { grid[1][2] = 42; out = grid[1][2]; }\n\
             event oob() { grid[2][0] = 1; }",
        );
        rig.run("fill").unwrap();
        assert_eq!(rig.global("out"), Value::Int(42));
        let fault = rig.run("oob").unwrap_err();
        assert!(matches!(
            fault.error,
            RuntimeError::ArrayIndexOutOfRange { dim: 0, index: 2, extent: 2, .. }
        ));
    }

    #[test]
    fn increment_mutates_the_variable_not_a_copy() {
        let mut rig = Rig::new("int x;\nevent e() { x++; x++; x--; }");
        rig.run("e").unwrap();
        assert_eq!(rig.global("x"), Value::Int(1));
    }

    #[test]
    fn casts_convert_representation() {
        let mut rig = Rig::new(
            "int i;\nfloat f;\n\
             event e() { f = float(7) / 2.0; i = int(f); }",
        );
        rig.run("e").unwrap();
        assert_eq!(rig.global("f"), Value::Float(3.5));
        assert_eq!(rig.global("i"), Value::Int(3));
    }

    #[test]
    fn string_concat_builds_text() {
        let mut rig = Rig::new(
            "string s;\nevent e() { s = \"hp=\" & 25 & \"/\" & 2.5 & \" ok=\" & true; }",
        );
        rig.run("e").unwrap();
        assert_eq!(rig.global("s"), Value::Str("hp=25/2.5 ok=true".into()));
    }

    #[test]
    fn pause_suspends_and_resumes_after_the_instruction() {
        let mut rig = Rig::new("int x;\nevent e() { x = 1; pause(100); x = 2; }");
        let outcome = rig.run("e").unwrap();
        let RunOutcome::Paused { resume_offset, delay } = outcome else {
            panic!("expected a pause, got {outcome:?}");
        };
        assert_eq!(delay, 100);
        assert_eq!(rig.global("x"), Value::Int(1));
        assert_eq!(rig.vm.stack_len(), 0);
        assert_eq!(rig.resume("e", resume_offset).unwrap(), RunOutcome::Halted);
        assert_eq!(rig.global("x"), Value::Int(2));
    }

    #[test]
    fn step_limit_stops_runaway_loops() {
        let mut rig = Rig::new("event e() { while (true) {} }");
        rig.vm = Vm::with_step_limit(1000);
        let fault = rig.run("e").unwrap_err();
        assert!(matches!(fault.error, RuntimeError::StepLimitExceeded { .. }));
    }

    #[test]
    fn native_functions_pop_args_and_push_results() {
        let mut registry = NativeRegistry::new();
        registry.register_native("mix", vec![TypeTag::Int, TypeTag::Int], TypeTag::Int, |ctx| {
            let b = ctx.pop_int()?;
            let a = ctx.pop_int()?;
            ctx.push(Value::Int(a * 100 + b))
        });
        let mut rig = Rig::with_registry("int x;\nevent e() { x = mix(3, 7); }", registry);
        rig.run("e").unwrap();
        assert_eq!(rig.global("x"), Value::Int(307));
    }

    #[test]
    fn member_access_goes_through_accessors() {
        let mut registry = NativeRegistry::new();
        let unit = registry.types_mut().register("Unit");
        registry.register_member(
            "health",
            unit,
            TypeTag::Int,
            |ctx, object| {
                let host = ctx.host.downcast_ref::<Vec<i32>>().unwrap();
                let Value::Object { handle, .. } = object else { panic!() };
                Ok(Value::Int(host[*handle as usize]))
            },
            |ctx, object, value| {
                let host = ctx.host.downcast_mut::<Vec<i32>>().unwrap();
                let Value::Object { handle, .. } = object else { panic!() };
                let Value::Int(v) = value else { panic!() };
                host[*handle as usize] = v;
                Ok(())
            },
        );
        let program = Arc::new(
            compile(
                "object(Unit) u;\nint seen;\n\
                 event e() { u.health = 55; seen = u.health; }",
                &registry.externs(),
            )
            .unwrap(),
        );
        let mut globals = GlobalStore::new(&program, &registry);
        let mut host: Vec<i32> = vec![0];
        let mut vm = Vm::new();
        let mut requests = Vec::new();
        let index = program.event_index("e").unwrap();
        vm.run_event(
            &program,
            &mut globals,
            &registry,
            &mut host,
            &mut requests,
            index,
            None,
        )
        .unwrap();
        assert_eq!(host[0], 55);
        let slot = program.global_slot("seen").unwrap();
        assert_eq!(globals.get(slot).unwrap(), &Value::Int(55));
    }

    #[test]
    fn deterministic_re_execution() {
        let src = "int x;\nint acc[3];\n\
                   event e() {\n\
                     int i = 0;\n\
                     while (i < 3) { acc[i] = x + i; i++; }\n\
                     x = x + acc[2];\n\
                   }";
        let mut a = Rig::new(src);
        let mut b = Rig::new(src);
        a.run("e").unwrap();
        b.run("e").unwrap();
        assert_eq!(a.global("x"), b.global("x"));
        assert_eq!(a.vm.stack_len(), 0);
        assert_eq!(b.vm.stack_len(), 0);
    }
}
