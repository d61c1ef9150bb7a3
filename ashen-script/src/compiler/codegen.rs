//! Code generation: typed AST lowering to packed bytecode plus the program's
//! symbol and metadata tables.
//!
//! Every grammar production lowers to one [`CodeBlock`]; blocks compose by
//! concatenation and forward jumps are patched inside the owning block once
//! their target offset is known. Type checking happens here, before any byte
//! is emitted for the offending node; the interpreter trusts the result.

use std::collections::HashMap;

use crate::bytecode::{CodeBlock, Opcode};
use crate::program::{
    ArrayDef, CodeRange, DebugInfo, EventDef, Program, TriggerDef, TriggerKind,
};
use crate::registry::Externs;
use crate::stack::{BinaryOp, CastKind, UnaryOp};
use crate::value::{TypeTag, Value};

use super::ast::{BinOp, Expr, ExprKind, Item, Stmt, StmtKind, TriggerSpec, TypeName, UnOp};
use super::error::CompileError;

const MAX_GLOBAL_SLOTS: usize = u16::MAX as usize + 1;
const MAX_LOCAL_SLOTS: usize = u8::MAX as usize + 1;
const MAX_TABLE: usize = u16::MAX as usize + 1;

struct GlobalSym {
    slot: u32,
    ty: TypeTag,
}

struct EventSig {
    name: String,
    param_types: Vec<TypeTag>,
    ret: TypeTag,
    trigger: Option<u16>,
    is_function: bool,
}

/// Per-body state while lowering one event, function or trigger test.
struct FnCtx {
    locals: Vec<(String, TypeTag)>,
    ret: TypeTag,
    is_event: bool,
    is_function: bool,
}

impl FnCtx {
    fn lookup(&self, name: &str) -> Option<(u8, TypeTag)> {
        self.locals
            .iter()
            .position(|(n, _)| n == name)
            .map(|i| (i as u8, self.locals[i].1))
    }
}

pub struct CodeGen<'a> {
    externs: &'a Externs,
    globals: HashMap<String, GlobalSym>,
    global_types: Vec<TypeTag>,
    global_inits: Vec<Option<Value>>,
    global_names: Vec<String>,
    arrays: HashMap<String, u16>,
    array_defs: Vec<ArrayDef>,
    triggers: HashMap<String, u16>,
    trigger_names: Vec<String>,
    events: HashMap<String, u16>,
    event_sigs: Vec<EventSig>,
}

pub fn generate(externs: &Externs, items: &[Item]) -> Result<Program, CompileError> {
    let mut gen = CodeGen {
        externs,
        globals: HashMap::new(),
        global_types: Vec::new(),
        global_inits: Vec::new(),
        global_names: Vec::new(),
        arrays: HashMap::new(),
        array_defs: Vec::new(),
        triggers: HashMap::new(),
        trigger_names: Vec::new(),
        events: HashMap::new(),
        event_sigs: Vec::new(),
    };
    gen.collect(items)?;
    gen.emit(items)
}

impl<'a> CodeGen<'a> {
    fn resolve_type(&self, ty: &TypeName, line: u32) -> Result<TypeTag, CompileError> {
        match ty {
            TypeName::Int => Ok(TypeTag::Int),
            TypeName::Float => Ok(TypeTag::Float),
            TypeName::Str => Ok(TypeTag::Str),
            TypeName::Bool => Ok(TypeTag::Bool),
            TypeName::Void => Ok(TypeTag::Void),
            TypeName::Object(name) => self
                .externs
                .types
                .lookup(name)
                .map(TypeTag::Object)
                .ok_or_else(|| CompileError::UnknownType { line, name: name.clone() }),
        }
    }

    fn check_new_symbol(&self, name: &str, line: u32) -> Result<(), CompileError> {
        let taken = self.globals.contains_key(name)
            || self.arrays.contains_key(name)
            || self.triggers.contains_key(name)
            || self.events.contains_key(name)
            || self.externs.natives.iter().any(|n| n.name == name)
            || self.externs.constants.iter().any(|(c, _)| c == name);
        if taken {
            Err(CompileError::Duplicate { line, name: name.to_owned() })
        } else {
            Ok(())
        }
    }

    fn assignable(&self, line: u32, want: TypeTag, got: TypeTag) -> Result<(), CompileError> {
        if self.externs.types.equivalent(want, got) {
            Ok(())
        } else {
            Err(CompileError::TypeMismatch { line, expected: want, found: got })
        }
    }

    // Pass one: symbol collection. Storage slots and table indices are fixed
    // here so bodies may reference declarations in any source order.
    fn collect(&mut self, items: &[Item]) -> Result<(), CompileError> {
        for item in items {
            match item {
                Item::Global { ty, name, line, .. } => {
                    self.check_new_symbol(name, *line)?;
                    let tag = self.resolve_type(ty, *line)?;
                    if tag == TypeTag::Void {
                        return Err(CompileError::Syntax {
                            line: *line,
                            msg: format!("variable '{name}' cannot be void"),
                        });
                    }
                    self.push_global_slot(name, tag, *line)?;
                }
                Item::Array { ty, name, extents, line } => {
                    self.check_new_symbol(name, *line)?;
                    let tag = self.resolve_type(ty, *line)?;
                    if extents.is_empty() || extents.contains(&0) {
                        return Err(CompileError::Syntax {
                            line: *line,
                            msg: format!("array '{name}' must have non-zero extents"),
                        });
                    }
                    if self.array_defs.len() >= MAX_TABLE {
                        return Err(CompileError::TooMany {
                            line: *line,
                            what: "arrays",
                            limit: MAX_TABLE,
                        });
                    }
                    let base = self.global_types.len() as u32;
                    let count: u32 = extents.iter().product();
                    for _ in 0..count {
                        self.push_global_slot(name, tag, *line)?;
                    }
                    self.arrays.insert(name.clone(), self.array_defs.len() as u16);
                    self.array_defs.push(ArrayDef { ty: tag, extents: extents.clone(), base });
                }
                Item::Trigger { name, line, .. } => {
                    self.check_new_symbol(name, *line)?;
                    if self.trigger_names.len() >= MAX_TABLE {
                        return Err(CompileError::TooMany {
                            line: *line,
                            what: "triggers",
                            limit: MAX_TABLE,
                        });
                    }
                    self.triggers.insert(name.clone(), self.trigger_names.len() as u16);
                    self.trigger_names.push(name.clone());
                }
                Item::Event { .. } | Item::Function { .. } => {}
            }
        }
        // Events and functions second so trigger links resolve regardless of
        // declaration order.
        let mut bound: HashMap<u16, String> = HashMap::new();
        for item in items {
            match item {
                Item::Event { name, trigger, line, .. } => {
                    self.check_new_symbol(name, *line)?;
                    let link = match trigger {
                        Some(tname) => {
                            let idx = *self.triggers.get(tname).ok_or_else(|| {
                                CompileError::Undeclared { line: *line, name: tname.clone() }
                            })?;
                            if bound.insert(idx, name.clone()).is_some() {
                                return Err(CompileError::TriggerRebound {
                                    line: *line,
                                    name: tname.clone(),
                                });
                            }
                            Some(idx)
                        }
                        None => None,
                    };
                    self.push_event_sig(EventSig {
                        name: name.clone(),
                        param_types: Vec::new(),
                        ret: TypeTag::Void,
                        trigger: link,
                        is_function: false,
                    }, *line)?;
                }
                Item::Function { name, ret, params, line, .. } => {
                    self.check_new_symbol(name, *line)?;
                    if params.len() >= MAX_LOCAL_SLOTS {
                        return Err(CompileError::TooMany {
                            line: *line,
                            what: "parameters",
                            limit: MAX_LOCAL_SLOTS,
                        });
                    }
                    let mut param_types = Vec::with_capacity(params.len());
                    for (pty, _) in params {
                        let tag = self.resolve_type(pty, *line)?;
                        param_types.push(tag);
                    }
                    let ret = self.resolve_type(ret, *line)?;
                    self.push_event_sig(EventSig {
                        name: name.clone(),
                        param_types,
                        ret,
                        trigger: None,
                        is_function: true,
                    }, *line)?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn push_global_slot(&mut self, name: &str, ty: TypeTag, line: u32) -> Result<(), CompileError> {
        if self.global_types.len() >= MAX_GLOBAL_SLOTS {
            return Err(CompileError::TooMany {
                line,
                what: "global variable slots",
                limit: MAX_GLOBAL_SLOTS,
            });
        }
        if !self.arrays.contains_key(name) && !self.globals.contains_key(name) {
            self.globals.insert(
                name.to_owned(),
                GlobalSym { slot: self.global_types.len() as u32, ty },
            );
        }
        self.global_types.push(ty);
        self.global_inits.push(None);
        self.global_names.push(name.to_owned());
        Ok(())
    }

    fn push_event_sig(&mut self, sig: EventSig, line: u32) -> Result<(), CompileError> {
        if self.event_sigs.len() >= MAX_TABLE {
            return Err(CompileError::TooMany { line, what: "events", limit: MAX_TABLE });
        }
        self.events.insert(sig.name.clone(), self.event_sigs.len() as u16);
        self.event_sigs.push(sig);
        Ok(())
    }

    // Pass two: emission.
    fn emit(mut self, items: &[Item]) -> Result<Program, CompileError> {
        // Fold global initializers first; arrays are excluded because the
        // scalar path never sees Item::Array initializers.
        for item in items {
            if let Item::Global { name, init: Some(expr), line, .. } = item {
                let sym = &self.globals[name];
                let value = self.fold_const(expr)?;
                self.assignable(*line, sym.ty, value.type_tag())?;
                let slot = sym.slot as usize;
                self.global_inits[slot] = Some(value);
            }
        }

        let mut master = CodeBlock::new();
        let mut events: Vec<EventDef> = Vec::new();
        let mut test_ranges: HashMap<u16, CodeRange> = HashMap::new();

        for item in items {
            match item {
                Item::Event { name, body, line, .. } => {
                    let index = self.events[name];
                    let mut fcx = FnCtx {
                        locals: Vec::new(),
                        ret: TypeTag::Void,
                        is_event: true,
                        is_function: false,
                    };
                    let mut block = CodeBlock::new();
                    block.note_label(name.clone());
                    block.note_line(*line);
                    for stmt in body {
                        let child = self.gen_stmt(&mut fcx, stmt)?;
                        block.append(child);
                    }
                    block.emit_op(Opcode::Exit);
                    let start = master.len();
                    master.append(block);
                    debug_assert_eq!(index as usize, events.len());
                    events.push(EventDef {
                        range: CodeRange { start, end: master.len() },
                        trigger: self.event_sigs[index as usize].trigger,
                        locals: fcx.locals.iter().map(|(_, t)| *t).collect(),
                        params: 0,
                        ret: TypeTag::Void,
                    });
                }
                Item::Function { name, params, body, line, .. } => {
                    let index = self.events[name];
                    let sig = &self.event_sigs[index as usize];
                    let ret = sig.ret;
                    if ret != TypeTag::Void && !body_returns(body) {
                        return Err(CompileError::MissingReturn {
                            line: *line,
                            name: name.clone(),
                        });
                    }
                    let mut fcx = FnCtx {
                        locals: params
                            .iter()
                            .zip(&sig.param_types)
                            .map(|((_, pname), ty)| (pname.clone(), *ty))
                            .collect(),
                        ret,
                        is_event: false,
                        is_function: true,
                    };
                    let mut block = CodeBlock::new();
                    block.note_label(name.clone());
                    block.note_line(*line);
                    // Prolog: arguments were pushed in declaration order, so
                    // the pops land in the last slot first.
                    for slot in (0..params.len()).rev() {
                        block.emit_op(Opcode::PopLocal);
                        block.emit_u8(slot as u8);
                    }
                    for stmt in body {
                        let child = self.gen_stmt(&mut fcx, stmt)?;
                        block.append(child);
                    }
                    block.emit_op(Opcode::Exit);
                    let start = master.len();
                    master.append(block);
                    debug_assert_eq!(index as usize, events.len());
                    events.push(EventDef {
                        range: CodeRange { start, end: master.len() },
                        trigger: None,
                        locals: fcx.locals.iter().map(|(_, t)| *t).collect(),
                        params: params.len() as u8,
                        ret,
                    });
                }
                Item::Trigger { name, spec: TriggerSpec::Test { expr, .. }, .. } => {
                    let fcx = FnCtx {
                        locals: Vec::new(),
                        ret: TypeTag::Void,
                        is_event: false,
                        is_function: false,
                    };
                    let (mut block, ty) = self.gen_expr(&fcx, expr)?;
                    if ty != TypeTag::Bool {
                        return Err(CompileError::TypeMismatch {
                            line: expr.line,
                            expected: TypeTag::Bool,
                            found: ty,
                        });
                    }
                    block.emit_op(Opcode::Exit);
                    let start = master.len();
                    master.append(block);
                    test_ranges.insert(self.triggers[name], CodeRange { start, end: master.len() });
                }
                _ => {}
            }
        }

        let mut triggers: Vec<TriggerDef> = Vec::with_capacity(self.trigger_names.len());
        for item in items {
            if let Item::Trigger { name, spec, line } = item {
                let index = self.triggers[name];
                debug_assert_eq!(index as usize, triggers.len());
                let def = match spec {
                    TriggerSpec::Init => TriggerDef {
                        kind: TriggerKind::Init,
                        interval: 0,
                        test: None,
                        callback: None,
                    },
                    TriggerSpec::Wait(interval) => TriggerDef {
                        kind: TriggerKind::Wait,
                        interval: *interval,
                        test: None,
                        callback: None,
                    },
                    TriggerSpec::Every(interval) => TriggerDef {
                        kind: TriggerKind::Every,
                        interval: *interval,
                        test: None,
                        callback: None,
                    },
                    TriggerSpec::Test { interval, .. } => TriggerDef {
                        kind: TriggerKind::Code,
                        interval: *interval,
                        test: Some(test_ranges[&index]),
                        callback: None,
                    },
                    TriggerSpec::Callback(cb) => {
                        let kind = self
                            .externs
                            .callbacks
                            .iter()
                            .position(|c| c == cb)
                            .ok_or_else(|| CompileError::UnknownCallback {
                                line: *line,
                                name: cb.clone(),
                            })?;
                        TriggerDef {
                            kind: TriggerKind::Callback,
                            interval: 0,
                            test: None,
                            callback: Some(kind as u16),
                        }
                    }
                };
                triggers.push(def);
            }
        }

        let (code, lines, labels) = master.into_parts();
        Ok(Program {
            code,
            triggers,
            events,
            globals: self.global_types,
            inits: self.global_inits,
            arrays: self.array_defs,
            debug: Some(DebugInfo {
                lines,
                labels,
                trigger_names: self.trigger_names,
                event_names: self.event_sigs.iter().map(|s| s.name.clone()).collect(),
                global_names: self.global_names,
            }),
        })
    }

    fn fold_const(&self, expr: &Expr) -> Result<Value, CompileError> {
        match &expr.kind {
            ExprKind::IntLit(n) => Ok(Value::Int(*n)),
            ExprKind::FloatLit(n) => Ok(Value::Float(*n)),
            ExprKind::StrLit(s) => Ok(Value::Str(s.clone())),
            ExprKind::BoolLit(b) => Ok(Value::Bool(*b)),
            ExprKind::Unary { op: UnOp::Neg, expr: inner } => match self.fold_const(inner)? {
                Value::Int(n) => Ok(Value::Int(n.wrapping_neg())),
                Value::Float(n) => Ok(Value::Float(-n)),
                _ => Err(CompileError::NonConstantInitializer { line: expr.line }),
            },
            ExprKind::Ident(name) => self
                .externs
                .constants
                .iter()
                .find(|(c, _)| c == name)
                .map(|(_, v)| v.clone())
                .ok_or(CompileError::NonConstantInitializer { line: expr.line }),
            _ => Err(CompileError::NonConstantInitializer { line: expr.line }),
        }
    }

    fn gen_stmt(&self, fcx: &mut FnCtx, stmt: &Stmt) -> Result<CodeBlock, CompileError> {
        let mut block = CodeBlock::new();
        block.note_line(stmt.line);
        match &stmt.kind {
            StmtKind::Local { ty, name, init } => {
                let tag = self.resolve_type(ty, stmt.line)?;
                if tag == TypeTag::Void {
                    return Err(CompileError::Syntax {
                        line: stmt.line,
                        msg: format!("variable '{name}' cannot be void"),
                    });
                }
                if fcx.lookup(name).is_some() {
                    return Err(CompileError::Duplicate { line: stmt.line, name: name.clone() });
                }
                if fcx.locals.len() >= MAX_LOCAL_SLOTS {
                    return Err(CompileError::TooMany {
                        line: stmt.line,
                        what: "local variables",
                        limit: MAX_LOCAL_SLOTS,
                    });
                }
                let slot = fcx.locals.len() as u8;
                fcx.locals.push((name.clone(), tag));
                if let Some(expr) = init {
                    let (value, vty) = self.gen_expr(fcx, expr)?;
                    self.assignable(stmt.line, tag, vty)?;
                    block.append(value);
                    block.emit_op(Opcode::PopLocal);
                    block.emit_u8(slot);
                }
            }
            StmtKind::Assign { target, value } => {
                self.gen_assign(fcx, &mut block, target, value)?;
            }
            StmtKind::IncDec { target, increment } => {
                let ExprKind::Ident(name) = &target.kind else {
                    return Err(CompileError::Syntax {
                        line: stmt.line,
                        msg: "'++'/'--' require a plain variable".into(),
                    });
                };
                let ty = if let Some((slot, ty)) = fcx.lookup(name) {
                    block.emit_op(Opcode::PushLocalRef);
                    block.emit_u8(slot);
                    ty
                } else if let Some(sym) = self.globals.get(name) {
                    block.emit_op(Opcode::PushGlobalRef);
                    block.emit_u16(sym.slot as u16);
                    sym.ty
                } else {
                    return Err(CompileError::Undeclared { line: stmt.line, name: name.clone() });
                };
                if ty != TypeTag::Int && ty != TypeTag::Float {
                    return Err(CompileError::TypeMismatch {
                        line: stmt.line,
                        expected: TypeTag::Int,
                        found: ty,
                    });
                }
                block.emit_op(Opcode::Unary);
                block.emit_u8(if *increment { UnaryOp::Inc } else { UnaryOp::Dec }.as_byte());
            }
            StmtKind::If { cond, then_body, else_body } => {
                let (cond_block, cty) = self.gen_expr(fcx, cond)?;
                if cty != TypeTag::Bool {
                    return Err(CompileError::TypeMismatch {
                        line: cond.line,
                        expected: TypeTag::Bool,
                        found: cty,
                    });
                }
                block.append(cond_block);
                let skip_then = block.emit_jump(Opcode::JumpIfFalse);
                for s in then_body {
                    let child = self.gen_stmt(fcx, s)?;
                    block.append(child);
                }
                match else_body {
                    Some(else_body) => {
                        let skip_else = block.emit_jump(Opcode::Jump);
                        block.patch_jump(skip_then, block.len());
                        for s in else_body {
                            let child = self.gen_stmt(fcx, s)?;
                            block.append(child);
                        }
                        block.patch_jump(skip_else, block.len());
                    }
                    None => block.patch_jump(skip_then, block.len()),
                }
            }
            StmtKind::While { cond, body } => {
                let top = block.len();
                let (cond_block, cty) = self.gen_expr(fcx, cond)?;
                if cty != TypeTag::Bool {
                    return Err(CompileError::TypeMismatch {
                        line: cond.line,
                        expected: TypeTag::Bool,
                        found: cty,
                    });
                }
                block.append(cond_block);
                let exit = block.emit_jump(Opcode::JumpIfFalse);
                for s in body {
                    let child = self.gen_stmt(fcx, s)?;
                    block.append(child);
                }
                let back = block.emit_jump(Opcode::Jump);
                block.patch_jump(back, top);
                block.patch_jump(exit, block.len());
            }
            StmtKind::Return(value) => {
                if !fcx.is_function {
                    return Err(CompileError::ReturnOutsideFunction { line: stmt.line });
                }
                match value {
                    Some(expr) => {
                        let (child, ty) = self.gen_expr(fcx, expr)?;
                        self.assignable(stmt.line, fcx.ret, ty)?;
                        block.append(child);
                    }
                    None => {
                        if fcx.ret != TypeTag::Void {
                            return Err(CompileError::TypeMismatch {
                                line: stmt.line,
                                expected: fcx.ret,
                                found: TypeTag::Void,
                            });
                        }
                    }
                }
                block.emit_op(Opcode::Exit);
            }
            StmtKind::Pause(delay) => {
                if !fcx.is_event {
                    return Err(CompileError::PauseOutsideEvent { line: stmt.line });
                }
                let (child, ty) = self.gen_expr(fcx, delay)?;
                if ty != TypeTag::Int {
                    return Err(CompileError::TypeMismatch {
                        line: stmt.line,
                        expected: TypeTag::Int,
                        found: ty,
                    });
                }
                block.append(child);
                block.emit_op(Opcode::Pause);
            }
            StmtKind::Expr(expr) => {
                let (child, ty) = self.gen_expr(fcx, expr)?;
                block.append(child);
                if ty != TypeTag::Void {
                    block.emit_op(Opcode::PopDiscard);
                }
            }
        }
        Ok(block)
    }

    fn gen_assign(
        &self,
        fcx: &FnCtx,
        block: &mut CodeBlock,
        target: &Expr,
        value: &Expr,
    ) -> Result<(), CompileError> {
        match &target.kind {
            ExprKind::Ident(name) => {
                if let Some((slot, ty)) = fcx.lookup(name) {
                    let (child, vty) = self.gen_expr(fcx, value)?;
                    self.assignable(target.line, ty, vty)?;
                    block.append(child);
                    block.emit_op(Opcode::PopLocal);
                    block.emit_u8(slot);
                } else if let Some(sym) = self.globals.get(name) {
                    let (child, vty) = self.gen_expr(fcx, value)?;
                    self.assignable(target.line, sym.ty, vty)?;
                    block.append(child);
                    block.emit_op(Opcode::PopGlobal);
                    block.emit_u16(sym.slot as u16);
                } else {
                    return Err(CompileError::Undeclared {
                        line: target.line,
                        name: name.clone(),
                    });
                }
            }
            ExprKind::Index { name, indices } => {
                let array = self.gen_array_indices(fcx, block, name, indices, target.line)?;
                let (child, vty) = self.gen_expr(fcx, value)?;
                self.assignable(target.line, self.array_defs[array as usize].ty, vty)?;
                block.append(child);
                block.emit_op(Opcode::StoreArray);
                block.emit_u16(array);
            }
            ExprKind::Member { object, member } => {
                let (obj_block, obj_ty) = self.gen_expr(fcx, object)?;
                let (index, value_ty) = self.find_member(member, obj_ty, target.line)?;
                let (child, vty) = self.gen_expr(fcx, value)?;
                self.assignable(target.line, value_ty, vty)?;
                block.append(obj_block);
                block.append(child);
                block.emit_op(Opcode::MemberSet);
                block.emit_u16(index);
            }
            _ => {
                return Err(CompileError::Syntax {
                    line: target.line,
                    msg: "invalid assignment target".into(),
                })
            }
        }
        Ok(())
    }

    /// Emit one index expression per declared dimension, in dimension order.
    fn gen_array_indices(
        &self,
        fcx: &FnCtx,
        block: &mut CodeBlock,
        name: &str,
        indices: &[Expr],
        line: u32,
    ) -> Result<u16, CompileError> {
        let Some(&array) = self.arrays.get(name) else {
            if self.globals.contains_key(name) {
                return Err(CompileError::NotAnArray { line, name: name.to_owned() });
            }
            return Err(CompileError::Undeclared { line, name: name.to_owned() });
        };
        let dims = self.array_defs[array as usize].extents.len();
        if indices.len() != dims {
            return Err(CompileError::DimensionMismatch {
                line,
                name: name.to_owned(),
                expected: dims,
                found: indices.len(),
            });
        }
        for index in indices {
            let (child, ty) = self.gen_expr(fcx, index)?;
            if ty != TypeTag::Int {
                return Err(CompileError::TypeMismatch {
                    line: index.line,
                    expected: TypeTag::Int,
                    found: ty,
                });
            }
            block.append(child);
        }
        Ok(array)
    }

    fn find_member(
        &self,
        name: &str,
        obj_ty: TypeTag,
        line: u32,
    ) -> Result<(u16, TypeTag), CompileError> {
        let TypeTag::Object(_) = obj_ty else {
            return Err(CompileError::UnknownMember { line, ty: obj_ty, name: name.to_owned() });
        };
        self.externs
            .members
            .iter()
            .position(|m| m.name == name && self.externs.types.equivalent(TypeTag::Object(m.object_ty), obj_ty))
            .map(|i| (i as u16, self.externs.members[i].value_ty))
            .ok_or_else(|| CompileError::UnknownMember { line, ty: obj_ty, name: name.to_owned() })
    }

    fn gen_expr(&self, fcx: &FnCtx, expr: &Expr) -> Result<(CodeBlock, TypeTag), CompileError> {
        let mut block = CodeBlock::new();
        let ty = match &expr.kind {
            ExprKind::IntLit(n) => {
                block.emit_op(Opcode::PushInt);
                block.emit_i32(*n);
                TypeTag::Int
            }
            ExprKind::FloatLit(n) => {
                block.emit_op(Opcode::PushFloat);
                block.emit_u32(n.to_bits());
                TypeTag::Float
            }
            ExprKind::StrLit(s) => {
                block.emit_op(Opcode::PushStr);
                block.emit_str(s);
                TypeTag::Str
            }
            ExprKind::BoolLit(b) => {
                block.emit_op(Opcode::PushBool);
                block.emit_u8(*b as u8);
                TypeTag::Bool
            }
            ExprKind::Ident(name) => self.gen_ident(fcx, &mut block, name, expr.line)?,
            ExprKind::Binary { op, lhs, rhs } => {
                let (lhs_block, lt) = self.gen_expr(fcx, lhs)?;
                let (rhs_block, rt) = self.gen_expr(fcx, rhs)?;
                let (stack_op, out) = self.check_binary(*op, lt, rt, expr.line)?;
                block.append(lhs_block);
                block.append(rhs_block);
                block.emit_op(Opcode::Binary);
                block.emit_u8(stack_op.as_byte());
                out
            }
            ExprKind::Unary { op, expr: inner } => {
                let (child, ty) = self.gen_expr(fcx, inner)?;
                let (stack_op, out) = match op {
                    UnOp::Neg if ty == TypeTag::Int || ty == TypeTag::Float => (UnaryOp::Neg, ty),
                    UnOp::Not if ty == TypeTag::Bool => (UnaryOp::Not, ty),
                    UnOp::Neg => {
                        return Err(CompileError::TypeMismatch {
                            line: expr.line,
                            expected: TypeTag::Int,
                            found: ty,
                        })
                    }
                    UnOp::Not => {
                        return Err(CompileError::TypeMismatch {
                            line: expr.line,
                            expected: TypeTag::Bool,
                            found: ty,
                        })
                    }
                };
                block.append(child);
                block.emit_op(Opcode::Unary);
                block.emit_u8(stack_op.as_byte());
                out
            }
            ExprKind::Cast { to, expr: inner } => {
                let (child, from) = self.gen_expr(fcx, inner)?;
                let to_tag = self.resolve_type(to, expr.line)?;
                let kind = match (from, to_tag) {
                    (TypeTag::Int | TypeTag::Float, TypeTag::Int) => CastKind::ToInt,
                    (TypeTag::Int | TypeTag::Float, TypeTag::Float) => CastKind::ToFloat,
                    _ => {
                        return Err(CompileError::BadCast {
                            line: expr.line,
                            from,
                            to: to_tag,
                        })
                    }
                };
                block.append(child);
                if from != to_tag {
                    block.emit_op(Opcode::Cast);
                    block.emit_u8(kind.as_byte());
                }
                to_tag
            }
            ExprKind::Call { name, args } => self.gen_call(fcx, &mut block, name, args, expr.line)?,
            ExprKind::Index { name, indices } => {
                let array = self.gen_array_indices(fcx, &mut block, name, indices, expr.line)?;
                block.emit_op(Opcode::LoadArray);
                block.emit_u16(array);
                self.array_defs[array as usize].ty
            }
            ExprKind::Member { object, member } => {
                let (obj_block, obj_ty) = self.gen_expr(fcx, object)?;
                let (index, value_ty) = self.find_member(member, obj_ty, expr.line)?;
                block.append(obj_block);
                block.emit_op(Opcode::MemberGet);
                block.emit_u16(index);
                value_ty
            }
        };
        Ok((block, ty))
    }

    fn gen_ident(
        &self,
        fcx: &FnCtx,
        block: &mut CodeBlock,
        name: &str,
        line: u32,
    ) -> Result<TypeTag, CompileError> {
        if let Some((slot, ty)) = fcx.lookup(name) {
            block.emit_op(Opcode::PushLocal);
            block.emit_u8(slot);
            return Ok(ty);
        }
        if let Some(sym) = self.globals.get(name) {
            block.emit_op(Opcode::PushGlobal);
            block.emit_u16(sym.slot as u16);
            return Ok(sym.ty);
        }
        if let Some((_, value)) = self.externs.constants.iter().find(|(c, _)| c == name) {
            return match value {
                Value::Int(n) => {
                    block.emit_op(Opcode::PushInt);
                    block.emit_i32(*n);
                    Ok(TypeTag::Int)
                }
                Value::Float(n) => {
                    block.emit_op(Opcode::PushFloat);
                    block.emit_u32(n.to_bits());
                    Ok(TypeTag::Float)
                }
                Value::Bool(b) => {
                    block.emit_op(Opcode::PushBool);
                    block.emit_u8(*b as u8);
                    Ok(TypeTag::Bool)
                }
                Value::Str(s) => {
                    block.emit_op(Opcode::PushStr);
                    block.emit_str(s);
                    Ok(TypeTag::Str)
                }
                other => Err(CompileError::Syntax {
                    line,
                    msg: format!("constant '{name}' has unsupported type {}", other.type_tag()),
                }),
            };
        }
        if let Some(&idx) = self.triggers.get(name) {
            block.emit_op(Opcode::PushTrigger);
            block.emit_u16(idx);
            return Ok(TypeTag::Trigger);
        }
        if let Some(&idx) = self.events.get(name) {
            block.emit_op(Opcode::PushEvent);
            block.emit_u16(idx);
            return Ok(TypeTag::Event);
        }
        Err(CompileError::Undeclared { line, name: name.to_owned() })
    }

    fn gen_call(
        &self,
        fcx: &FnCtx,
        block: &mut CodeBlock,
        name: &str,
        args: &[Expr],
        line: u32,
    ) -> Result<TypeTag, CompileError> {
        if let Some(&index) = self.events.get(name) {
            let sig = &self.event_sigs[index as usize];
            if args.len() != sig.param_types.len() {
                return Err(CompileError::ArityMismatch {
                    line,
                    name: name.to_owned(),
                    expected: sig.param_types.len(),
                    found: args.len(),
                });
            }
            for (arg, want) in args.iter().zip(&sig.param_types) {
                let (child, got) = self.gen_expr(fcx, arg)?;
                self.assignable(arg.line, *want, got)?;
                block.append(child);
            }
            block.emit_op(Opcode::Call);
            block.emit_u16(index);
            return Ok(sig.ret);
        }
        if let Some(pos) = self.externs.natives.iter().position(|n| n.name == name) {
            let sig = &self.externs.natives[pos];
            if args.len() != sig.params.len() {
                return Err(CompileError::ArityMismatch {
                    line,
                    name: name.to_owned(),
                    expected: sig.params.len(),
                    found: args.len(),
                });
            }
            for (arg, want) in args.iter().zip(&sig.params) {
                let (child, got) = self.gen_expr(fcx, arg)?;
                self.assignable(arg.line, *want, got)?;
                block.append(child);
            }
            block.emit_op(Opcode::CallNative);
            block.emit_u16(pos as u16);
            return Ok(sig.ret);
        }
        if self.globals.contains_key(name)
            || self.arrays.contains_key(name)
            || self.triggers.contains_key(name)
        {
            return Err(CompileError::NotCallable { line, name: name.to_owned() });
        }
        Err(CompileError::Undeclared { line, name: name.to_owned() })
    }

    fn check_binary(
        &self,
        op: BinOp,
        lt: TypeTag,
        rt: TypeTag,
        line: u32,
    ) -> Result<(BinaryOp, TypeTag), CompileError> {
        let numeric = |t: TypeTag| t == TypeTag::Int || t == TypeTag::Float;
        let scalar = |t: TypeTag| {
            matches!(t, TypeTag::Bool | TypeTag::Int | TypeTag::Float | TypeTag::Str)
        };
        let promoted = if lt == TypeTag::Float || rt == TypeTag::Float {
            TypeTag::Float
        } else {
            TypeTag::Int
        };
        let fail = |op: &'static str| CompileError::BadOperands { line, op, lhs: lt, rhs: rt };
        match op {
            BinOp::Add if numeric(lt) && numeric(rt) => Ok((BinaryOp::Add, promoted)),
            BinOp::Sub if numeric(lt) && numeric(rt) => Ok((BinaryOp::Sub, promoted)),
            BinOp::Mul if numeric(lt) && numeric(rt) => Ok((BinaryOp::Mul, promoted)),
            BinOp::Div if numeric(lt) && numeric(rt) => Ok((BinaryOp::Div, promoted)),
            BinOp::Mod if lt == TypeTag::Int && rt == TypeTag::Int => {
                Ok((BinaryOp::Mod, TypeTag::Int))
            }
            // Concat is the one operator exempt from the equivalence check;
            // it accepts any scalar pair.
            BinOp::Concat if scalar(lt) && scalar(rt) => Ok((BinaryOp::Concat, TypeTag::Str)),
            BinOp::Eq | BinOp::Ne => {
                let equivalent = self.externs.types.equivalent(lt, rt)
                    || self.externs.types.equivalent(rt, lt);
                if !equivalent {
                    return Err(fail(if op == BinOp::Eq { "==" } else { "!=" }));
                }
                Ok((
                    if op == BinOp::Eq { BinaryOp::Eq } else { BinaryOp::Ne },
                    TypeTag::Bool,
                ))
            }
            BinOp::Lt if numeric(lt) && numeric(rt) => Ok((BinaryOp::Lt, TypeTag::Bool)),
            BinOp::Le if numeric(lt) && numeric(rt) => Ok((BinaryOp::Le, TypeTag::Bool)),
            BinOp::Gt if numeric(lt) && numeric(rt) => Ok((BinaryOp::Gt, TypeTag::Bool)),
            BinOp::Ge if numeric(lt) && numeric(rt) => Ok((BinaryOp::Ge, TypeTag::Bool)),
            BinOp::And if lt == TypeTag::Bool && rt == TypeTag::Bool => {
                Ok((BinaryOp::And, TypeTag::Bool))
            }
            BinOp::Or if lt == TypeTag::Bool && rt == TypeTag::Bool => {
                Ok((BinaryOp::Or, TypeTag::Bool))
            }
            BinOp::Add => Err(fail("+")),
            BinOp::Sub => Err(fail("-")),
            BinOp::Mul => Err(fail("*")),
            BinOp::Div => Err(fail("/")),
            BinOp::Mod => Err(fail("%")),
            BinOp::Concat => Err(fail("&")),
            BinOp::Lt => Err(fail("<")),
            BinOp::Le => Err(fail("<=")),
            BinOp::Gt => Err(fail(">")),
            BinOp::Ge => Err(fail(">=")),
            BinOp::And => Err(fail("&&")),
            BinOp::Or => Err(fail("||")),
        }
    }
}

/// Whether every path through `body` ends in a `return`. Loops never count,
/// even when the condition is constant, so the check stays conservative.
fn body_returns(body: &[Stmt]) -> bool {
    body.iter().any(stmt_returns)
}

fn stmt_returns(stmt: &Stmt) -> bool {
    match &stmt.kind {
        StmtKind::Return(_) => true,
        StmtKind::If { then_body, else_body: Some(els), .. } => {
            body_returns(then_body) && body_returns(els)
        }
        _ => false,
    }
}
