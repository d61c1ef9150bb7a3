//! Human-readable listings of compiled programs, used by the disassembler
//! tool and handy when debugging codegen.

use serde::{Deserialize, Serialize};

use crate::bytecode::{CodeReader, Opcode};
use crate::error::RuntimeError;
use crate::program::{CodeRange, Program};
use crate::registry::Externs;
use crate::stack::{BinaryOp, CastKind, UnaryOp};

/// One decoded instruction. Operands are rendered as strings so the listing
/// serializes cleanly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inst {
    pub offset: u32,
    pub mnemonic: String,
    pub operands: Vec<String>,
}

/// A decoded event body or trigger test body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Listing {
    pub label: String,
    pub start: u32,
    pub end: u32,
    pub insts: Vec<Inst>,
}

/// Decode every event body and code-trigger test body in the program.
/// Native and member operands resolve against the same `Externs` snapshot
/// the program was compiled with.
pub fn disassemble(program: &Program, externs: &Externs) -> Result<Vec<Listing>, RuntimeError> {
    let mut listings = Vec::new();
    for (i, event) in program.events.iter().enumerate() {
        let label = program
            .event_name(i as u16)
            .map(str::to_owned)
            .unwrap_or_else(|| format!("event_{i}"));
        listings.push(decode_range(program, externs, &label, event.range)?);
    }
    for (i, trigger) in program.triggers.iter().enumerate() {
        let Some(test) = trigger.test else { continue };
        let label = program
            .trigger_name(i as u16)
            .map(|n| format!("{n}.test"))
            .unwrap_or_else(|| format!("trigger_{i}.test"));
        listings.push(decode_range(program, externs, &label, test)?);
    }
    Ok(listings)
}

fn decode_range(
    program: &Program,
    externs: &Externs,
    label: &str,
    range: CodeRange,
) -> Result<Listing, RuntimeError> {
    let mut reader = CodeReader::new(&program.code, range.start, range.end, range.start);
    let mut insts = Vec::new();
    while !reader.at_end() {
        let offset = reader.pc;
        let byte = reader.read_u8()?;
        let Some(op) = Opcode::decode(byte) else {
            return Err(RuntimeError::InvalidOpcode { opcode: byte, pc: offset });
        };
        insts.push(decode_inst(program, externs, &mut reader, op, offset)?);
    }
    Ok(Listing {
        label: label.to_owned(),
        start: range.start,
        end: range.end,
        insts,
    })
}

fn decode_inst(
    program: &Program,
    externs: &Externs,
    reader: &mut CodeReader<'_>,
    op: Opcode,
    offset: u32,
) -> Result<Inst, RuntimeError> {
    let operands = match op {
        Opcode::Exit | Opcode::PopDiscard | Opcode::Pause => Vec::new(),
        Opcode::PushInt => vec![reader.read_i32()?.to_string()],
        Opcode::PushFloat => vec![f32::from_bits(reader.read_u32()?).to_string()],
        Opcode::PushBool => vec![(reader.read_u8()? != 0).to_string()],
        Opcode::PushStr => vec![format!("{:?}", reader.read_str()?)],
        Opcode::PushTrigger => {
            let idx = reader.read_u16()?;
            vec![named(program.trigger_name(idx), idx)]
        }
        Opcode::PushEvent | Opcode::Call => {
            let idx = reader.read_u16()?;
            vec![named(program.event_name(idx), idx)]
        }
        Opcode::PushGlobal | Opcode::PushGlobalRef | Opcode::PopGlobal => {
            let slot = reader.read_u16()?;
            vec![named(global_name(program, slot as u32), slot)]
        }
        Opcode::PushLocal | Opcode::PushLocalRef | Opcode::PopLocal => {
            vec![reader.read_u8()?.to_string()]
        }
        Opcode::LoadArray | Opcode::StoreArray => {
            let id = reader.read_u16()?;
            let base = program.arrays.get(id as usize).map(|a| a.base);
            vec![named(base.and_then(|b| global_name(program, b)), id)]
        }
        Opcode::CallNative => {
            let idx = reader.read_u16()?;
            vec![named(externs.natives.get(idx as usize).map(|s| s.name.as_str()), idx)]
        }
        Opcode::MemberGet | Opcode::MemberSet => {
            let idx = reader.read_u16()?;
            vec![named(externs.members.get(idx as usize).map(|s| s.name.as_str()), idx)]
        }
        Opcode::Jump | Opcode::JumpIfFalse => {
            let rel = reader.read_i32()?;
            let target = reader.pc.wrapping_add_signed(rel);
            vec![format!("0x{target:X}")]
        }
        Opcode::Binary => {
            let b = reader.read_u8()?;
            vec![BinaryOp::from_byte(b)
                .map(|o| o.mnemonic().to_owned())
                .unwrap_or_else(|| b.to_string())]
        }
        Opcode::Unary => {
            let b = reader.read_u8()?;
            vec![UnaryOp::from_byte(b)
                .map(|o| o.mnemonic().to_owned())
                .unwrap_or_else(|| b.to_string())]
        }
        Opcode::Cast => {
            let b = reader.read_u8()?;
            let name = match CastKind::from_byte(b) {
                Some(CastKind::ToInt) => "int".to_owned(),
                Some(CastKind::ToFloat) => "float".to_owned(),
                None => b.to_string(),
            };
            vec![name]
        }
    };
    Ok(Inst {
        offset,
        mnemonic: op.mnemonic().to_owned(),
        operands,
    })
}

fn named(name: Option<&str>, index: impl ToString) -> String {
    match name {
        Some(n) => n.to_owned(),
        None => index.to_string(),
    }
}

fn global_name(program: &Program, slot: u32) -> Option<&str> {
    program
        .debug
        .as_ref()
        .and_then(|d| d.global_names.get(slot as usize))
        .map(String::as_str)
}
