//! Opcode encodings and the code-block builder used by the compiler.
//!
//! The code stream is a little-endian byte stream: one opcode byte followed
//! by its packed operand bytes. Only the semantics of the original encoding
//! are preserved, not its layout.

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

use crate::error::RuntimeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    /// Terminate the current frame. Also emitted as the fall-off-the-end
    /// terminator; there is no distinct return instruction.
    Exit = 0x00,
    /// i32 literal.
    PushInt = 0x01,
    /// f32 literal (raw bits).
    PushFloat = 0x02,
    /// u8 literal (0 or 1).
    PushBool = 0x03,
    /// u16 byte length + UTF-8 bytes.
    PushStr = 0x04,
    /// u16 trigger index.
    PushTrigger = 0x05,
    /// u16 event index.
    PushEvent = 0x06,
    /// u16 global slot -> load value.
    PushGlobal = 0x07,
    /// u8 local slot -> load value.
    PushLocal = 0x08,
    /// u16 global slot -> push reference.
    PushGlobalRef = 0x09,
    /// u8 local slot -> push reference.
    PushLocalRef = 0x0A,
    /// Discard the top of the stack.
    PopDiscard = 0x0B,
    /// u16 global slot <- store popped value.
    PopGlobal = 0x0C,
    /// u8 local slot <- store popped value.
    PopLocal = 0x0D,
    /// u16 array id; pops one index per dimension, pushes the element.
    LoadArray = 0x0E,
    /// u16 array id; pops the value then one index per dimension.
    StoreArray = 0x0F,
    /// u16 event index: in-script call.
    Call = 0x10,
    /// u16 native table index.
    CallNative = 0x11,
    /// u16 accessor index; pops the object, pushes the member value.
    MemberGet = 0x12,
    /// u16 accessor index; pops the value then the object.
    MemberSet = 0x13,
    /// i32 relative offset from the end of the operand.
    Jump = 0x14,
    /// i32 relative offset; pops a bool, jumps when false.
    JumpIfFalse = 0x15,
    /// u8 binary operator code.
    Binary = 0x16,
    /// u8 unary operator code.
    Unary = 0x17,
    /// u8 cast code.
    Cast = 0x18,
    /// Pops the delay; suspends the run at the next instruction.
    Pause = 0x19,
}

impl Opcode {
    pub fn decode(b: u8) -> Option<Opcode> {
        Some(match b {
            0x00 => Opcode::Exit,
            0x01 => Opcode::PushInt,
            0x02 => Opcode::PushFloat,
            0x03 => Opcode::PushBool,
            0x04 => Opcode::PushStr,
            0x05 => Opcode::PushTrigger,
            0x06 => Opcode::PushEvent,
            0x07 => Opcode::PushGlobal,
            0x08 => Opcode::PushLocal,
            0x09 => Opcode::PushGlobalRef,
            0x0A => Opcode::PushLocalRef,
            0x0B => Opcode::PopDiscard,
            0x0C => Opcode::PopGlobal,
            0x0D => Opcode::PopLocal,
            0x0E => Opcode::LoadArray,
            0x0F => Opcode::StoreArray,
            0x10 => Opcode::Call,
            0x11 => Opcode::CallNative,
            0x12 => Opcode::MemberGet,
            0x13 => Opcode::MemberSet,
            0x14 => Opcode::Jump,
            0x15 => Opcode::JumpIfFalse,
            0x16 => Opcode::Binary,
            0x17 => Opcode::Unary,
            0x18 => Opcode::Cast,
            0x19 => Opcode::Pause,
            _ => return None,
        })
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            Opcode::Exit => "exit",
            Opcode::PushInt => "push_int",
            Opcode::PushFloat => "push_float",
            Opcode::PushBool => "push_bool",
            Opcode::PushStr => "push_str",
            Opcode::PushTrigger => "push_trigger",
            Opcode::PushEvent => "push_event",
            Opcode::PushGlobal => "push_global",
            Opcode::PushLocal => "push_local",
            Opcode::PushGlobalRef => "push_global_ref",
            Opcode::PushLocalRef => "push_local_ref",
            Opcode::PopDiscard => "pop_discard",
            Opcode::PopGlobal => "pop_global",
            Opcode::PopLocal => "pop_local",
            Opcode::LoadArray => "load_array",
            Opcode::StoreArray => "store_array",
            Opcode::Call => "call",
            Opcode::CallNative => "call_native",
            Opcode::MemberGet => "member_get",
            Opcode::MemberSet => "member_set",
            Opcode::Jump => "jmp",
            Opcode::JumpIfFalse => "jz",
            Opcode::Binary => "binary",
            Opcode::Unary => "unary",
            Opcode::Cast => "cast",
            Opcode::Pause => "pause",
        }
    }
}

/// Source line ↔ code offset entry kept in the optional debug table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineEntry {
    pub offset: u32,
    pub line: u32,
}

/// One grammar production's emitted code: a byte buffer plus parallel debug
/// entries. Blocks compose by concatenation; [`CodeBlock::append`] offsets the
/// child's debug entries by the parent's already-emitted size.
#[derive(Debug, Clone, Default)]
pub struct CodeBlock {
    bytes: Vec<u8>,
    lines: Vec<LineEntry>,
    labels: Vec<(String, u32)>,
}

impl CodeBlock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> u32 {
        self.bytes.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn lines(&self) -> &[LineEntry] {
        &self.lines
    }

    pub fn labels(&self) -> &[(String, u32)] {
        &self.labels
    }

    pub fn into_parts(self) -> (Vec<u8>, Vec<LineEntry>, Vec<(String, u32)>) {
        (self.bytes, self.lines, self.labels)
    }

    pub fn note_line(&mut self, line: u32) {
        // Collapse runs of entries for the same line.
        if self.lines.last().map(|e| e.line) == Some(line) {
            return;
        }
        self.lines.push(LineEntry { offset: self.len(), line });
    }

    pub fn note_label(&mut self, name: impl Into<String>) {
        self.labels.push((name.into(), self.len()));
    }

    pub fn emit_op(&mut self, op: Opcode) {
        self.bytes.push(op as u8);
    }

    pub fn emit_u8(&mut self, v: u8) {
        self.bytes.push(v);
    }

    pub fn emit_u16(&mut self, v: u16) {
        let mut buf = [0u8; 2];
        LittleEndian::write_u16(&mut buf, v);
        self.bytes.extend_from_slice(&buf);
    }

    pub fn emit_i32(&mut self, v: i32) {
        let mut buf = [0u8; 4];
        LittleEndian::write_i32(&mut buf, v);
        self.bytes.extend_from_slice(&buf);
    }

    pub fn emit_u32(&mut self, v: u32) {
        let mut buf = [0u8; 4];
        LittleEndian::write_u32(&mut buf, v);
        self.bytes.extend_from_slice(&buf);
    }

    pub fn emit_str(&mut self, s: &str) {
        self.emit_u16(s.len() as u16);
        self.bytes.extend_from_slice(s.as_bytes());
    }

    /// Emit a jump with a placeholder offset; returns the absolute position
    /// of the packed offset field for later patching.
    pub fn emit_jump(&mut self, op: Opcode) -> u32 {
        self.emit_op(op);
        let pos = self.len();
        self.emit_i32(0);
        pos
    }

    /// Rewrite the jump whose offset field sits at `pos` to land on `target`
    /// (both positions are block-relative byte offsets).
    pub fn patch_jump(&mut self, pos: u32, target: u32) {
        // Offsets are relative to the first byte after the operand.
        let rel = target as i64 - (pos as i64 + 4);
        LittleEndian::write_i32(&mut self.bytes[pos as usize..pos as usize + 4], rel as i32);
    }

    pub fn append(&mut self, child: CodeBlock) {
        let base = self.len();
        self.bytes.extend_from_slice(&child.bytes);
        self.lines.extend(child.lines.into_iter().map(|e| LineEntry {
            offset: e.offset + base,
            line: e.line,
        }));
        self.labels
            .extend(child.labels.into_iter().map(|(n, off)| (n, off + base)));
    }
}

/// Bounds-checked reader over one code range; shared by the interpreter and
/// the disassembler.
pub struct CodeReader<'a> {
    code: &'a [u8],
    pub pc: u32,
    pub start: u32,
    pub end: u32,
}

impl<'a> CodeReader<'a> {
    pub fn new(code: &'a [u8], start: u32, end: u32, pc: u32) -> Self {
        Self { code, pc, start, end }
    }

    pub fn at_end(&self) -> bool {
        self.pc >= self.end
    }

    fn ensure(&self, need: u32) -> Result<(), RuntimeError> {
        if self.pc < self.start || self.pc.saturating_add(need) > self.end {
            return Err(RuntimeError::PcOutOfRange {
                pc: self.pc,
                start: self.start,
                end: self.end,
            });
        }
        Ok(())
    }

    pub fn read_u8(&mut self) -> Result<u8, RuntimeError> {
        self.ensure(1)?;
        let b = self.code[self.pc as usize];
        self.pc += 1;
        Ok(b)
    }

    pub fn read_u16(&mut self) -> Result<u16, RuntimeError> {
        self.ensure(2)?;
        let off = self.pc as usize;
        let v = LittleEndian::read_u16(&self.code[off..off + 2]);
        self.pc += 2;
        Ok(v)
    }

    pub fn read_i32(&mut self) -> Result<i32, RuntimeError> {
        self.ensure(4)?;
        let off = self.pc as usize;
        let v = LittleEndian::read_i32(&self.code[off..off + 4]);
        self.pc += 4;
        Ok(v)
    }

    pub fn read_u32(&mut self) -> Result<u32, RuntimeError> {
        self.ensure(4)?;
        let off = self.pc as usize;
        let v = LittleEndian::read_u32(&self.code[off..off + 4]);
        self.pc += 4;
        Ok(v)
    }

    pub fn read_str(&mut self) -> Result<String, RuntimeError> {
        let len = self.read_u16()? as u32;
        self.ensure(len)?;
        let off = self.pc as usize;
        let s = std::str::from_utf8(&self.code[off..off + len as usize])
            .map_err(|_| RuntimeError::BadOperand { pc: self.pc, what: "non-UTF-8 string literal" })?
            .to_owned();
        self.pc += len;
        Ok(s)
    }

    /// Apply a relative jump offset read at the current pc.
    pub fn jump(&mut self, rel: i32) -> Result<(), RuntimeError> {
        let target = self.pc as i64 + rel as i64;
        if target < self.start as i64 || target > self.end as i64 {
            return Err(RuntimeError::JumpOutOfRange {
                target,
                start: self.start,
                end: self.end,
            });
        }
        self.pc = target as u32;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn append_offsets_child_debug_entries() {
        let mut parent = CodeBlock::new();
        parent.note_line(1);
        parent.emit_op(Opcode::PushInt);
        parent.emit_i32(7);

        let mut child = CodeBlock::new();
        child.note_line(2);
        child.emit_op(Opcode::PopDiscard);
        child.note_label("after");

        let parent_len = parent.len();
        parent.append(child);

        assert_eq!(parent.lines()[0], LineEntry { offset: 0, line: 1 });
        assert_eq!(parent.lines()[1], LineEntry { offset: parent_len, line: 2 });
        assert_eq!(parent.labels()[0], ("after".to_string(), parent_len + 1));
    }

    #[test]
    fn jump_patching_is_relative() {
        let mut block = CodeBlock::new();
        let pos = block.emit_jump(Opcode::Jump);
        block.emit_op(Opcode::PopDiscard);
        let target = block.len();
        block.emit_op(Opcode::Exit);
        block.patch_jump(pos, target);

        let mut reader = CodeReader::new(block.bytes(), 0, block.len(), 0);
        assert_eq!(reader.read_u8().unwrap(), Opcode::Jump as u8);
        let rel = reader.read_i32().unwrap();
        reader.jump(rel).unwrap();
        assert_eq!(reader.read_u8().unwrap(), Opcode::Exit as u8);
    }

    #[test]
    fn reader_rejects_out_of_range_jump() {
        let mut block = CodeBlock::new();
        block.emit_op(Opcode::Exit);
        let mut reader = CodeReader::new(block.bytes(), 0, block.len(), 0);
        assert!(reader.jump(100).is_err());
    }
}
