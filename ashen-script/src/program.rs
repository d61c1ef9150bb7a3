//! Compiled program representation: code buffer plus symbol/metadata tables.
//!
//! A [`Program`] is immutable once the compiler hands it out; contexts share
//! it read-only behind an `Arc`.

use serde::{Deserialize, Serialize};

use crate::bytecode::LineEntry;
use crate::value::{TypeTag, Value};

/// Half-open code range `[start, end)` inside the program's code buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeRange {
    pub start: u32,
    pub end: u32,
}

/// Declared trigger kinds. `Pause` never appears in a compiled trigger table;
/// it exists only for active triggers reinserted by the pause primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerKind {
    /// Fires synchronously when the context is run.
    Init,
    /// One-shot after `interval` time units.
    Wait,
    /// Periodic at `interval`.
    Every,
    /// Boolean test body rechecked every `interval` until it passes.
    Code,
    /// Listens for a registered game callback kind.
    Callback,
    /// Runtime-only: a paused event waiting to resume.
    Pause,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerDef {
    pub kind: TriggerKind,
    /// Delay, period or recheck interval in scheduler time units.
    pub interval: u32,
    /// Boolean test body; present only for `Code` triggers.
    pub test: Option<CodeRange>,
    /// Callback kind; present only for `Callback` triggers.
    pub callback: Option<u16>,
}

impl TriggerDef {
    pub fn has_test(&self) -> bool {
        self.test.is_some()
    }
}

/// A named block of compiled code: an event bound to a trigger, or a callable
/// function (possibly recursive) with parameters and a return type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventDef {
    pub range: CodeRange,
    /// Originating trigger link; scheduling walks these at context run.
    pub trigger: Option<u16>,
    /// Local slot types; the first `params` slots receive the arguments.
    pub locals: Vec<TypeTag>,
    pub params: u8,
    pub ret: TypeTag,
}

/// Metadata for one declared array. Elements live in global storage starting
/// at `base`; indexing uses descending-dimension strides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArrayDef {
    pub ty: TypeTag,
    pub extents: Vec<u32>,
    pub base: u32,
}

impl ArrayDef {
    pub fn element_count(&self) -> u32 {
        self.extents.iter().product()
    }

    /// Stride of dimension `dim`: the product of all later extents.
    pub fn stride(&self, dim: usize) -> u32 {
        self.extents[dim + 1..].iter().product()
    }
}

/// Optional source-level debug information.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DebugInfo {
    /// Ascending by offset over the whole code buffer.
    pub lines: Vec<LineEntry>,
    pub labels: Vec<(String, u32)>,
    pub trigger_names: Vec<String>,
    pub event_names: Vec<String>,
    pub global_names: Vec<String>,
}

impl DebugInfo {
    /// Source line of the last debug entry at or before `offset`.
    pub fn line_at(&self, offset: u32) -> Option<u32> {
        match self.lines.binary_search_by_key(&offset, |e| e.offset) {
            Ok(i) => Some(self.lines[i].line),
            Err(0) => None,
            Err(i) => Some(self.lines[i - 1].line),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Program {
    pub code: Vec<u8>,
    pub triggers: Vec<TriggerDef>,
    pub events: Vec<EventDef>,
    /// Declared type of every global slot, including array element slots.
    pub globals: Vec<TypeTag>,
    /// Declared initializer per global slot; `None` means the slot starts at
    /// its type default (or the user type's create hook).
    pub inits: Vec<Option<Value>>,
    pub arrays: Vec<ArrayDef>,
    pub debug: Option<DebugInfo>,
}

impl Program {
    pub fn trigger(&self, index: u16) -> Option<&TriggerDef> {
        self.triggers.get(index as usize)
    }

    pub fn event(&self, index: u16) -> Option<&EventDef> {
        self.events.get(index as usize)
    }

    pub fn trigger_name(&self, index: u16) -> Option<&str> {
        self.debug
            .as_ref()
            .and_then(|d| d.trigger_names.get(index as usize))
            .map(String::as_str)
    }

    pub fn event_name(&self, index: u16) -> Option<&str> {
        self.debug
            .as_ref()
            .and_then(|d| d.event_names.get(index as usize))
            .map(String::as_str)
    }

    /// Slot of a named global, resolved through debug info. For an array this
    /// is its base slot.
    pub fn global_slot(&self, name: &str) -> Option<u32> {
        self.debug
            .as_ref()?
            .global_names
            .iter()
            .position(|n| n == name)
            .map(|i| i as u32)
    }

    pub fn event_index(&self, name: &str) -> Option<u16> {
        self.debug
            .as_ref()?
            .event_names
            .iter()
            .position(|n| n == name)
            .map(|i| i as u16)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strides_descend_over_dimensions() {
        let def = ArrayDef {
            ty: TypeTag::Int,
            extents: vec![4, 3, 2],
            base: 0,
        };
        assert_eq!(def.element_count(), 24);
        assert_eq!(def.stride(0), 6);
        assert_eq!(def.stride(1), 2);
        assert_eq!(def.stride(2), 1);
    }

    #[test]
    fn line_lookup_picks_last_entry_before_offset() {
        let debug = DebugInfo {
            lines: vec![
                LineEntry { offset: 0, line: 1 },
                LineEntry { offset: 8, line: 3 },
            ],
            ..Default::default()
        };
        assert_eq!(debug.line_at(0), Some(1));
        assert_eq!(debug.line_at(7), Some(1));
        assert_eq!(debug.line_at(8), Some(3));
        assert_eq!(debug.line_at(100), Some(3));
    }
}
