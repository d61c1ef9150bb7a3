//! Per-object script contexts and their global variable storage.

use std::sync::Arc;

use crate::error::RuntimeError;
use crate::program::Program;
use crate::registry::NativeRegistry;
use crate::value::Value;

/// Slots per storage chunk. Growth never moves an existing chunk, so the
/// slot to chunk/offset mapping stays stable for the context's lifetime.
const CHUNK: usize = 32;

/// Chunked global storage for one context.
#[derive(Debug)]
pub struct GlobalStore {
    chunks: Vec<Box<[Value]>>,
    len: u32,
}

impl GlobalStore {
    /// Pre-allocate every chunk and initialize each slot from its declared
    /// initializer, or the type default through the registry's create hook.
    pub fn new(program: &Program, registry: &NativeRegistry) -> Self {
        let len = program.globals.len() as u32;
        let mut chunks = Vec::with_capacity(program.globals.len().div_ceil(CHUNK));
        let mut values = program.globals.iter().enumerate().map(|(slot, &ty)| {
            match &program.inits[slot] {
                Some(v) => v.clone(),
                None => registry.create_value(ty),
            }
        });
        loop {
            let chunk: Vec<Value> = values.by_ref().take(CHUNK).collect();
            if chunk.is_empty() {
                break;
            }
            chunks.push(chunk.into_boxed_slice());
        }
        GlobalStore { chunks, len }
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn get(&self, slot: u32) -> Result<&Value, RuntimeError> {
        if slot >= self.len {
            return Err(RuntimeError::GlobalOutOfRange { slot, len: self.len });
        }
        Ok(&self.chunks[slot as usize / CHUNK][slot as usize % CHUNK])
    }

    pub fn get_mut(&mut self, slot: u32) -> Result<&mut Value, RuntimeError> {
        if slot >= self.len {
            return Err(RuntimeError::GlobalOutOfRange { slot, len: self.len });
        }
        Ok(&mut self.chunks[slot as usize / CHUNK][slot as usize % CHUNK])
    }

    pub fn set(&mut self, slot: u32, value: Value) -> Result<(), RuntimeError> {
        *self.get_mut(slot)? = value;
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Value> {
        self.chunks.iter().flat_map(|c| c.iter()).take(self.len as usize)
    }
}

/// One game object's binding of a shared program to its own state.
///
/// `release && trigger_count == 0` means nothing can ever fire for this
/// context again; the scheduler frees it at that point instead of waiting for
/// an explicit removal.
pub struct ScriptContext {
    pub program: Arc<Program>,
    pub globals: GlobalStore,
    /// Active and callback triggers currently referencing this context.
    pub trigger_count: u32,
    /// Release automatically once the last trigger is removed.
    pub release: bool,
}

impl ScriptContext {
    pub fn new(program: Arc<Program>, registry: &NativeRegistry, release: bool) -> Self {
        let globals = GlobalStore::new(&program, registry);
        ScriptContext {
            program,
            globals,
            trigger_count: 0,
            release,
        }
    }

    pub fn idle(&self) -> bool {
        self.release && self.trigger_count == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compile;
    use crate::registry::Externs;
    use crate::value::TypeTag;

    fn program(src: &str) -> Arc<Program> {
        Arc::new(compile(src, &Externs::default()).unwrap())
    }

    #[test]
    fn slots_start_at_initializer_or_type_default() {
        let program = program("int x = 7;\nstring s;\nfloat f;");
        let registry = NativeRegistry::new();
        let store = GlobalStore::new(&program, &registry);
        assert_eq!(store.get(0).unwrap(), &Value::Int(7));
        assert_eq!(store.get(1).unwrap(), &Value::Str(String::new()));
        assert_eq!(store.get(2).unwrap(), &Value::Float(0.0));
        assert!(store.get(3).is_err());
    }

    #[test]
    fn object_slots_run_the_create_hook() {
        let mut registry = NativeRegistry::new();
        let unit = registry.types_mut().register("Unit");
        registry.register_create_hook(unit, |ty| Value::Object { ty, handle: 42 });
        let mut externs = Externs::default();
        externs.types = registry.types().clone();
        let program = compile("object(Unit) u;", &externs).unwrap();
        let store = GlobalStore::new(&program, &registry);
        assert_eq!(store.get(0).unwrap(), &Value::Object { ty: unit, handle: 42 });
    }

    #[test]
    fn storage_spans_multiple_chunks() {
        let program = program("int big[100];");
        let registry = NativeRegistry::new();
        let store = GlobalStore::new(&program, &registry);
        assert_eq!(store.len(), 100);
        assert_eq!(store.chunk_count(), 4);
        assert_eq!(store.get(99).unwrap(), &Value::Int(0));
        assert_eq!(store.iter().count(), 100);
        assert!(store.iter().all(|v| v.type_tag() == TypeTag::Int));
    }
}
