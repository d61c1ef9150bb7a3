//! Native call surface: named native functions, object member accessors,
//! per-user-type lifecycle hooks and callback kinds.
//!
//! The original engine routed all of this through raw function-pointer
//! tables; here it is a registry of boxed closures looked up by the same
//! small indices the bytecode carries.

use std::any::Any;
use std::collections::HashMap;

use anyhow::{anyhow, Result};

use crate::error::RuntimeError;
use crate::scheduler::SchedulerRequest;
use crate::stack::{OpEqualsFn, ValueStack};
use crate::value::{TypeRegistry, TypeTag, UserTypeId, Value};

/// Execution surface handed to native functions. Natives pop their own
/// arguments and push their result ("instinct" calling convention); side
/// effects on the scheduler go through the buffered `requests` list and are
/// applied only after the current run completes.
pub struct NativeCtx<'a> {
    pub stack: &'a mut ValueStack,
    pub types: &'a TypeRegistry,
    /// Host game state, downcast by the native itself.
    pub host: &'a mut dyn Any,
    pub requests: &'a mut Vec<SchedulerRequest>,
}

impl NativeCtx<'_> {
    pub fn pop(&mut self) -> Result<Value> {
        Ok(self.stack.pop()?)
    }

    pub fn pop_typed(&mut self, expected: TypeTag) -> Result<Value> {
        Ok(self.stack.pop_typed(expected, self.types)?)
    }

    pub fn pop_int(&mut self) -> Result<i32> {
        match self.stack.pop_typed(TypeTag::Int, self.types)? {
            Value::Int(v) => Ok(v),
            _ => unreachable!("pop_typed returned a non-int"),
        }
    }

    pub fn push(&mut self, value: Value) -> Result<()> {
        Ok(self.stack.push(value)?)
    }
}

pub type NativeFn = dyn Fn(&mut NativeCtx<'_>) -> Result<()> + Send + Sync;
pub type GetterFn = dyn Fn(&mut NativeCtx<'_>, &Value) -> Result<Value> + Send + Sync;
pub type SetterFn = dyn Fn(&mut NativeCtx<'_>, &Value, Value) -> Result<()> + Send + Sync;
pub type CreateFn = dyn Fn(UserTypeId) -> Value + Send + Sync;
pub type ReleaseFn = dyn Fn(&Value) + Send + Sync;

struct NativeDef {
    name: String,
    params: Vec<TypeTag>,
    ret: TypeTag,
    f: Box<NativeFn>,
}

struct MemberDef {
    name: String,
    object_ty: UserTypeId,
    value_ty: TypeTag,
    get: Box<GetterFn>,
    set: Box<SetterFn>,
}

#[derive(Default)]
struct TypeHooks {
    create: Option<Box<CreateFn>>,
    release: Option<Box<ReleaseFn>>,
}

/// Compile-time snapshot of the registration tables; the compiler resolves
/// identifiers against this instead of holding the registry itself.
#[derive(Debug, Clone, Default)]
pub struct Externs {
    pub natives: Vec<NativeSig>,
    pub members: Vec<MemberSig>,
    pub callbacks: Vec<String>,
    pub constants: Vec<(String, Value)>,
    pub types: TypeRegistry,
}

#[derive(Debug, Clone)]
pub struct NativeSig {
    pub name: String,
    pub params: Vec<TypeTag>,
    pub ret: TypeTag,
}

#[derive(Debug, Clone)]
pub struct MemberSig {
    pub name: String,
    pub object_ty: UserTypeId,
    pub value_ty: TypeTag,
}

#[derive(Default)]
pub struct NativeRegistry {
    natives: Vec<NativeDef>,
    members: Vec<MemberDef>,
    hooks: HashMap<UserTypeId, TypeHooks>,
    callbacks: Vec<String>,
    constants: Vec<(String, Value)>,
    op_equals: Option<Box<OpEqualsFn>>,
    types: TypeRegistry,
}

impl NativeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn types(&self) -> &TypeRegistry {
        &self.types
    }

    pub fn types_mut(&mut self) -> &mut TypeRegistry {
        &mut self.types
    }

    /// Register a native function; the returned index is what the bytecode
    /// carries. The declared signature is compile-time only: at run time the
    /// native reads and writes the stack itself.
    pub fn register_native<F>(
        &mut self,
        name: impl Into<String>,
        params: Vec<TypeTag>,
        ret: TypeTag,
        f: F,
    ) -> u16
    where
        F: Fn(&mut NativeCtx<'_>) -> Result<()> + Send + Sync + 'static,
    {
        let index = self.natives.len() as u16;
        self.natives.push(NativeDef {
            name: name.into(),
            params,
            ret,
            f: Box::new(f),
        });
        index
    }

    /// Register a get/set accessor pair for an object member variable.
    pub fn register_member<G, S>(
        &mut self,
        name: impl Into<String>,
        object_ty: UserTypeId,
        value_ty: TypeTag,
        get: G,
        set: S,
    ) -> u16
    where
        G: Fn(&mut NativeCtx<'_>, &Value) -> Result<Value> + Send + Sync + 'static,
        S: Fn(&mut NativeCtx<'_>, &Value, Value) -> Result<()> + Send + Sync + 'static,
    {
        let index = self.members.len() as u16;
        self.members.push(MemberDef {
            name: name.into(),
            object_ty,
            value_ty,
            get: Box::new(get),
            set: Box::new(set),
        });
        index
    }

    pub fn register_create_hook<F>(&mut self, ty: UserTypeId, f: F)
    where
        F: Fn(UserTypeId) -> Value + Send + Sync + 'static,
    {
        self.hooks.entry(ty).or_default().create = Some(Box::new(f));
    }

    pub fn register_release_hook<F>(&mut self, ty: UserTypeId, f: F)
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.hooks.entry(ty).or_default().release = Some(Box::new(f));
    }

    pub fn register_op_equals<F>(&mut self, f: F)
    where
        F: Fn(&Value, &Value) -> bool + Send + Sync + 'static,
    {
        self.op_equals = Some(Box::new(f));
    }

    pub fn register_callback(&mut self, name: impl Into<String>) -> u16 {
        let kind = self.callbacks.len() as u16;
        self.callbacks.push(name.into());
        kind
    }

    pub fn register_constant(&mut self, name: impl Into<String>, value: Value) {
        self.constants.push((name.into(), value));
    }

    pub fn lookup_callback(&self, name: &str) -> Option<u16> {
        self.callbacks.iter().position(|c| c == name).map(|i| i as u16)
    }

    /// The installed operator-equals hook, or identity comparison when the
    /// host never registered one.
    pub fn op_equals(&self) -> &OpEqualsFn {
        self.op_equals.as_deref().unwrap_or(&identity_equals)
    }

    /// Initial value for a freshly created slot of `ty`.
    pub fn create_value(&self, ty: TypeTag) -> Value {
        if let TypeTag::Object(id) = ty {
            if let Some(hook) = self.hooks.get(&id).and_then(|h| h.create.as_deref()) {
                return hook(id);
            }
        }
        Value::default_for(ty)
    }

    /// Run the release hook for a slot being torn down, if one is registered.
    pub fn release_value(&self, value: &Value) {
        if let Value::Object { ty, .. } = value {
            if let Some(hook) = self.hooks.get(ty).and_then(|h| h.release.as_deref()) {
                hook(value);
            }
        }
    }

    pub fn call_native(&self, index: u16, ctx: &mut NativeCtx<'_>) -> Result<(), RuntimeError> {
        let def = self
            .natives
            .get(index as usize)
            .ok_or(RuntimeError::UnknownNative { index })?;
        (def.f)(ctx).map_err(|e| RuntimeError::NativeFailed {
            name: def.name.clone(),
            msg: format!("{e:#}"),
        })
    }

    pub fn member_get(
        &self,
        index: u16,
        ctx: &mut NativeCtx<'_>,
        object: &Value,
    ) -> Result<Value, RuntimeError> {
        let def = self
            .members
            .get(index as usize)
            .ok_or(RuntimeError::UnknownAccessor { index })?;
        (def.get)(ctx, object).map_err(|e| RuntimeError::NativeFailed {
            name: def.name.clone(),
            msg: format!("{e:#}"),
        })
    }

    pub fn member_set(
        &self,
        index: u16,
        ctx: &mut NativeCtx<'_>,
        object: &Value,
        value: Value,
    ) -> Result<(), RuntimeError> {
        let def = self
            .members
            .get(index as usize)
            .ok_or(RuntimeError::UnknownAccessor { index })?;
        (def.set)(ctx, object, value).map_err(|e| RuntimeError::NativeFailed {
            name: def.name.clone(),
            msg: format!("{e:#}"),
        })
    }

    /// Snapshot the tables for the compiler.
    pub fn externs(&self) -> Externs {
        Externs {
            natives: self
                .natives
                .iter()
                .map(|d| NativeSig {
                    name: d.name.clone(),
                    params: d.params.clone(),
                    ret: d.ret,
                })
                .collect(),
            members: self
                .members
                .iter()
                .map(|d| MemberSig {
                    name: d.name.clone(),
                    object_ty: d.object_ty,
                    value_ty: d.value_ty,
                })
                .collect(),
            callbacks: self.callbacks.clone(),
            constants: self.constants.clone(),
            types: self.types.clone(),
        }
    }
}

/// Fallback object comparison a host can install when it has no deeper
/// notion of equality than the handle itself.
pub fn identity_equals(a: &Value, b: &Value) -> bool {
    a == b
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn natives_self_pop_and_push() {
        let mut reg = NativeRegistry::new();
        let idx = reg.register_native("double", vec![TypeTag::Int], TypeTag::Int, |ctx| {
            let v = ctx.pop_int()?;
            ctx.push(Value::Int(v * 2))
        });

        let mut stack = ValueStack::new();
        stack.push(Value::Int(21)).unwrap();
        let types = TypeRegistry::new();
        let mut requests = Vec::new();
        let mut host = ();
        let mut ctx = NativeCtx {
            stack: &mut stack,
            types: &types,
            host: &mut host,
            requests: &mut requests,
        };
        reg.call_native(idx, &mut ctx).unwrap();
        assert_eq!(stack.pop().unwrap(), Value::Int(42));
    }

    #[test]
    fn op_equals_defaults_to_identity() {
        let reg = NativeRegistry::new();
        let eq = reg.op_equals();
        let a = Value::Object { ty: 0, handle: 1 };
        let b = Value::Object { ty: 0, handle: 1 };
        let c = Value::Object { ty: 0, handle: 2 };
        assert!(eq(&a, &b));
        assert!(!eq(&a, &c));

        let mut reg = NativeRegistry::new();
        reg.register_op_equals(|_, _| true);
        assert!(reg.op_equals()(&a, &c));
    }

    #[test]
    fn create_hook_overrides_default() {
        let mut reg = NativeRegistry::new();
        let unit = reg.types_mut().register("Unit");
        reg.register_create_hook(unit, |ty| Value::Object { ty, handle: 99 });
        assert_eq!(
            reg.create_value(TypeTag::Object(unit)),
            Value::Object { ty: unit, handle: 99 }
        );
        // Unhooked types fall back to the plain default.
        assert_eq!(reg.create_value(TypeTag::Int), Value::Int(0));
    }
}
