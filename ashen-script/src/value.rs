use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a registered user (object) type.
pub type UserTypeId = u16;

/// The static type of a value, without the reference flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TypeTag {
    Void,
    Bool,
    Int,
    Float,
    Str,
    Trigger,
    Event,
    Object(UserTypeId),
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeTag::Void => write!(f, "void"),
            TypeTag::Bool => write!(f, "bool"),
            TypeTag::Int => write!(f, "int"),
            TypeTag::Float => write!(f, "float"),
            TypeTag::Str => write!(f, "string"),
            TypeTag::Trigger => write!(f, "trigger"),
            TypeTag::Event => write!(f, "event"),
            TypeTag::Object(id) => write!(f, "object#{id}"),
        }
    }
}

/// Location of a variable slot that a reference value aliases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VarSlot {
    /// Index into the context's global storage.
    Global(u32),
    /// Offset into the current frame's local environment.
    Local(u8),
}

/// A VM value.
///
/// `Ref` is the orthogonal "is-reference" form: an alias to a variable slot
/// rather than a copy. A reference is never type-equivalent to a non-reference
/// even when the base tags match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Void,
    Bool(bool),
    Int(i32),
    Float(f32),
    Str(String),
    /// Index into the program's trigger table.
    Trigger(u16),
    /// Index into the program's event table.
    Event(u16),
    /// An opaque game-object handle of a registered user type.
    Object { ty: UserTypeId, handle: u32 },
    Ref { slot: VarSlot, ty: TypeTag },
}

impl Default for Value {
    fn default() -> Self {
        Value::Void
    }
}

impl Value {
    /// The base type of the value. For a reference this is the declared type
    /// of the aliased slot; use [`Value::is_ref`] to tell the two apart.
    pub fn type_tag(&self) -> TypeTag {
        match self {
            Value::Void => TypeTag::Void,
            Value::Bool(_) => TypeTag::Bool,
            Value::Int(_) => TypeTag::Int,
            Value::Float(_) => TypeTag::Float,
            Value::Str(_) => TypeTag::Str,
            Value::Trigger(_) => TypeTag::Trigger,
            Value::Event(_) => TypeTag::Event,
            Value::Object { ty, .. } => TypeTag::Object(*ty),
            Value::Ref { ty, .. } => *ty,
        }
    }

    pub fn is_ref(&self) -> bool {
        matches!(self, Value::Ref { .. })
    }

    /// Default value for a declared slot type. Object slots start with a null
    /// handle; the registry's create hook may replace it at context creation.
    pub fn default_for(ty: TypeTag) -> Value {
        match ty {
            TypeTag::Void => Value::Void,
            TypeTag::Bool => Value::Bool(false),
            TypeTag::Int => Value::Int(0),
            TypeTag::Float => Value::Float(0.0),
            TypeTag::Str => Value::Str(String::new()),
            TypeTag::Trigger => Value::Trigger(0),
            TypeTag::Event => Value::Event(0),
            TypeTag::Object(id) => Value::Object { ty: id, handle: 0 },
        }
    }

    /// Canonical textual form used by the concat operator.
    /// Returns `None` for non-scalar values.
    pub fn to_text(&self) -> Option<String> {
        match self {
            Value::Bool(b) => Some(if *b { "true".into() } else { "false".into() }),
            Value::Int(v) => Some(v.to_string()),
            Value::Float(v) => Some(v.to_string()),
            Value::Str(s) => Some(s.clone()),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Void => write!(f, "void"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Str(s) => write!(f, "{s:?}"),
            Value::Trigger(i) => write!(f, "trigger#{i}"),
            Value::Event(i) => write!(f, "event#{i}"),
            Value::Object { ty, handle } => write!(f, "object#{ty}({handle})"),
            Value::Ref { slot, ty } => write!(f, "ref({slot:?}: {ty})"),
        }
    }
}

/// Startup-declared user types and their asymmetric compatibility table.
///
/// `equivalent(want, got)` is the single equivalence rule queried by the
/// compiler, the operand stack and the interpreter: reflexive for all tags,
/// and additionally true when `want` is a user type whose registered
/// compatible-type list contains `got`. The relation is deliberately not
/// symmetric.
#[derive(Debug, Clone, Default)]
pub struct TypeRegistry {
    names: Vec<String>,
    compat: HashMap<UserTypeId, Vec<UserTypeId>>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a user type; ids are assigned in registration order.
    pub fn register(&mut self, name: impl Into<String>) -> UserTypeId {
        let id = self.names.len() as UserTypeId;
        self.names.push(name.into());
        id
    }

    /// Declare that slots of type `ty` also accept values of type `other`.
    pub fn add_compatible(&mut self, ty: UserTypeId, other: UserTypeId) {
        self.compat.entry(ty).or_default().push(other);
    }

    pub fn lookup(&self, name: &str) -> Option<UserTypeId> {
        self.names.iter().position(|n| n == name).map(|i| i as UserTypeId)
    }

    pub fn name(&self, id: UserTypeId) -> Option<&str> {
        self.names.get(id as usize).map(String::as_str)
    }

    pub fn equivalent(&self, want: TypeTag, got: TypeTag) -> bool {
        if want == got {
            return true;
        }
        match (want, got) {
            (TypeTag::Object(a), TypeTag::Object(b)) => self
                .compat
                .get(&a)
                .is_some_and(|list| list.contains(&b)),
            _ => false,
        }
    }

    /// Value-level equivalence: both operands must agree on referenceness,
    /// then the base tags are compared.
    pub fn values_equivalent(&self, want: &Value, got: &Value) -> bool {
        if want.is_ref() != got.is_ref() {
            return false;
        }
        self.equivalent(want.type_tag(), got.type_tag())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn equivalence_is_reflexive() {
        let reg = TypeRegistry::new();
        for v in [
            Value::Void,
            Value::Bool(true),
            Value::Int(7),
            Value::Float(1.5),
            Value::Str("a".into()),
            Value::Trigger(3),
            Value::Event(1),
            Value::Object { ty: 0, handle: 9 },
        ] {
            assert!(reg.values_equivalent(&v, &v), "{v} ~ {v}");
        }
    }

    #[test]
    fn user_type_compat_is_asymmetric() {
        let mut reg = TypeRegistry::new();
        let base = reg.register("Unit");
        let derived = reg.register("Tank");
        reg.add_compatible(base, derived);

        assert!(reg.equivalent(TypeTag::Object(base), TypeTag::Object(derived)));
        assert!(!reg.equivalent(TypeTag::Object(derived), TypeTag::Object(base)));
    }

    #[test]
    fn reference_never_matches_non_reference() {
        let reg = TypeRegistry::new();
        let plain = Value::Int(1);
        let reference = Value::Ref {
            slot: VarSlot::Global(0),
            ty: TypeTag::Int,
        };
        assert!(!reg.values_equivalent(&plain, &reference));
        assert!(!reg.values_equivalent(&reference, &plain));
        assert!(reg.values_equivalent(&reference, &reference));
    }

    #[test]
    fn defaults_match_declared_types() {
        assert_eq!(Value::default_for(TypeTag::Int), Value::Int(0));
        assert_eq!(Value::default_for(TypeTag::Str), Value::Str(String::new()));
        assert_eq!(
            Value::default_for(TypeTag::Object(4)),
            Value::Object { ty: 4, handle: 0 }
        );
    }
}
