//! Operand stack of the script VM.
//!
//! Values are copied on push/pop: strings are deep-copied so no two stack
//! slots ever alias the same buffer. Operator evaluation lives here; the
//! interpreter only dispatches opcodes onto these methods.

use crate::error::RuntimeError;
use crate::value::{TypeRegistry, TypeTag, Value, VarSlot};

const MAX_STACK_SIZE: usize = 0x100;

/// Hook consulted for equality on object-typed operands instead of raw
/// handle identity.
pub type OpEqualsFn = dyn Fn(&Value, &Value) -> bool + Send + Sync;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Concat,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl BinaryOp {
    pub fn as_byte(self) -> u8 {
        match self {
            BinaryOp::Add => 0,
            BinaryOp::Sub => 1,
            BinaryOp::Mul => 2,
            BinaryOp::Div => 3,
            BinaryOp::Mod => 4,
            BinaryOp::Concat => 5,
            BinaryOp::Eq => 6,
            BinaryOp::Ne => 7,
            BinaryOp::Lt => 8,
            BinaryOp::Le => 9,
            BinaryOp::Gt => 10,
            BinaryOp::Ge => 11,
            BinaryOp::And => 12,
            BinaryOp::Or => 13,
        }
    }

    pub fn from_byte(b: u8) -> Option<Self> {
        Some(match b {
            0 => BinaryOp::Add,
            1 => BinaryOp::Sub,
            2 => BinaryOp::Mul,
            3 => BinaryOp::Div,
            4 => BinaryOp::Mod,
            5 => BinaryOp::Concat,
            6 => BinaryOp::Eq,
            7 => BinaryOp::Ne,
            8 => BinaryOp::Lt,
            9 => BinaryOp::Le,
            10 => BinaryOp::Gt,
            11 => BinaryOp::Ge,
            12 => BinaryOp::And,
            13 => BinaryOp::Or,
            _ => return None,
        })
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            BinaryOp::Add => "add",
            BinaryOp::Sub => "sub",
            BinaryOp::Mul => "mul",
            BinaryOp::Div => "div",
            BinaryOp::Mod => "mod",
            BinaryOp::Concat => "concat",
            BinaryOp::Eq => "eq",
            BinaryOp::Ne => "ne",
            BinaryOp::Lt => "lt",
            BinaryOp::Le => "le",
            BinaryOp::Gt => "gt",
            BinaryOp::Ge => "ge",
            BinaryOp::And => "and",
            BinaryOp::Or => "or",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
    /// Mutates the referenced variable, not the stack copy.
    Inc,
    Dec,
}

impl UnaryOp {
    pub fn as_byte(self) -> u8 {
        match self {
            UnaryOp::Neg => 0,
            UnaryOp::Not => 1,
            UnaryOp::Inc => 2,
            UnaryOp::Dec => 3,
        }
    }

    pub fn from_byte(b: u8) -> Option<Self> {
        Some(match b {
            0 => UnaryOp::Neg,
            1 => UnaryOp::Not,
            2 => UnaryOp::Inc,
            3 => UnaryOp::Dec,
            _ => return None,
        })
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            UnaryOp::Neg => "neg",
            UnaryOp::Not => "not",
            UnaryOp::Inc => "inc",
            UnaryOp::Dec => "dec",
        }
    }
}

/// Explicit numeric casts; anything else is rejected at compile time and a
/// hard error at run time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CastKind {
    ToInt,
    ToFloat,
}

impl CastKind {
    pub fn as_byte(self) -> u8 {
        match self {
            CastKind::ToInt => 0,
            CastKind::ToFloat => 1,
        }
    }

    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(CastKind::ToInt),
            1 => Some(CastKind::ToFloat),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
pub struct ValueStack {
    items: Vec<Value>,
}

impl ValueStack {
    pub fn new() -> Self {
        Self { items: Vec::with_capacity(32) }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Dropped to empty before every top-level run so one run's fault can
    /// never corrupt the next.
    pub fn reset(&mut self) {
        self.items.clear();
    }

    pub fn push(&mut self, value: Value) -> Result<(), RuntimeError> {
        if self.items.len() >= MAX_STACK_SIZE {
            return Err(RuntimeError::StackOverflow { limit: MAX_STACK_SIZE });
        }
        self.items.push(value);
        Ok(())
    }

    pub fn pop(&mut self) -> Result<Value, RuntimeError> {
        self.items.pop().ok_or(RuntimeError::StackUnderflow)
    }

    /// Pop with a type-equivalence check against `expected`.
    pub fn pop_typed(&mut self, expected: TypeTag, types: &TypeRegistry) -> Result<Value, RuntimeError> {
        let v = self.pop()?;
        if v.is_ref() || !types.equivalent(expected, v.type_tag()) {
            return Err(RuntimeError::TypeMismatch {
                expected,
                found: v.type_tag(),
            });
        }
        Ok(v)
    }

    /// Pop a reference value, yielding the aliased slot and its declared type.
    pub fn pop_ref(&mut self) -> Result<(VarSlot, TypeTag), RuntimeError> {
        match self.pop()? {
            Value::Ref { slot, ty } => Ok((slot, ty)),
            other => Err(RuntimeError::BadOperands {
                op: "deref",
                lhs: other.type_tag(),
                rhs: TypeTag::Void,
            }),
        }
    }

    /// Peek `depth` slots below the top (0 = top of stack).
    pub fn peek(&self, depth: usize) -> Result<&Value, RuntimeError> {
        let len = self.items.len();
        if depth >= len {
            return Err(RuntimeError::StackUnderflow);
        }
        Ok(&self.items[len - 1 - depth])
    }

    /// Apply a binary operator to the top two values (lhs below rhs).
    ///
    /// Every operator except `Concat` has already passed the compiler's
    /// equivalence precheck; the checks here are the runtime backstop.
    pub fn binary(
        &mut self,
        op: BinaryOp,
        types: &TypeRegistry,
        op_equals: Option<&OpEqualsFn>,
    ) -> Result<(), RuntimeError> {
        let rhs = self.pop()?;
        let lhs = self.pop()?;
        let out = eval_binary(op, lhs, rhs, types, op_equals)?;
        self.push(out)
    }

    /// Apply `Neg`/`Not` to the top of the stack. `Inc`/`Dec` need variable
    /// storage and are executed by the interpreter.
    pub fn unary(&mut self, op: UnaryOp) -> Result<(), RuntimeError> {
        let v = self.pop()?;
        let out = match (op, v) {
            (UnaryOp::Neg, Value::Int(x)) => Value::Int(x.wrapping_neg()),
            (UnaryOp::Neg, Value::Float(x)) => Value::Float(-x),
            (UnaryOp::Not, Value::Bool(b)) => Value::Bool(!b),
            (_, v) => {
                return Err(RuntimeError::BadOperands {
                    op: op.mnemonic(),
                    lhs: v.type_tag(),
                    rhs: TypeTag::Void,
                })
            }
        };
        self.push(out)
    }

    /// Retag the top of the stack with an explicit numeric cast.
    pub fn cast(&mut self, kind: CastKind) -> Result<(), RuntimeError> {
        let v = self.pop()?;
        let out = match (kind, v) {
            (CastKind::ToInt, Value::Float(x)) => Value::Int(x as i32),
            (CastKind::ToInt, Value::Int(x)) => Value::Int(x),
            (CastKind::ToFloat, Value::Int(x)) => Value::Float(x as f32),
            (CastKind::ToFloat, Value::Float(x)) => Value::Float(x),
            (CastKind::ToInt, v) => {
                return Err(RuntimeError::BadCast { from: v.type_tag(), to: TypeTag::Int })
            }
            (CastKind::ToFloat, v) => {
                return Err(RuntimeError::BadCast { from: v.type_tag(), to: TypeTag::Float })
            }
        };
        self.push(out)
    }
}

fn eval_binary(
    op: BinaryOp,
    lhs: Value,
    rhs: Value,
    types: &TypeRegistry,
    op_equals: Option<&OpEqualsFn>,
) -> Result<Value, RuntimeError> {
    use BinaryOp::*;
    use Value::*;

    match op {
        Add | Sub | Mul => {
            let (lt, rt) = (lhs.type_tag(), rhs.type_tag());
            let out = match (op, lhs, rhs) {
                (Add, Int(a), Int(b)) => Int(a.wrapping_add(b)),
                (Sub, Int(a), Int(b)) => Int(a.wrapping_sub(b)),
                (Mul, Int(a), Int(b)) => Int(a.wrapping_mul(b)),
                // either side float -> promote
                (o, a, b) => match (promote(a), promote(b)) {
                    (Some(x), Some(y)) => Float(match o {
                        Add => x + y,
                        Sub => x - y,
                        _ => x * y,
                    }),
                    _ => {
                        return Err(RuntimeError::BadOperands {
                            op: o.mnemonic(),
                            lhs: lt,
                            rhs: rt,
                        })
                    }
                },
            };
            Ok(out)
        }

        Div => {
            let (lt, rt) = (lhs.type_tag(), rhs.type_tag());
            match (lhs, rhs) {
                (Int(_), Int(0)) => Err(RuntimeError::DivisionByZero),
                (Int(a), Int(b)) => Ok(Int(a.wrapping_div(b))),
                (a, b) => match (promote(a), promote(b)) {
                    (Some(_), Some(y)) if y == 0.0 => Err(RuntimeError::DivisionByZero),
                    (Some(x), Some(y)) => Ok(Float(x / y)),
                    _ => Err(RuntimeError::BadOperands { op: "div", lhs: lt, rhs: rt }),
                },
            }
        }

        Mod => match (lhs, rhs) {
            (Int(_), Int(0)) => Err(RuntimeError::DivisionByZero),
            (Int(a), Int(b)) => Ok(Int(a.wrapping_rem(b))),
            (a, b) => Err(RuntimeError::BadOperands {
                op: "mod",
                lhs: a.type_tag(),
                rhs: b.type_tag(),
            }),
        },

        // The only operator exempt from the equivalence precheck: any scalar
        // pair is accepted and rendered in its canonical textual form.
        Concat => {
            let a = lhs
                .to_text()
                .ok_or(RuntimeError::BadConcatOperand { found: lhs.type_tag() })?;
            let b = rhs
                .to_text()
                .ok_or(RuntimeError::BadConcatOperand { found: rhs.type_tag() })?;
            Ok(Str(a + &b))
        }

        Eq | Ne => {
            let equal = values_equal(&lhs, &rhs, types, op_equals)?;
            Ok(Bool(if op == Eq { equal } else { !equal }))
        }

        Lt | Le | Gt | Ge => {
            // Comparisons operate on the raw numeric representation only; a
            // mixed int/float pair compares through promotion like Add/Sub.
            let (lt, rt) = (lhs.type_tag(), rhs.type_tag());
            let out = match (lhs, rhs) {
                (Int(a), Int(b)) => compare(op, a as f64, b as f64),
                (a, b) => match (promote(a), promote(b)) {
                    (Some(x), Some(y)) => compare(op, x as f64, y as f64),
                    _ => {
                        return Err(RuntimeError::BadOperands {
                            op: op.mnemonic(),
                            lhs: lt,
                            rhs: rt,
                        })
                    }
                },
            };
            Ok(Bool(out))
        }

        And | Or => match (lhs, rhs) {
            (Bool(a), Bool(b)) => Ok(Bool(if op == And { a && b } else { a || b })),
            (a, b) => Err(RuntimeError::BadOperands {
                op: op.mnemonic(),
                lhs: a.type_tag(),
                rhs: b.type_tag(),
            }),
        },
    }
}

fn promote(v: Value) -> Option<f32> {
    match v {
        Value::Int(x) => Some(x as f32),
        Value::Float(x) => Some(x),
        _ => None,
    }
}

fn compare(op: BinaryOp, a: f64, b: f64) -> bool {
    match op {
        BinaryOp::Lt => a < b,
        BinaryOp::Le => a <= b,
        BinaryOp::Gt => a > b,
        BinaryOp::Ge => a >= b,
        _ => unreachable!("compare called with non-relational operator"),
    }
}

fn values_equal(
    lhs: &Value,
    rhs: &Value,
    types: &TypeRegistry,
    op_equals: Option<&OpEqualsFn>,
) -> Result<bool, RuntimeError> {
    use Value::*;
    match (lhs, rhs) {
        (Bool(a), Bool(b)) => Ok(a == b),
        (Int(a), Int(b)) => Ok(a == b),
        (Float(a), Float(b)) => Ok(a == b),
        (Str(a), Str(b)) => Ok(a == b),
        (Trigger(a), Trigger(b)) => Ok(a == b),
        (Event(a), Event(b)) => Ok(a == b),
        // Object equality goes through the pluggable hook; identity is only
        // the fallback when no hook is registered.
        (Object { .. }, Object { .. }) => {
            if !types.equivalent(lhs.type_tag(), rhs.type_tag())
                && !types.equivalent(rhs.type_tag(), lhs.type_tag())
            {
                return Err(RuntimeError::BadOperands {
                    op: "eq",
                    lhs: lhs.type_tag(),
                    rhs: rhs.type_tag(),
                });
            }
            match op_equals {
                Some(hook) => Ok(hook(lhs, rhs)),
                None => Ok(lhs == rhs),
            }
        }
        _ => Err(RuntimeError::BadOperands {
            op: "eq",
            lhs: lhs.type_tag(),
            rhs: rhs.type_tag(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::TypeRegistry;
    use pretty_assertions::assert_eq;

    fn push_all(stack: &mut ValueStack, values: &[Value]) {
        for v in values {
            stack.push(v.clone()).unwrap();
        }
    }

    #[test]
    fn lifo_discipline_and_empty_postcondition() {
        let mut stack = ValueStack::new();
        let values = [
            Value::Int(1),
            Value::Str("alpha".into()),
            Value::Bool(true),
            Value::Str("beta".into()),
        ];
        push_all(&mut stack, &values);

        for expected in values.iter().rev() {
            assert_eq!(&stack.pop().unwrap(), expected);
        }
        assert!(stack.is_empty());
    }

    #[test]
    fn pushed_strings_do_not_alias() {
        let mut stack = ValueStack::new();
        let s = Value::Str("shared".into());
        stack.push(s.clone()).unwrap();
        stack.push(s).unwrap();

        let mut a = stack.pop().unwrap();
        let b = stack.pop().unwrap();
        if let Value::Str(ref mut inner) = a {
            inner.push_str("-mutated");
        }
        assert_eq!(b, Value::Str("shared".into()));
    }

    #[test]
    fn arithmetic_promotes_to_float() {
        let types = TypeRegistry::new();
        let mut stack = ValueStack::new();
        push_all(&mut stack, &[Value::Int(3), Value::Float(0.5)]);
        stack.binary(BinaryOp::Add, &types, None).unwrap();
        assert_eq!(stack.pop().unwrap(), Value::Float(3.5));
    }

    #[test]
    fn comparison_promotes_mixed_numeric_operands() {
        let types = TypeRegistry::new();

        let mut stack = ValueStack::new();
        push_all(&mut stack, &[Value::Int(1), Value::Float(1.5)]);
        stack.binary(BinaryOp::Lt, &types, None).unwrap();
        assert_eq!(stack.pop().unwrap(), Value::Bool(true));

        let mut stack = ValueStack::new();
        push_all(&mut stack, &[Value::Float(2.5), Value::Int(2)]);
        stack.binary(BinaryOp::Ge, &types, None).unwrap();
        assert_eq!(stack.pop().unwrap(), Value::Bool(true));
    }

    #[test]
    fn division_by_zero_is_fatal_for_int_and_float() {
        let types = TypeRegistry::new();

        let mut stack = ValueStack::new();
        push_all(&mut stack, &[Value::Int(10), Value::Int(0)]);
        assert!(matches!(
            stack.binary(BinaryOp::Div, &types, None),
            Err(RuntimeError::DivisionByZero)
        ));

        let mut stack = ValueStack::new();
        push_all(&mut stack, &[Value::Float(1.0), Value::Float(0.0)]);
        assert!(matches!(
            stack.binary(BinaryOp::Div, &types, None),
            Err(RuntimeError::DivisionByZero)
        ));
    }

    #[test]
    fn concat_accepts_any_scalar_pair() {
        let types = TypeRegistry::new();
        let mut stack = ValueStack::new();
        push_all(&mut stack, &[Value::Str("hp=".into()), Value::Int(42)]);
        stack.binary(BinaryOp::Concat, &types, None).unwrap();
        assert_eq!(stack.pop().unwrap(), Value::Str("hp=42".into()));

        let mut stack = ValueStack::new();
        push_all(&mut stack, &[Value::Bool(true), Value::Str("!".into())]);
        stack.binary(BinaryOp::Concat, &types, None).unwrap();
        assert_eq!(stack.pop().unwrap(), Value::Str("true!".into()));
    }

    #[test]
    fn object_equality_uses_hook() {
        let types = TypeRegistry::new();
        let mut stack = ValueStack::new();
        push_all(
            &mut stack,
            &[
                Value::Object { ty: 0, handle: 1 },
                Value::Object { ty: 0, handle: 2 },
            ],
        );
        // Hook that declares every pair equal, unlike identity.
        let hook: Box<OpEqualsFn> = Box::new(|_, _| true);
        stack.binary(BinaryOp::Eq, &types, Some(hook.as_ref())).unwrap();
        assert_eq!(stack.pop().unwrap(), Value::Bool(true));
    }

    #[test]
    fn cast_retags_top_of_stack() {
        let mut stack = ValueStack::new();
        stack.push(Value::Float(2.75)).unwrap();
        stack.cast(CastKind::ToInt).unwrap();
        assert_eq!(stack.pop().unwrap(), Value::Int(2));

        stack.push(Value::Str("no".into())).unwrap();
        assert!(matches!(
            stack.cast(CastKind::ToFloat),
            Err(RuntimeError::BadCast { .. })
        ));
    }

    #[test]
    fn pop_typed_rejects_mismatch() {
        let types = TypeRegistry::new();
        let mut stack = ValueStack::new();
        stack.push(Value::Int(1)).unwrap();
        assert!(matches!(
            stack.pop_typed(TypeTag::Str, &types),
            Err(RuntimeError::TypeMismatch { .. })
        ));

        stack.push(Value::Int(1)).unwrap();
        assert_eq!(stack.pop_typed(TypeTag::Int, &types).unwrap(), Value::Int(1));
    }

    #[test]
    fn popping_empty_stack_fails() {
        let mut stack = ValueStack::new();
        assert!(matches!(stack.pop(), Err(RuntimeError::StackUnderflow)));
    }
}
