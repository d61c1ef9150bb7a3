//! Syntax tree produced by the parser and consumed by the code generator.
//! Lines are carried on every node that can raise a diagnostic or contribute
//! a debug-table entry.

/// A declared type as written in source; resolved against the type registry
/// during code generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeName {
    Int,
    Float,
    Str,
    Bool,
    Void,
    Object(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    pub kind: ExprKind,
    pub line: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    IntLit(i32),
    FloatLit(f32),
    StrLit(String),
    BoolLit(bool),
    Ident(String),
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Unary {
        op: UnOp,
        expr: Box<Expr>,
    },
    /// `int(expr)` / `float(expr)`.
    Cast {
        to: TypeName,
        expr: Box<Expr>,
    },
    /// In-script function/event call or native call; resolved in codegen.
    Call {
        name: String,
        args: Vec<Expr>,
    },
    /// `name[i][j]...` with one expression per declared dimension.
    Index {
        name: String,
        indices: Vec<Expr>,
    },
    /// `object.member` through a registered accessor pair.
    Member {
        object: Box<Expr>,
        member: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
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

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Stmt {
    pub kind: StmtKind,
    pub line: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StmtKind {
    Local {
        ty: TypeName,
        name: String,
        init: Option<Expr>,
    },
    /// Target must be an identifier, array element or member expression.
    Assign {
        target: Expr,
        value: Expr,
    },
    /// `x++` / `x--`; mutates the variable in place.
    IncDec {
        target: Expr,
        increment: bool,
    },
    If {
        cond: Expr,
        then_body: Vec<Stmt>,
        else_body: Option<Vec<Stmt>>,
    },
    While {
        cond: Expr,
        body: Vec<Stmt>,
    },
    Return(Option<Expr>),
    Pause(Expr),
    Expr(Expr),
}

/// What a trigger declaration says about when it fires.
#[derive(Debug, Clone, PartialEq)]
pub enum TriggerSpec {
    Init,
    Wait(u32),
    Every(u32),
    /// Boolean test expression rechecked at the interval until it passes.
    Test { expr: Expr, interval: u32 },
    Callback(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Item {
    Global {
        ty: TypeName,
        name: String,
        init: Option<Expr>,
        line: u32,
    },
    Array {
        ty: TypeName,
        name: String,
        extents: Vec<u32>,
        line: u32,
    },
    Trigger {
        name: String,
        spec: TriggerSpec,
        line: u32,
    },
    Event {
        name: String,
        trigger: Option<String>,
        body: Vec<Stmt>,
        line: u32,
    },
    Function {
        name: String,
        ret: TypeName,
        params: Vec<(TypeName, String)>,
        body: Vec<Stmt>,
        line: u32,
    },
}
