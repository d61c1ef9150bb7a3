//! Recursive-descent parser: token stream to [`Item`] list.

use super::ast::*;
use super::error::CompileError;
use super::lexer::{Token, TokenKind};

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    pub fn new(tokens: Vec<Token>) -> Self {
        Parser { tokens, pos: 0 }
    }

    pub fn parse_program(mut self) -> Result<Vec<Item>, CompileError> {
        let mut items = Vec::new();
        while !self.check(&TokenKind::Eof) {
            items.push(self.parse_item()?);
        }
        Ok(items)
    }

    fn peek(&self) -> &Token {
        &self.tokens[self.pos]
    }

    fn peek_kind(&self) -> &TokenKind {
        &self.tokens[self.pos].kind
    }

    fn line(&self) -> u32 {
        self.tokens[self.pos].line
    }

    fn advance(&mut self) -> Token {
        let tok = self.tokens[self.pos].clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        tok
    }

    fn check(&self, kind: &TokenKind) -> bool {
        self.peek_kind() == kind
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: TokenKind) -> Result<Token, CompileError> {
        if self.check(&kind) {
            Ok(self.advance())
        } else {
            Err(CompileError::Syntax {
                line: self.line(),
                msg: format!("expected {kind}, found {}", self.peek_kind()),
            })
        }
    }

    fn expect_ident(&mut self) -> Result<(String, u32), CompileError> {
        let line = self.line();
        match self.peek_kind().clone() {
            TokenKind::Ident(name) => {
                self.advance();
                Ok((name, line))
            }
            other => Err(CompileError::Syntax {
                line,
                msg: format!("expected identifier, found {other}"),
            }),
        }
    }

    fn expect_int_lit(&mut self) -> Result<u32, CompileError> {
        let line = self.line();
        match *self.peek_kind() {
            TokenKind::IntLit(n) if n >= 0 => {
                self.advance();
                Ok(n as u32)
            }
            ref other => Err(CompileError::Syntax {
                line,
                msg: format!("expected non-negative integer literal, found {other}"),
            }),
        }
    }

    fn at_type_keyword(&self) -> bool {
        matches!(
            self.peek_kind(),
            TokenKind::KwInt
                | TokenKind::KwFloat
                | TokenKind::KwString
                | TokenKind::KwBool
                | TokenKind::KwObject
        )
    }

    fn parse_type(&mut self) -> Result<TypeName, CompileError> {
        let tok = self.advance();
        match tok.kind {
            TokenKind::KwInt => Ok(TypeName::Int),
            TokenKind::KwFloat => Ok(TypeName::Float),
            TokenKind::KwString => Ok(TypeName::Str),
            TokenKind::KwBool => Ok(TypeName::Bool),
            TokenKind::KwVoid => Ok(TypeName::Void),
            TokenKind::KwObject => {
                self.expect(TokenKind::LParen)?;
                let (name, _) = self.expect_ident()?;
                self.expect(TokenKind::RParen)?;
                Ok(TypeName::Object(name))
            }
            other => Err(CompileError::Syntax {
                line: tok.line,
                msg: format!("expected a type, found {other}"),
            }),
        }
    }

    // Items

    fn parse_item(&mut self) -> Result<Item, CompileError> {
        match self.peek_kind() {
            TokenKind::KwTrigger => self.parse_trigger(),
            TokenKind::KwEvent => self.parse_event(),
            TokenKind::KwFunction => self.parse_function(),
            _ if self.at_type_keyword() => self.parse_global_or_array(),
            other => Err(CompileError::Syntax {
                line: self.line(),
                msg: format!("expected a declaration, found {other}"),
            }),
        }
    }

    fn parse_global_or_array(&mut self) -> Result<Item, CompileError> {
        let ty = self.parse_type()?;
        let (name, line) = self.expect_ident()?;
        if self.check(&TokenKind::LBracket) {
            let mut extents = Vec::new();
            while self.eat(&TokenKind::LBracket) {
                extents.push(self.expect_int_lit()?);
                self.expect(TokenKind::RBracket)?;
            }
            self.expect(TokenKind::Semi)?;
            return Ok(Item::Array { ty, name, extents, line });
        }
        let init = if self.eat(&TokenKind::Assign) {
            Some(self.parse_expr()?)
        } else {
            None
        };
        self.expect(TokenKind::Semi)?;
        Ok(Item::Global { ty, name, init, line })
    }

    fn parse_trigger(&mut self) -> Result<Item, CompileError> {
        self.expect(TokenKind::KwTrigger)?;
        let (name, line) = self.expect_ident()?;
        self.expect(TokenKind::LParen)?;
        let (kind_name, kind_line) = self.expect_ident()?;
        let spec = match kind_name.as_str() {
            "init" => TriggerSpec::Init,
            "wait" => {
                self.expect(TokenKind::Comma)?;
                TriggerSpec::Wait(self.expect_int_lit()?)
            }
            "every" => {
                self.expect(TokenKind::Comma)?;
                TriggerSpec::Every(self.expect_int_lit()?)
            }
            "test" => {
                self.expect(TokenKind::Colon)?;
                let expr = self.parse_expr()?;
                self.expect(TokenKind::Comma)?;
                TriggerSpec::Test { expr, interval: self.expect_int_lit()? }
            }
            "callback" => {
                self.expect(TokenKind::Comma)?;
                let (cb, _) = self.expect_ident()?;
                TriggerSpec::Callback(cb)
            }
            other => {
                return Err(CompileError::Syntax {
                    line: kind_line,
                    msg: format!(
                        "expected 'init', 'wait', 'every', 'test' or 'callback', found '{other}'"
                    ),
                })
            }
        };
        self.expect(TokenKind::RParen)?;
        self.expect(TokenKind::Semi)?;
        Ok(Item::Trigger { name, spec, line })
    }

    fn parse_event(&mut self) -> Result<Item, CompileError> {
        self.expect(TokenKind::KwEvent)?;
        let (name, line) = self.expect_ident()?;
        self.expect(TokenKind::LParen)?;
        let trigger = if self.check(&TokenKind::RParen) {
            None
        } else {
            Some(self.expect_ident()?.0)
        };
        self.expect(TokenKind::RParen)?;
        let body = self.parse_block()?;
        Ok(Item::Event { name, trigger, body, line })
    }

    fn parse_function(&mut self) -> Result<Item, CompileError> {
        self.expect(TokenKind::KwFunction)?;
        let ret = if self.check(&TokenKind::KwVoid) {
            self.advance();
            TypeName::Void
        } else {
            self.parse_type()?
        };
        let (name, line) = self.expect_ident()?;
        self.expect(TokenKind::LParen)?;
        let mut params = Vec::new();
        if !self.check(&TokenKind::RParen) {
            loop {
                let ty = self.parse_type()?;
                let (pname, _) = self.expect_ident()?;
                params.push((ty, pname));
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(TokenKind::RParen)?;
        let body = self.parse_block()?;
        Ok(Item::Function { name, ret, params, body, line })
    }

    // Statements

    fn parse_block(&mut self) -> Result<Vec<Stmt>, CompileError> {
        self.expect(TokenKind::LBrace)?;
        let mut stmts = Vec::new();
        while !self.check(&TokenKind::RBrace) {
            if self.check(&TokenKind::Eof) {
                return Err(CompileError::Syntax {
                    line: self.line(),
                    msg: "unexpected end of file inside a block".into(),
                });
            }
            stmts.push(self.parse_stmt()?);
        }
        self.expect(TokenKind::RBrace)?;
        Ok(stmts)
    }

    fn parse_stmt(&mut self) -> Result<Stmt, CompileError> {
        let line = self.line();
        match self.peek_kind() {
            TokenKind::KwIf => self.parse_if(),
            TokenKind::KwWhile => {
                self.advance();
                self.expect(TokenKind::LParen)?;
                let cond = self.parse_expr()?;
                self.expect(TokenKind::RParen)?;
                let body = self.parse_block()?;
                Ok(Stmt { kind: StmtKind::While { cond, body }, line })
            }
            TokenKind::KwReturn => {
                self.advance();
                let value = if self.check(&TokenKind::Semi) {
                    None
                } else {
                    Some(self.parse_expr()?)
                };
                self.expect(TokenKind::Semi)?;
                Ok(Stmt { kind: StmtKind::Return(value), line })
            }
            TokenKind::KwPause => {
                self.advance();
                self.expect(TokenKind::LParen)?;
                let delay = self.parse_expr()?;
                self.expect(TokenKind::RParen)?;
                self.expect(TokenKind::Semi)?;
                Ok(Stmt { kind: StmtKind::Pause(delay), line })
            }
            TokenKind::KwString | TokenKind::KwBool | TokenKind::KwObject => self.parse_local(line),
            // 'int'/'float' open either a local declaration or a cast
            // expression; an identifier after the keyword means declaration.
            TokenKind::KwInt | TokenKind::KwFloat => {
                if matches!(self.tokens[self.pos + 1].kind, TokenKind::Ident(_)) {
                    self.parse_local(line)
                } else {
                    self.parse_expr_stmt(line)
                }
            }
            _ => self.parse_expr_stmt(line),
        }
    }

    fn parse_local(&mut self, line: u32) -> Result<Stmt, CompileError> {
        let ty = self.parse_type()?;
        let (name, _) = self.expect_ident()?;
        let init = if self.eat(&TokenKind::Assign) {
            Some(self.parse_expr()?)
        } else {
            None
        };
        self.expect(TokenKind::Semi)?;
        Ok(Stmt { kind: StmtKind::Local { ty, name, init }, line })
    }

    fn parse_if(&mut self) -> Result<Stmt, CompileError> {
        let line = self.line();
        self.expect(TokenKind::KwIf)?;
        self.expect(TokenKind::LParen)?;
        let cond = self.parse_expr()?;
        self.expect(TokenKind::RParen)?;
        let then_body = self.parse_block()?;
        let else_body = if self.eat(&TokenKind::KwElse) {
            if self.check(&TokenKind::KwIf) {
                // else-if chain: nest the next conditional as a one-statement
                // else block.
                Some(vec![self.parse_if()?])
            } else {
                Some(self.parse_block()?)
            }
        } else {
            None
        };
        Ok(Stmt {
            kind: StmtKind::If { cond, then_body, else_body },
            line,
        })
    }

    fn parse_expr_stmt(&mut self, line: u32) -> Result<Stmt, CompileError> {
        let expr = self.parse_expr()?;
        let stmt = if self.eat(&TokenKind::Assign) {
            let value = self.parse_expr()?;
            StmtKind::Assign { target: expr, value }
        } else if self.eat(&TokenKind::PlusPlus) {
            StmtKind::IncDec { target: expr, increment: true }
        } else if self.eat(&TokenKind::MinusMinus) {
            StmtKind::IncDec { target: expr, increment: false }
        } else {
            StmtKind::Expr(expr)
        };
        self.expect(TokenKind::Semi)?;
        Ok(Stmt { kind: stmt, line })
    }

    // Expressions, lowest precedence first.

    fn parse_expr(&mut self) -> Result<Expr, CompileError> {
        self.parse_or()
    }

    fn binary_level<F>(
        &mut self,
        mut next: F,
        table: &[(TokenKind, BinOp)],
    ) -> Result<Expr, CompileError>
    where
        F: FnMut(&mut Self) -> Result<Expr, CompileError>,
    {
        let mut lhs = next(self)?;
        'outer: loop {
            for (kind, op) in table {
                if self.check(kind) {
                    let line = self.line();
                    self.advance();
                    let rhs = next(self)?;
                    lhs = Expr {
                        kind: ExprKind::Binary {
                            op: *op,
                            lhs: Box::new(lhs),
                            rhs: Box::new(rhs),
                        },
                        line,
                    };
                    continue 'outer;
                }
            }
            return Ok(lhs);
        }
    }

    fn parse_or(&mut self) -> Result<Expr, CompileError> {
        self.binary_level(Self::parse_and, &[(TokenKind::OrOr, BinOp::Or)])
    }

    fn parse_and(&mut self) -> Result<Expr, CompileError> {
        self.binary_level(Self::parse_equality, &[(TokenKind::AndAnd, BinOp::And)])
    }

    fn parse_equality(&mut self) -> Result<Expr, CompileError> {
        self.binary_level(
            Self::parse_relational,
            &[(TokenKind::EqEq, BinOp::Eq), (TokenKind::NotEq, BinOp::Ne)],
        )
    }

    fn parse_relational(&mut self) -> Result<Expr, CompileError> {
        self.binary_level(
            Self::parse_concat,
            &[
                (TokenKind::Lt, BinOp::Lt),
                (TokenKind::LtEq, BinOp::Le),
                (TokenKind::Gt, BinOp::Gt),
                (TokenKind::GtEq, BinOp::Ge),
            ],
        )
    }

    fn parse_concat(&mut self) -> Result<Expr, CompileError> {
        self.binary_level(Self::parse_additive, &[(TokenKind::Amp, BinOp::Concat)])
    }

    fn parse_additive(&mut self) -> Result<Expr, CompileError> {
        self.binary_level(
            Self::parse_multiplicative,
            &[(TokenKind::Plus, BinOp::Add), (TokenKind::Minus, BinOp::Sub)],
        )
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, CompileError> {
        self.binary_level(
            Self::parse_unary,
            &[
                (TokenKind::Star, BinOp::Mul),
                (TokenKind::Slash, BinOp::Div),
                (TokenKind::Percent, BinOp::Mod),
            ],
        )
    }

    fn parse_unary(&mut self) -> Result<Expr, CompileError> {
        let line = self.line();
        if self.eat(&TokenKind::Minus) {
            let expr = self.parse_unary()?;
            return Ok(Expr {
                kind: ExprKind::Unary { op: UnOp::Neg, expr: Box::new(expr) },
                line,
            });
        }
        if self.eat(&TokenKind::Not) {
            let expr = self.parse_unary()?;
            return Ok(Expr {
                kind: ExprKind::Unary { op: UnOp::Not, expr: Box::new(expr) },
                line,
            });
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> Result<Expr, CompileError> {
        let mut expr = self.parse_primary()?;
        while self.check(&TokenKind::Dot) {
            let line = self.line();
            self.advance();
            let (member, _) = self.expect_ident()?;
            expr = Expr {
                kind: ExprKind::Member { object: Box::new(expr), member },
                line,
            };
        }
        Ok(expr)
    }

    fn parse_primary(&mut self) -> Result<Expr, CompileError> {
        let line = self.line();
        match self.peek_kind().clone() {
            TokenKind::IntLit(n) => {
                self.advance();
                Ok(Expr { kind: ExprKind::IntLit(n), line })
            }
            TokenKind::FloatLit(n) => {
                self.advance();
                Ok(Expr { kind: ExprKind::FloatLit(n), line })
            }
            TokenKind::StrLit(s) => {
                self.advance();
                Ok(Expr { kind: ExprKind::StrLit(s), line })
            }
            TokenKind::KwTrue => {
                self.advance();
                Ok(Expr { kind: ExprKind::BoolLit(true), line })
            }
            TokenKind::KwFalse => {
                self.advance();
                Ok(Expr { kind: ExprKind::BoolLit(false), line })
            }
            TokenKind::KwInt | TokenKind::KwFloat => {
                let to = if self.advance().kind == TokenKind::KwInt {
                    TypeName::Int
                } else {
                    TypeName::Float
                };
                self.expect(TokenKind::LParen)?;
                let expr = self.parse_expr()?;
                self.expect(TokenKind::RParen)?;
                Ok(Expr {
                    kind: ExprKind::Cast { to, expr: Box::new(expr) },
                    line,
                })
            }
            TokenKind::LParen => {
                self.advance();
                let expr = self.parse_expr()?;
                self.expect(TokenKind::RParen)?;
                Ok(expr)
            }
            TokenKind::Ident(name) => {
                self.advance();
                if self.eat(&TokenKind::LParen) {
                    let mut args = Vec::new();
                    if !self.check(&TokenKind::RParen) {
                        loop {
                            args.push(self.parse_expr()?);
                            if !self.eat(&TokenKind::Comma) {
                                break;
                            }
                        }
                    }
                    self.expect(TokenKind::RParen)?;
                    return Ok(Expr { kind: ExprKind::Call { name, args }, line });
                }
                if self.check(&TokenKind::LBracket) {
                    let mut indices = Vec::new();
                    while self.eat(&TokenKind::LBracket) {
                        indices.push(self.parse_expr()?);
                        self.expect(TokenKind::RBracket)?;
                    }
                    return Ok(Expr { kind: ExprKind::Index { name, indices }, line });
                }
                Ok(Expr { kind: ExprKind::Ident(name), line })
            }
            other => Err(CompileError::Syntax {
                line,
                msg: format!("expected an expression, found {other}"),
            }),
        }
    }
}
