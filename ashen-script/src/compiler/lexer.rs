//! Tokenizer for the trigger-script language.
//!
//! Produces a flat token stream with per-token line numbers; the parser and
//! the code generator both carry those lines into diagnostics and into the
//! program's debug table.

use std::fmt;

use super::error::CompileError;

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    IntLit(i32),
    FloatLit(f32),
    StrLit(String),
    Ident(String),

    // Type keywords
    KwInt,
    KwFloat,
    KwString,
    KwBool,
    KwVoid,
    KwObject,

    // Declaration / statement keywords
    KwTrigger,
    KwEvent,
    KwFunction,
    KwIf,
    KwElse,
    KwWhile,
    KwReturn,
    KwPause,
    KwTrue,
    KwFalse,

    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Amp,
    PlusPlus,
    MinusMinus,

    EqEq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    AndAnd,
    OrOr,
    Not,
    Assign,

    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Semi,
    Comma,
    Dot,
    Colon,

    Eof,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenKind::IntLit(n) => write!(f, "integer '{n}'"),
            TokenKind::FloatLit(n) => write!(f, "float '{n}'"),
            TokenKind::StrLit(s) => write!(f, "string {s:?}"),
            TokenKind::Ident(s) => write!(f, "identifier '{s}'"),
            TokenKind::KwInt => write!(f, "'int'"),
            TokenKind::KwFloat => write!(f, "'float'"),
            TokenKind::KwString => write!(f, "'string'"),
            TokenKind::KwBool => write!(f, "'bool'"),
            TokenKind::KwVoid => write!(f, "'void'"),
            TokenKind::KwObject => write!(f, "'object'"),
            TokenKind::KwTrigger => write!(f, "'trigger'"),
            TokenKind::KwEvent => write!(f, "'event'"),
            TokenKind::KwFunction => write!(f, "'function'"),
            TokenKind::KwIf => write!(f, "'if'"),
            TokenKind::KwElse => write!(f, "'else'"),
            TokenKind::KwWhile => write!(f, "'while'"),
            TokenKind::KwReturn => write!(f, "'return'"),
            TokenKind::KwPause => write!(f, "'pause'"),
            TokenKind::KwTrue => write!(f, "'true'"),
            TokenKind::KwFalse => write!(f, "'false'"),
            TokenKind::Plus => write!(f, "'+'"),
            TokenKind::Minus => write!(f, "'-'"),
            TokenKind::Star => write!(f, "'*'"),
            TokenKind::Slash => write!(f, "'/'"),
            TokenKind::Percent => write!(f, "'%'"),
            TokenKind::Amp => write!(f, "'&'"),
            TokenKind::PlusPlus => write!(f, "'++'"),
            TokenKind::MinusMinus => write!(f, "'--'"),
            TokenKind::EqEq => write!(f, "'=='"),
            TokenKind::NotEq => write!(f, "'!='"),
            TokenKind::Lt => write!(f, "'<'"),
            TokenKind::LtEq => write!(f, "'<='"),
            TokenKind::Gt => write!(f, "'>'"),
            TokenKind::GtEq => write!(f, "'>='"),
            TokenKind::AndAnd => write!(f, "'&&'"),
            TokenKind::OrOr => write!(f, "'||'"),
            TokenKind::Not => write!(f, "'!'"),
            TokenKind::Assign => write!(f, "'='"),
            TokenKind::LParen => write!(f, "'('"),
            TokenKind::RParen => write!(f, "')'"),
            TokenKind::LBrace => write!(f, "'{{'"),
            TokenKind::RBrace => write!(f, "'}}'"),
            TokenKind::LBracket => write!(f, "'['"),
            TokenKind::RBracket => write!(f, "']'"),
            TokenKind::Semi => write!(f, "';'"),
            TokenKind::Comma => write!(f, "','"),
            TokenKind::Dot => write!(f, "'.'"),
            TokenKind::Colon => write!(f, "':'"),
            TokenKind::Eof => write!(f, "end of file"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub line: u32,
}

pub struct Lexer<'a> {
    chars: std::str::Chars<'a>,
    current: Option<char>,
    line: u32,
}

impl<'a> Lexer<'a> {
    pub fn new(source: &'a str) -> Self {
        let mut chars = source.chars();
        let current = chars.next();
        Lexer { chars, current, line: 1 }
    }

    pub fn tokenize(mut self) -> Result<Vec<Token>, CompileError> {
        let mut tokens = Vec::new();
        loop {
            let tok = self.next_token()?;
            let done = tok.kind == TokenKind::Eof;
            tokens.push(tok);
            if done {
                return Ok(tokens);
            }
        }
    }

    fn advance(&mut self) {
        if self.current == Some('\n') {
            self.line += 1;
        }
        self.current = self.chars.next();
    }

    fn skip_whitespace_and_comments(&mut self) -> Result<(), CompileError> {
        loop {
            match self.current {
                Some(c) if c.is_whitespace() => self.advance(),
                Some('/') => {
                    let mut peek = self.chars.clone();
                    match peek.next() {
                        Some('/') => {
                            while self.current.is_some() && self.current != Some('\n') {
                                self.advance();
                            }
                        }
                        Some('*') => {
                            self.advance();
                            self.advance();
                            loop {
                                match self.current {
                                    None => return Ok(()),
                                    Some('*') => {
                                        self.advance();
                                        if self.current == Some('/') {
                                            self.advance();
                                            break;
                                        }
                                    }
                                    _ => self.advance(),
                                }
                            }
                        }
                        _ => return Ok(()),
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    fn token(&self, kind: TokenKind) -> Token {
        Token { kind, line: self.line }
    }

    fn single(&mut self, kind: TokenKind) -> Token {
        let tok = self.token(kind);
        self.advance();
        tok
    }

    /// Consume one character, then pick between a two-character token and a
    /// one-character fallback.
    fn pair(&mut self, next: char, long: TokenKind, short: TokenKind) -> Token {
        let line = self.line;
        self.advance();
        if self.current == Some(next) {
            self.advance();
            Token { kind: long, line }
        } else {
            Token { kind: short, line }
        }
    }

    fn next_token(&mut self) -> Result<Token, CompileError> {
        self.skip_whitespace_and_comments()?;
        let Some(ch) = self.current else {
            return Ok(self.token(TokenKind::Eof));
        };
        match ch {
            '(' => Ok(self.single(TokenKind::LParen)),
            ')' => Ok(self.single(TokenKind::RParen)),
            '{' => Ok(self.single(TokenKind::LBrace)),
            '}' => Ok(self.single(TokenKind::RBrace)),
            '[' => Ok(self.single(TokenKind::LBracket)),
            ']' => Ok(self.single(TokenKind::RBracket)),
            ';' => Ok(self.single(TokenKind::Semi)),
            ',' => Ok(self.single(TokenKind::Comma)),
            '.' => Ok(self.single(TokenKind::Dot)),
            ':' => Ok(self.single(TokenKind::Colon)),
            '*' => Ok(self.single(TokenKind::Star)),
            '/' => Ok(self.single(TokenKind::Slash)),
            '%' => Ok(self.single(TokenKind::Percent)),
            '+' => Ok(self.pair('+', TokenKind::PlusPlus, TokenKind::Plus)),
            '-' => Ok(self.pair('-', TokenKind::MinusMinus, TokenKind::Minus)),
            '&' => Ok(self.pair('&', TokenKind::AndAnd, TokenKind::Amp)),
            '=' => Ok(self.pair('=', TokenKind::EqEq, TokenKind::Assign)),
            '!' => Ok(self.pair('=', TokenKind::NotEq, TokenKind::Not)),
            '<' => Ok(self.pair('=', TokenKind::LtEq, TokenKind::Lt)),
            '>' => Ok(self.pair('=', TokenKind::GtEq, TokenKind::Gt)),
            '|' => {
                let line = self.line;
                self.advance();
                if self.current == Some('|') {
                    self.advance();
                    Ok(Token { kind: TokenKind::OrOr, line })
                } else {
                    Err(CompileError::UnexpectedChar { line, ch: '|' })
                }
            }
            '"' => self.lex_string(),
            c if c.is_ascii_digit() => self.lex_number(),
            c if c.is_alphabetic() || c == '_' => Ok(self.lex_ident()),
            c => Err(CompileError::UnexpectedChar { line: self.line, ch: c }),
        }
    }

    fn lex_string(&mut self) -> Result<Token, CompileError> {
        let line = self.line;
        self.advance();
        let mut out = String::new();
        loop {
            match self.current {
                None | Some('\n') => return Err(CompileError::UnterminatedString { line }),
                Some('"') => {
                    self.advance();
                    return Ok(Token { kind: TokenKind::StrLit(out), line });
                }
                Some('\\') => {
                    self.advance();
                    match self.current {
                        Some('n') => out.push('\n'),
                        Some('t') => out.push('\t'),
                        Some('"') => out.push('"'),
                        Some('\\') => out.push('\\'),
                        Some(c) => out.push(c),
                        None => return Err(CompileError::UnterminatedString { line }),
                    }
                    self.advance();
                }
                Some(c) => {
                    out.push(c);
                    self.advance();
                }
            }
        }
    }

    fn lex_number(&mut self) -> Result<Token, CompileError> {
        let line = self.line;
        let mut text = String::new();
        let mut is_float = false;
        while let Some(c) = self.current {
            if c.is_ascii_digit() {
                text.push(c);
                self.advance();
            } else if c == '.' && !is_float && self.chars.clone().next().is_some_and(|n| n.is_ascii_digit()) {
                is_float = true;
                text.push(c);
                self.advance();
            } else {
                break;
            }
        }
        let kind = if is_float {
            TokenKind::FloatLit(text.parse().map_err(|_| CompileError::BadNumber { line })?)
        } else {
            TokenKind::IntLit(text.parse().map_err(|_| CompileError::BadNumber { line })?)
        };
        Ok(Token { kind, line })
    }

    fn lex_ident(&mut self) -> Token {
        let line = self.line;
        let mut text = String::new();
        while let Some(c) = self.current {
            if c.is_alphanumeric() || c == '_' {
                text.push(c);
                self.advance();
            } else {
                break;
            }
        }
        let kind = match text.as_str() {
            "int" => TokenKind::KwInt,
            "float" => TokenKind::KwFloat,
            "string" => TokenKind::KwString,
            "bool" => TokenKind::KwBool,
            "void" => TokenKind::KwVoid,
            "object" => TokenKind::KwObject,
            "trigger" => TokenKind::KwTrigger,
            "event" => TokenKind::KwEvent,
            "function" => TokenKind::KwFunction,
            "if" => TokenKind::KwIf,
            "else" => TokenKind::KwElse,
            "while" => TokenKind::KwWhile,
            "return" => TokenKind::KwReturn,
            "pause" => TokenKind::KwPause,
            "true" => TokenKind::KwTrue,
            "false" => TokenKind::KwFalse,
            _ => TokenKind::Ident(text),
        };
        Token { kind, line }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        Lexer::new(src)
            .tokenize()
            .unwrap()
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn declarations_and_operators() {
        assert_eq!(
            kinds("int x = 1 + 2.5;"),
            vec![
                TokenKind::KwInt,
                TokenKind::Ident("x".into()),
                TokenKind::Assign,
                TokenKind::IntLit(1),
                TokenKind::Plus,
                TokenKind::FloatLit(2.5),
                TokenKind::Semi,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn concat_vs_logical_and() {
        assert_eq!(
            kinds("a & b && c"),
            vec![
                TokenKind::Ident("a".into()),
                TokenKind::Amp,
                TokenKind::Ident("b".into()),
                TokenKind::AndAnd,
                TokenKind::Ident("c".into()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn comments_do_not_produce_tokens() {
        assert_eq!(
            kinds("x // trailing\n/* block\nspanning */ y"),
            vec![
                TokenKind::Ident("x".into()),
                TokenKind::Ident("y".into()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn lines_are_tracked() {
        let toks = Lexer::new("a\nb\n\nc").tokenize().unwrap();
        let lines: Vec<u32> = toks.iter().map(|t| t.line).collect();
        assert_eq!(lines, vec![1, 2, 4, 4]);
    }

    #[test]
    fn unterminated_string_is_reported() {
        assert!(Lexer::new("\"oops").tokenize().is_err());
    }
}
