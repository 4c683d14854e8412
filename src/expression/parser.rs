//! Tokenizer and recursive-descent parser for fragment expressions
//!
//! Precedence, lowest first: `||`, `&&`, equality, ordering, `+`, unary `!`.

use super::errors::ExpressionError;
use serde_json::{Number, Value};

/// One step of a dotted path
#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    Key(String),
    Index(usize),
}

/// A dotted path such as `search.output.results[0].title`
#[derive(Debug, Clone, PartialEq)]
pub struct Path {
    pub root: String,
    pub segments: Vec<Segment>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Or,
    And,
    Concat,
    LooseEq,
    LooseNe,
    StrictEq,
    StrictNe,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Parsed expression tree
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Undefined,
    Literal(Value),
    Path(Path),
    Not(Box<Expr>),
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
}

impl Expr {
    /// Root identifiers of every path in the expression, in source order
    pub fn roots(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_roots(&mut out);
        out
    }

    fn collect_roots<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Expr::Path(path) => out.push(path.root.as_str()),
            Expr::Not(inner) => inner.collect_roots(out),
            Expr::Binary { left, right, .. } => {
                left.collect_roots(out);
                right.collect_roots(out);
            }
            Expr::Undefined | Expr::Literal(_) => {}
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Token {
    Ident(String),
    Number(Number),
    Str(String),
    Dot,
    LBracket,
    RBracket,
    LParen,
    RParen,
    Or,
    And,
    Not,
    Plus,
    LooseEq,
    LooseNe,
    StrictEq,
    StrictNe,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::Ident(name) => format!("identifier '{}'", name),
            Token::Number(n) => format!("number {}", n),
            Token::Str(s) => format!("string '{}'", s),
            Token::Dot => "'.'".into(),
            Token::LBracket => "'['".into(),
            Token::RBracket => "']'".into(),
            Token::LParen => "'('".into(),
            Token::RParen => "')'".into(),
            Token::Or => "'||'".into(),
            Token::And => "'&&'".into(),
            Token::Not => "'!'".into(),
            Token::Plus => "'+'".into(),
            Token::LooseEq => "'=='".into(),
            Token::LooseNe => "'!='".into(),
            Token::StrictEq => "'==='".into(),
            Token::StrictNe => "'!=='".into(),
            Token::Lt => "'<'".into(),
            Token::Le => "'<='".into(),
            Token::Gt => "'>'".into(),
            Token::Ge => "'>='".into(),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Spanned {
    pub token: Token,
    pub offset: usize,
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_' || c == '$'
}

fn is_ident_continue(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '$' || c == '-'
}

/// Split an expression into tokens
pub(crate) fn tokenize(src: &str) -> Result<Vec<Spanned>, ExpressionError> {
    let chars: Vec<(usize, char)> = src.char_indices().collect();
    let peek = |i: usize| chars.get(i).map(|&(_, c)| c);
    let offset_at = |i: usize| chars.get(i).map(|&(o, _)| o).unwrap_or(src.len());

    let mut tokens = Vec::new();
    let mut i = 0;

    while let Some(&(offset, c)) = chars.get(i) {
        let (token, width) = match c {
            c if c.is_whitespace() => {
                i += 1;
                continue;
            }
            '.' => (Token::Dot, 1),
            '[' => (Token::LBracket, 1),
            ']' => (Token::RBracket, 1),
            '(' => (Token::LParen, 1),
            ')' => (Token::RParen, 1),
            '+' => (Token::Plus, 1),
            '|' if peek(i + 1) == Some('|') => (Token::Or, 2),
            '&' if peek(i + 1) == Some('&') => (Token::And, 2),
            '!' if peek(i + 1) == Some('=') && peek(i + 2) == Some('=') => (Token::StrictNe, 3),
            '!' if peek(i + 1) == Some('=') => (Token::LooseNe, 2),
            '!' => (Token::Not, 1),
            '=' if peek(i + 1) == Some('=') && peek(i + 2) == Some('=') => (Token::StrictEq, 3),
            '=' if peek(i + 1) == Some('=') => (Token::LooseEq, 2),
            '<' if peek(i + 1) == Some('=') => (Token::Le, 2),
            '<' => (Token::Lt, 1),
            '>' if peek(i + 1) == Some('=') => (Token::Ge, 2),
            '>' => (Token::Gt, 1),
            '\'' | '"' => {
                let mut value = String::new();
                let mut j = i + 1;
                let mut closed = false;
                while let Some(ch) = peek(j) {
                    if ch == '\\' {
                        match peek(j + 1) {
                            Some('n') => value.push('\n'),
                            Some('t') => value.push('\t'),
                            Some('r') => value.push('\r'),
                            Some(other) => value.push(other),
                            None => break,
                        }
                        j += 2;
                        continue;
                    }
                    if ch == c {
                        closed = true;
                        j += 1;
                        break;
                    }
                    value.push(ch);
                    j += 1;
                }
                if !closed {
                    return Err(ExpressionError::syntax(src, offset, "unterminated string literal"));
                }
                (Token::Str(value), j - i)
            }
            c if c.is_ascii_digit() => {
                let mut j = i;
                while peek(j).is_some_and(|d| d.is_ascii_digit()) {
                    j += 1;
                }
                let mut is_float = false;
                if peek(j) == Some('.') && peek(j + 1).is_some_and(|d| d.is_ascii_digit()) {
                    is_float = true;
                    j += 1;
                    while peek(j).is_some_and(|d| d.is_ascii_digit()) {
                        j += 1;
                    }
                }
                let text = &src[offset..offset_at(j)];
                let number = if is_float {
                    text.parse::<f64>().ok().and_then(Number::from_f64)
                } else {
                    text.parse::<i64>()
                        .ok()
                        .map(Number::from)
                        .or_else(|| text.parse::<f64>().ok().and_then(Number::from_f64))
                };
                let number = number
                    .ok_or_else(|| ExpressionError::syntax(src, offset, "invalid number literal"))?;
                (Token::Number(number), j - i)
            }
            c if is_ident_start(c) => {
                let mut j = i + 1;
                while peek(j).is_some_and(is_ident_continue) {
                    j += 1;
                }
                let name = src[offset..offset_at(j)].to_string();
                (Token::Ident(name), j - i)
            }
            '|' | '&' => {
                return Err(ExpressionError::syntax(
                    src,
                    offset,
                    format!("expected '{c}{c}'"),
                ));
            }
            '=' => {
                return Err(ExpressionError::syntax(
                    src,
                    offset,
                    "assignment is not supported, use '=='",
                ));
            }
            other => {
                return Err(ExpressionError::syntax(
                    src,
                    offset,
                    format!("unexpected character '{}'", other),
                ));
            }
        };

        tokens.push(Spanned { token, offset });
        i += width;
    }

    Ok(tokens)
}

/// Parse a single expression (the text between `{{` and `}}`)
pub fn parse_expression(src: &str) -> Result<Expr, ExpressionError> {
    let tokens = tokenize(src)?;
    if tokens.is_empty() {
        return Err(ExpressionError::syntax(src, 0, "empty expression"));
    }

    let mut parser = Parser {
        src,
        tokens,
        pos: 0,
        depth: 0,
    };
    let expr = parser.parse_or()?;

    if let Some(extra) = parser.tokens.get(parser.pos) {
        return Err(ExpressionError::syntax(
            src,
            extra.offset,
            format!("unexpected {}", extra.token.describe()),
        ));
    }

    Ok(expr)
}

/// Deepest expression tree the parser will build
const MAX_NESTING: usize = 128;

struct Parser<'a> {
    src: &'a str,
    tokens: Vec<Spanned>,
    pos: usize,
    depth: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|s| &s.token)
    }

    fn advance(&mut self) -> Option<Spanned> {
        let next = self.tokens.get(self.pos).cloned();
        if next.is_some() {
            self.pos += 1;
        }
        next
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    /// Go one level deeper; every `(`, `!` and chained operator counts
    fn enter(&mut self) -> Result<(), ExpressionError> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            let offset = self
                .tokens
                .get(self.pos)
                .map_or(self.src.len(), |t| t.offset);
            return Err(ExpressionError::syntax(
                self.src,
                offset,
                "expression nested too deeply",
            ));
        }
        Ok(())
    }

    fn end_error(&self) -> ExpressionError {
        ExpressionError::syntax(self.src, self.src.len(), "unexpected end of expression")
    }

    /// Raw text of a malformed path segment starting at `offset`
    fn segment_text(&self, offset: usize) -> String {
        self.src[offset..]
            .chars()
            .take_while(|c| !c.is_whitespace() && !matches!(c, '.' | '[' | ']' | '(' | ')'))
            .collect()
    }

    fn parse_or(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_and()?;
        let mut chained = 0;
        while self.eat(&Token::Or) {
            self.enter()?;
            chained += 1;
            let right = self.parse_and()?;
            left = binary(BinaryOp::Or, left, right);
        }
        self.depth -= chained;
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_equality()?;
        let mut chained = 0;
        while self.eat(&Token::And) {
            self.enter()?;
            chained += 1;
            let right = self.parse_equality()?;
            left = binary(BinaryOp::And, left, right);
        }
        self.depth -= chained;
        Ok(left)
    }

    fn parse_equality(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_comparison()?;
        let mut chained = 0;
        loop {
            let op = match self.peek() {
                Some(Token::LooseEq) => BinaryOp::LooseEq,
                Some(Token::LooseNe) => BinaryOp::LooseNe,
                Some(Token::StrictEq) => BinaryOp::StrictEq,
                Some(Token::StrictNe) => BinaryOp::StrictNe,
                _ => break,
            };
            self.pos += 1;
            self.enter()?;
            chained += 1;
            let right = self.parse_comparison()?;
            left = binary(op, left, right);
        }
        self.depth -= chained;
        Ok(left)
    }

    fn parse_comparison(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_additive()?;
        let mut chained = 0;
        loop {
            let op = match self.peek() {
                Some(Token::Lt) => BinaryOp::Lt,
                Some(Token::Le) => BinaryOp::Le,
                Some(Token::Gt) => BinaryOp::Gt,
                Some(Token::Ge) => BinaryOp::Ge,
                _ => break,
            };
            self.pos += 1;
            self.enter()?;
            chained += 1;
            let right = self.parse_additive()?;
            left = binary(op, left, right);
        }
        self.depth -= chained;
        Ok(left)
    }

    fn parse_additive(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_unary()?;
        let mut chained = 0;
        while self.eat(&Token::Plus) {
            self.enter()?;
            chained += 1;
            let right = self.parse_unary()?;
            left = binary(BinaryOp::Concat, left, right);
        }
        self.depth -= chained;
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, ExpressionError> {
        if self.eat(&Token::Not) {
            self.enter()?;
            let inner = self.parse_unary()?;
            self.depth -= 1;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, ExpressionError> {
        let Some(spanned) = self.advance() else {
            return Err(self.end_error());
        };

        match spanned.token {
            Token::Number(n) => Ok(Expr::Literal(Value::Number(n))),
            Token::Str(s) => Ok(Expr::Literal(Value::String(s))),
            Token::LParen => {
                self.enter()?;
                let inner = self.parse_or()?;
                self.depth -= 1;
                if !self.eat(&Token::RParen) {
                    return Err(match self.tokens.get(self.pos) {
                        Some(t) => ExpressionError::syntax(
                            self.src,
                            t.offset,
                            format!("expected ')', found {}", t.token.describe()),
                        ),
                        None => self.end_error(),
                    });
                }
                Ok(inner)
            }
            Token::Ident(name) => match name.as_str() {
                "true" => Ok(Expr::Literal(Value::Bool(true))),
                "false" => Ok(Expr::Literal(Value::Bool(false))),
                "null" => Ok(Expr::Literal(Value::Null)),
                "undefined" => Ok(Expr::Undefined),
                _ => self.parse_path(name),
            },
            other => Err(ExpressionError::syntax(
                self.src,
                spanned.offset,
                format!("unexpected {}", other.describe()),
            )),
        }
    }

    fn parse_path(&mut self, root: String) -> Result<Expr, ExpressionError> {
        let mut segments = Vec::new();

        loop {
            match self.peek() {
                Some(Token::Dot) => {
                    self.pos += 1;
                    match self.advance() {
                        Some(Spanned {
                            token: Token::Ident(key),
                            ..
                        }) => segments.push(Segment::Key(key)),
                        Some(other) => {
                            return Err(ExpressionError::invalid_segment(
                                self.src,
                                self.segment_text(other.offset),
                            ));
                        }
                        None => return Err(ExpressionError::invalid_segment(self.src, "")),
                    }
                }
                Some(Token::LBracket) => {
                    self.pos += 1;
                    let index = match self.advance() {
                        Some(Spanned {
                            token: Token::Number(n),
                            offset,
                        }) => n
                            .as_u64()
                            .and_then(|i| usize::try_from(i).ok())
                            .ok_or_else(|| {
                                ExpressionError::invalid_segment(self.src, self.segment_text(offset))
                            })?,
                        Some(other) => {
                            return Err(ExpressionError::invalid_segment(
                                self.src,
                                format!("[{}", self.segment_text(other.offset)),
                            ));
                        }
                        None => return Err(ExpressionError::invalid_segment(self.src, "[")),
                    };
                    if !self.eat(&Token::RBracket) {
                        return Err(ExpressionError::invalid_segment(
                            self.src,
                            format!("[{}", index),
                        ));
                    }
                    segments.push(Segment::Index(index));
                }
                _ => break,
            }
        }

        Ok(Expr::Path(Path { root, segments }))
    }
}

fn binary(op: BinaryOp, left: Expr, right: Expr) -> Expr {
    Expr::Binary {
        op,
        left: Box::new(left),
        right: Box::new(right),
    }
}
