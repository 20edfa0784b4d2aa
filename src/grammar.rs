//! Parsing of specification lines into [Node]s.
//!
//! The runtime only depends on the [Grammar] trait. [EtGrammar] is the built-in line grammar:
//!
//! ```text
//! x[a, b:a] = RANDOM(0, 10, FLOAT)       # statement; `b` shadows `a`
//! y[a, c] += x[a, b] * w[b, c] - 1       # `+=` sums over `b`
//! math.reduce_sum(x, axis=RANK(a))       # call
//! y, z                                   # outputs
//! RANK(a) + DIMS(c)[0] // 2 >= 3         # constraint
//! ```

use auto_impl::auto_impl;
use logos::Logos;
use std::fmt;
use std::str::FromStr;

use crate::ast::{
    ArrayRef, AssignOp, BinOp, CallArg, CallExpr, CallValue, CmpOp, Constraint, Expr, IndexSpec,
    IntExpr, IntOp, Node, OutputRef, Rhs, Statement,
};
use crate::common::Dtype;

/// Which kind of [Node] a piece of text is expected to hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum ParseMode {
    #[strum(serialize = "statement")]
    Statement,
    #[strum(serialize = "constraint")]
    Constraint,
    #[strum(serialize = "call")]
    Call,
    #[strum(serialize = "output")]
    Outputs,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("unrecognized input {text:?} at byte {offset}")]
    Lex { text: String, offset: usize },
    #[error("expected {expected}, found {found} at byte {offset}")]
    Unexpected {
        expected: &'static str,
        found: String,
        offset: usize,
    },
    #[error("unknown dtype '{0}'")]
    UnknownDtype(String),
    #[error("invalid number '{0}'")]
    InvalidNumber(String),
    #[error("unexpected trailing input at byte {offset}: {found}")]
    Trailing { found: String, offset: usize },
}

#[auto_impl(&, Box)]
pub trait Grammar {
    fn parse(&self, mode: ParseMode, text: &str) -> Result<Node, ParseError>;
}

/// The built-in grammar.
#[derive(Debug, Clone, Copy, Default)]
pub struct EtGrammar;

impl Grammar for EtGrammar {
    fn parse(&self, mode: ParseMode, text: &str) -> Result<Node, ParseError> {
        let mut parser = Parser::new(lex(text)?);
        let node = match mode {
            ParseMode::Statement => Node::Statement(parser.parse_statement()?),
            ParseMode::Constraint => Node::Constraint(parser.parse_constraint()?),
            ParseMode::Call => Node::Call(parser.parse_call()?),
            ParseMode::Outputs => Node::Outputs(parser.parse_outputs()?),
        };
        parser.finish()?;
        Ok(node)
    }
}

#[derive(Logos, Debug, Clone, Copy, PartialEq, Eq)]
#[logos(skip r"[ \t\r\n]+")]
#[logos(skip r"#[^\n]*")]
enum TokenKind {
    #[token("RANDOM")]
    Random,
    #[token("RANK")]
    Rank,
    #[token("DIMS")]
    Dims,
    #[token("NELEM")]
    Nelem,
    #[token("True")]
    True,
    #[token("False")]
    False,
    #[token("None")]
    NoneKw,

    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("[")]
    LBracket,
    #[token("]")]
    RBracket,
    #[token(",")]
    Comma,
    #[token(":")]
    Colon,
    #[token(".")]
    Dot,

    #[token("=")]
    Assign,
    #[token("+=")]
    PlusAssign,
    #[token("==")]
    EqEq,
    #[token("!=")]
    NotEq,
    #[token("<")]
    Lt,
    #[token("<=")]
    LtEq,
    #[token(">")]
    Gt,
    #[token(">=")]
    GtEq,

    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("*")]
    Star,
    #[token("/")]
    Slash,
    #[token("//")]
    SlashSlash,

    #[regex(r"[0-9]+\.[0-9]*([eE][+-]?[0-9]+)?|[0-9]+[eE][+-]?[0-9]+")]
    FloatLiteral,
    #[regex(r"[0-9]+")]
    IntLiteral,
    #[regex(r"[a-zA-Z_][a-zA-Z0-9_]*", priority = 1)]
    Ident,

    Eof,
}

#[derive(Debug, Clone, Copy)]
struct Token<'a> {
    kind: TokenKind,
    offset: usize,
    text: &'a str,
}

fn lex(source: &str) -> Result<Vec<Token<'_>>, ParseError> {
    let mut tokens = Vec::new();
    let mut lexer = TokenKind::lexer(source);
    while let Some(result) = lexer.next() {
        let offset = lexer.span().start;
        let text = lexer.slice();
        match result {
            Ok(kind) => tokens.push(Token { kind, offset, text }),
            Err(()) => {
                return Err(ParseError::Lex {
                    text: text.to_owned(),
                    offset,
                })
            }
        }
    }
    tokens.push(Token {
        kind: TokenKind::Eof,
        offset: source.len(),
        text: "",
    });
    Ok(tokens)
}

impl fmt::Display for Token<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            TokenKind::Eof => f.write_str("end of input"),
            _ => write!(f, "`{}`", self.text),
        }
    }
}

struct Parser<'a> {
    tokens: Vec<Token<'a>>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(tokens: Vec<Token<'a>>) -> Self {
        Parser { tokens, pos: 0 }
    }

    fn peek(&self) -> Token<'a> {
        self.tokens[self.pos]
    }

    fn peek_kind(&self) -> TokenKind {
        self.peek().kind
    }

    fn peek_nth_kind(&self, n: usize) -> TokenKind {
        self.tokens
            .get(self.pos + n)
            .map_or(TokenKind::Eof, |t| t.kind)
    }

    // The trailing Eof is never consumed.
    fn advance(&mut self) -> Token<'a> {
        let tok = self.peek();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        tok
    }

    fn eat(&mut self, kind: TokenKind) -> Option<Token<'a>> {
        if self.peek_kind() == kind {
            Some(self.advance())
        } else {
            None
        }
    }

    fn expect(&mut self, kind: TokenKind, expected: &'static str) -> Result<Token<'a>, ParseError> {
        self.eat(kind).ok_or_else(|| self.unexpected(expected))
    }

    fn unexpected(&self, expected: &'static str) -> ParseError {
        let tok = self.peek();
        ParseError::Unexpected {
            expected,
            found: tok.to_string(),
            offset: tok.offset,
        }
    }

    fn finish(&self) -> Result<(), ParseError> {
        let tok = self.peek();
        if tok.kind == TokenKind::Eof {
            Ok(())
        } else {
            Err(ParseError::Trailing {
                found: tok.to_string(),
                offset: tok.offset,
            })
        }
    }

    fn ident(&mut self, expected: &'static str) -> Result<String, ParseError> {
        Ok(self.expect(TokenKind::Ident, expected)?.text.to_owned())
    }

    // --- Statements ---

    fn parse_statement(&mut self) -> Result<Statement, ParseError> {
        let lhs = self.parse_array_ref()?;
        let op = if self.eat(TokenKind::Assign).is_some() {
            AssignOp::Assign
        } else if self.eat(TokenKind::PlusAssign).is_some() {
            AssignOp::Accumulate
        } else {
            return Err(self.unexpected("`=` or `+=`"));
        };
        let rhs = if self.eat(TokenKind::Random).is_some() {
            self.expect(TokenKind::LParen, "`(`")?;
            let lo = self.parse_number()?;
            self.expect(TokenKind::Comma, "`,`")?;
            let hi = self.parse_number()?;
            self.expect(TokenKind::Comma, "`,`")?;
            let dtype_name = self.ident("a dtype")?;
            let dtype =
                Dtype::from_str(&dtype_name).map_err(|_| ParseError::UnknownDtype(dtype_name))?;
            self.expect(TokenKind::RParen, "`)`")?;
            Rhs::Random { lo, hi, dtype }
        } else {
            Rhs::Expr(self.parse_expr()?)
        };
        Ok(Statement { lhs, op, rhs })
    }

    fn parse_array_ref(&mut self) -> Result<ArrayRef, ParseError> {
        let name = self.ident("an array name")?;
        self.expect(TokenKind::LBracket, "`[`")?;
        let mut groups = Vec::new();
        if self.eat(TokenKind::RBracket).is_none() {
            loop {
                let name = self.ident("an index group")?;
                let shadow_of = match self.eat(TokenKind::Colon) {
                    Some(_) => Some(self.ident("an index group")?),
                    None => None,
                };
                groups.push(IndexSpec { name, shadow_of });
                if self.eat(TokenKind::Comma).is_none() {
                    break;
                }
            }
            self.expect(TokenKind::RBracket, "`]`")?;
        }
        Ok(ArrayRef { name, groups })
    }

    fn parse_number(&mut self) -> Result<f64, ParseError> {
        let negate = self.eat(TokenKind::Minus).is_some();
        let tok = self.peek();
        let value = match tok.kind {
            TokenKind::IntLiteral | TokenKind::FloatLiteral => tok
                .text
                .parse::<f64>()
                .map_err(|_| ParseError::InvalidNumber(tok.text.to_owned()))?,
            _ => return Err(self.unexpected("a number")),
        };
        self.advance();
        Ok(if negate { -value } else { value })
    }

    fn parse_expr(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_term()?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::Plus => BinOp::Add,
                TokenKind::Minus => BinOp::Sub,
                _ => return Ok(lhs),
            };
            self.advance();
            let rhs = self.parse_term()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn parse_term(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::Star => BinOp::Mul,
                TokenKind::Slash => BinOp::Div,
                _ => return Ok(lhs),
            };
            self.advance();
            let rhs = self.parse_unary()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn parse_unary(&mut self) -> Result<Expr, ParseError> {
        if self.eat(TokenKind::Minus).is_some() {
            return Ok(Expr::Neg(Box::new(self.parse_unary()?)));
        }
        match self.peek_kind() {
            TokenKind::IntLiteral | TokenKind::FloatLiteral => Ok(Expr::Num(self.parse_number()?)),
            TokenKind::Ident => Ok(Expr::Array(self.parse_array_ref()?)),
            TokenKind::LParen => {
                self.advance();
                let inner = self.parse_expr()?;
                self.expect(TokenKind::RParen, "`)`")?;
                Ok(inner)
            }
            _ => Err(self.unexpected("an expression")),
        }
    }

    // --- Constraints ---

    fn parse_constraint(&mut self) -> Result<Constraint, ParseError> {
        let lhs = self.parse_int_expr()?;
        let cmp = match self.peek_kind() {
            TokenKind::EqEq => CmpOp::Eq,
            TokenKind::NotEq => CmpOp::Ne,
            TokenKind::Lt => CmpOp::Lt,
            TokenKind::LtEq => CmpOp::Le,
            TokenKind::Gt => CmpOp::Gt,
            TokenKind::GtEq => CmpOp::Ge,
            _ => return Err(self.unexpected("a comparison")),
        };
        self.advance();
        let rhs = self.parse_int_expr()?;
        Ok(Constraint { lhs, cmp, rhs })
    }

    fn parse_int_expr(&mut self) -> Result<IntExpr, ParseError> {
        let mut lhs = self.parse_int_term()?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::Plus => IntOp::Add,
                TokenKind::Minus => IntOp::Sub,
                _ => return Ok(lhs),
            };
            self.advance();
            let rhs = self.parse_int_term()?;
            lhs = IntExpr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn parse_int_term(&mut self) -> Result<IntExpr, ParseError> {
        let mut lhs = self.parse_int_unary()?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::Star => IntOp::Mul,
                TokenKind::SlashSlash => IntOp::FloorDiv,
                _ => return Ok(lhs),
            };
            self.advance();
            let rhs = self.parse_int_unary()?;
            lhs = IntExpr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn parse_int_unary(&mut self) -> Result<IntExpr, ParseError> {
        if self.eat(TokenKind::Minus).is_some() {
            let inner = self.parse_int_unary()?;
            return Ok(match inner {
                IntExpr::Lit(v) => IntExpr::Lit(-v),
                other => IntExpr::Binary(IntOp::Sub, Box::new(IntExpr::Lit(0)), Box::new(other)),
            });
        }
        match self.peek_kind() {
            TokenKind::IntLiteral => Ok(IntExpr::Lit(self.parse_int()?)),
            TokenKind::Rank => Ok(IntExpr::Rank(self.parse_group_fn()?)),
            TokenKind::Nelem => Ok(IntExpr::Nelem(self.parse_group_fn()?)),
            TokenKind::Dims => {
                let group = self.parse_group_fn()?;
                self.expect(TokenKind::LBracket, "`[`")?;
                let index = self.parse_int()?;
                self.expect(TokenKind::RBracket, "`]`")?;
                let index = usize::try_from(index)
                    .map_err(|_| ParseError::InvalidNumber(index.to_string()))?;
                Ok(IntExpr::Dim(group, index))
            }
            TokenKind::LParen => {
                self.advance();
                let inner = self.parse_int_expr()?;
                self.expect(TokenKind::RParen, "`)`")?;
                Ok(inner)
            }
            _ => Err(self.unexpected("an integer expression")),
        }
    }

    fn parse_int(&mut self) -> Result<i64, ParseError> {
        let tok = self.expect(TokenKind::IntLiteral, "an integer")?;
        tok.text
            .parse()
            .map_err(|_| ParseError::InvalidNumber(tok.text.to_owned()))
    }

    /// Parses `KEYWORD(group)` after the keyword has been peeked, returning the group name.
    fn parse_group_fn(&mut self) -> Result<String, ParseError> {
        self.advance();
        self.expect(TokenKind::LParen, "`(`")?;
        let group = self.ident("an index group")?;
        self.expect(TokenKind::RParen, "`)`")?;
        Ok(group)
    }

    // --- Calls ---

    fn parse_call(&mut self) -> Result<CallExpr, ParseError> {
        let mut op_path = self.ident("an operation path")?;
        while self.eat(TokenKind::Dot).is_some() {
            op_path.push('.');
            op_path.push_str(self.expect(TokenKind::Ident, "a path component")?.text);
        }
        self.expect(TokenKind::LParen, "`(`")?;
        let mut args = Vec::new();
        if self.eat(TokenKind::RParen).is_none() {
            loop {
                let keyword = if self.peek_kind() == TokenKind::Ident
                    && self.peek_nth_kind(1) == TokenKind::Assign
                {
                    let k = self.ident("a keyword")?;
                    self.advance();
                    Some(k)
                } else {
                    None
                };
                let value = self.parse_call_value()?;
                args.push(CallArg { keyword, value });
                if self.eat(TokenKind::Comma).is_none() {
                    break;
                }
            }
            self.expect(TokenKind::RParen, "`)`")?;
        }
        Ok(CallExpr { op_path, args })
    }

    fn parse_call_value(&mut self) -> Result<CallValue, ParseError> {
        let tok = self.peek();
        Ok(match tok.kind {
            TokenKind::Ident => {
                self.advance();
                CallValue::Array(tok.text.to_owned())
            }
            TokenKind::True => {
                self.advance();
                CallValue::Bool(true)
            }
            TokenKind::False => {
                self.advance();
                CallValue::Bool(false)
            }
            TokenKind::NoneKw => {
                self.advance();
                CallValue::None
            }
            TokenKind::Rank => CallValue::Rank(self.parse_group_fn()?),
            TokenKind::Dims => CallValue::Dims(self.parse_group_fn()?),
            TokenKind::Nelem => CallValue::Nelem(self.parse_group_fn()?),
            TokenKind::LBracket => {
                self.advance();
                let mut values = Vec::new();
                if self.eat(TokenKind::RBracket).is_none() {
                    loop {
                        values.push(self.parse_signed_int()?);
                        if self.eat(TokenKind::Comma).is_none() {
                            break;
                        }
                    }
                    self.expect(TokenKind::RBracket, "`]`")?;
                }
                CallValue::Ints(values)
            }
            TokenKind::Minus | TokenKind::IntLiteral | TokenKind::FloatLiteral => {
                let negate = self.eat(TokenKind::Minus).is_some();
                let tok = self.peek();
                match tok.kind {
                    TokenKind::IntLiteral => {
                        let v = self.parse_int()?;
                        CallValue::Int(if negate { -v } else { v })
                    }
                    TokenKind::FloatLiteral => {
                        let v = self.parse_number()?;
                        CallValue::Float(if negate { -v } else { v })
                    }
                    _ => return Err(self.unexpected("a number")),
                }
            }
            _ => return Err(self.unexpected("an argument")),
        })
    }

    fn parse_signed_int(&mut self) -> Result<i64, ParseError> {
        let negate = self.eat(TokenKind::Minus).is_some();
        let v = self.parse_int()?;
        Ok(if negate { -v } else { v })
    }

    // --- Outputs ---

    fn parse_outputs(&mut self) -> Result<Vec<OutputRef>, ParseError> {
        let bracketed = self.eat(TokenKind::LBracket).is_some();
        let mut outputs = Vec::new();
        loop {
            outputs.push(OutputRef {
                name: self.ident("an output array name")?,
            });
            if self.eat(TokenKind::Comma).is_none() {
                break;
            }
        }
        if bracketed {
            self.expect(TokenKind::RBracket, "`]`")?;
        }
        Ok(outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(mode: ParseMode, text: &str) -> Node {
        EtGrammar.parse(mode, text).unwrap()
    }

    #[test]
    fn test_parses_random_statement_with_shadow() {
        let Node::Statement(st) = parse(ParseMode::Statement, "x[a, b:a] = RANDOM(-1, 2.5, DOUBLE)")
        else {
            panic!("expected a statement");
        };
        assert_eq!(st.lhs.name, "x");
        assert_eq!(st.lhs.groups[1].shadow_of.as_deref(), Some("a"));
        assert_eq!(
            st.rhs,
            Rhs::Random {
                lo: -1.0,
                hi: 2.5,
                dtype: Dtype::Float64
            }
        );
    }

    #[test]
    fn test_expression_precedence() {
        let Node::Statement(st) =
            parse(ParseMode::Statement, "c[i,j] += a[i,k] * b[k,j] - 1 # trailing comment")
        else {
            panic!("expected a statement");
        };
        assert_eq!(st.op, AssignOp::Accumulate);
        assert_eq!(st.to_string(), "c[i,j] += ((a[i,k] * b[k,j]) - 1)");
    }

    #[test]
    fn test_parses_rank_zero_array() {
        let Node::Statement(st) = parse(ParseMode::Statement, "s[] = RANDOM(0, 1, FLOAT)") else {
            panic!("expected a statement");
        };
        assert!(st.lhs.groups.is_empty());
    }

    #[test]
    fn test_parses_call_with_keywords() {
        let Node::Call(call) = parse(
            ParseMode::Call,
            "math.reduce_sum(x, axis=RANK(a), keep=False, perm=[1, 0], scale=-0.5, d=DIMS(b))",
        ) else {
            panic!("expected a call");
        };
        assert_eq!(call.op_path, "math.reduce_sum");
        assert_eq!(call.args[0].value, CallValue::Array("x".to_owned()));
        assert_eq!(call.args[1].keyword.as_deref(), Some("axis"));
        assert_eq!(call.args[1].value, CallValue::Rank("a".to_owned()));
        assert_eq!(call.args[2].value, CallValue::Bool(false));
        assert_eq!(call.args[3].value, CallValue::Ints(vec![1, 0]));
        assert_eq!(call.args[4].value, CallValue::Float(-0.5));
        assert_eq!(call.args[5].value, CallValue::Dims("b".to_owned()));
    }

    #[test]
    fn test_parses_outputs_bare_and_bracketed() {
        let expected = Node::Outputs(vec![
            OutputRef {
                name: "y".to_owned(),
            },
            OutputRef {
                name: "z".to_owned(),
            },
        ]);
        assert_eq!(parse(ParseMode::Outputs, "y, z"), expected);
        assert_eq!(parse(ParseMode::Outputs, "[y, z]"), expected);
    }

    #[test]
    fn test_parses_constraint() {
        let Node::Constraint(con) = parse(ParseMode::Constraint, "RANK(a) + DIMS(b)[1] // 2 >= -3")
        else {
            panic!("expected a constraint");
        };
        assert_eq!(con.cmp, CmpOp::Ge);
        assert_eq!(con.rhs, IntExpr::Lit(-3));
        assert_eq!(con.to_string(), "(RANK(a) + (DIMS(b)[1] // 2)) >= -3");
    }

    #[test]
    fn test_parses_nelem_in_constraint_and_call() {
        let Node::Constraint(con) = parse(ParseMode::Constraint, "NELEM(a) * NELEM(b) <= 4096")
        else {
            panic!("expected a constraint");
        };
        assert_eq!(con.to_string(), "(NELEM(a) * NELEM(b)) <= 4096");
        let Node::Call(call) = parse(ParseMode::Call, "t.fill(x, n=NELEM(a))") else {
            panic!("expected a call");
        };
        assert_eq!(call.args[1].value, CallValue::Nelem("a".to_owned()));
    }

    #[test]
    fn test_malformed_inputs_are_rejected() {
        let g = EtGrammar;
        assert!(matches!(
            g.parse(ParseMode::Statement, "x[a] = RANDOM(0, 1, COMPLEX)"),
            Err(ParseError::UnknownDtype(d)) if d == "COMPLEX"
        ));
        assert!(matches!(
            g.parse(ParseMode::Statement, "x[a = y[a]"),
            Err(ParseError::Unexpected { .. })
        ));
        assert!(matches!(
            g.parse(ParseMode::Outputs, "y z"),
            Err(ParseError::Trailing { .. })
        ));
        assert!(matches!(
            g.parse(ParseMode::Call, "f(x) $"),
            Err(ParseError::Lex { .. })
        ));
        assert!(matches!(
            g.parse(ParseMode::Constraint, "RANK(a)"),
            Err(ParseError::Unexpected { .. })
        ));
    }
}
