//! Expression engine for selections and weights over table fields.
//!
//! Supports arithmetic (+, -, *, /), comparisons (==, !=, <, <=, >, >=),
//! boolean operators (&&, ||, !), and built-in functions (abs, sqrt, log,
//! exp, pow, min, max). Booleans are `f64`: a value passes when it is > 0.
//!
//! The rest of hepcalc only sees the [`ExpressionEvaluator`] trait, so any
//! other engine can be plugged in.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use hc_core::{Error, Result};

use crate::table::Table;

/// Evaluates selection/weight expressions against tabular event data.
pub trait ExpressionEvaluator: Send + Sync {
    /// Fields referenced by `expression`. Fails on invalid syntax.
    fn fields(&self, expression: &str) -> Result<BTreeSet<String>>;

    /// Evaluate `expression` for every row of `table` (one value per row).
    fn evaluate(&self, expression: &str, table: &Table) -> Result<Vec<f64>>;
}

// ── AST ────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum Node {
    Number(f64),
    Field(usize),
    Neg(Box<Node>),
    Not(Box<Node>),
    Binary(BinOp, Box<Node>, Box<Node>),
    Call(Func, Vec<Node>),
}

#[derive(Debug, Clone, Copy)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

#[derive(Debug, Clone, Copy)]
enum Func {
    Abs,
    Sqrt,
    Log,
    Exp,
    Floor,
    Pow,
    Min,
    Max,
}

impl Func {
    fn lookup(name: &str) -> Option<(Func, usize)> {
        Some(match name {
            "abs" => (Func::Abs, 1),
            "sqrt" => (Func::Sqrt, 1),
            "log" => (Func::Log, 1),
            "exp" => (Func::Exp, 1),
            "floor" => (Func::Floor, 1),
            "pow" => (Func::Pow, 2),
            "min" => (Func::Min, 2),
            "max" => (Func::Max, 2),
            _ => return None,
        })
    }
}

fn truth(b: bool) -> f64 {
    if b { 1.0 } else { 0.0 }
}

impl BinOp {
    fn apply(self, a: f64, b: f64) -> f64 {
        match self {
            BinOp::Add => a + b,
            BinOp::Sub => a - b,
            BinOp::Mul => a * b,
            BinOp::Div => a / b,
            BinOp::Eq => truth((a - b).abs() < f64::EPSILON),
            BinOp::Ne => truth((a - b).abs() >= f64::EPSILON),
            BinOp::Lt => truth(a < b),
            BinOp::Le => truth(a <= b),
            BinOp::Gt => truth(a > b),
            BinOp::Ge => truth(a >= b),
            BinOp::And => truth(a > 0.0 && b > 0.0),
            BinOp::Or => truth(a > 0.0 || b > 0.0),
        }
    }
}

// ── Compiled expression ────────────────────────────────────────

/// A parsed expression ready for column-wise evaluation.
#[derive(Debug, Clone)]
pub struct CompiledExpr {
    root: Node,
    /// Field names referenced by the expression, in order of first use.
    pub fields: Vec<String>,
}

impl CompiledExpr {
    /// Parse an expression string.
    pub fn compile(input: &str) -> Result<Self> {
        let tokens = tokenize(input)?;
        let mut parser = Parser { tokens: &tokens, pos: 0, fields: Vec::new() };
        let root = parser.parse_or()?;
        if let Some(tok) = parser.tokens.get(parser.pos) {
            return Err(Error::Expression(format!(
                "unexpected {tok:?} after end of expression '{input}'"
            )));
        }
        Ok(CompiledExpr { root, fields: parser.fields })
    }

    /// Evaluate for every row of `table`.
    pub fn eval_table(&self, table: &Table) -> Result<Vec<f64>> {
        let columns: Vec<&[f64]> =
            self.fields.iter().map(|f| table.column(f)).collect::<Result<_>>()?;
        Ok(eval_columns(&self.root, &columns, table.n_rows()))
    }

    /// Evaluate a single row; `values` follows the order of [`CompiledExpr::fields`].
    pub fn eval_row(&self, values: &[f64]) -> Result<f64> {
        if values.len() != self.fields.len() {
            return Err(Error::Expression(format!(
                "expected {} values ({}), got {}",
                self.fields.len(),
                self.fields.join(", "),
                values.len()
            )));
        }
        let columns: Vec<&[f64]> = values.iter().map(std::slice::from_ref).collect();
        Ok(eval_columns(&self.root, &columns, 1)[0])
    }
}

fn eval_columns(node: &Node, cols: &[&[f64]], n: usize) -> Vec<f64> {
    match node {
        Node::Number(x) => vec![*x; n],
        Node::Field(i) => cols[*i].to_vec(),
        Node::Neg(a) => {
            let mut v = eval_columns(a, cols, n);
            v.iter_mut().for_each(|x| *x = -*x);
            v
        }
        Node::Not(a) => {
            let mut v = eval_columns(a, cols, n);
            v.iter_mut().for_each(|x| *x = truth(*x <= 0.0));
            v
        }
        Node::Binary(op, a, b) => {
            let mut lhs = eval_columns(a, cols, n);
            let rhs = eval_columns(b, cols, n);
            lhs.iter_mut().zip(&rhs).for_each(|(x, y)| *x = op.apply(*x, *y));
            lhs
        }
        Node::Call(f, args) => {
            let mut a0 = eval_columns(&args[0], cols, n);
            match f {
                Func::Abs => a0.iter_mut().for_each(|x| *x = x.abs()),
                Func::Sqrt => a0.iter_mut().for_each(|x| *x = x.sqrt()),
                Func::Log => a0.iter_mut().for_each(|x| *x = x.ln()),
                Func::Exp => a0.iter_mut().for_each(|x| *x = x.exp()),
                Func::Floor => a0.iter_mut().for_each(|x| *x = x.floor()),
                Func::Pow | Func::Min | Func::Max => {
                    let a1 = eval_columns(&args[1], cols, n);
                    let g: fn(f64, f64) -> f64 = match f {
                        Func::Pow => f64::powf,
                        Func::Min => f64::min,
                        _ => f64::max,
                    };
                    a0.iter_mut().zip(&a1).for_each(|(x, y)| *x = g(*x, *y));
                }
            }
            a0
        }
    }
}

// ── Tokenizer ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(f64),
    Ident(String),
    Op(&'static str),
    LParen,
    RParen,
    Comma,
}

const OPERATORS: [&str; 15] =
    ["&&", "||", "==", "!=", "<=", ">=", "+", "-", "*", "/", "<", ">", "!", "&", "|"];

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let bytes = input.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];
        if c.is_ascii_whitespace() {
            i += 1;
            continue;
        }
        match c {
            b'(' => tokens.push(Token::LParen),
            b')' => tokens.push(Token::RParen),
            b',' => tokens.push(Token::Comma),
            _ if c.is_ascii_digit() || c == b'.' => {
                let start = i;
                while i < bytes.len() {
                    let d = bytes[i];
                    let exp_sign =
                        (d == b'+' || d == b'-') && matches!(bytes[i - 1], b'e' | b'E');
                    if d.is_ascii_digit() || d == b'.' || d == b'e' || d == b'E' || exp_sign {
                        i += 1;
                    } else {
                        break;
                    }
                }
                let s = &input[start..i];
                let n = s
                    .parse()
                    .map_err(|_| Error::Expression(format!("invalid number: '{s}'")))?;
                tokens.push(Token::Num(n));
                continue;
            }
            _ if c.is_ascii_alphabetic() || c == b'_' => {
                let start = i;
                while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                    i += 1;
                }
                tokens.push(Token::Ident(input[start..i].to_string()));
                continue;
            }
            _ => {
                let op = OPERATORS
                    .iter()
                    .find(|op| bytes[i..].starts_with(op.as_bytes()))
                    .ok_or_else(|| {
                        Error::Expression(format!(
                            "unexpected character '{}' in '{input}'",
                            input[i..].chars().next().unwrap_or('?')
                        ))
                    })?;
                // Single '&' / '|' are accepted as their logical forms.
                let op = match *op {
                    "&" => "&&",
                    "|" => "||",
                    other => other,
                };
                i += if op.len() == 2 && bytes[i..].starts_with(op.as_bytes()) { 2 } else { 1 };
                tokens.push(Token::Op(op));
                continue;
            }
        }
        i += 1;
    }

    Ok(tokens)
}

// ── Parser (recursive descent) ─────────────────────────────────

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    fields: Vec<String>,
}

impl Parser<'_> {
    fn peek_op(&self) -> Option<&'static str> {
        match self.tokens.get(self.pos) {
            Some(Token::Op(op)) => Some(*op),
            _ => None,
        }
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        self.pos += usize::from(t.is_some());
        t
    }

    fn expect(&mut self, expected: Token) -> Result<()> {
        match self.next() {
            Some(t) if t == expected => Ok(()),
            other => Err(Error::Expression(format!("expected {expected:?}, got {other:?}"))),
        }
    }

    fn field(&mut self, name: String) -> usize {
        match self.fields.iter().position(|f| *f == name) {
            Some(i) => i,
            None => {
                self.fields.push(name);
                self.fields.len() - 1
            }
        }
    }

    /// Left-associative chain of binary operators at one precedence level.
    fn chain(
        &mut self,
        ops: &[(&str, BinOp)],
        next: fn(&mut Self) -> Result<Node>,
    ) -> Result<Node> {
        let mut lhs = next(self)?;
        while let Some(op) = self.peek_op().and_then(|t| ops.iter().find(|(s, _)| *s == t)) {
            let op = op.1;
            self.pos += 1;
            let rhs = next(self)?;
            lhs = Node::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_or(&mut self) -> Result<Node> {
        self.chain(&[("||", BinOp::Or)], Self::parse_and)
    }

    fn parse_and(&mut self) -> Result<Node> {
        self.chain(&[("&&", BinOp::And)], Self::parse_cmp)
    }

    fn parse_cmp(&mut self) -> Result<Node> {
        const CMP: [(&str, BinOp); 6] = [
            ("==", BinOp::Eq),
            ("!=", BinOp::Ne),
            ("<", BinOp::Lt),
            ("<=", BinOp::Le),
            (">", BinOp::Gt),
            (">=", BinOp::Ge),
        ];
        let lhs = self.parse_add()?;
        let Some(&(_, op)) = self.peek_op().and_then(|t| CMP.iter().find(|(s, _)| *s == t)) else {
            return Ok(lhs);
        };
        self.pos += 1;
        let rhs = self.parse_add()?;
        Ok(Node::Binary(op, Box::new(lhs), Box::new(rhs)))
    }

    fn parse_add(&mut self) -> Result<Node> {
        self.chain(&[("+", BinOp::Add), ("-", BinOp::Sub)], Self::parse_mul)
    }

    fn parse_mul(&mut self) -> Result<Node> {
        self.chain(&[("*", BinOp::Mul), ("/", BinOp::Div)], Self::parse_unary)
    }

    fn parse_unary(&mut self) -> Result<Node> {
        match self.peek_op() {
            Some("-") => {
                self.pos += 1;
                Ok(Node::Neg(Box::new(self.parse_unary()?)))
            }
            Some("!") => {
                self.pos += 1;
                Ok(Node::Not(Box::new(self.parse_unary()?)))
            }
            Some("+") => {
                self.pos += 1;
                self.parse_unary()
            }
            _ => self.parse_atom(),
        }
    }

    fn parse_atom(&mut self) -> Result<Node> {
        match self.next() {
            Some(Token::Num(n)) => Ok(Node::Number(n)),
            Some(Token::LParen) => {
                let e = self.parse_or()?;
                self.expect(Token::RParen)?;
                Ok(e)
            }
            Some(Token::Ident(name)) if matches!(self.tokens.get(self.pos), Some(Token::LParen)) => {
                self.pos += 1;
                let (func, arity) = Func::lookup(&name)
                    .ok_or_else(|| Error::Expression(format!("unknown function: '{name}'")))?;
                let mut args = vec![self.parse_or()?];
                while matches!(self.tokens.get(self.pos), Some(Token::Comma)) {
                    self.pos += 1;
                    args.push(self.parse_or()?);
                }
                self.expect(Token::RParen)?;
                if args.len() != arity {
                    return Err(Error::Expression(format!(
                        "{name}() takes {arity} argument(s), got {}",
                        args.len()
                    )));
                }
                Ok(Node::Call(func, args))
            }
            Some(Token::Ident(name)) => Ok(Node::Field(self.field(name))),
            other => Err(Error::Expression(format!(
                "expected number, field, or '(', got {other:?}"
            ))),
        }
    }
}

// ── Default evaluator ──────────────────────────────────────────

/// [`ExpressionEvaluator`] backed by [`CompiledExpr`], memoizing compilations.
#[derive(Debug, Default)]
pub struct CompiledEvaluator {
    compiled: Mutex<HashMap<String, Arc<CompiledExpr>>>,
}

impl CompiledEvaluator {
    /// Create an evaluator with an empty compilation cache.
    pub fn new() -> Self {
        Self::default()
    }

    fn compiled(&self, expression: &str) -> Result<Arc<CompiledExpr>> {
        let mut map = match self.compiled.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(e) = map.get(expression) {
            return Ok(Arc::clone(e));
        }
        let e = Arc::new(CompiledExpr::compile(expression)?);
        map.insert(expression.to_string(), Arc::clone(&e));
        Ok(e)
    }
}

impl ExpressionEvaluator for CompiledEvaluator {
    fn fields(&self, expression: &str) -> Result<BTreeSet<String>> {
        Ok(self.compiled(expression)?.fields.iter().cloned().collect())
    }

    fn evaluate(&self, expression: &str, table: &Table) -> Result<Vec<f64>> {
        self.compiled(expression)?.eval_table(table)
    }
}

// ── Tests ──────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arithmetic_precedence() {
        let e = CompiledExpr::compile("2 + 3 * 4").unwrap();
        assert!(e.fields.is_empty());
        assert!((e.eval_row(&[]).unwrap() - 14.0).abs() < 1e-10);
        let e = CompiledExpr::compile("10 - 4 - 3").unwrap();
        assert!((e.eval_row(&[]).unwrap() - 3.0).abs() < 1e-10);
    }

    #[test]
    fn fields_in_order_of_first_use() {
        let e = CompiledExpr::compile("pt * weight_mc + pt").unwrap();
        assert_eq!(e.fields, vec!["pt", "weight_mc"]);
        assert!((e.eval_row(&[100.0, 0.5]).unwrap() - 150.0).abs() < 1e-10);
    }

    #[test]
    fn comparison_and_boolean() {
        let e = CompiledExpr::compile("njet >= 4 && pt_lead > 25.0").unwrap();
        assert_eq!(e.eval_row(&[4.0, 30.0]).unwrap(), 1.0);
        assert_eq!(e.eval_row(&[3.0, 30.0]).unwrap(), 0.0);
        let e = CompiledExpr::compile("x > 5 || !(y < 2)").unwrap();
        assert_eq!(e.eval_row(&[6.0, 1.0]).unwrap(), 1.0);
        assert_eq!(e.eval_row(&[3.0, 1.0]).unwrap(), 0.0);
        assert_eq!(e.eval_row(&[3.0, 3.0]).unwrap(), 1.0);
    }

    #[test]
    fn single_ampersand_is_logical_and() {
        let e = CompiledExpr::compile("(a > 1) & (b > 1)").unwrap();
        assert_eq!(e.eval_row(&[2.0, 2.0]).unwrap(), 1.0);
        assert_eq!(e.eval_row(&[2.0, 0.0]).unwrap(), 0.0);
    }

    #[test]
    fn functions_and_arity() {
        let e = CompiledExpr::compile("pow(x, 2) + sqrt(abs(y))").unwrap();
        assert!((e.eval_row(&[3.0, -16.0]).unwrap() - 13.0).abs() < 1e-10);
        assert!(CompiledExpr::compile("pow(x)").is_err());
        assert!(CompiledExpr::compile("foo(x)").is_err());
    }

    #[test]
    fn row_length_must_match_fields() {
        let e = CompiledExpr::compile("pt * w").unwrap();
        assert!(matches!(e.eval_row(&[1.0]), Err(Error::Expression(_))));
        assert!(e.eval_row(&[1.0, 2.0, 3.0]).is_err());
        assert_eq!(e.eval_row(&[3.0, 2.0]).unwrap(), 6.0);
        let floor = CompiledExpr::compile("floor(x / 2)").unwrap();
        assert_eq!(floor.eval_row(&[-3.0]).unwrap(), -2.0);
    }

    #[test]
    fn syntax_errors() {
        assert!(CompiledExpr::compile("pt >").is_err());
        assert!(CompiledExpr::compile("(pt > 1").is_err());
        assert!(CompiledExpr::compile("pt > 1)").is_err());
        assert!(CompiledExpr::compile("pt $ 1").is_err());
    }

    #[test]
    fn scientific_notation() {
        let e = CompiledExpr::compile("1.5e2 + 3.0E-1").unwrap();
        assert!((e.eval_row(&[]).unwrap() - 150.3).abs() < 1e-10);
    }

    #[test]
    fn constant_expression_fills_every_row() {
        let t = Table::with_rows(3);
        let ev = CompiledEvaluator::new();
        assert_eq!(ev.evaluate("0.5", &t).unwrap(), vec![0.5; 3]);
    }

    #[test]
    fn evaluator_reports_undefined_fields() {
        let t = Table::from_columns([("pt", vec![10.0, 30.0])]).unwrap();
        let ev = CompiledEvaluator::new();
        assert_eq!(ev.evaluate("pt > 20", &t).unwrap(), vec![0.0, 1.0]);
        assert!(matches!(ev.evaluate("eta < 2.5", &t), Err(Error::Expression(_))));
        assert_eq!(
            ev.fields("pt > 20 && eta < 2.5").unwrap(),
            BTreeSet::from(["eta".to_string(), "pt".to_string()])
        );
    }
}
