// ===============================
// src/formula.rs (tokenizer, parser & interpreter for risk formulas)
// ===============================
//
// Bahasa formula kecil:
//   literal   : 12.5  1e3  'teks'  "teks"  true  false
//   operator  : ?:  ||  &&  == !=  < <= > >=  + -  * / %  **  unary - !
//   fungsi    : min max pow sqrt round ceil floor exp exp2 abs log log2 log10
//               isNaN isInf strlen
//   identifier: field Security/Position (lihat expr::Field) atau variabel user.
//
// Semua angka f64. `+` dengan string = concat.
//
use std::fmt;

use thiserror::Error;

use crate::expr::Field;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Number(f64),
    Bool(bool),
    Str(String),
    Pairs(Vec<(String, f64)>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind { Number, Bool, Str, Pairs }

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ValueKind::Number => "number",
            ValueKind::Bool => "bool",
            ValueKind::Str => "string",
            ValueKind::Pairs => "pair list",
        })
    }
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Number(_) => ValueKind::Number,
            Value::Bool(_) => ValueKind::Bool,
            Value::Str(_) => ValueKind::Str,
            Value::Pairs(_) => ValueKind::Pairs,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self { Value::Number(v) => Some(*v), _ => None }
    }
}

/// What an identifier resolves to at compile time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Symbol {
    Field(Field),
    Var(usize),
}

/// Runtime lookup of resolved symbols.
pub trait Scope {
    fn get(&self, sym: Symbol) -> Result<Value, EvalError>;
}

#[derive(Debug, Error, PartialEq)]
pub enum ParseError {
    #[error("{msg} at offset {pos}")]
    Syntax { pos: usize, msg: String },
    #[error("unknown identifier '{0}'")]
    UnknownIdent(String),
    #[error("unknown function '{0}'")]
    UnknownFunction(String),
    #[error("function {name} takes {expected} argument(s), got {got}")]
    Arity { name: &'static str, expected: usize, got: usize },
}

#[derive(Debug, Error, PartialEq)]
pub enum EvalError {
    #[error("cannot apply '{op}' to {lhs} and {rhs}")]
    Binary { op: &'static str, lhs: ValueKind, rhs: ValueKind },
    #[error("cannot apply '{op}' to {kind}")]
    Unary { op: &'static str, kind: ValueKind },
    #[error("condition must be bool, got {0}")]
    Condition(ValueKind),
    #[error("{func}() does not accept {kind}")]
    Argument { func: &'static str, kind: ValueKind },
    #[error("external call has no per-position value")]
    ExternalCall,
    #[error("variable #{0} has no value")]
    Unavailable(usize),
}

// ---------------- AST ----------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp { Or, And, Eq, Ne, Lt, Le, Gt, Ge, Add, Sub, Mul, Div, Mod, Pow }

impl BinOp {
    fn symbol(self) -> &'static str {
        match self {
            BinOp::Or => "||",
            BinOp::And => "&&",
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Mod => "%",
            BinOp::Pow => "**",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    Min, Max, Pow, Sqrt, Round, Ceil, Floor, Exp, Exp2, Abs, Log, Log2, Log10, IsNaN, IsInf, StrLen,
}

impl Builtin {
    fn lookup(name: &str) -> Option<Self> {
        Some(match name {
            "min" => Builtin::Min,
            "max" => Builtin::Max,
            "pow" => Builtin::Pow,
            "sqrt" => Builtin::Sqrt,
            "round" => Builtin::Round,
            "ceil" => Builtin::Ceil,
            "floor" => Builtin::Floor,
            "exp" => Builtin::Exp,
            "exp2" => Builtin::Exp2,
            "abs" => Builtin::Abs,
            "log" => Builtin::Log,
            "log2" => Builtin::Log2,
            "log10" => Builtin::Log10,
            "isNaN" => Builtin::IsNaN,
            "isInf" => Builtin::IsInf,
            "strlen" => Builtin::StrLen,
            _ => return None,
        })
    }

    fn name(self) -> &'static str {
        match self {
            Builtin::Min => "min",
            Builtin::Max => "max",
            Builtin::Pow => "pow",
            Builtin::Sqrt => "sqrt",
            Builtin::Round => "round",
            Builtin::Ceil => "ceil",
            Builtin::Floor => "floor",
            Builtin::Exp => "exp",
            Builtin::Exp2 => "exp2",
            Builtin::Abs => "abs",
            Builtin::Log => "log",
            Builtin::Log2 => "log2",
            Builtin::Log10 => "log10",
            Builtin::IsNaN => "isNaN",
            Builtin::IsInf => "isInf",
            Builtin::StrLen => "strlen",
        }
    }

    fn arity(self) -> usize {
        match self {
            Builtin::Min | Builtin::Max | Builtin::Pow => 2,
            _ => 1,
        }
    }

    fn apply(self, args: &[Value]) -> Result<Value, EvalError> {
        if self == Builtin::StrLen {
            return match &args[0] {
                Value::Str(s) => Ok(Value::Number(s.len() as f64)),
                other => Err(EvalError::Argument { func: self.name(), kind: other.kind() }),
            };
        }
        let mut nums = [0.0_f64; 2];
        for (slot, a) in nums.iter_mut().zip(args) {
            *slot = a.as_number().ok_or(EvalError::Argument { func: self.name(), kind: a.kind() })?;
        }
        let [a, b] = nums;
        let v = match self {
            // NaN menular, seperti min/max di sisi upstream
            Builtin::Min => if a.is_nan() || b.is_nan() { f64::NAN } else { a.min(b) },
            Builtin::Max => if a.is_nan() || b.is_nan() { f64::NAN } else { a.max(b) },
            Builtin::Pow => a.powf(b),
            Builtin::Sqrt => a.sqrt(),
            Builtin::Round => a.round(),
            Builtin::Ceil => a.ceil(),
            Builtin::Floor => a.floor(),
            Builtin::Exp => a.exp(),
            Builtin::Exp2 => a.exp2(),
            Builtin::Abs => a.abs(),
            Builtin::Log => a.ln(),
            Builtin::Log2 => a.log2(),
            Builtin::Log10 => a.log10(),
            Builtin::IsNaN => return Ok(Value::Bool(a.is_nan())),
            Builtin::IsInf => return Ok(Value::Bool(a.is_infinite())),
            Builtin::StrLen => unreachable!("handled above"),
        };
        Ok(Value::Number(v))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Lit(Value),
    Sym(Symbol),
    Neg(Box<Node>),
    Not(Box<Node>),
    Binary(BinOp, Box<Node>, Box<Node>),
    Cond(Box<Node>, Box<Node>, Box<Node>),
    Call(Builtin, Vec<Node>),
}

impl Node {
    pub fn eval(&self, scope: &dyn Scope) -> Result<Value, EvalError> {
        match self {
            Node::Lit(v) => Ok(v.clone()),
            Node::Sym(s) => scope.get(*s),
            Node::Neg(n) => match n.eval(scope)? {
                Value::Number(v) => Ok(Value::Number(-v)),
                other => Err(EvalError::Unary { op: "-", kind: other.kind() }),
            },
            Node::Not(n) => match n.eval(scope)? {
                Value::Bool(b) => Ok(Value::Bool(!b)),
                other => Err(EvalError::Unary { op: "!", kind: other.kind() }),
            },
            Node::Cond(c, a, b) => match c.eval(scope)? {
                Value::Bool(true) => a.eval(scope),
                Value::Bool(false) => b.eval(scope),
                other => Err(EvalError::Condition(other.kind())),
            },
            Node::Call(f, args) => {
                let vals = args.iter().map(|a| a.eval(scope)).collect::<Result<Vec<_>, _>>()?;
                f.apply(&vals)
            }
            Node::Binary(op @ (BinOp::And | BinOp::Or), l, r) => {
                let lv = l.eval(scope)?;
                let Value::Bool(lb) = lv else {
                    return Err(EvalError::Binary { op: op.symbol(), lhs: lv.kind(), rhs: ValueKind::Bool });
                };
                // short-circuit
                if (*op == BinOp::And && !lb) || (*op == BinOp::Or && lb) {
                    return Ok(Value::Bool(lb));
                }
                match r.eval(scope)? {
                    Value::Bool(rb) => Ok(Value::Bool(rb)),
                    other => Err(EvalError::Binary { op: op.symbol(), lhs: ValueKind::Bool, rhs: other.kind() }),
                }
            }
            Node::Binary(op, l, r) => binary(*op, l.eval(scope)?, r.eval(scope)?),
        }
    }
}

fn binary(op: BinOp, l: Value, r: Value) -> Result<Value, EvalError> {
    use Value::{Bool, Number, Str};
    let v = match (op, &l, &r) {
        (BinOp::Eq, _, _) => Bool(l == r),
        (BinOp::Ne, _, _) => Bool(l != r),
        (BinOp::Add, Number(a), Number(b)) => Number(a + b),
        (BinOp::Add, Str(a), Str(b)) => Str(format!("{a}{b}")),
        (BinOp::Add, Str(a), Number(b)) => Str(format!("{a}{b}")),
        (BinOp::Add, Number(a), Str(b)) => Str(format!("{a}{b}")),
        (BinOp::Sub, Number(a), Number(b)) => Number(a - b),
        (BinOp::Mul, Number(a), Number(b)) => Number(a * b),
        (BinOp::Div, Number(a), Number(b)) => Number(a / b),
        (BinOp::Mod, Number(a), Number(b)) => Number(a % b),
        (BinOp::Pow, Number(a), Number(b)) => Number(a.powf(*b)),
        (BinOp::Lt, Number(a), Number(b)) => Bool(a < b),
        (BinOp::Le, Number(a), Number(b)) => Bool(a <= b),
        (BinOp::Gt, Number(a), Number(b)) => Bool(a > b),
        (BinOp::Ge, Number(a), Number(b)) => Bool(a >= b),
        (BinOp::Lt, Str(a), Str(b)) => Bool(a < b),
        (BinOp::Le, Str(a), Str(b)) => Bool(a <= b),
        (BinOp::Gt, Str(a), Str(b)) => Bool(a > b),
        (BinOp::Ge, Str(a), Str(b)) => Bool(a >= b),
        _ => return Err(EvalError::Binary { op: op.symbol(), lhs: l.kind(), rhs: r.kind() }),
    };
    Ok(v)
}

// ---------------- tokenizer ----------------

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Num(f64),
    Str(String),
    Ident(String),
    Op(&'static str),
    End,
}

const OPS2: [&str; 7] = ["**", "==", "!=", "<=", ">=", "&&", "||"];
const OPS1: [&str; 14] = ["+", "-", "*", "/", "%", "<", ">", "!", "?", ":", "(", ")", ",", "="];

fn tokenize(src: &str) -> Result<Vec<(usize, Tok)>, ParseError> {
    let bytes = src.as_bytes();
    let mut out = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i] as char;
        if c.is_ascii_whitespace() {
            i += 1;
            continue;
        }
        let start = i;
        if c.is_ascii_digit() || (c == '.' && bytes.get(i + 1).is_some_and(|b| b.is_ascii_digit())) {
            while i < bytes.len() && (bytes[i].is_ascii_digit() || bytes[i] == b'.') {
                i += 1;
            }
            if i < bytes.len() && (bytes[i] == b'e' || bytes[i] == b'E') {
                let mut j = i + 1;
                if j < bytes.len() && (bytes[j] == b'+' || bytes[j] == b'-') {
                    j += 1;
                }
                if j < bytes.len() && bytes[j].is_ascii_digit() {
                    i = j;
                    while i < bytes.len() && bytes[i].is_ascii_digit() {
                        i += 1;
                    }
                }
            }
            let text = &src[start..i];
            let v = text.parse::<f64>().map_err(|_| ParseError::Syntax {
                pos: start,
                msg: format!("bad number '{text}'"),
            })?;
            out.push((start, Tok::Num(v)));
        } else if c == '\'' || c == '"' {
            let mut s = String::new();
            let mut chars = src[i + 1..].char_indices();
            let mut closed = None;
            while let Some((k, ch)) = chars.next() {
                match ch {
                    _ if ch == c => {
                        closed = Some(i + 1 + k + 1);
                        break;
                    }
                    '\\' => {
                        if let Some((_, esc)) = chars.next() {
                            s.push(match esc {
                                'n' => '\n',
                                't' => '\t',
                                other => other,
                            });
                        }
                    }
                    _ => s.push(ch),
                }
            }
            i = closed.ok_or(ParseError::Syntax { pos: start, msg: "unterminated string".into() })?;
            out.push((start, Tok::Str(s)));
        } else if c.is_ascii_alphabetic() || c == '_' {
            while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                i += 1;
            }
            out.push((start, Tok::Ident(src[start..i].to_string())));
        } else if let Some(op) = OPS2.iter().find(|op| src[i..].starts_with(**op)) {
            i += 2;
            out.push((start, Tok::Op(*op)));
        } else if let Some(op) = OPS1.iter().find(|op| src[i..].starts_with(**op)) {
            i += 1;
            out.push((start, Tok::Op(*op)));
        } else {
            return Err(ParseError::Syntax { pos: start, msg: format!("unexpected character '{c}'") });
        }
    }
    out.push((src.len(), Tok::End));
    Ok(out)
}

// ---------------- parser ----------------

struct Parser<'a> {
    toks: Vec<(usize, Tok)>,
    at: usize,
    resolve: &'a dyn Fn(&str) -> Option<Symbol>,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> &Tok { &self.toks[self.at].1 }

    fn pos(&self) -> usize { self.toks[self.at].0 }

    fn bump(&mut self) -> Tok {
        let t = self.toks[self.at].1.clone();
        if self.at + 1 < self.toks.len() {
            self.at += 1;
        }
        t
    }

    fn eat(&mut self, op: &str) -> bool {
        if matches!(self.peek(), Tok::Op(o) if *o == op) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, op: &str) -> Result<(), ParseError> {
        if self.eat(op) {
            Ok(())
        } else {
            Err(self.unexpected(&format!("expected '{op}'")))
        }
    }

    fn unexpected(&self, what: &str) -> ParseError {
        syntax_error(self.pos(), what, self.peek())
    }

    fn ternary(&mut self) -> Result<Node, ParseError> {
        let cond = self.binary_level(0)?;
        if self.eat("?") {
            let a = self.ternary()?;
            self.expect(":")?;
            let b = self.ternary()?;
            return Ok(Node::Cond(Box::new(cond), Box::new(a), Box::new(b)));
        }
        Ok(cond)
    }

    /// Left-associative binary levels, loosest first.
    fn binary_level(&mut self, level: usize) -> Result<Node, ParseError> {
        const LEVELS: [&[(&str, BinOp)]; 6] = [
            &[("||", BinOp::Or)],
            &[("&&", BinOp::And)],
            &[("==", BinOp::Eq), ("!=", BinOp::Ne)],
            &[("<=", BinOp::Le), (">=", BinOp::Ge), ("<", BinOp::Lt), (">", BinOp::Gt)],
            &[("+", BinOp::Add), ("-", BinOp::Sub)],
            &[("*", BinOp::Mul), ("/", BinOp::Div), ("%", BinOp::Mod)],
        ];
        if level == LEVELS.len() {
            return self.unary();
        }
        let mut lhs = self.binary_level(level + 1)?;
        'outer: loop {
            for (sym, op) in LEVELS[level] {
                if self.eat(sym) {
                    let rhs = self.binary_level(level + 1)?;
                    lhs = Node::Binary(*op, Box::new(lhs), Box::new(rhs));
                    continue 'outer;
                }
            }
            return Ok(lhs);
        }
    }

    fn unary(&mut self) -> Result<Node, ParseError> {
        if self.eat("-") {
            return Ok(Node::Neg(Box::new(self.unary()?)));
        }
        if self.eat("!") {
            return Ok(Node::Not(Box::new(self.unary()?)));
        }
        let base = self.primary()?;
        if self.eat("**") {
            // right-assoc
            let exp = self.unary()?;
            return Ok(Node::Binary(BinOp::Pow, Box::new(base), Box::new(exp)));
        }
        Ok(base)
    }

    fn primary(&mut self) -> Result<Node, ParseError> {
        let pos = self.pos();
        match self.bump() {
            Tok::Num(v) => Ok(Node::Lit(Value::Number(v))),
            Tok::Str(s) => Ok(Node::Lit(Value::Str(s))),
            Tok::Op("(") => {
                let inner = self.ternary()?;
                self.expect(")")?;
                Ok(inner)
            }
            Tok::Ident(name) if name == "true" => Ok(Node::Lit(Value::Bool(true))),
            Tok::Ident(name) if name == "false" => Ok(Node::Lit(Value::Bool(false))),
            Tok::Ident(name) => {
                if self.eat("(") {
                    let f = Builtin::lookup(&name).ok_or(ParseError::UnknownFunction(name))?;
                    let mut args = Vec::new();
                    if !self.eat(")") {
                        loop {
                            args.push(self.ternary()?);
                            if self.eat(")") {
                                break;
                            }
                            self.expect(",")?;
                        }
                    }
                    if args.len() != f.arity() {
                        return Err(ParseError::Arity { name: f.name(), expected: f.arity(), got: args.len() });
                    }
                    return Ok(Node::Call(f, args));
                }
                (self.resolve)(&name).map(Node::Sym).ok_or(ParseError::UnknownIdent(name))
            }
            other => Err(syntax_error(pos, "expected a value", &other)),
        }
    }
}

fn syntax_error(pos: usize, what: &str, found: &Tok) -> ParseError {
    let found = match found {
        Tok::End => "end of input".to_string(),
        Tok::Num(v) => format!("number {v}"),
        Tok::Str(s) => format!("string '{s}'"),
        Tok::Ident(s) => format!("'{s}'"),
        Tok::Op(o) => format!("'{o}'"),
    };
    ParseError::Syntax { pos, msg: format!("{what}, found {found}") }
}

/// Parse a whole formula. Identifiers go through `resolve`.
pub fn parse(src: &str, resolve: &dyn Fn(&str) -> Option<Symbol>) -> Result<Node, ParseError> {
    let toks = tokenize(src)?;
    let mut p = Parser { toks, at: 0, resolve };
    let node = p.ternary()?;
    if *p.peek() != Tok::End {
        return Err(p.unexpected("expected end of formula"));
    }
    Ok(node)
}

/// `Some(s)` if `src` is exactly one string literal.
pub fn string_literal(src: &str) -> Option<String> {
    match tokenize(src).ok()?.as_slice() {
        [(_, Tok::Str(s)), (_, Tok::End)] => Some(s.clone()),
        _ => None,
    }
}

/// Split on commas at paren depth 0, outside string literals.
pub fn split_args(src: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut depth = 0_i32;
    let mut quote: Option<char> = None;
    let mut escaped = false;
    let mut start = 0;
    for (i, c) in src.char_indices() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '\'' | '"' => quote = Some(c),
            '(' => depth += 1,
            ')' => depth -= 1,
            ',' if depth == 0 => {
                out.push(src[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    out.push(src[start..].trim());
    out
}

/// Byte offset of the paren closing the one at `open`, skipping string literals.
pub fn matching_paren(src: &str, open: usize) -> Option<usize> {
    let mut depth = 0_i32;
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for (i, c) in src[open..].char_indices() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '\'' | '"' => quote = Some(c),
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(open + i);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Vars(Vec<Value>);
    impl Scope for Vars {
        fn get(&self, sym: Symbol) -> Result<Value, EvalError> {
            match sym {
                Symbol::Var(i) => Ok(self.0[i].clone()),
                Symbol::Field(_) => Ok(Value::Number(0.0)),
            }
        }
    }

    fn resolve(name: &str) -> Option<Symbol> {
        match name {
            "x" => Some(Symbol::Var(0)),
            "s" => Some(Symbol::Var(1)),
            _ => None,
        }
    }

    fn run(src: &str) -> Result<Value, EvalError> {
        let node = parse(src, &resolve).unwrap();
        node.eval(&Vars(vec![Value::Number(4.0), Value::Str("abc".into())]))
    }

    #[test]
    fn arithmetic_precedence() {
        assert_eq!(run("1 + 2 * 3").unwrap(), Value::Number(7.0));
        assert_eq!(run("(1 + 2) * 3").unwrap(), Value::Number(9.0));
        assert_eq!(run("2 ** 3 ** 2").unwrap(), Value::Number(512.0));
        assert_eq!(run("-x ** 2").unwrap(), Value::Number(-16.0));
        assert_eq!(run("10 - 4 - 3").unwrap(), Value::Number(3.0));
        assert_eq!(run("7 % 4 + 1e1").unwrap(), Value::Number(13.0));
    }

    #[test]
    fn logic_comparison_and_ternary() {
        assert_eq!(run("x > 3 && x <= 4").unwrap(), Value::Bool(true));
        assert_eq!(run("x > 5 || !(x == 4)").unwrap(), Value::Bool(false));
        assert_eq!(run("x > 3 ? 'big' : 'small'").unwrap(), Value::Str("big".into()));
        assert_eq!(run("s == 'abc' && s < 'abd'").unwrap(), Value::Bool(true));
        // short-circuit: sisi kanan tidak dievaluasi
        assert_eq!(run("false && (1 + 's' > 0)").unwrap(), Value::Bool(false));
    }

    #[test]
    fn builtins() {
        assert_eq!(run("max(x, 9) + min(1, 2)").unwrap(), Value::Number(10.0));
        assert_eq!(run("sqrt(x) + abs(-2) + round(2.5)").unwrap(), Value::Number(7.0));
        assert_eq!(run("strlen(s)").unwrap(), Value::Number(3.0));
        assert_eq!(run("isNaN(0 / 0)").unwrap(), Value::Bool(true));
        assert_eq!(run("isInf(1 / 0)").unwrap(), Value::Bool(true));
        assert_eq!(run("log10(1) + log2(8) + floor(1.9) + ceil(0.1)").unwrap(), Value::Number(5.0));
        assert!(run("min(0/0, 1)").unwrap().as_number().unwrap().is_nan());
    }

    #[test]
    fn string_concat() {
        assert_eq!(run("s + '-' + x").unwrap(), Value::Str("abc-4".into()));
    }

    #[test]
    fn type_errors_surface_at_eval() {
        assert!(matches!(run("s * 2"), Err(EvalError::Binary { op: "*", .. })));
        assert!(matches!(run("x ? 1 : 2"), Err(EvalError::Condition(ValueKind::Number))));
        assert!(matches!(run("strlen(x)"), Err(EvalError::Argument { func: "strlen", .. })));
        assert!(matches!(run("-s"), Err(EvalError::Unary { op: "-", .. })));
    }

    #[test]
    fn parse_errors() {
        assert_eq!(parse("y + 1", &resolve), Err(ParseError::UnknownIdent("y".into())));
        assert_eq!(parse("foo(1)", &resolve), Err(ParseError::UnknownFunction("foo".into())));
        assert!(matches!(parse("pow(1)", &resolve), Err(ParseError::Arity { name: "pow", expected: 2, got: 1 })));
        assert!(matches!(parse("1 +", &resolve), Err(ParseError::Syntax { .. })));
        assert!(matches!(parse("(1", &resolve), Err(ParseError::Syntax { .. })));
        assert!(matches!(parse("1 2", &resolve), Err(ParseError::Syntax { .. })));
        assert!(matches!(parse("'abc", &resolve), Err(ParseError::Syntax { .. })));
        assert!(matches!(parse("x # 1", &resolve), Err(ParseError::Syntax { .. })));
    }

    #[test]
    fn helpers_respect_nesting_and_quotes() {
        assert_eq!(split_args("max(a, b), 'x,y', -3"), vec!["max(a, b)", "'x,y'", "-3"]);
        assert_eq!(matching_paren("sum(a + (b)) + 1", 3), Some(11));
        assert_eq!(matching_paren("f(')')", 1), Some(5));
        assert_eq!(string_literal(" 'mod' "), Some("mod".into()));
        assert_eq!(string_literal("mod"), None);
    }
}
