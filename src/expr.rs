// ===============================
// src/expr.rs (compiled risk expressions)
// ===============================
use std::cmp::Ordering;
use std::sync::Arc;

use thiserror::Error;

use crate::domain::{Position, Security};
use crate::formula::{self, EvalError, Node, ParseError, Scope, Symbol, Value, ValueKind};
use crate::script::{ScriptError, ScriptRunner};

/// Built-in context fields, drawn from the Security and the Position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    Symbol, LocalSymbol, Bbgid, Cusip, Sedol, Isin,
    Sector, Industry, IndustryGroup, SubIndustry, Market, Type, Currency,
    Multiplier, Rate, Adv20, MarketCap, PrevClose,
    Open, High, Low, Close, Qty, Vol, Vwap, Ask, Bid, AskSize, BidSize,
    OutstandBuyQty, OutstandSellQty, Acc, AccName,
    Pos, AvgPx, RealizedPnl, BuyQty, SellQty, BuyValue, SellValue, Pos0,
    NaN,
}

impl Field {
    pub const ALL: [Field; 42] = [
        Field::Symbol, Field::LocalSymbol, Field::Bbgid, Field::Cusip, Field::Sedol, Field::Isin,
        Field::Sector, Field::Industry, Field::IndustryGroup, Field::SubIndustry, Field::Market,
        Field::Type, Field::Currency, Field::Multiplier, Field::Rate, Field::Adv20,
        Field::MarketCap, Field::PrevClose, Field::Open, Field::High, Field::Low, Field::Close,
        Field::Qty, Field::Vol, Field::Vwap, Field::Ask, Field::Bid, Field::AskSize,
        Field::BidSize, Field::OutstandBuyQty, Field::OutstandSellQty, Field::Acc,
        Field::AccName, Field::Pos, Field::AvgPx, Field::RealizedPnl, Field::BuyQty,
        Field::SellQty, Field::BuyValue, Field::SellValue, Field::Pos0, Field::NaN,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Field::Symbol => "Symbol",
            Field::LocalSymbol => "LocalSymbol",
            Field::Bbgid => "Bbgid",
            Field::Cusip => "Cusip",
            Field::Sedol => "Sedol",
            Field::Isin => "Isin",
            Field::Sector => "Sector",
            Field::Industry => "Industry",
            Field::IndustryGroup => "IndustryGroup",
            Field::SubIndustry => "SubIndustry",
            Field::Market => "Market",
            Field::Type => "Type",
            Field::Currency => "Currency",
            Field::Multiplier => "Multiplier",
            Field::Rate => "Rate",
            Field::Adv20 => "Adv20",
            Field::MarketCap => "MarketCap",
            Field::PrevClose => "PrevClose",
            Field::Open => "Open",
            Field::High => "High",
            Field::Low => "Low",
            Field::Close => "Close",
            Field::Qty => "Qty",
            Field::Vol => "Vol",
            Field::Vwap => "Vwap",
            Field::Ask => "Ask",
            Field::Bid => "Bid",
            Field::AskSize => "AskSize",
            Field::BidSize => "BidSize",
            Field::OutstandBuyQty => "OutstandBuyQty",
            Field::OutstandSellQty => "OutstandSellQty",
            Field::Acc => "Acc",
            Field::AccName => "AccName",
            Field::Pos => "Pos",
            Field::AvgPx => "AvgPx",
            Field::RealizedPnl => "RealizedPnl",
            Field::BuyQty => "BuyQty",
            Field::SellQty => "SellQty",
            Field::BuyValue => "BuyValue",
            Field::SellValue => "SellValue",
            Field::Pos0 => "Pos0",
            Field::NaN => "NaN",
        }
    }

    pub fn from_name(name: &str) -> Option<Field> {
        Field::ALL.iter().copied().find(|f| f.name() == name)
    }
}

/// One position as seen by an evaluation cycle: a consistent copy.
#[derive(Debug, Clone)]
pub struct PositionView {
    pub acc_name: Arc<str>,
    pub security: Arc<Security>,
    pub position: Position,
}

impl PositionView {
    /// All-zero context used to validate expressions at compile time.
    pub fn zeroed() -> Self {
        Self { acc_name: Arc::from(""), security: Arc::new(Security::default()), position: Position::default() }
    }

    pub fn symbol(&self) -> &str { &self.security.symbol }

    pub fn field(&self, f: Field) -> Value {
        let s = &*self.security;
        let p = &self.position;
        let text = |v: &str| Value::Str(v.to_string());
        let num = Value::Number;
        match f {
            Field::Symbol => text(&s.symbol),
            Field::LocalSymbol => text(&s.local_symbol),
            Field::Bbgid => text(&s.bbgid),
            Field::Cusip => text(&s.cusip),
            Field::Sedol => text(&s.sedol),
            Field::Isin => text(&s.isin),
            Field::Sector => text(&s.sector),
            Field::Industry => text(&s.industry),
            Field::IndustryGroup => text(&s.industry_group),
            Field::SubIndustry => text(&s.sub_industry),
            Field::Market => text(&s.market),
            Field::Type => text(&s.sec_type),
            Field::Currency => text(&s.currency),
            Field::Multiplier => num(s.multiplier),
            Field::Rate => num(s.rate),
            Field::Adv20 => num(s.adv20),
            Field::MarketCap => num(s.market_cap),
            Field::PrevClose => num(s.prev_close),
            Field::Open => num(s.md.open),
            Field::High => num(s.md.high),
            Field::Low => num(s.md.low),
            Field::Close => num(s.close()),
            Field::Qty => num(s.md.qty),
            Field::Vol => num(s.md.vol),
            Field::Vwap => num(s.md.vwap),
            Field::Ask => num(s.md.ask),
            Field::Bid => num(s.md.bid),
            Field::AskSize => num(s.md.ask_size),
            Field::BidSize => num(s.md.bid_size),
            Field::OutstandBuyQty => num(p.outstand_buy_qty),
            Field::OutstandSellQty => num(p.outstand_sell_qty),
            Field::Acc => num(p.acc as f64),
            Field::AccName => text(&self.acc_name),
            Field::Pos => num(p.cur.qty),
            Field::AvgPx => num(p.cur.avg_px),
            Field::RealizedPnl => num(p.cur.realized_pnl),
            Field::BuyQty => num(p.buy_qty),
            Field::SellQty => num(p.sell_qty),
            Field::BuyValue => num(p.buy_value),
            Field::SellValue => num(p.sell_value),
            Field::Pos0 => num(p.bod.qty),
            Field::NaN => num(f64::NAN),
        }
    }
}

struct Ctx<'a> {
    view: &'a PositionView,
    vars: &'a [Option<Value>],
}

impl Scope for Ctx<'_> {
    fn get(&self, sym: Symbol) -> Result<Value, EvalError> {
        match sym {
            Symbol::Field(f) => Ok(self.view.field(f)),
            // slot kosong = variabel gagal dievaluasi untuk posisi ini
            Symbol::Var(i) => self.vars.get(i).cloned().flatten().ok_or(EvalError::Unavailable(i)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallTarget {
    pub module: String,
    pub function: String,
    pub args: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggKind { Sum, Len, Mean, Std }

#[derive(Debug, Clone)]
pub enum Form {
    /// Plain per-position expression.
    Instant(Node),
    Agg(AggKind, Node),
    /// `top(E, n)`: n > 0 largest first, n < 0 smallest first.
    Top(Node, i64),
    Call(CallTarget),
}

/// Where an expression is used; decides what it must produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Parameter formula: aggregates allowed, values must be numbers.
    Formula,
    /// Helper variable: aggregates allowed, instant values of any kind.
    Variable,
    /// Filter or grouping tag: a plain bool expression.
    Predicate,
}

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("invalid expression '{expr}': {source}")]
    Parse { expr: String, source: ParseError },
    #[error("invalid expression '{expr}': {source}")]
    DryRun { expr: String, source: EvalError },
    #[error("invalid expression '{expr}': must return {expected}, got {found}")]
    Kind { expr: String, expected: ValueKind, found: ValueKind },
    #[error("invalid expression '{0}': aggregate not allowed here")]
    AggregateNotAllowed(String),
    #[error("invalid top expression '{0}': missing valid second parameter")]
    TopArgument(String),
    #[error("invalid call expression '{expr}': {msg}")]
    CallArgs { expr: String, msg: &'static str },
    #[error("invalid call expression '{expr}': {source}")]
    Script { expr: String, source: ScriptError },
}

/// Names visible to an expression besides the built-in fields.
#[derive(Debug, Clone, Copy, Default)]
pub struct Schema<'a> {
    pub variables: &'a [String],
    /// Dry-run value of each variable, same order as `variables`.
    pub samples: &'a [Value],
}

#[derive(Debug, Clone)]
pub struct Expression {
    source: String,
    form: Form,
    sample: Value,
}

const PREFIXES: [&str; 6] = ["sum", "len", "mean", "std", "top", "call"];

/// `Some((name, inner))` when the whole text is one aggregate wrapper.
fn split_aggregate(src: &str) -> Option<(&'static str, &str)> {
    for name in PREFIXES {
        if src.starts_with(name) && src[name.len()..].starts_with('(') {
            let open = name.len();
            if formula::matching_paren(src, open) == Some(src.len() - 1) {
                return Some((name, &src[open + 1..src.len() - 1]));
            }
        }
    }
    None
}

impl Expression {
    pub fn compile(
        source: &str,
        schema: Schema<'_>,
        role: Role,
        scripts: &dyn ScriptRunner,
    ) -> Result<Self, CompileError> {
        let src = source.trim();
        let expr = || src.to_string();
        let resolve = |name: &str| {
            Field::from_name(name)
                .map(Symbol::Field)
                .or_else(|| schema.variables.iter().position(|v| v == name).map(Symbol::Var))
        };
        let parse = |text: &str| formula::parse(text, &resolve).map_err(|e| CompileError::Parse { expr: expr(), source: e });

        let form = match split_aggregate(src) {
            Some(_) if role == Role::Predicate => return Err(CompileError::AggregateNotAllowed(expr())),
            Some(("call", inner)) => Form::Call(Self::compile_call(src, inner, scripts)?),
            Some(("top", inner)) => {
                let args = formula::split_args(inner);
                let [e, n] = args[..] else {
                    return Err(CompileError::TopArgument(expr()));
                };
                let n = n.parse::<i64>().map_err(|_| CompileError::TopArgument(expr()))?;
                Form::Top(parse(e)?, n)
            }
            Some((name, inner)) => {
                let kind = match name {
                    "sum" => AggKind::Sum,
                    "len" => AggKind::Len,
                    "mean" => AggKind::Mean,
                    _ => AggKind::Std,
                };
                Form::Agg(kind, parse(inner)?)
            }
            None => Form::Instant(parse(src)?),
        };

        let mut compiled = Expression { source: src.to_string(), form, sample: Value::Number(0.0) };
        compiled.sample = compiled.dry_run(schema, role)?;
        Ok(compiled)
    }

    fn compile_call(src: &str, inner: &str, scripts: &dyn ScriptRunner) -> Result<CallTarget, CompileError> {
        let bad = |msg| CompileError::CallArgs { expr: src.to_string(), msg };
        let args = formula::split_args(inner);
        if args.len() < 2 || args.len() > 3 {
            return Err(bad("module name and function name required"));
        }
        let mut lits = Vec::with_capacity(3);
        for a in &args {
            lits.push(formula::string_literal(a).ok_or_else(|| bad("arguments must be string literals"))?);
        }
        if lits[0].is_empty() || lits[1].is_empty() {
            return Err(bad("module name and function name required"));
        }
        let target = CallTarget {
            module: lits[0].clone(),
            function: lits[1].clone(),
            args: lits.get(2).cloned().unwrap_or_default(),
        };
        // dry call tanpa posisi
        scripts
            .call(&target, &[])
            .map_err(|e| CompileError::Script { expr: src.to_string(), source: e })?;
        Ok(target)
    }

    /// Evaluate once against a zero-valued context and check the result kind.
    /// Variables take their own dry-run value.
    fn dry_run(&self, schema: Schema<'_>, role: Role) -> Result<Value, CompileError> {
        let vars: Vec<Option<Value>> = (0..schema.variables.len())
            .map(|i| Some(schema.samples.get(i).cloned().unwrap_or(Value::Number(0.0))))
            .collect();
        let view = PositionView::zeroed();
        let (node, aggregate) = match &self.form {
            Form::Call(_) => return Ok(Value::Number(0.0)),
            Form::Instant(n) => (n, false),
            Form::Agg(_, n) | Form::Top(n, _) => (n, true),
        };
        let v = node
            .eval(&Ctx { view: &view, vars: &vars })
            .map_err(|e| CompileError::DryRun { expr: self.source.clone(), source: e })?;
        let expected = match role {
            Role::Predicate => Some(ValueKind::Bool),
            Role::Formula => Some(ValueKind::Number),
            Role::Variable if aggregate => Some(ValueKind::Number),
            Role::Variable => None,
        };
        match expected {
            Some(k) if k != v.kind() => Err(CompileError::Kind { expr: self.source.clone(), expected: k, found: v.kind() }),
            // agregat selalu angka
            _ if aggregate => Ok(Value::Number(0.0)),
            _ => Ok(v),
        }
    }

    pub fn source(&self) -> &str { &self.source }

    pub fn sample(&self) -> &Value { &self.sample }

    pub fn form(&self) -> &Form { &self.form }

    pub fn is_aggregate(&self) -> bool { !matches!(self.form, Form::Instant(_)) }

    /// Plain formulas report the `n` highest positions.
    pub fn or_top(self, n: i64) -> Self {
        match self.form {
            Form::Instant(node) => Expression { source: self.source, form: Form::Top(node, n), sample: Value::Number(0.0) },
            _ => self,
        }
    }

    /// Per-position value of the expression (the inner expression for aggregates).
    pub fn eval(&self, view: &PositionView, vars: &[Option<Value>]) -> Result<Value, EvalError> {
        match &self.form {
            Form::Instant(n) | Form::Agg(_, n) | Form::Top(n, _) => n.eval(&Ctx { view, vars }),
            Form::Call(_) => Err(EvalError::ExternalCall),
        }
    }

    /// `true` only for a bool `true`; anything else (including errors) filters out.
    pub fn test(&self, view: &PositionView) -> bool {
        matches!(self.eval(view, &[]), Ok(Value::Bool(true)))
    }
}

// ---------- reducers ----------

pub fn reduce(kind: AggKind, xs: &[f64]) -> f64 {
    match kind {
        AggKind::Len => xs.len() as f64,
        AggKind::Sum => xs.iter().sum(),
        AggKind::Mean => mean(xs),
        AggKind::Std => {
            // population std: bagi N
            if xs.is_empty() {
                return f64::NAN;
            }
            let m = mean(xs);
            (xs.iter().map(|x| (x - m).powi(2)).sum::<f64>() / xs.len() as f64).sqrt()
        }
    }
}

fn mean(xs: &[f64]) -> f64 {
    if xs.is_empty() {
        return f64::NAN;
    }
    xs.iter().sum::<f64>() / xs.len() as f64
}

/// Rank (label, value) pairs; NaN entries never count. Ties ordered by label.
pub fn top_n(mut entries: Vec<(String, f64)>, n: i64) -> Vec<(String, f64)> {
    entries.retain(|(_, v)| !v.is_nan());
    let by_value = |a: &(String, f64), b: &(String, f64)| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal);
    if n > 0 {
        entries.sort_by(|a, b| by_value(b, a).then_with(|| a.0.cmp(&b.0)));
    } else {
        entries.sort_by(|a, b| by_value(a, b).then_with(|| a.0.cmp(&b.0)));
    }
    entries.truncate(n.unsigned_abs() as usize);
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::{NoScripts, ScriptOutput};
    use crate::script::FieldMap;

    fn view(sym: &str, pos: f64, close: f64) -> PositionView {
        let mut sec = Security { symbol: sym.into(), prev_close: close, sector: "Tech".into(), ..Default::default() };
        sec.multiplier = 1.0;
        let mut p = Position::new(1, 1);
        p.cur.qty = pos;
        PositionView { acc_name: Arc::from("Desk1"), security: Arc::new(sec), position: p }
    }

    fn compile(src: &str, role: Role) -> Result<Expression, CompileError> {
        Expression::compile(src, Schema::default(), role, &NoScripts)
    }

    #[test]
    fn instant_expression_reads_fields() {
        let e = compile("Pos * Close * Multiplier", Role::Formula).unwrap();
        assert!(!e.is_aggregate());
        assert_eq!(e.eval(&view("A", 10.0, 2.5), &[]).unwrap(), Value::Number(25.0));
        let p = compile("Sector == 'Tech' && AccName == 'Desk1'", Role::Predicate).unwrap();
        assert!(p.test(&view("A", 1.0, 1.0)));
    }

    #[test]
    fn aggregate_prefixes() {
        assert!(matches!(compile("sum(Pos)", Role::Formula).unwrap().form(), Form::Agg(AggKind::Sum, _)));
        assert!(matches!(compile(" std(Pos * Close) ", Role::Formula).unwrap().form(), Form::Agg(AggKind::Std, _)));
        assert!(matches!(compile("top(abs(Pos), -3)", Role::Formula).unwrap().form(), Form::Top(_, -3)));
        // bukan satu wrapper utuh -> sum() tidak dikenal sebagai fungsi
        assert!(matches!(compile("sum(Pos) + sum(Pos0)", Role::Formula), Err(CompileError::Parse { .. })));
    }

    #[test]
    fn top_requires_integer_literal() {
        assert!(matches!(compile("top(Pos)", Role::Formula), Err(CompileError::TopArgument(_))));
        assert!(matches!(compile("top(Pos, x)", Role::Formula), Err(CompileError::TopArgument(_))));
        assert!(matches!(compile("top(Pos, 2.5)", Role::Formula), Err(CompileError::TopArgument(_))));
    }

    #[test]
    fn kind_checks_at_compile_time() {
        assert!(matches!(compile("Pos > 0", Role::Formula), Err(CompileError::Kind { .. })));
        assert!(matches!(compile("Pos + 1", Role::Predicate), Err(CompileError::Kind { .. })));
        assert!(matches!(compile("sum(Pos) ", Role::Predicate), Err(CompileError::AggregateNotAllowed(_))));
        assert!(matches!(compile("Symbol * 2", Role::Variable), Err(CompileError::DryRun { .. })));
        assert!(compile("Symbol", Role::Variable).is_ok());
        assert!(matches!(compile("Foo + 1", Role::Formula), Err(CompileError::Parse { .. })));
    }

    #[test]
    fn variables_resolve_after_fields() {
        let vars = vec!["lim".to_string()];
        let samples = vec![Value::Number(0.0)];
        let schema = Schema { variables: &vars, samples: &samples };
        let e = Expression::compile("Pos / lim", schema, Role::Formula, &NoScripts).unwrap();
        let v = e.eval(&view("A", 10.0, 1.0), &[Some(Value::Number(4.0))]).unwrap();
        assert_eq!(v, Value::Number(2.5));
        assert_eq!(e.eval(&view("A", 10.0, 1.0), &[None]), Err(EvalError::Unavailable(0)));
    }

    #[test]
    fn string_variables_keep_their_kind_in_the_dry_run() {
        let vars = vec!["sym".to_string()];
        let sym = Expression::compile("Symbol", Schema::default(), Role::Variable, &NoScripts).unwrap();
        assert_eq!(sym.sample(), &Value::Str(String::new()));

        let samples = vec![sym.sample().clone()];
        let schema = Schema { variables: &vars, samples: &samples };
        let e = Expression::compile("sum(strlen(sym))", schema, Role::Formula, &NoScripts).unwrap();
        let v = e.eval(&view("ABCD", 1.0, 1.0), &[Some(Value::Str("ABCD".into()))]).unwrap();
        assert_eq!(v, Value::Number(4.0));

        // seed angka nol (perilaku lama) menolak ekspresi yang sama
        let zeros = vec![Value::Number(0.0)];
        let schema = Schema { variables: &vars, samples: &zeros };
        assert!(matches!(
            Expression::compile("sum(strlen(sym))", schema, Role::Formula, &NoScripts),
            Err(CompileError::DryRun { .. })
        ));
    }

    struct Fixed;
    impl ScriptRunner for Fixed {
        fn call(&self, target: &CallTarget, _positions: &[FieldMap]) -> Result<ScriptOutput, ScriptError> {
            if target.module == "risk" { Ok(ScriptOutput::Number(1.0)) } else { Err(ScriptError::Failed("no module".into())) }
        }
    }

    #[test]
    fn call_is_validated_with_a_dry_invocation() {
        let e = Expression::compile("call('risk', 'var95', '0.95')", Schema::default(), Role::Formula, &Fixed).unwrap();
        match e.form() {
            Form::Call(t) => assert_eq!((t.module.as_str(), t.function.as_str(), t.args.as_str()), ("risk", "var95", "0.95")),
            other => panic!("unexpected {other:?}"),
        }
        let err = Expression::compile("call('nope', 'f')", Schema::default(), Role::Formula, &Fixed);
        assert!(matches!(err, Err(CompileError::Script { .. })));
        let err = Expression::compile("call('risk')", Schema::default(), Role::Formula, &Fixed);
        assert!(matches!(err, Err(CompileError::CallArgs { .. })));
        let err = Expression::compile("call(risk, 'f')", Schema::default(), Role::Formula, &Fixed);
        assert!(matches!(err, Err(CompileError::CallArgs { .. })));
    }

    #[test]
    fn reducers() {
        let xs = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        assert_eq!(reduce(AggKind::Sum, &xs), 40.0);
        assert_eq!(reduce(AggKind::Len, &xs), 8.0);
        assert_eq!(reduce(AggKind::Mean, &xs), 5.0);
        assert_eq!(reduce(AggKind::Std, &xs), 2.0);
        assert!(reduce(AggKind::Mean, &[]).is_nan());
        assert!(reduce(AggKind::Std, &[]).is_nan());
        assert_eq!(reduce(AggKind::Sum, &[]), 0.0);
    }

    #[test]
    fn top_ranks_and_skips_nan() {
        let entries = vec![
            ("A".to_string(), 3.0),
            ("B".to_string(), f64::NAN),
            ("C".to_string(), 5.0),
            ("D".to_string(), 3.0),
            ("E".to_string(), -1.0),
        ];
        let best = top_n(entries.clone(), 2);
        assert_eq!(best, vec![("C".to_string(), 5.0), ("A".to_string(), 3.0)]);
        let worst = top_n(entries.clone(), -3);
        assert_eq!(worst, vec![("E".to_string(), -1.0), ("A".to_string(), 3.0), ("D".to_string(), 3.0)]);
        assert_eq!(top_n(entries, 10).len(), 4);
    }

    #[test]
    fn field_names_round_trip() {
        for f in Field::ALL {
            assert_eq!(Field::from_name(f.name()), Some(f));
        }
        assert!(view("A", 0.0, 0.0).field(Field::NaN).as_number().unwrap().is_nan());
    }
}
