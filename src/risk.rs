// ===============================
// src/risk.rs (risk definitions + aggregation engine)
// ===============================
use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::expr::{self, Expression, Form, PositionView, Role, Schema};
use crate::formula::Value;
use crate::history::History;
use crate::metrics::SCRIPT_CALLS;
use crate::report::{GroupValues, ParamValue, RiskReport};
use crate::script::{self, FieldMap, ScriptRunner};
use crate::section::{ConfigError, Section};

/// Unqualified formulas report this many top positions.
pub const DEFAULT_TOP: i64 = 10;

/// Predefined categorical grouping dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupField { Sector, Industry, SubIndustry, Market, Type, Currency, Acc }

impl GroupField {
    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "sector" => GroupField::Sector,
            "industry" => GroupField::Industry,
            "subindustry" => GroupField::SubIndustry,
            "market" => GroupField::Market,
            "type" => GroupField::Type,
            "currency" => GroupField::Currency,
            "acc" => GroupField::Acc,
            _ => return None,
        })
    }

    fn tag<'a>(&self, p: &'a PositionView) -> &'a str {
        let s = &*p.security;
        match self {
            GroupField::Sector => &s.sector,
            GroupField::Industry => &s.industry,
            GroupField::SubIndustry => &s.sub_industry,
            GroupField::Market => &s.market,
            GroupField::Type => &s.sec_type,
            GroupField::Currency => &s.currency,
            GroupField::Acc => &p.acc_name,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Grouping {
    Field(GroupField),
    /// Bool tagging expression; positions where it holds get `label`.
    Tag { label: String, expr: Expression },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Window {
    pub seconds: i64,
    pub kind: String,
}

#[derive(Debug, Clone)]
struct Variable {
    name: String,
    expr: Expression,
}

#[derive(Debug)]
pub struct RiskParamDef {
    pub name: String,
    formula: Expression,
    pub upper_bound: f64,
    pub lower_bound: f64,
    pub window: Window,
    variables: Vec<Variable>,
    history: Option<History>,
}

#[derive(Debug)]
pub struct RiskDef {
    pub name: String,
    pub display_name: String,
    groups: Vec<Grouping>,
    filter: Option<Expression>,
    params: Vec<RiskParamDef>,
}

fn split_list(s: Option<&str>) -> Vec<&str> {
    s.unwrap_or("").split(',').map(str::trim).filter(|p| !p.is_empty()).collect()
}

fn parse_bound(sec: &Section, path: &str, key: &'static str) -> Result<f64, ConfigError> {
    match sec.get(key) {
        None => Ok(f64::NAN),
        Some(v) => v
            .parse::<f64>()
            .map_err(|_| ConfigError::Invalid { path: path.to_string(), key, value: v.to_string() }),
    }
}

fn is_yes(v: Option<&str>) -> bool {
    matches!(v.map(str::to_ascii_lowercase).as_deref(), Some("true" | "y" | "yes" | "1"))
}

impl RiskParamDef {
    fn from_section(
        sec: &Section,
        name: &str,
        path: &str,
        scripts: &dyn ScriptRunner,
    ) -> Result<Self, ConfigError> {
        let compile_err = |key: &str, e| ConfigError::Compile { path: path.to_string(), key: key.to_string(), source: e };

        let mut names: Vec<String> = Vec::new();
        let mut samples = Vec::new();
        let mut variables = Vec::new();
        if let Some(vars) = sec.section("var") {
            for (vname, text) in &vars.values {
                // variabel hanya lihat variabel sebelumnya
                let schema = Schema { variables: &names, samples: &samples };
                let e = Expression::compile(text, schema, Role::Variable, scripts)
                    .map_err(|e| compile_err(&format!("var.{vname}"), e))?;
                samples.push(e.sample().clone());
                variables.push(Variable { name: vname.clone(), expr: e });
                names.push(vname.clone());
            }
        }

        let text = sec
            .get("formula")
            .ok_or_else(|| ConfigError::Missing { path: path.to_string(), key: "formula" })?;
        let formula = Expression::compile(text, Schema { variables: &names, samples: &samples }, Role::Formula, scripts)
            .map_err(|e| compile_err("formula", e))?;

        let w = split_list(sec.get("window"));
        let window = Window {
            seconds: w.first().and_then(|s| s.parse().ok()).unwrap_or(0),
            kind: w.get(1).map(|s| s.to_string()).unwrap_or_default(),
        };

        let mut history = None;
        if is_yes(sec.get("graph")) {
            if formula.is_aggregate() {
                history = Some(History::new());
            } else {
                warn!(%path, "graph only allowed for aggregate formula, ignored");
            }
        }

        Ok(Self {
            name: name.to_string(),
            formula: formula.or_top(DEFAULT_TOP),
            upper_bound: parse_bound(sec, path, "upper_bound")?,
            lower_bound: parse_bound(sec, path, "lower_bound")?,
            window,
            variables,
            history,
        })
    }

    pub fn history(&self) -> Option<&History> { self.history.as_ref() }

    pub fn formula(&self) -> &Expression { &self.formula }

    /// Evaluate for one non-empty group; graphed scalars go into history.
    pub fn run(&mut self, group: &str, positions: &[&PositionView], scripts: &dyn ScriptRunner) -> Option<ParamValue> {
        let mut vars: Vec<Option<Value>> = vec![None; self.variables.len()];
        for i in 0..self.variables.len() {
            let e = &self.variables[i].expr;
            if e.is_aggregate() {
                let v = evaluate(e, &self.variables, positions, &mut vars, scripts).unwrap_or_else(|| {
                    debug!(param = %self.name, var = %self.variables[i].name, "aggregate variable unavailable");
                    Value::Number(f64::NAN)
                });
                vars[i] = Some(v);
            }
        }
        let out = match evaluate(&self.formula, &self.variables, positions, &mut vars, scripts)? {
            Value::Number(v) => ParamValue::Number(v),
            Value::Pairs(p) => ParamValue::Pairs(p),
            other => {
                debug!(param = %self.name, kind = %other.kind(), "non-numeric parameter result dropped");
                return None;
            }
        };
        if let (Some(h), ParamValue::Number(v)) = (self.history.as_mut(), &out) {
            h.record(group, *v);
        }
        Some(out)
    }
}

/// Refresh instant variables for one position, then evaluate `e` on it.
/// A variable that fails only breaks the expressions that read it.
fn eval_position(
    e: &Expression,
    variables: &[Variable],
    p: &PositionView,
    vars: &mut [Option<Value>],
) -> Result<Value, crate::formula::EvalError> {
    for (i, v) in variables.iter().enumerate() {
        if !v.expr.is_aggregate() {
            vars[i] = match v.expr.eval(p, vars) {
                Ok(x) => Some(x),
                Err(err) => {
                    debug!(var = %v.name, symbol = p.symbol(), error = %err, "variable unavailable for position");
                    None
                }
            };
        }
    }
    e.eval(p, vars)
}

/// Run an aggregate-form expression over a group.
fn evaluate(
    e: &Expression,
    variables: &[Variable],
    positions: &[&PositionView],
    vars: &mut [Option<Value>],
    scripts: &dyn ScriptRunner,
) -> Option<Value> {
    if let Form::Call(target) = e.form() {
        let maps: Vec<FieldMap> = positions.iter().map(|p| script::flatten(p)).collect();
        return match scripts.call(target, &maps) {
            Ok(out) => {
                SCRIPT_CALLS.with_label_values(&["ok"]).inc();
                Some(out.into())
            }
            Err(err) => {
                SCRIPT_CALLS.with_label_values(&["error"]).inc();
                warn!(module = %target.module, function = %target.function, error = %err, "script call failed");
                None
            }
        };
    }

    // posisi yang gagal dievaluasi dibuang
    let mut values: Vec<(&PositionView, f64)> = Vec::with_capacity(positions.len());
    for &p in positions {
        match eval_position(e, variables, p, vars) {
            Ok(Value::Number(x)) => values.push((p, x)),
            Ok(other) => debug!(expr = e.source(), symbol = p.symbol(), kind = %other.kind(), "non-numeric value dropped"),
            Err(err) => debug!(expr = e.source(), symbol = p.symbol(), error = %err, "evaluation dropped"),
        }
    }

    match e.form() {
        Form::Agg(kind, _) => {
            let xs: Vec<f64> = values.iter().map(|(_, x)| *x).collect();
            Some(Value::Number(expr::reduce(*kind, &xs)))
        }
        Form::Top(_, n) => {
            let entries = values.iter().map(|(p, x)| (p.symbol().to_string(), *x)).collect();
            Some(Value::Pairs(expr::top_n(entries, *n)))
        }
        Form::Instant(_) | Form::Call(_) => None,
    }
}

impl RiskDef {
    pub fn from_section(sec: &Section, parent: &str, scripts: &dyn ScriptRunner) -> Result<Self, ConfigError> {
        let path = format!("{parent}/{}", sec.name);
        let compile_err = |key: &str, e| ConfigError::Compile { path: path.clone(), key: key.to_string(), source: e };

        let labels = split_list(sec.get("group_name"));
        let mut groups = Vec::new();
        for (i, g) in split_list(sec.get("group")).into_iter().enumerate() {
            if let Some(f) = GroupField::parse(g) {
                groups.push(Grouping::Field(f));
                continue;
            }
            let text = if g == "*" { "true" } else { g };
            let expr = Expression::compile(text, Schema::default(), Role::Predicate, scripts)
                .map_err(|e| compile_err("group", e))?;
            let label = labels.get(i).copied().unwrap_or(text).to_string();
            groups.push(Grouping::Tag { label, expr });
        }

        let filter = match sec.get("f") {
            Some(text) => Some(
                Expression::compile(text, Schema::default(), Role::Predicate, scripts)
                    .map_err(|e| compile_err("f", e))?,
            ),
            None => None,
        };

        let mut params = Vec::new();
        if sec.get("formula").is_some() {
            params.push(RiskParamDef::from_section(sec, &sec.name, &path, scripts)?);
        }
        for child in sec.sections.iter().filter(|s| s.name != "var") {
            let child_path = format!("{path}/{}", child.name);
            params.push(RiskParamDef::from_section(child, &child.name, &child_path, scripts)?);
        }
        if params.is_empty() {
            return Err(ConfigError::NoParams { path });
        }

        Ok(Self {
            name: sec.name.clone(),
            display_name: sec.get("name").unwrap_or(&sec.name).to_string(),
            groups,
            filter,
            params,
        })
    }

    pub fn params(&self) -> &[RiskParamDef] { &self.params }

    pub fn param(&self, name: &str) -> Option<&RiskParamDef> {
        self.params.iter().find(|p| p.name == name)
    }

    /// Partition into named groups. Each dimension makes its own group set.
    fn partition<'a>(&self, positions: &'a [PositionView]) -> BTreeMap<String, Vec<&'a PositionView>> {
        let mut grouped: BTreeMap<String, Vec<&PositionView>> = BTreeMap::new();
        let kept = positions.iter().filter(|p| self.filter.as_ref().map_or(true, |f| f.test(p)));
        if self.groups.is_empty() {
            grouped.insert(String::new(), kept.collect());
            return grouped;
        }
        let kept: Vec<&PositionView> = kept.collect();
        for g in &self.groups {
            for p in &kept {
                let tag = match g {
                    Grouping::Field(f) => f.tag(p),
                    Grouping::Tag { label, expr } if expr.test(p) => label.as_str(),
                    Grouping::Tag { .. } => "",
                };
                if !tag.is_empty() {
                    grouped.entry(tag.to_string()).or_default().push(*p);
                }
            }
        }
        grouped
    }

    pub fn run(&mut self, positions: &[PositionView], scripts: &dyn ScriptRunner) -> Option<RiskReport> {
        let grouped = self.partition(positions);
        let mut per_param: Vec<(String, GroupValues)> = Vec::with_capacity(self.params.len());
        for rp in &mut self.params {
            let mut out = GroupValues::new();
            for (gname, group) in &grouped {
                if group.is_empty() {
                    continue;
                }
                if let Some(v) = rp.run(gname, group, scripts) {
                    out.push((gname.clone(), v));
                }
            }
            if !out.is_empty() {
                per_param.push((rp.name.clone(), out));
            }
        }
        if per_param.is_empty() {
            return None;
        }
        if self.params.len() == 1 {
            return per_param.pop().map(|(_, groups)| RiskReport::Single(groups));
        }
        Some(RiskReport::Multi(per_param))
    }
}
