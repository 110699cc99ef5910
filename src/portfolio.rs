// ===============================
// src/portfolio.rs (user portfolios + account matching)
// ===============================
use crate::domain::AccountId;
use crate::expr::{Expression, PositionView, Role, Schema};
use crate::report::{Named, PortfolioReport};
use crate::risk::RiskDef;
use crate::script::ScriptRunner;
use crate::section::{ConfigError, Section};

#[derive(Debug)]
pub struct Portfolio {
    pub name: String,
    /// Comma separated globs over account names, `~` excludes.
    pub acc_patterns: String,
    filter: Option<Expression>,
    risks: Vec<RiskDef>,
}

impl Portfolio {
    /// `fallback_name` is used when the section has no `name` (e.g. the file stem).
    pub fn from_section(sec: &Section, fallback_name: &str, scripts: &dyn ScriptRunner) -> Result<Self, ConfigError> {
        let name = sec.get("name").unwrap_or(fallback_name).to_string();
        let filter = match sec.get("filter") {
            Some(text) => Some(
                Expression::compile(text, Schema::default(), Role::Predicate, scripts).map_err(|e| {
                    ConfigError::Compile { path: name.clone(), key: "filter".into(), source: e }
                })?,
            ),
            None => None,
        };
        let risks = sec
            .sections
            .iter()
            .map(|r| RiskDef::from_section(r, &name, scripts))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            acc_patterns: sec.get("acc").unwrap_or("*").to_string(),
            name,
            filter,
            risks,
        })
    }

    pub fn risks(&self) -> &[RiskDef] { &self.risks }

    pub fn risk(&self, name: &str) -> Option<&RiskDef> {
        self.risks.iter().find(|r| r.name == name || r.display_name == name)
    }

    /// Accounts (id, display name) selected by the pattern list, in match order.
    pub fn match_accounts(&self, accounts: &[(AccountId, &str)]) -> Vec<AccountId> {
        match_accounts(&self.acc_patterns, accounts)
    }

    pub fn accepts(&self, p: &PositionView) -> bool {
        self.filter.as_ref().map_or(true, |f| f.test(p))
    }

    /// Run every risk definition; empty reports are left out.
    pub fn run(&mut self, positions: &[PositionView], scripts: &dyn ScriptRunner) -> PortfolioReport {
        let mut out = Named::default();
        for r in &mut self.risks {
            if let Some(rpt) = r.run(positions, scripts) {
                out.0.push((r.display_name.clone(), rpt));
            }
        }
        out
    }
}

pub fn match_accounts(patterns: &str, accounts: &[(AccountId, &str)]) -> Vec<AccountId> {
    let mut res: Vec<AccountId> = Vec::with_capacity(accounts.len());
    let mut list: Vec<&str> = patterns.split(',').map(str::trim).filter(|p| !p.is_empty()).collect();
    // diawali pengecualian -> mulai dari semua
    if list.first().is_some_and(|p| p.starts_with('~')) {
        list.insert(0, "*");
    }
    for p in list {
        let (exclude, glob) = match p.strip_prefix('~') {
            Some(rest) => (true, rest),
            None => (false, p),
        };
        for (acc, name) in accounts {
            if !glob_match(glob, name) {
                continue;
            }
            let at = res.iter().position(|a| a == acc);
            match (exclude, at) {
                (true, Some(i)) => {
                    res.remove(i);
                }
                (false, None) => res.push(*acc),
                _ => {}
            }
        }
    }
    res
}

const SEPARATOR: char = '/';

/// Shell-style match: `*`, `?`, `[a-z]`, `[^x]` / `[!x]`, `\` escape.
/// `*` and `?` never cross `/`. A malformed class never matches.
pub fn glob_match(pattern: &str, name: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let s: Vec<char> = name.chars().collect();
    let (mut pi, mut si) = (0, 0);
    // posisi `*` terakhir: (pattern setelah `*`, teks yang sudah ditelan)
    let mut star: Option<(usize, usize)> = None;
    while si < s.len() {
        if p.get(pi) == Some(&'*') {
            pi += 1;
            star = Some((pi, si));
            continue;
        }
        if let Some(rest) = p.get(pi..).filter(|r| !r.is_empty()).and_then(|r| step(r, s[si])) {
            pi = p.len() - rest.len();
            si += 1;
            continue;
        }
        match star {
            Some((after, taken)) if s[taken] != SEPARATOR => {
                star = Some((after, taken + 1));
                pi = after;
                si = taken + 1;
            }
            _ => return false,
        }
    }
    p[pi..].iter().all(|&c| c == '*')
}

/// Match one non-star token at the head of `p` against `ch`.
/// Returns the pattern left after the token.
fn step(p: &[char], ch: char) -> Option<&[char]> {
    let (&c, rest) = p.split_first()?;
    match c {
        '?' => (ch != SEPARATOR).then_some(rest),
        '[' => match class(rest, ch)? {
            (true, after) => Some(after),
            (false, _) => None,
        },
        '\\' => {
            let (&lit, after) = rest.split_first()?;
            (lit == ch).then_some(after)
        }
        _ => (c == ch).then_some(rest),
    }
}

/// Match `ch` against a class body (after `[`). Returns (matched, rest after `]`).
fn class(p: &[char], ch: char) -> Option<(bool, &[char])> {
    let (negate, mut i) = match p.first() {
        Some('^') | Some('!') => (true, 1),
        _ => (false, 0),
    };
    let mut hit = false;
    let mut first = true;
    loop {
        let c = *p.get(i)?;
        if c == ']' && !first {
            return Some((hit != negate, &p[i + 1..]));
        }
        first = false;
        let lo = if c == '\\' { i += 1; *p.get(i)? } else { c };
        i += 1;
        if p.get(i) == Some(&'-') && p.get(i + 1).is_some_and(|c| *c != ']') {
            let mut hi = p[i + 1];
            i += 2;
            if hi == '\\' {
                hi = *p.get(i)?;
                i += 1;
            }
            hit |= lo <= ch && ch <= hi;
        } else {
            hit |= lo == ch;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::domain::{Position, Security};
    use crate::report::RiskReport;
    use crate::script::NoScripts;

    #[test]
    fn negated_pattern_keeps_other_desks() {
        let accs = [(1, "Desk1"), (2, "Desk2")];
        assert_eq!(match_accounts("*,~Desk1", &accs), vec![2]);
        assert_eq!(match_accounts("~Desk1", &accs), vec![2]);
        assert_eq!(match_accounts("Desk2, Desk1", &accs), vec![2, 1]);
        assert_eq!(match_accounts("", &accs), Vec::<AccountId>::new());
        assert_eq!(match_accounts("Desk?,~*2,Desk2", &accs), vec![1, 2]);
    }

    #[test]
    fn glob_syntax() {
        assert!(glob_match("*", ""));
        assert!(glob_match("D*k?", "Desk1"));
        assert!(!glob_match("D*k?", "Desk"));
        assert!(glob_match("Desk[0-9]", "Desk7"));
        assert!(!glob_match("Desk[^0-9]", "Desk7"));
        assert!(glob_match("Desk[!0-9]", "DeskA"));
        assert!(glob_match(r"a\*b", "a*b"));
        assert!(!glob_match(r"a\*b", "axb"));
        assert!(!glob_match("Desk[0-9", "Desk1"));
        assert!(glob_match("[]]x", "]x"));
    }

    #[test]
    fn glob_stops_at_separator() {
        assert!(!glob_match("*", "a/b"));
        assert!(!glob_match("Desk*", "Desk/1"));
        assert!(glob_match("Desk/*", "Desk/1"));
        assert!(!glob_match("a?b", "a/b"));
        assert!(glob_match("*/*", "hk/Desk1"));
        assert!(glob_match("**x", "abx"));
    }

    #[test]
    fn glob_backtracking_stays_linear() {
        let name = "a".repeat(64);
        let pattern = format!("{}b", "a*".repeat(20));
        let t0 = std::time::Instant::now();
        assert!(!glob_match(&pattern, &name));
        assert!(glob_match(&format!("{}a", "a*".repeat(20)), &name));
        assert!(t0.elapsed() < std::time::Duration::from_secs(1));
    }

    fn view(acc: &str, symbol: &str, qty: f64) -> PositionView {
        let sec = Security { symbol: symbol.into(), sector: "Tech".into(), prev_close: 2.0, ..Default::default() };
        let mut p = Position::new(1, 1);
        p.cur.qty = qty;
        PositionView { acc_name: Arc::from(acc), security: Arc::new(sec), position: p }
    }

    #[test]
    fn loads_defaults_and_runs() {
        let sec = Section::new("")
            .with("filter", "Pos != 0")
            .child(Section::new("gross").with("name", "Gross").with("formula", "sum(abs(Pos * Close))"))
            .child(Section::new("none").with("group", "market").with("formula", "sum(Pos)"));
        let mut p = Portfolio::from_section(&sec, "main", &NoScripts).unwrap();
        assert_eq!(p.name, "main");
        assert_eq!(p.acc_patterns, "*");
        assert!(p.risk("gross").is_some());

        let positions: Vec<_> = [view("D", "A", 3.0), view("D", "B", 0.0)]
            .into_iter()
            .filter(|v| p.accepts(v))
            .collect();
        assert_eq!(positions.len(), 1);
        let rpt = p.run(&positions, &NoScripts);
        // "none": market kosong -> tidak ada grup -> tidak dilaporkan
        assert_eq!(rpt.len(), 1);
        assert_eq!(rpt.get("Gross"), Some(&RiskReport::Single(vec![("".into(), crate::report::ParamValue::Number(6.0))])));
    }

    #[test]
    fn bad_risk_fails_the_whole_portfolio() {
        let sec = Section::new("")
            .with("name", "x")
            .child(Section::new("ok").with("formula", "sum(Pos)"))
            .child(Section::new("bad").with("formula", "sum(Nope)"));
        let err = Portfolio::from_section(&sec, "fallback", &NoScripts).unwrap_err();
        assert!(err.to_string().starts_with("x/bad"), "{err}");
    }
}
