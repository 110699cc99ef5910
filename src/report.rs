// ===============================
// src/report.rs (report values + JSON encoding)
// ===============================
use serde::ser::{SerializeMap, SerializeSeq, SerializeTuple};
use serde::{Serialize, Serializer};

use crate::domain::UserId;

/// Result of one parameter for one group.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Number(f64),
    /// `top` / external call output: `(label, value)` pairs.
    Pairs(Vec<(String, f64)>),
}

/// JSON has no NaN; emit it as the string "NaN".
fn number<S: Serializer>(v: f64, s: S) -> Result<S::Ok, S::Error> {
    if v.is_nan() {
        s.serialize_str("NaN")
    } else {
        s.serialize_f64(v)
    }
}

struct Num(f64);

impl Serialize for Num {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> { number(self.0, s) }
}

struct Pair<'a, T>(&'a str, &'a T);

impl<T: Serialize> Serialize for Pair<'_, T> {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        let mut t = s.serialize_tuple(2)?;
        t.serialize_element(self.0)?;
        t.serialize_element(self.1)?;
        t.end()
    }
}

impl Serialize for ParamValue {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        match self {
            ParamValue::Number(v) => number(*v, s),
            ParamValue::Pairs(pairs) => {
                let mut seq = s.serialize_seq(Some(pairs.len()))?;
                for (k, v) in pairs {
                    seq.serialize_element(&Pair(k, &Num(*v)))?;
                }
                seq.end()
            }
        }
    }
}

/// `[[group, value], ...]`, groups sorted by name.
pub type GroupValues = Vec<(String, ParamValue)>;

fn pairs_seq<S: Serializer, T: Serialize>(items: &[(String, T)], s: S) -> Result<S::Ok, S::Error> {
    let mut seq = s.serialize_seq(Some(items.len()))?;
    for (k, v) in items {
        seq.serialize_element(&Pair(k, v))?;
    }
    seq.end()
}

/// Report of one risk definition.
#[derive(Debug, Clone, PartialEq)]
pub enum RiskReport {
    /// Exactly one parameter: the raw group list.
    Single(GroupValues),
    /// Parameter name -> group list, in declaration order.
    Multi(Vec<(String, GroupValues)>),
}

impl Serialize for RiskReport {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        match self {
            RiskReport::Single(groups) => pairs_seq(groups, s),
            RiskReport::Multi(params) => {
                let mut m = s.serialize_map(Some(params.len()))?;
                for (name, groups) in params {
                    m.serialize_entry(name, &GroupList(groups))?;
                }
                m.end()
            }
        }
    }
}

struct GroupList<'a>(&'a [(String, ParamValue)]);

impl Serialize for GroupList<'_> {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> { pairs_seq(self.0, s) }
}

/// Ordered name -> value mapping, serialised as a JSON object.
#[derive(Debug, Clone, PartialEq)]
pub struct Named<T>(pub Vec<(String, T)>);

impl<T> Default for Named<T> {
    fn default() -> Self { Named(Vec::new()) }
}

impl<T> Named<T> {
    pub fn get(&self, name: &str) -> Option<&T> {
        self.0.iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }

    pub fn is_empty(&self) -> bool { self.0.is_empty() }

    pub fn len(&self) -> usize { self.0.len() }
}

impl<T: Serialize> Serialize for Named<T> {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        let mut m = s.serialize_map(Some(self.0.len()))?;
        for (k, v) in &self.0 {
            m.serialize_entry(k, v)?;
        }
        m.end()
    }
}

/// Risk display name -> report.
pub type PortfolioReport = Named<RiskReport>;

/// Portfolio name -> report, for one user and one tick.
#[derive(Debug, Clone, Serialize)]
pub struct UserReport {
    pub user_id: UserId,
    pub ts: i64,
    pub portfolios: Named<PortfolioReport>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn nan_becomes_string_sentinel() {
        let v = serde_json::to_value(ParamValue::Number(f64::NAN)).unwrap();
        assert_eq!(v, json!("NaN"));
        let v = serde_json::to_value(ParamValue::Pairs(vec![("A".into(), f64::NAN), ("B".into(), 2.0)])).unwrap();
        assert_eq!(v, json!([["A", "NaN"], ["B", 2.0]]));
    }

    #[test]
    fn single_and_multi_shapes() {
        let single = RiskReport::Single(vec![("Tech".into(), ParamValue::Number(3.0))]);
        assert_eq!(serde_json::to_value(&single).unwrap(), json!([["Tech", 3.0]]));

        let multi = RiskReport::Multi(vec![
            ("gross".into(), vec![("".into(), ParamValue::Number(1.0))]),
            ("net".into(), vec![("".into(), ParamValue::Number(-1.0))]),
        ]);
        assert_eq!(serde_json::to_value(&multi).unwrap(), json!({"gross": [["", 1.0]], "net": [["", -1.0]]}));

        let portfolio = Named(vec![("exposure".to_string(), single)]);
        let user = UserReport { user_id: 7, ts: 1, portfolios: Named(vec![("main".into(), portfolio)]) };
        assert_eq!(
            serde_json::to_value(&user).unwrap(),
            json!({"user_id": 7, "ts": 1, "portfolios": {"main": {"exposure": [["Tech", 3.0]]}}})
        );
    }
}
