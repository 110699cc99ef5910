// ===============================
// src/section.rs (parsed hierarchical config sections)
// ===============================
use std::fmt;

use serde::de::{Deserializer, MapAccess, Visitor};
use serde::Deserialize;
use thiserror::Error;

use crate::expr::CompileError;

/// One config section: ordered key/value pairs plus ordered child sections.
///
/// The on-disk dialect is somebody else's problem; the binary reads these
/// from JSON objects where string/number/bool members are values and object
/// members are child sections named by their key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Section {
    pub name: String,
    pub values: Vec<(String, String)>,
    pub sections: Vec<Section>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{path}: missing required key '{key}'")]
    Missing { path: String, key: &'static str },
    #[error("{path}: invalid {key} '{value}'")]
    Invalid { path: String, key: &'static str, value: String },
    #[error("{path}: {key}: {source}")]
    Compile { path: String, key: String, source: CompileError },
    #[error("{path}: no formula defined")]
    NoParams { path: String },
}

impl Section {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Default::default() }
    }

    pub fn with(mut self, key: &str, value: &str) -> Self {
        self.values.push((key.to_string(), value.to_string()));
        self
    }

    pub fn child(mut self, sec: Section) -> Self {
        self.sections.push(sec);
        self
    }

    /// Trimmed value of `key`; empty values count as absent.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.trim())
            .filter(|v| !v.is_empty())
    }

    pub fn section(&self, name: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.name == name)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Member {
    Text(String),
    Number(serde_json::Number),
    Flag(bool),
    Child(Section),
}

struct SectionVisitor;

impl<'de> Visitor<'de> for SectionVisitor {
    type Value = Section;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a config section object")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Section, A::Error> {
        let mut sec = Section::default();
        while let Some((key, member)) = map.next_entry::<String, Member>()? {
            match member {
                Member::Text(v) => sec.values.push((key, v)),
                Member::Number(v) => sec.values.push((key, v.to_string())),
                Member::Flag(v) => sec.values.push((key, v.to_string())),
                Member::Child(mut child) => {
                    child.name = key;
                    sec.sections.push(child);
                }
            }
        }
        Ok(sec)
    }
}

impl<'de> Deserialize<'de> for Section {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        d.deserialize_map(SectionVisitor)
    }
}
