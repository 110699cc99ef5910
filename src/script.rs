// ===============================
// src/script.rs (external call(...) backends)
// ===============================
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use serde_json::{json, Map, Value as Json};
use thiserror::Error;
use tracing::debug;

use crate::domain::UserId;
use crate::expr::{CallTarget, Field, PositionView};
use crate::formula::Value;

/// One position flattened to `{field name: value}` for an external function.
pub type FieldMap = Map<String, Json>;

#[derive(Debug, Clone, PartialEq)]
pub enum ScriptOutput {
    Number(f64),
    Pairs(Vec<(String, f64)>),
}

impl From<ScriptOutput> for Value {
    fn from(o: ScriptOutput) -> Self {
        match o {
            ScriptOutput::Number(v) => Value::Number(v),
            ScriptOutput::Pairs(p) => Value::Pairs(p),
        }
    }
}

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("external scripts are not configured")]
    Unavailable,
    #[error("failed to run interpreter: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("script failed: {0}")]
    Failed(String),
    #[error("script must return a number or a list of (name, number) pairs, got: {0}")]
    Protocol(String),
}

/// Backend for `call(module, function [, args])`.
///
/// Called from blocking evaluation threads, never from the async runtime.
pub trait ScriptRunner: Send + Sync {
    fn call(&self, target: &CallTarget, positions: &[FieldMap]) -> Result<ScriptOutput, ScriptError>;
}

/// Used when no script directory is configured: every call fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoScripts;

impl ScriptRunner for NoScripts {
    fn call(&self, _target: &CallTarget, _positions: &[FieldMap]) -> Result<ScriptOutput, ScriptError> {
        Err(ScriptError::Unavailable)
    }
}

pub fn flatten(view: &PositionView) -> FieldMap {
    let mut m = Map::with_capacity(Field::ALL.len());
    for f in Field::ALL {
        let v = match view.field(f) {
            Value::Number(x) => serde_json::Number::from_f64(x).map(Json::Number).unwrap_or(Json::Null),
            Value::Bool(b) => Json::Bool(b),
            Value::Str(s) => Json::String(s),
            Value::Pairs(_) => continue,
        };
        m.insert(f.name().to_string(), v);
    }
    m
}

// jalan di interpreter: import module, panggil fungsi, tulis hasil JSON
const BOOTSTRAP: &str = r#"
import importlib, json, sys
req = json.load(sys.stdin)
fn = getattr(importlib.import_module(sys.argv[1]), sys.argv[2])
json.dump(fn(req["positions"], req["args"]), sys.stdout)
"#;

/// Runs each call in a fresh interpreter process.
///
/// Modules are searched in the user's own directory (`<dir>/__<user>__`) first,
/// then in the shared directory. Request goes in on stdin, result comes back on stdout.
#[derive(Debug, Clone)]
pub struct SubprocessRunner {
    interpreter: String,
    search_path: Vec<PathBuf>,
}

impl SubprocessRunner {
    pub fn new(interpreter: impl Into<String>, dir: &Path, user: UserId) -> Self {
        let mut search_path = Vec::with_capacity(2);
        let own = dir.join(format!("__{user}__"));
        if own.is_dir() {
            search_path.push(own);
        }
        search_path.push(dir.to_path_buf());
        Self { interpreter: interpreter.into(), search_path }
    }
}

impl ScriptRunner for SubprocessRunner {
    fn call(&self, target: &CallTarget, positions: &[FieldMap]) -> Result<ScriptOutput, ScriptError> {
        let python_path = std::env::join_paths(&self.search_path)
            .map_err(|e| ScriptError::Failed(e.to_string()))?;
        let mut child = Command::new(&self.interpreter)
            .arg("-c")
            .arg(BOOTSTRAP)
            .arg(&target.module)
            .arg(&target.function)
            .env("PYTHONPATH", python_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let req = json!({ "positions": positions, "args": target.args });
        if let Some(mut stdin) = child.stdin.take() {
            // stdin ditutup saat drop -> script lihat EOF
            if let Err(e) = stdin.write_all(req.to_string().as_bytes()) {
                drop(stdin);
                // child harus di-reap, jangan tinggalkan zombie
                let _ = child.kill();
                let _ = child.wait();
                return Err(ScriptError::Failed(format!("{}.{}: write request: {e}", target.module, target.function)));
            }
        }
        let out = child.wait_with_output()?;
        if !out.status.success() {
            let err = String::from_utf8_lossy(&out.stderr);
            let last = err.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("non-zero exit");
            return Err(ScriptError::Failed(format!("{}.{}: {}", target.module, target.function, last.trim())));
        }
        let text = String::from_utf8_lossy(&out.stdout);
        debug!(module = %target.module, function = %target.function, n = positions.len(), "script returned");
        parse_output(text.trim())
    }
}

/// Accepts a number, or a list of `[name, number]` pairs.
pub fn parse_output(text: &str) -> Result<ScriptOutput, ScriptError> {
    let bad = || ScriptError::Protocol(text.chars().take(80).collect());
    let v: Json = serde_json::from_str(text).map_err(|_| bad())?;
    match v {
        Json::Number(n) => n.as_f64().map(ScriptOutput::Number).ok_or_else(bad),
        Json::Array(items) => {
            let mut pairs = Vec::with_capacity(items.len());
            for it in items {
                let Json::Array(kv) = it else { return Err(bad()) };
                match kv.as_slice() {
                    [Json::String(k), Json::Number(x)] => pairs.push((k.clone(), x.as_f64().ok_or_else(bad)?)),
                    _ => return Err(bad()),
                }
            }
            Ok(ScriptOutput::Pairs(pairs))
        }
        _ => Err(bad()),
    }
}
