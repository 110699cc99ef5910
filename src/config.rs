// ===============================
// src/config.rs
// ===============================
/*
=============================================================================
Project : risk_monitor_rust — real-time trading risk monitor in Rust
Module  : config.rs
Version : 0.1.0
Author  : Kukuh Tripamungkas Wicaksono (Kukuh TW)
Email   : kukuhtw@gmail.com
WhatsApp: https://wa.me/628129893706
LinkedIn: https://id.linkedin.com/in/kukuhtw
License : MIT (see LICENSE)

Summary : Consumes order/fill/market-data events, keeps per-account
          positions and PnL, evaluates user risk formulas per portfolio
          every tick, exposes Prometheus metrics, and records JSONL reports.

(c) 2025 Kukuh TW. All rights reserved where applicable.
=============================================================================
*/
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use clap::{Parser, ValueEnum};
use dotenvy::dotenv;
use thiserror::Error;

use crate::domain::UserId;
use crate::section::Section;

/// Sumber event upstream
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum FeedMode {
    Mock,
    Replay,
}

impl FeedMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedMode::Mock => "mock",
            FeedMode::Replay => "replay",
        }
    }
}

#[derive(Clone, Debug, Parser)]
#[command(name = "risk_monitor_rust", version, about = "real-time trading risk monitor")]
pub struct Args {
    /// mock | replay
    #[arg(long, env = "FEED_MODE", value_enum, default_value = "mock")]
    pub feed_mode: FeedMode,

    /// JSONL of decoded events, one per line (FEED_MODE=replay)
    #[arg(long, env = "REPLAY_FILE")]
    pub replay_file: Option<PathBuf>,

    /// JSON: {"<userId>": [portfolio section, ...]}
    #[arg(long, env = "PORTFOLIO_FILE")]
    pub portfolio_file: Option<PathBuf>,

    /// Root of call() modules; per-user modules live in __<userId>__/
    #[arg(long, env = "SCRIPT_DIR")]
    pub script_dir: Option<PathBuf>,

    #[arg(long, env = "SCRIPT_INTERPRETER", default_value = "python3")]
    pub script_interpreter: String,

    #[arg(long, env = "TICK_MS", default_value_t = 1000)]
    pub tick_ms: u64,

    /// JSONL sink for reports (disabled when unset)
    #[arg(long, env = "RECORD_FILE")]
    pub record_file: Option<String>,

    #[arg(long, env = "METRICS_PORT", default_value_t = 9898)]
    pub metrics_port: u16,

    /// Default log filter, RUST_LOG wins when set
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log a graphed parameter's history every minute: user/portfolio/risk/param
    #[arg(long, env = "HISTORY_QUERY")]
    pub history_query: Option<String>,

    #[arg(long, env = "MOCK_ACCOUNTS", default_value_t = 4)]
    pub mock_accounts: usize,

    #[arg(long, env = "MOCK_SECURITIES", default_value_t = 20)]
    pub mock_securities: usize,

    /// Pause between mock live events (ms)
    #[arg(long, env = "MOCK_PACE_MS", default_value_t = 5)]
    pub mock_pace_ms: u64,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("read {path}: {source}")]
    Io { path: String, source: std::io::Error },
    #[error("parse {path}: {source}")]
    Json { path: String, source: serde_json::Error },
}

pub fn load() -> Args {
    // Pastikan .env dibaca dulu (agar FEED_MODE, TICK_MS, dll ter-load)
    let _ = dotenv();
    Args::parse()
}

/// Read the portfolio file. Returns the raw per-user lists and the file stem
/// used as fallback portfolio name.
pub fn read_portfolios(path: &Path) -> Result<(BTreeMap<String, Vec<Section>>, String), LoadError> {
    let shown = path.display().to_string();
    let text = std::fs::read_to_string(path).map_err(|e| LoadError::Io { path: shown.clone(), source: e })?;
    let raw = serde_json::from_str(&text).map_err(|e| LoadError::Json { path: shown, source: e })?;
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "portfolio".to_string());
    Ok((raw, stem))
}

#[derive(Clone, Debug, PartialEq)]
pub struct HistoryQuery {
    pub user: UserId,
    pub portfolio: String,
    pub risk: String,
    pub param: String,
}

/// `user/portfolio/risk/param`
pub fn parse_history_query(s: &str) -> Option<HistoryQuery> {
    let parts: Vec<&str> = s.split('/').map(str::trim).collect();
    let [user, portfolio, risk, param] = parts[..] else {
        return None;
    };
    if [portfolio, risk, param].iter().any(|p| p.is_empty()) {
        return None;
    }
    Some(HistoryQuery {
        user: user.parse().ok()?,
        portfolio: portfolio.to_string(),
        risk: risk.to_string(),
        param: param.to_string(),
    })
}
