// ===============================
// src/main.rs
// ===============================
/*
 cd /home/kukuhtw/rust/risk_monitor_rust

 # konfigurasi yang aktif
curl -s localhost:9898/metrics | egrep '^config_feed_mode'

# arus event & tick risk
curl -s localhost:9898/metrics | egrep '^(events_applied_total|events_dropped_total|risk_ticks_total|reports_total)'

*/
/*
=============================================================================
Project : risk_monitor_rust — real-time trading risk monitor in Rust
Module  : main.rs
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
mod domain;
mod config;
mod metrics;
mod recorder;
mod feed;
mod refdata;
mod accounts;
mod positions;
mod state;
mod formula;
mod expr;
mod script;
mod history;
mod section;
mod risk;
mod portfolio;
mod report;
mod scheduler;

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use tokio::{
    select,
    sync::{broadcast, mpsc, oneshot, RwLock},
    time::{interval, Duration},
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::domain::{Event, UserId};
use crate::report::UserReport;
use crate::scheduler::{Command, ScriptFactory, Scheduler};
use crate::script::{NoScripts, ScriptRunner, SubprocessRunner};
use crate::state::Book;

/// Portfolio file plus what was loaded from it last time.
struct PortfolioSource {
    path: PathBuf,
    modified: Option<SystemTime>,
    users: BTreeSet<UserId>,
}

impl PortfolioSource {
    fn modified_at(path: &Path) -> Option<SystemTime> {
        std::fs::metadata(path).and_then(|m| m.modified()).ok()
    }

    /// Read the file and turn it into reload commands. Users that vanished
    /// from the file get an empty reload.
    fn reload(&mut self) -> Vec<Command> {
        self.modified = Self::modified_at(&self.path);
        let (raw, stem) = match config::read_portfolios(&self.path) {
            Ok(v) => v,
            Err(e) => {
                error!(error = %e, "portfolio file unreadable, keeping current portfolios");
                return Vec::new();
            }
        };
        let mut cmds = Vec::new();
        let mut seen = BTreeSet::new();
        for (user, sections) in scheduler::sections_by_user(raw, &stem) {
            seen.insert(user);
            cmds.push(Command::Reload { user, sections });
        }
        for gone in self.users.difference(&seen) {
            cmds.push(Command::Reload { user: *gone, sections: Vec::new() });
        }
        self.users = seen;
        cmds
    }

    fn changed(&self) -> bool {
        Self::modified_at(&self.path) != self.modified
    }
}

#[tokio::main]
async fn main() {
    // ---- Load config ----
    let args = config::load();

    // ---- Logging ----
    // RUST_LOG menang kalau di-set
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // ---- Metrics ----
    metrics::init();
    if let Err(e) = metrics::serve_metrics(args.metrics_port) {
        error!(error = %e, port = args.metrics_port, "metrics server failed to bind");
    }

    info!(
        feed_mode = %args.feed_mode.as_str(),
        tick_ms = args.tick_ms,
        portfolio_file = ?args.portfolio_file,
        script_dir = ?args.script_dir,
        record_file = ?args.record_file,
        "startup config"
    );
    crate::metrics::CONFIG_FEED_MODE
        .with_label_values(&[args.feed_mode.as_str()])
        .set(1);

    // ---- Shared book (single writer: apply loop) ----
    let book = Arc::new(RwLock::new(Book::new()));

    // ---- Buses ----
    let (ev_tx, mut ev_rx) = mpsc::channel::<Event>(8192);
    let (cmd_tx, cmd_rx) = mpsc::channel::<Command>(64);
    let (rpt_tx, _rpt_rx) = broadcast::channel::<Arc<UserReport>>(1024);

    // ---- Recorder (optional) ----
    if let Some(path) = args.record_file.clone() {
        tokio::spawn(recorder::run(rpt_tx.subscribe(), path));
    }

    // ---- Scheduler + portfolios ----
    let scripts: ScriptFactory = match args.script_dir.clone() {
        Some(dir) => {
            let interpreter = args.script_interpreter.clone();
            Arc::new(move |user: UserId| {
                Arc::new(SubprocessRunner::new(interpreter.clone(), &dir, user)) as Arc<dyn ScriptRunner>
            })
        }
        None => Arc::new(|_: UserId| Arc::new(NoScripts) as Arc<dyn ScriptRunner>),
    };
    let mut sched = Scheduler::new(book.clone(), scripts);

    let mut source = args.portfolio_file.clone().map(|path| PortfolioSource {
        path,
        modified: None,
        users: BTreeSet::new(),
    });
    let mut mock_users: Vec<UserId> = vec![1];
    if let Some(src) = source.as_mut() {
        for cmd in src.reload() {
            if let Command::Reload { user, sections } = cmd {
                sched.load_user(user, &sections);
            }
        }
        if !src.users.is_empty() {
            mock_users = src.users.iter().copied().collect();
        }
    } else {
        warn!("PORTFOLIO_FILE not set, no risk will be evaluated");
    }
    tokio::spawn(sched.run(Duration::from_millis(args.tick_ms.max(1)), cmd_rx, rpt_tx.clone()));

    // ---- FEED ----
    match args.feed_mode {
        config::FeedMode::Mock => {
            let cfg = feed::MockCfg {
                accounts: args.mock_accounts,
                securities: args.mock_securities,
                pace: Duration::from_millis(args.mock_pace_ms),
            };
            tokio::spawn(feed::run_mock(ev_tx, cfg, mock_users));
        }
        config::FeedMode::Replay => match args.replay_file.clone() {
            Some(path) => {
                tokio::spawn(async move {
                    if let Err(e) = feed::run_replay(ev_tx, &path).await {
                        error!(error = %e, path = %path.display(), "replay failed");
                    }
                });
            }
            None => {
                error!("FEED_MODE=replay requires REPLAY_FILE");
                return;
            }
        },
    }

    // ---- Heartbeat + apply loop ----
    let mut events: u64 = 0;
    let mut heartbeat = interval(Duration::from_secs(1));
    let mut beats: u64 = 0;
    let mut feed_open = true;
    let history_query = args.history_query.as_deref().and_then(config::parse_history_query);
    if args.history_query.is_some() && history_query.is_none() {
        warn!("HISTORY_QUERY must be user/portfolio/risk/param, ignored");
    }

    loop {
        select! {
            ev = ev_rx.recv(), if feed_open => {
                let Some(ev) = ev else {
                    info!("feed ended, book frozen");
                    feed_open = false;
                    continue;
                };
                events += 1;
                let subs = {
                    let mut b = book.write().await;
                    b.apply(ev);
                    b.ledger.take_subscriptions()
                };
                // upstream link di luar crate ini; cukup dicatat
                for security_id in subs {
                    info!(security_id, "subscribe market data");
                }
            },
            _ = heartbeat.tick() => {
                let (online, securities) = {
                    let b = book.read().await;
                    (b.ledger.is_online(), b.securities.len())
                };
                info!(events, online, securities, "heartbeat");
                events = 0;
                beats += 1;
                // cek perubahan portfolio file tiap 5 detik
                if beats % 5 == 0 {
                    if let Some(src) = source.as_mut().filter(|s| s.changed()) {
                        info!(path = %src.path.display(), "portfolio file changed, reloading");
                        for cmd in src.reload() {
                            if cmd_tx.send(cmd).await.is_err() {
                                warn!("scheduler gone, reload dropped");
                            }
                        }
                    }
                }
                if beats % 60 == 0 {
                    if let Some(q) = history_query.as_ref() {
                        log_history(&cmd_tx, q).await;
                    }
                }
            }
        }
    }
}

async fn log_history(cmd_tx: &mpsc::Sender<Command>, q: &config::HistoryQuery) {
    let (reply, rx) = oneshot::channel();
    let cmd = Command::History {
        user: q.user,
        portfolio: q.portfolio.clone(),
        risk: q.risk.clone(),
        param: q.param.clone(),
        reply,
    };
    if cmd_tx.send(cmd).await.is_err() {
        return;
    }
    match rx.await {
        Ok(Some(h)) => {
            for (group, points) in &h.groups {
                let last = points.last().copied();
                info!(
                    user = q.user,
                    param = %q.param,
                    %group,
                    points = points.len(),
                    ?last,
                    upper = h.upper_bound,
                    lower = h.lower_bound,
                    window_s = h.window.seconds,
                    window_kind = %h.window.kind,
                    "history"
                );
            }
        }
        Ok(None) => warn!(user = q.user, param = %q.param, "history: no graphed parameter under that path"),
        Err(_) => {}
    }
}
