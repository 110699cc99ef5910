// ===============================
// src/scheduler.rs (per-user portfolio ticks)
// ===============================
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use futures_util::future::join_all;
use tokio::sync::{broadcast, mpsc, oneshot, RwLock};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::domain::{AccountId, UserId};
use crate::expr::PositionView;
use crate::history::Point;
use crate::metrics::{PORTFOLIOS_LOADED, PORTFOLIO_LOAD_FAILURES, PORTFOLIO_PANICS, REPORTS, RISK_TICKS, TICK_LATENCY};
use crate::portfolio::Portfolio;
use crate::risk::Window;
use crate::report::{Named, UserReport};
use crate::script::ScriptRunner;
use crate::section::Section;
use crate::state::{AccountSnapshot, Book};

/// Builds the script backend for one user.
pub type ScriptFactory = Arc<dyn Fn(UserId) -> Arc<dyn ScriptRunner> + Send + Sync>;

/// Answer to a history query: the parameter's limits plus the compacted series per group.
#[derive(Debug, Clone)]
pub struct ParamHistory {
    pub upper_bound: f64,
    pub lower_bound: f64,
    pub window: Window,
    pub groups: Vec<(String, Vec<Point>)>,
}

/// A user's loaded portfolios. Locked by the blocking task that evaluates them.
pub struct UserBook {
    portfolios: Vec<Portfolio>,
    scripts: Arc<dyn ScriptRunner>,
}

pub enum Command {
    /// Replace a user's portfolios: `(fallback name, section)` per portfolio.
    Reload { user: UserId, sections: Vec<(String, Section)> },
    History {
        user: UserId,
        portfolio: String,
        risk: String,
        param: String,
        reply: oneshot::Sender<Option<ParamHistory>>,
    },
}

pub struct Scheduler {
    book: Arc<RwLock<Book>>,
    users: BTreeMap<UserId, Arc<Mutex<UserBook>>>,
    scripts: ScriptFactory,
}

fn lock(ub: &Mutex<UserBook>) -> std::sync::MutexGuard<'_, UserBook> {
    // panic di tick sebelumnya tidak boleh mematikan user ini selamanya
    ub.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Scheduler {
    pub fn new(book: Arc<RwLock<Book>>, scripts: ScriptFactory) -> Self {
        Self { book, users: BTreeMap::new(), scripts }
    }

    /// Compile a user's portfolios. Sections that fail are logged and skipped.
    /// Returns how many loaded.
    pub fn load_user(&mut self, user: UserId, sections: &[(String, Section)]) -> usize {
        let scripts = (self.scripts)(user);
        let mut portfolios: Vec<Portfolio> = Vec::with_capacity(sections.len());
        for (fallback, sec) in sections {
            match Portfolio::from_section(sec, fallback, scripts.as_ref()) {
                Ok(p) => {
                    for r in p.risks() {
                        for rp in r.params() {
                            debug!(user, portfolio = %p.name, risk = %r.display_name, param = %rp.name, formula = rp.formula().source(), "param compiled");
                        }
                    }
                    // nama sama -> yang terakhir menang
                    portfolios.retain(|old| old.name != p.name);
                    portfolios.push(p);
                }
                Err(e) => {
                    PORTFOLIO_LOAD_FAILURES.inc();
                    error!(user, portfolio = %fallback, error = %e, "portfolio rejected");
                }
            }
        }
        let n = portfolios.len();
        PORTFOLIOS_LOADED.with_label_values(&[&user.to_string()]).set(n as i64);
        info!(user, portfolios = n, "portfolios loaded");
        self.users.insert(user, Arc::new(Mutex::new(UserBook { portfolios, scripts })));
        n
    }

    /// Compacted history of a graphed parameter.
    pub fn history(&self, user: UserId, portfolio: &str, risk: &str, param: &str) -> Option<ParamHistory> {
        let ub = self.users.get(&user)?;
        let ub = lock(ub);
        let rp = ub
            .portfolios
            .iter()
            .find(|p| p.name == portfolio)?
            .risk(risk)?
            .param(param)?;
        let h = rp.history()?;
        Some(ParamHistory {
            upper_bound: rp.upper_bound,
            lower_bound: rp.lower_bound,
            window: rp.window.clone(),
            groups: h.groups().map(|(g, pts)| (g.to_string(), pts.to_vec())).collect(),
        })
    }

    fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::Reload { user, sections } => {
                self.load_user(user, &sections);
            }
            Command::History { user, portfolio, risk, param, reply } => {
                let _ = reply.send(self.history(user, &portfolio, &risk, &param));
            }
        }
    }

    /// One evaluation cycle: snapshot under the read lock, then one blocking
    /// task per user. Returns when every user is done.
    pub async fn run_tick(&self) -> Vec<UserReport> {
        let ts = chrono::Utc::now().timestamp();
        let work: Vec<(UserId, Vec<AccountSnapshot>, Arc<Mutex<UserBook>>)> = {
            let book = self.book.read().await;
            book.users()
                .into_iter()
                .filter_map(|u| self.users.get(&u).map(|ub| (u, book.snapshot(u), ub.clone())))
                .collect()
        };

        let tasks = work.into_iter().map(|(user, snap, ub)| {
            tokio::task::spawn_blocking(move || run_user(user, ts, &snap, &ub))
        });
        let mut out = Vec::new();
        for res in join_all(tasks).await {
            match res {
                Ok(Some(rpt)) => out.push(rpt),
                Ok(None) => {}
                Err(e) => error!(error = %e, "user evaluation task failed"),
            }
        }
        out
    }

    /// Tick loop. Ticks never overlap: the next one waits for the current one.
    pub async fn run(
        mut self,
        tick: Duration,
        mut cmds: mpsc::Receiver<Command>,
        reports: broadcast::Sender<Arc<UserReport>>,
    ) {
        let mut iv = interval(tick);
        iv.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(tick_ms = tick.as_millis() as u64, users = self.users.len(), "scheduler started");
        loop {
            tokio::select! {
                _ = iv.tick() => {
                    let t0 = Instant::now();
                    let out = self.run_tick().await;
                    RISK_TICKS.inc();
                    TICK_LATENCY.observe(t0.elapsed().as_secs_f64() * 1000.0);
                    debug!(reports = out.len(), "tick done");
                    for rpt in out {
                        REPORTS.inc();
                        // tidak ada subscriber -> report dibuang
                        let _ = reports.send(Arc::new(rpt));
                    }
                }
                Some(cmd) = cmds.recv() => self.handle(cmd),
            }
        }
    }
}

fn run_user(user: UserId, ts: i64, snap: &[AccountSnapshot], ub: &Mutex<UserBook>) -> Option<UserReport> {
    let mut guard = lock(ub);
    let UserBook { portfolios, scripts } = &mut *guard;
    let accounts: Vec<(AccountId, &str)> = snap.iter().map(|a| (a.acc, &*a.name)).collect();

    let mut out = Named::default();
    for p in portfolios.iter_mut() {
        let positions: Vec<PositionView> = p
            .match_accounts(&accounts)
            .into_iter()
            .filter_map(|acc| snap.iter().find(|a| a.acc == acc))
            .flat_map(|a| a.positions.iter())
            .filter(|v| p.accepts(v))
            .cloned()
            .collect();
        if positions.is_empty() {
            continue;
        }
        // panic di satu portfolio tidak boleh menghapus report portfolio lain
        match panic::catch_unwind(AssertUnwindSafe(|| p.run(&positions, scripts.as_ref()))) {
            Ok(rpt) => out.0.push((p.name.clone(), rpt)),
            Err(_) => {
                PORTFOLIO_PANICS.inc();
                error!(user, portfolio = %p.name, "portfolio evaluation panicked, skipped this tick");
            }
        }
    }
    if out.is_empty() {
        return None;
    }
    if out.len() < portfolios.len() {
        debug!(user, reported = out.len(), total = portfolios.len(), "some portfolios had no positions");
    }
    Some(UserReport { user_id: user, ts, portfolios: out })
}

/// Group `{"<user>": [section, ...]}` into per-user reload lists.
pub fn sections_by_user(raw: BTreeMap<String, Vec<Section>>, fallback_stem: &str) -> Vec<(UserId, Vec<(String, Section)>)> {
    let mut out = Vec::new();
    for (user, secs) in raw {
        let Ok(uid) = user.trim().parse::<UserId>() else {
            warn!(%user, "portfolio file: user key is not numeric, skipped");
            continue;
        };
        let list = secs
            .into_iter()
            .enumerate()
            .map(|(i, s)| {
                let fallback = if i == 0 { fallback_stem.to_string() } else { format!("{fallback_stem}{i}") };
                (fallback, s)
            })
            .collect();
        out.push((uid, list));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Event, Security};
    use crate::expr::CallTarget;
    use crate::report::{ParamValue, RiskReport};
    use crate::script::{FieldMap, NoScripts, ScriptError, ScriptOutput};

    fn ev(raw: &str) -> Event {
        serde_json::from_str(raw).unwrap()
    }

    fn book() -> Arc<RwLock<Book>> {
        let mut b = Book::new();
        for (id, sym, sector) in [(1, "AAPL", "Tech"), (2, "XOM", "Energy")] {
            b.apply(Event::Security(Security {
                id,
                symbol: sym.into(),
                sector: sector.into(),
                market: "US".into(),
                prev_close: 10.0,
                ..Default::default()
            }));
        }
        b.apply(ev(r#"{"action":"user_sub_account","user_id":1,"acc":10,"acc_name":"Desk1"}"#));
        b.apply(ev(r#"{"action":"user_sub_account","user_id":1,"acc":11,"acc_name":"Desk2"}"#));
        b.apply(ev(r#"{"action":"user_sub_account","user_id":2,"acc":11,"acc_name":"Desk2"}"#));
        b.apply(ev(r#"{"action":"bod","acc":10,"security_id":1,"qty":100,"avg_px":9}"#));
        b.apply(ev(r#"{"action":"bod","acc":11,"security_id":2,"qty":-5,"avg_px":11}"#));
        Arc::new(RwLock::new(b))
    }

    fn no_scripts() -> ScriptFactory {
        Arc::new(|_: UserId| Arc::new(NoScripts) as Arc<dyn ScriptRunner>)
    }

    fn portfolio(acc: &str) -> Section {
        Section::new("")
            .with("acc", acc)
            .child(Section::new("pos").with("group", "sector").with("formula", "sum(Pos)").with("graph", "y"))
    }

    fn value(rpt: &UserReport, portfolio: &str, group: &str) -> Option<f64> {
        match rpt.portfolios.get(portfolio)?.get("pos")? {
            RiskReport::Single(groups) => groups.iter().find(|(g, _)| g == group).and_then(|(_, v)| match v {
                ParamValue::Number(x) => Some(*x),
                ParamValue::Pairs(_) => None,
            }),
            RiskReport::Multi(_) => None,
        }
    }

    #[tokio::test]
    async fn tick_reports_per_user_and_portfolio() {
        let mut s = Scheduler::new(book(), no_scripts());
        s.load_user(1, &[("all".into(), portfolio("*")), ("ex1".into(), portfolio("~Desk1"))]);
        s.load_user(2, &[("mine".into(), portfolio("*"))]);

        let mut reports = s.run_tick().await;
        reports.sort_by_key(|r| r.user_id);
        assert_eq!(reports.len(), 2);

        let u1 = &reports[0];
        assert_eq!(value(u1, "all", "Tech"), Some(100.0));
        assert_eq!(value(u1, "all", "Energy"), Some(-5.0));
        assert_eq!(value(u1, "ex1", "Tech"), None);
        assert_eq!(value(u1, "ex1", "Energy"), Some(-5.0));

        let u2 = &reports[1];
        assert_eq!(value(u2, "mine", "Tech"), None);
        assert_eq!(value(u2, "mine", "Energy"), Some(-5.0));

        let h = s.history(1, "all", "pos", "pos").unwrap();
        assert_eq!(h.groups.len(), 2);
        assert!(h.upper_bound.is_nan());
        assert!(s.history(1, "all", "pos", "nope").is_none());
        assert!(s.history(3, "all", "pos", "pos").is_none());
    }

    #[tokio::test]
    async fn broken_portfolio_is_skipped_not_fatal() {
        let mut s = Scheduler::new(book(), no_scripts());
        let bad = Section::new("").child(Section::new("x").with("formula", "sum(Pos +)"));
        let n = s.load_user(1, &[("bad".into(), bad), ("good".into(), portfolio("*"))]);
        assert_eq!(n, 1);
        let reports = s.run_tick().await;
        assert_eq!(reports.len(), 1);
        assert!(reports[0].portfolios.get("good").is_some());
    }

    struct Panicky;
    impl ScriptRunner for Panicky {
        fn call(&self, _t: &CallTarget, positions: &[FieldMap]) -> Result<ScriptOutput, ScriptError> {
            if positions.is_empty() {
                return Ok(ScriptOutput::Number(0.0));
            }
            panic!("script blew up");
        }
    }

    #[tokio::test]
    async fn one_user_failing_does_not_stop_the_others() {
        let factory: ScriptFactory = Arc::new(|user: UserId| {
            if user == 1 { Arc::new(Panicky) as Arc<dyn ScriptRunner> } else { Arc::new(NoScripts) }
        });
        let mut s = Scheduler::new(book(), factory);
        let scripted = Section::new("").child(Section::new("x").with("formula", "call('m', 'f')"));
        s.load_user(1, &[("p".into(), scripted)]);
        s.load_user(2, &[("mine".into(), portfolio("*"))]);

        let reports = s.run_tick().await;
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].user_id, 2);

        // tick berikutnya tetap jalan
        assert_eq!(s.run_tick().await.len(), 1);
    }

    #[tokio::test]
    async fn panicking_portfolio_keeps_its_siblings() {
        let factory: ScriptFactory = Arc::new(|_: UserId| Arc::new(Panicky) as Arc<dyn ScriptRunner>);
        let mut s = Scheduler::new(book(), factory);
        let scripted = Section::new("").child(Section::new("x").with("formula", "call('m', 'f')"));
        let n = s.load_user(1, &[("bad".into(), scripted), ("good".into(), portfolio("*"))]);
        assert_eq!(n, 2);

        for _ in 0..2 {
            let reports = s.run_tick().await;
            assert_eq!(reports.len(), 1);
            assert!(reports[0].portfolios.get("bad").is_none());
            assert_eq!(value(&reports[0], "good", "Tech"), Some(100.0));
        }
    }

    #[tokio::test]
    async fn deleted_account_drops_out_of_next_tick() {
        let book = book();
        let mut s = Scheduler::new(book.clone(), no_scripts());
        s.load_user(2, &[("mine".into(), portfolio("*"))]);
        assert_eq!(s.run_tick().await.len(), 1);

        book.write()
            .await
            .apply(ev(r#"{"action":"user_sub_account","user_id":2,"acc":11,"acc_name":"Desk2","sub_action":"delete"}"#));
        assert!(s.run_tick().await.is_empty());
    }

    #[tokio::test]
    async fn reload_and_history_commands() {
        let mut s = Scheduler::new(book(), no_scripts());
        s.handle(Command::Reload { user: 1, sections: vec![("all".into(), portfolio("*"))] });
        s.run_tick().await;
        let (tx, rx) = oneshot::channel();
        s.handle(Command::History { user: 1, portfolio: "all".into(), risk: "pos".into(), param: "pos".into(), reply: tx });
        let h = rx.await.unwrap().unwrap();
        assert_eq!(h.groups.iter().map(|(g, _)| g.as_str()).collect::<Vec<_>>(), ["Energy", "Tech"]);
    }

    #[test]
    fn portfolio_file_grouping() {
        let raw: BTreeMap<String, Vec<Section>> =
            serde_json::from_str(r#"{"7": [{"acc": "*"}, {"name": "named"}], "x": [{}]}"#).unwrap();
        let users = sections_by_user(raw, "portfolios");
        assert_eq!(users.len(), 1);
        let (uid, list) = &users[0];
        assert_eq!(*uid, 7);
        assert_eq!(list.iter().map(|(f, _)| f.as_str()).collect::<Vec<_>>(), ["portfolios", "portfolios1"]);
    }
}
