// ===============================
// src/feed.rs
// ===============================
//
// Sumber event upstream (sudah di-decode):
// - run_mock   : generator acak (securities, akun, BOD, backlog, lalu order/fill/md live)
// - run_replay : baca file JSONL, satu Event per baris
//
// Keduanya hanya mengirim ke satu channel; apply loop tetap satu writer.
//
use std::path::Path;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::{
    fs::File,
    io::{AsyncBufReadExt, BufReader},
    sync::mpsc,
    time::{sleep, Duration},
};
use tracing::{info, warn};

use crate::domain::{
    AccountId, BodRecord, Event, Fill, MdDelta, NewOrder, OrderBody, OrderEvent, OrderId, Security,
    SecurityId, Side, UserSubAccount,
};

const SECTORS: [&str; 5] = ["Tech", "Energy", "Financials", "Health", "Industrials"];
const MARKETS: [&str; 2] = ["US", "HK"];

#[derive(Debug, Clone)]
pub struct MockCfg {
    pub accounts: usize,
    pub securities: usize,
    /// Pause between live events.
    pub pace: Duration,
}

struct Live {
    id: OrderId,
    acc: AccountId,
    security_id: SecurityId,
    qty: f64,
    filled: f64,
}

/// Seq counter bersama untuk backlog dan live (ledger cuma punya satu).
struct Gen {
    rng: StdRng,
    seq: i64,
    next_id: OrderId,
    cfg: MockCfg,
    px: Vec<f64>,
    live: Vec<Live>,
}

impl Gen {
    fn order(&mut self, online: bool, id: OrderId, body: OrderBody) -> Event {
        self.seq += 1;
        let ev = OrderEvent { cl_ord_id: id, seq: self.seq, body };
        if online { Event::Order(ev) } else { Event::OrderBacklog(ev) }
    }

    fn acc(&mut self) -> AccountId {
        100 + self.rng.gen_range(0..self.cfg.accounts) as AccountId
    }

    fn security(&mut self) -> SecurityId {
        1 + self.rng.gen_range(0..self.cfg.securities) as SecurityId
    }

    fn new_order(&mut self, online: bool) -> Event {
        let id = self.next_id;
        self.next_id += 1;
        let (acc, security_id) = (self.acc(), self.security());
        let qty = (self.rng.gen_range(1..=20) * 100) as f64;
        let side = if self.rng.gen_bool(0.5) { Side::Buy } else { Side::Sell };
        let px = self.px[(security_id - 1) as usize];
        self.live.push(Live { id, acc, security_id, qty, filled: 0.0 });
        self.order(
            online,
            id,
            OrderBody::Unconfirmed(NewOrder {
                security_id,
                acc,
                qty,
                px,
                side,
                ord_type: "limit".into(),
                orig_cl_ord_id: None,
            }),
        )
    }

    /// Fill / cancel sebuah order live secara acak.
    fn progress(&mut self, online: bool) -> Option<Event> {
        if self.live.is_empty() {
            return None;
        }
        let i = self.rng.gen_range(0..self.live.len());
        if self.rng.gen_bool(0.15) {
            let o = self.live.swap_remove(i);
            return Some(self.order(online, o.id, OrderBody::Cancelled));
        }
        let px = self.px[(self.live[i].security_id - 1) as usize];
        let o = &mut self.live[i];
        let left = o.qty - o.filled;
        let q = (left / 2.0).ceil().max(1.0).min(left);
        o.filled += q;
        let (id, done) = (o.id, o.filled >= o.qty);
        let fill = Fill { qty: q, px, exec_trans_type: String::new() };
        let body = if done {
            self.live.swap_remove(i);
            OrderBody::Filled(fill)
        } else {
            OrderBody::Partial(fill)
        };
        Some(self.order(online, id, body))
    }

    fn md(&mut self) -> Event {
        let security_id = self.security();
        let slot = (security_id - 1) as usize;
        let step = self.rng.gen_range(-0.005..=0.005);
        self.px[slot] = (self.px[slot] * (1.0 + step)).max(0.01);
        let c = (self.px[slot] * 100.0).round() / 100.0;
        Event::Md {
            deltas: vec![MdDelta {
                security_id,
                fields: vec![("c".into(), c), ("b0".into(), c - 0.01), ("a0".into(), c + 0.01)],
            }],
        }
    }
}

/// Opening burst: reference data, users, BOD, backlog, `offline(complete)`.
fn opening(g: &mut Gen, users: &[i64]) -> Vec<Event> {
    let mut out = Vec::new();
    for i in 0..g.cfg.securities {
        let prev_close = g.rng.gen_range(5.0..500.0_f64).round();
        g.px.push(prev_close);
        out.push(Event::Security(Security {
            id: i as SecurityId + 1,
            symbol: format!("SEC{:03}", i + 1),
            market: MARKETS[i % MARKETS.len()].to_string(),
            sec_type: "STOCK".into(),
            multiplier: 1.0,
            rate: 1.0,
            prev_close,
            currency: if i % MARKETS.len() == 0 { "USD".into() } else { "HKD".into() },
            sector: SECTORS[i % SECTORS.len()].to_string(),
            ..Default::default()
        }));
    }
    // user pertama lihat semua akun, user lain akun genap saja
    for (u, &user_id) in users.iter().enumerate() {
        for a in 0..g.cfg.accounts {
            if u == 0 || a % 2 == 0 {
                out.push(Event::UserSubAccount(UserSubAccount {
                    user_id,
                    acc: 100 + a as AccountId,
                    acc_name: format!("Desk{}", a + 1),
                    action: None,
                }));
            }
        }
    }
    for a in 0..g.cfg.accounts {
        let security_id = g.security();
        let avg_px = g.px[(security_id - 1) as usize];
        out.push(Event::Bod(BodRecord {
            acc: 100 + a as AccountId,
            security_id,
            qty: (g.rng.gen_range(-10..=10) * 100) as f64,
            avg_px,
            realized_pnl: 0.0,
        }));
    }
    for _ in 0..g.cfg.accounts * 2 {
        let ev = g.new_order(false);
        out.push(ev);
        if let Some(ev) = g.progress(false) {
            out.push(ev);
        }
    }
    out.push(Event::Offline { status: "complete".into() });
    out
}

pub async fn run_mock(tx: mpsc::Sender<Event>, cfg: MockCfg, users: Vec<i64>) {
    let mut g = Gen {
        rng: StdRng::from_entropy(),
        seq: 0,
        next_id: 1,
        cfg: MockCfg { accounts: cfg.accounts.max(1), securities: cfg.securities.max(1), pace: cfg.pace },
        px: Vec::new(),
        live: Vec::new(),
    };
    let burst = opening(&mut g, &users);
    info!(events = burst.len(), "mock feed: opening burst");
    for ev in burst {
        if tx.send(ev).await.is_err() {
            return;
        }
    }
    loop {
        let roll = g.rng.gen_range(0..10);
        let ev = match roll {
            0..=5 => Some(g.md()),
            6 => Some(g.new_order(true)),
            _ => g.progress(true),
        };
        if let Some(ev) = ev {
            if tx.send(ev).await.is_err() {
                info!("mock feed: receiver gone, stopped");
                return;
            }
        }
        sleep(g.cfg.pace).await;
    }
}

/// Replay a JSONL file of decoded events. Bad lines are logged and skipped.
pub async fn run_replay(tx: mpsc::Sender<Event>, path: impl AsRef<Path>) -> std::io::Result<usize> {
    let path = path.as_ref();
    let mut lines = BufReader::new(File::open(path).await?).lines();
    let (mut n, mut line_no) = (0usize, 0usize);
    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match serde_json::from_str::<Event>(line) {
            Ok(ev) => {
                if tx.send(ev).await.is_err() {
                    break;
                }
                n += 1;
            }
            Err(e) => warn!(path = %path.display(), line = line_no, error = %e, "replay: bad event skipped"),
        }
    }
    info!(path = %path.display(), events = n, "replay finished");
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Book;

    fn gen(accounts: usize, securities: usize) -> Gen {
        Gen {
            rng: StdRng::seed_from_u64(7),
            seq: 0,
            next_id: 1,
            cfg: MockCfg { accounts, securities, pace: Duration::from_millis(1) },
            px: Vec::new(),
            live: Vec::new(),
        }
    }

    #[test]
    fn opening_burst_builds_a_consistent_book() {
        let mut g = gen(4, 6);
        let burst = opening(&mut g, &[1, 2]);
        assert!(matches!(burst.last(), Some(Event::Offline { .. })));

        let mut book = Book::new();
        for ev in burst {
            book.apply(ev);
        }
        for _ in 0..200 {
            let ev = match g.rng.gen_range(0..3) {
                0 => Some(g.md()),
                1 => Some(g.new_order(true)),
                _ => g.progress(true),
            };
            if let Some(ev) = ev {
                book.apply(ev);
            }
        }
        assert!(book.ledger.is_online());
        assert_eq!(book.accounts.accounts_of(1).len(), 4);
        assert_eq!(book.accounts.accounts_of(2).len(), 2);
        assert_eq!(book.securities.len(), 6);
        for acc in book.accounts.accounts_of(1) {
            for p in book.ledger.book().of_account(*acc) {
                assert!(p.outstand_buy_qty >= 0.0 && p.outstand_sell_qty >= 0.0);
            }
        }
    }

    #[tokio::test]
    async fn replay_skips_bad_lines() {
        let path = std::env::temp_dir().join(format!("risk-replay-{}.jsonl", std::process::id()));
        let body = concat!(
            "{\"action\":\"offline\",\"status\":\"complete\"}\n",
            "# komentar\n",
            "not json\n",
            "\n",
            "{\"action\":\"md\",\"deltas\":[{\"security_id\":1,\"fields\":[[\"c\",1.5]]}]}\n",
        );
        tokio::fs::write(&path, body).await.unwrap();
        let (tx, mut rx) = mpsc::channel(16);
        let n = run_replay(tx, &path).await.unwrap();
        assert_eq!(n, 2);
        assert!(matches!(rx.recv().await, Some(Event::Offline { .. })));
        assert!(matches!(rx.recv().await, Some(Event::Md { .. })));
        tokio::fs::remove_file(&path).await.ok();
    }
}
