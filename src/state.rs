// ===============================
// src/state.rs (shared book: refdata + ledger + accounts)
// ===============================
use std::sync::Arc;

use tracing::{debug, warn};

use crate::accounts::AccountDirectory;
use crate::domain::{AccountId, Event, UserId};
use crate::expr::PositionView;
use crate::metrics::{EVENTS_APPLIED, EVENTS_DROPPED};
use crate::positions::{Ledger, OrderOutcome};
use crate::refdata::SecurityStore;

/// Everything the event loop writes and the evaluators read.
#[derive(Debug, Default)]
pub struct Book {
    pub securities: SecurityStore,
    pub ledger: Ledger,
    pub accounts: AccountDirectory,
}

/// One account of a user, frozen for one evaluation cycle.
#[derive(Debug, Clone)]
pub struct AccountSnapshot {
    pub acc: AccountId,
    pub name: Arc<str>,
    pub positions: Vec<PositionView>,
}

fn dropped(reason: &str) {
    EVENTS_DROPPED.with_label_values(&[reason]).inc();
}

impl Book {
    pub fn new() -> Self { Self::default() }

    /// Apply one decoded upstream record. Single writer.
    pub fn apply(&mut self, ev: Event) {
        let action = ev.action();
        match ev {
            Event::Security(sec) => {
                if let Some(old) = self.securities.by_symbol(&sec.market, &sec.symbol) {
                    if old.id != sec.id {
                        warn!(market = %sec.market, symbol = %sec.symbol, old = old.id, new = sec.id, "symbol moved to another security id");
                    }
                }
                self.securities.upsert(sec)
            }
            Event::Bod(rec) => {
                if !self.ledger.apply_bod(&rec, &self.securities) {
                    return dropped("unknown_security");
                }
            }
            Event::OrderBacklog(o) | Event::Order(o) => {
                let online = action == "order";
                match self.ledger.apply_order(o, online, &self.securities) {
                    OrderOutcome::Applied | OrderOutcome::Buffered => {}
                    OrderOutcome::Duplicate => return dropped("duplicate"),
                    OrderOutcome::Dropped(reason) => return dropped(reason),
                }
            }
            Event::Offline { status } => self.ledger.apply_offline(&status, &self.securities),
            Event::Md { deltas } => {
                for d in &deltas {
                    if !self.securities.apply_md(d) {
                        dropped("unknown_security");
                    }
                }
            }
            Event::UserSubAccount(rec) => self.accounts.apply(&rec),
        }
        EVENTS_APPLIED.with_label_values(&[action]).inc();
    }

    pub fn users(&self) -> Vec<UserId> {
        self.accounts.users().map(|(u, _)| u).collect()
    }

    /// Copy of a user's accounts and their positions, taken under the read lock.
    pub fn snapshot(&self, user: UserId) -> Vec<AccountSnapshot> {
        let book = self.ledger.book();
        self.accounts
            .accounts_of(user)
            .iter()
            .map(|&acc| {
                let name: Arc<str> = Arc::from(self.accounts.name(acc));
                let positions = book
                    .of_account(acc)
                    .filter_map(|p| {
                        let security = self.securities.get(p.security_id)?.clone();
                        Some(PositionView { acc_name: name.clone(), security, position: p.clone() })
                    })
                    .collect::<Vec<_>>();
                debug!(user, acc, n = positions.len(), "snapshot account");
                AccountSnapshot { acc, name, positions }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Security;

    fn ev(raw: &str) -> Event {
        serde_json::from_str(raw).unwrap()
    }

    fn seeded() -> Book {
        let mut b = Book::new();
        b.apply(Event::Security(Security {
            id: 1,
            symbol: "ES".into(),
            market: "CME".into(),
            multiplier: 50.0,
            rate: 1.0,
            prev_close: 4000.0,
            ..Default::default()
        }));
        b.apply(ev(r#"{"action":"user_sub_account","user_id":7,"acc":10,"acc_name":"Desk1"}"#));
        b.apply(ev(r#"{"action":"bod","acc":10,"security_id":1,"qty":2,"avg_px":3990}"#));
        b
    }

    #[test]
    fn online_orders_wait_for_offline_complete() {
        let mut b = seeded();
        b.apply(ev(r#"{"action":"order","cl_ord_id":2,"seq":2,"state":"partial","qty":1,"px":4001}"#));
        b.apply(ev(r#"{"action":"Order","cl_ord_id":2,"seq":1,"state":"unconfirmed",
            "security_id":1,"acc":10,"qty":3,"px":4001,"side":"buy"}"#));
        let p = b.ledger.position(10, 1).unwrap();
        assert_eq!((p.cur.qty, p.outstand_buy_qty), (2.0, 3.0));

        b.apply(ev(r#"{"action":"offline","status":"complete"}"#));
        let p = b.ledger.position(10, 1).unwrap();
        assert_eq!((p.cur.qty, p.outstand_buy_qty), (3.0, 2.0));
        assert_eq!(p.bod.qty, 2.0);
    }

    #[test]
    fn snapshot_is_detached_from_later_events() {
        let mut b = seeded();
        b.apply(ev(r#"{"action":"md","deltas":[{"security_id":1,"fields":[["c",4010.0]]}]}"#));
        let snap = b.snapshot(7);
        assert_eq!(snap.len(), 1);
        assert_eq!(&*snap[0].name, "Desk1");
        assert_eq!(snap[0].positions.len(), 1);

        b.apply(ev(r#"{"action":"md","deltas":[{"security_id":1,"fields":[["c",4020.0]]}]}"#));
        b.apply(ev(r#"{"action":"bod","acc":10,"security_id":1,"qty":5,"avg_px":1}"#));
        let v = &snap[0].positions[0];
        assert_eq!(v.security.close(), 4010.0);
        assert_eq!(v.position.cur.qty, 2.0);
        assert!(b.snapshot(99).is_empty());
        assert_eq!(b.users(), vec![7]);
    }

    #[test]
    fn unknown_security_creates_nothing() {
        let mut b = seeded();
        b.apply(ev(r#"{"action":"bod","acc":10,"security_id":404,"qty":5,"avg_px":1}"#));
        assert!(b.ledger.position(10, 404).is_none());
        assert_eq!(b.snapshot(7)[0].positions.len(), 1);
    }
}
