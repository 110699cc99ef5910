// ===============================
// src/positions.rs (order ledger, PnL & inventory tracker)
// ===============================

use std::collections::BTreeMap;

use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use tracing::{info, warn};

use crate::domain::{
    AccountId, BodRecord, Fill, NewOrder, Order, OrderBody, OrderEvent, OrderId, OrderState,
    Position, SecurityId, Side,
};
use crate::metrics::{OFFLINE_BUFFERED, ORDERS_TRACKED, POSITIONS_TRACKED};
use crate::refdata::SecurityStore;

/// What the ledger did with one order event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderOutcome {
    Applied,
    /// Online event parked until the offline backlog completes.
    Buffered,
    /// Sequence number not beyond the last applied one.
    Duplicate,
    Dropped(&'static str),
}

/// Positions per account, ordered by security id inside an account.
#[derive(Debug, Default)]
pub struct PositionBook {
    by_acc: HashMap<AccountId, BTreeMap<SecurityId, Position>>,
    subscribed: HashSet<SecurityId>,
    pending_subs: Vec<SecurityId>,
    count: usize,
}

impl PositionBook {
    /// Lazily create the (acc, security) position. Unknown securities never get one.
    pub fn get_or_create(
        &mut self,
        acc: AccountId,
        security_id: SecurityId,
        secs: &SecurityStore,
    ) -> Option<&mut Position> {
        if !secs.contains(security_id) {
            warn!(acc, security_id, "unknown security, no position created");
            return None;
        }
        let per_acc = self.by_acc.entry(acc).or_default();
        if !per_acc.contains_key(&security_id) {
            per_acc.insert(security_id, Position::new(acc, security_id));
            self.count += 1;
            POSITIONS_TRACKED.set(self.count as i64);
            // subscribe md sekali saja per security
            if self.subscribed.insert(security_id) {
                self.pending_subs.push(security_id);
            }
        }
        per_acc.get_mut(&security_id)
    }

    pub fn get(&self, acc: AccountId, security_id: SecurityId) -> Option<&Position> {
        self.by_acc.get(&acc)?.get(&security_id)
    }

    pub fn of_account(&self, acc: AccountId) -> impl Iterator<Item = &Position> {
        self.by_acc.get(&acc).into_iter().flat_map(|m| m.values())
    }

    pub fn len(&self) -> usize { self.count }
}

/// The authoritative order/position ledger. One logical writer.
#[derive(Debug, Default)]
pub struct Ledger {
    book: PositionBook,
    orders: HashMap<OrderId, Order>,
    seq_num: i64,
    offline_done: bool,
    online_cache: Vec<OrderEvent>,
}

impl Ledger {
    pub fn new() -> Self { Self::default() }

    pub fn book(&self) -> &PositionBook { &self.book }

    pub fn order(&self, id: OrderId) -> Option<&Order> { self.orders.get(&id) }

    pub fn position(&self, acc: AccountId, security_id: SecurityId) -> Option<&Position> {
        self.book.get(acc, security_id)
    }

    pub fn is_online(&self) -> bool { self.offline_done }

    /// Securities that need a live market-data subscription (each reported once).
    pub fn take_subscriptions(&mut self) -> Vec<SecurityId> {
        std::mem::take(&mut self.book.pending_subs)
    }

    /// Seed beginning-of-day state; overwrites the current values too.
    pub fn apply_bod(&mut self, rec: &BodRecord, secs: &SecurityStore) -> bool {
        let Some(p) = self.book.get_or_create(rec.acc, rec.security_id, secs) else {
            return false;
        };
        p.cur.qty = rec.qty;
        p.cur.avg_px = rec.avg_px;
        p.cur.realized_pnl = rec.realized_pnl;
        p.bod = p.cur;
        true
    }

    /// `offline(complete)` replays parked online events in arrival order.
    pub fn apply_offline(&mut self, status: &str, secs: &SecurityStore) {
        if status != "complete" {
            return;
        }
        let parked = std::mem::take(&mut self.online_cache);
        let n = parked.len();
        for ev in parked {
            self.apply_order(ev, false, secs);
        }
        self.offline_done = true;
        OFFLINE_BUFFERED.set(0);
        info!(replayed = n, positions = self.book.len(), orders = self.orders.len(), "offline done");
    }

    pub fn apply_order(&mut self, ev: OrderEvent, online: bool, secs: &SecurityStore) -> OrderOutcome {
        if online && !self.offline_done {
            self.online_cache.push(ev);
            OFFLINE_BUFFERED.set(self.online_cache.len() as i64);
            return OrderOutcome::Buffered;
        }
        if ev.seq <= self.seq_num {
            return OrderOutcome::Duplicate;
        }
        self.seq_num = ev.seq;

        let id = ev.cl_ord_id;
        match ev.body {
            OrderBody::Unconfirmed(n) => self.on_new_order(id, OrderState::Unconfirmed, n, secs),
            OrderBody::UnconfirmedReplace(n) => {
                self.on_new_order(id, OrderState::UnconfirmedReplace, n, secs)
            }
            OrderBody::Partial(f) | OrderBody::Filled(f) => self.on_fill(id, &f, secs),
            OrderBody::New => self.on_ack(id, false),
            OrderBody::Replaced => self.on_ack(id, true),
            OrderBody::Cancelled => self.on_done(id, OrderState::Cancelled, secs),
            OrderBody::NewRejected => self.on_done(id, OrderState::NewRejected, secs),
            OrderBody::ReplaceRejected => self.on_done(id, OrderState::ReplaceRejected, secs),
            OrderBody::RiskRejected => {
                let Some(ord) = self.orders.get_mut(&id) else {
                    warn!(cl_ord_id = id, "risk_rejected for unknown order");
                    return OrderOutcome::Dropped("missing_order");
                };
                ord.state = OrderState::RiskRejected;
                update_pos(&mut self.book, ord, secs);
                OrderOutcome::Applied
            }
        }
    }

    fn on_new_order(&mut self, id: OrderId, state: OrderState, n: NewOrder, secs: &SecurityStore) -> OrderOutcome {
        if !secs.contains(n.security_id) {
            warn!(cl_ord_id = id, security_id = n.security_id, "not found security");
            return OrderOutcome::Dropped("unknown_security");
        }
        let orig_id = match state {
            OrderState::UnconfirmedReplace => n.orig_cl_ord_id,
            _ => None,
        };
        let ord = Order {
            id,
            orig_id,
            state,
            security_id: n.security_id,
            acc: n.acc,
            side: n.side,
            ord_type: n.ord_type,
            qty: n.qty,
            px: n.px,
            cum_qty: 0.0,
            avg_px: 0.0,
            last_qty: 0.0,
            last_px: 0.0,
        };
        self.orders.insert(id, ord);
        ORDERS_TRACKED.set(self.orders.len() as i64);
        if let Some(ord) = self.orders.get(&id) {
            update_pos(&mut self.book, ord, secs);
        }
        OrderOutcome::Applied
    }

    fn on_fill(&mut self, id: OrderId, f: &Fill, secs: &SecurityStore) -> OrderOutcome {
        let Some(ord) = self.orders.get_mut(&id) else {
            warn!(cl_ord_id = id, "not found order for fill");
            return OrderOutcome::Dropped("missing_order");
        };
        // trade bust -> qty negatif
        let qty = if f.exec_trans_type.eq_ignore_ascii_case("cancel") { -f.qty } else { f.qty };
        let cum = ord.cum_qty + qty;
        ord.avg_px = if cum != 0.0 { (ord.cum_qty * ord.avg_px + qty * f.px) / cum } else { 0.0 };
        ord.cum_qty = cum;
        if ord.cum_qty > ord.qty {
            warn!(cl_ord_id = id, cum_qty = ord.cum_qty, qty = ord.qty, "overfill found");
        }
        ord.last_qty = qty;
        ord.last_px = f.px;
        ord.state = if ord.cum_qty >= ord.qty { OrderState::Filled } else { OrderState::Partial };
        update_pos(&mut self.book, ord, secs);
        OrderOutcome::Applied
    }

    fn on_ack(&mut self, id: OrderId, replaced: bool) -> OrderOutcome {
        let Some(ord) = self.orders.get_mut(&id) else {
            warn!(cl_ord_id = id, "can not find order for ack");
            return OrderOutcome::Dropped("missing_order");
        };
        if !replaced {
            ord.state = OrderState::New;
            return OrderOutcome::Applied;
        }
        ord.state = OrderState::Confirmed;
        let orig = ord.orig_id;
        match orig.and_then(|o| self.orders.get_mut(&o)) {
            Some(old) => old.state = OrderState::Replaced,
            None => warn!(cl_ord_id = id, orig_cl_ord_id = ?orig, "can not find replaced order"),
        }
        OrderOutcome::Applied
    }

    /// Cancel / reject: outstanding is reversed only if the order was still live.
    fn on_done(&mut self, id: OrderId, state: OrderState, secs: &SecurityStore) -> OrderOutcome {
        let Some(ord) = self.orders.get_mut(&id) else {
            warn!(cl_ord_id = id, ?state, "can not find order");
            return OrderOutcome::Dropped("missing_order");
        };
        let was_live = ord.state.is_live();
        ord.state = state;
        if was_live {
            update_pos(&mut self.book, ord, secs);
        }
        OrderOutcome::Applied
    }
}

fn outstand(p: &mut Position, side: Side) -> &mut f64 {
    match side {
        Side::Buy => &mut p.outstand_buy_qty,
        Side::Sell => &mut p.outstand_sell_qty,
    }
}

fn clamp_outstand(v: &mut f64, ord: &Order) {
    if *v < 0.0 {
        warn!(cl_ord_id = ord.id, outstand = *v, "outstand < 0, clamped");
        *v = 0.0;
    }
}

/// Position step driven by the order's (already updated) state.
fn update_pos(book: &mut PositionBook, ord: &Order, secs: &SecurityStore) {
    let Some(point_value) = secs.get(ord.security_id).map(|s| s.point_value()) else {
        return;
    };
    let Some(p) = book.get_or_create(ord.acc, ord.security_id, secs) else {
        return;
    };
    match ord.state {
        OrderState::Unconfirmed | OrderState::UnconfirmedReplace => {
            *outstand(p, ord.side) += ord.qty - ord.cum_qty;
        }
        OrderState::Partial | OrderState::Filled => {
            if ord.last_qty > 0.0 && !ord.ord_type.eq_ignore_ascii_case("otc") {
                let o = outstand(p, ord.side);
                *o -= ord.last_qty;
                clamp_outstand(o, ord);
            }
            apply_fill(p, ord.side, ord.last_qty, ord.last_px, point_value);
        }
        _ => {
            let o = outstand(p, ord.side);
            *o -= ord.qty - ord.cum_qty;
            clamp_outstand(o, ord);
        }
    }
}

/// Net position / average price / realized PnL after one execution.
pub fn apply_fill(p: &mut Position, side: Side, last_qty: f64, px: f64, point_value: f64) {
    match side {
        Side::Buy => {
            p.buy_qty += last_qty;
            p.buy_value += last_qty * px;
        }
        Side::Sell => {
            p.sell_qty += last_qty;
            p.sell_value += last_qty * px;
        }
    }
    let qty = side.sign() * last_qty;
    let qty0 = p.cur.qty;
    let pos = &mut p.cur;
    if qty0 > 0.0 && qty < 0.0 {
        // sell menutup long
        if qty0 > -qty {
            pos.realized_pnl += (px - pos.avg_px) * -qty * point_value;
        } else {
            pos.realized_pnl += (px - pos.avg_px) * qty0 * point_value;
            pos.avg_px = px;
        }
    } else if qty0 < 0.0 && qty > 0.0 {
        // buy menutup short
        if -qty0 > qty {
            pos.realized_pnl += (pos.avg_px - px) * qty * point_value;
        } else {
            pos.realized_pnl += (pos.avg_px - px) * -qty0 * point_value;
            pos.avg_px = px;
        }
    } else {
        // arah sama / buka dari flat -> update avg cost
        let total = qty0 + qty;
        if total != 0.0 {
            pos.avg_px = (qty0 * pos.avg_px + qty * px) / total;
        }
    }
    pos.qty += qty;
}
