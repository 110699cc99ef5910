// ===============================
// src/domain.rs
// ===============================
use serde::{Deserialize, Deserializer, Serialize};

pub type SecurityId = i64;
pub type AccountId = i64;
pub type UserId = i64;
pub type OrderId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Side { Buy, Sell }
impl Side { pub fn sign(&self) -> f64 { match self { Side::Buy => 1.0, Side::Sell => -1.0 } } }

// upstream kirim "buy" / "sell" / "short" ... semua selain buy dianggap sell
impl<'de> Deserialize<'de> for Side {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        Ok(if s.eq_ignore_ascii_case("buy") { Side::Buy } else { Side::Sell })
    }
}

/// Live market fields, updated by `md` deltas.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MarketData {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub qty: f64,
    pub vol: f64,
    pub vwap: f64,
    pub ask: f64,
    pub bid: f64,
    pub ask_size: f64,
    pub bid_size: f64,
}

impl MarketData {
    /// Apply one field code from an `md` delta. Returns false for unknown codes.
    pub fn set(&mut self, code: &str, v: f64) -> bool {
        let slot = match code {
            "o" => &mut self.open,
            "h" => &mut self.high,
            "l" => &mut self.low,
            "c" => &mut self.close,
            "q" => &mut self.qty,
            "v" => &mut self.vol,
            "V" => &mut self.vwap,
            "a0" => &mut self.ask,
            "b0" => &mut self.bid,
            "A0" => &mut self.ask_size,
            "B0" => &mut self.bid_size,
            _ => return false,
        };
        *slot = v;
        true
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Security {
    pub id: SecurityId,
    pub symbol: String,
    #[serde(default)] pub local_symbol: String,
    #[serde(default)] pub bbgid: String,
    #[serde(default)] pub cusip: String,
    #[serde(default)] pub sedol: String,
    #[serde(default)] pub isin: String,
    pub market: String,
    #[serde(rename = "type")] pub sec_type: String,
    pub multiplier: f64,
    pub prev_close: f64,
    pub rate: f64,
    pub currency: String,
    #[serde(default)] pub adv20: f64,
    #[serde(default)] pub market_cap: f64,
    #[serde(default)] pub sector: String,
    #[serde(default)] pub industry_group: String,
    #[serde(default)] pub industry: String,
    #[serde(default)] pub sub_industry: String,
    #[serde(skip)] pub md: MarketData,
}

impl Security {
    /// Live close, or previous close while no trade has printed yet.
    pub fn close(&self) -> f64 {
        if self.md.close > 0.0 { self.md.close } else { self.prev_close }
    }

    /// Contract value of one price point in account currency.
    pub fn point_value(&self) -> f64 { self.rate * self.multiplier }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderState {
    Unconfirmed,
    UnconfirmedReplace,
    New,
    Replaced,
    Confirmed,
    Partial,
    Filled,
    Cancelled,
    NewRejected,
    ReplaceRejected,
    RiskRejected,
}

impl OrderState {
    /// Live order = exposure still counted as outstanding.
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            OrderState::Unconfirmed
                | OrderState::UnconfirmedReplace
                | OrderState::Partial
                | OrderState::New
        )
    }
}

#[derive(Debug, Clone)]
pub struct Order {
    pub id: OrderId,
    pub orig_id: Option<OrderId>,
    pub state: OrderState,
    pub security_id: SecurityId,
    pub acc: AccountId,
    pub side: Side,
    pub ord_type: String,
    pub qty: f64,
    pub px: f64,
    pub cum_qty: f64,
    pub avg_px: f64,
    pub last_qty: f64,
    pub last_px: f64,
}

// Inventory structures
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PositionBase { pub qty: f64, pub avg_px: f64, pub realized_pnl: f64 }

#[derive(Debug, Clone, Default, Serialize)]
pub struct Position {
    pub acc: AccountId,
    pub security_id: SecurityId,
    pub cur: PositionBase,
    pub bod: PositionBase,
    pub outstand_buy_qty: f64,
    pub outstand_sell_qty: f64,
    pub buy_qty: f64,
    pub buy_value: f64,
    pub sell_qty: f64,
    pub sell_value: f64,
}

impl Position {
    pub fn new(acc: AccountId, security_id: SecurityId) -> Self {
        Self { acc, security_id, ..Default::default() }
    }
}

// ---------- decoded upstream events ----------

#[derive(Debug, Clone, Deserialize)]
pub struct BodRecord {
    pub acc: AccountId,
    pub security_id: SecurityId,
    pub qty: f64,
    pub avg_px: f64,
    #[serde(default)] pub realized_pnl: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MdDelta {
    pub security_id: SecurityId,
    pub fields: Vec<(String, f64)>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserSubAccount {
    pub user_id: UserId,
    pub acc: AccountId,
    pub acc_name: String,
    // "action" sudah dipakai sebagai tag Event
    #[serde(default, rename = "sub_action")] pub action: Option<String>,
}

/// Body of an order-lifecycle event; the fields carried depend on the state.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum OrderBody {
    Unconfirmed(NewOrder),
    UnconfirmedReplace(NewOrder),
    New,
    Replaced,
    Partial(Fill),
    Filled(Fill),
    Cancelled,
    NewRejected,
    ReplaceRejected,
    RiskRejected,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewOrder {
    pub security_id: SecurityId,
    pub acc: AccountId,
    pub qty: f64,
    pub px: f64,
    pub side: Side,
    #[serde(default)] pub ord_type: String,
    #[serde(default)] pub orig_cl_ord_id: Option<OrderId>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Fill {
    pub qty: f64,
    pub px: f64,
    #[serde(default)] pub exec_trans_type: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrderEvent {
    pub cl_ord_id: OrderId,
    pub seq: i64,
    #[serde(flatten)] pub body: OrderBody,
}

/// Upstream record, already decoded. `Order` = offline backlog, `order` = online live stream.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action")]
pub enum Event {
    #[serde(rename = "security")] Security(Security),
    #[serde(rename = "bod")] Bod(BodRecord),
    #[serde(rename = "Order")] OrderBacklog(OrderEvent),
    #[serde(rename = "order")] Order(OrderEvent),
    #[serde(rename = "offline")] Offline { status: String },
    #[serde(rename = "md")] Md { deltas: Vec<MdDelta> },
    #[serde(rename = "user_sub_account")] UserSubAccount(UserSubAccount),
}

impl Event {
    pub fn action(&self) -> &'static str {
        match self {
            Event::Security(_) => "security",
            Event::Bod(_) => "bod",
            Event::OrderBacklog(_) => "Order",
            Event::Order(_) => "order",
            Event::Offline { .. } => "offline",
            Event::Md { .. } => "md",
            Event::UserSubAccount(_) => "user_sub_account",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_falls_back_to_prev_close() {
        let mut s = Security { prev_close: 9.5, ..Default::default() };
        assert_eq!(s.close(), 9.5);
        s.md.close = 10.0;
        assert_eq!(s.close(), 10.0);
    }

    #[test]
    fn decodes_fill_event() {
        let raw = r#"{"action":"order","cl_ord_id":7,"seq":3,"state":"partial","qty":10,"px":1.5}"#;
        let ev: Event = serde_json::from_str(raw).unwrap();
        match ev {
            Event::Order(OrderEvent { cl_ord_id, seq, body: OrderBody::Partial(f) }) => {
                assert_eq!((cl_ord_id, seq), (7, 3));
                assert_eq!(f.qty, 10.0);
                assert_eq!(f.px, 1.5);
                assert!(f.exec_trans_type.is_empty());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn decodes_backlog_new_order_and_side() {
        let raw = r#"{"action":"Order","cl_ord_id":1,"seq":1,"state":"unconfirmed",
            "security_id":5,"acc":2,"qty":100,"px":10,"side":"short"}"#;
        let ev: Event = serde_json::from_str(raw).unwrap();
        let Event::OrderBacklog(OrderEvent { body: OrderBody::Unconfirmed(n), .. }) = ev else {
            panic!("expected backlog unconfirmed");
        };
        assert_eq!(n.side, Side::Sell);
        assert_eq!(n.orig_cl_ord_id, None);
    }

    #[test]
    fn live_states() {
        assert!(OrderState::New.is_live());
        assert!(OrderState::UnconfirmedReplace.is_live());
        assert!(!OrderState::Confirmed.is_live());
        assert!(!OrderState::Filled.is_live());
    }
}
