// ===============================
// src/refdata.rs (security master + live market fields)
// ===============================
use std::sync::Arc;

use ahash::AHashMap as HashMap;
use tracing::warn;

use crate::domain::{MdDelta, Security, SecurityId};

/// Reference data keyed by id, with a secondary (market, symbol) index.
///
/// Records are held behind `Arc` so evaluation snapshots are cheap; a market
/// data update copies the record only while a snapshot still holds it.
#[derive(Debug, Default)]
pub struct SecurityStore {
    by_id: HashMap<SecurityId, Arc<Security>>,
    by_market: HashMap<String, HashMap<String, SecurityId>>,
}

impl SecurityStore {
    pub fn new() -> Self { Self::default() }

    /// Insert or replace the static part of a security. Live market fields survive.
    pub fn upsert(&mut self, mut sec: Security) {
        if sec.market == "CURRENCY" {
            sec.market = "FX".to_string();
        }
        if sec.multiplier <= 0.0 { sec.multiplier = 1.0; }
        if sec.rate <= 0.0 { sec.rate = 1.0; }

        if let Some(old) = self.by_id.get(&sec.id) {
            sec.md = old.md.clone();
            // symbol/market bisa berubah -> buang index lama
            if old.market != sec.market || old.symbol != sec.symbol {
                if let Some(m) = self.by_market.get_mut(&old.market) {
                    m.remove(&old.symbol);
                }
            }
        }
        self.by_market
            .entry(sec.market.clone())
            .or_default()
            .insert(sec.symbol.clone(), sec.id);
        self.by_id.insert(sec.id, Arc::new(sec));
    }

    pub fn get(&self, id: SecurityId) -> Option<&Arc<Security>> { self.by_id.get(&id) }

    pub fn contains(&self, id: SecurityId) -> bool { self.by_id.contains_key(&id) }

    pub fn by_symbol(&self, market: &str, symbol: &str) -> Option<&Arc<Security>> {
        let id = self.by_market.get(market)?.get(symbol)?;
        self.by_id.get(id)
    }

    pub fn len(&self) -> usize { self.by_id.len() }

    /// Apply one `md` delta. Unknown ids are logged and dropped.
    pub fn apply_md(&mut self, delta: &MdDelta) -> bool {
        let Some(sec) = self.by_id.get_mut(&delta.security_id) else {
            warn!(security_id = delta.security_id, "md for unknown security");
            return false;
        };
        let sec = Arc::make_mut(sec);
        for (code, v) in &delta.fields {
            if !sec.md.set(code, *v) {
                tracing::debug!(security_id = sec.id, %code, "unknown md field code");
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sec(id: SecurityId, symbol: &str, market: &str) -> Security {
        Security {
            id,
            symbol: symbol.into(),
            market: market.into(),
            multiplier: 0.0,
            rate: -1.0,
            prev_close: 10.0,
            ..Default::default()
        }
    }

    #[test]
    fn upsert_normalises_and_indexes() {
        let mut store = SecurityStore::new();
        store.upsert(sec(1, "EURUSD", "CURRENCY"));
        let s = store.by_symbol("FX", "EURUSD").unwrap();
        assert_eq!(s.id, 1);
        assert_eq!(s.multiplier, 1.0);
        assert_eq!(s.rate, 1.0);
        assert!(store.by_symbol("CURRENCY", "EURUSD").is_none());
    }

    #[test]
    fn md_survives_reference_upsert() {
        let mut store = SecurityStore::new();
        store.upsert(sec(1, "AAPL", "US"));
        let delta = MdDelta { security_id: 1, fields: vec![("c".into(), 12.5), ("b0".into(), 12.4)] };
        assert!(store.apply_md(&delta));
        store.upsert(sec(1, "AAPL", "US"));
        let s = store.get(1).unwrap();
        assert_eq!(s.close(), 12.5);
        assert_eq!(s.md.bid, 12.4);
    }

    #[test]
    fn snapshot_is_not_torn_by_md() {
        let mut store = SecurityStore::new();
        store.upsert(sec(1, "AAPL", "US"));
        let snap = store.get(1).unwrap().clone();
        store.apply_md(&MdDelta { security_id: 1, fields: vec![("c".into(), 11.0)] });
        assert_eq!(snap.close(), 10.0);
        assert_eq!(store.get(1).unwrap().close(), 11.0);
    }

    #[test]
    fn md_for_unknown_security_is_dropped() {
        let mut store = SecurityStore::new();
        assert!(!store.apply_md(&MdDelta { security_id: 99, fields: vec![("c".into(), 1.0)] }));
        assert_eq!(store.len(), 0);
    }
}
