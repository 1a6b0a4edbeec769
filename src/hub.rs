//! Fan-out hub (C7): per-connection preferences and the broadcast dispatch
//! loop. Grounded on `server/hub.py` and, for the axum/WebSocket plumbing,
//! `odds-processor::network::stream`.

use crate::engine::{ArbRecord, EvRecord};
use crate::filters::{arb_matches, ev_matches, FilterSets, RawFilters};
use crate::transform::{filter_grouped_raw_odds, group_ev_list};
use crate::types::GroupedBooks;
use axum::extract::ws::Message;
use dashmap::DashMap;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::mpsc;

/// Lock-free-ish single-writer/many-reader odds-format handle: the control
/// endpoint writes it on an `odds_format` control message, SSE workers read
/// it on every reconnect. Plain `Arc<RwLock<String>>` rather than a crate
/// like `arc-swap` — the teacher's dependency set has no such crate and
/// reads here are infrequent (once per SSE reconnect), so a stdlib lock
/// is sufficient.
pub type OddsFormatHolder = Arc<RwLock<String>>;

pub fn new_odds_format_holder(default: &str) -> OddsFormatHolder {
    Arc::new(RwLock::new(default.to_string()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProdType {
    Ev,
    Arbitrage,
    All,
}

impl ProdType {
    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "ev" => Some(Self::Ev),
            "arbitrage" => Some(Self::Arbitrage),
            "all" => Some(Self::All),
            _ => None,
        }
    }
}

pub struct ConnectionPrefs {
    pub prod_type: ProdType,
    pub ev_threshold: f64,
    pub arb_threshold: f64,
    pub odds_format: String,
    pub odds_holder: OddsFormatHolder,
    pub filters: RawFilters,
    pub quiet_controls: bool,
    pub debug_scope: bool,
    pub include_filters_in_payload: bool,
    pub sender: mpsc::UnboundedSender<Message>,
}

/// Classification of an emitted payload, mirroring `Hub.broadcast`'s
/// `is_arb`/`is_ev_payload` inspection of the inner dict.
pub enum Broadcast {
    Ev(Vec<EvRecord>),
    Arbitrage(ArbRecord),
    Raw(GroupedBooks),
}

pub struct Hub {
    pub connections: DashMap<u64, ConnectionPrefs>,
    next_id: AtomicU64,
    fx_participants: Mutex<HashMap<String, (String, String)>>,
    pub default_odds_format: String,
    pub default_ev_threshold: f64,
    pub default_arb_threshold: f64,
    pub ws_debug: bool,
}

impl Hub {
    pub fn new(default_odds_format: String, default_ev_threshold: f64, default_arb_threshold: f64, ws_debug: bool) -> Self {
        Self {
            connections: DashMap::new(),
            next_id: AtomicU64::new(1),
            fx_participants: Mutex::new(HashMap::new()),
            default_odds_format,
            default_ev_threshold,
            default_arb_threshold,
            ws_debug,
        }
    }

    pub fn connect(&self, sender: mpsc::UnboundedSender<Message>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.connections.insert(
            id,
            ConnectionPrefs {
                prod_type: ProdType::All,
                ev_threshold: 0.0,
                arb_threshold: 0.0,
                odds_format: self.default_odds_format.clone(),
                odds_holder: new_odds_format_holder(&self.default_odds_format),
                filters: RawFilters::default(),
                quiet_controls: true,
                debug_scope: false,
                include_filters_in_payload: false,
                sender,
            },
        );
        id
    }

    pub fn disconnect(&self, id: u64) {
        self.connections.remove(&id);
    }

    pub fn set_prod_type(&self, id: u64, prod_type: &str) {
        if let Some(pt) = ProdType::parse(prod_type) {
            if let Some(mut c) = self.connections.get_mut(&id) {
                c.prod_type = pt;
            }
        }
    }

    pub fn set_odds_format(&self, id: u64, odds_format: &str) {
        if let Some(mut c) = self.connections.get_mut(&id) {
            c.odds_format = odds_format.to_string();
            *c.odds_holder.write().unwrap() = odds_format.to_string();
        }
    }

    pub fn set_ev_threshold(&self, id: u64, value: f64) {
        if let Some(mut c) = self.connections.get_mut(&id) {
            c.ev_threshold = value;
        }
    }

    pub fn set_arb_threshold(&self, id: u64, value: f64) {
        if let Some(mut c) = self.connections.get_mut(&id) {
            c.arb_threshold = value;
        }
    }

    /// Replace filter axes present in `updates`; `reset` clears all four first.
    pub fn update_filters(&self, id: u64, updates: &Value, reset: bool) {
        if let Some(mut c) = self.connections.get_mut(&id) {
            if reset {
                c.filters = RawFilters::default();
            }
            if let Some(v) = updates.get("sport") {
                c.filters.sport = v.clone();
            }
            if let Some(v) = updates.get("market") {
                c.filters.market = v.clone();
            }
            if let Some(v) = updates.get("sportsbook").or_else(|| updates.get("sportbook")) {
                c.filters.sportsbook = v.clone();
            }
            if let Some(v) = updates.get("league") {
                c.filters.league = v.clone();
            }
        }
    }

    fn filters_echo(fs: &FilterSets) -> Value {
        fn sorted(s: &std::collections::HashSet<String>) -> Vec<&String> {
            let mut v: Vec<&String> = s.iter().collect();
            v.sort();
            v
        }
        json!({
            "sport": sorted(&fs.sport),
            "market": sorted(&fs.market_raw),
            "sportsbook": sorted(&fs.sportsbook_raw),
            "league": sorted(&fs.league_raw),
        })
    }

    fn send(&self, id: u64, c: &ConnectionPrefs, value: Value) -> bool {
        if self.ws_debug {
            tracing::debug!(connection = id, "hub send {}", value);
        }
        c.sender.send(Message::Text(value.to_string())).is_ok()
    }

    /// Dispatch a classified payload to every matching connection. Send
    /// failures mark the connection for removal after the loop.
    pub fn broadcast(&self, msg: &Broadcast) {
        if self.ws_debug {
            tracing::debug!(
                "broadcast/receive is_ev={} is_arb={}",
                matches!(msg, Broadcast::Ev(_)),
                matches!(msg, Broadcast::Arbitrage(_))
            );
        }

        let ids: Vec<u64> = self.connections.iter().map(|e| *e.key()).collect();
        let mut dead = Vec::new();

        for id in ids {
            let sent_ok = {
                let c = match self.connections.get(&id) {
                    Some(c) => c,
                    None => continue,
                };
                let fs = FilterSets::from_prefs(&c.filters);

                match c.prod_type {
                    ProdType::All => match msg {
                        Broadcast::Ev(list) => {
                            let survivors: Vec<&EvRecord> = list.iter().filter(|e| ev_matches(e, &fs)).collect();
                            if survivors.is_empty() {
                                true
                            } else {
                                let mut fx = self.fx_participants.lock().unwrap();
                                let owned: Vec<EvRecord> = survivors.into_iter().cloned().collect();
                                let grouped = group_ev_list(&owned, &mut fx);
                                let mut out = json!({"payload": grouped});
                                if c.include_filters_in_payload {
                                    out["filters"] = Self::filters_echo(&fs);
                                }
                                self.send(id, &c, out)
                            }
                        }
                        Broadcast::Arbitrage(arb) => {
                            if arb_matches(arb, &fs) {
                                let mut out = json!({"payload": {"arbitrage": arb}});
                                if c.include_filters_in_payload {
                                    out["filters"] = Self::filters_echo(&fs);
                                }
                                self.send(id, &c, out)
                            } else {
                                true
                            }
                        }
                        Broadcast::Raw(obj) => match filter_grouped_raw_odds(obj, &fs) {
                            Some(filtered) => {
                                let mut out = json!({"payload": filtered});
                                if c.include_filters_in_payload {
                                    out["filters"] = Self::filters_echo(&fs);
                                }
                                self.send(id, &c, out)
                            }
                            None => true,
                        },
                    },
                    ProdType::Arbitrage => match msg {
                        Broadcast::Arbitrage(arb) => {
                            let threshold = if c.arb_threshold > 0.0 { c.arb_threshold } else { self.default_arb_threshold };
                            if arb.arbitrage_percent >= threshold && arb_matches(arb, &fs) {
                                self.send(id, &c, json!({"filters": Self::filters_echo(&fs), "payload": {"arbitrage": arb}}))
                            } else {
                                true
                            }
                        }
                        _ => true,
                    },
                    ProdType::Ev => match msg {
                        Broadcast::Ev(list) => {
                            let threshold = if c.ev_threshold > 0.0 { c.ev_threshold } else { self.default_ev_threshold };
                            let survivors: Vec<EvRecord> = list
                                .iter()
                                .filter(|e| ev_matches(e, &fs))
                                .filter(|e| threshold <= 0.0 || e.ev_value >= threshold)
                                .cloned()
                                .collect();
                            if survivors.is_empty() {
                                true
                            } else {
                                let mut fx = self.fx_participants.lock().unwrap();
                                let grouped = group_ev_list(&survivors, &mut fx);
                                let mut out = json!({"payload": grouped});
                                if c.include_filters_in_payload {
                                    out["filters"] = Self::filters_echo(&fs);
                                }
                                self.send(id, &c, out)
                            }
                        }
                        _ => true,
                    },
                }
            };
            if !sent_ok {
                dead.push(id);
            }
        }

        for id in dead {
            self.connections.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{ArbOutcome, ArbRecord};

    fn test_ev(sport: &str, ev_value: f64) -> EvRecord {
        EvRecord {
            sport: sport.into(),
            fixture_id: "f1".into(),
            market: "moneyline".into(),
            market_base: "Moneyline".into(),
            market_type: "".into(),
            league: "nba".into(),
            home_team: "Lakers".into(),
            away_team: "Celtics".into(),
            start_date: None,
            name: "Lakers".into(),
            price: 2.1,
            sportsbook: "BookA".into(),
            is_live: false,
            ev_value,
            deep_link: "".into(),
        }
    }

    #[tokio::test]
    async fn ev_threshold_gates_ev_prod_type() {
        let hub = Hub::new("decimal".into(), 3.0, 3.0, false);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = hub.connect(tx);
        hub.set_prod_type(id, "ev");
        hub.set_ev_threshold(id, 5.0);

        hub.broadcast(&Broadcast::Ev(vec![test_ev("basketball", 2.0)]));
        assert!(rx.try_recv().is_err());

        hub.broadcast(&Broadcast::Ev(vec![test_ev("basketball", 6.0)]));
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn arbitrage_prod_type_ignores_ev_payloads() {
        let hub = Hub::new("decimal".into(), 3.0, 3.0, false);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = hub.connect(tx);
        hub.set_prod_type(id, "arbitrage");

        hub.broadcast(&Broadcast::Ev(vec![test_ev("basketball", 50.0)]));
        assert!(rx.try_recv().is_err());

        let arb = ArbRecord {
            sport: "basketball".into(),
            fixture_id: "f1".into(),
            market_name: "moneyline".into(),
            is_live: false,
            outcomes: vec![ArbOutcome { name: "Lakers".into(), sports_book_name: "booka".into(), price: 2.2 }],
            total_implied_percent: 90.0,
            arbitrage_percent: 10.0,
        };
        hub.broadcast(&Broadcast::Arbitrage(arb));
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn disconnect_removes_connection() {
        let hub = Hub::new("decimal".into(), 3.0, 3.0, false);
        let (tx, _rx) = mpsc::unbounded_channel();
        let id = hub.connect(tx);
        assert_eq!(hub.connections.len(), 1);
        hub.disconnect(id);
        assert_eq!(hub.connections.len(), 0);
    }
}
