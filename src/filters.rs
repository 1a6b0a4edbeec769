//! Per-connection filter predicates (part of C7).
//!
//! Grounded on `server/filters.py`: one `FilterSets` built per broadcast from
//! a connection's raw prefs, then matched against EV/arbitrage records and
//! the grouped raw-odds tree.

use crate::engine::{ArbRecord, EvRecord};
use crate::normalize::{canonical_market, normalize_filter_values, normalize_league_alias};
use serde_json::Value;
use std::collections::HashSet;

pub fn norm_clean(s: &str) -> String {
    s.chars().filter(|c| c.is_ascii_alphanumeric()).flat_map(|c| c.to_lowercase()).collect()
}

#[derive(Debug, Clone, Default)]
pub struct FilterSets {
    pub sport: HashSet<String>,
    pub market_raw: HashSet<String>,
    pub market_norm: HashSet<String>,
    pub sportsbook_raw: HashSet<String>,
    pub sportsbook_clean: HashSet<String>,
    pub league_raw: HashSet<String>,
    pub league_clean: HashSet<String>,
}

/// Raw per-connection filter axes, prior to normalisation.
#[derive(Debug, Clone, Default)]
pub struct RawFilters {
    pub sport: Value,
    pub market: Value,
    pub sportsbook: Value,
    pub league: Value,
}

impl FilterSets {
    pub fn from_prefs(filters: &RawFilters) -> Self {
        let sport = normalize_filter_values(&filters.sport);
        let market_raw = normalize_filter_values(&filters.market);
        let sportsbook_raw = normalize_filter_values(&filters.sportsbook);
        let league_raw = normalize_filter_values(&filters.league);
        Self {
            market_norm: market_raw.iter().map(|v| canonical_market(v)).collect(),
            sportsbook_clean: sportsbook_raw.iter().map(|v| norm_clean(v)).collect(),
            league_clean: league_raw.iter().map(|v| normalize_league_alias(v)).collect(),
            sport,
            market_raw,
            sportsbook_raw,
            league_raw,
        }
    }
}

pub fn ev_matches(e: &EvRecord, fs: &FilterSets) -> bool {
    if !fs.sport.is_empty() && !fs.sport.contains(&e.sport.to_lowercase()) {
        return false;
    }
    if !fs.market_raw.is_empty() {
        let v_norm = canonical_market(&e.market);
        if !(fs.market_norm.contains(&v_norm) || fs.market_norm.iter().any(|fm| !fm.is_empty() && v_norm.contains(fm))) {
            return false;
        }
    }
    if !fs.sportsbook_raw.is_empty() {
        let v = norm_clean(&e.sportsbook);
        if !(fs.sportsbook_clean.contains(&v) || fs.sportsbook_clean.iter().any(|fv| !fv.is_empty() && v.contains(fv))) {
            return false;
        }
    }
    if !fs.league_raw.is_empty() {
        let v_clean = normalize_league_alias(&e.league);
        if !fs.league_clean.iter().any(|lv| !lv.is_empty() && (v_clean.contains(lv) || lv.contains(&v_clean))) {
            return false;
        }
    }
    true
}

pub fn arb_matches(a: &ArbRecord, fs: &FilterSets) -> bool {
    if !fs.sport.is_empty() && !fs.sport.contains(&a.sport.to_lowercase()) {
        return false;
    }
    if !fs.market_raw.is_empty() {
        let v_norm = canonical_market(&a.market_name);
        if !(fs.market_norm.contains(&v_norm) || fs.market_norm.iter().any(|fm| !fm.is_empty() && v_norm.contains(fm))) {
            return false;
        }
    }
    if !fs.sportsbook_raw.is_empty() {
        let ok = a.outcomes.iter().any(|o| {
            let sbn = norm_clean(&o.sports_book_name);
            fs.sportsbook_clean.contains(&sbn) || fs.sportsbook_clean.iter().any(|fv| !fv.is_empty() && sbn.contains(fv))
        });
        if !ok {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ev(sport: &str, market: &str, sb: &str, league: &str) -> EvRecord {
        EvRecord {
            sport: sport.into(),
            fixture_id: "f1".into(),
            market: market.into(),
            market_base: market.into(),
            market_type: "".into(),
            league: league.into(),
            home_team: "A".into(),
            away_team: "B".into(),
            start_date: None,
            name: "A".into(),
            price: 2.0,
            sportsbook: sb.into(),
            is_live: false,
            ev_value: 5.0,
            deep_link: "".into(),
        }
    }

    #[test]
    fn empty_filters_match_everything() {
        let fs = FilterSets::from_prefs(&RawFilters::default());
        assert!(ev_matches(&ev("basketball", "Moneyline", "BookA", "NBA"), &fs));
    }

    #[test]
    fn sport_filter_excludes_mismatch() {
        let filters = RawFilters { sport: json!("football"), ..Default::default() };
        let fs = FilterSets::from_prefs(&filters);
        assert!(!ev_matches(&ev("basketball", "Moneyline", "BookA", "NBA"), &fs));
        assert!(ev_matches(&ev("football", "Moneyline", "BookA", "NFL"), &fs));
    }

    #[test]
    fn market_filter_uses_canonical_substring() {
        let filters = RawFilters { market: json!("1st quarter"), ..Default::default() };
        let fs = FilterSets::from_prefs(&filters);
        assert!(ev_matches(&ev("basketball", "First Quarter Moneyline", "BookA", "NBA"), &fs));
        assert!(!ev_matches(&ev("basketball", "Second Quarter Moneyline", "BookA", "NBA"), &fs));
    }
}
