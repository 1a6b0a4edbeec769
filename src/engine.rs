//! State engine (C4): per-(sport, fixture, market, live) best-price book, EV
//! and arbitrage derivation.
//!
//! Everything lives behind one coarse `Mutex`, matching the teacher's
//! single-lock `AppState` pattern (`odds-engine::main::AppState`) rather than
//! a sharded design — see DESIGN.md for why a per-key actor split was not
//! taken up.

use crate::normalize::{clean_outcome_team_name, compose_market, is_nonexclusive_market, normalize_market};
use crate::odds::{extract_deep_link, extract_home_away, extract_league_name, extract_start_time, parse_decimal_odds};
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

#[derive(Debug, Clone, Default)]
struct OutcomeBook {
    best_price: f64,
    best_book: Option<String>,
    prices: Vec<f64>,
}

#[derive(Debug, Clone, Default)]
pub struct FixtureMeta {
    pub home_team: Option<String>,
    pub away_team: Option<String>,
    pub start_date: Option<i64>,
    pub league: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct MarketKey {
    sport: String,
    fixture_id: String,
    market_norm: String,
    is_live: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct EvRecord {
    pub sport: String,
    pub fixture_id: String,
    pub market: String,
    pub market_base: String,
    pub market_type: String,
    pub league: String,
    pub home_team: String,
    pub away_team: String,
    pub start_date: Option<i64>,
    pub name: String,
    pub price: f64,
    pub sportsbook: String,
    pub is_live: bool,
    pub ev_value: f64,
    pub deep_link: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ArbOutcome {
    pub name: String,
    pub sports_book_name: String,
    pub price: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ArbRecord {
    pub sport: String,
    pub fixture_id: String,
    pub market_name: String,
    pub is_live: bool,
    pub outcomes: Vec<ArbOutcome>,
    pub total_implied_percent: f64,
    pub arbitrage_percent: f64,
}

/// Four-tuple cache key: (fixture_id, sportsbook_lower, market_lower, outcome_lower).
type EvCacheKey = (String, String, String, String);

/// Per-sportsbook and aggregate two-name participant pairs for a (fixture, market).
type ParticipantPairs = (HashMap<String, (String, String)>, Option<(String, String)>);

#[derive(Default)]
struct Inner {
    market_state: HashMap<MarketKey, HashMap<String, OutcomeBook>>,
    ev_cache: HashMap<EvCacheKey, f64>,
    fixture_meta: HashMap<String, FixtureMeta>,
    fixture_meta_fetched: HashSet<String>,
}

pub struct StateEngine {
    inner: Mutex<Inner>,
}

impl Default for StateEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn round3(v: f64) -> f64 {
    (v * 1000.0).round() / 1000.0
}

fn fixture_id_of(it: &Value) -> Option<String> {
    let raw = it
        .get("fixture_id")
        .or_else(|| it.get("event_id"))
        .or_else(|| it.get("fixture"))
        .or_else(|| it.get("match_id"))
        .or_else(|| it.get("id"))?;
    let resolved = if raw.is_object() {
        raw.get("id").or_else(|| raw.get("fixture_id"))?
    } else {
        raw
    };
    match resolved {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

impl StateEngine {
    pub fn new() -> Self {
        Self { inner: Mutex::new(Inner::default()) }
    }

    pub fn ev_cached(&self, fixture_id: &str, sportsbook: &str, market: &str, outcome: &str) -> Option<f64> {
        let key = (
            fixture_id.to_string(),
            sportsbook.trim().to_lowercase(),
            market.trim().to_lowercase(),
            outcome.trim().to_lowercase(),
        );
        self.inner.lock().unwrap().ev_cache.get(&key).copied()
    }

    pub fn fixture_meta(&self, fixture_id: &str) -> Option<FixtureMeta> {
        self.inner.lock().unwrap().fixture_meta.get(fixture_id).cloned()
    }

    /// Record that `fixture_id`'s metadata has already had a catalogue backfill
    /// attempt scheduled, so callers don't refetch on every quote.
    pub fn mark_fixture_meta_fetch_attempted(&self, fixture_id: &str) -> bool {
        let mut guard = self.inner.lock().unwrap();
        guard.fixture_meta_fetched.insert(fixture_id.to_string())
    }

    pub fn needs_fixture_meta(&self, fixture_id: &str) -> bool {
        let guard = self.inner.lock().unwrap();
        !guard.fixture_meta.contains_key(fixture_id)
    }

    /// Merge catalogue-sourced fixture metadata, preferring existing values
    /// (first write wins, matching the Python `setdefault`/or-assign mix).
    pub fn merge_fixture_meta(&self, fixture_id: &str, home: Option<String>, away: Option<String>, start_date: Option<i64>, league: Option<String>) {
        let mut guard = self.inner.lock().unwrap();
        let meta = guard.fixture_meta.entry(fixture_id.to_string()).or_default();
        if let Some(h) = home {
            meta.home_team = Some(h);
        }
        if let Some(a) = away {
            meta.away_team = Some(a);
        }
        if let Some(s) = start_date {
            meta.start_date = Some(s);
        }
        if let Some(l) = league {
            meta.league = Some(l);
        }
    }

    /// Single entry point: update state from a quote batch and return derived
    /// EV/arbitrage records.
    pub fn process_batch(&self, sport: &str, quotes: &[Value]) -> (Vec<EvRecord>, Vec<ArbRecord>) {
        let mut affected: HashSet<MarketKey> = HashSet::new();

        {
            let mut guard = self.inner.lock().unwrap();
            for it in quotes {
                let market = compose_market(it);
                let outcome = it.get("name").and_then(|v| v.as_str()).unwrap_or("").trim().to_string();
                let sb = it.get("sportsbook").and_then(|v| v.as_str());
                if market.is_empty() || outcome.is_empty() || sb.is_none() {
                    continue;
                }
                let sb = sb.unwrap().to_string();
                let odds = match parse_decimal_odds(it) {
                    Some(o) => o,
                    None => continue,
                };
                let fixture_id = match fixture_id_of(it) {
                    Some(f) => f,
                    None => continue,
                };
                let market_norm = normalize_market(&market);
                let is_live = it.get("is_live").and_then(|v| v.as_bool()).unwrap_or(false);
                let key = MarketKey { sport: sport.to_string(), fixture_id, market_norm, is_live };

                let book = guard.market_state.entry(key.clone()).or_default();
                let rec = book.entry(outcome).or_default();
                rec.prices.push(odds);
                if odds > rec.best_price {
                    rec.best_price = odds;
                    rec.best_book = Some(sb);
                }
                affected.insert(key);
            }
        }

        let mut ev_items = Vec::new();
        let mut arbitrages = Vec::new();

        for key in affected {
            self.derive_for_key(&key, quotes, &mut ev_items, &mut arbitrages);
        }
        (ev_items, arbitrages)
    }

    fn derive_for_key(&self, key: &MarketKey, items: &[Value], ev_items: &mut Vec<EvRecord>, arbitrages: &mut Vec<ArbRecord>) {
        let outcome_map = {
            let guard = self.inner.lock().unwrap();
            match guard.market_state.get(key) {
                Some(m) => m.clone(),
                None => return,
            }
        };

        let best: HashMap<String, (f64, Option<String>)> = outcome_map
            .iter()
            .filter(|(_, v)| v.best_price >= 1.01)
            .map(|(k, v)| (k.clone(), (v.best_price, v.best_book.clone())))
            .collect();

        let base_probs: HashMap<String, f64> =
            best.iter().filter(|(_, (p, _))| *p >= 1.01).map(|(k, (p, _))| (k.clone(), 1.0 / p)).collect();

        let fair_probs = compute_fair_probs(&base_probs, &key.market_norm);

        if let Some((total_implied, arb_pct)) = compute_arbitrage(&best) {
            let mut ordered: Vec<(&String, &(f64, Option<String>))> = best.iter().collect();
            ordered.sort_by(|a, b| b.1 .0.partial_cmp(&a.1 .0).unwrap());
            if ordered.len() >= 2 {
                arbitrages.push(ArbRecord {
                    sport: key.sport.clone(),
                    fixture_id: key.fixture_id.clone(),
                    market_name: key.market_norm.clone(),
                    is_live: key.is_live,
                    outcomes: ordered
                        .iter()
                        .map(|(name, (price, book))| ArbOutcome {
                            name: (*name).clone(),
                            sports_book_name: book.clone().unwrap_or_default(),
                            price: *price,
                        })
                        .collect(),
                    total_implied_percent: round3(total_implied * 100.0),
                    arbitrage_percent: round3(arb_pct),
                });
            }
        }

        if fair_probs.is_empty() {
            return;
        }

        let (participants_by_sb, agg_pair) = infer_participants(items, &key.fixture_id, &key.market_norm);

        for it in items {
            if fixture_id_of(it).as_deref() != Some(key.fixture_id.as_str()) {
                continue;
            }
            let market = compose_market(it);
            if normalize_market(&market) != key.market_norm {
                continue;
            }
            let outcome = it.get("name").and_then(|v| v.as_str()).unwrap_or("").trim().to_string();
            let fair_prob = match fair_probs.get(&outcome) {
                Some(p) => *p,
                None => continue,
            };
            let odds = match parse_decimal_odds(it) {
                Some(o) => o,
                None => continue,
            };
            let ev_pct = round3(compute_ev_pct(fair_prob, odds));

            if self.needs_fixture_meta(&key.fixture_id) {
                self.mark_fixture_meta_fetch_attempted(&key.fixture_id);
            }
            let meta = self.fixture_meta(&key.fixture_id).unwrap_or_default();
            let (mut home, mut away) = extract_home_away(it);

            if (meta.home_team.as_deref().or(home.as_deref()).is_none())
                || (meta.away_team.as_deref().or(away.as_deref()).is_none())
            {
                let sb = it.get("sportsbook").and_then(|v| v.as_str()).unwrap_or("").trim().to_lowercase();
                let pair = participants_by_sb.get(&sb).cloned().or_else(|| agg_pair.clone());
                if let Some((p0, p1)) = pair {
                    if meta.home_team.as_deref().or(home.as_deref()).is_none()
                        && meta.away_team.as_deref().or(away.as_deref()).is_none()
                    {
                        home = home.or(Some(p0));
                        away = away.or(Some(p1));
                    }
                }
            }

            if meta.home_team.as_deref().or(home.as_deref()).is_none()
                || meta.away_team.as_deref().or(away.as_deref()).is_none()
            {
                if let (Some(ih), Some(ia)) = infer_teams_from_outcomes(&outcome_map) {
                    if meta.home_team.as_deref().or(home.as_deref()).is_none() {
                        home = Some(ih.clone());
                    }
                    if meta.away_team.as_deref().or(away.as_deref()).is_none() {
                        away = Some(ia.clone());
                    }
                    self.merge_fixture_meta(&key.fixture_id, Some(ih), Some(ia), None, None);
                }
            }

            let link = extract_deep_link(it);
            let sportsbook = it.get("sportsbook").and_then(|v| v.as_str()).unwrap_or("").to_string();

            {
                let mut guard = self.inner.lock().unwrap();
                let cache_key = (
                    key.fixture_id.clone(),
                    sportsbook.trim().to_lowercase(),
                    key.market_norm.trim().to_lowercase(),
                    outcome.trim().to_lowercase(),
                );
                if !cache_key.0.is_empty() && !cache_key.1.is_empty() && !cache_key.2.is_empty() && !cache_key.3.is_empty() {
                    guard.ev_cache.insert(cache_key, ev_pct);
                }
            }

            ev_items.push(EvRecord {
                sport: key.sport.clone(),
                fixture_id: key.fixture_id.clone(),
                market: key.market_norm.clone(),
                market_base: it.get("market").and_then(|v| v.as_str()).or_else(|| it.get("market_name").and_then(|v| v.as_str())).unwrap_or("").trim().to_string(),
                market_type: it
                    .get("type")
                    .or_else(|| it.get("marketType"))
                    .or_else(|| it.get("market_type"))
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .trim()
                    .to_string(),
                league: meta.league.clone().or_else(|| extract_league_name(it)).unwrap_or_default(),
                home_team: meta.home_team.clone().or(home).unwrap_or_default(),
                away_team: meta.away_team.clone().or(away).unwrap_or_default(),
                start_date: meta.start_date.or_else(|| extract_start_time(it)),
                name: outcome,
                price: odds,
                sportsbook,
                is_live: key.is_live,
                ev_value: ev_pct,
                deep_link: link,
            });
        }
    }
}

fn compute_arbitrage(best: &HashMap<String, (f64, Option<String>)>) -> Option<(f64, f64)> {
    if best.len() < 2 {
        return None;
    }
    let total_implied: f64 = best.values().filter(|(o, _)| *o >= 1.01).map(|(o, _)| 1.0 / o).sum();
    if total_implied > 0.0 && total_implied < 1.0 {
        Some((total_implied, (1.0 - total_implied) * 100.0))
    } else {
        None
    }
}

fn compute_ev_pct(fair_prob: f64, offered_odds: f64) -> f64 {
    let fp = fair_prob.clamp(0.0, 1.0);
    let od = offered_odds.max(1.0);
    (fp * od - 1.0) * 100.0
}

/// Team-grouping fair probabilities, falling back to whole-market
/// normalisation for exclusive markets — spec §4.3 phase 2.
fn compute_fair_probs(base_probs: &HashMap<String, f64>, market_norm: &str) -> HashMap<String, f64> {
    let mut fair_probs = HashMap::new();
    if base_probs.is_empty() {
        return fair_probs;
    }

    let mut team_groups: HashMap<String, Vec<String>> = HashMap::new();
    for out in base_probs.keys() {
        let team = {
            let t = clean_outcome_team_name(out).to_lowercase();
            if t.is_empty() {
                out.trim().to_lowercase()
            } else {
                t
            }
        };
        team_groups.entry(team).or_default().push(out.clone());
    }

    for outs in team_groups.values() {
        if outs.len() < 2 {
            continue;
        }
        let total: f64 = outs.iter().filter_map(|o| base_probs.get(o)).sum();
        if (0.6..=2.0).contains(&total) {
            for o in outs {
                if let Some(bp) = base_probs.get(o) {
                    fair_probs.insert(o.clone(), bp / total);
                }
            }
        }
    }

    if fair_probs.is_empty() && base_probs.len() >= 2 {
        let total: f64 = base_probs.values().sum();
        if (0.6..=2.0).contains(&total) && !is_nonexclusive_market(market_norm) {
            for (o, bp) in base_probs {
                fair_probs.insert(o.clone(), bp / total);
            }
        }
    }

    fair_probs
}

/// Precompute, per-sportsbook and aggregate, the first two distinct
/// non-generic participant names seen for this (fixture, market) in the
/// batch, preferring names drawn from H2H-style markets.
fn infer_participants(items: &[Value], fixture_id: &str, market_norm: &str) -> ParticipantPairs {
    let mut by_sb: HashMap<String, Vec<String>> = HashMap::new();
    let mut agg_names: Vec<String> = Vec::new();

    for it in items {
        if fixture_id_of(it).as_deref() != Some(fixture_id) {
            continue;
        }
        let market = compose_market(it);
        if normalize_market(&market) != market_norm {
            continue;
        }
        let sb = it.get("sportsbook").and_then(|v| v.as_str()).unwrap_or("").trim().to_lowercase();
        let name = match it.get("name").or_else(|| it.get("outcome")).and_then(|v| v.as_str()) {
            Some(n) if !n.is_empty() => n.to_string(),
            _ => continue,
        };
        let low = name.trim().to_lowercase();
        if matches!(low.as_str(), "over" | "under" | "odd" | "even" | "yes" | "no") || low.starts_with("over ") || low.starts_with("under ") {
            continue;
        }
        let mk = it.get("market").and_then(|v| v.as_str()).unwrap_or("").to_lowercase();
        let entry = by_sb.entry(sb).or_default();
        if ["moneyline", "match winner", "matchwinner", "ml", "winner"].iter().any(|k| mk.contains(k)) {
            entry.insert(0, name.clone());
        } else {
            entry.push(name.clone());
        }
        agg_names.push(name);
    }

    let dedup_pair = |names: &[String]| -> Option<(String, String)> {
        let mut seen = HashSet::new();
        let mut uniq = Vec::new();
        for n in names {
            if seen.insert(n.clone()) {
                uniq.push(n.clone());
            }
            if uniq.len() >= 2 {
                break;
            }
        }
        if uniq.len() >= 2 {
            Some((uniq[0].clone(), uniq[1].clone()))
        } else {
            None
        }
    };

    let participants_by_sb: HashMap<String, (String, String)> =
        by_sb.into_iter().filter_map(|(sb, names)| dedup_pair(&names).map(|p| (sb, p))).collect();
    let agg_pair = dedup_pair(&agg_names);

    (participants_by_sb, agg_pair)
}

/// Up to two distinct team names derived from outcome labels, excluding
/// `{draw, tie, over, under}` — spec §4.3.1 step 3.
fn infer_teams_from_outcomes(outcome_map: &HashMap<String, OutcomeBook>) -> (Option<String>, Option<String>) {
    let skip: HashSet<&str> = ["draw", "tie", "over", "under"].into_iter().collect();
    let mut seen = HashSet::new();
    let mut uniq = Vec::new();
    for out in outcome_map.keys() {
        if out.trim().is_empty() {
            continue;
        }
        let cleaned = clean_outcome_team_name(out);
        if cleaned.is_empty() || skip.contains(cleaned.to_lowercase().as_str()) {
            continue;
        }
        let low = cleaned.to_lowercase();
        if seen.insert(low) {
            uniq.push(cleaned);
        }
        if uniq.len() >= 2 {
            break;
        }
    }
    if uniq.len() == 2 {
        (Some(uniq[0].clone()), Some(uniq[1].clone()))
    } else {
        (None, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn quote(fixture: &str, market: &str, name: &str, sb: &str, price: f64) -> Value {
        json!({
            "fixture_id": fixture,
            "market": market,
            "name": name,
            "sportsbook": sb,
            "decimal": price,
            "is_live": false,
        })
    }

    #[test]
    fn arbitrage_emitted_when_implied_under_one() {
        let engine = StateEngine::new();
        let quotes = vec![
            quote("f1", "Moneyline", "Lakers", "BookA", 2.2),
            quote("f1", "Moneyline", "Celtics", "BookB", 2.2),
        ];
        let (_, arbs) = engine.process_batch("basketball", &quotes);
        assert_eq!(arbs.len(), 1);
        assert!(arbs[0].arbitrage_percent > 0.0);
    }

    #[test]
    fn no_arbitrage_when_implied_over_one() {
        let engine = StateEngine::new();
        let quotes = vec![
            quote("f2", "Moneyline", "Lakers", "BookA", 1.5),
            quote("f2", "Moneyline", "Celtics", "BookB", 1.5),
        ];
        let (_, arbs) = engine.process_batch("basketball", &quotes);
        assert!(arbs.is_empty());
    }

    #[test]
    fn ev_emitted_for_two_way_market() {
        let engine = StateEngine::new();
        let quotes = vec![
            quote("f3", "Moneyline", "Lakers", "BookA", 2.1),
            quote("f3", "Moneyline", "Celtics", "BookB", 2.1),
        ];
        let (evs, _) = engine.process_batch("basketball", &quotes);
        assert_eq!(evs.len(), 2);
        for e in &evs {
            assert!(e.ev_value > 0.0);
        }
    }

    #[test]
    fn ev_cache_populated_after_batch() {
        let engine = StateEngine::new();
        let quotes = vec![
            quote("f4", "Moneyline", "Lakers", "BookA", 2.1),
            quote("f4", "Moneyline", "Celtics", "BookB", 2.1),
        ];
        engine.process_batch("basketball", &quotes);
        assert!(engine.ev_cached("f4", "BookA", "moneyline", "Lakers").is_some());
    }

    #[test]
    fn over_under_grouped_as_one_team() {
        let engine = StateEngine::new();
        let quotes = vec![
            quote("f5", "Total Points", "Over 220.5", "BookA", 1.95),
            quote("f5", "Total Points", "Under 220.5", "BookB", 1.95),
        ];
        let (evs, _) = engine.process_batch("basketball", &quotes);
        assert_eq!(evs.len(), 2);
    }

    #[test]
    fn missing_required_fields_skipped_silently() {
        let engine = StateEngine::new();
        let quotes = vec![json!({"market": "Moneyline", "name": "Lakers"})];
        let (evs, arbs) = engine.process_batch("basketball", &quotes);
        assert!(evs.is_empty());
        assert!(arbs.is_empty());
    }
}
