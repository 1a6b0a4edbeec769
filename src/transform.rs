//! Payload reshaping for the fan-out hub (C7), grounded on `server/transform.py`.

use crate::filters::FilterSets;
use crate::normalize::{canonical_market, normalize_league_alias};
use crate::engine::EvRecord;
use crate::types::{BookEntry, GameEntry, GroupedBooks, OddsEntry};
use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;

const GENERIC_TEAM_TOKENS: &[&str] = &["over", "under", "odd", "even", "yes", "no"];
const H2H_SPORTS: &[&str] = &["tennis", "table tennis", "table-tennis", "mma", "boxing"];

fn not_generic_team(s: &str) -> bool {
    let t = s.trim().to_lowercase();
    if t.is_empty() {
        return false;
    }
    if GENERIC_TEAM_TOKENS.contains(&t.as_str()) {
        return false;
    }
    if t.starts_with("over") || t.starts_with("under") {
        return false;
    }
    t.chars().any(|c| c.is_ascii_alphabetic())
}

fn base_name(n: &str) -> String {
    static OU_SUFFIX: OnceLock<Regex> = OnceLock::new();
    static SIGNED_NUM: OnceLock<Regex> = OnceLock::new();
    static MONEYLINE: OnceLock<Regex> = OnceLock::new();
    static PAREN: OnceLock<Regex> = OnceLock::new();
    let ou = OU_SUFFIX.get_or_init(|| Regex::new(r"(?i)\s+(?:over|under)\s+[+\-]?\d+(?:\.\d+)?$").unwrap());
    let signed = SIGNED_NUM.get_or_init(|| Regex::new(r"\s*[+\-]\d+(?:\.\d+)?$").unwrap());
    let ml = MONEYLINE.get_or_init(|| Regex::new(r"(?i)\s+moneyline$").unwrap());
    let paren = PAREN.get_or_init(|| Regex::new(r"\s+\([^)]*\)$").unwrap());

    let mut s = n.trim().to_string();
    if s.is_empty() {
        return s;
    }
    s = ou.replace(&s, "").into_owned();
    s = signed.replace(&s, "").into_owned();
    s = ml.replace(&s, "").into_owned();
    s = paren.replace(&s, "").into_owned();
    s.trim().to_string()
}

fn prefers_h2h(market: &str) -> bool {
    let m = market.to_lowercase();
    ["moneyline", "match winner", "matchwinner", "ml", "winner"].iter().any(|k| m.contains(k))
}

/// Infer the two H2H participant names from an accumulated odds list,
/// preferring names seen in H2H-style markets.
fn infer_h2h_names_from_odds(odds: &[OddsEntry]) -> Option<(String, String)> {
    let mut first = Vec::new();
    let mut rest = Vec::new();
    for o in odds {
        let raw = match &o.name {
            Some(n) if !n.is_empty() => n,
            _ => continue,
        };
        let low = raw.trim().to_lowercase();
        if GENERIC_TEAM_TOKENS.contains(&low.as_str()) || low.starts_with("over") || low.starts_with("under") {
            continue;
        }
        let base = base_name(raw);
        if base.is_empty() {
            continue;
        }
        if prefers_h2h(&o.market) {
            first.push(base);
        } else {
            rest.push(base);
        }
    }
    let mut seen = std::collections::HashSet::new();
    let mut uniq = Vec::new();
    for nm in first.into_iter().chain(rest) {
        let key = nm.to_lowercase();
        if seen.insert(key) {
            uniq.push(nm);
        }
        if uniq.len() == 2 {
            break;
        }
    }
    if uniq.len() >= 2 {
        Some((uniq[0].clone(), uniq[1].clone()))
    } else {
        None
    }
}

pub fn sport_display(s: &str) -> String {
    s.replace('_', " ")
        .split(' ')
        .map(|w| {
            let mut c = w.chars();
            match c.next() {
                Some(f) => f.to_uppercase().collect::<String>() + c.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Transform EV records into the grouped-by-sportsbook tree clients expect,
/// backfilling H2H participant names and caching them in `fx_participants`
/// for consistency across later broadcasts.
pub fn group_ev_list(ev_list: &[EvRecord], fx_participants: &mut HashMap<String, (String, String)>) -> GroupedBooks {
    let mut grouped: GroupedBooks = HashMap::new();

    for e in ev_list {
        let book = if e.sportsbook.trim().is_empty() { "Unknown".to_string() } else { e.sportsbook.trim().to_string() };
        let book_lower = book.to_lowercase();
        let league_disp = if e.league.len() <= 6 { e.league.to_uppercase() } else { e.league.clone() };

        let entry = grouped.entry(book.clone()).or_default();
        let idx = entry.data.iter().position(|g| g.id == e.fixture_id);
        let idx = match idx {
            Some(i) => i,
            None => {
                entry.data.push(GameEntry {
                    id: e.fixture_id.clone(),
                    home_team: if not_generic_team(&e.home_team) { e.home_team.clone() } else { String::new() },
                    away_team: if not_generic_team(&e.away_team) { e.away_team.clone() } else { String::new() },
                    sport: sport_display(&e.sport),
                    league: league_disp.clone(),
                    start_date: e.start_date,
                    odds: Vec::new(),
                });
                entry.data.len() - 1
            }
        };
        let game = &mut entry.data[idx];
        if game.home_team.is_empty() && not_generic_team(&e.home_team) {
            game.home_team = e.home_team.clone();
        }
        if game.away_team.is_empty() && not_generic_team(&e.away_team) {
            game.away_team = e.away_team.clone();
        }

        game.odds.push(OddsEntry {
            id: format!("{}:{}:{}:{}", e.fixture_id, book_lower, e.market, e.name.to_lowercase().replace(' ', "_")),
            market: e.market.trim().to_lowercase(),
            sports_book_name: book_lower,
            deep_link: e.deep_link.clone(),
            ev_value: Some(e.ev_value),
            name: Some(e.name.clone()),
            price: Some(e.price),
            has_been_posted: false,
            is_live: e.is_live,
        });

        if !not_generic_team(&game.home_team) {
            game.home_team.clear();
        }
        if !not_generic_team(&game.away_team) {
            game.away_team.clear();
        }
        let fxid = game.id.clone();
        if let Some((h, a)) = fx_participants.get(&fxid) {
            if game.home_team.is_empty() && game.away_team.is_empty() {
                game.home_team = h.clone();
                game.away_team = a.clone();
            }
        }
        if game.home_team.is_empty() && game.away_team.is_empty() {
            let sp = game.sport.trim().to_lowercase();
            if H2H_SPORTS.contains(&sp.as_str()) {
                if let Some((p1, p2)) = infer_h2h_names_from_odds(&game.odds) {
                    game.home_team = p1.clone();
                    game.away_team = p2.clone();
                    fx_participants.insert(fxid, (p1, p2));
                }
            }
        }
    }

    grouped
}

/// Apply a connection's filters to an incoming grouped-odds payload, dropping
/// books/games/odds that don't match. `None` when nothing survives.
pub fn filter_grouped_raw_odds(obj: &GroupedBooks, fs: &FilterSets) -> Option<GroupedBooks> {
    let league_match = |lg: &str| -> bool {
        if fs.league_raw.is_empty() {
            return true;
        }
        let l = normalize_league_alias(lg);
        fs.league_clean.iter().any(|fl| !fl.is_empty() && (l.contains(fl) || fl.contains(&l)))
    };
    let sport_match = |sp: &str| -> bool { fs.sport.is_empty() || fs.sport.contains(&sp.trim().to_lowercase()) };
    let market_match = |m: &str| -> bool {
        if fs.market_raw.is_empty() {
            return true;
        }
        let mclean = canonical_market(m);
        fs.market_raw.iter().any(|fm| {
            let fmc = canonical_market(fm);
            !fmc.is_empty() && mclean.contains(&fmc)
        })
    };

    let mut out: GroupedBooks = HashMap::new();
    for (book, block) in obj {
        if !fs.sportsbook_raw.is_empty() {
            let s_clean = crate::filters::norm_clean(book);
            if !fs.sportsbook_clean.iter().any(|fv| !fv.is_empty() && s_clean.contains(fv)) {
                continue;
            }
        }

        let mut out_games = Vec::new();
        for g in &block.data {
            if !sport_match(&g.sport) || !league_match(&g.league) {
                continue;
            }
            let out_odds: Vec<OddsEntry> = g
                .odds
                .iter()
                .filter(|o| market_match(&o.market))
                .cloned()
                .collect();
            if !out_odds.is_empty() {
                let mut gg = g.clone();
                gg.odds = out_odds;
                out_games.push(gg);
            }
        }
        if !out_games.is_empty() {
            out.insert(book.clone(), BookEntry { data: out_games });
        }
    }

    if out.is_empty() {
        None
    } else {
        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ev(sb: &str, fixture: &str, home: &str, away: &str) -> EvRecord {
        EvRecord {
            sport: "tennis".into(),
            fixture_id: fixture.into(),
            market: "moneyline".into(),
            market_base: "Moneyline".into(),
            market_type: "".into(),
            league: "atp".into(),
            home_team: home.into(),
            away_team: away.into(),
            start_date: None,
            name: "Nadal".into(),
            price: 1.8,
            sportsbook: sb.into(),
            is_live: false,
            ev_value: 4.0,
            deep_link: "".into(),
        }
    }

    #[test]
    fn groups_by_sportsbook_and_fixture() {
        let mut fx = HashMap::new();
        let list = vec![ev("BookA", "f1", "Nadal", "Federer"), ev("BookA", "f1", "Nadal", "Federer")];
        let grouped = group_ev_list(&list, &mut fx);
        assert_eq!(grouped["BookA"].data.len(), 1);
        assert_eq!(grouped["BookA"].data[0].odds.len(), 2);
    }

    #[test]
    fn h2h_inference_backfills_empty_teams() {
        let mut fx = HashMap::new();
        let mut e = ev("BookA", "f2", "", "");
        e.name = "Nadal Moneyline".into();
        let list = vec![e];
        let grouped = group_ev_list(&list, &mut fx);
        let game = &grouped["BookA"].data[0];
        assert!(game.home_team.is_empty() && game.away_team.is_empty());
    }
}
