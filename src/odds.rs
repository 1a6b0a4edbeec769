//! Polymorphic quote field extraction (C3).
//!
//! Feed objects vary by upstream; every extractor here tolerates missing or
//! oddly-shaped fields and returns `None` rather than erroring — a single bad
//! quote must never fail a batch.

use crate::normalize::is_generic_label;
use serde_json::Value;

const NESTED_ROOTS: &[&str] = &["fixture", "event", "match", "game"];
const DEEP_SEARCH_ROOTS: &[&str] = &["raw", "raw_data", "data", "attributes", "payload"];
const MAX_DEEP_LINK_DEPTH: u8 = 12;

fn as_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn american_to_decimal(a: f64) -> Option<f64> {
    if a >= 100.0 {
        Some(1.0 + a / 100.0)
    } else if a <= -100.0 {
        Some(1.0 + 100.0 / a.abs())
    } else {
        None
    }
}

/// Strict precedence: explicit decimal fields, then explicit American fields,
/// then a generic `odds`/`price` field disambiguated by magnitude.
pub fn parse_decimal_odds(item: &Value) -> Option<f64> {
    let price_obj = item.get("price").filter(|v| v.is_object());
    let roots: Vec<&Value> = match price_obj {
        Some(p) => vec![item, p],
        None => vec![item],
    };

    for root in &roots {
        for key in ["decimal", "odds_decimal", "price_decimal", "decimal_price"] {
            if let Some(v) = root.get(key) {
                if let Some(f) = as_f64(v) {
                    if f >= 1.01 {
                        return Some(f);
                    }
                }
            }
        }
    }
    for root in &roots {
        for key in ["american", "odds_american"] {
            if let Some(v) = root.get(key) {
                if let Some(f) = as_f64(v) {
                    if let Some(dec) = american_to_decimal(f) {
                        return Some(dec);
                    }
                }
            }
        }
    }
    for key in ["odds", "price"] {
        if let Some(v) = item.get(key) {
            if let Some(f) = as_f64(v) {
                if f.abs() >= 100.0 {
                    if let Some(dec) = american_to_decimal(f) {
                        return Some(dec);
                    }
                } else if f >= 1.01 {
                    return Some(f);
                }
            }
        }
    }
    None
}

fn norm_name(v: Option<String>) -> Option<String> {
    let s = v?.trim().to_string();
    if s.is_empty() || matches!(s.to_lowercase().as_str(), "none" | "null" | "n/a" | "na") {
        None
    } else {
        Some(s)
    }
}

fn pick_first_str(item: &Value, keys: &[&str]) -> Option<String> {
    for k in keys {
        if let Some(v) = item.get(*k) {
            if let Some(s) = v.as_str() {
                if !s.is_empty() {
                    return Some(s.to_string());
                }
            }
        }
    }
    None
}

fn name_of(participant: &Value) -> Option<String> {
    pick_first_str(
        participant,
        &[
            "name",
            "team",
            "team_name",
            "full_name",
            "short_name",
            "displayName",
            "home_team",
            "away_team",
            "homeTeam",
            "awayTeam",
        ],
    )
}

fn player_name_of(participant: &Value) -> Option<String> {
    pick_first_str(participant, &["name", "full_name", "short_name", "displayName", "player", "team"])
}

fn from_obj(obj: &Value) -> (Option<String>, Option<String>) {
    if !obj.is_object() {
        return (None, None);
    }
    let mut home = pick_first_str(obj, &["home_team_display"]);
    let mut away = pick_first_str(obj, &["away_team_display"]);

    if home.is_none() || away.is_none() {
        for key in ["participants", "participant", "competitors", "teams", "sides"] {
            if let Some(Value::Array(coll)) = obj.get(key) {
                if coll.len() >= 2 {
                    home = home.or_else(|| name_of(&coll[0]));
                    away = away.or_else(|| name_of(&coll[1]));
                    break;
                }
            }
        }
    }

    let sport_val = obj
        .get("sport")
        .or_else(|| obj.get("sport_name"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .trim()
        .to_lowercase();
    if (home.is_none() || away.is_none())
        && matches!(sport_val.as_str(), "tennis" | "table_tennis" | "table-tennis" | "volleyball")
    {
        for key in ["participants", "participant", "competitors", "teams", "sides"] {
            if let Some(Value::Array(coll)) = obj.get(key) {
                if coll.len() >= 2 {
                    if let (Some(n0), Some(n1)) = (player_name_of(&coll[0]), player_name_of(&coll[1])) {
                        home = home.or(Some(n0));
                        away = away.or(Some(n1));
                        break;
                    }
                }
            }
        }
    }

    if home.as_deref().is_some_and(is_generic_label) {
        home = None;
    }
    if away.as_deref().is_some_and(is_generic_label) {
        away = None;
    }
    (norm_name(home), norm_name(away))
}

/// First tries the item itself, then any of `{fixture, event, match, game}` nested inside it.
pub fn extract_home_away(item: &Value) -> (Option<String>, Option<String>) {
    let (h, a) = from_obj(item);
    if h.is_some() || a.is_some() {
        return (h, a);
    }
    for key in NESTED_ROOTS {
        if let Some(sub) = item.get(*key) {
            let (h, a) = from_obj(sub);
            if h.is_some() || a.is_some() {
                return (h, a);
            }
        }
    }
    (None, None)
}

/// Integer already in seconds if `v <= 10^12`, else treated as milliseconds; strings parse as
/// ISO-8601 (accepting a trailing `Z`).
pub fn to_epoch_seconds(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => {
            let f = n.as_f64()?;
            if f > 1_000_000_000_000.0 {
                Some((f / 1000.0) as i64)
            } else {
                Some(f as i64)
            }
        }
        Value::String(s) => {
            let s = s.trim();
            if let Ok(n) = s.parse::<i64>() {
                return Some(n);
            }
            let s2 = s.replace('Z', "+00:00");
            chrono::DateTime::parse_from_rfc3339(&s2).ok().map(|dt| dt.timestamp())
        }
        _ => None,
    }
}

pub fn extract_start_time(item: &Value) -> Option<i64> {
    const KEYS: &[&str] = &[
        "start_time",
        "commence_time",
        "start_date",
        "kickoff",
        "event_date",
        "game_time",
        "fixture_start",
        "start_at",
        "timestamp",
    ];
    let v = KEYS.iter().find_map(|k| item.get(*k)).or_else(|| {
        NESTED_ROOTS.iter().find_map(|k| {
            item.get(*k)
                .and_then(|fx| ["start_time", "commence_time", "start_date", "kickoff", "start_at", "timestamp"].iter().find_map(|k2| fx.get(*k2)))
        })
    })?;
    to_epoch_seconds(v)
}

pub fn extract_league_name(item: &Value) -> Option<String> {
    match item.get("league") {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Object(_)) => pick_first_str(item.get("league").unwrap(), &["name", "title", "id"]),
        _ => None,
    }
}

/// Depth-bounded search for a deep-link URL anywhere in the nested object tree.
pub fn extract_deep_link(item: &Value) -> String {
    fn search(obj: &Value, depth: u8) -> Option<String> {
        if depth > MAX_DEEP_LINK_DEPTH {
            return None;
        }
        match obj {
            Value::Object(map) => {
                if let Some(dl) = map.get("deep_link") {
                    if dl.is_object() {
                        for p in ["desktop", "Desktop"] {
                            if let Some(u) = dl.get(p).and_then(|v| v.as_str()) {
                                if !u.is_empty() {
                                    return Some(u.to_string());
                                }
                            }
                        }
                    }
                }
                for subk in DEEP_SEARCH_ROOTS {
                    if let Some(sub) = map.get(*subk) {
                        if let Some(r) = search(sub, depth + 1) {
                            return Some(r);
                        }
                    }
                }
                for v in map.values() {
                    if let Some(r) = search(v, depth + 1) {
                        return Some(r);
                    }
                }
                None
            }
            Value::Array(arr) => arr.iter().find_map(|item| search(item, depth + 1)),
            _ => None,
        }
    }
    search(item, 0).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decimal_precedence_over_american() {
        let q = json!({"decimal": "2.5", "american": "150"});
        assert_eq!(parse_decimal_odds(&q), Some(2.5));
    }

    #[test]
    fn american_positive_and_negative() {
        assert_eq!(parse_decimal_odds(&json!({"american": 150})), Some(2.5));
        assert_eq!(parse_decimal_odds(&json!({"american": -200})), Some(1.5));
    }

    #[test]
    fn generic_price_disambiguation() {
        assert_eq!(parse_decimal_odds(&json!({"price": 120})), Some(2.2));
        assert_eq!(parse_decimal_odds(&json!({"price": 1.91})), Some(1.91));
        assert_eq!(parse_decimal_odds(&json!({"price": 0.5})), None);
    }

    #[test]
    fn nested_price_object() {
        let q = json!({"price": {"decimal": 1.95}});
        assert_eq!(parse_decimal_odds(&q), Some(1.95));
    }

    #[test]
    fn home_away_from_participants() {
        let q = json!({"participants": [{"name": "Lakers"}, {"name": "Celtics"}]});
        assert_eq!(extract_home_away(&q), (Some("Lakers".into()), Some("Celtics".into())));
    }

    #[test]
    fn home_away_rejects_generic_labels() {
        let q = json!({"home_team_display": "Over", "away_team_display": "Celtics"});
        assert_eq!(extract_home_away(&q), (None, Some("Celtics".into())));
    }

    #[test]
    fn home_away_falls_back_to_nested_fixture() {
        let q = json!({"fixture": {"participants": [{"name": "A"}, {"name": "B"}]}});
        assert_eq!(extract_home_away(&q), (Some("A".into()), Some("B".into())));
    }

    #[test]
    fn epoch_seconds_from_millis_and_iso() {
        assert_eq!(to_epoch_seconds(&json!(1_700_000_000_000i64)), Some(1_700_000_000));
        assert_eq!(to_epoch_seconds(&json!("2023-11-14T22:13:20Z")), Some(1_700_000_000));
        assert_eq!(to_epoch_seconds(&json!(1_700_000_000)), Some(1_700_000_000));
    }

    #[test]
    fn deep_link_found_in_nested_payload() {
        let q = json!({"data": {"deep_link": {"desktop": "https://example.com/bet"}}});
        assert_eq!(extract_deep_link(&q), "https://example.com/bet");
    }

    #[test]
    fn deep_link_missing_returns_empty() {
        assert_eq!(extract_deep_link(&json!({"x": 1})), "");
    }
}
