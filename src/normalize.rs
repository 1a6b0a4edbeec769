//! Market/league/outcome string normalisation (C2).
//!
//! These helpers are deliberately duplicated nowhere else: the state engine
//! keys markets on `compose_market` + lower-case while filter matching keys
//! on `canonical_market` — two different conventions the upstream feed
//! genuinely needs kept apart (see DESIGN.md).

use regex::Regex;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::OnceLock;

macro_rules! static_regex {
    ($pattern:expr) => {{
        static RE: OnceLock<Regex> = OnceLock::new();
        RE.get_or_init(|| Regex::new($pattern).expect("valid regex"))
    }};
}

/// lower-case, strip everything but ascii alphanumerics.
pub fn alnum_lower(s: &str) -> String {
    s.chars().filter(|c| c.is_ascii_alphanumeric()).flat_map(|c| c.to_lowercase()).collect()
}

/// lower-cased whitespace/`-`/`_`-delimited tokens, preserving word boundaries.
pub fn soft_tokens(s: &str) -> Vec<String> {
    s.trim()
        .to_lowercase()
        .replace(['-', '_'], " ")
        .split_whitespace()
        .map(|t| t.to_string())
        .collect()
}

/// Canonicalise a market string for fuzzy filter matching: collapse ordinal
/// periods, strip ignorable tokens, then drop all non-alphanumerics.
pub fn canonical_market(raw: &str) -> String {
    let mut s = raw.to_lowercase();

    s = static_regex!(r"\b(first|1st)\s+quarter\b").replace_all(&s, " q1 ").into_owned();
    s = static_regex!(r"\b(second|2nd)\s+quarter\b").replace_all(&s, " q2 ").into_owned();
    s = static_regex!(r"\b(third|3rd)\s+quarter\b").replace_all(&s, " q3 ").into_owned();
    s = static_regex!(r"\b(fourth|4th)\s+quarter\b").replace_all(&s, " q4 ").into_owned();
    s = static_regex!(r"\b(first|1st)\s+half\b").replace_all(&s, " h1 ").into_owned();
    s = static_regex!(r"\b(second|2nd)\s+half\b").replace_all(&s, " h2 ").into_owned();
    s = static_regex!(r"\b1h\b").replace_all(&s, " h1 ").into_owned();
    s = static_regex!(r"\b2h\b").replace_all(&s, " h2 ").into_owned();
    s = static_regex!(r"\bq1\b").replace_all(&s, " q1 ").into_owned();
    s = static_regex!(r"\bq2\b").replace_all(&s, " q2 ").into_owned();
    s = static_regex!(r"\bq3\b").replace_all(&s, " q3 ").into_owned();
    s = static_regex!(r"\bq4\b").replace_all(&s, " q4 ").into_owned();

    for t in ["quarter", "half", "points", "point", "pts"] {
        s = s.replace(t, " ");
    }
    s = s.replace("team total points", " team total ");
    s = s.replace("team points", " team total ");

    alnum_lower(&s)
}

/// Trim + lower-case a market string; this is the key the state engine uses,
/// distinct from `canonical_market` which the fan-out hub uses for filter
/// matching (see module doc comment).
pub fn normalize_market(m: &str) -> String {
    m.trim().to_lowercase()
}

/// Compose a market string that folds in the period/segment/type field, when
/// present and not already contained in the base market.
pub fn compose_market(item: &Value) -> String {
    let base = str_field(item, &["market", "market_name"]).unwrap_or_default();
    let base = base.trim().to_string();

    let mut seg = String::new();
    for key in ["period", "bet_period", "segment", "scope", "type", "marketType", "market_type"] {
        if let Some(v) = item.get(key) {
            let s = scalar_to_string(v);
            if let Some(s) = s {
                if !s.trim().is_empty() {
                    seg = s.trim().to_string();
                    break;
                }
            }
        }
    }

    if !seg.is_empty() && !base.to_lowercase().contains(&seg.to_lowercase()) {
        format!("{seg} {base}").trim().to_string()
    } else {
        base
    }
}

/// Strip non-alphanumerics, lower-case, then resolve known league aliases.
pub fn normalize_league_alias(raw: &str) -> String {
    let v = alnum_lower(raw);
    match v.as_str() {
        "ncaaf" | "ncaafb" => "ncaafootball".to_string(),
        "ncaam" | "ncaab" => "ncaabasketball".to_string(),
        "ncaaw" => "ncaawbasketball".to_string(),
        _ => v.replace("collegefootball", "ncaafootball"),
    }
}

const GENERIC_TOKENS: &[&str] = &["over", "under", "yes", "no", "odd", "even"];

/// True for tokens like `over`/`under`/`yes`/`no`/`odd`/`even` or any string
/// beginning with `over`/`under` followed by a signed decimal.
pub fn is_generic_label(val: &str) -> bool {
    let s = val.trim().to_lowercase();
    if s.is_empty() {
        return false;
    }
    if GENERIC_TOKENS.contains(&s.as_str()) {
        return true;
    }
    static_regex!(r"^(over|under)\s+[+\-]?\d+(?:\.\d+)?$").is_match(&s)
}

/// Heuristic: true for markets whose outcomes do not form a probability simplex.
pub fn is_nonexclusive_market(canonical_or_composed: &str) -> bool {
    let s = canonical_or_composed.to_lowercase();
    let scorer_like = ["scorer", "to score", "touchdown", "goalscorer", "home run"];
    let first_like = ["first", "1st"];
    if scorer_like.iter().any(|t| s.contains(t)) && !first_like.iter().any(|t| s.contains(t)) {
        return true;
    }
    if s.contains("anytime") {
        let td_like = ["td", "touchdown", "goal", "home run", "scorer"];
        if td_like.iter().any(|t| s.contains(t)) {
            return true;
        }
    }
    false
}

/// Strip a trailing Over/Under suffix, trailing "moneyline", and a trailing
/// parenthesised suffix, to recover a team/player name from an outcome label.
pub fn clean_outcome_team_name(name: &str) -> String {
    let mut s = name.trim().to_string();
    if s.is_empty() {
        return s;
    }
    s = static_regex!(r"(?i)\s+(?:over|under)\s+[+\-]?\d+(?:\.\d+)?$").replace(&s, "").into_owned();
    s = static_regex!(r"(?i)\s+moneyline$").replace(&s, "").into_owned();
    s = static_regex!(r"\s+\([^)]*\)$").replace(&s, "").into_owned();
    s.trim().to_string()
}

pub fn str_field(item: &Value, keys: &[&str]) -> Option<String> {
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

fn scalar_to_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Normalise a raw filter value (comma-separated string, array, or scalar)
/// into a lower-cased set.
pub fn normalize_filter_values(value: &Value) -> HashSet<String> {
    let mut out = HashSet::new();
    match value {
        Value::Null => {}
        Value::String(s) => {
            for part in s.split(',') {
                let p = part.trim();
                if !p.is_empty() {
                    out.insert(p.to_lowercase());
                }
            }
        }
        Value::Array(arr) => {
            for item in arr {
                if let Some(s) = item.as_str() {
                    let p = s.trim();
                    if !p.is_empty() {
                        out.insert(p.to_lowercase());
                    }
                } else if !item.is_null() {
                    out.insert(item.to_string().to_lowercase());
                }
            }
        }
        other => {
            let s = other.to_string();
            if !s.is_empty() {
                out.insert(s.to_lowercase());
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_idempotent_and_ordinal_insensitive() {
        let a = canonical_market("1st Quarter Moneyline");
        let b = canonical_market("First Quarter Moneyline");
        assert_eq!(a, b);
        assert_eq!(canonical_market(&a), a);
    }

    #[test]
    fn generic_label_rejection() {
        assert!(is_generic_label("Over 11.5"));
        assert!(!is_generic_label("Draw"));
        assert!(is_generic_label("Over"));
        assert!(!is_generic_label("Laker Over 25.5"));
    }

    #[test]
    fn league_alias_resolution() {
        assert_eq!(normalize_league_alias("NCAAF"), "ncaafootball");
        assert_eq!(normalize_league_alias("ncaab"), "ncaabasketball");
        assert_eq!(normalize_league_alias("College Football"), "ncaafootball");
    }

    #[test]
    fn clean_team_name_strips_suffixes() {
        assert_eq!(clean_outcome_team_name("Lakers Over 25.5"), "Lakers");
        assert_eq!(clean_outcome_team_name("Celtics Moneyline"), "Celtics");
        assert_eq!(clean_outcome_team_name("Knicks (NY)"), "Knicks");
    }

    #[test]
    fn nonexclusive_market_heuristic() {
        assert!(is_nonexclusive_market("anytime touchdown scorer"));
        assert!(!is_nonexclusive_market("first touchdown scorer"));
        assert!(!is_nonexclusive_market("moneyline"));
    }
}
