//! Subscription manager (C6): resolves the catalogue into a concrete set of
//! SSE workers and keeps them running until the cancellation token fires.
//!
//! Grounded on `opticOdds/subscribe.py`.

use crate::catalogue::CatalogueClient;
use crate::config::Config;
use crate::engine::StateEngine;
use crate::hub::{Hub, OddsFormatHolder};
use crate::normalize::{alnum_lower, normalize_league_alias};
use crate::server::Stats;
use crate::sse::{SseWorker, SseWorkerConfig};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn values_to_lower_set(v: &Value) -> HashSet<String> {
    match v {
        Value::Null => HashSet::new(),
        Value::String(s) => s.split(',').map(|p| p.trim().to_lowercase()).filter(|p| !p.is_empty()).collect(),
        Value::Array(arr) => arr.iter().filter_map(|x| x.as_str()).map(|s| s.trim().to_lowercase()).filter(|s| !s.is_empty()).collect(),
        other => {
            let s = other.to_string().to_lowercase();
            if s.is_empty() {
                HashSet::new()
            } else {
                [s].into_iter().collect()
            }
        }
    }
}

/// A league survives an allow-list if its raw id/name match a token exactly,
/// its alias-normalized form matches a token's alias-normalized form, or
/// either direction of substring holds between the alnum-stripped forms.
/// Grounded on `opticOdds/subscribe.py`'s `_clean_token` + `a in nm_clean or
/// a in lid_clean or nm_clean in a` matching.
fn league_matches(id: &str, name: &str, allow: &HashSet<String>) -> bool {
    let id_lower = id.to_lowercase();
    let name_lower = name.to_lowercase();
    if allow.contains(&id_lower) || allow.contains(&name_lower) {
        return true;
    }
    let id_clean = alnum_lower(id);
    let name_clean = alnum_lower(name);
    let id_alias = normalize_league_alias(id);
    let name_alias = normalize_league_alias(name);
    allow.iter().any(|a| {
        if a.is_empty() {
            return false;
        }
        let a_clean = alnum_lower(a);
        if a_clean.is_empty() {
            return false;
        }
        let a_alias = normalize_league_alias(a);
        id_clean.contains(&a_clean) || a_clean.contains(&id_clean) || name_clean.contains(&a_clean) || a_clean.contains(&name_clean) || id_alias == a_alias || name_alias == a_alias
    })
}

pub struct ResolvedScope {
    pub sports: Vec<(String, Vec<String>)>,
    pub sportsbooks: Vec<String>,
    pub note: Option<String>,
}

pub struct SubscriptionManager {
    catalogue: Arc<CatalogueClient>,
    engine: Arc<StateEngine>,
    hub: Arc<Hub>,
    config: Arc<Config>,
    odds_holder: OddsFormatHolder,
    stats: Arc<Stats>,
}

impl SubscriptionManager {
    pub fn new(catalogue: Arc<CatalogueClient>, engine: Arc<StateEngine>, hub: Arc<Hub>, config: Arc<Config>, odds_holder: OddsFormatHolder, stats: Arc<Stats>) -> Self {
        Self { catalogue, engine, hub, config, odds_holder, stats }
    }

    /// Resolve sports/sportsbooks/leagues against the catalogue, applying
    /// allow-list filters from `filters`. Falls back to the full list when a
    /// filter matches nothing for sports/leagues; an empty sportsbook match
    /// is reported via `note` and yields no scope at all.
    async fn resolve_scope(&self, filters: &Value) -> ResolvedScope {
        let sport_allow = values_to_lower_set(filters.get("sport").unwrap_or(&Value::Null));
        let sportsbook_allow = values_to_lower_set(filters.get("sportsbook").or_else(|| filters.get("sportbook")).unwrap_or(&Value::Null));
        let league_allow = values_to_lower_set(filters.get("league").unwrap_or(&Value::Null));

        let all_sports = self.catalogue.sports().await;
        let all_sports = if all_sports.is_empty() { fallback_sports(&self.config.sports_allowlist) } else { all_sports };

        let sports: Vec<(String, String)> = if sport_allow.is_empty() {
            all_sports.clone()
        } else {
            let matched: Vec<(String, String)> =
                all_sports.iter().filter(|(id, name)| sport_allow.contains(&id.to_lowercase()) || sport_allow.contains(&name.to_lowercase())).cloned().collect();
            if matched.is_empty() {
                all_sports.clone()
            } else {
                matched
            }
        };

        let all_books = self.catalogue.sportsbooks().await;
        let sportsbooks: Vec<String> = if sportsbook_allow.is_empty() {
            all_books
        } else {
            all_books.into_iter().filter(|b| sportsbook_allow.contains(&b.to_lowercase())).collect()
        };
        if !sportsbook_allow.is_empty() && sportsbooks.is_empty() {
            return ResolvedScope { sports: Vec::new(), sportsbooks: Vec::new(), note: Some("no_sportsbooks_matched".to_string()) };
        }

        let mut resolved_sports = Vec::new();
        for (sport_id, _name) in &sports {
            let leagues = self.catalogue.leagues(sport_id).await;
            let leagues = if leagues.is_empty() { Vec::new() } else { leagues };

            let surviving: Vec<String> = if league_allow.is_empty() {
                leagues.into_iter().map(|(id, _)| id).collect()
            } else {
                let matched: Vec<String> = leagues.iter().filter(|(id, name)| league_matches(id, name, &league_allow)).map(|(id, _)| id.clone()).collect();
                if matched.is_empty() {
                    // Nothing resolved against the catalogue; treat the raw
                    // filter tokens themselves as league identifiers.
                    league_allow.iter().cloned().collect()
                } else {
                    matched
                }
            };

            resolved_sports.push((sport_id.clone(), surviving));
        }

        ResolvedScope { sports: resolved_sports, sportsbooks, note: None }
    }

    /// Resolve scope, spawn one worker per surviving `(sport, leagues)` pair
    /// (capped by `max_workers`), emit `stream_scope`, and block until
    /// `token` is cancelled, joining every worker before returning.
    pub async fn start(&self, filters: Value, token: CancellationToken) {
        let scope = self.resolve_scope(&filters).await;

        if let Some(note) = &scope.note {
            tracing::info!(note = %note, "stream_scope");
            token.cancelled().await;
            return;
        }

        let mut pairs: Vec<(String, Vec<String>)> = scope.sports;
        if let Some(max) = self.config.max_workers {
            pairs.truncate(max);
        }

        tracing::info!(
            sports = ?pairs.iter().map(|(s, _)| s.clone()).collect::<Vec<_>>(),
            sportsbooks = ?scope.sportsbooks,
            "stream_scope"
        );

        let mut handles = Vec::new();
        for (sport, leagues) in pairs {
            let (sb_chunk, lg_chunk) = self.config.chunk_sizes_for(&sport);
            let worker_cfg = SseWorkerConfig {
                sport: sport.clone(),
                leagues,
                sportsbooks: scope.sportsbooks.clone(),
                sportsbook_chunk_size: sb_chunk,
                league_chunk_size: lg_chunk,
                include_fixture_updates: self.config.include_fixture_updates,
                allowed_markets: self.config.allowed_markets.clone(),
                api_key: self.config.opticodds_api_key.clone().unwrap_or_default(),
            };
            let worker =
                SseWorker::new(worker_cfg, Arc::clone(&self.engine), Arc::clone(&self.hub), Arc::clone(&self.catalogue), Arc::clone(&self.odds_holder), Arc::clone(&self.stats));
            let worker_token = token.clone();
            handles.push(tokio::spawn(async move {
                worker.run(worker_token).await;
            }));
        }

        token.cancelled().await;
        for h in handles {
            let _ = h.await;
        }
    }
}

/// When the catalogue is unreachable (no API key configured), fall back to
/// the configured sports allowlist so the gateway still has something to
/// try streaming rather than silently doing nothing.
fn fallback_sports(allowlist: &HashSet<String>) -> Vec<(String, String)> {
    allowlist.iter().map(|s| (s.clone(), s.clone())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn values_to_lower_set_handles_csv_string() {
        let v = Value::String("NBA, nfl ,nba".to_string());
        let set = values_to_lower_set(&v);
        assert_eq!(set.len(), 2);
        assert!(set.contains("nba"));
        assert!(set.contains("nfl"));
    }

    #[test]
    fn values_to_lower_set_handles_array() {
        let v = serde_json::json!(["Basketball", "Football"]);
        let set = values_to_lower_set(&v);
        assert!(set.contains("basketball"));
        assert!(set.contains("football"));
    }

    #[test]
    fn values_to_lower_set_null_is_empty() {
        assert!(values_to_lower_set(&Value::Null).is_empty());
    }

    #[test]
    fn league_matches_partial_token_against_id() {
        let mut allow = HashSet::new();
        allow.insert("premier".to_string());
        assert!(league_matches("england_premier_league", "Premier League", &allow));
    }

    #[test]
    fn league_matches_full_id_against_partial_allow_reverse() {
        let mut allow = HashSet::new();
        allow.insert("england premier league extra".to_string());
        assert!(league_matches("england_premier_league", "Premier League", &allow));
    }

    #[test]
    fn league_matches_rejects_unrelated_token() {
        let mut allow = HashSet::new();
        allow.insert("bundesliga".to_string());
        assert!(!league_matches("england_premier_league", "Premier League", &allow));
    }

    #[test]
    fn fallback_sports_mirrors_allowlist() {
        let mut allow = HashSet::new();
        allow.insert("basketball".to_string());
        let sports = fallback_sports(&allow);
        assert_eq!(sports, vec![("basketball".to_string(), "basketball".to_string())]);
    }
}
