//! Catalogue client (C1): sports/leagues/sportsbooks/fixtures-active lookups
//! against the upstream odds API. Grounded on `opticOdds/catalogue.py` +
//! `opticOdds/config.py`.

use serde_json::Value;
use std::time::Duration;

const API_BASE: &str = "https://api.opticodds.com/api/v3";

fn dedupe_preserve_order(items: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    items.into_iter().filter(|x| seen.insert(x.clone())).collect()
}

#[derive(Debug, Clone)]
pub struct FixtureRecord {
    pub id: String,
    pub home_team: Option<String>,
    pub away_team: Option<String>,
    pub start_date: Option<i64>,
    pub league: Option<String>,
}

/// Wraps `reqwest::Client` for the catalogue endpoints. Every method returns
/// an empty result rather than an `Err` when the API key is absent — the
/// subscription manager's allow-list fallback logic depends on this "empty
/// catalogue" path, not a propagated error.
pub struct CatalogueClient {
    http: reqwest::Client,
    api_key: Option<String>,
}

impl CatalogueClient {
    pub fn new(api_key: Option<String>) -> Self {
        Self { http: reqwest::Client::new(), api_key }
    }

    fn key(&self) -> Option<&str> {
        self.api_key.as_deref()
    }

    async fn get_json(&self, url: &str, timeout: Duration) -> Option<Value> {
        let key = self.key()?;
        let resp = self.http.get(url).query(&[("key", key)]).timeout(timeout).send().await.ok()?;
        if !resp.status().is_success() {
            return None;
        }
        resp.json::<Value>().await.ok()
    }

    /// (id, display name) pairs for every sport.
    pub async fn sports(&self) -> Vec<(String, String)> {
        let url = format!("{API_BASE}/sports");
        let Some(data) = self.get_json(&url, Duration::from_secs(30)).await else {
            return Vec::new();
        };
        let Some(arr) = data.get("data").and_then(|v| v.as_array()) else {
            return Vec::new();
        };
        arr.iter()
            .filter_map(|s| {
                let id = s.get("id")?.as_str()?.to_string();
                let name = s.get("name").or_else(|| s.get("title")).and_then(|v| v.as_str()).unwrap_or(&id).to_string();
                Some((id, name))
            })
            .collect()
    }

    pub async fn sportsbooks(&self) -> Vec<String> {
        let url = format!("{API_BASE}/sportsbooks");
        let Some(data) = self.get_json(&url, Duration::from_secs(30)).await else {
            return Vec::new();
        };
        let Some(arr) = data.get("data").and_then(|v| v.as_array()) else {
            return Vec::new();
        };
        let names: Vec<String> = arr
            .iter()
            .filter_map(|sb| {
                let n = sb
                    .get("name")
                    .or_else(|| sb.get("title"))
                    .or_else(|| sb.get("display_name"))
                    .or_else(|| sb.get("id"))
                    .and_then(|v| v.as_str())?;
                let n = n.trim();
                if n.is_empty() {
                    None
                } else {
                    Some(n.to_string())
                }
            })
            .collect();
        dedupe_preserve_order(names)
    }

    pub async fn leagues(&self, sport: &str) -> Vec<(String, String)> {
        let Some(key) = self.key() else { return Vec::new() };
        let url = format!("{API_BASE}/leagues");
        let resp = self
            .http
            .get(&url)
            .query(&[("key", key), ("sport", sport)])
            .timeout(Duration::from_secs(30))
            .send()
            .await;
        let Ok(resp) = resp else { return Vec::new() };
        if !resp.status().is_success() {
            return Vec::new();
        }
        let Ok(data) = resp.json::<Value>().await else { return Vec::new() };
        let Some(arr) = data.get("data").and_then(|v| v.as_array()) else {
            return Vec::new();
        };
        arr.iter()
            .filter_map(|l| {
                let id = l.get("id")?.as_str()?.to_string();
                let name = l.get("name").or_else(|| l.get("title")).and_then(|v| v.as_str()).unwrap_or(&id).to_string();
                Some((id, name))
            })
            .collect()
    }

    /// `GET fixtures/active?sport=..&id=..`, tolerating either `id` or
    /// `fixture_id` on the upstream record.
    pub async fn fixtures_active(&self, sport: &str, fixture_id: &str) -> Vec<FixtureRecord> {
        let Some(key) = self.key() else { return Vec::new() };
        let url = format!("{API_BASE}/fixtures/active");
        let resp = self
            .http
            .get(&url)
            .query(&[("key", key), ("sport", sport), ("id", fixture_id)])
            .timeout(Duration::from_secs(15))
            .send()
            .await;
        let Ok(resp) = resp else { return Vec::new() };
        if !resp.status().is_success() {
            return Vec::new();
        }
        let Ok(data) = resp.json::<Value>().await else { return Vec::new() };
        let arr: Vec<Value> = match data.get("data") {
            Some(Value::Array(a)) => a.clone(),
            Some(obj @ Value::Object(_)) => vec![obj.clone()],
            _ => Vec::new(),
        };
        arr.iter()
            .filter_map(|it| {
                let id = it
                    .get("id")
                    .or_else(|| it.get("fixture_id"))
                    .or_else(|| it.get("event_id"))
                    .or_else(|| it.get("match_id"))?;
                let id = match id {
                    Value::String(s) => s.clone(),
                    Value::Number(n) => n.to_string(),
                    _ => return None,
                };
                let (home, away) = crate::odds::extract_home_away(it);
                Some(FixtureRecord {
                    id,
                    home_team: home,
                    away_team: away,
                    start_date: crate::odds::extract_start_time(it),
                    league: crate::odds::extract_league_name(it),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn no_api_key_returns_empty_catalogue() {
        let client = CatalogueClient::new(None);
        assert!(client.sports().await.is_empty());
        assert!(client.sportsbooks().await.is_empty());
        assert!(client.leagues("basketball").await.is_empty());
        assert!(client.fixtures_active("basketball", "123").await.is_empty());
    }

    #[test]
    fn dedupe_preserves_first_occurrence_order() {
        let v = vec!["A".to_string(), "B".to_string(), "A".to_string(), "C".to_string()];
        assert_eq!(dedupe_preserve_order(v), vec!["A", "B", "C"]);
    }
}
