//! SSE worker (C5): one per sport. Chunking, URL construction, bisection on
//! 400/414, exponential backoff, resume via `Last-Event-ID`, allowed-markets
//! predicate, scope observer, ordered payload emission.
//!
//! Grounded on `calculations/sse.py`.

use crate::catalogue::CatalogueClient;
use crate::engine::StateEngine;
use crate::hub::{Broadcast, Hub, OddsFormatHolder};
use crate::normalize::{alnum_lower, soft_tokens};
use crate::odds::{extract_home_away, extract_league_name, extract_start_time};
use crate::server::Stats;
use crate::transform::sport_display;
use crate::types::{BookEntry, GameEntry, GroupedBooks, OddsEntry};
use serde_json::Value;
use std::collections::HashSet;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const STREAM_BASE: &str = "https://api.opticodds.com/api/v3/stream/odds";
const API_BASE: &str = "https://api.opticodds.com/api/v3";
const SCOPE_CAP: usize = 50;
const INITIAL_BACKOFF_SECS: u64 = 2;
const MAX_BACKOFF_SECS: u64 = 30;

fn chunk_list(items: &[String], size: usize) -> Vec<Vec<String>> {
    if items.is_empty() {
        return Vec::new();
    }
    if size == 0 {
        return vec![items.to_vec()];
    }
    items.chunks(size).map(|c| c.to_vec()).collect()
}

/// Split every multi-item chunk in half; used on HTTP 400/414 to shrink URLs.
fn split_chunks(chunks: &[Vec<String>]) -> Vec<Vec<String>> {
    let mut out = Vec::new();
    for ch in chunks {
        if ch.len() > 1 {
            let mid = ch.len() / 2;
            out.push(ch[..mid].to_vec());
            out.push(ch[mid..].to_vec());
        } else {
            out.push(ch.clone());
        }
    }
    out.into_iter().filter(|c| !c.is_empty()).collect()
}

/// Accept an item if any allowed token's alnum-compacted form is a substring
/// of any relevant field's alnum-compacted form, or if all whitespace-tokens
/// of an allowed term occur as whole words in any field.
pub fn allowed_markets_predicate(item: &Value, allowed: &HashSet<String>) -> bool {
    const FIELDS: &[&str] = &["market", "market_name", "marketType", "type", "market_type", "period", "bet_period", "segment", "scope"];
    let am_norm: Vec<String> = allowed.iter().map(|a| alnum_lower(a)).collect();
    let am_tokens: Vec<Vec<String>> = allowed.iter().map(|a| soft_tokens(a)).collect();

    let field_values: Vec<String> = FIELDS
        .iter()
        .filter_map(|k| item.get(*k))
        .filter_map(|v| match v {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
        .collect();
    let f_clean: Vec<String> = field_values.iter().map(|v| alnum_lower(v)).collect();
    let f_soft: Vec<String> = field_values.iter().map(|v| format!(" {} ", v.trim().to_lowercase())).collect();

    for mn in &f_clean {
        for a in &am_norm {
            if !a.is_empty() && mn.contains(a.as_str()) {
                return true;
            }
        }
    }
    for words in &am_tokens {
        if !words.is_empty() && words.iter().all(|w| f_soft.iter().any(|fs| fs.contains(&format!(" {w} ")))) {
            return true;
        }
    }
    false
}

fn fixture_id_of(it: &Value) -> Option<String> {
    let raw = it
        .get("fixture_id")
        .or_else(|| it.get("event_id"))
        .or_else(|| it.get("fixture"))
        .or_else(|| it.get("match_id"))
        .or_else(|| it.get("id"))?;
    let resolved = if raw.is_object() { raw.get("id").or_else(|| raw.get("fixture_id"))? } else { raw };
    match resolved {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub struct SseWorkerConfig {
    pub sport: String,
    pub leagues: Vec<String>,
    pub sportsbooks: Vec<String>,
    pub sportsbook_chunk_size: usize,
    pub league_chunk_size: usize,
    pub include_fixture_updates: bool,
    pub allowed_markets: Option<HashSet<String>>,
    pub api_key: String,
}

pub struct SseWorker {
    cfg: SseWorkerConfig,
    engine: std::sync::Arc<StateEngine>,
    hub: std::sync::Arc<Hub>,
    catalogue: std::sync::Arc<CatalogueClient>,
    odds_holder: OddsFormatHolder,
    stats: std::sync::Arc<Stats>,
    http: reqwest::Client,
}

impl SseWorker {
    pub fn new(
        cfg: SseWorkerConfig,
        engine: std::sync::Arc<StateEngine>,
        hub: std::sync::Arc<Hub>,
        catalogue: std::sync::Arc<CatalogueClient>,
        odds_holder: OddsFormatHolder,
        stats: std::sync::Arc<Stats>,
    ) -> Self {
        Self { cfg, engine, hub, catalogue, odds_holder, stats, http: reqwest::Client::new() }
    }

    /// Per-fixture catalogue backfill: `fixtures/active?sport=..&id=..`, tried
    /// once per fixture (`needs_fixture_meta`/`mark_fixture_meta_fetch_attempted`
    /// dedupe it), matching `calculations/meta.py`'s `ensure_fixture_meta`.
    async fn ensure_fixture_meta(&self, fixture_id: &str) {
        if !self.engine.needs_fixture_meta(fixture_id) {
            return;
        }
        if !self.engine.mark_fixture_meta_fetch_attempted(fixture_id) {
            return;
        }
        let records = self.catalogue.fixtures_active(&self.cfg.sport, fixture_id).await;
        for rec in records {
            self.engine.merge_fixture_meta(&rec.id, rec.home_team, rec.away_team, rec.start_date, rec.league);
        }
    }

    /// Pre-loop `fixtures/active` seed, so `FixtureMeta` isn't empty for the
    /// first odds events that arrive after connect.
    pub async fn seed_fixture_meta(&self) {
        let mut url = format!(
            "{API_BASE}/fixtures/active?key={}&sport={}",
            self.cfg.api_key,
            urlencoding_component(&self.cfg.sport)
        );
        for lg in &self.cfg.leagues {
            url.push_str(&format!("&league={}", urlencoding_component(lg)));
        }
        let Ok(resp) = self.http.get(&url).timeout(Duration::from_secs(30)).send().await else {
            return;
        };
        if !resp.status().is_success() {
            return;
        }
        let Ok(data) = resp.json::<Value>().await else { return };
        let arr: Vec<Value> = match data.get("data") {
            Some(Value::Array(a)) => a.clone(),
            Some(obj @ Value::Object(_)) => vec![obj.clone()],
            _ => Vec::new(),
        };
        for it in &arr {
            if let Some(fid) = fixture_id_of(it) {
                let (h, a) = extract_home_away(it);
                self.engine.merge_fixture_meta(&fid, h, a, extract_start_time(it), extract_league_name(it));
            }
        }
    }

    /// Run until `token` is cancelled. Network errors trigger exponential
    /// backoff and chunk rotation; HTTP 400/414 additionally bisect chunks.
    pub async fn run(&self, token: CancellationToken) {
        self.stats.sse_workers_active.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.run_inner(token).await;
        self.stats.sse_workers_active.fetch_sub(1, std::sync::atomic::Ordering::Relaxed);
    }

    async fn run_inner(&self, token: CancellationToken) {
        self.seed_fixture_meta().await;

        let mut lg_subchunks = chunk_list(&self.cfg.leagues, self.cfg.league_chunk_size);
        let mut sb_subchunks = chunk_list(&self.cfg.sportsbooks, self.cfg.sportsbook_chunk_size);
        let mut lg_idx = 0usize;
        let mut sb_idx = 0usize;
        let mut last_entry_id: Option<String> = None;
        let mut backoff = INITIAL_BACKOFF_SECS;

        let mut observed_markets: HashSet<String> = HashSet::new();
        let mut observed_leagues: HashSet<String> = HashSet::new();
        let mut observed_books: HashSet<String> = HashSet::new();
        let mut last_scope_counts = (0usize, 0usize, 0usize);

        while !token.is_cancelled() {
            let lg_chunk = if lg_subchunks.is_empty() { Vec::new() } else { lg_subchunks[lg_idx % lg_subchunks.len()].clone() };
            let sb_chunk = if sb_subchunks.is_empty() { Vec::new() } else { sb_subchunks[sb_idx % sb_subchunks.len()].clone() };

            let odds_format = self.odds_holder.read().unwrap().clone();
            let mut url = format!("{STREAM_BASE}/{}?key={}", self.cfg.sport, self.cfg.api_key);
            for lg in &lg_chunk {
                url.push_str(&format!("&league={}", urlencoding_component(lg)));
            }
            for sb in &sb_chunk {
                url.push_str(&format!("&sportsbook={}", urlencoding_component(sb)));
            }
            if self.cfg.include_fixture_updates {
                url.push_str("&include_fixture_updates=true");
            }
            url.push_str("&include_deep_link=true");
            url.push_str(&format!("&odds_format={odds_format}"));

            let mut req = self.http.get(&url).timeout(Duration::from_secs(45));
            if let Some(id) = &last_entry_id {
                req = req.header("Last-Event-ID", id.clone());
            }

            let resp = tokio::select! {
                r = req.send() => r,
                _ = token.cancelled() => return,
            };

            let resp = match resp {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!(sport = %self.cfg.sport, error = %e, "sse request failed");
                    self.sleep_backoff(&mut backoff, &token).await;
                    lg_idx += 1;
                    sb_idx += 1;
                    continue;
                }
            };

            if resp.status() == reqwest::StatusCode::BAD_REQUEST || resp.status() == reqwest::StatusCode::URI_TOO_LONG {
                tracing::warn!(sport = %self.cfg.sport, status = %resp.status(), "sse url rejected, bisecting chunks");
                if lg_subchunks.iter().any(|c| c.len() > 1) {
                    lg_subchunks = split_chunks(&lg_subchunks);
                }
                if sb_subchunks.iter().any(|c| c.len() > 1) {
                    sb_subchunks = split_chunks(&sb_subchunks);
                }
                lg_idx += 1;
                sb_idx += 1;
                self.sleep_backoff(&mut backoff, &token).await;
                continue;
            }
            if !resp.status().is_success() {
                tracing::warn!(sport = %self.cfg.sport, status = %resp.status(), "sse connect failed");
                self.sleep_backoff(&mut backoff, &token).await;
                continue;
            }

            backoff = INITIAL_BACKOFF_SECS;
            tracing::info!(sport = %self.cfg.sport, "sse connected");

            let mut stream = resp.bytes_stream();
            let mut buf = String::new();
            loop {
                use futures::StreamExt;
                let chunk = tokio::select! {
                    c = stream.next() => c,
                    _ = token.cancelled() => return,
                };
                let Some(chunk) = chunk else { break };
                let Ok(chunk) = chunk else { break };
                buf.push_str(&String::from_utf8_lossy(&chunk));

                while let Some(pos) = buf.find("\n\n") {
                    let raw_event: String = buf.drain(..pos + 2).collect();
                    if let Some((event_name, data)) = parse_sse_event(&raw_event) {
                        self.handle_event(
                            &event_name,
                            &data,
                            &mut last_entry_id,
                            &mut observed_markets,
                            &mut observed_leagues,
                            &mut observed_books,
                            &mut last_scope_counts,
                        )
                        .await;
                    }
                }
            }
            tracing::warn!(sport = %self.cfg.sport, "sse stream ended, reconnecting");
            self.sleep_backoff(&mut backoff, &token).await;
        }
    }

    async fn sleep_backoff(&self, backoff: &mut u64, token: &CancellationToken) {
        let wait = Duration::from_secs((*backoff).min(MAX_BACKOFF_SECS));
        tokio::select! {
            _ = tokio::time::sleep(wait) => {},
            _ = token.cancelled() => {},
        }
        *backoff = (*backoff * 2).min(MAX_BACKOFF_SECS);
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_event(
        &self,
        event_name: &str,
        data: &str,
        last_entry_id: &mut Option<String>,
        observed_markets: &mut HashSet<String>,
        observed_leagues: &mut HashSet<String>,
        observed_books: &mut HashSet<String>,
        last_scope_counts: &mut (usize, usize, usize),
    ) {
        let Ok(parsed) = serde_json::from_str::<Value>(data) else { return };

        match event_name {
            "odds" | "locked-odds" => {
                if let Some(id) = parsed.get("entry_id").and_then(|v| v.as_str()) {
                    *last_entry_id = Some(id.to_string());
                }
                let mut arr: Vec<Value> = match parsed.get("data") {
                    Some(Value::Array(a)) => a.clone(),
                    _ => Vec::new(),
                };

                self.stats.updates_received.fetch_add(arr.len() as u64, std::sync::atomic::Ordering::Relaxed);

                let mut scope_changed = false;
                for it in arr.iter().take(200) {
                    let mk = it.get("market_name").or_else(|| it.get("market")).and_then(|v| v.as_str()).unwrap_or("").trim().to_string();
                    if !mk.is_empty() && observed_markets.insert(mk) {
                        scope_changed = true;
                    }
                    if let Some(lg) = extract_league_name(it) {
                        if !lg.trim().is_empty() && observed_leagues.insert(lg.trim().to_string()) {
                            scope_changed = true;
                        }
                    }
                    let sb = it.get("sportsbook").and_then(|v| v.as_str()).unwrap_or("").trim().to_string();
                    if !sb.is_empty() && observed_books.insert(sb) {
                        scope_changed = true;
                    }
                }
                if scope_changed {
                    let counts = (observed_markets.len(), observed_leagues.len(), observed_books.len());
                    if counts != *last_scope_counts {
                        *last_scope_counts = counts;
                        let mut markets: Vec<&String> = observed_markets.iter().collect();
                        markets.sort();
                        markets.truncate(SCOPE_CAP);
                        let mut leagues: Vec<&String> = observed_leagues.iter().collect();
                        leagues.sort();
                        leagues.truncate(SCOPE_CAP);
                        let mut books: Vec<&String> = observed_books.iter().collect();
                        books.sort();
                        books.truncate(SCOPE_CAP);
                        tracing::debug!(sport = %self.cfg.sport, markets = ?markets, leagues = ?leagues, sportsbooks = ?books, "observed_scope");
                    }
                }

                if let Some(allowed) = &self.cfg.allowed_markets {
                    arr.retain(|it| allowed_markets_predicate(it, allowed));
                }
                if arr.is_empty() {
                    return;
                }

                let mut seen_fixtures = HashSet::new();
                for it in &arr {
                    if let Some(fid) = fixture_id_of(it) {
                        let (h, a) = extract_home_away(it);
                        self.engine.merge_fixture_meta(&fid, h, a, extract_start_time(it), extract_league_name(it));
                        if seen_fixtures.insert(fid.clone()) {
                            self.ensure_fixture_meta(&fid).await;
                        }
                    }
                }

                let (evs, arbs) = self.engine.process_batch(&self.cfg.sport, &arr);

                let grouped = self.build_grouped_payload(&arr);
                if !grouped.is_empty() {
                    self.hub.broadcast(&Broadcast::Raw(grouped));
                }
                if !evs.is_empty() {
                    self.hub.broadcast(&Broadcast::Ev(evs));
                }
                for arb in arbs {
                    self.hub.broadcast(&Broadcast::Arbitrage(arb));
                }
            }
            "fixture-status" => {
                if let Some(Value::Array(arr)) = parsed.get("data") {
                    for it in arr {
                        if let Some(fid) = fixture_id_of(it) {
                            let (h, a) = extract_home_away(it);
                            self.engine.merge_fixture_meta(&fid, h, a, extract_start_time(it), extract_league_name(it));
                        }
                    }
                }
            }
            _ => {}
        }
    }

    /// Build the grouped-by-sportsbook raw payload for one batch of quotes,
    /// keyed by fixture within each book, annotated with the EV cache.
    fn build_grouped_payload(&self, arr: &[Value]) -> GroupedBooks {
        let mut grouped: GroupedBooks = GroupedBooks::new();

        for it in arr {
            let book = it.get("sportsbook").and_then(|v| v.as_str()).unwrap_or("").trim().to_string();
            let book = if book.is_empty() { "Unknown".to_string() } else { book };
            let fxid = fixture_id_of(it).unwrap_or_default();
            let market = it.get("market").or_else(|| it.get("market_name")).and_then(|v| v.as_str()).unwrap_or("").trim().to_string();
            let (mut home, mut away) = extract_home_away(it);
            if home.is_none() || away.is_none() {
                if let Some(meta) = self.engine.fixture_meta(&fxid) {
                    home = home.or(meta.home_team);
                    away = away.or(meta.away_team);
                }
            }

            let start_date = extract_start_time(it);
            let league_name = extract_league_name(it).unwrap_or_default();
            let price = it.get("price").and_then(|v| v.as_f64());
            let name = it.get("name").or_else(|| it.get("outcome")).and_then(|v| v.as_str()).map(|s| s.to_string());
            let deep_link = it
                .get("deep_link")
                .and_then(|dl| dl.as_object())
                .and_then(|dl| dl.get("desktop").or_else(|| dl.get("Desktop")))
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string();

            let market_lower = market.to_lowercase();
            let name_key = name.clone().unwrap_or_default();
            let ev_value = self.engine.ev_cached(&fxid, &book, &market_lower, &name_key);

            let odds = OddsEntry {
                id: format!("{}:{}:{}:{}", fxid, book.to_lowercase(), market_lower, name_key.to_lowercase().replace(' ', "_")),
                market: market_lower,
                sports_book_name: book.to_lowercase(),
                deep_link,
                ev_value,
                name,
                price,
                has_been_posted: false,
                is_live: it.get("is_live").and_then(|v| v.as_bool()).unwrap_or(false),
            };

            let entry = grouped.entry(book).or_insert_with(|| BookEntry { data: Vec::new() });
            if let Some(game) = entry.data.iter_mut().find(|g| g.id == fxid) {
                if game.home_team.is_empty() {
                    game.home_team = home.clone().unwrap_or_default();
                }
                if game.away_team.is_empty() {
                    game.away_team = away.clone().unwrap_or_default();
                }
                if game.start_date.is_none() {
                    game.start_date = start_date;
                }
                if game.league.is_empty() {
                    game.league = league_name.clone();
                }
                game.odds.push(odds);
            } else {
                entry.data.push(GameEntry {
                    id: fxid,
                    home_team: home.unwrap_or_default(),
                    away_team: away.unwrap_or_default(),
                    sport: sport_display(&self.cfg.sport),
                    league: league_name,
                    start_date,
                    odds: vec![odds],
                });
            }
        }

        grouped
    }
}

fn urlencoding_component(s: &str) -> String {
    url::form_urlencoded::byte_serialize(s.as_bytes()).collect()
}

/// Minimal SSE frame parser: an `event:`/`data:` line pair terminated by a
/// blank line, tolerating any ordering and a bare `data:`-only frame
/// (implicit `message` event).
fn parse_sse_event(raw: &str) -> Option<(String, String)> {
    let mut event_name = String::from("message");
    let mut data_lines = Vec::new();
    for line in raw.lines() {
        if let Some(rest) = line.strip_prefix("event:") {
            event_name = rest.trim().to_string();
        } else if let Some(rest) = line.strip_prefix("data:") {
            data_lines.push(rest.trim().to_string());
        }
    }
    if data_lines.is_empty() {
        None
    } else {
        Some((event_name, data_lines.join("\n")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn chunk_list_splits_evenly_with_remainder() {
        let items: Vec<String> = (0..7).map(|i| i.to_string()).collect();
        let chunks = chunk_list(&items, 3);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[2].len(), 1);
    }

    #[test]
    fn split_chunks_halves_multi_item_chunks() {
        let chunks = vec![vec!["a".to_string(), "b".to_string(), "c".to_string(), "d".to_string()]];
        let split = split_chunks(&chunks);
        assert_eq!(split.len(), 2);
        assert_eq!(split[0].len(), 2);
    }

    #[test]
    fn split_chunks_leaves_single_item_chunks_alone() {
        let chunks = vec![vec!["a".to_string()]];
        assert_eq!(split_chunks(&chunks), chunks);
    }

    #[test]
    fn allowed_markets_predicate_substring_match() {
        let mut allowed = HashSet::new();
        allowed.insert("1st quarter".to_string());
        let item = json!({"market": "First Quarter Moneyline"});
        assert!(!allowed_markets_predicate(&item, &allowed));
        let item2 = json!({"market": "1st Quarter Moneyline"});
        assert!(allowed_markets_predicate(&item2, &allowed));
    }

    #[test]
    fn allowed_markets_predicate_whole_word_match() {
        let mut allowed = HashSet::new();
        allowed.insert("total points".to_string());
        let item = json!({"market": "Team Total Points"});
        assert!(allowed_markets_predicate(&item, &allowed));
    }

    #[test]
    fn allowed_markets_predicate_checks_segment_field() {
        let mut allowed = HashSet::new();
        allowed.insert("1st half".to_string());
        let item = json!({"segment": "1st Half"});
        assert!(allowed_markets_predicate(&item, &allowed));
    }

    #[test]
    fn parse_sse_event_extracts_event_and_data() {
        let raw = "event: odds\ndata: {\"a\":1}\n\n";
        let (ev, data) = parse_sse_event(raw).unwrap();
        assert_eq!(ev, "odds");
        assert_eq!(data, r#"{"a":1}"#);
    }

    #[test]
    fn parse_sse_event_defaults_to_message() {
        let raw = "data: hello\n\n";
        let (ev, data) = parse_sse_event(raw).unwrap();
        assert_eq!(ev, "message");
        assert_eq!(data, "hello");
    }
}
