use std::collections::HashSet;

fn env_bool(name: &str, default: bool) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(default)
}

fn env_u16(name: &str, default: u16) -> u16 {
    std::env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_usize(name: &str, default: usize) -> usize {
    std::env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_f64(name: &str, default: f64) -> f64 {
    std::env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_str(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

/// Max SSE workers to spawn; `None` means unlimited (MAX_WORKERS < 0).
fn env_max_workers() -> Option<usize> {
    let raw = env_str("MAX_WORKERS", "8");
    match raw.trim().parse::<i64>() {
        Ok(n) if n < 0 => None,
        Ok(n) => Some(n as usize),
        Err(_) => Some(8),
    }
}

/// `ARB_MARKETS=all` (or empty) means unrestricted.
fn env_allowed_markets() -> Option<HashSet<String>> {
    let raw = env_str("ARB_MARKETS", "all").trim().to_lowercase();
    if raw.is_empty() || raw == "all" || raw == "*" {
        return None;
    }
    Some(raw.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
}

fn env_sport_allowlist() -> HashSet<String> {
    let raw = std::env::var("SPORTS_ALLOWLIST").or_else(|_| std::env::var("SPORTS")).unwrap_or_default();
    raw.split(',').map(|s| s.trim().to_lowercase()).filter(|s| !s.is_empty()).collect()
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub default_odds_format: String,
    pub default_ev_threshold: f64,
    pub default_arb_threshold: f64,
    pub ws_debug: bool,
    pub ingest_filters_enabled: bool,
    pub include_fixture_updates: bool,
    pub max_workers: Option<usize>,
    pub sportsbook_chunk_size: usize,
    pub league_chunk_size: usize,
    pub sportsbook_chunk_size_soccer: usize,
    pub league_chunk_size_soccer: usize,
    pub allowed_markets: Option<HashSet<String>>,
    pub sports_allowlist: HashSet<String>,
    pub opticodds_api_key: Option<String>,
    pub trace_enabled: bool,
    pub trace_file: String,
}

impl Config {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        Self {
            port: env_u16("PORT", 8000),
            default_odds_format: env_str("ODDS_FORMAT", "decimal"),
            default_ev_threshold: env_f64("EV_THRESHOLD_PERCENT", 3.0),
            default_arb_threshold: env_f64("ARB_THRESHOLD_PERCENT", 3.0),
            ws_debug: env_bool("WS_DEBUG", false),
            ingest_filters_enabled: env_bool("INGEST_FILTERS", false),
            include_fixture_updates: env_bool("INCLUDE_FIXTURE_UPDATES", true),
            max_workers: env_max_workers(),
            sportsbook_chunk_size: env_usize("SPORTSBOOK_CHUNK_SIZE", 10),
            league_chunk_size: env_usize("LEAGUE_CHUNK_SIZE", 5),
            sportsbook_chunk_size_soccer: env_usize("SPORTSBOOK_CHUNK_SIZE_SOCCER", 6),
            league_chunk_size_soccer: env_usize("LEAGUE_CHUNK_SIZE_SOCCER", 3),
            allowed_markets: env_allowed_markets(),
            sports_allowlist: env_sport_allowlist(),
            opticodds_api_key: std::env::var("OPTICODDS_API_KEY").ok().filter(|s| !s.is_empty()),
            trace_enabled: env_bool("TRACE", false),
            trace_file: env_str("TRACE_FILE", "trace.log"),
        }
    }

    /// (sportsbook_chunk_size, league_chunk_size) tuned per sport; soccer gets smaller chunks.
    pub fn chunk_sizes_for(&self, sport: &str) -> (usize, usize) {
        if sport.eq_ignore_ascii_case("soccer") {
            (self.sportsbook_chunk_size_soccer, self.league_chunk_size_soccer)
        } else {
            (self.sportsbook_chunk_size, self.league_chunk_size)
        }
    }
}
