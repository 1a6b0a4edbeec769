//! Wire payload shapes shared between the SSE worker (C5), the state engine
//! (C4) and the fan-out hub (C7) — grounded on the grouped-odds tree built in
//! `calculations/sse.py` and re-shaped in `server/transform.py`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OddsEntry {
    pub id: String,
    pub market: String,
    pub sports_book_name: String,
    pub deep_link: String,
    pub ev_value: Option<f64>,
    pub name: Option<String>,
    pub price: Option<f64>,
    pub has_been_posted: bool,
    pub is_live: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameEntry {
    pub id: String,
    pub home_team: String,
    pub away_team: String,
    pub sport: String,
    pub league: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_date: Option<i64>,
    pub odds: Vec<OddsEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BookEntry {
    pub data: Vec<GameEntry>,
}

pub type GroupedBooks = HashMap<String, BookEntry>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ev_value_serializes_as_null_when_absent() {
        let entry = OddsEntry {
            id: "x".into(),
            market: "moneyline".into(),
            sports_book_name: "bookA".into(),
            deep_link: "".into(),
            ev_value: None,
            name: Some("Team".into()),
            price: Some(1.5),
            has_been_posted: false,
            is_live: false,
        };
        let v = serde_json::to_value(&entry).unwrap();
        assert_eq!(v.get("ev_value"), Some(&serde_json::Value::Null));
    }
}
