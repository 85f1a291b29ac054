use std::path::PathBuf;

use rusqlite::Connection;
use serde::Deserialize;

use crate::sync::JsonCache;

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
    /// Constructed once per process and handed to every handler; never the
    /// system of record.
    pub cache: JsonCache,
}

impl AppState {
    pub fn new() -> Self {
        AppState {
            workspace: None,
            db: None,
            cache: JsonCache::new(),
        }
    }
}
