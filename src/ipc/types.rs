use std::collections::HashMap;
use std::path::PathBuf;

use rusqlite::Connection;
use serde::Deserialize;

use crate::checkpoint::CheckpointStore;
use crate::notify::ChangeLog;
use crate::session::QuizSession;

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
    pub checkpoints: Option<Box<dyn CheckpointStore>>,
    pub sessions: HashMap<String, QuizSession>,
    pub changes: ChangeLog,
}

impl AppState {
    pub fn new() -> Self {
        Self {
            workspace: None,
            db: None,
            checkpoints: None,
            sessions: HashMap::new(),
            changes: ChangeLog::default(),
        }
    }
}
