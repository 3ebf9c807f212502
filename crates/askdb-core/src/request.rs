use serde::{Deserialize, Serialize};
use thiserror::Error;

use askdb_guard::SchemaCatalog;
use askdb_types::Turn;

pub const MAX_CONTENT_CHARS: usize = 2000;

/// Body of one chat request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub content: String,
    #[serde(default)]
    pub preferred_table: Option<String>,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub role: String,
    pub content: String,
    #[serde(default)]
    pub is_error: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error("content must not be empty")]
    EmptyContent,
    #[error("content is {actual} characters long; the limit is {max}")]
    ContentTooLong { max: usize, actual: usize },
    #[error("preferredTable `{0}` is not a known table")]
    UnknownPreferredTable(String),
    #[error("history role `{0}` must be `user` or `assistant`")]
    InvalidHistoryRole(String),
}

impl RequestError {
    pub fn code(&self) -> &'static str {
        match self {
            RequestError::EmptyContent | RequestError::ContentTooLong { .. } => "INVALID_CONTENT",
            RequestError::UnknownPreferredTable(_) => "INVALID_PREFERRED_TABLE",
            RequestError::InvalidHistoryRole(_) => "INVALID_HISTORY",
        }
    }
}

/// A request that passed validation, with history already windowed.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedRequest {
    pub content: String,
    pub preferred_table: Option<String>,
    pub history: Vec<Turn>,
}

impl ValidatedRequest {
    /// History followed by the new user turn.
    pub fn turns(&self) -> Vec<Turn> {
        let mut turns = self.history.clone();
        turns.push(Turn::user(self.content.clone()));
        turns
    }
}

impl ChatRequest {
    pub fn validate(
        self,
        catalog: &SchemaCatalog,
        history_window: usize,
    ) -> Result<ValidatedRequest, RequestError> {
        let content = self.content.trim().to_string();
        if content.is_empty() {
            return Err(RequestError::EmptyContent);
        }
        let actual = content.chars().count();
        if actual > MAX_CONTENT_CHARS {
            return Err(RequestError::ContentTooLong {
                max: MAX_CONTENT_CHARS,
                actual,
            });
        }

        let preferred_table = match self.preferred_table {
            Some(table) if !table.trim().is_empty() => {
                let table = table.trim();
                let Some(known) = catalog
                    .table_names()
                    .into_iter()
                    .find(|name| name.eq_ignore_ascii_case(table))
                else {
                    return Err(RequestError::UnknownPreferredTable(table.to_string()));
                };
                Some(known.to_string())
            }
            _ => None,
        };

        let mut history = Vec::new();
        for entry in self.history {
            if entry.is_error || entry.content.trim().is_empty() {
                continue;
            }
            match entry.role.as_str() {
                "user" => history.push(Turn::user(entry.content)),
                "assistant" => history.push(Turn::assistant(entry.content)),
                other => return Err(RequestError::InvalidHistoryRole(other.to_string())),
            }
        }
        let skip = history.len().saturating_sub(history_window);
        let history = history.into_iter().skip(skip).collect();

        Ok(ValidatedRequest {
            content,
            preferred_table,
            history,
        })
    }
}
