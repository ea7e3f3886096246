use std::collections::HashMap;
use std::fs;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::UserRecordStore;

#[derive(Debug, thiserror::Error)]
pub enum RecordsError {
    /// The backing store could not be reached.
    #[error("record store unavailable: {0}")]
    Unavailable(String),

    /// The stored payload could not be decoded.
    #[error("record decode failed: {0}")]
    Decode(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub name: Option<String>,
    pub headline: Option<String>,
    pub target_role: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationRecord {
    pub company: String,
    pub role: String,
    pub status: String,
    pub applied_at: DateTime<Utc>,
}

/// Raw records about one user, as handed to the context builder.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRecords {
    #[serde(default)]
    pub profile: Option<UserProfile>,
    #[serde(default)]
    pub applications: Vec<ApplicationRecord>,
}

/// Read-only store backed by a JSON map of user id → records.
#[derive(Clone, Debug, Default)]
pub struct InMemoryRecordStore {
    users: Arc<HashMap<String, UserRecords>>,
}

impl InMemoryRecordStore {
    pub fn new(users: HashMap<String, UserRecords>) -> Self {
        Self {
            users: Arc::new(users),
        }
    }

    pub fn from_json(json: &str) -> Result<Self, RecordsError> {
        let users: HashMap<String, UserRecords> =
            serde_json::from_str(json).map_err(|e| RecordsError::Decode(e.to_string()))?;
        Ok(Self::new(users))
    }

    pub fn from_file(path: &str) -> Result<Self, RecordsError> {
        let content = fs::read_to_string(path).map_err(|e| RecordsError::Unavailable(format!("{path}: {e}")))?;
        Self::from_json(&content)
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

#[async_trait::async_trait]
impl UserRecordStore for InMemoryRecordStore {
    async fn fetch(&self, user_id: &str) -> Result<UserRecords, RecordsError> {
        Ok(self.users.get(user_id).cloned().unwrap_or_default())
    }
}
