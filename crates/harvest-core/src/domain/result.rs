use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::TaskId;

/// Output of a successful fetch, keyed by task id. Written at most once per id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub id: TaskId,
    pub target: String,
    pub payload: serde_json::Value,
    pub captured_at: DateTime<Utc>,
}
