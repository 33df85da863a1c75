use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One line of the shared knowledge log. Never updated in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeEntry {
    pub text: String,
    pub category: String,
    pub reviewer_id: String,
    pub developer_id: String,
    pub timestamp: DateTime<Utc>,
}

impl KnowledgeEntry {
    pub fn new(text: &str, category: &str, reviewer_id: &str, developer_id: &str) -> Self {
        Self {
            text: text.to_string(),
            category: category.to_string(),
            reviewer_id: reviewer_id.to_string(),
            developer_id: developer_id.to_string(),
            timestamp: Utc::now(),
        }
    }
}
