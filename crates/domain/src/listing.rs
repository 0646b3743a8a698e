use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The listing projection every catalog collection serves: enough to
/// render a picker and to decide whether a cached full entity is stale.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdDesc {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified: Option<DateTime<Utc>>,
    #[serde(default)]
    pub description: String,
}
