use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Content of a package's `package.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageMeta {
    pub name: String,
    pub built: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executed: Option<DateTime<Utc>>,
}

/// Listing entry served by the execution manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageSummary {
    pub id: String,
    pub project_id: String,
    /// Last modification of the project embedded in the package.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified: Option<DateTime<Utc>>,
    pub package_meta: PackageMeta,
}
