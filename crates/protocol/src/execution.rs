use serde::{Deserialize, Serialize};

use arcor_domain::package::PackageSummary;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Run states
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Lifecycle state of the (at most one) running execution package.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum PackageState {
    #[default]
    Undefined,
    Starting,
    Running,
    Paused,
    Stopping,
    Stopped,
}

impl PackageState {
    /// A new run may begin only when nothing is in flight.
    pub fn can_run(self) -> bool {
        matches!(self, PackageState::Undefined | PackageState::Stopped)
    }

    pub fn can_pause(self) -> bool {
        self == PackageState::Running
    }

    pub fn can_resume(self) -> bool {
        self == PackageState::Paused
    }

    pub fn can_stop(self) -> bool {
        matches!(
            self,
            PackageState::Starting | PackageState::Running | PackageState::Paused
        )
    }

    /// The uniform refusal message for an illegal transition.
    pub fn refuse(self, op: &str) -> String {
        format!("Cannot {op} in state {self:?}.")
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Shared execution RPC surface
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Discriminators the server proxies verbatim to the execution manager.
pub const EXECUTION_RPCS: &[&str] = &[
    "RunPackage",
    "StopPackage",
    "PausePackage",
    "ResumePackage",
    "PackageState",
    "ListPackages",
    "UploadPackage",
    "DeletePackage",
    "PackageInfo",
];

pub fn is_execution_rpc(request: &str) -> bool {
    EXECUTION_RPCS.contains(&request)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunPackageArgs {
    pub id: String,
    /// Action-point ids the script should pause at. A breakpoint the run
    /// never reaches produces no event; that is a legal outcome.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub breakpoints: Vec<String>,
    /// Pause before the first action.
    #[serde(rename = "startPaused", default, skip_serializing_if = "std::ops::Not::not")]
    pub start_paused: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageIdArgs {
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadPackageArgs {
    pub id: String,
    /// Base64-encoded zip archive.
    pub data: String,
}

/// Payload of the `PackageState` event and the `PackageState` RPC reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageStateData {
    pub state: PackageState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package_id: Option<String>,
    /// Breakpoint acknowledged by the script when it paused there.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_point_id: Option<String>,
}

impl PackageStateData {
    pub fn bare(state: PackageState) -> Self {
        Self {
            state,
            package_id: None,
            action_point_id: None,
        }
    }
}

/// `ListPackages` reply payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageListData {
    pub packages: Vec<PackageSummary>,
}
