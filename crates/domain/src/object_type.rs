use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::math::Pose;
use crate::scene::Parameter;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Collision models
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    Box,
    Cylinder,
    Sphere,
    Mesh,
}

/// Pointer to a collision model held by the catalog. Only meshes carry
/// payload the control plane looks into (the focus points used by
/// object aiming).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectModel {
    pub id: String,
    pub kind: ModelKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mesh: Option<Mesh>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mesh {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    /// Physical reference points used to align the model with reality.
    #[serde(default)]
    pub focus_points: Vec<Pose>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Action manifests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Typed metadata of one parameter of a settings schema or an action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParameterMeta {
    pub name: String,
    #[serde(rename = "type")]
    pub param_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<String>,
}

/// One entry of an object type's declarative action manifest.
///
/// Manifests are produced at build time from the type's source; the
/// control plane never introspects source code itself. `origins` names
/// the closest ancestor type that declared the action when it arrived
/// via inheritance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionMeta {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub parameters: Vec<ParameterMeta>,
    /// Types of the values the action's default flow produces.
    #[serde(default)]
    pub returns: Vec<String>,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub problem: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origins: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Object types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A class of physical or virtual device, as stored in the catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectType {
    pub id: String,
    /// Parent type id; empty for roots.
    #[serde(default)]
    pub base: String,
    #[serde(default)]
    pub description: String,
    /// Program source of the type; opaque to the control plane.
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub built_in: bool,
    /// Exists only to be derived from; never instantiated into a scene.
    #[serde(rename = "abstract", default)]
    pub is_abstract: bool,
    /// Instances occupy a pose in the scene. Propagated down the base
    /// chain when the graph resolves.
    #[serde(default)]
    pub has_pose: bool,
    /// Set when the type failed to import or its model fetch failed;
    /// disabled types stay listed so listings are deterministic.
    #[serde(default)]
    pub disabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub problem: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<ObjectModel>,
    #[serde(default)]
    pub settings: Vec<ParameterMeta>,
    /// Declarative action manifest (build-time generated).
    #[serde(default)]
    pub actions: Vec<ActionMeta>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified: Option<DateTime<Utc>>,
}

impl ObjectType {
    pub fn action(&self, name: &str) -> Option<&ActionMeta> {
        self.actions.iter().find(|a| a.name == name)
    }

    /// Does the type's settings schema declare the given parameter?
    pub fn setting(&self, name: &str) -> Option<&ParameterMeta> {
        self.settings.iter().find(|s| s.name == name)
    }

    /// Check an instance parameter against the settings schema.
    pub fn settings_compatible(&self, parameter: &Parameter) -> bool {
        self.setting(&parameter.name)
            .map(|meta| meta.param_type == parameter.param_type)
            .unwrap_or(false)
    }
}
