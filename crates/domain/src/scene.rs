use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::math::Pose;

/// A typed key/value parameter as stored on entities.
///
/// `value` is always a JSON-encoded literal; the declared `type` is
/// checked against the owning object type's settings schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    #[serde(rename = "type")]
    pub param_type: String,
    pub value: String,
}

/// One object instance placed in a scene.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SceneObject {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub object_type: String,
    pub pose: Pose,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<Parameter>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scene {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub objects: Vec<SceneObject>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified: Option<DateTime<Utc>>,
    /// Dirty mark of an open editing session; never persisted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub int_modified: Option<DateTime<Utc>>,
}

impl Scene {
    pub fn new(name: &str, description: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_owned(),
            description: description.to_owned(),
            objects: Vec::new(),
            created: None,
            modified: None,
            int_modified: None,
        }
    }

    pub fn object(&self, id: &str) -> Result<&SceneObject> {
        self.objects
            .iter()
            .find(|o| o.id == id)
            .ok_or_else(|| Error::NotFound(format!("Scene object {id}")))
    }

    pub fn object_mut(&mut self, id: &str) -> Result<&mut SceneObject> {
        self.objects
            .iter_mut()
            .find(|o| o.id == id)
            .ok_or_else(|| Error::NotFound(format!("Scene object {id}")))
    }

    pub fn contains_object_name(&self, name: &str) -> bool {
        self.objects.iter().any(|o| o.name == name)
    }

    /// Add an object, enforcing per-scene name uniqueness.
    pub fn add_object(&mut self, object: SceneObject) -> Result<()> {
        if self.contains_object_name(&object.name) {
            return Err(Error::Validation(format!(
                "Object name '{}' already used in the scene.",
                object.name
            )));
        }
        self.objects.push(object);
        Ok(())
    }

    pub fn remove_object(&mut self, id: &str) -> Result<SceneObject> {
        let idx = self
            .objects
            .iter()
            .position(|o| o.id == id)
            .ok_or_else(|| Error::NotFound(format!("Scene object {id}")))?;
        Ok(self.objects.remove(idx))
    }

    /// Ids of objects whose `parent` is the given object.
    pub fn children_of(&self, id: &str) -> Vec<&SceneObject> {
        self.objects
            .iter()
            .filter(|o| o.parent.as_deref() == Some(id))
            .collect()
    }

    /// Strip session-only state before handing the scene to the catalog.
    pub fn for_persist(&self) -> Scene {
        let mut copy = self.clone();
        copy.int_modified = None;
        copy
    }
}
