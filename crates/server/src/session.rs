//! The single open editing session.
//!
//! At most one scene (and optionally one project over it) is open per
//! server process. The session value is owned by the server state and
//! only touched synchronously; mutations commit before any event is
//! queued, so a cancelled task never leaves a half-applied edit.

use chrono::Utc;

use arcor_domain::project::Project;
use arcor_domain::scene::Scene;
use arcor_domain::{Error, Result};

use crate::locks::Topology;

#[derive(Default)]
pub struct Session {
    pub scene: Option<Scene>,
    pub project: Option<Project>,
}

impl Session {
    pub fn is_open(&self) -> bool {
        self.scene.is_some() || self.project.is_some()
    }

    pub fn scene(&self) -> Result<&Scene> {
        self.scene
            .as_ref()
            .ok_or_else(|| Error::State("Scene not opened.".to_owned()))
    }

    pub fn scene_mut(&mut self) -> Result<&mut Scene> {
        self.scene
            .as_mut()
            .ok_or_else(|| Error::State("Scene not opened.".to_owned()))
    }

    pub fn project(&self) -> Result<&Project> {
        self.project
            .as_ref()
            .ok_or_else(|| Error::State("Project not opened.".to_owned()))
    }

    pub fn project_mut(&mut self) -> Result<&mut Project> {
        self.project
            .as_mut()
            .ok_or_else(|| Error::State("Project not opened.".to_owned()))
    }

    pub fn mark_scene_modified(&mut self) {
        if let Some(ref mut scene) = self.scene {
            scene.int_modified = Some(Utc::now());
        }
    }

    pub fn mark_project_modified(&mut self) {
        if let Some(ref mut project) = self.project {
            project.int_modified = Some(Utc::now());
        }
    }

    /// Parent/child snapshot of every entity in the open session, used
    /// by the lock table. Roots: the scene id (objects hang beneath it,
    /// the project beneath the scene) and the project id (action points
    /// without a scene-object parent, parameters, logic items).
    pub fn topology(&self) -> Topology {
        let mut pairs: Vec<(String, String)> = Vec::new();

        if let Some(ref scene) = self.scene {
            for object in &scene.objects {
                let parent = object.parent.clone().unwrap_or_else(|| scene.id.clone());
                pairs.push((object.id.clone(), parent));
            }
            if let Some(ref project) = self.project {
                pairs.push((project.id.clone(), scene.id.clone()));
            }
        }

        if let Some(ref project) = self.project {
            for ap in &project.action_points {
                let parent = ap.parent.clone().unwrap_or_else(|| project.id.clone());
                pairs.push((ap.id.clone(), parent));
                for action in &ap.actions {
                    pairs.push((action.id.clone(), ap.id.clone()));
                }
            }
            for parameter in &project.parameters {
                pairs.push((parameter.id.clone(), project.id.clone()));
            }
            for item in &project.logic {
                pairs.push((item.id.clone(), project.id.clone()));
            }
        }

        Topology::from_pairs(pairs)
    }

    /// Is the given id a known entity of the open session?
    pub fn knows(&self, id: &str) -> bool {
        if let Some(ref scene) = self.scene {
            if scene.id == id {
                return true;
            }
        }
        if let Some(ref project) = self.project {
            if project.id == id {
                return true;
            }
        }
        self.topology().contains(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arcor_domain::math::{Pose, Position};
    use arcor_domain::project::ActionPoint;
    use arcor_domain::scene::SceneObject;

    #[test]
    fn topology_roots_objects_at_the_scene() {
        let mut session = Session::default();
        let mut scene = Scene::new("s", "");
        scene
            .add_object(SceneObject {
                id: "obj1".into(),
                name: "box".into(),
                object_type: "Box".into(),
                pose: Pose::default(),
                parent: None,
                parameters: Vec::new(),
            })
            .unwrap();
        let scene_id = scene.id.clone();
        let mut project = Project::new(&scene_id, "p", "", true);
        project
            .action_points
            .push(ActionPoint::new("ap1", Position::default(), Some("obj1".into())));
        session.scene = Some(scene);
        session.project = Some(project);

        let topo = session.topology();
        let ap_id = session.project.as_ref().unwrap().action_points[0].id.clone();
        let ancestors: Vec<&str> = topo.ancestors(&ap_id).collect();
        assert_eq!(ancestors, vec!["obj1", scene_id.as_str()]);
    }

    #[test]
    fn dirty_marks() {
        let mut session = Session::default();
        session.scene = Some(Scene::new("s", ""));
        assert!(session.scene().unwrap().int_modified.is_none());
        session.mark_scene_modified();
        assert!(session.scene().unwrap().int_modified.is_some());
    }
}
