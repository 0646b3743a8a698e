use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::math::{NamedOrientation, Position, RobotJoints};
use crate::scene::Parameter;

/// Virtual source node of the project logic graph.
pub const LOGIC_START: &str = "START";
/// Virtual sink node of the project logic graph.
pub const LOGIC_END: &str = "END";

/// Parameter `type` marking a reference to another action's flow output.
pub const PARAM_KIND_LINK: &str = "link";
/// Parameter `type` marking a reference to a project-level parameter.
pub const PARAM_KIND_PROJECT_PARAMETER: &str = "projectParameter";
/// Parameter `type` marking a reference to an action point.
pub const PARAM_KIND_ACTION_POINT: &str = "actionPoint";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Actions
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A single parameter of an action invocation.
///
/// `value` is a JSON-encoded literal, or — when `param_type` is one of
/// the reference kinds above — a JSON-encoded reference string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionParameter {
    pub name: String,
    #[serde(rename = "type")]
    pub param_type: String,
    pub value: String,
}

impl ActionParameter {
    pub fn is_reference(&self) -> bool {
        matches!(
            self.param_type.as_str(),
            PARAM_KIND_LINK | PARAM_KIND_PROJECT_PARAMETER | PARAM_KIND_ACTION_POINT
        )
    }

    /// Decode the JSON-encoded string payload of a reference parameter.
    pub fn reference_target(&self) -> Result<String> {
        serde_json::from_str::<String>(&self.value).map_err(|_| {
            Error::Validation(format!(
                "Parameter '{}' does not hold a valid reference.",
                self.name
            ))
        })
    }
}

/// Declared outputs of one action invocation, usable as later inputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flow {
    #[serde(rename = "type", default = "default_flow_type")]
    pub flow_type: String,
    #[serde(default)]
    pub outputs: Vec<String>,
}

fn default_flow_type() -> String {
    "default".into()
}

impl Default for Flow {
    fn default() -> Self {
        Self {
            flow_type: default_flow_type(),
            outputs: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Action {
    pub id: String,
    pub name: String,
    /// Encoded as `object_id/method`.
    #[serde(rename = "type")]
    pub action_type: String,
    #[serde(default)]
    pub parameters: Vec<ActionParameter>,
    #[serde(default)]
    pub flows: Vec<Flow>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Action {
    /// Split `type` into the owning object id and the method name.
    pub fn parse_type(&self) -> Result<(&str, &str)> {
        self.action_type.split_once('/').ok_or_else(|| {
            Error::Validation(format!(
                "Action type '{}' is not of the form object/method.",
                self.action_type
            ))
        })
    }

    /// Flow producing the given output name, if any.
    pub fn flow_with_output(&self, output: &str) -> Option<&Flow> {
        self.flows.iter().find(|f| f.outputs.iter().any(|o| o == output))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Action points
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionPoint {
    pub id: String,
    pub name: String,
    pub position: Position,
    /// Scene object the point is attached to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(default)]
    pub orientations: Vec<NamedOrientation>,
    #[serde(default)]
    pub robot_joints: Vec<RobotJoints>,
    #[serde(default)]
    pub actions: Vec<Action>,
}

impl ActionPoint {
    pub fn new(name: &str, position: Position, parent: Option<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_owned(),
            position,
            parent,
            orientations: Vec::new(),
            robot_joints: Vec::new(),
            actions: Vec::new(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Logic
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Condition on a logic edge: follow the edge when the referenced flow
/// output equals `value` (a JSON-encoded literal).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogicCondition {
    /// `action_id/flow/output_index` reference into a producing action.
    pub what: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogicItem {
    pub id: String,
    pub start: String,
    pub end: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<LogicCondition>,
}

impl LogicItem {
    pub fn new(start: &str, end: &str, condition: Option<LogicCondition>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            start: start.to_owned(),
            end: end.to_owned(),
            condition,
        }
    }
}

/// A project-level parameter, overridable per execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectParameter {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub param_type: String,
    pub value: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Project
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub scene_id: String,
    #[serde(default)]
    pub has_logic: bool,
    #[serde(default)]
    pub action_points: Vec<ActionPoint>,
    #[serde(default)]
    pub parameters: Vec<ProjectParameter>,
    /// object id → replaced settings parameters.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub overrides: HashMap<String, Vec<Parameter>>,
    #[serde(default)]
    pub logic: Vec<LogicItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified: Option<DateTime<Utc>>,
    /// Dirty mark of an open editing session; never persisted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub int_modified: Option<DateTime<Utc>>,
}

impl Project {
    pub fn new(scene_id: &str, name: &str, description: &str, has_logic: bool) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_owned(),
            description: description.to_owned(),
            scene_id: scene_id.to_owned(),
            has_logic,
            action_points: Vec::new(),
            parameters: Vec::new(),
            overrides: HashMap::new(),
            logic: Vec::new(),
            created: None,
            modified: None,
            int_modified: None,
        }
    }

    // ── lookups ──────────────────────────────────────────────────────

    pub fn action_point(&self, id: &str) -> Result<&ActionPoint> {
        self.action_points
            .iter()
            .find(|ap| ap.id == id)
            .ok_or_else(|| Error::NotFound(format!("Action point {id}")))
    }

    pub fn action_point_mut(&mut self, id: &str) -> Result<&mut ActionPoint> {
        self.action_points
            .iter_mut()
            .find(|ap| ap.id == id)
            .ok_or_else(|| Error::NotFound(format!("Action point {id}")))
    }

    pub fn action(&self, id: &str) -> Result<&Action> {
        self.action_points
            .iter()
            .flat_map(|ap| ap.actions.iter())
            .find(|a| a.id == id)
            .ok_or_else(|| Error::NotFound(format!("Action {id}")))
    }

    pub fn action_mut(&mut self, id: &str) -> Result<&mut Action> {
        self.action_points
            .iter_mut()
            .flat_map(|ap| ap.actions.iter_mut())
            .find(|a| a.id == id)
            .ok_or_else(|| Error::NotFound(format!("Action {id}")))
    }

    /// The action point owning the given action.
    pub fn action_point_of_action(&self, action_id: &str) -> Result<&ActionPoint> {
        self.action_points
            .iter()
            .find(|ap| ap.actions.iter().any(|a| a.id == action_id))
            .ok_or_else(|| Error::NotFound(format!("Action {action_id}")))
    }

    pub fn parameter(&self, id: &str) -> Result<&ProjectParameter> {
        self.parameters
            .iter()
            .find(|p| p.id == id)
            .ok_or_else(|| Error::NotFound(format!("Project parameter {id}")))
    }

    pub fn logic_item(&self, id: &str) -> Result<&LogicItem> {
        self.logic
            .iter()
            .find(|l| l.id == id)
            .ok_or_else(|| Error::NotFound(format!("Logic item {id}")))
    }

    /// Settings parameters this project replaces on the given object.
    pub fn overrides_for(&self, object_id: &str) -> &[Parameter] {
        self.overrides
            .get(object_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// The override of one settings parameter, if any.
    pub fn override_of(&self, object_id: &str, name: &str) -> Option<&Parameter> {
        self.overrides_for(object_id).iter().find(|p| p.name == name)
    }

    // ── name uniqueness ──────────────────────────────────────────────

    pub fn contains_action_point_name(&self, name: &str) -> bool {
        self.action_points.iter().any(|ap| ap.name == name)
    }

    pub fn contains_action_name(&self, name: &str) -> bool {
        self.action_points
            .iter()
            .flat_map(|ap| ap.actions.iter())
            .any(|a| a.name == name)
    }

    pub fn contains_parameter_name(&self, name: &str) -> bool {
        self.parameters.iter().any(|p| p.name == name)
    }

    /// Strip session-only state before handing the project to the catalog.
    pub fn for_persist(&self) -> Project {
        let mut copy = self.clone();
        copy.int_modified = None;
        copy
    }

    // ── logic validation ─────────────────────────────────────────────

    /// Full logic validation: the per-edit invariants plus a present
    /// START edge and END reachability. Required before a save; partial
    /// graphs under construction use [`Self::validate_logic_partial`].
    pub fn validate_logic(&self) -> Result<()> {
        if self.logic.is_empty() {
            return Ok(());
        }
        self.validate_logic_partial()?;
        self.validate_reachability()
    }

    /// Per-edit invariants: known endpoints, no duplicate edges,
    /// well-formed branching, acyclicity. A graph mid-construction may
    /// not reach END yet.
    pub fn validate_logic_partial(&self) -> Result<()> {
        if self.logic.is_empty() {
            return Ok(());
        }

        let action_ids: HashSet<&str> = self
            .action_points
            .iter()
            .flat_map(|ap| ap.actions.iter())
            .map(|a| a.id.as_str())
            .collect();

        let mut seen_edges: HashSet<(&str, &str)> = HashSet::new();
        for item in &self.logic {
            if item.start != LOGIC_START && !action_ids.contains(item.start.as_str()) {
                return Err(Error::Validation(format!(
                    "Logic references unknown action {}.",
                    item.start
                )));
            }
            if item.end != LOGIC_END && !action_ids.contains(item.end.as_str()) {
                return Err(Error::Validation(format!(
                    "Logic references unknown action {}.",
                    item.end
                )));
            }
            if item.start == LOGIC_END || item.end == LOGIC_START {
                return Err(Error::Validation(
                    "Edges may only leave START and enter END.".to_owned(),
                ));
            }
            if !seen_edges.insert((item.start.as_str(), item.end.as_str())) {
                return Err(Error::Validation(format!(
                    "Duplicate logic edge {} -> {}.",
                    item.start, item.end
                )));
            }
        }

        self.validate_branching()?;
        self.validate_acyclic()
    }

    /// Edges leaving one action are either a single unconditional edge, or
    /// all conditional on the same flow output with pairwise distinct values.
    fn validate_branching(&self) -> Result<()> {
        let mut by_start: HashMap<&str, Vec<&LogicItem>> = HashMap::new();
        for item in &self.logic {
            by_start.entry(item.start.as_str()).or_default().push(item);
        }

        for (start, edges) in by_start {
            if edges.len() == 1 {
                continue;
            }
            let mut values = HashSet::new();
            let mut subjects = HashSet::new();
            for edge in &edges {
                let cond = edge.condition.as_ref().ok_or_else(|| {
                    Error::Validation(format!(
                        "Multiple edges from {start} require conditions on all of them."
                    ))
                })?;
                subjects.insert(cond.what.as_str());
                if !values.insert(cond.value.as_str()) {
                    return Err(Error::Validation(format!(
                        "Conditional edges from {start} test the same value twice."
                    )));
                }
            }
            if subjects.len() > 1 {
                return Err(Error::Validation(format!(
                    "Conditional edges from {start} must test the same output."
                )));
            }
        }
        Ok(())
    }

    fn successors(&self) -> HashMap<&str, Vec<&str>> {
        let mut succ: HashMap<&str, Vec<&str>> = HashMap::new();
        for item in &self.logic {
            succ.entry(item.start.as_str())
                .or_default()
                .push(item.end.as_str());
        }
        succ
    }

    /// Kahn's algorithm over the edge endpoints detects cycles.
    fn validate_acyclic(&self) -> Result<()> {
        let succ = self.successors();
        let mut indegree: HashMap<&str, usize> = HashMap::new();
        for item in &self.logic {
            *indegree.entry(item.end.as_str()).or_default() += 1;
            indegree.entry(item.start.as_str()).or_default();
        }

        let mut queue: VecDeque<&str> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(n, _)| *n)
            .collect();
        let mut visited = 0usize;
        let total = indegree.len();
        while let Some(node) = queue.pop_front() {
            visited += 1;
            for next in succ.get(node).map(|v| v.as_slice()).unwrap_or_default() {
                let d = indegree.get_mut(next).unwrap();
                *d -= 1;
                if *d == 0 {
                    queue.push_back(next);
                }
            }
        }
        if visited != total {
            return Err(Error::Validation("Project logic contains a cycle.".to_owned()));
        }
        Ok(())
    }

    /// A complete graph starts at START and reaches END.
    fn validate_reachability(&self) -> Result<()> {
        let succ = self.successors();
        if !succ.contains_key(LOGIC_START) {
            return Err(Error::Validation("Logic has no START edge.".to_owned()));
        }

        let mut seen = HashSet::new();
        let mut stack = vec![LOGIC_START];
        while let Some(node) = stack.pop() {
            if !seen.insert(node) {
                continue;
            }
            for next in succ.get(node).map(|v| v.as_slice()).unwrap_or_default() {
                stack.push(next);
            }
        }
        if !seen.contains(LOGIC_END) {
            return Err(Error::Validation(
                "END is not reachable from START.".to_owned(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn project_with_actions(ids: &[&str]) -> Project {
        let mut project = Project::new("scene-1", "proj", "", true);
        let mut ap = ActionPoint::new("ap1", Position::default(), None);
        for id in ids {
            ap.actions.push(Action {
                id: (*id).to_owned(),
                name: format!("act_{id}"),
                action_type: "obj/method".to_owned(),
                parameters: Vec::new(),
                flows: vec![Flow::default()],
                description: None,
            });
        }
        project.action_points.push(ap);
        project
    }

    #[test]
    fn linear_logic_accepted() {
        let mut p = project_with_actions(&["a", "b"]);
        p.logic = vec![
            LogicItem::new(LOGIC_START, "a", None),
            LogicItem::new("a", "b", None),
            LogicItem::new("b", LOGIC_END, None),
        ];
        p.validate_logic().unwrap();
    }

    #[test]
    fn duplicate_edge_rejected() {
        let mut p = project_with_actions(&["a"]);
        p.logic = vec![
            LogicItem::new(LOGIC_START, "a", None),
            LogicItem::new("a", LOGIC_END, None),
            LogicItem::new("a", LOGIC_END, None),
        ];
        assert!(p.validate_logic().is_err());
    }

    #[test]
    fn cycle_rejected() {
        let mut p = project_with_actions(&["a", "b"]);
        p.logic = vec![
            LogicItem::new(LOGIC_START, "a", None),
            LogicItem::new("a", "b", None),
            LogicItem::new("b", "a", None),
            LogicItem::new("b", LOGIC_END, None),
        ];
        assert!(p.validate_logic().is_err());
    }

    #[test]
    fn unreachable_end_rejected() {
        let mut p = project_with_actions(&["a", "b"]);
        p.logic = vec![
            LogicItem::new(LOGIC_START, "a", None),
            LogicItem::new("b", LOGIC_END, None),
        ];
        assert!(p.validate_logic().is_err());
    }

    #[test]
    fn branching_requires_distinct_values_of_one_output() {
        let cond = |v: &str| {
            Some(LogicCondition {
                what: "a/default/0".to_owned(),
                value: v.to_owned(),
            })
        };
        let mut p = project_with_actions(&["a", "b", "c"]);
        p.logic = vec![
            LogicItem::new(LOGIC_START, "a", None),
            LogicItem::new("a", "b", cond("true")),
            LogicItem::new("a", "c", cond("false")),
            LogicItem::new("b", LOGIC_END, None),
            LogicItem::new("c", LOGIC_END, None),
        ];
        p.validate_logic().unwrap();

        // Same value twice on the same branch point.
        p.logic[2].condition = cond("true");
        assert!(p.validate_logic().is_err());

        // Mixed conditional and unconditional.
        p.logic[2].condition = None;
        assert!(p.validate_logic().is_err());
    }

    #[test]
    fn unknown_endpoint_rejected() {
        let mut p = project_with_actions(&["a"]);
        p.logic = vec![LogicItem::new(LOGIC_START, "ghost", None)];
        assert!(p.validate_logic().is_err());
    }

    #[test]
    fn overrides_lookup() {
        let mut p = project_with_actions(&[]);
        p.overrides.insert(
            "obj1".to_owned(),
            vec![Parameter {
                name: "speed".to_owned(),
                param_type: "double".to_owned(),
                value: "1.5".to_owned(),
            }],
        );
        assert_eq!(p.overrides_for("obj1").len(), 1);
        assert!(p.override_of("obj1", "speed").is_some());
        assert!(p.override_of("obj1", "ghost").is_none());
        assert!(p.overrides_for("other").is_empty());
    }

    #[test]
    fn reference_parameter_roundtrip() {
        let param = ActionParameter {
            name: "speed".to_owned(),
            param_type: PARAM_KIND_PROJECT_PARAMETER.to_owned(),
            value: serde_json::to_string("param-id-1").unwrap(),
        };
        assert!(param.is_reference());
        assert_eq!(param.reference_target().unwrap(), "param-id-1");
    }
}
