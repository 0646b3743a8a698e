//! Project lifecycle, action points, actions, logic and parameters.

use serde::Deserialize;
use serde_json::{json, Value};

use arcor_domain::identifier;
use arcor_domain::math::Position;
use arcor_domain::project::{
    Action, ActionParameter, ActionPoint, Flow, LogicCondition, LogicItem, Project,
    ProjectParameter, PARAM_KIND_ACTION_POINT, PARAM_KIND_LINK, PARAM_KIND_PROJECT_PARAMETER,
};
use arcor_domain::scene::{Parameter, Scene};
use arcor_domain::{Error, Result};
use arcor_protocol::{events, ChangeType, EventFrame};

use arcor_catalog::PublishOutcome;

use super::Ctx;
use crate::state::AppState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Lifecycle
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn list(ctx: &Ctx<'_>) -> Result<Value> {
    let projects = ctx.state.projects.listing().await?;
    Ok(json!({ "projects": projects }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NewProjectArgs {
    name: String,
    #[serde(default)]
    scene_id: Option<String>,
    #[serde(default)]
    description: String,
    #[serde(default = "default_true")]
    has_logic: bool,
}

fn default_true() -> bool {
    true
}

pub async fn new_project(ctx: &Ctx<'_>, args: Value) -> Result<Value> {
    let args: NewProjectArgs = super::parse_args(&args)?;
    if args.name.trim().is_empty() {
        return Err(Error::Validation(
            "Project name must not be empty.".to_owned(),
        ));
    }
    {
        let session = ctx.state.session.read();
        if session.project.is_some() {
            return Err(Error::State("Another project is open.".to_owned()));
        }
        let scene = session.scene()?;
        if let Some(ref wanted) = args.scene_id {
            if *wanted != scene.id {
                return Err(Error::State("A different scene is open.".to_owned()));
            }
        }
    }
    let listing = ctx.state.projects.listing().await?;
    if listing.iter().any(|d| d.name == args.name) {
        return Err(Error::Validation(format!(
            "Project name '{}' already exists.",
            args.name
        )));
    }
    if ctx.dry_run {
        return Ok(Value::Null);
    }

    let (project, scene) = {
        let mut session = ctx.state.session.write();
        if session.project.is_some() {
            return Err(Error::State("Another project is open.".to_owned()));
        }
        let scene = session.scene()?.clone();
        let mut project = Project::new(&scene.id, &args.name, &args.description, args.has_logic);
        project.int_modified = Some(chrono::Utc::now());
        session.project = Some(project.clone());
        (project, scene)
    };
    ctx.broadcast(EventFrame::new(
        events::OPEN_PROJECT,
        json!({ "project": project, "scene": scene }),
    ));
    Ok(json!({ "id": project.id }))
}

#[derive(Debug, Deserialize)]
struct IdArgs {
    id: String,
}

pub async fn open(ctx: &Ctx<'_>, args: Value) -> Result<Value> {
    let args: IdArgs = super::parse_args(&args)?;
    if ctx.state.session.read().is_open() {
        return Err(Error::State("Another scene or project is open.".to_owned()));
    }
    let project = ctx.state.projects.get(&args.id).await?;
    // The invariant: a project's scene id must resolve.
    let scene = ctx.state.scenes.get(&project.scene_id).await?;
    if ctx.dry_run {
        return Ok(Value::Null);
    }
    {
        let mut session = ctx.state.session.write();
        if session.is_open() {
            return Err(Error::State("Another scene or project is open.".to_owned()));
        }
        session.scene = Some(scene.clone());
        session.project = Some(project.clone());
    }
    ctx.broadcast(EventFrame::new(
        events::OPEN_PROJECT,
        json!({ "project": project, "scene": scene }),
    ));
    super::scene::upsert_collisions(ctx, &scene).await;
    Ok(Value::Null)
}

pub async fn save(ctx: &Ctx<'_>) -> Result<Value> {
    let (project, scene, scene_dirty) = {
        let session = ctx.state.session.read();
        let project = session.project()?.clone();
        let scene = session.scene()?.clone();
        let scene_dirty = scene.int_modified.is_some();
        (project, scene, scene_dirty)
    };
    // Full validation before anything persists.
    validate_project(ctx.state, &scene, &project)?;
    if ctx.dry_run {
        return Ok(Value::Null);
    }

    // An unsaved scene persists together with its project, keeping the
    // scene-id invariant intact in the catalog.
    if scene_dirty {
        let modified = ctx.state.scenes.put(scene.for_persist()).await?;
        let mut session = ctx.state.session.write();
        if let Some(ref mut open) = session.scene {
            open.modified = Some(modified);
            open.int_modified = None;
        }
    }

    let modified = ctx.state.projects.put(project.for_persist()).await?;
    {
        let mut session = ctx.state.session.write();
        if let Some(ref mut open) = session.project {
            open.modified = Some(modified);
            open.int_modified = None;
        }
    }
    ctx.broadcast(EventFrame::new(events::PROJECT_SAVED, Value::Null));
    Ok(Value::Null)
}

#[derive(Debug, Deserialize, Default)]
struct CloseArgs {
    #[serde(default)]
    force: bool,
}

pub async fn close(ctx: &Ctx<'_>, args: Value) -> Result<Value> {
    let args: CloseArgs = super::parse_args(&args)?;
    let (project_id, scene) = {
        let session = ctx.state.session.read();
        let project = session.project()?;
        if project.int_modified.is_some() && !args.force {
            return Err(Error::State("Project has unsaved changes.".to_owned()));
        }
        (project.id.clone(), session.scene()?.clone())
    };
    if ctx.dry_run {
        return Ok(Value::Null);
    }
    {
        let mut session = ctx.state.session.write();
        session.project = None;
        session.scene = None;
    }
    ctx.state.locks.clear();
    ctx.broadcast(EventFrame::new(
        events::CLOSE_PROJECT,
        json!({ "id": project_id }),
    ));
    ctx.broadcast(EventFrame::new(
        events::CLOSE_SCENE,
        json!({ "id": scene.id }),
    ));
    super::scene::delete_collisions(ctx, &scene).await;
    Ok(Value::Null)
}

pub async fn delete(ctx: &Ctx<'_>, args: Value) -> Result<Value> {
    let args: IdArgs = super::parse_args(&args)?;
    {
        let session = ctx.state.session.read();
        if session.project.as_ref().map(|p| p.id.as_str()) == Some(args.id.as_str()) {
            return Err(Error::State("Close the project first.".to_owned()));
        }
    }
    let project = ctx.state.projects.get(&args.id).await?;
    if ctx.dry_run {
        return Ok(Value::Null);
    }
    ctx.state.projects.delete(&args.id).await?;
    ctx.broadcast(EventFrame::with_change(
        events::PROJECT_CHANGED,
        serde_json::to_value(&project)?,
        ChangeType::Remove,
    ));
    Ok(Value::Null)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RenameArgs {
    id: String,
    new_name: String,
}

pub async fn rename(ctx: &Ctx<'_>, args: Value) -> Result<Value> {
    let args: RenameArgs = super::parse_args(&args)?;
    if args.new_name.trim().is_empty() {
        return Err(Error::Validation(
            "Project name must not be empty.".to_owned(),
        ));
    }
    {
        let session = ctx.state.session.read();
        if session.project.as_ref().map(|p| p.id.as_str()) == Some(args.id.as_str()) {
            return Err(Error::State("Close the project first.".to_owned()));
        }
    }
    let listing = ctx.state.projects.listing().await?;
    if listing.iter().any(|d| d.name == args.new_name && d.id != args.id) {
        return Err(Error::Validation(format!(
            "Project name '{}' already exists.",
            args.new_name
        )));
    }
    let mut project = ctx.state.projects.get(&args.id).await?;
    if ctx.dry_run {
        return Ok(Value::Null);
    }
    project.name = args.new_name;
    let modified = ctx.state.projects.put(project.for_persist()).await?;
    project.modified = Some(modified);
    ctx.broadcast(EventFrame::with_change(
        events::PROJECT_CHANGED,
        serde_json::to_value(&project)?,
        ChangeType::Update,
    ));
    Ok(Value::Null)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Action points
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
struct AddActionPointArgs {
    name: String,
    #[serde(default)]
    position: Position,
    #[serde(default)]
    parent: Option<String>,
}

pub async fn add_action_point(ctx: &Ctx<'_>, args: Value) -> Result<Value> {
    let args: AddActionPointArgs = super::parse_args(&args)?;
    identifier::ensure_valid_name("action point", &args.name)?;
    let (payload, ap_id, parent) = {
        let mut session = ctx.state.session.write();
        let topology = session.topology();
        if let Some(ref parent) = args.parent {
            session.scene()?.object(parent)?;
            ctx.ensure_writeable(&topology, &[parent])?;
        }
        let project = session.project_mut()?;
        if project.contains_action_point_name(&args.name) {
            return Err(Error::Validation(format!(
                "Action point name '{}' already used.",
                args.name
            )));
        }
        if ctx.dry_run {
            return Ok(Value::Null);
        }
        let ap = ActionPoint::new(&args.name, args.position, args.parent.clone());
        let payload = serde_json::to_value(&ap)?;
        let ap_id = ap.id.clone();
        project.action_points.push(ap);
        session.mark_project_modified();
        (payload, ap_id, args.parent)
    };
    let mut frame = EventFrame::with_change(events::ACTION_POINT_CHANGED, payload, ChangeType::Add);
    if let Some(ref parent) = parent {
        frame = frame.parent(parent);
    }
    ctx.broadcast(frame);
    Ok(json!({ "id": ap_id }))
}

pub async fn remove_action_point(ctx: &Ctx<'_>, args: Value) -> Result<Value> {
    let args: IdArgs = super::parse_args(&args)?;
    let payload = {
        let mut session = ctx.state.session.write();
        let topology = session.topology();
        ctx.ensure_writeable(&topology, &[&args.id])?;
        let project = session.project_mut()?;
        let ap = project.action_point(&args.id)?;
        // Actions under the point must be unreferenced.
        let action_ids: Vec<String> = ap.actions.iter().map(|a| a.id.clone()).collect();
        for action_id in &action_ids {
            ensure_action_unreferenced(project, action_id)?;
        }
        if ctx.dry_run {
            return Ok(Value::Null);
        }
        let idx = project
            .action_points
            .iter()
            .position(|ap| ap.id == args.id)
            .expect("looked up above");
        let removed = project.action_points.remove(idx);
        session.mark_project_modified();
        serde_json::to_value(&removed)?
    };
    ctx.broadcast(EventFrame::with_change(
        events::ACTION_POINT_CHANGED,
        payload,
        ChangeType::Remove,
    ));
    Ok(Value::Null)
}

pub async fn rename_action_point(ctx: &Ctx<'_>, args: Value) -> Result<Value> {
    let args: RenameArgs = super::parse_args(&args)?;
    identifier::ensure_valid_name("action point", &args.new_name)?;
    let payload = {
        let mut session = ctx.state.session.write();
        let topology = session.topology();
        ctx.ensure_writeable(&topology, &[&args.id])?;
        let project = session.project_mut()?;
        project.action_point(&args.id)?;
        if project.contains_action_point_name(&args.new_name) {
            return Err(Error::Validation(format!(
                "Action point name '{}' already used.",
                args.new_name
            )));
        }
        if ctx.dry_run {
            return Ok(Value::Null);
        }
        let ap = project.action_point_mut(&args.id)?;
        ap.name = args.new_name;
        let payload = serde_json::to_value(&*ap)?;
        session.mark_project_modified();
        payload
    };
    ctx.broadcast(EventFrame::with_change(
        events::ACTION_POINT_CHANGED,
        payload,
        ChangeType::Update,
    ));
    Ok(Value::Null)
}

#[derive(Debug, Deserialize)]
struct UpdateApPositionArgs {
    id: String,
    position: Position,
}

pub async fn update_action_point_position(ctx: &Ctx<'_>, args: Value) -> Result<Value> {
    let args: UpdateApPositionArgs = super::parse_args(&args)?;
    let payload = {
        let mut session = ctx.state.session.write();
        let topology = session.topology();
        ctx.ensure_writeable(&topology, &[&args.id])?;
        let project = session.project_mut()?;
        project.action_point(&args.id)?;
        if ctx.dry_run {
            return Ok(Value::Null);
        }
        let ap = project.action_point_mut(&args.id)?;
        ap.position = args.position;
        let payload = serde_json::to_value(&*ap)?;
        session.mark_project_modified();
        payload
    };
    ctx.broadcast(EventFrame::with_change(
        events::ACTION_POINT_CHANGED,
        payload,
        ChangeType::Update,
    ));
    Ok(Value::Null)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Actions
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AddActionArgs {
    action_point_id: String,
    name: String,
    #[serde(rename = "type")]
    action_type: String,
    #[serde(default)]
    parameters: Vec<ActionParameter>,
    #[serde(default)]
    flows: Vec<Flow>,
}

pub async fn add_action(ctx: &Ctx<'_>, args: Value) -> Result<Value> {
    let args: AddActionArgs = super::parse_args(&args)?;
    identifier::ensure_valid_name("action", &args.name)?;

    let (payload, action_id, parent) = {
        let mut session = ctx.state.session.write();
        let topology = session.topology();
        ctx.ensure_writeable(&topology, &[&args.action_point_id])?;

        let scene = session.scene()?.clone();
        let project = session.project_mut()?;
        project.action_point(&args.action_point_id)?;
        if project.contains_action_name(&args.name) {
            return Err(Error::Validation(format!(
                "Action name '{}' already used.",
                args.name
            )));
        }

        let action = Action {
            id: uuid::Uuid::new_v4().to_string(),
            name: args.name,
            action_type: args.action_type,
            parameters: args.parameters,
            flows: if args.flows.is_empty() {
                vec![Flow::default()]
            } else {
                args.flows
            },
            description: None,
        };
        validate_action(ctx.state, &scene, project, &action)?;
        if ctx.dry_run {
            return Ok(Value::Null);
        }

        let payload = serde_json::to_value(&action)?;
        let action_id = action.id.clone();
        project
            .action_point_mut(&args.action_point_id)?
            .actions
            .push(action);
        session.mark_project_modified();
        (payload, action_id, args.action_point_id)
    };
    ctx.broadcast(
        EventFrame::with_change(events::ACTION_CHANGED, payload, ChangeType::Add).parent(&parent),
    );
    Ok(json!({ "id": action_id }))
}

#[derive(Debug, Deserialize)]
struct UpdateActionArgs {
    id: String,
    #[serde(default)]
    parameters: Option<Vec<ActionParameter>>,
    #[serde(default)]
    flows: Option<Vec<Flow>>,
}

pub async fn update_action(ctx: &Ctx<'_>, args: Value) -> Result<Value> {
    let args: UpdateActionArgs = super::parse_args(&args)?;
    let payload = {
        let mut session = ctx.state.session.write();
        let topology = session.topology();
        ctx.ensure_writeable(&topology, &[&args.id])?;

        let scene = session.scene()?.clone();
        let project = session.project_mut()?;
        let mut updated = project.action(&args.id)?.clone();
        if let Some(parameters) = args.parameters {
            updated.parameters = parameters;
        }
        if let Some(flows) = args.flows {
            updated.flows = flows;
        }
        validate_action(ctx.state, &scene, project, &updated)?;
        if ctx.dry_run {
            return Ok(Value::Null);
        }
        let slot = project.action_mut(&args.id)?;
        *slot = updated;
        let payload = serde_json::to_value(&*slot)?;
        session.mark_project_modified();
        payload
    };
    ctx.broadcast(EventFrame::with_change(
        events::ACTION_CHANGED,
        payload,
        ChangeType::Update,
    ));
    Ok(Value::Null)
}

pub async fn remove_action(ctx: &Ctx<'_>, args: Value) -> Result<Value> {
    let args: IdArgs = super::parse_args(&args)?;
    let payload = {
        let mut session = ctx.state.session.write();
        let topology = session.topology();
        ctx.ensure_writeable(&topology, &[&args.id])?;
        let project = session.project_mut()?;
        project.action(&args.id)?;
        ensure_action_unreferenced(project, &args.id)?;
        if ctx.dry_run {
            return Ok(Value::Null);
        }
        let mut removed = None;
        for ap in &mut project.action_points {
            if let Some(idx) = ap.actions.iter().position(|a| a.id == args.id) {
                removed = Some(ap.actions.remove(idx));
                break;
            }
        }
        session.mark_project_modified();
        serde_json::to_value(removed.expect("looked up above"))?
    };
    ctx.broadcast(EventFrame::with_change(
        events::ACTION_CHANGED,
        payload,
        ChangeType::Remove,
    ));
    Ok(Value::Null)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Logic
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
struct AddLogicArgs {
    start: String,
    end: String,
    #[serde(default)]
    condition: Option<LogicCondition>,
}

pub async fn add_logic_item(ctx: &Ctx<'_>, args: Value) -> Result<Value> {
    let args: AddLogicArgs = super::parse_args(&args)?;
    let (payload, item_id) = {
        let mut session = ctx.state.session.write();
        let topology = session.topology();
        let project_id = session.project()?.id.clone();
        ctx.ensure_writeable(&topology, &[&project_id])?;
        let project = session.project_mut()?;
        if !project.has_logic {
            return Err(Error::State(
                "Project does not use explicit logic.".to_owned(),
            ));
        }
        let item = LogicItem::new(&args.start, &args.end, args.condition.clone());
        // Validate on a scratch copy so a bad edge never lands.
        let mut candidate = project.clone();
        candidate.logic.push(item.clone());
        candidate.validate_logic_partial()?;
        if ctx.dry_run {
            return Ok(Value::Null);
        }
        let payload = serde_json::to_value(&item)?;
        let item_id = item.id.clone();
        project.logic.push(item);
        session.mark_project_modified();
        (payload, item_id)
    };
    ctx.broadcast(EventFrame::with_change(
        events::LOGIC_ITEM_CHANGED,
        payload,
        ChangeType::Add,
    ));
    Ok(json!({ "id": item_id }))
}

#[derive(Debug, Deserialize)]
struct UpdateLogicArgs {
    id: String,
    start: String,
    end: String,
    #[serde(default)]
    condition: Option<LogicCondition>,
}

pub async fn update_logic_item(ctx: &Ctx<'_>, args: Value) -> Result<Value> {
    let args: UpdateLogicArgs = super::parse_args(&args)?;
    let payload = {
        let mut session = ctx.state.session.write();
        let topology = session.topology();
        let project_id = session.project()?.id.clone();
        ctx.ensure_writeable(&topology, &[&project_id])?;
        let project = session.project_mut()?;
        project.logic_item(&args.id)?;

        let mut candidate = project.clone();
        let slot = candidate
            .logic
            .iter_mut()
            .find(|l| l.id == args.id)
            .expect("looked up above");
        slot.start = args.start.clone();
        slot.end = args.end.clone();
        slot.condition = args.condition.clone();
        candidate.validate_logic_partial()?;
        if ctx.dry_run {
            return Ok(Value::Null);
        }

        let slot = project
            .logic
            .iter_mut()
            .find(|l| l.id == args.id)
            .expect("looked up above");
        slot.start = args.start;
        slot.end = args.end;
        slot.condition = args.condition;
        let payload = serde_json::to_value(&*slot)?;
        session.mark_project_modified();
        payload
    };
    ctx.broadcast(EventFrame::with_change(
        events::LOGIC_ITEM_CHANGED,
        payload,
        ChangeType::Update,
    ));
    Ok(Value::Null)
}

pub async fn remove_logic_item(ctx: &Ctx<'_>, args: Value) -> Result<Value> {
    let args: IdArgs = super::parse_args(&args)?;
    let payload = {
        let mut session = ctx.state.session.write();
        let topology = session.topology();
        let project_id = session.project()?.id.clone();
        ctx.ensure_writeable(&topology, &[&project_id])?;
        let project = session.project_mut()?;
        project.logic_item(&args.id)?;
        if ctx.dry_run {
            return Ok(Value::Null);
        }
        let idx = project
            .logic
            .iter()
            .position(|l| l.id == args.id)
            .expect("looked up above");
        let removed = project.logic.remove(idx);
        session.mark_project_modified();
        serde_json::to_value(&removed)?
    };
    ctx.broadcast(EventFrame::with_change(
        events::LOGIC_ITEM_CHANGED,
        payload,
        ChangeType::Remove,
    ));
    Ok(Value::Null)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Project parameters
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
struct AddParameterArgs {
    name: String,
    #[serde(rename = "type")]
    param_type: String,
    value: String,
}

pub async fn add_parameter(ctx: &Ctx<'_>, args: Value) -> Result<Value> {
    let args: AddParameterArgs = super::parse_args(&args)?;
    identifier::ensure_valid_name("parameter", &args.name)?;
    ensure_json_literal(&args.value)?;
    let (payload, param_id) = {
        let mut session = ctx.state.session.write();
        let topology = session.topology();
        let project_id = session.project()?.id.clone();
        ctx.ensure_writeable(&topology, &[&project_id])?;
        let project = session.project_mut()?;
        if project.contains_parameter_name(&args.name) {
            return Err(Error::Validation(format!(
                "Parameter name '{}' already used.",
                args.name
            )));
        }
        if ctx.dry_run {
            return Ok(Value::Null);
        }
        let parameter = ProjectParameter {
            id: uuid::Uuid::new_v4().to_string(),
            name: args.name,
            param_type: args.param_type,
            value: args.value,
        };
        let payload = serde_json::to_value(&parameter)?;
        let param_id = parameter.id.clone();
        project.parameters.push(parameter);
        session.mark_project_modified();
        (payload, param_id)
    };
    ctx.broadcast(EventFrame::with_change(
        events::PROJECT_PARAMETER_CHANGED,
        payload,
        ChangeType::Add,
    ));
    Ok(json!({ "id": param_id }))
}

#[derive(Debug, Deserialize)]
struct UpdateParameterArgs {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    value: Option<String>,
}

pub async fn update_parameter(ctx: &Ctx<'_>, args: Value) -> Result<Value> {
    let args: UpdateParameterArgs = super::parse_args(&args)?;
    if let Some(ref name) = args.name {
        identifier::ensure_valid_name("parameter", name)?;
    }
    if let Some(ref value) = args.value {
        ensure_json_literal(value)?;
    }
    let payload = {
        let mut session = ctx.state.session.write();
        let topology = session.topology();
        let project_id = session.project()?.id.clone();
        ctx.ensure_writeable(&topology, &[&project_id])?;
        let project = session.project_mut()?;
        project.parameter(&args.id)?;
        if let Some(ref name) = args.name {
            if project
                .parameters
                .iter()
                .any(|p| p.name == *name && p.id != args.id)
            {
                return Err(Error::Validation(format!(
                    "Parameter name '{name}' already used."
                )));
            }
        }
        if ctx.dry_run {
            return Ok(Value::Null);
        }
        let parameter = project
            .parameters
            .iter_mut()
            .find(|p| p.id == args.id)
            .expect("looked up above");
        if let Some(name) = args.name {
            parameter.name = name;
        }
        if let Some(value) = args.value {
            parameter.value = value;
        }
        let payload = serde_json::to_value(&*parameter)?;
        session.mark_project_modified();
        payload
    };
    ctx.broadcast(EventFrame::with_change(
        events::PROJECT_PARAMETER_CHANGED,
        payload,
        ChangeType::Update,
    ));
    Ok(Value::Null)
}

pub async fn remove_parameter(ctx: &Ctx<'_>, args: Value) -> Result<Value> {
    let args: IdArgs = super::parse_args(&args)?;
    let payload = {
        let mut session = ctx.state.session.write();
        let topology = session.topology();
        let project_id = session.project()?.id.clone();
        ctx.ensure_writeable(&topology, &[&project_id])?;
        let project = session.project_mut()?;
        let parameter = project.parameter(&args.id)?.clone();

        // Actions referencing the parameter by name block the removal.
        let referenced = project
            .action_points
            .iter()
            .flat_map(|ap| &ap.actions)
            .flat_map(|a| &a.parameters)
            .any(|p| {
                p.param_type == PARAM_KIND_PROJECT_PARAMETER
                    && p.reference_target().map(|t| t == parameter.name).unwrap_or(false)
            });
        if referenced {
            return Err(Error::State(format!(
                "Parameter '{}' is used by an action.",
                parameter.name
            )));
        }
        if ctx.dry_run {
            return Ok(Value::Null);
        }
        project.parameters.retain(|p| p.id != args.id);
        session.mark_project_modified();
        serde_json::to_value(&parameter)?
    };
    ctx.broadcast(EventFrame::with_change(
        events::PROJECT_PARAMETER_CHANGED,
        payload,
        ChangeType::Remove,
    ));
    Ok(Value::Null)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Settings overrides
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OverrideArgs {
    object_id: String,
    parameter: Parameter,
}

/// Shared validation: the object must live in the project's scene and
/// the parameter must match its type's settings schema.
fn check_override(ctx: &Ctx<'_>, scene: &Scene, args: &OverrideArgs) -> Result<()> {
    let object = scene.object(&args.object_id)?;
    let object_type = ctx.state.graph.get(&object.object_type)?;
    ensure_json_literal(&args.parameter.value)?;
    if !object_type.settings_compatible(&args.parameter) {
        return Err(Error::Validation(format!(
            "Parameter '{}' does not match the settings of {}.",
            args.parameter.name, object_type.id
        )));
    }
    Ok(())
}

pub async fn add_override(ctx: &Ctx<'_>, args: Value) -> Result<Value> {
    let args: OverrideArgs = super::parse_args(&args)?;
    let payload = {
        let mut session = ctx.state.session.write();
        let topology = session.topology();
        ctx.ensure_writeable(&topology, &[&args.object_id])?;
        let scene = session.scene()?.clone();
        check_override(ctx, &scene, &args)?;
        let project = session.project_mut()?;
        if project
            .override_of(&args.object_id, &args.parameter.name)
            .is_some()
        {
            return Err(Error::Validation(format!(
                "Parameter '{}' is already overridden.",
                args.parameter.name
            )));
        }
        if ctx.dry_run {
            return Ok(Value::Null);
        }
        let payload = serde_json::to_value(&args.parameter)?;
        project
            .overrides
            .entry(args.object_id.clone())
            .or_default()
            .push(args.parameter);
        session.mark_project_modified();
        payload
    };
    ctx.broadcast(
        EventFrame::with_change(events::OVERRIDE_UPDATED, payload, ChangeType::Add)
            .parent(&args.object_id),
    );
    Ok(Value::Null)
}

pub async fn update_override(ctx: &Ctx<'_>, args: Value) -> Result<Value> {
    let args: OverrideArgs = super::parse_args(&args)?;
    let payload = {
        let mut session = ctx.state.session.write();
        let topology = session.topology();
        ctx.ensure_writeable(&topology, &[&args.object_id])?;
        let scene = session.scene()?.clone();
        check_override(ctx, &scene, &args)?;
        let project = session.project_mut()?;
        if project
            .override_of(&args.object_id, &args.parameter.name)
            .is_none()
        {
            return Err(Error::NotFound(format!(
                "Override of '{}'",
                args.parameter.name
            )));
        }
        if ctx.dry_run {
            return Ok(Value::Null);
        }
        let slot = project
            .overrides
            .get_mut(&args.object_id)
            .and_then(|list| list.iter_mut().find(|p| p.name == args.parameter.name))
            .expect("checked above");
        *slot = args.parameter.clone();
        session.mark_project_modified();
        serde_json::to_value(&args.parameter)?
    };
    ctx.broadcast(
        EventFrame::with_change(events::OVERRIDE_UPDATED, payload, ChangeType::Update)
            .parent(&args.object_id),
    );
    Ok(Value::Null)
}

pub async fn delete_override(ctx: &Ctx<'_>, args: Value) -> Result<Value> {
    let args: OverrideArgs = super::parse_args(&args)?;
    let payload = {
        let mut session = ctx.state.session.write();
        let topology = session.topology();
        ctx.ensure_writeable(&topology, &[&args.object_id])?;
        let project = session.project_mut()?;
        let removed = project
            .override_of(&args.object_id, &args.parameter.name)
            .cloned()
            .ok_or_else(|| {
                Error::NotFound(format!("Override of '{}'", args.parameter.name))
            })?;
        if ctx.dry_run {
            return Ok(Value::Null);
        }
        let list = project
            .overrides
            .get_mut(&args.object_id)
            .expect("checked above");
        list.retain(|p| p.name != args.parameter.name);
        if list.is_empty() {
            project.overrides.remove(&args.object_id);
        }
        session.mark_project_modified();
        serde_json::to_value(&removed)?
    };
    ctx.broadcast(
        EventFrame::with_change(events::OVERRIDE_UPDATED, payload, ChangeType::Remove)
            .parent(&args.object_id),
    );
    Ok(Value::Null)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Build
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BuildArgs {
    project_id: String,
    package_name: String,
}

/// Fetch a built package zip and hand it to the execution manager.
pub async fn build(ctx: &Ctx<'_>, args: Value) -> Result<Value> {
    let args: BuildArgs = super::parse_args(&args)?;
    {
        let session = ctx.state.session.read();
        if let Some(ref project) = session.project {
            if project.id == args.project_id && project.int_modified.is_some() {
                return Err(Error::State("Save the project first.".to_owned()));
            }
        }
    }
    // The project must exist in the catalog.
    ctx.state.projects.get(&args.project_id).await?;

    let build = ctx.state.build.as_ref().ok_or_else(|| Error::Service {
        service: "build".to_owned(),
        message: "not configured".to_owned(),
    })?;
    let link = ctx.state.manager.as_ref().ok_or_else(|| Error::Service {
        service: "execution".to_owned(),
        message: "not configured".to_owned(),
    })?;
    if ctx.dry_run {
        return Ok(Value::Null);
    }

    let bytes = match build.publish(&args.project_id, &args.package_name).await? {
        PublishOutcome::Package(bytes) => bytes,
        PublishOutcome::NeedsRebuild(reason) => {
            tracing::warn!(project = %args.project_id, reason, "build refused to publish");
            return Err(Error::Validation(
                "Project cannot be built; fix it and retry.".to_owned(),
            ));
        }
    };

    use base64::Engine;
    let package_id = uuid::Uuid::new_v4().to_string();
    let upload = serde_json::json!({
        "id": package_id,
        "data": base64::engine::general_purpose::STANDARD.encode(&bytes),
    });
    let response = link.call("UploadPackage", upload, false).await?;
    if !response.result {
        return Err(Error::State(response.messages.join(" ")));
    }
    Ok(json!({ "packageId": package_id }))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn ensure_json_literal(value: &str) -> Result<()> {
    serde_json::from_str::<Value>(value)
        .map(|_| ())
        .map_err(|_| Error::Validation(format!("Value '{value}' is not valid JSON.")))
}

/// An action may only go away when neither logic nor links mention it.
fn ensure_action_unreferenced(project: &Project, action_id: &str) -> Result<()> {
    if project
        .logic
        .iter()
        .any(|l| l.start == action_id || l.end == action_id)
    {
        return Err(Error::State("Action is used by project logic.".to_owned()));
    }
    let linked = project
        .action_points
        .iter()
        .flat_map(|ap| &ap.actions)
        .filter(|a| a.id != action_id)
        .flat_map(|a| &a.parameters)
        .any(|p| {
            p.param_type == PARAM_KIND_LINK
                && p.reference_target()
                    .map(|t| t.split('/').next() == Some(action_id))
                    .unwrap_or(false)
        });
    if linked {
        return Err(Error::State(
            "Action output is used by another action.".to_owned(),
        ));
    }
    Ok(())
}

/// Validate an action against the scene, the object-type graph and the
/// project: the type must resolve to a live action of a scene object,
/// every declared parameter must be provided with a matching type or a
/// resolvable reference, and flow outputs must be fresh identifiers.
fn validate_action(
    state: &AppState,
    scene: &Scene,
    project: &Project,
    action: &Action,
) -> Result<()> {
    let (object_id, method) = action.parse_type()?;
    let object = scene.object(object_id).map_err(|_| {
        Error::Validation(format!("Action type references unknown object {object_id}."))
    })?;
    let meta = state.graph.usable_action(&object.object_type, method)?;

    // Declared parameters must match the manifest one to one.
    for declared in &meta.parameters {
        let provided = action
            .parameters
            .iter()
            .find(|p| p.name == declared.name)
            .ok_or_else(|| {
                Error::Validation(format!("Missing parameter '{}'.", declared.name))
            })?;
        validate_parameter(project, declared.param_type.as_str(), provided)?;
    }
    for provided in &action.parameters {
        if !meta.parameters.iter().any(|d| d.name == provided.name) {
            return Err(Error::Validation(format!(
                "Unknown parameter '{}'.",
                provided.name
            )));
        }
    }

    // Flow outputs become script variables: identifiers, globally unique.
    for flow in &action.flows {
        for output in &flow.outputs {
            identifier::ensure_valid_name("flow output", output)?;
            let clash = project
                .action_points
                .iter()
                .flat_map(|ap| &ap.actions)
                .filter(|a| a.id != action.id)
                .flat_map(|a| &a.flows)
                .any(|f| f.outputs.iter().any(|o| o == output));
            if clash {
                return Err(Error::Validation(format!(
                    "Flow output '{output}' already used."
                )));
            }
        }
    }
    Ok(())
}

fn validate_parameter(
    project: &Project,
    declared_type: &str,
    provided: &ActionParameter,
) -> Result<()> {
    match provided.param_type.as_str() {
        PARAM_KIND_LINK => {
            let target = provided.reference_target()?;
            let mut parts = target.split('/');
            let (action_id, _flow, index) = (
                parts.next().unwrap_or_default(),
                parts.next().unwrap_or("default"),
                parts.next().unwrap_or("0"),
            );
            let producer = project.action(action_id).map_err(|_| {
                Error::Validation(format!(
                    "Parameter '{}' links to unknown action {action_id}.",
                    provided.name
                ))
            })?;
            let index: usize = index.parse().map_err(|_| {
                Error::Validation(format!("Parameter '{}' has a bad link index.", provided.name))
            })?;
            let has_output = producer
                .flows
                .iter()
                .any(|f| f.outputs.len() > index);
            if !has_output {
                return Err(Error::Validation(format!(
                    "Parameter '{}' links to a missing output.",
                    provided.name
                )));
            }
            Ok(())
        }
        PARAM_KIND_PROJECT_PARAMETER => {
            let target = provided.reference_target()?;
            let parameter = project
                .parameters
                .iter()
                .find(|p| p.name == target)
                .ok_or_else(|| {
                    Error::Validation(format!(
                        "Parameter '{}' references unknown project parameter '{target}'.",
                        provided.name
                    ))
                })?;
            if parameter.param_type != declared_type {
                return Err(Error::Validation(format!(
                    "Project parameter '{target}' is {}, expected {declared_type}.",
                    parameter.param_type
                )));
            }
            Ok(())
        }
        PARAM_KIND_ACTION_POINT => {
            let target = provided.reference_target()?;
            project.action_point(&target).map_err(|_| {
                Error::Validation(format!(
                    "Parameter '{}' references unknown action point {target}.",
                    provided.name
                ))
            })?;
            Ok(())
        }
        plain if plain == declared_type => ensure_json_literal(&provided.value),
        other => Err(Error::Validation(format!(
            "Parameter '{}' is {other}, expected {declared_type}.",
            provided.name
        ))),
    }
}

/// Whole-project validation run before a save.
fn validate_project(state: &AppState, scene: &Scene, project: &Project) -> Result<()> {
    if project.scene_id != scene.id {
        return Err(Error::State("Project does not match the open scene.".to_owned()));
    }
    for (object_id, overrides) in &project.overrides {
        let object = scene.object(object_id).map_err(|_| {
            Error::Validation(format!("Override references unknown object {object_id}."))
        })?;
        let object_type = state.graph.get(&object.object_type)?;
        for parameter in overrides {
            if !object_type.settings_compatible(parameter) {
                return Err(Error::Validation(format!(
                    "Override '{}' does not match the settings of {}.",
                    parameter.name, object_type.id
                )));
            }
        }
    }
    for ap in &project.action_points {
        if let Some(ref parent) = ap.parent {
            scene.object(parent).map_err(|_| {
                Error::Validation(format!(
                    "Action point '{}' is attached to unknown object {parent}.",
                    ap.name
                ))
            })?;
        }
        for action in &ap.actions {
            validate_action(state, scene, project, action)?;
        }
    }
    if project.has_logic {
        project.validate_logic()?;
    }
    Ok(())
}
